//! Mutations accumulated by group analysis.
//!
//! Analysis workers record concurrently into per-key synchronized maps.
//! The apply phases read them afterwards, one authority at a time.

use std::collections::BTreeSet;

use dashmap::DashMap;
use xavyo_directory::AuthorityKind;

/// Groups to create and membership edges to add or remove, keyed by child.
#[derive(Debug, Default)]
pub struct MutationSet {
    groups_to_create: DashMap<String, String>,
    group_parents_to_add: DashMap<String, BTreeSet<String>>,
    group_parents_to_remove: DashMap<String, BTreeSet<String>>,
    user_parents_to_add: DashMap<String, BTreeSet<String>>,
    user_parents_to_remove: DashMap<String, BTreeSet<String>>,
}

fn keys(map: &DashMap<String, BTreeSet<String>>) -> BTreeSet<String> {
    map.iter().map(|entry| entry.key().clone()).collect()
}

fn parents_of(map: &DashMap<String, BTreeSet<String>>, child: &str) -> BTreeSet<String> {
    map.get(child).map(|e| e.value().clone()).unwrap_or_default()
}

impl MutationSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule creation of the group `name`.
    pub fn record_group_creation(&self, name: &str, display_name: &str) {
        self.groups_to_create
            .entry(name.to_string())
            .or_insert_with(|| display_name.to_string());
    }

    fn parents_to_add(&self, child: &str) -> &DashMap<String, BTreeSet<String>> {
        match AuthorityKind::of(child) {
            AuthorityKind::Group => &self.group_parents_to_add,
            AuthorityKind::User => &self.user_parents_to_add,
        }
    }

    fn parents_to_remove(&self, child: &str) -> &DashMap<String, BTreeSet<String>> {
        match AuthorityKind::of(child) {
            AuthorityKind::Group => &self.group_parents_to_remove,
            AuthorityKind::User => &self.user_parents_to_remove,
        }
    }

    /// Schedule `child` to be added to `parent`.
    pub fn record_parent_addition(&self, child: &str, parent: &str) {
        self.parents_to_add(child)
            .entry(child.to_string())
            .or_default()
            .insert(parent.to_string());
    }

    /// Schedule `child` to be removed from `parent`.
    pub fn record_parent_removal(&self, child: &str, parent: &str) {
        self.parents_to_remove(child)
            .entry(child.to_string())
            .or_default()
            .insert(parent.to_string());
    }

    /// Display name of a group scheduled for creation.
    pub fn group_to_create(&self, name: &str) -> Option<String> {
        self.groups_to_create.get(name).map(|e| e.value().clone())
    }

    pub fn groups_to_create(&self) -> BTreeSet<String> {
        self.groups_to_create
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Groups to create or to remove from parents.
    pub fn group_creation_and_removal_work(&self) -> Vec<String> {
        let mut work = self.groups_to_create();
        work.extend(keys(&self.group_parents_to_remove));
        work.into_iter().collect()
    }

    /// Child groups with parents to add.
    pub fn group_addition_work(&self) -> Vec<String> {
        keys(&self.group_parents_to_add).into_iter().collect()
    }

    /// Users with parents to add or remove.
    pub fn user_association_work(&self) -> Vec<String> {
        let mut work = keys(&self.user_parents_to_add);
        work.extend(keys(&self.user_parents_to_remove));
        work.into_iter().collect()
    }

    pub fn parents_to_add_for(&self, child: &str) -> BTreeSet<String> {
        parents_of(self.parents_to_add(child), child)
    }

    pub fn parents_to_remove_for(&self, child: &str) -> BTreeSet<String> {
        parents_of(self.parents_to_remove(child), child)
    }

    /// All groups gaining a child group.
    pub fn group_parents(&self) -> BTreeSet<String> {
        self.group_parents_to_add
            .iter()
            .flat_map(|entry| entry.value().clone())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.groups_to_create.is_empty()
            && self.group_parents_to_add.is_empty()
            && self.group_parents_to_remove.is_empty()
            && self.user_parents_to_add.is_empty()
            && self.user_parents_to_remove.is_empty()
    }
}
