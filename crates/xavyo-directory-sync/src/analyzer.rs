//! Group analysis.
//!
//! Compares each directory group against the identity store and records
//! the groups to create and the membership edges to add or remove. Zone
//! changes and recreations decided by precedence are applied right away in
//! the analysis transaction; everything else is deferred to the apply
//! phases.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};
use xavyo_directory::{props, short_name, AuthorityKind, DirectoryEntry, GROUP_PREFIX};

use crate::batch::BatchWorker;
use crate::containment::ContainmentCache;
use crate::context::SyncContext;
use crate::error::SyncResult;
use crate::mutation::MutationSet;
use crate::provenance::{apply_zone_change, ProvenanceDecision, SourceScope};
use crate::store::StoreTransaction;

/// Authority name of a group entry.
pub fn group_name(entry: &DirectoryEntry) -> String {
    entry
        .property(props::AUTHORITY_NAME)
        .and_then(|v| v.as_str())
        .map_or_else(|| format!("{GROUP_PREFIX}{}", entry.id()), str::to_string)
}

/// Display name of a group entry, falling back to its short name.
pub fn group_display_name(entry: &DirectoryEntry, name: &str) -> String {
    entry
        .property(props::AUTHORITY_DISPLAY_NAME)
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| short_name(name))
        .to_string()
}

/// Tracks the newest modification time of processed entries.
#[derive(Debug, Default)]
pub struct LatestModified(AtomicI64);

impl LatestModified {
    pub fn observe(&self, entry: &DirectoryEntry) {
        if let Some(modified) = entry.last_modified() {
            self.0.fetch_max(modified.timestamp_millis(), Ordering::SeqCst);
        }
    }

    /// Milliseconds since the epoch, zero if nothing carried a timestamp.
    pub fn get(&self) -> i64 {
        self.0.load(Ordering::SeqCst)
    }
}

/// Phase 1 worker.
#[derive(Debug)]
pub struct GroupAnalyzer {
    scope: Arc<SourceScope>,
    ctx: SyncContext,
    mutations: Arc<MutationSet>,
    cache: Arc<ContainmentCache>,
    latest_modified: Arc<LatestModified>,
    user_names_case_sensitive: bool,
}

impl GroupAnalyzer {
    pub fn new(
        scope: Arc<SourceScope>,
        ctx: SyncContext,
        mutations: Arc<MutationSet>,
        cache: Arc<ContainmentCache>,
        user_names_case_sensitive: bool,
    ) -> Self {
        Self {
            scope,
            ctx,
            mutations,
            cache,
            latest_modified: Arc::new(LatestModified::default()),
            user_names_case_sensitive,
        }
    }

    pub fn latest_modified(&self) -> i64 {
        self.latest_modified.get()
    }

    /// Comparison key of a member, honoring the user name case policy.
    fn member_key(&self, member: &str) -> String {
        if self.user_names_case_sensitive || AuthorityKind::of(member) == AuthorityKind::Group {
            member.to_string()
        } else {
            member.to_lowercase()
        }
    }

    fn children(&self, entry: &DirectoryEntry) -> BTreeSet<String> {
        entry
            .child_associations()
            .iter()
            .map(|child| match AuthorityKind::of(child) {
                AuthorityKind::Group => child.clone(),
                AuthorityKind::User => self.ctx.qualify_user(child),
            })
            .collect()
    }

    fn add_group(&self, name: &str, display_name: &str, children: &BTreeSet<String>) {
        debug!(group = %name, "Scheduling group creation");
        self.mutations.record_group_creation(name, display_name);
        for child in children {
            self.mutations.record_parent_addition(child, name);
        }
    }

    async fn update_group(
        &self,
        txn: &mut dyn StoreTransaction,
        name: &str,
        display_name: &str,
        children: &BTreeSet<String>,
    ) -> SyncResult<()> {
        txn.set_authority_display_name(name, display_name).await?;

        let current = self.cache.contained(txn, name).await?;
        let current: BTreeMap<String, String> = current
            .into_iter()
            .map(|child| (self.member_key(&child), child))
            .collect();
        let wanted: BTreeMap<String, &String> = children
            .iter()
            .map(|child| (self.member_key(child), child))
            .collect();

        for (key, child) in &current {
            if !wanted.contains_key(key) {
                debug!(group = %name, child = %child, "Scheduling membership removal");
                self.mutations.record_parent_removal(child, name);
                if AuthorityKind::of(child) == AuthorityKind::Group {
                    self.cache.remove_child(name, child);
                }
            }
        }
        for (key, child) in &wanted {
            if !current.contains_key(key) {
                debug!(group = %name, child = %child, "Scheduling membership addition");
                self.mutations.record_parent_addition(child, name);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl BatchWorker<DirectoryEntry> for GroupAnalyzer {
    fn identifier(&self, entry: &DirectoryEntry) -> String {
        entry.source_id().to_string()
    }

    async fn process(&self, txn: &mut dyn StoreTransaction, entry: &DirectoryEntry) -> SyncResult<()> {
        let name = group_name(entry);
        let display_name = group_display_name(entry, &name);
        let children = self.children(entry);
        let zones = txn.authority_zones(&name).await?;

        match self.scope.precedence().decide(zones.as_ref()) {
            ProvenanceDecision::Create => self.add_group(&name, &display_name, &children),
            ProvenanceDecision::Update => {
                self.update_group(txn, &name, &display_name, &children)
                    .await?;
            }
            ProvenanceDecision::Rezone { from } => {
                warn!(
                    group = %name,
                    source = %self.scope.source_id,
                    zones = ?from,
                    "Moving group into the zone of this source"
                );
                apply_zone_change(txn, &name, &from, &self.scope.target_zones).await?;
                self.update_group(txn, &name, &display_name, &children)
                    .await?;
            }
            ProvenanceDecision::Recreate => {
                warn!(
                    group = %name,
                    source = %self.scope.source_id,
                    zones = ?zones,
                    "Recreating group owned by a lower priority source"
                );
                txn.delete_authority(&name).await?;
                self.add_group(&name, &display_name, &children);
            }
            ProvenanceDecision::Skip { owners } => {
                debug!(
                    group = %name,
                    owners = ?owners,
                    "Group owned by a higher priority source, skipping"
                );
            }
        }

        self.latest_modified.observe(entry);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryIdentityStore;
    use crate::provenance::target_zones;
    use crate::store::IdentityStore;
    use chrono::{TimeZone, Utc};
    use xavyo_directory::{PropertyMap, PropertyValue};

    fn scope(source: &str, visited: &[&str], allow_deletions: bool) -> Arc<SourceScope> {
        Arc::new(SourceScope::new(
            source,
            BTreeSet::from(["ldap1".to_string(), "ldap2".to_string()]),
            visited.iter().map(|s| s.to_string()).collect(),
            allow_deletions,
        ))
    }

    fn analyzer(scope: Arc<SourceScope>, tenant: &str) -> (GroupAnalyzer, Arc<MutationSet>) {
        let mutations = Arc::new(MutationSet::new());
        let analyzer = GroupAnalyzer::new(
            scope,
            SyncContext::new(tenant),
            Arc::clone(&mutations),
            Arc::new(ContainmentCache::new()),
            true,
        );
        (analyzer, mutations)
    }

    fn group(id: &str, children: &[&str]) -> DirectoryEntry {
        DirectoryEntry::new(format!("cn={id},ou=groups,dc=example,dc=com"), id)
            .with_property(props::AUTHORITY_NAME, format!("GROUP_{id}"))
            .with_children(children.iter().copied())
    }

    async fn seed(store: &InMemoryIdentityStore, source: &str, group: &str, members: &[&str]) {
        let mut txn = store.begin("").await.unwrap();
        let name = txn
            .create_authority(AuthorityKind::Group, group, group, &target_zones(source))
            .await
            .unwrap();
        for member in members {
            if AuthorityKind::of(member) == AuthorityKind::User {
                let properties =
                    PropertyMap::from([(props::USER_NAME.to_string(), PropertyValue::from(*member))]);
                txn.create_person(&properties, &target_zones(source))
                    .await
                    .unwrap();
            } else {
                txn.create_authority(AuthorityKind::Group, short_name(member), member, &target_zones(source))
                    .await
                    .unwrap();
            }
            txn.add_authority(&name, member).await.unwrap();
        }
        txn.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_new_group_is_scheduled_for_creation() {
        let store = InMemoryIdentityStore::new();
        let (analyzer, mutations) = analyzer(scope("ldap1", &[], true), "");
        let modified = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let entry = group("dev", &["mmustermann", "GROUP_backend"])
            .with_property(props::AUTHORITY_DISPLAY_NAME, "Development")
            .with_last_modified(modified);

        let mut txn = store.begin("").await.unwrap();
        analyzer.process(txn.as_mut(), &entry).await.unwrap();

        assert_eq!(mutations.group_to_create("GROUP_dev").as_deref(), Some("Development"));
        assert!(mutations.parents_to_add_for("mmustermann").contains("GROUP_dev"));
        assert!(mutations.parents_to_add_for("GROUP_backend").contains("GROUP_dev"));
        assert_eq!(analyzer.latest_modified(), modified.timestamp_millis());
    }

    #[tokio::test]
    async fn test_owned_group_membership_delta() {
        let store = InMemoryIdentityStore::new();
        seed(&store, "ldap1", "dev", &["alice", "bob", "GROUP_old"]).await;
        let (analyzer, mutations) = analyzer(scope("ldap1", &[], true), "");

        let mut txn = store.begin("").await.unwrap();
        analyzer
            .process(txn.as_mut(), &group("dev", &["alice", "carol"]))
            .await
            .unwrap();
        txn.commit().await.unwrap();

        assert!(mutations.groups_to_create().is_empty());
        assert!(mutations.parents_to_add_for("carol").contains("GROUP_dev"));
        assert!(mutations.parents_to_remove_for("bob").contains("GROUP_dev"));
        assert!(mutations.parents_to_remove_for("GROUP_old").contains("GROUP_dev"));
        assert!(mutations.parents_to_add_for("alice").is_empty());
        // Display name falls back to the short name.
        assert_eq!(store.display_name("GROUP_dev").as_deref(), Some("dev"));
    }

    #[tokio::test]
    async fn test_group_of_unvisited_source_is_recreated() {
        let store = InMemoryIdentityStore::new();
        seed(&store, "ldap2", "dev", &["alice"]).await;
        let (analyzer, mutations) = analyzer(scope("ldap1", &[], true), "");

        let mut txn = store.begin("").await.unwrap();
        analyzer
            .process(txn.as_mut(), &group("dev", &["alice"]))
            .await
            .unwrap();
        txn.commit().await.unwrap();

        assert!(!store.authority_names().contains(&"GROUP_dev".to_string()));
        assert!(mutations.group_to_create("GROUP_dev").is_some());
        assert!(mutations.parents_to_add_for("alice").contains("GROUP_dev"));
    }

    #[tokio::test]
    async fn test_group_is_rezoned_without_deletions() {
        let store = InMemoryIdentityStore::new();
        seed(&store, "ldap2", "dev", &["alice"]).await;
        let (analyzer, mutations) = analyzer(scope("ldap1", &[], false), "");

        let mut txn = store.begin("").await.unwrap();
        analyzer
            .process(txn.as_mut(), &group("dev", &["alice", "bob"]))
            .await
            .unwrap();
        txn.commit().await.unwrap();

        assert_eq!(store.zones("GROUP_dev"), Some(target_zones("ldap1")));
        assert!(mutations.group_to_create("GROUP_dev").is_none());
        assert!(mutations.parents_to_add_for("bob").contains("GROUP_dev"));
    }

    #[tokio::test]
    async fn test_group_of_visited_source_is_left_alone() {
        let store = InMemoryIdentityStore::new();
        seed(&store, "ldap1", "dev", &["alice"]).await;
        let (analyzer, mutations) = analyzer(scope("ldap2", &["ldap1"], true), "");

        let mut txn = store.begin("").await.unwrap();
        analyzer
            .process(txn.as_mut(), &group("dev", &["bob"]))
            .await
            .unwrap();
        txn.commit().await.unwrap();

        assert!(mutations.is_empty());
        assert_eq!(store.zones("GROUP_dev"), Some(target_zones("ldap1")));
    }

    #[tokio::test]
    async fn test_user_members_qualified_in_tenant() {
        let store = InMemoryIdentityStore::new();
        let (analyzer, mutations) = analyzer(scope("ldap1", &[], true), "acme.com");

        let mut txn = store.begin("acme.com").await.unwrap();
        analyzer
            .process(txn.as_mut(), &group("dev", &["alice"]))
            .await
            .unwrap();

        assert!(mutations.parents_to_add_for("alice@acme.com").contains("GROUP_dev"));
    }

    #[test]
    fn test_group_name_fallback() {
        let entry = DirectoryEntry::new("cn=ops,dc=example,dc=com", "ops");
        assert_eq!(group_name(&entry), "GROUP_ops");
        assert_eq!(group_display_name(&entry, "GROUP_ops"), "ops");
    }
}
