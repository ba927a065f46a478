//! Per-run cache of group containment.
//!
//! Direct members of a group are loaded from the store at most once per run,
//! even under concurrent access, and kept consistent with the edges the run
//! adds and removes. Transitive resolution walks the cached graph with an
//! explicit visited set, so cyclic graphs terminate.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::OnceCell;
use xavyo_directory::AuthorityKind;

use crate::error::{SyncError, SyncResult};
use crate::store::StoreTransaction;

type Members = Arc<Mutex<BTreeSet<String>>>;

#[derive(Debug, Default)]
pub struct ContainmentCache {
    entries: DashMap<String, Arc<OnceCell<Members>>>,
}

impl ContainmentCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn cell(&self, group: &str) -> Arc<OnceCell<Members>> {
        Arc::clone(
            self.entries
                .entry(group.to_string())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .value(),
        )
    }

    async fn members(&self, txn: &mut dyn StoreTransaction, group: &str) -> SyncResult<Members> {
        let cell = self.cell(group);
        let members = cell
            .get_or_try_init(move || async move {
                let direct = txn.contained_authorities(None, group, true).await?;
                Ok::<_, SyncError>(Arc::new(Mutex::new(direct)))
            })
            .await?;
        Ok(Arc::clone(members))
    }

    /// Direct members of `group`.
    pub async fn contained(
        &self,
        txn: &mut dyn StoreTransaction,
        group: &str,
    ) -> SyncResult<BTreeSet<String>> {
        let members = self.members(txn, group).await?;
        let snapshot = members.lock().clone();
        Ok(snapshot)
    }

    /// Load the direct members of `groups` ahead of use.
    pub async fn prewarm<'a, I>(&self, txn: &mut dyn StoreTransaction, groups: I) -> SyncResult<()>
    where
        I: IntoIterator<Item = &'a String>,
    {
        for group in groups {
            self.members(txn, group).await?;
        }
        Ok(())
    }

    /// Record an added edge if `group` is cached.
    pub fn add_child(&self, group: &str, child: &str) {
        if let Some(members) = self.entries.get(group).and_then(|cell| cell.get().cloned()) {
            members.lock().insert(child.to_string());
        }
    }

    /// Record a removed edge if `group` is cached.
    pub fn remove_child(&self, group: &str, child: &str) {
        if let Some(members) = self.entries.get(group).and_then(|cell| cell.get().cloned()) {
            members.lock().remove(child);
        }
    }

    /// Every authority reachable below `group`, excluding `group` unless a
    /// cycle leads back to it.
    pub async fn transitive_members(
        &self,
        txn: &mut dyn StoreTransaction,
        group: &str,
    ) -> SyncResult<BTreeSet<String>> {
        let mut result = BTreeSet::new();
        let mut visited: HashSet<String> = HashSet::from([group.to_string()]);
        let mut pending = vec![group.to_string()];

        while let Some(current) = pending.pop() {
            for child in self.contained(txn, &current).await? {
                result.insert(child.clone());
                if AuthorityKind::of(&child) == AuthorityKind::Group && visited.insert(child.clone())
                {
                    pending.push(child);
                }
            }
        }
        Ok(result)
    }

    /// Whether adding `child` to `parent` closes a cycle.
    pub async fn closes_cycle(
        &self,
        txn: &mut dyn StoreTransaction,
        parent: &str,
        child: &str,
    ) -> SyncResult<bool> {
        if parent == child {
            return Ok(true);
        }
        if AuthorityKind::of(child) != AuthorityKind::Group {
            return Ok(false);
        }
        Ok(self.transitive_members(txn, child).await?.contains(parent))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryIdentityStore;
    use crate::provenance::target_zones;
    use crate::store::IdentityStore;

    async fn store_with_cycle() -> InMemoryIdentityStore {
        let store = InMemoryIdentityStore::new();
        let mut txn = store.begin("").await.unwrap();
        let zones = target_zones("ldap1");
        for group in ["g1", "g2", "g3"] {
            txn.create_authority(AuthorityKind::Group, group, group, &zones)
                .await
                .unwrap();
        }
        txn.add_authority("GROUP_g1", "GROUP_g2").await.unwrap();
        txn.add_authority("GROUP_g2", "GROUP_g1").await.unwrap();
        txn.add_authority("GROUP_g2", "GROUP_g3").await.unwrap();
        txn.commit().await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_transitive_members_terminate_on_cycle() {
        let store = store_with_cycle().await;
        let cache = ContainmentCache::new();
        let mut txn = store.begin("").await.unwrap();

        let members = cache
            .transitive_members(txn.as_mut(), "GROUP_g1")
            .await
            .unwrap();
        assert_eq!(
            members,
            BTreeSet::from([
                "GROUP_g1".to_string(),
                "GROUP_g2".to_string(),
                "GROUP_g3".to_string()
            ])
        );
        assert!(cache.closes_cycle(txn.as_mut(), "GROUP_g3", "GROUP_g1").await.unwrap());
        assert!(!cache.closes_cycle(txn.as_mut(), "GROUP_g1", "alice").await.unwrap());
    }

    #[tokio::test]
    async fn test_cache_tracks_run_edges() {
        let store = store_with_cycle().await;
        let cache = ContainmentCache::new();
        let mut txn = store.begin("").await.unwrap();

        let direct = cache.contained(txn.as_mut(), "GROUP_g2").await.unwrap();
        assert_eq!(direct.len(), 2);

        cache.remove_child("GROUP_g2", "GROUP_g1");
        cache.add_child("GROUP_g2", "bob");
        // Not cached yet, ignored.
        cache.add_child("GROUP_g3", "carol");

        let direct = cache.contained(txn.as_mut(), "GROUP_g2").await.unwrap();
        assert_eq!(
            direct,
            BTreeSet::from(["GROUP_g3".to_string(), "bob".to_string()])
        );
        assert!(cache.contained(txn.as_mut(), "GROUP_g3").await.unwrap().is_empty());
    }
}
