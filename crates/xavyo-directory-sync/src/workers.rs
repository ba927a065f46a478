//! Apply workers for phases 2 to 6.
//!
//! Every worker handles one authority per call and is idempotent: work
//! already applied by an earlier, interrupted run is detected and skipped.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};
use xavyo_directory::{
    props, short_name, AuthorityKind, AvatarBlob, DirectoryEntry, PropertyValue,
    UserAccountInterpreter,
};

use crate::analyzer::LatestModified;
use crate::batch::BatchWorker;
use crate::containment::ContainmentCache;
use crate::context::SyncContext;
use crate::error::SyncResult;
use crate::mutation::MutationSet;
use crate::provenance::{apply_zone_change, ProvenanceDecision, SourceScope, ZONE_AUTH_ALF};
use crate::store::StoreTransaction;

/// Phase 2: create new groups and detach groups from former parents.
#[derive(Debug)]
pub struct GroupCreationWorker {
    scope: Arc<SourceScope>,
    mutations: Arc<MutationSet>,
}

impl GroupCreationWorker {
    pub fn new(scope: Arc<SourceScope>, mutations: Arc<MutationSet>) -> Self {
        Self { scope, mutations }
    }
}

#[async_trait]
impl BatchWorker<String> for GroupCreationWorker {
    fn identifier(&self, group: &String) -> String {
        group.clone()
    }

    async fn process(&self, txn: &mut dyn StoreTransaction, group: &String) -> SyncResult<()> {
        if let Some(display_name) = self.mutations.group_to_create(group) {
            if txn.authority_exists(group).await? {
                debug!(group = %group, "Group already created");
            } else {
                debug!(group = %group, display_name = %display_name, "Creating group");
                txn.create_authority(
                    AuthorityKind::Group,
                    short_name(group),
                    &display_name,
                    &self.scope.target_zones,
                )
                .await?;
            }
            return Ok(());
        }

        for parent in self.mutations.parents_to_remove_for(group) {
            debug!(group = %group, parent = %parent, "Removing group from parent");
            txn.remove_authority(&parent, group).await?;
        }
        Ok(())
    }
}

/// Phase 3: attach groups to their new parents.
#[derive(Debug)]
pub struct GroupParentAdditionWorker {
    mutations: Arc<MutationSet>,
    cache: Arc<ContainmentCache>,
}

impl GroupParentAdditionWorker {
    pub fn new(mutations: Arc<MutationSet>, cache: Arc<ContainmentCache>) -> Self {
        Self { mutations, cache }
    }
}

#[async_trait]
impl BatchWorker<String> for GroupParentAdditionWorker {
    fn identifier(&self, group: &String) -> String {
        group.clone()
    }

    async fn process(&self, txn: &mut dyn StoreTransaction, group: &String) -> SyncResult<()> {
        if !txn.authority_exists(group).await? {
            warn!(group = %group, "Member group does not exist, skipping its associations");
            return Ok(());
        }

        for parent in self.mutations.parents_to_add_for(group) {
            if !txn.authority_exists(&parent).await? {
                warn!(group = %group, parent = %parent, "Parent group does not exist");
                continue;
            }
            if self.cache.closes_cycle(txn, &parent, group).await? {
                warn!(
                    group = %group,
                    parent = %parent,
                    "Adding group to parent creates a membership cycle"
                );
            }
            debug!(group = %group, parent = %parent, "Adding group to parent");
            txn.add_authority(&parent, group).await?;
            self.cache.add_child(&parent, group);
        }
        Ok(())
    }
}

/// Content digest used to detect avatar changes.
pub fn avatar_digest(content: &[u8]) -> String {
    hex::encode(Sha256::digest(content))
}

/// Phase 4: create or update people.
#[derive(Debug)]
pub struct PersonWorker {
    scope: Arc<SourceScope>,
    ctx: SyncContext,
    account_interpreter: Option<Arc<dyn UserAccountInterpreter>>,
    latest_modified: Arc<LatestModified>,
}

impl PersonWorker {
    /// `account_interpreter` is only set when this source owns account status.
    pub fn new(
        scope: Arc<SourceScope>,
        ctx: SyncContext,
        account_interpreter: Option<Arc<dyn UserAccountInterpreter>>,
    ) -> Self {
        Self {
            scope,
            ctx,
            account_interpreter,
            latest_modified: Arc::new(LatestModified::default()),
        }
    }

    pub fn latest_modified(&self) -> i64 {
        self.latest_modified.get()
    }

    async fn update_avatar(
        &self,
        txn: &mut dyn StoreTransaction,
        user_name: &str,
        avatar: &AvatarBlob,
    ) -> SyncResult<()> {
        let digest = avatar_digest(avatar.data());
        let current = txn.avatar(user_name).await?.map(|c| avatar_digest(&c));
        if current.as_deref() == Some(digest.as_str()) {
            debug!(user = %user_name, "Avatar unchanged");
            return Ok(());
        }
        debug!(user = %user_name, digest = %digest, "Updating avatar");
        txn.set_avatar(user_name, avatar.data()).await?;
        Ok(())
    }
}

#[async_trait]
impl BatchWorker<DirectoryEntry> for PersonWorker {
    fn identifier(&self, entry: &DirectoryEntry) -> String {
        entry.source_id().to_string()
    }

    async fn process(&self, txn: &mut dyn StoreTransaction, entry: &DirectoryEntry) -> SyncResult<()> {
        let mut properties = entry.properties().clone();
        let user_name = properties
            .get(props::USER_NAME)
            .and_then(|v| v.as_str())
            .unwrap_or_else(|| entry.id());
        let user_name = self.ctx.qualify_user(user_name);
        properties.insert(
            props::USER_NAME.to_string(),
            PropertyValue::String(user_name.clone()),
        );

        let status = properties.remove(props::ACCOUNT_STATUS);
        if let Some(interpreter) = &self.account_interpreter {
            if let Some(disabled) = interpreter.is_account_disabled(status.as_ref()) {
                properties.insert(props::ENABLED.to_string(), PropertyValue::Boolean(!disabled));
            }
        }
        let avatar = properties.remove(props::AVATAR);

        let zones = txn.authority_zones(&user_name).await?;
        match self.scope.precedence().decide(zones.as_ref()) {
            ProvenanceDecision::Create => {
                debug!(user = %user_name, "Creating person");
                txn.create_person(&properties, &self.scope.target_zones)
                    .await?;
            }
            ProvenanceDecision::Update => {
                debug!(user = %user_name, "Updating person");
                txn.set_person_properties(&user_name, &properties).await?;
            }
            ProvenanceDecision::Rezone { from } => {
                warn!(
                    user = %user_name,
                    source = %self.scope.source_id,
                    zones = ?from,
                    "Moving person into the zone of this source"
                );
                apply_zone_change(txn, &user_name, &from, &self.scope.target_zones).await?;
                txn.set_person_properties(&user_name, &properties).await?;
            }
            ProvenanceDecision::Recreate => {
                warn!(
                    user = %user_name,
                    source = %self.scope.source_id,
                    zones = ?zones,
                    "Recreating person owned by a lower priority source"
                );
                txn.delete_person(&user_name).await?;
                txn.create_person(&properties, &self.scope.target_zones)
                    .await?;
            }
            ProvenanceDecision::Skip { owners } => {
                debug!(
                    user = %user_name,
                    owners = ?owners,
                    "Person owned by a higher priority source, skipping"
                );
                self.latest_modified.observe(entry);
                return Ok(());
            }
        }

        if let Some(PropertyValue::Avatar(avatar)) = &avatar {
            self.update_avatar(txn, &user_name, avatar).await?;
        }

        self.latest_modified.observe(entry);
        Ok(())
    }
}

/// Phase 5: attach users to and detach them from groups.
#[derive(Debug)]
pub struct UserParentWorker {
    mutations: Arc<MutationSet>,
}

impl UserParentWorker {
    pub fn new(mutations: Arc<MutationSet>) -> Self {
        Self { mutations }
    }
}

#[async_trait]
impl BatchWorker<String> for UserParentWorker {
    fn identifier(&self, user: &String) -> String {
        user.clone()
    }

    async fn process(&self, txn: &mut dyn StoreTransaction, user: &String) -> SyncResult<()> {
        if !txn.person_exists(user).await? {
            debug!(user = %user, "Person does not exist, skipping its associations");
            return Ok(());
        }

        for parent in self.mutations.parents_to_add_for(user) {
            if !txn.authority_exists(&parent).await? {
                warn!(user = %user, parent = %parent, "Parent group does not exist");
                continue;
            }
            debug!(user = %user, parent = %parent, "Adding user to group");
            txn.add_authority(&parent, user).await?;
        }
        for parent in self.mutations.parents_to_remove_for(user) {
            debug!(user = %user, parent = %parent, "Removing user from group");
            txn.remove_authority(&parent, user).await?;
        }
        Ok(())
    }
}

/// Phase 6: delete authorities the source no longer returns, or hand them
/// to the neutral zone when deletions are not allowed.
#[derive(Debug)]
pub struct AuthorityDeleter {
    scope: Arc<SourceScope>,
}

impl AuthorityDeleter {
    pub fn new(scope: Arc<SourceScope>) -> Self {
        Self { scope }
    }
}

#[async_trait]
impl BatchWorker<String> for AuthorityDeleter {
    fn identifier(&self, authority: &String) -> String {
        authority.clone()
    }

    async fn process(&self, txn: &mut dyn StoreTransaction, authority: &String) -> SyncResult<()> {
        if self.scope.allow_deletions {
            match AuthorityKind::of(authority) {
                AuthorityKind::User => {
                    debug!(user = %authority, "Deleting user");
                    txn.delete_person(authority).await?;
                }
                AuthorityKind::Group => {
                    debug!(group = %authority, "Deleting group");
                    txn.delete_authority(authority).await?;
                }
            }
            return Ok(());
        }

        debug!(authority = %authority, "Moving authority to the neutral zone");
        let from = BTreeSet::from([self.scope.zone_id.clone()]);
        let to = BTreeSet::from([ZONE_AUTH_ALF.to_string()]);
        apply_zone_change(txn, authority, &from, &to).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryIdentityStore;
    use crate::provenance::target_zones;
    use crate::store::IdentityStore;
    use xavyo_directory::{ActiveDirectoryAccountInterpreter, PropertyMap};

    fn scope(allow_deletions: bool) -> Arc<SourceScope> {
        Arc::new(SourceScope::new(
            "ldap1",
            BTreeSet::from(["ldap1".to_string()]),
            BTreeSet::new(),
            allow_deletions,
        ))
    }

    fn person(uid: &str) -> DirectoryEntry {
        DirectoryEntry::new(format!("uid={uid},ou=users,dc=example,dc=com"), uid)
            .with_property(props::USER_NAME, uid)
            .with_property(props::EMAIL, format!("{uid}@example.com"))
    }

    #[tokio::test]
    async fn test_group_creation_is_idempotent() {
        let store = InMemoryIdentityStore::new();
        let mutations = Arc::new(MutationSet::new());
        mutations.record_group_creation("GROUP_dev", "Development");
        let worker = GroupCreationWorker::new(scope(true), Arc::clone(&mutations));

        for _ in 0..2 {
            let mut txn = store.begin("").await.unwrap();
            worker.process(txn.as_mut(), &"GROUP_dev".to_string()).await.unwrap();
            txn.commit().await.unwrap();
        }

        assert_eq!(store.display_name("GROUP_dev").as_deref(), Some("Development"));
        assert_eq!(store.zones("GROUP_dev"), Some(target_zones("ldap1")));
        assert_eq!(store.mutations(), 1);
    }

    #[tokio::test]
    async fn test_group_parent_addition_applies_cyclic_edge() {
        let store = InMemoryIdentityStore::new();
        let mut txn = store.begin("").await.unwrap();
        for group in ["a", "b"] {
            txn.create_authority(AuthorityKind::Group, group, group, &target_zones("ldap1"))
                .await
                .unwrap();
        }
        txn.add_authority("GROUP_a", "GROUP_b").await.unwrap();
        txn.commit().await.unwrap();

        let mutations = Arc::new(MutationSet::new());
        mutations.record_parent_addition("GROUP_a", "GROUP_b");
        mutations.record_parent_addition("GROUP_a", "GROUP_missing");
        let worker = GroupParentAdditionWorker::new(mutations, Arc::new(ContainmentCache::new()));

        let mut txn = store.begin("").await.unwrap();
        worker.process(txn.as_mut(), &"GROUP_a".to_string()).await.unwrap();
        txn.commit().await.unwrap();

        assert!(store.members("GROUP_b").contains("GROUP_a"));
        assert!(store.members("GROUP_a").contains("GROUP_b"));
    }

    #[tokio::test]
    async fn test_person_created_then_updated() {
        let store = InMemoryIdentityStore::new();
        let worker = PersonWorker::new(scope(true), SyncContext::new("acme.com"), None);

        let mut txn = store.begin("acme.com").await.unwrap();
        worker.process(txn.as_mut(), &person("alice")).await.unwrap();
        txn.commit().await.unwrap();

        let stored = store.person_in("acme.com", "alice@acme.com").unwrap();
        assert_eq!(
            stored.get(props::EMAIL),
            Some(&PropertyValue::from("alice@example.com"))
        );
        assert_eq!(store.zones_in("acme.com", "alice@acme.com"), Some(target_zones("ldap1")));

        let changed = person("alice").with_property(props::EMAIL, PropertyValue::Null);
        let mut txn = store.begin("acme.com").await.unwrap();
        worker.process(txn.as_mut(), &changed).await.unwrap();
        txn.commit().await.unwrap();

        let stored = store.person_in("acme.com", "alice@acme.com").unwrap();
        assert!(stored.get(props::EMAIL).is_none());
    }

    #[tokio::test]
    async fn test_account_interpreter_sets_enabled() {
        let store = InMemoryIdentityStore::new();
        let worker = PersonWorker::new(
            scope(true),
            SyncContext::new(""),
            Some(Arc::new(ActiveDirectoryAccountInterpreter)),
        );

        let disabled = person("bob").with_property(props::ACCOUNT_STATUS, "514");
        let unknown = person("carol");

        let mut txn = store.begin("").await.unwrap();
        worker.process(txn.as_mut(), &disabled).await.unwrap();
        worker.process(txn.as_mut(), &unknown).await.unwrap();
        txn.commit().await.unwrap();

        let bob = store.person("bob").unwrap();
        assert_eq!(bob.get(props::ENABLED), Some(&PropertyValue::Boolean(false)));
        assert!(bob.get(props::ACCOUNT_STATUS).is_none());
        assert!(store.person("carol").unwrap().get(props::ENABLED).is_none());
    }

    #[tokio::test]
    async fn test_avatar_written_only_when_changed() {
        let store = InMemoryIdentityStore::new();
        let worker = PersonWorker::new(scope(true), SyncContext::new(""), None);
        let entry = person("alice").with_property(
            props::AVATAR,
            PropertyValue::Avatar(AvatarBlob::new(vec![0xff, 0xd8, 0x01])),
        );

        let mut txn = store.begin("").await.unwrap();
        worker.process(txn.as_mut(), &entry).await.unwrap();
        txn.commit().await.unwrap();
        assert_eq!(store.avatar("alice"), Some(vec![0xff, 0xd8, 0x01]));
        assert!(store.person("alice").unwrap().get(props::AVATAR).is_none());

        let before = store.mutations();
        let mut txn = store.begin("").await.unwrap();
        worker.process(txn.as_mut(), &entry).await.unwrap();
        txn.commit().await.unwrap();
        assert_eq!(store.mutations(), before);

        let changed = person("alice").with_property(
            props::AVATAR,
            PropertyValue::Avatar(AvatarBlob::new(vec![0xff, 0xd8, 0x02])),
        );
        let mut txn = store.begin("").await.unwrap();
        worker.process(txn.as_mut(), &changed).await.unwrap();
        txn.commit().await.unwrap();
        assert_eq!(store.avatar("alice"), Some(vec![0xff, 0xd8, 0x02]));
    }

    #[tokio::test]
    async fn test_user_associations_skip_missing_people() {
        let store = InMemoryIdentityStore::new();
        let mut txn = store.begin("").await.unwrap();
        txn.create_authority(AuthorityKind::Group, "dev", "dev", &target_zones("ldap1"))
            .await
            .unwrap();
        let properties = PropertyMap::from([(props::USER_NAME.to_string(), "alice".into())]);
        txn.create_person(&properties, &target_zones("ldap1")).await.unwrap();
        txn.commit().await.unwrap();

        let mutations = Arc::new(MutationSet::new());
        mutations.record_parent_addition("alice", "GROUP_dev");
        mutations.record_parent_addition("ghost", "GROUP_dev");
        let worker = UserParentWorker::new(Arc::clone(&mutations));

        let mut txn = store.begin("").await.unwrap();
        for user in mutations.user_association_work() {
            worker.process(txn.as_mut(), &user).await.unwrap();
        }
        txn.commit().await.unwrap();

        assert_eq!(store.members("GROUP_dev"), BTreeSet::from(["alice".to_string()]));

        let removals = MutationSet::new();
        removals.record_parent_removal("alice", "GROUP_dev");
        let worker = UserParentWorker::new(Arc::new(removals));
        let mut txn = store.begin("").await.unwrap();
        worker.process(txn.as_mut(), &"alice".to_string()).await.unwrap();
        txn.commit().await.unwrap();
        assert!(store.members("GROUP_dev").is_empty());
    }

    #[tokio::test]
    async fn test_authority_deleter() {
        let store = InMemoryIdentityStore::new();
        let mut txn = store.begin("").await.unwrap();
        for group in ["old", "kept"] {
            txn.create_authority(AuthorityKind::Group, group, group, &target_zones("ldap1"))
                .await
                .unwrap();
        }
        let properties = PropertyMap::from([(props::USER_NAME.to_string(), "gone".into())]);
        txn.create_person(&properties, &target_zones("ldap1")).await.unwrap();
        txn.commit().await.unwrap();

        let deleter = AuthorityDeleter::new(scope(true));
        let mut txn = store.begin("").await.unwrap();
        deleter.process(txn.as_mut(), &"GROUP_old".to_string()).await.unwrap();
        deleter.process(txn.as_mut(), &"gone".to_string()).await.unwrap();
        txn.commit().await.unwrap();
        assert!(!store.authority_names().contains(&"GROUP_old".to_string()));
        assert!(store.person("gone").is_none());

        let rezoner = AuthorityDeleter::new(scope(false));
        let mut txn = store.begin("").await.unwrap();
        rezoner.process(txn.as_mut(), &"GROUP_kept".to_string()).await.unwrap();
        txn.commit().await.unwrap();
        assert_eq!(
            store.zones("GROUP_kept"),
            Some(BTreeSet::from(["APP.DEFAULT".to_string(), "AUTH.ALF".to_string()]))
        );
    }
}
