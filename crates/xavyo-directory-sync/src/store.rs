//! Identity store seam.
//!
//! The synchronizer never owns authority state. It reads zones and
//! containment from the store and writes mutations through a
//! [`StoreTransaction`], one transaction per batch.

use std::collections::BTreeSet;

use async_trait::async_trait;
use xavyo_directory::{AuthorityKind, PropertyMap};

use crate::error::StoreResult;

/// The local identity store receiving synchronized users and groups.
#[async_trait]
pub trait IdentityStore: Send + Sync {
    /// Whether the store rejects every write.
    fn is_read_only(&self) -> bool;

    /// Whether user names are compared case-sensitively.
    fn user_names_case_sensitive(&self) -> bool;

    /// Whether people may be created for users that log in without a record.
    fn creates_missing_people(&self) -> bool;

    /// Open a transaction scoped to `tenant`.
    async fn begin(&self, tenant: &str) -> StoreResult<Box<dyn StoreTransaction>>;
}

/// Unit of work against the identity store.
///
/// Authority names are full names: `GROUP_`-prefixed for groups, the user
/// name for users. Users are authorities too, so zone and containment
/// operations accept both.
#[async_trait]
pub trait StoreTransaction: Send {
    async fn authority_exists(&mut self, name: &str) -> StoreResult<bool>;

    /// Create an authority and return its full name.
    async fn create_authority(
        &mut self,
        kind: AuthorityKind,
        short_name: &str,
        display_name: &str,
        zones: &BTreeSet<String>,
    ) -> StoreResult<String>;

    async fn set_authority_display_name(&mut self, name: &str, display_name: &str)
        -> StoreResult<()>;

    /// Make `child` a direct member of `parent`.
    async fn add_authority(&mut self, parent: &str, child: &str) -> StoreResult<()>;

    /// Remove `child` from the direct members of `parent`.
    async fn remove_authority(&mut self, parent: &str, child: &str) -> StoreResult<()>;

    /// Delete a group and all its membership edges.
    async fn delete_authority(&mut self, name: &str) -> StoreResult<()>;

    /// Zones of the authority, `None` if it does not exist.
    async fn authority_zones(&mut self, name: &str) -> StoreResult<Option<BTreeSet<String>>>;

    async fn add_authority_to_zones(&mut self, name: &str, zones: &BTreeSet<String>)
        -> StoreResult<()>;

    async fn remove_authority_from_zones(
        &mut self,
        name: &str,
        zones: &BTreeSet<String>,
    ) -> StoreResult<()>;

    /// Members of `name`, optionally limited to one kind and to direct members.
    async fn contained_authorities(
        &mut self,
        kind: Option<AuthorityKind>,
        name: &str,
        immediate: bool,
    ) -> StoreResult<BTreeSet<String>>;

    /// Groups containing `name`, optionally only direct parents.
    async fn containing_authorities(
        &mut self,
        kind: Option<AuthorityKind>,
        name: &str,
        immediate: bool,
    ) -> StoreResult<BTreeSet<String>>;

    /// Authorities of one kind carrying `zone`.
    async fn authorities_in_zone(
        &mut self,
        kind: AuthorityKind,
        zone: &str,
    ) -> StoreResult<BTreeSet<String>>;

    async fn person_exists(&mut self, user_name: &str) -> StoreResult<bool>;

    /// Create a person from properties holding at least `userName`.
    ///
    /// Null values are not stored.
    async fn create_person(
        &mut self,
        properties: &PropertyMap,
        zones: &BTreeSet<String>,
    ) -> StoreResult<()>;

    /// Merge properties into an existing person; null values clear the property.
    async fn set_person_properties(
        &mut self,
        user_name: &str,
        properties: &PropertyMap,
    ) -> StoreResult<()>;

    async fn delete_person(&mut self, user_name: &str) -> StoreResult<()>;

    async fn get_person(&mut self, user_name: &str) -> StoreResult<Option<PropertyMap>>;

    /// Stored avatar content of a person.
    async fn avatar(&mut self, user_name: &str) -> StoreResult<Option<Vec<u8>>>;

    async fn set_avatar(&mut self, user_name: &str, content: &[u8]) -> StoreResult<()>;

    async fn commit(self: Box<Self>) -> StoreResult<()>;

    async fn rollback(self: Box<Self>) -> StoreResult<()>;
}
