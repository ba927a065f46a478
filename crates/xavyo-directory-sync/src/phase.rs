//! Ordered phases of a source synchronization.

use std::fmt;

use crate::context::is_default_tenant;

/// Phases run per source, strictly in this order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SyncPhase {
    GroupAnalysis,
    GroupCreationAndParentRemoval,
    GroupParentAddition,
    PersonUpsert,
    UserParentAssociation,
    /// Full syncs only.
    AuthorityDeletion,
}

impl SyncPhase {
    pub const ALL: [SyncPhase; 6] = [
        SyncPhase::GroupAnalysis,
        SyncPhase::GroupCreationAndParentRemoval,
        SyncPhase::GroupParentAddition,
        SyncPhase::PersonUpsert,
        SyncPhase::UserParentAssociation,
        SyncPhase::AuthorityDeletion,
    ];

    pub fn number(&self) -> u8 {
        match self {
            SyncPhase::GroupAnalysis => 1,
            SyncPhase::GroupCreationAndParentRemoval => 2,
            SyncPhase::GroupParentAddition => 3,
            SyncPhase::PersonUpsert => 4,
            SyncPhase::UserParentAssociation => 5,
            SyncPhase::AuthorityDeletion => 6,
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            SyncPhase::GroupAnalysis => "Group Analysis",
            SyncPhase::GroupCreationAndParentRemoval => "Group Creation and Association Deletion",
            SyncPhase::GroupParentAddition => "Group Association Creation",
            SyncPhase::PersonUpsert => "User Update and Creation",
            SyncPhase::UserParentAssociation => "User Association",
            SyncPhase::AuthorityDeletion => "Authority Deletion",
        }
    }

    /// Process name used in batch progress logs.
    pub fn batch_title(&self, source_id: &str, tenant: &str) -> String {
        let batch_id = if is_default_tenant(tenant) {
            source_id.to_string()
        } else {
            format!("{source_id}@{tenant}")
        };
        format!(
            "Synchronization,Category=directory,id1={batch_id},id2={} {}",
            self.number(),
            self.title()
        )
    }
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.number(), self.title())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_order() {
        let numbers: Vec<u8> = SyncPhase::ALL.iter().map(SyncPhase::number).collect();
        assert_eq!(numbers, vec![1, 2, 3, 4, 5, 6]);
        assert!(SyncPhase::GroupAnalysis < SyncPhase::AuthorityDeletion);
    }

    #[test]
    fn test_batch_title() {
        assert_eq!(
            SyncPhase::GroupAnalysis.batch_title("ldap1", ""),
            "Synchronization,Category=directory,id1=ldap1,id2=1 Group Analysis"
        );
        assert_eq!(
            SyncPhase::UserParentAssociation.batch_title("ldap1", "acme.com"),
            "Synchronization,Category=directory,id1=ldap1@acme.com,id2=5 User Association"
        );
    }
}
