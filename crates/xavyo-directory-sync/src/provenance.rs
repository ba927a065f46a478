//! Provenance zones and the precedence decision shared by groups and persons.
//!
//! Every authority created from a directory source carries the zone
//! `AUTH.EXT.<source id>`. When a source meets an authority it does not own,
//! the zones it carries and the set of sources already synchronized in this
//! run decide whether it is adopted, recreated or left alone.

use std::collections::BTreeSet;

use tracing::debug;

use crate::error::SyncResult;
use crate::store::StoreTransaction;

/// Prefix of the zone of a directory source.
pub const ZONE_AUTH_EXT_PREFIX: &str = "AUTH.EXT.";

/// Neutral zone for authorities no source owns.
pub const ZONE_AUTH_ALF: &str = "AUTH.ALF";

/// Default application zone.
pub const ZONE_APP_DEFAULT: &str = "APP.DEFAULT";

const ZONE_APP_PREFIX: &str = "APP.";

/// Zone owned by `source_id`.
pub fn zone_id(source_id: &str) -> String {
    format!("{ZONE_AUTH_EXT_PREFIX}{source_id}")
}

/// Source id behind an external zone.
pub fn source_of_zone(zone: &str) -> Option<&str> {
    zone.strip_prefix(ZONE_AUTH_EXT_PREFIX)
}

/// Zones given to authorities created by `source_id`.
pub fn target_zones(source_id: &str) -> BTreeSet<String> {
    BTreeSet::from([ZONE_APP_DEFAULT.to_string(), zone_id(source_id)])
}

/// Zones given to people auto-created on login.
pub fn default_person_zones() -> BTreeSet<String> {
    BTreeSet::from([ZONE_AUTH_ALF.to_string(), ZONE_APP_DEFAULT.to_string()])
}

/// Zones to remove from and add to an authority moving from `old` to `new`.
///
/// The neutral zone and application zones are never removed.
pub fn zone_change(
    old: &BTreeSet<String>,
    new: &BTreeSet<String>,
) -> (BTreeSet<String>, BTreeSet<String>) {
    let to_remove = old
        .difference(new)
        .filter(|zone| zone.as_str() != ZONE_AUTH_ALF && !zone.starts_with(ZONE_APP_PREFIX))
        .cloned()
        .collect();
    let to_add = new.difference(old).cloned().collect();
    (to_remove, to_add)
}

/// Move `authority` from the `old` zones into the `new` zones.
pub async fn apply_zone_change(
    txn: &mut dyn StoreTransaction,
    authority: &str,
    old: &BTreeSet<String>,
    new: &BTreeSet<String>,
) -> SyncResult<()> {
    let (to_remove, to_add) = zone_change(old, new);
    debug!(authority = %authority, remove = ?to_remove, add = ?to_add, "Updating zones");
    if !to_remove.is_empty() {
        txn.remove_authority_from_zones(authority, &to_remove).await?;
    }
    if !to_add.is_empty() {
        txn.add_authority_to_zones(authority, &to_add).await?;
    }
    Ok(())
}

/// What to do with an authority met by a source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvenanceDecision {
    /// The authority does not exist yet.
    Create,
    /// The source already owns the authority.
    Update,
    /// Take over the authority from `from` and update it in place.
    Rezone { from: BTreeSet<String> },
    /// Delete the authority and create it again from this source.
    Recreate,
    /// A source synchronized earlier in this run owns it.
    Skip { owners: BTreeSet<String> },
}

/// Precedence inputs of the source being synchronized.
#[derive(Debug, Clone, Copy)]
pub struct Precedence<'a> {
    /// Zone of the source being synchronized.
    pub zone_id: &'a str,
    /// Ids of every active source in the chain.
    pub all_ids: &'a BTreeSet<String>,
    /// Ids of the sources already synchronized in this run.
    pub visited_ids: &'a BTreeSet<String>,
    pub allow_deletions: bool,
}

impl Precedence<'_> {
    /// Decide from the authority's current zones, `None` when it is absent.
    pub fn decide(&self, zones: Option<&BTreeSet<String>>) -> ProvenanceDecision {
        let Some(zones) = zones else {
            return ProvenanceDecision::Create;
        };
        if zones.contains(self.zone_id) {
            return ProvenanceDecision::Update;
        }

        let intersection: BTreeSet<String> = zones
            .iter()
            .filter_map(|zone| source_of_zone(zone))
            .filter(|id| self.all_ids.contains(*id))
            .map(str::to_string)
            .collect();
        let visited: BTreeSet<String> = intersection
            .intersection(self.visited_ids)
            .cloned()
            .collect();

        if !visited.is_empty() {
            return ProvenanceDecision::Skip { owners: visited };
        }
        if !self.allow_deletions || intersection.is_empty() {
            ProvenanceDecision::Rezone {
                from: zones.clone(),
            }
        } else {
            ProvenanceDecision::Recreate
        }
    }
}

/// The source being synchronized and its place in the run.
#[derive(Debug, Clone)]
pub struct SourceScope {
    pub source_id: String,
    pub zone_id: String,
    pub target_zones: BTreeSet<String>,
    /// Ids of every active source in the chain.
    pub all_ids: BTreeSet<String>,
    /// Ids of the sources already synchronized in this run.
    pub visited_ids: BTreeSet<String>,
    pub allow_deletions: bool,
}

impl SourceScope {
    pub fn new(
        source_id: impl Into<String>,
        all_ids: BTreeSet<String>,
        visited_ids: BTreeSet<String>,
        allow_deletions: bool,
    ) -> Self {
        let source_id = source_id.into();
        Self {
            zone_id: zone_id(&source_id),
            target_zones: target_zones(&source_id),
            source_id,
            all_ids,
            visited_ids,
            allow_deletions,
        }
    }

    pub fn precedence(&self) -> Precedence<'_> {
        Precedence {
            zone_id: &self.zone_id,
            all_ids: &self.all_ids,
            visited_ids: &self.visited_ids,
            allow_deletions: self.allow_deletions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(values: &[&str]) -> BTreeSet<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn test_zones() {
        assert_eq!(zone_id("ldap1"), "AUTH.EXT.ldap1");
        assert_eq!(source_of_zone("AUTH.EXT.ldap1"), Some("ldap1"));
        assert_eq!(source_of_zone("APP.DEFAULT"), None);
        assert_eq!(target_zones("ldap1"), set(&["APP.DEFAULT", "AUTH.EXT.ldap1"]));
    }

    #[test]
    fn test_zone_change_keeps_neutral_and_app_zones() {
        let old = set(&["AUTH.ALF", "APP.SHARE", "APP.DEFAULT", "AUTH.EXT.ldap2"]);
        let new = target_zones("ldap1");
        let (remove, add) = zone_change(&old, &new);
        assert_eq!(remove, set(&["AUTH.EXT.ldap2"]));
        assert_eq!(add, set(&["AUTH.EXT.ldap1"]));
    }

    #[test]
    fn test_decide() {
        let all = set(&["corporate", "internal"]);
        let none = BTreeSet::new();
        let visited = set(&["corporate"]);

        let first = Precedence {
            zone_id: "AUTH.EXT.corporate",
            all_ids: &all,
            visited_ids: &none,
            allow_deletions: true,
        };
        assert_eq!(first.decide(None), ProvenanceDecision::Create);
        assert_eq!(
            first.decide(Some(&target_zones("corporate"))),
            ProvenanceDecision::Update
        );

        // Owned by a lower priority source not yet visited.
        assert_eq!(
            first.decide(Some(&target_zones("internal"))),
            ProvenanceDecision::Recreate
        );

        // Owned by a source that is no longer configured.
        let orphan = target_zones("retired");
        assert_eq!(
            first.decide(Some(&orphan)),
            ProvenanceDecision::Rezone { from: orphan.clone() }
        );

        let second = Precedence {
            zone_id: "AUTH.EXT.internal",
            all_ids: &all,
            visited_ids: &visited,
            allow_deletions: true,
        };
        assert_eq!(
            second.decide(Some(&target_zones("corporate"))),
            ProvenanceDecision::Skip {
                owners: set(&["corporate"])
            }
        );
    }

    #[test]
    fn test_decide_without_deletions_rezones() {
        let all = set(&["corporate", "internal"]);
        let none = BTreeSet::new();
        let precedence = Precedence {
            zone_id: "AUTH.EXT.corporate",
            all_ids: &all,
            visited_ids: &none,
            allow_deletions: false,
        };
        let zones = target_zones("internal");
        assert_eq!(
            precedence.decide(Some(&zones)),
            ProvenanceDecision::Rezone { from: zones.clone() }
        );
    }
}
