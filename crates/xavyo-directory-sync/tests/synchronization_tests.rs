//! End-to-end synchronization runs against an in-memory directory.
//!
//! These tests verify:
//! - First and differential runs
//! - Idempotence of repeated full runs
//! - Pagination and resume after a lost connection
//! - Watermark monotonicity
//! - Deletion versus neutral re-zoning
//! - Tenant qualification
//! - Account status from the controlling source

mod common;

use std::collections::BTreeSet;
use std::sync::Arc;

use common::*;
use xavyo_directory::memory::InMemoryDirectory;
use xavyo_directory::{
    props, ActiveDirectoryAccountInterpreter, LdapUserRegistry, PropertyValue,
};
use xavyo_directory_sync::{
    target_zones, SourceRegistry, SyncStatus, SynchronizerConfig, ZONE_APP_DEFAULT, ZONE_AUTH_ALF,
};

fn set(values: &[&str]) -> BTreeSet<String> {
    values.iter().map(|v| v.to_string()).collect()
}

#[tokio::test]
async fn test_first_full_sync_creates_group_and_member() {
    let directory = InMemoryDirectory::new();
    directory.add_entry(group("Development", &["mmustermann"], "20240301120000Z"));
    directory.add_entry(person("mmustermann", "20240101000000Z"));
    let h = single_source(&directory);

    h.synchronizer.synchronize("", true, true).await.unwrap();

    assert_eq!(h.store.members("GROUP_Development"), set(&["mmustermann"]));
    assert_eq!(h.store.zones("GROUP_Development"), Some(target_zones("ldap1")));
    assert_eq!(
        h.store.display_name("GROUP_Development").as_deref(),
        Some("Development team")
    );
    let person = h.store.person("mmustermann").unwrap();
    assert_eq!(
        person.get(props::EMAIL),
        Some(&PropertyValue::from("mmustermann@example.com"))
    );

    let status = h.synchronizer.status("");
    assert_eq!(
        status.last_group_update("ldap1").await.unwrap(),
        Some(ts("20240301120000Z"))
    );
    assert_eq!(
        status.last_user_update("ldap1").await.unwrap(),
        Some(ts("20240101000000Z"))
    );
    assert_eq!(status.sync_status().await.unwrap(), Some(SyncStatus::Complete));
    assert_eq!(
        status.sync_summary().await.unwrap().as_deref(),
        Some("1 user(s) and 1 group(s) processed")
    );
}

#[tokio::test]
async fn test_differential_sync_of_unchanged_directory_is_a_no_op() {
    let directory = InMemoryDirectory::new();
    directory.add_entry(group("Development", &["mmustermann"], "20240301120000Z"));
    directory.add_entry(person("mmustermann", "20240101000000Z"));
    let h = single_source(&directory);
    h.synchronizer.synchronize("", true, true).await.unwrap();
    let mutations = h.store.mutations();

    h.synchronizer.synchronize("", false, false).await.unwrap();

    assert_eq!(h.store.mutations(), mutations);
    let log = directory.search_log();
    assert!(log
        .iter()
        .any(|filter| filter.contains("modifyTimestamp<=20240301120000Z")));
    assert!(log
        .iter()
        .any(|filter| filter.contains("modifyTimestamp<=20240101000000Z")));
    assert_eq!(
        h.synchronizer
            .status("")
            .source_summary("ldap1")
            .await
            .unwrap()
            .as_deref(),
        Some("0 user(s) and 0 group(s) processed")
    );
}

#[tokio::test]
async fn test_differential_sync_picks_up_changes() {
    let directory = InMemoryDirectory::new();
    directory.add_entry(group("Development", &["alice"], "20240301120000Z"));
    directory.add_entry(person("alice", "20240101000000Z"));
    directory.add_entry(person("bob", "20240101000000Z"));
    let h = single_source(&directory);
    h.synchronizer.synchronize("", true, true).await.unwrap();

    directory.add_entry(group("Development", &["bob"], "20240401000000Z"));
    let mut bob = person("bob", "20240402000000Z");
    bob.attrs
        .insert("mail".to_string(), vec!["robert@example.com".to_string()]);
    directory.add_entry(bob);
    h.synchronizer.synchronize("", false, false).await.unwrap();

    assert_eq!(h.store.members("GROUP_Development"), set(&["bob"]));
    assert_eq!(
        h.store.person("bob").unwrap().get(props::EMAIL),
        Some(&PropertyValue::from("robert@example.com"))
    );
    let status = h.synchronizer.status("");
    assert_eq!(
        status.last_group_update("ldap1").await.unwrap(),
        Some(ts("20240401000000Z"))
    );
    assert_eq!(
        status.last_user_update("ldap1").await.unwrap(),
        Some(ts("20240402000000Z"))
    );
}

#[tokio::test]
async fn test_repeated_full_sync_is_idempotent() {
    let directory = InMemoryDirectory::new();
    directory.add_entry(group("Development", &["alice", "cn=QA"], "20240301120000Z"));
    directory.add_entry(group("QA", &["bob"], "20240201000000Z"));
    directory.add_entry(person("alice", "20240101000000Z"));
    directory.add_entry(person("bob", "20240102000000Z"));
    let h = single_source(&directory);

    h.synchronizer.synchronize("", true, true).await.unwrap();
    let mutations = h.store.mutations();
    let status = h.synchronizer.status("");
    let watermarks = (
        status.last_group_update("ldap1").await.unwrap(),
        status.last_user_update("ldap1").await.unwrap(),
    );

    h.synchronizer.synchronize("", true, true).await.unwrap();

    assert_eq!(h.store.mutations(), mutations);
    assert_eq!(
        (
            status.last_group_update("ldap1").await.unwrap(),
            status.last_user_update("ldap1").await.unwrap(),
        ),
        watermarks
    );
    assert_eq!(h.store.members("GROUP_Development"), set(&["GROUP_QA", "alice"]));
}

#[tokio::test]
async fn test_paged_person_query_yields_every_person() {
    let directory = InMemoryDirectory::new();
    for i in 0..250 {
        directory.add_entry(person(&format!("user{i:03}"), "20240101000000Z"));
    }
    let mut config = registry_config();
    config.enable_progress_estimation = false;
    let h = Harness::new(
        SourceRegistry::new().with_source("ldap1", registry_with(&directory, config)),
    );

    h.synchronizer.synchronize("", true, false).await.unwrap();

    assert_eq!(h.store.person_count_in(""), 250);
    let person_pages = directory
        .search_log()
        .iter()
        .filter(|filter| filter.as_str() == "(objectclass=inetOrgPerson)")
        .count();
    assert_eq!(person_pages, 3);
}

#[tokio::test]
async fn test_lost_connection_resumes_without_duplicates() {
    let directory = InMemoryDirectory::new();
    for i in 0..250 {
        directory.add_entry(person(&format!("user{i:03}"), "20240101000000Z"));
    }
    // Calls: group count, group page, person page 1, person page 2.
    directory.fail_search_call(4);
    let mut config = registry_config();
    config.enable_progress_estimation = false;
    let h = Harness::new(
        SourceRegistry::new().with_source("ldap1", registry_with(&directory, config)),
    );

    h.synchronizer.synchronize("", true, false).await.unwrap();

    assert_eq!(h.store.person_count_in(""), 250);
    assert_eq!(h.store.mutations(), 250);
    assert!(directory.sessions_opened() >= 2);
    assert_eq!(
        h.synchronizer.status("").source_status("ldap1").await.unwrap(),
        Some(SyncStatus::Complete)
    );
}

#[tokio::test]
async fn test_watermark_never_decreases() {
    let directory = InMemoryDirectory::new();
    directory.add_entry(group("Development", &[], "20240301120000Z"));
    directory.add_entry(group("QA", &[], "20240201000000Z"));
    directory.add_entry(person("alice", "20240105000000Z"));
    let h = single_source(&directory);

    h.synchronizer.synchronize("", true, true).await.unwrap();
    let status = h.synchronizer.status("");
    assert_eq!(
        status.last_group_update("ldap1").await.unwrap(),
        Some(ts("20240301120000Z"))
    );

    // Entries reported with older timestamps on a forced run.
    directory.add_entry(group("Development", &[], "20230101000000Z"));
    directory.add_entry(group("QA", &[], "20230101000000Z"));
    directory.add_entry(person("alice", "20230101000000Z"));
    h.synchronizer.synchronize("", true, true).await.unwrap();

    assert_eq!(
        status.last_group_update("ldap1").await.unwrap(),
        Some(ts("20240301120000Z"))
    );
    assert_eq!(
        status.last_user_update("ldap1").await.unwrap(),
        Some(ts("20240105000000Z"))
    );
}

fn deletion_directory() -> InMemoryDirectory {
    let directory = InMemoryDirectory::new();
    directory.add_entry(group("kept", &["alice"], "20240101000000Z"));
    directory.add_entry(group("old", &["bob"], "20240101000000Z"));
    directory.add_entry(person("alice", "20240101000000Z"));
    directory.add_entry(person("bob", "20240101000000Z"));
    directory
}

#[tokio::test]
async fn test_full_sync_deletes_authorities_gone_from_source() {
    let directory = deletion_directory();
    let h = single_source(&directory);
    h.synchronizer.synchronize("", true, true).await.unwrap();

    directory.remove_entry(&group_dn("old"));
    directory.remove_entry(&user_dn("bob"));
    h.synchronizer.synchronize("", true, true).await.unwrap();

    let names = h.store.authority_names();
    assert!(!names.contains(&"GROUP_old".to_string()));
    assert!(h.store.person("bob").is_none());
    assert!(h.store.person("alice").is_some());
    assert_eq!(
        h.synchronizer
            .status("")
            .source_summary("ldap1")
            .await
            .unwrap()
            .as_deref(),
        Some("2 user(s) and 2 group(s) processed")
    );
}

#[tokio::test]
async fn test_differential_sync_never_deletes() {
    let directory = deletion_directory();
    let h = single_source(&directory);
    h.synchronizer.synchronize("", true, true).await.unwrap();

    directory.remove_entry(&group_dn("old"));
    h.synchronizer.synchronize("", false, false).await.unwrap();

    assert!(h.store.authority_names().contains(&"GROUP_old".to_string()));
}

#[tokio::test]
async fn test_disallowed_deletions_move_authorities_to_neutral_zone() {
    let directory = deletion_directory();
    let config = SynchronizerConfig {
        allow_deletions: false,
        ..SynchronizerConfig::default()
    };
    let h = Harness::with(
        SourceRegistry::new().with_source("ldap1", registry(&directory)),
        config,
        xavyo_directory_sync::memory::InMemoryIdentityStore::new(),
    );
    h.synchronizer.synchronize("", true, true).await.unwrap();

    directory.remove_entry(&group_dn("old"));
    directory.remove_entry(&user_dn("bob"));
    h.synchronizer.synchronize("", true, true).await.unwrap();

    let neutral = set(&[ZONE_APP_DEFAULT, ZONE_AUTH_ALF]);
    assert_eq!(h.store.zones("GROUP_old"), Some(neutral.clone()));
    assert_eq!(h.store.zones("bob"), Some(neutral));
    assert!(h.store.person("bob").is_some());
}

#[tokio::test]
async fn test_tenant_users_are_qualified() {
    let directory = InMemoryDirectory::new();
    directory.add_entry(group("dev", &["alice"], "20240101000000Z"));
    directory.add_entry(person("alice", "20240101000000Z"));
    let h = Harness::new(
        SourceRegistry::new().with_source("acme-ldap", tenant_registry(&directory, &["acme.com"])),
    );

    h.synchronizer.synchronize("acme.com", true, true).await.unwrap();

    assert!(h.store.person_in("acme.com", "alice@acme.com").is_some());
    assert_eq!(
        h.store.members_in("acme.com", "GROUP_dev"),
        set(&["alice@acme.com"])
    );
    assert!(h.store.authority_names().is_empty());

    let keys: Vec<Vec<String>> = h.checkpoints.snapshot().into_keys().collect();
    assert!(keys.iter().all(|key| key[0] == ".TenantAwareChainingUserRegistrySynchronizer"
        && key[1] == "acme.com"));

    // A second full run keeps the qualified names.
    let mutations = h.store.mutations();
    h.synchronizer.synchronize("acme.com", true, true).await.unwrap();
    assert_eq!(h.store.mutations(), mutations);
}

#[tokio::test]
async fn test_account_status_follows_controlling_source() {
    let directory = InMemoryDirectory::new();
    directory.add_entry(person("alice", "20240101000000Z").with_attr("userAccountControl", ["512"]));
    directory.add_entry(person("bob", "20240101000000Z").with_attr("userAccountControl", ["514"]));
    let mut config = registry_config();
    config
        .person_attribute_mapping
        .insert(props::ACCOUNT_STATUS.to_string(), "userAccountControl".to_string());
    let registry = LdapUserRegistry::new(config, Arc::new(directory.clone()))
        .unwrap()
        .with_account_interpreter(Arc::new(ActiveDirectoryAccountInterpreter));
    let h = Harness::with(
        SourceRegistry::new().with_source("ldap1", Arc::new(registry)),
        SynchronizerConfig::default().with_external_user_control("", "ldap1"),
        xavyo_directory_sync::memory::InMemoryIdentityStore::new(),
    );

    h.synchronizer.synchronize("", true, true).await.unwrap();

    let alice = h.store.person("alice").unwrap();
    let bob = h.store.person("bob").unwrap();
    assert_eq!(alice.get(props::ENABLED), Some(&PropertyValue::Boolean(true)));
    assert_eq!(bob.get(props::ENABLED), Some(&PropertyValue::Boolean(false)));
    assert!(bob.get(props::ACCOUNT_STATUS).is_none());
}
