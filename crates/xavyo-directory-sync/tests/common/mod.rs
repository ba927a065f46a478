//! Common test utilities for xavyo-directory-sync integration tests.

#![allow(dead_code)]

use std::sync::{Arc, Once};

use chrono::{DateTime, NaiveDateTime, Utc};
use xavyo_directory::memory::InMemoryDirectory;
use xavyo_directory::{
    ConnectionSettings, LdapRegistryConfig, LdapUserRegistry, RawEntry, TenantScope, UserRegistry,
};
use xavyo_directory_sync::memory::{
    InMemoryCheckpointStore, InMemoryIdentityStore, InMemoryLockService,
};
use xavyo_directory_sync::{ChainingSynchronizer, SourceRegistry, SynchronizerConfig};

pub const USERS: &str = "ou=users,dc=example,dc=com";
pub const GROUPS: &str = "ou=groups,dc=example,dc=com";

static TRACING: Once = Once::new();

/// Route logs through the test writer; `RUST_LOG` selects the level.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Parse a directory timestamp such as `20240101000000Z`.
pub fn ts(value: &str) -> DateTime<Utc> {
    NaiveDateTime::parse_from_str(value, "%Y%m%d%H%M%SZ")
        .unwrap()
        .and_utc()
}

pub fn user_dn(uid: &str) -> String {
    format!("uid={uid},{USERS}")
}

pub fn group_dn(cn: &str) -> String {
    format!("cn={cn},{GROUPS}")
}

/// Test data factory for directory persons.
pub fn person(uid: &str, timestamp: &str) -> RawEntry {
    RawEntry::new(user_dn(uid))
        .with_attr("objectClass", ["inetOrgPerson"])
        .with_attr("uid", [uid])
        .with_attr("givenName", [format!("{uid}-first")])
        .with_attr("sn", [format!("{uid}-last")])
        .with_attr("mail", [format!("{uid}@example.com")])
        .with_attr("modifyTimestamp", [timestamp])
}

/// Test data factory for directory groups; `members` are uids or `cn=` names
/// of other groups.
pub fn group(cn: &str, members: &[&str], timestamp: &str) -> RawEntry {
    let members: Vec<String> = members
        .iter()
        .map(|m| match m.strip_prefix("cn=") {
            Some(group) => group_dn(group),
            None => user_dn(m),
        })
        .collect();
    let entry = RawEntry::new(group_dn(cn))
        .with_attr("objectClass", ["groupOfNames"])
        .with_attr("cn", [cn])
        .with_attr("description", [format!("{cn} team")])
        .with_attr("modifyTimestamp", [timestamp]);
    if members.is_empty() {
        entry
    } else {
        entry.with_attr("member", members)
    }
}

pub fn registry_config() -> LdapRegistryConfig {
    LdapRegistryConfig::new(
        ConnectionSettings::new("ldap://ldap.example.com"),
        GROUPS,
        USERS,
    )
    .with_query_batch_size(100)
}

pub fn registry(directory: &InMemoryDirectory) -> Arc<dyn UserRegistry> {
    registry_with(directory, registry_config())
}

pub fn registry_with(directory: &InMemoryDirectory, config: LdapRegistryConfig) -> Arc<dyn UserRegistry> {
    Arc::new(LdapUserRegistry::new(config, Arc::new(directory.clone())).unwrap())
}

/// A registry serving only the given tenants.
pub fn tenant_registry(directory: &InMemoryDirectory, tenants: &[&str]) -> Arc<dyn UserRegistry> {
    let scope = TenantScope::Only(tenants.iter().map(|t| t.to_string()).collect());
    Arc::new(
        LdapUserRegistry::new(registry_config(), Arc::new(directory.clone()))
            .unwrap()
            .with_tenant_scope(scope),
    )
}

/// The synchronizer and the in-memory collaborators it writes to.
pub struct Harness {
    pub store: InMemoryIdentityStore,
    pub checkpoints: InMemoryCheckpointStore,
    pub locks: InMemoryLockService,
    pub synchronizer: ChainingSynchronizer,
}

impl Harness {
    pub fn new(sources: SourceRegistry) -> Self {
        Self::with(sources, SynchronizerConfig::default(), InMemoryIdentityStore::new())
    }

    pub fn with(
        sources: SourceRegistry,
        config: SynchronizerConfig,
        store: InMemoryIdentityStore,
    ) -> Self {
        Self::sharing(
            sources,
            config,
            store,
            InMemoryCheckpointStore::new(),
            InMemoryLockService::new(),
        )
    }

    /// A harness over existing collaborators, e.g. to change the source chain
    /// between runs.
    pub fn sharing(
        sources: SourceRegistry,
        config: SynchronizerConfig,
        store: InMemoryIdentityStore,
        checkpoints: InMemoryCheckpointStore,
        locks: InMemoryLockService,
    ) -> Self {
        init_tracing();
        let synchronizer = ChainingSynchronizer::new(
            config,
            Arc::new(store.clone()),
            Arc::new(checkpoints.clone()),
            Arc::new(locks.clone()),
            sources,
        )
        .unwrap()
        .with_host_name("test-host");
        Self {
            store,
            checkpoints,
            locks,
            synchronizer,
        }
    }

    /// Same collaborators, different source chain or configuration.
    pub fn rebuild(&self, sources: SourceRegistry, config: SynchronizerConfig) -> Self {
        Self::sharing(
            sources,
            config,
            self.store.clone(),
            self.checkpoints.clone(),
            self.locks.clone(),
        )
    }
}

/// Harness with a single shared source `ldap1` reading `directory`.
pub fn single_source(directory: &InMemoryDirectory) -> Harness {
    Harness::new(SourceRegistry::new().with_source("ldap1", registry(directory)))
}
