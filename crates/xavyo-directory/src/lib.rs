//! # Directory Client
//!
//! Paged, resumable access to LDAP directories for identity synchronization.
//!
//! This crate reads users and groups out of a directory source and hands them
//! to the synchronizer as [`DirectoryEntry`] values.
//!
//! ## Features
//!
//! - Paged searches with transparent reconnect-and-resume
//! - Member resolution, including ranged attribute retrieval
//! - Pluggable attribute value mappers (SIDs, avatars)
//! - Account status interpreters
//! - An in-memory directory for tests
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use xavyo_directory::{ConnectionSettings, LdapRegistryConfig, LdapSessionProvider, LdapUserRegistry};
//!
//! let connection = ConnectionSettings::new("ldaps://ldap.example.com")
//!     .with_credentials("cn=sync,dc=example,dc=com", "secret");
//! let config = LdapRegistryConfig::new(
//!     connection.clone(),
//!     "ou=groups,dc=example,dc=com",
//!     "ou=users,dc=example,dc=com",
//! );
//! let registry = LdapUserRegistry::new(config, Arc::new(LdapSessionProvider::new(connection)))?;
//! let mut persons = registry.persons(None).await?;
//! while let Some(person) = persons.next_entry().await? {
//!     println!("{}", person.id());
//! }
//! ```

pub mod config;
pub mod cursor;
pub mod dn;
pub mod entry;
pub mod error;
pub mod interpreter;
pub mod ldap;
pub mod mapper;
pub mod memory;
pub mod registry;
pub mod session;

// Re-exports
pub use config::{ConnectionSettings, LdapRegistryConfig};
pub use cursor::{collect_entries, EntryCursor, EntrySource, RowMapper};
pub use dn::DistinguishedName;
pub use entry::{
    props, short_name, AuthorityKind, AvatarBlob, DirectoryEntry, PropertyMap, PropertyValue,
    RawEntry, RawValue, GROUP_PREFIX,
};
pub use error::{DirectoryError, DirectoryResult};
pub use interpreter::{
    ActiveDirectoryAccountInterpreter, LdapAccountInterpreter, UserAccountInterpreter,
};
pub use ldap::{LdapSession, LdapSessionProvider};
pub use mapper::{AttributeValueMapper, AvatarAttributeMapper, MapperRegistry, SidAttributeMapper};
pub use registry::{LdapUserRegistry, RegistryCapabilities, TenantScope, UserRegistry};
pub use session::{DirectorySession, PageCookie, SearchPage, SearchRequest, SessionProvider};
