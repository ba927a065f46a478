//! # Directory Synchronization
//!
//! Multi-tenant, provenance-aware synchronization of users and groups from
//! chained directory sources into a local identity store.
//!
//! Sources are processed in precedence order. Every authority a source
//! creates is tagged with the source's zone, so a higher priority source
//! keeps ownership of users and groups that several sources return.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐     ┌──────────────┐     ┌───────────────┐
//! │ Directory source│────►│Group analysis│────►│ Mutation set  │
//! │ (EntrySource)   │     │  (phase 1)   │     │               │
//! └─────────────────┘     └──────────────┘     └───────┬───────┘
//!                                                      │
//!                         ┌────────────────────────────┼──────────────┐
//!                         ▼                            ▼              ▼
//!                  ┌─────────────┐            ┌──────────────┐ ┌─────────────┐
//!                  │ Group apply │            │ Person upsert│ │  Authority  │
//!                  │ (phase 2-3) │            │  (phase 4-5) │ │  deletion   │
//!                  └──────┬──────┘            └──────┬───────┘ └──────┬──────┘
//!                         └──────────────────────────┼────────────────┘
//!                                                    ▼
//!                                           ┌────────────────┐
//!                                           │ Identity store │
//!                                           └────────────────┘
//! ```
//!
//! ## Features
//!
//! - **Precedence**: zone-based ownership across a chain of sources
//! - **Batching**: bounded concurrent batches, one transaction each
//! - **Checkpoints**: monotonic per-source watermarks and run status
//! - **Locking**: one run per tenant, heartbeat-refreshed, cancelled on loss
//! - **Login support**: differential sync and auto-creation for unknown users
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use xavyo_directory_sync::{ChainingSynchronizer, SourceRegistry, SynchronizerConfig};
//!
//! let sources = SourceRegistry::new().with_source("corporate-ldap", Arc::new(registry));
//! let synchronizer = ChainingSynchronizer::new(
//!     SynchronizerConfig::from_env()?,
//!     identity_store,
//!     checkpoint_store,
//!     lock_service,
//!     sources,
//! )?;
//!
//! // Scheduled full synchronization of the default tenant
//! synchronizer.synchronize("", true, true).await?;
//! ```

pub mod analyzer;
pub mod batch;
pub mod checkpoint;
pub mod config;
pub mod containment;
pub mod context;
pub mod error;
pub mod lock;
pub mod memory;
pub mod mutation;
pub mod phase;
pub mod provenance;
pub mod sources;
pub mod store;
pub mod synchronizer;
pub mod workers;

// Re-exports
pub use batch::{BatchProcessor, BatchWorker, EntryWorkProvider, VecWorkProvider, WorkProvider};
pub use checkpoint::{CheckpointStore, CheckpointValue, StatusTracker, SyncStatus, WatermarkKind};
pub use config::{ConfigError, SynchronizerConfig};
pub use context::{qualify_user, SyncContext, DEFAULT_TENANT};
pub use error::{LockError, LockResult, StoreError, StoreResult, SyncError, SyncResult};
pub use lock::{lock_name, LockHeartbeat, LockPolicy, LockService, LockToken};
pub use phase::SyncPhase;
pub use provenance::{
    target_zones, zone_id, ProvenanceDecision, SourceScope, ZONE_APP_DEFAULT, ZONE_AUTH_ALF,
};
pub use sources::{RegisteredSource, SourceRegistry};
pub use store::{IdentityStore, StoreTransaction};
pub use synchronizer::{ChainingSynchronizer, SyncCounts, SynchronizeDiagnostic};
