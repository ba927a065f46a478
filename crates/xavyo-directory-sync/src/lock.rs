//! Cluster-wide synchronization lock.
//!
//! One run per tenant holds a named, time-boxed lock for its whole
//! duration. A heartbeat task refreshes it at half its lifetime and cancels
//! the run when a refresh fails.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::context::is_default_tenant;
use crate::error::LockResult;

const LOCK_NAME: &str = "ChainingUserRegistrySynchronizer";
const LOGIN_RETRIES: u32 = 10;

/// Name of the synchronization lock of `tenant`.
pub fn lock_name(tenant: &str) -> String {
    if is_default_tenant(tenant) {
        LOCK_NAME.to_string()
    } else {
        format!("{LOCK_NAME}@{tenant}")
    }
}

/// Proof of lock ownership.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken {
    pub name: String,
    pub id: Uuid,
}

impl LockToken {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id: Uuid::new_v4(),
        }
    }
}

/// Distributed lock service.
#[async_trait]
pub trait LockService: Send + Sync {
    /// Take the lock, trying `1 + retries` times with `wait` between attempts.
    async fn acquire(
        &self,
        name: &str,
        ttl: Duration,
        wait: Duration,
        retries: u32,
    ) -> LockResult<LockToken>;

    /// Extend the lock for another `ttl`.
    async fn refresh(&self, token: &LockToken, ttl: Duration) -> LockResult<()>;

    async fn release(&self, token: &LockToken) -> LockResult<()>;
}

/// How hard a run tries to get the lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockPolicy {
    pub wait: Duration,
    pub retries: u32,
}

impl LockPolicy {
    /// Scheduled runs give up almost immediately.
    pub fn scheduled() -> Self {
        Self {
            wait: Duration::ZERO,
            retries: 1,
        }
    }

    /// Login-triggered runs wait for a concurrent run to finish.
    pub fn login(ttl: Duration) -> Self {
        Self {
            wait: ttl,
            retries: LOGIN_RETRIES,
        }
    }
}

/// Background refresh of a held lock.
pub struct LockHeartbeat {
    stop: CancellationToken,
    handle: JoinHandle<()>,
}

impl fmt::Debug for LockHeartbeat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockHeartbeat")
            .field("stopped", &self.stop.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl LockHeartbeat {
    /// Refresh `token` every `ttl / 2`; cancel `run` when a refresh fails.
    pub fn start(
        service: Arc<dyn LockService>,
        token: LockToken,
        ttl: Duration,
        run: CancellationToken,
    ) -> Self {
        let stop = CancellationToken::new();
        let stopped = stop.clone();
        let period = ttl / 2;

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stopped.cancelled() => break,
                    _ = tokio::time::sleep(period) => {
                        match service.refresh(&token, ttl).await {
                            Ok(()) => debug!(lock = %token.name, "Refreshed synchronization lock"),
                            Err(e) => {
                                warn!(lock = %token.name, error = %e, "Synchronization lock lost");
                                run.cancel();
                                break;
                            }
                        }
                    }
                }
            }
        });

        Self { stop, handle }
    }

    /// Stop refreshing and wait for the task to exit.
    pub async fn stop(self) {
        self.stop.cancel();
        if let Err(e) = self.handle.await {
            warn!(error = %e, "Lock heartbeat task failed");
        }
    }
}
