//! Watermarks and run status.
//!
//! Synchronization state lives in an external attribute store under a
//! per-tenant root. Each source has a `GROUP` and a `PERSON` watermark that
//! scopes differential queries, plus status, summary and last error
//! attributes reported to operators.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::context::is_default_tenant;
use crate::error::StoreResult;

const ROOT_DEFAULT: &str = ".ChainingUserRegistrySynchronizer";
const ROOT_TENANT: &str = ".TenantAwareChainingUserRegistrySynchronizer";

const START_TIME: &str = "START_TIME";
const END_TIME: &str = "END_TIME";
const LAST_RUN_HOST: &str = "LAST_RUN_HOST";
const STATUS: &str = "STATUS";
const LAST_ERROR: &str = "LAST_ERROR";
const SUMMARY: &str = "SUMMARY";

/// A stored attribute value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CheckpointValue {
    Int(i64),
    Text(String),
}

impl CheckpointValue {
    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            CheckpointValue::Int(v) => Some(*v),
            CheckpointValue::Text(s) => s.parse().ok(),
        }
    }

    #[must_use]
    pub fn as_text(&self) -> String {
        match self {
            CheckpointValue::Int(v) => v.to_string(),
            CheckpointValue::Text(s) => s.clone(),
        }
    }
}

/// Hierarchical key/value attribute store.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn get(&self, key: &[String]) -> StoreResult<Option<CheckpointValue>>;

    async fn set(&self, key: &[String], value: CheckpointValue) -> StoreResult<()>;

    /// Remove `prefix` and every key below it.
    async fn remove(&self, prefix: &[String]) -> StoreResult<()>;
}

/// Status of a run or of one source within it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncStatus {
    Waiting,
    InProgress,
    Complete,
    CompleteError,
}

impl SyncStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Waiting => "WAITING",
            SyncStatus::InProgress => "IN_PROGRESS",
            SyncStatus::Complete => "COMPLETE",
            SyncStatus::CompleteError => "COMPLETE_ERROR",
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for SyncStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "WAITING" => Ok(SyncStatus::Waiting),
            "IN_PROGRESS" => Ok(SyncStatus::InProgress),
            "COMPLETE" => Ok(SyncStatus::Complete),
            "COMPLETE_ERROR" => Ok(SyncStatus::CompleteError),
            _ => Err(format!("Unknown sync status: {s}")),
        }
    }
}

/// Entity class a watermark applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WatermarkKind {
    Group,
    Person,
}

impl WatermarkKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            WatermarkKind::Group => "GROUP",
            WatermarkKind::Person => "PERSON",
        }
    }
}

fn millis_to_time(millis: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis).single()
}

/// Reads and writes the status attributes of one tenant.
#[derive(Clone)]
pub struct StatusTracker {
    store: Arc<dyn CheckpointStore>,
    tenant: String,
}

impl fmt::Debug for StatusTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatusTracker")
            .field("tenant", &self.tenant)
            .finish_non_exhaustive()
    }
}

impl StatusTracker {
    pub fn new(store: Arc<dyn CheckpointStore>, tenant: impl Into<String>) -> Self {
        Self {
            store,
            tenant: tenant.into(),
        }
    }

    /// Key of a tenant attribute, or of a source attribute when `source` is set.
    #[must_use]
    pub fn key(&self, attribute: &str, source: Option<&str>) -> Vec<String> {
        let mut key = Vec::with_capacity(4);
        if is_default_tenant(&self.tenant) {
            key.push(ROOT_DEFAULT.to_string());
        } else {
            key.push(ROOT_TENANT.to_string());
            key.push(self.tenant.clone());
        }
        key.push(attribute.to_string());
        if let Some(source) = source {
            key.push(source.to_string());
        }
        key
    }

    async fn set_text(&self, attribute: &str, source: Option<&str>, value: &str) -> StoreResult<()> {
        self.store
            .set(&self.key(attribute, source), CheckpointValue::Text(value.to_string()))
            .await
    }

    async fn set_status(&self, source: Option<&str>, status: SyncStatus) -> StoreResult<()> {
        self.set_text(STATUS, source, status.as_str()).await
    }

    async fn get_text(&self, attribute: &str, source: Option<&str>) -> StoreResult<Option<String>> {
        Ok(self
            .store
            .get(&self.key(attribute, source))
            .await?
            .map(|v| v.as_text()))
    }

    async fn get_time(&self, attribute: &str, source: Option<&str>) -> StoreResult<Option<DateTime<Utc>>> {
        Ok(self
            .store
            .get(&self.key(attribute, source))
            .await?
            .and_then(|v| v.as_i64())
            .filter(|millis| *millis >= 0)
            .and_then(millis_to_time))
    }

    /// Mark the run started and every active source waiting.
    pub async fn run_started(&self, host: &str, sources: &BTreeSet<String>) -> StoreResult<()> {
        let now = Utc::now().timestamp_millis();
        self.store.remove(&self.key(LAST_ERROR, None)).await?;
        self.store.remove(&self.key(SUMMARY, None)).await?;
        self.store.remove(&self.key(STATUS, None)).await?;
        self.store
            .set(&self.key(START_TIME, None), CheckpointValue::Int(now))
            .await?;
        self.store
            .set(&self.key(END_TIME, None), CheckpointValue::Int(-1))
            .await?;
        self.set_text(LAST_RUN_HOST, None, host).await?;
        self.set_status(None, SyncStatus::InProgress).await?;
        for source in sources {
            self.set_status(Some(source), SyncStatus::Waiting).await?;
        }
        Ok(())
    }

    pub async fn source_started(&self, source: &str) -> StoreResult<()> {
        self.set_status(Some(source), SyncStatus::InProgress).await?;
        self.store.remove(&self.key(SUMMARY, Some(source))).await
    }

    pub async fn source_completed(&self, source: &str, summary: &str) -> StoreResult<()> {
        self.set_status(Some(source), SyncStatus::Complete).await?;
        self.store.remove(&self.key(LAST_ERROR, Some(source))).await?;
        self.set_text(SUMMARY, Some(source), summary).await
    }

    pub async fn source_failed(&self, source: &str, error: &str) -> StoreResult<()> {
        self.set_status(Some(source), SyncStatus::CompleteError).await?;
        self.set_text(LAST_ERROR, Some(source), error).await
    }

    pub async fn run_completed(&self, summary: &str) -> StoreResult<()> {
        self.set_status(None, SyncStatus::Complete).await?;
        self.set_text(SUMMARY, None, summary).await?;
        self.store
            .set(
                &self.key(END_TIME, None),
                CheckpointValue::Int(Utc::now().timestamp_millis()),
            )
            .await
    }

    pub async fn run_failed(&self, error: &str) -> StoreResult<()> {
        self.set_text(LAST_ERROR, None, error).await?;
        self.set_status(None, SyncStatus::CompleteError).await?;
        self.store
            .set(
                &self.key(END_TIME, None),
                CheckpointValue::Int(Utc::now().timestamp_millis()),
            )
            .await
    }

    /// Watermark of `source` for one entity class.
    pub async fn watermark(
        &self,
        kind: WatermarkKind,
        source: &str,
    ) -> StoreResult<Option<DateTime<Utc>>> {
        self.get_time(kind.as_str(), Some(source)).await
    }

    /// Raise the watermark to `observed`; lower or non-positive values are ignored.
    ///
    /// Returns whether the stored value changed.
    pub async fn advance_watermark(
        &self,
        kind: WatermarkKind,
        source: &str,
        observed: i64,
    ) -> StoreResult<bool> {
        if observed <= 0 {
            return Ok(false);
        }
        let key = self.key(kind.as_str(), Some(source));
        let current = self.store.get(&key).await?.and_then(|v| v.as_i64());
        if current.is_some_and(|current| current >= observed) {
            return Ok(false);
        }
        debug!(
            tenant = %self.tenant,
            source = %source,
            kind = kind.as_str(),
            watermark = observed,
            "Advancing watermark"
        );
        self.store.set(&key, CheckpointValue::Int(observed)).await?;
        Ok(true)
    }

    pub async fn sync_start_time(&self) -> StoreResult<Option<DateTime<Utc>>> {
        self.get_time(START_TIME, None).await
    }

    /// End of the last run, `None` while a run is in progress.
    pub async fn sync_end_time(&self) -> StoreResult<Option<DateTime<Utc>>> {
        self.get_time(END_TIME, None).await
    }

    pub async fn last_run_on_server(&self) -> StoreResult<Option<String>> {
        self.get_text(LAST_RUN_HOST, None).await
    }

    pub async fn sync_status(&self) -> StoreResult<Option<SyncStatus>> {
        Ok(self
            .get_text(STATUS, None)
            .await?
            .and_then(|s| s.parse().ok()))
    }

    pub async fn sync_summary(&self) -> StoreResult<Option<String>> {
        self.get_text(SUMMARY, None).await
    }

    pub async fn sync_last_error(&self) -> StoreResult<Option<String>> {
        self.get_text(LAST_ERROR, None).await
    }

    pub async fn source_status(&self, source: &str) -> StoreResult<Option<SyncStatus>> {
        Ok(self
            .get_text(STATUS, Some(source))
            .await?
            .and_then(|s| s.parse().ok()))
    }

    pub async fn source_last_error(&self, source: &str) -> StoreResult<Option<String>> {
        self.get_text(LAST_ERROR, Some(source)).await
    }

    pub async fn source_summary(&self, source: &str) -> StoreResult<Option<String>> {
        self.get_text(SUMMARY, Some(source)).await
    }

    pub async fn last_user_update(&self, source: &str) -> StoreResult<Option<DateTime<Utc>>> {
        self.watermark(WatermarkKind::Person, source).await
    }

    pub async fn last_group_update(&self, source: &str) -> StoreResult<Option<DateTime<Utc>>> {
        self.watermark(WatermarkKind::Group, source).await
    }
}
