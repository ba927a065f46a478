//! Synchronizer configuration.

use std::collections::HashMap;
use std::env::VarError;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::context::DEFAULT_TENANT;

const DEFAULT_BATCH_SIZE: usize = 20;
const DEFAULT_WORKER_THREADS: usize = 2;
const DEFAULT_LOGGING_INTERVAL: usize = 100;
const DEFAULT_LOCK_TTL_SECS: u64 = 120;

/// Behavior of the chaining synchronizer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SynchronizerConfig {
    /// Delete stale authorities outright instead of moving them to the
    /// neutral zone.
    #[serde(default = "default_true")]
    pub allow_deletions: bool,

    /// Run the authority deletion phase on full syncs.
    #[serde(default = "default_true")]
    pub sync_delete: bool,

    /// Run a differential sync when an unknown person logs in.
    #[serde(default = "default_true")]
    pub sync_when_missing_people_log_in: bool,

    /// Create a plain person when an unknown user logs in and the
    /// directories did not provide one.
    #[serde(default = "default_true")]
    pub auto_create_people_on_login: bool,

    /// Concurrent batches per phase.
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,

    /// Units of work per transaction.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Log progress every this many processed units.
    #[serde(default = "default_logging_interval")]
    pub logging_interval: usize,

    /// Lifetime of the synchronization lock, refreshed at half this period.
    #[serde(default = "default_lock_ttl_secs")]
    pub lock_ttl_secs: u64,

    /// Tenants whose account status is owned by a directory source.
    #[serde(default)]
    pub external_user_control: HashMap<String, bool>,

    /// Per tenant, the source id authoritative for account status.
    #[serde(default)]
    pub external_user_control_subsystem_name: HashMap<String, String>,
}

fn default_true() -> bool {
    true
}

fn default_worker_threads() -> usize {
    DEFAULT_WORKER_THREADS
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_logging_interval() -> usize {
    DEFAULT_LOGGING_INTERVAL
}

fn default_lock_ttl_secs() -> u64 {
    DEFAULT_LOCK_TTL_SECS
}

impl Default for SynchronizerConfig {
    fn default() -> Self {
        Self {
            allow_deletions: true,
            sync_delete: true,
            sync_when_missing_people_log_in: true,
            auto_create_people_on_login: true,
            worker_threads: DEFAULT_WORKER_THREADS,
            batch_size: DEFAULT_BATCH_SIZE,
            logging_interval: DEFAULT_LOGGING_INTERVAL,
            lock_ttl_secs: DEFAULT_LOCK_TTL_SECS,
            external_user_control: HashMap::new(),
            external_user_control_subsystem_name: HashMap::new(),
        }
    }
}

impl SynchronizerConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_reader(|key| std::env::var(key))
    }

    /// Load configuration from a custom variable reader.
    ///
    /// Account control settings read from the environment apply to the
    /// default tenant; other tenants are configured with
    /// [`with_external_user_control`](Self::with_external_user_control).
    pub fn from_reader<F>(reader: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Result<String, VarError>,
    {
        let mut config = Self {
            allow_deletions: parse_var(&reader, "DIRECTORY_SYNC_ALLOW_DELETIONS", true)?,
            sync_delete: parse_var(&reader, "DIRECTORY_SYNC_DELETE", true)?,
            sync_when_missing_people_log_in: parse_var(
                &reader,
                "DIRECTORY_SYNC_WHEN_MISSING_PEOPLE_LOG_IN",
                true,
            )?,
            auto_create_people_on_login: parse_var(
                &reader,
                "DIRECTORY_SYNC_AUTO_CREATE_PEOPLE_ON_LOGIN",
                true,
            )?,
            worker_threads: parse_var(
                &reader,
                "DIRECTORY_SYNC_WORKER_THREADS",
                DEFAULT_WORKER_THREADS,
            )?,
            batch_size: parse_var(&reader, "DIRECTORY_SYNC_BATCH_SIZE", DEFAULT_BATCH_SIZE)?,
            logging_interval: parse_var(
                &reader,
                "DIRECTORY_SYNC_LOGGING_INTERVAL",
                DEFAULT_LOGGING_INTERVAL,
            )?,
            lock_ttl_secs: parse_var(&reader, "DIRECTORY_SYNC_LOCK_TTL_SECS", DEFAULT_LOCK_TTL_SECS)?,
            external_user_control: HashMap::new(),
            external_user_control_subsystem_name: HashMap::new(),
        };

        let external = parse_var(&reader, "DIRECTORY_SYNC_EXTERNAL_USER_CONTROL", false)?;
        if external {
            let subsystem = reader("DIRECTORY_SYNC_EXTERNAL_USER_CONTROL_SUBSYSTEM_NAME")
                .map_err(|_| {
                    ConfigError::MissingVar(
                        "DIRECTORY_SYNC_EXTERNAL_USER_CONTROL_SUBSYSTEM_NAME".into(),
                    )
                })?;
            config = config.with_external_user_control(DEFAULT_TENANT, subsystem);
        }

        config.validate()?;
        Ok(config)
    }

    /// Make `source_id` authoritative for account status in `tenant`.
    #[must_use]
    pub fn with_external_user_control(
        mut self,
        tenant: impl Into<String>,
        source_id: impl Into<String>,
    ) -> Self {
        let tenant = tenant.into();
        self.external_user_control.insert(tenant.clone(), true);
        self.external_user_control_subsystem_name
            .insert(tenant, source_id.into());
        self
    }

    /// Check the numeric settings.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_threads == 0 {
            return Err(ConfigError::InvalidValue(
                "worker_threads".into(),
                "must be at least 1".into(),
            ));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::InvalidValue(
                "batch_size".into(),
                "must be at least 1".into(),
            ));
        }
        if self.lock_ttl_secs < 2 {
            return Err(ConfigError::InvalidValue(
                "lock_ttl_secs".into(),
                "must be at least 2 seconds".into(),
            ));
        }
        Ok(())
    }

    /// Lock lifetime as a duration.
    #[must_use]
    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }

    /// The source id whose account interpreter applies in `tenant`, if any.
    #[must_use]
    pub fn account_control_source(&self, tenant: &str) -> Option<&str> {
        if !self.external_user_control.get(tenant).copied().unwrap_or(false) {
            return None;
        }
        self.external_user_control_subsystem_name
            .get(tenant)
            .map(String::as_str)
    }
}

fn parse_var<F, T>(reader: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Result<String, VarError>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match reader(key) {
        Ok(value) => value
            .trim()
            .parse::<T>()
            .map_err(|e| ConfigError::InvalidValue(key.into(), e.to_string())),
        Err(_) => Ok(default),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingVar(String),

    #[error("invalid value for {0}: {1}")]
    InvalidValue(String, String),
}
