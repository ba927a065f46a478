//! Chaining synchronizer.
//!
//! Runs the six synchronization phases for every active source of a tenant,
//! in precedence order, under the tenant's cluster-wide lock.

use std::collections::{BTreeSet, HashSet};
use std::ops::AddAssign;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};
use xavyo_directory::{collect_entries, props, AuthorityKind, PropertyMap, PropertyValue};

use crate::analyzer::GroupAnalyzer;
use crate::batch::{BatchProcessor, EntryWorkProvider, VecWorkProvider};
use crate::checkpoint::{CheckpointStore, StatusTracker, WatermarkKind};
use crate::config::SynchronizerConfig;
use crate::containment::ContainmentCache;
use crate::context::{base_user_name, qualify_user, SyncContext};
use crate::error::{SyncError, SyncResult};
use crate::lock::{lock_name, LockHeartbeat, LockPolicy, LockService};
use crate::mutation::MutationSet;
use crate::phase::SyncPhase;
use crate::provenance::{default_person_zones, zone_id, SourceScope};
use crate::sources::{RegisteredSource, SourceRegistry};
use crate::store::IdentityStore;
use crate::workers::{
    AuthorityDeleter, GroupCreationWorker, GroupParentAdditionWorker, PersonWorker,
    UserParentWorker,
};

/// The built-in system user, never created on login.
pub const SYSTEM_USER_NAME: &str = "System";

const DEFAULT_HOST_NAME: &str = "localhost";

/// Users and groups processed by a run or a source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncCounts {
    pub users: usize,
    pub groups: usize,
}

impl SyncCounts {
    pub fn summary(&self) -> String {
        format!(
            "{} user(s) and {} group(s) processed",
            self.users, self.groups
        )
    }
}

impl AddAssign for SyncCounts {
    fn add_assign(&mut self, other: Self) {
        self.users += other.users;
        self.groups += other.groups;
    }
}

/// Read-only probe of one source.
#[derive(Debug, Clone, Serialize)]
pub struct SynchronizeDiagnostic {
    pub active: bool,
    pub group_names: Vec<String>,
    pub person_names: Vec<String>,
    pub group_last_synced: Option<DateTime<Utc>>,
    pub person_last_synced: Option<DateTime<Utc>>,
    /// Groups changed since the last synchronization, for active sources.
    pub changed_groups: Option<usize>,
    /// Persons changed since the last synchronization, for active sources.
    pub changed_persons: Option<usize>,
}

/// Synchronizes tenants from their chains of directory sources.
pub struct ChainingSynchronizer {
    config: SynchronizerConfig,
    store: Arc<dyn IdentityStore>,
    checkpoints: Arc<dyn CheckpointStore>,
    locks: Arc<dyn LockService>,
    sources: SourceRegistry,
    host_name: String,
}

impl std::fmt::Debug for ChainingSynchronizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainingSynchronizer")
            .field("config", &self.config)
            .field("sources", &self.sources)
            .field("host_name", &self.host_name)
            .finish_non_exhaustive()
    }
}

impl ChainingSynchronizer {
    /// Create a synchronizer after validating `config`.
    pub fn new(
        config: SynchronizerConfig,
        store: Arc<dyn IdentityStore>,
        checkpoints: Arc<dyn CheckpointStore>,
        locks: Arc<dyn LockService>,
        sources: SourceRegistry,
    ) -> SyncResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            store,
            checkpoints,
            locks,
            sources,
            host_name: std::env::var("HOSTNAME").unwrap_or_else(|_| DEFAULT_HOST_NAME.to_string()),
        })
    }

    /// Name recorded as the host of the last run.
    #[must_use]
    pub fn with_host_name(mut self, host_name: impl Into<String>) -> Self {
        self.host_name = host_name.into();
        self
    }

    pub fn config(&self) -> &SynchronizerConfig {
        &self.config
    }

    pub fn sources(&self) -> &SourceRegistry {
        &self.sources
    }

    /// Status attributes of `tenant`.
    pub fn status(&self, tenant: &str) -> StatusTracker {
        StatusTracker::new(Arc::clone(&self.checkpoints), tenant)
    }

    /// Synchronize `tenant` from its active sources.
    ///
    /// `force_full_sync` ignores the stored watermarks. `is_full_sync` also
    /// removes authorities the sources no longer return. A run that cannot
    /// get the tenant lock is skipped without error.
    pub async fn synchronize(
        &self,
        tenant: &str,
        force_full_sync: bool,
        is_full_sync: bool,
    ) -> SyncResult<()> {
        self.run(tenant, force_full_sync, is_full_sync, LockPolicy::scheduled())
            .await
    }

    #[instrument(skip_all, fields(tenant = %tenant, force_full_sync, is_full_sync))]
    async fn run(
        &self,
        tenant: &str,
        force_full_sync: bool,
        is_full_sync: bool,
        policy: LockPolicy,
    ) -> SyncResult<()> {
        if self.store.is_read_only() {
            warn!("Identity store is read-only, skipping synchronization");
            return Ok(());
        }

        let name = lock_name(tenant);
        let ttl = self.config.lock_ttl();
        let token = match self
            .locks
            .acquire(&name, ttl, policy.wait, policy.retries)
            .await
        {
            Ok(token) => token,
            Err(e) => {
                warn!(lock = %name, error = %e, "Synchronization already running elsewhere, skipping");
                return Ok(());
            }
        };

        let ctx = SyncContext::new(tenant);
        let heartbeat = LockHeartbeat::start(
            Arc::clone(&self.locks),
            token.clone(),
            ttl,
            ctx.cancellation().clone(),
        );

        let result = self.run_locked(&ctx, force_full_sync, is_full_sync).await;

        heartbeat.stop().await;
        if let Err(e) = self.locks.release(&token).await {
            warn!(lock = %name, error = %e, "Failed to release synchronization lock");
        }
        result
    }

    async fn run_locked(
        &self,
        ctx: &SyncContext,
        force_full_sync: bool,
        is_full_sync: bool,
    ) -> SyncResult<()> {
        let chain = self.sources.active_chain(ctx.tenant());
        let all_ids: BTreeSet<String> = chain.iter().map(|s| s.id().to_string()).collect();
        let status = self.status(ctx.tenant());

        info!(sources = ?all_ids, "Starting synchronization");
        status.run_started(&self.host_name, &all_ids).await?;

        let mut visited = BTreeSet::new();
        let mut totals = SyncCounts::default();
        for source in &chain {
            let scope = Arc::new(SourceScope::new(
                source.id(),
                all_ids.clone(),
                visited.clone(),
                self.config.allow_deletions,
            ));
            match self
                .sync_source(ctx, &status, source, scope, force_full_sync, is_full_sync)
                .await
            {
                Ok(counts) => {
                    visited.insert(source.id().to_string());
                    totals += counts;
                }
                Err(e) => {
                    error!(source = %source.id(), error = %e, "Synchronization failed");
                    let message = e.to_string();
                    if let Err(s) = status.source_failed(source.id(), &message).await {
                        warn!(error = %s, "Failed to record source failure");
                    }
                    if let Err(s) = status.run_failed(&message).await {
                        warn!(error = %s, "Failed to record run failure");
                    }
                    return Err(e);
                }
            }
        }

        let summary = totals.summary();
        status.run_completed(&summary).await?;
        info!(summary = %summary, "Completed synchronization");
        Ok(())
    }

    #[instrument(skip_all, fields(tenant = %ctx.tenant(), source = %source.id()))]
    async fn sync_source(
        &self,
        ctx: &SyncContext,
        status: &StatusTracker,
        source: &RegisteredSource,
        scope: Arc<SourceScope>,
        force_full_sync: bool,
        is_full_sync: bool,
    ) -> SyncResult<SyncCounts> {
        let source_id = source.id();
        let registry = source.registry();
        status.source_started(source_id).await?;

        let (group_since, person_since) = if force_full_sync {
            (None, None)
        } else {
            (
                status.watermark(WatermarkKind::Group, source_id).await?,
                status.watermark(WatermarkKind::Person, source_id).await?,
            )
        };
        info!(groups_since = ?group_since, persons_since = ?person_since, "Synchronizing source");

        let mutations = Arc::new(MutationSet::new());
        let cache = Arc::new(ContainmentCache::new());
        let mut counts = SyncCounts::default();

        // Group analysis.
        let analyzer = Arc::new(GroupAnalyzer::new(
            Arc::clone(&scope),
            ctx.clone(),
            Arc::clone(&mutations),
            Arc::clone(&cache),
            self.store.user_names_case_sensitive(),
        ));
        let mut groups = EntryWorkProvider::new(registry.groups(group_since).await?);
        counts.groups += self
            .processor(SyncPhase::GroupAnalysis, ctx, source_id)
            .process(&mut groups, Arc::clone(&analyzer))
            .await?;

        // Group creation and association deletion.
        let mut work = VecWorkProvider::new(mutations.group_creation_and_removal_work());
        self.processor(SyncPhase::GroupCreationAndParentRemoval, ctx, source_id)
            .process(
                &mut work,
                Arc::new(GroupCreationWorker::new(Arc::clone(&scope), Arc::clone(&mutations))),
            )
            .await?;

        // Group association creation.
        let parents = mutations.group_parents();
        if !parents.is_empty() {
            self.prewarm(ctx, &cache, &parents).await?;
        }
        let mut work = VecWorkProvider::new(mutations.group_addition_work());
        self.processor(SyncPhase::GroupParentAddition, ctx, source_id)
            .process(
                &mut work,
                Arc::new(GroupParentAdditionWorker::new(
                    Arc::clone(&mutations),
                    Arc::clone(&cache),
                )),
            )
            .await?;

        // Person creation and update.
        let interpreter = match self.config.account_control_source(ctx.tenant()) {
            Some(id) if id == source_id => registry.capabilities().account_interpreter,
            _ => None,
        };
        let persons_worker = Arc::new(PersonWorker::new(Arc::clone(&scope), ctx.clone(), interpreter));
        let mut persons = EntryWorkProvider::new(registry.persons(person_since).await?);
        counts.users += self
            .processor(SyncPhase::PersonUpsert, ctx, source_id)
            .process(&mut persons, Arc::clone(&persons_worker))
            .await?;

        // User associations.
        let mut work = VecWorkProvider::new(mutations.user_association_work());
        self.processor(SyncPhase::UserParentAssociation, ctx, source_id)
            .process(&mut work, Arc::new(UserParentWorker::new(Arc::clone(&mutations))))
            .await?;

        // Authority deletion.
        if is_full_sync && (self.config.allow_deletions || self.config.sync_delete) {
            let candidates = self.deletion_candidates(ctx, source, &scope).await?;
            if candidates.is_empty() {
                debug!("No authorities to delete");
            } else {
                let groups = candidates
                    .iter()
                    .filter(|name| AuthorityKind::of(name) == AuthorityKind::Group)
                    .count();
                counts.groups += groups;
                counts.users += candidates.len() - groups;
                info!(groups, users = candidates.len() - groups, "Removing authorities no longer in source");
                let mut work = VecWorkProvider::new(candidates);
                self.processor(SyncPhase::AuthorityDeletion, ctx, source_id)
                    .process(&mut work, Arc::new(AuthorityDeleter::new(Arc::clone(&scope))))
                    .await?;
            }
        }

        status
            .advance_watermark(WatermarkKind::Group, source_id, analyzer.latest_modified())
            .await?;
        status
            .advance_watermark(WatermarkKind::Person, source_id, persons_worker.latest_modified())
            .await?;

        let summary = counts.summary();
        status.source_completed(source_id, &summary).await?;
        info!(summary = %summary, "Completed source");
        Ok(counts)
    }

    fn processor(&self, phase: SyncPhase, ctx: &SyncContext, source_id: &str) -> BatchProcessor {
        BatchProcessor::new(
            phase.batch_title(source_id, ctx.tenant()),
            Arc::clone(&self.store),
            ctx.clone(),
            &self.config,
        )
    }

    /// Load the current members of every group gaining children.
    async fn prewarm(
        &self,
        ctx: &SyncContext,
        cache: &ContainmentCache,
        parents: &BTreeSet<String>,
    ) -> SyncResult<()> {
        let mut txn = self.store.begin(ctx.tenant()).await?;
        let result = cache.prewarm(txn.as_mut(), parents.iter()).await;
        txn.rollback().await?;
        result
    }

    /// Authorities in the source's zone that the source no longer returns.
    async fn deletion_candidates(
        &self,
        ctx: &SyncContext,
        source: &RegisteredSource,
        scope: &SourceScope,
    ) -> SyncResult<Vec<String>> {
        let registry = source.registry();
        let group_names: HashSet<String> = registry.group_names().await?.into_iter().collect();
        let case_sensitive = self.store.user_names_case_sensitive();
        let user_key = |name: &str| {
            if case_sensitive {
                name.to_string()
            } else {
                name.to_lowercase()
            }
        };
        let person_names: HashSet<String> = registry
            .person_names()
            .await?
            .iter()
            .map(|name| user_key(&ctx.qualify_user(name)))
            .collect();

        let mut txn = self.store.begin(ctx.tenant()).await?;
        let zone_groups = txn
            .authorities_in_zone(AuthorityKind::Group, &scope.zone_id)
            .await;
        let zone_users = txn
            .authorities_in_zone(AuthorityKind::User, &scope.zone_id)
            .await;
        txn.rollback().await?;

        let mut candidates: Vec<String> = zone_groups?
            .into_iter()
            .filter(|group| !group_names.contains(group))
            .collect();
        candidates.extend(
            zone_users?
                .into_iter()
                .filter(|user| !person_names.contains(&user_key(user))),
        );
        Ok(candidates)
    }

    /// Probe a source without changing anything.
    #[instrument(skip(self))]
    pub async fn test_synchronize(
        &self,
        tenant: &str,
        source_id: &str,
    ) -> SyncResult<SynchronizeDiagnostic> {
        let source = self
            .sources
            .get(tenant, source_id)
            .ok_or_else(|| SyncError::source_not_found(source_id))?;
        let registry = source.registry();
        let active = self.sources.is_active(source, tenant);
        let status = self.status(tenant);

        let group_last_synced = status.last_group_update(source_id).await?;
        let person_last_synced = status.last_user_update(source_id).await?;
        let group_names = registry.group_names().await?;
        let person_names = registry.person_names().await?;

        let (changed_groups, changed_persons) = if active {
            let mut groups = registry
                .groups(Some(group_last_synced.unwrap_or_else(Utc::now)))
                .await?;
            let changed_groups = collect_entries(groups.as_mut()).await?.len();
            let mut persons = registry
                .persons(Some(person_last_synced.unwrap_or_else(Utc::now)))
                .await?;
            let changed_persons = collect_entries(persons.as_mut()).await?.len();
            (Some(changed_groups), Some(changed_persons))
        } else {
            (None, None)
        };

        info!(
            active,
            groups = group_names.len(),
            persons = person_names.len(),
            "Tested source"
        );
        Ok(SynchronizeDiagnostic {
            active,
            group_names,
            person_names,
            group_last_synced,
            person_last_synced,
            changed_groups,
            changed_persons,
        })
    }

    /// Make sure a user logging in without a person record gets one.
    ///
    /// Runs a differential synchronization first when configured, then
    /// falls back to creating a plain person. Returns whether the person
    /// exists afterwards.
    #[instrument(skip(self))]
    pub async fn create_missing_person(&self, tenant: &str, user_name: &str) -> SyncResult<bool> {
        if base_user_name(user_name) == SYSTEM_USER_NAME {
            return Ok(false);
        }
        let user_name = qualify_user(tenant, user_name);

        if self.config.sync_when_missing_people_log_in {
            let policy = LockPolicy::login(self.config.lock_ttl());
            if let Err(e) = self.run(tenant, false, false, policy).await {
                warn!(user = %user_name, error = %e, "Synchronization for missing person failed");
            }
            if self.person_exists(tenant, &user_name).await? {
                return Ok(true);
            }
        }

        if !(self.config.auto_create_people_on_login && self.store.creates_missing_people())
            || self.store.is_read_only()
        {
            return Ok(false);
        }

        let mut txn = self.store.begin(tenant).await?;
        let created = async {
            if txn.person_exists(&user_name).await? {
                return Ok(false);
            }
            let properties = PropertyMap::from([(
                props::USER_NAME.to_string(),
                PropertyValue::String(user_name.clone()),
            )]);
            txn.create_person(&properties, &default_person_zones()).await?;
            Ok::<_, SyncError>(true)
        }
        .await;
        match created {
            Ok(created) => {
                txn.commit().await?;
                if created {
                    info!(user = %user_name, "Created missing person");
                }
                Ok(true)
            }
            Err(e) => {
                if let Err(rollback) = txn.rollback().await {
                    warn!(error = %rollback, "Failed to roll back person creation");
                }
                Err(e)
            }
        }
    }

    async fn person_exists(&self, tenant: &str, user_name: &str) -> SyncResult<bool> {
        let mut txn = self.store.begin(tenant).await?;
        let exists = txn.person_exists(user_name).await;
        txn.rollback().await?;
        Ok(exists?)
    }

    /// Person properties the directories control for `user_name`.
    ///
    /// These are the mapped keys of the active source whose zone the user
    /// carries; empty for people no source owns.
    pub async fn person_mapped_properties(
        &self,
        tenant: &str,
        user_name: &str,
    ) -> SyncResult<BTreeSet<String>> {
        let user_name = qualify_user(tenant, user_name);
        let mut txn = self.store.begin(tenant).await?;
        let zones = txn.authority_zones(&user_name).await;
        txn.rollback().await?;
        let Some(zones) = zones? else {
            return Ok(BTreeSet::new());
        };

        Ok(self
            .sources
            .active_chain(tenant)
            .iter()
            .rev()
            .find(|source| zones.contains(&zone_id(source.id())))
            .map(|source| source.registry().person_mapped_properties())
            .unwrap_or_default())
    }
}
