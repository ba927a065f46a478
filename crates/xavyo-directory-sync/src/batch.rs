//! Batch Processor
//!
//! Drains a work provider in fixed-size batches on a bounded pool of
//! tasks. Each batch runs in one identity store transaction. The first
//! failing batch is rolled back and stops new batches from starting;
//! batches already committed stay committed.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};
use xavyo_directory::{DirectoryEntry, EntrySource};

use crate::config::SynchronizerConfig;
use crate::context::SyncContext;
use crate::error::{SyncError, SyncResult};
use crate::store::{IdentityStore, StoreTransaction};

/// Processes one unit of work inside a batch transaction.
#[async_trait]
pub trait BatchWorker<T>: Send + Sync {
    /// Identifier of `item` for logs and errors.
    fn identifier(&self, item: &T) -> String;

    async fn process(&self, txn: &mut dyn StoreTransaction, item: &T) -> SyncResult<()>;
}

/// Source of units of work.
#[async_trait]
pub trait WorkProvider<T>: Send {
    /// Total number of units, when known.
    fn estimated_size(&self) -> Option<usize>;

    /// Up to `size` more units; empty once exhausted.
    async fn next_batch(&mut self, size: usize) -> SyncResult<Vec<T>>;
}

/// Streams directory entries out of an entry source.
pub struct EntryWorkProvider {
    source: Box<dyn EntrySource>,
}

impl EntryWorkProvider {
    pub fn new(source: Box<dyn EntrySource>) -> Self {
        Self { source }
    }
}

#[async_trait]
impl WorkProvider<DirectoryEntry> for EntryWorkProvider {
    fn estimated_size(&self) -> Option<usize> {
        self.source.estimated_size()
    }

    async fn next_batch(&mut self, size: usize) -> SyncResult<Vec<DirectoryEntry>> {
        let mut batch = Vec::with_capacity(size);
        while batch.len() < size {
            match self.source.next_entry().await? {
                Some(entry) => batch.push(entry),
                None => break,
            }
        }
        Ok(batch)
    }
}

/// Hands out an in-memory work list.
#[derive(Debug)]
pub struct VecWorkProvider<T> {
    items: std::vec::IntoIter<T>,
    total: usize,
}

impl<T> VecWorkProvider<T> {
    pub fn new(items: Vec<T>) -> Self {
        let total = items.len();
        Self {
            items: items.into_iter(),
            total,
        }
    }
}

#[async_trait]
impl<T: Send> WorkProvider<T> for VecWorkProvider<T> {
    fn estimated_size(&self) -> Option<usize> {
        Some(self.total)
    }

    async fn next_batch(&mut self, size: usize) -> SyncResult<Vec<T>> {
        Ok(self.items.by_ref().take(size).collect())
    }
}

/// Runs one phase of a synchronization.
pub struct BatchProcessor {
    title: String,
    store: Arc<dyn IdentityStore>,
    ctx: SyncContext,
    worker_threads: usize,
    batch_size: usize,
    logging_interval: usize,
}

impl std::fmt::Debug for BatchProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchProcessor")
            .field("title", &self.title)
            .field("tenant", &self.ctx.tenant())
            .field("worker_threads", &self.worker_threads)
            .field("batch_size", &self.batch_size)
            .finish_non_exhaustive()
    }
}

impl BatchProcessor {
    pub fn new(
        title: impl Into<String>,
        store: Arc<dyn IdentityStore>,
        ctx: SyncContext,
        config: &SynchronizerConfig,
    ) -> Self {
        Self {
            title: title.into(),
            store,
            ctx,
            worker_threads: config.worker_threads.max(1),
            batch_size: config.batch_size.max(1),
            logging_interval: config.logging_interval,
        }
    }

    /// Process every unit of `provider` and return how many were processed.
    #[instrument(skip(self, provider, worker), fields(process = %self.title, tenant = %self.ctx.tenant()))]
    pub async fn process<T, W>(
        &self,
        provider: &mut dyn WorkProvider<T>,
        worker: Arc<W>,
    ) -> SyncResult<usize>
    where
        T: Send + Sync + 'static,
        W: BatchWorker<T> + 'static,
    {
        let estimated = provider.estimated_size();
        info!(estimated = ?estimated, "Starting batch process");

        let semaphore = Arc::new(Semaphore::new(self.worker_threads));
        let processed = Arc::new(AtomicUsize::new(0));
        let mut tasks: JoinSet<SyncResult<()>> = JoinSet::new();
        let mut failure: Option<SyncError> = None;

        loop {
            while let Some(joined) = tasks.try_join_next() {
                record_failure(&mut failure, joined);
            }
            if failure.is_some() {
                break;
            }
            if let Err(e) = self.ctx.check_cancelled() {
                failure = Some(e);
                break;
            }

            let permit = Arc::clone(&semaphore)
                .acquire_owned()
                .await
                .map_err(|e| SyncError::internal(format!("batch semaphore closed: {e}")))?;
            while let Some(joined) = tasks.try_join_next() {
                record_failure(&mut failure, joined);
            }
            if failure.is_some() {
                break;
            }

            let batch = match provider.next_batch(self.batch_size).await {
                Ok(batch) => batch,
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            };
            if batch.is_empty() {
                break;
            }
            debug!(size = batch.len(), "Dispatching batch");

            let store = Arc::clone(&self.store);
            let worker = Arc::clone(&worker);
            let processed = Arc::clone(&processed);
            let tenant = self.ctx.tenant().to_string();
            let title = self.title.clone();
            let logging_interval = self.logging_interval;

            tasks.spawn(async move {
                let _permit = permit;
                let count = batch.len();
                run_batch(store.as_ref(), &tenant, &title, worker.as_ref(), batch).await?;

                let before = processed.fetch_add(count, Ordering::SeqCst);
                let after = before + count;
                if logging_interval > 0 && after / logging_interval > before / logging_interval {
                    info!(process = %title, processed = after, estimated = ?estimated, "Batch progress");
                }
                Ok(())
            });
        }

        while let Some(joined) = tasks.join_next().await {
            record_failure(&mut failure, joined);
        }

        let total = processed.load(Ordering::SeqCst);
        match failure {
            Some(e) => {
                error!(processed = total, error = %e, "Batch process failed");
                Err(e)
            }
            None => {
                info!(processed = total, "Completed batch process");
                Ok(total)
            }
        }
    }
}

async fn run_batch<T, W>(
    store: &dyn IdentityStore,
    tenant: &str,
    title: &str,
    worker: &W,
    batch: Vec<T>,
) -> SyncResult<()>
where
    T: Send + Sync,
    W: BatchWorker<T> + ?Sized,
{
    let mut txn = store.begin(tenant).await?;
    for item in &batch {
        if let Err(e) = worker.process(txn.as_mut(), item).await {
            let id = worker.identifier(item);
            if let Err(rollback) = txn.rollback().await {
                warn!(error = %rollback, "Failed to roll back batch");
            }
            return Err(SyncError::batch(title, id, e));
        }
    }
    txn.commit().await?;
    Ok(())
}

fn record_failure(
    failure: &mut Option<SyncError>,
    joined: Result<SyncResult<()>, tokio::task::JoinError>,
) {
    let result = joined.unwrap_or_else(|e| {
        Err(SyncError::Task {
            message: e.to_string(),
        })
    });
    if let Err(e) = result {
        if failure.is_none() {
            *failure = Some(e);
        } else {
            warn!(error = %e, "Additional batch failure");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::memory::InMemoryIdentityStore;
    use crate::provenance::target_zones;
    use xavyo_directory::AuthorityKind;

    struct CreateGroup;

    #[async_trait]
    impl BatchWorker<String> for CreateGroup {
        fn identifier(&self, item: &String) -> String {
            item.clone()
        }

        async fn process(&self, txn: &mut dyn StoreTransaction, item: &String) -> SyncResult<()> {
            if item == "bad" {
                return Err(StoreError::operation("rejected").into());
            }
            txn.create_authority(AuthorityKind::Group, item, item, &target_zones("ldap1"))
                .await?;
            Ok(())
        }
    }

    fn config(worker_threads: usize, batch_size: usize) -> SynchronizerConfig {
        SynchronizerConfig {
            worker_threads,
            batch_size,
            logging_interval: 10,
            ..SynchronizerConfig::default()
        }
    }

    fn items(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("g{i}")).collect()
    }

    #[tokio::test]
    async fn test_processes_all_items_in_batches() {
        let store = Arc::new(InMemoryIdentityStore::new());
        let processor = BatchProcessor::new("test", store.clone(), SyncContext::new(""), &config(3, 4));

        let mut provider = VecWorkProvider::new(items(25));
        let processed = processor
            .process(&mut provider, Arc::new(CreateGroup))
            .await
            .unwrap();

        assert_eq!(processed, 25);
        assert_eq!(store.commits(), 7);
        assert_eq!(store.group_count(), 25);
    }

    #[tokio::test]
    async fn test_failing_batch_rolls_back_and_stops() {
        let store = Arc::new(InMemoryIdentityStore::new());
        let processor = BatchProcessor::new("test", store.clone(), SyncContext::new(""), &config(1, 2));

        let mut work = items(4);
        work.push("bad".to_string());
        work.extend((10..20).map(|i| format!("g{i}")));
        let mut provider = VecWorkProvider::new(work);

        let err = processor
            .process(&mut provider, Arc::new(CreateGroup))
            .await
            .unwrap_err();

        assert!(matches!(err, SyncError::Batch { ref item, .. } if item == "bad"));
        assert_eq!(store.rollbacks(), 1);
        // The two batches before the failure stay committed.
        assert_eq!(store.group_count(), 4);
        assert!(!store.authority_names().contains(&"GROUP_g11".to_string()));
    }

    #[tokio::test]
    async fn test_cancelled_run_stops_before_next_batch() {
        let store = Arc::new(InMemoryIdentityStore::new());
        let ctx = SyncContext::new("acme.com");
        ctx.cancellation().cancel();
        let processor = BatchProcessor::new("test", store.clone(), ctx, &config(2, 5));

        let mut provider = VecWorkProvider::new(items(10));
        let err = processor
            .process(&mut provider, Arc::new(CreateGroup))
            .await
            .unwrap_err();

        assert!(matches!(err, SyncError::LockLost { .. }));
        assert_eq!(store.group_count(), 0);
    }

    #[tokio::test]
    async fn test_empty_provider() {
        let store = Arc::new(InMemoryIdentityStore::new());
        let processor = BatchProcessor::new("test", store.clone(), SyncContext::new(""), &config(2, 5));
        let mut provider = VecWorkProvider::<String>::new(Vec::new());
        assert_eq!(
            processor.process(&mut provider, Arc::new(CreateGroup)).await.unwrap(),
            0
        );
        assert_eq!(store.commits(), 0);
    }
}
