//! Per-directory state machine: define a batch, build its revision, publish
//! the new roots.
//!
//! Every step reloads its inputs from the batch store, the map and the log, so
//! any step can be retried or run concurrently with itself. Nothing is kept in
//! process memory between calls.

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, instrument, warn};

use super::{high_watermarks, RevisionBuilder, SequencerConfig};
use crate::clients::{VerifyingLogClient, VerifyingMapClient};
use crate::domain::{DirectoryId, MapMetadata, SignedMapRoot};
use crate::infra::{
    retry_transient, BatchStore, ErrorClass, LogReader, MutationResolver, Result, RetryConfig,
    SequencerError, ShutdownSignal,
};
use crate::metrics::{metric_names, timed, MetricsRegistry};

/// What one step did
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum StepOutcome {
    /// Fewer than `min_batch` mutations pending
    NoOp { pending: u64, min_batch: u64 },
    /// Batch definition recorded, or an existing one picked up
    Defined { revision: u64, resumed: bool },
    /// Map revision written
    Created { revision: u64, leaves_written: usize },
    /// Map revision already existed with the same definition
    AlreadyCreated { revision: u64 },
    /// Map roots appended to the root log
    Published { revisions: Vec<u64>, log_size: u64 },
}

/// Drives the three idempotent steps for any directory
pub struct Sequencer {
    config: SequencerConfig,
    reader: Arc<dyn LogReader>,
    batches: Arc<dyn BatchStore>,
    map: Arc<VerifyingMapClient>,
    log: Arc<VerifyingLogClient>,
    builder: RevisionBuilder,
    metrics: Arc<MetricsRegistry>,
    shutdown: ShutdownSignal,
    /// Backoff for transient batch store and log reader failures
    store_retry: RetryConfig,
}

impl Sequencer {
    pub fn new(
        config: SequencerConfig,
        reader: Arc<dyn LogReader>,
        batches: Arc<dyn BatchStore>,
        map: Arc<VerifyingMapClient>,
        log: Arc<VerifyingLogClient>,
        resolver: Arc<dyn MutationResolver>,
    ) -> Self {
        let builder =
            RevisionBuilder::new(reader.clone(), map.clone(), resolver, config.page_size);
        Self {
            config,
            reader,
            batches,
            map,
            log,
            builder,
            metrics: Arc::new(MetricsRegistry::new()),
            shutdown: ShutdownSignal::never(),
            store_retry: RetryConfig::database(),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsRegistry>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Abort waits and new steps once `shutdown` fires
    pub fn with_shutdown(mut self, shutdown: ShutdownSignal) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn with_store_retry(mut self, retry: RetryConfig) -> Self {
        self.store_retry = retry;
        self
    }

    pub fn config(&self) -> &SequencerConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    pub fn reader(&self) -> &Arc<dyn LogReader> {
        &self.reader
    }

    pub fn batches(&self) -> &Arc<dyn BatchStore> {
        &self.batches
    }

    pub fn map(&self) -> &Arc<VerifyingMapClient> {
        &self.map
    }

    pub fn log(&self) -> &Arc<VerifyingLogClient> {
        &self.log
    }

    fn check_running(&self) -> Result<()> {
        if self.shutdown.is_shutdown() {
            Err(SequencerError::Cancelled)
        } else {
            Ok(())
        }
    }

    async fn record<T>(&self, result: Result<T>) -> Result<T> {
        let name = match result.as_ref().err().map(SequencerError::class) {
            Some(ErrorClass::Integrity) => Some(metric_names::INTEGRITY_ERRORS),
            Some(ErrorClass::Verification) => Some(metric_names::VERIFICATION_ERRORS),
            Some(ErrorClass::Transient) => Some(metric_names::TRANSIENT_ERRORS),
            _ => None,
        };
        if let Some(name) = name {
            self.metrics.inc_counter(name).await;
        }
        result
    }

    /// Define the next revision if enough mutations are pending, then build
    /// and publish it.
    ///
    /// A definition left behind by an interrupted call is resumed instead of
    /// defining a new one.
    #[instrument(skip(self), fields(directory_id = %directory_id))]
    pub async fn run_batch(
        &self,
        directory_id: &DirectoryId,
        min_batch: u64,
        max_batch: u64,
    ) -> Result<Vec<StepOutcome>> {
        let result = timed(
            &self.metrics,
            metric_names::RUN_BATCH_LATENCY,
            self.run_batch_inner(directory_id, min_batch, max_batch),
        )
        .await;
        self.record(result).await
    }

    async fn run_batch_inner(
        &self,
        directory_id: &DirectoryId,
        min_batch: u64,
        max_batch: u64,
    ) -> Result<Vec<StepOutcome>> {
        if max_batch == 0 {
            return Err(SequencerError::InvalidArgument(
                "max_batch must be at least 1".to_string(),
            ));
        }
        if min_batch > max_batch {
            return Err(SequencerError::InvalidArgument(format!(
                "min_batch {min_batch} exceeds max_batch {max_batch}"
            )));
        }
        self.check_running()?;

        let latest = self.map.get_and_verify_latest_map_root(directory_id).await?;
        let revision = latest.revision() + 1;

        let stored = retry_transient(&self.store_retry, "read_batch", || {
            self.batches.read_batch(directory_id, revision)
        })
        .await;
        match stored {
            Ok(_) => {
                info!(revision, "Resuming existing batch definition");
                let mut steps = vec![StepOutcome::Defined {
                    revision,
                    resumed: true,
                }];
                steps.extend(self.create_revision_inner(directory_id, revision).await?);
                return Ok(steps);
            }
            Err(SequencerError::BatchNotFound { .. }) => {}
            Err(e) => return Err(e),
        }

        let start = latest.metadata().highest_watermarks();
        let (pending, highs) = retry_transient(&self.store_retry, "high_watermarks", || {
            high_watermarks(self.reader.as_ref(), directory_id, &start, max_batch)
        })
        .await?;

        if pending < min_batch {
            self.metrics
                .inc_counter(metric_names::BATCHES_BELOW_MIN)
                .await;
            info!(pending, min_batch, "Not enough pending mutations");
            return Ok(vec![StepOutcome::NoOp { pending, min_batch }]);
        }

        let definition = latest.metadata().next(revision, &highs);
        retry_transient(&self.store_retry, "write_batch_sources", || {
            self.batches
                .write_batch_sources(directory_id, revision, &definition)
        })
        .await?;
        self.metrics.inc_counter(metric_names::BATCHES_DEFINED).await;
        info!(revision, pending, "Batch defined");

        let mut steps = vec![StepOutcome::Defined {
            revision,
            resumed: false,
        }];
        steps.extend(self.create_revision_inner(directory_id, revision).await?);
        Ok(steps)
    }

    /// Build the map revision for a stored batch definition, then publish
    #[instrument(skip(self), fields(directory_id = %directory_id))]
    pub async fn create_revision(
        &self,
        directory_id: &DirectoryId,
        revision: u64,
    ) -> Result<Vec<StepOutcome>> {
        let result = self.create_revision_inner(directory_id, revision).await;
        self.record(result).await
    }

    async fn create_revision_inner(
        &self,
        directory_id: &DirectoryId,
        revision: u64,
    ) -> Result<Vec<StepOutcome>> {
        if revision == 0 {
            return Err(SequencerError::InvalidArgument(
                "revision 0 is the empty map and has no batch".to_string(),
            ));
        }
        self.check_running()?;

        let definition = retry_transient(&self.store_retry, "read_batch", || {
            self.batches.read_batch(directory_id, revision)
        })
        .await?;
        let created = timed(
            &self.metrics,
            metric_names::CREATE_REVISION_LATENCY,
            self.build_revision(directory_id, revision, &definition),
        )
        .await?;

        let mut steps = vec![created];
        steps.push(self.publish_batch_inner(directory_id).await?);
        Ok(steps)
    }

    async fn build_revision(
        &self,
        directory_id: &DirectoryId,
        revision: u64,
        definition: &MapMetadata,
    ) -> Result<StepOutcome> {
        let latest = self.map.get_and_verify_latest_map_root(directory_id).await?;
        if latest.revision() >= revision {
            self.check_existing(directory_id, revision, definition)
                .await?;
            return Ok(StepOutcome::AlreadyCreated { revision });
        }
        if latest.revision() + 1 != revision {
            return Err(SequencerError::FailedPrecondition(format!(
                "map is at revision {}, revision {} is still pending",
                latest.revision(),
                latest.revision() + 1
            )));
        }
        definition
            .check_follows(latest.metadata())
            .map_err(SequencerError::IntegrityViolation)?;

        let plan = self.builder.build(directory_id, definition).await?;
        let stats = plan.stats;
        let leaves_written = plan.leaves.len();

        let root = match self.builder.commit(plan).await {
            Ok(root) => root,
            Err(SequencerError::FailedPrecondition(reason)) => {
                // Another caller may have written this revision meanwhile.
                let now = self.map.get_and_verify_latest_map_root(directory_id).await?;
                if now.revision() < revision {
                    return Err(SequencerError::FailedPrecondition(reason));
                }
                self.check_existing(directory_id, revision, definition)
                    .await?;
                return Ok(StepOutcome::AlreadyCreated { revision });
            }
            Err(e) => return Err(e),
        };

        self.metrics
            .inc_counter(metric_names::REVISIONS_CREATED)
            .await;
        self.metrics
            .add_counter(metric_names::LEAVES_WRITTEN, leaves_written as u64)
            .await;
        self.metrics
            .add_counter(
                metric_names::MUTATIONS_DROPPED,
                (stats.unprojectable + stats.dropped_indices) as u64,
            )
            .await;
        self.metrics
            .add_counter(metric_names::MUTATIONS_APPLIED, stats.messages as u64)
            .await;
        self.metrics
            .set_gauge(
                &metric_names::for_directory(metric_names::LATEST_REVISION, directory_id.as_str()),
                root.revision(),
            )
            .await;

        info!(
            revision,
            leaves_written,
            messages = stats.messages,
            dropped = stats.unprojectable + stats.dropped_indices,
            "Revision created"
        );
        Ok(StepOutcome::Created {
            revision,
            leaves_written,
        })
    }

    /// The map already holds `revision`: it must have been built from `definition`
    async fn check_existing(
        &self,
        directory_id: &DirectoryId,
        revision: u64,
        definition: &MapMetadata,
    ) -> Result<SignedMapRoot> {
        let existing = self
            .map
            .get_and_verify_map_root_by_revision(directory_id, revision)
            .await?;
        if existing.metadata() != definition {
            return Err(SequencerError::IntegrityViolation(format!(
                "map revision {revision} was built from a different batch definition"
            )));
        }
        Ok(existing)
    }

    /// Append every unpublished map root to the root log in revision order and
    /// wait for the newest one to be included
    #[instrument(skip(self), fields(directory_id = %directory_id))]
    pub async fn publish_batch(&self, directory_id: &DirectoryId) -> Result<StepOutcome> {
        let result = self.publish_batch_inner(directory_id).await;
        self.record(result).await
    }

    async fn publish_batch_inner(&self, directory_id: &DirectoryId) -> Result<StepOutcome> {
        timed(
            &self.metrics,
            metric_names::PUBLISH_LATENCY,
            self.publish(directory_id),
        )
        .await
    }

    async fn publish(&self, directory_id: &DirectoryId) -> Result<StepOutcome> {
        self.check_running()?;

        let latest = self.map.get_and_verify_latest_map_root(directory_id).await?;
        let log_root = self.log.get_and_verify_latest_root(directory_id).await?;
        let published = log_root.tree_size();

        if published > latest.revision() + 1 {
            return Err(SequencerError::IntegrityViolation(format!(
                "root log holds {published} roots but the map is only at revision {}",
                latest.revision()
            )));
        }
        if published == latest.revision() + 1 {
            return Ok(StepOutcome::Published {
                revisions: Vec::new(),
                log_size: published,
            });
        }

        let mut revisions = Vec::new();
        for revision in published..=latest.revision() {
            let root = if revision == latest.revision() {
                latest.clone()
            } else {
                self.map
                    .get_and_verify_map_root_by_revision(directory_id, revision)
                    .await?
            };
            self.log
                .add_sequenced_leaf(directory_id, root.to_log_leaf(), revision)
                .await?;
            revisions.push(revision);
        }

        let included = self
            .log
            .wait_for_inclusion(
                directory_id,
                &latest.to_log_leaf(),
                latest.revision(),
                &self.shutdown,
                self.config.publish_timeout,
            )
            .await
            .inspect_err(|e| warn!(error = %e, "Root not yet included"))?;

        self.metrics
            .add_counter(metric_names::ROOTS_PUBLISHED, revisions.len() as u64)
            .await;
        self.metrics
            .set_gauge(
                &metric_names::for_directory(metric_names::LOG_SIZE, directory_id.as_str()),
                included.tree_size(),
            )
            .await;
        info!(
            first = published,
            last = latest.revision(),
            log_size = included.tree_size(),
            "Map roots published"
        );

        Ok(StepOutcome::Published {
            revisions,
            log_size: included.tree_size(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;

    use crate::crypto::SigningKeyPair;
    use crate::domain::{LogId, MapIndex, SourceSlice};
    use crate::infra::{
        InMemoryBatchStore, InMemoryLogService, InMemoryMapService, InMemoryMutationLog,
        MutationQueue, RetryConfig,
    };
    use crate::sequencer::VersionedEntryResolver;

    struct Harness {
        queue: Arc<InMemoryMutationLog>,
        batches: Arc<InMemoryBatchStore>,
        log_service: Arc<InMemoryLogService>,
        sequencer: Sequencer,
        key: SigningKeyPair,
    }

    fn dir() -> DirectoryId {
        DirectoryId::new("d")
    }

    /// Batch store that fails its next `failures` calls as unavailable
    struct FlakyBatchStore {
        inner: Arc<InMemoryBatchStore>,
        failures: AtomicU32,
    }

    impl FlakyBatchStore {
        fn fail(&self) -> Result<()> {
            let left = self.failures.load(Ordering::SeqCst);
            if left == 0 {
                return Ok(());
            }
            self.failures.store(left - 1, Ordering::SeqCst);
            Err(SequencerError::Unavailable("batch store restarting".into()))
        }
    }

    #[async_trait]
    impl BatchStore for FlakyBatchStore {
        async fn write_batch_sources(
            &self,
            directory_id: &DirectoryId,
            revision: u64,
            meta: &MapMetadata,
        ) -> Result<()> {
            self.fail()?;
            self.inner
                .write_batch_sources(directory_id, revision, meta)
                .await
        }

        async fn read_batch(
            &self,
            directory_id: &DirectoryId,
            revision: u64,
        ) -> Result<MapMetadata> {
            self.fail()?;
            self.inner.read_batch(directory_id, revision).await
        }
    }

    async fn harness() -> Harness {
        harness_over(|batches| batches as Arc<dyn BatchStore>).await
    }

    async fn harness_over<F>(store: F) -> Harness
    where
        F: FnOnce(Arc<InMemoryBatchStore>) -> Arc<dyn BatchStore>,
    {
        let queue = Arc::new(InMemoryMutationLog::new());
        queue.create_log(&dir(), LogId(1)).await;
        let batches = Arc::new(InMemoryBatchStore::new());
        let map_service = Arc::new(InMemoryMapService::new(SigningKeyPair::generate()));
        map_service.create_directory(&dir()).await;
        let log_service = Arc::new(InMemoryLogService::new(SigningKeyPair::generate()));
        log_service.create_directory(&dir()).await;

        let log = Arc::new(
            VerifyingLogClient::new(log_service.clone(), log_service.verifier())
                .with_poll_config(RetryConfig::fast()),
        );
        let map = Arc::new(
            VerifyingMapClient::new(map_service.clone(), map_service.verifier())
                .with_log(log.clone()),
        );
        let config = SequencerConfig::default().with_publish_timeout(Duration::from_secs(2));
        let sequencer = Sequencer::new(
            config,
            queue.clone(),
            store(batches.clone()),
            map,
            log,
            Arc::new(VersionedEntryResolver::new()),
        )
        .with_store_retry(RetryConfig::fast());
        Harness {
            queue,
            batches,
            log_service,
            sequencer,
            key: SigningKeyPair::generate(),
        }
    }

    impl Harness {
        async fn enqueue(&self, b: u8, version: u64) {
            let entry = self.key.sign_entry(
                MapIndex::from_bytes([b; 32]),
                format!("user{b}"),
                version,
                vec![format!("key{b}-{version}")],
            );
            self.queue
                .send(&dir(), LogId(1), entry.to_bytes())
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_run_batch_defines_builds_and_publishes() {
        let h = harness().await;
        h.enqueue(1, 1).await;
        h.enqueue(2, 1).await;

        let steps = h.sequencer.run_batch(&dir(), 1, 10).await.unwrap();
        assert_eq!(
            steps,
            vec![
                StepOutcome::Defined {
                    revision: 1,
                    resumed: false
                },
                StepOutcome::Created {
                    revision: 1,
                    leaves_written: 2
                },
                StepOutcome::Published {
                    revisions: vec![0, 1],
                    log_size: 2
                },
            ]
        );
        assert_eq!(
            h.batches.read_batch(&dir(), 1).await.unwrap().sources[&LogId(1)],
            SourceSlice::new(LogId(1), 0, 2)
        );
        assert_eq!(h.log_service.size(&dir()).await, 2);
    }

    #[tokio::test]
    async fn test_transient_store_failures_are_retried() {
        let h = harness_over(|inner| {
            Arc::new(FlakyBatchStore {
                inner,
                failures: AtomicU32::new(2),
            }) as Arc<dyn BatchStore>
        })
        .await;
        h.enqueue(1, 1).await;

        let steps = h.sequencer.run_batch(&dir(), 1, 10).await.unwrap();
        assert_eq!(
            steps[0],
            StepOutcome::Defined {
                revision: 1,
                resumed: false
            }
        );
        assert!(h.batches.read_batch(&dir(), 1).await.is_ok());
    }

    #[tokio::test]
    async fn test_store_outage_outlasting_retries_defines_nothing() {
        let h = harness_over(|inner| {
            Arc::new(FlakyBatchStore {
                inner,
                failures: AtomicU32::new(100),
            }) as Arc<dyn BatchStore>
        })
        .await;
        h.enqueue(1, 1).await;

        assert!(matches!(
            h.sequencer.run_batch(&dir(), 1, 10).await,
            Err(SequencerError::Unavailable(_))
        ));
        assert!(h.batches.is_empty().await);
        assert_eq!(h.log_service.size(&dir()).await, 0);
    }

    #[tokio::test]
    async fn test_run_batch_validates_bounds() {
        let h = harness().await;
        assert!(matches!(
            h.sequencer.run_batch(&dir(), 0, 0).await,
            Err(SequencerError::InvalidArgument(_))
        ));
        assert!(matches!(
            h.sequencer.run_batch(&dir(), 5, 2).await,
            Err(SequencerError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_below_min_batch_is_noop() {
        let h = harness().await;
        h.enqueue(1, 1).await;
        let steps = h.sequencer.run_batch(&dir(), 2, 10).await.unwrap();
        assert_eq!(
            steps,
            vec![StepOutcome::NoOp {
                pending: 1,
                min_batch: 2
            }]
        );
        assert!(h.batches.is_empty().await);
    }

    #[tokio::test]
    async fn test_create_revision_requires_predecessor() {
        let h = harness().await;
        let definition = MapMetadata::empty(1).next(2, &BTreeMap::new());
        h.batches
            .write_batch_sources(&dir(), 2, &definition)
            .await
            .unwrap();
        assert!(matches!(
            h.sequencer.create_revision(&dir(), 2).await,
            Err(SequencerError::FailedPrecondition(_))
        ));
        assert!(matches!(
            h.sequencer.create_revision(&dir(), 3).await,
            Err(SequencerError::BatchNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_create_revision_twice_is_idempotent() {
        let h = harness().await;
        h.enqueue(1, 1).await;
        h.sequencer.run_batch(&dir(), 1, 10).await.unwrap();

        let steps = h.sequencer.create_revision(&dir(), 1).await.unwrap();
        assert_eq!(steps[0], StepOutcome::AlreadyCreated { revision: 1 });
        assert_eq!(
            steps[1],
            StepOutcome::Published {
                revisions: vec![],
                log_size: 2
            }
        );
    }

    #[tokio::test]
    async fn test_cancelled_sequencer_refuses_work() {
        let coordinator = crate::infra::ShutdownCoordinator::new();
        let h = harness().await;
        let sequencer = h.sequencer.with_shutdown(coordinator.signal());
        coordinator.shutdown();
        assert!(matches!(
            sequencer.publish_batch(&dir()).await,
            Err(SequencerError::Cancelled)
        ));
    }
}
