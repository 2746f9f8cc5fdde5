//! Queue worker manager.
//!
//! One worker group per queue type. A group is a polling loop that claims
//! pending tasks in a single serialized step and runs them concurrently up to
//! its concurrency limit. Stopping a group ends the loop; tasks already
//! running finish in the background.
//!
//! Recovery of work a dead worker left behind differs per queue: expired
//! processing tasks are timed out on every poll, while enrichment tasks stuck
//! in `processing` are returned to pending once, on the first start of the
//! enrichment group in this process.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use librarian_shared::{
    ContentProcessingTask, EnrichmentConfig, EnrichmentTask, ProcessingConfig,
    QueueOperationResult, QueueStatus, QueueType, Result,
};
use librarian_storage::Storage;

use crate::enrichment::EnrichmentEngine;
use crate::processing::ContentProcessor;

/// Polling and concurrency limits of one worker group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueSettings {
    pub concurrency: usize,
    pub batch_size: usize,
    pub poll_interval: Duration,
}

impl From<&ProcessingConfig> for QueueSettings {
    fn from(config: &ProcessingConfig) -> Self {
        Self {
            concurrency: config.concurrency.max(1),
            batch_size: config.batch_size.max(1),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
        }
    }
}

impl From<&EnrichmentConfig> for QueueSettings {
    fn from(config: &EnrichmentConfig) -> Self {
        Self {
            concurrency: config.concurrency.max(1),
            batch_size: config.batch_size.max(1),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
        }
    }
}

/// Claims and executes the tasks of one queue.
#[async_trait]
trait QueueJobs: Send + Sync + 'static {
    type Task: Send + 'static;

    /// Close out tasks no live worker will finish. Returns how many.
    async fn recover(&self) -> Result<u64> {
        Ok(0)
    }

    async fn claim(&self, limit: usize) -> Result<Vec<Self::Task>>;

    async fn execute(&self, task: Self::Task) -> Result<()>;
}

struct ProcessingJobs {
    storage: Arc<Storage>,
    processor: Arc<ContentProcessor>,
}

#[async_trait]
impl QueueJobs for ProcessingJobs {
    type Task = ContentProcessingTask;

    async fn recover(&self) -> Result<u64> {
        self.storage.time_out_expired_tasks(Utc::now()).await
    }

    async fn claim(&self, limit: usize) -> Result<Vec<ContentProcessingTask>> {
        self.storage.claim_processing_tasks(limit).await
    }

    async fn execute(&self, task: ContentProcessingTask) -> Result<()> {
        self.processor.run_task(task).await
    }
}

struct EnrichmentJobs {
    storage: Arc<Storage>,
    engine: Arc<EnrichmentEngine>,
}

#[async_trait]
impl QueueJobs for EnrichmentJobs {
    type Task = EnrichmentTask;

    async fn claim(&self, limit: usize) -> Result<Vec<EnrichmentTask>> {
        self.storage.claim_enrichment_tasks(limit).await
    }

    async fn execute(&self, task: EnrichmentTask) -> Result<()> {
        self.engine.run_task(task).await.map(|_| ())
    }
}

struct WorkerGroup {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl WorkerGroup {
    fn is_running(&self) -> bool {
        !self.cancel.is_cancelled() && !self.handle.is_finished()
    }
}

/// Starts, stops and reports on the worker groups.
pub struct QueueWorkerManager {
    storage: Arc<Storage>,
    processor: Arc<ContentProcessor>,
    engine: Arc<EnrichmentEngine>,
    settings: HashMap<QueueType, QueueSettings>,
    groups: Mutex<HashMap<QueueType, WorkerGroup>>,
    /// Set once enrichment orphans from an earlier process were reset. Later
    /// starts must not reset: a stopped group's tasks may still be running.
    orphans_reset: AtomicBool,
}

impl QueueWorkerManager {
    pub fn new(
        storage: Arc<Storage>,
        processor: Arc<ContentProcessor>,
        engine: Arc<EnrichmentEngine>,
        processing: QueueSettings,
        enrichment: QueueSettings,
    ) -> Self {
        Self {
            storage,
            processor,
            engine,
            settings: HashMap::from([
                (QueueType::ContentProcessing, processing),
                (QueueType::Enrichment, enrichment),
            ]),
            groups: Mutex::new(HashMap::new()),
            orphans_reset: AtomicBool::new(false),
        }
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    pub async fn start(&self, queue: QueueType) -> Result<QueueOperationResult> {
        let mut groups = self.groups.lock().await;
        self.start_locked(&mut groups, queue).await
    }

    pub async fn stop(&self, queue: QueueType) -> Result<QueueOperationResult> {
        let mut groups = self.groups.lock().await;
        Ok(stop_locked(&mut groups, queue))
    }

    pub async fn start_all(&self) -> Result<QueueOperationResult> {
        let mut groups = self.groups.lock().await;
        let mut started = 0;
        for queue in QueueType::all() {
            if self.start_locked(&mut groups, *queue).await?.affected_count > 0 {
                started += 1;
            }
        }
        Ok(QueueOperationResult::ok(
            format!("Started {started} queue worker group(s)"),
            started,
        ))
    }

    pub async fn stop_all(&self) -> Result<QueueOperationResult> {
        let mut groups = self.groups.lock().await;
        let mut stopped = 0;
        for queue in QueueType::all() {
            stopped += stop_locked(&mut groups, *queue).affected_count;
        }
        Ok(QueueOperationResult::ok(
            format!("Stopped {stopped} queue worker group(s)"),
            stopped,
        ))
    }

    /// Stop every group and wait for in-flight tasks to finish.
    pub async fn shutdown(&self) {
        let drained: Vec<(QueueType, WorkerGroup)> = self.groups.lock().await.drain().collect();
        for (queue, group) in drained {
            group.cancel.cancel();
            if let Err(e) = group.handle.await {
                error!(queue = %queue, error = %e, "worker group panicked");
            }
        }
        info!("queue workers shut down");
    }

    async fn start_locked(
        &self,
        groups: &mut HashMap<QueueType, WorkerGroup>,
        queue: QueueType,
    ) -> Result<QueueOperationResult> {
        if groups.get(&queue).is_some_and(WorkerGroup::is_running) {
            return Ok(QueueOperationResult::ok(
                format!("{queue} workers are already running"),
                0,
            ));
        }

        let settings = self.settings.get(&queue).copied().unwrap_or(QueueSettings {
            concurrency: 1,
            batch_size: 1,
            poll_interval: Duration::from_secs(5),
        });
        let cancel = CancellationToken::new();
        let span = info_span!("queue_worker", queue = %queue);

        let mut message = format!("{queue} workers started");
        let handle = match queue {
            QueueType::ContentProcessing => {
                let jobs = Arc::new(ProcessingJobs {
                    storage: Arc::clone(&self.storage),
                    processor: Arc::clone(&self.processor),
                });
                let expired = jobs.recover().await?;
                if expired > 0 {
                    warn!(expired, "timed out expired processing tasks");
                    message.push_str(&format!(" ({expired} expired task(s) timed out)"));
                }
                tokio::spawn(worker_loop(jobs, settings, cancel.clone()).instrument(span))
            }
            QueueType::Enrichment => {
                // Groups lock is held, so no other start can interleave here.
                if !self.orphans_reset.load(Ordering::Acquire) {
                    let reset = self.storage.reset_orphaned_enrichment_tasks().await?;
                    self.orphans_reset.store(true, Ordering::Release);
                    if reset > 0 {
                        warn!(reset, "returned orphaned enrichment tasks to pending");
                        message.push_str(&format!(" ({reset} orphaned task(s) returned to pending)"));
                    }
                }
                let jobs = Arc::new(EnrichmentJobs {
                    storage: Arc::clone(&self.storage),
                    engine: Arc::clone(&self.engine),
                });
                tokio::spawn(worker_loop(jobs, settings, cancel.clone()).instrument(span))
            }
        };

        groups.insert(queue, WorkerGroup { cancel, handle });
        info!(queue = %queue, concurrency = settings.concurrency, "queue workers started");
        Ok(QueueOperationResult::ok(message, 1))
    }

    // -----------------------------------------------------------------------
    // Bulk operations
    // -----------------------------------------------------------------------

    pub async fn retry_failed(
        &self,
        queue: QueueType,
        library_id: Option<&str>,
    ) -> Result<QueueOperationResult> {
        let count = match queue {
            QueueType::ContentProcessing => self.processor.retry_failed(library_id).await?,
            QueueType::Enrichment => self.engine.retry_failed(library_id).await?,
        };
        Ok(QueueOperationResult::ok(
            format!("Re-enqueued {count} failed {queue} task(s)"),
            count,
        ))
    }

    pub async fn clear_failed(
        &self,
        queue: QueueType,
        library_id: Option<&str>,
    ) -> Result<QueueOperationResult> {
        let count = match queue {
            QueueType::ContentProcessing => self.storage.clear_failed_processing(library_id).await?,
            QueueType::Enrichment => self.storage.clear_failed_enrichment(library_id).await?,
        };
        info!(queue = %queue, count, "failed tasks cleared");
        Ok(QueueOperationResult::ok(
            format!("Cleared {count} failed {queue} task(s)"),
            count,
        ))
    }

    pub async fn clear_pending(
        &self,
        queue: QueueType,
        library_id: Option<&str>,
    ) -> Result<QueueOperationResult> {
        let count = match queue {
            QueueType::ContentProcessing => self.storage.clear_pending_processing(library_id).await?,
            QueueType::Enrichment => self.storage.clear_pending_enrichment(library_id).await?,
        };
        info!(queue = %queue, count, "pending tasks cleared");
        Ok(QueueOperationResult::ok(
            format!("Cleared {count} pending {queue} task(s)"),
            count,
        ))
    }

    pub async fn cancel_all(
        &self,
        queue: QueueType,
        library_id: Option<&str>,
    ) -> Result<QueueOperationResult> {
        let count = match queue {
            QueueType::ContentProcessing => self.processor.cancel_all(library_id).await?,
            QueueType::Enrichment => self.engine.cancel_all(library_id).await?,
        };
        info!(queue = %queue, count, "tasks cancelled");
        Ok(QueueOperationResult::ok(
            format!("Cancelled {count} {queue} task(s)"),
            count,
        ))
    }

    // -----------------------------------------------------------------------
    // Status
    // -----------------------------------------------------------------------

    /// Live state of every queue, counted from the task tables.
    pub async fn status(&self, library_id: Option<&str>) -> Result<Vec<QueueStatus>> {
        let running: HashMap<QueueType, bool> = self
            .groups
            .lock()
            .await
            .iter()
            .map(|(q, g)| (*q, g.is_running()))
            .collect();

        let mut statuses = Vec::with_capacity(QueueType::all().len());
        for queue in QueueType::all() {
            let counts = match queue {
                QueueType::ContentProcessing => {
                    self.storage.content_processing_counts(library_id).await?
                }
                QueueType::Enrichment => self.storage.enrichment_counts(library_id).await?,
            };
            statuses.push(QueueStatus {
                queue_type: *queue,
                is_running: running.get(queue).copied().unwrap_or(false),
                counts,
            });
        }
        Ok(statuses)
    }
}

fn stop_locked(groups: &mut HashMap<QueueType, WorkerGroup>, queue: QueueType) -> QueueOperationResult {
    match groups.remove(&queue) {
        Some(group) if group.is_running() => {
            group.cancel.cancel();
            info!(queue = %queue, "queue workers stopping");
            QueueOperationResult::ok(format!("{queue} workers stopped"), 1)
        }
        _ => QueueOperationResult::ok(format!("{queue} workers are not running"), 0),
    }
}

async fn worker_loop<J: QueueJobs>(jobs: Arc<J>, settings: QueueSettings, cancel: CancellationToken) {
    let permits = Arc::new(Semaphore::new(settings.concurrency));
    let claim_lock = Arc::new(Mutex::new(()));
    let mut in_flight = JoinSet::new();

    loop {
        if cancel.is_cancelled() {
            break;
        }

        match jobs.recover().await {
            Ok(0) => {}
            Ok(recovered) => warn!(recovered, "recovered abandoned tasks"),
            Err(e) => error!(error = %e, "failed to recover abandoned tasks"),
        }

        let capacity = permits.available_permits().min(settings.batch_size);
        let mut claimed_any = false;
        if capacity > 0 {
            let claimed = {
                let _claim = claim_lock.lock().await;
                jobs.claim(capacity).await
            };
            match claimed {
                Ok(tasks) => {
                    claimed_any = !tasks.is_empty();
                    for task in tasks {
                        let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
                            break;
                        };
                        let jobs = Arc::clone(&jobs);
                        in_flight.spawn(
                            async move {
                                let _permit = permit;
                                if let Err(e) = jobs.execute(task).await {
                                    error!(error = %e, "task execution failed");
                                }
                            }
                            .in_current_span(),
                        );
                    }
                }
                Err(e) => error!(error = %e, "failed to claim tasks"),
            }
        }

        while let Some(joined) = in_flight.try_join_next() {
            if let Err(e) = joined {
                error!(error = %e, "worker task panicked");
            }
        }

        if claimed_any && permits.available_permits() > 0 {
            continue;
        }
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(settings.poll_interval) => {}
        }
    }

    debug!(in_flight = in_flight.len(), "worker loop stopped, draining");
    while let Some(joined) = in_flight.join_next().await {
        if let Err(e) = joined {
            error!(error = %e, "worker task panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::StoredChunkIndex;
    use crate::processing::SubmitRequest;
    use crate::providers::ExtractionRegistry;
    use crate::testing::{FixedEmbedder, ScriptedModel, StaticMethod, seed_file, test_storage};
    use librarian_shared::{EnrichmentStatus, FieldSourceType, FieldType, ProcessingStatus};
    use librarian_storage::NewListField;

    fn fast() -> QueueSettings {
        QueueSettings {
            concurrency: 2,
            batch_size: 2,
            poll_interval: Duration::from_millis(20),
        }
    }

    fn manager(storage: Arc<Storage>, method: StaticMethod) -> QueueWorkerManager {
        manager_with_model(storage, method, Arc::new(ScriptedModel::replying("Computed")))
    }

    fn manager_with_model(
        storage: Arc<Storage>,
        method: StaticMethod,
        model: Arc<ScriptedModel>,
    ) -> QueueWorkerManager {
        let mut registry = ExtractionRegistry::new();
        registry.register(Arc::new(method));
        let processor = Arc::new(ContentProcessor::new(
            Arc::clone(&storage),
            Arc::new(registry),
            Arc::new(FixedEmbedder::default()),
            ProcessingConfig::default(),
        ));
        let engine = Arc::new(EnrichmentEngine::new(
            Arc::clone(&storage),
            model,
            Arc::new(FixedEmbedder::default()),
            Arc::new(StoredChunkIndex::new(Arc::clone(&storage))),
            EnrichmentConfig::default(),
        ));
        QueueWorkerManager::new(storage, processor, engine, fast(), fast())
    }

    async fn wait_until<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..200 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn start_and_stop_are_idempotent() {
        let storage = Arc::new(test_storage().await);
        let m = manager(storage, StaticMethod::new("text", "body"));

        let first = m.start(QueueType::ContentProcessing).await.expect("start");
        assert!(first.success);
        assert_eq!(first.affected_count, 1);
        let again = m.start(QueueType::ContentProcessing).await.expect("start again");
        assert!(again.success);
        assert!(again.message.contains("already running"));

        let status = m.status(None).await.expect("status");
        assert!(status.iter().any(|s| s.queue_type == QueueType::ContentProcessing && s.is_running));
        assert!(status.iter().any(|s| s.queue_type == QueueType::Enrichment && !s.is_running));

        assert_eq!(m.stop(QueueType::ContentProcessing).await.expect("stop").affected_count, 1);
        let noop = m.stop(QueueType::ContentProcessing).await.expect("stop again");
        assert!(noop.success);
        assert_eq!(noop.affected_count, 0);

        assert_eq!(m.start_all().await.expect("all").affected_count, 2);
        assert_eq!(m.stop_all().await.expect("all").affected_count, 2);
        m.shutdown().await;
    }

    #[tokio::test]
    async fn processing_workers_drain_pending_tasks() {
        let storage = Arc::new(test_storage().await);
        let file = seed_file(&storage, Some("embed-small")).await;
        let m = manager(Arc::clone(&storage), StaticMethod::new("text", "# Notes\n\nalpha beta"));

        let task_id = m
            .processor
            .submit(&file.id, SubmitRequest::default())
            .await
            .expect("submit");
        m.start(QueueType::ContentProcessing).await.expect("start");

        wait_until(|| {
            let processor = Arc::clone(&m.processor);
            let task_id = task_id.clone();
            async move {
                processor
                    .get_task(&task_id)
                    .await
                    .is_ok_and(|t| t.processing_status() == ProcessingStatus::Completed)
            }
        })
        .await;

        let status = m.status(None).await.expect("status");
        let processing = status
            .iter()
            .find(|s| s.queue_type == QueueType::ContentProcessing)
            .expect("queue");
        assert_eq!(processing.counts.completed, 1);
        assert_eq!(processing.counts.pending, 0);
        assert!(processing.counts.last_processed_at.is_some());
        m.shutdown().await;
    }

    async fn summary_task(storage: &Storage) -> EnrichmentTask {
        let file = seed_file(storage, Some("embed-small")).await;
        let list = storage
            .insert_list("Overview", &[file.library_id.clone()])
            .await
            .expect("list");
        let field = storage
            .insert_list_field(&NewListField {
                list_id: list.id.clone(),
                name: "Summary".into(),
                field_type: FieldType::Text,
                source_type: FieldSourceType::LlmComputed,
                file_property: None,
                prompt: Some("Summarize.".into()),
                content_query: None,
                language_model: Some("small-model".into()),
                use_vector_store: false,
                failure_terms: None,
                context_field_ids: Vec::new(),
            })
            .await
            .expect("field");
        storage
            .insert_enrichment_task(&list.id, &field.id, &file.id, 0)
            .await
            .expect("task")
    }

    async fn wait_for_enrichment(storage: &Arc<Storage>, task_id: &str, status: EnrichmentStatus) {
        wait_until(|| {
            let storage = Arc::clone(storage);
            let id = task_id.to_string();
            async move {
                storage
                    .get_enrichment_task(&id)
                    .await
                    .ok()
                    .flatten()
                    .is_some_and(|t| t.status == status)
            }
        })
        .await;
    }

    #[tokio::test]
    async fn enrichment_start_resets_orphans() {
        let storage = Arc::new(test_storage().await);
        let task = summary_task(&storage).await;
        // Left in processing by a previous process.
        storage.claim_enrichment_tasks(1).await.expect("claim");

        let m = manager(Arc::clone(&storage), StaticMethod::new("text", "body"));
        let started = m.start(QueueType::Enrichment).await.expect("start");
        assert!(started.message.contains("1 orphaned"));

        wait_for_enrichment(&storage, &task.id, EnrichmentStatus::Completed).await;
        m.shutdown().await;
    }

    #[tokio::test]
    async fn restart_does_not_rerun_in_flight_enrichment() {
        let storage = Arc::new(test_storage().await);
        let task = summary_task(&storage).await;
        let model = Arc::new(ScriptedModel::replying("Computed").delayed(600));
        let m = manager_with_model(
            Arc::clone(&storage),
            StaticMethod::new("text", "body"),
            Arc::clone(&model),
        );

        m.start(QueueType::Enrichment).await.expect("start");
        wait_for_enrichment(&storage, &task.id, EnrichmentStatus::Processing).await;
        m.stop(QueueType::Enrichment).await.expect("stop");
        let restarted = m.start(QueueType::Enrichment).await.expect("restart");
        assert!(!restarted.message.contains("orphaned"));

        wait_for_enrichment(&storage, &task.id, EnrichmentStatus::Completed).await;
        assert_eq!(model.calls().len(), 1);
        m.shutdown().await;
    }

    #[tokio::test]
    async fn abandoned_processing_task_times_out() {
        let storage = Arc::new(test_storage().await);
        let file = seed_file(&storage, Some("embed-small")).await;
        let m = manager(Arc::clone(&storage), StaticMethod::new("text", "body"));

        let task_id = m
            .processor
            .submit(
                &file.id,
                SubmitRequest {
                    timeout_ms: Some(100),
                    ..SubmitRequest::default()
                },
            )
            .await
            .expect("submit");
        // Claimed by a worker that went away without recording anything.
        drop(storage.claim_processing_tasks(1).await.expect("claim"));
        m.start(QueueType::ContentProcessing).await.expect("start");

        wait_until(|| {
            let processor = Arc::clone(&m.processor);
            let task_id = task_id.clone();
            async move {
                processor
                    .get_task(&task_id)
                    .await
                    .is_ok_and(|t| t.processing_status() == ProcessingStatus::TimedOut)
            }
        })
        .await;
        let status = m.processor.file_status(&file.id).await.expect("status");
        assert_eq!(status.processing_status, ProcessingStatus::TimedOut);

        m.processor
            .submit(&file.id, SubmitRequest::default())
            .await
            .expect("resubmit after timeout");
        m.shutdown().await;
    }

    #[tokio::test]
    async fn clear_failed_is_scoped_to_library() {
        let storage = Arc::new(test_storage().await);
        let first = seed_file(&storage, Some("m")).await;
        let second = seed_file(&storage, Some("m")).await;
        let m = manager(Arc::clone(&storage), StaticMethod::failing("text"));

        for file in [&first, &second] {
            m.processor
                .submit(&file.id, SubmitRequest::default())
                .await
                .expect("submit");
        }
        for task in storage.claim_processing_tasks(10).await.expect("claim") {
            m.processor.run_task(task).await.expect("run");
        }

        let failed_in = |statuses: &[QueueStatus]| {
            statuses
                .iter()
                .find(|s| s.queue_type == QueueType::ContentProcessing)
                .map(|s| s.counts.failed)
        };
        let before = failed_in(&m.status(Some(&first.library_id)).await.expect("status"));
        assert_eq!(before, Some(1));

        let result = m
            .clear_failed(QueueType::ContentProcessing, Some(&first.library_id))
            .await
            .expect("clear");
        assert_eq!(result.affected_count, 1);

        let after = failed_in(&m.status(Some(&first.library_id)).await.expect("status"));
        assert_eq!(after, Some(before.unwrap_or(0) - result.affected_count));
        let other = failed_in(&m.status(Some(&second.library_id)).await.expect("status"));
        assert_eq!(other, Some(1));
    }

    #[tokio::test]
    async fn retry_and_cancel_report_counts() {
        let storage = Arc::new(test_storage().await);
        let file = seed_file(&storage, Some("m")).await;
        let m = manager(Arc::clone(&storage), StaticMethod::failing("text"));

        m.processor
            .submit(&file.id, SubmitRequest::default())
            .await
            .expect("submit");
        let task = storage.claim_processing_tasks(1).await.expect("claim").remove(0);
        m.processor.run_task(task).await.expect("run");

        let retried = m
            .retry_failed(QueueType::ContentProcessing, None)
            .await
            .expect("retry");
        assert_eq!(retried.affected_count, 1);

        let cancelled = m
            .cancel_all(QueueType::ContentProcessing, Some(&file.library_id))
            .await
            .expect("cancel");
        assert_eq!(cancelled.affected_count, 1);

        let pending = m
            .clear_pending(QueueType::ContentProcessing, None)
            .await
            .expect("clear");
        assert_eq!(pending.affected_count, 0);
    }
}
