//! Content processing pipeline: validation, parallel extraction, chunking
//! and all-or-nothing embedding of one library file per task.
//!
//! Every phase transition goes through a guarded storage update, so a task
//! cancelled mid-flight discards whatever its in-flight calls return.

use std::cmp::Reverse;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use tracing::{debug, info, instrument, warn};

use librarian_shared::{
    ContentProcessingTask, EMBEDDING_ONLY_METHOD, EmbeddingStatus, ExtractionOptions,
    ExtractionStatus, ExtractionSubTask, LibrarianError, LibraryFile, Page, PageRequest,
    ProcessingConfig, ProcessingStatus, Result, TextChunk, derive_file_status, new_id,
};
use librarian_storage::{ProcessingTaskFilter, Storage, TaskPhase};

use crate::chunking::chunk_markdown;
use crate::providers::{EmbeddingProvider, ExtractionMethod, ExtractionRegistry};

/// A request to process a file.
#[derive(Debug, Clone, Default)]
pub struct SubmitRequest {
    /// Extraction methods by registry id; empty uses the configured defaults.
    pub methods: Vec<String>,
    pub method_options: std::collections::BTreeMap<String, serde_json::Value>,
    /// Cancel an active task for the file instead of rejecting the request.
    pub force: bool,
    /// Overrides the configured task timeout.
    pub timeout_ms: Option<u64>,
}

/// Aggregate processing state of a file, derived from its latest task.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct FileProcessingStatus {
    pub file_id: String,
    pub processing_status: ProcessingStatus,
    pub extraction_status: ExtractionStatus,
    pub embedding_status: EmbeddingStatus,
    pub latest_task_id: Option<String>,
}

/// File, embedding model and extraction methods of a task that passed
/// pre-flight validation.
type Validated = (LibraryFile, String, Vec<Arc<dyn ExtractionMethod>>);

/// Successful output of one extraction method.
struct Extracted {
    sub_task_id: String,
    method: String,
    priority: usize,
    markdown: String,
}

/// Drives content processing tasks.
pub struct ContentProcessor {
    storage: Arc<Storage>,
    registry: Arc<ExtractionRegistry>,
    embedder: Arc<dyn EmbeddingProvider>,
    config: ProcessingConfig,
}

impl ContentProcessor {
    pub fn new(
        storage: Arc<Storage>,
        registry: Arc<ExtractionRegistry>,
        embedder: Arc<dyn EmbeddingProvider>,
        config: ProcessingConfig,
    ) -> Self {
        Self {
            storage,
            registry,
            embedder,
            config,
        }
    }

    // -----------------------------------------------------------------------
    // Requests
    // -----------------------------------------------------------------------

    /// Create a pending task for a file.
    #[instrument(skip_all, fields(file_id = %file_id, force = request.force))]
    pub async fn submit(&self, file_id: &str, request: SubmitRequest) -> Result<String> {
        let file = self.require_file(file_id).await?;

        let requested = if request.methods.is_empty() {
            self.config.default_extraction_methods.clone()
        } else {
            request.methods.clone()
        };
        let methods = self.registry.resolve(&requested, &file.mime_type)?;

        self.take_over_active_task(file_id, request.force).await?;

        let options = ExtractionOptions {
            methods: methods.iter().map(|m| m.id().to_string()).collect(),
            method_options: request.method_options,
        };
        let timeout_ms = request.timeout_ms.unwrap_or(self.config.task_timeout_ms);
        let task = self
            .storage
            .insert_processing_task(file_id, &file.library_id, &options, timeout_ms)
            .await?;

        info!(task_id = %task.id, methods = ?options.methods, "processing task submitted");
        Ok(task.id)
    }

    /// Create a task that re-embeds the extraction output of an earlier task
    /// (the given one, or the file's latest successfully extracted task).
    #[instrument(skip_all, fields(file_id = %file_id))]
    pub async fn submit_embedding_only(
        &self,
        file_id: &str,
        existing_task_id: Option<&str>,
    ) -> Result<String> {
        let file = self.require_file(file_id).await?;

        let source = match existing_task_id {
            Some(id) => {
                let task = self
                    .storage
                    .get_processing_task(id)
                    .await?
                    .ok_or_else(|| LibrarianError::not_found("processing task", id))?;
                if task.file_id != file_id {
                    return Err(LibrarianError::validation(format!(
                        "task {id} does not belong to file {file_id}"
                    )));
                }
                task
            }
            None => self
                .storage
                .list_tasks_for_file(file_id)
                .await?
                .into_iter()
                .rev()
                .find(|t| t.winning_sub_task().is_some())
                .ok_or_else(|| {
                    LibrarianError::validation(format!(
                        "file {file_id} has no successful extraction to reuse"
                    ))
                })?,
        };
        let winner = source.winning_sub_task().cloned().ok_or_else(|| {
            LibrarianError::validation(format!("task {} has no successful extraction", source.id))
        })?;

        self.take_over_active_task(file_id, false).await?;

        let options = ExtractionOptions {
            methods: vec![EMBEDDING_ONLY_METHOD.to_string()],
            ..ExtractionOptions::default()
        };
        let task = self
            .storage
            .insert_processing_task(file_id, &file.library_id, &options, self.config.task_timeout_ms)
            .await?;

        let now = Utc::now();
        self.storage
            .insert_sub_task(&ExtractionSubTask {
                id: new_id(),
                task_id: task.id.clone(),
                extraction_method: EMBEDDING_ONLY_METHOD.to_string(),
                started_at: Some(now),
                finished_at: Some(now),
                failed_at: None,
                timed_out: false,
                markdown_file_name: winner.markdown_file_name.clone(),
                output_length: winner.output_length,
                selected: true,
                error_message: None,
            })
            .await?;

        info!(task_id = %task.id, source_task = %source.id, "embedding-only task submitted");
        Ok(task.id)
    }

    /// Cancel a task. Returns false when it had already ended.
    #[instrument(skip_all, fields(task_id = %task_id))]
    pub async fn cancel(&self, task_id: &str) -> Result<bool> {
        let task = self.get_task(task_id).await?;
        if task.is_terminal() {
            debug!("task already terminal, nothing to cancel");
            return Ok(false);
        }
        let cancelled = self.storage.cancel_processing_task(task_id).await?;
        if cancelled {
            info!("processing task cancelled");
        }
        Ok(cancelled)
    }

    /// Cancel every active task in scope.
    pub async fn cancel_all(&self, library_id: Option<&str>) -> Result<u64> {
        let mut cancelled = 0;
        for id in self.storage.list_active_processing_ids(library_id).await? {
            if self.storage.cancel_processing_task(&id).await? {
                cancelled += 1;
            }
        }
        Ok(cancelled)
    }

    /// Re-submit every file whose latest task failed, as new tasks carrying
    /// the failed task's options.
    pub async fn retry_failed(&self, library_id: Option<&str>) -> Result<u64> {
        let mut created = 0;
        for failed in self.storage.list_failed_processing_tasks(library_id).await? {
            let inserted = self
                .storage
                .insert_processing_task(
                    &failed.file_id,
                    &failed.library_id,
                    &failed.extraction_options,
                    failed.timeout_ms,
                )
                .await;
            match inserted {
                Ok(_) => created += 1,
                Err(e) if e.is_conflict() => continue,
                Err(e) => return Err(e),
            }
        }
        info!(created, "retried failed processing tasks");
        Ok(created)
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub async fn get_task(&self, task_id: &str) -> Result<ContentProcessingTask> {
        self.storage
            .get_processing_task(task_id)
            .await?
            .ok_or_else(|| LibrarianError::not_found("processing task", task_id))
    }

    pub async fn list_tasks(
        &self,
        filter: &ProcessingTaskFilter,
        page: PageRequest,
    ) -> Result<Page<ContentProcessingTask>> {
        self.storage.list_processing_tasks(filter, page).await
    }

    /// Derive a file's status from its task history.
    pub async fn file_status(&self, file_id: &str) -> Result<FileProcessingStatus> {
        self.require_file(file_id).await?;
        let tasks = self.storage.list_tasks_for_file(file_id).await?;
        let latest = tasks
            .iter()
            .filter(|t| !t.processing_cancelled)
            .max_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));

        Ok(FileProcessingStatus {
            file_id: file_id.to_string(),
            processing_status: derive_file_status(&tasks),
            extraction_status: latest.map_or(ExtractionStatus::None, |t| t.extraction_status()),
            embedding_status: latest.map_or(EmbeddingStatus::None, |t| t.embedding_status()),
            latest_task_id: latest.map(|t| t.id.clone()),
        })
    }

    // -----------------------------------------------------------------------
    // Execution
    // -----------------------------------------------------------------------

    /// Execute a claimed task under its overall deadline. Task failures are
    /// recorded on the task; only storage errors are returned.
    #[instrument(skip_all, fields(task_id = %task.id, file_id = %task.file_id))]
    pub async fn run_task(&self, task: ContentProcessingTask) -> Result<()> {
        let deadline = Duration::from_millis(task.timeout_ms);
        match tokio::time::timeout(deadline, self.execute(&task)).await {
            Ok(result) => result,
            Err(_) => {
                let current = self.get_task(&task.id).await?;
                let phase = running_phase(&current);
                let message = format!("processing timed out after {}ms", task.timeout_ms);
                if self.storage.time_out_task(&task.id, phase, &message).await? {
                    warn!(phase = ?phase, timeout_ms = task.timeout_ms, "processing task timed out");
                }
                Ok(())
            }
        }
    }

    async fn execute(&self, task: &ContentProcessingTask) -> Result<()> {
        let embedding_only = task
            .extraction_options
            .methods
            .iter()
            .any(|m| m == EMBEDDING_ONLY_METHOD);

        // Pre-flight validation.
        let (file, model, methods) = match self.validate(task, embedding_only).await? {
            Ok(validated) => validated,
            Err(message) => {
                warn!(%message, "processing task failed validation");
                self.storage
                    .fail_task(&task.id, TaskPhase::Processing, &message, false)
                    .await?;
                return Ok(());
            }
        };

        // Phase 1: extraction.
        let markdown = if embedding_only {
            match self.reuse_extraction(task).await? {
                Some(markdown) => markdown,
                None => return Ok(()),
            }
        } else {
            match self.extract(task, &file, &methods).await? {
                Some(markdown) => markdown,
                None => return Ok(()),
            }
        };

        // Phase 2: chunking and embedding.
        self.embed(task, &file, &model, &markdown).await
    }

    /// `Ok(Err(message))` is a validation failure of the task.
    async fn validate(
        &self,
        task: &ContentProcessingTask,
        embedding_only: bool,
    ) -> Result<std::result::Result<Validated, String>> {
        let Some(file) = self.storage.get_file(&task.file_id).await? else {
            return Ok(Err(format!("file {} no longer exists", task.file_id)));
        };
        if file.archived_at.is_some() {
            return Ok(Err(format!("file {} is archived", file.id)));
        }
        let Some(library) = self.storage.get_library(&file.library_id).await? else {
            return Ok(Err(format!("library {} no longer exists", file.library_id)));
        };
        let Some(model) = library.embedding_model.filter(|m| !m.is_empty()) else {
            return Ok(Err(format!(
                "library '{}' has no embedding model configured",
                library.name
            )));
        };
        if embedding_only {
            return Ok(Ok((file, model, Vec::new())));
        }
        match self
            .registry
            .resolve(&task.extraction_options.methods, &file.mime_type)
        {
            Ok(methods) => Ok(Ok((file, model, methods))),
            Err(e) => Ok(Err(e.to_string())),
        }
    }

    /// Load the artifact an embedding-only task copied from its source task.
    async fn reuse_extraction(&self, task: &ContentProcessingTask) -> Result<Option<String>> {
        if !self.storage.start_phase(&task.id, TaskPhase::Extraction).await? {
            return Ok(None);
        }
        let artifact = task
            .winning_sub_task()
            .and_then(|s| s.markdown_file_name.clone());
        let markdown = match artifact {
            Some(name) => self.storage.get_markdown(&task.file_id, &name).await?,
            None => None,
        };
        let Some(markdown) = markdown else {
            self.storage
                .fail_task(
                    &task.id,
                    TaskPhase::Extraction,
                    "previous extraction output is no longer available",
                    false,
                )
                .await?;
            return Ok(None);
        };
        if !self.storage.finish_phase(&task.id, TaskPhase::Extraction).await? {
            return Ok(None);
        }
        Ok(Some(markdown))
    }

    /// Run every method as its own sub-task and pick the winner. `None` when
    /// the phase failed or the task was cancelled.
    async fn extract(
        &self,
        task: &ContentProcessingTask,
        file: &LibraryFile,
        methods: &[Arc<dyn ExtractionMethod>],
    ) -> Result<Option<String>> {
        if !self.storage.start_phase(&task.id, TaskPhase::Extraction).await? {
            return Ok(None);
        }
        let Some(content) = self.storage.get_file_content(&file.id).await? else {
            self.storage
                .fail_task(&task.id, TaskPhase::Extraction, "file content is missing", false)
                .await?;
            return Ok(None);
        };

        let timeout_ms = self.config.extraction_timeout_ms;
        let mut attempts = Vec::with_capacity(methods.len());
        for method in methods {
            let sub = ExtractionSubTask {
                id: new_id(),
                task_id: task.id.clone(),
                extraction_method: method.id().to_string(),
                started_at: Some(Utc::now()),
                finished_at: None,
                failed_at: None,
                timed_out: false,
                markdown_file_name: None,
                output_length: None,
                selected: false,
                error_message: None,
            };
            self.storage.insert_sub_task(&sub).await?;

            let method = Arc::clone(method);
            let options = task.extraction_options.method_options.get(method.id());
            let content = &content;
            attempts.push(async move {
                let outcome = tokio::time::timeout(
                    Duration::from_millis(timeout_ms),
                    method.extract(file, content, options),
                )
                .await;
                (sub.id, method, outcome)
            });
        }

        let mut successes = Vec::new();
        let mut errors = Vec::new();
        let mut all_timed_out = true;
        for (sub_id, method, outcome) in join_all(attempts).await {
            match outcome {
                Ok(Ok(markdown)) => {
                    let artifact = format!("{}.md", method.id());
                    let length = markdown.chars().count() as i64;
                    if self.storage.finish_sub_task(&sub_id, &artifact, length).await? {
                        self.storage.put_markdown(&file.id, &artifact, &markdown).await?;
                        debug!(method = method.id(), length, "extraction method succeeded");
                        successes.push(Extracted {
                            sub_task_id: sub_id,
                            method: method.id().to_string(),
                            priority: self.registry.priority(method.id()),
                            markdown,
                        });
                    }
                }
                Ok(Err(e)) => {
                    all_timed_out = false;
                    warn!(method = method.id(), error = %e, "extraction method failed");
                    self.storage.fail_sub_task(&sub_id, &e.to_string(), false).await?;
                    errors.push(format!("{}: {e}", method.id()));
                }
                Err(_) => {
                    let err = LibrarianError::timeout(format!("extraction '{}'", method.id()), timeout_ms);
                    warn!(method = method.id(), timeout_ms, "extraction method timed out");
                    self.storage.fail_sub_task(&sub_id, &err.to_string(), true).await?;
                    errors.push(format!("{}: {err}", method.id()));
                }
            }
        }

        let Some(winner) = pick_winner(successes) else {
            if errors.is_empty() {
                // Nothing succeeded or failed: the sub-tasks were closed by a cancel.
                return Ok(None);
            }
            let message = format!("all extraction methods failed: {}", errors.join("; "));
            self.storage
                .fail_task(&task.id, TaskPhase::Extraction, &message, all_timed_out)
                .await?;
            return Ok(None);
        };

        self.storage.select_sub_task(&task.id, &winner.sub_task_id).await?;
        if !self.storage.finish_phase(&task.id, TaskPhase::Extraction).await? {
            return Ok(None);
        }
        info!(method = %winner.method, length = winner.markdown.len(), "extraction finished");
        Ok(Some(winner.markdown))
    }

    async fn embed(
        &self,
        task: &ContentProcessingTask,
        file: &LibraryFile,
        model: &str,
        markdown: &str,
    ) -> Result<()> {
        if !self.storage.start_phase(&task.id, TaskPhase::Embedding).await? {
            return Ok(());
        }

        let chunks = chunk_markdown(markdown, self.config.chunk_size, self.config.chunk_overlap);
        if chunks.is_empty() {
            self.storage
                .fail_task(&task.id, TaskPhase::Embedding, "extraction produced no chunks", false)
                .await?;
            return Ok(());
        }

        let timeout_ms = self.config.embedding_timeout_ms;
        let embedded = tokio::time::timeout(
            Duration::from_millis(timeout_ms),
            self.embed_chunks(model, &chunks),
        )
        .await;

        let vectors = match embedded {
            Ok(Ok(vectors)) => vectors,
            Ok(Err(e)) => {
                warn!(error = %e, "embedding failed");
                self.storage
                    .fail_task(&task.id, TaskPhase::Embedding, &e.to_string(), false)
                    .await?;
                return Ok(());
            }
            Err(_) => {
                let err = LibrarianError::timeout("embedding", timeout_ms);
                warn!(timeout_ms, "embedding timed out");
                self.storage
                    .fail_task(&task.id, TaskPhase::Embedding, &err.to_string(), true)
                    .await?;
                return Ok(());
            }
        };

        // The guarded transition decides whether the result is still wanted.
        if !self.storage.finish_phase(&task.id, TaskPhase::Embedding).await? {
            debug!("task ended while embedding, discarding vectors");
            return Ok(());
        }

        let chunks_size: usize = chunks.iter().map(|c| c.text.chars().count()).sum();
        let chunk_count = chunks.len();
        let pairs: Vec<(TextChunk, Vec<f32>)> = chunks.into_iter().zip(vectors).collect();
        if let Err(e) = self
            .storage
            .replace_file_chunks(&file.id, &file.library_id, &task.id, &pairs)
            .await
        {
            self.storage
                .fail_task(&task.id, TaskPhase::Processing, &e.to_string(), false)
                .await?;
            return Err(e);
        }
        self.storage
            .set_chunk_metrics(&task.id, chunk_count as i64, chunks_size as i64, model)
            .await?;
        self.storage.finish_phase(&task.id, TaskPhase::Processing).await?;

        info!(chunks = chunk_count, chars = chunks_size, model, "embedding finished");
        Ok(())
    }

    /// Embed all chunks in batches; any failure or short answer fails the lot.
    async fn embed_chunks(&self, model: &str, chunks: &[TextChunk]) -> Result<Vec<Vec<f32>>> {
        let batch_size = self.config.embedding_batch_size.max(1);
        let mut vectors = Vec::with_capacity(chunks.len());
        for batch in chunks.chunks(batch_size) {
            let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
            let tokens: usize = texts.iter().map(|t| self.embedder.estimate_tokens(t)).sum();
            debug!(batch = texts.len(), tokens, "embedding batch");

            let batch_vectors = self.embedder.embed(model, &texts).await?;
            if batch_vectors.len() != texts.len() {
                return Err(LibrarianError::Embedding(format!(
                    "provider returned {} vectors for {} chunks",
                    batch_vectors.len(),
                    texts.len()
                )));
            }
            vectors.extend(batch_vectors);
        }
        Ok(vectors)
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    async fn require_file(&self, file_id: &str) -> Result<LibraryFile> {
        let file = self
            .storage
            .get_file(file_id)
            .await?
            .ok_or_else(|| LibrarianError::not_found("file", file_id))?;
        if file.archived_at.is_some() {
            return Err(LibrarianError::validation(format!("file {file_id} is archived")));
        }
        Ok(file)
    }

    /// Reject (or, when forced, cancel) an active task for the file.
    async fn take_over_active_task(&self, file_id: &str, force: bool) -> Result<()> {
        if let Some(active) = self.storage.find_active_task_for_file(file_id).await? {
            if !force {
                return Err(LibrarianError::AlreadyProcessing {
                    file_id: file_id.to_string(),
                });
            }
            self.storage.cancel_processing_task(&active).await?;
            info!(cancelled_task = %active, "cancelled active task for forced resubmit");
        }
        Ok(())
    }
}

/// Longest output wins; ties go to the higher-priority method.
fn pick_winner(successes: Vec<Extracted>) -> Option<Extracted> {
    successes
        .into_iter()
        .max_by_key(|e| (e.markdown.chars().count(), Reverse(e.priority)))
}

/// The phase a task was in when its deadline elapsed.
fn running_phase(task: &ContentProcessingTask) -> TaskPhase {
    if task.embedding_started_at.is_some() {
        TaskPhase::Embedding
    } else if task.extraction_started_at.is_some() {
        TaskPhase::Extraction
    } else {
        TaskPhase::Processing
    }
}
