//! Content processing tasks, extraction sub-tasks and chunks.
//!
//! Phase transitions are conditional updates guarded on the task not being
//! cancelled, so a worker that loses a race with `cancel` sees `false` and
//! discards its result instead of overwriting the cancellation.

use chrono::{DateTime, Duration, Utc};
use libsql::params;

use librarian_shared::{
    ContentProcessingTask, ExtractionOptions, ExtractionSubTask, LibrarianError, Page,
    PageRequest, ProcessingStatus, Result, StoredChunk, TaskCounts, TextChunk, new_id,
};

use crate::Storage;
use crate::rows::{
    blob_to_vec, col_bool, col_i64, col_json, col_opt_i64, col_opt_string, col_opt_ts, col_string,
    col_ts, collect, db_err, first, to_json, ts, vec_to_blob,
};

/// Timestamp group of a processing task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskPhase {
    Processing,
    Extraction,
    Embedding,
}

impl TaskPhase {
    fn column_prefix(self) -> &'static str {
        match self {
            Self::Processing => "processing",
            Self::Extraction => "extraction",
            Self::Embedding => "embedding",
        }
    }
}

/// Filter for paginated task listings. Status is derived, so it is applied
/// after the row filters.
#[derive(Debug, Clone, Default)]
pub struct ProcessingTaskFilter {
    pub library_id: Option<String>,
    pub file_id: Option<String>,
    pub status: Option<ProcessingStatus>,
}

/// Which chunks a similarity search should consider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkScope {
    File(String),
    Library(String),
    All,
}

const TASK_COLUMNS: &str = "id, file_id, library_id, created_at, extraction_options, timeout_ms,
     processing_started_at, processing_finished_at, processing_failed_at,
     processing_timeout, processing_cancelled,
     extraction_started_at, extraction_finished_at, extraction_failed_at, extraction_timeout,
     embedding_started_at, embedding_finished_at, embedding_failed_at, embedding_timeout,
     chunks_count, chunks_size, embedding_model_name, error_message";

const SUB_TASK_COLUMNS: &str = "id, task_id, extraction_method, started_at, finished_at, failed_at,
     timed_out, markdown_file_name, output_length, selected, error_message";

/// Task has not reached a terminal state.
const ACTIVE: &str = "processing_cancelled = 0 AND processing_timeout = 0
     AND processing_finished_at IS NULL AND processing_failed_at IS NULL";

impl Storage {
    // -----------------------------------------------------------------------
    // Tasks
    // -----------------------------------------------------------------------

    /// Create a pending processing task. The insert is gated on the file
    /// having no active task, so concurrent submits cannot both succeed; the
    /// loser gets [`LibrarianError::AlreadyProcessing`].
    pub async fn insert_processing_task(
        &self,
        file_id: &str,
        library_id: &str,
        options: &ExtractionOptions,
        timeout_ms: u64,
    ) -> Result<ContentProcessingTask> {
        let now = Utc::now();
        let id = new_id();
        let inserted = self
            .conn
            .execute(
                &format!(
                    "INSERT INTO content_processing_tasks
                       (id, file_id, library_id, created_at, extraction_options, timeout_ms)
                     SELECT ?1, ?2, ?3, ?4, ?5, ?6
                     WHERE NOT EXISTS (
                       SELECT 1 FROM content_processing_tasks WHERE file_id = ?2 AND {ACTIVE})"
                ),
                params![
                    id.as_str(),
                    file_id,
                    library_id,
                    ts(&now),
                    to_json(options)?,
                    timeout_ms as i64,
                ],
            )
            .await
            .map_err(db_err)?;
        if inserted == 0 {
            return Err(LibrarianError::AlreadyProcessing {
                file_id: file_id.to_string(),
            });
        }

        Ok(ContentProcessingTask {
            id,
            file_id: file_id.to_string(),
            library_id: library_id.to_string(),
            created_at: now,
            extraction_options: options.clone(),
            timeout_ms,
            processing_started_at: None,
            processing_finished_at: None,
            processing_failed_at: None,
            processing_timeout: false,
            processing_cancelled: false,
            extraction_started_at: None,
            extraction_finished_at: None,
            extraction_failed_at: None,
            extraction_timeout: false,
            embedding_started_at: None,
            embedding_finished_at: None,
            embedding_failed_at: None,
            embedding_timeout: false,
            chunks_count: None,
            chunks_size: None,
            embedding_model_name: None,
            error_message: None,
            sub_tasks: Vec::new(),
        })
    }

    /// Id of a non-terminal task targeting the file, if any.
    pub async fn find_active_task_for_file(&self, file_id: &str) -> Result<Option<String>> {
        let rows = self
            .conn
            .query(
                &format!(
                    "SELECT id FROM content_processing_tasks
                     WHERE file_id = ?1 AND {ACTIVE}
                     ORDER BY created_at DESC LIMIT 1"
                ),
                params![file_id],
            )
            .await
            .map_err(db_err)?;
        first(rows, |row| col_string(row, 0)).await
    }

    /// Load a task with its sub-tasks.
    pub async fn get_processing_task(&self, id: &str) -> Result<Option<ContentProcessingTask>> {
        let rows = self
            .conn
            .query(
                &format!("SELECT {TASK_COLUMNS} FROM content_processing_tasks WHERE id = ?1"),
                params![id],
            )
            .await
            .map_err(db_err)?;

        match first(rows, row_to_task).await? {
            Some(mut task) => {
                task.sub_tasks = self.list_sub_tasks(&task.id).await?;
                Ok(Some(task))
            }
            None => Ok(None),
        }
    }

    /// Every task that ever targeted a file, oldest first.
    pub async fn list_tasks_for_file(&self, file_id: &str) -> Result<Vec<ContentProcessingTask>> {
        let rows = self
            .conn
            .query(
                &format!(
                    "SELECT {TASK_COLUMNS} FROM content_processing_tasks
                     WHERE file_id = ?1 ORDER BY created_at, id"
                ),
                params![file_id],
            )
            .await
            .map_err(db_err)?;
        let mut tasks = collect(rows, row_to_task).await?;
        self.attach_sub_tasks(&mut tasks).await?;
        Ok(tasks)
    }

    /// Paginated task listing, newest first.
    pub async fn list_processing_tasks(
        &self,
        filter: &ProcessingTaskFilter,
        page: PageRequest,
    ) -> Result<Page<ContentProcessingTask>> {
        let rows = self
            .conn
            .query(
                &format!(
                    "SELECT {TASK_COLUMNS} FROM content_processing_tasks
                     WHERE (?1 IS NULL OR library_id = ?1) AND (?2 IS NULL OR file_id = ?2)
                     ORDER BY created_at DESC, id DESC"
                ),
                params![filter.library_id.as_deref(), filter.file_id.as_deref()],
            )
            .await
            .map_err(db_err)?;

        let mut tasks = collect(rows, row_to_task).await?;
        if let Some(status) = filter.status {
            tasks.retain(|t| t.processing_status() == status);
        }

        let total = tasks.len() as u64;
        let mut items: Vec<ContentProcessingTask> = tasks
            .into_iter()
            .skip(page.offset as usize)
            .take(page.limit as usize)
            .collect();
        self.attach_sub_tasks(&mut items).await?;

        Ok(Page {
            items,
            total,
            offset: page.offset,
            limit: page.limit,
        })
    }

    /// Claim up to `limit` pending tasks, oldest first, by stamping
    /// `processing_started_at`. A task is returned only if this call set it.
    pub async fn claim_processing_tasks(&self, limit: usize) -> Result<Vec<ContentProcessingTask>> {
        let rows = self
            .conn
            .query(
                "SELECT id FROM content_processing_tasks
                 WHERE processing_started_at IS NULL AND processing_cancelled = 0
                 ORDER BY created_at, rowid
                 LIMIT ?1",
                params![limit as i64],
            )
            .await
            .map_err(db_err)?;
        let candidates = collect(rows, |row| col_string(row, 0)).await?;

        let mut claimed = Vec::new();
        for id in candidates {
            let now = ts(&Utc::now());
            let affected = self
                .conn
                .execute(
                    "UPDATE content_processing_tasks SET processing_started_at = ?1
                     WHERE id = ?2 AND processing_started_at IS NULL AND processing_cancelled = 0",
                    params![now, id.as_str()],
                )
                .await
                .map_err(db_err)?;
            if affected == 1 {
                if let Some(task) = self.get_processing_task(&id).await? {
                    claimed.push(task);
                }
            }
        }
        Ok(claimed)
    }

    /// Stamp `<phase>_started_at`. False if the task was cancelled or the
    /// phase already started.
    pub async fn start_phase(&self, task_id: &str, phase: TaskPhase) -> Result<bool> {
        let p = phase.column_prefix();
        let affected = self
            .conn
            .execute(
                &format!(
                    "UPDATE content_processing_tasks SET {p}_started_at = ?1
                     WHERE id = ?2 AND {p}_started_at IS NULL AND {ACTIVE}"
                ),
                params![ts(&Utc::now()), task_id],
            )
            .await
            .map_err(db_err)?;
        Ok(affected == 1)
    }

    /// Stamp `<phase>_finished_at`. False if the task already ended.
    pub async fn finish_phase(&self, task_id: &str, phase: TaskPhase) -> Result<bool> {
        let p = phase.column_prefix();
        let affected = self
            .conn
            .execute(
                &format!(
                    "UPDATE content_processing_tasks SET {p}_finished_at = ?1
                     WHERE id = ?2 AND {p}_finished_at IS NULL AND {ACTIVE}"
                ),
                params![ts(&Utc::now()), task_id],
            )
            .await
            .map_err(db_err)?;
        Ok(affected == 1)
    }

    /// Record a failure of `phase` and end the task. With `timed_out`, the
    /// phase's timeout flag (and the task's, for [`TaskPhase::Processing`])
    /// is set instead of a plain failure.
    pub async fn fail_task(
        &self,
        task_id: &str,
        phase: TaskPhase,
        message: &str,
        timed_out: bool,
    ) -> Result<bool> {
        let p = phase.column_prefix();
        let now = ts(&Utc::now());
        let flag = i64::from(timed_out);
        let sql = match phase {
            TaskPhase::Processing => format!(
                "UPDATE content_processing_tasks
                 SET processing_failed_at = ?1, processing_timeout = ?2, error_message = ?3
                 WHERE id = ?4 AND {ACTIVE}"
            ),
            _ => format!(
                "UPDATE content_processing_tasks
                 SET {p}_failed_at = ?1, {p}_timeout = ?2, error_message = ?3,
                     processing_failed_at = ?1
                 WHERE id = ?4 AND {ACTIVE}"
            ),
        };
        let affected = self
            .conn
            .execute(&sql, params![now, flag, message, task_id])
            .await
            .map_err(db_err)?;
        Ok(affected == 1)
    }

    /// The task-level deadline elapsed while `phase` was running: flag both
    /// the phase and the task as timed out.
    pub async fn time_out_task(&self, task_id: &str, phase: TaskPhase, message: &str) -> Result<bool> {
        let now = ts(&Utc::now());
        let sql = match phase {
            TaskPhase::Processing => format!(
                "UPDATE content_processing_tasks
                 SET processing_failed_at = ?1, processing_timeout = 1, error_message = ?2
                 WHERE id = ?3 AND {ACTIVE}"
            ),
            _ => {
                let p = phase.column_prefix();
                format!(
                    "UPDATE content_processing_tasks
                     SET {p}_failed_at = ?1, {p}_timeout = 1, processing_failed_at = ?1,
                         processing_timeout = 1, error_message = ?2
                     WHERE id = ?3 AND {ACTIVE}"
                )
            }
        };
        let affected = self
            .conn
            .execute(&sql, params![now.as_str(), message, task_id])
            .await
            .map_err(db_err)?;
        if affected == 0 {
            return Ok(false);
        }

        self.conn
            .execute(
                "UPDATE extraction_sub_tasks
                 SET failed_at = ?1, timed_out = 1, error_message = COALESCE(error_message, ?2)
                 WHERE task_id = ?3 AND finished_at IS NULL AND failed_at IS NULL AND timed_out = 0",
                params![now.as_str(), message, task_id],
            )
            .await
            .map_err(db_err)?;
        Ok(true)
    }

    /// Time out every claimed task whose deadline (claim time plus its
    /// `timeout_ms`) passed before `now`. Catches tasks whose worker went
    /// away without recording an outcome. Returns how many were timed out.
    pub async fn time_out_expired_tasks(&self, now: DateTime<Utc>) -> Result<u64> {
        let rows = self
            .conn
            .query(
                &format!(
                    "SELECT id, timeout_ms, processing_started_at,
                            extraction_started_at, embedding_started_at
                     FROM content_processing_tasks
                     WHERE processing_started_at IS NOT NULL AND {ACTIVE}"
                ),
                params![],
            )
            .await
            .map_err(db_err)?;
        let claimed = collect(rows, |row| {
            Ok((
                col_string(row, 0)?,
                col_i64(row, 1)?,
                col_ts(row, 2)?,
                col_opt_ts(row, 3)?,
                col_opt_ts(row, 4)?,
            ))
        })
        .await?;

        let mut timed_out = 0;
        for (id, timeout_ms, started, extraction, embedding) in claimed {
            if started + Duration::milliseconds(timeout_ms) >= now {
                continue;
            }
            let phase = if embedding.is_some() {
                TaskPhase::Embedding
            } else if extraction.is_some() {
                TaskPhase::Extraction
            } else {
                TaskPhase::Processing
            };
            let message = format!("processing timed out after {timeout_ms}ms");
            if self.time_out_task(&id, phase, &message).await? {
                timed_out += 1;
            }
        }
        Ok(timed_out)
    }

    /// Record chunk accounting once the embedding phase has published chunks.
    pub async fn set_chunk_metrics(
        &self,
        task_id: &str,
        chunks_count: i64,
        chunks_size: i64,
        embedding_model_name: &str,
    ) -> Result<()> {
        self.conn
            .execute(
                "UPDATE content_processing_tasks
                 SET chunks_count = ?1, chunks_size = ?2, embedding_model_name = ?3
                 WHERE id = ?4",
                params![chunks_count, chunks_size, embedding_model_name, task_id],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// Cancel a task and close its open phases and sub-tasks. False when the
    /// task was already terminal.
    pub async fn cancel_processing_task(&self, task_id: &str) -> Result<bool> {
        let now = ts(&Utc::now());
        let affected = self
            .conn
            .execute(
                &format!(
                    "UPDATE content_processing_tasks SET
                       processing_cancelled = 1,
                       error_message = COALESCE(error_message, 'Cancelled by user'),
                       extraction_failed_at = CASE
                         WHEN extraction_started_at IS NOT NULL AND extraction_finished_at IS NULL
                              AND extraction_failed_at IS NULL THEN ?1
                         ELSE extraction_failed_at END,
                       embedding_failed_at = CASE
                         WHEN embedding_started_at IS NOT NULL AND embedding_finished_at IS NULL
                              AND embedding_failed_at IS NULL THEN ?1
                         ELSE embedding_failed_at END
                     WHERE id = ?2 AND {ACTIVE}"
                ),
                params![now.as_str(), task_id],
            )
            .await
            .map_err(db_err)?;

        if affected == 0 {
            return Ok(false);
        }

        self.conn
            .execute(
                "UPDATE extraction_sub_tasks
                 SET failed_at = ?1, error_message = COALESCE(error_message, 'cancelled')
                 WHERE task_id = ?2 AND finished_at IS NULL AND failed_at IS NULL AND timed_out = 0",
                params![now.as_str(), task_id],
            )
            .await
            .map_err(db_err)?;
        Ok(true)
    }

    /// Ids of every non-terminal task in scope.
    pub async fn list_active_processing_ids(&self, library_id: Option<&str>) -> Result<Vec<String>> {
        let rows = self
            .conn
            .query(
                &format!(
                    "SELECT id FROM content_processing_tasks
                     WHERE (?1 IS NULL OR library_id = ?1) AND {ACTIVE}
                     ORDER BY created_at"
                ),
                params![library_id],
            )
            .await
            .map_err(db_err)?;
        collect(rows, |row| col_string(row, 0)).await
    }

    // -----------------------------------------------------------------------
    // Sub-tasks
    // -----------------------------------------------------------------------

    /// Persist a sub-task as given.
    pub async fn insert_sub_task(&self, sub: &ExtractionSubTask) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO extraction_sub_tasks
                   (id, task_id, extraction_method, started_at, finished_at, failed_at, timed_out,
                    markdown_file_name, output_length, selected, error_message)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    sub.id.as_str(),
                    sub.task_id.as_str(),
                    sub.extraction_method.as_str(),
                    sub.started_at.as_ref().map(ts),
                    sub.finished_at.as_ref().map(ts),
                    sub.failed_at.as_ref().map(ts),
                    i64::from(sub.timed_out),
                    sub.markdown_file_name.as_deref(),
                    sub.output_length,
                    i64::from(sub.selected),
                    sub.error_message.as_deref(),
                ],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// Record a successful extraction. False if the sub-task was already closed
    /// (e.g. by cancellation).
    pub async fn finish_sub_task(
        &self,
        sub_task_id: &str,
        markdown_file_name: &str,
        output_length: i64,
    ) -> Result<bool> {
        let affected = self
            .conn
            .execute(
                "UPDATE extraction_sub_tasks
                 SET finished_at = ?1, markdown_file_name = ?2, output_length = ?3
                 WHERE id = ?4 AND finished_at IS NULL AND failed_at IS NULL AND timed_out = 0",
                params![ts(&Utc::now()), markdown_file_name, output_length, sub_task_id],
            )
            .await
            .map_err(db_err)?;
        Ok(affected == 1)
    }

    pub async fn fail_sub_task(&self, sub_task_id: &str, message: &str, timed_out: bool) -> Result<bool> {
        let affected = self
            .conn
            .execute(
                "UPDATE extraction_sub_tasks
                 SET failed_at = ?1, timed_out = ?2, error_message = ?3
                 WHERE id = ?4 AND finished_at IS NULL AND failed_at IS NULL AND timed_out = 0",
                params![ts(&Utc::now()), i64::from(timed_out), message, sub_task_id],
            )
            .await
            .map_err(db_err)?;
        Ok(affected == 1)
    }

    /// Mark one sub-task as the task's extraction result.
    pub async fn select_sub_task(&self, task_id: &str, sub_task_id: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE extraction_sub_tasks SET selected = (id = ?1) WHERE task_id = ?2",
                params![sub_task_id, task_id],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    pub async fn list_sub_tasks(&self, task_id: &str) -> Result<Vec<ExtractionSubTask>> {
        let rows = self
            .conn
            .query(
                &format!(
                    "SELECT {SUB_TASK_COLUMNS} FROM extraction_sub_tasks
                     WHERE task_id = ?1 ORDER BY rowid"
                ),
                params![task_id],
            )
            .await
            .map_err(db_err)?;
        collect(rows, row_to_sub_task).await
    }

    async fn attach_sub_tasks(&self, tasks: &mut [ContentProcessingTask]) -> Result<()> {
        for task in tasks.iter_mut() {
            task.sub_tasks = self.list_sub_tasks(&task.id).await?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Chunks
    // -----------------------------------------------------------------------

    /// Replace a file's chunk set in one transaction.
    pub async fn replace_file_chunks(
        &self,
        file_id: &str,
        library_id: &str,
        task_id: &str,
        chunks: &[(TextChunk, Vec<f32>)],
    ) -> Result<()> {
        let _guard = self.tx_lock.lock().await;
        let tx = self.conn.transaction().await.map_err(db_err)?;

        tx.execute("DELETE FROM chunks WHERE file_id = ?1", params![file_id])
            .await
            .map_err(db_err)?;

        for (chunk, embedding) in chunks {
            tx.execute(
                "INSERT INTO chunks (id, file_id, library_id, task_id, chunk_index, section, text, embedding)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    new_id(),
                    file_id,
                    library_id,
                    task_id,
                    chunk.index as i64,
                    chunk.section.as_deref(),
                    chunk.text.as_str(),
                    vec_to_blob(embedding),
                ],
            )
            .await
            .map_err(db_err)?;
        }

        tx.commit().await.map_err(db_err)?;
        tracing::debug!(file_id, chunks = chunks.len(), "replaced chunk set");
        Ok(())
    }

    /// Chunks with their embeddings, ordered by file then position.
    pub async fn list_chunks(&self, scope: &ChunkScope) -> Result<Vec<StoredChunk>> {
        let (clause, value) = match scope {
            ChunkScope::File(id) => ("file_id = ?1", Some(id.as_str())),
            ChunkScope::Library(id) => ("library_id = ?1", Some(id.as_str())),
            ChunkScope::All => ("?1 IS NULL", None),
        };
        let rows = self
            .conn
            .query(
                &format!(
                    "SELECT id, file_id, library_id, task_id, chunk_index, section, text, embedding
                     FROM chunks WHERE {clause} ORDER BY file_id, chunk_index"
                ),
                params![value],
            )
            .await
            .map_err(db_err)?;

        collect(rows, |row| {
            let blob = row.get::<Vec<u8>>(7).map_err(db_err)?;
            Ok(StoredChunk {
                id: col_string(row, 0)?,
                file_id: col_string(row, 1)?,
                library_id: col_string(row, 2)?,
                task_id: col_string(row, 3)?,
                chunk_index: col_i64(row, 4)?,
                section: col_opt_string(row, 5),
                text: col_string(row, 6)?,
                embedding: blob_to_vec(&blob),
            })
        })
        .await
    }

    // -----------------------------------------------------------------------
    // Queue state
    // -----------------------------------------------------------------------

    /// Live counts over the task table.
    pub async fn content_processing_counts(&self, library_id: Option<&str>) -> Result<TaskCounts> {
        let rows = self
            .conn
            .query(
                &format!(
                    "SELECT
                       SUM(CASE WHEN processing_started_at IS NULL AND processing_cancelled = 0
                                THEN 1 ELSE 0 END),
                       SUM(CASE WHEN processing_started_at IS NOT NULL AND {ACTIVE}
                                THEN 1 ELSE 0 END),
                       SUM(CASE WHEN processing_cancelled = 0 AND processing_failed_at IS NOT NULL
                                THEN 1 ELSE 0 END),
                       SUM(CASE WHEN processing_finished_at IS NOT NULL THEN 1 ELSE 0 END),
                       MAX(COALESCE(processing_finished_at, processing_failed_at))
                     FROM content_processing_tasks
                     WHERE (?1 IS NULL OR library_id = ?1)"
                ),
                params![library_id],
            )
            .await
            .map_err(db_err)?;

        let counts = first(rows, |row| {
            Ok(TaskCounts {
                pending: col_opt_i64(row, 0).unwrap_or(0) as u64,
                processing: col_opt_i64(row, 1).unwrap_or(0) as u64,
                failed: col_opt_i64(row, 2).unwrap_or(0) as u64,
                completed: col_opt_i64(row, 3).unwrap_or(0) as u64,
                last_processed_at: col_opt_ts(row, 4)?,
            })
        })
        .await?;
        Ok(counts.unwrap_or_default())
    }

    /// Failed tasks that are still their file's latest task, for retry.
    pub async fn list_failed_processing_tasks(
        &self,
        library_id: Option<&str>,
    ) -> Result<Vec<ContentProcessingTask>> {
        let columns = TASK_COLUMNS
            .split(',')
            .map(|c| format!("t.{}", c.trim()))
            .collect::<Vec<_>>()
            .join(", ");
        let rows = self
            .conn
            .query(
                &format!(
                    "SELECT {columns}
                     FROM content_processing_tasks t
                     JOIN library_files f ON f.id = t.file_id AND f.archived_at IS NULL
                     WHERE (?1 IS NULL OR t.library_id = ?1)
                       AND t.processing_cancelled = 0
                       AND t.processing_failed_at IS NOT NULL
                       AND NOT EXISTS (
                         SELECT 1 FROM content_processing_tasks n
                         WHERE n.file_id = t.file_id AND n.processing_cancelled = 0
                           AND (n.created_at > t.created_at
                                OR (n.created_at = t.created_at AND n.id > t.id)))
                     ORDER BY t.created_at"
                ),
                params![library_id],
            )
            .await
            .map_err(db_err)?;
        collect(rows, row_to_task).await
    }

    /// Delete failed tasks (and their sub-tasks) in scope.
    pub async fn clear_failed_processing(&self, library_id: Option<&str>) -> Result<u64> {
        self.delete_processing_where(
            "processing_cancelled = 0 AND processing_failed_at IS NOT NULL",
            library_id,
        )
        .await
    }

    /// Delete tasks no worker has claimed yet.
    pub async fn clear_pending_processing(&self, library_id: Option<&str>) -> Result<u64> {
        self.delete_processing_where(
            "processing_started_at IS NULL AND processing_cancelled = 0",
            library_id,
        )
        .await
    }

    async fn delete_processing_where(&self, condition: &str, library_id: Option<&str>) -> Result<u64> {
        let _guard = self.tx_lock.lock().await;
        let tx = self.conn.transaction().await.map_err(db_err)?;

        tx.execute(
            &format!(
                "DELETE FROM extraction_sub_tasks WHERE task_id IN (
                   SELECT id FROM content_processing_tasks
                   WHERE (?1 IS NULL OR library_id = ?1) AND {condition})"
            ),
            params![library_id],
        )
        .await
        .map_err(db_err)?;

        let deleted = tx
            .execute(
                &format!(
                    "DELETE FROM content_processing_tasks
                     WHERE (?1 IS NULL OR library_id = ?1) AND {condition}"
                ),
                params![library_id],
            )
            .await
            .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        Ok(deleted)
    }

}

fn row_to_task(row: &libsql::Row) -> Result<ContentProcessingTask> {
    Ok(ContentProcessingTask {
        id: col_string(row, 0)?,
        file_id: col_string(row, 1)?,
        library_id: col_string(row, 2)?,
        created_at: col_ts(row, 3)?,
        extraction_options: col_json(row, 4)?,
        timeout_ms: col_i64(row, 5)?.max(0) as u64,
        processing_started_at: col_opt_ts(row, 6)?,
        processing_finished_at: col_opt_ts(row, 7)?,
        processing_failed_at: col_opt_ts(row, 8)?,
        processing_timeout: col_bool(row, 9),
        processing_cancelled: col_bool(row, 10),
        extraction_started_at: col_opt_ts(row, 11)?,
        extraction_finished_at: col_opt_ts(row, 12)?,
        extraction_failed_at: col_opt_ts(row, 13)?,
        extraction_timeout: col_bool(row, 14),
        embedding_started_at: col_opt_ts(row, 15)?,
        embedding_finished_at: col_opt_ts(row, 16)?,
        embedding_failed_at: col_opt_ts(row, 17)?,
        embedding_timeout: col_bool(row, 18),
        chunks_count: col_opt_i64(row, 19),
        chunks_size: col_opt_i64(row, 20),
        embedding_model_name: col_opt_string(row, 21),
        error_message: col_opt_string(row, 22),
        sub_tasks: Vec::new(),
    })
}

fn row_to_sub_task(row: &libsql::Row) -> Result<ExtractionSubTask> {
    Ok(ExtractionSubTask {
        id: col_string(row, 0)?,
        task_id: col_string(row, 1)?,
        extraction_method: col_string(row, 2)?,
        started_at: col_opt_ts(row, 3)?,
        finished_at: col_opt_ts(row, 4)?,
        failed_at: col_opt_ts(row, 5)?,
        timed_out: col_bool(row, 6),
        markdown_file_name: col_opt_string(row, 7),
        output_length: col_opt_i64(row, 8),
        selected: col_bool(row, 9),
        error_message: col_opt_string(row, 10),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::NewFile;
    use crate::test_support::test_storage;

    async fn seed(storage: &Storage) -> (String, String) {
        let lib = storage.insert_library("Docs", Some("embed-model")).await.expect("lib");
        let file = storage
            .insert_file(&NewFile {
                library_id: lib.id.clone(),
                name: "a.txt".into(),
                mime_type: "text/plain".into(),
                content: b"hello".to_vec(),
                origin_uri: None,
                origin_modified_at: None,
                crawler_id: None,
                content_hash: None,
            })
            .await
            .expect("file");
        (lib.id, file.id)
    }

    fn sub_task(task_id: &str, method: &str) -> ExtractionSubTask {
        ExtractionSubTask {
            id: new_id(),
            task_id: task_id.to_string(),
            extraction_method: method.to_string(),
            started_at: Some(Utc::now()),
            finished_at: None,
            failed_at: None,
            timed_out: false,
            markdown_file_name: None,
            output_length: None,
            selected: false,
            error_message: None,
        }
    }

    #[tokio::test]
    async fn claim_is_exclusive() {
        let storage = test_storage().await;
        let (lib, file) = seed(&storage).await;
        let task = storage
            .insert_processing_task(&file, &lib, &ExtractionOptions::default(), 60_000)
            .await
            .expect("insert");

        let first_claim = storage.claim_processing_tasks(5).await.expect("claim");
        assert_eq!(first_claim.len(), 1);
        assert_eq!(first_claim[0].id, task.id);
        assert_eq!(first_claim[0].processing_status(), ProcessingStatus::Validating);

        let second_claim = storage.claim_processing_tasks(5).await.expect("claim");
        assert!(second_claim.is_empty());
    }

    #[tokio::test]
    async fn insert_is_rejected_while_file_has_active_task() {
        let storage = test_storage().await;
        let (lib, file) = seed(&storage).await;
        let options = ExtractionOptions::default();

        let (first, second) = tokio::join!(
            storage.insert_processing_task(&file, &lib, &options, 60_000),
            storage.insert_processing_task(&file, &lib, &options, 60_000),
        );
        let first_ok = first.is_ok();
        let loser = if first_ok { second } else { first };
        let err = loser.err().expect("one insert loses");
        assert!(matches!(err, LibrarianError::AlreadyProcessing { .. }));
        assert_eq!(storage.list_tasks_for_file(&file).await.expect("tasks").len(), 1);

        let active = storage
            .find_active_task_for_file(&file)
            .await
            .expect("active")
            .expect("exists");
        storage.cancel_processing_task(&active).await.expect("cancel");
        storage
            .insert_processing_task(&file, &lib, &options, 60_000)
            .await
            .expect("insert after cancel");
    }

    #[tokio::test]
    async fn expired_claims_are_timed_out() {
        let storage = test_storage().await;
        let (lib, file) = seed(&storage).await;
        let (other_lib, unclaimed_file) = seed(&storage).await;
        let task = storage
            .insert_processing_task(&file, &lib, &ExtractionOptions::default(), 100)
            .await
            .expect("insert");
        storage.claim_processing_tasks(1).await.expect("claim");
        storage.start_phase(&task.id, TaskPhase::Extraction).await.expect("start");
        storage.insert_sub_task(&sub_task(&task.id, "text-extraction")).await.expect("sub");
        let pending = storage
            .insert_processing_task(&unclaimed_file, &other_lib, &ExtractionOptions::default(), 100)
            .await
            .expect("insert");

        assert_eq!(storage.time_out_expired_tasks(Utc::now()).await.expect("sweep"), 0);

        let later = Utc::now() + Duration::seconds(1);
        assert_eq!(storage.time_out_expired_tasks(later).await.expect("sweep"), 1);
        assert_eq!(storage.time_out_expired_tasks(later).await.expect("sweep again"), 0);

        let loaded = storage
            .get_processing_task(&task.id)
            .await
            .expect("get")
            .expect("exists");
        assert_eq!(loaded.processing_status(), ProcessingStatus::TimedOut);
        assert!(loaded.extraction_timeout);
        assert!(loaded.sub_tasks[0].timed_out);
        assert!(storage.find_active_task_for_file(&file).await.expect("active").is_none());

        let untouched = storage
            .get_processing_task(&pending.id)
            .await
            .expect("get")
            .expect("exists");
        assert_eq!(untouched.processing_status(), ProcessingStatus::Pending);
    }

    #[tokio::test]
    async fn phases_and_cancellation() {
        let storage = test_storage().await;
        let (lib, file) = seed(&storage).await;
        let task = storage
            .insert_processing_task(&file, &lib, &ExtractionOptions::default(), 60_000)
            .await
            .expect("insert");
        storage.claim_processing_tasks(1).await.expect("claim");

        assert!(storage.start_phase(&task.id, TaskPhase::Extraction).await.expect("start"));
        assert!(!storage.start_phase(&task.id, TaskPhase::Extraction).await.expect("restart"));

        let sub = sub_task(&task.id, "text-extraction");
        storage.insert_sub_task(&sub).await.expect("sub");

        assert!(storage.cancel_processing_task(&task.id).await.expect("cancel"));
        assert!(!storage.cancel_processing_task(&task.id).await.expect("cancel twice"));

        // Late results are discarded.
        assert!(!storage.finish_sub_task(&sub.id, "text-extraction.md", 5).await.expect("finish"));
        assert!(!storage.finish_phase(&task.id, TaskPhase::Extraction).await.expect("finish"));

        let loaded = storage
            .get_processing_task(&task.id)
            .await
            .expect("get")
            .expect("exists");
        assert_eq!(loaded.processing_status(), ProcessingStatus::Cancelled);
        assert_eq!(loaded.sub_tasks.len(), 1);
        assert!(loaded.sub_tasks[0].failed_at.is_some());
        assert!(storage.find_active_task_for_file(&file).await.expect("active").is_none());
    }

    #[tokio::test]
    async fn failure_counts_and_clear_are_scoped() {
        let storage = test_storage().await;
        let (lib_a, file_a) = seed(&storage).await;
        let (lib_b, file_b) = seed(&storage).await;

        for (lib, file) in [(&lib_a, &file_a), (&lib_b, &file_b)] {
            let task = storage
                .insert_processing_task(file, lib, &ExtractionOptions::default(), 60_000)
                .await
                .expect("insert");
            storage.claim_processing_tasks(1).await.expect("claim");
            storage
                .fail_task(&task.id, TaskPhase::Processing, "no methods", false)
                .await
                .expect("fail");
        }

        let before_b = storage.content_processing_counts(Some(&lib_b)).await.expect("counts");
        assert_eq!(before_b.failed, 1);
        assert_eq!(
            storage.list_failed_processing_tasks(Some(&lib_a)).await.expect("failed").len(),
            1
        );

        let removed = storage.clear_failed_processing(Some(&lib_a)).await.expect("clear");
        assert_eq!(removed, 1);
        assert_eq!(
            storage.content_processing_counts(Some(&lib_a)).await.expect("counts").failed,
            0
        );
        assert_eq!(
            storage.content_processing_counts(Some(&lib_b)).await.expect("counts"),
            before_b
        );
    }

    #[tokio::test]
    async fn chunk_replacement_and_scope() {
        let storage = test_storage().await;
        let (lib, file) = seed(&storage).await;
        let chunk = |i: usize, text: &str| {
            (
                TextChunk {
                    index: i,
                    section: None,
                    text: text.to_string(),
                },
                vec![i as f32, 1.0],
            )
        };

        storage
            .replace_file_chunks(&file, &lib, "t1", &[chunk(0, "a"), chunk(1, "b")])
            .await
            .expect("replace");
        storage
            .replace_file_chunks(&file, &lib, "t2", &[chunk(0, "c")])
            .await
            .expect("replace");

        let chunks = storage.list_chunks(&ChunkScope::File(file.clone())).await.expect("list");
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "c");
        assert_eq!(chunks[0].embedding, vec![0.0, 1.0]);
        assert_eq!(storage.list_chunks(&ChunkScope::All).await.expect("all").len(), 1);
    }

    #[tokio::test]
    async fn listing_filters_by_derived_status() {
        let storage = test_storage().await;
        for _ in 0..3 {
            let (lib, file) = seed(&storage).await;
            storage
                .insert_processing_task(&file, &lib, &ExtractionOptions::default(), 60_000)
                .await
                .expect("insert");
        }
        storage.claim_processing_tasks(1).await.expect("claim");

        let pending = storage
            .list_processing_tasks(
                &ProcessingTaskFilter {
                    status: Some(ProcessingStatus::Pending),
                    ..Default::default()
                },
                PageRequest { offset: 0, limit: 1 },
            )
            .await
            .expect("list");
        assert_eq!(pending.total, 2);
        assert_eq!(pending.items.len(), 1);
    }
}
