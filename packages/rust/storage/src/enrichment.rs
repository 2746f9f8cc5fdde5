//! Enrichment task queue.

use chrono::Utc;
use libsql::params;

use librarian_shared::{
    EnrichmentInput, EnrichmentOutput, EnrichmentStatus, EnrichmentTask, Page, PageRequest,
    Result, TaskCounts, new_id,
};

use crate::Storage;
use crate::rows::{
    col_i64, col_opt_i64, col_opt_json, col_opt_string, col_opt_ts, col_parse, col_string, col_ts,
    collect, db_err, first, scalar_u64, to_json, ts,
};

/// Filter for paginated enrichment task listings.
#[derive(Debug, Clone, Default)]
pub struct EnrichmentTaskFilter {
    pub list_id: Option<String>,
    pub field_id: Option<String>,
    pub file_id: Option<String>,
    pub status: Option<EnrichmentStatus>,
}

/// Pending and processing task counts for one field.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldTaskCounters {
    pub field_id: String,
    pub pending: u64,
    pub processing: u64,
}

const TASK_COLUMNS: &str = "id, list_id, field_id, file_id, status, priority, requested_at,
     started_at, completed_at, error_message, input_json, output_json";

/// Restricts a query to tasks whose file belongs to `?1` (when not NULL).
const LIBRARY_SCOPE: &str =
    "(?1 IS NULL OR file_id IN (SELECT id FROM library_files WHERE library_id = ?1))";

impl Storage {
    /// Create a pending task.
    pub async fn insert_enrichment_task(
        &self,
        list_id: &str,
        field_id: &str,
        file_id: &str,
        priority: i64,
    ) -> Result<EnrichmentTask> {
        let now = Utc::now();
        let task = EnrichmentTask {
            id: new_id(),
            list_id: list_id.to_string(),
            field_id: field_id.to_string(),
            file_id: file_id.to_string(),
            status: EnrichmentStatus::Pending,
            priority,
            requested_at: now,
            started_at: None,
            completed_at: None,
            error_message: None,
            input: None,
            output: None,
        };

        self.conn
            .execute(
                "INSERT INTO enrichment_tasks
                   (id, list_id, field_id, file_id, status, priority, requested_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    task.id.as_str(),
                    list_id,
                    field_id,
                    file_id,
                    task.status.as_str(),
                    priority,
                    ts(&now),
                ],
            )
            .await
            .map_err(db_err)?;
        Ok(task)
    }

    pub async fn get_enrichment_task(&self, id: &str) -> Result<Option<EnrichmentTask>> {
        let rows = self
            .conn
            .query(
                &format!("SELECT {TASK_COLUMNS} FROM enrichment_tasks WHERE id = ?1"),
                params![id],
            )
            .await
            .map_err(db_err)?;
        first(rows, row_to_task).await
    }

    /// Remove not-yet-started tasks of a list, optionally narrowed to one
    /// field and/or file. Tasks already processing are left alone.
    pub async fn delete_pending_enrichment_tasks(
        &self,
        list_id: &str,
        field_id: Option<&str>,
        file_id: Option<&str>,
    ) -> Result<u64> {
        self.conn
            .execute(
                "DELETE FROM enrichment_tasks
                 WHERE status = 'pending' AND list_id = ?1
                   AND (?2 IS NULL OR field_id = ?2)
                   AND (?3 IS NULL OR file_id = ?3)",
                params![list_id, field_id, file_id],
            )
            .await
            .map_err(db_err)
    }

    /// Claim up to `limit` pending tasks: highest priority first, then oldest
    /// request. A task is returned only if this call flipped it to processing.
    pub async fn claim_enrichment_tasks(&self, limit: usize) -> Result<Vec<EnrichmentTask>> {
        let rows = self
            .conn
            .query(
                "SELECT id FROM enrichment_tasks WHERE status = 'pending'
                 ORDER BY priority DESC, requested_at, rowid
                 LIMIT ?1",
                params![limit as i64],
            )
            .await
            .map_err(db_err)?;
        let candidates = collect(rows, |row| col_string(row, 0)).await?;

        let mut claimed = Vec::new();
        for id in candidates {
            let affected = self
                .conn
                .execute(
                    "UPDATE enrichment_tasks SET status = 'processing', started_at = ?1
                     WHERE id = ?2 AND status = 'pending'",
                    params![ts(&Utc::now()), id.as_str()],
                )
                .await
                .map_err(db_err)?;
            if affected == 1 {
                if let Some(task) = self.get_enrichment_task(&id).await? {
                    claimed.push(task);
                }
            }
        }
        Ok(claimed)
    }

    /// Attach the input snapshot captured when execution starts.
    pub async fn set_enrichment_input(&self, task_id: &str, input: &EnrichmentInput) -> Result<()> {
        self.conn
            .execute(
                "UPDATE enrichment_tasks SET input_json = ?1 WHERE id = ?2",
                params![to_json(input)?, task_id],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// Close a processing task. False if it is no longer processing, in which
    /// case the caller must not apply the result.
    pub async fn complete_enrichment_task(
        &self,
        task_id: &str,
        status: EnrichmentStatus,
        error_message: Option<&str>,
        output: &EnrichmentOutput,
    ) -> Result<bool> {
        let affected = self
            .conn
            .execute(
                "UPDATE enrichment_tasks
                 SET status = ?1, completed_at = ?2, error_message = ?3, output_json = ?4
                 WHERE id = ?5 AND status = 'processing'",
                params![
                    status.as_str(),
                    ts(&Utc::now()),
                    error_message,
                    to_json(output)?,
                    task_id,
                ],
            )
            .await
            .map_err(db_err)?;
        Ok(affected == 1)
    }

    /// Return tasks left in `processing` by a previous process to `pending`.
    pub async fn reset_orphaned_enrichment_tasks(&self) -> Result<u64> {
        self.conn
            .execute(
                "UPDATE enrichment_tasks SET status = 'pending', started_at = NULL
                 WHERE status = 'processing'",
                params![],
            )
            .await
            .map_err(db_err)
    }

    /// Live queue counts, optionally for files of one library.
    pub async fn enrichment_counts(&self, library_id: Option<&str>) -> Result<TaskCounts> {
        let rows = self
            .conn
            .query(
                &format!(
                    "SELECT
                       SUM(CASE WHEN status = 'pending' THEN 1 ELSE 0 END),
                       SUM(CASE WHEN status = 'processing' THEN 1 ELSE 0 END),
                       SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END),
                       SUM(CASE WHEN status = 'completed' THEN 1 ELSE 0 END),
                       MAX(completed_at)
                     FROM enrichment_tasks WHERE {LIBRARY_SCOPE}"
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

    /// Per-status task counts of a list, optionally for one field.
    pub async fn enrichment_status_counts(
        &self,
        list_id: &str,
        field_id: Option<&str>,
    ) -> Result<Vec<(EnrichmentStatus, u64)>> {
        let rows = self
            .conn
            .query(
                "SELECT status, COUNT(*) FROM enrichment_tasks
                 WHERE list_id = ?1 AND (?2 IS NULL OR field_id = ?2)
                 GROUP BY status",
                params![list_id, field_id],
            )
            .await
            .map_err(db_err)?;
        let found = collect(rows, |row| {
            let status: EnrichmentStatus = col_parse(row, 0)?;
            Ok((status, col_i64(row, 1)?.max(0) as u64))
        })
        .await?;

        Ok(EnrichmentStatus::all()
            .iter()
            .map(|s| {
                let count = found
                    .iter()
                    .find(|(status, _)| status == s)
                    .map_or(0, |(_, n)| *n);
                (*s, count)
            })
            .collect())
    }

    /// Pending and processing counters for each field of a list.
    pub async fn field_task_counters(&self, list_id: &str) -> Result<Vec<FieldTaskCounters>> {
        let rows = self
            .conn
            .query(
                "SELECT f.id,
                        SUM(CASE WHEN t.status = 'pending' THEN 1 ELSE 0 END),
                        SUM(CASE WHEN t.status = 'processing' THEN 1 ELSE 0 END)
                 FROM list_fields f
                 LEFT JOIN enrichment_tasks t ON t.field_id = f.id
                 WHERE f.list_id = ?1
                 GROUP BY f.id
                 ORDER BY f.field_order",
                params![list_id],
            )
            .await
            .map_err(db_err)?;
        collect(rows, |row| {
            Ok(FieldTaskCounters {
                field_id: col_string(row, 0)?,
                pending: col_opt_i64(row, 1).unwrap_or(0) as u64,
                processing: col_opt_i64(row, 2).unwrap_or(0) as u64,
            })
        })
        .await
    }

    /// Paginated task listing with snapshots, newest request first.
    pub async fn list_enrichment_tasks(
        &self,
        filter: &EnrichmentTaskFilter,
        page: PageRequest,
    ) -> Result<Page<EnrichmentTask>> {
        let condition = "(?1 IS NULL OR list_id = ?1) AND (?2 IS NULL OR field_id = ?2)
             AND (?3 IS NULL OR file_id = ?3) AND (?4 IS NULL OR status = ?4)";
        let status = filter.status.map(|s| s.as_str());

        let total = scalar_u64(
            self.conn
                .query(
                    &format!("SELECT COUNT(*) FROM enrichment_tasks WHERE {condition}"),
                    params![
                        filter.list_id.as_deref(),
                        filter.field_id.as_deref(),
                        filter.file_id.as_deref(),
                        status,
                    ],
                )
                .await
                .map_err(db_err)?,
        )
        .await?;

        let rows = self
            .conn
            .query(
                &format!(
                    "SELECT {TASK_COLUMNS} FROM enrichment_tasks WHERE {condition}
                     ORDER BY requested_at DESC, rowid DESC LIMIT ?5 OFFSET ?6"
                ),
                params![
                    filter.list_id.as_deref(),
                    filter.field_id.as_deref(),
                    filter.file_id.as_deref(),
                    status,
                    page.limit as i64,
                    page.offset as i64,
                ],
            )
            .await
            .map_err(db_err)?;

        Ok(Page {
            items: collect(rows, row_to_task).await?,
            total,
            offset: page.offset,
            limit: page.limit,
        })
    }

    /// Failed tasks that are the latest request for their (field, file).
    pub async fn list_failed_enrichment_tasks(
        &self,
        library_id: Option<&str>,
    ) -> Result<Vec<EnrichmentTask>> {
        let rows = self
            .conn
            .query(
                &format!(
                    "SELECT {TASK_COLUMNS} FROM enrichment_tasks t
                     WHERE t.status = 'failed' AND {LIBRARY_SCOPE}
                       AND NOT EXISTS (
                         SELECT 1 FROM enrichment_tasks n
                         WHERE n.field_id = t.field_id AND n.file_id = t.file_id
                           AND n.rowid > t.rowid)
                     ORDER BY t.requested_at"
                ),
                params![library_id],
            )
            .await
            .map_err(db_err)?;
        collect(rows, row_to_task).await
    }

    pub async fn clear_failed_enrichment(&self, library_id: Option<&str>) -> Result<u64> {
        self.conn
            .execute(
                &format!("DELETE FROM enrichment_tasks WHERE status = 'failed' AND {LIBRARY_SCOPE}"),
                params![library_id],
            )
            .await
            .map_err(db_err)
    }

    pub async fn clear_pending_enrichment(&self, library_id: Option<&str>) -> Result<u64> {
        self.conn
            .execute(
                &format!("DELETE FROM enrichment_tasks WHERE status = 'pending' AND {LIBRARY_SCOPE}"),
                params![library_id],
            )
            .await
            .map_err(db_err)
    }

    /// Mark every pending task in scope `canceled`.
    pub async fn cancel_pending_enrichment(&self, library_id: Option<&str>) -> Result<u64> {
        self.conn
            .execute(
                &format!(
                    "UPDATE enrichment_tasks SET status = 'canceled', completed_at = ?2
                     WHERE status = 'pending' AND {LIBRARY_SCOPE}"
                ),
                params![library_id, ts(&Utc::now())],
            )
            .await
            .map_err(db_err)
    }
}

fn row_to_task(row: &libsql::Row) -> Result<EnrichmentTask> {
    Ok(EnrichmentTask {
        id: col_string(row, 0)?,
        list_id: col_string(row, 1)?,
        field_id: col_string(row, 2)?,
        file_id: col_string(row, 3)?,
        status: col_parse(row, 4)?,
        priority: col_i64(row, 5)?,
        requested_at: col_ts(row, 6)?,
        started_at: col_opt_ts(row, 7)?,
        completed_at: col_opt_ts(row, 8)?,
        error_message: col_opt_string(row, 9),
        input: col_opt_json(row, 10)?,
        output: col_opt_json(row, 11)?,
    })
}
