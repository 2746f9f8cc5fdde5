//! Crawlers, schedules, runs and library updates.

use chrono::{DateTime, Utc};
use libsql::params;

use librarian_shared::{
    Crawler, CrawlerInput, CrawlerRun, CrawlerSchedule, LibrarianError, LibraryUpdate,
    NewLibraryUpdate, Page, PageRequest, Result, UpdateStats, UpdateType, new_id,
};

use crate::Storage;
use crate::rows::{
    col_bool, col_i64, col_json, col_opt_bool, col_opt_f64, col_opt_i64, col_opt_string,
    col_opt_ts, col_parse, col_string, col_ts, collect, db_err, first, scalar_u64, to_json, ts,
};

/// How a run ended, written by [`Storage::finish_run`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    pub success: bool,
    pub error_message: Option<String>,
}

const CRAWLER_COLUMNS: &str = "c.id, c.library_id, c.uri, c.uri_type, c.max_depth, c.max_pages,
     c.min_file_size_mb, c.max_file_size_mb, c.include_patterns, c.exclude_patterns,
     c.allowed_mime_types, c.last_run_at, c.created_at, c.updated_at,
     s.monday, s.tuesday, s.wednesday, s.thursday, s.friday, s.saturday, s.sunday,
     s.hour, s.minute, s.active";

const RUN_COLUMNS: &str = "id, crawler_id, started_at, ended_at, stopped_by_user, success,
     error_message, triggered_by, updates_count, update_stats";

const UPDATE_COLUMNS: &str = "id, library_id, crawler_run_id, file_id, update_type, file_name,
     origin_uri, file_size, filter_type, filter_value, message, created_at";

impl Storage {
    // -----------------------------------------------------------------------
    // Crawlers
    // -----------------------------------------------------------------------

    pub async fn insert_crawler(&self, input: &CrawlerInput) -> Result<Crawler> {
        let id = new_id();
        let now = ts(&Utc::now());
        self.conn
            .execute(
                "INSERT INTO crawlers (id, library_id, uri, uri_type, max_depth, max_pages,
                    min_file_size_mb, max_file_size_mb, include_patterns, exclude_patterns,
                    allowed_mime_types, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?12)",
                params![
                    id.as_str(),
                    input.library_id.as_str(),
                    input.uri.as_str(),
                    input.uri_type.as_str(),
                    i64::from(input.max_depth),
                    i64::from(input.max_pages),
                    input.min_file_size_mb,
                    input.max_file_size_mb,
                    to_json(&input.include_patterns)?,
                    to_json(&input.exclude_patterns)?,
                    to_json(&input.allowed_mime_types)?,
                    now,
                ],
            )
            .await
            .map_err(db_err)?;

        self.write_schedule(&id, input.schedule.as_ref()).await?;
        self.require_crawler(&id).await
    }

    /// Overwrite a crawler's configuration. `None` if it does not exist.
    pub async fn update_crawler(&self, id: &str, input: &CrawlerInput) -> Result<Option<Crawler>> {
        let affected = self
            .conn
            .execute(
                "UPDATE crawlers SET library_id = ?1, uri = ?2, uri_type = ?3, max_depth = ?4,
                    max_pages = ?5, min_file_size_mb = ?6, max_file_size_mb = ?7,
                    include_patterns = ?8, exclude_patterns = ?9, allowed_mime_types = ?10,
                    updated_at = ?11
                 WHERE id = ?12",
                params![
                    input.library_id.as_str(),
                    input.uri.as_str(),
                    input.uri_type.as_str(),
                    i64::from(input.max_depth),
                    i64::from(input.max_pages),
                    input.min_file_size_mb,
                    input.max_file_size_mb,
                    to_json(&input.include_patterns)?,
                    to_json(&input.exclude_patterns)?,
                    to_json(&input.allowed_mime_types)?,
                    ts(&Utc::now()),
                    id,
                ],
            )
            .await
            .map_err(db_err)?;
        if affected == 0 {
            return Ok(None);
        }
        self.write_schedule(id, input.schedule.as_ref()).await?;
        self.get_crawler(id).await
    }

    /// Delete a crawler and its schedule. Run and update history is kept.
    pub async fn delete_crawler(&self, id: &str) -> Result<bool> {
        self.conn
            .execute("DELETE FROM crawler_schedules WHERE crawler_id = ?1", params![id])
            .await
            .map_err(db_err)?;
        let affected = self
            .conn
            .execute("DELETE FROM crawlers WHERE id = ?1", params![id])
            .await
            .map_err(db_err)?;
        Ok(affected == 1)
    }

    pub async fn get_crawler(&self, id: &str) -> Result<Option<Crawler>> {
        let rows = self
            .conn
            .query(
                &format!(
                    "SELECT {CRAWLER_COLUMNS} FROM crawlers c
                     LEFT JOIN crawler_schedules s ON s.crawler_id = c.id
                     WHERE c.id = ?1"
                ),
                params![id],
            )
            .await
            .map_err(db_err)?;
        first(rows, row_to_crawler).await
    }

    async fn require_crawler(&self, id: &str) -> Result<Crawler> {
        self.get_crawler(id)
            .await?
            .ok_or_else(|| LibrarianError::not_found("crawler", id))
    }

    pub async fn list_crawlers(&self, library_id: Option<&str>) -> Result<Vec<Crawler>> {
        let rows = self
            .conn
            .query(
                &format!(
                    "SELECT {CRAWLER_COLUMNS} FROM crawlers c
                     LEFT JOIN crawler_schedules s ON s.crawler_id = c.id
                     WHERE (?1 IS NULL OR c.library_id = ?1)
                     ORDER BY c.created_at"
                ),
                params![library_id],
            )
            .await
            .map_err(db_err)?;
        collect(rows, row_to_crawler).await
    }

    /// Crawlers with an active schedule.
    pub async fn list_scheduled_crawlers(&self) -> Result<Vec<Crawler>> {
        let rows = self
            .conn
            .query(
                &format!(
                    "SELECT {CRAWLER_COLUMNS} FROM crawlers c
                     JOIN crawler_schedules s ON s.crawler_id = c.id
                     WHERE s.active = 1
                     ORDER BY c.created_at"
                ),
                params![],
            )
            .await
            .map_err(db_err)?;
        collect(rows, row_to_crawler).await
    }

    pub async fn set_crawler_last_run(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        self.conn
            .execute(
                "UPDATE crawlers SET last_run_at = ?1 WHERE id = ?2",
                params![ts(&at), id],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn write_schedule(&self, crawler_id: &str, schedule: Option<&CrawlerSchedule>) -> Result<()> {
        let Some(s) = schedule else {
            self.conn
                .execute(
                    "DELETE FROM crawler_schedules WHERE crawler_id = ?1",
                    params![crawler_id],
                )
                .await
                .map_err(db_err)?;
            return Ok(());
        };

        self.conn
            .execute(
                "INSERT INTO crawler_schedules (crawler_id, monday, tuesday, wednesday, thursday,
                    friday, saturday, sunday, hour, minute, active)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                 ON CONFLICT(crawler_id) DO UPDATE SET
                   monday = excluded.monday, tuesday = excluded.tuesday,
                   wednesday = excluded.wednesday, thursday = excluded.thursday,
                   friday = excluded.friday, saturday = excluded.saturday,
                   sunday = excluded.sunday, hour = excluded.hour,
                   minute = excluded.minute, active = excluded.active",
                params![
                    crawler_id,
                    i64::from(s.monday),
                    i64::from(s.tuesday),
                    i64::from(s.wednesday),
                    i64::from(s.thursday),
                    i64::from(s.friday),
                    i64::from(s.saturday),
                    i64::from(s.sunday),
                    i64::from(s.hour),
                    i64::from(s.minute),
                    i64::from(s.active),
                ],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Runs
    // -----------------------------------------------------------------------

    /// Open a run unless the crawler already has one. This is the crawler's
    /// "is running" gate: the conditional insert, backed by a partial unique
    /// index, lets exactly one concurrent caller through.
    pub async fn try_start_run(
        &self,
        crawler_id: &str,
        triggered_by: Option<&str>,
    ) -> Result<Option<CrawlerRun>> {
        let id = new_id();
        let result = self
            .conn
            .execute(
                "INSERT INTO crawler_runs (id, crawler_id, started_at, triggered_by)
                 SELECT ?1, ?2, ?3, ?4
                 WHERE NOT EXISTS (
                   SELECT 1 FROM crawler_runs WHERE crawler_id = ?2 AND ended_at IS NULL)",
                params![id.as_str(), crawler_id, ts(&Utc::now()), triggered_by],
            )
            .await;

        let inserted = match result {
            Ok(affected) => affected,
            Err(e) if e.to_string().contains("UNIQUE") => 0,
            Err(e) => return Err(db_err(e)),
        };

        if inserted == 0 {
            return Ok(None);
        }
        self.get_run(&id).await
    }

    pub async fn get_run(&self, id: &str) -> Result<Option<CrawlerRun>> {
        let rows = self
            .conn
            .query(
                &format!("SELECT {RUN_COLUMNS} FROM crawler_runs WHERE id = ?1"),
                params![id],
            )
            .await
            .map_err(db_err)?;
        first(rows, row_to_run).await
    }

    /// The crawler's open run, if any.
    pub async fn get_open_run(&self, crawler_id: &str) -> Result<Option<CrawlerRun>> {
        let rows = self
            .conn
            .query(
                &format!(
                    "SELECT {RUN_COLUMNS} FROM crawler_runs
                     WHERE crawler_id = ?1 AND ended_at IS NULL"
                ),
                params![crawler_id],
            )
            .await
            .map_err(db_err)?;
        first(rows, row_to_run).await
    }

    /// Ask the crawler's open run to stop. The run stays open, keeping the
    /// one-run gate closed, until its traversal finishes and calls
    /// [`Storage::finish_run`]. Stopping a run that is already stopping closes
    /// it outright, for runs whose process died. Returns the run id, or
    /// `None` when nothing was running.
    pub async fn stop_run(&self, crawler_id: &str) -> Result<Option<String>> {
        let Some(open) = self.get_open_run(crawler_id).await? else {
            return Ok(None);
        };
        let now = ts(&Utc::now());
        let sql = if open.stopped_by_user.is_none() {
            "UPDATE crawler_runs SET stopped_by_user = ?1
             WHERE id = ?2 AND ended_at IS NULL AND stopped_by_user IS NULL"
        } else {
            "UPDATE crawler_runs
             SET ended_at = ?1, success = 0, error_message = 'Run stopped by user'
             WHERE id = ?2 AND ended_at IS NULL"
        };
        let affected = self
            .conn
            .execute(sql, params![now, open.id.as_str()])
            .await
            .map_err(db_err)?;
        Ok((affected == 1).then_some(open.id))
    }

    /// Whether the run's traversal should stop: it was stopped by the user or
    /// already closed.
    pub async fn is_stop_requested(&self, run_id: &str) -> Result<bool> {
        let rows = self
            .conn
            .query(
                "SELECT ended_at IS NOT NULL OR stopped_by_user IS NOT NULL
                 FROM crawler_runs WHERE id = ?1",
                params![run_id],
            )
            .await
            .map_err(db_err)?;
        Ok(first(rows, |row| Ok(col_bool(row, 0))).await?.unwrap_or(true))
    }

    /// Write the run's aggregate stats and close it. Stats are recomputed from
    /// the update table in one query. A run stopped by the user closes as
    /// unsuccessful whatever `outcome` says; an already closed run keeps its
    /// outcome.
    pub async fn finish_run(&self, run_id: &str, outcome: &RunOutcome) -> Result<CrawlerRun> {
        let stats = self.update_stats_for_run(run_id).await?;
        let total: u64 = stats.values().sum();

        self.conn
            .execute(
                "UPDATE crawler_runs SET updates_count = ?1, update_stats = ?2 WHERE id = ?3",
                params![total as i64, to_json(&stats)?, run_id],
            )
            .await
            .map_err(db_err)?;

        self.conn
            .execute(
                "UPDATE crawler_runs
                 SET ended_at = ?1,
                     success = CASE WHEN stopped_by_user IS NULL THEN ?2 ELSE 0 END,
                     error_message = CASE WHEN stopped_by_user IS NULL THEN ?3
                                          ELSE 'Run stopped by user' END
                 WHERE id = ?4 AND ended_at IS NULL",
                params![
                    ts(&Utc::now()),
                    i64::from(outcome.success),
                    outcome.error_message.as_deref(),
                    run_id,
                ],
            )
            .await
            .map_err(db_err)?;

        self.get_run(run_id)
            .await?
            .ok_or_else(|| LibrarianError::not_found("crawler run", run_id))
    }

    /// Run history, newest first.
    pub async fn list_runs(&self, crawler_id: &str, page: PageRequest) -> Result<Page<CrawlerRun>> {
        let total = scalar_u64(
            self.conn
                .query(
                    "SELECT COUNT(*) FROM crawler_runs WHERE crawler_id = ?1",
                    params![crawler_id],
                )
                .await
                .map_err(db_err)?,
        )
        .await?;

        let rows = self
            .conn
            .query(
                &format!(
                    "SELECT {RUN_COLUMNS} FROM crawler_runs WHERE crawler_id = ?1
                     ORDER BY started_at DESC LIMIT ?2 OFFSET ?3"
                ),
                params![crawler_id, page.limit as i64, page.offset as i64],
            )
            .await
            .map_err(db_err)?;

        Ok(Page {
            items: collect(rows, row_to_run).await?,
            total,
            offset: page.offset,
            limit: page.limit,
        })
    }

    // -----------------------------------------------------------------------
    // Library updates
    // -----------------------------------------------------------------------

    /// Append one update record.
    pub async fn insert_library_update(&self, update: &NewLibraryUpdate) -> Result<LibraryUpdate> {
        let record = LibraryUpdate {
            id: new_id(),
            library_id: update.library_id.clone(),
            crawler_run_id: update.crawler_run_id.clone(),
            file_id: update.file_id.clone(),
            update_type: update.update_type,
            file_name: update.file_name.clone(),
            origin_uri: update.origin_uri.clone(),
            file_size: update.file_size,
            filter_type: update.filter_type,
            filter_value: update.filter_value.clone(),
            message: update.message.clone(),
            created_at: Utc::now(),
        };

        self.conn
            .execute(
                "INSERT INTO library_updates (id, library_id, crawler_run_id, file_id, update_type,
                    file_name, origin_uri, file_size, filter_type, filter_value, message, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    record.id.as_str(),
                    record.library_id.as_str(),
                    record.crawler_run_id.as_deref(),
                    record.file_id.as_deref(),
                    record.update_type.as_str(),
                    record.file_name.as_deref(),
                    record.origin_uri.as_deref(),
                    record.file_size,
                    record.filter_type.map(|f| f.as_str()),
                    record.filter_value.as_deref(),
                    record.message.as_deref(),
                    ts(&record.created_at),
                ],
            )
            .await
            .map_err(db_err)?;
        Ok(record)
    }

    /// A run's updates in creation order, optionally of one type.
    pub async fn list_run_updates(
        &self,
        run_id: &str,
        update_type: Option<UpdateType>,
        page: PageRequest,
    ) -> Result<Page<LibraryUpdate>> {
        let type_text = update_type.map(|t| t.as_str());
        let total = scalar_u64(
            self.conn
                .query(
                    "SELECT COUNT(*) FROM library_updates
                     WHERE crawler_run_id = ?1 AND (?2 IS NULL OR update_type = ?2)",
                    params![run_id, type_text],
                )
                .await
                .map_err(db_err)?,
        )
        .await?;

        let rows = self
            .conn
            .query(
                &format!(
                    "SELECT {UPDATE_COLUMNS} FROM library_updates
                     WHERE crawler_run_id = ?1 AND (?2 IS NULL OR update_type = ?2)
                     ORDER BY created_at, rowid LIMIT ?3 OFFSET ?4"
                ),
                params![run_id, type_text, page.limit as i64, page.offset as i64],
            )
            .await
            .map_err(db_err)?;

        Ok(Page {
            items: collect(rows, row_to_update).await?,
            total,
            offset: page.offset,
            limit: page.limit,
        })
    }

    /// Count a run's updates by type in one aggregate query.
    pub async fn update_stats_for_run(&self, run_id: &str) -> Result<UpdateStats> {
        let rows = self
            .conn
            .query(
                "SELECT update_type, COUNT(*) FROM library_updates
                 WHERE crawler_run_id = ?1 GROUP BY update_type",
                params![run_id],
            )
            .await
            .map_err(db_err)?;

        let pairs = collect(rows, |row| {
            let update_type: UpdateType = col_parse(row, 0)?;
            Ok((update_type, col_i64(row, 1)?.max(0) as u64))
        })
        .await?;
        Ok(pairs.into_iter().collect())
    }
}

fn row_to_crawler(row: &libsql::Row) -> Result<Crawler> {
    let schedule = match col_opt_bool(row, 23) {
        Some(active) => Some(CrawlerSchedule {
            monday: col_bool(row, 14),
            tuesday: col_bool(row, 15),
            wednesday: col_bool(row, 16),
            thursday: col_bool(row, 17),
            friday: col_bool(row, 18),
            saturday: col_bool(row, 19),
            sunday: col_bool(row, 20),
            hour: col_opt_i64(row, 21).unwrap_or(0).clamp(0, 23) as u8,
            minute: col_opt_i64(row, 22).unwrap_or(0).clamp(0, 59) as u8,
            active,
        }),
        None => None,
    };

    Ok(Crawler {
        id: col_string(row, 0)?,
        library_id: col_string(row, 1)?,
        uri: col_string(row, 2)?,
        uri_type: col_parse(row, 3)?,
        max_depth: col_i64(row, 4)?.max(0) as u32,
        max_pages: col_i64(row, 5)?.max(0) as u32,
        min_file_size_mb: col_opt_f64(row, 6),
        max_file_size_mb: col_opt_f64(row, 7),
        include_patterns: col_json(row, 8)?,
        exclude_patterns: col_json(row, 9)?,
        allowed_mime_types: col_json(row, 10)?,
        schedule,
        last_run_at: col_opt_ts(row, 11)?,
        created_at: col_ts(row, 12)?,
        updated_at: col_ts(row, 13)?,
    })
}

fn row_to_run(row: &libsql::Row) -> Result<CrawlerRun> {
    Ok(CrawlerRun {
        id: col_string(row, 0)?,
        crawler_id: col_string(row, 1)?,
        started_at: col_ts(row, 2)?,
        ended_at: col_opt_ts(row, 3)?,
        stopped_by_user: col_opt_ts(row, 4)?,
        success: col_opt_bool(row, 5),
        error_message: col_opt_string(row, 6),
        triggered_by: col_opt_string(row, 7),
        updates_count: col_i64(row, 8)?.max(0) as u64,
        update_stats: col_json(row, 9)?,
    })
}

fn row_to_update(row: &libsql::Row) -> Result<LibraryUpdate> {
    Ok(LibraryUpdate {
        id: col_string(row, 0)?,
        library_id: col_string(row, 1)?,
        crawler_run_id: col_opt_string(row, 2),
        file_id: col_opt_string(row, 3),
        update_type: col_parse(row, 4)?,
        file_name: col_opt_string(row, 5),
        origin_uri: col_opt_string(row, 6),
        file_size: col_opt_i64(row, 7),
        filter_type: col_opt_string(row, 8).map(|s| s.parse()).transpose()?,
        filter_value: col_opt_string(row, 9),
        message: col_opt_string(row, 10),
        created_at: col_ts(row, 11)?,
    })
}
