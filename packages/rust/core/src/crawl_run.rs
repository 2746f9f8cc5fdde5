//! Crawler configuration and run orchestration.
//!
//! A run traverses the crawler's source breadth-first in batches, filters and
//! diffs what it finds against the crawler's known files, records one
//! library update per outcome and hands new or changed files to the content
//! processor. The stop flag is the run's `stopped_by_user`, checked between
//! batches; the run stays open until the traversal has wound down.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use futures::stream;
use regex::Regex;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info, info_span, instrument, warn};

use librarian_crawler::{CrawlSource, FileFilter, RemoteFile, SourceRegistry, Visit};
use librarian_shared::{
    Crawler, CrawlerInput, CrawlerRun, CrawlerSettings, LibrarianError, LibraryUpdate,
    NewLibraryUpdate, Page, PageRequest, Result, UpdateType,
};
use librarian_storage::{NewFile, RunOutcome, Storage};

use crate::processing::{ContentProcessor, SubmitRequest};

/// Item errors joined into a run's error message.
const MAX_REPORTED_ERRORS: usize = 5;

/// Owns crawler CRUD and run execution.
pub struct CrawlerRunner {
    storage: Arc<Storage>,
    sources: SourceRegistry,
    processor: Arc<ContentProcessor>,
    settings: CrawlerSettings,
}

/// Mutable state of one run's traversal.
struct Traversal {
    queue: VecDeque<(String, u32)>,
    visited: HashSet<String>,
    /// Origin URIs found at the source (filtered ones included).
    seen: HashSet<String>,
    pages: u32,
    errors: Vec<String>,
}

impl CrawlerRunner {
    pub fn new(
        storage: Arc<Storage>,
        sources: SourceRegistry,
        processor: Arc<ContentProcessor>,
        settings: CrawlerSettings,
    ) -> Self {
        Self {
            storage,
            sources,
            processor,
            settings,
        }
    }

    // -----------------------------------------------------------------------
    // Configuration
    // -----------------------------------------------------------------------

    pub async fn create_crawler(&self, input: &CrawlerInput) -> Result<Crawler> {
        validate_input(input)?;
        self.storage
            .get_library(&input.library_id)
            .await?
            .ok_or_else(|| LibrarianError::not_found("library", &input.library_id))?;

        let crawler = self.storage.insert_crawler(input).await?;
        info!(crawler_id = %crawler.id, uri = %crawler.uri, "crawler created");
        Ok(crawler)
    }

    pub async fn update_crawler(&self, id: &str, input: &CrawlerInput) -> Result<Crawler> {
        validate_input(input)?;
        self.storage
            .update_crawler(id, input)
            .await?
            .ok_or_else(|| LibrarianError::not_found("crawler", id))
    }

    /// Delete a crawler. A crawler with an open run cannot be deleted.
    pub async fn delete_crawler(&self, id: &str) -> Result<()> {
        if self.storage.get_open_run(id).await?.is_some() {
            return Err(LibrarianError::AlreadyRunning {
                crawler_id: id.to_string(),
            });
        }
        if !self.storage.delete_crawler(id).await? {
            return Err(LibrarianError::not_found("crawler", id));
        }
        info!(crawler_id = %id, "crawler deleted");
        Ok(())
    }

    pub async fn get_crawler(&self, id: &str) -> Result<Crawler> {
        self.storage
            .get_crawler(id)
            .await?
            .ok_or_else(|| LibrarianError::not_found("crawler", id))
    }

    pub async fn list_crawlers(&self, library_id: Option<&str>) -> Result<Vec<Crawler>> {
        self.storage.list_crawlers(library_id).await
    }

    // -----------------------------------------------------------------------
    // Runs
    // -----------------------------------------------------------------------

    /// Start a run in the background and return it immediately.
    pub async fn run(self: &Arc<Self>, crawler_id: &str, triggered_by: Option<&str>) -> Result<CrawlerRun> {
        let (run, _handle) = self.start(crawler_id, triggered_by).await?;
        Ok(run)
    }

    /// Start a run and return the handle of its background task, which
    /// resolves to the finished run.
    #[instrument(skip_all, fields(crawler_id = %crawler_id))]
    pub async fn start(
        self: &Arc<Self>,
        crawler_id: &str,
        triggered_by: Option<&str>,
    ) -> Result<(CrawlerRun, JoinHandle<Result<CrawlerRun>>)> {
        let crawler = self.get_crawler(crawler_id).await?;
        let source = self.sources.get(crawler.uri_type)?;

        let run = self
            .storage
            .try_start_run(crawler_id, triggered_by)
            .await?
            .ok_or_else(|| LibrarianError::AlreadyRunning {
                crawler_id: crawler_id.to_string(),
            })?;
        info!(run_id = %run.id, triggered_by = ?triggered_by, "crawler run started");

        let runner = Arc::clone(self);
        let run_id = run.id.clone();
        let span = info_span!("crawler_run", crawler_id = %crawler.id, run_id = %run_id);
        let handle = tokio::spawn(
            async move {
                let result = runner.execute(&crawler, source, &run_id).await;
                if let Err(e) = &result {
                    error!(error = %e, "crawler run aborted");
                    let outcome = RunOutcome {
                        success: false,
                        error_message: Some(e.to_string()),
                    };
                    if let Err(e) = runner.storage.finish_run(&run_id, &outcome).await {
                        error!(error = %e, "failed to close aborted run");
                    }
                }
                result
            }
            .instrument(span),
        );

        Ok((run, handle))
    }

    /// Request a cooperative stop. Returns false when nothing was running.
    #[instrument(skip_all, fields(crawler_id = %crawler_id))]
    pub async fn stop(&self, crawler_id: &str) -> Result<bool> {
        self.get_crawler(crawler_id).await?;
        match self.storage.stop_run(crawler_id).await? {
            Some(run_id) => {
                info!(run_id = %run_id, "crawler run stop requested");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub async fn get_run(&self, run_id: &str) -> Result<CrawlerRun> {
        self.storage
            .get_run(run_id)
            .await?
            .ok_or_else(|| LibrarianError::not_found("crawler run", run_id))
    }

    pub async fn list_runs(&self, crawler_id: &str, page: PageRequest) -> Result<Page<CrawlerRun>> {
        self.get_crawler(crawler_id).await?;
        self.storage.list_runs(crawler_id, page).await
    }

    pub async fn list_updates(
        &self,
        run_id: &str,
        update_type: Option<UpdateType>,
        page: PageRequest,
    ) -> Result<Page<LibraryUpdate>> {
        self.get_run(run_id).await?;
        self.storage.list_run_updates(run_id, update_type, page).await
    }

    // -----------------------------------------------------------------------
    // Execution
    // -----------------------------------------------------------------------

    async fn execute(
        &self,
        crawler: &Crawler,
        source: Arc<dyn CrawlSource>,
        run_id: &str,
    ) -> Result<CrawlerRun> {
        let filter = FileFilter::new(crawler);
        let mut state = Traversal {
            queue: VecDeque::from([(crawler.uri.clone(), 0)]),
            visited: HashSet::from([crawler.uri.clone()]),
            seen: HashSet::new(),
            pages: 0,
            errors: Vec::new(),
        };

        let mut stopped = false;
        let mut truncated = false;
        let batch_size = self.settings.batch_size.max(1);

        while !state.queue.is_empty() {
            if self.storage.is_stop_requested(run_id).await? {
                stopped = true;
                break;
            }
            let remaining = crawler.max_pages.saturating_sub(state.pages) as usize;
            if remaining == 0 {
                truncated = true;
                break;
            }

            let take = batch_size.min(remaining).min(state.queue.len());
            let batch: Vec<(String, u32)> = state.queue.drain(..take).collect();
            let results: Vec<(String, u32, Result<Visit>)> = stream::iter(batch)
                .map(|(uri, depth)| {
                    let source = Arc::clone(&source);
                    let root = crawler.uri.clone();
                    async move {
                        let visit = source.visit(&root, &uri).await;
                        (uri, depth, visit)
                    }
                })
                .buffered(self.settings.concurrency.max(1))
                .collect()
                .await;

            for (uri, depth, visit) in results {
                state.pages += 1;
                match visit {
                    Ok(visit) => {
                        if depth < crawler.max_depth {
                            for child in visit.children {
                                if state.visited.insert(child.clone()) {
                                    state.queue.push_back((child, depth + 1));
                                }
                            }
                        }
                        if let Some(file) = visit.file {
                            self.handle_file(crawler, run_id, &filter, &mut state, file)
                                .await?;
                        }
                    }
                    Err(e) => {
                        warn!(%uri, error = %e, "failed to visit source entry");
                        state.errors.push(format!("{uri}: {e}"));
                        self.record(crawler, run_id, UpdateType::Error, |u| {
                            u.origin_uri = Some(uri.clone());
                            u.message = Some(e.to_string());
                        })
                        .await?;
                    }
                }
            }
        }

        if !stopped && !truncated {
            self.detect_deletions(crawler, run_id, &state.seen).await?;
        }

        let outcome = RunOutcome {
            success: state.errors.is_empty(),
            error_message: (!state.errors.is_empty()).then(|| summarize_errors(&state.errors)),
        };
        let run = self.storage.finish_run(run_id, &outcome).await?;
        self.storage.set_crawler_last_run(&crawler.id, Utc::now()).await?;

        info!(
            pages = state.pages,
            updates = run.updates_count,
            stopped,
            truncated,
            success = ?run.success,
            "crawler run finished"
        );
        Ok(run)
    }

    async fn handle_file(
        &self,
        crawler: &Crawler,
        run_id: &str,
        filter: &FileFilter,
        state: &mut Traversal,
        file: RemoteFile,
    ) -> Result<()> {
        if !state.seen.insert(file.uri.clone()) {
            return Ok(());
        }

        if let Some(rejection) = filter.check(&file) {
            debug!(uri = %file.uri, reason = %rejection.reason, "file filtered out");
            self.record(crawler, run_id, UpdateType::Omitted, |u| {
                u.file_name = Some(file.name.clone());
                u.origin_uri = Some(file.uri.clone());
                u.file_size = Some(file.size);
                u.filter_type = Some(rejection.filter_type);
                u.filter_value = Some(rejection.filter_value.clone());
                u.message = Some(rejection.reason.clone());
            })
            .await?;
            return Ok(());
        }

        let known = self.storage.find_crawler_file(&crawler.id, &file.uri).await?;
        let (update_type, file_id) = match known {
            Some(existing) if existing.content_hash.as_deref() == Some(file.content_hash.as_str()) => {
                (UpdateType::Skipped, existing.id)
            }
            Some(existing) => {
                self.storage
                    .update_file_content(
                        &existing.id,
                        &file.content,
                        &file.mime_type,
                        &file.content_hash,
                        file.modified_at,
                    )
                    .await?;
                (UpdateType::Updated, existing.id)
            }
            None => {
                let created = self
                    .storage
                    .insert_file(&NewFile {
                        library_id: crawler.library_id.clone(),
                        name: file.name.clone(),
                        mime_type: file.mime_type.clone(),
                        content: file.content.clone(),
                        origin_uri: Some(file.uri.clone()),
                        origin_modified_at: file.modified_at,
                        crawler_id: Some(crawler.id.clone()),
                        content_hash: Some(file.content_hash.clone()),
                    })
                    .await?;
                (UpdateType::Added, created.id)
            }
        };

        self.record(crawler, run_id, update_type, |u| {
            u.file_id = Some(file_id.clone());
            u.file_name = Some(file.name.clone());
            u.origin_uri = Some(file.uri.clone());
            u.file_size = Some(file.size);
        })
        .await?;

        if update_type != UpdateType::Skipped {
            let request = SubmitRequest {
                force: true,
                ..SubmitRequest::default()
            };
            if let Err(e) = self.processor.submit(&file_id, request).await {
                warn!(file_id = %file_id, error = %e, "could not enqueue discovered file");
            }
        }
        Ok(())
    }

    /// Archive known files the source no longer has.
    async fn detect_deletions(&self, crawler: &Crawler, run_id: &str, seen: &HashSet<String>) -> Result<()> {
        for known in self.storage.list_crawler_files(&crawler.id).await? {
            let Some(origin) = known.origin_uri.as_deref() else {
                continue;
            };
            if seen.contains(origin) {
                continue;
            }
            if self.storage.archive_file(&known.id).await? {
                self.record(crawler, run_id, UpdateType::Deleted, |u| {
                    u.file_id = Some(known.id.clone());
                    u.file_name = Some(known.name.clone());
                    u.origin_uri = Some(origin.to_string());
                    u.file_size = Some(known.size);
                })
                .await?;
            }
        }
        Ok(())
    }

    async fn record(
        &self,
        crawler: &Crawler,
        run_id: &str,
        update_type: UpdateType,
        fill: impl FnOnce(&mut NewLibraryUpdate),
    ) -> Result<()> {
        let mut update = NewLibraryUpdate {
            library_id: crawler.library_id.clone(),
            crawler_run_id: Some(run_id.to_string()),
            file_id: None,
            update_type,
            file_name: None,
            origin_uri: None,
            file_size: None,
            filter_type: None,
            filter_value: None,
            message: None,
        };
        fill(&mut update);
        self.storage.insert_library_update(&update).await?;
        Ok(())
    }
}

/// Check a crawler definition before it is stored.
pub fn validate_input(input: &CrawlerInput) -> Result<()> {
    if input.uri.trim().is_empty() {
        return Err(LibrarianError::validation("crawler URI must not be empty"));
    }
    if input.max_pages < 1 {
        return Err(LibrarianError::validation("max pages must be at least 1"));
    }
    for (label, bound) in [("min", input.min_file_size_mb), ("max", input.max_file_size_mb)] {
        if bound.is_some_and(|b| b < 0.0 || !b.is_finite()) {
            return Err(LibrarianError::validation(format!(
                "{label} file size must be a non-negative number"
            )));
        }
    }
    if let (Some(min), Some(max)) = (input.min_file_size_mb, input.max_file_size_mb) {
        if min > max {
            return Err(LibrarianError::validation(format!(
                "min file size ({min} MB) exceeds max file size ({max} MB)"
            )));
        }
    }
    for pattern in input.include_patterns.iter().chain(&input.exclude_patterns) {
        Regex::new(pattern).map_err(|e| {
            LibrarianError::validation(format!("invalid pattern '{pattern}': {e}"))
        })?;
    }
    if let Some(schedule) = &input.schedule {
        if schedule.hour > 23 || schedule.minute > 59 {
            return Err(LibrarianError::validation(format!(
                "invalid schedule time {:02}:{:02}",
                schedule.hour, schedule.minute
            )));
        }
    }
    Ok(())
}

fn summarize_errors(errors: &[String]) -> String {
    let mut message = errors
        .iter()
        .take(MAX_REPORTED_ERRORS)
        .cloned()
        .collect::<Vec<_>>()
        .join("; ");
    if errors.len() > MAX_REPORTED_ERRORS {
        message.push_str(&format!(" (and {} more)", errors.len() - MAX_REPORTED_ERRORS));
    }
    message
}
