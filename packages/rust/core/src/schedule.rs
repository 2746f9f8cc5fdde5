//! Recurring crawler schedules.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Datelike, Days, NaiveTime, TimeZone, Utc, Weekday};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use librarian_shared::{Crawler, CrawlerRun, CrawlerSchedule, LibrarianError, Result};
use librarian_storage::Storage;

use crate::crawl_run::CrawlerRunner;

pub const SCHEDULE_TRIGGER: &str = "schedule";

/// The most recent scheduled slot at or before `now`, within the past week.
pub fn last_due_slot(schedule: &CrawlerSchedule, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let time = NaiveTime::from_hms_opt(u32::from(schedule.hour), u32::from(schedule.minute), 0)?;
    (0..=7u64).find_map(|back| {
        let date = now.date_naive().checked_sub_days(Days::new(back))?;
        if !runs_on(schedule, date.weekday()) {
            return None;
        }
        let slot = Utc.from_utc_datetime(&date.and_time(time));
        (slot <= now).then_some(slot)
    })
}

fn runs_on(schedule: &CrawlerSchedule, day: Weekday) -> bool {
    match day {
        Weekday::Mon => schedule.monday,
        Weekday::Tue => schedule.tuesday,
        Weekday::Wed => schedule.wednesday,
        Weekday::Thu => schedule.thursday,
        Weekday::Fri => schedule.friday,
        Weekday::Sat => schedule.saturday,
        Weekday::Sun => schedule.sunday,
    }
}

/// Whether a crawler's schedule has a slot it has not run since.
pub fn is_due(crawler: &Crawler, now: DateTime<Utc>) -> bool {
    let Some(schedule) = crawler.schedule.as_ref().filter(|s| s.active) else {
        return false;
    };
    let Some(slot) = last_due_slot(schedule, now) else {
        return false;
    };
    crawler.last_run_at.unwrap_or(crawler.created_at) < slot
}

/// Starts crawlers whose schedule is due.
pub struct CrawlerScheduler {
    storage: Arc<Storage>,
    runner: Arc<CrawlerRunner>,
    interval: Duration,
}

impl CrawlerScheduler {
    pub fn new(storage: Arc<Storage>, runner: Arc<CrawlerRunner>, interval: Duration) -> Self {
        Self {
            storage,
            runner,
            interval,
        }
    }

    /// Start every due crawler once. Crawlers that are already running are
    /// left alone.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<Vec<CrawlerRun>> {
        let mut started = Vec::new();
        for crawler in self.storage.list_scheduled_crawlers().await? {
            if !is_due(&crawler, now) {
                continue;
            }
            match self.runner.run(&crawler.id, Some(SCHEDULE_TRIGGER)).await {
                Ok(run) => started.push(run),
                Err(LibrarianError::AlreadyRunning { .. }) => {
                    debug!(crawler_id = %crawler.id, "scheduled crawler already running");
                }
                Err(e) => warn!(crawler_id = %crawler.id, error = %e, "scheduled run failed to start"),
            }
        }
        Ok(started)
    }

    /// Poll until cancelled.
    #[instrument(skip_all)]
    pub async fn run(&self, cancel: CancellationToken) {
        info!(interval_ms = self.interval.as_millis() as u64, "crawler scheduler started");
        loop {
            match self.tick(Utc::now()).await {
                Ok(started) if !started.is_empty() => {
                    info!(count = started.len(), "scheduled crawler runs started");
                }
                Ok(_) => {}
                Err(e) => error!(error = %e, "schedule evaluation failed"),
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
        info!("crawler scheduler stopped");
    }
}
