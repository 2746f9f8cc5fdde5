//! CLI command definitions, routing, and tracing setup.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use librarian_core::{EnqueueRequest, SubmitRequest};
use librarian_shared::{
    AppConfig, CrawlerRun, EnrichmentStatus, PageRequest, ProcessingStatus, QueueType, UpdateType,
    init_config, load_config, load_config_from,
};
use librarian_storage::ProcessingTaskFilter;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::services::Services;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// Librarian: process, crawl and enrich a local knowledge library.
#[derive(Parser)]
#[command(
    name = "librarian",
    version,
    about = "Process, crawl and enrich a local knowledge library.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Config file (defaults to ~/.librarian/librarian.toml).
    #[arg(long, global = true, env = "LIBRARIAN_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Configuration management.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Run queue workers and the crawler scheduler until Ctrl-C.
    Worker {
        #[command(subcommand)]
        action: WorkerAction,
    },

    /// Inspect and manage the task queues.
    Queue {
        #[command(subcommand)]
        action: QueueAction,
    },

    /// Content processing of library files.
    Process {
        #[command(subcommand)]
        action: ProcessAction,
    },

    /// Crawler runs.
    Crawler {
        #[command(subcommand)]
        action: CrawlerAction,
    },

    /// List field enrichment.
    Enrich {
        #[command(subcommand)]
        action: EnrichAction,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

#[derive(Subcommand)]
pub(crate) enum WorkerAction {
    /// Start worker groups and the scheduler.
    Run {
        /// Only run this queue (content-processing or enrichment).
        #[arg(long)]
        queue: Option<QueueType>,
    },
}

#[derive(Subcommand)]
pub(crate) enum QueueAction {
    /// Task counts per queue.
    Status {
        #[arg(long)]
        library: Option<String>,
    },
    /// Re-enqueue failed tasks.
    RetryFailed {
        queue: QueueType,
        #[arg(long)]
        library: Option<String>,
    },
    /// Delete failed tasks.
    ClearFailed {
        queue: QueueType,
        #[arg(long)]
        library: Option<String>,
    },
    /// Delete pending tasks.
    ClearPending {
        queue: QueueType,
        #[arg(long)]
        library: Option<String>,
    },
    /// Cancel pending tasks.
    CancelAll {
        queue: QueueType,
        #[arg(long)]
        library: Option<String>,
    },
}

#[derive(Subcommand)]
pub(crate) enum ProcessAction {
    /// Queue a file for extraction and embedding.
    Submit {
        file: String,
        /// Replace an active task instead of failing.
        #[arg(long)]
        force: bool,
        /// Extraction method id (repeatable).
        #[arg(long = "method")]
        methods: Vec<String>,
    },
    /// Re-embed the output of an earlier extraction.
    Embed {
        file: String,
        /// Task whose extraction output is reused (defaults to the latest).
        #[arg(long)]
        task: Option<String>,
    },
    /// Cancel a task.
    Cancel { task: String },
    /// Aggregate processing status of a file.
    Status { file: String },
    /// List processing tasks.
    Tasks {
        #[arg(long)]
        library: Option<String>,
        #[arg(long)]
        file: Option<String>,
        #[arg(long)]
        status: Option<ProcessingStatus>,
        #[command(flatten)]
        page: PageArgs,
    },
}

#[derive(Subcommand)]
pub(crate) enum CrawlerAction {
    /// Run a crawler in this process.
    Run {
        crawler: String,
        /// Show a progress spinner until the run finishes.
        #[arg(long)]
        wait: bool,
    },
    /// Ask the open run of a crawler to stop.
    Stop { crawler: String },
    /// Runs of a crawler, newest first.
    Runs {
        crawler: String,
        #[command(flatten)]
        page: PageArgs,
    },
    /// Library updates recorded by a run.
    Updates {
        run: String,
        #[arg(long = "type")]
        update_type: Option<UpdateType>,
        #[command(flatten)]
        page: PageArgs,
    },
}

#[derive(Subcommand)]
pub(crate) enum EnrichAction {
    /// Queue computation of a field.
    Enqueue {
        list: String,
        field: String,
        #[arg(long)]
        file: Option<String>,
        /// Skip files that already have a value.
        #[arg(long)]
        only_missing: bool,
        #[arg(long, default_value_t = 0)]
        priority: i64,
    },
    /// Remove pending tasks.
    Dequeue {
        list: String,
        #[arg(long)]
        field: Option<String>,
        #[arg(long)]
        file: Option<String>,
    },
    /// Remove pending tasks and cached values.
    Clear {
        list: String,
        #[arg(long)]
        field: Option<String>,
        #[arg(long)]
        file: Option<String>,
    },
    /// Task counts of a list.
    Status {
        list: String,
        #[arg(long)]
        field: Option<String>,
    },
}

#[derive(clap::Args)]
pub(crate) struct PageArgs {
    /// 1-based page number.
    #[arg(long, default_value_t = 1)]
    page: u64,
    #[arg(long, default_value_t = 20)]
    page_size: u64,
}

impl From<&PageArgs> for PageRequest {
    fn from(args: &PageArgs) -> Self {
        let limit = args.page_size.max(1);
        Self {
            offset: args.page.saturating_sub(1) * limit,
            limit,
        }
    }
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags. Logs go to stderr so command
/// output on stdout stays machine-readable.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = ["librarian", "librarian_core", "librarian_crawler", "librarian_storage", "librarian_shared"]
        .iter()
        .map(|target| format!("{target}={level}"))
        .collect::<Vec<_>>()
        .join(",");

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .with_target(false)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    if let Command::Config { action } = &cli.command {
        return match action {
            ConfigAction::Init => cmd_config_init(),
            ConfigAction::Show => cmd_config_show(&resolve_config(&cli)?),
        };
    }

    let config = resolve_config(&cli)?;
    let require_api_key = matches!(cli.command, Command::Worker { .. });
    let services = Services::build(&config, require_api_key).await?;

    match cli.command {
        Command::Config { .. } => Ok(()),
        Command::Worker { action } => match action {
            WorkerAction::Run { queue } => cmd_worker_run(&services, queue).await,
        },
        Command::Queue { action } => cmd_queue(&services, action).await,
        Command::Process { action } => cmd_process(&services, action).await,
        Command::Crawler { action } => cmd_crawler(&services, action).await,
        Command::Enrich { action } => cmd_enrich(&services, action).await,
    }
}

fn resolve_config(cli: &Cli) -> Result<AppConfig> {
    Ok(match &cli.config {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    })
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

fn cmd_config_show(config: &AppConfig) -> Result<()> {
    let toml_str = toml::to_string_pretty(config)?;
    println!("{toml_str}");
    Ok(())
}

async fn cmd_worker_run(services: &Services, queue: Option<QueueType>) -> Result<()> {
    let started = match queue {
        Some(queue) => services.workers.start(queue).await?,
        None => services.workers.start_all().await?,
    };
    info!(result = %started.message, "workers started");

    let cancel = CancellationToken::new();
    let scheduler = {
        let scheduler = services.scheduler.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { scheduler.run(cancel).await })
    };

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");

    cancel.cancel();
    services.workers.shutdown().await;
    if let Err(e) = scheduler.await {
        tracing::warn!(error = %e, "scheduler task ended abnormally");
    }
    info!("workers stopped");
    Ok(())
}

async fn cmd_queue(services: &Services, action: QueueAction) -> Result<()> {
    let workers = &services.workers;
    let result = match action {
        QueueAction::Status { library } => {
            return print_json(&workers.status(library.as_deref()).await?);
        }
        QueueAction::RetryFailed { queue, library } => {
            workers.retry_failed(queue, library.as_deref()).await?
        }
        QueueAction::ClearFailed { queue, library } => {
            workers.clear_failed(queue, library.as_deref()).await?
        }
        QueueAction::ClearPending { queue, library } => {
            workers.clear_pending(queue, library.as_deref()).await?
        }
        QueueAction::CancelAll { queue, library } => {
            workers.cancel_all(queue, library.as_deref()).await?
        }
    };
    println!("{}", result.message);
    Ok(())
}

async fn cmd_process(services: &Services, action: ProcessAction) -> Result<()> {
    let processor = &services.processor;
    match action {
        ProcessAction::Submit { file, force, methods } => {
            let request = SubmitRequest {
                methods,
                force,
                ..SubmitRequest::default()
            };
            let task_id = processor.submit(&file, request).await?;
            println!("{task_id}");
        }
        ProcessAction::Embed { file, task } => {
            let task_id = processor.submit_embedding_only(&file, task.as_deref()).await?;
            println!("{task_id}");
        }
        ProcessAction::Cancel { task } => {
            if processor.cancel(&task).await? {
                println!("Cancelled {task}");
            } else {
                println!("Task {task} had already finished");
            }
        }
        ProcessAction::Status { file } => {
            let status = processor.file_status(&file).await?;
            print_json(&status)?;
            if status.processing_status.is_failure() {
                eprintln!("Run `librarian queue retry-failed content-processing` to retry.");
            }
        }
        ProcessAction::Tasks {
            library,
            file,
            status,
            page,
        } => {
            let filter = ProcessingTaskFilter {
                library_id: library,
                file_id: file,
                status,
            };
            print_json(&processor.list_tasks(&filter, (&page).into()).await?)?;
        }
    }
    Ok(())
}

async fn cmd_crawler(services: &Services, action: CrawlerAction) -> Result<()> {
    let runner = &services.runner;
    match action {
        CrawlerAction::Run { crawler, wait } => {
            let (run, handle) = runner.start(&crawler, Some("cli")).await?;
            info!(run_id = %run.id, "crawler run started");

            let spinner = wait.then(spinner).transpose()?;
            let finished = follow_run(services, &run.id, handle, spinner.as_ref()).await?;
            if let Some(spinner) = spinner {
                spinner.finish_and_clear();
            }
            print_run_summary(&finished);
        }
        CrawlerAction::Stop { crawler } => {
            if runner.stop(&crawler).await? {
                println!("Stop requested for crawler {crawler}");
            } else {
                println!("Crawler {crawler} has no open run");
            }
        }
        CrawlerAction::Runs { crawler, page } => {
            print_json(&runner.list_runs(&crawler, (&page).into()).await?)?;
        }
        CrawlerAction::Updates {
            run,
            update_type,
            page,
        } => {
            print_json(&runner.list_updates(&run, update_type, (&page).into()).await?)?;
        }
    }
    Ok(())
}

/// Await a run started in this process, refreshing the spinner with the
/// run's update count.
async fn follow_run(
    services: &Services,
    run_id: &str,
    mut handle: tokio::task::JoinHandle<librarian_shared::Result<CrawlerRun>>,
    spinner: Option<&ProgressBar>,
) -> Result<CrawlerRun> {
    let mut ticker = tokio::time::interval(Duration::from_millis(500));
    loop {
        tokio::select! {
            joined = &mut handle => {
                let run = joined.map_err(|e| eyre!("crawler run task failed: {e}"))??;
                return Ok(run);
            }
            _ = ticker.tick() => {
                if let Some(spinner) = spinner {
                    let run = services.runner.get_run(run_id).await?;
                    spinner.set_message(format!("Crawling: {} update(s)", run.updates_count));
                }
            }
        }
    }
}

fn print_run_summary(run: &CrawlerRun) {
    let outcome = match run.success {
        Some(true) => "succeeded",
        Some(false) => "failed",
        None => "still open",
    };
    println!();
    println!("  Run:     {}", run.id);
    println!("  Outcome: {outcome}");
    if run.stopped_by_user.is_some() {
        println!("  Stopped by user");
    }
    for (update_type, count) in &run.update_stats {
        println!("  {:<8} {count}", format!("{update_type}:"));
    }
    if let Some(error) = &run.error_message {
        println!("  Errors:  {error}");
    }
    println!();
}

fn spinner() -> Result<ProgressBar> {
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::with_template("{spinner:.cyan} {msg}")?
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
    );
    spinner.enable_steady_tick(Duration::from_millis(80));
    spinner.set_message("Crawling");
    Ok(spinner)
}

async fn cmd_enrich(services: &Services, action: EnrichAction) -> Result<()> {
    let engine = &services.engine;
    match action {
        EnrichAction::Enqueue {
            list,
            field,
            file,
            only_missing,
            priority,
        } => {
            let request = EnqueueRequest {
                list_id: list,
                field_id: field,
                file_id: file,
                only_missing,
                priority,
                ..EnqueueRequest::default()
            };
            print_json(&engine.enqueue(&request).await?)?;
        }
        EnrichAction::Dequeue { list, field, file } => {
            let removed = engine
                .dequeue_pending(&list, field.as_deref(), file.as_deref())
                .await?;
            println!("Dequeued {removed} pending task(s)");
        }
        EnrichAction::Clear { list, field, file } => {
            print_json(&engine.clear(&list, field.as_deref(), file.as_deref()).await?)?;
        }
        EnrichAction::Status { list, field } => {
            let counts = engine.status_counts(&list, field.as_deref()).await?;
            for (status, count) in &counts {
                println!("  {:<11} {count}", format!("{status}:"));
            }
            if field.is_none() {
                println!();
                for counters in engine.field_counters(&list).await? {
                    println!(
                        "  {}  pending {}  processing {}",
                        counters.field_id, counters.pending, counters.processing
                    );
                }
            }
            if counts
                .iter()
                .any(|(status, count)| *status == EnrichmentStatus::Failed && *count > 0)
            {
                println!();
                println!("  Run `librarian queue retry-failed enrichment` to retry failed tasks.");
            }
        }
    }
    Ok(())
}
