//! Application configuration for Librarian.
//!
//! User config lives at `~/.librarian/librarian.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{LibrarianError, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "librarian.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".librarian";

/// Default database file name inside the config directory.
const DATABASE_FILE_NAME: &str = "librarian.db";

// ---------------------------------------------------------------------------
// Config structs (matching librarian.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Content processing queue settings.
    #[serde(default)]
    pub processing: ProcessingConfig,

    /// Enrichment queue settings.
    #[serde(default)]
    pub enrichment: EnrichmentConfig,

    /// Crawl runs and schedules.
    #[serde(default)]
    pub crawler: CrawlerSettings,

    /// OpenRouter settings.
    #[serde(default)]
    pub openrouter: OpenRouterConfig,
}

/// `[database]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database file. Defaults to `~/.librarian/librarian.db` when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// `[processing]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingConfig {
    /// Tasks executed in parallel by the worker group.
    #[serde(default = "default_processing_concurrency")]
    pub concurrency: usize,

    /// Idle wait between claim attempts.
    #[serde(default = "default_processing_poll_ms")]
    pub poll_interval_ms: u64,

    /// Tasks claimed per poll.
    #[serde(default = "default_processing_batch")]
    pub batch_size: usize,

    /// Upper bound for a whole task.
    #[serde(default = "default_task_timeout_ms")]
    pub task_timeout_ms: u64,

    /// Shared per-method extraction timeout.
    #[serde(default = "default_extraction_timeout_ms")]
    pub extraction_timeout_ms: u64,

    #[serde(default = "default_embedding_timeout_ms")]
    pub embedding_timeout_ms: u64,

    /// Maximum characters per chunk.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Characters carried over from the previous chunk.
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,

    #[serde(default = "default_embedding_batch")]
    pub embedding_batch_size: usize,

    /// Methods used when a submit request names none. Empty means every
    /// enabled method that supports the file's mime type.
    #[serde(default)]
    pub default_extraction_methods: Vec<String>,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            concurrency: default_processing_concurrency(),
            poll_interval_ms: default_processing_poll_ms(),
            batch_size: default_processing_batch(),
            task_timeout_ms: default_task_timeout_ms(),
            extraction_timeout_ms: default_extraction_timeout_ms(),
            embedding_timeout_ms: default_embedding_timeout_ms(),
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
            embedding_batch_size: default_embedding_batch(),
            default_extraction_methods: Vec::new(),
        }
    }
}

fn default_processing_concurrency() -> usize {
    3
}
fn default_processing_poll_ms() -> u64 {
    5_000
}
fn default_processing_batch() -> usize {
    3
}
fn default_task_timeout_ms() -> u64 {
    30 * 60 * 1000
}
fn default_extraction_timeout_ms() -> u64 {
    10 * 60 * 1000
}
fn default_embedding_timeout_ms() -> u64 {
    15 * 60 * 1000
}
fn default_chunk_size() -> usize {
    2_000
}
fn default_chunk_overlap() -> usize {
    200
}
fn default_embedding_batch() -> usize {
    32
}

/// `[enrichment]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichmentConfig {
    #[serde(default = "default_enrichment_concurrency")]
    pub concurrency: usize,

    #[serde(default = "default_enrichment_poll_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_enrichment_batch")]
    pub batch_size: usize,

    /// Retrieved chunks attached when a field uses the vector store.
    #[serde(default = "default_similar_chunks")]
    pub similar_chunks: usize,

    #[serde(default = "default_llm_timeout_ms")]
    pub llm_timeout_ms: u64,

    /// Context values longer than this are truncated before prompting.
    #[serde(default = "default_max_context_chars")]
    pub max_context_chars: usize,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            concurrency: default_enrichment_concurrency(),
            poll_interval_ms: default_enrichment_poll_ms(),
            batch_size: default_enrichment_batch(),
            similar_chunks: default_similar_chunks(),
            llm_timeout_ms: default_llm_timeout_ms(),
            max_context_chars: default_max_context_chars(),
        }
    }
}

fn default_enrichment_concurrency() -> usize {
    3
}
fn default_enrichment_poll_ms() -> u64 {
    2_000
}
fn default_enrichment_batch() -> usize {
    5
}
fn default_similar_chunks() -> usize {
    4
}
fn default_llm_timeout_ms() -> u64 {
    120_000
}
fn default_max_context_chars() -> usize {
    4_000
}

/// `[crawler]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlerSettings {
    /// Per-request timeout for source connectors.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Concurrent fetches within one discovery batch.
    #[serde(default = "default_crawl_concurrency")]
    pub concurrency: usize,

    /// Entries visited between stop-flag checks.
    #[serde(default = "default_crawl_batch")]
    pub batch_size: usize,

    #[serde(default = "default_schedule_poll_ms")]
    pub schedule_poll_interval_ms: u64,

    /// Allow localhost and private networks as crawl targets.
    #[serde(default)]
    pub allow_private_hosts: bool,
}

impl Default for CrawlerSettings {
    fn default() -> Self {
        Self {
            request_timeout_ms: default_request_timeout_ms(),
            concurrency: default_crawl_concurrency(),
            batch_size: default_crawl_batch(),
            schedule_poll_interval_ms: default_schedule_poll_ms(),
            allow_private_hosts: false,
        }
    }
}

impl CrawlerSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

fn default_request_timeout_ms() -> u64 {
    30_000
}
fn default_crawl_concurrency() -> usize {
    4
}
fn default_crawl_batch() -> usize {
    10
}
fn default_schedule_poll_ms() -> u64 {
    60_000
}

/// `[openrouter]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenRouterConfig {
    /// Name of the env var holding the API key (never store the key itself).
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Model used when a list field does not name one.
    #[serde(default = "default_model")]
    pub default_model: String,

    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
}

impl Default for OpenRouterConfig {
    fn default() -> Self {
        Self {
            api_key_env: default_api_key_env(),
            base_url: default_base_url(),
            default_model: default_model(),
            embedding_model: default_embedding_model(),
        }
    }
}

fn default_api_key_env() -> String {
    "OPENROUTER_API_KEY".into()
}
fn default_base_url() -> String {
    "https://openrouter.ai/api/v1".into()
}
fn default_model() -> String {
    "openai/gpt-4o-mini".into()
}
fn default_embedding_model() -> String {
    "openai/text-embedding-3-small".into()
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.librarian/`).
pub fn config_dir() -> Result<PathBuf> {
    let home =
        dirs::home_dir().ok_or_else(|| LibrarianError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.librarian/librarian.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Resolve the database path from config, falling back to the config directory.
pub fn database_path(config: &AppConfig) -> Result<PathBuf> {
    match &config.database.path {
        Some(path) => Ok(PathBuf::from(path)),
        None => Ok(config_dir()?.join(DATABASE_FILE_NAME)),
    }
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| LibrarianError::io(path, e))?;

    toml::from_str(&content)
        .map_err(|e| LibrarianError::config(format!("failed to parse {}: {e}", path.display())))
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| LibrarianError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| LibrarianError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| LibrarianError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Read the OpenRouter API key from the configured environment variable.
pub fn resolve_api_key(config: &OpenRouterConfig) -> Result<String> {
    let var_name = &config.api_key_env;
    match std::env::var(var_name) {
        Ok(val) if !val.is_empty() => Ok(val),
        _ => Err(LibrarianError::config(format!(
            "OpenRouter API key not found. Set the {var_name} environment variable."
        ))),
    }
}
