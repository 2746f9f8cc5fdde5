//! Core domain types: libraries, files, processing tasks, crawlers, lists and
//! enrichment tasks.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::LibrarianError;
use crate::status::EnrichmentStatus;

/// Generate a new time-sortable record identifier (UUID v7).
pub fn new_id() -> String {
    Uuid::now_v7().to_string()
}

/// Implements `as_str` and `FromStr` for enums persisted as TEXT columns.
macro_rules! text_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            /// Stable text form used in storage and on the command line.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }

            /// Every variant, in declaration order.
            pub fn all() -> &'static [$name] {
                &[$(Self::$variant,)+]
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = LibrarianError;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(LibrarianError::validation(format!(
                        "unknown {} '{other}'",
                        stringify!($name)
                    ))),
                }
            }
        }
    };
}

pub(crate) use text_enum;

// ---------------------------------------------------------------------------
// Libraries and files
// ---------------------------------------------------------------------------

/// A collection of ingested files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Library {
    pub id: String,
    pub name: String,
    /// Embedding model used for this library's chunks. Processing refuses to
    /// start without one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding_model: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One ingested document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LibraryFile {
    pub id: String,
    pub library_id: String,
    pub name: String,
    pub mime_type: String,
    /// Size in bytes.
    pub size: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_modified_at: Option<DateTime<Utc>>,
    /// Set for files discovered by a crawler.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crawler_id: Option<String>,
    /// SHA-256 of the raw bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
    /// Soft-delete marker.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archived_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Content processing
// ---------------------------------------------------------------------------

/// Sub-task method name used when a task reuses an earlier extraction.
pub const EMBEDDING_ONLY_METHOD: &str = "embedding-only";

/// Serialized configuration of a processing request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractionOptions {
    /// Extraction methods to run, by registry id.
    #[serde(default)]
    pub methods: Vec<String>,
    /// Per-method options keyed by method id.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub method_options: BTreeMap<String, serde_json::Value>,
}

/// One attempt to extract and embed a library file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentProcessingTask {
    pub id: String,
    pub file_id: String,
    pub library_id: String,
    pub created_at: DateTime<Utc>,
    pub extraction_options: ExtractionOptions,
    /// Upper bound for the whole task.
    pub timeout_ms: u64,

    pub processing_started_at: Option<DateTime<Utc>>,
    pub processing_finished_at: Option<DateTime<Utc>>,
    pub processing_failed_at: Option<DateTime<Utc>>,
    pub processing_timeout: bool,
    pub processing_cancelled: bool,

    pub extraction_started_at: Option<DateTime<Utc>>,
    pub extraction_finished_at: Option<DateTime<Utc>>,
    pub extraction_failed_at: Option<DateTime<Utc>>,
    pub extraction_timeout: bool,

    pub embedding_started_at: Option<DateTime<Utc>>,
    pub embedding_finished_at: Option<DateTime<Utc>>,
    pub embedding_failed_at: Option<DateTime<Utc>>,
    pub embedding_timeout: bool,

    pub chunks_count: Option<i64>,
    /// Total characters across all chunks.
    pub chunks_size: Option<i64>,
    pub embedding_model_name: Option<String>,
    pub error_message: Option<String>,

    #[serde(default)]
    pub sub_tasks: Vec<ExtractionSubTask>,
}

impl ContentProcessingTask {
    /// The processing run has reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.processing_cancelled
            || self.processing_timeout
            || self.processing_finished_at.is_some()
            || self.processing_failed_at.is_some()
    }

    /// The sub-task whose artifact feeds the embedding phase.
    pub fn winning_sub_task(&self) -> Option<&ExtractionSubTask> {
        self.sub_tasks
            .iter()
            .find(|s| s.selected && s.finished_at.is_some())
    }
}

/// One extraction method's attempt within a processing task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionSubTask {
    pub id: String,
    pub task_id: String,
    pub extraction_method: String,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub timed_out: bool,
    /// Artifact produced by a successful attempt.
    pub markdown_file_name: Option<String>,
    /// Characters of normalized output.
    pub output_length: Option<i64>,
    /// Chosen as the extraction result of the task.
    pub selected: bool,
    pub error_message: Option<String>,
}

/// A segment of normalized text, ready to embed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextChunk {
    pub index: usize,
    /// Heading path the chunk sits under, e.g. `Guide > Install`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,
    pub text: String,
}

/// A chunk with its embedding, as stored for retrieval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredChunk {
    pub id: String,
    pub file_id: String,
    pub library_id: String,
    pub task_id: String,
    pub chunk_index: i64,
    pub section: Option<String>,
    pub text: String,
    #[serde(skip)]
    pub embedding: Vec<f32>,
}

// ---------------------------------------------------------------------------
// Crawlers
// ---------------------------------------------------------------------------

/// Kind of remote source a crawler watches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UriType {
    Http,
    Smb,
    SharePoint,
    Box,
}

text_enum!(UriType {
    Http => "http",
    Smb => "smb",
    SharePoint => "sharepoint",
    Box => "box",
});

/// Recurring run schedule: weekday flags plus a time of day (UTC).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrawlerSchedule {
    pub monday: bool,
    pub tuesday: bool,
    pub wednesday: bool,
    pub thursday: bool,
    pub friday: bool,
    pub saturday: bool,
    pub sunday: bool,
    pub hour: u8,
    pub minute: u8,
    pub active: bool,
}

/// A configured remote-source watcher for a library.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Crawler {
    pub id: String,
    pub library_id: String,
    pub uri: String,
    pub uri_type: UriType,
    pub max_depth: u32,
    pub max_pages: u32,
    /// Lower size bound in MB.
    pub min_file_size_mb: Option<f64>,
    /// Upper size bound in MB.
    pub max_file_size_mb: Option<f64>,
    #[serde(default)]
    pub include_patterns: Vec<String>,
    #[serde(default)]
    pub exclude_patterns: Vec<String>,
    /// Empty means every type is accepted.
    #[serde(default)]
    pub allowed_mime_types: Vec<String>,
    pub schedule: Option<CrawlerSchedule>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for creating or updating a crawler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlerInput {
    pub library_id: String,
    pub uri: String,
    pub uri_type: UriType,
    pub max_depth: u32,
    pub max_pages: u32,
    #[serde(default)]
    pub min_file_size_mb: Option<f64>,
    #[serde(default)]
    pub max_file_size_mb: Option<f64>,
    #[serde(default)]
    pub include_patterns: Vec<String>,
    #[serde(default)]
    pub exclude_patterns: Vec<String>,
    #[serde(default)]
    pub allowed_mime_types: Vec<String>,
    #[serde(default)]
    pub schedule: Option<CrawlerSchedule>,
}

/// Aggregate update counts keyed by type.
pub type UpdateStats = BTreeMap<UpdateType, u64>;

/// One execution of a crawler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlerRun {
    pub id: String,
    pub crawler_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub stopped_by_user: Option<DateTime<Utc>>,
    pub success: Option<bool>,
    pub error_message: Option<String>,
    pub triggered_by: Option<String>,
    pub updates_count: u64,
    #[serde(default)]
    pub update_stats: UpdateStats,
}

/// Kind of change a crawler run discovered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateType {
    Added,
    Updated,
    Skipped,
    Omitted,
    Deleted,
    Error,
}

text_enum!(UpdateType {
    Added => "added",
    Updated => "updated",
    Skipped => "skipped",
    Omitted => "omitted",
    Deleted => "deleted",
    Error => "error",
});

/// Why a discovered file was left out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterType {
    IncludePattern,
    ExcludePattern,
    FileSize,
    MimeType,
}

text_enum!(FilterType {
    IncludePattern => "include_pattern",
    ExcludePattern => "exclude_pattern",
    FileSize => "file_size",
    MimeType => "mime_type",
});

/// One discovered change. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LibraryUpdate {
    pub id: String,
    pub library_id: String,
    pub crawler_run_id: Option<String>,
    pub file_id: Option<String>,
    pub update_type: UpdateType,
    pub file_name: Option<String>,
    pub origin_uri: Option<String>,
    pub file_size: Option<i64>,
    pub filter_type: Option<FilterType>,
    pub filter_value: Option<String>,
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Fields for a new [`LibraryUpdate`]; id and timestamp are assigned on insert.
#[derive(Debug, Clone)]
pub struct NewLibraryUpdate {
    pub library_id: String,
    pub crawler_run_id: Option<String>,
    pub file_id: Option<String>,
    pub update_type: UpdateType,
    pub file_name: Option<String>,
    pub origin_uri: Option<String>,
    pub file_size: Option<i64>,
    pub filter_type: Option<FilterType>,
    pub filter_value: Option<String>,
    pub message: Option<String>,
}

// ---------------------------------------------------------------------------
// Lists and fields
// ---------------------------------------------------------------------------

/// A user-defined table over one or more libraries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct List {
    pub id: String,
    pub name: String,
    /// Source libraries whose files become the list's rows.
    pub library_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldSourceType {
    FileProperty,
    LlmComputed,
}

text_enum!(FieldSourceType {
    FileProperty => "file_property",
    LlmComputed => "llm_computed",
});

/// Declared value type of a list field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Text,
    Markdown,
    Number,
    Date,
    Datetime,
    Boolean,
}

text_enum!(FieldType {
    String => "string",
    Text => "text",
    Markdown => "markdown",
    Number => "number",
    Date => "date",
    Datetime => "datetime",
    Boolean => "boolean",
});

/// File attribute projected by a `file_property` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FileProperty {
    Name,
    OriginUri,
    Source,
    CrawlerUri,
    MimeType,
    Size,
}

text_enum!(FileProperty {
    Name => "name",
    OriginUri => "originUri",
    Source => "source",
    CrawlerUri => "crawlerUri",
    MimeType => "mimeType",
    Size => "size",
});

/// A column of a list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListField {
    pub id: String,
    pub list_id: String,
    pub name: String,
    pub order: i64,
    pub field_type: FieldType,
    pub source_type: FieldSourceType,
    pub file_property: Option<FileProperty>,
    pub prompt: Option<String>,
    /// Retrieval query; the prompt is used when unset.
    pub content_query: Option<String>,
    pub language_model: Option<String>,
    pub use_vector_store: bool,
    /// Comma-separated terms that mark a model answer as a failure.
    pub failure_terms: Option<String>,
    /// Fields resolved before this one is computed.
    #[serde(default)]
    pub context_field_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// The cached value of one (field, file) pair.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CachedValue {
    pub field_id: String,
    pub file_id: String,
    pub value_string: Option<String>,
    pub value_number: Option<f64>,
    pub value_boolean: Option<bool>,
    pub value_date: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl CachedValue {
    /// Render the value for prompting, according to the field's type.
    pub fn display_value(&self, field_type: FieldType) -> Option<String> {
        match field_type {
            FieldType::String | FieldType::Text | FieldType::Markdown => self.value_string.clone(),
            FieldType::Number => self.value_number.map(|n| n.to_string()),
            FieldType::Boolean => self
                .value_boolean
                .map(|b| if b { "Yes".to_string() } else { "No".to_string() }),
            FieldType::Date | FieldType::Datetime => self.value_date.map(|d| d.to_rfc3339()),
        }
    }
}

/// Comparison applied by a list filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FilterOperator {
    Equals,
    Contains,
    IsEmpty,
    IsNotEmpty,
}

text_enum!(FilterOperator {
    Equals => "equals",
    Contains => "contains",
    IsEmpty => "isEmpty",
    IsNotEmpty => "isNotEmpty",
});

/// A condition over another field's value, used to scope bulk enqueues.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListFilter {
    pub field_id: String,
    pub operator: FilterOperator,
    #[serde(default)]
    pub value: Option<String>,
}

// ---------------------------------------------------------------------------
// Enrichment
// ---------------------------------------------------------------------------

/// Who authored a message in the model exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }
}

/// A retrieved chunk attached to an enrichment output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarChunk {
    pub id: String,
    pub file_id: String,
    pub file_name: String,
    pub text: String,
    pub distance: f32,
}

/// A resolved context-field slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextFieldValue {
    pub field_id: String,
    pub field_name: String,
    pub value: Option<String>,
    pub error_message: Option<String>,
}

/// Input snapshot captured when the task starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichmentInput {
    pub file_id: String,
    pub file_name: String,
    pub field_id: String,
    pub field_name: String,
    pub library_id: String,
    pub library_name: String,
    pub model: String,
    pub prompt: String,
    pub data_type: FieldType,
    #[serde(default)]
    pub context_fields: Vec<ContextFieldValue>,
    pub content_query: Option<String>,
    pub use_vector_store: bool,
    pub failure_terms: Option<String>,
    pub embedding_model: Option<String>,
}

/// Output snapshot written when the task ends.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnrichmentOutput {
    pub model_instance: Option<String>,
    pub enriched_value: Option<String>,
    #[serde(default)]
    pub similar_chunks: Vec<SimilarChunk>,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub issues: Vec<String>,
}

/// One request to (re)compute a cache entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichmentTask {
    pub id: String,
    pub list_id: String,
    pub field_id: String,
    pub file_id: String,
    pub status: EnrichmentStatus,
    /// Higher drains first.
    pub priority: i64,
    pub requested_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub input: Option<EnrichmentInput>,
    pub output: Option<EnrichmentOutput>,
}

// ---------------------------------------------------------------------------
// Queues
// ---------------------------------------------------------------------------

/// Queue types supervised by the worker manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum QueueType {
    ContentProcessing,
    Enrichment,
}

text_enum!(QueueType {
    ContentProcessing => "content-processing",
    Enrichment => "enrichment",
});

/// Live task-table counts for one queue.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskCounts {
    pub pending: u64,
    pub processing: u64,
    pub failed: u64,
    pub completed: u64,
    pub last_processed_at: Option<DateTime<Utc>>,
}

/// Status of one queue type as reported to operators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueStatus {
    pub queue_type: QueueType,
    pub is_running: bool,
    #[serde(flatten)]
    pub counts: TaskCounts,
}

/// Result of a bulk queue operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueOperationResult {
    pub success: bool,
    pub message: String,
    pub affected_count: u64,
}

impl QueueOperationResult {
    pub fn ok(message: impl Into<String>, affected_count: u64) -> Self {
        Self {
            success: true,
            message: message.into(),
            affected_count,
        }
    }
}

// ---------------------------------------------------------------------------
// Pagination
// ---------------------------------------------------------------------------

/// Offset/limit window for list queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    pub offset: u64,
    pub limit: u64,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: 20,
        }
    }
}

/// One page of results plus the unpaginated total.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub offset: u64,
    pub limit: u64,
}
