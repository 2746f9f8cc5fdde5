//! Domain logic for Librarian.
//!
//! This crate ties storage and source connectors together into the server
//! workflows:
//! - [`ContentProcessor`]: extraction, chunking and embedding of files
//! - [`CrawlerRunner`] and [`CrawlerScheduler`]: crawl runs and their schedules
//! - [`EnrichmentEngine`]: LLM-computed list field values
//! - [`QueueWorkerManager`]: worker groups draining both task queues
//! - [`OpenRouterClient`]: the default language model and embedding provider

pub mod chunking;
pub mod crawl_run;
pub mod enrichment;
pub mod extraction;
pub mod filters;
pub mod index;
pub mod openrouter;
pub mod processing;
pub mod providers;
pub mod schedule;
pub mod workers;

#[cfg(test)]
pub(crate) mod testing;

pub use crawl_run::{CrawlerRunner, validate_input};
pub use enrichment::{ClearResult, EnqueueRequest, EnqueueResult, EnrichmentEngine};
pub use filters::{FieldValue, FieldValueResolver, apply_filters};
pub use index::StoredChunkIndex;
pub use openrouter::OpenRouterClient;
pub use processing::{ContentProcessor, FileProcessingStatus, SubmitRequest};
pub use providers::{
    Completion, EmbeddingProvider, ExtractionMethod, ExtractionRegistry, LanguageModel,
    SimilarityIndex,
};
pub use schedule::CrawlerScheduler;
pub use workers::{QueueSettings, QueueWorkerManager};
