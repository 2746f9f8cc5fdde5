//! Shared types, error model, status vocabulary and configuration for Librarian.
//!
//! This crate is the foundation depended on by all other Librarian crates.
//! It provides:
//! - [`LibrarianError`]: the unified error type
//! - Domain types (files, processing tasks, crawlers, lists, enrichment tasks)
//! - The status model ([`ProcessingStatus`], [`PhaseStatus`], [`EnrichmentStatus`])
//! - Configuration ([`AppConfig`], config loading)

pub mod config;
pub mod error;
pub mod status;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, CrawlerSettings, DatabaseConfig, EnrichmentConfig, OpenRouterConfig,
    ProcessingConfig, config_dir, config_file_path, database_path, init_config, load_config,
    load_config_from, resolve_api_key,
};
pub use error::{LibrarianError, Result};
pub use status::{
    EmbeddingStatus, EnrichmentStatus, ExtractionStatus, PhaseStatus, ProcessingStatus,
    derive_file_status,
};
pub use types::*;
