//! Source connectors and file filtering for crawler runs.
//!
//! This crate provides:
//! - [`CrawlSource`] and [`SourceRegistry`]: connectors keyed by URI type
//! - [`HttpSource`]: the HTTP(S) connector
//! - [`FileFilter`]: include/exclude, size and mime rules of a crawler

pub mod filter;
pub mod http;
pub mod source;

pub use filter::{FileFilter, FilterRejection};
pub use http::{HttpSource, normalize_url};
pub use source::{CrawlSource, RemoteFile, SourceRegistry, Visit, compute_hash};
