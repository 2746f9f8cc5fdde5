//! Source connector abstraction.
//!
//! A [`CrawlSource`] knows how to visit one location of a remote system and
//! report the file found there (if any) plus the child locations to visit
//! next. Traversal order, depth and page bounds belong to the caller.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use librarian_shared::{LibrarianError, Result, UriType};

/// A file fetched from a remote source.
#[derive(Debug, Clone)]
pub struct RemoteFile {
    /// Location the file was fetched from; the diff key against known files.
    pub uri: String,
    pub name: String,
    /// Source-relative path, tested by include/exclude patterns.
    pub path: String,
    pub mime_type: String,
    /// Size in bytes.
    pub size: i64,
    pub modified_at: Option<DateTime<Utc>>,
    pub content: Vec<u8>,
    /// SHA-256 of `content`, hex encoded.
    pub content_hash: String,
}

/// Result of visiting one location.
#[derive(Debug, Clone, Default)]
pub struct Visit {
    pub file: Option<RemoteFile>,
    /// Locations discovered from this one, one level deeper.
    pub children: Vec<String>,
}

/// A connector to one kind of remote system.
#[async_trait]
pub trait CrawlSource: Send + Sync {
    fn uri_type(&self) -> UriType;

    /// Visit `uri`, discovered while crawling from `root`.
    async fn visit(&self, root: &str, uri: &str) -> Result<Visit>;
}

/// Connectors keyed by the URI type they serve.
#[derive(Default, Clone)]
pub struct SourceRegistry {
    sources: HashMap<UriType, Arc<dyn CrawlSource>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, source: Arc<dyn CrawlSource>) {
        self.sources.insert(source.uri_type(), source);
    }

    /// The connector for `uri_type`, or a validation error when none is installed.
    pub fn get(&self, uri_type: UriType) -> Result<Arc<dyn CrawlSource>> {
        self.sources.get(&uri_type).cloned().ok_or_else(|| {
            LibrarianError::validation(format!("no connector installed for '{uri_type}' sources"))
        })
    }
}

/// Compute the SHA-256 of raw bytes as lowercase hex.
pub fn compute_hash(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    format!("{:x}", hasher.finalize())
}
