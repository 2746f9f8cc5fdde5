//! Collaborator interfaces consumed by the pipelines.
//!
//! Extraction methods, the embedding provider, the language model and the
//! similarity index are all pluggable; the host application decides which
//! implementations to install.

use std::sync::Arc;

use async_trait::async_trait;

use librarian_shared::{ChatMessage, LibrarianError, LibraryFile, Result, StoredChunk};
use librarian_storage::ChunkScope;

// ---------------------------------------------------------------------------
// Extraction
// ---------------------------------------------------------------------------

/// Converts a file's raw bytes into normalized Markdown.
#[async_trait]
pub trait ExtractionMethod: Send + Sync {
    /// Registry id, e.g. `html-extraction`.
    fn id(&self) -> &str;

    /// Mime types this method can convert.
    fn mime_types(&self) -> &[&str];

    fn enabled(&self) -> bool {
        true
    }

    fn supports(&self, mime_type: &str) -> bool {
        let mime = mime_type.to_lowercase();
        self.mime_types().iter().any(|m| *m == mime)
    }

    /// `options` carries the method's entry from the task's extraction options.
    async fn extract(
        &self,
        file: &LibraryFile,
        content: &[u8],
        options: Option<&serde_json::Value>,
    ) -> Result<String>;
}

/// Extraction methods in priority order (first registered ranks highest).
#[derive(Clone, Default)]
pub struct ExtractionRegistry {
    methods: Vec<Arc<dyn ExtractionMethod>>,
}

impl ExtractionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in text, HTML and CSV methods.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(crate::extraction::HtmlExtraction));
        registry.register(Arc::new(crate::extraction::CsvExtraction));
        registry.register(Arc::new(crate::extraction::TextExtraction));
        registry
    }

    /// Append a method; replaces an existing method with the same id in place.
    pub fn register(&mut self, method: Arc<dyn ExtractionMethod>) {
        match self.methods.iter().position(|m| m.id() == method.id()) {
            Some(idx) => self.methods[idx] = method,
            None => self.methods.push(method),
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn ExtractionMethod>> {
        self.methods.iter().find(|m| m.id() == id).cloned()
    }

    /// Position in priority order; lower ranks first. Unknown ids rank last.
    pub fn priority(&self, id: &str) -> usize {
        self.methods
            .iter()
            .position(|m| m.id() == id)
            .unwrap_or(usize::MAX)
    }

    /// Enabled methods supporting `mime_type`, in priority order.
    pub fn supporting(&self, mime_type: &str) -> Vec<Arc<dyn ExtractionMethod>> {
        self.methods
            .iter()
            .filter(|m| m.enabled() && m.supports(mime_type))
            .cloned()
            .collect()
    }

    /// Resolve the methods a task should run. An empty request means every
    /// enabled method supporting the mime type. Any unknown, disabled or
    /// unsupported method in an explicit request is a validation error.
    pub fn resolve(&self, requested: &[String], mime_type: &str) -> Result<Vec<Arc<dyn ExtractionMethod>>> {
        let methods = if requested.is_empty() {
            self.supporting(mime_type)
        } else {
            let mut methods = Vec::with_capacity(requested.len());
            for id in requested {
                let method = self.get(id).ok_or_else(|| {
                    LibrarianError::validation(format!("unknown extraction method '{id}'"))
                })?;
                if !method.enabled() {
                    return Err(LibrarianError::validation(format!(
                        "extraction method '{id}' is disabled"
                    )));
                }
                if !method.supports(mime_type) {
                    return Err(LibrarianError::validation(format!(
                        "extraction method '{id}' does not support '{mime_type}'"
                    )));
                }
                if !methods.iter().any(|m: &Arc<dyn ExtractionMethod>| m.id() == method.id()) {
                    methods.push(method);
                }
            }
            methods
        };

        if methods.is_empty() {
            return Err(LibrarianError::validation(format!(
                "no extraction method available for '{mime_type}'"
            )));
        }
        Ok(methods)
    }
}

// ---------------------------------------------------------------------------
// Models
// ---------------------------------------------------------------------------

/// Turns text into vectors.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// One vector per input, in input order.
    async fn embed(&self, model: &str, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Rough token count of `text`, for size accounting and logging.
    fn estimate_tokens(&self, text: &str) -> usize {
        text.chars().count().div_ceil(4)
    }
}

/// A model answer.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub content: String,
    /// Provider-side id of the model instance that answered.
    pub model_instance: Option<String>,
}

/// Answers a message exchange.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn complete(&self, model: &str, messages: &[ChatMessage]) -> Result<Completion>;
}

/// Ranks stored chunks by distance to a query vector.
#[async_trait]
pub trait SimilarityIndex: Send + Sync {
    /// Up to `limit` chunks, nearest first, with their distances.
    async fn search(
        &self,
        query: &[f32],
        scope: &ChunkScope,
        limit: usize,
    ) -> Result<Vec<(StoredChunk, f32)>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_registry_priority_and_resolution() {
        let registry = ExtractionRegistry::with_builtin();
        assert!(registry.priority("html-extraction") < registry.priority("text-extraction"));
        assert_eq!(registry.priority("nope"), usize::MAX);

        let methods = registry.resolve(&[], "text/html").expect("resolve");
        assert_eq!(methods.len(), 1);
        assert_eq!(methods[0].id(), "html-extraction");

        let err = registry
            .resolve(&["csv-extraction".to_string()], "text/html")
            .err()
            .expect("unsupported");
        assert!(err.to_string().contains("does not support"));

        let err = registry.resolve(&[], "image/png").err().expect("none");
        assert!(err.to_string().contains("no extraction method"));
    }

    #[test]
    fn register_replaces_same_id() {
        let mut registry = ExtractionRegistry::with_builtin();
        registry.register(Arc::new(crate::extraction::TextExtraction));
        assert_eq!(registry.supporting("text/plain").len(), 1);
    }
}
