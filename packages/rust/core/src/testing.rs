//! Test doubles and fixtures shared by the core test modules.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use librarian_crawler::{CrawlSource, RemoteFile, SourceRegistry, Visit, compute_hash};
use librarian_shared::{
    ChatMessage, CrawlerInput, CrawlerSettings, LibrarianError, LibraryFile, ProcessingConfig,
    Result, UriType,
};
use librarian_storage::{NewFile, Storage};

use crate::crawl_run::CrawlerRunner;
use crate::processing::ContentProcessor;
use crate::providers::{
    Completion, EmbeddingProvider, ExtractionMethod, ExtractionRegistry, LanguageModel,
};

/// A fresh database in the temp directory.
pub(crate) async fn test_storage() -> Storage {
    let tmp = std::env::temp_dir().join(format!("librarian_core_{}.db", Uuid::now_v7()));
    Storage::open(&tmp).await.expect("open test db")
}

/// A library (with the given embedding model) holding one plain-text file.
pub(crate) async fn seed_file(storage: &Storage, embedding_model: Option<&str>) -> LibraryFile {
    let library = storage
        .insert_library("Docs", embedding_model)
        .await
        .expect("library");
    storage
        .insert_file(&NewFile {
            library_id: library.id,
            name: "notes.txt".into(),
            mime_type: "text/plain".into(),
            content: b"alpha beta gamma".to_vec(),
            origin_uri: None,
            origin_modified_at: None,
            crawler_id: None,
            content_hash: None,
        })
        .await
        .expect("file")
}

// ---------------------------------------------------------------------------
// Extraction and embedding
// ---------------------------------------------------------------------------

/// Extraction method returning fixed text after an optional delay.
pub(crate) struct StaticMethod {
    id: String,
    output: Option<String>,
    delay: Duration,
}

impl StaticMethod {
    pub(crate) fn new(id: &str, output: &str) -> Self {
        Self {
            id: id.to_string(),
            output: Some(output.to_string()),
            delay: Duration::ZERO,
        }
    }

    pub(crate) fn failing(id: &str) -> Self {
        Self {
            id: id.to_string(),
            output: None,
            delay: Duration::ZERO,
        }
    }

    pub(crate) fn delayed(mut self, ms: u64) -> Self {
        self.delay = Duration::from_millis(ms);
        self
    }
}

#[async_trait]
impl ExtractionMethod for StaticMethod {
    fn id(&self) -> &str {
        &self.id
    }

    fn mime_types(&self) -> &[&str] {
        &["text/plain"]
    }

    fn supports(&self, _mime_type: &str) -> bool {
        true
    }

    async fn extract(
        &self,
        _file: &LibraryFile,
        _content: &[u8],
        _options: Option<&serde_json::Value>,
    ) -> Result<String> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.output
            .clone()
            .ok_or_else(|| LibrarianError::Extraction(format!("{}: parser crashed", self.id)))
    }
}

/// Embeds text as `[count("alpha"), count("beta"), 1.0]`.
#[derive(Default)]
pub(crate) struct FixedEmbedder {
    calls: AtomicUsize,
    fail_after: Option<usize>,
}

impl FixedEmbedder {
    /// Succeeds for the first `batches` calls, then fails.
    pub(crate) fn failing_after(batches: usize) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            fail_after: Some(batches),
        }
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EmbeddingProvider for FixedEmbedder {
    async fn embed(&self, _model: &str, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_after.is_some_and(|n| call >= n) {
            return Err(LibrarianError::Embedding("provider unavailable".into()));
        }
        Ok(texts
            .iter()
            .map(|t| {
                let lower = t.to_lowercase();
                vec![
                    lower.matches("alpha").count() as f32,
                    lower.matches("beta").count() as f32,
                    1.0,
                ]
            })
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Language model
// ---------------------------------------------------------------------------

/// Language model with a canned answer; records every exchange.
pub(crate) struct ScriptedModel {
    reply: std::result::Result<String, String>,
    delay: Duration,
    calls: Mutex<Vec<Vec<ChatMessage>>>,
}

impl ScriptedModel {
    pub(crate) fn replying(reply: &str) -> Self {
        Self {
            reply: Ok(reply.to_string()),
            delay: Duration::ZERO,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn failing(message: &str) -> Self {
        Self {
            reply: Err(message.to_string()),
            delay: Duration::ZERO,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn delayed(mut self, ms: u64) -> Self {
        self.delay = Duration::from_millis(ms);
        self
    }

    pub(crate) fn calls(&self) -> Vec<Vec<ChatMessage>> {
        self.calls.lock().expect("calls lock").clone()
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn complete(&self, model: &str, messages: &[ChatMessage]) -> Result<Completion> {
        self.calls
            .lock()
            .expect("calls lock")
            .push(messages.to_vec());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        match &self.reply {
            Ok(content) => Ok(Completion {
                content: content.clone(),
                model_instance: Some(format!("{model}-instance")),
            }),
            Err(message) => Err(LibrarianError::Enrichment(message.clone())),
        }
    }
}

// ---------------------------------------------------------------------------
// Crawling
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
struct FakeEntry {
    file: Option<(String, Vec<u8>)>,
    children: Vec<String>,
}

/// In-memory HTTP-typed source. Clones share their entries, so a test can
/// change the source between runs. Unknown locations fail to visit.
#[derive(Clone, Default)]
pub(crate) struct FakeSource {
    entries: Arc<Mutex<HashMap<String, FakeEntry>>>,
    delay: Duration,
}

impl FakeSource {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// A location with children and no file.
    pub(crate) fn page(self, uri: &str, children: &[&str]) -> Self {
        self.replace(uri, None, children);
        self
    }

    /// A leaf location holding a file.
    pub(crate) fn file(self, uri: &str, mime: &str, content: &str) -> Self {
        self.replace_file(uri, mime, content);
        self
    }

    pub(crate) fn delayed(mut self, ms: u64) -> Self {
        self.delay = Duration::from_millis(ms);
        self
    }

    pub(crate) fn replace(&self, uri: &str, file: Option<(&str, &str)>, children: &[&str]) {
        let entry = FakeEntry {
            file: file.map(|(mime, content)| (mime.to_string(), content.as_bytes().to_vec())),
            children: children.iter().map(|c| c.to_string()).collect(),
        };
        self.entries
            .lock()
            .expect("entries lock")
            .insert(uri.to_string(), entry);
    }

    pub(crate) fn replace_file(&self, uri: &str, mime: &str, content: &str) {
        self.replace(uri, Some((mime, content)), &[]);
    }
}

#[async_trait]
impl CrawlSource for FakeSource {
    fn uri_type(&self) -> UriType {
        UriType::Http
    }

    async fn visit(&self, _root: &str, uri: &str) -> Result<Visit> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let entry = self
            .entries
            .lock()
            .expect("entries lock")
            .get(uri)
            .cloned()
            .ok_or_else(|| LibrarianError::Network(format!("404 Not Found for {uri}")))?;

        let file = entry.file.map(|(mime_type, content)| {
            let name = uri.rsplit('/').next().unwrap_or(uri).to_string();
            RemoteFile {
                uri: uri.to_string(),
                name,
                path: uri.to_string(),
                mime_type,
                size: content.len() as i64,
                modified_at: None,
                content_hash: compute_hash(&content),
                content,
            }
        });
        Ok(Visit {
            file,
            children: entry.children,
        })
    }
}

pub(crate) fn crawler_input(library_id: &str, uri: &str) -> CrawlerInput {
    CrawlerInput {
        library_id: library_id.to_string(),
        uri: uri.to_string(),
        uri_type: UriType::Http,
        max_depth: 3,
        max_pages: 100,
        min_file_size_mb: None,
        max_file_size_mb: None,
        include_patterns: Vec::new(),
        exclude_patterns: Vec::new(),
        allowed_mime_types: Vec::new(),
        schedule: None,
    }
}

pub(crate) struct RunnerFixture {
    pub(crate) storage: Arc<Storage>,
    pub(crate) runner: Arc<CrawlerRunner>,
    pub(crate) library_id: String,
}

impl RunnerFixture {
    /// A live file the crawler discovered on some earlier run.
    pub(crate) async fn seed_crawler_file(&self, crawler_id: &str, origin_uri: &str) -> LibraryFile {
        self.storage
            .insert_file(&NewFile {
                library_id: self.library_id.clone(),
                name: "old.txt".into(),
                mime_type: "text/plain".into(),
                content: b"stale".to_vec(),
                origin_uri: Some(origin_uri.to_string()),
                origin_modified_at: None,
                crawler_id: Some(crawler_id.to_string()),
                content_hash: Some(compute_hash(b"stale")),
            })
            .await
            .expect("seed crawler file")
    }
}

/// A runner over `source`, one page per batch.
pub(crate) async fn runner_fixture(source: FakeSource) -> RunnerFixture {
    let storage = Arc::new(test_storage().await);
    let library = storage
        .insert_library("Crawled", Some("embed-small"))
        .await
        .expect("library");

    let processor = Arc::new(ContentProcessor::new(
        Arc::clone(&storage),
        Arc::new(ExtractionRegistry::with_builtin()),
        Arc::new(FixedEmbedder::default()),
        ProcessingConfig::default(),
    ));
    let mut sources = SourceRegistry::new();
    sources.register(Arc::new(source));
    let settings = CrawlerSettings {
        concurrency: 1,
        batch_size: 1,
        ..CrawlerSettings::default()
    };

    RunnerFixture {
        runner: Arc::new(CrawlerRunner::new(
            Arc::clone(&storage),
            sources,
            processor,
            settings,
        )),
        storage,
        library_id: library.id,
    }
}
