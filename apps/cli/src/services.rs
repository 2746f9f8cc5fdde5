//! Wiring of storage, providers and domain services from the loaded config.

use std::sync::Arc;
use std::time::Duration;

use color_eyre::eyre::Result;
use librarian_core::{
    ContentProcessor, CrawlerRunner, CrawlerScheduler, EnrichmentEngine, ExtractionRegistry,
    OpenRouterClient, QueueSettings, QueueWorkerManager, StoredChunkIndex,
};
use librarian_crawler::{HttpSource, SourceRegistry};
use librarian_shared::{AppConfig, database_path, resolve_api_key};
use librarian_storage::Storage;
use tracing::debug;

/// Everything a command may need, built once per invocation.
pub(crate) struct Services {
    pub processor: Arc<ContentProcessor>,
    pub engine: Arc<EnrichmentEngine>,
    pub runner: Arc<CrawlerRunner>,
    pub workers: QueueWorkerManager,
    pub scheduler: Arc<CrawlerScheduler>,
}

impl Services {
    /// Open the database and build the services. With `require_api_key`,
    /// a missing OpenRouter key fails here rather than at the first model call.
    pub(crate) async fn build(config: &AppConfig, require_api_key: bool) -> Result<Self> {
        let db_path = database_path(config)?;
        debug!(path = %db_path.display(), "opening database");
        let storage = Arc::new(Storage::open(&db_path).await?);

        let timeout = Duration::from_millis(config.enrichment.llm_timeout_ms);
        let client = if require_api_key {
            OpenRouterClient::from_config(&config.openrouter, timeout)?
        } else {
            let api_key = resolve_api_key(&config.openrouter).unwrap_or_else(|e| {
                debug!(error = %e, "no API key; model calls will fail");
                String::new()
            });
            OpenRouterClient::new(&config.openrouter, api_key, timeout)?
        };
        let client = Arc::new(client);

        let processor = Arc::new(ContentProcessor::new(
            Arc::clone(&storage),
            Arc::new(ExtractionRegistry::with_builtin()),
            client.clone(),
            config.processing.clone(),
        ));

        let engine = Arc::new(EnrichmentEngine::new(
            Arc::clone(&storage),
            client.clone(),
            client,
            Arc::new(StoredChunkIndex::new(Arc::clone(&storage))),
            config.enrichment.clone(),
        ));

        let mut sources = SourceRegistry::new();
        sources.register(Arc::new(HttpSource::new(&config.crawler)?));
        let runner = Arc::new(CrawlerRunner::new(
            Arc::clone(&storage),
            sources,
            Arc::clone(&processor),
            config.crawler.clone(),
        ));

        let workers = QueueWorkerManager::new(
            Arc::clone(&storage),
            Arc::clone(&processor),
            Arc::clone(&engine),
            QueueSettings::from(&config.processing),
            QueueSettings::from(&config.enrichment),
        );

        let scheduler = Arc::new(CrawlerScheduler::new(
            Arc::clone(&storage),
            Arc::clone(&runner),
            Duration::from_millis(config.crawler.schedule_poll_interval_ms),
        ));

        Ok(Self {
            processor,
            engine,
            runner,
            workers,
            scheduler,
        })
    }
}
