//! OpenRouter (OpenAI-compatible) chat and embedding client.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode, header};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use librarian_shared::{ChatMessage, LibrarianError, OpenRouterConfig, Result, resolve_api_key};

use crate::providers::{Completion, EmbeddingProvider, LanguageModel};

/// HTTP client for an OpenRouter-compatible API.
#[derive(Clone)]
pub struct OpenRouterClient {
    http: Client,
    api_key: String,
    base_url: String,
    default_model: String,
    embedding_model: String,
    timeout_ms: u64,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    #[serde(default)]
    index: usize,
    embedding: Vec<f32>,
}

impl OpenRouterClient {
    pub fn new(config: &OpenRouterConfig, api_key: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("librarian/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| LibrarianError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            api_key: api_key.into(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            default_model: config.default_model.clone(),
            embedding_model: config.embedding_model.clone(),
            timeout_ms: timeout.as_millis() as u64,
        })
    }

    /// Build a client with the API key read from the configured env var.
    pub fn from_config(config: &OpenRouterConfig, timeout: Duration) -> Result<Self> {
        let api_key = resolve_api_key(config)?;
        Self::new(config, api_key, timeout)
    }

    async fn post<B: Serialize + ?Sized, R: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        body: &B,
        operation: &str,
    ) -> Result<R> {
        let url = format!("{}/{path}", self.base_url);
        let response = self
            .http
            .post(&url)
            .header(header::AUTHORIZATION, format!("Bearer {}", self.api_key))
            .json(body)
            .send()
            .await
            .map_err(|e| self.request_error(operation, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(operation, status, &body));
        }
        response
            .json::<R>()
            .await
            .map_err(|e| LibrarianError::Network(format!("{operation}: malformed response: {e}")))
    }

    fn request_error(&self, operation: &str, e: reqwest::Error) -> LibrarianError {
        if e.is_timeout() {
            LibrarianError::timeout(operation, self.timeout_ms)
        } else {
            LibrarianError::Network(format!("{operation}: {e}"))
        }
    }
}

fn status_error(operation: &str, status: StatusCode, body: &str) -> LibrarianError {
    let snippet: String = body.chars().take(200).collect();
    LibrarianError::Network(format!("{operation}: HTTP {status}: {snippet}"))
}

#[async_trait]
impl LanguageModel for OpenRouterClient {
    #[instrument(skip_all, fields(model = %model, messages = messages.len()))]
    async fn complete(&self, model: &str, messages: &[ChatMessage]) -> Result<Completion> {
        let model = if model.is_empty() { &self.default_model } else { model };
        let response: ChatResponse = self
            .post("chat/completions", &ChatRequest { model, messages }, "chat completion")
            .await?;

        let content = response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| LibrarianError::Enrichment("chat completion returned no choices".into()))?;
        debug!(chars = content.len(), "chat completion received");

        Ok(Completion {
            content,
            model_instance: response.model,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OpenRouterClient {
    #[instrument(skip_all, fields(model = %model, inputs = texts.len()))]
    async fn embed(&self, model: &str, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let model = if model.is_empty() { &self.embedding_model } else { model };
        let mut response: EmbeddingResponse = self
            .post("embeddings", &EmbeddingRequest { model, input: texts }, "embedding")
            .await?;

        if response.data.len() != texts.len() {
            return Err(LibrarianError::Embedding(format!(
                "expected {} vectors, got {}",
                texts.len(),
                response.data.len()
            )));
        }
        response.data.sort_by_key(|d| d.index);
        Ok(response.data.into_iter().map(|d| d.embedding).collect())
    }
}
