//! Enrichment task engine.
//!
//! Computes `llm_computed` list field values one (field, file) pair at a
//! time: resolves context fields, optionally retrieves similar chunks,
//! prompts the language model and parses the answer into the field's type.
//! Successful results overwrite the list item cache; failures never touch an
//! existing cache value.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use regex::Regex;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use librarian_shared::{
    CachedValue, ChatMessage, ContextFieldValue, EnrichmentConfig, EnrichmentInput,
    EnrichmentOutput, EnrichmentStatus, EnrichmentTask, FieldSourceType, FieldType,
    LibrarianError, LibraryFile, ListField, ListFilter, Page, PageRequest, Result, SimilarChunk,
};
use librarian_storage::{ChunkScope, EnrichmentTaskFilter, FieldTaskCounters, Storage};

use crate::filters::{FieldValueResolver, apply_filters};
use crate::providers::{EmbeddingProvider, LanguageModel, SimilarityIndex};

/// A request to (re)compute a field for one or many files.
#[derive(Debug, Clone, Default)]
pub struct EnqueueRequest {
    pub list_id: String,
    pub field_id: String,
    /// Omitted: every file of the list's sources that passes `filters`.
    pub file_id: Option<String>,
    pub filters: Vec<ListFilter>,
    /// Skip files that already have a value without error.
    pub only_missing: bool,
    pub priority: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueResult {
    pub created: u64,
    /// Pending tasks replaced by this request.
    pub cleaned_up: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClearResult {
    pub dequeued: u64,
    pub cleared_values: u64,
}

/// Why a task failed, plus the issue recorded for it.
struct Failure {
    message: String,
    issue: Option<String>,
}

impl Failure {
    fn new(message: impl Into<String>, issue: Option<String>) -> Self {
        Self {
            message: message.into(),
            issue,
        }
    }
}

/// Drives enrichment tasks.
pub struct EnrichmentEngine {
    storage: Arc<Storage>,
    model: Arc<dyn LanguageModel>,
    embedder: Arc<dyn EmbeddingProvider>,
    index: Arc<dyn SimilarityIndex>,
    config: EnrichmentConfig,
}

impl EnrichmentEngine {
    pub fn new(
        storage: Arc<Storage>,
        model: Arc<dyn LanguageModel>,
        embedder: Arc<dyn EmbeddingProvider>,
        index: Arc<dyn SimilarityIndex>,
        config: EnrichmentConfig,
    ) -> Self {
        Self {
            storage,
            model,
            embedder,
            index,
            config,
        }
    }

    // -----------------------------------------------------------------------
    // Requests
    // -----------------------------------------------------------------------

    #[instrument(skip_all, fields(list_id = %request.list_id, field_id = %request.field_id))]
    pub async fn enqueue(&self, request: &EnqueueRequest) -> Result<EnqueueResult> {
        let list = self
            .storage
            .get_list(&request.list_id)
            .await?
            .ok_or_else(|| LibrarianError::not_found("list", &request.list_id))?;
        let field = self.require_field(&list.id, &request.field_id).await?;
        validate_computed_field(&field)?;

        if field.use_vector_store {
            for library_id in &list.library_ids {
                let library = self
                    .storage
                    .get_library(library_id)
                    .await?
                    .ok_or_else(|| LibrarianError::not_found("library", library_id))?;
                if library.embedding_model.is_none() {
                    return Err(LibrarianError::validation(format!(
                        "field '{}' uses the vector store but library '{}' has no embedding model",
                        field.name, library.name
                    )));
                }
            }
        }

        let mut files = self.storage.list_files_for_list(&list.id).await?;
        if let Some(file_id) = &request.file_id {
            files.retain(|f| &f.id == file_id);
            if files.is_empty() {
                return Err(LibrarianError::validation(format!(
                    "file {file_id} is not part of list '{}'",
                    list.name
                )));
            }
        }
        let fields = self.storage.list_fields(&list.id).await?;
        let mut resolver = FieldValueResolver::new(Arc::clone(&self.storage));
        let files = apply_filters(&mut resolver, &fields, &request.filters, files).await?;

        let mut result = EnqueueResult::default();
        for file in files {
            if request.only_missing && self.has_value(&field.id, &file.id).await? {
                continue;
            }
            result.cleaned_up += self
                .storage
                .delete_pending_enrichment_tasks(&list.id, Some(&field.id), Some(&file.id))
                .await?;
            self.storage
                .insert_enrichment_task(&list.id, &field.id, &file.id, request.priority)
                .await?;
            result.created += 1;
        }

        info!(created = result.created, cleaned_up = result.cleaned_up, "enrichment enqueued");
        Ok(result)
    }

    /// Remove not-yet-started tasks. Running tasks finish normally.
    pub async fn dequeue_pending(
        &self,
        list_id: &str,
        field_id: Option<&str>,
        file_id: Option<&str>,
    ) -> Result<u64> {
        self.require_list(list_id).await?;
        let removed = self
            .storage
            .delete_pending_enrichment_tasks(list_id, field_id, file_id)
            .await?;
        info!(list_id, removed, "pending enrichment tasks dequeued");
        Ok(removed)
    }

    /// Dequeue pending tasks and delete cached values, forcing recomputation.
    pub async fn clear(
        &self,
        list_id: &str,
        field_id: Option<&str>,
        file_id: Option<&str>,
    ) -> Result<ClearResult> {
        let dequeued = self.dequeue_pending(list_id, field_id, file_id).await?;
        let cleared_values = self
            .storage
            .delete_cached_values(list_id, field_id, file_id)
            .await?;
        Ok(ClearResult {
            dequeued,
            cleared_values,
        })
    }

    /// Re-enqueue the latest failed task of every (field, file) in scope as a
    /// new pending task.
    pub async fn retry_failed(&self, library_id: Option<&str>) -> Result<u64> {
        let failed = self.storage.list_failed_enrichment_tasks(library_id).await?;
        let mut created = 0;
        for task in failed {
            self.storage
                .insert_enrichment_task(&task.list_id, &task.field_id, &task.file_id, task.priority)
                .await?;
            created += 1;
        }
        info!(created, "failed enrichment tasks re-enqueued");
        Ok(created)
    }

    /// Mark every pending task in scope canceled.
    pub async fn cancel_all(&self, library_id: Option<&str>) -> Result<u64> {
        self.storage.cancel_pending_enrichment(library_id).await
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub async fn get_task(&self, task_id: &str) -> Result<EnrichmentTask> {
        self.storage
            .get_enrichment_task(task_id)
            .await?
            .ok_or_else(|| LibrarianError::not_found("enrichment task", task_id))
    }

    pub async fn status_counts(
        &self,
        list_id: &str,
        field_id: Option<&str>,
    ) -> Result<Vec<(EnrichmentStatus, u64)>> {
        self.require_list(list_id).await?;
        self.storage.enrichment_status_counts(list_id, field_id).await
    }

    pub async fn field_counters(&self, list_id: &str) -> Result<Vec<FieldTaskCounters>> {
        self.require_list(list_id).await?;
        self.storage.field_task_counters(list_id).await
    }

    pub async fn list_tasks(
        &self,
        filter: &EnrichmentTaskFilter,
        page: PageRequest,
    ) -> Result<Page<EnrichmentTask>> {
        self.storage.list_enrichment_tasks(filter, page).await
    }

    // -----------------------------------------------------------------------
    // Execution
    // -----------------------------------------------------------------------

    /// Execute a claimed task and return the status it ended with. A task
    /// that stopped being `processing` meanwhile keeps its status and its
    /// result is discarded.
    #[instrument(skip_all, fields(task_id = %task.id, field_id = %task.field_id, file_id = %task.file_id))]
    pub async fn run_task(&self, task: EnrichmentTask) -> Result<EnrichmentStatus> {
        let mut output = EnrichmentOutput::default();

        let input = match self.build_input(&task, &mut output).await {
            Ok(input) => input,
            Err(e) => {
                let failure = Failure::new(e.to_string(), None);
                return self.finish_failed(&task, output, failure).await;
            }
        };
        self.storage.set_enrichment_input(&task.id, &input).await?;

        match self.compute(&input, &mut output).await {
            Ok(value) => self.finish_completed(&task, output, value).await,
            Err(failure) => self.finish_failed(&task, output, failure).await,
        }
    }

    async fn build_input(
        &self,
        task: &EnrichmentTask,
        output: &mut EnrichmentOutput,
    ) -> Result<EnrichmentInput> {
        let field = self.require_field(&task.list_id, &task.field_id).await?;
        validate_computed_field(&field)?;
        let file = self
            .storage
            .get_file(&task.file_id)
            .await?
            .ok_or_else(|| LibrarianError::not_found("file", &task.file_id))?;
        let library = self
            .storage
            .get_library(&file.library_id)
            .await?
            .ok_or_else(|| LibrarianError::not_found("library", &file.library_id))?;

        let context_fields = self.resolve_context(&field, &file, output).await?;

        Ok(EnrichmentInput {
            file_id: file.id,
            file_name: file.name,
            field_id: field.id,
            field_name: field.name,
            library_id: library.id,
            library_name: library.name,
            model: field.language_model.unwrap_or_default(),
            prompt: field.prompt.unwrap_or_default(),
            data_type: field.field_type,
            context_fields,
            content_query: field.content_query,
            use_vector_store: field.use_vector_store,
            failure_terms: field.failure_terms,
            embedding_model: library.embedding_model,
        })
    }

    /// Values of the field's declared context fields, one level deep. A
    /// missing value is recorded as an issue and an error on its slot.
    async fn resolve_context(
        &self,
        field: &ListField,
        file: &LibraryFile,
        output: &mut EnrichmentOutput,
    ) -> Result<Vec<ContextFieldValue>> {
        let mut resolver = FieldValueResolver::new(Arc::clone(&self.storage));
        let mut slots = Vec::with_capacity(field.context_field_ids.len());

        for context_id in &field.context_field_ids {
            let Some(context_field) = self.storage.get_list_field(context_id).await? else {
                warn!(context_field_id = %context_id, "context field no longer exists");
                output.issues.push(format!("missingContext: {context_id}"));
                slots.push(ContextFieldValue {
                    field_id: context_id.clone(),
                    field_name: context_id.clone(),
                    value: None,
                    error_message: Some("context field not found".into()),
                });
                continue;
            };

            let resolved = resolver.resolve(&context_field, file).await?;
            let error_message = match (&resolved.value, resolved.error_message) {
                (Some(_), _) => None,
                (None, Some(err)) => Some(err),
                (None, None) => Some("no value has been computed yet".to_string()),
            };
            if resolved.value.is_none() {
                output
                    .issues
                    .push(format!("missingContext: {}", context_field.name));
            }
            slots.push(ContextFieldValue {
                field_id: context_field.id,
                field_name: context_field.name,
                value: resolved.value,
                error_message,
            });
        }
        Ok(slots)
    }

    /// Retrieval, prompting and parsing. Fills the output snapshot as it goes.
    async fn compute(
        &self,
        input: &EnrichmentInput,
        output: &mut EnrichmentOutput,
    ) -> std::result::Result<CachedValue, Failure> {
        let values: HashMap<String, String> = input
            .context_fields
            .iter()
            .map(|slot| {
                (
                    slot.field_name.to_lowercase(),
                    slot.value.clone().unwrap_or_default(),
                )
            })
            .collect();

        let mut messages = Vec::new();
        for slot in &input.context_fields {
            if let Some(value) = &slot.value {
                let value = truncate_chars(value, self.config.max_context_chars);
                messages.push(ChatMessage::user(format!("{}: {value}", slot.field_name)));
            }
        }

        if input.use_vector_store {
            let query = input
                .content_query
                .as_deref()
                .filter(|q| !q.trim().is_empty())
                .unwrap_or(&input.prompt);
            let query = render_template(query, &values);
            output.similar_chunks = self
                .retrieve(input, &query)
                .await
                .map_err(|e| Failure::new(format!("retrieval failed: {e}"), None))?;
            if !output.similar_chunks.is_empty() {
                let excerpts = output
                    .similar_chunks
                    .iter()
                    .map(|c| c.text.as_str())
                    .collect::<Vec<_>>()
                    .join("\n\n---\n\n");
                messages.push(ChatMessage::user(format!(
                    "Relevant excerpts from {}:\n\n{excerpts}",
                    input.file_name
                )));
            }
        }

        messages.push(ChatMessage::user(render_template(&input.prompt, &values)));
        output.messages = messages;

        let timeout_ms = self.config.llm_timeout_ms;
        let completion = tokio::time::timeout(
            Duration::from_millis(timeout_ms),
            self.model.complete(&input.model, &output.messages),
        )
        .await
        .map_err(|_| {
            Failure::new(
                LibrarianError::timeout("language model call", timeout_ms).to_string(),
                Some("timeout".into()),
            )
        })?
        .map_err(|e| Failure::new(e.to_string(), None))?;

        output.model_instance = completion.model_instance;
        let answer = completion.content.trim().to_string();
        if answer.is_empty() {
            return Err(Failure::new(
                "language model returned an empty answer",
                Some("partialResult".into()),
            ));
        }
        output.enriched_value = Some(answer.clone());

        if let Some(term) = find_failure_term(&answer, input.failure_terms.as_deref()) {
            return Err(Failure::new(
                format!("model answer contains failure term '{term}'"),
                Some(format!("failureTerm: {term}")),
            ));
        }

        let mut value = parse_value(input.data_type, &answer)
            .map_err(|detail| Failure::new(detail.clone(), Some(format!("parse: {detail}"))))?;
        value.field_id = input.field_id.clone();
        value.file_id = input.file_id.clone();
        Ok(value)
    }

    async fn retrieve(&self, input: &EnrichmentInput, query: &str) -> Result<Vec<SimilarChunk>> {
        let model = input.embedding_model.as_deref().ok_or_else(|| {
            LibrarianError::validation(format!(
                "library '{}' has no embedding model",
                input.library_name
            ))
        })?;
        let vectors = self.embedder.embed(model, &[query.to_string()]).await?;
        let query_vector = vectors
            .into_iter()
            .next()
            .ok_or_else(|| LibrarianError::Embedding("no vector returned for query".into()))?;

        let hits = self
            .index
            .search(
                &query_vector,
                &ChunkScope::File(input.file_id.clone()),
                self.config.similar_chunks,
            )
            .await?;
        debug!(hits = hits.len(), "similar chunks retrieved");

        Ok(hits
            .into_iter()
            .map(|(chunk, distance)| SimilarChunk {
                id: chunk.id,
                file_id: chunk.file_id,
                file_name: input.file_name.clone(),
                text: chunk.text,
                distance,
            })
            .collect())
    }

    async fn finish_completed(
        &self,
        task: &EnrichmentTask,
        output: EnrichmentOutput,
        value: CachedValue,
    ) -> Result<EnrichmentStatus> {
        let applied = self
            .storage
            .complete_enrichment_task(&task.id, EnrichmentStatus::Completed, None, &output)
            .await?;
        if !applied {
            info!("enrichment task no longer processing; result discarded");
            return self.current_status(&task.id).await;
        }
        self.storage.upsert_cached_value(&value).await?;
        info!(issues = output.issues.len(), "enrichment task completed");
        Ok(EnrichmentStatus::Completed)
    }

    async fn finish_failed(
        &self,
        task: &EnrichmentTask,
        mut output: EnrichmentOutput,
        failure: Failure,
    ) -> Result<EnrichmentStatus> {
        output.issues.extend(failure.issue);
        let applied = self
            .storage
            .complete_enrichment_task(
                &task.id,
                EnrichmentStatus::Failed,
                Some(&failure.message),
                &output,
            )
            .await?;
        if !applied {
            info!("enrichment task no longer processing; failure discarded");
            return self.current_status(&task.id).await;
        }

        // Only a pair without any cached row gets the error recorded.
        self.storage
            .insert_cached_error(&task.field_id, &task.file_id, &failure.message)
            .await?;
        warn!(error = %failure.message, "enrichment task failed");
        Ok(EnrichmentStatus::Failed)
    }

    async fn current_status(&self, task_id: &str) -> Result<EnrichmentStatus> {
        Ok(self.get_task(task_id).await?.status)
    }

    async fn has_value(&self, field_id: &str, file_id: &str) -> Result<bool> {
        Ok(self
            .storage
            .get_cached_value(field_id, file_id)
            .await?
            .is_some_and(|c| {
                c.error_message.is_none()
                    && (c.value_string.is_some()
                        || c.value_number.is_some()
                        || c.value_boolean.is_some()
                        || c.value_date.is_some())
            }))
    }

    async fn require_list(&self, list_id: &str) -> Result<()> {
        self.storage
            .get_list(list_id)
            .await?
            .map(|_| ())
            .ok_or_else(|| LibrarianError::not_found("list", list_id))
    }

    async fn require_field(&self, list_id: &str, field_id: &str) -> Result<ListField> {
        let field = self
            .storage
            .get_list_field(field_id)
            .await?
            .ok_or_else(|| LibrarianError::not_found("list field", field_id))?;
        if field.list_id != list_id {
            return Err(LibrarianError::validation(format!(
                "field '{}' does not belong to list {list_id}",
                field.name
            )));
        }
        Ok(field)
    }
}

fn validate_computed_field(field: &ListField) -> Result<()> {
    if field.source_type != FieldSourceType::LlmComputed {
        return Err(LibrarianError::validation(format!(
            "field '{}' is not computed by a language model",
            field.name
        )));
    }
    if field.prompt.as_deref().is_none_or(|p| p.trim().is_empty()) {
        return Err(LibrarianError::validation(format!(
            "field '{}' has no prompt",
            field.name
        )));
    }
    if field
        .language_model
        .as_deref()
        .is_none_or(|m| m.trim().is_empty())
    {
        return Err(LibrarianError::validation(format!(
            "field '{}' has no language model",
            field.name
        )));
    }
    Ok(())
}

/// Substitute `{{name}}` placeholders, matching names case-insensitively.
/// Unknown names are left in place.
pub fn render_template(template: &str, values: &HashMap<String, String>) -> String {
    static PLACEHOLDER_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"\{\{\s*([^{}]+?)\s*\}\}").expect("valid regex"));

    PLACEHOLDER_RE
        .replace_all(template, |caps: &regex::Captures| {
            values
                .get(&caps[1].to_lowercase())
                .cloned()
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

fn find_failure_term(answer: &str, terms: Option<&str>) -> Option<String> {
    let answer = answer.to_lowercase();
    terms?
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .find(|t| answer.contains(&t.to_lowercase()))
        .map(str::to_string)
}

/// Parse a model answer into a cache value of the given type.
pub fn parse_value(field_type: FieldType, answer: &str) -> std::result::Result<CachedValue, String> {
    static NUMBER_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"-?\d+(?:\.\d+)?(?:[eE][-+]?\d+)?").expect("valid regex"));
    static DATE_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"\d{4}-\d{2}-\d{2}").expect("valid regex"));

    let answer = answer.trim();
    let mut value = CachedValue::default();
    match field_type {
        FieldType::String | FieldType::Text | FieldType::Markdown => {
            value.value_string = Some(answer.to_string());
        }
        FieldType::Number => {
            let parsed = answer.parse::<f64>().ok().or_else(|| {
                NUMBER_RE
                    .find(&answer.replace(',', ""))
                    .and_then(|m| m.as_str().parse::<f64>().ok())
            });
            value.value_number =
                Some(parsed.ok_or_else(|| format!("no number in answer '{}'", truncate_chars(answer, 80)))?);
        }
        FieldType::Boolean => {
            let normalized = answer
                .trim_end_matches(['.', '!'])
                .trim()
                .to_lowercase();
            value.value_boolean = Some(match normalized.as_str() {
                "true" | "yes" => true,
                "false" | "no" => false,
                _ => {
                    return Err(format!(
                        "expected yes/no answer, got '{}'",
                        truncate_chars(answer, 80)
                    ));
                }
            });
        }
        FieldType::Date | FieldType::Datetime => {
            let parsed = DateTime::parse_from_rfc3339(answer)
                .map(|d| d.with_timezone(&Utc))
                .ok()
                .or_else(|| {
                    let found = DATE_RE.find(answer)?;
                    let date = NaiveDate::parse_from_str(found.as_str(), "%Y-%m-%d").ok()?;
                    Some(date.and_hms_opt(0, 0, 0)?.and_utc())
                });
            value.value_date =
                Some(parsed.ok_or_else(|| format!("no date in answer '{}'", truncate_chars(answer, 80)))?);
        }
    }
    Ok(value)
}

fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => format!("{}…", &text[..idx]),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::StoredChunkIndex;
    use crate::testing::{FixedEmbedder, ScriptedModel, seed_file, test_storage};
    use librarian_shared::{FileProperty, List, TextChunk};
    use librarian_storage::NewListField;

    struct Fixture {
        storage: Arc<Storage>,
        file: LibraryFile,
        list: List,
    }

    async fn fixture() -> Fixture {
        let storage = Arc::new(test_storage().await);
        let file = seed_file(&storage, Some("embed-small")).await;
        let list = storage
            .insert_list("Docs overview", &[file.library_id.clone()])
            .await
            .expect("list");
        Fixture {
            storage,
            file,
            list,
        }
    }

    impl Fixture {
        async fn field(&self, name: &str, field_type: FieldType, configure: impl FnOnce(&mut NewListField)) -> ListField {
            let mut field = NewListField {
                list_id: self.list.id.clone(),
                name: name.to_string(),
                field_type,
                source_type: FieldSourceType::LlmComputed,
                file_property: None,
                prompt: Some(format!("What is the {name}?")),
                content_query: None,
                language_model: Some("small-model".into()),
                use_vector_store: false,
                failure_terms: None,
                context_field_ids: Vec::new(),
            };
            configure(&mut field);
            self.storage.insert_list_field(&field).await.expect("field")
        }

        fn engine(&self, model: Arc<ScriptedModel>, config: EnrichmentConfig) -> EnrichmentEngine {
            EnrichmentEngine::new(
                Arc::clone(&self.storage),
                model,
                Arc::new(FixedEmbedder::default()),
                Arc::new(StoredChunkIndex::new(Arc::clone(&self.storage))),
                config,
            )
        }

        fn request(&self, field: &ListField) -> EnqueueRequest {
            EnqueueRequest {
                list_id: self.list.id.clone(),
                field_id: field.id.clone(),
                ..EnqueueRequest::default()
            }
        }

        async fn claim(&self) -> EnrichmentTask {
            self.storage
                .claim_enrichment_tasks(1)
                .await
                .expect("claim")
                .pop()
                .expect("pending task")
        }

        async fn cached(&self, field: &ListField) -> Option<CachedValue> {
            self.storage
                .get_cached_value(&field.id, &self.file.id)
                .await
                .expect("cache")
        }
    }

    #[test]
    fn templates_are_case_insensitive() {
        let values = HashMap::from([("author".to_string(), "Ada".to_string())]);
        assert_eq!(
            render_template("Books by {{Author}} and {{ AUTHOR }}; {{other}}", &values),
            "Books by Ada and Ada; {{other}}"
        );
    }

    #[test]
    fn value_parsing() {
        assert_eq!(parse_value(FieldType::Number, "42").expect("n").value_number, Some(42.0));
        assert_eq!(
            parse_value(FieldType::Number, "About 1,250.5 pages").expect("n").value_number,
            Some(1250.5)
        );
        assert!(parse_value(FieldType::Number, "unknown").is_err());
        assert_eq!(parse_value(FieldType::Boolean, "Yes.").expect("b").value_boolean, Some(true));
        assert_eq!(parse_value(FieldType::Boolean, "false").expect("b").value_boolean, Some(false));
        assert!(parse_value(FieldType::Boolean, "maybe").is_err());
        let date = parse_value(FieldType::Date, "Published 2024-05-17.").expect("d");
        assert_eq!(
            date.value_date.map(|d| d.to_rfc3339()),
            Some("2024-05-17T00:00:00+00:00".to_string())
        );
        assert_eq!(
            parse_value(FieldType::Markdown, "  **bold**  ").expect("s").value_string.as_deref(),
            Some("**bold**")
        );
    }

    #[tokio::test]
    async fn enqueue_validates_field() {
        let fx = fixture().await;
        let model = Arc::new(ScriptedModel::replying("x"));
        let engine = fx.engine(model, EnrichmentConfig::default());

        let projected = fx
            .field("Name", FieldType::String, |f| {
                f.source_type = FieldSourceType::FileProperty;
                f.file_property = Some(FileProperty::Name);
            })
            .await;
        let err = engine.enqueue(&fx.request(&projected)).await.err().expect("projected");
        assert!(matches!(err, LibrarianError::Validation { .. }));

        let no_prompt = fx.field("Blank", FieldType::String, |f| f.prompt = None).await;
        assert!(engine.enqueue(&fx.request(&no_prompt)).await.is_err());

        let other = fx.storage.insert_list("Other", &[]).await.expect("list");
        let field = fx.field("Summary", FieldType::Text, |_| {}).await;
        let mut request = fx.request(&field);
        request.list_id = other.id;
        assert!(engine.enqueue(&request).await.is_err());
    }

    #[tokio::test]
    async fn vector_store_requires_embedding_model() {
        let storage = Arc::new(test_storage().await);
        let file = seed_file(&storage, None).await;
        let list = storage
            .insert_list("No vectors", &[file.library_id.clone()])
            .await
            .expect("list");
        let fx = Fixture { storage, file, list };
        let field = fx
            .field("Topic", FieldType::String, |f| f.use_vector_store = true)
            .await;
        let engine = fx.engine(Arc::new(ScriptedModel::replying("x")), EnrichmentConfig::default());
        let err = engine.enqueue(&fx.request(&field)).await.err().expect("no model");
        assert!(err.to_string().contains("embedding model"));
    }

    #[tokio::test]
    async fn only_missing_enqueue_is_idempotent() {
        let fx = fixture().await;
        let field = fx.field("Summary", FieldType::Text, |_| {}).await;
        let engine = fx.engine(Arc::new(ScriptedModel::replying("x")), EnrichmentConfig::default());
        let request = EnqueueRequest {
            only_missing: true,
            ..fx.request(&field)
        };

        let first = engine.enqueue(&request).await.expect("first");
        assert_eq!(first, EnqueueResult { created: 1, cleaned_up: 0 });
        let second = engine.enqueue(&request).await.expect("second");
        assert_eq!(second, EnqueueResult { created: 1, cleaned_up: 1 });

        fx.storage
            .upsert_cached_value(&CachedValue {
                field_id: field.id.clone(),
                file_id: fx.file.id.clone(),
                value_string: Some("done".into()),
                ..CachedValue::default()
            })
            .await
            .expect("cache");
        let third = engine.enqueue(&request).await.expect("third");
        assert_eq!(third.created, 0);
    }

    #[tokio::test]
    async fn missing_context_is_reported_but_task_completes() {
        let fx = fixture().await;
        let author = fx.field("Author", FieldType::String, |_| {}).await;
        let bio = fx
            .field("Bio", FieldType::Text, |f| {
                f.prompt = Some("Write a bio of {{author}}.".into());
                f.context_field_ids = vec![author.id.clone()];
            })
            .await;
        let model = Arc::new(ScriptedModel::replying("A short bio."));
        let engine = fx.engine(Arc::clone(&model), EnrichmentConfig::default());

        engine.enqueue(&fx.request(&bio)).await.expect("enqueue");
        let status = engine.run_task(fx.claim().await).await.expect("run");
        assert_eq!(status, EnrichmentStatus::Completed);

        let page = engine
            .list_tasks(
                &EnrichmentTaskFilter {
                    field_id: Some(bio.id.clone()),
                    ..EnrichmentTaskFilter::default()
                },
                PageRequest::default(),
            )
            .await
            .expect("tasks");
        let task = &page.items[0];
        let output = task.output.as_ref().expect("output");
        assert!(output.issues.contains(&"missingContext: Author".to_string()));
        let input = task.input.as_ref().expect("input");
        assert_eq!(input.context_fields.len(), 1);
        assert!(input.context_fields[0].error_message.is_some());

        // The unresolved placeholder is blanked, and only the prompt is sent.
        let calls = model.calls();
        assert_eq!(calls[0].len(), 1);
        assert_eq!(calls[0][0].content, "Write a bio of .");

        let cached = fx.cached(&bio).await.expect("cached");
        assert_eq!(cached.value_string.as_deref(), Some("A short bio."));
    }

    #[tokio::test]
    async fn failing_recompute_keeps_previous_value() {
        let fx = fixture().await;
        let field = fx.field("Summary", FieldType::Text, |_| {}).await;
        let previous = CachedValue {
            field_id: field.id.clone(),
            file_id: fx.file.id.clone(),
            value_string: Some("good value".into()),
            ..CachedValue::default()
        };
        fx.storage.upsert_cached_value(&previous).await.expect("cache");
        let before = fx.cached(&field).await;

        let engine = fx.engine(
            Arc::new(ScriptedModel::failing("rate limited")),
            EnrichmentConfig::default(),
        );
        engine.enqueue(&fx.request(&field)).await.expect("enqueue");
        let task = fx.claim().await;
        let status = engine.run_task(task.clone()).await.expect("run");
        assert_eq!(status, EnrichmentStatus::Failed);

        assert_eq!(fx.cached(&field).await, before);
        let stored = engine.get_task(&task.id).await.expect("task");
        assert!(stored.error_message.expect("error").contains("rate limited"));
    }

    #[tokio::test]
    async fn failure_does_not_clobber_value_written_meanwhile() {
        let fx = fixture().await;
        let field = fx.field("Summary", FieldType::Text, |_| {}).await;
        let engine = fx.engine(
            Arc::new(ScriptedModel::failing("rate limited").delayed(200)),
            EnrichmentConfig::default(),
        );
        engine.enqueue(&fx.request(&field)).await.expect("enqueue");
        let task = fx.claim().await;

        let fresh = CachedValue {
            field_id: field.id.clone(),
            file_id: fx.file.id.clone(),
            value_string: Some("written by another task".into()),
            ..CachedValue::default()
        };
        let (status, ()) = tokio::join!(engine.run_task(task), async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            fx.storage.upsert_cached_value(&fresh).await.expect("cache");
        });
        assert_eq!(status.expect("run"), EnrichmentStatus::Failed);

        let cached = fx.cached(&field).await.expect("cached");
        assert_eq!(cached.value_string.as_deref(), Some("written by another task"));
        assert!(cached.error_message.is_none());
    }

    #[tokio::test]
    async fn failure_term_fails_task() {
        let fx = fixture().await;
        let field = fx
            .field("Owner", FieldType::String, |f| {
                f.failure_terms = Some("unknown, not found".into());
            })
            .await;
        let engine = fx.engine(
            Arc::new(ScriptedModel::replying("The owner is Unknown.")),
            EnrichmentConfig::default(),
        );
        engine.enqueue(&fx.request(&field)).await.expect("enqueue");
        let task = fx.claim().await;
        assert_eq!(engine.run_task(task.clone()).await.expect("run"), EnrichmentStatus::Failed);

        let stored = engine.get_task(&task.id).await.expect("task");
        let output = stored.output.expect("output");
        assert_eq!(output.issues, vec!["failureTerm: unknown".to_string()]);
        let cached = fx.cached(&field).await.expect("error row");
        assert!(cached.value_string.is_none());
        assert!(cached.error_message.is_some());
    }

    #[tokio::test]
    async fn unparseable_answer_is_a_parse_issue() {
        let fx = fixture().await;
        let field = fx.field("Pages", FieldType::Number, |_| {}).await;
        let engine = fx.engine(
            Arc::new(ScriptedModel::replying("several")),
            EnrichmentConfig::default(),
        );
        engine.enqueue(&fx.request(&field)).await.expect("enqueue");
        let task = fx.claim().await;
        assert_eq!(engine.run_task(task.clone()).await.expect("run"), EnrichmentStatus::Failed);
        let output = engine.get_task(&task.id).await.expect("task").output.expect("output");
        assert!(output.issues[0].starts_with("parse: "));
    }

    #[tokio::test]
    async fn slow_model_times_out() {
        let fx = fixture().await;
        let field = fx.field("Summary", FieldType::Text, |_| {}).await;
        let config = EnrichmentConfig {
            llm_timeout_ms: 50,
            ..EnrichmentConfig::default()
        };
        let engine = fx.engine(Arc::new(ScriptedModel::replying("late").delayed(500)), config);
        engine.enqueue(&fx.request(&field)).await.expect("enqueue");
        let task = fx.claim().await;
        assert_eq!(engine.run_task(task.clone()).await.expect("run"), EnrichmentStatus::Failed);
        let output = engine.get_task(&task.id).await.expect("task").output.expect("output");
        assert!(output.issues.contains(&"timeout".to_string()));
    }

    #[tokio::test]
    async fn retrieval_context_and_prompt_order() {
        let fx = fixture().await;
        let task = fx
            .storage
            .insert_processing_task(&fx.file.id, &fx.file.library_id, &Default::default(), 60_000)
            .await
            .expect("processing task");
        let chunks = vec![
            (
                TextChunk { index: 0, section: None, text: "alpha alpha".into() },
                vec![2.0, 0.0, 1.0],
            ),
            (
                TextChunk { index: 1, section: None, text: "beta only".into() },
                vec![0.0, 1.0, 1.0],
            ),
        ];
        fx.storage
            .replace_file_chunks(&fx.file.id, &fx.file.library_id, &task.id, &chunks)
            .await
            .expect("chunks");

        let title = fx.field("Title", FieldType::String, |_| {}).await;
        fx.storage
            .upsert_cached_value(&CachedValue {
                field_id: title.id.clone(),
                file_id: fx.file.id.clone(),
                value_string: Some("Alpha Guide".into()),
                ..CachedValue::default()
            })
            .await
            .expect("cache");
        let topic = fx
            .field("Topic", FieldType::String, |f| {
                f.use_vector_store = true;
                f.content_query = Some("alpha in {{title}}".into());
                f.context_field_ids = vec![title.id.clone()];
            })
            .await;

        let model = Arc::new(ScriptedModel::replying("Greek letters"));
        let config = EnrichmentConfig {
            similar_chunks: 1,
            ..EnrichmentConfig::default()
        };
        let engine = fx.engine(Arc::clone(&model), config);
        engine.enqueue(&fx.request(&topic)).await.expect("enqueue");
        let claimed = fx.claim().await;
        assert_eq!(engine.run_task(claimed.clone()).await.expect("run"), EnrichmentStatus::Completed);

        let messages = &model.calls()[0];
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].content, "Title: Alpha Guide");
        assert!(messages[1].content.contains("alpha alpha"));
        assert_eq!(messages[2].content, "What is the Topic?");

        let output = engine.get_task(&claimed.id).await.expect("task").output.expect("output");
        assert_eq!(output.similar_chunks.len(), 1);
        assert_eq!(output.similar_chunks[0].file_name, "notes.txt");
        assert_eq!(output.model_instance.as_deref(), Some("small-model-instance"));
    }

    #[tokio::test]
    async fn late_result_of_cancelled_task_is_discarded() {
        let fx = fixture().await;
        let field = fx.field("Summary", FieldType::Text, |_| {}).await;
        let engine = fx.engine(Arc::new(ScriptedModel::replying("fresh")), EnrichmentConfig::default());
        engine.enqueue(&fx.request(&field)).await.expect("enqueue");
        let task = fx.claim().await;

        fx.storage
            .complete_enrichment_task(
                &task.id,
                EnrichmentStatus::Canceled,
                None,
                &EnrichmentOutput::default(),
            )
            .await
            .expect("cancel");

        assert_eq!(engine.run_task(task).await.expect("run"), EnrichmentStatus::Canceled);
        assert!(fx.cached(&field).await.is_none());
    }

    #[tokio::test]
    async fn clear_and_retry() {
        let fx = fixture().await;
        let field = fx.field("Summary", FieldType::Text, |_| {}).await;
        let engine = fx.engine(Arc::new(ScriptedModel::failing("boom")), EnrichmentConfig::default());
        engine
            .enqueue(&EnqueueRequest {
                priority: 7,
                ..fx.request(&field)
            })
            .await
            .expect("enqueue");
        engine.run_task(fx.claim().await).await.expect("run");

        assert_eq!(engine.retry_failed(None).await.expect("retry"), 1);
        let retried = fx.claim().await;
        assert_eq!(retried.priority, 7);
        engine.run_task(retried).await.expect("run");

        let cleared = engine.clear(&fx.list.id, Some(&field.id), None).await.expect("clear");
        assert_eq!(cleared.dequeued, 0);
        assert_eq!(cleared.cleared_values, 1);
        assert!(fx.cached(&field).await.is_none());

        let counts = engine.status_counts(&fx.list.id, None).await.expect("counts");
        let failed = counts
            .iter()
            .find(|(s, _)| *s == EnrichmentStatus::Failed)
            .map(|(_, n)| *n);
        assert_eq!(failed, Some(2));
    }
}
