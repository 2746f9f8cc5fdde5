//! List field values and the filters evaluated over them.
//!
//! A field's value for a file is either projected from the file itself
//! (`file_property` fields) or read from the list item cache
//! (`llm_computed` fields).

use std::collections::HashMap;
use std::sync::Arc;

use librarian_shared::{
    FieldSourceType, FileProperty, FilterOperator, LibrarianError, LibraryFile, ListField,
    ListFilter, Result,
};
use librarian_storage::Storage;

/// Value of one field for one file, rendered as text.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldValue {
    pub value: Option<String>,
    /// Error recorded by the last failed computation, if any.
    pub error_message: Option<String>,
}

/// Resolves field values, caching library names and crawler URIs.
pub struct FieldValueResolver {
    storage: Arc<Storage>,
    library_names: HashMap<String, String>,
    crawler_uris: HashMap<String, Option<String>>,
}

impl FieldValueResolver {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self {
            storage,
            library_names: HashMap::new(),
            crawler_uris: HashMap::new(),
        }
    }

    pub async fn resolve(&mut self, field: &ListField, file: &LibraryFile) -> Result<FieldValue> {
        match field.source_type {
            FieldSourceType::FileProperty => {
                let property = field.file_property.ok_or_else(|| {
                    LibrarianError::validation(format!(
                        "field '{}' has no file property",
                        field.name
                    ))
                })?;
                Ok(FieldValue {
                    value: self.project(property, file).await?,
                    error_message: None,
                })
            }
            FieldSourceType::LlmComputed => {
                let cached = self.storage.get_cached_value(&field.id, &file.id).await?;
                Ok(cached
                    .map(|c| FieldValue {
                        value: c.display_value(field.field_type),
                        error_message: c.error_message,
                    })
                    .unwrap_or_default())
            }
        }
    }

    async fn project(&mut self, property: FileProperty, file: &LibraryFile) -> Result<Option<String>> {
        Ok(match property {
            FileProperty::Name => Some(file.name.clone()),
            FileProperty::OriginUri => file.origin_uri.clone(),
            FileProperty::MimeType => Some(file.mime_type.clone()),
            FileProperty::Size => Some(file.size.to_string()),
            FileProperty::Source => Some(self.library_name(&file.library_id).await?),
            FileProperty::CrawlerUri => match &file.crawler_id {
                Some(id) => self.crawler_uri(id).await?,
                None => None,
            },
        })
    }

    async fn library_name(&mut self, library_id: &str) -> Result<String> {
        if let Some(name) = self.library_names.get(library_id) {
            return Ok(name.clone());
        }
        let name = self
            .storage
            .get_library(library_id)
            .await?
            .map(|l| l.name)
            .unwrap_or_default();
        self.library_names.insert(library_id.to_string(), name.clone());
        Ok(name)
    }

    async fn crawler_uri(&mut self, crawler_id: &str) -> Result<Option<String>> {
        if let Some(uri) = self.crawler_uris.get(crawler_id) {
            return Ok(uri.clone());
        }
        let uri = self.storage.get_crawler(crawler_id).await?.map(|c| c.uri);
        self.crawler_uris.insert(crawler_id.to_string(), uri.clone());
        Ok(uri)
    }
}

/// Reject filters over unknown fields or missing comparison values.
pub fn validate_filters(fields: &[ListField], filters: &[ListFilter]) -> Result<()> {
    for filter in filters {
        if !fields.iter().any(|f| f.id == filter.field_id) {
            return Err(LibrarianError::validation(format!(
                "filter field '{}' is not part of the list",
                filter.field_id
            )));
        }
        let needs_value = matches!(filter.operator, FilterOperator::Equals | FilterOperator::Contains);
        if needs_value && filter.value.is_none() {
            return Err(LibrarianError::validation(format!(
                "'{}' filter needs a value",
                filter.operator
            )));
        }
    }
    Ok(())
}

/// Whether `value` satisfies one filter condition.
pub fn matches(operator: FilterOperator, value: Option<&str>, expected: Option<&str>) -> bool {
    let value = value.map(str::trim).filter(|v| !v.is_empty());
    match operator {
        FilterOperator::IsEmpty => value.is_none(),
        FilterOperator::IsNotEmpty => value.is_some(),
        FilterOperator::Equals => value == expected.map(str::trim),
        FilterOperator::Contains => match (value, expected) {
            (Some(v), Some(e)) => v.to_lowercase().contains(&e.to_lowercase()),
            _ => false,
        },
    }
}

/// Files satisfying every filter.
pub async fn apply_filters(
    resolver: &mut FieldValueResolver,
    fields: &[ListField],
    filters: &[ListFilter],
    files: Vec<LibraryFile>,
) -> Result<Vec<LibraryFile>> {
    if filters.is_empty() {
        return Ok(files);
    }
    validate_filters(fields, filters)?;

    let mut kept = Vec::with_capacity(files.len());
    'files: for file in files {
        for filter in filters {
            let Some(field) = fields.iter().find(|f| f.id == filter.field_id) else {
                continue 'files;
            };
            let value = resolver.resolve(field, &file).await?;
            if !matches(filter.operator, value.value.as_deref(), filter.value.as_deref()) {
                continue 'files;
            }
        }
        kept.push(file);
    }
    Ok(kept)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::test_storage;
    use librarian_shared::{CachedValue, FieldType};
    use librarian_storage::{NewFile, NewListField};

    #[test]
    fn operators() {
        assert!(matches(FilterOperator::IsEmpty, None, None));
        assert!(matches(FilterOperator::IsEmpty, Some("  "), None));
        assert!(matches(FilterOperator::IsNotEmpty, Some("x"), None));
        assert!(matches(FilterOperator::Equals, Some("Yes"), Some("Yes")));
        assert!(!matches(FilterOperator::Equals, Some("Yes"), Some("yes")));
        assert!(matches(FilterOperator::Contains, Some("Annual Report"), Some("report")));
        assert!(!matches(FilterOperator::Contains, None, Some("report")));
    }

    fn field(list_id: &str, name: &str, source_type: FieldSourceType) -> NewListField {
        NewListField {
            list_id: list_id.to_string(),
            name: name.to_string(),
            field_type: FieldType::String,
            source_type,
            file_property: None,
            prompt: None,
            content_query: None,
            language_model: None,
            use_vector_store: false,
            failure_terms: None,
            context_field_ids: Vec::new(),
        }
    }

    #[tokio::test]
    async fn filters_over_projected_and_cached_values() {
        let storage = Arc::new(test_storage().await);
        let library = storage.insert_library("Reports", None).await.expect("library");
        let mut files = Vec::new();
        for name in ["q1.txt", "q2.csv"] {
            files.push(
                storage
                    .insert_file(&NewFile {
                        library_id: library.id.clone(),
                        name: name.into(),
                        mime_type: if name.ends_with(".csv") { "text/csv" } else { "text/plain" }.into(),
                        content: b"x".to_vec(),
                        origin_uri: None,
                        origin_modified_at: None,
                        crawler_id: None,
                        content_hash: None,
                    })
                    .await
                    .expect("file"),
            );
        }
        let list = storage
            .insert_list("Overview", &[library.id.clone()])
            .await
            .expect("list");

        let mut mime = field(&list.id, "Type", FieldSourceType::FileProperty);
        mime.file_property = Some(FileProperty::MimeType);
        let mime = storage.insert_list_field(&mime).await.expect("field");
        let summary = storage
            .insert_list_field(&field(&list.id, "Summary", FieldSourceType::LlmComputed))
            .await
            .expect("field");
        storage
            .upsert_cached_value(&CachedValue {
                field_id: summary.id.clone(),
                file_id: files[0].id.clone(),
                value_string: Some("Quarterly numbers".into()),
                ..CachedValue::default()
            })
            .await
            .expect("cache");

        let fields = vec![mime.clone(), summary.clone()];
        let mut resolver = FieldValueResolver::new(Arc::clone(&storage));

        let csv_only = vec![ListFilter {
            field_id: mime.id.clone(),
            operator: FilterOperator::Equals,
            value: Some("text/csv".into()),
        }];
        let kept = apply_filters(&mut resolver, &fields, &csv_only, files.clone())
            .await
            .expect("filter");
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].name, "q2.csv");

        let missing_summary = vec![ListFilter {
            field_id: summary.id.clone(),
            operator: FilterOperator::IsEmpty,
            value: None,
        }];
        let kept = apply_filters(&mut resolver, &fields, &missing_summary, files.clone())
            .await
            .expect("filter");
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].id, files[1].id);

        let source = resolver.resolve(&mime, &files[0]).await.expect("value");
        assert_eq!(source.value.as_deref(), Some("text/plain"));
    }

    #[test]
    fn unknown_filter_field_is_rejected() {
        let filters = vec![ListFilter {
            field_id: "nope".into(),
            operator: FilterOperator::IsEmpty,
            value: None,
        }];
        assert!(validate_filters(&[], &filters).is_err());
    }
}
