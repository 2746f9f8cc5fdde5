//! Lists, list fields and the list item cache.

use chrono::Utc;
use libsql::params;

use librarian_shared::{
    CachedValue, FieldSourceType, FieldType, FileProperty, LibraryFile, List, ListField, Result,
    new_id,
};

use crate::Storage;
use crate::files::{FILE_COLUMNS, row_to_file};
use crate::rows::{
    col_bool, col_i64, col_opt_bool, col_opt_f64, col_opt_string, col_opt_ts, col_parse,
    col_string, col_ts, collect, db_err, first, opt_ts, ts,
};

/// Fields for a new list column; id, order and timestamp are assigned on insert.
#[derive(Debug, Clone)]
pub struct NewListField {
    pub list_id: String,
    pub name: String,
    pub field_type: FieldType,
    pub source_type: FieldSourceType,
    pub file_property: Option<FileProperty>,
    pub prompt: Option<String>,
    pub content_query: Option<String>,
    pub language_model: Option<String>,
    pub use_vector_store: bool,
    pub failure_terms: Option<String>,
    pub context_field_ids: Vec<String>,
}

const FIELD_COLUMNS: &str = "id, list_id, name, field_order, field_type, source_type, file_property,
     prompt, content_query, language_model, use_vector_store, failure_terms, created_at";

const CACHE_COLUMNS: &str = "field_id, file_id, value_string, value_number, value_boolean,
     value_date, error_message, updated_at";

impl Storage {
    // -----------------------------------------------------------------------
    // Lists
    // -----------------------------------------------------------------------

    /// Create a list over the given source libraries.
    pub async fn insert_list(&self, name: &str, library_ids: &[String]) -> Result<List> {
        let now = Utc::now();
        let list = List {
            id: new_id(),
            name: name.to_string(),
            library_ids: library_ids.to_vec(),
            created_at: now,
        };

        self.conn
            .execute(
                "INSERT INTO lists (id, name, created_at) VALUES (?1, ?2, ?3)",
                params![list.id.as_str(), list.name.as_str(), ts(&now)],
            )
            .await
            .map_err(db_err)?;

        for library_id in library_ids {
            self.conn
                .execute(
                    "INSERT OR IGNORE INTO list_sources (list_id, library_id) VALUES (?1, ?2)",
                    params![list.id.as_str(), library_id.as_str()],
                )
                .await
                .map_err(db_err)?;
        }
        Ok(list)
    }

    pub async fn get_list(&self, id: &str) -> Result<Option<List>> {
        let rows = self
            .conn
            .query(
                "SELECT id, name, created_at FROM lists WHERE id = ?1",
                params![id],
            )
            .await
            .map_err(db_err)?;
        let Some((id, name, created_at)) = first(rows, |row| {
            Ok((col_string(row, 0)?, col_string(row, 1)?, col_ts(row, 2)?))
        })
        .await?
        else {
            return Ok(None);
        };

        let rows = self
            .conn
            .query(
                "SELECT library_id FROM list_sources WHERE list_id = ?1 ORDER BY library_id",
                params![id.as_str()],
            )
            .await
            .map_err(db_err)?;
        let library_ids = collect(rows, |row| col_string(row, 0)).await?;

        Ok(Some(List {
            id,
            name,
            library_ids,
            created_at,
        }))
    }

    /// Live files of every source library of the list. These are the list's rows.
    pub async fn list_files_for_list(&self, list_id: &str) -> Result<Vec<LibraryFile>> {
        let rows = self
            .conn
            .query(
                &format!(
                    "SELECT {FILE_COLUMNS} FROM library_files
                     WHERE archived_at IS NULL
                       AND library_id IN (SELECT library_id FROM list_sources WHERE list_id = ?1)
                     ORDER BY created_at, id"
                ),
                params![list_id],
            )
            .await
            .map_err(db_err)?;
        collect(rows, row_to_file).await
    }

    // -----------------------------------------------------------------------
    // Fields
    // -----------------------------------------------------------------------

    /// Append a field to the end of the list.
    pub async fn insert_list_field(&self, field: &NewListField) -> Result<ListField> {
        let rows = self
            .conn
            .query(
                "SELECT COALESCE(MAX(field_order), -1) + 1 FROM list_fields WHERE list_id = ?1",
                params![field.list_id.as_str()],
            )
            .await
            .map_err(db_err)?;
        let order = first(rows, |row| col_i64(row, 0)).await?.unwrap_or(0);

        let now = Utc::now();
        let record = ListField {
            id: new_id(),
            list_id: field.list_id.clone(),
            name: field.name.clone(),
            order,
            field_type: field.field_type,
            source_type: field.source_type,
            file_property: field.file_property,
            prompt: field.prompt.clone(),
            content_query: field.content_query.clone(),
            language_model: field.language_model.clone(),
            use_vector_store: field.use_vector_store,
            failure_terms: field.failure_terms.clone(),
            context_field_ids: field.context_field_ids.clone(),
            created_at: now,
        };

        self.conn
            .execute(
                "INSERT INTO list_fields (id, list_id, name, field_order, field_type, source_type,
                    file_property, prompt, content_query, language_model, use_vector_store,
                    failure_terms, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    record.id.as_str(),
                    record.list_id.as_str(),
                    record.name.as_str(),
                    record.order,
                    record.field_type.as_str(),
                    record.source_type.as_str(),
                    record.file_property.map(|p| p.as_str()),
                    record.prompt.as_deref(),
                    record.content_query.as_deref(),
                    record.language_model.as_deref(),
                    i64::from(record.use_vector_store),
                    record.failure_terms.as_deref(),
                    ts(&now),
                ],
            )
            .await
            .map_err(db_err)?;

        for context_id in &record.context_field_ids {
            self.conn
                .execute(
                    "INSERT OR IGNORE INTO list_field_contexts (field_id, context_field_id)
                     VALUES (?1, ?2)",
                    params![record.id.as_str(), context_id.as_str()],
                )
                .await
                .map_err(db_err)?;
        }
        Ok(record)
    }

    pub async fn get_list_field(&self, id: &str) -> Result<Option<ListField>> {
        let rows = self
            .conn
            .query(
                &format!("SELECT {FIELD_COLUMNS} FROM list_fields WHERE id = ?1"),
                params![id],
            )
            .await
            .map_err(db_err)?;
        match first(rows, row_to_field).await? {
            Some(mut field) => {
                field.context_field_ids = self.context_field_ids(&field.id).await?;
                Ok(Some(field))
            }
            None => Ok(None),
        }
    }

    /// Fields of a list in display order.
    pub async fn list_fields(&self, list_id: &str) -> Result<Vec<ListField>> {
        let rows = self
            .conn
            .query(
                &format!(
                    "SELECT {FIELD_COLUMNS} FROM list_fields WHERE list_id = ?1
                     ORDER BY field_order"
                ),
                params![list_id],
            )
            .await
            .map_err(db_err)?;
        let mut fields = collect(rows, row_to_field).await?;
        for field in &mut fields {
            field.context_field_ids = self.context_field_ids(&field.id).await?;
        }
        Ok(fields)
    }

    async fn context_field_ids(&self, field_id: &str) -> Result<Vec<String>> {
        let rows = self
            .conn
            .query(
                "SELECT context_field_id FROM list_field_contexts
                 WHERE field_id = ?1 ORDER BY rowid",
                params![field_id],
            )
            .await
            .map_err(db_err)?;
        collect(rows, |row| col_string(row, 0)).await
    }

    // -----------------------------------------------------------------------
    // Item cache
    // -----------------------------------------------------------------------

    pub async fn get_cached_value(&self, field_id: &str, file_id: &str) -> Result<Option<CachedValue>> {
        let rows = self
            .conn
            .query(
                &format!(
                    "SELECT {CACHE_COLUMNS} FROM list_item_cache
                     WHERE field_id = ?1 AND file_id = ?2"
                ),
                params![field_id, file_id],
            )
            .await
            .map_err(db_err)?;
        first(rows, row_to_cached).await
    }

    /// Last-write-wins upsert of one (field, file) value.
    pub async fn upsert_cached_value(&self, value: &CachedValue) -> Result<()> {
        let updated_at = value.updated_at.unwrap_or_else(Utc::now);
        self.conn
            .execute(
                "INSERT INTO list_item_cache (field_id, file_id, value_string, value_number,
                    value_boolean, value_date, error_message, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(field_id, file_id) DO UPDATE SET
                   value_string = excluded.value_string,
                   value_number = excluded.value_number,
                   value_boolean = excluded.value_boolean,
                   value_date = excluded.value_date,
                   error_message = excluded.error_message,
                   updated_at = excluded.updated_at",
                params![
                    value.field_id.as_str(),
                    value.file_id.as_str(),
                    value.value_string.as_deref(),
                    value.value_number,
                    value.value_boolean.map(i64::from),
                    opt_ts(value.value_date.as_ref()),
                    value.error_message.as_deref(),
                    ts(&updated_at),
                ],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// Record a failure for a (field, file) pair that has no cached value
    /// yet. An existing row, possibly a good value written concurrently, is
    /// left untouched. Returns whether the error row was written.
    pub async fn insert_cached_error(&self, field_id: &str, file_id: &str, message: &str) -> Result<bool> {
        let inserted = self
            .conn
            .execute(
                "INSERT INTO list_item_cache (field_id, file_id, error_message, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(field_id, file_id) DO NOTHING",
                params![field_id, file_id, message, ts(&Utc::now())],
            )
            .await
            .map_err(db_err)?;
        Ok(inserted == 1)
    }

    /// Every cached value of a field.
    pub async fn cached_values_for_field(&self, field_id: &str) -> Result<Vec<CachedValue>> {
        let rows = self
            .conn
            .query(
                &format!("SELECT {CACHE_COLUMNS} FROM list_item_cache WHERE field_id = ?1"),
                params![field_id],
            )
            .await
            .map_err(db_err)?;
        collect(rows, row_to_cached).await
    }

    /// Delete cache rows of a list, optionally narrowed to one field and/or file.
    pub async fn delete_cached_values(
        &self,
        list_id: &str,
        field_id: Option<&str>,
        file_id: Option<&str>,
    ) -> Result<u64> {
        self.conn
            .execute(
                "DELETE FROM list_item_cache
                 WHERE field_id IN (SELECT id FROM list_fields WHERE list_id = ?1)
                   AND (?2 IS NULL OR field_id = ?2)
                   AND (?3 IS NULL OR file_id = ?3)",
                params![list_id, field_id, file_id],
            )
            .await
            .map_err(db_err)
    }
}

fn row_to_field(row: &libsql::Row) -> Result<ListField> {
    Ok(ListField {
        id: col_string(row, 0)?,
        list_id: col_string(row, 1)?,
        name: col_string(row, 2)?,
        order: col_i64(row, 3)?,
        field_type: col_parse(row, 4)?,
        source_type: col_parse(row, 5)?,
        file_property: col_opt_string(row, 6).map(|s| s.parse()).transpose()?,
        prompt: col_opt_string(row, 7),
        content_query: col_opt_string(row, 8),
        language_model: col_opt_string(row, 9),
        use_vector_store: col_bool(row, 10),
        failure_terms: col_opt_string(row, 11),
        context_field_ids: Vec::new(),
        created_at: col_ts(row, 12)?,
    })
}

fn row_to_cached(row: &libsql::Row) -> Result<CachedValue> {
    Ok(CachedValue {
        field_id: col_string(row, 0)?,
        file_id: col_string(row, 1)?,
        value_string: col_opt_string(row, 2),
        value_number: col_opt_f64(row, 3),
        value_boolean: col_opt_bool(row, 4),
        value_date: col_opt_ts(row, 5)?,
        error_message: col_opt_string(row, 6),
        updated_at: col_opt_ts(row, 7)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::NewFile;
    use crate::test_support::test_storage;

    fn llm_field(list_id: &str, name: &str, context: Vec<String>) -> NewListField {
        NewListField {
            list_id: list_id.to_string(),
            name: name.to_string(),
            field_type: FieldType::String,
            source_type: FieldSourceType::LlmComputed,
            file_property: None,
            prompt: Some("Summarize".to_string()),
            content_query: None,
            language_model: Some("model-a".to_string()),
            use_vector_store: false,
            failure_terms: None,
            context_field_ids: context,
        }
    }

    #[tokio::test]
    async fn fields_keep_order_and_context() {
        let storage = test_storage().await;
        let lib = storage.insert_library("Docs", None).await.expect("lib");
        let list = storage.insert_list("Contracts", &[lib.id.clone()]).await.expect("list");

        let a = storage.insert_list_field(&llm_field(&list.id, "A", vec![])).await.expect("a");
        let b = storage
            .insert_list_field(&llm_field(&list.id, "B", vec![a.id.clone()]))
            .await
            .expect("b");
        assert_eq!((a.order, b.order), (0, 1));

        let fields = storage.list_fields(&list.id).await.expect("fields");
        assert_eq!(fields.len(), 2);
        assert_eq!(fields[1].context_field_ids, vec![a.id.clone()]);

        let loaded = storage.get_list(&list.id).await.expect("get").expect("exists");
        assert_eq!(loaded.library_ids, vec![lib.id]);
    }

    #[tokio::test]
    async fn cache_is_last_write_wins() {
        let storage = test_storage().await;
        let lib = storage.insert_library("Docs", None).await.expect("lib");
        let list = storage.insert_list("L", &[lib.id.clone()]).await.expect("list");
        let field = storage.insert_list_field(&llm_field(&list.id, "A", vec![])).await.expect("f");
        let file = storage
            .insert_file(&NewFile {
                library_id: lib.id.clone(),
                name: "a.txt".into(),
                mime_type: "text/plain".into(),
                content: b"x".to_vec(),
                origin_uri: None,
                origin_modified_at: None,
                crawler_id: None,
                content_hash: None,
            })
            .await
            .expect("file");

        for text in ["first", "second"] {
            storage
                .upsert_cached_value(&CachedValue {
                    field_id: field.id.clone(),
                    file_id: file.id.clone(),
                    value_string: Some(text.to_string()),
                    ..CachedValue::default()
                })
                .await
                .expect("upsert");
        }

        let values = storage.cached_values_for_field(&field.id).await.expect("values");
        assert_eq!(values.len(), 1);
        assert_eq!(values[0].value_string.as_deref(), Some("second"));

        assert_eq!(storage.list_files_for_list(&list.id).await.expect("rows").len(), 1);
        assert_eq!(
            storage
                .delete_cached_values(&list.id, Some(&field.id), None)
                .await
                .expect("delete"),
            1
        );
        assert!(storage.get_cached_value(&field.id, &file.id).await.expect("get").is_none());
    }

    #[tokio::test]
    async fn error_row_never_replaces_a_value() {
        let storage = test_storage().await;
        let lib = storage.insert_library("Docs", None).await.expect("lib");
        let list = storage.insert_list("L", &[lib.id.clone()]).await.expect("list");
        let field = storage.insert_list_field(&llm_field(&list.id, "A", vec![])).await.expect("f");
        let mut files = Vec::new();
        for name in ["a.txt", "b.txt"] {
            let file = storage
                .insert_file(&NewFile {
                    library_id: lib.id.clone(),
                    name: name.into(),
                    mime_type: "text/plain".into(),
                    content: name.as_bytes().to_vec(),
                    origin_uri: None,
                    origin_modified_at: None,
                    crawler_id: None,
                    content_hash: None,
                })
                .await
                .expect("file");
            files.push(file.id);
        }

        storage
            .upsert_cached_value(&CachedValue {
                field_id: field.id.clone(),
                file_id: files[0].clone(),
                value_string: Some("good".into()),
                ..CachedValue::default()
            })
            .await
            .expect("upsert");
        assert!(!storage.insert_cached_error(&field.id, &files[0], "model failed").await.expect("error row"));
        let kept = storage.get_cached_value(&field.id, &files[0]).await.expect("get").expect("exists");
        assert_eq!(kept.value_string.as_deref(), Some("good"));
        assert!(kept.error_message.is_none());

        assert!(storage.insert_cached_error(&field.id, &files[1], "model failed").await.expect("error row"));
        let failed = storage.get_cached_value(&field.id, &files[1]).await.expect("get").expect("exists");
        assert!(failed.value_string.is_none());
        assert_eq!(failed.error_message.as_deref(), Some("model failed"));
    }
}
