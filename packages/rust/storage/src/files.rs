//! Libraries, library files, raw contents and Markdown artifacts.

use chrono::{DateTime, Utc};
use libsql::params;

use librarian_shared::{Library, LibraryFile, Result, new_id};

use crate::Storage;
use crate::rows::{
    col_i64, col_opt_string, col_opt_ts, col_string, col_ts, collect, db_err, first, opt_ts, ts,
};

/// Fields for a new library file. The raw bytes are stored alongside the row.
#[derive(Debug, Clone)]
pub struct NewFile {
    pub library_id: String,
    pub name: String,
    pub mime_type: String,
    pub content: Vec<u8>,
    pub origin_uri: Option<String>,
    pub origin_modified_at: Option<DateTime<Utc>>,
    pub crawler_id: Option<String>,
    pub content_hash: Option<String>,
}

pub(crate) const FILE_COLUMNS: &str = "id, library_id, name, mime_type, size, origin_uri, origin_modified_at,
     crawler_id, content_hash, archived_at, created_at, updated_at";

impl Storage {
    // -----------------------------------------------------------------------
    // Libraries
    // -----------------------------------------------------------------------

    /// Insert a new library.
    pub async fn insert_library(
        &self,
        name: &str,
        embedding_model: Option<&str>,
    ) -> Result<Library> {
        let now = Utc::now();
        let library = Library {
            id: new_id(),
            name: name.to_string(),
            embedding_model: embedding_model.map(str::to_string),
            created_at: now,
            updated_at: now,
        };
        self.conn
            .execute(
                "INSERT INTO libraries (id, name, embedding_model, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    library.id.as_str(),
                    library.name.as_str(),
                    library.embedding_model.as_deref(),
                    ts(&now),
                    ts(&now),
                ],
            )
            .await
            .map_err(db_err)?;
        Ok(library)
    }

    pub async fn get_library(&self, id: &str) -> Result<Option<Library>> {
        let rows = self
            .conn
            .query(
                "SELECT id, name, embedding_model, created_at, updated_at
                 FROM libraries WHERE id = ?1",
                params![id],
            )
            .await
            .map_err(db_err)?;

        first(rows, |row| {
            Ok(Library {
                id: col_string(row, 0)?,
                name: col_string(row, 1)?,
                embedding_model: col_opt_string(row, 2),
                created_at: col_ts(row, 3)?,
                updated_at: col_ts(row, 4)?,
            })
        })
        .await
    }

    // -----------------------------------------------------------------------
    // Files
    // -----------------------------------------------------------------------

    /// Insert a file row and its raw content.
    pub async fn insert_file(&self, file: &NewFile) -> Result<LibraryFile> {
        let now = Utc::now();
        let record = LibraryFile {
            id: new_id(),
            library_id: file.library_id.clone(),
            name: file.name.clone(),
            mime_type: file.mime_type.clone(),
            size: file.content.len() as i64,
            origin_uri: file.origin_uri.clone(),
            origin_modified_at: file.origin_modified_at,
            crawler_id: file.crawler_id.clone(),
            content_hash: file.content_hash.clone(),
            archived_at: None,
            created_at: now,
            updated_at: now,
        };

        let _guard = self.tx_lock.lock().await;
        let tx = self.conn.transaction().await.map_err(db_err)?;
        tx.execute(
            "INSERT INTO library_files (id, library_id, name, mime_type, size, origin_uri,
                 origin_modified_at, crawler_id, content_hash, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                record.id.as_str(),
                record.library_id.as_str(),
                record.name.as_str(),
                record.mime_type.as_str(),
                record.size,
                record.origin_uri.as_deref(),
                opt_ts(record.origin_modified_at.as_ref()),
                record.crawler_id.as_deref(),
                record.content_hash.as_deref(),
                ts(&now),
                ts(&now),
            ],
        )
        .await
        .map_err(db_err)?;
        tx.execute(
            "INSERT INTO file_contents (file_id, content) VALUES (?1, ?2)",
            params![record.id.as_str(), file.content.clone()],
        )
        .await
        .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;

        Ok(record)
    }

    pub async fn get_file(&self, id: &str) -> Result<Option<LibraryFile>> {
        let rows = self
            .conn
            .query(
                &format!("SELECT {FILE_COLUMNS} FROM library_files WHERE id = ?1"),
                params![id],
            )
            .await
            .map_err(db_err)?;
        first(rows, row_to_file).await
    }

    /// Raw bytes of a file, if stored.
    pub async fn get_file_content(&self, file_id: &str) -> Result<Option<Vec<u8>>> {
        let rows = self
            .conn
            .query(
                "SELECT content FROM file_contents WHERE file_id = ?1",
                params![file_id],
            )
            .await
            .map_err(db_err)?;
        first(rows, |row| row.get::<Vec<u8>>(0).map_err(db_err)).await
    }

    /// Replace a file's content after a change was detected at its origin.
    pub async fn update_file_content(
        &self,
        file_id: &str,
        content: &[u8],
        mime_type: &str,
        content_hash: &str,
        origin_modified_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let now = ts(&Utc::now());
        let _guard = self.tx_lock.lock().await;
        let tx = self.conn.transaction().await.map_err(db_err)?;
        tx.execute(
            "UPDATE library_files
             SET size = ?1, mime_type = ?2, content_hash = ?3, origin_modified_at = ?4,
                 updated_at = ?5
             WHERE id = ?6",
            params![
                content.len() as i64,
                mime_type,
                content_hash,
                opt_ts(origin_modified_at.as_ref()),
                now,
                file_id,
            ],
        )
        .await
        .map_err(db_err)?;
        tx.execute(
            "INSERT INTO file_contents (file_id, content) VALUES (?1, ?2)
             ON CONFLICT(file_id) DO UPDATE SET content = excluded.content",
            params![file_id, content.to_vec()],
        )
        .await
        .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    /// Soft-delete a file. Returns false if it was already archived.
    pub async fn archive_file(&self, file_id: &str) -> Result<bool> {
        let now = ts(&Utc::now());
        let affected = self
            .conn
            .execute(
                "UPDATE library_files SET archived_at = ?1, updated_at = ?1
                 WHERE id = ?2 AND archived_at IS NULL",
                params![now, file_id],
            )
            .await
            .map_err(db_err)?;
        Ok(affected == 1)
    }

    /// The live file a crawler previously discovered at `origin_uri`.
    pub async fn find_crawler_file(
        &self,
        crawler_id: &str,
        origin_uri: &str,
    ) -> Result<Option<LibraryFile>> {
        let rows = self
            .conn
            .query(
                &format!(
                    "SELECT {FILE_COLUMNS} FROM library_files
                     WHERE crawler_id = ?1 AND origin_uri = ?2 AND archived_at IS NULL"
                ),
                params![crawler_id, origin_uri],
            )
            .await
            .map_err(db_err)?;
        first(rows, row_to_file).await
    }

    /// Every live file discovered by a crawler.
    pub async fn list_crawler_files(&self, crawler_id: &str) -> Result<Vec<LibraryFile>> {
        let rows = self
            .conn
            .query(
                &format!(
                    "SELECT {FILE_COLUMNS} FROM library_files
                     WHERE crawler_id = ?1 AND archived_at IS NULL
                     ORDER BY origin_uri"
                ),
                params![crawler_id],
            )
            .await
            .map_err(db_err)?;
        collect(rows, row_to_file).await
    }

    // -----------------------------------------------------------------------
    // Markdown artifacts
    // -----------------------------------------------------------------------

    /// Store (or overwrite) a named Markdown artifact for a file.
    pub async fn put_markdown(&self, file_id: &str, name: &str, content: &str) -> Result<()> {
        let now = ts(&Utc::now());
        self.conn
            .execute(
                "INSERT INTO markdown_artifacts (file_id, name, content, created_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(file_id, name) DO UPDATE SET
                   content = excluded.content,
                   created_at = excluded.created_at",
                params![file_id, name, content, now],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    pub async fn get_markdown(&self, file_id: &str, name: &str) -> Result<Option<String>> {
        let rows = self
            .conn
            .query(
                "SELECT content FROM markdown_artifacts WHERE file_id = ?1 AND name = ?2",
                params![file_id, name],
            )
            .await
            .map_err(db_err)?;
        first(rows, |row| col_string(row, 0)).await
    }
}

pub(crate) fn row_to_file(row: &libsql::Row) -> Result<LibraryFile> {
    Ok(LibraryFile {
        id: col_string(row, 0)?,
        library_id: col_string(row, 1)?,
        name: col_string(row, 2)?,
        mime_type: col_string(row, 3)?,
        size: col_i64(row, 4)?,
        origin_uri: col_opt_string(row, 5),
        origin_modified_at: col_opt_ts(row, 6)?,
        crawler_id: col_opt_string(row, 7),
        content_hash: col_opt_string(row, 8),
        archived_at: col_opt_ts(row, 9)?,
        created_at: col_ts(row, 10)?,
        updated_at: col_ts(row, 11)?,
    })
}
