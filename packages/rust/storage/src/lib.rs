//! Turso Embedded / libSQL storage layer.
//!
//! The [`Storage`] struct wraps a libSQL database holding libraries, files,
//! processing tasks, chunks, crawlers and their runs, lists, the list item
//! cache and enrichment tasks.
//!
//! Every "claim" or "gate" is a single conditional statement (`UPDATE ...
//! WHERE status = 'pending'`, `INSERT ... WHERE NOT EXISTS`) whose affected-row
//! count decides the winner, so two workers never own the same task and two
//! runs of one crawler never overlap.

mod crawlers;
mod enrichment;
mod files;
mod lists;
mod migrations;
mod processing;
mod rows;

use std::path::Path;

use libsql::{Connection, Database, params};
use tokio::sync::Mutex;

use librarian_shared::{LibrarianError, Result};

pub use crawlers::RunOutcome;
pub use enrichment::{EnrichmentTaskFilter, FieldTaskCounters};
pub use files::NewFile;
pub use lists::NewListField;
pub use processing::{ChunkScope, ProcessingTaskFilter, TaskPhase};

use rows::db_err;

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    /// Serializes explicit transactions on the shared connection.
    tx_lock: Mutex<()>,
}

impl Storage {
    /// Open or create a database at `path` and apply pending migrations.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| LibrarianError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(db_err)?;

        let conn = db.connect().map_err(db_err)?;

        let storage = Self {
            db,
            conn,
            tx_lock: Mutex::new(()),
        };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn.execute_batch(migration.sql).await.map_err(|e| {
                    LibrarianError::Storage(format!("migration v{} failed: {e}", migration.version))
                })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    pub async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use uuid::Uuid;

    /// Create a temp file storage for testing.
    pub(crate) async fn test_storage() -> Storage {
        let tmp = std::env::temp_dir().join(format!("librarian_test_{}.db", Uuid::now_v7()));
        Storage::open(&tmp).await.expect("open test db")
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::test_storage;
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn open_and_migrate() {
        let storage = test_storage().await;
        assert_eq!(storage.get_schema_version().await, 3);
    }

    #[tokio::test]
    async fn idempotent_migration() {
        let tmp = std::env::temp_dir().join(format!("librarian_test_{}.db", Uuid::now_v7()));
        let s1 = Storage::open(&tmp).await.expect("first open");
        drop(s1);
        let s2 = Storage::open(&tmp).await.expect("second open");
        assert_eq!(s2.get_schema_version().await, 3);
    }
}
