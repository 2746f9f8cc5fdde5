//! SQL migration definitions for the Librarian database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a batch of SQL statements.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![
        Migration {
            version: 1,
            description: "Libraries, files, content processing tasks, chunks",
            sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS libraries (
    id              TEXT PRIMARY KEY,
    name            TEXT NOT NULL,
    embedding_model TEXT,
    created_at      TEXT NOT NULL,
    updated_at      TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS library_files (
    id                 TEXT PRIMARY KEY,
    library_id         TEXT NOT NULL REFERENCES libraries(id),
    name               TEXT NOT NULL,
    mime_type          TEXT NOT NULL,
    size               INTEGER NOT NULL,
    origin_uri         TEXT,
    origin_modified_at TEXT,
    crawler_id         TEXT,
    content_hash       TEXT,
    archived_at        TEXT,
    created_at         TEXT NOT NULL,
    updated_at         TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_files_library ON library_files(library_id);
CREATE INDEX IF NOT EXISTS idx_files_crawler_origin ON library_files(crawler_id, origin_uri);

-- Raw bytes handed to extraction methods
CREATE TABLE IF NOT EXISTS file_contents (
    file_id TEXT PRIMARY KEY REFERENCES library_files(id),
    content BLOB NOT NULL
);

-- Markdown produced by successful extraction sub-tasks
CREATE TABLE IF NOT EXISTS markdown_artifacts (
    file_id    TEXT NOT NULL REFERENCES library_files(id),
    name       TEXT NOT NULL,
    content    TEXT NOT NULL,
    created_at TEXT NOT NULL,
    PRIMARY KEY (file_id, name)
);

CREATE TABLE IF NOT EXISTS content_processing_tasks (
    id                     TEXT PRIMARY KEY,
    file_id                TEXT NOT NULL REFERENCES library_files(id),
    library_id             TEXT NOT NULL REFERENCES libraries(id),
    created_at             TEXT NOT NULL,
    extraction_options     TEXT NOT NULL,
    timeout_ms             INTEGER NOT NULL,
    processing_started_at  TEXT,
    processing_finished_at TEXT,
    processing_failed_at   TEXT,
    processing_timeout     INTEGER NOT NULL DEFAULT 0,
    processing_cancelled   INTEGER NOT NULL DEFAULT 0,
    extraction_started_at  TEXT,
    extraction_finished_at TEXT,
    extraction_failed_at   TEXT,
    extraction_timeout     INTEGER NOT NULL DEFAULT 0,
    embedding_started_at   TEXT,
    embedding_finished_at  TEXT,
    embedding_failed_at    TEXT,
    embedding_timeout      INTEGER NOT NULL DEFAULT 0,
    chunks_count           INTEGER,
    chunks_size            INTEGER,
    embedding_model_name   TEXT,
    error_message          TEXT
);

CREATE INDEX IF NOT EXISTS idx_cpt_file ON content_processing_tasks(file_id);
CREATE INDEX IF NOT EXISTS idx_cpt_library ON content_processing_tasks(library_id);
CREATE INDEX IF NOT EXISTS idx_cpt_pickup ON content_processing_tasks(processing_started_at, created_at);

CREATE TABLE IF NOT EXISTS extraction_sub_tasks (
    id                 TEXT PRIMARY KEY,
    task_id            TEXT NOT NULL REFERENCES content_processing_tasks(id),
    extraction_method  TEXT NOT NULL,
    started_at         TEXT,
    finished_at        TEXT,
    failed_at          TEXT,
    timed_out          INTEGER NOT NULL DEFAULT 0,
    markdown_file_name TEXT,
    output_length      INTEGER,
    selected           INTEGER NOT NULL DEFAULT 0,
    error_message      TEXT
);

CREATE INDEX IF NOT EXISTS idx_sub_tasks_task ON extraction_sub_tasks(task_id);

CREATE TABLE IF NOT EXISTS chunks (
    id          TEXT PRIMARY KEY,
    file_id     TEXT NOT NULL REFERENCES library_files(id),
    library_id  TEXT NOT NULL,
    task_id     TEXT NOT NULL,
    chunk_index INTEGER NOT NULL,
    section     TEXT,
    text        TEXT NOT NULL,
    embedding   BLOB NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_chunks_file ON chunks(file_id);
CREATE INDEX IF NOT EXISTS idx_chunks_library ON chunks(library_id);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
        },
        Migration {
            version: 2,
            description: "Crawlers, schedules, runs, library updates",
            sql: r#"
CREATE TABLE IF NOT EXISTS crawlers (
    id                 TEXT PRIMARY KEY,
    library_id         TEXT NOT NULL REFERENCES libraries(id),
    uri                TEXT NOT NULL,
    uri_type           TEXT NOT NULL,
    max_depth          INTEGER NOT NULL,
    max_pages          INTEGER NOT NULL,
    min_file_size_mb   REAL,
    max_file_size_mb   REAL,
    include_patterns   TEXT NOT NULL DEFAULT '[]',
    exclude_patterns   TEXT NOT NULL DEFAULT '[]',
    allowed_mime_types TEXT NOT NULL DEFAULT '[]',
    last_run_at        TEXT,
    created_at         TEXT NOT NULL,
    updated_at         TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS crawler_schedules (
    crawler_id TEXT PRIMARY KEY REFERENCES crawlers(id),
    monday     INTEGER NOT NULL DEFAULT 0,
    tuesday    INTEGER NOT NULL DEFAULT 0,
    wednesday  INTEGER NOT NULL DEFAULT 0,
    thursday   INTEGER NOT NULL DEFAULT 0,
    friday     INTEGER NOT NULL DEFAULT 0,
    saturday   INTEGER NOT NULL DEFAULT 0,
    sunday     INTEGER NOT NULL DEFAULT 0,
    hour       INTEGER NOT NULL DEFAULT 0,
    minute     INTEGER NOT NULL DEFAULT 0,
    active     INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE IF NOT EXISTS crawler_runs (
    id              TEXT PRIMARY KEY,
    crawler_id      TEXT NOT NULL REFERENCES crawlers(id),
    started_at      TEXT NOT NULL,
    ended_at        TEXT,
    stopped_by_user TEXT,
    success         INTEGER,
    error_message   TEXT,
    triggered_by    TEXT,
    updates_count   INTEGER NOT NULL DEFAULT 0,
    update_stats    TEXT NOT NULL DEFAULT '{}'
);

CREATE INDEX IF NOT EXISTS idx_runs_crawler ON crawler_runs(crawler_id, started_at);

-- At most one open run per crawler
CREATE UNIQUE INDEX IF NOT EXISTS idx_runs_one_open
    ON crawler_runs(crawler_id) WHERE ended_at IS NULL;

CREATE TABLE IF NOT EXISTS library_updates (
    id             TEXT PRIMARY KEY,
    library_id     TEXT NOT NULL REFERENCES libraries(id),
    crawler_run_id TEXT REFERENCES crawler_runs(id),
    file_id        TEXT,
    update_type    TEXT NOT NULL,
    file_name      TEXT,
    origin_uri     TEXT,
    file_size      INTEGER,
    filter_type    TEXT,
    filter_value   TEXT,
    message        TEXT,
    created_at     TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_updates_run ON library_updates(crawler_run_id, update_type);
CREATE INDEX IF NOT EXISTS idx_updates_library ON library_updates(library_id);

INSERT INTO schema_migrations (version) VALUES (2);
"#,
        },
        Migration {
            version: 3,
            description: "Lists, fields, item cache, enrichment tasks",
            sql: r#"
CREATE TABLE IF NOT EXISTS lists (
    id         TEXT PRIMARY KEY,
    name       TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS list_sources (
    list_id    TEXT NOT NULL REFERENCES lists(id),
    library_id TEXT NOT NULL REFERENCES libraries(id),
    PRIMARY KEY (list_id, library_id)
);

CREATE TABLE IF NOT EXISTS list_fields (
    id               TEXT PRIMARY KEY,
    list_id          TEXT NOT NULL REFERENCES lists(id),
    name             TEXT NOT NULL,
    field_order      INTEGER NOT NULL,
    field_type       TEXT NOT NULL,
    source_type      TEXT NOT NULL,
    file_property    TEXT,
    prompt           TEXT,
    content_query    TEXT,
    language_model   TEXT,
    use_vector_store INTEGER NOT NULL DEFAULT 0,
    failure_terms    TEXT,
    created_at       TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_fields_list ON list_fields(list_id);

CREATE TABLE IF NOT EXISTS list_field_contexts (
    field_id         TEXT NOT NULL REFERENCES list_fields(id),
    context_field_id TEXT NOT NULL REFERENCES list_fields(id),
    PRIMARY KEY (field_id, context_field_id)
);

CREATE TABLE IF NOT EXISTS list_item_cache (
    field_id      TEXT NOT NULL REFERENCES list_fields(id),
    file_id       TEXT NOT NULL REFERENCES library_files(id),
    value_string  TEXT,
    value_number  REAL,
    value_boolean INTEGER,
    value_date    TEXT,
    error_message TEXT,
    updated_at    TEXT NOT NULL,
    PRIMARY KEY (field_id, file_id)
);

CREATE TABLE IF NOT EXISTS enrichment_tasks (
    id            TEXT PRIMARY KEY,
    list_id       TEXT NOT NULL REFERENCES lists(id),
    field_id      TEXT NOT NULL REFERENCES list_fields(id),
    file_id       TEXT NOT NULL REFERENCES library_files(id),
    status        TEXT NOT NULL,
    priority      INTEGER NOT NULL DEFAULT 0,
    requested_at  TEXT NOT NULL,
    started_at    TEXT,
    completed_at  TEXT,
    error_message TEXT,
    input_json    TEXT,
    output_json   TEXT
);

CREATE INDEX IF NOT EXISTS idx_enrichment_pickup ON enrichment_tasks(status, priority, requested_at);
CREATE INDEX IF NOT EXISTS idx_enrichment_list ON enrichment_tasks(list_id, field_id);
CREATE INDEX IF NOT EXISTS idx_enrichment_file ON enrichment_tasks(file_id);

INSERT INTO schema_migrations (version) VALUES (3);
"#,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn versions_are_ascending_and_recorded() {
        let migrations = all_migrations();
        for (i, m) in migrations.iter().enumerate() {
            assert_eq!(m.version as usize, i + 1);
            assert!(
                m.sql
                    .contains(&format!("INSERT INTO schema_migrations (version) VALUES ({})", m.version)),
                "migration {} must record itself",
                m.version
            );
        }
    }
}
