//! SQL migration definitions for the ContentPipe database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a batch of SQL statements; each batch records its own
//! version in `schema_migrations`.

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
            description: "Initial schema: contents, FTS5, quarantine, change log",
            sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- One row per canonical URL
CREATE TABLE IF NOT EXISTS contents (
    id             TEXT PRIMARY KEY,
    url            TEXT NOT NULL UNIQUE,
    title          TEXT NOT NULL,
    content_type   TEXT NOT NULL,
    content        TEXT NOT NULL,
    metadata_json  TEXT NOT NULL,
    last_processed TEXT NOT NULL,
    content_hash   TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_contents_hash ON contents(content_hash);

-- Rows that failed validation, kept for inspection
CREATE TABLE IF NOT EXISTS quarantine (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    url            TEXT NOT NULL,
    reason         TEXT NOT NULL,
    row_json       TEXT NOT NULL,
    quarantined_at TEXT NOT NULL
);

-- Append-only change log
CREATE TABLE IF NOT EXISTS change_events (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    url           TEXT NOT NULL,
    previous_hash TEXT NOT NULL,
    new_hash      TEXT NOT NULL,
    detected_at   TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_change_events_url ON change_events(url);

-- Full-text search on contents
CREATE VIRTUAL TABLE IF NOT EXISTS contents_fts USING fts5(
    title,
    content,
    content=contents,
    content_rowid=rowid
);

-- Triggers keep FTS in sync within the writing statement
CREATE TRIGGER IF NOT EXISTS contents_fts_insert AFTER INSERT ON contents BEGIN
    INSERT INTO contents_fts(rowid, title, content)
    VALUES (new.rowid, new.title, new.content);
END;

CREATE TRIGGER IF NOT EXISTS contents_fts_delete AFTER DELETE ON contents BEGIN
    INSERT INTO contents_fts(contents_fts, rowid, title, content)
    VALUES ('delete', old.rowid, old.title, old.content);
END;

CREATE TRIGGER IF NOT EXISTS contents_fts_update AFTER UPDATE OF title, content ON contents BEGIN
    INSERT INTO contents_fts(contents_fts, rowid, title, content)
    VALUES ('delete', old.rowid, old.title, old.content);
    INSERT INTO contents_fts(rowid, title, content)
    VALUES (new.rowid, new.title, new.content);
END;

INSERT OR IGNORE INTO schema_migrations (version) VALUES (1);
"#,
        },
        Migration {
            version: 2,
            description: "Collections and analysis cache",
            sql: r#"
CREATE TABLE IF NOT EXISTS collections (
    id         TEXT PRIMARY KEY,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS collection_entries (
    collection_id TEXT NOT NULL REFERENCES collections(id) ON DELETE CASCADE,
    url           TEXT NOT NULL,
    added_at      TEXT NOT NULL,
    tags_json     TEXT NOT NULL DEFAULT '[]',
    PRIMARY KEY (collection_id, url)
);

CREATE TABLE IF NOT EXISTS analysis_cache (
    url          TEXT NOT NULL,
    content_hash TEXT NOT NULL,
    query_hash   TEXT NOT NULL,
    model        TEXT NOT NULL,
    summary      TEXT NOT NULL,
    created_at   TEXT NOT NULL,
    PRIMARY KEY (url, content_hash, query_hash, model)
);

INSERT OR IGNORE INTO schema_migrations (version) VALUES (2);
"#,
        },
    ]
}
