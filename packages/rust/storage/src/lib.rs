//! libSQL-backed Content Store.
//!
//! [`ContentStore`] persists one [`ProcessedContent`] row per canonical URL and
//! keeps an FTS5 index in step with it through triggers, so a row and its
//! index entry are written by the same statement. It also holds the change
//! log, quarantined rows, persisted collections, and the analysis cache.
//!
//! **Write rules:**
//! - every content write goes through [`ContentStore::upsert`] / [`ContentStore::delete`]
//! - writes take a per-URL row lock; unrelated URLs write concurrently
//! - a write, once started, runs to completion even if the caller goes away

mod error;
mod locks;
mod migrations;
mod row;
mod search;

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use libsql::{Connection, Database, params};
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument, warn};

use contentpipe_shared::{
    CanonicalUrl, ChangeEvent, ProcessedContent, StoreConfig, UrlCollection, UrlEntry, canonicalize,
    content_hash,
};

pub use error::StoreError;
pub use locks::{KeyGuard, KeyedLocks};
pub use search::SearchCursor;

use row::{CONTENT_COLUMNS, RawRow};

/// What an [`ContentStore::upsert`] did to the row for its URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// No row existed; one was inserted.
    Created,
    /// The row existed with different content and was overwritten.
    Updated { previous_hash: String },
    /// Identical content; only `last_processed` moved.
    Unchanged,
}

/// A row moved out of `contents` because it failed validation.
#[derive(Debug, Clone)]
pub struct QuarantinedRow {
    pub url: String,
    pub reason: String,
    /// Raw column values as a JSON object.
    pub row_json: String,
    pub quarantined_at: DateTime<Utc>,
}

struct Inner {
    db: Database,
    readonly: bool,
    busy_timeout: Duration,
    page_size: u32,
    row_locks: KeyedLocks,
}

/// Handle to the content database. Cheap to clone; clones share row locks.
#[derive(Clone)]
pub struct ContentStore {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ContentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentStore")
            .field("readonly", &self.inner.readonly)
            .field("page_size", &self.inner.page_size)
            .finish_non_exhaustive()
    }
}

impl ContentStore {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path, config: &StoreConfig) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::IoFailure(format!("{}: {e}", parent.display())))?;
        }

        let store = Self::build(path, config, false).await?;
        let conn = store.connect()?;
        // journal_mode returns a row, so it cannot go through `execute`.
        conn.query("PRAGMA journal_mode = WAL", ())
            .await
            .map_err(StoreError::io)?;
        store.run_migrations(&conn).await?;
        Ok(store)
    }

    /// Open an existing database at `path` in read-only mode.
    pub async fn open_readonly(path: &Path, config: &StoreConfig) -> Result<Self, StoreError> {
        Self::build(path, config, true).await
    }

    async fn build(path: &Path, config: &StoreConfig, readonly: bool) -> Result<Self, StoreError> {
        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(StoreError::io)?;

        Ok(Self {
            inner: Arc::new(Inner {
                db,
                readonly,
                busy_timeout: config.busy_timeout(),
                page_size: config.search_page_size.max(1),
                row_locks: KeyedLocks::new(),
            }),
        })
    }

    /// A fresh connection with the configured busy timeout.
    fn connect(&self) -> Result<Connection, StoreError> {
        let conn = self.inner.db.connect().map_err(StoreError::io)?;
        conn.busy_timeout(self.inner.busy_timeout)
            .map_err(StoreError::io)?;
        Ok(conn)
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self, conn: &Connection) -> Result<(), StoreError> {
        let current_version = schema_version(conn).await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                conn.execute_batch(migration.sql).await.map_err(|e| {
                    StoreError::IoFailure(format!("migration v{} failed: {e}", migration.version))
                })?;
            }
        }
        Ok(())
    }

    /// Current schema version, or 0 before the first migration.
    pub async fn schema_version(&self) -> Result<u32, StoreError> {
        let conn = self.connect()?;
        Ok(schema_version(&conn).await)
    }

    fn check_writable(&self) -> Result<(), StoreError> {
        if self.inner.readonly {
            return Err(StoreError::ReadOnly);
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Content rows
    // -----------------------------------------------------------------------

    /// Insert or overwrite the row for `content.url`.
    ///
    /// Identical content only refreshes `last_processed`. If the existing row
    /// fails validation it is quarantined and [`StoreError::Corrupt`] is
    /// returned; the next upsert for that URL starts from an empty slot.
    #[instrument(skip_all, fields(url = %content.url))]
    pub async fn upsert(&self, content: &ProcessedContent) -> Result<UpsertOutcome, StoreError> {
        self.check_writable()?;
        validate_input(content)?;

        // Detached so a dropped caller cannot leave a half-applied write.
        let store = self.clone();
        let content = content.clone();
        tokio::spawn(async move { store.upsert_locked(&content).await })
            .await
            .map_err(|e| StoreError::IoFailure(format!("write task failed: {e}")))?
    }

    async fn upsert_locked(&self, content: &ProcessedContent) -> Result<UpsertOutcome, StoreError> {
        let _row = self.inner.row_locks.lock(&content.url).await;
        let conn = self.connect()?;

        let existing = match read_raw(&conn, &content.url).await? {
            Some(raw) => Some(self.validate_or_quarantine(&conn, raw).await?),
            None => None,
        };

        let last_processed = content.last_processed.to_rfc3339();

        if let Some(old) = &existing {
            if old.same_content(content) {
                conn.execute(
                    "UPDATE contents SET last_processed = ?1 WHERE id = ?2",
                    params![last_processed.as_str(), content.id.as_str()],
                )
                .await
                .map_err(StoreError::io)?;
                debug!("content unchanged, refreshed last_processed");
                return Ok(UpsertOutcome::Unchanged);
            }
        }

        let metadata_json = serde_json::to_string(&content.metadata)
            .map_err(|e| StoreError::InvalidInput(format!("metadata: {e}")))?;

        conn.execute(
            "INSERT INTO contents (id, url, title, content_type, content, metadata_json, last_processed, content_hash)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(id) DO UPDATE SET
               title = excluded.title,
               content_type = excluded.content_type,
               content = excluded.content,
               metadata_json = excluded.metadata_json,
               last_processed = excluded.last_processed,
               content_hash = excluded.content_hash",
            params![
                content.id.as_str(),
                content.url.as_str(),
                content.title.as_str(),
                content.content_type.as_str(),
                content.content.as_str(),
                metadata_json.as_str(),
                last_processed.as_str(),
                content.content_hash.as_str(),
            ],
        )
        .await
        .map_err(StoreError::io)?;

        Ok(match existing {
            None => UpsertOutcome::Created,
            Some(old) => UpsertOutcome::Updated {
                previous_hash: old.content_hash,
            },
        })
    }

    /// Fetch the row for `url`, quarantining it if it fails validation.
    pub async fn get(&self, url: &str) -> Result<Option<ProcessedContent>, StoreError> {
        let conn = self.connect()?;
        let Some(raw) = read_raw(&conn, url).await? else {
            return Ok(None);
        };
        match raw.validate() {
            Ok(content) => Ok(Some(content)),
            Err(reason) if self.inner.readonly => Err(StoreError::Corrupt {
                url: raw.url_hint(),
                reason,
            }),
            Err(_) => {
                let _row = self.inner.row_locks.lock(url).await;
                // Re-read under the lock; a writer may have replaced the row.
                match read_raw(&conn, url).await? {
                    Some(raw) => self.validate_or_quarantine(&conn, raw).await.map(Some),
                    None => Ok(None),
                }
            }
        }
    }

    /// Remove the row for `url`. Returns whether a row existed.
    pub async fn delete(&self, url: &str) -> Result<bool, StoreError> {
        self.check_writable()?;
        let _row = self.inner.row_locks.lock(url).await;
        let conn = self.connect()?;
        let affected = conn
            .execute("DELETE FROM contents WHERE id = ?1", params![url])
            .await
            .map_err(StoreError::io)?;
        Ok(affected > 0)
    }

    /// Number of content rows.
    pub async fn count(&self) -> Result<u64, StoreError> {
        let conn = self.connect()?;
        let mut rows = conn
            .query("SELECT COUNT(*) FROM contents", ())
            .await
            .map_err(StoreError::io)?;
        match rows.next().await.map_err(StoreError::io)? {
            Some(row) => Ok(row.get::<i64>(0).map_err(StoreError::io)? as u64),
            None => Ok(0),
        }
    }

    /// All stored URLs, sorted.
    pub async fn list_urls(&self) -> Result<Vec<String>, StoreError> {
        let conn = self.connect()?;
        let mut rows = conn
            .query("SELECT url FROM contents ORDER BY url", ())
            .await
            .map_err(StoreError::io)?;
        let mut urls = Vec::new();
        while let Some(row) = rows.next().await.map_err(StoreError::io)? {
            urls.push(row.get::<String>(0).map_err(StoreError::io)?);
        }
        Ok(urls)
    }

    /// Full-text search. The cursor pulls rows lazily in pages, best match first.
    pub fn search(&self, query: &str) -> SearchCursor {
        SearchCursor::new(self.clone(), query, self.inner.page_size)
    }

    async fn validate_or_quarantine(
        &self,
        conn: &Connection,
        raw: RawRow,
    ) -> Result<ProcessedContent, StoreError> {
        match raw.validate() {
            Ok(content) => Ok(content),
            Err(reason) => {
                let url = raw.url_hint();
                self.quarantine(conn, &raw, &reason).await?;
                Err(StoreError::Corrupt { url, reason })
            }
        }
    }

    /// Move a row into `quarantine` and out of `contents` atomically.
    async fn quarantine(&self, conn: &Connection, raw: &RawRow, reason: &str) -> Result<(), StoreError> {
        let url = raw.url_hint();
        warn!(%url, %reason, "quarantining corrupt content row");

        if self.inner.readonly {
            return Ok(());
        }

        let now = Utc::now().to_rfc3339();
        let tx = conn.transaction().await.map_err(StoreError::io)?;
        tx.execute(
            "INSERT INTO quarantine (url, reason, row_json, quarantined_at) VALUES (?1, ?2, ?3, ?4)",
            params![url.as_str(), reason, raw.to_json().as_str(), now.as_str()],
        )
        .await
        .map_err(StoreError::io)?;
        tx.execute("DELETE FROM contents WHERE rowid = ?1", params![raw.rowid])
            .await
            .map_err(StoreError::io)?;
        tx.commit().await.map_err(StoreError::io)?;
        Ok(())
    }

    /// Re-check the row at `rowid` under its row lock and quarantine it if it
    /// is still invalid. Returns whether a row was removed.
    async fn recheck_and_quarantine(&self, conn: &Connection, raw: &RawRow) -> Result<bool, StoreError> {
        let _row = self.inner.row_locks.lock(&raw.url_hint()).await;
        let Some(current) = read_raw_by_rowid(conn, raw.rowid).await? else {
            return Ok(false);
        };
        match current.validate() {
            Ok(_) => Ok(false),
            Err(reason) => {
                self.quarantine(conn, &current, &reason).await?;
                Ok(!self.inner.readonly)
            }
        }
    }

    #[cfg(test)]
    pub(crate) async fn execute_raw(&self, sql: &str) -> Result<u64, StoreError> {
        let conn = self.connect()?;
        conn.execute(sql, ()).await.map_err(StoreError::io)
    }

    /// Rows quarantined so far, oldest first.
    pub async fn quarantined(&self) -> Result<Vec<QuarantinedRow>, StoreError> {
        let conn = self.connect()?;
        let mut rows = conn
            .query(
                "SELECT url, reason, row_json, quarantined_at FROM quarantine ORDER BY id",
                (),
            )
            .await
            .map_err(StoreError::io)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(StoreError::io)? {
            results.push(QuarantinedRow {
                url: row.get::<String>(0).map_err(StoreError::io)?,
                reason: row.get::<String>(1).map_err(StoreError::io)?,
                row_json: row.get::<String>(2).map_err(StoreError::io)?,
                quarantined_at: parse_timestamp(&row.get::<String>(3).map_err(StoreError::io)?)?,
            });
        }
        Ok(results)
    }

    // -----------------------------------------------------------------------
    // Change log
    // -----------------------------------------------------------------------

    /// Append a change event to the log.
    pub async fn append_change_event(&self, event: &ChangeEvent) -> Result<(), StoreError> {
        self.check_writable()?;
        let conn = self.connect()?;
        conn.execute(
            "INSERT INTO change_events (url, previous_hash, new_hash, detected_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                event.url.as_str(),
                event.previous_hash.as_str(),
                event.new_hash.as_str(),
                event.detected_at.to_rfc3339(),
            ],
        )
        .await
        .map_err(StoreError::io)?;
        Ok(())
    }

    /// Logged change events in append order, optionally for one URL.
    pub async fn change_events(&self, url: Option<&str>) -> Result<Vec<ChangeEvent>, StoreError> {
        let conn = self.connect()?;
        let mut rows = match url {
            Some(url) => conn
                .query(
                    "SELECT url, previous_hash, new_hash, detected_at FROM change_events
                     WHERE url = ?1 ORDER BY id",
                    params![url],
                )
                .await,
            None => conn
                .query(
                    "SELECT url, previous_hash, new_hash, detected_at FROM change_events ORDER BY id",
                    (),
                )
                .await,
        }
        .map_err(StoreError::io)?;

        let mut events = Vec::new();
        while let Some(row) = rows.next().await.map_err(StoreError::io)? {
            let url: String = row.get(0).map_err(StoreError::io)?;
            events.push(ChangeEvent {
                url: canonicalize(&url).map_err(|e| StoreError::Corrupt {
                    url: url.clone(),
                    reason: e.to_string(),
                })?,
                previous_hash: row.get(1).map_err(StoreError::io)?,
                new_hash: row.get(2).map_err(StoreError::io)?,
                detected_at: parse_timestamp(&row.get::<String>(3).map_err(StoreError::io)?)?,
            });
        }
        Ok(events)
    }

    // -----------------------------------------------------------------------
    // Collections
    // -----------------------------------------------------------------------

    /// Record a collection id (no-op if it already exists).
    pub async fn save_collection(&self, collection_id: &str) -> Result<(), StoreError> {
        self.check_writable()?;
        let conn = self.connect()?;
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT OR IGNORE INTO collections (id, created_at) VALUES (?1, ?2)",
            params![collection_id, now.as_str()],
        )
        .await
        .map_err(StoreError::io)?;
        Ok(())
    }

    /// Insert an entry, or replace its tags if already present.
    pub async fn save_collection_entry(
        &self,
        collection_id: &str,
        entry: &UrlEntry,
    ) -> Result<(), StoreError> {
        self.check_writable()?;
        let conn = self.connect()?;
        let tags_json = serde_json::to_string(&entry.tags)
            .map_err(|e| StoreError::InvalidInput(format!("tags: {e}")))?;
        conn.execute(
            "INSERT INTO collection_entries (collection_id, url, added_at, tags_json)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(collection_id, url) DO UPDATE SET tags_json = excluded.tags_json",
            params![
                collection_id,
                entry.url.as_str(),
                entry.added_at.to_rfc3339(),
                tags_json.as_str(),
            ],
        )
        .await
        .map_err(StoreError::io)?;
        Ok(())
    }

    pub async fn delete_collection_entry(
        &self,
        collection_id: &str,
        url: &CanonicalUrl,
    ) -> Result<(), StoreError> {
        self.check_writable()?;
        let conn = self.connect()?;
        conn.execute(
            "DELETE FROM collection_entries WHERE collection_id = ?1 AND url = ?2",
            params![collection_id, url.as_str()],
        )
        .await
        .map_err(StoreError::io)?;
        Ok(())
    }

    /// Load every persisted collection, entries in insertion order.
    pub async fn load_collections(&self) -> Result<Vec<UrlCollection>, StoreError> {
        let conn = self.connect()?;

        let mut collections: BTreeMap<String, UrlCollection> = BTreeMap::new();
        let mut rows = conn
            .query("SELECT id FROM collections ORDER BY id", ())
            .await
            .map_err(StoreError::io)?;
        while let Some(row) = rows.next().await.map_err(StoreError::io)? {
            let id: String = row.get(0).map_err(StoreError::io)?;
            collections.insert(id.clone(), UrlCollection::new(id));
        }

        let mut rows = conn
            .query(
                "SELECT collection_id, url, added_at, tags_json FROM collection_entries ORDER BY rowid",
                (),
            )
            .await
            .map_err(StoreError::io)?;
        while let Some(row) = rows.next().await.map_err(StoreError::io)? {
            let collection_id: String = row.get(0).map_err(StoreError::io)?;
            let url: String = row.get(1).map_err(StoreError::io)?;
            let Ok(url) = canonicalize(&url) else {
                warn!(%collection_id, %url, "skipping invalid collection entry");
                continue;
            };
            let added_at = parse_timestamp(&row.get::<String>(2).map_err(StoreError::io)?)?;
            let tags: BTreeSet<String> =
                serde_json::from_str(&row.get::<String>(3).map_err(StoreError::io)?)
                    .unwrap_or_default();

            if let Some(collection) = collections.get_mut(&collection_id) {
                collection.insert(UrlEntry {
                    url,
                    added_at,
                    tags,
                });
            }
        }

        Ok(collections.into_values().collect())
    }

    // -----------------------------------------------------------------------
    // Analysis cache
    // -----------------------------------------------------------------------

    /// Cached summary for this exact content, query, and model.
    pub async fn get_analysis(
        &self,
        url: &str,
        content_hash: &str,
        query: &str,
        model: &str,
    ) -> Result<Option<String>, StoreError> {
        let conn = self.connect()?;
        let mut rows = conn
            .query(
                "SELECT summary FROM analysis_cache
                 WHERE url = ?1 AND content_hash = ?2 AND query_hash = ?3 AND model = ?4",
                params![url, content_hash, query_hash(query), model],
            )
            .await
            .map_err(StoreError::io)?;

        match rows.next().await.map_err(StoreError::io)? {
            Some(row) => Ok(Some(row.get::<String>(0).map_err(StoreError::io)?)),
            None => Ok(None),
        }
    }

    /// Store a summary in the cache (upserts).
    pub async fn put_analysis(
        &self,
        url: &str,
        content_hash: &str,
        query: &str,
        model: &str,
        summary: &str,
    ) -> Result<(), StoreError> {
        self.check_writable()?;
        let conn = self.connect()?;
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO analysis_cache (url, content_hash, query_hash, model, summary, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(url, content_hash, query_hash, model) DO UPDATE SET
               summary = excluded.summary,
               created_at = excluded.created_at",
            params![url, content_hash, query_hash(query), model, summary, now.as_str()],
        )
        .await
        .map_err(StoreError::io)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

async fn schema_version(conn: &Connection) -> u32 {
    match conn
        .query("SELECT MAX(version) FROM schema_migrations", ())
        .await
    {
        Ok(mut rows) => match rows.next().await {
            Ok(Some(row)) => row.get::<u32>(0).unwrap_or(0),
            _ => 0,
        },
        Err(_) => 0, // Table doesn't exist yet
    }
}

async fn read_raw(conn: &Connection, url: &str) -> Result<Option<RawRow>, StoreError> {
    let sql = format!("SELECT {CONTENT_COLUMNS} FROM contents c WHERE c.id = ?1");
    let mut rows = conn.query(&sql, params![url]).await.map_err(StoreError::io)?;
    match rows.next().await.map_err(StoreError::io)? {
        Some(row) => Ok(Some(RawRow::read(&row, 0)?)),
        None => Ok(None),
    }
}

async fn read_raw_by_rowid(conn: &Connection, rowid: i64) -> Result<Option<RawRow>, StoreError> {
    let sql = format!("SELECT {CONTENT_COLUMNS} FROM contents c WHERE c.rowid = ?1");
    let mut rows = conn.query(&sql, params![rowid]).await.map_err(StoreError::io)?;
    match rows.next().await.map_err(StoreError::io)? {
        Some(row) => Ok(Some(RawRow::read(&row, 0)?)),
        None => Ok(None),
    }
}

/// Reject content that `RawRow::validate` would later refuse to read back.
fn validate_input(content: &ProcessedContent) -> Result<(), StoreError> {
    if content.id != content.url {
        return Err(StoreError::InvalidInput(format!(
            "id {:?} does not match url {:?}",
            content.id, content.url
        )));
    }
    if content.content_hash != content_hash(&content.content) {
        return Err(StoreError::InvalidInput(format!(
            "content_hash {:?} does not match content",
            content.content_hash
        )));
    }
    match canonicalize(&content.url) {
        Ok(canonical) if canonical.as_str() == content.url => Ok(()),
        Ok(canonical) => Err(StoreError::InvalidInput(format!(
            "url {:?} is not canonical (expected {canonical})",
            content.url
        ))),
        Err(e) => Err(StoreError::InvalidInput(e.to_string())),
    }
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::IoFailure(format!("invalid timestamp {s:?}: {e}")))
}

fn query_hash(query: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(query.trim().as_bytes());
    format!("{:x}", hasher.finalize())
}
