//! Lazy, restartable full-text search over `contents`.

use std::collections::VecDeque;

use libsql::params;
use tracing::debug;

use contentpipe_shared::ProcessedContent;

use crate::row::{CONTENT_COLUMNS, RawRow};
use crate::{ContentStore, StoreError};

/// Pulls ranked search results one page at a time.
///
/// Nothing is queried until the first [`SearchCursor::next`]. Results are
/// ordered by FTS5 rank, ties broken by URL. Rows that fail validation are
/// quarantined and skipped.
#[derive(Debug)]
pub struct SearchCursor {
    store: ContentStore,
    query: String,
    match_expr: Option<String>,
    page_size: u32,
    offset: u32,
    buffer: VecDeque<ProcessedContent>,
    exhausted: bool,
}

impl SearchCursor {
    pub(crate) fn new(store: ContentStore, query: &str, page_size: u32) -> Self {
        let match_expr = build_match_expr(query);
        Self {
            store,
            query: query.to_string(),
            exhausted: match_expr.is_none(),
            match_expr,
            page_size,
            offset: 0,
            buffer: VecDeque::new(),
        }
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    /// Next result, or `None` once the result set is exhausted.
    pub async fn next(&mut self) -> Result<Option<ProcessedContent>, StoreError> {
        loop {
            if let Some(item) = self.buffer.pop_front() {
                return Ok(Some(item));
            }
            if self.exhausted {
                return Ok(None);
            }
            self.fetch_page().await?;
        }
    }

    /// Rewind to the first result. The next call re-runs the query.
    pub fn restart(&mut self) {
        self.offset = 0;
        self.buffer.clear();
        self.exhausted = self.match_expr.is_none();
    }

    /// Drain the remaining results.
    pub async fn collect_all(mut self) -> Result<Vec<ProcessedContent>, StoreError> {
        let mut results = Vec::new();
        while let Some(item) = self.next().await? {
            results.push(item);
        }
        Ok(results)
    }

    async fn fetch_page(&mut self) -> Result<(), StoreError> {
        let Some(match_expr) = self.match_expr.clone() else {
            self.exhausted = true;
            return Ok(());
        };

        let conn = self.store.connect()?;
        let sql = format!(
            "SELECT {CONTENT_COLUMNS}
             FROM contents_fts fts
             JOIN contents c ON c.rowid = fts.rowid
             WHERE contents_fts MATCH ?1
             ORDER BY rank, c.url
             LIMIT ?2 OFFSET ?3"
        );
        let mut rows = conn
            .query(&sql, params![match_expr, i64::from(self.page_size), i64::from(self.offset)])
            .await
            .map_err(StoreError::io)?;

        let mut fetched = 0u32;
        let mut corrupt = Vec::new();
        while let Some(row) = rows.next().await.map_err(StoreError::io)? {
            fetched += 1;
            let raw = RawRow::read(&row, 0)?;
            match raw.validate() {
                Ok(content) => self.buffer.push_back(content),
                Err(_) => corrupt.push(raw),
            }
        }
        drop(rows);

        // Quarantined rows leave the result set, so later pages shift down.
        let mut removed = 0u32;
        for raw in &corrupt {
            if self.store.recheck_and_quarantine(&conn, raw).await? {
                removed += 1;
            }
        }

        debug!(
            query = %self.query,
            offset = self.offset,
            fetched,
            removed,
            "search page"
        );

        self.offset += fetched - removed;
        if fetched < self.page_size {
            self.exhausted = true;
        }
        Ok(())
    }
}

/// Turn free text into an FTS5 expression: every term quoted, all required.
fn build_match_expr(query: &str) -> Option<String> {
    let terms: Vec<String> = query
        .split_whitespace()
        .map(|t| t.replace('"', ""))
        .filter(|t| !t.is_empty())
        .map(|t| format!("\"{t}\""))
        .collect();
    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" "))
    }
}
