//! IndexerAgent: the only writer of [`ProcessedContent`] rows.

use tracing::{debug, info, instrument};

use contentpipe_shared::ProcessedContent;
use contentpipe_storage::{ContentStore, SearchCursor, StoreError, UpsertOutcome};

/// What indexing did to the stored row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexStatus {
    Created,
    /// Content hash or fields changed.
    Updated { previous_hash: String },
    /// Identical content; only `last_processed` moved.
    Unchanged,
}

impl From<UpsertOutcome> for IndexStatus {
    fn from(outcome: UpsertOutcome) -> Self {
        match outcome {
            UpsertOutcome::Created => Self::Created,
            UpsertOutcome::Updated { previous_hash } => Self::Updated { previous_hash },
            UpsertOutcome::Unchanged => Self::Unchanged,
        }
    }
}

#[derive(Debug, Clone)]
pub struct IndexerAgent {
    store: ContentStore,
}

impl IndexerAgent {
    pub fn new(store: ContentStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &ContentStore {
        &self.store
    }

    /// Persist `content`, overwriting any previous row for its URL.
    #[instrument(skip_all, fields(url = %content.url))]
    pub async fn index(&self, content: &ProcessedContent) -> Result<IndexStatus, StoreError> {
        let status = IndexStatus::from(self.store.upsert(content).await?);
        match &status {
            IndexStatus::Created => info!(hash = %content.content_hash, "indexed new content"),
            IndexStatus::Updated { previous_hash } => info!(
                previous_hash = %previous_hash,
                hash = %content.content_hash,
                "re-indexed changed content"
            ),
            IndexStatus::Unchanged => debug!("content unchanged"),
        }
        Ok(status)
    }

    pub async fn get(&self, url: &str) -> Result<Option<ProcessedContent>, StoreError> {
        self.store.get(url).await
    }

    pub fn search(&self, query: &str) -> SearchCursor {
        self.store.search(query)
    }
}
