//! OrchestratorAgent: drives URLs through retrieval, indexing, and optional
//! analysis.
//!
//! Every write for a URL happens under that URL's lock from the shared
//! [`UrlLocks`] domain, so concurrent `fetch_and_index` calls (and the
//! monitor) queue FIFO instead of racing. Distinct URLs never wait on each
//! other; a global semaphore only bounds the total number of fetches.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use contentpipe_retrieval::{FetchError, RetrievalAgent};
use contentpipe_shared::{
    CanonicalUrl, MonitorConfig, OrchestratorConfig, ProcessedContent, RetryConfig, UrlCollection,
    UrlEntry, canonicalize,
};
use contentpipe_storage::{SearchCursor, StoreError};

use crate::UrlLocks;
use crate::analysis::{AnalysisAgent, AnalysisError};
use crate::exporter::{ExportError, ExporterAgent};
use crate::indexer::{IndexStatus, IndexerAgent};
use crate::monitor::MonitorAgent;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Processing state of a URL within this orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UrlState {
    Queued,
    Fetching,
    /// Waiting out the backoff before attempt number `attempt`.
    Retrying { attempt: u32 },
    Indexing,
    Done,
    Failed { reason: String },
}

/// Result of a successful `fetch_and_index`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexOutcome {
    pub url: CanonicalUrl,
    pub content_hash: String,
    /// Fetch attempts made, including the successful one.
    pub attempts: u32,
    pub status: IndexStatus,
}

#[derive(Debug, thiserror::Error)]
pub enum OrchestrationError {
    #[error("{url} is already in collection {collection:?}")]
    DuplicateUrl { collection: String, url: String },

    #[error("invalid URL {input:?}: {reason}")]
    InvalidUrl { input: String, reason: String },

    #[error("unknown collection {0:?}")]
    UnknownCollection(String),

    #[error("{0} has not been indexed")]
    NotIndexed(String),

    #[error("retrieval of {url} failed after {attempts} attempt(s): {source}")]
    RetrievalFailed {
        url: String,
        attempts: u32,
        #[source]
        source: FetchError,
    },

    #[error("indexing {url} failed: {source}")]
    IndexFailed {
        url: String,
        #[source]
        source: StoreError,
    },

    #[error(transparent)]
    Analysis(#[from] AnalysisError),

    #[error(transparent)]
    Export(#[from] ExportError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

fn invalid_url(input: &str, reason: impl ToString) -> OrchestrationError {
    OrchestrationError::InvalidUrl {
        input: input.to_string(),
        reason: reason.to_string(),
    }
}

// ---------------------------------------------------------------------------
// OrchestratorAgent
// ---------------------------------------------------------------------------

struct Inner {
    retrieval: RetrievalAgent,
    indexer: IndexerAgent,
    analysis: Option<AnalysisAgent>,
    /// Query for automatic post-index analysis; `None` disables it.
    auto_query: Option<String>,
    exporter: ExporterAgent,
    locks: Arc<UrlLocks>,
    fetch_slots: Semaphore,
    retry: RetryConfig,
    collections: RwLock<HashMap<String, UrlCollection>>,
    states: DashMap<CanonicalUrl, UrlState>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Assembles an [`OrchestratorAgent`]. Stages are fixed once built.
pub struct OrchestratorBuilder {
    retrieval: RetrievalAgent,
    indexer: IndexerAgent,
    max_concurrent_fetches: usize,
    retry: RetryConfig,
    analysis: Option<AnalysisAgent>,
    auto_query: Option<String>,
}

impl OrchestratorBuilder {
    pub fn config(mut self, config: &OrchestratorConfig) -> Self {
        self.max_concurrent_fetches = config.max_concurrent_fetches;
        self
    }

    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Attach an analysis stage. With `auto_query` set, every successful
    /// index is followed by a best-effort summary for that query.
    pub fn analysis(mut self, analysis: AnalysisAgent, auto_query: Option<String>) -> Self {
        self.analysis = Some(analysis);
        self.auto_query = auto_query;
        self
    }

    pub fn build(self) -> OrchestratorAgent {
        OrchestratorAgent {
            inner: Arc::new(Inner {
                retrieval: self.retrieval,
                indexer: self.indexer,
                analysis: self.analysis,
                auto_query: self.auto_query,
                exporter: ExporterAgent,
                locks: Arc::new(UrlLocks::new()),
                fetch_slots: Semaphore::new(self.max_concurrent_fetches.max(1)),
                retry: self.retry,
                collections: RwLock::new(HashMap::new()),
                states: DashMap::new(),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }
}

#[derive(Clone)]
pub struct OrchestratorAgent {
    inner: Arc<Inner>,
}

impl OrchestratorAgent {
    pub fn new(
        retrieval: RetrievalAgent,
        indexer: IndexerAgent,
        config: &OrchestratorConfig,
        retry: RetryConfig,
    ) -> Self {
        Self::builder(retrieval, indexer).config(config).retry(retry).build()
    }

    pub fn builder(retrieval: RetrievalAgent, indexer: IndexerAgent) -> OrchestratorBuilder {
        OrchestratorBuilder {
            retrieval,
            indexer,
            max_concurrent_fetches: OrchestratorConfig::default().max_concurrent_fetches,
            retry: RetryConfig::default(),
            analysis: None,
            auto_query: None,
        }
    }

    /// The lock domain shared with [`MonitorAgent`]s built by [`Self::monitor`].
    pub fn locks(&self) -> &Arc<UrlLocks> {
        &self.inner.locks
    }

    pub fn indexer(&self) -> &IndexerAgent {
        &self.inner.indexer
    }

    /// A monitor that writes under this orchestrator's URL locks.
    pub fn monitor(&self, config: MonitorConfig) -> MonitorAgent {
        MonitorAgent::new(
            self.inner.retrieval.clone(),
            self.inner.indexer.clone(),
            self.inner.locks.clone(),
            config,
        )
    }

    // -----------------------------------------------------------------------
    // Collections
    // -----------------------------------------------------------------------

    /// Reload collections persisted by earlier runs. Returns how many were loaded.
    pub async fn restore(&self) -> Result<usize, OrchestrationError> {
        let loaded = self.inner.indexer.store().load_collections().await?;
        let count = loaded.len();
        let mut collections = self.inner.collections.write().await;
        for collection in loaded {
            collections.insert(collection.id.clone(), collection);
        }
        info!(count, "restored collections");
        Ok(count)
    }

    /// Create an empty collection. Existing collections are left untouched.
    pub async fn create_collection(&self, id: &str) -> Result<(), OrchestrationError> {
        let mut collections = self.inner.collections.write().await;
        if collections.contains_key(id) {
            return Ok(());
        }
        self.inner.indexer.store().save_collection(id).await?;
        collections.insert(id.to_string(), UrlCollection::new(id));
        Ok(())
    }

    /// Add `urls` to `collection` (created if missing) and schedule their
    /// first retrieval in the background.
    ///
    /// The batch is validated as a whole: one malformed or duplicate URL,
    /// including a repeat within the batch, rejects all of them.
    #[instrument(skip_all, fields(collection = %collection))]
    pub async fn add_urls<I, S>(
        &self,
        collection: &str,
        urls: I,
    ) -> Result<Vec<CanonicalUrl>, OrchestrationError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut collections = self.inner.collections.write().await;
        let existing = collections.get(collection);

        let mut accepted = Vec::new();
        let mut seen = HashSet::new();
        for input in urls {
            let input = input.as_ref();
            let url = canonicalize(input).map_err(|e| invalid_url(input, e))?;
            if existing.is_some_and(|c| c.contains(&url)) || !seen.insert(url.clone()) {
                return Err(OrchestrationError::DuplicateUrl {
                    collection: collection.to_string(),
                    url: url.to_string(),
                });
            }
            accepted.push(url);
        }

        let store = self.inner.indexer.store();
        store.save_collection(collection).await?;
        let entries: Vec<UrlEntry> = accepted.iter().cloned().map(UrlEntry::new).collect();
        for (i, entry) in entries.iter().enumerate() {
            if let Err(e) = store.save_collection_entry(collection, entry).await {
                for saved in &entries[..i] {
                    if let Err(undo) = store.delete_collection_entry(collection, &saved.url).await {
                        warn!(url = %saved.url, error = %undo, "failed to roll back collection entry");
                    }
                }
                return Err(e.into());
            }
        }

        let target = collections
            .entry(collection.to_string())
            .or_insert_with(|| UrlCollection::new(collection));
        for entry in entries {
            target.insert(entry);
        }
        drop(collections);

        info!(count = accepted.len(), "urls added");
        for url in &accepted {
            self.schedule(url.clone()).await;
        }
        Ok(accepted)
    }

    /// Remove `url` from `collection`. Indexed content stays in the store.
    pub async fn remove_url(&self, collection: &str, url: &str) -> Result<bool, OrchestrationError> {
        let url = canonicalize(url).map_err(|e| invalid_url(url, e))?;
        let mut collections = self.inner.collections.write().await;
        let target = collections
            .get_mut(collection)
            .ok_or_else(|| OrchestrationError::UnknownCollection(collection.to_string()))?;
        if !target.contains(&url) {
            return Ok(false);
        }
        self.inner
            .indexer
            .store()
            .delete_collection_entry(collection, &url)
            .await?;
        target.remove(&url);
        Ok(true)
    }

    /// Replace the tags of `url` in `collection`.
    pub async fn set_tags(
        &self,
        collection: &str,
        url: &str,
        tags: BTreeSet<String>,
    ) -> Result<bool, OrchestrationError> {
        let url = canonicalize(url).map_err(|e| invalid_url(url, e))?;
        let mut collections = self.inner.collections.write().await;
        let target = collections
            .get_mut(collection)
            .ok_or_else(|| OrchestrationError::UnknownCollection(collection.to_string()))?;
        let Some(mut entry) = target.get(&url).cloned() else {
            return Ok(false);
        };
        entry.tags = tags.clone();
        self.inner
            .indexer
            .store()
            .save_collection_entry(collection, &entry)
            .await?;
        Ok(target.set_tags(&url, tags))
    }

    /// Snapshot of a collection.
    pub async fn collection(&self, id: &str) -> Result<UrlCollection, OrchestrationError> {
        self.inner
            .collections
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| OrchestrationError::UnknownCollection(id.to_string()))
    }

    pub async fn collection_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.collections.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Last known processing state of `url` in this process.
    pub fn status(&self, url: &str) -> Option<UrlState> {
        let url = canonicalize(url).ok()?;
        self.inner.states.get(&url).map(|s| s.clone())
    }

    // -----------------------------------------------------------------------
    // Retrieval + indexing
    // -----------------------------------------------------------------------

    async fn schedule(&self, url: CanonicalUrl) {
        self.set_state(&url, UrlState::Queued);
        let this = self.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = this.fetch_and_index_canonical(&url).await {
                warn!(%url, error = %e, "background retrieval failed");
            }
        });

        let mut tasks = self.inner.tasks.lock().await;
        tasks.retain(|t| !t.is_finished());
        tasks.push(handle);
    }

    /// Wait for every scheduled background retrieval to finish.
    pub async fn wait_idle(&self) {
        loop {
            let pending: Vec<JoinHandle<()>> = std::mem::take(&mut *self.inner.tasks.lock().await);
            if pending.is_empty() {
                return;
            }
            for handle in pending {
                if let Err(e) = handle.await {
                    warn!(error = %e, "retrieval task panicked");
                }
            }
        }
    }

    /// Fetch `url` and index the result, retrying transient failures.
    pub async fn fetch_and_index(&self, url: &str) -> Result<IndexOutcome, OrchestrationError> {
        let url = canonicalize(url).map_err(|e| invalid_url(url, e))?;
        self.fetch_and_index_canonical(&url).await
    }

    #[instrument(skip_all, fields(url = %url))]
    pub async fn fetch_and_index_canonical(
        &self,
        url: &CanonicalUrl,
    ) -> Result<IndexOutcome, OrchestrationError> {
        self.set_state(url, UrlState::Queued);
        let guard = self.inner.locks.lock(url.as_str()).await;
        debug!("acquired url lock");

        let (content, attempts) = self.fetch_with_retry(url).await?;

        self.set_state(url, UrlState::Indexing);
        let status = match self.inner.indexer.index(&content).await {
            Ok(status) => status,
            Err(e) => {
                self.set_state(url, UrlState::Failed { reason: e.to_string() });
                return Err(OrchestrationError::IndexFailed {
                    url: url.to_string(),
                    source: e,
                });
            }
        };
        self.set_state(url, UrlState::Done);
        drop(guard);

        if let Some(query) = &self.inner.auto_query {
            if let Err(e) = self.summarize_cached(&content, query).await {
                warn!(error = %e, "post-index analysis failed");
            }
        }

        Ok(IndexOutcome {
            url: url.clone(),
            content_hash: content.content_hash,
            attempts,
            status,
        })
    }

    async fn fetch_with_retry(
        &self,
        url: &CanonicalUrl,
    ) -> Result<(ProcessedContent, u32), OrchestrationError> {
        let max_attempts = self.inner.retry.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            self.set_state(url, UrlState::Fetching);

            let result = {
                // The semaphore is never closed, so acquire only fails if it is.
                let _permit = self.inner.fetch_slots.acquire().await.ok();
                self.inner.retrieval.fetch_canonical(url).await
            };

            match result {
                Ok(content) => {
                    if attempt > 1 {
                        info!(attempt, "retrieval succeeded after retry");
                    }
                    return Ok((content, attempt));
                }
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    let delay = self.inner.retry.delay_for(attempt);
                    warn!(
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient retrieval failure, backing off"
                    );
                    self.set_state(url, UrlState::Retrying { attempt: attempt + 1 });
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    warn!(attempt, retryable = e.is_retryable(), error = %e, "retrieval failed");
                    self.set_state(url, UrlState::Failed { reason: e.to_string() });
                    return Err(OrchestrationError::RetrievalFailed {
                        url: url.to_string(),
                        attempts: attempt,
                        source: e,
                    });
                }
            }
        }
    }

    fn set_state(&self, url: &CanonicalUrl, state: UrlState) {
        debug!(%url, ?state, "state change");
        self.inner.states.insert(url.clone(), state);
    }

    // -----------------------------------------------------------------------
    // Analysis, export, search
    // -----------------------------------------------------------------------

    /// Summarize the stored content of `url`, serving repeats from the cache.
    pub async fn analyze(&self, url: &str, query: &str) -> Result<String, OrchestrationError> {
        let content = self.stored(url).await?;
        Ok(self.summarize_cached(&content, query).await?)
    }

    async fn summarize_cached(
        &self,
        content: &ProcessedContent,
        query: &str,
    ) -> Result<String, AnalysisError> {
        let Some(analysis) = &self.inner.analysis else {
            return Err(AnalysisError::ModelUnavailable("analysis is not configured".into()));
        };
        let store = self.inner.indexer.store();
        let model = analysis.model();

        match store
            .get_analysis(&content.url, &content.content_hash, query, model)
            .await
        {
            Ok(Some(summary)) => {
                debug!(url = %content.url, "analysis cache hit");
                return Ok(summary);
            }
            Ok(None) => {}
            Err(e) => warn!(url = %content.url, error = %e, "analysis cache read failed"),
        }

        let summary = analysis.summarize(content, query).await?;
        if let Err(e) = store
            .put_analysis(&content.url, &content.content_hash, query, model, &summary)
            .await
        {
            warn!(url = %content.url, error = %e, "analysis cache write failed");
        }
        Ok(summary)
    }

    /// Export the stored content of `url`.
    pub async fn export(&self, url: &str, format: &str) -> Result<String, OrchestrationError> {
        let content = self.stored(url).await?;
        Ok(self.inner.exporter.export(&content, format)?)
    }

    /// Export every indexed URL of `collection`; unindexed URLs are skipped.
    pub async fn export_collection(
        &self,
        collection: &str,
        format: &str,
    ) -> Result<String, OrchestrationError> {
        let snapshot = self.collection(collection).await?;
        let mut contents = Vec::with_capacity(snapshot.len());
        for url in snapshot.urls() {
            if let Some(content) = self.inner.indexer.get(url.as_str()).await? {
                contents.push(content);
            }
        }
        Ok(self.inner.exporter.export_many(&contents, format)?)
    }

    pub fn search(&self, query: &str) -> SearchCursor {
        self.inner.indexer.search(query)
    }

    async fn stored(&self, url: &str) -> Result<ProcessedContent, OrchestrationError> {
        let canonical = canonicalize(url).map_err(|e| invalid_url(url, e))?;
        self.inner
            .indexer
            .get(canonical.as_str())
            .await?
            .ok_or_else(|| OrchestrationError::NotIndexed(canonical.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use contentpipe_retrieval::FetcherError;
    use contentpipe_shared::AnalysisConfig;
    use contentpipe_storage::ContentStore;

    use crate::testing::{ScriptedFetcher, StubSummarizer, test_store, text};

    const URL: &str = "https://example.com/doc";

    fn fast_retry(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            base_delay_ms: 1,
            max_delay_ms: 5,
            multiplier: 2.0,
        }
    }

    fn build(fetcher: &Arc<ScriptedFetcher>, store: ContentStore, slots: usize) -> OrchestratorAgent {
        OrchestratorAgent::new(
            fetcher.agent(),
            IndexerAgent::new(store),
            &OrchestratorConfig {
                max_concurrent_fetches: slots,
            },
            fast_retry(5),
        )
    }

    async fn orchestrator(fetcher: &Arc<ScriptedFetcher>) -> OrchestratorAgent {
        build(fetcher, test_store().await, 8)
    }

    fn unreachable() -> Result<contentpipe_retrieval::RawResource, FetcherError> {
        Err(FetcherError::Unreachable("connection refused".into()))
    }

    // -- collections --

    #[tokio::test]
    async fn duplicate_url_is_rejected_and_collection_unchanged() {
        let fetcher = ScriptedFetcher::new();
        fetcher.script(URL, vec![text("body")]);
        let orch = orchestrator(&fetcher).await;

        orch.add_urls("docs", [URL]).await.unwrap();
        let err = orch
            .add_urls("docs", ["HTTPS://Example.com/doc#intro"])
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestrationError::DuplicateUrl { ref url, .. } if url == URL));

        orch.wait_idle().await;
        assert_eq!(orch.collection("docs").await.unwrap().len(), 1);
        assert_eq!(fetcher.calls(URL), 1);
    }

    #[tokio::test]
    async fn batch_is_all_or_nothing() {
        let fetcher = ScriptedFetcher::new();
        let orch = orchestrator(&fetcher).await;
        orch.create_collection("docs").await.unwrap();

        let err = orch
            .add_urls("docs", ["https://a.example/1", "https://a.example/1/"])
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestrationError::DuplicateUrl { .. }));

        let err = orch
            .add_urls("docs", ["https://a.example/2", "ftp://a.example/file"])
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestrationError::InvalidUrl { .. }));

        assert!(orch.collection("docs").await.unwrap().is_empty());
        orch.wait_idle().await;
        assert_eq!(fetcher.calls("https://a.example/1"), 0);
        assert_eq!(fetcher.calls("https://a.example/2"), 0);
    }

    #[tokio::test]
    async fn added_urls_are_fetched_in_background() {
        let fetcher = ScriptedFetcher::new();
        fetcher.script("https://a.example/1", vec![text("first page")]);
        fetcher.script("https://a.example/2", vec![text("second page")]);
        let orch = orchestrator(&fetcher).await;

        let added = orch
            .add_urls("docs", ["https://a.example/1", "https://A.example/2"])
            .await
            .unwrap();
        assert_eq!(added[1].as_str(), "https://a.example/2");

        orch.wait_idle().await;
        assert_eq!(orch.status("https://a.example/1"), Some(UrlState::Done));
        assert_eq!(orch.status("https://a.example/2"), Some(UrlState::Done));
        assert_eq!(orch.indexer().store().count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn collections_survive_restart() {
        let fetcher = ScriptedFetcher::new();
        let store = test_store().await;

        let first = build(&fetcher, store.clone(), 8);
        first.add_urls("docs", [URL, "https://example.com/other"]).await.unwrap();
        first
            .set_tags("docs", URL, BTreeSet::from(["rust".to_string()]))
            .await
            .unwrap();
        assert!(first.remove_url("docs", "https://example.com/other").await.unwrap());
        first.wait_idle().await;

        let second = build(&fetcher, store, 8);
        assert_eq!(second.restore().await.unwrap(), 1);
        let docs = second.collection("docs").await.unwrap();
        assert_eq!(docs.len(), 1);
        let entry = docs.entries().first().unwrap();
        assert_eq!(entry.url.as_str(), URL);
        assert!(entry.tags.contains("rust"));
    }

    #[tokio::test]
    async fn unknown_collection_is_reported() {
        let fetcher = ScriptedFetcher::new();
        let orch = orchestrator(&fetcher).await;
        assert!(matches!(
            orch.collection("missing").await,
            Err(OrchestrationError::UnknownCollection(_))
        ));
        assert!(matches!(
            orch.remove_url("missing", URL).await,
            Err(OrchestrationError::UnknownCollection(_))
        ));
    }

    // -- retry policy --

    #[tokio::test]
    async fn transient_failures_then_success() {
        let fetcher = ScriptedFetcher::new();
        fetcher.script(
            URL,
            vec![unreachable(), unreachable(), unreachable(), text("finally")],
        );
        let orch = orchestrator(&fetcher).await;

        let outcome = orch.fetch_and_index(URL).await.unwrap();
        assert_eq!(outcome.attempts, 4);
        assert_eq!(outcome.status, IndexStatus::Created);
        assert_eq!(fetcher.calls(URL), 4);
        assert_eq!(orch.status(URL), Some(UrlState::Done));

        let stored = orch.indexer().get(URL).await.unwrap().unwrap();
        assert_eq!(stored.content_hash, outcome.content_hash);
        assert!(!orch.locks().is_locked(URL));
    }

    #[tokio::test]
    async fn blocked_fails_without_retry() {
        let fetcher = ScriptedFetcher::new();
        fetcher.script(URL, vec![Err(FetcherError::Blocked("HTTP 403".into()))]);
        let orch = orchestrator(&fetcher).await;

        let err = orch.fetch_and_index(URL).await.unwrap_err();
        assert!(matches!(
            err,
            OrchestrationError::RetrievalFailed {
                attempts: 1,
                source: FetchError::Blocked { .. },
                ..
            }
        ));
        assert_eq!(fetcher.calls(URL), 1);
        assert!(matches!(orch.status(URL), Some(UrlState::Failed { .. })));
        assert!(orch.indexer().get(URL).await.unwrap().is_none());
        assert!(!orch.locks().is_locked(URL));
    }

    #[tokio::test]
    async fn retries_stop_at_max_attempts() {
        let fetcher = ScriptedFetcher::new();
        fetcher.script(URL, vec![unreachable()]);
        let orch = OrchestratorAgent::new(
            fetcher.agent(),
            IndexerAgent::new(test_store().await),
            &OrchestratorConfig::default(),
            fast_retry(3),
        );

        let err = orch.fetch_and_index(URL).await.unwrap_err();
        assert!(matches!(err, OrchestrationError::RetrievalFailed { attempts: 3, .. }));
        assert_eq!(fetcher.calls(URL), 3);
    }

    #[tokio::test]
    async fn invalid_url_never_reaches_fetcher() {
        let fetcher = ScriptedFetcher::new();
        let orch = orchestrator(&fetcher).await;
        let err = orch.fetch_and_index("not a url").await.unwrap_err();
        assert!(matches!(err, OrchestrationError::InvalidUrl { .. }));
    }

    // -- locking --

    #[tokio::test]
    async fn waiting_for_the_url_lock_reports_queued() {
        let fetcher = ScriptedFetcher::new();
        fetcher.script(URL, vec![text("body")]);
        let orch = orchestrator(&fetcher).await;
        orch.fetch_and_index(URL).await.unwrap();
        assert_eq!(orch.status(URL), Some(UrlState::Done));

        let guard = orch.locks().lock(URL).await;
        let task = tokio::spawn({
            let orch = orch.clone();
            async move { orch.fetch_and_index(URL).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(orch.status(URL), Some(UrlState::Queued));

        drop(guard);
        task.await.unwrap().unwrap();
        assert_eq!(orch.status(URL), Some(UrlState::Done));
    }

    #[tokio::test]
    async fn same_url_is_mutually_exclusive() {
        let fetcher = ScriptedFetcher::new();
        fetcher.script(URL, vec![text("shared body")]);
        fetcher.set_delay(Duration::from_millis(30));
        let orch = orchestrator(&fetcher).await;

        let handles: Vec<_> = (0..5)
            .map(|_| {
                let orch = orch.clone();
                tokio::spawn(async move { orch.fetch_and_index(URL).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(fetcher.calls(URL), 5);
        assert_eq!(fetcher.max_in_flight_same_url(), 1);
        assert_eq!(orch.indexer().store().count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn distinct_urls_run_concurrently() {
        let fetcher = ScriptedFetcher::new();
        let urls: Vec<String> = (0..4).map(|i| format!("https://example.com/p{i}")).collect();
        for url in &urls {
            fetcher.script(url, vec![text(url)]);
        }
        fetcher.set_delay(Duration::from_millis(100));
        let orch = orchestrator(&fetcher).await;

        let handles: Vec<_> = urls
            .iter()
            .cloned()
            .map(|url| {
                let orch = orch.clone();
                tokio::spawn(async move { orch.fetch_and_index(&url).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(fetcher.max_in_flight_total(), 4);
    }

    #[tokio::test]
    async fn semaphore_bounds_total_fetches() {
        let fetcher = ScriptedFetcher::new();
        let urls: Vec<String> = (0..5).map(|i| format!("https://example.com/s{i}")).collect();
        for url in &urls {
            fetcher.script(url, vec![text(url)]);
        }
        fetcher.set_delay(Duration::from_millis(20));
        let orch = build(&fetcher, test_store().await, 2);

        orch.add_urls("docs", &urls).await.unwrap();
        orch.wait_idle().await;
        assert_eq!(fetcher.max_in_flight_total(), 2);
        assert_eq!(orch.indexer().store().count().await.unwrap(), 5);
    }

    #[tokio::test]
    async fn contenders_are_served_in_arrival_order() {
        let fetcher = ScriptedFetcher::new();
        fetcher.script(URL, vec![text("body")]);
        let orch = orchestrator(&fetcher).await;
        let order = Arc::new(StdMutex::new(Vec::new()));

        let held = orch.locks().lock(URL).await;
        let mut handles = Vec::new();
        for i in 0..3 {
            let orch = orch.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                orch.fetch_and_index(URL).await.unwrap();
                order.lock().unwrap().push(i);
            }));
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(fetcher.calls(URL), 0);

        drop(held);
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn repeated_indexing_is_idempotent() {
        let fetcher = ScriptedFetcher::new();
        fetcher.script(URL, vec![text("stable body")]);
        let orch = orchestrator(&fetcher).await;

        let first = orch.fetch_and_index(URL).await.unwrap();
        let second = orch.fetch_and_index(URL).await.unwrap();
        assert_eq!(first.status, IndexStatus::Created);
        assert_eq!(second.status, IndexStatus::Unchanged);
        assert_eq!(first.content_hash, second.content_hash);
        assert_eq!(orch.indexer().store().count().await.unwrap(), 1);
    }

    // -- analysis, export, search --

    async fn with_stub(
        fetcher: &Arc<ScriptedFetcher>,
        stub: Arc<StubSummarizer>,
        auto: Option<&str>,
    ) -> OrchestratorAgent {
        let agent = AnalysisAgent::new(stub, &AnalysisConfig::default());
        OrchestratorAgent::builder(fetcher.agent(), IndexerAgent::new(test_store().await))
            .retry(fast_retry(5))
            .analysis(agent, auto.map(str::to_string))
            .build()
    }

    #[tokio::test]
    async fn analysis_is_cached_per_content_and_query() {
        let fetcher = ScriptedFetcher::new();
        fetcher.script(URL, vec![text("one two three")]);
        let stub = StubSummarizer::new(false);
        let orch = with_stub(&fetcher, stub.clone(), None).await;

        assert!(matches!(
            orch.analyze(URL, "gist").await,
            Err(OrchestrationError::NotIndexed(_))
        ));

        orch.fetch_and_index(URL).await.unwrap();
        let first = orch.analyze(URL, "gist").await.unwrap();
        let again = orch.analyze(URL, "gist").await.unwrap();
        assert_eq!(first, again);
        assert_eq!(stub.calls.load(Ordering::SeqCst), 1);

        orch.analyze(URL, "other").await.unwrap();
        assert_eq!(stub.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failed_auto_analysis_keeps_indexed_content() {
        let fetcher = ScriptedFetcher::new();
        fetcher.script(URL, vec![text("body")]);
        let stub = StubSummarizer::new(true);
        let orch = with_stub(&fetcher, stub.clone(), Some("gist")).await;

        let outcome = orch.fetch_and_index(URL).await.unwrap();
        assert_eq!(outcome.status, IndexStatus::Created);
        assert_eq!(stub.calls.load(Ordering::SeqCst), 1);
        assert!(orch.indexer().get(URL).await.unwrap().is_some());
        assert_eq!(orch.status(URL), Some(UrlState::Done));
    }

    #[tokio::test]
    async fn url_lock_is_released_before_auto_analysis() {
        let fetcher = ScriptedFetcher::new();
        fetcher.script(URL, vec![text("body")]);
        let stub = StubSummarizer::slow(Duration::from_millis(300));
        let orch = with_stub(&fetcher, stub.clone(), Some("gist")).await;

        let task = tokio::spawn({
            let orch = orch.clone();
            async move { orch.fetch_and_index(URL).await }
        });
        tokio::time::timeout(Duration::from_secs(2), async {
            while stub.calls.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("analysis should start");

        assert!(!orch.locks().is_locked(URL));
        assert_eq!(orch.status(URL), Some(UrlState::Done));
        task.await.unwrap().unwrap();
        assert_eq!(stub.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn builder_stage_survives_clones() {
        let fetcher = ScriptedFetcher::new();
        fetcher.script(URL, vec![text("body")]);
        let stub = StubSummarizer::new(false);
        let orch = with_stub(&fetcher, stub.clone(), Some("gist")).await;

        let clone = orch.clone();
        clone.fetch_and_index(URL).await.unwrap();
        assert_eq!(stub.calls.load(Ordering::SeqCst), 1);

        // Served from the cache the automatic run filled.
        orch.analyze(URL, "gist").await.unwrap();
        assert_eq!(stub.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn analysis_without_summarizer_is_unavailable() {
        let fetcher = ScriptedFetcher::new();
        fetcher.script(URL, vec![text("body")]);
        let orch = orchestrator(&fetcher).await;
        orch.fetch_and_index(URL).await.unwrap();

        assert!(matches!(
            orch.analyze(URL, "gist").await,
            Err(OrchestrationError::Analysis(AnalysisError::ModelUnavailable(_)))
        ));
    }

    #[tokio::test]
    async fn export_round_trips_stored_content() {
        let fetcher = ScriptedFetcher::new();
        fetcher.script(URL, vec![text("exported body")]);
        let orch = orchestrator(&fetcher).await;
        orch.fetch_and_index(URL).await.unwrap();

        let json = orch.export(URL, "json").await.unwrap();
        let parsed: ProcessedContent = serde_json::from_str(&json).unwrap();
        assert_eq!(Some(parsed), orch.indexer().get(URL).await.unwrap());

        assert!(matches!(
            orch.export(URL, "yaml").await,
            Err(OrchestrationError::Export(ExportError::UnsupportedFormat(_)))
        ));
    }

    #[tokio::test]
    async fn export_collection_skips_unindexed() {
        let fetcher = ScriptedFetcher::new();
        fetcher.script("https://example.com/ok", vec![text("fine")]);
        fetcher.script(
            "https://example.com/gone",
            vec![Err(FetcherError::Blocked("HTTP 404".into()))],
        );
        let orch = orchestrator(&fetcher).await;
        orch.add_urls("docs", ["https://example.com/ok", "https://example.com/gone"])
            .await
            .unwrap();
        orch.wait_idle().await;

        let json = orch.export_collection("docs", "json").await.unwrap();
        let parsed: Vec<ProcessedContent> = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].url, "https://example.com/ok");
    }

    #[tokio::test]
    async fn search_finds_indexed_content() {
        let fetcher = ScriptedFetcher::new();
        fetcher.script(URL, vec![text("tokio runtime internals")]);
        let orch = orchestrator(&fetcher).await;
        orch.fetch_and_index(URL).await.unwrap();

        let hits = orch.search("runtime").collect_all().await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].url, URL);
    }
}
