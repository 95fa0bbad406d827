//! Test doubles shared by the core tests.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use contentpipe_retrieval::{Fetcher, FetcherError, RawResource, RetrievalAgent};
use contentpipe_shared::{CanonicalUrl, ContentType, ProcessedContent, StoreConfig, canonicalize};
use contentpipe_storage::ContentStore;
use uuid::Uuid;

use crate::analysis::{Summarizer, SummarizerError};

/// Create a temp file store for testing.
pub async fn test_store() -> ContentStore {
    let tmp = std::env::temp_dir().join(format!("cp_core_test_{}.db", Uuid::now_v7()));
    ContentStore::open(&tmp, &StoreConfig::default())
        .await
        .expect("open test db")
}

pub fn page(url: &str, body: &str) -> ProcessedContent {
    ProcessedContent::new(
        &canonicalize(url).unwrap(),
        "Title",
        ContentType::Webpage,
        body,
        BTreeMap::new(),
    )
}

pub fn text(body: &str) -> Result<RawResource, FetcherError> {
    Ok(RawResource::new(body, Some("text/plain")))
}

#[derive(Default)]
struct UrlScript {
    queue: VecDeque<Result<RawResource, FetcherError>>,
    /// Replayed once the queue is empty.
    fallback: Option<Result<RawResource, FetcherError>>,
}

/// Fetcher that replays scripted responses per URL and counts calls.
#[derive(Default)]
pub struct ScriptedFetcher {
    scripts: Mutex<HashMap<String, UrlScript>>,
    calls: Mutex<HashMap<String, usize>>,
    delay: Mutex<Duration>,
    in_flight: Mutex<HashMap<String, usize>>,
    max_in_flight_same_url: AtomicUsize,
    max_in_flight_total: AtomicUsize,
    total_in_flight: AtomicUsize,
}

impl ScriptedFetcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue `responses` for `url`; the last one repeats forever.
    pub fn script(&self, url: &str, responses: Vec<Result<RawResource, FetcherError>>) {
        let key = canonicalize(url).unwrap().to_string();
        let mut scripts = self.scripts.lock().unwrap();
        let entry = scripts.entry(key).or_default();
        entry.fallback = responses.last().cloned();
        entry.queue.extend(responses);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn calls(&self, url: &str) -> usize {
        let key = canonicalize(url).unwrap().to_string();
        self.calls.lock().unwrap().get(&key).copied().unwrap_or(0)
    }

    /// Highest number of simultaneous fetches seen for any single URL.
    pub fn max_in_flight_same_url(&self) -> usize {
        self.max_in_flight_same_url.load(Ordering::SeqCst)
    }

    pub fn max_in_flight_total(&self) -> usize {
        self.max_in_flight_total.load(Ordering::SeqCst)
    }

    pub fn agent(self: &Arc<Self>) -> RetrievalAgent {
        RetrievalAgent::new(self.clone(), Duration::from_secs(5))
    }
}

#[async_trait::async_trait]
impl Fetcher for ScriptedFetcher {
    async fn fetch(&self, url: &CanonicalUrl) -> Result<RawResource, FetcherError> {
        let key = url.to_string();
        *self.calls.lock().unwrap().entry(key.clone()).or_default() += 1;

        {
            let mut in_flight = self.in_flight.lock().unwrap();
            let n = in_flight.entry(key.clone()).or_default();
            *n += 1;
            self.max_in_flight_same_url.fetch_max(*n, Ordering::SeqCst);
        }
        let total = self.total_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight_total.fetch_max(total, Ordering::SeqCst);

        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let response = {
            let mut scripts = self.scripts.lock().unwrap();
            match scripts.get_mut(&key) {
                Some(script) => script
                    .queue
                    .pop_front()
                    .or_else(|| script.fallback.clone())
                    .unwrap_or_else(|| Err(FetcherError::Unreachable("script exhausted".into()))),
                None => Err(FetcherError::Unreachable(format!("no script for {key}"))),
            }
        };

        *self.in_flight.lock().unwrap().get_mut(&key).unwrap() -= 1;
        self.total_in_flight.fetch_sub(1, Ordering::SeqCst);
        response
    }
}

/// Summarizer returning a canned answer, or failing when `fail` is set.
pub struct StubSummarizer {
    pub fail: bool,
    pub calls: AtomicUsize,
    delay: Duration,
}

impl StubSummarizer {
    pub fn new(fail: bool) -> Arc<Self> {
        Arc::new(Self {
            fail,
            calls: AtomicUsize::new(0),
            delay: Duration::ZERO,
        })
    }

    /// Succeeds after sleeping `delay`.
    pub fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            fail: false,
            calls: AtomicUsize::new(0),
            delay,
        })
    }
}

#[async_trait::async_trait]
impl Summarizer for StubSummarizer {
    async fn summarize(&self, text: &str, query: &str) -> Result<String, SummarizerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.fail {
            return Err(SummarizerError("model offline".into()));
        }
        Ok(format!("{query}: {} words", text.split_whitespace().count()))
    }

    fn model(&self) -> &str {
        "stub"
    }
}
