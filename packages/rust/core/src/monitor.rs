//! MonitorAgent: periodic re-fetch of indexed URLs and change detection.
//!
//! Each URL cycles `Idle -> Fetching -> Idle`. A fetch that yields a different
//! content hash than the stored row re-indexes the content, appends to the
//! change log, and emits a [`ChangeEvent`]. Failed fetches back off for a
//! growing number of cycles; after `suspect_threshold` consecutive failures
//! the URL is reported as suspect but still polled.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use futures_util::Stream;
use futures_util::stream::{self, BoxStream};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument, warn};

use contentpipe_retrieval::RetrievalAgent;
use contentpipe_shared::{CanonicalUrl, ChangeEvent, MonitorConfig, UrlCollection};

use crate::UrlLocks;
use crate::indexer::IndexerAgent;

/// Where a URL is in the monitoring cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchState {
    Idle,
    Fetching,
    /// Recent failures; skipping some cycles before the next attempt.
    Backoff { failures: u32 },
    /// `failures` consecutive failures at or above the suspect threshold.
    Suspect { failures: u32 },
}

#[derive(Debug, Clone)]
struct Tracker {
    state: WatchState,
    failures: u32,
    skip_cycles: u32,
}

impl Default for Tracker {
    fn default() -> Self {
        Self {
            state: WatchState::Idle,
            failures: 0,
            skip_cycles: 0,
        }
    }
}

#[derive(Clone)]
pub struct MonitorAgent {
    retrieval: RetrievalAgent,
    indexer: IndexerAgent,
    locks: Arc<UrlLocks>,
    config: MonitorConfig,
}

impl MonitorAgent {
    /// `locks` must be the same lock domain the orchestrator writes under.
    pub fn new(
        retrieval: RetrievalAgent,
        indexer: IndexerAgent,
        locks: Arc<UrlLocks>,
        config: MonitorConfig,
    ) -> Self {
        Self {
            retrieval,
            indexer,
            locks,
            config,
        }
    }

    /// Infinite stream of changes for `collection`'s URLs.
    ///
    /// Nothing is fetched until the stream is polled. Each call starts with
    /// fresh per-URL state; dropping the stream stops monitoring.
    pub fn watch(&self, collection: &UrlCollection) -> Watch {
        let trackers: Arc<DashMap<CanonicalUrl, Tracker>> = Arc::new(DashMap::new());
        let urls: Vec<CanonicalUrl> = collection.urls().cloned().collect();
        info!(collection = %collection.id, urls = urls.len(), "starting watch");

        let state = WatchLoop {
            agent: self.clone(),
            trackers: trackers.clone(),
            urls,
            cursor: 0,
            ticker: None,
        };
        let events = stream::unfold(state, |mut lp| async move {
            let event = lp.next_event().await;
            Some((event, lp))
        });

        Watch {
            events: Box::pin(events),
            trackers,
        }
    }

    /// One pass over `collection`; returns the changes it found.
    #[instrument(skip_all, fields(collection = %collection.id))]
    pub async fn check_once(&self, collection: &UrlCollection) -> Vec<ChangeEvent> {
        let trackers = DashMap::new();
        let mut events = Vec::new();
        for url in collection.urls() {
            if let Some(event) = self.check_url(url, &trackers).await {
                events.push(event);
            }
        }
        events
    }

    async fn check_url(
        &self,
        url: &CanonicalUrl,
        trackers: &DashMap<CanonicalUrl, Tracker>,
    ) -> Option<ChangeEvent> {
        {
            let mut tracker = trackers.entry(url.clone()).or_default();
            if tracker.skip_cycles > 0 {
                tracker.skip_cycles -= 1;
                debug!(%url, remaining = tracker.skip_cycles, "in backoff, skipping");
                return None;
            }
        }

        let _guard = self.locks.lock(url.as_str()).await;

        let previous = match self.indexer.get(url.as_str()).await {
            Ok(Some(content)) => content,
            Ok(None) => {
                debug!(%url, "not indexed yet, skipping");
                return None;
            }
            Err(e) => {
                warn!(%url, error = %e, "could not read stored content");
                return None;
            }
        };

        set_state(trackers, url, WatchState::Fetching);
        let fetched = match self.retrieval.fetch_canonical(url).await {
            Ok(content) => content,
            Err(e) => {
                self.record_failure(trackers, url, &e.to_string());
                return None;
            }
        };

        if let Some(mut tracker) = trackers.get_mut(url) {
            tracker.failures = 0;
            tracker.state = WatchState::Idle;
        }

        let changed = fetched.content_hash != previous.content_hash;
        if let Err(e) = self.indexer.index(&fetched).await {
            // The stored hash is still the old one, so the change is seen again next cycle.
            warn!(%url, error = %e, "re-index failed");
            return None;
        }
        if !changed {
            debug!(%url, "unchanged");
            return None;
        }

        let event = ChangeEvent {
            url: url.clone(),
            previous_hash: previous.content_hash,
            new_hash: fetched.content_hash,
            detected_at: Utc::now(),
        };
        if let Err(e) = self.indexer.store().append_change_event(&event).await {
            warn!(%url, error = %e, "failed to append change event");
        }
        info!(%url, previous = %event.previous_hash, new = %event.new_hash, "content changed");
        Some(event)
    }

    fn record_failure(&self, trackers: &DashMap<CanonicalUrl, Tracker>, url: &CanonicalUrl, reason: &str) {
        let mut tracker = trackers.entry(url.clone()).or_default();
        tracker.failures += 1;
        let failures = tracker.failures;
        tracker.skip_cycles = backoff_cycles(failures, self.config.max_backoff_cycles);

        if failures >= self.config.suspect_threshold {
            warn!(%url, failures, %reason, "URL is suspect");
            tracker.state = WatchState::Suspect { failures };
        } else {
            debug!(%url, failures, %reason, "fetch failed, backing off");
            tracker.state = WatchState::Backoff { failures };
        }
    }
}

/// Cycles to skip after `failures` consecutive failures: 1, 2, 4, ... capped.
fn backoff_cycles(failures: u32, max: u32) -> u32 {
    if failures == 0 {
        return 0;
    }
    2u32.saturating_pow(failures - 1).min(max)
}

fn set_state(trackers: &DashMap<CanonicalUrl, Tracker>, url: &CanonicalUrl, state: WatchState) {
    trackers.entry(url.clone()).or_default().state = state;
}

// ---------------------------------------------------------------------------
// Watch stream
// ---------------------------------------------------------------------------

/// `tokio::time::interval` rejects a zero period.
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

struct WatchLoop {
    agent: MonitorAgent,
    trackers: Arc<DashMap<CanonicalUrl, Tracker>>,
    urls: Vec<CanonicalUrl>,
    cursor: usize,
    ticker: Option<tokio::time::Interval>,
}

impl WatchLoop {
    async fn next_event(&mut self) -> ChangeEvent {
        loop {
            if self.cursor == 0 {
                // Created on first poll so the first cycle runs immediately.
                let period = self.agent.config.poll_interval().max(MIN_POLL_INTERVAL);
                let ticker = self.ticker.get_or_insert_with(|| {
                    let mut t = tokio::time::interval(period);
                    t.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    t
                });
                ticker.tick().await;
            }
            if self.urls.is_empty() {
                continue;
            }

            let url = self.urls[self.cursor].clone();
            self.cursor = (self.cursor + 1) % self.urls.len();
            if let Some(event) = self.agent.check_url(&url, &self.trackers).await {
                return event;
            }
        }
    }
}

/// Stream of [`ChangeEvent`]s returned by [`MonitorAgent::watch`].
pub struct Watch {
    events: BoxStream<'static, ChangeEvent>,
    trackers: Arc<DashMap<CanonicalUrl, Tracker>>,
}

impl Watch {
    /// Current state of `url`, once it has been visited.
    pub fn state(&self, url: &CanonicalUrl) -> Option<WatchState> {
        self.trackers.get(url).map(|t| t.state.clone())
    }

    /// URLs currently flagged suspect.
    pub fn suspects(&self) -> Vec<CanonicalUrl> {
        let mut urls: Vec<CanonicalUrl> = self
            .trackers
            .iter()
            .filter(|t| matches!(t.state, WatchState::Suspect { .. }))
            .map(|t| t.key().clone())
            .collect();
        urls.sort();
        urls
    }
}

impl Stream for Watch {
    type Item = ChangeEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.events.as_mut().poll_next(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use contentpipe_retrieval::FetcherError;
    use futures_util::StreamExt;

    use crate::testing::{ScriptedFetcher, test_store, text};

    const URL: &str = "https://example.com/page";

    fn config() -> MonitorConfig {
        MonitorConfig {
            poll_interval_ms: 10,
            suspect_threshold: 3,
            max_backoff_cycles: 4,
        }
    }

    async fn setup(fetcher: &Arc<ScriptedFetcher>) -> (MonitorAgent, UrlCollection) {
        let indexer = IndexerAgent::new(test_store().await);
        let monitor = MonitorAgent::new(
            fetcher.agent(),
            indexer,
            Arc::new(UrlLocks::new()),
            config(),
        );
        let mut collection = UrlCollection::new("watched");
        collection.insert(contentpipe_shared::UrlEntry::new(
            contentpipe_shared::canonicalize(URL).unwrap(),
        ));
        (monitor, collection)
    }

    async fn seed(monitor: &MonitorAgent, body: &str) -> String {
        let content = monitor.retrieval.fetch(URL).await.unwrap();
        assert!(content.content.contains(body));
        monitor.indexer.index(&content).await.unwrap();
        content.content_hash
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let cycles: Vec<u32> = (0..=6).map(|f| backoff_cycles(f, 8)).collect();
        assert_eq!(cycles, vec![0, 1, 2, 4, 8, 8, 8]);
    }

    #[tokio::test]
    async fn unchanged_content_emits_nothing() {
        let fetcher = ScriptedFetcher::new();
        fetcher.script(URL, vec![text("same body")]);
        let (monitor, collection) = setup(&fetcher).await;
        seed(&monitor, "same body").await;

        assert!(monitor.check_once(&collection).await.is_empty());
        assert!(monitor.check_once(&collection).await.is_empty());
        assert!(monitor.indexer.store().change_events(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn whitespace_only_difference_is_not_a_change() {
        let fetcher = ScriptedFetcher::new();
        fetcher.script(URL, vec![text("alpha beta"), text("alpha   beta\r\n")]);
        let (monitor, collection) = setup(&fetcher).await;
        seed(&monitor, "alpha beta").await;

        assert!(monitor.check_once(&collection).await.is_empty());
    }

    #[tokio::test]
    async fn unindexed_urls_are_skipped() {
        let fetcher = ScriptedFetcher::new();
        fetcher.script(URL, vec![text("body")]);
        let (monitor, collection) = setup(&fetcher).await;

        assert!(monitor.check_once(&collection).await.is_empty());
        assert_eq!(fetcher.calls(URL), 0);
    }

    #[tokio::test]
    async fn second_poll_reports_change_once() {
        let fetcher = ScriptedFetcher::new();
        fetcher.script(URL, vec![text("version one"), text("version one"), text("version two")]);
        let (monitor, collection) = setup(&fetcher).await;
        let h1 = seed(&monitor, "version one").await;

        let mut watch = monitor.watch(&collection);
        let event = tokio::time::timeout(Duration::from_secs(5), watch.next())
            .await
            .expect("change within timeout")
            .expect("stream is infinite");

        assert_eq!(event.url.as_str(), URL);
        assert_eq!(event.previous_hash, h1);
        assert_ne!(event.new_hash, h1);
        // Poll 1 saw the old content, poll 2 the new.
        assert_eq!(fetcher.calls(URL), 3);

        let stored = monitor.indexer.get(URL).await.unwrap().unwrap();
        assert_eq!(stored.content_hash, event.new_hash);
        assert_eq!(
            monitor.indexer.store().change_events(Some(URL)).await.unwrap(),
            vec![event]
        );

        // Version two repeats from here on: no further events.
        let next = tokio::time::timeout(Duration::from_millis(200), watch.next()).await;
        assert!(next.is_err());
        let url = collection.urls().next().unwrap();
        assert_eq!(watch.state(url), Some(WatchState::Idle));
    }

    #[tokio::test]
    async fn repeated_failures_mark_suspect_and_keep_hash() {
        let fetcher = ScriptedFetcher::new();
        fetcher.script(
            URL,
            vec![
                text("stable"),
                Err(FetcherError::Unreachable("down".into())),
            ],
        );
        let (monitor, collection) = setup(&fetcher).await;
        let h1 = seed(&monitor, "stable").await;
        let url = collection.urls().next().unwrap().clone();

        let mut watch = monitor.watch(&collection);
        let waited = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if watch.state(&url).is_some_and(|s| matches!(s, WatchState::Suspect { .. })) {
                    break;
                }
                // Drive the stream; it never yields because nothing changes.
                let _ = tokio::time::timeout(Duration::from_millis(20), watch.next()).await;
            }
        })
        .await;
        assert!(waited.is_ok(), "URL should become suspect");
        assert_eq!(watch.suspects(), vec![url.clone()]);

        let stored = monitor.indexer.get(URL).await.unwrap().unwrap();
        assert_eq!(stored.content_hash, h1);
    }

    #[tokio::test]
    async fn zero_poll_interval_still_watches() {
        let fetcher = ScriptedFetcher::new();
        fetcher.script(URL, vec![text("first"), text("first"), text("second")]);
        let indexer = IndexerAgent::new(test_store().await);
        let monitor = MonitorAgent::new(
            fetcher.agent(),
            indexer,
            Arc::new(UrlLocks::new()),
            MonitorConfig {
                poll_interval_ms: 0,
                ..config()
            },
        );
        let (_, collection) = setup(&fetcher).await;
        seed(&monitor, "first").await;

        let mut watch = monitor.watch(&collection);
        let event = tokio::time::timeout(Duration::from_secs(5), watch.next())
            .await
            .expect("change within timeout")
            .expect("stream is infinite");
        assert_eq!(event.url.as_str(), URL);
    }

    #[tokio::test]
    async fn dropping_watch_stops_polling() {
        let fetcher = ScriptedFetcher::new();
        fetcher.script(URL, vec![text("body")]);
        let (monitor, collection) = setup(&fetcher).await;
        seed(&monitor, "body").await;

        let mut watch = monitor.watch(&collection);
        // Lazy: nothing fetched before the first poll.
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(fetcher.calls(URL), 1);

        let _ = tokio::time::timeout(Duration::from_millis(50), watch.next()).await;
        drop(watch);
        let after_drop = fetcher.calls(URL);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fetcher.calls(URL), after_drop);
        assert!(after_drop > 1);
    }
}
