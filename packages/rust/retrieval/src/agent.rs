//! RetrievalAgent: URL in, [`ProcessedContent`] out. Never touches the store.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, instrument, warn};

use contentpipe_shared::{CanonicalUrl, ProcessedContent, RetrievalConfig, canonicalize};

use crate::fetcher::{Fetcher, FetcherError};
use crate::handlers::HandlerRegistry;
use crate::http::HttpFetcher;

/// Why a retrieval failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    /// Not an absolute http(s) URL.
    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("{url} is unreachable: {reason}")]
    Unreachable { url: String, reason: String },

    #[error("{url} is blocked: {reason}")]
    Blocked { url: String, reason: String },

    #[error("{url} timed out after {after_ms} ms")]
    Timeout { url: String, after_ms: u64 },

    #[error("{url} has unsupported content ({content_type}): {reason}")]
    UnsupportedType {
        url: String,
        content_type: String,
        reason: String,
    },
}

impl FetchError {
    /// Whether a later attempt could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unreachable { .. } | Self::Timeout { .. })
    }
}

/// Fetches a URL through the [`Fetcher`] collaborator and normalizes it with
/// the first matching content handler.
#[derive(Clone)]
pub struct RetrievalAgent {
    fetcher: Arc<dyn Fetcher>,
    registry: Arc<HandlerRegistry>,
    timeout: Duration,
}

impl RetrievalAgent {
    pub fn new(fetcher: Arc<dyn Fetcher>, timeout: Duration) -> Self {
        Self {
            fetcher,
            registry: Arc::new(HandlerRegistry::new()),
            timeout,
        }
    }

    /// Agent backed by [`HttpFetcher`].
    pub fn from_config(config: &RetrievalConfig) -> Result<Self, FetcherError> {
        let fetcher = HttpFetcher::new(config)?;
        Ok(Self::new(Arc::new(fetcher), config.fetch_timeout()))
    }

    pub fn with_registry(mut self, registry: HandlerRegistry) -> Self {
        self.registry = Arc::new(registry);
        self
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// Fetch and process `url`.
    #[instrument(skip_all, fields(url = %url))]
    pub async fn fetch(&self, url: &str) -> Result<ProcessedContent, FetchError> {
        let canonical = canonicalize(url).map_err(|e| FetchError::InvalidUrl(e.to_string()))?;
        self.fetch_canonical(&canonical).await
    }

    pub async fn fetch_canonical(&self, url: &CanonicalUrl) -> Result<ProcessedContent, FetchError> {
        let resource = match tokio::time::timeout(self.timeout, self.fetcher.fetch(url)).await {
            Ok(Ok(resource)) => resource,
            Ok(Err(e)) => return Err(map_fetcher_error(url, e, self.timeout)),
            Err(_) => {
                warn!(%url, timeout_ms = self.timeout.as_millis() as u64, "fetch timed out");
                return Err(FetchError::Timeout {
                    url: url.to_string(),
                    after_ms: self.timeout.as_millis() as u64,
                });
            }
        };

        let declared = resource
            .mime()
            .unwrap_or_else(|| "unknown".to_string());

        let handler = self
            .registry
            .resolve(&resource)
            .ok_or_else(|| FetchError::UnsupportedType {
                url: url.to_string(),
                content_type: declared.clone(),
                reason: "no handler for this content".to_string(),
            })?;

        let extracted = handler
            .extract(url, &resource)
            .map_err(|e| FetchError::UnsupportedType {
                url: url.to_string(),
                content_type: declared.clone(),
                reason: e.to_string(),
            })?;

        let mut metadata = extracted.metadata;
        metadata.insert("handler".into(), handler.name().to_string());
        metadata.insert(
            "word_count".into(),
            extracted.content.split_whitespace().count().to_string(),
        );
        if let Some(ct) = &resource.content_type {
            metadata.insert("content_type".into(), ct.clone());
        }
        if let Some(final_url) = &resource.final_url {
            metadata.insert("final_url".into(), final_url.clone());
        }
        if let Some(status) = resource.status {
            metadata.insert("status".into(), status.to_string());
        }

        let content = ProcessedContent::new(
            url,
            extracted.title,
            extracted.content_type,
            extracted.content,
            metadata,
        );

        debug!(
            handler = handler.name(),
            content_type = %content.content_type,
            hash = %content.content_hash,
            "retrieved"
        );
        Ok(content)
    }
}

fn map_fetcher_error(url: &CanonicalUrl, err: FetcherError, timeout: Duration) -> FetchError {
    let url = url.to_string();
    match err {
        FetcherError::Unreachable(reason) => FetchError::Unreachable { url, reason },
        FetcherError::Blocked(reason) => FetchError::Blocked { url, reason },
        FetcherError::Timeout(_) => FetchError::Timeout {
            url,
            after_ms: timeout.as_millis() as u64,
        },
        FetcherError::Unsupported(reason) => FetchError::UnsupportedType {
            url,
            content_type: "unknown".to_string(),
            reason,
        },
    }
}
