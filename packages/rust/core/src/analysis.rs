//! AnalysisAgent: best-effort summaries of indexed content.
//!
//! The model sits behind the [`Summarizer`] trait. Failures here are reported
//! to the caller and never undo indexing.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, instrument, warn};

use contentpipe_shared::{AnalysisConfig, ProcessedContent};

/// Failure reported by a [`Summarizer`] implementation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct SummarizerError(pub String);

/// Summarization collaborator.
#[async_trait::async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, text: &str, query: &str) -> Result<String, SummarizerError>;

    /// Model identifier, used as part of the analysis cache key.
    fn model(&self) -> &str;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AnalysisError {
    #[error("model unavailable: {0}")]
    ModelUnavailable(String),

    #[error("input of {chars} characters exceeds the {limit} character limit")]
    InputTooLarge { chars: usize, limit: usize },
}

#[derive(Clone)]
pub struct AnalysisAgent {
    summarizer: Arc<dyn Summarizer>,
    max_input_chars: usize,
    timeout: Duration,
}

impl AnalysisAgent {
    pub fn new(summarizer: Arc<dyn Summarizer>, config: &AnalysisConfig) -> Self {
        Self {
            summarizer,
            max_input_chars: config.max_input_chars,
            timeout: config.timeout(),
        }
    }

    pub fn model(&self) -> &str {
        self.summarizer.model()
    }

    /// Summarize `content` with respect to `query`.
    #[instrument(skip_all, fields(url = %content.url))]
    pub async fn summarize(
        &self,
        content: &ProcessedContent,
        query: &str,
    ) -> Result<String, AnalysisError> {
        let chars = content.content.chars().count();
        if chars > self.max_input_chars {
            return Err(AnalysisError::InputTooLarge {
                chars,
                limit: self.max_input_chars,
            });
        }

        let text = format!("# {}\n\n{}", content.title, content.content);
        match tokio::time::timeout(self.timeout, self.summarizer.summarize(&text, query)).await {
            Ok(Ok(summary)) => {
                debug!(model = self.model(), len = summary.len(), "summary ready");
                Ok(summary)
            }
            Ok(Err(e)) => {
                warn!(error = %e, "summarizer failed");
                Err(AnalysisError::ModelUnavailable(e.0))
            }
            Err(_) => {
                warn!(timeout_ms = self.timeout.as_millis() as u64, "summarizer timed out");
                Err(AnalysisError::ModelUnavailable(format!(
                    "no response within {} ms",
                    self.timeout.as_millis()
                )))
            }
        }
    }
}
