//! The fetch collaborator seam.
//!
//! A [`Fetcher`] turns a canonical URL into raw bytes plus whatever the
//! transport knows about them. It does not interpret the body; that is the
//! job of the content handlers.

use contentpipe_shared::CanonicalUrl;

/// Bytes returned by a [`Fetcher`], before any content handling.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawResource {
    pub body: Vec<u8>,
    /// `Content-Type` header value, if the transport reported one.
    pub content_type: Option<String>,
    /// URL after redirects.
    pub final_url: Option<String>,
    pub status: Option<u16>,
    /// Text already extracted by the transport (e.g. a PDF renderer).
    pub text: Option<String>,
}

impl RawResource {
    pub fn new(body: impl Into<Vec<u8>>, content_type: Option<&str>) -> Self {
        Self {
            body: body.into(),
            content_type: content_type.map(str::to_string),
            ..Self::default()
        }
    }

    pub fn html(body: impl Into<Vec<u8>>) -> Self {
        Self::new(body, Some("text/html; charset=utf-8"))
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn with_final_url(mut self, final_url: impl Into<String>) -> Self {
        self.final_url = Some(final_url.into());
        self
    }

    /// Lowercased media type without parameters.
    pub fn mime(&self) -> Option<String> {
        let ct = self.content_type.as_deref()?;
        let mime = ct.split(';').next().unwrap_or(ct).trim().to_ascii_lowercase();
        (!mime.is_empty()).then_some(mime)
    }
}

/// How a [`Fetcher`] failed. The retrieval agent maps these onto
/// [`crate::FetchError`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetcherError {
    /// Network-level failure or a server-side status worth retrying.
    #[error("unreachable: {0}")]
    Unreachable(String),

    /// Refused by policy (robots, private host, client-error status).
    #[error("blocked: {0}")]
    Blocked(String),

    #[error("timed out: {0}")]
    Timeout(String),

    /// The transport refused the media type.
    #[error("unsupported content: {0}")]
    Unsupported(String),
}

/// Fetch collaborator. Implementations must be safe to call concurrently.
#[async_trait::async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &CanonicalUrl) -> Result<RawResource, FetcherError>;
}
