//! Content handlers and the registry that picks one per resource.
//!
//! Handlers turn a [`RawResource`] into a title, a [`ContentType`], and
//! normalized text. The registry resolves handlers by declared media type,
//! falling back to sniffing the body when the transport gave none.

mod pdf;
mod text;
mod webpage;

use std::collections::BTreeMap;

use contentpipe_shared::{CanonicalUrl, ContentType};

use crate::fetcher::RawResource;

pub use pdf::PdfHandler;
pub use text::TextHandler;
pub use webpage::WebpageHandler;

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Output of a [`ContentHandler`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extracted {
    pub title: String,
    pub content_type: ContentType,
    pub content: String,
    /// Handler-specific metadata (e.g. `description`).
    pub metadata: BTreeMap<String, String>,
}

/// Why a handler could not extract a resource it accepted.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

/// Capability that knows how to read one family of media types.
pub trait ContentHandler: Send + Sync {
    /// Capability name (`webpage`, `pdf`, `text`).
    fn name(&self) -> &str;

    /// Whether this handler reads `mime`, or, when `mime` is `None`, a body
    /// that looks like `body`.
    fn accepts(&self, mime: Option<&str>, body: &[u8]) -> bool;

    fn extract(&self, url: &CanonicalUrl, resource: &RawResource) -> Result<Extracted, HandlerError>;
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Handlers in priority order, unique by name.
pub struct HandlerRegistry {
    handlers: Vec<Box<dyn ContentHandler>>,
}

impl HandlerRegistry {
    /// Registry with the built-in handlers.
    pub fn new() -> Self {
        Self {
            handlers: vec![
                Box::new(WebpageHandler),
                Box::new(PdfHandler),
                Box::new(TextHandler),
            ],
        }
    }

    /// Add `handler` ahead of the existing ones, replacing any of the same name.
    pub fn register(&mut self, handler: Box<dyn ContentHandler>) {
        self.handlers.retain(|h| h.name() != handler.name());
        self.handlers.insert(0, handler);
    }

    pub fn get(&self, name: &str) -> Option<&dyn ContentHandler> {
        self.handlers
            .iter()
            .find(|h| h.name() == name)
            .map(|h| h.as_ref())
    }

    pub fn names(&self) -> Vec<&str> {
        self.handlers.iter().map(|h| h.name()).collect()
    }

    /// First handler that accepts `resource`, if any.
    pub fn resolve(&self, resource: &RawResource) -> Option<&dyn ContentHandler> {
        let mime = resource.mime();
        self.handlers
            .iter()
            .find(|h| h.accepts(mime.as_deref(), &resource.body))
            .map(|h| h.as_ref())
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

pub(crate) fn looks_like_pdf(body: &[u8]) -> bool {
    body.starts_with(b"%PDF")
}

pub(crate) fn looks_like_html(body: &[u8]) -> bool {
    let head = &body[..body.len().min(1024)];
    let head = String::from_utf8_lossy(head).to_ascii_lowercase();
    let head = head.trim_start();
    head.starts_with("<!doctype html") || head.starts_with("<html") || head.contains("<body")
}

/// Title fallback: last path segment, else the host.
pub(crate) fn title_from_url(url: &CanonicalUrl) -> String {
    let parsed = url.to_url();
    parsed
        .path_segments()
        .and_then(|mut segments| segments.rfind(|s| !s.is_empty()))
        .map(str::to_string)
        .unwrap_or_else(|| url.host())
}

/// First non-empty line, capped at 120 characters.
pub(crate) fn first_line_title(text: &str) -> Option<String> {
    text.lines()
        .map(|l| l.trim().trim_start_matches('#').trim())
        .find(|l| !l.is_empty())
        .map(|l| l.chars().take(120).collect())
}
