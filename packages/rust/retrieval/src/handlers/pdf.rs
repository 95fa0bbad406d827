//! PDF documents. Text must already be extracted by the fetcher; raw PDF
//! bytes are not parsed here.

use std::collections::BTreeMap;

use contentpipe_shared::{CanonicalUrl, ContentType};

use super::{ContentHandler, Extracted, HandlerError, first_line_title, looks_like_pdf, title_from_url};
use crate::fetcher::RawResource;

pub struct PdfHandler;

impl ContentHandler for PdfHandler {
    fn name(&self) -> &str {
        "pdf"
    }

    fn accepts(&self, mime: Option<&str>, body: &[u8]) -> bool {
        match mime {
            Some("application/pdf") => true,
            Some("application/octet-stream") | None => looks_like_pdf(body),
            Some(_) => false,
        }
    }

    fn extract(&self, url: &CanonicalUrl, resource: &RawResource) -> Result<Extracted, HandlerError> {
        let text = resource
            .text
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| HandlerError("PDF without extracted text".to_string()))?;

        let mut metadata = BTreeMap::new();
        metadata.insert("pages".to_string(), count_pages(text).to_string());

        Ok(Extracted {
            title: first_line_title(text).unwrap_or_else(|| title_from_url(url)),
            content_type: ContentType::Pdf,
            content: text.to_string(),
            metadata,
        })
    }
}

/// Extracted PDF text separates pages with form feeds.
fn count_pages(text: &str) -> usize {
    text.split('\u{c}').filter(|p| !p.trim().is_empty()).count().max(1)
}
