//! Plain text and Markdown, stored as-is.

use std::collections::BTreeMap;

use contentpipe_shared::{CanonicalUrl, ContentType};

use super::{
    ContentHandler, Extracted, HandlerError, first_line_title, looks_like_html, looks_like_pdf,
    title_from_url,
};
use crate::fetcher::RawResource;

pub struct TextHandler;

impl ContentHandler for TextHandler {
    fn name(&self) -> &str {
        "text"
    }

    fn accepts(&self, mime: Option<&str>, body: &[u8]) -> bool {
        match mime {
            Some(m) => matches!(m, "text/plain" | "text/markdown" | "text/x-markdown"),
            None => {
                std::str::from_utf8(body).is_ok() && !looks_like_html(body) && !looks_like_pdf(body)
            }
        }
    }

    fn extract(&self, url: &CanonicalUrl, resource: &RawResource) -> Result<Extracted, HandlerError> {
        let text = std::str::from_utf8(&resource.body)
            .map_err(|e| HandlerError(format!("body is not UTF-8: {e}")))?;
        let text = text.trim();

        Ok(Extracted {
            title: first_line_title(text).unwrap_or_else(|| title_from_url(url)),
            content_type: ContentType::Other,
            content: text.to_string(),
            metadata: BTreeMap::new(),
        })
    }
}
