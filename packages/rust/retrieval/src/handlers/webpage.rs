//! HTML pages: title and description from the head, main content as Markdown.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use scraper::{Html, Selector};

use contentpipe_shared::{CanonicalUrl, ContentType};

use super::{ContentHandler, Extracted, HandlerError, looks_like_html, title_from_url};
use crate::fetcher::RawResource;

/// Tags dropped before conversion; they never carry page content.
const CHROME_TAGS: &[&str] = &[
    "script", "style", "nav", "header", "footer", "aside", "iframe", "noscript", "svg", "form",
];

pub struct WebpageHandler;

impl ContentHandler for WebpageHandler {
    fn name(&self) -> &str {
        "webpage"
    }

    fn accepts(&self, mime: Option<&str>, body: &[u8]) -> bool {
        match mime {
            Some(m) => m == "text/html" || m == "application/xhtml+xml",
            None => looks_like_html(body),
        }
    }

    fn extract(&self, url: &CanonicalUrl, resource: &RawResource) -> Result<Extracted, HandlerError> {
        let html = String::from_utf8_lossy(&resource.body);
        let doc = Html::parse_document(&html);

        let title = extract_title(&doc).unwrap_or_else(|| title_from_url(url));

        let mut metadata = BTreeMap::new();
        if let Some(description) = extract_description(&doc) {
            metadata.insert("description".to_string(), description);
        }
        if let Some(lang) = select_attr(&doc, "html[lang]", "lang") {
            metadata.insert("language".to_string(), lang);
        }

        let main_html = main_content_html(&doc);
        let converter = htmd::HtmlToMarkdown::builder()
            .skip_tags(CHROME_TAGS.to_vec())
            .build();
        let markdown = converter
            .convert(&main_html)
            .map_err(|e| HandlerError(format!("htmd conversion failed: {e}")))?;

        Ok(Extracted {
            title,
            content_type: ContentType::Webpage,
            content: tidy_markdown(&markdown),
            metadata,
        })
    }
}

/// `<title>`, then `og:title`, then the first `<h1>`.
fn extract_title(doc: &Html) -> Option<String> {
    select_text(doc, "head > title")
        .or_else(|| select_attr(doc, r#"meta[property="og:title"]"#, "content"))
        .or_else(|| select_text(doc, "h1"))
}

fn extract_description(doc: &Html) -> Option<String> {
    select_attr(doc, r#"meta[name="description"]"#, "content")
        .or_else(|| select_attr(doc, r#"meta[property="og:description"]"#, "content"))
}

/// Inner HTML of `<main>`, `<article>`, `[role=main]`, or the body.
fn main_content_html(doc: &Html) -> String {
    for sel_str in ["main", "article", r#"[role="main"]"#, "body"] {
        let Ok(sel) = Selector::parse(sel_str) else {
            continue;
        };
        if let Some(el) = doc.select(&sel).next() {
            return el.inner_html();
        }
    }
    doc.root_element().inner_html()
}

fn select_text(doc: &Html, selector: &str) -> Option<String> {
    let sel = Selector::parse(selector).ok()?;
    doc.select(&sel)
        .map(|el| collapse_ws(&el.text().collect::<String>()))
        .find(|t| !t.is_empty())
}

fn select_attr(doc: &Html, selector: &str, attr: &str) -> Option<String> {
    let sel = Selector::parse(selector).ok()?;
    doc.select(&sel)
        .filter_map(|el| el.value().attr(attr))
        .map(collapse_ws)
        .find(|t| !t.is_empty())
}

fn collapse_ws(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Trim trailing spaces and collapse runs of blank lines.
fn tidy_markdown(md: &str) -> String {
    static TRAILING_WS_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"(?m)[ \t]+$").expect("valid regex"));
    static MULTI_BLANK_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"\n{3,}").expect("valid regex"));

    let md = TRAILING_WS_RE.replace_all(md, "");
    let md = MULTI_BLANK_RE.replace_all(&md, "\n\n");
    md.trim().to_string()
}
