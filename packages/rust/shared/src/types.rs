//! Core domain types for the content pipeline.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::canonical::CanonicalUrl;
use crate::hash::content_hash;

// ---------------------------------------------------------------------------
// ContentType
// ---------------------------------------------------------------------------

/// Kind of resource a [`ProcessedContent`] was produced from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    Webpage,
    Pdf,
    Other,
}

impl ContentType {
    /// Storage representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Webpage => "webpage",
            Self::Pdf => "pdf",
            Self::Other => "other",
        }
    }
}

impl std::fmt::Display for ContentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ContentType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "webpage" => Ok(Self::Webpage),
            "pdf" => Ok(Self::Pdf),
            "other" => Ok(Self::Other),
            other => Err(format!("unknown content type {other:?}")),
        }
    }
}

// ---------------------------------------------------------------------------
// ProcessedContent
// ---------------------------------------------------------------------------

/// A fetched and normalized resource, keyed by its canonical URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessedContent {
    /// Always equal to `url`.
    pub id: String,
    /// Canonical URL.
    pub url: String,
    /// Extracted or inferred title.
    pub title: String,
    #[serde(rename = "type")]
    pub content_type: ContentType,
    /// Normalized body text (Markdown for web pages).
    pub content: String,
    /// Free-form string metadata, ordered for deterministic output.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    /// When this content was last fetched and processed.
    pub last_processed: DateTime<Utc>,
    /// Digest of the normalized content (see [`crate::hash`]).
    pub content_hash: String,
}

impl ProcessedContent {
    /// Build content for `url`, hashing `content` and stamping the current time.
    pub fn new(
        url: &CanonicalUrl,
        title: impl Into<String>,
        content_type: ContentType,
        content: impl Into<String>,
        metadata: BTreeMap<String, String>,
    ) -> Self {
        let content = content.into();
        Self {
            id: url.to_string(),
            url: url.to_string(),
            title: title.into(),
            content_type,
            content_hash: content_hash(&content),
            content,
            metadata,
            last_processed: Utc::now(),
        }
    }

    /// Whether everything except `last_processed` matches `other`.
    pub fn same_content(&self, other: &Self) -> bool {
        self.id == other.id
            && self.url == other.url
            && self.title == other.title
            && self.content_type == other.content_type
            && self.content == other.content
            && self.metadata == other.metadata
            && self.content_hash == other.content_hash
    }
}

// ---------------------------------------------------------------------------
// URL collections
// ---------------------------------------------------------------------------

/// One URL tracked by a collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UrlEntry {
    pub url: CanonicalUrl,
    pub added_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub tags: BTreeSet<String>,
}

impl UrlEntry {
    pub fn new(url: CanonicalUrl) -> Self {
        Self {
            url,
            added_at: Utc::now(),
            tags: BTreeSet::new(),
        }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }
}

/// An insertion-ordered set of [`UrlEntry`] values, unique by canonical URL.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UrlCollection {
    pub id: String,
    entries: Vec<UrlEntry>,
}

impl UrlCollection {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            entries: Vec::new(),
        }
    }

    pub fn contains(&self, url: &CanonicalUrl) -> bool {
        self.entries.iter().any(|e| &e.url == url)
    }

    pub fn get(&self, url: &CanonicalUrl) -> Option<&UrlEntry> {
        self.entries.iter().find(|e| &e.url == url)
    }

    /// Append `entry`. Returns `false` (and leaves the collection untouched)
    /// if its URL is already present.
    pub fn insert(&mut self, entry: UrlEntry) -> bool {
        if self.contains(&entry.url) {
            return false;
        }
        self.entries.push(entry);
        true
    }

    pub fn remove(&mut self, url: &CanonicalUrl) -> Option<UrlEntry> {
        let idx = self.entries.iter().position(|e| &e.url == url)?;
        Some(self.entries.remove(idx))
    }

    /// Replace the tag set of an existing entry. Returns `false` if absent.
    pub fn set_tags(&mut self, url: &CanonicalUrl, tags: BTreeSet<String>) -> bool {
        match self.entries.iter_mut().find(|e| &e.url == url) {
            Some(entry) => {
                entry.tags = tags;
                true
            }
            None => false,
        }
    }

    pub fn entries(&self) -> &[UrlEntry] {
        &self.entries
    }

    pub fn urls(&self) -> impl Iterator<Item = &CanonicalUrl> {
        self.entries.iter().map(|e| &e.url)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ---------------------------------------------------------------------------
// ChangeEvent
// ---------------------------------------------------------------------------

/// Emitted when a re-fetch of an indexed URL yields a different content hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub url: CanonicalUrl,
    pub previous_hash: String,
    pub new_hash: String,
    pub detected_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canonicalize;

    fn url(s: &str) -> CanonicalUrl {
        canonicalize(s).unwrap()
    }

    #[test]
    fn processed_content_id_matches_url() {
        let content = ProcessedContent::new(
            &url("https://example.com/a"),
            "A",
            ContentType::Webpage,
            "body",
            BTreeMap::new(),
        );
        assert_eq!(content.id, content.url);
        assert_eq!(content.content_hash, content_hash("body"));
    }

    #[test]
    fn processed_content_serialization() {
        let mut metadata = BTreeMap::new();
        metadata.insert("content_type".into(), "text/html".into());
        let content = ProcessedContent::new(
            &url("https://example.com/a"),
            "A",
            ContentType::Pdf,
            "body",
            metadata,
        );

        let json = serde_json::to_string(&content).expect("serialize");
        assert!(json.contains(r#""type":"pdf""#));
        let parsed: ProcessedContent = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(parsed, content);
    }

    #[test]
    fn same_content_ignores_timestamp() {
        let a = ProcessedContent::new(
            &url("https://example.com/a"),
            "A",
            ContentType::Other,
            "x",
            BTreeMap::new(),
        );
        let mut b = a.clone();
        b.last_processed = a.last_processed + chrono::Duration::seconds(30);
        assert!(a.same_content(&b));
        b.title = "B".into();
        assert!(!a.same_content(&b));
    }

    #[test]
    fn collection_rejects_duplicate_urls() {
        let mut collection = UrlCollection::new("docs");
        assert!(collection.insert(UrlEntry::new(url("https://example.com/a"))));
        assert!(!collection.insert(UrlEntry::new(url("https://EXAMPLE.com/a#frag"))));
        assert_eq!(collection.len(), 1);
    }

    #[test]
    fn collection_preserves_insertion_order_and_edits() {
        let mut collection = UrlCollection::new("docs");
        for u in ["https://example.com/c", "https://example.com/a", "https://example.com/b"] {
            collection.insert(UrlEntry::new(url(u)));
        }
        let order: Vec<&str> = collection.urls().map(CanonicalUrl::as_str).collect();
        assert_eq!(
            order,
            vec!["https://example.com/c", "https://example.com/a", "https://example.com/b"]
        );

        let tags: BTreeSet<String> = ["guide".to_string()].into();
        assert!(collection.set_tags(&url("https://example.com/a"), tags.clone()));
        assert_eq!(collection.get(&url("https://example.com/a")).unwrap().tags, tags);

        assert!(collection.remove(&url("https://example.com/c")).is_some());
        assert!(collection.remove(&url("https://example.com/c")).is_none());
        assert_eq!(collection.len(), 2);
    }

    #[test]
    fn content_type_parse() {
        assert_eq!("pdf".parse::<ContentType>().unwrap(), ContentType::Pdf);
        assert!("video".parse::<ContentType>().is_err());
    }
}
