//! Canonical URL form used as the stable store key.
//!
//! Canonicalization lowercases scheme and host, drops default ports, strips the
//! fragment, and removes a trailing slash from non-root paths. The query string
//! is kept verbatim.

use std::fmt;

use serde::{Deserialize, Serialize};
use url::Url;

/// Reasons a URL string cannot be canonicalized.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UrlError {
    /// Not parseable as an absolute URL.
    #[error("malformed URL {input:?}: {reason}")]
    Malformed { input: String, reason: String },

    /// Parsed, but not an http(s) URL.
    #[error("unsupported URL scheme {scheme:?} in {input:?}")]
    UnsupportedScheme { input: String, scheme: String },

    /// Absolute URL without a host component.
    #[error("URL {input:?} has no host")]
    MissingHost { input: String },
}

/// An absolute http(s) URL in canonical form.
///
/// Only constructible through [`canonicalize`], so two equivalent URLs always
/// compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CanonicalUrl(String);

impl CanonicalUrl {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Parse back into a [`Url`]. Always succeeds for a canonical value.
    pub fn to_url(&self) -> Url {
        Url::parse(&self.0).expect("canonical URL is always parseable")
    }

    /// Host component (always present for canonical URLs).
    pub fn host(&self) -> String {
        self.to_url().host_str().unwrap_or_default().to_string()
    }
}

impl fmt::Display for CanonicalUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CanonicalUrl {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for CanonicalUrl {
    type Error = UrlError;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        canonicalize(&value)
    }
}

impl From<CanonicalUrl> for String {
    fn from(value: CanonicalUrl) -> Self {
        value.0
    }
}

impl std::str::FromStr for CanonicalUrl {
    type Err = UrlError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        canonicalize(s)
    }
}

/// Canonicalize an absolute http(s) URL string.
pub fn canonicalize(input: &str) -> std::result::Result<CanonicalUrl, UrlError> {
    let trimmed = input.trim();
    let mut url = Url::parse(trimmed).map_err(|e| UrlError::Malformed {
        input: input.to_string(),
        reason: e.to_string(),
    })?;

    match url.scheme() {
        "http" | "https" => {}
        other => {
            return Err(UrlError::UnsupportedScheme {
                input: input.to_string(),
                scheme: other.to_string(),
            });
        }
    }

    if url.host_str().is_none_or(str::is_empty) {
        return Err(UrlError::MissingHost {
            input: input.to_string(),
        });
    }

    // `Url` already lowercases scheme/host and drops default ports.
    url.set_fragment(None);

    let path = url.path().to_string();
    if path.len() > 1 && path.ends_with('/') {
        url.set_path(path.trim_end_matches('/'));
        if url.path().is_empty() {
            url.set_path("/");
        }
    }

    Ok(CanonicalUrl(url.to_string()))
}
