//! Content hashing for change detection.
//!
//! The hash is computed over a whitespace-normalized form of the extracted
//! content, so pages that differ only in incidental whitespace hash equal:
//! - CRLF and lone CR become LF
//! - runs of whitespace inside a line collapse to a single space
//! - lines are trimmed and blank lines dropped
//!
//! No Unicode normalization is applied; differently-encoded but visually equal
//! text hashes differently.

use sha2::{Digest, Sha256};

/// Apply the whitespace normalization rule used before hashing.
pub fn normalize_for_hash(text: &str) -> String {
    let unified = text.replace("\r\n", "\n").replace('\r', "\n");

    let mut out = String::with_capacity(unified.len());
    for line in unified.lines() {
        let mut words = line.split_whitespace().peekable();
        if words.peek().is_none() {
            continue;
        }
        if !out.is_empty() {
            out.push('\n');
        }
        let mut first = true;
        for word in words {
            if !first {
                out.push(' ');
            }
            out.push_str(word);
            first = false;
        }
    }
    out
}

/// SHA-256 hex digest of the normalized content.
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize_for_hash(text).as_bytes());
    format!("{:x}", hasher.finalize())
}
