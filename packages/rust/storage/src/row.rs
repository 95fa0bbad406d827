//! Raw `contents` rows and their validation.
//!
//! Rows are read column-by-column as untyped values so a damaged row can be
//! inspected and quarantined instead of failing the whole query.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use libsql::{Row, Value};

use contentpipe_shared::{ContentType, ProcessedContent, canonicalize, content_hash};

use crate::StoreError;

/// Column list shared by every `contents` read; the table is aliased `c`.
pub(crate) const CONTENT_COLUMNS: &str = "c.rowid, c.id, c.url, c.title, c.content_type, \
     c.content, c.metadata_json, c.last_processed, c.content_hash";

const NAMES: [&str; 8] = [
    "id",
    "url",
    "title",
    "content_type",
    "content",
    "metadata_json",
    "last_processed",
    "content_hash",
];

#[derive(Debug, Clone)]
pub(crate) struct RawRow {
    pub rowid: i64,
    values: Vec<Value>,
}

impl RawRow {
    /// Read [`CONTENT_COLUMNS`] starting at column `start`.
    pub fn read(row: &Row, start: i32) -> Result<Self, StoreError> {
        let rowid = row.get::<i64>(start).map_err(StoreError::io)?;
        let values = (0..NAMES.len() as i32)
            .map(|i| row.get_value(start + 1 + i).map_err(StoreError::io))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { rowid, values })
    }

    fn text(&self, idx: usize) -> Result<&str, String> {
        match &self.values[idx] {
            Value::Text(s) => Ok(s),
            Value::Null => Err(format!("{} is NULL", NAMES[idx])),
            other => Err(format!("{} has non-text value {other:?}", NAMES[idx])),
        }
    }

    /// Best available URL for logging and quarantine records.
    pub fn url_hint(&self) -> String {
        self.text(1)
            .or_else(|_| self.text(0))
            .map(str::to_string)
            .unwrap_or_else(|_| format!("rowid:{}", self.rowid))
    }

    /// Decode into [`ProcessedContent`], or explain why the row is corrupt.
    pub fn validate(&self) -> Result<ProcessedContent, String> {
        let id = self.text(0)?;
        let url = self.text(1)?;
        if id != url {
            return Err(format!("id {id:?} differs from url {url:?}"));
        }
        match canonicalize(url) {
            Ok(canonical) if canonical.as_str() == url => {}
            Ok(_) => return Err(format!("url {url:?} is not canonical")),
            Err(e) => return Err(e.to_string()),
        }

        let content_type: ContentType = self.text(3)?.parse()?;
        let content = self.text(4)?;
        let metadata: BTreeMap<String, String> = serde_json::from_str(self.text(5)?)
            .map_err(|e| format!("metadata_json is not a string map: {e}"))?;
        let last_processed = DateTime::parse_from_rfc3339(self.text(6)?)
            .map_err(|e| format!("last_processed is not RFC 3339: {e}"))?
            .with_timezone(&Utc);

        let stored_hash = self.text(7)?;
        let expected = content_hash(content);
        if stored_hash != expected {
            return Err(format!(
                "content_hash {stored_hash:?} does not match content (expected {expected})"
            ));
        }

        Ok(ProcessedContent {
            id: id.to_string(),
            url: url.to_string(),
            title: self.text(2)?.to_string(),
            content_type,
            content: content.to_string(),
            metadata,
            last_processed,
            content_hash: stored_hash.to_string(),
        })
    }

    /// Column values as a JSON object, for the quarantine table.
    pub fn to_json(&self) -> String {
        let mut map = serde_json::Map::new();
        map.insert("rowid".into(), self.rowid.into());
        for (name, value) in NAMES.iter().zip(&self.values) {
            let json = match value {
                Value::Null => serde_json::Value::Null,
                Value::Integer(i) => (*i).into(),
                Value::Real(f) => (*f).into(),
                Value::Text(s) => s.clone().into(),
                Value::Blob(b) => format!("<{} byte blob>", b.len()).into(),
            };
            map.insert((*name).to_string(), json);
        }
        serde_json::Value::Object(map).to_string()
    }
}
