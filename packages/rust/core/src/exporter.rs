//! ExporterAgent: renders stored content as JSON or Markdown.
//!
//! Output depends only on the input, so the same content always exports to
//! the same bytes.

use std::str::FromStr;

use contentpipe_shared::ProcessedContent;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExportError {
    #[error("unsupported export format {0:?} (expected \"json\" or \"markdown\")")]
    UnsupportedFormat(String),

    #[error("serialization failed: {0}")]
    Serialization(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Json,
    Markdown,
}

impl FromStr for ExportFormat {
    type Err = ExportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "json" => Ok(Self::Json),
            "markdown" => Ok(Self::Markdown),
            other => Err(ExportError::UnsupportedFormat(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ExporterAgent;

impl ExporterAgent {
    /// Render one item; `format` is `"json"` or `"markdown"`.
    pub fn export(&self, content: &ProcessedContent, format: &str) -> Result<String, ExportError> {
        match format.parse()? {
            ExportFormat::Json => to_json(content),
            ExportFormat::Markdown => Ok(to_markdown(content)),
        }
    }

    /// Render several items sorted by URL: a JSON array, or Markdown
    /// documents separated by horizontal rules.
    pub fn export_many(
        &self,
        contents: &[ProcessedContent],
        format: &str,
    ) -> Result<String, ExportError> {
        let format: ExportFormat = format.parse()?;
        let mut sorted: Vec<&ProcessedContent> = contents.iter().collect();
        sorted.sort_by(|a, b| a.url.cmp(&b.url));

        match format {
            ExportFormat::Json => serde_json::to_string_pretty(&sorted)
                .map_err(|e| ExportError::Serialization(e.to_string())),
            ExportFormat::Markdown => Ok(sorted
                .into_iter()
                .map(to_markdown)
                .collect::<Vec<_>>()
                .join("\n* * *\n\n")),
        }
    }
}

fn to_json(content: &ProcessedContent) -> Result<String, ExportError> {
    serde_json::to_string_pretty(content).map_err(|e| ExportError::Serialization(e.to_string()))
}

/// YAML frontmatter with the fixed fields and every metadata entry, then the
/// title as a heading and the body.
fn to_markdown(content: &ProcessedContent) -> String {
    let mut md = String::from("---\n");
    md.push_str(&format!("url: \"{}\"\n", escape_yaml_string(&content.url)));
    md.push_str(&format!("title: \"{}\"\n", escape_yaml_string(&content.title)));
    md.push_str(&format!("type: {}\n", content.content_type));
    md.push_str(&format!(
        "last_processed: \"{}\"\n",
        content.last_processed.to_rfc3339()
    ));
    md.push_str(&format!("content_hash: {}\n", content.content_hash));
    if !content.metadata.is_empty() {
        md.push_str("metadata:\n");
        for (key, value) in &content.metadata {
            md.push_str(&format!(
                "  \"{}\": \"{}\"\n",
                escape_yaml_string(key),
                escape_yaml_string(value)
            ));
        }
    }
    md.push_str("---\n\n");
    md.push_str(&format!("# {}\n\n", content.title));
    md.push_str(content.content.trim_end());
    md.push('\n');
    md
}

/// Escape special characters in a YAML string value.
fn escape_yaml_string(s: &str) -> String {
    s.replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}
