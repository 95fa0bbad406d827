//! Shared types, error model, and configuration for ContentPipe.
//!
//! This crate is the foundation depended on by all other ContentPipe crates.
//! It provides:
//! - [`ContentPipeError`], the unified error type for config and I/O
//! - Domain types ([`ProcessedContent`], [`UrlCollection`], [`ChangeEvent`])
//! - [`CanonicalUrl`] and the content-hash normalization rule
//! - Configuration ([`AppConfig`], config loading)

pub mod canonical;
pub mod config;
pub mod error;
pub mod hash;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use canonical::{CanonicalUrl, UrlError, canonicalize};
pub use config::{
    AnalysisConfig, AppConfig, MonitorConfig, OrchestratorConfig, RetrievalConfig, RetryConfig,
    StoreConfig, config_dir, config_file_path, init_config, load_config, load_config_from,
};
pub use error::{ContentPipeError, Result};
pub use hash::{content_hash, normalize_for_hash};
pub use types::{ChangeEvent, ContentType, ProcessedContent, UrlCollection, UrlEntry};
