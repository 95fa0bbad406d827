//! Pipeline agents for ContentPipe.
//!
//! [`OrchestratorAgent`] coordinates the stages: [`RetrievalAgent`] fetches,
//! [`IndexerAgent`] persists, [`AnalysisAgent`] summarizes on demand,
//! [`MonitorAgent`] watches for changes and [`ExporterAgent`] renders output.
//!
//! [`RetrievalAgent`]: contentpipe_retrieval::RetrievalAgent

pub mod analysis;
pub mod bridge;
pub mod exporter;
pub mod indexer;
pub mod monitor;
pub mod orchestrator;

#[cfg(test)]
mod testing;

/// Per-URL lock domain shared by the orchestrator and the monitor.
pub use contentpipe_storage::KeyedLocks as UrlLocks;

pub use analysis::{AnalysisAgent, AnalysisError, Summarizer, SummarizerError};
pub use bridge::{BridgeConfig, BridgeSummarizer};
pub use exporter::{ExportError, ExportFormat, ExporterAgent};
pub use indexer::{IndexStatus, IndexerAgent};
pub use monitor::{MonitorAgent, Watch, WatchState};
pub use orchestrator::{
    IndexOutcome, OrchestrationError, OrchestratorAgent, OrchestratorBuilder, UrlState,
};
