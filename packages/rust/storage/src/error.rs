/// Errors returned by [`crate::ContentStore`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The database could not be read or written.
    #[error("storage I/O failure: {0}")]
    IoFailure(String),

    /// A stored row failed validation and has been quarantined.
    #[error("corrupt row for {url}: {reason}")]
    Corrupt { url: String, reason: String },

    /// The caller passed content the store refuses to persist.
    #[error("invalid content: {0}")]
    InvalidInput(String),

    #[error("store is open read-only")]
    ReadOnly,
}

impl StoreError {
    pub(crate) fn io(e: impl std::fmt::Display) -> Self {
        Self::IoFailure(e.to_string())
    }

    /// Whether retrying the same call could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::IoFailure(_))
    }
}
