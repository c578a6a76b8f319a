use thiserror::Error;

pub type Result<T> = std::result::Result<T, PipelineError>;

/// Infrastructure and fatal errors of the cache layer.
///
/// Ordinary diagnostics (configuration-build failures, weave failures) are
/// returned in values, never through this enum; a query that reaches the
/// error channel produced no partial state or cache updates.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Internal programming error. Aborts the current query; must not be
    /// surfaced to the user as a code issue.
    #[error("invariant violation: {0}")]
    Invariant(String),

    #[error("query cancelled")]
    Cancelled,

    #[error("external build handshake unavailable: {0}")]
    Handshake(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("filesystem watch error: {0}")]
    Watch(#[from] notify::Error),
}

impl PipelineError {
    pub fn invariant<M: Into<String>>(msg: M) -> Self {
        Self::Invariant(msg.into())
    }

    pub fn handshake<M: Into<String>>(msg: M) -> Self {
        Self::Handshake(msg.into())
    }
}
