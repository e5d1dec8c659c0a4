use thiserror::Error;

/// Canonical Quiver error taxonomy used across crates.
///
/// Classification guidance:
/// - [`QuiverError::Construction`]: pipeline shape/type issues found while building a translator chain
/// - [`QuiverError::State`]: processor calls issued in a state that does not allow them
/// - [`QuiverError::Resource`]: allocator failures
/// - [`QuiverError::Data`]: input batches that do not match what the chain expects
/// - [`QuiverError::Execution`]: runtime kernel failures after construction succeeded
/// - [`QuiverError::InvalidConfig`]: unknown or malformed configuration options
/// - [`QuiverError::Unsupported`]: valid requests for behavior that is not implemented
#[derive(Debug, Error)]
pub enum QuiverError {
    /// Translator chain construction failures.
    ///
    /// Examples:
    /// - declared node schema differs from the schema derived from its input
    /// - cyclic, disconnected or fan-out pipelines
    /// - filter predicate that does not evaluate to boolean
    #[error("construction error: {0}")]
    Construction(String),

    /// Processor precondition violations.
    ///
    /// Examples:
    /// - `process_batch` after a stateful processor was finalized
    /// - `get_result` with no input under a rejecting empty-input policy
    #[error("state error: {0}")]
    State(String),

    /// Allocation failures reported by an [`crate::memory::Allocator`].
    #[error("resource error: {0}")]
    Resource(String),

    /// Input batch does not match the schema the chain was built for.
    #[error("data error: {0}")]
    Data(String),

    /// Runtime evaluation failures (arrow kernels, output materialization).
    #[error("execution error: {0}")]
    Execution(String),

    /// Invalid configuration values or unrecognized option keys.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Valid request for an operator/expression shape that is not implemented.
    ///
    /// Examples:
    /// - `Custom` operator with no registered translator factory
    /// - arithmetic on non-numeric types
    #[error("unsupported: {0}")]
    Unsupported(String),
}

impl QuiverError {
    /// Short lowercase label for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            QuiverError::Construction(_) => "construction",
            QuiverError::State(_) => "state",
            QuiverError::Resource(_) => "resource",
            QuiverError::Data(_) => "data",
            QuiverError::Execution(_) => "execution",
            QuiverError::InvalidConfig(_) => "invalid_config",
            QuiverError::Unsupported(_) => "unsupported",
        }
    }
}

/// Standard Quiver result alias.
pub type Result<T> = std::result::Result<T, QuiverError>;
