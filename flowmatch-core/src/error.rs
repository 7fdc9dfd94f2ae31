//! Error types for FlowMatch classifier operations.
//!
//! Every fallible operation happens at load or construction time; the
//! per-packet classify path is infallible by design (spec'd behaviour: a
//! subset that cannot produce a match simply does not overwrite the output).

use thiserror::Error;

/// Result type alias for FlowMatch operations.
pub type Result<T> = std::result::Result<T, FlowMatchError>;

/// Core error types for the FlowMatch classifier.
#[derive(Error, Debug)]
pub enum FlowMatchError {
    /// The classifier image is truncated or carries impossible counts.
    #[error("corrupt classifier image: {0}")]
    ImageCorrupt(String),

    /// Contradictory or out-of-range configuration options.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// The remainder classifier failed to load, including after the one
    /// rebuild-from-rules recovery attempt.
    #[error("remainder classifier load failed: {0}")]
    RemainderLoad(String),

    /// Every iSet was filtered out and no remainder classifier remains.
    #[error("classifier has no valid subsets")]
    NoValidSubsets,

    /// IO error while reading an image from disk.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
