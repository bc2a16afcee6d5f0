//! Error types for the Phalanx library.
//!
//! All fallible operations return [`Result`], whose error type is the
//! [`PhalanxError`] enum.
//!
//! # Examples
//!
//! ```
//! use phalanx::error::{PhalanxError, Result};
//!
//! fn parse_ratio() -> Result<f64> {
//!     Err(PhalanxError::config("ratio out of range"))
//! }
//!
//! match parse_ratio() {
//!     Ok(_) => println!("Success"),
//!     Err(e) => eprintln!("Error: {}", e),
//! }
//! ```

use std::io;

use anyhow;
use thiserror::Error;

/// The main error type for Phalanx operations.
///
/// Merge execution failures never surface through this type on the write
/// path: the scheduler contains them and reports them as events. What does
/// surface are configuration problems (to whoever changed a setting) and
/// storage errors (to whoever drives a merge executor directly).
#[derive(Error, Debug)]
pub enum PhalanxError {
    /// I/O errors (file operations, etc.)
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Invalid or out-of-range configuration value.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Storage-related errors
    #[error("Storage error: {0}")]
    Storage(String),

    /// Segment bookkeeping errors (unknown or duplicate generation).
    #[error("Segment error: {0}")]
    Segment(String),

    /// A running merge was aborted before it could publish.
    #[error("Merge aborted: {0}")]
    MergeAborted(String),

    /// Operation on a component that is closing or closed.
    #[error("Closed: {0}")]
    Closed(String),

    /// Thread spawn or join errors
    #[error("Thread error: {0}")]
    Thread(String),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error for other cases
    #[error("Error: {0}")]
    Other(String),

    /// Generic anyhow error
    #[error("Anyhow error: {0}")]
    Anyhow(#[from] anyhow::Error),
}

/// Result type alias for operations that may fail with PhalanxError.
pub type Result<T> = std::result::Result<T, PhalanxError>;

impl PhalanxError {
    /// Create a new configuration error.
    pub fn config<S: Into<String>>(msg: S) -> Self {
        PhalanxError::Config(msg.into())
    }

    /// Create a new storage error.
    pub fn storage<S: Into<String>>(msg: S) -> Self {
        PhalanxError::Storage(msg.into())
    }

    /// Create a new segment error.
    pub fn segment<S: Into<String>>(msg: S) -> Self {
        PhalanxError::Segment(msg.into())
    }

    /// Create a new merge-aborted error.
    pub fn aborted<S: Into<String>>(msg: S) -> Self {
        PhalanxError::MergeAborted(msg.into())
    }

    /// Create a new closed error.
    pub fn closed<S: Into<String>>(msg: S) -> Self {
        PhalanxError::Closed(msg.into())
    }

    /// Create a new thread error.
    pub fn thread<S: Into<String>>(msg: S) -> Self {
        PhalanxError::Thread(msg.into())
    }

    /// Create a new generic error.
    pub fn other<S: Into<String>>(msg: S) -> Self {
        PhalanxError::Other(msg.into())
    }

    /// Create a new not found error.
    pub fn not_found<S: Into<String>>(msg: S) -> Self {
        PhalanxError::Storage(format!("Not found: {}", msg.into()))
    }

    /// Whether this error came from an abort rather than a real failure.
    pub fn is_aborted(&self) -> bool {
        matches!(self, PhalanxError::MergeAborted(_))
    }
}
