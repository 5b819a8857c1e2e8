//! Error types for the Quiver engine.
//!
//! Every fallible operation in the crate returns [`Result`], whose error side is
//! the [`QuiverError`] enum. Validation failures (`DimensionMismatch`,
//! `AlreadyExists`, ...) are reported to the caller immediately, storage
//! failures surface as `Io`/`Storage`, and detected on-disk damage is reported
//! as `Corruption`.
//!
//! # Examples
//!
//! ```
//! use quiver::error::{QuiverError, Result};
//!
//! fn check_dimension(expected: usize, actual: usize) -> Result<()> {
//!     if expected != actual {
//!         return Err(QuiverError::dimension_mismatch(expected, actual));
//!     }
//!     Ok(())
//! }
//!
//! assert!(check_dimension(3, 3).is_ok());
//! assert!(check_dimension(3, 4).is_err());
//! ```

use std::io;

use anyhow;
use thiserror::Error;

/// The main error type for Quiver operations.
#[derive(Error, Debug)]
pub enum QuiverError {
    /// I/O errors (file operations, network, etc.)
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// An embedding does not have the collection's dimension.
    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// The named collection does not exist (or was dropped).
    #[error("Collection not found: {0}")]
    CollectionNotFound(String),

    /// A collection or record with the same name/id already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Checksum or structural validation of persisted bytes failed.
    #[error("Corruption detected: {0}")]
    Corruption(String),

    /// Write backpressure: too many records are waiting to be flushed.
    #[error("Overloaded: {0}")]
    Overloaded(String),

    /// A record id is unknown to the segment or collection.
    #[error("Record not found: {0}")]
    RecordNotFound(String),

    /// A segment id is unknown to the collection.
    #[error("Segment not found: {0}")]
    SegmentNotFound(u64),

    /// Storage-related errors
    #[error("Storage error: {0}")]
    Storage(String),

    /// Invalid argument supplied by the caller
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Operation cancelled
    #[error("Operation cancelled: {0}")]
    OperationCancelled(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

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

/// Result type alias for operations that may fail with QuiverError.
pub type Result<T> = std::result::Result<T, QuiverError>;

impl QuiverError {
    /// Create a new dimension mismatch error.
    pub fn dimension_mismatch(expected: usize, actual: usize) -> Self {
        QuiverError::DimensionMismatch { expected, actual }
    }

    /// Create a new collection-not-found error.
    pub fn collection_not_found<S: Into<String>>(name: S) -> Self {
        QuiverError::CollectionNotFound(name.into())
    }

    /// Create a new already-exists error.
    pub fn already_exists<S: Into<String>>(msg: S) -> Self {
        QuiverError::AlreadyExists(msg.into())
    }

    /// Create a new corruption error.
    pub fn corruption<S: Into<String>>(msg: S) -> Self {
        QuiverError::Corruption(msg.into())
    }

    /// Create a new overloaded error.
    pub fn overloaded<S: Into<String>>(msg: S) -> Self {
        QuiverError::Overloaded(msg.into())
    }

    /// Create a new storage error.
    pub fn storage<S: Into<String>>(msg: S) -> Self {
        QuiverError::Storage(msg.into())
    }

    /// Create a new invalid argument error.
    pub fn invalid_argument<S: Into<String>>(msg: S) -> Self {
        QuiverError::InvalidArgument(msg.into())
    }

    /// Create a new invalid config error.
    pub fn invalid_config<S: Into<String>>(msg: S) -> Self {
        QuiverError::InvalidConfig(msg.into())
    }

    /// Create a new cancelled error.
    pub fn cancelled<S: Into<String>>(msg: S) -> Self {
        QuiverError::OperationCancelled(msg.into())
    }

    /// Create a new generic error.
    pub fn other<S: Into<String>>(msg: S) -> Self {
        QuiverError::Other(msg.into())
    }

    /// Create a new internal error.
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        QuiverError::Other(format!("Internal error: {}", msg.into()))
    }

    /// Whether this error came from a failed read or write against storage.
    pub fn is_io(&self) -> bool {
        matches!(self, QuiverError::Io(_) | QuiverError::Storage(_))
    }

    /// Stable snake_case identifier of the error kind, used in API bodies.
    pub fn code(&self) -> &'static str {
        match self {
            QuiverError::Io(_) | QuiverError::Storage(_) => "io_error",
            QuiverError::DimensionMismatch { .. } => "dimension_mismatch",
            QuiverError::CollectionNotFound(_) => "collection_not_found",
            QuiverError::AlreadyExists(_) => "already_exists",
            QuiverError::Corruption(_) => "corruption",
            QuiverError::Overloaded(_) => "overloaded",
            QuiverError::RecordNotFound(_) => "record_not_found",
            QuiverError::SegmentNotFound(_) => "segment_not_found",
            QuiverError::InvalidArgument(_) => "invalid_argument",
            QuiverError::InvalidConfig(_) => "invalid_config",
            QuiverError::OperationCancelled(_) => "cancelled",
            QuiverError::SerializationError(_) | QuiverError::Json(_) => "serialization_error",
            QuiverError::Other(_) | QuiverError::Anyhow(_) => "internal",
        }
    }
}

impl From<bincode::Error> for QuiverError {
    fn from(err: bincode::Error) -> Self {
        QuiverError::SerializationError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_construction() {
        let error = QuiverError::dimension_mismatch(3, 4);
        assert_eq!(error.to_string(), "Dimension mismatch: expected 3, got 4");

        let error = QuiverError::collection_not_found("docs");
        assert_eq!(error.to_string(), "Collection not found: docs");

        let error = QuiverError::corruption("bad checksum");
        assert_eq!(error.to_string(), "Corruption detected: bad checksum");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "File not found");
        let quiver_error = QuiverError::from(io_error);

        assert!(quiver_error.is_io());
        assert_eq!(quiver_error.code(), "io_error");
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(
            QuiverError::already_exists("docs").code(),
            "already_exists"
        );
        assert_eq!(QuiverError::overloaded("busy").code(), "overloaded");
        assert!(!QuiverError::invalid_argument("k").is_io());
    }
}
