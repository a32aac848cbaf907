//! Error types for packet stream reading.
//!
//! Every fallible operation in the crate returns [`StreamError`]. The variants
//! follow the failure classes a reader can hit:
//!
//! - **Format errors**: the bytes on disk violate the stream format (bad magic,
//!   mismatched source ids, out-of-sequence source declarations)
//! - **Record errors**: a structured record could not be parsed at all
//! - **Usage errors**: the caller used the reader in the wrong state
//! - **Range errors**: a seek target does not exist in the stream
//! - **File / I/O errors**: the medium itself failed
//!
//! Recoverable corruption (an unknown tag between frames) and best-effort
//! failures (a missing or malformed footer index) never reach the caller; they
//! are logged through `tracing` and handled inside the reader.
//!
//! ```rust
//! use packetstream::StreamError;
//!
//! let error = StreamError::usage_error("reader is not positioned on a payload");
//! assert!(!error.is_retryable());
//! for suggestion in error.recovery_suggestions() {
//!     println!("  - {}", suggestion);
//! }
//! ```

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for stream operations.
pub type Result<T, E = StreamError> = std::result::Result<T, E>;

/// Main error type for stream operations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum StreamError {
    #[error("Stream format error in {context}: {details}")]
    Format { context: String, details: String },

    #[error("Malformed structured record in {context}")]
    Record {
        context: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid reader usage: {details}")]
    Usage { details: String },

    #[error("Frame {frame} of source {source_id} is not in the stream")]
    Range { source_id: usize, frame: u64 },

    #[error("Stream file error: {path}")]
    File {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error during {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl StreamError {
    /// Returns whether this error is potentially recoverable through retry.
    ///
    /// Only medium failures qualify: a live capture may simply not have
    /// produced the bytes yet.
    pub fn is_retryable(&self) -> bool {
        match self {
            StreamError::Io { .. } => true,
            StreamError::File { .. } => true,
            StreamError::Format { .. } => false,
            StreamError::Record { .. } => false,
            StreamError::Usage { .. } => false,
            StreamError::Range { .. } => false,
        }
    }

    /// Returns whether this error means the bytes of the stream are invalid.
    pub fn is_format_error(&self) -> bool {
        matches!(self, StreamError::Format { .. } | StreamError::Record { .. })
    }

    /// Returns suggested recovery actions for this error.
    pub fn recovery_suggestions(&self) -> Vec<&'static str> {
        match self {
            StreamError::Format { .. } | StreamError::Record { .. } => vec![
                "Close the reader; its position is undefined after a format error",
                "Check the file was written by a compatible stream writer",
                "Verify the file was not truncated or overwritten",
            ],
            StreamError::Usage { .. } => vec![
                "Call next_frame() before reading or skipping payload bytes",
                "Only seek on regular files, not pipes",
                "Use a source id from the reader's declared sources",
            ],
            StreamError::Range { .. } => vec![
                "Check the frame number against the source's frame count",
                "Wait for a live writer to append more frames",
            ],
            StreamError::File { .. } => vec![
                "Check the file exists and is readable",
                "For pipes, make sure a writer is attached",
                "Check file permissions",
            ],
            StreamError::Io { .. } => vec![
                "Retry once the writer has flushed more data",
                "Verify the underlying device is still available",
            ],
        }
    }

    /// Helper constructor for format errors.
    pub fn format_error(context: impl Into<String>, details: impl Into<String>) -> Self {
        StreamError::Format { context: context.into(), details: details.into() }
    }

    /// Helper constructor for usage errors.
    pub fn usage_error(details: impl Into<String>) -> Self {
        StreamError::Usage { details: details.into() }
    }

    /// Helper constructor for file errors with path context.
    pub fn file_error(path: PathBuf, source: std::io::Error) -> Self {
        StreamError::File { path, source }
    }

    /// Helper constructor for mid-stream I/O errors.
    pub fn io_error(context: impl Into<String>, source: std::io::Error) -> Self {
        StreamError::Io { context: context.into(), source }
    }

    /// Helper constructor for unparsable structured records.
    pub fn record_error(context: impl Into<String>, source: serde_json::Error) -> Self {
        StreamError::Record { context: context.into(), source }
    }

    /// True when the underlying I/O failure is a short read at end of data.
    pub(crate) fn is_unexpected_eof(&self) -> bool {
        match self {
            StreamError::Io { source, .. } => source.kind() == std::io::ErrorKind::UnexpectedEof,
            StreamError::Record { source, .. } => source.is_eof(),
            _ => false,
        }
    }
}

impl From<std::io::Error> for StreamError {
    fn from(err: std::io::Error) -> Self {
        StreamError::Io { context: "stream read".to_string(), source: err }
    }
}
