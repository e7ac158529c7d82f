//! Error types for vertex data operations.

use thiserror::Error;

/// Errors that can surface from stream serialization and the save file.
///
/// Contract violations (unregistered formats, unknown device contexts,
/// corrupt scratch data) do not travel through this enum; they are
/// assertion-class failures raised at the call site.
#[derive(Debug, Error)]
pub enum VertexDataError {
    /// The stream does not begin with the expected magic bytes.
    #[error("bad stream magic (not a vertex data stream)")]
    BadMagic,

    /// The stream was produced by a version this reader no longer supports.
    #[error("unsupported stream version {major}.{minor}")]
    StaleVersion {
        /// Major version found in the stream.
        major: u16,
        /// Minor version found in the stream.
        minor: u16,
    },

    /// The stream ended before the record was complete.
    #[error("truncated stream")]
    Truncated,

    /// A field in the stream was structurally invalid.
    #[error("malformed stream: {0}")]
    Malformed(&'static str),

    /// An individual buffer larger than 4 GiB cannot be serialized
    /// (the durable format stores a 32-bit byte count).
    #[error("buffer of {size} bytes is too large to serialize")]
    BufferTooLarge {
        /// Byte length of the offending buffer.
        size: usize,
    },

    /// An underlying I/O failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for vertex data operations.
pub type VertexDataResult<T> = Result<T, VertexDataError>;
