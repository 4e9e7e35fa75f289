//! Error types for reading and building table files.

use std::fmt;
use std::io;

use crate::errors::{DbIoError, StrataError};

/// Alias for a [`Result`] wrapping a [`ReadError`].
pub(crate) type TableReadResult<T> = Result<T, ReadError>;

/// Errors encountered while reading a table file.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ReadError {
    /// A structure in the file did not parse.
    FailedToParse(String),

    /// A block failed checksum verification.
    ChecksumMismatch {
        expected: u32,
        actual: u32,
    },

    /// A compressed block could not be decompressed.
    Decompression(String),

    /// The underlying file could not be read.
    Io(DbIoError),
}

impl std::error::Error for ReadError {}

impl fmt::Display for ReadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadError::FailedToParse(reason) => write!(f, "table parse failure: {reason}"),
            ReadError::ChecksumMismatch { expected, actual } => write!(
                f,
                "block checksum mismatch: expected {expected:#010x}, computed {actual:#010x}"
            ),
            ReadError::Decompression(reason) => {
                write!(f, "block decompression failure: {reason}")
            }
            ReadError::Io(base_err) => write!(f, "{base_err}"),
        }
    }
}

impl From<io::Error> for ReadError {
    fn from(err: io::Error) -> Self {
        ReadError::Io(DbIoError::from(err))
    }
}

impl From<ReadError> for StrataError {
    fn from(err: ReadError) -> Self {
        match err {
            ReadError::Io(base_err) => StrataError::Io(base_err),
            other => StrataError::Corruption(other.to_string()),
        }
    }
}

/// Errors encountered while building a table file.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum BuilderError {
    /// The builder was used after being finalized or abandoned.
    AlreadyClosed,

    /// Keys were added out of sorted order.
    OutOfOrder,

    /// The underlying file could not be written.
    Io(DbIoError),
}

impl std::error::Error for BuilderError {}

impl fmt::Display for BuilderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuilderError::AlreadyClosed => {
                write!(f, "Attempted to add to a finalized or abandoned table.")
            }
            BuilderError::OutOfOrder => {
                write!(f, "Keys must be added to a table in sorted order.")
            }
            BuilderError::Io(base_err) => write!(f, "{base_err}"),
        }
    }
}

impl From<io::Error> for BuilderError {
    fn from(err: io::Error) -> Self {
        BuilderError::Io(DbIoError::from(err))
    }
}

impl From<BuilderError> for StrataError {
    fn from(err: BuilderError) -> Self {
        match err {
            BuilderError::Io(base_err) => StrataError::Io(base_err),
            other => StrataError::InvalidArgument(other.to_string()),
        }
    }
}
