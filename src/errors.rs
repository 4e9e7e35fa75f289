/*!
Error types specific to stratadb as well as wrappers and `From`
implementations for common errors to enable error propagation.

The top-level [`StrataError`] mirrors the classic status taxonomy of the
LevelDB lineage: not found, corruption, not supported, invalid argument, and
I/O error. Background threads latch errors of this type, so every variant is
cheap to clone.
*/

use std::fmt;
use std::io;

/// Alias for a [`Result`] wrapping a [`StrataError`].
pub type StrataResult<T> = Result<T, StrataError>;

/// Top-level database errors.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum StrataError {
    /// The requested key does not exist.
    NotFound,

    /// Stored data failed validation (bad checksum, bad magic number, short reads, etc.).
    Corruption(String),

    /// The requested operation is not supported by this build or configuration.
    NotSupported(String),

    /// A caller-supplied argument or option is unusable.
    InvalidArgument(String),

    /// An error bubbled up from the file system.
    Io(DbIoError),
}

impl std::error::Error for StrataError {}

impl fmt::Display for StrataError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StrataError::NotFound => write!(f, "NotFound"),
            StrataError::Corruption(reason) => write!(f, "Corruption: {reason}"),
            StrataError::NotSupported(reason) => write!(f, "Not supported: {reason}"),
            StrataError::InvalidArgument(reason) => write!(f, "Invalid argument: {reason}"),
            StrataError::Io(base_err) => write!(f, "IO error: {base_err}"),
        }
    }
}

impl From<io::Error> for StrataError {
    fn from(err: io::Error) -> Self {
        StrataError::Io(DbIoError::from(err))
    }
}

impl From<DbIoError> for StrataError {
    fn from(err: DbIoError) -> Self {
        StrataError::Io(err)
    }
}

impl From<LogIoError> for StrataError {
    fn from(err: LogIoError) -> Self {
        match err {
            LogIoError::Io(base_err) => StrataError::Io(base_err),
            LogIoError::Corruption { reason, .. } => StrataError::Corruption(reason),
        }
    }
}

/**
A cloneable stand-in for [`std::io::Error`].

[`std::io::Error`] does not implement `Clone`, but the database needs to
latch background write failures and return them from every subsequent write
request.
*/
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DbIoError {
    kind: io::ErrorKind,
    message: String,
}

impl DbIoError {
    /// Create a new instance of [`DbIoError`].
    pub fn new(kind: io::ErrorKind, message: String) -> Self {
        Self { kind, message }
    }

    /// The [`io::ErrorKind`] of the underlying error.
    pub fn kind(&self) -> io::ErrorKind {
        self.kind
    }
}

impl std::error::Error for DbIoError {}

impl fmt::Display for DbIoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:?})", self.message, self.kind)
    }
}

impl From<io::Error> for DbIoError {
    fn from(err: io::Error) -> Self {
        DbIoError {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Alias for a [`Result`] wrapping a [`LogIoError`].
pub(crate) type LogIoResult<T> = Result<T, LogIoError>;

/// Errors from reading or writing the framed log format (WAL and manifest).
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum LogIoError {
    /// Variant for errors that are related to I/O.
    Io(DbIoError),

    /// Variant for malformed data encountered in a log file.
    Corruption {
        /// The number of bytes that had to be dropped to get past the damage.
        bytes_dropped: usize,
        /// A human readable reason for the corruption event.
        reason: String,
    },
}

impl std::error::Error for LogIoError {}

impl fmt::Display for LogIoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogIoError::Io(base_err) => write!(f, "{base_err}"),
            LogIoError::Corruption {
                bytes_dropped,
                reason,
            } => {
                write!(f, "log corruption ({bytes_dropped} bytes dropped): {reason}")
            }
        }
    }
}

impl From<io::Error> for LogIoError {
    fn from(err: io::Error) -> Self {
        LogIoError::Io(DbIoError::from(err))
    }
}
