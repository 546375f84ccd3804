use std::fmt;
use std::io;

use tracing::error;

/// The error currency of the whole crate. Every fallible operation on
/// [`crate::BPlusTree`] returns one of these instead of a raw status code.
#[derive(Debug)]
pub enum Error {
    /// `find`/`delete` against a key that is not present.
    NotFound { key: i64 },
    /// `insert` of a key that already exists.
    DuplicateKey { key: i64 },
    /// A positioned read, write, or file extension failed.
    Io(io::Error),
    /// A structural invariant was violated while reading a page.
    Corruption { offset: i64, message: String },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::NotFound { key } => write!(f, "key {} not found", key),
            Error::DuplicateKey { key } => write!(f, "key {} already present", key),
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::Corruption { offset, message } => {
                write!(f, "corruption at page offset {}: {}", offset, message)
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        error!(error = %e, "I/O failure");
        Error::Io(e)
    }
}
