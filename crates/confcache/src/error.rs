use std::fmt;

/// The single error type threaded through `confcache` and, via re-export,
/// `confcore`. Mirrors the shape of the teacher's `pagecache::Error`: a thin
/// wrapper around I/O failures plus a couple of domain-specific variants.
#[derive(Debug)]
pub enum Error {
    /// An underlying I/O operation failed (open, read, write, rename, lock).
    Io(std::io::Error),
    /// The bytes read did not form a well-formed prefs file at the given
    /// location description (typically `"path:line"`).
    Corruption { at: String },
    /// A configuration value or combination of values is not supported.
    Unsupported(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "io error: {}", e),
            Error::Corruption { at } => write!(f, "corrupt config data at {}", at),
            Error::Unsupported(msg) => write!(f, "unsupported configuration: {}", msg),
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

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Error {
        Error::Io(e)
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
