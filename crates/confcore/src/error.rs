use std::fmt;

/// `confcore`'s error type layers two engine-specific variants on top of the
/// `confcache::Error` shape it re-exports, the way `sled::DbResult` wraps
/// `pagecache::CacheResult` rather than inventing an unrelated hierarchy.
#[derive(Debug)]
pub enum Error {
    Cache(confcache::Error),
    /// A registration request violated the startup-duplicate rule (§4.4).
    Registration(String),
    /// A dispatch/queue invariant was violated (should only ever fire from
    /// a `debug_assert!`-style internal bug, never from user input).
    Dispatch(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Cache(e) => write!(f, "{}", e),
            Error::Registration(msg) => write!(f, "registration error: {}", msg),
            Error::Dispatch(msg) => write!(f, "dispatch error: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Cache(e) => Some(e),
            _ => None,
        }
    }
}

impl From<confcache::Error> for Error {
    fn from(e: confcache::Error) -> Error {
        Error::Cache(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
