use std::fmt::Display;

/// Errors returned by cache tables and the table registry.
#[derive(Debug)]
pub enum CacheError {
    /// The key is not in the table. Raised alike for keys that never existed,
    /// were deleted, or expired.
    NotFound,
    /// The sweeper thread of a new table could not be spawned.
    Io(std::io::Error),
}

impl Display for CacheError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheError::NotFound => {
                write!(f, "Key not found in cache")
            }
            CacheError::Io(e) => {
                write!(f, "Io error [{:?}]", e.to_string())
            }
        }
    }
}

impl std::error::Error for CacheError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CacheError::NotFound => None,
            CacheError::Io(e) => Some(e),
        }
    }
}

impl From<std::io::Error> for CacheError {
    fn from(value: std::io::Error) -> Self {
        CacheError::Io(value)
    }
}
