use std::path::{Path, PathBuf};

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CacheError>;

/// Errors surfaced across the cache boundary.
///
/// A disabled cache is not an error: the variant adapters return `None`
/// instead of a handle, and callers simply bypass the cache. Everything a
/// caller can observe going wrong is one of the variants below.
#[derive(Error, Debug)]
pub enum CacheError {
    /// A filesystem operation failed in a way the cache cannot recover from.
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A required configuration key was missing or invalid at initialization.
    #[error("configuration key {key}: {reason}")]
    Config { key: String, reason: String },

    /// The collision chain for one fingerprint grew past the configured
    /// ceiling. Operators should read this as a sign of prefix exhaustion.
    #[error("gave up after {limit} hash collisions probing for resource {resource_id:?}")]
    CollisionLimitExceeded { resource_id: String, limit: u32 },

    /// `create_and_lock` lost the creation race; the caller should fall back
    /// to a blocking read lock on the same path.
    #[error("cache entry {0} already exists")]
    AlreadyExists(PathBuf),

    /// An entry failed a validity check during read. The entry has been (or
    /// is about to be) purged; callers restart as a miss.
    #[error("corrupt cache entry {path}: {reason}")]
    CorruptEntry { path: PathBuf, reason: String },

    /// Failure propagated out of a caller-supplied builder or decoder.
    #[error(transparent)]
    Other(#[from] eyre::Report),
}

impl CacheError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> CacheError {
        CacheError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn config(key: impl Into<String>, reason: impl Into<String>) -> CacheError {
        CacheError::Config {
            key: key.into(),
            reason: reason.into(),
        }
    }

    pub fn corrupt(path: impl Into<PathBuf>, reason: impl Into<String>) -> CacheError {
        CacheError::CorruptEntry {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

/// Attach the offending path when converting raw I/O errors.
pub(crate) trait IoAt<T> {
    fn at(self, path: &Path) -> Result<T>;
}

impl<T> IoAt<T> for std::io::Result<T> {
    fn at(self, path: &Path) -> Result<T> {
        self.map_err(|source| CacheError::io(path, source))
    }
}
