//! Error types for cache operations.

use thiserror::Error;

/// Result type for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;

/// Cache-specific errors.
///
/// In production mode the facade intercepts every one of these at its
/// operation boundary; they only reach callers in development mode.
#[derive(Debug, Error)]
pub enum CacheError {
    /// No reachable server, or the connection was disabled.
    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    /// A single backend call failed.
    #[error("Backend error: {0}")]
    Backend(String),

    /// Memcached-specific error
    #[cfg(feature = "memcached")]
    #[error("Memcached error: {0}")]
    Memcached(#[from] memcache::MemcacheError),

    /// The caller-supplied fallback producer failed.
    #[error("Fallback producer failed for key '{key}': {message}")]
    Fallback {
        /// Logical key the fallback was invoked for
        key: String,
        /// Rendered producer error
        message: String,
    },

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Deserialization error
    #[error("Deserialization error: {0}")]
    Deserialization(String),

    /// Payload compression or decompression failed
    #[error("Compression error: {0}")]
    Compression(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Generic error
    #[error("Cache error: {0}")]
    Other(String),
}

impl CacheError {
    /// Whether this error came from the backend itself and therefore counts
    /// towards the connection's failure limit.
    pub fn is_backend_failure(&self) -> bool {
        match self {
            Self::Unavailable(_) | Self::Backend(_) => true,
            #[cfg(feature = "memcached")]
            Self::Memcached(_) => true,
            _ => false,
        }
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_syntax() || err.is_eof() {
            Self::Deserialization(err.to_string())
        } else {
            Self::Serialization(err.to_string())
        }
    }
}

impl From<tokio::task::JoinError> for CacheError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Other(format!("Task join error: {}", err))
    }
}
