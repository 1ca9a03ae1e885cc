use std::sync::Arc;

use thiserror::Error;

/// Errors from loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Override file could not be read.
    #[error("Failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// TOML syntax or schema error.
    #[error("Invalid config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Errors from reading a dataset out of its collaborators.
///
/// Cloneable so one in-flight load can report the same failure to every
/// caller awaiting it.
#[derive(Debug, Clone, Error)]
pub enum LoadError {
    /// Filesystem error.
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: Arc<std::io::Error>,
    },

    /// A JSON document did not match the expected shape.
    #[error("Invalid JSON in {path}: {message}")]
    Json { path: String, message: String },

    /// A `GeoJSON` document did not match the expected shape.
    #[error("Invalid GeoJSON in {path}: {message}")]
    GeoJson { path: String, message: String },

    /// The chunked feature store failed.
    #[error("Feature store error: {0}")]
    Store(String),

    /// The analytical query fallback failed.
    #[error("Analytical query error: {0}")]
    Analytical(String),

    /// Building the in-memory indices failed.
    #[error("Index build failed: {0}")]
    Build(String),
}

impl LoadError {
    pub(crate) fn io(path: &std::path::Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            source: Arc::new(source),
        }
    }
}

/// Errors surfaced by tile requests.
///
/// Cloneable so a single coalesced generation can hand its result to every
/// waiter.
#[derive(Debug, Clone, Error)]
pub enum TileError {
    /// The caller's cancellation signal fired.
    #[error("Tile request cancelled")]
    Cancelled,

    /// The caller's deadline passed.
    #[error("Tile request timed out")]
    Timeout,

    /// The dataset could not be loaded.
    #[error("Dataset load failed: {0}")]
    Load(#[from] LoadError),

    /// Vector tile encoding failed.
    #[error("Tile encoding failed: {0}")]
    Encode(String),

    /// Generation panicked or was aborted unexpectedly.
    #[error("Tile generation failed: {0}")]
    Generation(String),

    /// The service no longer accepts work.
    #[error("Tile service is shutting down")]
    ShuttingDown,
}

impl TileError {
    /// Whether this error came from the caller's own signal rather than a
    /// failure. Aborts are logged at debug level only.
    #[must_use]
    pub const fn is_abort(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Timeout)
    }
}

impl From<mvt::Error> for TileError {
    fn from(e: mvt::Error) -> Self {
        Self::Encode(e.to_string())
    }
}
