use std::sync::Arc;

use thiserror::Error;

/// Errors from loading the ward service configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Errors from the ward tile pipeline.
///
/// Cloneable so a single index build can report its failure to every
/// request waiting on it.
#[derive(Debug, Clone, Error)]
pub enum WardError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: Arc<std::io::Error>,
    },

    /// The ward boundary document could not be parsed.
    #[error("Invalid ward GeoJSON: {0}")]
    GeoJson(String),

    /// A rollup document could not be parsed.
    #[error("Invalid ward rollup in {path}: {message}")]
    Rollup { path: String, message: String },

    /// The ward geometry collaborator failed.
    #[error("Ward source error: {0}")]
    Source(String),

    #[error("Ward tile encoding failed: {0}")]
    Encode(String),

    /// A cache tier failed while persisting ward tiles.
    #[error("Ward cache error: {0}")]
    Cache(String),

    /// Building the tile index panicked or was aborted.
    #[error("Ward index build failed: {0}")]
    Build(String),
}

impl WardError {
    pub(crate) fn io(path: &std::path::Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            source: Arc::new(source),
        }
    }
}

impl From<ticket_map_cache::CacheError> for WardError {
    fn from(e: ticket_map_cache::CacheError) -> Self {
        Self::Cache(e.to_string())
    }
}

impl From<mvt::Error> for WardError {
    fn from(e: mvt::Error) -> Self {
        Self::Encode(e.to_string())
    }
}
