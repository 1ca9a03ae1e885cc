//! Tunable constants for the ward tile service, embedded from
//! `config/default.toml` and overridable by file or environment.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

const DEFAULT_CONFIG: &str = include_str!("../config/default.toml");

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WardTilesConfig {
    pub extent: u32,
    pub min_zoom: u8,
    pub max_zoom: u8,
    /// Clip buffer in extent units.
    pub buffer: u32,
    /// Douglas-Peucker tolerance in extent units.
    pub simplify_tolerance: f64,
    /// Zooms above this one use the unsimplified geometry.
    pub simplify_max_zoom: u8,
    pub layer_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WardCacheConfig {
    pub memory_bytes: usize,
    pub ttl_secs: u64,
    pub key_prefix: String,
    pub snapshot_dir: PathBuf,
    pub snapshot_max_age_secs: u64,
    pub rollup_check_interval_secs: u64,
}

/// Full configuration of a [`crate::WardTileService`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WardServiceConfig {
    pub tiles: WardTilesConfig,
    pub cache: WardCacheConfig,
}

impl Default for WardServiceConfig {
    /// # Panics
    ///
    /// Panics if the embedded default TOML is malformed.
    fn default() -> Self {
        toml::from_str(DEFAULT_CONFIG)
            .unwrap_or_else(|e| panic!("Failed to parse embedded ward config: {e}"))
    }
}

impl WardServiceConfig {
    /// Parses `overrides` over the embedded defaults, key by key.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] if the document is not valid TOML or
    /// the merged result does not match the schema.
    pub fn from_toml_str(overrides: &str) -> Result<Self, ConfigError> {
        let mut merged: toml::Table = toml::from_str(DEFAULT_CONFIG)?;
        let overrides: toml::Table = toml::from_str(overrides)?;
        for (section, value) in overrides {
            match (merged.get_mut(&section), value) {
                (Some(toml::Value::Table(existing)), toml::Value::Table(nested)) => {
                    existing.extend(nested);
                }
                (_, value) => {
                    merged.insert(section, value);
                }
            }
        }
        Ok(toml::Value::Table(merged).try_into()?)
    }

    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file cannot be read, or
    /// [`ConfigError::Parse`] if it is not a valid override document.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        Self::from_toml_str(&contents)
    }

    /// Overlays `TICKET_MAP_WARD_SNAPSHOT_DIR`.
    #[must_use]
    pub fn apply_env(mut self) -> Self {
        if let Ok(dir) = std::env::var("TICKET_MAP_WARD_SNAPSHOT_DIR") {
            self.cache.snapshot_dir = PathBuf::from(dir);
        }
        self
    }

    #[must_use]
    pub const fn ttl(&self) -> Duration {
        Duration::from_secs(self.cache.ttl_secs)
    }

    #[must_use]
    pub const fn snapshot_max_age(&self) -> Option<Duration> {
        if self.cache.snapshot_max_age_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.cache.snapshot_max_age_secs))
        }
    }

    #[must_use]
    pub const fn rollup_check_interval(&self) -> Duration {
        Duration::from_secs(self.cache.rollup_check_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedded_defaults_parse() {
        let config = WardServiceConfig::default();
        assert_eq!(config.tiles.extent, 4096);
        assert_eq!(config.tiles.layer_name, "wards");
        assert!(config.tiles.simplify_max_zoom <= config.tiles.max_zoom);
    }

    #[test]
    fn overrides_keep_other_keys() {
        let config = WardServiceConfig::from_toml_str(
            r#"
            [cache]
            key_prefix = "wt"
            "#,
        )
        .unwrap();
        assert_eq!(config.cache.key_prefix, "wt");
        assert_eq!(config.cache.ttl_secs, 86_400);
        assert_eq!(config.tiles.buffer, 64);
    }

    #[test]
    fn unknown_types_are_rejected() {
        assert!(WardServiceConfig::from_toml_str("[tiles]\nextent = \"big\"").is_err());
    }
}
