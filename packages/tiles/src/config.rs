//! Tunable constants for the tile service.
//!
//! The defaults are embedded at compile time from `config/default.toml`.
//! Operators override individual keys with their own TOML file (merged
//! key-by-key over the defaults) and a handful of `TICKET_MAP_*`
//! environment variables.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

const DEFAULT_CONFIG: &str = include_str!("../config/default.toml");

/// Tile addressing and payload layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TilesConfig {
    pub extent: u32,
    pub min_zoom: u8,
    pub max_zoom: u8,
    /// At or above this zoom tiles carry raw points instead of clusters.
    pub raw_point_zoom: u8,
}

/// Clustering radius and zoom range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Radius in pixels of a tile `extent` pixels wide.
    pub radius: f64,
    pub extent: u32,
    pub min_zoom: u8,
    pub max_zoom: u8,
    /// Minimum number of points that form a cluster.
    pub min_points: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlicerConfig {
    /// Deepest zoom the slicer splits to eagerly.
    pub index_max_zoom: u8,
    /// Tiles holding at most this many points are not split further.
    pub index_max_points: usize,
    /// Buffer around each tile, in tile extent units.
    pub buffer: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    pub memory_bytes: usize,
    pub base_ttl_secs: u64,
    pub stale_ttl_multiplier: u32,
    pub max_stale_ttl_secs: u64,
    /// Distributed entries larger than this are evicted by the sweeper.
    pub max_payload_bytes: usize,
    pub sweep_interval_secs: u64,
    pub key_prefix: String,
    pub snapshot_dir: PathBuf,
    pub snapshot_max_age_secs: u64,
}

/// Zoom band boundaries with their TTL divisors and request timeouts.
///
/// Zooms up to `coarse_max_zoom` are coarse, up to `middle_max_zoom` are
/// middle and anything deeper is fine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZoomBandConfig {
    pub coarse_max_zoom: u8,
    pub middle_max_zoom: u8,
    pub middle_ttl_divisor: u32,
    pub fine_ttl_divisor: u32,
    pub coarse_timeout_ms: u64,
    pub middle_timeout_ms: u64,
    pub fine_timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConcurrencyConfig {
    /// Simultaneous tile renders allowed per process.
    pub render_permits: usize,
    pub revalidate_queue: usize,
    pub revalidate_workers: usize,
    pub lock_ttl_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoaderConfig {
    /// Minimum time between feature store version checks.
    pub version_check_interval_secs: u64,
    /// First year of the 32-year mask window.
    pub base_year: i32,
    /// Where dataset summary snapshots are persisted.
    pub summary_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryConfig {
    /// Viewport summaries below this zoom are zoom-restricted.
    pub min_zoom: u8,
    pub top_streets: usize,
}

/// Full configuration of a [`crate::TileService`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TileServiceConfig {
    pub tiles: TilesConfig,
    pub cluster: ClusterConfig,
    pub slicer: SlicerConfig,
    pub cache: CacheConfig,
    pub zoom_bands: ZoomBandConfig,
    pub concurrency: ConcurrencyConfig,
    pub loader: LoaderConfig,
    pub summary: SummaryConfig,
}

impl Default for TileServiceConfig {
    /// # Panics
    ///
    /// Panics if the embedded default TOML is malformed (this is a
    /// compile-time guarantee since the file is embedded).
    fn default() -> Self {
        toml::from_str(DEFAULT_CONFIG)
            .unwrap_or_else(|e| panic!("Failed to parse embedded tile config: {e}"))
    }
}

impl TileServiceConfig {
    /// Parses `overrides` and merges it key-by-key over the embedded
    /// defaults. Keys missing from `overrides` keep their default value.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] if either document is not valid TOML
    /// or the merged document does not match the config schema.
    pub fn from_toml_str(overrides: &str) -> Result<Self, ConfigError> {
        let mut merged: toml::Table = toml::from_str(DEFAULT_CONFIG)?;
        let overrides: toml::Table = toml::from_str(overrides)?;
        merge_tables(&mut merged, overrides);
        Ok(toml::Value::Table(merged).try_into()?)
    }

    /// Reads and merges an override file.
    ///
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

    /// Overlays `TICKET_MAP_*` environment variables. Unparseable values
    /// are logged and ignored.
    #[must_use]
    pub fn apply_env(self) -> Self {
        self.apply_vars(|name| std::env::var(name).ok())
    }

    fn apply_vars(mut self, var: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(dir) = var("TICKET_MAP_SNAPSHOT_DIR") {
            self.cache.snapshot_dir = PathBuf::from(dir);
        }
        if let Some(permits) = parse_var(&var, "TICKET_MAP_RENDER_CONCURRENCY") {
            self.concurrency.render_permits = permits;
        }
        if let Some(secs) = parse_var(&var, "TICKET_MAP_BASE_TTL_SECS") {
            self.cache.base_ttl_secs = secs;
        }
        if let Some(bytes) = parse_var(&var, "TICKET_MAP_MEMORY_CACHE_BYTES") {
            self.cache.memory_bytes = bytes;
        }
        self
    }

    #[must_use]
    pub const fn base_ttl(&self) -> Duration {
        Duration::from_secs(self.cache.base_ttl_secs)
    }

    #[must_use]
    pub const fn max_stale_ttl(&self) -> Duration {
        Duration::from_secs(self.cache.max_stale_ttl_secs)
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
    pub const fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.concurrency.lock_ttl_secs)
    }

    #[must_use]
    pub const fn version_check_interval(&self) -> Duration {
        Duration::from_secs(self.loader.version_check_interval_secs)
    }

    #[must_use]
    pub const fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.cache.sweep_interval_secs)
    }
}

fn parse_var<T: std::str::FromStr>(var: &impl Fn(&str) -> Option<String>, name: &str) -> Option<T> {
    let raw = var(name)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            log::warn!("Ignoring {name}={raw:?}: not a valid value");
            None
        }
    }
}

fn merge_tables(base: &mut toml::Table, overrides: toml::Table) {
    for (key, value) in overrides {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(nested)) => {
                merge_tables(existing, nested);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedded_defaults_parse() {
        let config = TileServiceConfig::default();
        assert_eq!(config.tiles.extent, 4096);
        assert!(config.tiles.raw_point_zoom > config.cluster.max_zoom);
        assert!(config.zoom_bands.coarse_max_zoom < config.zoom_bands.middle_max_zoom);
        assert!(config.concurrency.render_permits > 0);
    }

    #[test]
    fn overrides_merge_over_defaults() {
        let config = TileServiceConfig::from_toml_str(
            r#"
            [cluster]
            radius = 40.0

            [cache]
            snapshot_dir = "/var/cache/tiles"
            "#,
        )
        .unwrap();
        assert!((config.cluster.radius - 40.0).abs() < f64::EPSILON);
        assert_eq!(config.cluster.extent, 512);
        assert_eq!(config.cache.snapshot_dir, PathBuf::from("/var/cache/tiles"));
        assert_eq!(config.cache.base_ttl_secs, 86_400);
    }

    #[test]
    fn bad_override_is_rejected() {
        assert!(TileServiceConfig::from_toml_str("[cluster]\nradius = \"wide\"").is_err());
        assert!(TileServiceConfig::from_toml_str("not toml = =").is_err());
    }

    #[test]
    fn env_overlay_applies_valid_values() {
        let config = TileServiceConfig::default().apply_vars(|name| match name {
            "TICKET_MAP_RENDER_CONCURRENCY" => Some("9".to_string()),
            "TICKET_MAP_BASE_TTL_SECS" => Some("soon".to_string()),
            "TICKET_MAP_SNAPSHOT_DIR" => Some("/tmp/snaps".to_string()),
            _ => None,
        });
        assert_eq!(config.concurrency.render_permits, 9);
        assert_eq!(config.cache.base_ttl_secs, 86_400);
        assert_eq!(config.cache.snapshot_dir, PathBuf::from("/tmp/snaps"));
    }
}
