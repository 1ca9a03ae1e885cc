#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Versioned point tiles for the ticket map.
//!
//! A [`DatasetLoader`] turns the features of one dataset version into a
//! cluster hierarchy ([`cluster`]), a quad-tree of raw points
//! ([`slicer`]) and a spatial index for viewport summaries. The
//! [`TileService`] renders Mapbox Vector Tiles from those indices and
//! serves them through a memory, distributed and disk cache waterfall with
//! stale-while-revalidate, request coalescing and zoom-dependent TTLs and
//! timeouts.

pub mod cluster;
pub mod config;
pub mod encode;
pub mod error;
pub mod loader;
pub mod metrics;
pub mod point;
pub mod policy;
pub mod revalidate;
pub mod service;
pub mod signal;
pub mod slicer;
pub mod store;

#[cfg(test)]
mod test_support;

pub use config::TileServiceConfig;
pub use error::{ConfigError, LoadError, TileError};
pub use loader::{DatasetIndices, DatasetLoader};
pub use metrics::MetricsSnapshot;
pub use policy::{TilePolicy, ZoomBand};
pub use service::{PrewarmStats, TileRequestOptions, TileService};
pub use signal::Signal;
pub use store::{AnalyticalSource, DirectoryFeatureStore, FeatureStore, MemoryFeatureStore};

#[cfg(feature = "duckdb")]
pub use store::DuckDbAnalyticalSource;
