#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Ward polygon tiles for the ticket map.
//!
//! [`WardTileService`] serves choropleth tiles of municipal wards with
//! per-ward rollup totals baked into each polygon's properties. Indices are
//! built lazily per [`ticket_map_wards_models::WardDataset`] from a
//! [`WardSource`] and rebuilt when the rollup version changes.

pub mod config;
pub mod error;
pub mod index;
pub mod service;
pub mod source;

pub use config::{WardCacheConfig, WardServiceConfig, WardTilesConfig};
pub use error::{ConfigError, WardError};
pub use index::{WardProperties, WardTileIndex};
pub use service::WardTileService;
pub use source::{DirectoryWardSource, StaticWardSource, WardSource, parse_ward_collection};
