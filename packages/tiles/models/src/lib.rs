#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! Shared types for the ticket map tile pipeline.
//!
//! Defines the enforcement datasets, the tagged feature variants produced
//! by ingestion, the lightweight [`SummaryPoint`] used by viewport queries,
//! tile addressing ([`TileCoord`], [`TileKey`]), dataset versions, and the
//! response shapes handed to the HTTP layer.

pub mod intern;
pub mod mask;
pub mod mercator;
pub mod progress;

use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

pub use intern::StringTable;
pub use mask::{BitSet, MonthMask, YearMask, YearWindow};
pub use progress::{NullProgress, ProgressCallback, null_progress};

/// An enforcement dataset that can be rendered as point tiles.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Dataset {
    /// Municipal parking tickets
    ParkingTickets,
    /// Red light camera charges
    RedLightCameras,
    /// Automated speed enforcement camera charges
    SpeedCameras,
}

impl Dataset {
    /// Returns every dataset.
    #[must_use]
    pub const fn all() -> &'static [Self] {
        &[Self::ParkingTickets, Self::RedLightCameras, Self::SpeedCameras]
    }

    /// Name of the vector tile layer this dataset renders into.
    #[must_use]
    pub const fn layer_name(self) -> &'static str {
        match self {
            Self::ParkingTickets => "parking",
            Self::RedLightCameras => "red_light",
            Self::SpeedCameras => "speed",
        }
    }
}

/// Kind of traffic camera.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum CameraType {
    RedLight,
    Speed,
}

/// Revenue in cents. Exact for the 2-decimal currency amounts the
/// datasets carry.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Cents(pub i64);

impl Cents {
    pub const ZERO: Self = Self(0);

    /// Converts a dollar amount, rounding to the nearest cent.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn from_dollars(dollars: f64) -> Self {
        Self((dollars * 100.0).round() as i64)
    }

    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn as_dollars(self) -> f64 {
        self.0 as f64 / 100.0
    }
}

impl Add for Cents {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self(self.0 + rhs.0)
    }
}

impl AddAssign for Cents {
    fn add_assign(&mut self, rhs: Self) {
        self.0 += rhs.0;
    }
}

impl Sum for Cents {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::ZERO, Add::add)
    }
}

impl fmt::Display for Cents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(f, "{sign}${}.{:02}", abs / 100, abs % 100)
    }
}

/// Dataset-specific attributes of a [`Feature`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FeatureKind {
    /// A parking enforcement location.
    Parking {
        /// Location description as written on the ticket.
        location: String,
        /// Normalized street name, when one could be extracted.
        #[serde(default)]
        street: Option<String>,
    },
    /// A traffic camera site.
    Camera {
        /// Intersection or road segment the camera monitors.
        intersection: String,
        camera_type: CameraType,
        /// Ward the camera is located in.
        #[serde(default)]
        ward: Option<u32>,
    },
}

/// One enforcement location with its aggregated ticket history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Feature {
    /// Stable id assigned by ingestion.
    pub id: u64,
    pub longitude: f64,
    pub latitude: f64,
    pub ticket_count: u64,
    pub total_revenue: Cents,
    /// Most frequent infraction code at this location.
    #[serde(default)]
    pub top_infraction: Option<String>,
    #[serde(default)]
    pub year_mask: YearMask,
    #[serde(default)]
    pub month_mask: MonthMask,
    pub kind: FeatureKind,
}

impl Feature {
    /// Whether the coordinates are finite and inside the mercator range.
    #[must_use]
    pub fn has_valid_position(&self) -> bool {
        self.longitude.is_finite()
            && self.latitude.is_finite()
            && (-180.0..=180.0).contains(&self.longitude)
            && (-mercator::MAX_LATITUDE..=mercator::MAX_LATITUDE).contains(&self.latitude)
    }

    /// Name used to key per-location statistics.
    #[must_use]
    pub fn location_name(&self) -> &str {
        match &self.kind {
            FeatureKind::Parking { location, .. } => location,
            FeatureKind::Camera { intersection, .. } => intersection,
        }
    }

    /// Street name used for top-street rankings.
    #[must_use]
    pub fn street_name(&self) -> Option<&str> {
        match &self.kind {
            FeatureKind::Parking { street, .. } => street.as_deref(),
            FeatureKind::Camera { .. } => None,
        }
    }
}

/// Lightweight per-location record used by the spatial query index.
///
/// Names are stored as ids into shared [`StringTable`]s built by the
/// dataset loader.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SummaryPoint {
    pub longitude: f64,
    pub latitude: f64,
    pub ticket_count: u64,
    pub total_revenue: Cents,
    pub location_id: u32,
    pub street_id: Option<u32>,
    pub year_mask: YearMask,
    pub month_mask: MonthMask,
}

/// Ticket totals for one location in one calendar year.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct YearTotals {
    pub ticket_count: u64,
    pub total_revenue: Cents,
}

/// Identifies one consistent snapshot of a dataset.
///
/// Versions are ordered; a larger value is a newer snapshot. Sources that
/// publish timestamps use [`DatasetVersion::from_timestamp`], sources with
/// revision counters use the revision directly.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct DatasetVersion(pub u64);

impl DatasetVersion {
    /// Version of a dataset that has never been loaded.
    pub const EMPTY: Self = Self(0);

    #[must_use]
    #[allow(clippy::cast_sign_loss)]
    pub fn from_timestamp(at: DateTime<Utc>) -> Self {
        Self(at.timestamp_millis().max(0) as u64)
    }
}

impl fmt::Display for DatasetVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// A geographic bounding box in WGS84 coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    /// Western longitude boundary.
    pub west: f64,
    /// Southern latitude boundary.
    pub south: f64,
    /// Eastern longitude boundary.
    pub east: f64,
    /// Northern latitude boundary.
    pub north: f64,
}

impl BoundingBox {
    /// Creates a new bounding box from the given coordinates.
    #[must_use]
    pub const fn new(west: f64, south: f64, east: f64, north: f64) -> Self {
        Self {
            west,
            south,
            east,
            north,
        }
    }

    /// Whether the box wraps across the antimeridian, i.e. `west > east`.
    #[must_use]
    pub const fn crosses_antimeridian(&self) -> bool {
        self.west > self.east
    }

    #[must_use]
    pub fn contains(&self, lon: f64, lat: f64) -> bool {
        let in_lon = if self.crosses_antimeridian() {
            lon >= self.west || lon <= self.east
        } else {
            (self.west..=self.east).contains(&lon)
        };
        in_lon && (self.south..=self.north).contains(&lat)
    }

    /// Parses `"west,south,east,north"`.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        let parts: Vec<f64> = s.split(',').filter_map(|p| p.trim().parse().ok()).collect();
        if parts.len() == 4 {
            Some(Self::new(parts[0], parts[1], parts[2], parts[3]))
        } else {
            None
        }
    }
}

/// A cell of the quad-tree tile pyramid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TileCoord {
    pub z: u8,
    pub x: u32,
    pub y: u32,
}

impl TileCoord {
    /// Deepest zoom representable with `u32` tile indices.
    pub const MAX_ZOOM: u8 = 31;

    #[must_use]
    pub const fn new(z: u8, x: u32, y: u32) -> Self {
        Self { z, x, y }
    }

    /// Whether `x` and `y` are inside the `2^z` grid.
    #[must_use]
    pub const fn is_valid(self) -> bool {
        if self.z > Self::MAX_ZOOM {
            return false;
        }
        let n = 1u64 << self.z;
        (self.x as u64) < n && (self.y as u64) < n
    }

    #[must_use]
    pub const fn parent(self) -> Option<Self> {
        if self.z == 0 {
            None
        } else {
            Some(Self::new(self.z - 1, self.x / 2, self.y / 2))
        }
    }

    /// The ancestor of this tile at `zoom` (or itself when `zoom >= z`).
    #[must_use]
    pub const fn ancestor_at(self, zoom: u8) -> Self {
        if zoom >= self.z {
            return self;
        }
        let shift = self.z - zoom;
        Self::new(zoom, self.x >> shift, self.y >> shift)
    }

    /// Geographic bounds of this tile.
    #[must_use]
    pub fn bounds(self) -> BoundingBox {
        let n = mercator::tiles_per_axis(self.z);
        BoundingBox::new(
            mercator::x_to_lon(f64::from(self.x) / n),
            mercator::y_to_lat(f64::from(self.y + 1) / n),
            mercator::x_to_lon(f64::from(self.x + 1) / n),
            mercator::y_to_lat(f64::from(self.y) / n),
        )
    }
}

impl fmt::Display for TileCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.z, self.x, self.y)
    }
}

/// Cache key of a point tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TileKey {
    pub dataset: Dataset,
    pub coord: TileCoord,
}

impl TileKey {
    #[must_use]
    pub const fn new(dataset: Dataset, z: u8, x: u32, y: u32) -> Self {
        Self {
            dataset,
            coord: TileCoord::new(z, x, y),
        }
    }
}

impl fmt::Display for TileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.dataset, self.coord)
    }
}

/// Which cache tier answered a tile request.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum TileSource {
    Memory,
    DistributedLive,
    DistributedStale,
    DiskSnapshot,
    Generated,
}

/// An encoded tile handed back to the HTTP layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileResponse {
    /// Encoded Mapbox Vector Tile bytes.
    pub buffer: Arc<[u8]>,
    /// Dataset version the tile was generated from.
    pub version: DatasetVersion,
    pub source: TileSource,
    /// Content hash of `buffer`.
    pub etag: String,
}

/// Optional temporal filters for viewport summaries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryFilters {
    pub year: Option<i32>,
    /// Calendar month, 1-12.
    pub month: Option<u8>,
}

/// Ticket totals for one street inside a viewport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreetTotal {
    pub street: String,
    pub ticket_count: u64,
    pub total_revenue: Cents,
}

/// Aggregate of everything visible in a viewport.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewportSummary {
    /// `true` when the zoom is below the summary floor; all totals are
    /// zero in that case.
    pub zoom_restricted: bool,
    /// `false` when the dataset has not finished loading.
    pub ready: bool,
    pub visible_count: u64,
    pub visible_revenue: Cents,
    pub top_streets: Vec<StreetTotal>,
}

impl ViewportSummary {
    #[must_use]
    pub fn restricted() -> Self {
        Self {
            zoom_restricted: true,
            ready: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn not_ready() -> Self {
        Self::default()
    }
}

/// Dataset-wide totals, persisted alongside each loaded version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatasetSummary {
    pub dataset: Dataset,
    pub version: DatasetVersion,
    pub feature_count: u64,
    pub ticket_count: u64,
    pub total_revenue: Cents,
    pub top_streets: Vec<StreetTotal>,
}

impl DatasetSummary {
    /// All-zero summary for a dataset with no data.
    #[must_use]
    pub const fn empty(dataset: Dataset) -> Self {
        Self {
            dataset,
            version: DatasetVersion::EMPTY,
            feature_count: 0,
            ticket_count: 0,
            total_revenue: Cents::ZERO,
            top_streets: Vec::new(),
        }
    }
}
