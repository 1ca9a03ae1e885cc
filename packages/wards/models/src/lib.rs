#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Ward polygons and the per-ward aggregates merged into ward tiles.

use std::collections::BTreeMap;
use std::sync::Arc;

use geo::MultiPolygon;
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};
use ticket_map_tiles_models::{Cents, Dataset, DatasetVersion};

/// A choropleth layer of ward tiles.
///
/// Each point dataset has its own ward rollup; `Combined` aggregates all
/// of them.
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
pub enum WardDataset {
    ParkingTickets,
    RedLightCameras,
    SpeedCameras,
    Combined,
}

impl WardDataset {
    #[must_use]
    pub const fn all() -> &'static [Self] {
        &[
            Self::ParkingTickets,
            Self::RedLightCameras,
            Self::SpeedCameras,
            Self::Combined,
        ]
    }

    /// Point datasets aggregated by this ward layer.
    #[must_use]
    pub const fn members(self) -> &'static [Dataset] {
        match self {
            Self::ParkingTickets => &[Dataset::ParkingTickets],
            Self::RedLightCameras => &[Dataset::RedLightCameras],
            Self::SpeedCameras => &[Dataset::SpeedCameras],
            Self::Combined => Dataset::all(),
        }
    }
}

impl From<Dataset> for WardDataset {
    fn from(dataset: Dataset) -> Self {
        match dataset {
            Dataset::ParkingTickets => Self::ParkingTickets,
            Dataset::RedLightCameras => Self::RedLightCameras,
            Dataset::SpeedCameras => Self::SpeedCameras,
        }
    }
}

/// One ward boundary in WGS84 coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct WardPolygon {
    /// Ward identifier as published by the municipality (e.g. `"10"`).
    pub code: String,
    pub name: String,
    pub geometry: MultiPolygon<f64>,
}

/// Tickets and revenue for one dataset inside a ward.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatasetTotals {
    pub ticket_count: u64,
    pub total_revenue: Cents,
}

/// Aggregates for one ward.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WardTotals {
    pub ticket_count: u64,
    pub total_revenue: Cents,
    /// Breakdown by contributing dataset.
    #[serde(default)]
    pub by_dataset: BTreeMap<Dataset, DatasetTotals>,
}

impl WardTotals {
    /// Adds one dataset's contribution to the totals and the breakdown.
    pub fn add(&mut self, dataset: Dataset, ticket_count: u64, total_revenue: Cents) {
        self.ticket_count += ticket_count;
        self.total_revenue += total_revenue;
        let entry = self.by_dataset.entry(dataset).or_default();
        entry.ticket_count += ticket_count;
        entry.total_revenue += total_revenue;
    }
}

/// Per-ward aggregates computed outside the tile pipeline.
///
/// Every recomputation publishes a new `version`; ward tiles built from
/// one rollup version are never served for another.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WardRollup {
    pub version: DatasetVersion,
    /// Totals keyed by ward code.
    #[serde(default)]
    pub wards: BTreeMap<String, WardTotals>,
}

impl WardRollup {
    /// Totals for `code`, all zero when the ward has no records.
    #[must_use]
    pub fn totals(&self, code: &str) -> WardTotals {
        self.wards.get(code).cloned().unwrap_or_default()
    }
}

/// An encoded ward tile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WardTile {
    /// Encoded Mapbox Vector Tile bytes.
    pub buffer: Arc<[u8]>,
    /// Rollup version the tile was built from.
    pub version: DatasetVersion,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combined_covers_every_dataset() {
        assert_eq!(WardDataset::Combined.members(), Dataset::all());
        assert_eq!(
            WardDataset::from(Dataset::SpeedCameras).members(),
            &[Dataset::SpeedCameras]
        );
        assert_eq!(
            "red_light_cameras".parse::<WardDataset>().unwrap(),
            WardDataset::RedLightCameras
        );
    }

    #[test]
    fn totals_accumulate_breakdown() {
        let mut totals = WardTotals::default();
        totals.add(Dataset::ParkingTickets, 10, Cents(5_000));
        totals.add(Dataset::SpeedCameras, 2, Cents(10_000));
        totals.add(Dataset::ParkingTickets, 1, Cents(300));

        assert_eq!(totals.ticket_count, 13);
        assert_eq!(totals.total_revenue, Cents(15_300));
        assert_eq!(
            totals.by_dataset[&Dataset::ParkingTickets],
            DatasetTotals {
                ticket_count: 11,
                total_revenue: Cents(5_300),
            }
        );
    }

    #[test]
    fn rollup_parses_camel_case() {
        let rollup: WardRollup = serde_json::from_str(
            r#"{
                "version": 7,
                "wards": {
                    "4": {
                        "ticketCount": 3,
                        "totalRevenue": 4500,
                        "byDataset": {
                            "parking_tickets": { "ticketCount": 3, "totalRevenue": 4500 }
                        }
                    }
                }
            }"#,
        )
        .unwrap();
        assert_eq!(rollup.version, DatasetVersion(7));
        assert_eq!(rollup.totals("4").ticket_count, 3);
        assert_eq!(rollup.totals("99"), WardTotals::default());
    }
}
