//! Point records shared by the clustering engine and tile slicer, and the
//! tile-local features both of them produce.

use std::sync::Arc;

use ticket_map_tiles_models::{Cents, MonthMask, StringTable, YearMask, mercator};

/// One enforcement location projected into normalized web mercator space
/// (`x` and `y` in `0.0..=1.0`, `y` growing southward).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointRecord {
    /// Feature id assigned by ingestion.
    pub id: u64,
    pub x: f64,
    pub y: f64,
    pub ticket_count: u64,
    pub total_revenue: Cents,
    pub year_mask: YearMask,
    pub month_mask: MonthMask,
    pub location_id: u32,
    pub street_id: Option<u32>,
    pub infraction_id: Option<u32>,
}

impl PointRecord {
    #[must_use]
    pub fn project(lon: f64, lat: f64) -> (f64, f64) {
        (mercator::lon_to_x(lon), mercator::lat_to_y(lat))
    }
}

/// Interned names referenced by [`PointRecord`]s.
#[derive(Debug, Clone, Default)]
pub struct Labels {
    pub locations: Arc<StringTable>,
    pub streets: Arc<StringTable>,
    pub infractions: Arc<StringTable>,
}

/// Aggregate attributes carried by both points and clusters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Aggregate {
    pub ticket_count: u64,
    pub total_revenue: Cents,
    pub year_mask: YearMask,
    pub month_mask: MonthMask,
}

impl Aggregate {
    #[must_use]
    pub const fn of(record: &PointRecord) -> Self {
        Self {
            ticket_count: record.ticket_count,
            total_revenue: record.total_revenue,
            year_mask: record.year_mask,
            month_mask: record.month_mask,
        }
    }

    pub fn absorb(&mut self, other: &Self) {
        self.ticket_count += other.ticket_count;
        self.total_revenue += other.total_revenue;
        self.year_mask |= other.year_mask;
        self.month_mask |= other.month_mask;
    }
}

/// What a [`TileFeature`] represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TileFeatureKind {
    /// A single location; `record` indexes the dataset's point records.
    Point { record: u32 },
    /// A synthetic cluster of several locations.
    Cluster {
        cluster_id: u32,
        point_count: u64,
        expansion_zoom: u8,
    },
}

/// A feature positioned in tile-local coordinates (`0..extent`, plus
/// buffer on either side).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileFeature {
    pub x: i32,
    pub y: i32,
    pub kind: TileFeatureKind,
    pub aggregate: Aggregate,
}

/// Converts a normalized mercator position into tile-local coordinates of
/// tile `(z, x, y)`.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn to_tile_local(px: f64, py: f64, z: u8, tx: f64, ty: f64, extent: u32) -> (i32, i32) {
    let n = mercator::tiles_per_axis(z);
    let extent = f64::from(extent);
    (
        (extent * px.mul_add(n, -tx)).round() as i32,
        (extent * py.mul_add(n, -ty)).round() as i32,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tile_local_corners() {
        assert_eq!(to_tile_local(0.0, 0.0, 0, 0.0, 0.0, 4096), (0, 0));
        assert_eq!(to_tile_local(0.5, 0.5, 0, 0.0, 0.0, 4096), (2048, 2048));
        assert_eq!(to_tile_local(0.5, 0.5, 1, 1.0, 1.0, 4096), (0, 0));
        assert_eq!(to_tile_local(0.25, 0.75, 1, 0.0, 1.0, 4096), (2048, 2048));
    }

    #[test]
    fn aggregate_absorbs_counts_and_masks() {
        let mut a = Aggregate {
            ticket_count: 2,
            total_revenue: Cents(500),
            year_mask: YearMask::from_bits(0b01),
            month_mask: MonthMask::from_bits(0b100),
        };
        a.absorb(&Aggregate {
            ticket_count: 3,
            total_revenue: Cents(700),
            year_mask: YearMask::from_bits(0b10),
            month_mask: MonthMask::from_bits(0b001),
        });
        assert_eq!(a.ticket_count, 5);
        assert_eq!(a.total_revenue, Cents(1200));
        assert_eq!(a.year_mask.bits(), 0b11);
        assert_eq!(a.month_mask.bits(), 0b101);
    }
}
