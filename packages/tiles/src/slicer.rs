//! Quad-tree slicing of raw points into tiles.
//!
//! The slicer starts from the world tile and splits every tile holding
//! more than `index_max_points` points into its four children, down to
//! `index_max_zoom`. Each tile keeps the points inside its bounds plus a
//! buffer so symbols straddling a tile edge render on both sides without
//! seams, including across the antimeridian. Empty children of a split
//! tile are stored too, so a lookup under them stops there instead of
//! rescanning an ancestor. Tiles deeper than the eagerly built pyramid are
//! cut on demand from their nearest stored ancestor; the index itself
//! never changes after construction.

use std::collections::HashMap;

use ticket_map_tiles_models::{TileCoord, mercator};

use crate::config::SlicerConfig;
use crate::point::{Aggregate, PointRecord, TileFeature, TileFeatureKind, to_tile_local};

pub struct TileSlicer {
    tiles: HashMap<TileCoord, Vec<u32>>,
    index_max_zoom: u8,
    index_max_points: usize,
    /// Buffer as a fraction of one tile's width.
    buffer: f64,
    extent: u32,
}

impl TileSlicer {
    /// Slices `records` into a tile pyramid.
    ///
    /// # Panics
    ///
    /// Panics if more than `u32::MAX` records are supplied.
    #[must_use]
    pub fn build(records: &[PointRecord], config: &SlicerConfig, extent: u32) -> Self {
        let mut slicer = Self {
            tiles: HashMap::new(),
            index_max_zoom: config.index_max_zoom.min(TileCoord::MAX_ZOOM),
            index_max_points: config.index_max_points,
            buffer: f64::from(config.buffer) / f64::from(extent.max(1)),
            extent,
        };

        let all: Vec<u32> = (0..records.len())
            .map(|i| u32::try_from(i).expect("too many point records"))
            .collect();
        let mut stack = vec![(TileCoord::new(0, 0, 0), all)];

        while let Some((coord, ids)) = stack.pop() {
            if coord.z < slicer.index_max_zoom && ids.len() > slicer.index_max_points {
                for (dx, dy) in [(0, 0), (1, 0), (0, 1), (1, 1)] {
                    let child = TileCoord::new(coord.z + 1, coord.x * 2 + dx, coord.y * 2 + dy);
                    let inside: Vec<u32> = ids
                        .iter()
                        .copied()
                        .filter(|&id| {
                            slicer
                                .placements(child, &records[id as usize])
                                .next()
                                .is_some()
                        })
                        .collect();
                    stack.push((child, inside));
                }
            }
            slicer.tiles.insert(coord, ids);
        }

        log::debug!(
            "Sliced {} points into {} tiles (max zoom {})",
            records.len(),
            slicer.tiles.len(),
            slicer.index_max_zoom
        );
        slicer
    }

    /// Number of tiles stored in the eagerly built pyramid.
    #[must_use]
    pub fn tile_count(&self) -> usize {
        self.tiles.len()
    }

    /// Whether `coord` was stored while building.
    #[must_use]
    pub fn contains(&self, coord: TileCoord) -> bool {
        self.tiles.contains_key(&coord)
    }

    /// World x positions at which `record` falls inside `coord` once the
    /// buffer is applied. Edge columns also see the copy of the point
    /// wrapped one world width across the antimeridian.
    fn placements(&self, coord: TileCoord, record: &PointRecord) -> impl Iterator<Item = f64> {
        let n = mercator::tiles_per_axis(coord.z);
        let (tx, ty) = (f64::from(coord.x), f64::from(coord.y));
        let buffer = self.buffer;
        let py = record.y * n;
        let in_row = py >= ty - buffer && py <= ty + 1.0 + buffer;

        let west = (coord.x == 0).then(|| record.x - 1.0);
        let east = (u64::from(coord.x) + 1 == 1u64 << coord.z).then(|| record.x + 1.0);
        std::iter::once(record.x)
            .chain(west)
            .chain(east)
            .filter(move |&x| in_row && x * n >= tx - buffer && x * n <= tx + 1.0 + buffer)
    }

    /// Raw points of `coord` in tile-local coordinates, or an empty list
    /// when the tile holds no points.
    #[must_use]
    pub fn get_tile(&self, coord: TileCoord, records: &[PointRecord]) -> Vec<TileFeature> {
        if !coord.is_valid() {
            return Vec::new();
        }
        let Some(ids) = (0..=coord.z)
            .rev()
            .find_map(|z| self.tiles.get(&coord.ancestor_at(z)))
        else {
            return Vec::new();
        };

        let (tx, ty) = (f64::from(coord.x), f64::from(coord.y));
        ids.iter()
            .filter_map(|&id| records.get(id as usize).map(|record| (id, record)))
            .flat_map(|(id, record)| {
                self.placements(coord, record).map(move |world_x| {
                    let (x, y) = to_tile_local(world_x, record.y, coord.z, tx, ty, self.extent);
                    TileFeature {
                        x,
                        y,
                        kind: TileFeatureKind::Point { record: id },
                        aggregate: Aggregate::of(record),
                    }
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ticket_map_tiles_models::{Cents, MonthMask, YearMask};

    fn record(lon: f64, lat: f64, tickets: u64) -> PointRecord {
        let (x, y) = PointRecord::project(lon, lat);
        PointRecord {
            id: tickets,
            x,
            y,
            ticket_count: tickets,
            total_revenue: Cents::ZERO,
            year_mask: YearMask::empty(),
            month_mask: MonthMask::empty(),
            location_id: 0,
            street_id: None,
            infraction_id: None,
        }
    }

    fn config(max_points: usize) -> SlicerConfig {
        SlicerConfig {
            index_max_zoom: 14,
            index_max_points: max_points,
            buffer: 64,
        }
    }

    fn tile_for(lon: f64, lat: f64, z: u8) -> TileCoord {
        TileCoord::new(z, mercator::lon_to_tile_x(lon, z), mercator::lat_to_tile_y(lat, z))
    }

    #[test]
    fn sparse_data_is_not_split() {
        let records = vec![record(-79.38, 43.65, 1), record(-73.56, 45.50, 2)];
        let slicer = TileSlicer::build(&records, &config(10), 4096);
        assert_eq!(slicer.tile_count(), 1);
        assert_eq!(slicer.get_tile(TileCoord::new(0, 0, 0), &records).len(), 2);
    }

    #[test]
    fn dense_data_splits_to_max_zoom() {
        let records: Vec<PointRecord> = (0..50_u32)
            .map(|i| record(-79.38 + f64::from(i) * 1e-6, 43.65, u64::from(i)))
            .collect();
        let slicer = TileSlicer::build(&records, &config(10), 4096);
        assert!(slicer.contains(tile_for(-79.38, 43.65, 14)));
        assert!(!slicer.contains(tile_for(-79.38, 43.65, 15)));
        assert_eq!(slicer.get_tile(tile_for(-79.38, 43.65, 14), &records).len(), 50);
    }

    #[test]
    fn deep_tiles_are_cut_from_ancestors() {
        let records = vec![record(-79.3832, 43.6532, 5), record(-79.30, 43.70, 3)];
        let slicer = TileSlicer::build(&records, &config(1), 4096);
        let deep = tile_for(-79.3832, 43.6532, 18);
        let features = slicer.get_tile(deep, &records);
        assert_eq!(features.len(), 1);
        assert_eq!(features[0].aggregate.ticket_count, 5);
        assert!((0..=4096).contains(&features[0].x));
        assert!((0..=4096).contains(&features[0].y));
    }

    #[test]
    fn buffered_points_appear_in_neighbouring_tiles() {
        // Just west of the boundary between two z=10 columns.
        let z = 10;
        let boundary_x = 286.0 / mercator::tiles_per_axis(z);
        let lon = mercator::x_to_lon(boundary_x - 1e-7);
        let records = vec![record(lon, 43.65, 1)];
        let slicer = TileSlicer::build(&records, &config(0), 4096);

        let y = mercator::lat_to_tile_y(43.65, z);
        let west = slicer.get_tile(TileCoord::new(z, 285, y), &records);
        let east = slicer.get_tile(TileCoord::new(z, 286, y), &records);
        assert_eq!(west.len(), 1);
        assert_eq!(east.len(), 1);
        assert!(east[0].x <= 0);
        assert!(west[0].x >= 4095);
    }

    #[test]
    fn empty_children_are_stored() {
        // Both points sit in the north-west quarter of the world.
        let records = vec![record(-79.38, 43.65, 1), record(-73.56, 45.50, 2)];
        let slicer = TileSlicer::build(&records, &config(1), 4096);
        for (x, y) in [(1, 0), (0, 1), (1, 1)] {
            assert!(slicer.contains(TileCoord::new(1, x, y)), "1/{x}/{y}");
        }
        assert!(!slicer.contains(TileCoord::new(2, 3, 3)));
        let deep = tile_for(151.21, -33.87, 18);
        assert!(slicer.get_tile(deep, &records).is_empty());
    }

    #[test]
    fn points_wrap_across_the_antimeridian() {
        let records = vec![record(179.99, 10.0, 7)];
        let slicer = TileSlicer::build(&records, &config(0), 4096);
        let z = 3;
        let y = mercator::lat_to_tile_y(10.0, z);

        let east = slicer.get_tile(TileCoord::new(z, 7, y), &records);
        assert_eq!(east.len(), 1);
        assert!(east[0].x >= 4095);

        let west = slicer.get_tile(TileCoord::new(z, 0, y), &records);
        assert_eq!(west.len(), 1);
        assert!(west[0].x <= 0);
        assert_eq!(west[0].aggregate.ticket_count, 7);

        assert!(slicer.get_tile(TileCoord::new(z, 1, y), &records).is_empty());
    }

    #[test]
    fn empty_regions_return_nothing() {
        let records = vec![record(-79.38, 43.65, 1)];
        let slicer = TileSlicer::build(&records, &config(0), 4096);
        assert!(slicer.get_tile(TileCoord::new(10, 0, 0), &records).is_empty());
        assert!(slicer.get_tile(TileCoord::new(2, 9, 9), &records).is_empty());
    }
}
