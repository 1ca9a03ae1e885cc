//! Polygon tile index for one ward dataset.
//!
//! Ward boundaries are projected to normalized mercator once, simplified
//! per zoom, and indexed by envelope in an R-tree. Tiles are cut on demand:
//! every ward whose envelope touches the buffered tile is clipped to it
//! (Sutherland-Hodgman), snapped to integer tile units and encoded with the
//! ward's rollup totals as properties.

use geo::{BoundingRect, MapCoords, MultiPolygon, Simplify};
use mvt::{GeomEncoder, GeomType, Tile};
use rstar::{AABB, RTree, RTreeObject};
use ticket_map_tiles_models::{DatasetVersion, TileCoord, mercator};
use ticket_map_wards_models::{WardDataset, WardPolygon, WardRollup, WardTotals};

use crate::config::WardTilesConfig;
use crate::error::WardError;

/// Properties carried by every tile feature of one ward.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WardProperties {
    pub code: String,
    pub name: String,
    pub totals: WardTotals,
}

struct WardEntry {
    index: usize,
    envelope: AABB<[f64; 2]>,
}

impl RTreeObject for WardEntry {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        self.envelope
    }
}

type Ring = Vec<(f64, f64)>;

/// One ward clipped to a tile, in tile units. Each polygon is an exterior
/// ring followed by its holes.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ClippedWard {
    pub index: usize,
    pub polygons: Vec<Vec<Ring>>,
}

pub struct WardTileIndex {
    dataset: WardDataset,
    version: DatasetVersion,
    config: WardTilesConfig,
    wards: Vec<WardProperties>,
    /// `levels[z]` holds the geometry used at zoom `z`; the last level is
    /// unsimplified and serves every deeper zoom.
    levels: Vec<Vec<MultiPolygon<f64>>>,
    tree: RTree<WardEntry>,
}

impl WardTileIndex {
    /// Builds the index for `dataset`, merging `rollup` totals into each
    /// ward's properties. Wards missing from the rollup get zero totals.
    #[must_use]
    pub fn build(
        dataset: WardDataset,
        wards: &[WardPolygon],
        rollup: &WardRollup,
        config: &WardTilesConfig,
    ) -> Self {
        let projected: Vec<MultiPolygon<f64>> = wards
            .iter()
            .map(|ward| {
                ward.geometry.map_coords(|c| geo::Coord {
                    x: mercator::lon_to_x(c.x),
                    y: mercator::lat_to_y(c.y),
                })
            })
            .collect();

        let entries = projected
            .iter()
            .enumerate()
            .filter_map(|(index, geometry)| {
                let rect = geometry.bounding_rect()?;
                Some(WardEntry {
                    index,
                    envelope: AABB::from_corners(
                        [rect.min().x, rect.min().y],
                        [rect.max().x, rect.max().y],
                    ),
                })
            })
            .collect();

        let extent = f64::from(config.extent.max(1));
        let mut levels: Vec<Vec<MultiPolygon<f64>>> = (0..=config.simplify_max_zoom)
            .map(|z| {
                let tolerance =
                    config.simplify_tolerance / (extent * mercator::tiles_per_axis(z));
                projected.iter().map(|mp| mp.simplify(tolerance)).collect()
            })
            .collect();
        levels.push(projected);

        let wards = wards
            .iter()
            .map(|ward| WardProperties {
                code: ward.code.clone(),
                name: ward.name.clone(),
                totals: rollup.totals(&ward.code),
            })
            .collect();

        Self {
            dataset,
            version: rollup.version,
            config: config.clone(),
            wards,
            levels,
            tree: RTree::bulk_load(entries),
        }
    }

    #[must_use]
    pub const fn dataset(&self) -> WardDataset {
        self.dataset
    }

    /// Rollup version merged into this index.
    #[must_use]
    pub const fn version(&self) -> DatasetVersion {
        self.version
    }

    #[must_use]
    pub fn ward(&self, code: &str) -> Option<&WardProperties> {
        self.wards.iter().find(|ward| ward.code == code)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.wards.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.wards.is_empty()
    }

    /// Whether `coord` is addressable by this index.
    #[must_use]
    pub fn serves(&self, coord: TileCoord) -> bool {
        coord.is_valid() && (self.config.min_zoom..=self.config.max_zoom).contains(&coord.z)
    }

    fn level(&self, z: u8) -> &[MultiPolygon<f64>] {
        let last = self.levels.len() - 1;
        &self.levels[usize::from(z).min(last)]
    }

    /// Encodes the tile at `coord`. Returns `None` when no ward reaches the
    /// tile or the zoom is outside the configured range.
    ///
    /// # Errors
    ///
    /// Returns [`WardError::Encode`] if the vector tile writer rejects a
    /// geometry.
    pub fn get_tile(&self, coord: TileCoord) -> Result<Option<Vec<u8>>, WardError> {
        let clipped = self.clip(coord);
        if clipped.is_empty() {
            return Ok(None);
        }

        let mut tile = Tile::new(self.config.extent);
        let mut layer = tile.create_layer(&self.config.layer_name);
        for ward in &clipped {
            let mut encoder = GeomEncoder::new(GeomType::Polygon);
            for ring in ward.polygons.iter().flatten() {
                for &(x, y) in ring {
                    encoder = encoder.point(x, y)?;
                }
                encoder = encoder.complete()?;
            }
            let mut feature = layer.into_feature(encoder.encode()?);

            let props = &self.wards[ward.index];
            feature.set_id(props.code.parse().unwrap_or(ward.index as u64));
            feature.add_tag_string("code", &props.code);
            feature.add_tag_string("name", &props.name);
            feature.add_tag_uint("ticket_count", props.totals.ticket_count);
            feature.add_tag_double("total_revenue", props.totals.total_revenue.as_dollars());
            for (dataset, totals) in &props.totals.by_dataset {
                let layer_name = dataset.layer_name();
                feature.add_tag_uint(&format!("{layer_name}_count"), totals.ticket_count);
                feature.add_tag_double(
                    &format!("{layer_name}_revenue"),
                    totals.total_revenue.as_dollars(),
                );
            }
            layer = feature.into_layer();
        }

        tile.add_layer(layer)?;
        Ok(Some(tile.to_bytes()?))
    }

    /// Clips every ward touching `coord` to the buffered tile, in tile
    /// units, ordered by ward.
    pub(crate) fn clip(&self, coord: TileCoord) -> Vec<ClippedWard> {
        if !self.serves(coord) {
            return Vec::new();
        }

        let n = mercator::tiles_per_axis(coord.z);
        let extent = f64::from(self.config.extent);
        let buffer = f64::from(self.config.buffer);
        let pad = buffer / extent / n;
        let min = [f64::from(coord.x) / n - pad, f64::from(coord.y) / n - pad];
        let max = [
            f64::from(coord.x + 1) / n + pad,
            f64::from(coord.y + 1) / n + pad,
        ];

        let mut hits: Vec<usize> = self
            .tree
            .locate_in_envelope_intersecting(&AABB::from_corners(min, max))
            .map(|entry| entry.index)
            .collect();
        hits.sort_unstable();

        let to_tile = |c: &geo::Coord<f64>| {
            (
                (c.x * n - f64::from(coord.x)) * extent,
                (c.y * n - f64::from(coord.y)) * extent,
            )
        };

        let geometries = self.level(coord.z);
        hits.into_iter()
            .filter_map(|index| {
                let polygons: Vec<Vec<Ring>> = geometries[index]
                    .0
                    .iter()
                    .filter_map(|polygon| {
                        let exterior = prepare_ring(
                            polygon.exterior().0.iter().map(to_tile).collect(),
                            extent,
                            buffer,
                            false,
                        )?;
                        let mut rings = vec![exterior];
                        rings.extend(polygon.interiors().iter().filter_map(|interior| {
                            prepare_ring(
                                interior.0.iter().map(to_tile).collect(),
                                extent,
                                buffer,
                                true,
                            )
                        }));
                        Some(rings)
                    })
                    .collect();
                (!polygons.is_empty()).then_some(ClippedWard { index, polygons })
            })
            .collect()
    }
}

/// Clips, snaps and orients one ring. Returns `None` when fewer than three
/// distinct vertices survive.
fn prepare_ring(ring: Ring, extent: f64, buffer: f64, is_hole: bool) -> Option<Ring> {
    let clipped = clip_ring(&ring, -buffer, extent + buffer);
    let snapped: Ring = clipped.into_iter().map(|(x, y)| (x.round(), y.round())).collect();
    let mut ring = clean_ring(snapped);
    if ring.len() < 3 {
        return None;
    }

    let area = signed_area(&ring);
    if area == 0.0 {
        return None;
    }
    // Tile units grow downward: exterior rings have positive area, holes
    // negative.
    if (area > 0.0) == is_hole {
        ring.reverse();
    }
    Some(ring)
}

/// Sutherland-Hodgman clip of `ring` against the square `[lo, hi]²`.
fn clip_ring(ring: &[(f64, f64)], lo: f64, hi: f64) -> Ring {
    let mut out = ring.to_vec();
    out = clip_edge(&out, |p| p.0 >= lo, |a, b| {
        let t = (lo - a.0) / (b.0 - a.0);
        (lo, a.1 + t * (b.1 - a.1))
    });
    out = clip_edge(&out, |p| p.0 <= hi, |a, b| {
        let t = (hi - a.0) / (b.0 - a.0);
        (hi, a.1 + t * (b.1 - a.1))
    });
    out = clip_edge(&out, |p| p.1 >= lo, |a, b| {
        let t = (lo - a.1) / (b.1 - a.1);
        (a.0 + t * (b.0 - a.0), lo)
    });
    clip_edge(&out, |p| p.1 <= hi, |a, b| {
        let t = (hi - a.1) / (b.1 - a.1);
        (a.0 + t * (b.0 - a.0), hi)
    })
}

fn clip_edge(
    ring: &[(f64, f64)],
    inside: impl Fn(&(f64, f64)) -> bool,
    intersect: impl Fn(&(f64, f64), &(f64, f64)) -> (f64, f64),
) -> Ring {
    let mut out = Vec::with_capacity(ring.len() + 4);
    for (i, current) in ring.iter().enumerate() {
        let next = &ring[(i + 1) % ring.len()];
        match (inside(current), inside(next)) {
            (true, true) => out.push(*next),
            (true, false) => out.push(intersect(current, next)),
            (false, true) => {
                out.push(intersect(current, next));
                out.push(*next);
            }
            (false, false) => {}
        }
    }
    out
}

/// Drops consecutive duplicates and the closing vertex.
fn clean_ring(ring: Ring) -> Ring {
    let mut out: Ring = Vec::with_capacity(ring.len());
    for point in ring {
        if out.last() != Some(&point) {
            out.push(point);
        }
    }
    while out.len() > 1 && out.first() == out.last() {
        out.pop();
    }
    out
}

/// Shoelace area; positive for clockwise rings in y-down tile units.
fn signed_area(ring: &[(f64, f64)]) -> f64 {
    let mut sum = 0.0;
    for (i, a) in ring.iter().enumerate() {
        let b = ring[(i + 1) % ring.len()];
        sum += a.0 * b.1 - b.0 * a.1;
    }
    sum / 2.0
}

#[cfg(test)]
mod tests {
    use std::f64::consts::TAU;

    use geo::{LineString, Polygon};
    use ticket_map_tiles_models::{Cents, Dataset};

    use super::*;
    use crate::source::parse_ward_collection;
    use crate::source::tests::{TWO_WARDS, rollup};

    fn config() -> WardTilesConfig {
        crate::WardServiceConfig::default().tiles
    }

    fn index() -> WardTileIndex {
        let wards = parse_ward_collection(TWO_WARDS).unwrap();
        WardTileIndex::build(WardDataset::ParkingTickets, &wards, &rollup(3, 40), &config())
    }

    fn tile_at(lon: f64, lat: f64, z: u8) -> TileCoord {
        TileCoord::new(z, mercator::lon_to_tile_x(lon, z), mercator::lat_to_tile_y(lat, z))
    }

    #[test]
    fn rollup_totals_are_merged() {
        let index = index();
        assert_eq!(index.version(), DatasetVersion(3));
        assert_eq!(index.len(), 2);

        let ward = index.ward("10").unwrap();
        assert_eq!(ward.totals.ticket_count, 40);
        assert_eq!(ward.totals.by_dataset[&Dataset::ParkingTickets].total_revenue, Cents(3_000));
        assert_eq!(index.ward("13").unwrap().totals, WardTotals::default());
    }

    #[test]
    fn tile_over_wards_encodes_both() {
        let index = index();
        let coord = tile_at(-79.38, 43.64, 11);
        let clipped = index.clip(coord);
        assert_eq!(
            clipped.iter().map(|w| w.index).collect::<Vec<_>>(),
            vec![0, 1]
        );
        // Ward 13 keeps its hole.
        assert_eq!(clipped[1].polygons[0].len(), 2);
        assert!(index.get_tile(coord).unwrap().is_some());
    }

    #[test]
    fn rings_are_clipped_and_oriented() {
        let index = index();
        let config = config();
        let lo = -f64::from(config.buffer);
        let hi = f64::from(config.extent + config.buffer);

        for z in [8, 12, 16] {
            for ward in index.clip(tile_at(-79.38, 43.64, z)) {
                for polygon in &ward.polygons {
                    assert!(signed_area(&polygon[0]) > 0.0, "exterior at z{z}");
                    for hole in &polygon[1..] {
                        assert!(signed_area(hole) < 0.0, "hole at z{z}");
                    }
                    for &(x, y) in polygon.iter().flatten() {
                        assert!((lo..=hi).contains(&x) && (lo..=hi).contains(&y));
                        assert_eq!(x, x.round());
                    }
                }
            }
        }
    }

    #[test]
    fn distant_and_out_of_range_tiles_are_empty() {
        let index = index();
        assert!(index.get_tile(tile_at(2.35, 48.85, 12)).unwrap().is_none());
        assert!(index.get_tile(tile_at(-79.38, 43.64, 19)).unwrap().is_none());
        assert!(index.get_tile(TileCoord::new(3, 9, 0)).unwrap().is_none());
    }

    #[test]
    fn tile_inside_a_ward_is_the_buffered_square() {
        let index = index();
        // Deep enough that the tile sits strictly inside ward 10.
        let clipped = index.clip(tile_at(-79.39, 43.64, 16));
        assert_eq!(clipped.len(), 1);
        let ring = &clipped[0].polygons[0][0];
        assert_eq!(ring.len(), 4);
        let config = config();
        let side = f64::from(config.extent + 2 * config.buffer);
        assert!((signed_area(ring) - side * side).abs() < 1e-6);
    }

    #[test]
    fn coarse_zooms_are_simplified() {
        let center = (-79.39, 43.70);
        let circle: LineString<f64> = (0..=720)
            .map(|i| {
                let angle = f64::from(i) / 720.0 * TAU;
                (center.0 + 0.05 * angle.cos(), center.1 + 0.05 * angle.sin())
            })
            .collect::<Vec<_>>()
            .into();
        let ward = WardPolygon {
            code: "1".to_string(),
            name: "Circle".to_string(),
            geometry: MultiPolygon(vec![Polygon::new(circle, vec![])]),
        };
        let index = WardTileIndex::build(
            WardDataset::Combined,
            &[ward],
            &WardRollup::default(),
            &config(),
        );

        let vertices = |z: u8| index.level(z)[0].0[0].exterior().0.len();
        assert!(vertices(4) < vertices(12));
        assert!(vertices(12) <= vertices(18));
        assert_eq!(vertices(18), 721);
    }

    #[test]
    fn clip_edge_cases() {
        assert_eq!(
            clean_ring(vec![(1.0, 1.0), (1.0, 1.0), (2.0, 2.0), (1.0, 1.0)]).len(),
            2
        );
        let square = vec![(-10.0, -10.0), (10.0, -10.0), (10.0, 10.0), (-10.0, 10.0)];
        let clipped = clip_ring(&square, 0.0, 20.0);
        assert!((signed_area(&clipped).abs() - 100.0).abs() < 1e-9);
        assert!(clip_ring(&square, 50.0, 60.0).is_empty());
    }
}
