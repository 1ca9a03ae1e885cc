//! Hierarchical greedy point clustering.
//!
//! Points are clustered independently per zoom, from the finest zoom to
//! the coarsest. At each zoom the nodes of the level below are swept in
//! order; a node absorbs every still-unclaimed neighbour within the zoom's
//! radius and becomes a new cluster whose centroid is the point-count
//! weighted average of its members. Nodes that absorb nothing are carried
//! up unchanged, so a cluster keeps its identity at every coarser zoom
//! until it is merged into a larger one.
//!
//! Every node lives in one arena. Leaves (`0..records.len()`) are the
//! dataset's points; cluster ids are arena indices above that range and
//! are only meaningful for the dataset version they were built from.

use rstar::RTree;
use rstar::primitives::GeomWithData;
use ticket_map_tiles_models::{TileCoord, mercator};

use crate::config::ClusterConfig;
use crate::point::{Aggregate, PointRecord, TileFeature, TileFeatureKind, to_tile_local};

type NodeEntry = GeomWithData<[f64; 2], u32>;

/// A point or cluster in the clustering hierarchy.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterNode {
    pub x: f64,
    pub y: f64,
    /// Number of dataset points below this node (1 for a leaf).
    pub point_count: u64,
    pub aggregate: Aggregate,
    /// Nodes merged into this cluster, empty for leaves.
    pub children: Vec<u32>,
    pub parent: Option<u32>,
    /// Index of the dataset point, for leaves.
    pub record: Option<u32>,
    /// Zoom at which this cluster first splits into its children.
    pub expansion_zoom: Option<u8>,
}

impl ClusterNode {
    #[must_use]
    pub const fn is_cluster(&self) -> bool {
        self.record.is_none()
    }
}

/// Per-zoom cluster trees over one dataset version.
pub struct ClusterIndex {
    nodes: Vec<ClusterNode>,
    /// `levels[z - min_zoom]` for `z` in `min_zoom..=max_zoom + 1`; the
    /// last level holds the unclustered leaves.
    levels: Vec<RTree<NodeEntry>>,
    leaf_count: usize,
    min_zoom: u8,
    max_zoom: u8,
    radius: f64,
    extent: u32,
}

impl ClusterIndex {
    /// Builds the hierarchy over `records`.
    ///
    /// # Panics
    ///
    /// Panics if the hierarchy holds more than `u32::MAX` nodes.
    #[must_use]
    pub fn build(records: &[PointRecord], config: &ClusterConfig) -> Self {
        let max_zoom = config.max_zoom.min(TileCoord::MAX_ZOOM - 1);
        let min_zoom = config.min_zoom.min(max_zoom);
        let min_points = config.min_points.max(2) as u64;

        let mut nodes: Vec<ClusterNode> = records
            .iter()
            .enumerate()
            .map(|(i, record)| ClusterNode {
                x: record.x,
                y: record.y,
                point_count: 1,
                aggregate: Aggregate::of(record),
                children: Vec::new(),
                parent: None,
                record: Some(node_id(i)),
                expansion_zoom: None,
            })
            .collect();

        let mut current: Vec<u32> = (0..nodes.len()).map(node_id).collect();
        let mut levels = Vec::with_capacity(usize::from(max_zoom - min_zoom) + 2);
        levels.push(level_tree(&nodes, &current));

        for zoom in (min_zoom..=max_zoom).rev() {
            let radius =
                config.radius / (f64::from(config.extent) * mercator::tiles_per_axis(zoom));
            current = cluster_level(
                &mut nodes,
                &current,
                levels.last(),
                zoom,
                radius,
                min_points,
            );
            levels.push(level_tree(&nodes, &current));
            log::trace!("Zoom {zoom}: {} cluster nodes", current.len());
        }
        levels.reverse();

        log::debug!(
            "Clustered {} points into {} nodes across zooms {min_zoom}-{max_zoom}",
            records.len(),
            nodes.len()
        );

        Self {
            nodes,
            levels,
            leaf_count: records.len(),
            min_zoom,
            max_zoom,
            radius: config.radius,
            extent: config.extent,
        }
    }

    #[must_use]
    pub fn node(&self, id: u32) -> Option<&ClusterNode> {
        self.nodes.get(id as usize)
    }

    #[must_use]
    pub const fn leaf_count(&self) -> usize {
        self.leaf_count
    }

    #[must_use]
    pub const fn max_zoom(&self) -> u8 {
        self.max_zoom
    }

    /// Zoom at which `cluster_id` first splits into its children, or
    /// `None` for unknown ids and plain points.
    #[must_use]
    pub fn expansion_zoom(&self, cluster_id: u32) -> Option<u8> {
        self.node(cluster_id).and_then(|node| node.expansion_zoom)
    }

    /// Clusters and points visible in `coord`, positioned in tile-local
    /// coordinates of a tile `extent` units wide.
    ///
    /// Zooms beyond the clustered range return the unclustered points.
    #[must_use]
    pub fn get_tile(&self, coord: TileCoord, extent: u32) -> Vec<TileFeature> {
        let level_zoom = coord.z.clamp(self.min_zoom, self.max_zoom + 1);
        let tree = &self.levels[usize::from(level_zoom - self.min_zoom)];

        let n = mercator::tiles_per_axis(coord.z);
        let padding = self.radius / f64::from(self.extent);
        let x = f64::from(coord.x);
        let y = f64::from(coord.y);
        let top = (y - padding) / n;
        let bottom = (y + 1.0 + padding) / n;

        let mut features = Vec::new();
        self.collect(
            tree,
            [(x - padding) / n, top],
            [(x + 1.0 + padding) / n, bottom],
            (coord, x),
            extent,
            &mut features,
        );
        if coord.x == 0 {
            self.collect(
                tree,
                [1.0 - padding / n, top],
                [1.0, bottom],
                (coord, x + n),
                extent,
                &mut features,
            );
        }
        if u64::from(coord.x) + 1 == 1u64 << coord.z {
            self.collect(
                tree,
                [0.0, top],
                [padding / n, bottom],
                (coord, x - n),
                extent,
                &mut features,
            );
        }
        features
    }

    fn collect(
        &self,
        tree: &RTree<NodeEntry>,
        min: [f64; 2],
        max: [f64; 2],
        (coord, tile_x): (TileCoord, f64),
        extent: u32,
        out: &mut Vec<TileFeature>,
    ) {
        let envelope = rstar::AABB::from_corners(min, max);
        for entry in tree.locate_in_envelope(&envelope) {
            let node = &self.nodes[entry.data as usize];
            let (x, y) =
                to_tile_local(node.x, node.y, coord.z, tile_x, f64::from(coord.y), extent);
            let kind = match (node.record, node.expansion_zoom) {
                (Some(record), _) => TileFeatureKind::Point { record },
                (None, expansion_zoom) => TileFeatureKind::Cluster {
                    cluster_id: entry.data,
                    point_count: node.point_count,
                    expansion_zoom: expansion_zoom.unwrap_or(self.max_zoom + 1),
                },
            };
            out.push(TileFeature {
                x,
                y,
                kind,
                aggregate: node.aggregate,
            });
        }
    }
}

/// Clusters the nodes of one level into the level above it.
fn cluster_level(
    nodes: &mut Vec<ClusterNode>,
    current: &[u32],
    tree: Option<&RTree<NodeEntry>>,
    zoom: u8,
    radius: f64,
    min_points: u64,
) -> Vec<u32> {
    let Some(tree) = tree else {
        return current.to_vec();
    };
    let mut claimed = vec![false; nodes.len()];
    let mut next = Vec::with_capacity(current.len());

    for &id in current {
        let idx = id as usize;
        if claimed[idx] {
            continue;
        }
        claimed[idx] = true;

        let origin = &nodes[idx];
        let neighbours: Vec<u32> = tree
            .locate_within_distance([origin.x, origin.y], radius * radius)
            .map(|entry| entry.data)
            .filter(|&other| !claimed[other as usize])
            .collect();
        let total: u64 = origin.point_count
            + neighbours
                .iter()
                .map(|&other| nodes[other as usize].point_count)
                .sum::<u64>();

        if neighbours.is_empty() {
            next.push(id);
            continue;
        }
        if total < min_points {
            // Too few to cluster; carry the neighbours up unchanged.
            next.push(id);
            for &other in &neighbours {
                claimed[other as usize] = true;
                next.push(other);
            }
            continue;
        }

        let cluster_id = node_id(nodes.len());
        let mut aggregate = origin.aggregate;
        #[allow(clippy::cast_precision_loss)]
        let (mut wx, mut wy) = (
            origin.x * origin.point_count as f64,
            origin.y * origin.point_count as f64,
        );
        let mut children = Vec::with_capacity(neighbours.len() + 1);
        children.push(id);
        children.extend_from_slice(&neighbours);

        for &other in &neighbours {
            claimed[other as usize] = true;
            let child = &nodes[other as usize];
            aggregate.absorb(&child.aggregate);
            #[allow(clippy::cast_precision_loss)]
            let weight = child.point_count as f64;
            wx += child.x * weight;
            wy += child.y * weight;
        }
        for &child in &children {
            nodes[child as usize].parent = Some(cluster_id);
        }

        #[allow(clippy::cast_precision_loss)]
        let weight = total as f64;
        nodes.push(ClusterNode {
            x: wx / weight,
            y: wy / weight,
            point_count: total,
            aggregate,
            children,
            parent: None,
            record: None,
            expansion_zoom: Some(zoom + 1),
        });
        next.push(cluster_id);
    }

    next
}

fn level_tree(nodes: &[ClusterNode], ids: &[u32]) -> RTree<NodeEntry> {
    RTree::bulk_load(
        ids.iter()
            .map(|&id| {
                let node = &nodes[id as usize];
                GeomWithData::new([node.x, node.y], id)
            })
            .collect(),
    )
}

fn node_id(index: usize) -> u32 {
    u32::try_from(index).expect("cluster hierarchy exceeds u32::MAX nodes")
}

#[cfg(test)]
mod tests {
    use super::*;
    use ticket_map_tiles_models::{Cents, MonthMask, YearMask, mercator};

    fn record(lon: f64, lat: f64, tickets: u64, year_bit: u32) -> PointRecord {
        let (x, y) = PointRecord::project(lon, lat);
        PointRecord {
            id: tickets,
            x,
            y,
            ticket_count: tickets,
            total_revenue: Cents(i64::try_from(tickets).unwrap() * 100),
            year_mask: YearMask::from_bits(1 << year_bit),
            month_mask: MonthMask::from_bits(1),
            location_id: 0,
            street_id: None,
            infraction_id: None,
        }
    }

    fn config() -> ClusterConfig {
        ClusterConfig {
            radius: 60.0,
            extent: 512,
            min_zoom: 0,
            max_zoom: 14,
            min_points: 2,
        }
    }

    fn tile_for(lon: f64, lat: f64, z: u8) -> TileCoord {
        TileCoord::new(z, mercator::lon_to_tile_x(lon, z), mercator::lat_to_tile_y(lat, z))
    }

    #[test]
    fn single_point_is_never_a_cluster() {
        let records = [record(-79.3832, 43.6532, 5, 0)];
        let index = ClusterIndex::build(&records, &config());
        for z in [0, 8, 14, 15, 18] {
            let features = index.get_tile(tile_for(-79.3832, 43.6532, z), 4096);
            assert_eq!(features.len(), 1, "zoom {z}");
            assert_eq!(features[0].kind, TileFeatureKind::Point { record: 0 });
            assert_eq!(features[0].aggregate.ticket_count, 5);
        }
    }

    #[test]
    fn nearby_points_merge_at_coarse_zoom_and_split_later() {
        let records = [
            record(-79.3832, 43.6532, 5, 0),
            record(-79.3830, 43.6530, 7, 3),
        ];
        let index = ClusterIndex::build(&records, &config());

        let coarse = index.get_tile(tile_for(-79.3832, 43.6532, 8), 4096);
        assert_eq!(coarse.len(), 1);
        let TileFeatureKind::Cluster {
            cluster_id,
            point_count,
            expansion_zoom,
        } = coarse[0].kind
        else {
            panic!("expected a cluster, got {:?}", coarse[0].kind);
        };
        assert_eq!(point_count, 2);
        assert_eq!(coarse[0].aggregate.ticket_count, 12);
        assert_eq!(coarse[0].aggregate.year_mask.bits(), 0b1001);
        assert_eq!(index.expansion_zoom(cluster_id), Some(expansion_zoom));
        assert!(expansion_zoom > 8 && expansion_zoom <= 15);

        let fine = index.get_tile(tile_for(-79.3832, 43.6532, expansion_zoom), 4096);
        assert_eq!(fine.len(), 2);
        assert!(fine.iter().all(|f| matches!(f.kind, TileFeatureKind::Point { .. })));
    }

    #[test]
    fn cluster_aggregates_equal_sum_of_children() {
        let mut records = Vec::new();
        for i in 0..40u32 {
            let offset = f64::from(i) * 0.0007;
            records.push(record(-79.40 + offset, 43.65 + offset / 2.0, u64::from(i) + 1, i % 8));
        }
        let index = ClusterIndex::build(&records, &config());

        let mut clusters = 0;
        for id in 0..u32::try_from(index.nodes.len()).unwrap() {
            let node = index.node(id).unwrap();
            if !node.is_cluster() {
                continue;
            }
            clusters += 1;
            let mut tickets = 0;
            let mut points = 0;
            let mut years = YearMask::empty();
            for &child in &node.children {
                let child = index.node(child).unwrap();
                tickets += child.aggregate.ticket_count;
                points += child.point_count;
                years |= child.aggregate.year_mask;
                assert_eq!(child.parent, Some(id));
            }
            assert!(node.children.len() >= 2);
            assert_eq!(node.aggregate.ticket_count, tickets);
            assert_eq!(node.point_count, points);
            assert_eq!(node.aggregate.year_mask, years);
        }
        assert!(clusters > 0);

        let world = index.get_tile(TileCoord::new(0, 0, 0), 4096);
        let total: u64 = world.iter().map(|f| f.aggregate.ticket_count).sum();
        assert_eq!(total, (1..=40).sum::<u64>());
    }

    #[test]
    fn expansion_zoom_of_points_and_unknown_ids() {
        let records = [record(-79.38, 43.65, 1, 0), record(-79.3801, 43.6501, 1, 0)];
        let index = ClusterIndex::build(&records, &config());
        assert_eq!(index.expansion_zoom(0), None);
        assert_eq!(index.expansion_zoom(999), None);
    }

    #[test]
    fn empty_tile_has_no_features() {
        let records = [record(-79.38, 43.65, 1, 0)];
        let index = ClusterIndex::build(&records, &config());
        assert!(index.get_tile(TileCoord::new(10, 0, 0), 4096).is_empty());
    }
}
