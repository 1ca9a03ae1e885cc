#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! In-memory spatial index for viewport summaries.
//!
//! Bulk-loads every [`SummaryPoint`] of one dataset version into a packed
//! R-tree and answers "what is visible right now" queries (total tickets,
//! revenue, top streets) without walking the tile pyramid. The index is
//! read-only after construction and shared across requests.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use rstar::primitives::GeomWithData;
use rstar::{AABB, RTree};
use ticket_map_tiles_models::{
    BoundingBox, Cents, Dataset, DatasetSummary, DatasetVersion, StreetTotal, StringTable,
    SummaryFilters, SummaryPoint, ViewportSummary, YearTotals, YearWindow, mask,
};

/// A summary point position stored in the R-tree with its index into
/// [`SpatialQueryIndex::points`].
type PointEntry = GeomWithData<[f64; 2], u32>;

/// Per-location yearly totals, keyed by location id.
pub type LocationYearTotals = HashMap<u32, BTreeMap<i32, YearTotals>>;

/// Result of querying an index that may not have been built yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchOutcome {
    /// The dataset has not finished loading.
    NotReady,
    /// Indices of matching points.
    Ready(Vec<u32>),
}

/// Pre-built spatial index over one dataset version.
pub struct SpatialQueryIndex {
    tree: RTree<PointEntry>,
    points: Vec<SummaryPoint>,
    locations: Arc<StringTable>,
    streets: Arc<StringTable>,
    year_totals: LocationYearTotals,
    year_window: YearWindow,
    version: DatasetVersion,
}

impl SpatialQueryIndex {
    /// Bulk-loads `points` into a packed R-tree.
    ///
    /// # Panics
    ///
    /// Panics if more than `u32::MAX` points are supplied.
    #[must_use]
    pub fn build(
        points: Vec<SummaryPoint>,
        locations: Arc<StringTable>,
        streets: Arc<StringTable>,
        year_totals: LocationYearTotals,
        year_window: YearWindow,
        version: DatasetVersion,
    ) -> Self {
        let entries: Vec<PointEntry> = points
            .iter()
            .enumerate()
            .map(|(i, p)| {
                let index = u32::try_from(i).expect("too many summary points");
                GeomWithData::new([p.longitude, p.latitude], index)
            })
            .collect();
        let tree = RTree::bulk_load(entries);
        log::info!(
            "Loaded {} summary points into spatial index ({version})",
            tree.size()
        );

        Self {
            tree,
            points,
            locations,
            streets,
            year_totals,
            year_window,
            version,
        }
    }

    #[must_use]
    pub const fn version(&self) -> DatasetVersion {
        self.version
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.points.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    #[must_use]
    pub fn point(&self, index: u32) -> Option<&SummaryPoint> {
        self.points.get(index as usize)
    }

    #[must_use]
    pub fn location_name(&self, point: &SummaryPoint) -> Option<&str> {
        self.locations.get(point.location_id)
    }

    /// Indices of all points inside `bbox` (edges inclusive), ascending.
    ///
    /// A box with `west > east` wraps across the antimeridian and is
    /// searched as its two halves.
    #[must_use]
    pub fn search(&self, bbox: &BoundingBox) -> Vec<u32> {
        let (first, second) = if bbox.crosses_antimeridian() {
            ((bbox.west, 180.0), Some((-180.0, bbox.east)))
        } else {
            ((bbox.west, bbox.east), None)
        };

        let mut hits = Vec::new();
        for (west, east) in std::iter::once(first).chain(second) {
            let envelope = AABB::from_corners([west, bbox.south], [east, bbox.north]);
            hits.extend(self.tree.locate_in_envelope(&envelope).map(|entry| entry.data));
        }
        hits.sort_unstable();
        hits.dedup();
        hits
    }

    /// Totals attributable to `point` under `filters`, or `None` when the
    /// point is filtered out.
    fn filtered_totals(&self, point: &SummaryPoint, filters: SummaryFilters) -> Option<YearTotals> {
        if filters
            .month
            .is_some_and(|month| !mask::month_mask_includes(point.month_mask, month))
        {
            return None;
        }

        let all_time = YearTotals {
            ticket_count: point.ticket_count,
            total_revenue: point.total_revenue,
        };

        let Some(year) = filters.year else {
            return Some(all_time);
        };
        if !self.year_window.includes(point.year_mask, year) {
            return None;
        }
        Some(
            self.year_totals
                .get(&point.location_id)
                .and_then(|years| years.get(&year))
                .copied()
                .unwrap_or(all_time),
        )
    }

    /// Summarizes every point inside `bbox` that passes `filters`.
    #[must_use]
    pub fn summarize(
        &self,
        bbox: &BoundingBox,
        filters: SummaryFilters,
        top_n: usize,
    ) -> ViewportSummary {
        let mut visible_count = 0u64;
        let mut visible_revenue = Cents::ZERO;
        let mut by_street: HashMap<u32, YearTotals> = HashMap::new();

        for index in self.search(bbox) {
            let point = &self.points[index as usize];
            let Some(totals) = self.filtered_totals(point, filters) else {
                continue;
            };
            visible_count += totals.ticket_count;
            visible_revenue += totals.total_revenue;
            if let Some(street_id) = point.street_id {
                let entry = by_street.entry(street_id).or_default();
                entry.ticket_count += totals.ticket_count;
                entry.total_revenue += totals.total_revenue;
            }
        }

        ViewportSummary {
            zoom_restricted: false,
            ready: true,
            visible_count,
            visible_revenue,
            top_streets: self.rank_streets(by_street, top_n),
        }
    }

    /// Dataset-wide totals for persistence as a summary snapshot.
    #[must_use]
    pub fn dataset_summary(&self, dataset: Dataset, top_n: usize) -> DatasetSummary {
        let mut by_street: HashMap<u32, YearTotals> = HashMap::new();
        let mut ticket_count = 0u64;
        let mut total_revenue = Cents::ZERO;
        for point in &self.points {
            ticket_count += point.ticket_count;
            total_revenue += point.total_revenue;
            if let Some(street_id) = point.street_id {
                let entry = by_street.entry(street_id).or_default();
                entry.ticket_count += point.ticket_count;
                entry.total_revenue += point.total_revenue;
            }
        }

        DatasetSummary {
            dataset,
            version: self.version,
            feature_count: self.points.len() as u64,
            ticket_count,
            total_revenue,
            top_streets: self.rank_streets(by_street, top_n),
        }
    }

    /// Orders streets by ticket count (descending), breaking ties by name.
    fn rank_streets(&self, by_street: HashMap<u32, YearTotals>, top_n: usize) -> Vec<StreetTotal> {
        let mut streets: Vec<StreetTotal> = by_street
            .into_iter()
            .filter_map(|(id, totals)| {
                self.streets.get(id).map(|name| StreetTotal {
                    street: name.to_string(),
                    ticket_count: totals.ticket_count,
                    total_revenue: totals.total_revenue,
                })
            })
            .collect();
        streets.sort_by(|a, b| {
            b.ticket_count
                .cmp(&a.ticket_count)
                .then_with(|| a.street.cmp(&b.street))
        });
        streets.truncate(top_n);
        streets
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ticket_map_tiles_models::{MonthMask, YearMask, mask::encode_month_mask};

    fn point(
        lon: f64,
        lat: f64,
        tickets: u64,
        location_id: u32,
        street_id: Option<u32>,
        years: YearMask,
        months: MonthMask,
    ) -> SummaryPoint {
        SummaryPoint {
            longitude: lon,
            latitude: lat,
            ticket_count: tickets,
            total_revenue: Cents(i64::try_from(tickets).unwrap() * 3000),
            location_id,
            street_id,
            year_mask: years,
            month_mask: months,
        }
    }

    fn fixture() -> SpatialQueryIndex {
        let window = YearWindow::default();
        let mut locations = StringTable::new();
        let mut streets = StringTable::new();
        let queen = streets.intern("QUEEN ST W");
        let king = streets.intern("KING ST W");
        let a = locations.intern("100 QUEEN ST W");
        let b = locations.intern("200 QUEEN ST W");
        let c = locations.intern("50 KING ST W");
        let d = locations.intern("1 FAR AWAY RD");

        let all_months = encode_month_mask(1..=12);
        let june = encode_month_mask([6]);
        let points = vec![
            point(-79.384, 43.652, 10, a, Some(queen), window.encode([2019, 2020]), all_months),
            point(-79.386, 43.651, 4, b, Some(queen), window.encode([2020]), june),
            point(-79.381, 43.648, 7, c, Some(king), window.encode([2019]), all_months),
            point(-80.5, 44.5, 100, d, None, window.encode([2019]), all_months),
        ];

        let mut year_totals = LocationYearTotals::new();
        year_totals.insert(
            a,
            BTreeMap::from([
                (2019, YearTotals { ticket_count: 6, total_revenue: Cents(18_000) }),
                (2020, YearTotals { ticket_count: 4, total_revenue: Cents(12_000) }),
            ]),
        );

        SpatialQueryIndex::build(
            points,
            Arc::new(locations),
            Arc::new(streets),
            year_totals,
            window,
            DatasetVersion(5),
        )
    }

    fn downtown() -> BoundingBox {
        BoundingBox::new(-79.39, 43.64, -79.37, 43.66)
    }

    #[test]
    fn search_returns_points_in_bbox() {
        let index = fixture();
        assert_eq!(index.search(&downtown()), vec![0, 1, 2]);
        assert!(index.search(&BoundingBox::new(0.0, 0.0, 1.0, 1.0)).is_empty());
    }

    #[test]
    fn bbox_across_antimeridian_searches_both_halves() {
        let window = YearWindow::default();
        let years = window.encode([2019]);
        let months = encode_month_mask(1..=12);
        let points = vec![
            point(179.5, -17.0, 1, 0, None, years, months),
            point(-179.5, -17.0, 2, 1, None, years, months),
            point(0.0, -17.0, 3, 2, None, years, months),
        ];
        let index = SpatialQueryIndex::build(
            points,
            Arc::new(StringTable::new()),
            Arc::new(StringTable::new()),
            LocationYearTotals::new(),
            window,
            DatasetVersion(1),
        );

        let wrapping = BoundingBox::new(179.0, -18.0, -179.0, -16.0);
        assert_eq!(index.search(&wrapping), vec![0, 1]);
        assert_eq!(index.search(&BoundingBox::new(-179.0, -18.0, 179.0, -16.0)), vec![2]);

        let summary = index.summarize(&wrapping, SummaryFilters::default(), 10);
        assert_eq!(summary.visible_count, 3);
    }

    #[test]
    fn summarize_without_filters() {
        let index = fixture();
        let summary = index.summarize(&downtown(), SummaryFilters::default(), 10);
        assert!(summary.ready);
        assert!(!summary.zoom_restricted);
        assert_eq!(summary.visible_count, 21);
        assert_eq!(summary.visible_revenue, Cents(63_000));
        assert_eq!(summary.top_streets.len(), 2);
        assert_eq!(summary.top_streets[0].street, "QUEEN ST W");
        assert_eq!(summary.top_streets[0].ticket_count, 14);
    }

    #[test]
    fn year_filter_uses_per_year_totals() {
        let index = fixture();
        let filters = SummaryFilters {
            year: Some(2019),
            month: None,
        };
        let summary = index.summarize(&downtown(), filters, 10);
        // location a contributes its 2019 share (6), b is excluded, c has
        // no per-year totals so contributes all-time (7).
        assert_eq!(summary.visible_count, 13);
        assert_eq!(summary.top_streets[0].street, "KING ST W");
    }

    #[test]
    fn month_filter_excludes_points() {
        let index = fixture();
        let filters = SummaryFilters {
            year: None,
            month: Some(3),
        };
        let summary = index.summarize(&downtown(), filters, 1);
        assert_eq!(summary.visible_count, 17);
        assert_eq!(summary.top_streets.len(), 1);
    }

    #[test]
    fn dataset_summary_covers_everything() {
        let index = fixture();
        let summary = index.dataset_summary(Dataset::ParkingTickets, 5);
        assert_eq!(summary.feature_count, 4);
        assert_eq!(summary.ticket_count, 121);
        assert_eq!(summary.version, DatasetVersion(5));
    }
}
