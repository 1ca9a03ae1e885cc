//! Dataset loading and index construction.
//!
//! A [`DatasetLoader`] owns the current [`DatasetIndices`] of one dataset.
//! Indices are built together from one pass over the feature stream,
//! never mutated, and swapped atomically when the feature store publishes
//! a new version. Concurrent callers of [`DatasetLoader::ensure_loaded`]
//! share a single in-flight rebuild.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};

use futures::FutureExt as _;
use futures::future::{BoxFuture, Shared};
use ticket_map_spatial::{LocationYearTotals, SearchOutcome, SpatialQueryIndex};
use ticket_map_tiles_models::{
    BoundingBox, Dataset, DatasetSummary, DatasetVersion, Feature, StringTable, SummaryPoint,
    TileCoord, YearWindow,
};
use tokio::time::Instant;

use crate::cluster::ClusterIndex;
use crate::config::TileServiceConfig;
use crate::error::LoadError;
use crate::point::{Labels, PointRecord, TileFeature};
use crate::slicer::TileSlicer;
use crate::store::{AnalyticalSource, FeatureStore, LocationYearStats};

/// Every derived structure for one dataset version.
pub struct DatasetIndices {
    pub dataset: Dataset,
    pub version: DatasetVersion,
    pub records: Vec<PointRecord>,
    pub labels: Labels,
    pub clusters: ClusterIndex,
    pub slicer: TileSlicer,
    pub spatial: SpatialQueryIndex,
    raw_point_zoom: u8,
    extent: u32,
}

impl DatasetIndices {
    /// Builds all indices from `features` in one pass.
    ///
    /// Features with non-finite or out-of-range coordinates are skipped.
    ///
    /// # Panics
    ///
    /// Panics if more than `u32::MAX` distinct names are interned.
    #[must_use]
    pub fn build(
        dataset: Dataset,
        version: DatasetVersion,
        features: Vec<Feature>,
        year_stats: &LocationYearStats,
        config: &TileServiceConfig,
    ) -> Self {
        let start = std::time::Instant::now();
        let mut locations = StringTable::new();
        let mut streets = StringTable::new();
        let mut infractions = StringTable::new();
        let mut records = Vec::with_capacity(features.len());
        let mut summary_points = Vec::with_capacity(features.len());
        let mut skipped = 0usize;

        for feature in &features {
            if !feature.has_valid_position() {
                skipped += 1;
                continue;
            }
            let location_id = locations.intern(feature.location_name());
            let street_id = feature.street_name().map(|street| streets.intern(street));
            let infraction_id = feature
                .top_infraction
                .as_deref()
                .map(|code| infractions.intern(code));
            let (x, y) = PointRecord::project(feature.longitude, feature.latitude);

            records.push(PointRecord {
                id: feature.id,
                x,
                y,
                ticket_count: feature.ticket_count,
                total_revenue: feature.total_revenue,
                year_mask: feature.year_mask,
                month_mask: feature.month_mask,
                location_id,
                street_id,
                infraction_id,
            });
            summary_points.push(SummaryPoint {
                longitude: feature.longitude,
                latitude: feature.latitude,
                ticket_count: feature.ticket_count,
                total_revenue: feature.total_revenue,
                location_id,
                street_id,
                year_mask: feature.year_mask,
                month_mask: feature.month_mask,
            });
        }
        drop(features);

        if skipped > 0 {
            log::warn!(
                "{dataset} {version}: skipped {skipped} feature(s) without a valid position"
            );
        }

        let year_totals: LocationYearTotals = year_stats
            .iter()
            .filter_map(|(name, years)| {
                locations
                    .lookup(name)
                    .map(|location_id| (location_id, years.clone()))
            })
            .collect();

        let labels = Labels {
            locations: Arc::new(locations),
            streets: Arc::new(streets),
            infractions: Arc::new(infractions),
        };
        let clusters = ClusterIndex::build(&records, &config.cluster);
        let slicer = TileSlicer::build(&records, &config.slicer, config.tiles.extent);
        let spatial = SpatialQueryIndex::build(
            summary_points,
            Arc::clone(&labels.locations),
            Arc::clone(&labels.streets),
            year_totals,
            YearWindow::new(config.loader.base_year),
            version,
        );

        log::info!(
            "Built {dataset} {version} indices: {} points, {} locations, {} streets in {:.1}s",
            records.len(),
            labels.locations.len(),
            labels.streets.len(),
            start.elapsed().as_secs_f64()
        );

        Self {
            dataset,
            version,
            records,
            labels,
            clusters,
            slicer,
            spatial,
            raw_point_zoom: config.tiles.raw_point_zoom,
            extent: config.tiles.extent,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Tile-local features of `coord`: raw points at or above the raw
    /// point zoom, clusters below it.
    #[must_use]
    pub fn tile_features(&self, coord: TileCoord) -> Vec<TileFeature> {
        if self.records.is_empty() {
            return Vec::new();
        }
        if coord.z >= self.raw_point_zoom {
            self.slicer.get_tile(coord, &self.records)
        } else {
            self.clusters.get_tile(coord, self.extent)
        }
    }
}

type LoadFuture = Shared<BoxFuture<'static, Result<Arc<DatasetIndices>, LoadError>>>;

/// Loads one dataset and keeps its indices current.
pub struct DatasetLoader {
    dataset: Dataset,
    store: Arc<dyn FeatureStore>,
    analytical: Option<Arc<dyn AnalyticalSource>>,
    config: Arc<TileServiceConfig>,
    current: RwLock<Option<Arc<DatasetIndices>>>,
    last_check: Mutex<Option<Instant>>,
    in_flight: Mutex<Option<LoadFuture>>,
    /// Source versions seen when `current` was built.
    built_from: Mutex<Option<SourceVersions>>,
    builds: AtomicU64,
}

/// Versions reported by every feature source at one check. Indices are
/// rebuilt only when this changes, whichever source supplied them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SourceVersions {
    store: DatasetVersion,
    analytical: Option<DatasetVersion>,
}

impl DatasetLoader {
    #[must_use]
    pub fn new(
        dataset: Dataset,
        store: Arc<dyn FeatureStore>,
        analytical: Option<Arc<dyn AnalyticalSource>>,
        config: Arc<TileServiceConfig>,
    ) -> Self {
        Self {
            dataset,
            store,
            analytical,
            config,
            current: RwLock::new(None),
            last_check: Mutex::new(None),
            in_flight: Mutex::new(None),
            built_from: Mutex::new(None),
            builds: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub const fn dataset(&self) -> Dataset {
        self.dataset
    }

    /// The indices currently being served, if any have been built.
    #[must_use]
    pub fn current(&self) -> Option<Arc<DatasetIndices>> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of index builds performed.
    #[must_use]
    pub fn builds(&self) -> u64 {
        self.builds.load(Ordering::SeqCst)
    }

    /// Searches the current spatial index, or reports that the dataset
    /// has not finished loading.
    #[must_use]
    pub fn search(&self, bbox: &BoundingBox) -> SearchOutcome {
        self.current().map_or(SearchOutcome::NotReady, |indices| {
            SearchOutcome::Ready(indices.spatial.search(bbox))
        })
    }

    /// Ensures the indices reflect the latest published version.
    ///
    /// Within the configured check interval the current indices are
    /// returned without asking the sources. Otherwise every source reports
    /// its version and, when any differs from the versions the current
    /// indices were built from, all indices are rebuilt and swapped in.
    /// Concurrent callers share one check and rebuild.
    ///
    /// # Errors
    ///
    /// Returns [`LoadError`] only when no indices have been built yet and
    /// the store cannot be read; once indices exist, store failures are
    /// logged and the existing indices stay in service.
    pub async fn ensure_loaded(self: &Arc<Self>) -> Result<Arc<DatasetIndices>, LoadError> {
        if let Some(current) = self.fresh_current() {
            return Ok(current);
        }

        let fut = {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(fut) = in_flight.as_ref() {
                fut.clone()
            } else {
                let this = Arc::clone(self);
                let fut = async move {
                    let result = this.refresh().await;
                    *this.in_flight.lock().unwrap_or_else(PoisonError::into_inner) = None;
                    result
                }
                .boxed()
                .shared();
                *in_flight = Some(fut.clone());
                fut
            }
        };
        fut.await
    }

    fn fresh_current(&self) -> Option<Arc<DatasetIndices>> {
        let current = self.current()?;
        let last_check = *self.last_check.lock().unwrap_or_else(PoisonError::into_inner);
        let interval = self.config.version_check_interval();
        last_check
            .filter(|checked| checked.elapsed() < interval)
            .map(|_| current)
    }

    fn mark_checked(&self) {
        *self.last_check.lock().unwrap_or_else(PoisonError::into_inner) = Some(Instant::now());
    }

    async fn refresh(&self) -> Result<Arc<DatasetIndices>, LoadError> {
        let previous = self.current();
        let result = self.check_and_build(previous.as_ref()).await;
        self.mark_checked();
        match (result, previous) {
            (Ok(indices), _) => Ok(indices),
            (Err(e), Some(previous)) => {
                log::warn!(
                    "Failed to refresh {} (keeping {}): {e}",
                    self.dataset,
                    previous.version
                );
                Ok(previous)
            }
            (Err(e), None) => Err(e),
        }
    }

    async fn source_versions(&self) -> Result<SourceVersions, LoadError> {
        let store = self.store.current_version(self.dataset).await?;
        let analytical = match &self.analytical {
            Some(analytical) => Some(analytical.current_version(self.dataset).await?),
            None => None,
        };
        Ok(SourceVersions { store, analytical })
    }

    async fn check_and_build(
        &self,
        previous: Option<&Arc<DatasetIndices>>,
    ) -> Result<Arc<DatasetIndices>, LoadError> {
        let sources = self.source_versions().await?;
        if let Some(previous) = previous {
            let built_from = *self.built_from.lock().unwrap_or_else(PoisonError::into_inner);
            if built_from == Some(sources) {
                log::trace!("{} unchanged at {}", self.dataset, previous.version);
                return Ok(Arc::clone(previous));
            }
        }

        let (features, version) = self.load_features(sources).await?;
        let year_stats = self.store.location_year_totals(self.dataset).await?;

        let dataset = self.dataset;
        let config = Arc::clone(&self.config);
        let indices = tokio::task::spawn_blocking(move || {
            DatasetIndices::build(dataset, version, features, &year_stats, &config)
        })
        .await
        .map_err(|e| LoadError::Build(e.to_string()))?;
        let indices = Arc::new(indices);

        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&indices));
        *self.built_from.lock().unwrap_or_else(PoisonError::into_inner) = Some(sources);
        self.builds.fetch_add(1, Ordering::SeqCst);
        match previous {
            Some(previous) => log::info!(
                "Swapped {} indices {} -> {}",
                self.dataset,
                previous.version,
                indices.version
            ),
            None => log::info!("Loaded {} indices at {}", self.dataset, indices.version),
        }

        if let Err(e) = self.persist_summary(&indices).await {
            log::warn!("Failed to persist {} summary snapshot: {e}", self.dataset);
        }
        Ok(indices)
    }

    /// Reads features from the chunked store, then the raw collection,
    /// then the analytical fallback, stopping at the first non-empty one.
    /// The returned version is the one of the source that supplied them.
    async fn load_features(
        &self,
        sources: SourceVersions,
    ) -> Result<(Vec<Feature>, DatasetVersion), LoadError> {
        if let Some(manifest) = self.store.manifest(self.dataset).await? {
            let mut features = Vec::new();
            for chunk in &manifest.chunks {
                features.extend(self.store.read_chunk(self.dataset, chunk).await?);
            }
            if !features.is_empty() {
                log::debug!(
                    "Read {} features from {} chunk(s) of {}",
                    features.len(),
                    manifest.chunks.len(),
                    self.dataset
                );
                return Ok((features, manifest.version));
            }
        }

        if let Some(raw) = self.store.raw_features(self.dataset).await? {
            if !raw.features.is_empty() {
                log::info!(
                    "{} has no chunks, using raw collection ({} features)",
                    self.dataset,
                    raw.features.len()
                );
                return Ok((raw.features, raw.version));
            }
        }

        if let (Some(analytical), Some(version)) = (&self.analytical, sources.analytical) {
            let features = analytical.query_features(self.dataset).await?;
            if !features.is_empty() {
                log::info!(
                    "{} store is empty, using analytical fallback ({} features at {version})",
                    self.dataset,
                    features.len()
                );
                return Ok((features, version));
            }
        }

        log::info!("{} has no features at {}", self.dataset, sources.store);
        Ok((Vec::new(), sources.store))
    }

    fn summary_path(&self) -> PathBuf {
        self.config
            .loader
            .summary_dir
            .join(format!("{}.json", self.dataset))
    }

    async fn persist_summary(&self, indices: &DatasetIndices) -> Result<(), LoadError> {
        let summary = indices
            .spatial
            .dataset_summary(self.dataset, self.config.summary.top_streets);
        let path = self.summary_path();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| LoadError::io(parent, e))?;
        }
        let json = serde_json::to_vec_pretty(&summary).map_err(|e| LoadError::Json {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        tokio::fs::write(&path, json)
            .await
            .map_err(|e| LoadError::io(&path, e))
    }

    /// Dataset-wide totals from the current indices, falling back to the
    /// last persisted snapshot, then to an all-zero summary.
    pub async fn dataset_summary(&self) -> DatasetSummary {
        if let Some(indices) = self.current() {
            return indices
                .spatial
                .dataset_summary(self.dataset, self.config.summary.top_streets);
        }

        let path = self.summary_path();
        match tokio::fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(summary) => return summary,
                Err(e) => log::warn!("Ignoring unreadable summary {}: {e}", path.display()),
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => log::warn!("Failed to read summary {}: {e}", path.display()),
        }
        DatasetSummary::empty(self.dataset)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;

    use async_trait::async_trait;
    use ticket_map_tiles_models::{Cents, mercator};

    use super::*;
    use crate::store::{ChunkManifest, MemoryFeatureStore, RawFeatureCollection};
    use crate::test_support::{cleanup, config, parking, store_with};

    fn loader(store: Arc<dyn FeatureStore>, config: &TileServiceConfig) -> Arc<DatasetLoader> {
        Arc::new(DatasetLoader::new(
            Dataset::ParkingTickets,
            store,
            None,
            Arc::new(config.clone()),
        ))
    }

    #[tokio::test]
    async fn empty_dataset_loads_valid_empty_indices() {
        let config = config("loader_empty");
        let loader = loader(Arc::new(MemoryFeatureStore::new()), &config);
        assert_eq!(
            loader.search(&BoundingBox::new(-180.0, -85.0, 180.0, 85.0)),
            SearchOutcome::NotReady
        );

        let indices = loader.ensure_loaded().await.unwrap();
        assert!(indices.is_empty());
        assert_eq!(indices.version, DatasetVersion::EMPTY);
        assert!(indices.tile_features(TileCoord::new(10, 0, 0)).is_empty());
        assert_eq!(
            loader.search(&BoundingBox::new(-180.0, -85.0, 180.0, 85.0)),
            SearchOutcome::Ready(Vec::new())
        );
        cleanup(&config);
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_build() {
        let mut config = config("loader_shared");
        config.loader.version_check_interval_secs = 60;
        let store = store_with(1, vec![parking(1, -79.38, 43.65, 5, "QUEEN ST W")]);
        let loader = loader(store, &config);

        let (a, b) = tokio::join!(loader.ensure_loaded(), loader.ensure_loaded());
        let (a, b) = (a.unwrap(), b.unwrap());
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(loader.builds(), 1);
        cleanup(&config);
    }

    #[tokio::test]
    async fn version_change_rebuilds_indices() {
        let config = config("loader_version");
        let store = store_with(1, vec![parking(1, -79.38, 43.65, 5, "QUEEN ST W")]);
        let loader = loader(Arc::clone(&store) as Arc<dyn FeatureStore>, &config);

        let first = loader.ensure_loaded().await.unwrap();
        assert_eq!(first.version, DatasetVersion(1));
        let same = loader.ensure_loaded().await.unwrap();
        assert!(Arc::ptr_eq(&first, &same));

        store.publish(
            Dataset::ParkingTickets,
            DatasetVersion(2),
            vec![
                parking(1, -79.38, 43.65, 5, "QUEEN ST W"),
                parking(2, -79.39, 43.66, 3, "KING ST W"),
            ],
        );
        let second = loader.ensure_loaded().await.unwrap();
        assert_eq!(second.version, DatasetVersion(2));
        assert_eq!(second.records.len(), 2);
        assert_eq!(loader.builds(), 2);
        // The old indices are untouched by the swap.
        assert_eq!(first.records.len(), 1);
        cleanup(&config);
    }

    #[tokio::test]
    async fn one_feature_appears_at_every_zoom() {
        let config = config("loader_one_feature");
        let (lon, lat) = (-79.3832, 43.6532);
        let store = store_with(1, vec![parking(1, lon, lat, 5, "QUEEN ST W")]);
        let indices = loader(store, &config).ensure_loaded().await.unwrap();

        for z in [4, 10, config.tiles.raw_point_zoom, config.slicer.index_max_zoom, 19] {
            let coord = TileCoord::new(
                z,
                mercator::lon_to_tile_x(lon, z),
                mercator::lat_to_tile_y(lat, z),
            );
            let features = indices.tile_features(coord);
            assert_eq!(features.len(), 1, "zoom {z}");
            assert_eq!(features[0].aggregate.ticket_count, 5);
        }
        cleanup(&config);
    }

    #[tokio::test]
    async fn invalid_positions_are_skipped() {
        let config = config("loader_invalid");
        let store = store_with(
            1,
            vec![
                parking(1, -79.38, 43.65, 5, "QUEEN ST W"),
                parking(2, f64::NAN, 43.65, 5, "QUEEN ST W"),
                parking(3, -79.38, 89.9, 5, "QUEEN ST W"),
            ],
        );
        let indices = loader(store, &config).ensure_loaded().await.unwrap();
        assert_eq!(indices.records.len(), 1);
        cleanup(&config);
    }

    #[tokio::test]
    async fn falls_back_to_raw_collection() {
        let config = config("loader_raw");
        let store = Arc::new(MemoryFeatureStore::new());
        store.publish_raw(
            Dataset::ParkingTickets,
            DatasetVersion(9),
            vec![parking(1, -79.38, 43.65, 5, "QUEEN ST W")],
        );
        let indices = loader(store, &config).ensure_loaded().await.unwrap();
        assert_eq!(indices.version, DatasetVersion(9));
        assert_eq!(indices.records.len(), 1);
        cleanup(&config);
    }

    #[tokio::test]
    async fn unchanged_raw_collection_is_not_rebuilt() {
        let config = config("loader_raw_unchanged");
        let store = Arc::new(MemoryFeatureStore::new());
        // A manifest whose only chunk is empty reports version 5, while the
        // features come from the raw collection at version 9.
        store.publish_chunks(Dataset::ParkingTickets, DatasetVersion(5), vec![Vec::new()]);
        store.publish_raw(
            Dataset::ParkingTickets,
            DatasetVersion(9),
            vec![parking(1, -79.38, 43.65, 5, "QUEEN ST W")],
        );
        let loader = loader(store, &config);

        let first = loader.ensure_loaded().await.unwrap();
        assert_eq!(first.version, DatasetVersion(9));
        for _ in 0..3 {
            let again = loader.ensure_loaded().await.unwrap();
            assert!(Arc::ptr_eq(&first, &again));
        }
        assert_eq!(loader.builds(), 1);
        cleanup(&config);
    }

    /// Analytical source with a settable version.
    struct FixedAnalytics {
        version: AtomicU64,
    }

    impl FixedAnalytics {
        fn at(version: u64) -> Arc<Self> {
            Arc::new(Self {
                version: AtomicU64::new(version),
            })
        }
    }

    #[async_trait]
    impl AnalyticalSource for FixedAnalytics {
        async fn query_features(&self, _dataset: Dataset) -> Result<Vec<Feature>, LoadError> {
            Ok(vec![parking(1, -79.38, 43.65, 4, "BAY ST")])
        }

        async fn current_version(&self, _dataset: Dataset) -> Result<DatasetVersion, LoadError> {
            Ok(DatasetVersion(self.version.load(Ordering::SeqCst)))
        }
    }

    fn analytical_loader(
        analytics: &Arc<FixedAnalytics>,
        config: &TileServiceConfig,
    ) -> Arc<DatasetLoader> {
        Arc::new(DatasetLoader::new(
            Dataset::ParkingTickets,
            Arc::new(MemoryFeatureStore::new()),
            Some(Arc::clone(analytics) as Arc<dyn AnalyticalSource>),
            Arc::new(config.clone()),
        ))
    }

    #[tokio::test]
    async fn falls_back_to_analytical_source() {
        let config = config("loader_analytical");
        let loader = analytical_loader(&FixedAnalytics::at(7), &config);
        let indices = loader.ensure_loaded().await.unwrap();
        assert_eq!(indices.version, DatasetVersion(7));
        assert_eq!(indices.records.len(), 1);
        assert_eq!(indices.records[0].ticket_count, 4);
        cleanup(&config);
    }

    #[tokio::test]
    async fn analytical_version_drives_rebuilds() {
        let config = config("loader_analytical_version");
        let analytics = FixedAnalytics::at(7);
        let loader = analytical_loader(&analytics, &config);

        let first = loader.ensure_loaded().await.unwrap();
        let again = loader.ensure_loaded().await.unwrap();
        assert!(Arc::ptr_eq(&first, &again));
        assert_eq!(loader.builds(), 1);

        analytics.version.store(8, Ordering::SeqCst);
        let rebuilt = loader.ensure_loaded().await.unwrap();
        assert_eq!(rebuilt.version, DatasetVersion(8));
        assert_eq!(loader.builds(), 2);
        cleanup(&config);
    }

    /// Memory store that can be made to fail every call.
    struct FlakyStore {
        inner: MemoryFeatureStore,
        failing: AtomicBool,
    }

    impl FlakyStore {
        fn check(&self) -> Result<(), LoadError> {
            if self.failing.load(Ordering::SeqCst) {
                Err(LoadError::Store("offline".to_string()))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl FeatureStore for FlakyStore {
        async fn manifest(&self, dataset: Dataset) -> Result<Option<ChunkManifest>, LoadError> {
            self.check()?;
            self.inner.manifest(dataset).await
        }

        async fn read_chunk(
            &self,
            dataset: Dataset,
            chunk: &str,
        ) -> Result<Vec<Feature>, LoadError> {
            self.check()?;
            self.inner.read_chunk(dataset, chunk).await
        }

        async fn raw_features(
            &self,
            dataset: Dataset,
        ) -> Result<Option<RawFeatureCollection>, LoadError> {
            self.check()?;
            self.inner.raw_features(dataset).await
        }

        async fn location_year_totals(
            &self,
            dataset: Dataset,
        ) -> Result<LocationYearStats, LoadError> {
            self.check()?;
            self.inner.location_year_totals(dataset).await
        }
    }

    #[tokio::test]
    async fn store_failure_keeps_previous_indices() {
        let config = config("loader_flaky");
        let store = Arc::new(FlakyStore {
            inner: MemoryFeatureStore::new(),
            failing: AtomicBool::new(true),
        });
        let loader = loader(Arc::clone(&store) as Arc<dyn FeatureStore>, &config);
        assert!(loader.ensure_loaded().await.is_err());

        store.failing.store(false, Ordering::SeqCst);
        store.inner.publish(
            Dataset::ParkingTickets,
            DatasetVersion(3),
            vec![parking(1, -79.38, 43.65, 5, "QUEEN ST W")],
        );
        let loaded = loader.ensure_loaded().await.unwrap();

        store.failing.store(true, Ordering::SeqCst);
        let kept = loader.ensure_loaded().await.unwrap();
        assert!(Arc::ptr_eq(&loaded, &kept));
        cleanup(&config);
    }

    #[tokio::test]
    async fn summary_snapshot_survives_restart() {
        let config = config("loader_summary");
        let store = store_with(
            4,
            vec![
                parking(1, -79.38, 43.65, 5, "QUEEN ST W"),
                parking(2, -79.39, 43.66, 3, "KING ST W"),
            ],
        );
        let first = loader(Arc::clone(&store) as Arc<dyn FeatureStore>, &config);
        first.ensure_loaded().await.unwrap();
        let live = first.dataset_summary().await;
        assert_eq!(live.ticket_count, 8);
        assert_eq!(live.total_revenue, Cents(24_000));

        let restarted = loader(store, &config);
        assert_eq!(restarted.dataset_summary().await, live);

        let other = DatasetLoader::new(
            Dataset::SpeedCameras,
            Arc::new(MemoryFeatureStore::new()),
            None,
            Arc::new(config.clone()),
        );
        assert_eq!(
            other.dataset_summary().await,
            DatasetSummary::empty(Dataset::SpeedCameras)
        );
        cleanup(&config);
    }
}
