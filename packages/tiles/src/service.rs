//! Tile cache and generation orchestrator.
//!
//! [`TileService`] answers tile requests through a strict waterfall:
//!
//! 1. process memory ([`SizedCache`], byte-bounded)
//! 2. distributed live entry
//! 3. distributed stale entry (served, then revalidated in the background)
//! 4. disk snapshot of the same dataset version (served, then revalidated)
//! 5. generation
//!
//! Every cache key embeds the dataset version, so a tile generated from one
//! version can never be served for another. Generation is coalesced per
//! key and version within the process and bounded by a render semaphore.
//! Background revalidation additionally takes an advisory distributed lock
//! so only one process refreshes a key at a time.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::{BoxFuture, Shared};
use futures::{FutureExt as _, StreamExt as _};
use serde::Serialize;
use ticket_map_cache::{
    CacheEnvelope, CacheError, DiskSnapshotStore, DistributedCache, SizedCache,
};
use ticket_map_tiles_models::{
    BoundingBox, Dataset, DatasetSummary, DatasetVersion, ProgressCallback, SummaryFilters,
    TileCoord, TileKey, TileResponse, TileSource, ViewportSummary, mercator,
};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::TileServiceConfig;
use crate::encode::{encode_tile, etag};
use crate::error::TileError;
use crate::loader::{DatasetIndices, DatasetLoader};
use crate::metrics::{MetricsSnapshot, TileMetrics};
use crate::policy::TilePolicy;
use crate::revalidate::{Revalidate, RevalidationJob, RevalidationQueue, ScheduleOutcome};
use crate::signal::Signal;
use crate::store::{AnalyticalSource, FeatureStore};

static SERVICE_SEQ: AtomicU64 = AtomicU64::new(0);

/// Per-request knobs for [`TileService::get_tile`].
#[derive(Debug, Clone)]
pub struct TileRequestOptions {
    /// Cancellation and deadline of the caller. The zoom band timeout is
    /// applied on top of it.
    pub signal: Signal,
    /// Serve stale distributed entries and disk snapshots.
    pub allow_stale: bool,
    /// Schedule a background refresh after serving a stale entry.
    pub revalidate: bool,
}

impl Default for TileRequestOptions {
    fn default() -> Self {
        Self {
            signal: Signal::new(),
            allow_stale: true,
            revalidate: true,
        }
    }
}

/// Outcome of a [`TileService::prewarm`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrewarmStats {
    pub tiles: u64,
    pub non_empty: u64,
    pub empty: u64,
    pub failed: u64,
}

/// A tile held by the memory tier or produced by a render. `payload` is
/// `None` for a tile with no features.
#[derive(Debug, Clone)]
struct CachedTile {
    version: DatasetVersion,
    payload: Option<Arc<[u8]>>,
    etag: String,
}

impl CachedTile {
    fn from_envelope(envelope: CacheEnvelope) -> Self {
        Self {
            version: DatasetVersion(envelope.version),
            payload: (!envelope.payload.is_empty()).then(|| Arc::from(envelope.payload)),
            etag: envelope.etag,
        }
    }

    fn envelope(&self) -> CacheEnvelope {
        CacheEnvelope::new(
            self.version.0,
            self.etag.clone(),
            self.payload.as_deref().map(<[u8]>::to_vec).unwrap_or_default(),
        )
    }

    fn respond(self, source: TileSource) -> Option<TileResponse> {
        let buffer = self.payload?;
        Some(TileResponse {
            buffer,
            version: self.version,
            source,
            etag: self.etag,
        })
    }
}

fn estimate_tile_size(_key: &TileKey, tile: &CachedTile) -> usize {
    std::mem::size_of::<TileKey>()
        + std::mem::size_of::<CachedTile>()
        + tile.payload.as_ref().map_or(0, |p| p.len())
        + tile.etag.len()
}

type RenderFuture = Shared<BoxFuture<'static, Result<CachedTile, TileError>>>;

enum DistributedRead {
    Hit(CachedTile),
    Miss,
    Unavailable,
}

/// Layered tile cache and generator for every [`Dataset`].
pub struct TileService {
    inner: Arc<Inner>,
}

struct Inner {
    config: Arc<TileServiceConfig>,
    policy: TilePolicy,
    loaders: HashMap<Dataset, Arc<DatasetLoader>>,
    distributed: Arc<dyn DistributedCache>,
    snapshots: DiskSnapshotStore,
    memory: Mutex<SizedCache<TileKey, CachedTile>>,
    in_flight: Mutex<HashMap<(TileKey, DatasetVersion), RenderFuture>>,
    served_versions: Mutex<HashMap<Dataset, DatasetVersion>>,
    render_permits: Semaphore,
    metrics: TileMetrics,
    revalidation: RevalidationQueue,
    background: CancellationToken,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    lock_owner: String,
}

impl TileService {
    /// Creates a service over `store`, spawning the revalidation workers
    /// and, when a sweep interval is configured, the guardrail sweeper.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    #[must_use]
    pub fn new(
        config: TileServiceConfig,
        store: Arc<dyn FeatureStore>,
        analytical: Option<Arc<dyn AnalyticalSource>>,
        distributed: Arc<dyn DistributedCache>,
    ) -> Self {
        let config = Arc::new(config);
        let loaders = Dataset::all()
            .iter()
            .map(|&dataset| {
                let loader = DatasetLoader::new(
                    dataset,
                    Arc::clone(&store),
                    analytical.clone(),
                    Arc::clone(&config),
                );
                (dataset, Arc::new(loader))
            })
            .collect();

        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| Inner {
            policy: TilePolicy::new(&config),
            loaders,
            distributed,
            snapshots: DiskSnapshotStore::new(
                config.cache.snapshot_dir.clone(),
                config.snapshot_max_age(),
            ),
            memory: Mutex::new(SizedCache::new(
                config.cache.memory_bytes,
                estimate_tile_size,
            )),
            in_flight: Mutex::new(HashMap::new()),
            served_versions: Mutex::new(HashMap::new()),
            render_permits: Semaphore::new(config.concurrency.render_permits.max(1)),
            metrics: TileMetrics::default(),
            revalidation: RevalidationQueue::start(
                weak.clone(),
                config.concurrency.revalidate_queue,
                config.concurrency.revalidate_workers,
            ),
            background: CancellationToken::new(),
            sweeper: Mutex::new(None),
            lock_owner: format!(
                "{}-{}",
                std::process::id(),
                SERVICE_SEQ.fetch_add(1, Ordering::Relaxed)
            ),
            config,
        });

        let interval = inner.config.sweep_interval();
        if !interval.is_zero() {
            let handle = tokio::spawn(run_sweeper(
                Arc::downgrade(&inner),
                interval,
                inner.background.clone(),
            ));
            *inner.sweeper.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        }

        Self { inner }
    }

    #[must_use]
    pub fn config(&self) -> &TileServiceConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    /// Version of the indices currently loaded for `dataset`.
    #[must_use]
    pub fn version(&self, dataset: Dataset) -> Option<DatasetVersion> {
        self.inner
            .loader(dataset)
            .current()
            .map(|indices| indices.version)
    }

    /// Loads `dataset` if needed and returns its current version.
    ///
    /// # Errors
    ///
    /// Returns [`TileError::Load`] if the dataset has never loaded and its
    /// store cannot be read.
    pub async fn ensure_loaded(&self, dataset: Dataset) -> Result<DatasetVersion, TileError> {
        let indices = self.inner.loader(dataset).ensure_loaded().await?;
        self.inner.observe_version(dataset, indices.version).await;
        Ok(indices.version)
    }

    /// Returns the tile at `(z, x, y)`, or `None` when the zoom is outside
    /// the served range or the tile has no features.
    ///
    /// # Errors
    ///
    /// * [`TileError::Cancelled`] / [`TileError::Timeout`] when the
    ///   request's signal or zoom band timeout fires first
    /// * [`TileError::Load`] when the dataset has never loaded
    /// * [`TileError::Encode`] / [`TileError::Generation`] when rendering fails
    /// * [`TileError::ShuttingDown`] after [`Self::shutdown`]
    pub async fn get_tile(
        &self,
        dataset: Dataset,
        z: u8,
        x: u32,
        y: u32,
        options: &TileRequestOptions,
    ) -> Result<Option<TileResponse>, TileError> {
        options.signal.check()?;

        let tiles = &self.inner.config.tiles;
        let coord = TileCoord::new(z, x, y);
        if z < tiles.min_zoom || z > tiles.max_zoom || !coord.is_valid() {
            return Ok(None);
        }

        let key = TileKey { dataset, coord };
        let signal = options.signal.child_with_timeout(self.inner.policy.timeout(z));
        let result = self.inner.serve(key, &signal, options).await;
        match &result {
            Err(e) if e.is_abort() => log::debug!("Tile {key} aborted: {e}"),
            Err(e) => log::warn!("Tile {key} failed: {e}"),
            Ok(_) => {}
        }
        result
    }

    /// Viewport totals for `bbox`.
    ///
    /// Below the configured zoom floor the result is zoom-restricted and
    /// no index is touched. Before the dataset has loaded the result is
    /// not ready and a load is started in the background.
    pub fn summarize_viewport(
        &self,
        dataset: Dataset,
        bbox: &BoundingBox,
        zoom: u8,
        filters: SummaryFilters,
    ) -> ViewportSummary {
        let summary = &self.inner.config.summary;
        if zoom < summary.min_zoom {
            return ViewportSummary::restricted();
        }

        let loader = self.inner.loader(dataset);
        let Some(indices) = loader.current() else {
            let loader = Arc::clone(loader);
            tokio::spawn(async move {
                if let Err(e) = loader.ensure_loaded().await {
                    log::warn!("Background load of {} failed: {e}", loader.dataset());
                }
            });
            return ViewportSummary::not_ready();
        };
        indices.spatial.summarize(bbox, filters, summary.top_streets)
    }

    /// Zoom at which cluster `cluster_id` of `dataset` splits apart.
    #[must_use]
    pub fn get_cluster_expansion_zoom(&self, dataset: Dataset, cluster_id: u32) -> Option<u8> {
        self.inner
            .loader(dataset)
            .current()?
            .clusters
            .expansion_zoom(cluster_id)
    }

    /// Dataset-wide totals, from the loaded indices or the last persisted
    /// summary snapshot.
    pub async fn dataset_summary(&self, dataset: Dataset) -> DatasetSummary {
        self.inner.loader(dataset).dataset_summary().await
    }

    /// Renders every tile covering `bbox` at each of `zooms` through the
    /// normal request path.
    ///
    /// # Errors
    ///
    /// Returns [`TileError::Load`] if the dataset cannot be loaded. Per-tile
    /// failures are counted in [`PrewarmStats::failed`].
    pub async fn prewarm(
        &self,
        dataset: Dataset,
        bbox: &BoundingBox,
        zooms: &[u8],
        progress: Arc<dyn ProgressCallback>,
    ) -> Result<PrewarmStats, TileError> {
        self.ensure_loaded(dataset).await?;

        let tiles = &self.inner.config.tiles;
        let coords: Vec<TileCoord> = zooms
            .iter()
            .copied()
            .filter(|z| (tiles.min_zoom..=tiles.max_zoom).contains(z))
            .flat_map(|z| covering_tiles(bbox, z))
            .collect();
        progress.set_total(coords.len() as u64);
        progress.set_message(format!("Prewarming {dataset}"));

        let options = TileRequestOptions {
            revalidate: false,
            ..TileRequestOptions::default()
        };
        let concurrency = self.inner.config.concurrency.render_permits.max(1);
        let mut results = futures::stream::iter(coords)
            .map(|coord| {
                let options = &options;
                async move {
                    self.get_tile(dataset, coord.z, coord.x, coord.y, options)
                        .await
                }
            })
            .buffer_unordered(concurrency);

        let mut stats = PrewarmStats::default();
        while let Some(result) = results.next().await {
            stats.tiles += 1;
            match result {
                Ok(Some(_)) => stats.non_empty += 1,
                Ok(None) => stats.empty += 1,
                Err(_) => stats.failed += 1,
            }
            progress.inc(1);
        }

        progress.finish(format!(
            "Prewarmed {} {dataset} tiles ({} with features, {} failed)",
            stats.tiles, stats.non_empty, stats.failed
        ));
        log::info!(
            "Prewarmed {} {dataset} tiles: {} non-empty, {} empty, {} failed",
            stats.tiles,
            stats.non_empty,
            stats.empty,
            stats.failed
        );
        Ok(stats)
    }

    /// Deletes distributed entries larger than the configured maximum
    /// payload size. Returns the number of keys removed.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] if the distributed cache cannot be scanned.
    pub async fn sweep_oversized(&self) -> Result<u64, CacheError> {
        self.inner.sweep_oversized().await
    }

    /// Stops background work: the revalidation queue stops accepting jobs
    /// and drains, the sweeper exits and no new renders start.
    pub async fn shutdown(&self) {
        self.inner.render_permits.close();
        self.inner.revalidation.shutdown().await;
        self.inner.background.cancel();

        let sweeper = self
            .inner
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = sweeper {
            if let Err(e) = handle.await {
                log::warn!("Cache sweeper ended abnormally: {e}");
            }
        }
        log::info!("Tile service shut down");
    }
}

/// Tiles at `zoom` intersecting `bbox`.
fn covering_tiles(bbox: &BoundingBox, zoom: u8) -> impl Iterator<Item = TileCoord> {
    let north = bbox.north.min(mercator::MAX_LATITUDE);
    let south = bbox.south.max(-mercator::MAX_LATITUDE);
    let (x0, x1) = (
        mercator::lon_to_tile_x(bbox.west, zoom),
        mercator::lon_to_tile_x(bbox.east, zoom),
    );
    let (y0, y1) = (
        mercator::lat_to_tile_y(north, zoom),
        mercator::lat_to_tile_y(south, zoom),
    );
    (x0..=x1).flat_map(move |x| (y0..=y1).map(move |y| TileCoord::new(zoom, x, y)))
}

impl Inner {
    /// # Panics
    ///
    /// Panics if no loader was registered for `dataset`.
    fn loader(&self, dataset: Dataset) -> &Arc<DatasetLoader> {
        self.loaders
            .get(&dataset)
            .expect("a loader exists for every dataset")
    }

    fn version_tag(version: DatasetVersion) -> String {
        format!("v{}", version.0)
    }

    fn live_key(&self, key: TileKey, version: DatasetVersion) -> String {
        format!(
            "{}:{}:{}:{}",
            self.config.cache.key_prefix,
            key.dataset,
            Self::version_tag(version),
            tile_path(key.coord).replace('/', ":")
        )
    }

    fn stale_key(&self, key: TileKey, version: DatasetVersion) -> String {
        format!(
            "{}:stale:{}:{}:{}",
            self.config.cache.key_prefix,
            key.dataset,
            Self::version_tag(version),
            tile_path(key.coord).replace('/', ":")
        )
    }

    fn lock_key(&self, key: TileKey, version: DatasetVersion) -> String {
        format!(
            "{}:lock:{}:{}:{}",
            self.config.cache.key_prefix,
            key.dataset,
            Self::version_tag(version),
            tile_path(key.coord).replace('/', ":")
        )
    }

    /// Records the version served for `dataset`. On a change the memory
    /// tier for the dataset is cleared and older disk snapshots pruned.
    async fn observe_version(&self, dataset: Dataset, version: DatasetVersion) {
        let previous = self
            .served_versions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(dataset, version);
        if previous == Some(version) {
            return;
        }

        if let Some(previous) = previous {
            let mut memory = self.memory.lock().unwrap_or_else(PoisonError::into_inner);
            let before = memory.len();
            memory.retain(|key, _| key.dataset != dataset);
            log::info!(
                "{dataset} advanced {previous} -> {version}, dropped {} memory tile(s)",
                before - memory.len()
            );
        }
        if let Err(e) = self
            .snapshots
            .prune_versions(dataset.as_ref(), &Self::version_tag(version))
            .await
        {
            log::warn!("Failed to prune {dataset} snapshots: {e}");
        }
    }

    async fn serve(
        self: &Arc<Self>,
        key: TileKey,
        signal: &Signal,
        options: &TileRequestOptions,
    ) -> Result<Option<TileResponse>, TileError> {
        let indices = signal
            .guard(self.loader(key.dataset).ensure_loaded())
            .await??;
        let version = indices.version;
        self.observe_version(key.dataset, version).await;

        if let Some(tile) = self.memory_get(key, version) {
            return Ok(self.hit(key, tile, TileSource::Memory));
        }

        let live_key = self.live_key(key, version);
        match signal.guard(self.read_distributed(&live_key, version)).await? {
            DistributedRead::Hit(tile) => {
                self.remember(key, &tile);
                return Ok(self.hit(key, tile, TileSource::DistributedLive));
            }
            DistributedRead::Miss if options.allow_stale => {
                let stale_key = self.stale_key(key, version);
                if let DistributedRead::Hit(tile) =
                    signal.guard(self.read_distributed(&stale_key, version)).await?
                {
                    self.remember(key, &tile);
                    if options.revalidate {
                        self.schedule_revalidation(key, version);
                    }
                    return Ok(self.hit(key, tile, TileSource::DistributedStale));
                }
            }
            DistributedRead::Miss | DistributedRead::Unavailable => {}
        }

        if options.allow_stale {
            if let Some(tile) = signal.guard(self.read_snapshot(key, version)).await? {
                self.remember(key, &tile);
                if options.revalidate {
                    self.schedule_revalidation(key, version);
                }
                return Ok(self.hit(key, tile, TileSource::DiskSnapshot));
            }
        }

        let tile = self.generate(key, indices, signal, false).await?;
        Ok(tile.respond(TileSource::Generated))
    }

    fn hit(&self, key: TileKey, tile: CachedTile, source: TileSource) -> Option<TileResponse> {
        log::trace!("Tile {key} served from {source}");
        self.metrics.hit(source);
        tile.respond(source)
    }

    fn memory_get(&self, key: TileKey, version: DatasetVersion) -> Option<CachedTile> {
        self.memory
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
            .filter(|tile| tile.version == version)
            .cloned()
    }

    fn remember(&self, key: TileKey, tile: &CachedTile) {
        self.memory
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, tile.clone());
    }

    async fn read_distributed(&self, cache_key: &str, version: DatasetVersion) -> DistributedRead {
        let bytes = match self.distributed.get(cache_key).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return DistributedRead::Miss,
            Err(e) => {
                log::warn!("Distributed cache read of {cache_key} failed: {e}");
                return DistributedRead::Unavailable;
            }
        };

        match CacheEnvelope::decode(cache_key, &bytes) {
            Ok(envelope) if envelope.version == version.0 => {
                DistributedRead::Hit(CachedTile::from_envelope(envelope))
            }
            Ok(envelope) => {
                log::debug!(
                    "{cache_key} holds version {} instead of {version}",
                    envelope.version
                );
                DistributedRead::Miss
            }
            Err(e) => {
                self.metrics.corrupt();
                log::warn!("Purging corrupt distributed entry: {e}");
                if let Err(e) = self.distributed.delete(cache_key).await {
                    log::warn!("Failed to delete {cache_key}: {e}");
                }
                DistributedRead::Miss
            }
        }
    }

    async fn read_snapshot(&self, key: TileKey, version: DatasetVersion) -> Option<CachedTile> {
        let namespace = key.dataset.as_ref();
        let tag = Self::version_tag(version);
        let relative = tile_path(key.coord);

        let bytes = match self.snapshots.read(namespace, &tag, &relative).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return None,
            Err(CacheError::Corrupt { key, reason }) => {
                self.metrics.corrupt();
                log::warn!("Purged corrupt snapshot {key}: {reason}");
                return None;
            }
            Err(e) => {
                log::warn!("Snapshot read of {key} failed: {e}");
                return None;
            }
        };

        match CacheEnvelope::decode(&relative, &bytes) {
            Ok(envelope) if envelope.version == version.0 => {
                Some(CachedTile::from_envelope(envelope))
            }
            Ok(_) => None,
            Err(e) => {
                self.metrics.corrupt();
                log::warn!("Purging corrupt snapshot: {e}");
                if let Err(e) = self.snapshots.remove(namespace, &tag, &relative).await {
                    log::warn!("Failed to remove snapshot {key}: {e}");
                }
                None
            }
        }
    }

    fn schedule_revalidation(&self, key: TileKey, version: DatasetVersion) {
        match self.revalidation.schedule(RevalidationJob { key, version }) {
            ScheduleOutcome::Queued => self.metrics.revalidation_scheduled(),
            ScheduleOutcome::Full => {
                self.metrics.revalidation_skipped();
                log::debug!("Revalidation queue full, skipping {key}");
            }
            ScheduleOutcome::Duplicate => {}
            ScheduleOutcome::Closed => log::debug!("Not revalidating {key}: shutting down"),
        }
    }

    /// Renders `key` once per process for `indices.version`, sharing the
    /// result with every concurrent caller. `force` skips the memory
    /// re-check so background refreshes always rewrite the shared tiers.
    async fn generate(
        self: &Arc<Self>,
        key: TileKey,
        indices: Arc<DatasetIndices>,
        signal: &Signal,
        force: bool,
    ) -> Result<CachedTile, TileError> {
        let version = indices.version;
        loop {
            let render = {
                let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
                if !force {
                    if let Some(tile) = self.memory_get(key, version) {
                        self.metrics.hit(TileSource::Memory);
                        return Ok(tile);
                    }
                }
                if let Some(render) = in_flight.get(&(key, version)) {
                    self.metrics.coalesced();
                    render.clone()
                } else {
                    let render = self.spawn_render(key, Arc::clone(&indices), signal.clone());
                    in_flight.insert((key, version), render.clone());
                    render
                }
            };

            let result = tokio::select! {
                biased;
                e = signal.aborted() => return Err(e),
                result = render => result,
            };
            match result {
                // The render belonged to another caller whose signal fired.
                Err(e) if e.is_abort() && signal.check().is_ok() => {
                    log::debug!("Render of {key} aborted by its owner, retrying");
                }
                other => return other,
            }
        }
    }

    fn spawn_render(
        self: &Arc<Self>,
        key: TileKey,
        indices: Arc<DatasetIndices>,
        signal: Signal,
    ) -> RenderFuture {
        let guard = InFlightGuard {
            inner: Arc::clone(self),
            slot: (key, indices.version),
        };
        let handle = tokio::spawn(async move {
            let result = guard.inner.render_and_store(key, indices, &signal).await;
            drop(guard);
            result
        });
        handle
            .map(|joined| joined.unwrap_or_else(|e| Err(TileError::Generation(e.to_string()))))
            .boxed()
            .shared()
    }

    async fn render_and_store(
        &self,
        key: TileKey,
        indices: Arc<DatasetIndices>,
        signal: &Signal,
    ) -> Result<CachedTile, TileError> {
        signal.check()?;
        let permit = signal
            .guard(self.render_permits.acquire())
            .await?
            .map_err(|_| TileError::ShuttingDown)?;
        signal.check()?;

        self.metrics.render_started();
        let tile = match self.render(key, indices, signal).await {
            Ok(tile) => tile,
            Err(e) => {
                if !e.is_abort() {
                    self.metrics.render_failed();
                }
                return Err(e);
            }
        };
        if tile.payload.is_none() {
            self.metrics.empty_tile();
        }

        self.store(key, &tile).await;
        self.metrics.render_completed();
        drop(permit);
        Ok(tile)
    }

    /// Runs the CPU-bound part of a render on the blocking pool. The caller
    /// stops waiting as soon as its signal fires.
    async fn render(
        &self,
        key: TileKey,
        indices: Arc<DatasetIndices>,
        signal: &Signal,
    ) -> Result<CachedTile, TileError> {
        let extent = self.config.tiles.extent;
        let task_signal = signal.clone();
        let task = tokio::task::spawn_blocking(move || {
            render_tile(key, &indices, extent, &task_signal)
        });
        let tile = signal
            .guard(task)
            .await?
            .map_err(|e| TileError::Generation(format!("Render of {key} failed: {e}")))??;
        signal.check()?;
        Ok(tile)
    }

    /// Writes a rendered tile to every tier. Failures are logged only.
    async fn store(&self, key: TileKey, tile: &CachedTile) {
        self.remember(key, tile);

        let bytes = match tile.envelope().encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                log::warn!("Failed to encode cache envelope for {key}: {e}");
                return;
            }
        };

        let z = key.coord.z;
        let live_key = self.live_key(key, tile.version);
        if let Err(e) = self
            .distributed
            .set(&live_key, bytes.clone(), self.policy.live_ttl(z))
            .await
        {
            log::warn!("Failed to write {live_key}: {e}");
        }
        let stale_key = self.stale_key(key, tile.version);
        if let Err(e) = self
            .distributed
            .set(&stale_key, bytes.clone(), self.policy.stale_ttl(z))
            .await
        {
            log::warn!("Failed to write {stale_key}: {e}");
        }

        if let Err(e) = self
            .snapshots
            .write(
                key.dataset.as_ref(),
                &Self::version_tag(tile.version),
                &tile_path(key.coord),
                &bytes,
            )
            .await
        {
            log::warn!("Failed to write snapshot for {key}: {e}");
        }
    }

    async fn sweep_oversized(&self) -> Result<u64, CacheError> {
        let prefix = format!("{}:", self.config.cache.key_prefix);
        let max = self.config.cache.max_payload_bytes;
        let mut removed = 0u64;

        for key in self.distributed.scan_prefix(&prefix).await? {
            let Some(len) = self.distributed.value_len(&key).await? else {
                continue;
            };
            if len <= max {
                continue;
            }
            match self.distributed.delete(&key).await {
                Ok(()) => {
                    log::info!("Evicted oversized cache entry {key} ({len} bytes > {max})");
                    removed += 1;
                }
                Err(e) => log::warn!("Failed to evict {key}: {e}"),
            }
        }
        self.metrics.swept(removed);
        Ok(removed)
    }
}

#[async_trait]
impl Revalidate for Inner {
    async fn revalidate(self: Arc<Self>, job: RevalidationJob, signal: Signal) {
        let RevalidationJob { key, version } = job;
        let lock_key = self.lock_key(key, version);
        let lock_ttl = self.config.lock_ttl();

        match self
            .distributed
            .try_lock(&lock_key, &self.lock_owner, lock_ttl)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                log::debug!("Revalidation of {key} held by another process");
                self.metrics.revalidation_skipped();
                return;
            }
            Err(e) => {
                log::warn!("Skipping revalidation of {key}, lock unavailable: {e}");
                self.metrics.revalidation_skipped();
                return;
            }
        }

        let signal = signal.child_with_timeout(self.policy.timeout(key.coord.z));
        let result = async {
            let indices = signal
                .guard(self.loader(key.dataset).ensure_loaded())
                .await??;
            if indices.version != version {
                log::debug!(
                    "Dropping revalidation of {key}: {version} superseded by {}",
                    indices.version
                );
                return Ok::<(), TileError>(());
            }
            self.generate(key, indices, &signal, true).await.map(|_| ())
        }
        .await;

        match result {
            Ok(()) => self.metrics.revalidation_completed(),
            Err(e) if e.is_abort() => log::debug!("Revalidation of {key} aborted: {e}"),
            Err(e) => log::warn!("Revalidation of {key} failed: {e}"),
        }

        if let Err(e) = self.distributed.unlock(&lock_key, &self.lock_owner).await {
            log::warn!("Failed to release {lock_key}: {e}");
        }
    }
}

fn render_tile(
    key: TileKey,
    indices: &DatasetIndices,
    extent: u32,
    signal: &Signal,
) -> Result<CachedTile, TileError> {
    let features = indices.tile_features(key.coord);
    signal.check()?;

    if features.is_empty() {
        return Ok(CachedTile {
            version: indices.version,
            payload: None,
            etag: String::new(),
        });
    }

    let bytes = encode_tile(
        key.dataset.layer_name(),
        &features,
        &indices.records,
        &indices.labels,
        extent,
    )?;
    log::trace!(
        "Rendered {key}: {} feature(s), {} bytes",
        features.len(),
        bytes.len()
    );
    Ok(CachedTile {
        version: indices.version,
        etag: etag(&bytes),
        payload: Some(Arc::from(bytes)),
    })
}

/// Removes an in-flight entry when its render finishes or unwinds.
struct InFlightGuard {
    inner: Arc<Inner>,
    slot: (TileKey, DatasetVersion),
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.inner
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.slot);
    }
}

fn tile_path(coord: TileCoord) -> String {
    format!("{}/{}/{}", coord.z, coord.x, coord.y)
}

async fn run_sweeper(inner: Weak<Inner>, interval: Duration, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let Some(inner) = inner.upgrade() else {
            break;
        };
        if let Err(e) = inner.sweep_oversized().await {
            log::warn!("Cache sweep failed: {e}");
        }
    }
    log::debug!("Cache sweeper stopped");
}
