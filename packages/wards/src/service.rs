//! Ward tile service.
//!
//! Each [`WardDataset`] gets its own [`WardTileIndex`], built on the first
//! request and rebuilt whenever the rollup publishes a new version. Tiles
//! are answered from process memory, then the distributed cache, then
//! generated from the index. Building an index hydrates the caches for the
//! new version: distributed entries and disk snapshots written for an
//! older rollup of the same dataset are discarded, other datasets are left
//! alone.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use futures::FutureExt as _;
use futures::future::{BoxFuture, Shared};
use serde::{Deserialize, Serialize};
use ticket_map_cache::{
    CacheEnvelope, CacheError, DiskSnapshotStore, DistributedCache, SizedCache,
};
use ticket_map_tiles_models::{DatasetVersion, TileCoord};
use ticket_map_wards_models::{WardDataset, WardPolygon, WardTile};
use tokio::sync::OnceCell;

use crate::config::WardServiceConfig;
use crate::error::WardError;
use crate::index::WardTileIndex;
use crate::source::{WardSource, parse_ward_collection};

const SNAPSHOT_FILE: &str = "tiles";

type TileCacheKey = (WardDataset, TileCoord);
type IndexFuture = Shared<BoxFuture<'static, Result<Arc<WardTileIndex>, WardError>>>;

#[derive(Debug, Clone)]
struct CachedWardTile {
    version: DatasetVersion,
    /// `None` for a tile no ward reaches.
    payload: Option<Arc<[u8]>>,
}

impl CachedWardTile {
    fn respond(self) -> Option<WardTile> {
        Some(WardTile {
            buffer: self.payload?,
            version: self.version,
        })
    }
}

fn estimate_ward_tile_size(_key: &TileCacheKey, tile: &CachedWardTile) -> usize {
    std::mem::size_of::<TileCacheKey>()
        + std::mem::size_of::<CachedWardTile>()
        + tile.payload.as_ref().map_or(0, |p| p.len())
}

/// On-disk snapshot of every ward tile generated for one rollup version.
#[derive(Serialize, Deserialize)]
struct WardSnapshot {
    version: DatasetVersion,
    tiles: Vec<SnapshotTile>,
}

#[derive(Serialize, Deserialize)]
struct SnapshotTile {
    coord: TileCoord,
    payload: Option<Vec<u8>>,
}

struct IndexState {
    index: Arc<WardTileIndex>,
    checked_at: Instant,
}

/// Serves ward tiles for every [`WardDataset`].
pub struct WardTileService {
    inner: Arc<Inner>,
}

struct Inner {
    config: Arc<WardServiceConfig>,
    source: Arc<dyn WardSource>,
    distributed: Arc<dyn DistributedCache>,
    snapshots: DiskSnapshotStore,
    wards: OnceCell<Arc<Vec<WardPolygon>>>,
    indices: Mutex<HashMap<WardDataset, IndexState>>,
    building: Mutex<HashMap<WardDataset, IndexFuture>>,
    memory: Mutex<SizedCache<TileCacheKey, CachedWardTile>>,
    builds: AtomicU64,
    generated: AtomicU64,
    hydrated: AtomicU64,
}

impl WardTileService {
    #[must_use]
    pub fn new(
        config: WardServiceConfig,
        source: Arc<dyn WardSource>,
        distributed: Arc<dyn DistributedCache>,
    ) -> Self {
        let snapshots =
            DiskSnapshotStore::new(config.cache.snapshot_dir.clone(), config.snapshot_max_age());
        let memory = SizedCache::new(config.cache.memory_bytes, estimate_ward_tile_size);
        Self {
            inner: Arc::new(Inner {
                config: Arc::new(config),
                source,
                distributed,
                snapshots,
                wards: OnceCell::new(),
                indices: Mutex::new(HashMap::new()),
                building: Mutex::new(HashMap::new()),
                memory: Mutex::new(memory),
                builds: AtomicU64::new(0),
                generated: AtomicU64::new(0),
                hydrated: AtomicU64::new(0),
            }),
        }
    }

    #[must_use]
    pub fn config(&self) -> &WardServiceConfig {
        &self.inner.config
    }

    /// Rollup version of the index currently serving `dataset`, if built.
    #[must_use]
    pub fn version(&self, dataset: WardDataset) -> Option<DatasetVersion> {
        self.inner
            .indices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&dataset)
            .map(|state| state.index.version())
    }

    /// Number of index builds so far.
    #[must_use]
    pub fn builds(&self) -> u64 {
        self.inner.builds.load(Ordering::Relaxed)
    }

    /// Number of tiles cut from an index (cache misses).
    #[must_use]
    pub fn tiles_generated(&self) -> u64 {
        self.inner.generated.load(Ordering::Relaxed)
    }

    /// Number of tiles loaded from disk snapshots.
    #[must_use]
    pub fn tiles_hydrated(&self) -> u64 {
        self.inner.hydrated.load(Ordering::Relaxed)
    }

    /// Returns the ward tile at `z/x/y`, or `None` when no ward reaches it
    /// or the zoom is outside the configured range.
    ///
    /// # Errors
    ///
    /// Returns an error if the ward geometry or the rollup cannot be read
    /// and no index has been built for `dataset` yet, or if encoding fails.
    pub async fn get_ward_tile(
        &self,
        dataset: WardDataset,
        z: u8,
        x: u32,
        y: u32,
    ) -> Result<Option<WardTile>, WardError> {
        let coord = TileCoord::new(z, x, y);
        let tiles = &self.inner.config.tiles;
        if !coord.is_valid() || !(tiles.min_zoom..=tiles.max_zoom).contains(&z) {
            return Ok(None);
        }

        let index = self.inner.index(dataset).await?;
        self.inner.tile(&index, coord).await
    }

    /// Writes every ward tile held in memory to a disk snapshot of its
    /// dataset's current version. Returns the number of tiles written.
    ///
    /// # Errors
    ///
    /// Returns [`WardError::Cache`] if a snapshot cannot be encoded or
    /// written.
    pub async fn flush_snapshots(&self) -> Result<usize, WardError> {
        let versions: Vec<(WardDataset, DatasetVersion)> = self
            .inner
            .indices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(&dataset, state)| (dataset, state.index.version()))
            .collect();

        let mut written = 0;
        for (dataset, version) in versions {
            let tiles: Vec<SnapshotTile> = self
                .inner
                .memory
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .iter()
                .filter(|((d, _), tile)| *d == dataset && tile.version == version)
                .map(|(&(_, coord), tile)| SnapshotTile {
                    coord,
                    payload: tile.payload.as_deref().map(<[u8]>::to_vec),
                })
                .collect();
            if tiles.is_empty() {
                continue;
            }

            let count = tiles.len();
            let bytes = rmp_serde::to_vec(&WardSnapshot { version, tiles })
                .map_err(|e| CacheError::Encode(e.to_string()))?;
            self.inner
                .snapshots
                .write(dataset.as_ref(), &version_tag(version), SNAPSHOT_FILE, &bytes)
                .await?;
            log::info!("Wrote {count} {dataset} ward tile(s) to snapshot {version}");
            written += count;
        }
        Ok(written)
    }
}

fn version_tag(version: DatasetVersion) -> String {
    format!("v{}", version.0)
}

impl Inner {
    fn tile_key(&self, dataset: WardDataset, version: DatasetVersion, coord: TileCoord) -> String {
        format!(
            "{}:{dataset}:{}:{}:{}:{}",
            self.config.cache.key_prefix,
            version_tag(version),
            coord.z,
            coord.x,
            coord.y
        )
    }

    fn dataset_prefix(&self, dataset: WardDataset) -> String {
        format!("{}:{dataset}:", self.config.cache.key_prefix)
    }

    fn version_key(&self, dataset: WardDataset) -> String {
        format!("{}version", self.dataset_prefix(dataset))
    }

    /// The index for `dataset`, building or refreshing it when it is
    /// missing or its rollup version has not been checked recently.
    /// Concurrent callers share one build.
    async fn index(
        self: &Arc<Self>,
        dataset: WardDataset,
    ) -> Result<Arc<WardTileIndex>, WardError> {
        {
            let indices = self.indices.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(state) = indices.get(&dataset) {
                if state.checked_at.elapsed() < self.config.rollup_check_interval() {
                    return Ok(Arc::clone(&state.index));
                }
            }
        }

        let future = {
            let mut building = self.building.lock().unwrap_or_else(PoisonError::into_inner);
            building
                .entry(dataset)
                .or_insert_with(|| {
                    let inner = Arc::clone(self);
                    async move {
                        let result = inner.refresh(dataset).await;
                        inner
                            .building
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .remove(&dataset);
                        result
                    }
                    .boxed()
                    .shared()
                })
                .clone()
        };
        future.await
    }

    async fn refresh(
        self: &Arc<Self>,
        dataset: WardDataset,
    ) -> Result<Arc<WardTileIndex>, WardError> {
        let current = {
            let indices = self.indices.lock().unwrap_or_else(PoisonError::into_inner);
            match indices.get(&dataset) {
                // Refreshed by a build that finished while this one queued.
                Some(state) if state.checked_at.elapsed() < self.config.rollup_check_interval() => {
                    return Ok(Arc::clone(&state.index));
                }
                Some(state) => Some(Arc::clone(&state.index)),
                None => None,
            }
        };

        match self.build(dataset, current.as_ref()).await {
            Ok(index) => {
                self.indices
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(
                        dataset,
                        IndexState {
                            index: Arc::clone(&index),
                            checked_at: Instant::now(),
                        },
                    );
                Ok(index)
            }
            Err(e) => {
                let Some(current) = current else {
                    return Err(e);
                };
                log::warn!(
                    "Ward rollup refresh for {dataset} failed, keeping {}: {e}",
                    current.version()
                );
                if let Some(state) = self
                    .indices
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .get_mut(&dataset)
                {
                    state.checked_at = Instant::now();
                }
                Ok(current)
            }
        }
    }

    /// Returns `current` when the rollup version is unchanged, otherwise
    /// builds a new index and hydrates the cache tiers for it.
    async fn build(
        self: &Arc<Self>,
        dataset: WardDataset,
        current: Option<&Arc<WardTileIndex>>,
    ) -> Result<Arc<WardTileIndex>, WardError> {
        let rollup = self.source.rollup(dataset).await?;
        if let Some(current) = current {
            if current.version() == rollup.version {
                return Ok(Arc::clone(current));
            }
        }

        let wards = self.ward_polygons().await?;
        let config = self.config.tiles.clone();
        let version = rollup.version;
        let index = tokio::task::spawn_blocking(move || {
            WardTileIndex::build(dataset, &wards, &rollup, &config)
        })
        .await
        .map_err(|e| WardError::Build(e.to_string()))?;
        let index = Arc::new(index);

        self.builds.fetch_add(1, Ordering::Relaxed);
        match current {
            Some(previous) => log::info!(
                "Rebuilt {dataset} ward index {} -> {version} ({} wards)",
                previous.version(),
                index.len()
            ),
            None => log::info!("Built {dataset} ward index {version} ({} wards)", index.len()),
        }

        self.hydrate(&index).await;
        Ok(index)
    }

    async fn ward_polygons(&self) -> Result<Arc<Vec<WardPolygon>>, WardError> {
        self.wards
            .get_or_try_init(|| async {
                let text = self.source.ward_geojson().await?;
                let wards = parse_ward_collection(&text)?;
                log::info!("Loaded {} ward boundaries", wards.len());
                Ok::<_, WardError>(Arc::new(wards))
            })
            .await
            .cloned()
    }

    /// Aligns every cache tier with the version of `index`.
    async fn hydrate(&self, index: &WardTileIndex) {
        let dataset = index.dataset();
        let version = index.version();

        {
            let mut memory = self.memory.lock().unwrap_or_else(PoisonError::into_inner);
            memory.retain(|(d, _), tile| *d != dataset || tile.version == version);
        }

        self.hydrate_distributed(dataset, version).await;
        self.hydrate_snapshot(dataset, version).await;
    }

    /// Purges distributed entries of `dataset` written for an older rollup
    /// and records `version` as current. Entries written by a process that
    /// already saw a newer rollup are left alone.
    async fn hydrate_distributed(&self, dataset: WardDataset, version: DatasetVersion) {
        let version_key = self.version_key(dataset);
        let stored = match self.distributed.get(&version_key).await {
            Ok(bytes) => bytes.and_then(|bytes| {
                String::from_utf8(bytes)
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .map(DatasetVersion)
            }),
            Err(e) => {
                log::warn!("Could not read {version_key}: {e}");
                return;
            }
        };

        match stored {
            Some(stored) if stored == version => return,
            Some(stored) if stored > version => {
                log::debug!("{dataset} ward cache already at {stored}, leaving it");
                return;
            }
            Some(stored) => match self.purge_distributed(dataset).await {
                Ok(purged) => {
                    log::info!(
                        "{dataset} ward rollup {stored} -> {version}, purged {purged} entries"
                    );
                }
                Err(e) => log::warn!("Failed to purge {dataset} ward tiles: {e}"),
            },
            None => {}
        }

        if let Err(e) = self
            .distributed
            .set(
                &version_key,
                version.0.to_string().into_bytes(),
                self.config.ttl(),
            )
            .await
        {
            log::warn!("Could not record {dataset} ward version: {e}");
        }
    }

    async fn purge_distributed(&self, dataset: WardDataset) -> Result<usize, CacheError> {
        let keys = self
            .distributed
            .scan_prefix(&self.dataset_prefix(dataset))
            .await?;
        for key in &keys {
            self.distributed.delete(key).await?;
        }
        Ok(keys.len())
    }

    /// Drops snapshots of other versions of `dataset` and loads the one for
    /// `version`, if any, into memory.
    async fn hydrate_snapshot(&self, dataset: WardDataset, version: DatasetVersion) {
        let namespace = dataset.as_ref();
        let tag = version_tag(version);
        if let Err(e) = self.snapshots.prune_versions(namespace, &tag).await {
            log::warn!("Failed to prune {dataset} ward snapshots: {e}");
        }

        let bytes = match self.snapshots.read(namespace, &tag, SNAPSHOT_FILE).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return,
            Err(e) => {
                log::warn!("Ward snapshot for {dataset} unreadable: {e}");
                return;
            }
        };

        let snapshot = match rmp_serde::from_slice::<WardSnapshot>(&bytes) {
            Ok(snapshot) if snapshot.version == version => snapshot,
            Ok(snapshot) => {
                log::info!(
                    "Discarding {dataset} ward snapshot {} (current {version})",
                    snapshot.version
                );
                self.remove_snapshot(dataset, &tag).await;
                return;
            }
            Err(e) => {
                log::warn!("Purging corrupt {dataset} ward snapshot: {e}");
                self.remove_snapshot(dataset, &tag).await;
                return;
            }
        };

        let count = snapshot.tiles.len() as u64;
        {
            let mut memory = self.memory.lock().unwrap_or_else(PoisonError::into_inner);
            for tile in snapshot.tiles {
                memory.insert(
                    (dataset, tile.coord),
                    CachedWardTile {
                        version,
                        payload: tile.payload.map(Arc::from),
                    },
                );
            }
        }
        self.hydrated.fetch_add(count, Ordering::Relaxed);
        log::info!("Hydrated {count} {dataset} ward tile(s) from snapshot {version}");
    }

    async fn remove_snapshot(&self, dataset: WardDataset, tag: &str) {
        if let Err(e) = self
            .snapshots
            .remove(dataset.as_ref(), tag, SNAPSHOT_FILE)
            .await
        {
            log::warn!("Failed to remove {dataset} ward snapshot: {e}");
        }
    }

    async fn tile(
        &self,
        index: &Arc<WardTileIndex>,
        coord: TileCoord,
    ) -> Result<Option<WardTile>, WardError> {
        let dataset = index.dataset();
        let version = index.version();

        let cached = self
            .memory
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(dataset, coord))
            .filter(|tile| tile.version == version)
            .cloned();
        if let Some(tile) = cached {
            log::trace!("Ward tile {dataset}/{coord} served from memory");
            return Ok(tile.respond());
        }

        let key = self.tile_key(dataset, version, coord);
        if let Some(tile) = self.read_distributed(&key, version).await {
            log::trace!("Ward tile {dataset}/{coord} served from distributed cache");
            self.remember(dataset, coord, &tile);
            return Ok(tile.respond());
        }

        let tile = CachedWardTile {
            version,
            payload: index.get_tile(coord)?.map(Arc::from),
        };
        self.generated.fetch_add(1, Ordering::Relaxed);
        self.remember(dataset, coord, &tile);

        let envelope = CacheEnvelope::new(
            version.0,
            String::new(),
            tile.payload.as_deref().map(<[u8]>::to_vec).unwrap_or_default(),
        );
        match envelope.encode() {
            Ok(bytes) => {
                if let Err(e) = self.distributed.set(&key, bytes, self.config.ttl()).await {
                    log::warn!("Failed to cache ward tile {key}: {e}");
                }
            }
            Err(e) => log::warn!("Failed to encode ward tile {key}: {e}"),
        }

        Ok(tile.respond())
    }

    fn remember(&self, dataset: WardDataset, coord: TileCoord, tile: &CachedWardTile) {
        self.memory
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((dataset, coord), tile.clone());
    }

    async fn read_distributed(&self, key: &str, version: DatasetVersion) -> Option<CachedWardTile> {
        let bytes = match self.distributed.get(key).await {
            Ok(bytes) => bytes?,
            Err(e) => {
                log::warn!("Distributed cache read of {key} failed: {e}");
                return None;
            }
        };
        match CacheEnvelope::decode(key, &bytes) {
            Ok(envelope) if envelope.version == version.0 => Some(CachedWardTile {
                version,
                payload: (!envelope.payload.is_empty()).then(|| Arc::from(envelope.payload)),
            }),
            Ok(_) => None,
            Err(e) => {
                log::warn!("Purging corrupt ward tile: {e}");
                if let Err(e) = self.distributed.delete(key).await {
                    log::warn!("Failed to delete {key}: {e}");
                }
                None
            }
        }
    }
}
