//! Feature sources consumed by the dataset loader.
//!
//! The primary source is a chunked feature store publishing a versioned
//! manifest. When it holds no chunks the loader falls back to a single raw
//! feature collection, then to an [`AnalyticalSource`] that queries
//! features live.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ticket_map_tiles_models::{
    Cents, Dataset, DatasetVersion, Feature, FeatureKind, MonthMask, YearMask, YearTotals,
};

use crate::error::LoadError;

/// Per-location yearly totals keyed by location name.
pub type LocationYearStats = HashMap<String, BTreeMap<i32, YearTotals>>;

/// Version and chunk list of a chunked dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkManifest {
    pub version: DatasetVersion,
    pub chunks: Vec<String>,
}

/// A dataset delivered as one collection instead of chunks.
#[derive(Debug, Clone, PartialEq)]
pub struct RawFeatureCollection {
    pub version: DatasetVersion,
    pub features: Vec<Feature>,
}

/// Chunked feature storage produced by the ingestion pipeline.
#[async_trait]
pub trait FeatureStore: Send + Sync {
    /// The dataset's chunk manifest, or `None` if no chunks are published.
    async fn manifest(&self, dataset: Dataset) -> Result<Option<ChunkManifest>, LoadError>;

    async fn read_chunk(&self, dataset: Dataset, chunk: &str) -> Result<Vec<Feature>, LoadError>;

    /// The single raw collection used when no chunks exist.
    async fn raw_features(
        &self,
        dataset: Dataset,
    ) -> Result<Option<RawFeatureCollection>, LoadError>;

    /// Per-location yearly totals. Empty when not published.
    async fn location_year_totals(&self, dataset: Dataset)
    -> Result<LocationYearStats, LoadError>;

    /// Cheap check of the latest published version, used to decide
    /// whether a rebuild is needed.
    async fn current_version(&self, dataset: Dataset) -> Result<DatasetVersion, LoadError> {
        Ok(self
            .manifest(dataset)
            .await?
            .map_or(DatasetVersion::EMPTY, |manifest| manifest.version))
    }
}

/// Live analytical query fallback used when the store is empty.
#[async_trait]
pub trait AnalyticalSource: Send + Sync {
    async fn query_features(&self, dataset: Dataset) -> Result<Vec<Feature>, LoadError>;

    /// Cheap check of the version of the data behind
    /// [`AnalyticalSource::query_features`]. Must change whenever the
    /// queried features do.
    async fn current_version(&self, dataset: Dataset) -> Result<DatasetVersion, LoadError>;
}

#[derive(Default)]
struct MemoryDataset {
    version: DatasetVersion,
    chunks: Vec<(String, Vec<Feature>)>,
    raw: Option<RawFeatureCollection>,
    year_totals: LocationYearStats,
}

/// In-process [`FeatureStore`] for tests and embedding.
#[derive(Default)]
pub struct MemoryFeatureStore {
    datasets: Mutex<HashMap<Dataset, MemoryDataset>>,
    manifest_reads: AtomicU64,
    chunk_reads: AtomicU64,
}

impl MemoryFeatureStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes `features` as a single chunk at `version`, replacing
    /// whatever was published before.
    pub fn publish(&self, dataset: Dataset, version: DatasetVersion, features: Vec<Feature>) {
        self.publish_chunks(dataset, version, vec![features]);
    }

    pub fn publish_chunks(
        &self,
        dataset: Dataset,
        version: DatasetVersion,
        chunks: Vec<Vec<Feature>>,
    ) {
        let mut datasets = self.datasets.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = datasets.entry(dataset).or_default();
        entry.version = version;
        entry.chunks = chunks
            .into_iter()
            .enumerate()
            .map(|(i, features)| (format!("chunk-{i:04}.json"), features))
            .collect();
    }

    /// Publishes a raw collection (used only when no chunks exist).
    pub fn publish_raw(&self, dataset: Dataset, version: DatasetVersion, features: Vec<Feature>) {
        let mut datasets = self.datasets.lock().unwrap_or_else(PoisonError::into_inner);
        datasets.entry(dataset).or_default().raw = Some(RawFeatureCollection { version, features });
    }

    pub fn publish_year_totals(&self, dataset: Dataset, totals: LocationYearStats) {
        let mut datasets = self.datasets.lock().unwrap_or_else(PoisonError::into_inner);
        datasets.entry(dataset).or_default().year_totals = totals;
    }

    /// Number of manifest reads so far.
    #[must_use]
    pub fn manifest_reads(&self) -> u64 {
        self.manifest_reads.load(Ordering::SeqCst)
    }

    /// Number of chunk reads so far.
    #[must_use]
    pub fn chunk_reads(&self) -> u64 {
        self.chunk_reads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FeatureStore for MemoryFeatureStore {
    async fn manifest(&self, dataset: Dataset) -> Result<Option<ChunkManifest>, LoadError> {
        self.manifest_reads.fetch_add(1, Ordering::SeqCst);
        let datasets = self.datasets.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(datasets
            .get(&dataset)
            .filter(|d| !d.chunks.is_empty())
            .map(|d| ChunkManifest {
                version: d.version,
                chunks: d.chunks.iter().map(|(name, _)| name.clone()).collect(),
            }))
    }

    async fn read_chunk(&self, dataset: Dataset, chunk: &str) -> Result<Vec<Feature>, LoadError> {
        self.chunk_reads.fetch_add(1, Ordering::SeqCst);
        let datasets = self.datasets.lock().unwrap_or_else(PoisonError::into_inner);
        datasets
            .get(&dataset)
            .and_then(|d| d.chunks.iter().find(|(name, _)| name == chunk))
            .map(|(_, features)| features.clone())
            .ok_or_else(|| LoadError::Store(format!("{dataset}: unknown chunk {chunk}")))
    }

    async fn raw_features(
        &self,
        dataset: Dataset,
    ) -> Result<Option<RawFeatureCollection>, LoadError> {
        let datasets = self.datasets.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(datasets.get(&dataset).and_then(|d| d.raw.clone()))
    }

    async fn location_year_totals(
        &self,
        dataset: Dataset,
    ) -> Result<LocationYearStats, LoadError> {
        let datasets = self.datasets.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(datasets
            .get(&dataset)
            .map(|d| d.year_totals.clone())
            .unwrap_or_default())
    }

    async fn current_version(&self, dataset: Dataset) -> Result<DatasetVersion, LoadError> {
        self.manifest_reads.fetch_add(1, Ordering::SeqCst);
        let datasets = self.datasets.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(datasets.get(&dataset).map_or(DatasetVersion::EMPTY, |d| {
            if d.chunks.is_empty() {
                d.raw.as_ref().map_or(DatasetVersion::EMPTY, |raw| raw.version)
            } else {
                d.version
            }
        }))
    }
}

/// [`FeatureStore`] backed by a directory tree:
///
/// ```text
/// <root>/<dataset>/manifest.json      { "version": 3, "chunks": ["a.json"] }
/// <root>/<dataset>/<chunk>            JSON array of features
/// <root>/<dataset>/features.geojson   raw FeatureCollection fallback
/// <root>/<dataset>/year_totals.json   { "<location>": { "2019": {...} } }
/// ```
#[derive(Debug, Clone)]
pub struct DirectoryFeatureStore {
    root: PathBuf,
}

const MANIFEST_FILE: &str = "manifest.json";
const RAW_FILE: &str = "features.geojson";
const YEAR_TOTALS_FILE: &str = "year_totals.json";

impl DirectoryFeatureStore {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn dataset_dir(&self, dataset: Dataset) -> PathBuf {
        self.root.join(dataset.as_ref())
    }

    async fn read_optional(path: &Path) -> Result<Option<Vec<u8>>, LoadError> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(LoadError::io(path, e)),
        }
    }

}

/// Version derived from the modification time of `path`, or `None` if it
/// does not exist.
async fn modified_version(path: &Path) -> Result<Option<DatasetVersion>, LoadError> {
    match tokio::fs::metadata(path).await {
        Ok(metadata) => {
            let modified = metadata.modified().map_err(|e| LoadError::io(path, e))?;
            Ok(Some(DatasetVersion::from_timestamp(DateTime::<Utc>::from(
                modified,
            ))))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(LoadError::io(path, e)),
    }
}

fn parse_json<T: serde::de::DeserializeOwned>(path: &Path, bytes: &[u8]) -> Result<T, LoadError> {
    serde_json::from_slice(bytes).map_err(|e| LoadError::Json {
        path: path.display().to_string(),
        message: e.to_string(),
    })
}

#[async_trait]
impl FeatureStore for DirectoryFeatureStore {
    async fn manifest(&self, dataset: Dataset) -> Result<Option<ChunkManifest>, LoadError> {
        let path = self.dataset_dir(dataset).join(MANIFEST_FILE);
        let Some(bytes) = Self::read_optional(&path).await? else {
            return Ok(None);
        };
        let manifest: ChunkManifest = parse_json(&path, &bytes)?;
        Ok(Some(manifest).filter(|m| !m.chunks.is_empty()))
    }

    async fn read_chunk(&self, dataset: Dataset, chunk: &str) -> Result<Vec<Feature>, LoadError> {
        if chunk.contains("..") || Path::new(chunk).is_absolute() {
            return Err(LoadError::Store(format!("{dataset}: invalid chunk name {chunk}")));
        }
        let path = self.dataset_dir(dataset).join(chunk);
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|e| LoadError::io(&path, e))?;
        parse_json(&path, &bytes)
    }

    async fn raw_features(
        &self,
        dataset: Dataset,
    ) -> Result<Option<RawFeatureCollection>, LoadError> {
        let path = self.dataset_dir(dataset).join(RAW_FILE);
        let Some(version) = modified_version(&path).await? else {
            return Ok(None);
        };
        let Some(bytes) = Self::read_optional(&path).await? else {
            return Ok(None);
        };
        let text = String::from_utf8(bytes).map_err(|e| LoadError::GeoJson {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        let features = parse_feature_collection(&text).map_err(|message| LoadError::GeoJson {
            path: path.display().to_string(),
            message,
        })?;
        Ok(Some(RawFeatureCollection { version, features }))
    }

    async fn location_year_totals(
        &self,
        dataset: Dataset,
    ) -> Result<LocationYearStats, LoadError> {
        let path = self.dataset_dir(dataset).join(YEAR_TOTALS_FILE);
        match Self::read_optional(&path).await? {
            Some(bytes) => parse_json(&path, &bytes),
            None => Ok(LocationYearStats::new()),
        }
    }

    async fn current_version(&self, dataset: Dataset) -> Result<DatasetVersion, LoadError> {
        if let Some(manifest) = self.manifest(dataset).await? {
            return Ok(manifest.version);
        }
        let raw = self.dataset_dir(dataset).join(RAW_FILE);
        Ok(modified_version(&raw)
            .await?
            .unwrap_or(DatasetVersion::EMPTY))
    }
}

/// Properties of a raw `GeoJSON` point feature.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawProperties {
    id: u64,
    #[serde(default)]
    ticket_count: u64,
    #[serde(default)]
    total_revenue: Cents,
    #[serde(default)]
    top_infraction: Option<String>,
    #[serde(default)]
    year_mask: YearMask,
    #[serde(default)]
    month_mask: MonthMask,
    kind: FeatureKind,
}

/// Parses a `GeoJSON` `FeatureCollection` of point features.
///
/// Features without point geometry are skipped with a debug log; features
/// whose properties do not match the expected shape fail the whole parse.
fn parse_feature_collection(text: &str) -> Result<Vec<Feature>, String> {
    let geojson: geojson::GeoJson = text.parse().map_err(|e: geojson::Error| e.to_string())?;
    let geojson::GeoJson::FeatureCollection(collection) = geojson else {
        return Err("expected a FeatureCollection".to_string());
    };

    let mut features = Vec::with_capacity(collection.features.len());
    for (i, feature) in collection.features.into_iter().enumerate() {
        let position = match feature.geometry.map(|g| g.value) {
            Some(geojson::Value::Point(position)) if position.len() >= 2 => position,
            _ => {
                log::debug!("Skipping feature {i}: not a point");
                continue;
            }
        };
        let properties = serde_json::Value::Object(feature.properties.unwrap_or_default());
        let props: RawProperties = serde_json::from_value(properties)
            .map_err(|e| format!("feature {i}: {e}"))?;
        features.push(Feature {
            id: props.id,
            longitude: position[0],
            latitude: position[1],
            ticket_count: props.ticket_count,
            total_revenue: props.total_revenue,
            top_infraction: props.top_infraction,
            year_mask: props.year_mask,
            month_mask: props.month_mask,
            kind: props.kind,
        });
    }
    Ok(features)
}

#[cfg(feature = "duckdb")]
pub use duck::DuckDbAnalyticalSource;

#[cfg(feature = "duckdb")]
mod duck {
    use std::path::PathBuf;

    use async_trait::async_trait;
    use ticket_map_tiles_models::{
        CameraType, Cents, Dataset, DatasetVersion, Feature, FeatureKind, MonthMask, YearMask,
    };

    use super::{AnalyticalSource, modified_version};
    use crate::error::LoadError;

    /// Queries point features from a `DuckDB` analytics database with one
    /// table per dataset, named after the dataset.
    #[derive(Debug, Clone)]
    pub struct DuckDbAnalyticalSource {
        path: PathBuf,
    }

    impl DuckDbAnalyticalSource {
        #[must_use]
        pub fn new(path: impl Into<PathBuf>) -> Self {
            Self { path: path.into() }
        }
    }

    fn query_sync(path: &std::path::Path, dataset: Dataset) -> Result<Vec<Feature>, duckdb::Error> {
        let conn = duckdb::Connection::open(path)?;
        let sql = format!(
            "SELECT id, longitude, latitude, ticket_count, total_revenue, top_infraction, \
             year_mask, month_mask, location, street, ward FROM {dataset} \
             WHERE longitude IS NOT NULL AND latitude IS NOT NULL"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], |row| {
            let location: String = row.get(8)?;
            let street: Option<String> = row.get(9)?;
            let ward: Option<u32> = row.get(10)?;
            let kind = match dataset {
                Dataset::ParkingTickets => FeatureKind::Parking { location, street },
                Dataset::RedLightCameras => FeatureKind::Camera {
                    intersection: location,
                    camera_type: CameraType::RedLight,
                    ward,
                },
                Dataset::SpeedCameras => FeatureKind::Camera {
                    intersection: location,
                    camera_type: CameraType::Speed,
                    ward,
                },
            };
            let revenue: f64 = row.get(4)?;
            Ok(Feature {
                id: row.get(0)?,
                longitude: row.get(1)?,
                latitude: row.get(2)?,
                ticket_count: row.get(3)?,
                total_revenue: Cents::from_dollars(revenue),
                top_infraction: row.get(5)?,
                year_mask: YearMask::from_bits(row.get(6)?),
                month_mask: MonthMask::from_bits(row.get(7)?),
                kind,
            })
        })?;
        rows.collect()
    }

    #[async_trait]
    impl AnalyticalSource for DuckDbAnalyticalSource {
        async fn query_features(&self, dataset: Dataset) -> Result<Vec<Feature>, LoadError> {
            let path = self.path.clone();
            tokio::task::spawn_blocking(move || query_sync(&path, dataset))
                .await
                .map_err(|e| LoadError::Analytical(e.to_string()))?
                .map_err(|e| LoadError::Analytical(e.to_string()))
        }

        /// Tracks the database file, so any write to it counts as a new
        /// version of every dataset it holds.
        async fn current_version(&self, dataset: Dataset) -> Result<DatasetVersion, LoadError> {
            modified_version(&self.path).await?.ok_or_else(|| {
                LoadError::Analytical(format!(
                    "{dataset}: database {} does not exist",
                    self.path.display()
                ))
            })
        }
    }
}
