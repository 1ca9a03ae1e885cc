//! Ward geometry collaborator: raw ward boundaries plus per-ward rollups.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use geo::MultiPolygon;
use geojson::GeoJson;
use ticket_map_wards_models::{WardDataset, WardPolygon, WardRollup};

use crate::error::WardError;

/// Supplies ward boundaries and the aggregates merged into ward tiles.
#[async_trait]
pub trait WardSource: Send + Sync {
    /// Ward boundaries as a `GeoJSON` `FeatureCollection`.
    async fn ward_geojson(&self) -> Result<String, WardError>;

    /// Latest rollup for `dataset`. A dataset with no rollup yet returns
    /// an empty rollup at [`ticket_map_tiles_models::DatasetVersion::EMPTY`].
    async fn rollup(&self, dataset: WardDataset) -> Result<WardRollup, WardError>;
}

/// In-process [`WardSource`] for tests and embedding.
#[derive(Default)]
pub struct StaticWardSource {
    geojson: Mutex<String>,
    rollups: Mutex<HashMap<WardDataset, WardRollup>>,
    geometry_reads: AtomicU64,
    rollup_reads: AtomicU64,
}

impl StaticWardSource {
    #[must_use]
    pub fn new(geojson: impl Into<String>) -> Self {
        Self {
            geojson: Mutex::new(geojson.into()),
            ..Self::default()
        }
    }

    pub fn set_geojson(&self, geojson: impl Into<String>) {
        *self.geojson.lock().unwrap_or_else(PoisonError::into_inner) = geojson.into();
    }

    /// Publishes a new rollup for `dataset`, replacing the previous one.
    pub fn set_rollup(&self, dataset: WardDataset, rollup: WardRollup) {
        self.rollups
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(dataset, rollup);
    }

    #[must_use]
    pub fn geometry_reads(&self) -> u64 {
        self.geometry_reads.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn rollup_reads(&self) -> u64 {
        self.rollup_reads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WardSource for StaticWardSource {
    async fn ward_geojson(&self) -> Result<String, WardError> {
        self.geometry_reads.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .geojson
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    async fn rollup(&self, dataset: WardDataset) -> Result<WardRollup, WardError> {
        self.rollup_reads.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .rollups
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&dataset)
            .cloned()
            .unwrap_or_default())
    }
}

/// Reads ward data from a directory:
///
/// ```text
/// <root>/wards.geojson                 ward boundary FeatureCollection
/// <root>/rollups/<dataset>.json        { "version": 3, "wards": { "1": {...} } }
/// ```
#[derive(Debug, Clone)]
pub struct DirectoryWardSource {
    root: PathBuf,
}

const WARDS_FILE: &str = "wards.geojson";
const ROLLUP_DIR: &str = "rollups";

impl DirectoryWardSource {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn rollup_path(&self, dataset: WardDataset) -> PathBuf {
        self.root
            .join(ROLLUP_DIR)
            .join(format!("{}.json", dataset.as_ref()))
    }
}

#[async_trait]
impl WardSource for DirectoryWardSource {
    async fn ward_geojson(&self) -> Result<String, WardError> {
        let path = self.root.join(WARDS_FILE);
        tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| WardError::io(&path, e))
    }

    async fn rollup(&self, dataset: WardDataset) -> Result<WardRollup, WardError> {
        let path = self.rollup_path(dataset);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(WardRollup::default());
            }
            Err(e) => return Err(WardError::io(&path, e)),
        };
        parse_rollup(&path, &bytes)
    }
}

fn parse_rollup(path: &Path, bytes: &[u8]) -> Result<WardRollup, WardError> {
    serde_json::from_slice(bytes).map_err(|e| WardError::Rollup {
        path: path.display().to_string(),
        message: e.to_string(),
    })
}

/// Parses a ward boundary `FeatureCollection`.
///
/// The ward code is read from the `code`, `ward` or `id` property (string
/// or number), the name from `name`. Features without polygon geometry or
/// without a code are skipped with a warning.
///
/// # Errors
///
/// Returns [`WardError::GeoJson`] if the document is not a
/// `FeatureCollection`.
pub fn parse_ward_collection(text: &str) -> Result<Vec<WardPolygon>, WardError> {
    let geojson: GeoJson = text
        .parse()
        .map_err(|e: geojson::Error| WardError::GeoJson(e.to_string()))?;
    let GeoJson::FeatureCollection(collection) = geojson else {
        return Err(WardError::GeoJson("expected a FeatureCollection".to_string()));
    };

    let mut wards = Vec::with_capacity(collection.features.len());
    for (i, feature) in collection.features.into_iter().enumerate() {
        let properties = feature.properties.unwrap_or_default();
        let Some(code) = ["code", "ward", "id"]
            .iter()
            .find_map(|key| property_string(properties.get(*key)))
        else {
            log::warn!("Skipping ward feature {i}: no ward code");
            continue;
        };
        let Some(geometry) = feature.geometry.and_then(to_multipolygon) else {
            log::warn!("Skipping ward {code}: not a polygon");
            continue;
        };
        let name =
            property_string(properties.get("name")).unwrap_or_else(|| format!("Ward {code}"));

        wards.push(WardPolygon {
            code,
            name,
            geometry,
        });
    }
    Ok(wards)
}

fn property_string(value: Option<&serde_json::Value>) -> Option<String> {
    match value? {
        serde_json::Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn to_multipolygon(geometry: geojson::Geometry) -> Option<MultiPolygon<f64>> {
    let geometry: geo::Geometry<f64> = geometry.try_into().ok()?;
    match geometry {
        geo::Geometry::MultiPolygon(mp) => Some(mp),
        geo::Geometry::Polygon(p) => Some(MultiPolygon(vec![p])),
        _ => None,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use ticket_map_tiles_models::{Cents, Dataset, DatasetVersion};
    use ticket_map_wards_models::WardTotals;

    /// Two square wards side by side near downtown Toronto.
    pub(crate) const TWO_WARDS: &str = r#"{
        "type": "FeatureCollection",
        "features": [
            {
                "type": "Feature",
                "properties": { "code": "10", "name": "Spadina-Fort York" },
                "geometry": {
                    "type": "Polygon",
                    "coordinates": [[
                        [-79.40, 43.63], [-79.38, 43.63], [-79.38, 43.65],
                        [-79.40, 43.65], [-79.40, 43.63]
                    ]]
                }
            },
            {
                "type": "Feature",
                "properties": { "ward": 13 },
                "geometry": {
                    "type": "MultiPolygon",
                    "coordinates": [[[
                        [-79.38, 43.63], [-79.36, 43.63], [-79.36, 43.65],
                        [-79.38, 43.65], [-79.38, 43.63]
                    ], [
                        [-79.375, 43.635], [-79.375, 43.64], [-79.37, 43.64],
                        [-79.37, 43.635], [-79.375, 43.635]
                    ]]]
                }
            }
        ]
    }"#;

    pub(crate) fn rollup(version: u64, ward_10_tickets: u64) -> WardRollup {
        let mut totals = WardTotals::default();
        totals.add(Dataset::ParkingTickets, ward_10_tickets, Cents(3_000));
        WardRollup {
            version: DatasetVersion(version),
            wards: [("10".to_string(), totals)].into_iter().collect(),
        }
    }

    #[test]
    fn parses_polygons_and_multipolygons() {
        let wards = parse_ward_collection(TWO_WARDS).unwrap();
        assert_eq!(wards.len(), 2);
        assert_eq!(wards[0].code, "10");
        assert_eq!(wards[0].name, "Spadina-Fort York");
        assert_eq!(wards[1].code, "13");
        assert_eq!(wards[1].name, "Ward 13");
        assert_eq!(wards[1].geometry.0[0].interiors().len(), 1);
    }

    #[test]
    fn skips_points_and_unnamed_features() {
        let wards = parse_ward_collection(
            r#"{
                "type": "FeatureCollection",
                "features": [
                    { "type": "Feature", "properties": { "code": "1" },
                      "geometry": { "type": "Point", "coordinates": [-79.4, 43.6] } },
                    { "type": "Feature", "properties": {},
                      "geometry": { "type": "Polygon",
                                    "coordinates": [[[0,0],[1,0],[1,1],[0,0]]] } }
                ]
            }"#,
        )
        .unwrap();
        assert!(wards.is_empty());
        assert!(parse_ward_collection(r#"{"type":"Point","coordinates":[0,0]}"#).is_err());
    }

    #[tokio::test]
    async fn directory_source_reads_rollups() {
        let root = std::env::temp_dir().join("ticket_map_ward_source");
        let _ = std::fs::remove_dir_all(&root);
        std::fs::create_dir_all(root.join(ROLLUP_DIR)).unwrap();
        std::fs::write(root.join(WARDS_FILE), TWO_WARDS).unwrap();
        std::fs::write(
            root.join(ROLLUP_DIR).join("parking_tickets.json"),
            serde_json::to_vec(&rollup(4, 12)).unwrap(),
        )
        .unwrap();

        let source = DirectoryWardSource::new(&root);
        assert_eq!(
            parse_ward_collection(&source.ward_geojson().await.unwrap())
                .unwrap()
                .len(),
            2
        );
        let parking = source.rollup(WardDataset::ParkingTickets).await.unwrap();
        assert_eq!(parking, rollup(4, 12));
        let missing = source.rollup(WardDataset::Combined).await.unwrap();
        assert_eq!(missing.version, DatasetVersion::EMPTY);

        std::fs::write(root.join(ROLLUP_DIR).join("combined.json"), "{ nope").unwrap();
        assert!(matches!(
            source.rollup(WardDataset::Combined).await,
            Err(WardError::Rollup { .. })
        ));
        let _ = std::fs::remove_dir_all(&root);
    }
}
