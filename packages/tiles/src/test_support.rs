//! Feature fixtures shared by unit tests.

use std::sync::Arc;

use ticket_map_tiles_models::{
    Cents, Dataset, DatasetVersion, Feature, FeatureKind, MonthMask, YearWindow,
};

use crate::config::TileServiceConfig;
use crate::store::MemoryFeatureStore;

pub fn parking(id: u64, lon: f64, lat: f64, tickets: u64, street: &str) -> Feature {
    Feature {
        id,
        longitude: lon,
        latitude: lat,
        ticket_count: tickets,
        total_revenue: Cents(i64::try_from(tickets).unwrap() * 3_000),
        top_infraction: Some("PARK-PROHIBITED".to_string()),
        year_mask: YearWindow::default().encode([2019, 2020]),
        month_mask: MonthMask::from_bits(0b1111),
        kind: FeatureKind::Parking {
            location: format!("{id} {street}"),
            street: Some(street.to_string()),
        },
    }
}

/// A config whose disk locations live under a fresh temp directory.
pub fn config(name: &str) -> TileServiceConfig {
    let root = std::env::temp_dir().join(format!("ticket_map_tiles_{name}"));
    let _ = std::fs::remove_dir_all(&root);
    let mut config = TileServiceConfig::default();
    config.cache.snapshot_dir = root.join("snapshots");
    config.loader.summary_dir = root.join("summaries");
    config.loader.version_check_interval_secs = 0;
    config.cache.sweep_interval_secs = 0;
    config
}

pub fn cleanup(config: &TileServiceConfig) {
    if let Some(root) = config.cache.snapshot_dir.parent() {
        let _ = std::fs::remove_dir_all(root);
    }
}

pub fn store_with(version: u64, features: Vec<Feature>) -> Arc<MemoryFeatureStore> {
    let store = Arc::new(MemoryFeatureStore::new());
    store.publish(Dataset::ParkingTickets, DatasetVersion(version), features);
    store
}
