//! Render and cache counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use ticket_map_tiles_models::TileSource;

/// Lock-free counters updated on the request path.
#[derive(Debug, Default)]
pub struct TileMetrics {
    renders_started: AtomicU64,
    renders_completed: AtomicU64,
    renders_failed: AtomicU64,
    memory_hits: AtomicU64,
    live_hits: AtomicU64,
    stale_hits: AtomicU64,
    disk_hits: AtomicU64,
    empty_tiles: AtomicU64,
    coalesced_waits: AtomicU64,
    corrupt_entries: AtomicU64,
    revalidations_scheduled: AtomicU64,
    revalidations_skipped: AtomicU64,
    revalidations_completed: AtomicU64,
    swept_keys: AtomicU64,
}

/// Point-in-time copy of [`TileMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub renders_started: u64,
    pub renders_completed: u64,
    pub renders_failed: u64,
    pub memory_hits: u64,
    pub live_hits: u64,
    pub stale_hits: u64,
    pub disk_hits: u64,
    pub empty_tiles: u64,
    pub coalesced_waits: u64,
    pub corrupt_entries: u64,
    pub revalidations_scheduled: u64,
    pub revalidations_skipped: u64,
    pub revalidations_completed: u64,
    pub swept_keys: u64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl TileMetrics {
    pub(crate) fn render_started(&self) {
        bump(&self.renders_started);
    }

    pub(crate) fn render_completed(&self) {
        bump(&self.renders_completed);
    }

    pub(crate) fn render_failed(&self) {
        bump(&self.renders_failed);
    }

    pub(crate) fn hit(&self, source: TileSource) {
        match source {
            TileSource::Memory => bump(&self.memory_hits),
            TileSource::DistributedLive => bump(&self.live_hits),
            TileSource::DistributedStale => bump(&self.stale_hits),
            TileSource::DiskSnapshot => bump(&self.disk_hits),
            TileSource::Generated => {}
        }
    }

    pub(crate) fn empty_tile(&self) {
        bump(&self.empty_tiles);
    }

    pub(crate) fn coalesced(&self) {
        bump(&self.coalesced_waits);
    }

    pub(crate) fn corrupt(&self) {
        bump(&self.corrupt_entries);
    }

    pub(crate) fn revalidation_scheduled(&self) {
        bump(&self.revalidations_scheduled);
    }

    pub(crate) fn revalidation_skipped(&self) {
        bump(&self.revalidations_skipped);
    }

    pub(crate) fn revalidation_completed(&self) {
        bump(&self.revalidations_completed);
    }

    pub(crate) fn swept(&self, count: u64) {
        self.swept_keys.fetch_add(count, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        MetricsSnapshot {
            renders_started: load(&self.renders_started),
            renders_completed: load(&self.renders_completed),
            renders_failed: load(&self.renders_failed),
            memory_hits: load(&self.memory_hits),
            live_hits: load(&self.live_hits),
            stale_hits: load(&self.stale_hits),
            disk_hits: load(&self.disk_hits),
            empty_tiles: load(&self.empty_tiles),
            coalesced_waits: load(&self.coalesced_waits),
            corrupt_entries: load(&self.corrupt_entries),
            revalidations_scheduled: load(&self.revalidations_scheduled),
            revalidations_skipped: load(&self.revalidations_skipped),
            revalidations_completed: load(&self.revalidations_completed),
            swept_keys: load(&self.swept_keys),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_counters() {
        let metrics = TileMetrics::default();
        metrics.render_started();
        metrics.hit(TileSource::DistributedStale);
        metrics.hit(TileSource::Generated);
        metrics.swept(3);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.renders_started, 1);
        assert_eq!(snapshot.stale_hits, 1);
        assert_eq!(snapshot.swept_keys, 3);
        assert_eq!(snapshot.memory_hits, 0);
    }

    #[test]
    fn snapshot_serializes_camel_case() {
        let json = serde_json::to_value(TileMetrics::default().snapshot()).unwrap();
        assert_eq!(json["rendersStarted"], 0);
        assert_eq!(json["revalidationsScheduled"], 0);
    }
}
