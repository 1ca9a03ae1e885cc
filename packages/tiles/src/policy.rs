//! Zoom-dependent cache lifetimes and request timeouts.
//!
//! Coarse tiles are few and heavily reused, so they keep the full base
//! TTL. Middle and fine tiles are far more numerous and each one is
//! requested less often, so their live TTL is divided down. The stale tier
//! always outlives the live tier.

use std::time::Duration;

use strum_macros::{AsRefStr, Display};

use crate::config::TileServiceConfig;

/// Zoom band a tile falls into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum ZoomBand {
    Coarse,
    Middle,
    Fine,
}

/// Cache and timeout policy derived from a [`TileServiceConfig`].
#[derive(Debug, Clone)]
pub struct TilePolicy {
    coarse_max_zoom: u8,
    middle_max_zoom: u8,
    base_ttl: Duration,
    middle_divisor: u32,
    fine_divisor: u32,
    stale_multiplier: u32,
    max_stale_ttl: Duration,
    coarse_timeout: Duration,
    middle_timeout: Duration,
    fine_timeout: Duration,
}

impl TilePolicy {
    #[must_use]
    pub fn new(config: &TileServiceConfig) -> Self {
        let bands = &config.zoom_bands;
        Self {
            coarse_max_zoom: bands.coarse_max_zoom,
            middle_max_zoom: bands.middle_max_zoom.max(bands.coarse_max_zoom),
            base_ttl: config.base_ttl(),
            middle_divisor: bands.middle_ttl_divisor.max(1),
            fine_divisor: bands.fine_ttl_divisor.max(1),
            stale_multiplier: config.cache.stale_ttl_multiplier.max(1),
            max_stale_ttl: config.max_stale_ttl(),
            coarse_timeout: Duration::from_millis(bands.coarse_timeout_ms),
            middle_timeout: Duration::from_millis(bands.middle_timeout_ms),
            fine_timeout: Duration::from_millis(bands.fine_timeout_ms),
        }
    }

    #[must_use]
    pub const fn band(&self, zoom: u8) -> ZoomBand {
        if zoom <= self.coarse_max_zoom {
            ZoomBand::Coarse
        } else if zoom <= self.middle_max_zoom {
            ZoomBand::Middle
        } else {
            ZoomBand::Fine
        }
    }

    /// TTL of the distributed live entry for a tile at `zoom`.
    #[must_use]
    pub fn live_ttl(&self, zoom: u8) -> Duration {
        match self.band(zoom) {
            ZoomBand::Coarse => self.base_ttl,
            ZoomBand::Middle => self.base_ttl / self.middle_divisor,
            ZoomBand::Fine => self.base_ttl / self.fine_divisor,
        }
    }

    /// TTL of the distributed stale entry: a multiple of the live TTL,
    /// capped, but never shorter than the live TTL.
    #[must_use]
    pub fn stale_ttl(&self, zoom: u8) -> Duration {
        let live = self.live_ttl(zoom);
        (live * self.stale_multiplier)
            .min(self.max_stale_ttl)
            .max(live)
    }

    /// Hard per-request timeout for a tile at `zoom`.
    #[must_use]
    pub const fn timeout(&self, zoom: u8) -> Duration {
        match self.band(zoom) {
            ZoomBand::Coarse => self.coarse_timeout,
            ZoomBand::Middle => self.middle_timeout,
            ZoomBand::Fine => self.fine_timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> TilePolicy {
        TilePolicy::new(&TileServiceConfig::default())
    }

    #[test]
    fn bands_follow_config() {
        let policy = policy();
        assert_eq!(policy.band(0), ZoomBand::Coarse);
        assert_eq!(policy.band(10), ZoomBand::Coarse);
        assert_eq!(policy.band(11), ZoomBand::Middle);
        assert_eq!(policy.band(13), ZoomBand::Middle);
        assert_eq!(policy.band(14), ZoomBand::Fine);
    }

    #[test]
    fn live_ttl_shrinks_with_zoom() {
        let policy = policy();
        assert_eq!(policy.live_ttl(8), Duration::from_secs(86_400));
        assert_eq!(policy.live_ttl(12), Duration::from_secs(7_200));
        assert_eq!(policy.live_ttl(14), Duration::from_secs(3_600));
        for z in 0..20 {
            assert!(policy.live_ttl(z) >= policy.live_ttl(z + 1), "zoom {z}");
        }
    }

    #[test]
    fn stale_outlives_live_and_is_capped() {
        let policy = policy();
        for z in 0..=20 {
            assert!(policy.stale_ttl(z) > policy.live_ttl(z), "zoom {z}");
            assert!(policy.stale_ttl(z) <= Duration::from_secs(604_800));
        }
        assert_eq!(policy.stale_ttl(14), Duration::from_secs(6 * 3_600));
    }

    #[test]
    fn coarse_zooms_get_longest_timeout() {
        let policy = policy();
        assert!(policy.timeout(5) > policy.timeout(12));
        assert!(policy.timeout(12) > policy.timeout(16));
    }
}
