#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Terminal output for the `ticket_map_tiles` binary: a tile counter for
//! prewarm sweeps, a spinner for single ward renders, and the logger that
//! keeps both readable.

use std::sync::Arc;
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use ticket_map_tiles_models::ProgressCallback;

pub use indicatif::MultiProgress;

const TICK: Duration = Duration::from_millis(120);

/// Shown while the tile range of a prewarm is still being enumerated.
const ENUMERATING: &str = "{spinner:.cyan} {msg} (enumerating tiles)";

/// Shown once the number of tiles is known.
const RENDERING: &str =
    "  {msg:<24} {wide_bar:.cyan/dim} {pos}/{len} tiles ({per_sec}, {eta} left)";

const WARD: &str = "{spinner:.magenta} {msg} [{elapsed}]";

fn style(template: &str, fallback: fn() -> ProgressStyle) -> ProgressStyle {
    ProgressStyle::with_template(template).unwrap_or_else(|e| {
        log::debug!("Invalid progress template {template:?}: {e}");
        fallback()
    })
}

/// Progress of tile work, rendered as an `indicatif` bar.
pub struct TileBar {
    bar: ProgressBar,
    counting: Option<ProgressStyle>,
}

impl TileBar {
    /// Counter for a prewarm sweep over `dataset`. Spins until the tile
    /// count arrives through [`ProgressCallback::set_total`].
    #[must_use]
    pub fn prewarm(multi: &MultiProgress, dataset: &str) -> Arc<dyn ProgressCallback> {
        let bar = multi.add(ProgressBar::new_spinner());
        bar.set_style(style(ENUMERATING, ProgressStyle::default_spinner));
        bar.set_message(format!("Prewarming {dataset}"));
        bar.enable_steady_tick(TICK);

        let counting = style(RENDERING, ProgressStyle::default_bar).progress_chars("=> ");
        Arc::new(Self {
            bar,
            counting: Some(counting),
        })
    }

    /// Spinner for one ward tile render, which has no countable steps.
    #[must_use]
    pub fn ward(multi: &MultiProgress, dataset: &str, tile: &str) -> Arc<dyn ProgressCallback> {
        let bar = multi.add(ProgressBar::new_spinner());
        bar.set_style(style(WARD, ProgressStyle::default_spinner));
        bar.set_message(format!("Rendering {dataset} ward tile {tile}"));
        bar.enable_steady_tick(TICK);
        Arc::new(Self {
            bar,
            counting: None,
        })
    }
}

impl ProgressCallback for TileBar {
    fn set_total(&self, total: u64) {
        self.bar.disable_steady_tick();
        self.bar.set_length(total);
        self.bar.reset();
        if let Some(counting) = &self.counting {
            self.bar.set_style(counting.clone());
        }
    }

    fn set_position(&self, pos: u64) {
        self.bar.set_position(pos);
    }

    fn inc(&self, delta: u64) {
        self.bar.inc(delta);
    }

    fn set_message(&self, msg: String) {
        self.bar.set_message(msg);
    }

    fn finish(&self, msg: String) {
        self.bar.finish_with_message(msg);
    }

    fn finish_and_clear(&self) {
        self.bar.finish_and_clear();
    }
}

/// Installs `pretty_env_logger` behind `indicatif-log-bridge` so log lines
/// print above the bars. Logs at `info` unless `RUST_LOG` says otherwise.
///
/// Bars must be added to the returned [`MultiProgress`].
#[must_use]
pub fn init_logger() -> MultiProgress {
    let multi = MultiProgress::new();

    let mut builder = pretty_env_logger::formatted_builder();
    builder.filter_level(log::LevelFilter::Info);
    if let Ok(filters) = std::env::var("RUST_LOG") {
        builder.parse_filters(&filters);
    }
    let logger = builder.build();
    let level = logger.filter();

    if indicatif_log_bridge::LogWrapper::new(multi.clone(), logger)
        .try_init()
        .is_ok()
    {
        log::set_max_level(level);
    }

    multi
}

#[cfg(test)]
mod tests {
    use indicatif::ProgressDrawTarget;

    use super::*;

    fn hidden() -> MultiProgress {
        MultiProgress::with_draw_target(ProgressDrawTarget::hidden())
    }

    #[test]
    fn templates_parse() {
        for template in [ENUMERATING, RENDERING, WARD] {
            assert!(ProgressStyle::with_template(template).is_ok(), "{template}");
        }
    }

    #[test]
    fn prewarm_bar_counts_tiles_after_total() {
        let multi = hidden();
        let bar = multi.add(ProgressBar::new_spinner());
        let progress = TileBar {
            bar: bar.clone(),
            counting: Some(style(RENDERING, ProgressStyle::default_bar)),
        };

        progress.set_total(40);
        progress.inc(3);
        progress.inc(2);
        assert_eq!(bar.length(), Some(40));
        assert_eq!(bar.position(), 5);

        progress.finish("done".to_string());
        assert!(bar.is_finished());
    }

    #[test]
    fn ward_spinner_finishes() {
        let multi = hidden();
        let progress = TileBar::ward(&multi, "combined", "12/1144/1493");
        progress.finish("Wrote 812 bytes".to_string());
        progress.finish_and_clear();
    }
}
