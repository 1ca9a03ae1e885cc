#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! CLI entry point for rendering, prewarming and inspecting ticket map
//! tiles from a directory feature store.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use clap::{Parser, Subcommand};
use ticket_map_cache::{DistributedCache, MemoryDistributedCache};
use ticket_map_cli_utils::TileBar;
use ticket_map_tiles::{
    AnalyticalSource, DirectoryFeatureStore, TileRequestOptions, TileService, TileServiceConfig,
};
use ticket_map_tiles_models::{BoundingBox, Dataset, SummaryFilters};
use ticket_map_wards::{DirectoryWardSource, WardServiceConfig, WardTileService};
use ticket_map_wards_models::WardDataset;

#[derive(Parser)]
#[command(name = "ticket_map_tiles", about = "Ticket map tile tool")]
struct Cli {
    /// TOML file overriding the built-in configuration
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Feature store root, holding one directory per dataset
    #[arg(long, global = true, default_value = "data/features")]
    data_dir: PathBuf,
    /// Directory holding `wards.geojson` and `rollups/<dataset>.json`
    #[arg(long, global = true, default_value = "data/wards")]
    wards_dir: PathBuf,
    /// `DuckDB` database queried when a dataset has no stored features
    #[cfg(feature = "duckdb")]
    #[arg(long, global = true)]
    analytics_db: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Render one tile and write the encoded bytes to a file
    Render {
        /// Dataset (e.g., "`parking_tickets`")
        dataset: Dataset,
        z: u8,
        x: u32,
        y: u32,
        /// Output file for the Mapbox Vector Tile
        #[arg(long, short)]
        output: PathBuf,
    },
    /// Render every tile covering a bounding box at the given zooms
    Prewarm {
        dataset: Dataset,
        /// "west,south,east,north" in degrees
        #[arg(long)]
        bbox: String,
        /// Zoom range ("10-14") or list ("10,12,14")
        #[arg(long, default_value = "10-14")]
        zooms: String,
    },
    /// Print the viewport summary of a bounding box as JSON
    Summary {
        dataset: Dataset,
        /// "west,south,east,north" in degrees
        #[arg(long)]
        bbox: String,
        #[arg(long)]
        zoom: u8,
        #[arg(long)]
        year: Option<i32>,
        /// Month number, 1-12
        #[arg(long)]
        month: Option<u8>,
    },
    /// Render one ward tile and persist the ward snapshot
    Ward {
        /// Ward layer (e.g., "`combined`")
        dataset: WardDataset,
        z: u8,
        x: u32,
        y: u32,
        #[arg(long, short)]
        output: PathBuf,
    },
    /// Run one oversized-entry sweep against the distributed cache
    Sweep,
}

#[allow(clippy::too_many_lines)]
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let multi = ticket_map_cli_utils::init_logger();
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => TileServiceConfig::from_file(path)?,
        None => TileServiceConfig::default(),
    }
    .apply_env();

    let store = Arc::new(DirectoryFeatureStore::new(&cli.data_dir));
    let analytical = analytical_source(&cli);
    let distributed: Arc<dyn DistributedCache> = Arc::new(MemoryDistributedCache::new());
    let service = TileService::new(config, store, analytical, Arc::clone(&distributed));

    let start = Instant::now();
    match cli.command {
        Commands::Render {
            dataset,
            z,
            x,
            y,
            output,
        } => {
            let tile = service
                .get_tile(dataset, z, x, y, &TileRequestOptions::default())
                .await?;
            match tile {
                Some(tile) => {
                    write_tile(&output, &tile.buffer)?;
                    log::info!(
                        "Wrote {dataset} {z}/{x}/{y} ({} bytes, {}, etag {}) to {}",
                        tile.buffer.len(),
                        tile.version,
                        tile.etag,
                        output.display()
                    );
                }
                None => log::info!("{dataset} {z}/{x}/{y} has no features"),
            }
        }
        Commands::Prewarm {
            dataset,
            bbox,
            zooms,
        } => {
            let bbox = parse_bbox(&bbox)?;
            let zooms = parse_zooms(&zooms)?;
            let progress = TileBar::prewarm(&multi, dataset.as_ref());
            let stats = service.prewarm(dataset, &bbox, &zooms, progress).await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Commands::Summary {
            dataset,
            bbox,
            zoom,
            year,
            month,
        } => {
            let bbox = parse_bbox(&bbox)?;
            service.ensure_loaded(dataset).await?;
            let summary =
                service.summarize_viewport(dataset, &bbox, zoom, SummaryFilters { year, month });
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Ward {
            dataset,
            z,
            x,
            y,
            output,
        } => {
            let wards = WardTileService::new(
                WardServiceConfig::default().apply_env(),
                Arc::new(DirectoryWardSource::new(&cli.wards_dir)),
                distributed,
            );
            let progress = TileBar::ward(&multi, dataset.as_ref(), &format!("{z}/{x}/{y}"));
            match wards.get_ward_tile(dataset, z, x, y).await? {
                Some(tile) => {
                    write_tile(&output, &tile.buffer)?;
                    let bytes = tile.buffer.len();
                    progress.finish(format!("Wrote {bytes} bytes ({})", tile.version));
                    log::info!("Wrote {dataset} ward tile {z}/{x}/{y} to {}", output.display());
                }
                None => {
                    progress.finish_and_clear();
                    log::info!("No ward reaches {z}/{x}/{y}");
                }
            }
            wards.flush_snapshots().await?;
        }
        Commands::Sweep => {
            let removed = service.sweep_oversized().await?;
            log::info!("Swept {removed} oversized cache entries");
        }
    }

    service.shutdown().await;
    log::info!("Done in {:.1}s", start.elapsed().as_secs_f64());
    Ok(())
}

#[cfg(feature = "duckdb")]
fn analytical_source(cli: &Cli) -> Option<Arc<dyn AnalyticalSource>> {
    cli.analytics_db.as_ref().map(|path| {
        Arc::new(ticket_map_tiles::DuckDbAnalyticalSource::new(path))
            as Arc<dyn AnalyticalSource>
    })
}

#[cfg(not(feature = "duckdb"))]
const fn analytical_source(_cli: &Cli) -> Option<Arc<dyn AnalyticalSource>> {
    None
}

fn write_tile(output: &std::path::Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = output.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(output, bytes)
}

fn parse_bbox(s: &str) -> Result<BoundingBox, String> {
    BoundingBox::parse(s).ok_or_else(|| format!("Invalid bounding box '{s}'"))
}

/// Parses "10-14" or "10,12,14".
fn parse_zooms(s: &str) -> Result<Vec<u8>, String> {
    let invalid = || format!("Invalid zoom list '{s}'");
    if let Some((from, to)) = s.split_once('-') {
        let from: u8 = from.trim().parse().map_err(|_| invalid())?;
        let to: u8 = to.trim().parse().map_err(|_| invalid())?;
        return Ok((from..=to).collect());
    }
    s.split(',')
        .map(|z| z.trim().parse().map_err(|_| invalid()))
        .collect()
}
