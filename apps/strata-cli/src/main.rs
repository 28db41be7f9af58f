use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use strata_common::{BlockPos, RegionPos, StrataConfig};
use strata_persist::codec::split_frame;
use strata_persist::{RegionFile, RegionOptions};
use strata_poi::{Occupancy, PoiIndex, PoiRegistry, PoiSeeker, SeekOutcome, VILLAGE_TAG};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "strata-cli", about = "CLI tool for strata storage")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print crate info and the effective configuration
    Info,
    /// Print the slot table of a region file
    Inspect {
        /// Path to an `r.<x>.<z>.region` file
        file: PathBuf,
    },
    /// Populate a POI index on disk, reopen it, then search and claim
    Demo {
        /// Folder for the region files
        #[arg(short, long, default_value = "strata-demo")]
        dir: PathBuf,
        /// Number of POIs to place
        #[arg(short, long, default_value = "200")]
        pois: usize,
        /// RNG seed for placement and backoff
        #[arg(short, long, default_value = "42")]
        seed: u64,
    },
}

fn demo_registry() -> anyhow::Result<Arc<PoiRegistry>> {
    let registry = PoiRegistry::builder()
        .register("bed", 1, 1, [1])
        .register("bell", 32, 6, [2])
        .register("workstation", 1, 1, [3, 4])
        .tag(VILLAGE_TAG, &["bed", "bell"])
        .build()
        .context("building demo POI registry")?;
    Ok(Arc::new(registry))
}

fn inspect(file: &Path, config: &StrataConfig) -> anyhow::Result<()> {
    anyhow::ensure!(file.is_file(), "{} is not a file", file.display());
    let name = file
        .file_name()
        .and_then(|n| n.to_str())
        .context("region file name is not valid UTF-8")?;
    let region = RegionPos::from_file_name(name)
        .with_context(|| format!("{name} is not named r.<x>.<z>.region"))?;

    let mut region_file = RegionFile::open(file, region, RegionOptions::from(&config.region))
        .with_context(|| format!("opening {}", file.display()))?;
    let slots: Vec<_> = region_file.slots().collect();

    println!("region {},{}: {} chunks", region.x, region.z, slots.len());
    println!("{:>12} {:>8} {:>8} {:>12} {:>8}", "chunk", "offset", "sectors", "timestamp", "format");
    for (chunk, entry) in slots {
        let format = match region_file.read_raw(chunk) {
            Ok(Some(raw)) => match split_frame(&raw) {
                Ok((format, _)) => format!("{format:?}"),
                Err(err) => format!("bad ({err})"),
            },
            Ok(None) => "empty".to_string(),
            Err(err) => format!("unreadable ({err})"),
        };
        println!(
            "{:>12} {:>8} {:>8} {:>12} {:>8}",
            format!("{},{}", chunk.x, chunk.z),
            entry.sector_offset,
            entry.sector_count,
            entry.timestamp,
            format
        );
    }
    println!(
        "sectors: {} total, {} free",
        region_file.total_sectors(),
        region_file.free_sectors()
    );
    Ok(())
}

fn demo(dir: &Path, pois: usize, seed: u64, config: &StrataConfig) -> anyhow::Result<()> {
    std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    let registry = demo_registry()?;
    let kinds: Vec<_> = registry.types().map(|t| t.id).collect();
    let mut rng = StdRng::seed_from_u64(seed);

    {
        let mut index = PoiIndex::open(dir, Arc::clone(&registry), config);
        let mut placed = 0;
        for _ in 0..pois {
            let pos = BlockPos::new(
                rng.gen_range(-96..96),
                rng.gen_range(60..80),
                rng.gen_range(-96..96),
            );
            let kind = kinds[rng.gen_range(0..kinds.len())];
            if index.type_at(pos).is_none() {
                index.add(pos, kind)?;
                placed += 1;
            }
        }
        let stats = index.flush_all()?;
        println!(
            "placed {placed} POIs, wrote {} columns ({} sections)",
            stats.columns_written, stats.sections_written
        );
    }

    let mut index = PoiIndex::open(dir, Arc::clone(&registry), config);
    let origin = BlockPos::new(0, 70, 0);
    let bell = registry.by_name("bell").context("bell type missing")?;
    let bed = registry.by_name("bed").context("bed type missing")?;

    match index.find_nearest(|k| k == bell, |_| true, origin, config.poi.search_radius, Occupancy::Any) {
        Some(pos) => {
            println!("nearest bell: {},{},{}", pos.x, pos.y, pos.z);
            if index.take(|k| k == bell, |_, p| p == pos, pos, 1).is_some() {
                println!("rang bell, {} tickets left", index.free_tickets(pos));
            }
        }
        None => println!("no bell within {} blocks", config.poi.search_radius),
    }

    let in_range = index.count_in_range(|k| k == bed, origin, config.poi.search_radius, Occupancy::HasSpace);
    println!("free beds within {} blocks: {in_range}", config.poi.search_radius);

    let mut seeker = PoiSeeker::new(config);
    for tick in [0u64, 100, 500] {
        let outcome = seeker.acquire(&mut index, |k| k == bed, origin, tick, &mut rng, |batch| {
            // pretend only the second candidate can be reached
            batch.get(1).map(|(_, pos)| *pos)
        });
        match outcome {
            SeekOutcome::Acquired(pos) => println!("tick {tick}: claimed bed at {},{},{}", pos.x, pos.y, pos.z),
            SeekOutcome::Unreachable(batch) => println!("tick {tick}: {} beds unreachable", batch.len()),
            SeekOutcome::NoCandidates => println!("tick {tick}: no bed available"),
        }
    }

    println!(
        "sections from origin to a village: {}",
        index.sections_to_village(origin.section())
    );
    let stats = index.tick()?;
    println!("tick flushed {} columns", stats.columns_written);
    index.flush_all()?;
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    let config = match &cli.config {
        Some(path) => StrataConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => StrataConfig::default(),
    };

    match cli.command {
        Commands::Info => {
            println!("strata-cli v{}", env!("CARGO_PKG_VERSION"));
            println!("common: {}", strata_common::crate_info());
            println!("persist: {}", strata_persist::crate_info());
            println!("poi: {}", strata_poi::crate_info());
            println!("stream: {}", strata_stream::crate_info());
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        Commands::Inspect { file } => inspect(&file, &config)?,
        Commands::Demo { dir, pois, seed } => demo(&dir, pois, seed, &config)?,
    }

    Ok(())
}
