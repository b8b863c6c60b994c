use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use spiral_sfr::batch::{run_batch, BatchConfig, BatchReport};
use spiral_sfr::constants::{
    CORRELATION_CUTOFF, CORRELATION_SCALE, DEFAULT_OTHER_THRESHOLD, DEFAULT_SPIRAL_THRESHOLD,
};
use spiral_sfr::kernel::Kernel;
use spiral_sfr::spaxels::Thresholds;
use spiral_sfr::utils::io::{CovarianceCache, CovarianceStore, DiskDB, FileStore};
use spiral_sfr::utils::loader::{read_catalog, CatalogEntry};
use std::path::PathBuf;

fn parse_level(s: &str) -> Result<log::LevelFilter, String> {
    s.parse::<log::LevelFilter>()
        .map_err(|_| format!("unknown log level {s:?}"))
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Backend {
    /// Single RocksDB database
    Rocksdb,
    /// One file per matrix
    Files,
}

/// Measure spiral and non-spiral star-formation rates for a catalog of galaxies
#[derive(Parser, Debug)]
struct Args {
    /// Catalog csv with file_name, z, elpetro_th50_r, elpetro_phi, elpetro_ba, side
    #[arg(long)]
    catalog: PathBuf,

    /// Directory of per-galaxy spaxel csv files
    #[arg(long)]
    input_dir: PathBuf,

    /// Where covariance matrices are cached
    #[arg(long)]
    cache_dir: PathBuf,

    #[arg(long, value_enum, default_value_t = Backend::Rocksdb)]
    backend: Backend,

    /// Output report csv
    #[arg(long, default_value = "sfr_report.csv")]
    report: PathBuf,

    #[arg(long, default_value_t = DEFAULT_SPIRAL_THRESHOLD)]
    spiral_threshold: u32,

    #[arg(long, default_value_t = DEFAULT_OTHER_THRESHOLD)]
    other_threshold: u32,

    /// Correlation cutoff radius in spaxels
    #[arg(long, default_value_t = CORRELATION_CUTOFF)]
    cutoff: f64,

    /// Correlation length in spaxels
    #[arg(long, default_value_t = CORRELATION_SCALE)]
    scale: f64,

    /// Report mean SFR surface density per spaxel instead of total SFR
    #[arg(long, default_value_t = false)]
    average: bool,

    /// Worker threads (defaults to all cores)
    #[arg(long)]
    threads: Option<usize>,

    /// off, error, warn, info, debug or trace
    #[arg(long, default_value = "info", value_parser = parse_level)]
    log_level: log::LevelFilter,

    /// Log to this file instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    match &args.log_file {
        Some(path) => simple_logging::log_to_file(path, args.log_level)
            .with_context(|| format!("failed to open log file {}", path.display()))?,
        None => env_logger::builder().filter_level(args.log_level).init(),
    }

    if let Some(threads) = args.threads {
        rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build_global()
            .context("failed to build thread pool")?;
    }

    let catalog = read_catalog(&args.catalog)?;
    log::info!("processing {} galaxies from {}", catalog.len(), args.catalog.display());

    let config = BatchConfig {
        input_dir: args.input_dir.clone(),
        thresholds: Thresholds {
            spiral: args.spiral_threshold,
            other: args.other_threshold,
        },
        kernel: Kernel::new(args.cutoff, args.scale).context("invalid correlation kernel")?,
        average: args.average,
    };

    let report = match args.backend {
        Backend::Rocksdb => run(&catalog, &config, DiskDB::connect(&args.cache_dir)?),
        Backend::Files => run(&catalog, &config, FileStore::new(&args.cache_dir)?),
    };

    report.write_csv(&args.report)?;
    log::info!("wrote report to {}", args.report.display());
    Ok(())
}

fn run<S: CovarianceStore>(catalog: &[CatalogEntry], config: &BatchConfig, store: S) -> BatchReport {
    let cache = CovarianceCache::new(store);
    run_batch(catalog, config, &cache)
}
