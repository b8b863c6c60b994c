//! Runs the spiral / non-spiral SFR measurement over a catalog of galaxies. Each galaxy
//! either succeeds or fails on its own; failures are collected into the report instead
//! of stopping the batch.

use crate::aggregate::{Bin, Estimate};
use crate::galaxy::Galaxy;
use crate::kernel::Kernel;
use crate::spaxels::{SpiralClass, Thresholds};
use crate::utils::io::{CovarianceCache, CovarianceStore};
use crate::utils::loader::{load_galaxy, CatalogEntry};
use anyhow::{Context, Result};
use itertools::Itertools;
use log::{info, warn};
use rayon::prelude::*;
use serde_derive::Serialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Directory holding one `<file_name>.csv` spaxel table per galaxy
    pub input_dir: PathBuf,
    pub thresholds: Thresholds,
    pub kernel: Kernel,
    /// Report mean SFR surface densities instead of total rates
    pub average: bool,
}

/// SFR of one region of a galaxy
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RegionSfr {
    pub spaxels: usize,
    pub sfr: Estimate,
}

/// Regions with no spaxels are `None`
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct GalaxySfr {
    pub spiral: Option<RegionSfr>,
    pub nonspiral: Option<RegionSfr>,
}

#[derive(Debug)]
pub struct BatchOutcome {
    pub file_name: String,
    /// Error message with its full context chain on failure
    pub result: std::result::Result<GalaxySfr, String>,
}

#[derive(Debug, Default)]
pub struct BatchReport {
    pub outcomes: Vec<BatchOutcome>,
}

#[derive(Debug, Serialize)]
struct ReportRow<'a> {
    file_name: &'a str,
    status: &'static str,
    error: Option<&'a str>,
    spiral_spaxels: Option<usize>,
    spiral_sfr: Option<f64>,
    spiral_sfr_unc: Option<f64>,
    nonspiral_spaxels: Option<usize>,
    nonspiral_sfr: Option<f64>,
    nonspiral_sfr_unc: Option<f64>,
}

impl BatchReport {
    pub fn succeeded(&self) -> impl Iterator<Item = (&str, &GalaxySfr)> {
        self.outcomes
            .iter()
            .filter_map(|o| o.result.as_ref().ok().map(|sfr| (o.file_name.as_str(), sfr)))
    }

    pub fn failed(&self) -> impl Iterator<Item = (&str, &str)> {
        self.outcomes.iter().filter_map(|o| {
            o.result
                .as_ref()
                .err()
                .map(|err| (o.file_name.as_str(), err.as_str()))
        })
    }

    /// One csv row per galaxy, in catalog order
    pub fn write_csv(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let mut writer = csv::Writer::from_path(path)
            .with_context(|| format!("failed to create report at {}", path.display()))?;

        for outcome in &self.outcomes {
            let region = |r: Option<&RegionSfr>| {
                (
                    r.map(|r| r.spaxels),
                    r.map(|r| r.sfr.value),
                    r.map(|r| r.sfr.uncertainty),
                )
            };
            let (status, error, sfr) = match &outcome.result {
                Ok(sfr) => ("ok", None, Some(sfr)),
                Err(err) => ("failed", Some(err.as_str()), None),
            };
            let (spiral_spaxels, spiral_sfr, spiral_sfr_unc) =
                region(sfr.and_then(|s| s.spiral.as_ref()));
            let (nonspiral_spaxels, nonspiral_sfr, nonspiral_sfr_unc) =
                region(sfr.and_then(|s| s.nonspiral.as_ref()));

            writer.serialize(ReportRow {
                file_name: &outcome.file_name,
                status,
                error,
                spiral_spaxels,
                spiral_sfr,
                spiral_sfr_unc,
                nonspiral_spaxels,
                nonspiral_sfr,
                nonspiral_sfr_unc,
            })?;
        }
        writer.flush()?;
        Ok(())
    }
}

/// SFR of the spaxels of `galaxy` in `class`, or `None` if there are none.
pub fn region_sfr<S: CovarianceStore>(
    galaxy: &Galaxy,
    class: SpiralClass,
    config: &BatchConfig,
    cache: &CovarianceCache<S>,
) -> Result<Option<RegionSfr>> {
    let members = galaxy
        .table
        .select(|_, s| config.thresholds.classify(&s.votes) == class);
    if members.is_empty() {
        return Ok(None);
    }

    let bin = Bin::new(members)?;
    let sfr = galaxy
        .sfr(&bin, cache, &config.kernel, config.average)
        .with_context(|| format!("{:?} SFR of {}", class, galaxy.id.file_name))?;
    Ok(Some(RegionSfr {
        spaxels: bin.len(),
        sfr,
    }))
}

/// Loads one galaxy and measures its spiral and non-spiral SFR.
pub fn process_galaxy<S: CovarianceStore>(
    entry: &CatalogEntry,
    config: &BatchConfig,
    cache: &CovarianceCache<S>,
) -> Result<GalaxySfr> {
    let galaxy = load_galaxy(entry, &config.input_dir)
        .with_context(|| format!("failed to load {}", entry.file_name))?;

    let result = measure_galaxy(&galaxy, config, cache);

    // Matrices of finished galaxies are not needed again
    cache.evict(&galaxy.id.file_name);
    result
}

fn measure_galaxy<S: CovarianceStore>(
    galaxy: &Galaxy,
    config: &BatchConfig,
    cache: &CovarianceCache<S>,
) -> Result<GalaxySfr> {
    Ok(GalaxySfr {
        spiral: region_sfr(galaxy, SpiralClass::Spiral, config, cache)?,
        nonspiral: region_sfr(galaxy, SpiralClass::NonSpiral, config, cache)?,
    })
}

/// Processes every catalog entry in parallel and reports each outcome.
pub fn run_batch<S: CovarianceStore>(
    entries: &[CatalogEntry],
    config: &BatchConfig,
    cache: &CovarianceCache<S>,
) -> BatchReport {
    let outcomes: Vec<BatchOutcome> = entries
        .par_iter()
        .map(|entry| {
            let result = process_galaxy(entry, config, cache).map_err(|err| {
                warn!("{} failed: {:#}", entry.file_name, err);
                format!("{err:#}")
            });
            BatchOutcome {
                file_name: entry.file_name.clone(),
                result,
            }
        })
        .collect();

    let report = BatchReport { outcomes };
    let failed = report.failed().map(|(name, _)| name).join(", ");
    info!(
        "batch finished: {} ok, {} failed",
        report.succeeded().count(),
        report.failed().count()
    );
    if !failed.is_empty() {
        warn!("failed galaxies: {failed}");
    }
    report
}

#[test]
fn test_report_iterators_and_csv() {
    let report = BatchReport {
        outcomes: vec![
            BatchOutcome {
                file_name: "a".to_string(),
                result: Ok(GalaxySfr {
                    spiral: Some(RegionSfr {
                        spaxels: 3,
                        sfr: Estimate::new(0.5, 0.1),
                    }),
                    nonspiral: None,
                }),
            },
            BatchOutcome {
                file_name: "b".to_string(),
                result: Err("failed to load b: missing".to_string()),
            },
        ],
    };

    assert_eq!(report.succeeded().count(), 1);
    assert_eq!(report.failed().collect::<Vec<_>>(), vec![("b", "failed to load b: missing")]);

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("report.csv");
    report.write_csv(&path).unwrap();
    let written = std::fs::read_to_string(&path).unwrap();
    let lines: Vec<&str> = written.lines().collect();
    assert_eq!(lines.len(), 3);
    assert!(lines[0].starts_with("file_name,status,error,spiral_spaxels"));
    assert_eq!(lines[1], "a,ok,,3,0.5,0.1,,,");
    assert!(lines[2].starts_with("b,failed,failed to load b: missing,"));
}
