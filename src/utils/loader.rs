use crate::covariance::PixelGrid;
use crate::galaxy::{Galaxy, GalaxyConstants, GalaxyGeometry, GalaxyId};
use crate::spaxels::{line_validity, BptLabels, PixelMeasurement, Spaxel, SpaxelTable, ZooVotes};
use anyhow::{bail, ensure, Context, Result};
use serde_derive::Deserialize;
use std::path::{Path, PathBuf};

/// One row of the galaxy catalog csv
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CatalogEntry {
    pub file_name: String,
    pub z: f64,
    pub elpetro_th50_r: f64,
    pub elpetro_phi: f64,
    pub elpetro_ba: f64,
    /// Side length of the square emission-line maps
    pub side: usize,
}

/// One row of a per-galaxy spaxel csv. Empty cells deserialize to `None`.
#[derive(Debug, Deserialize)]
struct SpaxelRow {
    idx: usize,
    ha: Option<f64>,
    sig_ha: Option<f64>,
    sn_ha: Option<f64>,
    ha_mask: u64,
    hb: Option<f64>,
    sig_hb: Option<f64>,
    sn_hb: Option<f64>,
    hb_mask: u64,
    comp: u8,
    agn: u8,
    seyfert: u8,
    liner: u8,
    spiral_votes: u32,
    center_votes: u32,
    star_votes: u32,
    bar_votes: u32,
}

impl SpaxelRow {
    fn into_spaxel(self) -> Spaxel {
        let (ha_valid, hb_valid) = line_validity(self.ha_mask, self.hb_mask);
        Spaxel {
            ha: PixelMeasurement::new(self.ha, self.sig_ha, self.sn_ha, ha_valid),
            hb: PixelMeasurement::new(self.hb, self.sig_hb, self.sn_hb, hb_valid),
            bpt: BptLabels {
                comp: self.comp != 0,
                agn: self.agn != 0,
                seyfert: self.seyfert != 0,
                liner: self.liner != 0,
            },
            votes: ZooVotes {
                spiral: self.spiral_votes,
                center: self.center_votes,
                star: self.star_votes,
                bar: self.bar_votes,
            },
        }
    }
}

/// Reads the catalog of galaxies to process.
pub fn read_catalog(path: impl AsRef<Path>) -> Result<Vec<CatalogEntry>> {
    let path = path.as_ref();
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path)
        .with_context(|| format!("failed to open catalog at {}", path.display()))?;

    let mut entries = Vec::new();
    for (line, row) in reader.deserialize::<CatalogEntry>().enumerate() {
        entries.push(row.with_context(|| format!("invalid catalog row {}", line + 1))?);
    }
    Ok(entries)
}

/// Location of the spaxel table of `entry` inside `input_dir`
pub fn spaxel_path(input_dir: &Path, entry: &CatalogEntry) -> PathBuf {
    input_dir.join(format!("{}.csv", entry.file_name))
}

/// Reads a spaxel csv into a table on `grid`. Every spaxel index must appear exactly once.
pub fn read_spaxels(path: impl AsRef<Path>, grid: PixelGrid, geometry: &GalaxyGeometry) -> Result<SpaxelTable> {
    let path = path.as_ref();
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path)
        .with_context(|| format!("failed to open spaxel table at {}", path.display()))?;

    let mut slots: Vec<Option<Spaxel>> = vec![None; grid.pixels()];
    for row in reader.deserialize::<SpaxelRow>() {
        let row = row.with_context(|| format!("invalid spaxel row in {}", path.display()))?;
        let idx = row.idx;
        ensure!(
            idx < grid.pixels(),
            "spaxel index {} outside {}x{} map in {}",
            idx,
            grid.side(),
            grid.side(),
            path.display()
        );
        if slots[idx].replace(row.into_spaxel()).is_some() {
            bail!("duplicate spaxel index {idx} in {}", path.display());
        }
    }

    let missing = slots.iter().filter(|s| s.is_none()).count();
    ensure!(missing == 0, "{missing} spaxels missing from {}", path.display());

    let spaxels = slots.into_iter().flatten().collect();
    Ok(SpaxelTable::new(grid, spaxels, geometry)?)
}

/// Assembles the full galaxy record for a catalog entry.
pub fn load_galaxy(entry: &CatalogEntry, input_dir: &Path) -> Result<Galaxy> {
    let id = GalaxyId::from_file_name(&entry.file_name);
    let constants = GalaxyConstants::from_redshift(entry.z)?;
    let geometry = GalaxyGeometry::from_catalog(entry.elpetro_th50_r, entry.elpetro_phi, entry.elpetro_ba);
    let grid = PixelGrid::new(entry.side)?;
    let table = read_spaxels(spaxel_path(input_dir, entry), grid, &geometry)?;

    Ok(Galaxy {
        id,
        constants,
        geometry,
        table,
    })
}

#[cfg(test)]
const SPAXEL_HEADER: &str = "idx,ha,sig_ha,sn_ha,ha_mask,hb,sig_hb,sn_hb,hb_mask,comp,agn,seyfert,liner,spiral_votes,center_votes,star_votes,bar_votes\n";

#[test]
fn test_read_catalog() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("catalog.csv");
    std::fs::write(
        &path,
        "file_name,z,elpetro_th50_r,elpetro_phi,elpetro_ba,side\n\
         1-1_a.fits.gz,0.03,5.0,120.0,0.7,2\n\
         1-2_b.fits.gz, 0.05, 4.0, 10.0, 0.4, 3\n",
    )
    .unwrap();

    let catalog = read_catalog(&path).unwrap();
    assert_eq!(catalog.len(), 2);
    assert_eq!(catalog[1].file_name, "1-2_b.fits.gz");
    assert_eq!(catalog[1].side, 3);
}

#[test]
fn test_read_spaxels_with_masks_and_gaps() {
    use crate::constants::DONOTUSE;
    use crate::spaxels::EmissionLine;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("gal.csv");
    let rows = format!(
        "{SPAXEL_HEADER}\
         3,4.0,0.4,10,0,1.0,0.1,10,0,0,0,0,0,5,0,0,0\n\
         0,1.0,0.1,10,0,0.5,0.05,10,0,1,0,0,0,0,0,0,0\n\
         1,,,,0,,,,0,0,0,0,0,0,0,0,0\n\
         2,3.0,0.3,10,{DONOTUSE},0.7,0.07,10,0,0,0,0,1,0,0,4,0\n"
    );
    std::fs::write(&path, rows).unwrap();

    let grid = PixelGrid::new(2).unwrap();
    let geometry = GalaxyGeometry::from_catalog(5.0, 90.0, 1.0);
    let table = read_spaxels(&path, grid, &geometry).unwrap();

    assert_eq!(table.values(EmissionLine::HAlpha), vec![Some(1.0), None, None, Some(4.0)]);
    assert_eq!(table.errors(EmissionLine::HBeta), vec![Some(0.05), None, None, Some(0.1)]);
    assert!(table.spaxels()[0].bpt.comp);
    assert!(table.spaxels()[2].bpt.liner);
    assert_eq!(table.spaxels()[3].votes.spiral, 5);
}

#[test]
fn test_read_spaxels_rejects_incomplete_tables() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("gal.csv");
    std::fs::write(&path, format!("{SPAXEL_HEADER}0,1,1,1,0,1,1,1,0,0,0,0,0,0,0,0,0\n")).unwrap();

    let grid = PixelGrid::new(2).unwrap();
    let geometry = GalaxyGeometry::from_catalog(5.0, 90.0, 1.0);
    assert!(read_spaxels(&path, grid, &geometry).is_err());
}
