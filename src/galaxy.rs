use crate::aggregate::{aggregate, Bin, Estimate};
use crate::constants::*;
use crate::covariance::{build_covariance, CovarianceMatrix, PixelGrid};
use crate::error::{Result, SfrError};
use crate::kernel::Kernel;
use crate::sfr::estimate_sfr;
use crate::spaxels::{EmissionLine, SpaxelTable};
use crate::utils::io::{CacheKey, CovarianceCache, CovarianceStore};
use serde_derive::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::sync::Arc;

/// Identifies a galaxy by the Galaxy Zoo 3D file it was loaded from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GalaxyId {
    pub file_name: String,
    pub manga_id: String,
}

impl GalaxyId {
    /// The MaNGA id is the part of the file name before the first underscore,
    /// e.g. `1-593159_127_5679242.fits.gz` -> `1-593159`.
    pub fn from_file_name(path: &str) -> Self {
        let file_name = path.rsplit('/').next().unwrap_or(path).to_string();
        let manga_id = file_name.split('_').next().unwrap_or("").to_string();
        GalaxyId {
            file_name,
            manga_id,
        }
    }
}

/// Redshift-derived scalars needed to turn fluxes into star-formation rates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GalaxyConstants {
    pub z: f64,
    pub d_mpc: f64,
    pub d_kpc: f64,
    pub d_m: f64,
    /// Normalisation of the SFR power law
    pub delta: f64,
    /// Physical area of one spaxel in kpc^2
    pub spax_area: f64,
}

impl GalaxyConstants {
    /// Hubble-flow distance at `z` and the constants that follow from it.
    pub fn from_redshift(z: f64) -> Result<Self> {
        if !z.is_finite() || z <= 0.0 {
            return Err(SfrError::InvalidArgument(format!(
                "redshift must be positive and finite, got {z}"
            )));
        }

        let d_mpc = SPEED_OF_LIGHT_KM_S * z / HUBBLE_CONSTANT;
        let d_kpc = d_mpc * 1e3;
        let d_m = d_mpc * METERS_PER_MPC;
        let delta = 4.0 * PI * d_m.powi(2)
            / (BALMER_DECREMENT.powf(HB_EXPONENT) * 10_f64.powf(LOG_LUMINOSITY_NORMALISATION));
        let spax_area = (SPAXEL_ANGLE_RAD * d_kpc).powi(2);

        Ok(GalaxyConstants {
            z,
            d_mpc,
            d_kpc,
            d_m,
            delta,
            spax_area,
        })
    }
}

/// Projected shape of the galaxy on the sky, from the NSA catalog.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GalaxyGeometry {
    /// Effective radius in spaxels
    pub eff_rad: f64,
    /// Position angle of the major axis in radians
    pub theta: f64,
    /// Minor to major axis ratio b/a
    pub axis_ratio: f64,
}

impl GalaxyGeometry {
    /// `elpetro_th50_r` is in arcsec and spaxels are 0.5 arcsec, `elpetro_phi` in degrees.
    pub fn from_catalog(elpetro_th50_r: f64, elpetro_phi: f64, elpetro_ba: f64) -> Self {
        GalaxyGeometry {
            eff_rad: elpetro_th50_r * 2.0,
            theta: (elpetro_phi - 90.0).to_radians(),
            axis_ratio: elpetro_ba,
        }
    }
}

/// Everything known about one galaxy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Galaxy {
    pub id: GalaxyId,
    pub constants: GalaxyConstants,
    pub geometry: GalaxyGeometry,
    pub table: SpaxelTable,
}

impl Galaxy {
    pub fn grid(&self) -> PixelGrid {
        self.table.grid()
    }

    pub fn cache_key(&self, line: EmissionLine, kernel: &Kernel) -> CacheKey {
        CacheKey::new(&self.id.file_name, line, kernel)
    }

    /// Covariance matrix of one line, loaded from `cache` or built and stored there.
    pub fn covariance<S: CovarianceStore>(
        &self,
        line: EmissionLine,
        cache: &CovarianceCache<S>,
        kernel: &Kernel,
    ) -> Result<Arc<CovarianceMatrix>> {
        cache.get_or_build(&self.cache_key(line, kernel), || {
            build_covariance(self.grid(), &self.table.errors(line), kernel)
        })
    }

    /// Summed (or, with `average`, per-spaxel mean) flux of one line over `bin`.
    pub fn emission<S: CovarianceStore>(
        &self,
        bin: &Bin,
        line: EmissionLine,
        cache: &CovarianceCache<S>,
        kernel: &Kernel,
        average: bool,
    ) -> Result<Estimate> {
        let covariance = self.covariance(line, cache, kernel)?;
        aggregate(bin, &self.table.values(line), &covariance, average)
    }

    /// Star-formation rate of `bin`. With `average` this is the mean surface density
    /// per spaxel rather than the total rate.
    pub fn sfr<S: CovarianceStore>(
        &self,
        bin: &Bin,
        cache: &CovarianceCache<S>,
        kernel: &Kernel,
        average: bool,
    ) -> Result<Estimate> {
        let ha = self.emission(bin, EmissionLine::HAlpha, cache, kernel, average)?;
        let hb = self.emission(bin, EmissionLine::HBeta, cache, kernel, average)?;
        let spax_area = average.then_some(self.constants.spax_area);
        Ok(estimate_sfr(ha, hb, self.constants.delta, spax_area))
    }
}

#[test]
fn test_galaxy_id_from_path() {
    let id = GalaxyId::from_file_name("/data/gz3d/1-593159_127_5679242.fits.gz");
    assert_eq!(id.file_name, "1-593159_127_5679242.fits.gz");
    assert_eq!(id.manga_id, "1-593159");
}

#[test]
fn test_constants_from_redshift() {
    use approx::assert_relative_eq;

    let c = GalaxyConstants::from_redshift(0.03).unwrap();
    assert_relative_eq!(c.d_mpc, 128.48248200000001, max_relative = 1e-12);
    assert_relative_eq!(c.d_kpc, c.d_mpc * 1000.0, max_relative = 1e-15);
    assert_relative_eq!(c.spax_area, (2.4240684055477e-6 * c.d_kpc).powi(2), max_relative = 1e-14);

    let expected_delta =
        4.0 * PI * (c.d_mpc * 3.085677581e22).powi(2) / (2.8_f64.powf(2.36) * 10_f64.powf(41.1));
    assert_relative_eq!(c.delta, expected_delta, max_relative = 1e-12);

    assert!(GalaxyConstants::from_redshift(0.0).is_err());
    assert!(GalaxyConstants::from_redshift(f64::NAN).is_err());
}

#[test]
fn test_geometry_from_catalog() {
    use approx::assert_relative_eq;

    let g = GalaxyGeometry::from_catalog(5.5, 135.0, 0.6);
    assert_eq!(g.eff_rad, 11.0);
    assert_relative_eq!(g.theta, PI / 4.0, max_relative = 1e-15);
    assert_eq!(g.axis_ratio, 0.6);
}
