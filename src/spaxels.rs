//! Typed per-spaxel measurement table of a galaxy: Hα and Hβ fluxes with their
//! errors and quality flags, BPT labels, Galaxy Zoo 3D votes and the deprojected
//! radius of every spaxel.

use crate::aggregate::Bin;
use crate::constants::*;
use crate::covariance::PixelGrid;
use crate::error::{Result, SfrError};
use crate::galaxy::GalaxyGeometry;
use crate::PixelIndex;
use ndarray::Array2;
use serde_derive::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EmissionLine {
    HAlpha,
    HBeta,
}

impl EmissionLine {
    pub const ALL: [EmissionLine; 2] = [EmissionLine::HAlpha, EmissionLine::HBeta];

    /// Short label used in cache keys and tables
    pub fn label(&self) -> &'static str {
        match self {
            EmissionLine::HAlpha => "Ha",
            EmissionLine::HBeta => "Hb",
        }
    }
}

impl fmt::Display for EmissionLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for EmissionLine {
    type Err = SfrError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "ha" | "halpha" | "h-alpha" => Ok(EmissionLine::HAlpha),
            "hb" | "hbeta" | "h-beta" => Ok(EmissionLine::HBeta),
            _ => Err(SfrError::UnknownLine(s.to_string())),
        }
    }
}

/// One emission-line measurement of one spaxel.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PixelMeasurement {
    pub flux: Option<f64>,
    pub sigma: Option<f64>,
    pub snr: Option<f64>,
    /// False when the spaxel is flagged unusable for this line
    pub valid: bool,
}

impl PixelMeasurement {
    /// Non-finite numbers are stored as absent.
    pub fn new(flux: Option<f64>, sigma: Option<f64>, snr: Option<f64>, valid: bool) -> Self {
        let finite = |x: Option<f64>| x.filter(|v| v.is_finite());
        PixelMeasurement {
            flux: finite(flux),
            sigma: finite(sigma),
            snr: finite(snr),
            valid,
        }
    }

    /// Flux, or `None` when missing or flagged
    pub fn usable_flux(&self) -> Option<f64> {
        self.flux.filter(|_| self.valid)
    }

    /// Standard deviation, or `None` when missing, negative or flagged
    pub fn usable_sigma(&self) -> Option<f64> {
        self.sigma.filter(|s| self.valid && *s >= 0.0)
    }
}

/// Resolves the MaNGA `DONOTUSE` bit of both line masks into validity flags
/// `(ha_valid, hb_valid)`. A flagged Hα spaxel invalidates both lines, since the
/// Balmer decrement cannot be formed without it; a flagged Hβ spaxel only Hβ.
pub fn line_validity(ha_mask: u64, hb_mask: u64) -> (bool, bool) {
    let ha_valid = ha_mask & DONOTUSE == 0;
    let hb_valid = ha_valid && hb_mask & DONOTUSE == 0;
    (ha_valid, hb_valid)
}

/// BPT classification flags from the emission-line diagnostic diagrams
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BptLabels {
    pub comp: bool,
    pub agn: bool,
    pub seyfert: bool,
    pub liner: bool,
}

/// Galaxy Zoo 3D volunteer vote counts for one spaxel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ZooVotes {
    pub spiral: u32,
    pub center: u32,
    pub star: u32,
    pub bar: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SpiralClass {
    Spiral,
    NonSpiral,
    /// Center, foreground star or bar
    Excluded,
}

/// Vote thresholds deciding spiral membership.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Thresholds {
    /// A spaxel is spiral arm when it has more spiral votes than this
    pub spiral: u32,
    /// ... and is excluded when center, star or bar votes exceed this
    pub other: u32,
}

impl Default for Thresholds {
    fn default() -> Self {
        Thresholds {
            spiral: DEFAULT_SPIRAL_THRESHOLD,
            other: DEFAULT_OTHER_THRESHOLD,
        }
    }
}

impl Thresholds {
    pub fn classify(&self, votes: &ZooVotes) -> SpiralClass {
        let excluded =
            votes.center > self.other || votes.star > self.other || votes.bar > self.other;
        match (excluded, votes.spiral > self.spiral) {
            (true, _) => SpiralClass::Excluded,
            (false, true) => SpiralClass::Spiral,
            (false, false) => SpiralClass::NonSpiral,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Spaxel {
    pub ha: PixelMeasurement,
    pub hb: PixelMeasurement,
    pub bpt: BptLabels,
    pub votes: ZooVotes,
}

impl Spaxel {
    pub fn line(&self, line: EmissionLine) -> &PixelMeasurement {
        match line {
            EmissionLine::HAlpha => &self.ha,
            EmissionLine::HBeta => &self.hb,
        }
    }
}

/// All spaxels of one galaxy in row-major order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpaxelTable {
    grid: PixelGrid,
    spaxels: Vec<Spaxel>,
    /// Deprojected distance from the map centre, in spaxels
    radius: Vec<f64>,
}

impl SpaxelTable {
    pub fn new(grid: PixelGrid, spaxels: Vec<Spaxel>, geometry: &GalaxyGeometry) -> Result<Self> {
        if spaxels.len() != grid.pixels() {
            return Err(SfrError::ShapeMismatch {
                expected: grid.pixels(),
                found: spaxels.len(),
            });
        }
        let radius = elliptical_radius(grid, geometry.theta, geometry.axis_ratio)
            .iter()
            .copied()
            .collect();
        Ok(SpaxelTable {
            grid,
            spaxels,
            radius,
        })
    }

    pub fn grid(&self) -> PixelGrid {
        self.grid
    }

    pub fn spaxels(&self) -> &[Spaxel] {
        &self.spaxels
    }

    /// Usable fluxes of one line, `None` where missing or flagged
    pub fn values(&self, line: EmissionLine) -> Vec<Option<f64>> {
        self.spaxels
            .iter()
            .map(|s| s.line(line).usable_flux())
            .collect()
    }

    /// Usable standard deviations of one line, the input to the covariance builder
    pub fn errors(&self, line: EmissionLine) -> Vec<Option<f64>> {
        self.spaxels
            .iter()
            .map(|s| s.line(line).usable_sigma())
            .collect()
    }

    pub fn radius(&self) -> &[f64] {
        &self.radius
    }

    /// Radius in units of the effective radius (r / Re)
    pub fn scaled_radius(&self, geometry: &GalaxyGeometry) -> Vec<f64> {
        self.radius.iter().map(|r| r / geometry.eff_rad).collect()
    }

    pub fn classify(&self, thresholds: &Thresholds) -> Vec<SpiralClass> {
        self.spaxels
            .iter()
            .map(|s| thresholds.classify(&s.votes))
            .collect()
    }

    /// Indices of the spaxels satisfying `predicate`, possibly none
    pub fn select(&self, predicate: impl Fn(PixelIndex, &Spaxel) -> bool) -> Vec<PixelIndex> {
        self.spaxels
            .iter()
            .enumerate()
            .filter(|(i, s)| predicate(*i, s))
            .map(|(i, _)| i)
            .collect()
    }

    /// Bin of every spaxel in the given class. Fails with `EmptyBin` when there is none.
    pub fn class_bin(&self, class: SpiralClass, thresholds: &Thresholds) -> Result<Bin> {
        Bin::new(self.select(|_, s| thresholds.classify(&s.votes) == class))
    }
}

/// Distance of every spaxel from the map centre after deprojecting an inclined disk
/// with position angle `theta` (radians) and axis ratio `axis_ratio`.
pub fn elliptical_radius(grid: PixelGrid, theta: f64, axis_ratio: f64) -> Array2<f64> {
    let side = grid.side();
    let centre = (side as f64 - 1.0) / 2.0;

    Array2::from_shape_fn((side, side), |(y, x)| {
        // Vector from the centre with y pointing up
        let j = centre - y as f64;
        let i = x as f64 - centre;

        let angle = j.atan2(i) - theta;
        let length = (j * j + i * i).sqrt();
        length * (angle.cos().powi(2) + (angle.sin() / axis_ratio).powi(2)).sqrt()
    })
}

#[test]
fn test_line_labels_round_trip() {
    for line in EmissionLine::ALL {
        assert_eq!(line.label().parse::<EmissionLine>().unwrap(), line);
    }
    assert_eq!("HA".parse::<EmissionLine>().unwrap(), EmissionLine::HAlpha);
    assert!(matches!(
        "OIII".parse::<EmissionLine>(),
        Err(SfrError::UnknownLine(_))
    ));
}

#[test]
fn test_line_validity_from_masks() {
    assert_eq!(line_validity(0, 0), (true, true));
    assert_eq!(line_validity(DONOTUSE, 0), (false, false));
    assert_eq!(line_validity(0, DONOTUSE | 1), (true, false));
    // Bits other than DONOTUSE do not invalidate
    assert_eq!(line_validity(1 << 5, 1 << 4), (true, true));
}

#[test]
fn test_measurement_normalises_non_finite() {
    let m = PixelMeasurement::new(Some(f64::INFINITY), Some(f64::NAN), Some(3.0), true);
    assert_eq!(m.flux, None);
    assert_eq!(m.sigma, None);
    assert_eq!(m.snr, Some(3.0));

    let flagged = PixelMeasurement::new(Some(1.0), Some(0.1), None, false);
    assert_eq!(flagged.usable_flux(), None);
    assert_eq!(flagged.usable_sigma(), None);
}

#[test]
fn test_classification_thresholds() {
    let t = Thresholds::default();
    let votes = |spiral, center, star, bar| ZooVotes { spiral, center, star, bar };
    assert_eq!(t.classify(&votes(4, 0, 0, 0)), SpiralClass::Spiral);
    assert_eq!(t.classify(&votes(3, 0, 0, 0)), SpiralClass::NonSpiral);
    assert_eq!(t.classify(&votes(10, 4, 0, 0)), SpiralClass::Excluded);
    assert_eq!(t.classify(&votes(0, 0, 0, 4)), SpiralClass::Excluded);
    assert_eq!(t.classify(&votes(0, 3, 3, 3)), SpiralClass::NonSpiral);
}

#[test]
fn test_elliptical_radius_face_on() {
    use approx::assert_relative_eq;

    let grid = PixelGrid::new(5).unwrap();
    let r = elliptical_radius(grid, 0.0, 1.0);
    assert_eq!(r[[2, 2]], 0.0);
    assert_relative_eq!(r[[0, 0]], 8.0_f64.sqrt(), max_relative = 1e-14);
    assert_relative_eq!(r[[2, 4]], 2.0, max_relative = 1e-14);
}

#[test]
fn test_elliptical_radius_inclined() {
    use approx::assert_relative_eq;

    let grid = PixelGrid::new(5).unwrap();
    // Major axis along x: points on the minor axis are stretched by 1 / b/a
    let r = elliptical_radius(grid, 0.0, 0.5);
    assert_relative_eq!(r[[2, 4]], 2.0, max_relative = 1e-12);
    assert_relative_eq!(r[[0, 2]], 4.0, max_relative = 1e-12);
}
