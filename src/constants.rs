
/// Spaxel correlation is exactly zero at and beyond this grid distance (in spaxels).
pub const CORRELATION_CUTOFF: f64 = 6.4;

/// Characteristic length of the Gaussian correlation falloff (in spaxels).
pub const CORRELATION_SCALE: f64 = 1.9;

/// Multiplier applied to catalog fluxes and their uncertainties before they
/// enter the SFR power law.
pub const FLUX_SCALE: f64 = 1e-13;

/// Power-law exponents of the extinction-corrected SFR relation
/// sfr = delta * ha^3.36 * hb^-2.36
pub const HA_EXPONENT: f64 = 3.36;
pub const HB_EXPONENT: f64 = 2.36;

/// Intrinsic Balmer decrement used in the `delta` normalisation.
pub const BALMER_DECREMENT: f64 = 2.8;

/// log10 of the luminosity normalisation in the `delta` constant.
pub const LOG_LUMINOSITY_NORMALISATION: f64 = 41.1;

/// MaNGA DAP `DONOTUSE` mask bit (2^30).
pub const DONOTUSE: u64 = 1 << 30;

pub const SPEED_OF_LIGHT_KM_S: f64 = 299792.458;
pub const HUBBLE_CONSTANT: f64 = 70.0;
pub const METERS_PER_MPC: f64 = 3.085677581e22;

/// Angular size of one spaxel (0.5 arcsec) in radians.
pub const SPAXEL_ANGLE_RAD: f64 = 0.0000024240684055477;

/// Galaxy Zoo 3D vote thresholds used when the caller does not override them.
pub const DEFAULT_SPIRAL_THRESHOLD: u32 = 3;
pub const DEFAULT_OTHER_THRESHOLD: u32 = 3;
