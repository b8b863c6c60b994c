use crate::aggregate::Estimate;
use crate::constants::*;
use log::debug;

/// Converts binned Hα and Hβ fluxes into a star-formation rate with first-order
/// (delta method) error propagation:
///
/// sfr = delta * ha^3.36 * hb^-2.36
///
/// The two lines are propagated as independent; their spatial correlation is already
/// folded into each flux uncertainty. Fluxes are in catalog units and are rescaled by
/// `FLUX_SCALE` first. With `spax_area`, the rate is turned into a surface density.
///
/// A zero flux on either line, or any input that would make the power law non-finite,
/// gives a zero estimate rather than NaN or infinity.
pub fn estimate_sfr(ha: Estimate, hb: Estimate, delta: f64, spax_area: Option<f64>) -> Estimate {
    if ha.value == 0.0 || hb.value == 0.0 {
        debug!("zero flux (ha = {}, hb = {}), returning zero SFR", ha.value, hb.value);
        return Estimate::ZERO;
    }

    let ha_flux = ha.value * FLUX_SCALE;
    let hb_flux = hb.value * FLUX_SCALE;
    let ha_unc = ha.uncertainty * FLUX_SCALE;
    let hb_unc = hb.uncertainty * FLUX_SCALE;

    let sfr = delta * ha_flux.powf(HA_EXPONENT) * hb_flux.powf(-HB_EXPONENT);

    // Partial derivatives of the power law times each line's uncertainty
    let d_ha = HA_EXPONENT * delta * ha_flux.powf(HA_EXPONENT - 1.0) * hb_flux.powf(-HB_EXPONENT) * ha_unc;
    let d_hb = HB_EXPONENT * delta * ha_flux.powf(HA_EXPONENT) * hb_flux.powf(-HB_EXPONENT - 1.0) * hb_unc;
    let sfr_unc = (d_ha.powi(2) + d_hb.powi(2)).sqrt();

    let (sfr, sfr_unc) = match spax_area {
        Some(area) => (sfr / area, sfr_unc / area),
        None => (sfr, sfr_unc),
    };

    if !sfr.is_finite() || !sfr_unc.is_finite() {
        debug!(
            "non-finite SFR from ha = {:?}, hb = {:?}, returning zero SFR",
            ha, hb
        );
        return Estimate::ZERO;
    }

    Estimate::new(sfr, sfr_unc)
}

#[test]
fn test_zero_flux_guard() {
    let other = Estimate::new(12.0, 1.5);
    assert_eq!(estimate_sfr(Estimate::new(0.0, 3.0), other, 1e8, None), Estimate::ZERO);
    assert_eq!(estimate_sfr(other, Estimate::new(0.0, 3.0), 1e8, None), Estimate::ZERO);
    assert_eq!(estimate_sfr(Estimate::ZERO, Estimate::ZERO, 1e8, Some(2.0)), Estimate::ZERO);
}

#[test]
fn test_negative_flux_never_leaks_nan() {
    let sfr = estimate_sfr(Estimate::new(10.0, 1.0), Estimate::new(-3.0, 1.0), 1e8, None);
    assert_eq!(sfr, Estimate::ZERO);

    let sfr = estimate_sfr(Estimate::new(f64::NAN, 1.0), Estimate::new(3.0, 1.0), 1e8, None);
    assert_eq!(sfr, Estimate::ZERO);
}

#[test]
fn test_power_law_value() {
    use approx::assert_relative_eq;

    let delta = 1.3e8;
    let ha = Estimate::new(120.0, 4.0);
    let hb = Estimate::new(35.0, 2.5);
    let sfr = estimate_sfr(ha, hb, delta, None);

    let (a, b) = (120.0e-13_f64, 35.0e-13_f64);
    let expected = delta * a.powf(3.36) / b.powf(2.36);
    assert_relative_eq!(sfr.value, expected, max_relative = 1e-12);

    // Relative uncertainties add in quadrature weighted by the exponents
    let relative = ((3.36 * 4.0 / 120.0_f64).powi(2) + (2.36 * 2.5 / 35.0_f64).powi(2)).sqrt();
    assert_relative_eq!(sfr.uncertainty, expected * relative, max_relative = 1e-12);
}

#[test]
fn test_surface_density() {
    use approx::assert_relative_eq;

    let ha = Estimate::new(80.0, 3.0);
    let hb = Estimate::new(25.0, 2.0);
    let rate = estimate_sfr(ha, hb, 2e8, None);
    let density = estimate_sfr(ha, hb, 2e8, Some(0.25));
    assert_relative_eq!(density.value, rate.value * 4.0, max_relative = 1e-14);
    assert_relative_eq!(density.uncertainty, rate.uncertainty * 4.0, max_relative = 1e-14);
}

#[test]
fn test_unit_uncertainty_scales_linearly() {
    use approx::assert_relative_eq;

    let hb = Estimate::new(25.0, 0.0);
    let one = estimate_sfr(Estimate::new(80.0, 1.0), hb, 2e8, None);
    let two = estimate_sfr(Estimate::new(80.0, 2.0), hb, 2e8, None);
    assert_eq!(one.value, two.value);
    assert_relative_eq!(two.uncertainty, 2.0 * one.uncertainty, max_relative = 1e-14);
}
