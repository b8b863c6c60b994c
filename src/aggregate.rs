use crate::covariance::CovarianceMatrix;
use crate::error::{Result, SfrError};
use crate::PixelIndex;
use serde_derive::{Deserialize, Serialize};

/// A non-empty set of spaxel indices that are summed (or averaged) together,
/// e.g. every spaxel classified as spiral arm.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bin {
    // Sorted, no duplicates
    members: Vec<PixelIndex>,
}

impl Bin {
    /// Collects `indices` into a bin. Order does not matter and repeats collapse.
    /// An empty bin is rejected with `SfrError::EmptyBin`.
    pub fn new(indices: impl IntoIterator<Item = PixelIndex>) -> Result<Self> {
        let mut members: Vec<PixelIndex> = indices.into_iter().collect();
        members.sort_unstable();
        members.dedup();

        if members.is_empty() {
            return Err(SfrError::EmptyBin);
        }
        Ok(Bin { members })
    }

    /// Bin of every index where `mask` is set
    pub fn from_mask(mask: &[bool]) -> Result<Self> {
        Self::new(mask.iter().enumerate().filter(|&(_, &m)| m).map(|(i, _)| i))
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn members(&self) -> &[PixelIndex] {
        &self.members
    }

    pub fn contains(&self, index: PixelIndex) -> bool {
        self.members.binary_search(&index).is_ok()
    }
}

/// A value together with its one-sigma uncertainty
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Estimate {
    pub value: f64,
    pub uncertainty: f64,
}

impl Estimate {
    pub const ZERO: Estimate = Estimate {
        value: 0.0,
        uncertainty: 0.0,
    };

    pub fn new(value: f64, uncertainty: f64) -> Self {
        Estimate { value, uncertainty }
    }

    pub fn variance(&self) -> f64 {
        self.uncertainty * self.uncertainty
    }
}

/// Sums `values` over `bin` and propagates the uncertainty through the full covariance,
/// `var = w^T C w` with `w` the indicator vector of the bin.
///
/// Spaxels without a value are left out of the sum and get zero weight in the variance.
/// With `average`, both the sum and its uncertainty are divided by the number of
/// spaxels in the bin.
pub fn aggregate(
    bin: &Bin,
    values: &[Option<f64>],
    covariance: &CovarianceMatrix,
    average: bool,
) -> Result<Estimate> {
    let dim = covariance.dim();
    if values.len() != dim {
        return Err(SfrError::ShapeMismatch {
            expected: dim,
            found: values.len(),
        });
    }
    if let Some(&index) = bin.members().last().filter(|&&i| i >= dim) {
        return Err(SfrError::IndexOutOfRange { index, pixels: dim });
    }

    // Indicator vector of the spaxels that actually contribute
    let mut weight = vec![false; dim];
    let mut sum = 0.0;
    for &i in bin.members() {
        if let Some(value) = values[i].filter(|v| v.is_finite()) {
            weight[i] = true;
            sum += value;
        }
    }

    // Quadratic form restricted to the weighted columns and rows
    let variance: f64 = bin
        .members()
        .iter()
        .filter(|&&col| weight[col])
        .map(|&col| {
            covariance
                .column(col)
                .filter(|&(row, _)| weight[row])
                .map(|(_, value)| value)
                .sum::<f64>()
        })
        .sum();

    let uncertainty = variance.max(0.0).sqrt();

    if average {
        let n = bin.len() as f64;
        return Ok(Estimate::new(sum / n, uncertainty / n));
    }
    Ok(Estimate::new(sum, uncertainty))
}

#[cfg(test)]
use crate::{covariance::{build_covariance, PixelGrid}, kernel::Kernel};

#[test]
fn test_bin_dedups_and_sorts() {
    let bin = Bin::new([5, 1, 5, 3]).unwrap();
    assert_eq!(bin.members(), &[1, 3, 5]);
    assert_eq!(bin.len(), 3);
    assert!(bin.contains(3));
    assert!(!bin.contains(2));
}

#[test]
fn test_empty_bin_is_an_error() {
    assert!(matches!(Bin::new(Vec::new()), Err(SfrError::EmptyBin)));
    assert!(matches!(Bin::from_mask(&[false; 4]), Err(SfrError::EmptyBin)));
}

#[test]
fn test_single_pixel_bin() {
    let grid = PixelGrid::new(7).unwrap();
    let errors: Vec<Option<f64>> = (0..49).map(|i| Some(0.1 * (i + 1) as f64)).collect();
    let values: Vec<Option<f64>> = (0..49).map(|i| Some(i as f64)).collect();
    let covariance = build_covariance(grid, &errors, &Kernel::default()).unwrap();

    let estimate = aggregate(&Bin::new([24]).unwrap(), &values, &covariance, false).unwrap();
    assert_eq!(estimate.value, 24.0);
    assert_eq!(estimate.uncertainty, covariance.get(24, 24).sqrt());
}

#[test]
fn test_pair_variance_includes_cross_term() {
    use approx::assert_relative_eq;

    let grid = PixelGrid::new(4).unwrap();
    let kernel = Kernel::default();
    let errors = vec![Some(2.0); 16];
    let values = vec![Some(1.0); 16];
    let covariance = build_covariance(grid, &errors, &kernel).unwrap();

    let estimate = aggregate(&Bin::new([0, 1]).unwrap(), &values, &covariance, false).unwrap();
    let expected = 4.0 + 4.0 + 2.0 * 4.0 * kernel.correlation(1.0);
    assert_eq!(estimate.value, 2.0);
    assert_relative_eq!(estimate.variance(), expected, max_relative = 1e-12);
}

#[test]
fn test_averaging_scales_by_bin_size() {
    use approx::assert_relative_eq;

    let grid = PixelGrid::new(9).unwrap();
    let errors: Vec<Option<f64>> = (0..81).map(|i| Some(0.5 + (i % 4) as f64)).collect();
    let values: Vec<Option<f64>> = (0..81).map(|i| Some((i % 11) as f64 - 2.0)).collect();
    let covariance = build_covariance(grid, &errors, &Kernel::default()).unwrap();
    let bin = Bin::new((10..40).step_by(3)).unwrap();
    let n = bin.len() as f64;

    let total = aggregate(&bin, &values, &covariance, false).unwrap();
    let mean = aggregate(&bin, &values, &covariance, true).unwrap();
    assert_relative_eq!(mean.value, total.value / n, max_relative = 1e-14);
    assert_relative_eq!(mean.uncertainty, total.uncertainty / n, max_relative = 1e-14);
}

#[test]
fn test_missing_values_have_zero_weight() {
    use approx::assert_relative_eq;

    let grid = PixelGrid::new(3).unwrap();
    let covariance = build_covariance(grid, &vec![Some(1.0); 9], &Kernel::default()).unwrap();
    let mut values = vec![Some(2.0); 9];
    values[1] = None;

    let estimate = aggregate(&Bin::new([0, 1]).unwrap(), &values, &covariance, false).unwrap();
    assert_eq!(estimate.value, 2.0);
    assert_relative_eq!(estimate.uncertainty, 1.0, max_relative = 1e-15);
}

#[test]
fn test_aggregate_rejects_bad_shapes() {
    let grid = PixelGrid::new(3).unwrap();
    let covariance = build_covariance(grid, &vec![Some(1.0); 9], &Kernel::default()).unwrap();

    let short = vec![Some(1.0); 8];
    assert!(matches!(
        aggregate(&Bin::new([0]).unwrap(), &short, &covariance, false),
        Err(SfrError::ShapeMismatch { .. })
    ));

    let values = vec![Some(1.0); 9];
    assert!(matches!(
        aggregate(&Bin::new([2, 9]).unwrap(), &values, &covariance, false),
        Err(SfrError::IndexOutOfRange { index: 9, pixels: 9 })
    ));
}
