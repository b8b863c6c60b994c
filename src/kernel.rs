use crate::constants::{CORRELATION_CUTOFF, CORRELATION_SCALE};
use crate::error::{Result, SfrError};
use serde_derive::{Deserialize, Serialize};

/// Truncated Gaussian correlation between two spaxels as a function of their
/// separation on the grid.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Kernel {
    /// Separations at or beyond this are exactly uncorrelated
    pub cutoff: f64,
    /// Gaussian width
    pub scale: f64,
}

impl Default for Kernel {
    fn default() -> Self {
        Kernel {
            cutoff: CORRELATION_CUTOFF,
            scale: CORRELATION_SCALE,
        }
    }
}

impl Kernel {
    /// `cutoff` may be infinite but not NaN. `scale` must be finite and positive.
    pub fn new(cutoff: f64, scale: f64) -> Result<Self> {
        if cutoff.is_nan() {
            return Err(SfrError::InvalidArgument(
                "correlation cutoff is NaN".to_string(),
            ));
        }
        if !(scale.is_finite() && scale > 0.0) {
            return Err(SfrError::InvalidArgument(format!(
                "correlation scale must be finite and positive, got {scale}"
            )));
        }
        Ok(Kernel { cutoff, scale })
    }

    /// Correlation coefficient in [0, 1] for a pair of spaxels `distance` apart.
    pub fn correlation(&self, distance: f64) -> f64 {
        if distance >= self.cutoff {
            return 0.0;
        }
        (-0.5 * (distance / self.scale).powi(2)).exp()
    }

    /// Grid offsets `(d_row, d_col, rho)` with non-zero correlation that point "forward"
    /// in row-major order, i.e. to a strictly larger linear index. Offsets are limited to
    /// `max_reach` in either direction.
    ///
    /// Every unordered pair of distinct spaxels is reached by exactly one of these offsets
    /// from its lower-indexed member, so walking them visits each pair once.
    pub fn forward_offsets(&self, max_reach: usize) -> Vec<(isize, isize, f64)> {
        // Square enclosing the cutoff disk
        let reach = if self.cutoff.is_finite() {
            (self.cutoff.max(0.0).ceil() as usize).min(max_reach)
        } else {
            max_reach
        } as isize;

        let mut offsets = Vec::new();
        for d_row in 0..=reach {
            for d_col in -reach..=reach {
                if d_row == 0 && d_col <= 0 {
                    continue;
                }
                let distance = ((d_row * d_row + d_col * d_col) as f64).sqrt();
                let rho = self.correlation(distance);
                if rho > 0.0 {
                    offsets.push((d_row, d_col, rho));
                }
            }
        }
        offsets
    }
}

/// Correlation under the default kernel (cutoff 6.4, scale 1.9).
pub fn correlation(distance: f64) -> f64 {
    Kernel::default().correlation(distance)
}

#[test]
fn test_kernel_unity_at_zero() {
    assert_eq!(correlation(0.0), 1.0);
}

#[test]
fn test_kernel_zero_at_and_beyond_cutoff() {
    for d in [6.4, 6.41, 7.0, 100.0, f64::INFINITY] {
        assert_eq!(correlation(d), 0.0, "kernel should vanish at {d}");
    }
    // Just inside the cutoff it is small but not zero
    assert!(correlation(6.39) > 0.0);
}

#[test]
fn test_kernel_monotone_inside_cutoff() {
    let samples: Vec<f64> = (0..640).map(|i| i as f64 * 0.01).collect();
    for pair in samples.windows(2) {
        assert!(correlation(pair[0]) >= correlation(pair[1]));
    }
}

#[test]
fn test_kernel_matches_gaussian() {
    use approx::assert_relative_eq;

    // One characteristic length away
    assert_relative_eq!(correlation(1.9), (-0.5_f64).exp(), epsilon = 1e-15);
    assert_relative_eq!(
        correlation(2.0_f64.sqrt()),
        (-0.5 * 2.0 / (1.9 * 1.9_f64)).exp(),
        epsilon = 1e-15
    );
}

#[test]
fn test_forward_offsets_cover_each_pair_once() {
    let kernel = Kernel::default();
    let offsets = kernel.forward_offsets(100);

    // Forward offsets are exactly half of the punctured disk
    let full_disk = (-7_isize..=7)
        .flat_map(|r| (-7_isize..=7).map(move |c| (r, c)))
        .filter(|&(r, c)| (r, c) != (0, 0))
        .filter(|&(r, c)| (((r * r + c * c) as f64).sqrt()) < 6.4)
        .count();
    assert_eq!(offsets.len() * 2, full_disk);

    for &(r, c, rho) in &offsets {
        assert!(r > 0 || (r == 0 && c > 0));
        assert!(!offsets.iter().any(|&(r2, c2, _)| (r2, c2) == (-r, -c)));
        assert!(rho > 0.0 && rho < 1.0);
    }
}

#[test]
fn test_forward_offsets_clipped_to_grid() {
    let offsets = Kernel::default().forward_offsets(1);
    // (0,1), (1,-1), (1,0), (1,1)
    assert_eq!(offsets.len(), 4);
}

#[test]
fn test_kernel_rejects_bad_parameters() {
    for (cutoff, scale) in [
        (f64::NAN, 1.9),
        (6.4, f64::NAN),
        (6.4, 0.0),
        (6.4, -1.0),
        (6.4, f64::INFINITY),
    ] {
        assert!(
            matches!(Kernel::new(cutoff, scale), Err(SfrError::InvalidArgument(_))),
            "cutoff {cutoff}, scale {scale} should be rejected"
        );
    }
    assert_eq!(Kernel::new(6.4, 1.9).unwrap(), Kernel::default());
    assert!(Kernel::new(f64::INFINITY, 1.0).is_ok());
}
