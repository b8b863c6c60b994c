use approx::assert_relative_eq;
use spiral_sfr::aggregate::{aggregate, Bin, Estimate};
use spiral_sfr::batch::{process_galaxy, run_batch, BatchConfig};
use spiral_sfr::covariance::{build_covariance, PixelGrid};
use spiral_sfr::kernel::Kernel;
use spiral_sfr::sfr::estimate_sfr;
use spiral_sfr::spaxels::{EmissionLine, SpiralClass, Thresholds};
use spiral_sfr::utils::io::{CovarianceCache, CovarianceStore, DiskDB, FileStore};
use spiral_sfr::utils::loader::{load_galaxy, read_catalog};
use std::fmt::Write;
use std::path::Path;

const SIDE: usize = 4;

/// 3x3 grid, unit errors, flat values and a kernel whose cutoff spans the whole grid.
/// The variance of the full sum is the sum of all 81 correlations, grouped here by
/// the number of ordered pairs at each separation.
#[test]
fn test_three_by_three_full_bin() {
    let scale: f64 = 1.5;
    let kernel = Kernel::new(10.0, scale).unwrap();
    let grid = PixelGrid::new(3).unwrap();
    let covariance = build_covariance(grid, &vec![Some(1.0); 9], &kernel).unwrap();

    let rho = |d2: f64| (-0.5 * d2 / (scale * scale)).exp();
    let expected_variance = 9.0
        + 24.0 * rho(1.0)
        + 16.0 * rho(2.0)
        + 12.0 * rho(4.0)
        + 16.0 * rho(5.0)
        + 4.0 * rho(8.0);

    assert_eq!(covariance.nnz(), 81);
    assert_relative_eq!(covariance.total(), expected_variance, max_relative = 1e-12);

    let bin = Bin::new(0..9).unwrap();
    let estimate = aggregate(&bin, &vec![Some(1.0); 9], &covariance, false).unwrap();
    assert_eq!(estimate.value, 9.0);
    assert_relative_eq!(estimate.variance(), expected_variance, max_relative = 1e-12);

    let mean = aggregate(&bin, &vec![Some(1.0); 9], &covariance, true).unwrap();
    assert_eq!(mean.value, 1.0);
    assert_relative_eq!(mean.uncertainty, expected_variance.sqrt() / 9.0, max_relative = 1e-12);
}

/// Correlated errors always widen the uncertainty of a sum of positively correlated
/// spaxels compared with treating them as independent.
#[test]
fn test_correlation_widens_uncertainty() {
    let grid = PixelGrid::new(10).unwrap();
    let errors = vec![Some(0.5); 100];
    let values = vec![Some(2.0); 100];
    let bin = Bin::new((0..100).filter(|i| i % 10 < 5)).unwrap();

    let correlated = build_covariance(grid, &errors, &Kernel::default()).unwrap();
    let independent = build_covariance(grid, &errors, &Kernel::new(0.5, 1.9).unwrap()).unwrap();

    let wide = aggregate(&bin, &values, &correlated, false).unwrap();
    let narrow = aggregate(&bin, &values, &independent, false).unwrap();
    assert_eq!(wide.value, narrow.value);
    assert_relative_eq!(narrow.uncertainty, (50.0 * 0.25_f64).sqrt(), max_relative = 1e-12);
    assert!(wide.uncertainty > narrow.uncertainty);
}

fn write_inputs(dir: &Path) {
    let mut catalog = String::from("file_name,z,elpetro_th50_r,elpetro_phi,elpetro_ba,side\n");
    writeln!(catalog, "1-100_a.fits.gz,0.03,6.0,120.0,0.7,{SIDE}").unwrap();
    writeln!(catalog, "1-200_b.fits.gz,0.04,5.0,45.0,0.5,{SIDE}").unwrap();
    std::fs::write(dir.join("catalog.csv"), catalog).unwrap();

    // Only the first galaxy has a spaxel table
    let mut spaxels = String::from(
        "idx,ha,sig_ha,sn_ha,ha_mask,hb,sig_hb,sn_hb,hb_mask,comp,agn,seyfert,liner,spiral_votes,center_votes,star_votes,bar_votes\n",
    );
    for i in 0..SIDE * SIDE {
        let ha = 100.0 + i as f64;
        let hb = 30.0 + 0.5 * i as f64;
        let spiral_votes = if i < 8 { 5 } else { 0 };
        let bar_votes = if i == 15 { 4 } else { 0 };
        writeln!(
            spaxels,
            "{i},{ha},5.0,20,0,{hb},2.0,15,0,0,0,0,0,{spiral_votes},0,0,{bar_votes}"
        )
        .unwrap();
    }
    std::fs::write(dir.join("1-100_a.fits.gz.csv"), spaxels).unwrap();
}

fn config(dir: &Path) -> BatchConfig {
    BatchConfig {
        input_dir: dir.to_path_buf(),
        thresholds: Thresholds::default(),
        kernel: Kernel::default(),
        average: false,
    }
}

#[test]
fn test_batch_reports_each_galaxy() {
    let inputs = tempfile::tempdir().unwrap();
    let cache_dir = tempfile::tempdir().unwrap();
    write_inputs(inputs.path());

    let catalog = read_catalog(inputs.path().join("catalog.csv")).unwrap();
    let cache = CovarianceCache::new(FileStore::new(cache_dir.path()).unwrap());
    let report = run_batch(&catalog, &config(inputs.path()), &cache);

    assert_eq!(report.outcomes.len(), 2);
    assert_eq!(report.outcomes[0].file_name, "1-100_a.fits.gz");

    let (name, sfr) = report.succeeded().next().expect("first galaxy should succeed");
    assert_eq!(name, "1-100_a.fits.gz");
    let spiral = sfr.spiral.expect("spiral region");
    let nonspiral = sfr.nonspiral.expect("non-spiral region");
    assert_eq!(spiral.spaxels, 8);
    // One spaxel is excluded by its bar votes
    assert_eq!(nonspiral.spaxels, 7);
    for region in [spiral, nonspiral] {
        assert!(region.sfr.value > 0.0 && region.sfr.value.is_finite());
        assert!(region.sfr.uncertainty > 0.0 && region.sfr.uncertainty.is_finite());
    }

    let failed: Vec<_> = report.failed().collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].0, "1-200_b.fits.gz");

    // Both lines of the successful galaxy are now cached
    assert_eq!(
        cache.store().keys().unwrap(),
        vec!["1-100_a.fits.gz.Ha".to_string(), "1-100_a.fits.gz.Hb".to_string()]
    );

    // A second run loads the cached matrices and reproduces the numbers
    let again = process_galaxy(&catalog[0], &config(inputs.path()), &cache).unwrap();
    assert_eq!(again, *sfr);
}

#[test]
fn test_galaxy_sfr_matches_manual_composition() {
    let inputs = tempfile::tempdir().unwrap();
    let cache_dir = tempfile::tempdir().unwrap();
    write_inputs(inputs.path());

    let catalog = read_catalog(inputs.path().join("catalog.csv")).unwrap();
    let galaxy = load_galaxy(&catalog[0], inputs.path()).unwrap();
    let cache = CovarianceCache::new(DiskDB::connect(cache_dir.path()).unwrap());
    let kernel = Kernel::default();
    let thresholds = Thresholds::default();
    let bin = galaxy.table.class_bin(SpiralClass::Spiral, &thresholds).unwrap();

    for average in [false, true] {
        let sfr = galaxy.sfr(&bin, &cache, &kernel, average).unwrap();

        let measure = |line: EmissionLine| -> Estimate {
            let covariance =
                build_covariance(galaxy.grid(), &galaxy.table.errors(line), &kernel).unwrap();
            aggregate(&bin, &galaxy.table.values(line), &covariance, average).unwrap()
        };
        let area = if average { Some(galaxy.constants.spax_area) } else { None };
        let expected = estimate_sfr(
            measure(EmissionLine::HAlpha),
            measure(EmissionLine::HBeta),
            galaxy.constants.delta,
            area,
        );
        assert_relative_eq!(sfr.value, expected.value, max_relative = 1e-12);
        assert_relative_eq!(sfr.uncertainty, expected.uncertainty, max_relative = 1e-12);
    }

    let ha = galaxy
        .emission(&bin, EmissionLine::HAlpha, &cache, &kernel, false)
        .unwrap();
    // Spiral spaxels are 0..8 with fluxes 100..107
    assert_eq!(ha.value, (100..108).sum::<i32>() as f64);
}

#[test]
fn test_changing_kernel_does_not_reuse_cached_matrices() {
    let inputs = tempfile::tempdir().unwrap();
    let cache_dir = tempfile::tempdir().unwrap();
    write_inputs(inputs.path());

    let catalog = read_catalog(inputs.path().join("catalog.csv")).unwrap();
    let galaxy = load_galaxy(&catalog[0], inputs.path()).unwrap();
    let bin = galaxy.table.class_bin(SpiralClass::Spiral, &Thresholds::default()).unwrap();

    let first = CovarianceCache::new(FileStore::new(cache_dir.path()).unwrap());
    let wide = galaxy
        .emission(&bin, EmissionLine::HAlpha, &first, &Kernel::default(), false)
        .unwrap();

    // A later run over the same cache directory with an uncorrelated kernel
    let narrow = Kernel::new(0.5, 1.9).unwrap();
    let second = CovarianceCache::new(FileStore::new(cache_dir.path()).unwrap());
    let independent = galaxy
        .emission(&bin, EmissionLine::HAlpha, &second, &narrow, false)
        .unwrap();

    // Every spaxel has sigma 5, so eight independent spaxels give sqrt(8 * 25)
    assert_relative_eq!(independent.uncertainty, 200.0_f64.sqrt(), max_relative = 1e-12);
    assert!(wide.uncertainty > independent.uncertainty);
    assert_eq!(second.store().keys().unwrap().len(), 2);
}
