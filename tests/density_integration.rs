use approx::assert_abs_diff_eq;
use denim::{BmtiConfig, DeltaFErrorMode, DensityAdvanced, LogDensityPrior, NeighborGraph};
use ndarray::{Array1, Array2};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};

fn gaussian_samples(n: usize, seed: u64) -> Array2<f64> {
    let mut rng = StdRng::seed_from_u64(seed);
    let normal = Normal::new(0.0, 1.0).expect("normal params must be valid");
    Array2::from_shape_fn((n, 2), |_| normal.sample(&mut rng))
}

fn knn_graph(coords: &Array2<f64>, k: usize) -> NeighborGraph {
    let n = coords.nrows();
    let neighbors: Vec<Vec<usize>> = (0..n)
        .map(|i| {
            let mut order: Vec<(f64, usize)> = (0..n)
                .filter(|&j| j != i)
                .map(|j| {
                    let d = &coords.row(j) - &coords.row(i);
                    (d.dot(&d), j)
                })
                .collect();
            order.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
            order.iter().take(k).map(|&(_, j)| j).collect()
        })
        .collect();
    NeighborGraph::from_neighbor_lists(coords.view(), &neighbors, 2).expect("valid knn graph")
}

fn pearson(a: &Array1<f64>, b: &Array1<f64>) -> f64 {
    let (ma, mb) = (a.mean().unwrap_or(0.0), b.mean().unwrap_or(0.0));
    let (mut sab, mut saa, mut sbb) = (0.0, 0.0, 0.0);
    for (x, y) in a.iter().zip(b.iter()) {
        sab += (x - ma) * (y - mb);
        saa += (x - ma) * (x - ma);
        sbb += (y - mb) * (y - mb);
    }
    sab / (saa * sbb).sqrt()
}

#[test]
fn regularized_bmti_tracks_gaussian_log_density() {
    let coords = gaussian_samples(100, 20260301);
    let graph = knn_graph(&coords, 10);
    let truth = Array1::from_iter(coords.rows().into_iter().map(|x| -0.5 * x.dot(&x)));

    let mut density = DensityAdvanced::new(&graph);
    let config = BmtiConfig {
        alpha: 0.5,
        comp_log_den_err: true,
        ..BmtiConfig::default()
    };
    let estimate = density.estimate(&config, None).expect("bmti solve");
    let r = pearson(&estimate.log_den, &truth);
    assert!(r > 0.9, "correlation with the true log-density was {r}");

    let err = estimate.log_den_err.as_ref().expect("errors requested");
    assert!(err.iter().all(|e| e.is_finite() && *e > 0.0));

    // The k*-NN prior was filled along the way.
    let knn = density.kstar_prior().expect("prior cached");
    assert_eq!(knn.len(), 100);
    assert!(pearson(&knn.log_den, &truth) > 0.5);
}

#[test]
fn dense_and_sparse_solves_agree() {
    let coords = gaussian_samples(120, 7);
    let graph = knn_graph(&coords, 8);
    let mut density = DensityAdvanced::new(&graph);

    let dense = density
        .compute_density_bmti_reg(0.3, None, DeltaFErrorMode::Uncorrelated, false, false)
        .expect("dense")
        .log_den
        .clone();
    let sparse = density
        .compute_density_bmti_reg(0.3, None, DeltaFErrorMode::Uncorrelated, false, true)
        .expect("sparse")
        .log_den
        .clone();
    for (d, s) in dense.iter().zip(sparse.iter()) {
        assert_abs_diff_eq!(*d, *s, epsilon = 1e-8);
    }
}

#[test]
fn pure_graph_estimate_is_centered_for_every_weighting() {
    let coords = gaussian_samples(80, 11);
    let graph = knn_graph(&coords, 6);
    let mut density = DensityAdvanced::new(&graph);

    for mode in [
        DeltaFErrorMode::Uncorrelated,
        DeltaFErrorMode::Lsdi,
        DeltaFErrorMode::Unweighted,
    ] {
        let estimate = density
            .compute_density_bmti(mode, false, true)
            .expect("pure graph solve");
        assert_eq!(estimate.alpha, 1.0);
        assert!(estimate.log_den.iter().all(|v| v.is_finite()));
        let mean = estimate.log_den.mean().unwrap_or(f64::NAN);
        assert_abs_diff_eq!(mean, 0.0, epsilon = 1e-8);
    }
    assert!(density.inv_cross_covariance().is_some());
}

#[test]
fn explicit_prior_dominates_small_alpha() {
    let coords = gaussian_samples(60, 3);
    let graph = knn_graph(&coords, 5);
    let target = Array1::from_iter((0..60).map(|i| (i as f64 * 0.37).sin()));
    let prior = LogDensityPrior::new(target.clone(), Array1::from_elem(60, 0.1));

    let mut density = DensityAdvanced::new(&graph);
    let estimate = density
        .compute_density_bmti_reg(1e-9, Some(prior), DeltaFErrorMode::Uncorrelated, false, false)
        .expect("regularized solve");
    for (v, t) in estimate.log_den.iter().zip(target.iter()) {
        assert_abs_diff_eq!(*v, *t, epsilon = 1e-3);
    }
}

#[test]
fn config_round_trips_through_json() {
    let config: BmtiConfig =
        serde_json::from_str(r#"{"alpha": 0.25, "delta_f_err": "LSDI", "mem_efficient": true}"#)
            .expect("valid config");
    assert_eq!(config.alpha, 0.25);
    assert_eq!(config.delta_f_err, DeltaFErrorMode::Lsdi);
    assert!(config.mem_efficient);
    assert!(!config.comp_log_den_err);

    let text = serde_json::to_string(&config).expect("serializable");
    let back: BmtiConfig = serde_json::from_str(&text).expect("round trip");
    assert_eq!(back, config);
}
