use denim::{DiffImbalance, DiffImbalanceConfig, OptimizerKind, SmoothingPolicy};
use ndarray::{Array2, Axis};
use rand::rngs::StdRng;
use rand::{RngExt, SeedableRng};

/// Space A carries the two target coordinates plus one irrelevant feature of
/// the same scale.
fn spaces_with_noise(n: usize, seed: u64) -> (Array2<f64>, Array2<f64>) {
    let mut rng = StdRng::seed_from_u64(seed);
    let a = Array2::from_shape_fn((n, 3), |_| rng.random_range(-1.0..1.0));
    let b = a.select(Axis(1), &[0, 1]);
    (a, b)
}

#[test]
fn irrelevant_feature_weight_shrinks() {
    let (a, b) = spaces_with_noise(60, 20260401);
    let config = DiffImbalanceConfig {
        num_epochs: 60,
        optimizer_name: OptimizerKind::Adam,
        learning_rate: 0.02,
        seed: 9,
        ..Default::default()
    };
    let mut dii = DiffImbalance::new(a.view(), b.view(), config).expect("valid config");
    let trajectory = dii.train().expect("training runs");

    assert_eq!(trajectory.len(), 61);
    assert_eq!(trajectory.params.dim(), (61, 3));
    let last = trajectory.final_params();
    let relevant = last[0].abs().min(last[1].abs());
    assert!(
        last[2].abs() < 0.5 * relevant,
        "noise weight {} vs relevant weights {last}",
        last[2]
    );
    assert!(trajectory.imbalances[60] < trajectory.imbalances[0]);
}

#[test]
fn l1_keeps_the_irrelevant_feature_smallest() {
    let (a, b) = spaces_with_noise(40, 5);
    let config = DiffImbalanceConfig {
        num_epochs: 40,
        batches_per_epoch: 2,
        optimizer_name: OptimizerKind::Adam,
        learning_rate: 0.02,
        learning_rate_decay: false,
        l1_strength: 0.1,
        ..Default::default()
    };
    let mut dii = DiffImbalance::new(a.view(), b.view(), config).expect("valid config");
    let trajectory = dii.train().expect("training runs");
    let last = trajectory.final_params();
    assert!(last.iter().all(|w| w.is_finite()));
    assert!(
        last[2].abs() < last[0].abs().min(last[1].abs()),
        "noise weight {} vs {last}",
        last[2]
    );
}

#[test]
fn error_mode_reports_statistical_errors() {
    let (a, b) = spaces_with_noise(40, 13);
    let config = DiffImbalanceConfig {
        compute_error: true,
        ratio_rows_columns: 0.5,
        num_epochs: 5,
        lambda_init: Some(0.5),
        lambda_final: Some(0.05),
        ..Default::default()
    };
    let mut dii = DiffImbalance::new(a.view(), b.view(), config).expect("valid config");
    assert_eq!(dii.n_rows(), 10);
    assert_eq!(dii.max_rank(), 30);
    assert!(matches!(dii.policy(), SmoothingPolicy::FixedGlobal { .. }));
    let trajectory = dii.train().expect("training runs");
    assert!(trajectory.errors.iter().all(|e| e.is_finite() && *e > 0.0));
    assert!(trajectory.imbalances.iter().all(|v| *v > 0.0 && *v < 1.5));
}

#[test]
fn config_is_read_from_json_with_defaults() {
    let config: DiffImbalanceConfig = serde_json::from_str(
        r#"{"num_epochs": 3, "optimizer_name": "adamw", "k_init": 5, "k_final": 1, "periods_a": [0.0]}"#,
    )
    .expect("valid config");
    assert_eq!(config.num_epochs, 3);
    assert_eq!(config.optimizer_name, OptimizerKind::AdamW);
    assert_eq!(config.batches_per_epoch, 1);
    assert_eq!(config.learning_rate, 0.1);
    assert!(config.learning_rate_decay);

    let (a, b) = spaces_with_noise(20, 1);
    let mut dii = DiffImbalance::new(a.view(), b.view(), config).expect("valid config");
    assert_eq!(
        dii.policy(),
        SmoothingPolicy::AdaptiveGlobal {
            k_init: 5,
            k_final: 1
        }
    );
    assert_eq!(dii.train().expect("training runs").len(), 4);
}
