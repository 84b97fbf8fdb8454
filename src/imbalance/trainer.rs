use crate::estimate::EstimationError;
use crate::imbalance::distance::rank_matrix;
use crate::imbalance::objective::{ImbalanceEvaluation, ImbalanceObjective};
use crate::imbalance::optimizer::{LearningRateSchedule, Optimizer, TrainState};
use crate::imbalance::smoothing::{MAX_ADAPTIVE_K, SmoothingPolicy};
use crate::types::OptimizerKind;
use ndarray::{Array1, Array2, ArrayView2, Axis};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

/// Options of a differentiable information imbalance run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiffImbalanceConfig {
    /// Periods of the features of space A; 0 marks a non-periodic feature.
    /// A single value applies to every feature.
    pub periods_a: Option<Vec<f64>>,
    pub periods_b: Option<Vec<f64>>,
    pub seed: u64,
    pub num_epochs: usize,
    /// Must divide the number of row points.
    pub batches_per_epoch: usize,
    pub l1_strength: f64,
    pub point_adapt_lambda: bool,
    pub k_init: Option<usize>,
    pub k_final: Option<usize>,
    pub lambda_init: Option<f64>,
    pub lambda_final: Option<f64>,
    /// Defaults to 0.1 for every feature of space A.
    pub init_params: Option<Vec<f64>>,
    pub optimizer_name: OptimizerKind,
    pub learning_rate: f64,
    pub learning_rate_decay: bool,
    /// Use disjoint row and column groups and report the statistical error.
    pub compute_error: bool,
    pub ratio_rows_columns: f64,
    pub num_points_rows: Option<usize>,
}

impl Default for DiffImbalanceConfig {
    fn default() -> Self {
        Self {
            periods_a: None,
            periods_b: None,
            seed: 0,
            num_epochs: 100,
            batches_per_epoch: 1,
            l1_strength: 0.0,
            point_adapt_lambda: false,
            k_init: None,
            k_final: None,
            lambda_init: None,
            lambda_final: None,
            init_params: None,
            optimizer_name: OptimizerKind::Sgd,
            learning_rate: 0.1,
            learning_rate_decay: true,
            compute_error: false,
            ratio_rows_columns: 1.0,
            num_points_rows: None,
        }
    }
}

/// Weights, imbalance and error at initialization and after every epoch.
#[derive(Debug, Clone)]
pub struct ImbalanceTrajectory {
    /// `(num_epochs + 1) × n_features_a`.
    pub params: Array2<f64>,
    pub imbalances: Array1<f64>,
    pub errors: Array1<f64>,
}

impl ImbalanceTrajectory {
    pub fn len(&self) -> usize {
        self.imbalances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.imbalances.is_empty()
    }

    pub fn final_params(&self) -> Array1<f64> {
        self.params.row(self.params.nrows() - 1).to_owned()
    }
}

fn broadcast_periods(
    name: &str,
    periods: Option<&Vec<f64>>,
    n_features: usize,
) -> Result<Option<Array1<f64>>, EstimationError> {
    let Some(values) = periods else {
        return Ok(None);
    };
    let out = match values.len() {
        1 => Array1::from_elem(n_features, values[0]),
        len if len == n_features => Array1::from(values.clone()),
        len => {
            return Err(EstimationError::InvalidConfiguration(format!(
                "{name} has {len} entries for {n_features} features"
            )));
        }
    };
    if out.iter().any(|p| !p.is_finite() || *p < 0.0) {
        return Err(EstimationError::InvalidConfiguration(format!(
            "{name} must be finite and non-negative"
        )));
    }
    Ok(Some(out))
}

/// Learns per-feature weights of space A that minimize the differentiable
/// information imbalance toward space B.
pub struct DiffImbalance {
    config: DiffImbalanceConfig,
    data_a_rows: Array2<f64>,
    data_a_columns: Array2<f64>,
    ranks_b: Array2<f64>,
    periods_a: Option<Array1<f64>>,
    init_params: Array1<f64>,
    policy: SmoothingPolicy,
    max_rank: usize,
    k_max_allowed: usize,
    final_params: Option<Array1<f64>>,
}

impl DiffImbalance {
    pub fn new(
        data_a: ArrayView2<'_, f64>,
        data_b: ArrayView2<'_, f64>,
        config: DiffImbalanceConfig,
    ) -> Result<Self, EstimationError> {
        let n = data_a.nrows();
        if n != data_b.nrows() {
            return Err(EstimationError::SampleCountMismatch {
                samples_a: n,
                samples_b: data_b.nrows(),
            });
        }
        let (n_features_a, n_features_b) = (data_a.ncols(), data_b.ncols());
        if n < 2 || n_features_a == 0 || n_features_b == 0 {
            return Err(EstimationError::InvalidInput(format!(
                "need at least 2 points and one feature per space, got {n} points with {n_features_a} and {n_features_b} features"
            )));
        }
        if data_a.iter().chain(data_b.iter()).any(|v| !v.is_finite()) {
            return Err(EstimationError::InvalidInput(
                "input data contains non-finite values".to_string(),
            ));
        }
        if config.num_epochs == 0 && config.learning_rate_decay {
            return Err(EstimationError::InvalidConfiguration(
                "num_epochs must be at least 1 when the learning rate decays".to_string(),
            ));
        }
        if config.compute_error && config.num_points_rows.is_some() {
            return Err(EstimationError::InvalidConfiguration(
                "if compute_error is set, num_points_rows cannot be set".to_string(),
            ));
        }
        if !(config.learning_rate > 0.0 && config.learning_rate.is_finite()) {
            return Err(EstimationError::InvalidConfiguration(format!(
                "learning_rate must be positive, got {}",
                config.learning_rate
            )));
        }
        if !(config.l1_strength >= 0.0 && config.l1_strength.is_finite()) {
            return Err(EstimationError::InvalidConfiguration(format!(
                "l1_strength must be non-negative, got {}",
                config.l1_strength
            )));
        }
        let periods_a = broadcast_periods("periods_a", config.periods_a.as_ref(), n_features_a)?;
        let periods_b = broadcast_periods("periods_b", config.periods_b.as_ref(), n_features_b)?;
        let init_params = match &config.init_params {
            Some(values) if values.len() == n_features_a => Array1::from(values.clone()),
            Some(values) => {
                return Err(EstimationError::InvalidConfiguration(format!(
                    "init_params has {} entries for {n_features_a} features",
                    values.len()
                )));
            }
            None => Array1::from_elem(n_features_a, 0.1),
        };
        let policy = SmoothingPolicy::from_options(
            config.point_adapt_lambda,
            config.k_init,
            config.k_final,
            config.lambda_init,
            config.lambda_final,
        )?;

        let mut rng = StdRng::seed_from_u64(config.seed);
        let mut permutation: Vec<usize> = (0..n).collect();
        let (rows, columns, max_rank) = if config.compute_error {
            let nrows = (0.5 * config.ratio_rows_columns * n as f64).floor() as usize;
            if nrows == 0 || nrows >= n {
                return Err(EstimationError::InvalidConfiguration(format!(
                    "ratio_rows_columns = {} leaves {nrows} row points out of {n}",
                    config.ratio_rows_columns
                )));
            }
            permutation.shuffle(&mut rng);
            let rows = permutation[..nrows].to_vec();
            let mut columns = permutation[nrows..].to_vec();
            columns.sort_unstable();
            let max_rank = columns.len();
            (rows, columns, max_rank)
        } else if let Some(m) = config.num_points_rows {
            if m == 0 || m > n {
                return Err(EstimationError::InvalidConfiguration(format!(
                    "num_points_rows must lie in 1..={n}, got {m}"
                )));
            }
            permutation.shuffle(&mut rng);
            let rows = permutation[..m].to_vec();
            let mut rest = permutation[m..].to_vec();
            rest.sort_unstable();
            let mut columns = rows.clone();
            columns.extend(rest);
            (rows, columns, n - 1)
        } else {
            (permutation.clone(), permutation, n - 1)
        };

        let nrows = rows.len();
        if config.batches_per_epoch == 0 || nrows % config.batches_per_epoch != 0 {
            return Err(EstimationError::InvalidConfiguration(format!(
                "cannot split {nrows} row points into {} equal minibatches",
                config.batches_per_epoch
            )));
        }

        let data_a_rows = data_a.select(Axis(0), &rows);
        let data_a_columns = data_a.select(Axis(0), &columns);
        let data_b_rows = data_b.select(Axis(0), &rows);
        let data_b_columns = data_b.select(Axis(0), &columns);
        let (self_columns, offset) = if config.compute_error {
            (None, 1)
        } else {
            // Row p sits in column p.
            (Some((0..nrows).collect::<Vec<_>>()), 0)
        };
        let ranks_b = rank_matrix(
            data_b_rows.view(),
            data_b_columns.view(),
            periods_b.as_ref().map(|p| p.view()),
            self_columns.as_deref(),
            offset,
        );
        let k_max_allowed = if max_rank > MAX_ADAPTIVE_K {
            MAX_ADAPTIVE_K
        } else {
            max_rank + 1
        };

        log::debug!(
            "[DII] {nrows} rows x {} columns, max rank {max_rank}, smoothing {policy:?}",
            columns.len()
        );

        Ok(Self {
            config,
            data_a_rows,
            data_a_columns,
            ranks_b,
            periods_a,
            init_params,
            policy,
            max_rank,
            k_max_allowed,
            final_params: None,
        })
    }

    pub fn config(&self) -> &DiffImbalanceConfig {
        &self.config
    }

    pub fn policy(&self) -> SmoothingPolicy {
        self.policy
    }

    pub fn max_rank(&self) -> usize {
        self.max_rank
    }

    pub fn n_rows(&self) -> usize {
        self.data_a_rows.nrows()
    }

    /// Weights after the last completed `train` call.
    pub fn final_params(&self) -> Option<&Array1<f64>> {
        self.final_params.as_ref()
    }

    fn total_steps(&self) -> usize {
        self.config.num_epochs * self.config.batches_per_epoch
    }

    fn objective(&self) -> ImbalanceObjective<'_> {
        ImbalanceObjective {
            columns: self.data_a_columns.view(),
            periods: self.periods_a.as_ref().map(|p| p.view()),
            policy: self.policy,
            max_rank: self.max_rank,
            horizon: self.total_steps(),
            k_max_allowed: self.k_max_allowed,
            mask_self: !self.config.compute_error,
        }
    }

    fn evaluate_batch(
        &self,
        objective: &ImbalanceObjective<'_>,
        params: &Array1<f64>,
        batch: &[usize],
        step: usize,
        with_gradient: bool,
    ) -> ImbalanceEvaluation {
        let rows = self.data_a_rows.select(Axis(0), batch);
        let ranks = self.ranks_b.select(Axis(0), batch);
        objective.evaluate(
            params.view(),
            rows.view(),
            ranks.view(),
            batch,
            step,
            with_gradient,
        )
    }

    /// Runs the optimization from the initial weights and returns the
    /// trajectory; entry 0 holds the initial weights evaluated on the first
    /// minibatch of rows.
    pub fn train(&mut self) -> Result<ImbalanceTrajectory, EstimationError> {
        let epochs = self.config.num_epochs;
        let batches = self.config.batches_per_epoch;
        let nrows = self.n_rows();
        let batch_size = nrows / batches;
        let n_features = self.init_params.len();
        let optimizer = Optimizer {
            kind: self.config.optimizer_name,
            schedule: LearningRateSchedule::new(
                self.config.learning_rate,
                self.config.learning_rate_decay,
                self.total_steps(),
            ),
        };
        let objective = self.objective();

        let mut params_out = Array2::<f64>::zeros((epochs + 1, n_features));
        let mut imbalances = Array1::<f64>::zeros(epochs + 1);
        let mut errors = Array1::<f64>::zeros(epochs + 1);

        let first: Vec<usize> = (0..batch_size).collect();
        let start = self.evaluate_batch(&objective, &self.init_params, &first, 0, false);
        params_out.row_mut(0).assign(&self.init_params);
        imbalances[0] = start.value;
        errors[0] = start.error;

        let mut rng = StdRng::seed_from_u64(self.config.seed.wrapping_add(1));
        let mut state = TrainState::create(self.init_params.clone(), optimizer);
        let mut order: Vec<usize> = (0..nrows).collect();
        for epoch in 1..=epochs {
            order.shuffle(&mut rng);
            let mut last = (f64::NAN, f64::NAN);
            for batch in order.chunks(batch_size) {
                let eval = self.evaluate_batch(&objective, &state.params, batch, state.step, true);
                let gradient = eval.gradient.ok_or_else(|| {
                    EstimationError::NumericPrecondition(
                        "imbalance gradient was not produced".to_string(),
                    )
                })?;
                if !gradient.iter().all(|g| g.is_finite()) {
                    return Err(EstimationError::NumericPrecondition(format!(
                        "non-finite imbalance gradient at step {}",
                        state.step
                    )));
                }
                state = state
                    .apply_gradients(&gradient)
                    .apply_l1(self.config.l1_strength);
                last = (eval.value, eval.error);
            }
            params_out.row_mut(epoch).assign(&state.params);
            imbalances[epoch] = last.0;
            errors[epoch] = last.1;
            log::debug!(
                "[DII] epoch {epoch}/{epochs}: imbalance {:.6} +- {:.6}",
                last.0,
                last.1
            );
        }

        log::info!(
            "[DII] trained {epochs} epochs x {batches} batches: imbalance {:.6} -> {:.6}",
            imbalances[0],
            imbalances[epochs]
        );
        self.final_params = Some(state.params);
        Ok(ImbalanceTrajectory {
            params: params_out,
            imbalances,
            errors,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::RngExt;

    fn data(n: usize, seed: u64) -> (Array2<f64>, Array2<f64>) {
        let mut rng = StdRng::seed_from_u64(seed);
        let a = Array2::from_shape_fn((n, 3), |_| rng.random_range(-1.0..1.0));
        let b = a.select(Axis(1), &[0]);
        (a, b)
    }

    #[test]
    fn trajectory_starts_from_initial_weights() {
        let (a, b) = data(20, 1);
        let config = DiffImbalanceConfig {
            num_epochs: 5,
            batches_per_epoch: 2,
            init_params: Some(vec![0.3, 0.2, 0.1]),
            ..Default::default()
        };
        let mut dii = DiffImbalance::new(a.view(), b.view(), config).expect("config");
        let traj = dii.train().expect("train");
        assert_eq!(traj.len(), 6);
        assert_eq!(traj.params.row(0).to_vec(), vec![0.3, 0.2, 0.1]);
        assert_eq!(dii.final_params(), Some(&traj.final_params()));
        assert!(traj.errors.iter().all(|e| e.is_finite() && *e >= 0.0));
    }

    #[test]
    fn training_twice_restarts_from_initial_weights() {
        let (a, b) = data(12, 2);
        let config = DiffImbalanceConfig {
            num_epochs: 3,
            optimizer_name: OptimizerKind::Adam,
            ..Default::default()
        };
        let mut dii = DiffImbalance::new(a.view(), b.view(), config).expect("config");
        let first = dii.train().expect("train");
        let second = dii.train().expect("train");
        assert_eq!(first.params, second.params);
        assert_eq!(first.imbalances, second.imbalances);
    }

    #[test]
    fn configuration_errors_are_raised_eagerly() {
        let (a, b) = data(10, 3);
        let short_b = b.select(Axis(0), &[0, 1, 2]);
        match DiffImbalance::new(a.view(), short_b.view(), DiffImbalanceConfig::default()) {
            Err(EstimationError::SampleCountMismatch {
                samples_a,
                samples_b,
            }) => assert_eq!((samples_a, samples_b), (10, 3)),
            _ => panic!("expected a sample count mismatch"),
        }

        let bad = [
            DiffImbalanceConfig {
                batches_per_epoch: 3,
                ..Default::default()
            },
            DiffImbalanceConfig {
                compute_error: true,
                num_points_rows: Some(4),
                ..Default::default()
            },
            DiffImbalanceConfig {
                point_adapt_lambda: true,
                ..Default::default()
            },
            DiffImbalanceConfig {
                k_init: Some(1),
                k_final: Some(4),
                ..Default::default()
            },
            DiffImbalanceConfig {
                lambda_init: Some(0.01),
                lambda_final: Some(1.0),
                ..Default::default()
            },
            DiffImbalanceConfig {
                init_params: Some(vec![1.0]),
                ..Default::default()
            },
        ];
        for config in bad {
            let err = DiffImbalance::new(a.view(), b.view(), config.clone())
                .err()
                .unwrap_or_else(|| panic!("accepted {config:?}"));
            assert!(err.is_configuration(), "{err}");
        }
    }

    #[test]
    fn zero_epochs_only_evaluate_the_initial_weights() {
        let (a, b) = data(12, 6);
        let config = DiffImbalanceConfig {
            num_epochs: 0,
            learning_rate_decay: false,
            init_params: Some(vec![0.5, 0.4, 0.3]),
            ..Default::default()
        };
        let mut dii = DiffImbalance::new(a.view(), b.view(), config).expect("config");
        let traj = dii.train().expect("train");
        assert_eq!(traj.len(), 1);
        assert_eq!(traj.final_params().to_vec(), vec![0.5, 0.4, 0.3]);
        assert!(traj.imbalances[0].is_finite());

        let decaying = DiffImbalanceConfig {
            num_epochs: 0,
            ..Default::default()
        };
        let err = DiffImbalance::new(a.view(), b.view(), decaying)
            .err()
            .expect("zero epochs with decay");
        assert!(err.is_configuration());
    }

    #[test]
    fn compute_error_mode_splits_rows_and_columns() {
        let (a, b) = data(20, 4);
        let config = DiffImbalanceConfig {
            compute_error: true,
            num_epochs: 2,
            ..Default::default()
        };
        let mut dii = DiffImbalance::new(a.view(), b.view(), config).expect("config");
        assert_eq!(dii.n_rows(), 10);
        assert_eq!(dii.max_rank(), 10);
        let traj = dii.train().expect("train");
        assert!(traj.imbalances.iter().all(|v| v.is_finite()));
        assert!(traj.errors[2] > 0.0);
    }

    #[test]
    fn decimated_rows_keep_self_columns_first() {
        let (a, b) = data(16, 5);
        let config = DiffImbalanceConfig {
            num_points_rows: Some(6),
            num_epochs: 2,
            batches_per_epoch: 3,
            ..Default::default()
        };
        let mut dii = DiffImbalance::new(a.view(), b.view(), config).expect("config");
        assert_eq!(dii.n_rows(), 6);
        assert_eq!(dii.max_rank(), 15);
        for p in 0..6 {
            assert_eq!(dii.ranks_b[[p, p]], 0.0);
        }
        assert_eq!(dii.train().expect("train").len(), 3);
    }
}
