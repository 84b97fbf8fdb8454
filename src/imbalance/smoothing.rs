use crate::estimate::EstimationError;
use ndarray::{Array1, Array2, ArrayView1};
use std::f64::consts::PI;

/// Neighbor orders above this are capped.
pub const MAX_ADAPTIVE_K: usize = 100;

/// Adaptive lambdas are this fraction of the squared distance to the
/// neighbor of the current order.
pub const ADAPTIVE_LAMBDA_FRACTION: f64 = 0.1;

/// Cosine interpolation from `start` at step 0 to `end` at `horizon`.
pub fn cosine_interpolate(start: f64, end: f64, step: usize, horizon: usize) -> f64 {
    if step == 0 {
        return start;
    }
    if step >= horizon {
        return end;
    }
    let x = PI * step as f64 / horizon as f64;
    (start - end) * (x.cos() + 1.0) / 2.0 + end
}

/// How the softmax temperature of the imbalance kernel is chosen at each step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SmoothingPolicy {
    /// One lambda for all rows, annealed between user-given values.
    FixedGlobal { lambda_init: f64, lambda_final: f64 },
    /// One lambda for all rows: the row average of the adaptive values.
    AdaptiveGlobal { k_init: usize, k_final: usize },
    /// One lambda per row from the squared distance to its neighbor of order `k`.
    AdaptivePerPoint { k_init: usize, k_final: usize },
}

/// Lambdas for the rows of one distance matrix.
#[derive(Debug, Clone)]
pub struct Smoothing {
    pub lambdas: Array1<f64>,
    /// Column of the neighbor each adaptive lambda was read from.
    pub anchors: Option<Vec<usize>>,
}

fn paired<T>(
    name: &str,
    init: Option<T>,
    fin: Option<T>,
) -> Result<Option<(T, T)>, EstimationError> {
    match (init, fin) {
        (Some(a), Some(b)) => Ok(Some((a, b))),
        (None, None) => Ok(None),
        _ => Err(EstimationError::InvalidConfiguration(format!(
            "'{name}_init' and '{name}_final' must be given together"
        ))),
    }
}

impl SmoothingPolicy {
    /// Chooses the policy from the trainer options.
    ///
    /// `point_adapt` needs both neighbor orders. Otherwise neighbor orders
    /// select the adaptive global policy and lambda bounds the fixed one;
    /// giving neither means adaptive with `k = 1` throughout.
    pub fn from_options(
        point_adapt: bool,
        k_init: Option<usize>,
        k_final: Option<usize>,
        lambda_init: Option<f64>,
        lambda_final: Option<f64>,
    ) -> Result<Self, EstimationError> {
        let ks = paired("k", k_init, k_final)?;
        let lambdas = paired("lambda", lambda_init, lambda_final)?;

        match (ks, lambdas) {
            (Some(_), Some(_)) => Err(EstimationError::InvalidConfiguration(
                "give either 'k_init'/'k_final' or 'lambda_init'/'lambda_final', not both"
                    .to_string(),
            )),
            (Some((mut k_init, k_final)), None) => {
                if k_init > MAX_ADAPTIVE_K {
                    log::warn!(
                        "[DII] the maximum value for 'k_init' is {MAX_ADAPTIVE_K}, while it was set to {k_init}; continuing with 'k_init = {MAX_ADAPTIVE_K}'"
                    );
                    k_init = MAX_ADAPTIVE_K;
                }
                if k_init < k_final {
                    return Err(EstimationError::InvalidConfiguration(format!(
                        "'k_init' ({k_init}) cannot be smaller than 'k_final' ({k_final})"
                    )));
                }
                Ok(if point_adapt {
                    SmoothingPolicy::AdaptivePerPoint { k_init, k_final }
                } else {
                    SmoothingPolicy::AdaptiveGlobal { k_init, k_final }
                })
            }
            (None, Some((lambda_init, lambda_final))) => {
                if point_adapt {
                    return Err(EstimationError::InvalidConfiguration(
                        "provide 'k_init' and 'k_final' to compute lambda in a point-adaptive fashion"
                            .to_string(),
                    ));
                }
                if !(lambda_final > 0.0 && lambda_init.is_finite()) {
                    return Err(EstimationError::InvalidConfiguration(format!(
                        "lambda bounds must be finite and positive, got {lambda_init} and {lambda_final}"
                    )));
                }
                if lambda_init < lambda_final {
                    return Err(EstimationError::InvalidConfiguration(format!(
                        "'lambda_init' ({lambda_init}) cannot be smaller than 'lambda_final' ({lambda_final})"
                    )));
                }
                Ok(SmoothingPolicy::FixedGlobal {
                    lambda_init,
                    lambda_final,
                })
            }
            (None, None) => {
                if point_adapt {
                    return Err(EstimationError::InvalidConfiguration(
                        "provide 'k_init' and 'k_final' to compute lambda in a point-adaptive fashion"
                            .to_string(),
                    ));
                }
                Ok(SmoothingPolicy::AdaptiveGlobal {
                    k_init: 1,
                    k_final: 1,
                })
            }
        }
    }

    /// Neighbor order in use at `step`, for the adaptive policies.
    pub fn current_k(&self, step: usize, horizon: usize) -> Option<usize> {
        match *self {
            SmoothingPolicy::FixedGlobal { .. } => None,
            SmoothingPolicy::AdaptiveGlobal { k_init, k_final }
            | SmoothingPolicy::AdaptivePerPoint { k_init, k_final } => {
                let k = cosine_interpolate(k_init as f64, k_final as f64, step, horizon);
                Some(k.round_ties_even().max(0.0) as usize)
            }
        }
    }

    /// Lambdas for every row of `dist2` at `step`.
    ///
    /// Adaptive orders index the ascending row distances from 0 and are
    /// capped at `k_max_allowed - 1` and at the number of finite entries.
    pub fn lambdas(
        &self,
        dist2: &Array2<f64>,
        step: usize,
        horizon: usize,
        k_max_allowed: usize,
    ) -> Smoothing {
        let n = dist2.nrows();
        match *self {
            SmoothingPolicy::FixedGlobal {
                lambda_init,
                lambda_final,
            } => {
                let lambda = cosine_interpolate(lambda_init, lambda_final, step, horizon);
                Smoothing {
                    lambdas: Array1::from_elem(n, lambda.max(f64::MIN_POSITIVE)),
                    anchors: None,
                }
            }
            SmoothingPolicy::AdaptiveGlobal { .. } | SmoothingPolicy::AdaptivePerPoint { .. } => {
                let k = self.current_k(step, horizon).unwrap_or(0);
                let anchors: Vec<usize> = dist2
                    .rows()
                    .into_iter()
                    .map(|row| neighbor_of_order(row, k, k_max_allowed))
                    .collect();
                let raw = Array1::from_iter(
                    anchors
                        .iter()
                        .enumerate()
                        .map(|(p, &q)| ADAPTIVE_LAMBDA_FRACTION * dist2[[p, q]]),
                );
                let lambdas = if matches!(self, SmoothingPolicy::AdaptivePerPoint { .. }) {
                    raw.mapv(|l| l.max(f64::MIN_POSITIVE))
                } else {
                    let mean = raw.mean().unwrap_or(0.0);
                    Array1::from_elem(n, mean.max(f64::MIN_POSITIVE))
                };
                Smoothing {
                    lambdas,
                    anchors: Some(anchors),
                }
            }
        }
    }
}

/// Column holding the `k`-th smallest (0-based) finite value of `row`.
fn neighbor_of_order(row: ArrayView1<'_, f64>, k: usize, k_max_allowed: usize) -> usize {
    let mut finite: Vec<usize> = (0..row.len()).filter(|&q| row[q].is_finite()).collect();
    if finite.is_empty() {
        return 0;
    }
    let idx = k
        .min(k_max_allowed.saturating_sub(1))
        .min(finite.len() - 1);
    finite.select_nth_unstable_by(idx, |&a, &b| row[a].total_cmp(&row[b]).then(a.cmp(&b)));
    finite[idx]
}
