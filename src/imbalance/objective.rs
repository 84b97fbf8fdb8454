//! Differentiable information imbalance of a weighted space A with respect to
//! fixed ranks in space B, and its exact gradient in the weights.
//!
//! For row `p` the kernel `c_pq = softmax_q(−d_pq / λ_p)` replaces the hard
//! nearest neighbor, and the imbalance is the normalized mean of the
//! conditional ranks `R_p = Σ_q c_pq r_pq`. With
//! `G_pq = 2/(max_rank + 1) · c_pq (r_pq − R_p) / N`, the gradient has a direct
//! part `Σ_pq −G_pq / λ_p · ∂d_pq/∂w` and, for adaptive lambdas, a part through
//! `∂λ_p/∂w` weighted by `H_p = Σ_q G_pq d_pq / λ_p²`.

use crate::imbalance::distance::{squared_differences, weighted_dist2_matrix};
use crate::imbalance::smoothing::{ADAPTIVE_LAMBDA_FRACTION, SmoothingPolicy};
use crate::linalg::utils::mean_and_sample_std;
use ndarray::{Array1, ArrayView1, ArrayView2};
use rayon::iter::{IntoParallelIterator, ParallelIterator};

/// Fixed parts of the objective: the column points in space A, the
/// smoothing policy and the rank normalization.
#[derive(Clone, Copy)]
pub struct ImbalanceObjective<'a> {
    pub columns: ArrayView2<'a, f64>,
    pub periods: Option<ArrayView1<'a, f64>>,
    pub policy: SmoothingPolicy,
    pub max_rank: usize,
    /// Total number of optimization steps, the annealing horizon.
    pub horizon: usize,
    pub k_max_allowed: usize,
    /// Exclude each row point's own column from its kernel.
    pub mask_self: bool,
}

#[derive(Debug, Clone)]
pub struct ImbalanceEvaluation {
    pub value: f64,
    pub error: f64,
    pub lambdas: Array1<f64>,
    pub gradient: Option<Array1<f64>>,
}

struct RowTerms {
    conditional_rank: f64,
    direct: Vec<f64>,
    lambda_sensitivity: f64,
}

impl<'a> ImbalanceObjective<'a> {
    /// Evaluates the imbalance of `rows` (space-A features of a batch) against
    /// their target `ranks`. `row_indices[p]` is the column holding row `p`'s
    /// own point when `mask_self` is set.
    pub fn evaluate(
        &self,
        params: ArrayView1<'_, f64>,
        rows: ArrayView2<'_, f64>,
        ranks: ArrayView2<'_, f64>,
        row_indices: &[usize],
        step: usize,
        with_gradient: bool,
    ) -> ImbalanceEvaluation {
        let n = rows.nrows();
        let n_features = params.len();
        let mut dist2 = weighted_dist2_matrix(params, rows, self.columns, self.periods);
        if self.mask_self {
            for (p, &q) in row_indices.iter().enumerate() {
                dist2[[p, q]] = f64::INFINITY;
            }
        }
        let smoothing = self
            .policy
            .lambdas(&dist2, step, self.horizon, self.k_max_allowed);
        let norm = 2.0 / (self.max_rank as f64 + 1.0);
        let scale = norm / n as f64;

        let per_row: Vec<RowTerms> = (0..n)
            .into_par_iter()
            .map(|p| {
                let lambda = smoothing.lambdas[p];
                let d = dist2.row(p);
                let r = ranks.row(p);
                let d_min = d.iter().copied().fold(f64::INFINITY, f64::min);
                let mut c: Vec<f64> = d
                    .iter()
                    .map(|&dq| {
                        if dq.is_finite() {
                            (-(dq - d_min) / lambda).exp()
                        } else {
                            0.0
                        }
                    })
                    .collect();
                let total: f64 = c.iter().sum();
                c.iter_mut().for_each(|v| *v /= total);
                let conditional_rank: f64 =
                    c.iter().zip(r.iter()).map(|(cq, rq)| cq * rq).sum();

                let mut direct = vec![0.0; if with_gradient { n_features } else { 0 }];
                let mut lambda_sensitivity = 0.0;
                if with_gradient {
                    let mut sq = vec![0.0; n_features];
                    for (q, &cq) in c.iter().enumerate() {
                        if cq == 0.0 {
                            continue;
                        }
                        let g = scale * cq * (r[q] - conditional_rank);
                        lambda_sensitivity += g * (d[q] / lambda) / lambda;
                        squared_differences(
                            rows.row(p),
                            self.columns.row(q),
                            self.periods,
                            &mut sq,
                        );
                        let factor = -2.0 * g / lambda;
                        for f in 0..n_features {
                            direct[f] += factor * params[f] * sq[f];
                        }
                    }
                }
                RowTerms {
                    conditional_rank,
                    direct,
                    lambda_sensitivity,
                }
            })
            .collect();

        let conditional: Vec<f64> = per_row.iter().map(|t| t.conditional_rank).collect();
        let (mean, std) = mean_and_sample_std(&conditional);
        let value = norm * mean;
        let error = norm * std / (n as f64).sqrt();

        let gradient = with_gradient.then(|| {
            let mut grad = Array1::<f64>::zeros(n_features);
            for terms in &per_row {
                for f in 0..n_features {
                    grad[f] += terms.direct[f];
                }
            }
            if let Some(anchors) = smoothing.anchors.as_ref() {
                let mut sq = vec![0.0; n_features];
                // ∂λ_p/∂w_f for the raw per-row lambdas.
                let mut dlambda = |p: usize| -> Vec<f64> {
                    squared_differences(
                        rows.row(p),
                        self.columns.row(anchors[p]),
                        self.periods,
                        &mut sq,
                    );
                    (0..n_features)
                        .map(|f| ADAPTIVE_LAMBDA_FRACTION * 2.0 * params[f] * sq[f])
                        .collect()
                };
                match self.policy {
                    SmoothingPolicy::AdaptivePerPoint { .. } => {
                        for (p, terms) in per_row.iter().enumerate() {
                            let dl = dlambda(p);
                            for f in 0..n_features {
                                grad[f] += terms.lambda_sensitivity * dl[f];
                            }
                        }
                    }
                    SmoothingPolicy::AdaptiveGlobal { .. } => {
                        let total: f64 = per_row.iter().map(|t| t.lambda_sensitivity).sum();
                        let mut mean_dl = vec![0.0; n_features];
                        for p in 0..n {
                            for (acc, v) in mean_dl.iter_mut().zip(dlambda(p)) {
                                *acc += v / n as f64;
                            }
                        }
                        for f in 0..n_features {
                            grad[f] += total * mean_dl[f];
                        }
                    }
                    SmoothingPolicy::FixedGlobal { .. } => {}
                }
            }
            grad
        });

        ImbalanceEvaluation {
            value,
            error,
            lambdas: smoothing.lambdas,
            gradient,
        }
    }
}
