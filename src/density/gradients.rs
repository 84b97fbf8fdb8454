use crate::estimate::EstimationError;
use crate::graph::NeighborGraph;
use ndarray::{Array1, Array2, Array3, Axis, s};
use rayon::iter::{IntoParallelIterator, ParallelIterator};

/// Per-point log-density gradient and its uncertainty.
#[derive(Debug, Clone)]
pub struct GradientField {
    /// `N × dims` gradient estimates.
    pub grads: Array2<f64>,
    /// `N × dims` component variances (diagonal of the covariance).
    pub grads_var: Array2<f64>,
    /// `N × dims × dims` covariance matrices, when requested.
    pub grads_covmat: Option<Array3<f64>>,
}

impl GradientField {
    pub fn has_covmat(&self) -> bool {
        self.grads_covmat.is_some()
    }
}

struct PointGradient {
    grad: Array1<f64>,
    // Full covariance, or a `dims × 1` column holding only the diagonal.
    cov: Array2<f64>,
}

/// Mean-shift estimate at point `i`.
///
/// Inside a ball of radius `r` the mean displacement of the neighbors is
/// `r² / (d + 2) · ∇ log ρ`, so `g = (d + 2) / r² · mean(Δ)` with `r` the
/// distance to the farthest of the `kstar[i]` neighbors. The returned
/// covariance is that of the mean, built from the population covariance of
/// the scaled displacements; the Bessel factor is applied by the caller.
fn mean_shift_kernel(
    graph: &NeighborGraph,
    i: usize,
    full_covariance: bool,
) -> Result<PointGradient, EstimationError> {
    let edges = graph.edges_from(i);
    let n = edges.len();
    let diffs = graph.vector_diffs();
    let local = diffs.slice(s![edges, ..]);

    let r2 = local
        .rows()
        .into_iter()
        .map(|row| row.dot(&row))
        .fold(0.0f64, f64::max);
    if !(r2 > 0.0) {
        return Err(EstimationError::NumericPrecondition(format!(
            "all {n} neighbors of point {i} coincide with it; the gradient scale is undefined"
        )));
    }
    let scale = (graph.intrinsic_dim() as f64 + 2.0) / r2;

    let mean = local
        .mean_axis(Axis(0))
        .ok_or_else(|| EstimationError::InvalidInput(format!("point {i} has no neighbors")))?;
    let centered = &local - &mean.view().insert_axis(Axis(0));
    let cov_scale = scale * scale / (n * n) as f64;

    let cov = if full_covariance {
        centered.t().dot(&centered) * cov_scale
    } else {
        let diag = centered.mapv(|v| v * v).sum_axis(Axis(0)) * cov_scale;
        diag.insert_axis(Axis(1))
    };

    Ok(PointGradient {
        grad: mean * scale,
        cov,
    })
}

/// Estimates the log-density gradient at every point from its `kstar`
/// neighbor displacements.
///
/// Variances (or covariances, when `comp_covmat` is set) are multiplied by
/// `kstar[i] / (kstar[i] - 1)` to remove the bias of the population
/// estimator, which requires `kstar[i] >= 2` everywhere.
pub fn compute_gradients(
    graph: &NeighborGraph,
    comp_covmat: bool,
) -> Result<GradientField, EstimationError> {
    let n = graph.n_points();
    let dims = graph.dims();
    if let Some((point, &kstar)) = graph.kstar().iter().enumerate().find(|(_, k)| **k < 2) {
        return Err(EstimationError::KstarTooSmall { point, kstar });
    }

    let per_point: Vec<PointGradient> = (0..n)
        .into_par_iter()
        .map(|i| mean_shift_kernel(graph, i, comp_covmat))
        .collect::<Result<Vec<_>, _>>()?;

    let mut grads = Array2::<f64>::zeros((n, dims));
    let mut grads_var = Array2::<f64>::zeros((n, dims));
    let mut grads_covmat = comp_covmat.then(|| Array3::<f64>::zeros((n, dims, dims)));

    for (i, point) in per_point.into_iter().enumerate() {
        let k = graph.kstar()[i] as f64;
        let bessel = k / (k - 1.0);
        grads.row_mut(i).assign(&point.grad);
        match grads_covmat.as_mut() {
            Some(covmat) => {
                let cov = point.cov * bessel;
                grads_var.row_mut(i).assign(&cov.diag());
                covmat.slice_mut(s![i, .., ..]).assign(&cov);
            }
            None => {
                grads_var
                    .row_mut(i)
                    .assign(&(point.cov.column(0).to_owned() * bessel));
            }
        }
    }

    Ok(GradientField {
        grads,
        grads_var,
        grads_covmat,
    })
}
