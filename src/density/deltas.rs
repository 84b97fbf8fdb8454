use crate::density::gradients::GradientField;
use crate::estimate::EstimationError;
use crate::graph::{EdgeCorrelation, NeighborGraph};
use ndarray::{Array1, ArrayView1, ArrayView2, s};
use rayon::iter::{IntoParallelIterator, ParallelIterator};
use std::collections::HashMap;

/// Log-density differences along every directed edge and their variances.
#[derive(Debug, Clone)]
pub struct DeltaFs {
    /// `fij[e] ≈ log ρ(j) − log ρ(i)` for edge `e = (i, j)`.
    pub fij: Array1<f64>,
    pub fij_var: Array1<f64>,
}

#[inline]
fn quadratic_form(cov: ArrayView2<'_, f64>, v: ArrayView1<'_, f64>) -> f64 {
    v.dot(&cov.dot(&v)).max(0.0)
}

/// Semisum-of-gradients estimate of the log-density change along each edge:
/// `F_ij = ½ (g_i + g_j) · Δx_ij`, with variance
/// `¼ (V_i + V_j + 2 ρ_ij √(V_i V_j))` and `V_i = Δxᵀ Cov_i Δx`.
pub fn compute_delta_fs(
    graph: &NeighborGraph,
    gradients: &GradientField,
    correlation: &EdgeCorrelation,
) -> Result<DeltaFs, EstimationError> {
    let covmat = gradients.grads_covmat.as_ref().ok_or_else(|| {
        EstimationError::InvalidInput(
            "pairwise deltas need the full gradient covariance".to_string(),
        )
    })?;
    let rho = correlation.per_edge();
    if rho.len() != graph.nspar() {
        return Err(EstimationError::InvalidInput(format!(
            "correlation has {} entries for {} edges",
            rho.len(),
            graph.nspar()
        )));
    }

    let nspar = graph.nspar();
    let mut fij = Array1::<f64>::zeros(nspar);
    let mut fij_var = Array1::<f64>::zeros(nspar);
    for (e, &(i, j)) in graph.nind_list().iter().enumerate() {
        let dx = graph.vector_diff(e);
        let g_sum = &gradients.grads.row(i) + &gradients.grads.row(j);
        fij[e] = 0.5 * g_sum.dot(&dx);

        let var_i = quadratic_form(covmat.slice(s![i, .., ..]), dx);
        let var_j = quadratic_form(covmat.slice(s![j, .., ..]), dx);
        let cross = 2.0 * rho[e] * (var_i * var_j).sqrt();
        fij_var[e] = (0.25 * (var_i + var_j + cross)).max(0.0);
    }

    Ok(DeltaFs { fij, fij_var })
}

/// Diagonal `D` minimizing `‖D C − I‖_F` for the cross-covariance `C` of all
/// edge deltas: `d_e = C_ee / Σ_f C_ef²`.
///
/// Off-diagonal entries follow from the linearity of the deltas in the
/// gradients, with per-component standard deviations and the point-pair
/// correlations stored in `correlation`:
/// `C_ef = ¼ Σ_{a∈e} Σ_{b∈f} ρ_ab Σ_k Δe_k Δf_k σ_{a,k} σ_{b,k}`.
/// Diagonal entries are the delta variances.
pub fn compute_inv_cross_covariance(
    graph: &NeighborGraph,
    gradients: &GradientField,
    correlation: &EdgeCorrelation,
    deltas: &DeltaFs,
) -> Result<Array1<f64>, EstimationError> {
    let nspar = graph.nspar();
    if deltas.fij_var.len() != nspar {
        return Err(EstimationError::InvalidInput(format!(
            "delta variances have {} entries for {} edges",
            deltas.fij_var.len(),
            nspar
        )));
    }
    let sigma = gradients.grads_var.mapv(|v| v.max(0.0).sqrt());
    let edges = graph.nind_list();

    let weights: Vec<f64> = (0..nspar)
        .into_par_iter()
        .map(|e| {
            let (i, j) = edges[e];
            let dx_e = graph.vector_diff(e);
            let mut cross: HashMap<usize, f64> = HashMap::new();
            for a in [i, j] {
                let weighted_e = &dx_e * &sigma.row(a);
                for (b, rho_ab) in correlation.partners(a) {
                    let incident = graph.edges_from(b).chain(graph.edges_into(b).iter().copied());
                    for f in incident {
                        if f == e {
                            continue;
                        }
                        let weighted_f = &graph.vector_diff(f) * &sigma.row(b);
                        *cross.entry(f).or_insert(0.0) +=
                            0.25 * rho_ab * weighted_e.dot(&weighted_f);
                    }
                }
            }
            let c_ee = deltas.fij_var[e];
            let denom = c_ee * c_ee + cross.values().map(|c| c * c).sum::<f64>();
            if denom > 0.0 { c_ee / denom } else { 0.0 }
        })
        .collect();

    Ok(Array1::from(weights))
}
