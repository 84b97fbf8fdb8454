//! Assembly and solution of the BMTI linear system.
//!
//! Every edge `e = (i, j)` contributes a Gaussian likelihood
//! `w_e (x_j − x_i − F_e)²` and every point a prior term
//! `(x_i − log_den_i)² / err_i²`. Mixing the two with weight `alpha` and
//! setting the gradient to zero gives `A x = b`, with `A` a weighted graph
//! Laplacian plus a diagonal prior precision.

use crate::density::prior::LogDensityPrior;
use crate::estimate::EstimationError;
use crate::faer_ndarray::{solve_symmetric_dense, symmetric_pinv_diagonal};
use crate::graph::NeighborGraph;
use crate::linalg::sparse_exact::{
    SymmetricTripletBuilder, factorize_sparse_spd, solve_sparse_spd, sparse_matvec,
    sparse_to_dense,
};
use crate::types::{DeltaFErrorMode, SolveMode};
use faer::sparse::SparseColMat;
use ndarray::Array1;

/// `A x = b` plus the prior precision on the diagonal of `A`.
#[derive(Clone)]
pub struct BmtiSystem {
    pub matrix: SparseColMat<usize, f64>,
    pub rhs: Array1<f64>,
    pub prior_precision: Array1<f64>,
}

impl BmtiSystem {
    pub fn dim(&self) -> usize {
        self.rhs.len()
    }
}

/// Per-edge precision weights for the chosen error mode.
///
/// `lsdi` must hold the diagonal inverse cross-covariance when `mode` is
/// [`DeltaFErrorMode::Lsdi`]; it is ignored otherwise.
pub fn edge_weights(
    graph: &NeighborGraph,
    mode: DeltaFErrorMode,
    fij_var: &Array1<f64>,
    lsdi: Option<&Array1<f64>>,
) -> Result<Array1<f64>, EstimationError> {
    let nspar = graph.nspar();
    let weights = match mode {
        DeltaFErrorMode::Uncorrelated => {
            if fij_var.len() != nspar {
                return Err(EstimationError::InvalidInput(format!(
                    "delta variances have {} entries for {} edges",
                    fij_var.len(),
                    nspar
                )));
            }
            let kstar = graph.kstar();
            Array1::from_iter(graph.nind_list().iter().zip(fij_var.iter()).map(
                |(&(i, j), &var)| {
                    let redundancy = ((kstar[i] * kstar[j]) as f64).sqrt();
                    1.0 / (var * redundancy)
                },
            ))
        }
        DeltaFErrorMode::Lsdi => {
            let inv = lsdi.ok_or_else(|| {
                EstimationError::InvalidInput(
                    "LSDI weighting needs the inverse cross-covariance".to_string(),
                )
            })?;
            if inv.len() != nspar {
                return Err(EstimationError::InvalidInput(format!(
                    "inverse cross-covariance has {} entries for {} edges",
                    inv.len(),
                    nspar
                )));
            }
            inv.clone()
        }
        DeltaFErrorMode::Unweighted => Array1::ones(nspar),
    };

    if let Some((e, w)) = weights
        .iter()
        .enumerate()
        .find(|(_, w)| !(w.is_finite() && **w > 0.0))
    {
        return Err(EstimationError::NumericPrecondition(format!(
            "edge {e} has weight {w} under the {mode:?} error mode; weights must be finite and positive"
        )));
    }
    Ok(weights)
}

/// Builds `A` and `b` for mixing weight `alpha ∈ (0, 1]`.
///
/// Off-diagonals are `A[i,j] = −alpha (w_ij + w_ji)`; the diagonal is the
/// negated off-diagonal row sum plus `(1 − alpha) / err_i²`. The right-hand
/// side collects `w_e F_e` as "entering minus leaving" so that a consistent
/// set of differences `F_e = x_j − x_i` is reproduced exactly.
pub fn assemble_bmti_system(
    graph: &NeighborGraph,
    fij: &Array1<f64>,
    weights: &Array1<f64>,
    alpha: f64,
    prior: &LogDensityPrior,
) -> Result<BmtiSystem, EstimationError> {
    let n = graph.n_points();
    let nspar = graph.nspar();
    if !(alpha > 0.0 && alpha <= 1.0) {
        return Err(EstimationError::InvalidConfiguration(format!(
            "alpha must lie in (0, 1], got {alpha}"
        )));
    }
    if fij.len() != nspar || weights.len() != nspar {
        return Err(EstimationError::InvalidInput(format!(
            "expected {nspar} deltas and weights, got {} and {}",
            fij.len(),
            weights.len()
        )));
    }
    prior.validate(n)?;

    let prior_weight = 1.0 - alpha;
    let prior_precision = prior.log_den_err.mapv(|err| prior_weight / (err * err));
    let mut diag = prior_precision.clone();
    let mut rhs = Array1::<f64>::zeros(n);
    for i in 0..n {
        rhs[i] = prior_precision[i] * prior.log_den[i];
    }

    let mut builder = SymmetricTripletBuilder::new(n);
    for (e, &(i, j)) in graph.nind_list().iter().enumerate() {
        let w = alpha * weights[e];
        builder.add_symmetric(i, j, -w);
        diag[i] += w;
        diag[j] += w;
        let flux = w * fij[e];
        rhs[j] += flux;
        rhs[i] -= flux;
    }
    for (i, &d) in diag.iter().enumerate() {
        builder.add(i, i, d);
    }

    Ok(BmtiSystem {
        matrix: builder.build()?,
        rhs,
        prior_precision,
    })
}

fn find_root(parent: &mut [usize], mut x: usize) -> usize {
    while parent[x] != x {
        parent[x] = parent[parent[x]];
        x = parent[x];
    }
    x
}

/// Component label (smallest member index) of every node, following the
/// off-diagonal structure of `matrix`.
fn connected_components(matrix: &SparseColMat<usize, f64>) -> Vec<usize> {
    let n = matrix.ncols();
    let mut parent: Vec<usize> = (0..n).collect();
    let (symbolic, values) = matrix.parts();
    let col_ptr = symbolic.col_ptr();
    let row_idx = symbolic.row_idx();
    for col in 0..n {
        for idx in col_ptr[col]..col_ptr[col + 1] {
            let row = row_idx[idx];
            if row == col || values[idx] == 0.0 {
                continue;
            }
            let (a, b) = (find_root(&mut parent, row), find_root(&mut parent, col));
            if a != b {
                let (lo, hi) = (a.min(b), a.max(b));
                parent[hi] = lo;
            }
        }
    }
    (0..n).map(|i| find_root(&mut parent, i)).collect()
}

/// Components carrying no prior precision, keyed by their smallest member.
fn floating_components(system: &BmtiSystem) -> Vec<(usize, Vec<usize>)> {
    let labels = connected_components(&system.matrix);
    let mut members: Vec<Vec<usize>> = vec![Vec::new(); labels.len()];
    for (i, &root) in labels.iter().enumerate() {
        members[root].push(i);
    }
    members
        .into_iter()
        .enumerate()
        .filter(|(_, nodes)| {
            !nodes.is_empty() && nodes.iter().all(|&i| system.prior_precision[i] == 0.0)
        })
        .collect()
}

/// Solves the system in the requested mode.
///
/// Components without prior precision only determine differences. One node
/// of each is pinned to zero, the remaining positive definite system is
/// solved, and the component is shifted to zero mean afterwards; the result
/// does not depend on the mode.
pub fn solve_bmti_system(
    system: &BmtiSystem,
    mode: SolveMode,
) -> Result<Array1<f64>, EstimationError> {
    let n = system.dim();
    let floating = floating_components(system);
    let mut grounded = vec![false; n];
    for (root, _) in &floating {
        grounded[*root] = true;
    }
    if !floating.is_empty() {
        log::debug!(
            "[BMTI] system has {} component(s) fixed only up to a constant",
            floating.len()
        );
    }

    let mut builder = SymmetricTripletBuilder::new(n);
    {
        let (symbolic, values) = system.matrix.parts();
        let col_ptr = symbolic.col_ptr();
        let row_idx = symbolic.row_idx();
        for col in 0..n {
            for idx in col_ptr[col]..col_ptr[col + 1] {
                let row = row_idx[idx];
                if grounded[row] || grounded[col] {
                    continue;
                }
                builder.add(row, col, values[idx]);
            }
        }
    }
    let mut rhs = system.rhs.clone();
    for (root, _) in &floating {
        builder.add(*root, *root, 1.0);
        rhs[*root] = 0.0;
    }
    let reduced = builder.build()?;

    let mut solution = match mode {
        SolveMode::Dense => {
            let dense = sparse_to_dense(&reduced);
            solve_symmetric_dense(&dense, &rhs).map_err(|source| {
                EstimationError::LinearSystemSolveFailed {
                    mode: SolveMode::Dense,
                    source,
                }
            })?
        }
        SolveMode::Sparse => {
            let factor = factorize_sparse_spd(&reduced)?;
            solve_sparse_spd(&factor, &rhs)?
        }
    };

    for (_, nodes) in &floating {
        let mean = nodes.iter().map(|&i| solution[i]).sum::<f64>() / nodes.len() as f64;
        for &i in nodes {
            solution[i] -= mean;
        }
    }

    if log::log_enabled!(log::Level::Debug) {
        let residual = sparse_matvec(&system.matrix, &solution) - &system.rhs;
        let norm = residual.dot(&residual).sqrt();
        log::debug!("[BMTI] {mode} solve residual |Ax - b| = {norm:.3e}");
    }
    Ok(solution)
}

/// `sqrt(diag(A⁺))`, the marginal standard deviation of each log-density.
pub fn log_density_error(system: &BmtiSystem) -> Result<Array1<f64>, EstimationError> {
    let dense = sparse_to_dense(&system.matrix);
    let diag =
        symmetric_pinv_diagonal(&dense).map_err(EstimationError::EigendecompositionFailed)?;
    Ok(diag.mapv(|v| v.max(0.0).sqrt()))
}
