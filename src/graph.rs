//! Sparse neighbor-graph context shared by the density estimators.
//!
//! The graph itself (who is whose neighbor, and how many neighbors `kstar[i]`
//! each point keeps) is produced upstream. This module only validates it,
//! indexes it, and derives the per-edge shared-neighbor correlation used in
//! error propagation.

use crate::estimate::EstimationError;
use crate::linalg::sparse_exact::SymmetricTripletBuilder;
use crate::types::CorrelationMethod;
use faer::sparse::SparseColMat;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use std::collections::BTreeMap;
use std::ops::Range;

/// Directed k*-neighbor graph with per-edge displacement vectors.
///
/// Edge `e = (i, j)` stores `vector_diffs[e] = x_j - x_i`. Edges of point `i`
/// occupy `nind_iptr[i]..nind_iptr[i + 1]` and there are exactly `kstar[i]`
/// of them.
#[derive(Debug, Clone)]
pub struct NeighborGraph {
    kstar: Vec<usize>,
    nind_list: Vec<(usize, usize)>,
    nind_iptr: Vec<usize>,
    vector_diffs: Array2<f64>,
    intrinsic_dim: usize,
    incoming: Vec<Vec<usize>>,
}

impl NeighborGraph {
    pub fn new(
        kstar: Vec<usize>,
        nind_list: Vec<(usize, usize)>,
        nind_iptr: Vec<usize>,
        vector_diffs: Array2<f64>,
        intrinsic_dim: usize,
    ) -> Result<Self, EstimationError> {
        let n = kstar.len();
        if n == 0 {
            return Err(EstimationError::InvalidInput(
                "neighbor graph must contain at least one point".to_string(),
            ));
        }
        if intrinsic_dim == 0 {
            return Err(EstimationError::InvalidInput(
                "intrinsic dimension must be positive".to_string(),
            ));
        }
        if nind_iptr.len() != n + 1 || nind_iptr[0] != 0 {
            return Err(EstimationError::InvalidInput(format!(
                "nind_iptr must have length {} and start at 0 (got length {})",
                n + 1,
                nind_iptr.len()
            )));
        }
        if nind_iptr[n] != nind_list.len() {
            return Err(EstimationError::InvalidInput(format!(
                "nind_iptr ends at {} but the edge list has {} entries",
                nind_iptr[n],
                nind_list.len()
            )));
        }
        if vector_diffs.nrows() != nind_list.len() {
            return Err(EstimationError::InvalidInput(format!(
                "vector_diffs has {} rows but the edge list has {} entries",
                vector_diffs.nrows(),
                nind_list.len()
            )));
        }
        if vector_diffs.ncols() == 0 {
            return Err(EstimationError::InvalidInput(
                "vector_diffs must have at least one coordinate".to_string(),
            ));
        }

        let mut incoming = vec![Vec::new(); n];
        for i in 0..n {
            let (start, end) = (nind_iptr[i], nind_iptr[i + 1]);
            if end < start || end - start != kstar[i] {
                return Err(EstimationError::InvalidInput(format!(
                    "point {i} owns {} edges but kstar = {}",
                    end.saturating_sub(start),
                    kstar[i]
                )));
            }
            for (e, &(src, dst)) in nind_list.iter().enumerate().take(end).skip(start) {
                if src != i || dst >= n || dst == i {
                    return Err(EstimationError::InvalidInput(format!(
                        "edge {e} = ({src}, {dst}) is not a valid outgoing edge of point {i}"
                    )));
                }
                incoming[dst].push(e);
            }
        }
        if !vector_diffs.iter().all(|v| v.is_finite()) {
            return Err(EstimationError::InvalidInput(
                "vector_diffs contains non-finite entries".to_string(),
            ));
        }

        Ok(Self {
            kstar,
            nind_list,
            nind_iptr,
            vector_diffs,
            intrinsic_dim,
            incoming,
        })
    }

    /// Builds the graph from coordinates and per-point neighbor lists (ordered
    /// nearest first). The neighbor lists define `kstar`.
    pub fn from_neighbor_lists(
        coordinates: ArrayView2<'_, f64>,
        neighbors: &[Vec<usize>],
        intrinsic_dim: usize,
    ) -> Result<Self, EstimationError> {
        let n = coordinates.nrows();
        if neighbors.len() != n {
            return Err(EstimationError::InvalidInput(format!(
                "{} neighbor lists supplied for {} points",
                neighbors.len(),
                n
            )));
        }
        let nspar: usize = neighbors.iter().map(Vec::len).sum();
        let dims = coordinates.ncols();
        let mut kstar = Vec::with_capacity(n);
        let mut nind_list = Vec::with_capacity(nspar);
        let mut nind_iptr = Vec::with_capacity(n + 1);
        let mut vector_diffs = Array2::<f64>::zeros((nspar, dims));
        nind_iptr.push(0);
        for (i, list) in neighbors.iter().enumerate() {
            for &j in list {
                if j >= n {
                    return Err(EstimationError::InvalidInput(format!(
                        "neighbor index {j} of point {i} is out of range"
                    )));
                }
                let e = nind_list.len();
                let mut row = vector_diffs.row_mut(e);
                row.assign(&(&coordinates.row(j) - &coordinates.row(i)));
                nind_list.push((i, j));
            }
            kstar.push(list.len());
            nind_iptr.push(nind_list.len());
        }
        Self::new(kstar, nind_list, nind_iptr, vector_diffs, intrinsic_dim)
    }

    pub fn n_points(&self) -> usize {
        self.kstar.len()
    }

    pub fn nspar(&self) -> usize {
        self.nind_list.len()
    }

    /// Embedding dimension of the displacement vectors.
    pub fn dims(&self) -> usize {
        self.vector_diffs.ncols()
    }

    pub fn intrinsic_dim(&self) -> usize {
        self.intrinsic_dim
    }

    pub fn kstar(&self) -> &[usize] {
        &self.kstar
    }

    pub fn nind_list(&self) -> &[(usize, usize)] {
        &self.nind_list
    }

    pub fn nind_iptr(&self) -> &[usize] {
        &self.nind_iptr
    }

    pub fn vector_diffs(&self) -> ArrayView2<'_, f64> {
        self.vector_diffs.view()
    }

    pub fn vector_diff(&self, edge: usize) -> ArrayView1<'_, f64> {
        self.vector_diffs.row(edge)
    }

    /// Edge ids leaving point `i`.
    pub fn edges_from(&self, i: usize) -> Range<usize> {
        self.nind_iptr[i]..self.nind_iptr[i + 1]
    }

    /// Edge ids entering point `i`.
    pub fn edges_into(&self, i: usize) -> &[usize] {
        &self.incoming[i]
    }

    /// Distance from `i` to the farthest of its `kstar[i]` neighbors.
    pub fn kstar_radius(&self, i: usize) -> f64 {
        self.edges_from(i)
            .map(|e| self.vector_diffs.row(e).dot(&self.vector_diffs.row(e)))
            .fold(0.0f64, f64::max)
            .sqrt()
    }

    /// Sorted neighborhood of `i` including the point itself.
    fn closed_neighborhood(&self, i: usize) -> Vec<usize> {
        let mut set: Vec<usize> = self.edges_from(i).map(|e| self.nind_list[e].1).collect();
        set.push(i);
        set.sort_unstable();
        set.dedup();
        set
    }
}

/// Per-edge correlation coefficients plus the symmetric point-pair matrix
/// (unit diagonal) they were read from.
#[derive(Clone)]
pub struct EdgeCorrelation {
    method: CorrelationMethod,
    per_edge: Array1<f64>,
    matrix: SparseColMat<usize, f64>,
}

impl EdgeCorrelation {
    pub fn method(&self) -> CorrelationMethod {
        self.method
    }

    pub fn per_edge(&self) -> &Array1<f64> {
        &self.per_edge
    }

    pub fn matrix(&self) -> &SparseColMat<usize, f64> {
        &self.matrix
    }

    /// Points `b` with a stored correlation to `a` (including `a` itself) and
    /// the coefficient `rho_ab`.
    pub fn partners(&self, a: usize) -> impl Iterator<Item = (usize, f64)> + '_ {
        let (symbolic, values) = self.matrix.parts();
        let col_ptr = symbolic.col_ptr();
        let row_idx = symbolic.row_idx();
        (col_ptr[a]..col_ptr[a + 1]).map(move |idx| (row_idx[idx], values[idx]))
    }
}

fn sorted_intersection_len(a: &[usize], b: &[usize]) -> usize {
    let (mut i, mut j, mut count) = (0usize, 0usize, 0usize);
    while i < a.len() && j < b.len() {
        match a[i].cmp(&b[j]) {
            std::cmp::Ordering::Less => i += 1,
            std::cmp::Ordering::Greater => j += 1,
            std::cmp::Ordering::Equal => {
                count += 1;
                i += 1;
                j += 1;
            }
        }
    }
    count
}

fn shared_neighbor_coefficient(method: CorrelationMethod, a: &[usize], b: &[usize]) -> f64 {
    let common = sorted_intersection_len(a, b) as f64;
    let (na, nb) = (a.len() as f64, b.len() as f64);
    match method {
        CorrelationMethod::Jaccard => common / (na + nb - common),
        CorrelationMethod::Geometric => common / (na * nb).sqrt(),
        CorrelationMethod::SquaredGeometric => common * common / (na * nb),
    }
}

/// Correlation between the gradient estimates at the two ends of every edge,
/// estimated from the overlap of their closed neighborhoods.
pub fn compute_edge_correlation(
    graph: &NeighborGraph,
    method: CorrelationMethod,
) -> Result<EdgeCorrelation, EstimationError> {
    let n = graph.n_points();
    let neighborhoods: Vec<Vec<usize>> = (0..n).map(|i| graph.closed_neighborhood(i)).collect();

    let mut pair_values: BTreeMap<(usize, usize), f64> = BTreeMap::new();
    let mut per_edge = Array1::<f64>::zeros(graph.nspar());
    for (e, &(i, j)) in graph.nind_list().iter().enumerate() {
        let key = (i.min(j), i.max(j));
        let rho = *pair_values.entry(key).or_insert_with(|| {
            shared_neighbor_coefficient(method, &neighborhoods[i], &neighborhoods[j])
        });
        per_edge[e] = rho;
    }

    let mut builder = SymmetricTripletBuilder::new(n);
    for i in 0..n {
        builder.add(i, i, 1.0);
    }
    for (&(a, b), &rho) in &pair_values {
        builder.add_symmetric(a, b, rho);
    }
    let matrix = builder.build()?;

    log::debug!(
        "edge correlation ({:?}): {} edges, {} distinct pairs, mean rho = {:.4}",
        method,
        graph.nspar(),
        pair_values.len(),
        per_edge.mean().unwrap_or(0.0)
    );

    Ok(EdgeCorrelation {
        method,
        per_edge,
        matrix,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn square_graph() -> NeighborGraph {
        let coords = array![[0.0, 0.0], [1.0, 0.0], [1.0, 1.0], [0.0, 1.0]];
        let neighbors = vec![vec![1, 3], vec![0, 2], vec![1, 3], vec![0, 2]];
        NeighborGraph::from_neighbor_lists(coords.view(), &neighbors, 2).expect("graph")
    }

    #[test]
    fn from_neighbor_lists_stores_target_minus_source() {
        let g = square_graph();
        assert_eq!(g.nspar(), 8);
        assert_eq!(g.nind_iptr(), &[0, 2, 4, 6, 8]);
        // Edge 0 is (0, 1): x_1 - x_0 = (1, 0).
        assert_eq!(g.vector_diff(0).to_vec(), vec![1.0, 0.0]);
        // Edge 3 is (1, 2): x_2 - x_1 = (0, 1).
        assert_eq!(g.vector_diff(3).to_vec(), vec![0.0, 1.0]);
        assert_eq!(g.edges_into(0), &[2, 6]);
    }

    #[test]
    fn new_rejects_inconsistent_offsets() {
        let diffs = Array2::<f64>::zeros((2, 1));
        let err = NeighborGraph::new(vec![2, 0], vec![(0, 1), (0, 1)], vec![0, 1, 2], diffs, 1)
            .expect_err("kstar disagrees with offsets");
        assert!(err.is_configuration());
    }

    #[test]
    fn new_rejects_self_loops() {
        let diffs = Array2::<f64>::zeros((1, 1));
        assert!(NeighborGraph::new(vec![1, 0], vec![(0, 0)], vec![0, 1, 1], diffs, 1).is_err());
    }

    #[test]
    fn jaccard_on_square_counts_closed_neighborhoods() {
        let g = square_graph();
        let corr = compute_edge_correlation(&g, CorrelationMethod::Jaccard).expect("corr");
        // S_0 = {0,1,3}, S_1 = {0,1,2}: 2 shared out of 4 distinct.
        assert!((corr.per_edge()[0] - 0.5).abs() < 1e-12);
        let partners: Vec<(usize, f64)> = corr.partners(0).collect();
        assert!(partners.contains(&(0, 1.0)));
        assert_eq!(partners.len(), 3);
    }

    #[test]
    fn coefficients_stay_in_unit_interval() {
        let g = square_graph();
        for method in [
            CorrelationMethod::Jaccard,
            CorrelationMethod::Geometric,
            CorrelationMethod::SquaredGeometric,
        ] {
            let corr = compute_edge_correlation(&g, method).expect("corr");
            assert!(corr.per_edge().iter().all(|&r| (0.0..=1.0).contains(&r)));
        }
    }
}
