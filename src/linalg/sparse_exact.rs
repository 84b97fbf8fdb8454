use crate::estimate::EstimationError;
use crate::faer_ndarray::{FaerArrayView, FaerLinalgError};
use crate::types::SolveMode;
use faer::Side;
use faer::linalg::solvers::Solve;
use faer::sparse::linalg::solvers::Llt as SparseLlt;
use faer::sparse::{SparseColMat, Triplet};
use ndarray::{Array1, Array2};
use std::collections::BTreeMap;

/// Accumulates symmetric entries before handing them to faer, so duplicate
/// `(row, col)` contributions are summed exactly once on our side.
#[derive(Clone, Debug, Default)]
pub struct SymmetricTripletBuilder {
    n: usize,
    entries: BTreeMap<(usize, usize), f64>,
}

impl SymmetricTripletBuilder {
    pub fn new(n: usize) -> Self {
        Self {
            n,
            entries: BTreeMap::new(),
        }
    }

    #[inline]
    pub fn add(&mut self, row: usize, col: usize, value: f64) {
        *self.entries.entry((row, col)).or_insert(0.0) += value;
    }

    /// Adds `value` at `(i, j)` and `(j, i)`.
    #[inline]
    pub fn add_symmetric(&mut self, i: usize, j: usize, value: f64) {
        self.add(i, j, value);
        self.add(j, i, value);
    }

    pub fn build(self) -> Result<SparseColMat<usize, f64>, EstimationError> {
        let triplets: Vec<Triplet<usize, usize, f64>> = self
            .entries
            .into_iter()
            .map(|((row, col), value)| Triplet::new(row, col, value))
            .collect();
        SparseColMat::try_new_from_triplets(self.n, self.n, &triplets).map_err(|_| {
            EstimationError::InvalidInput("failed to assemble sparse CSC matrix".to_string())
        })
    }
}

#[derive(Clone)]
pub struct SparseExactFactor {
    factor: SparseLlt<usize, f64>,
    n: usize,
}

pub fn sparse_to_dense(matrix: &SparseColMat<usize, f64>) -> Array2<f64> {
    let mut dense = Array2::<f64>::zeros((matrix.nrows(), matrix.ncols()));
    let (symbolic, values) = matrix.parts();
    let col_ptr = symbolic.col_ptr();
    let row_idx = symbolic.row_idx();
    for col in 0..matrix.ncols() {
        for idx in col_ptr[col]..col_ptr[col + 1] {
            dense[[row_idx[idx], col]] += values[idx];
        }
    }
    dense
}

pub fn sparse_matvec(matrix: &SparseColMat<usize, f64>, vector: &Array1<f64>) -> Array1<f64> {
    let mut out = Array1::<f64>::zeros(matrix.nrows());
    let (symbolic, values) = matrix.parts();
    let col_ptr = symbolic.col_ptr();
    let row_idx = symbolic.row_idx();
    for col in 0..matrix.ncols() {
        let x = vector[col];
        if x == 0.0 {
            continue;
        }
        for idx in col_ptr[col]..col_ptr[col + 1] {
            out[row_idx[idx]] += values[idx] * x;
        }
    }
    out
}

/// Sparse Cholesky of a symmetric positive definite matrix stored with both
/// triangles; only the upper triangle is read.
pub fn factorize_sparse_spd(
    h: &SparseColMat<usize, f64>,
) -> Result<SparseExactFactor, EstimationError> {
    let factor = h.as_ref().sp_cholesky(Side::Upper).map_err(|_| {
        EstimationError::LinearSystemSolveFailed {
            mode: SolveMode::Sparse,
            source: FaerLinalgError::SparseCholesky,
        }
    })?;
    Ok(SparseExactFactor {
        factor,
        n: h.ncols(),
    })
}

pub fn solve_sparse_spd(
    factor: &SparseExactFactor,
    rhs: &Array1<f64>,
) -> Result<Array1<f64>, EstimationError> {
    if rhs.len() != factor.n {
        return Err(EstimationError::InvalidInput(format!(
            "right-hand side has length {} but the factor has dimension {}",
            rhs.len(),
            factor.n
        )));
    }
    let rhs_arr = rhs.clone().insert_axis(ndarray::Axis(1));
    let rhs_view = FaerArrayView::new(&rhs_arr);
    let out = factor.factor.solve(rhs_view.as_ref());
    let mut result = Array1::<f64>::zeros(rhs.len());
    for i in 0..rhs.len() {
        result[i] = out[(i, 0)];
    }
    if !result.iter().all(|v| v.is_finite()) {
        return Err(EstimationError::LinearSystemSolveFailed {
            mode: SolveMode::Sparse,
            source: FaerLinalgError::NonFiniteSolution,
        });
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn tridiagonal(n: usize) -> SparseColMat<usize, f64> {
        let mut builder = SymmetricTripletBuilder::new(n);
        for i in 0..n {
            builder.add(i, i, 4.0);
            if i + 1 < n {
                builder.add_symmetric(i, i + 1, -1.0);
            }
        }
        builder.build().expect("triplets")
    }

    #[test]
    fn builder_sums_duplicate_entries() {
        let mut builder = SymmetricTripletBuilder::new(2);
        builder.add(0, 0, 1.0);
        builder.add(0, 0, 2.5);
        builder.add_symmetric(0, 1, -0.5);
        builder.add_symmetric(0, 1, -0.5);
        let dense = sparse_to_dense(&builder.build().expect("triplets"));
        assert_eq!(dense[[0, 0]], 3.5);
        assert_eq!(dense[[0, 1]], -1.0);
        assert_eq!(dense[[1, 0]], -1.0);
        assert_eq!(dense[[1, 1]], 0.0);
    }

    #[test]
    fn sparse_matvec_matches_dense_dot() {
        let a = tridiagonal(4);
        let v = array![1.0, -2.0, 0.0, 3.0];
        let expected = sparse_to_dense(&a).dot(&v);
        let got = sparse_matvec(&a, &v);
        for i in 0..4 {
            assert!((expected[i] - got[i]).abs() < 1e-12);
        }
    }

    #[test]
    fn sparse_cholesky_solves_tridiagonal_system() {
        let a = tridiagonal(5);
        let x_true = array![0.5, -1.0, 2.0, 0.0, 1.5];
        let b = sparse_matvec(&a, &x_true);
        let factor = factorize_sparse_spd(&a).expect("SPD factorization");
        let x = solve_sparse_spd(&factor, &b).expect("solve");
        for i in 0..5 {
            assert!((x[i] - x_true[i]).abs() < 1e-12);
        }
    }
}
