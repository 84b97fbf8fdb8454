use faer::diag::DiagRef;
use faer::linalg::solvers;
pub use faer::linalg::solvers::{Ldlt as FaerLdlt, Llt as FaerLlt, Solve as FaerSolve};
use faer::{MatRef, Side};
use ndarray::{Array1, Array2, ArrayBase, Data, Ix1, Ix2};
use std::marker::PhantomData;
use thiserror::Error;

const SYMMETRY_REL_TOL: f64 = 1e-12;
const SYMMETRY_ABS_TOL: f64 = 1e-12;

#[derive(Debug, Error)]
pub enum FaerLinalgError {
    #[error("Matrix is not symmetric within tolerance")]
    NotSymmetric,
    #[error("Self-adjoint eigendecomposition failed: {0:?}")]
    SelfAdjointEigen(solvers::EvdError),
    #[error("LDLT factorization failed: {0:?}")]
    Ldlt(solvers::LdltError),
    #[error("Sparse Cholesky factorization failed")]
    SparseCholesky,
    #[error("Solution contains non-finite entries")]
    NonFiniteSolution,
}

pub enum FaerSymmetricFactor {
    Llt(FaerLlt<f64>),
    Ldlt(FaerLdlt<f64>),
}

impl FaerSymmetricFactor {
    #[inline]
    pub fn solve(&self, rhs: MatRef<'_, f64>) -> faer::Mat<f64> {
        match self {
            FaerSymmetricFactor::Llt(f) => f.solve(rhs),
            FaerSymmetricFactor::Ldlt(f) => f.solve(rhs),
        }
    }

    pub fn solve_vec(&self, rhs: &Array1<f64>) -> Array1<f64> {
        let rhs_view = FaerColView::new(rhs);
        let out = self.solve(rhs_view.as_ref());
        let mut result = Array1::<f64>::zeros(rhs.len());
        for i in 0..rhs.len() {
            result[i] = out[(i, 0)];
        }
        result
    }
}

/// Factorize a symmetric system with an LLT first attempt and LDLT fallback.
#[inline]
pub fn factorize_symmetric_with_fallback(
    matrix: MatRef<'_, f64>,
    side: Side,
) -> Result<FaerSymmetricFactor, FaerLinalgError> {
    if let Ok(llt) = FaerLlt::new(matrix, side) {
        return Ok(FaerSymmetricFactor::Llt(llt));
    }
    let ldlt = FaerLdlt::new(matrix, side).map_err(FaerLinalgError::Ldlt)?;
    Ok(FaerSymmetricFactor::Ldlt(ldlt))
}

/// Solve a dense symmetric system `A x = b`, rejecting asymmetric input and
/// non-finite solutions.
pub fn solve_symmetric_dense(
    matrix: &Array2<f64>,
    rhs: &Array1<f64>,
) -> Result<Array1<f64>, FaerLinalgError> {
    if !is_symmetric_with_tolerance(matrix, SYMMETRY_REL_TOL, SYMMETRY_ABS_TOL) {
        return Err(FaerLinalgError::NotSymmetric);
    }
    let view = FaerArrayView::new(matrix);
    let factor = factorize_symmetric_with_fallback(view.as_ref(), Side::Lower)?;
    let solution = factor.solve_vec(rhs);
    if !solution.iter().all(|v| v.is_finite()) {
        return Err(FaerLinalgError::NonFiniteSolution);
    }
    Ok(solution)
}

/// Diagonal of the Moore-Penrose pseudo-inverse of a symmetric matrix.
///
/// Eigenvalues with `|λ| <= n · ε · max|λ|` are treated as zero, which is the
/// same cutoff a Hermitian `pinvh` applies by default.
pub fn symmetric_pinv_diagonal<S: Data<Elem = f64>>(
    matrix: &ArrayBase<S, Ix2>,
) -> Result<Array1<f64>, FaerLinalgError> {
    let n = matrix.nrows();
    let (evals, evecs) = matrix.eigh(Side::Lower)?;
    let max_abs = evals.iter().fold(0.0f64, |acc, &v| acc.max(v.abs()));
    let cutoff = (n.max(1) as f64) * f64::EPSILON * max_abs;
    let mut diag = Array1::<f64>::zeros(n);
    for (k, &lambda) in evals.iter().enumerate() {
        if lambda.abs() <= cutoff {
            continue;
        }
        let inv = 1.0 / lambda;
        for i in 0..n {
            let v = evecs[[i, k]];
            diag[i] += v * v * inv;
        }
    }
    Ok(diag)
}

fn mat_to_array(mat: MatRef<'_, f64>) -> Array2<f64> {
    let mut out = Array2::<f64>::zeros((mat.nrows(), mat.ncols()));
    for j in 0..mat.ncols() {
        for i in 0..mat.nrows() {
            out[[i, j]] = mat[(i, j)];
        }
    }
    out
}

fn diag_to_array(diag: DiagRef<'_, f64>) -> Array1<f64> {
    let mat = diag.column_vector().as_mat();
    let mut out = Array1::<f64>::zeros(mat.nrows());
    for i in 0..mat.nrows() {
        out[i] = mat[(i, 0)];
    }
    out
}

pub fn is_symmetric_with_tolerance(matrix: &Array2<f64>, rel_tol: f64, abs_tol: f64) -> bool {
    let (nrows, ncols) = matrix.dim();
    if nrows != ncols {
        return false;
    }
    let mut scale = 0.0f64;
    for i in 0..nrows {
        for j in 0..ncols {
            scale = scale.max(matrix[[i, j]].abs());
        }
    }
    let tol = abs_tol + rel_tol * scale.max(1.0);
    for i in 0..nrows {
        for j in i + 1..ncols {
            if (matrix[[i, j]] - matrix[[j, i]]).abs() > tol {
                return false;
            }
        }
    }
    true
}

pub struct FaerArrayView<'a> {
    ptr: *const f64,
    rows: usize,
    cols: usize,
    row_stride: isize,
    col_stride: isize,
    owned: Option<Array2<f64>>,
    _marker: PhantomData<&'a f64>,
}

impl<'a> FaerArrayView<'a> {
    pub fn new<S: Data<Elem = f64>>(array: &'a ArrayBase<S, Ix2>) -> Self {
        let (rows, cols) = array.dim();
        let strides = array.strides();
        // Negative or zero strides can alias or reverse memory traversal, which
        // faer kernels do not expect. Such layouts get a compact owned copy.
        if strides[0] <= 0 || strides[1] <= 0 {
            let owned = array.to_owned();
            let owned_strides = owned.strides();
            return Self {
                ptr: owned.as_ptr(),
                rows,
                cols,
                row_stride: owned_strides[0],
                col_stride: owned_strides[1],
                owned: Some(owned),
                _marker: PhantomData,
            };
        }

        Self {
            ptr: array.as_ptr(),
            rows,
            cols,
            row_stride: strides[0],
            col_stride: strides[1],
            owned: None,
            _marker: PhantomData,
        }
    }

    #[inline]
    pub fn as_ref(&self) -> MatRef<'_, f64> {
        let (ptr, rows, cols, row_stride, col_stride) = if let Some(owned) = &self.owned {
            let strides = owned.strides();
            (
                owned.as_ptr(),
                owned.nrows(),
                owned.ncols(),
                strides[0],
                strides[1],
            )
        } else {
            (
                self.ptr,
                self.rows,
                self.cols,
                self.row_stride,
                self.col_stride,
            )
        };
        // SAFETY: pointer/shape/strides either come directly from a live ndarray
        // view with positive strides, or from an owned compact copy stored inside
        // this wrapper, which guarantees validity for the returned view lifetime.
        unsafe { MatRef::from_raw_parts(ptr, rows, cols, row_stride, col_stride) }
    }
}

pub struct FaerColView<'a> {
    ptr: *const f64,
    len: usize,
    stride: isize,
    owned: Option<Array1<f64>>,
    _marker: PhantomData<&'a f64>,
}

impl<'a> FaerColView<'a> {
    pub fn new<S: Data<Elem = f64>>(array: &'a ArrayBase<S, Ix1>) -> Self {
        let len = array.len();
        let stride = array.strides()[0];
        if stride <= 0 {
            let owned = array.to_owned();
            return Self {
                ptr: owned.as_ptr(),
                len,
                stride: 1,
                owned: Some(owned),
                _marker: PhantomData,
            };
        }
        Self {
            ptr: array.as_ptr(),
            len,
            stride,
            owned: None,
            _marker: PhantomData,
        }
    }

    #[inline]
    pub fn as_ref(&self) -> MatRef<'_, f64> {
        let (ptr, len, stride) = if let Some(owned) = &self.owned {
            (owned.as_ptr(), owned.len(), 1)
        } else {
            (self.ptr, self.len, self.stride)
        };
        // SAFETY: analogous to FaerArrayView::as_ref.
        unsafe { MatRef::from_raw_parts(ptr, len, 1, stride, 0) }
    }
}

pub trait FaerEigh {
    fn eigh(&self, side: Side) -> Result<(Array1<f64>, Array2<f64>), FaerLinalgError>;
}

impl<S: Data<Elem = f64>> FaerEigh for ArrayBase<S, Ix2> {
    fn eigh(&self, side: Side) -> Result<(Array1<f64>, Array2<f64>), FaerLinalgError> {
        let faer_view = FaerArrayView::new(self);
        let eigen = faer_view
            .as_ref()
            .self_adjoint_eigen(side)
            .map_err(FaerLinalgError::SelfAdjointEigen)?;
        let values = diag_to_array(eigen.S());
        let vectors = mat_to_array(eigen.U());
        Ok((values, vectors))
    }
}
