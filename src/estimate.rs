use crate::faer_ndarray::FaerLinalgError;
use crate::types::SolveMode;
use thiserror::Error;

/// Error type shared by the density pipeline and the imbalance trainer.
///
/// Configuration variants are raised eagerly, before any numeric work.
/// Numeric preconditions and solve failures surface from the stage that
/// detected them; nothing is retried internally.
#[derive(Error)]
pub enum EstimationError {
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Sample count mismatch: space A has {samples_a} samples while space B has {samples_b} samples")]
    SampleCountMismatch { samples_a: usize, samples_b: usize },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error(
        "Point {point} has kstar = {kstar}; at least 2 neighbors are required for an unbiased variance estimate"
    )]
    KstarTooSmall { point: usize, kstar: usize },

    #[error("Numerical precondition violated: {0}")]
    NumericPrecondition(String),

    #[error(
        "The {mode} solve of the BMTI linear system failed ({source}). The system may be singular or ill-conditioned; retrying with the {alternate} mode is possible.",
        alternate = .mode.alternate()
    )]
    LinearSystemSolveFailed {
        mode: SolveMode,
        source: FaerLinalgError,
    },

    #[error("Eigendecomposition failed: {0}")]
    EigendecompositionFailed(FaerLinalgError),
}

// Ensure Debug prints with actual line breaks by delegating to Display
impl core::fmt::Debug for EstimationError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self)
    }
}

impl EstimationError {
    /// True for errors raised while validating parameters, before numeric work.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            EstimationError::InvalidConfiguration(_)
                | EstimationError::SampleCountMismatch { .. }
                | EstimationError::InvalidInput(_)
        )
    }

    /// The solve mode that failed, when this is a linear-solve failure.
    pub fn failed_solve_mode(&self) -> Option<SolveMode> {
        match self {
            EstimationError::LinearSystemSolveFailed { mode, .. } => Some(*mode),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn solve_failures_name_the_mode_and_suggest_the_other() {
        let err = EstimationError::LinearSystemSolveFailed {
            mode: SolveMode::Sparse,
            source: FaerLinalgError::SparseCholesky,
        };
        assert_eq!(err.failed_solve_mode(), Some(SolveMode::Sparse));
        let message = err.to_string();
        assert!(message.contains("sparse solve"), "{message}");
        assert!(message.contains("dense mode"), "{message}");
        assert!(!err.is_configuration());

        let config = EstimationError::InvalidConfiguration("bad".to_string());
        assert_eq!(config.failed_solve_mode(), None);
        assert!(config.is_configuration());
    }
}
