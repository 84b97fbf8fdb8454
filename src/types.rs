use crate::estimate::EstimationError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// How the BMTI linear system is solved.
///
/// `Dense` materializes the N×N matrix and factorizes it directly; `Sparse`
/// keeps the O(nspar) representation and uses a sparse Cholesky factorization
/// (the memory-efficient mode).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SolveMode {
    #[default]
    Dense,
    Sparse,
}

impl SolveMode {
    pub fn from_mem_efficient(mem_efficient: bool) -> Self {
        if mem_efficient {
            SolveMode::Sparse
        } else {
            SolveMode::Dense
        }
    }

    /// The alternate mode a caller may retry with after a solve failure.
    pub fn alternate(self) -> Self {
        match self {
            SolveMode::Dense => SolveMode::Sparse,
            SolveMode::Sparse => SolveMode::Dense,
        }
    }
}

impl fmt::Display for SolveMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SolveMode::Dense => write!(f, "dense"),
            SolveMode::Sparse => write!(f, "sparse"),
        }
    }
}

/// Per-edge precision weighting used when assembling the BMTI system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum DeltaFErrorMode {
    /// Inverse variance with a redundancy correction `sqrt(k*_i k*_j)`,
    /// treating the cross-covariance of the deltas as diagonal.
    #[default]
    #[serde(rename = "uncorr")]
    Uncorrelated,
    /// Least-squares diagonal approximation of the inverse cross-covariance.
    #[serde(rename = "LSDI")]
    Lsdi,
    /// Unit weight on every edge.
    #[serde(rename = "none")]
    Unweighted,
}

impl FromStr for DeltaFErrorMode {
    type Err = EstimationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "uncorr" => Ok(DeltaFErrorMode::Uncorrelated),
            "LSDI" => Ok(DeltaFErrorMode::Lsdi),
            "none" => Ok(DeltaFErrorMode::Unweighted),
            other => Err(EstimationError::InvalidConfiguration(format!(
                "delta_F_err '{other}' is not valid, choose 'uncorr', 'LSDI' or 'none'"
            ))),
        }
    }
}

/// Shared-neighbor estimator of the correlation between gradient estimates at
/// two neighboring points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CorrelationMethod {
    #[default]
    Jaccard,
    Geometric,
    SquaredGeometric,
}

impl FromStr for CorrelationMethod {
    type Err = EstimationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "jaccard" => Ok(CorrelationMethod::Jaccard),
            "geometric" => Ok(CorrelationMethod::Geometric),
            "squared_geometric" => Ok(CorrelationMethod::SquaredGeometric),
            other => Err(EstimationError::InvalidConfiguration(format!(
                "unknown correlation method '{other}', choose 'jaccard', 'geometric' or 'squared_geometric'"
            ))),
        }
    }
}

/// First-order optimizer used by the information imbalance trainer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OptimizerKind {
    #[default]
    Sgd,
    Adam,
    AdamW,
}

impl FromStr for OptimizerKind {
    type Err = EstimationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sgd" => Ok(OptimizerKind::Sgd),
            "adam" => Ok(OptimizerKind::Adam),
            "adamw" => Ok(OptimizerKind::AdamW),
            _ => Err(EstimationError::InvalidConfiguration(format!(
                "unknown optimizer \"{s}\", choose 'sgd', 'adam' or 'adamw'"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_strings_parse_and_reject_unknown_names() {
        assert_eq!(
            "LSDI".parse::<DeltaFErrorMode>().unwrap(),
            DeltaFErrorMode::Lsdi
        );
        assert_eq!(
            "none".parse::<DeltaFErrorMode>().unwrap(),
            DeltaFErrorMode::Unweighted
        );
        assert!(matches!(
            "lsdi".parse::<DeltaFErrorMode>(),
            Err(EstimationError::InvalidConfiguration(_))
        ));
        assert_eq!(
            "AdamW".parse::<OptimizerKind>().unwrap(),
            OptimizerKind::AdamW
        );
        assert!("rmsprop".parse::<OptimizerKind>().is_err());
        assert!("cosine".parse::<CorrelationMethod>().is_err());
    }

    #[test]
    fn alternate_solve_mode_flips() {
        assert_eq!(SolveMode::Dense.alternate(), SolveMode::Sparse);
        assert_eq!(SolveMode::from_mem_efficient(true), SolveMode::Sparse);
    }
}
