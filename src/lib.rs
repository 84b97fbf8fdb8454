#![deny(dead_code)]
#![deny(unused_imports)]
#![allow(non_snake_case)]

//! Neighbor-graph log-density estimation (BMTI) and differentiable
//! information imbalance feature weighting.

pub mod density;
pub mod estimate;
pub mod graph;
pub mod imbalance;
pub mod linalg;
pub mod types;

pub use linalg::faer_ndarray;

pub use density::{BmtiConfig, BmtiEstimate, DensityAdvanced, LogDensityPrior};
pub use estimate::EstimationError;
pub use graph::{EdgeCorrelation, NeighborGraph, compute_edge_correlation};
pub use imbalance::{DiffImbalance, DiffImbalanceConfig, ImbalanceTrajectory, SmoothingPolicy};
pub use types::{CorrelationMethod, DeltaFErrorMode, OptimizerKind, SolveMode};
