//! Differentiable information imbalance: learns per-feature weights of a
//! space A so that its neighborhoods predict those of a target space B.
//!
//! [`DiffImbalance`] fixes the target ranks once and then runs minibatch
//! gradient descent on the smoothed imbalance, optionally with an L1
//! proximal step that drives irrelevant weights to zero.

pub mod distance;
pub mod objective;
pub mod optimizer;
pub mod smoothing;
pub mod trainer;

pub use distance::{periodic_delta, rank_matrix, weighted_dist2_matrix};
pub use objective::{ImbalanceEvaluation, ImbalanceObjective};
pub use optimizer::{LearningRateSchedule, Optimizer, OptimizerState, TrainState, l1_proximal};
pub use smoothing::{Smoothing, SmoothingPolicy, cosine_interpolate};
pub use trainer::{DiffImbalance, DiffImbalanceConfig, ImbalanceTrajectory};
