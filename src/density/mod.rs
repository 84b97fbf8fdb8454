//! Graph-based log-density estimation.
//!
//! [`DensityAdvanced`] runs the pipeline gradients → pairwise deltas →
//! linear system → solve over a borrowed [`NeighborGraph`]. Each stage is
//! cached together with the inputs it was computed from; public `compute_*`
//! methods always recompute their own stage and fill missing upstream
//! stages on demand.

pub mod bmti;
pub mod deltas;
pub mod gradients;
pub mod prior;

use crate::estimate::EstimationError;
use crate::graph::{EdgeCorrelation, NeighborGraph, compute_edge_correlation};
use crate::types::{CorrelationMethod, DeltaFErrorMode, SolveMode};
use ndarray::Array1;
use serde::{Deserialize, Serialize};
use std::time::Instant;

pub use bmti::{
    BmtiSystem, assemble_bmti_system, edge_weights, log_density_error, solve_bmti_system,
};
pub use deltas::{DeltaFs, compute_delta_fs, compute_inv_cross_covariance};
pub use gradients::{GradientField, compute_gradients};
pub use prior::{LogDensityPrior, compute_density_kstar_nn};

/// Above this many points the dense solve is likely to exhaust memory.
pub const DENSE_SOLVE_ADVISORY_POINTS: usize = 15_000;

/// Options of a regularized BMTI run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BmtiConfig {
    /// Weight of the graph likelihood against the prior, in `(0, 1]`.
    pub alpha: f64,
    pub delta_f_err: DeltaFErrorMode,
    pub comp_log_den_err: bool,
    /// Solve with sparse Cholesky instead of a dense factorization.
    pub mem_efficient: bool,
    pub pearson_method: CorrelationMethod,
}

impl Default for BmtiConfig {
    fn default() -> Self {
        Self {
            alpha: 0.1,
            delta_f_err: DeltaFErrorMode::default(),
            comp_log_den_err: false,
            mem_efficient: false,
            pearson_method: CorrelationMethod::default(),
        }
    }
}

/// Output of a BMTI solve.
#[derive(Debug, Clone)]
pub struct BmtiEstimate {
    pub log_den: Array1<f64>,
    /// Present when the error estimate was requested.
    pub log_den_err: Option<Array1<f64>>,
    pub alpha: f64,
    pub mode: SolveMode,
}

pub struct DensityAdvanced<'g> {
    graph: &'g NeighborGraph,
    pearson_method: CorrelationMethod,
    gradients: Option<GradientField>,
    correlation: Option<EdgeCorrelation>,
    deltas: Option<(CorrelationMethod, DeltaFs)>,
    inv_cross_cov: Option<(CorrelationMethod, Array1<f64>)>,
    kstar_prior: Option<LogDensityPrior>,
    bmti: Option<BmtiEstimate>,
}

impl<'g> DensityAdvanced<'g> {
    pub fn new(graph: &'g NeighborGraph) -> Self {
        Self {
            graph,
            pearson_method: CorrelationMethod::default(),
            gradients: None,
            correlation: None,
            deltas: None,
            inv_cross_cov: None,
            kstar_prior: None,
            bmti: None,
        }
    }

    pub fn graph(&self) -> &'g NeighborGraph {
        self.graph
    }

    pub fn gradients(&self) -> Option<&GradientField> {
        self.gradients.as_ref()
    }

    pub fn correlation(&self) -> Option<&EdgeCorrelation> {
        self.correlation.as_ref()
    }

    pub fn delta_fs(&self) -> Option<&DeltaFs> {
        self.deltas.as_ref().map(|(_, d)| d)
    }

    pub fn inv_cross_covariance(&self) -> Option<&Array1<f64>> {
        self.inv_cross_cov.as_ref().map(|(_, inv)| inv)
    }

    pub fn kstar_prior(&self) -> Option<&LogDensityPrior> {
        self.kstar_prior.as_ref()
    }

    pub fn bmti(&self) -> Option<&BmtiEstimate> {
        self.bmti.as_ref()
    }

    /// Log-density of the latest BMTI solve, falling back to the k*-NN one.
    pub fn log_den(&self) -> Option<&Array1<f64>> {
        self.bmti
            .as_ref()
            .map(|b| &b.log_den)
            .or_else(|| self.kstar_prior.as_ref().map(|p| &p.log_den))
    }

    pub fn log_den_err(&self) -> Option<&Array1<f64>> {
        match &self.bmti {
            Some(b) => b.log_den_err.as_ref(),
            None => self.kstar_prior.as_ref().map(|p| &p.log_den_err),
        }
    }

    pub fn compute_grads(
        &mut self,
        comp_covmat: bool,
    ) -> Result<&GradientField, EstimationError> {
        let start = Instant::now();
        let field = compute_gradients(self.graph, comp_covmat)?;
        log::info!(
            "[BMTI] {:.2} seconds computing gradients (covariance: {})",
            start.elapsed().as_secs_f64(),
            comp_covmat
        );
        // Deltas depend on the covariance mode of the gradients.
        self.deltas = None;
        self.inv_cross_cov = None;
        Ok(self.gradients.insert(field))
    }

    fn ensure_covariance_gradients(&mut self) -> Result<(), EstimationError> {
        if !self.gradients.as_ref().is_some_and(GradientField::has_covmat) {
            self.compute_grads(true)?;
        }
        Ok(())
    }

    fn ensure_correlation(&mut self, method: CorrelationMethod) -> Result<(), EstimationError> {
        if self.correlation.as_ref().map(EdgeCorrelation::method) != Some(method) {
            self.correlation = Some(compute_edge_correlation(self.graph, method)?);
        }
        Ok(())
    }

    /// Semisum-of-gradients deltas along every edge, with their variances.
    pub fn compute_delta_fs(
        &mut self,
        pearson_method: CorrelationMethod,
    ) -> Result<&DeltaFs, EstimationError> {
        self.pearson_method = pearson_method;
        self.ensure_covariance_gradients()?;
        self.ensure_correlation(pearson_method)?;
        let (Some(gradients), Some(correlation)) = (&self.gradients, &self.correlation) else {
            return Err(EstimationError::InvalidInput(
                "gradient or correlation stage missing".to_string(),
            ));
        };
        let start = Instant::now();
        let deltas = compute_delta_fs(self.graph, gradients, correlation)?;
        log::info!(
            "[BMTI] {:.2} seconds computing gradient corrections",
            start.elapsed().as_secs_f64()
        );
        self.inv_cross_cov = None;
        Ok(&self.deltas.insert((pearson_method, deltas)).1)
    }

    fn ensure_delta_fs(&mut self) -> Result<(), EstimationError> {
        let method = self.pearson_method;
        if self.deltas.as_ref().map(|(m, _)| *m) != Some(method) {
            self.compute_delta_fs(method)?;
        }
        Ok(())
    }

    /// LSDI diagonal approximation of the inverse delta cross-covariance.
    pub fn compute_delta_fs_inv_cross_covariance(
        &mut self,
        pearson_method: CorrelationMethod,
    ) -> Result<&Array1<f64>, EstimationError> {
        self.pearson_method = pearson_method;
        self.ensure_delta_fs()?;
        self.ensure_correlation(pearson_method)?;
        let (Some(gradients), Some(correlation), Some((_, deltas))) =
            (&self.gradients, &self.correlation, &self.deltas)
        else {
            return Err(EstimationError::InvalidInput(
                "delta stage missing before LSDI".to_string(),
            ));
        };
        let start = Instant::now();
        let inv = compute_inv_cross_covariance(self.graph, gradients, correlation, deltas)?;
        log::info!(
            "[BMTI] {:.2} seconds computing the deltaFs cross-covariance",
            start.elapsed().as_secs_f64()
        );
        Ok(&self.inv_cross_cov.insert((pearson_method, inv)).1)
    }

    fn ensure_inv_cross_covariance(&mut self) -> Result<(), EstimationError> {
        let method = self.pearson_method;
        if self.inv_cross_cov.as_ref().map(|(m, _)| *m) != Some(method) {
            self.compute_delta_fs_inv_cross_covariance(method)?;
        }
        Ok(())
    }

    pub fn compute_density_kstar_nn(&mut self) -> Result<&LogDensityPrior, EstimationError> {
        let prior = compute_density_kstar_nn(self.graph)?;
        Ok(self.kstar_prior.insert(prior))
    }

    /// Pure graph estimate: `alpha = 1` with a uniform prior. The result is
    /// defined up to an additive constant per connected component and is
    /// returned with zero mean on each.
    pub fn compute_density_bmti(
        &mut self,
        delta_f_err: DeltaFErrorMode,
        comp_log_den_err: bool,
        mem_efficient: bool,
    ) -> Result<&BmtiEstimate, EstimationError> {
        let uniform = LogDensityPrior::uniform(self.graph.n_points());
        self.compute_density_bmti_reg(
            1.0,
            Some(uniform),
            delta_f_err,
            comp_log_den_err,
            mem_efficient,
        )
    }

    /// Regularized estimate. Without an explicit `prior` the k*-NN density is
    /// used.
    pub fn compute_density_bmti_reg(
        &mut self,
        alpha: f64,
        prior: Option<LogDensityPrior>,
        delta_f_err: DeltaFErrorMode,
        comp_log_den_err: bool,
        mem_efficient: bool,
    ) -> Result<&BmtiEstimate, EstimationError> {
        if !(alpha > 0.0 && alpha <= 1.0) {
            return Err(EstimationError::InvalidConfiguration(format!(
                "alpha must lie in (0, 1], got {alpha}"
            )));
        }
        let n = self.graph.n_points();
        if let Some(prior) = &prior {
            prior.validate(n)?;
        }
        let mode = SolveMode::from_mem_efficient(mem_efficient);

        self.ensure_delta_fs()?;
        let prior = match prior {
            Some(prior) => prior,
            None => self.compute_density_kstar_nn()?.clone(),
        };
        if delta_f_err == DeltaFErrorMode::Lsdi {
            self.ensure_inv_cross_covariance()?;
        }

        if n > DENSE_SOLVE_ADVISORY_POINTS && mode == SolveMode::Dense {
            log::warn!(
                "[BMTI] {n} points with the dense solver; if memory runs out, use the memory-efficient (sparse) mode"
            );
        }

        let Some((_, deltas)) = &self.deltas else {
            return Err(EstimationError::InvalidInput(
                "delta stage missing before BMTI".to_string(),
            ));
        };
        let start = Instant::now();
        let weights = edge_weights(
            self.graph,
            delta_f_err,
            &deltas.fij_var,
            self.inv_cross_cov.as_ref().map(|(_, inv)| inv),
        )?;
        let system = assemble_bmti_system(self.graph, &deltas.fij, &weights, alpha, &prior)?;
        let assembled = Instant::now();
        log::info!(
            "[BMTI] {:.2} seconds to fill sparse matrix",
            (assembled - start).as_secs_f64()
        );

        let log_den = solve_bmti_system(&system, mode).inspect_err(|err| {
            if let Some(failed) = err.failed_solve_mode() {
                log::warn!(
                    "[BMTI] the {failed} solve failed; the {} mode may still succeed",
                    failed.alternate()
                );
            }
        })?;
        log::info!(
            "[BMTI] {:.2} seconds to solve linear system ({mode})",
            assembled.elapsed().as_secs_f64()
        );

        let log_den_err = if comp_log_den_err {
            let inverted = Instant::now();
            let err = log_density_error(&system)?;
            log::info!(
                "[BMTI] {:.2} seconds inverting A matrix",
                inverted.elapsed().as_secs_f64()
            );
            Some(err)
        } else {
            None
        };
        log::info!(
            "[BMTI] {:.2} seconds for BMTI density estimation",
            start.elapsed().as_secs_f64()
        );

        Ok(self.bmti.insert(BmtiEstimate {
            log_den,
            log_den_err,
            alpha,
            mode,
        }))
    }

    /// Runs [`Self::compute_density_bmti_reg`] with the options in `config`.
    pub fn estimate(
        &mut self,
        config: &BmtiConfig,
        prior: Option<LogDensityPrior>,
    ) -> Result<&BmtiEstimate, EstimationError> {
        self.pearson_method = config.pearson_method;
        self.compute_density_bmti_reg(
            config.alpha,
            prior,
            config.delta_f_err,
            config.comp_log_den_err,
            config.mem_efficient,
        )
    }
}
