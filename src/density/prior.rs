use crate::estimate::EstimationError;
use crate::graph::NeighborGraph;
use crate::linalg::utils::log_unit_ball_volume;
use ndarray::Array1;

/// Point-wise log-density with its standard error.
#[derive(Debug, Clone, PartialEq)]
pub struct LogDensityPrior {
    pub log_den: Array1<f64>,
    pub log_den_err: Array1<f64>,
}

impl LogDensityPrior {
    pub fn new(log_den: Array1<f64>, log_den_err: Array1<f64>) -> Self {
        Self {
            log_den,
            log_den_err,
        }
    }

    /// Zero log-density with unit error at every point.
    pub fn uniform(n: usize) -> Self {
        Self {
            log_den: Array1::zeros(n),
            log_den_err: Array1::ones(n),
        }
    }

    pub fn len(&self) -> usize {
        self.log_den.len()
    }

    pub fn is_empty(&self) -> bool {
        self.log_den.is_empty()
    }

    /// Checks lengths against `n` points, finite values and finite non-zero
    /// errors.
    pub fn validate(&self, n: usize) -> Result<(), EstimationError> {
        if self.log_den.len() != n || self.log_den_err.len() != n {
            return Err(EstimationError::InvalidInput(format!(
                "prior has {} values and {} errors for {n} points",
                self.log_den.len(),
                self.log_den_err.len()
            )));
        }
        if let Some((i, err)) = self
            .log_den_err
            .iter()
            .enumerate()
            .find(|(_, err)| !(err.is_finite() && **err != 0.0))
        {
            return Err(EstimationError::NumericPrecondition(format!(
                "prior error at point {i} is {err}; errors must be finite and non-zero"
            )));
        }
        if let Some(i) = self.log_den.iter().position(|v| !v.is_finite()) {
            return Err(EstimationError::NumericPrecondition(format!(
                "prior log-density at point {i} is not finite"
            )));
        }
        Ok(())
    }
}

/// Classic k*-NN estimate `ρ_i = k*_i / (N · V_d · r_i^d)`, with error `1/√k*_i`.
pub fn compute_density_kstar_nn(graph: &NeighborGraph) -> Result<LogDensityPrior, EstimationError> {
    let n = graph.n_points();
    let d = graph.intrinsic_dim();
    let log_n = (n as f64).ln();
    let log_vd = log_unit_ball_volume(d);

    let mut log_den = Array1::<f64>::zeros(n);
    let mut log_den_err = Array1::<f64>::zeros(n);
    for i in 0..n {
        let k = graph.kstar()[i];
        let r = graph.kstar_radius(i);
        if k == 0 || !(r > 0.0) {
            return Err(EstimationError::NumericPrecondition(format!(
                "point {i} has kstar = {k} and neighborhood radius {r}; the k*-NN density is undefined"
            )));
        }
        let k = k as f64;
        log_den[i] = k.ln() - log_n - log_vd - d as f64 * r.ln();
        log_den_err[i] = 1.0 / k.sqrt();
    }
    Ok(LogDensityPrior {
        log_den,
        log_den_err,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn one_dimensional_estimate_matches_closed_form() {
        // Unit ball in 1D has volume 2.
        let coords = array![[0.0], [1.0], [3.0]];
        let neighbors = vec![vec![1, 2], vec![0, 2], vec![1, 0]];
        let g = NeighborGraph::from_neighbor_lists(coords.view(), &neighbors, 1).expect("graph");
        let prior = compute_density_kstar_nn(&g).expect("prior");
        let expected = (2.0f64 / (3.0 * 2.0 * 3.0)).ln();
        assert!((prior.log_den[0] - expected).abs() < 1e-12);
        assert!((prior.log_den_err[0] - 1.0 / 2.0f64.sqrt()).abs() < 1e-12);
        // Point 1 reaches 2 units; point 2 reaches 3.
        assert!(prior.log_den[1] > prior.log_den[2]);
    }

    #[test]
    fn coincident_neighbors_are_rejected() {
        let coords = array![[0.0], [0.0], [1.0]];
        let neighbors = vec![vec![1], vec![0], vec![1]];
        let g = NeighborGraph::from_neighbor_lists(coords.view(), &neighbors, 1).expect("graph");
        assert!(compute_density_kstar_nn(&g).is_err());
    }
}
