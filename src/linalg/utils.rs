#[derive(Default, Clone, Copy)]
pub(crate) struct KahanSum {
    sum: f64,
    c: f64,
}

impl KahanSum {
    pub(crate) fn add(&mut self, value: f64) {
        let y = value - self.c;
        let t = self.sum + y;
        self.c = (t - self.sum) - y;
        self.sum = t;
    }

    pub(crate) fn sum(self) -> f64 {
        self.sum
    }
}

/// Mean and sample standard deviation (`ddof = 1`) with compensated sums.
/// A single value has standard deviation zero.
pub(crate) fn mean_and_sample_std(values: &[f64]) -> (f64, f64) {
    let n = values.len();
    if n == 0 {
        return (f64::NAN, f64::NAN);
    }
    let mut total = KahanSum::default();
    for &v in values {
        total.add(v);
    }
    let mean = total.sum() / n as f64;
    if n == 1 {
        return (mean, 0.0);
    }
    let mut sq = KahanSum::default();
    for &v in values {
        let d = v - mean;
        sq.add(d * d);
    }
    (mean, (sq.sum() / (n - 1) as f64).sqrt())
}

/// Natural log of the volume of the unit ball in `d` dimensions,
/// `ln(π^{d/2} / Γ(d/2 + 1))`.
pub(crate) fn log_unit_ball_volume(d: usize) -> f64 {
    // Γ(d/2 + 1) by upward recurrence from Γ(1) = 1 or Γ(1/2) = √π.
    let half_pi_ln = 0.5 * std::f64::consts::PI.ln();
    let (mut x, mut log_gamma) = if d % 2 == 0 {
        (1.0, 0.0)
    } else {
        (0.5, half_pi_ln)
    };
    let target = d as f64 / 2.0 + 1.0;
    while x + 0.5 < target {
        log_gamma += x.ln();
        x += 1.0;
    }
    d as f64 * half_pi_ln - log_gamma
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::PI;

    #[test]
    fn kahan_sum_recovers_small_addends() {
        let mut acc = KahanSum::default();
        acc.add(1.0);
        for _ in 0..10_000 {
            acc.add(1e-16);
        }
        assert!((acc.sum() - (1.0 + 1e-12)).abs() < 1e-15);
    }

    #[test]
    fn sample_std_uses_bessel_correction() {
        let (mean, std) = mean_and_sample_std(&[1.0, 2.0, 3.0, 4.0]);
        assert!((mean - 2.5).abs() < 1e-15);
        assert!((std - (5.0f64 / 3.0).sqrt()).abs() < 1e-12);
    }

    #[test]
    fn unit_ball_volumes_match_closed_forms() {
        assert!((log_unit_ball_volume(1) - 2.0f64.ln()).abs() < 1e-12);
        assert!((log_unit_ball_volume(2) - PI.ln()).abs() < 1e-12);
        assert!((log_unit_ball_volume(3) - (4.0 * PI / 3.0).ln()).abs() < 1e-12);
        assert!((log_unit_ball_volume(4) - (PI * PI / 2.0).ln()).abs() < 1e-12);
    }
}
