use serde::{Deserialize, Serialize};

/// Constant relative risk aversion utility.
///
/// `u(c) = ln c` when `sigma == 1`, otherwise `c^(1 - sigma) / (1 - sigma)`.
/// Non-positive consumption maps to `-inf`: the HJB solver treats such states
/// as infeasible rather than penalizing them.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Crra {
    pub sigma: f64,
}

impl Crra {
    pub fn new(sigma: f64) -> Self {
        Self { sigma }
    }

    fn is_log(&self) -> bool {
        (self.sigma - 1.0).abs() < 1e-12
    }

    pub fn utility(&self, c: f64) -> f64 {
        if c <= 0.0 {
            return f64::NEG_INFINITY;
        }
        if self.is_log() {
            c.ln()
        } else {
            c.powf(1.0 - self.sigma) / (1.0 - self.sigma)
        }
    }

    pub fn marginal(&self, c: f64) -> f64 {
        c.powf(-self.sigma)
    }

    pub fn inverse_marginal(&self, dv: f64) -> f64 {
        dv.powf(-1.0 / self.sigma)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn log_utility_when_sigma_is_one() {
        let u = Crra::new(1.0);
        assert_relative_eq!(u.utility(std::f64::consts::E), 1.0, epsilon = 1e-14);
        assert_relative_eq!(u.marginal(2.0), 0.5, epsilon = 1e-14);
    }

    #[test]
    fn inverse_marginal_undoes_marginal() {
        let u = Crra::new(2.0);
        for c in [0.05, 0.3, 1.7] {
            assert_relative_eq!(u.inverse_marginal(u.marginal(c)), c, epsilon = 1e-12);
        }
        assert_relative_eq!(u.utility(0.5), -2.0, epsilon = 1e-14);
    }

    #[test]
    fn infeasible_consumption_is_negative_infinity() {
        let u = Crra::new(2.0);
        assert_eq!(u.utility(0.0), f64::NEG_INFINITY);
        assert_eq!(u.utility(-1.0), f64::NEG_INFINITY);
    }
}
