//! Upwind finite differences and the implied consumption/savings policy.

use crate::error::{SolverError, SolverResult};
use crate::model::HuggettModel;
use nalgebra::DVector;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Floor applied to finite-difference derivatives before inverting marginal
/// utility, so a locally decreasing value function yields large consumption
/// instead of NaN.
const DV_FLOOR: f64 = 1e-12;

/// How to resolve states where both the forward and the backward difference
/// claim the upwind direction. That only happens when the value function is
/// locally convex.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ConcavityPolicy {
    /// Fail with [`SolverError::NonConcave`].
    Strict,
    /// Use the backward difference and keep going.
    #[default]
    PreferBackward,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Forward,
    Backward,
    Stationary,
}

/// Per-state policy implied by a value function.
#[derive(Debug, Clone)]
pub struct UpwindPolicy {
    /// Derivative used by the upwind scheme.
    pub dv: DVector<f64>,
    pub consumption: DVector<f64>,
    pub drift_forward: DVector<f64>,
    pub drift_backward: DVector<f64>,
    /// Selected drift `z + r*a - c`; exactly zero at stationary states.
    pub drift: DVector<f64>,
    pub direction: Vec<Direction>,
    /// States where the tie-break in [`ConcavityPolicy::PreferBackward`] fired.
    pub non_concave: usize,
}

impl UpwindPolicy {
    pub fn rewards(&self, model: &HuggettModel) -> DVector<f64> {
        self.consumption.map(|c| model.utility.utility(c))
    }
}

pub fn compute_policy(
    model: &HuggettModel,
    value: &DVector<f64>,
    concavity: ConcavityPolicy,
) -> SolverResult<UpwindPolicy> {
    let n = model.n_states();
    if value.len() != n {
        return Err(SolverError::InvalidInput(format!(
            "value function dimension mismatch. Expected {}, got {}",
            n,
            value.len()
        )));
    }

    let utility = model.utility;
    let forward_spacing = model.grid.forward_spacing();
    let backward_spacing = model.grid.backward_spacing();

    let mut dv = DVector::zeros(n);
    let mut consumption = DVector::zeros(n);
    let mut drift_forward = DVector::zeros(n);
    let mut drift_backward = DVector::zeros(n);
    let mut drift = DVector::zeros(n);
    let mut direction = Vec::with_capacity(n);
    let mut non_concave = 0usize;

    for idx in 0..n {
        let i = model.space.coordinate(idx, 0);
        let cash = model.cash_on_hand(idx);
        let dv_stationary = utility.marginal(cash);

        // At the grid edges the missing difference is replaced by the
        // zero-drift marginal utility, which enforces the state constraint.
        let upper = model.space.neighbor(idx, 0, 1);
        let lower = model.space.neighbor(idx, 0, -1);
        let dv_f = match upper {
            Some(j) => ((value[j] - value[idx]) / forward_spacing[i]).max(DV_FLOOR),
            None => dv_stationary,
        };
        let dv_b = match lower {
            Some(j) => ((value[idx] - value[j]) / backward_spacing[i]).max(DV_FLOOR),
            None => dv_stationary,
        };

        let c_f = utility.inverse_marginal(dv_f);
        let c_b = utility.inverse_marginal(dv_b);
        let s_f = cash - c_f;
        let s_b = cash - c_b;
        drift_forward[idx] = s_f;
        drift_backward[idx] = s_b;

        let use_forward = s_f > 0.0 && upper.is_some();
        let use_backward = s_b < 0.0 && lower.is_some();

        let chosen = match (use_forward, use_backward) {
            (true, true) => {
                non_concave += 1;
                match concavity {
                    ConcavityPolicy::Strict => Direction::Forward,
                    ConcavityPolicy::PreferBackward => Direction::Backward,
                }
            }
            (true, false) => Direction::Forward,
            (false, true) => Direction::Backward,
            (false, false) => Direction::Stationary,
        };

        let (d, c, s) = match chosen {
            Direction::Forward => (dv_f, c_f, s_f),
            Direction::Backward => (dv_b, c_b, s_b),
            Direction::Stationary => (dv_stationary, cash, 0.0),
        };
        dv[idx] = d;
        consumption[idx] = c;
        drift[idx] = s;
        direction.push(chosen);
    }

    if non_concave > 0 {
        if concavity == ConcavityPolicy::Strict {
            return Err(SolverError::NonConcave { count: non_concave });
        }
        debug!(non_concave, "upwind tie-break used backward differences");
    }

    Ok(UpwindPolicy {
        dv,
        consumption,
        drift_forward,
        drift_backward,
        drift,
        direction,
        non_concave,
    })
}
