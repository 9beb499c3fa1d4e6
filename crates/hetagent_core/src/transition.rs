//! Perfect-foresight transition along a given interest-rate path.
//!
//! The value function is swept backward from a terminal steady state with
//! one implicit HJB step per period, then the distribution is pushed forward
//! with implicit KF steps using the generators of the backward sweep.

use crate::equilibrium::aggregate_assets;
use crate::error::{SolverError, SolverResult};
use crate::generator::build_generator;
use crate::linalg::{shifted, solve_banded};
use crate::model::HuggettModel;
use crate::upwind::{compute_policy, ConcavityPolicy};
use nalgebra::DVector;
use nalgebra_sparse::CsrMatrix;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionSettings {
    pub dt: f64,
    /// Interest rate in each period; its length is the horizon.
    pub rates: Vec<f64>,
    #[serde(default)]
    pub concavity: ConcavityPolicy,
}

#[derive(Debug, Clone)]
pub struct TransitionPath {
    /// Period start times, `n * dt`.
    pub times: Vec<f64>,
    /// Value function at the start of every period.
    pub values: Vec<DVector<f64>>,
    /// Selected savings drift in every period.
    pub drifts: Vec<DVector<f64>>,
    /// Masses at every period boundary, including the initial one.
    pub masses: Vec<DVector<f64>>,
    pub aggregate_assets: Vec<f64>,
}

pub fn solve_transition(
    model: &HuggettModel,
    settings: &TransitionSettings,
    terminal_value: &DVector<f64>,
    initial_mass: &DVector<f64>,
) -> SolverResult<TransitionPath> {
    let n = model.n_states();
    let horizon = settings.rates.len();
    if !(settings.dt > 0.0) {
        return Err(SolverError::InvalidInput(format!(
            "transition time step must be positive, got {}",
            settings.dt
        )));
    }
    if horizon == 0 {
        return Err(SolverError::InvalidInput(
            "interest rate path is empty".to_string(),
        ));
    }
    if terminal_value.len() != n || initial_mass.len() != n {
        return Err(SolverError::InvalidInput(format!(
            "transition inputs must have {} states, got value {} and mass {}",
            n,
            terminal_value.len(),
            initial_mass.len()
        )));
    }

    let ordering = model.space.reversed_ordering();
    let dt = settings.dt;

    let mut values = vec![DVector::zeros(0); horizon];
    let mut drifts = vec![DVector::zeros(0); horizon];
    let mut generators: Vec<Option<CsrMatrix<f64>>> = vec![None; horizon];
    let mut next = terminal_value.clone();
    for period in (0..horizon).rev() {
        let period_model = model.with_interest_rate(settings.rates[period]);
        period_model.check_borrowing_limit()?;
        let policy = compute_policy(&period_model, &next, settings.concavity)?;
        let generator = build_generator(&period_model, &policy)?;
        let system = shifted(&generator, period_model.params.rho + 1.0 / dt, -1.0);
        let rhs = policy.rewards(&period_model) + &next / dt;
        let value = solve_banded(&system, &rhs, &ordering)?;
        debug!(period, r = settings.rates[period], "backward HJB step");

        drifts[period] = policy.drift;
        generators[period] = Some(generator);
        values[period] = value.clone();
        next = value;
    }

    let mut masses = Vec::with_capacity(horizon + 1);
    let mut aggregates = Vec::with_capacity(horizon + 1);
    masses.push(initial_mass.clone());
    aggregates.push(aggregate_assets(model, initial_mass));
    for (period, generator) in generators.into_iter().enumerate() {
        let generator = generator.ok_or_else(|| {
            SolverError::InvalidInput(format!("missing generator for period {}", period))
        })?;
        let system = shifted(&generator.transpose(), 1.0, -dt);
        let mass = solve_banded(&system, &masses[period], &ordering)?;
        aggregates.push(aggregate_assets(model, &mass));
        masses.push(mass);
    }
    info!(
        horizon,
        initial = aggregates[0],
        terminal = aggregates[horizon],
        "transition path solved"
    );

    Ok(TransitionPath {
        times: (0..=horizon).map(|k| k as f64 * dt).collect(),
        values,
        drifts,
        masses,
        aggregate_assets: aggregates,
    })
}
