//! Finite-difference HJB value iteration.
//!
//! Each iteration derives the upwind policy from the current value function,
//! assembles the generator `A`, and updates the value function with either
//!
//! - the implicit scheme `((rho + 1/Δ) I - A) V' = u + V / Δ`, or
//! - the explicit scheme `V' = V + Δ (u + dV * s + A_switch V - rho V)`.
//!
//! The solver is a small state machine so callers can drive it step by step
//! (the wasm runner does this to report progress) or run it to completion
//! with [`solve_hjb`].

use crate::error::{SolverError, SolverResult};
use crate::generator::build_generator;
use crate::linalg::{max_abs, shifted, solve_banded};
use crate::model::HuggettModel;
use crate::upwind::{compute_policy, ConcavityPolicy, UpwindPolicy};
use nalgebra::{DMatrix, DVector};
use nalgebra_sparse::CsrMatrix;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Changes larger than this multiple of the first change are treated as
/// divergence.
const DIVERGENCE_FACTOR: f64 = 1e8;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum UpdateScheme {
    /// Pseudo-time step `delta`; large values approach policy iteration.
    Implicit { delta: f64 },
    /// Explicit step. `None` uses the stability bound
    /// `0.9 * min Δa / max |z + r*a|`.
    Explicit { delta: Option<f64> },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HjbSettings {
    pub scheme: UpdateScheme,
    pub tolerance: f64,
    pub max_iterations: usize,
    #[serde(default)]
    pub concavity: ConcavityPolicy,
}

impl HjbSettings {
    pub fn implicit() -> Self {
        Self {
            scheme: UpdateScheme::Implicit { delta: 1000.0 },
            tolerance: 1e-6,
            max_iterations: 100,
            concavity: ConcavityPolicy::default(),
        }
    }

    pub fn explicit() -> Self {
        Self {
            scheme: UpdateScheme::Explicit { delta: None },
            tolerance: 1e-6,
            max_iterations: 100_000,
            concavity: ConcavityPolicy::default(),
        }
    }

    fn validate(&self) -> SolverResult<()> {
        if !(self.tolerance > 0.0) {
            return Err(SolverError::InvalidInput("tolerance must be positive".to_string()));
        }
        if self.max_iterations == 0 {
            return Err(SolverError::InvalidInput(
                "max_iterations must be greater than zero".to_string(),
            ));
        }
        let delta = match self.scheme {
            UpdateScheme::Implicit { delta } => Some(delta),
            UpdateScheme::Explicit { delta } => delta,
        };
        if let Some(delta) = delta {
            if !(delta > 0.0) || !delta.is_finite() {
                return Err(SolverError::InvalidInput(format!(
                    "time step must be positive and finite, got {}",
                    delta
                )));
            }
        }
        Ok(())
    }
}

impl Default for HjbSettings {
    fn default() -> Self {
        Self::implicit()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HjbState {
    /// Holding the initial guess; no iteration has run yet.
    Initializing,
    Iterating,
    Converged,
    Failed,
}

impl HjbState {
    pub fn is_terminal(self) -> bool {
        matches!(self, HjbState::Converged | HjbState::Failed)
    }
}

/// Converged value function with the policy and generator it implies.
#[derive(Debug, Clone)]
pub struct HjbSolution {
    pub value: DVector<f64>,
    pub policy: UpwindPolicy,
    pub generator: CsrMatrix<f64>,
    pub iterations: usize,
    /// Convergence metric per iteration.
    pub history: Vec<f64>,
}

impl HjbSolution {
    pub fn consumption(&self) -> &DVector<f64> {
        &self.policy.consumption
    }

    pub fn drift(&self) -> &DVector<f64> {
        &self.policy.drift
    }

    pub fn value_matrix(&self, model: &HuggettModel) -> DMatrix<f64> {
        model.to_matrix(&self.value)
    }
}

/// Stability bound for the explicit scheme.
pub fn explicit_step_bound(model: &HuggettModel) -> f64 {
    let max_cash = (0..model.n_states())
        .map(|i| model.cash_on_hand(i).abs())
        .fold(0.0, f64::max);
    0.9 * model.grid.min_spacing() / max_cash
}

trait ValueUpdate {
    /// Returns the updated value function and the convergence metric.
    fn update(
        &mut self,
        model: &HuggettModel,
        value: &DVector<f64>,
        policy: &UpwindPolicy,
    ) -> SolverResult<(DVector<f64>, f64)>;
}

struct ImplicitUpdate {
    delta: f64,
    ordering: Vec<usize>,
}

impl ValueUpdate for ImplicitUpdate {
    fn update(
        &mut self,
        model: &HuggettModel,
        value: &DVector<f64>,
        policy: &UpwindPolicy,
    ) -> SolverResult<(DVector<f64>, f64)> {
        let generator = build_generator(model, policy)?;
        let system = shifted(&generator, model.params.rho + 1.0 / self.delta, -1.0);
        let rhs = policy.rewards(model) + value / self.delta;
        let next = solve_banded(&system, &rhs, &self.ordering)?;
        let change = max_abs(&(&next - value));
        Ok((next, change))
    }
}

struct ExplicitUpdate {
    delta: f64,
}

impl ValueUpdate for ExplicitUpdate {
    fn update(
        &mut self,
        model: &HuggettModel,
        value: &DVector<f64>,
        policy: &UpwindPolicy,
    ) -> SolverResult<(DVector<f64>, f64)> {
        let mut v_change = policy.rewards(model) + model.switch.apply(value);
        for i in 0..value.len() {
            v_change[i] += policy.dv[i] * policy.drift[i] - model.params.rho * value[i];
        }
        let change = max_abs(&v_change);
        Ok((value + v_change * self.delta, change))
    }
}

enum SchemeUpdate {
    Implicit(ImplicitUpdate),
    Explicit(ExplicitUpdate),
}

impl SchemeUpdate {
    fn build(model: &HuggettModel, scheme: UpdateScheme) -> Self {
        match scheme {
            UpdateScheme::Implicit { delta } => SchemeUpdate::Implicit(ImplicitUpdate {
                delta,
                ordering: model.space.reversed_ordering(),
            }),
            UpdateScheme::Explicit { delta } => SchemeUpdate::Explicit(ExplicitUpdate {
                delta: delta.unwrap_or_else(|| explicit_step_bound(model)),
            }),
        }
    }

    fn update(
        &mut self,
        model: &HuggettModel,
        value: &DVector<f64>,
        policy: &UpwindPolicy,
    ) -> SolverResult<(DVector<f64>, f64)> {
        match self {
            SchemeUpdate::Implicit(u) => u.update(model, value, policy),
            SchemeUpdate::Explicit(u) => u.update(model, value, policy),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            SchemeUpdate::Implicit(_) => "implicit HJB",
            SchemeUpdate::Explicit(_) => "explicit HJB",
        }
    }
}

/// Iteration state of an [`HjbSolver`] without the model borrow.
#[derive(Debug, Clone)]
pub struct HjbCheckpoint {
    pub value: DVector<f64>,
    pub iterations: usize,
    pub history: Vec<f64>,
    pub state: HjbState,
}

pub struct HjbSolver<'a> {
    model: &'a HuggettModel,
    settings: HjbSettings,
    update: SchemeUpdate,
    value: DVector<f64>,
    iterations: usize,
    history: Vec<f64>,
    state: HjbState,
}

impl<'a> HjbSolver<'a> {
    /// Starts from `initial` or, if absent, from `u(z + r*a) / rho`.
    pub fn new(
        model: &'a HuggettModel,
        settings: HjbSettings,
        initial: Option<DVector<f64>>,
    ) -> SolverResult<Self> {
        let value = match initial {
            Some(v) => {
                if v.len() != model.n_states() {
                    return Err(SolverError::InvalidInput(format!(
                        "initial guess dimension mismatch. Expected {}, got {}",
                        model.n_states(),
                        v.len()
                    )));
                }
                v
            }
            None => model.initial_guess(),
        };
        let solver = Self::assemble(model, settings, value)?;
        if let UpdateScheme::Explicit { delta: Some(delta) } = settings.scheme {
            let bound = explicit_step_bound(model);
            if delta > bound {
                warn!(
                    delta,
                    bound, "explicit HJB step exceeds the stability bound and may diverge"
                );
            }
        }
        Ok(solver)
    }

    fn assemble(
        model: &'a HuggettModel,
        settings: HjbSettings,
        value: DVector<f64>,
    ) -> SolverResult<Self> {
        settings.validate()?;
        model.check_borrowing_limit()?;
        if value.len() != model.n_states() {
            return Err(SolverError::InvalidInput(format!(
                "checkpoint dimension mismatch. Expected {}, got {}",
                model.n_states(),
                value.len()
            )));
        }
        Ok(Self {
            model,
            settings,
            update: SchemeUpdate::build(model, settings.scheme),
            value,
            iterations: 0,
            history: Vec::new(),
            state: HjbState::Initializing,
        })
    }

    pub fn state(&self) -> HjbState {
        self.state
    }

    pub fn value(&self) -> &DVector<f64> {
        &self.value
    }

    pub fn iterations(&self) -> usize {
        self.iterations
    }

    pub fn history(&self) -> &[f64] {
        &self.history
    }

    pub fn last_change(&self) -> Option<f64> {
        self.history.last().copied()
    }

    /// Performs one iteration. Once the solver has converged or failed this
    /// is a no-op that reports the terminal state.
    pub fn step(&mut self) -> SolverResult<HjbState> {
        if self.state.is_terminal() {
            return Ok(self.state);
        }
        match self.advance() {
            Ok(state) => {
                self.state = state;
                Ok(state)
            }
            Err(err) => {
                self.state = HjbState::Failed;
                Err(err)
            }
        }
    }

    fn advance(&mut self) -> SolverResult<HjbState> {
        let policy = compute_policy(self.model, &self.value, self.settings.concavity)?;
        let (next, change) = self.update.update(self.model, &self.value, &policy)?;
        self.iterations += 1;

        let first = self.history.first().copied().unwrap_or(change);
        if !change.is_finite()
            || next.iter().any(|v| !v.is_finite())
            || change > DIVERGENCE_FACTOR * first.max(1.0)
        {
            return Err(SolverError::Diverged {
                solver: self.update.name(),
                iteration: self.iterations,
                change,
            });
        }

        self.value = next;
        self.history.push(change);
        debug!(iteration = self.iterations, change, "HJB iteration");

        if change < self.settings.tolerance {
            info!(
                iterations = self.iterations,
                change,
                "{} converged",
                self.update.name()
            );
            return Ok(HjbState::Converged);
        }
        if self.iterations >= self.settings.max_iterations {
            return Err(SolverError::NotConverged {
                solver: self.update.name(),
                iterations: self.iterations,
                last_change: change,
            });
        }
        Ok(HjbState::Iterating)
    }

    /// Detaches the iteration state from the model borrow.
    pub fn checkpoint(self) -> HjbCheckpoint {
        HjbCheckpoint {
            value: self.value,
            iterations: self.iterations,
            history: self.history,
            state: self.state,
        }
    }

    /// Continues from a checkpoint taken on a solver for the same model.
    /// Settings were already reported on by [`HjbSolver::new`].
    pub fn resume(
        model: &'a HuggettModel,
        settings: HjbSettings,
        checkpoint: HjbCheckpoint,
    ) -> SolverResult<Self> {
        let mut solver = Self::assemble(model, settings, checkpoint.value)?;
        solver.iterations = checkpoint.iterations;
        solver.history = checkpoint.history;
        solver.state = checkpoint.state;
        Ok(solver)
    }

    pub fn run(&mut self) -> SolverResult<()> {
        while !self.step()?.is_terminal() {}
        Ok(())
    }

    /// Policy and generator implied by the converged value function.
    pub fn into_solution(self) -> SolverResult<HjbSolution> {
        if self.state != HjbState::Converged {
            return Err(SolverError::InvalidInput(format!(
                "HJB solver has not converged (state {:?})",
                self.state
            )));
        }
        let policy = compute_policy(self.model, &self.value, self.settings.concavity)?;
        let generator = build_generator(self.model, &policy)?;
        Ok(HjbSolution {
            value: self.value,
            policy,
            generator,
            iterations: self.iterations,
            history: self.history,
        })
    }
}

pub fn solve_hjb(model: &HuggettModel, settings: HjbSettings) -> SolverResult<HjbSolution> {
    solve_hjb_from(model, settings, None)
}

pub fn solve_hjb_from(
    model: &HuggettModel,
    settings: HjbSettings,
    initial: Option<DVector<f64>>,
) -> SolverResult<HjbSolution> {
    let mut solver = HjbSolver::new(model, settings, initial)?;
    solver.run()?;
    solver.into_solution()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::GridSpec;
    use crate::model::ModelConfig;
    use crate::upwind::Direction;
    use tracing_test::traced_test;

    fn small_model() -> HuggettModel {
        let mut config = ModelConfig::default();
        config.grid = GridSpec::Uniform {
            n: 50,
            low: -0.1,
            high: 1.0,
        };
        config.build().expect("model should build")
    }

    #[test]
    fn implicit_scheme_converges_and_respects_constraints() {
        let model = small_model();
        let solution = solve_hjb(&model, HjbSettings::implicit()).expect("HJB should converge");
        assert!(solution.iterations < 100);
        assert!(*solution.history.last().unwrap() < 1e-6);

        let n_a = model.n_assets();
        for idx in 0..model.n_states() {
            let i = model.space.coordinate(idx, 0);
            assert!(solution.consumption()[idx] > 0.0);
            if i == 0 {
                assert!(solution.drift()[idx] >= 0.0, "drift below borrowing limit");
            }
            if i == n_a - 1 {
                assert!(solution.drift()[idx] <= 0.0, "drift above top of grid");
            }
            if solution.policy.direction[idx] == Direction::Stationary {
                assert_eq!(solution.drift()[idx], 0.0);
            }
        }
        // Value is increasing in assets and in income.
        let v = solution.value_matrix(&model);
        assert!(v[(10, 0)] < v[(11, 0)]);
        assert!(v[(10, 0)] < v[(10, 1)]);
        // High earners save at the borrowing limit, low earners are constrained.
        assert!(solution.drift()[n_a] > 0.0);
        assert_eq!(solution.policy.direction[0], Direction::Stationary);
    }

    #[test]
    fn implicit_changes_shrink_toward_tolerance() {
        let model = small_model();
        let solution = solve_hjb(&model, HjbSettings::implicit()).expect("HJB should converge");
        let history = &solution.history;
        assert!(history.len() >= 2);
        assert!(history[history.len() - 1] < history[0]);
        let tail = &history[history.len().saturating_sub(3)..];
        for pair in tail.windows(2) {
            assert!(
                pair[1] <= pair[0] * 1.01,
                "change increased in terminal phase: {:?}",
                history
            );
        }
    }

    #[test]
    fn explicit_scheme_agrees_with_implicit() {
        let model = small_model();
        let implicit = solve_hjb(&model, HjbSettings::implicit()).expect("implicit converges");
        let explicit = solve_hjb(&model, HjbSettings::explicit()).expect("explicit converges");
        assert!(explicit.iterations > implicit.iterations);
        for i in 0..model.n_states() {
            let rel = (implicit.value[i] - explicit.value[i]).abs() / implicit.value[i].abs();
            assert!(rel < 1e-3, "value mismatch at {}: {}", i, rel);
        }
    }

    #[test]
    fn explicit_step_above_bound_diverges() {
        let model = small_model();
        let bound = explicit_step_bound(&model);
        let settings = HjbSettings {
            scheme: UpdateScheme::Explicit {
                delta: Some(100.0 * bound),
            },
            max_iterations: 5_000,
            ..HjbSettings::explicit()
        };
        let err = solve_hjb(&model, settings).expect_err("expected divergence");
        assert!(
            matches!(err, SolverError::Diverged { .. } | SolverError::NotConverged { .. }),
            "unexpected error {:?}",
            err
        );
    }

    #[test]
    fn iteration_limit_is_fatal() {
        let model = small_model();
        let settings = HjbSettings {
            max_iterations: 1,
            tolerance: 1e-14,
            ..HjbSettings::implicit()
        };
        let mut solver = HjbSolver::new(&model, settings, None).expect("solver should build");
        let err = solver.run().expect_err("expected non-convergence");
        assert!(matches!(err, SolverError::NotConverged { iterations: 1, .. }));
        assert_eq!(solver.state(), HjbState::Failed);
        assert!(solver.into_solution().is_err());
    }

    #[test]
    fn stepping_reaches_converged_state() {
        let model = small_model();
        let mut solver =
            HjbSolver::new(&model, HjbSettings::implicit(), None).expect("solver should build");
        assert_eq!(solver.state(), HjbState::Initializing);
        let mut steps = 0;
        while solver.step().expect("step should succeed") == HjbState::Iterating {
            steps += 1;
            assert!(steps < 100);
        }
        assert_eq!(solver.state(), HjbState::Converged);
        assert_eq!(solver.step().expect("terminal step"), HjbState::Converged);
        let iterations = solver.iterations();
        let solution = solver.into_solution().expect("solution");
        assert_eq!(solution.iterations, iterations);
    }

    #[test]
    fn warm_start_from_solution_converges_immediately() {
        let model = small_model();
        let first = solve_hjb(&model, HjbSettings::implicit()).expect("HJB should converge");
        let second = solve_hjb_from(&model, HjbSettings::implicit(), Some(first.value.clone()))
            .expect("HJB should converge");
        assert!(second.iterations <= 2);
    }

    #[test]
    fn solution_generator_is_conservative() {
        let model = small_model();
        let solution = solve_hjb(&model, HjbSettings::implicit()).expect("HJB should converge");
        let (_, sum) = crate::generator::max_row_sum(&solution.generator);
        assert!(sum.abs() < 1e-10);
    }

    #[test]
    fn checkpoint_resume_matches_uninterrupted_run() {
        let model = small_model();
        let settings = HjbSettings::implicit();
        let mut solver = HjbSolver::new(&model, settings, None).expect("solver should build");
        solver.step().expect("first step");
        solver.step().expect("second step");
        let checkpoint = solver.checkpoint();
        assert_eq!(checkpoint.iterations, 2);

        let mut resumed = HjbSolver::resume(&model, settings, checkpoint).expect("resume");
        resumed.run().expect("resumed run should converge");
        let resumed = resumed.into_solution().expect("solution");
        let direct = solve_hjb(&model, settings).expect("HJB should converge");
        assert_eq!(resumed.iterations, direct.iterations);
        assert!(max_abs(&(&resumed.value - &direct.value)) < 1e-12);
    }

    #[test]
    #[traced_test]
    fn resumed_batches_warn_about_step_size_once() {
        let model = small_model();
        let settings = HjbSettings {
            scheme: UpdateScheme::Explicit {
                delta: Some(1.1 * explicit_step_bound(&model)),
            },
            ..HjbSettings::explicit()
        };
        let mut solver = HjbSolver::new(&model, settings, None).expect("solver should build");
        solver.step().expect("first batch");
        for batch in 0..3 {
            let checkpoint = solver.checkpoint();
            solver = HjbSolver::resume(&model, settings, checkpoint).expect("resume");
            solver.step().expect("resumed batch");
            assert_eq!(solver.iterations(), batch + 2);
        }

        logs_assert(|lines: &[&str]| {
            match lines
                .iter()
                .filter(|line| line.contains("exceeds the stability bound"))
                .count()
            {
                1 => Ok(()),
                n => Err(format!("step-size warning emitted {} times", n)),
            }
        });
    }

    #[test]
    fn resume_rejects_checkpoint_for_another_grid() {
        let model = small_model();
        let checkpoint = HjbCheckpoint {
            value: DVector::zeros(3),
            iterations: 4,
            history: vec![1.0; 4],
            state: HjbState::Iterating,
        };
        let err = HjbSolver::resume(&model, HjbSettings::implicit(), checkpoint)
            .err()
            .expect("expected dimension error");
        assert!(format!("{err}").contains("dimension mismatch"));
    }
}
