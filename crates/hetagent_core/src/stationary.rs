//! Stationary Kolmogorov-forward distribution of a generator.
//!
//! Every method works on probability masses `p` with `A' p = 0`,
//! `p >= 0`, `sum(p) = 1`. Densities follow by dividing through the asset
//! cell widths, so `sum(g * da) = 1` on any grid. The methods are
//! interchangeable and agree to solver tolerance; GTH is the most robust and
//! serves as the reference.

use crate::error::{SolverError, SolverResult};
use crate::linalg::{max_abs, shifted, solve_banded, with_unit_row};
use crate::model::HuggettModel;
use nalgebra::{DMatrix, DVector};
use nalgebra_sparse::CsrMatrix;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Negative masses smaller than this are treated as round-off and clipped.
const NEGATIVE_MASS_TOLERANCE: f64 = 1e-10;

/// Shift used by inverse iteration, relative to the largest generator entry.
const INVERSE_ITERATION_SHIFT: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StationaryMethod {
    /// Replace one equation of `A' p = 0` by a fixed mass and solve.
    Direct,
    /// Grassmann-Taksar-Heyman state reduction on a dense copy.
    Gth,
    /// Eigenvector of `A'` for the eigenvalue closest to zero.
    Eigenvector,
    /// `(δ I - A') p = δ ψ` with uniform ψ and small δ.
    Resolvent,
    /// Iterate the forward equation in pseudo-time until it stops moving.
    TimeIteration,
}

impl StationaryMethod {
    pub const ALL: [StationaryMethod; 5] = [
        StationaryMethod::Direct,
        StationaryMethod::Gth,
        StationaryMethod::Eigenvector,
        StationaryMethod::Resolvent,
        StationaryMethod::TimeIteration,
    ];
}

/// What to do when the eigenvalue found by [`StationaryMethod::Eigenvector`]
/// is not numerically zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EigenvalueCheck {
    Warn,
    Fail,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TimeStepping {
    /// `p <- (I + dt A') p`; needs `dt * max|A_ii| <= 1`.
    Explicit { dt: f64 },
    /// `(I - dt A') p_new = p`; stable for any `dt`.
    Implicit { dt: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StationarySettings {
    pub method: StationaryMethod,
    /// State whose equation the direct method replaces.
    pub fixed_state: usize,
    pub fixed_mass: f64,
    /// Diagonal shift tried once when the direct system is singular.
    pub regularization: f64,
    pub eigenvalue_check: EigenvalueCheck,
    /// Allowed `|λ|` relative to the largest generator entry.
    pub eigenvalue_tolerance: f64,
    pub resolvent_delta: f64,
    pub time_stepping: TimeStepping,
    /// Stopping tolerance for the iterative methods.
    pub tolerance: f64,
    pub max_iterations: usize,
}

impl Default for StationarySettings {
    fn default() -> Self {
        Self {
            method: StationaryMethod::Direct,
            fixed_state: 0,
            fixed_mass: 0.1,
            regularization: 1e-10,
            eigenvalue_check: EigenvalueCheck::Warn,
            eigenvalue_tolerance: 1e-8,
            resolvent_delta: 1e-8,
            time_stepping: TimeStepping::Implicit { dt: 1000.0 },
            tolerance: 1e-12,
            max_iterations: 100_000,
        }
    }
}

impl StationarySettings {
    pub fn with_method(method: StationaryMethod) -> Self {
        Self {
            method,
            ..Self::default()
        }
    }
}

/// Normalized masses plus method diagnostics.
#[derive(Debug, Clone)]
pub struct MassSolution {
    pub mass: DVector<f64>,
    /// Diagonal shift the direct method needed, if any.
    pub regularization: Option<f64>,
    /// Eigenvalue estimate from the eigenvector method.
    pub eigenvalue: Option<f64>,
    pub iterations: usize,
}

impl MassSolution {
    fn exact(mass: DVector<f64>) -> Self {
        Self {
            mass,
            regularization: None,
            eigenvalue: None,
            iterations: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StationaryDistribution {
    pub method: StationaryMethod,
    /// Probability mass per state, summing to one.
    pub mass: DVector<f64>,
    /// Density over assets, shape `(N_a, N_z)`; `sum(density * da) = 1`.
    pub density: DMatrix<f64>,
    pub regularization: Option<f64>,
    pub eigenvalue: Option<f64>,
    pub iterations: usize,
}

impl StationaryDistribution {
    /// Marginal density over assets.
    pub fn asset_density(&self) -> DVector<f64> {
        DVector::from_fn(self.density.nrows(), |i, _| self.density.row(i).sum())
    }

    /// Share of agents in each income state.
    pub fn income_shares(&self, model: &HuggettModel) -> DVector<f64> {
        let mut shares = DVector::zeros(model.n_income());
        for (idx, &m) in self.mass.iter().enumerate() {
            shares[model.space.coordinate(idx, 1)] += m;
        }
        shares
    }
}

pub fn stationary_distribution(
    model: &HuggettModel,
    generator: &CsrMatrix<f64>,
    settings: &StationarySettings,
) -> SolverResult<StationaryDistribution> {
    if generator.nrows() != model.n_states() {
        return Err(SolverError::InvalidInput(format!(
            "generator dimension mismatch. Expected {}, got {}",
            model.n_states(),
            generator.nrows()
        )));
    }
    let ordering = model.space.reversed_ordering();
    let solution = solve_masses(generator, &ordering, settings)?;
    let density = mass_to_density(model, &solution.mass);
    Ok(StationaryDistribution {
        method: settings.method,
        mass: solution.mass,
        density,
        regularization: solution.regularization,
        eigenvalue: solution.eigenvalue,
        iterations: solution.iterations,
    })
}

pub fn mass_to_density(model: &HuggettModel, mass: &DVector<f64>) -> DMatrix<f64> {
    let widths = model.grid.cell_widths();
    let density = DVector::from_fn(mass.len(), |idx, _| {
        mass[idx] / widths[model.space.coordinate(idx, 0)]
    });
    model.to_matrix(&density)
}

/// Stationary masses of `generator` with the configured method. `ordering`
/// is the elimination order handed to the banded solver.
pub fn solve_masses(
    generator: &CsrMatrix<f64>,
    ordering: &[usize],
    settings: &StationarySettings,
) -> SolverResult<MassSolution> {
    let n = generator.nrows();
    if n == 0 || generator.ncols() != n {
        return Err(SolverError::InvalidInput(format!(
            "generator must be square and non-empty, got {}x{}",
            n,
            generator.ncols()
        )));
    }
    let adjoint = generator.transpose();
    match settings.method {
        StationaryMethod::Direct => direct(&adjoint, ordering, settings),
        StationaryMethod::Gth => gth(generator).map(MassSolution::exact),
        StationaryMethod::Eigenvector => eigenvector(&adjoint, ordering, settings),
        StationaryMethod::Resolvent => resolvent(&adjoint, ordering, settings),
        StationaryMethod::TimeIteration => time_iteration(&adjoint, ordering, settings),
    }
}

fn direct(
    adjoint: &CsrMatrix<f64>,
    ordering: &[usize],
    settings: &StationarySettings,
) -> SolverResult<MassSolution> {
    let n = adjoint.nrows();
    let fixed = settings.fixed_state;
    if fixed >= n {
        return Err(SolverError::InvalidInput(format!(
            "fixed state {} outside state space of size {}",
            fixed, n
        )));
    }
    let system = with_unit_row(adjoint, fixed);
    let mut rhs = DVector::zeros(n);
    rhs[fixed] = settings.fixed_mass;

    let (raw, regularization) = match solve_banded(&system, &rhs, ordering) {
        Ok(raw) => (raw, None),
        Err(SolverError::SingularSystem { row, pivot }) => {
            warn!(
                row,
                pivot,
                regularization = settings.regularization,
                "direct stationary system is singular; retrying with a diagonal shift"
            );
            let regularized = shifted(&system, settings.regularization, 1.0);
            let raw = solve_banded(&regularized, &rhs, ordering)?;
            (raw, Some(settings.regularization))
        }
        Err(err) => return Err(err),
    };

    Ok(MassSolution {
        mass: normalize_masses(raw)?,
        regularization,
        eigenvalue: None,
        iterations: 0,
    })
}

/// GTH state reduction. Only subtractions-free updates are used, which is
/// what makes it stable on nearly decomposable chains.
pub fn gth(generator: &CsrMatrix<f64>) -> SolverResult<DVector<f64>> {
    let n = generator.nrows();
    let mut q: DMatrix<f64> = DMatrix::zeros(n, n);
    for (i, j, v) in generator.triplet_iter() {
        if i != j {
            q[(i, j)] += *v;
        }
    }

    for k in (1..n).rev() {
        let exit: f64 = (0..k).map(|j| q[(k, j)]).sum();
        if !(exit > 0.0) {
            return Err(SolverError::Reducible { state: k });
        }
        for i in 0..k {
            q[(i, k)] /= exit;
        }
        for i in 0..k {
            let through = q[(i, k)];
            if through == 0.0 {
                continue;
            }
            for j in 0..k {
                if j != i {
                    q[(i, j)] += through * q[(k, j)];
                }
            }
        }
    }

    let mut mass = DVector::zeros(n);
    mass[0] = 1.0;
    for k in 1..n {
        mass[k] = (0..k).map(|i| mass[i] * q[(i, k)]).sum();
    }
    normalize_masses(mass)
}

fn eigenvector(
    adjoint: &CsrMatrix<f64>,
    ordering: &[usize],
    settings: &StationarySettings,
) -> SolverResult<MassSolution> {
    let n = adjoint.nrows();
    let scale = adjoint.values().iter().fold(0.0, |acc: f64, v| acc.max(v.abs()));
    let shift = INVERSE_ITERATION_SHIFT * scale.max(1.0);
    let system = shifted(adjoint, shift, 1.0);

    let mut x = DVector::from_element(n, 1.0 / n as f64);
    let mut iterations = 0;
    loop {
        if iterations >= settings.max_iterations {
            return Err(SolverError::NotConverged {
                solver: "inverse iteration",
                iterations,
                last_change: f64::NAN,
            });
        }
        let y = solve_banded(&system, &x, ordering)?;
        let sum = y.sum();
        if !sum.is_finite() || sum == 0.0 {
            return Err(SolverError::Diverged {
                solver: "inverse iteration",
                iteration: iterations,
                change: sum,
            });
        }
        let y = y / sum;
        let change = max_abs(&(&y - &x));
        x = y;
        iterations += 1;
        if change < settings.tolerance {
            break;
        }
    }

    let ax = adjoint * &x;
    let eigenvalue = x.dot(&ax) / x.dot(&x);
    let tolerance = settings.eigenvalue_tolerance * scale.max(1.0);
    if !(eigenvalue.abs() <= tolerance) {
        match settings.eigenvalue_check {
            EigenvalueCheck::Fail => {
                return Err(SolverError::EigenvalueCheck {
                    eigenvalue,
                    tolerance,
                })
            }
            EigenvalueCheck::Warn => warn!(
                eigenvalue,
                tolerance, "principal eigenvalue of the adjoint generator is not zero"
            ),
        }
    }
    debug!(iterations, eigenvalue, "inverse iteration finished");

    Ok(MassSolution {
        mass: normalize_masses(x)?,
        regularization: None,
        eigenvalue: Some(eigenvalue),
        iterations,
    })
}

fn resolvent(
    adjoint: &CsrMatrix<f64>,
    ordering: &[usize],
    settings: &StationarySettings,
) -> SolverResult<MassSolution> {
    let n = adjoint.nrows();
    let delta = settings.resolvent_delta;
    if !(delta > 0.0) {
        return Err(SolverError::InvalidInput(format!(
            "resolvent delta must be positive, got {}",
            delta
        )));
    }
    let system = shifted(adjoint, delta, -1.0);
    let rhs = DVector::from_element(n, delta / n as f64);
    let raw = solve_banded(&system, &rhs, ordering)?;
    Ok(MassSolution::exact(normalize_masses(raw)?))
}

fn time_iteration(
    adjoint: &CsrMatrix<f64>,
    ordering: &[usize],
    settings: &StationarySettings,
) -> SolverResult<MassSolution> {
    let n = adjoint.nrows();
    let mut mass = DVector::from_element(n, 1.0 / n as f64);

    let (dt, implicit_system) = match settings.time_stepping {
        TimeStepping::Explicit { dt } => {
            let max_exit = (0..n)
                .filter_map(|i| adjoint.get_entry(i, i).map(|e| e.into_value().abs()))
                .fold(0.0, f64::max);
            if !(dt > 0.0) || dt * max_exit > 1.0 {
                return Err(SolverError::InvalidInput(format!(
                    "explicit time step {} violates dt * max|A_ii| <= 1 (max|A_ii| = {})",
                    dt, max_exit
                )));
            }
            (dt, None)
        }
        TimeStepping::Implicit { dt } => {
            if !(dt > 0.0) {
                return Err(SolverError::InvalidInput(format!(
                    "implicit time step must be positive, got {}",
                    dt
                )));
            }
            (dt, Some(shifted(adjoint, 1.0, -dt)))
        }
    };

    let mut iterations = 0;
    loop {
        let next = match &implicit_system {
            Some(system) => solve_banded(system, &mass, ordering)?,
            None => &mass + (adjoint * &mass) * dt,
        };
        let next = &next / next.sum();
        let change = max_abs(&(&next - &mass)) / dt;
        mass = next;
        iterations += 1;
        if !change.is_finite() {
            return Err(SolverError::Diverged {
                solver: "KF time iteration",
                iteration: iterations,
                change,
            });
        }
        if change < settings.tolerance {
            break;
        }
        if iterations >= settings.max_iterations {
            return Err(SolverError::NotConverged {
                solver: "KF time iteration",
                iterations,
                last_change: change,
            });
        }
    }
    debug!(iterations, "KF time iteration converged");

    Ok(MassSolution {
        mass: normalize_masses(mass)?,
        regularization: None,
        eigenvalue: None,
        iterations,
    })
}

/// Scales to unit total mass, clips round-off negatives, and rejects
/// materially negative entries.
pub fn normalize_masses(raw: DVector<f64>) -> SolverResult<DVector<f64>> {
    let total = raw.sum();
    if !total.is_finite() || total == 0.0 {
        return Err(SolverError::InvalidInput(format!(
            "distribution has total mass {}",
            total
        )));
    }
    let mut mass = raw / total;
    for (state, m) in mass.iter_mut().enumerate() {
        if *m < 0.0 {
            if *m < -NEGATIVE_MASS_TOLERANCE {
                return Err(SolverError::NegativeMass { state, value: *m });
            }
            *m = 0.0;
        }
    }
    let total = mass.sum();
    Ok(mass / total)
}
