use thiserror::Error;

/// Failures reported by the numerical solvers.
///
/// Configuration problems (bad grid bounds, malformed income processes) are
/// reported through `anyhow` when a model is built; everything that can go
/// wrong once a model exists ends up here.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SolverError {
    #[error("{solver} failed to converge in {iterations} iterations (last change = {last_change:e})")]
    NotConverged {
        solver: &'static str,
        iterations: usize,
        last_change: f64,
    },

    #[error("{solver} diverged at iteration {iteration} (change = {change:e})")]
    Diverged {
        solver: &'static str,
        iteration: usize,
        change: f64,
    },

    #[error("linear system is singular (pivot {pivot:e} at row {row})")]
    SingularSystem { row: usize, pivot: f64 },

    #[error("generator is reducible: state {state} has no path to lower-indexed states")]
    Reducible { state: usize },

    #[error("bracket [{lower}, {upper}] does not contain a sign change (f = {f_lower:e}, {f_upper:e})")]
    BracketWithoutSignChange {
        lower: f64,
        upper: f64,
        f_lower: f64,
        f_upper: f64,
    },

    #[error("root finder exhausted {iterations} iterations (bracket width {width:e})")]
    RootNotFound { iterations: usize, width: f64 },

    #[error("value function is not concave at {count} grid points")]
    NonConcave { count: usize },

    #[error("principal eigenvalue {eigenvalue:e} is not close to zero (tolerance {tolerance:e})")]
    EigenvalueCheck { eigenvalue: f64, tolerance: f64 },

    #[error("generator row {row} sums to {sum:e}")]
    GeneratorRowSum { row: usize, sum: f64 },

    #[error("distribution has negative mass {value:e} at state {state}")]
    NegativeMass { state: usize, value: f64 },

    #[error("{0}")]
    InvalidInput(String),
}

pub type SolverResult<T> = Result<T, SolverError>;
