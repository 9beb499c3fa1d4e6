pub mod equilibrium;
pub mod error;
pub mod generator;
pub mod grid;
pub mod hjb;
pub mod income;
pub mod linalg;
pub mod model;
pub mod rootfind;
/// The `hetagent_core` crate solves continuous-time heterogeneous-agent
/// (Huggett/Aiyagari-type) household problems with upwind finite differences.
///
/// Key components:
/// - **Model**: asset grids, income processes and the `(asset, income)` state space.
/// - **HJB**: implicit and explicit value-function iteration with the upwind policy.
/// - **Stationary**: five interchangeable Kolmogorov-forward solvers.
/// - **Equilibrium**: Brent search over the interest rate that clears the asset market.
/// - **Transition**: backward/forward sweeps along a time-varying interest rate path.
pub mod state_space;
pub mod stationary;
pub mod transition;
pub mod upwind;
pub mod utility;
