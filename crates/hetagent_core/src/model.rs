//! Household model context shared by every solver stage.

use crate::error::{SolverError, SolverResult};
use crate::generator::SwitchMatrix;
use crate::grid::{AssetGrid, GridSpec};
use crate::income::{IncomeChain, IncomeProcess};
use crate::state_space::StateSpace;
use crate::utility::Crra;
use anyhow::{bail, Context, Result};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HouseholdParams {
    /// Relative risk aversion.
    pub sigma: f64,
    /// Time discount rate.
    pub rho: f64,
    /// Interest rate.
    pub r: f64,
}

impl HouseholdParams {
    pub fn with_interest_rate(self, r: f64) -> Self {
        Self { r, ..self }
    }

    fn validate(&self) -> Result<()> {
        if !(self.sigma > 0.0) || !self.sigma.is_finite() {
            bail!("sigma must be positive and finite, got {}.", self.sigma);
        }
        if !(self.rho > 0.0) || !self.rho.is_finite() {
            bail!("rho must be positive and finite, got {}.", self.rho);
        }
        if !self.r.is_finite() {
            bail!("Interest rate must be finite.");
        }
        Ok(())
    }
}

/// Serializable model description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub params: HouseholdParams,
    pub grid: GridSpec,
    pub income: IncomeProcess,
}

impl ModelConfig {
    /// Two-state Poisson Huggett economy used throughout the examples.
    pub fn huggett_poisson() -> Self {
        Self {
            params: HouseholdParams {
                sigma: 2.0,
                rho: 0.05,
                r: 0.03,
            },
            grid: GridSpec::Uniform {
                n: 500,
                low: -0.1,
                high: 1.0,
            },
            income: IncomeProcess::two_state([0.1, 0.2], [0.02, 0.03]),
        }
    }

    pub fn build(&self) -> Result<HuggettModel> {
        let grid = self.grid.build().context("Failed to build asset grid.")?;
        HuggettModel::new(self.params, grid, &self.income)
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self::huggett_poisson()
    }
}

/// Parameters, grids and the precomputed income switch block.
///
/// Everything the reward and transition computations need lives here, so
/// solver stages take a `&HuggettModel` instead of capturing state.
#[derive(Debug, Clone)]
pub struct HuggettModel {
    pub params: HouseholdParams,
    pub utility: Crra,
    pub grid: AssetGrid,
    pub income: IncomeChain,
    pub space: StateSpace,
    pub switch: SwitchMatrix,
}

impl HuggettModel {
    pub fn new(params: HouseholdParams, grid: AssetGrid, income: &IncomeProcess) -> Result<Self> {
        params.validate()?;
        let income = income
            .discretize()
            .context("Failed to discretize income process.")?;
        let space = StateSpace::new(vec![grid.len(), income.len()]);
        let switch = SwitchMatrix::new(&space, 1, &income.generator);
        Ok(Self {
            params,
            utility: Crra::new(params.sigma),
            grid,
            income,
            space,
            switch,
        })
    }

    /// Same grids and income block at a different interest rate.
    pub fn with_interest_rate(&self, r: f64) -> Self {
        let mut model = self.clone();
        model.params = self.params.with_interest_rate(r);
        model
    }

    pub fn n_assets(&self) -> usize {
        self.grid.len()
    }

    pub fn n_income(&self) -> usize {
        self.income.len()
    }

    pub fn n_states(&self) -> usize {
        self.space.len()
    }

    pub fn asset_at(&self, index: usize) -> f64 {
        self.grid.points()[self.space.coordinate(index, 0)]
    }

    pub fn income_at(&self, index: usize) -> f64 {
        self.income.levels[self.space.coordinate(index, 1)]
    }

    /// `z + r * a`, the consumption that keeps assets constant.
    pub fn cash_on_hand(&self, index: usize) -> f64 {
        self.income_at(index) + self.params.r * self.asset_at(index)
    }

    /// Zero-drift consumption must be feasible everywhere; otherwise the
    /// borrowing limit is looser than the natural one.
    pub fn check_borrowing_limit(&self) -> SolverResult<()> {
        if let Some(index) = (0..self.n_states()).find(|&i| self.cash_on_hand(i) <= 0.0) {
            return Err(SolverError::InvalidInput(format!(
                "cash on hand z + r*a = {} is not positive at a = {}, z = {}",
                self.cash_on_hand(index),
                self.asset_at(index),
                self.income_at(index)
            )));
        }
        Ok(())
    }

    /// `V0 = u(z + r*a) / rho`: the value of consuming cash on hand forever.
    pub fn initial_guess(&self) -> DVector<f64> {
        DVector::from_fn(self.n_states(), |i, _| {
            self.utility.utility(self.cash_on_hand(i)) / self.params.rho
        })
    }

    /// Reshapes a stacked state vector into an `(N_a, N_z)` matrix.
    pub fn to_matrix(&self, stacked: &DVector<f64>) -> DMatrix<f64> {
        DMatrix::from_column_slice(self.n_assets(), self.n_income(), stacked.as_slice())
    }

    pub fn to_stacked(&self, matrix: &DMatrix<f64>) -> DVector<f64> {
        DVector::from_column_slice(matrix.as_slice())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn default_config_builds_huggett_economy() {
        let model = ModelConfig::default().build().expect("model should build");
        assert_eq!(model.n_assets(), 500);
        assert_eq!(model.n_income(), 2);
        assert_eq!(model.n_states(), 1000);
        assert_eq!(model.asset_at(500), -0.1);
        assert_eq!(model.income_at(500), 0.2);
        assert_relative_eq!(model.cash_on_hand(0), 0.1 - 0.003, epsilon = 1e-15);
        assert!(model.check_borrowing_limit().is_ok());
    }

    #[test]
    fn initial_guess_is_steady_state_value() {
        let model = ModelConfig::default().build().expect("model should build");
        let v0 = model.initial_guess();
        let c = model.cash_on_hand(7);
        assert_relative_eq!(v0[7], -1.0 / c / 0.05, epsilon = 1e-10);
    }

    #[test]
    fn loose_borrowing_limit_is_rejected() {
        let mut config = ModelConfig::default();
        config.grid = GridSpec::Uniform {
            n: 50,
            low: -5.0,
            high: 1.0,
        };
        let model = config.build().expect("model should build");
        let err = model.check_borrowing_limit().expect_err("expected infeasibility");
        assert!(format!("{err}").contains("not positive"));
    }

    #[test]
    fn config_round_trips_through_json() {
        let config = ModelConfig::huggett_poisson();
        let json = serde_json::to_string(&config).expect("serialize");
        let back: ModelConfig = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(config, back);
    }

    #[test]
    fn invalid_params_fail_to_build() {
        let mut config = ModelConfig::default();
        config.params.rho = 0.0;
        let err = config.build().expect_err("expected rho error");
        assert!(format!("{err}").contains("rho"));
    }

    #[test]
    fn matrix_reshape_is_column_major() {
        let mut config = ModelConfig::default();
        config.grid = GridSpec::Uniform {
            n: 3,
            low: 0.0,
            high: 1.0,
        };
        let model = config.build().expect("model should build");
        let stacked = DVector::from_vec(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let m = model.to_matrix(&stacked);
        assert_eq!(m[(2, 0)], 3.0);
        assert_eq!(m[(0, 1)], 4.0);
        assert_eq!(model.to_stacked(&m), stacked);
    }
}
