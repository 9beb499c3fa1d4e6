//! Sparse infinitesimal generator over the joint (asset, income) space.

use crate::error::{SolverError, SolverResult};
use crate::model::HuggettModel;
use crate::state_space::StateSpace;
use crate::upwind::{Direction, UpwindPolicy};
use nalgebra::{DMatrix, DVector};
use nalgebra_sparse::{CooMatrix, CsrMatrix};

/// Relative tolerance for the zero row-sum check.
pub const ROW_SUM_TOLERANCE: f64 = 1e-10;

/// Off-diagonal switching intensities along one state dimension.
///
/// Built once per model from the income generator; it does not depend on the
/// value function, so every rebuild of `A` just appends these entries.
#[derive(Debug, Clone)]
pub struct SwitchMatrix {
    entries: Vec<(usize, usize, f64)>,
    exit_rates: Vec<f64>,
}

impl SwitchMatrix {
    pub fn new(space: &StateSpace, dim: usize, rates: &DMatrix<f64>) -> Self {
        let n = space.len();
        let mut entries = Vec::new();
        let mut exit_rates = vec![0.0; n];
        for idx in 0..n {
            let from = space.coordinate(idx, dim);
            for to in 0..rates.ncols() {
                let rate = rates[(from, to)];
                if to == from || rate == 0.0 {
                    continue;
                }
                let offset = to as isize - from as isize;
                if let Some(target) = space.neighbor(idx, dim, offset) {
                    entries.push((idx, target, rate));
                    exit_rates[idx] += rate;
                }
            }
        }
        Self {
            entries,
            exit_rates,
        }
    }

    pub fn entries(&self) -> &[(usize, usize, f64)] {
        &self.entries
    }

    /// `(A_switch v)_i = sum_j rate_ij (v_j - v_i)`.
    pub fn apply(&self, v: &DVector<f64>) -> DVector<f64> {
        let mut out = DVector::zeros(v.len());
        for &(i, j, rate) in &self.entries {
            out[i] += rate * (v[j] - v[i]);
        }
        out
    }

    pub fn to_csr(&self, n: usize) -> CsrMatrix<f64> {
        let mut coo = CooMatrix::new(n, n);
        for &(i, j, rate) in &self.entries {
            coo.push(i, j, rate);
        }
        for (i, &exit) in self.exit_rates.iter().enumerate() {
            coo.push(i, i, -exit);
        }
        CsrMatrix::from(&coo)
    }
}

/// Assembles `A` from the upwind policy and the model's switch block.
///
/// A state drifting up moves to the next asset point at rate `s_f / Δa_f`,
/// a state drifting down to the previous one at rate `-s_b / Δa_b`. The
/// diagonal makes every row sum to zero, which is verified before returning.
pub fn build_generator(model: &HuggettModel, policy: &UpwindPolicy) -> SolverResult<CsrMatrix<f64>> {
    let n = model.n_states();
    let forward_spacing = model.grid.forward_spacing();
    let backward_spacing = model.grid.backward_spacing();

    let mut coo = CooMatrix::new(n, n);
    let mut off_diagonal = vec![0.0; n];

    for idx in 0..n {
        let i = model.space.coordinate(idx, 0);
        let (target, rate) = match policy.direction[idx] {
            Direction::Forward => (
                model.space.neighbor(idx, 0, 1),
                policy.drift_forward[idx] / forward_spacing[i],
            ),
            Direction::Backward => (
                model.space.neighbor(idx, 0, -1),
                -policy.drift_backward[idx] / backward_spacing[i],
            ),
            Direction::Stationary => continue,
        };
        let target = target.ok_or_else(|| {
            SolverError::InvalidInput(format!("upwind direction leaves the asset grid at state {}", idx))
        })?;
        coo.push(idx, target, rate);
        off_diagonal[idx] += rate;
    }

    for &(i, j, rate) in model.switch.entries() {
        coo.push(i, j, rate);
        off_diagonal[i] += rate;
    }
    for (i, &total) in off_diagonal.iter().enumerate() {
        coo.push(i, i, -total);
    }

    let generator = CsrMatrix::from(&coo);
    check_row_sums(&generator)?;
    Ok(generator)
}

/// Row with the largest absolute sum and that sum.
pub fn max_row_sum(matrix: &CsrMatrix<f64>) -> (usize, f64) {
    let mut worst: (usize, f64) = (0, 0.0);
    for (i, row) in matrix.row_iter().enumerate() {
        let sum: f64 = row.values().iter().sum();
        if sum.abs() > worst.1.abs() {
            worst = (i, sum);
        }
    }
    worst
}

pub fn check_row_sums(matrix: &CsrMatrix<f64>) -> SolverResult<()> {
    let scale = matrix
        .values()
        .iter()
        .fold(1.0, |acc: f64, v| acc.max(v.abs()));
    let (row, sum) = max_row_sum(matrix);
    if !sum.is_finite() || sum.abs() > ROW_SUM_TOLERANCE * scale {
        return Err(SolverError::GeneratorRowSum { row, sum });
    }
    Ok(())
}
