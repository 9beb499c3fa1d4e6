//! Income processes and their discretized switching generators.

use anyhow::{bail, Result};
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

/// Exogenous income process, before discretization.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum IncomeProcess {
    /// Poisson switching where `intensities[j]` is the rate of leaving state
    /// `j`, spread evenly over the remaining states. With two states this is
    /// the classic Huggett employed/unemployed switch.
    Poisson {
        levels: Vec<f64>,
        intensities: Vec<f64>,
    },
    /// Poisson switching with an explicit matrix of off-diagonal rates
    /// (`rates[i][j]` from state `i` to state `j`). Diagonal entries are
    /// ignored.
    Markov {
        levels: Vec<f64>,
        rates: Vec<Vec<f64>>,
    },
    /// Ornstein-Uhlenbeck income `dz = reversion (mean - z) dt + volatility dW`
    /// approximated on a uniform grid of `n` points with reflecting bounds.
    Diffusion {
        mean: f64,
        reversion: f64,
        volatility: f64,
        n: usize,
        low: f64,
        high: f64,
    },
}

/// Income levels together with the continuous-time Markov generator on them.
#[derive(Debug, Clone)]
pub struct IncomeChain {
    pub levels: Vec<f64>,
    pub generator: DMatrix<f64>,
}

impl IncomeChain {
    pub fn len(&self) -> usize {
        self.levels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }
}

impl IncomeProcess {
    pub fn two_state(levels: [f64; 2], intensities: [f64; 2]) -> Self {
        IncomeProcess::Poisson {
            levels: levels.to_vec(),
            intensities: intensities.to_vec(),
        }
    }

    pub fn discretize(&self) -> Result<IncomeChain> {
        match self {
            IncomeProcess::Poisson {
                levels,
                intensities,
            } => {
                let n = levels.len();
                if n == 0 {
                    bail!("Income process needs at least one level.");
                }
                if intensities.len() != n {
                    bail!(
                        "Income intensities dimension mismatch. Expected {}, got {}.",
                        n,
                        intensities.len()
                    );
                }
                let mut rates = vec![vec![0.0; n]; n];
                if n > 1 {
                    for (i, row) in rates.iter_mut().enumerate() {
                        let share = intensities[i] / (n - 1) as f64;
                        for (j, rate) in row.iter_mut().enumerate() {
                            if i != j {
                                *rate = share;
                            }
                        }
                    }
                }
                chain_from_rates(levels, &rates)
            }
            IncomeProcess::Markov { levels, rates } => chain_from_rates(levels, rates),
            IncomeProcess::Diffusion {
                mean,
                reversion,
                volatility,
                n,
                low,
                high,
            } => discretize_ou(*mean, *reversion, *volatility, *n, *low, *high),
        }
    }
}

fn chain_from_rates(levels: &[f64], rates: &[Vec<f64>]) -> Result<IncomeChain> {
    let n = levels.len();
    if n == 0 {
        bail!("Income process needs at least one level.");
    }
    if levels.iter().any(|z| !z.is_finite()) {
        bail!("Income levels must be finite.");
    }
    if rates.len() != n || rates.iter().any(|row| row.len() != n) {
        bail!("Income rate matrix must be {}x{}.", n, n);
    }

    let mut generator = DMatrix::zeros(n, n);
    for i in 0..n {
        let mut exit = 0.0;
        for j in 0..n {
            if i == j {
                continue;
            }
            let rate = rates[i][j];
            if !(rate >= 0.0) || !rate.is_finite() {
                bail!("Switching rate from {} to {} must be non-negative, got {}.", i, j, rate);
            }
            generator[(i, j)] = rate;
            exit += rate;
        }
        generator[(i, i)] = -exit;
    }

    Ok(IncomeChain {
        levels: levels.to_vec(),
        generator,
    })
}

fn discretize_ou(
    mean: f64,
    reversion: f64,
    volatility: f64,
    n: usize,
    low: f64,
    high: f64,
) -> Result<IncomeChain> {
    if n < 2 {
        bail!("Income diffusion needs at least two grid points, got {}.", n);
    }
    if low >= high {
        bail!("Income grid lower bound {} must be below upper bound {}.", low, high);
    }
    if !(reversion >= 0.0) || !(volatility >= 0.0) {
        bail!("Mean reversion and volatility must be non-negative.");
    }

    let dz = (high - low) / (n - 1) as f64;
    let levels: Vec<f64> = (0..n).map(|i| low + dz * i as f64).collect();
    let variance = volatility * volatility;
    let diffusion = variance / (2.0 * dz * dz);

    let mut rates = vec![vec![0.0; n]; n];
    for (i, &z) in levels.iter().enumerate() {
        let drift = reversion * (mean - z);
        let up = drift.max(0.0) / dz + diffusion;
        let down = -drift.min(0.0) / dz + diffusion;
        // Reflecting boundaries: outward flows are dropped.
        if i + 1 < n {
            rates[i][i + 1] = up;
        }
        if i > 0 {
            rates[i][i - 1] = down;
        }
    }
    chain_from_rates(&levels, &rates)
}
