//! Asset-market clearing over the interest rate.

use crate::error::{SolverError, SolverResult};
use crate::hjb::{solve_hjb_from, HjbSettings, HjbSolution};
use crate::model::HuggettModel;
use crate::rootfind::{brent, BrentSettings};
use crate::stationary::{stationary_distribution, StationaryDistribution, StationarySettings};
use nalgebra::DVector;
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EquilibriumSettings {
    pub hjb: HjbSettings,
    pub stationary: StationarySettings,
    pub brent: BrentSettings,
    /// Net asset supply the market has to absorb; zero in a closed economy.
    pub asset_supply: f64,
    /// Start each HJB solve from the previous candidate's value function.
    pub warm_start: bool,
}

impl Default for EquilibriumSettings {
    fn default() -> Self {
        Self {
            hjb: HjbSettings::default(),
            stationary: StationarySettings::default(),
            brent: BrentSettings::default(),
            asset_supply: 0.0,
            warm_start: true,
        }
    }
}

/// Household block solved at one interest rate.
#[derive(Debug, Clone)]
pub struct MarketPoint {
    pub interest_rate: f64,
    pub aggregate_assets: f64,
    pub excess_demand: f64,
    pub hjb: HjbSolution,
    pub distribution: StationaryDistribution,
}

#[derive(Debug, Clone)]
pub struct Equilibrium {
    pub interest_rate: f64,
    pub excess_demand: f64,
    pub hjb: HjbSolution,
    pub distribution: StationaryDistribution,
    /// Household-block solves performed by the outer search.
    pub evaluations: usize,
}

/// `sum_i a_i * mass_i`, equal to `∫ a g(a, z) da dz` on the grid.
pub fn aggregate_assets(model: &HuggettModel, mass: &DVector<f64>) -> f64 {
    mass.iter()
        .enumerate()
        .map(|(idx, m)| model.asset_at(idx) * m)
        .sum()
}

pub fn excess_demand(
    model: &HuggettModel,
    r: f64,
    settings: &EquilibriumSettings,
) -> SolverResult<MarketPoint> {
    excess_demand_from(model, r, settings, None)
}

fn excess_demand_from(
    model: &HuggettModel,
    r: f64,
    settings: &EquilibriumSettings,
    initial: Option<DVector<f64>>,
) -> SolverResult<MarketPoint> {
    let candidate = model.with_interest_rate(r);
    let hjb = solve_hjb_from(&candidate, settings.hjb, initial)?;
    let distribution = stationary_distribution(&candidate, &hjb.generator, &settings.stationary)?;
    let aggregate = aggregate_assets(&candidate, &distribution.mass);
    Ok(MarketPoint {
        interest_rate: r,
        aggregate_assets: aggregate,
        excess_demand: aggregate - settings.asset_supply,
        hjb,
        distribution,
    })
}

/// Excess demand at each rate, in order. Useful for plotting the market and
/// for picking a bracket.
pub fn excess_demand_curve(
    model: &HuggettModel,
    rates: &[f64],
    settings: &EquilibriumSettings,
) -> SolverResult<Vec<f64>> {
    let mut previous: Option<DVector<f64>> = None;
    let mut curve = Vec::with_capacity(rates.len());
    for &r in rates {
        let initial = if settings.warm_start { previous.take() } else { None };
        let point = excess_demand_from(model, r, settings, initial)?;
        curve.push(point.excess_demand);
        previous = Some(point.hjb.value);
    }
    Ok(curve)
}

pub fn solve_equilibrium(
    model: &HuggettModel,
    bracket: (f64, f64),
    settings: &EquilibriumSettings,
) -> SolverResult<Equilibrium> {
    let (r_lo, r_hi) = bracket;
    if !(r_lo < model.params.rho) || !(r_hi < model.params.rho) {
        return Err(SolverError::InvalidInput(format!(
            "interest rate bracket [{}, {}] must lie below rho = {}",
            r_lo, r_hi, model.params.rho
        )));
    }

    let mut evaluations = 0usize;
    let mut last: Option<MarketPoint> = None;
    let root = brent(
        |r| {
            let initial = match (&last, settings.warm_start) {
                (Some(point), true) => Some(point.hjb.value.clone()),
                _ => None,
            };
            let point = excess_demand_from(model, r, settings, initial)?;
            evaluations += 1;
            info!(
                evaluation = evaluations,
                r,
                excess_demand = point.excess_demand,
                "equilibrium candidate"
            );
            let value = point.excess_demand;
            last = Some(point);
            Ok(value)
        },
        r_lo,
        r_hi,
        &settings.brent,
    )?;

    let point = match last {
        Some(point) if point.interest_rate == root.x => point,
        other => {
            let initial = other.map(|p| p.hjb.value).filter(|_| settings.warm_start);
            evaluations += 1;
            excess_demand_from(model, root.x, settings, initial)?
        }
    };
    info!(
        interest_rate = point.interest_rate,
        excess_demand = point.excess_demand,
        evaluations,
        "asset market cleared"
    );

    Ok(Equilibrium {
        interest_rate: point.interest_rate,
        excess_demand: point.excess_demand,
        hjb: point.hjb,
        distribution: point.distribution,
        evaluations,
    })
}
