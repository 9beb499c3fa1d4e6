//! Serializable result payloads and the conversions the bindings share.

use anyhow::{bail, Context, Result};
use hetagent_core::equilibrium::{aggregate_assets, Equilibrium};
use hetagent_core::hjb::HjbSolution;
use hetagent_core::model::{HuggettModel, ModelConfig};
use hetagent_core::stationary::{StationaryDistribution, StationaryMethod};
use nalgebra::{DMatrix, DVector};
use serde::Serialize;
use wasm_bindgen::JsValue;

/// Stacked vectors use the asset-fastest layout `i_a + n_assets * i_z`.
#[derive(Debug, Serialize)]
pub(crate) struct HjbSummary {
    pub n_assets: usize,
    pub n_income: usize,
    pub iterations: usize,
    pub history: Vec<f64>,
    pub value: Vec<f64>,
    pub consumption: Vec<f64>,
    pub drift: Vec<f64>,
}

impl HjbSummary {
    pub fn new(model: &HuggettModel, solution: &HjbSolution) -> Self {
        Self {
            n_assets: model.n_assets(),
            n_income: model.n_income(),
            iterations: solution.iterations,
            history: solution.history.clone(),
            value: stacked(&solution.value),
            consumption: stacked(solution.consumption()),
            drift: stacked(solution.drift()),
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct DistributionSummary {
    pub method: StationaryMethod,
    pub mass: Vec<f64>,
    /// Column-major `(n_assets, n_income)` density.
    pub density: Vec<f64>,
    pub aggregate_assets: f64,
    pub regularization: Option<f64>,
    pub eigenvalue: Option<f64>,
}

impl DistributionSummary {
    pub fn new(model: &HuggettModel, distribution: &StationaryDistribution) -> Self {
        Self {
            method: distribution.method,
            mass: stacked(&distribution.mass),
            density: column_major(&distribution.density),
            aggregate_assets: aggregate_assets(model, &distribution.mass),
            regularization: distribution.regularization,
            eigenvalue: distribution.eigenvalue,
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct EquilibriumSummary {
    pub interest_rate: f64,
    pub excess_demand: f64,
    pub evaluations: usize,
    pub hjb: HjbSummary,
    pub distribution: DistributionSummary,
}

impl EquilibriumSummary {
    pub fn new(model: &HuggettModel, equilibrium: &Equilibrium) -> Self {
        let model = model.with_interest_rate(equilibrium.interest_rate);
        Self {
            interest_rate: equilibrium.interest_rate,
            excess_demand: equilibrium.excess_demand,
            evaluations: equilibrium.evaluations,
            hjb: HjbSummary::new(&model, &equilibrium.hjb),
            distribution: DistributionSummary::new(&model, &equilibrium.distribution),
        }
    }
}

/// Progress payload for the stepped HJB runner.
#[derive(Debug, Serialize)]
pub(crate) struct HjbProgress {
    pub done: bool,
    pub iterations: usize,
    pub max_iterations: usize,
    pub last_change: Option<f64>,
}

pub(crate) fn stacked(v: &DVector<f64>) -> Vec<f64> {
    v.as_slice().to_vec()
}

pub(crate) fn column_major(m: &DMatrix<f64>) -> Vec<f64> {
    m.as_slice().to_vec()
}

pub(crate) fn build_model(config: &ModelConfig) -> Result<HuggettModel> {
    config.build().context("Invalid model configuration.")
}

pub(crate) fn parse_method(name: &str) -> Result<StationaryMethod> {
    let method = match name.to_ascii_lowercase().as_str() {
        "direct" => StationaryMethod::Direct,
        "gth" => StationaryMethod::Gth,
        "eigenvector" | "eigen" => StationaryMethod::Eigenvector,
        "resolvent" => StationaryMethod::Resolvent,
        "time_iteration" | "time" => StationaryMethod::TimeIteration,
        other => bail!("Unknown stationary method '{}'.", other),
    };
    Ok(method)
}

pub(crate) fn js_error(context: &str, err: impl std::fmt::Display) -> JsValue {
    JsValue::from_str(&format!("{}: {:#}", context, err))
}
