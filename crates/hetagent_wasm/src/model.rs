//! Model wrapper with one-shot solver entry points.

use crate::summary::{
    build_model, js_error, parse_method, DistributionSummary, EquilibriumSummary, HjbSummary,
};
use hetagent_core::equilibrium::{excess_demand_curve, solve_equilibrium, EquilibriumSettings};
use hetagent_core::hjb::{solve_hjb, HjbSettings};
use hetagent_core::model::{HuggettModel, ModelConfig};
use hetagent_core::stationary::{stationary_distribution, StationarySettings};
use js_sys::Float64Array;
use serde_wasm_bindgen::{from_value, to_value};
use wasm_bindgen::prelude::*;

#[wasm_bindgen]
pub struct WasmHuggettModel {
    pub(crate) model: HuggettModel,
    pub(crate) settings: EquilibriumSettings,
}

#[wasm_bindgen]
impl WasmHuggettModel {
    /// `config` is a serialized `ModelConfig`; `undefined` or `null` selects
    /// the default two-state Poisson economy.
    #[wasm_bindgen(constructor)]
    pub fn new(config: JsValue) -> Result<WasmHuggettModel, JsValue> {
        console_error_panic_hook::set_once();

        let config: ModelConfig = if config.is_undefined() || config.is_null() {
            ModelConfig::default()
        } else {
            from_value(config).map_err(|e| js_error("Invalid model config", e))?
        };
        let model = build_model(&config).map_err(|e| js_error("Model construction failed", e))?;

        Ok(WasmHuggettModel {
            model,
            settings: EquilibriumSettings::default(),
        })
    }

    pub fn set_hjb_settings(&mut self, settings: JsValue) -> Result<(), JsValue> {
        let settings: HjbSettings =
            from_value(settings).map_err(|e| js_error("Invalid HJB settings", e))?;
        self.settings.hjb = settings;
        Ok(())
    }

    pub fn set_stationary_settings(&mut self, settings: JsValue) -> Result<(), JsValue> {
        let settings: StationarySettings =
            from_value(settings).map_err(|e| js_error("Invalid stationary settings", e))?;
        self.settings.stationary = settings;
        Ok(())
    }

    pub fn set_interest_rate(&mut self, r: f64) {
        self.model = self.model.with_interest_rate(r);
    }

    pub fn interest_rate(&self) -> f64 {
        self.model.params.r
    }

    pub fn asset_grid(&self) -> Float64Array {
        Float64Array::from(self.model.grid.points())
    }

    pub fn income_levels(&self) -> Float64Array {
        Float64Array::from(self.model.income.levels.as_slice())
    }

    pub fn solve_hjb(&self) -> Result<JsValue, JsValue> {
        let solution =
            solve_hjb(&self.model, self.settings.hjb).map_err(|e| js_error("HJB solve failed", e))?;
        to_value(&HjbSummary::new(&self.model, &solution))
            .map_err(|e| js_error("Serialization error", e))
    }

    /// Solves the HJB at the current rate, then the stationary distribution
    /// with `method` (`direct`, `gth`, `eigenvector`, `resolvent`,
    /// `time_iteration`).
    pub fn stationary_distribution(&self, method: &str) -> Result<JsValue, JsValue> {
        let method = parse_method(method).map_err(|e| js_error("Invalid method", e))?;
        let settings = StationarySettings {
            method,
            ..self.settings.stationary
        };
        let solution =
            solve_hjb(&self.model, self.settings.hjb).map_err(|e| js_error("HJB solve failed", e))?;
        let distribution = stationary_distribution(&self.model, &solution.generator, &settings)
            .map_err(|e| js_error("Stationary distribution failed", e))?;
        to_value(&DistributionSummary::new(&self.model, &distribution))
            .map_err(|e| js_error("Serialization error", e))
    }

    pub fn excess_demand_curve(&self, rates: Vec<f64>) -> Result<Float64Array, JsValue> {
        let curve = excess_demand_curve(&self.model, &rates, &self.settings)
            .map_err(|e| js_error("Excess demand failed", e))?;
        Ok(Float64Array::from(curve.as_slice()))
    }

    pub fn solve_equilibrium(&self, r_lo: f64, r_hi: f64) -> Result<JsValue, JsValue> {
        let equilibrium = solve_equilibrium(&self.model, (r_lo, r_hi), &self.settings)
            .map_err(|e| js_error("Equilibrium solve failed", e))?;
        to_value(&EquilibriumSummary::new(&self.model, &equilibrium))
            .map_err(|e| js_error("Serialization error", e))
    }
}

#[cfg(all(test, target_arch = "wasm32"))]
mod tests {
    use super::WasmHuggettModel;
    use hetagent_core::grid::GridSpec;
    use hetagent_core::model::ModelConfig;
    use serde_wasm_bindgen::to_value;
    use wasm_bindgen::JsValue;
    use wasm_bindgen_test::wasm_bindgen_test;

    fn small_model() -> WasmHuggettModel {
        let mut config = ModelConfig::default();
        config.grid = GridSpec::Uniform {
            n: 40,
            low: -0.1,
            high: 1.0,
        };
        WasmHuggettModel::new(to_value(&config).expect("config")).expect("model")
    }

    #[wasm_bindgen_test]
    fn default_model_exposes_grid() {
        let model = WasmHuggettModel::new(JsValue::UNDEFINED).expect("default model");
        assert_eq!(model.asset_grid().length(), 500);
        assert_eq!(model.income_levels().length(), 2);
    }

    #[wasm_bindgen_test]
    fn unknown_method_is_rejected() {
        let model = small_model();
        let message = model
            .stationary_distribution("qr")
            .err()
            .and_then(|err| err.as_string())
            .unwrap_or_default();
        assert!(message.contains("Unknown stationary method"));
    }

    #[wasm_bindgen_test]
    fn excess_demand_curve_has_one_entry_per_rate() {
        let model = small_model();
        let curve = model
            .excess_demand_curve(vec![0.01, 0.02])
            .expect("curve should compute");
        assert_eq!(curve.length(), 2);
    }
}
