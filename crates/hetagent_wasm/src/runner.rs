//! Stepped HJB solve for progress reporting.

use crate::model::WasmHuggettModel;
use crate::summary::{js_error, HjbProgress, HjbSummary};
use hetagent_core::hjb::{HjbCheckpoint, HjbSettings, HjbSolver, HjbState};
use hetagent_core::model::HuggettModel;
use serde_wasm_bindgen::to_value;
use wasm_bindgen::prelude::*;

struct HjbRunnerState {
    model: HuggettModel,
    settings: HjbSettings,
    checkpoint: HjbCheckpoint,
}

#[wasm_bindgen]
pub struct WasmHjbRunner {
    state: Option<HjbRunnerState>,
}

#[wasm_bindgen]
impl WasmHjbRunner {
    #[wasm_bindgen(constructor)]
    pub fn new(model: &WasmHuggettModel) -> Result<WasmHjbRunner, JsValue> {
        console_error_panic_hook::set_once();

        let settings = model.settings.hjb;
        let checkpoint = HjbSolver::new(&model.model, settings, None)
            .map_err(|e| js_error("HJB setup failed", e))?
            .checkpoint();

        Ok(WasmHjbRunner {
            state: Some(HjbRunnerState {
                model: model.model.clone(),
                settings,
                checkpoint,
            }),
        })
    }

    pub fn is_done(&self) -> bool {
        self.state
            .as_ref()
            .map_or(true, |state| state.checkpoint.state.is_terminal())
    }

    pub fn run_steps(&mut self, batch_size: u32) -> Result<JsValue, JsValue> {
        let state = self
            .state
            .as_mut()
            .ok_or_else(|| JsValue::from_str("Runner not initialized"))?;

        if !state.checkpoint.state.is_terminal() {
            let mut solver =
                HjbSolver::resume(&state.model, state.settings, state.checkpoint.clone())
                    .map_err(|e| js_error("HJB resume failed", e))?;
            for _ in 0..batch_size {
                match solver.step() {
                    Ok(next) if next.is_terminal() => break,
                    Ok(_) => {}
                    Err(err) => {
                        state.checkpoint = solver.checkpoint();
                        return Err(js_error("HJB step failed", err));
                    }
                }
            }
            state.checkpoint = solver.checkpoint();
        }

        progress(state)
    }

    pub fn get_progress(&self) -> Result<JsValue, JsValue> {
        let state = self
            .state
            .as_ref()
            .ok_or_else(|| JsValue::from_str("Runner not initialized"))?;
        progress(state)
    }

    /// Consumes the runner's state; only valid once the solve converged.
    pub fn get_result(&mut self) -> Result<JsValue, JsValue> {
        let state = self
            .state
            .take()
            .ok_or_else(|| JsValue::from_str("Runner not initialized"))?;
        if state.checkpoint.state != HjbState::Converged {
            let message = format!("HJB solve not finished (state {:?})", state.checkpoint.state);
            self.state = Some(state);
            return Err(JsValue::from_str(&message));
        }

        let solution = HjbSolver::resume(&state.model, state.settings, state.checkpoint)
            .and_then(|solver| solver.into_solution())
            .map_err(|e| js_error("HJB result failed", e))?;
        to_value(&HjbSummary::new(&state.model, &solution))
            .map_err(|e| js_error("Serialization error", e))
    }
}

fn progress(state: &HjbRunnerState) -> Result<JsValue, JsValue> {
    let progress = HjbProgress {
        done: state.checkpoint.state.is_terminal(),
        iterations: state.checkpoint.iterations,
        max_iterations: state.settings.max_iterations,
        last_change: state.checkpoint.history.last().copied(),
    };
    to_value(&progress).map_err(|e| js_error("Serialization error", e))
}
