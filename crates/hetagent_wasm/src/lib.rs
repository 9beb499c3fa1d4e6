//! wasm-bindgen bridge exposing the hetagent solvers to JavaScript.
//!
//! Model configurations and settings cross the boundary as plain objects
//! (serde-wasm-bindgen); results come back as serialized summaries or
//! `Float64Array`s.

mod model;
mod runner;
mod summary;

pub use model::WasmHuggettModel;
pub use runner::WasmHjbRunner;
