//! WebAssembly exports for the denoising engine.
//!
//! These are exposed to JavaScript via wasm-bindgen. A web worker drives a
//! run by pulling one iteration at a time, so an `abort()` arriving between
//! two `step()` calls is honored at the next iteration boundary:
//!
//! ```text
//! const engine = new WasmEngine(256, 256);
//! engine.setInput(reference, observed);
//! engine.start("LC-MRF", JSON.stringify(params));
//! let event;
//! while ((event = engine.step()) !== undefined) postMessage(JSON.parse(event));
//! const done = JSON.parse(engine.finish());
//! ```

use serde::Serialize;
use wasm_bindgen::prelude::*;

use crate::engine::{DenoiseEngine, RunOutcome, RunSession};
use crate::error::DenoiseError;
use crate::lattice::Grid;
use crate::metrics::QualityMetrics;
use crate::params::{ModelKind, ModelParams};
use crate::solver::StopReason;

fn js_err(err: DenoiseError) -> JsValue {
    JsValue::from_str(&err.to_string())
}

/// Completion message, shaped for the presentation layer.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DoneMessage {
    aborted: bool,
    iterations: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop_reason: Option<StopReason>,
    final_psnr: Option<f64>,
    final_ssim: Option<f64>,
    initial_psnr: Option<f64>,
    initial_ssim: Option<f64>,
    /// Milliseconds.
    execution_time: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    likelihood_trace: Option<Vec<f64>>,
}

// ============================================================================
// Engine
// ============================================================================

/// Pull-driven denoising engine.
#[wasm_bindgen]
pub struct WasmEngine {
    engine: DenoiseEngine,
    session: Option<RunSession>,
    outcome: Option<RunOutcome>,
}

#[wasm_bindgen]
impl WasmEngine {
    /// Allocate an engine for a `width x height` lattice.
    #[wasm_bindgen(constructor)]
    pub fn new(width: usize, height: usize) -> Result<WasmEngine, JsValue> {
        Ok(WasmEngine {
            engine: DenoiseEngine::initialize(width, height).map_err(js_err)?,
            session: None,
            outcome: None,
        })
    }

    /// Copy the reference and observed 8-bit buffers in.
    #[wasm_bindgen(js_name = setInput)]
    pub fn set_input(&mut self, reference: &[u8], observed: &[u8]) -> Result<(), JsValue> {
        self.engine.set_input(reference, observed).map_err(js_err)
    }

    /// Validate parameters and begin a run. Any previous run is discarded.
    pub fn start(&mut self, model: &str, params_json: &str) -> Result<(), JsValue> {
        let kind = ModelKind::parse(model).map_err(js_err)?;
        let params = ModelParams::from_json(kind, params_json).map_err(js_err)?;
        self.outcome = None;
        // Dropping the old session frees the engine
        self.session = None;
        self.session = Some(self.engine.start_session(&params).map_err(js_err)?);
        Ok(())
    }

    /// Run one iteration and return its progress event as JSON, or
    /// `undefined` once the run has ended.
    pub fn step(&mut self) -> Result<Option<String>, JsValue> {
        let Some(session) = self.session.as_mut() else {
            return Ok(None);
        };
        match session.next() {
            Some(event) => {
                let event = event.map_err(js_err)?;
                serde_json::to_string(&event)
                    .map(Some)
                    .map_err(|e| JsValue::from_str(&e.to_string()))
            }
            None => Ok(None),
        }
    }

    /// Request cancellation at the next iteration boundary.
    pub fn abort(&self) {
        self.engine.abort();
    }

    /// Finish the run and return the completion message as JSON.
    pub fn finish(&mut self) -> Result<String, JsValue> {
        let mut session = self
            .session
            .take()
            .ok_or_else(|| JsValue::from_str("no run in progress"))?;
        let outcome = session.finish().map_err(js_err)?;

        let message = match &outcome {
            RunOutcome::Aborted { last_iteration } => DoneMessage {
                aborted: true,
                iterations: *last_iteration,
                stop_reason: None,
                final_psnr: None,
                final_ssim: None,
                initial_psnr: None,
                initial_ssim: None,
                execution_time: 0.0,
                likelihood_trace: None,
            },
            RunOutcome::Completed(r) => DoneMessage {
                aborted: false,
                iterations: r.iterations,
                stop_reason: Some(r.stop_reason),
                final_psnr: Some(r.psnr),
                final_ssim: Some(r.ssim),
                initial_psnr: Some(r.initial_psnr),
                initial_ssim: Some(r.initial_ssim),
                execution_time: r.elapsed.as_secs_f64() * 1000.0,
                likelihood_trace: r.likelihood_trace.clone(),
            },
        };
        self.outcome = Some(outcome);
        serde_json::to_string(&message).map_err(|e| JsValue::from_str(&e.to_string()))
    }

    /// Current estimate of the run in flight (8-bit, row-major).
    pub fn preview(&self) -> Vec<u8> {
        self.session
            .as_ref()
            .map(RunSession::current_estimate)
            .unwrap_or_default()
    }

    /// Restored buffer of the last completed run.
    pub fn restored(&self) -> Vec<u8> {
        self.completed(|r| r.restored.clone())
    }

    /// Final SSIM heatmap (RGBA) of the last completed run.
    pub fn heatmap(&self) -> Vec<u8> {
        self.completed(|r| r.heatmap.clone())
    }

    /// Observed-vs-reference SSIM heatmap (RGBA) of the last completed run.
    #[wasm_bindgen(js_name = initialHeatmap)]
    pub fn initial_heatmap(&self) -> Vec<u8> {
        self.completed(|r| r.initial_heatmap.clone())
    }
}

impl WasmEngine {
    fn completed<F>(&self, f: F) -> Vec<u8>
    where
        F: Fn(&crate::engine::Restoration) -> Vec<u8>,
    {
        self.outcome
            .as_ref()
            .and_then(RunOutcome::restoration)
            .map(f)
            .unwrap_or_default()
    }
}

// ============================================================================
// Metrics
// ============================================================================

/// SSIM heatmap (RGBA) of `estimate` against `reference`.
///
/// # Arguments
/// * `reference` - Flat 8-bit grayscale buffer (length = width * height)
/// * `estimate` - Flat 8-bit grayscale buffer (length = width * height)
/// * `width` - Image width in pixels
/// * `height` - Image height in pixels
#[wasm_bindgen]
pub fn ssim_heatmap_wasm(
    reference: &[u8],
    estimate: &[u8],
    width: usize,
    height: usize,
) -> Result<Vec<u8>, JsValue> {
    let grid = Grid::new(width, height).map_err(js_err)?;
    for (name, buffer) in [("reference", reference), ("estimate", estimate)] {
        if buffer.len() != grid.len() {
            return Err(js_err(DenoiseError::SizeMismatch {
                buffer: name,
                expected: grid.len(),
                actual: buffer.len(),
            }));
        }
    }
    let reference: Vec<f64> = reference.iter().map(|&v| v as f64).collect();
    let estimate: Vec<f64> = estimate.iter().map(|&v| v as f64).collect();
    Ok(QualityMetrics::new(grid, &reference).heatmap(&estimate))
}

/// Thesis default coefficients for `model`, as JSON.
#[wasm_bindgen]
pub fn default_params_wasm(model: &str) -> Result<String, JsValue> {
    let kind = ModelKind::parse(model).map_err(js_err)?;
    Ok(ModelParams::defaults(kind).to_value().to_string())
}
