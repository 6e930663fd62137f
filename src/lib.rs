//! MRF Denoise
//!
//! Bayesian denoising of 8-bit grayscale images with four Markov random
//! field energy models, each solved by its own MAP algorithm, with online
//! hyperparameter learning and per-iteration quality metrics. Python
//! bindings via PyO3 and WASM bindings for JavaScript.
//!
//! ## Models
//! - **GMRF**: quadratic edge penalty, direct red-black relaxation
//! - **HGMRF**: hierarchical quadratic prior with a latent bias field,
//!   stopped at the peak of the marginal likelihood
//! - **rTV-MRF**: relaxed total variation, split Bregman
//! - **LC-MRF**: log-cosh edge penalty, gradient MAP with MALA-based learning
//!
//! ## Buffers
//! Images are row-major `u8` buffers of length `width * height`. Heatmaps
//! are RGBA `u8` buffers of length `width * height * 4`. Internally every
//! buffer is `f64` and solvers work on the mean-centered observation.
//!
//! ## Usage
//! ```no_run
//! use mrf_denoise::{DenoiseEngine, ModelKind, ModelParams};
//!
//! # fn main() -> mrf_denoise::DenoiseResult<()> {
//! let (reference, observed) = (vec![128u8; 64 * 64], vec![128u8; 64 * 64]);
//! let mut engine = DenoiseEngine::initialize(64, 64)?;
//! let params = ModelParams::defaults(ModelKind::Gmrf);
//! let outcome = engine.run(&params, &reference, &observed, |event| {
//!     println!("{} {:.2} dB", event.iteration, event.psnr);
//! })?;
//! if let Some(result) = outcome.restoration() {
//!     println!("final SSIM {:.4}", result.ssim);
//! }
//! # Ok(())
//! # }
//! ```

pub mod energy;
pub mod engine;
pub mod error;
pub mod lattice;
pub mod learner;
pub mod metrics;
pub mod params;
pub mod sampler;
pub mod solver;

#[cfg(feature = "wasm")]
pub mod wasm;

pub use engine::{AbortHandle, DenoiseEngine, DenoiseRun, ProgressEvent, Restoration, RunOutcome, RunSession, RunState};
pub use error::{DenoiseError, DenoiseResult};
pub use lattice::{Grid, Lattice};
pub use metrics::{psnr, QualityMetrics, SsimConfig, PSNR_CEILING};
pub use params::{GmrfParams, HgmrfParams, LcParams, ModelKind, ModelParams, TvParams};
pub use solver::{StopReason, TaskLabel};

// Python bindings (only when python feature is enabled)
#[cfg(feature = "python")]
mod python {
    use ndarray::{Array2, Array3};
    use numpy::{IntoPyArray, PyArray2, PyArray3, PyReadonlyArray2};
    use pyo3::exceptions::{PyRuntimeError, PyValueError};
    use pyo3::prelude::*;
    use pyo3::types::PyDict;

    use crate::engine::{DenoiseEngine, ProgressEvent, RunOutcome};
    use crate::error::DenoiseError;
    use crate::lattice::Grid;
    use crate::metrics::{self, QualityMetrics};
    use crate::params::{ModelKind, ModelParams};

    fn to_py_err(err: DenoiseError) -> PyErr {
        match err {
            DenoiseError::RunFailed { .. } | DenoiseError::RunInProgress => PyRuntimeError::new_err(err.to_string()),
            _ => PyValueError::new_err(err.to_string()),
        }
    }

    fn flatten(image: &PyReadonlyArray2<'_, u8>) -> Vec<u8> {
        image.as_array().iter().copied().collect()
    }

    fn to_image<'py>(py: Python<'py>, data: Vec<u8>, width: usize, height: usize) -> PyResult<Bound<'py, PyArray2<u8>>> {
        let array = Array2::from_shape_vec((height, width), data)
            .map_err(|e| PyValueError::new_err(e.to_string()))?;
        Ok(array.into_pyarray(py))
    }

    fn to_rgba<'py>(py: Python<'py>, data: Vec<u8>, width: usize, height: usize) -> PyResult<Bound<'py, PyArray3<u8>>> {
        let array = Array3::from_shape_vec((height, width, 4), data)
            .map_err(|e| PyValueError::new_err(e.to_string()))?;
        Ok(array.into_pyarray(py))
    }

    fn event_dict<'py>(py: Python<'py>, event: &ProgressEvent) -> PyResult<Bound<'py, PyDict>> {
        let dict = PyDict::new(py);
        dict.set_item("iteration", event.iteration)?;
        dict.set_item("step", event.step)?;
        dict.set_item("energy", event.energy)?;
        dict.set_item("psnr", event.psnr)?;
        dict.set_item("ssim", event.ssim)?;
        dict.set_item("task", event.task.as_str())?;
        dict.set_item("log_likelihood", event.log_likelihood)?;
        Ok(dict)
    }

    // ========================================================================
    // Engine
    // ========================================================================

    /// Denoising engine over a fixed `width x height` lattice.
    #[pyclass(name = "DenoiseEngine")]
    pub struct PyDenoiseEngine {
        engine: DenoiseEngine,
    }

    #[pymethods]
    impl PyDenoiseEngine {
        #[new]
        fn new(width: usize, height: usize) -> PyResult<Self> {
            let engine = DenoiseEngine::initialize(width, height).map_err(to_py_err)?;
            Ok(Self { engine })
        }

        #[getter]
        fn width(&self) -> usize {
            self.engine.width()
        }

        #[getter]
        fn height(&self) -> usize {
            self.engine.height()
        }

        /// Run one model to completion.
        ///
        /// # Arguments
        /// * `model` - "GMRF", "HGMRF", "rTV-MRF" or "LC-MRF"
        /// * `params` - JSON coefficient map
        /// * `reference` - Clean image (height, width) u8
        /// * `observed` - Noisy image (height, width) u8
        /// * `callback` - Called with a progress dict per iteration; returning
        ///   `False` aborts the run
        ///
        /// # Returns
        /// Result dict, or `{"aborted": True, "last_iteration": k}`
        #[pyo3(signature = (model, params, reference, observed, callback=None))]
        fn run<'py>(
            &mut self,
            py: Python<'py>,
            model: &str,
            params: &str,
            reference: PyReadonlyArray2<'py, u8>,
            observed: PyReadonlyArray2<'py, u8>,
            callback: Option<PyObject>,
        ) -> PyResult<Bound<'py, PyDict>> {
            let kind = ModelKind::parse(model).map_err(to_py_err)?;
            let params = ModelParams::from_json(kind, params).map_err(to_py_err)?;
            let (reference, observed) = (flatten(&reference), flatten(&observed));

            let abort = self.engine.abort_handle();
            let mut callback_error: Option<PyErr> = None;
            let outcome = self
                .engine
                .run(&params, &reference, &observed, |event| {
                    let Some(callback) = &callback else {
                        return;
                    };
                    let keep_going = event_dict(py, event)
                        .and_then(|dict| callback.call1(py, (dict,)))
                        .and_then(|ret| ret.extract::<Option<bool>>(py));
                    match keep_going {
                        Ok(Some(false)) => abort.abort(),
                        Ok(_) => {}
                        Err(err) => {
                            callback_error.get_or_insert(err);
                            abort.abort();
                        }
                    }
                })
                .map_err(to_py_err)?;
            if let Some(err) = callback_error {
                return Err(err);
            }

            let (width, height) = (self.engine.width(), self.engine.height());
            let dict = PyDict::new(py);
            match outcome {
                RunOutcome::Aborted { last_iteration } => {
                    dict.set_item("aborted", true)?;
                    dict.set_item("last_iteration", last_iteration)?;
                }
                RunOutcome::Completed(r) => {
                    dict.set_item("aborted", false)?;
                    dict.set_item("restored", to_image(py, r.restored, width, height)?)?;
                    dict.set_item("heatmap", to_rgba(py, r.heatmap, width, height)?)?;
                    dict.set_item("initial_heatmap", to_rgba(py, r.initial_heatmap, width, height)?)?;
                    dict.set_item("psnr", r.psnr)?;
                    dict.set_item("ssim", r.ssim)?;
                    dict.set_item("initial_psnr", r.initial_psnr)?;
                    dict.set_item("initial_ssim", r.initial_ssim)?;
                    dict.set_item("iterations", r.iterations)?;
                    dict.set_item("stop_reason", format!("{:?}", r.stop_reason))?;
                    dict.set_item("coefficients", r.coefficients.to_value().to_string())?;
                    dict.set_item("likelihood_trace", r.likelihood_trace)?;
                    dict.set_item("execution_time", r.elapsed.as_secs_f64())?;
                }
            }
            Ok(dict)
        }
    }

    // ========================================================================
    // Metrics
    // ========================================================================

    fn metric_inputs(
        reference: &PyReadonlyArray2<'_, u8>,
        estimate: &PyReadonlyArray2<'_, u8>,
    ) -> PyResult<(Grid, Vec<f64>, Vec<f64>)> {
        let (height, width) = reference.as_array().dim();
        if estimate.as_array().dim() != (height, width) {
            return Err(PyValueError::new_err("reference and estimate shapes differ"));
        }
        let grid = Grid::new(width, height).map_err(to_py_err)?;
        let to_f64 = |img: &PyReadonlyArray2<'_, u8>| -> Vec<f64> { img.as_array().iter().map(|&v| v as f64).collect() };
        Ok((grid, to_f64(reference), to_f64(estimate)))
    }

    /// PSNR in dB (100 for identical images).
    #[pyfunction]
    fn psnr(reference: PyReadonlyArray2<'_, u8>, estimate: PyReadonlyArray2<'_, u8>) -> PyResult<f64> {
        let (_, reference, estimate) = metric_inputs(&reference, &estimate)?;
        Ok(metrics::psnr(&reference, &estimate))
    }

    /// Mean SSIM and the per-pixel SSIM map.
    #[pyfunction]
    fn ssim<'py>(
        py: Python<'py>,
        reference: PyReadonlyArray2<'py, u8>,
        estimate: PyReadonlyArray2<'py, u8>,
    ) -> PyResult<(f64, Bound<'py, PyArray2<f64>>)> {
        let (grid, reference, estimate) = metric_inputs(&reference, &estimate)?;
        let report = QualityMetrics::new(grid, &reference).ssim(&estimate);
        Ok((report.mean, report.map.into_pyarray(py)))
    }

    /// SSIM heatmap as (height, width, 4) RGBA.
    #[pyfunction]
    fn ssim_heatmap<'py>(
        py: Python<'py>,
        reference: PyReadonlyArray2<'py, u8>,
        estimate: PyReadonlyArray2<'py, u8>,
    ) -> PyResult<Bound<'py, PyArray3<u8>>> {
        let (grid, reference, estimate) = metric_inputs(&reference, &estimate)?;
        let rgba = QualityMetrics::new(grid, &reference).heatmap(&estimate);
        to_rgba(py, rgba, grid.width(), grid.height())
    }

    /// Thesis default coefficients for a model, as JSON.
    #[pyfunction]
    fn default_params(model: &str) -> PyResult<String> {
        let kind = ModelKind::parse(model).map_err(to_py_err)?;
        Ok(ModelParams::defaults(kind).to_value().to_string())
    }

    /// MRF denoising extension module
    #[pymodule]
    pub fn mrf_denoise(m: &Bound<'_, PyModule>) -> PyResult<()> {
        m.add_class::<PyDenoiseEngine>()?;

        // Metrics
        m.add_function(wrap_pyfunction!(psnr, m)?)?;
        m.add_function(wrap_pyfunction!(ssim, m)?)?;
        m.add_function(wrap_pyfunction!(ssim_heatmap, m)?)?;

        // Configuration
        m.add_function(wrap_pyfunction!(default_params, m)?)?;

        Ok(())
    }
}

#[cfg(feature = "python")]
pub use python::mrf_denoise;
