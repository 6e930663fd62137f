//! Execution controller: validates a run, drives the solver, streams
//! progress and produces the final restoration.
//!
//! ## Run lifecycle
//!
//! ```text
//! Idle ──start──▶ Running ──┬─▶ Completed (max_iter, likelihood peak, tolerance)
//!                           ├─▶ Aborted   (abort flag seen at an iteration boundary)
//!                           └─▶ Failed    (non-finite estimate or energy)
//! ```
//!
//! A run can be consumed three ways:
//! - [`DenoiseEngine::run`] with a progress callback
//! - [`DenoiseEngine::start`], a borrowing iterator of progress events
//! - [`DenoiseEngine::start_session`], an owned iterator for bindings
//!
//! An engine has at most one run in flight: starting another while a
//! [`RunSession`] is still running fails with
//! [`DenoiseError::RunInProgress`]. The engine is free again once the run
//! reaches a terminal state or its handle is dropped.
//!
//! Cancellation is cooperative: [`AbortHandle::abort`] is checked before each
//! iteration and once more before the result is assembled, so an abort seen
//! after iteration `k` yields no event past `k` and no [`Restoration`].

use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};
use serde::{Deserialize, Serialize};
use web_time::Instant;

use crate::error::{DenoiseError, DenoiseResult};
use crate::lattice::Lattice;
use crate::metrics::{heatmap_rgba, QualityMetrics};
use crate::params::{ModelKind, ModelParams};
use crate::solver::{build_solver, MapSolver, StopReason, TaskLabel};

// ============================================================================
// Public data
// ============================================================================

/// Emitted once per completed iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    /// 1-based iteration within the run.
    pub iteration: usize,
    /// Engine-wide step counter, unique across runs.
    pub step: u64,
    pub energy: f64,
    pub psnr: f64,
    pub ssim: f64,
    pub task: TaskLabel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_likelihood: Option<f64>,
}

/// Output of a completed run.
#[derive(Debug, Clone)]
pub struct Restoration {
    /// Restored 8-bit buffer, row-major.
    pub restored: Vec<u8>,
    /// SSIM heatmap of restored vs reference (RGBA).
    pub heatmap: Vec<u8>,
    /// SSIM heatmap of observed vs reference (RGBA), computed before iterating.
    pub initial_heatmap: Vec<u8>,
    pub psnr: f64,
    pub ssim: f64,
    pub initial_psnr: f64,
    pub initial_ssim: f64,
    pub iterations: usize,
    pub stop_reason: StopReason,
    /// Coefficients in force at the end, including learned updates.
    pub coefficients: ModelParams,
    /// Per-iteration log likelihood, when the model was asked to keep it.
    pub likelihood_trace: Option<Vec<f64>>,
    pub elapsed: Duration,
}

/// Terminal result of a run.
#[derive(Debug, Clone)]
pub enum RunOutcome {
    Completed(Restoration),
    Aborted { last_iteration: usize },
}

impl RunOutcome {
    pub fn restoration(&self) -> Option<&Restoration> {
        match self {
            RunOutcome::Completed(r) => Some(r),
            RunOutcome::Aborted { .. } => None,
        }
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self, RunOutcome::Aborted { .. })
    }
}

/// State of a run handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Running,
    Completed(StopReason),
    Aborted,
    Failed,
}

/// Cooperative cancellation flag shared with callers.
#[derive(Debug, Clone, Default)]
pub struct AbortHandle(Arc<AtomicBool>);

impl AbortHandle {
    /// Request that the current run stop at the next iteration boundary.
    pub fn abort(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

// ============================================================================
// Run guard
// ============================================================================

/// Marks an engine busy for as long as it lives.
#[derive(Debug)]
struct RunGuard(Arc<AtomicBool>);

impl RunGuard {
    fn acquire(busy: &Arc<AtomicBool>) -> DenoiseResult<Self> {
        busy.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| DenoiseError::RunInProgress)?;
        Ok(RunGuard(Arc::clone(busy)))
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

// ============================================================================
// Engine
// ============================================================================

/// One denoising engine over a fixed-size lattice.
///
/// Engines share nothing: side-by-side comparisons use one engine per model.
pub struct DenoiseEngine {
    lattice: Lattice,
    steps: Arc<AtomicU64>,
    abort: AbortHandle,
    busy: Arc<AtomicBool>,
}

impl DenoiseEngine {
    /// Allocate an engine for a `width x height` lattice.
    pub fn initialize(width: usize, height: usize) -> DenoiseResult<Self> {
        Ok(Self {
            lattice: Lattice::initialize(width, height)?,
            steps: Arc::new(AtomicU64::new(0)),
            abort: AbortHandle::default(),
            busy: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn width(&self) -> usize {
        self.lattice.grid().width()
    }

    pub fn height(&self) -> usize {
        self.lattice.grid().height()
    }

    pub fn lattice(&self) -> &Lattice {
        &self.lattice
    }

    /// Copy reference and observed buffers in.
    pub fn set_input(&mut self, reference: &[u8], observed: &[u8]) -> DenoiseResult<()> {
        self.lattice.set_input(reference, observed)
    }

    /// Handle that cancels whichever run is in flight.
    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    /// Request cancellation of the run in flight.
    pub fn abort(&self) {
        self.abort.abort();
    }

    /// Whether a run started on this engine has not yet finished.
    pub fn is_running(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    /// Total progress events emitted by this engine.
    pub fn step_count(&self) -> u64 {
        self.steps.load(Ordering::SeqCst)
    }

    /// Validate `params` and begin a run over the current input.
    ///
    /// Fails with [`DenoiseError::RunInProgress`] while a [`RunSession`]
    /// from this engine is still running.
    pub fn start(&mut self, params: &ModelParams) -> DenoiseResult<DenoiseRun<'_>> {
        let core = RunCore::new(self, params)?;
        Ok(DenoiseRun {
            core,
            _engine: PhantomData,
        })
    }

    /// Like [`DenoiseEngine::start`], but the run owns its state.
    pub fn start_session(&mut self, params: &ModelParams) -> DenoiseResult<RunSession> {
        Ok(RunSession {
            core: RunCore::new(self, params)?,
        })
    }

    /// Run to completion, calling `on_progress` once per iteration.
    ///
    /// Setup errors are returned before any iteration. Cancellation yields
    /// `Ok(RunOutcome::Aborted { .. })`.
    pub fn run<F>(
        &mut self,
        params: &ModelParams,
        reference: &[u8],
        observed: &[u8],
        mut on_progress: F,
    ) -> DenoiseResult<RunOutcome>
    where
        F: FnMut(&ProgressEvent),
    {
        params.validate()?;
        if self.is_running() {
            return Err(DenoiseError::RunInProgress);
        }
        self.set_input(reference, observed)?;
        let mut run = self.start(params)?;
        while let Some(event) = run.next() {
            on_progress(&event?);
        }
        run.finish()
    }
}

// ============================================================================
// Run core
// ============================================================================

struct RunCore {
    kind: ModelKind,
    solver: Box<dyn MapSolver>,
    lattice: Lattice,
    mean: f64,
    metrics: QualityMetrics,
    max_iter: usize,
    tolerance: Option<f64>,
    iteration: usize,
    state: RunState,
    pending_stop: Option<StopReason>,
    failure: Option<DenoiseError>,
    previous: Vec<f64>,
    quantized: Vec<f64>,
    initial_psnr: f64,
    initial_ssim: f64,
    initial_heatmap: Vec<u8>,
    steps: Arc<AtomicU64>,
    abort: AbortHandle,
    clock: Instant,
    guard: Option<RunGuard>,
}

impl RunCore {
    fn new(engine: &DenoiseEngine, params: &ModelParams) -> DenoiseResult<Self> {
        params.validate()?;
        let guard = RunGuard::acquire(&engine.busy)?;
        let mut lattice = engine.lattice.clone();
        lattice.reset_estimate();
        let grid = lattice.grid();
        let mean = lattice.observed_mean();
        let centered: Vec<f64> = lattice.observed().iter().map(|v| v - mean).collect();

        let metrics = QualityMetrics::new(grid, lattice.reference());
        let initial_psnr = metrics.psnr(lattice.observed());
        let initial = metrics.ssim(lattice.observed());
        let initial_heatmap = heatmap_rgba(&initial.map);

        engine.abort.reset();
        info!(
            "{} run started on {}x{} lattice (max_iter={}, initial PSNR {:.2} dB, SSIM {:.4})",
            params.kind(),
            grid.width(),
            grid.height(),
            params.max_iter(),
            initial_psnr,
            initial.mean
        );

        Ok(Self {
            kind: params.kind(),
            solver: build_solver(params, grid, centered.clone()),
            mean,
            metrics,
            max_iter: params.max_iter(),
            tolerance: params.tolerance(),
            iteration: 0,
            state: RunState::Running,
            pending_stop: None,
            failure: None,
            previous: centered,
            quantized: vec![0.0; grid.len()],
            initial_psnr,
            initial_ssim: initial.mean,
            initial_heatmap,
            steps: Arc::clone(&engine.steps),
            abort: engine.abort.clone(),
            clock: Instant::now(),
            guard: Some(guard),
            lattice,
        })
    }

    fn next_event(&mut self) -> Option<DenoiseResult<ProgressEvent>> {
        if self.state != RunState::Running {
            return None;
        }
        if self.abort.is_aborted() {
            info!("{} run aborted after iteration {}", self.kind, self.iteration);
            self.end(RunState::Aborted);
            return None;
        }
        if let Some(reason) = self.pending_stop.take() {
            self.end(RunState::Completed(reason));
            return None;
        }
        if self.iteration >= self.max_iter {
            self.end(RunState::Completed(StopReason::MaxIterations));
            return None;
        }

        self.iteration += 1;
        let outcome = self.solver.iterate(self.iteration);
        if let Err(err) = self.check_finite(outcome.energy) {
            self.end(RunState::Failed);
            self.failure = Some(err.clone());
            return Some(Err(err));
        }

        self.lattice.commit_estimate(self.solver.estimate(), self.mean);
        for (q, &v) in self.quantized.iter_mut().zip(self.lattice.estimate()) {
            *q = crate::lattice::clamp_and_round(v) as f64;
        }
        let psnr = self.metrics.psnr(&self.quantized);
        let ssim = self.metrics.ssim_mean(&self.quantized);
        let step = self.steps.fetch_add(1, Ordering::SeqCst) + 1;

        self.pending_stop = outcome.stop.or_else(|| self.converged());

        debug!(
            "{} iteration {}/{}: energy={:.6e} psnr={:.3} ssim={:.5} task={}",
            self.kind, self.iteration, self.max_iter, outcome.energy, psnr, ssim, outcome.task
        );
        Some(Ok(ProgressEvent {
            iteration: self.iteration,
            step,
            energy: outcome.energy,
            psnr,
            ssim,
            task: outcome.task,
            log_likelihood: outcome.log_likelihood,
        }))
    }

    /// Enter a terminal state and free the engine for the next run.
    fn end(&mut self, state: RunState) {
        self.state = state;
        self.guard = None;
    }

    fn check_finite(&self, energy: f64) -> DenoiseResult<()> {
        let reason = if !energy.is_finite() {
            format!("energy is {energy}")
        } else if let Some(i) = self.solver.estimate().iter().position(|v| !v.is_finite()) {
            format!("estimate is not finite at site {i}")
        } else {
            return Ok(());
        };
        Err(DenoiseError::RunFailed {
            model: self.kind,
            iteration: self.iteration,
            reason,
        })
    }

    /// Tolerance test on the mean absolute per-site change.
    fn converged(&mut self) -> Option<StopReason> {
        let tolerance = self.tolerance?;
        let estimate = self.solver.estimate();
        let n = estimate.len() as f64;
        let change: f64 = estimate
            .iter()
            .zip(&self.previous)
            .map(|(a, b)| (a - b).abs())
            .sum::<f64>()
            / n;
        self.previous.copy_from_slice(estimate);
        (change < tolerance).then_some(StopReason::Converged)
    }

    fn finish(&mut self) -> DenoiseResult<RunOutcome> {
        while let Some(event) = self.next_event() {
            event?;
        }
        match self.state {
            RunState::Completed(reason) => Ok(RunOutcome::Completed(self.restoration(reason))),
            RunState::Aborted => Ok(RunOutcome::Aborted {
                last_iteration: self.iteration,
            }),
            RunState::Failed | RunState::Running => Err(self.failure.clone().unwrap_or_else(|| {
                DenoiseError::RunFailed {
                    model: self.kind,
                    iteration: self.iteration,
                    reason: "run did not terminate".to_string(),
                }
            })),
        }
    }

    fn restoration(&mut self, reason: StopReason) -> Restoration {
        let restored = self.lattice.estimate_u8();
        for (q, &v) in self.quantized.iter_mut().zip(&restored) {
            *q = v as f64;
        }
        let psnr = self.metrics.psnr(&self.quantized);
        let report = self.metrics.ssim(&self.quantized);
        let elapsed = self.clock.elapsed();
        info!(
            "{} run completed after {} iterations ({:?}): PSNR {:.2} -> {:.2} dB, SSIM {:.4} -> {:.4} in {:?}",
            self.kind, self.iteration, reason, self.initial_psnr, psnr, self.initial_ssim, report.mean, elapsed
        );
        Restoration {
            restored,
            heatmap: heatmap_rgba(&report.map),
            initial_heatmap: self.initial_heatmap.clone(),
            psnr,
            ssim: report.mean,
            initial_psnr: self.initial_psnr,
            initial_ssim: self.initial_ssim,
            iterations: self.iteration,
            stop_reason: reason,
            coefficients: self.solver.coefficients(),
            likelihood_trace: self.solver.likelihood_trace(),
            elapsed,
        }
    }
}

// ============================================================================
// Run handles
// ============================================================================

/// A run borrowed from its engine; iterate it to drive the solver.
///
/// The sequence is finite and cannot be restarted. Call
/// [`DenoiseRun::finish`] to obtain the outcome.
pub struct DenoiseRun<'a> {
    core: RunCore,
    _engine: PhantomData<&'a mut DenoiseEngine>,
}

impl DenoiseRun<'_> {
    pub fn state(&self) -> RunState {
        self.core.state
    }

    pub fn iteration(&self) -> usize {
        self.core.iteration
    }

    /// Current estimate as 8-bit intensities.
    pub fn current_estimate(&self) -> Vec<u8> {
        self.core.lattice.estimate_u8()
    }

    /// Drain remaining iterations and return the outcome.
    pub fn finish(mut self) -> DenoiseResult<RunOutcome> {
        self.core.finish()
    }
}

impl Iterator for DenoiseRun<'_> {
    type Item = DenoiseResult<ProgressEvent>;

    fn next(&mut self) -> Option<Self::Item> {
        self.core.next_event()
    }
}

/// An owned run, for callers that cannot hold a borrow of the engine.
pub struct RunSession {
    core: RunCore,
}

impl RunSession {
    pub fn model(&self) -> ModelKind {
        self.core.kind
    }

    pub fn state(&self) -> RunState {
        self.core.state
    }

    pub fn iteration(&self) -> usize {
        self.core.iteration
    }

    pub fn current_estimate(&self) -> Vec<u8> {
        self.core.lattice.estimate_u8()
    }

    pub fn finish(&mut self) -> DenoiseResult<RunOutcome> {
        self.core.finish()
    }
}

impl Iterator for RunSession {
    type Item = DenoiseResult<ProgressEvent>;

    fn next(&mut self) -> Option<Self::Item> {
        self.core.next_event()
    }
}
