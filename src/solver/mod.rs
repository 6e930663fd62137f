//! MAP solvers, one per energy model.
//!
//! Every solver works on the mean-centered observation and owns exactly the
//! state its algorithm needs:
//!
//! - [`GmrfSolver`]: estimate only
//! - [`HgmrfSolver`]: estimate, latent bias field, likelihood peak detector
//! - [`TvSolver`]: estimate, auxiliary edge differences, Bregman residuals
//! - [`LogCoshSolver`]: estimate, gradient buffer, optional scale sampler
//!
//! The engine drives them through [`MapSolver`], one call to
//! [`MapSolver::iterate`] per iteration.

mod gmrf;
mod hgmrf;
mod logcosh;
mod tv;

pub use gmrf::GmrfSolver;
pub use hgmrf::HgmrfSolver;
pub use logcosh::LogCoshSolver;
pub use tv::TvSolver;

use std::fmt;

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::lattice::Grid;
use crate::params::{ModelKind, ModelParams};

/// What the solver was doing during an iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskLabel {
    #[serde(rename = "MAP OPTIMIZATION")]
    MapOptimization,
    #[serde(rename = "PARAMETER ESTIMATION")]
    ParameterEstimation,
    #[serde(rename = "MARGINAL RELAXATION")]
    MarginalRelaxation,
    #[serde(rename = "OPTIMAL PEAK FOUND")]
    PeakFound,
    #[serde(rename = "SPLIT BREGMAN")]
    SplitBregman,
    #[serde(rename = "MCMC SAMPLING")]
    McmcSampling,
}

impl TaskLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskLabel::MapOptimization => "MAP OPTIMIZATION",
            TaskLabel::ParameterEstimation => "PARAMETER ESTIMATION",
            TaskLabel::MarginalRelaxation => "MARGINAL RELAXATION",
            TaskLabel::PeakFound => "OPTIMAL PEAK FOUND",
            TaskLabel::SplitBregman => "SPLIT BREGMAN",
            TaskLabel::McmcSampling => "MCMC SAMPLING",
        }
    }
}

impl fmt::Display for TaskLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a completed run stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopReason {
    MaxIterations,
    LikelihoodPeak,
    Converged,
}

/// Result of one solver iteration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IterationOutcome {
    /// Posterior energy after the iteration, with the coefficients in force.
    pub energy: f64,
    pub task: TaskLabel,
    /// Per-site log marginal likelihood, for models that track it.
    pub log_likelihood: Option<f64>,
    /// Set when the model's own stopping rule fires.
    pub stop: Option<StopReason>,
}

/// One iterative MAP optimizer.
pub trait MapSolver: Send {
    fn kind(&self) -> ModelKind;

    /// Run one iteration (1-based `iteration`).
    fn iterate(&mut self, iteration: usize) -> IterationOutcome;

    /// Current mean-centered estimate.
    fn estimate(&self) -> &[f64];

    /// Coefficients currently in force, including learned updates.
    fn coefficients(&self) -> ModelParams;

    /// Full likelihood trace, when the model keeps one.
    fn likelihood_trace(&self) -> Option<Vec<f64>> {
        None
    }
}

/// Build the solver for `params` over a centered observation.
///
/// `params` must already be validated.
pub fn build_solver(params: &ModelParams, grid: Grid, centered: Vec<f64>) -> Box<dyn MapSolver> {
    match params {
        ModelParams::Gmrf(p) => Box::new(GmrfSolver::new(p.clone(), grid, centered)),
        ModelParams::Hgmrf(p) => Box::new(HgmrfSolver::new(p.clone(), grid, centered)),
        ModelParams::Tv(p) => Box::new(TvSolver::new(p.clone(), grid, centered)),
        ModelParams::LogCosh(p) => {
            let rng = match p.seed {
                Some(seed) => StdRng::seed_from_u64(seed),
                None => StdRng::from_entropy(),
            };
            Box::new(LogCoshSolver::new(p.clone(), grid, centered, rng))
        }
    }
}

/// `Σ x_j` over the existing neighbours of `i`, and their count.
#[inline]
pub(crate) fn neighbor_sum(grid: &Grid, x: &[f64], i: usize) -> (f64, f64) {
    grid.neighbors(i)
        .fold((0.0, 0.0), |(sum, count), j| (sum + x[j], count + 1.0))
}
