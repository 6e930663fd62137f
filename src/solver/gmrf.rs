//! Gaussian MRF: direct red-black relaxation of the MAP normal equations.
//!
//! Each iteration is one sweep of
//!
//! ```text
//! xᵢ ← (yᵢ/σ² + α Σⱼ xⱼ) / (λ + 1/σ² + α·deg(i))
//! ```
//!
//! i.e. one Gauss-Seidel pass on `(λI + αL + σ⁻²I) x = σ⁻² y`, followed by
//! an optional learning step on λ, α and σ².

use log::debug;

use crate::energy::{PairwiseEnergy, Posterior, Potential, Quadratic};
use crate::lattice::Grid;
use crate::learner::{apply_ascent, GaussianCoefficients, SpectralLearner};
use crate::params::{GmrfParams, ModelKind, ModelParams};

use super::{neighbor_sum, IterationOutcome, MapSolver, TaskLabel};

pub struct GmrfSolver {
    params: GmrfParams,
    grid: Grid,
    observed: Vec<f64>,
    x: Vec<f64>,
    scratch: Vec<f64>,
    learner: Option<SpectralLearner>,
}

impl GmrfSolver {
    pub fn new(params: GmrfParams, grid: Grid, centered: Vec<f64>) -> Self {
        let learner = params.is_learning.then(|| SpectralLearner::new(grid));
        Self {
            x: centered.clone(),
            scratch: Vec::with_capacity(centered.len()),
            observed: centered,
            params,
            grid,
            learner,
        }
    }

    fn relax(&mut self) {
        let (lambda, alpha) = (self.params.lambda, self.params.alpha);
        let inv_var = 1.0 / self.params.sigma_sq;
        let grid = self.grid;
        let y = &self.observed;
        grid.red_black_sweep(&mut self.x, &mut self.scratch, |i, src| {
            let (sum, degree) = neighbor_sum(&grid, src, i);
            (y[i] * inv_var + alpha * sum) / (lambda + inv_var + alpha * degree)
        });
    }

    fn learn(&mut self) {
        let Some(learner) = &self.learner else {
            return;
        };
        let coeffs = GaussianCoefficients {
            lambda: self.params.lambda,
            alpha: self.params.alpha,
            sigma_sq: self.params.sigma_sq,
            gamma_sq: 0.0,
        };
        let grad = learner.gradients(&coeffs, &self.x, None);
        let sigma_sq = learner.sigma_sq_update(&coeffs, &self.x, &self.observed);

        self.params.lambda = apply_ascent("lambda", coeffs.lambda, self.params.eta_lambda, grad.lambda);
        self.params.alpha = apply_ascent("alpha", coeffs.alpha, self.params.eta_alpha, grad.alpha);
        if sigma_sq.is_finite() && sigma_sq > 0.0 {
            self.params.sigma_sq = sigma_sq;
        }
        debug!(
            "GMRF learned lambda={:.3e} alpha={:.3e} sigma_sq={:.3}",
            self.params.lambda, self.params.alpha, self.params.sigma_sq
        );
    }
}

impl MapSolver for GmrfSolver {
    fn kind(&self) -> ModelKind {
        ModelKind::Gmrf
    }

    fn iterate(&mut self, _iteration: usize) -> IterationOutcome {
        self.relax();
        self.learn();

        let prior = PairwiseEnergy::new(self.params.lambda, self.params.alpha, Quadratic);
        let energy = Posterior::new(prior, &self.observed, self.params.sigma_sq).potential(&self.grid, &self.x);
        IterationOutcome {
            energy,
            task: if self.learner.is_some() {
                TaskLabel::ParameterEstimation
            } else {
                TaskLabel::MapOptimization
            },
            log_likelihood: None,
            stop: None,
        }
    }

    fn estimate(&self) -> &[f64] {
        &self.x
    }

    fn coefficients(&self) -> ModelParams {
        ModelParams::Gmrf(self.params.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(lambda: f64, alpha: f64, sigma_sq: f64) -> GmrfParams {
        GmrfParams {
            lambda,
            alpha,
            sigma_sq,
            max_iter: 100,
            eta_lambda: 0.0,
            eta_alpha: 0.0,
            is_learning: false,
            tolerance: None,
        }
    }

    #[test]
    fn test_gmrf_energy_decreases() {
        let grid = Grid::new(8, 8).unwrap();
        let y: Vec<f64> = (0..64).map(|i| if (i * 13) % 7 < 3 { 20.0 } else { -15.0 }).collect();
        let mut solver = GmrfSolver::new(params(1e-3, 0.5, 4.0), grid, y);
        let mut last = f64::INFINITY;
        for it in 1..=10 {
            let out = solver.iterate(it);
            assert!(out.energy <= last + 1e-9);
            assert_eq!(out.task, TaskLabel::MapOptimization);
            last = out.energy;
        }
    }

    #[test]
    fn test_gmrf_converges_to_normal_equations() {
        let grid = Grid::new(5, 4).unwrap();
        let y: Vec<f64> = (0..20).map(|i| ((i * 5) % 9) as f64 - 4.0).collect();
        let p = params(0.1, 0.7, 2.0);
        let mut solver = GmrfSolver::new(p.clone(), grid, y.clone());
        for it in 1..=300 {
            solver.iterate(it);
        }
        let x = solver.estimate();
        let inv_var = 1.0 / p.sigma_sq;
        for i in 0..grid.len() {
            let lap: f64 = grid.neighbors(i).map(|j| x[i] - x[j]).sum();
            let residual = (p.lambda + inv_var) * x[i] + p.alpha * lap - inv_var * y[i];
            assert!(residual.abs() < 1e-9, "site {i} residual {residual}");
        }
    }

    #[test]
    fn test_gmrf_learning_keeps_coefficients_positive() {
        let grid = Grid::new(16, 16).unwrap();
        let y: Vec<f64> = (0..256).map(|i| ((i * 31) % 17) as f64 * 4.0 - 32.0).collect();
        let mut p = GmrfParams::default();
        p.is_learning = true;
        let mut solver = GmrfSolver::new(p, grid, y);
        for it in 1..=5 {
            let out = solver.iterate(it);
            assert_eq!(out.task, TaskLabel::ParameterEstimation);
            assert!(out.energy.is_finite());
        }
        match solver.coefficients() {
            ModelParams::Gmrf(learned) => {
                assert!(learned.lambda > 0.0 && learned.alpha > 0.0 && learned.sigma_sq > 0.0);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
