//! Online hyperparameter learning.
//!
//! After each solver iteration the eligible coefficients take one
//! gradient-ascent step on the (per-site) log marginal likelihood:
//!
//! ```text
//! θ ← θ + η · ∂(log L / n)/∂θ
//! ```
//!
//! An update that would leave a coefficient non-positive or non-finite is
//! skipped for that iteration.
//!
//! ## Gaussian models (GMRF, HGMRF)
//!
//! The prior precision `H` is diagonal in the DCT basis of the free-boundary
//! Laplacian. With `pₖ = λ + αφₖ` its eigenvalues are `hₖ = pₖ` (GMRF) or
//! `hₖ = pₖ² / (pₖ + γ²)` (HGMRF), so every trace term is a sum over the
//! spectrum and only the quadratic terms need the lattice state.
//!
//! ## LC-MRF
//!
//! Gradients are differences of prior and posterior expectations estimated
//! by the scale sampler (see [`crate::sampler`]).

use std::collections::VecDeque;

use log::warn;

use crate::lattice::Grid;
use crate::sampler::SampleMoments;

// ============================================================================
// Gradient ascent step
// ============================================================================

/// One guarded ascent step. Returns the unchanged value when the step is
/// not usable.
pub fn apply_ascent(field: &str, value: f64, rate: f64, gradient: f64) -> f64 {
    if rate == 0.0 {
        return value;
    }
    let next = value + rate * gradient;
    if !next.is_finite() || next <= 0.0 {
        warn!(
            "skipping {field} update: {value} + {rate} * {gradient} = {next} is not a valid coefficient"
        );
        return value;
    }
    next
}

// ============================================================================
// Spectral marginal likelihood (GMRF / HGMRF)
// ============================================================================

/// Coefficients of a Gaussian model. `gamma_sq == 0` selects plain GMRF.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GaussianCoefficients {
    pub lambda: f64,
    pub alpha: f64,
    pub sigma_sq: f64,
    pub gamma_sq: f64,
}

/// `∂(log L / n)` with respect to each coefficient.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LikelihoodGradient {
    pub lambda: f64,
    pub alpha: f64,
    pub gamma_sq: f64,
}

/// Prior eigenvalue `h` with `dh/dp` and `dh/dγ²`.
#[inline]
fn prior_eigen(p: f64, gamma_sq: f64) -> (f64, f64, f64) {
    if gamma_sq == 0.0 {
        return (p, 1.0, 0.0);
    }
    let q = p + gamma_sq;
    let h = p * p / q;
    let dh_dp = 1.0 - gamma_sq * gamma_sq / (q * q);
    let dh_dg = -(p * p) / (q * q);
    (h, dh_dp, dh_dg)
}

/// Spectral learner over a fixed grid.
#[derive(Debug, Clone)]
pub struct SpectralLearner {
    grid: Grid,
    spectrum: Vec<f64>,
}

impl SpectralLearner {
    pub fn new(grid: Grid) -> Self {
        Self {
            grid,
            spectrum: grid.laplacian_spectrum(),
        }
    }

    /// Likelihood gradients at posterior mean `estimate`.
    ///
    /// `latent` is `w = (P + γ²I)⁻¹ estimate` for HGMRF and ignored for GMRF.
    pub fn gradients(
        &self,
        coeffs: &GaussianCoefficients,
        estimate: &[f64],
        latent: Option<&[f64]>,
    ) -> LikelihoodGradient {
        let n = self.grid.len() as f64;
        let inv_var = 1.0 / coeffs.sigma_sq;

        // ½ Σₖ ∂hₖ · σ⁻² / (hₖ (hₖ + σ⁻²))
        let (mut trace_l, mut trace_a, mut trace_g) = (0.0, 0.0, 0.0);
        for &phi in &self.spectrum {
            let p = coeffs.lambda + coeffs.alpha * phi;
            let (h, dh_dp, dh_dg) = prior_eigen(p, coeffs.gamma_sq);
            let weight = inv_var / (h * (h + inv_var));
            trace_l += dh_dp * weight;
            trace_a += dh_dp * phi * weight;
            trace_g += dh_dg * weight;
        }

        let g = &self.grid;
        let m = estimate;
        let m_sq = g.site_sum(|i| m[i] * m[i]);
        let m_edge = g.laplacian_form(m, m);

        let (w_sq, w_edge, bias_free_sq) = match latent {
            Some(w) if coeffs.gamma_sq > 0.0 => {
                let gamma_sq = coeffs.gamma_sq;
                (
                    g.site_sum(|i| w[i] * w[i]),
                    g.laplacian_form(w, w),
                    g.site_sum(|i| {
                        let v = m[i] - gamma_sq * w[i];
                        v * v
                    }),
                )
            }
            _ => (0.0, 0.0, 0.0),
        };
        let gamma_4 = coeffs.gamma_sq * coeffs.gamma_sq;

        LikelihoodGradient {
            lambda: 0.5 * (trace_l - (m_sq - gamma_4 * w_sq)) / n,
            alpha: 0.5 * (trace_a - (m_edge - gamma_4 * w_edge)) / n,
            gamma_sq: 0.5 * (trace_g + bias_free_sq) / n,
        }
    }

    /// EM re-estimate of the noise variance:
    /// `(|y − m|² + Σₖ 1/(hₖ + σ⁻²)) / n`.
    pub fn sigma_sq_update(&self, coeffs: &GaussianCoefficients, estimate: &[f64], observed: &[f64]) -> f64 {
        let n = self.grid.len() as f64;
        let inv_var = 1.0 / coeffs.sigma_sq;
        let residual = self.grid.site_sum(|i| {
            let r = observed[i] - estimate[i];
            r * r
        });
        let posterior_trace: f64 = self
            .spectrum
            .iter()
            .map(|&phi| {
                let (h, _, _) = prior_eigen(coeffs.lambda + coeffs.alpha * phi, coeffs.gamma_sq);
                1.0 / (h + inv_var)
            })
            .sum();
        (residual + posterior_trace) / n
    }

    /// Per-site log marginal likelihood.
    ///
    /// `prior_energy` is `½ mᵗHm` and `residual_sq` is `|y − m|²` at the
    /// posterior mean `m`.
    pub fn log_likelihood(&self, coeffs: &GaussianCoefficients, prior_energy: f64, residual_sq: f64) -> f64 {
        let n = self.grid.len() as f64;
        let inv_var = 1.0 / coeffs.sigma_sq;
        let log_det: f64 = self
            .spectrum
            .iter()
            .map(|&phi| {
                let (h, _, _) = prior_eigen(coeffs.lambda + coeffs.alpha * phi, coeffs.gamma_sq);
                h.ln() - (h + inv_var).ln()
            })
            .sum();
        (0.5 * log_det - prior_energy - residual_sq / (2.0 * coeffs.sigma_sq)) / n
            - 0.5 * (2.0 * std::f64::consts::PI * coeffs.sigma_sq).ln()
    }
}

// ============================================================================
// Sampled gradients (LC-MRF)
// ============================================================================

/// `∂(log L / n)` for the LC-MRF coefficients.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SampledGradient {
    pub lambda: f64,
    pub alpha: f64,
    pub sigma_sq: f64,
}

/// Gradients from prior and posterior sample moments on `n` sites.
pub fn sampled_gradient(prior: &SampleMoments, posterior: &SampleMoments, sigma_sq: f64, n: usize) -> SampledGradient {
    let n = n as f64;
    let grad = SampledGradient {
        lambda: (prior.square_norm - posterior.square_norm) / (2.0 * n),
        alpha: (prior.edge_penalty - posterior.edge_penalty) / n,
        sigma_sq: posterior.residual / (2.0 * sigma_sq * sigma_sq * n) - 1.0 / (2.0 * sigma_sq),
    };
    // A diverged chain contributes nothing this iteration
    let finite_or_zero = |v: f64| if v.is_finite() { v } else { 0.0 };
    SampledGradient {
        lambda: finite_or_zero(grad.lambda),
        alpha: finite_or_zero(grad.alpha),
        sigma_sq: finite_or_zero(grad.sigma_sq),
    }
}

// ============================================================================
// Likelihood peak detection (HGMRF)
// ============================================================================

/// Window length of the likelihood moving average.
pub const PEAK_WINDOW: usize = 7;

/// Moving-average peak detector over a likelihood trace.
///
/// Once the window is full, each new value yields a moving average. A peak
/// is reported the first time the average decreases after having increased
/// at least once.
#[derive(Debug, Clone)]
pub struct PeakDetector {
    window: usize,
    recent: VecDeque<f64>,
    previous_average: Option<f64>,
    has_risen: bool,
}

impl Default for PeakDetector {
    fn default() -> Self {
        Self::new(PEAK_WINDOW)
    }
}

impl PeakDetector {
    pub fn new(window: usize) -> Self {
        let window = window.max(1);
        Self {
            window,
            recent: VecDeque::with_capacity(window),
            previous_average: None,
            has_risen: false,
        }
    }

    /// Feed one likelihood value; returns `true` when the peak is passed.
    pub fn push(&mut self, value: f64) -> bool {
        if self.recent.len() == self.window {
            self.recent.pop_front();
        }
        self.recent.push_back(value);
        if self.recent.len() < self.window {
            return false;
        }

        let average = self.recent.iter().sum::<f64>() / self.window as f64;
        let peaked = match self.previous_average {
            Some(prev) if average > prev => {
                self.has_risen = true;
                false
            }
            Some(prev) => average < prev && self.has_risen,
            None => false,
        };
        self.previous_average = Some(average);
        peaked
    }

    /// Latest moving average, once the window has filled.
    pub fn average(&self) -> Option<f64> {
        self.previous_average
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn first_peak(trace: &[f64]) -> Option<usize> {
        let mut detector = PeakDetector::default();
        trace.iter().position(|&v| detector.push(v))
    }

    #[test]
    fn test_peak_detector_rise_then_fall() {
        let trace: Vec<f64> = (0..30)
            .map(|i| {
                let t = i as f64;
                -(t - 15.0) * (t - 15.0)
            })
            .collect();
        let peak = first_peak(&trace).expect("peak");
        // Average of a centered window peaks at index 15 + 3
        assert!(peak > 15 && peak <= 20, "peak at {peak}");
    }

    #[test]
    fn test_peak_detector_monotonic_never_fires() {
        let rising: Vec<f64> = (0..40).map(|i| i as f64).collect();
        assert_eq!(first_peak(&rising), None);
        let falling: Vec<f64> = (0..40).map(|i| -(i as f64)).collect();
        assert_eq!(first_peak(&falling), None);
        assert_eq!(first_peak(&[3.0; 20]), None);
    }

    #[test]
    fn test_peak_detector_needs_full_window() {
        let mut detector = PeakDetector::default();
        for v in [1.0, 2.0, 3.0, 2.0, 1.0, 0.0] {
            assert!(!detector.push(v));
        }
        assert_eq!(detector.average(), None);
    }

    #[test]
    fn test_peak_detector_smooths_single_dip() {
        // One low sample inside a steady climb does not end the run
        let mut trace: Vec<f64> = (0..20).map(|i| i as f64).collect();
        trace[12] = 10.5;
        assert_eq!(first_peak(&trace), None);
    }

    #[test]
    fn test_apply_ascent_skips_invalid() {
        assert_eq!(apply_ascent("lambda", 1.0, 0.5, 2.0), 2.0);
        assert_eq!(apply_ascent("lambda", 1.0, 0.5, -4.0), 1.0);
        assert_eq!(apply_ascent("alpha", 1.0, 1.0, f64::NAN), 1.0);
        assert_eq!(apply_ascent("alpha", 1.0, 0.0, 100.0), 1.0);
    }

    #[test]
    fn test_gmrf_gradient_matches_finite_difference() {
        let grid = Grid::new(6, 5).unwrap();
        let learner = SpectralLearner::new(grid);
        let coeffs = GaussianCoefficients {
            lambda: 0.05,
            alpha: 0.3,
            sigma_sq: 2.0,
            gamma_sq: 0.0,
        };
        let m: Vec<f64> = (0..grid.len()).map(|i| ((i * 7) % 5) as f64 - 2.0).collect();

        // At fixed m the ½ mᵗHm term is explicit, so the λ-derivative of the
        // trace part can be checked against the log-determinant.
        let grad = learner.gradients(&coeffs, &m, None);
        let log_det = |lambda: f64| {
            let c = GaussianCoefficients { lambda, ..coeffs };
            learner.log_likelihood(&c, 0.0, 0.0)
        };
        let h = 1e-6;
        let numeric = (log_det(coeffs.lambda + h) - log_det(coeffs.lambda - h)) / (2.0 * h);
        let m_sq: f64 = m.iter().map(|v| v * v).sum();
        let analytic = grad.lambda + 0.5 * m_sq / grid.len() as f64;
        assert!((numeric - analytic).abs() < 1e-6, "{numeric} vs {analytic}");
    }

    #[test]
    fn test_hgmrf_gamma_gradient_matches_finite_difference() {
        let grid = Grid::new(4, 4).unwrap();
        let learner = SpectralLearner::new(grid);
        let coeffs = GaussianCoefficients {
            lambda: 0.2,
            alpha: 0.5,
            sigma_sq: 1.5,
            gamma_sq: 0.3,
        };
        let zeros = vec![0.0; grid.len()];
        // With m = 0 only the trace term remains
        let grad = learner.gradients(&coeffs, &zeros, Some(&zeros));
        let ll = |gamma_sq: f64| {
            let c = GaussianCoefficients { gamma_sq, ..coeffs };
            learner.log_likelihood(&c, 0.0, 0.0)
        };
        let h = 1e-6;
        let numeric = (ll(coeffs.gamma_sq + h) - ll(coeffs.gamma_sq - h)) / (2.0 * h);
        assert!((numeric - grad.gamma_sq).abs() < 1e-6, "{numeric} vs {}", grad.gamma_sq);
    }

    #[test]
    fn test_sigma_update_positive() {
        let grid = Grid::new(5, 5).unwrap();
        let learner = SpectralLearner::new(grid);
        let coeffs = GaussianCoefficients {
            lambda: 1e-3,
            alpha: 0.1,
            sigma_sq: 10.0,
            gamma_sq: 0.0,
        };
        let y: Vec<f64> = (0..25).map(|i| (i % 4) as f64).collect();
        let m = vec![1.5; 25];
        let next = learner.sigma_sq_update(&coeffs, &m, &y);
        assert!(next.is_finite() && next > 0.0);
    }

    #[test]
    fn test_sampled_gradient_signs() {
        let prior = SampleMoments {
            square_norm: 10.0,
            edge_penalty: 4.0,
            residual: 0.0,
        };
        let posterior = SampleMoments {
            square_norm: 6.0,
            edge_penalty: 5.0,
            residual: 40.0,
        };
        let grad = sampled_gradient(&prior, &posterior, 2.0, 10);
        assert!((grad.lambda - 0.2).abs() < 1e-12);
        assert!((grad.alpha + 0.1).abs() < 1e-12);
        // 40 / (2·4·10) − 1/4
        assert!((grad.sigma_sq - 0.25).abs() < 1e-12);
    }
}
