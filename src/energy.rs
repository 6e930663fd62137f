//! Energy models over the pixel lattice.
//!
//! Every model is a site term plus an edge term:
//!
//! ```text
//! E(x) = (λ/2) Σᵢ xᵢ² + α Σ₍ᵢ,ⱼ₎ φ(xᵢ − xⱼ)
//! ```
//!
//! with the edge penalty φ selecting the model:
//!
//! | Model   | φ(d)               | φ′(d)        |
//! |---------|--------------------|--------------|
//! | GMRF    | d²/2               | d            |
//! | rTV-MRF | \|d\|              | (not used)   |
//! | LC-MRF  | ln cosh(s·d) / s   | tanh(s·d)    |
//!
//! HGMRF replaces the pairwise form with the marginalized quadratic form
//! `½ xᵗ P (P + γ²I)⁻¹ P x`, `P = λI + αL`, evaluated through a latent field
//! kept by the solver (see [`HierarchicalEnergy`]).
//!
//! [`Posterior`] adds the Gaussian data term `|y − x|² / (2σ²)`.
//!
//! All sums are deterministic (row partials summed in order).

use crate::lattice::Grid;

// ============================================================================
// Traits
// ============================================================================

/// An energy that can be evaluated on a lattice state.
pub trait Potential: Sync {
    fn potential(&self, grid: &Grid, x: &[f64]) -> f64;
}

/// An energy with a per-site gradient.
pub trait Differentiable: Potential {
    /// Write `∂E/∂xᵢ` into `out[i]` for every site.
    fn gradient(&self, grid: &Grid, x: &[f64], out: &mut [f64]);
}

/// Edge penalty φ applied to a neighbour difference.
pub trait EdgePenalty: Sync {
    fn value(&self, d: f64) -> f64;
}

/// Edge penalty with a usable derivative.
pub trait SmoothPenalty: EdgePenalty {
    fn derivative(&self, d: f64) -> f64;
}

// ============================================================================
// Edge penalties
// ============================================================================

/// φ(d) = d²/2.
#[derive(Debug, Clone, Copy, Default)]
pub struct Quadratic;

impl EdgePenalty for Quadratic {
    #[inline]
    fn value(&self, d: f64) -> f64 {
        0.5 * d * d
    }
}

impl SmoothPenalty for Quadratic {
    #[inline]
    fn derivative(&self, d: f64) -> f64 {
        d
    }
}

/// φ(d) = |d|. Only ever minimized through an auxiliary split.
#[derive(Debug, Clone, Copy, Default)]
pub struct Absolute;

impl EdgePenalty for Absolute {
    #[inline]
    fn value(&self, d: f64) -> f64 {
        d.abs()
    }
}

/// φ(d) = ln cosh(s·d) / s.
#[derive(Debug, Clone, Copy)]
pub struct LogCosh {
    pub sharpness: f64,
}

impl EdgePenalty for LogCosh {
    #[inline]
    fn value(&self, d: f64) -> f64 {
        ln_cosh(self.sharpness * d) / self.sharpness
    }
}

impl SmoothPenalty for LogCosh {
    #[inline]
    fn derivative(&self, d: f64) -> f64 {
        (self.sharpness * d).tanh()
    }
}

/// Overflow-free ln cosh(t).
#[inline]
pub fn ln_cosh(t: f64) -> f64 {
    let a = t.abs();
    a + (-2.0 * a).exp().ln_1p() - std::f64::consts::LN_2
}

/// Minimizer of `t|z| + ½(d − z)²`.
#[inline]
pub fn soft_threshold(d: f64, t: f64) -> f64 {
    if d > t {
        d - t
    } else if d < -t {
        d + t
    } else {
        0.0
    }
}

// ============================================================================
// Pairwise prior
// ============================================================================

/// `(λ/2) Σ x² + α Σ φ(xᵢ − xⱼ)`.
#[derive(Debug, Clone, Copy)]
pub struct PairwiseEnergy<P> {
    pub lambda: f64,
    pub alpha: f64,
    pub penalty: P,
}

impl<P: EdgePenalty> PairwiseEnergy<P> {
    pub fn new(lambda: f64, alpha: f64, penalty: P) -> Self {
        Self {
            lambda,
            alpha,
            penalty,
        }
    }

    /// Edge term without the α factor.
    pub fn edge_term(&self, grid: &Grid, x: &[f64]) -> f64 {
        grid.edge_sum(x, |d| self.penalty.value(d))
    }
}

impl<P: EdgePenalty> Potential for PairwiseEnergy<P> {
    fn potential(&self, grid: &Grid, x: &[f64]) -> f64 {
        let site = grid.site_sum(|i| x[i] * x[i]);
        0.5 * self.lambda * site + self.alpha * self.edge_term(grid, x)
    }
}

impl<P: SmoothPenalty> Differentiable for PairwiseEnergy<P> {
    fn gradient(&self, grid: &Grid, x: &[f64], out: &mut [f64]) {
        grid.fill(out, |i| {
            let edges: f64 = grid
                .neighbors(i)
                .map(|j| self.penalty.derivative(x[i] - x[j]))
                .sum();
            self.lambda * x[i] + self.alpha * edges
        });
    }
}

// ============================================================================
// Hierarchical prior
// ============================================================================

/// Marginalized HGMRF prior `½ xᵗ H x`, `H = P (P + γ²I)⁻¹ P`.
///
/// `latent` must hold `w ≈ (P + γ²I)⁻¹ x`; with `v = x − γ²w` this gives
/// `H x = P v` and `xᵗ H x = xᵗ P v`. The solver keeps `w` one relaxation
/// sweep behind `x`, so the value is exact only at the fixed point.
#[derive(Debug, Clone, Copy)]
pub struct HierarchicalEnergy<'a> {
    pub lambda: f64,
    pub alpha: f64,
    pub gamma_sq: f64,
    pub latent: &'a [f64],
}

impl HierarchicalEnergy<'_> {
    /// `vᵢ = xᵢ − γ² wᵢ`.
    #[inline]
    pub fn bias_removed(&self, x: &[f64], i: usize) -> f64 {
        x[i] - self.gamma_sq * self.latent[i]
    }

    /// `(P u)ᵢ = λ uᵢ + α Σⱼ (uᵢ − uⱼ)`.
    #[inline]
    pub fn apply_precision(&self, grid: &Grid, u: &[f64], i: usize) -> f64 {
        let edges: f64 = grid.neighbors(i).map(|j| u[i] - u[j]).sum();
        self.lambda * u[i] + self.alpha * edges
    }
}

impl Potential for HierarchicalEnergy<'_> {
    fn potential(&self, grid: &Grid, x: &[f64]) -> f64 {
        let v: Vec<f64> = (0..grid.len()).map(|i| self.bias_removed(x, i)).collect();
        let site = grid.site_sum(|i| x[i] * v[i]);
        0.5 * (self.lambda * site + self.alpha * grid.laplacian_form(x, &v))
    }
}

impl Differentiable for HierarchicalEnergy<'_> {
    fn gradient(&self, grid: &Grid, x: &[f64], out: &mut [f64]) {
        let v: Vec<f64> = (0..grid.len()).map(|i| self.bias_removed(x, i)).collect();
        grid.fill(out, |i| self.apply_precision(grid, &v, i));
    }
}

// ============================================================================
// Posterior
// ============================================================================

/// Gaussian likelihood `|y − x|² / (2σ²)`.
#[derive(Debug, Clone, Copy)]
pub struct DataFidelity<'a> {
    pub observed: &'a [f64],
    pub sigma_sq: f64,
}

impl Potential for DataFidelity<'_> {
    fn potential(&self, grid: &Grid, x: &[f64]) -> f64 {
        let sse = grid.site_sum(|i| {
            let r = self.observed[i] - x[i];
            r * r
        });
        sse / (2.0 * self.sigma_sq)
    }
}

impl Differentiable for DataFidelity<'_> {
    fn gradient(&self, grid: &Grid, x: &[f64], out: &mut [f64]) {
        grid.fill(out, |i| (x[i] - self.observed[i]) / self.sigma_sq);
    }
}

/// Prior plus data term: the negative log-posterior up to a constant.
#[derive(Debug, Clone, Copy)]
pub struct Posterior<'a, P> {
    pub prior: P,
    pub data: DataFidelity<'a>,
}

impl<'a, P> Posterior<'a, P> {
    pub fn new(prior: P, observed: &'a [f64], sigma_sq: f64) -> Self {
        Self {
            prior,
            data: DataFidelity { observed, sigma_sq },
        }
    }
}

impl<P: Potential> Potential for Posterior<'_, P> {
    fn potential(&self, grid: &Grid, x: &[f64]) -> f64 {
        self.prior.potential(grid, x) + self.data.potential(grid, x)
    }
}

impl<P: Differentiable> Differentiable for Posterior<'_, P> {
    fn gradient(&self, grid: &Grid, x: &[f64], out: &mut [f64]) {
        self.prior.gradient(grid, x, out);
        let observed = self.data.observed;
        let inv_var = 1.0 / self.data.sigma_sq;
        for (i, g) in out.iter_mut().enumerate() {
            *g += (x[i] - observed[i]) * inv_var;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid(w: usize, h: usize) -> Grid {
        Grid::new(w, h).unwrap()
    }

    /// Central finite difference of `energy` at site `i`.
    fn numeric_gradient<E: Potential>(energy: &E, g: &Grid, x: &[f64], i: usize) -> f64 {
        let h = 1e-5;
        let mut plus = x.to_vec();
        let mut minus = x.to_vec();
        plus[i] += h;
        minus[i] -= h;
        (energy.potential(g, &plus) - energy.potential(g, &minus)) / (2.0 * h)
    }

    fn ramp(n: usize) -> Vec<f64> {
        (0..n).map(|i| ((i * 37) % 11) as f64 * 0.3 - 1.2).collect()
    }

    #[test]
    fn test_ln_cosh_is_stable() {
        assert!((ln_cosh(0.0)).abs() < 1e-15);
        assert!((ln_cosh(1.0) - 1.0f64.cosh().ln()).abs() < 1e-12);
        // cosh(1000) overflows, ln cosh does not
        assert!((ln_cosh(1000.0) - (1000.0 - std::f64::consts::LN_2)).abs() < 1e-9);
        assert_eq!(ln_cosh(-3.0), ln_cosh(3.0));
    }

    #[test]
    fn test_soft_threshold_closed_form() {
        let t = 0.7;
        for &d in &[-3.0, -0.7, -0.2, 0.0, 0.5, 0.7, 2.5] {
            let z = soft_threshold(d, t);
            let objective = |z: f64| t * z.abs() + 0.5 * (d - z) * (d - z);
            // No nearby point does better
            for k in -50..=50 {
                let nearby = z + k as f64 * 1e-3;
                assert!(objective(z) <= objective(nearby) + 1e-12);
            }
        }
        assert_eq!(soft_threshold(0.5, 0.7), 0.0);
        assert!((soft_threshold(2.5, 0.7) - 1.8).abs() < 1e-12);
        assert!((soft_threshold(-3.0, 0.7) + 2.3).abs() < 1e-12);
    }

    #[test]
    fn test_quadratic_gradient_matches_finite_difference() {
        let g = grid(4, 3);
        let x = ramp(g.len());
        let energy = PairwiseEnergy::new(0.3, 1.7, Quadratic);
        let mut grad = vec![0.0; g.len()];
        energy.gradient(&g, &x, &mut grad);
        for i in 0..g.len() {
            assert!((grad[i] - numeric_gradient(&energy, &g, &x, i)).abs() < 1e-6);
        }
    }

    #[test]
    fn test_log_cosh_gradient_matches_finite_difference() {
        let g = grid(3, 4);
        let x = ramp(g.len());
        let energy = PairwiseEnergy::new(0.1, 0.4, LogCosh { sharpness: 2.0 });
        let mut grad = vec![0.0; g.len()];
        energy.gradient(&g, &x, &mut grad);
        for i in 0..g.len() {
            assert!((grad[i] - numeric_gradient(&energy, &g, &x, i)).abs() < 1e-6);
        }
    }

    #[test]
    fn test_log_cosh_approaches_absolute_for_large_sharpness() {
        let sharp = LogCosh { sharpness: 200.0 };
        assert!((sharp.value(1.5) - 1.5).abs() < 0.01);
        assert!((sharp.derivative(1.5) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_hierarchical_reduces_to_precision_when_gamma_vanishes() {
        let g = grid(3, 3);
        let x = ramp(g.len());
        let latent = vec![0.0; g.len()];
        let hier = HierarchicalEnergy {
            lambda: 0.5,
            alpha: 2.0,
            gamma_sq: 1e-3,
            latent: &latent,
        };
        let pairwise = PairwiseEnergy::new(0.5, 2.0, Quadratic);
        // With w = 0 the form is ½ xᵗ P x
        assert!((hier.potential(&g, &x) - pairwise.potential(&g, &x)).abs() < 1e-12);

        let mut a = vec![0.0; g.len()];
        let mut b = vec![0.0; g.len()];
        hier.gradient(&g, &x, &mut a);
        pairwise.gradient(&g, &x, &mut b);
        for (u, v) in a.iter().zip(&b) {
            assert!((u - v).abs() < 1e-12);
        }
    }

    #[test]
    fn test_posterior_gradient_adds_data_term() {
        let g = grid(2, 2);
        let x = vec![1.0, 2.0, 3.0, 4.0];
        let y = vec![0.0; 4];
        let posterior = Posterior::new(PairwiseEnergy::new(1.0, 0.5, Quadratic), &y, 2.0);
        let mut grad = vec![0.0; 4];
        posterior.gradient(&g, &x, &mut grad);
        for i in 0..4 {
            assert!((grad[i] - numeric_gradient(&posterior, &g, &x, i)).abs() < 1e-6);
        }
        let data = DataFidelity {
            observed: &y,
            sigma_sq: 2.0,
        };
        assert!((data.potential(&g, &x) - 30.0 / 4.0).abs() < 1e-12);
    }

    #[test]
    fn test_absolute_potential() {
        let g = grid(3, 1);
        let x = vec![0.0, 2.0, -1.0];
        let tv = PairwiseEnergy::new(2.0, 0.5, Absolute);
        // ½·2·(0 + 4 + 1) + 0.5·(2 + 3)
        assert!((tv.potential(&g, &x) - 7.5).abs() < 1e-12);
    }
}
