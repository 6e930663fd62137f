//! Image quality metrics: PSNR, windowed SSIM and the SSIM heatmap.
//!
//! ## SSIM
//!
//! Local statistics use a separable Gaussian window (11 taps, σ = 1.5) with
//! clamp-to-edge borders, and the stabilising constants
//! `C1 = (K1·L)²`, `C2 = (K2·L)²` with `K1 = 0.01`, `K2 = 0.03`, `L = 255`.
//! The scalar SSIM is the mean of the per-pixel map.
//!
//! [`QualityMetrics`] caches the blurred reference statistics so a run only
//! blurs the estimate-dependent terms each iteration.
//!
//! ## Heatmap
//!
//! Each map value is clamped to [0, 1] and mapped to
//! `RGBA = (255·(1 − v), 0, 255·v, 255)`: red where structure is lost,
//! blue where it is preserved.

use ndarray::Array2;
use rayon::prelude::*;

use crate::lattice::Grid;

/// PSNR reported when the two buffers are identical (and the upper clamp).
pub const PSNR_CEILING: f64 = 100.0;

const MAX_INTENSITY: f64 = 255.0;

/// Peak signal-to-noise ratio in dB for 8-bit intensities.
///
/// Returns [`PSNR_CEILING`] when the mean squared error vanishes.
pub fn psnr(reference: &[f64], estimate: &[f64]) -> f64 {
    let n = reference.len().min(estimate.len());
    if n == 0 {
        return PSNR_CEILING;
    }
    let sse: f64 = reference
        .iter()
        .zip(estimate)
        .map(|(a, b)| (a - b) * (a - b))
        .sum();
    let mse = sse / n as f64;
    if mse < 1e-10 {
        return PSNR_CEILING;
    }
    (10.0 * (MAX_INTENSITY * MAX_INTENSITY / mse).log10()).min(PSNR_CEILING)
}

// ============================================================================
// SSIM configuration
// ============================================================================

/// Window and constants for SSIM.
#[derive(Debug, Clone, PartialEq)]
pub struct SsimConfig {
    /// Window length in taps (odd).
    pub window: usize,
    /// Standard deviation of the Gaussian window.
    pub sigma: f64,
    pub k1: f64,
    pub k2: f64,
    /// Dynamic range of the intensities.
    pub dynamic_range: f64,
}

impl Default for SsimConfig {
    fn default() -> Self {
        Self {
            window: 11,
            sigma: 1.5,
            k1: 0.01,
            k2: 0.03,
            dynamic_range: MAX_INTENSITY,
        }
    }
}

impl SsimConfig {
    pub fn c1(&self) -> f64 {
        (self.k1 * self.dynamic_range).powi(2)
    }

    pub fn c2(&self) -> f64 {
        (self.k2 * self.dynamic_range).powi(2)
    }

    /// Normalized 1D Gaussian window.
    pub fn kernel(&self) -> Vec<f64> {
        let size = self.window.max(1) | 1;
        let half = (size / 2) as f64;
        let mut kernel: Vec<f64> = (0..size)
            .map(|i| {
                let x = i as f64 - half;
                (-x * x / (2.0 * self.sigma * self.sigma)).exp()
            })
            .collect();

        let sum: f64 = kernel.iter().sum();
        for v in kernel.iter_mut() {
            *v /= sum;
        }
        kernel
    }
}

/// Separable blur with clamp-to-edge borders.
fn blur(grid: &Grid, kernel: &[f64], src: &[f64]) -> Vec<f64> {
    let (width, height) = (grid.width(), grid.height());
    let half = (kernel.len() / 2) as isize;
    let mut temp = vec![0.0; src.len()];
    let mut out = vec![0.0; src.len()];

    // Horizontal pass
    temp.par_chunks_mut(width)
        .enumerate()
        .for_each(|(y, row)| {
            let line = &src[y * width..(y + 1) * width];
            for (x, slot) in row.iter_mut().enumerate() {
                let mut sum = 0.0;
                for (ki, &kv) in kernel.iter().enumerate() {
                    let sx = (x as isize + ki as isize - half).clamp(0, width as isize - 1) as usize;
                    sum += line[sx] * kv;
                }
                *slot = sum;
            }
        });

    // Vertical pass
    out.par_chunks_mut(width)
        .enumerate()
        .for_each(|(y, row)| {
            for (x, slot) in row.iter_mut().enumerate() {
                let mut sum = 0.0;
                for (ki, &kv) in kernel.iter().enumerate() {
                    let sy = (y as isize + ki as isize - half).clamp(0, height as isize - 1) as usize;
                    sum += temp[sy * width + x] * kv;
                }
                *slot = sum;
            }
        });

    out
}

// ============================================================================
// Cached metrics against a fixed reference
// ============================================================================

/// PSNR and SSIM against one reference, with the reference statistics cached.
#[derive(Debug, Clone)]
pub struct QualityMetrics {
    grid: Grid,
    config: SsimConfig,
    kernel: Vec<f64>,
    reference: Vec<f64>,
    mu_ref: Vec<f64>,
    var_ref: Vec<f64>,
}

/// Scalar SSIM and its per-pixel map.
#[derive(Debug, Clone)]
pub struct SsimReport {
    pub mean: f64,
    pub map: Array2<f64>,
}

impl QualityMetrics {
    pub fn new(grid: Grid, reference: &[f64]) -> Self {
        Self::with_config(grid, reference, SsimConfig::default())
    }

    pub fn with_config(grid: Grid, reference: &[f64], config: SsimConfig) -> Self {
        let kernel = config.kernel();
        let mu_ref = blur(&grid, &kernel, reference);
        let sq: Vec<f64> = reference.iter().map(|v| v * v).collect();
        let var_ref: Vec<f64> = blur(&grid, &kernel, &sq)
            .iter()
            .zip(&mu_ref)
            .map(|(e2, mu)| e2 - mu * mu)
            .collect();
        Self {
            grid,
            config,
            kernel,
            reference: reference.to_vec(),
            mu_ref,
            var_ref,
        }
    }

    pub fn psnr(&self, estimate: &[f64]) -> f64 {
        psnr(&self.reference, estimate)
    }

    /// Per-pixel SSIM values in row-major order.
    pub fn ssim_values(&self, estimate: &[f64]) -> Vec<f64> {
        let (c1, c2) = (self.config.c1(), self.config.c2());
        let mu_est = blur(&self.grid, &self.kernel, estimate);
        let sq: Vec<f64> = estimate.iter().map(|v| v * v).collect();
        let cross: Vec<f64> = self
            .reference
            .iter()
            .zip(estimate)
            .map(|(a, b)| a * b)
            .collect();
        let e_sq = blur(&self.grid, &self.kernel, &sq);
        let e_cross = blur(&self.grid, &self.kernel, &cross);

        (0..self.grid.len())
            .into_par_iter()
            .map(|i| {
                let (mx, my) = (self.mu_ref[i], mu_est[i]);
                let vx = self.var_ref[i];
                let vy = e_sq[i] - my * my;
                let cov = e_cross[i] - mx * my;
                ((2.0 * mx * my + c1) * (2.0 * cov + c2))
                    / ((mx * mx + my * my + c1) * (vx + vy + c2))
            })
            .collect()
    }

    /// Mean SSIM only.
    pub fn ssim_mean(&self, estimate: &[f64]) -> f64 {
        let values = self.ssim_values(estimate);
        self.grid.site_sum(|i| values[i]) / self.grid.len() as f64
    }

    /// Mean SSIM and the per-pixel map.
    pub fn ssim(&self, estimate: &[f64]) -> SsimReport {
        let values = self.ssim_values(estimate);
        let mean = self.grid.site_sum(|i| values[i]) / self.grid.len() as f64;
        let width = self.grid.width();
        // `values` has one entry per grid site by construction
        let map = Array2::from_shape_fn((self.grid.height(), width), |(row, col)| values[row * width + col]);
        SsimReport { mean, map }
    }

    /// SSIM heatmap of `estimate` as RGBA bytes.
    pub fn heatmap(&self, estimate: &[f64]) -> Vec<u8> {
        heatmap_rgba(&self.ssim(estimate).map)
    }
}

/// One-shot SSIM of `estimate` against `reference`.
pub fn ssim(grid: Grid, reference: &[f64], estimate: &[f64]) -> SsimReport {
    QualityMetrics::new(grid, reference).ssim(estimate)
}

/// Rasterize an SSIM map to RGBA (red = low, blue = high).
pub fn heatmap_rgba(map: &Array2<f64>) -> Vec<u8> {
    let mut rgba = Vec::with_capacity(map.len() * 4);
    for &value in map.iter() {
        let v = if value.is_nan() { 0.0 } else { value.clamp(0.0, 1.0) };
        rgba.push((255.0 * (1.0 - v)).round() as u8);
        rgba.push(0);
        rgba.push((255.0 * v).round() as u8);
        rgba.push(255);
    }
    rgba
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noisy(n: usize, amp: f64) -> (Vec<f64>, Vec<f64>) {
        let reference: Vec<f64> = (0..n).map(|i| (i % 17) as f64 * 12.0 + 20.0).collect();
        let estimate: Vec<f64> = reference
            .iter()
            .enumerate()
            .map(|(i, v)| v + if i % 3 == 0 { amp } else { -amp * 0.5 })
            .collect();
        (reference, estimate)
    }

    #[test]
    fn test_psnr_ceiling_on_identical() {
        let a = vec![10.0, 20.0, 30.0];
        assert_eq!(psnr(&a, &a), PSNR_CEILING);
    }

    #[test]
    fn test_psnr_known_value() {
        let a = vec![0.0; 4];
        let b = vec![255.0; 4];
        assert!(psnr(&a, &b).abs() < 1e-12);
        // MSE = 1
        let c = vec![1.0; 4];
        assert!((psnr(&a, &c) - 20.0 * 255.0f64.log10()).abs() < 1e-9);
    }

    #[test]
    fn test_kernel_normalized_and_symmetric() {
        let kernel = SsimConfig::default().kernel();
        assert_eq!(kernel.len(), 11);
        assert!((kernel.iter().sum::<f64>() - 1.0).abs() < 1e-12);
        assert_eq!(kernel[0], kernel[10]);
        assert!(kernel[5] > kernel[4]);
    }

    #[test]
    fn test_ssim_identical_is_one() {
        let grid = Grid::new(16, 12).unwrap();
        let (reference, _) = noisy(grid.len(), 0.0);
        let report = ssim(grid, &reference, &reference);
        assert!((report.mean - 1.0).abs() < 1e-12);
        assert!(report.map.iter().all(|v| (v - 1.0).abs() < 1e-12));
        assert_eq!(report.map.dim(), (12, 16));
    }

    #[test]
    fn test_ssim_constant_images_is_one() {
        let grid = Grid::new(32, 32).unwrap();
        let flat = vec![128.0; grid.len()];
        let metrics = QualityMetrics::new(grid, &flat);
        assert!((metrics.ssim_mean(&flat) - 1.0).abs() < 1e-12);
        assert_eq!(metrics.psnr(&flat), PSNR_CEILING);
    }

    #[test]
    fn test_ssim_drops_with_noise() {
        let grid = Grid::new(20, 20).unwrap();
        let (reference, mild) = noisy(grid.len(), 5.0);
        let (_, heavy) = noisy(grid.len(), 40.0);
        let metrics = QualityMetrics::new(grid, &reference);
        let s_mild = metrics.ssim_mean(&mild);
        let s_heavy = metrics.ssim_mean(&heavy);
        assert!(s_mild < 1.0);
        assert!(s_heavy < s_mild);
    }

    #[test]
    fn test_ssim_map_is_row_major() {
        let grid = Grid::new(9, 5).unwrap();
        let (reference, estimate) = noisy(grid.len(), 25.0);
        let metrics = QualityMetrics::new(grid, &reference);
        let values = metrics.ssim_values(&estimate);
        let report = metrics.ssim(&estimate);

        assert_eq!(report.map.dim(), (5, 9));
        for row in 0..5 {
            for col in 0..9 {
                assert_eq!(report.map[[row, col]], values[row * 9 + col]);
            }
        }
        assert_eq!(report.mean, metrics.ssim_mean(&estimate));
        // A real map, not a zero fallback
        assert!(report.map.iter().any(|&v| v > 0.0));
    }

    #[test]
    fn test_metrics_are_pure() {
        let grid = Grid::new(24, 10).unwrap();
        let (reference, estimate) = noisy(grid.len(), 9.0);
        let metrics = QualityMetrics::new(grid, &reference);
        assert_eq!(metrics.psnr(&estimate), metrics.psnr(&estimate));
        assert_eq!(metrics.ssim_mean(&estimate), metrics.ssim_mean(&estimate));
        assert_eq!(
            metrics.ssim(&estimate).mean,
            ssim(grid, &reference, &estimate).mean
        );
    }

    #[test]
    fn test_heatmap_palette() {
        let map = Array2::from_shape_vec((1, 3), vec![0.0, 1.0, -0.4]).unwrap();
        let rgba = heatmap_rgba(&map);
        assert_eq!(rgba.len(), 12);
        assert_eq!(&rgba[0..4], &[255, 0, 0, 255]);
        assert_eq!(&rgba[4..8], &[0, 0, 255, 255]);
        assert_eq!(&rgba[8..12], &[255, 0, 0, 255]);
    }
}
