//! Pixel lattice and its buffers.
//!
//! A [`Grid`] describes a `width x height` row-major lattice with
//! 4-connected adjacency and no wraparound: boundary sites simply have
//! fewer neighbours. Every edge is stored once, keyed by its upper-left
//! site (`right` edges for `x < width - 1`, `down` edges for `y < height - 1`).
//!
//! A [`Lattice`] holds the three per-run buffers: reference, observed and
//! current estimate, all `f64` and all the same size.
//!
//! ## Parallelism
//!
//! Sweeps and reductions are split by rows with rayon. Reductions sum each
//! row sequentially and then sum the row totals in order, so results are
//! bit-identical regardless of thread count.

use rayon::prelude::*;

use crate::error::{DenoiseError, DenoiseResult};

// ============================================================================
// Grid
// ============================================================================

/// Shape and adjacency of a fixed-size pixel lattice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Grid {
    width: usize,
    height: usize,
}

impl Grid {
    /// Create a grid, rejecting empty extents.
    pub fn new(width: usize, height: usize) -> DenoiseResult<Self> {
        if width == 0 || height == 0 {
            return Err(DenoiseError::InvalidDimension {
                width: width as i64,
                height: height as i64,
            });
        }
        Ok(Grid { width, height })
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    /// Number of sites.
    pub fn len(&self) -> usize {
        self.width * self.height
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of 4-connected edges.
    pub fn edge_count(&self) -> usize {
        (self.width - 1) * self.height + self.width * (self.height - 1)
    }

    /// Right-hand neighbour of site `i`, if any.
    #[inline]
    pub fn right(&self, i: usize) -> Option<usize> {
        (i % self.width + 1 < self.width).then_some(i + 1)
    }

    /// Neighbour below site `i`, if any.
    #[inline]
    pub fn down(&self, i: usize) -> Option<usize> {
        (i / self.width + 1 < self.height).then_some(i + self.width)
    }

    /// Left-hand neighbour of site `i`, if any.
    #[inline]
    pub fn left(&self, i: usize) -> Option<usize> {
        (i % self.width > 0).then(|| i - 1)
    }

    /// Neighbour above site `i`, if any.
    #[inline]
    pub fn up(&self, i: usize) -> Option<usize> {
        (i >= self.width).then(|| i - self.width)
    }

    /// Existing 4-neighbours of site `i` (left, right, up, down order).
    #[inline]
    pub fn neighbors(&self, i: usize) -> impl Iterator<Item = usize> {
        [self.left(i), self.right(i), self.up(i), self.down(i)]
            .into_iter()
            .flatten()
    }

    /// Number of existing neighbours of site `i` (2, 3 or 4 on grids wider than one site).
    #[inline]
    pub fn degree(&self, i: usize) -> usize {
        self.neighbors(i).count()
    }

    /// Eigenvalues of the free-boundary graph Laplacian, one per site.
    ///
    /// The 4-neighbour Laplacian without wraparound is diagonalised by the
    /// 2D DCT-II basis, giving `4 sin²(π kx / 2W) + 4 sin²(π ky / 2H)`.
    /// The first entry (kx = ky = 0) is the zero mode.
    pub fn laplacian_spectrum(&self) -> Vec<f64> {
        let (w, h) = (self.width as f64, self.height as f64);
        let mut spectrum = Vec::with_capacity(self.len());
        for ky in 0..self.height {
            let sy = (std::f64::consts::PI * ky as f64 / (2.0 * h)).sin();
            for kx in 0..self.width {
                let sx = (std::f64::consts::PI * kx as f64 / (2.0 * w)).sin();
                spectrum.push(4.0 * sx * sx + 4.0 * sy * sy);
            }
        }
        spectrum
    }

    /// Deterministic parallel sum of `f(i)` over all sites.
    pub fn site_sum<F>(&self, f: F) -> f64
    where
        F: Fn(usize) -> f64 + Sync,
    {
        let width = self.width;
        let rows: Vec<f64> = (0..self.height)
            .into_par_iter()
            .map(|row| (row * width..(row + 1) * width).map(&f).sum::<f64>())
            .collect();
        rows.iter().sum()
    }

    /// Deterministic parallel sum of `f(x[i] - x[j])` over all edges.
    pub fn edge_sum<F>(&self, x: &[f64], f: F) -> f64
    where
        F: Fn(f64) -> f64 + Sync,
    {
        self.site_sum(|i| {
            let mut acc = 0.0;
            if let Some(j) = self.right(i) {
                acc += f(x[i] - x[j]);
            }
            if let Some(j) = self.down(i) {
                acc += f(x[i] - x[j]);
            }
            acc
        })
    }

    /// Sum of `(a[i] - a[j]) * (b[i] - b[j])` over all edges, i.e. `aᵗ L b`.
    pub fn laplacian_form(&self, a: &[f64], b: &[f64]) -> f64 {
        self.site_sum(|i| {
            let mut acc = 0.0;
            if let Some(j) = self.right(i) {
                acc += (a[i] - a[j]) * (b[i] - b[j]);
            }
            if let Some(j) = self.down(i) {
                acc += (a[i] - a[j]) * (b[i] - b[j]);
            }
            acc
        })
    }

    /// Fill `out[i]` with `f(i)` for every site, in parallel by rows.
    pub fn fill<F>(&self, out: &mut [f64], f: F)
    where
        F: Fn(usize) -> f64 + Sync,
    {
        let width = self.width;
        out.par_chunks_mut(width)
            .enumerate()
            .for_each(|(row, slots)| {
                for (col, slot) in slots.iter_mut().enumerate() {
                    *slot = f(row * width + col);
                }
            });
    }

    /// One red-black relaxation sweep.
    ///
    /// Sites with even `x + y` are updated first from the current buffer,
    /// then sites with odd `x + y` from the half-updated buffer. `update`
    /// receives the site index and the buffer to read from and returns the
    /// site's new value. Each phase writes into `scratch` and swaps, so no
    /// site ever reads a value written in the same phase.
    pub fn red_black_sweep<F>(&self, x: &mut Vec<f64>, scratch: &mut Vec<f64>, update: F)
    where
        F: Fn(usize, &[f64]) -> f64 + Sync,
    {
        let width = self.width;
        scratch.resize(x.len(), 0.0);
        for parity in 0..2 {
            let src: &[f64] = x;
            scratch
                .par_chunks_mut(width)
                .enumerate()
                .for_each(|(row, slots)| {
                    for (col, slot) in slots.iter_mut().enumerate() {
                        let i = row * width + col;
                        *slot = if (row + col) % 2 == parity {
                            update(i, src)
                        } else {
                            src[i]
                        };
                    }
                });
            std::mem::swap(x, scratch);
        }
    }
}

// ============================================================================
// Lattice
// ============================================================================

/// Reference, observed and estimate buffers over one grid.
#[derive(Debug, Clone)]
pub struct Lattice {
    grid: Grid,
    reference: Vec<f64>,
    observed: Vec<f64>,
    estimate: Vec<f64>,
}

impl Lattice {
    /// Allocate zeroed buffers for a `width x height` lattice.
    pub fn initialize(width: usize, height: usize) -> DenoiseResult<Self> {
        let grid = Grid::new(width, height)?;
        let n = grid.len();
        Ok(Lattice {
            grid,
            reference: vec![0.0; n],
            observed: vec![0.0; n],
            estimate: vec![0.0; n],
        })
    }

    pub fn grid(&self) -> Grid {
        self.grid
    }

    /// Copy 8-bit caller buffers in and seed the estimate from the observation.
    pub fn set_input(&mut self, reference: &[u8], observed: &[u8]) -> DenoiseResult<()> {
        let n = self.grid.len();
        if reference.len() != n {
            return Err(DenoiseError::SizeMismatch {
                buffer: "reference",
                expected: n,
                actual: reference.len(),
            });
        }
        if observed.len() != n {
            return Err(DenoiseError::SizeMismatch {
                buffer: "observed",
                expected: n,
                actual: observed.len(),
            });
        }
        for (dst, &src) in self.reference.iter_mut().zip(reference) {
            *dst = src as f64;
        }
        for (dst, &src) in self.observed.iter_mut().zip(observed) {
            *dst = src as f64;
        }
        self.estimate.copy_from_slice(&self.observed);
        Ok(())
    }

    pub fn reference(&self) -> &[f64] {
        &self.reference
    }

    pub fn observed(&self) -> &[f64] {
        &self.observed
    }

    pub fn estimate(&self) -> &[f64] {
        &self.estimate
    }

    /// Mean intensity of the observation.
    pub fn observed_mean(&self) -> f64 {
        self.grid.site_sum(|i| self.observed[i]) / self.grid.len() as f64
    }

    /// Write back a centered solver state as the current estimate.
    pub(crate) fn commit_estimate(&mut self, centered: &[f64], mean: f64) {
        for (dst, &src) in self.estimate.iter_mut().zip(centered) {
            *dst = src + mean;
        }
    }

    /// Restore the estimate to the observation.
    pub(crate) fn reset_estimate(&mut self) {
        self.estimate.copy_from_slice(&self.observed);
    }

    /// Current estimate clamped and rounded to 8 bits.
    pub fn estimate_u8(&self) -> Vec<u8> {
        self.estimate.iter().map(|&v| clamp_and_round(v)).collect()
    }
}

/// Clamp to [0, 255] and round to the nearest integer.
#[inline]
pub fn clamp_and_round(v: f64) -> u8 {
    if v.is_nan() {
        return 0;
    }
    v.clamp(0.0, 255.0).round() as u8
}
