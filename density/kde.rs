//! # Weighted Gaussian Kernel Density Estimation
//!
//! A `FastKde` is an immutable, weighted mixture of Gaussian kernels centred
//! on a fixed set of samples:
//!
//! `f(x) = Σ_i w_i · φ((x - x_i) / h) / h`,  with `Σ_i w_i = 1`.
//!
//! # Spatial pruning
//!
//! At construction the samples are sorted by value (weights carried along).
//! A query only sums the kernels whose centres lie within `3h` of the query
//! point, located by two binary searches. Kernel mass beyond `3h` is
//! negligible next to the `EPSILON` floor applied before taking logarithms.
//! A query with no sample in range has density exactly 0.
//!
//! # Batching
//!
//! Small batches (at most 10 points) are evaluated point by point through a
//! bounded memo cache. Larger batches are split into chunks of 1000 points
//! and each chunk is evaluated in parallel with rayon. Both paths call the
//! same per-point routine, so a point's density does not depend on the batch
//! it arrived in.
//!
//! # Concurrency
//!
//! The memo cache is a `DashMap` private to the instance. Inserts are
//! best-effort: once the cache is full new values are simply not stored.

use crate::EPSILON;
use dashmap::DashMap;
use ndarray::{Array1, ArrayView1};
use rayon::prelude::*;

/// Smallest bandwidth a KDE will use.
pub const BANDWIDTH_FLOOR: f64 = 1e-6;

/// Query radius, in bandwidths.
pub const NEIGHBORHOOD_BANDWIDTHS: f64 = 3.0;

const INV_SQRT_2PI: f64 = 0.398_942_280_401_432_7;
const MEMOIZE_MAX_POINTS: usize = 10;
const CACHE_CAPACITY: usize = 1000;
const EVALUATION_CHUNK: usize = 1000;

/// How the kernel bandwidth is chosen.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Bandwidth {
    /// `std(samples) · (4 / 3n)^(1/5)`, using the unweighted population std.
    Silverman,
    Fixed(f64),
}

#[inline]
pub fn gaussian_kernel(x: f64, xi: f64, bandwidth: f64) -> f64 {
    let u = (x - xi) / bandwidth;
    INV_SQRT_2PI * (-0.5 * u * u).exp() / bandwidth
}

/// Kernel sum at `x` over the samples within `3h` of it.
///
/// `values` must be sorted ascending, with `weights` aligned to it.
#[inline]
pub fn windowed_density(values: &[f64], weights: &[f64], bandwidth: f64, x: f64) -> f64 {
    let radius = NEIGHBORHOOD_BANDWIDTHS * bandwidth;
    let lo = values.partition_point(|&v| v < x - radius);
    let hi = values.partition_point(|&v| v <= x + radius);
    if lo >= hi {
        return 0.0;
    }
    values[lo..hi]
        .iter()
        .zip(&weights[lo..hi])
        .map(|(&xi, &w)| w * gaussian_kernel(x, xi, bandwidth))
        .sum()
}

pub fn silverman_bandwidth(samples: ArrayView1<f64>) -> f64 {
    let n = samples.len();
    if n == 0 {
        return BANDWIDTH_FLOOR;
    }
    let sigma = samples.std(0.0);
    let factor = (4.0 / (3.0 * n as f64)).powf(0.2);
    (sigma * factor).max(BANDWIDTH_FLOOR)
}

/// Samples sorted by value, with their weights.
#[derive(Debug)]
struct SortedIndex {
    values: Vec<f64>,
    weights: Vec<f64>,
}

impl SortedIndex {
    fn build(samples: &Array1<f64>, weights: &Array1<f64>) -> Self {
        let mut order: Vec<usize> = (0..samples.len()).collect();
        order.sort_by(|&a, &b| samples[a].total_cmp(&samples[b]));
        Self {
            values: order.iter().map(|&i| samples[i]).collect(),
            weights: order.iter().map(|&i| weights[i]).collect(),
        }
    }
}

#[derive(Debug)]
pub struct FastKde {
    samples: Array1<f64>,
    weights: Array1<f64>,
    bandwidth: f64,
    index: SortedIndex,
    cache: DashMap<u64, f64>,
}

impl FastKde {
    /// Builds a KDE over `samples`.
    ///
    /// Weights default to uniform and are normalised to sum to 1. Weights that
    /// sum to zero (or to a non-finite value), or that do not align with the
    /// samples, are replaced by uniform weights.
    pub fn new(samples: Array1<f64>, weights: Option<Array1<f64>>, bandwidth: Bandwidth) -> Self {
        let n = samples.len();
        let uniform = || Array1::from_elem(n, 1.0 / n.max(1) as f64);
        let weights = match weights {
            Some(w) if w.len() != n => {
                log::warn!(
                    "{} KDE weights given for {n} samples; falling back to uniform weights",
                    w.len()
                );
                uniform()
            }
            Some(w) => {
                let total = w.sum();
                if total > 0.0 && total.is_finite() {
                    w / total
                } else {
                    log::trace!("KDE weights sum to {total}; falling back to uniform weights");
                    uniform()
                }
            }
            None => uniform(),
        };
        let bandwidth = match bandwidth {
            Bandwidth::Silverman => silverman_bandwidth(samples.view()),
            Bandwidth::Fixed(h) if h.is_finite() => h.max(BANDWIDTH_FLOOR),
            Bandwidth::Fixed(_) => BANDWIDTH_FLOOR,
        };
        let index = SortedIndex::build(&samples, &weights);
        Self {
            samples,
            weights,
            bandwidth,
            index,
            cache: DashMap::new(),
        }
    }

    /// Uniformly weighted KDE with Silverman's bandwidth.
    pub fn uniform(samples: Array1<f64>) -> Self {
        Self::new(samples, None, Bandwidth::Silverman)
    }

    pub fn samples(&self) -> &Array1<f64> {
        &self.samples
    }

    pub fn weights(&self) -> &Array1<f64> {
        &self.weights
    }

    pub fn bandwidth(&self) -> f64 {
        self.bandwidth
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Samples in ascending order.
    pub fn sorted_samples(&self) -> &[f64] {
        &self.index.values
    }

    /// Weights aligned with `sorted_samples`.
    pub fn sorted_weights(&self) -> &[f64] {
        &self.index.weights
    }

    /// Density at a single point, bypassing the cache.
    #[inline]
    pub fn density_at(&self, x: f64) -> f64 {
        windowed_density(&self.index.values, &self.index.weights, self.bandwidth, x)
    }

    fn memoized_density(&self, x: f64) -> f64 {
        let key = x.to_bits();
        if let Some(hit) = self.cache.get(&key) {
            return *hit;
        }
        let value = self.density_at(x);
        if self.cache.len() < CACHE_CAPACITY {
            self.cache.insert(key, value);
        }
        value
    }

    pub fn evaluate(&self, points: ArrayView1<f64>) -> Array1<f64> {
        if points.len() <= MEMOIZE_MAX_POINTS {
            return points.iter().map(|&x| self.memoized_density(x)).collect();
        }
        let points: Vec<f64> = points.iter().copied().collect();
        let mut out = vec![0.0; points.len()];
        for (dst, src) in out
            .chunks_mut(EVALUATION_CHUNK)
            .zip(points.chunks(EVALUATION_CHUNK))
        {
            dst.par_iter_mut()
                .zip(src.par_iter())
                .for_each(|(d, &x)| *d = self.density_at(x));
        }
        Array1::from_vec(out)
    }

    /// `ln(max(evaluate(points), EPSILON))`.
    pub fn logpdf(&self, points: ArrayView1<f64>) -> Array1<f64> {
        self.evaluate(points).mapv(|d| d.max(EPSILON).ln())
    }
}

impl PartialEq for FastKde {
    /// Exact comparison of samples, weights and bandwidth.
    fn eq(&self, other: &Self) -> bool {
        self.samples == other.samples
            && self.weights == other.weights
            && self.bandwidth == other.bandwidth
    }
}
