//! # Density-Based Likelihood Evaluator
//!
//! The per-biomarker theta/phi KDEs are packed into one rectangular table so
//! that the likelihood loop indexes rows directly instead of chasing
//! per-biomarker lookups. Row `2b` holds biomarker `b`'s theta (post-event)
//! KDE and row `2b + 1` its phi (pre-event) KDE; each row stores the KDE's
//! samples in ascending order with aligned weights, zero padded to the widest
//! row.
//!
//! Rows carry an explicit length. Padding is never detected by value, since a
//! real measurement can be exactly 0.
//!
//! Every lookup applies the same `3h` window as [`FastKde`], so a table
//! log-density equals the KDE's own `logpdf` at that point.

use super::kde::{FastKde, windowed_density};
use crate::EPSILON;
use ndarray::{Array2, ArrayView1};
use rayon::prelude::*;

#[derive(Debug, Clone)]
pub struct KdeTable {
    samples: Array2<f64>,
    weights: Array2<f64>,
    lengths: Vec<usize>,
    bandwidths: Vec<f64>,
}

#[inline]
fn row_of(biomarker: usize, affected: bool) -> usize {
    2 * biomarker + usize::from(!affected)
}

impl KdeTable {
    /// Packs `(theta, phi)` KDE pairs, one pair per biomarker in index order.
    pub fn build<'a, I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (&'a FastKde, &'a FastKde)>,
    {
        let kdes: Vec<&FastKde> = pairs
            .into_iter()
            .flat_map(|(theta, phi)| [theta, phi])
            .collect();
        let width = kdes.iter().map(|k| k.len()).max().unwrap_or(0);
        let mut samples = Array2::<f64>::zeros((kdes.len(), width));
        let mut weights = Array2::<f64>::zeros((kdes.len(), width));
        let mut lengths = Vec::with_capacity(kdes.len());
        let mut bandwidths = Vec::with_capacity(kdes.len());
        for (r, kde) in kdes.iter().enumerate() {
            let n = kde.len();
            for (j, (&x, &w)) in kde
                .sorted_samples()
                .iter()
                .zip(kde.sorted_weights())
                .enumerate()
            {
                samples[[r, j]] = x;
                weights[[r, j]] = w;
            }
            lengths.push(n);
            bandwidths.push(kde.bandwidth());
        }
        Self {
            samples,
            weights,
            lengths,
            bandwidths,
        }
    }

    pub fn n_biomarkers(&self) -> usize {
        self.lengths.len() / 2
    }

    /// Width of the padded rows.
    pub fn width(&self) -> usize {
        self.samples.ncols()
    }

    /// Floored log-density of `x` under biomarker `b`'s theta KDE when
    /// `affected`, otherwise its phi KDE.
    #[inline]
    pub fn log_density(&self, biomarker: usize, affected: bool, x: f64) -> f64 {
        let r = row_of(biomarker, affected);
        let len = self.lengths[r];
        // Rows of a freshly allocated Array2 are contiguous.
        let values = self.samples.row(r).to_slice().unwrap_or(&[]);
        let weights = self.weights.row(r).to_slice().unwrap_or(&[]);
        let density = windowed_density(&values[..len], &weights[..len], self.bandwidths[r], x);
        if density < EPSILON {
            EPSILON.ln()
        } else {
            density.ln()
        }
    }

    /// Log-likelihood of one participant's measurements at a hypothesised
    /// `participant_stage`; biomarker `b` is post-event when
    /// `participant_stage >= biomarker_stages[i]`.
    pub fn ln_likelihood(
        &self,
        measurements: ArrayView1<f64>,
        biomarkers: &[usize],
        biomarker_stages: &[usize],
        participant_stage: usize,
    ) -> f64 {
        measurements
            .iter()
            .zip(biomarkers)
            .zip(biomarker_stages)
            .map(|((&x, &b), &threshold)| self.log_density(b, participant_stage >= threshold, x))
            .sum()
    }

    /// Parallel log-likelihood of a flat measurement batch where every entry
    /// carries its own participant stage.
    ///
    /// The reduction order depends on rayon's work splitting, so the result
    /// can differ from a sequential sum in the last bits.
    pub fn batch_ln_likelihood(
        &self,
        measurements: ArrayView1<f64>,
        biomarkers: &[usize],
        biomarker_stages: &[usize],
        participant_stages: &[usize],
    ) -> f64 {
        let n = measurements.len();
        (0..n)
            .into_par_iter()
            .map(|i| {
                self.log_density(
                    biomarkers[i],
                    participant_stages[i] >= biomarker_stages[i],
                    measurements[i],
                )
            })
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::density::kde::Bandwidth;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array1, array};

    fn pair() -> (FastKde, FastKde, FastKde, FastKde) {
        let theta0 = FastKde::uniform(array![4.0, 5.0, 5.5, 6.0, 4.5]);
        let phi0 = FastKde::uniform(array![-1.0, 0.0, 0.5, 1.0]);
        let theta1 = FastKde::new(
            array![10.0, 12.0, 11.0],
            Some(array![0.2, 0.5, 0.3]),
            Bandwidth::Fixed(0.8),
        );
        let phi1 = FastKde::uniform(array![2.0, 2.5]);
        (theta0, phi0, theta1, phi1)
    }

    #[test]
    fn table_matches_kde_logpdf_exactly() {
        let (t0, p0, t1, p1) = pair();
        let table = KdeTable::build([(&t0, &p0), (&t1, &p1)]);
        assert_eq!(table.n_biomarkers(), 2);
        assert_eq!(table.width(), 5);
        for &x in &[-1.0, 0.0, 0.25, 3.0, 5.1, 11.4, 100.0] {
            assert_eq!(table.log_density(0, true, x), t0.logpdf(array![x].view())[0]);
            assert_eq!(table.log_density(0, false, x), p0.logpdf(array![x].view())[0]);
            assert_eq!(table.log_density(1, true, x), t1.logpdf(array![x].view())[0]);
            assert_eq!(table.log_density(1, false, x), p1.logpdf(array![x].view())[0]);
        }
    }

    #[test]
    fn zero_valued_samples_are_not_padding() {
        // The phi row holds a legitimate sample at exactly 0 in its middle.
        let theta = FastKde::uniform(array![5.0, 6.0, 7.0, 8.0]);
        let phi = FastKde::new(array![-0.2, 0.0, 0.2], None, Bandwidth::Fixed(0.05));
        let table = KdeTable::build([(&theta, &phi)]);
        let at_zero = table.log_density(0, false, 0.0);
        assert_eq!(at_zero, phi.logpdf(array![0.0].view())[0]);
        assert!(at_zero > EPSILON.ln());
    }

    #[test]
    fn participant_likelihood_splits_on_stage() {
        let (t0, p0, t1, p1) = pair();
        let table = KdeTable::build([(&t0, &p0), (&t1, &p1)]);
        let measurements = array![5.0, 2.2];
        let biomarkers = [0, 1];
        let thresholds = [1, 2];
        // Stage 1: biomarker 0 abnormal, biomarker 1 normal.
        let ll = table.ln_likelihood(measurements.view(), &biomarkers, &thresholds, 1);
        let expected = t0.logpdf(array![5.0].view())[0] + p1.logpdf(array![2.2].view())[0];
        assert_abs_diff_eq!(ll, expected, epsilon = 1e-12);
        // Stage 0 (non-diseased): both normal; the floor keeps it finite.
        let healthy = table.ln_likelihood(measurements.view(), &biomarkers, &thresholds, 0);
        assert!(healthy.is_finite());
        assert_abs_diff_eq!(
            healthy,
            p0.logpdf(array![5.0].view())[0] + p1.logpdf(array![2.2].view())[0],
            epsilon = 1e-12
        );
    }

    #[test]
    fn batch_agrees_with_sequential_sum() {
        let (t0, p0, t1, p1) = pair();
        let table = KdeTable::build([(&t0, &p0), (&t1, &p1)]);
        let n = 5000;
        let measurements: Array1<f64> = (0..n).map(|i| -2.0 + 14.0 * i as f64 / n as f64).collect();
        let biomarkers: Vec<usize> = (0..n).map(|i| i % 2).collect();
        let thresholds: Vec<usize> = (0..n).map(|i| 1 + i % 2).collect();
        let stages: Vec<usize> = (0..n).map(|i| i % 3).collect();
        let sequential: f64 = (0..n)
            .map(|i| table.log_density(biomarkers[i], stages[i] >= thresholds[i], measurements[i]))
            .sum();
        let parallel = table.batch_ln_likelihood(measurements.view(), &biomarkers, &thresholds, &stages);
        assert_abs_diff_eq!(parallel, sequential, epsilon = 1e-6 * sequential.abs());
    }
}
