//! # Theta/Phi Parameters
//!
//! Every biomarker has a post-event (theta) and a pre-event (phi) measurement
//! distribution. This module holds the two representations the sampler works
//! with, Gaussian `(mean, std)` pairs and weighted KDE pairs, together with
//! their ordering-free initial estimates and the closed-form Gaussian updates.
//!
//! Parameter sets are values: an update always produces a new set and the
//! chain promotes it wholesale on acceptance.

use crate::EPSILON;
use crate::data::{BiomarkerColumn, ParticipantTable};
use crate::density::em::expected_weights;
use crate::density::{Bandwidth, FastKde, KdeSide, KdeTable, KdeThetaPhi};
use crate::kmeans::split_theta_phi;
use crate::posterior::StagePosteriors;
use ndarray::Array1;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::sync::Arc;

/// Gaussian log-density with the standard deviation floored at [`EPSILON`].
#[inline]
pub fn gaussian_ln_pdf(x: f64, mean: f64, std: f64) -> f64 {
    let std = std.max(EPSILON);
    let z = (x - mean) / std;
    -0.5 * (2.0 * PI * std * std).ln() - 0.5 * z * z
}

/// Mean and population standard deviation. Empty input gives `(NaN, NaN)`.
pub fn mean_and_std(values: &[f64]) -> (f64, f64) {
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    (mean, var.sqrt())
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GaussianThetaPhi {
    pub theta_mean: f64,
    pub theta_std: f64,
    pub phi_mean: f64,
    pub phi_std: f64,
}

impl GaussianThetaPhi {
    /// Log-density of `x` under theta when `affected`, otherwise phi.
    #[inline]
    pub fn ln_density(&self, x: f64, affected: bool) -> f64 {
        if affected {
            gaussian_ln_pdf(x, self.theta_mean, self.theta_std)
        } else {
            gaussian_ln_pdf(x, self.phi_mean, self.phi_std)
        }
    }
}

/// Gaussian parameters for every biomarker, in biomarker index order.
pub type GaussianParamSet = Arc<[GaussianThetaPhi]>;

/// Ordering-free Gaussian estimate: moments of the k-means theta/phi clusters.
pub fn initial_gaussian(table: &ParticipantTable) -> GaussianParamSet {
    table
        .columns()
        .iter()
        .map(|column| {
            let (theta, phi) = split_theta_phi(column);
            let (theta_mean, theta_std) = mean_and_std(&theta);
            let (phi_mean, phi_std) = mean_and_std(&phi);
            GaussianThetaPhi {
                theta_mean,
                theta_std,
                phi_mean,
                phi_std,
            }
        })
        .collect()
}

/// Splits a biomarker's measurements into hard theta/phi clusters.
///
/// Non-diseased measurements are always phi. A diseased participant's
/// measurement is theta when the posterior mass on stages at or after
/// `curr_order` exceeds the mass before it; an exact tie is a coin flip.
pub fn hard_assignment<R: Rng + ?Sized>(
    column: &BiomarkerColumn,
    stage_post: &StagePosteriors,
    disease_stages: &[usize],
    curr_order: usize,
    rng: &mut R,
) -> (Vec<f64>, Vec<f64>) {
    let mut theta = Vec::new();
    let mut phi = Vec::new();
    for ((&p, &x), &diseased) in column
        .participants
        .iter()
        .zip(column.measurements.iter())
        .zip(&column.diseased)
    {
        let affected = diseased && {
            let (after, before) = stage_post.split_mass(p, disease_stages, curr_order);
            if after == before {
                rng.gen_bool(0.5)
            } else {
                after > before
            }
        };
        if affected {
            theta.push(x);
        } else {
            phi.push(x);
        }
    }
    (theta, phi)
}

/// Maximum-likelihood `(mean, std)` of one cluster, or `fallback` when it is empty.
pub fn mle_estimate(values: &[f64], fallback: (f64, f64)) -> (f64, f64) {
    if values.is_empty() {
        return fallback;
    }
    mean_and_std(values)
}

/// Normal-inverse-chi-squared posterior `(mean, std)` of one cluster.
///
/// The prior is centred on the current estimate `(m0, s0)` with pseudo-count
/// `prior_n` for the mean and `prior_v` degrees of freedom for the variance.
/// An empty cluster keeps the current estimate.
pub fn conjugate_estimate(values: &[f64], current: (f64, f64), prior_n: f64, prior_v: f64) -> (f64, f64) {
    if values.is_empty() {
        return current;
    }
    let (m0, s0) = current;
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let sample_var = if values.len() < 2 {
        0.0
    } else {
        values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0)
    };

    let mu_n = (prior_n * m0 + n * mean) / (prior_n + n);
    let v_n = prior_v + n;
    let s_n_sq = (prior_v * s0 * s0
        + (n - 1.0) * sample_var
        + (prior_n * n / (prior_n + n)) * (mean - m0).powi(2))
        / v_n;
    (mu_n, s_n_sq.sqrt())
}

/// Posterior-weighted `(mean, std)` under normalised `weights`.
pub fn weighted_moments(values: &Array1<f64>, weights: &Array1<f64>) -> (f64, f64) {
    let mean = values.dot(weights);
    let var = values
        .iter()
        .zip(weights.iter())
        .map(|(x, w)| w * (x - mean).powi(2))
        .sum::<f64>();
    (mean, var.max(0.0).sqrt())
}

/// Soft EM update: every measurement contributes to both sides with its
/// expected theta/phi weight.
pub fn soft_em_estimate(
    column: &BiomarkerColumn,
    stage_post: &StagePosteriors,
    disease_stages: &[usize],
    curr_order: usize,
) -> GaussianThetaPhi {
    let (theta_w, phi_w) = expected_weights(column, stage_post, disease_stages, curr_order);
    let (theta_mean, theta_std) = weighted_moments(&column.measurements, &theta_w);
    let (phi_mean, phi_std) = weighted_moments(&column.measurements, &phi_w);
    GaussianThetaPhi {
        theta_mean,
        theta_std,
        phi_mean,
        phi_std,
    }
}

/// Weighted KDE pairs for every biomarker plus the evaluation table built from them.
#[derive(Debug, Clone)]
pub struct KdeParamSet {
    per_biomarker: Arc<[KdeThetaPhi]>,
    table: Arc<KdeTable>,
}

impl KdeParamSet {
    pub fn new(per_biomarker: Vec<KdeThetaPhi>) -> Self {
        let table = KdeTable::build(
            per_biomarker
                .iter()
                .map(|tp| (tp.theta.kde.as_ref(), tp.phi.kde.as_ref())),
        );
        Self {
            per_biomarker: per_biomarker.into(),
            table: Arc::new(table),
        }
    }

    pub fn per_biomarker(&self) -> &[KdeThetaPhi] {
        &self.per_biomarker
    }

    pub fn table(&self) -> &KdeTable {
        &self.table
    }
}

/// Ordering-free KDE estimate: unweighted KDEs over the k-means clusters.
///
/// The stored weight vectors are uniform over all of the biomarker's
/// measurements, which is what the first EM step compares against.
pub fn initial_kde(table: &ParticipantTable) -> KdeParamSet {
    let per_biomarker = table
        .columns()
        .iter()
        .map(|column| {
            let (theta, phi) = split_theta_phi(column);
            let n = column.measurements.len();
            let uniform = Array1::from_elem(n, 1.0 / n.max(1) as f64);
            KdeThetaPhi {
                theta: KdeSide::new(
                    FastKde::new(Array1::from_vec(theta), None, Bandwidth::Silverman),
                    uniform.clone(),
                ),
                phi: KdeSide::new(
                    FastKde::new(Array1::from_vec(phi), None, Bandwidth::Silverman),
                    uniform,
                ),
            }
        })
        .collect();
    KdeParamSet::new(per_biomarker)
}

/// One fitted KDE side in full: the density can be rebuilt from it with
/// `FastKde::new(samples, Some(weights), Bandwidth::Fixed(bandwidth))`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KdeSideReport {
    pub bandwidth: f64,
    pub samples: Vec<f64>,
    pub weights: Vec<f64>,
}

impl From<&KdeSide> for KdeSideReport {
    fn from(side: &KdeSide) -> Self {
        Self {
            bandwidth: side.kde.bandwidth(),
            samples: side.kde.samples().to_vec(),
            weights: side.kde.weights().to_vec(),
        }
    }
}

/// Per-biomarker summary written to the results file.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum BiomarkerReport {
    Gaussian(GaussianThetaPhi),
    Kde { theta: KdeSideReport, phi: KdeSideReport },
}

impl From<&KdeThetaPhi> for BiomarkerReport {
    fn from(tp: &KdeThetaPhi) -> Self {
        BiomarkerReport::Kde {
            theta: KdeSideReport::from(&tp.theta),
            phi: KdeSideReport::from(&tp.phi),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::MeasurementRow;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn column() -> BiomarkerColumn {
        BiomarkerColumn {
            participants: vec![0, 1, 2, 3],
            measurements: array![0.0, 1.0, 5.0, 7.0],
            diseased: vec![false, false, true, true],
        }
    }

    fn posteriors() -> StagePosteriors {
        let mut post = StagePosteriors::new();
        // Participant 2 is clearly past stage 2, participant 3 clearly before it.
        post.insert(2, array![0.1, 0.2, 0.7]);
        post.insert(3, array![0.8, 0.1, 0.1]);
        post
    }

    #[test]
    fn gaussian_ln_pdf_matches_closed_form() {
        let expected = -0.5 * (2.0 * PI).ln();
        assert_abs_diff_eq!(gaussian_ln_pdf(0.0, 0.0, 1.0), expected, epsilon = 1e-12);
        assert_abs_diff_eq!(
            gaussian_ln_pdf(3.0, 1.0, 2.0),
            -0.5 * (8.0 * PI).ln() - 0.5,
            epsilon = 1e-12
        );
        // A zero std is floored instead of producing infinities.
        assert!(gaussian_ln_pdf(0.0, 0.0, 0.0).is_finite());
    }

    #[test]
    fn hard_assignment_uses_posterior_mass() {
        let mut rng = StdRng::seed_from_u64(1);
        let (theta, phi) = hard_assignment(&column(), &posteriors(), &[1, 2, 3], 2, &mut rng);
        assert_eq!(theta, vec![5.0]);
        assert_eq!(phi, vec![0.0, 1.0, 7.0]);
    }

    #[test]
    fn mle_falls_back_on_empty_cluster() {
        assert_eq!(mle_estimate(&[], (3.0, 0.5)), (3.0, 0.5));
        let (m, s) = mle_estimate(&[1.0, 3.0], (0.0, 0.0));
        assert_abs_diff_eq!(m, 2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(s, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn conjugate_update_matches_hand_computation() {
        // n = 2, mean = 2, sample var (ddof 1) = 2, prior (m0 = 0, s0 = 1), n0 = v0 = 1.
        let (mu, s) = conjugate_estimate(&[1.0, 3.0], (0.0, 1.0), 1.0, 1.0);
        assert_abs_diff_eq!(mu, 4.0 / 3.0, epsilon = 1e-12);
        let s_sq: f64 = (1.0 + 1.0 * 2.0 + (2.0 / 3.0) * 4.0) / 3.0;
        assert_abs_diff_eq!(s, s_sq.sqrt(), epsilon = 1e-12);

        // A single observation has no sample variance term.
        let (mu1, s1) = conjugate_estimate(&[2.0], (0.0, 1.0), 1.0, 1.0);
        assert_abs_diff_eq!(mu1, 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(s1, ((1.0 + 0.5 * 4.0) / 2.0f64).sqrt(), epsilon = 1e-12);

        assert_eq!(conjugate_estimate(&[], (4.0, 2.0), 1.0, 1.0), (4.0, 2.0));
    }

    #[test]
    fn soft_em_weights_moments_by_posterior() {
        let est = soft_em_estimate(&column(), &posteriors(), &[1, 2, 3], 2);
        // Raw theta weights: [0, 0, 0.9, 0.2]; raw phi weights: [1, 1, 0.1, 0.8].
        let theta_mean = (0.9 * 5.0 + 0.2 * 7.0) / 1.1;
        let phi_mean = (0.0 + 1.0 + 0.1 * 5.0 + 0.8 * 7.0) / 2.9;
        assert_abs_diff_eq!(est.theta_mean, theta_mean, epsilon = 1e-12);
        assert_abs_diff_eq!(est.phi_mean, phi_mean, epsilon = 1e-12);
        assert!(est.theta_std > 0.0 && est.phi_std > 0.0);
    }

    #[test]
    fn initial_estimates_separate_clusters() {
        let mut rows = Vec::new();
        for i in 0..6 {
            let diseased = i >= 3;
            rows.push(MeasurementRow {
                participant: i.to_string(),
                biomarker: "a".to_string(),
                measurement: if diseased { 10.0 + i as f64 * 0.1 } else { i as f64 * 0.1 },
                diseased,
            });
        }
        let table = ParticipantTable::from_rows(rows).expect("valid table");

        let gaussian = initial_gaussian(&table);
        assert_eq!(gaussian.len(), 1);
        assert!(gaussian[0].theta_mean > 10.0);
        assert!(gaussian[0].phi_mean < 1.0);

        let kde = initial_kde(&table);
        let tp = &kde.per_biomarker()[0];
        assert_eq!(tp.theta.kde.len(), 3);
        assert_eq!(tp.phi.kde.len(), 3);
        assert_eq!(tp.theta.weights.len(), 6);
        assert_eq!(kde.table().n_biomarkers(), 1);
        assert!(kde.table().log_density(0, true, 10.4) > kde.table().log_density(0, false, 10.4));
    }

    #[test]
    fn kde_report_rebuilds_the_fitted_density() {
        let samples = array![0.0, 1.0, 5.0, 7.0];
        let side = KdeSide::new(
            FastKde::new(samples.clone(), Some(array![1.0, 1.0, 4.0, 2.0]), Bandwidth::Silverman),
            array![0.125, 0.125, 0.5, 0.25],
        );
        let pair = KdeThetaPhi {
            theta: side.clone(),
            phi: KdeSide::new(FastKde::uniform(samples), Array1::from_elem(4, 0.25)),
        };
        let BiomarkerReport::Kde { theta, phi } = BiomarkerReport::from(&pair) else {
            panic!("KDE parameters must produce a KDE report");
        };
        assert_eq!(theta.samples, vec![0.0, 1.0, 5.0, 7.0]);
        assert_eq!(theta.weights, vec![0.125, 0.125, 0.5, 0.25]);
        assert_eq!(phi.weights, vec![0.25; 4]);

        let rebuilt = FastKde::new(
            Array1::from_vec(theta.samples),
            Some(Array1::from_vec(theta.weights)),
            Bandwidth::Fixed(theta.bandwidth),
        );
        let points = array![-1.0, 0.5, 4.0, 6.5];
        let original = side.kde.logpdf(points.view());
        let restored = rebuilt.logpdf(points.view());
        for (a, b) in original.iter().zip(restored.iter()) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-12);
        }
    }
}
