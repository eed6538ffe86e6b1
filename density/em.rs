//! EM re-weighting of one biomarker's theta/phi KDEs.
//!
//! Every measurement of the biomarker contributes to both KDEs with a soft
//! weight: a non-diseased participant's measurement is entirely pre-event
//! evidence, while a diseased participant's measurement is split by the
//! posterior probability that the participant has reached the biomarker's
//! stage.

use super::kde::{Bandwidth, FastKde};
use super::{KdeSide, KdeThetaPhi};
use crate::data::BiomarkerColumn;
use crate::posterior::StagePosteriors;
use itertools::izip;
use ndarray::Array1;

/// Normalises `weights` to sum to 1, or returns uniform weights when they sum to 0.
fn normalize_or_uniform(weights: Array1<f64>) -> Array1<f64> {
    let total = weights.sum();
    if total > 0.0 && total.is_finite() {
        weights / total
    } else {
        log::trace!("EM weights sum to {total}; using uniform weights");
        let n = weights.len();
        Array1::from_elem(n, 1.0 / n.max(1) as f64)
    }
}

/// Expected `(theta, phi)` weights of every measurement in `column`.
pub fn expected_weights(
    column: &BiomarkerColumn,
    stage_post: &StagePosteriors,
    disease_stages: &[usize],
    curr_order: usize,
) -> (Array1<f64>, Array1<f64>) {
    let n = column.measurements.len();
    let mut theta = Array1::<f64>::zeros(n);
    let mut phi = Array1::<f64>::zeros(n);
    for (i, &p, &diseased) in izip!(0..n, &column.participants, &column.diseased) {
        if diseased {
            let (after, before) = stage_post.split_mass(p, disease_stages, curr_order);
            theta[i] = after;
            phi[i] = before;
        } else {
            phi[i] = 1.0;
        }
    }
    (normalize_or_uniform(theta), normalize_or_uniform(phi))
}

/// Mean absolute difference, or `None` when the lengths disagree.
fn mean_abs_change(new: &Array1<f64>, old: &Array1<f64>) -> Option<f64> {
    if new.len() != old.len() || new.is_empty() {
        return None;
    }
    Some((new - old).mapv(f64::abs).mean().unwrap_or(f64::INFINITY))
}

fn reuse_or_rebuild(
    previous: &KdeSide,
    weights: Array1<f64>,
    column: &BiomarkerColumn,
    threshold: f64,
) -> KdeSide {
    match mean_abs_change(&weights, &previous.weights) {
        Some(change) if change < threshold => previous.clone(),
        _ => {
            let kde = FastKde::new(
                column.measurements.clone(),
                Some(weights.clone()),
                Bandwidth::Silverman,
            );
            KdeSide::new(kde, weights)
        }
    }
}

/// Re-estimates one biomarker's theta/phi KDEs from the current stage posteriors.
///
/// Each side is rebuilt only when its weights moved by at least
/// `weight_change_threshold` in mean absolute difference; otherwise the
/// previous KDE and weights are returned unchanged.
pub fn update_kde_for_biomarker_em(
    column: &BiomarkerColumn,
    stage_post: &StagePosteriors,
    disease_stages: &[usize],
    curr_order: usize,
    current: &KdeThetaPhi,
    weight_change_threshold: f64,
) -> KdeThetaPhi {
    let (theta_weights, phi_weights) =
        expected_weights(column, stage_post, disease_stages, curr_order);
    KdeThetaPhi {
        theta: reuse_or_rebuild(&current.theta, theta_weights, column, weight_change_threshold),
        phi: reuse_or_rebuild(&current.phi, phi_weights, column, weight_change_threshold),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn column() -> BiomarkerColumn {
        BiomarkerColumn {
            participants: vec![0, 1, 2, 3],
            measurements: array![0.1, -0.2, 3.9, 4.2],
            diseased: vec![false, false, true, true],
        }
    }

    fn posteriors() -> StagePosteriors {
        let mut post = StagePosteriors::new();
        post.insert(2, array![0.5, 0.25, 0.25]);
        post.insert(3, array![0.0, 0.0, 1.0]);
        post
    }

    fn uniform_estimate(col: &BiomarkerColumn) -> KdeThetaPhi {
        let n = col.measurements.len();
        let w = Array1::from_elem(n, 1.0 / n as f64);
        KdeThetaPhi {
            theta: KdeSide::new(FastKde::uniform(array![4.0, 4.1]), w.clone()),
            phi: KdeSide::new(FastKde::uniform(array![0.0, 0.1]), w),
        }
    }

    #[test]
    fn weights_follow_posterior_mass() {
        let col = column();
        let (theta, phi) = expected_weights(&col, &posteriors(), &[1, 2, 3], 2);
        // Raw theta: [0, 0, 0.5, 1.0]; raw phi: [1, 1, 0.5, 0].
        assert_abs_diff_eq!(theta, array![0.0, 0.0, 1.0 / 3.0, 2.0 / 3.0], epsilon = 1e-12);
        assert_abs_diff_eq!(phi, array![0.4, 0.4, 0.2, 0.0], epsilon = 1e-12);
    }

    #[test]
    fn degenerate_weights_fall_back_to_uniform() {
        // Only diseased participants and the biomarker sits at stage 1: no phi mass.
        let col = BiomarkerColumn {
            participants: vec![0, 1],
            measurements: array![3.0, 4.0],
            diseased: vec![true, true],
        };
        let mut post = StagePosteriors::new();
        post.insert(0, array![1.0, 0.0]);
        post.insert(1, array![0.0, 1.0]);
        let (theta, phi) = expected_weights(&col, &post, &[1, 2], 1);
        assert_abs_diff_eq!(theta, array![0.5, 0.5], epsilon = 1e-12);
        assert_abs_diff_eq!(phi, array![0.5, 0.5], epsilon = 1e-12);

        let start = uniform_estimate(&col);
        let updated = update_kde_for_biomarker_em(&col, &post, &[1, 2], 1, &start, 0.01);
        let ll = updated.phi.kde.logpdf(array![3.5].view());
        assert!(ll[0].is_finite());
    }

    #[test]
    fn small_changes_reuse_the_previous_kde() {
        let col = column();
        let post = posteriors();
        let first = update_kde_for_biomarker_em(&col, &post, &[1, 2, 3], 2, &uniform_estimate(&col), 0.01);
        assert!(!first.theta.ptr_eq(&uniform_estimate(&col).theta));

        // Nudge one posterior slightly; the weights move by far less than the threshold.
        let mut nudged = StagePosteriors::new();
        nudged.insert(2, array![0.499, 0.251, 0.25]);
        nudged.insert(3, array![0.0, 0.0, 1.0]);
        let second = update_kde_for_biomarker_em(&col, &nudged, &[1, 2, 3], 2, &first, 0.01);
        assert!(second.theta.ptr_eq(&first.theta));
        assert!(second.phi.ptr_eq(&first.phi));
        assert_eq!(*second.theta.kde, *first.theta.kde);
    }

    #[test]
    fn large_changes_rebuild_over_all_measurements() {
        let col = column();
        let start = uniform_estimate(&col);
        let updated = update_kde_for_biomarker_em(&col, &posteriors(), &[1, 2, 3], 2, &start, 0.01);
        assert!(!updated.theta.ptr_eq(&start.theta));
        assert_eq!(updated.theta.kde.samples(), &col.measurements);
        assert_abs_diff_eq!(updated.theta.kde.weights().sum(), 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(updated.phi.weights[0], 0.4, epsilon = 1e-12);
    }

    #[test]
    fn mismatched_previous_weights_force_a_rebuild() {
        let col = column();
        let mut start = uniform_estimate(&col);
        start.theta = KdeSide::new(FastKde::uniform(array![4.0]), array![1.0]);
        let updated = update_kde_for_biomarker_em(&col, &posteriors(), &[1, 2, 3], 2, &start, 10.0);
        assert!(!updated.theta.ptr_eq(&start.theta));
        // The phi side has matching length and a huge threshold, so it is kept.
        assert!(updated.phi.ptr_eq(&start.phi));
    }
}
