//! Two-cluster 1-D k-means used to seed theta/phi estimates without any
//! ordering assumption.

use crate::data::BiomarkerColumn;

const MAX_LLOYD_ITERATIONS: usize = 100;

/// Lloyd's algorithm with centroids seeded at the minimum and maximum.
///
/// Returns the cluster label of every value; label 0 is the cluster with the
/// lower centroid.
pub fn two_means(values: &[f64]) -> Vec<usize> {
    if values.is_empty() {
        return Vec::new();
    }
    let mut lo = values.iter().copied().fold(f64::INFINITY, f64::min);
    let mut hi = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let mut labels = vec![0usize; values.len()];
    if lo == hi {
        return labels;
    }

    for _ in 0..MAX_LLOYD_ITERATIONS {
        let mut changed = false;
        for (label, &v) in labels.iter_mut().zip(values) {
            let next = usize::from((v - hi).abs() < (v - lo).abs());
            if next != *label {
                *label = next;
                changed = true;
            }
        }

        let (mut sum0, mut n0, mut sum1, mut n1) = (0.0, 0usize, 0.0, 0usize);
        for (&label, &v) in labels.iter().zip(values) {
            if label == 0 {
                sum0 += v;
                n0 += 1;
            } else {
                sum1 += v;
                n1 += 1;
            }
        }
        if n0 > 0 {
            lo = sum0 / n0 as f64;
        }
        if n1 > 0 {
            hi = sum1 / n1 as f64;
        }
        if !changed {
            break;
        }
    }
    labels
}

/// Splits a biomarker's measurements into `(theta, phi)` clusters.
///
/// The phi (pre-event) cluster is the one holding most non-diseased
/// participants; without any non-diseased measurement it is the lower
/// cluster. A degenerate split (one cluster empty) hands every measurement
/// to both sides.
pub fn split_theta_phi(column: &BiomarkerColumn) -> (Vec<f64>, Vec<f64>) {
    let values = column.measurements.to_vec();
    let labels = two_means(&values);

    let mut healthy_votes = [0usize; 2];
    for (&label, &diseased) in labels.iter().zip(&column.diseased) {
        if !diseased {
            healthy_votes[label] += 1;
        }
    }
    let phi_label = usize::from(healthy_votes[1] > healthy_votes[0]);

    let mut theta = Vec::new();
    let mut phi = Vec::new();
    for (&label, &v) in labels.iter().zip(&values) {
        if label == phi_label {
            phi.push(v);
        } else {
            theta.push(v);
        }
    }
    if theta.is_empty() || phi.is_empty() {
        log::debug!("k-means produced a single cluster; using all measurements for theta and phi");
        return (values.clone(), values);
    }
    (theta, phi)
}
