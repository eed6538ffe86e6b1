//! Non-parametric theta/phi densities: weighted KDEs, the packed likelihood
//! table, and the EM re-weighting step.

pub mod em;
pub mod kde;
pub mod table;

pub use kde::{Bandwidth, FastKde};
pub use table::KdeTable;

use ndarray::Array1;
use std::sync::Arc;

/// One side (theta or phi) of a biomarker's non-parametric estimate: the KDE
/// and the per-measurement weights it was built from. Both are shared, so a
/// reused side is the very same object as before.
#[derive(Debug, Clone)]
pub struct KdeSide {
    pub kde: Arc<FastKde>,
    pub weights: Arc<Array1<f64>>,
}

impl KdeSide {
    pub fn new(kde: FastKde, weights: Array1<f64>) -> Self {
        Self {
            kde: Arc::new(kde),
            weights: Arc::new(weights),
        }
    }

    /// True when both sides share the same KDE and weight allocations.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.kde, &other.kde) && Arc::ptr_eq(&self.weights, &other.weights)
    }
}

/// Post-event (theta) and pre-event (phi) densities of one biomarker.
#[derive(Debug, Clone)]
pub struct KdeThetaPhi {
    pub theta: KdeSide,
    pub phi: KdeSide,
}
