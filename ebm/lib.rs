#![deny(dead_code)]
#![deny(unused_imports)]

//! Event-based modelling of disease progression.
//!
//! Given cross-sectional biomarker measurements from diseased and
//! non-diseased participants, a Metropolis-Hastings chain over biomarker
//! orderings is run while the per-biomarker pre-event (phi) and post-event
//! (theta) distributions are re-estimated alongside it.

pub mod config;
pub mod data;
pub mod kmeans;
pub mod likelihood;
pub mod ordering;
pub mod params;
pub mod posterior;
pub mod progress;
pub mod run;
pub mod sampler;

#[path = "../density/mod.rs"]
pub mod density;

/// Floor applied to densities before taking logarithms.
pub const EPSILON: f64 = 1e-10;
