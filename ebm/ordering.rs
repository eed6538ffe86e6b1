//! # Biomarker Orderings
//!
//! An ordering assigns every biomarker a distinct disease stage in `1..=S`,
//! where `S` is the number of biomarkers. It is the state of the
//! Metropolis-Hastings chain. This module also holds the operators that act
//! on orderings from outside the chain: the swap proposal, the burn-in/thinning
//! aggregation of a trace into a single most likely ordering, and Kendall's
//! tau against a reference ordering.

use itertools::Itertools;
use ndarray::Array2;
use rand::Rng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use statrs::function::erf::erfc;
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum OrderError {
    #[error(
        "An ordering over {expected} biomarkers must use each stage 1..={expected} exactly once, but got {stages:?}."
    )]
    NotABijection { expected: usize, stages: Vec<usize> },

    #[error("The thinning interval must be at least 1.")]
    ZeroThinning,

    #[error(
        "No trace entries remain after discarding {burn_in} burn-in iterations and keeping every {thinning}th of {len} entries."
    )]
    EmptyTrace {
        burn_in: usize,
        thinning: usize,
        len: usize,
    },

    #[error("Orderings cover different numbers of biomarkers ({0} vs {1}).")]
    LengthMismatch(usize, usize),

    #[error("Biomarker '{0}' is missing from the reference ordering.")]
    MissingBiomarker(String),

    #[error("The reference ordering names biomarker '{0}', which is not present in the data.")]
    UnknownBiomarker(String),
}

/// Stage assignment for every biomarker, indexed by biomarker index.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BiomarkerOrder {
    stages: Vec<usize>,
}

impl BiomarkerOrder {
    /// Builds an ordering from `stages[b]` = stage of biomarker `b`.
    pub fn from_stages(stages: Vec<usize>) -> Result<Self, OrderError> {
        let order = Self { stages };
        if !order.is_bijection() {
            return Err(OrderError::NotABijection {
                expected: order.stages.len(),
                stages: order.stages,
            });
        }
        Ok(order)
    }

    /// Biomarker `b` becomes abnormal at stage `b + 1`.
    pub fn identity(n_biomarkers: usize) -> Self {
        Self {
            stages: (1..=n_biomarkers).collect(),
        }
    }

    /// A uniformly random permutation of the stages.
    pub fn random<R: Rng + ?Sized>(n_biomarkers: usize, rng: &mut R) -> Self {
        let mut stages: Vec<usize> = (1..=n_biomarkers).collect();
        stages.shuffle(rng);
        Self { stages }
    }

    /// Builds an ordering from a name -> stage map, using the index order of `names`.
    pub fn from_named(
        names: &[String],
        named: &BTreeMap<String, usize>,
    ) -> Result<Self, OrderError> {
        if let Some(unknown) = named.keys().find(|k| !names.contains(k)) {
            return Err(OrderError::UnknownBiomarker(unknown.clone()));
        }
        let stages = names
            .iter()
            .map(|name| {
                named
                    .get(name)
                    .copied()
                    .ok_or_else(|| OrderError::MissingBiomarker(name.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Self::from_stages(stages)
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    #[inline]
    pub fn stage_of(&self, biomarker: usize) -> usize {
        self.stages[biomarker]
    }

    pub fn stages(&self) -> &[usize] {
        &self.stages
    }

    /// True when every stage in `1..=len` is used exactly once.
    pub fn is_bijection(&self) -> bool {
        let n = self.stages.len();
        let mut seen = vec![false; n];
        for &stage in &self.stages {
            if stage == 0 || stage > n || seen[stage - 1] {
                return false;
            }
            seen[stage - 1] = true;
        }
        true
    }

    /// Proposal operator: a copy of this ordering with `n_shuffle` pairwise swaps applied.
    ///
    /// Both positions of a swap are drawn uniformly and independently, so a swap
    /// may pick the same position twice and leave the ordering unchanged. The
    /// resulting chain is lazy, which keeps it aperiodic and lets an even number
    /// of swaps still reach odd permutations.
    pub fn shuffled<R: Rng + ?Sized>(&self, n_shuffle: usize, rng: &mut R) -> Self {
        let mut stages = self.stages.clone();
        let n = stages.len();
        if n >= 2 {
            for _ in 0..n_shuffle {
                let i = rng.gen_range(0..n);
                let j = rng.gen_range(0..n);
                stages.swap(i, j);
            }
        }
        Self { stages }
    }

    /// Name -> stage map for reporting.
    pub fn to_named(&self, names: &[String]) -> BTreeMap<String, usize> {
        names
            .iter()
            .cloned()
            .zip(self.stages.iter().copied())
            .collect()
    }
}

/// Indices of trace entries that survive burn-in and thinning.
///
/// An entry at index `i` is kept when `i > burn_in` and `i % thinning == 0`.
fn retained_indices(
    len: usize,
    burn_in: usize,
    thinning: usize,
) -> Result<Vec<usize>, OrderError> {
    if thinning == 0 {
        return Err(OrderError::ZeroThinning);
    }
    let kept: Vec<usize> = (0..len)
        .filter(|&i| i > burn_in && i % thinning == 0)
        .collect();
    if kept.is_empty() {
        return Err(OrderError::EmptyTrace {
            burn_in,
            thinning,
            len,
        });
    }
    Ok(kept)
}

/// Fraction of retained trace entries that place biomarker `b` at stage `s`.
///
/// Shape is `[n_biomarkers, n_stages]`; column `s - 1` holds stage `s`.
pub fn stage_probabilities(
    trace: &[BiomarkerOrder],
    burn_in: usize,
    thinning: usize,
) -> Result<Array2<f64>, OrderError> {
    let kept = retained_indices(trace.len(), burn_in, thinning)?;
    let n = trace[kept[0]].len();
    let mut counts = Array2::<f64>::zeros((n, n));
    for &i in &kept {
        let order = &trace[i];
        if order.len() != n {
            return Err(OrderError::LengthMismatch(n, order.len()));
        }
        for (b, &stage) in order.stages().iter().enumerate() {
            counts[[b, stage - 1]] += 1.0;
        }
    }
    counts /= kept.len() as f64;
    Ok(counts)
}

/// Collapses a trace into one ordering.
///
/// Biomarkers are visited in index order; each takes its most frequent stage
/// that no earlier biomarker has claimed, so the result is always a bijection.
pub fn most_likely_order(
    trace: &[BiomarkerOrder],
    burn_in: usize,
    thinning: usize,
) -> Result<BiomarkerOrder, OrderError> {
    let probabilities = stage_probabilities(trace, burn_in, thinning)?;
    let n = probabilities.nrows();
    let mut assigned = vec![false; n];
    let mut stages = Vec::with_capacity(n);
    for row in probabilities.rows() {
        // Stable sort: ties go to the earlier stage.
        let best = (0..n)
            .sorted_by(|&a, &b| {
                row[b]
                    .partial_cmp(&row[a])
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .find(|&s| !assigned[s]);
        // n unassigned-stage slots remain for n biomarkers, so one is always free.
        let Some(s) = best else {
            return Err(OrderError::NotABijection {
                expected: n,
                stages,
            });
        };
        assigned[s] = true;
        stages.push(s + 1);
    }
    BiomarkerOrder::from_stages(stages)
}

/// Kendall's rank correlation with its two-sided p-value under independence.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct KendallTau {
    pub tau: f64,
    pub p_value: f64,
}

/// Longest ordering whose p-value is computed from the exact null distribution.
pub const EXACT_P_VALUE_MAX_LEN: usize = 33;

fn discordant_pairs(a: &BiomarkerOrder, b: &BiomarkerOrder) -> usize {
    (0..a.len())
        .tuple_combinations()
        .filter(|&(i, j)| {
            let da = a.stage_of(i) as i64 - a.stage_of(j) as i64;
            let db = b.stage_of(i) as i64 - b.stage_of(j) as i64;
            da * db < 0
        })
        .count()
}

/// Two-sided p-value from the distribution of inversion counts of a uniformly
/// random permutation of `n` elements.
fn exact_p_value(n: usize, discordant: usize) -> f64 {
    let pairs = n * (n - 1) / 2;
    let c = discordant.min(pairs - discordant);
    if 2 * c == pairs {
        return 1.0;
    }
    // Inserting the k-th element adds 0..k inversions with equal probability.
    let mut dist = vec![0.0; c + 1];
    dist[0] = 1.0;
    for k in 2..=n {
        let mut next = vec![0.0; c + 1];
        let mut window = 0.0;
        for j in 0..=c {
            window += dist[j];
            if j >= k {
                window -= dist[j - k];
            }
            next[j] = window / k as f64;
        }
        dist = next;
    }
    (2.0 * dist.iter().sum::<f64>()).min(1.0)
}

/// Normal approximation of the statistic `concordant - discordant`.
fn asymptotic_p_value(n: usize, score: i64) -> f64 {
    let n = n as f64;
    let variance = n * (n - 1.0) * (2.0 * n + 5.0) / 18.0;
    let z = score as f64 / variance.sqrt();
    erfc(z.abs() / std::f64::consts::SQRT_2)
}

/// Kendall's rank correlation between two orderings of the same biomarkers.
///
/// Orderings are permutations, so there are no ties and tau-a equals tau-b.
/// Fewer than two biomarkers gives `NaN`.
pub fn kendall_tau(a: &BiomarkerOrder, b: &BiomarkerOrder) -> Result<f64, OrderError> {
    Ok(kendall_tau_test(a, b)?.tau)
}

/// Kendall's tau plus its two-sided p-value.
///
/// Up to [`EXACT_P_VALUE_MAX_LEN`] biomarkers the p-value is exact; longer
/// orderings use the normal approximation. Fewer than two biomarkers gives
/// `NaN` for both.
pub fn kendall_tau_test(a: &BiomarkerOrder, b: &BiomarkerOrder) -> Result<KendallTau, OrderError> {
    if a.len() != b.len() {
        return Err(OrderError::LengthMismatch(a.len(), b.len()));
    }
    let n = a.len();
    if n < 2 {
        return Ok(KendallTau {
            tau: f64::NAN,
            p_value: f64::NAN,
        });
    }
    let pairs = n * (n - 1) / 2;
    let discordant = discordant_pairs(a, b);
    let score = pairs as i64 - 2 * discordant as i64;
    let p_value = if n <= EXACT_P_VALUE_MAX_LEN {
        exact_p_value(n, discordant)
    } else {
        asymptotic_p_value(n, score)
    };
    Ok(KendallTau {
        tau: score as f64 / pairs as f64,
        p_value,
    })
}
