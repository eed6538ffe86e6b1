use crate::data::ParticipantTable;
use ahash::AHashMap;
use ndarray::Array1;
use std::collections::BTreeMap;

/// Per diseased participant, the probability of each disease stage `1..=S`
/// (entry `k - 1` holds stage `k`).
#[derive(Debug, Clone, Default)]
pub struct StagePosteriors {
    by_participant: AHashMap<usize, Array1<f64>>,
}

impl StagePosteriors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, participant: usize, probabilities: Array1<f64>) {
        self.by_participant.insert(participant, probabilities);
    }

    pub fn get(&self, participant: usize) -> Option<&Array1<f64>> {
        self.by_participant.get(&participant)
    }

    pub fn len(&self) -> usize {
        self.by_participant.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_participant.is_empty()
    }

    /// Splits participant `p`'s posterior mass into `(>= stage, < stage)`.
    ///
    /// Participants without a posterior contribute nothing to either side.
    pub fn split_mass(&self, participant: usize, disease_stages: &[usize], stage: usize) -> (f64, f64) {
        let Some(probs) = self.by_participant.get(&participant) else {
            return (0.0, 0.0);
        };
        let mut after = 0.0;
        let mut before = 0.0;
        for (&k, &p) in disease_stages.iter().zip(probs.iter()) {
            if k >= stage {
                after += p;
            } else {
                before += p;
            }
        }
        (after, before)
    }

    /// Participant id -> stage probabilities, for reporting.
    pub fn to_named(&self, table: &ParticipantTable) -> BTreeMap<String, Vec<f64>> {
        self.by_participant
            .iter()
            .map(|(&p, probs)| (table.participants()[p].id.clone(), probs.to_vec()))
            .collect()
    }
}

/// Log-sum-exp of `ln_values` together with the normalised weights.
pub fn normalize_ln(ln_values: &[f64]) -> (f64, Array1<f64>) {
    let max = ln_values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        let n = ln_values.len().max(1);
        return (max, Array1::from_elem(ln_values.len(), 1.0 / n as f64));
    }
    let mut weights: Array1<f64> = ln_values.iter().map(|&v| (v - max).exp()).collect();
    let total = weights.sum();
    weights /= total;
    (max + total.ln(), weights)
}
