//! # Likelihood Models
//!
//! A likelihood model scores the measurement table under a candidate ordering
//! and, for every model except the fixed-clustering baseline, re-estimates
//! the theta/phi parameters that the score depends on. The sampler is
//! generic over [`LikelihoodModel`]; [`LikelihoodKind`] names the five
//! implementations and is resolved once per run.
//!
//! Diseased participants are marginalised over their unknown stage:
//! `ln L_j = logsumexp_k ln P(x_j | k)` over stages `1..=S`, and the
//! normalised terms are the participant's stage posterior. Non-diseased
//! participants are scored entirely under phi.

use crate::config::ConfigError;
use crate::data::{OrderedData, ParticipantRecord, ParticipantTable};
use crate::density::em::update_kde_for_biomarker_em;
use crate::params::{
    BiomarkerReport, GaussianParamSet, GaussianThetaPhi, KdeParamSet, conjugate_estimate,
    hard_assignment, initial_gaussian, initial_kde, mle_estimate, soft_em_estimate,
};
use crate::posterior::{StagePosteriors, normalize_ln};
use ndarray::Array1;
use rand::Rng;
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// The likelihood models a run can select by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LikelihoodKind {
    /// Gaussian theta/phi fixed at the k-means estimate.
    HardKmeans,
    /// Gaussian theta/phi from a normal-inverse-chi-squared update.
    ConjugatePriors,
    /// Gaussian theta/phi from maximum likelihood on hard assignments.
    Mle,
    /// Gaussian theta/phi from posterior-weighted moments.
    Em,
    /// Weighted KDE theta/phi re-estimated by EM.
    Kde,
}

impl LikelihoodKind {
    pub const ALL: [LikelihoodKind; 5] = [
        Self::HardKmeans,
        Self::ConjugatePriors,
        Self::Mle,
        Self::Em,
        Self::Kde,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::HardKmeans => "hard_kmeans",
            Self::ConjugatePriors => "conjugate_priors",
            Self::Mle => "mle",
            Self::Em => "em",
            Self::Kde => "kde",
        }
    }
}

impl fmt::Display for LikelihoodKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for LikelihoodKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.name() == s)
            .ok_or_else(|| ConfigError::UnknownLikelihoodModel(s.to_string()))
    }
}

/// Total log-likelihood with the stage posteriors it was marginalised over.
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub ln_likelihood: f64,
    pub stage_post: StagePosteriors,
}

/// Result of scoring one proposal: the evaluation, and the re-estimated
/// parameters it was computed under (`None` when the model keeps its
/// parameters fixed).
#[derive(Debug, Clone)]
pub struct Step<P> {
    pub evaluation: Evaluation,
    pub params: Option<P>,
}

pub trait LikelihoodModel: Sync {
    type Params: Clone + Send + Sync;

    fn kind(&self) -> LikelihoodKind;

    /// Ordering-free starting parameters.
    fn initial_params(&self, table: &ParticipantTable) -> Self::Params;

    /// Scores every participant under `params` and the ordering behind `data`.
    fn evaluate(&self, data: &OrderedData<'_>, params: &Self::Params) -> Evaluation;

    /// New parameters conditioned on the ordering behind `data`, or `None`
    /// when the model never re-estimates.
    fn reestimate<R: Rng + ?Sized>(
        &self,
        data: &OrderedData<'_>,
        params: &Self::Params,
        stage_post: &StagePosteriors,
        rng: &mut R,
    ) -> Option<Self::Params>;

    /// Per-biomarker parameter summary keyed by biomarker name.
    fn report(&self, table: &ParticipantTable, params: &Self::Params) -> BTreeMap<String, BiomarkerReport>;

    /// Posteriors under the current parameters, then re-estimation, then the
    /// score under the re-estimated parameters.
    fn step<R: Rng + ?Sized>(&self, data: &OrderedData<'_>, params: &Self::Params, rng: &mut R) -> Step<Self::Params> {
        let prior = self.evaluate(data, params);
        match self.reestimate(data, params, &prior.stage_post, rng) {
            Some(updated) => Step {
                evaluation: self.evaluate(data, &updated),
                params: Some(updated),
            },
            None => Step {
                evaluation: prior,
                params: None,
            },
        }
    }
}

/// Marginal log-likelihood of every participant, computed in parallel and
/// accumulated in participant order.
///
/// `participant_ln(record, thresholds, k)` is the log-likelihood of one
/// participant at stage `k`; non-diseased participants are evaluated at `k = 0`.
pub fn evaluate_participants<F>(data: &OrderedData<'_>, participant_ln: F) -> Evaluation
where
    F: Fn(&ParticipantRecord, &[usize], usize) -> f64 + Sync,
{
    let table = data.table();
    let n_stages = table.n_stages();
    let per_participant: Vec<(f64, Option<Array1<f64>>)> = table
        .participants()
        .par_iter()
        .enumerate()
        .map(|(p, record)| {
            let thresholds = data.thresholds(p);
            if record.diseased {
                let ln_by_stage: Vec<f64> = (1..=n_stages)
                    .map(|k| participant_ln(record, thresholds, k))
                    .collect();
                let (ln_marginal, posterior) = normalize_ln(&ln_by_stage);
                (ln_marginal, Some(posterior))
            } else {
                (participant_ln(record, thresholds, 0), None)
            }
        })
        .collect();

    let mut ln_likelihood = 0.0;
    let mut stage_post = StagePosteriors::new();
    for (p, (ln_p, posterior)) in per_participant.into_iter().enumerate() {
        ln_likelihood += ln_p;
        if let Some(posterior) = posterior {
            stage_post.insert(p, posterior);
        }
    }
    Evaluation {
        ln_likelihood,
        stage_post,
    }
}

fn evaluate_gaussian(data: &OrderedData<'_>, params: &[GaussianThetaPhi]) -> Evaluation {
    evaluate_participants(data, |record, thresholds, k| {
        record
            .measurements
            .iter()
            .zip(&record.biomarkers)
            .zip(thresholds)
            .map(|((&x, &b), &threshold)| params[b].ln_density(x, k >= threshold))
            .sum()
    })
}

fn gaussian_report(table: &ParticipantTable, params: &[GaussianThetaPhi]) -> BTreeMap<String, BiomarkerReport> {
    table
        .biomarkers()
        .iter()
        .cloned()
        .zip(params.iter().map(|g| BiomarkerReport::Gaussian(*g)))
        .collect()
}

/// Re-estimates each biomarker's Gaussian pair from hard theta/phi clusters.
fn reestimate_hard<R, E>(
    data: &OrderedData<'_>,
    params: &[GaussianThetaPhi],
    stage_post: &StagePosteriors,
    rng: &mut R,
    estimate: E,
) -> GaussianParamSet
where
    R: Rng + ?Sized,
    E: Fn(&[f64], (f64, f64)) -> (f64, f64),
{
    let table = data.table();
    let disease_stages = table.disease_stages();
    table
        .columns()
        .iter()
        .enumerate()
        .map(|(b, column)| {
            let curr_order = data.order().stage_of(b);
            let (theta, phi) =
                hard_assignment(column, stage_post, &disease_stages, curr_order, &mut *rng);
            let current = params[b];
            let (theta_mean, theta_std) = estimate(&theta, (current.theta_mean, current.theta_std));
            let (phi_mean, phi_std) = estimate(&phi, (current.phi_mean, current.phi_std));
            GaussianThetaPhi {
                theta_mean,
                theta_std,
                phi_mean,
                phi_std,
            }
        })
        .collect()
}

/// Baseline: the k-means estimate is scored as is and never replaced.
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedClustering;

impl LikelihoodModel for FixedClustering {
    type Params = GaussianParamSet;

    fn kind(&self) -> LikelihoodKind {
        LikelihoodKind::HardKmeans
    }

    fn initial_params(&self, table: &ParticipantTable) -> GaussianParamSet {
        initial_gaussian(table)
    }

    fn evaluate(&self, data: &OrderedData<'_>, params: &GaussianParamSet) -> Evaluation {
        evaluate_gaussian(data, params)
    }

    fn reestimate<R: Rng + ?Sized>(
        &self,
        _data: &OrderedData<'_>,
        _params: &GaussianParamSet,
        _stage_post: &StagePosteriors,
        _rng: &mut R,
    ) -> Option<GaussianParamSet> {
        None
    }

    fn report(&self, table: &ParticipantTable, params: &GaussianParamSet) -> BTreeMap<String, BiomarkerReport> {
        gaussian_report(table, params)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ConjugatePrior {
    pub prior_n: f64,
    pub prior_v: f64,
}

impl LikelihoodModel for ConjugatePrior {
    type Params = GaussianParamSet;

    fn kind(&self) -> LikelihoodKind {
        LikelihoodKind::ConjugatePriors
    }

    fn initial_params(&self, table: &ParticipantTable) -> GaussianParamSet {
        initial_gaussian(table)
    }

    fn evaluate(&self, data: &OrderedData<'_>, params: &GaussianParamSet) -> Evaluation {
        evaluate_gaussian(data, params)
    }

    fn reestimate<R: Rng + ?Sized>(
        &self,
        data: &OrderedData<'_>,
        params: &GaussianParamSet,
        stage_post: &StagePosteriors,
        rng: &mut R,
    ) -> Option<GaussianParamSet> {
        Some(reestimate_hard(data, params, stage_post, rng, |values, current| {
            conjugate_estimate(values, current, self.prior_n, self.prior_v)
        }))
    }

    fn report(&self, table: &ParticipantTable, params: &GaussianParamSet) -> BTreeMap<String, BiomarkerReport> {
        gaussian_report(table, params)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MaximumLikelihood;

impl LikelihoodModel for MaximumLikelihood {
    type Params = GaussianParamSet;

    fn kind(&self) -> LikelihoodKind {
        LikelihoodKind::Mle
    }

    fn initial_params(&self, table: &ParticipantTable) -> GaussianParamSet {
        initial_gaussian(table)
    }

    fn evaluate(&self, data: &OrderedData<'_>, params: &GaussianParamSet) -> Evaluation {
        evaluate_gaussian(data, params)
    }

    fn reestimate<R: Rng + ?Sized>(
        &self,
        data: &OrderedData<'_>,
        params: &GaussianParamSet,
        stage_post: &StagePosteriors,
        rng: &mut R,
    ) -> Option<GaussianParamSet> {
        Some(reestimate_hard(data, params, stage_post, rng, mle_estimate))
    }

    fn report(&self, table: &ParticipantTable, params: &GaussianParamSet) -> BTreeMap<String, BiomarkerReport> {
        gaussian_report(table, params)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SoftEm;

impl LikelihoodModel for SoftEm {
    type Params = GaussianParamSet;

    fn kind(&self) -> LikelihoodKind {
        LikelihoodKind::Em
    }

    fn initial_params(&self, table: &ParticipantTable) -> GaussianParamSet {
        initial_gaussian(table)
    }

    fn evaluate(&self, data: &OrderedData<'_>, params: &GaussianParamSet) -> Evaluation {
        evaluate_gaussian(data, params)
    }

    fn reestimate<R: Rng + ?Sized>(
        &self,
        data: &OrderedData<'_>,
        _params: &GaussianParamSet,
        stage_post: &StagePosteriors,
        _rng: &mut R,
    ) -> Option<GaussianParamSet> {
        let table = data.table();
        let disease_stages = table.disease_stages();
        let updated: Vec<GaussianThetaPhi> = table
            .columns()
            .par_iter()
            .enumerate()
            .map(|(b, column)| {
                soft_em_estimate(column, stage_post, &disease_stages, data.order().stage_of(b))
            })
            .collect();
        Some(updated.into())
    }

    fn report(&self, table: &ParticipantTable, params: &GaussianParamSet) -> BTreeMap<String, BiomarkerReport> {
        gaussian_report(table, params)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct KdeEm {
    pub weight_change_threshold: f64,
}

impl LikelihoodModel for KdeEm {
    type Params = KdeParamSet;

    fn kind(&self) -> LikelihoodKind {
        LikelihoodKind::Kde
    }

    fn initial_params(&self, table: &ParticipantTable) -> KdeParamSet {
        initial_kde(table)
    }

    fn evaluate(&self, data: &OrderedData<'_>, params: &KdeParamSet) -> Evaluation {
        let kde_table = params.table();
        evaluate_participants(data, |record, thresholds, k| {
            kde_table.ln_likelihood(record.measurements.view(), &record.biomarkers, thresholds, k)
        })
    }

    fn reestimate<R: Rng + ?Sized>(
        &self,
        data: &OrderedData<'_>,
        params: &KdeParamSet,
        stage_post: &StagePosteriors,
        _rng: &mut R,
    ) -> Option<KdeParamSet> {
        let table = data.table();
        let disease_stages = table.disease_stages();
        let updated = table
            .columns()
            .par_iter()
            .zip(params.per_biomarker().par_iter())
            .enumerate()
            .map(|(b, (column, current))| {
                update_kde_for_biomarker_em(
                    column,
                    stage_post,
                    &disease_stages,
                    data.order().stage_of(b),
                    current,
                    self.weight_change_threshold,
                )
            })
            .collect();
        Some(KdeParamSet::new(updated))
    }

    fn report(&self, table: &ParticipantTable, params: &KdeParamSet) -> BTreeMap<String, BiomarkerReport> {
        table
            .biomarkers()
            .iter()
            .cloned()
            .zip(params.per_biomarker().iter().map(BiomarkerReport::from))
            .collect()
    }
}
