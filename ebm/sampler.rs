//! # Metropolis-Hastings Ordering Sampler
//!
//! The chain state is the current ordering, its theta/phi parameters and its
//! log-likelihood. Each iteration proposes a reshuffled ordering, lets the
//! likelihood model re-estimate parameters for it, and accepts or rejects the
//! proposal with the Metropolis rule. The chain itself is strictly
//! sequential; parallelism lives inside the likelihood model.
//!
//! Both traces have one entry per iteration: the log-likelihood trace holds
//! the value *before* that iteration's decision (starting at `-inf`, so the
//! first proposal is always accepted), the order trace the ordering *after*
//! it.

use crate::config::{ConfigError, SamplerConfig};
use crate::data::ParticipantTable;
use crate::likelihood::{
    ConjugatePrior, FixedClustering, KdeEm, LikelihoodKind, LikelihoodModel, MaximumLikelihood,
    SoftEm,
};
use crate::ordering::BiomarkerOrder;
use crate::params::BiomarkerReport;
use crate::posterior::StagePosteriors;
use crate::progress::{ChainProgressObserver, RunPhase};
use rand::Rng;
use std::collections::BTreeMap;

/// Everything a finished chain leaves behind.
#[derive(Debug, Clone)]
pub struct SamplerOutput<P> {
    /// Post-decision ordering of every iteration.
    pub accepted_orders: Vec<BiomarkerOrder>,
    /// Pre-decision log-likelihood of every iteration.
    pub ln_likelihoods: Vec<f64>,
    pub final_order: BiomarkerOrder,
    pub final_ln_likelihood: f64,
    pub final_params: P,
    pub final_stage_post: StagePosteriors,
    pub acceptance_count: usize,
}

impl<P> SamplerOutput<P> {
    pub fn acceptance_ratio(&self) -> f64 {
        if self.accepted_orders.is_empty() {
            0.0
        } else {
            self.acceptance_count as f64 / self.accepted_orders.len() as f64
        }
    }
}

/// A finished chain with its parameters reduced to a per-biomarker report.
#[derive(Debug, Clone)]
pub struct ChainOutcome {
    pub algorithm: LikelihoodKind,
    pub accepted_orders: Vec<BiomarkerOrder>,
    pub ln_likelihoods: Vec<f64>,
    pub final_order: BiomarkerOrder,
    pub final_ln_likelihood: f64,
    pub final_stage_post: StagePosteriors,
    pub parameters: BTreeMap<String, BiomarkerReport>,
    pub acceptance_count: usize,
}

impl ChainOutcome {
    pub fn acceptance_ratio(&self) -> f64 {
        if self.accepted_orders.is_empty() {
            0.0
        } else {
            self.acceptance_count as f64 / self.accepted_orders.len() as f64
        }
    }
}

/// Metropolis acceptance test. An improvement is accepted without drawing
/// from `rng`.
pub fn accept<R: Rng + ?Sized>(delta: f64, rng: &mut R) -> bool {
    if delta > 0.0 {
        return true;
    }
    rng.r#gen::<f64>() < delta.exp()
}

/// Runs one chain of `settings.iterations` iterations under `model`.
///
/// Only `iterations` and `n_shuffle` of `settings` are read here; model
/// hyperparameters live on the model itself.
pub fn run_sampler<M, R, O>(
    table: &ParticipantTable,
    model: &M,
    settings: &SamplerConfig,
    rng: &mut R,
    progress: &mut O,
) -> SamplerOutput<M::Params>
where
    M: LikelihoodModel,
    R: Rng + ?Sized,
    O: ChainProgressObserver + ?Sized,
{
    let iterations = settings.iterations;
    let log_every = (iterations / 10).max(10);
    let names = table.biomarkers();

    let mut current_order = BiomarkerOrder::random(table.n_biomarkers(), rng);
    let mut current_params = model.initial_params(table);
    let mut current_ln_likelihood = f64::NEG_INFINITY;
    let mut current_stage_post = StagePosteriors::new();
    let mut acceptance_count = 0usize;

    let mut accepted_orders = Vec::with_capacity(iterations);
    let mut ln_likelihoods = Vec::with_capacity(iterations);

    log::debug!(
        "Starting {} chain over {} biomarkers from order {:?}",
        model.kind(),
        table.n_biomarkers(),
        current_order.stages()
    );
    progress.on_start(RunPhase::Sampling, iterations);

    for iteration in 0..iterations {
        ln_likelihoods.push(current_ln_likelihood);

        let proposal = current_order.shuffled(settings.n_shuffle, rng);
        let step = {
            let data = table.with_order(&proposal);
            model.step(&data, &current_params, rng)
        };

        let delta = step.evaluation.ln_likelihood - current_ln_likelihood;
        if accept(delta, rng) {
            current_order = proposal;
            current_ln_likelihood = step.evaluation.ln_likelihood;
            current_stage_post = step.evaluation.stage_post;
            if let Some(params) = step.params {
                current_params = params;
            }
            acceptance_count += 1;
        }

        accepted_orders.push(current_order.clone());

        let completed = iteration + 1;
        let acceptance_ratio = acceptance_count as f64 / completed as f64;
        if completed % log_every == 0 {
            log::info!(
                "Iteration {}/{}, acceptance ratio: {:.2}%, log likelihood: {:.4}, current order: {:?}",
                completed,
                iterations,
                100.0 * acceptance_ratio,
                current_ln_likelihood,
                current_order.to_named(names)
            );
        }
        progress.on_iteration(completed, acceptance_ratio, current_ln_likelihood);
    }
    progress.on_finish(RunPhase::Sampling);

    SamplerOutput {
        accepted_orders,
        ln_likelihoods,
        final_order: current_order,
        final_ln_likelihood: current_ln_likelihood,
        final_params: current_params,
        final_stage_post: current_stage_post,
        acceptance_count,
    }
}

fn run_to_outcome<M, R, O>(
    table: &ParticipantTable,
    model: &M,
    settings: &SamplerConfig,
    rng: &mut R,
    progress: &mut O,
) -> ChainOutcome
where
    M: LikelihoodModel,
    R: Rng + ?Sized,
    O: ChainProgressObserver + ?Sized,
{
    let output = run_sampler(table, model, settings, rng, progress);
    ChainOutcome {
        algorithm: model.kind(),
        parameters: model.report(table, &output.final_params),
        accepted_orders: output.accepted_orders,
        ln_likelihoods: output.ln_likelihoods,
        final_order: output.final_order,
        final_ln_likelihood: output.final_ln_likelihood,
        final_stage_post: output.final_stage_post,
        acceptance_count: output.acceptance_count,
    }
}

/// Validates `config`, selects the likelihood model by name and runs one chain.
pub fn sample_orders<R, O>(
    table: &ParticipantTable,
    config: &SamplerConfig,
    rng: &mut R,
    progress: &mut O,
) -> Result<ChainOutcome, ConfigError>
where
    R: Rng + ?Sized,
    O: ChainProgressObserver + ?Sized,
{
    let kind = config.validate()?;
    let outcome = match kind {
        LikelihoodKind::HardKmeans => run_to_outcome(table, &FixedClustering, config, rng, progress),
        LikelihoodKind::ConjugatePriors => {
            let model = ConjugatePrior {
                prior_n: config.prior_n,
                prior_v: config.prior_v,
            };
            run_to_outcome(table, &model, config, rng, progress)
        }
        LikelihoodKind::Mle => run_to_outcome(table, &MaximumLikelihood, config, rng, progress),
        LikelihoodKind::Em => run_to_outcome(table, &SoftEm, config, rng, progress),
        LikelihoodKind::Kde => {
            let model = KdeEm {
                weight_change_threshold: config.weight_change_threshold,
            };
            run_to_outcome(table, &model, config, rng, progress)
        }
    };
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::MeasurementRow;
    use crate::params::initial_gaussian;
    use crate::progress::NoopChainProgress;
    use rand::rngs::StdRng;
    use rand::{RngCore, SeedableRng};
    use rand_distr::{Distribution, Normal};

    /// An RNG that fails the test if anything draws from it.
    struct PanickingRng;

    impl RngCore for PanickingRng {
        fn next_u32(&mut self) -> u32 {
            panic!("random draw on an improving proposal")
        }
        fn next_u64(&mut self) -> u64 {
            panic!("random draw on an improving proposal")
        }
        fn fill_bytes(&mut self, _dest: &mut [u8]) {
            panic!("random draw on an improving proposal")
        }
        fn try_fill_bytes(&mut self, _dest: &mut [u8]) -> Result<(), rand::Error> {
            panic!("random draw on an improving proposal")
        }
    }

    /// Three well-separated biomarkers whose true stages are `a=1, b=2, c=3`.
    fn synthetic_table(seed: u64) -> ParticipantTable {
        let mut rng = StdRng::seed_from_u64(seed);
        let phi = Normal::new(0.0, 1.0).unwrap();
        let theta = Normal::new(6.0, 1.0).unwrap();
        let names = ["a", "b", "c"];
        let mut rows = Vec::new();
        for p in 0..40 {
            let diseased = p >= 12;
            let stage = if diseased { 1 + p % 3 } else { 0 };
            for (b, name) in names.iter().enumerate() {
                let affected = diseased && stage >= b + 1;
                let x = if affected { theta.sample(&mut rng) } else { phi.sample(&mut rng) };
                rows.push(MeasurementRow {
                    participant: format!("P{p}"),
                    biomarker: name.to_string(),
                    measurement: x,
                    diseased,
                });
            }
        }
        ParticipantTable::from_rows(rows).expect("synthetic table is valid")
    }

    fn settings(algorithm: &str, iterations: usize) -> SamplerConfig {
        SamplerConfig {
            algorithm: algorithm.to_string(),
            iterations,
            burn_in: iterations / 2,
            thinning: 1,
            ..SamplerConfig::default()
        }
    }

    #[test]
    fn improvements_never_consult_the_rng() {
        assert!(accept(0.5, &mut PanickingRng));
        assert!(accept(f64::INFINITY, &mut PanickingRng));
    }

    #[test]
    fn worsening_moves_are_accepted_at_the_metropolis_rate() {
        let mut rng = StdRng::seed_from_u64(17);
        let trials = 20_000;
        let accepted = (0..trials).filter(|_| accept((0.25f64).ln(), &mut rng)).count();
        let rate = accepted as f64 / trials as f64;
        assert!((rate - 0.25).abs() < 0.02, "rate {rate}");
        assert!(!accept(f64::NEG_INFINITY, &mut rng));
        assert!(!accept(f64::NAN, &mut rng));
    }

    #[test]
    fn traces_have_one_entry_per_iteration() {
        let table = synthetic_table(1);
        let mut rng = StdRng::seed_from_u64(2);
        let config = settings("conjugate_priors", 37);
        let model = ConjugatePrior { prior_n: 1.0, prior_v: 1.0 };
        let out = run_sampler(&table, &model, &config, &mut rng, &mut NoopChainProgress);
        assert_eq!(out.accepted_orders.len(), 37);
        assert_eq!(out.ln_likelihoods.len(), 37);
        assert_eq!(out.ln_likelihoods[0], f64::NEG_INFINITY);
        assert!(out.acceptance_count >= 1);
        assert!(out.accepted_orders.iter().all(|o| o.is_bijection() && o.len() == 3));
        assert_eq!(out.accepted_orders.last(), Some(&out.final_order));
        assert_eq!(out.final_stage_post.len(), 28);
    }

    #[test]
    fn baseline_never_replaces_default_parameters() {
        let table = synthetic_table(3);
        let mut rng = StdRng::seed_from_u64(4);
        let out = run_sampler(
            &table,
            &FixedClustering,
            &settings("hard_kmeans", 30),
            &mut rng,
            &mut NoopChainProgress,
        );
        assert_eq!(*out.final_params, *initial_gaussian(&table));
    }

    #[test]
    fn same_seed_reproduces_the_chain() {
        let table = synthetic_table(5);
        let config = settings("kde", 20);
        let run = |seed| {
            let mut rng = StdRng::seed_from_u64(seed);
            sample_orders(&table, &config, &mut rng, &mut NoopChainProgress).unwrap()
        };
        let (first, second) = (run(11), run(11));
        assert_eq!(first.accepted_orders, second.accepted_orders);
        assert_eq!(first.ln_likelihoods, second.ln_likelihoods);
        assert_eq!(first.algorithm, LikelihoodKind::Kde);
        assert_eq!(first.parameters.len(), 3);
    }

    #[test]
    fn every_model_runs_through_dispatch() {
        let table = synthetic_table(7);
        for kind in LikelihoodKind::ALL {
            let mut rng = StdRng::seed_from_u64(8);
            let outcome =
                sample_orders(&table, &settings(kind.name(), 15), &mut rng, &mut NoopChainProgress)
                    .unwrap();
            assert_eq!(outcome.algorithm, kind);
            assert!(outcome.final_ln_likelihood.is_finite(), "{kind} gave a non-finite score");
        }
    }

    #[test]
    fn unknown_model_fails_before_sampling() {
        let table = synthetic_table(9);
        let mut rng = StdRng::seed_from_u64(10);
        let err = sample_orders(&table, &settings("svm", 10), &mut rng, &mut NoopChainProgress)
            .unwrap_err();
        assert!(matches!(err, ConfigError::UnknownLikelihoodModel(_)));
    }
}
