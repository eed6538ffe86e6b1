//! # Run Orchestration
//!
//! Loads a measurement table, runs one chain, summarises the trace and
//! writes three artefacts under `<output_dir>/<algorithm>/`:
//!
//! - `results/<prefix><stem>_results.toml`: orderings, Kendall's tau,
//!   acceptance ratio, final parameters and stage posteriors.
//! - `traces/<prefix><stem>_trace.tsv`: the pre-decision log-likelihood of
//!   every iteration.
//! - `heatmaps/<prefix><stem>_stage_probabilities.tsv`: the biomarker by stage
//!   frequency table after burn-in and thinning.

use crate::config::{ConfigError, MAX_SEED, RunConfig};
use crate::data::{DataError, load_measurements};
use crate::ordering::{BiomarkerOrder, OrderError, kendall_tau_test, most_likely_order, stage_probabilities};
use crate::params::BiomarkerReport;
use crate::progress::{ChainProgressObserver, RunPhase};
use crate::sampler::{ChainOutcome, sample_orders};
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RunError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Data error: {0}")]
    Data(#[from] DataError),

    #[error("Ordering error: {0}")]
    Order(#[from] OrderError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to write a result table: {0}")]
    CsvError(#[from] csv::Error),

    #[error("Failed to parse TOML ordering file: {0}")]
    TomlParseError(#[from] toml::de::Error),

    #[error("Failed to serialize results to TOML format: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
}

/// Summary written to the results file.
#[derive(Debug, Clone, Serialize)]
pub struct RunResults {
    pub algorithm: String,
    pub n_iterations: usize,
    pub n_shuffle: usize,
    pub burn_in: usize,
    pub thinning: usize,
    pub seed: u64,
    pub acceptance_ratio: f64,
    pub final_ln_likelihood: f64,
    pub max_ln_likelihood: f64,
    /// Kendall's tau of the highest-likelihood order against the true order.
    pub kendalls_tau_highest_ln_likelihood: Option<f64>,
    pub p_value_highest_ln_likelihood: Option<f64>,
    /// Kendall's tau of the most likely order against the true order.
    pub kendalls_tau_most_likely: Option<f64>,
    pub p_value_most_likely: Option<f64>,
    pub order_with_highest_ln_likelihood: BTreeMap<String, usize>,
    pub most_likely_order: BTreeMap<String, usize>,
    pub true_order: Option<BTreeMap<String, usize>>,
    pub parameters: BTreeMap<String, BiomarkerReport>,
    pub stage_posteriors: BTreeMap<String, Vec<f64>>,
}

/// The summary plus where each artefact was written.
#[derive(Debug, Clone)]
pub struct RunArtifacts {
    pub results: RunResults,
    pub results_path: PathBuf,
    pub trace_path: PathBuf,
    pub heatmap_path: PathBuf,
}

/// Loads a `biomarker = stage` TOML table.
pub fn load_true_order<P: AsRef<Path>>(path: P) -> Result<BTreeMap<String, usize>, RunError> {
    let toml_string = fs::read_to_string(path)?;
    Ok(toml::from_str(&toml_string)?)
}

/// The accepted order paired with the highest post-decision log-likelihood.
///
/// The post-decision value of iteration `i` is the pre-decision value of
/// `i + 1`; the last iteration pairs with the final log-likelihood.
pub fn order_with_highest_ln_likelihood(outcome: &ChainOutcome) -> Option<(&BiomarkerOrder, f64)> {
    let n = outcome.accepted_orders.len();
    let mut best: Option<(usize, f64)> = None;
    for i in 0..n {
        let ln_likelihood = if i + 1 < n {
            outcome.ln_likelihoods[i + 1]
        } else {
            outcome.final_ln_likelihood
        };
        if best.is_none_or(|(_, b)| ln_likelihood > b) {
            best = Some((i, ln_likelihood));
        }
    }
    best.map(|(i, ln_likelihood)| (&outcome.accepted_orders[i], ln_likelihood))
}

fn write_trace(path: &Path, ln_likelihoods: &[f64]) -> Result<(), RunError> {
    let mut writer = csv::WriterBuilder::new().delimiter(b'\t').from_path(path)?;
    writer.write_record(["iteration", "ln_likelihood"])?;
    for (i, ll) in ln_likelihoods.iter().enumerate() {
        writer.write_record([i.to_string(), ll.to_string()])?;
    }
    writer.flush()?;
    Ok(())
}

fn write_stage_probabilities(path: &Path, names: &[String], probabilities: &Array2<f64>) -> Result<(), RunError> {
    let mut writer = csv::WriterBuilder::new().delimiter(b'\t').from_path(path)?;
    let header = std::iter::once("biomarker".to_string())
        .chain((1..=probabilities.ncols()).map(|s| format!("stage_{s}")));
    writer.write_record(header)?;
    for (name, row) in names.iter().zip(probabilities.rows()) {
        let record = std::iter::once(name.clone()).chain(row.iter().map(|p| p.to_string()));
        writer.write_record(record)?;
    }
    writer.flush()?;
    Ok(())
}

fn output_path(dir: &Path, kind: &str, file_name: &str) -> Result<PathBuf, RunError> {
    let dir = dir.join(kind);
    fs::create_dir_all(&dir)?;
    Ok(dir.join(file_name))
}

/// Runs the full pipeline on one measurement file.
pub fn run_ebm<O>(
    data_path: &Path,
    config: &RunConfig,
    true_order: Option<&BTreeMap<String, usize>>,
    progress: &mut O,
) -> Result<RunArtifacts, RunError>
where
    O: ChainProgressObserver + ?Sized,
{
    let sampler_config = &config.sampler;
    let kind = sampler_config.validate()?;

    let table = load_measurements(data_path)?;
    let true_order = true_order
        .map(|named| BiomarkerOrder::from_named(table.biomarkers(), named))
        .transpose()?;

    let seed = sampler_config
        .seed
        .unwrap_or_else(|| rand::thread_rng().gen_range(0..=MAX_SEED));
    log::info!(
        "Running {} for {} iterations (n_shuffle = {}, seed = {})",
        kind,
        sampler_config.iterations,
        sampler_config.n_shuffle,
        seed
    );
    let mut rng = StdRng::seed_from_u64(seed);
    let outcome = sample_orders(&table, sampler_config, &mut rng, progress)?;

    progress.on_start(RunPhase::Writing, 3);
    let names = table.biomarkers();
    let (best_order, max_ln_likelihood) = order_with_highest_ln_likelihood(&outcome)
        .map(|(order, ll)| (order.clone(), ll))
        .unwrap_or_else(|| (outcome.final_order.clone(), outcome.final_ln_likelihood));
    let ml_order = most_likely_order(&outcome.accepted_orders, sampler_config.burn_in, sampler_config.thinning)?;
    let probabilities = stage_probabilities(&outcome.accepted_orders, sampler_config.burn_in, sampler_config.thinning)?;

    let (test_best, test_ml) = match &true_order {
        Some(truth) => (
            Some(kendall_tau_test(&best_order, truth)?),
            Some(kendall_tau_test(&ml_order, truth)?),
        ),
        None => (None, None),
    };
    if let (Some(best), Some(ml)) = (test_best, test_ml) {
        log::info!(
            "Kendall's tau against the true order: {:.4} (p = {:.3e}, highest likelihood), {:.4} (p = {:.3e}, most likely)",
            best.tau,
            best.p_value,
            ml.tau,
            ml.p_value
        );
    }

    let results = RunResults {
        algorithm: kind.name().to_string(),
        n_iterations: sampler_config.iterations,
        n_shuffle: sampler_config.n_shuffle,
        burn_in: sampler_config.burn_in,
        thinning: sampler_config.thinning,
        seed,
        acceptance_ratio: outcome.acceptance_ratio(),
        final_ln_likelihood: outcome.final_ln_likelihood,
        max_ln_likelihood,
        kendalls_tau_highest_ln_likelihood: test_best.map(|t| t.tau),
        p_value_highest_ln_likelihood: test_best.map(|t| t.p_value),
        kendalls_tau_most_likely: test_ml.map(|t| t.tau),
        p_value_most_likely: test_ml.map(|t| t.p_value),
        order_with_highest_ln_likelihood: best_order.to_named(names),
        most_likely_order: ml_order.to_named(names),
        true_order: true_order.as_ref().map(|t| t.to_named(names)),
        parameters: outcome.parameters.clone(),
        stage_posteriors: outcome.final_stage_post.to_named(&table),
    };

    let stem = data_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "data".to_string());
    let base = config.output_dir.join(kind.name());
    let file_stem = format!("{}{}", config.prefix, stem);

    let results_path = output_path(&base, "results", &format!("{file_stem}_results.toml"))?;
    let toml_string = toml::to_string_pretty(&results)?;
    let mut file = BufWriter::new(fs::File::create(&results_path)?);
    file.write_all(toml_string.as_bytes())?;
    file.flush()?;

    let trace_path = output_path(&base, "traces", &format!("{file_stem}_trace.tsv"))?;
    write_trace(&trace_path, &outcome.ln_likelihoods)?;

    let heatmap_path = output_path(&base, "heatmaps", &format!("{file_stem}_stage_probabilities.tsv"))?;
    write_stage_probabilities(&heatmap_path, names, &probabilities)?;
    progress.on_finish(RunPhase::Writing);

    log::info!(
        "Finished: acceptance ratio {:.2}%, results written to {}",
        100.0 * results.acceptance_ratio,
        results_path.display()
    );
    Ok(RunArtifacts {
        results,
        results_path,
        trace_path,
        heatmap_path,
    })
}
