// ========================================================================================
//
//                      THE COMMAND-LINE ENTRY POINT: EVENTORDER
//
// ========================================================================================
//
// This binary wires the library's run pipeline to the command line. It owns the
// process-wide resources (the logger, the rayon thread pool and the terminal progress
// bar), resolves the effective configuration from an optional TOML file plus flag
// overrides, and reports any failure as a single `Error: ...` line with exit status 1.

use clap::{Args, CommandFactory, Parser, Subcommand};
use eventorder::config::{MAX_SEED, RunConfig};
use eventorder::progress::{ChainProgressObserver, RunPhase};
use eventorder::run::{load_true_order, run_ebm};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::io::IsTerminal;
use std::path::PathBuf;
use std::process;

// ========================================================================================
//                         COMMAND-LINE INTERFACE DEFINITION
// ========================================================================================

#[derive(Parser)]
#[command(
    name = "eventorder",
    version,
    about = "Infer the order in which biomarkers become abnormal during disease progression",
    long_about = "Runs a Metropolis-Hastings chain over biomarker orderings on cross-sectional \
                 measurements, re-estimating the pre-event and post-event distributions of \
                 every biomarker along the way."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one chain on a long-format measurement CSV
    Run(RunArgs),
    /// Print the default run configuration as TOML
    DefaultConfig,
}

#[derive(Args)]
struct RunArgs {
    /// CSV with participant,biomarker,measurement,diseased columns
    #[arg(value_name = "DATA_CSV")]
    data: PathBuf,

    /// TOML run configuration; flags below override its values
    #[arg(long)]
    config: Option<PathBuf>,

    /// Likelihood model: hard_kmeans, conjugate_priors, mle, em or kde
    #[arg(long)]
    algorithm: Option<String>,

    #[arg(long)]
    iterations: Option<usize>,

    /// Pairwise swaps per proposal
    #[arg(long)]
    n_shuffle: Option<usize>,

    #[arg(long)]
    burn_in: Option<usize>,

    #[arg(long)]
    thinning: Option<usize>,

    #[arg(long, value_parser = clap::value_parser!(u64).range(..=MAX_SEED))]
    seed: Option<u64>,

    #[arg(long)]
    prior_n: Option<f64>,

    #[arg(long)]
    prior_v: Option<f64>,

    /// Mean absolute KDE weight change below which a KDE is reused
    #[arg(long)]
    weight_change_threshold: Option<f64>,

    /// TOML table of `biomarker = stage` to compare the inferred orders against
    #[arg(long)]
    true_order: Option<PathBuf>,

    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Prefix for every output file name
    #[arg(long)]
    prefix: Option<String>,

    /// Worker threads for likelihood evaluation (default: all cores)
    #[arg(long)]
    threads: Option<usize>,
}

// ========================================================================================
//                                   PROGRESS REPORTING
// ========================================================================================

fn create_progress_bar(len: u64, message: &str) -> ProgressBar {
    let draw_target = if std::io::stderr().is_terminal() {
        ProgressDrawTarget::stderr_with_hz(20)
    } else {
        ProgressDrawTarget::hidden()
    };

    let pb = ProgressBar::with_draw_target(Some(len), draw_target);
    if let Ok(style) = ProgressStyle::with_template(
        "\n> [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
    ) {
        pb.set_style(style.progress_chars("█▉▊▋▌▍▎▏  "));
    }
    pb.set_message(message.to_string());

    pb
}

#[derive(Default)]
struct ConsoleProgress {
    bar: Option<ProgressBar>,
}

impl ChainProgressObserver for ConsoleProgress {
    fn on_start(&mut self, phase: RunPhase, total: usize) {
        self.bar = Some(create_progress_bar(total as u64, phase.describe()));
    }

    fn on_iteration(&mut self, completed: usize, acceptance_ratio: f64, ln_likelihood: f64) {
        if let Some(bar) = &self.bar {
            bar.set_position(completed as u64);
            if completed % 10 == 0 {
                bar.set_message(format!(
                    "acceptance {:.1}% | ln L {:.2}",
                    100.0 * acceptance_ratio,
                    ln_likelihood
                ));
            }
        }
    }

    fn on_finish(&mut self, _phase: RunPhase) {
        if let Some(bar) = self.bar.take() {
            bar.finish_and_clear();
        }
    }
}

// ========================================================================================
//                                   COMMAND HANDLERS
// ========================================================================================

fn resolve_config(args: &RunArgs) -> Result<RunConfig, Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => RunConfig::load(path)?,
        None => RunConfig::default(),
    };
    let sampler = &mut config.sampler;
    if let Some(algorithm) = &args.algorithm {
        sampler.algorithm = algorithm.clone();
    }
    if let Some(v) = args.iterations {
        sampler.iterations = v;
    }
    if let Some(v) = args.n_shuffle {
        sampler.n_shuffle = v;
    }
    if let Some(v) = args.burn_in {
        sampler.burn_in = v;
    }
    if let Some(v) = args.thinning {
        sampler.thinning = v;
    }
    if args.seed.is_some() {
        sampler.seed = args.seed;
    }
    if let Some(v) = args.prior_n {
        sampler.prior_n = v;
    }
    if let Some(v) = args.prior_v {
        sampler.prior_v = v;
    }
    if let Some(v) = args.weight_change_threshold {
        sampler.weight_change_threshold = v;
    }
    if let Some(dir) = &args.output_dir {
        config.output_dir = dir.clone();
    }
    if let Some(prefix) = &args.prefix {
        config.prefix = prefix.clone();
    }
    Ok(config)
}

fn run(args: RunArgs) -> Result<(), Box<dyn std::error::Error>> {
    let threads = args.threads.unwrap_or_else(num_cpus::get).max(1);
    rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .build_global()?;
    log::debug!("Using {threads} worker threads");

    let config = resolve_config(&args)?;
    config.sampler.validate()?;
    let true_order = args.true_order.as_ref().map(load_true_order).transpose()?;

    let mut progress = ConsoleProgress::default();
    let artifacts = run_ebm(&args.data, &config, true_order.as_ref(), &mut progress)?;

    let results = &artifacts.results;
    eprintln!("> Most likely order: {:?}", results.most_likely_order);
    eprintln!(
        "> Highest log-likelihood ({:.4}) order: {:?}",
        results.max_ln_likelihood, results.order_with_highest_ln_likelihood
    );
    if let (Some(tau), Some(p)) = (results.kendalls_tau_most_likely, results.p_value_most_likely) {
        eprintln!("> Kendall's tau (most likely vs. true): {tau:.4} (p = {p:.3e})");
    }
    eprintln!("> Results: {}", artifacts.results_path.display());
    eprintln!("> Trace: {}", artifacts.trace_path.display());
    eprintln!("> Stage probabilities: {}", artifacts.heatmap_path.display());
    Ok(())
}

fn print_default_config() -> Result<(), Box<dyn std::error::Error>> {
    print!("{}", RunConfig::default().to_toml()?);
    Ok(())
}

// ========================================================================================
//                                         MAIN
// ========================================================================================

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let Cli { command } = Cli::parse();
    let result = match command {
        Some(Commands::Run(args)) => run(args),
        Some(Commands::DefaultConfig) => print_default_config(),
        None => Cli::command().print_help().map_err(Into::into),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}
