//! # Run Configuration
//!
//! Settings for one chain and for where its results go. Both structs
//! round-trip through TOML; every field has a default so a configuration file
//! only needs to name what it changes.

use crate::likelihood::LikelihoodKind;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read or write configuration file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse TOML configuration: {0}")]
    TomlParseError(#[from] toml::de::Error),

    #[error("Failed to serialize configuration to TOML format: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),

    #[error(
        "Unknown likelihood model '{0}'. Expected one of: hard_kmeans, conjugate_priors, mle, em, kde."
    )]
    UnknownLikelihoodModel(String),

    #[error("Invalid value for '{name}': {reason}")]
    InvalidSetting { name: &'static str, reason: String },

    #[error("burn_in ({burn_in}) must be smaller than iterations ({iterations}).")]
    BurnInTooLong { burn_in: usize, iterations: usize },
}

/// Largest seed that can be written back to TOML, whose integers are `i64`.
pub const MAX_SEED: u64 = i64::MAX as u64;

/// Settings of a single Metropolis-Hastings chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    /// Likelihood model name; see [`LikelihoodKind`].
    pub algorithm: String,
    pub iterations: usize,
    /// Pairwise swaps per proposal.
    pub n_shuffle: usize,
    pub burn_in: usize,
    pub thinning: usize,
    /// Prior pseudo-count for the mean (conjugate priors only).
    pub prior_n: f64,
    /// Prior degrees of freedom for the variance (conjugate priors only).
    pub prior_v: f64,
    /// Mean absolute weight change below which a KDE is reused.
    pub weight_change_threshold: f64,
    /// Chain seed, at most [`MAX_SEED`]; drawn from OS entropy when absent.
    pub seed: Option<u64>,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            algorithm: LikelihoodKind::ConjugatePriors.name().to_string(),
            iterations: 2000,
            n_shuffle: 2,
            burn_in: 1000,
            thinning: 50,
            prior_n: 1.0,
            prior_v: 1.0,
            weight_change_threshold: 0.01,
            seed: None,
        }
    }
}

fn positive(name: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(ConfigError::InvalidSetting {
            name,
            reason: format!("must be a finite positive number, got {value}"),
        })
    }
}

fn representable_seed(seed: Option<u64>) -> Result<(), ConfigError> {
    match seed {
        Some(seed) if seed > MAX_SEED => Err(ConfigError::InvalidSetting {
            name: "seed",
            reason: format!("must be at most {MAX_SEED}, got {seed}"),
        }),
        _ => Ok(()),
    }
}

fn at_least_one(name: &'static str, value: usize) -> Result<(), ConfigError> {
    if value >= 1 {
        Ok(())
    } else {
        Err(ConfigError::InvalidSetting {
            name,
            reason: "must be at least 1".to_string(),
        })
    }
}

impl SamplerConfig {
    /// Checks every setting and resolves the likelihood model.
    pub fn validate(&self) -> Result<LikelihoodKind, ConfigError> {
        let kind: LikelihoodKind = self.algorithm.parse()?;
        at_least_one("iterations", self.iterations)?;
        at_least_one("n_shuffle", self.n_shuffle)?;
        at_least_one("thinning", self.thinning)?;
        if self.burn_in >= self.iterations {
            return Err(ConfigError::BurnInTooLong {
                burn_in: self.burn_in,
                iterations: self.iterations,
            });
        }
        representable_seed(self.seed)?;
        positive("prior_n", self.prior_n)?;
        positive("prior_v", self.prior_v)?;
        if !(self.weight_change_threshold.is_finite() && self.weight_change_threshold >= 0.0) {
            return Err(ConfigError::InvalidSetting {
                name: "weight_change_threshold",
                reason: format!(
                    "must be a finite non-negative number, got {}",
                    self.weight_change_threshold
                ),
            });
        }
        Ok(kind)
    }
}

/// Sampler settings plus output placement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Results go under `<output_dir>/<algorithm>/`.
    pub output_dir: PathBuf,
    /// Prepended to every output file name.
    pub prefix: String,
    pub sampler: SamplerConfig,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("."),
            prefix: String::new(),
            sampler: SamplerConfig::default(),
        }
    }
}

impl RunConfig {
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        representable_seed(self.sampler.seed)?;
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let toml_string = self.to_toml()?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let toml_string = fs::read_to_string(path)?;
        let config = toml::from_str(&toml_string)?;
        Ok(config)
    }
}
