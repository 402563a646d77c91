//! Chain configuration.
//!
//! The CLI layer (argument parsing, output naming) lives outside this crate;
//! it only has to hand the driver a validated [`ChainConfig`].

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// How the adaptive step size decays with the number of optimisable visits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimisationTransform {
    /// `1 / n`
    #[default]
    None,
    /// `1 / ln(n + 1)`
    Log,
    /// `1 / sqrt(n)`
    Sqrt,
}

impl OptimisationTransform {
    /// Applies the transform to a visit count.
    #[must_use]
    pub fn apply(self, count: f64) -> f64 {
        match self {
            Self::None => count,
            Self::Log => (count + 1.0).ln(),
            Self::Sqrt => count.sqrt(),
        }
    }
}

/// Settings for one chain run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainConfig {
    /// Total number of iterations.
    pub chain_length: u64,
    /// Iterations at the start of the chain left out of sample logging,
    /// proposal statistics and tuning.
    pub burn_in: u64,
    /// Checkpoint interval; zero or negative disables periodic checkpoints.
    pub store_every: i64,
    /// Attempts to find a starting state with a finite posterior.
    pub num_init_attempts: usize,
    /// Optimisable visits before tuning activates.
    pub auto_optimize_delay: u64,
    /// Whether proposals are tuned at all.
    pub auto_optimize: bool,
    /// Decay of the adaptive step size.
    pub optimisation_transform: OptimisationTransform,
    /// Enables frequent early self-checks and restore validation.
    pub debug: bool,
    /// Early self-checks run every third iteration below `3 * debug_sample_count`.
    pub debug_sample_count: u64,
    /// Regular self-check interval.
    pub self_check_every: u64,
    /// Absolute discrepancy tolerated between cached and robust posterior.
    pub self_check_tolerance: f64,
    /// Corrections allowed before the run is aborted.
    pub correction_budget: usize,
    /// Sample logging cadence.
    pub log_every: u64,
    /// Seed of the shared random stream.
    pub seed: u64,
    /// Drop the `likelihood` term from the posterior.
    pub sample_from_prior: bool,
    /// Report invalid/operator rejection fractions.
    pub detailed_rejection: bool,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            chain_length: 1_000_000,
            burn_in: 0,
            store_every: -1,
            num_init_attempts: 10,
            auto_optimize_delay: 10_000,
            auto_optimize: true,
            optimisation_transform: OptimisationTransform::None,
            debug: false,
            debug_sample_count: 2000,
            self_check_every: 10_000,
            self_check_tolerance: 1e-6,
            correction_budget: 100,
            log_every: 1000,
            seed: 127,
            sample_from_prior: false,
            detailed_rejection: false,
        }
    }
}

impl ChainConfig {
    /// Creates a configuration with the given chain length and defaults otherwise.
    #[must_use]
    pub fn with_length(chain_length: u64) -> Self {
        Self {
            chain_length,
            ..Self::default()
        }
    }

    /// Parses a configuration record from JSON. Missing fields take defaults.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let cfg: Self = serde_json::from_str(json).map_err(|e| ConfigError::InvalidConfig {
            reason: format!("malformed configuration: {e}"),
        })?;
        cfg.validate()
    }

    /// Validate the configuration.
    ///
    /// This must be called before constructing a `Chain`.
    pub fn validate(self) -> Result<Self, ConfigError> {
        if self.chain_length == 0 {
            return Err(invalid("chain_length must be > 0"));
        }
        if self.burn_in >= self.chain_length {
            return Err(invalid(format!(
                "burn_in ({}) must be smaller than chain_length ({})",
                self.burn_in, self.chain_length
            )));
        }
        if self.num_init_attempts == 0 {
            return Err(invalid("num_init_attempts must be > 0"));
        }
        if self.log_every == 0 {
            return Err(invalid("log_every must be > 0"));
        }
        if self.self_check_every == 0 {
            return Err(invalid("self_check_every must be > 0"));
        }
        if !(self.self_check_tolerance.is_finite() && self.self_check_tolerance > 0.0) {
            return Err(invalid(format!(
                "self_check_tolerance must be a positive number (got {})",
                self.self_check_tolerance
            )));
        }
        Ok(self)
    }

    /// Periodic checkpoint interval, if enabled.
    #[must_use]
    pub fn checkpoint_interval(&self) -> Option<u64> {
        u64::try_from(self.store_every).ok().filter(|n| *n > 0)
    }
}

fn invalid(reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidConfig {
        reason: reason.into(),
    }
}
