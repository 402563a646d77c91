//! Error types for mhchain.
//!
//! All errors are strongly typed using thiserror. Configuration problems,
//! runtime sampling failures and persistence failures live in separate
//! enums so callers can tell a broken model from a full disk.
//!
//! Invalid proposals are not errors: they are reported through
//! [`crate::proposal::StepOutcome`] on the hot path.

use thiserror::Error;

/// Configuration errors detected while building or resuming a chain.
///
/// These are fatal and never retried.
#[derive(Debug, Error)]
#[allow(missing_docs)]
pub enum ConfigError {
    #[error("Required field '{field}' is missing")]
    MissingField {
        field: String,
    },

    #[error("Invalid chain configuration: {reason}")]
    InvalidConfig {
        reason: String,
    },

    #[error("Duplicate identifier '{id}'")]
    DuplicateId {
        id: String,
    },

    #[error("Proposal '{proposal}' references slot '{slot}' which is not in the state")]
    UnknownSlot {
        proposal: String,
        slot: String,
    },

    #[error("Quantity '{quantity}' references unknown input '{input}'")]
    UnknownInput {
        quantity: String,
        input: String,
    },

    #[error("Proposal '{proposal}' does not operate on any slot")]
    EmptyProposal {
        proposal: String,
    },

    #[error("At least one proposal is required to run a chain")]
    NoProposals,

    #[error("Calculation graph contains a cycle through '{quantity}'")]
    CyclicGraph {
        quantity: String,
    },

    #[error("Slot '{slot}' is initialised by more than one initialiser")]
    DuplicateInitialiser {
        slot: String,
    },

    #[error("Sample-from-prior requested but {reason}")]
    SampleFromPrior {
        reason: String,
    },

    #[error("Invalid schedule: {reason}")]
    InvalidSchedule {
        reason: String,
    },

    #[error("Cannot resume: {reason}")]
    CheckpointMismatch {
        reason: String,
    },
}

/// Runtime failures of the sampling loop.
///
/// Each of these indicates a bug in a model component or proposal rather
/// than a data problem.
#[derive(Debug, Error)]
#[allow(missing_docs)]
pub enum SamplingError {
    #[error("Slot '{slot}' was edited outside an active edit session")]
    EditOutsideSession {
        slot: String,
    },

    #[error("Proposal '{proposal}' tried to edit slot '{slot}' during a step owned by '{owner}'")]
    ConcurrentEdit {
        proposal: String,
        owner: String,
        slot: String,
    },

    #[error("Proposal '{proposal}' tried to edit slot '{slot}' it does not declare")]
    UndeclaredSlot {
        proposal: String,
        slot: String,
    },

    #[error("Value {value} does not fit slot '{slot}': {reason}")]
    InvalidValue {
        slot: String,
        value: String,
        reason: String,
    },

    #[error(
        "Could not find a proper state to initialise after {attempts} attempts \
         (best log density {best_log_p}). Perhaps try another seed.\n{report}"
    )]
    InitialisationFailed {
        attempts: usize,
        best_log_p: f64,
        report: String,
    },

    #[error(
        "Too many posterior corrections ({corrections}) at iteration {iteration}; \
         last discrepancy {discrepancy} after proposal '{proposal}'.\n{report}"
    )]
    CorrectionBudgetExceeded {
        iteration: u64,
        corrections: usize,
        discrepancy: f64,
        proposal: String,
        report: String,
    },

    #[error("Encountered a positive infinite posterior at iteration {iteration} after proposal '{proposal}'")]
    PositiveInfinitePosterior {
        iteration: u64,
        proposal: String,
    },

    #[error("Slot '{slot}' was incorrectly restored after rejecting proposal '{proposal}'")]
    IncorrectRestore {
        slot: String,
        proposal: String,
    },
}

/// Persistence errors for checkpoints and sample logs.
#[derive(Debug, Error)]
#[allow(missing_docs)]
pub enum PersistenceError {
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Checkpoint is corrupt: {reason}")]
    Corrupt {
        reason: String,
    },

    #[error("Failed to encode checkpoint: {message}")]
    Encode {
        message: String,
    },

    #[error("Sample logger '{logger}' failed: {message}")]
    Logger {
        logger: String,
        message: String,
    },
}

impl PersistenceError {
    /// Wraps an I/O error together with the path it occurred on.
    #[must_use]
    pub fn io(path: impl AsRef<std::path::Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().display().to_string(),
            source,
        }
    }
}

/// Top-level error type for mhchain.
#[derive(Debug, Error)]
pub enum ChainError {
    /// Invalid model, schedule or checkpoint identity.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Failure inside the sampling loop.
    #[error("Sampling error: {0}")]
    Sampling(#[from] SamplingError),

    /// Checkpoint or sample output failure.
    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),
}

impl ChainError {
    /// Returns true if this is a configuration error.
    #[must_use]
    pub const fn is_config(&self) -> bool {
        matches!(self, Self::Config(_))
    }

    /// Returns true if this is a sampling error.
    #[must_use]
    pub const fn is_sampling(&self) -> bool {
        matches!(self, Self::Sampling(_))
    }

    /// Returns true if this is a persistence error.
    #[must_use]
    pub const fn is_persistence(&self) -> bool {
        matches!(self, Self::Persistence(_))
    }

    /// Returns true if the chain state can no longer be trusted.
    ///
    /// A failing sample logger leaves the chain itself intact; the caller
    /// may reopen the output and resume from the last checkpoint.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        !matches!(self, Self::Persistence(PersistenceError::Logger { .. }))
    }
}

/// Result type alias for mhchain operations.
pub type ChainResult<T> = Result<T, ChainError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_unknown_slot() {
        let err = ConfigError::UnknownSlot {
            proposal: "kappaScaler".to_string(),
            slot: "kappa".to_string(),
        };
        let msg = format!("{err}");
        assert!(msg.contains("kappaScaler"));
        assert!(msg.contains("kappa"));
        assert!(msg.contains("not in the state"));
    }

    #[test]
    fn test_sampling_error_budget() {
        let err = SamplingError::CorrectionBudgetExceeded {
            iteration: 12_000,
            corrections: 101,
            discrepancy: 0.5,
            proposal: "rw".to_string(),
            report: String::new(),
        };
        let msg = format!("{err}");
        assert!(msg.contains("101"));
        assert!(msg.contains("12000"));
        assert!(msg.contains("'rw'"));
    }

    #[test]
    fn test_persistence_error_io_keeps_path() {
        let err = PersistenceError::io(
            "/tmp/chain.state",
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        );
        let msg = format!("{err}");
        assert!(msg.contains("/tmp/chain.state"));
        assert!(msg.contains("gone"));
    }

    #[test]
    fn test_chain_error_from_config() {
        let err: ChainError = ConfigError::NoProposals.into();
        assert!(err.is_config());
        assert!(!err.is_sampling());
        assert!(!err.is_persistence());
    }

    #[test]
    fn test_chain_error_from_sampling() {
        let err: ChainError = SamplingError::EditOutsideSession {
            slot: "mu".to_string(),
        }
        .into();
        assert!(err.is_sampling());
        assert!(err.to_string().contains("mu"));
    }

    #[test]
    fn test_chain_error_from_persistence() {
        let err: ChainError = PersistenceError::Corrupt {
            reason: "CRC mismatch".to_string(),
        }
        .into();
        assert!(err.is_persistence());
        assert!(err.is_fatal());
        assert!(err.to_string().contains("CRC mismatch"));

        let err: ChainError = PersistenceError::Logger {
            logger: "trace".to_string(),
            message: "disk full".to_string(),
        }
        .into();
        assert!(!err.is_fatal());
    }
}
