//! Proposals: pluggable state mutations with an adaptive tuning parameter.
//!
//! A proposal edits the slots it declared, through a [`ProposalContext`],
//! and returns the log Hastings ratio of the move. Returning `-inf` marks
//! the move invalid; `+inf` marks a Gibbs move that is always accepted.

pub mod operators;

pub use operators::{BitFlipProposal, IntRandomWalkProposal, RandomWalkProposal, ScaleProposal, UniformProposal};

use rand_chacha::ChaCha8Rng;

use crate::error::SamplingError;
use crate::schedule::ProposalStats;
use crate::state::{EditHandle, SlotId, SlotValue, StateStore};

/// The random stream shared by everything in a chain.
pub type ChainRng = ChaCha8Rng;

/// Default target acceptance probability for adaptive proposals.
pub const DEFAULT_TARGET_ACCEPTANCE: f64 = 0.234;

/// A move on the model state.
pub trait Proposal: Send {
    /// Stable identity, used in reports and checkpoints.
    fn id(&self) -> &str;

    /// Relative selection weight (non-negative).
    fn weight(&self) -> f64;

    /// Names of the slots this proposal may edit.
    fn slots(&self) -> &[String];

    /// Mutates the state and returns the log Hastings ratio.
    ///
    /// `Err` is reserved for programming errors (editing an undeclared slot,
    /// writing the wrong element type); an impossible move returns
    /// `Ok(f64::NEG_INFINITY)`.
    fn propose(&mut self, ctx: &mut ProposalContext<'_>) -> Result<f64, SamplingError>;

    /// Current tuning parameter, or `None` if the proposal is not adaptive.
    fn tuning(&self) -> Option<f64> {
        None
    }

    /// Overwrites the tuning parameter (checkpoint restore).
    fn set_tuning(&mut self, _value: f64) {}

    /// Nudges the tuning parameter by `delta`, already scaled by the
    /// scheduler's decreasing step size.
    fn optimize(&mut self, _delta: f64) {}

    /// Acceptance rate the tuning aims for.
    fn target_acceptance(&self) -> f64 {
        DEFAULT_TARGET_ACCEPTANCE
    }

    /// Whether the driver must re-check dirtiness before evaluating the posterior.
    fn requires_state_initialisation(&self) -> bool {
        true
    }

    /// Advice for the operator report, given the proposal's statistics.
    fn performance_suggestion(&self, _stats: &ProposalStats) -> Option<String> {
        None
    }
}

/// What a proposal sees while it runs.
pub struct ProposalContext<'a> {
    state: &'a mut StateStore,
    rng: &'a mut ChainRng,
    proposal: &'a str,
    targets: &'a [SlotId],
}

impl<'a> ProposalContext<'a> {
    pub(crate) fn new(
        state: &'a mut StateStore,
        rng: &'a mut ChainRng,
        proposal: &'a str,
        targets: &'a [SlotId],
    ) -> Self {
        Self {
            state,
            rng,
            proposal,
            targets,
        }
    }

    /// The shared random stream.
    pub fn rng(&mut self) -> &mut ChainRng {
        &mut *self.rng
    }

    /// Current state, read only.
    #[must_use]
    pub fn state(&self) -> &StateStore {
        &*self.state
    }

    /// Resolved ids of the declared slots, in declaration order.
    #[must_use]
    pub fn targets(&self) -> &[SlotId] {
        self.targets
    }

    /// The `i`-th declared slot.
    pub fn target(&self, i: usize) -> Result<SlotId, SamplingError> {
        self.targets.get(i).copied().ok_or_else(|| SamplingError::UndeclaredSlot {
            proposal: self.proposal.to_string(),
            slot: format!("#{i}"),
        })
    }

    /// Current value of `slot`.
    #[must_use]
    pub fn value(&self, slot: SlotId) -> &SlotValue {
        self.state.slot(slot).value()
    }

    /// Opens `slot` for writing on behalf of the running proposal.
    pub fn edit(&mut self, slot: SlotId) -> Result<EditHandle<'_>, SamplingError> {
        if !self.targets.contains(&slot) {
            return Err(SamplingError::UndeclaredSlot {
                proposal: self.proposal.to_string(),
                slot: self.state.slot(slot).name().to_string(),
            });
        }
        self.state.begin_edit(slot, self.proposal)
    }
}

/// Classification of a log Hastings ratio.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Hastings {
    /// `-inf` (or NaN): reject without touching the posterior.
    Invalid,
    /// `+inf`: accept unconditionally.
    Gibbs,
    /// Ordinary finite contribution.
    Ratio(f64),
}

impl Hastings {
    /// Sorts a Hastings ratio into its three cases.
    #[must_use]
    pub fn classify(log_hastings: f64) -> Self {
        if log_hastings.is_nan() || log_hastings == f64::NEG_INFINITY {
            Self::Invalid
        } else if log_hastings == f64::INFINITY {
            Self::Gibbs
        } else {
            Self::Ratio(log_hastings)
        }
    }
}

/// Result of one sampling step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// The move was kept.
    Accepted,
    /// The proposal declared the move impossible.
    RejectedInvalid,
    /// The Metropolis-Hastings test (or a `-inf` posterior) rejected the move.
    RejectedByRatio,
}

impl StepOutcome {
    /// Whether the move was kept.
    #[must_use]
    pub const fn is_accepted(self) -> bool {
        matches!(self, Self::Accepted)
    }
}
