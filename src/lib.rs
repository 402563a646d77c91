//! # mhchain - Metropolis-Hastings sampling over versioned model state
//!
//! mhchain drives a Markov chain over a graph of interdependent model
//! quantities. It tracks which pieces of state a proposal changed, lazily
//! recomputes only the quantities downstream of those changes, and commits
//! or rolls back each step transactionally.
//!
//! ## Core Concepts
//!
//! - **VersionedSlot**: one unit of mutable state with a shadow copy and per-element dirty flags
//! - **StateStore**: owns the slots and brokers edit sessions to proposals
//! - **CalcGraph**: cached quantities, recomputed on read when an input changed
//! - **Proposal**: a move on the state returning a log Hastings ratio
//! - **Scheduler**: weighted proposal selection, statistics and adaptive tuning
//! - **Chain**: the sampling loop, with self-checks and checkpoints
//!
//! ## Usage
//!
//! ```rust
//! use mhchain::chain::ChainBuilder;
//! use mhchain::graph::{FnCalculation, GraphBuilder, InputView};
//! use mhchain::proposal::ScaleProposal;
//! use mhchain::{Bounds, ChainConfig, SlotValue, StateStore, VersionedSlot};
//!
//! let mut state = StateStore::new();
//! state.add(VersionedSlot::new("rate", SlotValue::Real(vec![1.0]), Bounds::non_negative())?)?;
//!
//! // Exponential(1) prior on the rate.
//! let graph = GraphBuilder::new()
//!     .quantity("prior", &["rate"], FnCalculation::new(|v: &InputView<'_>| -v.scalar(0)))
//!     .log_density_sum("posterior", &["prior"]);
//!
//! let mut chain = ChainBuilder::new(ChainConfig::with_length(5_000))
//!     .state(state)
//!     .graph(graph)
//!     .proposal(ScaleProposal::new("rateScaler", "rate", 0.75))
//!     .build()?;
//! let summary = chain.run()?;
//! println!("{}", summary.report);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod chain;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod graph;
pub mod proposal;
pub mod schedule;
pub mod state;

// Re-export primary types at crate root for convenience
pub use chain::{Chain, ChainBuilder, ChainPhase, ChainSummary, StopHandle};
pub use checkpoint::Checkpoint;
pub use config::{ChainConfig, OptimisationTransform};
pub use error::{ChainError, ChainResult, ConfigError, PersistenceError, SamplingError};
pub use graph::{CalcGraph, Calculation, GraphBuilder, QuantityId};
pub use proposal::{ChainRng, Proposal, ProposalContext, StepOutcome};
pub use schedule::{ProposalStats, Scheduler, SubSchedule};
pub use state::{Bounds, EditHandle, SlotId, SlotKind, SlotValue, StateStore, VersionedSlot};
