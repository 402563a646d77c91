//! The Metropolis-Hastings driver.
//!
//! A [`Chain`] owns the state, the calculation graph, the scheduler and the
//! random stream. Each iteration snapshots the state, runs one proposal,
//! evaluates the posterior lazily and either commits or rolls back.
//!
//! # Lifecycle
//!
//! ```text
//! Initializing -> Sampling -> (SelfChecking) -> (Checkpointing) -> Sampling -> ... -> Finished
//! ```
//!
//! # Example
//!
//! ```
//! use mhchain::chain::{ChainBuilder, MemoryLogger};
//! use mhchain::graph::{FnCalculation, GraphBuilder, InputView};
//! use mhchain::proposal::RandomWalkProposal;
//! use mhchain::{ChainConfig, StateStore, VersionedSlot};
//!
//! let mut state = StateStore::new();
//! state.add(VersionedSlot::real("mu", vec![0.0]).unwrap()).unwrap();
//! let graph = GraphBuilder::new()
//!     .quantity("prior", &["mu"], FnCalculation::new(|v: &InputView<'_>| -0.5 * v.scalar(0).powi(2)))
//!     .log_density_sum("posterior", &["prior"]);
//!
//! let mut chain = ChainBuilder::new(ChainConfig::with_length(2_000))
//!     .state(state)
//!     .graph(graph)
//!     .proposal(RandomWalkProposal::new("muWalk", "mu", 1.0))
//!     .logger(MemoryLogger::new())
//!     .build()
//!     .unwrap();
//! let summary = chain.run().unwrap();
//! assert_eq!(summary.iterations, 2_000);
//! ```

mod init;
mod logger;

pub use init::{InitContext, Initialiser, UniformInitialiser};
pub use logger::{columns, row, MemoryLogger, SampleLogger, SharedMemoryLogger, TraceLogger};

use std::path::{Path, PathBuf};

use crossbeam_channel::{Receiver, Sender};
use rand::{Rng, SeedableRng};
use tracing::{debug, info, warn};

use crate::checkpoint::Checkpoint;
use crate::config::ChainConfig;
use crate::error::{ChainError, ChainResult, ConfigError, SamplingError};
use crate::graph::{CalcGraph, GraphBuilder, QuantityId};
use crate::proposal::{ChainRng, Hastings, Proposal, StepOutcome};
use crate::schedule::{ProposalReport, Rejection, Scheduler, SubSchedule};
use crate::state::StateStore;

use self::init::InitialiserSet;

/// Name of the posterior quantity unless configured otherwise.
pub const DEFAULT_POSTERIOR: &str = "posterior";

/// Name of the posterior input dropped when sampling from the prior.
pub const LIKELIHOOD_INPUT: &str = "likelihood";

/// Where the driver is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainPhase {
    /// Building the starting state.
    Initializing,
    /// Running iterations.
    Sampling,
    /// Recomputing the posterior from scratch.
    SelfChecking,
    /// Writing a checkpoint.
    Checkpointing,
    /// Done, normally or after a stop request.
    Finished,
}

/// Requests a graceful stop from another thread.
///
/// The chain finishes the current iteration, closes its loggers and writes
/// a final checkpoint.
#[derive(Debug, Clone)]
pub struct StopHandle {
    tx: Sender<()>,
}

impl StopHandle {
    /// Asks the chain to stop after the current iteration.
    pub fn request_stop(&self) {
        // A full channel means a stop is already pending.
        let _ = self.tx.try_send(());
    }
}

/// Outcome of [`Chain::run`].
#[derive(Debug, Clone)]
pub struct ChainSummary {
    /// Completed iterations, counting those done before a resume.
    pub iterations: u64,
    /// Iteration the run started at (non-zero after a resume).
    pub started_at: u64,
    /// True if a [`StopHandle`] ended the run early.
    pub stopped: bool,
    /// Incrementally maintained log posterior at the end of the run.
    pub log_density: f64,
    /// Self-check corrections during this run.
    pub corrections: usize,
    /// Per-proposal statistics.
    pub proposals: Vec<ProposalReport>,
    /// Operator table, as printed at the end of a run.
    pub report: String,
}

/// Result of one iteration.
#[derive(Debug, Clone, Copy)]
pub struct StepResult {
    /// Scheduler index of the proposal that ran.
    pub proposal: usize,
    /// What happened to the proposed move.
    pub outcome: StepOutcome,
    /// Log acceptance ratio; `-inf` for impossible moves.
    pub log_alpha: f64,
}

/// Assembles a [`Chain`].
pub struct ChainBuilder {
    config: ChainConfig,
    state: StateStore,
    graph: GraphBuilder,
    posterior: String,
    proposals: Vec<Box<dyn Proposal>>,
    sub_schedules: Vec<SubSchedule>,
    initialisers: Vec<Box<dyn Initialiser>>,
    loggers: Vec<Box<dyn SampleLogger>>,
    checkpoint_path: Option<PathBuf>,
}

impl ChainBuilder {
    /// Starts a builder with `config`.
    #[must_use]
    pub fn new(config: ChainConfig) -> Self {
        Self {
            config,
            state: StateStore::new(),
            graph: GraphBuilder::new(),
            posterior: DEFAULT_POSTERIOR.to_string(),
            proposals: Vec::new(),
            sub_schedules: Vec::new(),
            initialisers: Vec::new(),
            loggers: Vec::new(),
            checkpoint_path: None,
        }
    }

    /// Model state the chain samples.
    #[must_use]
    pub fn state(mut self, state: StateStore) -> Self {
        self.state = state;
        self
    }

    /// Quantities that compute the posterior.
    #[must_use]
    pub fn graph(mut self, graph: GraphBuilder) -> Self {
        self.graph = graph;
        self
    }

    /// Name of the quantity the chain samples from.
    #[must_use]
    pub fn posterior(mut self, name: impl Into<String>) -> Self {
        self.posterior = name.into();
        self
    }

    /// Adds a proposal to the schedule.
    #[must_use]
    pub fn proposal(mut self, proposal: impl Proposal + 'static) -> Self {
        self.proposals.push(Box::new(proposal));
        self
    }

    /// Adds an already boxed proposal.
    #[must_use]
    pub fn boxed_proposal(mut self, proposal: Box<dyn Proposal>) -> Self {
        self.proposals.push(proposal);
        self
    }

    /// Groups proposals matching a pattern under one weight.
    #[must_use]
    pub fn sub_schedule(mut self, sub: SubSchedule) -> Self {
        self.sub_schedules.push(sub);
        self
    }

    /// Adds an initialiser for the starting state.
    #[must_use]
    pub fn initialiser(mut self, init: impl Initialiser + 'static) -> Self {
        self.initialisers.push(Box::new(init));
        self
    }

    /// Adds a sample logger.
    #[must_use]
    pub fn logger(mut self, logger: impl SampleLogger + 'static) -> Self {
        self.loggers.push(Box::new(logger));
        self
    }

    /// File the chain checkpoints to.
    #[must_use]
    pub fn checkpoint(mut self, path: impl Into<PathBuf>) -> Self {
        self.checkpoint_path = Some(path.into());
        self
    }

    /// Validates the configuration and wires everything together.
    pub fn build(self) -> ChainResult<Chain> {
        let config = self.config.validate()?;
        let state = self.state;

        let mut graph_builder = self.graph;
        if config.sample_from_prior {
            graph_builder = graph_builder.exclude_input(&self.posterior, LIKELIHOOD_INPUT);
        }
        let mut graph = graph_builder.build(&state)?;
        let posterior = graph.lookup(&self.posterior).ok_or_else(|| ConfigError::MissingField {
            field: format!("posterior quantity '{}'", self.posterior),
        })?;

        if self.proposals.is_empty() {
            return Err(ConfigError::NoProposals.into());
        }
        let mut scheduler = Scheduler::from_config(&config);
        for p in self.proposals {
            scheduler.add_proposal(p)?;
        }
        for sub in self.sub_schedules {
            scheduler.add_sub_schedule(sub)?;
        }
        scheduler.bind(&state)?;

        let initialisers = InitialiserSet::bind(self.initialisers, &state)?;
        warn_dead_state(&state, &scheduler, &mut graph, posterior);

        let (tx, rx) = crossbeam_channel::bounded(1);
        let rng = ChainRng::seed_from_u64(config.seed);
        Ok(Chain {
            config,
            state,
            graph,
            posterior,
            scheduler,
            initialisers,
            loggers: self.loggers,
            checkpoint_path: self.checkpoint_path,
            rng,
            phase: ChainPhase::Initializing,
            log_p: f64::NAN,
            corrections: 0,
            next_iteration: 0,
            resumed: false,
            stop_tx: tx,
            stop_rx: rx,
        })
    }
}

fn warn_dead_state(state: &StateStore, scheduler: &Scheduler, graph: &mut CalcGraph, posterior: QuantityId) {
    for slot in state.slots() {
        let proposed = (0..scheduler.len()).any(|i| scheduler.targets(i).contains(&slot.id()));
        if !proposed {
            warn!(slot = slot.name(), "no proposal operates on this slot; it will never change");
        }
        if !graph.reaches(slot.id(), posterior) {
            warn!(slot = slot.name(), "slot does not affect the posterior");
        }
    }
}

/// A configured Markov chain.
pub struct Chain {
    config: ChainConfig,
    state: StateStore,
    graph: CalcGraph,
    posterior: QuantityId,
    scheduler: Scheduler,
    initialisers: InitialiserSet,
    loggers: Vec<Box<dyn SampleLogger>>,
    checkpoint_path: Option<PathBuf>,
    rng: ChainRng,
    phase: ChainPhase,
    /// Incrementally maintained log posterior of the current state.
    log_p: f64,
    corrections: usize,
    next_iteration: u64,
    resumed: bool,
    stop_tx: Sender<()>,
    stop_rx: Receiver<()>,
}

impl std::fmt::Debug for Chain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chain")
            .field("phase", &self.phase)
            .field("next_iteration", &self.next_iteration)
            .field("log_p", &self.log_p)
            .field("scheduler", &self.scheduler)
            .finish_non_exhaustive()
    }
}

impl Chain {
    /// Run configuration.
    #[must_use]
    pub fn config(&self) -> &ChainConfig {
        &self.config
    }

    /// Current lifecycle phase.
    #[must_use]
    pub const fn phase(&self) -> ChainPhase {
        self.phase
    }

    /// Model state.
    #[must_use]
    pub fn state(&self) -> &StateStore {
        &self.state
    }

    /// Calculation graph.
    #[must_use]
    pub fn graph(&self) -> &CalcGraph {
        &self.graph
    }

    /// Proposal schedule and statistics.
    #[must_use]
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Log posterior of the current state, as maintained by the chain.
    #[must_use]
    pub const fn log_density(&self) -> f64 {
        self.log_p
    }

    /// Index of the next iteration to run.
    #[must_use]
    pub const fn next_iteration(&self) -> u64 {
        self.next_iteration
    }

    /// Handle that stops this chain from another thread.
    #[must_use]
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            tx: self.stop_tx.clone(),
        }
    }

    /// Loads a checkpoint; the next [`Chain::run`] continues from it.
    ///
    /// Slot values, proposal tuning and counters, and the random stream are
    /// restored. The posterior is recomputed, never read from the file.
    pub fn resume_from(&mut self, path: &Path) -> ChainResult<()> {
        let ckpt = Checkpoint::read(path)?;
        if ckpt.completed > self.config.chain_length {
            return Err(ConfigError::CheckpointMismatch {
                reason: format!(
                    "checkpoint has {} completed iterations but the chain is only {} long",
                    ckpt.completed, self.config.chain_length
                ),
            }
            .into());
        }
        ckpt.apply_slots(&mut self.state)?;
        self.scheduler.restore_records(&ckpt.proposals)?;
        self.rng = ckpt.rng.restore()?;
        self.next_iteration = ckpt.completed;
        self.resumed = true;
        self.log_p = self.graph.robust_log_density(&mut self.state, self.posterior);
        warn!(
            path = %path.display(),
            completed = ckpt.completed,
            log_density = self.log_p,
            "resuming chain from checkpoint; initialisers are skipped"
        );
        Ok(())
    }

    /// Runs the remaining iterations.
    pub fn run(&mut self) -> ChainResult<ChainSummary> {
        let started_at = self.next_iteration;
        self.phase = ChainPhase::Initializing;
        if self.resumed {
            self.check_start()?;
        } else {
            self.initialise()?;
        }
        info!(
            chain_length = self.config.chain_length,
            start = started_at,
            log_density = self.log_p,
            "start likelihood"
        );

        let cols = columns(self.graph.name(self.posterior), &self.state);
        for logger in &mut self.loggers {
            logger.init(&cols, self.resumed)?;
        }

        let corrections_before = self.corrections;
        let mut stopped = false;
        self.phase = ChainPhase::Sampling;
        while self.next_iteration < self.config.chain_length {
            let iteration = self.next_iteration;
            self.iterate(iteration)?;
            self.next_iteration = iteration + 1;

            if let Some(every) = self.config.checkpoint_interval() {
                if self.next_iteration % every == 0 && self.next_iteration < self.config.chain_length {
                    self.write_checkpoint()?;
                }
            }
            if self.stop_rx.try_recv().is_ok() {
                info!(iteration, "stop requested");
                stopped = true;
                break;
            }
        }

        for logger in &mut self.loggers {
            logger.close()?;
        }
        self.write_checkpoint()?;
        self.phase = ChainPhase::Finished;

        let report = self.scheduler.report();
        info!(
            iterations = self.next_iteration,
            log_density = self.log_p,
            "chain finished\n{report}"
        );
        Ok(ChainSummary {
            iterations: self.next_iteration,
            started_at,
            stopped,
            log_density: self.log_p,
            corrections: self.corrections - corrections_before,
            proposals: self.scheduler.summary(),
            report,
        })
    }

    /// Finds a starting state with a finite posterior.
    fn initialise(&mut self) -> ChainResult<()> {
        self.state.set_everything_dirty(true);
        let attempts = self.config.num_init_attempts;
        let mut best = f64::NEG_INFINITY;
        let mut made = 0;
        for attempt in 1..=attempts {
            made = attempt;
            self.initialisers.run(&mut self.state, &mut self.rng)?;
            self.log_p = self.graph.robust_log_density(&mut self.state, self.posterior);
            best = best.max(self.log_p);
            if self.log_p.is_finite() {
                if attempt > 1 {
                    info!(attempt, log_density = self.log_p, "found a finite starting state");
                }
                return Ok(());
            }
            if self.log_p == f64::INFINITY {
                break;
            }
            if self.initialisers.is_empty() {
                // Nothing would change on a retry.
                break;
            }
            debug!(attempt, log_density = self.log_p, "starting state has no finite posterior");
        }
        Err(SamplingError::InitialisationFailed {
            attempts: made,
            best_log_p: best,
            report: self.graph.report(&self.state, self.posterior),
        }
        .into())
    }

    fn check_start(&self) -> ChainResult<()> {
        if self.log_p.is_finite() {
            Ok(())
        } else {
            Err(SamplingError::InitialisationFailed {
                attempts: 0,
                best_log_p: self.log_p,
                report: self.graph.report(&self.state, self.posterior),
            }
            .into())
        }
    }

    fn iterate(&mut self, iteration: u64) -> ChainResult<()> {
        let step = self.step(iteration)?;

        let burn_in = self.config.burn_in;
        if iteration >= burn_in && (iteration - burn_in) % self.config.log_every == 0 {
            let values = row(self.log_p, &self.state);
            for logger in &mut self.loggers {
                logger.log(iteration - burn_in, &values)?;
            }
        }

        if self.is_self_check_iteration(iteration) {
            self.self_check(iteration, step.proposal)?;
        } else if iteration >= burn_in {
            self.scheduler.optimize(step.proposal, step.log_alpha);
        }
        Ok(())
    }

    fn is_self_check_iteration(&self, iteration: u64) -> bool {
        let debug_window = self.config.debug && iteration < 3 * self.config.debug_sample_count && iteration % 3 == 0;
        debug_window || iteration % self.config.self_check_every == 0
    }

    /// One store, propose, accept-or-restore cycle.
    pub fn step(&mut self, iteration: u64) -> ChainResult<StepResult> {
        self.state.store();
        let index = self
            .scheduler
            .select(&mut self.rng)
            .ok_or(ConfigError::NoProposals)?;
        let before = self.config.debug.then(|| self.state.checksums());

        // Burn-in leaves operator counters and the warm-up counter alone.
        let tally = iteration >= self.config.burn_in;
        let log_hastings = self.scheduler.propose(index, &mut self.state, &mut self.rng)?;
        let (outcome, log_alpha) = match Hastings::classify(log_hastings) {
            Hastings::Invalid => {
                self.state.restore();
                self.graph.restore();
                if tally {
                    self.scheduler.reject(index, Rejection::InvalidProposal);
                }
                (StepOutcome::RejectedInvalid, f64::NEG_INFINITY)
            }
            hastings => {
                if self.scheduler.proposal(index).requires_state_initialisation() {
                    self.graph.check_dirtiness(&self.state);
                }
                let new_log_p = self.graph.log_density(&self.state, self.posterior);
                if new_log_p == f64::INFINITY {
                    return Err(SamplingError::PositiveInfinitePosterior {
                        iteration,
                        proposal: self.scheduler.proposal(index).id().to_string(),
                    }
                    .into());
                }
                let log_alpha = new_log_p - self.log_p + log_hastings;
                let accept = if hastings == Hastings::Gibbs {
                    new_log_p > f64::NEG_INFINITY
                } else {
                    log_alpha >= 0.0
                        || (log_alpha > f64::NEG_INFINITY && self.rng.gen::<f64>() < log_alpha.exp())
                };
                if accept {
                    self.log_p = new_log_p;
                    self.state.accept();
                    self.graph.accept();
                    if tally {
                        self.scheduler.accept(index);
                    }
                    (StepOutcome::Accepted, log_alpha)
                } else {
                    self.state.restore();
                    self.graph.restore();
                    let why = if new_log_p == f64::NEG_INFINITY {
                        Rejection::InvalidPosterior
                    } else {
                        Rejection::ByRatio
                    };
                    if tally {
                        self.scheduler.reject(index, why);
                    }
                    (StepOutcome::RejectedByRatio, log_alpha)
                }
            }
        };

        if let Some(before) = before {
            if !outcome.is_accepted() {
                self.verify_restore(index, &before)?;
            }
        }
        self.state.set_everything_dirty(false);
        debug!(iteration, proposal = index, ?outcome, log_alpha, "step");
        Ok(StepResult {
            proposal: index,
            outcome,
            log_alpha,
        })
    }

    fn verify_restore(&self, index: usize, before: &[blake3::Hash]) -> ChainResult<()> {
        for &id in self.state.changed_slots() {
            let slot = self.state.slot(id);
            if slot.checksum() != before[id.index()] {
                return Err(SamplingError::IncorrectRestore {
                    slot: slot.name().to_string(),
                    proposal: self.scheduler.proposal(index).id().to_string(),
                }
                .into());
            }
        }
        Ok(())
    }

    /// Compares the maintained posterior with a full recomputation.
    fn self_check(&mut self, iteration: u64, proposal: usize) -> ChainResult<()> {
        self.phase = ChainPhase::SelfChecking;
        let robust = self.graph.robust_log_density(&mut self.state, self.posterior);
        let discrepancy = (robust - self.log_p).abs();
        let agrees = discrepancy <= self.config.self_check_tolerance
            || (robust == self.log_p && robust.is_infinite());
        if !agrees {
            self.corrections += 1;
            warn!(
                iteration,
                proposal = self.scheduler.proposal(proposal).id(),
                maintained = self.log_p,
                recomputed = robust,
                discrepancy,
                corrections = self.corrections,
                "posterior incorrectly calculated; correcting"
            );
            if self.corrections > self.config.correction_budget {
                return Err(SamplingError::CorrectionBudgetExceeded {
                    iteration,
                    corrections: self.corrections,
                    discrepancy,
                    proposal: self.scheduler.proposal(proposal).id().to_string(),
                    report: self.graph.report(&self.state, self.posterior),
                }
                .into());
            }
            self.log_p = robust;
        }
        self.phase = ChainPhase::Sampling;
        Ok(())
    }

    fn write_checkpoint(&mut self) -> ChainResult<()> {
        let Some(path) = self.checkpoint_path.clone() else {
            return Ok(());
        };
        let phase = std::mem::replace(&mut self.phase, ChainPhase::Checkpointing);
        let ckpt = Checkpoint::capture(self.next_iteration, &self.state, &self.scheduler, &self.rng);
        let written = ckpt.write_atomic(&path).map_err(ChainError::from);
        self.phase = phase;
        written
    }
}
