//! Weighted proposal selection, acceptance statistics and adaptive tuning.
//!
//! Selection draws `u ~ U[0, 1)` and returns the first proposal whose
//! cumulative probability exceeds `u`. Sub-schedules claim a share of the
//! selection probability for the proposals whose id matches their pattern.

use std::collections::HashSet;
use std::fmt::Write as _;

use rand::Rng;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::checkpoint::float_text;
use crate::config::{ChainConfig, OptimisationTransform};
use crate::error::{ConfigError, SamplingError};
use crate::proposal::{ChainRng, Proposal, ProposalContext};
use crate::state::{SlotId, StateStore};

/// Per-proposal counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposalStats {
    /// Accepted moves.
    pub accepted: u64,
    /// Rejected moves, for any reason.
    pub rejected: u64,
    /// Acceptances after the adaptation delay; drive the step size.
    pub accepted_for_correction: u64,
    /// Rejections after the adaptation delay.
    pub rejected_for_correction: u64,
    /// Rejections because the proposed posterior was `-inf`, or the move itself was invalid.
    pub rejected_invalid: u64,
    /// Rejections because the proposal returned `-inf` (subset of `rejected_invalid`).
    pub rejected_operator: u64,
}

impl ProposalStats {
    /// Accepted fraction, if the proposal ran at all.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn acceptance_rate(&self) -> Option<f64> {
        let total = self.accepted + self.rejected;
        (total > 0).then(|| self.accepted as f64 / total as f64)
    }
}

/// Why a step was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// Lost the Metropolis-Hastings draw.
    ByRatio,
    /// The proposed state has a `-inf` posterior.
    InvalidPosterior,
    /// The proposal returned `-inf`.
    InvalidProposal,
}

/// A group of proposals that together receive a fixed share of selections.
#[derive(Debug, Clone)]
pub struct SubSchedule {
    name: String,
    weight: f64,
    weight_is_percentage: bool,
    pattern: String,
}

impl SubSchedule {
    /// Competes with the parent's proposals by relative `weight`.
    #[must_use]
    pub fn weighted(name: impl Into<String>, weight: f64, pattern: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            weight,
            weight_is_percentage: false,
            pattern: pattern.into(),
        }
    }

    /// Receives `percentage` percent of all selections.
    #[must_use]
    pub fn percentage(name: impl Into<String>, percentage: f64, pattern: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            weight: percentage,
            weight_is_percentage: true,
            pattern: pattern.into(),
        }
    }
}

/// Persisted statistics of one proposal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposalRecord {
    /// Proposal id.
    pub id: String,
    /// Tuning parameter, if the proposal adapts.
    #[serde(with = "float_text::option")]
    pub tuning: Option<f64>,
    /// Counters.
    #[serde(flatten)]
    pub stats: ProposalStats,
}

/// One row of the operator report.
#[derive(Debug, Clone, PartialEq)]
pub struct ProposalReport {
    /// Proposal id.
    pub id: String,
    /// Tuning parameter, if the proposal adapts.
    pub tuning: Option<f64>,
    /// Counters.
    pub stats: ProposalStats,
    /// Normalised selection probability.
    pub probability: f64,
    /// Hint for a better tuning, if any.
    pub suggestion: Option<String>,
}

struct Entry {
    proposal: Box<dyn Proposal>,
    targets: Vec<SlotId>,
    stats: ProposalStats,
}

/// Owns the proposals of a chain.
pub struct Scheduler {
    entries: Vec<Entry>,
    sub_schedules: Vec<SubSchedule>,
    /// Selection position → entry index. A proposal in several sub-schedules appears more than once.
    table: Vec<usize>,
    normalized: Vec<f64>,
    cumulative: Vec<f64>,
    auto_optimize: bool,
    delay: u64,
    delay_count: u64,
    transform: OptimisationTransform,
    detailed_rejection: bool,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("proposals", &self.entries.iter().map(|e| e.proposal.id()).collect::<Vec<_>>())
            .field("cumulative", &self.cumulative)
            .field("delay_count", &self.delay_count)
            .finish_non_exhaustive()
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::from_config(&ChainConfig::default())
    }
}

impl Scheduler {
    /// Empty schedule using the adaptation settings of `config`.
    #[must_use]
    pub fn from_config(config: &ChainConfig) -> Self {
        Self {
            entries: Vec::new(),
            sub_schedules: Vec::new(),
            table: Vec::new(),
            normalized: Vec::new(),
            cumulative: Vec::new(),
            auto_optimize: config.auto_optimize,
            delay: config.auto_optimize_delay,
            delay_count: 0,
            transform: config.optimisation_transform,
            detailed_rejection: config.detailed_rejection,
        }
    }

    /// Adds a proposal and recomputes the selection table.
    pub fn add_proposal(&mut self, proposal: Box<dyn Proposal>) -> Result<usize, ConfigError> {
        let id = proposal.id().to_string();
        if id.trim().is_empty() {
            return Err(ConfigError::MissingField {
                field: "proposal id".to_string(),
            });
        }
        if self.index_of(&id).is_some() {
            return Err(ConfigError::DuplicateId { id });
        }
        let weight = proposal.weight();
        if !(weight.is_finite() && weight >= 0.0) {
            return Err(ConfigError::InvalidSchedule {
                reason: format!("proposal '{id}' has weight {weight}"),
            });
        }
        self.entries.push(Entry {
            proposal,
            targets: Vec::new(),
            stats: ProposalStats::default(),
        });
        self.reweight()?;
        Ok(self.entries.len() - 1)
    }

    /// Adds a sub-schedule. Its pattern must match at least one proposal
    /// already in the schedule.
    pub fn add_sub_schedule(&mut self, sub: SubSchedule) -> Result<(), ConfigError> {
        self.sub_schedules.push(sub);
        let reweighted = self.reweight();
        if reweighted.is_err() {
            self.sub_schedules.pop();
        }
        reweighted
    }

    /// Resolves every proposal's declared slot names against `state`.
    pub fn bind(&mut self, state: &StateStore) -> Result<(), ConfigError> {
        for entry in &mut self.entries {
            let names = entry.proposal.slots();
            if names.is_empty() {
                return Err(ConfigError::EmptyProposal {
                    proposal: entry.proposal.id().to_string(),
                });
            }
            entry.targets = names
                .iter()
                .map(|name| {
                    state.lookup(name).ok_or_else(|| ConfigError::UnknownSlot {
                        proposal: entry.proposal.id().to_string(),
                        slot: name.clone(),
                    })
                })
                .collect::<Result<_, _>>()?;
        }
        Ok(())
    }

    /// Number of proposals.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no proposal was added.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Index of the proposal called `id`.
    #[must_use]
    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.proposal.id() == id)
    }

    /// Proposal at `index`.
    #[must_use]
    pub fn proposal(&self, index: usize) -> &dyn Proposal {
        self.entries[index].proposal.as_ref()
    }

    /// Counters of the proposal at `index`.
    #[must_use]
    pub fn stats(&self, index: usize) -> &ProposalStats {
        &self.entries[index].stats
    }

    /// Resolved slots of a bound proposal.
    #[must_use]
    pub fn targets(&self, index: usize) -> &[SlotId] {
        &self.entries[index].targets
    }

    /// Optimisable visits counted so far, saturating at the delay.
    #[must_use]
    pub const fn delay_count(&self) -> u64 {
        self.delay_count
    }

    /// Cumulative selection probabilities, one per selection position.
    #[must_use]
    pub fn cumulative(&self) -> &[f64] {
        &self.cumulative
    }

    /// Normalised probability of selecting the proposal at `index`.
    #[must_use]
    pub fn probability(&self, index: usize) -> f64 {
        self.table
            .iter()
            .zip(&self.normalized)
            .filter(|(e, _)| **e == index)
            .map(|(_, w)| *w)
            .sum()
    }

    fn reweight(&mut self) -> Result<(), ConfigError> {
        let mut pct_sum = 0.0;
        let mut sub_weight_sum = 0.0;
        for sub in &self.sub_schedules {
            if sub.weight_is_percentage {
                pct_sum += sub.weight;
            } else {
                sub_weight_sum += sub.weight;
            }
        }
        if pct_sum > 100.0 {
            return Err(ConfigError::InvalidSchedule {
                reason: format!("sub-schedule percentages add up to {pct_sum}%, more than 100%"),
            });
        }

        let mut members: Vec<Vec<usize>> = Vec::with_capacity(self.sub_schedules.len());
        let mut claimed = HashSet::new();
        for sub in &self.sub_schedules {
            let re = Regex::new(&format!("^(?:{})$", sub.pattern)).map_err(|e| ConfigError::InvalidSchedule {
                reason: format!("sub-schedule '{}' has an invalid pattern: {e}", sub.name),
            })?;
            let matched: Vec<usize> = (0..self.entries.len())
                .filter(|i| re.is_match(self.entries[*i].proposal.id()))
                .collect();
            if matched.is_empty() {
                return Err(ConfigError::InvalidSchedule {
                    reason: format!("no proposal matches pattern '{}' of sub-schedule '{}'", sub.pattern, sub.name),
                });
            }
            for i in &matched {
                if !claimed.insert(*i) {
                    warn!(
                        proposal = self.entries[*i].proposal.id(),
                        "proposal is contained in multiple sub-schedules; weighting may not work as expected"
                    );
                }
            }
            members.push(matched);
        }

        let locals: Vec<usize> = (0..self.entries.len()).filter(|i| !claimed.contains(i)).collect();
        let full = (pct_sum - 100.0).abs() < 1e-6;
        if full && !locals.is_empty() {
            return Err(ConfigError::InvalidSchedule {
                reason: "sub-schedule percentages add up to 100%, so the remaining proposals would never run"
                    .to_string(),
            });
        }
        if full && sub_weight_sum > 0.0 {
            return Err(ConfigError::InvalidSchedule {
                reason: "sub-schedule percentages add up to 100%, leaving no share for weighted sub-schedules"
                    .to_string(),
            });
        }

        let weight = |i: usize| self.entries[i].proposal.weight();
        let local_weight: f64 = locals.iter().map(|i| weight(*i)).sum();
        let total = if full {
            100.0
        } else {
            (local_weight + sub_weight_sum) * 100.0 / (100.0 - pct_sum)
        };

        let mut table = Vec::new();
        let mut normalized = Vec::new();
        for i in &locals {
            table.push(*i);
            normalized.push(weight(*i) / total);
        }
        for (sub, matched) in self.sub_schedules.iter().zip(&members) {
            let group: f64 = matched.iter().map(|i| weight(*i)).sum();
            let factor = if sub.weight_is_percentage {
                sub.weight / 100.0 / group
            } else {
                sub.weight / group / total
            };
            for i in matched {
                table.push(*i);
                normalized.push(weight(*i) * factor);
            }
        }

        if !self.entries.is_empty() && !normalized.iter().all(|w| w.is_finite()) {
            return Err(ConfigError::InvalidSchedule {
                reason: "total proposal weight is zero".to_string(),
            });
        }

        let mut acc = 0.0;
        self.cumulative = normalized
            .iter()
            .map(|w| {
                acc += w;
                acc
            })
            .collect();
        self.table = table;
        self.normalized = normalized;
        Ok(())
    }

    /// Picks a proposal index. `None` only for an empty schedule.
    pub fn select(&self, rng: &mut ChainRng) -> Option<usize> {
        let last = self.cumulative.len().checked_sub(1)?;
        let u: f64 = rng.gen();
        let pos = self.cumulative.partition_point(|c| *c <= u).min(last);
        Some(self.table[pos])
    }

    /// Runs the proposal at `index` against the state.
    pub fn propose(&mut self, index: usize, state: &mut StateStore, rng: &mut ChainRng) -> Result<f64, SamplingError> {
        let entry = &mut self.entries[index];
        let id = entry.proposal.id().to_string();
        let mut ctx = ProposalContext::new(state, rng, &id, &entry.targets);
        entry.proposal.propose(&mut ctx)
    }

    fn is_tunable(&self, index: usize) -> bool {
        self.entries[index].proposal.tuning().is_some()
    }

    fn count_visit(&mut self, index: usize) -> bool {
        let past_delay = self.delay_count >= self.delay;
        if self.is_tunable(index) {
            self.delay_count += 1;
        }
        past_delay
    }

    /// Counts an accepted move.
    pub fn accept(&mut self, index: usize) {
        let past_delay = self.count_visit(index);
        let stats = &mut self.entries[index].stats;
        stats.accepted += 1;
        if past_delay {
            stats.accepted_for_correction += 1;
        }
    }

    /// Counts a rejected move.
    pub fn reject(&mut self, index: usize, why: Rejection) {
        let past_delay = self.count_visit(index);
        let stats = &mut self.entries[index].stats;
        stats.rejected += 1;
        match why {
            Rejection::ByRatio => {}
            Rejection::InvalidPosterior => stats.rejected_invalid += 1,
            Rejection::InvalidProposal => {
                stats.rejected_invalid += 1;
                stats.rejected_operator += 1;
            }
        }
        if past_delay {
            stats.rejected_for_correction += 1;
        }
    }

    /// Step-size-scaled change of the tuning parameter of `index`.
    ///
    /// Zero until the adaptation delay has passed or when adaptation is off.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn calc_delta(&self, index: usize, log_alpha: f64) -> f64 {
        if !self.auto_optimize || self.delay_count < self.delay {
            return 0.0;
        }
        let entry = &self.entries[index];
        let target = entry.proposal.target_acceptance();
        let visits = (entry.stats.rejected_for_correction + entry.stats.accepted_for_correction) as f64 + 1.0;
        let count = self.transform.apply(visits);
        let delta = (1.0 / count) * (log_alpha.min(0.0).exp() - target);
        if delta.is_finite() {
            delta
        } else {
            0.0
        }
    }

    /// Lets the proposal at `index` adapt after a step with acceptance `log_alpha`.
    pub fn optimize(&mut self, index: usize, log_alpha: f64) {
        if self.is_tunable(index) {
            let delta = self.calc_delta(index, log_alpha);
            self.entries[index].proposal.optimize(delta);
        }
    }

    /// Report rows, one per proposal.
    #[must_use]
    pub fn summary(&self) -> Vec<ProposalReport> {
        self.entries
            .iter()
            .enumerate()
            .map(|(i, e)| ProposalReport {
                id: e.proposal.id().to_string(),
                tuning: e.proposal.tuning(),
                stats: e.stats,
                probability: self.probability(i),
                suggestion: e.proposal.performance_suggestion(&e.stats),
            })
            .collect()
    }

    /// Human-readable operator table.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn report(&self) -> String {
        let rows = self.summary();
        let name_width = rows.iter().map(|r| r.id.len()).max().unwrap_or(0).max("Operator".len());
        let mut out = String::new();
        let _ = write!(out, "{:<name_width$}", "Operator");
        let mut headers = vec!["Tuning", "#accept", "#reject"];
        if self.detailed_rejection {
            headers.extend(["rej.inv", "rej.op"]);
        }
        headers.extend(["Pr(m)", "Pr(acc|m)"]);
        for h in &headers {
            let _ = write!(out, " {h:>10}");
        }
        out.push('\n');

        for r in &rows {
            let _ = write!(out, "{:<name_width$}", r.id);
            match r.tuning {
                Some(t) => {
                    let _ = write!(out, " {t:>10.5}");
                }
                None => {
                    let _ = write!(out, " {:>10}", "-");
                }
            }
            let _ = write!(out, " {:>10} {:>10}", r.stats.accepted, r.stats.rejected);
            if self.detailed_rejection {
                let rej = r.stats.rejected as f64;
                let _ = write!(
                    out,
                    " {:>10.5} {:>10.5}",
                    r.stats.rejected_invalid as f64 / rej,
                    r.stats.rejected_operator as f64 / rej
                );
            }
            let _ = write!(
                out,
                " {:>10.5} {:>10.5}",
                r.probability,
                r.stats.acceptance_rate().unwrap_or(f64::NAN)
            );
            if let Some(s) = &r.suggestion {
                let _ = write!(out, " {s}");
            }
            out.push('\n');
        }
        out.push('\n');
        for (h, text) in [
            ("Tuning", "The value of the operator's tuning parameter, or '-' if the operator can't be optimized."),
            ("#accept", "The total number of times a proposal by this operator has been accepted."),
            ("#reject", "The total number of times a proposal by this operator has been rejected."),
            ("Pr(m)", "The probability this operator is chosen in a step of the MCMC (i.e. the normalized weight)."),
            ("Pr(acc|m)", "The acceptance probability (#accept as a fraction of the total proposals for this operator)."),
        ] {
            let _ = writeln!(out, " {h:>10}: {text}");
        }
        out
    }

    /// Snapshot for a checkpoint.
    #[must_use]
    pub fn records(&self) -> Vec<ProposalRecord> {
        self.entries
            .iter()
            .map(|e| ProposalRecord {
                id: e.proposal.id().to_string(),
                tuning: e.proposal.tuning(),
                stats: e.stats,
            })
            .collect()
    }

    /// Restores statistics and tuning from a checkpoint.
    ///
    /// The records must match the configured proposals one-for-one. The
    /// adaptation counter is rebuilt from the restored counts of adaptive
    /// proposals.
    pub fn restore_records(&mut self, records: &[ProposalRecord]) -> Result<(), ConfigError> {
        if records.len() != self.entries.len() {
            return Err(ConfigError::CheckpointMismatch {
                reason: format!(
                    "checkpoint has {} proposal(s), the chain has {}",
                    records.len(),
                    self.entries.len()
                ),
            });
        }
        let mut seen = HashSet::new();
        for r in records {
            let index = self.index_of(&r.id).ok_or_else(|| ConfigError::CheckpointMismatch {
                reason: format!("proposal '{}' in checkpoint is not configured", r.id),
            })?;
            if !seen.insert(index) {
                return Err(ConfigError::CheckpointMismatch {
                    reason: format!("proposal '{}' appears twice in checkpoint", r.id),
                });
            }
            let entry = &mut self.entries[index];
            if let Some(t) = r.tuning {
                entry.proposal.set_tuning(t);
            }
            entry.stats = r.stats;
        }
        self.delay_count = self
            .entries
            .iter()
            .filter(|e| e.proposal.tuning().is_some())
            .map(|e| e.stats.accepted + e.stats.rejected)
            .sum();
        Ok(())
    }
}
