//! Generic proposals over real, integer and boolean slots.

use rand::Rng;
use rand_distr::StandardNormal;

use crate::error::SamplingError;
use crate::schedule::ProposalStats;
use crate::state::{SlotId, SlotValue};

use super::{Proposal, ProposalContext};

/// Identity, declared slot and weight shared by the single-slot proposals.
#[derive(Debug, Clone)]
struct Common {
    id: String,
    slots: Vec<String>,
    weight: f64,
}

impl Common {
    fn new(id: impl Into<String>, slot: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            slots: vec![slot.into()],
            weight: 1.0,
        }
    }
}

fn pick_index(ctx: &mut ProposalContext<'_>, slot: SlotId) -> usize {
    let dim = ctx.value(slot).len();
    ctx.rng().gen_range(0..dim)
}

fn real_at(ctx: &ProposalContext<'_>, slot: SlotId, index: usize) -> Result<f64, SamplingError> {
    let value = ctx.value(slot);
    match value {
        SlotValue::Real(v) => Ok(v[index]),
        other => Err(SamplingError::InvalidValue {
            slot: ctx.state().slot(slot).name().to_string(),
            value: other.to_string(),
            reason: format!("expected real values, found {}", other.kind()),
        }),
    }
}

fn integer_at(ctx: &ProposalContext<'_>, slot: SlotId, index: usize) -> Result<i64, SamplingError> {
    let value = ctx.value(slot);
    match value {
        SlotValue::Integer(v) => Ok(v[index]),
        other => Err(SamplingError::InvalidValue {
            slot: ctx.state().slot(slot).name().to_string(),
            value: other.to_string(),
            reason: format!("expected integer values, found {}", other.kind()),
        }),
    }
}

/// Rounds to three decimals for human-facing suggestions.
fn round3(x: f64) -> f64 {
    (x * 1000.0).round() / 1000.0
}

#[allow(clippy::cast_precision_loss)]
fn acceptance_rate(stats: &ProposalStats) -> Option<f64> {
    let total = stats.accepted + stats.rejected;
    (total > 0).then(|| stats.accepted as f64 / total as f64)
}

/// Multiplies one element (or all of them) by a factor drawn from
/// `[s, 1/s]`.
#[derive(Debug, Clone)]
pub struct ScaleProposal {
    common: Common,
    scale_factor: f64,
    lower: f64,
    upper: f64,
    scale_all: bool,
    optimise: bool,
}

impl ScaleProposal {
    /// `scale_factor` must lie in `(0, 1)`; it is clamped to `[1e-8, 1 - 1e-8]`.
    #[must_use]
    pub fn new(id: impl Into<String>, slot: impl Into<String>, scale_factor: f64) -> Self {
        let mut p = Self {
            common: Common::new(id, slot),
            scale_factor,
            lower: 1e-8,
            upper: 1.0 - 1e-8,
            scale_all: false,
            optimise: true,
        };
        p.set_tuning(scale_factor);
        p
    }

    /// Sets the selection weight.
    #[must_use]
    pub fn with_weight(mut self, weight: f64) -> Self {
        self.common.weight = weight;
        self
    }

    /// Scale every element by the same factor.
    #[must_use]
    pub fn scale_all(mut self) -> Self {
        self.scale_all = true;
        self
    }

    /// Turn off adaptive tuning.
    #[must_use]
    pub fn fixed(mut self) -> Self {
        self.optimise = false;
        self
    }

    /// Limits for the adapted scale factor.
    #[must_use]
    pub fn with_limits(mut self, lower: f64, upper: f64) -> Self {
        self.lower = lower;
        self.upper = upper;
        self.set_tuning(self.scale_factor);
        self
    }

    fn draw_scale(&self, ctx: &mut ProposalContext<'_>) -> f64 {
        let u: f64 = ctx.rng().gen();
        self.scale_factor + u * (1.0 / self.scale_factor - self.scale_factor)
    }
}

impl Proposal for ScaleProposal {
    fn id(&self) -> &str {
        &self.common.id
    }

    fn weight(&self) -> f64 {
        self.common.weight
    }

    fn slots(&self) -> &[String] {
        &self.common.slots
    }

    #[allow(clippy::cast_precision_loss)]
    fn propose(&mut self, ctx: &mut ProposalContext<'_>) -> Result<f64, SamplingError> {
        let slot = ctx.target(0)?;
        let scale = self.draw_scale(ctx);

        if self.scale_all {
            let dim = ctx.value(slot).len();
            let mut edit = ctx.edit(slot)?;
            edit.scale_all(scale)?;
            if !edit.is_within_bounds() {
                return Ok(f64::NEG_INFINITY);
            }
            return Ok((dim as f64 - 2.0) * scale.ln());
        }

        let index = pick_index(ctx, slot);
        let old = real_at(ctx, slot, index)?;
        if old == 0.0 {
            return Ok(f64::NEG_INFINITY);
        }
        let new = scale * old;
        if !ctx.state().slot(slot).bounds().contains(new) {
            return Ok(f64::NEG_INFINITY);
        }
        ctx.edit(slot)?.set_real(index, new)?;
        Ok(-scale.ln())
    }

    fn tuning(&self) -> Option<f64> {
        self.optimise.then_some(self.scale_factor)
    }

    fn set_tuning(&mut self, value: f64) {
        self.scale_factor = value.clamp(self.lower, self.upper);
    }

    fn optimize(&mut self, delta: f64) {
        if self.optimise {
            let delta = delta + (1.0 / self.scale_factor - 1.0).ln();
            self.set_tuning(1.0 / (delta.exp() + 1.0));
        }
    }

    fn performance_suggestion(&self, stats: &ProposalStats) -> Option<String> {
        let prob = acceptance_rate(stats)?;
        let ratio = (prob / self.target_acceptance()).clamp(0.5, 2.0);
        let suggested = self.scale_factor.powf(ratio);
        (!(0.10..=0.40).contains(&prob))
            .then(|| format!("Try setting scale factor to about {}", round3(suggested)))
    }
}

/// Adds a uniform (or Gaussian) offset to one real element.
#[derive(Debug, Clone)]
pub struct RandomWalkProposal {
    common: Common,
    window: f64,
    gaussian: bool,
    optimise: bool,
}

impl RandomWalkProposal {
    /// Uniform random walk of half-width `window`.
    #[must_use]
    pub fn new(id: impl Into<String>, slot: impl Into<String>, window: f64) -> Self {
        Self {
            common: Common::new(id, slot),
            window,
            gaussian: false,
            optimise: true,
        }
    }

    /// Sets the selection weight.
    #[must_use]
    pub fn with_weight(mut self, weight: f64) -> Self {
        self.common.weight = weight;
        self
    }

    /// Draw offsets from `N(0, window²)` instead of `U(-window, window)`.
    #[must_use]
    pub fn gaussian(mut self) -> Self {
        self.gaussian = true;
        self
    }

    /// Turns off window tuning.
    #[must_use]
    pub fn fixed(mut self) -> Self {
        self.optimise = false;
        self
    }
}

impl Proposal for RandomWalkProposal {
    fn id(&self) -> &str {
        &self.common.id
    }

    fn weight(&self) -> f64 {
        self.common.weight
    }

    fn slots(&self) -> &[String] {
        &self.common.slots
    }

    fn propose(&mut self, ctx: &mut ProposalContext<'_>) -> Result<f64, SamplingError> {
        let slot = ctx.target(0)?;
        let index = pick_index(ctx, slot);
        let old = real_at(ctx, slot, index)?;
        let step = if self.gaussian {
            let z: f64 = ctx.rng().sample(StandardNormal);
            z * self.window
        } else {
            ctx.rng().gen_range(-1.0_f64..1.0) * self.window
        };
        let new = old + step;
        if !ctx.state().slot(slot).bounds().contains(new) {
            return Ok(f64::NEG_INFINITY);
        }
        ctx.edit(slot)?.set_real(index, new)?;
        Ok(0.0)
    }

    fn tuning(&self) -> Option<f64> {
        self.optimise.then_some(self.window)
    }

    fn set_tuning(&mut self, value: f64) {
        self.window = value;
    }

    fn optimize(&mut self, delta: f64) {
        if self.optimise {
            let delta = delta + self.window.ln();
            self.window = delta.exp();
        }
    }

    fn performance_suggestion(&self, stats: &ProposalStats) -> Option<String> {
        let prob = acceptance_rate(stats)?;
        let ratio = (prob / self.target_acceptance()).clamp(0.5, 2.0);
        let suggested = self.window * ratio;
        (!(0.10..=0.40).contains(&prob))
            .then(|| format!("Try setting window size to about {}", round3(suggested)))
    }
}

/// Redraws one element uniformly between the slot's bounds.
///
/// Works on real and integer slots; unbounded slots make every move invalid.
#[derive(Debug, Clone)]
pub struct UniformProposal {
    common: Common,
}

impl UniformProposal {
    /// Redraws one element uniformly within the bounds.
    #[must_use]
    pub fn new(id: impl Into<String>, slot: impl Into<String>) -> Self {
        Self {
            common: Common::new(id, slot),
        }
    }

    /// Sets the selection weight.
    #[must_use]
    pub fn with_weight(mut self, weight: f64) -> Self {
        self.common.weight = weight;
        self
    }
}

impl Proposal for UniformProposal {
    fn id(&self) -> &str {
        &self.common.id
    }

    fn weight(&self) -> f64 {
        self.common.weight
    }

    fn slots(&self) -> &[String] {
        &self.common.slots
    }

    #[allow(clippy::cast_possible_truncation)]
    fn propose(&mut self, ctx: &mut ProposalContext<'_>) -> Result<f64, SamplingError> {
        let slot = ctx.target(0)?;
        let bounds = ctx.state().slot(slot).bounds();
        if !(bounds.lower.is_finite() && bounds.upper.is_finite()) {
            return Ok(f64::NEG_INFINITY);
        }
        let index = pick_index(ctx, slot);
        if matches!(ctx.value(slot), SlotValue::Integer(_)) {
            let lo = bounds.lower.ceil() as i64;
            let hi = bounds.upper.floor() as i64;
            if lo > hi {
                return Ok(f64::NEG_INFINITY);
            }
            let new = ctx.rng().gen_range(lo..=hi);
            ctx.edit(slot)?.set_integer(index, new)?;
        } else {
            let u: f64 = ctx.rng().gen();
            let new = bounds.lower + u * (bounds.upper - bounds.lower);
            ctx.edit(slot)?.set_real(index, new)?;
        }
        Ok(0.0)
    }
}

/// Adds an integer offset in `[-window, window]` to one integer element.
#[derive(Debug, Clone)]
pub struct IntRandomWalkProposal {
    common: Common,
    window: i64,
}

impl IntRandomWalkProposal {
    /// Integer random walk of at most `window` steps.
    #[must_use]
    pub fn new(id: impl Into<String>, slot: impl Into<String>, window: i64) -> Self {
        Self {
            common: Common::new(id, slot),
            window: window.max(1),
        }
    }

    /// Sets the selection weight.
    #[must_use]
    pub fn with_weight(mut self, weight: f64) -> Self {
        self.common.weight = weight;
        self
    }
}

impl Proposal for IntRandomWalkProposal {
    fn id(&self) -> &str {
        &self.common.id
    }

    fn weight(&self) -> f64 {
        self.common.weight
    }

    fn slots(&self) -> &[String] {
        &self.common.slots
    }

    #[allow(clippy::cast_precision_loss)]
    fn propose(&mut self, ctx: &mut ProposalContext<'_>) -> Result<f64, SamplingError> {
        let slot = ctx.target(0)?;
        let index = pick_index(ctx, slot);
        let old = integer_at(ctx, slot, index)?;
        let step = ctx.rng().gen_range(-self.window..=self.window);
        let new = old + step;
        // a zero step would only cost a posterior evaluation
        if new == old || !ctx.state().slot(slot).bounds().contains(new as f64) {
            return Ok(f64::NEG_INFINITY);
        }
        ctx.edit(slot)?.set_integer(index, new)?;
        Ok(0.0)
    }
}

/// Flips one element of a boolean slot.
#[derive(Debug, Clone)]
pub struct BitFlipProposal {
    common: Common,
}

impl BitFlipProposal {
    /// Flips one element.
    #[must_use]
    pub fn new(id: impl Into<String>, slot: impl Into<String>) -> Self {
        Self {
            common: Common::new(id, slot),
        }
    }

    /// Sets the selection weight.
    #[must_use]
    pub fn with_weight(mut self, weight: f64) -> Self {
        self.common.weight = weight;
        self
    }
}

impl Proposal for BitFlipProposal {
    fn id(&self) -> &str {
        &self.common.id
    }

    fn weight(&self) -> f64 {
        self.common.weight
    }

    fn slots(&self) -> &[String] {
        &self.common.slots
    }

    fn propose(&mut self, ctx: &mut ProposalContext<'_>) -> Result<f64, SamplingError> {
        let slot = ctx.target(0)?;
        let index = pick_index(ctx, slot);
        let old = match ctx.value(slot) {
            SlotValue::Boolean(v) => v[index],
            other => {
                return Err(SamplingError::InvalidValue {
                    slot: ctx.state().slot(slot).name().to_string(),
                    value: other.to_string(),
                    reason: format!("expected boolean values, found {}", other.kind()),
                })
            }
        };
        ctx.edit(slot)?.set_boolean(index, !old)?;
        Ok(0.0)
    }
}
