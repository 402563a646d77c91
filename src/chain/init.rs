//! State initialisers.
//!
//! An initialiser draws starting values for the slots it claims. The chain
//! runs every initialiser before each attempt to find a starting state with
//! a finite posterior. Initialisers never run on a resumed chain.

use std::collections::HashMap;

use rand::Rng;

use crate::error::{ConfigError, SamplingError};
use crate::proposal::ChainRng;
use crate::state::{SlotId, SlotValue, StateStore};

/// Produces starting values for a set of slots.
pub trait Initialiser: Send {
    /// Identifier used in error messages.
    fn id(&self) -> &str;

    /// Names of the slots this initialiser writes.
    fn slots(&self) -> &[String];

    /// Writes starting values into the declared slots.
    fn initialise(&mut self, ctx: &mut InitContext<'_>) -> Result<(), SamplingError>;
}

/// Write access to the claimed slots during initialisation.
pub struct InitContext<'a> {
    state: &'a mut StateStore,
    rng: &'a mut ChainRng,
    initialiser: &'a str,
    targets: &'a [SlotId],
}

impl<'a> InitContext<'a> {
    pub(crate) fn new(
        state: &'a mut StateStore,
        rng: &'a mut ChainRng,
        initialiser: &'a str,
        targets: &'a [SlotId],
    ) -> Self {
        Self {
            state,
            rng,
            initialiser,
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

    /// Slots this initialiser declared, in declaration order.
    #[must_use]
    pub fn targets(&self) -> &[SlotId] {
        self.targets
    }

    /// Replaces the value of a claimed slot. The value must have the slot's
    /// shape and lie within its bounds.
    pub fn assign(&mut self, slot: SlotId, value: SlotValue) -> Result<(), SamplingError> {
        let current = self.state.slot(slot);
        if !self.targets.contains(&slot) {
            return Err(SamplingError::UndeclaredSlot {
                proposal: self.initialiser.to_string(),
                slot: current.name().to_string(),
            });
        }
        if !current.bounds().admits(&value) {
            return Err(SamplingError::InvalidValue {
                slot: current.name().to_string(),
                value: value.to_string(),
                reason: format!("outside bounds {}", current.bounds()),
            });
        }
        self.state.assign(slot, value)
    }
}

/// Initialisers with their slots resolved.
#[derive(Default)]
pub(crate) struct InitialiserSet {
    entries: Vec<(Box<dyn Initialiser>, Vec<SlotId>)>,
}

impl InitialiserSet {
    /// Resolves slot names and checks that no slot is claimed twice.
    pub(crate) fn bind(initialisers: Vec<Box<dyn Initialiser>>, state: &StateStore) -> Result<Self, ConfigError> {
        let mut claimed: HashMap<SlotId, String> = HashMap::new();
        let mut entries = Vec::with_capacity(initialisers.len());
        for init in initialisers {
            let mut targets = Vec::with_capacity(init.slots().len());
            for name in init.slots() {
                let id = state.lookup(name).ok_or_else(|| ConfigError::UnknownSlot {
                    proposal: init.id().to_string(),
                    slot: name.clone(),
                })?;
                if claimed.insert(id, init.id().to_string()).is_some() {
                    return Err(ConfigError::DuplicateInitialiser { slot: name.clone() });
                }
                targets.push(id);
            }
            entries.push((init, targets));
        }
        Ok(Self { entries })
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn run(&mut self, state: &mut StateStore, rng: &mut ChainRng) -> Result<(), SamplingError> {
        for (init, targets) in &mut self.entries {
            let id = init.id().to_string();
            let mut ctx = InitContext::new(state, rng, &id, targets);
            init.initialise(&mut ctx)?;
        }
        Ok(())
    }
}

/// Draws every element of a slot uniformly within its bounds.
///
/// Real slots need finite bounds. Integer slots draw from the inclusive
/// range of integers inside the bounds; boolean slots ignore them.
#[derive(Debug, Clone)]
pub struct UniformInitialiser {
    id: String,
    slots: Vec<String>,
}

impl UniformInitialiser {
    /// Draws `slot` uniformly between its bounds.
    pub fn new(id: impl Into<String>, slot: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            slots: vec![slot.into()],
        }
    }
}

impl Initialiser for UniformInitialiser {
    fn id(&self) -> &str {
        &self.id
    }

    fn slots(&self) -> &[String] {
        &self.slots
    }

    #[allow(clippy::cast_possible_truncation)]
    fn initialise(&mut self, ctx: &mut InitContext<'_>) -> Result<(), SamplingError> {
        for k in 0..ctx.targets.len() {
            let slot = ctx.targets[k];
            let current = ctx.state.slot(slot);
            let bounds = current.bounds();
            let dim = current.dimension();
            let unsupported = |reason: &str| SamplingError::InvalidValue {
                slot: current.name().to_string(),
                value: current.value().to_string(),
                reason: reason.to_string(),
            };
            let value = match current.value() {
                SlotValue::Real(_) => {
                    if !(bounds.lower.is_finite() && bounds.upper.is_finite()) {
                        return Err(unsupported("uniform initialisation needs finite bounds"));
                    }
                    let (lo, hi) = (bounds.lower, bounds.upper);
                    SlotValue::Real((0..dim).map(|_| lo + (hi - lo) * ctx.rng.gen::<f64>()).collect())
                }
                SlotValue::Integer(_) => {
                    let (lo, hi) = (bounds.lower.ceil(), bounds.upper.floor());
                    if !(lo.is_finite() && hi.is_finite()) || lo > hi {
                        return Err(unsupported("uniform initialisation needs a finite integer range"));
                    }
                    let (lo, hi) = (lo as i64, hi as i64);
                    SlotValue::Integer((0..dim).map(|_| ctx.rng.gen_range(lo..=hi)).collect())
                }
                SlotValue::Boolean(_) => SlotValue::Boolean((0..dim).map(|_| ctx.rng.gen::<bool>()).collect()),
            };
            ctx.assign(slot, value)?;
        }
        Ok(())
    }
}
