//! A single unit of mutable model state.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, SamplingError};

use super::value::{Bounds, SlotKind, SlotValue};

/// Position of a slot inside its [`super::StateStore`].
///
/// Stable for the lifetime of the store; the slot's name is the identity
/// used across processes (checkpoints).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SlotId(pub(crate) usize);

impl SlotId {
    /// Index into the owning store.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot#{}", self.0)
    }
}

/// Versioned state slot: current value, shadow copy and per-element dirt.
///
/// The slot itself exposes no public mutators. Values change only through
/// an [`EditHandle`] obtained from `StateStore::begin_edit`, which first
/// copies the current value into the shadow.
#[derive(Debug, Clone)]
pub struct VersionedSlot {
    id: SlotId,
    name: String,
    value: SlotValue,
    stored: SlotValue,
    bounds: Bounds,
    dirty: Vec<bool>,
    editing: bool,
}

impl VersionedSlot {
    /// Creates a slot. The value must lie within `bounds`.
    pub fn new(name: impl Into<String>, value: SlotValue, bounds: Bounds) -> Result<Self, ConfigError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(ConfigError::MissingField {
                field: "slot name".to_string(),
            });
        }
        if value.is_empty() {
            return Err(ConfigError::InvalidConfig {
                reason: format!("slot '{name}' has dimension 0"),
            });
        }
        if !bounds.is_well_formed() {
            return Err(ConfigError::InvalidConfig {
                reason: format!("slot '{name}' has malformed bounds {bounds}"),
            });
        }
        if !bounds.admits(&value) {
            return Err(ConfigError::InvalidConfig {
                reason: format!("slot '{name}' initial value {value} lies outside {bounds}"),
            });
        }
        let dim = value.len();
        Ok(Self {
            id: SlotId(usize::MAX),
            name,
            stored: value.clone(),
            value,
            bounds,
            dirty: vec![false; dim],
            editing: false,
        })
    }

    /// Convenience constructor for an unbounded real vector.
    pub fn real(name: impl Into<String>, values: Vec<f64>) -> Result<Self, ConfigError> {
        Self::new(name, SlotValue::Real(values), Bounds::unbounded())
    }

    /// Position in the store.
    #[must_use]
    pub const fn id(&self) -> SlotId {
        self.id
    }

    pub(crate) fn set_id(&mut self, id: SlotId) {
        self.id = id;
    }

    /// Slot name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current value.
    #[must_use]
    pub const fn value(&self) -> &SlotValue {
        &self.value
    }

    /// Shadow copy taken when the current edit session started.
    #[must_use]
    pub const fn stored_value(&self) -> &SlotValue {
        &self.stored
    }

    /// Allowed value range.
    #[must_use]
    pub const fn bounds(&self) -> Bounds {
        self.bounds
    }

    /// Number of elements.
    #[must_use]
    pub fn dimension(&self) -> usize {
        self.value.len()
    }

    /// True once an edit has started in the current step.
    #[must_use]
    pub const fn is_editing(&self) -> bool {
        self.editing
    }

    /// Whether any element is dirty.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.editing || self.dirty.iter().any(|d| *d)
    }

    /// Whether element `index` changed in this step.
    #[must_use]
    pub fn is_element_dirty(&self, index: usize) -> bool {
        self.dirty.get(index).copied().unwrap_or(false)
    }

    /// Indices of dirty elements.
    pub fn dirty_elements(&self) -> impl Iterator<Item = usize> + '_ {
        self.dirty
            .iter()
            .enumerate()
            .filter_map(|(i, d)| d.then_some(i))
    }

    pub(crate) fn set_everything_dirty(&mut self, is_dirty: bool) {
        self.dirty.iter_mut().for_each(|d| *d = is_dirty);
        if !is_dirty {
            self.editing = false;
        }
    }

    /// Copy-on-first-edit: snapshot into the shadow once per step.
    pub(crate) fn start_editing(&mut self) -> bool {
        if self.editing {
            return false;
        }
        self.editing = true;
        self.stored.clone_from(&self.value);
        true
    }

    /// Roll back to the shadow. Dirty bits stay set until the store clears them.
    pub(crate) fn restore(&mut self) {
        if self.editing {
            self.value.clone_from(&self.stored);
            self.editing = false;
        }
    }

    pub(crate) fn accept(&mut self) {
        self.editing = false;
    }

    /// Replace both current and shadow values (initialisation and resume only).
    pub(crate) fn assign(&mut self, value: SlotValue) -> Result<(), SamplingError> {
        if !value.same_shape(&self.value) {
            return Err(SamplingError::InvalidValue {
                slot: self.name.clone(),
                value: value.to_string(),
                reason: format!(
                    "expected {} {} element(s), got {} {}",
                    self.value.len(),
                    self.value.kind(),
                    value.len(),
                    value.kind()
                ),
            });
        }
        self.stored.clone_from(&value);
        self.value = value;
        self.dirty.iter_mut().for_each(|d| *d = true);
        Ok(())
    }

    /// blake3 digest of the current value.
    #[must_use]
    pub fn checksum(&self) -> blake3::Hash {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.name.as_bytes());
        self.value.write_bytes(&mut hasher);
        hasher.finalize()
    }

    fn mismatch(&self, index: usize, value: String, wanted: SlotKind) -> SamplingError {
        let reason = if self.value.kind() == wanted {
            format!("index {index} out of range for dimension {}", self.dimension())
        } else {
            format!("slot holds {} values, not {wanted}", self.value.kind())
        };
        SamplingError::InvalidValue {
            slot: self.name.clone(),
            value,
            reason,
        }
    }
}

impl fmt::Display for VersionedSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}] {}: {}", self.name, self.dimension(), self.bounds, self.value)
    }
}

/// Mutable view of one slot, valid for the current edit session.
#[derive(Debug)]
pub struct EditHandle<'a> {
    slot: &'a mut VersionedSlot,
}

impl<'a> EditHandle<'a> {
    pub(crate) fn new(slot: &'a mut VersionedSlot) -> Self {
        Self { slot }
    }

    /// Id of the edited slot.
    #[must_use]
    pub const fn id(&self) -> SlotId {
        self.slot.id
    }

    /// Name of the edited slot.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.slot.name
    }

    /// Number of elements.
    #[must_use]
    pub fn dimension(&self) -> usize {
        self.slot.dimension()
    }

    /// Allowed value range.
    #[must_use]
    pub const fn bounds(&self) -> Bounds {
        self.slot.bounds
    }

    /// Current value, edits included.
    #[must_use]
    pub const fn value(&self) -> &SlotValue {
        &self.slot.value
    }

    /// Sets a real element. Bounds are the proposal's concern.
    pub fn set_real(&mut self, index: usize, x: f64) -> Result<(), SamplingError> {
        let slot = &mut *self.slot;
        if let SlotValue::Real(v) = &mut slot.value {
            if let Some(e) = v.get_mut(index) {
                *e = x;
                slot.dirty[index] = true;
                return Ok(());
            }
        }
        Err(slot.mismatch(index, x.to_string(), SlotKind::Real))
    }

    /// Sets an integer element.
    pub fn set_integer(&mut self, index: usize, x: i64) -> Result<(), SamplingError> {
        let slot = &mut *self.slot;
        if let SlotValue::Integer(v) = &mut slot.value {
            if let Some(e) = v.get_mut(index) {
                *e = x;
                slot.dirty[index] = true;
                return Ok(());
            }
        }
        Err(slot.mismatch(index, x.to_string(), SlotKind::Integer))
    }

    /// Sets a boolean element.
    pub fn set_boolean(&mut self, index: usize, x: bool) -> Result<(), SamplingError> {
        let slot = &mut *self.slot;
        if let SlotValue::Boolean(v) = &mut slot.value {
            if let Some(e) = v.get_mut(index) {
                *e = x;
                slot.dirty[index] = true;
                return Ok(());
            }
        }
        Err(slot.mismatch(index, x.to_string(), SlotKind::Boolean))
    }

    /// Multiply every real element by `factor`, marking all of them dirty.
    pub fn scale_all(&mut self, factor: f64) -> Result<(), SamplingError> {
        let slot = &mut *self.slot;
        if let SlotValue::Real(v) = &mut slot.value {
            v.iter_mut().for_each(|x| *x *= factor);
            slot.dirty.iter_mut().for_each(|d| *d = true);
            return Ok(());
        }
        Err(slot.mismatch(0, factor.to_string(), SlotKind::Real))
    }

    /// Whether the current value lies inside the slot's bounds.
    #[must_use]
    pub fn is_within_bounds(&self) -> bool {
        self.slot.bounds.admits(&self.slot.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_out_of_bounds_initial_value() {
        let err = VersionedSlot::new("rate", SlotValue::Real(vec![-1.0]), Bounds::non_negative())
            .unwrap_err();
        assert!(err.to_string().contains("outside"));
    }

    #[test]
    fn rejects_empty_slot() {
        assert!(VersionedSlot::real("x", vec![]).is_err());
        assert!(VersionedSlot::real("  ", vec![1.0]).is_err());
    }

    #[test]
    fn edit_marks_only_touched_element() {
        let mut slot = VersionedSlot::real("mu", vec![1.0, 2.0, 3.0]).unwrap();
        assert!(slot.start_editing());
        EditHandle::new(&mut slot).set_real(1, 5.0).unwrap();
        assert!(slot.is_element_dirty(1));
        assert!(!slot.is_element_dirty(0));
        assert_eq!(slot.dirty_elements().collect::<Vec<_>>(), vec![1]);
        assert_eq!(slot.stored_value(), &SlotValue::Real(vec![1.0, 2.0, 3.0]));
    }

    #[test]
    fn restore_rolls_back_to_shadow() {
        let mut slot = VersionedSlot::real("mu", vec![1.0, 2.0]).unwrap();
        slot.start_editing();
        EditHandle::new(&mut slot).scale_all(2.0).unwrap();
        assert_eq!(slot.value(), &SlotValue::Real(vec![2.0, 4.0]));
        slot.restore();
        assert_eq!(slot.value(), &SlotValue::Real(vec![1.0, 2.0]));
        assert!(!slot.is_editing());
    }

    #[test]
    fn second_start_editing_keeps_first_snapshot() {
        let mut slot = VersionedSlot::real("mu", vec![1.0]).unwrap();
        assert!(slot.start_editing());
        EditHandle::new(&mut slot).set_real(0, 9.0).unwrap();
        assert!(!slot.start_editing());
        assert_eq!(slot.stored_value(), &SlotValue::Real(vec![1.0]));
    }

    #[test]
    fn setters_check_kind() {
        let mut slot = VersionedSlot::new("k", SlotValue::Integer(vec![1]), Bounds::unbounded()).unwrap();
        let mut handle = EditHandle::new(&mut slot);
        assert!(handle.set_real(0, 1.0).is_err());
        assert!(handle.set_integer(3, 1).is_err());
        handle.set_integer(0, 4).unwrap();
        assert_eq!(slot.value(), &SlotValue::Integer(vec![4]));
    }

    #[test]
    fn assign_requires_same_shape() {
        let mut slot = VersionedSlot::real("mu", vec![1.0, 2.0]).unwrap();
        assert!(slot.assign(SlotValue::Real(vec![1.0])).is_err());
        slot.assign(SlotValue::Real(vec![7.0, 8.0])).unwrap();
        assert_eq!(slot.stored_value(), slot.value());
    }

    #[test]
    fn checksum_tracks_value() {
        let mut slot = VersionedSlot::real("mu", vec![1.0]).unwrap();
        let before = slot.checksum();
        slot.start_editing();
        EditHandle::new(&mut slot).set_real(0, 1.5).unwrap();
        assert_ne!(before, slot.checksum());
        slot.restore();
        assert_eq!(before, slot.checksum());
    }
}
