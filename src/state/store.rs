//! Ordered collection of versioned slots with step-scoped edit sessions.

use std::collections::HashMap;
use std::fmt;

use crate::error::{ConfigError, SamplingError};

use super::slot::{EditHandle, SlotId, VersionedSlot};
use super::value::SlotValue;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Session {
    Closed,
    Open { owner: Option<String> },
}

/// The complete mutable state of a model.
///
/// A step follows `store` → edits → `accept` | `restore`. Only slots that
/// were edited since `store` are rolled back on `restore`.
#[derive(Debug, Clone)]
pub struct StateStore {
    slots: Vec<VersionedSlot>,
    by_name: HashMap<String, SlotId>,
    changed: Vec<SlotId>,
    session: Session,
    generation: u64,
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StateStore {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            by_name: HashMap::new(),
            changed: Vec::new(),
            session: Session::Closed,
            generation: 0,
        }
    }

    /// Adds a slot; names must be unique.
    pub fn add(&mut self, mut slot: VersionedSlot) -> Result<SlotId, ConfigError> {
        if self.by_name.contains_key(slot.name()) {
            return Err(ConfigError::DuplicateId {
                id: slot.name().to_string(),
            });
        }
        let id = SlotId(self.slots.len());
        slot.set_id(id);
        self.by_name.insert(slot.name().to_string(), id);
        self.slots.push(slot);
        Ok(id)
    }

    /// Number of slots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the store has no slots.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Slot by id. Ids are only minted by this store.
    #[must_use]
    pub fn slot(&self, id: SlotId) -> &VersionedSlot {
        &self.slots[id.0]
    }

    /// Id of the slot called `name`.
    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<SlotId> {
        self.by_name.get(name).copied()
    }

    /// Current value of the named slot.
    #[must_use]
    pub fn value_of(&self, name: &str) -> Option<&SlotValue> {
        self.lookup(name).map(|id| self.slot(id).value())
    }

    /// Slots in registration order.
    pub fn slots(&self) -> impl Iterator<Item = &VersionedSlot> {
        self.slots.iter()
    }

    /// Slots edited since the last `store`, in first-edit order.
    #[must_use]
    pub fn changed_slots(&self) -> &[SlotId] {
        &self.changed
    }

    /// Bumped whenever the changed set grows or everything is marked dirty.
    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether an edit session is open.
    #[must_use]
    pub fn in_session(&self) -> bool {
        matches!(self.session, Session::Open { .. })
    }

    /// Opens a new edit session and forgets the previous changed set.
    pub fn store(&mut self) {
        self.changed.clear();
        self.session = Session::Open { owner: None };
        self.generation += 1;
    }

    /// Grants `proposal` write access to `id` for the current session.
    ///
    /// The first edit of a slot snapshots its value. A session belongs to
    /// the first proposal that edits in it.
    pub fn begin_edit(&mut self, id: SlotId, proposal: &str) -> Result<EditHandle<'_>, SamplingError> {
        let slot = self.slots.get_mut(id.0).ok_or_else(|| SamplingError::EditOutsideSession {
            slot: id.to_string(),
        })?;
        let Session::Open { owner } = &mut self.session else {
            return Err(SamplingError::EditOutsideSession {
                slot: slot.name().to_string(),
            });
        };
        if owner.is_none() {
            *owner = Some(proposal.to_string());
        }
        if let Some(o) = owner.as_deref().filter(|o| *o != proposal) {
            return Err(SamplingError::ConcurrentEdit {
                proposal: proposal.to_string(),
                owner: o.to_string(),
                slot: slot.name().to_string(),
            });
        }
        if slot.start_editing() {
            self.changed.push(id);
            self.generation += 1;
        }
        Ok(EditHandle::new(slot))
    }

    /// Rolls every changed slot back to its snapshot and closes the session.
    pub fn restore(&mut self) {
        for id in &self.changed {
            self.slots[id.0].restore();
        }
        self.session = Session::Closed;
    }

    /// Keeps the edits and closes the session.
    pub fn accept(&mut self) {
        for id in &self.changed {
            self.slots[id.0].accept();
        }
        self.session = Session::Closed;
    }

    /// Marks every element of every slot (un)dirty.
    ///
    /// Setting everything dirty also makes every slot part of the changed
    /// set so a following restore or recomputation covers the whole state.
    pub fn set_everything_dirty(&mut self, is_dirty: bool) {
        for slot in &mut self.slots {
            slot.set_everything_dirty(is_dirty);
        }
        if is_dirty {
            self.changed = (0..self.slots.len()).map(SlotId).collect();
            self.generation += 1;
        }
    }

    /// Overwrites a slot outside the step protocol (initialisation, resume).
    pub(crate) fn assign(&mut self, id: SlotId, value: SlotValue) -> Result<(), SamplingError> {
        self.slots[id.0].assign(value)?;
        self.generation += 1;
        Ok(())
    }

    /// Per-slot checksums of the current values.
    #[must_use]
    pub fn checksums(&self) -> Vec<blake3::Hash> {
        self.slots.iter().map(VersionedSlot::checksum).collect()
    }
}

impl fmt::Display for StateStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for slot in &self.slots {
            writeln!(f, "{slot}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Bounds;

    fn store_with(names: &[&str]) -> StateStore {
        let mut store = StateStore::new();
        for n in names {
            store.add(VersionedSlot::real(*n, vec![1.0, 2.0]).unwrap()).unwrap();
        }
        store
    }

    #[test]
    fn duplicate_names_rejected() {
        let mut store = store_with(&["a"]);
        let err = store.add(VersionedSlot::real("a", vec![0.0]).unwrap()).unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateId { .. }));
    }

    #[test]
    fn edit_outside_session_fails() {
        let mut store = store_with(&["a"]);
        let id = store.lookup("a").unwrap();
        let err = store.begin_edit(id, "p").unwrap_err();
        assert!(matches!(err, SamplingError::EditOutsideSession { .. }));
    }

    #[test]
    fn second_proposal_in_same_step_is_rejected() {
        let mut store = store_with(&["a", "b"]);
        let a = store.lookup("a").unwrap();
        let b = store.lookup("b").unwrap();
        store.store();
        store.begin_edit(a, "p").unwrap().set_real(0, 3.0).unwrap();
        let err = store.begin_edit(b, "q").unwrap_err();
        assert!(matches!(err, SamplingError::ConcurrentEdit { .. }));
        store.begin_edit(b, "p").unwrap();
    }

    #[test]
    fn restore_touches_only_changed_slots() {
        let mut store = store_with(&["a", "b"]);
        let a = store.lookup("a").unwrap();
        store.store();
        store.begin_edit(a, "p").unwrap().set_real(1, 9.0).unwrap();
        assert_eq!(store.changed_slots(), &[a]);
        store.restore();
        assert_eq!(store.value_of("a"), Some(&SlotValue::Real(vec![1.0, 2.0])));
        assert!(!store.in_session());
    }

    #[test]
    fn accept_keeps_edits() {
        let mut store = store_with(&["a"]);
        let a = store.lookup("a").unwrap();
        store.store();
        store.begin_edit(a, "p").unwrap().set_real(0, -4.0).unwrap();
        store.accept();
        store.set_everything_dirty(false);
        assert_eq!(store.value_of("a"), Some(&SlotValue::Real(vec![-4.0, 2.0])));
        assert!(!store.slot(a).is_dirty());
    }

    #[test]
    fn changed_set_resets_at_store() {
        let mut store = store_with(&["a"]);
        let a = store.lookup("a").unwrap();
        store.store();
        store.begin_edit(a, "p").unwrap();
        store.accept();
        store.store();
        assert!(store.changed_slots().is_empty());
    }

    #[test]
    fn everything_dirty_marks_all_changed() {
        let mut store = store_with(&["a", "b"]);
        let g = store.generation();
        store.set_everything_dirty(true);
        assert_eq!(store.changed_slots().len(), 2);
        assert!(store.generation() > g);
        assert!(store.slots().all(VersionedSlot::is_dirty));
    }

    #[test]
    fn display_lists_slots() {
        let mut store = StateStore::new();
        store
            .add(VersionedSlot::new("k", SlotValue::Integer(vec![1, 2]), Bounds::new(0.0, 5.0)).unwrap())
            .unwrap();
        assert_eq!(store.to_string(), "k[2] (0,5): 1 2\n");
    }
}
