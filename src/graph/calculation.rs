//! The cached-quantity capability and the read-only view it computes from.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::state::{SlotId, SlotValue, StateStore};

use super::Cell;

/// Position of a quantity inside its [`super::CalcGraph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QuantityId(pub(crate) usize);

impl QuantityId {
    /// Index into the owning graph.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for QuantityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "quantity#{}", self.0)
    }
}

/// One input edge of a quantity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeRef {
    /// A state slot.
    Slot(SlotId),
    /// Another cached quantity.
    Quantity(QuantityId),
}

/// Read-only access to a quantity's inputs, in declaration order.
pub struct InputView<'a> {
    pub(crate) state: &'a StateStore,
    pub(crate) cells: &'a [Cell],
    pub(crate) inputs: &'a [NodeRef],
}

impl<'a> InputView<'a> {
    /// Number of inputs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inputs.len()
    }

    /// Whether the quantity has no inputs.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty()
    }

    /// The input edge at `i`.
    #[must_use]
    pub fn input(&self, i: usize) -> Option<NodeRef> {
        self.inputs.get(i).copied()
    }

    /// Slot payload of input `i`, if that input is a slot.
    #[must_use]
    pub fn slot(&self, i: usize) -> Option<&'a SlotValue> {
        match self.inputs.get(i)? {
            NodeRef::Slot(id) => Some(self.state.slot(*id).value()),
            NodeRef::Quantity(_) => None,
        }
    }

    /// Cached value of input `i`, if that input is a quantity.
    #[must_use]
    pub fn quantity(&self, i: usize) -> Option<&'a [f64]> {
        match self.inputs.get(i)? {
            NodeRef::Quantity(q) => Some(&self.cells[q.0].value),
            NodeRef::Slot(_) => None,
        }
    }

    /// First element of input `i` as a real.
    ///
    /// Returns NaN for a missing input so a broken model shows up in the
    /// posterior instead of panicking.
    #[must_use]
    pub fn scalar(&self, i: usize) -> f64 {
        match self.inputs.get(i) {
            Some(NodeRef::Slot(id)) => self.state.slot(*id).value().as_f64(0).unwrap_or(f64::NAN),
            Some(NodeRef::Quantity(q)) => self.cells[q.0].value.first().copied().unwrap_or(f64::NAN),
            None => f64::NAN,
        }
    }

    /// Whether input `i` changed in the current step.
    ///
    /// A slot counts when any of its elements is dirty, a quantity when it
    /// is stale or has been recomputed.
    #[must_use]
    pub fn is_dirty(&self, i: usize) -> bool {
        match self.inputs.get(i) {
            Some(NodeRef::Slot(id)) => self.state.slot(*id).is_dirty(),
            Some(NodeRef::Quantity(q)) => {
                let cell = &self.cells[q.0];
                cell.dirty || cell.updated
            }
            None => false,
        }
    }

    /// Element-level dirtiness of a slot input. Quantities report as a whole.
    #[must_use]
    pub fn is_element_dirty(&self, i: usize, element: usize) -> bool {
        match self.inputs.get(i) {
            Some(NodeRef::Slot(id)) => self.state.slot(*id).is_element_dirty(element),
            Some(NodeRef::Quantity(_)) => self.is_dirty(i),
            None => false,
        }
    }

    /// Whether any input changed in the current step.
    #[must_use]
    pub fn any_dirty(&self) -> bool {
        (0..self.inputs.len()).any(|i| self.is_dirty(i))
    }

    /// The whole state, for quantities that read slots by name.
    #[must_use]
    pub const fn state(&self) -> &'a StateStore {
        self.state
    }
}

/// A memoised computation over slots and other quantities.
///
/// The graph decides when to call [`Calculation::calculate`]; implementors
/// never see a stale input. Quantities with internal caches hook into the
/// step protocol through `store`, `restore` and `accept`.
pub trait Calculation: Send {
    /// Recomputes the value from the current inputs into `out` (cleared by the caller).
    fn calculate(&mut self, inputs: &InputView<'_>, out: &mut Vec<f64>);

    /// Whether the cached value is stale given the inputs' dirtiness.
    ///
    /// The default is conservative: any changed input makes the quantity
    /// stale. Override to look only at the elements that matter.
    fn requires_recalculation(&self, inputs: &InputView<'_>) -> bool {
        inputs.any_dirty()
    }

    /// Called when the graph snapshots this quantity for the current step.
    fn store(&mut self) {}

    /// Called when the step is rolled back.
    fn restore(&mut self) {}

    /// Called when the step is committed.
    fn accept(&mut self) {}
}

/// Sum of the first element of every input: the usual shape of a posterior
/// (prior terms plus a likelihood).
#[derive(Debug, Clone, Copy, Default)]
pub struct LogDensitySum;

impl Calculation for LogDensitySum {
    fn calculate(&mut self, inputs: &InputView<'_>, out: &mut Vec<f64>) {
        let mut total = 0.0;
        for i in 0..inputs.len() {
            let term = inputs.scalar(i);
            total += term;
            if total == f64::NEG_INFINITY {
                break;
            }
        }
        out.push(total);
    }
}

/// Adapter turning a closure over the input view into a quantity.
pub struct FnCalculation<F> {
    f: F,
}

impl<F> FnCalculation<F>
where
    F: FnMut(&InputView<'_>) -> f64 + Send,
{
    /// Wraps `f`.
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F> Calculation for FnCalculation<F>
where
    F: FnMut(&InputView<'_>) -> f64 + Send,
{
    fn calculate(&mut self, inputs: &InputView<'_>, out: &mut Vec<f64>) {
        out.push((self.f)(inputs));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::VersionedSlot;

    fn view_fixture() -> (StateStore, Vec<Cell>, Vec<NodeRef>) {
        let mut state = StateStore::new();
        let a = state.add(VersionedSlot::real("a", vec![2.0, 3.0]).unwrap()).unwrap();
        let mut cell = Cell::default();
        cell.value = vec![-1.5];
        (state, vec![cell], vec![NodeRef::Slot(a), NodeRef::Quantity(QuantityId(0))])
    }

    #[test]
    fn view_reads_slots_and_quantities() {
        let (state, cells, inputs) = view_fixture();
        let view = InputView {
            state: &state,
            cells: &cells,
            inputs: &inputs,
        };
        assert_eq!(view.len(), 2);
        assert_eq!(view.scalar(0), 2.0);
        assert_eq!(view.scalar(1), -1.5);
        assert!(view.scalar(7).is_nan());
        assert!(view.slot(1).is_none());
        assert_eq!(view.quantity(1), Some(&[-1.5][..]));
        assert!(!view.any_dirty());
    }

    #[test]
    fn updated_quantity_counts_as_dirty() {
        let (state, mut cells, inputs) = view_fixture();
        cells[0].updated = true;
        let view = InputView {
            state: &state,
            cells: &cells,
            inputs: &inputs,
        };
        assert!(view.is_dirty(1));
        assert!(!view.is_dirty(0));
    }

    #[test]
    fn sum_short_circuits_on_negative_infinity() {
        let (state, mut cells, inputs) = view_fixture();
        cells[0].value = vec![f64::NEG_INFINITY];
        let view = InputView {
            state: &state,
            cells: &cells,
            inputs: &inputs,
        };
        let mut out = Vec::new();
        LogDensitySum.calculate(&view, &mut out);
        assert_eq!(out, vec![f64::NEG_INFINITY]);
    }
}
