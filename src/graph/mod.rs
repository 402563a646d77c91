//! Lazily recomputed quantities over the model state.
//!
//! Quantities live in an arena addressed by [`QuantityId`]. Inputs and the
//! reverse adjacency (slot → quantities reading it) are plain index tables
//! built once by [`GraphBuilder`]; no node holds a reference to another.
//!
//! Dirtiness is pull based: after a proposal edits some slots, the graph
//! visits the quantities downstream of the changed set in topological order
//! and asks each one whether it needs recomputing. Values are recomputed on
//! read.

mod builder;
mod calculation;

pub use builder::GraphBuilder;
pub use calculation::{Calculation, FnCalculation, InputView, LogDensitySum, NodeRef, QuantityId};

use std::collections::{HashMap, HashSet};
use std::fmt::{self, Write as _};

use crate::state::{SlotId, StateStore};

/// Cached value plus its step-scoped snapshot.
#[derive(Debug, Clone)]
pub(crate) struct Cell {
    pub(crate) value: Vec<f64>,
    stored: Vec<f64>,
    /// Stale: must be recomputed before the next read.
    pub(crate) dirty: bool,
    /// Recomputed during the current step.
    pub(crate) updated: bool,
    stored_dirty: bool,
    stored_this_step: bool,
}

impl Default for Cell {
    fn default() -> Self {
        Self {
            value: Vec::new(),
            stored: Vec::new(),
            dirty: true,
            updated: false,
            stored_dirty: true,
            stored_this_step: false,
        }
    }
}

/// The dependency graph of cached quantities.
pub struct CalcGraph {
    names: Vec<String>,
    by_name: HashMap<String, QuantityId>,
    calcs: Vec<Box<dyn Calculation>>,
    inputs: Vec<Vec<NodeRef>>,
    cells: Vec<Cell>,
    slot_readers: Vec<Vec<QuantityId>>,
    readers: Vec<Vec<QuantityId>>,
    topo: Vec<QuantityId>,
    /// Ancestors of each quantity (itself included), in topological order.
    upstream: Vec<Vec<QuantityId>>,
    affected_cache: HashMap<Vec<SlotId>, Vec<QuantityId>>,
    affected: Vec<QuantityId>,
    evaluated: Vec<QuantityId>,
    checked_generation: Option<u64>,
    scratch: Vec<f64>,
}

impl fmt::Debug for CalcGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CalcGraph")
            .field("quantities", &self.names)
            .field("affected", &self.affected)
            .field("checked_generation", &self.checked_generation)
            .finish_non_exhaustive()
    }
}

impl CalcGraph {
    /// Number of quantities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Whether the graph has no quantities.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Name of `q`.
    #[must_use]
    pub fn name(&self, q: QuantityId) -> &str {
        &self.names[q.0]
    }

    /// Quantity registered under `name`.
    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<QuantityId> {
        self.by_name.get(name).copied()
    }

    /// Input edges of `q`, in declaration order.
    #[must_use]
    pub fn inputs(&self, q: QuantityId) -> &[NodeRef] {
        &self.inputs[q.0]
    }

    /// Cached value without triggering recomputation.
    #[must_use]
    pub fn cached(&self, q: QuantityId) -> &[f64] {
        &self.cells[q.0].value
    }

    /// Whether `q` must be recomputed before its next read.
    ///
    /// Inside an edit session this runs the dirtiness pass for any edits
    /// made since the last check, so it agrees with what `get` would do.
    pub fn is_dirty(&mut self, state: &StateStore, q: QuantityId) -> bool {
        if state.in_session() && self.checked_generation != Some(state.generation()) {
            self.check_dirtiness(state);
        }
        self.cells[q.0].dirty
    }

    /// Quantities downstream of `changed`, in topological order.
    ///
    /// Results are cached per changed set; proposals tend to touch the same
    /// few slot combinations over and over.
    pub fn affected_by(&mut self, changed: &[SlotId]) -> &[QuantityId] {
        let mut key = changed.to_vec();
        key.sort_unstable();
        key.dedup();
        if !self.affected_cache.contains_key(&key) {
            let closure = self.downstream_closure(&key);
            self.affected_cache.insert(key.clone(), closure);
        }
        self.affected_cache.get(&key).map(Vec::as_slice).unwrap_or_default()
    }

    fn downstream_closure(&self, slots: &[SlotId]) -> Vec<QuantityId> {
        let mut marked = vec![false; self.len()];
        let mut stack: Vec<QuantityId> = slots
            .iter()
            .filter_map(|s| self.slot_readers.get(s.index()))
            .flatten()
            .copied()
            .collect();
        while let Some(q) = stack.pop() {
            if !marked[q.0] {
                marked[q.0] = true;
                stack.extend(self.readers[q.0].iter().copied());
            }
        }
        self.topo.iter().copied().filter(|q| marked[q.0]).collect()
    }

    /// Whether a change to `slot` can reach `target`.
    pub fn reaches(&mut self, slot: SlotId, target: QuantityId) -> bool {
        self.affected_by(&[slot]).contains(&target)
    }

    /// Snapshots and re-evaluates dirtiness of everything downstream of the
    /// slots changed in the current step.
    pub fn check_dirtiness(&mut self, state: &StateStore) {
        let affected = self.affected_by(state.changed_slots()).to_vec();
        for &q in &affected {
            let cell = &mut self.cells[q.0];
            if !cell.stored_this_step {
                cell.stored.clone_from(&cell.value);
                cell.stored_dirty = cell.dirty;
                cell.stored_this_step = true;
                self.calcs[q.0].store();
            }
            if !self.cells[q.0].dirty {
                let view = InputView {
                    state,
                    cells: &self.cells,
                    inputs: &self.inputs[q.0],
                };
                let stale = self.calcs[q.0].requires_recalculation(&view);
                self.cells[q.0].dirty = stale;
            }
        }
        self.affected = affected;
        self.checked_generation = Some(state.generation());
    }

    /// Current value of `q`, recomputing whatever is stale upstream.
    pub fn get(&mut self, state: &StateStore, q: QuantityId) -> &[f64] {
        if self.checked_generation != Some(state.generation()) {
            self.check_dirtiness(state);
        }
        for k in 0..self.upstream[q.0].len() {
            let u = self.upstream[q.0][k];
            if self.cells[u.0].dirty {
                self.evaluate(state, u);
            }
        }
        &self.cells[q.0].value
    }

    /// Scalar log-density of `q`. An empty value reads as NaN.
    pub fn log_density(&mut self, state: &StateStore, q: QuantityId) -> f64 {
        self.get(state, q).first().copied().unwrap_or(f64::NAN)
    }

    fn evaluate(&mut self, state: &StateStore, q: QuantityId) {
        let mut out = std::mem::take(&mut self.scratch);
        out.clear();
        {
            let view = InputView {
                state,
                cells: &self.cells,
                inputs: &self.inputs[q.0],
            };
            self.calcs[q.0].calculate(&view, &mut out);
        }
        let cell = &mut self.cells[q.0];
        std::mem::swap(&mut cell.value, &mut out);
        cell.dirty = false;
        if !cell.updated {
            cell.updated = true;
            self.evaluated.push(q);
        }
        self.scratch = out;
    }

    /// Commits the current step.
    pub fn accept(&mut self) {
        for &q in &self.affected {
            let cell = &mut self.cells[q.0];
            if cell.stored_this_step {
                cell.stored_this_step = false;
                self.calcs[q.0].accept();
            }
        }
        self.end_step();
    }

    /// Rolls back every quantity snapshotted in the current step.
    pub fn restore(&mut self) {
        for &q in &self.affected {
            let cell = &mut self.cells[q.0];
            if cell.stored_this_step {
                std::mem::swap(&mut cell.value, &mut cell.stored);
                cell.dirty = cell.stored_dirty;
                cell.stored_this_step = false;
                self.calcs[q.0].restore();
            }
        }
        self.end_step();
    }

    fn end_step(&mut self) {
        for q in self.evaluated.drain(..) {
            self.cells[q.0].updated = false;
        }
        self.affected.clear();
        self.checked_generation = None;
    }

    /// Full, non-lazy recomputation of `q`.
    ///
    /// Marks the whole state dirty, recomputes every quantity and commits,
    /// leaving slots and quantities clean. Must be called between steps.
    pub fn robust_log_density(&mut self, state: &mut StateStore, q: QuantityId) -> f64 {
        state.store();
        state.set_everything_dirty(true);
        self.check_dirtiness(state);
        for k in 0..self.topo.len() {
            let u = self.topo[k];
            self.cells[u.0].dirty = true;
            self.evaluate(state, u);
        }
        let value = self.cells[q.0].value.first().copied().unwrap_or(f64::NAN);
        state.set_everything_dirty(false);
        state.accept();
        self.accept();
        value
    }

    /// Tree of everything feeding `root`, with current and stored values.
    ///
    /// Entries that changed in the current step are marked with `**`.
    #[must_use]
    pub fn report(&self, state: &StateStore, root: QuantityId) -> String {
        let mut out = String::new();
        let mut seen = HashSet::new();
        self.report_node(state, NodeRef::Quantity(root), 0, &mut seen, &mut out);
        out
    }

    fn report_node(
        &self,
        state: &StateStore,
        node: NodeRef,
        depth: usize,
        seen: &mut HashSet<NodeRef>,
        out: &mut String,
    ) {
        let indent = "    ".repeat(depth);
        match node {
            NodeRef::Slot(id) => {
                let slot = state.slot(id);
                let marker = if slot.is_dirty() { " **" } else { "" };
                let _ = writeln!(out, "{indent}{slot}{marker}");
            }
            NodeRef::Quantity(q) => {
                let cell = &self.cells[q.0];
                let changed = cell.dirty || (cell.stored_this_step && cell.value != cell.stored);
                let marker = if changed { " **" } else { "" };
                let stored = if cell.stored_this_step { &cell.stored } else { &cell.value };
                let _ = writeln!(
                    out,
                    "{indent}{}: {} (stored {}){marker}",
                    self.names[q.0],
                    join(&cell.value),
                    join(stored)
                );
                if !seen.insert(node) {
                    return;
                }
                for input in &self.inputs[q.0] {
                    self.report_node(state, *input, depth + 1, seen, out);
                }
            }
        }
    }
}

fn join(values: &[f64]) -> String {
    values.iter().map(ToString::to_string).collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{SlotValue, VersionedSlot};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Counted {
        calls: Arc<AtomicUsize>,
    }

    impl Calculation for Counted {
        fn calculate(&mut self, inputs: &InputView<'_>, out: &mut Vec<f64>) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let s = inputs.slot(0).and_then(SlotValue::as_reals).map_or(0.0, |v| v.iter().sum());
            out.push(-s);
        }
    }

    fn fixture() -> (StateStore, CalcGraph, Arc<AtomicUsize>) {
        let mut state = StateStore::new();
        state.add(VersionedSlot::real("x", vec![1.0, 2.0]).unwrap()).unwrap();
        state.add(VersionedSlot::real("y", vec![3.0]).unwrap()).unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let graph = GraphBuilder::new()
            .quantity("prior_x", &["x"], Counted { calls: Arc::clone(&calls) })
            .quantity("prior_y", &["y"], FnCalculation::new(|v: &InputView<'_>| -v.scalar(0)))
            .log_density_sum("posterior", &["prior_x", "prior_y"])
            .build(&state)
            .unwrap();
        (state, graph, calls)
    }

    #[test]
    fn lazily_recomputes_only_affected() {
        let (mut state, mut graph, calls) = fixture();
        let post = graph.lookup("posterior").unwrap();
        assert_eq!(graph.robust_log_density(&mut state, post), -6.0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let y = state.lookup("y").unwrap();
        state.store();
        state.begin_edit(y, "p").unwrap().set_real(0, 4.0).unwrap();
        assert_eq!(graph.log_density(&state, post), -7.0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        graph.accept();
        state.accept();
        state.set_everything_dirty(false);
    }

    #[test]
    fn restore_brings_back_cached_values() {
        let (mut state, mut graph, _) = fixture();
        let post = graph.lookup("posterior").unwrap();
        graph.robust_log_density(&mut state, post);

        let x = state.lookup("x").unwrap();
        state.store();
        state.begin_edit(x, "p").unwrap().set_real(0, 10.0).unwrap();
        assert_eq!(graph.log_density(&state, post), -15.0);
        state.restore();
        graph.restore();
        state.set_everything_dirty(false);

        assert!(!graph.is_dirty(&state, post));
        assert_eq!(graph.cached(post), &[-6.0]);
        assert_eq!(graph.robust_log_density(&mut state, post), -6.0);
    }

    #[test]
    fn affected_sets_follow_topology() {
        let (state, mut graph, _) = fixture();
        let x = state.lookup("x").unwrap();
        let names: Vec<_> = graph
            .affected_by(&[x])
            .to_vec()
            .into_iter()
            .map(|q| graph.name(q).to_string())
            .collect();
        assert_eq!(names, vec!["prior_x", "posterior"]);
        let post = graph.lookup("posterior").unwrap();
        assert!(graph.reaches(x, post));
    }

    #[test]
    fn report_marks_changed_entries() {
        let (mut state, mut graph, _) = fixture();
        let post = graph.lookup("posterior").unwrap();
        graph.robust_log_density(&mut state, post);
        let x = state.lookup("x").unwrap();
        state.store();
        state.begin_edit(x, "p").unwrap().set_real(1, 0.0).unwrap();
        graph.log_density(&state, post);
        let report = graph.report(&state, post);
        assert!(report.starts_with("posterior: -4 (stored -6) **"));
        assert!(report.contains("x[2] (-inf,inf): 1 0 **"));
        assert!(report.contains("prior_y: -3 (stored -3)\n"));
    }
}
