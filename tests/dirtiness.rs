//! Dirtiness propagation and store/restore laws.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use mhchain::graph::{Calculation, FnCalculation, GraphBuilder, InputView};
use mhchain::{CalcGraph, QuantityId, SlotId, StateStore, VersionedSlot};
use proptest::prelude::*;

struct Model {
    state: StateStore,
    graph: CalcGraph,
    q: QuantityId,
    slots: [SlotId; 3],
    evaluations: Arc<AtomicUsize>,
}

fn sum_model() -> Model {
    let mut state = StateStore::new();
    let a = state.add(VersionedSlot::real("a", vec![1.0]).unwrap()).unwrap();
    let b = state.add(VersionedSlot::real("b", vec![2.0]).unwrap()).unwrap();
    let c = state.add(VersionedSlot::real("c", vec![3.0]).unwrap()).unwrap();
    let evaluations = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&evaluations);
    let graph = GraphBuilder::new()
        .quantity(
            "Q",
            &["a", "b", "c"],
            FnCalculation::new(move |v: &InputView<'_>| {
                counter.fetch_add(1, Ordering::SeqCst);
                v.scalar(0) + v.scalar(1) + v.scalar(2)
            }),
        )
        .build(&state)
        .unwrap();
    let q = graph.lookup("Q").unwrap();
    Model {
        state,
        graph,
        q,
        slots: [a, b, c],
        evaluations,
    }
}

#[test]
fn test_mutating_one_input_marks_only_dependents() {
    let mut m = sum_model();
    assert_eq!(m.graph.log_density(&m.state, m.q), 6.0);
    m.state.set_everything_dirty(false);
    let [a, b, c] = m.slots;

    m.state.store();
    m.state.begin_edit(a, "aWalk").unwrap().set_real(0, 10.0).unwrap();

    assert!(m.state.slot(a).is_dirty());
    assert!(!m.state.slot(b).is_dirty());
    assert!(!m.state.slot(c).is_dirty());
    // Reported before anything read Q.
    assert!(m.graph.is_dirty(&m.state, m.q));

    assert_eq!(m.graph.log_density(&m.state, m.q), 15.0);
    assert!(!m.graph.is_dirty(&m.state, m.q));
    m.state.accept();
    m.graph.accept();
    m.state.set_everything_dirty(false);
}

#[test]
fn test_clean_read_does_not_recompute() {
    let mut m = sum_model();
    m.graph.log_density(&m.state, m.q);
    m.state.set_everything_dirty(false);
    let before = m.evaluations.load(Ordering::SeqCst);

    // A step that touches nothing.
    m.state.store();
    assert!(!m.graph.is_dirty(&m.state, m.q));
    assert_eq!(m.graph.log_density(&m.state, m.q), 6.0);
    m.state.accept();
    m.graph.accept();
    assert_eq!(m.evaluations.load(Ordering::SeqCst), before);
}

#[test]
fn test_rejected_step_restores_cached_value() {
    let mut m = sum_model();
    m.graph.log_density(&m.state, m.q);
    m.state.set_everything_dirty(false);
    let [_, b, _] = m.slots;

    m.state.store();
    m.state.begin_edit(b, "bWalk").unwrap().set_real(0, -2.0).unwrap();
    assert_eq!(m.graph.log_density(&m.state, m.q), 2.0);
    m.state.restore();
    m.graph.restore();
    m.state.set_everything_dirty(false);

    assert_eq!(m.state.value_of("b").unwrap().as_reals().unwrap(), &[2.0]);
    assert_eq!(m.graph.cached(m.q), &[6.0]);
    let before = m.evaluations.load(Ordering::SeqCst);
    assert_eq!(m.graph.log_density(&m.state, m.q), 6.0);
    assert_eq!(m.evaluations.load(Ordering::SeqCst), before);
}

#[test]
fn test_robust_recomputation_matches_lazy_value() {
    let mut m = sum_model();
    let lazy = m.graph.log_density(&m.state, m.q);
    m.state.set_everything_dirty(false);
    let robust = m.graph.robust_log_density(&mut m.state, m.q);
    assert_eq!(lazy, robust);
    assert!(m.state.slots().all(|s| !s.is_dirty()));
    assert!(!m.graph.is_dirty(&m.state, m.q));
}

#[test]
fn test_edit_outside_session_is_refused() {
    let mut m = sum_model();
    let [a, _, _] = m.slots;
    assert!(m.state.begin_edit(a, "p").is_err());
    m.state.store();
    m.state.begin_edit(a, "p").unwrap();
    assert!(m.state.begin_edit(a, "q").is_err());
    m.state.restore();
}

/// Density of the first element only; the second element is bookkeeping.
struct HeadDensity {
    evaluations: Arc<AtomicUsize>,
}

impl Calculation for HeadDensity {
    fn calculate(&mut self, inputs: &InputView<'_>, out: &mut Vec<f64>) {
        self.evaluations.fetch_add(1, Ordering::SeqCst);
        out.push(-0.5 * inputs.scalar(0).powi(2));
    }

    fn requires_recalculation(&self, inputs: &InputView<'_>) -> bool {
        inputs.is_element_dirty(0, 0)
    }
}

#[test]
fn test_element_level_check_skips_unread_elements() {
    let mut state = StateStore::new();
    let v = state.add(VersionedSlot::real("v", vec![1.0, 5.0]).unwrap()).unwrap();
    let evaluations = Arc::new(AtomicUsize::new(0));
    let mut graph = GraphBuilder::new()
        .quantity(
            "head",
            &["v"],
            HeadDensity {
                evaluations: Arc::clone(&evaluations),
            },
        )
        .log_density_sum("posterior", &["head"])
        .build(&state)
        .unwrap();
    let head = graph.lookup("head").unwrap();
    let post = graph.lookup("posterior").unwrap();
    assert_eq!(graph.log_density(&state, post), -0.5);
    state.set_everything_dirty(false);
    assert_eq!(evaluations.load(Ordering::SeqCst), 1);

    // Element 1 is never read.
    state.store();
    state.begin_edit(v, "tailWalk").unwrap().set_real(1, 7.0).unwrap();
    assert!(!graph.is_dirty(&state, head));
    assert!(!graph.is_dirty(&state, post));
    assert_eq!(graph.log_density(&state, post), -0.5);
    assert_eq!(evaluations.load(Ordering::SeqCst), 1);
    state.accept();
    graph.accept();
    state.set_everything_dirty(false);

    state.store();
    state.begin_edit(v, "headWalk").unwrap().set_real(0, 2.0).unwrap();
    assert!(graph.is_dirty(&state, head));
    assert_eq!(graph.log_density(&state, post), -2.0);
    assert_eq!(evaluations.load(Ordering::SeqCst), 2);
    state.accept();
    graph.accept();
    state.set_everything_dirty(false);
}

proptest! {
    #[test]
    fn prop_store_mutate_restore_round_trips(
        edits in proptest::collection::vec((0usize..3, -1e6f64..1e6), 1..8)
    ) {
        let mut m = sum_model();
        let before_value = m.graph.log_density(&m.state, m.q);
        m.state.set_everything_dirty(false);
        let before = m.state.checksums();

        m.state.store();
        for (slot, x) in &edits {
            m.state.begin_edit(m.slots[*slot], "p").unwrap().set_real(0, *x).unwrap();
        }
        let _ = m.graph.log_density(&m.state, m.q);
        m.state.restore();
        m.graph.restore();
        m.state.set_everything_dirty(false);

        prop_assert_eq!(m.state.checksums(), before);
        prop_assert_eq!(m.graph.log_density(&m.state, m.q), before_value);
    }
}
