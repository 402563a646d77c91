use criterion::{criterion_group, criterion_main, BatchSize, Criterion, Throughput};

use mhchain::chain::ChainBuilder;
use mhchain::graph::{FnCalculation, GraphBuilder, InputView};
use mhchain::proposal::{RandomWalkProposal, ScaleProposal};
use mhchain::{Bounds, Chain, ChainConfig, SlotValue, StateStore, VersionedSlot};

const PARAMETERS: usize = 32;
const ITERATIONS: u64 = 10_000;

/// Independent normal terms, one quantity per parameter, so each step
/// recomputes a single term and the sum.
fn wide_model() -> Chain {
    let mut state = StateStore::new();
    let mut graph = GraphBuilder::new();
    let mut terms = Vec::with_capacity(PARAMETERS);
    for i in 0..PARAMETERS {
        let slot = format!("x{i}");
        state.add(VersionedSlot::real(slot.clone(), vec![0.0]).unwrap()).unwrap();
        let term = format!("term{i}");
        graph = graph.quantity(
            term.clone(),
            &[slot.as_str()],
            FnCalculation::new(|v: &InputView<'_>| -0.5 * v.scalar(0).powi(2)),
        );
        terms.push(term);
    }
    state
        .add(VersionedSlot::new("scale", SlotValue::Real(vec![1.0]), Bounds::non_negative()).unwrap())
        .unwrap();
    graph = graph.quantity("scale.prior", &["scale"], FnCalculation::new(|v: &InputView<'_>| -v.scalar(0)));
    terms.push("scale.prior".to_string());
    let names: Vec<&str> = terms.iter().map(String::as_str).collect();
    graph = graph.log_density_sum("posterior", &names);

    let mut cfg = ChainConfig::with_length(ITERATIONS);
    cfg.auto_optimize_delay = 1_000;
    let mut builder = ChainBuilder::new(cfg).state(state).graph(graph);
    for i in 0..PARAMETERS {
        builder = builder.proposal(RandomWalkProposal::new(format!("walk{i}"), format!("x{i}"), 1.0));
    }
    builder
        .proposal(ScaleProposal::new("scaler", "scale", 0.5))
        .build()
        .unwrap()
}

fn bench_chain(c: &mut Criterion) {
    let mut group = c.benchmark_group("chain");
    group.throughput(Throughput::Elements(ITERATIONS));
    group.sample_size(20);
    group.bench_function("wide_model_10k_iterations", |b| {
        b.iter_batched(wide_model, |mut chain| chain.run().unwrap(), BatchSize::LargeInput);
    });
    group.finish();
}

criterion_group!(benches, bench_chain);
criterion_main!(benches);
