//! Checkpoint and resume tests.
//!
//! A chain stopped at a checkpoint and resumed in a fresh process must
//! continue exactly as if it had never stopped.

use std::path::Path;

use mhchain::chain::{ChainBuilder, SharedMemoryLogger};
use mhchain::graph::{FnCalculation, GraphBuilder, InputView};
use mhchain::proposal::{RandomWalkProposal, ScaleProposal};
use mhchain::{Bounds, Chain, ChainConfig, Checkpoint, SlotValue, StateStore, VersionedSlot};
use tempfile::tempdir;

/// Two-parameter model: mu ~ N(0, sigma), sigma ~ Exp(1).
fn build(length: u64, checkpoint: &Path, logger: &SharedMemoryLogger) -> Chain {
    let mut state = StateStore::new();
    state.add(VersionedSlot::real("mu", vec![0.3, -0.2]).unwrap()).unwrap();
    state
        .add(VersionedSlot::new("sigma", SlotValue::Real(vec![1.0]), Bounds::non_negative()).unwrap())
        .unwrap();
    let graph = GraphBuilder::new()
        .quantity(
            "mu.density",
            &["mu", "sigma"],
            FnCalculation::new(|v: &InputView<'_>| {
                let sigma = v.scalar(1);
                let mu = v.slot(0).and_then(SlotValue::as_reals).unwrap_or_default();
                mu.iter().map(|x| -0.5 * (x / sigma).powi(2) - sigma.ln()).sum()
            }),
        )
        .quantity("sigma.prior", &["sigma"], FnCalculation::new(|v: &InputView<'_>| -v.scalar(0)))
        .log_density_sum("posterior", &["mu.density", "sigma.prior"]);

    let mut cfg = ChainConfig::with_length(length);
    cfg.seed = 99;
    cfg.log_every = 1;
    cfg.store_every = 500;
    cfg.auto_optimize_delay = 200;
    cfg.self_check_every = 250;
    ChainBuilder::new(cfg)
        .state(state)
        .graph(graph)
        .proposal(RandomWalkProposal::new("muWalk", "mu", 0.8).with_weight(2.0))
        .proposal(ScaleProposal::new("sigmaScaler", "sigma", 0.5))
        .logger(logger.clone())
        .checkpoint(checkpoint)
        .build()
        .unwrap()
}

#[test]
fn test_resume_reproduces_uninterrupted_run() {
    let dir = tempdir().unwrap();

    // Uninterrupted reference run.
    let reference_log = SharedMemoryLogger::new();
    let mut reference = build(2_000, &dir.path().join("reference.ckpt"), &reference_log);
    reference.run().unwrap();

    // First half, then a "restart" with a freshly built chain.
    let half = dir.path().join("half.ckpt");
    let first_log = SharedMemoryLogger::new();
    let summary = build(1_000, &half, &first_log).run().unwrap();
    assert_eq!(summary.iterations, 1_000);

    let ckpt = Checkpoint::read(&half).unwrap();
    assert_eq!(ckpt.completed, 1_000);

    let second_log = SharedMemoryLogger::new();
    let mut resumed = build(2_000, &half, &second_log);
    resumed.resume_from(&half).unwrap();
    assert_eq!(resumed.next_iteration(), 1_000);
    let summary = resumed.run().unwrap();
    assert_eq!(summary.started_at, 1_000);
    assert_eq!(summary.iterations, 2_000);

    // Slot values are bit-identical.
    assert_eq!(resumed.state().checksums(), reference.state().checksums());

    // Same samples, same accept/reject history.
    let reference_rows = reference_log.snapshot().rows;
    let mut stitched = first_log.snapshot().rows;
    stitched.extend(second_log.snapshot().rows);
    assert_eq!(stitched.len(), reference_rows.len());
    for (a, b) in stitched.iter().zip(&reference_rows) {
        assert_eq!(a.0, b.0);
        let a_bits: Vec<u64> = a.1.iter().map(|x| x.to_bits()).collect();
        let b_bits: Vec<u64> = b.1.iter().map(|x| x.to_bits()).collect();
        assert_eq!(a_bits, b_bits, "sample {}", a.0);
    }
    for i in 0..2 {
        assert_eq!(resumed.scheduler().stats(i), reference.scheduler().stats(i));
        assert_eq!(
            resumed.scheduler().proposal(i).tuning().map(f64::to_bits),
            reference.scheduler().proposal(i).tuning().map(f64::to_bits)
        );
    }
    assert_eq!(resumed.scheduler().delay_count(), reference.scheduler().delay_count());
}

#[test]
fn test_resume_rejects_foreign_checkpoint() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("chain.ckpt");
    build(100, &path, &SharedMemoryLogger::new()).run().unwrap();

    let mut state = StateStore::new();
    state.add(VersionedSlot::real("theta", vec![0.0]).unwrap()).unwrap();
    let mut other = ChainBuilder::new(ChainConfig::with_length(200))
        .state(state)
        .graph(
            GraphBuilder::new()
                .quantity("prior", &["theta"], FnCalculation::new(|v: &InputView<'_>| -v.scalar(0).abs()))
                .log_density_sum("posterior", &["prior"]),
        )
        .proposal(RandomWalkProposal::new("thetaWalk", "theta", 1.0))
        .build()
        .unwrap();
    let err = other.resume_from(&path).unwrap_err();
    assert!(err.is_config());
}

#[test]
fn test_resume_rejects_corrupt_checkpoint() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("chain.ckpt");
    build(100, &path, &SharedMemoryLogger::new()).run().unwrap();

    let text = std::fs::read_to_string(&path).unwrap();
    std::fs::write(&path, &text[..text.len() - 20]).unwrap();

    let mut chain = build(200, &path, &SharedMemoryLogger::new());
    let err = chain.resume_from(&path).unwrap_err();
    assert!(err.is_persistence());
}

#[test]
fn test_checkpoint_longer_than_chain_is_rejected() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("chain.ckpt");
    build(600, &path, &SharedMemoryLogger::new()).run().unwrap();
    let mut short = build(500, &path, &SharedMemoryLogger::new());
    assert!(short.resume_from(&path).unwrap_err().is_config());
}

#[test]
fn test_stopped_run_can_be_resumed() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("chain.ckpt");
    let mut chain = build(1_000, &path, &SharedMemoryLogger::new());
    chain.stop_handle().request_stop();
    let summary = chain.run().unwrap();
    assert!(summary.stopped);
    assert_eq!(Checkpoint::read(&path).unwrap().completed, 1);

    let mut resumed = build(1_000, &path, &SharedMemoryLogger::new());
    resumed.resume_from(&path).unwrap();
    let summary = resumed.run().unwrap();
    assert_eq!(summary.iterations, 1_000);
    assert!(!summary.stopped);
}
