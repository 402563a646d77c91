//! Chain checkpoints.
//!
//! A checkpoint holds everything needed to continue a run: the number of
//! completed iterations, the random stream position, every slot value and
//! every proposal's tuning and counters. It is never trusted for the
//! posterior value, which is recomputed on resume.
//!
//! Files are written with the write-to-temp-then-rename pattern, so a crash
//! mid-write leaves the previous checkpoint intact.

mod codec;
pub mod float_text;

pub use codec::{CODEC_VERSION, MAGIC};

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{ChainResult, ConfigError, PersistenceError};
use crate::proposal::ChainRng;
use crate::schedule::{ProposalRecord, Scheduler};
use crate::state::{Bounds, SlotKind, SlotValue, StateStore};

/// Position of the shared random stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RngRecord {
    /// 32-byte seed, lowercase hex.
    pub seed: String,
    /// ChaCha stream number.
    pub stream: u64,
    /// Word position (a `u128`, kept as text).
    pub word_pos: String,
}

impl RngRecord {
    /// Records where `rng` is in its stream.
    #[must_use]
    pub fn capture(rng: &ChainRng) -> Self {
        Self {
            seed: rng.get_seed().iter().map(|b| format!("{b:02x}")).collect(),
            stream: rng.get_stream(),
            word_pos: rng.get_word_pos().to_string(),
        }
    }

    /// Rebuilds a generator at exactly the recorded position.
    pub fn restore(&self) -> Result<ChainRng, PersistenceError> {
        if self.seed.len() != 64 || !self.seed.is_ascii() {
            return Err(corrupt(format!("rng seed must be 64 hex digits, got '{}'", self.seed)));
        }
        let mut seed = [0u8; 32];
        for (i, byte) in seed.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&self.seed[2 * i..2 * i + 2], 16)
                .map_err(|e| corrupt(format!("rng seed is not hex: {e}")))?;
        }
        let word_pos: u128 = self
            .word_pos
            .parse()
            .map_err(|e| corrupt(format!("rng word position '{}': {e}", self.word_pos)))?;
        let mut rng = ChainRng::from_seed(seed);
        rng.set_stream(self.stream);
        rng.set_word_pos(word_pos);
        Ok(rng)
    }
}

/// One slot: identity, shape, bounds and current values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotRecord {
    /// Slot name.
    pub name: String,
    /// Element type.
    pub kind: SlotKind,
    /// Number of elements.
    pub dimension: usize,
    /// Lower bound.
    #[serde(with = "float_text")]
    pub lower: f64,
    /// Upper bound.
    #[serde(with = "float_text")]
    pub upper: f64,
    /// Values as lossless text.
    pub values: Vec<String>,
}

impl SlotRecord {
    fn from_value(name: &str, value: &SlotValue, bounds: Bounds) -> Self {
        let values = match value {
            SlotValue::Real(xs) => xs.iter().map(|x| float_text::encode(*x)).collect(),
            SlotValue::Integer(xs) => xs.iter().map(ToString::to_string).collect(),
            SlotValue::Boolean(xs) => xs.iter().map(ToString::to_string).collect(),
        };
        Self {
            name: name.to_string(),
            kind: value.kind(),
            dimension: value.len(),
            lower: bounds.lower,
            upper: bounds.upper,
            values,
        }
    }

    /// Parses the stored values back into a slot payload.
    pub fn value(&self) -> Result<SlotValue, PersistenceError> {
        if self.values.len() != self.dimension {
            return Err(corrupt(format!(
                "slot '{}' declares dimension {} but has {} value(s)",
                self.name,
                self.dimension,
                self.values.len()
            )));
        }
        let bad = |s: &String, e: &dyn std::fmt::Display| {
            corrupt(format!("slot '{}' has unreadable {} value '{s}': {e}", self.name, self.kind))
        };
        let value = match self.kind {
            SlotKind::Real => SlotValue::Real(
                self.values
                    .iter()
                    .map(|s| float_text::decode(s).map_err(|e| bad(s, &e)))
                    .collect::<Result<_, _>>()?,
            ),
            SlotKind::Integer => SlotValue::Integer(
                self.values
                    .iter()
                    .map(|s| s.parse::<i64>().map_err(|e| bad(s, &e)))
                    .collect::<Result<_, _>>()?,
            ),
            SlotKind::Boolean => SlotValue::Boolean(
                self.values
                    .iter()
                    .map(|s| s.parse::<bool>().map_err(|e| bad(s, &e)))
                    .collect::<Result<_, _>>()?,
            ),
        };
        Ok(value)
    }
}

/// A complete chain snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Number of iterations completed when the snapshot was taken.
    pub completed: u64,
    /// Wall-clock time of the snapshot.
    pub created_at: DateTime<Utc>,
    /// Random stream position.
    pub rng: RngRecord,
    /// Every slot, in registration order.
    pub slots: Vec<SlotRecord>,
    /// Every proposal, in schedule order.
    pub proposals: Vec<ProposalRecord>,
}

impl Checkpoint {
    /// Snapshots the chain between two iterations.
    #[must_use]
    pub fn capture(completed: u64, state: &StateStore, scheduler: &Scheduler, rng: &ChainRng) -> Self {
        Self {
            completed,
            created_at: Utc::now(),
            rng: RngRecord::capture(rng),
            slots: state
                .slots()
                .map(|s| SlotRecord::from_value(s.name(), s.value(), s.bounds()))
                .collect(),
            proposals: scheduler.records(),
        }
    }

    /// Encodes the checkpoint as framed text.
    pub fn to_text(&self) -> Result<String, PersistenceError> {
        codec::encode(self)
    }

    /// Decodes a checkpoint, verifying its frame and checksum.
    pub fn from_text(text: &str) -> Result<Self, PersistenceError> {
        codec::decode(text)
    }

    /// Atomically replaces the file at `path` with this checkpoint.
    pub fn write_atomic(&self, path: &Path) -> Result<(), PersistenceError> {
        let text = self.to_text()?;
        let mut writer = AtomicFile::create(path.to_path_buf())?;
        writer.write_all(text.as_bytes())?;
        writer.commit()?;
        info!(path = %path.display(), completed = self.completed, "checkpoint written");
        Ok(())
    }

    /// Reads and verifies a checkpoint file.
    pub fn read(path: &Path) -> Result<Self, PersistenceError> {
        let text = fs::read_to_string(path).map_err(|e| PersistenceError::io(path, e))?;
        Self::from_text(&text)
    }

    /// Overwrites every slot in `state` with the recorded values.
    ///
    /// The recorded slots must match the configured ones by name, element
    /// type and dimension. Differing bounds keep the configured bounds,
    /// as long as they admit the recorded values.
    pub fn apply_slots(&self, state: &mut StateStore) -> ChainResult<()> {
        if self.slots.len() != state.len() {
            return Err(mismatch(format!(
                "checkpoint has {} slot(s), the state has {}",
                self.slots.len(),
                state.len()
            )));
        }
        let mut parsed = Vec::with_capacity(self.slots.len());
        for record in &self.slots {
            let id = state
                .lookup(&record.name)
                .ok_or_else(|| mismatch(format!("slot '{}' in checkpoint is not in the state", record.name)))?;
            let slot = state.slot(id);
            if slot.value().kind() != record.kind || slot.dimension() != record.dimension {
                return Err(mismatch(format!(
                    "slot '{}' is {} x{} in the state but {} x{} in the checkpoint",
                    record.name,
                    slot.value().kind(),
                    slot.dimension(),
                    record.kind,
                    record.dimension
                )));
            }
            let value = record.value()?;
            let bounds = slot.bounds();
            if bounds.lower.to_bits() != record.lower.to_bits() || bounds.upper.to_bits() != record.upper.to_bits() {
                warn!(
                    slot = %record.name,
                    configured = %bounds,
                    recorded = %Bounds::new(record.lower, record.upper),
                    "slot bounds differ from checkpoint; keeping configured bounds"
                );
            }
            if !bounds.admits(&value) {
                return Err(mismatch(format!(
                    "recorded value of slot '{}' ({value}) lies outside its bounds {bounds}",
                    record.name
                )));
            }
            parsed.push((id, value));
        }
        for (id, value) in parsed {
            state.assign(id, value)?;
        }
        Ok(())
    }
}

fn corrupt(reason: impl Into<String>) -> PersistenceError {
    PersistenceError::Corrupt { reason: reason.into() }
}

fn mismatch(reason: impl Into<String>) -> crate::error::ChainError {
    ConfigError::CheckpointMismatch { reason: reason.into() }.into()
}

/// A file written under a temporary name and renamed into place on commit.
///
/// Dropping it uncommitted removes the temporary file.
struct AtomicFile {
    temp_path: Option<PathBuf>,
    final_path: PathBuf,
    writer: Option<BufWriter<File>>,
}

impl AtomicFile {
    fn create(final_path: PathBuf) -> Result<Self, PersistenceError> {
        let temp_path = final_path.with_extension(format!("ckpt.tmp.{}", Uuid::new_v4()));
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&temp_path)
            .map_err(|e| PersistenceError::io(&temp_path, e))?;
        Ok(Self {
            temp_path: Some(temp_path),
            final_path,
            writer: Some(BufWriter::new(file)),
        })
    }

    fn write_all(&mut self, bytes: &[u8]) -> Result<(), PersistenceError> {
        let path = self.temp_path.clone().unwrap_or_default();
        self.writer
            .as_mut()
            .ok_or_else(|| corrupt("checkpoint writer already committed"))?
            .write_all(bytes)
            .map_err(|e| PersistenceError::io(path, e))
    }

    /// Flush, fsync, rename. After this returns the checkpoint is durable.
    fn commit(mut self) -> Result<(), PersistenceError> {
        let temp_path = self.temp_path.clone().unwrap_or_default();
        let io = |e| PersistenceError::io(&temp_path, e);
        if let Some(mut writer) = self.writer.take() {
            writer.flush().map_err(io)?;
            writer.get_ref().sync_all().map_err(io)?;
        }
        fs::rename(&temp_path, &self.final_path).map_err(|e| PersistenceError::io(&self.final_path, e))?;
        self.temp_path = None;
        Ok(())
    }
}

impl Drop for AtomicFile {
    fn drop(&mut self) {
        self.writer.take();
        if let Some(ref temp_path) = self.temp_path {
            let _ = fs::remove_file(temp_path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChainConfig;
    use crate::proposal::ScaleProposal;
    use crate::state::VersionedSlot;
    use rand::Rng;

    fn sample_state() -> StateStore {
        let mut state = StateStore::new();
        state
            .add(VersionedSlot::new("kappa", SlotValue::Real(vec![0.1 + 0.2, 1e-300]), Bounds::non_negative()).unwrap())
            .unwrap();
        state
            .add(VersionedSlot::new("k", SlotValue::Integer(vec![3]), Bounds::new(0.0, 10.0)).unwrap())
            .unwrap();
        state
            .add(VersionedSlot::new("on", SlotValue::Boolean(vec![true, false]), Bounds::unbounded()).unwrap())
            .unwrap();
        state
    }

    fn sample_scheduler() -> Scheduler {
        let mut s = Scheduler::from_config(&ChainConfig::default());
        s.add_proposal(Box::new(ScaleProposal::new("kappaScaler", "kappa", 0.5))).unwrap();
        s.accept(0);
        s
    }

    #[test]
    fn test_rng_position_survives() {
        let mut rng = ChainRng::seed_from_u64(42);
        for _ in 0..37 {
            let _: f64 = rng.gen();
        }
        let mut back = RngRecord::capture(&rng).restore().unwrap();
        for _ in 0..10 {
            assert_eq!(rng.gen::<u64>(), back.gen::<u64>());
        }
    }

    #[test]
    fn test_write_read_apply() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chain.ckpt");
        let state = sample_state();
        let rng = ChainRng::seed_from_u64(7);
        let ckpt = Checkpoint::capture(1000, &state, &sample_scheduler(), &rng);
        ckpt.write_atomic(&path).unwrap();

        let back = Checkpoint::read(&path).unwrap();
        assert_eq!(back, ckpt);
        assert_eq!(back.completed, 1000);
        assert_eq!(back.proposals[0].stats.accepted, 1);

        let mut fresh = StateStore::new();
        fresh
            .add(VersionedSlot::new("kappa", SlotValue::Real(vec![1.0, 1.0]), Bounds::non_negative()).unwrap())
            .unwrap();
        fresh
            .add(VersionedSlot::new("k", SlotValue::Integer(vec![0]), Bounds::new(0.0, 10.0)).unwrap())
            .unwrap();
        fresh
            .add(VersionedSlot::new("on", SlotValue::Boolean(vec![false, false]), Bounds::unbounded()).unwrap())
            .unwrap();
        back.apply_slots(&mut fresh).unwrap();
        assert_eq!(fresh.checksums(), state.checksums());
        assert_eq!(fresh.value_of("kappa").unwrap().as_reals().unwrap()[0].to_bits(), (0.1f64 + 0.2).to_bits());
    }

    #[test]
    fn test_no_temp_files_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chain.ckpt");
        let ckpt = Checkpoint::capture(1, &sample_state(), &sample_scheduler(), &ChainRng::seed_from_u64(1));
        ckpt.write_atomic(&path).unwrap();
        ckpt.write_atomic(&path).unwrap();
        let names: Vec<_> = fs::read_dir(dir.path()).unwrap().map(|e| e.unwrap().file_name()).collect();
        assert_eq!(names, vec![std::ffi::OsString::from("chain.ckpt")]);
    }

    #[test]
    fn test_corrupted_file_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chain.ckpt");
        let ckpt = Checkpoint::capture(5, &sample_state(), &sample_scheduler(), &ChainRng::seed_from_u64(1));
        ckpt.write_atomic(&path).unwrap();
        let text = fs::read_to_string(&path).unwrap().replacen("kappaScaler", "kappaScalar", 1);
        fs::write(&path, text).unwrap();
        let err = Checkpoint::read(&path).unwrap_err();
        assert!(matches!(err, PersistenceError::Corrupt { .. }));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = Checkpoint::read(&dir.path().join("absent.ckpt")).unwrap_err();
        assert!(matches!(err, PersistenceError::Io { .. }));
    }

    #[test]
    fn test_identity_mismatch_is_config_error() {
        let ckpt = Checkpoint::capture(5, &sample_state(), &sample_scheduler(), &ChainRng::seed_from_u64(1));

        let mut other = StateStore::new();
        other.add(VersionedSlot::real("kappa", vec![1.0, 1.0]).unwrap()).unwrap();
        let err = ckpt.apply_slots(&mut other).unwrap_err();
        assert!(err.is_config());

        let mut renamed = sample_state();
        let mut wrong = ckpt.clone();
        wrong.slots[1].name = "n".to_string();
        assert!(wrong.apply_slots(&mut renamed).unwrap_err().is_config());

        let mut reshaped = ckpt;
        reshaped.slots[0].dimension = 3;
        reshaped.slots[0].values.push("1.0".to_string());
        assert!(reshaped.apply_slots(&mut renamed).unwrap_err().is_config());
    }

    #[test]
    fn test_garbled_value_is_corrupt() {
        let mut ckpt = Checkpoint::capture(5, &sample_state(), &sample_scheduler(), &ChainRng::seed_from_u64(1));
        ckpt.slots[1].values[0] = "three".to_string();
        let err = ckpt.apply_slots(&mut sample_state()).unwrap_err();
        assert!(err.is_persistence());
    }
}
