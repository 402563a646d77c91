//! Sample loggers.
//!
//! The chain hands every logged sample to each [`SampleLogger`] it owns.
//! A row is the sample number followed by one value per column; the column
//! names are fixed when the logger is initialised.

use std::io::Write;

use crate::error::PersistenceError;
use crate::state::StateStore;

/// Receives samples at the configured cadence.
pub trait SampleLogger: Send {
    /// Name used in error messages.
    fn name(&self) -> &str;

    /// Called once before the first sample. `resuming` is true when the
    /// chain continues from a checkpoint and output already exists.
    fn init(&mut self, columns: &[String], resuming: bool) -> Result<(), PersistenceError>;

    /// Writes one sample row.
    fn log(&mut self, sample: u64, values: &[f64]) -> Result<(), PersistenceError>;

    /// Flushes buffered output. Called once, also after a requested stop.
    fn close(&mut self) -> Result<(), PersistenceError>;
}

/// Column names for a state: the posterior, then one column per slot
/// element (`name` for scalars, `name.1`, `name.2`, ... otherwise).
#[must_use]
pub fn columns(posterior: &str, state: &StateStore) -> Vec<String> {
    let mut cols = vec![posterior.to_string()];
    for slot in state.slots() {
        if slot.dimension() == 1 {
            cols.push(slot.name().to_string());
        } else {
            cols.extend((1..=slot.dimension()).map(|i| format!("{}.{i}", slot.name())));
        }
    }
    cols
}

/// Row matching [`columns`].
#[must_use]
pub fn row(log_density: f64, state: &StateStore) -> Vec<f64> {
    let mut values = vec![log_density];
    for slot in state.slots() {
        let v = slot.value();
        values.extend((0..v.len()).filter_map(|i| v.as_f64(i)));
    }
    values
}

/// Tab-separated trace output.
#[derive(Debug)]
pub struct TraceLogger<W: Write + Send> {
    name: String,
    out: W,
}

impl<W: Write + Send> TraceLogger<W> {
    /// Writes to `out`; `name` shows up in errors.
    pub fn new(name: impl Into<String>, out: W) -> Self {
        Self { name: name.into(), out }
    }

    /// Returns the underlying writer.
    pub fn into_inner(self) -> W {
        self.out
    }

    fn fail(&self, e: &std::io::Error) -> PersistenceError {
        PersistenceError::Logger {
            logger: self.name.clone(),
            message: e.to_string(),
        }
    }
}

impl<W: Write + Send> SampleLogger for TraceLogger<W> {
    fn name(&self) -> &str {
        &self.name
    }

    fn init(&mut self, columns: &[String], resuming: bool) -> Result<(), PersistenceError> {
        if resuming {
            return Ok(());
        }
        let header = std::iter::once("Sample")
            .chain(columns.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join("\t");
        writeln!(self.out, "{header}").map_err(|e| self.fail(&e))
    }

    fn log(&mut self, sample: u64, values: &[f64]) -> Result<(), PersistenceError> {
        let mut line = sample.to_string();
        for v in values {
            line.push('\t');
            line.push_str(&v.to_string());
        }
        writeln!(self.out, "{line}").map_err(|e| self.fail(&e))
    }

    fn close(&mut self) -> Result<(), PersistenceError> {
        self.out.flush().map_err(|e| self.fail(&e))
    }
}

/// Keeps samples in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryLogger {
    /// Header passed to `init`.
    pub columns: Vec<String>,
    /// Sample number and values of every logged row.
    pub rows: Vec<(u64, Vec<f64>)>,
    /// Set once `close` has run.
    pub closed: bool,
}

impl MemoryLogger {
    /// Empty logger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl SampleLogger for MemoryLogger {
    fn name(&self) -> &str {
        "memory"
    }

    fn init(&mut self, columns: &[String], _resuming: bool) -> Result<(), PersistenceError> {
        self.columns = columns.to_vec();
        self.closed = false;
        Ok(())
    }

    fn log(&mut self, sample: u64, values: &[f64]) -> Result<(), PersistenceError> {
        self.rows.push((sample, values.to_vec()));
        Ok(())
    }

    fn close(&mut self) -> Result<(), PersistenceError> {
        self.closed = true;
        Ok(())
    }
}

/// Sends samples to a shared [`MemoryLogger`], so a caller can read them
/// after handing the logger to a chain.
#[derive(Debug, Clone, Default)]
pub struct SharedMemoryLogger {
    inner: std::sync::Arc<std::sync::Mutex<MemoryLogger>>,
}

impl SharedMemoryLogger {
    /// Empty shared logger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything logged so far.
    #[must_use]
    pub fn snapshot(&self) -> MemoryLogger {
        self.inner.lock().map(|m| m.clone()).unwrap_or_default()
    }

    fn with<T>(&self, f: impl FnOnce(&mut MemoryLogger) -> T) -> Result<T, PersistenceError> {
        let mut guard = self.inner.lock().map_err(|_| PersistenceError::Logger {
            logger: "memory".to_string(),
            message: "lock poisoned".to_string(),
        })?;
        Ok(f(&mut guard))
    }
}

impl SampleLogger for SharedMemoryLogger {
    fn name(&self) -> &str {
        "memory"
    }

    fn init(&mut self, columns: &[String], resuming: bool) -> Result<(), PersistenceError> {
        self.with(|m| m.init(columns, resuming))?
    }

    fn log(&mut self, sample: u64, values: &[f64]) -> Result<(), PersistenceError> {
        self.with(|m| m.log(sample, values))?
    }

    fn close(&mut self) -> Result<(), PersistenceError> {
        self.with(MemoryLogger::close)?
    }
}
