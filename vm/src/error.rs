use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// One entry of a managed stack trace, innermost first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceFrame {
    pub function: String,
    pub offset: u32,
}

impl fmt::Display for TraceFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "at {} (offset {})", self.function, self.offset)
    }
}

/// A managed exception that escaped its thread's root frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UncaughtException {
    pub class_name: String,
    pub message: String,
    pub trace: Vec<TraceFrame>,
}

impl UncaughtException {
    /// Function name and bytecode offset of the throw site.
    pub fn origin(&self) -> (&str, u32) {
        self.trace
            .first()
            .map(|t| (t.function.as_str(), t.offset))
            .unwrap_or(("<unknown>", 0))
    }
}

impl fmt::Display for UncaughtException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (function, offset) = self.origin();
        write!(
            f,
            "{} in `{}` at offset {}: {}",
            self.class_name, function, offset, self.message
        )?;
        for frame in &self.trace {
            write!(f, "\n  {frame}")?;
        }
        Ok(())
    }
}

/// Unrecoverable machine faults. Any of these terminates the whole machine
/// with a diagnostic; user handlers never see them.
#[derive(Debug, Error)]
pub enum FatalError {
    #[error("malformed bytecode in `{function}` at offset {offset}: {message}")]
    MalformedBytecode {
        function: String,
        offset: u32,
        message: String,
    },
    #[error("heap consistency violation: {0}")]
    HeapConsistency(String),
    #[error("collection timed out waiting for thread quiescence ({0:?})")]
    GcTimeout(Duration),
    #[error("heap reservation exhausted allocating {requested} bytes")]
    OutOfMemory { requested: usize },
}

/// Errors reported to the embedding host before execution starts. These
/// never enter the dispatch loop.
#[derive(Debug, Error)]
pub enum HostError {
    #[error("failed to read assembly image: {0}")]
    Io(#[from] std::io::Error),
    #[error("not an assembly image (bad magic)")]
    BadMagic,
    #[error("unsupported assembly image version {0}")]
    UnsupportedVersion(u32),
    #[error("assembly image is corrupt: {0}")]
    Corrupt(String),
    #[error("assembly failed validation: {0}")]
    Invalid(#[source] FatalError),
    #[error("unknown entry function `{0}`")]
    UnknownEntry(String),
}

/// How a call to [`Machine::run`](crate::Machine::run) can fail.
#[derive(Debug, Error)]
pub enum MachineError {
    #[error("uncaught exception: {0}")]
    UncaughtException(UncaughtException),
    #[error(transparent)]
    Fatal(#[from] FatalError),
}
