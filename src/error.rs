// error.rs

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Which half of the pipeline a fault came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Produce,
    Drain,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Produce => write!(f, "produce"),
            Stage::Drain => write!(f, "drain"),
        }
    }
}

/// Failure reported by a collaborator (compute op, transfer op or sink).
#[derive(Debug, Error)]
pub enum OpError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Transport error: {0}")]
    Transport(#[from] crate::transport::Error),
    #[error("Device error: {0}")]
    Device(String),
    #[error("Buffer size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: usize, actual: usize },
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Compute failed at iteration {iteration}: {source}")]
    Compute {
        iteration: u64,
        #[source]
        source: OpError,
    },
    #[error("Transfer failed at iteration {iteration}: {source}")]
    Transfer {
        iteration: u64,
        #[source]
        source: OpError,
    },
    #[error("Sink write failed at iteration {iteration}: {source}")]
    Sink {
        iteration: u64,
        #[source]
        source: OpError,
    },
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("Handoff wait for iteration {iteration} exceeded {timeout:?}")]
    HandoffTimeout { iteration: u64, timeout: Duration },
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("{0} stage panicked")]
    Panicked(Stage),
    #[error("Failed to spawn drain worker: {0}")]
    WorkerSpawn(#[source] std::io::Error),
}

/// Coarse classification of a [`PipelineError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    Compute,
    Transfer,
    Sink,
    ProtocolViolation,
    Timeout,
    Config,
    Panic,
}

impl PipelineError {
    pub fn kind(&self) -> FaultKind {
        match self {
            PipelineError::Compute { .. } => FaultKind::Compute,
            PipelineError::Transfer { .. } => FaultKind::Transfer,
            PipelineError::Sink { .. } => FaultKind::Sink,
            PipelineError::ProtocolViolation(_) => FaultKind::ProtocolViolation,
            PipelineError::HandoffTimeout { .. } => FaultKind::Timeout,
            PipelineError::InvalidConfig(_) => FaultKind::Config,
            PipelineError::Panicked(_) | PipelineError::WorkerSpawn(_) => FaultKind::Panic,
        }
    }

    /// Iteration the error is attached to, if any.
    pub fn iteration(&self) -> Option<u64> {
        match self {
            PipelineError::Compute { iteration, .. }
            | PipelineError::Transfer { iteration, .. }
            | PipelineError::Sink { iteration, .. }
            | PipelineError::HandoffTimeout { iteration, .. } => Some(*iteration),
            _ => None,
        }
    }
}

/// The first error recorded during a run, tagged with its originating stage.
#[derive(Debug, Error)]
#[error("{stage} stage fault: {error}")]
pub struct Fault {
    pub stage: Stage,
    #[source]
    pub error: PipelineError,
}

impl Fault {
    pub fn new(stage: Stage, error: PipelineError) -> Self {
        Self { stage, error }
    }

    pub fn kind(&self) -> FaultKind {
        self.error.kind()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fault_display_names_stage() {
        let fault = Fault::new(
            Stage::Drain,
            PipelineError::Transfer {
                iteration: 3,
                source: OpError::Device("read failed".into()),
            },
        );
        let msg = fault.to_string();
        assert!(msg.starts_with("drain stage fault"));
        assert!(msg.contains("iteration 3"));
        assert_eq!(fault.kind(), FaultKind::Transfer);
        assert_eq!(fault.error.iteration(), Some(3));
    }

    #[test]
    fn test_panic_has_no_iteration() {
        let err = PipelineError::Panicked(Stage::Produce);
        assert_eq!(err.to_string(), "produce stage panicked");
        assert_eq!(err.kind(), FaultKind::Panic);
        assert_eq!(err.iteration(), None);
    }

    #[test]
    fn test_io_error_converts() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "closed");
        let err: OpError = io.into();
        assert!(matches!(err, OpError::Io(_)));
    }
}
