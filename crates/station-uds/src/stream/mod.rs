//! Continuous sampling of one DID
//!
//! A [`StreamPump`] owns the bus for its whole run and reports a sequence of
//! [`StreamEvent`]s that always ends with exactly one terminal event.

mod pump;

pub use pump::{StreamHandle, StreamPump};

use std::fmt;

use tokio::time::Instant;

use crate::error::DiagnosticError;

/// Lifecycle of a pump: `Idle -> Running -> {Stopped, Failed}`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpState {
    Idle,
    Running,
    /// Cancelled, or the consumer went away
    Stopped,
    /// Consecutive-failure threshold reached, or the bus was unusable
    Failed,
}

impl PumpState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }
}

impl fmt::Display for PumpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// One item of a stream run
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent<T> {
    /// Decoded value of tick `sequence`
    Sample {
        sequence: u64,
        value: T,
        at: Instant,
    },
    /// Tick `sequence` produced no value
    NoData {
        sequence: u64,
        error: DiagnosticError,
    },
    /// Terminal: the run was cancelled
    Stopped,
    /// Terminal: too many consecutive failures
    Failed {
        consecutive_failures: u32,
        last_error: DiagnosticError,
    },
}

impl<T> StreamEvent<T> {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Failed { .. })
    }
}
