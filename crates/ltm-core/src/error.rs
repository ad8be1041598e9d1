//! Failure taxonomy for tunnel supervision.
//!
//! Most variants are handled where they are detected and only logged;
//! `SpawnExhausted` and `Io` are the ones that end a supervisor cycle.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while supervising a tunnel.
#[derive(Error, Debug)]
pub enum TunnelError {
    /// The tunnel binary could not be launched or exited right away.
    #[error("failed to spawn tunnel on port {port}: {reason}")]
    SpawnFailed { port: u16, reason: String },

    /// No URL appeared after the whole retry and cooldown schedule.
    #[error("no tunnel URL after {attempts} polls across {cycles} cycles")]
    SpawnExhausted { attempts: u32, cycles: u32 },

    /// Fewer probe methods than the quorum reported success.
    #[error("connectivity inconclusive for {url}: {successes}/{methods} methods succeeded")]
    ProbeInconclusive {
        url: String,
        successes: usize,
        methods: usize,
    },

    /// A PID file pointed at a process that no longer exists.
    #[error("stale PID file for port {port} (PID {pid})")]
    StaleProcess { port: u16, pid: u32 },

    /// A session transition was requested from the wrong state.
    #[error("session invariant violated: {0}")]
    SessionInvariantViolation(String),

    /// The URL of an orphaned session could not be determined.
    #[error("could not recover URL of orphaned session started at {started}")]
    RecoveryIncomplete { started: String },

    /// A candidate URL is not an absolute http(s) URL with a host.
    #[error("invalid tunnel URL: {0}")]
    InvalidUrl(String),

    /// Filesystem error on one of the files the supervisor owns.
    #[error("{context} ({}): {source}", path.display())]
    Io {
        context: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl TunnelError {
    /// Wraps an I/O error with the operation and path it came from.
    pub fn io(context: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            context,
            path: path.into(),
            source,
        }
    }

    /// Returns true for failures that end a cycle without being a bug.
    #[must_use]
    pub fn is_expected(&self) -> bool {
        !matches!(self, Self::Io { .. })
    }
}

/// Result type for supervision operations.
pub type TunnelResult<T> = Result<T, TunnelError>;
