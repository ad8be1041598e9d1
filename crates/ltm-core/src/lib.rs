//! LTM Core - Shared types for localtunnel supervision
//!
//! This crate provides the domain types shared between the supervisor
//! daemon (ltmd) and anything that reads its on-disk state, such as a
//! dashboard.
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()`, or direct indexing `[i]`.

pub mod error;
pub mod history;
pub mod retry;
pub mod session;
pub mod status;

// Re-exports for convenience
pub use error::{TunnelError, TunnelResult};
pub use history::{HistoryEntry, HistoryParseError, RECOVERED_MARKER};
pub use retry::RetryPolicy;
pub use session::{OpenSession, SessionDuration, TunnelSession, UNKNOWN_URL};
pub use status::{ProbeVote, StatusSnapshot, SupervisorPhase, TunnelState};
