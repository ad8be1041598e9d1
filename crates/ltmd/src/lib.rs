//! LTM Daemon - localtunnel supervisor
//!
//! This crate provides the daemon's building blocks:
//! - `process` - spawning, liveness and termination of the relay client
//! - `url` - public URL detection from the client's output log
//! - `probe` - quorum connectivity checks over three independent methods
//! - `ledger` - durable session records, crash recovery, backups and audit
//! - `supervisor` - the per-port state machine, its main loop and watchdog
//! - `notify`, `environment`, `monitor` - collaborators the supervisor drives
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         ltmd daemon                          │
//! ├──────────────────────────────────────────────────────────────┤
//! │                                                              │
//! │  ┌──────────────┐  ┌──────────────┐    ┌──────────────────┐  │
//! │  │  main loop   │  │   watchdog   │    │   ledger tasks   │  │
//! │  │ (600s cycle) │  │  (60s pass)  │    │ (backup, audit)  │  │
//! │  └──────┬───────┘  └──────┬───────┘    └────────▲─────────┘  │
//! │         │  Mutex<SupervisorState>               │ watch      │
//! │         ▼                 ▼                     │            │
//! │  ┌─────────────────────────────────┐   ┌───────┴─────────┐  │
//! │  │ ProcessHandle  UrlExtractor     │   │  SessionLedger  │  │
//! │  │ ConnectivityProber  Notifier    │   │  (in the state) │  │
//! │  └─────────────────────────────────┘   └─────────────────┘  │
//! │                                                              │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! All production code in this crate follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations return `Result` or `Option`
//! - Collaborator failures are logged where they happen

pub mod config;
pub mod environment;
pub mod ledger;
pub mod monitor;
pub mod notify;
pub mod probe;
pub mod process;
pub mod supervisor;
pub mod url;

pub use config::{Config, ConfigError, StatePaths};
pub use ledger::{LedgerFiles, SessionLedger};
pub use probe::{ConnectivityProber, Prober};
pub use process::{ProcessHandle, TunnelProcess};
pub use supervisor::{Collaborators, CycleOutcome, TunnelSupervisor, WatchdogOutcome};
pub use url::{LogUrlExtractor, UrlSource};
