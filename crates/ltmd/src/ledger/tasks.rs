//! Background ledger upkeep: periodic backup snapshots and the audit.
//!
//! The task only reads the open session from the ledger's watch channel
//! and appends to side files, so it never contends with the supervisor.

use std::time::Duration;

use chrono::Local;
use ltm_core::OpenSession;
use tokio::sync::watch;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::audit::run_audit;
use super::files::{BackupLog, BackupSnapshot, HistoryLog};
use crate::config::LedgerConfig;

/// Appends a snapshot if a session is open. Returns whether one was written.
pub fn write_snapshot(backup: &BackupLog, open: &watch::Receiver<Option<OpenSession>>) -> bool {
    let Some(session) = open.borrow().clone() else {
        debug!("No open session, skipping backup snapshot");
        return false;
    };
    let snapshot = BackupSnapshot::of(&session, Local::now());
    match backup.append(&snapshot) {
        Ok(()) => {
            debug!(url = %snapshot.url, running = %snapshot.running, "Backup snapshot written");
            true
        }
        Err(e) => {
            error!(error = %e, "Failed to write backup snapshot");
            false
        }
    }
}

/// Spawns the backup and audit schedule.
///
/// Neither interval fires immediately: the first backup comes one backup
/// interval after start, the first audit one audit interval after start.
pub fn spawn_ledger_tasks(
    backup: BackupLog,
    history: HistoryLog,
    open: watch::Receiver<Option<OpenSession>>,
    config: LedgerConfig,
    cancel_token: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let backup_every = config.backup_interval();
        let audit_every = config.audit_interval();
        let mut backup_tick = delayed_interval(backup_every);
        let mut audit_tick = delayed_interval(audit_every);

        info!(
            backup_interval_secs = backup_every.as_secs(),
            audit_interval_secs = audit_every.as_secs(),
            "Ledger tasks started"
        );

        loop {
            tokio::select! {
                biased;

                _ = cancel_token.cancelled() => {
                    info!("Ledger tasks shutting down");
                    break;
                }

                _ = backup_tick.tick() => {
                    write_snapshot(&backup, &open);
                }

                _ = audit_tick.tick() => {
                    let history = history.clone();
                    let config = config.clone();
                    // The system log can be large; keep the read off the runtime.
                    match tokio::task::spawn_blocking(move || run_audit(&history, &config)).await {
                        Ok(Ok(_)) => {}
                        Ok(Err(e)) => warn!(error = %e, "History audit failed"),
                        Err(e) => warn!(error = %e, "History audit task panicked"),
                    }
                }
            }
        }

        debug!("Ledger task completed");
    })
}

fn delayed_interval(period: Duration) -> tokio::time::Interval {
    let mut tick = interval_at(Instant::now() + period, period);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tick
}
