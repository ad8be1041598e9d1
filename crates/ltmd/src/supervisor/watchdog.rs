//! Process watchdog.
//!
//! Checks only process liveness, which is far cheaper than a connectivity
//! probe, so it can run often. When the tunnel it expects is gone it
//! takes the same restart path as a degraded main cycle, bounding downtime
//! after an external kill to one watchdog interval.

use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use ltm_core::{SupervisorPhase, TunnelResult};

use super::{CycleOutcome, TunnelSupervisor};

/// What one watchdog pass did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchdogOutcome {
    /// The tunnel process is running.
    Alive { pid: Option<u32> },
    /// No tunnel is expected, so there is nothing to watch.
    Idle,
    /// The process was gone and a new one was started.
    Restarted { url: String, changed: bool },
    /// The process was gone but the environment cannot run a new one.
    PreconditionsUnmet,
}

impl TunnelSupervisor {
    /// One liveness check, restarting the tunnel if it died.
    pub async fn watchdog_pass(&self) -> TunnelResult<WatchdogOutcome> {
        let mut state = self.state.lock().await;
        let port = self.port;
        let collab = self.collab();

        if collab.process.is_active(port) {
            let pid = collab.process.pid(port);
            let metrics = match pid {
                Some(pid) => state.monitor.sample(pid),
                None => None,
            };
            state.metrics = metrics;
            self.publish_status(&state);
            debug!(port, pid = ?pid, "Watchdog: tunnel alive");
            return Ok(WatchdogOutcome::Alive { pid });
        }

        state.metrics = None;
        if !state.expects_tunnel() {
            debug!(port, "Watchdog: no tunnel expected");
            return Ok(WatchdogOutcome::Idle);
        }

        warn!(
            metric = "downtime",
            port,
            urls = ?state.active_urls,
            "Watchdog: tunnel process died, restarting"
        );
        state.phase = SupervisorPhase::Degraded;

        if !collab.environment.preconditions_met() {
            state.phase = SupervisorPhase::NoTunnel;
            self.publish_status(&state);
            return Ok(WatchdogOutcome::PreconditionsUnmet);
        }

        let result = self.restart_locked(&mut state).await;
        state.last_error = result.as_ref().err().map(ToString::to_string);
        self.publish_status(&state);

        match result? {
            CycleOutcome::Restarted { url, changed, .. } => Ok(WatchdogOutcome::Restarted { url, changed }),
            CycleOutcome::Healthy { url } => Ok(WatchdogOutcome::Restarted { url, changed: false }),
            CycleOutcome::PreconditionsUnmet => Ok(WatchdogOutcome::PreconditionsUnmet),
        }
    }
}

/// Spawns the watchdog task.
///
/// The first pass runs one interval after start, leaving the first check
/// to the main loop.
pub fn spawn_watchdog(supervisor: TunnelSupervisor, cancel_token: CancellationToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let period = supervisor.watchdog_interval();
        let mut tick = interval_at(Instant::now() + period, period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            port = supervisor.port(),
            interval_secs = period.as_secs(),
            "Watchdog started"
        );

        loop {
            tokio::select! {
                biased;

                _ = cancel_token.cancelled() => {
                    info!("Watchdog shutting down");
                    break;
                }

                _ = tick.tick() => {
                    match supervisor.watchdog_pass().await {
                        Ok(WatchdogOutcome::Restarted { url, changed }) => {
                            info!(url = %url, changed, "Watchdog restarted tunnel");
                        }
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "Watchdog restart failed"),
                    }
                }
            }
        }

        debug!("Watchdog task completed");
    })
}
