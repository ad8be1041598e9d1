//! Tunnel supervisor - the per-port state machine.
//!
//! ```text
//!   NoTunnel ──▶ Starting ──▶ Active ──▶ Degraded ──▶ Starting ──▶ ...
//! ```
//!
//! Two long-lived tasks drive it: the main loop calls
//! [`TunnelSupervisor::manage_tunnel`] every check interval, and the
//! watchdog (see [`watchdog`]) checks process liveness on a shorter one.
//! Both take the same lock around every start/stop decision, so they
//! never start or stop a tunnel concurrently.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - A failed cycle is logged and recorded in the status document; the
//!   loop carries on with the next one

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use ltm_core::{RetryPolicy, SupervisorPhase, TunnelError, TunnelResult};
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{Config, StatePaths};
use crate::environment::EnvironmentCheck;
use crate::ledger::SessionLedger;
use crate::notify::{ChangeLog, Notifier};
use crate::probe::Prober;
use crate::process::TunnelProcess;
use crate::url::{subdomain_of, UrlSource};

pub mod state;
pub mod watchdog;

pub use state::{read_status, write_status, SupervisorState};
pub use watchdog::{spawn_watchdog, WatchdogOutcome};

/// The external pieces the supervisor drives, injected so tests can fake them.
#[derive(Clone)]
pub struct Collaborators {
    pub process: Arc<dyn TunnelProcess>,
    pub urls: Arc<dyn UrlSource>,
    pub prober: Arc<dyn Prober>,
    pub notifier: Arc<dyn Notifier>,
    pub environment: Arc<dyn EnvironmentCheck>,
}

/// What one `manage_tunnel` call did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Process alive and URL reachable; nothing to do.
    Healthy { url: String },
    /// The tunnel was (re)started.
    Restarted {
        url: String,
        previous: Option<String>,
        changed: bool,
    },
    /// The environment cannot run a tunnel; no start was attempted.
    PreconditionsUnmet,
}

/// Supervises the tunnel for one port.
///
/// Cheap to clone: clones share the state and collaborators.
#[derive(Clone)]
pub struct TunnelSupervisor {
    port: u16,
    subdomain: Option<String>,
    retry: RetryPolicy,
    check_interval: Duration,
    watchdog_interval: Duration,
    close_session_on_shutdown: bool,
    url_file: PathBuf,
    status_file: PathBuf,
    change_log: ChangeLog,
    collab: Collaborators,
    state: Arc<Mutex<SupervisorState>>,
}

impl TunnelSupervisor {
    pub fn new(config: &Config, paths: &StatePaths, collab: Collaborators, ledger: SessionLedger) -> Self {
        Self {
            port: config.tunnel.port,
            subdomain: config.tunnel.subdomain.clone(),
            retry: config.retry.clone(),
            check_interval: config.supervisor.check_interval(),
            watchdog_interval: config.supervisor.watchdog_interval(),
            close_session_on_shutdown: config.supervisor.close_session_on_shutdown,
            url_file: paths.url_file.clone(),
            status_file: paths.status_file.clone(),
            change_log: ChangeLog::new(&paths.change_log),
            collab,
            state: Arc::new(Mutex::new(SupervisorState::new(ledger))),
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn watchdog_interval(&self) -> Duration {
        self.watchdog_interval
    }

    /// Locks the shared state. Holding the guard blocks both tasks.
    pub async fn lock_state(&self) -> MutexGuard<'_, SupervisorState> {
        self.state.lock().await
    }

    // ========================================================================
    // Main Loop
    // ========================================================================

    /// Runs cycles until cancelled.
    ///
    /// The sleep between cycles is shortened by the time the cycle took.
    pub async fn run(&self, cancel_token: CancellationToken) {
        info!(
            port = self.port,
            check_interval_secs = self.check_interval.as_secs(),
            "Supervisor started"
        );

        loop {
            let started = Instant::now();
            match self.manage_tunnel().await {
                Ok(outcome) => debug!(?outcome, "Supervisor cycle completed"),
                Err(e) if e.is_expected() => error!(error = %e, "Supervisor cycle failed"),
                Err(e) => error!(error = %e, severity = "critical", "Supervisor cycle failed unexpectedly"),
            }

            let wait = self.check_interval.saturating_sub(started.elapsed());
            debug!(wait_secs = wait.as_secs(), "Sleeping until next cycle");
            tokio::select! {
                biased;

                _ = cancel_token.cancelled() => {
                    info!("Supervisor shutting down");
                    break;
                }

                _ = sleep(wait) => {}
            }
        }

        self.shutdown().await;
    }

    /// Closes the open session if configured to; otherwise leaves it for
    /// crash recovery on the next start.
    pub async fn shutdown(&self) {
        if !self.close_session_on_shutdown {
            return;
        }
        let mut state = self.state.lock().await;
        if state.ledger.is_open() {
            if let Err(e) = state.ledger.end_tunnel() {
                error!(error = %e, "Failed to close session on shutdown");
            }
        }
    }

    /// One supervision cycle.
    pub async fn manage_tunnel(&self) -> TunnelResult<CycleOutcome> {
        let mut state = self.state.lock().await;
        let now = Local::now();
        state.last_check = Some(now);
        state.next_check = chrono::Duration::from_std(self.check_interval)
            .ok()
            .and_then(|d| now.checked_add_signed(d));

        let result = self.manage_locked(&mut state).await;
        state.last_error = result.as_ref().err().map(ToString::to_string);
        self.publish_status(&state);
        result
    }

    async fn manage_locked(&self, state: &mut SupervisorState) -> TunnelResult<CycleOutcome> {
        let port = self.port;

        if self.collab.process.is_active(port) {
            match self.collab.urls.read_current_url() {
                Some(url) => {
                    let report = self.collab.prober.probe(&url).await;
                    state.last_probe = report.votes;
                    if report.reachable {
                        if let Err(e) = self.keep_healthy(state, &url).await {
                            self.abandon_session(state, "Healthy tunnel bookkeeping failed", &e);
                            return Err(e);
                        }
                        info!(metric = "availability", available = true, port, url = %url, "Tunnel healthy");
                        return Ok(CycleOutcome::Healthy { url });
                    }
                }
                None => warn!(port, "Tunnel process running but no URL announced"),
            }
            state.phase = SupervisorPhase::Degraded;
            warn!(metric = "availability", available = false, port, "Tunnel degraded, restarting");
        } else {
            info!(port, "No tunnel process running");
        }

        if !self.collab.environment.preconditions_met() {
            state.phase = SupervisorPhase::NoTunnel;
            return Ok(CycleOutcome::PreconditionsUnmet);
        }

        self.restart_locked(state).await
    }

    /// Bookkeeping for a tunnel found healthy.
    ///
    /// Adopts a tunnel the ledger does not know about, and rolls the
    /// session over if the relay handed out a new URL under the same process.
    async fn keep_healthy(&self, state: &mut SupervisorState, url: &str) -> TunnelResult<()> {
        match state.ledger.current_url().map(str::to_string) {
            None => {
                info!(url, "Adopting running tunnel");
                state.ledger.start_tunnel(url)?;
            }
            Some(known) if known != url => {
                state.ledger.end_tunnel()?;
                state.ledger.start_tunnel(url)?;
                state.active_urls.remove(&known);
                self.announce_change(Some(&known), url).await;
                self.write_url_file(url)?;
            }
            Some(_) => {}
        }
        state.active_urls.insert(url.to_string());
        state.phase = SupervisorPhase::Active;
        Ok(())
    }

    // ========================================================================
    // Restart Path
    // ========================================================================

    /// Stops whatever is left, closes the session and starts afresh.
    ///
    /// On failure the session is closed so nothing is left dangling.
    pub(crate) async fn restart_locked(&self, state: &mut SupervisorState) -> TunnelResult<CycleOutcome> {
        state.phase = SupervisorPhase::Starting;
        self.publish_status(state);

        let result = self.restart_steps(state).await;
        if let Err(e) = &result {
            self.abandon_session(state, "Tunnel restart failed", e);
        }
        result
    }

    /// Cleanup after a failed cycle: no session is left open and the
    /// tunnel is no longer considered known.
    fn abandon_session(&self, state: &mut SupervisorState, what: &str, err: &TunnelError) {
        error!(port = self.port, error = %err, "{what}");
        if state.ledger.is_open() {
            if let Err(end_err) = state.ledger.end_tunnel() {
                error!(error = %end_err, "Failed to close session after cycle failure");
            }
        }
        state.active_urls.clear();
        state.phase = SupervisorPhase::NoTunnel;
    }

    async fn restart_steps(&self, state: &mut SupervisorState) -> TunnelResult<CycleOutcome> {
        let port = self.port;

        self.collab.process.stop(port);
        state.active_urls.clear();
        if state.ledger.is_open() {
            state.ledger.end_tunnel()?;
        }

        let previous = self.collab.urls.read_current_url();
        let subdomain = self
            .subdomain
            .clone()
            .or_else(|| previous.as_deref().and_then(subdomain_of));
        if let Some(ref subdomain) = subdomain {
            debug!(subdomain = %subdomain, pinned = self.subdomain.is_some(), "Requesting subdomain");
        }

        let url = self.start_with_retries(subdomain.as_deref()).await?;

        state.ledger.start_tunnel(&url)?;
        state.active_urls.insert(url.clone());
        state.phase = SupervisorPhase::Active;

        let changed = previous.as_deref() != Some(url.as_str());
        if changed {
            self.announce_change(previous.as_deref(), &url).await;
        } else {
            info!(url = %url, "Tunnel restarted with the same URL");
        }
        self.write_url_file(&url)?;

        Ok(CycleOutcome::Restarted { url, previous, changed })
    }

    /// Starts the tunnel and waits for its URL, with backoff and cooldowns.
    ///
    /// If a tunnel is already running with a readable URL, returns that URL
    /// without spawning a second one.
    pub async fn start_tunnel_with_retries(&self, subdomain: Option<&str>) -> TunnelResult<String> {
        let _guard = self.state.lock().await;
        self.start_with_retries(subdomain).await
    }

    async fn start_with_retries(&self, subdomain: Option<&str>) -> TunnelResult<String> {
        let port = self.port;
        if self.collab.process.is_active(port) {
            if let Some(url) = self.collab.urls.read_current_url() {
                info!(port, url = %url, "Tunnel already running, not spawning another");
                return Ok(url);
            }
        }

        let policy = &self.retry;
        let attempts = policy.max_attempts.max(1);
        let cycles = policy.total_cycles();
        let started = Instant::now();

        for cycle in 0..cycles {
            if cycle > 0 {
                warn!(
                    cycle,
                    cooldown_secs = policy.cooldown().as_secs(),
                    "No tunnel URL yet, cooling down before retrying"
                );
                sleep(policy.cooldown()).await;
            }

            if !self.collab.process.is_active(port) {
                match self.collab.process.spawn(port, subdomain).await {
                    Ok(pid) => info!(port, pid, cycle, "Tunnel process spawned"),
                    Err(e) => {
                        warn!(port, cycle, error = %e, "Tunnel spawn failed");
                        continue;
                    }
                }
            }

            for attempt in 0..attempts {
                if let Some(url) = self.collab.urls.read_current_url() {
                    info!(
                        metric = "startup_time",
                        startup_ms = started.elapsed().as_millis() as u64,
                        url = %url,
                        attempt = attempt + 1,
                        cycle,
                        "Tunnel URL obtained"
                    );
                    return Ok(url);
                }
                if attempt + 1 < attempts {
                    let delay = policy.delay_for(attempt);
                    debug!(attempt = attempt + 1, delay_ms = delay.as_millis() as u64, "Waiting for tunnel URL");
                    sleep(delay).await;
                }
            }
        }

        Err(TunnelError::SpawnExhausted { attempts, cycles })
    }

    // ========================================================================
    // Side Effects
    // ========================================================================

    async fn announce_change(&self, previous: Option<&str>, url: &str) {
        info!(metric = "url_change", previous = previous.unwrap_or("none"), url, "Tunnel URL changed");
        self.collab.notifier.notify(previous, url).await;
        if let Err(e) = self.change_log.record(Local::now(), previous, url) {
            error!(error = %e, "Failed to record URL change");
        }
    }

    fn write_url_file(&self, url: &str) -> TunnelResult<()> {
        if let Some(parent) = self.url_file.parent() {
            fs::create_dir_all(parent).map_err(|e| TunnelError::io("create state dir", parent, e))?;
        }
        fs::write(&self.url_file, format!("{url}\n")).map_err(|e| TunnelError::io("write URL file", &self.url_file, e))
    }

    pub(crate) fn publish_status(&self, state: &SupervisorState) {
        let snapshot = state.snapshot(self.port, self.collab.process.pid(self.port));
        if let Err(e) = write_status(&self.status_file, &snapshot) {
            warn!(error = %e, "Failed to write status");
        }
    }

    pub(crate) fn collab(&self) -> &Collaborators {
        &self.collab
    }
}
