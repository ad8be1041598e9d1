//! State shared by the supervisor loop and the watchdog.

use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::Path;

use chrono::{DateTime, Local};
use ltm_core::{ProbeVote, StatusSnapshot, SupervisorPhase, TunnelError, TunnelResult};

use crate::ledger::SessionLedger;
use crate::monitor::{ProcessMetrics, TunnelMonitor};

/// Everything the two supervisor tasks must agree on.
///
/// Lives behind one `tokio::sync::Mutex`; whoever holds it owns every
/// start and stop decision for the port.
pub struct SupervisorState {
    pub ledger: SessionLedger,
    /// URLs of tunnels this supervisor believes are running
    pub active_urls: HashSet<String>,
    pub phase: SupervisorPhase,
    pub last_probe: Vec<ProbeVote>,
    pub last_check: Option<DateTime<Local>>,
    pub next_check: Option<DateTime<Local>>,
    pub last_error: Option<String>,
    pub metrics: Option<ProcessMetrics>,
    pub(crate) monitor: TunnelMonitor,
}

impl SupervisorState {
    pub fn new(ledger: SessionLedger) -> Self {
        Self {
            ledger,
            active_urls: HashSet::new(),
            phase: SupervisorPhase::NoTunnel,
            last_probe: Vec::new(),
            last_check: None,
            next_check: None,
            last_error: None,
            metrics: None,
            monitor: TunnelMonitor::new(),
        }
    }

    /// Whether a tunnel is supposed to be running right now.
    pub fn expects_tunnel(&self) -> bool {
        !self.active_urls.is_empty() || self.phase == SupervisorPhase::Active
    }

    pub fn snapshot(&self, port: u16, tunnel_pid: Option<u32>) -> StatusSnapshot {
        let session = self.ledger.current();
        let metrics = self.metrics.as_ref().filter(|m| Some(m.pid) == tunnel_pid);
        StatusSnapshot {
            state: self.phase.tunnel_state(),
            phase: self.phase,
            port,
            url: session.map(|s| s.url.clone()),
            session_started: session.map(|s| s.start),
            last_check: self.last_check,
            next_check: self.next_check,
            probe: self.last_probe.clone(),
            tunnel_pid,
            tunnel_memory_mb: metrics.map(|m| m.memory_mb),
            tunnel_cpu_percent: metrics.map(|m| m.cpu_percent),
            last_error: self.last_error.clone(),
        }
    }
}

/// Writes the status document atomically (temp file, then rename).
pub fn write_status(path: &Path, snapshot: &StatusSnapshot) -> TunnelResult<()> {
    let json = serde_json::to_string_pretty(snapshot)
        .map_err(|e| TunnelError::io("encode status", path, io::Error::new(io::ErrorKind::InvalidData, e)))?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| TunnelError::io("create state dir", parent, e))?;
    }
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json).map_err(|e| TunnelError::io("write status", &tmp, e))?;
    fs::rename(&tmp, path).map_err(|e| TunnelError::io("publish status", path, e))
}

/// Reads the last published status, `None` if none was written yet.
pub fn read_status(path: &Path) -> TunnelResult<Option<StatusSnapshot>> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(TunnelError::io("read status", path, e)),
    };
    serde_json::from_str(&content)
        .map(Some)
        .map_err(|e| TunnelError::io("decode status", path, io::Error::new(io::ErrorKind::InvalidData, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LedgerConfig, StatePaths};
    use crate::ledger::LedgerFiles;
    use crate::url::UrlSource;
    use ltm_core::TunnelState;
    use tempfile::TempDir;

    struct NoUrl;

    impl UrlSource for NoUrl {
        fn read_current_url(&self) -> Option<String> {
            None
        }
    }

    fn state(dir: &TempDir) -> SupervisorState {
        let files = LedgerFiles::from_paths(&StatePaths::in_dir(dir.path()));
        SupervisorState::new(SessionLedger::new(files, &LedgerConfig::default(), &NoUrl).unwrap())
    }

    #[test]
    fn test_snapshot_reflects_session() {
        let dir = TempDir::new().unwrap();
        let mut state = state(&dir);
        assert!(!state.expects_tunnel());

        state.ledger.start_tunnel("https://abc.loca.lt").unwrap();
        state.phase = SupervisorPhase::Active;
        state.last_probe = vec![ProbeVote {
            method: "http".to_string(),
            ok: true,
        }];

        let snapshot = state.snapshot(3000, Some(42));
        assert_eq!(snapshot.state, TunnelState::Active);
        assert_eq!(snapshot.url.as_deref(), Some("https://abc.loca.lt"));
        assert_eq!(snapshot.tunnel_pid, Some(42));
        assert_eq!(snapshot.tunnel_memory_mb, None);
        assert!(state.expects_tunnel());
    }

    #[test]
    fn test_status_file_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = StatePaths::in_dir(dir.path()).status_file;
        assert_eq!(read_status(&path).unwrap(), None);

        let snapshot = StatusSnapshot {
            port: 3000,
            url: Some("https://abc.loca.lt".to_string()),
            last_error: Some("no tunnel URL after 10 polls across 6 cycles".to_string()),
            ..StatusSnapshot::default()
        };
        write_status(&path, &snapshot).unwrap();
        assert_eq!(read_status(&path).unwrap(), Some(snapshot));
        assert!(!path.with_extension("json.tmp").exists());
    }
}
