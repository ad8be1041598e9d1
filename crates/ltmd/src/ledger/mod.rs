//! Session ledger - durable record of tunnel sessions.
//!
//! The ledger is a two-state machine per supervised port:
//!
//! ```text
//!            start_tunnel(url)
//!   Idle ─────────────────────────▶ Open
//!    ▲                               │
//!    └───────── end_tunnel() ────────┘
//!      (history entry if >= min)
//! ```
//!
//! While a session is open a start marker sits on disk. If the daemon dies
//! without closing the session, the next ledger to be constructed finds the
//! marker, rebuilds the orphaned session and closes it as recovered.
//!
//! Only the supervisor mutates the ledger. Background tasks see the open
//! session through a `watch` channel and append to side files only.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Invariant violations are logged and repaired, never raised

use std::path::PathBuf;

use chrono::{DateTime, Local};
use ltm_core::{
    HistoryEntry, OpenSession, SessionDuration, TunnelError, TunnelResult, TunnelSession, UNKNOWN_URL,
};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::{LedgerConfig, StatePaths};
use crate::url::UrlSource;

pub mod audit;
pub mod files;
pub mod tasks;

pub use audit::{run_audit, AuditReport};
pub use files::{BackupLog, BackupSnapshot, HistoryLog, StartMarker};
pub use tasks::spawn_ledger_tasks;

/// Locations of the three files the ledger owns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerFiles {
    pub start_marker: PathBuf,
    pub backup: PathBuf,
    pub history: PathBuf,
}

impl LedgerFiles {
    pub fn from_paths(paths: &StatePaths) -> Self {
        Self {
            start_marker: paths.start_marker.clone(),
            backup: paths.backup_file.clone(),
            history: paths.history_file.clone(),
        }
    }
}

/// Where the URL of an orphaned session came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoverySource {
    Backup,
    OutputLog,
    History,
    Unknown,
}

impl RecoverySource {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Backup => "backup",
            Self::OutputLog => "output_log",
            Self::History => "history",
            Self::Unknown => "none",
        }
    }
}

/// Open/close bookkeeping for tunnel sessions.
pub struct SessionLedger {
    marker: StartMarker,
    backup: BackupLog,
    history: HistoryLog,
    min_session: SessionDuration,
    current: Option<TunnelSession>,
    recovered: Option<TunnelSession>,
    open_tx: watch::Sender<Option<OpenSession>>,
}

impl SessionLedger {
    /// Builds the ledger and repairs any session orphaned by a crash.
    pub fn new(files: LedgerFiles, config: &LedgerConfig, urls: &dyn UrlSource) -> TunnelResult<Self> {
        Self::new_at(files, config, urls, Local::now())
    }

    pub fn new_at(
        files: LedgerFiles,
        config: &LedgerConfig,
        urls: &dyn UrlSource,
        now: DateTime<Local>,
    ) -> TunnelResult<Self> {
        let (open_tx, _) = watch::channel(None);
        let mut ledger = Self {
            marker: StartMarker::new(files.start_marker),
            backup: BackupLog::new(files.backup),
            history: HistoryLog::new(files.history),
            min_session: SessionDuration::from_secs(config.min_session_secs),
            current: None,
            recovered: None,
            open_tx,
        };
        ledger.recovered = ledger.recover_orphan(urls, now)?;
        Ok(ledger)
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.current.is_some()
    }

    pub fn current(&self) -> Option<&TunnelSession> {
        self.current.as_ref()
    }

    pub fn current_url(&self) -> Option<&str> {
        self.current.as_ref().map(|s| s.url.as_str())
    }

    /// The orphaned session closed during construction, if there was one.
    pub fn recovered(&self) -> Option<&TunnelSession> {
        self.recovered.as_ref()
    }

    /// Watch channel carrying the open session for background readers.
    pub fn subscribe(&self) -> watch::Receiver<Option<OpenSession>> {
        self.open_tx.subscribe()
    }

    pub fn backup_log(&self) -> &BackupLog {
        &self.backup
    }

    pub fn history_log(&self) -> &HistoryLog {
        &self.history
    }

    // ------------------------------------------------------------------------
    // Transitions
    // ------------------------------------------------------------------------

    /// Opens a session for `url`, closing any session left open first.
    pub fn start_tunnel(&mut self, url: &str) -> TunnelResult<()> {
        self.start_tunnel_at(url, Local::now())
    }

    pub fn start_tunnel_at(&mut self, url: &str, now: DateTime<Local>) -> TunnelResult<()> {
        if let Some(open) = &self.current {
            let violation = TunnelError::SessionInvariantViolation(format!(
                "session for {} still open while starting {url}",
                open.url
            ));
            warn!(error = %violation, "Closing stale session before opening a new one");
            self.end_tunnel_at(now)?;
        }

        self.marker.write(now)?;
        self.current = Some(TunnelSession::open(url, now));
        self.publish();
        info!(url, started = %now.format("%Y-%m-%d %H:%M:%S"), "Session opened");
        Ok(())
    }

    /// Closes the open session and records it if long enough.
    ///
    /// Returns the history entry written, if any. The start marker is
    /// removed even when writing history fails.
    pub fn end_tunnel(&mut self) -> TunnelResult<Option<HistoryEntry>> {
        self.end_tunnel_at(Local::now())
    }

    pub fn end_tunnel_at(&mut self, now: DateTime<Local>) -> TunnelResult<Option<HistoryEntry>> {
        let Some(session) = self.current.take() else {
            let violation = TunnelError::SessionInvariantViolation("end_tunnel with no open session".to_string());
            warn!(error = %violation, "Nothing to close");
            return Ok(None);
        };
        self.publish();

        let closed = session.close(now);
        let recorded = self.record(&closed);
        let cleared = self.marker.remove();
        let entry = recorded?;
        cleared?;

        info!(
            url = %closed.url,
            duration = %closed.duration(),
            recorded = entry.is_some(),
            "Session closed"
        );
        Ok(entry)
    }

    fn publish(&self) {
        let open = self
            .current
            .as_ref()
            .map(|s| OpenSession::new(s.url.clone(), s.start));
        self.open_tx.send_replace(open);
    }

    /// Appends a closed session to history unless it is too short.
    fn record(&self, closed: &TunnelSession) -> TunnelResult<Option<HistoryEntry>> {
        let duration = closed.duration();
        if duration < self.min_session {
            info!(
                url = %closed.url,
                duration_secs = duration.as_secs(),
                min_secs = self.min_session.as_secs(),
                "Session too short, not recorded"
            );
            return Ok(None);
        }
        let Some(entry) = HistoryEntry::from_session(closed) else {
            return Ok(None);
        };
        self.history.append(&entry)?;
        Ok(Some(entry))
    }

    // ------------------------------------------------------------------------
    // Crash Recovery
    // ------------------------------------------------------------------------

    fn recover_orphan(&mut self, urls: &dyn UrlSource, now: DateTime<Local>) -> TunnelResult<Option<TunnelSession>> {
        let Some(raw) = self.marker.read_raw()? else {
            return Ok(None);
        };
        let Some(started) = files::parse_timestamp(&raw) else {
            warn!(path = %self.marker.path().display(), contents = %raw, "Discarding unreadable start marker");
            self.marker.remove()?;
            return Ok(None);
        };

        let snapshot = self.backup.latest_for(started)?;
        let (url, source) = if let Some(snapshot) = &snapshot {
            (snapshot.url.clone(), RecoverySource::Backup)
        } else if let Some(url) = urls.read_current_url() {
            (url, RecoverySource::OutputLog)
        } else if let Some(url) = self.history.last_url()? {
            (url, RecoverySource::History)
        } else {
            let incomplete = TunnelError::RecoveryIncomplete {
                started: files::format_timestamp(started),
            };
            warn!(error = %incomplete, "Recording orphaned session with unknown URL");
            (UNKNOWN_URL.to_string(), RecoverySource::Unknown)
        };

        // Last proof of life is the newest snapshot; without one, assume
        // the session ran until now.
        let end = snapshot.as_ref().map(|s| s.taken).unwrap_or(now);
        let closed = TunnelSession::orphaned(url, started).close(end);
        warn!(
            url = %closed.url,
            source = source.label(),
            started = %files::format_timestamp(started),
            duration = %closed.duration(),
            "Recovered orphaned session"
        );

        self.record(&closed)?;
        self.marker.remove()?;
        Ok(Some(closed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use std::fs;
    use tempfile::TempDir;

    struct FixedUrl(Option<&'static str>);

    impl UrlSource for FixedUrl {
        fn read_current_url(&self) -> Option<String> {
            self.0.map(str::to_string)
        }
    }

    fn at(h: u32, m: u32, s: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(2026, 3, 14, h, m, s).single().unwrap()
    }

    fn files(dir: &TempDir) -> LedgerFiles {
        LedgerFiles::from_paths(&StatePaths::in_dir(dir.path()))
    }

    fn ledger(dir: &TempDir, urls: &dyn UrlSource) -> SessionLedger {
        SessionLedger::new_at(files(dir), &LedgerConfig::default(), urls, at(12, 0, 0)).unwrap()
    }

    fn history_lines(dir: &TempDir) -> Vec<String> {
        fs::read_to_string(files(dir).history)
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn test_open_then_close_records_history() {
        let dir = TempDir::new().unwrap();
        let mut ledger = ledger(&dir, &FixedUrl(None));
        let rx = ledger.subscribe();

        ledger.start_tunnel_at("https://abc.loca.lt", at(10, 0, 0)).unwrap();
        assert!(ledger.is_open());
        assert!(files(&dir).start_marker.exists());
        assert_eq!(rx.borrow().as_ref().map(|o| o.url.clone()).as_deref(), Some("https://abc.loca.lt"));

        let entry = ledger.end_tunnel_at(at(11, 2, 5)).unwrap().unwrap();
        assert_eq!(entry.duration.as_secs(), 3725);
        assert!(!ledger.is_open());
        assert!(!files(&dir).start_marker.exists());
        assert!(rx.borrow().is_none());
        assert_eq!(history_lines(&dir).len(), 1);
    }

    #[test]
    fn test_short_session_not_recorded() {
        let dir = TempDir::new().unwrap();
        let mut ledger = ledger(&dir, &FixedUrl(None));

        ledger.start_tunnel_at("https://x.loca.lt", at(10, 0, 0)).unwrap();
        let entry = ledger.end_tunnel_at(at(10, 0, 3)).unwrap();

        assert!(entry.is_none());
        assert!(history_lines(&dir).is_empty());
        assert!(!files(&dir).start_marker.exists());
    }

    #[test]
    fn test_end_when_idle_is_noop() {
        let dir = TempDir::new().unwrap();
        let mut ledger = ledger(&dir, &FixedUrl(None));
        assert_eq!(ledger.end_tunnel_at(at(10, 0, 0)).unwrap(), None);
        assert!(history_lines(&dir).is_empty());
    }

    #[test]
    fn test_double_start_closes_previous() {
        let dir = TempDir::new().unwrap();
        let mut ledger = ledger(&dir, &FixedUrl(None));

        ledger.start_tunnel_at("https://a.loca.lt", at(10, 0, 0)).unwrap();
        ledger.start_tunnel_at("https://b.loca.lt", at(10, 30, 0)).unwrap();

        assert_eq!(ledger.current_url(), Some("https://b.loca.lt"));
        let lines = history_lines(&dir);
        assert_eq!(lines.len(), 1);
        assert!(lines.first().unwrap().contains("https://a.loca.lt"));
    }

    #[test]
    fn test_recovery_prefers_backup() {
        let dir = TempDir::new().unwrap();
        let started = at(9, 0, 0);
        StartMarker::new(files(&dir).start_marker).write(started).unwrap();
        BackupLog::new(files(&dir).backup)
            .append(&BackupSnapshot::of(
                &OpenSession::new("https://backup.loca.lt", started),
                started + Duration::minutes(25),
            ))
            .unwrap();

        let ledger = ledger(&dir, &FixedUrl(Some("https://log.loca.lt")));
        let recovered = ledger.recovered().unwrap();

        assert_eq!(recovered.url, "https://backup.loca.lt");
        assert!(recovered.recovered);
        assert_eq!(recovered.duration().as_secs(), 25 * 60);
        assert!(!files(&dir).start_marker.exists());
        assert!(history_lines(&dir).first().unwrap().starts_with("[RECOVERED] "));
    }

    #[test]
    fn test_recovery_falls_back_to_output_log() {
        let dir = TempDir::new().unwrap();
        StartMarker::new(files(&dir).start_marker).write(at(11, 0, 0)).unwrap();

        let ledger = ledger(&dir, &FixedUrl(Some("https://log.loca.lt")));
        let recovered = ledger.recovered().unwrap();
        assert_eq!(recovered.url, "https://log.loca.lt");
        assert_eq!(recovered.end, Some(at(12, 0, 0)));
    }

    #[test]
    fn test_recovery_unknown_url() {
        let dir = TempDir::new().unwrap();
        StartMarker::new(files(&dir).start_marker).write(at(11, 0, 0)).unwrap();

        let ledger = ledger(&dir, &FixedUrl(None));
        assert_eq!(ledger.recovered().unwrap().url, UNKNOWN_URL);
        assert!(!ledger.is_open());
    }

    #[test]
    fn test_recovery_discards_unreadable_marker() {
        let dir = TempDir::new().unwrap();
        fs::write(files(&dir).start_marker, "not a time").unwrap();

        let ledger = ledger(&dir, &FixedUrl(Some("https://log.loca.lt")));
        assert!(ledger.recovered().is_none());
        assert!(!files(&dir).start_marker.exists());
        assert!(history_lines(&dir).is_empty());
    }

    #[test]
    fn test_no_marker_no_recovery() {
        let dir = TempDir::new().unwrap();
        let ledger = ledger(&dir, &FixedUrl(Some("https://log.loca.lt")));
        assert!(ledger.recovered().is_none());
    }
}
