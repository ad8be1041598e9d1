//! Typed accessors for the ledger's on-disk files.
//!
//! - [`StartMarker`]: one timestamp; existence means a session is open
//! - [`BackupLog`]: append-only snapshots of the open session
//! - [`HistoryLog`]: append-only closed sessions
//!
//! Timestamps are written as RFC 3339 with whole seconds. Markers written
//! as naive ISO-8601 (no offset) are read as local time.

use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Local, NaiveDateTime, SecondsFormat, TimeZone};
use ltm_core::{history, HistoryEntry, OpenSession, SessionDuration, TunnelError, TunnelResult, UNKNOWN_URL};
use tracing::{debug, warn};

const NAIVE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";

/// Formats a timestamp the way every ledger file stores it.
pub fn format_timestamp(at: DateTime<Local>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, false)
}

/// Parses an RFC 3339 timestamp, or a naive ISO-8601 one as local time.
pub fn parse_timestamp(value: &str) -> Option<DateTime<Local>> {
    let value = value.trim();
    if let Ok(at) = DateTime::parse_from_rfc3339(value) {
        return Some(at.with_timezone(&Local));
    }
    let naive = NaiveDateTime::parse_from_str(value, NAIVE_FORMAT).ok()?;
    Local.from_local_datetime(&naive).earliest()
}

/// Appends one line, creating the file and its directory if needed.
fn append_line(path: &Path, line: &str, context: &'static str) -> TunnelResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| TunnelError::io(context, parent, e))?;
    }
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| TunnelError::io(context, path, e))?;
    writeln!(file, "{line}").map_err(|e| TunnelError::io(context, path, e))
}

/// Reads every line; a missing file has none.
fn read_lines(path: &Path, context: &'static str) -> TunnelResult<Vec<String>> {
    let file = match fs::File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(TunnelError::io(context, path, e)),
    };
    let mut reader = BufReader::new(file);
    let mut lines = Vec::new();
    let mut buf = Vec::new();
    loop {
        buf.clear();
        let n = reader
            .read_until(b'\n', &mut buf)
            .map_err(|e| TunnelError::io(context, path, e))?;
        if n == 0 {
            break;
        }
        let line = String::from_utf8_lossy(&buf);
        let line = line.trim_end_matches(['\r', '\n']);
        if !line.trim().is_empty() {
            lines.push(line.to_string());
        }
    }
    Ok(lines)
}

// ============================================================================
// Start Marker
// ============================================================================

/// Crash-detection marker holding the open session's start time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartMarker {
    path: PathBuf,
}

impl StartMarker {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Raw marker contents, `None` if there is no marker.
    pub fn read_raw(&self) -> TunnelResult<Option<String>> {
        match fs::read_to_string(&self.path) {
            Ok(contents) => Ok(Some(contents.trim().to_string())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(TunnelError::io("read start marker", &self.path, e)),
        }
    }

    pub fn write(&self, started: DateTime<Local>) -> TunnelResult<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| TunnelError::io("create state dir", parent, e))?;
        }
        fs::write(&self.path, format_timestamp(started))
            .map_err(|e| TunnelError::io("write start marker", &self.path, e))
    }

    /// Deletes the marker. Missing is fine.
    pub fn remove(&self) -> TunnelResult<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                debug!(path = %self.path.display(), "Removed start marker");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(TunnelError::io("remove start marker", &self.path, e)),
        }
    }
}

// ============================================================================
// Backup Log
// ============================================================================

/// One periodic snapshot of the open session.
///
/// `Snapshot : <ts> | Start : <ts> | URL : <url> | Running : 0h 5m 0s`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupSnapshot {
    pub taken: DateTime<Local>,
    pub start: DateTime<Local>,
    pub url: String,
    pub running: SessionDuration,
}

impl BackupSnapshot {
    pub fn of(open: &OpenSession, now: DateTime<Local>) -> Self {
        Self {
            taken: now,
            start: open.started,
            url: open.url.clone(),
            running: open.running_for(now),
        }
    }

    /// Whether this snapshot belongs to the session that started at `start`.
    pub fn belongs_to(&self, start: DateTime<Local>) -> bool {
        self.start.timestamp() == start.timestamp()
    }
}

impl fmt::Display for BackupSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Snapshot : {} | Start : {} | URL : {} | Running : {}",
            format_timestamp(self.taken),
            format_timestamp(self.start),
            self.url,
            self.running
        )
    }
}

impl FromStr for BackupSnapshot {
    type Err = String;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut taken = None;
        let mut start = None;
        let mut url = None;
        let mut running = None;
        for field in line.trim().split(" | ") {
            let Some((key, value)) = field.split_once(" : ") else {
                continue;
            };
            match key.trim() {
                "Snapshot" => taken = parse_timestamp(value),
                "Start" => start = parse_timestamp(value),
                "URL" => url = Some(value.trim().to_string()).filter(|u| !u.is_empty()),
                "Running" => running = SessionDuration::parse(value),
                _ => {}
            }
        }
        match (taken, start, url, running) {
            (Some(taken), Some(start), Some(url), Some(running)) => Ok(Self {
                taken,
                start,
                url,
                running,
            }),
            _ => Err(format!("malformed backup line: {line}")),
        }
    }
}

/// Append-only snapshot file consulted by crash recovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupLog {
    path: PathBuf,
}

impl BackupLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, snapshot: &BackupSnapshot) -> TunnelResult<()> {
        append_line(&self.path, &snapshot.to_string(), "append backup snapshot")
    }

    /// Most recent snapshot of the session that started at `start`.
    pub fn latest_for(&self, start: DateTime<Local>) -> TunnelResult<Option<BackupSnapshot>> {
        let lines = read_lines(&self.path, "read backup log")?;
        Ok(lines
            .iter()
            .rev()
            .filter_map(|line| line.parse::<BackupSnapshot>().ok())
            .find(|snapshot| snapshot.belongs_to(start)))
    }
}

// ============================================================================
// History Log
// ============================================================================

/// Append-only record of closed sessions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryLog {
    path: PathBuf,
}

impl HistoryLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, entry: &HistoryEntry) -> TunnelResult<()> {
        append_line(&self.path, &entry.to_string(), "append history entry")
    }

    /// Every parseable entry in file order. Damaged lines are skipped.
    pub fn entries(&self) -> TunnelResult<Vec<HistoryEntry>> {
        let lines = read_lines(&self.path, "read history")?;
        let mut entries = Vec::with_capacity(lines.len());
        for (n, line) in lines.iter().enumerate() {
            match line.parse::<HistoryEntry>() {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!(path = %self.path.display(), line = n + 1, error = %e, "Skipping unparseable history line"),
            }
        }
        Ok(entries)
    }

    /// The `count` most recent entries, oldest first.
    pub fn recent(&self, count: usize) -> TunnelResult<Vec<HistoryEntry>> {
        let mut entries = self.entries()?;
        let skip = entries.len().saturating_sub(count);
        entries.drain(..skip);
        Ok(entries)
    }

    /// Last known URL recorded in history, ignoring the recovery sentinel.
    pub fn last_url(&self) -> TunnelResult<Option<String>> {
        let lines = read_lines(&self.path, "read history")?;
        Ok(lines
            .iter()
            .rev()
            .filter_map(|line| history::url_of_line(line))
            .find(|url| *url != UNKNOWN_URL)
            .map(str::to_string))
    }
}
