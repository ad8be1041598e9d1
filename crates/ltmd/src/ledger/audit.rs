//! Consistency audit of the history file against the system log.
//!
//! Purely diagnostic: an entry is "uncorroborated" when the system log has
//! no line in the minute the session started nor in the minute it ended.
//! Nothing here mutates the ledger.

use std::collections::HashSet;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Datelike, NaiveDateTime, Timelike};
use ltm_core::{HistoryEntry, TunnelResult};
use tracing::{debug, info, warn};

use super::files::HistoryLog;
use crate::config::LedgerConfig;

/// (month, day, hour, minute) of a log line. Syslog lines carry no year.
pub type MinuteKey = (u32, u32, u32, u32);

/// Stand-in year for syslog stamps. A leap year, so `Feb 29` parses.
const SYSLOG_YEAR: i32 = 2000;

/// Result of one audit pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditReport {
    pub system_log: PathBuf,
    pub checked: usize,
    pub uncorroborated: Vec<HistoryEntry>,
}

/// First candidate that exists.
pub fn find_system_log(candidates: &[PathBuf]) -> Option<&Path> {
    candidates.iter().map(PathBuf::as_path).find(|p| p.is_file())
}

fn minute_of(at: NaiveDateTime) -> MinuteKey {
    (at.month(), at.day(), at.hour(), at.minute())
}

/// Timestamp minute of a syslog (`Mar 14 10:00:01 host ...`) or
/// ISO-8601 (`2026-03-14T10:00:01.123+01:00 host ...`) line.
pub fn line_minute(line: &str) -> Option<MinuteKey> {
    let mut tokens = line.split_whitespace();
    let first = tokens.next()?;

    if let Ok(at) = DateTime::parse_from_rfc3339(first) {
        return Some(minute_of(at.naive_local()));
    }

    let stamp = format!("{SYSLOG_YEAR} {first} {} {}", tokens.next()?, tokens.next()?);
    NaiveDateTime::parse_from_str(&stamp, "%Y %b %d %H:%M:%S")
        .ok()
        .map(minute_of)
}

/// Minutes in which the system log has at least one line.
pub fn logged_minutes(mut reader: impl BufRead) -> io::Result<HashSet<MinuteKey>> {
    let mut minutes = HashSet::new();
    let mut buf = Vec::new();
    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf)? == 0 {
            break;
        }
        if let Some(key) = line_minute(&String::from_utf8_lossy(&buf)) {
            minutes.insert(key);
        }
    }
    Ok(minutes)
}

/// Entries with no log activity at either end of the session.
pub fn uncorroborated<'a>(entries: &'a [HistoryEntry], minutes: &HashSet<MinuteKey>) -> Vec<&'a HistoryEntry> {
    entries
        .iter()
        .filter(|e| {
            !minutes.contains(&minute_of(e.started_at())) && !minutes.contains(&minute_of(e.ended_at()))
        })
        .collect()
}

/// Runs one audit. `Ok(None)` when there is no readable system log.
pub fn run_audit(history: &HistoryLog, config: &LedgerConfig) -> TunnelResult<Option<AuditReport>> {
    let Some(system_log) = find_system_log(&config.system_logs) else {
        debug!("No system log found, skipping audit");
        return Ok(None);
    };
    let file = match File::open(system_log) {
        Ok(file) => file,
        Err(e) => {
            debug!(path = %system_log.display(), error = %e, "System log not readable, skipping audit");
            return Ok(None);
        }
    };
    let minutes = match logged_minutes(BufReader::new(file)) {
        Ok(minutes) => minutes,
        Err(e) => {
            debug!(path = %system_log.display(), error = %e, "Failed to read system log, skipping audit");
            return Ok(None);
        }
    };

    let entries = history.recent(config.audit_sample)?;
    let missing: Vec<HistoryEntry> = uncorroborated(&entries, &minutes).into_iter().cloned().collect();

    if missing.is_empty() {
        info!(checked = entries.len(), system_log = %system_log.display(), "History audit passed");
    } else {
        let examples = missing
            .iter()
            .take(config.audit_examples)
            .map(|e| format!("{} {} ({})", e.date, e.start.format("%H:%M:%S"), e.url))
            .collect::<Vec<_>>()
            .join("; ");
        warn!(
            checked = entries.len(),
            uncorroborated = missing.len(),
            examples = %examples,
            system_log = %system_log.display(),
            "History entries without matching system log activity"
        );
    }

    Ok(Some(AuditReport {
        system_log: system_log.to_path_buf(),
        checked: entries.len(),
        uncorroborated: missing,
    }))
}
