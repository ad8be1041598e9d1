//! Integration tests for session recording and crash recovery.
//!
//! Each test drives a ledger over real files, drops it without closing the
//! session to simulate a crash, then builds a fresh one on the same files.
//!
//! Tests CAN use `.unwrap()` and `.expect()`.

use std::fs;

use chrono::{DateTime, Local, TimeZone};
use tempfile::TempDir;

use ltm_core::{HistoryEntry, UNKNOWN_URL};
use ltmd::config::{LedgerConfig, StatePaths};
use ltmd::ledger::tasks::write_snapshot;
use ltmd::ledger::{LedgerFiles, SessionLedger};
use ltmd::url::LogUrlExtractor;

// ============================================================================
// Test Helpers
// ============================================================================

fn at(day: u32, h: u32, m: u32, s: u32) -> DateTime<Local> {
    Local.with_ymd_and_hms(2026, 3, day, h, m, s).single().unwrap()
}

fn open(paths: &StatePaths, now: DateTime<Local>) -> SessionLedger {
    let urls = LogUrlExtractor::new(&paths.output_log);
    SessionLedger::new_at(LedgerFiles::from_paths(paths), &LedgerConfig::default(), &urls, now).unwrap()
}

fn history(paths: &StatePaths) -> Vec<String> {
    fs::read_to_string(&paths.history_file)
        .unwrap_or_default()
        .lines()
        .map(str::to_string)
        .collect()
}

// ============================================================================
// Recording
// ============================================================================

#[test]
fn test_session_recorded_once_on_close() {
    let dir = TempDir::new().unwrap();
    let paths = StatePaths::in_dir(dir.path());
    let mut ledger = open(&paths, at(14, 9, 0, 0));

    ledger.start_tunnel_at("https://abc.loca.lt", at(14, 9, 0, 0)).unwrap();
    assert!(paths.start_marker.exists());

    let entry = ledger.end_tunnel_at(at(14, 10, 30, 15)).unwrap().unwrap();
    assert_eq!(entry.duration.as_secs(), 5415);
    assert!(!paths.start_marker.exists());

    // A second close has nothing to record.
    assert!(ledger.end_tunnel_at(at(14, 10, 31, 0)).unwrap().is_none());

    let lines = history(&paths);
    assert_eq!(lines.len(), 1);
    assert_eq!(
        lines[0],
        "Date : 2026-03-14 | URL : https://abc.loca.lt | Heure de début : 09:00:00 | \
         Heure de fin : 10:30:15 | Durée : 1h 30m 15s"
    );
}

#[test]
fn test_short_session_not_recorded() {
    let dir = TempDir::new().unwrap();
    let paths = StatePaths::in_dir(dir.path());
    let mut ledger = open(&paths, at(14, 9, 0, 0));

    ledger.start_tunnel_at("https://abc.loca.lt", at(14, 9, 0, 0)).unwrap();
    assert!(ledger.end_tunnel_at(at(14, 9, 0, 3)).unwrap().is_none());

    assert!(history(&paths).is_empty());
    assert!(!paths.start_marker.exists());
}

// ============================================================================
// Crash Recovery
// ============================================================================

#[test]
fn test_recovery_falls_back_to_history_url() {
    let dir = TempDir::new().unwrap();
    let paths = StatePaths::in_dir(dir.path());

    // Marker in the naive ISO form older runs wrote, no backup, no output log.
    fs::write(&paths.start_marker, "2026-03-14T09:00:00.123456").unwrap();
    fs::write(
        &paths.history_file,
        "Date : 2026-03-13 | URL : https://prior.loca.lt | Heure de début : 08:00:00 | \
         Heure de fin : 09:00:00 | Durée : 1h 0m 0s\n",
    )
    .unwrap();

    let ledger = open(&paths, at(14, 11, 0, 0));
    let recovered = ledger.recovered().unwrap();
    assert_eq!(recovered.url, "https://prior.loca.lt");
    assert!(recovered.recovered);
    assert!(!ledger.is_open());
    assert!(!paths.start_marker.exists());

    let lines = history(&paths);
    assert_eq!(lines.len(), 2);
    let entry: HistoryEntry = lines[1].parse().unwrap();
    assert!(lines[1].starts_with("[RECOVERED] "));
    assert!(entry.recovered);
    assert_eq!(entry.url, "https://prior.loca.lt");
    // Fractional start seconds are dropped or rounded, never more.
    assert!((2 * 3600 - 1..=2 * 3600).contains(&entry.duration.as_secs()));
}

#[test]
fn test_recovery_prefers_backup_snapshot() {
    let dir = TempDir::new().unwrap();
    let paths = StatePaths::in_dir(dir.path());

    {
        let mut ledger = open(&paths, at(14, 9, 0, 0));
        ledger.start_tunnel_at("https://abc.loca.lt", at(14, 9, 0, 0)).unwrap();
        let rx = ledger.subscribe();
        assert!(write_snapshot(ledger.backup_log(), &rx));
        // Dropped while open: the marker stays behind.
    }
    assert!(paths.start_marker.exists());

    // The output log has since moved on to another URL.
    fs::write(&paths.output_log, "your url is: https://later.loca.lt\n").unwrap();

    let ledger = open(&paths, Local::now());
    let recovered = ledger.recovered().unwrap();
    assert_eq!(recovered.url, "https://abc.loca.lt");
    // Ended at the snapshot, not at restart time.
    assert!(recovered.end.unwrap() < Local::now());
    assert_eq!(history(&paths).len(), 1);
}

#[test]
fn test_recovery_reads_output_log_without_backup() {
    let dir = TempDir::new().unwrap();
    let paths = StatePaths::in_dir(dir.path());

    {
        let mut ledger = open(&paths, at(14, 9, 0, 0));
        ledger.start_tunnel_at("https://abc.loca.lt", at(14, 9, 0, 0)).unwrap();
    }
    fs::write(&paths.output_log, "your url is: https://abc.loca.lt\n").unwrap();

    let ledger = open(&paths, at(14, 9, 45, 0));
    let recovered = ledger.recovered().unwrap();
    assert_eq!(recovered.url, "https://abc.loca.lt");
    assert_eq!(recovered.end, Some(at(14, 9, 45, 0)));
}

#[test]
fn test_recovery_with_nothing_to_go_on() {
    let dir = TempDir::new().unwrap();
    let paths = StatePaths::in_dir(dir.path());
    fs::write(&paths.start_marker, "2026-03-14T09:00:00").unwrap();

    let ledger = open(&paths, at(14, 12, 0, 0));
    assert_eq!(ledger.recovered().unwrap().url, UNKNOWN_URL);
    assert!(history(&paths)[0].contains(&format!("URL : {UNKNOWN_URL}")));
}

#[test]
fn test_clean_start_recovers_nothing() {
    let dir = TempDir::new().unwrap();
    let paths = StatePaths::in_dir(dir.path());

    let ledger = open(&paths, at(14, 9, 0, 0));
    assert!(ledger.recovered().is_none());
    assert!(history(&paths).is_empty());
}
