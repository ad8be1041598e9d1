//! Duration history entries.
//!
//! One line per closed session, append-only:
//!
//! ```text
//! Date : 2026-03-14 | URL : https://abc.loca.lt | Heure de début : 10:00:00 | Heure de fin : 11:02:05 | Durée : 1h 2m 5s
//! ```
//!
//! Sessions reconstructed after a crash carry the [`RECOVERED_MARKER`]
//! prefix. Older files may hold fractional seconds in the time columns;
//! the parser accepts them.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::session::{SessionDuration, TunnelSession};

/// Prefix written before entries for recovered sessions.
pub const RECOVERED_MARKER: &str = "[RECOVERED]";

const FIELD_SEPARATOR: &str = " | ";
const KEY_SEPARATOR: &str = " : ";

const LABEL_DATE: &str = "Date";
const LABEL_URL: &str = "URL";
const LABEL_START: &str = "Heure de début";
const LABEL_END: &str = "Heure de fin";
const LABEL_DURATION: &str = "Durée";

const DATE_FORMAT: &str = "%Y-%m-%d";
const TIME_FORMAT: &str = "%H:%M:%S";
const TIME_PARSE_FORMAT: &str = "%H:%M:%S%.f";

/// Errors from parsing a history line.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HistoryParseError {
    #[error("missing field '{0}'")]
    MissingField(&'static str),

    #[error("invalid date '{0}'")]
    InvalidDate(String),

    #[error("invalid time '{0}'")]
    InvalidTime(String),

    #[error("invalid duration '{0}'")]
    InvalidDuration(String),
}

/// One closed session as persisted in the history file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub date: NaiveDate,
    pub url: String,
    pub start: NaiveTime,
    pub end: NaiveTime,
    pub duration: SessionDuration,
    pub recovered: bool,
}

impl HistoryEntry {
    /// Builds the entry for a closed session. Returns `None` if still open.
    pub fn from_session(session: &TunnelSession) -> Option<Self> {
        let end = session.end?;
        Some(Self {
            date: session.start.date_naive(),
            url: session.url.clone(),
            start: session.start.time(),
            end: end.time(),
            duration: session.duration(),
            recovered: session.recovered,
        })
    }

    /// Local date and time the session started.
    pub fn started_at(&self) -> NaiveDateTime {
        self.date.and_time(self.start)
    }

    /// Local date and time the session ended, derived from the duration so
    /// sessions that cross midnight land on the right day.
    pub fn ended_at(&self) -> NaiveDateTime {
        let secs = i64::try_from(self.duration.as_secs()).unwrap_or(i64::MAX);
        self.started_at()
            .checked_add_signed(chrono::Duration::seconds(secs))
            .unwrap_or_else(|| self.started_at())
    }
}

impl fmt::Display for HistoryEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.recovered {
            write!(f, "{RECOVERED_MARKER} ")?;
        }
        write!(
            f,
            "{LABEL_DATE}{KEY_SEPARATOR}{}{FIELD_SEPARATOR}\
             {LABEL_URL}{KEY_SEPARATOR}{}{FIELD_SEPARATOR}\
             {LABEL_START}{KEY_SEPARATOR}{}{FIELD_SEPARATOR}\
             {LABEL_END}{KEY_SEPARATOR}{}{FIELD_SEPARATOR}\
             {LABEL_DURATION}{KEY_SEPARATOR}{}",
            self.date.format(DATE_FORMAT),
            self.url,
            self.start.format(TIME_FORMAT),
            self.end.format(TIME_FORMAT),
            self.duration,
        )
    }
}

impl FromStr for HistoryEntry {
    type Err = HistoryParseError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim();
        let (recovered, body) = match line.strip_prefix(RECOVERED_MARKER) {
            Some(rest) => (true, rest.trim_start()),
            None => (false, line),
        };

        let mut date = None;
        let mut url = None;
        let mut start = None;
        let mut end = None;
        let mut duration = None;

        for field in body.split(FIELD_SEPARATOR) {
            let Some((key, value)) = field.split_once(KEY_SEPARATOR) else {
                continue;
            };
            let value = value.trim();
            match key.trim() {
                LABEL_DATE => date = Some(value),
                LABEL_URL => url = Some(value),
                LABEL_START => start = Some(value),
                LABEL_END => end = Some(value),
                LABEL_DURATION => duration = Some(value),
                _ => {}
            }
        }

        let date = date.ok_or(HistoryParseError::MissingField(LABEL_DATE))?;
        let url = url.ok_or(HistoryParseError::MissingField(LABEL_URL))?;
        let start = start.ok_or(HistoryParseError::MissingField(LABEL_START))?;
        let end = end.ok_or(HistoryParseError::MissingField(LABEL_END))?;
        let duration = duration.ok_or(HistoryParseError::MissingField(LABEL_DURATION))?;

        Ok(Self {
            date: NaiveDate::parse_from_str(date, DATE_FORMAT)
                .map_err(|_| HistoryParseError::InvalidDate(date.to_string()))?,
            url: url.to_string(),
            start: parse_time(start)?,
            end: parse_time(end)?,
            duration: SessionDuration::parse(duration)
                .ok_or_else(|| HistoryParseError::InvalidDuration(duration.to_string()))?,
            recovered,
        })
    }
}

fn parse_time(value: &str) -> Result<NaiveTime, HistoryParseError> {
    NaiveTime::parse_from_str(value, TIME_PARSE_FORMAT)
        .map_err(|_| HistoryParseError::InvalidTime(value.to_string()))
}

/// Extracts the URL column from a history line without a full parse.
///
/// Used by crash recovery, which only needs the last recorded URL and
/// should not reject a line because another column is damaged.
pub fn url_of_line(line: &str) -> Option<&str> {
    line.split(FIELD_SEPARATOR).find_map(|field| {
        let (key, value) = field.split_once(KEY_SEPARATOR)?;
        let key = key.trim().trim_start_matches(RECOVERED_MARKER).trim();
        (key == LABEL_URL).then(|| value.trim()).filter(|v| !v.is_empty())
    })
}

/// Total hours per day for entries on or after `since`.
pub fn daily_hours<'a>(
    entries: impl IntoIterator<Item = &'a HistoryEntry>,
    since: NaiveDate,
) -> BTreeMap<NaiveDate, f64> {
    let mut totals = BTreeMap::new();
    for entry in entries.into_iter().filter(|e| e.date >= since) {
        *totals.entry(entry.date).or_insert(0.0) += entry.duration.as_hours();
    }
    totals
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Local, TimeZone};

    const SAMPLE: &str = "Date : 2026-03-14 | URL : https://abc.loca.lt | Heure de début : 10:00:00 | Heure de fin : 11:02:05 | Durée : 1h 2m 5s";

    #[test]
    fn test_parse_sample_line() {
        let entry: HistoryEntry = SAMPLE.parse().unwrap();
        assert_eq!(entry.date, NaiveDate::from_ymd_opt(2026, 3, 14).unwrap());
        assert_eq!(entry.url, "https://abc.loca.lt");
        assert_eq!(entry.start, NaiveTime::from_hms_opt(10, 0, 0).unwrap());
        assert_eq!(entry.end, NaiveTime::from_hms_opt(11, 2, 5).unwrap());
        assert_eq!(entry.duration.as_secs(), 3725);
        assert!(!entry.recovered);
    }

    #[test]
    fn test_display_matches_file_format() {
        let entry: HistoryEntry = SAMPLE.parse().unwrap();
        assert_eq!(entry.to_string(), SAMPLE);
    }

    #[test]
    fn test_recovered_prefix() {
        let line = format!("{RECOVERED_MARKER} {SAMPLE}");
        let entry: HistoryEntry = line.parse().unwrap();
        assert!(entry.recovered);
        assert_eq!(entry.to_string(), line);
    }

    #[test]
    fn test_parse_fractional_seconds() {
        let line = "Date : 2024-11-02 | URL : https://old.loca.lt | Heure de début : 08:15:01.123456 | Heure de fin : 09:00:00.5 | Durée : 0h 44m 58s";
        let entry: HistoryEntry = line.parse().unwrap();
        assert_eq!(entry.start.format("%H:%M:%S").to_string(), "08:15:01");
    }

    #[test]
    fn test_parse_missing_field() {
        let line = "Date : 2026-03-14 | URL : https://abc.loca.lt";
        assert_eq!(
            line.parse::<HistoryEntry>(),
            Err(HistoryParseError::MissingField(LABEL_START))
        );
    }

    #[test]
    fn test_parse_bad_duration() {
        let line = SAMPLE.replace("1h 2m 5s", "soon");
        assert!(matches!(
            line.parse::<HistoryEntry>(),
            Err(HistoryParseError::InvalidDuration(_))
        ));
    }

    #[test]
    fn test_parse_overflowing_duration() {
        let line = SAMPLE.replace("1h 2m 5s", "99999999999999999h 0m 0s");
        assert!(matches!(
            line.parse::<HistoryEntry>(),
            Err(HistoryParseError::InvalidDuration(_))
        ));
    }

    #[test]
    fn test_from_session() {
        let start = Local.with_ymd_and_hms(2026, 3, 14, 23, 30, 0).single().unwrap();
        let end = Local.with_ymd_and_hms(2026, 3, 15, 0, 30, 0).single().unwrap();
        let session = TunnelSession::open("https://abc.loca.lt", start).close(end);

        let entry = HistoryEntry::from_session(&session).unwrap();
        assert_eq!(entry.date, NaiveDate::from_ymd_opt(2026, 3, 14).unwrap());
        assert_eq!(entry.duration.as_secs(), 3600);
        assert_eq!(
            entry.ended_at(),
            NaiveDate::from_ymd_opt(2026, 3, 15)
                .unwrap()
                .and_hms_opt(0, 30, 0)
                .unwrap()
        );
    }

    #[test]
    fn test_from_open_session_is_none() {
        let start = Local.with_ymd_and_hms(2026, 3, 14, 10, 0, 0).single().unwrap();
        assert!(HistoryEntry::from_session(&TunnelSession::open("https://a.loca.lt", start)).is_none());
    }

    #[test]
    fn test_url_of_line() {
        assert_eq!(url_of_line(SAMPLE), Some("https://abc.loca.lt"));
        let recovered = format!("{RECOVERED_MARKER} {SAMPLE}");
        assert_eq!(url_of_line(&recovered), Some("https://abc.loca.lt"));
        assert_eq!(url_of_line("garbage"), None);
    }

    #[test]
    fn test_daily_hours() {
        let a: HistoryEntry = SAMPLE.parse().unwrap();
        let b: HistoryEntry = SAMPLE.replace("1h 2m 5s", "2h 0m 0s").parse().unwrap();
        let old: HistoryEntry = SAMPLE.replace("2026-03-14", "2026-01-01").parse().unwrap();

        let since = NaiveDate::from_ymd_opt(2026, 3, 1).unwrap();
        let totals = daily_hours([&a, &b, &old], since);

        assert_eq!(totals.len(), 1);
        let hours = totals.get(&a.date).copied().unwrap();
        assert!((hours - (3725.0 + 7200.0) / 3600.0).abs() < 1e-9);
    }
}
