//! Tunnel session entities and value objects.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fmt;

/// URL recorded for an orphaned session whose URL could not be recovered.
pub const UNKNOWN_URL: &str = "unknown";

// ============================================================================
// Session Duration
// ============================================================================

/// Whole-second length of a tunnel session.
///
/// Negative spans (clock stepped backwards between start and end) clamp
/// to zero so a closed session never reports `end < start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionDuration(u64);

impl SessionDuration {
    /// Creates a duration from whole seconds.
    pub fn from_secs(secs: u64) -> Self {
        Self(secs)
    }

    /// Measures the span between two instants.
    pub fn between(start: DateTime<Local>, end: DateTime<Local>) -> Self {
        let secs = end.signed_duration_since(start).num_seconds();
        Self(u64::try_from(secs).unwrap_or(0))
    }

    /// Returns the duration in whole seconds.
    pub fn as_secs(&self) -> u64 {
        self.0
    }

    /// Returns the duration as fractional hours.
    pub fn as_hours(&self) -> f64 {
        self.0 as f64 / 3600.0
    }

    /// Formats the duration the way the history file stores it.
    ///
    /// Always prints all three components: "0h 0m 42s", "26h 3m 0s".
    pub fn format(&self) -> String {
        let hours = self.0 / 3600;
        let minutes = (self.0 % 3600) / 60;
        let seconds = self.0 % 60;
        format!("{hours}h {minutes}m {seconds}s")
    }

    /// Parses the "Xh Ym Zs" form written by [`SessionDuration::format`].
    ///
    /// Whitespace between components is optional.
    pub fn parse(s: &str) -> Option<Self> {
        let rest = s.trim();
        let (hours, rest) = rest.split_once('h')?;
        let (minutes, rest) = rest.split_once('m')?;
        let (seconds, rest) = rest.split_once('s')?;
        if !rest.trim().is_empty() {
            return None;
        }
        let hours: u64 = hours.trim().parse().ok()?;
        let minutes: u64 = minutes.trim().parse().ok()?;
        let seconds: u64 = seconds.trim().parse().ok()?;
        let total = hours
            .checked_mul(3600)?
            .checked_add(minutes.checked_mul(60)?)?
            .checked_add(seconds)?;
        Some(Self(total))
    }
}

impl fmt::Display for SessionDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.format())
    }
}

// ============================================================================
// Open Session
// ============================================================================

/// The session currently in progress, as seen by background readers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenSession {
    /// Public URL that is current for this session
    pub url: String,
    /// When the session was opened
    pub started: DateTime<Local>,
}

impl OpenSession {
    pub fn new(url: impl Into<String>, started: DateTime<Local>) -> Self {
        Self {
            url: url.into(),
            started,
        }
    }

    /// Time elapsed since the session opened, as of `now`.
    pub fn running_for(&self, now: DateTime<Local>) -> SessionDuration {
        SessionDuration::between(self.started, now)
    }
}

// ============================================================================
// Tunnel Session
// ============================================================================

/// One continuous interval during which a public URL was current.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelSession {
    pub url: String,
    pub start: DateTime<Local>,
    /// `None` while the session is open
    pub end: Option<DateTime<Local>>,
    /// True if the session was reconstructed after a crash
    pub recovered: bool,
}

impl TunnelSession {
    /// Opens a new live session.
    pub fn open(url: impl Into<String>, start: DateTime<Local>) -> Self {
        Self {
            url: url.into(),
            start,
            end: None,
            recovered: false,
        }
    }

    /// Rebuilds an orphaned session found at startup.
    pub fn orphaned(url: impl Into<String>, start: DateTime<Local>) -> Self {
        Self {
            url: url.into(),
            start,
            end: None,
            recovered: true,
        }
    }

    /// Closes the session at `end`.
    ///
    /// An end before the start is clamped to the start.
    pub fn close(mut self, end: DateTime<Local>) -> Self {
        self.end = Some(end.max(self.start));
        self
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.end.is_none()
    }

    /// Length of a closed session; zero while still open.
    pub fn duration(&self) -> SessionDuration {
        self.end
            .map(|end| SessionDuration::between(self.start, end))
            .unwrap_or_default()
    }

    /// Whether the URL is known (not the recovery sentinel).
    #[must_use]
    pub fn has_known_url(&self) -> bool {
        self.url != UNKNOWN_URL
    }
}

impl From<&OpenSession> for TunnelSession {
    fn from(open: &OpenSession) -> Self {
        Self::open(open.url.clone(), open.started)
    }
}
