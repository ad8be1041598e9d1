//! Status document published for dashboards.
//!
//! The supervisor rewrites this after every cycle and watchdog pass.
//! Readers only ever see summaries and one-line error messages.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Coarse tunnel state shown to the operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TunnelState {
    Active,
    Inactive,
    #[default]
    Unknown,
}

impl TunnelState {
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for TunnelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Supervisor state machine position.
///
/// `NoTunnel -> Starting -> Active -> (Degraded -> Starting) -> ...`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorPhase {
    #[default]
    NoTunnel,
    Starting,
    Active,
    Degraded,
}

impl SupervisorPhase {
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::NoTunnel => "no tunnel",
            Self::Starting => "starting",
            Self::Active => "active",
            Self::Degraded => "degraded",
        }
    }

    /// Maps the phase onto the coarse operator-facing state.
    #[must_use]
    pub fn tunnel_state(&self) -> TunnelState {
        match self {
            Self::Active => TunnelState::Active,
            Self::NoTunnel | Self::Degraded => TunnelState::Inactive,
            Self::Starting => TunnelState::Unknown,
        }
    }
}

impl fmt::Display for SupervisorPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One probe method's vote in the last connectivity check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeVote {
    pub method: String,
    pub ok: bool,
}

/// Snapshot of supervisor status.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub state: TunnelState,
    pub phase: SupervisorPhase,
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_started: Option<DateTime<Local>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_check: Option<DateTime<Local>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_check: Option<DateTime<Local>>,
    #[serde(default)]
    pub probe: Vec<ProbeVote>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tunnel_pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tunnel_memory_mb: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tunnel_cpu_percent: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl StatusSnapshot {
    /// Formats session uptime as "D days, H hours, M minutes".
    pub fn uptime(&self, now: DateTime<Local>) -> Option<String> {
        let started = self.session_started?;
        let secs = now.signed_duration_since(started).num_seconds().max(0);
        let days = secs / 86_400;
        let hours = (secs % 86_400) / 3600;
        let minutes = (secs % 3600) / 60;
        Some(format!("{days} days, {hours} hours, {minutes} minutes"))
    }
}
