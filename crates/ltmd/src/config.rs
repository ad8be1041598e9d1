//! Daemon configuration.
//!
//! Loaded from TOML. Every field has a default, so a missing file or a
//! file that sets a single key is valid:
//!
//! ```toml
//! [tunnel]
//! port = 8080
//! subdomain = "my-box"
//!
//! [notify]
//! method = "sendmail"
//! recipient = "ops@example.com"
//! ```

use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use ltm_core::RetryPolicy;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Environment variable pointing at an alternative config file.
pub const CONFIG_ENV: &str = "LTM_CONFIG";

/// Errors from loading the configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

// ============================================================================
// Sections
// ============================================================================

/// Which tunnel to run and how to launch it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    /// Local port exposed through the relay
    pub port: u16,
    /// Subdomain to pin; `None` lets the relay choose (or reuse the last one)
    pub subdomain: Option<String>,
    /// Relay client binary
    pub binary: String,
    /// Extra arguments appended after `--port`/`--subdomain`
    pub extra_args: Vec<String>,
    /// How long a fresh process must survive to count as started
    pub spawn_grace_ms: u64,
    /// Other executables that must be on PATH before a start is attempted
    pub required_tools: Vec<String>,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            port: 3000,
            subdomain: None,
            binary: "lt".to_string(),
            extra_args: Vec::new(),
            spawn_grace_ms: 1500,
            required_tools: Vec::new(),
        }
    }
}

impl TunnelConfig {
    pub fn spawn_grace(&self) -> Duration {
        Duration::from_millis(self.spawn_grace_ms)
    }
}

/// Where state files live. Relative names resolve against `state_dir`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub state_dir: Option<PathBuf>,
    pub output_log: PathBuf,
    pub url_file: PathBuf,
    pub history_file: PathBuf,
    pub backup_file: PathBuf,
    pub start_marker: PathBuf,
    pub status_file: PathBuf,
    pub change_log: PathBuf,
    pub daemon_log: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            state_dir: None,
            output_log: PathBuf::from("tunnel_output.log"),
            url_file: PathBuf::from("tunnel_url.txt"),
            history_file: PathBuf::from("tunnel_durations.log"),
            backup_file: PathBuf::from("tunnel_backup.log"),
            start_marker: PathBuf::from("tunnel_start_time.txt"),
            status_file: PathBuf::from("status.json"),
            change_log: PathBuf::from("tunnel_changes.log"),
            daemon_log: PathBuf::from("ltmd.log"),
        }
    }
}

impl PathsConfig {
    /// Returns the state directory, defaulting to `<state dir>/ltm`.
    pub fn state_dir(&self) -> PathBuf {
        self.state_dir.clone().unwrap_or_else(|| {
            dirs::state_dir()
                .unwrap_or_else(|| PathBuf::from("/tmp"))
                .join("ltm")
        })
    }

    /// Resolves every configured file against the state directory.
    pub fn resolve(&self) -> StatePaths {
        let dir = self.state_dir();
        let join = |p: &Path| if p.is_absolute() { p.to_path_buf() } else { dir.join(p) };
        StatePaths {
            output_log: join(&self.output_log),
            url_file: join(&self.url_file),
            history_file: join(&self.history_file),
            backup_file: join(&self.backup_file),
            start_marker: join(&self.start_marker),
            status_file: join(&self.status_file),
            change_log: join(&self.change_log),
            daemon_log: join(&self.daemon_log),
            daemon_pid: dir.join("ltmd.pid"),
            state_dir: dir,
        }
    }
}

/// Fully resolved state file locations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatePaths {
    pub state_dir: PathBuf,
    pub output_log: PathBuf,
    pub url_file: PathBuf,
    pub history_file: PathBuf,
    pub backup_file: PathBuf,
    pub start_marker: PathBuf,
    pub status_file: PathBuf,
    pub change_log: PathBuf,
    pub daemon_log: PathBuf,
    pub daemon_pid: PathBuf,
}

impl StatePaths {
    /// All paths rooted in one directory, with default file names.
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        PathsConfig {
            state_dir: Some(dir.into()),
            ..PathsConfig::default()
        }
        .resolve()
    }

    /// PID file of the tunnel subprocess for `port`.
    pub fn pid_file(&self, port: u16) -> PathBuf {
        self.state_dir.join(format!("localtunnel_{port}.pid"))
    }
}

/// Scheduling of the supervisor loop and watchdog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub check_interval_secs: u64,
    pub watchdog_interval_secs: u64,
    /// Close the open session when the daemon is asked to stop
    pub close_session_on_shutdown: bool,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: 600,
            watchdog_interval_secs: 60,
            close_session_on_shutdown: false,
        }
    }
}

impl SupervisorConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs.max(1))
    }

    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_secs(self.watchdog_interval_secs.max(1))
    }
}

/// Connectivity probe settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// Timeout of a single request
    pub request_timeout_secs: u64,
    /// Budget for all retries of one method
    pub total_timeout_secs: u64,
    /// Successful methods required to declare the URL reachable
    pub quorum: usize,
    pub curl: String,
    pub wget: String,
    pub retry: RetryPolicy,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 5,
            total_timeout_secs: 30,
            quorum: 2,
            curl: "curl".to_string(),
            wget: "wget".to_string(),
            retry: RetryPolicy {
                max_attempts: 3,
                base_delay_secs: 1.0,
                backoff: 2.0,
                jitter: true,
                ceiling_secs: 8.0,
                cooldown_cycles: 0,
                cooldown_secs: 0,
            },
        }
    }
}

impl ProbeConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    pub fn total_timeout(&self) -> Duration {
        Duration::from_secs(self.total_timeout_secs.max(1))
    }
}

/// Session ledger bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Sessions shorter than this are not written to history
    pub min_session_secs: u64,
    pub backup_interval_secs: u64,
    pub audit_interval_secs: u64,
    /// How many recent history entries the audit checks
    pub audit_sample: usize,
    /// How many uncorroborated entries the audit warning lists
    pub audit_examples: usize,
    /// Candidate system logs; the first one that exists is used
    pub system_logs: Vec<PathBuf>,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            min_session_secs: 10,
            backup_interval_secs: 300,
            audit_interval_secs: 1800,
            audit_sample: 20,
            audit_examples: 3,
            system_logs: vec![
                PathBuf::from("/var/log/syslog"),
                PathBuf::from("/var/log/messages"),
            ],
        }
    }
}

impl LedgerConfig {
    pub fn backup_interval(&self) -> Duration {
        Duration::from_secs(self.backup_interval_secs.max(1))
    }

    pub fn audit_interval(&self) -> Duration {
        Duration::from_secs(self.audit_interval_secs.max(1))
    }
}

/// How URL changes reach the operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotifyMethod {
    #[default]
    Log,
    Sendmail,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    pub method: NotifyMethod,
    pub recipient: Option<String>,
    pub sender: Option<String>,
    pub sendmail: String,
    pub subject: String,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            method: NotifyMethod::Log,
            recipient: None,
            sender: None,
            sendmail: "sendmail".to_string(),
            subject: "Localtunnel URL".to_string(),
        }
    }
}

// ============================================================================
// Config
// ============================================================================

/// Complete daemon configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub tunnel: TunnelConfig,
    pub paths: PathsConfig,
    pub supervisor: SupervisorConfig,
    pub retry: RetryPolicy,
    pub probe: ProbeConfig,
    pub ledger: LedgerConfig,
    pub notify: NotifyConfig,
}

impl Config {
    /// Default config file location.
    pub fn default_path() -> PathBuf {
        if let Some(path) = env::var_os(CONFIG_ENV) {
            return PathBuf::from(path);
        }
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/etc"))
            .join("ltm")
            .join("config.toml")
    }

    /// Loads the configuration.
    ///
    /// An explicit path must exist. Without one, the default location is
    /// tried and a missing file yields the defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        match explicit {
            Some(path) => Self::from_file(path),
            None => {
                let path = Self::default_path();
                if path.exists() {
                    Self::from_file(&path)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    /// Reads and parses a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Resolved state file locations.
    pub fn state_paths(&self) -> StatePaths {
        self.paths.resolve()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.tunnel.port, 3000);
        assert_eq!(config.tunnel.binary, "lt");
        assert_eq!(config.supervisor.check_interval(), Duration::from_secs(600));
        assert_eq!(config.supervisor.watchdog_interval(), Duration::from_secs(60));
        assert_eq!(config.retry.max_attempts, 10);
        assert_eq!(config.retry.cooldown_cycles, 5);
        assert_eq!(config.probe.quorum, 2);
        assert_eq!(config.ledger.min_session_secs, 10);
        assert_eq!(config.ledger.backup_interval(), Duration::from_secs(300));
        assert_eq!(config.ledger.audit_interval(), Duration::from_secs(1800));
        assert_eq!(config.notify.method, NotifyMethod::Log);
    }

    #[test]
    fn test_partial_toml() {
        let config = Config::from_toml(
            r#"
            [tunnel]
            port = 8080
            subdomain = "my-box"

            [probe.retry]
            max_attempts = 5

            [notify]
            method = "sendmail"
            recipient = "ops@example.com"
            "#,
        )
        .unwrap();

        assert_eq!(config.tunnel.port, 8080);
        assert_eq!(config.tunnel.subdomain.as_deref(), Some("my-box"));
        assert_eq!(config.tunnel.binary, "lt");
        assert_eq!(config.probe.retry.max_attempts, 5);
        assert_eq!(config.probe.retry.base_delay_secs, 2.0);
        assert_eq!(config.notify.method, NotifyMethod::Sendmail);
        assert_eq!(config.ledger, LedgerConfig::default());
    }

    #[test]
    fn test_empty_toml_is_default() {
        assert_eq!(Config::from_toml("").unwrap(), Config::default());
    }

    #[test]
    fn test_zero_intervals_are_clamped() {
        let config = Config::from_toml(
            "[supervisor]\ncheck_interval_secs = 0\nwatchdog_interval_secs = 0\n",
        )
        .unwrap();
        assert_eq!(config.supervisor.check_interval(), Duration::from_secs(1));
        assert_eq!(config.supervisor.watchdog_interval(), Duration::from_secs(1));
    }

    #[test]
    fn test_invalid_toml() {
        assert!(Config::from_toml("[tunnel]\nport = \"many\"").is_err());
    }

    #[test]
    fn test_paths_resolve_against_state_dir() {
        let paths = PathsConfig {
            state_dir: Some(PathBuf::from("/srv/ltm")),
            history_file: PathBuf::from("/var/lib/ltm/history.log"),
            ..PathsConfig::default()
        }
        .resolve();

        assert_eq!(paths.output_log, PathBuf::from("/srv/ltm/tunnel_output.log"));
        assert_eq!(paths.history_file, PathBuf::from("/var/lib/ltm/history.log"));
        assert_eq!(paths.daemon_pid, PathBuf::from("/srv/ltm/ltmd.pid"));
        assert_eq!(paths.pid_file(3000), PathBuf::from("/srv/ltm/localtunnel_3000.pid"));
    }

    #[test]
    fn test_load_explicit_missing_file_fails() {
        let result = Config::load(Some(Path::new("/nonexistent/ltm/config.toml")));
        assert!(matches!(result, Err(ConfigError::Read { .. })));
    }
}
