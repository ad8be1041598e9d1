//! Probes that shell out to an external HTTP client.
//!
//! Running curl and wget as separate processes gives votes that do not
//! share a TLS stack or DNS cache with the daemon.

use std::process::{Output, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::timeout;

use super::{ProbeError, ProbeMethod, BYPASS_HEADER};

/// Which external client a [`CommandProbe`] drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandProbeKind {
    Curl,
    Wget,
}

impl CommandProbeKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Curl => "curl",
            Self::Wget => "wget",
        }
    }
}

/// Runs curl or wget once per attempt and reads the status it reports.
#[derive(Debug, Clone)]
pub struct CommandProbe {
    kind: CommandProbeKind,
    program: String,
    request_timeout: Duration,
}

impl CommandProbe {
    pub fn new(kind: CommandProbeKind, program: impl Into<String>, request_timeout: Duration) -> Self {
        Self {
            kind,
            program: program.into(),
            request_timeout,
        }
    }

    pub fn args(&self, url: &str) -> Vec<String> {
        let secs = self.request_timeout.as_secs().max(1);
        let header = format!("{}: {}", BYPASS_HEADER.0, BYPASS_HEADER.1);
        match self.kind {
            CommandProbeKind::Curl => vec![
                "-s".to_string(),
                "-o".to_string(),
                "/dev/null".to_string(),
                "-w".to_string(),
                "%{http_code}".to_string(),
                "--max-time".to_string(),
                secs.to_string(),
                "-H".to_string(),
                header,
                url.to_string(),
            ],
            CommandProbeKind::Wget => vec![
                "-q".to_string(),
                "-S".to_string(),
                "-O".to_string(),
                "/dev/null".to_string(),
                "--tries=1".to_string(),
                format!("--timeout={secs}"),
                format!("--header={header}"),
                url.to_string(),
            ],
        }
    }

    fn status_from(&self, output: &Output) -> Option<u16> {
        match self.kind {
            CommandProbeKind::Curl => curl_status(&String::from_utf8_lossy(&output.stdout)),
            CommandProbeKind::Wget => wget_status(&String::from_utf8_lossy(&output.stderr)),
        }
    }
}

#[async_trait]
impl ProbeMethod for CommandProbe {
    fn name(&self) -> &str {
        self.kind.name()
    }

    async fn fetch_status(&self, url: &str) -> Result<u16, ProbeError> {
        // The client enforces its own timeout; this guards against a hang.
        let limit = self.request_timeout + Duration::from_secs(2);
        let run = Command::new(&self.program)
            .args(self.args(url))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        let output = timeout(limit, run)
            .await
            .map_err(|_| ProbeError::Timeout(limit))?
            .map_err(|e| ProbeError::Command {
                program: self.program.clone(),
                reason: e.to_string(),
            })?;

        self.status_from(&output).ok_or_else(|| ProbeError::NoStatus {
            program: self.program.clone(),
        })
    }
}

/// Status from curl's `-w %{http_code}` output; `000` means no response.
pub fn curl_status(stdout: &str) -> Option<u16> {
    match stdout.trim().parse::<u16>() {
        Ok(0) | Err(_) => None,
        Ok(code) => Some(code),
    }
}

/// Status of the final response in wget's `-S` header dump.
///
/// Redirects print several status lines; the last one is the answer.
pub fn wget_status(stderr: &str) -> Option<u16> {
    stderr
        .lines()
        .rev()
        .map(str::trim)
        .filter(|line| line.starts_with("HTTP/"))
        .find_map(|line| line.split_whitespace().nth(1)?.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_curl_status() {
        assert_eq!(curl_status("200"), Some(200));
        assert_eq!(curl_status("503\n"), Some(503));
        assert_eq!(curl_status("000"), None);
        assert_eq!(curl_status(""), None);
    }

    #[test]
    fn test_wget_status_takes_last_response() {
        let stderr = "  HTTP/1.1 301 Moved Permanently\n  Location: https://x.loca.lt/\n  HTTP/1.1 200 OK\n  Content-Type: text/html\n";
        assert_eq!(wget_status(stderr), Some(200));
        assert_eq!(wget_status("wget: unable to resolve host address"), None);
    }

    #[test]
    fn test_args_carry_bypass_header() {
        let curl = CommandProbe::new(CommandProbeKind::Curl, "curl", Duration::from_secs(5));
        let args = curl.args("https://abc.loca.lt");
        assert!(args.contains(&"bypass-tunnel-reminder: true".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("https://abc.loca.lt"));

        let wget = CommandProbe::new(CommandProbeKind::Wget, "wget", Duration::from_secs(5));
        let args = wget.args("https://abc.loca.lt");
        assert!(args.contains(&"--header=bypass-tunnel-reminder: true".to_string()));
        assert!(args.contains(&"--timeout=5".to_string()));
    }

    #[tokio::test]
    async fn test_missing_program_is_an_error() {
        let probe = CommandProbe::new(
            CommandProbeKind::Curl,
            "/nonexistent/ltm-test/curl",
            Duration::from_secs(1),
        );
        let result = probe.fetch_status("https://abc.loca.lt").await;
        assert!(matches!(result, Err(ProbeError::Command { .. })));
    }
}
