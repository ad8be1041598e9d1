//! URL change notification.
//!
//! Notifiers never fail the caller: delivery errors are logged and the
//! notification is dropped.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Local};
use ltm_core::{TunnelError, TunnelResult};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{error, info, warn};

use crate::config::{NotifyConfig, NotifyMethod};

/// Tells the operator that the public URL changed.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// `previous` is `None` when no URL was known before.
    async fn notify(&self, previous: Option<&str>, url: &str);
}

/// Builds the configured notifier.
pub fn notifier_from_config(config: &NotifyConfig) -> Arc<dyn Notifier> {
    match (config.method, &config.recipient) {
        (NotifyMethod::Sendmail, Some(recipient)) => Arc::new(SendmailNotifier::new(
            &config.sendmail,
            recipient,
            config.sender.clone(),
            &config.subject,
        )),
        (NotifyMethod::Sendmail, None) => {
            warn!("Sendmail notifications need a recipient, falling back to log");
            Arc::new(LogNotifier)
        }
        (NotifyMethod::Log, _) => Arc::new(LogNotifier),
    }
}

/// Body text of a change notification.
pub fn message_body(previous: Option<&str>, url: &str) -> String {
    match previous {
        Some(previous) => format!("The tunnel URL changed.\n\nPrevious: {previous}\nNew: {url}\n"),
        None => format!("The tunnel is up.\n\nURL: {url}\n"),
    }
}

// ============================================================================
// Log
// ============================================================================

/// Writes the change to the daemon log only.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, previous: Option<&str>, url: &str) {
        info!(previous = previous.unwrap_or("none"), url, "Tunnel URL notification");
    }
}

// ============================================================================
// Sendmail
// ============================================================================

/// Pipes an RFC 822 message into `sendmail -t`.
#[derive(Debug, Clone)]
pub struct SendmailNotifier {
    program: String,
    recipient: String,
    sender: Option<String>,
    subject: String,
}

impl SendmailNotifier {
    pub fn new(program: &str, recipient: &str, sender: Option<String>, subject: &str) -> Self {
        Self {
            program: program.to_string(),
            recipient: recipient.to_string(),
            sender,
            subject: subject.to_string(),
        }
    }

    pub fn compose(&self, previous: Option<&str>, url: &str) -> String {
        let mut message = String::new();
        if let Some(sender) = &self.sender {
            message.push_str(&format!("From: {sender}\n"));
        }
        message.push_str(&format!("To: {}\n", self.recipient));
        message.push_str(&format!("Subject: {}\n", self.subject));
        message.push_str("Content-Type: text/plain; charset=utf-8\n\n");
        message.push_str(&message_body(previous, url));
        message
    }

    async fn send(&self, message: &str) -> std::io::Result<std::process::ExitStatus> {
        let mut child = Command::new(&self.program)
            .arg("-t")
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(message.as_bytes()).await?;
            stdin.shutdown().await?;
        }
        child.wait().await
    }
}

#[async_trait]
impl Notifier for SendmailNotifier {
    async fn notify(&self, previous: Option<&str>, url: &str) {
        let message = self.compose(previous, url);
        match self.send(&message).await {
            Ok(status) if status.success() => {
                info!(recipient = %self.recipient, url, "Notification sent");
            }
            Ok(status) => {
                error!(recipient = %self.recipient, status = %status, "sendmail rejected notification");
            }
            Err(e) => {
                error!(program = %self.program, error = %e, "Failed to run sendmail");
            }
        }
    }
}

// ============================================================================
// Change Log
// ============================================================================

/// Append-only record of URL changes.
///
/// `<timestamp> | previous : <url or none> | new : <url>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeLog {
    path: PathBuf,
}

impl ChangeLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn format_line(at: DateTime<Local>, previous: Option<&str>, url: &str) -> String {
        format!(
            "{} | previous : {} | new : {}",
            at.format("%Y-%m-%d %H:%M:%S"),
            previous.unwrap_or("none"),
            url
        )
    }

    pub fn record(&self, at: DateTime<Local>, previous: Option<&str>, url: &str) -> TunnelResult<()> {
        use std::io::Write;

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| TunnelError::io("create state dir", parent, e))?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| TunnelError::io("open change log", &self.path, e))?;
        writeln!(file, "{}", Self::format_line(at, previous, url))
            .map_err(|e| TunnelError::io("append change log", &self.path, e))
    }
}
