//! Tunnel subprocess control.
//!
//! The PID file is the only durable record that a tunnel process belongs
//! to us. A PID file whose process is gone is deleted on sight.
//!
//! # Panic-Free Guarantees
//!
//! This module follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Lock poisoning is recovered with `PoisonError::into_inner`
//! - Signal failures are logged, never fatal

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use ltm_core::{TunnelError, TunnelResult};
use tracing::{debug, info, warn};

use crate::config::{Config, StatePaths};

// ============================================================================
// Process Control Trait
// ============================================================================

/// Start, check and stop the tunnel subprocess for a port.
#[async_trait]
pub trait TunnelProcess: Send + Sync {
    /// True iff a PID file exists for `port` and that process is running.
    ///
    /// A PID file for a dead process is removed as a side effect.
    fn is_active(&self, port: u16) -> bool;

    /// Launches the relay client and records its PID.
    async fn spawn(&self, port: u16, subdomain: Option<&str>) -> TunnelResult<u32>;

    /// Terminates the recorded process, if any, and removes the PID file.
    ///
    /// A no-op when nothing is recorded.
    fn stop(&self, port: u16);

    /// PID of the live tunnel process for `port`.
    fn pid(&self, port: u16) -> Option<u32>;
}

// ============================================================================
// PID File
// ============================================================================

/// Typed accessor for a PID file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Reads the recorded PID. `None` if missing or unparseable.
    pub fn read(&self) -> Option<u32> {
        let contents = fs::read_to_string(&self.path).ok()?;
        contents.trim().parse().ok().filter(|pid| *pid != 0)
    }

    /// Writes `pid` with owner-only permissions, replacing any old content.
    pub fn write(&self, pid: u32) -> TunnelResult<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| TunnelError::io("failed to create state directory", parent, e))?;
        }
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&self.path)
            .map_err(|e| TunnelError::io("failed to create PID file", &self.path, e))?;
        writeln!(file, "{pid}").map_err(|e| TunnelError::io("failed to write PID", &self.path, e))
    }

    /// Removes the file. Missing files are fine.
    pub fn remove(&self) {
        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "Failed to remove PID file");
            }
        }
    }
}

// ============================================================================
// OS helpers
// ============================================================================

/// Checks if a process with the given PID is running.
///
/// Zombies count as gone: they still have a `/proc` entry but will never
/// serve traffic again.
pub fn is_process_running(pid: u32) -> bool {
    let Ok(pid) = i32::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    match procfs::process::Process::new(pid).and_then(|p| p.stat()) {
        Ok(stat) => stat.state != 'Z',
        Err(_) => false,
    }
}

/// Sends SIGTERM to the process group led by `pid`, falling back to the
/// process alone when it does not lead a group.
pub fn terminate(pid: u32) -> bool {
    let Ok(pid) = i32::try_from(pid) else {
        return false;
    };
    // SAFETY: kill(2) has no memory-safety preconditions.
    let group = unsafe { libc::kill(-pid, libc::SIGTERM) };
    if group == 0 {
        return true;
    }
    // SAFETY: as above.
    let single = unsafe { libc::kill(pid, libc::SIGTERM) };
    single == 0
}

// ============================================================================
// Process Handle
// ============================================================================

/// Launches the relay client binary and tracks it through PID files.
///
/// The child gets its own process group so it survives the shell that
/// started the daemon and can be terminated as a unit. Its combined
/// stdout/stderr goes to the output log, truncated at every spawn.
pub struct ProcessHandle {
    binary: String,
    extra_args: Vec<String>,
    state_dir: PathBuf,
    output_log: PathBuf,
    spawn_grace: Duration,
    /// Children we launched, kept so exited ones can be reaped.
    children: Mutex<HashMap<u16, Child>>,
}

impl ProcessHandle {
    pub fn new(
        binary: impl Into<String>,
        state_dir: impl Into<PathBuf>,
        output_log: impl Into<PathBuf>,
    ) -> Self {
        Self {
            binary: binary.into(),
            extra_args: Vec::new(),
            state_dir: state_dir.into(),
            output_log: output_log.into(),
            spawn_grace: Duration::from_millis(1500),
            children: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        let paths = config.state_paths();
        Self::new(&config.tunnel.binary, paths.state_dir, paths.output_log)
            .with_extra_args(config.tunnel.extra_args.clone())
            .with_spawn_grace(config.tunnel.spawn_grace())
    }

    #[must_use]
    pub fn with_extra_args(mut self, args: Vec<String>) -> Self {
        self.extra_args = args;
        self
    }

    #[must_use]
    pub fn with_spawn_grace(mut self, grace: Duration) -> Self {
        self.spawn_grace = grace;
        self
    }

    /// PID file for `port`.
    pub fn pid_file(&self, port: u16) -> PidFile {
        PidFile::new(StatePaths::in_dir(&self.state_dir).pid_file(port))
    }

    pub fn output_log(&self) -> &Path {
        &self.output_log
    }

    fn build_command(&self, port: u16, subdomain: Option<&str>) -> TunnelResult<Command> {
        if let Some(parent) = self.output_log.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| TunnelError::io("failed to create log directory", parent, e))?;
        }
        let stdout = File::create(&self.output_log)
            .map_err(|e| TunnelError::io("failed to create tunnel output log", &self.output_log, e))?;
        let stderr = stdout
            .try_clone()
            .map_err(|e| TunnelError::io("failed to share tunnel output log", &self.output_log, e))?;

        let mut cmd = Command::new(&self.binary);
        cmd.arg("--port").arg(port.to_string());
        if let Some(subdomain) = subdomain {
            cmd.arg("--subdomain").arg(subdomain);
        }
        cmd.args(&self.extra_args)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .process_group(0);
        Ok(cmd)
    }

    fn children(&self) -> std::sync::MutexGuard<'_, HashMap<u16, Child>> {
        self.children.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Collects exit statuses of children that have terminated.
    fn reap_exited(&self) {
        self.children().retain(|port, child| match child.try_wait() {
            Ok(Some(status)) => {
                debug!(port, pid = child.id(), %status, "Reaped tunnel process");
                false
            }
            Ok(None) => true,
            Err(e) => {
                debug!(port, error = %e, "Failed to poll tunnel process");
                false
            }
        });
    }
}

#[async_trait]
impl TunnelProcess for ProcessHandle {
    fn is_active(&self, port: u16) -> bool {
        self.reap_exited();
        let pid_file = self.pid_file(port);

        let Some(pid) = pid_file.read() else {
            if pid_file.exists() {
                warn!(port, path = %pid_file.path().display(), "Unreadable PID file, removing");
                pid_file.remove();
            } else {
                debug!(port, "No PID file for port");
            }
            return false;
        };

        if is_process_running(pid) {
            debug!(port, pid, "Tunnel process is active");
            true
        } else {
            warn!(error = %TunnelError::StaleProcess { port, pid }, "Removing stale PID file");
            pid_file.remove();
            false
        }
    }

    async fn spawn(&self, port: u16, subdomain: Option<&str>) -> TunnelResult<u32> {
        let mut child = self
            .build_command(port, subdomain)?
            .spawn()
            .map_err(|e| TunnelError::SpawnFailed {
                port,
                reason: format!("{}: {e}", self.binary),
            })?;
        let pid = child.id();

        let pid_file = self.pid_file(port);
        if let Err(e) = pid_file.write(pid) {
            terminate(pid);
            if let Err(wait_err) = child.wait() {
                debug!(port, pid, error = %wait_err, "Failed to reap tunnel process");
            }
            return Err(e);
        }

        info!(
            port,
            pid,
            binary = %self.binary,
            subdomain = subdomain.unwrap_or("-"),
            "Tunnel process spawned"
        );

        tokio::time::sleep(self.spawn_grace).await;

        match child.try_wait() {
            Ok(Some(status)) => {
                pid_file.remove();
                return Err(TunnelError::SpawnFailed {
                    port,
                    reason: format!("exited immediately ({status})"),
                });
            }
            Ok(None) => {}
            Err(e) => debug!(port, pid, error = %e, "Could not poll fresh tunnel process"),
        }

        self.children().insert(port, child);
        Ok(pid)
    }

    fn stop(&self, port: u16) {
        let pid_file = self.pid_file(port);

        match pid_file.read() {
            Some(pid) if is_process_running(pid) => {
                if terminate(pid) {
                    info!(port, pid, "Tunnel process terminated");
                } else {
                    warn!(port, pid, "Failed to signal tunnel process");
                }
            }
            Some(pid) => {
                warn!(port, pid, "No live process for PID file, removing it");
            }
            None if pid_file.exists() => {
                warn!(port, "Unreadable PID file, removing it");
            }
            None => {
                debug!(port, "No tunnel to stop");
                return;
            }
        }

        pid_file.remove();
        self.reap_exited();
    }

    fn pid(&self, port: u16) -> Option<u32> {
        self.pid_file(port).read().filter(|pid| is_process_running(*pid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    /// A PID above the kernel's maximum, so it can never be running.
    const DEAD_PID: u32 = i32::MAX as u32;

    fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn handle(dir: &TempDir, binary: &Path) -> ProcessHandle {
        ProcessHandle::new(
            binary.to_string_lossy(),
            dir.path(),
            dir.path().join("tunnel_output.log"),
        )
        .with_spawn_grace(Duration::from_millis(200))
    }

    #[test]
    fn test_pid_file_roundtrip_and_permissions() {
        let dir = TempDir::new().unwrap();
        let pid_file = PidFile::new(dir.path().join("localtunnel_3000.pid"));

        pid_file.write(4242).unwrap();
        assert_eq!(pid_file.read(), Some(4242));

        let mode = fs::metadata(pid_file.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        pid_file.remove();
        assert!(!pid_file.exists());
        pid_file.remove();
    }

    #[test]
    fn test_pid_file_garbage_reads_none() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("x.pid");
        fs::write(&path, "not-a-pid").unwrap();
        assert_eq!(PidFile::new(&path).read(), None);
    }

    #[test]
    fn test_is_process_running() {
        assert!(is_process_running(std::process::id()));
        assert!(!is_process_running(DEAD_PID));
        assert!(!is_process_running(0));
    }

    #[test]
    fn test_is_active_without_pid_file() {
        let dir = TempDir::new().unwrap();
        let handle = handle(&dir, Path::new("lt"));
        assert!(!handle.is_active(3000));
        assert!(!handle.pid_file(3000).exists());
    }

    #[test]
    fn test_is_active_removes_stale_pid_file() {
        let dir = TempDir::new().unwrap();
        let handle = handle(&dir, Path::new("lt"));
        handle.pid_file(3000).write(DEAD_PID).unwrap();

        assert!(!handle.is_active(3000));
        assert!(!handle.pid_file(3000).exists());
    }

    #[test]
    fn test_stop_when_idle_is_noop() {
        let dir = TempDir::new().unwrap();
        let handle = handle(&dir, Path::new("lt"));
        handle.stop(3000);
        handle.stop(3000);
        assert!(!handle.pid_file(3000).exists());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_stop_removes_stale_pid_file() {
        let dir = TempDir::new().unwrap();
        let handle = handle(&dir, Path::new("lt"));
        handle.pid_file(3000).write(DEAD_PID).unwrap();
        handle.stop(3000);
        assert!(!handle.pid_file(3000).exists());
    }

    #[tokio::test]
    async fn test_spawn_and_stop() {
        let dir = TempDir::new().unwrap();
        let script = write_script(
            dir.path(),
            "fake-lt",
            "echo \"your url is: https://fake.loca.lt\"\nexec sleep 30",
        );
        let handle = handle(&dir, &script);

        let pid = handle.spawn(3000, Some("fake")).await.unwrap();
        assert!(handle.is_active(3000));
        assert_eq!(handle.pid(3000), Some(pid));
        assert_eq!(handle.pid_file(3000).read(), Some(pid));

        let output = fs::read_to_string(handle.output_log()).unwrap();
        assert!(output.contains("https://fake.loca.lt"));

        handle.stop(3000);
        assert!(!handle.is_active(3000));
        assert!(!handle.pid_file(3000).exists());
    }

    #[tokio::test]
    async fn test_spawn_missing_binary() {
        let dir = TempDir::new().unwrap();
        let handle = handle(&dir, &dir.path().join("does-not-exist"));

        let err = handle.spawn(3000, None).await.unwrap_err();
        assert!(matches!(err, TunnelError::SpawnFailed { port: 3000, .. }));
        assert!(!handle.pid_file(3000).exists());
    }

    #[tokio::test]
    async fn test_spawn_pid_file_failure_terminates_child() {
        let dir = TempDir::new().unwrap();
        let script = write_script(dir.path(), "fake-lt", "exec sleep 30");
        let handle = handle(&dir, &script);
        // A directory where the PID file belongs cannot be opened for writing.
        fs::create_dir(handle.pid_file(3000).path()).unwrap();

        let err = handle.spawn(3000, None).await.unwrap_err();
        assert!(matches!(err, TunnelError::Io { .. }));
        assert!(handle.pid(3000).is_none());
    }

    #[tokio::test]
    async fn test_spawn_immediate_exit() {
        let dir = TempDir::new().unwrap();
        let script = write_script(dir.path(), "broken-lt", "exit 1");
        let handle = handle(&dir, &script);

        let err = handle.spawn(3000, None).await.unwrap_err();
        assert!(matches!(err, TunnelError::SpawnFailed { .. }));
        assert!(!handle.pid_file(3000).exists());
        assert!(!handle.is_active(3000));
    }

    #[tokio::test]
    async fn test_spawn_truncates_output_log() {
        let dir = TempDir::new().unwrap();
        let script = write_script(dir.path(), "quiet-lt", "exec sleep 30");
        let handle = handle(&dir, &script);
        fs::write(handle.output_log(), "your url is: https://old.loca.lt\n").unwrap();

        handle.spawn(3000, None).await.unwrap();
        let output = fs::read_to_string(handle.output_log()).unwrap();
        assert!(!output.contains("old.loca.lt"));

        handle.stop(3000);
    }
}
