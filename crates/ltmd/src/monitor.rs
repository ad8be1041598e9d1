//! Resource sampling of the tunnel subprocess.
//!
//! The watchdog samples the relay client's memory and CPU on each pass;
//! the figures go into the status snapshot and are logged at `warn` when
//! above threshold.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - A process that vanished between the liveness check and the sample
//!   simply yields no metrics

use sysinfo::{Pid, System};
use tracing::{debug, warn};

/// Memory usage warning threshold in MB.
pub const HIGH_MEMORY_THRESHOLD_MB: u64 = 200;

/// CPU usage warning threshold (percentage).
pub const HIGH_CPU_THRESHOLD_PERCENT: f32 = 80.0;

/// Resource usage of one process.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcessMetrics {
    pub pid: u32,
    pub memory_bytes: u64,
    pub memory_mb: u64,
    /// CPU usage as percentage (0.0 - 100.0+)
    pub cpu_percent: f32,
    pub memory_high: bool,
    pub cpu_high: bool,
}

impl ProcessMetrics {
    pub fn is_any_high(&self) -> bool {
        self.memory_high || self.cpu_high
    }
}

/// Samples a process by PID with `sysinfo`.
///
/// CPU usage is a delta between refreshes, so the first sample of a
/// process reads as 0%.
pub struct TunnelMonitor {
    system: System,
    memory_threshold_mb: u64,
    cpu_threshold_percent: f32,
}

impl TunnelMonitor {
    pub fn new() -> Self {
        Self::with_thresholds(HIGH_MEMORY_THRESHOLD_MB, HIGH_CPU_THRESHOLD_PERCENT)
    }

    pub fn with_thresholds(memory_threshold_mb: u64, cpu_threshold_percent: f32) -> Self {
        Self {
            system: System::new(),
            memory_threshold_mb,
            cpu_threshold_percent,
        }
    }

    pub fn memory_threshold_mb(&self) -> u64 {
        self.memory_threshold_mb
    }

    pub fn cpu_threshold_percent(&self) -> f32 {
        self.cpu_threshold_percent
    }

    /// Refreshes and returns metrics for `pid`, `None` if it is gone.
    pub fn sample(&mut self, pid: u32) -> Option<ProcessMetrics> {
        // refresh_all() is what makes cpu_usage() a real delta
        self.system.refresh_all();
        let process = self.system.process(Pid::from_u32(pid))?;

        let memory_bytes = process.memory();
        let cpu_percent = process.cpu_usage();
        let memory_mb = memory_bytes / 1024 / 1024;
        let metrics = ProcessMetrics {
            pid,
            memory_bytes,
            memory_mb,
            cpu_percent,
            memory_high: memory_mb > self.memory_threshold_mb,
            cpu_high: cpu_percent > self.cpu_threshold_percent,
        };
        self.log(&metrics);
        Some(metrics)
    }

    fn log(&self, metrics: &ProcessMetrics) {
        if metrics.memory_high {
            warn!(
                pid = metrics.pid,
                memory_mb = metrics.memory_mb,
                threshold_mb = self.memory_threshold_mb,
                "HIGH MEMORY: tunnel process above threshold"
            );
        } else if metrics.cpu_high {
            warn!(
                pid = metrics.pid,
                cpu_percent = format!("{:.1}", metrics.cpu_percent),
                threshold_percent = self.cpu_threshold_percent,
                "HIGH CPU: tunnel process above threshold"
            );
        } else {
            debug!(
                pid = metrics.pid,
                memory_mb = metrics.memory_mb,
                cpu_percent = format!("{:.1}", metrics.cpu_percent),
                "Tunnel resource usage"
            );
        }
    }
}

impl Default for TunnelMonitor {
    fn default() -> Self {
        Self::new()
    }
}
