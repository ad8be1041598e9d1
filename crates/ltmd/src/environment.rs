//! Precondition check run before any tunnel start.

use tracing::{debug, error};

use crate::config::TunnelConfig;

/// Whether the environment can run a tunnel at all.
pub trait EnvironmentCheck: Send + Sync {
    fn preconditions_met(&self) -> bool;
}

/// Requires the relay binary and any extra tools to be executable.
///
/// Names are resolved through `PATH`; names containing a `/` are checked
/// as paths.
#[derive(Debug, Clone)]
pub struct BinaryCheck {
    required: Vec<String>,
}

impl BinaryCheck {
    pub fn new(required: Vec<String>) -> Self {
        Self { required }
    }

    pub fn from_config(config: &TunnelConfig) -> Self {
        let mut required = vec![config.binary.clone()];
        required.extend(config.required_tools.iter().cloned());
        Self::new(required)
    }

    /// Required programs that cannot be found.
    pub fn missing(&self) -> Vec<&str> {
        self.required
            .iter()
            .map(String::as_str)
            .filter(|name| which::which(name).is_err())
            .collect()
    }
}

impl EnvironmentCheck for BinaryCheck {
    fn preconditions_met(&self) -> bool {
        let missing = self.missing();
        if missing.is_empty() {
            debug!(required = ?self.required, "Preconditions met");
            true
        } else {
            error!(missing = ?missing, "Tunnel preconditions not met, skipping start");
            false
        }
    }
}
