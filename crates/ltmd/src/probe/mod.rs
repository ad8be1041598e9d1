//! Connectivity prober - multi-method reachability voting.
//!
//! A tunnel URL counts as reachable only when a quorum of independent
//! methods (by default 2 of 3) get an HTTP 200 from it. Each method runs
//! its own retry loop bounded by an attempt count and a total timeout;
//! a method that runs out of either is a "no" vote, never an error.
//!
//! Every method always runs, even once the quorum is reached, so each
//! check logs a complete set of votes.
//!
//! ```text
//!   url ──▶ validate ──▶ http-client ─┐
//!                    ├──▶ curl ───────┼──▶ votes ──▶ quorum? ──▶ ProbeReport
//!                    └──▶ wget ───────┘
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use ltm_core::{ProbeVote, RetryPolicy, TunnelError};
use thiserror::Error;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::config::ProbeConfig;
use crate::url::validate_url;

mod command;
mod http;

pub use command::{CommandProbe, CommandProbeKind};
pub use http::HttpClientProbe;

/// Header that makes the localtunnel relay skip its reminder page.
pub const BYPASS_HEADER: (&str, &str) = ("bypass-tunnel-reminder", "true");

/// Errors from a single probe attempt.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("failed to build HTTP client: {0}")]
    ClientBuild(String),

    #[error("request failed: {0}")]
    Request(String),

    #[error("{program} failed to run: {reason}")]
    Command { program: String, reason: String },

    #[error("no HTTP status in {program} output")]
    NoStatus { program: String },

    #[error("attempt timed out after {0:?}")]
    Timeout(Duration),
}

// ============================================================================
// Traits
// ============================================================================

/// One independent way of fetching a URL.
#[async_trait]
pub trait ProbeMethod: Send + Sync {
    /// Short name used in logs and status output.
    fn name(&self) -> &str;

    /// Performs one request and returns the HTTP status code.
    async fn fetch_status(&self, url: &str) -> Result<u16, ProbeError>;
}

/// Decides whether a tunnel URL is reachable.
#[async_trait]
pub trait Prober: Send + Sync {
    /// Runs every method and reports their votes.
    async fn probe(&self, url: &str) -> ProbeReport;

    /// True iff the quorum of methods got an HTTP 200.
    async fn test_connectivity(&self, url: &str) -> bool {
        self.probe(url).await.reachable
    }
}

// ============================================================================
// Report
// ============================================================================

/// Outcome of one connectivity check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeReport {
    pub url: String,
    pub votes: Vec<ProbeVote>,
    pub reachable: bool,
}

impl ProbeReport {
    /// Report for a URL that was rejected before any probe ran.
    pub fn rejected(url: &str) -> Self {
        Self {
            url: url.to_string(),
            votes: Vec::new(),
            reachable: false,
        }
    }

    pub fn successes(&self) -> usize {
        self.votes.iter().filter(|v| v.ok).count()
    }
}

/// True iff at least `quorum` of the votes are positive.
pub fn has_quorum(votes: &[bool], quorum: usize) -> bool {
    quorum > 0 && votes.iter().filter(|ok| **ok).count() >= quorum
}

// ============================================================================
// Connectivity Prober
// ============================================================================

/// Quorum prober over a set of independent methods.
pub struct ConnectivityProber {
    methods: Vec<Arc<dyn ProbeMethod>>,
    retry: RetryPolicy,
    total_timeout: Duration,
    quorum: usize,
}

impl ConnectivityProber {
    pub fn new(methods: Vec<Arc<dyn ProbeMethod>>, retry: RetryPolicy, total_timeout: Duration) -> Self {
        Self {
            methods,
            retry,
            total_timeout,
            quorum: 2,
        }
    }

    /// The standard three methods: a pooled HTTP client, curl and wget.
    pub fn from_config(config: &ProbeConfig) -> Result<Self, ProbeError> {
        let request_timeout = config.request_timeout();
        let methods: Vec<Arc<dyn ProbeMethod>> = vec![
            Arc::new(HttpClientProbe::new(request_timeout)?),
            Arc::new(CommandProbe::new(CommandProbeKind::Curl, &config.curl, request_timeout)),
            Arc::new(CommandProbe::new(CommandProbeKind::Wget, &config.wget, request_timeout)),
        ];
        Ok(Self::new(methods, config.retry.clone(), config.total_timeout()).with_quorum(config.quorum))
    }

    #[must_use]
    pub fn with_quorum(mut self, quorum: usize) -> Self {
        self.quorum = quorum.max(1);
        self
    }

    pub fn quorum(&self) -> usize {
        self.quorum
    }

    /// Runs one method's retry loop and returns its vote.
    async fn vote(&self, method: &dyn ProbeMethod, url: &str) -> bool {
        let attempts = self.retry.max_attempts.max(1);
        let run = async {
            for attempt in 0..attempts {
                let started = Instant::now();
                match method.fetch_status(url).await {
                    Ok(200) => {
                        debug!(
                            method = method.name(),
                            url,
                            attempt = attempt + 1,
                            elapsed_ms = started.elapsed().as_millis() as u64,
                            "Probe succeeded"
                        );
                        return true;
                    }
                    Ok(status) => {
                        debug!(method = method.name(), url, status, attempt = attempt + 1, "Probe got non-200 status");
                    }
                    Err(e) => {
                        debug!(method = method.name(), url, attempt = attempt + 1, error = %e, "Probe attempt failed");
                    }
                }
                if attempt + 1 < attempts {
                    sleep(self.retry.delay_for(attempt)).await;
                }
            }
            false
        };

        match timeout(self.total_timeout, run).await {
            Ok(ok) => ok,
            Err(_) => {
                debug!(
                    method = method.name(),
                    url,
                    timeout_secs = self.total_timeout.as_secs(),
                    "Probe method ran out of time"
                );
                false
            }
        }
    }
}

#[async_trait]
impl Prober for ConnectivityProber {
    async fn probe(&self, url: &str) -> ProbeReport {
        if let Err(e) = validate_url(url) {
            warn!(error = %e, "Refusing to probe malformed URL");
            return ProbeReport::rejected(url);
        }

        let mut votes = Vec::with_capacity(self.methods.len());
        for method in &self.methods {
            let ok = self.vote(method.as_ref(), url).await;
            votes.push(ProbeVote {
                method: method.name().to_string(),
                ok,
            });
        }

        let flags: Vec<bool> = votes.iter().map(|v| v.ok).collect();
        let reachable = has_quorum(&flags, self.quorum);
        let report = ProbeReport {
            url: url.to_string(),
            votes,
            reachable,
        };

        let summary = report
            .votes
            .iter()
            .map(|v| format!("{}={}", v.method, if v.ok { "ok" } else { "fail" }))
            .collect::<Vec<_>>()
            .join(" ");
        if reachable {
            info!(url, votes = %summary, "Tunnel reachable");
        } else {
            let inconclusive = TunnelError::ProbeInconclusive {
                url: url.to_string(),
                successes: report.successes(),
                methods: report.votes.len(),
            };
            warn!(error = %inconclusive, votes = %summary, metric = "connectivity_failure", "Tunnel not reachable");
        }
        report
    }
}
