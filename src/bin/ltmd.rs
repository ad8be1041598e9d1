//! LTM Daemon - localtunnel supervisor
//!
//! Keeps one localtunnel client alive for a local port, tracks its public
//! URL and records how long each URL stayed current.
//!
//! # Usage
//!
//! ```bash
//! # Start the supervisor (foreground)
//! ltmd start
//!
//! # Start in the background, exposing port 8080 under a pinned subdomain
//! ltmd start -d --port 8080 --subdomain my-box
//!
//! # Stop the daemon; the tunnel keeps running until `tunnel-stop`
//! ltmd stop
//!
//! # Dashboard views
//! ltmd status
//! ltmd history --days 30
//!
//! # One-off connectivity check
//! ltmd probe https://my-box.loca.lt
//!
//! # Use another config file and enable debug logging
//! RUST_LOG=ltmd=debug ltmd --config ./ltm.toml start
//! ```
//!
//! # Signal Handling
//!
//! - SIGTERM/SIGINT: Graceful shutdown. The open session is left for crash
//!   recovery unless `close_session_on_shutdown` is set.

use std::fs::{self, File};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Local;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use ltm_core::history::daily_hours;
use ltmd::config::{Config, StatePaths};
use ltmd::environment::BinaryCheck;
use ltmd::ledger::{spawn_ledger_tasks, HistoryLog, LedgerFiles, SessionLedger};
use ltmd::notify::notifier_from_config;
use ltmd::probe::{ConnectivityProber, Prober};
use ltmd::process::{is_process_running, PidFile, ProcessHandle, TunnelProcess};
use ltmd::supervisor::{read_status, spawn_watchdog, Collaborators, TunnelSupervisor};
use ltmd::url::LogUrlExtractor;

/// LTM daemon - localtunnel supervisor
#[derive(Parser, Debug)]
#[command(name = "ltmd", version, about)]
struct Args {
    /// Config file (default: $LTM_CONFIG or ~/.config/ltm/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the supervisor
    Start {
        /// Run as a background daemon (fork to background)
        #[arg(short = 'd', long)]
        daemon: bool,
        /// Local port to expose (overrides the config)
        #[arg(long)]
        port: Option<u16>,
        /// Subdomain to request (overrides the config)
        #[arg(long)]
        subdomain: Option<String>,
    },
    /// Stop the running daemon
    Stop,
    /// Show tunnel and daemon status
    Status,
    /// Show recorded sessions
    History {
        /// How many days back to show
        #[arg(long, default_value_t = 7)]
        days: u32,
    },
    /// Run one quorum connectivity check
    Probe {
        url: String,
    },
    /// Stop the tunnel process and close its session
    TunnelStop,
}

/// Checks if the daemon is already running, clearing a stale PID file.
fn is_daemon_running(pid_file: &PidFile) -> Option<u32> {
    if let Some(pid) = pid_file.read() {
        if is_process_running(pid) {
            return Some(pid);
        }
        pid_file.remove();
    }
    None
}

/// Sends SIGTERM to the daemon process.
fn stop_daemon(pid: u32) -> Result<()> {
    let raw = i32::try_from(pid).context("PID out of range")?;
    // SAFETY: kill(2) has no memory-safety preconditions.
    let result = unsafe { libc::kill(raw, libc::SIGTERM) };
    if result != 0 {
        bail!("Failed to send SIGTERM to process {}", pid);
    }
    Ok(())
}

fn init_logging() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("ltmd=info".parse()?)
                .add_directive("ltm_core=info".parse()?),
        )
        .init();
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    let mut config = Config::load(args.config.as_deref()).context("Failed to load configuration")?;

    // Default to 'start' if no subcommand given
    let command = args.command.unwrap_or(Command::Start {
        daemon: false,
        port: None,
        subdomain: None,
    });

    if let Command::Start { port, subdomain, .. } = &command {
        if let Some(port) = port {
            config.tunnel.port = *port;
        }
        if subdomain.is_some() {
            config.tunnel.subdomain = subdomain.clone();
        }
    }
    let paths = config.state_paths();
    let daemon_pid = PidFile::new(&paths.daemon_pid);

    match command {
        Command::Start { daemon, .. } => {
            if let Some(pid) = is_daemon_running(&daemon_pid) {
                eprintln!("Daemon is already running (PID {})", pid);
                eprintln!("Use 'ltmd stop' to stop it first.");
                process::exit(1);
            }

            if daemon {
                // Daemonize before starting tokio runtime
                daemonize(&paths)?;
            }
            init_logging()?;

            daemon_pid
                .write(process::id())
                .context("Failed to write PID file")?;

            let result = run_daemon(config, paths);

            daemon_pid.remove();

            result
        }
        Command::Stop => {
            if let Some(pid) = is_daemon_running(&daemon_pid) {
                println!("Stopping daemon (PID {})...", pid);
                stop_daemon(pid)?;

                // Wait for process to exit (up to 5 seconds)
                for _ in 0..50 {
                    if !is_process_running(pid) {
                        println!("Daemon stopped.");
                        return Ok(());
                    }
                    std::thread::sleep(Duration::from_millis(100));
                }

                eprintln!("Daemon did not stop within 5 seconds.");
                process::exit(1);
            } else {
                println!("Daemon is not running.");
                Ok(())
            }
        }
        Command::Status => {
            let running = is_daemon_running(&daemon_pid);
            match running {
                Some(pid) => println!("Daemon is running (PID {})", pid),
                None => println!("Daemon is not running."),
            }
            print_status(&paths)?;
            if running.is_none() {
                process::exit(1);
            }
            Ok(())
        }
        Command::History { days } => {
            init_logging()?;
            print_history(&paths, days)
        }
        Command::Probe { url } => {
            init_logging()?;
            let reachable = run_probe(&config, &url)?;
            if !reachable {
                process::exit(1);
            }
            Ok(())
        }
        Command::TunnelStop => {
            init_logging()?;
            if let Some(pid) = is_daemon_running(&daemon_pid) {
                bail!("Daemon is running (PID {pid}) and would restart the tunnel; run 'ltmd stop' first");
            }
            stop_tunnel(&config, &paths)
        }
    }
}

/// Daemonizes the current process.
fn daemonize(paths: &StatePaths) -> Result<()> {
    use daemonize::Daemonize;

    let log_path = &paths.daemon_log;

    // Ensure log directory exists
    if let Some(parent) = log_path.parent() {
        fs::create_dir_all(parent).context("Failed to create log directory")?;
    }

    let stdout = File::options()
        .create(true)
        .append(true)
        .open(log_path)
        .context("Failed to open log file for stdout")?;
    let stderr = stdout.try_clone().context("Failed to open log file for stderr")?;

    Daemonize::new()
        .working_directory("/")
        .stdout(stdout)
        .stderr(stderr)
        .start()
        .context("Failed to daemonize")?;

    Ok(())
}

/// Runs the supervisor (async entry point).
#[tokio::main]
async fn run_daemon(config: Config, paths: StatePaths) -> Result<()> {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = process::id(),
        port = config.tunnel.port,
        state_dir = %paths.state_dir.display(),
        "LTM daemon starting"
    );

    let cancel_token = CancellationToken::new();

    // Setup signal handlers
    let shutdown_token = cancel_token.clone();
    tokio::spawn(async move {
        if let Err(e) = wait_for_shutdown_signal().await {
            error!(error = %e, "Error waiting for shutdown signal");
        }
        info!("Shutdown signal received");
        shutdown_token.cancel();
    });

    let urls = Arc::new(LogUrlExtractor::new(&paths.output_log));
    let ledger = SessionLedger::new(LedgerFiles::from_paths(&paths), &config.ledger, urls.as_ref())
        .context("Failed to open session ledger")?;
    if let Some(recovered) = ledger.recovered() {
        info!(url = %recovered.url, duration = %recovered.duration(), "Closed session left by previous run");
    }

    let ledger_tasks = spawn_ledger_tasks(
        ledger.backup_log().clone(),
        ledger.history_log().clone(),
        ledger.subscribe(),
        config.ledger.clone(),
        cancel_token.clone(),
    );

    let prober = ConnectivityProber::from_config(&config.probe).context("Failed to build connectivity prober")?;
    let collab = Collaborators {
        process: Arc::new(ProcessHandle::from_config(&config)),
        urls,
        prober: Arc::new(prober),
        notifier: notifier_from_config(&config.notify),
        environment: Arc::new(BinaryCheck::from_config(&config.tunnel)),
    };
    let supervisor = TunnelSupervisor::new(&config, &paths, collab, ledger);

    let watchdog = spawn_watchdog(supervisor.clone(), cancel_token.clone());
    supervisor.run(cancel_token).await;

    for (name, handle) in [("watchdog", watchdog), ("ledger tasks", ledger_tasks)] {
        if let Err(e) = handle.await {
            error!(task = name, error = %e, "Background task failed");
        }
    }

    info!("LTM daemon stopped");
    Ok(())
}

/// Waits for a shutdown signal (SIGTERM or SIGINT).
async fn wait_for_shutdown_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => {
            info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            info!("Received SIGINT");
        }
    }

    Ok(())
}

// ============================================================================
// Dashboard commands
// ============================================================================

fn print_status(paths: &StatePaths) -> Result<()> {
    let Some(status) = read_status(&paths.status_file).context("Failed to read status")? else {
        println!("No status recorded yet.");
        return Ok(());
    };

    let now = Local::now();
    let fmt_time = |t: Option<chrono::DateTime<Local>>| {
        t.map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "-".to_string())
    };

    println!("Tunnel:        {} ({})", status.state, status.phase);
    println!("Port:          {}", status.port);
    println!("URL:           {}", status.url.as_deref().unwrap_or("-"));
    println!("Session start: {}", fmt_time(status.session_started));
    if let Some(uptime) = status.uptime(now) {
        println!("Uptime:        {uptime}");
    }
    println!("Last check:    {}", fmt_time(status.last_check));
    println!("Next check:    {}", fmt_time(status.next_check));
    if !status.probe.is_empty() {
        let votes = status
            .probe
            .iter()
            .map(|v| format!("{}={}", v.method, if v.ok { "ok" } else { "fail" }))
            .collect::<Vec<_>>()
            .join(" ");
        println!("Probe:         {votes}");
    }
    if let Some(pid) = status.tunnel_pid {
        let usage = match (status.tunnel_memory_mb, status.tunnel_cpu_percent) {
            (Some(mb), Some(cpu)) => format!(" ({mb} MB, {cpu:.1}% CPU)"),
            _ => String::new(),
        };
        println!("Tunnel PID:    {pid}{usage}");
    }
    if let Some(err) = &status.last_error {
        println!("Last error:    {err}");
    }
    Ok(())
}

fn print_history(paths: &StatePaths, days: u32) -> Result<()> {
    let history = HistoryLog::new(&paths.history_file);
    let entries = history.entries().context("Failed to read history")?;
    let since = Local::now().date_naive() - chrono::Duration::days(i64::from(days));

    let recent: Vec<_> = entries.iter().filter(|e| e.date >= since).collect();
    if recent.is_empty() {
        println!("No sessions in the last {days} days.");
        return Ok(());
    }
    for entry in &recent {
        println!("{entry}");
    }

    println!();
    println!("Hours per day:");
    for (date, hours) in daily_hours(recent.iter().copied(), since) {
        println!("  {date}  {hours:>6.2}");
    }
    Ok(())
}

#[tokio::main]
async fn run_probe(config: &Config, url: &str) -> Result<bool> {
    let prober = ConnectivityProber::from_config(&config.probe).context("Failed to build connectivity prober")?;
    let report = prober.probe(url).await;
    for vote in &report.votes {
        println!("{:<6} {}", vote.method, if vote.ok { "ok" } else { "fail" });
    }
    println!(
        "{} ({}/{} methods, quorum {})",
        if report.reachable { "reachable" } else { "unreachable" },
        report.successes(),
        report.votes.len(),
        prober.quorum()
    );
    Ok(report.reachable)
}

fn stop_tunnel(config: &Config, paths: &StatePaths) -> Result<()> {
    let port = config.tunnel.port;
    let process = ProcessHandle::from_config(config);
    let was_active = process.is_active(port);
    process.stop(port);

    // Constructing the ledger closes a session the daemon left open.
    let urls = LogUrlExtractor::new(&paths.output_log);
    let ledger = SessionLedger::new(LedgerFiles::from_paths(paths), &config.ledger, &urls)
        .context("Failed to close session")?;

    match (was_active, ledger.recovered()) {
        (_, Some(session)) => println!("Tunnel stopped; closed session for {} ({}).", session.url, session.duration()),
        (true, None) => println!("Tunnel stopped."),
        (false, None) => println!("No tunnel running on port {port}."),
    }
    Ok(())
}
