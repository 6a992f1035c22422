//! Periodic maintenance and self test
//!
//! The maintenance daemon wakes on a fixed schedule, keeps the operating
//! system underneath the server up to date, probes every sibling subsystem,
//! and mails a consolidated report. The schedule is anchored: the k-th run
//! starts at `t0 + 10min + k * IntervalSec` regardless of how long earlier
//! runs took, and a run that would overlap the next tick elides that tick
//! instead of queueing it.
//!
//! # One execution
//!
//! ```text
//! system maintenance subshell (package upgrades, clock sync)
//!     |
//!     +-- in parallel: port knocks | feature self tests
//!     |                mail client | HTTP handler checks
//!     v
//! compose report -> mail to recipients -> blacklist refresh -> skew clamp
//! ```

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{info, warn};

use crate::dns::BlacklistStore;
use crate::error::{ConfigError, DaemonError};
use crate::httpd::HandlerCollection;
use crate::lockdown::{self, StartupTime};
use crate::logbuf::LogRing;
use crate::mailer::MailClient;
use crate::stats::MetricsSink;
use crate::toolbox::FeatureSet;

/// Lowest acceptable maintenance interval
pub const MINIMUM_INTERVAL_SEC: i64 = 3600;

/// Interval applied when the configuration does not set one
const DEFAULT_INTERVAL_SEC: i64 = 86400;

/// Delay before the very first run
const FIRST_RUN_DELAY: Duration = Duration::from_secs(600);

/// Port knock connect deadline
const PORT_CHECK_TIMEOUT: Duration = Duration::from_secs(10);

/// Deadline for the system package upgrade
const UPGRADE_TIMEOUT_SEC: u64 = 2 * 3600;

/// Deadline for installing one utility package
const INSTALL_TIMEOUT_SEC: u64 = 5 * 60;

/// Package-manager output containing any of these collapses to `skipped`
const SUPPRESS_OUTPUT_MARKERS: &[&str] = &[
    "No packages marked for update",
    "Nothing to do",
    "0 upgraded, 0 newly installed",
    "Unable to locate",
];

/// Utility packages kept installed on the host
const UTILITY_PACKAGES: &[&str] = &[
    "busybox", "chrony", "curl", "lsof", "nc", "net-tools", "netcat", "nmap", "ntpdate", "strace",
    "sudo", "tcpdump", "telnet", "traceroute", "unzip", "vim", "wget", "whois", "zip",
];

/// Configuration of the maintenance daemon
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct MaintenanceConfig {
    /// Seconds between runs; values below 3600 are rejected, absent or
    /// non-positive values default to 86400
    #[serde(rename = "IntervalSec", default)]
    pub interval_sec: i64,

    /// Recipients of the report mail
    #[serde(rename = "Recipients", default)]
    pub recipients: Vec<String>,

    /// Ports knocked on localhost
    #[serde(rename = "TCPPorts", default)]
    pub tcp_ports: Vec<u16>,

    /// Ports knocked per remote host
    #[serde(rename = "CheckTCPPorts", default)]
    pub check_tcp_ports: HashMap<String, Vec<u16>>,
}

/// Everything the maintenance run probes or refreshes
pub struct MaintenanceDeps {
    /// Report mail transport, also self-tested
    pub mailer: Arc<MailClient>,
    /// Toolbox features to self-test
    pub features: Arc<FeatureSet>,
    /// HTTP handler collection to self-test, when an HTTP daemon runs
    pub http_handlers: Option<Arc<HandlerCollection>>,
    /// Blacklist to refresh each cycle, when a DNS daemon runs
    pub blacklist: Option<Arc<BlacklistStore>>,
    /// Latency histograms embedded in the report
    pub sink: Arc<MetricsSink>,
    /// Recent log lines embedded in the report
    pub log_ring: Arc<LogRing>,
    /// Startup anchor, clamped when the clock skews
    pub startup: Arc<StartupTime>,
}

/// The maintenance daemon
pub struct MaintenanceDaemon {
    config: MaintenanceConfig,
    interval: Duration,
    deps: MaintenanceDeps,
    running: AtomicBool,
    stop_notify: Notify,
}

impl MaintenanceDaemon {
    /// Build the daemon, applying the interval floor and default.
    pub fn new(config: MaintenanceConfig, deps: MaintenanceDeps) -> Result<Self, ConfigError> {
        let interval_sec = effective_interval_sec(config.interval_sec).map_err(|bad| {
            ConfigError::ValidationError(format!(
                "Maintenance.IntervalSec must be at or above {MINIMUM_INTERVAL_SEC}, got {bad}"
            ))
        })?;
        Ok(Self {
            config,
            interval: Duration::from_secs(interval_sec),
            deps,
            running: AtomicBool::new(false),
            stop_notify: Notify::new(),
        })
    }

    /// The effective interval after floor and default handling
    #[must_use]
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Run the schedule until stopped or lockdown.
    pub async fn start_and_block(&self) -> Result<(), DaemonError> {
        self.running.store(true, Ordering::SeqCst);
        let mut next_run = Instant::now() + FIRST_RUN_DELAY;
        info!(
            interval_sec = self.interval.as_secs(),
            "maintenance scheduled"
        );

        let mut lockdown_tick = tokio::time::interval(crate::dns::LOCKDOWN_POLL_INTERVAL);
        loop {
            tokio::select! {
                _ = lockdown_tick.tick() => {
                    if lockdown::is_locked_down() {
                        self.running.store(false, Ordering::SeqCst);
                        return Err(DaemonError::Lockdown);
                    }
                }
                () = self.stop_notify.notified() => {
                    info!("maintenance daemon stopping");
                    return Ok(());
                }
                () = tokio::time::sleep_until(tokio::time::Instant::from_std(next_run)) => {
                    self.execute().await;
                    next_run = advance_schedule(next_run, Instant::now(), self.interval);
                }
            }
        }
    }

    /// Signal the schedule loop to stop; idempotent.
    pub fn stop(&self) {
        if self
            .running
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.stop_notify.notify_one();
        }
    }

    /// One full maintenance run. Returns the report body and the all-OK
    /// verdict.
    pub async fn execute(&self) -> (String, bool) {
        info!("maintenance run starting");
        let maintenance_output = system_maintenance().await;
        let (report, all_ok) = self.run_checks_and_compose(&maintenance_output).await;

        if let Err(err) = self
            .deps
            .mailer
            .send("maintenance", &report, &self.config.recipients)
            .await
        {
            warn!(error = %err, "failed to mail maintenance report");
        }

        if let Some(blacklist) = &self.deps.blacklist {
            blacklist.refresh().await;
        }

        if self
            .deps
            .startup
            .clamp_if_skewed(Duration::from_secs(MINIMUM_INTERVAL_SEC as u64))
        {
            warn!("clock was severely skewed, startup time clamped");
        }

        if all_ok {
            info!("maintenance run completed, everything OK");
        } else {
            warn!("maintenance run completed with errors");
        }
        (report, all_ok)
    }

    /// The parallel check fan-out and report composition, separated from
    /// [`execute`](Self::execute) so the slow package-manager step can be
    /// bypassed where it has no business running.
    pub async fn run_checks_and_compose(&self, maintenance_output: &str) -> (String, bool) {
        let (ports_result, feature_failures, mail_result, http_result) = tokio::join!(
            self.run_port_checks(),
            self.deps.features.self_test(),
            self.deps.mailer.self_test(),
            async {
                match &self.deps.http_handlers {
                    Some(handlers) => handlers.self_test(),
                    None => Ok(()),
                }
            },
        );

        let all_ok = ports_result.is_ok()
            && feature_failures.is_empty()
            && mail_result.is_ok()
            && http_result.is_ok();

        let mut report = String::with_capacity(4096);
        if all_ok {
            report.push_str("All OK\n");
        } else {
            report.push_str("There are errors!!!\n");
        }
        report.push_str(&self.runtime_info());
        report.push_str("\nDaemon stats - low/avg/high/total seconds and (count):\n");
        report.push_str(&self.deps.sink.format_report());

        match &ports_result {
            Ok(()) => report.push_str("\nPorts: OK\n"),
            Err(err) => report.push_str(&format!("\nPort errors: {err}\n")),
        }
        if feature_failures.is_empty() {
            report.push_str("\nFeatures: OK\n");
        } else {
            report.push_str("\nFeature errors:\n");
            for (trigger, err) in &feature_failures {
                report.push_str(&format!("  {trigger}: {err}\n"));
            }
        }
        match &mail_result {
            Ok(()) => report.push_str("\nMail processor: OK\n"),
            Err(err) => report.push_str(&format!("\nMail processor errors: {err}\n")),
        }
        match &http_result {
            Ok(()) => report.push_str("\nHTTP handlers: OK\n"),
            Err(err) => report.push_str(&format!("\nHTTP handler errors: {err}\n")),
        }

        report.push_str("\nSystem maintenance:\n");
        report.push_str(maintenance_output);
        report.push_str("\nWarnings:\n");
        report.push_str(&self.deps.log_ring.recent_warnings());
        report.push_str("\nLogs:\n");
        report.push_str(&self.deps.log_ring.recent_logs());
        report.push('\n');

        (report, all_ok)
    }

    /// Knock every configured TCP port in parallel; an error lists every
    /// unreachable `host:port`.
    pub async fn run_port_checks(&self) -> Result<(), String> {
        let mut targets: Vec<(String, u16)> = Vec::new();
        for port in &self.config.tcp_ports {
            targets.push(("localhost".to_string(), *port));
        }
        for (host, ports) in &self.config.check_tcp_ports {
            if host.is_empty() {
                continue;
            }
            for port in ports {
                targets.push((host.clone(), *port));
            }
        }
        if targets.is_empty() {
            return Ok(());
        }

        let mut handles = Vec::with_capacity(targets.len());
        for (host, port) in targets {
            handles.push(tokio::spawn(async move {
                let destination = format!("{host}:{port}");
                let reachable = tokio::time::timeout(
                    PORT_CHECK_TIMEOUT,
                    tokio::net::TcpStream::connect(&destination),
                )
                .await
                .map(|r| r.is_ok())
                .unwrap_or(false);
                (destination, reachable)
            }));
        }

        let mut failures = Vec::new();
        for handle in handles {
            if let Ok((destination, reachable)) = handle.await {
                if !reachable {
                    failures.push(destination);
                }
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            failures.sort();
            Err(format!("failed to connect to {}", failures.join(", ")))
        }
    }

    fn runtime_info(&self) -> String {
        let host = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_string());
        format!(
            "toolhost {} on {host}, pid {}, up {}s, {} requests served\n",
            crate::VERSION,
            std::process::id(),
            self.deps.startup.uptime().as_secs(),
            self.deps.sink.total_count(),
        )
    }
}

/// Interval floor and default handling: non-positive means daily, anything
/// between 1 and the floor is a configuration error.
fn effective_interval_sec(configured: i64) -> Result<u64, i64> {
    if configured <= 0 {
        Ok(DEFAULT_INTERVAL_SEC as u64)
    } else if configured < MINIMUM_INTERVAL_SEC {
        Err(configured)
    } else {
        Ok(configured as u64)
    }
}

/// Advance the anchored schedule past `now`, eliding ticks a slow run
/// overlapped.
fn advance_schedule(previous: Instant, now: Instant, interval: Duration) -> Instant {
    let mut next = previous + interval;
    while next <= now {
        next += interval;
    }
    next
}

/// Keep the host system up to date. Returns a human-readable transcript;
/// every failure is embedded in the transcript rather than propagated, since
/// a half-working host still wants the rest of the maintenance run.
pub async fn system_maintenance() -> String {
    let mut transcript = String::from("--- Conducting system maintenance...\n");

    let manager = find_package_manager();
    match &manager {
        Some((name, path)) => {
            transcript.push_str(&format!("--- Package manager is {path:?}\n"));
            let mut env: Vec<(String, String)> = Vec::new();
            if name == "apt-get" {
                env.push(("DEBIAN_FRONTEND".into(), "noninteractive".into()));
                transcript.push_str("--- Updating apt manifests...\n");
                let (output, err) =
                    invoke_program(&env, INSTALL_TIMEOUT_SEC, path, &["update"]).await;
                transcript.push_str(&format!(
                    "--- apt-get update result: {} - {}\n\n",
                    err.as_deref().unwrap_or("ok"),
                    output.trim()
                ));
            }

            let (upgrade_args, install_args) = package_manager_args(name);
            transcript.push_str("--- Upgrading system packages...\n");
            let (output, err) = invoke_program(&env, UPGRADE_TIMEOUT_SEC, path, &upgrade_args).await;
            let output = suppress_noise(&output);
            transcript.push_str(&format!(
                "--- System upgrade result: {} - {}\n\n",
                err.as_deref().unwrap_or("ok"),
                output.trim()
            ));

            for package in UTILITY_PACKAGES {
                let mut args = install_args.clone();
                args.push(package);
                transcript.push_str(&format!("--- Installing/upgrading {package}\n"));
                let (output, err) = invoke_program(&env, INSTALL_TIMEOUT_SEC, path, &args).await;
                let output = suppress_noise(&output);
                transcript.push_str(&format!(
                    "--- {package} result: {} - {}\n\n",
                    err.as_deref().unwrap_or("ok"),
                    output.trim()
                ));
            }
        }
        None => {
            transcript
                .push_str("--- Will not install system software: no known package manager found\n");
        }
    }

    // Try each clock tool; whichever exists wins
    for (program, args) in [
        ("ntpdate", vec!["-4", "0.pool.ntp.org", "us.pool.ntp.org"]),
        ("chronyd", vec!["-q", "pool pool.ntp.org iburst"]),
        ("busybox", vec!["ntpd", "-n", "-q", "-p", "pool.ntp.org"]),
    ] {
        let (output, err) = invoke_program(&[], 60, program, &args).await;
        transcript.push_str(&format!(
            "--- clock synchronisation result ({program}): {} - {}\n\n",
            err.as_deref().unwrap_or("ok"),
            output.trim()
        ));
    }

    transcript.push_str("--- System maintenance has finished.\n");
    transcript
}

fn find_package_manager() -> Option<(String, String)> {
    // zypper is preferred over apt-get because of opensuse's non-functional
    // apt-get wrapper
    for prefix in ["/sbin", "/bin", "/usr/sbin", "/usr/bin"] {
        for name in ["yum", "zypper", "apt-get"] {
            let path = format!("{prefix}/{name}");
            if std::path::Path::new(&path).exists() {
                return Some((name.to_string(), path));
            }
        }
    }
    None
}

fn package_manager_args(name: &str) -> (Vec<&'static str>, Vec<&'static str>) {
    match name {
        "yum" => (
            vec!["-y", "-t", "--skip-broken", "update"],
            vec!["-y", "-t", "--skip-broken", "install"],
        ),
        "apt-get" => (
            vec![
                "-q", "-y", "-f", "-m",
                "-o", "Dpkg::Options::=--force-confdef",
                "-o", "Dpkg::Options::=--force-confold",
                "upgrade",
            ],
            vec![
                "-q", "-y", "-f", "-m",
                "-o", "Dpkg::Options::=--force-confdef",
                "-o", "Dpkg::Options::=--force-confold",
                "install",
            ],
        ),
        "zypper" => (
            vec![
                "--non-interactive", "update", "--auto-agree-with-licenses",
                "--skip-interactive", "--replacefiles", "--force-resolution",
            ],
            vec![
                "--non-interactive", "install", "--auto-agree-with-licenses",
                "--replacefiles", "--force-resolution",
            ],
        ),
        _ => (Vec::new(), Vec::new()),
    }
}

fn suppress_noise(output: &str) -> String {
    for marker in SUPPRESS_OUTPUT_MARKERS {
        if output.contains(marker) {
            return "skipped".to_string();
        }
    }
    output.to_string()
}

/// Run one external program with a hard wall-clock deadline; the process
/// group is killed on overrun. Returns the combined output and an optional
/// error description.
async fn invoke_program(
    env: &[(String, String)],
    timeout_sec: u64,
    program: &str,
    args: &[&str],
) -> (String, Option<String>) {
    let mut cmd = tokio::process::Command::new(program);
    cmd.args(args)
        .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);

    let child = match cmd.spawn() {
        Ok(child) => child,
        Err(err) => return (String::new(), Some(format!("failed to start: {err}"))),
    };
    let pid = child.id();

    match tokio::time::timeout(Duration::from_secs(timeout_sec), child.wait_with_output()).await {
        Ok(Ok(output)) => {
            let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
            combined.push_str(&String::from_utf8_lossy(&output.stderr));
            let err = if output.status.success() {
                None
            } else {
                Some(format!("exit status {}", output.status.code().unwrap_or(-1)))
            };
            (combined, err)
        }
        Ok(Err(err)) => (String::new(), Some(format!("wait failed: {err}"))),
        Err(_) => {
            #[cfg(unix)]
            if let Some(pid) = pid {
                if let Ok(pid) = i32::try_from(pid) {
                    use nix::sys::signal::{killpg, Signal};
                    use nix::unistd::Pid;
                    let _ = killpg(Pid::from_raw(pid), Signal::SIGKILL);
                }
            }
            #[cfg(not(unix))]
            let _ = pid;
            (String::new(), Some("timed out".to_string()))
        }
    }
}
