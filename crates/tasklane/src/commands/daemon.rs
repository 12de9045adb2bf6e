//! Daemon management commands
//!
//! The daemon runs as a separate `tasklane-daemon` process. Its liveness
//! marker (`daemon.lock`) is the only channel between the two: start waits
//! for the marker to appear, stop signals the owning pid and waits for the
//! marker to be released.

use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use libtasklane_core::TasklaneError;
use libtasklane_sync::{DaemonLock, DaemonLog};
use serde::Serialize;

use crate::cli::{Cli, DaemonCommand};
use crate::context::{from_daemon_error, TasklaneContext};
use crate::output::{format_timestamp_ms, output_success, print_human};

const START_TIMEOUT: Duration = Duration::from_secs(5);
/// Long enough for an in-flight tick to finish
const STOP_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Serialize)]
struct StartOutput {
    started: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<&'static str>,
    pid: u32,
    interval_ms: u64,
    offline_mode: bool,
}

#[derive(Serialize)]
struct StopOutput {
    stopped: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pid: Option<u32>,
}

#[derive(Serialize)]
struct StatusOutput {
    running: bool,
    stale: bool,
    /// Alive, but the heartbeat is overdue (usually a long tick)
    lagging: bool,
    #[serde(flatten)]
    marker: Option<DaemonLock>,
    #[serde(skip_serializing_if = "Option::is_none")]
    time_remaining_ms: Option<u64>,
}

pub fn run(cli: &Cli, cmd: DaemonCommand) -> Result<(), TasklaneError> {
    match cmd {
        DaemonCommand::Start { interval, offline } => start(cli, interval, offline),
        DaemonCommand::Stop => stop(cli),
        DaemonCommand::Status => status(cli),
    }
}

fn live_marker(ctx: &TasklaneContext) -> Result<Option<DaemonLock>, TasklaneError> {
    let marker = DaemonLock::read(&ctx.data_dir).map_err(from_daemon_error)?;
    Ok(marker.filter(|lock| !lock.is_stale()))
}

fn start(cli: &Cli, interval: Option<u64>, offline: bool) -> Result<(), TasklaneError> {
    let ctx = TasklaneContext::resolve(cli)?;

    if let Some(lock) = live_marker(&ctx)? {
        if cli.json {
            return output_success(
                cli,
                StartOutput {
                    started: false,
                    reason: Some("Daemon already running"),
                    pid: lock.pid,
                    interval_ms: lock.interval_ms,
                    offline_mode: lock.offline_mode,
                },
            );
        }
        print_human(cli, &format!("Daemon already running (PID {})", lock.pid));
        return Ok(());
    }

    if interval == Some(0) {
        return Err(TasklaneError::InvalidArgs("interval must be at least 1 second".to_string()));
    }

    let mut command = Command::new(find_daemon_binary());
    command.arg("--data-dir").arg(&ctx.data_dir);
    if let Some(secs) = interval {
        command.arg("--interval").arg(secs.to_string());
    }
    if offline {
        command.arg("--offline");
    }
    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| TasklaneError::Internal(format!("Failed to spawn tasklane-daemon: {}", e)))?;

    let started = Instant::now();
    let mut delay = Duration::from_millis(50);
    let lock = loop {
        if let Some(lock) = live_marker(&ctx)? {
            break lock;
        }
        if let Some(exit) = child.try_wait()? {
            return Err(TasklaneError::Internal(format!(
                "tasklane-daemon exited during startup ({}); see {}",
                exit,
                libtasklane_core::config::daemon_log_path(&ctx.data_dir).display()
            )));
        }
        if started.elapsed() >= START_TIMEOUT {
            return Err(TasklaneError::Internal("Daemon started but failed to become ready".to_string()));
        }
        thread::sleep(delay);
        delay = (delay * 2).min(Duration::from_millis(500));
    };

    if cli.json {
        return output_success(
            cli,
            StartOutput {
                started: true,
                reason: None,
                pid: lock.pid,
                interval_ms: lock.interval_ms,
                offline_mode: lock.offline_mode,
            },
        );
    }
    print_human(cli, &format!("Daemon started (PID {})", lock.pid));
    print_human(cli, &format!("  Interval:  {}s", lock.interval_ms / 1000));
    if lock.offline_mode {
        print_human(cli, "  Offline mode: heartbeat only");
    }
    Ok(())
}

fn not_stopped(cli: &Cli, reason: &'static str, human: &str) -> Result<(), TasklaneError> {
    if cli.json {
        return output_success(cli, StopOutput { stopped: false, reason: Some(reason), pid: None });
    }
    print_human(cli, human);
    Ok(())
}

fn stop(cli: &Cli) -> Result<(), TasklaneError> {
    let ctx = TasklaneContext::resolve(cli)?;

    let lock = match DaemonLock::read(&ctx.data_dir).map_err(from_daemon_error)? {
        Some(lock) if !lock.is_stale() => lock,
        Some(stale) => {
            DaemonLock::remove_stale(&ctx.data_dir, &stale).map_err(from_daemon_error)?;
            return not_stopped(
                cli,
                "Daemon not running, cleaned up stale marker",
                "Daemon is not running (cleaned up stale marker)",
            );
        }
        None => return not_stopped(cli, "Daemon not running", "Daemon is not running"),
    };

    send_terminate(lock.pid)?;

    // The marker disappears once the in-flight tick is done and the daemon exits
    let started = Instant::now();
    let mut delay = Duration::from_millis(50);
    loop {
        match DaemonLock::read(&ctx.data_dir).map_err(from_daemon_error)? {
            None => break,
            Some(current) if current.daemon_id != lock.daemon_id => break,
            Some(current) if current.is_stale() => {
                DaemonLock::remove_stale(&ctx.data_dir, &current).map_err(from_daemon_error)?;
                break;
            }
            Some(_) => {}
        }
        if started.elapsed() >= STOP_TIMEOUT {
            return Err(TasklaneError::Internal(format!(
                "Daemon (PID {}) did not stop within {}s",
                lock.pid,
                STOP_TIMEOUT.as_secs()
            )));
        }
        thread::sleep(delay);
        delay = (delay * 2).min(Duration::from_millis(500));
    }

    if cli.json {
        return output_success(cli, StopOutput { stopped: true, reason: None, pid: Some(lock.pid) });
    }
    print_human(cli, &format!("Daemon stopped (PID {})", lock.pid));
    Ok(())
}

fn status(cli: &Cli) -> Result<(), TasklaneError> {
    let ctx = TasklaneContext::resolve(cli)?;
    let marker = DaemonLock::read(&ctx.data_dir).map_err(from_daemon_error)?;

    if cli.json {
        let output = StatusOutput {
            running: marker.as_ref().map_or(false, |lock| !lock.is_stale()),
            stale: marker.as_ref().map_or(false, DaemonLock::is_stale),
            lagging: marker.as_ref().map_or(false, DaemonLock::is_lagging),
            time_remaining_ms: marker.as_ref().map(DaemonLock::time_remaining_ms),
            marker,
        };
        return output_success(cli, output);
    }

    match marker {
        Some(ref lock) if !lock.is_stale() => {
            let mut lines = vec![
                "Daemon is running".to_string(),
                format!("  PID:          {}", lock.pid),
                format!("  Started:      {}", format_timestamp_ms(lock.started_ts)),
                format!("  Interval:     {}s", lock.interval_ms / 1000),
                format!("  Mode:         {}", if lock.offline_mode { "offline" } else { "online" }),
                format!("  Ticks:        {}", lock.sync_count),
            ];
            if lock.is_lagging() {
                lines.push("  Heartbeat:    overdue (a tick is taking longer than the lease)".to_string());
            }
            if let Some(ts) = lock.last_sync_ts {
                lines.push(format!("  Last tick:    {}", format_timestamp_ms(ts)));
            }
            let recent = DaemonLog::tail(&ctx.data_dir, 3).map_err(from_daemon_error)?;
            if !recent.is_empty() {
                lines.push("  Recent log:".to_string());
                lines.extend(recent.into_iter().map(|l| format!("    {}", l)));
            }
            print_human(cli, &lines.join("\n"));
        }
        Some(_) => print_human(cli, "Daemon is not running (stale marker)"),
        None => print_human(cli, "Daemon is not running"),
    }
    Ok(())
}

/// Look next to the current executable first, then fall back to PATH
fn find_daemon_binary() -> String {
    if let Ok(current_exe) = std::env::current_exe() {
        if let Some(dir) = current_exe.parent() {
            let candidate = dir.join("tasklane-daemon");
            if candidate.exists() {
                return candidate.to_string_lossy().to_string();
            }
        }
    }
    "tasklane-daemon".to_string()
}

#[cfg(unix)]
fn send_terminate(pid: u32) -> Result<(), TasklaneError> {
    let pid = libc::pid_t::try_from(pid)
        .ok()
        .filter(|p| *p > 0)
        .ok_or_else(|| TasklaneError::Internal(format!("invalid daemon pid {}", pid)))?;
    // SAFETY: kill has no memory-safety preconditions
    let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        // Already gone; the wait loop cleans up the marker
        if err.raw_os_error() != Some(libc::ESRCH) {
            return Err(TasklaneError::Io(err));
        }
    }
    Ok(())
}

#[cfg(not(unix))]
fn send_terminate(_pid: u32) -> Result<(), TasklaneError> {
    Err(TasklaneError::UnsupportedCapability(
        "stopping the daemon requires a unix platform".to_string(),
    ))
}
