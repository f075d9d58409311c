use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

use anyhow::{bail, Context as _, Result};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde::Serialize;
use tracing::{info, warn};

/// How long a stopping server gets between SIGTERM and SIGKILL.
const STOP_GRACE: Duration = Duration::from_secs(5);

/// How long the parent waits for a freshly started daemon to pass its
/// health gate.
const START_DEADLINE: Duration = Duration::from_secs(10);

/// Runtime directory for PID files. Honors `HOMESTAK_RUN_DIR`.
pub fn run_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os("HOMESTAK_RUN_DIR") {
        return PathBuf::from(dir);
    }
    PathBuf::from("/var/run/homestak")
}

/// Log directory for daemon output. Honors `HOMESTAK_LOG_DIR`.
pub fn log_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os("HOMESTAK_LOG_DIR") {
        return PathBuf::from(dir);
    }
    PathBuf::from("/var/log/homestak")
}

/// PID file path, port-qualified so multiple servers can coexist.
pub fn pid_file(port: u16) -> PathBuf {
    run_dir().join(format!("server-{}.pid", port))
}

pub fn log_file(port: u16) -> PathBuf {
    log_dir().join(format!("server-{}.log", port))
}

pub fn read_pid(path: &Path) -> Option<i32> {
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}

/// True when a process with the PID exists (signal 0 probe).
pub fn process_alive(pid: i32) -> bool {
    match kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        // EPERM means the process exists but belongs to someone else.
        Err(nix::errno::Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Probe `/health` over TLS on loopback. The self-signed certificate
/// is accepted here because the probe never leaves the machine.
pub fn health_check(port: u16) -> bool {
    let Ok(client) = reqwest::blocking::Client::builder()
        .danger_accept_invalid_certs(true)
        .timeout(Duration::from_secs(2))
        .build()
    else {
        return false;
    };
    client
        .get(format!("https://127.0.0.1:{}/health", port))
        .send()
        .map(|resp| resp.status().is_success())
        .unwrap_or(false)
}

#[derive(Debug, Clone, Serialize)]
pub struct DaemonStatus {
    pub running: bool,
    pub pid: Option<i32>,
    pub healthy: bool,
}

/// Check daemon status, cleaning up a stale PID file on the way.
pub fn check_status(port: u16) -> DaemonStatus {
    let path = pid_file(port);
    let Some(pid) = read_pid(&path) else {
        return DaemonStatus {
            running: false,
            pid: None,
            healthy: false,
        };
    };

    if !process_alive(pid) {
        let _ = std::fs::remove_file(&path);
        return DaemonStatus {
            running: false,
            pid: None,
            healthy: false,
        };
    }

    DaemonStatus {
        running: true,
        pid: Some(pid),
        healthy: health_check(port),
    }
}

/// Write this process's PID file. Called by the foreground server
/// before it starts accepting connections.
pub fn write_pid_file(port: u16) -> Result<PathBuf> {
    let dir = run_dir();
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create run dir: {}", dir.display()))?;
    let path = pid_file(port);
    std::fs::write(&path, std::process::id().to_string())
        .with_context(|| format!("Failed to write PID file: {}", path.display()))?;
    Ok(path)
}

pub fn remove_pid_file(port: u16) {
    let _ = std::fs::remove_file(pid_file(port));
}

/// Start the server as a detached daemon: re-exec this binary with
/// `--foreground` in its own session, then gate on `/health`.
///
/// An already-healthy server is reused; a stale one (dead process or
/// failing health) is killed and replaced.
pub fn start_detached(server_args: &[String], port: u16) -> Result<i32> {
    let status = check_status(port);
    if status.running {
        if status.healthy {
            info!(pid = status.pid, port, "Server already running; reusing");
            return Ok(status.pid.unwrap_or_default());
        }
        warn!(pid = status.pid, port, "Killing stale server");
        if let Some(pid) = status.pid {
            kill_process(pid)?;
        }
        remove_pid_file(port);
    }

    let log_path = log_file(port);
    if let Some(parent) = log_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create log dir: {}", parent.display()))?;
    }
    let log = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .with_context(|| format!("Failed to open log file: {}", log_path.display()))?;
    let log_err = log.try_clone()?;

    let exe = std::env::current_exe().context("Cannot determine engine binary path")?;
    let mut cmd = Command::new(exe);
    cmd.args(server_args)
        .arg("--foreground")
        .stdin(Stdio::null())
        .stdout(log)
        .stderr(log_err);

    // Detach into a new session so the daemon survives the parent.
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        unsafe {
            cmd.pre_exec(|| {
                nix::unistd::setsid()
                    .map(|_| ())
                    .map_err(|e| std::io::Error::from_raw_os_error(e as i32))
            });
        }
    }

    let child = cmd.spawn().context("Failed to spawn server daemon")?;
    let pid = child.id() as i32;

    // Startup is complete only when /health answers over TLS.
    let deadline = std::time::Instant::now() + START_DEADLINE;
    while std::time::Instant::now() < deadline {
        if health_check(port) {
            info!(pid, port, log = %log_path.display(), "Server started");
            return Ok(pid);
        }
        if !process_alive(pid) {
            bail!(
                "Server exited during startup; see {}",
                log_path.display()
            );
        }
        std::thread::sleep(Duration::from_millis(250));
    }

    bail!("Server started but health check never passed on port {}", port)
}

/// Stop the daemon identified by the port's PID file. Idempotent:
/// returns Ok when no server is running.
pub fn stop(port: u16) -> Result<()> {
    let path = pid_file(port);
    let Some(pid) = read_pid(&path) else {
        return Ok(());
    };

    if process_alive(pid) {
        kill_process(pid)?;
        info!(pid, port, "Server stopped");
    }
    let _ = std::fs::remove_file(&path);
    Ok(())
}

/// SIGTERM, wait for a clean exit, then SIGKILL.
fn kill_process(pid: i32) -> Result<()> {
    let target = Pid::from_raw(pid);
    match kill(target, Signal::SIGTERM) {
        Ok(()) => {}
        Err(nix::errno::Errno::ESRCH) => return Ok(()),
        Err(e) => bail!("Failed to signal pid {}: {}", pid, e),
    }

    let deadline = std::time::Instant::now() + STOP_GRACE;
    while std::time::Instant::now() < deadline {
        if !process_alive(pid) {
            return Ok(());
        }
        std::thread::sleep(Duration::from_millis(200));
    }

    match kill(target, Signal::SIGKILL) {
        Ok(()) | Err(nix::errno::Errno::ESRCH) => {}
        Err(e) => bail!("Failed to kill pid {}: {}", pid, e),
    }
    std::thread::sleep(Duration::from_millis(200));
    if process_alive(pid) {
        bail!("Process {} survived SIGKILL", pid);
    }
    Ok(())
}
