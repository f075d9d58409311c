use std::fs::OpenOptions;
use std::path::PathBuf;

use anyhow::{Context as _, Result};
use fs2::FileExt;
use tracing::{info, warn};

use homestak_server::daemon;
use homestak_server::tls::primary_ip;

/// Control surface over the server daemon, injectable for tests.
pub trait ServerControl {
    fn is_healthy(&self) -> bool;
    fn start(&mut self) -> Result<()>;
    fn stop(&mut self) -> Result<()>;
}

/// Drives the real daemon on this machine by re-execing the engine
/// binary.
pub struct LocalServerControl {
    pub port: u16,
    pub repos: Vec<PathBuf>,
    pub repo_token: Option<String>,
}

impl ServerControl for LocalServerControl {
    fn is_healthy(&self) -> bool {
        let status = daemon::check_status(self.port);
        status.running && status.healthy
    }

    fn start(&mut self) -> Result<()> {
        let mut args = vec![
            "server".to_string(),
            "start".to_string(),
            "--port".to_string(),
            self.port.to_string(),
        ];
        for repo in &self.repos {
            args.push("--repos".to_string());
            args.push(repo.to_string_lossy().into_owned());
        }
        if let Some(token) = &self.repo_token {
            args.push("--repo-token".to_string());
            args.push(token.clone());
        }
        daemon::start_detached(&args, self.port)?;
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        daemon::stop(self.port)
    }
}

/// Reference-counted handle on the shared spec/repo server.
///
/// `ensure` starts the server only when nothing healthy is running
/// and remembers whether this instance started it; `release` stops it
/// only when the count reaches zero on the instance that started it.
/// A server someone else started is never stopped here.
pub struct ServerHandle {
    control: Box<dyn ServerControl>,
    port: u16,
    advertise_addr: String,
    lock_dir: PathBuf,
    refs: u32,
    started: bool,
}

impl ServerHandle {
    pub fn new(
        control: Box<dyn ServerControl>,
        port: u16,
        advertise_addr: String,
        lock_dir: PathBuf,
    ) -> Self {
        Self {
            control,
            port,
            advertise_addr,
            lock_dir,
            refs: 0,
            started: false,
        }
    }

    /// Handle over the real local daemon.
    pub fn local(
        port: u16,
        advertise_addr: String,
        repos: Vec<PathBuf>,
        repo_token: Option<String>,
    ) -> Self {
        Self::new(
            Box::new(LocalServerControl {
                port,
                repos,
                repo_token,
            }),
            port,
            advertise_addr,
            daemon::run_dir(),
        )
    }

    /// Base URL children use to reach this server.
    pub fn base_url(&self) -> String {
        format!("https://{}:{}", self.advertise_addr, self.port)
    }

    pub fn started_here(&self) -> bool {
        self.started
    }

    pub fn ensure(&mut self) -> Result<()> {
        self.refs += 1;
        if self.refs > 1 {
            return Ok(());
        }

        // Concurrent runs serialize on a file lock across the
        // status-check/start window, so exactly one of them starts.
        let _lock = self.creation_lock()?;

        if self.control.is_healthy() {
            info!(port = self.port, "Server already running (reusing)");
            self.started = false;
            return Ok(());
        }

        info!(port = self.port, "Starting spec/repo server");
        self.control.start()?;
        self.started = true;
        Ok(())
    }

    pub fn release(&mut self) -> Result<()> {
        if self.refs == 0 {
            warn!("Server release without matching ensure");
            return Ok(());
        }
        self.refs -= 1;
        if self.refs > 0 {
            return Ok(());
        }

        if !self.started {
            return Ok(());
        }
        info!(port = self.port, "Stopping spec/repo server");
        self.control.stop()?;
        self.started = false;
        Ok(())
    }

    fn creation_lock(&self) -> Result<std::fs::File> {
        std::fs::create_dir_all(&self.lock_dir)
            .with_context(|| format!("Failed to create run dir: {}", self.lock_dir.display()))?;
        let path = self.lock_dir.join(format!("server-{}.lock", self.port));
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .with_context(|| format!("Failed to open {}", path.display()))?;
        file.lock_exclusive()
            .with_context(|| format!("Failed to lock {}", path.display()))?;
        Ok(file)
    }
}

/// Resolve the address children should use to reach this machine.
///
/// Explicit `--self-addr` wins, then the `HOMESTAK_SELF_ADDR`
/// environment variable, then routing-table detection. Loopback is a
/// last resort that children will not be able to reach.
pub fn resolve_advertise_addr(self_addr: Option<&str>) -> String {
    if let Some(addr) = self_addr {
        let addr = addr.trim();
        if !addr.is_empty() {
            return addr.to_string();
        }
    }
    if let Ok(addr) = std::env::var("HOMESTAK_SELF_ADDR") {
        let addr = addr.trim().to_string();
        if !addr.is_empty() {
            return addr;
        }
    }
    if let Some(addr) = primary_ip() {
        return addr;
    }
    warn!(
        "Could not detect a routable address; advertising loopback \
         (child nodes will not reach it; pass --self-addr)"
    );
    "127.0.0.1".to_string()
}
