use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context as _, Result};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::context::{address_key, id_key, Context};
use crate::error::ErrorKind;
use crate::time;

/// Per-node lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Pending,
    Creating,
    Created,
    Configuring,
    Configured,
    Delegating,
    Delegated,
    Testing,
    Tested,
    Destroying,
    Destroyed,
    Failed,
    Skipped,
}

impl NodeStatus {
    /// True once the node has an external footprint that a rollback
    /// or destroy pass must clean up.
    pub fn is_created_or_later(&self) -> bool {
        !matches!(
            self,
            NodeStatus::Pending | NodeStatus::Creating | NodeStatus::Skipped
        )
    }
}

/// Failure recorded against a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeError {
    pub kind: ErrorKind,
    pub message: String,
}

/// Durable record of one node's progress through a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub status: NodeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<NodeError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub context_overlay: BTreeMap<String, String>,
}

impl Default for NodeRecord {
    fn default() -> Self {
        Self {
            status: NodeStatus::Pending,
            assigned_id: None,
            address: None,
            parent_address: None,
            error: None,
            started_at: None,
            finished_at: None,
            context_overlay: BTreeMap::new(),
        }
    }
}

impl NodeRecord {
    pub fn transition(&mut self, status: NodeStatus) {
        if self.started_at.is_none() && status != NodeStatus::Pending {
            self.started_at = Some(time::utc_now());
        }
        if matches!(
            status,
            NodeStatus::Failed | NodeStatus::Destroyed | NodeStatus::Skipped
        ) {
            self.finished_at = Some(time::utc_now());
        }
        self.status = status;
    }

    pub fn fail(&mut self, kind: ErrorKind, message: impl Into<String>) {
        self.error = Some(NodeError {
            kind,
            message: message.into(),
        });
        self.transition(NodeStatus::Failed);
    }
}

/// Durable per-run record: node states plus the manifest fingerprint,
/// keyed by (manifest-name, host).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionState {
    pub manifest_name: String,
    pub host_name: String,
    pub fingerprint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<String>,
    pub nodes: BTreeMap<String, NodeRecord>,
}

impl ExecutionState {
    pub fn new(manifest_name: &str, host_name: &str, fingerprint: &str) -> Self {
        Self {
            manifest_name: manifest_name.to_string(),
            host_name: host_name.to_string(),
            fingerprint: fingerprint.to_string(),
            started_at: None,
            finished_at: None,
            nodes: BTreeMap::new(),
        }
    }

    pub fn register(&mut self, name: &str) -> &mut NodeRecord {
        self.nodes.entry(name.to_string()).or_default()
    }

    pub fn node(&self, name: &str) -> Option<&NodeRecord> {
        self.nodes.get(name)
    }

    pub fn node_mut(&mut self, name: &str) -> &mut NodeRecord {
        self.nodes.entry(name.to_string()).or_default()
    }

    pub fn start(&mut self) {
        self.started_at = Some(time::utc_now());
    }

    pub fn finish(&mut self) {
        self.finished_at = Some(time::utc_now());
    }

    /// Rebuild context keys from persisted node records so destroy can
    /// locate resources without the create run's context.
    pub fn to_context(&self) -> Context {
        let mut ctx = Context::new();
        for (name, record) in &self.nodes {
            if let Some(id) = record.assigned_id {
                ctx.set(id_key(name), id.to_string());
            }
            if let Some(address) = &record.address {
                ctx.set(address_key(name), address.clone());
            }
            for (k, v) in &record.context_overlay {
                ctx.set(k.clone(), v.clone());
            }
        }
        ctx
    }
}

/// Filesystem layout for one (manifest, host) run directory:
/// `state.json`, `fingerprint`, `provisioner/`, `lock`.
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    /// Base directory for all run state. Honors `HOMESTAK_STATE_DIR`,
    /// falling back to `~/.homestak/state`.
    pub fn base_dir() -> PathBuf {
        if let Some(dir) = std::env::var_os("HOMESTAK_STATE_DIR") {
            return PathBuf::from(dir);
        }
        if let Some(home) = std::env::var_os("HOME") {
            return Path::new(&home).join(".homestak").join("state");
        }
        PathBuf::from("/var/lib/homestak/state")
    }

    pub fn open(manifest_name: &str, host_name: &str) -> Result<Self> {
        Self::open_in(&Self::base_dir(), manifest_name, host_name)
    }

    pub fn open_in(base: &Path, manifest_name: &str, host_name: &str) -> Result<Self> {
        let dir = base.join(format!("{}@{}", manifest_name, host_name));
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create state directory: {}", dir.display()))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn state_path(&self) -> PathBuf {
        self.dir.join("state.json")
    }

    pub fn fingerprint_path(&self) -> PathBuf {
        self.dir.join("fingerprint")
    }

    /// Provisioner state directory, isolated per (manifest, host).
    pub fn provisioner_dir(&self) -> Result<PathBuf> {
        let dir = self.dir.join("provisioner");
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create provisioner dir: {}", dir.display()))?;
        Ok(dir)
    }

    pub fn lock_path(&self) -> PathBuf {
        self.dir.join("lock")
    }

    /// Persist atomically: write a temporary sibling, fsync, rename.
    pub fn save(&self, state: &ExecutionState) -> Result<()> {
        let body = serde_json::to_vec_pretty(state).context("Failed to serialize state")?;
        write_atomic(&self.state_path(), &body)?;
        write_atomic(&self.fingerprint_path(), state.fingerprint.as_bytes())?;
        debug!(path = %self.state_path().display(), "Saved execution state");
        Ok(())
    }

    /// Load prior state if its fingerprint matches the current
    /// manifest; archive and start fresh on drift.
    pub fn load_or_init(
        &self,
        manifest_name: &str,
        host_name: &str,
        fingerprint: &str,
    ) -> Result<ExecutionState> {
        let path = self.state_path();
        if !path.exists() {
            return Ok(ExecutionState::new(manifest_name, host_name, fingerprint));
        }

        let text = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read state: {}", path.display()))?;
        let previous: ExecutionState = match serde_json::from_str(&text) {
            Ok(state) => state,
            Err(e) => {
                warn!(error = %e, "Existing state file is unreadable; archiving");
                self.archive(&path)?;
                return Ok(ExecutionState::new(manifest_name, host_name, fingerprint));
            }
        };

        if previous.fingerprint != fingerprint {
            warn!(
                previous = %previous.fingerprint,
                current = %fingerprint,
                "Manifest drift detected; archiving previous state"
            );
            self.archive(&path)?;
            return Ok(ExecutionState::new(manifest_name, host_name, fingerprint));
        }

        Ok(previous)
    }

    fn archive(&self, path: &Path) -> Result<()> {
        let archived = self.dir.join(format!("state.json.{}", time::file_stamp()));
        fs::rename(path, &archived)
            .with_context(|| format!("Failed to archive state to {}", archived.display()))?;
        Ok(())
    }

    /// Acquire the per-(manifest, host) run lock. With `block` the
    /// caller waits; otherwise a held lock fails fast.
    pub fn lock(&self, block: bool) -> Result<RunLock> {
        let path = self.lock_path();
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .with_context(|| format!("Failed to open lock file: {}", path.display()))?;

        if block {
            file.lock_exclusive()
                .with_context(|| format!("Failed to lock {}", path.display()))?;
        } else if file.try_lock_exclusive().is_err() {
            bail!(
                "already-running: another run holds the lock for {}",
                self.dir.display()
            );
        }

        Ok(RunLock { _file: file })
    }
}

/// Held for the lifetime of a run; dropping releases the flock.
#[derive(Debug)]
pub struct RunLock {
    _file: File,
}

fn write_atomic(path: &Path, body: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .context("Target path has no parent directory")?;
    let tmp = dir.join(format!(
        ".{}.tmp",
        path.file_name().unwrap_or_default().to_string_lossy()
    ));
    {
        let mut file = File::create(&tmp)
            .with_context(|| format!("Failed to create temp file: {}", tmp.display()))?;
        file.write_all(body)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)
        .with_context(|| format!("Failed to rename {} into place", tmp.display()))?;
    Ok(())
}
