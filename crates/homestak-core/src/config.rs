use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use serde::{Deserialize, Serialize};

use crate::secrets::Secrets;

/// Host record the engine targets: how to reach the hypervisor and
/// which users to operate as.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostConfig {
    pub name: String,
    /// Reachable address of the host.
    pub address: String,
    /// User for infrastructure operations (hypervisor CLI, secrets).
    #[serde(default = "default_admin_user")]
    pub admin_user: String,
    /// User for automation inside guests (cloud-init provisioned).
    #[serde(default = "default_automation_user")]
    pub automation_user: String,
    /// Hypervisor API endpoint override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_endpoint: Option<String>,
    /// Handle into the secrets file's api_tokens map.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<String>,
}

fn default_admin_user() -> String {
    "root".to_string()
}

fn default_automation_user() -> String {
    "homestak".to_string()
}

impl HostConfig {
    /// Host config for running against the local machine.
    pub fn local(name: &str) -> Self {
        Self {
            name: name.to_string(),
            address: "127.0.0.1".to_string(),
            admin_user: default_admin_user(),
            automation_user: default_automation_user(),
            api_endpoint: None,
            credentials: None,
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self.address.as_str(), "localhost" | "127.0.0.1" | "::1")
    }
}

/// Site-wide defaults merged lowest-priority into variable bundles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteDefaults {
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default)]
    pub packages: Vec<String>,
    #[serde(default)]
    pub ssh_options: Vec<String>,
    #[serde(default = "default_datastore")]
    pub datastore: String,
    /// Base URL of the spec server, if fixed for the site.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec_server: Option<String>,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_datastore() -> String {
    "local".to_string()
}

impl Default for SiteDefaults {
    fn default() -> Self {
        Self {
            timezone: default_timezone(),
            packages: Vec::new(),
            ssh_options: Vec::new(),
            datastore: default_datastore(),
            spec_server: None,
        }
    }
}

/// Authentication posture for spec fetching.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthMode {
    /// Trust the network boundary; no token required.
    #[default]
    Network,
    /// One shared token for the whole site.
    SiteToken,
    /// Per-identity provisioning token.
    NodeToken,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Posture {
    #[serde(default)]
    pub auth_mode: AuthMode,
}

/// Size template expanded into node variables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Preset {
    pub cores: u32,
    pub memory_mb: u64,
    pub disk_gb: u64,
}

/// Handle on the site configuration directory: hosts, presets,
/// defaults, posture, and secrets.
#[derive(Debug, Clone)]
pub struct SiteConfig {
    dir: PathBuf,
}

impl SiteConfig {
    /// Discover the site directory: `HOMESTAK_SITE_DIR`, then the
    /// installed path, then the per-user path.
    pub fn discover() -> Self {
        if let Some(dir) = std::env::var_os("HOMESTAK_SITE_DIR") {
            return Self { dir: PathBuf::from(dir) };
        }
        let installed = PathBuf::from("/usr/local/etc/homestak");
        if installed.is_dir() {
            return Self { dir: installed };
        }
        let home = std::env::var_os("HOME").map(PathBuf::from).unwrap_or_default();
        Self {
            dir: home.join(".homestak").join("site"),
        }
    }

    pub fn at(dir: &Path) -> Self {
        Self { dir: dir.to_path_buf() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Load a host record, falling back to a local definition when no
    /// host file exists and the name refers to the local machine.
    pub fn host(&self, name: &str) -> Result<HostConfig> {
        let path = self.dir.join("hosts").join(format!("{}.yaml", name));
        if !path.exists() {
            if name == "localhost" {
                return Ok(HostConfig::local(name));
            }
            anyhow::bail!("Host '{}' not found at {}", name, path.display());
        }
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read host config: {}", path.display()))?;
        let mut host: HostConfig = serde_yaml::from_str(&text)
            .with_context(|| format!("Invalid host config: {}", path.display()))?;
        if host.name.is_empty() {
            host.name = name.to_string();
        }
        Ok(host)
    }

    pub fn defaults(&self) -> Result<SiteDefaults> {
        self.load_optional("defaults.yaml")
    }

    pub fn posture(&self) -> Result<Posture> {
        self.load_optional("posture.yaml")
    }

    pub fn preset(&self, name: &str) -> Result<Preset> {
        let path = self.dir.join("presets").join(format!("{}.yaml", name));
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("Preset '{}' not found at {}", name, path.display()))?;
        serde_yaml::from_str(&text)
            .with_context(|| format!("Invalid preset: {}", path.display()))
    }

    pub fn secrets(&self) -> Result<Secrets> {
        Secrets::load(&self.dir)
    }

    pub fn specs_dir(&self) -> PathBuf {
        self.dir.join("specs")
    }

    fn load_optional<T: Default + for<'de> Deserialize<'de>>(&self, file: &str) -> Result<T> {
        let path = self.dir.join(file);
        if !path.exists() {
            return Ok(T::default());
        }
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("Invalid {}", path.display()))
    }
}
