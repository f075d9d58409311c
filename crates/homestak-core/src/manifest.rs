use std::collections::BTreeSet;
use std::path::Path;

use anyhow::{bail, Context as _, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Manifests are normalized to this schema version internally.
pub const CURRENT_SCHEMA_VERSION: u32 = 2;

/// Node type: a hypervisor that may host children, or a leaf guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Pve,
    Vm,
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeKind::Pve => f.write_str("pve"),
            NodeKind::Vm => f.write_str("vm"),
        }
    }
}

/// How a node gets configured after it boots.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecMode {
    /// The engine drives configuration over an interactive channel.
    #[default]
    Push,
    /// The node self-configures on first boot and writes a marker file.
    Pull,
}

/// Per-node execution settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Execution {
    #[serde(default)]
    pub mode: ExecMode,
    /// Spec identity fetched from the spec server, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec: Option<String>,
}

impl Execution {
    fn is_default(&self) -> bool {
        self.mode == ExecMode::Push && self.spec.is_none()
    }
}

/// Error handling strategy when a node fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnError {
    #[default]
    Stop,
    Rollback,
    Continue,
}

/// Manifest-wide execution settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub on_error: OnError,
    #[serde(default = "default_timeout_buffer")]
    pub timeout_buffer_seconds: u64,
    #[serde(default)]
    pub keep_on_failure: bool,
    #[serde(default = "default_true")]
    pub cleanup_on_failure: bool,
}

fn default_timeout_buffer() -> u64 {
    60
}

fn default_true() -> bool {
    true
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            on_error: OnError::Stop,
            timeout_buffer_seconds: default_timeout_buffer(),
            keep_on_failure: false,
            cleanup_on_failure: true,
        }
    }
}

/// A single node in the deployment tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: NodeKind,
    /// Name of the parent node; absent means root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    /// Size template name, expanded from the site preset catalog.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preset: Option<String>,
    /// Boot artifact name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// Explicit identifier; otherwise assigned by the hypervisor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vmid: Option<u64>,
    /// Disk size override in GiB.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk: Option<u64>,
    #[serde(default, skip_serializing_if = "Execution::is_default")]
    pub execution: Execution,
}

impl Node {
    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    pub fn mode(&self) -> ExecMode {
        self.execution.mode
    }

    pub fn spec(&self) -> Option<&str> {
        self.execution.spec.as_deref()
    }
}

/// Declarative description of a node tree to realize.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub schema_version: u32,
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default)]
    pub settings: Settings,
    pub nodes: Vec<Node>,
}

impl Manifest {
    /// Parse a manifest from a YAML document, accepting schema v1 and
    /// v2, normalizing to v2, and validating the graph invariants.
    pub fn from_yaml(text: &str) -> Result<Self> {
        let value: serde_yaml::Value =
            serde_yaml::from_str(text).context("Invalid YAML in manifest")?;
        let json = serde_json::to_value(value).context("Manifest is not a mapping")?;
        Self::from_value(json)
    }

    /// Parse a manifest from an inline JSON string (delegation path).
    pub fn from_json(text: &str) -> Result<Self> {
        let json: serde_json::Value =
            serde_json::from_str(text).context("Invalid manifest JSON")?;
        Self::from_value(json)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Manifest file not found: {}", path.display()))?;
        Self::from_yaml(&text)
    }

    fn from_value(value: serde_json::Value) -> Result<Self> {
        let version = value
            .get("schema_version")
            .and_then(|v| v.as_u64())
            .unwrap_or(1);

        let manifest = match version {
            1 => convert_v1(value)?,
            2 => serde_json::from_value(value).context("Invalid v2 manifest")?,
            other => bail!(
                "Unsupported manifest schema version: {} (supported: 1, 2)",
                other
            ),
        };

        manifest.validate()?;
        Ok(manifest)
    }

    /// Validate the graph invariants. Called on every load path.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            bail!("Manifest missing required field: name");
        }
        if self.nodes.is_empty() {
            bail!("Manifest must have at least one node");
        }

        let mut seen = BTreeSet::new();
        for node in &self.nodes {
            if !seen.insert(node.name.as_str()) {
                bail!("Duplicate node name: '{}'", node.name);
            }
        }

        for node in &self.nodes {
            if let Some(parent) = &node.parent {
                let parent_node = self
                    .node(parent)
                    .with_context(|| {
                        format!("Node '{}' references unknown parent '{}'", node.name, parent)
                    })?;
                if parent_node.kind == NodeKind::Vm {
                    bail!(
                        "Node '{}' has vm-type parent '{}'; vm nodes cannot host children",
                        node.name,
                        parent
                    );
                }
            }
            if node.kind == NodeKind::Pve && node.mode() != ExecMode::Push {
                bail!(
                    "Node '{}' is a pve node and must use push execution mode",
                    node.name
                );
            }
        }

        // Cycle check: follow each parent chain; more hops than nodes
        // means the chain loops.
        for node in &self.nodes {
            let mut current = node.parent.as_deref();
            let mut hops = 0;
            while let Some(name) = current {
                hops += 1;
                if hops > self.nodes.len() {
                    bail!("Cycle detected in node graph involving '{}'", node.name);
                }
                current = self.node(name).and_then(|n| n.parent.as_deref());
            }
        }

        Ok(())
    }

    pub fn node(&self, name: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.name == name)
    }

    /// Canonical JSON serialization. A given manifest always produces
    /// the same byte sequence regardless of the source document's key
    /// order, so equality and fingerprints are stable.
    pub fn to_canonical_json(&self) -> String {
        serde_json::to_string(self).expect("manifest serialization cannot fail")
    }

    /// Short stable hash over the canonical serialization, used to
    /// detect manifest drift between runs.
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.to_canonical_json().as_bytes());
        let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
        hex[..16].to_string()
    }
}

/// v1 manifests are a linear chain of levels. Convert to a v2 parent
/// chain: each level is parented to the previous one, every level but
/// the last hosts the next (pve), and the last is a leaf guest.
fn convert_v1(value: serde_json::Value) -> Result<Manifest> {
    #[derive(Deserialize)]
    struct V1Level {
        name: String,
        #[serde(alias = "vm_preset")]
        preset: Option<String>,
        image: Option<String>,
        vmid: Option<u64>,
    }

    #[derive(Deserialize)]
    struct V1Manifest {
        name: String,
        #[serde(default)]
        description: String,
        levels: Vec<V1Level>,
        #[serde(default)]
        settings: Settings,
    }

    let v1: V1Manifest = serde_json::from_value(value).context("Invalid v1 manifest")?;
    if v1.levels.is_empty() {
        bail!("Manifest must have at least one level");
    }

    let last = v1.levels.len() - 1;
    let mut nodes = Vec::with_capacity(v1.levels.len());
    let mut previous: Option<String> = None;
    for (i, level) in v1.levels.into_iter().enumerate() {
        nodes.push(Node {
            name: level.name.clone(),
            kind: if i == last { NodeKind::Vm } else { NodeKind::Pve },
            parent: previous.take(),
            preset: level.preset,
            image: level.image,
            vmid: level.vmid,
            disk: None,
            execution: Execution::default(),
        });
        previous = Some(level.name);
    }

    Ok(Manifest {
        schema_version: CURRENT_SCHEMA_VERSION,
        name: v1.name,
        description: v1.description,
        settings: v1.settings,
        nodes,
    })
}
