use std::collections::BTreeMap;
use std::path::PathBuf;

use homestak_core::config::HostConfig;
use homestak_core::context::{address_key, id_key, Context};
use homestak_core::error::ErrorKind;

use crate::action::{Action, ActionDescriptor, ActionResult};
use crate::shell;

fn classify_provisioner_failure(stderr: &str) -> ErrorKind {
    let lower = stderr.to_ascii_lowercase();
    if lower.contains("already exists") || lower.contains("duplicate") {
        ErrorKind::Conflict
    } else if lower.contains("unauthorized")
        || lower.contains("authentication")
        || lower.contains("401")
    {
        ErrorKind::Unauthorized
    } else if lower.contains("timeout") || lower.contains("timed out") {
        ErrorKind::NotReady
    } else if lower.contains("not found") || lower.contains("no such") {
        ErrorKind::NotFound
    } else {
        ErrorKind::Internal
    }
}

/// Declare a node's resources to the provisioner.
///
/// The variable bundle is written as a tfvars file and the state path
/// is isolated per (manifest, host) run directory, so concurrent runs
/// never share provisioner state. The provisioner converges, which is
/// what makes re-invocation safe.
pub struct ProvisionAction {
    pub node: String,
    pub vars: BTreeMap<String, serde_json::Value>,
    pub module_dir: PathBuf,
    pub state_dir: PathBuf,
}

impl ProvisionAction {
    fn tfvars_path(&self) -> PathBuf {
        self.state_dir.join(format!("{}.tfvars.json", self.node))
    }

    fn state_path(&self) -> PathBuf {
        self.state_dir.join(format!("{}.tfstate", self.node))
    }
}

impl Action for ProvisionAction {
    fn descriptor(&self) -> ActionDescriptor {
        ActionDescriptor::new(format!("provision-{}", self.node))
            .yields(id_key(&self.node))
            .yields(address_key(&self.node))
    }

    fn execute(&self, _host: &HostConfig, _ctx: &Context) -> ActionResult {
        let tfvars = self.tfvars_path();
        let body = match serde_json::to_vec_pretty(&self.vars) {
            Ok(body) => body,
            Err(e) => return ActionResult::fail(ErrorKind::Internal, e.to_string()),
        };
        if let Err(e) = std::fs::write(&tfvars, body) {
            return ActionResult::fail(
                ErrorKind::Internal,
                format!("Failed to write {}: {}", tfvars.display(), e),
            );
        }

        let chdir = format!("-chdir={}", self.module_dir.display());
        let state = self.state_path();
        let state_arg = state.to_string_lossy().into_owned();
        let tfvars_arg = format!("-var-file={}", tfvars.display());

        let output = match shell::run_host(
            "tofu",
            &[
                &chdir,
                "apply",
                "-auto-approve",
                "-input=false",
                "-no-color",
                &format!("-state={}", state_arg),
                &tfvars_arg,
            ],
        ) {
            Ok(output) => output,
            Err(e) => return ActionResult::fail(ErrorKind::Internal, e.to_string()),
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return ActionResult::fail(
                classify_provisioner_failure(&stderr),
                format!(
                    "Provisioner apply failed for '{}': {}",
                    self.node,
                    tail(&stderr, 400)
                ),
            );
        }

        // Read declared outputs back for the context.
        let output = match shell::run_host(
            "tofu",
            &[
                &chdir,
                "output",
                "-json",
                &format!("-state={}", state_arg),
            ],
        ) {
            Ok(output) => output,
            Err(e) => return ActionResult::fail(ErrorKind::Internal, e.to_string()),
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut additions = parse_outputs(&stdout, &self.node);

        // An explicit vmid declared in the bundle counts as assigned
        // even when the module exposes no outputs.
        if !additions.contains_key(&id_key(&self.node)) {
            if let Some(vmid) = self.vars.get("vmid").and_then(|v| v.as_u64()) {
                additions.insert(id_key(&self.node), vmid.to_string());
            }
        }

        if additions.contains_key(&id_key(&self.node)) {
            ActionResult::ok_with(format!("Provisioned '{}'", self.node), additions)
        } else {
            ActionResult::fail(
                ErrorKind::Internal,
                format!("Provisioner yielded no identifier for '{}'", self.node),
            )
        }
    }
}

/// Remove a node's resources. Best-effort: an absent target counts as
/// success.
pub struct DestroyResourceAction {
    pub node: String,
    pub vars: BTreeMap<String, serde_json::Value>,
    pub module_dir: PathBuf,
    pub state_dir: PathBuf,
}

impl Action for DestroyResourceAction {
    fn descriptor(&self) -> ActionDescriptor {
        ActionDescriptor::new(format!("destroy-{}", self.node))
    }

    fn execute(&self, _host: &HostConfig, _ctx: &Context) -> ActionResult {
        let state = self.state_dir.join(format!("{}.tfstate", self.node));
        if !state.exists() {
            return ActionResult::ok(format!("No provisioner state for '{}'; nothing to destroy", self.node));
        }

        let tfvars = self.state_dir.join(format!("{}.tfvars.json", self.node));
        if !tfvars.exists() {
            if let Ok(body) = serde_json::to_vec_pretty(&self.vars) {
                let _ = std::fs::write(&tfvars, body);
            }
        }

        let chdir = format!("-chdir={}", self.module_dir.display());
        let output = match shell::run_host(
            "tofu",
            &[
                &chdir,
                "destroy",
                "-auto-approve",
                "-input=false",
                "-no-color",
                &format!("-state={}", state.display()),
                &format!("-var-file={}", tfvars.display()),
            ],
        ) {
            Ok(output) => output,
            Err(e) => return ActionResult::fail(ErrorKind::Internal, e.to_string()),
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            // Resources that vanished underneath us still count.
            if stderr.to_ascii_lowercase().contains("does not exist") {
                return ActionResult::ok(format!("'{}' already absent", self.node));
            }
            return ActionResult::fail(
                classify_provisioner_failure(&stderr),
                format!(
                    "Provisioner destroy failed for '{}': {}",
                    self.node,
                    tail(&stderr, 400)
                ),
            );
        }

        ActionResult::ok(format!("Destroyed '{}'", self.node))
    }
}

/// Map `tofu output -json` onto context keys. Recognizes `vm_id` /
/// `vmid` and `ip` / `address` outputs.
fn parse_outputs(json: &str, node: &str) -> BTreeMap<String, String> {
    let mut additions = BTreeMap::new();
    let Ok(value) = serde_json::from_str::<serde_json::Value>(json.trim()) else {
        return additions;
    };
    let Some(outputs) = value.as_object() else {
        return additions;
    };

    for (key, entry) in outputs {
        let Some(inner) = entry.get("value") else {
            continue;
        };
        match key.as_str() {
            "vm_id" | "vmid" => {
                let id = inner
                    .as_u64()
                    .map(|v| v.to_string())
                    .or_else(|| inner.as_str().map(String::from));
                if let Some(id) = id {
                    additions.insert(id_key(node), id);
                }
            }
            "ip" | "address" => {
                if let Some(address) = inner.as_str() {
                    if !address.is_empty() {
                        additions.insert(address_key(node), address.to_string());
                    }
                }
            }
            _ => {}
        }
    }
    additions
}

fn tail(text: &str, max: usize) -> String {
    let trimmed = text.trim();
    if trimmed.len() <= max {
        return trimmed.to_string();
    }
    format!("…{}", &trimmed[trimmed.len() - max..])
}
