use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;

use homestak_core::config::HostConfig;
use homestak_core::context::Context;
use homestak_core::error::ErrorKind;

use crate::action::{Action, ActionDescriptor, ActionResult};
use crate::shell;

/// Apply a declarative configuration to a node via the configuration
/// runner, feeding it the resolved variable bundle.
///
/// The runner converges the node toward the spec, so repeat runs with
/// the same bundle are no-ops.
pub struct RunConfigurationAction {
    pub node: String,
    pub address_key: String,
    pub user: String,
    pub vars: BTreeMap<String, serde_json::Value>,
    pub playbook_dir: PathBuf,
}

impl Action for RunConfigurationAction {
    fn descriptor(&self) -> ActionDescriptor {
        ActionDescriptor::new(format!("configure-{}", self.node)).requires(self.address_key.clone())
    }

    fn execute(&self, _host: &HostConfig, ctx: &Context) -> ActionResult {
        let Some(address) = ctx.get(&self.address_key) else {
            return ActionResult::fail(
                ErrorKind::Internal,
                format!("No {} in context", self.address_key),
            );
        };

        let playbook = self.playbook_dir.join("site.yml");
        if !playbook.exists() {
            return ActionResult::fail(
                ErrorKind::NotFound,
                format!("Playbook not found: {}", playbook.display()),
            );
        }

        // The runner reads extra-vars from a file to keep secrets off
        // the process list.
        let mut vars_file = match tempfile::NamedTempFile::new() {
            Ok(file) => file,
            Err(e) => return ActionResult::fail(ErrorKind::Internal, e.to_string()),
        };
        let body = match serde_json::to_vec(&self.vars) {
            Ok(body) => body,
            Err(e) => return ActionResult::fail(ErrorKind::Internal, e.to_string()),
        };
        if let Err(e) = vars_file.write_all(&body) {
            return ActionResult::fail(ErrorKind::Internal, e.to_string());
        }

        let inventory = format!("{},", address);
        let extra_vars = format!("@{}", vars_file.path().display());
        let playbook_arg = playbook.to_string_lossy().into_owned();

        let output = match shell::run_host(
            "ansible-playbook",
            &[
                "-i",
                &inventory,
                "-u",
                &self.user,
                "--extra-vars",
                &extra_vars,
                &playbook_arg,
            ],
        ) {
            Ok(output) => output,
            Err(e) => return ActionResult::fail(ErrorKind::Internal, e.to_string()),
        };

        if output.status.success() {
            return ActionResult::ok(format!("Configuration applied to '{}'", self.node));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let combined = format!("{}\n{}", stdout, stderr);
        let kind = classify_runner_failure(&combined);
        ActionResult::fail(
            kind,
            format!(
                "Configuration failed for '{}': {}",
                self.node,
                last_line(&combined)
            ),
        )
    }
}

fn classify_runner_failure(output: &str) -> ErrorKind {
    let lower = output.to_ascii_lowercase();
    if lower.contains("unreachable") {
        ErrorKind::NotReady
    } else if lower.contains("permission denied") || lower.contains("authentication") {
        ErrorKind::Unauthorized
    } else {
        ErrorKind::Internal
    }
}

fn last_line(text: &str) -> String {
    text.lines()
        .rev()
        .find(|line| !line.trim().is_empty())
        .unwrap_or("no output")
        .trim()
        .to_string()
}
