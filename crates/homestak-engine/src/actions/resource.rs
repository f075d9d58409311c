use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use homestak_core::cancel::CancelToken;
use homestak_core::config::HostConfig;
use homestak_core::context::{address_key, Context};
use homestak_core::error::ErrorKind;

use crate::action::{Action, ActionDescriptor, ActionResult};
use crate::shell;

const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(10);

/// Hypervisor address for a node: the parent's published address for
/// delegated children, the target host for roots.
fn hypervisor_address<'a>(
    hypervisor_key: &Option<String>,
    host: &'a HostConfig,
    ctx: &'a Context,
) -> Result<&'a str, String> {
    match hypervisor_key {
        Some(key) => ctx
            .get(key)
            .ok_or_else(|| format!("No {} in context", key)),
        None => Ok(host.address.as_str()),
    }
}

/// Start a provisioned resource and block until the hypervisor
/// reports it running. Already-running resources short-circuit.
pub struct StartResourceAction {
    pub node: String,
    pub hypervisor_key: Option<String>,
}

impl Action for StartResourceAction {
    fn descriptor(&self) -> ActionDescriptor {
        let mut descriptor = ActionDescriptor::new(format!("start-{}", self.node))
            .requires(homestak_core::context::id_key(&self.node));
        if let Some(key) = &self.hypervisor_key {
            descriptor = descriptor.requires(key.clone());
        }
        descriptor
    }

    fn execute(&self, host: &HostConfig, ctx: &Context) -> ActionResult {
        let hv = match hypervisor_address(&self.hypervisor_key, host, ctx) {
            Ok(hv) => hv,
            Err(msg) => return ActionResult::fail(ErrorKind::Internal, msg),
        };
        let Some(id) = ctx.node_id(&self.node) else {
            return ActionResult::fail(
                ErrorKind::Internal,
                format!("No id for node '{}' in context", self.node),
            );
        };

        match shell::run_ssh(
            hv,
            &host.admin_user,
            &format!("qm status {}", id),
            ATTEMPT_TIMEOUT,
        ) {
            Ok((0, stdout, _)) if stdout.contains("running") => {
                return ActionResult::ok(format!("Resource {} already running", id));
            }
            Ok((rc, _, stderr)) if stderr.contains("does not exist") => {
                return ActionResult::fail(
                    ErrorKind::NotFound,
                    format!("Resource {} absent on {} (exit {})", id, hv, rc),
                );
            }
            _ => {}
        }

        match shell::run_ssh(
            hv,
            &host.admin_user,
            &format!("qm start {}", id),
            Duration::from_secs(60),
        ) {
            Ok((0, _, _)) => ActionResult::ok(format!("Resource {} started on {}", id, hv)),
            Ok((rc, _, stderr)) => {
                let kind = if stderr.contains("does not exist") {
                    ErrorKind::NotFound
                } else {
                    ErrorKind::Internal
                };
                ActionResult::fail(
                    kind,
                    format!("qm start {} failed (exit {}): {}", id, rc, stderr.trim()),
                )
            }
            Err(e) => ActionResult::fail(ErrorKind::Internal, e.to_string()),
        }
    }
}

/// Poll the guest agent until the resource publishes a reachable
/// address, then yield it as `{name}_address`.
pub struct AwaitAddressAction {
    pub node: String,
    pub hypervisor_key: Option<String>,
    pub timeout: Duration,
    pub interval: Duration,
    pub cancel: CancelToken,
}

impl Action for AwaitAddressAction {
    fn descriptor(&self) -> ActionDescriptor {
        ActionDescriptor::new(format!("await-address-{}", self.node))
            .requires(homestak_core::context::id_key(&self.node))
            .yields(address_key(&self.node))
    }

    fn execute(&self, host: &HostConfig, ctx: &Context) -> ActionResult {
        let hv = match hypervisor_address(&self.hypervisor_key, host, ctx) {
            Ok(hv) => hv,
            Err(msg) => return ActionResult::fail(ErrorKind::Internal, msg),
        };
        let Some(id) = ctx.node_id(&self.node) else {
            return ActionResult::fail(
                ErrorKind::Internal,
                format!("No id for node '{}' in context", self.node),
            );
        };

        let probe = format!("qm guest cmd {} network-get-interfaces", id);
        let deadline = Instant::now() + self.timeout;

        while Instant::now() < deadline {
            if let Ok((0, stdout, _)) =
                shell::run_ssh(hv, &host.admin_user, &probe, ATTEMPT_TIMEOUT)
            {
                if let Some(address) = extract_ipv4(&stdout) {
                    let mut additions = BTreeMap::new();
                    additions.insert(address_key(&self.node), address.clone());
                    return ActionResult::ok_with(
                        format!("Resource {} published {}", id, address),
                        additions,
                    );
                }
            }
            if !self.cancel.sleep(self.interval) {
                return ActionResult::fail(ErrorKind::Cancelled, "cancelled while waiting");
            }
        }

        ActionResult::fail(
            ErrorKind::NotReady,
            format!("Timeout waiting for resource {} to publish an address", id),
        )
    }
}

/// First non-loopback IPv4 address in guest-agent interface output.
fn extract_ipv4(agent_json: &str) -> Option<String> {
    let interfaces: serde_json::Value = serde_json::from_str(agent_json.trim()).ok()?;
    for interface in interfaces.as_array()? {
        for addr in interface.get("ip-addresses")?.as_array()? {
            if addr.get("ip-address-type")?.as_str()? != "ipv4" {
                continue;
            }
            let ip = addr.get("ip-address")?.as_str()?;
            if !ip.starts_with("127.") {
                return Some(ip.to_string());
            }
        }
    }
    None
}
