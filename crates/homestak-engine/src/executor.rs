use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context as _, Result};
use tracing::{info, warn};

use homestak_core::cancel::CancelToken;
use homestak_core::config::{HostConfig, Posture, SiteConfig, SiteDefaults};
use homestak_core::context::{
    address_key, id_key, Context, KEY_PARENT_ADDRESS, KEY_REPO_REF, KEY_REPO_SERVER,
    KEY_REPO_TOKEN, KEY_SPEC_SERVER,
};
use homestak_core::error::ErrorKind;
use homestak_core::graph::ManifestGraph;
use homestak_core::manifest::{ExecMode, Manifest, Node, NodeKind, OnError};
use homestak_core::state::{ExecutionState, NodeStatus, RunLock, StateStore};
use homestak_core::token::TokenService;
use homestak_core::vars::{resolve_bundle, VarSources};

use crate::action::{run_with_probe_retry, Action, ActionResult, ActionRunner};
use crate::actions::configure::RunConfigurationAction;
use crate::actions::credential::IssueCredentialAction;
use crate::actions::delegate::DelegateSubtreeAction;
use crate::actions::image::EnsureImageAction;
use crate::actions::provision::{DestroyResourceAction, ProvisionAction};
use crate::actions::resource::{AwaitAddressAction, StartResourceAction};
use crate::actions::ssh::{AwaitFileAction, AwaitReachableAction, CopyFileAction, RunCommandAction};
use crate::report::{PhaseReport, PhaseStatus, RunReport};
use crate::server_handle::ServerHandle;
use crate::shell::shell_quote;

pub const DEFAULT_SERVER_PORT: u16 = 44443;

/// Marker a pull-mode first-boot agent writes when configuration is
/// done.
pub const CONFIG_COMPLETE_MARKER: &str = "/var/lib/homestak/config-complete.json";

/// Default ceiling on minted provisioning-token validity.
const DEFAULT_TOKEN_VALIDITY_SECS: i64 = 30 * 60;

const ADDRESS_TIMEOUT: Duration = Duration::from_secs(300);
const REACHABLE_TIMEOUT: Duration = Duration::from_secs(120);
const PULL_TIMEOUT: Duration = Duration::from_secs(300);
const VERIFY_TIMEOUT: Duration = Duration::from_secs(30);
const POLL_INTERVAL: Duration = Duration::from_secs(3);
const DELEGATE_APPLY_TIMEOUT: Duration = Duration::from_secs(1200);
const DELEGATE_DESTROY_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Apply,
    Destroy,
    Test,
}

impl Verb {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verb::Apply => "apply",
            Verb::Destroy => "destroy",
            Verb::Test => "test",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecutorOptions {
    pub dry_run: bool,
    pub structured_output: bool,
    pub self_addr: Option<String>,
    pub token_validity_secs: i64,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            structured_output: false,
            self_addr: None,
            token_validity_secs: DEFAULT_TOKEN_VALIDITY_SECS,
        }
    }
}

/// A failed phase: which node, which phase, and why.
struct PhaseFailure {
    node: String,
    phase: String,
    kind: ErrorKind,
    message: String,
}

/// Owned traversal plan for one node, precomputed so the walk does
/// not hold borrows into the manifest.
struct NodePlan {
    node: Node,
    depth: usize,
    descendants: Vec<Node>,
    subtree: Option<Manifest>,
}

impl NodePlan {
    fn delegates(&self) -> bool {
        self.node.kind == NodeKind::Pve && !self.descendants.is_empty()
    }
}

/// Walks the manifest graph and drives each node through its
/// lifecycle: create, configure, optionally test, destroy. One node
/// is in flight at a time; cross-run concurrency is mediated by the
/// execution-state lock and the server handle.
pub struct NodeExecutor {
    manifest: Manifest,
    site: SiteConfig,
    host: HostConfig,
    store: StateStore,
    _lock: RunLock,
    state: ExecutionState,
    ctx: Context,
    cancel: CancelToken,
    runner: Box<dyn ActionRunner>,
    server: ServerHandle,
    server_active: bool,
    repo_token: Option<String>,
    defaults: SiteDefaults,
    posture: Posture,
    phases: Vec<PhaseReport>,
    opts: ExecutorOptions,
}

impl NodeExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        manifest: Manifest,
        site: SiteConfig,
        host: HostConfig,
        store: StateStore,
        opts: ExecutorOptions,
        runner: Box<dyn ActionRunner>,
        server: ServerHandle,
        cancel: CancelToken,
    ) -> Result<Self> {
        let lock = store
            .lock(false)
            .context("Another run is active for this manifest and host")?;
        let fingerprint = manifest.fingerprint();
        let state = store.load_or_init(&manifest.name, &host.name, &fingerprint)?;
        let defaults = site.defaults()?;
        let posture = site.posture()?;
        let repo_token = site.secrets()?.repo_token.clone();

        // In a delegated run the parent's routable address arrives as
        // --self-addr; nodes mirror it for their own descendants.
        let mut ctx = Context::new();
        if let Some(addr) = &opts.self_addr {
            ctx.set(KEY_PARENT_ADDRESS, addr.clone());
        }

        Ok(Self {
            manifest,
            site,
            host,
            store,
            _lock: lock,
            state,
            ctx,
            cancel,
            runner,
            server,
            server_active: false,
            repo_token,
            defaults,
            posture,
            phases: Vec::new(),
            opts,
        })
    }

    // ------------------------------------------------------------------
    // Verbs
    // ------------------------------------------------------------------

    pub fn apply(&mut self) -> RunReport {
        let started = Instant::now();
        let plans = match self.plan() {
            Ok(plans) => plans,
            Err(e) => return self.aborted_report(Verb::Apply, started, &e.to_string()),
        };
        for plan in &plans {
            self.state.register(&plan.node.name);
        }
        self.state.start();
        let _ = self.store.save(&self.state);

        if self.opts.dry_run {
            self.preview(Verb::Apply, &plans);
            return self.finish_report(Verb::Apply, started, true, None);
        }

        let wants_server = plans
            .iter()
            .any(|p| p.depth == 0 && (p.node.spec().is_some() || p.delegates()));
        if wants_server {
            if let Err(e) = self.ensure_server() {
                return self.finish_report(Verb::Apply, started, false, Some(e.to_string()));
            }
        }

        let (success, failure) = self.apply_roots(&plans);

        if wants_server {
            let _ = self.server.release();
        }
        self.state.finish();
        let _ = self.store.save(&self.state);

        self.finish_report(
            Verb::Apply,
            started,
            success,
            failure.map(|f| f.to_error_string()),
        )
    }

    pub fn destroy(&mut self) -> RunReport {
        let started = Instant::now();
        let plans = match self.plan() {
            Ok(plans) => plans,
            Err(e) => return self.aborted_report(Verb::Destroy, started, &e.to_string()),
        };

        // Destroy works from persisted identifiers and addresses.
        let persisted = self.state.to_context();
        self.ctx.merge(persisted.as_map());
        self.state.start();

        if self.opts.dry_run {
            self.preview(Verb::Destroy, &plans);
            return self.finish_report(Verb::Destroy, started, true, None);
        }

        let wants_server = plans.iter().any(|p| p.depth == 0 && p.delegates());
        if wants_server {
            if let Err(e) = self.ensure_server() {
                return self.finish_report(Verb::Destroy, started, false, Some(e.to_string()));
            }
        }

        let mut success = true;
        let mut first_failure: Option<PhaseFailure> = None;

        // Reverse create order; only roots are handled locally.
        for plan in plans.iter().rev() {
            if plan.depth > 0 {
                continue;
            }
            if let Err(failure) = self.destroy_root(plan) {
                success = false;
                self.report_failure(Verb::Destroy, &failure);
                first_failure.get_or_insert(failure);
            }
        }

        if wants_server {
            let _ = self.server.release();
        }
        self.state.finish();
        let _ = self.store.save(&self.state);

        self.finish_report(
            Verb::Destroy,
            started,
            success,
            first_failure.map(|f| f.to_error_string()),
        )
    }

    /// Create, verify reachability, destroy. The server reference is
    /// held across all three so the inner verbs reuse it.
    pub fn test(&mut self) -> RunReport {
        let started = Instant::now();

        if self.opts.dry_run {
            let plans = match self.plan() {
                Ok(plans) => plans,
                Err(e) => return self.aborted_report(Verb::Test, started, &e.to_string()),
            };
            self.preview(Verb::Test, &plans);
            return self.finish_report(Verb::Test, started, true, None);
        }

        if let Err(e) = self.ensure_server() {
            return self.finish_report(Verb::Test, started, false, Some(e.to_string()));
        }

        let apply_report = self.apply();
        let mut success = apply_report.success;
        let mut error = apply_report.error.clone();

        if success {
            if !self.verify_nodes() {
                success = false;
                error.get_or_insert_with(|| "verification failed".to_string());
            }
            let destroy_report = self.destroy();
            if !destroy_report.success {
                success = false;
                error.get_or_insert_with(|| {
                    destroy_report
                        .error
                        .unwrap_or_else(|| "destroy failed".to_string())
                });
            }
        } else if self.manifest.settings.cleanup_on_failure && !self.manifest.settings.keep_on_failure {
            info!("Create failed, cleaning up");
            let _ = self.destroy();
        }

        let _ = self.server.release();
        self.finish_report(Verb::Test, started, success, error)
    }

    // ------------------------------------------------------------------
    // Apply internals
    // ------------------------------------------------------------------

    /// Walk root plans in create order, applying the manifest's error
    /// policy between them. Returns overall success and the first
    /// failure for reporting.
    fn apply_roots(&mut self, plans: &[NodePlan]) -> (bool, Option<PhaseFailure>) {
        let on_error = self.manifest.settings.on_error;
        let mut created: Vec<String> = Vec::new();
        let mut success = true;
        let mut first_failure: Option<PhaseFailure> = None;

        for plan in plans {
            if plan.depth > 0 {
                continue;
            }
            if self
                .state
                .node(&plan.node.name)
                .is_some_and(|r| r.status == NodeStatus::Skipped)
            {
                continue;
            }

            let result = self.create_node(plan).and_then(|()| {
                created.push(plan.node.name.clone());
                if plan.delegates() {
                    self.delegate_subtree(plan)
                } else {
                    Ok(())
                }
            });

            if let Err(failure) = result {
                success = false;
                self.report_failure(Verb::Apply, &failure);
                self.skip_descendants(plan);
                first_failure.get_or_insert(failure);

                match on_error {
                    OnError::Stop => break,
                    OnError::Rollback => {
                        self.rollback(&created, plans);
                        break;
                    }
                    OnError::Continue => continue,
                }
            }
        }

        (success, first_failure)
    }

    /// Provision, start, and configure one root node.
    fn create_node(&mut self, plan: &NodePlan) -> std::result::Result<(), PhaseFailure> {
        let name = plan.node.name.clone();
        info!(node = %name, kind = %plan.node.kind, "Creating node");
        self.transition(&name, NodeStatus::Creating);

        // Boot artifact on the target hypervisor.
        if let (Some(image), Some(base)) = (plan.node.image.clone(), self.artifact_base()) {
            let action = EnsureImageAction {
                image,
                hypervisor_key: None,
                artifact_base: base,
                bearer: self.repo_token.clone(),
            };
            self.phase(&name, &format!("{}:ensure-image", name), &action, false)?;
        }

        // Spec-referencing nodes get an identity-bound token for the
        // first-boot agent, folded into the provisioner bundle.
        let token = if plan.node.spec().is_some() {
            Some(self.mint_token(&name)?)
        } else {
            None
        };

        let vars = self.node_vars(&plan.node, token.as_deref());

        let provision = ProvisionAction {
            node: name.clone(),
            vars: vars.clone(),
            module_dir: self.module_dir(),
            state_dir: self.provisioner_dir(&name)?,
        };
        self.phase(&name, &format!("{}:provision", name), &provision, false)?;

        let start = StartResourceAction {
            node: name.clone(),
            hypervisor_key: None,
        };
        self.phase(&name, &format!("{}:start", name), &start, false)?;

        let await_address = AwaitAddressAction {
            node: name.clone(),
            hypervisor_key: None,
            timeout: ADDRESS_TIMEOUT,
            interval: POLL_INTERVAL,
            cancel: self.cancel.clone(),
        };
        self.phase(&name, &format!("{}:await-address", name), &await_address, false)?;

        let assigned = self.ctx.node_id(&name);
        let address = self.ctx.node_address(&name).map(String::from);
        let parent_address = self.ctx.get(KEY_PARENT_ADDRESS).map(String::from);
        let record = self.state.node_mut(&name);
        record.transition(NodeStatus::Created);
        record.assigned_id = assigned;
        record.address = address;
        record.parent_address = parent_address;
        let _ = self.store.save(&self.state);

        // Configure.
        self.transition(&name, NodeStatus::Configuring);

        let reachable = AwaitReachableAction {
            address_key: address_key(&name),
            user: self.host.automation_user.clone(),
            timeout: REACHABLE_TIMEOUT,
            interval: POLL_INTERVAL,
            cancel: self.cancel.clone(),
        };
        self.phase(&name, &format!("{}:await-reachable", name), &reachable, false)?;

        match plan.node.kind {
            NodeKind::Pve => {
                if plan.delegates() {
                    self.hypervisor_lifecycle(plan)?;
                }
            }
            NodeKind::Vm => match plan.node.mode() {
                ExecMode::Push => {
                    if plan.node.spec().is_some() {
                        let configure = RunConfigurationAction {
                            node: name.clone(),
                            address_key: address_key(&name),
                            user: self.host.automation_user.clone(),
                            vars,
                            playbook_dir: self.playbook_dir(),
                        };
                        self.phase(&name, &format!("{}:configure", name), &configure, true)?;
                    }
                }
                ExecMode::Pull => {
                    // The boot image carries a first-boot agent that
                    // fetches its spec and drops the marker.
                    let await_marker = AwaitFileAction {
                        address_key: address_key(&name),
                        user: self.host.automation_user.clone(),
                        path: CONFIG_COMPLETE_MARKER.to_string(),
                        timeout: PULL_TIMEOUT,
                        interval: Duration::from_secs(5),
                        cancel: self.cancel.clone(),
                    };
                    self.phase(&name, &format!("{}:await-config", name), &await_marker, false)?;
                }
            },
        }

        self.transition(&name, NodeStatus::Configured);
        let _ = self.store.save(&self.state);
        info!(node = %name, "Node configured");
        Ok(())
    }

    /// Fixed post-configure sequence on a hypervisor that will host
    /// children: tooling, secrets, bridge, node config, credential,
    /// child images.
    fn hypervisor_lifecycle(&mut self, plan: &NodePlan) -> std::result::Result<(), PhaseFailure> {
        let name = plan.node.name.clone();
        let addr_key = address_key(&name);
        let admin = self.host.admin_user.clone();

        let repo_base = self.server.base_url();
        let auth = match &self.repo_token {
            Some(token) if !token.is_empty() => {
                format!(" -H {}", shell_quote(&format!("Authorization: Bearer {}", token)))
            }
            _ => String::new(),
        };
        let bootstrap = RunCommandAction {
            name: "bootstrap".to_string(),
            address_key: addr_key.clone(),
            user: admin.clone(),
            command: format!(
                "curl -fsSkL{auth} {base}/iac.git/scripts/install.sh | \
                 REPO_SERVER_URL={base} REPO_SERVER_REF=_working bash",
                auth = auth,
                base = repo_base,
            ),
            timeout: Duration::from_secs(600),
            output_key: None,
        };
        self.phase(&name, &format!("{}:bootstrap", name), &bootstrap, false)?;

        let secrets_path = self.site.dir().join("secrets.yaml");
        if secrets_path.exists() {
            let copy_secrets = CopyFileAction {
                name: "copy-secrets".to_string(),
                address_key: addr_key.clone(),
                user: admin.clone(),
                local_path: secrets_path,
                remote_path: "/usr/local/etc/homestak/secrets.yaml".to_string(),
                mode: "600".to_string(),
            };
            self.phase(&name, &format!("{}:copy-secrets", name), &copy_secrets, false)?;
        }

        // Child guests attach to vmbr0; create it only if absent.
        let bridge = RunCommandAction {
            name: "configure-bridge".to_string(),
            address_key: addr_key.clone(),
            user: admin.clone(),
            command: "grep -q 'iface vmbr0' /etc/network/interfaces || { \
                      printf 'auto vmbr0\\niface vmbr0 inet dhcp\\n\\tbridge-ports none\\n\\tbridge-stp off\\n\\tbridge-fd 0\\n' \
                      >> /etc/network/interfaces && ifup vmbr0; }"
                .to_string(),
            timeout: Duration::from_secs(60),
            output_key: None,
        };
        self.phase(&name, &format!("{}:configure-bridge", name), &bridge, false)?;

        // The delegated engine resolves its target host by this name.
        let host_yaml = format!(
            "name: {name}\naddress: 127.0.0.1\nautomation_user: {user}\n",
            name = name,
            user = self.host.automation_user,
        );
        let node_config = RunCommandAction {
            name: "node-config".to_string(),
            address_key: addr_key.clone(),
            user: admin.clone(),
            command: format!(
                "mkdir -p /usr/local/etc/homestak/hosts && printf '%s' {} > /usr/local/etc/homestak/hosts/{}.yaml",
                shell_quote(&host_yaml),
                name,
            ),
            timeout: Duration::from_secs(30),
            output_key: None,
        };
        self.phase(&name, &format!("{}:node-config", name), &node_config, false)?;

        let credential = IssueCredentialAction {
            node: name.clone(),
            address_key: addr_key.clone(),
            realm_user: "automation@pve".to_string(),
            role: "PVEAdmin".to_string(),
            token_id: "homestak".to_string(),
            yield_key: format!("{}_credential", name),
        };
        self.phase(&name, &format!("{}:issue-credential", name), &credential, true)?;

        // Every image a child will boot from, fetched once.
        if let Some(base) = self.artifact_base() {
            let images: BTreeSet<String> = plan
                .descendants
                .iter()
                .filter_map(|child| child.image.clone())
                .collect();
            for image in images {
                let ensure = EnsureImageAction {
                    image: image.clone(),
                    hypervisor_key: Some(addr_key.clone()),
                    artifact_base: base.clone(),
                    bearer: self.repo_token.clone(),
                };
                self.phase(&name, &format!("{}:image-{}", name, image), &ensure, false)?;
            }
        }

        Ok(())
    }

    /// Hand the subtree to the freshly built hypervisor and import
    /// the children's identifiers and addresses from its trailer.
    fn delegate_subtree(&mut self, plan: &NodePlan) -> std::result::Result<(), PhaseFailure> {
        let name = plan.node.name.clone();
        self.transition(&name, NodeStatus::Delegating);

        let subtree = plan.subtree.as_ref().expect("delegating plan has a subtree");
        let timeout = self.delegation_timeout(DELEGATE_APPLY_TIMEOUT);
        let action = self.delegation_action(plan, subtree, Verb::Apply, timeout);

        info!(
            node = %name,
            nodes = plan.descendants.len(),
            "Delegating subtree"
        );
        let result = self.phase(&name, &format!("{}:delegate", name), &action, false);

        match result {
            Ok(()) => {
                for descendant in &plan.descendants {
                    let assigned = self.ctx.node_id(&descendant.name);
                    let address = self.ctx.node_address(&descendant.name).map(String::from);
                    let record = self.state.node_mut(&descendant.name);
                    record.assigned_id = assigned;
                    record.address = address;
                    record.transition(NodeStatus::Configured);
                }
                self.transition(&name, NodeStatus::Delegated);
                let _ = self.store.save(&self.state);
                Ok(())
            }
            Err(failure) => {
                for descendant in &plan.descendants {
                    self.state.node_mut(&descendant.name).fail(
                        ErrorKind::RemoteFailure,
                        format!("delegation via '{}' failed", name),
                    );
                }
                let _ = self.store.save(&self.state);
                Err(failure)
            }
        }
    }

    /// Each nesting level hands its delegation the base budget minus
    /// the manifest's timeout buffer, floored at one minute.
    fn delegation_timeout(&self, base: Duration) -> Duration {
        let buffer = Duration::from_secs(self.manifest.settings.timeout_buffer_seconds);
        base.saturating_sub(buffer).max(Duration::from_secs(60))
    }

    fn delegation_action(
        &self,
        plan: &NodePlan,
        subtree: &Manifest,
        verb: Verb,
        timeout: Duration,
    ) -> DelegateSubtreeAction {
        let name = &plan.node.name;
        let address = self.ctx.node_address(name).unwrap_or_default();

        let mut command = format!(
            "homestak {} --manifest-json {} -H {} --self-addr {} --structured-output",
            verb.as_str(),
            shell_quote(&subtree.to_canonical_json()),
            shell_quote(name),
            shell_quote(address),
        );
        if verb == Verb::Destroy {
            command.push_str(" --yes");
        }

        let mut env = Vec::new();
        if self.server_active {
            let base = self.server.base_url();
            env.push(("REPO_SERVER_URL".to_string(), base.clone()));
            env.push(("SPEC_SERVER_URL".to_string(), base));
            env.push(("REPO_SERVER_REF".to_string(), "_working".to_string()));
            if let Some(token) = &self.repo_token {
                env.push(("REPO_SERVER_TOKEN".to_string(), token.clone()));
            }
        }

        let mut allow_keys = Vec::new();
        for descendant in &plan.descendants {
            allow_keys.push(id_key(&descendant.name));
            allow_keys.push(address_key(&descendant.name));
        }

        DelegateSubtreeAction {
            node: name.clone(),
            address_key: address_key(name),
            user: self.host.automation_user.clone(),
            command,
            env,
            allow_keys,
            timeout,
            cancel: self.cancel.clone(),
        }
    }

    // ------------------------------------------------------------------
    // Destroy internals
    // ------------------------------------------------------------------

    fn destroy_root(&mut self, plan: &NodePlan) -> std::result::Result<(), PhaseFailure> {
        let name = plan.node.name.clone();

        // Children die before the hypervisor that hosts them.
        if plan.delegates() {
            if self.ctx.node_address(&name).is_some() {
                let subtree = plan.subtree.as_ref().expect("delegating plan has a subtree");
                let timeout = self.delegation_timeout(DELEGATE_DESTROY_TIMEOUT);
                let action = self.delegation_action(plan, subtree, Verb::Destroy, timeout);
                match self.phase(&name, &format!("{}:delegate-destroy", name), &action, false) {
                    Ok(()) => {
                        for descendant in &plan.descendants {
                            self.state
                                .node_mut(&descendant.name)
                                .transition(NodeStatus::Destroyed);
                        }
                    }
                    Err(failure) => {
                        // Keep going: the hypervisor teardown below
                        // takes the children with it.
                        warn!(
                            node = %name,
                            error = %failure.message,
                            "Subtree destroy delegation failed"
                        );
                    }
                }
            } else {
                warn!(node = %name, "No address for hypervisor, skipping subtree delegation");
            }
        }

        self.transition(&name, NodeStatus::Destroying);
        let destroy = DestroyResourceAction {
            node: name.clone(),
            vars: self.node_vars(&plan.node, None),
            module_dir: self.module_dir(),
            state_dir: self.provisioner_dir(&name)?,
        };
        self.phase(&name, &format!("{}:destroy", name), &destroy, false)?;

        self.transition(&name, NodeStatus::Destroyed);
        let _ = self.store.save(&self.state);
        Ok(())
    }

    /// Reverse-order teardown of everything created so far. Failures
    /// are logged but never abort further rollback.
    fn rollback(&mut self, created: &[String], plans: &[NodePlan]) {
        info!(nodes = created.len(), "Rolling back created nodes");
        for name in created.iter().rev() {
            let Some(plan) = plans.iter().find(|p| p.node.name == *name) else {
                continue;
            };
            if self
                .state
                .node(name)
                .is_some_and(|r| !r.status.is_created_or_later())
            {
                continue;
            }
            if let Err(failure) = self.destroy_root(plan) {
                warn!(
                    node = %name,
                    kind = %failure.kind,
                    error = %failure.message,
                    "Rollback destroy failed"
                );
            }
        }
    }

    // ------------------------------------------------------------------
    // Test internals
    // ------------------------------------------------------------------

    /// Reachability checks over every node that published an address.
    fn verify_nodes(&mut self) -> bool {
        let names: Vec<String> = self
            .state
            .nodes
            .iter()
            .filter(|(_, record)| record.status == NodeStatus::Configured || record.status == NodeStatus::Delegated)
            .map(|(name, _)| name.clone())
            .collect();

        let mut all_ok = true;
        for name in names {
            if self.ctx.node_address(&name).is_none() {
                warn!(node = %name, "No address recorded, skipping verify");
                continue;
            }
            let action = AwaitReachableAction {
                address_key: address_key(&name),
                user: self.host.automation_user.clone(),
                timeout: VERIFY_TIMEOUT,
                interval: POLL_INTERVAL,
                cancel: self.cancel.clone(),
            };
            if self.phase(&name, &format!("{}:verify", name), &action, false).is_err() {
                all_ok = false;
            }
        }
        all_ok
    }

    // ------------------------------------------------------------------
    // Shared plumbing
    // ------------------------------------------------------------------

    fn plan(&self) -> Result<Vec<NodePlan>> {
        let graph = ManifestGraph::build(&self.manifest)?;
        let mut plans = Vec::new();
        for node in graph.create_order() {
            let descendants: Vec<Node> = graph
                .descendants(&node.name)
                .into_iter()
                .cloned()
                .collect();
            let subtree = if node.kind == NodeKind::Pve && !descendants.is_empty() {
                Some(graph.extract_subtree(&node.name)?)
            } else {
                None
            };
            plans.push(NodePlan {
                node: node.clone(),
                depth: graph.depth(&node.name),
                descendants,
                subtree,
            });
        }
        Ok(plans)
    }

    /// Run one phase through the runner, record it, and merge context
    /// additions. A failed phase marks the node failed and persists.
    fn phase(
        &mut self,
        node: &str,
        phase_name: &str,
        action: &dyn Action,
        probe_retry: bool,
    ) -> std::result::Result<(), PhaseFailure> {
        let started = Instant::now();
        let result: ActionResult = if probe_retry {
            run_with_probe_retry(
                self.runner.as_mut(),
                action,
                &self.host,
                &self.ctx,
                &self.cancel,
            )
        } else {
            self.runner.run(action, &self.host, &self.ctx)
        };

        self.phases.push(PhaseReport {
            name: phase_name.to_string(),
            status: if result.success {
                PhaseStatus::Passed
            } else {
                PhaseStatus::Failed
            },
            duration: started.elapsed().as_secs_f64(),
        });

        if result.success {
            self.ctx.merge(&result.context_additions);
            Ok(())
        } else {
            let kind = result.kind();
            self.state.node_mut(node).fail(kind, result.message.clone());
            let _ = self.store.save(&self.state);
            Err(PhaseFailure {
                node: node.to_string(),
                phase: phase_name.to_string(),
                kind,
                message: result.message,
            })
        }
    }

    fn transition(&mut self, node: &str, status: NodeStatus) {
        self.state.node_mut(node).transition(status);
    }

    fn skip_descendants(&mut self, plan: &NodePlan) {
        for descendant in &plan.descendants {
            let record = self.state.node_mut(&descendant.name);
            if record.status == NodeStatus::Pending {
                record.transition(NodeStatus::Skipped);
            }
        }
        let _ = self.store.save(&self.state);
    }

    fn ensure_server(&mut self) -> Result<()> {
        self.server.ensure()?;
        self.server_active = true;
        let base = self.server.base_url();
        self.ctx.set(KEY_SPEC_SERVER, base.clone());
        self.ctx.set(KEY_REPO_SERVER, base);
        self.ctx.set(KEY_REPO_REF, "_working");
        if let Some(token) = &self.repo_token {
            self.ctx.set(KEY_REPO_TOKEN, token.clone());
        }
        Ok(())
    }

    fn mint_token(&mut self, node: &str) -> std::result::Result<String, PhaseFailure> {
        let minted = self
            .site
            .secrets()
            .map_err(|e| e.to_string())
            .and_then(|secrets| {
                TokenService::from_hex_key(secrets.signing_key()).map_err(|e| e.to_string())
            })
            .and_then(|service| {
                service
                    .mint(node, self.opts.token_validity_secs)
                    .map_err(|e| e.to_string())
            });

        match minted {
            Ok(token) => Ok(token),
            Err(message) => {
                let kind = ErrorKind::NotFound;
                self.state.node_mut(node).fail(kind, message.clone());
                let _ = self.store.save(&self.state);
                Err(PhaseFailure {
                    node: node.to_string(),
                    phase: format!("{}:mint-token", node),
                    kind,
                    message,
                })
            }
        }
    }

    fn node_vars(
        &self,
        node: &Node,
        token: Option<&str>,
    ) -> std::collections::BTreeMap<String, serde_json::Value> {
        let preset = node
            .preset
            .as_deref()
            .and_then(|name| self.site.preset(name).ok());
        let spec_server = self.server_active.then(|| self.server.base_url());
        resolve_bundle(&VarSources {
            defaults: &self.defaults,
            host: &self.host,
            posture: &self.posture,
            node,
            preset: preset.as_ref(),
            spec_server: spec_server.as_deref(),
            provisioning_token: token,
        })
    }

    fn provisioner_dir(&self, node: &str) -> std::result::Result<PathBuf, PhaseFailure> {
        self.store.provisioner_dir().map_err(|e| PhaseFailure {
            node: node.to_string(),
            phase: format!("{}:provision", node),
            kind: ErrorKind::Internal,
            message: e.to_string(),
        })
    }

    fn module_dir(&self) -> PathBuf {
        if let Some(dir) = std::env::var_os("HOMESTAK_TOFU_DIR") {
            return PathBuf::from(dir);
        }
        self.site.dir().join("tofu")
    }

    fn playbook_dir(&self) -> PathBuf {
        if let Some(dir) = std::env::var_os("HOMESTAK_PLAYBOOK_DIR") {
            return PathBuf::from(dir);
        }
        self.site.dir().join("ansible")
    }

    /// Where boot artifacts are published. The repo server's raw-file
    /// route serves them when it is up; otherwise an explicit base
    /// can be configured.
    fn artifact_base(&self) -> Option<String> {
        if let Ok(base) = std::env::var("HOMESTAK_IMAGE_BASE") {
            if !base.trim().is_empty() {
                return Some(base.trim().to_string());
            }
        }
        self.server_active
            .then(|| format!("{}/images.git/artifacts", self.server.base_url()))
    }

    fn report_failure(&self, verb: Verb, failure: &PhaseFailure) {
        eprintln!(
            "{} FAILED at {} {}: {}: {}",
            verb.as_str(),
            failure.node,
            failure.phase,
            failure.kind,
            failure.message
        );
    }

    fn preview(&self, verb: Verb, plans: &[NodePlan]) {
        if self.opts.structured_output {
            return;
        }
        println!();
        println!("DRY-RUN {}: {} on {}", verb.as_str(), self.manifest.name, self.host.name);
        let ordered: Box<dyn Iterator<Item = &NodePlan>> = match verb {
            Verb::Destroy => Box::new(plans.iter().rev()),
            _ => Box::new(plans.iter()),
        };
        for plan in ordered {
            let mode = if plan.depth == 0 { "local" } else { "delegated" };
            let parent = plan
                .node
                .parent
                .as_deref()
                .map(|p| format!(" (parent: {})", p))
                .unwrap_or_else(|| " (root)".to_string());
            println!(
                "  [{}] {}: {}{} [{}]",
                plan.depth, plan.node.name, plan.node.kind, parent, mode
            );
            if plan.depth == 0 && plan.delegates() && verb != Verb::Destroy {
                let children: Vec<&str> = plan
                    .descendants
                    .iter()
                    .map(|d| d.name.as_str())
                    .collect();
                println!("      delegates: {}", children.join(", "));
            }
        }
        println!();
    }

    fn aborted_report(&mut self, verb: Verb, started: Instant, error: &str) -> RunReport {
        eprintln!("{} FAILED: {}: {}", verb.as_str(), ErrorKind::Malformed, error);
        self.finish_report(verb, started, false, Some(error.to_string()))
    }

    fn finish_report(
        &mut self,
        verb: Verb,
        started: Instant,
        success: bool,
        error: Option<String>,
    ) -> RunReport {
        let mut report = RunReport::new(verb.as_str());
        report.success = success;
        report.duration_seconds = started.elapsed().as_secs_f64();
        report.phases = self.phases.clone();
        report.error = error;
        // Identifiers and addresses only; tokens and credentials stay
        // out of the trailer.
        for (key, value) in self.ctx.iter() {
            if key.ends_with("_id") || key.ends_with("_address") {
                report.context.insert(key.clone(), value.clone());
            }
        }
        report
    }
}

impl PhaseFailure {
    fn to_error_string(&self) -> String {
        format!(
            "{} {}: {}: {}",
            self.node, self.phase, self.kind, self.message
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    // ------------------------------------------------------------------
    // Scripted collaborators
    // ------------------------------------------------------------------

    /// Replays canned results keyed by substrings of the action's
    /// descriptor (name plus required keys), recording every
    /// invocation in order.
    struct ScriptedRunner {
        rules: Vec<(String, ActionResult)>,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl ActionRunner for ScriptedRunner {
        fn run(
            &mut self,
            action: &dyn Action,
            _host: &HostConfig,
            _ctx: &Context,
        ) -> ActionResult {
            let descriptor = action.descriptor();
            let key = format!("{} {}", descriptor.name, descriptor.requires.join(" "));
            self.log.lock().unwrap().push(descriptor.name.clone());
            for (pattern, result) in &self.rules {
                if key.contains(pattern.as_str()) {
                    return result.clone();
                }
            }
            ActionResult::ok("scripted")
        }
    }

    #[derive(Default)]
    struct FakeServer {
        running: bool,
        starts: u32,
        stops: u32,
    }

    struct FakeServerControl(Arc<Mutex<FakeServer>>);

    impl crate::server_handle::ServerControl for FakeServerControl {
        fn is_healthy(&self) -> bool {
            self.0.lock().unwrap().running
        }

        fn start(&mut self) -> Result<()> {
            let mut srv = self.0.lock().unwrap();
            srv.running = true;
            srv.starts += 1;
            Ok(())
        }

        fn stop(&mut self) -> Result<()> {
            let mut srv = self.0.lock().unwrap();
            srv.running = false;
            srv.stops += 1;
            Ok(())
        }
    }

    struct Fixture {
        _tmp: TempDir,
        log: Arc<Mutex<Vec<String>>>,
        server: Arc<Mutex<FakeServer>>,
        state_dir: std::path::PathBuf,
        site_dir: std::path::PathBuf,
    }

    impl Fixture {
        fn new() -> Self {
            let tmp = TempDir::new().unwrap();
            let site_dir = tmp.path().join("site");
            let state_dir = tmp.path().join("state");
            std::fs::create_dir_all(&site_dir).unwrap();
            std::fs::create_dir_all(&state_dir).unwrap();
            Self {
                log: Arc::new(Mutex::new(Vec::new())),
                server: Arc::new(Mutex::new(FakeServer::default())),
                state_dir,
                site_dir,
                _tmp: tmp,
            }
        }

        fn with_signing_key(self) -> Self {
            std::fs::write(
                self.site_dir.join("secrets.yaml"),
                "auth:\n  signing_key: 00112233445566778899aabbccddeeff00112233445566778899aabbccddeeff\n",
            )
            .unwrap();
            self
        }

        fn executor(
            &self,
            manifest_yaml: &str,
            rules: Vec<(&str, ActionResult)>,
            opts: ExecutorOptions,
        ) -> NodeExecutor {
            let manifest = Manifest::from_yaml(manifest_yaml).unwrap();
            let site = SiteConfig::at(&self.site_dir);
            let host = HostConfig::local("localhost");
            let store =
                StateStore::open_in(&self.state_dir, &manifest.name, &host.name).unwrap();
            let runner = ScriptedRunner {
                rules: rules
                    .into_iter()
                    .map(|(pattern, result)| (pattern.to_string(), result))
                    .collect(),
                log: Arc::clone(&self.log),
            };
            let server = ServerHandle::new(
                Box::new(FakeServerControl(Arc::clone(&self.server))),
                DEFAULT_SERVER_PORT,
                "192.0.2.1".to_string(),
                self.state_dir.join("run"),
            );
            NodeExecutor::new(
                manifest,
                site,
                host,
                store,
                opts,
                Box::new(runner),
                server,
                CancelToken::new(),
            )
            .unwrap()
        }

        fn actions(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }
    }

    fn additions(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    const S1_YAML: &str = "schema_version: 2\nname: s1\nnodes:\n  - {name: a, type: vm, preset: small, image: deb12, vmid: 99100}\n";

    const S3_YAML: &str = "schema_version: 2\nname: s3\nnodes:\n  - {name: root, type: pve, preset: large, image: deb13-pve, vmid: 99011}\n  - {name: edge, type: vm, preset: small, image: deb12, vmid: 99021, parent: root}\n";

    fn leaf_rules() -> Vec<(&'static str, ActionResult)> {
        vec![
            (
                "provision-a",
                ActionResult::ok_with("provisioned", additions(&[("a_id", "99100")])),
            ),
            (
                "await-address-a",
                ActionResult::ok_with("addressed", additions(&[("a_address", "192.0.2.10")])),
            ),
        ]
    }

    fn tree_rules() -> Vec<(&'static str, ActionResult)> {
        vec![
            (
                "provision-root",
                ActionResult::ok_with("provisioned", additions(&[("root_id", "99011")])),
            ),
            (
                "await-address-root",
                ActionResult::ok_with("addressed", additions(&[("root_address", "192.0.2.30")])),
            ),
            (
                "delegate-root",
                ActionResult::ok_with(
                    "delegated",
                    additions(&[("edge_id", "99021"), ("edge_address", "192.0.2.40")]),
                ),
            ),
        ]
    }

    // ------------------------------------------------------------------
    // Scenarios
    // ------------------------------------------------------------------

    #[test]
    fn test_single_leaf_push_apply() {
        let fixture = Fixture::new();
        let mut executor = fixture.executor(S1_YAML, leaf_rules(), ExecutorOptions::default());

        let report = executor.apply();
        assert!(report.success, "{:?}", report.error);
        assert_eq!(report.scenario, "apply");

        let actions = fixture.actions();
        assert_eq!(
            actions,
            vec!["provision-a", "start-a", "await-address-a", "await-reachable"]
        );

        let record = executor.state.node("a").unwrap();
        assert_eq!(record.status, NodeStatus::Configured);
        assert_eq!(record.assigned_id, Some(99100));
        assert_eq!(record.address.as_deref(), Some("192.0.2.10"));

        assert_eq!(report.context.get("a_id").map(String::as_str), Some("99100"));
        assert_eq!(
            report.context.get("a_address").map(String::as_str),
            Some("192.0.2.10")
        );
        assert!(report.phases.iter().all(|p| p.status == PhaseStatus::Passed));

        // No spec, no delegation: the server was never touched.
        assert_eq!(fixture.server.lock().unwrap().starts, 0);
    }

    #[test]
    fn test_single_leaf_destroy() {
        let fixture = Fixture::new();
        let mut executor = fixture.executor(S1_YAML, leaf_rules(), ExecutorOptions::default());

        assert!(executor.apply().success);
        let report = executor.destroy();
        assert!(report.success, "{:?}", report.error);
        assert_eq!(report.scenario, "destroy");

        let record = executor.state.node("a").unwrap();
        assert_eq!(record.status, NodeStatus::Destroyed);
        assert_eq!(*fixture.actions().last().unwrap(), "destroy-a");
    }

    #[test]
    fn test_pull_mode_starts_server_and_polls_marker() {
        let fixture = Fixture::new().with_signing_key();
        let yaml = "schema_version: 2\nname: s2\nnodes:\n  - name: a\n    type: vm\n    preset: small\n    image: deb12\n    vmid: 99100\n    execution: {mode: pull, spec: s1-spec}\n";
        let mut executor = fixture.executor(yaml, leaf_rules(), ExecutorOptions::default());

        let report = executor.apply();
        assert!(report.success, "{:?}", report.error);

        let actions = fixture.actions();
        assert!(actions.contains(&"await-file".to_string()));
        // Server was started for spec serving and released afterward.
        let server = fixture.server.lock().unwrap();
        assert_eq!(server.starts, 1);
        assert_eq!(server.stops, 1);
    }

    #[test]
    fn test_pull_mode_without_signing_key_fails() {
        let fixture = Fixture::new();
        let yaml = "schema_version: 2\nname: s2\nnodes:\n  - name: a\n    type: vm\n    vmid: 99100\n    execution: {mode: pull, spec: s1-spec}\n";
        let mut executor = fixture.executor(yaml, leaf_rules(), ExecutorOptions::default());

        let report = executor.apply();
        assert!(!report.success);
        assert!(report.error.as_deref().unwrap_or("").contains("mint-token"));

        let record = executor.state.node("a").unwrap();
        assert_eq!(record.status, NodeStatus::Failed);
        assert_eq!(record.error.as_ref().unwrap().kind, ErrorKind::NotFound);
    }

    #[test]
    fn test_pull_mode_marker_timeout_fails_not_ready() {
        let fixture = Fixture::new().with_signing_key();
        let yaml = "schema_version: 2\nname: s2\nnodes:\n  - name: a\n    type: vm\n    vmid: 99100\n    execution: {mode: pull, spec: s1-spec}\n";
        let mut rules = leaf_rules();
        rules.push((
            "await-file",
            ActionResult::fail(ErrorKind::NotReady, "Timeout waiting for marker"),
        ));
        let mut executor = fixture.executor(yaml, rules, ExecutorOptions::default());

        let report = executor.apply();
        assert!(!report.success);
        let record = executor.state.node("a").unwrap();
        assert_eq!(record.status, NodeStatus::Failed);
        assert_eq!(record.error.as_ref().unwrap().kind, ErrorKind::NotReady);
    }

    #[test]
    fn test_two_level_tree_delegates_subtree() {
        let fixture = Fixture::new();
        let mut executor = fixture.executor(S3_YAML, tree_rules(), ExecutorOptions::default());

        let report = executor.apply();
        assert!(report.success, "{:?}", report.error);

        let actions = fixture.actions();
        // Hypervisor lifecycle runs between configure and delegation.
        for expected in [
            "provision-root",
            "start-root",
            "await-address-root",
            "await-reachable",
            "bootstrap",
            "configure-bridge",
            "node-config",
            "issue-credential-root",
            "ensure-image-deb12",
            "delegate-root",
        ] {
            assert!(
                actions.iter().any(|a| a == expected),
                "missing action {} in {:?}",
                expected,
                actions
            );
        }
        let delegate_pos = actions.iter().position(|a| a == "delegate-root").unwrap();
        let bootstrap_pos = actions.iter().position(|a| a == "bootstrap").unwrap();
        assert!(bootstrap_pos < delegate_pos);

        // The child's identifiers were imported into parent state.
        let edge = executor.state.node("edge").unwrap();
        assert_eq!(edge.status, NodeStatus::Configured);
        assert_eq!(edge.assigned_id, Some(99021));
        assert_eq!(edge.address.as_deref(), Some("192.0.2.40"));

        let root = executor.state.node("root").unwrap();
        assert_eq!(root.status, NodeStatus::Delegated);

        assert_eq!(
            report.context.get("edge_address").map(String::as_str),
            Some("192.0.2.40")
        );

        let server = fixture.server.lock().unwrap();
        assert_eq!(server.starts, 1);
        assert_eq!(server.stops, 1);
    }

    #[test]
    fn test_rollback_destroys_in_reverse() {
        let fixture = Fixture::new();
        let yaml = format!("{}settings:\n  on_error: rollback\n", S3_YAML);
        let mut rules = tree_rules();
        // Delegation fails; rollback must still tear the root down.
        rules.insert(
            0,
            (
                "delegate-root",
                ActionResult::fail(ErrorKind::RemoteFailure, "edge: not-ready: ssh timeout"),
            ),
        );
        let mut executor = fixture.executor(&yaml, rules, ExecutorOptions::default());

        let report = executor.apply();
        assert!(!report.success);

        let actions = fixture.actions();
        let delegate_pos = actions.iter().position(|a| a == "delegate-root").unwrap();
        let destroy_pos = actions.iter().position(|a| a == "destroy-root").unwrap();
        assert!(delegate_pos < destroy_pos, "rollback follows the failure");

        let root = executor.state.node("root").unwrap();
        assert_eq!(root.status, NodeStatus::Destroyed);
        let edge = executor.state.node("edge").unwrap();
        assert_eq!(edge.status, NodeStatus::Failed);
        assert_eq!(edge.error.as_ref().unwrap().kind, ErrorKind::RemoteFailure);
    }

    #[test]
    fn test_continue_policy_skips_descendants_and_proceeds() {
        let fixture = Fixture::new();
        let yaml = "schema_version: 2\nname: multi\nsettings:\n  on_error: continue\nnodes:\n  - {name: hub, type: pve, vmid: 99011}\n  - {name: spoke, type: vm, vmid: 99021, parent: hub}\n  - {name: lone, type: vm, vmid: 99031}\n";
        let rules = vec![
            (
                "provision-hub",
                ActionResult::fail(ErrorKind::Conflict, "VM 99011 already exists"),
            ),
            (
                "provision-lone",
                ActionResult::ok_with("ok", additions(&[("lone_id", "99031")])),
            ),
            (
                "await-address-lone",
                ActionResult::ok_with("ok", additions(&[("lone_address", "192.0.2.50")])),
            ),
        ];
        let mut executor = fixture.executor(yaml, rules, ExecutorOptions::default());

        let report = executor.apply();
        assert!(!report.success);

        assert_eq!(
            executor.state.node("hub").unwrap().status,
            NodeStatus::Failed
        );
        assert_eq!(
            executor.state.node("spoke").unwrap().status,
            NodeStatus::Skipped
        );
        // The sibling subtree still completed.
        assert_eq!(
            executor.state.node("lone").unwrap().status,
            NodeStatus::Configured
        );
    }

    #[test]
    fn test_stop_policy_halts_run() {
        let fixture = Fixture::new();
        let yaml = "schema_version: 2\nname: multi\nnodes:\n  - {name: first, type: vm, vmid: 99001}\n  - {name: second, type: vm, vmid: 99002}\n";
        let rules = vec![(
            "provision-first",
            ActionResult::fail(ErrorKind::Internal, "boom"),
        )];
        let mut executor = fixture.executor(yaml, rules, ExecutorOptions::default());

        let report = executor.apply();
        assert!(!report.success);
        // second was never attempted.
        assert!(!fixture.actions().iter().any(|a| a.contains("second")));
        assert_eq!(
            executor.state.node("second").unwrap().status,
            NodeStatus::Pending
        );
    }

    #[test]
    fn test_destroy_delegates_before_root_teardown() {
        let fixture = Fixture::new();
        let mut executor = fixture.executor(S3_YAML, tree_rules(), ExecutorOptions::default());
        assert!(executor.apply().success);

        let before = fixture.actions().len();
        let report = executor.destroy();
        assert!(report.success, "{:?}", report.error);

        let actions = fixture.actions()[before..].to_vec();
        let delegate_pos = actions.iter().position(|a| a == "delegate-root").unwrap();
        let destroy_pos = actions.iter().position(|a| a == "destroy-root").unwrap();
        assert!(delegate_pos < destroy_pos);

        assert_eq!(
            executor.state.node("edge").unwrap().status,
            NodeStatus::Destroyed
        );
        assert_eq!(
            executor.state.node("root").unwrap().status,
            NodeStatus::Destroyed
        );
    }

    #[test]
    fn test_dry_run_executes_nothing() {
        let fixture = Fixture::new();
        let opts = ExecutorOptions {
            dry_run: true,
            structured_output: true,
            ..Default::default()
        };
        let mut executor = fixture.executor(S3_YAML, Vec::new(), opts);

        let report = executor.apply();
        assert!(report.success);
        assert!(fixture.actions().is_empty());
        assert_eq!(
            executor.state.node("root").unwrap().status,
            NodeStatus::Pending
        );
        assert_eq!(fixture.server.lock().unwrap().starts, 0);
    }

    #[test]
    fn test_state_survives_executor_restart() {
        let fixture = Fixture::new();
        {
            let mut executor =
                fixture.executor(S1_YAML, leaf_rules(), ExecutorOptions::default());
            assert!(executor.apply().success);
        }

        // A fresh executor over the same store sees the prior run.
        let executor = fixture.executor(S1_YAML, Vec::new(), ExecutorOptions::default());
        let record = executor.state.node("a").unwrap();
        assert_eq!(record.status, NodeStatus::Configured);
        assert_eq!(record.assigned_id, Some(99100));
    }

    #[test]
    fn test_test_verb_verifies_and_destroys() {
        let fixture = Fixture::new();
        let mut executor = fixture.executor(S1_YAML, leaf_rules(), ExecutorOptions::default());

        let report = executor.test();
        assert!(report.success, "{:?}", report.error);
        assert_eq!(report.scenario, "test");

        let actions = fixture.actions();
        // Configure probe, then the verify probe, then teardown.
        let reachable_count = actions.iter().filter(|a| *a == "await-reachable").count();
        assert_eq!(reachable_count, 2);
        assert_eq!(*actions.last().unwrap(), "destroy-a");

        // One server hold across the whole test cycle.
        let server = fixture.server.lock().unwrap();
        assert_eq!(server.starts, 1);
        assert_eq!(server.stops, 1);
    }

    #[test]
    fn test_second_run_on_same_key_is_rejected() {
        let fixture = Fixture::new();
        let _first = fixture.executor(S1_YAML, Vec::new(), ExecutorOptions::default());

        let manifest = Manifest::from_yaml(S1_YAML).unwrap();
        let host = HostConfig::local("localhost");
        let store = StateStore::open_in(&fixture.state_dir, &manifest.name, &host.name).unwrap();
        let runner = ScriptedRunner {
            rules: Vec::new(),
            log: Arc::clone(&fixture.log),
        };
        let server = ServerHandle::new(
            Box::new(FakeServerControl(Arc::clone(&fixture.server))),
            DEFAULT_SERVER_PORT,
            "192.0.2.1".to_string(),
            fixture.state_dir.join("run"),
        );
        let err = NodeExecutor::new(
            manifest,
            SiteConfig::at(&fixture.site_dir),
            host,
            store,
            ExecutorOptions::default(),
            Box::new(runner),
            server,
            CancelToken::new(),
        )
        .err()
        .expect("second run must be rejected");
        assert!(err.to_string().contains("Another run is active"));
    }
}
