use std::collections::{BTreeMap, BTreeSet};

use serde_json::{json, Value};

use crate::config::{HostConfig, Posture, Preset, SiteDefaults};
use crate::manifest::Node;

/// Inputs to a resolved-variable bundle, lowest priority first.
pub struct VarSources<'a> {
    pub defaults: &'a SiteDefaults,
    pub host: &'a HostConfig,
    pub posture: &'a Posture,
    pub node: &'a Node,
    pub preset: Option<&'a Preset>,
    pub spec_server: Option<&'a str>,
    pub provisioning_token: Option<&'a str>,
}

/// Produce the flat variable bundle consumed by the provisioner and
/// the configuration runner.
///
/// Merge order: site defaults, host overrides, posture, per-node
/// overrides (with preset expansion), then the minted provisioning
/// token. Later layers win on key conflicts; `packages` is the one
/// exception and is set-unioned across layers.
pub fn resolve_bundle(sources: &VarSources) -> BTreeMap<String, Value> {
    let mut vars: BTreeMap<String, Value> = BTreeMap::new();
    let mut packages: BTreeSet<String> = BTreeSet::new();

    // 1. Site defaults.
    vars.insert("timezone".into(), json!(sources.defaults.timezone));
    vars.insert("datastore".into(), json!(sources.defaults.datastore));
    if !sources.defaults.ssh_options.is_empty() {
        vars.insert("ssh_options".into(), json!(sources.defaults.ssh_options));
    }
    packages.extend(sources.defaults.packages.iter().cloned());
    if let Some(url) = &sources.defaults.spec_server {
        vars.insert("spec_server".into(), json!(url));
    }

    // 2. Host overrides.
    vars.insert("target_host".into(), json!(sources.host.address));
    vars.insert("automation_user".into(), json!(sources.host.automation_user));
    if let Some(endpoint) = &sources.host.api_endpoint {
        vars.insert("api_endpoint".into(), json!(endpoint));
    }
    if let Some(credentials) = &sources.host.credentials {
        vars.insert("credentials".into(), json!(credentials));
    }

    // 3. Posture.
    vars.insert("auth_mode".into(), json!(sources.posture.auth_mode));

    // 4. Per-node overrides.
    let node = sources.node;
    vars.insert("node_name".into(), json!(node.name));
    vars.insert("node_type".into(), json!(node.kind.to_string()));
    if let Some(preset) = sources.preset {
        vars.insert("cores".into(), json!(preset.cores));
        vars.insert("memory_mb".into(), json!(preset.memory_mb));
        vars.insert("disk_gb".into(), json!(preset.disk_gb));
    }
    if let Some(image) = &node.image {
        vars.insert("image".into(), json!(image));
    }
    if let Some(vmid) = node.vmid {
        vars.insert("vmid".into(), json!(vmid));
    }
    if let Some(disk) = node.disk {
        // Node-level disk wins over the preset expansion.
        vars.insert("disk_gb".into(), json!(disk));
    }
    if let Some(spec) = node.spec() {
        vars.insert("spec".into(), json!(spec));
    }
    if let Some(url) = sources.spec_server {
        vars.insert("spec_server".into(), json!(url));
    }

    // 5. Minted provisioning token.
    if let Some(token) = sources.provisioning_token {
        vars.insert("provisioning_token".into(), json!(token));
    }

    if !packages.is_empty() {
        vars.insert(
            "packages".into(),
            json!(packages.into_iter().collect::<Vec<_>>()),
        );
    }

    vars
}
