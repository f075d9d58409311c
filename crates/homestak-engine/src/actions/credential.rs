use std::collections::BTreeMap;
use std::time::Duration;

use homestak_core::config::HostConfig;
use homestak_core::context::Context;
use homestak_core::error::ErrorKind;

use crate::action::{Action, ActionDescriptor, ActionResult};
use crate::shell::{self, shell_quote};

/// Where an issued credential is cached on the hypervisor. Re-running
/// the action reads it back instead of minting a second one.
const CREDENTIAL_PATH: &str = "/etc/homestak/api-token";

const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(15);

/// Create a scoped API credential on a freshly installed hypervisor
/// and yield its value into the context.
pub struct IssueCredentialAction {
    pub node: String,
    pub address_key: String,
    /// Realm user the credential belongs to, e.g. `automation@pve`.
    pub realm_user: String,
    /// Role granted on the root ACL path.
    pub role: String,
    /// Token identifier under the realm user.
    pub token_id: String,
    /// Context key the credential value is yielded under.
    pub yield_key: String,
}

impl Action for IssueCredentialAction {
    fn descriptor(&self) -> ActionDescriptor {
        ActionDescriptor::new(format!("issue-credential-{}", self.node))
            .requires(self.address_key.clone())
            .yields(self.yield_key.clone())
    }

    fn execute(&self, host: &HostConfig, ctx: &Context) -> ActionResult {
        let Some(address) = ctx.get(&self.address_key) else {
            return ActionResult::fail(
                ErrorKind::Internal,
                format!("No {} in context", self.address_key),
            );
        };
        let user = &host.admin_user;

        // Post-condition first: a cached credential is the one we
        // issued on a previous run.
        let read = format!("cat {} 2>/dev/null", CREDENTIAL_PATH);
        if let Ok((0, stdout, _)) = shell::run_ssh(address, user, &read, ATTEMPT_TIMEOUT) {
            let value = stdout.trim();
            if !value.is_empty() {
                let mut additions = BTreeMap::new();
                additions.insert(self.yield_key.clone(), value.to_string());
                return ActionResult::ok_with(
                    format!("Credential {} already issued", self.token_id),
                    additions,
                );
            }
        }

        // Ensure the automation user and its ACL exist, then mint.
        let prepare = format!(
            "pveum user add {} --comment homestak 2>/dev/null; \
             pveum acl modify / --users {} --roles {}",
            shell_quote(&self.realm_user),
            shell_quote(&self.realm_user),
            shell_quote(&self.role),
        );
        if let Ok((rc, _, stderr)) = shell::run_ssh(address, user, &prepare, ATTEMPT_TIMEOUT) {
            if rc != 0 {
                return ActionResult::fail(
                    ErrorKind::Internal,
                    format!("ACL setup failed on {}: {}", address, stderr.trim()),
                );
            }
        }

        let mint = format!(
            "pveum user token add {} {} --privsep 0 --output-format json",
            shell_quote(&self.realm_user),
            shell_quote(&self.token_id),
        );
        let (rc, stdout, stderr) =
            match shell::run_ssh(address, user, &mint, ATTEMPT_TIMEOUT) {
                Ok(result) => result,
                Err(e) => return ActionResult::fail(ErrorKind::Internal, e.to_string()),
            };

        if rc != 0 {
            let kind = if stderr.contains("already exists") {
                ErrorKind::Conflict
            } else {
                ErrorKind::Internal
            };
            return ActionResult::fail(
                kind,
                format!(
                    "Credential mint failed for {}!{}: {}",
                    self.realm_user,
                    self.token_id,
                    stderr.trim()
                ),
            );
        }

        let Some(value) = parse_token_value(&stdout) else {
            return ActionResult::fail(
                ErrorKind::Internal,
                "Hypervisor returned no token value".to_string(),
            );
        };

        // Cache for idempotent re-runs, owner-readable only.
        let store = format!(
            "umask 077 && mkdir -p /etc/homestak && printf '%s' {} > {}",
            shell_quote(&value),
            CREDENTIAL_PATH,
        );
        if let Ok((rc, _, stderr)) = shell::run_ssh(address, user, &store, ATTEMPT_TIMEOUT) {
            if rc != 0 {
                return ActionResult::fail(
                    ErrorKind::Internal,
                    format!("Failed to store credential: {}", stderr.trim()),
                );
            }
        }

        let mut additions = BTreeMap::new();
        additions.insert(self.yield_key.clone(), value);
        ActionResult::ok_with(
            format!("Issued credential {}!{}", self.realm_user, self.token_id),
            additions,
        )
    }
}

fn parse_token_value(json: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(json.trim()).ok()?;
    value
        .get("value")
        .and_then(|v| v.as_str())
        .filter(|v| !v.is_empty())
        .map(String::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shell_mock;

    fn action() -> IssueCredentialAction {
        IssueCredentialAction {
            node: "root".to_string(),
            address_key: "root_address".to_string(),
            realm_user: "automation@pve".to_string(),
            role: "PVEAdmin".to_string(),
            token_id: "homestak".to_string(),
            yield_key: "root_credential".to_string(),
        }
    }

    fn ctx() -> Context {
        let mut ctx = Context::new();
        ctx.set("root_address", "192.0.2.30");
        ctx
    }

    fn host() -> HostConfig {
        HostConfig::local("pve1")
    }

    #[test]
    fn test_parse_token_value() {
        let json = r#"{"full-tokenid": "automation@pve!homestak", "value": "uuid-secret"}"#;
        assert_eq!(parse_token_value(json).as_deref(), Some("uuid-secret"));
        assert_eq!(parse_token_value(r#"{"value": ""}"#), None);
        assert_eq!(parse_token_value("garbage"), None);
    }

    #[test]
    fn test_cached_credential_reused() {
        let _guard = shell_mock::install();
        shell_mock::expect("cat /etc/homestak/api-token", 0, "cached-secret\n", "");

        let result = action().execute(&host(), &ctx());
        assert!(result.success);
        assert_eq!(
            result.context_additions.get("root_credential").map(String::as_str),
            Some("cached-secret")
        );
        // No mint happened.
        assert!(!shell_mock::commands_seen().iter().any(|c| c.contains("token add")));
    }

    #[test]
    fn test_mint_and_store() {
        let _guard = shell_mock::install();
        shell_mock::expect("cat /etc/homestak/api-token", 1, "", "");
        shell_mock::expect("pveum acl modify", 0, "", "");
        shell_mock::expect(
            "pveum user token add",
            0,
            r#"{"value": "fresh-secret"}"#,
            "",
        );
        shell_mock::expect("printf '%s'", 0, "", "");

        let result = action().execute(&host(), &ctx());
        assert!(result.success, "{}", result.message);
        assert_eq!(
            result.context_additions.get("root_credential").map(String::as_str),
            Some("fresh-secret")
        );
    }

    #[test]
    fn test_existing_token_without_cache_is_conflict() {
        let _guard = shell_mock::install();
        shell_mock::expect("cat /etc/homestak/api-token", 1, "", "");
        shell_mock::expect("pveum acl modify", 0, "", "");
        shell_mock::expect(
            "pveum user token add",
            255,
            "",
            "create token failed: Token already exists\n",
        );

        let result = action().execute(&host(), &ctx());
        assert_eq!(result.kind(), ErrorKind::Conflict);
    }
}
