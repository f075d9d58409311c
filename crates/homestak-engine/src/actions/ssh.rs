use std::path::PathBuf;
use std::time::{Duration, Instant};

use homestak_core::cancel::CancelToken;
use homestak_core::config::HostConfig;
use homestak_core::context::Context;
use homestak_core::error::ErrorKind;

use crate::action::{Action, ActionDescriptor, ActionResult};
use crate::shell;

/// Per-attempt SSH budget inside polling loops; the loop deadline
/// bounds the total.
const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(5);

fn classify_ssh_failure(rc: i32, stderr: &str) -> ErrorKind {
    let lower = stderr.to_ascii_lowercase();
    if lower.contains("permission denied") || lower.contains("authentication") {
        ErrorKind::Unauthorized
    } else if rc == 255 {
        // ssh itself failed to connect.
        ErrorKind::NotReady
    } else {
        ErrorKind::Internal
    }
}

/// Wait until a trivial command succeeds over the interactive channel.
/// Pings first: ICMP answers long before sshd is up, and fails fast
/// when the address is bogus.
pub struct AwaitReachableAction {
    pub address_key: String,
    pub user: String,
    pub timeout: Duration,
    pub interval: Duration,
    pub cancel: CancelToken,
}

impl Action for AwaitReachableAction {
    fn descriptor(&self) -> ActionDescriptor {
        ActionDescriptor::new("await-reachable").requires(self.address_key.clone())
    }

    fn execute(&self, _host: &HostConfig, ctx: &Context) -> ActionResult {
        let Some(address) = ctx.get(&self.address_key) else {
            return ActionResult::fail(
                ErrorKind::Internal,
                format!("No {} in context", self.address_key),
            );
        };

        let deadline = Instant::now() + self.timeout;

        // Never spend more than half the budget waiting for ICMP.
        let ping_deadline = Instant::now() + (self.timeout / 2).min(Duration::from_secs(30));
        while Instant::now() < ping_deadline {
            if shell::ping(address) {
                break;
            }
            if !self.cancel.sleep(Duration::from_secs(2)) {
                return ActionResult::fail(ErrorKind::Cancelled, "cancelled while pinging");
            }
        }

        while Instant::now() < deadline {
            match shell::run_ssh(address, &self.user, "echo ready", ATTEMPT_TIMEOUT) {
                Ok((0, stdout, _)) if stdout.contains("ready") => {
                    return ActionResult::ok(format!("{} reachable", address));
                }
                Ok(_) | Err(_) => {}
            }
            if !self.cancel.sleep(self.interval) {
                return ActionResult::fail(ErrorKind::Cancelled, "cancelled while waiting");
            }
        }

        ActionResult::fail(
            ErrorKind::NotReady,
            format!("Timeout waiting for {} to accept commands", address),
        )
    }
}

/// Poll for a file on a remote host; pull-mode nodes signal completed
/// self-configuration by creating a marker file.
pub struct AwaitFileAction {
    pub address_key: String,
    pub user: String,
    pub path: String,
    pub timeout: Duration,
    pub interval: Duration,
    pub cancel: CancelToken,
}

impl Action for AwaitFileAction {
    fn descriptor(&self) -> ActionDescriptor {
        ActionDescriptor::new("await-file").requires(self.address_key.clone())
    }

    fn execute(&self, _host: &HostConfig, ctx: &Context) -> ActionResult {
        let Some(address) = ctx.get(&self.address_key) else {
            return ActionResult::fail(
                ErrorKind::Internal,
                format!("No {} in context", self.address_key),
            );
        };

        let probe = format!("test -f {} && echo present", shell::shell_quote(&self.path));
        let deadline = Instant::now() + self.timeout;

        while Instant::now() < deadline {
            if let Ok((0, stdout, _)) =
                shell::run_ssh(address, &self.user, &probe, ATTEMPT_TIMEOUT)
            {
                if stdout.contains("present") {
                    return ActionResult::ok(format!("{} present on {}", self.path, address));
                }
            }
            if !self.cancel.sleep(self.interval) {
                return ActionResult::fail(ErrorKind::Cancelled, "cancelled while polling");
            }
        }

        ActionResult::fail(
            ErrorKind::NotReady,
            format!("Timeout waiting for {} on {}", self.path, address),
        )
    }
}

/// Run one remote command, optionally storing trimmed stdout in the
/// context.
pub struct RunCommandAction {
    pub name: String,
    pub address_key: String,
    pub user: String,
    pub command: String,
    pub timeout: Duration,
    pub output_key: Option<String>,
}

impl Action for RunCommandAction {
    fn descriptor(&self) -> ActionDescriptor {
        let mut descriptor =
            ActionDescriptor::new(self.name.clone()).requires(self.address_key.clone());
        if let Some(key) = &self.output_key {
            descriptor = descriptor.yields(key.clone());
        }
        descriptor
    }

    fn execute(&self, _host: &HostConfig, ctx: &Context) -> ActionResult {
        let Some(address) = ctx.get(&self.address_key) else {
            return ActionResult::fail(
                ErrorKind::Internal,
                format!("No {} in context", self.address_key),
            );
        };

        match shell::run_ssh(address, &self.user, &self.command, self.timeout) {
            Ok((0, stdout, _)) => {
                let mut additions = std::collections::BTreeMap::new();
                if let Some(key) = &self.output_key {
                    additions.insert(key.clone(), stdout.trim().to_string());
                }
                ActionResult::ok_with(
                    format!("{} completed on {}", self.name, address),
                    additions,
                )
            }
            Ok((rc, _, stderr)) => ActionResult::fail(
                classify_ssh_failure(rc, &stderr),
                format!(
                    "{} failed on {} (exit {}): {}",
                    self.name,
                    address,
                    rc,
                    stderr.trim()
                ),
            ),
            Err(e) => ActionResult::fail(ErrorKind::Internal, e.to_string()),
        }
    }
}

/// Copy a local file to a protected remote path, creating the parent
/// directory and tightening permissions.
pub struct CopyFileAction {
    pub name: String,
    pub address_key: String,
    pub user: String,
    pub local_path: PathBuf,
    pub remote_path: String,
    pub mode: String,
}

impl Action for CopyFileAction {
    fn descriptor(&self) -> ActionDescriptor {
        ActionDescriptor::new(self.name.clone()).requires(self.address_key.clone())
    }

    fn execute(&self, _host: &HostConfig, ctx: &Context) -> ActionResult {
        let Some(address) = ctx.get(&self.address_key) else {
            return ActionResult::fail(
                ErrorKind::Internal,
                format!("No {} in context", self.address_key),
            );
        };
        if !self.local_path.exists() {
            return ActionResult::fail(
                ErrorKind::NotFound,
                format!("Local file missing: {}", self.local_path.display()),
            );
        }

        let parent = std::path::Path::new(&self.remote_path)
            .parent()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_else(|| "/".to_string());
        let prepare = format!("mkdir -p {}", shell::shell_quote(&parent));
        if let Ok((rc, _, stderr)) =
            shell::run_ssh(address, &self.user, &prepare, ATTEMPT_TIMEOUT)
        {
            if rc != 0 {
                return ActionResult::fail(
                    classify_ssh_failure(rc, &stderr),
                    format!("mkdir failed on {}: {}", address, stderr.trim()),
                );
            }
        }

        if let Err(e) = shell::run_scp(address, &self.user, &self.local_path, &self.remote_path) {
            return ActionResult::fail(ErrorKind::Internal, e.to_string());
        }

        let chmod = format!(
            "chmod {} {}",
            self.mode,
            shell::shell_quote(&self.remote_path)
        );
        match shell::run_ssh(address, &self.user, &chmod, ATTEMPT_TIMEOUT) {
            Ok((0, _, _)) => ActionResult::ok(format!(
                "Copied {} to {}:{}",
                self.local_path.display(),
                address,
                self.remote_path
            )),
            Ok((rc, _, stderr)) => ActionResult::fail(
                classify_ssh_failure(rc, &stderr),
                format!("chmod failed: {}", stderr.trim()),
            ),
            Err(e) => ActionResult::fail(ErrorKind::Internal, e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shell_mock;

    fn host() -> HostConfig {
        HostConfig::local("localhost")
    }

    fn ctx_with_address() -> Context {
        let mut ctx = Context::new();
        ctx.set("a_address", "192.0.2.9");
        ctx
    }

    fn fast_cancel() -> CancelToken {
        CancelToken::new()
    }

    #[test]
    fn test_await_reachable_recovers_after_refusals() {
        let _guard = shell_mock::install();
        shell_mock::expect_times("echo ready", 2, 255, "", "Connection refused");
        shell_mock::expect("echo ready", 0, "ready\n", "");

        let action = AwaitReachableAction {
            address_key: "a_address".to_string(),
            user: "ops".to_string(),
            timeout: Duration::from_secs(5),
            interval: Duration::from_millis(10),
            cancel: fast_cancel(),
        };
        let result = action.execute(&host(), &ctx_with_address());
        assert!(result.success, "{}", result.message);
    }

    #[test]
    fn test_await_reachable_timeout_is_not_ready() {
        let _guard = shell_mock::install();
        shell_mock::expect("echo ready", 255, "", "Connection refused");

        let action = AwaitReachableAction {
            address_key: "a_address".to_string(),
            user: "ops".to_string(),
            timeout: Duration::from_millis(80),
            interval: Duration::from_millis(10),
            cancel: fast_cancel(),
        };
        let result = action.execute(&host(), &ctx_with_address());
        assert!(!result.success);
        assert_eq!(result.kind(), ErrorKind::NotReady);
    }

    #[test]
    fn test_await_file_present() {
        let _guard = shell_mock::install();
        shell_mock::expect("test -f /var/lib/homestak/config-complete.json", 0, "present", "");

        let action = AwaitFileAction {
            address_key: "a_address".to_string(),
            user: "ops".to_string(),
            path: "/var/lib/homestak/config-complete.json".to_string(),
            timeout: Duration::from_secs(2),
            interval: Duration::from_millis(10),
            cancel: fast_cancel(),
        };
        let result = action.execute(&host(), &ctx_with_address());
        assert!(result.success);
    }

    #[test]
    fn test_await_file_timeout_is_not_ready() {
        let _guard = shell_mock::install();
        shell_mock::expect("test -f", 1, "", "");

        let action = AwaitFileAction {
            address_key: "a_address".to_string(),
            user: "ops".to_string(),
            path: "/var/lib/homestak/config-complete.json".to_string(),
            timeout: Duration::from_millis(50),
            interval: Duration::from_millis(10),
            cancel: fast_cancel(),
        };
        let result = action.execute(&host(), &ctx_with_address());
        assert!(!result.success);
        assert_eq!(result.kind(), ErrorKind::NotReady);
    }

    #[test]
    fn test_await_file_cancellation() {
        let _guard = shell_mock::install();
        shell_mock::expect("test -f", 1, "", "");

        let cancel = CancelToken::new();
        cancel.cancel();
        let action = AwaitFileAction {
            address_key: "a_address".to_string(),
            user: "ops".to_string(),
            path: "/tmp/marker".to_string(),
            timeout: Duration::from_secs(30),
            interval: Duration::from_millis(10),
            cancel,
        };
        let start = Instant::now();
        let result = action.execute(&host(), &ctx_with_address());
        assert_eq!(result.kind(), ErrorKind::Cancelled);
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_run_command_captures_output() {
        let _guard = shell_mock::install();
        shell_mock::expect("hostname", 0, "edge-node\n", "");

        let action = RunCommandAction {
            name: "read-hostname".to_string(),
            address_key: "a_address".to_string(),
            user: "ops".to_string(),
            command: "hostname".to_string(),
            timeout: Duration::from_secs(5),
            output_key: Some("a_hostname".to_string()),
        };
        let result = action.execute(&host(), &ctx_with_address());
        assert!(result.success);
        assert_eq!(
            result.context_additions.get("a_hostname").map(String::as_str),
            Some("edge-node")
        );
    }

    #[test]
    fn test_run_command_classifies_auth_failures() {
        let _guard = shell_mock::install();
        shell_mock::expect("whoami", 255, "", "root@192.0.2.9: Permission denied (publickey)");

        let action = RunCommandAction {
            name: "probe".to_string(),
            address_key: "a_address".to_string(),
            user: "root".to_string(),
            command: "whoami".to_string(),
            timeout: Duration::from_secs(5),
            output_key: None,
        };
        let result = action.execute(&host(), &ctx_with_address());
        assert_eq!(result.kind(), ErrorKind::Unauthorized);
    }

    #[test]
    fn test_missing_context_key_is_internal() {
        let action = RunCommandAction {
            name: "probe".to_string(),
            address_key: "missing_address".to_string(),
            user: "root".to_string(),
            command: "true".to_string(),
            timeout: Duration::from_secs(5),
            output_key: None,
        };
        let result = action.execute(&host(), &Context::new());
        assert_eq!(result.kind(), ErrorKind::Internal);
        assert!(result.message.contains("missing_address"));
    }

    #[test]
    fn test_classify_connection_refused_as_not_ready() {
        assert_eq!(
            classify_ssh_failure(255, "ssh: connect to host 192.0.2.9: Connection refused"),
            ErrorKind::NotReady
        );
        assert_eq!(classify_ssh_failure(1, "some script error"), ErrorKind::Internal);
    }
}
