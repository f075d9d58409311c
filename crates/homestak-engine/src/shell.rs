use std::path::Path;
use std::process::{Command, Output, Stdio};
use std::time::Duration;

use anyhow::{Context as _, Result};
use tracing::debug;

/// Relaxed host-key options: target VMs are recreated constantly, so
/// pinned host keys would invalidate on every run.
pub const SSH_OPTS: &[&str] = &[
    "-o",
    "StrictHostKeyChecking=no",
    "-o",
    "UserKnownHostsFile=/dev/null",
    "-o",
    "LogLevel=ERROR",
];

/// Run a command on the engine host, capturing output.
pub fn run_host(cmd: &str, args: &[&str]) -> Result<Output> {
    debug!(cmd, ?args, "Running host command");
    Command::new(cmd)
        .args(args)
        .output()
        .with_context(|| format!("Failed to run: {} {}", cmd, args.join(" ")))
}

/// Run a command on a remote host over SSH, returning
/// `(exit code, stdout, stderr)`.
pub fn run_ssh(
    host: &str,
    user: &str,
    command: &str,
    timeout: Duration,
) -> Result<(i32, String, String)> {
    #[cfg(test)]
    if let Some(mocked) = crate::shell_mock::intercept(command) {
        return Ok(mocked);
    }

    let connect_timeout = format!("ConnectTimeout={}", timeout.as_secs().max(1));
    let target = format!("{}@{}", user, host);
    let mut args: Vec<&str> = SSH_OPTS.to_vec();
    args.extend(["-o", &connect_timeout, &target, command]);

    let output = Command::new("ssh")
        .args(&args)
        .stdin(Stdio::null())
        .output()
        .with_context(|| format!("Failed to run ssh to {}", target))?;

    Ok((
        output.status.code().unwrap_or(-1),
        String::from_utf8_lossy(&output.stdout).into_owned(),
        String::from_utf8_lossy(&output.stderr).into_owned(),
    ))
}

/// Copy a local file to a remote path over SCP.
pub fn run_scp(host: &str, user: &str, local: &Path, remote: &str) -> Result<()> {
    let target = format!("{}@{}:{}", user, host, remote);

    #[cfg(test)]
    if let Some((rc, _, stderr)) = crate::shell_mock::intercept(&format!("scp {}", target)) {
        if rc != 0 {
            anyhow::bail!("scp to {} failed: {}", target, stderr.trim());
        }
        return Ok(());
    }
    let local_str = local.to_string_lossy();
    let mut args: Vec<&str> = SSH_OPTS.to_vec();
    args.extend([local_str.as_ref(), target.as_str()]);

    let output = Command::new("scp")
        .args(&args)
        .output()
        .with_context(|| format!("Failed to run scp to {}", target))?;

    if !output.status.success() {
        anyhow::bail!(
            "scp to {} failed: {}",
            target,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(())
}

/// Single ICMP probe with a one-second wait.
pub fn ping(host: &str) -> bool {
    #[cfg(test)]
    if crate::shell_mock::active() {
        return true;
    }

    Command::new("ping")
        .args(["-c", "1", "-W", "1", host])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

/// Quote a string for safe interpolation into a remote shell command.
pub fn shell_quote(s: &str) -> String {
    if !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || "._-/:@=%+".contains(c))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', r"'\''"))
}
