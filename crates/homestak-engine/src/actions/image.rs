use std::time::Duration;

use homestak_core::config::HostConfig;
use homestak_core::context::Context;
use homestak_core::error::ErrorKind;

use crate::action::{Action, ActionDescriptor, ActionResult};
use crate::shell::{self, shell_quote};

/// Where hypervisors keep boot artifacts.
pub const IMAGE_DIR: &str = "/var/lib/vz/template/iso";

const FETCH_TIMEOUT: Duration = Duration::from_secs(300);
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// curl exits 22 with `-f` when the server answered 4xx.
const CURL_HTTP_ERROR: i32 = 22;

/// Ensure a boot artifact exists in a hypervisor's local store.
///
/// Tries the whole file first; a 404 switches to split-part fetching
/// (`.partaa`, `.partab`, …) with reassembly, optional checksum
/// verification, and part cleanup. Oversized artifacts are published
/// split because hosting services cap per-file size.
pub struct EnsureImageAction {
    pub image: String,
    /// Context key holding the hypervisor address; None targets the
    /// run's host directly.
    pub hypervisor_key: Option<String>,
    /// Base URL the artifacts are published under.
    pub artifact_base: String,
    /// Bearer token when the artifacts sit behind the repo server.
    pub bearer: Option<String>,
}

impl EnsureImageAction {
    fn curl(&self, dest: &str, url: &str) -> String {
        let auth = match &self.bearer {
            Some(token) if !token.is_empty() => {
                format!(" -H {}", shell_quote(&format!("Authorization: Bearer {}", token)))
            }
            _ => String::new(),
        };
        format!(
            "curl -fsSkL{} -o {} {}",
            auth,
            shell_quote(dest),
            shell_quote(url)
        )
    }

    fn file_name(&self) -> String {
        format!("{}.img", self.image)
    }
}

impl Action for EnsureImageAction {
    fn descriptor(&self) -> ActionDescriptor {
        let mut descriptor = ActionDescriptor::new(format!("ensure-image-{}", self.image));
        if let Some(key) = &self.hypervisor_key {
            descriptor = descriptor.requires(key.clone());
        }
        descriptor
    }

    fn execute(&self, host: &HostConfig, ctx: &Context) -> ActionResult {
        let hv = match &self.hypervisor_key {
            Some(key) => match ctx.get(key) {
                Some(address) => address,
                None => {
                    return ActionResult::fail(
                        ErrorKind::Internal,
                        format!("No {} in context", key),
                    )
                }
            },
            None => host.address.as_str(),
        };
        let user = &host.admin_user;

        let file = self.file_name();
        let dest = format!("{}/{}", IMAGE_DIR, file);

        // Post-condition check first: an existing artifact wins.
        let probe = format!("test -f {} && echo present", shell_quote(&dest));
        if let Ok((0, stdout, _)) = shell::run_ssh(hv, user, &probe, PROBE_TIMEOUT) {
            if stdout.contains("present") {
                return ActionResult::ok(format!("Image {} already present", file));
            }
        }

        let mkdir = format!("mkdir -p {}", IMAGE_DIR);
        let _ = shell::run_ssh(hv, user, &mkdir, PROBE_TIMEOUT);

        // Whole-file fetch.
        let url = format!("{}/{}", self.artifact_base, file);
        let tmp = format!("{}.tmp", dest);
        let fetch = format!(
            "{} && mv {} {}",
            self.curl(&tmp, &url),
            shell_quote(&tmp),
            shell_quote(&dest)
        );
        match shell::run_ssh(hv, user, &fetch, FETCH_TIMEOUT) {
            Ok((0, _, _)) => return self.verify_checksum(hv, user, &dest),
            Ok((rc, _, stderr)) if rc != CURL_HTTP_ERROR => {
                return ActionResult::fail(
                    ErrorKind::NotReady,
                    format!("Fetch of {} failed (exit {}): {}", url, rc, stderr.trim()),
                );
            }
            Err(e) => return ActionResult::fail(ErrorKind::Internal, e.to_string()),
            _ => {}
        }

        // 404 on the base name: look for split parts.
        let mut fetched = 0usize;
        loop {
            let suffix = part_suffix(fetched);
            let part_url = format!("{}.part{}", url, suffix);
            let part_dest = format!("{}.part{}", dest, suffix);
            match shell::run_ssh(hv, user, &self.curl(&part_dest, &part_url), FETCH_TIMEOUT) {
                Ok((0, _, _)) => fetched += 1,
                Ok((rc, _, _)) if rc == CURL_HTTP_ERROR && fetched > 0 => break,
                Ok((rc, _, stderr)) => {
                    let kind = if rc == CURL_HTTP_ERROR {
                        ErrorKind::NotFound
                    } else {
                        ErrorKind::NotReady
                    };
                    return ActionResult::fail(
                        kind,
                        format!(
                            "Image {} unavailable at {} (exit {}): {}",
                            file,
                            self.artifact_base,
                            rc,
                            stderr.trim()
                        ),
                    );
                }
                Err(e) => return ActionResult::fail(ErrorKind::Internal, e.to_string()),
            }
        }

        // Shell glob sorts partaa, partab, … alphabetically, which is
        // exactly the reassembly order.
        let reassemble = format!(
            "cat {dest}.part* > {dest} && rm -f {dest}.part*",
            dest = shell_quote(&dest)
        );
        if let Ok((rc, _, stderr)) = shell::run_ssh(hv, user, &reassemble, FETCH_TIMEOUT) {
            if rc != 0 {
                return ActionResult::fail(
                    ErrorKind::Internal,
                    format!("Reassembly of {} failed: {}", file, stderr.trim()),
                );
            }
        }

        let verified = self.verify_checksum(hv, user, &dest);
        if verified.success {
            return ActionResult::ok(format!(
                "Image {} reassembled from {} parts",
                file, fetched
            ));
        }
        verified
    }
}

impl EnsureImageAction {
    /// Verify against an accompanying checksum when one is published;
    /// a missing checksum file is not an error.
    fn verify_checksum(&self, hv: &str, user: &str, dest: &str) -> ActionResult {
        let file = self.file_name();
        let sum_url = format!("{}/{}.sha256", self.artifact_base, file);
        let sum_dest = format!("{}.sha256", dest);

        match shell::run_ssh(hv, user, &self.curl(&sum_dest, &sum_url), PROBE_TIMEOUT) {
            Ok((0, _, _)) => {}
            _ => return ActionResult::ok(format!("Image {} ready (no checksum published)", file)),
        }

        let check = format!(
            "cd {} && sha256sum -c {} && rm -f {}",
            IMAGE_DIR,
            shell_quote(&format!("{}.sha256", file)),
            shell_quote(&format!("{}.sha256", file)),
        );
        match shell::run_ssh(hv, user, &check, PROBE_TIMEOUT) {
            Ok((0, _, _)) => ActionResult::ok(format!("Image {} verified", file)),
            Ok((_, _, stderr)) => ActionResult::fail(
                ErrorKind::Malformed,
                format!("Checksum mismatch for {}: {}", file, stderr.trim()),
            ),
            Err(e) => ActionResult::fail(ErrorKind::Internal, e.to_string()),
        }
    }
}

/// Split-part suffixes as produced by `split`: aa, ab, …, az, ba, …
pub fn part_suffix(index: usize) -> String {
    let first = b'a' + (index / 26) as u8;
    let second = b'a' + (index % 26) as u8;
    String::from_utf8(vec![first, second]).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shell_mock;

    fn host() -> HostConfig {
        let mut host = HostConfig::local("pve1");
        host.address = "192.0.2.5".to_string();
        host
    }

    fn action() -> EnsureImageAction {
        EnsureImageAction {
            image: "deb12".to_string(),
            hypervisor_key: None,
            artifact_base: "https://192.0.2.1:44443/images.git/artifacts".to_string(),
            bearer: None,
        }
    }

    #[test]
    fn test_part_suffix_sequence() {
        assert_eq!(part_suffix(0), "aa");
        assert_eq!(part_suffix(1), "ab");
        assert_eq!(part_suffix(25), "az");
        assert_eq!(part_suffix(26), "ba");
        assert_eq!(part_suffix(27), "bb");
    }

    #[test]
    fn test_existing_image_short_circuits() {
        let _guard = shell_mock::install();
        shell_mock::expect("test -f /var/lib/vz/template/iso/deb12.img", 0, "present", "");

        let result = action().execute(&host(), &Context::new());
        assert!(result.success);
        assert!(result.message.contains("already present"));
        // No fetch attempted.
        assert!(!shell_mock::commands_seen().iter().any(|c| c.contains("curl")));
    }

    #[test]
    fn test_whole_file_fetch() {
        let _guard = shell_mock::install();
        shell_mock::expect("test -f", 1, "", "");
        shell_mock::expect("mkdir -p", 0, "", "");
        shell_mock::expect("deb12.img.sha256", CURL_HTTP_ERROR, "", "404");
        shell_mock::expect("curl", 0, "", "");

        let result = action().execute(&host(), &Context::new());
        assert!(result.success, "{}", result.message);
    }

    #[test]
    fn test_split_parts_reassembled() {
        let _guard = shell_mock::install();
        shell_mock::expect("test -f", 1, "", "");
        shell_mock::expect("mkdir -p", 0, "", "");
        // Base fetch 404s.
        shell_mock::expect_times("deb12.img.tmp", 1, CURL_HTTP_ERROR, "", "404");
        // Two parts, then 404 ends the sequence.
        shell_mock::expect_times("partaa", 1, 0, "", "");
        shell_mock::expect_times("partab", 1, 0, "", "");
        shell_mock::expect_times("partac", 1, CURL_HTTP_ERROR, "", "404");
        shell_mock::expect("cat ", 0, "", "");
        shell_mock::expect("deb12.img.sha256", CURL_HTTP_ERROR, "", "404");

        let result = action().execute(&host(), &Context::new());
        assert!(result.success, "{}", result.message);
    }

    #[test]
    fn test_missing_artifact_is_not_found() {
        let _guard = shell_mock::install();
        shell_mock::expect("test -f", 1, "", "");
        shell_mock::expect("mkdir -p", 0, "", "");
        // Base and first part both 404.
        shell_mock::expect("curl", CURL_HTTP_ERROR, "", "404");

        let result = action().execute(&host(), &Context::new());
        assert!(!result.success);
        assert_eq!(result.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_checksum_mismatch_fails() {
        let _guard = shell_mock::install();
        shell_mock::expect("test -f", 1, "", "");
        shell_mock::expect("mkdir -p", 0, "", "");
        shell_mock::expect("sha256sum -c", 1, "", "deb12.img: FAILED");
        shell_mock::expect("curl", 0, "", "");

        let result = action().execute(&host(), &Context::new());
        assert!(!result.success);
        assert_eq!(result.kind(), ErrorKind::Malformed);
    }
}
