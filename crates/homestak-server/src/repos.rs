use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{bail, Context as _, Result};
use tempfile::TempDir;
use tracing::{debug, info, warn};

/// Serves configured repositories as bare mirrors over the read-only
/// git dumb-HTTP protocol.
///
/// Each mirror carries a synthetic `_working` branch snapshotting the
/// operator's uncommitted changes, so bootstrapping hosts fetch
/// exactly what the operator is running. Mirrors live in a temporary
/// directory removed at shutdown.
pub struct RepoManager {
    sources: Vec<PathBuf>,
    serve_dir: TempDir,
    repos: BTreeMap<String, PathBuf>,
}

impl RepoManager {
    /// Create bare mirrors for every source repository.
    pub fn prepare(sources: &[PathBuf]) -> Result<Self> {
        let mut manager = Self {
            sources: sources.to_vec(),
            serve_dir: TempDir::new().context("Failed to create repo serve directory")?,
            repos: BTreeMap::new(),
        };
        manager.mirror_all()?;
        Ok(manager)
    }

    /// Refresh `_working` snapshots (SIGHUP). Existing mirrors are
    /// rebuilt; requests in flight keep reading the old object store
    /// until the rename completes per repo.
    pub fn refresh(&mut self) -> Result<()> {
        self.repos.clear();
        self.mirror_all()
    }

    pub fn names(&self) -> Vec<&str> {
        self.repos.keys().map(String::as_str).collect()
    }

    pub fn repo(&self, name: &str) -> Option<&Path> {
        self.repos.get(name).map(PathBuf::as_path)
    }

    fn mirror_all(&mut self) -> Result<()> {
        for source in &self.sources.clone() {
            match self.mirror_one(source) {
                Ok(name) => info!(repo = %name, "Prepared repo mirror"),
                Err(e) => warn!(source = %source.display(), error = %e, "Skipping repo"),
            }
        }
        Ok(())
    }

    fn mirror_one(&mut self, source: &Path) -> Result<String> {
        let name = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .context("Repo source has no directory name")?;
        let bare = self.serve_dir.path().join(format!("{}.git", name));
        if bare.exists() {
            std::fs::remove_dir_all(&bare)?;
        }

        run_git(
            source,
            &["clone", "--bare", "--quiet", ".", &bare.to_string_lossy()],
            &[],
        )?;

        // Snapshot uncommitted changes into _working via a throwaway
        // index; a clean tree just points _working at HEAD.
        let status = run_git(source, &["status", "--porcelain"], &[])?;
        let dirty = !String::from_utf8_lossy(&status.stdout).trim().is_empty();
        if dirty {
            let index = self.serve_dir.path().join(format!("{}.index", name));
            let index_env = [("GIT_INDEX_FILE", index.to_string_lossy().into_owned())];
            run_git(source, &["add", "-A"], &index_env)?;
            let tree = run_git(source, &["write-tree"], &index_env)?;
            let tree = String::from_utf8_lossy(&tree.stdout).trim().to_string();
            let commit = run_git(
                source,
                &["commit-tree", &tree, "-p", "HEAD", "-m", "working tree snapshot"],
                &[
                    ("GIT_AUTHOR_NAME", "homestak".to_string()),
                    ("GIT_AUTHOR_EMAIL", "server@homestak".to_string()),
                    ("GIT_COMMITTER_NAME", "homestak".to_string()),
                    ("GIT_COMMITTER_EMAIL", "server@homestak".to_string()),
                ],
            )?;
            let commit = String::from_utf8_lossy(&commit.stdout).trim().to_string();
            run_git(
                source,
                &[
                    "push",
                    "--quiet",
                    &bare.to_string_lossy(),
                    &format!("{}:refs/heads/_working", commit),
                ],
                &[],
            )?;
            let _ = std::fs::remove_file(&index);
            debug!(repo = %name, "_working carries uncommitted changes");
        } else {
            let head = run_git(&bare, &["rev-parse", "HEAD"], &[])?;
            let head = String::from_utf8_lossy(&head.stdout).trim().to_string();
            run_git(&bare, &["update-ref", "refs/heads/_working", &head], &[])?;
        }

        // Clones default to the snapshot, and the dumb protocol needs
        // its index files regenerated after the ref updates.
        run_git(&bare, &["symbolic-ref", "HEAD", "refs/heads/_working"], &[])?;
        run_git(&bare, &["update-server-info"], &[])?;

        self.repos.insert(name.clone(), bare);
        Ok(name)
    }
}

/// Split a request path like `/iac.git/info/refs` into the repo name
/// and the repo-relative remainder.
pub fn split_repo_path(path: &str) -> Option<(&str, &str)> {
    let path = path.strip_prefix('/')?;
    let (name, rest) = match path.split_once(".git/") {
        Some((name, rest)) => (name, rest),
        None => (path.strip_suffix(".git")?, ""),
    };
    if name.is_empty() || name.contains('/') {
        return None;
    }
    Some((name, rest))
}

/// Content served for one repo request, with its content type.
pub struct RepoFile {
    pub body: Vec<u8>,
    pub content_type: &'static str,
}

/// Serve a repo-relative path: git dumb-protocol files come straight
/// from the bare mirror, anything else is extracted from the
/// `_working` branch (falling back to `HEAD`) for bootstrap fetches.
pub fn serve_repo_file(bare: &Path, rest: &str) -> Result<RepoFile> {
    if rest.is_empty() {
        bail!("Empty repo path");
    }
    if rest.split('/').any(|part| part.is_empty() || part == "..") {
        bail!("Invalid repo path: {}", rest);
    }

    if is_git_protocol_path(rest) {
        let full = bare.join(rest);
        let body = std::fs::read(&full)
            .with_context(|| format!("Not found: {}", rest))?;
        let content_type = if rest.starts_with("objects/") {
            "application/octet-stream"
        } else {
            "text/plain; charset=utf-8"
        };
        return Ok(RepoFile { body, content_type });
    }

    let spec = format!("_working:{}", rest);
    let output = run_git(bare, &["show", &spec], &[]).or_else(|_| {
        let head_spec = format!("HEAD:{}", rest);
        run_git(bare, &["show", &head_spec], &[])
    })?;
    Ok(RepoFile {
        body: output.stdout,
        content_type: "application/octet-stream",
    })
}

fn is_git_protocol_path(rest: &str) -> bool {
    rest == "HEAD"
        || rest == "info/refs"
        || rest == "packed-refs"
        || rest.starts_with("objects/")
        || rest.starts_with("refs/")
        || rest.starts_with("info/")
}

fn run_git(dir: &Path, args: &[&str], envs: &[(&str, String)]) -> Result<Output> {
    let mut cmd = Command::new("git");
    cmd.arg("-C").arg(dir).args(args);
    for (key, value) in envs {
        cmd.env(key, value);
    }
    let output = cmd
        .output()
        .with_context(|| format!("Failed to run: git {}", args.join(" ")))?;
    if !output.status.success() {
        bail!(
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(output)
}
