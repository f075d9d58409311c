use assert_cmd::Command;
use predicates::prelude::*;

fn homestak() -> Command {
    #[allow(deprecated)]
    Command::cargo_bin("homestak").unwrap()
}

#[test]
fn test_help_exits_successfully() {
    homestak().arg("--help").assert().success();
}

#[test]
fn test_version_exits_successfully() {
    homestak()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("homestak"));
}

#[test]
fn test_no_args_shows_usage() {
    homestak()
        .assert()
        .failure()
        .stderr(predicate::str::contains("Usage"));
}

#[test]
fn test_unknown_subcommand_fails() {
    homestak()
        .arg("nonexistent")
        .assert()
        .failure()
        .stderr(predicate::str::contains("unrecognized subcommand"));
}

#[test]
fn test_help_lists_all_subcommands() {
    let assert = homestak().arg("--help").assert().success();
    let output = String::from_utf8(assert.get_output().stdout.clone()).unwrap();

    for cmd in ["apply", "destroy", "test", "server", "token"] {
        assert!(
            output.contains(cmd),
            "Help output should list '{}' subcommand",
            cmd
        );
    }
}

#[test]
fn test_apply_requires_host() {
    homestak()
        .args(["apply", "s1"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--host"));
}

#[test]
fn test_apply_unknown_manifest_fails() {
    let site = tempfile::TempDir::new().unwrap();
    let state = tempfile::TempDir::new().unwrap();
    homestak()
        .env("HOMESTAK_SITE_DIR", site.path())
        .env("HOMESTAK_STATE_DIR", state.path())
        .args(["apply", "does-not-exist", "-H", "localhost"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not found"));
}

#[test]
fn test_apply_dry_run_previews_plan() {
    let site = tempfile::TempDir::new().unwrap();
    let state = tempfile::TempDir::new().unwrap();
    std::fs::create_dir_all(site.path().join("manifests")).unwrap();
    std::fs::write(
        site.path().join("manifests/s1.yaml"),
        "schema_version: 2\nname: s1\nnodes:\n  - {name: a, type: vm, preset: small, image: deb12, vmid: 99100}\n",
    )
    .unwrap();

    homestak()
        .env("HOMESTAK_SITE_DIR", site.path())
        .env("HOMESTAK_STATE_DIR", state.path())
        .args(["apply", "s1", "-H", "localhost", "--dry-run"])
        .assert()
        .success()
        .stdout(predicate::str::contains("DRY-RUN apply"))
        .stdout(predicate::str::contains("a: vm (root) [local]"));
}

#[test]
fn test_dry_run_structured_output_emits_trailer() {
    let site = tempfile::TempDir::new().unwrap();
    let state = tempfile::TempDir::new().unwrap();
    std::fs::create_dir_all(site.path().join("manifests")).unwrap();
    std::fs::write(
        site.path().join("manifests/s1.yaml"),
        "schema_version: 2\nname: s1\nnodes:\n  - {name: a, type: vm, vmid: 99100}\n",
    )
    .unwrap();

    let assert = homestak()
        .env("HOMESTAK_SITE_DIR", site.path())
        .env("HOMESTAK_STATE_DIR", state.path())
        .args([
            "apply",
            "s1",
            "-H",
            "localhost",
            "--dry-run",
            "--structured-output",
        ])
        .assert()
        .success();

    let stdout = String::from_utf8(assert.get_output().stdout.clone()).unwrap();
    let last = stdout
        .lines()
        .rev()
        .find(|line| !line.trim().is_empty())
        .expect("trailer line");
    let trailer: serde_json::Value = serde_json::from_str(last).expect("trailer is JSON");
    assert_eq!(trailer["scenario"], "apply");
    assert_eq!(trailer["success"], true);
}

#[test]
fn test_destroy_requires_confirmation_when_structured() {
    let site = tempfile::TempDir::new().unwrap();
    let state = tempfile::TempDir::new().unwrap();
    std::fs::create_dir_all(site.path().join("manifests")).unwrap();
    std::fs::write(
        site.path().join("manifests/s1.yaml"),
        "schema_version: 2\nname: s1\nnodes:\n  - {name: a, type: vm, vmid: 99100}\n",
    )
    .unwrap();

    homestak()
        .env("HOMESTAK_SITE_DIR", site.path())
        .env("HOMESTAK_STATE_DIR", state.path())
        .args(["destroy", "s1", "-H", "localhost", "--structured-output"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--yes"));
}

#[test]
fn test_invalid_manifest_is_rejected() {
    let site = tempfile::TempDir::new().unwrap();
    let state = tempfile::TempDir::new().unwrap();
    std::fs::create_dir_all(site.path().join("manifests")).unwrap();
    // A vm node hosting a child violates the leaf rule.
    std::fs::write(
        site.path().join("manifests/bad.yaml"),
        "schema_version: 2\nname: bad\nnodes:\n  - {name: leaf, type: vm}\n  - {name: child, type: vm, parent: leaf}\n",
    )
    .unwrap();

    homestak()
        .env("HOMESTAK_SITE_DIR", site.path())
        .env("HOMESTAK_STATE_DIR", state.path())
        .args(["apply", "bad", "-H", "localhost", "--dry-run"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("cannot host children"));
}

#[test]
fn test_manifest_json_inline() {
    let site = tempfile::TempDir::new().unwrap();
    let state = tempfile::TempDir::new().unwrap();

    homestak()
        .env("HOMESTAK_SITE_DIR", site.path())
        .env("HOMESTAK_STATE_DIR", state.path())
        .args([
            "apply",
            "--manifest-json",
            r#"{"schema_version":2,"name":"inline","nodes":[{"name":"a","type":"vm","vmid":99100}]}"#,
            "-H",
            "localhost",
            "--dry-run",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("DRY-RUN apply: inline"));
}

#[test]
fn test_server_status_not_running() {
    let run = tempfile::TempDir::new().unwrap();
    homestak()
        .env("HOMESTAK_RUN_DIR", run.path())
        .args(["server", "status", "--port", "45999"])
        .assert()
        .failure()
        .stdout(predicate::str::contains("not running"));
}

#[test]
fn test_server_status_json() {
    let run = tempfile::TempDir::new().unwrap();
    let assert = homestak()
        .env("HOMESTAK_RUN_DIR", run.path())
        .args(["server", "status", "--port", "45998", "--json"])
        .assert()
        .failure();

    let stdout = String::from_utf8(assert.get_output().stdout.clone()).unwrap();
    let status: serde_json::Value = serde_json::from_str(stdout.trim()).unwrap();
    assert_eq!(status["running"], false);
    assert_eq!(status["healthy"], false);
}

#[test]
fn test_token_inspect_garbage_fails() {
    homestak()
        .args(["token", "inspect", "not-a-token"])
        .assert()
        .failure();
}
