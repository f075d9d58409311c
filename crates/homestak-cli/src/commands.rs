use std::io::IsTerminal;
use std::path::PathBuf;

use anyhow::{bail, Context as _, Result};
use clap::{Args, Parser, Subcommand};

use homestak_core::cancel::{install_interrupt_handler, CancelToken};
use homestak_core::config::SiteConfig;
use homestak_core::manifest::Manifest;
use homestak_core::state::StateStore;
use homestak_core::token::{decode_claims, TokenService};
use homestak_engine::action::LiveRunner;
use homestak_engine::executor::{ExecutorOptions, NodeExecutor, Verb, DEFAULT_SERVER_PORT};
use homestak_engine::server_handle::{resolve_advertise_addr, ServerHandle};
use homestak_server::daemon;
use homestak_server::httpd::{run_blocking, ServeOptions, DEFAULT_BIND};

use crate::logging;
use crate::output;

#[derive(Parser)]
#[command(
    name = "homestak",
    version,
    about = "Recursive infrastructure orchestration for nested PVE/VM deployments"
)]
struct Cli {
    /// Raise log verbosity
    #[arg(long, global = true)]
    verbose: bool,

    /// Emit a single trailing JSON result line on stdout
    #[arg(long, global = true)]
    structured_output: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Realize a manifest: create and configure every node
    Apply(RunArgs),

    /// Tear a manifest down, leaves first
    Destroy(RunArgs),

    /// Create, verify reachability, destroy
    Test(RunArgs),

    /// Spec/repo server daemon
    Server {
        #[command(subcommand)]
        action: ServerCmd,
    },

    /// Provisioning token utilities
    Token {
        #[command(subcommand)]
        action: TokenCmd,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Manifest name under the site manifests directory
    manifest: Option<String>,

    /// Target host name (hosts/<name>.yaml in the site directory)
    #[arg(long, short = 'H')]
    host: String,

    /// Inline manifest JSON (used by subtree delegation)
    #[arg(long, conflicts_with = "manifest")]
    manifest_json: Option<String>,

    /// Load the manifest from a file path
    #[arg(long, conflicts_with_all = ["manifest", "manifest_json"])]
    manifest_file: Option<PathBuf>,

    /// Preview the plan without executing
    #[arg(long)]
    dry_run: bool,

    /// Skip destructive-operation confirmation
    #[arg(long, short = 'y')]
    yes: bool,

    /// Routable address of this machine, advertised to children
    #[arg(long)]
    self_addr: Option<String>,

    /// Spec/repo server port
    #[arg(long, default_value_t = DEFAULT_SERVER_PORT)]
    server_port: u16,
}

#[derive(Subcommand)]
enum ServerCmd {
    /// Start the HTTPS daemon (detached unless --foreground)
    Start {
        #[arg(long, default_value_t = DEFAULT_SERVER_PORT)]
        port: u16,
        #[arg(long, default_value = DEFAULT_BIND)]
        bind: String,
        /// TLS certificate path (self-signed when omitted)
        #[arg(long, requires = "key")]
        cert: Option<PathBuf>,
        /// TLS key path
        #[arg(long, requires = "cert")]
        key: Option<PathBuf>,
        /// Repository to serve as a bare mirror; repeatable
        #[arg(long)]
        repos: Vec<PathBuf>,
        /// Bearer token protecting repo endpoints (empty disables)
        #[arg(long)]
        repo_token: Option<String>,
        /// Stay attached instead of daemonizing
        #[arg(long)]
        foreground: bool,
    },
    /// Stop the daemon
    Stop {
        #[arg(long, default_value_t = DEFAULT_SERVER_PORT)]
        port: u16,
    },
    /// Daemon status
    Status {
        #[arg(long, default_value_t = DEFAULT_SERVER_PORT)]
        port: u16,
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum TokenCmd {
    /// Decode a provisioning token, optionally verifying its HMAC
    Inspect {
        token: String,
        /// Verify the signature against the site signing key
        #[arg(long)]
        verify: bool,
    },
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    match cli.command {
        Commands::Apply(args) => run_verb(Verb::Apply, args, cli.structured_output),
        Commands::Destroy(args) => run_verb(Verb::Destroy, args, cli.structured_output),
        Commands::Test(args) => run_verb(Verb::Test, args, cli.structured_output),
        Commands::Server { action } => run_server(action),
        Commands::Token { action } => run_token(action),
    }
}

fn run_verb(verb: Verb, args: RunArgs, structured: bool) -> Result<()> {
    install_interrupt_handler();
    let cancel = CancelToken::new();

    let site = SiteConfig::discover();
    let manifest = load_manifest(&site, &args)?;
    let host = site.host(&args.host)?;

    if verb == Verb::Destroy && !args.dry_run && !args.yes {
        confirm_destroy(&manifest, structured)?;
    }

    let store = StateStore::open(&manifest.name, &host.name)?;
    let advertise = resolve_advertise_addr(args.self_addr.as_deref());
    let repos = repos_from_env();
    let repo_token = site.secrets()?.repo_token.clone();
    let server = ServerHandle::local(args.server_port, advertise, repos, repo_token);

    let opts = ExecutorOptions {
        dry_run: args.dry_run,
        structured_output: structured,
        self_addr: args.self_addr.clone(),
        ..Default::default()
    };

    let mut executor = NodeExecutor::new(
        manifest,
        site,
        host,
        store,
        opts,
        Box::new(LiveRunner::new(cancel.clone())),
        server,
        cancel,
    )?;

    let report = match verb {
        Verb::Apply => executor.apply(),
        Verb::Destroy => executor.destroy(),
        Verb::Test => executor.test(),
    };

    output::emit(&report, structured);
    if !report.success {
        std::process::exit(1);
    }
    Ok(())
}

/// Manifest sources by priority: inline JSON (delegation), explicit
/// file, then a named manifest from the site directory.
fn load_manifest(site: &SiteConfig, args: &RunArgs) -> Result<Manifest> {
    if let Some(json) = &args.manifest_json {
        return Manifest::from_json(json);
    }
    if let Some(path) = &args.manifest_file {
        return Manifest::from_file(path);
    }
    let Some(name) = &args.manifest else {
        bail!("Provide a manifest name, --manifest-file, or --manifest-json");
    };
    let path = site.dir().join("manifests").join(format!("{}.yaml", name));
    Manifest::from_file(&path)
}

fn confirm_destroy(manifest: &Manifest, structured: bool) -> Result<()> {
    if structured || !std::io::stdin().is_terminal() {
        bail!("destroy requires --yes when not run interactively");
    }
    eprint!(
        "Destroy {} node(s) of manifest '{}'? [y/N] ",
        manifest.nodes.len(),
        manifest.name
    );
    let mut answer = String::new();
    std::io::stdin()
        .read_line(&mut answer)
        .context("Failed to read confirmation")?;
    if !matches!(answer.trim(), "y" | "Y" | "yes") {
        bail!("Aborted");
    }
    Ok(())
}

/// Repositories the engine-managed server publishes, from
/// `HOMESTAK_REPOS` (colon-separated paths).
fn repos_from_env() -> Vec<PathBuf> {
    std::env::var("HOMESTAK_REPOS")
        .map(|value| {
            value
                .split(':')
                .filter(|part| !part.is_empty())
                .map(PathBuf::from)
                .collect()
        })
        .unwrap_or_default()
}

fn run_server(action: ServerCmd) -> Result<()> {
    match action {
        ServerCmd::Start {
            port,
            bind,
            cert,
            key,
            repos,
            repo_token,
            foreground,
        } => {
            if foreground {
                let site = SiteConfig::discover();
                let advertised_name = hostname();
                return run_blocking(ServeOptions {
                    bind,
                    port,
                    site_dir: site.dir().to_path_buf(),
                    repos,
                    repo_token,
                    cert,
                    key,
                    advertised_name,
                });
            }

            // Re-exec ourselves detached; the daemon path appends
            // --foreground.
            let mut args = vec![
                "server".to_string(),
                "start".to_string(),
                "--port".to_string(),
                port.to_string(),
                "--bind".to_string(),
                bind,
            ];
            if let (Some(cert), Some(key)) = (&cert, &key) {
                args.push("--cert".to_string());
                args.push(cert.to_string_lossy().into_owned());
                args.push("--key".to_string());
                args.push(key.to_string_lossy().into_owned());
            }
            for repo in &repos {
                args.push("--repos".to_string());
                args.push(repo.to_string_lossy().into_owned());
            }
            if let Some(token) = &repo_token {
                args.push("--repo-token".to_string());
                args.push(token.clone());
            }
            let pid = daemon::start_detached(&args, port)?;
            println!("Server started (PID {}, port {})", pid, port);
            Ok(())
        }
        ServerCmd::Stop { port } => {
            daemon::stop(port)?;
            println!("Server stopped (port {})", port);
            Ok(())
        }
        ServerCmd::Status { port, json } => {
            let status = daemon::check_status(port);
            if json {
                println!("{}", serde_json::to_string(&status)?);
            } else if status.running {
                println!(
                    "Server running (PID {}, port {}, {})",
                    status.pid.unwrap_or_default(),
                    port,
                    if status.healthy { "healthy" } else { "unhealthy" }
                );
            } else {
                println!("Server not running (port {})", port);
            }
            if !(status.running && status.healthy) {
                std::process::exit(1);
            }
            Ok(())
        }
    }
}

fn run_token(action: TokenCmd) -> Result<()> {
    match action {
        TokenCmd::Inspect { token, verify } => {
            let claims = decode_claims(&token)?;
            println!("Claims:");
            println!("  version  (v):   {}", claims.v);
            println!("  identity (n):   {}", claims.n);
            let expiry = chrono::DateTime::from_timestamp(claims.exp, 0)
                .map(|ts| ts.to_rfc3339())
                .unwrap_or_else(|| "invalid".to_string());
            println!("  expiry   (exp): {} ({})", claims.exp, expiry);
            println!("  nonce    (non): {}", claims.non);

            if verify {
                let site = SiteConfig::discover();
                let secrets = site.secrets()?;
                let service = TokenService::from_hex_key(secrets.signing_key())?;
                match service.verify(&token) {
                    Ok(verified) => {
                        println!();
                        println!(
                            "Signature: VALID ({}s validity remaining)",
                            verified.remaining_secs
                        );
                    }
                    Err(e) => {
                        println!();
                        println!("Signature: INVALID ({})", e);
                        std::process::exit(1);
                    }
                }
            }
            Ok(())
        }
    }
}

fn hostname() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|name| name.into_string().ok())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "homestak".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_structure_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_apply_args_parse() {
        let cli = Cli::parse_from(["homestak", "apply", "s1", "-H", "pve1", "--dry-run"]);
        match cli.command {
            Commands::Apply(args) => {
                assert_eq!(args.manifest.as_deref(), Some("s1"));
                assert_eq!(args.host, "pve1");
                assert!(args.dry_run);
                assert!(!args.yes);
            }
            _ => panic!("expected apply"),
        }
    }

    #[test]
    fn test_manifest_json_conflicts_with_name() {
        let result = Cli::try_parse_from([
            "homestak",
            "apply",
            "s1",
            "-H",
            "pve1",
            "--manifest-json",
            "{}",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_structured_output_is_global() {
        let cli = Cli::parse_from([
            "homestak",
            "apply",
            "--structured-output",
            "s1",
            "-H",
            "pve1",
        ]);
        assert!(cli.structured_output);
    }

    #[test]
    fn test_server_start_args() {
        let cli = Cli::parse_from([
            "homestak",
            "server",
            "start",
            "--port",
            "44444",
            "--repos",
            "/opt/iac",
            "--repos",
            "/opt/images",
            "--repo-token",
            "tok",
            "--foreground",
        ]);
        match cli.command {
            Commands::Server {
                action:
                    ServerCmd::Start {
                        port,
                        repos,
                        repo_token,
                        foreground,
                        ..
                    },
            } => {
                assert_eq!(port, 44444);
                assert_eq!(repos.len(), 2);
                assert_eq!(repo_token.as_deref(), Some("tok"));
                assert!(foreground);
            }
            _ => panic!("expected server start"),
        }
    }

    #[test]
    fn test_cert_requires_key() {
        let result = Cli::try_parse_from([
            "homestak",
            "server",
            "start",
            "--cert",
            "/tmp/server.crt",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_repos_from_env_parsing() {
        std::env::set_var("HOMESTAK_REPOS", "/opt/iac:/opt/images:");
        let repos = repos_from_env();
        assert_eq!(repos.len(), 2);
        assert_eq!(repos[0], PathBuf::from("/opt/iac"));
        std::env::remove_var("HOMESTAK_REPOS");
    }
}
