use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};

use homestak_core::config::SiteConfig;
use homestak_core::token::TokenService;

use crate::auth;
use crate::daemon;
use crate::repos::{self, RepoManager};
use crate::specs::SpecResolver;
use crate::tls::TlsMaterial;

pub const DEFAULT_PORT: u16 = 44443;
pub const DEFAULT_BIND: &str = "0.0.0.0";

/// Window granted to in-flight connections during shutdown.
const DRAIN_WINDOW: Duration = Duration::from_secs(5);

/// Everything the foreground server needs to run.
pub struct ServeOptions {
    pub bind: String,
    pub port: u16,
    pub site_dir: PathBuf,
    pub repos: Vec<PathBuf>,
    pub repo_token: Option<String>,
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
    /// Name placed in the self-signed certificate.
    pub advertised_name: String,
}

struct AppState {
    resolver: SpecResolver,
    repos: Option<tokio::sync::RwLock<RepoManager>>,
    repo_token: String,
    tokens: Option<TokenService>,
}

/// Run the server in the foreground until SIGTERM/SIGINT.
///
/// Writes the PID file before accepting connections and removes it on
/// the way out. SIGHUP clears the spec resolver cache and refreshes
/// repo snapshots without dropping connections.
pub fn run_blocking(opts: ServeOptions) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build server runtime")?;
    runtime.block_on(serve(opts))
}

async fn serve(opts: ServeOptions) -> Result<()> {
    // More than one rustls crypto provider can be linked in; pin the
    // process-level default before any TLS config is built.
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let site = SiteConfig::at(&opts.site_dir);
    let secrets = site.secrets()?;
    let tokens = match TokenService::from_hex_key(secrets.signing_key()) {
        Ok(service) => Some(service),
        Err(e) => {
            warn!(error = %e, "Spec auth disabled");
            None
        }
    };

    let resolver = SpecResolver::new(site.specs_dir());

    let repo_token = opts
        .repo_token
        .clone()
        .or_else(|| secrets.repo_token.clone())
        .unwrap_or_default();
    let repos = if opts.repos.is_empty() {
        None
    } else {
        let manager = RepoManager::prepare(&opts.repos)?;
        info!(repos = ?manager.names(), "Serving repo mirrors");
        Some(tokio::sync::RwLock::new(manager))
    };

    // The server never speaks plain HTTP; without an operator pair we
    // generate a self-signed certificate in a temp dir.
    let tls = match (&opts.cert, &opts.key) {
        (Some(cert), Some(key)) => TlsMaterial::from_paths(cert, key)?,
        _ => TlsMaterial::self_signed(&opts.advertised_name)?,
    };
    info!(fingerprint = %tls.fingerprint, "Certificate fingerprint");

    let state = Arc::new(AppState {
        resolver,
        repos,
        repo_token,
        tokens,
    });

    let router = Router::new()
        .route("/health", get(handle_health))
        .route("/specs", get(handle_specs_list))
        .route("/spec/{identity}", get(handle_spec))
        .fallback(handle_repo)
        .with_state(Arc::clone(&state));

    let addr: SocketAddr = format!("{}:{}", opts.bind, opts.port)
        .parse()
        .with_context(|| format!("Invalid bind address {}:{}", opts.bind, opts.port))?;
    let rustls_config =
        axum_server::tls_rustls::RustlsConfig::from_pem_file(&tls.cert_path, &tls.key_path)
            .await
            .context("Failed to load TLS configuration")?;

    daemon::write_pid_file(opts.port)?;
    info!(
        bind = %addr,
        specs = ?state.resolver.list(),
        "Server listening"
    );

    let handle = axum_server::Handle::new();
    let signal_handle = handle.clone();
    let signal_state = Arc::clone(&state);
    tokio::spawn(async move {
        if let Err(e) = watch_signals(signal_handle, signal_state).await {
            error!(error = %e, "Signal handler failed");
        }
    });

    let result = axum_server::bind_rustls(addr, rustls_config)
        .handle(handle)
        .serve(router.into_make_service())
        .await;

    daemon::remove_pid_file(opts.port);
    info!("Server stopped");
    result.context("Server error")
}

async fn watch_signals(
    handle: axum_server::Handle,
    state: Arc<AppState>,
) -> Result<()> {
    let mut term = signal(SignalKind::terminate())?;
    let mut int = signal(SignalKind::interrupt())?;
    let mut hup = signal(SignalKind::hangup())?;

    loop {
        tokio::select! {
            _ = term.recv() => {
                info!("Received SIGTERM, draining connections");
                handle.graceful_shutdown(Some(DRAIN_WINDOW));
                return Ok(());
            }
            _ = int.recv() => {
                info!("Received SIGINT, draining connections");
                handle.graceful_shutdown(Some(DRAIN_WINDOW));
                return Ok(());
            }
            _ = hup.recv() => {
                info!("Received SIGHUP, clearing resolver cache");
                state.resolver.clear_cache();
                if let Some(repos) = &state.repos {
                    let mut manager = repos.write().await;
                    if let Err(e) = manager.refresh() {
                        warn!(error = %e, "Repo refresh failed");
                    }
                }
            }
        }
    }
}

async fn handle_health() -> Json<serde_json::Value> {
    Json(json!({"status": "ok"}))
}

async fn handle_specs_list(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(json!({"specs": state.resolver.list()}))
}

async fn handle_spec(
    State(state): State<Arc<AppState>>,
    Path(identity): Path<String>,
    headers: HeaderMap,
) -> Response {
    if let Err(failure) = auth::authorize_spec(&identity, &headers, state.tokens.as_ref()) {
        return auth_response(failure.status);
    }

    if !state.resolver.contains(&identity) {
        return (StatusCode::NOT_FOUND, "Not Found").into_response();
    }

    match state.resolver.resolve(&identity) {
        Ok(spec) => Json(spec).into_response(),
        Err(e) => {
            error!(identity = %identity, error = %e, "Spec resolution failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error").into_response()
        }
    }
}

async fn handle_repo(
    State(state): State<Arc<AppState>>,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    let path = uri.path().to_string();
    let Some((name, rest)) = repos::split_repo_path(&path) else {
        return (StatusCode::NOT_FOUND, "Not Found").into_response();
    };

    let Some(repos) = &state.repos else {
        return (StatusCode::NOT_FOUND, "Not Found").into_response();
    };

    if let Err(failure) = auth::authorize_repo(&headers, &state.repo_token) {
        return auth_response(failure.status);
    }

    let manager = repos.read().await;
    let Some(bare) = manager.repo(name) else {
        return (StatusCode::NOT_FOUND, "Not Found").into_response();
    };
    let bare = bare.to_path_buf();
    let rest = rest.to_string();
    drop(manager);

    // Git extraction shells out; keep it off the request threads.
    let result =
        tokio::task::spawn_blocking(move || repos::serve_repo_file(&bare, &rest)).await;

    match result {
        Ok(Ok(file)) => (
            StatusCode::OK,
            [(axum::http::header::CONTENT_TYPE, file.content_type)],
            file.body,
        )
            .into_response(),
        Ok(Err(_)) => (StatusCode::NOT_FOUND, "Not Found").into_response(),
        Err(e) => {
            error!(error = %e, "Repo task failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error").into_response()
        }
    }
}

fn auth_response(status: StatusCode) -> Response {
    if status == StatusCode::UNAUTHORIZED {
        (StatusCode::UNAUTHORIZED, "Unauthorized").into_response()
    } else {
        (status, "Internal Server Error").into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app_state_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<AppState>();
    }

    #[test]
    fn test_auth_response_bodies() {
        let resp = auth_response(StatusCode::UNAUTHORIZED);
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        let resp = auth_response(StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
