// homestak-server: long-lived HTTPS endpoint serving resolved specs
// (provisioning-token auth) and git-over-HTTP repo snapshots
// (bearer auth), daemonized with a PID file.

pub mod auth;
pub mod daemon;
pub mod httpd;
pub mod repos;
pub mod specs;
pub mod tls;

pub use httpd::{run_blocking, ServeOptions, DEFAULT_BIND, DEFAULT_PORT};
