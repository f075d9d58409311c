use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Initialize the global tracing subscriber.
///
/// All log output goes to stderr: stdout is reserved for previews and
/// the structured-output trailer. `--verbose` raises the default
/// level; `RUST_LOG` overrides everything.
pub fn init(verbose: bool) {
    let default_filter = if verbose {
        "homestak=debug,info"
    } else {
        "homestak=info,warn"
    };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let layer = fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact();

    // A second init (tests, nested calls) is a no-op.
    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(layer)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        init(false);
        init(true);
    }
}
