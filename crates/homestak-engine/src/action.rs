use std::collections::BTreeMap;

use tracing::warn;

use homestak_core::cancel::CancelToken;
use homestak_core::config::HostConfig;
use homestak_core::context::Context;
use homestak_core::error::ErrorKind;

/// Delay schedule applied between probe retries: an initial attempt
/// plus one retry after each listed delay.
pub const PROBE_RETRY_DELAYS: [std::time::Duration; 3] = [
    std::time::Duration::from_secs(2),
    std::time::Duration::from_secs(5),
    std::time::Duration::from_secs(10),
];

/// What an action reads and produces, used by dry-run previews.
#[derive(Debug, Clone)]
pub struct ActionDescriptor {
    pub name: String,
    /// Context keys the action reads.
    pub requires: Vec<String>,
    /// Context keys the action may add on success.
    pub yields: Vec<String>,
}

impl ActionDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            requires: Vec::new(),
            yields: Vec::new(),
        }
    }

    pub fn requires(mut self, key: impl Into<String>) -> Self {
        self.requires.push(key.into());
        self
    }

    pub fn yields(mut self, key: impl Into<String>) -> Self {
        self.yields.push(key.into());
        self
    }
}

/// Outcome of one action invocation. Failures carry a kind from the
/// closed taxonomy; successes may carry context additions which the
/// executor, as the sole applier, merges into the run context.
#[derive(Debug, Clone)]
pub struct ActionResult {
    pub success: bool,
    pub message: String,
    pub context_additions: BTreeMap<String, String>,
    pub error_kind: Option<ErrorKind>,
}

impl ActionResult {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            context_additions: BTreeMap::new(),
            error_kind: None,
        }
    }

    pub fn ok_with(message: impl Into<String>, additions: BTreeMap<String, String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            context_additions: additions,
            error_kind: None,
        }
    }

    pub fn fail(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            context_additions: BTreeMap::new(),
            error_kind: Some(kind),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.error_kind.unwrap_or(ErrorKind::Internal)
    }
}

/// An atomic, idempotent operation against an external collaborator.
///
/// Re-invoking with the same inputs must be safe: if the effect is
/// already present the action reports success with the same context
/// additions it would have produced the first time.
pub trait Action {
    fn descriptor(&self) -> ActionDescriptor;
    fn execute(&self, host: &HostConfig, ctx: &Context) -> ActionResult;
}

/// Indirection between the executor and action execution, injectable
/// for tests.
pub trait ActionRunner {
    fn run(&mut self, action: &dyn Action, host: &HostConfig, ctx: &Context) -> ActionResult;
}

/// Default runner: checks cancellation, then executes.
pub struct LiveRunner {
    cancel: CancelToken,
}

impl LiveRunner {
    pub fn new(cancel: CancelToken) -> Self {
        Self { cancel }
    }
}

impl ActionRunner for LiveRunner {
    fn run(&mut self, action: &dyn Action, host: &HostConfig, ctx: &Context) -> ActionResult {
        if self.cancel.is_cancelled() {
            return ActionResult::fail(
                ErrorKind::Cancelled,
                format!("{} cancelled before start", action.descriptor().name),
            );
        }
        action.execute(host, ctx)
    }
}

/// Run an action, retrying `not-ready`/`unauthorized` probe failures
/// on the fixed 2/5/10 s schedule. All other kinds surface at once.
pub fn run_with_probe_retry(
    runner: &mut dyn ActionRunner,
    action: &dyn Action,
    host: &HostConfig,
    ctx: &Context,
    cancel: &CancelToken,
) -> ActionResult {
    retry_on_schedule(runner, action, host, ctx, cancel, &PROBE_RETRY_DELAYS)
}

fn retry_on_schedule(
    runner: &mut dyn ActionRunner,
    action: &dyn Action,
    host: &HostConfig,
    ctx: &Context,
    cancel: &CancelToken,
    delays: &[std::time::Duration],
) -> ActionResult {
    let name = action.descriptor().name;
    let mut result = runner.run(action, host, ctx);

    for delay in delays.iter().copied() {
        if result.success || !result.kind().retryable_on_probe() {
            return result;
        }
        warn!(
            action = %name,
            kind = %result.kind(),
            delay_secs = delay.as_secs(),
            "Probe failed, retrying"
        );
        if !cancel.sleep(delay) {
            return ActionResult::fail(ErrorKind::Cancelled, format!("{} cancelled", name));
        }
        result = runner.run(action, host, ctx);
    }

    result
}
