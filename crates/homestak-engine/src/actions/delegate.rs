use std::collections::BTreeMap;
use std::time::Duration;

use homestak_core::cancel::CancelToken;
use homestak_core::config::HostConfig;
use homestak_core::context::Context;
use homestak_core::error::ErrorKind;

use crate::action::{Action, ActionDescriptor, ActionResult};
use crate::streamer::{run_streaming, StreamRequest, Transport};

/// Run the engine recursively on a child hypervisor over the
/// interactive channel, importing an allow-list of context keys from
/// the child's structured-result trailer.
///
/// Whatever specific kind the child failed with, the parent records
/// `remote-failure`; the child's own trailer carries the specifics.
pub struct DelegateSubtreeAction {
    pub node: String,
    pub address_key: String,
    pub user: String,
    pub command: String,
    pub env: Vec<(String, String)>,
    /// Context keys imported from the child's trailer; unlisted keys
    /// are discarded.
    pub allow_keys: Vec<String>,
    pub timeout: Duration,
    pub cancel: CancelToken,
}

impl Action for DelegateSubtreeAction {
    fn descriptor(&self) -> ActionDescriptor {
        let mut descriptor = ActionDescriptor::new(format!("delegate-{}", self.node))
            .requires(self.address_key.clone());
        for key in &self.allow_keys {
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

        let request = StreamRequest {
            transport: Transport::Ssh {
                host: address.to_string(),
                user: self.user.clone(),
            },
            command: self.command.clone(),
            env: self.env.clone(),
            timeout: self.timeout,
            cancel: self.cancel.clone(),
            label: format!("delegate-{}", self.node),
        };

        let outcome = run_streaming(&request);

        if !outcome.success {
            let kind = match outcome.error_kind {
                Some(ErrorKind::Timeout) => ErrorKind::Timeout,
                Some(ErrorKind::Cancelled) => ErrorKind::Cancelled,
                _ => ErrorKind::RemoteFailure,
            };
            return ActionResult::fail(
                kind,
                outcome
                    .error
                    .unwrap_or_else(|| "delegated run failed".to_string()),
            );
        }

        let mut additions = BTreeMap::new();
        for key in &self.allow_keys {
            if let Some(value) = outcome.context.get(key) {
                additions.insert(key.clone(), value.clone());
            }
        }

        ActionResult::ok_with(
            format!(
                "Delegated run on {} completed in {:.1}s",
                address, outcome.duration_seconds
            ),
            additions,
        )
    }
}
