use serde::{Deserialize, Serialize};

/// Closed taxonomy of failure kinds carried in action results and
/// node states. Every terminal failure maps to exactly one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    /// A condition action timed out waiting for readiness.
    NotReady,
    /// Credential rejected (SSH, provisioning token, bearer).
    Unauthorized,
    /// Token past its validity window.
    Expired,
    /// Document failed validation.
    Malformed,
    /// State already exists or an ID collides.
    Conflict,
    /// Required resource (image, credential, node) absent.
    NotFound,
    /// Delegated sub-run returned failure.
    RemoteFailure,
    /// Streamer or overall cancellation timeout.
    Timeout,
    /// Operator interrupt.
    Cancelled,
    /// Unexpected condition (programming error).
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotReady => "not-ready",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::Expired => "expired",
            ErrorKind::Malformed => "malformed",
            ErrorKind::Conflict => "conflict",
            ErrorKind::NotFound => "not-found",
            ErrorKind::RemoteFailure => "remote-failure",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Internal => "internal",
        }
    }

    /// Kinds that warrant a bounded retry when they occur on an
    /// initial probe. Everything else surfaces immediately.
    pub fn retryable_on_probe(&self) -> bool {
        matches!(self, ErrorKind::NotReady | ErrorKind::Unauthorized)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
