//! Error types for the reconciliation core.

use thiserror::Error;

use crate::policy::ConnectionPolicy;

/// A fan-out policy's arity precondition was not met.
///
/// Recovered inside the policy engine; callers only ever see an empty result.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{policy} policy violated: {reason}")]
pub struct PolicyViolation {
    pub policy: ConnectionPolicy,
    pub reason: String,
}

impl PolicyViolation {
    pub fn new(policy: ConnectionPolicy, reason: impl Into<String>) -> Self {
        Self {
            policy,
            reason: reason.into(),
        }
    }
}

/// Failures talking to the graph backend.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("failed to spawn {command}: {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },

    #[error("{command} exited with {status}: {stderr}")]
    CommandFailed {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("{command} timed out after {timeout_ms}ms")]
    Timeout { command: String, timeout_ms: u64 },

    #[error("port not found: {0}")]
    UnknownPort(String),

    #[error("connect refused: {0}")]
    Refused(String),
}

/// A policy name that is not one of the known fan-out rules.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown connection policy: {0}")]
pub struct UnknownPolicy(pub String);
