use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Why a delivery attempt gave up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    /// The target endpoint could not be dialed.
    Unreachable,
    /// The target was dialed but no response arrived in time.
    Timeout,
    /// The target answered and refused the message.
    Rejected,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::Unreachable => write!(f, "unreachable"),
            FailureKind::Timeout => write!(f, "timeout"),
            FailureKind::Rejected => write!(f, "rejected"),
        }
    }
}

/// Crate-wide error taxonomy. Protocol-level failures (`InitTimeout`,
/// `ThresholdNotMet`) are also recorded on the computation record so they are
/// observable through `await_result`.
#[derive(Debug, Error)]
pub enum Error {
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("coordinator did not acknowledge init within the init window")]
    InitTimeout,

    #[error("aligned participant set smaller than the minimum threshold")]
    ThresholdNotMet,

    #[error("duplicate share from {contributor} for computation {comp_id}")]
    DuplicateShare { comp_id: String, contributor: String },

    #[error("share for computation {comp_id} arrived after the deadline")]
    LateShare { comp_id: String },

    #[error("unknown computation {0}")]
    UnknownComputation(String),

    #[error("node is shutting down")]
    ShutdownInProgress,

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("computation {comp_id} failed: {reason}")]
    ComputationFailed { comp_id: String, reason: String },

    #[error("network startup failed: {0}")]
    NetworkStartupFailed(String),

    #[error("delivery to {target} failed: {kind}")]
    Delivery { target: String, kind: FailureKind },

    #[error("store error: {0}")]
    Store(String),

    #[error("fatal: {0}")]
    Fatal(String),
}

impl Error {
    /// Transient errors may be retried; everything else surfaces unchanged.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transient(_))
    }

    pub fn precondition(msg: impl Into<String>) -> Self {
        Error::PreconditionFailed(msg.into())
    }
}

impl From<sled::Error> for Error {
    fn from(err: sled::Error) -> Self {
        match err {
            sled::Error::Io(e) => Error::Transient(format!("store io: {e}")),
            sled::Error::Corruption { .. } | sled::Error::ReportableBug(_) => {
                Error::Fatal(format!("store corruption: {err}"))
            }
            other => Error::Store(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Store(format!("encoding: {err}"))
    }
}
