//! Error taxonomy for query-state requests
//!
//! Every failure a caller can observe maps to one [`QueryStateError`] variant with
//! a stable [`code`](QueryStateError::code), so "nothing to show" can be told apart
//! from "request failed".

use std::time::Duration;

use thiserror::Error;

use crate::channel::TransportError;
use crate::host::Pid;
use crate::wire::WireError;

/// Errors surfaced by the query-state protocol
#[derive(Debug, Error)]
pub enum QueryStateError {
    #[error("backend with pid={0} not found")]
    NotFound(Pid),

    #[error("attempt to extract state of current process")]
    SelfTarget,

    #[error("permission denied")]
    PermissionDenied,

    #[error("query state module wasn't initialized yet")]
    NotInitialized,

    #[error("query execution statistics disabled")]
    StatDisabled,

    #[error("backend {0} is not running a query")]
    NotRunning(Pid),

    #[error("could not deliver signal to process {0}")]
    DeliveryFailure(Pid),

    #[error("counterpart detached from the channel while transferring from {0}")]
    TransportDetached(Pid),

    #[error("no reply from process {0} within {1:?}")]
    Timeout(Pid, Duration),

    #[error("reply tagged with epoch {got} while epoch {expected} is current")]
    StaleEpoch { expected: u64, got: u64 },

    #[error("corrupt message: {0}")]
    CorruptMessage(#[from] WireError),

    #[error("unrecognized 'format' argument: {0}")]
    InvalidFormat(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("progress of backend {0} is already being polled")]
    AlreadyPolling(Pid),

    #[error("request interrupted")]
    Interrupted,

    #[error("internal error: {0}")]
    Internal(String),
}

impl QueryStateError {
    /// Stable, machine-readable identifier for this error kind
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not-found",
            Self::SelfTarget => "self-target",
            Self::PermissionDenied => "permission-denied",
            Self::NotInitialized => "not-initialized",
            Self::StatDisabled => "stat-disabled",
            Self::NotRunning(_) => "not-running",
            Self::DeliveryFailure(_) => "delivery-failure",
            Self::TransportDetached(_) => "transport-detached",
            Self::Timeout(..) => "timeout",
            Self::StaleEpoch { .. } => "stale-epoch",
            Self::CorruptMessage(_) => "corrupt-message",
            Self::InvalidFormat(_) => "invalid-format",
            Self::InvalidArgument(_) => "invalid-argument",
            Self::AlreadyPolling(_) => "already-polling",
            Self::Interrupted => "interrupted",
            Self::Internal(_) => "internal",
        }
    }

    /// Map a failed transfer from `peer` onto the request-level taxonomy
    pub fn from_transport(peer: Pid, err: TransportError, timeout: Duration) -> Self {
        match err {
            TransportError::TimedOut => Self::Timeout(peer, timeout),
            TransportError::Detached => Self::TransportDetached(peer),
            other => Self::Internal(format!("transfer from {} failed: {}", peer, other)),
        }
    }
}

pub type Result<T> = std::result::Result<T, QueryStateError>;
