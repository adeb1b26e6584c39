//! Session recovery for dropped peer connections.
//!
//! When a transfer session drops, its [`skiff_transfer::TransferSnapshot`]
//! is captured into a [`SessionStore`] together with the connection
//! parameters needed to rebuild the transport. The
//! [`ReconnectionCoordinator`] then re-establishes the connection through
//! a relay peer with exponential backoff and resumes the unconfirmed
//! remainder of the transfer.

mod backoff;
mod session;

pub mod coordinator;

pub use backoff::RetrySchedule;
pub use coordinator::{ConnectionFactory, ReconnectionCoordinator, RelaySignaling};
pub use session::{ConnectionParams, RecoverySession, RecoveryState, SessionStore};

/// Errors produced by the recovery layer.
#[derive(Debug, thiserror::Error)]
pub enum RecoveryError {
    #[error("unknown recovery session: {0}")]
    UnknownSession(String),

    #[error("relay signaling failed: {0}")]
    Signaling(String),

    #[error("connection establishment failed: {0}")]
    Connect(String),

    #[error("reconnection attempt timed out")]
    Timeout,

    #[error("automatic recovery exhausted after {0} attempts")]
    RetriesExhausted(u32),

    #[error("resumed session failed terminally: {0}")]
    SessionFailed(String),

    #[error("cancelled")]
    Cancelled,

    #[error(transparent)]
    Transfer(#[from] skiff_transfer::TransferError),
}
