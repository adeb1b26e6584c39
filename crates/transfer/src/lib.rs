//! Multi-channel chunked file transfer between two peers.
//!
//! Files are partitioned across N independent ordered data channels
//! (no file is ever assigned twice), streamed in bounded chunks under
//! backlog-based flow control, and confirmed per file by hash-verified
//! completion receipts. Channels tear down only after a mutual close
//! handshake, and a dropped connection yields a [`TransferSnapshot`]
//! from which the recovery layer resumes the unconfirmed remainder.

mod manifest;
mod negotiator;
mod streamer;
mod tracker;

pub mod channel;
pub mod orchestrator;
pub mod types;

pub use channel::{ChannelState, ChannelTransport};
pub use manifest::{ManifestValidator, build_manifests, validate_file_path};
pub use negotiator::{MAX_CHANNELS, negotiate};
pub use orchestrator::TransferOrchestrator;
pub use tracker::DeliveryGuard;
pub use types::{
    ChannelAssignment, ConnectionActivity, FileTransferState, SessionEvent, SessionOutcome,
    TransferSnapshot, TransferStatus, TransferableFile, checksum_bytes,
};

use std::time::Duration;

/// Errors produced by the transfer engine.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("protocol error: {0}")]
    Protocol(#[from] skiff_protocol::ProtocolError),

    #[error("manifest mismatch: {0}")]
    ManifestMismatch(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("channel {channel_index} failed: {reason}")]
    ChannelFailed { channel_index: usize, reason: String },

    #[error("channels not registered for peer: {0}")]
    ChannelsNotRegistered(String),

    #[error("session already active for peer: {0}")]
    SessionActive(String),

    #[error("cancelled")]
    Cancelled,
}

/// Tuning parameters for a transfer session.
///
/// The chunk size and flow-control marks are conservative defaults for
/// message-based transports with a practical message limit around 64 KB;
/// adjust per deployment rather than hard-coding call sites.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Maximum payload bytes per chunk frame.
    pub chunk_size: usize,
    /// Backlog level above which a channel's streamer suspends.
    pub high_water: usize,
    /// Backlog level below which a suspended streamer resumes.
    pub low_water: usize,
    /// Send attempts per chunk before the channel is declared failed.
    pub chunk_retry_limit: u32,
    /// Pause between chunk send retries.
    pub retry_delay: Duration,
    /// Poll interval while waiting for backlog to drain.
    pub backlog_poll: Duration,
    /// A connection counts as transferring if a send or receive happened
    /// within this window.
    pub grace_window: Duration,
    /// Bounded size of the delivered-content dedup set.
    pub dedup_capacity: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: 16 * 1024,
            high_water: 1024 * 1024,
            low_water: 256 * 1024,
            chunk_retry_limit: 3,
            retry_delay: Duration::from_millis(50),
            backlog_poll: Duration::from_millis(10),
            grace_window: Duration::from_secs(5),
            dedup_capacity: 1000,
        }
    }
}
