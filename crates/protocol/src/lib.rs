//! Wire protocol for skiff peer-to-peer file transfer.
//!
//! Two kinds of traffic share each data channel:
//!
//! - **Control messages** — JSON envelopes ([`envelope::Envelope`]) carrying
//!   manifests, receipts, close handshakes, and recovery signaling.
//! - **Chunk frames** — binary file payload slices ([`wire::ChunkFrame`]).
//!
//! See the [`wire`] module for the frame format that distinguishes the two.

pub mod constants;
pub mod envelope;
pub mod messages;
pub mod wire;

pub use constants::{MessageType, PROTOCOL_VERSION};
pub use envelope::Envelope;
pub use wire::{ChunkFrame, Frame};

/// Errors produced while encoding or decoding protocol traffic.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("path too long: {0} bytes (max {max})", max = u16::MAX)]
    PathTooLong(usize),
}
