//! Protocol constants shared by both peers.

use serde::{Deserialize, Serialize};

/// Protocol version sent alongside manifests. Bump on breaking changes.
pub const PROTOCOL_VERSION: i32 = 1;

/// Control message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    /// Per-channel file assignment declaration (binding contract).
    Manifest,
    /// Acceptance of a received manifest for one channel.
    ManifestAck,
    /// A file's bytes arrived intact and hash-verified.
    CompletionReceipt,
    /// Local half of the mutual channel close handshake.
    ChannelDone,
    /// Completed-file set sent by the reconnecting side for delta resume.
    RecoveryRequest,
    /// Peer's answer to a recovery request (remaining file count).
    RecoveryResponse,
    /// Relay-routed connection offer during recovery.
    ReconnectOffer,
    /// Relay-routed connection answer during recovery.
    ReconnectAnswer,
    /// Error response.
    Error,
}
