//! Control message payloads exchanged between peers.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// One file declared in a channel manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileSpec {
    /// Relative path, unique within the session.
    pub path: String,
    /// File size in bytes.
    pub size: u64,
    /// Hex-encoded SHA-256 of the file content.
    pub hash: String,
}

/// Binding declaration: "I will send exactly these files on this channel."
///
/// Exchanged before any payload byte moves. A manifest that fails
/// validation is fatal to the session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelManifest {
    pub channel_index: usize,
    pub files: Vec<FileSpec>,
}

/// Acceptance of a received manifest for one channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestAck {
    pub channel_index: usize,
}

/// Sent by the receiver once a file's bytes are fully received and its
/// hash verified against the manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionReceipt {
    pub path: String,
    pub hash: String,
    pub channel_index: usize,
}

/// Local half of the mutual close handshake for one channel.
///
/// Sent when every file assigned to the channel is completed in both
/// directions on the sending side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelDone {
    pub channel_index: usize,
}

/// Peer-reported resource profile used by channel negotiation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceProfile {
    /// Memory the peer is willing to spend on transfer buffers, in bytes.
    pub available_memory: u64,
    /// Channel count the peer proposes.
    pub proposed_channels: usize,
}

/// Completed-file set sent by the reconnecting side after a connection
/// is re-established, so the peer can reduce its working set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryRequest {
    pub session_id: String,
    pub peer_id: String,
    pub completed_files: Vec<String>,
    pub completed_hashes: HashMap<String, String>,
}

/// Answer to a [`RecoveryRequest`]: how many files the peer still expects
/// to send after subtracting the confirmed set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryResponse {
    pub session_id: String,
    pub remaining_files: u64,
}

/// Connection offer routed through the relay peer during recovery.
///
/// The `sdp_blob` is opaque to this layer and forwarded verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconnectOffer {
    pub session_id: String,
    pub source_peer_id: String,
    pub target_peer_id: String,
    pub sdp_blob: String,
}

/// Connection answer routed through the relay peer during recovery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconnectAnswer {
    pub session_id: String,
    pub source_peer_id: String,
    pub target_peer_id: String,
    pub sdp_blob: String,
}
