//! Core data model for transfer sessions.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};

/// Computes SHA-256 of `data` and returns the hex-encoded digest.
pub fn checksum_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// A content-addressed file entered into a transfer session.
///
/// Immutable once constructed; the hash is the manifest contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferableFile {
    /// Relative path, unique within the session.
    pub path: String,
    /// Content size in bytes.
    pub size: u64,
    /// Hex-encoded SHA-256 of `content`.
    pub hash: String,
    /// File bytes.
    pub content: Vec<u8>,
}

impl TransferableFile {
    /// Builds a file entry, computing size and content hash.
    pub fn new(path: impl Into<String>, content: Vec<u8>) -> Self {
        let hash = checksum_bytes(&content);
        Self {
            path: path.into(),
            size: content.len() as u64,
            hash,
            content,
        }
    }
}

/// One channel's share of the outbound file set.
///
/// Across all assignments of a session, every file path appears in
/// exactly one assignment.
#[derive(Debug, Clone)]
pub struct ChannelAssignment {
    pub channel_index: usize,
    pub files: Vec<Arc<TransferableFile>>,
    /// Sum of file sizes contracted to this channel.
    pub contracted_bytes: u64,
}

/// Transfer progress of a single file in one direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

/// Per-file, per-direction transfer state.
#[derive(Debug, Clone)]
pub struct FileTransferState {
    pub path: String,
    pub hash: String,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub status: TransferStatus,
}

impl FileTransferState {
    pub fn new(path: impl Into<String>, hash: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            hash: hash.into(),
            bytes_sent: 0,
            bytes_received: 0,
            status: TransferStatus::Pending,
        }
    }
}

/// Terminal state of a transfer session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    /// Every channel reached mutual closure.
    Completed,
    /// Fatal session error (manifest mismatch, protocol violation).
    Failed(String),
    /// Connection lost or channel failure; eligible for recovery.
    Dropped,
}

/// Events surfaced to the application layer.
#[derive(Debug)]
pub enum SessionEvent {
    /// A file arrived intact, hash-verified, delivered exactly once.
    FileDelivered {
        peer_id: String,
        path: String,
        hash: String,
        data: Vec<u8>,
    },
    /// Outbound progress (confirmed bytes over contracted bytes).
    Progress {
        peer_id: String,
        bytes_transferred: u64,
        total_bytes: u64,
    },
    /// The session reached mutual closure on every channel.
    SessionComplete { peer_id: String },
    /// The session failed terminally.
    SessionFailed { peer_id: String, reason: String },
    /// The peer announced its completed-file set after reconnecting.
    RecoveryRequested {
        peer_id: String,
        session_id: String,
        completed_files: Vec<String>,
    },
    /// Automatic recovery is exhausted; a new rendezvous is required.
    ManualRecoveryNeeded {
        peer_id: String,
        recovery_code: String,
    },
}

/// Snapshot of a session's progress, captured when the connection drops.
///
/// Owned by the recovery layer; independent of any single connection
/// attempt so it survives across reconnection tries.
#[derive(Debug, Clone)]
pub struct TransferSnapshot {
    pub peer_id: String,
    pub session_id: String,
    /// Outbound files the peer has not confirmed; resumed verbatim.
    pub pending_files: Vec<Arc<TransferableFile>>,
    /// Outbound paths confirmed by receipt. Never resent.
    pub confirmed_files: HashSet<String>,
    /// Inbound paths fully delivered locally (sent in RecoveryRequest).
    pub delivered_files: HashSet<String>,
    /// Hashes of the delivered inbound files.
    pub delivered_hashes: HashMap<String, String>,
    /// Confirmed outbound bytes at drop time.
    pub bytes_transferred: u64,
    /// Total contracted outbound bytes of the original session.
    pub total_bytes: u64,
}

/// Tracks last send/receive instants for one peer connection.
///
/// A connection still counts as transferring if *either* direction was
/// active within the grace window; tearing it down earlier loses
/// in-flight data.
#[derive(Debug)]
pub struct ConnectionActivity {
    last_send: Mutex<Instant>,
    last_recv: Mutex<Instant>,
}

impl Default for ConnectionActivity {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionActivity {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            last_send: Mutex::new(now),
            last_recv: Mutex::new(now),
        }
    }

    pub fn record_send(&self) {
        self.record_send_at(Instant::now());
    }

    pub fn record_recv(&self) {
        self.record_recv_at(Instant::now());
    }

    pub fn record_send_at(&self, at: Instant) {
        *self.last_send.lock().unwrap() = at;
    }

    pub fn record_recv_at(&self, at: Instant) {
        *self.last_recv.lock().unwrap() = at;
    }

    /// Whether the connection was active in either direction within `grace`.
    pub fn is_transferring(&self, grace: Duration) -> bool {
        self.is_transferring_at(Instant::now(), grace)
    }

    /// Liveness check against an explicit reference instant.
    pub fn is_transferring_at(&self, now: Instant, grace: Duration) -> bool {
        let sent = now.saturating_duration_since(*self.last_send.lock().unwrap());
        let received = now.saturating_duration_since(*self.last_recv.lock().unwrap());
        sent < grace || received < grace
    }
}
