//! Recovery session store.
//!
//! A [`RecoverySession`] survives independently of any single connection
//! attempt: it owns the transfer snapshot and the parameters needed to
//! rebuild the transport, and it tracks how far the retry budget has
//! been spent.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Instant;

use skiff_transfer::TransferSnapshot;
use tracing::{debug, info};
use uuid::Uuid;

/// Opaque connection parameters the transport factory needs to rebuild
/// a peer connection (signaling endpoints, credentials, channel count).
/// This layer stores and forwards them without interpretation.
#[derive(Debug, Clone)]
pub struct ConnectionParams(pub String);

/// Lifecycle of a recoverable peer session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryState {
    /// Transfer in progress over a live connection.
    Active,
    /// Connection lost; recovery not yet started.
    Dropped,
    /// Reconnection attempt in progress.
    Recovering { attempt: u32 },
    /// Transport re-established; transfer not yet resumed.
    Reconnected,
    /// Transfer resumed over the new transport.
    ResumedTransferring,
    /// Automatic recovery gave up; manual rendezvous required.
    RetriesExhausted,
    /// Session finished; nothing left to recover.
    Closed,
}

/// Everything needed to resume one dropped transfer session.
#[derive(Debug, Clone)]
pub struct RecoverySession {
    pub session_id: String,
    pub peer_id: String,
    pub params: ConnectionParams,
    pub snapshot: TransferSnapshot,
    pub state: RecoveryState,
    pub retry_count: u32,
    pub last_attempt: Option<Instant>,
}

/// In-memory store of recoverable sessions, keyed by session ID.
#[derive(Debug, Default)]
pub struct SessionStore {
    sessions: RwLock<HashMap<String, RecoverySession>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Captures a dropped session for later recovery and returns its ID.
    ///
    /// The transfer snapshot already carries the original session ID, so
    /// both peers key recovery off the same identifier; a fresh ID is
    /// minted only if the snapshot somehow lacks one.
    pub fn capture(
        &self,
        peer_id: impl Into<String>,
        params: ConnectionParams,
        snapshot: TransferSnapshot,
    ) -> String {
        let peer_id = peer_id.into();
        let session_id = if snapshot.session_id.is_empty() {
            Uuid::new_v4().to_string()
        } else {
            snapshot.session_id.clone()
        };
        info!(
            peer = %peer_id,
            session = %session_id,
            pending = snapshot.pending_files.len(),
            delivered = snapshot.delivered_files.len(),
            "captured recovery session"
        );
        self.sessions.write().unwrap().insert(
            session_id.clone(),
            RecoverySession {
                session_id: session_id.clone(),
                peer_id,
                params,
                snapshot,
                state: RecoveryState::Dropped,
                retry_count: 0,
                last_attempt: None,
            },
        );
        session_id
    }

    pub fn get(&self, session_id: &str) -> Option<RecoverySession> {
        self.sessions.read().unwrap().get(session_id).cloned()
    }

    pub fn state(&self, session_id: &str) -> Option<RecoveryState> {
        self.sessions
            .read()
            .unwrap()
            .get(session_id)
            .map(|s| s.state.clone())
    }

    pub fn set_state(&self, session_id: &str, state: RecoveryState) {
        if let Some(session) = self.sessions.write().unwrap().get_mut(session_id) {
            debug!(session = session_id, state = ?state, "recovery state changed");
            session.state = state;
        }
    }

    /// Bumps the retry counter and stamps the attempt time. Returns the
    /// new count.
    pub fn record_attempt(&self, session_id: &str) -> Option<u32> {
        self.sessions
            .write()
            .unwrap()
            .get_mut(session_id)
            .map(|session| {
                session.retry_count += 1;
                session.last_attempt = Some(Instant::now());
                session.state = RecoveryState::Recovering {
                    attempt: session.retry_count,
                };
                session.retry_count
            })
    }

    /// Replaces the stored snapshot after a partially successful resume.
    pub fn update_snapshot(&self, session_id: &str, snapshot: TransferSnapshot) {
        if let Some(session) = self.sessions.write().unwrap().get_mut(session_id) {
            session.snapshot = snapshot;
        }
    }

    /// Removes a finished session.
    pub fn remove(&self, session_id: &str) -> Option<RecoverySession> {
        self.sessions.write().unwrap().remove(session_id)
    }

    pub fn len(&self) -> usize {
        self.sessions.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().unwrap().is_empty()
    }
}
