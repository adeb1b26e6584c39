//! Session orchestration: manifest exchange, frame dispatch, receipts,
//! channel closure, and the recovery seam.
//!
//! One [`TransferOrchestrator`] serves an application; it holds per-peer
//! transports and at most one active session per peer. The transport
//! adapter pushes raw inbound frames into [`TransferOrchestrator::handle_frame`];
//! everything else flows out through the event channel.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use skiff_protocol::PROTOCOL_VERSION;
use skiff_protocol::constants::MessageType;
use skiff_protocol::envelope::Envelope;
use skiff_protocol::messages::{
    ChannelDone, CompletionReceipt, ManifestAck, RecoveryRequest, RecoveryResponse,
    ResourceProfile,
};
use skiff_protocol::wire::{self, ChunkFrame, Frame};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::channel::ChannelTransport;
use crate::manifest::{ManifestValidator, build_manifests};
use crate::negotiator::negotiate;
use crate::streamer::stream_channel;
use crate::tracker::{Absorbed, CloseBoard, DeliveryGuard, Reassembly};
use crate::types::{
    ChannelAssignment, ConnectionActivity, FileTransferState, SessionEvent, SessionOutcome,
    TransferSnapshot, TransferStatus, TransferableFile,
};
use crate::{TransferConfig, TransferError};

const EVENT_CHANNEL_CAPACITY: usize = 256;
const ERROR_CODE_MANIFEST: i32 = 400;

/// Shared state of one active transfer session.
///
/// Referenced by the inbound dispatch tasks, the per-channel streamers,
/// and the `begin` caller awaiting the terminal outcome.
pub(crate) struct SessionShared {
    pub(crate) session_id: String,
    pub(crate) peer_id: String,
    pub(crate) config: TransferConfig,
    pub(crate) transport: Arc<dyn ChannelTransport>,
    pub(crate) activity: Arc<ConnectionActivity>,
    pub(crate) cancel: CancellationToken,
    pub(crate) bytes_sent: AtomicU64,

    channel_count: usize,
    outbound_files: HashMap<String, Arc<TransferableFile>>,
    /// path -> contracted outbound channel, from the local assignments.
    outbound_channels: HashMap<String, usize>,
    total_outbound: u64,
    outbound: Mutex<HashMap<String, FileTransferState>>,
    inbound: Mutex<HashMap<String, FileTransferState>>,
    /// path -> (contracted channel, declared hash), from peer manifests.
    expected: Mutex<HashMap<String, (usize, String)>>,
    validator: Mutex<ManifestValidator>,
    acks: Mutex<HashSet<usize>>,
    barrier_tx: watch::Sender<bool>,
    board: Mutex<CloseBoard>,
    reassembly: Mutex<Reassembly>,
    dedup: Mutex<DeliveryGuard>,
    confirmed_bytes: AtomicU64,
    bytes_received: AtomicU64,
    events_tx: mpsc::Sender<SessionEvent>,
    terminal_tx: watch::Sender<Option<SessionOutcome>>,
}

impl SessionShared {
    pub(crate) fn with_outbound_state(&self, path: &str, f: impl FnOnce(&mut FileTransferState)) {
        if let Some(state) = self.outbound.lock().unwrap().get_mut(path) {
            f(state);
        }
    }

    /// Blocks until both peers have accepted all manifests.
    pub(crate) async fn wait_barrier(&self) -> Result<(), TransferError> {
        let mut rx = self.barrier_tx.subscribe();
        tokio::select! {
            _ = self.cancel.cancelled() => Err(TransferError::Cancelled),
            res = rx.wait_for(|open| *open) => {
                res.map(|_| ()).map_err(|_| TransferError::Cancelled)
            }
        }
    }

    /// Records a terminal outcome; the first one wins. Returns whether
    /// this call set it.
    fn set_terminal(&self, outcome: SessionOutcome) -> bool {
        self.terminal_tx.send_if_modified(|slot| {
            if slot.is_none() {
                *slot = Some(outcome);
                true
            } else {
                false
            }
        })
    }

    async fn fail(&self, reason: String) {
        if self.set_terminal(SessionOutcome::Failed(reason.clone())) {
            error!(peer = %self.peer_id, session = %self.session_id, %reason, "session failed");
            let _ = self
                .events_tx
                .send(SessionEvent::SessionFailed {
                    peer_id: self.peer_id.clone(),
                    reason,
                })
                .await;
            self.cancel.cancel();
        }
    }

    /// Marks the session dropped (recoverable), from a channel failure
    /// or a lost connection.
    pub(crate) fn drop_session(&self, reason: &str) {
        if self.set_terminal(SessionOutcome::Dropped) {
            warn!(
                peer = %self.peer_id,
                session = %self.session_id,
                reason,
                "session dropped, eligible for recovery"
            );
            self.cancel.cancel();
        }
    }

    async fn complete(&self) {
        if self.set_terminal(SessionOutcome::Completed) {
            info!(
                peer = %self.peer_id,
                session = %self.session_id,
                bytes_sent = self.bytes_sent.load(Ordering::Relaxed),
                bytes_received = self.bytes_received.load(Ordering::Relaxed),
                "all channels closed, session complete"
            );
            let _ = self
                .events_tx
                .send(SessionEvent::SessionComplete {
                    peer_id: self.peer_id.clone(),
                })
                .await;
            self.cancel.cancel();
        }
    }

    fn send_control(&self, channel: usize, msg: &Envelope) -> Result<(), TransferError> {
        let frame = wire::encode_control(msg)?;
        self.transport.send(channel, frame)?;
        self.activity.record_send();
        Ok(())
    }

    fn send_receipt(&self, channel: usize, path: &str, hash: &str) {
        let receipt = CompletionReceipt {
            path: path.to_string(),
            hash: hash.to_string(),
            channel_index: channel,
        };
        match Envelope::carrying(MessageType::CompletionReceipt, &receipt) {
            Ok(msg) => {
                if let Err(e) = self.send_control(channel, &msg) {
                    warn!(channel, path, error = %e, "failed to send completion receipt");
                }
            }
            Err(e) => warn!(path, error = %e, "failed to encode completion receipt"),
        }
    }

    pub(crate) async fn process_frame(self: &Arc<Self>, channel: usize, bytes: Vec<u8>) {
        match wire::decode_frame(&bytes) {
            Ok(Frame::Chunk(chunk)) => self.handle_chunk(channel, chunk).await,
            Ok(Frame::Control(msg)) => self.handle_control(channel, msg).await,
            Err(e) => {
                self.fail(format!("malformed frame on channel {channel}: {e}"))
                    .await;
            }
        }
    }

    async fn handle_control(self: &Arc<Self>, channel: usize, msg: Envelope) {
        match msg.msg_type {
            MessageType::Manifest => self.handle_manifest(channel, msg).await,
            MessageType::ManifestAck => self.handle_ack(msg).await,
            MessageType::CompletionReceipt => self.handle_receipt(channel, msg).await,
            MessageType::ChannelDone => self.handle_channel_done(msg).await,
            MessageType::RecoveryRequest => {
                // Peer resumed before we learned of the drop; surface it.
                if let Ok(req) = msg.parse_payload::<RecoveryRequest>() {
                    let _ = self
                        .events_tx
                        .send(SessionEvent::RecoveryRequested {
                            peer_id: self.peer_id.clone(),
                            session_id: req.session_id,
                            completed_files: req.completed_files,
                        })
                        .await;
                }
            }
            MessageType::RecoveryResponse => {
                if let Ok(resp) = msg.parse_payload::<RecoveryResponse>() {
                    debug!(
                        session = %resp.session_id,
                        remaining = resp.remaining_files,
                        "peer acknowledged recovery request"
                    );
                }
            }
            MessageType::Error => {
                let detail = msg
                    .error
                    .map(|e| e.message)
                    .unwrap_or_else(|| "unspecified".into());
                self.fail(format!("peer reported error: {detail}")).await;
            }
            MessageType::ReconnectOffer | MessageType::ReconnectAnswer => {
                warn!(channel, msg_type = ?msg.msg_type, "relay signaling received on data channel, ignoring");
            }
        }
    }

    async fn handle_manifest(self: &Arc<Self>, channel: usize, msg: Envelope) {
        let manifest = match msg.parse_payload::<skiff_protocol::messages::ChannelManifest>() {
            Ok(m) => m,
            Err(e) => return self.fail(format!("unparseable manifest: {e}")).await,
        };
        if msg.version > PROTOCOL_VERSION {
            warn!(
                channel,
                version = msg.version,
                "peer speaks a newer protocol version"
            );
        }

        if manifest.channel_index != channel {
            return self
                .fail(format!(
                    "manifest for channel {} arrived on channel {channel}",
                    manifest.channel_index
                ))
                .await;
        }

        let accept_result = self.validator.lock().unwrap().accept(&manifest);
        if let Err(e) = accept_result {
            let reply = Envelope::rejection(ERROR_CODE_MANIFEST, e.to_string());
            if let Err(send_err) = self.send_control(channel, &reply) {
                warn!(channel, error = %send_err, "failed to send manifest rejection");
            }
            return self.fail(e.to_string()).await;
        }

        {
            let mut expected = self.expected.lock().unwrap();
            let mut inbound = self.inbound.lock().unwrap();
            for file in &manifest.files {
                expected.insert(file.path.clone(), (channel, file.hash.clone()));
                inbound.insert(
                    file.path.clone(),
                    FileTransferState::new(&file.path, &file.hash),
                );
            }
        }
        self.board
            .lock()
            .unwrap()
            .set_inbound_total(channel, manifest.files.len());

        debug!(
            channel,
            files = manifest.files.len(),
            "accepted peer manifest"
        );

        let ack = ManifestAck {
            channel_index: channel,
        };
        match Envelope::carrying(MessageType::ManifestAck, &ack) {
            Ok(reply) => {
                if let Err(e) = self.send_control(channel, &reply) {
                    return self
                        .fail(format!("failed to acknowledge manifest: {e}"))
                        .await;
                }
            }
            Err(e) => return self.fail(format!("failed to encode manifest ack: {e}")).await,
        }

        self.evaluate_channel(channel).await;
    }

    async fn handle_ack(self: &Arc<Self>, msg: Envelope) {
        let ack = match msg.parse_payload::<ManifestAck>() {
            Ok(a) => a,
            Err(e) => return self.fail(format!("unparseable manifest ack: {e}")).await,
        };
        if ack.channel_index >= self.channel_count {
            return self
                .fail(format!("manifest ack for unknown channel {}", ack.channel_index))
                .await;
        }

        let all_acked = {
            let mut acks = self.acks.lock().unwrap();
            acks.insert(ack.channel_index);
            acks.len() == self.channel_count
        };
        if all_acked {
            debug!(channels = self.channel_count, "all manifests acknowledged, streaming unlocked");
            let _ = self.barrier_tx.send(true);
        }
    }

    async fn handle_chunk(self: &Arc<Self>, channel: usize, chunk: ChunkFrame) {
        let contract = { self.expected.lock().unwrap().get(&chunk.path).cloned() };
        let Some((contracted_channel, declared_hash)) = contract else {
            return self
                .fail(format!("chunk for undeclared file: {}", chunk.path))
                .await;
        };
        if contracted_channel != channel {
            return self
                .fail(format!(
                    "file {} contracted to channel {contracted_channel} but arrived on channel {channel}",
                    chunk.path
                ))
                .await;
        }

        // A completed file is never re-applied. A duplicate final chunk
        // means the receipt was lost in flight; answer it again.
        let already_completed = {
            self.inbound
                .lock()
                .unwrap()
                .get(&chunk.path)
                .is_some_and(|s| s.status == TransferStatus::Completed)
        };
        if already_completed {
            if chunk.last {
                trace!(path = %chunk.path, "duplicate final chunk, re-sending receipt");
                self.send_receipt(channel, &chunk.path, &declared_hash);
            }
            return;
        }

        let received = chunk.payload.len() as u64;
        let absorbed = { self.reassembly.lock().unwrap().absorb(&chunk) };
        match absorbed {
            Absorbed::Stale => {}
            Absorbed::Partial => {
                self.bytes_received.fetch_add(received, Ordering::Relaxed);
                if let Some(state) = self.inbound.lock().unwrap().get_mut(&chunk.path) {
                    state.status = TransferStatus::InProgress;
                    state.bytes_received += received;
                }
            }
            Absorbed::Complete(data) => {
                self.bytes_received.fetch_add(received, Ordering::Relaxed);

                let actual_hash = crate::types::checksum_bytes(&data);
                if actual_hash != declared_hash {
                    warn!(
                        path = %chunk.path,
                        expected = %declared_hash,
                        actual = %actual_hash,
                        "content hash mismatch, discarding file"
                    );
                    self.reassembly.lock().unwrap().discard(&chunk.path);
                    if let Some(state) = self.inbound.lock().unwrap().get_mut(&chunk.path) {
                        state.bytes_received = 0;
                        state.status = TransferStatus::Pending;
                    }
                    // No receipt: the sender's session cannot complete and
                    // recovery will resend the file.
                    return;
                }

                let first_delivery = { self.dedup.lock().unwrap().mark(&actual_hash) };
                if let Some(state) = self.inbound.lock().unwrap().get_mut(&chunk.path) {
                    state.status = TransferStatus::Completed;
                    state.bytes_received = data.len() as u64;
                }
                self.board.lock().unwrap().note_inbound_delivered(channel);
                self.send_receipt(channel, &chunk.path, &actual_hash);

                if first_delivery {
                    let _ = self
                        .events_tx
                        .send(SessionEvent::FileDelivered {
                            peer_id: self.peer_id.clone(),
                            path: chunk.path.clone(),
                            hash: actual_hash,
                            data,
                        })
                        .await;
                } else {
                    debug!(path = %chunk.path, "duplicate content delivery suppressed");
                }

                self.evaluate_channel(channel).await;
            }
        }
    }

    async fn handle_receipt(self: &Arc<Self>, channel: usize, msg: Envelope) {
        let receipt = match msg.parse_payload::<CompletionReceipt>() {
            Ok(r) => r,
            Err(e) => {
                return self
                    .fail(format!("unparseable completion receipt: {e}"))
                    .await;
            }
        };

        // The close board counts per contracted channel, not per the
        // channel the receipt happened to arrive on.
        let Some(contract_channel) = self.outbound_channels.get(&receipt.path).copied() else {
            warn!(path = %receipt.path, "receipt for unknown outbound file, ignoring");
            return;
        };
        if contract_channel != channel {
            warn!(
                path = %receipt.path,
                channel,
                contract_channel,
                "receipt arrived off its contract channel"
            );
        }

        let newly_confirmed = {
            let mut outbound = self.outbound.lock().unwrap();
            match outbound.get_mut(&receipt.path) {
                None => return,
                Some(state) => {
                    if state.hash != receipt.hash {
                        warn!(
                            path = %receipt.path,
                            "receipt hash does not match contract, ignoring"
                        );
                        return;
                    }
                    if state.status == TransferStatus::Completed {
                        false
                    } else {
                        state.status = TransferStatus::Completed;
                        true
                    }
                }
            }
        };
        if !newly_confirmed {
            return;
        }

        self.board
            .lock()
            .unwrap()
            .note_outbound_complete(contract_channel);

        if let Some(file) = self.outbound_files.get(&receipt.path) {
            let confirmed = self
                .confirmed_bytes
                .fetch_add(file.size, Ordering::Relaxed)
                + file.size;
            let _ = self.events_tx.try_send(SessionEvent::Progress {
                peer_id: self.peer_id.clone(),
                bytes_transferred: confirmed,
                total_bytes: self.total_outbound,
            });
        }
        trace!(channel = contract_channel, path = %receipt.path, "outbound file confirmed");

        self.evaluate_channel(contract_channel).await;
    }

    async fn handle_channel_done(self: &Arc<Self>, msg: Envelope) {
        let done = match msg.parse_payload::<ChannelDone>() {
            Ok(d) => d,
            Err(e) => return self.fail(format!("unparseable channel done: {e}")).await,
        };
        if done.channel_index >= self.channel_count {
            return self
                .fail(format!("channel done for unknown channel {}", done.channel_index))
                .await;
        }

        self.board
            .lock()
            .unwrap()
            .set_remote_done(done.channel_index);
        self.evaluate_channel(done.channel_index).await;
    }

    /// Re-checks one channel's close conditions after any completion
    /// event: announce the local half once, close after both halves,
    /// and finish the session once every channel is closed.
    async fn evaluate_channel(self: &Arc<Self>, channel: usize) {
        let (announce, close) = {
            let mut board = self.board.lock().unwrap();
            (board.should_announce(channel), board.try_close(channel))
        };

        if announce {
            let done = ChannelDone {
                channel_index: channel,
            };
            match Envelope::carrying(MessageType::ChannelDone, &done) {
                Ok(msg) => {
                    if let Err(e) = self.send_control(channel, &msg) {
                        warn!(channel, error = %e, "failed to announce channel done");
                    } else {
                        debug!(channel, "local half of close handshake sent");
                    }
                }
                Err(e) => warn!(channel, error = %e, "failed to encode channel done"),
            }
        }

        if close {
            self.transport.close(channel);
            debug!(channel, "channel closed after mutual handshake");
        }

        let all_closed = { self.board.lock().unwrap().all_closed() };
        if all_closed {
            self.complete().await;
        }
    }

    /// Captures resumable progress. Valid at any point; normally taken
    /// after the session dropped.
    fn snapshot(&self) -> TransferSnapshot {
        let confirmed: HashSet<String> = {
            self.outbound
                .lock()
                .unwrap()
                .values()
                .filter(|s| s.status == TransferStatus::Completed)
                .map(|s| s.path.clone())
                .collect()
        };
        let mut pending_files: Vec<Arc<TransferableFile>> = self
            .outbound_files
            .values()
            .filter(|f| !confirmed.contains(&f.path))
            .cloned()
            .collect();
        pending_files.sort_by(|a, b| a.path.cmp(&b.path));

        let (delivered_files, delivered_hashes) = {
            let inbound = self.inbound.lock().unwrap();
            let files: HashSet<String> = inbound
                .values()
                .filter(|s| s.status == TransferStatus::Completed)
                .map(|s| s.path.clone())
                .collect();
            let hashes: HashMap<String, String> = inbound
                .values()
                .filter(|s| s.status == TransferStatus::Completed)
                .map(|s| (s.path.clone(), s.hash.clone()))
                .collect();
            (files, hashes)
        };

        let bytes_transferred = self.confirmed_bytes.load(Ordering::Relaxed);
        TransferSnapshot {
            peer_id: self.peer_id.clone(),
            session_id: self.session_id.clone(),
            pending_files,
            confirmed_files: confirmed,
            delivered_files,
            delivered_hashes,
            bytes_transferred,
            total_bytes: self.total_outbound,
        }
    }
}

struct PeerEntry {
    transport: Arc<dyn ChannelTransport>,
    activity: Arc<ConnectionActivity>,
    session: Option<Arc<SessionShared>>,
    /// Routing targets for inbound frames while a session is active.
    inbound_tx: Option<Vec<mpsc::UnboundedSender<Vec<u8>>>>,
    /// Frames that arrived before the session started.
    pending: Vec<(usize, Vec<u8>)>,
    /// Completed-file set the peer announced while no session was active.
    peer_completed: Option<HashSet<String>>,
    /// Snapshot of the last dropped session with this peer.
    dropped: Option<TransferSnapshot>,
}

/// Drives transfer sessions against registered peer transports and
/// surfaces [`SessionEvent`]s to the application.
pub struct TransferOrchestrator {
    config: TransferConfig,
    peers: Mutex<HashMap<String, PeerEntry>>,
    events_tx: mpsc::Sender<SessionEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<SessionEvent>>>,
    cancel: CancellationToken,
}

impl TransferOrchestrator {
    pub fn new(config: TransferConfig) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            config,
            peers: Mutex::new(HashMap::new()),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            cancel: CancellationToken::new(),
        }
    }

    /// Takes the event receiver. Yields `None` after the first call.
    pub fn take_events(&self) -> Option<mpsc::Receiver<SessionEvent>> {
        self.events_rx.lock().unwrap().take()
    }

    /// Sender half of the event channel, for collaborating layers.
    pub fn events_sender(&self) -> mpsc::Sender<SessionEvent> {
        self.events_tx.clone()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Registers (or replaces) the channel transport for a peer.
    /// Replacement is rejected while a session is active.
    pub fn register_channels(
        &self,
        peer_id: &str,
        transport: Arc<dyn ChannelTransport>,
    ) -> Result<(), TransferError> {
        let mut peers = self.peers.lock().unwrap();
        match peers.get_mut(peer_id) {
            Some(entry) => {
                if entry.session.is_some() {
                    return Err(TransferError::SessionActive(peer_id.to_string()));
                }
                entry.transport = transport;
                entry.activity = Arc::new(ConnectionActivity::new());
                entry.inbound_tx = None;
                entry.pending.clear();
                info!(peer = peer_id, "replaced channel transport");
            }
            None => {
                peers.insert(
                    peer_id.to_string(),
                    PeerEntry {
                        transport,
                        activity: Arc::new(ConnectionActivity::new()),
                        session: None,
                        inbound_tx: None,
                        pending: Vec::new(),
                        peer_completed: None,
                        dropped: None,
                    },
                );
                debug!(peer = peer_id, "registered channel transport");
            }
        }
        Ok(())
    }

    /// Runs a full transfer session with a peer and awaits its terminal
    /// outcome. The peer must run its own `begin` (possibly with an
    /// empty file set) for manifests and closure to complete.
    pub async fn begin(
        &self,
        peer_id: &str,
        files: Vec<TransferableFile>,
        profile: &ResourceProfile,
    ) -> Result<SessionOutcome, TransferError> {
        let files: Vec<Arc<TransferableFile>> = files.into_iter().map(Arc::new).collect();
        let session_id = Uuid::new_v4().to_string();
        self.begin_inner(peer_id, files, profile, session_id, Vec::new())
            .await
    }

    /// Resumes a dropped session from its snapshot over a freshly
    /// registered transport. Files already confirmed by the peer's
    /// recovery request are subtracted before negotiation.
    pub async fn resume(
        &self,
        peer_id: &str,
        snapshot: &TransferSnapshot,
        profile: &ResourceProfile,
    ) -> Result<SessionOutcome, TransferError> {
        let peer_completed = self.take_peer_completed(peer_id).unwrap_or_default();
        let files: Vec<Arc<TransferableFile>> = snapshot
            .pending_files
            .iter()
            .filter(|f| !peer_completed.contains(&f.path))
            .cloned()
            .collect();
        // Seed the dedup guard with already-delivered content so a peer
        // that lost our receipts cannot double-deliver.
        let seeded: Vec<String> = snapshot.delivered_hashes.values().cloned().collect();

        info!(
            peer = peer_id,
            session = %snapshot.session_id,
            resuming = files.len(),
            already_confirmed = snapshot.pending_files.len() - files.len(),
            "resuming dropped session"
        );
        self.begin_inner(peer_id, files, profile, snapshot.session_id.clone(), seeded)
            .await
    }

    async fn begin_inner(
        &self,
        peer_id: &str,
        files: Vec<Arc<TransferableFile>>,
        profile: &ResourceProfile,
        session_id: String,
        seeded_hashes: Vec<String>,
    ) -> Result<SessionOutcome, TransferError> {
        let (transport, activity) = {
            let peers = self.peers.lock().unwrap();
            let entry = peers
                .get(peer_id)
                .ok_or_else(|| TransferError::ChannelsNotRegistered(peer_id.to_string()))?;
            if entry.session.is_some() {
                return Err(TransferError::SessionActive(peer_id.to_string()));
            }
            (Arc::clone(&entry.transport), Arc::clone(&entry.activity))
        };

        let channel_count = transport.channel_count();
        if channel_count == 0 {
            return Err(TransferError::Transport(
                "transport exposes no channels".into(),
            ));
        }

        let assignments = negotiate(&files, profile, channel_count, self.config.high_water);
        let total_outbound: u64 = files.iter().map(|f| f.size).sum();

        let mut board = CloseBoard::new(channel_count);
        for assignment in &assignments {
            board.set_outbound_total(assignment.channel_index, assignment.files.len());
        }

        let mut dedup = DeliveryGuard::new(self.config.dedup_capacity);
        for hash in seeded_hashes {
            dedup.mark(&hash);
        }

        let outbound: HashMap<String, FileTransferState> = files
            .iter()
            .map(|f| (f.path.clone(), FileTransferState::new(&f.path, &f.hash)))
            .collect();
        let outbound_files: HashMap<String, Arc<TransferableFile>> =
            files.iter().map(|f| (f.path.clone(), Arc::clone(f))).collect();
        let outbound_channels: HashMap<String, usize> = assignments
            .iter()
            .flat_map(|a| a.files.iter().map(move |f| (f.path.clone(), a.channel_index)))
            .collect();

        let (barrier_tx, _) = watch::channel(false);
        let (terminal_tx, mut terminal_rx) = watch::channel(None);

        let shared = Arc::new(SessionShared {
            session_id: session_id.clone(),
            peer_id: peer_id.to_string(),
            config: self.config.clone(),
            transport,
            activity,
            cancel: self.cancel.child_token(),
            bytes_sent: AtomicU64::new(0),
            channel_count,
            outbound_files,
            outbound_channels,
            total_outbound,
            outbound: Mutex::new(outbound),
            inbound: Mutex::new(HashMap::new()),
            expected: Mutex::new(HashMap::new()),
            validator: Mutex::new(ManifestValidator::new(channel_count)),
            acks: Mutex::new(HashSet::new()),
            barrier_tx,
            board: Mutex::new(board),
            reassembly: Mutex::new(Reassembly::new()),
            dedup: Mutex::new(dedup),
            confirmed_bytes: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            events_tx: self.events_tx.clone(),
            terminal_tx,
        });

        // Spawn one inbound dispatcher per channel, then install the
        // routing senders and drain any early frames in arrival order.
        let mut senders = Vec::with_capacity(channel_count);
        for channel in 0..channel_count {
            let (tx, rx) = mpsc::unbounded_channel();
            senders.push(tx);
            tokio::spawn(run_inbound(Arc::clone(&shared), channel, rx));
        }
        {
            let mut peers = self.peers.lock().unwrap();
            let Some(entry) = peers.get_mut(peer_id) else {
                shared.cancel.cancel();
                return Err(TransferError::ChannelsNotRegistered(peer_id.to_string()));
            };
            // Checked again under the lock that installs: the earlier
            // check ran under a separate acquisition, and a concurrent
            // begin or resume may have installed a session in between.
            if entry.session.is_some() {
                shared.cancel.cancel();
                return Err(TransferError::SessionActive(peer_id.to_string()));
            }
            entry.session = Some(Arc::clone(&shared));
            entry.dropped = None;
            for (channel, bytes) in entry.pending.drain(..) {
                if channel < senders.len() {
                    let _ = senders[channel].send(bytes);
                }
            }
            entry.inbound_tx = Some(senders);
        }

        info!(
            peer = peer_id,
            session = %session_id,
            files = files.len(),
            channels = channel_count,
            total_bytes = total_outbound,
            "transfer session started"
        );

        // Manifests first on every channel; channel ordering guarantees
        // they precede any chunk.
        for manifest in build_manifests(&assignments, channel_count) {
            let channel = manifest.channel_index;
            let msg = Envelope::carrying(MessageType::Manifest, &manifest)?;
            if let Err(e) = shared.send_control(channel, &msg) {
                shared.drop_session(&format!("manifest send failed: {e}"));
                break;
            }
        }

        for assignment in assignments {
            let shared_for_channel = Arc::clone(&shared);
            tokio::spawn(run_streamer(shared_for_channel, assignment));
        }

        let outcome = loop {
            tokio::select! {
                _ = shared.cancel.cancelled() => {
                    let current = terminal_rx.borrow().clone();
                    match current {
                        Some(outcome) => break outcome,
                        None => {
                            self.clear_session(peer_id, &shared, None);
                            return Err(TransferError::Cancelled);
                        }
                    }
                }
                changed = terminal_rx.changed() => {
                    if changed.is_err() {
                        self.clear_session(peer_id, &shared, None);
                        return Err(TransferError::Cancelled);
                    }
                    if let Some(outcome) = terminal_rx.borrow_and_update().clone() {
                        break outcome;
                    }
                }
            }
        };

        self.clear_session(peer_id, &shared, Some(&outcome));
        Ok(outcome)
    }

    fn clear_session(
        &self,
        peer_id: &str,
        shared: &Arc<SessionShared>,
        outcome: Option<&SessionOutcome>,
    ) {
        let mut peers = self.peers.lock().unwrap();
        if let Some(entry) = peers.get_mut(peer_id) {
            entry.session = None;
            entry.inbound_tx = None;
            if matches!(outcome, Some(SessionOutcome::Dropped)) {
                entry.dropped = Some(shared.snapshot());
            }
        }
    }

    /// Entry point for the transport adapter: one raw inbound frame.
    ///
    /// Never blocks on session processing; frames are queued per channel
    /// and handled by the session's dispatcher tasks.
    pub fn handle_frame(&self, peer_id: &str, channel: usize, bytes: Vec<u8>) {
        enum Deferred {
            None,
            RecoveryReply {
                transport: Arc<dyn ChannelTransport>,
                request: RecoveryRequest,
                remaining: u64,
            },
        }

        let deferred = {
            let mut peers = self.peers.lock().unwrap();
            let Some(entry) = peers.get_mut(peer_id) else {
                warn!(peer = peer_id, "frame from unregistered peer, dropping");
                return;
            };
            entry.activity.record_recv();

            if let Some(senders) = &entry.inbound_tx {
                if channel < senders.len() {
                    let _ = senders[channel].send(bytes);
                } else {
                    warn!(peer = peer_id, channel, "frame on unknown channel, dropping");
                }
                Deferred::None
            } else {
                // No active session: recovery signaling is answered here;
                // anything else waits for the session to start.
                match wire::decode_frame(&bytes) {
                    Ok(Frame::Control(msg)) if msg.msg_type == MessageType::RecoveryRequest => {
                        match msg.parse_payload::<RecoveryRequest>() {
                            Ok(request) => {
                                let completed: HashSet<String> =
                                    request.completed_files.iter().cloned().collect();
                                let remaining = entry
                                    .dropped
                                    .as_ref()
                                    .map(|snap| {
                                        snap.pending_files
                                            .iter()
                                            .filter(|f| !completed.contains(&f.path))
                                            .count() as u64
                                    })
                                    .unwrap_or(0);
                                entry.peer_completed = Some(completed);
                                Deferred::RecoveryReply {
                                    transport: Arc::clone(&entry.transport),
                                    request,
                                    remaining,
                                }
                            }
                            Err(_) => {
                                warn!(peer = peer_id, "unparseable recovery request, dropping");
                                Deferred::None
                            }
                        }
                    }
                    Ok(Frame::Control(msg))
                        if msg.msg_type == MessageType::RecoveryResponse =>
                    {
                        debug!(peer = peer_id, "recovery response before session start");
                        Deferred::None
                    }
                    Ok(_) => {
                        entry.pending.push((channel, bytes));
                        Deferred::None
                    }
                    Err(e) => {
                        warn!(peer = peer_id, channel, error = %e, "malformed frame outside session, dropping");
                        Deferred::None
                    }
                }
            }
        };

        if let Deferred::RecoveryReply {
            transport,
            request,
            remaining,
        } = deferred
        {
            info!(
                peer = peer_id,
                session = %request.session_id,
                confirmed = request.completed_files.len(),
                remaining,
                "peer requested session recovery"
            );
            let response = RecoveryResponse {
                session_id: request.session_id.clone(),
                remaining_files: remaining,
            };
            match Envelope::carrying(MessageType::RecoveryResponse, &response) {
                Ok(msg) => match wire::encode_control(&msg) {
                    Ok(frame) => {
                        if let Err(e) = transport.send(0, frame) {
                            warn!(peer = peer_id, error = %e, "failed to answer recovery request");
                        }
                    }
                    Err(e) => warn!(error = %e, "failed to encode recovery response"),
                },
                Err(e) => warn!(error = %e, "failed to build recovery response"),
            }
            let _ = self.events_tx.try_send(SessionEvent::RecoveryRequested {
                peer_id: peer_id.to_string(),
                session_id: request.session_id,
                completed_files: request.completed_files,
            });
        }
    }

    /// Reports a lost connection. Cancels any active session and returns
    /// the snapshot to resume from, if there is anything to resume.
    pub fn connection_lost(&self, peer_id: &str) -> Option<TransferSnapshot> {
        let session = {
            let mut peers = self.peers.lock().unwrap();
            let entry = peers.get_mut(peer_id)?;
            entry.inbound_tx = None;
            match entry.session.take() {
                Some(shared) => Some(shared),
                None => return entry.dropped.clone(),
            }
        };

        let shared = session?;
        shared.drop_session("connection lost");
        let snapshot = shared.snapshot();
        {
            let mut peers = self.peers.lock().unwrap();
            if let Some(entry) = peers.get_mut(peer_id) {
                entry.dropped = Some(snapshot.clone());
            }
        }
        Some(snapshot)
    }

    /// Sends a recovery request over the peer's control channel.
    pub fn send_recovery_request(
        &self,
        peer_id: &str,
        request: &RecoveryRequest,
    ) -> Result<(), TransferError> {
        let transport = {
            let peers = self.peers.lock().unwrap();
            let entry = peers
                .get(peer_id)
                .ok_or_else(|| TransferError::ChannelsNotRegistered(peer_id.to_string()))?;
            Arc::clone(&entry.transport)
        };
        let msg = Envelope::carrying(MessageType::RecoveryRequest, request)?;
        transport.send(0, wire::encode_control(&msg)?)
    }

    /// Takes the completed-file set the peer announced via recovery
    /// request, if any.
    pub fn take_peer_completed(&self, peer_id: &str) -> Option<HashSet<String>> {
        self.peers
            .lock()
            .unwrap()
            .get_mut(peer_id)
            .and_then(|e| e.peer_completed.take())
    }

    /// Last dropped-session snapshot for a peer, if one exists.
    pub fn dropped_snapshot(&self, peer_id: &str) -> Option<TransferSnapshot> {
        self.peers
            .lock()
            .unwrap()
            .get(peer_id)
            .and_then(|e| e.dropped.clone())
    }

    /// Whether the peer connection saw traffic in either direction
    /// within the grace window.
    pub fn is_transferring(&self, peer_id: &str) -> bool {
        self.peers
            .lock()
            .unwrap()
            .get(peer_id)
            .map(|e| e.activity.is_transferring(self.config.grace_window))
            .unwrap_or(false)
    }

    /// Removes a peer, waiting out the liveness grace window first so
    /// in-flight traffic is not cut off.
    pub async fn dispose(&self, peer_id: &str) {
        while self.is_transferring(peer_id) {
            tokio::time::sleep(self.config.grace_window / 4).await;
        }
        let session = {
            let mut peers = self.peers.lock().unwrap();
            peers.remove(peer_id).and_then(|e| e.session)
        };
        if let Some(shared) = session {
            shared.cancel.cancel();
        }
        debug!(peer = peer_id, "peer disposed");
    }
}

async fn run_inbound(
    shared: Arc<SessionShared>,
    channel: usize,
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
) {
    loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => break,
            frame = rx.recv() => {
                match frame {
                    Some(bytes) => shared.process_frame(channel, bytes).await,
                    None => break,
                }
            }
        }
    }
}

async fn run_streamer(shared: Arc<SessionShared>, assignment: ChannelAssignment) {
    let channel = assignment.channel_index;
    match stream_channel(&shared, assignment).await {
        Ok(()) => debug!(channel, "outbound streaming finished"),
        Err(TransferError::Cancelled) => {}
        Err(e) => {
            warn!(channel, error = %e, "channel streaming failed");
            shared.drop_session(&e.to_string());
        }
    }
}
