//! Receiver-side reassembly and completion bookkeeping.
//!
//! Channel ordering guarantees correct chunk order within one file, so
//! reassembly is append-only per path. Delivery to the application is
//! guarded twice: per-path status (a completed file is never re-applied)
//! and a bounded content-hash dedup set, so a retransmitted or duplicate
//! frame cannot cause a double-apply.

use std::collections::{HashMap, HashSet, VecDeque};

use skiff_protocol::wire::ChunkFrame;
use tracing::warn;

/// Outcome of absorbing one chunk into the reassembly buffers.
#[derive(Debug)]
pub(crate) enum Absorbed {
    /// Chunk appended; file not yet complete.
    Partial,
    /// Final chunk appended; full file bytes returned.
    Complete(Vec<u8>),
    /// Duplicate or out-of-window chunk; ignored.
    Stale,
}

/// Per-file chunk reassembly. One instance per session.
#[derive(Debug, Default)]
pub(crate) struct Reassembly {
    buffers: HashMap<String, Vec<u8>>,
}

impl Reassembly {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Absorbs one chunk. The channel delivers in order, so an offset
    /// that does not match the buffered length can only be a
    /// retransmission of data already absorbed.
    pub(crate) fn absorb(&mut self, chunk: &ChunkFrame) -> Absorbed {
        let buffered = self.buffers.get(&chunk.path).map(Vec::len).unwrap_or(0);
        let expected = buffered as u64;

        if chunk.offset != expected {
            if !self.buffers.contains_key(&chunk.path) && chunk.offset != 0 {
                return Absorbed::Stale;
            }
            warn!(
                path = %chunk.path,
                offset = chunk.offset,
                expected,
                "chunk offset does not match buffered length, ignoring"
            );
            return Absorbed::Stale;
        }

        let buffer = self.buffers.entry(chunk.path.clone()).or_default();
        buffer.extend_from_slice(&chunk.payload);

        if chunk.last {
            let data = self.buffers.remove(&chunk.path).unwrap_or_default();
            Absorbed::Complete(data)
        } else {
            Absorbed::Partial
        }
    }

    /// Discards any buffered bytes for a file (hash mismatch path).
    pub(crate) fn discard(&mut self, path: &str) {
        self.buffers.remove(path);
    }

    /// Bytes currently buffered for a file.
    #[cfg(test)]
    pub(crate) fn buffered(&self, path: &str) -> usize {
        self.buffers.get(path).map(Vec::len).unwrap_or(0)
    }
}

/// Bounded dedup set keyed by content hash.
///
/// Guards exactly-once delivery to the application; oldest entries are
/// evicted once the set exceeds its capacity.
#[derive(Debug)]
pub struct DeliveryGuard {
    capacity: usize,
    seen: HashSet<String>,
    order: VecDeque<String>,
}

impl DeliveryGuard {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            seen: HashSet::new(),
            order: VecDeque::new(),
        }
    }

    /// Records a delivered content hash. Returns `true` on first sight,
    /// `false` for a duplicate.
    pub fn mark(&mut self, hash: &str) -> bool {
        if !self.seen.insert(hash.to_string()) {
            return false;
        }
        self.order.push_back(hash.to_string());
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        true
    }

    pub fn contains(&self, hash: &str) -> bool {
        self.seen.contains(hash)
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

/// Per-channel closure bookkeeping for the mutual close handshake.
///
/// A channel's local half is raised once every file assigned to it is
/// completed in both directions; the transport is instructed to close
/// only when the remote half has arrived too. Closing earlier risks
/// losing in-flight receipts.
#[derive(Debug)]
pub(crate) struct CloseBoard {
    channels: Vec<ChannelProgress>,
}

#[derive(Debug, Default)]
struct ChannelProgress {
    outbound_total: usize,
    outbound_done: usize,
    /// Known only after the peer's manifest for this channel arrives.
    inbound_total: Option<usize>,
    inbound_done: usize,
    done_sent: bool,
    remote_done: bool,
    closed: bool,
}

impl ChannelProgress {
    fn local_done(&self) -> bool {
        self.outbound_done == self.outbound_total
            && self.inbound_total.is_some_and(|t| self.inbound_done == t)
    }
}

impl CloseBoard {
    pub(crate) fn new(channel_count: usize) -> Self {
        Self {
            channels: (0..channel_count).map(|_| ChannelProgress::default()).collect(),
        }
    }

    pub(crate) fn set_outbound_total(&mut self, channel: usize, total: usize) {
        self.channels[channel].outbound_total = total;
    }

    pub(crate) fn set_inbound_total(&mut self, channel: usize, total: usize) {
        self.channels[channel].inbound_total = Some(total);
    }

    pub(crate) fn note_outbound_complete(&mut self, channel: usize) {
        self.channels[channel].outbound_done += 1;
    }

    pub(crate) fn note_inbound_delivered(&mut self, channel: usize) {
        self.channels[channel].inbound_done += 1;
    }

    pub(crate) fn set_remote_done(&mut self, channel: usize) {
        self.channels[channel].remote_done = true;
    }

    /// Whether the local half should be announced now (first time only).
    pub(crate) fn should_announce(&mut self, channel: usize) -> bool {
        let c = &mut self.channels[channel];
        if c.local_done() && !c.done_sent {
            c.done_sent = true;
            true
        } else {
            false
        }
    }

    /// Whether the channel just became eligible for teardown (both
    /// halves true, first time only).
    pub(crate) fn try_close(&mut self, channel: usize) -> bool {
        let c = &mut self.channels[channel];
        if c.local_done() && c.remote_done && !c.closed {
            c.closed = true;
            true
        } else {
            false
        }
    }

    pub(crate) fn all_closed(&self) -> bool {
        self.channels.iter().all(|c| c.closed)
    }
}
