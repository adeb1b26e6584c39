//! Transport seam consumed by the transfer engine.
//!
//! The underlying connection (ICE/SDP negotiation, channel setup) is an
//! external collaborator. The engine only requires N independent,
//! individually ordered and reliable message pathways with a backlog
//! signal per channel; inbound frames are pushed into
//! [`TransferOrchestrator::handle_frame`](crate::orchestrator::TransferOrchestrator::handle_frame)
//! by the adapter.

use crate::TransferError;

/// Lifecycle state of one data channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Open,
    Closed,
    Failed,
}

/// N independent ordered, reliable message pathways to one peer.
///
/// `send` queues a frame; errors are transient per-frame failures that
/// the engine retries a bounded number of times. `backlog` reports the
/// queued-but-unsent byte count used for flow control.
pub trait ChannelTransport: Send + Sync {
    /// Queues one frame on the given channel.
    fn send(&self, channel_index: usize, frame: Vec<u8>) -> Result<(), TransferError>;

    /// Bytes queued but not yet handed to the network on this channel.
    fn backlog(&self, channel_index: usize) -> usize;

    /// Number of channels this transport exposes.
    fn channel_count(&self) -> usize;

    /// Current state of one channel.
    fn state(&self, channel_index: usize) -> ChannelState;

    /// Instructs the transport to tear down one channel. Only called
    /// after the mutual close handshake is satisfied.
    fn close(&self, channel_index: usize);
}
