//! Outbound chunk streaming with backlog flow control.
//!
//! One streamer task per assigned channel. Chunks only move after the
//! manifest barrier opens (both peers have accepted all manifests), and
//! each chunk waits for the channel backlog to drain below the low-water
//! mark whenever it has climbed past the high-water mark.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use skiff_protocol::wire::{self, ChunkFrame};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::channel::ChannelTransport;
use crate::orchestrator::SessionShared;
use crate::types::{ChannelAssignment, TransferStatus, TransferableFile};
use crate::{TransferConfig, TransferError};

/// Streams every file assigned to one channel, in assignment order.
pub(crate) async fn stream_channel(
    shared: &Arc<SessionShared>,
    assignment: ChannelAssignment,
) -> Result<(), TransferError> {
    shared.wait_barrier().await?;

    let channel = assignment.channel_index;
    debug!(
        channel,
        files = assignment.files.len(),
        bytes = assignment.contracted_bytes,
        "streaming channel assignment"
    );

    for file in &assignment.files {
        stream_file(shared, channel, file).await?;
    }
    Ok(())
}

/// Streams one file as a sequence of bounded chunks. A zero-byte file
/// still produces a single empty chunk marked last, so the receiver can
/// complete it.
async fn stream_file(
    shared: &Arc<SessionShared>,
    channel: usize,
    file: &Arc<TransferableFile>,
) -> Result<(), TransferError> {
    shared.with_outbound_state(&file.path, |state| {
        state.status = TransferStatus::InProgress;
    });

    let chunk_size = shared.config.chunk_size.max(1);
    let total = file.content.len();
    let mut offset = 0usize;

    loop {
        let end = (offset + chunk_size).min(total);
        let last = end == total;
        let frame = wire::encode_chunk(&ChunkFrame {
            path: file.path.clone(),
            offset: offset as u64,
            last,
            payload: file.content[offset..end].to_vec(),
        })?;

        wait_for_capacity(
            shared.transport.as_ref(),
            &shared.config,
            channel,
            &shared.cancel,
        )
        .await?;
        send_with_retry(
            shared.transport.as_ref(),
            &shared.config,
            channel,
            frame,
            &shared.cancel,
        )
        .await?;

        shared.activity.record_send();
        let sent = (end - offset) as u64;
        shared.bytes_sent.fetch_add(sent, Ordering::Relaxed);
        shared.with_outbound_state(&file.path, |state| {
            state.bytes_sent = end as u64;
        });

        if last {
            break;
        }
        offset = end;
    }

    trace!(channel, path = %file.path, size = file.size, "file streamed, awaiting receipt");
    Ok(())
}

/// Blocks while the channel backlog sits above the high-water mark,
/// resuming only once it drains below the low-water mark.
pub(crate) async fn wait_for_capacity(
    transport: &dyn ChannelTransport,
    config: &TransferConfig,
    channel: usize,
    cancel: &CancellationToken,
) -> Result<(), TransferError> {
    if transport.backlog(channel) <= config.high_water {
        return Ok(());
    }

    trace!(channel, "backlog above high water, suspending sends");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Err(TransferError::Cancelled),
            _ = tokio::time::sleep(config.backlog_poll) => {}
        }
        if transport.backlog(channel) <= config.low_water {
            return Ok(());
        }
    }
}

/// Sends one frame, retrying transient failures a bounded number of
/// times before declaring the channel failed.
pub(crate) async fn send_with_retry(
    transport: &dyn ChannelTransport,
    config: &TransferConfig,
    channel: usize,
    frame: Vec<u8>,
    cancel: &CancellationToken,
) -> Result<(), TransferError> {
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match transport.send(channel, frame.clone()) {
            Ok(()) => return Ok(()),
            Err(e) if attempt < config.chunk_retry_limit => {
                warn!(channel, attempt, error = %e, "chunk send failed, retrying");
                tokio::select! {
                    _ = cancel.cancelled() => return Err(TransferError::Cancelled),
                    _ = tokio::time::sleep(config.retry_delay) => {}
                }
            }
            Err(e) => {
                return Err(TransferError::ChannelFailed {
                    channel_index: channel,
                    reason: e.to_string(),
                });
            }
        }
    }
}
