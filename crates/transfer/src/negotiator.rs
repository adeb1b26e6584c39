//! Channel capability negotiation and file-to-channel assignment.

use std::sync::Arc;

use skiff_protocol::messages::ResourceProfile;
use tracing::debug;

use crate::types::{ChannelAssignment, TransferableFile};

/// Hard upper bound on channels per peer connection.
pub const MAX_CHANNELS: usize = 8;

/// Decides the channel count for a session.
///
/// Clamps the peer's proposal to `[1, MAX_CHANNELS]`, to the transport's
/// actual channel count, and to what the peer's memory budget supports
/// (each channel may buffer up to `per_channel_budget` bytes).
pub fn channel_count(
    profile: &ResourceProfile,
    transport_channels: usize,
    per_channel_budget: usize,
) -> usize {
    let memory_cap = if per_channel_budget == 0 {
        MAX_CHANNELS
    } else {
        (profile.available_memory / per_channel_budget as u64).max(1) as usize
    };
    profile
        .proposed_channels
        .clamp(1, MAX_CHANNELS)
        .min(memory_cap)
        .min(transport_channels.max(1))
}

/// Partitions `files` across channels with greedy longest-processing-time
/// bin packing: files sorted descending by size, each assigned to the
/// channel currently holding the least contracted bytes.
///
/// Every file lands in exactly one assignment. An empty file set yields
/// zero assignments; the caller treats that as immediate completion,
/// not an error. Channels that receive no files are omitted.
pub fn negotiate(
    files: &[Arc<TransferableFile>],
    profile: &ResourceProfile,
    transport_channels: usize,
    per_channel_budget: usize,
) -> Vec<ChannelAssignment> {
    if files.is_empty() {
        return Vec::new();
    }

    let count = channel_count(profile, transport_channels, per_channel_budget);
    let mut assignments: Vec<ChannelAssignment> = (0..count)
        .map(|channel_index| ChannelAssignment {
            channel_index,
            files: Vec::new(),
            contracted_bytes: 0,
        })
        .collect();

    // Sort by size descending; tie-break on path for determinism.
    let mut ordered: Vec<&Arc<TransferableFile>> = files.iter().collect();
    ordered.sort_by(|a, b| b.size.cmp(&a.size).then_with(|| a.path.cmp(&b.path)));

    for file in ordered {
        let lightest = assignments
            .iter_mut()
            .min_by_key(|a| a.contracted_bytes)
            .expect("at least one channel");
        lightest.contracted_bytes += file.size;
        lightest.files.push(Arc::clone(file));
    }

    assignments.retain(|a| !a.files.is_empty());

    debug!(
        files = files.len(),
        channels = assignments.len(),
        "negotiated channel assignments"
    );
    assignments
}
