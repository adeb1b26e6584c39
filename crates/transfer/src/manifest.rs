//! Manifest construction and validation.
//!
//! Each peer declares, per channel, exactly which files it will send.
//! The declaration is a binding contract exchanged before any payload
//! byte moves; a manifest that fails validation indicates a negotiation
//! bug and is fatal to the session, not a retryable condition.

use std::collections::HashSet;
use std::path::{Component, Path};

use skiff_protocol::messages::{ChannelManifest, FileSpec};

use crate::TransferError;
use crate::types::ChannelAssignment;

/// Builds one manifest per transport channel from the local assignments.
///
/// Channels without an assignment get an explicit empty manifest so the
/// peer knows nothing is coming on them.
pub fn build_manifests(
    assignments: &[ChannelAssignment],
    channel_count: usize,
) -> Vec<ChannelManifest> {
    let mut manifests: Vec<ChannelManifest> = (0..channel_count)
        .map(|channel_index| ChannelManifest {
            channel_index,
            files: Vec::new(),
        })
        .collect();

    for assignment in assignments {
        let manifest = &mut manifests[assignment.channel_index];
        manifest.files = assignment
            .files
            .iter()
            .map(|f| FileSpec {
                path: f.path.clone(),
                size: f.size,
                hash: f.hash.clone(),
            })
            .collect();
    }

    manifests
}

/// Validates that a manifest file path cannot escape the receiver's
/// output root: relative, no parent traversal, no prefix components.
pub fn validate_file_path(file_path: &str) -> Result<(), TransferError> {
    if file_path.is_empty() {
        return Err(TransferError::InvalidPath("empty path".into()));
    }

    let path = Path::new(file_path);

    if path.is_absolute() {
        return Err(TransferError::InvalidPath(format!(
            "absolute path not allowed: {file_path}"
        )));
    }

    for component in path.components() {
        match component {
            Component::ParentDir => {
                return Err(TransferError::InvalidPath(format!(
                    "parent directory traversal not allowed: {file_path}"
                )));
            }
            Component::Prefix(_) => {
                return Err(TransferError::InvalidPath(format!(
                    "path prefix not allowed: {file_path}"
                )));
            }
            Component::RootDir => {
                return Err(TransferError::InvalidPath(format!(
                    "absolute path not allowed: {file_path}"
                )));
            }
            Component::CurDir | Component::Normal(_) => {}
        }
    }

    Ok(())
}

/// Incremental validator for the peer's manifests.
///
/// Accepts exactly one manifest per channel index and enforces the
/// session-wide invariant that no path appears twice.
#[derive(Debug)]
pub struct ManifestValidator {
    channel_count: usize,
    accepted: HashSet<usize>,
    seen_paths: HashSet<String>,
}

impl ManifestValidator {
    pub fn new(channel_count: usize) -> Self {
        Self {
            channel_count,
            accepted: HashSet::new(),
            seen_paths: HashSet::new(),
        }
    }

    /// Validates and records one manifest. Any rejection is fatal to the
    /// session.
    pub fn accept(&mut self, manifest: &ChannelManifest) -> Result<(), TransferError> {
        if manifest.channel_index >= self.channel_count {
            return Err(TransferError::ManifestMismatch(format!(
                "unknown channel index {} (transport has {})",
                manifest.channel_index, self.channel_count
            )));
        }
        if !self.accepted.insert(manifest.channel_index) {
            return Err(TransferError::ManifestMismatch(format!(
                "duplicate manifest for channel {}",
                manifest.channel_index
            )));
        }

        for file in &manifest.files {
            validate_file_path(&file.path)
                .map_err(|e| TransferError::ManifestMismatch(e.to_string()))?;
            if file.hash.len() != 64 || !file.hash.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Err(TransferError::ManifestMismatch(format!(
                    "malformed content hash for {}",
                    file.path
                )));
            }
            if !self.seen_paths.insert(file.path.clone()) {
                return Err(TransferError::ManifestMismatch(format!(
                    "duplicate path across manifests: {}",
                    file.path
                )));
            }
        }

        Ok(())
    }

    /// Whether a manifest has been accepted for every channel.
    pub fn is_complete(&self) -> bool {
        self.accepted.len() == self.channel_count
    }
}
