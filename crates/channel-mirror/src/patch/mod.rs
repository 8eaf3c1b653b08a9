//! Patch archives
//!
//! A patch archive carries the changes between two channel states to a
//! disconnected system. It is staged from a [`Diff`](crate::diff::Diff) and
//! merged into a [`LocalChannel`](crate::channel::LocalChannel).

mod archive;
mod merge;
mod stage;

pub use archive::{ArchiveEntry, ArchiveMetadata, PatchArchive, FORMAT_VERSION, METADATA_FILE};
pub use merge::{MergeFailure, MergeReport, MergeState, PatchMerger};
pub use stage::{default_patch_name, PatchStager};

use crate::error::{ChannelAccessError, IndexError};
use std::fmt;
use thiserror::Error;

/// Errors that can occur while staging or merging patches
#[derive(Debug, Error)]
pub enum PatchError {
    /// IO error (file operations)
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Malformed patch metadata
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// Reading or writing a channel failed
    #[error("Channel access failed: {0}")]
    ChannelAccess(#[from] ChannelAccessError),

    /// The patch disagrees with the target channel
    #[error(transparent)]
    Conflict(#[from] PatchConflictError),

    /// The target changed but could not be indexed
    #[error("Indexing failed after merge: {0}")]
    Index(#[from] IndexError),

    /// A file is both added and removed
    #[error("Patch additions and removals overlap: {}", .0.join(", "))]
    Overlap(Vec<String>),

    /// Archive layout is broken
    #[error("Invalid patch archive {path}: {reason}")]
    InvalidArchive { path: String, reason: String },

    /// Patch name cannot be used as a directory name
    #[error("Invalid patch name: {0}")]
    InvalidName(String),

    /// Patch directory already exists
    #[error("Patch already exists: {0}")]
    AlreadyExists(String),

    /// Archive written by a newer format
    #[error("Unsupported patch format version {0}")]
    UnsupportedFormat(u32),
}

/// Why a patch entry cannot be applied
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictReason {
    /// Added file exists in the target with other contents
    ChecksumDiffers {
        existing: Option<String>,
        incoming: Option<String>,
    },

    /// Added file is revoked in the target for other contents
    RevokedWithDifferentChecksum { revoked: String, incoming: String },

    /// Removed file exists in the target with other contents
    RemovalChecksumDiffers {
        existing: Option<String>,
        expected: Option<String>,
    },

    /// Removed file is neither present nor revoked in the target
    RemovalUnknown,
}

impl fmt::Display for ConflictReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let show = |sha: &Option<String>| sha.clone().unwrap_or_else(|| "unknown".to_string());
        match self {
            ConflictReason::ChecksumDiffers { existing, incoming } => write!(
                f,
                "already present with checksum {} (patch has {})",
                show(existing),
                show(incoming)
            ),
            ConflictReason::RevokedWithDifferentChecksum { revoked, incoming } => write!(
                f,
                "revoked for checksum {} (patch has {})",
                revoked, incoming
            ),
            ConflictReason::RemovalChecksumDiffers { existing, expected } => write!(
                f,
                "present with checksum {} (patch removes {})",
                show(existing),
                show(expected)
            ),
            ConflictReason::RemovalUnknown => write!(f, "removed file is unknown to the target"),
        }
    }
}

/// One conflicting patch entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conflict {
    pub subdir: String,
    pub filename: String,
    pub reason: ConflictReason,
}

impl fmt::Display for Conflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}: {}", self.subdir, self.filename, self.reason)
    }
}

/// Every conflict found while validating a merge
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Patch conflicts with target channel: {}", join_conflicts(.conflicts))]
pub struct PatchConflictError {
    pub conflicts: Vec<Conflict>,
}

fn join_conflicts(conflicts: &[Conflict]) -> String {
    conflicts
        .iter()
        .map(Conflict::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_message() {
        let error = PatchConflictError {
            conflicts: vec![
                Conflict {
                    subdir: "noarch".into(),
                    filename: "a-1.0-0.tar.bz2".into(),
                    reason: ConflictReason::RemovalUnknown,
                },
                Conflict {
                    subdir: "noarch".into(),
                    filename: "b-1.0-0.tar.bz2".into(),
                    reason: ConflictReason::ChecksumDiffers {
                        existing: Some("aa".into()),
                        incoming: None,
                    },
                },
            ],
        };

        assert_eq!(
            error.to_string(),
            "Patch conflicts with target channel: \
             noarch/a-1.0-0.tar.bz2: removed file is unknown to the target; \
             noarch/b-1.0-0.tar.bz2: already present with checksum aa (patch has unknown)"
        );
    }
}
