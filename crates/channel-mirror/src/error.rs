//! Error types shared across modules

use crate::config::ConfigError;
use crate::matchspec::SpecError;
use crate::patch::{PatchConflictError, PatchError};
use crate::resolver::ResolverError;
use thiserror::Error;

/// Errors raised while reading from or writing to a channel
#[derive(Debug, Error)]
pub enum ChannelAccessError {
    /// IO error (file operations)
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Malformed JSON in channel metadata
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// Channel directory does not exist
    #[error("Channel not found: {0}")]
    ChannelNotFound(String),

    /// Package file or record is missing
    #[error("Package not found: {0}")]
    PackageNotFound(String),

    /// Downloaded file has the wrong size
    #[error("Size mismatch for {filename}: expected {expected}, got {actual}")]
    SizeMismatch {
        filename: String,
        expected: u64,
        actual: u64,
    },

    /// Downloaded file has the wrong checksum
    #[error("Checksum mismatch for {filename}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        filename: String,
        expected: String,
        actual: String,
    },

    /// Channel metadata is inconsistent
    #[error("Invalid channel data in {path}: {reason}")]
    InvalidData { path: String, reason: String },

    /// Repository could not answer
    #[error("Repository unavailable: {0}")]
    Unavailable(String),
}

/// Errors raised by an indexer after channel files have changed
#[derive(Debug, Error)]
pub enum IndexError {
    /// IO error (file operations)
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Failed to serialize the index
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// Failed to read channel state
    #[error("Failed to read channel: {0}")]
    Channel(#[from] ChannelAccessError),

    /// Indexer reported a failure
    #[error("Indexing {subdir} failed: {reason}")]
    Failed { subdir: String, reason: String },
}

/// Top-level error of the mirroring operations
#[derive(Debug, Error)]
pub enum MirrorError {
    #[error(transparent)]
    Spec(SpecError),

    #[error(transparent)]
    Resolver(ResolverError),

    #[error(transparent)]
    ChannelAccess(ChannelAccessError),

    #[error(transparent)]
    Conflict(PatchConflictError),

    #[error(transparent)]
    Patch(PatchError),

    /// Indexing failed after the channel was modified
    #[error(transparent)]
    Index(IndexError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl From<SpecError> for MirrorError {
    fn from(error: SpecError) -> Self {
        MirrorError::Spec(error)
    }
}

impl From<ChannelAccessError> for MirrorError {
    fn from(error: ChannelAccessError) -> Self {
        MirrorError::ChannelAccess(error)
    }
}

impl From<IndexError> for MirrorError {
    fn from(error: IndexError) -> Self {
        MirrorError::Index(error)
    }
}

impl From<PatchConflictError> for MirrorError {
    fn from(error: PatchConflictError) -> Self {
        MirrorError::Conflict(error)
    }
}

impl From<ResolverError> for MirrorError {
    fn from(error: ResolverError) -> Self {
        match error {
            ResolverError::Spec(e) => MirrorError::Spec(e),
            ResolverError::ChannelAccess(e) => MirrorError::ChannelAccess(e),
            other => MirrorError::Resolver(other),
        }
    }
}

impl From<PatchError> for MirrorError {
    fn from(error: PatchError) -> Self {
        match error {
            PatchError::Conflict(e) => MirrorError::Conflict(e),
            PatchError::ChannelAccess(e) => MirrorError::ChannelAccess(e),
            PatchError::Index(e) => MirrorError::Index(e),
            other => MirrorError::Patch(other),
        }
    }
}
