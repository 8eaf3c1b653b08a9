//! Channel access
//!
//! Traits for the collaborators the mirroring engine consumes, the
//! [`ChannelSnapshot`] value they produce, and the directory-backed
//! [`LocalChannel`] reference implementation.

mod index;
mod local;

pub use index::{Repodata, RepodataIndexer, RepodataInfo, REPODATA_FILE};
pub use local::{LocalChannel, RecordManifest, RECORDS_FILE};
pub(crate) use local::verify_package;

use crate::error::{ChannelAccessError, IndexError};
use crate::hotfix::HotfixInstructions;
use crate::record::PackageRecord;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;

/// Reads the records currently published by a channel
pub trait SnapshotReader {
    fn snapshot(&self, subdirs: &BTreeSet<String>) -> Result<ChannelSnapshot, ChannelAccessError>;
}

/// Rebuilds the installable index of a channel directory
pub trait Indexer {
    fn reindex(&self, channel_root: &Path) -> Result<(), IndexError>;
}

/// Copies a package file to a local path, verifying size and checksum
pub trait PackageFetcher {
    fn fetch(&self, record: &PackageRecord, destination: &Path) -> Result<(), ChannelAccessError>;
}

/// Reads the hotfix instructions a channel publishes for a subdir
pub trait HotfixSource {
    fn instructions(&self, subdir: &str) -> Result<HotfixInstructions, ChannelAccessError>;
}

impl<T: SnapshotReader + ?Sized> SnapshotReader for &T {
    fn snapshot(&self, subdirs: &BTreeSet<String>) -> Result<ChannelSnapshot, ChannelAccessError> {
        (**self).snapshot(subdirs)
    }
}

impl<T: Indexer + ?Sized> Indexer for &T {
    fn reindex(&self, channel_root: &Path) -> Result<(), IndexError> {
        (**self).reindex(channel_root)
    }
}

impl<T: PackageFetcher + ?Sized> PackageFetcher for &T {
    fn fetch(&self, record: &PackageRecord, destination: &Path) -> Result<(), ChannelAccessError> {
        (**self).fetch(record, destination)
    }
}

impl<T: HotfixSource + ?Sized> HotfixSource for &T {
    fn instructions(&self, subdir: &str) -> Result<HotfixInstructions, ChannelAccessError> {
        (**self).instructions(subdir)
    }
}

/// Records present in a channel, by subdir and file name
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelSnapshot {
    subdirs: BTreeMap<String, BTreeMap<String, Arc<PackageRecord>>>,
}

impl ChannelSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_records<I>(records: I) -> Self
    where
        I: IntoIterator<Item = Arc<PackageRecord>>,
    {
        let mut snapshot = Self::new();
        for record in records {
            snapshot.insert(record);
        }
        snapshot
    }

    pub fn insert(&mut self, record: Arc<PackageRecord>) {
        self.subdirs
            .entry(record.subdir.clone())
            .or_default()
            .insert(record.filename.clone(), record);
    }

    pub fn get(&self, subdir: &str, filename: &str) -> Option<&Arc<PackageRecord>> {
        self.subdirs.get(subdir)?.get(filename)
    }

    /// Check if the snapshot holds a record with the same identity
    pub fn contains(&self, record: &PackageRecord) -> bool {
        self.get(&record.subdir, &record.filename)
            .is_some_and(|present| **present == *record)
    }

    /// All records, ordered by subdir then file name
    pub fn records(&self) -> impl Iterator<Item = &Arc<PackageRecord>> {
        self.subdirs.values().flat_map(BTreeMap::values)
    }

    pub fn subdirs(&self) -> impl Iterator<Item = &str> {
        self.subdirs.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.subdirs.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
