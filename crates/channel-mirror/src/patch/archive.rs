//! Patch archive layout
//!
//! ```text
//! <name>/
//! ├── patch.json                 (metadata)
//! ├── patch_generator.tar.gz     (all instruction files)
//! └── <subdir>/
//!     ├── records.json           (records of the added packages)
//!     ├── patch_instructions.json
//!     └── <added package files>
//! ```
//!
//! The archive has no index, so it cannot be used as a channel directly.

use super::PatchError;
use crate::channel::RecordManifest;
use crate::channel::RECORDS_FILE;
use crate::hotfix::{HotfixInstructions, INSTRUCTIONS_FILE};
use crate::record::PackageRecord;
use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use tar::Archive;

/// File name of the archive metadata
pub const METADATA_FILE: &str = "patch.json";

/// Newest archive format this crate reads and writes
pub const FORMAT_VERSION: u32 = 1;

/// A package listed in the archive metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveEntry {
    pub subdir: String,
    pub filename: String,
    pub name: String,
    pub version: String,
    pub build: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    #[serde(default)]
    pub size: u64,
}

impl From<&PackageRecord> for ArchiveEntry {
    fn from(record: &PackageRecord) -> Self {
        Self {
            subdir: record.subdir.clone(),
            filename: record.filename.clone(),
            name: record.name.clone(),
            version: record.version.to_string(),
            build: record.build.clone(),
            sha256: record.sha256.clone(),
            size: record.size,
        }
    }
}

/// Contents of `patch.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveMetadata {
    pub format_version: u32,
    pub name: String,

    /// Channel the patch was generated from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,

    pub created_at: DateTime<Utc>,

    /// Subdirs the patch carries state for
    pub subdirs: BTreeSet<String>,

    #[serde(default)]
    pub additions: Vec<ArchiveEntry>,

    /// Removed packages with the checksum they had upstream
    #[serde(default)]
    pub removals: Vec<ArchiveEntry>,
}

impl ArchiveMetadata {
    /// Creation time in milliseconds since the Unix epoch
    pub fn created_millis(&self) -> u64 {
        self.created_at.timestamp_millis().max(0) as u64
    }

    /// Fail if a file is both added and removed
    pub fn check_disjoint(&self) -> Result<(), PatchError> {
        let added: HashSet<(&str, &str)> = self
            .additions
            .iter()
            .map(|e| (e.subdir.as_str(), e.filename.as_str()))
            .collect();

        let mut overlap: Vec<String> = self
            .removals
            .iter()
            .filter(|e| added.contains(&(e.subdir.as_str(), e.filename.as_str())))
            .map(|e| format!("{}/{}", e.subdir, e.filename))
            .collect();

        if overlap.is_empty() {
            Ok(())
        } else {
            overlap.sort();
            Err(PatchError::Overlap(overlap))
        }
    }
}

/// A staged patch directory
#[derive(Debug, Clone)]
pub struct PatchArchive {
    root: PathBuf,
    metadata: ArchiveMetadata,
}

impl PatchArchive {
    /// Open a patch directory
    pub fn open(root: impl AsRef<Path>) -> Result<Self, PatchError> {
        let root = root.as_ref().to_path_buf();
        let metadata_path = root.join(METADATA_FILE);
        let bytes = match fs::read(&metadata_path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(PatchError::InvalidArchive {
                    path: root.display().to_string(),
                    reason: format!("missing {}", METADATA_FILE),
                })
            }
            Err(e) => return Err(e.into()),
        };

        let metadata: ArchiveMetadata = serde_json::from_slice(&bytes)?;
        if metadata.format_version > FORMAT_VERSION {
            return Err(PatchError::UnsupportedFormat(metadata.format_version));
        }
        metadata.check_disjoint()?;

        Ok(Self { root, metadata })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn metadata(&self) -> &ArchiveMetadata {
        &self.metadata
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    /// Records of the packages added in a subdir
    pub fn records(&self, subdir: &str) -> Result<RecordManifest, PatchError> {
        Ok(RecordManifest::load(
            &self.root.join(subdir).join(RECORDS_FILE),
            subdir,
        )?)
    }

    /// Hotfix instructions shipped for a subdir
    pub fn instructions(&self, subdir: &str) -> Result<HotfixInstructions, PatchError> {
        Ok(HotfixInstructions::load(
            &self.root.join(subdir).join(INSTRUCTIONS_FILE),
        )?)
    }

    pub fn payload_path(&self, subdir: &str, filename: &str) -> PathBuf {
        self.root.join(subdir).join(filename)
    }

    /// Write the archive as a `.tar.gz` file
    pub fn pack(&self, tarball: &Path) -> Result<(), PatchError> {
        if let Some(parent) = tarball.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = fs::File::create(tarball)?;
        let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
        builder.append_dir_all(self.name(), &self.root)?;
        builder.into_inner()?.finish()?.sync_all()?;
        Ok(())
    }

    /// Extract a packed archive below `parent` and open it
    pub fn unpack(tarball: &Path, parent: &Path) -> Result<Self, PatchError> {
        let invalid = |reason: String| PatchError::InvalidArchive {
            path: tarball.display().to_string(),
            reason,
        };

        fs::create_dir_all(parent)?;
        let mut archive = Archive::new(GzDecoder::new(fs::File::open(tarball)?));
        let mut top: Option<PathBuf> = None;

        for entry in archive
            .entries()
            .map_err(|e| invalid(format!("failed to read tar entries: {}", e)))?
        {
            let mut entry = entry.map_err(|e| invalid(format!("failed to read entry: {}", e)))?;
            let entry_path = entry
                .path()
                .map_err(|e| invalid(format!("invalid entry path: {}", e)))?
                .into_owned();

            let first = match entry_path.components().next() {
                Some(Component::Normal(first)) => PathBuf::from(first),
                _ => return Err(invalid(format!("unexpected entry {}", entry_path.display()))),
            };

            match &top {
                None => {
                    if parent.join(&first).exists() {
                        return Err(PatchError::AlreadyExists(
                            parent.join(&first).display().to_string(),
                        ));
                    }
                    top = Some(first);
                }
                Some(top) if *top != first => {
                    return Err(invalid("entries do not share one top-level directory".to_string()));
                }
                Some(_) => {}
            }

            let unpacked = entry
                .unpack_in(parent)
                .map_err(|e| invalid(format!("failed to extract {}: {}", entry_path.display(), e)))?;
            if !unpacked {
                return Err(invalid(format!("unsafe entry path {}", entry_path.display())));
            }
        }

        let top = top.ok_or_else(|| invalid("archive is empty".to_string()))?;
        Self::open(parent.join(top))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::version::Version;
    use tempfile::TempDir;

    fn metadata(name: &str) -> ArchiveMetadata {
        let record = PackageRecord::new("a", Version::parse("1.0").unwrap(), "0", "noarch")
            .with_contents(b"a");
        ArchiveMetadata {
            format_version: FORMAT_VERSION,
            name: name.to_string(),
            parent: None,
            created_at: Utc::now(),
            subdirs: ["noarch".to_string()].into_iter().collect(),
            additions: vec![ArchiveEntry::from(&record)],
            removals: Vec::new(),
        }
    }

    fn write_archive(root: &Path, metadata: &ArchiveMetadata) {
        fs::create_dir_all(root.join("noarch")).unwrap();
        fs::write(root.join("noarch").join("a-1.0-0.tar.bz2"), b"a").unwrap();
        fs::write(
            root.join(METADATA_FILE),
            serde_json::to_vec_pretty(metadata).unwrap(),
        )
        .unwrap();
    }

    #[test]
    fn test_open_requires_metadata() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            PatchArchive::open(dir.path()),
            Err(PatchError::InvalidArchive { .. })
        ));
    }

    #[test]
    fn test_open_rejects_newer_format() {
        let dir = TempDir::new().unwrap();
        let mut meta = metadata("p");
        meta.format_version = FORMAT_VERSION + 1;
        write_archive(dir.path(), &meta);
        assert!(matches!(
            PatchArchive::open(dir.path()),
            Err(PatchError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_overlap_detected() {
        let mut meta = metadata("p");
        meta.removals = meta.additions.clone();
        assert!(matches!(meta.check_disjoint(), Err(PatchError::Overlap(_))));
    }

    #[test]
    fn test_pack_and_unpack() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("patch_one");
        write_archive(&root, &metadata("patch_one"));
        let archive = PatchArchive::open(&root).unwrap();

        let tarball = dir.path().join("transfer").join("patch_one.tar.gz");
        archive.pack(&tarball).unwrap();

        let unpacked = PatchArchive::unpack(&tarball, &dir.path().join("other")).unwrap();
        assert_eq!(unpacked.name(), "patch_one");
        assert_eq!(unpacked.metadata(), archive.metadata());
        assert_eq!(
            fs::read(unpacked.payload_path("noarch", "a-1.0-0.tar.bz2")).unwrap(),
            b"a"
        );

        // Same destination twice
        assert!(matches!(
            PatchArchive::unpack(&tarball, &dir.path().join("other")),
            Err(PatchError::AlreadyExists(_))
        ));
    }

    #[test]
    fn test_metadata_timestamp() {
        let mut meta = metadata("p");
        meta.created_at = DateTime::from_timestamp_millis(1_700_000_000_123).unwrap();
        assert_eq!(meta.created_millis(), 1_700_000_000_123);

        let json = serde_json::to_value(&meta).unwrap();
        assert!(json["created_at"].as_str().unwrap().starts_with("2023-11-14T"));
    }
}
