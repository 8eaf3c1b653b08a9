//! Directory-backed channel
//!
//! Layout:
//! ```text
//! <root>/
//! ├── <subdir>/
//! │   ├── records.json             (record manifest)
//! │   ├── patch_instructions.json  (hotfix directives)
//! │   ├── repodata.json            (written by the indexer)
//! │   └── <package files>
//! └── patch_generator.tar.gz
//! ```
//!
//! Subdirs are replaced as a whole: a new version is staged in
//! `.staging-<subdir>` and renamed into place. A pending swap is recorded
//! in `.swap-pending.json` so that opening the channel can finish it.
//! `.index-pending` exists from the swap until the indexer has succeeded.

use super::{HotfixSource, PackageFetcher, SnapshotReader};
use crate::channel::ChannelSnapshot;
use crate::error::ChannelAccessError;
use crate::fsutil;
use crate::hotfix::{self, Directive, HotfixInstructions, INSTRUCTIONS_FILE};
use crate::matchspec::MatchSpec;
use crate::record::PackageRecord;
use crate::repository::CandidateRepository;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// File name of the per-subdir record manifest
pub const RECORDS_FILE: &str = "records.json";

const MANIFEST_VERSION: u32 = 1;
const STAGING_PREFIX: &str = ".staging-";
const BACKUP_PREFIX: &str = ".old-";
const SWAP_MARKER: &str = ".swap-pending.json";
const INDEX_MARKER: &str = ".index-pending";

/// Every record stored in one subdir, keyed by file name
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordManifest {
    #[serde(rename = "manifest_version", default = "default_manifest_version")]
    pub version: u32,

    pub subdir: String,

    #[serde(default)]
    pub packages: BTreeMap<String, PackageRecord>,
}

fn default_manifest_version() -> u32 {
    MANIFEST_VERSION
}

impl RecordManifest {
    pub fn new(subdir: &str) -> Self {
        Self {
            version: MANIFEST_VERSION,
            subdir: subdir.to_string(),
            packages: BTreeMap::new(),
        }
    }

    /// Load a manifest; a missing file is an empty manifest
    pub fn load(path: &Path, subdir: &str) -> Result<Self, ChannelAccessError> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Self::new(subdir)),
            Err(e) => return Err(e.into()),
        };

        let manifest: RecordManifest = serde_json::from_slice(&bytes)?;
        let invalid = |reason: String| ChannelAccessError::InvalidData {
            path: path.display().to_string(),
            reason,
        };

        if manifest.subdir != subdir {
            return Err(invalid(format!(
                "manifest is for subdir '{}', expected '{}'",
                manifest.subdir, subdir
            )));
        }
        for (filename, record) in &manifest.packages {
            if *filename != record.filename || record.subdir != subdir {
                return Err(invalid(format!("entry '{}' does not match its record", filename)));
            }
        }

        Ok(manifest)
    }

    pub fn save(&self, path: &Path) -> Result<(), ChannelAccessError> {
        fsutil::write_json_atomic(path, self)?;
        Ok(())
    }

    pub fn get(&self, filename: &str) -> Option<&PackageRecord> {
        self.packages.get(filename)
    }

    /// Insert a record, returning the one it replaced
    pub fn insert(&mut self, record: PackageRecord) -> Option<PackageRecord> {
        self.packages.insert(record.filename.clone(), record)
    }

    pub fn remove(&mut self, filename: &str) -> Option<PackageRecord> {
        self.packages.remove(filename)
    }

    pub fn len(&self) -> usize {
        self.packages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }
}

/// Check a package file against the size and checksum of its record
pub(crate) fn verify_package(path: &Path, record: &PackageRecord) -> Result<(), ChannelAccessError> {
    let (size, sha256) = fsutil::file_digest(path)?;

    if record.size > 0 && size != record.size {
        return Err(ChannelAccessError::SizeMismatch {
            filename: record.filename.clone(),
            expected: record.size,
            actual: size,
        });
    }

    if let Some(expected) = &record.sha256 {
        if !expected.eq_ignore_ascii_case(&sha256) {
            return Err(ChannelAccessError::ChecksumMismatch {
                filename: record.filename.clone(),
                expected: expected.clone(),
                actual: sha256,
            });
        }
    }

    Ok(())
}

fn check_filename(record: &PackageRecord) -> Result<(), ChannelAccessError> {
    let valid = !record.filename.is_empty()
        && !record.filename.starts_with('.')
        && !record.filename.contains(['/', '\\']);
    if valid {
        Ok(())
    } else {
        Err(ChannelAccessError::InvalidData {
            path: record.subdir.clone(),
            reason: format!("invalid package file name '{}'", record.filename),
        })
    }
}

/// A channel stored in a local directory
#[derive(Debug)]
pub struct LocalChannel {
    root: PathBuf,
    manifests: RwLock<HashMap<String, Arc<RecordManifest>>>,
}

impl LocalChannel {
    /// Create the channel directory if needed and open it
    pub fn create(root: impl AsRef<Path>) -> Result<Self, ChannelAccessError> {
        fs::create_dir_all(root.as_ref())?;
        Self::open(root)
    }

    /// Open an existing channel directory
    ///
    /// Finishes a subdir swap that was interrupted and removes leftovers of
    /// merges that never committed.
    pub fn open(root: impl AsRef<Path>) -> Result<Self, ChannelAccessError> {
        let root = root.as_ref().to_path_buf();
        if !root.is_dir() {
            return Err(ChannelAccessError::ChannelNotFound(root.display().to_string()));
        }

        let channel = Self {
            root,
            manifests: RwLock::new(HashMap::new()),
        };
        channel.recover()?;
        Ok(channel)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn subdir_path(&self, subdir: &str) -> PathBuf {
        self.root.join(subdir)
    }

    pub fn package_path(&self, record: &PackageRecord) -> PathBuf {
        self.subdir_path(&record.subdir).join(&record.filename)
    }

    /// Subdirs present on disk
    pub fn subdirs(&self) -> Result<BTreeSet<String>, ChannelAccessError> {
        let mut subdirs = BTreeSet::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if entry.file_type()?.is_dir() && !name.starts_with('.') {
                subdirs.insert(name);
            }
        }
        Ok(subdirs)
    }

    /// Record manifest of a subdir
    pub fn manifest(&self, subdir: &str) -> Result<Arc<RecordManifest>, ChannelAccessError> {
        if let Some(manifest) = self.manifests.read().get(subdir) {
            return Ok(manifest.clone());
        }

        let path = self.subdir_path(subdir).join(RECORDS_FILE);
        let manifest = Arc::new(RecordManifest::load(&path, subdir)?);
        self.manifests
            .write()
            .insert(subdir.to_string(), manifest.clone());
        Ok(manifest)
    }

    /// Hotfix directives of a subdir
    pub fn hotfixes(&self, subdir: &str) -> Result<HotfixInstructions, ChannelAccessError> {
        HotfixInstructions::load(&self.subdir_path(subdir).join(INSTRUCTIONS_FILE))
    }

    /// Store a package file and its record
    ///
    /// Size and checksum of the record are taken from `contents`.
    pub fn publish(
        &self,
        record: PackageRecord,
        contents: &[u8],
    ) -> Result<PackageRecord, ChannelAccessError> {
        check_filename(&record)?;
        let record = record.with_contents(contents);
        let dir = self.subdir_path(&record.subdir);

        fsutil::write_atomic(&dir.join(&record.filename), contents)?;

        let mut manifest = (*self.manifest(&record.subdir)?).clone();
        manifest.insert(record.clone());
        manifest.save(&dir.join(RECORDS_FILE))?;
        self.manifests.write().remove(&record.subdir);

        debug!(channel = %self.root.display(), package = %record, "Published package");
        Ok(record)
    }

    /// Merge a hotfix directive into a subdir; returns whether it changed
    pub fn add_directive(
        &self,
        subdir: &str,
        filename: &str,
        directive: Directive,
    ) -> Result<bool, ChannelAccessError> {
        let mut instructions = self.hotfixes(subdir)?;
        if !instructions.merge_directive(filename, directive) {
            return Ok(false);
        }

        instructions.save(&self.subdir_path(subdir).join(INSTRUCTIONS_FILE))?;
        self.write_patch_generator()?;
        Ok(true)
    }

    /// Write `patch_generator.tar.gz` from the instructions of every subdir
    pub fn write_patch_generator(&self) -> Result<PathBuf, ChannelAccessError> {
        let subdirs = self.subdirs()?;
        Ok(hotfix::write_generator(
            &self.root,
            subdirs.iter().map(String::as_str),
        )?)
    }

    pub(crate) fn staging_path(&self, subdir: &str) -> PathBuf {
        self.root.join(format!("{}{}", STAGING_PREFIX, subdir))
    }

    fn backup_path(&self, subdir: &str) -> PathBuf {
        self.root.join(format!("{}{}", BACKUP_PREFIX, subdir))
    }

    /// Swap the staged subdirs into place
    pub(crate) fn commit_staged(&self, subdirs: &[String]) -> Result<(), ChannelAccessError> {
        let marker = self.root.join(SWAP_MARKER);
        fsutil::write_json_atomic(&marker, &subdirs)?;
        self.roll_forward(subdirs)?;
        fs::remove_file(&marker)?;
        self.invalidate();
        Ok(())
    }

    fn roll_forward(&self, subdirs: &[String]) -> Result<(), ChannelAccessError> {
        for subdir in subdirs {
            let live = self.subdir_path(subdir);
            let staging = self.staging_path(subdir);
            let backup = self.backup_path(subdir);

            if staging.is_dir() {
                if live.exists() {
                    fsutil::remove_dir_if_exists(&backup)?;
                    fs::rename(&live, &backup)?;
                }
                fs::rename(&staging, &live)?;
            }
            fsutil::remove_dir_if_exists(&backup)?;
        }
        Ok(())
    }

    fn recover(&self) -> Result<(), ChannelAccessError> {
        let marker = self.root.join(SWAP_MARKER);
        if marker.is_file() {
            let subdirs: Vec<String> = serde_json::from_slice(&fs::read(&marker)?)?;
            warn!(
                channel = %self.root.display(),
                subdirs = ?subdirs,
                "Finishing interrupted subdir swap"
            );
            self.roll_forward(&subdirs)?;
            fs::remove_file(&marker)?;
        }
        if self.index_pending() {
            warn!(channel = %self.root.display(), "Index is stale until the channel is reindexed");
        }

        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();

            if let Some(subdir) = name.strip_prefix(BACKUP_PREFIX) {
                let live = self.subdir_path(subdir);
                if live.exists() {
                    fsutil::remove_dir_if_exists(&entry.path())?;
                } else {
                    warn!(channel = %self.root.display(), subdir, "Restoring subdir backup");
                    fs::rename(entry.path(), live)?;
                }
            } else if name.starts_with(STAGING_PREFIX) {
                warn!(channel = %self.root.display(), staging = %name, "Removing abandoned staging directory");
                fsutil::remove_dir_if_exists(&entry.path())?;
            }
        }

        Ok(())
    }

    /// Check if committed changes still wait for the indexer
    pub fn index_pending(&self) -> bool {
        self.root.join(INDEX_MARKER).is_file()
    }

    pub(crate) fn mark_index_pending(&self) -> Result<(), ChannelAccessError> {
        Ok(fsutil::write_atomic(&self.root.join(INDEX_MARKER), b"")?)
    }

    pub(crate) fn clear_index_pending(&self) -> Result<(), ChannelAccessError> {
        match fs::remove_file(self.root.join(INDEX_MARKER)) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    pub(crate) fn invalidate(&self) {
        self.manifests.write().clear();
    }
}

impl CandidateRepository for LocalChannel {
    fn search(
        &self,
        spec: &MatchSpec,
        subdirs: &BTreeSet<String>,
    ) -> Result<Vec<Arc<PackageRecord>>, ChannelAccessError> {
        let mut found = Vec::new();
        for subdir in subdirs {
            if spec.subdir().is_some_and(|s| s != subdir) {
                continue;
            }

            let manifest = self.manifest(subdir)?;
            let hotfixes = self.hotfixes(subdir)?;
            for record in manifest.packages.values() {
                if !spec.matches(record) {
                    continue;
                }
                if let Some(published) = hotfixes.apply(record)? {
                    found.push(Arc::new(published));
                }
            }
        }

        found.sort();
        Ok(found)
    }
}

impl SnapshotReader for LocalChannel {
    fn snapshot(&self, subdirs: &BTreeSet<String>) -> Result<ChannelSnapshot, ChannelAccessError> {
        let mut snapshot = ChannelSnapshot::new();
        for subdir in subdirs {
            let manifest = self.manifest(subdir)?;
            let hotfixes = self.hotfixes(subdir)?;
            for record in manifest.packages.values() {
                if !hotfixes.is_withdrawn(&record.filename) {
                    snapshot.insert(Arc::new(record.clone()));
                }
            }
        }
        Ok(snapshot)
    }
}

impl PackageFetcher for LocalChannel {
    fn fetch(&self, record: &PackageRecord, destination: &Path) -> Result<(), ChannelAccessError> {
        check_filename(record)?;
        let source = self.package_path(record);
        if !source.is_file() {
            return Err(ChannelAccessError::PackageNotFound(record.to_string()));
        }

        let parent = destination.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent)?;
        let partial = parent.join(format!(".{}.part", record.filename));

        fs::copy(&source, &partial)?;
        if let Err(e) = verify_package(&partial, record) {
            fs::remove_file(&partial)?;
            return Err(e);
        }
        fs::rename(&partial, destination)?;
        Ok(())
    }
}

impl HotfixSource for LocalChannel {
    fn instructions(&self, subdir: &str) -> Result<HotfixInstructions, ChannelAccessError> {
        self.hotfixes(subdir)
    }
}
