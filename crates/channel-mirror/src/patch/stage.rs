//! Patch staging

use super::archive::{ArchiveEntry, ArchiveMetadata, PatchArchive, FORMAT_VERSION, METADATA_FILE};
use super::PatchError;
use crate::channel::{HotfixSource, PackageFetcher, RecordManifest, RECORDS_FILE};
use crate::diff::Diff;
use crate::fsutil;
use crate::hotfix::{self, Directive, INSTRUCTIONS_FILE};
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Name used when none is given, e.g. `patch_20240131_235959`
pub fn default_patch_name(created_at: &DateTime<Utc>) -> String {
    created_at.format("patch_%Y%m%d_%H%M%S").to_string()
}

/// Writes patch archives from diffs
///
/// The archive is assembled in a hidden sibling directory and renamed into
/// place once complete.
#[derive(Debug, Clone)]
pub struct PatchStager {
    parent: PathBuf,
    name: Option<String>,
    created_at: Option<DateTime<Utc>>,
    source: Option<String>,
    subdirs: BTreeSet<String>,
}

impl PatchStager {
    /// Stage archives below `parent`
    pub fn new(parent: impl Into<PathBuf>) -> Self {
        Self {
            parent: parent.into(),
            name: None,
            created_at: None,
            source: None,
            subdirs: BTreeSet::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Fix the creation time instead of using the current time
    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = Some(created_at);
        self
    }

    /// Record the channel the patch is generated from
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Carry hotfixes for these subdirs even without package changes
    pub fn with_subdirs<I, S>(mut self, subdirs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.subdirs.extend(subdirs.into_iter().map(Into::into));
        self
    }

    /// Stage a diff, fetching added packages from `upstream`
    pub fn stage<U>(&self, diff: &Diff, upstream: &U) -> Result<PatchArchive, PatchError>
    where
        U: PackageFetcher + HotfixSource + ?Sized,
    {
        let created_at = self.created_at.unwrap_or_else(Utc::now);
        let name = match &self.name {
            Some(name) => name.clone(),
            None => default_patch_name(&created_at),
        };
        if name.is_empty() || name.starts_with('.') || name.contains(['/', '\\']) {
            return Err(PatchError::InvalidName(name));
        }

        let target = self.parent.join(&name);
        if target.exists() {
            return Err(PatchError::AlreadyExists(target.display().to_string()));
        }

        let mut subdirs = self.subdirs.clone();
        subdirs.extend(diff.additions.iter().map(|r| r.subdir.clone()));
        subdirs.extend(diff.removals.iter().map(|r| r.subdir.clone()));

        let metadata = ArchiveMetadata {
            format_version: FORMAT_VERSION,
            name: name.clone(),
            parent: self.source.clone(),
            created_at,
            subdirs,
            additions: diff.additions.iter().map(|r| ArchiveEntry::from(r.as_ref())).collect(),
            removals: diff.removals.iter().map(|r| ArchiveEntry::from(r.as_ref())).collect(),
        };
        metadata.check_disjoint()?;

        let partial = self.parent.join(format!(".{}.partial", name));
        fsutil::remove_dir_if_exists(&partial)?;
        fs::create_dir_all(&partial)?;

        if let Err(e) = write_contents(&partial, &metadata, diff, upstream) {
            if let Err(cleanup) = fsutil::remove_dir_if_exists(&partial) {
                warn!(path = %partial.display(), error = %cleanup, "Failed to remove partial patch");
            }
            return Err(e);
        }
        fs::rename(&partial, &target)?;

        info!(
            patch = %name,
            additions = metadata.additions.len(),
            removals = metadata.removals.len(),
            "Staged patch"
        );
        PatchArchive::open(&target)
    }
}

fn write_contents<U>(
    root: &Path,
    metadata: &ArchiveMetadata,
    diff: &Diff,
    upstream: &U,
) -> Result<(), PatchError>
where
    U: PackageFetcher + HotfixSource + ?Sized,
{
    let timestamp = metadata.created_millis();

    for subdir in &metadata.subdirs {
        let dir = root.join(subdir);
        fs::create_dir_all(&dir)?;

        let mut manifest = RecordManifest::new(subdir);
        for record in diff.additions.iter().filter(|r| r.subdir == *subdir) {
            upstream.fetch(record, &dir.join(&record.filename))?;
            manifest.insert(record.as_ref().clone());
        }
        manifest.save(&dir.join(RECORDS_FILE))?;

        let mut instructions = upstream.instructions(subdir)?;
        for record in diff.removals.iter().filter(|r| r.subdir == *subdir) {
            instructions.merge_directive(
                &record.filename,
                Directive::revoke(record.sha256.clone(), timestamp),
            );
        }
        instructions.save(&dir.join(INSTRUCTIONS_FILE))?;
    }

    hotfix::write_generator(root, metadata.subdirs.iter().map(String::as_str))?;
    fsutil::write_json_atomic(&root.join(METADATA_FILE), metadata)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::LocalChannel;
    use crate::record::PackageRecord;
    use crate::version::Version;
    use chrono::TimeZone;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn record(name: &str) -> PackageRecord {
        PackageRecord::new(name, Version::parse("1.0").unwrap(), "0", "noarch")
    }

    #[test]
    fn test_default_name() {
        let created_at = Utc.with_ymd_and_hms(2024, 1, 31, 23, 59, 58).unwrap();
        assert_eq!(default_patch_name(&created_at), "patch_20240131_235958");
    }

    #[test]
    fn test_stage_layout() {
        let dir = TempDir::new().unwrap();
        let upstream = LocalChannel::create(dir.path().join("upstream")).unwrap();
        let a = upstream.publish(record("a"), b"a").unwrap();
        let c = record("c").with_contents(b"c");

        let diff = Diff {
            additions: vec![Arc::new(a.clone())],
            removals: vec![Arc::new(c.clone())],
        };
        let created_at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let archive = PatchStager::new(dir.path().join("patches"))
            .with_created_at(created_at)
            .with_subdirs(["linux-64"])
            .stage(&diff, &upstream)
            .unwrap();

        assert_eq!(archive.name(), "patch_20240501_120000");
        assert!(archive.root().join(METADATA_FILE).is_file());
        assert!(archive.root().join(hotfix::GENERATOR_FILE).is_file());
        assert!(archive.payload_path("noarch", &a.filename).is_file());
        assert!(!archive.root().join("repodata.json").exists());
        assert_eq!(archive.metadata().subdirs.len(), 2);

        let records = archive.records("noarch").unwrap();
        assert_eq!(records.len(), 1);

        let instructions = archive.instructions("noarch").unwrap();
        let directive = instructions.get(&c.filename).unwrap();
        assert_eq!(directive.timestamp, created_at.timestamp_millis() as u64);
        assert_eq!(instructions.withdrawn_sha256(&c.filename), c.sha256.as_deref());

        assert!(!dir.path().join("patches").join(".patch_20240501_120000.partial").exists());
    }

    #[test]
    fn test_stage_rejects_overlap() {
        let dir = TempDir::new().unwrap();
        let upstream = LocalChannel::create(dir.path().join("upstream")).unwrap();
        let a = Arc::new(upstream.publish(record("a"), b"a").unwrap());

        let diff = Diff {
            additions: vec![a.clone()],
            removals: vec![a],
        };
        let result = PatchStager::new(dir.path().join("patches")).stage(&diff, &upstream);
        assert!(matches!(result, Err(PatchError::Overlap(_))));
    }

    #[test]
    fn test_failed_fetch_leaves_nothing() {
        let dir = TempDir::new().unwrap();
        let upstream = LocalChannel::create(dir.path().join("upstream")).unwrap();
        let diff = Diff {
            additions: vec![Arc::new(record("ghost"))],
            removals: Vec::new(),
        };

        let patches = dir.path().join("patches");
        let result = PatchStager::new(&patches).with_name("p1").stage(&diff, &upstream);
        assert!(matches!(result, Err(PatchError::ChannelAccess(_))));
        assert_eq!(fs::read_dir(&patches).unwrap().count(), 0);
    }

    #[test]
    fn test_existing_and_invalid_names() {
        let dir = TempDir::new().unwrap();
        let upstream = LocalChannel::create(dir.path().join("upstream")).unwrap();
        let stager = PatchStager::new(dir.path().join("patches")).with_name("p1");

        stager.stage(&Diff::default(), &upstream).unwrap();
        assert!(matches!(
            stager.stage(&Diff::default(), &upstream),
            Err(PatchError::AlreadyExists(_))
        ));

        let result = PatchStager::new(dir.path())
            .with_name("../escape")
            .stage(&Diff::default(), &upstream);
        assert!(matches!(result, Err(PatchError::InvalidName(_))));
    }
}
