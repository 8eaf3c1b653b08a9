//! Patch merging
//!
//! A merge runs through `Idle -> Validating -> Copying -> UpdatingHotfixes
//! -> Indexing -> Done`. Validation reads the target and collects every
//! conflict before anything is written. Changed subdirs are staged next to
//! the live ones and swapped in together; subdirs without changes are left
//! alone. The indexer runs last; until it succeeds the channel stays marked
//! as index-pending and the next merge reindexes even when it is a no-op.

use super::archive::PatchArchive;
use super::{Conflict, ConflictReason, PatchConflictError, PatchError};
use crate::channel::{verify_package, Indexer, LocalChannel, RecordManifest, RECORDS_FILE};
use crate::error::ChannelAccessError;
use crate::fsutil;
use crate::hotfix::{Directive, HotfixInstructions, INSTRUCTIONS_FILE};
use crate::record::{PackageRecord, RecordKey};
use std::collections::BTreeSet;
use std::fs;
use tracing::{debug, info, warn};

/// Error class a failed merge stopped with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeFailure {
    Conflict,
    ChannelAccess,
    Io,
    Index,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeState {
    Idle,
    Validating,
    Copying,
    UpdatingHotfixes,
    Indexing,
    Done,
    Failed(MergeFailure),
}

/// What a merge changed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    /// Packages copied into the target
    pub added: Vec<RecordKey>,

    /// Packages revoked in the target
    pub revoked: Vec<RecordKey>,

    /// Previously revoked packages published again
    pub restored: Vec<RecordKey>,

    /// Entries that needed no change
    pub unchanged: usize,

    /// Directives taken over from the patch
    pub hotfixes_updated: usize,

    /// Subdirs that were rewritten
    pub subdirs: Vec<String>,
}

impl MergeReport {
    /// Check if the merge left the target as it was
    pub fn is_noop(&self) -> bool {
        self.subdirs.is_empty()
    }
}

/// Target state of one subdir after the merge
struct SubdirPlan {
    subdir: String,
    manifest: RecordManifest,
    instructions: HotfixInstructions,
    additions: Vec<PackageRecord>,
    changed: bool,
}

fn same_sha(a: Option<&str>, b: Option<&str>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a.eq_ignore_ascii_case(b),
        _ => true,
    }
}

fn failure_of(error: &PatchError) -> MergeFailure {
    match error {
        PatchError::Conflict(_) => MergeFailure::Conflict,
        PatchError::ChannelAccess(_) => MergeFailure::ChannelAccess,
        PatchError::Index(_) => MergeFailure::Index,
        _ => MergeFailure::Io,
    }
}

/// Merges patch archives into a local channel
pub struct PatchMerger<'a, I: ?Sized> {
    channel: &'a LocalChannel,
    indexer: &'a I,
    state: MergeState,
}

impl<'a, I: Indexer + ?Sized> PatchMerger<'a, I> {
    pub fn new(channel: &'a LocalChannel, indexer: &'a I) -> Self {
        Self {
            channel,
            indexer,
            state: MergeState::Idle,
        }
    }

    pub fn state(&self) -> MergeState {
        self.state
    }

    /// Apply an archive to the channel
    ///
    /// Merging an archive that is already applied changes nothing.
    pub fn merge(&mut self, archive: &PatchArchive) -> Result<MergeReport, PatchError> {
        self.state = MergeState::Idle;
        let result = self.run(archive);
        if let Err(e) = &result {
            warn!(patch = archive.name(), error = %e, "Merge failed");
            self.state = MergeState::Failed(failure_of(e));
        }
        result
    }

    fn transition(&mut self, archive: &PatchArchive, next: MergeState) {
        info!(patch = archive.name(), from = ?self.state, to = ?next, "Merge state change");
        self.state = next;
    }

    fn run(&mut self, archive: &PatchArchive) -> Result<MergeReport, PatchError> {
        self.transition(archive, MergeState::Validating);
        let (plans, mut report) = self.validate(archive)?;

        let changed: Vec<&SubdirPlan> = plans.iter().filter(|p| p.changed).collect();
        if changed.is_empty() {
            info!(patch = archive.name(), "Patch already applied");
            if self.channel.index_pending() {
                self.reindex(archive)?;
            }
            self.transition(archive, MergeState::Done);
            return Ok(report);
        }

        if let Err(e) = self.prepare(archive, &changed) {
            for plan in &changed {
                let staging = self.channel.staging_path(&plan.subdir);
                if let Err(cleanup) = fsutil::remove_dir_if_exists(&staging) {
                    warn!(path = %staging.display(), error = %cleanup, "Failed to remove staging directory");
                }
            }
            return Err(e);
        }

        report.subdirs = changed.iter().map(|p| p.subdir.clone()).collect();
        self.channel.mark_index_pending()?;
        self.channel.commit_staged(&report.subdirs)?;
        self.reindex(archive)?;

        self.transition(archive, MergeState::Done);
        info!(
            patch = archive.name(),
            added = report.added.len(),
            revoked = report.revoked.len(),
            restored = report.restored.len(),
            "Merged patch"
        );
        Ok(report)
    }

    fn reindex(&mut self, archive: &PatchArchive) -> Result<(), PatchError> {
        self.channel.write_patch_generator()?;

        self.transition(archive, MergeState::Indexing);
        let indexed = self.indexer.reindex(self.channel.root());
        // The indexer may purge files behind our back
        self.channel.invalidate();
        indexed?;
        self.channel.clear_index_pending()?;
        Ok(())
    }

    /// Stage every changed subdir
    fn prepare(&mut self, archive: &PatchArchive, plans: &[&SubdirPlan]) -> Result<(), PatchError> {
        self.transition(archive, MergeState::Copying);
        for plan in plans {
            let live = self.channel.subdir_path(&plan.subdir);
            let staging = self.channel.staging_path(&plan.subdir);
            fsutil::remove_dir_if_exists(&staging)?;
            if live.is_dir() {
                fsutil::clone_tree(&live, &staging)?;
            } else {
                fs::create_dir_all(&staging)?;
            }

            for record in &plan.additions {
                let source = archive.payload_path(&plan.subdir, &record.filename);
                if !source.is_file() {
                    return Err(ChannelAccessError::PackageNotFound(format!(
                        "{} in patch {}",
                        record,
                        archive.name()
                    ))
                    .into());
                }

                let destination = staging.join(&record.filename);
                if destination.exists() {
                    fs::remove_file(&destination)?;
                }
                fs::copy(&source, &destination)?;
                verify_package(&destination, record)?;
                debug!(package = %record, "Copied package");
            }
            plan.manifest.save(&staging.join(RECORDS_FILE))?;
        }

        self.transition(archive, MergeState::UpdatingHotfixes);
        for plan in plans {
            let staging = self.channel.staging_path(&plan.subdir);
            plan.instructions.save(&staging.join(INSTRUCTIONS_FILE))?;
        }
        Ok(())
    }

    /// Plan every subdir and collect conflicts
    fn validate(&self, archive: &PatchArchive) -> Result<(Vec<SubdirPlan>, MergeReport), PatchError> {
        let metadata = archive.metadata();
        let created = metadata.created_millis();
        let mut report = MergeReport::default();
        let mut conflicts = Vec::new();
        let mut plans = Vec::new();

        for subdir in &metadata.subdirs {
            let mut manifest = (*self.channel.manifest(subdir)?).clone();
            let original = self.channel.hotfixes(subdir)?;
            let mut instructions = original.clone();
            let staged = archive.records(subdir)?;
            let mut additions = Vec::new();
            // Withdrawals the target already holds
            let mut settled = BTreeSet::new();

            let mut conflict = |filename: &str, reason: ConflictReason| {
                conflicts.push(Conflict {
                    subdir: subdir.clone(),
                    filename: filename.to_string(),
                    reason,
                });
            };

            for entry in metadata.additions.iter().filter(|e| e.subdir == *subdir) {
                let filename = entry.filename.as_str();
                let record = staged.get(filename).ok_or_else(|| PatchError::InvalidArchive {
                    path: archive.root().display().to_string(),
                    reason: format!("no record for {}/{}", subdir, filename),
                })?;

                if let Some(revoked) = instructions.withdrawn_sha256(filename) {
                    if !same_sha(Some(revoked), entry.sha256.as_deref()) {
                        conflict(
                            filename,
                            ConflictReason::RevokedWithDifferentChecksum {
                                revoked: revoked.to_string(),
                                incoming: entry.sha256.clone().unwrap_or_default(),
                            },
                        );
                        continue;
                    }
                }

                let existing = manifest.get(filename).cloned();
                if let Some(existing) = &existing {
                    if !existing.same_contents(record) {
                        conflict(
                            filename,
                            ConflictReason::ChecksumDiffers {
                                existing: existing.sha256.clone(),
                                incoming: record.sha256.clone(),
                            },
                        );
                        continue;
                    }
                }

                if instructions.is_withdrawn(filename) {
                    let revoked_at = instructions.get(filename).map_or(0, |d| d.timestamp);
                    if created < revoked_at {
                        // The revocation is newer than the patch
                        report.unchanged += 1;
                        continue;
                    }
                    instructions.clear(filename);
                    if existing.is_some() {
                        report.restored.push(record.key());
                        continue;
                    }
                } else if existing.is_some() {
                    report.unchanged += 1;
                    continue;
                }

                manifest.insert(record.clone());
                additions.push(record.clone());
                report.added.push(record.key());
            }

            for entry in metadata.removals.iter().filter(|e| e.subdir == *subdir) {
                let filename = entry.filename.as_str();
                let withdrawn = instructions.is_withdrawn(filename);

                match manifest.get(filename) {
                    Some(existing) if !same_sha(existing.sha256.as_deref(), entry.sha256.as_deref()) => {
                        conflict(
                            filename,
                            ConflictReason::RemovalChecksumDiffers {
                                existing: existing.sha256.clone(),
                                expected: entry.sha256.clone(),
                            },
                        );
                    }
                    Some(_) | None if withdrawn => {
                        settled.insert(filename.to_string());
                        report.unchanged += 1;
                    }
                    Some(existing) => {
                        let directive = Directive::revoke(entry.sha256.clone(), created);
                        if instructions.merge_directive(filename, directive) {
                            report.revoked.push(existing.key());
                        } else {
                            debug!(subdir = %subdir, filename, "Newer directive kept over removal");
                            report.unchanged += 1;
                        }
                    }
                    None => conflict(filename, ConflictReason::RemovalUnknown),
                }
            }

            let mut incoming = archive.instructions(subdir)?;
            incoming
                .directives
                .retain(|filename, directive| !(directive.withdraws() && settled.contains(filename)));
            report.hotfixes_updated += instructions.merge(&incoming);

            let changed = !additions.is_empty() || instructions != original;
            plans.push(SubdirPlan {
                subdir: subdir.clone(),
                manifest,
                instructions,
                additions,
                changed,
            });
        }

        if !conflicts.is_empty() {
            return Err(PatchConflictError { conflicts }.into());
        }

        Ok((plans, report))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{Repodata, RepodataIndexer, SnapshotReader, REPODATA_FILE};
    use crate::diff::Diff;
    use crate::error::IndexError;
    use crate::patch::PatchStager;
    use crate::version::Version;
    use chrono::{TimeZone, Utc};
    use std::path::Path;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn record(name: &str) -> PackageRecord {
        PackageRecord::new(name, Version::parse("1.0").unwrap(), "0", "noarch")
    }

    fn noarch() -> BTreeSet<String> {
        ["noarch".to_string()].into_iter().collect()
    }

    struct FailingIndexer;

    impl Indexer for FailingIndexer {
        fn reindex(&self, _channel_root: &Path) -> Result<(), IndexError> {
            Err(IndexError::Failed {
                subdir: "noarch".into(),
                reason: "disk full".into(),
            })
        }
    }

    #[test]
    fn test_merge_states() {
        let dir = TempDir::new().unwrap();
        let upstream = LocalChannel::create(dir.path().join("upstream")).unwrap();
        let target = LocalChannel::create(dir.path().join("target")).unwrap();
        let a = upstream.publish(record("a"), b"a").unwrap();

        let diff = Diff {
            additions: vec![Arc::new(a)],
            removals: Vec::new(),
        };
        let archive = PatchStager::new(dir.path().join("patches"))
            .stage(&diff, &upstream)
            .unwrap();

        let indexer = RepodataIndexer::new();
        let mut merger = PatchMerger::new(&target, &indexer);
        assert_eq!(merger.state(), MergeState::Idle);

        let report = merger.merge(&archive).unwrap();
        assert_eq!(merger.state(), MergeState::Done);
        assert_eq!(report.added.len(), 1);
        assert_eq!(report.subdirs, vec!["noarch"]);
        assert_eq!(target.snapshot(&noarch()).unwrap().len(), 1);

        let again = merger.merge(&archive).unwrap();
        assert!(again.is_noop());
        assert_eq!(again.unchanged, 1);
        assert_eq!(merger.state(), MergeState::Done);
    }

    #[test]
    fn test_index_failure_is_distinct() {
        let dir = TempDir::new().unwrap();
        let upstream = LocalChannel::create(dir.path().join("upstream")).unwrap();
        let target = LocalChannel::create(dir.path().join("target")).unwrap();
        let a = upstream.publish(record("a"), b"a").unwrap();

        let diff = Diff {
            additions: vec![Arc::new(a)],
            removals: Vec::new(),
        };
        let archive = PatchStager::new(dir.path().join("patches"))
            .stage(&diff, &upstream)
            .unwrap();

        let mut merger = PatchMerger::new(&target, &FailingIndexer);
        let result = merger.merge(&archive);
        assert!(matches!(result, Err(PatchError::Index(_))));
        assert_eq!(merger.state(), MergeState::Failed(MergeFailure::Index));

        // Files were committed before indexing
        assert_eq!(target.snapshot(&noarch()).unwrap().len(), 1);
        assert!(target.index_pending());
    }

    #[test]
    fn test_index_retried_after_failure() {
        let dir = TempDir::new().unwrap();
        let upstream = LocalChannel::create(dir.path().join("upstream")).unwrap();
        let target = LocalChannel::create(dir.path().join("target")).unwrap();
        let a = upstream.publish(record("a"), b"a").unwrap();

        let diff = Diff {
            additions: vec![Arc::new(a.clone())],
            removals: Vec::new(),
        };
        let archive = PatchStager::new(dir.path().join("patches"))
            .stage(&diff, &upstream)
            .unwrap();

        assert!(PatchMerger::new(&target, &FailingIndexer).merge(&archive).is_err());
        drop(target);

        // Still owed after reopening
        let target = LocalChannel::open(dir.path().join("target")).unwrap();
        assert!(target.index_pending());

        let indexer = RepodataIndexer::new();
        let mut merger = PatchMerger::new(&target, &indexer);
        let report = merger.merge(&archive).unwrap();
        assert!(report.is_noop());
        assert_eq!(merger.state(), MergeState::Done);
        assert!(!target.index_pending());

        let index = Repodata::load(&target.subdir_path("noarch").join(REPODATA_FILE)).unwrap();
        assert!(index.packages.contains_key(&a.filename));
    }

    #[test]
    fn test_conflicts_leave_target_untouched() {
        let dir = TempDir::new().unwrap();
        let upstream = LocalChannel::create(dir.path().join("upstream")).unwrap();
        let target = LocalChannel::create(dir.path().join("target")).unwrap();

        let a = upstream.publish(record("a"), b"upstream").unwrap();
        target.publish(record("a"), b"local").unwrap();
        let ghost = record("ghost").with_contents(b"ghost");

        let diff = Diff {
            additions: vec![Arc::new(a)],
            removals: vec![Arc::new(ghost)],
        };
        let archive = PatchStager::new(dir.path().join("patches"))
            .stage(&diff, &upstream)
            .unwrap();

        let indexer = RepodataIndexer::new();
        let mut merger = PatchMerger::new(&target, &indexer);
        match merger.merge(&archive) {
            Err(PatchError::Conflict(error)) => {
                assert_eq!(error.conflicts.len(), 2);
                assert!(error
                    .conflicts
                    .iter()
                    .any(|c| c.reason == ConflictReason::RemovalUnknown));
            }
            other => panic!("expected conflict, got {:?}", other),
        }
        assert_eq!(merger.state(), MergeState::Failed(MergeFailure::Conflict));
        assert!(!target.root().join("noarch").join("repodata.json").exists());
        assert!(!target.staging_path("noarch").exists());
    }

    #[test]
    fn test_revocation_newer_than_patch_wins() {
        let dir = TempDir::new().unwrap();
        let upstream = LocalChannel::create(dir.path().join("upstream")).unwrap();
        let target = LocalChannel::create(dir.path().join("target")).unwrap();

        let a = upstream.publish(record("a"), b"a").unwrap();
        let local = target.publish(record("a"), b"a").unwrap();

        let created_at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let revoked_at = created_at.timestamp_millis() as u64 + 1;
        target
            .add_directive("noarch", &local.filename, Directive::revoke(local.sha256.clone(), revoked_at))
            .unwrap();

        let diff = Diff {
            additions: vec![Arc::new(a)],
            removals: Vec::new(),
        };
        let archive = PatchStager::new(dir.path().join("patches"))
            .with_created_at(created_at)
            .stage(&diff, &upstream)
            .unwrap();

        let indexer = RepodataIndexer::new();
        let report = PatchMerger::new(&target, &indexer).merge(&archive).unwrap();
        assert!(report.is_noop());
        assert!(target.snapshot(&noarch()).unwrap().is_empty());

        // A later patch restores the package
        let later = PatchStager::new(dir.path().join("patches"))
            .with_name("later")
            .with_created_at(created_at + chrono::Duration::days(1))
            .stage(&diff, &upstream)
            .unwrap();
        let report = PatchMerger::new(&target, &indexer).merge(&later).unwrap();
        assert_eq!(report.restored.len(), 1);
        assert_eq!(target.snapshot(&noarch()).unwrap().len(), 1);
    }

    #[test]
    fn test_revoked_for_other_contents_conflicts() {
        let dir = TempDir::new().unwrap();
        let upstream = LocalChannel::create(dir.path().join("upstream")).unwrap();
        let target = LocalChannel::create(dir.path().join("target")).unwrap();

        let a = upstream.publish(record("a"), b"new").unwrap();
        target
            .add_directive("noarch", &a.filename, Directive::revoke(Some("00ff".into()), 1))
            .unwrap();

        let diff = Diff {
            additions: vec![Arc::new(a)],
            removals: Vec::new(),
        };
        let archive = PatchStager::new(dir.path().join("patches"))
            .stage(&diff, &upstream)
            .unwrap();

        let indexer = RepodataIndexer::new();
        let result = PatchMerger::new(&target, &indexer).merge(&archive);
        match result {
            Err(PatchError::Conflict(error)) => assert!(matches!(
                error.conflicts[0].reason,
                ConflictReason::RevokedWithDifferentChecksum { .. }
            )),
            other => panic!("expected conflict, got {:?}", other),
        }
    }

    #[test]
    fn test_corrupt_payload_rejected() {
        let dir = TempDir::new().unwrap();
        let upstream = LocalChannel::create(dir.path().join("upstream")).unwrap();
        let target = LocalChannel::create(dir.path().join("target")).unwrap();
        let a = upstream.publish(record("a"), b"a").unwrap();

        let diff = Diff {
            additions: vec![Arc::new(a.clone())],
            removals: Vec::new(),
        };
        let archive = PatchStager::new(dir.path().join("patches"))
            .stage(&diff, &upstream)
            .unwrap();
        fs::write(archive.payload_path("noarch", &a.filename), b"b").unwrap();

        let indexer = RepodataIndexer::new();
        let mut merger = PatchMerger::new(&target, &indexer);
        let result = merger.merge(&archive);
        assert!(matches!(
            result,
            Err(PatchError::ChannelAccess(ChannelAccessError::ChecksumMismatch { .. }))
        ));
        assert_eq!(merger.state(), MergeState::Failed(MergeFailure::ChannelAccess));
        assert!(!target.staging_path("noarch").exists());
        assert!(target.snapshot(&noarch()).unwrap().is_empty());
    }
}
