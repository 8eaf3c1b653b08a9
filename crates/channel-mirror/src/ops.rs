//! Mirroring operations
//!
//! - [`query`]: resolve requirements against an upstream channel
//! - [`update`]: bring a local channel in line with the resolution
//! - [`create_patch`]: stage the changes as a transferable archive
//! - [`merge_patch`]: apply an archive directory or `.tar.gz` to a channel
//! - [`index`]: rebuild the index of a channel

use crate::channel::{HotfixSource, Indexer, LocalChannel, PackageFetcher, SnapshotReader};
use crate::config::{ConfigError, MirrorConfig, PatchConfig};
use crate::diff::{diff, Diff};
use crate::error::{ChannelAccessError, MirrorError};
use crate::fsutil;
use crate::patch::{default_patch_name, MergeReport, PatchArchive, PatchMerger, PatchStager};
use crate::repository::{CachingRepository, CandidateRepository};
use crate::requirements::RequirementSet;
use crate::resolver::{ResolvedSet, Resolver, ResolverOptions};
use chrono::Utc;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Directory inside a target channel where patches are unpacked and staged
pub const WORK_DIR: &str = ".patches";

/// A channel that can be mirrored from
pub trait UpstreamChannel: CandidateRepository + PackageFetcher + HotfixSource {}

impl<T: CandidateRepository + PackageFetcher + HotfixSource + ?Sized> UpstreamChannel for T {}

/// Result of [`update`]
#[derive(Debug, Clone)]
pub struct UpdateOutcome {
    pub diff: Diff,
    pub merge: MergeReport,
}

/// Result of [`create_patch`]
#[derive(Debug, Clone)]
pub struct PatchOutcome {
    pub diff: Diff,
    pub archive: PatchArchive,
}

/// Resolve `requirements` against `source`
///
/// Lookups are memoized for the duration of the call.
pub fn query<R>(
    source: &R,
    requirements: &RequirementSet,
    options: &ResolverOptions,
) -> Result<ResolvedSet, MirrorError>
where
    R: CandidateRepository + ?Sized,
{
    let cached = CachingRepository::new(source);
    let resolved = Resolver::new(&cached)
        .with_options(options.clone())
        .resolve(requirements)?;

    info!(
        records = resolved.len(),
        lookups = cached.misses(),
        cached = cached.hits(),
        "Resolved requirements"
    );
    Ok(resolved)
}

/// Update `target` in place from `upstream`
pub fn update<U, I>(
    upstream: &U,
    target: &LocalChannel,
    indexer: &I,
    requirements: &RequirementSet,
    options: &ResolverOptions,
) -> Result<UpdateOutcome, MirrorError>
where
    U: UpstreamChannel + ?Sized,
    I: Indexer + ?Sized,
{
    let resolved = query(upstream, requirements, options)?;
    let snapshot = target.snapshot(requirements.subdirs())?;
    let diff = diff(&resolved, Some(&snapshot));

    let created_at = Utc::now();
    let work = target.root().join(WORK_DIR);
    let name = format!("update_{}", default_patch_name(&created_at));
    fsutil::remove_dir_if_exists(&work.join(&name)).map_err(ChannelAccessError::from)?;

    let archive = PatchStager::new(&work)
        .with_name(name)
        .with_created_at(created_at)
        .with_subdirs(requirements.subdirs().iter().cloned())
        .stage(&diff, upstream)?;

    let merged = PatchMerger::new(target, indexer).merge(&archive);
    discard_work(archive.root(), &work);

    Ok(UpdateOutcome {
        diff,
        merge: merged?,
    })
}

/// Stage the changes from `baseline` to the resolution as a patch archive
///
/// Without a baseline every resolved record is part of the patch.
pub fn create_patch<U, B>(
    upstream: &U,
    baseline: Option<&B>,
    requirements: &RequirementSet,
    options: &ResolverOptions,
    stager: &PatchStager,
) -> Result<PatchOutcome, MirrorError>
where
    U: UpstreamChannel + ?Sized,
    B: SnapshotReader + ?Sized,
{
    let resolved = query(upstream, requirements, options)?;
    let snapshot = match baseline {
        Some(baseline) => Some(baseline.snapshot(requirements.subdirs())?),
        None => None,
    };
    let diff = diff(&resolved, snapshot.as_ref());

    let archive = stager
        .clone()
        .with_subdirs(requirements.subdirs().iter().cloned())
        .stage(&diff, upstream)?;

    Ok(PatchOutcome { diff, archive })
}

/// Merge a patch directory or packed `.tar.gz` archive into `target`
pub fn merge_patch<I>(target: &LocalChannel, indexer: &I, patch: &Path) -> Result<MergeReport, MirrorError>
where
    I: Indexer + ?Sized,
{
    if patch.is_dir() {
        let archive = PatchArchive::open(patch)?;
        return Ok(PatchMerger::new(target, indexer).merge(&archive)?);
    }

    let work = target.root().join(WORK_DIR);
    let archive = PatchArchive::unpack(patch, &work)?;
    let merged = PatchMerger::new(target, indexer).merge(&archive);
    discard_work(archive.root(), &work);
    Ok(merged?)
}

/// Rebuild the hotfix bundle and index of `target`
pub fn index<I>(target: &LocalChannel, indexer: &I) -> Result<(), MirrorError>
where
    I: Indexer + ?Sized,
{
    target.write_patch_generator()?;
    let indexed = indexer.reindex(target.root());
    target.invalidate();
    indexed?;
    Ok(target.clear_index_pending()?)
}

fn discard_work(archive: &Path, work: &Path) {
    if let Err(e) = fsutil::remove_dir_if_exists(archive) {
        warn!(path = %archive.display(), error = %e, "Failed to remove patch work directory");
    }
    // Only succeeds once nothing else is left
    let _ = fs::remove_dir(work);
}

/// Operations bound to a loaded [`MirrorConfig`]
pub struct Mirror {
    source: LocalChannel,
    target: Option<LocalChannel>,
    requirements: RequirementSet,
    options: ResolverOptions,
    patch: PatchConfig,
}

impl Mirror {
    /// Open the configured channels
    ///
    /// The target channel is created when missing.
    pub fn from_config(config: &MirrorConfig) -> Result<Self, MirrorError> {
        let source = LocalChannel::open(&config.channel.source)?;
        let target = match &config.channel.target {
            Some(path) => Some(LocalChannel::create(path)?),
            None => None,
        };

        Ok(Self {
            source,
            target,
            requirements: config.requirements()?,
            options: config.resolver_options().clone(),
            patch: config.patch.clone(),
        })
    }

    pub fn source(&self) -> &LocalChannel {
        &self.source
    }

    pub fn target(&self) -> Option<&LocalChannel> {
        self.target.as_ref()
    }

    pub fn requirements(&self) -> &RequirementSet {
        &self.requirements
    }

    fn require_target(&self) -> Result<&LocalChannel, MirrorError> {
        self.target.as_ref().ok_or_else(|| {
            ConfigError::ValidationError("channel.target is not configured".to_string()).into()
        })
    }

    pub fn query(&self) -> Result<ResolvedSet, MirrorError> {
        query(&self.source, &self.requirements, &self.options)
    }

    pub fn update<I: Indexer + ?Sized>(&self, indexer: &I) -> Result<UpdateOutcome, MirrorError> {
        update(
            &self.source,
            self.require_target()?,
            indexer,
            &self.requirements,
            &self.options,
        )
    }

    /// Stage a patch against the target channel, if one is configured
    pub fn create_patch(&self) -> Result<PatchOutcome, MirrorError> {
        let parent: PathBuf = self.patch.parent.clone().ok_or_else(|| {
            MirrorError::from(ConfigError::ValidationError(
                "patch.parent is not configured".to_string(),
            ))
        })?;

        let mut stager = PatchStager::new(parent)
            .with_source(self.source.root().display().to_string());
        if let Some(name) = &self.patch.name {
            stager = stager.with_name(name.clone());
        }

        create_patch(
            &self.source,
            self.target.as_ref(),
            &self.requirements,
            &self.options,
            &stager,
        )
    }

    pub fn merge_patch<I: Indexer + ?Sized>(&self, indexer: &I, patch: &Path) -> Result<MergeReport, MirrorError> {
        merge_patch(self.require_target()?, indexer, patch)
    }

    pub fn index<I: Indexer + ?Sized>(&self, indexer: &I) -> Result<(), MirrorError> {
        index(self.require_target()?, indexer)
    }
}
