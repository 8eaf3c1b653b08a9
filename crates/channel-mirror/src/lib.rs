//! Channel Mirror Library
//!
//! This crate mirrors subsets of a package channel into a local channel,
//! including:
//! - Match specification parsing and version ordering
//! - Dependency graph construction over an upstream repository
//! - Pruning of excluded and disposable packages
//! - Diffs between a resolution and a channel snapshot
//! - Patch archives for disconnected systems, and merging them
//! - Hotfix instructions (revocations, track features, overrides)
//! - Mirror configuration (mirror.toml)

pub mod channel;
pub mod config;
pub mod diff;
pub mod error;
mod fsutil;
pub mod hotfix;
pub mod matchspec;
pub mod ops;
pub mod patch;
pub mod query;
pub mod record;
pub mod report;
pub mod repository;
pub mod requirements;
pub mod resolver;
pub mod subdir;
pub mod version;

pub use channel::{
    ChannelSnapshot, HotfixSource, Indexer, LocalChannel, PackageFetcher, RepodataIndexer,
    SnapshotReader,
};
pub use config::{ConfigError, MirrorConfig};
pub use diff::{diff, Diff};
pub use error::{ChannelAccessError, IndexError, MirrorError};
pub use hotfix::{Directive, HotfixAction, HotfixInstructions};
pub use matchspec::{MatchSpec, SpecError};
pub use ops::{Mirror, PatchOutcome, UpdateOutcome, UpstreamChannel};
pub use patch::{
    MergeReport, MergeState, PatchArchive, PatchConflictError, PatchError, PatchMerger,
    PatchStager,
};
pub use query::{Latest, PackageQuery};
pub use record::{PackageRecord, RecordKey};
pub use report::Summary;
pub use repository::{CachingRepository, CandidateRepository, InMemoryRepository};
pub use requirements::RequirementSet;
pub use resolver::{ResolvedSet, Resolver, ResolverError, ResolverOptions};
pub use version::{Version, VersionError};
