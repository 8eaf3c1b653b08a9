//! Dependency resolution
//!
//! Resolution collects every record that the root specifications can reach
//! through declared dependencies. No version selection takes place: all
//! admitted matches of a specification are part of the result, because a
//! mirror must be able to serve any installable combination.

mod builder;
pub mod graph;
mod prune;

pub use builder::GraphBuilder;
pub use graph::{DependencyGraph, RecordIndex, RecordNode, SpecIndex, SpecNode};
pub use prune::{prune, PruneOptions, ResolvedSet};

use crate::error::ChannelAccessError;
use crate::matchspec::SpecError;
use crate::query::{Latest, PackageQuery};
use crate::repository::CandidateRepository;
use crate::requirements::RequirementSet;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur during dependency resolution
#[derive(Debug, Error)]
pub enum ResolverError {
    /// Root specifications without a match
    #[error("Unsatisfied requirements: {}", .0.join(", "))]
    Unsatisfied(Vec<String>),

    /// Resolved packages not named by any root (strict mode)
    #[error("Packages not named by any requirement: {}", .0.join(", "))]
    UnspecifiedPackages(Vec<String>),

    /// Internal consistency check failed
    #[error("Resolver invariant violated: {0}")]
    Invariant(String),

    /// Invalid match specification
    #[error("Invalid specification: {0}")]
    Spec(#[from] SpecError),

    /// Repository lookup failed
    #[error("Channel access failed: {0}")]
    ChannelAccess(#[from] ChannelAccessError),
}

/// Resolution settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ResolverOptions {
    /// Keep only the latest versions or builds of each search
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest: Option<Latest>,

    /// Apply `latest` to records matching a root too
    pub latest_roots: bool,

    /// Fail when a resolved name is not named by a root
    pub strict: bool,

    /// Drop records whose dependencies cannot be satisfied
    pub prune_unsatisfied: bool,

    /// Lookup workers; one per CPU when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workers: Option<usize>,
}

/// Resolves requirement sets against a repository
pub struct Resolver<'a, R: ?Sized> {
    repository: &'a R,
    options: ResolverOptions,
}

impl<'a, R: CandidateRepository + ?Sized> Resolver<'a, R> {
    pub fn new(repository: &'a R) -> Self {
        Self {
            repository,
            options: ResolverOptions::default(),
        }
    }

    pub fn with_options(mut self, options: ResolverOptions) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> &ResolverOptions {
        &self.options
    }

    /// Build and prune the dependency graph of `requirements`
    pub fn resolve(&self, requirements: &RequirementSet) -> Result<ResolvedSet, ResolverError> {
        let query = PackageQuery::new(self.repository, requirements)
            .with_latest(self.options.latest)
            .with_latest_roots(self.options.latest_roots);

        let graph = GraphBuilder::new()
            .with_workers(self.options.workers.unwrap_or(0))
            .build(requirements, &query)?;

        prune(
            graph,
            requirements,
            &PruneOptions {
                strict: self.options.strict,
                prune_unsatisfied: self.options.prune_unsatisfied,
            },
        )
    }
}
