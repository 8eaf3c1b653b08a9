//! Requirement sets
//!
//! Roots are what the user asks for. Exclusions remove records from the
//! traversal entirely. Disposables are traversed but left out of the result.

use crate::matchspec::{MatchSpec, SpecError};
use crate::record::PackageRecord;
use crate::subdir;
use std::collections::BTreeSet;

/// Requested packages and filters for one resolution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequirementSet {
    roots: Vec<MatchSpec>,
    exclusions: Vec<MatchSpec>,
    disposables: Vec<MatchSpec>,
    subdirs: BTreeSet<String>,
}

fn parse_all<I, S>(specs: I) -> Result<Vec<MatchSpec>, SpecError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut parsed = Vec::new();
    for spec in specs {
        let spec = MatchSpec::parse(spec.as_ref())?;
        if !parsed.contains(&spec) {
            parsed.push(spec);
        }
    }
    Ok(parsed)
}

impl RequirementSet {
    /// Create a requirement set from root specification strings
    ///
    /// Subdirs default to the platform subdir plus `noarch`.
    pub fn new<I, S>(roots: I) -> Result<Self, SpecError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Ok(Self::from_specs(parse_all(roots)?))
    }

    /// Create a requirement set from parsed root specifications
    pub fn from_specs(roots: Vec<MatchSpec>) -> Self {
        let mut unique = Vec::with_capacity(roots.len());
        for spec in roots {
            if !unique.contains(&spec) {
                unique.push(spec);
            }
        }

        Self {
            roots: unique,
            exclusions: Vec::new(),
            disposables: Vec::new(),
            subdirs: subdir::default_subdirs(),
        }
    }

    /// Set the exclusion specifications
    pub fn with_exclusions<I, S>(mut self, exclusions: I) -> Result<Self, SpecError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.exclusions = parse_all(exclusions)?;
        Ok(self)
    }

    /// Set the disposable specifications
    pub fn with_disposables<I, S>(mut self, disposables: I) -> Result<Self, SpecError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.disposables = parse_all(disposables)?;
        Ok(self)
    }

    /// Set the subdirs to search; an empty list keeps the defaults
    pub fn with_subdirs<I, S>(mut self, subdirs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let subdirs: BTreeSet<String> = subdirs.into_iter().map(Into::into).collect();
        if !subdirs.is_empty() {
            self.subdirs = subdirs;
        }
        self
    }

    pub fn roots(&self) -> &[MatchSpec] {
        &self.roots
    }

    pub fn exclusions(&self) -> &[MatchSpec] {
        &self.exclusions
    }

    pub fn disposables(&self) -> &[MatchSpec] {
        &self.disposables
    }

    pub fn subdirs(&self) -> &BTreeSet<String> {
        &self.subdirs
    }

    /// Names constrained by a root specification
    pub fn root_names(&self) -> BTreeSet<&str> {
        self.roots.iter().filter_map(MatchSpec::exact_name).collect()
    }

    /// Check if a record matches any exclusion
    pub fn is_excluded(&self, record: &PackageRecord) -> bool {
        self.exclusions.iter().any(|spec| spec.matches(record))
    }

    /// Check if a record matches any disposable specification
    pub fn is_disposable(&self, record: &PackageRecord) -> bool {
        self.disposables.iter().any(|spec| spec.matches(record))
    }

    /// Check if a record matches any root specification
    pub fn matches_root(&self, record: &PackageRecord) -> bool {
        self.roots.iter().any(|spec| spec.matches(record))
    }

    /// Check if a record may become part of the dependency graph
    ///
    /// A record is admitted when it is not excluded and satisfies every root
    /// specification naming its package.
    pub fn admits(&self, record: &PackageRecord) -> bool {
        if self.is_excluded(record) {
            return false;
        }

        self.roots
            .iter()
            .filter(|spec| spec.exact_name() == Some(record.name.as_str()))
            .all(|spec| spec.matches(record))
    }
}
