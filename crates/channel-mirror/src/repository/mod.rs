//! Candidate repositories
//!
//! A repository answers "which records match this specification in these
//! subdirs". The resolver only talks to this trait.

mod cache;

pub use cache::CachingRepository;

use crate::error::ChannelAccessError;
use crate::matchspec::MatchSpec;
use crate::record::PackageRecord;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Source of candidate records
pub trait CandidateRepository: Send + Sync {
    /// All records matching `spec` in any of `subdirs`
    fn search(
        &self,
        spec: &MatchSpec,
        subdirs: &BTreeSet<String>,
    ) -> Result<Vec<Arc<PackageRecord>>, ChannelAccessError>;
}

impl<T: CandidateRepository + ?Sized> CandidateRepository for &T {
    fn search(
        &self,
        spec: &MatchSpec,
        subdirs: &BTreeSet<String>,
    ) -> Result<Vec<Arc<PackageRecord>>, ChannelAccessError> {
        (**self).search(spec, subdirs)
    }
}

impl<T: CandidateRepository + ?Sized> CandidateRepository for Arc<T> {
    fn search(
        &self,
        spec: &MatchSpec,
        subdirs: &BTreeSet<String>,
    ) -> Result<Vec<Arc<PackageRecord>>, ChannelAccessError> {
        (**self).search(spec, subdirs)
    }
}

/// A fixed list of records
#[derive(Debug, Clone, Default)]
pub struct InMemoryRepository {
    records: Vec<Arc<PackageRecord>>,
}

impl InMemoryRepository {
    pub fn new<I>(records: I) -> Self
    where
        I: IntoIterator<Item = PackageRecord>,
    {
        let mut repository = Self::default();
        for record in records {
            repository.push(record);
        }
        repository
    }

    /// Add a record, replacing one with the same identity
    pub fn push(&mut self, record: PackageRecord) {
        self.records.retain(|r| **r != record);
        self.records.push(Arc::new(record));
    }

    pub fn with_record(mut self, record: PackageRecord) -> Self {
        self.push(record);
        self
    }

    pub fn records(&self) -> &[Arc<PackageRecord>] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl CandidateRepository for InMemoryRepository {
    fn search(
        &self,
        spec: &MatchSpec,
        subdirs: &BTreeSet<String>,
    ) -> Result<Vec<Arc<PackageRecord>>, ChannelAccessError> {
        let mut found: Vec<_> = self
            .records
            .iter()
            .filter(|r| subdirs.contains(&r.subdir) && spec.matches(r))
            .cloned()
            .collect();
        found.sort();
        Ok(found)
    }
}
