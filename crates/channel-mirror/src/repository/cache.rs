//! Per-operation lookup memoization

use super::CandidateRepository;
use crate::error::ChannelAccessError;
use crate::matchspec::MatchSpec;
use crate::record::PackageRecord;
use dashmap::DashMap;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

type LookupKey = (MatchSpec, BTreeSet<String>);

/// Memoizes successful searches of the wrapped repository
///
/// Failures are not cached. Create one per operation and drop it afterwards.
pub struct CachingRepository<R> {
    inner: R,
    entries: DashMap<LookupKey, Vec<Arc<PackageRecord>>>,
    hits: AtomicUsize,
    misses: AtomicUsize,
}

impl<R: CandidateRepository> CachingRepository<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            entries: DashMap::new(),
            hits: AtomicUsize::new(0),
            misses: AtomicUsize::new(0),
        }
    }

    pub fn inner(&self) -> &R {
        &self.inner
    }

    /// Number of lookups answered from memory
    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::Relaxed)
    }

    /// Number of lookups forwarded to the wrapped repository
    pub fn misses(&self) -> usize {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn clear(&self) {
        self.entries.clear();
    }
}

impl<R: CandidateRepository> CandidateRepository for CachingRepository<R> {
    fn search(
        &self,
        spec: &MatchSpec,
        subdirs: &BTreeSet<String>,
    ) -> Result<Vec<Arc<PackageRecord>>, ChannelAccessError> {
        let key = (spec.clone(), subdirs.clone());
        if let Some(found) = self.entries.get(&key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(found.clone());
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let found = self.inner.search(spec, subdirs)?;
        self.entries.insert(key, found.clone());
        Ok(found)
    }
}
