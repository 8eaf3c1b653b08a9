//! Package queries
//!
//! A query searches a repository in the requested subdirs and filters the
//! results through the requirement set: excluded records are dropped, records
//! named by a root specification must satisfy every root of that name, and
//! optionally only the latest versions or builds are kept.

use crate::error::ChannelAccessError;
use crate::matchspec::MatchSpec;
use crate::record::PackageRecord;
use crate::repository::CandidateRepository;
use crate::requirements::RequirementSet;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// Narrowing of search results to the newest candidates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Latest {
    /// Highest version per name and subdir
    Version,

    /// Highest build number per name, version and subdir
    Build,
}

/// Outcome of one search
#[derive(Debug, Clone, Default)]
pub struct QueryResult {
    /// Records that passed every filter, sorted
    pub accepted: Vec<Arc<PackageRecord>>,

    /// Names of every record the repository returned, filtered or not
    pub names: BTreeSet<String>,

    /// Number of records removed by exclusions
    pub excluded: usize,
}

/// Repository search bound to a requirement set
pub struct PackageQuery<'a, R: ?Sized> {
    repository: &'a R,
    requirements: &'a RequirementSet,
    latest: Option<Latest>,
    latest_roots: bool,
}

impl<'a, R: CandidateRepository + ?Sized> PackageQuery<'a, R> {
    pub fn new(repository: &'a R, requirements: &'a RequirementSet) -> Self {
        Self {
            repository,
            requirements,
            latest: None,
            latest_roots: false,
        }
    }

    /// Keep only the latest candidates of each search
    pub fn with_latest(mut self, latest: Option<Latest>) -> Self {
        self.latest = latest;
        self
    }

    /// Also narrow records matching a root specification
    pub fn with_latest_roots(mut self, latest_roots: bool) -> Self {
        self.latest_roots = latest_roots;
        self
    }

    pub fn requirements(&self) -> &RequirementSet {
        self.requirements
    }

    /// Search for the records matching a specification
    pub fn search(&self, spec: &MatchSpec) -> Result<QueryResult, ChannelAccessError> {
        let found = self.repository.search(spec, self.requirements.subdirs())?;

        let mut result = QueryResult::default();
        for record in found {
            result.names.insert(record.name.clone());
            if self.requirements.is_excluded(&record) {
                result.excluded += 1;
            } else if self.requirements.admits(&record) {
                result.accepted.push(record);
            }
        }

        if let Some(latest) = self.latest {
            result.accepted = self.narrow(result.accepted, latest);
        }
        result.accepted.sort();
        result.accepted.dedup();
        Ok(result)
    }

    fn narrow(&self, records: Vec<Arc<PackageRecord>>, latest: Latest) -> Vec<Arc<PackageRecord>> {
        let group = |r: &PackageRecord| match latest {
            Latest::Version => (r.name.clone(), r.subdir.clone(), String::new()),
            Latest::Build => (r.name.clone(), r.subdir.clone(), r.version.to_string()),
        };

        let mut best: HashMap<(String, String, String), Arc<PackageRecord>> = HashMap::new();
        for record in &records {
            let better = match best.get(&group(record)) {
                None => true,
                Some(current) => match latest {
                    Latest::Version => record.version.order_cmp(&current.version).is_gt(),
                    Latest::Build => record.build_number > current.build_number,
                },
            };
            if better {
                best.insert(group(record), record.clone());
            }
        }

        records
            .into_iter()
            .filter(|record| {
                (!self.latest_roots && self.requirements.matches_root(record))
                    || match (latest, best.get(&group(record))) {
                        (Latest::Version, Some(top)) => record.version.order_eq(&top.version),
                        (Latest::Build, Some(top)) => record.build_number == top.build_number,
                        (_, None) => false,
                    }
            })
            .collect()
    }
}
