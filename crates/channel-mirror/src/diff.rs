//! Channel diffs
//!
//! Compares a resolved record set with what a channel currently publishes.

use crate::channel::ChannelSnapshot;
use crate::record::PackageRecord;
use crate::resolver::ResolvedSet;
use std::sync::Arc;
use tracing::info;

/// Records to add to and remove from a channel, each sorted
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Diff {
    pub additions: Vec<Arc<PackageRecord>>,
    pub removals: Vec<Arc<PackageRecord>>,
}

impl Diff {
    pub fn is_empty(&self) -> bool {
        self.additions.is_empty() && self.removals.is_empty()
    }
}

/// Diff a resolved set against a channel snapshot
///
/// Without a snapshot every resolved record is an addition. Removals are
/// limited to names the resolution looked at, so packages unrelated to the
/// requirements stay in the channel.
pub fn diff(resolved: &ResolvedSet, snapshot: Option<&ChannelSnapshot>) -> Diff {
    let Some(snapshot) = snapshot else {
        return Diff {
            additions: resolved.records().to_vec(),
            removals: Vec::new(),
        };
    };

    let additions: Vec<_> = resolved
        .iter()
        .filter(|record| !snapshot.contains(record))
        .cloned()
        .collect();

    let mut removals: Vec<_> = snapshot
        .records()
        .filter(|record| resolved.universe().contains(&record.name))
        .filter(|record| !resolved.contains(record))
        .cloned()
        .collect();
    removals.sort();

    info!(
        additions = additions.len(),
        removals = removals.len(),
        "Computed channel diff"
    );

    Diff {
        additions,
        removals,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::InMemoryRepository;
    use crate::requirements::RequirementSet;
    use crate::resolver::Resolver;
    use crate::version::Version;

    fn record(name: &str, version: &str) -> PackageRecord {
        PackageRecord::new(name, Version::parse(version).unwrap(), "0", "noarch")
    }

    fn resolve(records: Vec<PackageRecord>, roots: &[&str]) -> ResolvedSet {
        let repo = InMemoryRepository::new(records);
        let reqs = RequirementSet::new(roots).unwrap().with_subdirs(["noarch"]);
        Resolver::new(&repo).resolve(&reqs).unwrap()
    }

    #[test]
    fn test_absolute_mode() {
        let resolved = resolve(vec![record("a", "1.0"), record("a", "2.0")], &["a"]);
        let result = diff(&resolved, None);
        assert_eq!(result.additions.len(), 2);
        assert!(result.removals.is_empty());
    }

    #[test]
    fn test_self_diff_is_empty() {
        let resolved = resolve(vec![record("a", "1.0"), record("a", "2.0")], &["a"]);
        let snapshot = ChannelSnapshot::from_records(resolved.records().iter().cloned());
        assert!(diff(&resolved, Some(&snapshot)).is_empty());
    }

    #[test]
    fn test_removals_limited_to_universe() {
        let resolved = resolve(vec![record("a", "2.0")], &["a"]);
        let snapshot = ChannelSnapshot::from_records(
            [record("a", "1.0"), record("unrelated", "1.0")]
                .into_iter()
                .map(Arc::new),
        );

        let result = diff(&resolved, Some(&snapshot));
        assert_eq!(result.additions.len(), 1);
        assert_eq!(result.additions[0].version.as_str(), "2.0");
        assert_eq!(result.removals.len(), 1);
        assert_eq!(result.removals[0].name, "a");
    }

    #[test]
    fn test_output_sorted_by_version_order() {
        let resolved = resolve(
            vec![record("a", "1.10"), record("a", "1.9"), record("a", "1.2")],
            &["a"],
        );
        let result = diff(&resolved, Some(&ChannelSnapshot::new()));
        let versions: Vec<_> = result.additions.iter().map(|r| r.version.as_str()).collect();
        assert_eq!(versions, vec!["1.2", "1.9", "1.10"]);
    }
}
