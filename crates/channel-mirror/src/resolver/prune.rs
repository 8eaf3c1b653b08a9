//! Graph pruning
//!
//! Turns a built graph into the final record set. Pruning steps run in this
//! order:
//!
//! 1. (optional) records with a dependency that has no surviving match are
//!    removed, repeatedly, followed by records no longer reachable
//! 2. every root specification must keep at least one match
//! 3. every surviving record must be reachable from a root
//! 4. (optional, strict) every resolved name must be named by a root
//!
//! Disposable records are dropped from the result but not from the graph.

use super::graph::{DependencyGraph, RecordIndex};
use super::ResolverError;
use crate::record::PackageRecord;
use crate::requirements::RequirementSet;
use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruneOptions {
    /// Fail when a resolved name is not named by a root specification
    pub strict: bool,

    /// Remove records whose dependencies cannot be satisfied
    pub prune_unsatisfied: bool,
}

/// Records selected by a resolution
#[derive(Debug, Clone)]
pub struct ResolvedSet {
    records: Vec<Arc<PackageRecord>>,
    universe: BTreeSet<String>,
    graph: DependencyGraph,
}

impl ResolvedSet {
    /// Resolved records, sorted
    pub fn records(&self) -> &[Arc<PackageRecord>] {
        &self.records
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<PackageRecord>> {
        self.records.iter()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn contains(&self, record: &PackageRecord) -> bool {
        self.records.binary_search_by(|r| (**r).cmp(record)).is_ok()
    }

    /// Names of the resolved records
    pub fn names(&self) -> BTreeSet<&str> {
        self.records.iter().map(|r| r.name.as_str()).collect()
    }

    /// Every package name the traversal looked at, excluded ones included
    pub fn universe(&self) -> &BTreeSet<String> {
        &self.universe
    }

    /// The pruned graph the records came from
    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }
}

/// Prune a graph and collect the resolved records
pub fn prune(
    mut graph: DependencyGraph,
    requirements: &RequirementSet,
    options: &PruneOptions,
) -> Result<ResolvedSet, ResolverError> {
    if options.prune_unsatisfied {
        let unsatisfied = prune_unsatisfied(&mut graph);
        let disconnected = prune_disconnected(&mut graph);
        debug!(unsatisfied, disconnected, "Pruned records");
    }

    let mut missing: Vec<String> = graph
        .root_specs()
        .filter(|&spec| graph.live_matches(spec).next().is_none())
        .map(|spec| graph.spec(spec).spec.to_string())
        .collect();
    if !missing.is_empty() {
        missing.sort();
        return Err(ResolverError::Unsatisfied(missing));
    }

    let reachable = graph.reachable_from_roots();
    if let Some(orphan) = graph.live_records().find(|r| !reachable.contains(r)) {
        return Err(ResolverError::Invariant(format!(
            "{} is not reachable from any root",
            graph.record(orphan).record
        )));
    }

    let mut records: Vec<Arc<PackageRecord>> = graph
        .live_records()
        .map(|r| graph.record(r))
        .filter(|node| !node.disposable)
        .map(|node| node.record.clone())
        .collect();
    records.sort();

    if options.strict {
        let named = requirements.root_names();
        let unspecified: BTreeSet<String> = records
            .iter()
            .filter(|r| !named.contains(r.name.as_str()))
            .map(|r| r.name.clone())
            .collect();
        if !unspecified.is_empty() {
            return Err(ResolverError::UnspecifiedPackages(
                unspecified.into_iter().collect(),
            ));
        }
    }

    info!(
        records = records.len(),
        graph_records = graph.record_count(),
        "Resolved requirements"
    );

    Ok(ResolvedSet {
        records,
        universe: graph.universe().clone(),
        graph,
    })
}

/// Remove records with an unmatched dependency, cascading to dependents
fn prune_unsatisfied(graph: &mut DependencyGraph) -> usize {
    let mut queue: VecDeque<RecordIndex> = graph.live_records().collect();
    let mut pruned = 0;

    while let Some(record) = queue.pop_front() {
        if graph.record(record).pruned {
            continue;
        }

        let blocked = graph
            .record(record)
            .depends
            .iter()
            .any(|&spec| graph.live_matches(spec).next().is_none());
        if !blocked {
            continue;
        }

        debug!(record = %graph.record(record).record, "Pruning record with unsatisfied dependency");
        graph.mark_pruned(record);
        pruned += 1;

        let dependents: Vec<RecordIndex> = graph
            .record(record)
            .matched_by
            .iter()
            .flat_map(|&spec| graph.spec(spec).required_by.iter().copied())
            .filter(|&r| !graph.record(r).pruned)
            .collect();
        queue.extend(dependents);
    }

    pruned
}

fn prune_disconnected(graph: &mut DependencyGraph) -> usize {
    let reachable = graph.reachable_from_roots();
    let disconnected: Vec<RecordIndex> = graph
        .live_records()
        .filter(|r| !reachable.contains(r))
        .collect();
    for &record in &disconnected {
        graph.mark_pruned(record);
    }
    disconnected.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matchspec::MatchSpec;
    use crate::query::PackageQuery;
    use crate::repository::InMemoryRepository;
    use crate::resolver::GraphBuilder;
    use crate::version::Version;

    fn record(name: &str, version: &str, depends: &[&str]) -> PackageRecord {
        let mut record = PackageRecord::new(name, Version::parse(version).unwrap(), "0", "noarch");
        for dep in depends {
            record = record.with_dependency(MatchSpec::parse(dep).unwrap());
        }
        record
    }

    fn build(repo: &InMemoryRepository, reqs: &RequirementSet) -> DependencyGraph {
        let query = PackageQuery::new(repo, reqs);
        GraphBuilder::new().with_workers(1).build(reqs, &query).unwrap()
    }

    #[test]
    fn test_unsatisfied_records_pruned_when_enabled() {
        let repo = InMemoryRepository::new([
            record("a", "1.0", &["b"]),
            record("a", "2.0", &["missing"]),
            record("b", "1.0", &[]),
        ]);
        let reqs = RequirementSet::new(["a"]).unwrap().with_subdirs(["noarch"]);

        let kept = prune(build(&repo, &reqs), &reqs, &PruneOptions::default()).unwrap();
        assert_eq!(kept.len(), 3);

        let options = PruneOptions {
            prune_unsatisfied: true,
            ..Default::default()
        };
        let pruned = prune(build(&repo, &reqs), &reqs, &options).unwrap();
        let versions: Vec<_> = pruned
            .iter()
            .map(|r| format!("{}-{}", r.name, r.version))
            .collect();
        assert_eq!(versions, vec!["a-1.0", "b-1.0"]);
    }

    #[test]
    fn test_pruning_cascades_to_unsatisfied_root() {
        let repo = InMemoryRepository::new([
            record("a", "1.0", &["b"]),
            record("b", "1.0", &["missing"]),
        ]);
        let reqs = RequirementSet::new(["a"]).unwrap().with_subdirs(["noarch"]);
        let options = PruneOptions {
            prune_unsatisfied: true,
            ..Default::default()
        };

        match prune(build(&repo, &reqs), &reqs, &options) {
            Err(ResolverError::Unsatisfied(missing)) => assert_eq!(missing, vec!["a"]),
            other => panic!("expected unsatisfied error, got {:?}", other.map(|s| s.len())),
        }
    }

    #[test]
    fn test_disposables_left_out() {
        let repo = InMemoryRepository::new([
            record("pip", "23.1", &["python"]),
            record("python", "3.9.1", &[]),
        ]);
        let reqs = RequirementSet::new(["pip"])
            .unwrap()
            .with_disposables(["python"])
            .unwrap()
            .with_subdirs(["noarch"]);

        let resolved = prune(build(&repo, &reqs), &reqs, &PruneOptions::default()).unwrap();
        assert_eq!(resolved.names().into_iter().collect::<Vec<_>>(), vec!["pip"]);
        assert_eq!(resolved.graph().record_count(), 2);
    }

    #[test]
    fn test_strict_mode() {
        let repo = InMemoryRepository::new([
            record("pip", "23.1", &["setuptools"]),
            record("setuptools", "65.0", &[]),
        ]);
        let reqs = RequirementSet::new(["pip"]).unwrap().with_subdirs(["noarch"]);
        let options = PruneOptions {
            strict: true,
            ..Default::default()
        };

        match prune(build(&repo, &reqs), &reqs, &options) {
            Err(ResolverError::UnspecifiedPackages(names)) => assert_eq!(names, vec!["setuptools"]),
            other => panic!("expected unspecified packages, got {:?}", other.map(|s| s.len())),
        }

        let reqs = RequirementSet::new(["pip", "setuptools"])
            .unwrap()
            .with_subdirs(["noarch"]);
        assert!(prune(build(&repo, &reqs), &reqs, &options).is_ok());
    }

    #[test]
    fn test_contains_and_universe() {
        let repo = InMemoryRepository::new([record("a", "1.0", &["b"]), record("b", "1.0", &[])]);
        let reqs = RequirementSet::new(["a"]).unwrap().with_subdirs(["noarch"]);
        let resolved = prune(build(&repo, &reqs), &reqs, &PruneOptions::default()).unwrap();

        assert!(resolved.contains(&record("b", "1.0", &[])));
        assert!(!resolved.contains(&record("b", "2.0", &[])));
        assert!(resolved.universe().contains("b"));
    }
}
