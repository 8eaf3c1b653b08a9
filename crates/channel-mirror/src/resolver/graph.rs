//! Dependency graph arena
//!
//! Nodes live in two vectors and refer to each other by index. Edges run
//! from a record to the specifications it depends on, and from a
//! specification to the records matching it.

use crate::matchspec::MatchSpec;
use crate::record::{PackageRecord, RecordKey};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

pub type SpecIndex = usize;
pub type RecordIndex = usize;

#[derive(Debug, Clone)]
pub struct SpecNode {
    pub spec: MatchSpec,

    /// Requested by the user
    pub root: bool,

    /// Records matching the specification
    pub matches: Vec<RecordIndex>,

    /// Records depending on the specification
    pub required_by: Vec<RecordIndex>,
}

#[derive(Debug, Clone)]
pub struct RecordNode {
    pub record: Arc<PackageRecord>,

    /// Dependency specifications, in declaration order
    pub depends: Vec<SpecIndex>,

    /// Specifications this record satisfies
    pub matched_by: Vec<SpecIndex>,

    /// Traversed but left out of the result
    pub disposable: bool,

    pub pruned: bool,
}

#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    specs: Vec<SpecNode>,
    records: Vec<RecordNode>,
    spec_index: HashMap<MatchSpec, SpecIndex>,
    record_index: HashMap<RecordKey, RecordIndex>,
    universe: BTreeSet<String>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a specification node; returns its index and whether it is new
    ///
    /// Adding an existing specification as a root marks it as one.
    pub fn add_spec(&mut self, spec: MatchSpec, root: bool) -> (SpecIndex, bool) {
        if let Some(&index) = self.spec_index.get(&spec) {
            self.specs[index].root |= root;
            return (index, false);
        }

        let index = self.specs.len();
        self.spec_index.insert(spec.clone(), index);
        self.specs.push(SpecNode {
            spec,
            root,
            matches: Vec::new(),
            required_by: Vec::new(),
        });
        (index, true)
    }

    /// Add a record node; returns its index and whether it is new
    pub fn add_record(&mut self, record: Arc<PackageRecord>, disposable: bool) -> (RecordIndex, bool) {
        let key = record.key();
        if let Some(&index) = self.record_index.get(&key) {
            return (index, false);
        }

        let index = self.records.len();
        self.record_index.insert(key, index);
        self.records.push(RecordNode {
            record,
            depends: Vec::new(),
            matched_by: Vec::new(),
            disposable,
            pruned: false,
        });
        (index, true)
    }

    /// Record that `record` satisfies `spec`
    pub fn connect(&mut self, spec: SpecIndex, record: RecordIndex) {
        if !self.specs[spec].matches.contains(&record) {
            self.specs[spec].matches.push(record);
            self.records[record].matched_by.push(spec);
        }
    }

    /// Record that `record` depends on `spec`
    pub fn add_dependency(&mut self, record: RecordIndex, spec: SpecIndex) {
        if !self.records[record].depends.contains(&spec) {
            self.records[record].depends.push(spec);
            self.specs[spec].required_by.push(record);
        }
    }

    pub fn spec(&self, index: SpecIndex) -> &SpecNode {
        &self.specs[index]
    }

    pub fn record(&self, index: RecordIndex) -> &RecordNode {
        &self.records[index]
    }

    pub fn specs(&self) -> &[SpecNode] {
        &self.specs
    }

    pub fn records(&self) -> &[RecordNode] {
        &self.records
    }

    pub fn spec_index_of(&self, spec: &MatchSpec) -> Option<SpecIndex> {
        self.spec_index.get(spec).copied()
    }

    pub fn record_index_of(&self, record: &PackageRecord) -> Option<RecordIndex> {
        self.record_index.get(&record.key()).copied()
    }

    pub fn root_specs(&self) -> impl Iterator<Item = SpecIndex> + '_ {
        (0..self.specs.len()).filter(|&i| self.specs[i].root)
    }

    /// Indices of records that are not pruned
    pub fn live_records(&self) -> impl Iterator<Item = RecordIndex> + '_ {
        (0..self.records.len()).filter(|&i| !self.records[i].pruned)
    }

    /// Matches of a specification that are not pruned
    pub fn live_matches(&self, spec: SpecIndex) -> impl Iterator<Item = RecordIndex> + '_ {
        self.specs[spec]
            .matches
            .iter()
            .copied()
            .filter(|&r| !self.records[r].pruned)
    }

    pub fn mark_pruned(&mut self, record: RecordIndex) {
        self.records[record].pruned = true;
    }

    pub fn extend_universe<I>(&mut self, names: I)
    where
        I: IntoIterator<Item = String>,
    {
        self.universe.extend(names);
    }

    /// Every package name a traversal step looked at
    pub fn universe(&self) -> &BTreeSet<String> {
        &self.universe
    }

    /// Live records reachable from a root specification
    pub fn reachable_from_roots(&self) -> HashSet<RecordIndex> {
        let mut reached = HashSet::new();
        let mut stack: Vec<RecordIndex> = self
            .root_specs()
            .flat_map(|spec| self.live_matches(spec))
            .collect();

        while let Some(record) = stack.pop() {
            if !reached.insert(record) {
                continue;
            }
            for &spec in &self.records[record].depends {
                stack.extend(self.live_matches(spec).filter(|r| !reached.contains(r)));
            }
        }

        reached
    }

    pub fn spec_count(&self) -> usize {
        self.specs.len()
    }

    pub fn record_count(&self) -> usize {
        self.records.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::version::Version;

    fn record(name: &str) -> Arc<PackageRecord> {
        Arc::new(PackageRecord::new(
            name,
            Version::parse("1.0").unwrap(),
            "0",
            "noarch",
        ))
    }

    #[test]
    fn test_nodes_are_deduplicated() {
        let mut graph = DependencyGraph::new();
        let (a, new) = graph.add_spec(MatchSpec::parse("a").unwrap(), false);
        assert!(new);
        let (again, new) = graph.add_spec(MatchSpec::parse("a").unwrap(), true);
        assert_eq!(a, again);
        assert!(!new);
        assert!(graph.spec(a).root);

        let (r, _) = graph.add_record(record("a"), false);
        let (r2, new) = graph.add_record(record("a"), false);
        assert_eq!(r, r2);
        assert!(!new);
        assert_eq!(graph.record_count(), 1);
    }

    #[test]
    fn test_reachability_handles_cycles() {
        let mut graph = DependencyGraph::new();
        let (spec_a, _) = graph.add_spec(MatchSpec::parse("a").unwrap(), true);
        let (spec_b, _) = graph.add_spec(MatchSpec::parse("b").unwrap(), false);
        let (a, _) = graph.add_record(record("a"), false);
        let (b, _) = graph.add_record(record("b"), false);
        let (orphan, _) = graph.add_record(record("c"), false);

        graph.connect(spec_a, a);
        graph.connect(spec_b, b);
        graph.add_dependency(a, spec_b);
        graph.add_dependency(b, spec_a);

        let reached = graph.reachable_from_roots();
        assert!(reached.contains(&a));
        assert!(reached.contains(&b));
        assert!(!reached.contains(&orphan));

        graph.mark_pruned(b);
        assert_eq!(graph.live_matches(spec_b).count(), 0);
        assert_eq!(graph.reachable_from_roots().len(), 1);
    }
}
