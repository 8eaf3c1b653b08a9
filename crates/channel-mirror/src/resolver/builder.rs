//! Graph construction
//!
//! The builder works in waves. Each wave looks up every pending
//! specification, merges the results into the graph in specification order,
//! and queues the dependency specifications of the records it added. The
//! traversal stops when a wave discovers nothing new.

use super::graph::{DependencyGraph, SpecIndex};
use super::ResolverError;
use crate::error::ChannelAccessError;
use crate::matchspec::MatchSpec;
use crate::query::{PackageQuery, QueryResult};
use crate::repository::CandidateRepository;
use crate::requirements::RequirementSet;
use crossbeam::channel;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};

/// Builds a [`DependencyGraph`] from a requirement set
#[derive(Debug, Clone)]
pub struct GraphBuilder {
    workers: usize,
}

impl Default for GraphBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl GraphBuilder {
    /// Create a builder using one worker per CPU
    pub fn new() -> Self {
        Self {
            workers: num_cpus::get().max(1),
        }
    }

    /// Set the number of lookup workers; `0` means one per CPU
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = if workers == 0 {
            num_cpus::get().max(1)
        } else {
            workers
        };
        self
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Traverse the dependencies of the root specifications
    ///
    /// Fails with [`ResolverError::Unsatisfied`] if a root specification
    /// matches no admitted record.
    pub fn build<R>(
        &self,
        requirements: &RequirementSet,
        query: &PackageQuery<'_, R>,
    ) -> Result<DependencyGraph, ResolverError>
    where
        R: CandidateRepository + ?Sized,
    {
        let mut graph = DependencyGraph::new();
        let mut pending: Vec<SpecIndex> = requirements
            .roots()
            .iter()
            .map(|spec| graph.add_spec(spec.clone(), true).0)
            .collect();
        let mut unsatisfied = Vec::new();
        let mut wave = 0;

        while !pending.is_empty() {
            wave += 1;
            pending.sort_by(|&a, &b| graph.spec(a).spec.cmp(&graph.spec(b).spec));
            pending.dedup();

            let specs: Vec<MatchSpec> = pending.iter().map(|&i| graph.spec(i).spec.clone()).collect();
            debug!(wave, specs = specs.len(), "Looking up specifications");
            let results = self.lookup(&specs, query)?;

            let mut next = Vec::new();
            for (spec_index, result) in pending.drain(..).zip(results) {
                graph.extend_universe(result.names);
                if let Some(name) = graph.spec(spec_index).spec.exact_name() {
                    let name = name.to_string();
                    graph.extend_universe([name]);
                }

                if graph.spec(spec_index).root && result.accepted.is_empty() {
                    unsatisfied.push(graph.spec(spec_index).spec.to_string());
                }

                for record in result.accepted {
                    let disposable = requirements.is_disposable(&record);
                    let (record_index, new) = graph.add_record(record.clone(), disposable);
                    graph.connect(spec_index, record_index);
                    if !new {
                        continue;
                    }

                    for dependency in &record.depends {
                        let (dependency_index, new_spec) = graph.add_spec(dependency.clone(), false);
                        graph.add_dependency(record_index, dependency_index);
                        if new_spec {
                            next.push(dependency_index);
                        }
                    }
                }
            }

            pending = next;
        }

        if !unsatisfied.is_empty() {
            unsatisfied.sort();
            return Err(ResolverError::Unsatisfied(unsatisfied));
        }

        info!(
            waves = wave,
            specs = graph.spec_count(),
            records = graph.record_count(),
            "Built dependency graph"
        );
        Ok(graph)
    }

    /// Run the searches of one wave; results are in the order of `specs`
    fn lookup<R>(
        &self,
        specs: &[MatchSpec],
        query: &PackageQuery<'_, R>,
    ) -> Result<Vec<QueryResult>, ResolverError>
    where
        R: CandidateRepository + ?Sized,
    {
        let workers = self.workers.min(specs.len());
        if workers <= 1 {
            return specs
                .iter()
                .map(|spec| query.search(spec).map_err(ResolverError::from))
                .collect();
        }

        let (job_tx, job_rx) = channel::unbounded::<(usize, &MatchSpec)>();
        let (result_tx, result_rx) = channel::unbounded();
        for job in specs.iter().enumerate() {
            if job_tx.send(job).is_err() {
                break;
            }
        }
        drop(job_tx);

        let failed = AtomicBool::new(false);
        std::thread::scope(|scope| {
            for _ in 0..workers {
                let job_rx = job_rx.clone();
                let result_tx = result_tx.clone();
                let failed = &failed;
                scope.spawn(move || {
                    for (position, spec) in job_rx.iter() {
                        if failed.load(Ordering::Relaxed) {
                            break;
                        }
                        let result = query.search(spec);
                        if result.is_err() {
                            failed.store(true, Ordering::Relaxed);
                        }
                        if result_tx.send((position, result)).is_err() {
                            break;
                        }
                    }
                });
            }
        });
        drop(result_tx);

        let mut slots: Vec<Option<QueryResult>> = specs.iter().map(|_| None).collect();
        let mut first_error: Option<(usize, ChannelAccessError)> = None;
        for (position, result) in result_rx.iter() {
            match result {
                Ok(found) => slots[position] = Some(found),
                Err(e) => {
                    if first_error.as_ref().map_or(true, |(p, _)| position < *p) {
                        first_error = Some((position, e));
                    }
                }
            }
        }

        if let Some((_, error)) = first_error {
            return Err(error.into());
        }

        slots
            .into_iter()
            .zip(specs)
            .map(|(slot, spec)| {
                slot.ok_or_else(|| ResolverError::Invariant(format!("no lookup result for {}", spec)))
            })
            .collect()
    }
}
