//! Dependency resolution for stage batches.
//!
//! Steps within a stage form a DAG through `depends_on`. The resolver
//! validates a batch before any rows are written and produces a list of
//! levels: each level's steps depend only on steps in earlier levels.
//! Tie-breaking inside a level is unspecified.

use maxq_store::StepDef;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::collections::HashMap;
use std::fmt;

/// Errors from DAG resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DagError {
    /// Two steps in the batch share an id.
    DuplicateStepId { id: String },
    /// A `depends_on` entry names no step in the batch.
    UnknownDependency { id: String, dependency: String },
    /// A step depends on itself.
    SelfDependency { id: String },
    /// The dependency graph contains a cycle.
    CycleDetected { ids: Vec<String> },
}

impl fmt::Display for DagError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateStepId { id } => write!(f, "duplicate step id '{id}'"),
            Self::UnknownDependency { id, dependency } => {
                write!(f, "step '{id}' depends on unknown step '{dependency}'")
            }
            Self::SelfDependency { id } => write!(f, "step '{id}' depends on itself"),
            Self::CycleDetected { ids } => {
                write!(f, "dependency cycle involving steps [{}]", ids.join(", "))
            }
        }
    }
}

impl std::error::Error for DagError {}

/// Resolves a step batch into execution levels.
///
/// Level `n` contains exactly the steps whose dependencies all lie in
/// levels `< n`. Runs in time linear in steps plus edges.
///
/// # Errors
///
/// Rejects duplicate ids, unknown dependencies, self-loops and cycles.
pub fn resolve_levels(steps: &[StepDef]) -> Result<Vec<Vec<StepDef>>, DagError> {
    let mut graph: DiGraph<usize, ()> = DiGraph::new();
    let mut index_by_id: HashMap<&str, NodeIndex> = HashMap::with_capacity(steps.len());

    for (position, step) in steps.iter().enumerate() {
        if index_by_id.contains_key(step.id.as_str()) {
            return Err(DagError::DuplicateStepId {
                id: step.id.clone(),
            });
        }
        let index = graph.add_node(position);
        index_by_id.insert(step.id.as_str(), index);
    }

    for step in steps {
        let target = index_by_id[step.id.as_str()];
        for dependency in &step.depends_on {
            if dependency == &step.id {
                return Err(DagError::SelfDependency {
                    id: step.id.clone(),
                });
            }
            let source =
                *index_by_id
                    .get(dependency.as_str())
                    .ok_or_else(|| DagError::UnknownDependency {
                        id: step.id.clone(),
                        dependency: dependency.clone(),
                    })?;
            graph.add_edge(source, target, ());
        }
    }

    // Kahn's algorithm, peeling one generation per pass.
    let mut in_degree: HashMap<NodeIndex, usize> = graph
        .node_indices()
        .map(|idx| (idx, graph.neighbors_directed(idx, Direction::Incoming).count()))
        .collect();

    let mut levels: Vec<Vec<StepDef>> = Vec::new();
    let mut remaining = graph.node_count();

    while remaining > 0 {
        let ready: Vec<NodeIndex> = in_degree
            .iter()
            .filter(|&(_, &degree)| degree == 0)
            .map(|(&idx, _)| idx)
            .collect();

        if ready.is_empty() {
            // Whatever is left participates in (or hangs off) a cycle.
            let mut ids: Vec<String> = in_degree
                .keys()
                .map(|idx| steps[graph[*idx]].id.clone())
                .collect();
            ids.sort();
            return Err(DagError::CycleDetected { ids });
        }

        let mut level = Vec::with_capacity(ready.len());
        for idx in ready {
            level.push(steps[graph[idx]].clone());
            in_degree.remove(&idx);
            for successor in graph.neighbors_directed(idx, Direction::Outgoing) {
                if let Some(degree) = in_degree.get_mut(&successor) {
                    *degree -= 1;
                }
            }
            remaining -= 1;
        }
        levels.push(level);
    }

    Ok(levels)
}
