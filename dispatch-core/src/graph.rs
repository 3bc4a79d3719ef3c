//! Generic DAG over tasks or phases.
//!
//! Kahn's algorithm via `petgraph::algo::toposort` for cycle detection at
//! construction time, plus an in-degree counter and reverse-adjacency map
//! maintained alongside the graph for O(1) `mark_completed`. `petgraph` is
//! a workspace dependency carried over from the teacher (`onboarding` and
//! the root workspace both declare it) but was never actually wired up
//! there; this is the first real use of it in this lineage.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;

use crate::error::GraphError;

/// Anything that can sit in a [`DependencyGraph`]: an id and the ids it
/// depends on.
pub trait Node {
    fn id(&self) -> &str;
    fn depends_on(&self) -> &HashSet<String>;
}

struct Inner<N> {
    nodes: HashMap<String, N>,
    /// edge direction: dependency -> dependent, so a topological walk
    /// starting from nodes with no incoming edges visits dependencies first.
    graph: DiGraphMap<u32, ()>,
    index_of: HashMap<String, u32>,
    id_of: HashMap<u32, String>,
    in_degree: HashMap<String, usize>,
    dependents: HashMap<String, Vec<String>>,
}

/// Thread-safe DAG over nodes carrying an id and a `depends_on` set.
///
/// All public methods are critical sections guarded by a single internal
/// mutex, per §5's synchronization discipline for this component.
pub struct DependencyGraph<N> {
    inner: Mutex<Inner<N>>,
}

impl<N: Node> DependencyGraph<N> {
    /// Builds the graph, failing fast on a dangling dependency or a cycle.
    /// Empty input is a valid, immediately-empty graph.
    pub fn build(nodes: Vec<N>) -> Result<Self, GraphError> {
        let mut index_of = HashMap::new();
        let mut id_of = HashMap::new();
        let mut graph = DiGraphMap::new();

        for (i, n) in nodes.iter().enumerate() {
            let idx = i as u32;
            index_of.insert(n.id().to_string(), idx);
            id_of.insert(idx, n.id().to_string());
            graph.add_node(idx);
        }

        let mut in_degree = HashMap::new();
        let mut dependents: HashMap<String, Vec<String>> = HashMap::new();
        for n in &nodes {
            in_degree.entry(n.id().to_string()).or_insert(0);
            for dep in n.depends_on() {
                let dep_idx = *index_of
                    .get(dep)
                    .ok_or_else(|| GraphError::InvalidDependency(dep.clone()))?;
                let self_idx = index_of[n.id()];
                graph.add_edge(dep_idx, self_idx, ());
                *in_degree.entry(n.id().to_string()).or_insert(0) += 1;
                dependents.entry(dep.clone()).or_default().push(n.id().to_string());
            }
        }

        if let Err(cycle) = toposort(&graph, None) {
            let culprit = id_of
                .get(&cycle.node_id())
                .cloned()
                .unwrap_or_default();
            return Err(GraphError::CircularDependency(vec![culprit]));
        }

        let nodes_by_id = nodes
            .into_iter()
            .map(|n| (n.id().to_string(), n))
            .collect();

        Ok(Self {
            inner: Mutex::new(Inner {
                nodes: nodes_by_id,
                graph,
                index_of,
                id_of,
                in_degree,
                dependents,
            }),
        })
    }

    /// Nodes whose unmet-dependency count is zero and that have not been
    /// removed. Tie-break order among ready nodes is unspecified.
    pub fn ready(&self) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        inner
            .nodes
            .keys()
            .filter(|id| inner.in_degree.get(*id).copied().unwrap_or(0) == 0)
            .cloned()
            .collect()
    }

    /// Removes the node and returns the ids whose dependency count just
    /// reached zero. A no-op returning an empty set if `id` was already
    /// removed.
    pub fn mark_completed(&self, id: &str) -> Vec<String> {
        let mut inner = self.inner.lock().unwrap();
        if inner.nodes.remove(id).is_none() {
            return Vec::new();
        }
        inner.in_degree.remove(id);
        if let Some(idx) = inner.index_of.remove(id) {
            inner.id_of.remove(&idx);
            inner.graph.remove_node(idx);
        }

        let mut newly_ready = Vec::new();
        if let Some(dependents) = inner.dependents.remove(id) {
            for dep_id in dependents {
                if let Some(count) = inner.in_degree.get_mut(&dep_id) {
                    *count = count.saturating_sub(1);
                    if *count == 0 {
                        newly_ready.push(dep_id);
                    }
                }
            }
        }
        newly_ready
    }

    pub fn empty(&self) -> bool {
        self.inner.lock().unwrap().nodes.is_empty()
    }

    pub fn remaining(&self) -> usize {
        self.inner.lock().unwrap().nodes.len()
    }

    pub fn get(&self, id: &str) -> Option<N>
    where
        N: Clone,
    {
        self.inner.lock().unwrap().nodes.get(id).cloned()
    }
}
