//! Dependency graph, validation, and readiness.
//!
//! `DependencyGraph` is a read-only view derived from a workflow's node order
//! and edge list. Only Normal and Conditional edges create dependencies;
//! Loop edges are kept out of both readiness and cycle detection.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use petgraph::algo::tarjan_scc;
use petgraph::graph::DiGraph;
use trellis_types::error::ValidationError;
use trellis_types::workflow::NodeStatus;

use super::node::{Condition, EdgeDefinition, NodeDefinition, Outputs};

/// Incoming condition gate on a node.
#[derive(Clone)]
struct Gate {
    source: String,
    condition: Condition,
}

/// Adjacency view over a workflow's dependency edges.
#[derive(Clone, Default)]
pub struct DependencyGraph {
    /// Node ids in declaration order.
    order: Vec<String>,
    dependencies: HashMap<String, BTreeSet<String>>,
    dependents: HashMap<String, BTreeSet<String>>,
    gates: HashMap<String, Vec<Gate>>,
    /// Edges naming an unknown node, as `(source, target, missing)`.
    dangling: Vec<(String, String, String)>,
}

impl std::fmt::Debug for DependencyGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DependencyGraph")
            .field("order", &self.order)
            .field("dependencies", &self.dependencies)
            .field("gates", &self.gates.values().map(Vec::len).sum::<usize>())
            .field("dangling", &self.dangling)
            .finish()
    }
}

impl DependencyGraph {
    pub fn build(order: &[String], edges: &[EdgeDefinition]) -> Self {
        let known: HashSet<&str> = order.iter().map(String::as_str).collect();
        let mut graph = Self {
            order: order.to_vec(),
            ..Self::default()
        };
        for id in order {
            graph.dependencies.entry(id.clone()).or_default();
            graph.dependents.entry(id.clone()).or_default();
        }

        for edge in edges {
            let missing = [&edge.source, &edge.target]
                .into_iter()
                .find(|id| !known.contains(id.as_str()));
            if let Some(missing) = missing {
                graph.dangling.push((
                    edge.source.clone(),
                    edge.target.clone(),
                    missing.clone(),
                ));
                continue;
            }
            if !edge.kind.is_dependency() {
                continue;
            }

            graph
                .dependencies
                .entry(edge.target.clone())
                .or_default()
                .insert(edge.source.clone());
            graph
                .dependents
                .entry(edge.source.clone())
                .or_default()
                .insert(edge.target.clone());

            if edge.gates_readiness()
                && let Some(condition) = &edge.condition
            {
                graph.gates.entry(edge.target.clone()).or_default().push(Gate {
                    source: edge.source.clone(),
                    condition: condition.clone(),
                });
            }
        }

        graph
    }

    /// Check that every edge references a known node and that the dependency
    /// edges are acyclic.
    ///
    /// A cycle is reported by naming its member that was declared first.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if let Some((from, to, missing)) = self.dangling.first() {
            return Err(ValidationError::DanglingEdge {
                from: from.clone(),
                to: to.clone(),
                missing: missing.clone(),
            });
        }

        let mut graph = DiGraph::<usize, ()>::new();
        let indices: HashMap<&str, _> = self
            .order
            .iter()
            .enumerate()
            .map(|(position, id)| (id.as_str(), graph.add_node(position)))
            .collect();
        for (target, sources) in &self.dependencies {
            for source in sources {
                if let (Some(&from), Some(&to)) =
                    (indices.get(source.as_str()), indices.get(target.as_str()))
                {
                    graph.add_edge(from, to, ());
                }
            }
        }

        let first_on_cycle = tarjan_scc(&graph)
            .into_iter()
            .filter(|scc| {
                scc.len() > 1 || scc.iter().any(|&n| graph.contains_edge(n, n))
            })
            .filter_map(|scc| scc.iter().map(|&n| graph[n]).min())
            .min();

        match first_on_cycle {
            Some(position) => Err(ValidationError::CycleDetected {
                node: self.order[position].clone(),
            }),
            None => Ok(()),
        }
    }

    /// Pending nodes that may run now, in declaration order.
    ///
    /// A node is ready when every upstream dependency is Success or Skipped
    /// and every condition on its incoming dependency edges holds against
    /// `outputs`.
    pub fn ready_nodes(
        &self,
        nodes: &HashMap<String, NodeDefinition>,
        outputs: &Outputs,
    ) -> Vec<String> {
        self.order
            .iter()
            .filter(|id| {
                nodes
                    .get(id.as_str())
                    .is_some_and(|node| node.status() == NodeStatus::Pending)
            })
            .filter(|id| {
                self.dependencies_of(id).all(|dep| {
                    nodes
                        .get(dep)
                        .is_some_and(|node| node.status().satisfies_dependents())
                })
            })
            .filter(|id| self.gates_open(id, outputs))
            .cloned()
            .collect()
    }

    fn gates_open(&self, id: &str, outputs: &Outputs) -> bool {
        self.gates.get(id).is_none_or(|gates| {
            gates.iter().all(|gate| {
                let open = (gate.condition)(outputs);
                if !open {
                    tracing::trace!(node_id = id, source = %gate.source, "edge condition closed");
                }
                open
            })
        })
    }

    /// Direct upstream dependencies of `id`.
    pub fn dependencies_of<'a>(&'a self, id: &str) -> impl Iterator<Item = &'a str> + 'a {
        self.dependencies
            .get(id)
            .into_iter()
            .flat_map(|deps| deps.iter().map(String::as_str))
    }

    /// Direct downstream dependents of `id`.
    pub fn dependents_of<'a>(&'a self, id: &str) -> impl Iterator<Item = &'a str> + 'a {
        self.dependents
            .get(id)
            .into_iter()
            .flat_map(|deps| deps.iter().map(String::as_str))
    }

    /// Every node reachable from `id` through dependency edges, excluding `id`.
    pub fn downstream_of(&self, id: &str) -> BTreeSet<String> {
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<&str> = self.dependents_of(id).collect();
        while let Some(next) = queue.pop_front() {
            if next != id && seen.insert(next.to_string()) {
                queue.extend(self.dependents_of(next));
            }
        }
        seen
    }
}
