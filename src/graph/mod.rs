//! Dependency graph
//!
//! This module provides:
//! - `Target`: the immutable build unit
//! - `BuildNode`: target plus mutable build state
//! - `BuildGraph`: the DAG, validated at construction
//! - Topological sorting with full cycle reporting
//! - Critical-path costing used by the scheduler for tie-breaking
//!
//! Nodes are stored in a plain map keyed by target id with edges as id
//! lists in both directions, so no ownership cycles exist anywhere.

mod node;
mod target;

pub use node::{BuildNode, BuildStatus};
pub use target::{Target, TargetId, TargetType};

use crate::error::{BuildError, BuildResult};
use crate::handler::Language;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::Ordering;

/// Flat cost of scheduling any node at all
const BASE_COST: f64 = 100.0;
/// Cost added per source file
const SOURCE_COST: f64 = 50.0;
/// Cost added per dependency edge
const DEP_COST: f64 = 10.0;

/// Relative compile cost of a language's toolchain
fn language_multiplier(language: Language) -> f64 {
    match language {
        Language::Cpp | Language::Rust => 2.0,
        Language::TypeScript | Language::JavaScript => 1.5,
        Language::Python | Language::Ruby => 0.5,
        _ => 1.0,
    }
}

/// Scheduling cost of a single node, before chain accumulation
fn node_cost(target: &Target) -> f64 {
    let raw = BASE_COST
        + target.sources.len() as f64 * SOURCE_COST
        + target.deps.len() as f64 * DEP_COST;
    raw * language_multiplier(target.language)
}

/// Aggregate shape statistics for a graph
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GraphStats {
    /// Number of nodes
    pub node_count: usize,
    /// Number of dependency edges
    pub edge_count: usize,
    /// Longest dependency chain, in edges
    pub max_depth: usize,
    /// Cost of the most expensive dependency chain
    pub critical_path_cost: f64,
}

/// The build DAG: one node per target, validated at construction
#[derive(Default, Debug)]
pub struct BuildGraph {
    nodes: HashMap<TargetId, BuildNode>,
}

impl BuildGraph {
    /// Create an empty graph
    pub fn new() -> Self {
        Self::default()
    }

    /// Build and validate a graph from a set of targets
    ///
    /// # Errors
    ///
    /// `InvalidTarget` for duplicate ids or edges to unknown targets;
    /// `Cycle` naming every node on a dependency cycle.
    pub fn from_targets(targets: Vec<Target>) -> BuildResult<Self> {
        let mut graph = Self::new();
        for target in targets {
            graph.add_target(target)?;
        }
        graph.finalize()?;
        Ok(graph)
    }

    /// Insert one target; ids must be unique
    pub fn add_target(&mut self, target: Target) -> BuildResult<()> {
        if self.nodes.contains_key(&target.id) {
            return Err(BuildError::InvalidTarget(format!(
                "duplicate target id '{}'",
                target.id
            )));
        }
        self.nodes.insert(target.id.clone(), BuildNode::new(target));
        Ok(())
    }

    /// Validate edges, reject cycles, and prepare scheduling state
    ///
    /// Must be called after the last `add_target` and before execution.
    pub fn finalize(&mut self) -> BuildResult<()> {
        // Every edge must land on a node in the map.
        for node in self.nodes.values() {
            for dep in &node.target.deps {
                if !self.nodes.contains_key(dep) {
                    return Err(BuildError::InvalidTarget(format!(
                        "target '{}' depends on unknown target '{dep}'",
                        node.target.id
                    )));
                }
            }
        }

        // Rebuild the back edges.
        let mut dependents: HashMap<TargetId, Vec<TargetId>> = HashMap::new();
        for node in self.nodes.values() {
            for dep in &node.target.deps {
                dependents
                    .entry(dep.clone())
                    .or_default()
                    .push(node.target.id.clone());
            }
        }
        for node in self.nodes.values_mut() {
            node.dependents = dependents.remove(&node.target.id).unwrap_or_default();
            node.dependents.sort_unstable();
        }

        let order = self.topological_sort()?;
        self.reset_pending_counts();
        self.compute_priorities(&order);
        Ok(())
    }

    /// Kahn's algorithm; deterministic for a given node set
    ///
    /// On a cycle, the error names every node on one concrete cycle.
    pub fn topological_sort(&self) -> BuildResult<Vec<TargetId>> {
        let mut in_degree: HashMap<&str, usize> = HashMap::with_capacity(self.nodes.len());
        let mut forward: HashMap<&str, Vec<&str>> = HashMap::with_capacity(self.nodes.len());
        for node in self.nodes.values() {
            let known = node
                .target
                .deps
                .iter()
                .filter(|d| self.nodes.contains_key(*d))
                .count();
            in_degree.insert(node.target.id.as_str(), known);
            for dep in &node.target.deps {
                if self.nodes.contains_key(dep) {
                    forward
                        .entry(dep.as_str())
                        .or_default()
                        .push(node.target.id.as_str());
                }
            }
        }

        let mut roots: Vec<&str> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| *id)
            .collect();
        roots.sort_unstable();
        let mut queue: VecDeque<&str> = roots.into();

        let mut order: Vec<TargetId> = Vec::with_capacity(self.nodes.len());
        while let Some(id) = queue.pop_front() {
            order.push(id.to_string());
            if let Some(users) = forward.get(id) {
                for user in users {
                    let remaining = in_degree
                        .get_mut(user)
                        .map(|d| {
                            *d -= 1;
                            *d
                        })
                        .unwrap_or(0);
                    if remaining == 0 {
                        queue.push_back(*user);
                    }
                }
            }
        }

        if order.len() < self.nodes.len() {
            return Err(BuildError::Cycle {
                path: self.extract_cycle(),
            });
        }
        Ok(order)
    }

    /// Recompute every node's pending-dependency counter from current
    /// statuses; used at build start and after a checkpoint merge
    pub fn reset_pending_counts(&self) {
        for node in self.nodes.values() {
            let pending = node
                .target
                .deps
                .iter()
                .filter(|dep| {
                    self.nodes
                        .get(*dep)
                        .map(|d| !d.status.is_complete())
                        .unwrap_or(false)
                })
                .count();
            node.pending_deps.store(pending, Ordering::SeqCst);
        }
    }

    fn compute_priorities(&mut self, order: &[TargetId]) {
        for id in order.iter().rev() {
            let priority = {
                let node = &self.nodes[id.as_str()];
                let downstream = node
                    .dependents
                    .iter()
                    .filter_map(|d| self.nodes.get(d).map(|n| n.priority))
                    .fold(0.0, f64::max);
                node_cost(&node.target) + downstream
            };
            if let Some(node) = self.nodes.get_mut(id) {
                node.priority = priority;
            }
        }
    }

    /// One concrete cycle, in edge order
    fn extract_cycle(&self) -> Vec<TargetId> {
        let mut visited: HashSet<&str> = HashSet::new();
        for start in self.nodes.keys() {
            if visited.contains(start.as_str()) {
                continue;
            }
            let mut path: Vec<&str> = vec![start.as_str()];
            let mut on_path: HashSet<&str> = [start.as_str()].into();
            let mut frames = vec![self.nodes[start.as_str()].target.deps.iter()];
            visited.insert(start.as_str());

            while !frames.is_empty() {
                let next = frames
                    .last_mut()
                    .and_then(|iter| iter.next())
                    .map(|d| d.as_str());
                match next {
                    Some(dep) => {
                        if !self.nodes.contains_key(dep) {
                            continue;
                        }
                        if on_path.contains(dep) {
                            if let Some(pos) = path.iter().position(|p| *p == dep) {
                                return path[pos..].iter().map(|s| s.to_string()).collect();
                            }
                        }
                        if visited.insert(dep) {
                            on_path.insert(dep);
                            path.push(dep);
                            frames.push(self.nodes[dep].target.deps.iter());
                        }
                    }
                    None => {
                        frames.pop();
                        if let Some(done) = path.pop() {
                            on_path.remove(done);
                        }
                    }
                }
            }
        }
        Vec::new()
    }

    /// Ids of nodes that are Pending with no unfinished dependencies,
    /// highest priority first
    pub fn ready_nodes(&self) -> Vec<TargetId> {
        let mut ready: Vec<&BuildNode> = self.nodes.values().filter(|n| n.is_ready()).collect();
        ready.sort_by(|a, b| {
            b.priority
                .partial_cmp(&a.priority)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.target.id.cmp(&b.target.id))
        });
        ready.into_iter().map(|n| n.target.id.clone()).collect()
    }

    /// Look up a node
    pub fn node(&self, id: &str) -> Option<&BuildNode> {
        self.nodes.get(id)
    }

    /// Look up a node mutably
    pub fn node_mut(&mut self, id: &str) -> Option<&mut BuildNode> {
        self.nodes.get_mut(id)
    }

    /// Iterate all nodes in map order
    pub fn nodes(&self) -> impl Iterator<Item = &BuildNode> {
        self.nodes.values()
    }

    /// All target ids in map order
    pub fn ids(&self) -> impl Iterator<Item = &TargetId> {
        self.nodes.keys()
    }

    /// Number of nodes
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the graph has no nodes
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Shape statistics: counts, depth, and critical-path cost
    pub fn stats(&self) -> GraphStats {
        let edge_count = self.nodes.values().map(|n| n.target.deps.len()).sum();

        let mut max_depth = 0;
        let mut critical_path_cost: f64 = 0.0;
        if let Ok(order) = self.topological_sort() {
            let mut depth: HashMap<&str, usize> = HashMap::with_capacity(order.len());
            for id in &order {
                let node = &self.nodes[id.as_str()];
                let d = node
                    .target
                    .deps
                    .iter()
                    .filter_map(|dep| depth.get(dep.as_str()))
                    .max()
                    .map(|m| m + 1)
                    .unwrap_or(0);
                depth.insert(node.target.id.as_str(), d);
                max_depth = max_depth.max(d);
            }
            critical_path_cost = self
                .nodes
                .values()
                .map(|n| n.priority)
                .fold(0.0, f64::max);
        }

        GraphStats {
            node_count: self.nodes.len(),
            edge_count,
            max_depth,
            critical_path_cost,
        }
    }
}
