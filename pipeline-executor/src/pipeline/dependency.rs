// Dependency Graph Validator
// Turns step identifiers plus dependency edges into a linear execution order

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt::Display;
use std::hash::Hash;
use thiserror::Error;

/// Errors produced while validating step dependencies
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("Pipeline must have at least one step")]
    EmptyPipeline,

    #[error("Step '{step}' is defined more than once")]
    DuplicateStep { step: String },

    #[error("Step dependency references unknown step '{unknown}' ({step} -> {depends_on})")]
    DanglingDependency {
        step: String,
        depends_on: String,
        unknown: String,
    },

    #[error("Step '{0}' cannot depend on itself")]
    SelfDependency(String),

    #[error("Circular dependency detected between steps: {}", .remaining.join(", "))]
    CyclicDependency { remaining: Vec<String> },
}

/// Directed graph of steps where an edge points from a step to the step it depends on.
///
/// Nodes keep their insertion order, which is used to break ties so the
/// computed order is reproducible.
#[derive(Debug, Clone)]
pub struct DependencyGraph<T> {
    nodes: Vec<T>,
    indices: HashMap<T, usize>,
    /// dependency index -> indices of steps that depend on it
    dependents: HashMap<usize, Vec<usize>>,
    /// step index -> indices of the steps it depends on
    dependencies: HashMap<usize, Vec<usize>>,
}

impl<T> DependencyGraph<T>
where
    T: Clone + Eq + Hash + Display,
{
    pub fn new(nodes: Vec<T>) -> Result<Self, GraphError> {
        if nodes.is_empty() {
            return Err(GraphError::EmptyPipeline);
        }

        let mut indices = HashMap::with_capacity(nodes.len());
        for (i, node) in nodes.iter().enumerate() {
            if indices.insert(node.clone(), i).is_some() {
                return Err(GraphError::DuplicateStep {
                    step: node.to_string(),
                });
            }
        }

        Ok(Self {
            nodes,
            indices,
            dependents: HashMap::new(),
            dependencies: HashMap::new(),
        })
    }

    /// Build a graph from a step set and `(step, depends_on)` edges.
    ///
    /// Self references are checked across every edge before unknown steps, so
    /// a self-dependency is always reported as such.
    pub fn from_edges(nodes: Vec<T>, edges: &[(T, T)]) -> Result<Self, GraphError> {
        let mut graph = Self::new(nodes)?;

        if let Some((step, _)) = edges.iter().find(|(step, dep)| step == dep) {
            return Err(GraphError::SelfDependency(step.to_string()));
        }

        for (step, depends_on) in edges {
            graph.add_dependency(step, depends_on)?;
        }

        Ok(graph)
    }

    /// Record that `step` depends on `depends_on`. Repeated edges are ignored.
    pub fn add_dependency(&mut self, step: &T, depends_on: &T) -> Result<(), GraphError> {
        if step == depends_on {
            return Err(GraphError::SelfDependency(step.to_string()));
        }

        let dangling = |unknown: &T| GraphError::DanglingDependency {
            step: step.to_string(),
            depends_on: depends_on.to_string(),
            unknown: unknown.to_string(),
        };
        let from = *self.indices.get(step).ok_or_else(|| dangling(step))?;
        let to = *self.indices.get(depends_on).ok_or_else(|| dangling(depends_on))?;

        let deps = self.dependencies.entry(from).or_default();
        if deps.contains(&to) {
            return Ok(());
        }
        deps.push(to);
        self.dependents.entry(to).or_default().push(from);

        Ok(())
    }

    /// Topological sort using Kahn's algorithm.
    ///
    /// Among steps that are ready at the same time the one inserted first wins.
    pub fn topological_sort(&self) -> Result<Vec<T>, GraphError> {
        let mut in_degree: Vec<usize> = (0..self.nodes.len())
            .map(|i| self.dependencies.get(&i).map_or(0, Vec::len))
            .collect();

        let mut ready: BTreeSet<usize> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, &degree)| degree == 0)
            .map(|(i, _)| i)
            .collect();

        let mut order = Vec::with_capacity(self.nodes.len());

        while let Some(node) = ready.pop_first() {
            order.push(node);

            if let Some(dependents) = self.dependents.get(&node) {
                for &dependent in dependents {
                    in_degree[dependent] -= 1;
                    if in_degree[dependent] == 0 {
                        ready.insert(dependent);
                    }
                }
            }
        }

        if order.len() != self.nodes.len() {
            let emitted: HashSet<usize> = order.into_iter().collect();
            let remaining = (0..self.nodes.len())
                .filter(|i| !emitted.contains(i))
                .map(|i| self.nodes[i].to_string())
                .collect();
            return Err(GraphError::CyclicDependency { remaining });
        }

        Ok(order.into_iter().map(|i| self.nodes[i].clone()).collect())
    }

    /// Group steps into levels; steps in the same level have no ordering
    /// constraint between them and may run concurrently.
    pub fn execution_levels(&self) -> Result<Vec<Vec<T>>, GraphError> {
        let order = self.topological_sort()?;
        let mut level_of: HashMap<usize, usize> = HashMap::with_capacity(order.len());
        let mut levels: Vec<Vec<T>> = Vec::new();

        for node in order {
            let idx = self.indices[&node];
            let level = self
                .dependencies
                .get(&idx)
                .and_then(|deps| deps.iter().filter_map(|d| level_of.get(d)).max())
                .map_or(0, |l| l + 1);

            level_of.insert(idx, level);
            if level >= levels.len() {
                levels.resize_with(level + 1, Vec::new);
            }
            levels[level].push(node);
        }

        Ok(levels)
    }

    /// Steps that `step` depends on directly
    pub fn dependencies_of(&self, step: &T) -> Option<Vec<&T>> {
        let idx = self.indices.get(step)?;
        Some(
            self.dependencies
                .get(idx)
                .map(|deps| deps.iter().map(|&d| &self.nodes[d]).collect())
                .unwrap_or_default(),
        )
    }

    /// Steps that depend on `step`, directly or transitively
    pub fn transitive_dependents(&self, step: &T) -> Vec<T> {
        let Some(&start) = self.indices.get(step) else {
            return Vec::new();
        };

        let mut seen = BTreeSet::new();
        let mut stack = vec![start];
        while let Some(node) = stack.pop() {
            if let Some(dependents) = self.dependents.get(&node) {
                for &dependent in dependents {
                    if seen.insert(dependent) {
                        stack.push(dependent);
                    }
                }
            }
        }

        seen.into_iter().map(|i| self.nodes[i].clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Validate a step set with its `(step, depends_on)` edges and return the
/// execution order.
pub fn validate_dependencies<T>(steps: &[T], edges: &[(T, T)]) -> Result<Vec<T>, GraphError>
where
    T: Clone + Eq + Hash + Display,
{
    DependencyGraph::from_edges(steps.to_vec(), edges)?.topological_sort()
}
