//! Dependency graph construction and scheduling order.
//!
//! Built once from the frozen registry: an index-based adjacency structure
//! (dataset indices in declaration order, no pointer-linked nodes). Cycle
//! detection and upstream resolution happen here, at build time; the engine
//! never discovers a bad graph at runtime. The built graph is read-only and
//! may be shared by reference across evaluation threads.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use crate::dataset::{AccessMode, DatasetKind};
use crate::error::{CascadeError, Result};
use crate::registry::FrozenRegistry;

/// A dependency edge: `consumer` reads `producer` with the given mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Edge {
    pub consumer: usize,
    pub producer: usize,
    pub mode: AccessMode,
}

/// The validated, acyclic dependency graph with a deterministic
/// topological schedule.
#[derive(Debug)]
pub struct DependencyGraph {
    /// Edges grouped by consumer, in read-declaration order.
    reads: Vec<Vec<Edge>>,
    /// Consumer indices per producer.
    consumers: Vec<Vec<usize>>,
    /// Topological order of dataset indices (producers first), ties
    /// broken by declaration order.
    topo_order: Vec<usize>,
    /// Topological order grouped into layers with no edges inside a
    /// layer; datasets within one layer may evaluate in parallel.
    layers: Vec<Vec<usize>>,
}

impl DependencyGraph {
    /// Build and validate the graph from a frozen registry.
    pub fn build(registry: &FrozenRegistry) -> Result<Self> {
        let n = registry.len();
        let mut reads: Vec<Vec<Edge>> = vec![Vec::new(); n];
        let mut consumers: Vec<Vec<usize>> = vec![Vec::new(); n];

        for (consumer, dataset) in registry.iter().enumerate() {
            if matches!(dataset.kind(), DatasetKind::SourceIncremental { .. })
                && !dataset.reads().is_empty()
            {
                return Err(CascadeError::invalid_argument(format!(
                    "source dataset '{}' must not declare upstream reads",
                    dataset.name()
                )));
            }
            if !matches!(dataset.kind(), DatasetKind::SourceIncremental { .. })
                && dataset.reads().is_empty()
            {
                return Err(CascadeError::invalid_argument(format!(
                    "dataset '{}' declares no upstream reads",
                    dataset.name()
                )));
            }

            for read in dataset.reads() {
                let producer = registry.index_of(&read.dataset)?;
                let upstream = registry.get(producer);
                if read.mode == AccessMode::Stream {
                    match upstream.kind() {
                        DatasetKind::FullRefresh => {
                            return Err(CascadeError::invalid_argument(format!(
                                "'{}' cannot stream from full-refresh dataset '{}': \
                                 replaced content has no stable offsets",
                                dataset.name(),
                                upstream.name()
                            )));
                        }
                        DatasetKind::View => {
                            return Err(CascadeError::invalid_argument(format!(
                                "'{}' cannot stream from view '{}': views have no offsets",
                                dataset.name(),
                                upstream.name()
                            )));
                        }
                        _ => {}
                    }
                }
                match dataset.kind() {
                    DatasetKind::FullRefresh | DatasetKind::View
                        if read.mode == AccessMode::Stream =>
                    {
                        return Err(CascadeError::invalid_argument(format!(
                            "dataset '{}' ({:?}) must read upstreams in snapshot mode",
                            dataset.name(),
                            dataset.kind()
                        )));
                    }
                    _ => {}
                }
                reads[consumer].push(Edge {
                    consumer,
                    producer,
                    mode: read.mode,
                });
                consumers[producer].push(consumer);
            }
        }

        detect_cycle(registry, &reads)?;
        let topo_order = topological_order(n, &reads);
        let layers = build_layers(n, &reads, &topo_order);

        Ok(Self {
            reads,
            consumers,
            topo_order,
            layers,
        })
    }

    /// The edges read by a consumer, in declaration order.
    pub fn reads_of(&self, consumer: usize) -> &[Edge] {
        &self.reads[consumer]
    }

    /// The consumers of a producer.
    pub fn consumers_of(&self, producer: usize) -> &[usize] {
        &self.consumers[producer]
    }

    /// Full topological order, producers before consumers.
    pub fn topo_order(&self) -> &[usize] {
        &self.topo_order
    }

    /// Topological layers; no edges exist inside one layer.
    pub fn layers(&self) -> &[Vec<usize>] {
        &self.layers
    }
}

/// Depth-first cycle detection with recursion-stack marking. On a cycle,
/// reports its members in traversal order, closing back on the entry node.
fn detect_cycle(registry: &FrozenRegistry, reads: &[Vec<Edge>]) -> Result<()> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Unvisited,
        OnStack,
        Done,
    }

    let n = reads.len();
    let mut marks = vec![Mark::Unvisited; n];
    let mut stack: Vec<usize> = Vec::new();

    // Iterative DFS over producer edges; (node, next-edge-index) frames.
    for root in 0..n {
        if marks[root] != Mark::Unvisited {
            continue;
        }
        let mut frames: Vec<(usize, usize)> = vec![(root, 0)];
        marks[root] = Mark::OnStack;
        stack.push(root);

        while let Some(&mut (node, ref mut edge_idx)) = frames.last_mut() {
            if *edge_idx < reads[node].len() {
                let producer = reads[node][*edge_idx].producer;
                *edge_idx += 1;
                match marks[producer] {
                    Mark::Unvisited => {
                        marks[producer] = Mark::OnStack;
                        stack.push(producer);
                        frames.push((producer, 0));
                    }
                    Mark::OnStack => {
                        let entry = stack.iter().position(|&i| i == producer).unwrap_or(0);
                        let mut cycle: Vec<String> = stack[entry..]
                            .iter()
                            .map(|&i| registry.get(i).name().to_string())
                            .collect();
                        cycle.push(registry.get(producer).name().to_string());
                        return Err(CascadeError::CyclicDependency { cycle });
                    }
                    Mark::Done => {}
                }
            } else {
                marks[node] = Mark::Done;
                stack.pop();
                frames.pop();
            }
        }
    }
    Ok(())
}

/// Kahn's algorithm with a min-heap on declaration index so that, among
/// the valid topological orders, the one consistent with declaration
/// order is always chosen. Execution stays reproducible across runs.
fn topological_order(n: usize, reads: &[Vec<Edge>]) -> Vec<usize> {
    let mut in_degree = vec![0usize; n];
    for (consumer, edges) in reads.iter().enumerate() {
        in_degree[consumer] = edges.len();
    }

    let mut ready: BinaryHeap<Reverse<usize>> = (0..n)
        .filter(|&i| in_degree[i] == 0)
        .map(Reverse)
        .collect();
    let mut consumers: Vec<Vec<usize>> = vec![Vec::new(); n];
    for edges in reads {
        for edge in edges {
            consumers[edge.producer].push(edge.consumer);
        }
    }

    let mut order = Vec::with_capacity(n);
    while let Some(Reverse(node)) = ready.pop() {
        order.push(node);
        for &consumer in &consumers[node] {
            in_degree[consumer] -= 1;
            if in_degree[consumer] == 0 {
                ready.push(Reverse(consumer));
            }
        }
    }
    order
}

/// Group the order into antichains: a dataset's layer is one past the
/// deepest layer among its producers.
fn build_layers(n: usize, reads: &[Vec<Edge>], topo_order: &[usize]) -> Vec<Vec<usize>> {
    let mut level = vec![0usize; n];
    let mut max_level = 0;
    for &node in topo_order {
        for edge in &reads[node] {
            level[node] = level[node].max(level[edge.producer] + 1);
        }
        max_level = max_level.max(level[node]);
    }
    let mut layers: Vec<Vec<usize>> = vec![Vec::new(); max_level + 1];
    for &node in topo_order {
        layers[level[node]].push(node);
    }
    layers.retain(|layer| !layer.is_empty());
    layers
}
