//! Pass dependency graph.
//!
//! Nodes are keyed by the output id of the pass they wrap. An edge
//! `producer -> consumer` exists whenever the consumer declares an input id
//! equal to the producer's output id; a pass reading its own output is a
//! feedback loop, not an edge. Execution order is Kahn's algorithm with ties
//! broken by declaration order, so equal descriptions always give equal
//! orders.
//!
//! The graph is generic over its payload: the builder produces a plan of
//! `PassSpec`s, compilation turns those into pipelines, and the engine commits
//! those into passes with live GPU resources.

mod builder;

pub use builder::{
    compile_graph, lower_plan, plan_graph, ChannelSource, CompiledNode, GraphPlan, LoweredPass,
    PassSpec,
};

use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap};

use shadertoy::PassId;

use crate::error::BuildError;

#[derive(Debug, Clone)]
pub struct GraphNode<N> {
    pub name: String,
    pub output_id: PassId,
    pub input_ids: Vec<PassId>,
    pub payload: N,
}

#[derive(Debug, Clone)]
pub struct RenderGraph<N> {
    nodes: Vec<GraphNode<N>>,
    edges: BTreeSet<(usize, usize)>,
    order: Vec<usize>,
}

impl<N> RenderGraph<N> {
    /// Derives edges and the execution order for `nodes` in declaration order.
    pub fn from_nodes(nodes: Vec<GraphNode<N>>) -> Result<Self, BuildError> {
        let mut producers = HashMap::with_capacity(nodes.len());
        for (index, node) in nodes.iter().enumerate() {
            if producers.insert(node.output_id, index).is_some() {
                return Err(BuildError::InvalidArgument(format!(
                    "pass '{}' reuses output id {}",
                    node.name, node.output_id
                )));
            }
        }

        let mut edges = BTreeSet::new();
        for (consumer, node) in nodes.iter().enumerate() {
            for input in &node.input_ids {
                if let Some(&producer) = producers.get(input) {
                    if producer != consumer {
                        edges.insert((producer, consumer));
                    }
                }
            }
        }

        let order = topological_order(nodes.len(), &edges).map_err(|remaining| {
            BuildError::GraphCycleDetected {
                outputs: remaining
                    .into_iter()
                    .map(|index| nodes[index].output_id.value())
                    .collect(),
            }
        })?;

        Ok(Self {
            nodes,
            edges,
            order,
        })
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> &[GraphNode<N>] {
        &self.nodes
    }

    pub fn node(&self, index: usize) -> Option<&GraphNode<N>> {
        self.nodes.get(index)
    }

    /// Node indices in execution order.
    pub fn order(&self) -> &[usize] {
        &self.order
    }

    /// `(producer, consumer)` index pairs.
    pub fn edges(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.edges.iter().copied()
    }

    pub fn output_ids(&self) -> BTreeSet<PassId> {
        self.nodes.iter().map(|node| node.output_id).collect()
    }

    /// Edges expressed as `(producer output, consumer output)`.
    pub fn edge_ids(&self) -> BTreeSet<(PassId, PassId)> {
        self.edges
            .iter()
            .map(|&(producer, consumer)| {
                (self.nodes[producer].output_id, self.nodes[consumer].output_id)
            })
            .collect()
    }

    pub fn index_of(&self, output_id: PassId) -> Option<usize> {
        self.nodes
            .iter()
            .position(|node| node.output_id == output_id)
    }

    pub fn has_consumers(&self, index: usize) -> bool {
        self.edges.iter().any(|&(producer, _)| producer == index)
    }

    /// Visits every node in execution order, stopping at the first error.
    pub fn execute<E, F>(&self, mut visit: F) -> Result<(), E>
    where
        F: FnMut(usize, &GraphNode<N>) -> Result<(), E>,
    {
        for &index in &self.order {
            visit(index, &self.nodes[index])?;
        }
        Ok(())
    }

    /// Replaces every payload, keeping topology. Stops at the first error;
    /// payloads produced before it are dropped.
    pub fn try_map<M, E, F>(self, mut map: F) -> Result<RenderGraph<M>, E>
    where
        F: FnMut(usize, &GraphNode<()>, N) -> Result<M, E>,
    {
        let mut nodes = Vec::with_capacity(self.nodes.len());
        for (index, node) in self.nodes.into_iter().enumerate() {
            let GraphNode {
                name,
                output_id,
                input_ids,
                payload,
            } = node;
            let meta = GraphNode {
                name,
                output_id,
                input_ids,
                payload: (),
            };
            let payload = map(index, &meta, payload)?;
            nodes.push(GraphNode {
                name: meta.name,
                output_id: meta.output_id,
                input_ids: meta.input_ids,
                payload,
            });
        }
        Ok(RenderGraph {
            nodes,
            edges: self.edges,
            order: self.order,
        })
    }

    pub fn into_payloads(self) -> impl Iterator<Item = N> {
        self.nodes.into_iter().map(|node| node.payload)
    }

    pub fn payloads_mut(&mut self) -> impl Iterator<Item = &mut N> {
        self.nodes.iter_mut().map(|node| &mut node.payload)
    }
}

/// Kahn's algorithm; the smallest ready index goes first. On a cycle, returns
/// the nodes that never became ready.
fn topological_order(
    count: usize,
    edges: &BTreeSet<(usize, usize)>,
) -> Result<Vec<usize>, Vec<usize>> {
    let mut in_degrees = vec![0usize; count];
    let mut successors = vec![Vec::new(); count];
    for &(producer, consumer) in edges {
        in_degrees[consumer] += 1;
        successors[producer].push(consumer);
    }

    let mut ready: BinaryHeap<Reverse<usize>> = in_degrees
        .iter()
        .enumerate()
        .filter(|(_, degree)| **degree == 0)
        .map(|(index, _)| Reverse(index))
        .collect();
    let mut order = Vec::with_capacity(count);
    while let Some(Reverse(node)) = ready.pop() {
        order.push(node);
        for &next in &successors[node] {
            in_degrees[next] -= 1;
            if in_degrees[next] == 0 {
                ready.push(Reverse(next));
            }
        }
    }

    if order.len() == count {
        Ok(order)
    } else {
        Err((0..count).filter(|&index| in_degrees[index] > 0).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(name: &str, output: i64, inputs: &[i64]) -> GraphNode<&'static str> {
        GraphNode {
            name: name.to_string(),
            output_id: PassId(output),
            input_ids: inputs.iter().copied().map(PassId).collect(),
            payload: "",
        }
    }

    fn execution_names<N>(graph: &RenderGraph<N>) -> Vec<String> {
        let mut names = Vec::new();
        graph
            .execute(|_, node| {
                names.push(node.name.clone());
                Ok::<_, ()>(())
            })
            .unwrap();
        names
    }

    #[test]
    fn producer_runs_before_consumer() {
        let graph =
            RenderGraph::from_nodes(vec![node("B", 1, &[0]), node("A", 0, &[])]).unwrap();
        assert_eq!(graph.edges().collect::<Vec<_>>(), vec![(1, 0)]);
        assert_eq!(execution_names(&graph), vec!["A", "B"]);
    }

    #[test]
    fn self_input_is_feedback_not_an_edge() {
        let graph = RenderGraph::from_nodes(vec![node("A", 0, &[0])]).unwrap();
        assert_eq!(graph.edges().count(), 0);
        assert_eq!(graph.order(), &[0]);
    }

    #[test]
    fn duplicate_inputs_produce_one_edge() {
        let graph =
            RenderGraph::from_nodes(vec![node("A", 0, &[]), node("B", 1, &[0, 0, 0])]).unwrap();
        assert_eq!(graph.edges().count(), 1);
        assert!(graph.has_consumers(0));
        assert!(!graph.has_consumers(1));
    }

    #[test]
    fn unknown_inputs_are_ignored() {
        let graph = RenderGraph::from_nodes(vec![node("A", 0, &[42])]).unwrap();
        assert_eq!(graph.edges().count(), 0);
    }

    #[test]
    fn ties_follow_declaration_order() {
        let graph = RenderGraph::from_nodes(vec![
            node("Image", 9, &[2, 3]),
            node("C", 3, &[]),
            node("A", 1, &[]),
            node("B", 2, &[1]),
        ])
        .unwrap();
        assert_eq!(execution_names(&graph), vec!["C", "A", "B", "Image"]);
    }

    #[test]
    fn cycle_is_reported_with_its_outputs() {
        let err = RenderGraph::from_nodes(vec![
            node("A", 0, &[1]),
            node("B", 1, &[0]),
            node("C", 2, &[]),
        ])
        .unwrap_err();
        assert_eq!(err, BuildError::GraphCycleDetected { outputs: vec![0, 1] });
    }

    #[test]
    fn duplicate_output_ids_are_rejected() {
        let err =
            RenderGraph::from_nodes(vec![node("A", 0, &[]), node("B", 0, &[])]).unwrap_err();
        assert!(matches!(err, BuildError::InvalidArgument(_)));
    }

    #[test]
    fn identical_nodes_build_identical_graphs() {
        let build = || {
            RenderGraph::from_nodes(vec![
                node("A", 0, &[0]),
                node("B", 1, &[0, 1]),
                node("Image", 2, &[0, 1]),
            ])
            .unwrap()
        };
        let (first, second) = (build(), build());
        assert_eq!(first.output_ids(), second.output_ids());
        assert_eq!(first.edge_ids(), second.edge_ids());
        assert_eq!(first.order(), second.order());
    }

    #[test]
    fn execute_stops_at_first_error() {
        let graph =
            RenderGraph::from_nodes(vec![node("A", 0, &[]), node("B", 1, &[0])]).unwrap();
        let mut visited = 0;
        let result = graph.execute(|index, _| {
            visited += 1;
            if index == 0 {
                Err("boom")
            } else {
                Ok(())
            }
        });
        assert_eq!(result, Err("boom"));
        assert_eq!(visited, 1);
    }

    #[test]
    fn try_map_keeps_topology() {
        let graph =
            RenderGraph::from_nodes(vec![node("B", 1, &[0]), node("A", 0, &[])]).unwrap();
        let mapped = graph
            .try_map(|index, meta, _| Ok::<_, ()>(format!("{index}:{}", meta.name)))
            .unwrap();
        assert_eq!(mapped.order(), &[1, 0]);
        assert_eq!(mapped.nodes()[0].payload, "0:B");
        assert_eq!(mapped.index_of(PassId(0)), Some(1));
    }
}
