//! The traversal scheduler.
//!
//! [`TraversalMachine`] walks one graph invocation as a queue of firing
//! opportunities. Pulling the next [`TraversalResult`] names the node whose
//! turn it is; the caller dispatches it (or not, if the result is a skip) and
//! hands the outputs back through [`TraversalMachine::complete`], which wires
//! them downstream and queues the follow-on opportunities.

use std::collections::VecDeque;
use std::sync::Arc;

use rustc_hash::FxHashSet;

use super::state::TraversalState;
use crate::graph::{Edge, GraphDescriptor, GraphError, InputValues, NodeDescriptor, OutputValues};

/// Pseudo source id for entry opportunities.
const ENTRY: &str = "$entry";

/// One scheduled firing (or skip) of a node.
#[derive(Debug)]
pub struct TraversalResult {
    pub descriptor: NodeDescriptor,
    /// Configuration merged under delivered values; delivered wins.
    pub inputs: InputValues,
    /// Required ports with no value. Non-empty exactly when `skip` is set.
    pub missing_inputs: Vec<String>,
    pub skip: bool,
}

#[derive(Debug)]
pub struct TraversalMachine {
    graph: Arc<GraphDescriptor>,
    state: TraversalState,
    opportunities: VecDeque<Edge>,
}

impl TraversalMachine {
    /// Set up a traversal. With a `start` node the walk begins there alone;
    /// otherwise every node without incoming edges is an entry.
    pub fn new(graph: Arc<GraphDescriptor>, start: Option<&str>) -> Result<Self, GraphError> {
        graph.validate()?;
        let entries: Vec<String> = match start {
            Some(node) => {
                if graph.node(node).is_none() {
                    return Err(GraphError::UnknownStart {
                        node: node.to_string(),
                    });
                }
                vec![node.to_string()]
            }
            None => {
                let targets: FxHashSet<&str> =
                    graph.edges.iter().map(|edge| edge.to.as_str()).collect();
                graph
                    .nodes
                    .iter()
                    .filter(|node| !targets.contains(node.id.as_str()))
                    .map(|node| node.id.clone())
                    .collect()
            }
        };
        if entries.is_empty() {
            return Err(GraphError::NoEntryNode);
        }
        let opportunities = entries
            .into_iter()
            .map(|entry| Edge::new(ENTRY, entry))
            .collect();
        Ok(TraversalMachine {
            graph,
            state: TraversalState::new(),
            opportunities,
        })
    }

    /// Pull the next scheduled node. `None` once the opportunity queue is
    /// drained.
    ///
    /// A skip result does not consume the node's queued values; a later
    /// delivery can still complete the missing set and fire it.
    pub fn next_result(&mut self) -> Option<TraversalResult> {
        let edge = self.opportunities.pop_front()?;
        let descriptor = self
            .graph
            .node(&edge.to)
            .cloned()
            .unwrap_or_else(|| NodeDescriptor::new(edge.to.clone(), edge.to.clone()));

        let available = self.state.available_inputs(&descriptor.id);
        let missing = self.missing_inputs(&descriptor, &available);
        if !missing.is_empty() {
            return Some(TraversalResult {
                descriptor,
                inputs: available,
                missing_inputs: missing,
                skip: true,
            });
        }

        let mut inputs = descriptor.configuration.clone();
        inputs.extend(available);
        self.state.consume_inputs(&descriptor.id);

        Some(TraversalResult {
            descriptor,
            inputs,
            missing_inputs: Vec::new(),
            skip: false,
        })
    }

    /// Record the outputs of a fired node: wire them downstream and queue an
    /// opportunity for every outgoing edge. Skip results must not be
    /// completed.
    pub fn complete(&mut self, result: &TraversalResult, outputs: &OutputValues) {
        let tails: Vec<&Edge> = self
            .graph
            .edges
            .iter()
            .filter(|edge| edge.from == result.descriptor.id)
            .collect();
        self.state.wire_outputs(&tails, outputs);
        self.opportunities.extend(tails.into_iter().cloned());
    }

    /// Required ports of `descriptor` that neither delivered values nor its
    /// configuration satisfy, in incoming-edge order.
    fn missing_inputs(&self, descriptor: &NodeDescriptor, available: &InputValues) -> Vec<String> {
        let mut seen = FxHashSet::default();
        let mut missing = Vec::new();
        for edge in self.graph.edges.iter().filter(|e| e.to == descriptor.id) {
            let Some(port) = edge.in_.as_deref() else {
                continue;
            };
            if port == crate::graph::WILDCARD || edge.optional || !seen.insert(port) {
                continue;
            }
            if !available.contains_key(port) && !descriptor.configuration.contains_key(port) {
                missing.push(port.to_string());
            }
        }
        missing
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn board() -> GraphDescriptor {
        GraphDescriptor {
            nodes: vec![
                NodeDescriptor::new("one", "producer"),
                NodeDescriptor::new("two", "consumer"),
            ],
            edges: vec![Edge::new("one", "two").ports("value", "value")],
            ..Default::default()
        }
    }

    fn outputs(pairs: &[(&str, i64)]) -> OutputValues {
        pairs
            .iter()
            .map(|(key, value)| ((*key).to_string(), (*value).into()))
            .collect()
    }

    #[test]
    fn fires_entry_then_downstream() {
        let mut machine = TraversalMachine::new(Arc::new(board()), None).unwrap();

        let first = machine.next_result().unwrap();
        assert_eq!(first.descriptor.id, "one");
        assert!(!first.skip);
        machine.complete(&first, &outputs(&[("value", 42)]));

        let second = machine.next_result().unwrap();
        assert_eq!(second.descriptor.id, "two");
        assert_eq!(second.inputs["value"].as_json(), Some(&json!(42)));
        machine.complete(&second, &OutputValues::default());

        assert!(machine.next_result().is_none());
    }

    #[test]
    fn missing_required_input_skips_without_consuming() {
        let graph = GraphDescriptor {
            nodes: vec![
                NodeDescriptor::new("a", "t"),
                NodeDescriptor::new("b", "t"),
                NodeDescriptor::new("join", "t"),
            ],
            edges: vec![
                Edge::new("a", "join").ports("left", "left"),
                Edge::new("b", "join").ports("right", "right"),
            ],
            ..Default::default()
        };
        let mut machine = TraversalMachine::new(Arc::new(graph), None).unwrap();

        let a = machine.next_result().unwrap();
        machine.complete(&a, &outputs(&[("left", 1)]));
        let b = machine.next_result().unwrap();

        // The opportunity from a→join arrives before b has produced "right".
        let early = machine.next_result().unwrap();
        assert_eq!(early.descriptor.id, "join");
        assert!(early.skip);
        assert_eq!(early.missing_inputs, vec!["right"]);

        machine.complete(&b, &outputs(&[("right", 2)]));
        let join = machine.next_result().unwrap();
        assert_eq!(join.descriptor.id, "join");
        assert!(!join.skip);
        assert_eq!(join.inputs["left"].as_json(), Some(&json!(1)));
        assert_eq!(join.inputs["right"].as_json(), Some(&json!(2)));
    }

    #[test]
    fn optional_edges_do_not_gate() {
        let graph = GraphDescriptor {
            nodes: vec![
                NodeDescriptor::new("a", "t"),
                NodeDescriptor::new("sink", "t"),
            ],
            edges: vec![
                Edge::new("a", "sink").ports("go", "go"),
                Edge {
                    optional: true,
                    ..Edge::new("a", "sink").ports("extra", "extra")
                },
            ],
            ..Default::default()
        };
        let mut machine = TraversalMachine::new(Arc::new(graph), None).unwrap();

        let a = machine.next_result().unwrap();
        machine.complete(&a, &outputs(&[("go", 1)]));
        let sink = machine.next_result().unwrap();
        assert_eq!(sink.descriptor.id, "sink");
        assert!(!sink.skip);
        assert!(!sink.inputs.contains_key("extra"));
    }

    #[test]
    fn configuration_satisfies_required_port_but_delivery_wins() {
        let mut config = rustc_hash::FxHashMap::default();
        config.insert("value".to_string(), crate::graph::NodeValue::from(0));
        let graph = GraphDescriptor {
            nodes: vec![
                NodeDescriptor::new("one", "t"),
                NodeDescriptor::new("two", "t").with_configuration(config),
            ],
            edges: vec![Edge::new("one", "two").ports("value", "value")],
            ..Default::default()
        };
        let mut machine = TraversalMachine::new(Arc::new(graph), None).unwrap();

        let one = machine.next_result().unwrap();
        machine.complete(&one, &outputs(&[("value", 5)]));
        let two = machine.next_result().unwrap();
        assert_eq!(two.inputs["value"].as_json(), Some(&json!(5)));
    }

    #[test]
    fn explicit_start_overrides_entry_detection() {
        let mut machine =
            TraversalMachine::new(Arc::new(board()), Some("two")).unwrap();
        let first = machine.next_result().unwrap();
        assert_eq!(first.descriptor.id, "two");
    }

    #[test]
    fn unknown_start_is_rejected() {
        assert!(matches!(
            TraversalMachine::new(Arc::new(board()), Some("nope")),
            Err(GraphError::UnknownStart { .. })
        ));
    }

    #[test]
    fn all_cyclic_graph_has_no_entry() {
        let graph = GraphDescriptor {
            nodes: vec![NodeDescriptor::new("a", "t"), NodeDescriptor::new("b", "t")],
            edges: vec![
                Edge::new("a", "b").ports("x", "x"),
                Edge::new("b", "a").ports("y", "y"),
            ],
            ..Default::default()
        };
        assert!(matches!(
            TraversalMachine::new(Arc::new(graph), None),
            Err(GraphError::NoEntryNode)
        ));
    }

    #[test]
    fn control_edge_creates_opportunity_without_data() {
        let graph = GraphDescriptor {
            nodes: vec![
                NodeDescriptor::new("first", "t"),
                NodeDescriptor::new("second", "t"),
            ],
            edges: vec![Edge::new("first", "second")],
            ..Default::default()
        };
        let mut machine = TraversalMachine::new(Arc::new(graph), None).unwrap();
        let first = machine.next_result().unwrap();
        machine.complete(&first, &outputs(&[("anything", 1)]));
        let second = machine.next_result().unwrap();
        assert_eq!(second.descriptor.id, "second");
        assert!(!second.skip);
        assert!(second.inputs.is_empty());
    }
}
