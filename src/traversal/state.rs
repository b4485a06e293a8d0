//! Per-node, per-port value queues driving edge delivery.
//!
//! Each time a node fires, its outputs are wired along outgoing edges into
//! the downstream nodes' port queues. Regular deliveries queue up and are
//! consumed one firing at a time; deliveries over `constant` edges land in a
//! separate map that consumption never touches, so the latest constant value
//! keeps feeding every subsequent firing.

use std::collections::VecDeque;

use rustc_hash::FxHashMap;

use crate::graph::{Edge, InputValues, NodeValue, OutputValues};

type PortQueues = FxHashMap<String, VecDeque<NodeValue>>;

/// Queued and constant values for every node in one graph invocation.
#[derive(Debug, Default)]
pub struct TraversalState {
    queues: FxHashMap<String, PortQueues>,
    constants: FxHashMap<String, FxHashMap<String, NodeValue>>,
}

impl TraversalState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Distribute `outputs` along the fired node's outgoing `edges`.
    ///
    /// A wildcard edge delivers every output key under its own name. A named
    /// edge delivers the `out` port's value under the `in` port's name.
    /// Control edges deliver nothing.
    pub fn wire_outputs(&mut self, edges: &[&Edge], outputs: &OutputValues) {
        for edge in edges {
            if edge.is_wildcard() {
                for (key, value) in outputs {
                    self.deliver(edge, key, value.clone());
                }
            } else if let (Some(out), Some(in_)) = (&edge.out, &edge.in_) {
                if let Some(value) = outputs.get(out) {
                    self.deliver(edge, in_, value.clone());
                }
            }
        }
    }

    fn deliver(&mut self, edge: &Edge, port: &str, value: NodeValue) {
        if edge.constant {
            self.constants
                .entry(edge.to.clone())
                .or_default()
                .insert(port.to_string(), value);
        } else {
            self.queues
                .entry(edge.to.clone())
                .or_default()
                .entry(port.to_string())
                .or_default()
                .push_back(value);
        }
    }

    /// Snapshot the values a node would receive if it fired now: queue
    /// fronts layered over constants, with queued values winning.
    pub fn available_inputs(&self, node: &str) -> InputValues {
        let mut inputs = InputValues::default();
        if let Some(constants) = self.constants.get(node) {
            for (port, value) in constants {
                inputs.insert(port.clone(), value.clone());
            }
        }
        if let Some(queues) = self.queues.get(node) {
            for (port, queue) in queues {
                if let Some(value) = queue.front() {
                    inputs.insert(port.clone(), value.clone());
                }
            }
        }
        inputs
    }

    /// Pop the front of every queued port for `node`. Constants stay put.
    pub fn consume_inputs(&mut self, node: &str) {
        if let Some(queues) = self.queues.get_mut(node) {
            queues.retain(|_, queue| {
                queue.pop_front();
                !queue.is_empty()
            });
            if queues.is_empty() {
                self.queues.remove(node);
            }
        }
    }
}
