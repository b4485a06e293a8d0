//! Board structure: nodes, edges, and nested subgraphs.
//!
//! A board is described declaratively by a [`GraphDescriptor`]: typed nodes
//! wired by directed edges. The descriptor is immutable input to a run; the
//! traversal machinery in [`crate::traversal`] interprets it, and
//! [`condense`] rewrites cyclic descriptors into acyclic ones the scheduler
//! can consume.
//!
//! # Edge semantics
//!
//! - `out`/`in` name the ports a value leaves and arrives on; `"*"` means
//!   "all outputs" (the whole output object, merged key by key).
//! - An edge with no `in` port is a control edge: it creates a firing
//!   opportunity but carries no data and never gates readiness.
//! - `optional` edges do not gate firing.
//! - `constant` edges retain their value across repeated firings of the
//!   downstream node instead of being consumed once.

mod condense;
mod values;

use std::collections::BTreeMap;

use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub use condense::condense;
pub use values::{
    Capability, ERROR_KEY, InputValues, NodeValue, OutputValues, ValueStream, error_outputs,
    is_error_output, values_from_wire, values_to_wire,
};

/// Node type reserved for input pseudo-nodes: never dispatched to a kit,
/// resolved externally by the driving runner.
pub const INPUT_TYPE: &str = "input";

/// Node type reserved for output pseudo-nodes: terminates a traversal branch
/// and surfaces its received values.
pub const OUTPUT_TYPE: &str = "output";

/// Port wildcard: all outputs / all inputs.
pub const WILDCARD: &str = "*";

/// A single node in a board.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeDescriptor {
    /// Unique id of the node within its graph.
    pub id: String,
    /// Handler lookup key. Types starting with `#` reference a subgraph in
    /// [`GraphDescriptor::graphs`].
    #[serde(rename = "type")]
    pub node_type: String,
    /// Static key/value map merged under delivered inputs.
    #[serde(default, skip_serializing_if = "FxHashMap::is_empty")]
    pub configuration: FxHashMap<String, NodeValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl NodeDescriptor {
    pub fn new(id: impl Into<String>, node_type: impl Into<String>) -> Self {
        NodeDescriptor {
            id: id.into(),
            node_type: node_type.into(),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_configuration(mut self, configuration: FxHashMap<String, NodeValue>) -> Self {
        self.configuration = configuration;
        self
    }
}

/// A directed edge between two nodes.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub from: String,
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub out: Option<String>,
    #[serde(rename = "in", default, skip_serializing_if = "Option::is_none")]
    pub in_: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub optional: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub constant: bool,
}

impl Edge {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Edge {
            from: from.into(),
            to: to.into(),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn ports(mut self, out: impl Into<String>, in_: impl Into<String>) -> Self {
        self.out = Some(out.into());
        self.in_ = Some(in_.into());
        self
    }

    #[must_use]
    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    #[must_use]
    pub fn constant(mut self) -> Self {
        self.constant = true;
        self
    }

    /// True when the edge forwards the entire output object.
    pub fn is_wildcard(&self) -> bool {
        self.out.as_deref() == Some(WILDCARD)
    }

    /// True when the edge carries no data (control only).
    pub fn is_control(&self) -> bool {
        self.in_.is_none() && !self.is_wildcard()
    }
}

/// A reference to a kit (a named collection of node handlers) used by a board.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct KitReference {
    pub url: String,
}

/// A complete board description.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphDescriptor {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default)]
    pub nodes: Vec<NodeDescriptor>,
    #[serde(default)]
    pub edges: Vec<Edge>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub kits: Vec<KitReference>,
    /// Named subgraphs keyed by id, e.g. synthesized SCC ids or lambda ids.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub graphs: BTreeMap<String, GraphDescriptor>,
    /// Pre-bound inputs, merged into the values supplied to `input` nodes.
    #[serde(default, skip_serializing_if = "FxHashMap::is_empty")]
    pub args: FxHashMap<String, NodeValue>,
}

/// Structural problems detected before a run starts.
#[derive(Debug, Error, Diagnostic)]
pub enum GraphError {
    #[error("board has no nodes")]
    #[diagnostic(
        code(flowboard::graph::empty),
        help("A runnable board needs at least one node.")
    )]
    EmptyGraph,

    #[error("edge references unknown node \"{node}\" ({endpoint} endpoint)")]
    #[diagnostic(
        code(flowboard::graph::dangling_edge),
        help("Every edge endpoint must name a node in `nodes`.")
    )]
    DanglingEdge { node: String, endpoint: &'static str },

    #[error("start node \"{node}\" not found in board")]
    #[diagnostic(code(flowboard::graph::unknown_start))]
    UnknownStart { node: String },

    #[error("no entry node found in board")]
    #[diagnostic(
        code(flowboard::graph::no_entry),
        help("At least one node must have no incoming edges, or a start node must be named.")
    )]
    NoEntryNode,

    #[error("subgraph \"{id}\" not found in board")]
    #[diagnostic(
        code(flowboard::graph::unknown_subgraph),
        help("`#`-typed nodes must reference an entry in `graphs`.")
    )]
    UnknownSubgraph { id: String },
}

impl GraphDescriptor {
    /// Check structural invariants: a non-empty node set and edge endpoints
    /// that resolve to declared nodes.
    pub fn validate(&self) -> Result<(), GraphError> {
        if self.nodes.is_empty() {
            return Err(GraphError::EmptyGraph);
        }
        for edge in &self.edges {
            if self.node(&edge.from).is_none() {
                return Err(GraphError::DanglingEdge {
                    node: edge.from.clone(),
                    endpoint: "from",
                });
            }
            if self.node(&edge.to).is_none() {
                return Err(GraphError::DanglingEdge {
                    node: edge.to.clone(),
                    endpoint: "to",
                });
            }
        }
        Ok(())
    }

    pub fn node(&self, id: &str) -> Option<&NodeDescriptor> {
        self.nodes.iter().find(|node| node.id == id)
    }

    /// Incoming edges keyed by target node id, in stored order.
    pub fn heads(&self) -> FxHashMap<&str, Vec<&Edge>> {
        let mut heads: FxHashMap<&str, Vec<&Edge>> = FxHashMap::default();
        for edge in &self.edges {
            heads.entry(edge.to.as_str()).or_default().push(edge);
        }
        heads
    }

    /// Outgoing edges keyed by source node id, in stored order.
    pub fn tails(&self) -> FxHashMap<&str, Vec<&Edge>> {
        let mut tails: FxHashMap<&str, Vec<&Edge>> = FxHashMap::default();
        for edge in &self.edges {
            tails.entry(edge.from.as_str()).or_default().push(edge);
        }
        tails
    }

    /// Resolve a `#id` node type to its subgraph id, if it is one.
    pub fn subgraph_ref(node_type: &str) -> Option<&str> {
        node_type.strip_prefix('#')
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn two_node_board() -> GraphDescriptor {
        GraphDescriptor {
            nodes: vec![
                NodeDescriptor::new("in", INPUT_TYPE),
                NodeDescriptor::new("out", OUTPUT_TYPE),
            ],
            edges: vec![Edge::new("in", "out").ports("text", "text")],
            ..Default::default()
        }
    }

    #[test]
    fn validate_accepts_wired_board() {
        assert!(two_node_board().validate().is_ok());
    }

    #[test]
    fn validate_rejects_empty_board() {
        let graph = GraphDescriptor::default();
        assert!(matches!(graph.validate(), Err(GraphError::EmptyGraph)));
    }

    #[test]
    fn validate_rejects_dangling_edge() {
        let mut graph = two_node_board();
        graph.edges.push(Edge::new("in", "missing"));
        assert!(matches!(
            graph.validate(),
            Err(GraphError::DanglingEdge { endpoint: "to", .. })
        ));
    }

    #[test]
    fn descriptor_serde_round_trip() {
        let graph = two_node_board();
        let wire = serde_json::to_value(&graph).unwrap();
        assert_eq!(wire["edges"][0]["in"], json!("text"));
        let restored: GraphDescriptor = serde_json::from_value(wire).unwrap();
        assert_eq!(restored, graph);
    }

    #[test]
    fn control_edges_carry_no_data() {
        let edge = Edge::new("a", "b");
        assert!(edge.is_control());
        let wildcard = Edge {
            out: Some(WILDCARD.to_string()),
            ..Edge::new("a", "b")
        };
        assert!(wildcard.is_wildcard());
        assert!(!wildcard.is_control());
    }
}
