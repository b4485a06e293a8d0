//! Values that flow along board edges.
//!
//! Most values are plain JSON, but a value may also be a [`Capability`]: an
//! opaque handle (a nested board, or a live stream of chunks) that travels by
//! reference and is never flattened into plain JSON. Capabilities only cross
//! process boundaries through transports that know how to carry them.

use std::collections::VecDeque;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use serde::de::Deserializer;
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use uuid::Uuid;

use super::GraphDescriptor;

/// Key that marks a failed output object.
pub const ERROR_KEY: &str = "$error";

/// Values delivered to a node's input ports, keyed by port name.
pub type InputValues = FxHashMap<String, NodeValue>;

/// Values produced by a node's output ports, keyed by port name.
pub type OutputValues = FxHashMap<String, NodeValue>;

/// A single value traveling along an edge.
#[derive(Clone, Debug, PartialEq)]
pub enum NodeValue {
    /// Plain JSON data.
    Json(Value),
    /// An opaque capability handle.
    Capability(Capability),
}

/// An opaque typed handle embedded in a value.
#[derive(Clone, Debug)]
pub enum Capability {
    /// A nested board, e.g. the body of a lambda node.
    Board(Arc<GraphDescriptor>),
    /// A live stream of JSON chunks produced by a handler.
    Stream(ValueStream),
}

impl PartialEq for Capability {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Capability::Board(a), Capability::Board(b)) => a == b,
            (Capability::Stream(a), Capability::Stream(b)) => a.id() == b.id(),
            _ => false,
        }
    }
}

impl NodeValue {
    pub fn board(graph: GraphDescriptor) -> Self {
        NodeValue::Capability(Capability::Board(Arc::new(graph)))
    }

    pub fn stream(stream: ValueStream) -> Self {
        NodeValue::Capability(Capability::Stream(stream))
    }

    pub fn as_json(&self) -> Option<&Value> {
        match self {
            NodeValue::Json(value) => Some(value),
            NodeValue::Capability(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        self.as_json().and_then(Value::as_str)
    }

    pub fn as_board(&self) -> Option<&Arc<GraphDescriptor>> {
        match self {
            NodeValue::Capability(Capability::Board(board)) => Some(board),
            _ => None,
        }
    }

    pub fn as_stream(&self) -> Option<&ValueStream> {
        match self {
            NodeValue::Capability(Capability::Stream(stream)) => Some(stream),
            _ => None,
        }
    }

    /// Render the value into its wire (JSON) form. Board capabilities become
    /// `{"kind":"board","board":...}` envelopes; streams become a stub that
    /// transports replace with out-of-band chunk delivery.
    pub fn to_wire(&self) -> Value {
        match self {
            NodeValue::Json(value) => value.clone(),
            NodeValue::Capability(Capability::Board(board)) => {
                json!({ "kind": "board", "board": &**board })
            }
            NodeValue::Capability(Capability::Stream(stream)) => {
                json!({ "kind": "stream", "id": stream.id() })
            }
        }
    }

    /// Rebuild a value from its wire form, restoring board capabilities.
    pub fn from_wire(value: Value) -> Self {
        if let Some(object) = value.as_object()
            && object.get("kind").and_then(Value::as_str) == Some("board")
            && let Some(board) = object.get("board")
            && let Ok(graph) = serde_json::from_value::<GraphDescriptor>(board.clone())
        {
            return NodeValue::Capability(Capability::Board(Arc::new(graph)));
        }
        NodeValue::Json(value)
    }
}

impl From<Value> for NodeValue {
    fn from(value: Value) -> Self {
        NodeValue::from_wire(value)
    }
}

impl From<&str> for NodeValue {
    fn from(value: &str) -> Self {
        NodeValue::Json(Value::String(value.to_string()))
    }
}

impl From<String> for NodeValue {
    fn from(value: String) -> Self {
        NodeValue::Json(Value::String(value))
    }
}

impl From<i64> for NodeValue {
    fn from(value: i64) -> Self {
        NodeValue::Json(Value::from(value))
    }
}

impl From<bool> for NodeValue {
    fn from(value: bool) -> Self {
        NodeValue::Json(Value::Bool(value))
    }
}

impl Serialize for NodeValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_wire().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for NodeValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(NodeValue::from_wire(Value::deserialize(deserializer)?))
    }
}

/// Convert a port-name/value map into a JSON object.
pub fn values_to_wire(values: &FxHashMap<String, NodeValue>) -> Value {
    Value::Object(
        values
            .iter()
            .map(|(name, value)| (name.clone(), value.to_wire()))
            .collect(),
    )
}

/// Convert a JSON object into a port-name/value map. Non-object inputs
/// produce an empty map.
pub fn values_from_wire(value: Value) -> FxHashMap<String, NodeValue> {
    match value {
        Value::Object(object) => object
            .into_iter()
            .map(|(name, value)| (name, NodeValue::from_wire(value)))
            .collect(),
        _ => FxHashMap::default(),
    }
}

/// Build an output object carrying an `$error` marker.
pub fn error_outputs(message: impl Into<String>) -> OutputValues {
    let mut outputs = OutputValues::default();
    outputs.insert(
        ERROR_KEY.to_string(),
        NodeValue::Json(json!({ "error": message.into() })),
    );
    outputs
}

/// True when an output object carries the `$error` marker.
pub fn is_error_output(outputs: &OutputValues) -> bool {
    outputs.contains_key(ERROR_KEY)
}

/// A clonable handle over a live stream of JSON chunks.
///
/// Produced by [`ValueStream::channel`]; the sender half lives with whatever
/// is generating chunks, the receiver travels inside a [`Capability`].
#[derive(Clone, Debug)]
pub struct ValueStream {
    id: Uuid,
    rx: flume::Receiver<Value>,
}

impl ValueStream {
    /// Create a stream and the sender that feeds it.
    pub fn channel() -> (flume::Sender<Value>, ValueStream) {
        let (tx, rx) = flume::unbounded();
        (
            tx,
            ValueStream {
                id: Uuid::new_v4(),
                rx,
            },
        )
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Await the next chunk; `None` once the sender is dropped.
    pub async fn next(&self) -> Option<Value> {
        self.rx.recv_async().await.ok()
    }

    /// Drain every remaining chunk into a vector.
    pub async fn collect(&self) -> Vec<Value> {
        let mut chunks = VecDeque::new();
        while let Some(chunk) = self.next().await {
            chunks.push_back(chunk);
        }
        chunks.into()
    }
}
