//! The remote run wire protocol.
//!
//! Every message on the wire is a JSON array `[type, data]`, with an
//! optional third element on `input` and `secret`: the continuation token a
//! paused run hands out. [`RemoteMessage`] preserves that framing through
//! serde while giving the rest of the crate a typed view.

use chrono::{DateTime, TimeZone, Utc};
use serde::de::Deserializer;
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::chunks::TransportError;
use crate::graph::{InputValues, NodeDescriptor, values_from_wire, values_to_wire};
use crate::run::{
    ErrorEvent, GraphLifecycle, InputRequest, NodeEndEvent, NodeStartEvent, OutputEvent, RunEvent,
    SecretRequest, SkipEvent,
};

/// One `[type, data, next?]` message.
#[derive(Clone, Debug, PartialEq)]
pub enum RemoteMessage {
    GraphStart { data: Value },
    GraphEnd { data: Value },
    NodeStart { data: Value },
    NodeEnd { data: Value },
    Skip { data: Value },
    Output { data: Value },
    Error { data: Value },
    Input { data: Value, next: Option<String> },
    Secret { data: Value, next: Option<String> },
    End { data: Value },
}

impl RemoteMessage {
    pub fn tag(&self) -> &'static str {
        match self {
            RemoteMessage::GraphStart { .. } => "graphstart",
            RemoteMessage::GraphEnd { .. } => "graphend",
            RemoteMessage::NodeStart { .. } => "nodestart",
            RemoteMessage::NodeEnd { .. } => "nodeend",
            RemoteMessage::Skip { .. } => "skip",
            RemoteMessage::Output { .. } => "output",
            RemoteMessage::Error { .. } => "error",
            RemoteMessage::Input { .. } => "input",
            RemoteMessage::Secret { .. } => "secret",
            RemoteMessage::End { .. } => "end",
        }
    }

    /// The continuation token of a paused `input`/`secret`, if present.
    pub fn next(&self) -> Option<&str> {
        match self {
            RemoteMessage::Input { next, .. } | RemoteMessage::Secret { next, .. } => {
                next.as_deref()
            }
            _ => None,
        }
    }

    pub fn to_wire(&self) -> Value {
        let data = match self {
            RemoteMessage::GraphStart { data }
            | RemoteMessage::GraphEnd { data }
            | RemoteMessage::NodeStart { data }
            | RemoteMessage::NodeEnd { data }
            | RemoteMessage::Skip { data }
            | RemoteMessage::Output { data }
            | RemoteMessage::Error { data }
            | RemoteMessage::End { data } => data,
            RemoteMessage::Input { data, next } | RemoteMessage::Secret { data, next } => {
                return match next {
                    Some(next) => json!([self.tag(), data, next]),
                    None => json!([self.tag(), data]),
                };
            }
        };
        json!([self.tag(), data])
    }

    pub fn from_wire(value: Value) -> Result<Self, TransportError> {
        let Value::Array(mut parts) = value else {
            return Err(TransportError::malformed("message is not an array"));
        };
        if parts.len() < 2 || parts.len() > 3 {
            return Err(TransportError::malformed(format!(
                "message has {} elements, expected 2 or 3",
                parts.len()
            )));
        }
        let next = if parts.len() == 3 {
            match parts.pop() {
                Some(Value::String(token)) => Some(token),
                _ => return Err(TransportError::malformed("continuation token is not a string")),
            }
        } else {
            None
        };
        let data = parts.pop().unwrap_or(Value::Null);
        let Some(Value::String(tag)) = parts.pop() else {
            return Err(TransportError::malformed("message tag is not a string"));
        };
        if next.is_some() && !matches!(tag.as_str(), "input" | "secret") {
            return Err(TransportError::malformed(
                "continuation token on a non-pausing message",
            ));
        }
        let message = match tag.as_str() {
            "graphstart" => RemoteMessage::GraphStart { data },
            "graphend" => RemoteMessage::GraphEnd { data },
            "nodestart" => RemoteMessage::NodeStart { data },
            "nodeend" => RemoteMessage::NodeEnd { data },
            "skip" => RemoteMessage::Skip { data },
            "output" => RemoteMessage::Output { data },
            "error" => RemoteMessage::Error { data },
            "input" => RemoteMessage::Input { data, next },
            "secret" => RemoteMessage::Secret { data, next },
            "end" => RemoteMessage::End { data },
            other => {
                return Err(TransportError::malformed(format!(
                    "unknown message type \"{other}\""
                )));
            }
        };
        Ok(message)
    }

    /// Lower a local run event into its wire message. Responders do not
    /// cross the wire; pauses are represented by the continuation token the
    /// server mints separately.
    pub fn from_run_event(event: &RunEvent) -> Self {
        match event {
            RunEvent::GraphStart(e) => RemoteMessage::GraphStart {
                data: lifecycle_data(e),
            },
            RunEvent::GraphEnd(e) => RemoteMessage::GraphEnd {
                data: lifecycle_data(e),
            },
            RunEvent::NodeStart(e) => RemoteMessage::NodeStart {
                data: json!({
                    "node": e.descriptor,
                    "inputs": values_to_wire(&e.inputs),
                    "path": e.path,
                    "timestamp": millis(e.timestamp),
                }),
            },
            RunEvent::NodeEnd(e) => RemoteMessage::NodeEnd {
                data: json!({
                    "node": e.descriptor,
                    "inputs": values_to_wire(&e.inputs),
                    "outputs": values_to_wire(&e.outputs),
                    "path": e.path,
                    "timestamp": millis(e.timestamp),
                }),
            },
            RunEvent::Skip(e) => RemoteMessage::Skip {
                data: json!({
                    "node": e.descriptor,
                    "inputs": values_to_wire(&e.inputs),
                    "missing": e.missing,
                    "path": e.path,
                    "timestamp": millis(e.timestamp),
                }),
            },
            RunEvent::Input(e) => RemoteMessage::Input {
                data: json!({
                    "node": e.descriptor,
                    "inputArguments": values_to_wire(&e.arguments),
                    "path": e.path,
                    "timestamp": millis(e.timestamp),
                }),
                next: None,
            },
            RunEvent::Output(e) => RemoteMessage::Output {
                data: json!({
                    "node": e.descriptor,
                    "outputs": values_to_wire(&e.outputs),
                    "path": e.path,
                    "timestamp": millis(e.timestamp),
                }),
            },
            RunEvent::Secret(e) => RemoteMessage::Secret {
                data: json!({
                    "keys": e.keys,
                    "path": e.path,
                    "timestamp": millis(e.timestamp),
                }),
                next: None,
            },
            RunEvent::Error(e) => RemoteMessage::Error {
                data: json!({
                    "error": e.error,
                    "path": e.path,
                    "timestamp": millis(e.timestamp),
                }),
            },
        }
    }

    /// Raise a wire message into a run event. `end` has no event
    /// counterpart; remote `input`/`secret` events carry no responder (the
    /// continuation token plays that role).
    pub fn into_run_event(self) -> Result<Option<RunEvent>, TransportError> {
        let event = match self {
            RemoteMessage::End { .. } => return Ok(None),
            RemoteMessage::GraphStart { data } => RunEvent::GraphStart(lifecycle_event(data)?),
            RemoteMessage::GraphEnd { data } => RunEvent::GraphEnd(lifecycle_event(data)?),
            RemoteMessage::NodeStart { data } => {
                let fields = node_fields(data)?;
                RunEvent::NodeStart(NodeStartEvent {
                    descriptor: fields.node,
                    inputs: values_from_wire(fields.inputs),
                    path: fields.path,
                    timestamp: fields.timestamp,
                })
            }
            RemoteMessage::NodeEnd { data } => {
                let fields = node_fields(data)?;
                RunEvent::NodeEnd(NodeEndEvent {
                    descriptor: fields.node,
                    inputs: values_from_wire(fields.inputs),
                    outputs: values_from_wire(fields.outputs),
                    path: fields.path,
                    timestamp: fields.timestamp,
                })
            }
            RemoteMessage::Skip { data } => {
                let fields = node_fields(data)?;
                RunEvent::Skip(SkipEvent {
                    descriptor: fields.node,
                    inputs: values_from_wire(fields.inputs),
                    missing: fields.missing,
                    path: fields.path,
                    timestamp: fields.timestamp,
                })
            }
            RemoteMessage::Input { data, .. } => {
                let fields = node_fields(data)?;
                RunEvent::Input(InputRequest {
                    descriptor: fields.node,
                    arguments: values_from_wire(fields.input_arguments),
                    path: fields.path,
                    timestamp: fields.timestamp,
                    responder: None,
                })
            }
            RemoteMessage::Output { data } => {
                let fields = node_fields(data)?;
                RunEvent::Output(OutputEvent {
                    descriptor: fields.node,
                    outputs: values_from_wire(fields.outputs),
                    path: fields.path,
                    timestamp: fields.timestamp,
                })
            }
            RemoteMessage::Secret { data, .. } => {
                let fields = node_fields(data)?;
                RunEvent::Secret(SecretRequest {
                    keys: fields.keys,
                    path: fields.path,
                    timestamp: fields.timestamp,
                    responder: None,
                })
            }
            RemoteMessage::Error { data } => {
                let timestamp = data
                    .get("timestamp")
                    .and_then(Value::as_i64)
                    .map_or_else(Utc::now, from_millis);
                let path = data
                    .get("path")
                    .cloned()
                    .map(|p| serde_json::from_value(p).unwrap_or_default())
                    .unwrap_or_default();
                let error = data.get("error").cloned().unwrap_or(data);
                RunEvent::Error(ErrorEvent {
                    error,
                    path,
                    timestamp,
                })
            }
        };
        Ok(Some(event))
    }
}

impl Serialize for RemoteMessage {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_wire().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for RemoteMessage {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        RemoteMessage::from_wire(value).map_err(serde::de::Error::custom)
    }
}

fn lifecycle_data(event: &GraphLifecycle) -> Value {
    json!({ "path": event.path, "timestamp": millis(event.timestamp) })
}

fn lifecycle_event(data: Value) -> Result<GraphLifecycle, TransportError> {
    let path = data
        .get("path")
        .cloned()
        .map(serde_json::from_value)
        .transpose()
        .map_err(|e| TransportError::malformed(format!("bad path: {e}")))?
        .unwrap_or_default();
    let timestamp = data
        .get("timestamp")
        .and_then(Value::as_i64)
        .map_or_else(Utc::now, from_millis);
    Ok(GraphLifecycle { path, timestamp })
}

/// Field soup shared by the node-scoped message kinds; absent fields
/// default so each kind picks what it needs.
struct NodeFields {
    node: NodeDescriptor,
    inputs: Value,
    outputs: Value,
    input_arguments: Value,
    missing: Vec<String>,
    keys: Vec<String>,
    path: Vec<usize>,
    timestamp: DateTime<Utc>,
}

fn node_fields(data: Value) -> Result<NodeFields, TransportError> {
    let object = data
        .as_object()
        .ok_or_else(|| TransportError::malformed("message data is not an object"))?;
    let node = match object.get("node") {
        Some(value) => serde_json::from_value(value.clone())
            .map_err(|e| TransportError::malformed(format!("bad node descriptor: {e}")))?,
        None => NodeDescriptor::default(),
    };
    let list = |key: &str| -> Vec<String> {
        object
            .get(key)
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default()
    };
    let path = object
        .get("path")
        .cloned()
        .and_then(|v| serde_json::from_value(v).ok())
        .unwrap_or_default();
    let timestamp = object
        .get("timestamp")
        .and_then(Value::as_i64)
        .map_or_else(Utc::now, from_millis);
    Ok(NodeFields {
        node,
        inputs: object.get("inputs").cloned().unwrap_or(Value::Null),
        outputs: object.get("outputs").cloned().unwrap_or(Value::Null),
        input_arguments: object.get("inputArguments").cloned().unwrap_or(Value::Null),
        missing: list("missing"),
        keys: list("keys"),
        path,
        timestamp,
    })
}

fn millis(timestamp: DateTime<Utc>) -> i64 {
    timestamp.timestamp_millis()
}

fn from_millis(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .unwrap_or_else(Utc::now)
}

/// The body posted to a remote run endpoint: the input values flattened at
/// the top level, with `$`-prefixed bookkeeping keys alongside.
#[derive(Clone, Debug, Default)]
pub struct RunRequest {
    pub inputs: InputValues,
    pub key: Option<String>,
    pub next: Option<String>,
    pub diagnostics: bool,
}

impl RunRequest {
    pub fn to_body(&self) -> Value {
        let mut body = match values_to_wire(&self.inputs) {
            Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };
        if let Some(key) = &self.key {
            body.insert("$key".to_string(), json!(key));
        }
        if let Some(next) = &self.next {
            body.insert("$next".to_string(), json!(next));
        }
        if self.diagnostics {
            body.insert("$diagnostics".to_string(), json!(true));
        }
        Value::Object(body)
    }
}
