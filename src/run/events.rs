//! The run event protocol.
//!
//! A run is observed as a sequence of [`RunEvent`]s pulled from an
//! [`EventStream`]. Every event carries the invocation path of the graph or
//! node it concerns (outer run first, nested subgraph invocations appended)
//! and a wall-clock timestamp. `Input` and `Secret` events suspend the run:
//! they carry a responder, and the producing branch stays parked until the
//! consumer answers.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use miette::Diagnostic;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::oneshot;

use crate::graph::{InputValues, NodeDescriptor, OutputValues};

/// One observable step of a run.
#[derive(Debug)]
pub enum RunEvent {
    GraphStart(GraphLifecycle),
    GraphEnd(GraphLifecycle),
    NodeStart(NodeStartEvent),
    NodeEnd(NodeEndEvent),
    Skip(SkipEvent),
    Input(InputRequest),
    Output(OutputEvent),
    Secret(SecretRequest),
    Error(ErrorEvent),
}

impl RunEvent {
    /// Invocation path of the graph or node this event concerns.
    pub fn path(&self) -> &[usize] {
        match self {
            RunEvent::GraphStart(e) | RunEvent::GraphEnd(e) => &e.path,
            RunEvent::NodeStart(e) => &e.path,
            RunEvent::NodeEnd(e) => &e.path,
            RunEvent::Skip(e) => &e.path,
            RunEvent::Input(e) => &e.path,
            RunEvent::Output(e) => &e.path,
            RunEvent::Secret(e) => &e.path,
            RunEvent::Error(e) => &e.path,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            RunEvent::GraphStart(e) | RunEvent::GraphEnd(e) => e.timestamp,
            RunEvent::NodeStart(e) => e.timestamp,
            RunEvent::NodeEnd(e) => e.timestamp,
            RunEvent::Skip(e) => e.timestamp,
            RunEvent::Input(e) => e.timestamp,
            RunEvent::Output(e) => e.timestamp,
            RunEvent::Secret(e) => e.timestamp,
            RunEvent::Error(e) => e.timestamp,
        }
    }

    /// The wire tag used by the remote protocol for this event kind.
    pub fn tag(&self) -> &'static str {
        match self {
            RunEvent::GraphStart(_) => "graphstart",
            RunEvent::GraphEnd(_) => "graphend",
            RunEvent::NodeStart(_) => "nodestart",
            RunEvent::NodeEnd(_) => "nodeend",
            RunEvent::Skip(_) => "skip",
            RunEvent::Input(_) => "input",
            RunEvent::Output(_) => "output",
            RunEvent::Secret(_) => "secret",
            RunEvent::Error(_) => "error",
        }
    }
}

/// Start/end marker for a graph or subgraph invocation.
#[derive(Clone, Debug)]
pub struct GraphLifecycle {
    pub path: Vec<usize>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug)]
pub struct NodeStartEvent {
    pub descriptor: NodeDescriptor,
    pub inputs: InputValues,
    pub path: Vec<usize>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug)]
pub struct NodeEndEvent {
    pub descriptor: NodeDescriptor,
    pub inputs: InputValues,
    pub outputs: OutputValues,
    pub path: Vec<usize>,
    pub timestamp: DateTime<Utc>,
}

/// A node did not fire because required inputs were missing.
#[derive(Debug)]
pub struct SkipEvent {
    pub descriptor: NodeDescriptor,
    pub inputs: InputValues,
    pub missing: Vec<String>,
    pub path: Vec<usize>,
    pub timestamp: DateTime<Utc>,
}

/// The run needs input values. Locally produced requests carry a responder;
/// requests reconstructed from the wire do not (the continuation token takes
/// that role).
#[derive(Debug)]
pub struct InputRequest {
    pub descriptor: NodeDescriptor,
    pub arguments: InputValues,
    pub path: Vec<usize>,
    pub timestamp: DateTime<Utc>,
    pub responder: Option<InputResponder>,
}

#[derive(Debug)]
pub struct OutputEvent {
    pub descriptor: NodeDescriptor,
    pub outputs: OutputValues,
    pub path: Vec<usize>,
    pub timestamp: DateTime<Utc>,
}

/// A handler asked for secret values, e.g. API keys.
#[derive(Debug)]
pub struct SecretRequest {
    pub keys: Vec<String>,
    pub path: Vec<usize>,
    pub timestamp: DateTime<Utc>,
    pub responder: Option<InputResponder>,
}

#[derive(Clone, Debug)]
pub struct ErrorEvent {
    pub error: Value,
    pub path: Vec<usize>,
    pub timestamp: DateTime<Utc>,
}

/// One-shot reply channel for `Input` and `Secret` events.
#[derive(Debug)]
pub struct InputResponder(oneshot::Sender<InputValues>);

impl InputResponder {
    pub fn new() -> (Self, oneshot::Receiver<InputValues>) {
        let (tx, rx) = oneshot::channel();
        (InputResponder(tx), rx)
    }

    /// Deliver values and resume the suspended branch. Returns `Err` with
    /// the values if the run has already been dropped.
    pub fn respond(self, values: InputValues) -> Result<(), InputValues> {
        self.0.send(values)
    }
}

#[derive(Debug, Error, Diagnostic)]
pub enum EmitError {
    #[error("event stream consumer is gone")]
    #[diagnostic(
        code(flowboard::run::stream_closed),
        help("The EventStream was dropped while the run was still producing events.")
    )]
    StreamClosed,
}

/// Sending half of a run's event channel.
#[derive(Clone, Debug)]
pub struct EventEmitter {
    tx: flume::Sender<RunEvent>,
}

impl EventEmitter {
    pub fn emit(&self, event: RunEvent) -> Result<(), EmitError> {
        self.tx.send(event).map_err(|_| EmitError::StreamClosed)
    }
}

/// Cooperative cancellation flag shared between a run and its consumer.
#[derive(Clone, Debug, Default)]
pub struct AbortSignal(Arc<AtomicBool>);

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn aborted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Pull side of a run: events in emission order, ending when the producer
/// finishes or the run is aborted.
#[derive(Debug)]
pub struct EventStream {
    rx: flume::Receiver<RunEvent>,
    abort: AbortSignal,
}

impl EventStream {
    /// Create a stream together with its emitter and shared abort flag.
    pub fn channel() -> (EventEmitter, EventStream) {
        let (tx, rx) = flume::unbounded();
        (
            EventEmitter { tx },
            EventStream {
                rx,
                abort: AbortSignal::new(),
            },
        )
    }

    /// Await the next event; `None` once every emitter is dropped.
    pub async fn next(&mut self) -> Option<RunEvent> {
        self.rx.recv_async().await.ok()
    }

    /// Request cancellation. The producer checks the flag between nodes.
    pub fn abort(&self) {
        self.abort.abort();
    }

    pub fn abort_signal(&self) -> AbortSignal {
        self.abort.clone()
    }

    /// Collect every remaining event.
    pub async fn collect(mut self) -> Vec<RunEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.next().await {
            events.push(event);
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_arrive_in_emission_order() {
        let (emitter, mut stream) = EventStream::channel();
        emitter
            .emit(RunEvent::GraphStart(GraphLifecycle {
                path: vec![],
                timestamp: Utc::now(),
            }))
            .unwrap();
        emitter
            .emit(RunEvent::GraphEnd(GraphLifecycle {
                path: vec![],
                timestamp: Utc::now(),
            }))
            .unwrap();
        drop(emitter);

        assert!(matches!(
            stream.next().await,
            Some(RunEvent::GraphStart(_))
        ));
        assert!(matches!(stream.next().await, Some(RunEvent::GraphEnd(_))));
        assert!(stream.next().await.is_none());
    }

    #[test]
    fn emit_after_consumer_drop_fails() {
        let (emitter, stream) = EventStream::channel();
        drop(stream);
        let result = emitter.emit(RunEvent::GraphStart(GraphLifecycle {
            path: vec![],
            timestamp: Utc::now(),
        }));
        assert!(matches!(result, Err(EmitError::StreamClosed)));
    }

    #[tokio::test]
    async fn responder_resumes_waiter() {
        let (responder, rx) = InputResponder::new();
        let mut values = InputValues::default();
        values.insert("text".to_string(), "hi".into());
        responder.respond(values).unwrap();
        let received = rx.await.unwrap();
        assert_eq!(received["text"].as_str(), Some("hi"));
    }
}
