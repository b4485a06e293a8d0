//! One graph invocation: dispatching scheduled nodes and emitting run events.
//!
//! A [`Scope`] owns everything a single graph (or subgraph) invocation needs:
//! the descriptor, the merged handler map, the event emitter, and its
//! invocation path. `#`-typed nodes recurse into a child scope whose path
//! extends the parent's.

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use miette::Diagnostic;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, instrument};

use super::machine::TraversalMachine;
use crate::data::DataStore;
use crate::graph::{
    GraphDescriptor, GraphError, INPUT_TYPE, InputValues, NodeDescriptor, OUTPUT_TYPE,
    OutputValues,
};
use crate::kit::{HandlerMap, NodeHandlerContext};
use crate::run::{
    AbortSignal, EmitError, ErrorEvent, EventEmitter, GraphLifecycle, InputRequest, InputResponder,
    NodeEndEvent, NodeStartEvent, OutputEvent, RunEvent, SkipEvent,
};

/// Hook invoked before each node dispatch. Returning outputs short-circuits
/// the handler entirely; the proxy client uses this to reroute node types to
/// a remote server.
#[async_trait]
pub trait Probe: Send + Sync {
    async fn before_dispatch(
        &self,
        descriptor: &NodeDescriptor,
        inputs: &InputValues,
    ) -> Option<OutputValues>;
}

#[derive(Debug, Error, Diagnostic)]
pub enum ScopeError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Graph(#[from] GraphError),

    #[error("no handler registered for node type \"{node_type}\"")]
    #[diagnostic(
        code(flowboard::traversal::unknown_node_type),
        help("Supply a kit that provides this node type.")
    )]
    UnknownNodeType { node_type: String },

    #[error("input request was abandoned")]
    #[diagnostic(
        code(flowboard::traversal::input_abandoned),
        help("The consumer dropped an input responder without answering it.")
    )]
    InputAbandoned,

    #[error(transparent)]
    #[diagnostic(transparent)]
    Emit(#[from] EmitError),
}

/// A single graph invocation in flight.
pub struct Scope {
    graph: Arc<GraphDescriptor>,
    handlers: Arc<HandlerMap>,
    emitter: EventEmitter,
    probe: Option<Arc<dyn Probe>>,
    store: Option<Arc<dyn DataStore>>,
    abort: AbortSignal,
    path: Vec<usize>,
    /// Values pre-bound to `input` nodes; set for subgraph invocations.
    bound_inputs: Option<InputValues>,
    /// Stop after the first `output` node fires.
    one_round: bool,
}

impl Scope {
    pub fn new(graph: Arc<GraphDescriptor>, handlers: Arc<HandlerMap>, emitter: EventEmitter) -> Self {
        Scope {
            graph,
            handlers,
            emitter,
            probe: None,
            store: None,
            abort: AbortSignal::new(),
            path: Vec::new(),
            bound_inputs: None,
            one_round: false,
        }
    }

    #[must_use]
    pub fn with_probe(mut self, probe: Arc<dyn Probe>) -> Self {
        self.probe = Some(probe);
        self
    }

    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn DataStore>) -> Self {
        self.store = Some(store);
        self
    }

    #[must_use]
    pub fn with_abort(mut self, abort: AbortSignal) -> Self {
        self.abort = abort;
        self
    }

    fn child(&self, graph: Arc<GraphDescriptor>, path: Vec<usize>, inputs: InputValues) -> Scope {
        Scope {
            graph,
            handlers: Arc::clone(&self.handlers),
            emitter: self.emitter.clone(),
            probe: self.probe.clone(),
            store: self.store.clone(),
            abort: self.abort.clone(),
            path,
            bound_inputs: Some(inputs),
            one_round: true,
        }
    }

    /// Run the graph to completion, emitting events along the way. Returns
    /// the values surfaced by the last `output` node to fire.
    ///
    /// Handler failures stay local to their branch: the error is emitted and
    /// the branch stops feeding downstream nodes, but sibling branches keep
    /// running and the graph still ends normally. A missing handler is fatal
    /// and aborts the whole invocation without a closing `graphend`.
    #[instrument(skip(self), fields(path = ?self.path), err)]
    pub async fn invoke(mut self) -> Result<OutputValues, ScopeError> {
        self.emitter.emit(RunEvent::GraphStart(GraphLifecycle {
            path: self.path.clone(),
            timestamp: Utc::now(),
        }))?;

        let mut machine = TraversalMachine::new(Arc::clone(&self.graph), None)?;
        let mut last_outputs = OutputValues::default();
        let mut invocation_id = 0usize;

        while let Some(result) = machine.next_result() {
            if self.abort.aborted() {
                debug!(path = ?self.path, "invocation aborted");
                break;
            }
            invocation_id += 1;
            let mut node_path = self.path.clone();
            node_path.push(invocation_id);

            if result.skip {
                self.emitter.emit(RunEvent::Skip(SkipEvent {
                    descriptor: result.descriptor.clone(),
                    inputs: result.inputs.clone(),
                    missing: result.missing_inputs.clone(),
                    path: node_path,
                    timestamp: Utc::now(),
                }))?;
                continue;
            }

            self.emitter.emit(RunEvent::NodeStart(NodeStartEvent {
                descriptor: result.descriptor.clone(),
                inputs: result.inputs.clone(),
                path: node_path.clone(),
                timestamp: Utc::now(),
            }))?;

            let outputs = match result.descriptor.node_type.as_str() {
                INPUT_TYPE => self.resolve_input(&result.descriptor, &node_path).await?,
                OUTPUT_TYPE => {
                    self.emitter.emit(RunEvent::Output(OutputEvent {
                        descriptor: result.descriptor.clone(),
                        outputs: result.inputs.clone(),
                        path: node_path.clone(),
                        timestamp: Utc::now(),
                    }))?;
                    last_outputs = result.inputs.clone();
                    self.emit_node_end(&result.descriptor, &result.inputs, &last_outputs, &node_path)?;
                    machine.complete(&result, &OutputValues::default());
                    if self.one_round {
                        break;
                    }
                    continue;
                }
                other => match GraphDescriptor::subgraph_ref(other) {
                    Some(id) => {
                        let subgraph = self.graph.graphs.get(id).cloned().ok_or_else(|| {
                            GraphError::UnknownSubgraph { id: id.to_string() }
                        })?;
                        let child = self.child(
                            Arc::new(subgraph),
                            node_path.clone(),
                            result.inputs.clone(),
                        );
                        child.invoke_boxed().await?
                    }
                    None => {
                        match self.dispatch(&result.descriptor, &result.inputs, &node_path).await? {
                            Some(outputs) => outputs,
                            None => {
                                // Branch-local failure: already reported, the
                                // branch just stops producing.
                                continue;
                            }
                        }
                    }
                },
            };

            self.emit_node_end(&result.descriptor, &result.inputs, &outputs, &node_path)?;
            machine.complete(&result, &outputs);
        }

        self.emitter.emit(RunEvent::GraphEnd(GraphLifecycle {
            path: self.path.clone(),
            timestamp: Utc::now(),
        }))?;
        Ok(last_outputs)
    }

    pub(crate) fn invoke_boxed(
        self,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<OutputValues, ScopeError>> + Send>> {
        Box::pin(self.invoke())
    }

    /// Resolve an `input` node: bound values for subgraph invocations,
    /// otherwise a suspended request to the run's consumer. Board `args`
    /// seed the result either way. A subgraph input with nothing bound
    /// bubbles a request to the outermost consumer (scopes share one
    /// emitter, so the event carries the nested path).
    async fn resolve_input(
        &mut self,
        descriptor: &NodeDescriptor,
        path: &[usize],
    ) -> Result<OutputValues, ScopeError> {
        let mut outputs: OutputValues = self.graph.args.clone();
        if let Some(bound) = &self.bound_inputs {
            outputs.extend(bound.clone());
            if !outputs.is_empty() {
                return Ok(outputs);
            }
        }
        let (responder, rx) = InputResponder::new();
        self.emitter.emit(RunEvent::Input(InputRequest {
            descriptor: descriptor.clone(),
            arguments: descriptor.configuration.clone(),
            path: path.to_vec(),
            timestamp: Utc::now(),
            responder: Some(responder),
        }))?;
        let answered = rx.await.map_err(|_| ScopeError::InputAbandoned)?;
        outputs.extend(answered);
        Ok(outputs)
    }

    /// Dispatch to a handler (or the probe, which may short-circuit it).
    /// `Ok(None)` means the handler failed and the failure was reported.
    async fn dispatch(
        &mut self,
        descriptor: &NodeDescriptor,
        inputs: &InputValues,
        path: &[usize],
    ) -> Result<Option<OutputValues>, ScopeError> {
        if let Some(probe) = &self.probe
            && let Some(outputs) = probe.before_dispatch(descriptor, inputs).await
        {
            return Ok(Some(outputs));
        }

        let Some(handler) = self.handlers.get(&descriptor.node_type) else {
            self.emitter.emit(RunEvent::Error(ErrorEvent {
                error: json!({
                    "error": format!(
                        "no handler registered for node type \"{}\"",
                        descriptor.node_type
                    ),
                    "node": descriptor.id,
                }),
                path: path.to_vec(),
                timestamp: Utc::now(),
            }))?;
            return Err(ScopeError::UnknownNodeType {
                node_type: descriptor.node_type.clone(),
            });
        };

        let context = NodeHandlerContext {
            descriptor: descriptor.clone(),
            path: path.to_vec(),
            store: self.store.clone(),
            emitter: Some(self.emitter.clone()),
            abort: self.abort.clone(),
        };
        match handler.invoke(inputs.clone(), context).await {
            Ok(outputs) => Ok(Some(outputs)),
            Err(error) => {
                debug!(node = %descriptor.id, %error, "handler failed");
                self.emitter.emit(RunEvent::Error(ErrorEvent {
                    error: json!({
                        "error": error.to_string(),
                        "node": descriptor.id,
                    }),
                    path: path.to_vec(),
                    timestamp: Utc::now(),
                }))?;
                Ok(None)
            }
        }
    }

    fn emit_node_end(
        &self,
        descriptor: &NodeDescriptor,
        inputs: &InputValues,
        outputs: &OutputValues,
        path: &[usize],
    ) -> Result<(), EmitError> {
        self.emitter.emit(RunEvent::NodeEnd(NodeEndEvent {
            descriptor: descriptor.clone(),
            inputs: inputs.clone(),
            outputs: outputs.clone(),
            path: path.to_vec(),
            timestamp: Utc::now(),
        }))
    }
}
