//! Running a board in-process.

use std::sync::Arc;

use miette::Diagnostic;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use super::events::{EventStream, RunEvent};
use crate::data::DataStore;
use crate::graph::{ERROR_KEY, GraphDescriptor, GraphError, InputValues, OutputValues};
use crate::kit::{Kit, handlers_from_kits};
use crate::traversal::{Probe, Scope};

#[derive(Debug, Error, Diagnostic)]
pub enum RunnerError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Graph(#[from] GraphError),

    #[error("board reported an error: {error}")]
    #[diagnostic(code(flowboard::run::board_error))]
    Board { error: Value },
}

/// Runs a board with a set of kits, surfacing progress as an event stream.
///
/// ```no_run
/// # use flowboard::graph::GraphDescriptor;
/// # use flowboard::kit::Kit;
/// # use flowboard::run::{LocalRunner, RunEvent};
/// # async fn demo(board: GraphDescriptor, kit: Kit) -> miette::Result<()> {
/// let runner = LocalRunner::new(board).with_kit(kit);
/// let mut events = runner.run()?;
/// while let Some(event) = events.next().await {
///     if let RunEvent::Output(output) = event {
///         println!("{:?}", output.outputs);
///     }
/// }
/// # Ok(())
/// # }
/// ```
pub struct LocalRunner {
    graph: Arc<GraphDescriptor>,
    kits: Vec<Kit>,
    store: Option<Arc<dyn DataStore>>,
    probe: Option<Arc<dyn Probe>>,
}

impl LocalRunner {
    pub fn new(graph: GraphDescriptor) -> Self {
        LocalRunner {
            graph: Arc::new(graph),
            kits: Vec::new(),
            store: None,
            probe: None,
        }
    }

    #[must_use]
    pub fn with_kit(mut self, kit: Kit) -> Self {
        self.kits.push(kit);
        self
    }

    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn DataStore>) -> Self {
        self.store = Some(store);
        self
    }

    #[must_use]
    pub fn with_probe(mut self, probe: Arc<dyn Probe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Start the run. Structural validation happens up front, so a broken
    /// board fails here rather than producing a partial event stream.
    pub fn run(&self) -> Result<EventStream, RunnerError> {
        self.graph.validate()?;
        let (emitter, stream) = EventStream::channel();
        let handlers = Arc::new(handlers_from_kits(&self.kits));
        let mut scope = Scope::new(Arc::clone(&self.graph), handlers, emitter)
            .with_abort(stream.abort_signal());
        if let Some(store) = &self.store {
            scope = scope.with_store(Arc::clone(store));
        }
        if let Some(probe) = &self.probe {
            scope = scope.with_probe(Arc::clone(probe));
        }
        tokio::spawn(async move {
            if let Err(error) = scope.invoke().await {
                debug!(%error, "run ended abnormally");
            }
        });
        Ok(stream)
    }

    /// One-shot convenience: answer every input request with `inputs` and
    /// return the first output. Board-level errors surface as
    /// [`RunnerError::Board`].
    pub async fn run_once(&self, inputs: InputValues) -> Result<OutputValues, RunnerError> {
        let mut events = self.run()?;
        while let Some(event) = events.next().await {
            match event {
                RunEvent::Input(request) => {
                    if let Some(responder) = request.responder {
                        // A dropped run just ends the stream; nothing to do.
                        let _ = responder.respond(inputs.clone());
                    }
                }
                RunEvent::Output(output) => {
                    if let Some(error) = output.outputs.get(ERROR_KEY) {
                        return Err(RunnerError::Board {
                            error: error.to_wire(),
                        });
                    }
                    return Ok(output.outputs);
                }
                RunEvent::Error(error) => {
                    return Err(RunnerError::Board { error: error.error });
                }
                _ => {}
            }
        }
        Ok(OutputValues::default())
    }
}

impl From<GraphDescriptor> for LocalRunner {
    fn from(graph: GraphDescriptor) -> Self {
        LocalRunner::new(graph)
    }
}
