//! Node handlers and the kits that group them.
//!
//! A [`Kit`] maps node type names to [`NodeHandler`] implementations. The
//! traversal layer resolves a node's `type` against the merged handler map of
//! every kit supplied to a run; earlier kits win on collisions.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use miette::Diagnostic;
use rustc_hash::FxHashMap;
use thiserror::Error;

use crate::data::DataStore;
use crate::graph::{InputValues, NodeDescriptor, OutputValues};
use crate::run::{AbortSignal, EventEmitter, InputResponder, RunEvent, SecretRequest};

/// Merged lookup table from node type name to handler.
pub type HandlerMap = FxHashMap<String, Arc<dyn NodeHandler>>;

#[derive(Debug, Error, Diagnostic)]
pub enum HandlerError {
    #[error("handler failed: {0}")]
    #[diagnostic(code(flowboard::kit::handler_failed))]
    Failed(String),

    #[error("secret request could not be delivered")]
    #[diagnostic(
        code(flowboard::kit::secrets_unavailable),
        help("Secrets can only be requested from a run with a live event stream.")
    )]
    SecretsUnavailable,

    #[error(transparent)]
    #[diagnostic(code(flowboard::kit::other))]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl HandlerError {
    pub fn failed(message: impl Into<String>) -> Self {
        HandlerError::Failed(message.into())
    }
}

/// One unit of board computation.
///
/// Handlers are stateless: everything they need arrives through `inputs`
/// (the node's configuration merged under delivered edge values) and the
/// context.
#[async_trait]
pub trait NodeHandler: Send + Sync {
    async fn invoke(
        &self,
        inputs: InputValues,
        context: NodeHandlerContext,
    ) -> Result<OutputValues, HandlerError>;
}

/// Execution environment handed to a handler for one invocation.
#[derive(Clone)]
pub struct NodeHandlerContext {
    /// The node being invoked.
    pub descriptor: NodeDescriptor,
    /// Invocation path of this node within the run.
    pub path: Vec<usize>,
    /// Run-scoped data storage, when the runner supplied one.
    pub store: Option<Arc<dyn DataStore>>,
    /// Event channel back to the run's consumer, absent on the proxy server.
    pub emitter: Option<EventEmitter>,
    pub abort: AbortSignal,
}

impl NodeHandlerContext {
    /// Context with nothing attached, for direct handler invocation.
    pub fn detached(descriptor: NodeDescriptor) -> Self {
        NodeHandlerContext {
            descriptor,
            path: Vec::new(),
            store: None,
            emitter: None,
            abort: AbortSignal::new(),
        }
    }

    /// Ask the run's consumer for secret values. Suspends the calling branch
    /// until the consumer responds to the emitted `Secret` event.
    pub async fn request_secrets(&self, keys: &[&str]) -> Result<InputValues, HandlerError> {
        let emitter = self
            .emitter
            .as_ref()
            .ok_or(HandlerError::SecretsUnavailable)?;
        let (responder, rx) = InputResponder::new();
        emitter
            .emit(RunEvent::Secret(SecretRequest {
                keys: keys.iter().map(|key| (*key).to_string()).collect(),
                path: self.path.clone(),
                timestamp: chrono::Utc::now(),
                responder: Some(responder),
            }))
            .map_err(|_| HandlerError::SecretsUnavailable)?;
        rx.await.map_err(|_| HandlerError::SecretsUnavailable)
    }
}

type HandlerFuture = Pin<Box<dyn Future<Output = Result<OutputValues, HandlerError>> + Send>>;

/// Adapter turning an async closure into a [`NodeHandler`].
struct FnHandler<F>(F);

#[async_trait]
impl<F> NodeHandler for FnHandler<F>
where
    F: Fn(InputValues, NodeHandlerContext) -> HandlerFuture + Send + Sync,
{
    async fn invoke(
        &self,
        inputs: InputValues,
        context: NodeHandlerContext,
    ) -> Result<OutputValues, HandlerError> {
        (self.0)(inputs, context).await
    }
}

/// A named collection of node handlers.
#[derive(Clone, Default)]
pub struct Kit {
    pub url: String,
    handlers: HandlerMap,
}

impl Kit {
    pub fn new(url: impl Into<String>) -> Self {
        Kit {
            url: url.into(),
            handlers: HandlerMap::default(),
        }
    }

    #[must_use]
    pub fn with_handler(
        mut self,
        node_type: impl Into<String>,
        handler: Arc<dyn NodeHandler>,
    ) -> Self {
        self.handlers.insert(node_type.into(), handler);
        self
    }

    /// Register an async closure as the handler for `node_type`.
    #[must_use]
    pub fn with_fn<F, Fut>(self, node_type: impl Into<String>, f: F) -> Self
    where
        F: Fn(InputValues, NodeHandlerContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<OutputValues, HandlerError>> + Send + 'static,
    {
        let wrapped = move |inputs, context| -> HandlerFuture { Box::pin(f(inputs, context)) };
        self.with_handler(node_type, Arc::new(FnHandler(wrapped)))
    }

    pub fn handler(&self, node_type: &str) -> Option<&Arc<dyn NodeHandler>> {
        self.handlers.get(node_type)
    }

    pub fn node_types(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }
}

/// Merge kits into one handler map. Earlier kits take precedence.
pub fn handlers_from_kits(kits: &[Kit]) -> HandlerMap {
    let mut merged = HandlerMap::default();
    for kit in kits {
        for (node_type, handler) in &kit.handlers {
            merged
                .entry(node_type.clone())
                .or_insert_with(|| Arc::clone(handler));
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn echo_kit(url: &str, reply: &'static str) -> Kit {
        Kit::new(url).with_fn("echo", move |_inputs, _ctx| async move {
            let mut outputs = OutputValues::default();
            outputs.insert("text".to_string(), reply.into());
            Ok(outputs)
        })
    }

    #[tokio::test]
    async fn closure_handler_invokes() {
        let kit = echo_kit("test://echo", "hello");
        let handler = kit.handler("echo").unwrap();
        let context = NodeHandlerContext::detached(NodeDescriptor::new("e", "echo"));
        let outputs = handler
            .invoke(InputValues::default(), context)
            .await
            .unwrap();
        assert_eq!(outputs["text"].as_str(), Some("hello"));
    }

    #[test]
    fn earlier_kits_win_on_collision() {
        let merged = handlers_from_kits(&[echo_kit("a", "first"), echo_kit("b", "second")]);
        assert_eq!(merged.len(), 1);
        assert!(merged.contains_key("echo"));
    }

    #[tokio::test]
    async fn request_secrets_without_emitter_fails() {
        let context = NodeHandlerContext::detached(NodeDescriptor::new("s", "secrets"));
        let result = context.request_secrets(&["API_KEY"]).await;
        assert!(matches!(result, Err(HandlerError::SecretsUnavailable)));
    }

    #[tokio::test]
    async fn request_secrets_round_trip() {
        use crate::run::EventStream;

        let (emitter, mut stream) = EventStream::channel();
        let mut context = NodeHandlerContext::detached(NodeDescriptor::new("s", "secrets"));
        context.emitter = Some(emitter);

        let ask = tokio::spawn(async move { context.request_secrets(&["API_KEY"]).await });

        let Some(RunEvent::Secret(request)) = stream.next().await else {
            panic!("expected secret event");
        };
        assert_eq!(request.keys, vec!["API_KEY"]);
        let mut values = InputValues::default();
        values.insert("API_KEY".to_string(), json!("s3cret").into());
        request.responder.unwrap().respond(values).unwrap();

        let secrets = ask.await.unwrap().unwrap();
        assert_eq!(secrets["API_KEY"].as_str(), Some("s3cret"));
    }
}
