//! Proxying node execution to another process.
//!
//! The server side owns the real kits and an allow-list of node types it is
//! willing to run; the client side synthesizes handlers that forward their
//! invocations over a [`ClientTransport`] and wait for the reply. Tunneled
//! outputs (see [`super::tunnel`]) never leave the server in the clear.

use std::sync::Arc;

use async_trait::async_trait;
use miette::Diagnostic;
use rustc_hash::FxHashSet;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::chunks::TransportError;
use super::transport::{ClientTransport, ProxyReply, ProxyRequest, ServerTransport};
use super::tunnel::{ProxySpec, create_tunnel_kit};
use crate::data::DataStore;
use crate::graph::{ERROR_KEY, InputValues, NodeDescriptor, NodeValue, OutputValues, error_outputs};
use crate::kit::{HandlerError, Kit, NodeHandler, NodeHandlerContext, handlers_from_kits};
use crate::run::AbortSignal;
use crate::traversal::Probe;

/// Reply sent for node types outside the allow-list.
const CANT_PROXY: &str = "Can't proxy a node of this node type.";

#[derive(Debug, Error, Diagnostic)]
pub enum ProxyError {
    #[error("proxy server reported an error: {message}")]
    #[diagnostic(code(flowboard::proxy::server))]
    Server { message: String },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Transport(#[from] TransportError),
}

/// What a [`ProxyServer`] serves: the kits holding the real handlers, the
/// allow-list, and an optional data store shared with handlers.
#[derive(Default)]
pub struct ProxyServerConfig {
    pub kits: Vec<Kit>,
    pub proxy: Vec<ProxySpec>,
    pub store: Option<Arc<dyn DataStore>>,
}

/// Serves proxied node invocations over a [`ServerTransport`].
pub struct ProxyServer<T: ServerTransport> {
    transport: T,
}

impl<T: ServerTransport> ProxyServer<T> {
    pub fn new(transport: T) -> Self {
        ProxyServer { transport }
    }

    /// Serve until the transport closes or an `end` sentinel arrives.
    pub async fn serve(&self, config: ProxyServerConfig) {
        let handlers = handlers_from_kits(&config.kits);
        let handlers = create_tunnel_kit(&config.proxy, &handlers);
        let allowed: FxHashSet<&str> =
            config.proxy.iter().map(ProxySpec::node_type).collect();

        while let Some((request, reply_to)) = self.transport.next_request().await {
            let (node, inputs) = match request {
                ProxyRequest::End { .. } => {
                    info!("proxy server received end sentinel");
                    break;
                }
                ProxyRequest::Proxy { node, inputs } => (node, inputs),
            };
            if !allowed.contains(node.node_type.as_str()) {
                warn!(node_type = %node.node_type, "refusing to proxy node type");
                reply_to.send(ProxyReply::error(json!(CANT_PROXY)));
                continue;
            }
            let Some(handler) = handlers.get(&node.node_type) else {
                reply_to.send(ProxyReply::error(json!(CANT_PROXY)));
                continue;
            };
            let context = NodeHandlerContext {
                descriptor: node.clone(),
                path: Vec::new(),
                store: config.store.clone(),
                emitter: None,
                abort: AbortSignal::new(),
            };
            debug!(node = %node.id, node_type = %node.node_type, "proxying invocation");
            match handler.invoke(inputs, context).await {
                Ok(outputs) => {
                    // Stream outputs serialize as stubs; the live chunks
                    // follow the reply as tail frames.
                    let stream = outputs.values().find_map(NodeValue::as_stream).cloned();
                    let reply = ProxyReply::Outputs {
                        outputs: make_serializable(outputs),
                    };
                    match stream {
                        Some(stream) => reply_to.send_with_stream(reply, stream),
                        None => reply_to.send(reply),
                    }
                }
                Err(error) => reply_to.send(ProxyReply::error(json!(error.to_string()))),
            }
        }
    }
}

/// Flatten an `$error` output into a plain string so it survives the wire.
fn make_serializable(mut outputs: OutputValues) -> OutputValues {
    if let Some(value) = outputs.get(ERROR_KEY)
        && value.as_str().is_none()
    {
        let text = value
            .as_json()
            .and_then(|v| v.get("error"))
            .and_then(Value::as_str)
            .map_or_else(|| value.to_wire().to_string(), str::to_string);
        outputs.insert(ERROR_KEY.to_string(), text.into());
    }
    outputs
}

/// Forwards node invocations to a remote [`ProxyServer`].
#[derive(Clone)]
pub struct ProxyClient {
    transport: Arc<dyn ClientTransport>,
}

impl ProxyClient {
    pub fn new(transport: impl ClientTransport + 'static) -> Self {
        ProxyClient {
            transport: Arc::new(transport),
        }
    }

    /// One proxied invocation. Error replies become [`ProxyError::Server`].
    pub async fn proxy(
        &self,
        node: &NodeDescriptor,
        inputs: InputValues,
    ) -> Result<OutputValues, ProxyError> {
        let reply = self
            .transport
            .round_trip(ProxyRequest::Proxy {
                node: node.clone(),
                inputs,
            })
            .await?;
        match reply {
            ProxyReply::Outputs { outputs } => Ok(outputs),
            ProxyReply::Error { error, .. } => Err(ProxyError::Server {
                message: error
                    .as_str()
                    .map_or_else(|| error.to_string(), str::to_string),
            }),
        }
    }

    /// A kit whose handlers for `types` forward to the server.
    pub fn create_proxy_kit(&self, types: &[&str]) -> Kit {
        let mut kit = Kit::new("proxy://remote");
        for node_type in types {
            kit = kit.with_handler(
                *node_type,
                Arc::new(ProxiedHandler {
                    client: self.clone(),
                }),
            );
        }
        kit
    }

    /// A probe rerouting `types` to the server ahead of local dispatch.
    /// Server failures fold into `$error` outputs so the branch stays
    /// observable instead of vanishing.
    pub fn create_probe(&self, types: &[&str]) -> Arc<dyn Probe> {
        Arc::new(ProxyProbe {
            client: self.clone(),
            types: types.iter().map(|t| (*t).to_string()).collect(),
        })
    }

    /// Ask the server's serve loop to exit. Meaningful for the port
    /// transport; an HTTP server just sees one more request.
    pub async fn shutdown_server(&self) -> Result<(), ProxyError> {
        self.transport.post(ProxyRequest::end_now()).await?;
        Ok(())
    }
}

struct ProxiedHandler {
    client: ProxyClient,
}

#[async_trait]
impl NodeHandler for ProxiedHandler {
    async fn invoke(
        &self,
        inputs: InputValues,
        context: NodeHandlerContext,
    ) -> Result<OutputValues, HandlerError> {
        self.client
            .proxy(&context.descriptor, inputs)
            .await
            .map_err(|error| HandlerError::failed(error.to_string()))
    }
}

struct ProxyProbe {
    client: ProxyClient,
    types: FxHashSet<String>,
}

#[async_trait]
impl Probe for ProxyProbe {
    async fn before_dispatch(
        &self,
        descriptor: &NodeDescriptor,
        inputs: &InputValues,
    ) -> Option<OutputValues> {
        if !self.types.contains(&descriptor.node_type) {
            return None;
        }
        match self.client.proxy(descriptor, inputs.clone()).await {
            Ok(outputs) => Some(outputs),
            Err(error) => Some(error_outputs(error.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn serializable_errors_become_strings() {
        let mut outputs = OutputValues::default();
        outputs.insert(
            ERROR_KEY.to_string(),
            NodeValue::Json(json!({ "error": "it broke" })),
        );
        let outputs = make_serializable(outputs);
        assert_eq!(outputs[ERROR_KEY].as_str(), Some("it broke"));
    }

    #[test]
    fn string_errors_pass_through() {
        let mut outputs = OutputValues::default();
        outputs.insert(ERROR_KEY.to_string(), "already text".into());
        let outputs = make_serializable(outputs);
        assert_eq!(outputs[ERROR_KEY].as_str(), Some("already text"));
    }
}
