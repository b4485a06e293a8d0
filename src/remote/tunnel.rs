//! Value tunneling between proxied node handlers.
//!
//! A tunnel lets the proxy server pass a sensitive output (say, an API key
//! fetched by a `secrets` node) into another server-side handler without the
//! client ever seeing it. The entry handler's tunneled outputs are replaced
//! with opaque tokens before the reply leaves the server; when a destination
//! handler later receives a token inside its inputs, the server re-invokes
//! the entry handler and splices the real value back in. Destinations can be
//! gated with `when` clauses on the destination's other inputs; a token
//! arriving where it is not allowed becomes [`VALUE_BLOCKED`].

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use regex::Regex;
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::debug;
use uuid::Uuid;

use crate::graph::{InputValues, NodeValue, OutputValues};
use crate::kit::{HandlerError, HandlerMap, NodeHandler, NodeHandlerContext};

/// Substituted for a tunneled value whose `when` constraints did not match.
pub const VALUE_BLOCKED: &str = "VALUE_BLOCKED";

/// Constraint on a destination input gating a tunnel.
#[derive(Clone, Debug)]
pub enum WhenClause {
    /// The input must equal this string exactly.
    Is(String),
    /// The input must match this pattern.
    Matches(Regex),
}

impl WhenClause {
    fn allows(&self, value: Option<&NodeValue>) -> bool {
        let Some(text) = value.and_then(NodeValue::as_str) else {
            return false;
        };
        match self {
            WhenClause::Is(expected) => text == expected,
            WhenClause::Matches(pattern) => pattern.is_match(text),
        }
    }
}

/// Where one tunneled output may travel.
#[derive(Clone, Debug, Default)]
pub struct TunnelDestination {
    /// Node type allowed to receive the value.
    pub to: String,
    /// Constraints on the destination's inputs; empty allows always.
    pub when: FxHashMap<String, WhenClause>,
}

impl TunnelDestination {
    pub fn to(node_type: impl Into<String>) -> Self {
        TunnelDestination {
            to: node_type.into(),
            when: FxHashMap::default(),
        }
    }

    #[must_use]
    pub fn when(mut self, input: impl Into<String>, clause: WhenClause) -> Self {
        self.when.insert(input.into(), clause);
        self
    }
}

/// Output name to allowed destinations, for one entry node type.
pub type TunnelSpec = FxHashMap<String, Vec<TunnelDestination>>;

/// One allow-list entry of a proxy server.
#[derive(Clone, Debug)]
pub enum ProxySpec {
    /// Plain allow: proxy this node type as-is.
    Type(String),
    /// Allow with tunneled outputs.
    Tunneled { node: String, tunnel: TunnelSpec },
}

impl ProxySpec {
    pub fn node_type(&self) -> &str {
        match self {
            ProxySpec::Type(node_type) => node_type,
            ProxySpec::Tunneled { node, .. } => node,
        }
    }

    /// Shorthand for a tunnel whose outputs go to single unconditional
    /// destinations.
    pub fn tunneled(
        node: impl Into<String>,
        outputs: &[(&str, &str)],
    ) -> Self {
        let tunnel = outputs
            .iter()
            .map(|(output, to)| {
                ((*output).to_string(), vec![TunnelDestination::to(*to)])
            })
            .collect();
        ProxySpec::Tunneled {
            node: node.into(),
            tunnel,
        }
    }
}

struct TunnelEntry {
    node_type: String,
    output: String,
    inputs: InputValues,
}

/// Mints opaque tokens and resolves them back to their entries. Scoped to
/// one server; tokens die with it.
struct TokenRegistry {
    entries: Mutex<FxHashMap<String, Arc<TunnelEntry>>>,
    pattern: Regex,
}

impl TokenRegistry {
    fn new() -> Self {
        TokenRegistry {
            entries: Mutex::new(FxHashMap::default()),
            // Matches the shape of `mint` below.
            pattern: Regex::new("T-[0-9a-f]{32}-T").unwrap_or_else(|_| unreachable!()),
        }
    }

    fn mint(&self, node_type: &str, output: &str, inputs: InputValues) -> String {
        let token = format!("T-{}-T", Uuid::new_v4().simple());
        self.entries.lock().insert(
            token.clone(),
            Arc::new(TunnelEntry {
                node_type: node_type.to_string(),
                output: output.to_string(),
                inputs,
            }),
        );
        token
    }

    fn resolve(&self, token: &str) -> Option<Arc<TunnelEntry>> {
        self.entries.lock().get(token).cloned()
    }
}

/// Wraps an entry handler: tunneled outputs leave as tokens.
struct TunnelEntryHandler {
    inner: Arc<dyn NodeHandler>,
    node_type: String,
    tunnel: TunnelSpec,
    registry: Arc<TokenRegistry>,
}

#[async_trait]
impl NodeHandler for TunnelEntryHandler {
    async fn invoke(
        &self,
        inputs: InputValues,
        context: NodeHandlerContext,
    ) -> Result<OutputValues, HandlerError> {
        let mut outputs = self.inner.invoke(inputs.clone(), context).await?;
        for output in self.tunnel.keys() {
            if outputs.contains_key(output) {
                let token = self.registry.mint(&self.node_type, output, inputs.clone());
                outputs.insert(output.clone(), token.into());
            }
        }
        Ok(outputs)
    }
}

/// Wraps a destination handler: tokens in string inputs are resolved (or
/// blocked) before the handler runs.
struct TunnelExitHandler {
    inner: Arc<dyn NodeHandler>,
    node_type: String,
    registry: Arc<TokenRegistry>,
    /// Unwrapped handlers, for re-invoking entries.
    sources: Arc<HandlerMap>,
    /// (entry type, output) to the destination specs naming this type.
    routes: FxHashMap<(String, String), Vec<TunnelDestination>>,
}

impl TunnelExitHandler {
    /// Resolve one token against this destination's routes and inputs.
    async fn resolve_token(
        &self,
        token: &str,
        inputs: &InputValues,
        context: &NodeHandlerContext,
    ) -> Result<NodeValue, HandlerError> {
        let Some(entry) = self.registry.resolve(token) else {
            return Ok(VALUE_BLOCKED.into());
        };
        let routes = self
            .routes
            .get(&(entry.node_type.clone(), entry.output.clone()));
        let allowed = routes.is_some_and(|destinations| {
            destinations.iter().any(|destination| {
                destination
                    .when
                    .iter()
                    .all(|(input, clause)| clause.allows(inputs.get(input)))
            })
        });
        if !allowed {
            debug!(entry = %entry.node_type, output = %entry.output, "tunnel blocked");
            return Ok(VALUE_BLOCKED.into());
        }
        let Some(source) = self.sources.get(&entry.node_type) else {
            return Ok(VALUE_BLOCKED.into());
        };
        let outputs = source
            .invoke(entry.inputs.clone(), context.clone())
            .await?;
        Ok(outputs
            .get(&entry.output)
            .cloned()
            .unwrap_or_else(|| VALUE_BLOCKED.into()))
    }

    async fn scrub_value(
        &self,
        value: NodeValue,
        inputs: &InputValues,
        context: &NodeHandlerContext,
    ) -> Result<NodeValue, HandlerError> {
        let Some(text) = value.as_str().map(str::to_string) else {
            return Ok(value);
        };
        // A value that is exactly one token keeps the resolved value's type.
        if self.registry.pattern.is_match(&text)
            && self.registry.pattern.find(&text).map(|m| m.as_str()) == Some(text.as_str())
        {
            return self.resolve_token(&text, inputs, context).await;
        }
        if !self.registry.pattern.is_match(&text) {
            return Ok(value);
        }
        // Tokens embedded in a larger string are spliced in textually.
        let mut result = String::new();
        let mut cursor = 0;
        let matches: Vec<(usize, usize, String)> = self
            .registry
            .pattern
            .find_iter(&text)
            .map(|m| (m.start(), m.end(), m.as_str().to_string()))
            .collect();
        for (start, end, token) in matches {
            result.push_str(&text[cursor..start]);
            let resolved = self.resolve_token(&token, inputs, context).await?;
            match resolved.as_str() {
                Some(s) => result.push_str(s),
                None => result.push_str(&resolved.to_wire().to_string()),
            }
            cursor = end;
        }
        result.push_str(&text[cursor..]);
        Ok(result.into())
    }
}

#[async_trait]
impl NodeHandler for TunnelExitHandler {
    async fn invoke(
        &self,
        inputs: InputValues,
        context: NodeHandlerContext,
    ) -> Result<OutputValues, HandlerError> {
        let mut scrubbed = InputValues::default();
        for (port, value) in &inputs {
            let value = self.scrub_value(value.clone(), &inputs, &context).await?;
            scrubbed.insert(port.clone(), value);
        }
        debug!(node_type = %self.node_type, "inputs scrubbed for tunneled values");
        self.inner.invoke(scrubbed, context).await
    }
}

/// Apply tunnel specs to a handler map: entry types get token-minting
/// wrappers, destination types get token-resolving wrappers, everything else
/// passes through untouched.
pub fn create_tunnel_kit(specs: &[ProxySpec], handlers: &HandlerMap) -> HandlerMap {
    let tunneled: Vec<(&str, &TunnelSpec)> = specs
        .iter()
        .filter_map(|spec| match spec {
            ProxySpec::Tunneled { node, tunnel } => Some((node.as_str(), tunnel)),
            ProxySpec::Type(_) => None,
        })
        .collect();
    if tunneled.is_empty() {
        return handlers.clone();
    }

    let registry = Arc::new(TokenRegistry::new());
    let sources = Arc::new(handlers.clone());

    let destination_types: FxHashSet<&str> = tunneled
        .iter()
        .flat_map(|(_, tunnel)| tunnel.values())
        .flatten()
        .map(|destination| destination.to.as_str())
        .collect();

    let mut wrapped = handlers.clone();
    for (node_type, handler) in handlers {
        let mut current = Arc::clone(handler);
        if let Some((_, tunnel)) = tunneled.iter().find(|(entry, _)| entry == node_type) {
            current = Arc::new(TunnelEntryHandler {
                inner: current,
                node_type: node_type.clone(),
                tunnel: (*tunnel).clone(),
                registry: Arc::clone(&registry),
            });
        }
        if destination_types.contains(node_type.as_str()) {
            let mut routes: FxHashMap<(String, String), Vec<TunnelDestination>> =
                FxHashMap::default();
            for (entry_type, tunnel) in &tunneled {
                for (output, destinations) in tunnel.iter() {
                    for destination in destinations {
                        if destination.to == *node_type {
                            routes
                                .entry(((*entry_type).to_string(), output.clone()))
                                .or_default()
                                .push(destination.clone());
                        }
                    }
                }
            }
            current = Arc::new(TunnelExitHandler {
                inner: current,
                node_type: node_type.clone(),
                registry: Arc::clone(&registry),
                sources: Arc::clone(&sources),
                routes,
            });
        }
        wrapped.insert(node_type.clone(), current);
    }
    wrapped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::NodeDescriptor;
    use crate::kit::Kit;
    use serde_json::json;

    fn test_handlers() -> HandlerMap {
        let kit = Kit::new("test://tunnel")
            .with_fn("secrets", |_inputs, _ctx| async move {
                let mut outputs = OutputValues::default();
                outputs.insert("API_KEY".to_string(), "hunter2".into());
                Ok(outputs)
            })
            .with_fn("fetcher", |inputs, _ctx| async move {
                let mut outputs = OutputValues::default();
                let seen = inputs
                    .get("key")
                    .and_then(NodeValue::as_str)
                    .unwrap_or_default()
                    .to_string();
                outputs.insert("seen".to_string(), seen.into());
                if let Some(url) = inputs.get("url") {
                    outputs.insert("url".to_string(), url.clone());
                }
                Ok(outputs)
            });
        crate::kit::handlers_from_kits(&[kit])
    }

    fn ctx(node_type: &str) -> NodeHandlerContext {
        NodeHandlerContext::detached(NodeDescriptor::new("n", node_type))
    }

    #[tokio::test]
    async fn entry_output_is_replaced_with_token() {
        let specs = vec![ProxySpec::tunneled("secrets", &[("API_KEY", "fetcher")])];
        let wrapped = create_tunnel_kit(&specs, &test_handlers());

        let outputs = wrapped["secrets"]
            .invoke(InputValues::default(), ctx("secrets"))
            .await
            .unwrap();
        let token = outputs["API_KEY"].as_str().unwrap();
        assert_ne!(token, "hunter2");
        assert!(token.starts_with("T-") && token.ends_with("-T"));
    }

    #[tokio::test]
    async fn destination_receives_real_value() {
        let specs = vec![ProxySpec::tunneled("secrets", &[("API_KEY", "fetcher")])];
        let wrapped = create_tunnel_kit(&specs, &test_handlers());

        let minted = wrapped["secrets"]
            .invoke(InputValues::default(), ctx("secrets"))
            .await
            .unwrap();
        let mut inputs = InputValues::default();
        inputs.insert("key".to_string(), minted["API_KEY"].clone());

        let outputs = wrapped["fetcher"].invoke(inputs, ctx("fetcher")).await.unwrap();
        assert_eq!(outputs["seen"].as_str(), Some("hunter2"));
    }

    #[tokio::test]
    async fn when_clause_blocks_mismatched_inputs() {
        let tunnel: TunnelSpec = [(
            "API_KEY".to_string(),
            vec![
                TunnelDestination::to("fetcher")
                    .when("url", WhenClause::Matches(Regex::new(r"^https://api\.example\.com/").unwrap())),
            ],
        )]
        .into_iter()
        .collect();
        let specs = vec![ProxySpec::Tunneled {
            node: "secrets".to_string(),
            tunnel,
        }];
        let wrapped = create_tunnel_kit(&specs, &test_handlers());

        let minted = wrapped["secrets"]
            .invoke(InputValues::default(), ctx("secrets"))
            .await
            .unwrap();

        let mut blocked = InputValues::default();
        blocked.insert("key".to_string(), minted["API_KEY"].clone());
        blocked.insert("url".to_string(), "https://evil.example.org/".into());
        let outputs = wrapped["fetcher"]
            .invoke(blocked, ctx("fetcher"))
            .await
            .unwrap();
        assert_eq!(outputs["seen"].as_str(), Some(VALUE_BLOCKED));

        let mut allowed = InputValues::default();
        allowed.insert("key".to_string(), minted["API_KEY"].clone());
        allowed.insert("url".to_string(), "https://api.example.com/v1".into());
        let outputs = wrapped["fetcher"]
            .invoke(allowed, ctx("fetcher"))
            .await
            .unwrap();
        assert_eq!(outputs["seen"].as_str(), Some("hunter2"));
    }

    #[tokio::test]
    async fn embedded_token_is_spliced_into_string() {
        let specs = vec![ProxySpec::tunneled("secrets", &[("API_KEY", "fetcher")])];
        let wrapped = create_tunnel_kit(&specs, &test_handlers());

        let minted = wrapped["secrets"]
            .invoke(InputValues::default(), ctx("secrets"))
            .await
            .unwrap();
        let token = minted["API_KEY"].as_str().unwrap();

        let mut inputs = InputValues::default();
        inputs.insert(
            "key".to_string(),
            format!("Bearer {token}").into(),
        );
        let outputs = wrapped["fetcher"].invoke(inputs, ctx("fetcher")).await.unwrap();
        assert_eq!(outputs["seen"].as_str(), Some("Bearer hunter2"));
    }

    #[tokio::test]
    async fn non_token_inputs_pass_through() {
        let specs = vec![ProxySpec::tunneled("secrets", &[("API_KEY", "fetcher")])];
        let wrapped = create_tunnel_kit(&specs, &test_handlers());

        let mut inputs = InputValues::default();
        inputs.insert("key".to_string(), "plain".into());
        inputs.insert("url".to_string(), NodeValue::Json(json!(42)));
        let outputs = wrapped["fetcher"].invoke(inputs, ctx("fetcher")).await.unwrap();
        assert_eq!(outputs["seen"].as_str(), Some("plain"));
        assert_eq!(outputs["url"].as_json(), Some(&json!(42)));
    }
}
