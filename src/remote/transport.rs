//! Request/response transports for the proxy protocol.
//!
//! The proxy client and server speak through the [`ClientTransport`] and
//! [`ServerTransport`] traits, so the same protocol runs over HTTP or over
//! an in-process message port. The port flavor multiplexes independent
//! named channels over one duplex [`MessagePort`] via a [`PortDispatcher`].

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use futures_util::StreamExt;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde_json::{Value, json};
use tracing::{debug, warn};
use uuid::Uuid;

use super::chunks::{SseDecoder, TransportError};
use crate::graph::{
    Capability, InputValues, NodeDescriptor, NodeValue, OutputValues, ValueStream,
    values_from_wire, values_to_wire,
};

/// A request to the proxy server.
#[derive(Clone, Debug, PartialEq)]
pub enum ProxyRequest {
    /// Invoke `node` with `inputs` on the server.
    Proxy {
        node: NodeDescriptor,
        inputs: InputValues,
    },
    /// Shutdown sentinel: the server's serve loop exits on receipt.
    End { timestamp: DateTime<Utc> },
}

impl ProxyRequest {
    pub fn end_now() -> Self {
        ProxyRequest::End {
            timestamp: Utc::now(),
        }
    }

    pub fn to_wire(&self) -> Value {
        match self {
            ProxyRequest::Proxy { node, inputs } => {
                json!(["proxy", { "node": node, "inputs": values_to_wire(inputs) }])
            }
            ProxyRequest::End { timestamp } => {
                json!(["end", { "timestamp": timestamp.timestamp_millis() }])
            }
        }
    }

    pub fn from_wire(value: Value) -> Result<Self, TransportError> {
        let (tag, data) = split_tagged(value)?;
        match tag.as_str() {
            "proxy" => {
                let node = data
                    .get("node")
                    .cloned()
                    .ok_or_else(|| TransportError::malformed("proxy request without node"))?;
                let node = serde_json::from_value(node)
                    .map_err(|e| TransportError::malformed(format!("bad node descriptor: {e}")))?;
                let inputs = values_from_wire(data.get("inputs").cloned().unwrap_or(Value::Null));
                Ok(ProxyRequest::Proxy { node, inputs })
            }
            "end" => Ok(ProxyRequest::End {
                timestamp: wire_timestamp(&data),
            }),
            other => Err(TransportError::malformed(format!(
                "unknown proxy request type \"{other}\""
            ))),
        }
    }
}

/// The proxy server's reply to one request.
#[derive(Clone, Debug, PartialEq)]
pub enum ProxyReply {
    Outputs { outputs: OutputValues },
    Error { error: Value, timestamp: DateTime<Utc> },
}

impl ProxyReply {
    pub fn error(error: impl Into<Value>) -> Self {
        ProxyReply::Error {
            error: error.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn to_wire(&self) -> Value {
        match self {
            ProxyReply::Outputs { outputs } => {
                json!(["proxy", { "outputs": values_to_wire(outputs) }])
            }
            ProxyReply::Error { error, timestamp } => {
                json!(["error", { "error": error, "timestamp": timestamp.timestamp_millis() }])
            }
        }
    }

    pub fn from_wire(value: Value) -> Result<Self, TransportError> {
        let (tag, data) = split_tagged(value)?;
        match tag.as_str() {
            "proxy" => Ok(ProxyReply::Outputs {
                outputs: values_from_wire(data.get("outputs").cloned().unwrap_or(Value::Null)),
            }),
            "error" => Ok(ProxyReply::Error {
                error: data.get("error").cloned().unwrap_or(Value::Null),
                timestamp: wire_timestamp(&data),
            }),
            other => Err(TransportError::malformed(format!(
                "unknown proxy reply type \"{other}\""
            ))),
        }
    }
}

fn split_tagged(value: Value) -> Result<(String, Value), TransportError> {
    let Value::Array(mut parts) = value else {
        return Err(TransportError::malformed("message is not an array"));
    };
    if parts.len() != 2 {
        return Err(TransportError::malformed("message is not a [type, data] pair"));
    }
    let data = parts.pop().unwrap_or(Value::Null);
    match parts.pop() {
        Some(Value::String(tag)) => Ok((tag, data)),
        _ => Err(TransportError::malformed("message tag is not a string")),
    }
}

fn wire_timestamp(data: &Value) -> DateTime<Utc> {
    data.get("timestamp")
        .and_then(Value::as_i64)
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        .unwrap_or_else(Utc::now)
}

/// Client side of a proxy connection.
#[async_trait]
pub trait ClientTransport: Send + Sync {
    /// Send a request and await the reply.
    async fn round_trip(&self, request: ProxyRequest) -> Result<ProxyReply, TransportError>;

    /// Send a request without waiting for a reply (the shutdown sentinel).
    async fn post(&self, request: ProxyRequest) -> Result<(), TransportError>;
}

/// Server side of a proxy connection: a stream of requests, each with its
/// reply slot.
#[async_trait]
pub trait ServerTransport: Send + Sync {
    /// Await the next request; `None` when the transport closed.
    async fn next_request(&self) -> Option<(ProxyRequest, ReplyTo)>;
}

/// Reply slot handed out with each server-side request. A scalar reply is a
/// single frame; a reply referencing a stream capability is followed by
/// `chunk` frames and a closing `end` frame on the same correlation id.
pub struct ReplyTo(Box<dyn Fn(Value) + Send + 'static>);

impl ReplyTo {
    pub fn new(deliver: impl Fn(Value) + Send + 'static) -> Self {
        ReplyTo(Box::new(deliver))
    }

    pub fn send(self, reply: ProxyReply) {
        (self.0)(reply.to_wire());
    }

    /// Send a reply whose outputs carry `stream` as a stub, then pump the
    /// stream's chunks as follow-on frames until the sender side closes.
    pub fn send_with_stream(self, reply: ProxyReply, stream: ValueStream) {
        (self.0)(reply.to_wire());
        let deliver = self.0;
        tokio::spawn(async move {
            while let Some(chunk) = stream.next().await {
                deliver(json!(["chunk", { "chunk": chunk }]));
            }
            deliver(json!(["end", {}]));
        });
    }
}

/// One frame on a message port: a named channel, a correlation id, and the
/// wire body.
#[derive(Clone, Debug)]
pub struct PortPacket {
    pub channel: String,
    pub id: Uuid,
    pub body: Value,
}

/// One end of an in-process duplex packet pipe.
#[derive(Clone, Debug)]
pub struct MessagePort {
    tx: flume::Sender<PortPacket>,
    rx: flume::Receiver<PortPacket>,
}

/// Create a connected pair of ports.
pub fn message_channel() -> (MessagePort, MessagePort) {
    let (a_tx, a_rx) = flume::unbounded();
    let (b_tx, b_rx) = flume::unbounded();
    (
        MessagePort { tx: a_tx, rx: b_rx },
        MessagePort { tx: b_tx, rx: a_rx },
    )
}

type Pending = Arc<Mutex<FxHashMap<Uuid, flume::Sender<Value>>>>;
type Servers = Arc<Mutex<FxHashMap<String, flume::Sender<(Uuid, Value)>>>>;

/// Multiplexes named request/response channels over one [`MessagePort`].
///
/// Each side of the port runs its own dispatcher. Incoming packets whose id
/// matches a pending round trip feed that waiter; a round trip stays
/// pending until its client side is done with it, so stream tails keep
/// flowing on the same id. Everything else is routed to the server
/// registered for the packet's channel. Nothing bounds the queues except
/// channel capacity.
pub struct PortDispatcher {
    tx: flume::Sender<PortPacket>,
    pending: Pending,
    servers: Servers,
}

impl PortDispatcher {
    /// Attach to one end of a port and start the pump task.
    pub fn new(port: MessagePort) -> Self {
        let pending: Pending = Arc::default();
        let servers: Servers = Arc::default();
        let dispatcher = PortDispatcher {
            tx: port.tx,
            pending: Arc::clone(&pending),
            servers: Arc::clone(&servers),
        };
        tokio::spawn(async move {
            while let Ok(packet) = port.rx.recv_async().await {
                let waiter = pending.lock().get(&packet.id).cloned();
                if let Some(waiter) = waiter {
                    if waiter.send(packet.body).is_err() {
                        debug!(id = %packet.id, "round-trip waiter went away");
                        pending.lock().remove(&packet.id);
                    }
                    continue;
                }
                let server = servers.lock().get(&packet.channel).cloned();
                match server {
                    Some(server) => {
                        if server.send((packet.id, packet.body)).is_err() {
                            warn!(channel = %packet.channel, "server channel closed");
                        }
                    }
                    None => warn!(channel = %packet.channel, "packet for unregistered channel"),
                }
            }
        });
        dispatcher
    }

    /// A client transport speaking on `channel`.
    pub fn client(&self, channel: impl Into<String>) -> PortClientTransport {
        PortClientTransport {
            channel: channel.into(),
            tx: self.tx.clone(),
            pending: Arc::clone(&self.pending),
        }
    }

    /// Register as the server for `channel` and return its transport.
    /// Replaces any previous registration for the same channel.
    pub fn serve(&self, channel: impl Into<String>) -> PortServerTransport {
        let channel = channel.into();
        let (tx, rx) = flume::unbounded();
        self.servers.lock().insert(channel.clone(), tx);
        PortServerTransport {
            channel,
            rx,
            reply_tx: self.tx.clone(),
        }
    }
}

pub struct PortClientTransport {
    channel: String,
    tx: flume::Sender<PortPacket>,
    pending: Pending,
}

#[async_trait]
impl ClientTransport for PortClientTransport {
    async fn round_trip(&self, request: ProxyRequest) -> Result<ProxyReply, TransportError> {
        let id = Uuid::new_v4();
        let (reply_tx, reply_rx) = flume::unbounded();
        self.pending.lock().insert(id, reply_tx);
        let sent = self.tx.send(PortPacket {
            channel: self.channel.clone(),
            id,
            body: request.to_wire(),
        });
        if sent.is_err() {
            self.pending.lock().remove(&id);
            return Err(TransportError::Closed);
        }
        let first = match reply_rx.recv_async().await {
            Ok(body) => body,
            Err(_) => {
                self.pending.lock().remove(&id);
                return Err(TransportError::Closed);
            }
        };
        let reply = match ProxyReply::from_wire(first) {
            Ok(reply) => reply,
            Err(error) => {
                self.pending.lock().remove(&id);
                return Err(error);
            }
        };
        // A reply with a stream stub keeps the round trip pending; the
        // tail task drains the remaining frames and retires the id.
        let mut tail_spawned = false;
        let reply = materialize_streams(reply, |tx| {
            tail_spawned = true;
            let pending = Arc::clone(&self.pending);
            tokio::spawn(async move {
                while let Ok(body) = reply_rx.recv_async().await {
                    if !forward_chunk(body, &tx) {
                        break;
                    }
                }
                pending.lock().remove(&id);
            });
        });
        if !tail_spawned {
            self.pending.lock().remove(&id);
        }
        Ok(reply)
    }

    async fn post(&self, request: ProxyRequest) -> Result<(), TransportError> {
        self.tx
            .send(PortPacket {
                channel: self.channel.clone(),
                id: Uuid::new_v4(),
                body: request.to_wire(),
            })
            .map_err(|_| TransportError::Closed)
    }
}

pub struct PortServerTransport {
    channel: String,
    rx: flume::Receiver<(Uuid, Value)>,
    reply_tx: flume::Sender<PortPacket>,
}

#[async_trait]
impl ServerTransport for PortServerTransport {
    async fn next_request(&self) -> Option<(ProxyRequest, ReplyTo)> {
        loop {
            let (id, body) = self.rx.recv_async().await.ok()?;
            match ProxyRequest::from_wire(body) {
                Ok(request) => {
                    let reply_tx = self.reply_tx.clone();
                    let channel = self.channel.clone();
                    let reply_to = ReplyTo::new(move |body| {
                        if reply_tx
                            .send(PortPacket {
                                channel: channel.clone(),
                                id,
                                body,
                            })
                            .is_err()
                        {
                            warn!("reply could not be delivered, port closed");
                        }
                    });
                    return Some((request, reply_to));
                }
                Err(error) => {
                    warn!(%error, "dropping malformed proxy request");
                }
            }
        }
    }
}

/// Proxy client transport over HTTP.
///
/// Each request is one POST; the response is an SSE stream whose first
/// frame is the reply. When the reply references a stream capability, the
/// remaining frames are `chunk` frames carrying its chunks, closed by an
/// `end` frame; the stub is replaced with a live [`ValueStream`] fed from
/// the response tail.
pub struct HttpClientTransport {
    url: String,
    http: reqwest::Client,
}

impl HttpClientTransport {
    pub fn new(url: impl Into<String>) -> Self {
        HttpClientTransport {
            url: url.into(),
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl ClientTransport for HttpClientTransport {
    async fn round_trip(&self, request: ProxyRequest) -> Result<ProxyReply, TransportError> {
        let response = self
            .http
            .post(&self.url)
            .json(&request.to_wire())
            .send()
            .await
            .map_err(|error| TransportError::malformed(format!("request failed: {error}")))?;
        if !response.status().is_success() {
            return Err(TransportError::malformed(format!(
                "server responded with {}",
                response.status()
            )));
        }

        let mut decoder = SseDecoder::new();
        let mut body_stream = response.bytes_stream();
        let (first, backlog) = loop {
            let Some(chunk) = body_stream.next().await else {
                match decoder.finish()? {
                    Some(payload) => break (payload, Vec::new()),
                    None => return Err(TransportError::Closed),
                }
            };
            let chunk =
                chunk.map_err(|error| TransportError::malformed(format!("stream failed: {error}")))?;
            let mut payloads = decoder.push_bytes(&chunk)?;
            if !payloads.is_empty() {
                let first = payloads.remove(0);
                // Anything already decoded beyond the reply belongs to the
                // stream tail; re-feed it below.
                break (first, payloads);
            }
        };

        let reply = materialize_streams(ProxyReply::from_wire(first)?, move |tx| {
            tokio::spawn(async move {
                pump_tail(backlog, body_stream, decoder, tx).await;
            });
        });
        Ok(reply)
    }

    async fn post(&self, request: ProxyRequest) -> Result<(), TransportError> {
        self.http
            .post(&self.url)
            .json(&request.to_wire())
            .send()
            .await
            .map_err(|error| TransportError::malformed(format!("request failed: {error}")))?;
        Ok(())
    }
}

async fn pump_tail(
    backlog: Vec<Value>,
    mut body_stream: impl futures_util::Stream<Item = reqwest::Result<bytes::Bytes>> + Unpin,
    mut decoder: SseDecoder,
    tx: flume::Sender<Value>,
) {
    for payload in backlog {
        if !forward_chunk(payload, &tx) {
            return;
        }
    }
    while let Some(chunk) = body_stream.next().await {
        let Ok(chunk) = chunk else { return };
        let Ok(payloads) = decoder.push_bytes(&chunk) else {
            return;
        };
        for payload in payloads {
            if !forward_chunk(payload, &tx) {
                return;
            }
        }
    }
    if let Ok(Some(payload)) = decoder.finish() {
        forward_chunk(payload, &tx);
    }
}

/// Route one tail frame into a stream sender. False once the tail is done:
/// an `end` frame, an unrecognized frame, or a gone receiver.
fn forward_chunk(payload: Value, tx: &flume::Sender<Value>) -> bool {
    match split_tagged(payload) {
        Ok((tag, data)) if tag == "chunk" => tx
            .send(data.get("chunk").cloned().unwrap_or(Value::Null))
            .is_ok(),
        _ => false,
    }
}

/// Swap stream stubs in a reply's outputs for live streams, wiring the
/// sender into `spawn_feed` once if any stub was found.
fn materialize_streams(
    reply: ProxyReply,
    spawn_feed: impl FnOnce(flume::Sender<Value>),
) -> ProxyReply {
    let ProxyReply::Outputs { mut outputs } = reply else {
        return reply;
    };
    let stub_port = outputs.iter().find_map(|(port, value)| {
        let object = value.as_json()?.as_object()?;
        (object.get("kind").and_then(Value::as_str) == Some("stream")).then(|| port.clone())
    });
    if let Some(port) = stub_port {
        let (tx, stream) = ValueStream::channel();
        outputs.insert(port, NodeValue::Capability(Capability::Stream(stream)));
        spawn_feed(tx);
    }
    ProxyReply::Outputs { outputs }
}
