//! Talking to boards and handlers in other processes.
//!
//! Two protocols live here. The run protocol ([`HttpClient`],
//! [`RemoteMessage`]) replays a whole board run from a server as an event
//! stream, pausing on `input`/`secret` with continuation tokens. The proxy
//! protocol ([`ProxyClient`], [`ProxyServer`]) forwards individual node
//! invocations to a server that owns the real handlers, with optional value
//! tunneling so secrets never reach the client.

mod chunks;
mod http;
mod protocol;
mod proxy;
mod transport;
mod tunnel;

pub use chunks::{SseDecoder, TransportError};
pub use http::{API_KEY_VAR, HttpClient, ProtocolError, REMOTE_URL_VAR, RemoteConfig};
pub use protocol::{RemoteMessage, RunRequest};
pub use proxy::{ProxyClient, ProxyError, ProxyServer, ProxyServerConfig};
pub use transport::{
    ClientTransport, HttpClientTransport, MessagePort, PortClientTransport, PortDispatcher,
    PortPacket, PortServerTransport, ProxyReply, ProxyRequest, ReplyTo, ServerTransport,
    message_channel,
};
pub use tunnel::{
    ProxySpec, TunnelDestination, TunnelSpec, VALUE_BLOCKED, WhenClause, create_tunnel_kit,
};
