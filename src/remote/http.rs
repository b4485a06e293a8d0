//! Client for a remote run endpoint.
//!
//! [`HttpClient`] posts input values to a server and replays the SSE-framed
//! message stream as run events. A run that pauses on `input`/`secret`
//! hands out a continuation token; the next [`HttpClient::send`] echoes it
//! as `$next` so the server resumes the same run.

use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use futures_util::StreamExt;
use miette::Diagnostic;
use parking_lot::Mutex;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, instrument, warn};

use super::chunks::{SseDecoder, TransportError};
use super::protocol::{RemoteMessage, RunRequest};
use crate::graph::InputValues;
use crate::run::{
    AbortSignal, EmitError, ErrorEvent, EventEmitter, EventStream, GraphLifecycle, RunEvent,
};

/// Environment variable naming the remote run endpoint.
pub const REMOTE_URL_VAR: &str = "FLOWBOARD_REMOTE_URL";
/// Environment variable carrying the API key sent as `$key`.
pub const API_KEY_VAR: &str = "FLOWBOARD_API_KEY";

#[derive(Debug, Error, Diagnostic)]
pub enum ProtocolError {
    #[error("a request is already in flight")]
    #[diagnostic(
        code(flowboard::remote::request_in_flight),
        help("Wait for the pending send() to resolve before sending again.")
    )]
    RequestInFlight,

    #[error("missing environment variable {var}")]
    #[diagnostic(
        code(flowboard::remote::config),
        help("Set the variable or construct RemoteConfig explicitly.")
    )]
    Config { var: &'static str },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Emit(#[from] EmitError),
}

/// Connection settings for a remote run endpoint.
#[derive(Clone, Debug)]
pub struct RemoteConfig {
    pub url: String,
    pub key: Option<String>,
    /// Ask the server for diagnostic events (`$diagnostics`).
    pub diagnostics: bool,
    /// Log outgoing request bodies at debug level. Off unless explicitly
    /// enabled; bodies may carry secrets.
    pub log_bodies: bool,
}

impl RemoteConfig {
    pub fn new(url: impl Into<String>) -> Self {
        RemoteConfig {
            url: url.into(),
            key: None,
            diagnostics: false,
            log_bodies: false,
        }
    }

    #[must_use]
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Read the endpoint from `FLOWBOARD_REMOTE_URL` and the key from
    /// `FLOWBOARD_API_KEY`, honoring a `.env` file if present.
    pub fn from_env() -> Result<Self, ProtocolError> {
        dotenvy::dotenv().ok();
        let url = std::env::var(REMOTE_URL_VAR)
            .map_err(|_| ProtocolError::Config { var: REMOTE_URL_VAR })?;
        let key = std::env::var(API_KEY_VAR).ok();
        Ok(RemoteConfig {
            url,
            key,
            diagnostics: false,
            log_bodies: false,
        })
    }
}

#[derive(Debug, Default)]
struct PauseState {
    next: Option<String>,
    input_schema: Option<Value>,
    secret_keys: Vec<String>,
}

/// A remote run in progress.
pub struct HttpClient {
    config: RemoteConfig,
    http: reqwest::Client,
    emitter: EventEmitter,
    abort: AbortSignal,
    in_flight: AtomicBool,
    pause: Mutex<PauseState>,
}

impl HttpClient {
    /// Create a client and the event stream its runs replay into.
    pub fn new(config: RemoteConfig) -> (Self, EventStream) {
        let (emitter, stream) = EventStream::channel();
        let client = HttpClient {
            config,
            http: reqwest::Client::new(),
            emitter,
            abort: stream.abort_signal(),
            in_flight: AtomicBool::new(false),
            pause: Mutex::new(PauseState::default()),
        };
        (client, stream)
    }

    /// Post `inputs` and replay the response. Resolves `Ok(true)` when the
    /// run reached a terminal state, `Ok(false)` when it paused with a
    /// continuation token for the next send.
    ///
    /// A failed request or non-2xx status is reported into the event stream
    /// as a graphstart/error/graphend triple, not as an `Err`; only protocol
    /// violations and concurrent sends error.
    #[instrument(skip(self, inputs), fields(url = %self.config.url), err)]
    pub async fn send(&self, inputs: InputValues) -> Result<bool, ProtocolError> {
        if self.in_flight.swap(true, Ordering::SeqCst) {
            return Err(ProtocolError::RequestInFlight);
        }
        let guard = InFlightGuard(&self.in_flight);

        let next = std::mem::take(&mut *self.pause.lock()).next;
        let request = RunRequest {
            inputs,
            key: self.config.key.clone(),
            next,
            diagnostics: self.config.diagnostics,
        };
        let body = request.to_body();
        if self.config.log_bodies {
            debug!(url = %self.config.url, %body, "sending run request");
        }

        let response = match self.http.post(&self.config.url).json(&body).send().await {
            Ok(response) => response,
            Err(error) => {
                warn!(%error, "run request failed");
                self.emit_failure_triple(format!("request failed: {error}"))?;
                return Ok(true);
            }
        };
        if !response.status().is_success() {
            let status = response.status();
            self.emit_failure_triple(format!("server responded with {status}"))?;
            return Ok(true);
        }

        let mut decoder = SseDecoder::new();
        let mut pause: Option<PauseState> = None;
        let mut body_stream = response.bytes_stream();
        'read: while let Some(chunk) = body_stream.next().await {
            if self.abort.aborted() {
                drop(guard);
                return Ok(true);
            }
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(error) => {
                    warn!(%error, "response stream failed");
                    self.emit_failure_triple(format!("stream failed: {error}"))?;
                    return Ok(true);
                }
            };
            for payload in decoder.push_bytes(&chunk)? {
                if self.handle_message(payload, &mut pause)? {
                    break 'read;
                }
            }
        }
        if let Some(payload) = decoder.finish()? {
            self.handle_message(payload, &mut pause)?;
        }

        // Publish the pause before clearing the in-flight flag, so there is
        // no window where a second send slips in ahead of the state.
        let paused = match pause {
            Some(state) => {
                *self.pause.lock() = state;
                true
            }
            // Stream ended without a pause or an explicit `end`: treat it
            // as a synthesized `end`.
            None => false,
        };
        drop(guard);
        Ok(!paused)
    }

    /// Route one decoded message. Returns `true` when the run is over and
    /// the rest of the response can be ignored.
    fn handle_message(
        &self,
        payload: Value,
        pause: &mut Option<PauseState>,
    ) -> Result<bool, ProtocolError> {
        let message = RemoteMessage::from_wire(payload)?;
        match &message {
            RemoteMessage::End { .. } => return Ok(true),
            RemoteMessage::Input { data, next: Some(next) } => {
                *pause = Some(PauseState {
                    next: Some(next.clone()),
                    input_schema: data.get("inputArguments").cloned(),
                    secret_keys: Vec::new(),
                });
            }
            RemoteMessage::Secret { data, next: Some(next) } => {
                *pause = Some(PauseState {
                    next: Some(next.clone()),
                    input_schema: None,
                    secret_keys: data
                        .get("keys")
                        .cloned()
                        .and_then(|keys| serde_json::from_value(keys).ok())
                        .unwrap_or_default(),
                });
            }
            _ => {}
        }
        if let Some(event) = message.into_run_event()? {
            self.emitter.emit(event)?;
        }
        Ok(false)
    }

    fn emit_failure_triple(&self, message: String) -> Result<(), EmitError> {
        self.emitter.emit(RunEvent::GraphStart(GraphLifecycle {
            path: Vec::new(),
            timestamp: Utc::now(),
        }))?;
        self.emitter.emit(RunEvent::Error(ErrorEvent {
            error: json!({ "error": message }),
            path: Vec::new(),
            timestamp: Utc::now(),
        }))?;
        self.emitter.emit(RunEvent::GraphEnd(GraphLifecycle {
            path: Vec::new(),
            timestamp: Utc::now(),
        }))
    }

    /// True when a paused run is waiting for the next send. Always false
    /// while a request is in flight.
    pub fn running(&self) -> bool {
        !self.in_flight.load(Ordering::SeqCst) && self.pause.lock().next.is_some()
    }

    /// Schema of the pending input request, when paused on `input`.
    pub fn input_schema(&self) -> Option<Value> {
        if self.in_flight.load(Ordering::SeqCst) {
            return None;
        }
        self.pause.lock().input_schema.clone()
    }

    /// Keys of the pending secret request, when paused on `secret`.
    pub fn secret_keys(&self) -> Vec<String> {
        if self.in_flight.load(Ordering::SeqCst) {
            return Vec::new();
        }
        self.pause.lock().secret_keys.clone()
    }
}

/// Clears the in-flight flag on every exit path of `send`.
struct InFlightGuard<'a>(&'a AtomicBool);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}
