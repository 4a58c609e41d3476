//! Worker Relay - the worker-initiated back-channel
//!
//! Inverts the usual direction: a worker behind NAT opens a WebSocket to the
//! gateway at `/ws/agent-relay`, authenticates with a wallet signature, and
//! becomes an addressable inference endpoint. The relay owns two keyed maps:
//! address → live connection and request id → pending request/stream. A
//! pending is resolved exactly once; whoever removes it from the map
//! completes it (worker reply, timeout, disconnect, or shutdown).

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::GatewayError;
use crate::registry::NodeRegistry;
use crate::signature::{verify_wallet_signature, AuthPayload};
use crate::{ChatMessage, CompletionRequest, TimeoutConfig};

pub const CLOSE_AUTH_TIMEOUT: u16 = 4001;
pub const CLOSE_EXPECTED_AUTH: u16 = 4002;
pub const CLOSE_MISSING_FIELDS: u16 = 4003;
pub const CLOSE_TIMESTAMP_DRIFT: u16 = 4004;
pub const CLOSE_INVALID_SIGNATURE: u16 = 4005;
pub const CLOSE_REPLACED: u16 = 4010;

/// Maximum accepted clock drift on the auth timestamp
const MAX_AUTH_DRIFT_SECS: i64 = 300;
/// Cadence of the pending-deadline sweep
const SWEEP_INTERVAL: Duration = Duration::from_secs(10);

/// Relay timing knobs
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub auth_timeout: Duration,
    pub request_timeout: Duration,
    pub inactivity: Duration,
    pub ping_interval: Duration,
}

impl From<&TimeoutConfig> for RelayConfig {
    fn from(t: &TimeoutConfig) -> Self {
        Self {
            auth_timeout: Duration::from_secs(t.auth_handshake_secs),
            request_timeout: Duration::from_secs(t.attempt_secs),
            inactivity: Duration::from_secs(t.relay_inactivity_secs),
            ping_interval: Duration::from_secs(t.worker_ping_secs),
        }
    }
}

/// Worker → gateway frames. Unknown types are logged and ignored.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WorkerFrame {
    Response {
        id: String,
        #[serde(default)]
        choices: Vec<RelayChoice>,
    },
    Chunk {
        id: String,
        content: String,
    },
    Done {
        id: String,
        #[serde(default)]
        usage: Option<RelayUsage>,
    },
    Error {
        id: String,
        message: String,
    },
    Ping,
}

/// Gateway → worker frames
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum GatewayFrame {
    AuthOk,
    AuthError {
        message: String,
    },
    #[serde(rename_all = "camelCase")]
    Request {
        id: String,
        messages: Vec<ChatMessage>,
        max_tokens: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        temperature: Option<f32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        top_p: Option<f32>,
        stream: bool,
    },
    Pong,
}

/// Worker payloads are heterogeneous; accept chat-shaped and text-shaped choices.
#[derive(Debug, Clone, Deserialize)]
pub struct RelayChoice {
    #[serde(default)]
    pub message: Option<ChatMessage>,
    #[serde(default)]
    pub text: Option<String>,
}

impl RelayChoice {
    fn into_content(self) -> Option<String> {
        self.message.map(|m| m.content).or(self.text)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RelayUsage {
    #[serde(default, alias = "promptTokens")]
    pub prompt_tokens: Option<u64>,
    #[serde(default, alias = "completionTokens")]
    pub completion_tokens: Option<u64>,
    #[serde(default, alias = "totalTokens")]
    pub total_tokens: Option<u64>,
}

/// Result of a unary relay dispatch
#[derive(Debug)]
pub struct RelayCompletion {
    pub content: String,
    pub usage: Option<RelayUsage>,
}

/// Events delivered to a pending stream's consumer
#[derive(Debug)]
pub enum StreamEvent {
    Chunk(String),
    Done(Option<RelayUsage>),
    Failed(GatewayError),
}

/// Snapshot of one authenticated back-channel session
#[derive(Debug, Clone, Serialize)]
pub struct ConnectedWorker {
    pub address: String,
    pub model: String,
    pub connected_at: DateTime<Utc>,
}

struct WorkerHandle {
    connection_id: String,
    model: String,
    connected_at: DateTime<Utc>,
    tx: mpsc::UnboundedSender<Message>,
}

struct PendingRequest {
    address: String,
    respond: oneshot::Sender<Result<RelayCompletion, GatewayError>>,
    created_at: Instant,
}

struct PendingStream {
    address: String,
    tx: mpsc::Sender<StreamEvent>,
    last_activity: Mutex<Instant>,
}

fn text_frame(frame: &GatewayFrame) -> Message {
    Message::Text(serde_json::to_string(frame).expect("gateway frame serializes"))
}

fn close_frame(code: u16, reason: &str) -> Message {
    Message::Close(Some(CloseFrame { code, reason: reason.to_string().into() }))
}

/// Back-channel server state
pub struct WorkerRelay {
    config: RelayConfig,
    registry: Arc<NodeRegistry>,
    workers: DashMap<String, WorkerHandle>,
    pending_requests: DashMap<String, PendingRequest>,
    pending_streams: DashMap<String, PendingStream>,
}

impl WorkerRelay {
    pub fn new(config: RelayConfig, registry: Arc<NodeRegistry>) -> Self {
        Self {
            config,
            registry,
            workers: DashMap::new(),
            pending_requests: DashMap::new(),
            pending_streams: DashMap::new(),
        }
    }

    /// Spawn the ping loop and the pending-deadline sweep.
    pub fn start(self: &Arc<Self>, shutdown: broadcast::Receiver<()>) {
        let relay = Arc::clone(self);
        let mut shutdown_ping = shutdown.resubscribe();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(relay.config.ping_interval);
            loop {
                tokio::select! {
                    _ = interval.tick() => relay.ping_workers(),
                    _ = shutdown_ping.recv() => break,
                }
            }
        });

        let relay = Arc::clone(self);
        let mut shutdown_sweep = shutdown.resubscribe();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                tokio::select! {
                    _ = interval.tick() => relay.sweep_pendings(),
                    _ = shutdown_sweep.recv() => break,
                }
            }
        });
    }

    /// Entry point for an upgraded `/ws/agent-relay` socket.
    pub async fn handle_socket(self: Arc<Self>, socket: WebSocket) {
        let (mut sink, mut stream) = socket.split();

        // The first frame must be an auth frame, within the handshake budget.
        let text = match tokio::time::timeout(self.config.auth_timeout, stream.next()).await {
            Err(_) => {
                let _ = sink.send(close_frame(CLOSE_AUTH_TIMEOUT, "authentication timeout")).await;
                return;
            }
            Ok(None) | Ok(Some(Err(_))) => return,
            Ok(Some(Ok(Message::Text(text)))) => text,
            Ok(Some(Ok(_))) => {
                let _ = sink.send(close_frame(CLOSE_EXPECTED_AUTH, "expected auth frame")).await;
                return;
            }
        };

        let (address, model) = match self.authenticate(&text) {
            Ok(pair) => pair,
            Err((code, reason)) => {
                let _ = sink
                    .send(text_frame(&GatewayFrame::AuthError { message: reason.clone() }))
                    .await;
                let _ = sink.send(close_frame(code, &reason)).await;
                return;
            }
        };

        let connection_id = Uuid::new_v4().to_string();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        let writer = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let is_close = matches!(msg, Message::Close(_));
                if sink.send(msg).await.is_err() {
                    break;
                }
                if is_close {
                    break;
                }
            }
        });

        self.register_worker(
            &address,
            WorkerHandle {
                connection_id: connection_id.clone(),
                model,
                connected_at: Utc::now(),
                tx: tx.clone(),
            },
        );
        let _ = tx.send(text_frame(&GatewayFrame::AuthOk));
        info!(address = %address, "worker authenticated on back-channel");

        while let Some(frame) = stream.next().await {
            match frame {
                Ok(Message::Text(text)) => self.handle_frame(&address, &text).await,
                Ok(Message::Ping(data)) => {
                    let _ = tx.send(Message::Pong(data));
                }
                Ok(Message::Pong(_)) => {}
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(_) => break,
            }
        }

        self.disconnect(&address, &connection_id, "socket closed");
        writer.abort();
    }

    /// Validate the auth frame. Returns the lowercase wallet address and the
    /// declared model, or the close code to reject with.
    fn authenticate(&self, text: &str) -> Result<(String, String), (u16, String)> {
        let value: serde_json::Value = serde_json::from_str(text)
            .map_err(|_| (CLOSE_EXPECTED_AUTH, "first frame must be a JSON auth frame".to_string()))?;
        if value.get("type").and_then(|t| t.as_str()) != Some("auth") {
            return Err((CLOSE_EXPECTED_AUTH, "first frame must be an auth frame".to_string()));
        }

        let address = value.get("address").and_then(|v| v.as_str()).unwrap_or_default();
        let model = value.get("model").and_then(|v| v.as_str()).unwrap_or_default();
        let signature = value.get("signature").and_then(|v| v.as_str()).unwrap_or_default();
        // numeric/string ambiguity on the wire: accept both
        let timestamp = value
            .get("timestamp")
            .and_then(|v| v.as_i64().or_else(|| v.as_str().and_then(|s| s.parse().ok())));

        let Some(timestamp) = timestamp else {
            return Err((CLOSE_MISSING_FIELDS, "auth frame missing fields".to_string()));
        };
        if address.is_empty() || model.is_empty() || signature.is_empty() {
            return Err((CLOSE_MISSING_FIELDS, "auth frame missing fields".to_string()));
        }

        let drift = (Utc::now().timestamp() - timestamp).abs();
        if drift > MAX_AUTH_DRIFT_SECS {
            return Err((CLOSE_TIMESTAMP_DRIFT, format!("auth timestamp drift of {drift}s")));
        }

        let payload = AuthPayload { address, model, timestamp }.canonical();
        verify_wallet_signature(address, payload.as_bytes(), signature)
            .map_err(|e| (CLOSE_INVALID_SIGNATURE, e.to_string()))?;

        Ok((address.to_lowercase(), model.to_string()))
    }

    fn register_worker(&self, address: &str, handle: WorkerHandle) {
        if let Some(old) = self.workers.insert(address.to_string(), handle) {
            warn!(address = %address, "replacing existing back-channel connection");
            let _ = old.tx.send(close_frame(CLOSE_REPLACED, "replaced by new connection"));
        }
        // the relay identity cannot be HTTP-probed; a successful auth is its probe
        let url = self.registry.ensure_relay(address);
        self.registry.mark_online(&url);
    }

    /// Drop a worker and synchronously fail everything attributed to it.
    /// A stale connection id means the address was already replaced by a
    /// newer connection; its pendings are left alone.
    fn disconnect(&self, address: &str, connection_id: &str, reason: &str) {
        let removed = self
            .workers
            .remove_if(address, |_, handle| handle.connection_id == connection_id)
            .is_some();
        if !removed {
            return;
        }
        info!(address = %address, reason, "worker disconnected");
        self.fail_pendings_for(address, || GatewayError::WorkerDisconnect(address.to_string()));
    }

    fn fail_pendings_for(&self, address: &str, make_err: impl Fn() -> GatewayError) {
        let request_ids: Vec<String> = self
            .pending_requests
            .iter()
            .filter(|e| e.value().address == address)
            .map(|e| e.key().clone())
            .collect();
        for id in request_ids {
            if let Some((_, pending)) = self.pending_requests.remove(&id) {
                let _ = pending.respond.send(Err(make_err()));
            }
        }
        let stream_ids: Vec<String> = self
            .pending_streams
            .iter()
            .filter(|e| e.value().address == address)
            .map(|e| e.key().clone())
            .collect();
        for id in stream_ids {
            if let Some((_, pending)) = self.pending_streams.remove(&id) {
                let _ = pending.tx.try_send(StreamEvent::Failed(make_err()));
            }
        }
    }

    async fn handle_frame(&self, address: &str, text: &str) {
        let frame: WorkerFrame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(address = %address, error = %e, "ignoring unrecognized worker frame");
                return;
            }
        };
        match frame {
            WorkerFrame::Response { id, choices } => {
                let content = choices
                    .into_iter()
                    .next()
                    .and_then(RelayChoice::into_content)
                    .unwrap_or_default();
                if let Some((_, pending)) = self.pending_requests.remove(&id) {
                    let _ = pending.respond.send(Ok(RelayCompletion { content, usage: None }));
                } else {
                    debug!(id = %id, "response for unknown pending request");
                }
            }
            WorkerFrame::Chunk { id, content } => {
                let tx = match self.pending_streams.get(&id) {
                    Some(pending) => {
                        *pending.last_activity.lock() = Instant::now();
                        pending.tx.clone()
                    }
                    None => {
                        debug!(id = %id, "chunk for unknown pending stream");
                        return;
                    }
                };
                let _ = tx.send(StreamEvent::Chunk(content)).await;
            }
            WorkerFrame::Done { id, usage } => {
                if let Some((_, pending)) = self.pending_streams.remove(&id) {
                    let _ = pending.tx.send(StreamEvent::Done(usage)).await;
                }
            }
            WorkerFrame::Error { id, message } => {
                if let Some((_, pending)) = self.pending_requests.remove(&id) {
                    let _ = pending.respond.send(Err(GatewayError::NodeFailure(message)));
                } else if let Some((_, pending)) = self.pending_streams.remove(&id) {
                    let _ = pending.tx.send(StreamEvent::Failed(GatewayError::NodeFailure(message))).await;
                }
            }
            WorkerFrame::Ping => {
                if let Some(worker) = self.workers.get(address) {
                    let _ = worker.tx.send(text_frame(&GatewayFrame::Pong));
                }
            }
        }
    }

    /// Dispatch a unary request over the back-channel.
    pub async fn send_request(
        &self,
        address: &str,
        req: &CompletionRequest,
    ) -> Result<RelayCompletion, GatewayError> {
        let address = address.to_lowercase();
        let tx = self
            .workers
            .get(&address)
            .map(|w| w.tx.clone())
            .ok_or_else(|| GatewayError::WorkerDisconnect(address.clone()))?;

        let id = Uuid::new_v4().to_string();
        let (respond, rx) = oneshot::channel();
        self.pending_requests.insert(
            id.clone(),
            PendingRequest { address: address.clone(), respond, created_at: Instant::now() },
        );

        let frame = GatewayFrame::Request {
            id: id.clone(),
            messages: req.as_messages(),
            max_tokens: req.max_tokens,
            temperature: req.temperature,
            top_p: req.top_p,
            stream: false,
        };
        if tx.send(text_frame(&frame)).is_err() {
            self.pending_requests.remove(&id);
            return Err(GatewayError::WorkerDisconnect(address));
        }

        match tokio::time::timeout(self.config.request_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(GatewayError::WorkerDisconnect(address)),
            Err(_) => {
                self.pending_requests.remove(&id);
                Err(GatewayError::Timeout(self.config.request_timeout))
            }
        }
    }

    /// Dispatch a streaming request; chunks, completion, and failures arrive
    /// on the returned channel.
    pub fn send_stream_request(
        &self,
        address: &str,
        req: &CompletionRequest,
    ) -> Result<mpsc::Receiver<StreamEvent>, GatewayError> {
        let address = address.to_lowercase();
        let tx = self
            .workers
            .get(&address)
            .map(|w| w.tx.clone())
            .ok_or_else(|| GatewayError::WorkerDisconnect(address.clone()))?;

        let id = Uuid::new_v4().to_string();
        let (event_tx, event_rx) = mpsc::channel(64);
        self.pending_streams.insert(
            id.clone(),
            PendingStream {
                address: address.clone(),
                tx: event_tx,
                last_activity: Mutex::new(Instant::now()),
            },
        );

        let frame = GatewayFrame::Request {
            id: id.clone(),
            messages: req.as_messages(),
            max_tokens: req.max_tokens,
            temperature: req.temperature,
            top_p: req.top_p,
            stream: true,
        };
        if tx.send(text_frame(&frame)).is_err() {
            self.pending_streams.remove(&id);
            return Err(GatewayError::WorkerDisconnect(address));
        }

        Ok(event_rx)
    }

    /// Send low-level pings; a worker whose writer is gone gets dropped.
    fn ping_workers(&self) {
        let targets: Vec<(String, String, mpsc::UnboundedSender<Message>)> = self
            .workers
            .iter()
            .map(|e| (e.key().clone(), e.value().connection_id.clone(), e.value().tx.clone()))
            .collect();
        for (address, connection_id, tx) in targets {
            if tx.send(Message::Ping(Vec::new())).is_err() {
                self.disconnect(&address, &connection_id, "ping failed");
            }
        }
    }

    /// Enforce the per-pending deadlines: inactivity for streams, the flat
    /// attempt deadline as a backstop for orphaned unary pendings.
    fn sweep_pendings(&self) {
        let inactivity = self.config.inactivity;
        let stale_streams: Vec<String> = self
            .pending_streams
            .iter()
            .filter(|e| e.value().last_activity.lock().elapsed() > inactivity)
            .map(|e| e.key().clone())
            .collect();
        for id in stale_streams {
            if let Some((_, pending)) = self.pending_streams.remove(&id) {
                warn!(id = %id, address = %pending.address, "pending stream timed out");
                let _ = pending.tx.try_send(StreamEvent::Failed(GatewayError::Timeout(inactivity)));
            }
        }

        let deadline = self.config.request_timeout + SWEEP_INTERVAL;
        let stale_requests: Vec<String> = self
            .pending_requests
            .iter()
            .filter(|e| e.value().created_at.elapsed() > deadline)
            .map(|e| e.key().clone())
            .collect();
        for id in stale_requests {
            if let Some((_, pending)) = self.pending_requests.remove(&id) {
                let _ = pending.respond.send(Err(GatewayError::Timeout(self.config.request_timeout)));
            }
        }
    }

    /// Test-only worker registration: stands in for an authenticated socket
    /// when only pool assembly is under test.
    #[cfg(test)]
    pub(crate) fn register_test_worker(&self, address: &str, model: &str) {
        let (tx, _rx) = mpsc::unbounded_channel();
        self.register_worker(
            address,
            WorkerHandle {
                connection_id: format!("test-{address}"),
                model: model.to_string(),
                connected_at: Utc::now(),
                tx,
            },
        );
    }

    pub fn connected_workers(&self) -> Vec<ConnectedWorker> {
        self.workers
            .iter()
            .map(|e| ConnectedWorker {
                address: e.key().clone(),
                model: e.value().model.clone(),
                connected_at: e.value().connected_at,
            })
            .collect()
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn has_worker(&self, address: &str) -> bool {
        self.workers.contains_key(&address.to_lowercase())
    }

    /// Fail every pending with the shutdown sentinel and close all sockets.
    pub async fn shutdown(&self) {
        let request_ids: Vec<String> =
            self.pending_requests.iter().map(|e| e.key().clone()).collect();
        for id in request_ids {
            if let Some((_, pending)) = self.pending_requests.remove(&id) {
                let _ = pending.respond.send(Err(GatewayError::Shutdown));
            }
        }
        let stream_ids: Vec<String> =
            self.pending_streams.iter().map(|e| e.key().clone()).collect();
        for id in stream_ids {
            if let Some((_, pending)) = self.pending_streams.remove(&id) {
                let _ = pending.tx.try_send(StreamEvent::Failed(GatewayError::Shutdown));
            }
        }
        for worker in self.workers.iter() {
            let _ = worker.tx.send(Message::Close(None));
        }
        self.workers.clear();
        info!("worker relay shut down");
    }
}
