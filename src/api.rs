//! Client-facing HTTP surface
//!
//! OpenAI-compatible chat completions (unary JSON and SSE streaming with a
//! 15-second comment heartbeat), the static model catalog, liveness, gateway
//! stats, and the `/ws/agent-relay` upgrade for the worker back-channel.
//! Client authentication is an ordinary middleware function over configured
//! bearer keys; pro keys raise the max-tokens cap.

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Request, State};
use axum::http::header;
use axum::middleware::{self, Next};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::warn;
use uuid::Uuid;

use crate::error::GatewayError;
use crate::{ChatMessage, CompletionRequest, InferenceGateway};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Shared handler state
#[derive(Clone)]
pub struct ApiState {
    gateway: Arc<InferenceGateway>,
}

impl ApiState {
    pub fn new(gateway: Arc<InferenceGateway>) -> Self {
        Self { gateway }
    }
}

/// Caller tier resolved by the auth middleware
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientTier {
    Free,
    Pro,
}

impl ClientTier {
    fn max_tokens(self, tier: &crate::TierConfig) -> u32 {
        match self {
            ClientTier::Free => tier.free_max_tokens,
            ClientTier::Pro => tier.pro_max_tokens,
        }
    }
}

/// Wire shape of `POST /v1/chat/completions`
#[derive(Debug, Clone, Deserialize)]
pub struct ChatCompletionBody {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default)]
    pub stream: Option<bool>,
}

#[derive(Debug, Serialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

#[derive(Debug, Serialize)]
pub struct Choice {
    pub index: u32,
    pub message: ChatMessage,
    pub finish_reason: String,
}

#[derive(Debug, Serialize)]
pub struct ChatCompletionResponse {
    pub id: String,
    pub object: &'static str,
    pub created: i64,
    pub model: String,
    pub choices: Vec<Choice>,
    pub usage: Usage,
}

#[derive(Debug, Default, Serialize)]
struct Delta {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
}

#[derive(Debug, Serialize)]
struct ChunkChoice {
    index: u32,
    delta: Delta,
    finish_reason: Option<&'static str>,
}

#[derive(Debug, Serialize)]
struct ChatCompletionChunk {
    id: String,
    object: &'static str,
    created: i64,
    model: String,
    choices: Vec<ChunkChoice>,
}

/// Validate the wire body into an internal request. Pro-gated models are
/// refused for free-tier callers; the tier's max-tokens cap clamps the
/// requested budget. Validation and tier errors are 4xx and never retried.
fn validate(
    body: ChatCompletionBody,
    config: &crate::GatewayConfig,
    tier: ClientTier,
) -> Result<CompletionRequest, GatewayError> {
    let model = match body.model {
        Some(m) if !m.trim().is_empty() => m,
        _ => config.default_model.clone(),
    };
    if config.requires_pro(&model) && tier != ClientTier::Pro {
        return Err(GatewayError::TierLimit(format!("model {model} requires the pro tier")));
    }
    if body.messages.is_empty() && body.prompt.as_deref().unwrap_or("").is_empty() {
        return Err(GatewayError::Validation("messages must not be empty".into()));
    }
    for m in &body.messages {
        if m.role.trim().is_empty() {
            return Err(GatewayError::Validation("message role must not be empty".into()));
        }
    }
    if let Some(t) = body.temperature {
        if !(0.0..=2.0).contains(&t) {
            return Err(GatewayError::Validation("temperature must be within [0, 2]".into()));
        }
    }
    if let Some(p) = body.top_p {
        if !(0.0..=1.0).contains(&p) || p == 0.0 {
            return Err(GatewayError::Validation("top_p must be within (0, 1]".into()));
        }
    }
    let cap = tier.max_tokens(&config.tier);
    let max_tokens = body.max_tokens.unwrap_or(cap).min(cap).max(1);
    Ok(CompletionRequest {
        model,
        messages: body.messages,
        prompt: body.prompt,
        max_tokens,
        temperature: body.temperature,
        top_p: body.top_p,
        stream: body.stream.unwrap_or(false),
    })
}

/// Bearer-key check as an ordinary middleware. An empty key set disables the
/// check; pro keys raise the caller's tier.
pub async fn auth_middleware(
    State(state): State<ApiState>,
    mut request: Request,
    next: Next,
) -> Response {
    let config = state.gateway.config();
    let tier = if config.api_keys.is_empty() && config.pro_api_keys.is_empty() {
        ClientTier::Free
    } else {
        let token = request
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::trim);
        match token {
            Some(t) if config.pro_api_keys.iter().any(|k| k == t) => ClientTier::Pro,
            Some(t) if config.api_keys.iter().any(|k| k == t) => ClientTier::Free,
            _ => {
                return GatewayError::Unauthorized("missing or invalid API key".into())
                    .into_response()
            }
        }
    };
    request.extensions_mut().insert(tier);
    next.run(request).await
}

async fn chat_completions(
    State(state): State<ApiState>,
    Extension(tier): Extension<ClientTier>,
    Json(body): Json<ChatCompletionBody>,
) -> Result<Response, GatewayError> {
    let config = state.gateway.config();
    let req = validate(body, config, tier)?;

    if req.stream {
        // an empty pool fails before the SSE stream opens
        if state.gateway.selector().candidates(&HashSet::new()).await.is_empty() {
            return Err(GatewayError::NoCandidates);
        }
        Ok(stream_completion(state, req).into_response())
    } else {
        let outcome = state.gateway.coordinator().forward(&req).await?;
        let response = ChatCompletionResponse {
            id: format!("chatcmpl-{}", Uuid::new_v4()),
            object: "chat.completion",
            created: Utc::now().timestamp(),
            model: req.model,
            choices: vec![Choice {
                index: 0,
                message: ChatMessage::new("assistant", outcome.content),
                finish_reason: "stop".into(),
            }],
            usage: Usage {
                prompt_tokens: outcome.prompt_tokens,
                completion_tokens: outcome.completion_tokens,
                total_tokens: outcome.prompt_tokens + outcome.completion_tokens,
            },
        };
        Ok(Json(response).into_response())
    }
}

fn chunk_event(id: &str, created: i64, model: &str, delta: Delta, finish: Option<&'static str>) -> Event {
    let chunk = ChatCompletionChunk {
        id: id.to_string(),
        object: "chat.completion.chunk",
        created,
        model: model.to_string(),
        choices: vec![ChunkChoice { index: 0, delta, finish_reason: finish }],
    };
    Event::default().data(serde_json::to_string(&chunk).expect("chunk serializes"))
}

/// SSE stream: role-first delta, content deltas, a terminal empty delta with
/// `finish_reason: "stop"`, then `data: [DONE]`. Comment heartbeats hold idle
/// intermediaries open while the node's prefill phase runs.
fn stream_completion(
    state: ApiState,
    req: CompletionRequest,
) -> Sse<impl futures::Stream<Item = Result<Event, Infallible>>> {
    let (event_tx, event_rx) = mpsc::channel::<Event>(64);
    let coordinator = Arc::clone(state.gateway.coordinator());
    let id = format!("chatcmpl-{}", Uuid::new_v4());
    let created = Utc::now().timestamp();
    let model = req.model.clone();

    tokio::spawn(async move {
        let _ = event_tx
            .send(chunk_event(&id, created, &model, Delta { role: Some("assistant"), content: None }, None))
            .await;

        let (chunk_tx, mut chunk_rx) = mpsc::channel::<String>(64);
        let fwd = {
            let coordinator = Arc::clone(&coordinator);
            let req = req.clone();
            tokio::spawn(async move { coordinator.forward_stream(&req, chunk_tx).await })
        };

        while let Some(chunk) = chunk_rx.recv().await {
            let event = chunk_event(
                &id,
                created,
                &model,
                Delta { role: None, content: Some(chunk) },
                None,
            );
            if event_tx.send(event).await.is_err() {
                break;
            }
        }
        // unblocks the coordinator if the client went away mid-stream
        drop(chunk_rx);

        match fwd.await {
            Ok(Ok(_)) => {
                let _ = event_tx
                    .send(chunk_event(&id, created, &model, Delta::default(), Some("stop")))
                    .await;
            }
            Ok(Err(e)) => {
                warn!(error = %e, "stream failed");
                let _ = event_tx
                    .send(Event::default().data(
                        serde_json::json!({"error": {"message": e.to_string()}}).to_string(),
                    ))
                    .await;
            }
            Err(e) => warn!(error = %e, "stream task panicked"),
        }
        let _ = event_tx.send(Event::default().data("[DONE]")).await;
    });

    let stream = futures::stream::unfold(event_rx, |mut rx| async move {
        rx.recv().await.map(|event| (Ok::<_, Infallible>(event), rx))
    });
    Sse::new(stream)
        .keep_alive(KeepAlive::new().interval(HEARTBEAT_INTERVAL).text("heartbeat"))
}

async fn list_models(State(state): State<ApiState>) -> Json<serde_json::Value> {
    let data: Vec<serde_json::Value> = state
        .gateway
        .config()
        .catalog()
        .into_iter()
        .map(|id| {
            serde_json::json!({
                "id": id,
                "object": "model",
                "owned_by": "plumise",
            })
        })
        .collect();
    Json(serde_json::json!({ "object": "list", "data": data }))
}

async fn health_check(State(state): State<ApiState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "nodes": state.gateway.registry().len(),
        "nodes_online": state.gateway.registry().online_count(),
        "workers": state.gateway.relay().worker_count(),
    }))
}

async fn get_stats(State(state): State<ApiState>) -> Json<serde_json::Value> {
    let gateway = &state.gateway;
    Json(serde_json::json!({
        "uptime_seconds": (Utc::now() - gateway.started_at()).num_seconds().max(0),
        "nodes": gateway.registry().len(),
        "nodes_online": gateway.registry().online_count(),
        "connected_workers": gateway.relay().connected_workers(),
        "total_requests": gateway.usage().total_requests(),
        "total_tokens": gateway.usage().total_tokens(),
    }))
}

async fn agent_relay_ws(
    ws: WebSocketUpgrade,
    State(state): State<ApiState>,
) -> impl IntoResponse {
    let relay = Arc::clone(state.gateway.relay());
    ws.on_upgrade(move |socket| relay.handle_socket(socket))
}

/// Build the full router: public endpoints plus the authenticated API.
pub fn router(state: ApiState) -> Router {
    let public = Router::new()
        .route("/health", get(health_check))
        .route("/api/stats", get(get_stats))
        .route("/ws/agent-relay", get(agent_relay_ws))
        .with_state(state.clone());

    let authed = Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/models", get(list_models))
        .route_layer(middleware::from_fn_with_state(state.clone(), auth_middleware))
        .with_state(state);

    public
        .merge(authed)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}
