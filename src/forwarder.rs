//! Forwarder - executes a single attempt against one candidate node
//!
//! Three protocol paths: the worker back-channel, OpenAI-compatible HTTP
//! (`/v1/chat/completions`), and pipeline HTTP (`/api/v1/generate`). Nodes of
//! unknown type are tried over the OpenAI path first; a 404 reclassifies them
//! as pipeline and the same attempt is retried once. HTTP output content is
//! passed through the channel-marker filter. Node payloads are heterogeneous
//! and parsed leniently through `serde_json::Value`.

use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

use crate::content_filter::{strip_channel_markers, ChannelFilter};
use crate::error::GatewayError;
use crate::registry::NodeRegistry;
use crate::relay::{StreamEvent, WorkerRelay};
use crate::selector::Candidate;
use crate::{CompletionRequest, NodeType};

/// Result of one successful attempt. Streaming attempts deliver content
/// through the chunk channel and leave `content` empty.
#[derive(Debug, Default)]
pub struct ForwardOutcome {
    pub content: String,
    pub prompt_tokens: Option<u64>,
    pub completion_tokens: Option<u64>,
}

fn map_reqwest_err(err: reqwest::Error, attempt_timeout: Duration) -> GatewayError {
    if err.is_connect() {
        GatewayError::ConnectionFailed(err.to_string())
    } else if err.is_timeout() {
        GatewayError::Timeout(attempt_timeout)
    } else {
        GatewayError::NodeFailure(err.to_string())
    }
}

/// Split completed lines out of an SSE byte buffer.
fn drain_lines(buf: &mut String) -> Vec<String> {
    let mut lines = Vec::new();
    while let Some(pos) = buf.find('\n') {
        lines.push(buf[..pos].trim_end_matches('\r').to_string());
        buf.drain(..=pos);
    }
    lines
}

/// Payload of a `data:` SSE line, if it is one.
fn sse_data(line: &str) -> Option<&str> {
    let rest = line.strip_prefix("data:")?;
    Some(rest.strip_prefix(' ').unwrap_or(rest))
}

pub struct Forwarder {
    http: reqwest::Client,
    registry: Arc<NodeRegistry>,
    relay: Arc<WorkerRelay>,
    attempt_timeout: Duration,
}

impl Forwarder {
    pub fn new(
        registry: Arc<NodeRegistry>,
        relay: Arc<WorkerRelay>,
        attempt_timeout: Duration,
    ) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder().timeout(attempt_timeout).build()?;
        Ok(Self { http, registry, relay, attempt_timeout })
    }

    /// Execute one unary attempt in the candidate's native protocol.
    pub async fn forward(
        &self,
        candidate: &Candidate,
        req: &CompletionRequest,
    ) -> Result<ForwardOutcome, GatewayError> {
        match candidate.node_type {
            NodeType::Relay => self.relay_unary(candidate, req).await,
            NodeType::OpenAi => self.openai_unary(&candidate.url, req).await,
            NodeType::Pipeline => self.pipeline_unary(&candidate.url, req).await,
            NodeType::Unknown => match self.openai_unary(&candidate.url, req).await {
                Ok(outcome) => {
                    self.registry.set_type(&candidate.url, NodeType::OpenAi);
                    Ok(outcome)
                }
                Err(GatewayError::ProtocolMismatch(_)) => {
                    debug!(url = %candidate.url, "404 on chat completions, retrying as pipeline");
                    self.registry.set_type(&candidate.url, NodeType::Pipeline);
                    self.pipeline_unary(&candidate.url, req).await
                }
                Err(e) => Err(e),
            },
        }
    }

    /// Execute one streaming attempt, yielding chunks in arrival order.
    pub async fn forward_stream(
        &self,
        candidate: &Candidate,
        req: &CompletionRequest,
        tx: mpsc::Sender<String>,
    ) -> Result<ForwardOutcome, GatewayError> {
        match candidate.node_type {
            NodeType::Relay => self.relay_stream(candidate, req, tx).await,
            NodeType::OpenAi => self.openai_stream(&candidate.url, req, tx).await,
            NodeType::Pipeline => self.pipeline_stream(&candidate.url, req, tx).await,
            NodeType::Unknown => match self.openai_stream(&candidate.url, req, tx.clone()).await {
                Ok(outcome) => {
                    self.registry.set_type(&candidate.url, NodeType::OpenAi);
                    Ok(outcome)
                }
                Err(GatewayError::ProtocolMismatch(_)) => {
                    debug!(url = %candidate.url, "404 on chat completions, retrying as pipeline");
                    self.registry.set_type(&candidate.url, NodeType::Pipeline);
                    self.pipeline_stream(&candidate.url, req, tx).await
                }
                Err(e) => Err(e),
            },
        }
    }

    fn relay_address<'a>(candidate: &'a Candidate) -> Result<&'a str, GatewayError> {
        candidate
            .address
            .as_deref()
            .ok_or_else(|| GatewayError::NodeFailure("relay candidate without address".into()))
    }

    async fn relay_unary(
        &self,
        candidate: &Candidate,
        req: &CompletionRequest,
    ) -> Result<ForwardOutcome, GatewayError> {
        let address = Self::relay_address(candidate)?;
        let completion = self.relay.send_request(address, req).await?;
        let usage = completion.usage.unwrap_or_default();
        Ok(ForwardOutcome {
            content: completion.content,
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens.or(usage.total_tokens),
        })
    }

    async fn relay_stream(
        &self,
        candidate: &Candidate,
        req: &CompletionRequest,
        tx: mpsc::Sender<String>,
    ) -> Result<ForwardOutcome, GatewayError> {
        let address = Self::relay_address(candidate)?;
        let mut events = self.relay.send_stream_request(address, req)?;
        loop {
            match events.recv().await {
                Some(StreamEvent::Chunk(chunk)) => {
                    if tx.send(chunk).await.is_err() {
                        return Err(GatewayError::ClientDisconnected);
                    }
                }
                Some(StreamEvent::Done(usage)) => {
                    let usage = usage.unwrap_or_default();
                    return Ok(ForwardOutcome {
                        content: String::new(),
                        prompt_tokens: usage.prompt_tokens,
                        completion_tokens: usage.completion_tokens.or(usage.total_tokens),
                    });
                }
                Some(StreamEvent::Failed(err)) => return Err(err),
                None => {
                    return Err(GatewayError::WorkerDisconnect(address.to_string()));
                }
            }
        }
    }

    fn openai_body(req: &CompletionRequest, stream: bool) -> Value {
        let mut body = json!({
            "model": req.model,
            "messages": req.as_messages(),
            "max_tokens": req.max_tokens,
            "stream": stream,
        });
        if let Some(t) = req.temperature {
            body["temperature"] = json!(t);
        }
        if let Some(p) = req.top_p {
            body["top_p"] = json!(p);
        }
        body
    }

    async fn openai_send(
        &self,
        base: &str,
        body: &Value,
    ) -> Result<reqwest::Response, GatewayError> {
        let resp = self
            .http
            .post(format!("{base}/v1/chat/completions"))
            .json(body)
            .send()
            .await
            .map_err(|e| map_reqwest_err(e, self.attempt_timeout))?;
        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(GatewayError::ProtocolMismatch(base.to_string()));
        }
        if !status.is_success() {
            return Err(GatewayError::NodeFailure(format!("chat completions returned {status}")));
        }
        Ok(resp)
    }

    async fn openai_unary(
        &self,
        base: &str,
        req: &CompletionRequest,
    ) -> Result<ForwardOutcome, GatewayError> {
        let resp = self.openai_send(base, &Self::openai_body(req, false)).await?;
        let v: Value = resp.json().await.map_err(|e| map_reqwest_err(e, self.attempt_timeout))?;
        let content = v["choices"][0]["message"]["content"].as_str().unwrap_or_default();
        Ok(ForwardOutcome {
            content: strip_channel_markers(content),
            prompt_tokens: v["usage"]["prompt_tokens"].as_u64(),
            completion_tokens: v["usage"]["completion_tokens"].as_u64(),
        })
    }

    async fn openai_stream(
        &self,
        base: &str,
        req: &CompletionRequest,
        tx: mpsc::Sender<String>,
    ) -> Result<ForwardOutcome, GatewayError> {
        let mut resp = self.openai_send(base, &Self::openai_body(req, true)).await?;
        let mut buf = String::new();
        let mut filter = ChannelFilter::new();
        let mut completion_tokens = None;
        let mut done = false;

        'read: while let Some(chunk) = resp.chunk().await.map_err(|e| map_reqwest_err(e, self.attempt_timeout))? {
            buf.push_str(&String::from_utf8_lossy(&chunk));
            for line in drain_lines(&mut buf) {
                let Some(data) = sse_data(&line) else { continue };
                if data == "[DONE]" {
                    done = true;
                    break 'read;
                }
                let Ok(v) = serde_json::from_str::<Value>(data) else { continue };
                if let Some(tokens) = v["usage"]["completion_tokens"].as_u64() {
                    completion_tokens = Some(tokens);
                }
                if let Some(delta) = v["choices"][0]["delta"]["content"].as_str() {
                    let emitted = filter.push(delta);
                    if !emitted.is_empty() && tx.send(emitted).await.is_err() {
                        return Err(GatewayError::ClientDisconnected);
                    }
                }
            }
        }

        if !done {
            return Err(GatewayError::NodeFailure("stream interrupted before completion".into()));
        }
        let tail = filter.finish();
        if !tail.is_empty() {
            let _ = tx.send(tail).await;
        }
        Ok(ForwardOutcome { content: String::new(), prompt_tokens: None, completion_tokens })
    }

    fn pipeline_body(req: &CompletionRequest, stream: bool) -> Value {
        let mut parameters = json!({ "max_new_tokens": req.max_tokens });
        if let Some(t) = req.temperature {
            parameters["temperature"] = json!(t);
        }
        if let Some(p) = req.top_p {
            parameters["top_p"] = json!(p);
        }
        let mut body = json!({ "inputs": req.as_prompt(), "parameters": parameters });
        if stream {
            body["stream"] = json!(true);
        }
        body
    }

    async fn pipeline_send(
        &self,
        base: &str,
        body: &Value,
    ) -> Result<reqwest::Response, GatewayError> {
        let resp = self
            .http
            .post(format!("{base}/api/v1/generate"))
            .json(body)
            .send()
            .await
            .map_err(|e| map_reqwest_err(e, self.attempt_timeout))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(GatewayError::NodeFailure(format!("pipeline generate returned {status}")));
        }
        Ok(resp)
    }

    async fn pipeline_unary(
        &self,
        base: &str,
        req: &CompletionRequest,
    ) -> Result<ForwardOutcome, GatewayError> {
        let resp = self.pipeline_send(base, &Self::pipeline_body(req, false)).await?;
        let v: Value = resp.json().await.map_err(|e| map_reqwest_err(e, self.attempt_timeout))?;
        if let Some(err) = v["error"].as_str() {
            return Err(GatewayError::NodeFailure(err.to_string()));
        }
        let content = v["generated_text"].as_str().unwrap_or_default();
        Ok(ForwardOutcome {
            content: strip_channel_markers(content),
            prompt_tokens: None,
            completion_tokens: v["num_tokens"].as_u64(),
        })
    }

    /// Extract the token text from a pipeline stream frame: a bare string or
    /// an object with a `text` field.
    fn pipeline_token(v: &Value) -> Option<String> {
        match &v["token"] {
            Value::String(s) => Some(s.clone()),
            Value::Object(_) => v["token"]["text"].as_str().map(str::to_string),
            _ => None,
        }
    }

    async fn pipeline_stream(
        &self,
        base: &str,
        req: &CompletionRequest,
        tx: mpsc::Sender<String>,
    ) -> Result<ForwardOutcome, GatewayError> {
        let mut resp = self.pipeline_send(base, &Self::pipeline_body(req, true)).await?;
        let mut buf = String::new();
        let mut filter = ChannelFilter::new();
        let mut completion_tokens = None;

        while let Some(chunk) = resp.chunk().await.map_err(|e| map_reqwest_err(e, self.attempt_timeout))? {
            buf.push_str(&String::from_utf8_lossy(&chunk));
            for line in drain_lines(&mut buf) {
                let Some(data) = sse_data(&line) else { continue };
                let piece = match serde_json::from_str::<Value>(data) {
                    Ok(v) => {
                        if let Some(err) = v["error"].as_str() {
                            return Err(GatewayError::NodeFailure(err.to_string()));
                        }
                        if let Some(tokens) = v["num_tokens"].as_u64() {
                            completion_tokens = Some(tokens);
                        }
                        Self::pipeline_token(&v)
                    }
                    // malformed frame: fall back to the raw data
                    Err(_) => Some(data.to_string()),
                };
                if let Some(piece) = piece {
                    let emitted = filter.push(&piece);
                    if !emitted.is_empty() && tx.send(emitted).await.is_err() {
                        return Err(GatewayError::ClientDisconnected);
                    }
                }
            }
        }

        let tail = filter.finish();
        if !tail.is_empty() {
            let _ = tx.send(tail).await;
        }
        Ok(ForwardOutcome { content: String::new(), prompt_tokens: None, completion_tokens })
    }
}
