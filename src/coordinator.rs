//! Retry Coordinator - drives the candidate loop for one client request
//!
//! Builds the candidate pool once, then attempts candidates one at a time
//! (capped at five), excluding each tried node. Failed attempts penalize the
//! node; connection errors force it offline immediately. For streams, output
//! already yielded to the caller is accumulated and embedded into a
//! continuation request so the caller sees one seamless, monotonically
//! growing stream across node failures.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::GatewayError;
use crate::forwarder::{ForwardOutcome, Forwarder};
use crate::registry::NodeRegistry;
use crate::selector::{Candidate, CandidateSelector};
use crate::usage::UsageTracker;
use crate::{estimate_tokens, ChatMessage, CompletionRequest};

const MAX_RETRIES: usize = 5;

const CONTINUE_INSTRUCTION: &str =
    "Continue generating from exactly where you left off. Do not repeat any text.";

/// Final result of a coordinated request, with the serving node attached
/// for accounting.
#[derive(Debug)]
pub struct CompletionOutcome {
    pub content: String,
    pub node_url: String,
    pub node_address: Option<String>,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

/// Build the follow-up request for a retry after a partial stream. Chat
/// requests get the accumulated text as an assistant turn plus a continue
/// instruction; prompt-only requests get it appended to the prompt body.
/// Sampling parameters and max_tokens are left unchanged.
pub fn continuation_request(original: &CompletionRequest, accumulated: &str) -> CompletionRequest {
    let mut req = original.clone();
    if !req.messages.is_empty() {
        req.messages.push(ChatMessage::new("assistant", accumulated));
        req.messages.push(ChatMessage::new("user", CONTINUE_INSTRUCTION));
    } else {
        let prompt = req.prompt.take().unwrap_or_default();
        req.prompt =
            Some(format!("{prompt}\n\nAssistant (partial, continue from here): {accumulated}"));
    }
    req
}

fn prompt_estimate(req: &CompletionRequest) -> u64 {
    let mut text = String::new();
    if let Some(prompt) = &req.prompt {
        text.push_str(prompt);
    }
    for m in &req.messages {
        text.push_str(&m.content);
    }
    estimate_tokens(&text)
}

pub struct RetryCoordinator {
    selector: Arc<CandidateSelector>,
    forwarder: Arc<Forwarder>,
    registry: Arc<NodeRegistry>,
    usage: Arc<UsageTracker>,
}

impl RetryCoordinator {
    pub fn new(
        selector: Arc<CandidateSelector>,
        forwarder: Arc<Forwarder>,
        registry: Arc<NodeRegistry>,
        usage: Arc<UsageTracker>,
    ) -> Self {
        Self { selector, forwarder, registry, usage }
    }

    fn note_failure(&self, candidate: &Candidate, err: &GatewayError) {
        self.registry.increment_failure(&candidate.url);
        if err.is_connection_error() {
            self.registry.set_status(&candidate.url, crate::NodeStatus::Offline);
        }
    }

    fn usage_key(candidate: &Candidate) -> String {
        candidate.address.clone().unwrap_or_else(|| candidate.url.clone())
    }

    fn record_success(
        &self,
        candidate: &Candidate,
        req: &CompletionRequest,
        outcome: &ForwardOutcome,
        content: &str,
        started: Instant,
    ) -> CompletionOutcome {
        self.registry.reset_failure(&candidate.url);
        let prompt_tokens = outcome.prompt_tokens.unwrap_or_else(|| prompt_estimate(req));
        let completion_tokens =
            outcome.completion_tokens.unwrap_or_else(|| estimate_tokens(content));
        self.usage.record(
            &Self::usage_key(candidate),
            prompt_tokens + completion_tokens,
            started.elapsed(),
        );
        CompletionOutcome {
            content: content.to_string(),
            node_url: candidate.url.clone(),
            node_address: candidate.address.clone(),
            prompt_tokens,
            completion_tokens,
        }
    }

    /// Unary path: try candidates until one succeeds.
    pub async fn forward(
        &self,
        req: &CompletionRequest,
    ) -> Result<CompletionOutcome, GatewayError> {
        let pool = self.selector.candidates(&HashSet::new()).await;
        if pool.is_empty() {
            return Err(GatewayError::NoCandidates);
        }
        let retries = pool.len().min(MAX_RETRIES);
        let mut excluded = HashSet::new();

        for attempt in 1..=retries {
            let Some(candidate) = self.selector.pick(&excluded).await else { break };
            excluded.insert(candidate.url.clone());
            let _guard = self.registry.begin_dispatch(&candidate.url);
            let started = Instant::now();
            debug!(attempt, url = %candidate.url, node_type = %candidate.node_type, "dispatching");

            match self.forwarder.forward(&candidate, req).await {
                Ok(outcome) => {
                    let content = outcome.content.clone();
                    return Ok(self.record_success(&candidate, req, &outcome, &content, started));
                }
                Err(err @ (GatewayError::Shutdown | GatewayError::ClientDisconnected)) => {
                    return Err(err);
                }
                Err(err) => {
                    self.note_failure(&candidate, &err);
                    warn!(attempt, url = %candidate.url, error = %err, "attempt failed");
                }
            }
        }
        Err(GatewayError::AllNodesFailed)
    }

    /// Streaming path: chunks go to `out` in arrival order; on a mid-stream
    /// failure the next candidate receives a continuation request and the
    /// caller-visible stream keeps growing without a seam.
    pub async fn forward_stream(
        &self,
        req: &CompletionRequest,
        out: mpsc::Sender<String>,
    ) -> Result<CompletionOutcome, GatewayError> {
        let pool = self.selector.candidates(&HashSet::new()).await;
        if pool.is_empty() {
            return Err(GatewayError::NoCandidates);
        }
        let retries = pool.len().min(MAX_RETRIES);
        let mut excluded = HashSet::new();
        let mut accumulated = String::new();

        for attempt in 1..=retries {
            let Some(candidate) = self.selector.pick(&excluded).await else { break };
            excluded.insert(candidate.url.clone());
            let _guard = self.registry.begin_dispatch(&candidate.url);
            let started = Instant::now();
            debug!(attempt, url = %candidate.url, node_type = %candidate.node_type, "dispatching stream");

            let effective = if accumulated.is_empty() {
                req.clone()
            } else {
                continuation_request(req, &accumulated)
            };

            let (tx, mut rx) = mpsc::channel::<String>(64);
            let mut fwd = Box::pin(self.forwarder.forward_stream(&candidate, &effective, tx));
            let mut fwd_result: Option<Result<ForwardOutcome, GatewayError>> = None;

            let result = loop {
                tokio::select! {
                    r = &mut fwd, if fwd_result.is_none() => fwd_result = Some(r),
                    maybe = rx.recv() => match maybe {
                        Some(chunk) => {
                            accumulated.push_str(&chunk);
                            if out.send(chunk).await.is_err() {
                                break Err(GatewayError::ClientDisconnected);
                            }
                        }
                        None => {
                            break fwd_result.take().unwrap_or_else(|| {
                                Err(GatewayError::NodeFailure("stream closed unexpectedly".into()))
                            });
                        }
                    }
                }
            };

            match result {
                Ok(outcome) => {
                    return Ok(self.record_success(
                        &candidate,
                        &effective,
                        &outcome,
                        &accumulated,
                        started,
                    ));
                }
                Err(err @ (GatewayError::Shutdown | GatewayError::ClientDisconnected)) => {
                    return Err(err);
                }
                Err(err) => {
                    self.note_failure(&candidate, &err);
                    warn!(attempt, url = %candidate.url, error = %err, "stream attempt failed");
                }
            }
        }
        Err(GatewayError::AllNodesFailed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::NodeSeed;
    use crate::relay::{RelayConfig, WorkerRelay};
    use crate::selector::CandidateSelector;
    use crate::{NodeStatus, NodeType, TimeoutConfig};
    use std::time::Duration;
    use tokio::sync::RwLock;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct Harness {
        registry: Arc<NodeRegistry>,
        usage: Arc<UsageTracker>,
        coordinator: RetryCoordinator,
    }

    fn harness() -> Harness {
        let registry = Arc::new(NodeRegistry::new(false, 3, Duration::from_secs(30)));
        let relay = Arc::new(WorkerRelay::new(
            RelayConfig::from(&TimeoutConfig::default()),
            Arc::clone(&registry),
        ));
        let topology = Arc::new(RwLock::new(None));
        let selector = Arc::new(CandidateSelector::new(
            Arc::clone(&registry),
            Arc::clone(&relay),
            topology,
        ));
        let forwarder = Arc::new(
            Forwarder::new(Arc::clone(&registry), relay, Duration::from_secs(5)).unwrap(),
        );
        let usage = Arc::new(UsageTracker::new(
            None,
            None,
            Duration::from_secs(60),
            Duration::from_secs(10),
        ));
        let coordinator = RetryCoordinator::new(
            selector,
            forwarder,
            Arc::clone(&registry),
            Arc::clone(&usage),
        );
        Harness { registry, usage, coordinator }
    }

    fn online(node_type: NodeType) -> NodeSeed {
        NodeSeed { address: None, node_type, capacity: 1.0, status: NodeStatus::Online }
    }

    fn request(stream: bool) -> CompletionRequest {
        CompletionRequest {
            model: "m".into(),
            messages: vec![ChatMessage::new("user", "hi")],
            prompt: None,
            max_tokens: 16,
            temperature: None,
            top_p: None,
            stream,
        }
    }

    #[test]
    fn continuation_embeds_accumulated_text() {
        let req = request(true);
        let cont = continuation_request(&req, "Hello world");
        assert_eq!(cont.messages.len(), 3);
        assert_eq!(cont.messages[1].role, "assistant");
        assert_eq!(cont.messages[1].content, "Hello world");
        assert_eq!(cont.messages[2].role, "user");
        assert_eq!(cont.messages[2].content, CONTINUE_INSTRUCTION);
        assert_eq!(cont.max_tokens, req.max_tokens);
    }

    #[test]
    fn continuation_for_prompt_only_requests() {
        let req = CompletionRequest {
            model: "m".into(),
            messages: vec![],
            prompt: Some("Once upon a time".into()),
            max_tokens: 16,
            temperature: None,
            top_p: None,
            stream: true,
        };
        let cont = continuation_request(&req, "there was");
        assert!(cont.messages.is_empty());
        let prompt = cont.prompt.unwrap();
        assert!(prompt.starts_with("Once upon a time"));
        assert!(prompt.contains("Assistant (partial, continue from here): there was"));
    }

    #[tokio::test]
    async fn empty_pool_is_service_unavailable() {
        let h = harness();
        assert!(matches!(
            h.coordinator.forward(&request(false)).await,
            Err(GatewayError::NoCandidates)
        ));
    }

    #[tokio::test]
    async fn failover_on_5xx_reaches_the_healthy_node() {
        let bad = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&bad)
            .await;

        let good = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"role": "assistant", "content": "from B"}}],
                "usage": {"prompt_tokens": 2, "completion_tokens": 2}
            })))
            .mount(&good)
            .await;

        let h = harness();
        h.registry.insert_unchecked(&bad.uri(), online(NodeType::OpenAi));
        h.registry.insert_unchecked(&good.uri(), online(NodeType::OpenAi));

        let outcome = h.coordinator.forward(&request(false)).await.unwrap();
        assert_eq!(outcome.content, "from B");
        assert_eq!(outcome.node_url, good.uri());

        // failed node penalized but below threshold stays online
        let bad_node = h.registry.get(&bad.uri()).unwrap();
        assert_eq!(bad_node.consecutive_failures, 1);
        assert_eq!(bad_node.status, NodeStatus::Online);
        // healthy node's counter reset
        assert_eq!(h.registry.get(&good.uri()).unwrap().consecutive_failures, 0);
        // in-flight returned to zero on every exit path
        assert_eq!(h.registry.get(&bad.uri()).unwrap().in_flight, 0);
        assert_eq!(h.registry.get(&good.uri()).unwrap().in_flight, 0);
    }

    #[tokio::test]
    async fn exhausted_candidates_surface_all_nodes_failed() {
        let bad = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&bad)
            .await;

        let h = harness();
        h.registry.insert_unchecked(&bad.uri(), online(NodeType::OpenAi));
        assert!(matches!(
            h.coordinator.forward(&request(false)).await,
            Err(GatewayError::AllNodesFailed)
        ));
    }

    #[tokio::test]
    async fn repeated_failures_cool_the_node_down() {
        let bad = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&bad)
            .await;

        let h = harness();
        h.registry.insert_unchecked(&bad.uri(), online(NodeType::OpenAi));

        for _ in 0..3 {
            let _ = h.coordinator.forward(&request(false)).await;
        }
        let node = h.registry.get(&bad.uri()).unwrap();
        assert_eq!(node.status, NodeStatus::Offline);
        assert!(node.cooldown_until.is_some());

        // offline + cooldown means the pool is now empty
        assert!(matches!(
            h.coordinator.forward(&request(false)).await,
            Err(GatewayError::NoCandidates)
        ));
    }

    #[tokio::test]
    async fn streaming_continuation_across_node_failure() {
        // Both nodes serve the same behavior keyed on request shape: a fresh
        // request streams a partial answer and drops; a continuation request
        // (recognized by the continue instruction) finishes the sentence.
        let partial_body = concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hello \"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"world\"}}]}\n\n",
        );
        let continuation_body = concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"!\"}}]}\n\n",
            "data: [DONE]\n\n",
        );

        let mut servers = Vec::new();
        for _ in 0..2 {
            let server = MockServer::start().await;
            Mock::given(method("POST"))
                .and(path("/v1/chat/completions"))
                .and(body_string_contains("Do not repeat any text"))
                .respond_with(
                    ResponseTemplate::new(200).set_body_raw(continuation_body, "text/event-stream"),
                )
                .with_priority(1)
                .mount(&server)
                .await;
            Mock::given(method("POST"))
                .and(path("/v1/chat/completions"))
                .respond_with(
                    ResponseTemplate::new(200).set_body_raw(partial_body, "text/event-stream"),
                )
                .with_priority(5)
                .mount(&server)
                .await;
            servers.push(server);
        }

        let h = harness();
        for server in &servers {
            h.registry.insert_unchecked(&server.uri(), online(NodeType::OpenAi));
        }

        let (tx, mut rx) = mpsc::channel(64);
        let outcome = h.coordinator.forward_stream(&request(true), tx).await.unwrap();

        let mut collected = String::new();
        while let Some(chunk) = rx.recv().await {
            collected.push_str(&chunk);
        }
        assert_eq!(collected, "Hello world!");
        assert_eq!(outcome.content, "Hello world!");

        // the failed first node was penalized, the finisher was not
        let failures: Vec<u32> = servers
            .iter()
            .map(|s| h.registry.get(&s.uri()).unwrap().consecutive_failures)
            .collect();
        assert!(failures.contains(&1));
        assert!(failures.contains(&0));
    }

    #[tokio::test]
    async fn usage_is_recorded_after_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"role": "assistant", "content": "ok"}}],
                "usage": {"prompt_tokens": 7, "completion_tokens": 5}
            })))
            .mount(&server)
            .await;

        let h = harness();
        h.registry.insert_unchecked(
            &server.uri(),
            NodeSeed { address: Some("0xW".into()), ..online(NodeType::OpenAi) },
        );

        let outcome = h.coordinator.forward(&request(false)).await.unwrap();
        assert_eq!(outcome.prompt_tokens, 7);
        assert_eq!(outcome.completion_tokens, 5);
        assert_eq!(outcome.node_address.as_deref(), Some("0xw"));

        let aggregates = h.usage.snapshot();
        assert_eq!(aggregates.len(), 1);
        assert_eq!(aggregates[0].wallet, "0xw");
        assert_eq!(aggregates[0].tokens, 12);
        assert_eq!(aggregates[0].requests, 1);
    }
}
