//! Inference Gateway - node router and worker relay
//!
//! Accepts OpenAI-compatible completion requests from authenticated clients
//! and forwards them to a pool of remote inference nodes. Nodes are discovered
//! from static configuration, from a discovery service ("Oracle"), and from a
//! persistent back-channel of worker-initiated WebSocket connections. The
//! gateway balances load by capacity and in-flight depth, survives node
//! failures mid-request with streaming continuation, and reports per-worker
//! usage back to the Oracle.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::info;

pub mod api;
pub mod content_filter;
pub mod coordinator;
pub mod discovery;
pub mod error;
pub mod forwarder;
pub mod health;
pub mod oracle;
pub mod registry;
pub mod relay;
pub mod selector;
pub mod signature;
pub mod usage;

pub use error::GatewayError;

/// How a node is spoken to. Controls which forwarding protocol is used.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    /// OpenAI-compatible chat-completion server
    OpenAi,
    /// Pipeline-parallel shard server (`/api/v1/generate`)
    Pipeline,
    /// Worker reachable only over the back-channel
    Relay,
    /// Not yet probed; the forwarder tries OpenAI first
    Unknown,
}

impl std::fmt::Display for NodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeType::OpenAi => write!(f, "openai"),
            NodeType::Pipeline => write!(f, "pipeline"),
            NodeType::Relay => write!(f, "relay"),
            NodeType::Unknown => write!(f, "unknown"),
        }
    }
}

/// Node availability as tracked by the registry
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Online,
    Offline,
}

/// One chat turn, shared between the client API and every node protocol
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self { role: role.into(), content: content.into() }
    }
}

/// Internal, validated completion request. Carries either chat `messages`
/// or a raw `prompt`; the pipeline protocol and streaming continuation need
/// the prompt form.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub prompt: Option<String>,
    pub max_tokens: u32,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub stream: bool,
}

impl CompletionRequest {
    /// Messages view of the request; a prompt-only request becomes a single
    /// user message for protocols that only speak chat.
    pub fn as_messages(&self) -> Vec<ChatMessage> {
        if !self.messages.is_empty() {
            self.messages.clone()
        } else {
            vec![ChatMessage::new("user", self.prompt.clone().unwrap_or_default())]
        }
    }

    /// Prompt view of the request for the pipeline protocol.
    pub fn as_prompt(&self) -> String {
        if let Some(prompt) = &self.prompt {
            if self.messages.is_empty() {
                return prompt.clone();
            }
        }
        let mut out = String::new();
        for m in &self.messages {
            out.push_str(&m.role);
            out.push_str(": ");
            out.push_str(&m.content);
            out.push('\n');
        }
        out.push_str("assistant: ");
        out
    }
}

/// Timeout knobs, all from the configuration surface
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Health probe request timeout in seconds
    pub health_secs: u64,
    /// Per-attempt forwarding timeout in seconds (unary and streaming)
    pub attempt_secs: u64,
    /// Worker auth handshake budget in seconds
    pub auth_handshake_secs: u64,
    /// Worker ping cadence in seconds
    pub worker_ping_secs: u64,
    /// Pending-stream inactivity deadline in seconds
    pub relay_inactivity_secs: u64,
    /// Usage aggregates with no update for this long are evicted
    pub stale_aggregate_secs: u64,
    /// Oracle discovery poll cadence in seconds
    pub oracle_poll_secs: u64,
    /// Health probe cadence in seconds
    pub health_poll_secs: u64,
    /// Usage report cadence in seconds
    pub usage_report_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            health_secs: 5,
            attempt_secs: 120,
            auth_handshake_secs: 10,
            worker_ping_secs: 30,
            relay_inactivity_secs: 120,
            stale_aggregate_secs: 60,
            oracle_poll_secs: 30,
            health_poll_secs: 30,
            usage_report_secs: 10,
        }
    }
}

/// Per-tier request limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierConfig {
    pub free_max_tokens: u32,
    pub pro_max_tokens: u32,
    /// Recognized for the external rate limiter; not enforced here
    pub free_requests_per_window: u32,
}

impl Default for TierConfig {
    fn default() -> Self {
        Self { free_max_tokens: 1024, pro_max_tokens: 4096, free_requests_per_window: 60 }
    }
}

/// Gateway configuration, read from the environment by the binary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Oracle base URL; enables discovery polling and usage reporting
    pub oracle_url: Option<String>,
    /// Seed nodes from static configuration
    pub static_node_urls: Vec<String>,
    /// Skip the private-range rejection in URL validation
    pub allow_private_ips: bool,
    /// Model id used for topology queries and as the default protocol model
    pub default_model: String,
    /// Static model catalog served at /v1/models
    pub models: Vec<String>,
    /// Models that require the pro tier; free-tier requests for them are
    /// rejected outright
    pub pro_models: Vec<String>,
    /// Client bearer keys; empty disables the check (development mode)
    pub api_keys: Vec<String>,
    /// Keys granted the pro tier
    pub pro_api_keys: Vec<String>,
    /// Hex secp256k1 key used to sign usage reports, if configured
    pub gateway_wallet_key: Option<String>,
    /// Consecutive failures before a node goes offline
    pub failure_threshold: u32,
    /// Cooldown after crossing the failure threshold, in seconds
    pub cooldown_secs: u64,
    pub tier: TierConfig,
    pub timeouts: TimeoutConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            oracle_url: None,
            static_node_urls: Vec::new(),
            allow_private_ips: false,
            default_model: "plumise-chat".to_string(),
            models: Vec::new(),
            pro_models: Vec::new(),
            api_keys: Vec::new(),
            pro_api_keys: Vec::new(),
            gateway_wallet_key: None,
            failure_threshold: 3,
            cooldown_secs: 30,
            tier: TierConfig::default(),
            timeouts: TimeoutConfig::default(),
        }
    }
}

fn env_list(name: &str) -> Vec<String> {
    std::env::var(name)
        .map(|v| v.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
        .unwrap_or_default()
}

impl GatewayConfig {
    /// Build a configuration from the recognized environment variables.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        cfg.oracle_url = std::env::var("ORACLE_URL").ok().filter(|v| !v.is_empty());
        cfg.static_node_urls = env_list("STATIC_NODE_URLS");
        cfg.allow_private_ips = std::env::var("ALLOW_PRIVATE_IPS")
            .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);
        if let Ok(model) = std::env::var("DEFAULT_MODEL") {
            if !model.is_empty() {
                cfg.default_model = model;
            }
        }
        cfg.models = env_list("MODELS");
        cfg.pro_models = env_list("PRO_MODELS");
        cfg.api_keys = env_list("API_KEYS");
        cfg.pro_api_keys = env_list("PRO_API_KEYS");
        cfg.gateway_wallet_key =
            std::env::var("GATEWAY_WALLET_KEY").ok().filter(|v| !v.is_empty());
        if let Some(n) = env_u32("FREE_MAX_TOKENS") {
            cfg.tier.free_max_tokens = n;
        }
        if let Some(n) = env_u32("PRO_MAX_TOKENS") {
            cfg.tier.pro_max_tokens = n;
        }
        if let Some(n) = env_u32("FREE_REQUESTS_PER_WINDOW") {
            cfg.tier.free_requests_per_window = n;
        }
        if let Some(n) = env_u64("HEALTH_TIMEOUT_SECS") {
            cfg.timeouts.health_secs = n;
        }
        if let Some(n) = env_u64("ATTEMPT_TIMEOUT_SECS") {
            cfg.timeouts.attempt_secs = n;
        }
        if let Some(n) = env_u64("ORACLE_POLL_SECS") {
            cfg.timeouts.oracle_poll_secs = n;
        }
        if let Some(n) = env_u64("HEALTH_POLL_SECS") {
            cfg.timeouts.health_poll_secs = n;
        }
        if let Some(n) = env_u64("USAGE_REPORT_SECS") {
            cfg.timeouts.usage_report_secs = n;
        }
        if let Some(n) = env_u32("NODE_FAILURE_THRESHOLD") {
            cfg.failure_threshold = n;
        }
        if let Some(n) = env_u64("NODE_COOLDOWN_SECS") {
            cfg.cooldown_secs = n;
        }
        cfg
    }

    /// At least one node source must be configured.
    pub fn validate(&self) -> Result<()> {
        if self.oracle_url.is_none() && self.static_node_urls.is_empty() {
            anyhow::bail!("either ORACLE_URL or STATIC_NODE_URLS must be configured");
        }
        Ok(())
    }

    /// The model catalog (free and pro-gated entries), falling back to the
    /// default model.
    pub fn catalog(&self) -> Vec<String> {
        let mut catalog = self.models.clone();
        for model in &self.pro_models {
            if !catalog.contains(model) {
                catalog.push(model.clone());
            }
        }
        if catalog.is_empty() {
            catalog.push(self.default_model.clone());
        }
        catalog
    }

    /// Whether a model is gated behind the pro tier.
    pub fn requires_pro(&self, model: &str) -> bool {
        self.pro_models.iter().any(|m| m == model)
    }
}

fn env_u32(name: &str) -> Option<u32> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

/// Rough token estimate used when a node does not report usage. One token
/// per four characters, floored at one.
pub fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() as u64 / 4).max(1)
}

/// Main gateway structure wiring every component together
pub struct InferenceGateway {
    config: GatewayConfig,
    registry: Arc<registry::NodeRegistry>,
    relay: Arc<relay::WorkerRelay>,
    selector: Arc<selector::CandidateSelector>,
    coordinator: Arc<coordinator::RetryCoordinator>,
    usage: Arc<usage::UsageTracker>,
    prober: Arc<health::HealthProber>,
    discovery: Option<Arc<discovery::OracleDiscovery>>,
    shutdown_tx: Mutex<Option<broadcast::Sender<()>>>,
    started_at: DateTime<Utc>,
}

impl InferenceGateway {
    pub fn new(config: GatewayConfig) -> Result<Self> {
        config.validate()?;

        let registry = Arc::new(registry::NodeRegistry::new(
            config.allow_private_ips,
            config.failure_threshold,
            Duration::from_secs(config.cooldown_secs),
        ));

        // Static seeds join the registry up front; the first probe pass
        // brings them online.
        for url in &config.static_node_urls {
            registry.upsert(url, registry::NodeSeed::default())?;
        }

        let relay = Arc::new(relay::WorkerRelay::new(
            relay::RelayConfig::from(&config.timeouts),
            Arc::clone(&registry),
        ));

        let oracle = config
            .oracle_url
            .as_ref()
            .map(|base| Arc::new(oracle::OracleClient::new(base.clone())));

        let topology = Arc::new(RwLock::new(None));
        let selector = Arc::new(selector::CandidateSelector::new(
            Arc::clone(&registry),
            Arc::clone(&relay),
            Arc::clone(&topology),
        ));

        let forwarder = Arc::new(forwarder::Forwarder::new(
            Arc::clone(&registry),
            Arc::clone(&relay),
            Duration::from_secs(config.timeouts.attempt_secs),
        )?);

        let usage = Arc::new(usage::UsageTracker::new(
            oracle.clone(),
            config.gateway_wallet_key.clone(),
            Duration::from_secs(config.timeouts.stale_aggregate_secs),
            Duration::from_secs(config.timeouts.usage_report_secs),
        ));

        let coordinator = Arc::new(coordinator::RetryCoordinator::new(
            Arc::clone(&selector),
            forwarder,
            Arc::clone(&registry),
            Arc::clone(&usage),
        ));

        let prober = Arc::new(health::HealthProber::new(
            Arc::clone(&registry),
            Duration::from_secs(config.timeouts.health_secs),
            Duration::from_secs(config.timeouts.health_poll_secs),
        )?);

        let discovery = oracle.as_ref().map(|client| {
            Arc::new(discovery::OracleDiscovery::new(
                Arc::clone(client),
                Arc::clone(&registry),
                Arc::clone(&topology),
                Arc::clone(&prober),
                config.default_model.clone(),
                Duration::from_secs(config.timeouts.oracle_poll_secs),
            ))
        });

        Ok(Self {
            config,
            registry,
            relay,
            selector,
            coordinator,
            usage,
            prober,
            discovery,
            shutdown_tx: Mutex::new(None),
            started_at: Utc::now(),
        })
    }

    /// Start every background service.
    pub async fn start(&self) -> Result<()> {
        let (shutdown_tx, _) = broadcast::channel(1);
        *self.shutdown_tx.lock().await = Some(shutdown_tx.clone());

        self.prober.start(shutdown_tx.subscribe());
        self.relay.start(shutdown_tx.subscribe());
        self.usage.start(shutdown_tx.subscribe());
        if let Some(discovery) = &self.discovery {
            discovery.start(shutdown_tx.subscribe());
        }

        info!(
            static_nodes = self.config.static_node_urls.len(),
            oracle = self.config.oracle_url.is_some(),
            "inference gateway started"
        );
        Ok(())
    }

    /// Build the client-facing HTTP router.
    pub fn router(self: &Arc<Self>) -> axum::Router {
        api::router(api::ApiState::new(Arc::clone(self)))
    }

    /// Stop timer loops, fail pendings, and close worker sockets.
    pub async fn shutdown(&self) {
        if let Some(tx) = self.shutdown_tx.lock().await.take() {
            let _ = tx.send(());
        }
        self.relay.shutdown().await;
        info!("inference gateway shutdown complete");
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<registry::NodeRegistry> {
        &self.registry
    }

    pub fn relay(&self) -> &Arc<relay::WorkerRelay> {
        &self.relay
    }

    pub fn selector(&self) -> &Arc<selector::CandidateSelector> {
        &self.selector
    }

    pub fn coordinator(&self) -> &Arc<coordinator::RetryCoordinator> {
        &self.coordinator
    }

    pub fn usage(&self) -> &Arc<usage::UsageTracker> {
        &self.usage
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_requires_a_node_source() {
        let cfg = GatewayConfig::default();
        assert!(cfg.validate().is_err());

        let mut with_static = GatewayConfig::default();
        with_static.static_node_urls = vec!["http://n1.example.com".into()];
        assert!(with_static.validate().is_ok());

        let mut with_oracle = GatewayConfig::default();
        with_oracle.oracle_url = Some("http://oracle.example.com".into());
        assert!(with_oracle.validate().is_ok());
    }

    #[test]
    fn prompt_view_flattens_messages() {
        let req = CompletionRequest {
            model: "m".into(),
            messages: vec![
                ChatMessage::new("system", "be brief"),
                ChatMessage::new("user", "hi"),
            ],
            prompt: None,
            max_tokens: 16,
            temperature: None,
            top_p: None,
            stream: false,
        };
        let prompt = req.as_prompt();
        assert!(prompt.contains("system: be brief\n"));
        assert!(prompt.contains("user: hi\n"));
        assert!(prompt.ends_with("assistant: "));
    }

    #[test]
    fn messages_view_wraps_prompt() {
        let req = CompletionRequest {
            model: "m".into(),
            messages: vec![],
            prompt: Some("tell me a story".into()),
            max_tokens: 16,
            temperature: None,
            top_p: None,
            stream: false,
        };
        let msgs = req.as_messages();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].role, "user");
        assert_eq!(msgs[0].content, "tell me a story");
    }

    #[test]
    fn catalog_merges_free_and_pro_models() {
        let mut cfg = GatewayConfig::default();
        assert_eq!(cfg.catalog(), vec!["plumise-chat".to_string()]);

        cfg.models = vec!["plumise-chat".into()];
        cfg.pro_models = vec!["plumise-large".into(), "plumise-chat".into()];
        assert_eq!(cfg.catalog(), vec!["plumise-chat".to_string(), "plumise-large".to_string()]);
        assert!(cfg.requires_pro("plumise-large"));
        assert!(!cfg.requires_pro("plumise-mini"));
    }

    #[test]
    fn token_estimate_is_floored() {
        assert_eq!(estimate_tokens(""), 1);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcdefgh"), 2);
    }

    #[tokio::test]
    async fn gateway_creation() {
        let mut config = GatewayConfig::default();
        config.static_node_urls = vec!["http://node-a.example.com:8080".into()];
        let gateway = InferenceGateway::new(config).unwrap();
        assert_eq!(gateway.registry().snapshot_all().len(), 1);
    }
}
