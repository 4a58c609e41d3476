//! Health Prober - periodic probing of every registered node
//!
//! Runs over a snapshot of the registry on a fixed cadence. A successful
//! `GET {url}/health` brings the node online, clears its failure counter,
//! and infers its type from the probe body: a `mode: pipeline` report makes
//! it a pipeline node, otherwise an unknown node becomes OpenAI-compatible.
//! Failures go through the registry's failure accounting, so crossing the
//! threshold flips the node offline and starts its cooldown. Relay
//! identities have no HTTP surface and are skipped.

use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::registry::{NodeRegistry, RELAY_SCHEME};
use crate::NodeType;

pub struct HealthProber {
    registry: Arc<NodeRegistry>,
    http: reqwest::Client,
    poll_interval: Duration,
}

impl HealthProber {
    pub fn new(
        registry: Arc<NodeRegistry>,
        probe_timeout: Duration,
        poll_interval: Duration,
    ) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder().timeout(probe_timeout).build()?;
        Ok(Self { registry, http, poll_interval })
    }

    /// Probe one node and apply the outcome to the registry.
    pub async fn probe_node(&self, url: &str) {
        if url.starts_with(RELAY_SCHEME) {
            return;
        }
        match self.http.get(format!("{url}/health")).send().await {
            Ok(resp) if resp.status().is_success() => {
                let body: Value = resp.json().await.unwrap_or(Value::Null);
                if body["mode"].as_str() == Some("pipeline") {
                    self.registry.set_type(url, NodeType::Pipeline);
                } else if let Some(node) = self.registry.get(url) {
                    if node.node_type == NodeType::Unknown {
                        self.registry.set_type(url, NodeType::OpenAi);
                    }
                }
                self.registry.mark_online(url);
                debug!(url = %url, "health probe ok");
            }
            Ok(resp) => {
                warn!(url = %url, status = %resp.status(), "health probe failed");
                self.registry.increment_failure(url);
            }
            Err(e) => {
                debug!(url = %url, error = %e, "health probe unreachable");
                self.registry.increment_failure(url);
            }
        }
    }

    /// One probe pass over a snapshot of the registry; probes run concurrently.
    pub async fn probe_all(self: &Arc<Self>) {
        for node in self.registry.snapshot_all() {
            let prober = Arc::clone(self);
            tokio::spawn(async move {
                prober.probe_node(&node.url).await;
            });
        }
    }

    /// Spawn the periodic probe loop.
    pub fn start(self: &Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let prober = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(prober.poll_interval);
            loop {
                tokio::select! {
                    _ = interval.tick() => prober.probe_all().await,
                    _ = shutdown.recv() => break,
                }
            }
        });
    }
}
