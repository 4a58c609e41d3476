//! Oracle Discovery - periodic node and topology refresh
//!
//! Polls the Oracle on a fixed cadence with three independently best-effort
//! calls: the node list (upserted into the registry, seeded offline until a
//! probe confirms them), the pipeline topology for the configured model
//! (cached for the selector; per-node benchmarks update capacity), and the
//! capacity metrics. The Oracle being unreachable is an expected condition;
//! connection-refused is logged at debug level, anything else as a warning.
//! Newly discovered nodes get an immediate probe so their type is known
//! before the first request reaches them.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, warn};

use crate::health::HealthProber;
use crate::oracle::{is_connection_refused, OracleClient, PipelineTopology};
use crate::registry::{NodeRegistry, NodeSeed};
use crate::{NodeStatus, NodeType};

pub struct OracleDiscovery {
    oracle: Arc<OracleClient>,
    registry: Arc<NodeRegistry>,
    topology: Arc<RwLock<Option<PipelineTopology>>>,
    prober: Arc<HealthProber>,
    model: String,
    poll_interval: Duration,
}

impl OracleDiscovery {
    pub fn new(
        oracle: Arc<OracleClient>,
        registry: Arc<NodeRegistry>,
        topology: Arc<RwLock<Option<PipelineTopology>>>,
        prober: Arc<HealthProber>,
        model: String,
        poll_interval: Duration,
    ) -> Self {
        Self { oracle, registry, topology, prober, model, poll_interval }
    }

    fn log_oracle_error(&self, what: &str, err: &reqwest::Error) {
        if is_connection_refused(err) {
            debug!(error = %err, "oracle unreachable during {what}");
        } else {
            warn!(error = %err, "oracle {what} failed");
        }
    }

    /// Upsert one discovered endpoint, seeded offline at a zero capacity
    /// baseline; fresh nodes are probed right away.
    fn admit_node(&self, endpoint: &str, address: Option<String>) {
        let seed = NodeSeed {
            address,
            node_type: NodeType::Unknown,
            capacity: 0.0,
            status: NodeStatus::Offline,
        };
        match self.registry.upsert(endpoint, seed) {
            Ok(true) => {
                info!(url = %endpoint, "discovered new node");
                let prober = Arc::clone(&self.prober);
                let url = endpoint.to_string();
                tokio::spawn(async move {
                    prober.probe_node(&url).await;
                });
            }
            Ok(false) => {}
            Err(e) => debug!(url = %endpoint, error = %e, "rejected discovered node"),
        }
    }

    /// One discovery cycle: node list, topology, capacity metrics.
    pub async fn run_cycle(&self) {
        match self.oracle.fetch_nodes().await {
            Ok(nodes) => {
                for entry in nodes {
                    self.admit_node(&entry.endpoint, entry.address);
                }
            }
            Err(e) => self.log_oracle_error("node list", &e),
        }

        match self.oracle.fetch_topology(&self.model).await {
            Ok(topology) => {
                for member in &topology.nodes {
                    let Some(endpoint) = &member.http_endpoint else { continue };
                    // topology wins over the node list on address conflicts
                    self.admit_node(endpoint, Some(member.address.clone()));
                    if let Some(benchmark) = member.benchmark_tok_per_sec {
                        self.registry.set_capacity(endpoint.trim_end_matches('/'), benchmark);
                    }
                }
                debug!(
                    model = %topology.model,
                    layers = topology.total_layers,
                    members = topology.nodes.len(),
                    "pipeline topology refreshed"
                );
                *self.topology.write().await = Some(topology);
            }
            Err(e) => self.log_oracle_error("topology fetch", &e),
        }

        match self.oracle.fetch_capacity().await {
            Ok(metrics) => {
                for metric in metrics {
                    if metric.benchmark_tok_per_sec <= 0.0 {
                        continue;
                    }
                    if let Some(node) = self.registry.find_by_address(&metric.address) {
                        self.registry.set_capacity(&node.url, metric.benchmark_tok_per_sec);
                    }
                }
            }
            Err(e) => self.log_oracle_error("capacity fetch", &e),
        }
    }

    /// Spawn the periodic discovery loop.
    pub fn start(self: &Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let discovery = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(discovery.poll_interval);
            loop {
                tokio::select! {
                    _ = interval.tick() => discovery.run_cycle().await,
                    _ = shutdown.recv() => break,
                }
            }
        });
    }
}
