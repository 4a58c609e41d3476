//! Oracle client - discovery and metrics endpoints
//!
//! Thin reqwest wrapper over the Oracle's HTTP surface: the node list, the
//! pipeline topology for a model, per-node capacity benchmarks, and the
//! usage-report sink. Payload fields are camelCase on the wire and parsed
//! leniently; every call is best-effort from the caller's point of view.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// One entry from `GET /api/nodes`
#[derive(Debug, Clone, Deserialize)]
pub struct NodeEntry {
    pub endpoint: String,
    #[serde(default)]
    pub address: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeListResponse {
    #[serde(default)]
    pub nodes: Vec<NodeEntry>,
}

/// One pipeline member from the topology endpoint
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopologyNode {
    pub address: String,
    #[serde(default)]
    pub http_endpoint: Option<String>,
    #[serde(default)]
    pub layer_start: u32,
    #[serde(default)]
    pub layer_end: u32,
    #[serde(default)]
    pub pipeline_order: u32,
    #[serde(default)]
    pub ready: bool,
    #[serde(default)]
    pub benchmark_tok_per_sec: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TopologyResponse {
    pub model: String,
    #[serde(default)]
    pub nodes: Vec<TopologyNode>,
}

/// Advisory sharding description of a large model across pipeline nodes
#[derive(Debug, Clone)]
pub struct PipelineTopology {
    pub model: String,
    pub total_layers: u32,
    pub nodes: Vec<TopologyNode>,
}

impl PipelineTopology {
    pub fn from_response(resp: TopologyResponse) -> Self {
        let total_layers = resp.nodes.iter().map(|n| n.layer_end).max().unwrap_or(0);
        Self { model: resp.model, total_layers, nodes: resp.nodes }
    }

    /// Only entry nodes (pipeline order 0) can serve a request alone.
    pub fn entry_nodes(&self) -> impl Iterator<Item = &TopologyNode> {
        self.nodes.iter().filter(|n| n.pipeline_order == 0)
    }

    /// Pipeline order for a wallet address, when the topology lists it.
    pub fn order_of(&self, address: &str) -> Option<u32> {
        self.nodes
            .iter()
            .find(|n| n.address.eq_ignore_ascii_case(address))
            .map(|n| n.pipeline_order)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapacityMetric {
    pub address: String,
    #[serde(default)]
    pub benchmark_tok_per_sec: f64,
}

/// One per-worker usage report, POSTed to `/api/metrics`
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageReport {
    pub wallet: String,
    pub tokens_processed: u64,
    pub request_count: u64,
    pub avg_latency_ms: f64,
    pub uptime_seconds: u64,
    pub timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

impl UsageReport {
    /// Bytes covered by the optional report signature: the report JSON with
    /// the signature field absent.
    pub fn canonical(&self) -> String {
        let unsigned = UsageReport { signature: None, ..self.clone() };
        serde_json::to_string(&unsigned).expect("usage report serializes")
    }
}

/// Outbound client for the Oracle HTTP surface
pub struct OracleClient {
    base: String,
    http: reqwest::Client,
}

impl OracleClient {
    pub fn new(base: String) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("oracle http client");
        Self { base: base.trim_end_matches('/').to_string(), http }
    }

    pub async fn fetch_nodes(&self) -> Result<Vec<NodeEntry>, reqwest::Error> {
        let resp: NodeListResponse = self
            .http
            .get(format!("{}/api/nodes", self.base))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(resp.nodes)
    }

    pub async fn fetch_topology(&self, model: &str) -> Result<PipelineTopology, reqwest::Error> {
        let resp: TopologyResponse = self
            .http
            .get(format!("{}/api/v1/pipeline/topology", self.base))
            .query(&[("model", model)])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(PipelineTopology::from_response(resp))
    }

    pub async fn fetch_capacity(&self) -> Result<Vec<CapacityMetric>, reqwest::Error> {
        self.http
            .get(format!("{}/api/v1/metrics/capacity", self.base))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
    }

    pub async fn report_usage(&self, report: &UsageReport) -> Result<(), reqwest::Error> {
        self.http
            .post(format!("{}/api/metrics", self.base))
            .json(report)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

/// The Oracle being down is an expected condition and logged at debug level.
pub fn is_connection_refused(err: &reqwest::Error) -> bool {
    err.is_connect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn topology_derives_total_layers() {
        let resp = TopologyResponse {
            model: "m".into(),
            nodes: vec![
                TopologyNode {
                    address: "0xa".into(),
                    http_endpoint: Some("http://a.example.com".into()),
                    layer_start: 0,
                    layer_end: 16,
                    pipeline_order: 0,
                    ready: true,
                    benchmark_tok_per_sec: Some(12.0),
                },
                TopologyNode {
                    address: "0xb".into(),
                    http_endpoint: None,
                    layer_start: 16,
                    layer_end: 32,
                    pipeline_order: 1,
                    ready: true,
                    benchmark_tok_per_sec: None,
                },
            ],
        };
        let topology = PipelineTopology::from_response(resp);
        assert_eq!(topology.total_layers, 32);
        let entries: Vec<_> = topology.entry_nodes().collect();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].address, "0xa");
        assert_eq!(topology.order_of("0XB"), Some(1));
    }

    #[test]
    fn report_canonical_omits_signature() {
        let report = UsageReport {
            wallet: "0xabc".into(),
            tokens_processed: 100,
            request_count: 2,
            avg_latency_ms: 41.5,
            uptime_seconds: 600,
            timestamp: 1700000000,
            signature: Some("0xsig".into()),
        };
        let canonical = report.canonical();
        assert!(canonical.contains("\"tokensProcessed\":100"));
        assert!(!canonical.contains("signature"));
    }

    #[tokio::test]
    async fn fetch_nodes_parses_wire_shape() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/nodes"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "nodes": [
                    {"endpoint": "http://a.example.com:8080", "address": "0xA1"},
                    {"endpoint": "http://b.example.com:8080"}
                ]
            })))
            .mount(&server)
            .await;

        let client = OracleClient::new(server.uri());
        let nodes = client.fetch_nodes().await.unwrap();
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0].address.as_deref(), Some("0xA1"));
        assert!(nodes[1].address.is_none());
    }

    #[tokio::test]
    async fn fetch_topology_passes_model_query() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/pipeline/topology"))
            .and(query_param("model", "plumise-chat"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "model": "plumise-chat",
                "nodes": [{
                    "address": "0xa",
                    "httpEndpoint": "http://a.example.com",
                    "layerStart": 0,
                    "layerEnd": 24,
                    "pipelineOrder": 0,
                    "ready": true,
                    "benchmarkTokPerSec": 9.5
                }]
            })))
            .mount(&server)
            .await;

        let client = OracleClient::new(server.uri());
        let topology = client.fetch_topology("plumise-chat").await.unwrap();
        assert_eq!(topology.total_layers, 24);
        assert_eq!(topology.nodes[0].benchmark_tok_per_sec, Some(9.5));
    }
}
