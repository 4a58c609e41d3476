//! Node Registry - the canonical map of known inference nodes
//!
//! Keyed by node URL, safe for concurrent read and write. Tracks health,
//! capacity, in-flight depth, failure accounting, and cooldown. This is one
//! of the two process-wide mutable stores (the other is the usage tracker);
//! every mutation goes through the narrow API here.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use url::{Host, Url};

use crate::error::GatewayError;
use crate::{NodeStatus, NodeType};

/// Synthetic URL scheme for back-channel workers
pub const RELAY_SCHEME: &str = "relay://";

/// One candidate inference endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    /// Unique key: an http(s) URL, or `relay://<wallet>` for back-channel workers
    pub url: String,
    /// Lowercase hex wallet address, when known
    pub address: Option<String>,
    pub status: NodeStatus,
    pub node_type: NodeType,
    /// Tokens/second benchmark; drives selection weight
    pub capacity: f64,
    pub in_flight: u32,
    pub consecutive_failures: u32,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub last_probe: Option<DateTime<Utc>>,
}

impl Node {
    /// Eligible for candidate pools: online and out of cooldown.
    pub fn is_selectable(&self, now: DateTime<Utc>) -> bool {
        self.status == NodeStatus::Online
            && self.cooldown_until.map(|until| now >= until).unwrap_or(true)
    }
}

/// Initial values for a node being inserted
#[derive(Debug, Clone)]
pub struct NodeSeed {
    pub address: Option<String>,
    pub node_type: NodeType,
    pub capacity: f64,
    pub status: NodeStatus,
}

impl Default for NodeSeed {
    fn default() -> Self {
        Self { address: None, node_type: NodeType::Unknown, capacity: 1.0, status: NodeStatus::Offline }
    }
}

/// Validate a node URL at insertion time. Pure in the URL string and the
/// private-range flag: http(s) schemes only, no loopback, and no RFC1918 /
/// link-local ranges unless the operator allows them.
pub fn validate_node_url(raw: &str, allow_private_ips: bool) -> Result<(), String> {
    let url = Url::parse(raw).map_err(|e| format!("unparseable URL: {e}"))?;
    match url.scheme() {
        "http" | "https" => {}
        other => return Err(format!("unsupported scheme '{other}'")),
    }
    match url.host() {
        None => return Err("missing host".to_string()),
        Some(Host::Domain(domain)) => {
            if domain.eq_ignore_ascii_case("localhost") {
                return Err("loopback host rejected".to_string());
            }
        }
        Some(Host::Ipv4(ip)) => {
            if ip.is_loopback() || ip.is_unspecified() {
                return Err("loopback host rejected".to_string());
            }
            if (ip.is_private() || ip.is_link_local()) && !allow_private_ips {
                return Err("private-range host rejected".to_string());
            }
        }
        Some(Host::Ipv6(ip)) => {
            if ip.is_loopback() || ip.is_unspecified() {
                return Err("loopback host rejected".to_string());
            }
        }
    }
    Ok(())
}

/// Releases a node's in-flight slot on drop, on every exit path.
pub struct DispatchGuard {
    registry: Arc<NodeRegistry>,
    url: String,
}

impl Drop for DispatchGuard {
    fn drop(&mut self) {
        if let Some(mut node) = self.registry.nodes.get_mut(&self.url) {
            node.in_flight = node.in_flight.saturating_sub(1);
        }
    }
}

/// Keyed mapping from node URL to node record
pub struct NodeRegistry {
    nodes: DashMap<String, Node>,
    allow_private_ips: bool,
    failure_threshold: u32,
    cooldown: Duration,
}

impl NodeRegistry {
    pub fn new(allow_private_ips: bool, failure_threshold: u32, cooldown: Duration) -> Self {
        Self { nodes: DashMap::new(), allow_private_ips, failure_threshold, cooldown }
    }

    /// Insert or update a node. Validation applies to http(s) identities.
    /// Returns true when the node was newly inserted. On an existing node a
    /// seed address overwrites the stored one (last write wins), other seed
    /// fields are ignored.
    pub fn upsert(&self, url: &str, seed: NodeSeed) -> Result<bool, GatewayError> {
        let url = url.trim_end_matches('/').to_string();
        validate_node_url(&url, self.allow_private_ips)
            .map_err(|reason| GatewayError::Validation(format!("node URL {url}: {reason}")))?;

        let mut inserted = false;
        let mut entry = self.nodes.entry(url.clone()).or_insert_with(|| {
            inserted = true;
            Node {
                url: url.clone(),
                address: None,
                status: seed.status,
                node_type: seed.node_type,
                capacity: seed.capacity,
                in_flight: 0,
                consecutive_failures: 0,
                cooldown_until: None,
                last_probe: None,
            }
        });
        if let Some(address) = &seed.address {
            entry.address = Some(address.to_lowercase());
        }
        drop(entry);
        if inserted {
            debug!(url = %url, "node registered");
        }
        Ok(inserted)
    }

    /// Register the synthetic `relay://<wallet>` identity for a connected
    /// worker. URL validation is an http(s)-only concern and does not apply.
    pub fn ensure_relay(&self, address: &str) -> String {
        let address = address.to_lowercase();
        let url = format!("{RELAY_SCHEME}{address}");
        self.nodes.entry(url.clone()).or_insert_with(|| Node {
            url: url.clone(),
            address: Some(address),
            status: NodeStatus::Online,
            node_type: NodeType::Relay,
            capacity: 1.0,
            in_flight: 0,
            consecutive_failures: 0,
            cooldown_until: None,
            last_probe: None,
        });
        url
    }

    pub fn get(&self, url: &str) -> Option<Node> {
        self.nodes.get(url).map(|n| n.clone())
    }

    pub fn set_status(&self, url: &str, status: NodeStatus) {
        if let Some(mut node) = self.nodes.get_mut(url) {
            node.status = status;
        }
    }

    pub fn set_type(&self, url: &str, node_type: NodeType) {
        if let Some(mut node) = self.nodes.get_mut(url) {
            node.node_type = node_type;
        }
    }

    pub fn set_capacity(&self, url: &str, capacity: f64) {
        if let Some(mut node) = self.nodes.get_mut(url) {
            if capacity > 0.0 {
                node.capacity = capacity;
            }
        }
    }

    /// Record one failed attempt. Crossing the threshold flips the node
    /// offline and starts a cooldown. Returns the new failure count.
    pub fn increment_failure(&self, url: &str) -> u32 {
        let Some(mut node) = self.nodes.get_mut(url) else { return 0 };
        node.consecutive_failures += 1;
        let failures = node.consecutive_failures;
        if failures >= self.failure_threshold {
            node.status = NodeStatus::Offline;
            node.cooldown_until =
                Some(Utc::now() + chrono::Duration::seconds(self.cooldown.as_secs() as i64));
            warn!(url = %node.url, failures, "node taken offline, cooldown started");
        }
        failures
    }

    pub fn reset_failure(&self, url: &str) {
        if let Some(mut node) = self.nodes.get_mut(url) {
            node.consecutive_failures = 0;
        }
    }

    pub fn begin_cooldown(&self, url: &str) {
        if let Some(mut node) = self.nodes.get_mut(url) {
            node.cooldown_until =
                Some(Utc::now() + chrono::Duration::seconds(self.cooldown.as_secs() as i64));
        }
    }

    /// A successful probe (or, for relay identities, a successful worker
    /// authentication) clears failures and cooldown and restores the node.
    pub fn mark_online(&self, url: &str) {
        if let Some(mut node) = self.nodes.get_mut(url) {
            node.status = NodeStatus::Online;
            node.consecutive_failures = 0;
            node.cooldown_until = None;
            node.last_probe = Some(Utc::now());
        }
    }

    pub fn snapshot_all(&self) -> Vec<Node> {
        self.nodes.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn find_by_address(&self, address: &str) -> Option<Node> {
        let address = address.to_lowercase();
        self.nodes
            .iter()
            .find(|entry| entry.value().address.as_deref() == Some(address.as_str()))
            .map(|entry| entry.value().clone())
    }

    /// Acquire an in-flight slot for one dispatch; released when the guard drops.
    pub fn begin_dispatch(self: &Arc<Self>, url: &str) -> DispatchGuard {
        if let Some(mut node) = self.nodes.get_mut(url) {
            node.in_flight += 1;
        }
        DispatchGuard { registry: Arc::clone(self), url: url.to_string() }
    }

    /// Test-only escape hatch: loopback is rejected by production validation,
    /// but unit tests dispatch against mock servers bound to it.
    #[cfg(test)]
    pub(crate) fn insert_unchecked(&self, url: &str, seed: NodeSeed) {
        let url = url.trim_end_matches('/').to_string();
        self.nodes.insert(
            url.clone(),
            Node {
                url,
                address: seed.address.map(|a| a.to_lowercase()),
                status: seed.status,
                node_type: seed.node_type,
                capacity: seed.capacity,
                in_flight: 0,
                consecutive_failures: 0,
                cooldown_until: None,
                last_probe: None,
            },
        );
    }

    pub fn online_count(&self) -> usize {
        self.nodes.iter().filter(|e| e.value().status == NodeStatus::Online).count()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> Arc<NodeRegistry> {
        Arc::new(NodeRegistry::new(false, 3, Duration::from_secs(30)))
    }

    #[test]
    fn url_validation() {
        assert!(validate_node_url("https://node.example.com:8080", false).is_ok());
        assert!(validate_node_url("http://1.2.3.4", false).is_ok());
        assert!(validate_node_url("ftp://node.example.com", false).is_err());
        assert!(validate_node_url("ws://node.example.com", false).is_err());
        assert!(validate_node_url("http://localhost:8080", false).is_err());
        assert!(validate_node_url("http://127.0.0.1:8080", false).is_err());
        assert!(validate_node_url("http://0.0.0.0", false).is_err());
        assert!(validate_node_url("http://[::1]:8080", false).is_err());
        assert!(validate_node_url("not a url", false).is_err());
    }

    #[test]
    fn private_ranges_need_operator_flag() {
        for url in [
            "http://10.1.2.3:8080",
            "http://172.16.0.1:8080",
            "http://192.168.1.10:8080",
            "http://169.254.0.5:8080",
        ] {
            assert!(validate_node_url(url, false).is_err(), "{url} should be rejected");
            assert!(validate_node_url(url, true).is_ok(), "{url} should pass with the flag");
        }
        // loopback stays rejected either way
        assert!(validate_node_url("http://127.0.0.1", true).is_err());
    }

    #[test]
    fn validation_is_pure() {
        for _ in 0..3 {
            assert!(validate_node_url("http://10.0.0.1", false).is_err());
            assert!(validate_node_url("http://10.0.0.1", true).is_ok());
        }
    }

    #[test]
    fn failure_threshold_flips_offline_with_cooldown() {
        let reg = registry();
        reg.upsert("http://a.example.com", NodeSeed { status: NodeStatus::Online, ..Default::default() })
            .unwrap();
        let url = "http://a.example.com";

        assert_eq!(reg.increment_failure(url), 1);
        assert_eq!(reg.increment_failure(url), 2);
        let node = reg.get(url).unwrap();
        assert_eq!(node.status, NodeStatus::Online);
        assert!(node.cooldown_until.is_none());

        assert_eq!(reg.increment_failure(url), 3);
        let node = reg.get(url).unwrap();
        assert_eq!(node.status, NodeStatus::Offline);
        assert!(node.cooldown_until.is_some());
        assert!(!node.is_selectable(Utc::now()));
    }

    #[test]
    fn mark_online_clears_failures_and_cooldown() {
        let reg = registry();
        reg.upsert("http://a.example.com", NodeSeed::default()).unwrap();
        for _ in 0..3 {
            reg.increment_failure("http://a.example.com");
        }
        reg.mark_online("http://a.example.com");
        let node = reg.get("http://a.example.com").unwrap();
        assert_eq!(node.status, NodeStatus::Online);
        assert_eq!(node.consecutive_failures, 0);
        assert!(node.cooldown_until.is_none());
        assert!(node.is_selectable(Utc::now()));
    }

    #[test]
    fn dispatch_guard_pairs_acquire_release() {
        let reg = registry();
        reg.upsert("http://a.example.com", NodeSeed::default()).unwrap();

        let g1 = reg.begin_dispatch("http://a.example.com");
        let g2 = reg.begin_dispatch("http://a.example.com");
        assert_eq!(reg.get("http://a.example.com").unwrap().in_flight, 2);
        drop(g1);
        assert_eq!(reg.get("http://a.example.com").unwrap().in_flight, 1);
        drop(g2);
        assert_eq!(reg.get("http://a.example.com").unwrap().in_flight, 0);

        // release never underflows
        let g3 = reg.begin_dispatch("http://a.example.com");
        drop(g3);
        assert_eq!(reg.get("http://a.example.com").unwrap().in_flight, 0);
    }

    #[test]
    fn upsert_address_last_write_wins() {
        let reg = registry();
        reg.upsert(
            "http://a.example.com",
            NodeSeed { address: Some("0xAAA".into()), ..Default::default() },
        )
        .unwrap();
        assert_eq!(reg.get("http://a.example.com").unwrap().address.as_deref(), Some("0xaaa"));

        reg.upsert(
            "http://a.example.com",
            NodeSeed { address: Some("0xBBB".into()), ..Default::default() },
        )
        .unwrap();
        assert_eq!(reg.get("http://a.example.com").unwrap().address.as_deref(), Some("0xbbb"));
    }

    #[test]
    fn relay_identity_bypasses_url_validation() {
        let reg = registry();
        let url = reg.ensure_relay("0xABCDEF");
        assert_eq!(url, "relay://0xabcdef");
        let node = reg.get(&url).unwrap();
        assert_eq!(node.node_type, NodeType::Relay);
        assert_eq!(node.status, NodeStatus::Online);
        assert_eq!(node.address.as_deref(), Some("0xabcdef"));

        // direct upsert of the relay scheme is still rejected
        assert!(reg.upsert("relay://0xabcdef", NodeSeed::default()).is_err());
    }

    #[test]
    fn find_by_address_is_case_insensitive() {
        let reg = registry();
        reg.upsert(
            "http://a.example.com",
            NodeSeed { address: Some("0xAbC123".into()), ..Default::default() },
        )
        .unwrap();
        assert!(reg.find_by_address("0XABC123").is_some());
        assert!(reg.find_by_address("0xdead").is_none());
    }
}
