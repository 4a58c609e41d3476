//! Candidate Selector - pool assembly and weighted random choice
//!
//! Flattens the live relay connections, the pipeline topology, and the node
//! registry into one deduplicated candidate pool, then draws one candidate
//! with probability proportional to `max(capacity / (1 + in_flight), 0.1)`.
//! Identity dedup is by URL and by lowercased wallet address, with fixed
//! priority relay → topology entry → remaining registry: a relay path for an
//! address hides any HTTP path for the same address.

use rand::distributions::WeightedIndex;
use rand::prelude::*;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::oracle::PipelineTopology;
use crate::registry::{Node, NodeRegistry};
use crate::relay::WorkerRelay;
use crate::NodeType;

const WEIGHT_FLOOR: f64 = 0.1;

/// One pool entry, a transient snapshot used for a single dispatch
#[derive(Debug, Clone)]
pub struct Candidate {
    /// Registry key: an http(s) URL or `relay://<wallet>`
    pub url: String,
    pub address: Option<String>,
    pub node_type: NodeType,
    pub weight: f64,
}

fn weight_of(node: &Node) -> f64 {
    (node.capacity / (1.0 + node.in_flight as f64)).max(WEIGHT_FLOOR)
}

/// Assembles candidate pools and picks nodes for dispatch
pub struct CandidateSelector {
    registry: Arc<NodeRegistry>,
    relay: Arc<WorkerRelay>,
    topology: Arc<RwLock<Option<PipelineTopology>>>,
}

impl CandidateSelector {
    pub fn new(
        registry: Arc<NodeRegistry>,
        relay: Arc<WorkerRelay>,
        topology: Arc<RwLock<Option<PipelineTopology>>>,
    ) -> Self {
        Self { registry, relay, topology }
    }

    /// Produce the deduplicated ordered pool, minus `excluded` URLs.
    pub async fn candidates(&self, excluded: &HashSet<String>) -> Vec<Candidate> {
        let now = chrono::Utc::now();
        let mut pool = Vec::new();
        let mut seen_urls: HashSet<String> = HashSet::new();
        let mut seen_addrs: HashSet<String> = HashSet::new();

        let mut push = |pool: &mut Vec<Candidate>,
                        seen_urls: &mut HashSet<String>,
                        seen_addrs: &mut HashSet<String>,
                        candidate: Candidate| {
            if excluded.contains(&candidate.url) || !seen_urls.insert(candidate.url.clone()) {
                return;
            }
            if let Some(addr) = &candidate.address {
                if !addr.is_empty() && !seen_addrs.insert(addr.clone()) {
                    seen_urls.remove(&candidate.url);
                    return;
                }
            }
            pool.push(candidate);
        };

        // 1. live back-channel workers, highest priority
        for worker in self.relay.connected_workers() {
            let url = self.registry.ensure_relay(&worker.address);
            let Some(node) = self.registry.get(&url) else { continue };
            if !node.is_selectable(now) {
                continue;
            }
            push(
                &mut pool,
                &mut seen_urls,
                &mut seen_addrs,
                Candidate {
                    url,
                    address: Some(worker.address.to_lowercase()),
                    node_type: NodeType::Relay,
                    weight: weight_of(&node),
                },
            );
        }

        // 2. topology entry nodes whose address is not already represented
        let topology = self.topology.read().await.clone();
        if let Some(topology) = &topology {
            for entry in topology.entry_nodes() {
                if !entry.ready {
                    continue;
                }
                let Some(endpoint) = &entry.http_endpoint else { continue };
                let url = endpoint.trim_end_matches('/').to_string();
                let Some(node) = self.registry.get(&url) else { continue };
                if !node.is_selectable(now) {
                    continue;
                }
                push(
                    &mut pool,
                    &mut seen_urls,
                    &mut seen_addrs,
                    Candidate {
                        url,
                        address: Some(entry.address.to_lowercase()),
                        node_type: NodeType::Pipeline,
                        weight: weight_of(&node),
                    },
                );
            }
        }

        // 3. remaining registry nodes. Relay identities without a live
        //    connection are unreachable; pipeline members the topology places
        //    past the entry position cannot serve a request alone.
        for node in self.registry.snapshot_all() {
            if node.node_type == NodeType::Relay || !node.is_selectable(now) {
                continue;
            }
            if node.node_type == NodeType::Pipeline {
                let non_entry = topology
                    .as_ref()
                    .and_then(|t| node.address.as_deref().and_then(|a| t.order_of(a)))
                    .map(|order| order > 0)
                    .unwrap_or(false);
                if non_entry {
                    continue;
                }
            }
            let weight = weight_of(&node);
            push(
                &mut pool,
                &mut seen_urls,
                &mut seen_addrs,
                Candidate { url: node.url, address: node.address, node_type: node.node_type, weight },
            );
        }

        pool
    }

    /// Draw one candidate by weighted random choice.
    pub async fn pick(&self, excluded: &HashSet<String>) -> Option<Candidate> {
        let pool = self.candidates(excluded).await;
        Self::weighted_pick(&pool)
    }

    fn weighted_pick(pool: &[Candidate]) -> Option<Candidate> {
        match pool.len() {
            0 => None,
            1 => Some(pool[0].clone()),
            _ => {
                let weights: Vec<f64> = pool.iter().map(|c| c.weight).collect();
                let dist = WeightedIndex::new(&weights).ok()?;
                Some(pool[dist.sample(&mut thread_rng())].clone())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{NodeSeed, RELAY_SCHEME};
    use crate::relay::{RelayConfig, WorkerRelay};
    use crate::{NodeStatus, TimeoutConfig};
    use std::time::Duration;

    fn setup() -> (Arc<NodeRegistry>, Arc<WorkerRelay>, Arc<RwLock<Option<PipelineTopology>>>) {
        let registry = Arc::new(NodeRegistry::new(false, 3, Duration::from_secs(30)));
        let relay = Arc::new(WorkerRelay::new(
            RelayConfig::from(&TimeoutConfig::default()),
            Arc::clone(&registry),
        ));
        (registry, relay, Arc::new(RwLock::new(None)))
    }

    fn online_seed(address: Option<&str>) -> NodeSeed {
        NodeSeed {
            address: address.map(str::to_string),
            node_type: NodeType::OpenAi,
            capacity: 1.0,
            status: NodeStatus::Online,
        }
    }

    #[tokio::test]
    async fn empty_registry_yields_empty_pool() {
        let (registry, relay, topology) = setup();
        let selector = CandidateSelector::new(registry, relay, topology);
        assert!(selector.candidates(&HashSet::new()).await.is_empty());
        assert!(selector.pick(&HashSet::new()).await.is_none());
    }

    #[tokio::test]
    async fn offline_and_cooldown_nodes_are_excluded() {
        let (registry, relay, topology) = setup();
        registry.upsert("http://up.example.com", online_seed(None)).unwrap();
        registry.upsert("http://down.example.com", NodeSeed::default()).unwrap();
        registry.upsert("http://cooling.example.com", online_seed(None)).unwrap();
        registry.begin_cooldown("http://cooling.example.com");

        let selector = CandidateSelector::new(registry, relay, topology);
        let pool = selector.candidates(&HashSet::new()).await;
        assert_eq!(pool.len(), 1);
        assert_eq!(pool[0].url, "http://up.example.com");
    }

    #[tokio::test]
    async fn pool_never_repeats_url_or_address() {
        let (registry, relay, topology) = setup();
        registry.upsert("http://a.example.com", online_seed(Some("0xAAA"))).unwrap();
        registry.upsert("http://a2.example.com", online_seed(Some("0xaaa"))).unwrap();
        registry.upsert("http://b.example.com", online_seed(Some("0xbbb"))).unwrap();

        let selector = CandidateSelector::new(registry, relay, topology);
        let pool = selector.candidates(&HashSet::new()).await;

        let urls: HashSet<_> = pool.iter().map(|c| c.url.clone()).collect();
        assert_eq!(urls.len(), pool.len());
        let addrs: Vec<_> = pool.iter().filter_map(|c| c.address.clone()).collect();
        let addr_set: HashSet<_> = addrs.iter().cloned().collect();
        assert_eq!(addr_set.len(), addrs.len());
        assert_eq!(pool.len(), 2);
    }

    #[tokio::test]
    async fn excluded_urls_are_skipped() {
        let (registry, relay, topology) = setup();
        registry.upsert("http://a.example.com", online_seed(None)).unwrap();
        registry.upsert("http://b.example.com", online_seed(None)).unwrap();

        let selector = CandidateSelector::new(registry, relay, topology);
        let mut excluded = HashSet::new();
        excluded.insert("http://a.example.com".to_string());
        let pool = selector.candidates(&excluded).await;
        assert_eq!(pool.len(), 1);
        assert_eq!(pool[0].url, "http://b.example.com");
    }

    #[tokio::test]
    async fn topology_non_entry_nodes_are_filtered() {
        let (registry, relay, topology) = setup();
        registry.upsert(
            "http://entry.example.com",
            NodeSeed {
                address: Some("0xent".into()),
                node_type: NodeType::Pipeline,
                capacity: 1.0,
                status: NodeStatus::Online,
            },
        )
        .unwrap();
        registry.upsert(
            "http://tail.example.com",
            NodeSeed {
                address: Some("0xtail".into()),
                node_type: NodeType::Pipeline,
                capacity: 1.0,
                status: NodeStatus::Online,
            },
        )
        .unwrap();

        *topology.write().await = Some(PipelineTopology {
            model: "m".into(),
            total_layers: 32,
            nodes: vec![
                crate::oracle::TopologyNode {
                    address: "0xent".into(),
                    http_endpoint: Some("http://entry.example.com".into()),
                    layer_start: 0,
                    layer_end: 16,
                    pipeline_order: 0,
                    ready: true,
                    benchmark_tok_per_sec: None,
                },
                crate::oracle::TopologyNode {
                    address: "0xtail".into(),
                    http_endpoint: Some("http://tail.example.com".into()),
                    layer_start: 16,
                    layer_end: 32,
                    pipeline_order: 1,
                    ready: true,
                    benchmark_tok_per_sec: None,
                },
            ],
        });

        let selector = CandidateSelector::new(registry, relay, topology);
        let pool = selector.candidates(&HashSet::new()).await;
        assert_eq!(pool.len(), 1);
        assert_eq!(pool[0].url, "http://entry.example.com");
        assert_eq!(pool[0].node_type, NodeType::Pipeline);
    }

    #[tokio::test]
    async fn relay_identity_hides_http_path_for_same_address() {
        let (registry, relay, topology) = setup();
        // the worker's HTTP form is known to the registry...
        registry.upsert("http://w.example.com", online_seed(Some("0xabc"))).unwrap();
        // ...and the same wallet has a live back-channel
        relay.register_test_worker("0xabc", "m");

        let selector =
            CandidateSelector::new(Arc::clone(&registry), Arc::clone(&relay), topology);
        let pool = selector.candidates(&HashSet::new()).await;
        assert_eq!(pool.len(), 1);
        assert_eq!(pool[0].url, "relay://0xabc");
        assert_eq!(pool[0].node_type, NodeType::Relay);
    }

    #[tokio::test]
    async fn relay_record_without_live_connection_is_unreachable() {
        let (registry, relay, topology) = setup();
        registry.upsert("http://w.example.com", online_seed(Some("0xabc"))).unwrap();
        // a stale relay identity with no socket behind it
        registry.ensure_relay("0xabc");

        let selector =
            CandidateSelector::new(Arc::clone(&registry), Arc::clone(&relay), topology);
        let pool = selector.candidates(&HashSet::new()).await;
        // the HTTP path serves the address instead
        assert_eq!(pool.len(), 1);
        assert_eq!(pool[0].url, "http://w.example.com");
    }

    #[tokio::test]
    async fn weight_floor_keeps_zero_capacity_nodes_drawable() {
        let (registry, relay, topology) = setup();
        registry.upsert(
            "http://zero.example.com",
            NodeSeed { capacity: 0.0, status: NodeStatus::Online, ..Default::default() },
        )
        .unwrap();
        let selector = CandidateSelector::new(registry, relay, topology);
        let pool = selector.candidates(&HashSet::new()).await;
        assert_eq!(pool.len(), 1);
        assert!((pool[0].weight - WEIGHT_FLOOR).abs() < f64::EPSILON);
    }

    #[test]
    fn single_candidate_returns_itself() {
        let pool = vec![Candidate {
            url: "http://only.example.com".into(),
            address: None,
            node_type: NodeType::OpenAi,
            weight: 1.0,
        }];
        let picked = CandidateSelector::weighted_pick(&pool).unwrap();
        assert_eq!(picked.url, "http://only.example.com");
        assert!(CandidateSelector::weighted_pick(&[]).is_none());
    }

    #[test]
    fn weighted_pick_converges_to_capacity_share() {
        let pool = vec![
            Candidate {
                url: "http://big.example.com".into(),
                address: None,
                node_type: NodeType::OpenAi,
                weight: 3.0,
            },
            Candidate {
                url: "http://small.example.com".into(),
                address: None,
                node_type: NodeType::OpenAi,
                weight: 1.0,
            },
        ];
        let draws = 20_000;
        let mut big = 0usize;
        for _ in 0..draws {
            if CandidateSelector::weighted_pick(&pool).unwrap().url == "http://big.example.com" {
                big += 1;
            }
        }
        let share = big as f64 / draws as f64;
        // expected 0.75; allow generous statistical slack
        assert!((share - 0.75).abs() < 0.03, "share was {share}");
    }

    #[tokio::test]
    async fn in_flight_depth_lowers_weight() {
        let (registry, relay, topology) = setup();
        registry.upsert("http://busy.example.com", online_seed(None)).unwrap();
        let _g1 = registry.begin_dispatch("http://busy.example.com");
        let _g2 = registry.begin_dispatch("http://busy.example.com");
        let _g3 = registry.begin_dispatch("http://busy.example.com");

        let selector = CandidateSelector::new(registry, relay, topology);
        let pool = selector.candidates(&HashSet::new()).await;
        // capacity 1.0 over (1 + 3) in flight
        assert!((pool[0].weight - 0.25).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn relay_node_in_cooldown_is_excluded() {
        let (registry, relay, topology) = setup();
        let url = registry.ensure_relay("0xabc");
        registry.begin_cooldown(&url);
        // even if a connection existed, the cooldown filter applies; with no
        // connection the relay section contributes nothing either way
        let selector = CandidateSelector::new(registry, relay, topology);
        let pool = selector.candidates(&HashSet::new()).await;
        assert!(pool.iter().all(|c| !c.url.starts_with(RELAY_SCHEME)));
    }
}
