//! Usage Tracker - per-worker accounting for settlement
//!
//! Aggregates tokens, request counts, and latency per worker wallet, updated
//! synchronously after each successful request. A periodic task reports the
//! aggregates to the Oracle in a batch; aggregates are NOT reset on a
//! successful report, so the reporting side is at-least-once and consumers
//! must deduplicate by timestamp. Aggregates with no update inside the stale
//! threshold are evicted before each report.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::oracle::{OracleClient, UsageReport};
use crate::signature::sign_message;

#[derive(Debug, Clone)]
struct WorkerUsage {
    tokens: u64,
    requests: u64,
    total_latency_ms: u64,
    uptime_start: DateTime<Utc>,
    last_recorded: DateTime<Utc>,
}

/// Read-only view of one aggregate, for stats endpoints and tests
#[derive(Debug, Clone, Serialize)]
pub struct UsageSnapshot {
    pub wallet: String,
    pub tokens: u64,
    pub requests: u64,
    pub avg_latency_ms: f64,
    pub last_recorded: DateTime<Utc>,
}

pub struct UsageTracker {
    workers: DashMap<String, WorkerUsage>,
    oracle: Option<Arc<OracleClient>>,
    signing_key: Option<String>,
    stale_after: Duration,
    report_interval: Duration,
}

impl UsageTracker {
    pub fn new(
        oracle: Option<Arc<OracleClient>>,
        signing_key: Option<String>,
        stale_after: Duration,
        report_interval: Duration,
    ) -> Self {
        Self { workers: DashMap::new(), oracle, signing_key, stale_after, report_interval }
    }

    /// Record one successful request against a worker. Called synchronously
    /// by the Retry Coordinator.
    pub fn record(&self, wallet: &str, tokens: u64, latency: Duration) {
        let now = Utc::now();
        let mut entry = self.workers.entry(wallet.to_lowercase()).or_insert_with(|| WorkerUsage {
            tokens: 0,
            requests: 0,
            total_latency_ms: 0,
            uptime_start: now,
            last_recorded: now,
        });
        entry.tokens += tokens;
        entry.requests += 1;
        entry.total_latency_ms += latency.as_millis() as u64;
        entry.last_recorded = now;
    }

    /// Drop aggregates that have not been updated within the stale threshold.
    pub fn evict_stale(&self) {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.stale_after).unwrap_or_else(|_| chrono::Duration::seconds(60));
        let stale: Vec<String> = self
            .workers
            .iter()
            .filter(|e| e.value().last_recorded < cutoff)
            .map(|e| e.key().clone())
            .collect();
        for wallet in stale {
            self.workers.remove(&wallet);
            info!(wallet = %wallet, "evicted stale usage aggregate");
        }
    }

    pub fn snapshot(&self) -> Vec<UsageSnapshot> {
        self.workers
            .iter()
            .map(|e| {
                let u = e.value();
                UsageSnapshot {
                    wallet: e.key().clone(),
                    tokens: u.tokens,
                    requests: u.requests,
                    avg_latency_ms: if u.requests > 0 {
                        u.total_latency_ms as f64 / u.requests as f64
                    } else {
                        0.0
                    },
                    last_recorded: u.last_recorded,
                }
            })
            .collect()
    }

    pub fn total_requests(&self) -> u64 {
        self.workers.iter().map(|e| e.value().requests).sum()
    }

    pub fn total_tokens(&self) -> u64 {
        self.workers.iter().map(|e| e.value().tokens).sum()
    }

    fn build_report(&self, wallet: &str, usage: &WorkerUsage) -> UsageReport {
        let now = Utc::now();
        let mut report = UsageReport {
            wallet: wallet.to_string(),
            tokens_processed: usage.tokens,
            request_count: usage.requests,
            avg_latency_ms: if usage.requests > 0 {
                usage.total_latency_ms as f64 / usage.requests as f64
            } else {
                0.0
            },
            uptime_seconds: (now - usage.uptime_start).num_seconds().max(0) as u64,
            timestamp: now.timestamp(),
            signature: None,
        };
        if let Some(key) = &self.signing_key {
            match sign_message(key, report.canonical().as_bytes()) {
                Ok(signature) => report.signature = Some(signature),
                Err(e) => warn!(error = %e, "failed to sign usage report"),
            }
        }
        report
    }

    /// One reporting cycle: evict stale aggregates, then send one report per
    /// worker. Per-worker failures are logged and do not abort the batch.
    pub async fn report_once(&self) {
        let Some(oracle) = &self.oracle else { return };
        self.evict_stale();

        let reports: Vec<UsageReport> = self
            .workers
            .iter()
            .map(|e| self.build_report(e.key(), e.value()))
            .collect();
        for report in reports {
            if let Err(e) = oracle.report_usage(&report).await {
                warn!(wallet = %report.wallet, error = %e, "usage report failed");
            }
        }
    }

    /// Spawn the periodic batch-report task.
    pub fn start(self: &Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        if self.oracle.is_none() {
            return;
        }
        let tracker = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tracker.report_interval);
            loop {
                tokio::select! {
                    _ = interval.tick() => tracker.report_once().await,
                    _ = shutdown.recv() => break,
                }
            }
        });
    }
}
