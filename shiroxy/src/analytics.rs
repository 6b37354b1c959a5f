//! Runtime analytics
//!
//! Aggregates the domain inventory and transport pool counters into the
//! JSON snapshots served to the admin surface and written into the
//! shutdown envelope.

use crate::domains::DomainStore;
use crate::proxy::forwarder::PoolStats;
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;

pub struct Analytics {
    store: Arc<DomainStore>,
    pool_stats: Arc<PoolStats>,
    started_at: Instant,
}

impl Analytics {
    pub fn new(store: Arc<DomainStore>, pool_stats: Arc<PoolStats>) -> Self {
        Self {
            store,
            pool_stats,
            started_at: Instant::now(),
        }
    }

    /// Per-domain view: status and routing tags, no key material.
    pub fn domains(&self) -> serde_json::Value {
        let domains: Vec<serde_json::Value> = self
            .store
            .list()
            .into_iter()
            .map(|record| {
                json!({
                    "domain": record.domain,
                    "status": record.status.as_str(),
                    "tags": record.tags(),
                })
            })
            .collect();
        json!({ "domains": domains })
    }

    /// Process-level view: uptime and transport pool counters.
    pub fn system(&self) -> serde_json::Value {
        json!({
            "uptime_secs": self.started_at.elapsed().as_secs(),
            "domain_count": self.store.len(),
            "connection_pool": self.pool_stats.snapshot(),
        })
    }

    /// Combined snapshot for the shutdown envelope.
    pub fn snapshot(&self) -> serde_json::Value {
        json!({
            "system": self.system(),
            "domains": self.domains(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus::Registry;

    #[tokio::test]
    async fn test_snapshot_shape() {
        let store = Arc::new(DomainStore::in_memory());
        store
            .insert_new("example.com", "ops@example.com", Default::default())
            .await
            .unwrap();

        let registry = Registry::new();
        let analytics = Analytics::new(store, Arc::new(PoolStats::new(&registry)));

        let snapshot = analytics.snapshot();
        assert_eq!(snapshot["system"]["domain_count"], 1);
        assert_eq!(snapshot["domains"]["domains"][0]["domain"], "example.com");
        assert_eq!(snapshot["domains"]["domains"][0]["status"], "inactive");
        // Key material must never leak into analytics.
        assert!(snapshot["domains"]["domains"][0].get("cert_key_pem").is_none());
    }
}
