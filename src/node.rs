//! A reference-counted handle to a single cluster member.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{info, warn};

use crate::cluster::Cluster;
use crate::policy::ClientPolicy;
use crate::pool::ConnectionPool;

/// Sentinel for "partition generation not yet known".
pub const PARTITION_GEN_UNKNOWN: u32 = 0xFFFF_FFFF;

/// A cluster member: a stable name, an address list, a connection pool, and
/// the health bookkeeping the tender uses to decide when to evict it.
///
/// Nodes are co-owned by the cluster's node vector, the partition table, and
/// in-flight info/scan operations. The edge back to the owning
/// cluster is a `Weak` reference so the only plausible ownership cycle
/// (node → cluster → node vector → node) never keeps a cluster alive past
/// its own `destroy()`.
pub struct Node {
    pub name: String,
    endpoints: RwLock<Vec<SocketAddr>>,
    pub pool: ConnectionPool,
    dun_count: AtomicU32,
    dunned: AtomicBool,
    partition_generation: AtomicU32,
    partition_last_req_ms: AtomicI64,
    cluster: Weak<Cluster>,
}

impl Node {
    pub fn new(
        name: String,
        endpoints: Vec<SocketAddr>,
        cluster: Weak<Cluster>,
        policy: &ClientPolicy,
    ) -> Arc<Self> {
        Arc::new(Self {
            name,
            endpoints: RwLock::new(endpoints),
            pool: ConnectionPool::new(policy.max_pool_size_per_node, policy.connect_timeout.into()),
            dun_count: AtomicU32::new(0),
            dunned: AtomicBool::new(false),
            partition_generation: AtomicU32::new(PARTITION_GEN_UNKNOWN),
            partition_last_req_ms: AtomicI64::new(0),
            cluster,
        })
    }

    pub fn endpoints(&self) -> Vec<SocketAddr> {
        self.endpoints.read().clone()
    }

    /// Appends `addr` if it is not already present.
    pub fn add_endpoint_unique(&self, addr: SocketAddr) {
        let mut eps = self.endpoints.write();
        if !eps.contains(&addr) {
            eps.push(addr);
        }
    }

    pub fn cluster(&self) -> Option<Arc<Cluster>> {
        self.cluster.upgrade()
    }

    pub fn is_dunned(&self) -> bool {
        self.dunned.load(Ordering::Acquire)
    }

    pub fn dun_count(&self) -> u32 {
        self.dun_count.load(Ordering::Relaxed)
    }

    pub fn partition_generation(&self) -> u32 {
        self.partition_generation.load(Ordering::Relaxed)
    }

    pub fn set_partition_generation(&self, gen: u32) {
        self.partition_generation.store(gen, Ordering::Relaxed);
    }

    pub fn partition_last_req_ms(&self) -> i64 {
        self.partition_last_req_ms.load(Ordering::Relaxed)
    }

    pub fn touch_partition_last_req(&self, now_ms: i64) {
        self.partition_last_req_ms.store(now_ms, Ordering::Relaxed);
    }

    /// Accrues `weight` against this node's health counter and latches
    /// `dunned` once the threshold is crossed. Once latched it never
    /// un-latches.
    pub fn dun(&self, weight: u32, threshold: u32, reason: &str) {
        if self.dunned.load(Ordering::Acquire) {
            return;
        }
        let total = self.dun_count.fetch_add(weight, Ordering::AcqRel) + weight;
        if total > threshold {
            if !self.dunned.swap(true, Ordering::AcqRel) {
                warn!(node = %self.name, reason, total, threshold, "node latched as dunned");
            }
        }
    }

    /// Resets the health counter to zero on any successful reply.
    pub fn mark_healthy(&self) {
        self.dun_count.store(0, Ordering::Relaxed);
    }

    pub fn destroy(&self) {
        self.pool.drain();
        info!(node = %self.name, "node destroyed, connection pool drained");
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name)
            .field("endpoints", &self.endpoints())
            .field("dunned", &self.is_dunned())
            .field("dun_count", &self.dun_count())
            .field("partition_generation", &self.partition_generation())
            .finish()
    }
}

/// Sleeps `interval`, reissuing until cancelled. Used by the node's own
/// health timer: each node runs its own alongside the cluster-wide one.
pub async fn node_timer_tick(interval: Duration) {
    tokio::time::sleep(interval).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_node() -> Arc<Node> {
        Node::new(
            "BB9020011AC4202".to_string(),
            vec!["127.0.0.1:3000".parse().unwrap()],
            Weak::new(),
            &ClientPolicy::default(),
        )
    }

    #[test]
    fn dun_latches_past_threshold_and_never_unlatches() {
        let node = test_node();
        for _ in 0..800 {
            node.dun(1, 800, "user-timeout");
        }
        assert!(!node.is_dunned());
        node.dun(1, 800, "user-timeout");
        assert!(node.is_dunned());

        node.mark_healthy();
        assert!(node.is_dunned(), "dunned latch must never un-latch");
    }

    #[test]
    fn add_endpoint_unique_deduplicates() {
        let node = test_node();
        let addr: SocketAddr = "127.0.0.1:3000".parse().unwrap();
        node.add_endpoint_unique(addr);
        assert_eq!(node.endpoints().len(), 1);

        let addr2: SocketAddr = "127.0.0.1:3001".parse().unwrap();
        node.add_endpoint_unique(addr2);
        assert_eq!(node.endpoints().len(), 2);
    }
}
