//! Cluster membership: seed resolution, the node vector, and the partition
//! table that routes requests to replicas.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use crate::error::{ClientError, Result};
use crate::net::resolver;
use crate::node::Node;
use crate::partition::{Intent, PartitionTable};
use crate::policy::ClientPolicy;
use crate::refs::{self, RefTag};
use crate::tender;

/// A cluster connection: the seed list, the live node vector (`node_v_lock`
/// in the original client), and the partition table that routes digests to
/// replicas.
pub struct Cluster {
    pub(crate) policy: ClientPolicy,
    seeds: Mutex<Vec<(String, u16)>>,
    nodes: RwLock<Vec<Arc<Node>>>,
    pub(crate) partitions: PartitionTable,
    follow: AtomicBool,
    last_node: AtomicUsize,
    pub(crate) shutdown: AtomicBool,
    requests_in_progress: AtomicU64,
    pub(crate) infos_in_progress: AtomicU64,
}

impl Cluster {
    /// Creates a cluster with no seeds and starts its tender loop. Seeds must
    /// be added with `add_host` before the first tender pass can discover any
    /// nodes.
    pub fn create(policy: ClientPolicy) -> Arc<Self> {
        let cluster = Arc::new(Self {
            policy,
            seeds: Mutex::new(Vec::new()),
            nodes: RwLock::new(Vec::new()),
            partitions: PartitionTable::new(),
            follow: AtomicBool::new(true),
            last_node: AtomicUsize::new(0),
            shutdown: AtomicBool::new(false),
            requests_in_progress: AtomicU64::new(0),
            infos_in_progress: AtomicU64::new(0),
        });
        tender::spawn_tender_loop(cluster.clone());
        cluster
    }

    /// Registers a seed host, idempotently: re-adding the same `(host, port)`
    /// pair is a no-op.
    pub fn add_host(&self, host: impl Into<String>, port: u16) {
        let host = host.into();
        let mut seeds = self.seeds.lock();
        if !seeds.iter().any(|(h, p)| *h == host && *p == port) {
            info!(host, port, "registering seed host");
            seeds.push((host, port));
        }
    }

    pub fn seeds(&self) -> Vec<(String, u16)> {
        self.seeds.lock().clone()
    }

    pub fn follow(&self, enabled: bool) {
        self.follow.store(enabled, Ordering::Release);
    }

    pub fn is_following(&self) -> bool {
        self.follow.load(Ordering::Acquire)
    }

    pub fn active_node_count(&self) -> usize {
        self.nodes.read().iter().filter(|n| !n.is_dunned()).count()
    }

    pub fn total_node_count(&self) -> usize {
        self.nodes.read().len()
    }

    pub fn requests_in_progress(&self) -> u64 {
        self.requests_in_progress.load(Ordering::Relaxed)
    }

    pub(crate) fn begin_request(&self) {
        self.requests_in_progress.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn end_request(&self) {
        self.requests_in_progress.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn nodes_snapshot(&self) -> Vec<Arc<Node>> {
        self.nodes.read().clone()
    }

    /// Appends `node` to the live vector unless a node of the same name is
    /// already present. Returns whether it was newly added.
    pub(crate) fn add_node(&self, node: Arc<Node>) -> bool {
        let mut nodes = self.nodes.write();
        if nodes.iter().any(|n| n.name == node.name) {
            return false;
        }
        refs::reserve(RefTag::ClusterOwner);
        nodes.push(node);
        true
    }

    pub(crate) fn has_endpoint(&self, addr: std::net::SocketAddr) -> bool {
        self.nodes.read().iter().any(|n| n.endpoints().contains(&addr))
    }

    /// Purges a single dunned node from the node set and the partition
    /// table, releasing its owning reference. Called from the node's own
    /// health timer on the tick where it observes `node.is_dunned()`.
    pub(crate) fn evict_node(&self, node: &Arc<Node>) {
        let mut nodes = self.nodes.write();
        let before = nodes.len();
        nodes.retain(|n| !Arc::ptr_eq(n, node));
        if nodes.len() != before {
            self.partitions.remove_node(node);
            node.destroy();
            refs::release(RefTag::ClusterOwner);
        }
    }

    pub(crate) fn replace_nodes(&self, new_nodes: Vec<Arc<Node>>) {
        let mut nodes = self.nodes.write();
        for removed in nodes.iter() {
            if !new_nodes.iter().any(|n| Arc::ptr_eq(n, removed)) {
                self.partitions.remove_node(removed);
                removed.destroy();
                refs::release(RefTag::ClusterOwner);
            }
        }
        for added in &new_nodes {
            if !nodes.iter().any(|n| Arc::ptr_eq(n, added)) {
                refs::reserve(RefTag::ClusterOwner);
            }
        }
        *nodes = new_nodes;
    }

    /// Returns the replica node for `(namespace, partition_id)`, falling back
    /// to a random healthy node when the partition table doesn't know a
    /// replica yet.
    pub fn get_node(&self, namespace: &str, partition_id: u32, intent: Intent) -> Result<Arc<Node>> {
        if let Some(node) = self.partitions.get(namespace, partition_id, intent) {
            if !node.is_dunned() {
                refs::reserve(RefTag::Caller);
                return Ok(node);
            }
        }
        self.random_node()
    }

    /// Round-robins across the node vector, skipping dunned nodes, falling
    /// back to `PartitionTable::random` semantics when the round-robin
    /// cursor lands on an all-dunned vector.
    pub fn random_node(&self) -> Result<Arc<Node>> {
        let nodes = self.nodes.read();
        if nodes.is_empty() {
            return Err(ClientError::ClusterEmpty);
        }
        let node = PartitionTable::random(&nodes).ok_or(ClientError::ClusterEmpty)?;
        refs::reserve(RefTag::Caller);
        Ok(node)
    }

    /// Round-robin node selection for cases (tender seed re-walk, scan
    /// fan-out ordering) that want deterministic rotation rather than a
    /// random pick.
    pub(crate) fn next_round_robin(&self) -> Option<Arc<Node>> {
        let nodes = self.nodes.read();
        if nodes.is_empty() {
            return None;
        }
        let idx = self.last_node.fetch_add(1, Ordering::AcqRel) % nodes.len();
        Some(nodes[idx].clone())
    }

    /// Waits `delay_ms` for in-flight requests to drain, then tears the
    /// cluster down: stop the tender loop, drain every node's pool, and
    /// empty the node vector and partition table. Waits up to `delay_ms`
    /// for in-flight requests before forcing shutdown.
    pub async fn destroy(self: &Arc<Self>, delay_ms: u64) {
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_millis(delay_ms);
        while self.requests_in_progress() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        self.shutdown.store(true, Ordering::Release);

        let nodes: Vec<_> = self.nodes.write().drain(..).collect();
        for node in &nodes {
            self.partitions.remove_node(node);
            node.destroy();
            refs::release(RefTag::ClusterOwner);
        }
        self.seeds.lock().clear();
        debug!(nodes = nodes.len(), "cluster destroyed");
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    pub async fn resolve_seeds(&self) -> Vec<std::net::SocketAddr> {
        let mut out = Vec::new();
        for (host, port) in self.seeds() {
            match resolver::resolve(&host, port).await {
                Ok(addrs) => out.extend(addrs),
                Err(e) => tracing::warn!(host, port, error = %e, "seed resolution failed"),
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn add_host_is_idempotent() {
        let cluster = Cluster::create(ClientPolicy::default());
        cluster.add_host("127.0.0.1", 3000);
        cluster.add_host("127.0.0.1", 3000);
        assert_eq!(cluster.seeds().len(), 1);
        cluster.destroy(0).await;
    }

    #[tokio::test]
    async fn empty_cluster_random_node_is_cluster_empty() {
        let cluster = Cluster::create(ClientPolicy::default());
        assert!(matches!(cluster.random_node(), Err(ClientError::ClusterEmpty)));
        cluster.destroy(0).await;
    }

    #[tokio::test]
    async fn destroy_clears_seeds_and_nodes() {
        let cluster = Cluster::create(ClientPolicy::default());
        cluster.add_host("127.0.0.1", 3000);
        cluster.destroy(0).await;
        assert!(cluster.seeds().is_empty());
        assert_eq!(cluster.total_node_count(), 0);
        assert!(cluster.is_shutdown());
    }

    #[tokio::test]
    async fn round_robin_cycles_through_all_nodes() {
        let cluster = Cluster::create(ClientPolicy::default());
        let a = Node::new("a".into(), vec![], Arc::downgrade(&cluster), &cluster.policy);
        let b = Node::new("b".into(), vec![], Arc::downgrade(&cluster), &cluster.policy);
        cluster.replace_nodes(vec![a.clone(), b.clone()]);

        let first = cluster.next_round_robin().unwrap();
        let second = cluster.next_round_robin().unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        cluster.destroy(0).await;
    }
}
