//! Per-namespace partition tables mapping partition id to read/write replica
//! nodes.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use rand::Rng;
use tracing::warn;

use crate::error::{ClientError, Result};
use crate::node::Node;

/// Whether a lookup wants the read replica or the write replica for a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    Read,
    Write,
}

#[derive(Default)]
struct PartitionEntry {
    read: Option<Arc<Node>>,
    write: Option<Arc<Node>>,
}

/// The replica table for a single namespace: one entry per partition id.
struct NamespaceTable {
    entries: Vec<RwLock<PartitionEntry>>,
}

impl NamespaceTable {
    fn new(n_partitions: usize) -> Self {
        let mut entries = Vec::with_capacity(n_partitions);
        entries.resize_with(n_partitions, || RwLock::new(PartitionEntry::default()));
        Self { entries }
    }
}

/// The full set of namespace partition tables for a cluster.
///
/// `n_partitions` is learned from the first successful `partitions` info
/// reply and is immutable afterward: fixed for the life of the cluster
/// once known.
pub struct PartitionTable {
    namespaces: DashMap<String, Arc<NamespaceTable>>,
    n_partitions: AtomicU32,
}

impl PartitionTable {
    pub fn new() -> Self {
        Self {
            namespaces: DashMap::new(),
            n_partitions: AtomicU32::new(0),
        }
    }

    pub fn n_partitions(&self) -> u32 {
        self.n_partitions.load(Ordering::Acquire)
    }

    /// Learns the partition count on first use; a no-op on subsequent calls.
    /// Set once, never changed afterward.
    pub fn set_n_partitions(&self, n: u32) {
        let _ = self
            .n_partitions
            .compare_exchange(0, n, Ordering::AcqRel, Ordering::Acquire);
    }

    fn table_for(&self, namespace: &str) -> Option<Arc<NamespaceTable>> {
        let n_partitions = self.n_partitions();
        if n_partitions == 0 {
            return None;
        }
        Some(
            self.namespaces
                .entry(namespace.to_string())
                .or_insert_with(|| Arc::new(NamespaceTable::new(n_partitions as usize)))
                .clone(),
        )
    }

    /// Returns the replica node owning `partition_id` in `namespace`, or
    /// `None` if the table isn't populated yet (caller should fall back to a
    /// random node).
    pub fn get(&self, namespace: &str, partition_id: u32, intent: Intent) -> Option<Arc<Node>> {
        let table = self.table_for(namespace)?;
        let entry = table.entries.get(partition_id as usize)?.read();
        match intent {
            Intent::Read => entry.read.clone().or_else(|| entry.write.clone()),
            Intent::Write => entry.write.clone(),
        }
    }

    /// Picks a uniformly random node among those that are not dunned. Falls
    /// back to any node (even dunned ones) only if every node is dunned, and
    /// returns `None` only when `nodes` is empty.
    ///
    /// Fixes the original client's open question of counting the raw node
    /// vector instead of the healthy subset: an `Rng::gen_range` over the
    /// full vector length can select a dunned node even when healthy ones
    /// exist, simply because dunned nodes are not removed from the vector
    /// until the next tender pass.
    pub fn random(nodes: &[Arc<Node>]) -> Option<Arc<Node>> {
        let healthy: Vec<&Arc<Node>> = nodes.iter().filter(|n| !n.is_dunned()).collect();
        if !healthy.is_empty() {
            let idx = rand::thread_rng().gen_range(0..healthy.len());
            return Some(healthy[idx].clone());
        }
        if nodes.is_empty() {
            return None;
        }
        let idx = rand::thread_rng().gen_range(0..nodes.len());
        Some(nodes[idx].clone())
    }

    pub fn set(&self, node: Arc<Node>, namespace: &str, partition_id: u32, write: bool) {
        let Some(table) = self.table_for(namespace) else {
            warn!(namespace, "cannot set partition slot before n_partitions is known");
            return;
        };
        let Some(slot) = table.entries.get(partition_id as usize) else {
            warn!(namespace, partition_id, "partition id out of range, ignoring");
            return;
        };
        let mut entry = slot.write();
        if write {
            entry.write = Some(node);
        } else {
            entry.read = Some(node);
        }
    }

    /// Clears every slot pointing at `node`, across every namespace. Called
    /// when a node is removed from the cluster.
    pub fn remove_node(&self, node: &Arc<Node>) {
        for table in self.namespaces.iter() {
            for slot in &table.entries {
                let mut entry = slot.write();
                if entry.read.as_ref().is_some_and(|n| Arc::ptr_eq(n, node)) {
                    entry.read = None;
                }
                if entry.write.as_ref().is_some_and(|n| Arc::ptr_eq(n, node)) {
                    entry.write = None;
                }
            }
        }
    }

    /// Parses a `replicas-{read,write}` info response body
    /// (`namespace:partition_id;namespace:partition_id;...`) and applies each
    /// entry against `node`. Entries naming a namespace longer than
    /// `max_namespace_len` bytes or a partition id at or beyond
    /// `n_partitions` are skipped, leaving whatever neighboring entries are
    /// valid still applied.
    pub fn apply_replicas_string(
        &self,
        node: Arc<Node>,
        body: &str,
        write: bool,
        max_namespace_len: usize,
    ) -> Result<()> {
        if self.n_partitions() == 0 {
            return Err(ClientError::ParseError(
                "cannot parse replicas string before n_partitions is known".into(),
            ));
        }
        for part in body.split(';').filter(|p| !p.is_empty()) {
            let Some((ns, id_str)) = part.split_once(':') else {
                warn!(part, "malformed replicas entry, skipping");
                continue;
            };
            if crate::info::check_namespace_len(ns, max_namespace_len).is_err() {
                warn!(namespace = ns, "namespace name too long, skipping entry");
                continue;
            }
            let Ok(partition_id) = id_str.parse::<u32>() else {
                warn!(part, "non-numeric partition id, skipping");
                continue;
            };
            if partition_id >= self.n_partitions() {
                warn!(partition_id, "partition id out of range, skipping");
                continue;
            }
            self.set(node.clone(), ns, partition_id, write);
        }
        Ok(())
    }
}

impl Default for PartitionTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::ClientPolicy;
    use std::sync::Weak;

    fn node(name: &str) -> Arc<Node> {
        Node::new(name.to_string(), vec![], Weak::new(), &ClientPolicy::default())
    }

    #[test]
    fn get_before_n_partitions_known_returns_none() {
        let table = PartitionTable::new();
        assert!(table.get("test", 0, Intent::Read).is_none());
    }

    #[test]
    fn set_and_get_round_trip() {
        let table = PartitionTable::new();
        table.set_n_partitions(4096);
        let n = node("BB9020011AC4202");
        table.set(n.clone(), "test", 10, false);
        let got = table.get("test", 10, Intent::Read).unwrap();
        assert!(Arc::ptr_eq(&got, &n));
    }

    #[test]
    fn read_falls_back_to_write_replica() {
        let table = PartitionTable::new();
        table.set_n_partitions(4096);
        let n = node("BB9020011AC4202");
        table.set(n.clone(), "test", 10, true);
        let got = table.get("test", 10, Intent::Read).unwrap();
        assert!(Arc::ptr_eq(&got, &n));
    }

    #[test]
    fn remove_node_clears_all_slots() {
        let table = PartitionTable::new();
        table.set_n_partitions(4096);
        let n = node("BB9020011AC4202");
        table.set(n.clone(), "test", 10, false);
        table.set(n.clone(), "test", 11, true);
        table.remove_node(&n);
        assert!(table.get("test", 10, Intent::Read).is_none());
        assert!(table.get("test", 11, Intent::Write).is_none());
    }

    #[test]
    fn random_prefers_healthy_nodes_over_raw_vector_length() {
        let healthy = node("healthy");
        let dunned = node("dunned");
        for _ in 0..801 {
            dunned.dun(1, 800, "user-timeout");
        }
        let nodes = vec![healthy.clone(), dunned];
        for _ in 0..20 {
            let picked = PartitionTable::random(&nodes).unwrap();
            assert!(Arc::ptr_eq(&picked, &healthy));
        }
    }

    #[test]
    fn random_falls_back_when_all_dunned() {
        let a = node("a");
        for _ in 0..801 {
            a.dun(1, 800, "user-timeout");
        }
        let nodes = vec![a];
        assert!(PartitionTable::random(&nodes).is_some());
    }

    #[test]
    fn random_on_empty_vector_is_none() {
        assert!(PartitionTable::random(&[]).is_none());
    }

    #[test]
    fn apply_replicas_string_skips_oversized_namespace_but_keeps_valid_entries() {
        let table = PartitionTable::new();
        table.set_n_partitions(4096);
        let n = node("BB9020011AC4202");
        let oversized = "x".repeat(31);
        let body = format!("{oversized}:5;test:6");
        table.apply_replicas_string(n.clone(), &body, false, 30).unwrap();
        assert!(table.get(&oversized, 5, Intent::Read).is_none());
        assert!(table.get("test", 6, Intent::Read).is_some());
    }

    #[test]
    fn apply_replicas_string_skips_out_of_range_partition_id() {
        let table = PartitionTable::new();
        table.set_n_partitions(4096);
        let n = node("BB9020011AC4202");
        table
            .apply_replicas_string(n, "test:4096;test:100", false, 30)
            .unwrap();
        assert!(table.get("test", 100, Intent::Read).is_some());
    }
}
