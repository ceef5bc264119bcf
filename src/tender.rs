//! Cluster and per-node health/discovery loops.
//!
//! Two timers run independently, matching the original client's split
//! between a cluster-wide tender pass and each node's own health timer:
//! the cluster tender re-walks the seed list whenever the node vector is
//! empty, and every live node runs its own loop that probes liveness,
//! applies the dun-weight policy, and gossips new peers.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::cluster::Cluster;
use crate::error::Result;
use crate::info::InfoClient;
use crate::net::resolver;
use crate::node::Node;
use crate::partition::Intent;
use crate::refs::{self, RefTag};

/// Spawns the cluster-wide tender loop as a background task owned by the
/// cluster's own lifetime: the loop exits as soon as `cluster.shutdown` is
/// observed, so it never outlives `Cluster::destroy`.
pub fn spawn_tender_loop(cluster: Arc<Cluster>) {
    let interval: Duration = cluster.policy.tender_interval.into();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            if cluster.is_shutdown() {
                debug!("cluster shutdown observed, stopping tender loop");
                return;
            }
            tend_cluster(&cluster).await;
        }
    });
}

/// One cluster-wide tender pass: if no nodes are known yet, re-resolve and
/// probe every seed, adding whatever responds as a new node.
async fn tend_cluster(cluster: &Arc<Cluster>) {
    if cluster.total_node_count() > 0 {
        return;
    }

    let addrs = cluster.resolve_seeds().await;
    if addrs.is_empty() {
        warn!("no seed addresses resolved this tender pass");
        return;
    }

    for addr in addrs {
        match probe_seed(cluster, addr).await {
            Ok(node) => {
                let name = node.name.clone();
                if cluster.add_node(node.clone()) {
                    info!(node = %name, %addr, "discovered node from seed");
                    spawn_node_timer(cluster.clone(), node);
                }
            }
            Err(e) => debug!(%addr, error = %e, "seed probe failed"),
        }
    }
}

async fn probe_seed(cluster: &Arc<Cluster>, addr: std::net::SocketAddr) -> Result<Arc<Node>> {
    let mut stream = tokio::time::timeout(
        cluster.policy.connect_timeout.into(),
        tokio::net::TcpStream::connect(addr),
    )
    .await
    .map_err(|_| crate::error::ClientError::Timeout)??;

    let pairs = InfoClient::request(&mut stream, &["node"], cluster.policy.info_timeout.into()).await?;
    let name = pairs
        .into_iter()
        .find(|(k, _)| k == "node")
        .map(|(_, v)| v)
        .ok_or_else(|| crate::error::ClientError::ParseError("seed reply missing 'node'".into()))?;

    Ok(Node::new(name, vec![addr], Arc::downgrade(cluster), &cluster.policy))
}

/// Spawns a node's own health timer. Exits on cluster shutdown, matching the
/// resolution of the shutdown-ordering open question: the flag is checked
/// first, before anything else in the loop body, and the loop returns
/// immediately rather than completing one more probe.
pub fn spawn_node_timer(cluster: Arc<Cluster>, node: Arc<Node>) {
    let interval: Duration = cluster.policy.node_timer_interval.into();
    refs::reserve(RefTag::Timer);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            if cluster.is_shutdown() {
                debug!(node = %node.name, "cluster shutdown observed, stopping node timer");
                refs::release(RefTag::Timer);
                return;
            }
            tend_node(&cluster, &node).await;
            if node.is_dunned() {
                debug!(node = %node.name, "node dunned, timer will not re-arm");
                refs::release(RefTag::Timer);
                return;
            }
        }
    });
}

/// One per-node health probe: fetch `node`, `partition-generation`, and
/// `services`; on success reset the dun counter and gossip in any new peers;
/// on failure apply the appropriate dun weight.
async fn tend_node(cluster: &Arc<Cluster>, node: &Arc<Node>) {
    if node.is_dunned() {
        cluster.evict_node(node);
        debug!(node = %node.name, "dunned node purged from partition table and node set");
        return;
    }

    cluster.infos_in_progress.fetch_add(1, std::sync::atomic::Ordering::AcqRel);
    let result = tend_node_inner(cluster, node).await;
    cluster.infos_in_progress.fetch_sub(1, std::sync::atomic::Ordering::AcqRel);

    match result {
        Ok(()) => node.mark_healthy(),
        // NoEndpoint and BadName are dunned at their point of detection in
        // `tend_node_inner`, with the exact weight the failure calls for;
        // applying another dun here on top of that would double-count a
        // single failure.
        Err(e @ crate::error::ClientError::NoEndpoint)
        | Err(e @ crate::error::ClientError::BadName(_)) => {
            debug!(node = %node.name, error = %e, "node probe failed (already dunned at source)");
        }
        Err(e) => {
            let weight = match &e {
                crate::error::ClientError::Timeout => cluster.policy.dun_weights.user_timeout,
                crate::error::ClientError::Io(_) => cluster.policy.dun_weights.network_error,
                // A stale pooled connection forces a fresh connect, the
                // client-side analogue of the server having restarted the fd.
                crate::error::ClientError::Transient => cluster.policy.dun_weights.fd_restart,
                crate::error::ClientError::ParseError(_) => cluster.policy.dun_weights.replicas_fetch,
                _ => cluster.policy.dun_weights.info_fail,
            };
            node.dun(weight, cluster.policy.dun_threshold, "node-timer-probe-failed");
            debug!(node = %node.name, error = %e, weight, "node probe failed");
        }
    }
}

async fn tend_node_inner(cluster: &Arc<Cluster>, node: &Arc<Node>) -> Result<()> {
    let endpoints = node.endpoints();
    if endpoints.is_empty() {
        node.dun(
            cluster.policy.dun_weights.no_endpoint,
            cluster.policy.dun_threshold,
            "no-endpoint",
        );
        return Err(crate::error::ClientError::NoEndpoint);
    }
    let mut conn = node
        .pool
        .get(&endpoints)
        .await
        .map_err(crate::error::ClientError::from)?;

    let names = ["node", "partition-generation", "services"];
    let pairs = InfoClient::request(
        conn.stream_mut(),
        &names,
        cluster.policy.info_timeout.into(),
    )
    .await?;
    node.pool.put(conn);

    let mut reported_generation = None;
    for (key, value) in &pairs {
        match key.as_str() {
            "node" => {
                if *value != node.name {
                    node.dun(
                        cluster.policy.dun_weights.bad_name,
                        cluster.policy.dun_threshold,
                        "bad-name",
                    );
                    return Err(crate::error::ClientError::BadName(format!(
                        "node reported name '{value}', expected '{}'",
                        node.name
                    )));
                }
            }
            "services" => handle_services(cluster, value).await,
            "partition-generation" => reported_generation = value.parse::<u32>().ok(),
            _ => {}
        }
    }

    if let Some(gen) = reported_generation {
        if gen != node.partition_generation() && should_refresh_partitions(cluster, node) {
            refresh_partitions(cluster, node).await?;
        }
    }
    Ok(())
}

fn should_refresh_partitions(cluster: &Arc<Cluster>, node: &Arc<Node>) -> bool {
    let min_interval: Duration = cluster.policy.partition_refresh_min_interval.into();
    now_ms() - node.partition_last_req_ms() >= min_interval.as_millis() as i64
}

/// Follow-up Info for `replicas-read\nreplicas-write\npartition-generation`,
/// fired only when the node's reported generation moved and the last fetch
/// is stale enough. The node is cleared from every partition slot before the
/// freshly parsed replica strings are reapplied, so slots it no longer owns
/// don't linger stale.
async fn refresh_partitions(cluster: &Arc<Cluster>, node: &Arc<Node>) -> Result<()> {
    let endpoints = node.endpoints();
    let mut conn = node
        .pool
        .get(&endpoints)
        .await
        .map_err(crate::error::ClientError::from)?;

    let names = ["replicas-read", "replicas-write", "partition-generation"];
    let pairs = InfoClient::request(
        conn.stream_mut(),
        &names,
        cluster.policy.info_timeout.into(),
    )
    .await?;
    node.pool.put(conn);

    cluster.partitions.remove_node(node);
    for (key, value) in &pairs {
        match key.as_str() {
            "replicas-read" => apply_replicas(cluster, node, value, false),
            "replicas-write" => apply_replicas(cluster, node, value, true),
            "partition-generation" => handle_partition_generation(node, value),
            _ => {}
        }
    }
    node.touch_partition_last_req(now_ms());
    Ok(())
}

fn handle_partition_generation(node: &Arc<Node>, value: &str) {
    if let Ok(gen) = value.parse::<u32>() {
        node.set_partition_generation(gen);
    }
}

fn apply_replicas(cluster: &Arc<Cluster>, node: &Arc<Node>, value: &str, write: bool) {
    if let Err(e) = cluster.partitions.apply_replicas_string(
        node.clone(),
        value,
        write,
        cluster.policy.max_namespace_len,
    ) {
        node.dun(
            cluster.policy.dun_weights.replicas_fetch,
            cluster.policy.dun_threshold,
            "replicas-fetch",
        );
        warn!(node = %node.name, error = %e, "failed to apply replicas string");
    }
}

/// Parses a `services` gossip body (`host:port;host:port;...`) and connects
/// to any peer not already known.
async fn handle_services(cluster: &Arc<Cluster>, body: &str) {
    for part in body.split(';').filter(|p| !p.is_empty()) {
        let Some((host, port_str)) = part.rsplit_once(':') else {
            continue;
        };
        let Ok(port) = port_str.parse::<u16>() else {
            continue;
        };

        let addrs = match resolver::resolve(host, port).await {
            Ok(a) => a,
            Err(e) => {
                debug!(host, port, error = %e, "gossip peer resolution failed");
                continue;
            }
        };
        for addr in addrs {
            if cluster.has_endpoint(addr) {
                continue;
            }
            match probe_seed(cluster, addr).await {
                Ok(node) => {
                    let name = node.name.clone();
                    if cluster.add_node(node.clone()) {
                        info!(node = %name, %addr, "discovered node via gossip");
                        spawn_node_timer(cluster.clone(), node);
                    }
                }
                Err(e) => debug!(%addr, error = %e, "gossip peer probe failed"),
            }
        }
    }
}

/// Exposed so a node handle's owner can force an immediate replica lookup
/// (used by the scan executor when it needs a fresh write replica).
pub async fn refresh_node_for(cluster: &Arc<Cluster>, namespace: &str) -> Result<Arc<Node>> {
    cluster.get_node(namespace, 0, Intent::Read)
}

/// Monotonic milliseconds since process start. Only deltas between two calls
/// are meaningful; never compare against a wall-clock timestamp.
fn now_ms() -> i64 {
    static START: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();
    let start = *START.get_or_init(Instant::now);
    start.elapsed().as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn services_body_parses_host_port_pairs() {
        let body = "10.0.0.1:3000;10.0.0.2:3000";
        let mut found = Vec::new();
        for part in body.split(';').filter(|p| !p.is_empty()) {
            let (host, port) = part.rsplit_once(':').unwrap();
            found.push((host.to_string(), port.parse::<u16>().unwrap()));
        }
        assert_eq!(
            found,
            vec![
                ("10.0.0.1".to_string(), 3000),
                ("10.0.0.2".to_string(), 3000),
            ]
        );
    }
}
