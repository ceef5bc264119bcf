//! Client-wide tunables. Mirrors the way the server's own `Config` externalizes
//! constants the original hardcodes: every interval, timeout, and threshold
//! is a field here with its own default, not a literal scattered through
//! the code.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Weighted health-demerit ("dun") contribution of each failure kind.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DunWeights {
    #[serde(default = "default_user_timeout")]
    pub user_timeout: u32,
    #[serde(default = "default_network_error")]
    pub network_error: u32,
    #[serde(default = "default_fd_restart")]
    pub fd_restart: u32,
    #[serde(default = "default_info_fail")]
    pub info_fail: u32,
    #[serde(default = "default_replicas_fetch")]
    pub replicas_fetch: u32,
    #[serde(default = "default_no_endpoint")]
    pub no_endpoint: u32,
    #[serde(default = "default_bad_name")]
    pub bad_name: u32,
}

fn default_user_timeout() -> u32 {
    1
}
fn default_network_error() -> u32 {
    50
}
fn default_fd_restart() -> u32 {
    50
}
fn default_info_fail() -> u32 {
    300
}
fn default_replicas_fetch() -> u32 {
    1000
}
fn default_no_endpoint() -> u32 {
    1000
}
fn default_bad_name() -> u32 {
    1000
}

impl Default for DunWeights {
    fn default() -> Self {
        Self {
            user_timeout: default_user_timeout(),
            network_error: default_network_error(),
            fd_restart: default_fd_restart(),
            info_fail: default_info_fail(),
            replicas_fetch: default_replicas_fetch(),
            no_endpoint: default_no_endpoint(),
            bad_name: default_bad_name(),
        }
    }
}

/// Top-level policy object, constructed with `ClientPolicy::default()` or
/// loaded from a TOML file via `ClientPolicy::from_file`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientPolicy {
    /// Cluster tender period, ~1.2s.
    pub tender_interval: DurationSecs,
    /// Per-node health-check timer period, ~1.0s.
    pub node_timer_interval: DurationSecs,
    /// Accumulated dun weight at which a node latches `dunned = true`.
    pub dun_threshold: u32,
    pub dun_weights: DunWeights,
    /// Minimum time between successive partition-replica refetches for a
    /// single node.
    pub partition_refresh_min_interval: DurationSecs,
    /// Idle connections kept per node before `put` starts closing instead.
    pub max_pool_size_per_node: usize,
    pub connect_timeout: DurationMillis,
    pub read_timeout: DurationMillis,
    pub info_timeout: DurationMillis,
    /// Size of the scan worker pool, shared across every cluster in the process.
    pub scan_worker_threads: usize,
    /// Maximum namespace-name length accepted by the info/partition parsers;
    /// anything longer is rejected.
    pub max_namespace_len: usize,
}

impl Default for ClientPolicy {
    fn default() -> Self {
        Self {
            tender_interval: DurationSecs(Duration::from_millis(1200)),
            node_timer_interval: DurationSecs(Duration::from_millis(1000)),
            dun_threshold: 800,
            dun_weights: DunWeights::default(),
            partition_refresh_min_interval: DurationSecs(Duration::from_secs(5)),
            max_pool_size_per_node: 8,
            connect_timeout: DurationMillis(Duration::from_millis(1000)),
            read_timeout: DurationMillis(Duration::from_millis(1000)),
            info_timeout: DurationMillis(Duration::from_millis(1000)),
            scan_worker_threads: num_cpus_fallback(),
            max_namespace_len: 30,
        }
    }
}

impl ClientPolicy {
    /// Loads policy overrides from a TOML file, falling back to defaults for
    /// anything unset.
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .build()?;
        Ok(settings.try_deserialize()?)
    }
}

fn num_cpus_fallback() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

/// A `Duration` newtype so it round-trips through TOML as plain seconds
/// without pulling in `humantime-serde` for a crate this small.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DurationSecs(#[serde(with = "duration_secs")] pub Duration);

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DurationMillis(#[serde(with = "duration_millis")] pub Duration);

impl From<DurationSecs> for Duration {
    fn from(d: DurationSecs) -> Duration {
        d.0
    }
}

impl From<DurationMillis> for Duration {
    fn from(d: DurationMillis) -> Duration {
        d.0
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
