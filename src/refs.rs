//! Tagged reference-count bookkeeping for `Arc<Node>`, carried over from the
//! original client's debug-auditable call-site log: every reserve/release
//! site names itself so leaks show up as an asymmetric count per tag instead
//! of an opaque strong-count drift.
//!
//! The bookkeeping itself costs nothing unless the `debug-refs` feature is
//! enabled, in which case each tag's net reserve/release count is tracked in
//! a process-wide map for tests and diagnostics to inspect.

/// Call sites that reserve or release a node reference, named after the
/// original client's short tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RefTag {
    /// Owning slot in the cluster's node vector.
    ClusterOwner,
    /// Round-robin lookup in `random()`.
    Lookup,
    /// Caller-held handle returned from `Cluster::get`.
    Caller,
    /// In-flight info request.
    Info,
    /// Partition table, read-replica slot.
    PartitionRead,
    /// Partition table, write-replica slot.
    PartitionWrite,
    /// Node health timer.
    Timer,
}

#[cfg(feature = "debug-refs")]
mod counters {
    use super::RefTag;
    use dashmap::DashMap;
    use once_cell::sync::Lazy;
    use std::sync::atomic::{AtomicI64, Ordering};

    static COUNTS: Lazy<DashMap<RefTag, AtomicI64>> = Lazy::new(DashMap::new);

    pub fn reserve(tag: RefTag) {
        COUNTS
            .entry(tag)
            .or_insert_with(|| AtomicI64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn release(tag: RefTag) {
        COUNTS
            .entry(tag)
            .or_insert_with(|| AtomicI64::new(0))
            .fetch_sub(1, Ordering::Relaxed);
    }

    pub fn net(tag: RefTag) -> i64 {
        COUNTS.get(&tag).map(|c| c.load(Ordering::Relaxed)).unwrap_or(0)
    }
}

/// Records a reservation against `tag`. A no-op unless built with `debug-refs`.
#[inline]
pub fn reserve(#[allow(unused_variables)] tag: RefTag) {
    #[cfg(feature = "debug-refs")]
    counters::reserve(tag);
}

/// Records a release against `tag`. A no-op unless built with `debug-refs`.
#[inline]
pub fn release(#[allow(unused_variables)] tag: RefTag) {
    #[cfg(feature = "debug-refs")]
    counters::release(tag);
}

/// Returns the net reserve-minus-release count for `tag`. Always `0` unless
/// built with `debug-refs`.
#[cfg(feature = "debug-refs")]
pub fn net(tag: RefTag) -> i64 {
    counters::net(tag)
}

#[cfg(not(feature = "debug-refs"))]
pub fn net(_tag: RefTag) -> i64 {
    0
}

#[cfg(all(test, feature = "debug-refs"))]
mod tests {
    use super::*;

    #[test]
    fn reserve_and_release_balance_to_zero() {
        reserve(RefTag::Caller);
        reserve(RefTag::Caller);
        release(RefTag::Caller);
        release(RefTag::Caller);
        assert_eq!(net(RefTag::Caller), 0);
    }
}
