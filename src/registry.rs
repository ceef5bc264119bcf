//! An explicit handle for tracking live clusters, in place of a hidden
//! process-wide global: a caller that wants process-wide cluster enumeration
//! constructs one `ClusterRegistry` and registers clusters with it; nothing
//! is registered implicitly.

use std::sync::{Arc, RwLock, Weak};

use crate::cluster::Cluster;

/// Holds weak references to clusters registered against it. A cluster that
/// is dropped elsewhere simply disappears from `active()` on the next call;
/// the registry never keeps a cluster alive.
#[derive(Default)]
pub struct ClusterRegistry {
    clusters: RwLock<Vec<Weak<Cluster>>>,
}

impl ClusterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, cluster: &Arc<Cluster>) {
        self.clusters.write().unwrap().push(Arc::downgrade(cluster));
    }

    /// Returns every still-live cluster registered, dropping dead weak
    /// entries along the way.
    pub fn active(&self) -> Vec<Arc<Cluster>> {
        let mut clusters = self.clusters.write().unwrap();
        clusters.retain(|w| w.strong_count() > 0);
        clusters.iter().filter_map(Weak::upgrade).collect()
    }

    pub fn len(&self) -> usize {
        self.active().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::ClientPolicy;

    #[tokio::test]
    async fn dropped_cluster_disappears_from_active() {
        let registry = ClusterRegistry::new();
        {
            let cluster = Cluster::create(ClientPolicy::default());
            registry.register(&cluster);
            assert_eq!(registry.len(), 1);
        }
        assert_eq!(registry.len(), 0);
    }
}
