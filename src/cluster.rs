//! Upstream clusters, snapshots, and connection pool selection.

use crate::headers::Headers;
use crate::upstream::UpstreamRequest;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;

/// Protocol family spoken to an upstream cluster.
///
/// This is a closed set: pool selection matches on every variant explicitly.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpstreamProtocol {
    /// Binary RPC framing.
    RpcFamily,
    /// HTTP/1.1.
    #[default]
    Http1,
    /// HTTP/2.
    Http2,
}

/// Immutable facts about a cluster, captured once per stream.
#[derive(Debug, Clone)]
pub struct ClusterInfo {
    /// Cluster name.
    pub name: String,
    /// Known endpoint addresses.
    pub endpoints: Vec<String>,
}

/// A shared, immutable cluster snapshot.
pub type ClusterSnapshot = Arc<ClusterInfo>;

/// Identity of the host serving one upstream attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostInfo {
    /// Endpoint address, e.g. `http://192.168.100.100:12200`.
    pub address: String,
}

/// Facts a load balancer may consult when picking a host.
pub trait LoadBalancerContext {
    /// Metadata-match criteria from the bound route, if any.
    fn metadata_match_criteria(&self) -> Option<&HashMap<String, String>>;

    /// The downstream request headers, if already decoded.
    fn downstream_headers(&self) -> Option<&Headers>;

    /// Hash key for consistent-hash policies.
    fn compute_hash_key(&self) -> Option<u64> {
        None
    }
}

/// Factory for upstream streams on some host of a cluster.
///
/// `new_stream` binds one attempt: the pool picks a host, builds a
/// [`crate::codec::StreamEncoder`] for it and reports readiness (or failure)
/// through the request handle. Callbacks and all subsequent upstream events
/// follow the posting contract documented in [`crate::codec`].
pub trait ConnectionPool {
    /// The protocol family this pool speaks.
    fn protocol(&self) -> UpstreamProtocol;

    /// Establishes one upstream stream for the given attempt.
    fn new_stream(&self, request: Rc<RefCell<UpstreamRequest>>);
}

/// Cluster lookup consumed by the stream engine.
pub trait ClusterManager {
    /// Returns an immutable snapshot of the named cluster.
    fn get(&self, cluster_name: &str) -> Option<ClusterSnapshot>;

    /// Returns a connection pool for the named cluster speaking the given
    /// protocol family, or `None` when no healthy pool exists.
    fn pool_for_cluster(
        &self,
        cluster_name: &str,
        protocol: UpstreamProtocol,
        ctx: &dyn LoadBalancerContext,
    ) -> Option<Rc<dyn ConnectionPool>>;
}

/// In-memory cluster manager with statically registered pools.
pub struct StaticClusterManager {
    clusters: DashMap<String, ClusterSnapshot>,
    pools: RefCell<HashMap<(String, UpstreamProtocol), Rc<dyn ConnectionPool>>>,
}

impl StaticClusterManager {
    /// Creates an empty manager.
    pub fn new() -> Self {
        Self {
            clusters: DashMap::new(),
            pools: RefCell::new(HashMap::new()),
        }
    }

    /// Registers (or replaces) a cluster.
    pub fn add_cluster(&self, name: impl Into<String>, endpoints: Vec<String>) {
        let name = name.into();
        let snapshot = Arc::new(ClusterInfo {
            name: name.clone(),
            endpoints,
        });
        self.clusters.insert(name, snapshot);
    }

    /// Registers a pool for a cluster; the key includes the pool's protocol.
    pub fn register_pool(&self, cluster_name: impl Into<String>, pool: Rc<dyn ConnectionPool>) {
        self.pools
            .borrow_mut()
            .insert((cluster_name.into(), pool.protocol()), pool);
    }
}

impl Default for StaticClusterManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ClusterManager for StaticClusterManager {
    fn get(&self, cluster_name: &str) -> Option<ClusterSnapshot> {
        self.clusters
            .get(cluster_name)
            .map(|entry| Arc::clone(entry.value()))
    }

    fn pool_for_cluster(
        &self,
        cluster_name: &str,
        protocol: UpstreamProtocol,
        _ctx: &dyn LoadBalancerContext,
    ) -> Option<Rc<dyn ConnectionPool>> {
        self.pools
            .borrow()
            .get(&(cluster_name.to_string(), protocol))
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullContext;

    impl LoadBalancerContext for NullContext {
        fn metadata_match_criteria(&self) -> Option<&HashMap<String, String>> {
            None
        }

        fn downstream_headers(&self) -> Option<&Headers> {
            None
        }
    }

    struct NullPool(UpstreamProtocol);

    impl ConnectionPool for NullPool {
        fn protocol(&self) -> UpstreamProtocol {
            self.0
        }

        fn new_stream(&self, _request: Rc<RefCell<UpstreamRequest>>) {}
    }

    #[test]
    fn test_cluster_snapshot() {
        let manager = StaticClusterManager::new();
        manager.add_cluster("server_1", vec!["http://127.0.0.1:12200".to_string()]);

        let snapshot = manager.get("server_1").unwrap();
        assert_eq!(snapshot.name, "server_1");
        assert_eq!(snapshot.endpoints.len(), 1);

        assert!(manager.get("unknown").is_none());
    }

    #[test]
    fn test_pool_selection_by_protocol() {
        let manager = StaticClusterManager::new();
        manager.add_cluster("server_1", vec![]);
        manager.register_pool("server_1", Rc::new(NullPool(UpstreamProtocol::Http1)));

        assert!(manager
            .pool_for_cluster("server_1", UpstreamProtocol::Http1, &NullContext)
            .is_some());
        assert!(manager
            .pool_for_cluster("server_1", UpstreamProtocol::Http2, &NullContext)
            .is_none());
        assert!(manager
            .pool_for_cluster("other", UpstreamProtocol::Http1, &NullContext)
            .is_none());
    }
}
