//! Tracks the known server nodes, and picks one for each call.

use crate::policy::EndpointConfig;
#[cfg(feature = "probes")]
use crate::probes;

use rand::{rng, Rng};
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;
use thiserror::Error;
use tracing::{event, instrument, Level};

#[derive(Error, Debug)]
pub enum Error {
    #[error("No endpoints are known")]
    NoEndpoints,
}

/// Identifies a server node.
#[derive(Copy, Clone, PartialEq, Eq, Ord, PartialOrd, Debug, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct NodeId(pub u32);

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

// Priorities are "punitive": a higher value makes an endpoint less
// preferable.
const BASELINE_PRIORITY: u32 = 0;
const REMOTE_LOCATION_PRIORITY: u32 = 1;
const PESSIMIZED_PRIORITY: u32 = u32::MAX;

// Once more than this percentage of endpoints are pessimized, the caller
// should rediscover the topology.
const DISCOVERY_DEGRADATION_PERCENT: usize = 50;

/// A single server node, and how to reach it.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Endpoint {
    pub node_id: NodeId,
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
    pub location: String,
    priority: u32,
}

impl Endpoint {
    pub fn new(node_id: NodeId, host: impl Into<String>, port: u16) -> Self {
        Self {
            node_id,
            host: host.into(),
            port,
            use_tls: false,
            location: String::new(),
            priority: BASELINE_PRIORITY,
        }
    }

    pub fn with_tls(mut self, use_tls: bool) -> Self {
        self.use_tls = use_tls;
        self
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = location.into();
        self
    }

    /// The endpoint string, which identifies this endpoint and its channel.
    pub fn address(&self) -> String {
        let scheme = if self.use_tls { "grpcs" } else { "grpc" };
        format!("{scheme}://{}:{}", self.host, self.port)
    }

    /// Lower priorities are preferred.
    pub fn priority(&self) -> u32 {
        self.priority
    }

    pub fn is_pessimized(&self) -> bool {
        self.priority == PESSIMIZED_PRIORITY
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.address().fmt(f)
    }
}

#[derive(Default)]
struct Endpoints {
    // Sorted by (priority, address).
    list: Vec<Endpoint>,
    by_node: HashMap<NodeId, usize>,

    // The number of leading entries in "list" sharing the best priority.
    preferred_count: usize,
    pessimized_count: usize,
}

impl Endpoints {
    fn reindex(&mut self) {
        self.list
            .sort_by_cached_key(|endpoint| (endpoint.priority, endpoint.address()));
        self.by_node = self
            .list
            .iter()
            .enumerate()
            .map(|(index, endpoint)| (endpoint.node_id, index))
            .collect();
        self.preferred_count = match self.list.first() {
            Some(best) => self
                .list
                .iter()
                .take_while(|endpoint| endpoint.priority == best.priority)
                .count(),
            None => 0,
        };
        self.pessimized_count = self.list.iter().filter(|e| e.is_pessimized()).count();
    }
}

/// The set of known endpoints.
///
/// Reads ([Self::get_endpoint]) vastly outnumber writes ([Self::reset],
/// [Self::pessimize]), so the set lives behind a reader/writer lock.
pub struct EndpointPool {
    config: EndpointConfig,
    endpoints: RwLock<Endpoints>,
}

impl EndpointPool {
    pub fn new(config: EndpointConfig) -> Self {
        Self {
            config,
            endpoints: RwLock::new(Endpoints::default()),
        }
    }

    fn initial_priority(&self, endpoint: &Endpoint) -> u32 {
        match &self.config.preferred_location {
            Some(location) if *location != endpoint.location => REMOTE_LOCATION_PRIORITY,
            _ => BASELINE_PRIORITY,
        }
    }

    /// Replaces the set of endpoints wholesale.
    ///
    /// Duplicate endpoint strings are skipped. Returns the endpoints which
    /// were known before this call but are absent from the new set, so
    /// their channels can be torn down.
    #[instrument(skip_all, name = "EndpointPool::reset")]
    pub fn reset(&self, endpoints: impl IntoIterator<Item = Endpoint>) -> Vec<Endpoint> {
        let mut seen = HashSet::new();
        let mut list = vec![];
        for mut endpoint in endpoints {
            let address = endpoint.address();
            if !seen.insert(address.clone()) {
                event!(Level::WARN, endpoint = %address, "Skipping duplicate endpoint");
                continue;
            }
            endpoint.priority = self.initial_priority(&endpoint);
            list.push(endpoint);
        }

        let mut endpoints = self.endpoints.write().unwrap();
        let removed: Vec<Endpoint> = endpoints
            .list
            .iter()
            .filter(|old| !seen.contains(&old.address()))
            .cloned()
            .collect();
        endpoints.list = list;
        endpoints.reindex();

        event!(
            Level::INFO,
            count = endpoints.list.len(),
            removed = removed.len(),
            "Endpoints reset"
        );
        removed
    }

    /// Picks an endpoint for a call.
    ///
    /// If `node_id` names a known node, that node's endpoint is returned, so
    /// calls pinned to a session stay on its node. Otherwise an endpoint is
    /// chosen uniformly at random among those sharing the best priority.
    pub fn get_endpoint(&self, node_id: Option<NodeId>) -> Result<Endpoint, Error> {
        let endpoints = self.endpoints.read().unwrap();
        if let Some(index) = node_id.and_then(|node_id| endpoints.by_node.get(&node_id)) {
            return Ok(endpoints.list[*index].clone());
        }
        if endpoints.preferred_count == 0 {
            return Err(Error::NoEndpoints);
        }
        let index = rng().random_range(0..endpoints.preferred_count);
        Ok(endpoints.list[index].clone())
    }

    /// Marks an endpoint as unhealthy.
    ///
    /// Returns true if more than half of all endpoints are now pessimized,
    /// signalling that the topology should be rediscovered. Pessimizing an
    /// endpoint which is already pessimized, or unknown, returns false.
    #[instrument(skip(self), fields(endpoint = %endpoint), name = "EndpointPool::pessimize")]
    pub fn pessimize(&self, endpoint: &Endpoint) -> bool {
        let address = endpoint.address();
        let mut endpoints = self.endpoints.write().unwrap();

        let Some(target) = endpoints.list.iter_mut().find(|e| e.address() == address) else {
            event!(Level::DEBUG, "Ignoring pessimization of unknown endpoint");
            return false;
        };
        if target.is_pessimized() {
            return false;
        }
        target.priority = PESSIMIZED_PRIORITY;
        endpoints.reindex();

        #[cfg(feature = "probes")]
        probes::endpoint__pessimized!(|| address.as_str());

        let needs_discovery = endpoints.pessimized_count * 100
            > endpoints.list.len() * DISCOVERY_DEGRADATION_PERCENT;
        event!(
            Level::WARN,
            pessimized = endpoints.pessimized_count,
            total = endpoints.list.len(),
            needs_discovery,
            "Endpoint pessimized"
        );
        needs_discovery
    }

    /// A snapshot of all endpoints, most preferred first.
    pub fn endpoints(&self) -> Vec<Endpoint> {
        self.endpoints.read().unwrap().list.clone()
    }

    pub fn len(&self) -> usize {
        self.endpoints.read().unwrap().list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for EndpointPool {
    fn default() -> Self {
        Self::new(EndpointConfig::default())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn endpoints(count: u32) -> Vec<Endpoint> {
        (1..=count)
            .map(|i| Endpoint::new(NodeId(i), format!("node-{i}"), 2135))
            .collect()
    }

    #[test]
    fn empty_pool_has_no_endpoint() {
        let pool = EndpointPool::default();
        assert!(matches!(pool.get_endpoint(None), Err(Error::NoEndpoints)));
        assert!(matches!(
            pool.get_endpoint(Some(NodeId(1))),
            Err(Error::NoEndpoints)
        ));
    }

    #[test]
    fn get_endpoint_prefers_known_node() {
        let pool = EndpointPool::default();
        pool.reset(endpoints(5));

        for _ in 0..20 {
            let endpoint = pool.get_endpoint(Some(NodeId(3))).unwrap();
            assert_eq!(endpoint.node_id, NodeId(3));
        }

        // Unknown nodes fall back to random selection.
        let endpoint = pool.get_endpoint(Some(NodeId(42))).unwrap();
        assert!((1..=5).contains(&endpoint.node_id.0));
    }

    #[test]
    fn get_endpoint_skips_pessimized() {
        let pool = EndpointPool::default();
        let all = endpoints(5);
        pool.reset(all.clone());

        assert!(!pool.pessimize(&all[0]));
        assert!(!pool.pessimize(&all[2]));
        assert!(pool.pessimize(&all[4]));

        for _ in 0..200 {
            let endpoint = pool.get_endpoint(None).unwrap();
            assert!(!endpoint.is_pessimized());
            assert!(
                [NodeId(2), NodeId(4)].contains(&endpoint.node_id),
                "Unexpected endpoint {endpoint}"
            );
        }

        // A pessimized endpoint is still reachable by its node.
        let pinned = pool.get_endpoint(Some(NodeId(1))).unwrap();
        assert!(pinned.is_pessimized());
    }

    #[test]
    fn pessimize_twice_is_a_noop() {
        let pool = EndpointPool::default();
        let all = endpoints(3);
        pool.reset(all.clone());

        // 1 of 3 pessimized: not over the threshold.
        assert!(!pool.pessimize(&all[0]));
        assert!(!pool.pessimize(&all[0]));

        // 2 of 3 pessimized: over the threshold.
        assert!(pool.pessimize(&all[1]));
        assert!(!pool.pessimize(&all[1]));
    }

    #[test]
    fn half_pessimized_is_not_degraded() {
        let pool = EndpointPool::default();
        let all = endpoints(4);
        pool.reset(all.clone());

        assert!(!pool.pessimize(&all[0]));
        assert!(!pool.pessimize(&all[1]));
        assert!(pool.pessimize(&all[2]));
    }

    #[test]
    fn all_pessimized_still_selects() {
        let pool = EndpointPool::default();
        let all = endpoints(2);
        pool.reset(all.clone());
        pool.pessimize(&all[0]);
        pool.pessimize(&all[1]);

        assert!(pool.get_endpoint(None).unwrap().is_pessimized());
    }

    #[test]
    fn reset_reports_removed_endpoints() {
        let pool = EndpointPool::default();
        let all = endpoints(4);

        assert!(pool.reset(all.clone()).is_empty());
        assert!(pool.reset(all.clone()).is_empty());

        let removed = pool.reset(all[1..].to_vec());
        assert_eq!(removed, vec![all[0].clone()]);
        assert_eq!(pool.len(), 3);
    }

    #[test]
    fn reset_skips_duplicates_and_clears_pessimization() {
        let pool = EndpointPool::default();
        let mut all = endpoints(2);
        all.push(Endpoint::new(NodeId(9), "node-1", 2135));
        pool.reset(all.clone());
        assert_eq!(pool.len(), 2);

        pool.pessimize(&all[0]);
        pool.reset(all);
        assert!(pool.endpoints().iter().all(|e| !e.is_pessimized()));
    }

    #[test]
    fn tls_endpoints_are_distinct() {
        let plain = Endpoint::new(NodeId(1), "node", 2135);
        let secure = Endpoint::new(NodeId(2), "node", 2135).with_tls(true);
        assert_eq!(plain.address(), "grpc://node:2135");
        assert_eq!(secure.address(), "grpcs://node:2135");

        let pool = EndpointPool::default();
        pool.reset([plain, secure]);
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn preferred_location_wins_while_healthy() {
        let pool = EndpointPool::new(EndpointConfig {
            preferred_location: Some("vla".to_string()),
            ..Default::default()
        });
        let local = Endpoint::new(NodeId(1), "local", 2135).with_location("vla");
        let remote = Endpoint::new(NodeId(2), "remote", 2135).with_location("sas");
        pool.reset([local.clone(), remote]);

        for _ in 0..20 {
            assert_eq!(pool.get_endpoint(None).unwrap().node_id, NodeId(1));
        }

        pool.pessimize(&local);
        for _ in 0..20 {
            assert_eq!(pool.get_endpoint(None).unwrap().node_id, NodeId(2));
        }
    }
}
