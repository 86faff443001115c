use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use anyhow::anyhow;
use rustc_hash::FxHashMap;
use tracing::debug;
use crate::messaging::messaging_config::{MessagingConfig, Route, RouteMode};
use crate::messaging::node::Node;
use crate::util::random::Random;


/// A configured node together with its resolved network address
#[derive(Clone, Eq, PartialEq)]
pub struct Destination {
    pub node: Node,
    pub addr: SocketAddr,
}
impl Debug for Destination {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.node.name, self.addr)
    }
}

/// The destinations a single message is sent to, in the order they are tried. For
///  [RouteMode::LoadBalance] this is the single destination that was picked for this message.
#[derive(Clone, Debug)]
pub struct SendPlan {
    pub route_name: String,
    pub mode: RouteMode,
    pub destinations: Vec<Destination>,
    pub retransmit_pattern: Vec<Duration>,
}

struct RouteState {
    route: Route,
    destinations: Vec<Destination>,
    next_load_balanced: AtomicUsize,
}

/// [Topology] is the loaded form of a [MessagingConfig]: addresses are resolved, and routes are
///  indexed by name. It is immutable except for load balancing cursors, and it is replaced as a
///  whole on reconfiguration.
pub struct Topology {
    config: Arc<MessagingConfig>,
    local: Destination,
    nodes: FxHashMap<String, Destination>,
    routes: FxHashMap<String, RouteState>,
}

impl Topology {
    pub fn new(config: Arc<MessagingConfig>, random: &dyn Random) -> anyhow::Result<Topology> {
        config.validate()?;

        let mut nodes = FxHashMap::default();
        for node in &config.nodes {
            let addr = node.resolve()?;
            debug!("node {:?} resolved to {}", node, addr);
            nodes.insert(node.name.clone(), Destination { node: node.clone(), addr });
        }

        let local = nodes.get(&config.local_node)
            .cloned()
            .ok_or_else(|| anyhow!("local node {} is not configured", config.local_node))?;

        let mut routes = FxHashMap::default();
        for route in &config.routes {
            let destinations = route.destinations.iter()
                .map(|name| nodes.get(name)
                    .cloned()
                    .ok_or_else(|| anyhow!("route {} refers to unknown node {}", route.name, name)))
                .collect::<anyhow::Result<Vec<_>>>()?;

            // load balancing starts at a random offset so that restarted senders don't all start
            //  with the first destination
            let next_load_balanced = AtomicUsize::new(random.gen_usize_range(0..destinations.len()));

            routes.insert(route.name.clone(), RouteState {
                route: route.clone(),
                destinations,
                next_load_balanced,
            });
        }

        Ok(Topology {
            config,
            local,
            nodes,
            routes,
        })
    }

    pub fn config(&self) -> &MessagingConfig {
        &self.config
    }

    pub fn local_node(&self) -> &Node {
        &self.local.node
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local.addr
    }

    pub fn destination(&self, node_name: &str) -> Option<&Destination> {
        self.nodes.get(node_name)
    }

    pub fn resolve_route(&self, route_name: &str) -> anyhow::Result<SendPlan> {
        let state = self.routes.get(route_name)
            .ok_or_else(|| anyhow!("unknown route {}", route_name))?;

        let destinations = match state.route.mode {
            RouteMode::Failover => state.destinations.clone(),
            RouteMode::LoadBalance => {
                let idx = state.next_load_balanced.fetch_add(1, Ordering::Relaxed) % state.destinations.len();
                vec![state.destinations[idx].clone()]
            }
        };

        Ok(SendPlan {
            route_name: state.route.name.clone(),
            mode: state.route.mode,
            destinations,
            retransmit_pattern: state.route.retransmit_pattern.clone(),
        })
    }

    pub fn heartbeat_targets(&self) -> Vec<Destination> {
        self.config.heartbeat_targets()
            .into_iter()
            .filter_map(|n| self.nodes.get(&n.name).cloned())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::config::test_config;
    use crate::util::random::{MockRandom, RngRandom};

    fn random_starting_at(n: usize) -> MockRandom {
        let mut random = MockRandom::new();
        random.expect_gen_usize_range()
            .return_const(n);
        random
    }

    fn names(plan: &SendPlan) -> Vec<&str> {
        plan.destinations.iter()
            .map(|d| d.node.name.as_str())
            .collect()
    }

    #[test]
    fn test_failover_keeps_destination_order() {
        let topology = Topology::new(Arc::new(test_config("SL1")), &RngRandom {}).unwrap();

        for _ in 0..3 {
            let plan = topology.resolve_route("SL1->EL-failover").unwrap();
            assert_eq!(plan.mode, RouteMode::Failover);
            assert_eq!(names(&plan), vec!["EL1", "EL2"]);
            assert_eq!(plan.retransmit_pattern, vec![Duration::from_millis(100), Duration::from_millis(200), Duration::from_millis(400)]);
        }
    }

    #[test]
    fn test_load_balance_round_robin() {
        let topology = Topology::new(Arc::new(test_config("SL1")), &random_starting_at(1)).unwrap();

        let picked = (0..4)
            .map(|_| topology.resolve_route("SL1->EL").unwrap())
            .map(|plan| names(&plan).join(","))
            .collect::<Vec<_>>();
        assert_eq!(picked, vec!["EL2", "EL1", "EL2", "EL1"]);
    }

    #[test]
    fn test_unknown_route() {
        let topology = Topology::new(Arc::new(test_config("SL1")), &RngRandom {}).unwrap();
        assert!(topology.resolve_route("nope").is_err());
    }

    #[test]
    fn test_resolves_addresses() {
        let topology = Topology::new(Arc::new(test_config("EL1")), &RngRandom {}).unwrap();
        assert_eq!(topology.local_node().name, "EL1");
        assert_eq!(topology.local_addr(), "127.0.0.1:17002".parse().unwrap());
        assert_eq!(topology.destination("SL1").unwrap().addr, "127.0.0.1:17001".parse().unwrap());
        assert!(topology.destination("XX").is_none());
    }

    #[test]
    fn test_heartbeat_targets() {
        let topology = Topology::new(Arc::new(test_config("SL1")), &RngRandom {}).unwrap();
        let targets = topology.heartbeat_targets().into_iter()
            .map(|d| d.node.name)
            .collect::<Vec<_>>();
        assert_eq!(targets, vec!["EL1", "EL2"]);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut config = test_config("SL1");
        config.routes[0].retransmit_pattern.clear();
        assert!(Topology::new(Arc::new(config), &RngRandom {}).is_err());
    }
}
