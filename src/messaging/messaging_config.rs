use std::ops::RangeInclusive;
use std::time::Duration;
use anyhow::bail;
use rustc_hash::FxHashSet;
use crate::messaging::message::MessageEnvelope;
use crate::messaging::node::Node;


#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RouteMode {
    /// try destinations in list order, exhausting the retransmit pattern against each
    Failover,
    /// pick one destination per message, no failover to other destinations
    LoadBalance,
}

/// A [Route] is a named, directed policy for reaching a set of destination nodes. It is resolved
///  to concrete destinations each time a message is sent.
#[derive(Clone, Debug)]
pub struct Route {
    pub name: String,
    pub mode: RouteMode,
    /// Names of nodes that are expected to send on this route. This is descriptive and not
    ///  enforced when sending, but it determines heartbeat partners.
    pub possible_sources: Vec<String>,
    /// Names of destination nodes, in failover order for [RouteMode::Failover]
    pub destinations: Vec<String>,
    /// The waiting time after each transmission before the message is retransmitted. The last
    ///  entry doubles as the timeout after the final retransmission.
    pub retransmit_pattern: Vec<Duration>,
}

impl Route {
    pub fn new(name: &str, mode: RouteMode, possible_sources: &[&str], destinations: &[&str], retransmit_pattern: Vec<Duration>) -> Route {
        Route {
            name: name.to_string(),
            mode,
            possible_sources: possible_sources.iter().map(|s| s.to_string()).collect(),
            destinations: destinations.iter().map(|s| s.to_string()).collect(),
            retransmit_pattern,
        }
    }

    /// The time it takes to give up on a single destination: all waits of the pattern plus the
    ///  final timeout after the last retransmission
    pub fn destination_window(&self) -> Duration {
        let sum: Duration = self.retransmit_pattern.iter().sum();
        sum + self.max_attempt_timeout()
    }

    pub fn max_attempt_timeout(&self) -> Duration {
        self.retransmit_pattern.last()
            .copied()
            .unwrap_or_default()
    }

    /// The time it takes until a send on this route fails if no destination ever responds
    pub fn end_to_end_window(&self) -> Duration {
        match self.mode {
            RouteMode::Failover => self.destination_window() * self.destinations.len() as u32,
            RouteMode::LoadBalance => self.destination_window(),
        }
    }
}


#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AckSendStrategy {
    /// reply on the socket that received the message
    Immediately,
    /// reply through the pooled outbound sockets as a one-shot datagram
    SendCycle,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ListenerMode {
    /// several receive sockets bound to the same port (SO_REUSEPORT) where the platform supports
    ///  it, falling back to a single socket otherwise
    ReusePort,
    SingleSocket,
}


/// This is the complete, immutable configuration of a messaging instance. Reconfiguration means
///  re-initializing messaging with a new instance, it is never modified in place.
#[derive(Clone, Debug)]
pub struct MessagingConfig {
    /// name of the node this instance runs as - it must be one of the configured [Node]s
    pub local_node: String,
    pub nodes: Vec<Node>,
    pub routes: Vec<Route>,

    pub heartbeat_interval: Duration,
    /// A node is considered dead if no heartbeat arrived from it for this long. This should be
    ///  a small multiple of the heartbeat interval to tolerate some lost heartbeats.
    pub heartbeat_timeout: Duration,

    /// number of pre-bound outbound sockets
    pub send_pool_size: usize,
    /// number of receive sockets (and receive loops) for [ListenerMode::ReusePort]
    pub receive_transport_threads: usize,
    /// maximum number of concurrently running message deliveries to the application
    pub receive_worker_threads: usize,

    pub ack_send_strategy: AckSendStrategy,
    pub listener_mode: ListenerMode,

    /// If present, outbound sockets are bound to local ports from this range only
    pub client_port_range: Option<RangeInclusive<u16>>,

    /// name under which this instance reports statistics and logs
    pub metrics_domain: String,

    /// size of receive buffers - bigger datagrams are truncated and therefore invalid
    pub max_datagram_size: usize,
    pub cache_purge_interval: Duration,
    pub shutdown_drain_timeout: Duration,
}

impl MessagingConfig {
    pub const MAX_UDP_PAYLOAD: usize = 65507;

    pub fn new(local_node: &str, nodes: Vec<Node>, routes: Vec<Route>) -> MessagingConfig {
        MessagingConfig {
            local_node: local_node.to_string(),
            nodes,
            routes,
            heartbeat_interval: Duration::from_secs(1),
            heartbeat_timeout: Duration::from_secs(3),
            send_pool_size: 4,
            receive_transport_threads: 2,
            receive_worker_threads: 8,
            ack_send_strategy: AckSendStrategy::Immediately,
            listener_mode: ListenerMode::ReusePort,
            client_port_range: None,
            metrics_domain: "imscf.messaging".to_string(),
            max_datagram_size: Self::MAX_UDP_PAYLOAD,
            cache_purge_interval: Duration::from_secs(1),
            shutdown_drain_timeout: Duration::from_secs(5),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let mut node_names = FxHashSet::default();
        for node in &self.nodes {
            if node.name.is_empty() {
                bail!("node with empty name at {}:{}", node.host, node.port);
            }
            MessageEnvelope::validate_header_value("node name", &node.name)?;
            if !node_names.insert(node.name.as_str()) {
                bail!("duplicate node name {}", node.name);
            }
        }
        if !node_names.contains(self.local_node.as_str()) {
            bail!("local node {} is not a configured node", self.local_node);
        }

        let mut route_names = FxHashSet::default();
        for route in &self.routes {
            if route.name.is_empty() {
                bail!("route with empty name");
            }
            if !route_names.insert(route.name.as_str()) {
                bail!("duplicate route name {}", route.name);
            }
            if route.destinations.is_empty() {
                bail!("route {} has no destinations", route.name);
            }
            for node in route.destinations.iter().chain(route.possible_sources.iter()) {
                if !node_names.contains(node.as_str()) {
                    bail!("route {} refers to unknown node {}", route.name, node);
                }
            }
            if route.retransmit_pattern.is_empty() {
                bail!("route {} has an empty retransmit pattern", route.name);
            }
            if route.retransmit_pattern.iter().any(|d| d.is_zero()) {
                bail!("route {} has a zero duration in its retransmit pattern", route.name);
            }
        }

        if self.heartbeat_interval.is_zero() {
            bail!("heartbeat interval must be positive");
        }
        if self.heartbeat_timeout <= self.heartbeat_interval {
            bail!("heartbeat timeout {:?} must be longer than the heartbeat interval {:?}", self.heartbeat_timeout, self.heartbeat_interval);
        }
        if self.send_pool_size == 0 || self.receive_transport_threads == 0 || self.receive_worker_threads == 0 {
            bail!("pool sizes must be positive");
        }
        if let Some(range) = &self.client_port_range {
            if range.is_empty() || *range.start() == 0 {
                bail!("invalid client port range {:?}", range);
            }
        }
        if self.max_datagram_size < 256 || self.max_datagram_size > Self::MAX_UDP_PAYLOAD {
            bail!("max datagram size must be between 256 and {}", Self::MAX_UDP_PAYLOAD);
        }
        if self.cache_purge_interval.is_zero() {
            bail!("cache purge interval must be positive");
        }
        Ok(())
    }

    pub fn node(&self, name: &str) -> Option<&Node> {
        self.nodes.iter()
            .find(|n| n.name == name)
    }

    pub fn route(&self, name: &str) -> Option<&Route> {
        self.routes.iter()
            .find(|r| r.name == name)
    }

    /// How long a receiver remembers a message id as accepted or rejected: twice the longest
    ///  time a sender keeps retransmitting to a single destination, considering routes ending
    ///  at this node (or all routes if there are none).
    pub fn dedup_ttl(&self) -> Duration {
        let inbound = self.routes.iter()
            .filter(|r| r.destinations.contains(&self.local_node))
            .map(|r| r.destination_window())
            .max();

        let window = inbound
            .or_else(|| self.routes.iter().map(|r| r.destination_window()).max())
            .unwrap_or(self.heartbeat_timeout);
        window * 2
    }

    /// How long ACKs are remembered per message id for detecting duplicate and conflicting ACKs
    pub fn ack_correlation_ttl(&self) -> Duration {
        self.routes.iter()
            .map(|r| r.end_to_end_window())
            .max()
            .unwrap_or(self.heartbeat_timeout)
    }

    /// Nodes this node sends heartbeats to: all destinations of routes this node may send on
    pub fn heartbeat_targets(&self) -> Vec<&Node> {
        self.heartbeat_peers(|r| &r.possible_sources, |r| &r.destinations)
    }

    /// Nodes this node expects heartbeats from: all possible sources of routes ending here
    pub fn heartbeat_sources(&self) -> Vec<&Node> {
        self.heartbeat_peers(|r| &r.destinations, |r| &r.possible_sources)
    }

    fn heartbeat_peers<'a>(&'a self, local_side: impl Fn(&'a Route) -> &'a Vec<String>, peer_side: impl Fn(&'a Route) -> &'a Vec<String>) -> Vec<&'a Node> {
        let mut names = Vec::new();
        for route in &self.routes {
            if !local_side(route).contains(&self.local_node) {
                continue;
            }
            for peer in peer_side(route) {
                if peer != &self.local_node && !names.contains(&peer) {
                    names.push(peer);
                }
            }
        }

        names.into_iter()
            .filter_map(|name| self.node(name))
            .collect()
    }
}
