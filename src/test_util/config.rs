use std::time::Duration;
use crate::messaging::messaging_config::{MessagingConfig, Route, RouteMode};
use crate::messaging::node::Node;


pub fn millis(values: &[u64]) -> Vec<Duration> {
    values.iter()
        .map(|&ms| Duration::from_millis(ms))
        .collect()
}

/// A signaling layer node SL1 sending to two execution layer nodes EL1 and EL2, all on
///  localhost:
///  * `SL1->EL1`: failover to EL1 only, pattern [500, 1000]
///  * `SL1->EL`: load balancing between EL1 and EL2, pattern [100, 200]
///  * `SL1->EL-failover`: failover from EL1 to EL2, pattern [100, 200, 400]
pub fn test_config(local_node: &str) -> MessagingConfig {
    let nodes = vec![
        Node::new("SL1", "127.0.0.1", 17001),
        Node::new("EL1", "127.0.0.1", 17002),
        Node::new("EL2", "127.0.0.1", 17003),
    ];
    let routes = vec![
        Route::new("SL1->EL1", RouteMode::Failover, &["SL1"], &["EL1"], millis(&[500, 1000])),
        Route::new("SL1->EL", RouteMode::LoadBalance, &["SL1"], &["EL1", "EL2"], millis(&[100, 200])),
        Route::new("SL1->EL-failover", RouteMode::Failover, &["SL1"], &["EL1", "EL2"], millis(&[100, 200, 400])),
    ];
    MessagingConfig::new(local_node, nodes, routes)
}

/// Same topology as [test_config], but with the nodes listening on the given ports so that
///  tests using real sockets don't interfere with each other
pub fn test_config_with_ports(local_node: &str, sl1_port: u16, el1_port: u16, el2_port: u16) -> MessagingConfig {
    let mut config = test_config(local_node);
    for (node, port) in config.nodes.iter_mut().zip([sl1_port, el1_port, el2_port]) {
        node.port = port;
    }
    config
}
