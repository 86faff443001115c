use std::fmt::{Debug, Display, Formatter};
use std::hash::{Hash, Hasher};
use std::net::{SocketAddr, ToSocketAddrs};
use anyhow::anyhow;


/// A [Node] is an addressable endpoint that takes part in messaging. Nodes are identified by
///  their name: Configuration guarantees unique names, and messages carry only the sender's
///  name on the wire.
#[derive(Clone)]
pub struct Node {
    pub name: String,
    pub host: String,
    pub port: u16,
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}
impl Eq for Node {}

impl Hash for Node {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
    }
}

impl Debug for Node {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}@{}:{}]", self.name, self.host, self.port)
    }
}

impl Display for Node {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)
    }
}

impl Node {
    pub fn new(name: impl Into<String>, host: impl Into<String>, port: u16) -> Node {
        Node {
            name: name.into(),
            host: host.into(),
            port,
        }
    }

    /// Resolves the node's host to a socket address. This may involve a DNS lookup, so it is
    ///  done once when a configuration is loaded rather than per message.
    pub fn resolve(&self) -> anyhow::Result<SocketAddr> {
        (self.host.as_str(), self.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| anyhow!("host {} of node {} does not resolve to an address", self.host, self.name))
    }

    /// Used for senders that are not part of the local configuration: the node is represented by
    ///  its name and the address its datagrams came from.
    pub fn unconfigured(name: &str, addr: SocketAddr) -> Node {
        Node {
            name: name.to_string(),
            host: addr.ip().to_string(),
            port: addr.port(),
        }
    }
}
