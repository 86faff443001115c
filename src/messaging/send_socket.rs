use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use anyhow::{anyhow, bail};
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::{debug, info, trace, warn};
use crate::messaging::messaging_config::{ListenerMode, MessagingConfig};


/// This is an abstraction for sending a datagram on a UDP socket, introduced to facilitate mocking
///  the I/O part away for testing
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SendSocket: Send + Sync + 'static {
    async fn send_datagram(&self, to: SocketAddr, buf: &[u8]) -> anyhow::Result<()>;

    fn local_addr(&self) -> anyhow::Result<SocketAddr>;
}

#[async_trait]
impl SendSocket for UdpSocket {
    async fn send_datagram(&self, to: SocketAddr, buf: &[u8]) -> anyhow::Result<()> {
        trace!("UDP socket: sending {} bytes to {:?}", buf.len(), to);
        self.send_to(buf, to).await?;
        Ok(())
    }

    fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(UdpSocket::local_addr(self)?)
    }
}


/// A bounded pool of pre-bound outbound sockets. Sending checks out a socket, waiting until one
///  is available, and returns it after the write.
pub struct SocketPool {
    sockets: Mutex<Vec<Arc<dyn SendSocket>>>,
    available: Semaphore,
    capacity: usize,
}

struct PooledSocket<'a> {
    pool: &'a SocketPool,
    socket: Option<Arc<dyn SendSocket>>,
    _permit: SemaphorePermit<'a>,
}
impl Drop for PooledSocket<'_> {
    fn drop(&mut self) {
        if let Some(socket) = self.socket.take() {
            self.pool.sockets.lock().unwrap()
                .push(socket);
        }
    }
}

impl SocketPool {
    pub fn new(sockets: Vec<Arc<dyn SendSocket>>) -> SocketPool {
        let capacity = sockets.len();
        SocketPool {
            sockets: Mutex::new(sockets),
            available: Semaphore::new(capacity),
            capacity,
        }
    }

    /// Binds `send_pool_size` sockets. If a client port range is configured, sockets are bound
    ///  to ports from that range, skipping ports that can not be bound. A socket that can not be
    ///  bound is logged and reduces the pool's capacity; the pool fails only if no socket at all
    ///  could be bound.
    pub async fn bind(config: &MessagingConfig, local_addr: SocketAddr) -> anyhow::Result<SocketPool> {
        let ip = match local_addr.ip() {
            IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };

        let mut candidate_ports = config.client_port_range.clone()
            .map(|r| r.collect::<Vec<_>>())
            .unwrap_or_default()
            .into_iter();

        let mut sockets: Vec<Arc<dyn SendSocket>> = Vec::with_capacity(config.send_pool_size);
        for _ in 0..config.send_pool_size {
            let bound = if config.client_port_range.is_some() {
                Self::bind_in_range(ip, &mut candidate_ports).await
            }
            else {
                UdpSocket::bind((ip, 0)).await
                    .map_err(anyhow::Error::from)
            };

            match bound {
                Ok(socket) => {
                    debug!("bound outbound socket to {:?}", UdpSocket::local_addr(&socket));
                    sockets.push(Arc::new(socket));
                }
                Err(e) => warn!("failed to bind outbound socket, reducing pool capacity: {}", e),
            }
        }

        if sockets.is_empty() {
            bail!("no outbound socket could be bound");
        }
        Ok(SocketPool::new(sockets))
    }

    async fn bind_in_range(ip: IpAddr, candidate_ports: &mut impl Iterator<Item=u16>) -> anyhow::Result<UdpSocket> {
        for port in candidate_ports {
            match UdpSocket::bind((ip, port)).await {
                Ok(socket) => return Ok(socket),
                Err(e) => debug!("could not bind outbound socket to port {}, trying next: {}", port, e),
            }
        }
        Err(anyhow!("client port range is exhausted"))
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub async fn send(&self, to: SocketAddr, buf: &[u8]) -> anyhow::Result<()> {
        let pooled = self.checkout().await?;
        match &pooled.socket {
            Some(socket) => socket.send_datagram(to, buf).await,
            None => bail!("no socket available"),
        }
    }

    async fn checkout(&self) -> anyhow::Result<PooledSocket<'_>> {
        let permit = self.available.acquire().await
            .map_err(|_| anyhow!("socket pool is closed"))?;
        let socket = self.sockets.lock().unwrap()
            .pop();
        Ok(PooledSocket {
            pool: self,
            socket,
            _permit: permit,
        })
    }

    /// Sends that are waiting for a socket fail after this, and sockets are released when the
    ///  last send that uses them finishes
    pub fn close(&self) {
        self.available.close();
        self.sockets.lock().unwrap()
            .clear();
    }
}


/// Binds the sockets that receive datagrams for the local node. With [ListenerMode::ReusePort]
///  this is `receive_transport_threads` sockets sharing the same port where the platform
///  supports SO_REUSEPORT, and a single socket otherwise.
pub fn bind_receive_sockets(addr: SocketAddr, config: &MessagingConfig) -> anyhow::Result<Vec<Arc<UdpSocket>>> {
    let wanted = match config.listener_mode {
        ListenerMode::SingleSocket => 1,
        ListenerMode::ReusePort if supports_reuse_port() => config.receive_transport_threads,
        ListenerMode::ReusePort => {
            info!("SO_REUSEPORT is not supported on this platform, falling back to a single receive socket");
            1
        }
    };
    let reuse_port = wanted > 1;

    let mut result = Vec::with_capacity(wanted);
    result.push(Arc::new(bind_receive_socket(addr, reuse_port)?));

    for _ in 1..wanted {
        match bind_receive_socket(addr, reuse_port) {
            Ok(socket) => result.push(Arc::new(socket)),
            Err(e) => {
                warn!("could not bind additional receive socket to {:?}, continuing with {}: {}", addr, result.len(), e);
                break;
            }
        }
    }
    info!("listening on {:?} with {} socket(s)", addr, result.len());
    Ok(result)
}

fn supports_reuse_port() -> bool {
    cfg!(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))
}

fn bind_receive_socket(addr: SocketAddr, reuse_port: bool) -> anyhow::Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    if reuse_port {
        #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
        socket.set_reuse_port(true)?;
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    Ok(UdpSocket::from_std(socket.into())?)
}
