use std::sync::Arc;
use std::time::Duration;
use anyhow::bail;
use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)] use mockall::automock;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, info_span, Instrument};
use crate::liveness::heartbeat_sender::run_heartbeat_sender;
use crate::liveness::heartbeat_tracker::{HeartbeatTracker, NodeLiveness};
use crate::messaging::admission::{AcceptMode, AdmissionControl};
use crate::messaging::message::MessageId;
use crate::messaging::messaging_config::MessagingConfig;
use crate::messaging::node::Node;
use crate::messaging::ordered_executor::OrderedExecutor;
use crate::messaging::receive_pipeline::{run_receive_loop, ReceivePipeline};
use crate::messaging::routing::Topology;
use crate::messaging::send_engine::{OutboundMessage, SendEngine, SendFuture};
use crate::messaging::send_socket::{bind_receive_sockets, SocketPool};
use crate::messaging::statistics::{MessagingStatistics, StatisticsSnapshot};
use crate::util::random::RngRandom;


/// A message as it is delivered to the application
#[derive(Clone, Debug)]
pub struct ReceivedMessage {
    pub message_id: MessageId,
    pub from: Node,
    pub group_id: Option<String>,
    pub user_tag: Option<String>,
    pub payload: Bytes,
}

/// The application's callback for received messages. Calls for messages with the same group id
///  never overlap, so a listener that takes long delays all other messages of its group. It
///  occupies one of a bounded number of delivery workers while it runs.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MessageListener: Send + Sync + 'static {
    async fn on_message(&self, message: ReceivedMessage);
}


/// Everything that belongs to one initialization of messaging, i.e. to one configuration
struct RunningMessaging {
    topology: Arc<Topology>,
    engine: Arc<SendEngine>,
    pool: Arc<SocketPool>,
    executor: Arc<OrderedExecutor>,
    heartbeats: Arc<HeartbeatTracker>,
    tasks: Vec<JoinHandle<()>>,
}

impl RunningMessaging {
    async fn start(config: MessagingConfig, listener: Arc<dyn MessageListener>, admission: Arc<AdmissionControl>, statistics: Arc<MessagingStatistics>) -> anyhow::Result<RunningMessaging> {
        let topology = Arc::new(Topology::new(Arc::new(config), &RngRandom {})?);
        let config = topology.config();
        let local_addr = topology.local_addr();

        let receive_sockets = bind_receive_sockets(local_addr, config)?;
        let pool = Arc::new(SocketPool::bind(config, local_addr).await?);
        info!("bound {} receive socket(s) on {} and {} outbound socket(s)", receive_sockets.len(), local_addr, pool.capacity());

        let engine = Arc::new(SendEngine::new(topology.clone(), pool.clone(), statistics.clone()));
        let executor = Arc::new(OrderedExecutor::new(listener, config.receive_worker_threads, statistics.clone()));
        let heartbeats = Arc::new(HeartbeatTracker::new(
            config.heartbeat_sources().into_iter().map(|n| n.name.clone()),
            config.heartbeat_timeout,
        ));
        let pipeline = Arc::new(ReceivePipeline::new(topology.clone(), engine.clone(), executor.clone(), heartbeats.clone(), admission, statistics.clone()));

        let span = info_span!("messaging", domain = %config.metrics_domain, node = %topology.local_node());

        let mut tasks = Vec::new();
        for socket in receive_sockets {
            tasks.push(tokio::spawn(run_receive_loop(pipeline.clone(), socket).instrument(span.clone())));
        }
        tasks.push(tokio::spawn(run_heartbeat_sender(
            engine.clone(),
            topology.local_node().name.clone(),
            topology.heartbeat_targets(),
            config.heartbeat_interval,
            statistics.clone(),
        ).instrument(span.clone())));
        tasks.push(tokio::spawn(run_cache_maintenance(pipeline, config.cache_purge_interval).instrument(span)));

        Ok(RunningMessaging {
            topology,
            engine,
            pool,
            executor,
            heartbeats,
            tasks,
        })
    }

    async fn shutdown(self) {
        info!("shutting down messaging for {}", self.topology.local_node());

        self.engine.shutdown();
        for task in &self.tasks {
            task.abort();
        }
        for task in self.tasks {
            // aborted tasks release their sockets when they finish
            let _ = task.await;
        }
        self.heartbeats.shutdown();
        self.executor.shutdown(self.topology.config().shutdown_drain_timeout).await;
        self.pool.close();
    }
}

async fn run_cache_maintenance(pipeline: Arc<ReceivePipeline>, interval: Duration) {
    let mut ticks = time::interval(interval);
    loop {
        ticks.tick().await;
        pipeline.purge_expired();
    }
}


/// [MessagingService] is the messaging core's API. Its lifecycle is
///  `new` -> `initialize` -> (`send` | `set_accept_mode`)* -> `shutdown`, and it can be
///  re-initialized with a new configuration at any time.
///
/// Accept modes and statistics belong to the service rather than to a configuration, so they
///  survive re-initialization.
pub struct MessagingService {
    listener: Arc<dyn MessageListener>,
    admission: Arc<AdmissionControl>,
    statistics: Arc<MessagingStatistics>,
    running: RwLock<Option<RunningMessaging>>,
}

impl MessagingService {
    pub fn new(listener: Arc<dyn MessageListener>) -> MessagingService {
        MessagingService {
            listener,
            admission: Default::default(),
            statistics: Default::default(),
            running: Default::default(),
        }
    }

    /// Binds all sockets and starts receiving, sending heartbeats and tracking liveness for the
    ///  given configuration. A previous initialization is shut down first.
    pub async fn initialize(&self, config: MessagingConfig) -> anyhow::Result<()> {
        let mut running = self.running.write().await;
        if let Some(previous) = running.take() {
            debug!("re-initializing messaging");
            previous.shutdown().await;
        }

        info!("initializing messaging for node {} with {} nodes and {} routes", config.local_node, config.nodes.len(), config.routes.len());
        *running = Some(RunningMessaging::start(config, self.listener.clone(), self.admission.clone(), self.statistics.clone()).await?);
        Ok(())
    }

    pub async fn is_initialized(&self) -> bool {
        self.running.read().await.is_some()
    }

    /// Sends a message on a route. This returns an error if messaging is not initialized, if the
    ///  route is unknown, or if the message can not be represented on the wire; delivery
    ///  failures are reported through the returned [SendFuture].
    pub async fn send(&self, route_name: &str, message: OutboundMessage) -> anyhow::Result<SendFuture> {
        match self.running.read().await.as_ref() {
            Some(running) => running.engine.send(route_name, message),
            None => bail!("messaging is not initialized"),
        }
    }

    /// Sets the accept mode for incoming messages with the given tags, or the default mode
    ///  (removing all per-tag modes) if no tags are given
    pub fn set_accept_mode(&self, mode: AcceptMode, tags: &[&str]) {
        self.admission.set_accept_mode(mode, tags);
    }

    pub async fn liveness(&self, node_name: &str) -> NodeLiveness {
        match self.running.read().await.as_ref() {
            Some(running) => running.heartbeats.liveness(node_name),
            None => NodeLiveness::NoInfo,
        }
    }

    pub async fn alive_nodes(&self) -> Vec<String> {
        match self.running.read().await.as_ref() {
            Some(running) => running.heartbeats.alive_nodes(),
            None => Vec::new(),
        }
    }

    pub fn statistics(&self) -> StatisticsSnapshot {
        self.statistics.snapshot()
    }

    /// Cancels all sends in flight, stops receiving and heartbeats, and waits for running
    ///  deliveries up to the configured drain timeout. Shutting down messaging that is not
    ///  initialized does nothing.
    pub async fn shutdown(&self) {
        let previous = self.running.write().await.take();
        if let Some(previous) = previous {
            previous.shutdown().await;
        }
    }
}


#[cfg(test)]
mod tests {
    use std::time::Duration;
    use tokio::time::sleep;
    use super::*;
    use crate::messaging::send_engine::SendResult;
    use crate::test_util::config::test_config_with_ports;
    use crate::test_util::listener::CollectingListener;

    struct Cluster {
        sl1: MessagingService,
        el1: MessagingService,
        el2: MessagingService,
        el1_listener: Arc<CollectingListener>,
        el2_listener: Arc<CollectingListener>,
    }

    /// starts SL1, EL1 and EL2 on localhost, using the ports `base_port`, `base_port+1` and
    ///  `base_port+2`
    async fn cluster(base_port: u16) -> Cluster {
        let config = |local: &str| {
            let mut config = test_config_with_ports(local, base_port, base_port + 1, base_port + 2);
            config.heartbeat_interval = Duration::from_millis(50);
            config.heartbeat_timeout = Duration::from_millis(200);
            config
        };

        let el1_listener = Arc::new(CollectingListener::new());
        let el2_listener = Arc::new(CollectingListener::new());

        let sl1 = MessagingService::new(Arc::new(CollectingListener::new()));
        let el1 = MessagingService::new(el1_listener.clone());
        let el2 = MessagingService::new(el2_listener.clone());
        sl1.initialize(config("SL1")).await.unwrap();
        el1.initialize(config("EL1")).await.unwrap();
        el2.initialize(config("EL2")).await.unwrap();

        Cluster { sl1, el1, el2, el1_listener, el2_listener }
    }

    impl Cluster {
        async fn shutdown(&self) {
            self.sl1.shutdown().await;
            self.el1.shutdown().await;
            self.el2.shutdown().await;
        }
    }

    #[tokio::test]
    async fn test_send_and_deliver() {
        let cluster = cluster(47200).await;

        let future = cluster.sl1.send("SL1->EL1", OutboundMessage::new("IDP:123", "call-42")).await.unwrap();
        assert_eq!(future.result().await, SendResult::Success);

        cluster.el1_listener.await_count(1, Duration::from_secs(1)).await;
        sleep(Duration::from_millis(100)).await;

        let received = cluster.el1_listener.received();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].message_id, future.message_id());
        assert_eq!(received[0].payload, Bytes::from_static(b"IDP:123"));
        assert_eq!(received[0].group_id.as_deref(), Some("call-42"));
        assert_eq!(received[0].from.name, "SL1");
        assert!(cluster.el2_listener.received().is_empty());

        let sl1_statistics = cluster.sl1.statistics();
        assert_eq!(sl1_statistics.send_successes, 1);
        assert_eq!(sl1_statistics.retransmissions, 0);
        assert_eq!(cluster.el1.statistics().delivered, 1);

        cluster.shutdown().await;
    }

    #[tokio::test]
    async fn test_every_message_is_delivered_once() {
        let cluster = cluster(47210).await;

        let mut futures = Vec::new();
        for i in 0..20 {
            futures.push(cluster.sl1.send("SL1->EL1", OutboundMessage::new(format!("{}", i), "call-1")).await.unwrap());
        }
        for future in futures {
            assert_eq!(future.result().await, SendResult::Success);
        }

        cluster.el1_listener.await_count(20, Duration::from_secs(1)).await;
        sleep(Duration::from_millis(100)).await;
        let mut payloads = cluster.el1_listener.payloads();
        payloads.sort_by_key(|p| p.parse::<u32>().unwrap());
        assert_eq!(payloads, (0..20).map(|i| format!("{}", i)).collect::<Vec<_>>());

        cluster.shutdown().await;
    }

    #[tokio::test]
    async fn test_rejected_message_is_not_delivered() {
        let cluster = cluster(47220).await;
        cluster.el1.set_accept_mode(AcceptMode::Reject, &["T"]);

        let rejected = cluster.sl1.send("SL1->EL1", OutboundMessage::new("a", "g").with_tag("T")).await.unwrap();
        assert_eq!(rejected.result().await, SendResult::Failure);

        let accepted = cluster.sl1.send("SL1->EL1", OutboundMessage::new("b", "g").with_tag("U")).await.unwrap();
        assert_eq!(accepted.result().await, SendResult::Success);

        cluster.el1_listener.await_count(1, Duration::from_secs(1)).await;
        assert_eq!(cluster.el1_listener.payloads(), vec!["b"]);
        assert_eq!(cluster.el1.statistics().rejected, 1);

        cluster.shutdown().await;
    }

    #[tokio::test]
    async fn test_failover_to_running_destination() {
        let cluster = cluster(47230).await;
        cluster.el1.shutdown().await;

        let future = cluster.sl1.send("SL1->EL-failover", OutboundMessage::new("a", "g")).await.unwrap();
        assert_eq!(future.result().await, SendResult::Success);

        cluster.el2_listener.await_count(1, Duration::from_secs(1)).await;
        assert!(cluster.el1_listener.received().is_empty());
        assert_eq!(cluster.sl1.statistics().retransmissions, 3);

        cluster.shutdown().await;
    }

    #[tokio::test]
    async fn test_liveness() {
        let cluster = cluster(47240).await;

        assert_eq!(cluster.sl1.liveness("EL1").await, NodeLiveness::NoInfo);
        sleep(Duration::from_millis(150)).await;
        assert_eq!(cluster.el1.liveness("SL1").await, NodeLiveness::Alive);
        assert_eq!(cluster.el2.alive_nodes().await, vec!["SL1"]);

        cluster.sl1.shutdown().await;
        sleep(Duration::from_millis(400)).await;
        assert_eq!(cluster.el1.liveness("SL1").await, NodeLiveness::Dead);

        cluster.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_cancels_in_flight_sends() {
        let cluster = cluster(47250).await;
        cluster.el1.shutdown().await;

        let future = cluster.sl1.send("SL1->EL1", OutboundMessage::new("a", "g")).await.unwrap();
        sleep(Duration::from_millis(50)).await;
        cluster.sl1.shutdown().await;

        assert_eq!(future.result().await, SendResult::Cancelled);
        assert!(cluster.sl1.send("SL1->EL1", OutboundMessage::new("a", "g")).await.is_err());
        assert!(!cluster.sl1.is_initialized().await);

        cluster.shutdown().await;
    }

    #[tokio::test]
    async fn test_send_before_initialization() {
        let service = MessagingService::new(Arc::new(MockMessageListener::new()));
        assert!(service.send("SL1->EL1", OutboundMessage::new("a", "g")).await.is_err());
        assert_eq!(service.liveness("SL1").await, NodeLiveness::NoInfo);
        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_configuration() {
        let service = MessagingService::new(Arc::new(MockMessageListener::new()));
        let mut config = test_config_with_ports("SL1", 47260, 47261, 47262);
        config.routes.clear();
        config.local_node = "XX".to_string();
        assert!(service.initialize(config).await.is_err());
        assert!(!service.is_initialized().await);
    }

    #[tokio::test]
    async fn test_reinitialize() {
        let mut el1_listener = MockMessageListener::new();
        el1_listener.expect_on_message()
            .never();
        let el1 = MessagingService::new(Arc::new(el1_listener));
        el1.set_accept_mode(AcceptMode::Drop, &[]);

        let sl1 = MessagingService::new(Arc::new(CollectingListener::new()));
        sl1.initialize(test_config_with_ports("SL1", 47270, 47271, 47272)).await.unwrap();

        // same ports, so this only works if the first initialization released its sockets
        el1.initialize(test_config_with_ports("EL1", 47270, 47271, 47272)).await.unwrap();
        el1.initialize(test_config_with_ports("EL1", 47270, 47271, 47272)).await.unwrap();

        let future = sl1.send("SL1->EL1", OutboundMessage::new("a", "g")).await.unwrap();
        sleep(Duration::from_millis(50)).await;

        // accept mode survives re-initialization
        assert_eq!(el1.statistics().dropped, 1);
        future.cancel();

        sl1.shutdown().await;
        el1.shutdown().await;
    }
}
