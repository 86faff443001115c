use std::sync::Arc;
use std::time::Duration;
use tokio::time;
use tracing::{trace, warn};
use crate::messaging::message::MessageEnvelope;
use crate::messaging::routing::Destination;
use crate::messaging::send_engine::SendEngine;
use crate::messaging::statistics::{incr, MessagingStatistics};


/// Sends a fire-and-forget heartbeat to every target once per interval, until the task is
///  aborted. Send failures are logged and do not affect the schedule.
pub async fn run_heartbeat_sender(engine: Arc<SendEngine>, local_node: String, targets: Vec<Destination>, interval: Duration, statistics: Arc<MessagingStatistics>) {
    if targets.is_empty() {
        trace!("no heartbeat targets");
        return;
    }

    let mut ticks = time::interval(interval);
    ticks.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

    loop {
        ticks.tick().await;

        for target in &targets {
            let datagram = MessageEnvelope::heartbeat(&local_node).to_bytes();
            match engine.send_one_shot(target.addr, &datagram).await {
                Ok(()) => {
                    trace!("sent heartbeat to {:?}", target);
                    incr(&statistics.heartbeats_sent);
                }
                Err(e) => warn!("error sending heartbeat to {:?}: {}", target, e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::time::{sleep, Instant};
    use super::*;
    use crate::messaging::message::MessageType;
    use crate::messaging::routing::Topology;
    use crate::messaging::send_socket::SocketPool;
    use crate::test_util::config::test_config;
    use crate::test_util::socket::RecordingSendSocket;
    use crate::util::random::RngRandom;

    fn setup() -> (Arc<SendEngine>, Arc<RecordingSendSocket>, Vec<Destination>, Arc<MessagingStatistics>) {
        let topology = Arc::new(Topology::new(Arc::new(test_config("SL1")), &RngRandom {}).unwrap());
        let targets = topology.heartbeat_targets();
        let socket = Arc::new(RecordingSendSocket::new(topology.local_addr()));
        let statistics = Arc::new(MessagingStatistics::default());
        let pool = Arc::new(SocketPool::new(vec![socket.clone()]));
        let engine = Arc::new(SendEngine::new(topology, pool, statistics.clone()));
        (engine, socket, targets, statistics)
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_schedule() {
        let (engine, socket, targets, statistics) = setup();
        let start = Instant::now();

        let handle = tokio::spawn(run_heartbeat_sender(engine, "SL1".to_string(), targets, Duration::from_millis(1000), statistics.clone()));
        sleep(Duration::from_millis(2500)).await;
        handle.abort();

        let sent = socket.sent();
        let offsets = sent.iter()
            .map(|d| ((d.at - start).as_millis() as u64, d.to.port()))
            .collect::<Vec<_>>();
        assert_eq!(offsets, vec![(0, 17002), (0, 17003), (1000, 17002), (1000, 17003), (2000, 17002), (2000, 17003)]);

        for datagram in sent {
            let envelope = datagram.envelope();
            assert_eq!(envelope.message_type, MessageType::Heartbeat);
            assert_eq!(envelope.from, "SL1");
            assert!(envelope.payload.is_empty());
        }
        assert_eq!(statistics.snapshot().heartbeats_sent, 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_errors_do_not_stop_heartbeats() {
        let (engine, socket, targets, statistics) = setup();

        socket.set_failing(true);
        let handle = tokio::spawn(run_heartbeat_sender(engine, "SL1".to_string(), targets, Duration::from_millis(1000), statistics.clone()));
        sleep(Duration::from_millis(1500)).await;
        socket.set_failing(false);
        sleep(Duration::from_millis(1000)).await;
        handle.abort();

        assert_eq!(socket.sent().len(), 2);
        assert_eq!(statistics.snapshot().heartbeats_sent, 2);
        assert_eq!(statistics.snapshot().send_errors, 4);
    }
}
