use std::sync::Arc;
use std::time::Duration;
use dashmap::DashMap;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use crate::util::keyed_timer::KeyedTimer;


#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NodeLiveness {
    Alive,
    /// no heartbeat was received within the heartbeat timeout, or none was ever received
    Dead,
    /// the node is not tracked, i.e. it is not expected to send heartbeats and never did
    NoInfo,
}

struct LivenessState {
    alive: bool,
    invalidation_deadline: Instant,
    /// incremented with every heartbeat so that an invalidation timer that was scheduled for an
    ///  earlier heartbeat can recognize it is stale
    generation: u64,
}

/// Tracks liveness of other nodes based on their heartbeats. A node is considered alive from its
///  first heartbeat until a heartbeat timeout passes without a heartbeat.
pub struct HeartbeatTracker {
    heartbeat_timeout: Duration,
    nodes: Arc<DashMap<String, LivenessState>>,
    invalidation_timers: KeyedTimer<String>,
}

impl HeartbeatTracker {
    pub fn new(expected_sources: impl IntoIterator<Item=String>, heartbeat_timeout: Duration) -> HeartbeatTracker {
        let tracker = HeartbeatTracker {
            heartbeat_timeout,
            nodes: Default::default(),
            invalidation_timers: Default::default(),
        };

        let now = Instant::now();
        for node in expected_sources {
            debug!("expecting heartbeats from {}", node);
            tracker.nodes.insert(node.clone(), LivenessState {
                alive: false,
                invalidation_deadline: now + heartbeat_timeout,
                generation: 0,
            });
            tracker.schedule_invalidation(node, 0);
        }
        tracker
    }

    pub fn on_heartbeat(&self, from: &str) {
        let deadline = Instant::now() + self.heartbeat_timeout;

        // the invalidation is scheduled while the node's entry is locked, so concurrent heartbeats
        //  schedule in the order of their generations and the newest timer is the pending one
        let mut state = self.nodes.entry(from.to_string())
            .or_insert_with(|| {
                debug!("heartbeat from {}, which is not an expected heartbeat source", from);
                LivenessState {
                    alive: false,
                    invalidation_deadline: deadline,
                    generation: 0,
                }
            });

        if !state.alive {
            info!("node {} is alive", from);
        }
        state.alive = true;
        state.invalidation_deadline = deadline;
        state.generation += 1;

        self.schedule_invalidation(from.to_string(), state.generation);
    }

    fn schedule_invalidation(&self, node: String, generation: u64) {
        let nodes = self.nodes.clone();
        let heartbeat_timeout = self.heartbeat_timeout;
        let key = node.clone();

        self.invalidation_timers.schedule(key, heartbeat_timeout, move || {
            if let Some(mut state) = nodes.get_mut(&node) {
                if state.generation == generation && state.alive {
                    warn!("no heartbeat from {} for {:?}, considering it dead", node, heartbeat_timeout);
                    state.alive = false;
                }
            }
        });
    }

    pub fn liveness(&self, node: &str) -> NodeLiveness {
        match self.nodes.get(node) {
            Some(state) if state.alive => NodeLiveness::Alive,
            Some(_) => NodeLiveness::Dead,
            None => NodeLiveness::NoInfo,
        }
    }

    pub fn invalidation_deadline(&self, node: &str) -> Option<Instant> {
        self.nodes.get(node)
            .map(|state| state.invalidation_deadline)
    }

    pub fn alive_nodes(&self) -> Vec<String> {
        let mut result = self.nodes.iter()
            .filter(|e| e.value().alive)
            .map(|e| e.key().clone())
            .collect::<Vec<_>>();
        result.sort();
        result
    }

    pub fn shutdown(&self) {
        self.invalidation_timers.cancel_all();
    }
}

#[cfg(test)]
mod tests {
    use tokio::time::sleep;
    use super::*;

    fn tracker() -> HeartbeatTracker {
        HeartbeatTracker::new(vec!["SL1".to_string(), "SL2".to_string()], Duration::from_millis(3000))
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_state() {
        let tracker = tracker();
        assert_eq!(tracker.liveness("SL1"), NodeLiveness::Dead);
        assert_eq!(tracker.liveness("SL2"), NodeLiveness::Dead);
        assert_eq!(tracker.liveness("EL1"), NodeLiveness::NoInfo);
        assert!(tracker.alive_nodes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_liveness_transition() {
        let tracker = tracker();

        tracker.on_heartbeat("SL1");
        assert_eq!(tracker.liveness("SL1"), NodeLiveness::Alive);
        assert_eq!(tracker.alive_nodes(), vec!["SL1"]);

        sleep(Duration::from_millis(2999)).await;
        assert_eq!(tracker.liveness("SL1"), NodeLiveness::Alive);
        sleep(Duration::from_millis(2)).await;
        assert_eq!(tracker.liveness("SL1"), NodeLiveness::Dead);

        sleep(Duration::from_millis(5000)).await;
        tracker.on_heartbeat("SL1");
        assert_eq!(tracker.liveness("SL1"), NodeLiveness::Alive);
        assert_eq!(tracker.invalidation_deadline("SL1"), Some(Instant::now() + Duration::from_millis(3000)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeats_reset_timeout() {
        let tracker = tracker();

        for _ in 0..10 {
            tracker.on_heartbeat("SL2");
            sleep(Duration::from_millis(1000)).await;
            assert_eq!(tracker.liveness("SL2"), NodeLiveness::Alive);
        }

        sleep(Duration::from_millis(2001)).await;
        assert_eq!(tracker.liveness("SL2"), NodeLiveness::Dead);
        assert_eq!(tracker.liveness("SL1"), NodeLiveness::Dead);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_heartbeats_leave_newest_timer_pending() {
        let tracker = Arc::new(HeartbeatTracker::new(vec!["SL1".to_string()], Duration::from_millis(100)));

        let handles = (0..8)
            .map(|_| {
                let tracker = tracker.clone();
                tokio::spawn(async move {
                    for _ in 0..50 {
                        tracker.on_heartbeat("SL1");
                        tokio::task::yield_now().await;
                    }
                })
            })
            .collect::<Vec<_>>();
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(tracker.liveness("SL1"), NodeLiveness::Alive);
        assert_eq!(tracker.nodes.get("SL1").unwrap().generation, 400);
        assert!(tracker.invalidation_timers.is_pending(&"SL1".to_string()));

        sleep(Duration::from_millis(300)).await;
        assert_eq!(tracker.liveness("SL1"), NodeLiveness::Dead);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unexpected_source_is_tracked() {
        let tracker = tracker();

        tracker.on_heartbeat("EL9");
        assert_eq!(tracker.liveness("EL9"), NodeLiveness::Alive);
        sleep(Duration::from_millis(3001)).await;
        assert_eq!(tracker.liveness("EL9"), NodeLiveness::Dead);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_invalidation() {
        let tracker = tracker();

        tracker.on_heartbeat("SL1");
        tracker.shutdown();
        sleep(Duration::from_millis(5000)).await;
        assert_eq!(tracker.liveness("SL1"), NodeLiveness::Alive);
    }
}
