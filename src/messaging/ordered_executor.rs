use std::collections::hash_map::Entry;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use rustc_hash::FxHashMap;
use tokio::sync::Semaphore;
use tokio::time;
use tracing::{debug, error, trace, warn};
use crate::messaging::messaging::{MessageListener, ReceivedMessage};
use crate::messaging::statistics::{incr, MessagingStatistics};


/// Delivers received messages to the application's [MessageListener] on a bounded number of
///  workers. Messages with the same group id are delivered one at a time in submission order,
///  while different groups are delivered concurrently.
///
/// A group with a non-empty queue is owned by exactly one drain task. The task keeps a worker
///  permit until the group's queue is empty, and then removes the queue so that the next
///  submission for the group starts a new drain task.
///
/// After [OrderedExecutor::shutdown] starts, no further delivery is started: submitted and queued
///  messages are discarded.
pub struct OrderedExecutor {
    listener: Arc<dyn MessageListener>,
    queues: Mutex<FxHashMap<String, VecDeque<ReceivedMessage>>>,
    closed: AtomicBool,
    workers: Semaphore,
    num_workers: u32,
    statistics: Arc<MessagingStatistics>,
}

impl OrderedExecutor {
    pub fn new(listener: Arc<dyn MessageListener>, num_workers: usize, statistics: Arc<MessagingStatistics>) -> OrderedExecutor {
        OrderedExecutor {
            listener,
            queues: Default::default(),
            closed: AtomicBool::new(false),
            workers: Semaphore::new(num_workers),
            num_workers: num_workers as u32,
            statistics,
        }
    }

    pub fn submit(self: &Arc<Self>, message: ReceivedMessage) {
        if self.is_closed() {
            debug!("executor is shut down, discarding message {:?}", message.message_id);
            return;
        }

        let group_id = match &message.group_id {
            Some(group_id) => group_id.clone(),
            None => {
                tokio::spawn(self.clone().run_unordered(message));
                return;
            }
        };

        let mut queues = self.queues.lock().unwrap();
        match queues.entry(group_id) {
            Entry::Occupied(mut e) => {
                trace!("group {} is being delivered, queueing message {:?}", e.key(), message.message_id);
                e.get_mut().push_back(message);
            }
            Entry::Vacant(e) => {
                let group_id = e.key().clone();
                e.insert(VecDeque::from([message]));
                tokio::spawn(self.clone().drain(group_id));
            }
        }
    }

    async fn run_unordered(self: Arc<Self>, message: ReceivedMessage) {
        match self.workers.acquire().await {
            Ok(_permit) if !self.is_closed() => self.deliver(message).await,
            _ => debug!("executor is shut down, discarding message {:?}", message.message_id),
        }
    }

    async fn drain(self: Arc<Self>, group_id: String) {
        let _permit = match self.workers.acquire().await {
            Ok(permit) => permit,
            Err(_) => {
                self.discard_group(&group_id);
                return;
            }
        };

        loop {
            if self.is_closed() {
                self.discard_group(&group_id);
                break;
            }

            // the message stays in the queue while it is delivered, marking the group as owned
            let next = self.queues.lock().unwrap()
                .get(&group_id)
                .and_then(|q| q.front().cloned());
            let Some(message) = next else {
                break;
            };

            self.deliver(message).await;

            let mut queues = self.queues.lock().unwrap();
            if let Some(queue) = queues.get_mut(&group_id) {
                queue.pop_front();
                if queue.is_empty() {
                    queues.remove(&group_id);
                    break;
                }
            }
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn discard_group(&self, group_id: &str) {
        let discarded = self.queues.lock().unwrap()
            .remove(group_id);
        debug!("executor is shut down, discarding {} message(s) for group {}", discarded.map(|q| q.len()).unwrap_or(0), group_id);
    }

    async fn deliver(&self, message: ReceivedMessage) {
        let message_id = message.message_id;
        let listener = self.listener.clone();

        // the listener runs in a task of its own so that a panic is contained to this delivery
        match tokio::spawn(async move { listener.on_message(message).await }).await {
            Ok(()) => incr(&self.statistics.delivered),
            Err(e) => {
                error!("delivery of message {:?} failed: {}", message_id, e);
                incr(&self.statistics.delivery_failures);
            }
        }
    }

    /// Waits for running deliveries to finish, up to the given timeout. Queued messages that were
    ///  not started yet are discarded.
    pub async fn shutdown(&self, timeout: Duration) {
        self.closed.store(true, Ordering::Release);

        let pending = self.queues.lock().unwrap()
            .values()
            .map(|q| q.len())
            .sum::<usize>();
        debug!("shutting down delivery with {} pending message(s)", pending);

        match time::timeout(timeout, self.workers.acquire_many(self.num_workers)).await {
            Ok(Ok(permits)) => permits.forget(),
            Ok(Err(_)) => {}
            Err(_) => warn!("deliveries did not finish within {:?}, shutting down regardless", timeout),
        }
        self.workers.close();
    }
}
