use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use async_trait::async_trait;
use tokio::time::{sleep, Instant};
use crate::messaging::messaging::{MessageListener, ReceivedMessage};


#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DeliveryEvent {
    Started(String),
    Finished(String),
}

/// A [MessageListener] that collects all delivered messages, optionally taking some time for
///  processing each of them. It tracks start and end of every delivery (identified by payload)
///  so tests can check ordering and concurrency.
pub struct CollectingListener {
    processing_time: Duration,
    received: Mutex<Vec<ReceivedMessage>>,
    events: Mutex<Vec<DeliveryEvent>>,
    running: AtomicUsize,
    max_running: AtomicUsize,
}

impl CollectingListener {
    pub fn new() -> CollectingListener {
        Self::with_processing_time(Duration::ZERO)
    }

    pub fn with_processing_time(processing_time: Duration) -> CollectingListener {
        CollectingListener {
            processing_time,
            received: Default::default(),
            events: Default::default(),
            running: AtomicUsize::new(0),
            max_running: AtomicUsize::new(0),
        }
    }

    pub fn received(&self) -> Vec<ReceivedMessage> {
        self.received.lock().unwrap().clone()
    }

    pub fn count(&self) -> usize {
        self.received.lock().unwrap().len()
    }

    pub fn payloads(&self) -> Vec<String> {
        self.received().iter()
            .map(|m| String::from_utf8_lossy(&m.payload).to_string())
            .collect()
    }

    pub fn events(&self) -> Vec<DeliveryEvent> {
        self.events.lock().unwrap().clone()
    }

    /// the maximum number of deliveries that were running at the same time
    pub fn max_running(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }

    /// Polls until at least `count` messages were delivered, panicking after `timeout`
    pub async fn await_count(&self, count: usize, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        while self.count() < count {
            if Instant::now() > deadline {
                panic!("expected {} delivered messages, got {:?}", count, self.payloads());
            }
            sleep(Duration::from_millis(5)).await;
        }
    }
}

impl Default for CollectingListener {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageListener for CollectingListener {
    async fn on_message(&self, message: ReceivedMessage) {
        let payload = String::from_utf8_lossy(&message.payload).to_string();

        let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(running, Ordering::SeqCst);
        self.events.lock().unwrap().push(DeliveryEvent::Started(payload.clone()));

        if !self.processing_time.is_zero() {
            sleep(self.processing_time).await;
        }

        self.received.lock().unwrap().push(message);
        self.events.lock().unwrap().push(DeliveryEvent::Finished(payload));
        self.running.fetch_sub(1, Ordering::SeqCst);
    }
}
