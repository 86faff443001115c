use std::fmt::{Debug, Formatter};
use std::iter;
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use anyhow::bail;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::watch;
use tokio::time;
use tracing::{debug, error, trace, warn};
use crate::messaging::message::{MessageEnvelope, MessageId, MessageType};
use crate::messaging::routing::{SendPlan, Topology};
use crate::messaging::send_socket::SocketPool;
use crate::messaging::statistics::{incr, MessagingStatistics};


#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SendResult {
    /// a destination acknowledged the message
    Success,
    /// a destination rejected the message, or no destination responded before the retransmit
    ///  pattern was exhausted
    Failure,
    Cancelled,
}

/// A message the application wants to send. Messages with the same group id are delivered to
///  the receiving application in the order in which they arrive.
#[derive(Clone, Debug)]
pub struct OutboundMessage {
    pub payload: Bytes,
    pub group_id: Option<String>,
    pub user_tag: Option<String>,
}
impl OutboundMessage {
    pub fn new(payload: impl Into<Bytes>, group_id: &str) -> OutboundMessage {
        OutboundMessage {
            payload: payload.into(),
            group_id: Some(group_id.to_string()),
            user_tag: None,
        }
    }

    pub fn with_tag(self, user_tag: &str) -> OutboundMessage {
        OutboundMessage {
            user_tag: Some(user_tag.to_string()),
            ..self
        }
    }
}


pub type ListenerId = u64;

type CompletionListener = Box<dyn FnOnce(SendResult) + Send>;

/// Listeners run on whichever task completes the send, often the receive loop, so a panicking
///  listener is logged and contained.
fn notify_listener(message_id: MessageId, listener: impl FnOnce(SendResult), result: SendResult) {
    if panic::catch_unwind(AssertUnwindSafe(|| listener(result))).is_err() {
        error!("completion listener for message {:?} panicked", message_id);
    }
}

struct CompletionState {
    result: Option<SendResult>,
    listeners: Vec<(ListenerId, CompletionListener)>,
    next_listener_id: ListenerId,
}

/// Shared completion state of a single send. The first result wins, later attempts to complete
///  are ignored.
struct SendCompletion {
    message_id: MessageId,
    state: Mutex<CompletionState>,
    done: watch::Sender<Option<SendResult>>,
}

impl SendCompletion {
    fn new(message_id: MessageId) -> SendCompletion {
        SendCompletion {
            message_id,
            state: Mutex::new(CompletionState {
                result: None,
                listeners: Vec::new(),
                next_listener_id: 0,
            }),
            done: watch::channel(None).0,
        }
    }

    fn result(&self) -> Option<SendResult> {
        self.state.lock().unwrap().result
    }

    /// returns `true` if this call completed the send, `false` if it was completed before
    fn complete(&self, result: SendResult) -> bool {
        let listeners = {
            let mut state = self.state.lock().unwrap();
            if state.result.is_some() {
                return false;
            }
            state.result = Some(result);
            std::mem::take(&mut state.listeners)
        };

        trace!("message {:?} completed with {:?}", self.message_id, result);
        self.done.send_replace(Some(result));
        for (_, listener) in listeners {
            notify_listener(self.message_id, listener, result);
        }
        true
    }
}


/// The caller's handle for a message that was submitted for sending. Clones refer to the same
///  send.
#[derive(Clone)]
pub struct SendFuture {
    completion: Arc<SendCompletion>,
}

impl Debug for SendFuture {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "SendFuture{{{:?}: {:?}}}", self.completion.message_id, self.completion.result())
    }
}

impl SendFuture {
    pub fn message_id(&self) -> MessageId {
        self.completion.message_id
    }

    /// the result if the send is complete, `None` otherwise
    pub fn try_result(&self) -> Option<SendResult> {
        self.completion.result()
    }

    pub async fn result(&self) -> SendResult {
        let mut done = self.completion.done.subscribe();
        let result = match done.wait_for(|r| r.is_some()).await {
            Ok(r) => *r,
            Err(_) => None,
        };
        // the sender lives as long as the completion, so the fallback is never used
        result.unwrap_or(SendResult::Cancelled)
    }

    /// Registers a listener that is called exactly once with the send's result. If the send is
    ///  complete already, the listener is called immediately in the calling thread.
    pub fn add_listener(&self, listener: impl FnOnce(SendResult) + Send + 'static) -> ListenerId {
        let mut state = self.completion.state.lock().unwrap();
        let id = state.next_listener_id;
        state.next_listener_id += 1;

        match state.result {
            Some(result) => {
                drop(state);
                notify_listener(self.completion.message_id, listener, result);
            }
            None => state.listeners.push((id, Box::new(listener))),
        }
        id
    }

    /// returns `true` if the listener was registered and had not been called yet
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut state = self.completion.state.lock().unwrap();
        let len_before = state.listeners.len();
        state.listeners.retain(|(listener_id, _)| *listener_id != id);
        state.listeners.len() != len_before
    }

    /// Stops further retransmissions and completes the send as [SendResult::Cancelled]. A
    ///  datagram that was written to the network already can not be recalled. Returns `false`
    ///  if the send was complete already.
    pub fn cancel(&self) -> bool {
        self.completion.complete(SendResult::Cancelled)
    }
}


/// The [SendEngine] turns submitted messages into retransmitted datagrams and their results.
///  Every send is driven by a task of its own that transmits according to the route's
///  retransmit pattern, while ACK / NACK arrival completes the send from the receive side.
pub struct SendEngine {
    topology: Arc<Topology>,
    pool: Arc<SocketPool>,
    statistics: Arc<MessagingStatistics>,
    in_flight: DashMap<MessageId, Arc<SendCompletion>>,
    accepting: AtomicBool,
}

impl SendEngine {
    pub fn new(topology: Arc<Topology>, pool: Arc<SocketPool>, statistics: Arc<MessagingStatistics>) -> SendEngine {
        SendEngine {
            topology,
            pool,
            statistics,
            in_flight: Default::default(),
            accepting: AtomicBool::new(true),
        }
    }

    /// Submits a message for sending. This fails for unknown routes, for group ids or tags that
    ///  can not be represented on the wire, and after shutdown. Everything that happens after
    ///  submission is reported through the returned [SendFuture].
    pub fn send(self: &Arc<Self>, route_name: &str, message: OutboundMessage) -> anyhow::Result<SendFuture> {
        if !self.accepting.load(Ordering::Acquire) {
            bail!("messaging is shut down");
        }
        if let Some(group_id) = &message.group_id {
            MessageEnvelope::validate_header_value("group id", group_id)?;
        }
        if let Some(user_tag) = &message.user_tag {
            MessageEnvelope::validate_header_value("user tag", user_tag)?;
        }

        let plan = self.topology.resolve_route(route_name)?;

        let id = MessageId::new_random();
        let envelope = MessageEnvelope::normal(id, &self.topology.local_node().name, message.group_id, message.user_tag, message.payload);
        let datagram = envelope.to_bytes();
        let max_datagram_size = self.topology.config().max_datagram_size;
        if datagram.len() > max_datagram_size {
            bail!("message of {} bytes exceeds the maximum datagram size of {} bytes", datagram.len(), max_datagram_size);
        }

        let completion = Arc::new(SendCompletion::new(id));
        self.in_flight.insert(id, completion.clone());

        debug!("sending message {:?} on route {} to {:?}", id, plan.route_name, plan.destinations);
        let engine = self.clone();
        tokio::spawn(engine.drive(completion.clone(), plan, datagram));

        Ok(SendFuture { completion })
    }

    async fn drive(self: Arc<Self>, completion: Arc<SendCompletion>, plan: SendPlan, datagram: Bytes) {
        let mut done = completion.done.subscribe();
        let final_timeout = plan.retransmit_pattern.last()
            .copied()
            .unwrap_or_default();

        'destinations:
        for (idx_destination, destination) in plan.destinations.iter().enumerate() {
            if idx_destination > 0 {
                debug!("message {:?}: failing over to {:?}", completion.message_id, destination);
            }

            let waits = plan.retransmit_pattern.iter()
                .copied()
                .chain(iter::once(final_timeout));
            for (attempt, wait) in waits.enumerate() {
                if completion.result().is_some() {
                    break 'destinations;
                }
                if attempt > 0 {
                    trace!("message {:?}: retransmission #{} to {:?}", completion.message_id, attempt, destination);
                    incr(&self.statistics.retransmissions);
                }
                self.transmit(destination.addr, &datagram).await;

                if time::timeout(wait, done.wait_for(|r| r.is_some())).await.is_ok() {
                    break 'destinations;
                }
            }
            debug!("message {:?}: no response from {:?}", completion.message_id, destination);
        }

        completion.complete(SendResult::Failure);
        self.in_flight.remove(&completion.message_id);

        match completion.result() {
            Some(SendResult::Success) => incr(&self.statistics.send_successes),
            Some(SendResult::Failure) => incr(&self.statistics.send_failures),
            Some(SendResult::Cancelled) | None => incr(&self.statistics.send_cancellations),
        }
    }

    async fn transmit(&self, to: SocketAddr, datagram: &[u8]) {
        match self.pool.send(to, datagram).await {
            Ok(()) => incr(&self.statistics.messages_sent),
            Err(e) => {
                // treated like a lost datagram: the retransmit pattern continues
                warn!("error sending datagram to {:?}: {}", to, e);
                incr(&self.statistics.send_errors);
            }
        }
    }

    /// Sends a datagram exactly once without waiting for any response
    pub async fn send_one_shot(&self, to: SocketAddr, datagram: &[u8]) -> anyhow::Result<()> {
        let result = self.pool.send(to, datagram).await;
        if result.is_err() {
            incr(&self.statistics.send_errors);
        }
        result
    }

    /// Completes the in-flight send with the given id based on a received ACK or NACK. Returns
    ///  `true` if there was a send in flight for the id.
    pub fn on_response(&self, id: MessageId, message_type: MessageType, from: &str) -> bool {
        let completion = match self.in_flight.get(&id) {
            Some(entry) => entry.value().clone(),
            None => return false,
        };

        let result = match message_type {
            MessageType::Ack => SendResult::Success,
            MessageType::Nack => SendResult::Failure,
            other => {
                warn!("ignoring {:?} as a response to message {:?}", other, id);
                return true;
            }
        };

        if completion.complete(result) {
            debug!("message {:?}: {:?} from {}", id, message_type, from);
        }
        else {
            trace!("message {:?}: {:?} from {} after completion", id, message_type, from);
        }
        true
    }

    pub fn num_in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Stops accepting new sends and cancels all sends that are in flight
    pub fn shutdown(&self) {
        self.accepting.store(false, Ordering::Release);

        let in_flight = self.in_flight.iter()
            .map(|e| e.value().clone())
            .collect::<Vec<_>>();
        debug!("cancelling {} in-flight sends", in_flight.len());
        for completion in in_flight {
            completion.complete(SendResult::Cancelled);
        }
    }
}
