use std::net::SocketAddr;
use std::sync::Arc;
use rustc_hash::FxHashSet;
use tokio::net::UdpSocket;
use tracing::{debug, error, info, trace, trace_span, warn, Instrument};
use crate::liveness::heartbeat_tracker::HeartbeatTracker;
use crate::messaging::admission::{AcceptMode, AdmissionControl};
use crate::messaging::message::{MessageEnvelope, MessageId, MessageType};
use crate::messaging::messaging::ReceivedMessage;
use crate::messaging::messaging_config::AckSendStrategy;
use crate::messaging::node::Node;
use crate::messaging::ordered_executor::OrderedExecutor;
use crate::messaging::routing::Topology;
use crate::messaging::send_engine::SendEngine;
use crate::messaging::send_socket::SendSocket;
use crate::messaging::statistics::{incr, MessagingStatistics};
use crate::util::expiring_map::ExpiringMap;


#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum DedupState {
    Accepted,
    Rejected,
}

enum AckCorrelation {
    First,
    Repeated,
    Conflicting(Vec<String>),
}

/// Classifies incoming datagrams and handles them: heartbeats go to liveness tracking, ACK / NACK
///  complete sends, and NORMAL messages pass deduplication and admission control before they
///  are delivered and acknowledged.
pub struct ReceivePipeline {
    topology: Arc<Topology>,
    engine: Arc<SendEngine>,
    executor: Arc<OrderedExecutor>,
    heartbeats: Arc<HeartbeatTracker>,
    admission: Arc<AdmissionControl>,
    statistics: Arc<MessagingStatistics>,

    /// message ids that were accepted or rejected recently, for responding to retransmissions
    ///  without processing them again
    dedup: ExpiringMap<MessageId, DedupState>,
    /// message ids that were dropped recently, to count every dropped message only once
    dropped: ExpiringMap<MessageId, ()>,
    /// the nodes that acknowledged a message id, for detecting messages that were processed
    ///  by more than one node
    ack_correlation: ExpiringMap<MessageId, FxHashSet<String>>,
}

impl ReceivePipeline {
    pub fn new(topology: Arc<Topology>,
               engine: Arc<SendEngine>,
               executor: Arc<OrderedExecutor>,
               heartbeats: Arc<HeartbeatTracker>,
               admission: Arc<AdmissionControl>,
               statistics: Arc<MessagingStatistics>,
    ) -> ReceivePipeline {
        let dedup_ttl = topology.config().dedup_ttl();
        let ack_correlation_ttl = topology.config().ack_correlation_ttl();
        debug!("dedup TTL is {:?}, ack correlation TTL is {:?}", dedup_ttl, ack_correlation_ttl);

        ReceivePipeline {
            topology,
            engine,
            executor,
            heartbeats,
            admission,
            statistics,
            dedup: ExpiringMap::new(dedup_ttl),
            dropped: ExpiringMap::new(dedup_ttl),
            ack_correlation: ExpiringMap::new(ack_correlation_ttl),
        }
    }

    pub async fn on_datagram(&self, buf: &[u8], source: SocketAddr, reply_socket: &dyn SendSocket) {
        let envelope = match MessageEnvelope::deser(buf) {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!("invalid datagram from {:?} - dropping: {}", source, e);
                incr(&self.statistics.invalid);
                return;
            }
        };
        trace!("received {:?} {:?} from {}", envelope.message_type, envelope.id, envelope.from);

        match envelope.message_type {
            MessageType::Heartbeat => {
                incr(&self.statistics.received_heartbeat);
                self.heartbeats.on_heartbeat(&envelope.from);
            }
            MessageType::Ack => {
                incr(&self.statistics.received_ack);
                self.on_ack(envelope.id, &envelope.from);
            }
            MessageType::Nack => {
                incr(&self.statistics.received_nack);
                if !self.engine.on_response(envelope.id, MessageType::Nack, &envelope.from) {
                    debug!("NACK from {} for message {:?} which is not in flight", envelope.from, envelope.id);
                }
            }
            MessageType::Normal => {
                incr(&self.statistics.received_normal);
                self.on_normal(envelope, source, reply_socket).await;
            }
        }
    }

    fn on_ack(&self, id: MessageId, from: &str) {
        let was_in_flight = self.engine.on_response(id, MessageType::Ack, from);

        let correlation = self.ack_correlation.update_or_insert_with(id, FxHashSet::default, |nodes| {
            if nodes.contains(from) {
                AckCorrelation::Repeated
            }
            else if nodes.is_empty() {
                nodes.insert(from.to_string());
                AckCorrelation::First
            }
            else {
                let others = nodes.iter().cloned().collect();
                nodes.insert(from.to_string());
                AckCorrelation::Conflicting(others)
            }
        });

        match correlation {
            AckCorrelation::Conflicting(others) => {
                error!("message {:?} was acknowledged by {} after it was acknowledged by {:?} - it was probably processed more than once", id, from, others);
                incr(&self.statistics.ack_anomalies);
            }
            AckCorrelation::Repeated => {
                trace!("duplicate ACK from {} for message {:?}", from, id);
                incr(&self.statistics.duplicate_acks);
            }
            AckCorrelation::First if !was_in_flight => {
                warn!("unexpected ACK from {} for message {:?}", from, id);
                incr(&self.statistics.unexpected_acks);
            }
            AckCorrelation::First => {}
        }
    }

    /// Responses go to the sender's configured address. A sender that is not configured is
    ///  answered at the datagram's source address, i.e. at one of its outbound sockets. Messaging
    ///  built on this crate never reads from outbound sockets, so such a sender does not see the
    ///  response and its send fails after the retransmit pattern, while the message is still
    ///  delivered here once.
    async fn on_normal(&self, envelope: MessageEnvelope, source: SocketAddr, reply_socket: &dyn SendSocket) {
        let (from, reply_addr) = match self.topology.destination(&envelope.from) {
            Some(destination) => (destination.node.clone(), destination.addr),
            None => {
                warn!("message {:?} from unconfigured node {} at {:?} - responding to its source address", envelope.id, envelope.from, source);
                (Node::unconfigured(&envelope.from, source), source)
            }
        };
        let id = envelope.id;

        match self.admission.mode_for(envelope.user_tag.as_deref()) {
            AcceptMode::Accept => {
                match self.dedup.insert_if_absent(id, DedupState::Accepted) {
                    None => {
                        self.executor.submit(ReceivedMessage {
                            message_id: id,
                            from,
                            group_id: envelope.group_id,
                            user_tag: envelope.user_tag,
                            payload: envelope.payload,
                        });
                        self.respond(MessageEnvelope::ack(id, self.local_name()), reply_addr, reply_socket).await;
                    }
                    Some(previous) => self.on_duplicate(id, previous, reply_addr, reply_socket).await,
                }
            }
            AcceptMode::Reject => {
                match self.dedup.insert_if_absent(id, DedupState::Rejected) {
                    None => {
                        debug!("rejecting message {:?} with tag {:?}", id, envelope.user_tag);
                        incr(&self.statistics.rejected);
                        self.respond(MessageEnvelope::nack(id, self.local_name()), reply_addr, reply_socket).await;
                    }
                    Some(previous) => self.on_duplicate(id, previous, reply_addr, reply_socket).await,
                }
            }
            AcceptMode::Drop => {
                // not recorded for deduplication so that a retransmission can still be accepted
                //  after the accept mode changes
                if self.dropped.insert_if_absent(id, ()).is_none() {
                    debug!("dropping message {:?} with tag {:?}", id, envelope.user_tag);
                    incr(&self.statistics.dropped);
                }
            }
        }
    }

    async fn on_duplicate(&self, id: MessageId, previous: DedupState, reply_addr: SocketAddr, reply_socket: &dyn SendSocket) {
        trace!("duplicate message {:?}, previously {:?}", id, previous);
        incr(&self.statistics.duplicates);

        let response = match previous {
            DedupState::Accepted => MessageEnvelope::ack(id, self.local_name()),
            DedupState::Rejected => MessageEnvelope::nack(id, self.local_name()),
        };
        self.respond(response, reply_addr, reply_socket).await;
    }

    /// ACK and NACK are sent exactly once, they are never acknowledged themselves
    async fn respond(&self, response: MessageEnvelope, to: SocketAddr, reply_socket: &dyn SendSocket) {
        let datagram = response.to_bytes();
        let result = match self.topology.config().ack_send_strategy {
            AckSendStrategy::Immediately => {
                let result = reply_socket.send_datagram(to, &datagram).await;
                if result.is_err() {
                    incr(&self.statistics.send_errors);
                }
                result
            }
            AckSendStrategy::SendCycle => self.engine.send_one_shot(to, &datagram).await,
        };

        if let Err(e) = result {
            warn!("error sending {:?} for message {:?} to {:?}: {}", response.message_type, response.id, to, e);
        }
    }

    fn local_name(&self) -> &str {
        &self.topology.local_node().name
    }

    pub fn purge_expired(&self) {
        let purged = self.dedup.purge_expired()
            + self.dropped.purge_expired()
            + self.ack_correlation.purge_expired();
        if purged > 0 {
            trace!("purged {} expired cache entries, {} dedup entries remain", purged, self.dedup.len());
        }
    }
}


/// Receives datagrams on a socket and passes them to the pipeline until the task is aborted.
///  Datagrams that do not fit into the configured maximum datagram size are invalid.
pub async fn run_receive_loop(pipeline: Arc<ReceivePipeline>, socket: Arc<UdpSocket>) {
    let max_datagram_size = pipeline.topology.config().max_datagram_size;
    info!("starting receive loop on {:?}", socket.local_addr());

    // one byte extra to detect datagrams that were truncated
    let mut buf = vec![0u8; max_datagram_size + 1];
    loop {
        let (num_read, from) = match socket.recv_from(&mut buf).await {
            Ok(x) => x,
            Err(e) => {
                error!("socket error: {}", e);
                continue;
            }
        };

        if num_read > max_datagram_size {
            debug!("datagram from {:?} exceeds the maximum size of {} bytes - dropping", from, max_datagram_size);
            incr(&pipeline.statistics.invalid);
            continue;
        }

        let span = trace_span!("datagram_received", ?from);
        pipeline.on_datagram(&buf[..num_read], from, socket.as_ref())
            .instrument(span)
            .await;
    }
}
