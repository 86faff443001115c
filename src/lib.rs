//! Reliable messaging between the nodes of a signaling gateway, built directly on UDP.
//!
//! Nodes exchange small per-call control messages. The network is best effort, nodes restart,
//!  and receivers may shed load, so this crate provides:
//! * application-acknowledged at-least-once delivery: a message is retransmitted according to
//!   its route's retransmit pattern until the receiving application side acknowledges (ACK) or
//!   rejects (NACK) it
//! * at-most-once delivery to the application: receivers deduplicate by message id and
//!   answer retransmissions of a message with the response they gave the first time
//! * routes with failover (try destinations in order) or load balancing (one destination per
//!   message) between destination nodes
//! * in-order delivery per group id (e.g. a call), with different groups delivered concurrently
//! * node liveness based on heartbeats
//! * admission control per message tag (accept / reject / drop) for shedding load
//!
//! ## Design
//!
//! * Sending a message spawns a task that drives its retransmissions. The result is reported
//!   through a [messaging::send_engine::SendFuture] that supports awaiting, listeners and
//!   cancellation.
//! * Receiving happens in one task per receive socket. Several sockets can share a port using
//!   SO_REUSEPORT where the platform supports it.
//! * Accepted messages are handed to an ordered executor that calls the application's
//!   [messaging::messaging::MessageListener] on a bounded number of workers.
//! * Deduplication and ACK correlation use concurrent maps with expiring entries; their time to
//!   live is derived from the configured retransmit patterns.
//! * Configuration is an immutable snapshot; reconfiguration means re-initializing the service.
//!
//! ## Not covered:
//! * ordering across different group ids
//! * exactly-once processing: a receiver that restarts forgets which messages it processed
//! * persistence of messages across restarts
//! * encryption or authentication of datagrams

pub mod liveness;
pub mod messaging;
pub mod util;
pub mod test_util;


#[cfg(test)]
mod test {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::DEBUG)
            // .with_max_level(Level::TRACE)
            .try_init()
            .ok();
    }
}
