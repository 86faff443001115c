//! Node liveness based on periodic heartbeats. Every node sends heartbeats to the destinations
//!  of the routes it may send on, and tracks heartbeats from the possible sources of routes that
//!  end at it.

pub mod heartbeat_sender;
pub mod heartbeat_tracker;
