pub mod admission;
pub mod message;
pub mod messaging;
pub mod messaging_config;
pub mod node;
pub mod ordered_executor;
pub mod receive_pipeline;
pub mod routing;
pub mod send_engine;
pub mod send_socket;
pub mod statistics;
