use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use clap::Parser;
use imscf_messaging::messaging::admission::AcceptMode;
use imscf_messaging::messaging::messaging::{MessageListener, MessagingService, ReceivedMessage};
use imscf_messaging::messaging::messaging_config::{MessagingConfig, Route, RouteMode};
use imscf_messaging::messaging::node::Node;
use imscf_messaging::messaging::send_engine::{OutboundMessage, SendResult};
use tokio::time::sleep;
use tracing::{info, warn, Level};

/// Runs a signaling node SL1 and an execution node EL1 on localhost and sends messages from
///  SL1 to EL1
#[derive(Parser)]
struct Args {
    #[clap(long, default_value_t = 17001)]
    base_port: u16,

    #[clap(long, default_value_t = 10)]
    messages: usize,

    #[clap(long, default_value_t = 3)]
    calls: usize,

    /// tag of messages that EL1 rejects
    #[clap(long)]
    reject_tag: Option<String>,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,

    #[clap(long, default_value_t = false)]
    very_verbose: bool,
}

struct LoggingListener {
    node: &'static str,
}

#[async_trait]
impl MessageListener for LoggingListener {
    async fn on_message(&self, message: ReceivedMessage) {
        info!("{} received {:?} from {} in group {:?} with tag {:?}",
            self.node,
            String::from_utf8_lossy(&message.payload),
            message.from,
            message.group_id,
            message.user_tag,
        );
    }
}

fn config(local_node: &str, base_port: u16) -> MessagingConfig {
    let nodes = vec![
        Node::new("SL1", "127.0.0.1", base_port),
        Node::new("EL1", "127.0.0.1", base_port + 1),
    ];
    let routes = vec![
        Route::new("SL1->EL1", RouteMode::Failover, &["SL1"], &["EL1"], vec![Duration::from_millis(500), Duration::from_millis(1000)]),
    ];

    let mut config = MessagingConfig::new(local_node, nodes, routes);
    config.heartbeat_interval = Duration::from_millis(200);
    config.heartbeat_timeout = Duration::from_millis(600);
    config
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match (args.verbose, args.very_verbose) {
        (_, true) => Level::TRACE,
        (true, _) => Level::DEBUG,
        (false, false) => Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .try_init()
        .ok();

    let sl1 = MessagingService::new(Arc::new(LoggingListener { node: "SL1" }));
    let el1 = MessagingService::new(Arc::new(LoggingListener { node: "EL1" }));
    if let Some(tag) = &args.reject_tag {
        el1.set_accept_mode(AcceptMode::Reject, &[tag.as_str()]);
    }

    sl1.initialize(config("SL1", args.base_port)).await?;
    el1.initialize(config("EL1", args.base_port)).await?;

    sleep(Duration::from_millis(300)).await;
    info!("EL1 sees SL1 as {:?}", el1.liveness("SL1").await);

    let mut futures = Vec::new();
    for i in 0..args.messages {
        let mut message = OutboundMessage::new(format!("IDP:{}", i), &format!("call-{}", i % args.calls.max(1)));
        if let Some(tag) = &args.reject_tag {
            if i % 2 == 0 {
                message = message.with_tag(tag);
            }
        }
        futures.push(sl1.send("SL1->EL1", message).await?);
    }

    for future in futures {
        match future.result().await {
            SendResult::Success => info!("message {:?} was acknowledged", future.message_id()),
            other => warn!("message {:?} completed with {:?}", future.message_id(), other),
        }
    }

    info!("SL1 statistics: {:?}", sl1.statistics());
    info!("EL1 statistics: {:?}", el1.statistics());

    sl1.shutdown().await;
    el1.shutdown().await;
    Ok(())
}
