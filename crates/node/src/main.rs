mod config;
mod events;
mod node;

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tokio::time::MissedTickBehavior;

use config::NodeConfig;
use events::NodeEvent;
use node::Node;
use udt::{ControlPacer, PacketLossSimulation, SocketConfig, TrackerConfig};

#[derive(Parser)]
#[command(name = "udt-node")]
#[command(about = "Sequenced UDP endpoint with paced control feedback")]
struct Args {
    #[arg(short, long, default_value = "0.0.0.0")]
    bind: String,

    #[arg(short, long, default_value_t = udt::DEFAULT_PORT)]
    port: u16,

    #[arg(long, help = "Peer to stream reliable datagrams to")]
    peer: Option<SocketAddr>,

    #[arg(long, default_value_t = 10, help = "Control interval in ms")]
    interval_ms: u64,

    #[arg(long, default_value_t = 120)]
    idle_timeout_secs: u64,

    #[arg(long, default_value_t = 1024)]
    max_connections: usize,

    #[arg(long, default_value_t = 60, help = "Datagrams per second sent to --peer")]
    send_rate: u32,

    #[arg(long, default_value_t = 256)]
    payload_size: usize,

    #[arg(long, default_value_t = 0.0, help = "Outgoing packet loss percentage (0-100)")]
    loss_percent: f32,

    #[arg(long, default_value_t = 5)]
    stats_interval_secs: u64,

    #[arg(long, help = "Log every sequence classification")]
    debug_sequences: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let bind_addr = format!("{}:{}", args.bind, args.port);

    let loss_simulation =
        (args.loss_percent > 0.0).then(|| PacketLossSimulation::with_loss(args.loss_percent));

    let config = NodeConfig {
        socket: SocketConfig {
            control_interval: Duration::from_millis(args.interval_ms),
            max_connections: args.max_connections,
            idle_timeout: Duration::from_secs(args.idle_timeout_secs),
            tracker: TrackerConfig::default(),
            loss_simulation,
            ..Default::default()
        },
        peer: args.peer,
        send_rate: args.send_rate,
        payload_size: args.payload_size,
        stats_interval: Duration::from_secs(args.stats_interval_secs.max(1)),
        ..Default::default()
    };

    let mut node = Node::new(&bind_addr, config.clone())?;
    log::info!("Node listening on {}", node.local_addr());
    if let Some(peer) = config.peer {
        log::info!(
            "Streaming {} byte payloads to {} at {}/s",
            config.payload_size,
            peer,
            config.send_rate
        );
    }

    let mut pacer = ControlPacer::new(config.socket.control_interval);
    let pacer_stop = pacer.stop_handle();
    let socket = node.socket().clone();
    let pacer_task = tokio::spawn(async move {
        pacer
            .run_async(|| {
                socket.emit_control();
            })
            .await;
        pacer.cycles()
    });

    let mut poll = tokio::time::interval(Duration::from_millis(1));
    poll.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut report = tokio::time::interval(config.stats_interval);
    report.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = &mut shutdown => {
                result?;
                log::info!("Shutdown requested");
                break;
            }
            _ = poll.tick() => {
                node.tick_once();
                if args.debug_sequences {
                    for addr in node.socket().connection_addrs() {
                        node.socket().set_connection_debug(addr, true);
                    }
                }
                log_events(&mut node);
            }
            _ = report.tick() => {
                node.log_stats();
            }
        }
    }

    pacer_stop.stop();
    let cycles = pacer_task.await?;
    log::info!("Control pacer ran {} cycles", cycles);

    node.log_stats();
    node.shutdown();
    log_events(&mut node);

    let deliveries = node.deliveries();
    log::info!(
        "Delivered {} in order, {} out of order, {} unsequenced, {} messages ({} bytes)",
        deliveries.in_order,
        deliveries.out_of_order,
        deliveries.unsequenced,
        deliveries.messages,
        deliveries.bytes
    );

    Ok(())
}

fn log_events(node: &mut Node) {
    for event in node.drain_events() {
        match event {
            NodeEvent::PeerConnected { addr } => {
                log::info!("Peer {} connected", addr);
            }
            NodeEvent::PeerRemoved { addr, reason } => {
                log::info!("Peer {} {}", addr, reason.as_str());
            }
            NodeEvent::MessageFailed { addr, message } => {
                log::warn!("Message {} from {} failed", message, addr);
            }
            NodeEvent::Error { message } => {
                log::error!("{}", message);
            }
        }
    }
}
