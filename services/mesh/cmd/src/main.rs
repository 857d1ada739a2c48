//! Emberlink mesh node binary.
//!
//! Wires the frame codec, routing engine, delivery tracker, and gateway
//! relay engine to the transport adapters and runs the node event loop.
//! The in-process radio and backbone adapters used here are development
//! stand-ins; a deployment replaces them with the real radio driver and
//! broker client behind the same traits.

use clap::Parser;
use ember_delivery::{AckConfig, DeliveryTracker, MessageIdAllocator};
use ember_gateway::{GatewayConfig, JobType, RelayEngine, RelayServices};
use ember_routing::RoutingEngine;
use ember_storage::{open_store, StorageMode};
use ember_transport::{
    Backbone, ChannelRadio, LoopbackBackbone, PlaintextCrypto, RadioTransport, TransportManager,
};
use ember_wire::{node_alias, parse_alias};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod config;
mod logging;
mod node;

use config::EmberConfig;
use logging::EmberLogFormatter;
use node::MeshNode;

/// Emberlink mesh node
#[derive(Parser, Debug)]
#[command(name = "emberlink", version, about = "Mesh transport node with gateway relay bridging")]
struct Args {
    /// Configuration file path
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Node id (overrides config)
    #[arg(long)]
    node_id: Option<u64>,

    /// Run as a gateway offering relay services
    #[arg(long)]
    gateway: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Storage mode: memory, file (overrides config)
    #[arg(long)]
    storage_mode: Option<String>,

    /// Data directory for file storage (overrides config)
    #[arg(long)]
    storage_data_dir: Option<PathBuf>,

    /// ACK timeout, e.g. 30s
    #[arg(long, default_value = "30s")]
    ack_timeout: humantime::Duration,

    /// Logical group addresses to subscribe to (repeatable)
    #[arg(long)]
    subscribe_group: Vec<u64>,

    /// Send one text message after startup: destination alias
    #[arg(long, requires = "send_text")]
    send_to: Option<String>,

    /// Send one text message after startup: message body
    #[arg(long, requires = "send_to")]
    send_text: Option<String>,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::new("info")
        .add_directive(format!("emberlink={}", args.log_level).parse()?)
        .add_directive(format!("ember_wire={}", args.log_level).parse()?)
        .add_directive(format!("ember_routing={}", args.log_level).parse()?)
        .add_directive(format!("ember_delivery={}", args.log_level).parse()?)
        .add_directive(format!("ember_gateway={}", args.log_level).parse()?)
        .add_directive(format!("ember_storage={}", args.log_level).parse()?)
        .add_directive(format!("ember_transport={}", args.log_level).parse()?);

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_ansi(true)
        .event_format(EmberLogFormatter::new("emberlink".to_string()))
        .init();

    info!("starting emberlink v{}", env!("CARGO_PKG_VERSION"));

    // Configuration: file, then environment, then CLI
    let mut config = EmberConfig::load_from_file(&args.config)?;
    if let Some(node_id) = args.node_id {
        config.node_id = node_id;
    }
    if args.gateway {
        config.mode = "gateway".to_string();
    }
    if let Some(mode) = &args.storage_mode {
        config.storage_mode = mode.clone();
    }
    if let Some(dir) = &args.storage_data_dir {
        config.data_dir = dir.to_string_lossy().to_string();
    }
    let node_id = config.node_id;
    info!(
        "node {} ({}) starting in {} mode",
        node_id,
        node_alias(node_id),
        config.mode
    );

    // Storage
    let storage_mode = match config.storage_mode.as_str() {
        "memory" => StorageMode::InMemory,
        "file" => StorageMode::File {
            data_dir: config.data_dir.clone(),
            fsync_every: config.fsync_every,
        },
        other => anyhow::bail!("invalid storage mode: {other}. Use 'memory' or 'file'"),
    };
    let store = open_store(storage_mode).await?;

    // Transports. The channel radio's far end stands in for the radio
    // driver; frames published on the backbone frame topics reach us too.
    let (local_radio, _radio_driver_end) = ChannelRadio::pair();
    let radio_inbound = local_radio
        .take_inbound()
        .expect("fresh radio endpoint has its receiver");
    let backbone: Arc<LoopbackBackbone> = Arc::new(LoopbackBackbone::new());
    let transport = Arc::new(TransportManager::new(
        Arc::new(local_radio),
        Some(backbone.clone() as Arc<dyn Backbone>),
        config.topic_prefix.clone(),
    ));

    // Frames addressed to us (or broadcast) arriving over the backbone
    let (backbone_tx, backbone_rx) = mpsc::unbounded_channel();
    for filter in [
        format!("{}/frames/{}", config.topic_prefix, node_alias(node_id)),
        format!("{}/frames/broadcast", config.topic_prefix),
    ] {
        let mut rx = backbone.subscribe(&filter).await?;
        let tx = backbone_tx.clone();
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if tx.send(msg).is_err() {
                    break;
                }
            }
        });
    }
    drop(backbone_tx);

    // Delivery guarantee layer
    let ack_config = AckConfig {
        ack_timeout: Duration::from(args.ack_timeout),
        max_retries: config.ack_max_retries,
        ..AckConfig::default()
    };
    let (tracker, tracker_outbound, delivery_events) =
        DeliveryTracker::new(ack_config, Some(store.clone()));
    let resumed = tracker.recover().await?;
    if resumed > 0 {
        info!("resumed {resumed} in-flight deliveries");
    }
    let allocator = MessageIdAllocator::open(Some(store.clone())).await;

    // Gateway relay engine
    let mut gateway_config = if config.is_gateway() {
        GatewayConfig::gateway(node_id)
    } else {
        GatewayConfig::client(node_id)
    };
    gateway_config.topic_prefix = format!("{}/gateway", config.topic_prefix);
    let toggles = [
        (JobType::TxBroadcast, config.services.tx_broadcast),
        (JobType::CashuRelay, config.services.cashu_relay),
        (JobType::CashuRedeem, config.services.cashu_redeem),
        (JobType::PaymentForward, config.services.payment_forward),
        (JobType::ChunkReassembly, config.services.chunk_reassembly),
    ];
    for (job_type, enabled) in toggles {
        if !enabled {
            gateway_config.enabled.remove(&job_type);
        }
    }
    // External payment/broadcast backends attach here in a deployment
    let services = RelayServices::default();
    let (gateway, job_outcomes) = RelayEngine::new(
        gateway_config,
        services,
        Some(store.clone()),
        Some(backbone.clone() as Arc<dyn Backbone>),
    );
    if config.is_gateway() {
        let requeued = gateway.recover().await?;
        if requeued > 0 {
            info!("re-queued {requeued} relay jobs");
        }
        gateway.activate().await;
    }

    // Routing engine
    let mut routing = RoutingEngine::new(node_id).with_default_ttl(config.default_ttl);
    for group in &args.subscribe_group {
        routing.subscribe_group(*group);
        info!("subscribed to group {group}");
    }

    let node = MeshNode::new(
        node_id,
        routing,
        tracker.clone(),
        allocator,
        transport,
        gateway.clone(),
        Arc::new(PlaintextCrypto),
    );

    if let (Some(alias), Some(text)) = (&args.send_to, &args.send_text) {
        let to = parse_alias(alias)?;
        let msg_id = node.send_text(to, text).await?;
        info!("queued message {msg_id} to {alias}");
    }

    node.run(
        radio_inbound,
        Some(backbone_rx),
        tracker_outbound,
        delivery_events,
        job_outcomes,
    )
    .await?;

    info!("emberlink shutdown complete");
    Ok(())
}
