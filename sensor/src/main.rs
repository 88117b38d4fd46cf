use flowmap_sensor::{
    config::AgentConfig,
    logging::init_logger,
    metrics::CaptureMetrics,
    service::{shutdown_on, CaptureService, StopReason},
    source::PacketSource,
    store::open_store,
};

use clap::Parser;
use ipnet::IpNet;
use log::{error, info, warn};
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;

#[derive(Parser, Debug)]
#[command(name = "pcap-agent")]
#[command(version, about = "Passive flow capture agent - records which local clients talk to which remote endpoints")]
struct Args {
    /// Interface to capture on
    interface: String,

    /// Local network in CIDR form. Its family selects IPv4 or IPv6 capture.
    local_network: IpNet,
}

// Configuration comes from `$FLOWMAP_CONFIG` or `./flowmap.toml`, never from flags.
#[tokio::main(flavor = "current_thread")]
async fn main() {
    let args = Args::parse();

    let (config, config_path) = match AgentConfig::load() {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("Failed to load config: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = init_logger(config.logging.file.as_deref(), &config.logging.level) {
        eprintln!("Failed to initialize logging: {}", e);
        std::process::exit(1);
    }
    match &config_path {
        Some(path) => info!("Loaded configuration from {:?}", path),
        None => warn!("No config file found, using defaults"),
    }

    info!("=== Flow capture agent starting ===");
    info!("Interface: {}", args.interface);
    info!("Local network: {}", args.local_network);
    info!("Store: {}", config.store.address);

    let store = match open_store(&config.store).await {
        Ok(store) => store,
        Err(e) => {
            error!("Failed to open store: {}", e);
            std::process::exit(1);
        }
    };

    let mut source = match open_source(&args.interface, &args.local_network) {
        Ok(source) => source,
        Err(e) => {
            error!("Failed to open capture on {}: {}", args.interface, e);
            std::process::exit(1);
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(shutdown_on(signal::ctrl_c(), shutdown_tx));

    let metrics = Arc::new(CaptureMetrics::new());
    let service = CaptureService::new(&config, args.local_network, store, metrics);
    let summary = service.run(source.as_mut(), shutdown_rx).await;

    info!("=== Final Statistics ===");
    info!("{}", summary.metrics.log_line());
    info!("Agent stopped ({})", summary.reason.as_str());
    if summary.reason == StopReason::ReadError {
        std::process::exit(1);
    }
}

#[cfg(target_os = "linux")]
fn open_source(interface: &str, local: &IpNet) -> Result<Box<dyn PacketSource>, flowmap_sensor::SourceError> {
    let source = flowmap_sensor::source::RawSocketSource::open(interface, local)?;
    if !source.is_promiscuous() {
        warn!("Capturing on {} without promiscuous mode", interface);
    }
    Ok(Box::new(source))
}

#[cfg(not(target_os = "linux"))]
fn open_source(_interface: &str, _local: &IpNet) -> Result<Box<dyn PacketSource>, flowmap_sensor::SourceError> {
    Err(flowmap_sensor::SourceError::Unsupported)
}
