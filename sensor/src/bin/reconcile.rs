use flowmap_flowgraph::{parse_network, OriginType};
use flowmap_sensor::{config::AgentConfig, logging::init_logger, reconcile::reconcile, store::open_store};

use clap::Parser;
use ipnet::IpNet;
use log::{error, info};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "flowmap-reconcile")]
#[command(version, about = "Reads captured flow and DNS records back from the store and prints mapping chains")]
struct Args {
    /// Projection to build: `address` or `fqdn`
    #[arg(value_parser = parse_origin)]
    origin: OriginType,

    /// Client prefix to read (CIDR or a single address). Defaults to the
    /// longest prefix shared by every known client.
    #[arg(long, value_parser = parse_net)]
    prefix: Option<IpNet>,

    /// Highlight names reached from these clients
    #[arg(long, value_parser = parse_net)]
    target: Option<IpNet>,

    /// Only read records of clients inside the target
    #[arg(long, requires = "target")]
    target_only: bool,

    /// Path to configuration file (overrides $FLOWMAP_CONFIG)
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Store address (overrides config file)
    #[arg(long)]
    store: Option<String>,

    /// Pretty-print the JSON report
    #[arg(long)]
    pretty: bool,
}

fn parse_origin(arg: &str) -> Result<OriginType, String> {
    arg.parse()
}

fn parse_net(arg: &str) -> Result<IpNet, String> {
    parse_network(arg).map_err(|e| e.to_string())
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let args = Args::parse();

    let loaded = match &args.config {
        Some(path) => AgentConfig::from_file(path),
        None => AgentConfig::load().map(|(config, _)| config),
    };
    let mut config = match loaded {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load config: {}", e);
            std::process::exit(1);
        }
    };
    if let Some(store) = args.store {
        config.store.address = store;
    }

    // Logs go to stderr; stdout carries the report.
    if let Err(e) = init_logger(config.logging.file.as_deref(), &config.logging.level) {
        eprintln!("Failed to initialize logging: {}", e);
        std::process::exit(1);
    }

    let store = match open_store(&config.store).await {
        Ok(store) => store,
        Err(e) => {
            error!("Failed to open store: {}", e);
            std::process::exit(1);
        }
    };

    let report = match reconcile(store.as_ref(), args.origin, args.prefix, args.target, args.target_only).await {
        Ok(report) => report,
        Err(e) => {
            error!("Reconciliation failed: {}", e);
            std::process::exit(1);
        }
    };
    info!("Built {} chains from {} records", report.chains.len(), report.records);

    let rendered = if args.pretty { serde_json::to_string_pretty(&report) } else { serde_json::to_string(&report) };
    match rendered {
        Ok(json) => println!("{}", json),
        Err(e) => {
            error!("Failed to serialize report: {}", e);
            std::process::exit(1);
        }
    }
}
