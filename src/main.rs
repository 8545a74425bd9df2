//! Peridot daemon: wires the chain core, the P2P node and the RPC facade.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use peridot::blockchain::storage::ChainDb;
use peridot::blockchain::Core;
use peridot::checkpoints::Checkpoints;
use peridot::config::PeridotConfig;
use peridot::currency::CurrencyBuilder;
use peridot::observers::EventBus;
use peridot::p2p::node::{self, NetNodeConfig};
use peridot::protocol::ProtocolHandler;
use peridot::rpc::{self, RpcState};

#[derive(Parser)]
#[command(name = "peridotd", about = "Peridot full node")]
struct Args {
    /// Data directory (chain database, peer state, config file)
    #[arg(long, default_value = "./peridot-data")]
    data_dir: PathBuf,

    /// P2P listen port (overrides the config file)
    #[arg(long)]
    p2p_port: Option<u16>,

    /// Externally reachable P2P port advertised to peers
    #[arg(long)]
    external_port: Option<u16>,

    /// RPC listen port (overrides the config file)
    #[arg(long)]
    rpc_port: Option<u16>,

    /// Connect exclusively to this peer (may repeat)
    #[arg(long = "add-exclusive-peer")]
    exclusive_peers: Vec<String>,

    /// Use testnet parameters
    #[arg(long)]
    testnet: bool,

    /// Log filter (e.g. "info", "peridot=debug")
    #[arg(long, default_value = "info")]
    log: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log.clone().into()),
        )
        .init();

    std::fs::create_dir_all(&args.data_dir)?;
    let mut config = PeridotConfig::load(&args.data_dir);
    config.node.data_dir = args.data_dir.display().to_string();
    if let Some(port) = args.p2p_port {
        config.node.p2p_port = port;
    }
    if let Some(port) = args.external_port {
        config.node.external_port = port;
    }
    if let Some(port) = args.rpc_port {
        config.node.rpc_port = port;
    }
    if !args.exclusive_peers.is_empty() {
        config.node.exclusive_peers = args.exclusive_peers.clone();
    }
    if args.testnet {
        config.node.testnet = true;
    }

    let currency = CurrencyBuilder::new().testnet(config.node.testnet).build();
    tracing::info!(
        genesis = %hex::encode(currency.genesis_block_hash()),
        testnet = config.node.testnet,
        "currency initialized"
    );

    let checkpoints = if config.node.testnet {
        Checkpoints::new()
    } else {
        Checkpoints::with_embedded()?
    };

    // The chain database is owned by the core; peer state lives in its own
    // database so both subsystems can persist independently.
    let chain_db = ChainDb::open(&args.data_dir.join("chain"))?;
    let p2p_db = Arc::new(ChainDb::open(&args.data_dir.join("p2p"))?);
    let bus = EventBus::new();
    let core = Arc::new(Core::new(currency, checkpoints, bus, Some(chain_db))?);
    core.load_pool_state();

    let handler = Arc::new(ProtocolHandler::new(core.clone()));

    let p2p_config = NetNodeConfig {
        listen_addr: config
            .p2p_listen_addr()
            .ok_or("invalid p2p listen address")?,
        external_port: config.node.external_port,
        connections_count: config.node.connections_count,
        seed_nodes: config.parse_seed_nodes(),
        exclusive_peers: config.parse_exclusive_peers(),
    };
    let node_handle = node::start(p2p_config, handler.clone(), Some(p2p_db)).await?;
    tracing::info!(addr = %node_handle.local_addr, "p2p started");

    let rpc_state = Arc::new(RpcState {
        core: core.clone(),
        handler: handler.clone(),
        node: Some(node_handle.clone()),
    });
    let rpc_addr = config.rpc_listen_addr().ok_or("invalid rpc listen address")?;
    let rpc_task = tokio::spawn(rpc::serve(rpc_state, rpc_addr));

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    node_handle.stop().await;
    core.save();
    rpc_task.abort();
    Ok(())
}
