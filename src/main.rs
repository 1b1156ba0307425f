//! hobo_vr relay server: pairs posers with drivers over TCP.

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};

use hobo_vr::config::Config;
use hobo_vr::logging;
use hobo_vr::relay::{RelayServer, RelaySettings};

#[derive(Parser, Debug)]
#[command(name = "hobo_vr", version = hobo_vr::VERSION, about = "hobo_vr relay server")]
struct Args {
    /// Config file
    #[arg(short, long, default_value = "config.toml")]
    config: String,
    /// Listen address (overrides server.addr)
    #[arg(short, long)]
    addr: Option<String>,
    /// Log every relayed message
    #[arg(long)]
    show_messages: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let (mut config, load_error) = Config::load_or_default(&args.config);
    if let Some(path) = logging::init(&config.log, "relay")? {
        info!("logging to {}", path.display());
    }
    if let Some(e) = load_error {
        warn!("{e:#}, using defaults");
    }

    if let Some(addr) = args.addr {
        config.server.addr = addr;
    }
    config.server.show_messages |= args.show_messages;

    info!("=== hobo_vr relay {} ===", hobo_vr::VERSION);
    let server = RelayServer::bind(&config.server.addr, RelaySettings::from_config(&config.server)).await?;
    info!("serving on {}", server.local_addr()?);

    let handle = server.handle();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("failed to listen for ctrl-c: {e}");
            return;
        }
        info!("interrupted, shutting down");
        handle.shutdown();
    });

    server.run().await?;
    info!("relay stopped");
    Ok(())
}
