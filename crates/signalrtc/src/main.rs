use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing::info;

use signalrtc::{Server, ServerConfig};

/// signalrtc: SIP signalling server with a WebRTC relay
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to a JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// SIP port to bind (overrides the config file)
    #[arg(short, long)]
    port: Option<u16>,

    /// Database URL (or path for sqlite)
    #[arg(long)]
    db: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", format!("{},signalrtc=debug", args.log_level));
    }
    tracing_subscriber::fmt::init();

    let mut config = match &args.config {
        Some(path) => ServerConfig::load(path)?,
        None => ServerConfig::default(),
    };
    if let Some(port) = args.port {
        config.sip_listen_port = port;
    }
    if let Some(db) = args.db {
        config.database_url = db;
    }

    info!(version = env!("CARGO_PKG_VERSION"), "signalrtc starting");
    info!(sip_port = config.sip_listen_port, tls_port = config.sip_tls_listen_port,
        http = %config.http_listen_addr, db = %config.database_url, "configuration loaded");

    let server = Server::build(config).await?;
    info!("server running");

    tokio::select! {
        _ = server.run() => {}
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }

    server.shutdown();
    Ok(())
}
