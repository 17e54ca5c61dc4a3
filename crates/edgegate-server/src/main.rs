//! edgegate: WebSocket tunnel gateway.
//!
//! Accepts WebSocket connections carrying a user-id-authenticated request
//! header, relays TCP to the requested destination (falling back through
//! configured proxy endpoints) and answers DNS over UDP/53 via DoH.

mod config;
mod gateway;
mod relay;
mod router;
mod server;
mod session;
mod transport;

#[cfg(test)]
mod test_support;

use clap::Parser;
use config::{ConfigOverrides, GatewayConfig};
use server::GatewayServer;
use std::path::PathBuf;
use tracing::{error, info};

/// edgegate: WebSocket tunnel gateway
#[derive(Parser, Debug)]
#[command(name = "edgegate", version, about = "WebSocket tunnel gateway")]
struct Cli {
    /// Listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Listen address
    #[arg(long)]
    listen: Option<String>,

    /// Config file path
    #[arg(long, default_value = "~/.edgegate/config.toml")]
    config: String,

    /// User id (UUID v4) that clients must present
    #[arg(long, env = "UUID")]
    user_id: Option<String>,

    /// Fallback proxy endpoint, `host[:port]`; repeatable or comma-separated
    #[arg(long = "proxy", env = "PROXYIP", value_delimiter = ',')]
    proxy: Vec<String>,

    /// DNS-over-HTTPS resolver URL
    #[arg(long)]
    doh_url: Option<String>,

    /// Per-attempt connect timeout in seconds
    #[arg(long)]
    connect_timeout: Option<u64>,

    /// Maximum concurrent sessions
    #[arg(long)]
    max_sessions: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting edgegate");

    // Load config (file + CLI/env overrides)
    let config_path = PathBuf::from(&cli.config);
    let overrides = ConfigOverrides {
        listen: cli.listen,
        port: cli.port,
        max_sessions: cli.max_sessions,
        user_id: cli.user_id,
        proxy_endpoints: cli.proxy,
        connect_timeout_secs: cli.connect_timeout,
        doh_url: cli.doh_url,
    };
    let gateway_config = match GatewayConfig::load(Some(&config_path), overrides) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    let server = match GatewayServer::new(gateway_config) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to create server");
            std::process::exit(1);
        }
    };

    // Run until shutdown signal
    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!(error = %e, "server error");
                std::process::exit(1);
            }
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
        }
    }

    info!("edgegate stopped");
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
