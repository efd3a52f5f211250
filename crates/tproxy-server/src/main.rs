//! tproxy-server binary: CLI, config, logging and the accept loop.

use clap::Parser;
use std::path::PathBuf;
use tproxy_server::config::ServerConfig;
use tproxy_server::server::ProxyServer;
use tracing::{error, info};

/// tproxy-server — telnet-style TCP gateway
#[derive(Parser, Debug)]
#[command(name = "tproxy-server", version, about = "Telnet-style TCP gateway")]
struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "tproxy.toml")]
    config: String,

    /// Listen address, e.g. tcp://0.0.0.0:2323
    #[arg(long)]
    bind: Option<String>,

    /// Maximum concurrent relayed sessions
    #[arg(long)]
    max_connections: Option<usize>,

    /// Maximum concurrent sessions per destination host
    #[arg(long)]
    max_connections_per_host: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Tracing is not up yet, so config errors go to stderr directly.
    let config_path = PathBuf::from(&cli.config);
    let server_config = match ServerConfig::load(
        Some(&config_path),
        cli.bind.as_deref(),
        cli.max_connections,
        cli.max_connections_per_host,
        cli.log_level.as_deref(),
    ) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("tproxy-server: failed to load config: {e}");
            std::process::exit(2);
        }
    };

    init_tracing(&server_config);

    match &server_config.source {
        Some(path) => info!(path = %path.display(), "loaded config file"),
        None => info!(path = %config_path.display(), "config file not found, using defaults"),
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        bind = %server_config.bind,
        "starting tproxy-server"
    );

    let proxy = ProxyServer::new(server_config);
    let registry = proxy.registry().clone();
    let listener = match proxy.bind().await {
        Ok(l) => l,
        Err(e) => {
            error!(error = %e, "failed to bind listener");
            std::process::exit(1);
        }
    };

    tokio::select! {
        result = proxy.run(listener) => {
            if let Err(e) = result {
                error!(error = %e, "server error");
                std::process::exit(1);
            }
        }
        _ = shutdown_signal() => {
            info!(active_sessions = registry.count(), "received shutdown signal");
        }
    }

    registry.reset();

    info!("tproxy-server stopped");
}

fn init_tracing(config: &ServerConfig) {
    if !config.log_enabled {
        return;
    }

    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_ansi(config.log_color)
        .with_target(false)
        .init();
}

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
