//! mcpgate - MCP gateway host binary
//!
//! Loads the gateway configuration, builds the backend fleet, and serves
//! length-prefixed MCP requests over TCP until interrupted. Exits with 0
//! on clean shutdown and nonzero on startup failure.

use std::sync::Arc;

use anyhow::Result;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use mcpgate::cli::Cli;
use mcpgate::codec::JsonCodec;
use mcpgate::config::Config;
use mcpgate::framing::{read_frame, write_frame, MAX_MCP_MESSAGE_SIZE};
use mcpgate::gateway::{Backend, GatewayRouter};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse_args();
    init_tracing(cli.log.as_deref());

    let config_path = cli.config.as_deref().unwrap_or("config/mcpgate.yaml");
    let config = Config::load(config_path)?;
    config.validate()?;

    let mut backends = Vec::with_capacity(config.gateway.backends.len());
    for backend_config in &config.gateway.backends {
        backends.push(Backend::from_config(backend_config)?);
    }
    tracing::info!(backends = backends.len(), "backend fleet configured");

    let gateway = Arc::new(GatewayRouter::new(backends, Arc::new(JsonCodec)));
    let listener = TcpListener::bind(&config.gateway.listen_addr).await?;
    tracing::info!(addr = %config.gateway.listen_addr, "gateway listening");

    let shutdown = CancellationToken::new();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupt received; shutting down");
                break;
            }
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                tracing::debug!(%peer, "client connected");
                let gateway = Arc::clone(&gateway);
                let cancel = shutdown.child_token();
                tokio::spawn(async move {
                    serve_connection(stream, gateway, cancel).await;
                    tracing::debug!(%peer, "client disconnected");
                });
            }
        }
    }

    shutdown.cancel();
    gateway.shutdown().await;
    Ok(())
}

/// Serve one frontend connection: read framed requests, dispatch through
/// the gateway, write framed replies. Any framing error ends the
/// connection.
async fn serve_connection(
    mut stream: TcpStream,
    gateway: Arc<GatewayRouter>,
    cancel: CancellationToken,
) {
    loop {
        let request = match read_frame(&mut stream, MAX_MCP_MESSAGE_SIZE, Some(&cancel)).await {
            Ok(request) => request,
            Err(_) => break,
        };
        let reply = gateway.handle(&request).await;
        if write_frame(&mut stream, &reply, Some(&cancel)).await.is_err() {
            break;
        }
    }
}

fn init_tracing(filter_override: Option<&str>) {
    let env_filter = match filter_override {
        Some(filter) => EnvFilter::new(filter),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("mcpgate=info")),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
