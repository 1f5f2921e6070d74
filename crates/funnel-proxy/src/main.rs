//! mcp-funnel entry point: loads config, starts upstream transports,
//! and serves the inbound MCP surface plus the OAuth authorization
//! server over HTTP.

#![warn(clippy::all)]

use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, warn};

use funnel_transport::TransportFactory;

use funnel_proxy::cli::Cli;
use funnel_proxy::http::build_inbound_auth;
use funnel_proxy::{build_router, FunnelConfig, ProxyError, ProxyKernel, ProxyResult};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    cli.init_tracing();

    if let Err(err) = run(cli).await {
        error!(error = %err, "fatal startup error");
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> ProxyResult<()> {
    let config = FunnelConfig::load(&cli.config).await?;

    let secret_manager = config.build_secret_manager();
    for (key, value) in secret_manager.resolve_secrets().await {
        std::env::set_var(key, value);
    }

    let (validator, generated_token) = build_inbound_auth(&config)?;
    if let Some(token) = &generated_token {
        println!("Generated inbound auth token (no token was configured): {token}");
    } else if cli.print_auth_token {
        warn!("--print-auth-token passed but no token was generated (auth is disabled or explicitly configured)");
    }

    let factory = TransportFactory::new();
    let kernel = Arc::new(ProxyKernel::build(&config, &factory, None)?);
    kernel.start().await?;
    info!(
        servers = kernel.server_count(),
        tools = kernel.tool_count(),
        "upstream servers started"
    );

    let app = build_router(kernel.clone(), Arc::new(validator), &config);

    let host = cli.resolved_host();
    let port = cli.resolved_port();
    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|err| ProxyError::configuration_with_key(err.to_string(), "bind address"))?;
    info!(%addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(kernel))
        .await
        .map_err(|err| ProxyError::configuration(err.to_string()))?;

    Ok(())
}

/// Waits for SIGINT/SIGTERM, then closes every upstream transport before
/// letting axum finish the graceful shutdown.
async fn shutdown_signal(kernel: Arc<ProxyKernel>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("shutdown signal received, closing upstream transports");
    kernel.shutdown().await;
}
