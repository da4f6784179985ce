use anyhow::Context;
use std::path::PathBuf;
use tokio::sync::watch;
use tracing::{error, info};
use wsgate::config::Config;
use wsgate::routes::VERSION;
use wsgate::server::{Collaborators, Gateway};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("wsgate=debug".parse().expect("valid log directive")),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("wsgate.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;
    info!(path = %config_path.display(), "Configuration loaded");
    print_startup_banner(&config);

    let collaborators = Collaborators::from_config(&config)?;
    let gateway = Gateway::bind(&config, collaborators).await.map_err(|e| {
        error!(error = %e, "Failed to start gateway");
        e
    })?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = tokio::spawn(gateway.run(shutdown_rx));

    wait_for_signal().await?;
    let _ = shutdown_tx.send(true);

    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "Gateway exited with error"),
        Err(e) => error!(error = %e, "Gateway task panicked"),
    }

    info!("Shutdown complete");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for Ctrl+C")?;
            info!("Received SIGINT (Ctrl+C), shutting down...");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down...");
        }
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_signal() -> anyhow::Result<()> {
    tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl+C")?;
    info!("Received Ctrl+C, shutting down...");
    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(name = env!("CARGO_PKG_NAME"), version = VERSION, "Starting workspace gateway");
    info!(
        http_address = %config.server.http_address,
        tls = config.server.tls_enable,
        tls_address = %config.server.tls_address,
        certificates = config.server.tls_cert_files.len(),
        access_url = config.server.access_url.as_deref().unwrap_or(""),
        wildcard_access_url = config.server.wildcard_access_url.as_deref().unwrap_or(""),
        redirect_to_access_url = config.server.redirect_to_access_url,
        "Server configuration"
    );
    info!(
        api_rate_limit = config.server.api_rate_limit,
        window_secs = config.server.api_rate_limit_window_secs,
        "Rate limiting"
    );
    info!(
        ttl_secs = config.cache.ttl_secs,
        dial_timeout_secs = config.cache.dial_timeout_secs,
        agents = config.agents.len(),
        "Agent connection cache"
    );
}
