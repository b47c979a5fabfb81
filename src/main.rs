//! connect-proxy - Entry Point
//!
//! Runs the HTTP proxy server until Ctrl+C or SIGTERM.

use std::sync::Arc;

use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use connect_proxy::proxy::{
    BasicAuth, BufferPool, Dialer, ProxyHandler, ProxyServer, TracingLogger,
};
use connect_proxy::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = Config::from_env()?;

    // Initialize tracing
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("connect_proxy={}", config.log.level).into());
    let registry = tracing_subscriber::registry().with(filter);
    if config.log.format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }

    info!("Starting connect-proxy");

    let proxy_url = config.proxy_url()?;
    let mut builder = ProxyHandler::builder()
        .logger(TracingLogger)
        .buffer_pool(BufferPool::default());

    if let Some(username) = &config.proxy.username {
        builder = builder.authentication(BasicAuth::new(username, &config.proxy.password));
    }

    if let Some(upstream) = &config.proxy.upstream {
        let dialer = Dialer::new(upstream)?;
        info!("Chaining through upstream proxy {}", dialer.proxy_addr());
        builder = builder.dial(Arc::new(dialer));
    }

    let server = ProxyServer::from_url(&proxy_url)?
        .with_handler(builder.build()?)
        .with_compat_read_deadline(config.proxy.compat_read_deadline);

    let proxy_task = tokio::spawn({
        let server = server.clone();
        async move {
            if let Err(e) = server.run().await {
                error!("Proxy server error: {}", e);
            }
        }
    });

    // Wait for shutdown signal
    shutdown_signal().await;
    info!("Shutdown signal received");

    server.close();
    let _ = proxy_task.await;

    info!("connect-proxy stopped");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
