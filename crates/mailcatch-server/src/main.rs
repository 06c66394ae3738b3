//! mailcatch - SMTP capture server entry point

use anyhow::Result;
use mailcatch_common::config::{Config, LoggingConfig};
use mailcatch_core::{
    create_tls_acceptor, Dispatcher, MailProcessor, RouteTable, Sinks, SmtpServer, WebhookClient,
};
use mailcatch_storage::{FileStorage, LocalStorage, ObjectStorage};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load(std::env::args_os().nth(1).map(PathBuf::from))?;

    // Initialize logging
    init_logging(&config.logging);

    info!("Starting mailcatch...");

    if config.server.rate_limit.enabled {
        warn!("server.rate_limit is configured but not enforced");
    }

    // Initialize storage sinks
    let local: Option<Arc<dyn FileStorage>> = if config.storage.local.enabled {
        Some(Arc::new(LocalStorage::new(&config.storage.local)?))
    } else {
        None
    };
    let s3: Option<Arc<dyn FileStorage>> = if config.storage.s3.enabled {
        Some(Arc::new(ObjectStorage::new(&config.storage.s3)?))
    } else {
        None
    };

    let sinks = Sinks {
        local,
        s3,
        webhook: Arc::new(WebhookClient::new(&config.webhook)?),
    };

    // Compile routes
    let routes = RouteTable::compile(&config.routes)?;
    if routes.is_empty() {
        warn!("No enabled routes, every message will be dropped");
    }

    let dispatcher = Dispatcher::new(sinks, config.markdown.public_base_url.clone());
    let processor = Arc::new(MailProcessor::new(routes, dispatcher));

    // Bind every listener before accepting anything
    let tls_acceptor = create_tls_acceptor(&config.server.tls)?;
    let server = SmtpServer::new(&config.server, processor, tls_acceptor)
        .bind()
        .await?;

    let shutdown = CancellationToken::new();
    let server_handle = tokio::spawn(server.run(shutdown.clone()));

    info!(
        hostname = %config.server.hostname,
        ports = ?config.server.ports,
        "mailcatch started successfully"
    );

    // Wait for shutdown signal
    wait_for_signal().await?;
    info!("Shutdown signal received");

    shutdown.cancel();
    server_handle.await??;

    info!("mailcatch shutdown complete");

    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result?,
        _ = terminate.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_signal() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}

fn init_logging(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&logging.level));

    let registry = tracing_subscriber::registry().with(filter);

    if logging.format.eq_ignore_ascii_case("json") {
        registry
            .with(fmt::layer().json().with_target(true).with_current_span(true))
            .init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_level(true))
            .init();
    }
}
