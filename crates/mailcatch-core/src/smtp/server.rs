//! SMTP listener manager

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use mailcatch_common::config::ServerConfig;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use super::handler::{SessionContext, SmtpHandler};
use super::MessageHandler;

/// Back-off after a failed accept, so a persistent error does not spin
const ACCEPT_ERROR_DELAY: Duration = Duration::from_millis(100);

/// SMTP server, not yet listening
pub struct SmtpServer {
    context: Arc<SessionContext>,
    bind_address: String,
    ports: Vec<u16>,
    implicit_tls_ports: Vec<u16>,
    shutdown_grace: Duration,
}

impl SmtpServer {
    pub fn new(
        config: &ServerConfig,
        handler: Arc<dyn MessageHandler>,
        tls_acceptor: Option<TlsAcceptor>,
    ) -> Self {
        // Implicit TLS only makes sense with an acceptor
        let implicit_tls_ports = if tls_acceptor.is_some() {
            config.tls.implicit_tls_ports.clone()
        } else {
            Vec::new()
        };

        Self {
            context: Arc::new(SessionContext::new(config, handler, tls_acceptor)),
            bind_address: config.bind_address.clone(),
            ports: config.ports.clone(),
            implicit_tls_ports,
            shutdown_grace: Duration::from_secs(config.shutdown_grace_secs),
        }
    }

    /// Bind every configured port. Any failure aborts before a single
    /// connection is accepted.
    pub async fn bind(self) -> Result<BoundServer> {
        let mut listeners = Vec::with_capacity(self.ports.len());

        for &port in &self.ports {
            let addr = format!("{}:{}", self.bind_address, port);
            let socket = TcpListener::bind(&addr)
                .await
                .with_context(|| format!("Failed to bind {}", addr))?;
            let implicit_tls = self.implicit_tls_ports.contains(&port);

            info!(
                address = %socket.local_addr()?,
                implicit_tls,
                starttls = self.context.config.tls_available && !implicit_tls,
                "SMTP listener bound"
            );
            listeners.push(Listener {
                socket,
                port,
                implicit_tls,
            });
        }

        Ok(BoundServer {
            context: self.context,
            listeners,
            shutdown_grace: self.shutdown_grace,
        })
    }
}

struct Listener {
    socket: TcpListener,
    /// Configured port, which may be 0
    port: u16,
    implicit_tls: bool,
}

/// SMTP server with every socket bound
pub struct BoundServer {
    context: Arc<SessionContext>,
    listeners: Vec<Listener>,
    shutdown_grace: Duration,
}

impl BoundServer {
    pub fn local_addrs(&self) -> Result<Vec<SocketAddr>> {
        self.listeners
            .iter()
            .map(|l| l.socket.local_addr().map_err(Into::into))
            .collect()
    }

    /// Accept until `shutdown` fires, then give in-flight sessions the
    /// grace period to finish.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let sessions = TaskTracker::new();

        let accept_loops: Vec<_> = self
            .listeners
            .into_iter()
            .map(|listener| {
                tokio::spawn(accept_loop(
                    listener,
                    self.context.clone(),
                    sessions.clone(),
                    shutdown.clone(),
                ))
            })
            .collect();

        for handle in accept_loops {
            if let Err(e) = handle.await {
                error!(error = %e, "Accept loop panicked");
            }
        }

        sessions.close();
        info!(active_sessions = sessions.len(), "Listeners closed, draining sessions");

        if tokio::time::timeout(self.shutdown_grace, sessions.wait())
            .await
            .is_err()
        {
            warn!(
                active_sessions = sessions.len(),
                grace_secs = self.shutdown_grace.as_secs(),
                "Grace period elapsed, abandoning sessions"
            );
        }

        Ok(())
    }
}

async fn accept_loop(
    listener: Listener,
    context: Arc<SessionContext>,
    sessions: TaskTracker,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!(port = listener.port, "SMTP listener stopped");
                break;
            }
            accepted = listener.socket.accept() => match accepted {
                Ok((stream, peer_addr)) => {
                    let handler = SmtpHandler::new(context.clone(), peer_addr, listener.port);
                    let implicit_tls = listener.implicit_tls;
                    sessions.spawn(async move {
                        if let Err(e) = handler.handle(stream, implicit_tls).await {
                            warn!(peer = %peer_addr, error = %format!("{:#}", e), "Session ended with error");
                        }
                    });
                }
                Err(e) => {
                    error!(port = listener.port, error = %e, "Failed to accept connection");
                    tokio::time::sleep(ACCEPT_ERROR_DELAY).await;
                }
            }
        }
    }
}
