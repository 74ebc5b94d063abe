//! Server lifecycle
//!
//! Serves the HTTP/WebSocket router until a shutdown signal, then closes
//! every session, waits a bounded time for them to drain and stops the
//! relay.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use chatrelay_api::{create_router, AppState, ProtocolBridge};
use chatrelay_cluster::{ConnectionRegistry, RelayBus};
use chatrelay_core::Config;

const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Long-lived components the server shuts down in order
pub struct Services {
    pub registry: ConnectionRegistry,
    pub relay: Arc<RelayBus>,
    pub bridge: Arc<ProtocolBridge>,
}

pub struct RelayServer {
    config: Config,
    services: Services,
    app_state: AppState,
}

impl RelayServer {
    pub const fn new(config: Config, services: Services, app_state: AppState) -> Self {
        Self {
            config,
            services,
            app_state,
        }
    }

    /// Serve until a shutdown signal or an HTTP server failure
    pub async fn start(self) -> anyhow::Result<()> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let listener = tokio::net::TcpListener::bind(self.config.http_address())
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind {}: {e}", self.config.http_address()))?;
        info!("HTTP server listening on {}", self.config.http_address());

        let mut http_handle = self.spawn_http_server(listener, shutdown_rx);

        let http_stopped = tokio::select! {
            _ = &mut http_handle => {
                error!("HTTP server stopped unexpectedly");
                true
            }
            () = shutdown_signal() => {
                info!("Shutdown signal received, starting graceful shutdown...");
                false
            }
        };

        // Stop accepting new connections
        let _ = shutdown_tx.send(true);

        self.shutdown().await;

        if !http_stopped
            && tokio::time::timeout(self.drain_timeout(), http_handle)
                .await
                .is_err()
        {
            warn!("HTTP server did not finish within the drain timeout");
        }
        info!("chatrelay shut down complete");
        Ok(())
    }

    fn spawn_http_server(
        &self,
        listener: tokio::net::TcpListener,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let router = create_router(self.app_state.clone());
        tokio::spawn(async move {
            let graceful = async move {
                let _ = shutdown_rx.changed().await;
            };
            if let Err(e) = axum::serve(listener, router)
                .with_graceful_shutdown(graceful)
                .await
            {
                error!("HTTP server error: {}", e);
            }
            info!("HTTP server shut down gracefully");
        })
    }

    const fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.config.server.drain_timeout_seconds)
    }

    async fn shutdown(&self) {
        // 1. Close every live session
        let signalled = self.services.registry.shutdown_all();
        info!(connections = signalled, "Closing live sessions");

        // 2. Wait for sessions to finish (with timeout)
        let drain_timeout = self.drain_timeout();
        let deadline = tokio::time::Instant::now() + drain_timeout;
        loop {
            let remaining = self.services.bridge.active_sessions();
            if remaining == 0 {
                info!("All sessions drained");
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    "Drain timeout of {}s reached with {} session(s) still active",
                    drain_timeout.as_secs(),
                    remaining
                );
                break;
            }
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }

        // 3. Stop the relay publisher and subscriber along with the broker's workers
        self.services.relay.shutdown();
        let metrics = self.services.relay.metrics();
        info!(
            published = metrics.published,
            received = metrics.received,
            publish_failures = metrics.publish_failures,
            "Relay stopped"
        );
    }
}

/// Wait for a shutdown signal (SIGTERM or SIGINT/Ctrl+C)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
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
        () = ctrl_c => { info!("Received Ctrl+C"); }
        () = terminate => { info!("Received SIGTERM"); }
    }
}
