//! Server orchestration
//!
//! Starts the HTTP/WebSocket listener and the optional stats reporter, then
//! waits for a shutdown signal and tears everything down in order.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use sitewatch_core::Config;
use sitewatch_relay::{RelayHub, StatsReporter};

const HTTP_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

pub struct SitewatchServer {
    config: Arc<Config>,
    hub: RelayHub,
}

impl SitewatchServer {
    pub const fn new(config: Arc<Config>, hub: RelayHub) -> Self {
        Self { config, hub }
    }

    /// Start all components and wait for shutdown signal
    pub async fn start(self) -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind(self.config.listen_address())
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind {}: {e}", self.config.listen_address()))?;
        info!("Relay listening on {}", self.config.websocket_url());

        let mut http_handle = self.start_http_server(listener);

        // The reporter outlives the relay drain so its last push reflects the final counts
        let reporter_cancel = CancellationToken::new();
        let reporter_handle = self.start_reporter(reporter_cancel.clone())?;

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

        let http_handle = (!http_stopped).then_some(http_handle);
        self.shutdown(http_handle, reporter_cancel, reporter_handle).await;
        Ok(())
    }

    fn start_http_server(&self, listener: tokio::net::TcpListener) -> JoinHandle<()> {
        let router = sitewatch_api::create_router(self.hub.clone(), self.config.clone());
        let shutdown = self.hub.shutdown_token();

        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router)
                .with_graceful_shutdown(shutdown.cancelled_owned())
                .await
            {
                error!("HTTP server error: {}", e);
            }
            info!("HTTP server shut down gracefully");
        })
    }

    fn start_reporter(&self, cancel: CancellationToken) -> anyhow::Result<Option<JoinHandle<()>>> {
        let Some(url) = self.config.stats.report_url.clone() else {
            return Ok(None);
        };
        let reporter = StatsReporter::new(
            url,
            Duration::from_secs(self.config.stats.report_interval_seconds),
            self.hub.stats().clone(),
        )
        .map_err(|e| anyhow::anyhow!("Failed to build stats reporter: {e}"))?;
        Ok(Some(reporter.spawn(cancel)))
    }

    /// Gracefully shut down all components
    async fn shutdown(
        &self,
        http_handle: Option<JoinHandle<()>>,
        reporter_cancel: CancellationToken,
        reporter_handle: Option<JoinHandle<()>>,
    ) {
        info!("Shutting down SiteWatch relay...");

        // 1. Close every relay session and wait for them to drain
        self.hub.shutdown();
        let drain_timeout = self.hub.settings().shutdown_drain;
        let active = self.hub.registry().len();
        if active > 0 {
            info!(
                "Waiting up to {}s for {} relay connection(s) to drain...",
                drain_timeout.as_secs(),
                active
            );
        }
        self.hub.drain(drain_timeout).await;

        // 2. Final stats
        let stats = self.hub.get_stats();
        info!(
            uptime_ms = stats.uptime_ms,
            connections_accepted = stats.connections_accepted,
            frames_received = stats.frames_received,
            frames_relayed = stats.frames_relayed,
            frames_dropped = stats.frames_dropped,
            derived_fps = stats.derived_fps,
            "Final relay stats"
        );

        // 3. Flush the reporter
        reporter_cancel.cancel();
        if let Some(handle) = reporter_handle {
            if let Err(e) = handle.await {
                warn!("Stats reporter task failed: {}", e);
            }
        }

        // 4. HTTP listener (already signalled through the hub token)
        if let Some(handle) = http_handle {
            if tokio::time::timeout(HTTP_SHUTDOWN_TIMEOUT, handle).await.is_err() {
                warn!("HTTP server did not stop within {}s", HTTP_SHUTDOWN_TIMEOUT.as_secs());
            }
        }

        info!("SiteWatch relay stopped");
    }
}

/// Wait for a shutdown signal (SIGTERM or SIGINT/Ctrl+C)
async fn shutdown_signal() {
    let ctrl_c = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {}
            Err(e) => {
                error!("Failed to install Ctrl+C handler: {}", e);
                std::future::pending::<()>().await;
            }
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
