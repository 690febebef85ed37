use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use sitewatch_core::config::RelayConfig;

use crate::auth::{HandshakeParams, SharedSecretValidator, TokenValidator};
use crate::registry::ConnectionRegistry;
use crate::router::FrameRouter;
use crate::session::{serve_connection, FrameSink, FrameSource, SessionOutcome};
use crate::stats::{RelayStats, StatsSnapshot, StatsUpdate};

const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Runtime relay settings
#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub liveness_timeout: Duration,
    pub viewer_queue_capacity: usize,
    pub sender_queue_capacity: usize,
    pub sender_reclaim_after: Duration,
    pub max_message_size: usize,
    pub shutdown_drain: Duration,
}

impl From<&RelayConfig> for RelaySettings {
    fn from(config: &RelayConfig) -> Self {
        Self {
            liveness_timeout: Duration::from_secs(config.liveness_timeout_seconds),
            viewer_queue_capacity: config.viewer_queue_capacity,
            sender_queue_capacity: config.sender_queue_capacity,
            sender_reclaim_after: Duration::from_secs(config.sender_reclaim_after_seconds),
            max_message_size: config.max_message_size,
            shutdown_drain: Duration::from_secs(config.shutdown_drain_seconds),
        }
    }
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self::from(&RelayConfig::default())
    }
}

/// Process-wide relay state
///
/// Constructed once at startup and handed to every endpoint that accepts relay
/// connections. Cloning is cheap and shares the same state.
#[derive(Clone)]
pub struct RelayHub {
    stats: Arc<RelayStats>,
    registry: Arc<ConnectionRegistry>,
    router: Arc<FrameRouter>,
    validator: Arc<dyn TokenValidator>,
    settings: Arc<RelaySettings>,
    shutdown: CancellationToken,
}

impl RelayHub {
    pub fn new(settings: RelaySettings, validator: Arc<dyn TokenValidator>) -> Self {
        let stats = Arc::new(RelayStats::new());
        let registry = Arc::new(ConnectionRegistry::new(
            stats.clone(),
            settings.sender_reclaim_after,
        ));
        let router = Arc::new(FrameRouter::new(registry.clone(), stats.clone()));

        Self {
            stats,
            registry,
            router,
            validator,
            settings: Arc::new(settings),
            shutdown: CancellationToken::new(),
        }
    }

    /// Hub validating clients against the configured shared secret
    pub fn from_config(config: &RelayConfig) -> Self {
        Self::new(
            RelaySettings::from(config),
            Arc::new(SharedSecretValidator::new(config.token.clone())),
        )
    }

    #[must_use]
    pub const fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    #[must_use]
    pub const fn router(&self) -> &Arc<FrameRouter> {
        &self.router
    }

    #[must_use]
    pub const fn stats(&self) -> &Arc<RelayStats> {
        &self.stats
    }

    #[must_use]
    pub fn settings(&self) -> &RelaySettings {
        &self.settings
    }

    #[must_use]
    pub fn validator(&self) -> &dyn TokenValidator {
        self.validator.as_ref()
    }

    #[must_use]
    pub fn get_stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn update_stats(&self, update: StatsUpdate) {
        self.stats.update_stats(update);
    }

    /// Run one client connection to completion
    pub async fn serve<S, K>(&self, params: HandshakeParams, source: S, sink: K) -> SessionOutcome
    where
        S: FrameSource,
        K: FrameSink,
    {
        serve_connection(self.clone(), params, source, sink).await
    }

    /// Root token every session token descends from
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Ask every session to close and refuse new ones
    pub fn shutdown(&self) {
        if !self.shutdown.is_cancelled() {
            info!(
                active_connections = self.registry.len(),
                "Relay shutting down, closing all sessions"
            );
            self.shutdown.cancel();
        }
    }

    /// Wait for sessions to tear down, up to `timeout`
    ///
    /// Returns whether the registry emptied in time.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = self.registry.len();
            if remaining == 0 {
                info!("All relay connections drained");
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    remaining,
                    "Drain timeout reached with relay connections still active"
                );
                return false;
            }
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }
    }
}
