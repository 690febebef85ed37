//! Out-of-band stats reporter
//!
//! When the status API runs in a different process, the relay periodically
//! pushes its locally measured counts there with an `update_stats` request.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::stats::{RelayStats, StatsUpdate};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Serialize)]
struct UpdateStatsRequest {
    action: &'static str,
    #[serde(flatten)]
    update: StatsUpdate,
}

/// Periodically pushes relay counts to a remote status API
pub struct StatsReporter {
    client: reqwest::Client,
    url: String,
    period: Duration,
    stats: Arc<RelayStats>,
}

impl StatsReporter {
    pub fn new(url: impl Into<String>, period: Duration, stats: Arc<RelayStats>) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            client,
            url: url.into(),
            period,
            stats,
        })
    }

    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Push the current local counts once
    pub async fn report_once(&self) -> reqwest::Result<()> {
        let snapshot = self.stats.local_snapshot();
        let body = UpdateStatsRequest {
            action: "update_stats",
            update: StatsUpdate {
                total_connections: Some(snapshot.total_connections),
                sender_count: Some(snapshot.sender_count),
                viewer_count: Some(snapshot.viewer_count),
                frames_relayed: Some(snapshot.frames_relayed),
            },
        };

        self.client
            .post(&self.url)
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    /// Report every period until cancelled, then flush once more
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(cancel).await })
    }

    async fn run(self, cancel: CancellationToken) {
        info!(url = %self.url, period_secs = self.period.as_secs(), "Stats reporter started");
        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    match self.report_once().await {
                        Ok(()) => debug!(url = %self.url, "Stats reported"),
                        Err(e) => warn!(url = %self.url, error = %e, "Failed to report stats"),
                    }
                }
            }
        }

        match self.report_once().await {
            Ok(()) => info!(url = %self.url, "Final stats flushed"),
            Err(e) => warn!(url = %self.url, error = %e, "Failed to flush final stats"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sitewatch_core::models::UserType;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn status_api(status: u16) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/camera/ws"))
            .respond_with(ResponseTemplate::new(status))
            .mount(&server)
            .await;
        server
    }

    fn endpoint(server: &MockServer) -> String {
        format!("{}/api/camera/ws", server.uri())
    }

    async fn request_bodies(server: &MockServer) -> Vec<serde_json::Value> {
        server
            .received_requests()
            .await
            .unwrap_or_default()
            .iter()
            .map(|request| serde_json::from_slice(&request.body).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_report_once_posts_update_stats() {
        let server = status_api(200).await;

        let stats = Arc::new(RelayStats::new());
        stats.on_connect(UserType::Sender);
        stats.on_connect(UserType::Viewer);
        stats.on_frames_relayed(12);

        let reporter = StatsReporter::new(endpoint(&server), Duration::from_secs(5), stats).unwrap();
        reporter.report_once().await.unwrap();

        let bodies = request_bodies(&server).await;
        assert_eq!(bodies.len(), 1);
        let body = &bodies[0];
        assert_eq!(body["action"], "update_stats");
        assert_eq!(body["total_connections"], 2);
        assert_eq!(body["sender_count"], 1);
        assert_eq!(body["viewer_count"], 1);
        assert_eq!(body["frames_relayed"], 12);
    }

    #[tokio::test]
    async fn test_error_status_is_an_error() {
        let server = status_api(500).await;
        let reporter = StatsReporter::new(
            endpoint(&server),
            Duration::from_secs(5),
            Arc::new(RelayStats::new()),
        )
        .unwrap();

        assert!(reporter.report_once().await.is_err());
        assert_eq!(request_bodies(&server).await.len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_flushes_final_report() {
        let server = status_api(200).await;
        let stats = Arc::new(RelayStats::new());
        let reporter =
            StatsReporter::new(endpoint(&server), Duration::from_secs(3600), stats.clone()).unwrap();

        let cancel = CancellationToken::new();
        let handle = reporter.spawn(cancel.clone());

        // First tick fires immediately
        tokio::time::timeout(Duration::from_secs(3), async {
            while request_bodies(&server).await.is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        stats.on_frames_relayed(7);
        cancel.cancel();
        handle.await.unwrap();

        let bodies = request_bodies(&server).await;
        assert!(bodies.len() >= 2);
        assert!(bodies.iter().all(|body| body["action"] == "update_stats"));
        assert_eq!(bodies.last().unwrap()["frames_relayed"], 7);
    }
}
