//! Process-wide relay counters
//!
//! Counters are lock-free atomics updated from every session task. A separate
//! override layer holds counts pushed by another process (`update_stats`), so a
//! status API running apart from the relay can still report live numbers.
//!
//! Merged connection gauges only apply while this process has no connections
//! of its own, and merged `frames_relayed` never lowers the reported total.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use sitewatch_core::models::UserType;

/// Point-in-time view of relay activity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub uptime_ms: u64,
    /// Currently registered connections
    pub total_connections: usize,
    pub sender_count: usize,
    pub viewer_count: usize,
    /// Connections accepted since process start
    pub connections_accepted: u64,
    pub frames_received: u64,
    /// Successful per-viewer deliveries
    pub frames_relayed: u64,
    pub frames_dropped: u64,
    pub derived_fps: f64,
}

/// Externally observed counts; absent fields leave the current value alone
///
/// Also accepts the dashboard's legacy field names (`connections`, `senders`,
/// `viewers`, `frames_sent`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsUpdate {
    #[serde(default, alias = "connections", skip_serializing_if = "Option::is_none")]
    pub total_connections: Option<usize>,
    #[serde(default, alias = "senders", skip_serializing_if = "Option::is_none")]
    pub sender_count: Option<usize>,
    #[serde(default, alias = "viewers", skip_serializing_if = "Option::is_none")]
    pub viewer_count: Option<usize>,
    #[serde(default, alias = "frames_sent", skip_serializing_if = "Option::is_none")]
    pub frames_relayed: Option<u64>,
}

impl StatsUpdate {
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.total_connections.is_none()
            && self.sender_count.is_none()
            && self.viewer_count.is_none()
            && self.frames_relayed.is_none()
    }
}

/// Relay statistics aggregator
pub struct RelayStats {
    started_at: Instant,
    connections_accepted: AtomicU64,
    sender_count: AtomicUsize,
    viewer_count: AtomicUsize,
    frames_received: AtomicU64,
    frames_relayed: AtomicU64,
    frames_dropped: AtomicU64,
    overrides: RwLock<StatsUpdate>,
}

impl RelayStats {
    #[must_use]
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            connections_accepted: AtomicU64::new(0),
            sender_count: AtomicUsize::new(0),
            viewer_count: AtomicUsize::new(0),
            frames_received: AtomicU64::new(0),
            frames_relayed: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
            overrides: RwLock::new(StatsUpdate::default()),
        }
    }

    pub fn on_connect(&self, user_type: UserType) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
        self.count_for(user_type).fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_disconnect(&self, user_type: UserType) {
        // Saturating: a stray extra disconnect must never wrap the gauge
        let _ = self
            .count_for(user_type)
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub fn on_frame_received(&self) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_frames_relayed(&self, count: u64) {
        self.frames_relayed.fetch_add(count, Ordering::Relaxed);
    }

    pub fn on_frames_dropped(&self, count: u64) {
        self.frames_dropped.fetch_add(count, Ordering::Relaxed);
    }

    /// Merge externally observed counts
    ///
    /// Gauges overwrite the fields present; `frames_relayed` keeps the highest
    /// total reported so far.
    pub fn update_stats(&self, update: StatsUpdate) {
        let mut overrides = self.overrides.write();
        if update.total_connections.is_some() {
            overrides.total_connections = update.total_connections;
        }
        if update.sender_count.is_some() {
            overrides.sender_count = update.sender_count;
        }
        if update.viewer_count.is_some() {
            overrides.viewer_count = update.viewer_count;
        }
        if let Some(reported) = update.frames_relayed {
            let highest = overrides.frames_relayed.map_or(reported, |n| n.max(reported));
            overrides.frames_relayed = Some(highest);
        }
    }

    #[must_use]
    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        self.snapshot_at(self.uptime())
    }

    /// Counters measured only from this process, ignoring merged overrides
    #[must_use]
    pub fn local_snapshot(&self) -> StatsSnapshot {
        self.build_snapshot(self.uptime(), &StatsUpdate::default())
    }

    fn snapshot_at(&self, uptime: Duration) -> StatsSnapshot {
        let overrides = self.overrides.read().clone();
        self.build_snapshot(uptime, &overrides)
    }

    fn build_snapshot(&self, uptime: Duration, overrides: &StatsUpdate) -> StatsSnapshot {
        let local_senders = self.sender_count.load(Ordering::Relaxed);
        let local_viewers = self.viewer_count.load(Ordering::Relaxed);

        // Live local connections always win over reported gauges
        let (sender_count, viewer_count, total_connections) = if local_senders + local_viewers > 0 {
            (local_senders, local_viewers, local_senders + local_viewers)
        } else {
            let senders = overrides.sender_count.unwrap_or(0);
            let viewers = overrides.viewer_count.unwrap_or(0);
            (
                senders,
                viewers,
                overrides.total_connections.unwrap_or(senders + viewers),
            )
        };
        let frames_relayed = self
            .frames_relayed
            .load(Ordering::Relaxed)
            .max(overrides.frames_relayed.unwrap_or(0));

        let uptime_ms = u64::try_from(uptime.as_millis()).unwrap_or(u64::MAX);
        let derived_fps = if uptime_ms == 0 {
            0.0
        } else {
            frames_relayed as f64 / (uptime_ms as f64 / 1000.0)
        };

        StatsSnapshot {
            uptime_ms,
            total_connections,
            sender_count,
            viewer_count,
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            frames_relayed,
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            derived_fps,
        }
    }

    fn count_for(&self, user_type: UserType) -> &AtomicUsize {
        match user_type {
            UserType::Sender => &self.sender_count,
            UserType::Viewer => &self.viewer_count,
        }
    }
}

impl Default for RelayStats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_connect_disconnect_counts() {
        let stats = RelayStats::new();
        stats.on_connect(UserType::Sender);
        stats.on_connect(UserType::Viewer);
        stats.on_connect(UserType::Viewer);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.sender_count, 1);
        assert_eq!(snapshot.viewer_count, 2);
        assert_eq!(snapshot.total_connections, 3);
        assert_eq!(snapshot.connections_accepted, 3);

        stats.on_disconnect(UserType::Viewer);
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.viewer_count, 1);
        assert_eq!(snapshot.total_connections, 2);
        assert_eq!(snapshot.connections_accepted, 3);
    }

    #[test]
    fn test_disconnect_never_underflows() {
        let stats = RelayStats::new();
        stats.on_disconnect(UserType::Sender);
        assert_eq!(stats.snapshot().sender_count, 0);
    }

    #[test]
    fn test_fps_is_zero_at_startup() {
        let stats = RelayStats::new();
        stats.on_frames_relayed(10);
        let snapshot = stats.snapshot_at(Duration::ZERO);
        assert_eq!(snapshot.uptime_ms, 0);
        assert!(snapshot.derived_fps.abs() < f64::EPSILON);
    }

    #[test]
    fn test_fps_derivation() {
        let stats = RelayStats::new();
        stats.on_frames_relayed(30);
        let snapshot = stats.snapshot_at(Duration::from_secs(2));
        assert!((snapshot.derived_fps - 15.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_update_applies_to_idle_process() {
        let stats = RelayStats::new();
        stats.on_frames_relayed(1);

        stats.update_stats(StatsUpdate {
            sender_count: Some(4),
            ..Default::default()
        });
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.sender_count, 4);
        assert_eq!(snapshot.viewer_count, 0);
        assert_eq!(snapshot.total_connections, 4);
        assert_eq!(snapshot.frames_relayed, 1);

        stats.update_stats(StatsUpdate {
            frames_relayed: Some(900),
            ..Default::default()
        });
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.sender_count, 4);
        assert_eq!(snapshot.frames_relayed, 900);

        // Local counters are untouched by the merge
        let local = stats.local_snapshot();
        assert_eq!(local.sender_count, 0);
        assert_eq!(local.frames_relayed, 1);
    }

    #[test]
    fn test_merged_frames_never_lower_the_total() {
        let stats = RelayStats::new();
        stats.on_frames_relayed(100);
        let before = stats.snapshot().frames_relayed;

        stats.update_stats(StatsUpdate {
            frames_relayed: Some(5),
            ..Default::default()
        });
        assert_eq!(stats.snapshot().frames_relayed, before);

        stats.on_frames_relayed(50);
        assert_eq!(stats.snapshot().frames_relayed, 150);

        stats.update_stats(StatsUpdate {
            frames_relayed: Some(400),
            ..Default::default()
        });
        stats.update_stats(StatsUpdate {
            frames_relayed: Some(200),
            ..Default::default()
        });
        assert_eq!(stats.snapshot().frames_relayed, 400);
    }

    #[test]
    fn test_local_connections_override_reported_gauges() {
        let stats = RelayStats::new();
        stats.on_connect(UserType::Sender);
        stats.update_stats(StatsUpdate {
            total_connections: Some(9),
            sender_count: Some(0),
            viewer_count: Some(7),
            ..Default::default()
        });

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.sender_count, 1);
        assert_eq!(snapshot.viewer_count, 0);
        assert_eq!(snapshot.total_connections, 1);

        // Once the process is idle again the reported gauges apply
        stats.on_disconnect(UserType::Sender);
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.viewer_count, 7);
        assert_eq!(snapshot.total_connections, 9);
    }

    #[test]
    fn test_update_accepts_dashboard_field_names() {
        let update: StatsUpdate =
            serde_json::from_str(r#"{"connections":3,"senders":1,"viewers":2,"frames_sent":77}"#)
                .unwrap();
        assert_eq!(update.total_connections, Some(3));
        assert_eq!(update.sender_count, Some(1));
        assert_eq!(update.viewer_count, Some(2));
        assert_eq!(update.frames_relayed, Some(77));
        assert!(StatsUpdate::default().is_empty());
    }

    #[test]
    fn test_concurrent_updates() {
        let stats = Arc::new(RelayStats::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let stats = stats.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        stats.on_connect(UserType::Viewer);
                        stats.on_frames_relayed(1);
                        stats.on_disconnect(UserType::Viewer);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.viewer_count, 0);
        assert_eq!(snapshot.frames_relayed, 8000);
        assert_eq!(snapshot.connections_accepted, 8000);
    }
}
