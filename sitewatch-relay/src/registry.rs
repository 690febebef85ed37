//! Connection registry: who is connected, and as what
//!
//! All three indexes live behind a single lock so a fan-out never observes a
//! connection present in one index but missing from another. Stats gauges are
//! adjusted under the same write lock, keeping
//! `sender_count + viewer_count == len()` whenever the lock is free.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use sitewatch_core::models::{CameraId, ConnectionId, Role, UserType};

use crate::error::{RelayError, Result};
use crate::stats::RelayStats;

/// Encoded message queued for a connection's writer
pub type Outbound = Arc<str>;

/// One live relay session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    pub connection_id: ConnectionId,
    pub role: Role,
    pub user_type: UserType,
    pub camera_id: CameraId,
    pub connected_at: DateTime<Utc>,
}

impl Connection {
    #[must_use]
    pub fn new(role: Role, user_type: UserType, camera_id: CameraId) -> Self {
        Self {
            connection_id: ConnectionId::new(),
            role,
            user_type,
            camera_id,
            connected_at: Utc::now(),
        }
    }
}

/// Delivery endpoints the registry keeps for each connection
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    /// Bounded queue drained by the connection's writer task
    pub outbound: mpsc::Sender<Outbound>,
    /// Cancelled when the registry drops the connection
    pub cancel: CancellationToken,
}

/// A viewer queue snapshotted for fan-out
#[derive(Debug, Clone)]
pub struct DeliveryTarget {
    pub connection_id: ConnectionId,
    pub outbound: mpsc::Sender<Outbound>,
}

struct Entry {
    connection: Connection,
    handle: ConnectionHandle,
    last_activity_ms: AtomicU64,
}

#[derive(Default)]
struct Inner {
    connections: HashMap<ConnectionId, Entry>,
    senders: HashMap<CameraId, ConnectionId>,
    viewers: HashMap<CameraId, HashSet<ConnectionId>>,
}

pub struct ConnectionRegistry {
    inner: RwLock<Inner>,
    stats: Arc<RelayStats>,
    epoch: Instant,
    sender_reclaim_after: Duration,
}

impl ConnectionRegistry {
    #[must_use]
    pub fn new(stats: Arc<RelayStats>, sender_reclaim_after: Duration) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            stats,
            epoch: Instant::now(),
            sender_reclaim_after,
        }
    }

    /// Register a connection
    ///
    /// A second sender for a camera is rejected with `CameraAlreadyClaimed`
    /// unless the current sender has been silent for longer than the reclaim
    /// window, in which case it is evicted and the newcomer takes over.
    pub fn register(&self, connection: Connection, handle: ConnectionHandle) -> Result<ConnectionId> {
        let mut inner = self.inner.write();
        let connection_id = connection.connection_id.clone();

        if inner.connections.contains_key(&connection_id) {
            return Err(RelayError::DuplicateIdentity(connection_id.to_string()));
        }

        if connection.user_type.is_sender() {
            if let Some(existing) = inner.senders.get(&connection.camera_id).cloned() {
                let idle = inner
                    .connections
                    .get(&existing)
                    .map_or(Duration::MAX, |entry| self.idle_for(entry));
                if idle < self.sender_reclaim_after {
                    return Err(RelayError::CameraAlreadyClaimed(connection.camera_id.clone()));
                }
                info!(
                    camera_id = %connection.camera_id,
                    previous = %existing,
                    replacement = %connection_id,
                    idle_ms = u64::try_from(idle.as_millis()).unwrap_or(u64::MAX),
                    "Stale sender replaced by reconnecting sender"
                );
                self.remove_locked(&mut inner, &existing);
            }
            inner
                .senders
                .insert(connection.camera_id.clone(), connection_id.clone());
        } else {
            inner
                .viewers
                .entry(connection.camera_id.clone())
                .or_default()
                .insert(connection_id.clone());
        }

        self.stats.on_connect(connection.user_type);
        info!(
            connection_id = %connection_id,
            role = %connection.role,
            user_type = %connection.user_type,
            camera_id = %connection.camera_id,
            total_connections = inner.connections.len() + 1,
            "Connection registered"
        );

        inner.connections.insert(
            connection_id.clone(),
            Entry {
                connection,
                handle,
                last_activity_ms: AtomicU64::new(self.now_ms()),
            },
        );

        Ok(connection_id)
    }

    /// Unregister a connection
    ///
    /// Idempotent: returns the removed connection the first time and `None`
    /// afterwards. The connection's cancellation token fires on removal.
    pub fn unregister(&self, connection_id: &ConnectionId) -> Option<Connection> {
        let mut inner = self.inner.write();
        self.remove_locked(&mut inner, connection_id)
    }

    fn remove_locked(&self, inner: &mut Inner, connection_id: &ConnectionId) -> Option<Connection> {
        let entry = inner.connections.remove(connection_id)?;
        let camera_id = &entry.connection.camera_id;

        match entry.connection.user_type {
            UserType::Sender => {
                if inner.senders.get(camera_id) == Some(connection_id) {
                    inner.senders.remove(camera_id);
                }
            }
            UserType::Viewer => {
                if let Some(viewers) = inner.viewers.get_mut(camera_id) {
                    viewers.remove(connection_id);
                    if viewers.is_empty() {
                        inner.viewers.remove(camera_id);
                    }
                }
            }
        }

        entry.handle.cancel.cancel();
        self.stats.on_disconnect(entry.connection.user_type);

        info!(
            connection_id = %connection_id,
            user_type = %entry.connection.user_type,
            camera_id = %camera_id,
            duration_secs = (Utc::now() - entry.connection.connected_at).num_seconds(),
            "Connection unregistered"
        );

        Some(entry.connection)
    }

    /// Record inbound activity for a connection
    pub fn touch(&self, connection_id: &ConnectionId) {
        if let Some(entry) = self.inner.read().connections.get(connection_id) {
            entry.last_activity_ms.store(self.now_ms(), Ordering::Relaxed);
        }
    }

    /// All viewers currently subscribed to a camera
    #[must_use]
    pub fn lookup_viewers(&self, camera_id: &CameraId) -> HashSet<ConnectionId> {
        self.inner
            .read()
            .viewers
            .get(camera_id)
            .cloned()
            .unwrap_or_default()
    }

    /// The sender currently claiming a camera
    #[must_use]
    pub fn lookup_sender(&self, camera_id: &CameraId) -> Option<ConnectionId> {
        self.inner.read().senders.get(camera_id).cloned()
    }

    /// Snapshot the outbound queues of a camera's viewers
    #[must_use]
    pub fn viewer_targets(&self, camera_id: &CameraId) -> Vec<DeliveryTarget> {
        let inner = self.inner.read();
        inner
            .viewers
            .get(camera_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| inner.connections.get(id))
                    .map(Self::target)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Snapshot the outbound queues of every viewer
    #[must_use]
    pub fn all_viewer_targets(&self) -> Vec<DeliveryTarget> {
        self.inner
            .read()
            .connections
            .values()
            .filter(|entry| entry.connection.user_type == UserType::Viewer)
            .map(Self::target)
            .collect()
    }

    /// Outbound queue of a single connection
    #[must_use]
    pub fn outbound(&self, connection_id: &ConnectionId) -> Option<mpsc::Sender<Outbound>> {
        self.inner
            .read()
            .connections
            .get(connection_id)
            .map(|entry| entry.handle.outbound.clone())
    }

    #[must_use]
    pub fn contains(&self, connection_id: &ConnectionId) -> bool {
        self.inner.read().connections.contains_key(connection_id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().connections.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Registered connections split by user type: `(senders, viewers)`
    #[must_use]
    pub fn counts(&self) -> (usize, usize) {
        let inner = self.inner.read();
        let senders = inner
            .connections
            .values()
            .filter(|entry| entry.connection.user_type.is_sender())
            .count();
        (senders, inner.connections.len() - senders)
    }

    fn target(entry: &Entry) -> DeliveryTarget {
        DeliveryTarget {
            connection_id: entry.connection.connection_id.clone(),
            outbound: entry.handle.outbound.clone(),
        }
    }

    fn idle_for(&self, entry: &Entry) -> Duration {
        let last = entry.last_activity_ms.load(Ordering::Relaxed);
        Duration::from_millis(self.now_ms().saturating_sub(last))
    }

    fn now_ms(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_millis()).unwrap_or(u64::MAX)
    }
}

impl Drop for ConnectionRegistry {
    fn drop(&mut self) {
        let remaining = self.inner.get_mut().connections.len();
        if remaining > 0 {
            debug!(remaining, "Registry dropped with live connections");
        }
    }
}
