//! Per-connection relay session
//!
//! A session owns one client connection from handshake to teardown:
//!
//! ```text
//! Connecting ──auth/claim fails──▶ Rejected
//!     │
//!     ▼
//!   Active ──peer close / error / watchdog / eviction / shutdown──▶ Closing ──▶ Terminal
//! ```
//!
//! The transport is abstracted behind [`FrameSource`] and [`FrameSink`] so the
//! same lifecycle drives axum WebSockets and in-memory test transports.

use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

use sitewatch_core::logging;
use sitewatch_core::models::UserType;

use crate::auth::HandshakeParams;
use crate::error::{RelayError, CLOSE_GOING_AWAY};
use crate::hub::RelayHub;
use crate::registry::{Connection, ConnectionHandle, Outbound};

/// How long teardown waits for the writer to flush the close frame
const WRITER_CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Largest close reason a control frame can carry (RFC 6455 §5.5)
pub const MAX_CLOSE_REASON_BYTES: usize = 123;

/// Transport-level message delivered by a [`FrameSource`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportMessage {
    Text(String),
    Binary(Vec<u8>),
    /// Protocol-level ping or pong; counts as liveness only
    Ping,
    Close,
}

/// Inbound half of a client transport
#[async_trait]
pub trait FrameSource: Send {
    /// Next message; `None` when the peer has gone away
    async fn next_message(&mut self) -> Option<Result<TransportMessage, String>>;
}

/// Outbound half of a client transport
#[async_trait]
pub trait FrameSink: Send + 'static {
    async fn send_text(&mut self, text: Outbound) -> Result<(), String>;

    async fn close(&mut self, code: u16, reason: &str) -> Result<(), String>;
}

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Active,
    Closing,
    Terminal,
}

/// Why a session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    /// Refused during the handshake; never registered
    Rejected(RelayError),
    PeerClosed,
    TransportError(String),
    LivenessTimeout,
    /// Removed from the registry by the relay (replaced sender or dead viewer)
    Evicted,
    Shutdown,
}

impl SessionOutcome {
    /// Close frame the relay sends for this outcome, if any
    #[must_use]
    pub fn close_frame(&self, user_type: UserType) -> Option<(u16, String)> {
        let (code, reason) = match self {
            Self::Rejected(error) => Some((error.close_code(), error.to_string())),
            Self::PeerClosed | Self::TransportError(_) => None,
            Self::LivenessTimeout => Some((
                RelayError::LivenessTimeout.close_code(),
                RelayError::LivenessTimeout.to_string(),
            )),
            Self::Evicted => Some((
                CLOSE_GOING_AWAY,
                match user_type {
                    UserType::Sender => "replaced by a newer sender",
                    UserType::Viewer => "dropped by relay",
                }
                .to_string(),
            )),
            Self::Shutdown => Some((CLOSE_GOING_AWAY, "server shutting down".to_string())),
        }?;
        Some((code, truncate_close_reason(reason)))
    }

    fn label(&self) -> &'static str {
        match self {
            Self::Rejected(_) => "rejected",
            Self::PeerClosed => "peer_closed",
            Self::TransportError(_) => "transport_error",
            Self::LivenessTimeout => "liveness_timeout",
            Self::Evicted => "evicted",
            Self::Shutdown => "shutdown",
        }
    }
}

/// Cut a close reason to fit a control frame, on a char boundary
fn truncate_close_reason(mut reason: String) -> String {
    if reason.len() > MAX_CLOSE_REASON_BYTES {
        let mut end = MAX_CLOSE_REASON_BYTES;
        while !reason.is_char_boundary(end) {
            end -= 1;
        }
        reason.truncate(end);
    }
    reason
}

type CloseSignal = Option<(u16, String)>;

/// One registered connection and its writer task
pub struct RelaySession {
    hub: RelayHub,
    connection: Connection,
    cancel: CancellationToken,
    close_tx: Option<oneshot::Sender<CloseSignal>>,
    writer: Option<JoinHandle<()>>,
    state: SessionState,
}

impl RelaySession {
    /// Validate the handshake, register the connection and start its writer
    ///
    /// On rejection the sink receives a policy-violation close frame and the
    /// connection is never registered or counted.
    pub async fn open<K: FrameSink>(
        hub: RelayHub,
        params: &HandshakeParams,
        mut sink: K,
    ) -> Result<Self, SessionOutcome> {
        if hub.is_shutting_down() {
            let outcome = SessionOutcome::Shutdown;
            if let Some((code, reason)) = outcome.close_frame(UserType::Viewer) {
                let _ = sink.close(code, &reason).await;
            }
            return Err(outcome);
        }

        let request = match params.authenticate(hub.validator()) {
            Ok(request) => request,
            Err(error) => {
                warn!(
                    role = params.role.as_deref().unwrap_or("-"),
                    user_type = params.user_type.as_deref().unwrap_or("-"),
                    camera_id = params.camera_id.as_deref().unwrap_or("-"),
                    reason = %error,
                    "Relay handshake rejected"
                );
                return Err(Self::reject(&mut sink, error).await);
            }
        };

        let settings = hub.settings();
        let capacity = match request.user_type {
            UserType::Sender => settings.sender_queue_capacity,
            UserType::Viewer => settings.viewer_queue_capacity,
        };
        let (tx, rx) = mpsc::channel::<Outbound>(capacity.max(1));
        let cancel = hub.shutdown_token().child_token();
        let connection = Connection::new(request.role, request.user_type, request.camera_id);

        if let Err(error) = hub.registry().register(
            connection.clone(),
            ConnectionHandle {
                outbound: tx,
                cancel: cancel.clone(),
            },
        ) {
            warn!(
                camera_id = %connection.camera_id,
                user_type = %connection.user_type,
                reason = %error,
                "Relay registration rejected"
            );
            return Err(Self::reject(&mut sink, error).await);
        }

        if connection.user_type == UserType::Viewer {
            hub.router().greet_viewer(&connection);
        }

        let (close_tx, close_rx) = oneshot::channel();
        let writer = tokio::spawn(write_loop(
            sink,
            rx,
            close_rx,
            connection.connection_id.to_string(),
        ));

        Ok(Self {
            hub,
            connection,
            cancel,
            close_tx: Some(close_tx),
            writer: Some(writer),
            state: SessionState::Active,
        })
    }

    async fn reject<K: FrameSink>(sink: &mut K, error: RelayError) -> SessionOutcome {
        let outcome = SessionOutcome::Rejected(error);
        if let Some((code, reason)) = outcome.close_frame(UserType::Viewer) {
            if let Err(e) = sink.close(code, &reason).await {
                debug!(error = %e, "Failed to send rejection close frame");
            }
        }
        outcome
    }

    #[must_use]
    pub const fn connection(&self) -> &Connection {
        &self.connection
    }

    #[must_use]
    pub const fn state(&self) -> SessionState {
        self.state
    }

    /// Pump inbound messages through the router until the session ends
    ///
    /// Every inbound message, including keep-alives and transport pings,
    /// pushes the liveness deadline forward.
    pub async fn pump<S: FrameSource>(&mut self, source: &mut S) -> SessionOutcome {
        let liveness = self.hub.settings().liveness_timeout;
        let deadline = tokio::time::sleep(liveness);
        tokio::pin!(deadline);

        let registry = self.hub.registry().clone();
        let router = self.hub.router().clone();
        let connection_id = self.connection.connection_id.clone();

        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => {
                    return if self.hub.is_shutting_down() {
                        SessionOutcome::Shutdown
                    } else {
                        SessionOutcome::Evicted
                    };
                }
                () = &mut deadline => {
                    return SessionOutcome::LivenessTimeout;
                }
                next = source.next_message() => {
                    let message = match next {
                        None | Some(Ok(TransportMessage::Close)) => return SessionOutcome::PeerClosed,
                        Some(Err(e)) => return SessionOutcome::TransportError(e),
                        Some(Ok(message)) => message,
                    };

                    deadline.as_mut().reset(Instant::now() + liveness);
                    registry.touch(&connection_id);

                    match message {
                        TransportMessage::Text(text) => {
                            router.route_text(&self.connection, &text);
                        }
                        TransportMessage::Binary(bytes) => {
                            router.route_binary(&self.connection, &bytes);
                        }
                        TransportMessage::Ping | TransportMessage::Close => {}
                    }
                }
            }
        }
    }

    /// Tear the session down
    ///
    /// Collapses repeated calls into one teardown: the connection is
    /// unregistered once, and the close frame is sent at most once.
    pub async fn close(&mut self, outcome: &SessionOutcome) {
        if matches!(self.state, SessionState::Closing | SessionState::Terminal) {
            return;
        }
        self.state = SessionState::Closing;

        let close_frame = outcome.close_frame(self.connection.user_type);
        if let Some(close_tx) = self.close_tx.take() {
            let _ = close_tx.send(close_frame);
        }

        self.hub.registry().unregister(&self.connection.connection_id);

        if let Some(mut writer) = self.writer.take() {
            if tokio::time::timeout(WRITER_CLOSE_TIMEOUT, &mut writer).await.is_err() {
                debug!(
                    connection_id = %self.connection.connection_id,
                    "Writer did not finish before close timeout"
                );
                writer.abort();
            }
        }

        info!(
            connection_id = %self.connection.connection_id,
            user_type = %self.connection.user_type,
            camera_id = %self.connection.camera_id,
            reason = outcome.label(),
            "Relay session closed"
        );
        self.state = SessionState::Terminal;
    }
}

impl Drop for RelaySession {
    fn drop(&mut self) {
        // A session dropped mid-flight still leaves the registry consistent
        if self.state != SessionState::Terminal {
            self.hub.registry().unregister(&self.connection.connection_id);
            if let Some(writer) = self.writer.take() {
                writer.abort();
            }
        }
    }
}

/// Drain the outbound queue into the sink until told to close
async fn write_loop<K: FrameSink>(
    mut sink: K,
    mut rx: mpsc::Receiver<Outbound>,
    mut close_rx: oneshot::Receiver<CloseSignal>,
    connection_id: String,
) {
    let close_frame = loop {
        tokio::select! {
            biased;
            signal = &mut close_rx => break signal.ok().flatten(),
            next = rx.recv() => match next {
                Some(text) => {
                    if let Err(e) = sink.send_text(text).await {
                        debug!(connection_id = %connection_id, error = %e, "Send failed, stopping writer");
                        return;
                    }
                }
                // Queue dropped by the registry; wait for the session's close decision
                None => break (&mut close_rx).await.ok().flatten(),
            },
        }
    };

    if let Some((code, reason)) = close_frame {
        if let Err(e) = sink.close(code, &reason).await {
            debug!(connection_id = %connection_id, error = %e, "Failed to send close frame");
        }
    }
}

/// Run a connection from handshake to teardown
pub async fn serve_connection<S, K>(
    hub: RelayHub,
    params: HandshakeParams,
    mut source: S,
    sink: K,
) -> SessionOutcome
where
    S: FrameSource,
    K: FrameSink,
{
    let mut session = match RelaySession::open(hub, &params, sink).await {
        Ok(session) => session,
        Err(outcome) => return outcome,
    };

    let connection = session.connection();
    let span = logging::connection_span(
        &connection.connection_id,
        connection.role,
        connection.user_type,
        &connection.camera_id,
    );

    async move {
        info!("Relay session active");
        let outcome = session.pump(&mut source).await;
        session.close(&outcome).await;
        outcome
    }
    .instrument(span)
    .await
}
