//! Relay WebSocket endpoint
//!
//! Camera clients connect with their handshake in the query string:
//! <ws://host:7777/?token={token}&role=supervisor&user_type=sender&camera_id={camera}>
//!
//! Validation happens after the upgrade so that rejections reach the client as
//! a close frame carrying the reason.

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tracing::debug;

use sitewatch_relay::{FrameSink, FrameSource, HandshakeParams, RelayHub, TransportMessage};

use crate::http::AppState;

pub fn create_relay_router() -> Router<AppState> {
    Router::new()
        .route("/", get(relay_handler))
        .route("/ws", get(relay_handler))
}

/// Upgrade to a relay session
pub async fn relay_handler(
    State(state): State<AppState>,
    Query(params): Query<HandshakeParams>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let max_message_size = state.hub.settings().max_message_size;
    ws.max_message_size(max_message_size)
        .on_upgrade(move |socket| handle_socket(socket, state.hub, params))
}

async fn handle_socket(socket: WebSocket, hub: RelayHub, params: HandshakeParams) {
    let (sender, receiver) = socket.split();
    let outcome = hub
        .serve(
            params,
            WebSocketSource { receiver },
            WebSocketSink { sender },
        )
        .await;
    debug!(?outcome, "WebSocket relay session finished");
}

/// Inbound half of an axum WebSocket
struct WebSocketSource {
    receiver: SplitStream<WebSocket>,
}

#[async_trait::async_trait]
impl FrameSource for WebSocketSource {
    async fn next_message(&mut self) -> Option<Result<TransportMessage, String>> {
        match self.receiver.next().await? {
            Ok(Message::Text(text)) => Some(Ok(TransportMessage::Text(text.as_str().to_owned()))),
            Ok(Message::Binary(bytes)) => Some(Ok(TransportMessage::Binary(bytes.to_vec()))),
            // Pings are answered by the transport itself
            Ok(Message::Ping(_) | Message::Pong(_)) => Some(Ok(TransportMessage::Ping)),
            Ok(Message::Close(_)) => Some(Ok(TransportMessage::Close)),
            Err(e) => Some(Err(format!("WebSocket error: {e}"))),
        }
    }
}

/// Outbound half of an axum WebSocket
struct WebSocketSink {
    sender: SplitSink<WebSocket, Message>,
}

#[async_trait::async_trait]
impl FrameSink for WebSocketSink {
    async fn send_text(&mut self, text: Arc<str>) -> Result<(), String> {
        self.sender
            .send(Message::Text(text.as_ref().into()))
            .await
            .map_err(|e| format!("WebSocket send error: {e}"))
    }

    async fn close(&mut self, code: u16, reason: &str) -> Result<(), String> {
        self.sender
            .send(Message::Close(Some(CloseFrame {
                code,
                reason: reason.into(),
            })))
            .await
            .map_err(|e| format!("WebSocket close error: {e}"))
    }
}
