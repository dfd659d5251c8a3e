//! WebSocket handler for voice sessions

use std::sync::Arc;

use axum::{
    Router,
    extract::{
        Query, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::ApiState;
use crate::protocol::{ClientMessage, ProtocolError, ServerMessage};
use crate::session::{Inbound, SessionCoordinator, SessionIdentity};

/// Queued outbound messages before the coordinator waits on the socket
const OUTBOUND_CAPACITY: usize = 256;
/// Parsed inbound frames waiting for the coordinator
const INBOUND_CAPACITY: usize = 64;

/// Query parameters for a voice connection
#[derive(Debug, Deserialize)]
struct VoiceQuery {
    user_id: Option<String>,
}

/// Build WebSocket router
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/voice", get(ws_upgrade))
        .with_state(state)
}

/// Handle WebSocket upgrade request
///
/// The session is registered before upgrading so a full server answers with
/// 503 instead of accepting and immediately closing.
async fn ws_upgrade(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<VoiceQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let identity = SessionIdentity {
        session_id: uuid::Uuid::new_v4().to_string(),
        user_id: query
            .user_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| "anonymous".to_string()),
    };

    let shutdown = match state.store.insert(&identity.session_id, &identity.user_id).await {
        Ok(token) => token,
        Err(e) => {
            tracing::warn!(user_id = %identity.user_id, error = %e, "rejecting voice session");
            return (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response();
        }
    };

    let store = state.store.clone();
    let failed_id = identity.session_id.clone();
    ws.on_failed_upgrade(move |error| {
        tracing::warn!(session_id = %failed_id, error = %error, "WebSocket upgrade failed");
        tokio::spawn(async move {
            store.remove(&failed_id).await;
        });
    })
    .on_upgrade(move |socket| handle_socket(socket, state, identity, shutdown))
}

/// Map one WebSocket frame to coordinator input
///
/// Returns `None` for control frames.
fn frame_to_inbound(msg: Message) -> Option<Inbound> {
    match msg {
        Message::Text(text) => Some(match ClientMessage::parse(text.as_str()) {
            Ok(message) => Inbound::Message(message),
            Err(e) => Inbound::Invalid(e),
        }),
        Message::Binary(_) => Some(Inbound::Invalid(ProtocolError::UnsupportedFrame("binary"))),
        Message::Ping(_) | Message::Pong(_) | Message::Close(_) => None,
    }
}

/// Handle WebSocket connection
async fn handle_socket(
    socket: WebSocket,
    state: Arc<ApiState>,
    identity: SessionIdentity,
    shutdown: CancellationToken,
) {
    let session_id = identity.session_id.clone();
    let (mut sender, mut receiver) = socket.split();

    let (out_tx, mut out_rx) = mpsc::channel::<ServerMessage>(OUTBOUND_CAPACITY);
    let (in_tx, in_rx) = mpsc::channel::<Inbound>(INBOUND_CAPACITY);

    // session_started is always the first message on the wire
    let started = ServerMessage::SessionStarted {
        session_id: session_id.clone(),
    };
    if out_tx.send(started).await.is_err() {
        state.store.remove(&session_id).await;
        return;
    }

    tracing::info!(session_id = %session_id, user_id = %identity.user_id, "voice session connected");

    // Forward coordinator output to the socket; a failed write ends the session
    let write_failed = shutdown.clone();
    let mut send_task = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            let text = match msg.to_json() {
                Ok(text) => text,
                Err(e) => {
                    tracing::warn!(kind = msg.kind(), error = %e, "failed to encode message");
                    continue;
                }
            };
            if sender.send(Message::Text(text.into())).await.is_err() {
                write_failed.cancel();
                break;
            }
        }
        let _ = sender.close().await;
    });

    // Parse client frames; dropping `in_tx` on exit ends the coordinator
    let store = state.store.clone();
    let recv_id = session_id.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            store.touch(&recv_id).await;
            match msg {
                Message::Close(_) => {
                    tracing::info!(session_id = %recv_id, "WebSocket closed by client");
                    break;
                }
                Message::Ping(data) => {
                    tracing::trace!(len = data.len(), "received ping");
                }
                other => {
                    if let Some(inbound) = frame_to_inbound(other)
                        && in_tx.send(inbound).await.is_err()
                    {
                        break;
                    }
                }
            }
        }
    });

    let coordinator =
        SessionCoordinator::new(identity, &state.settings, state.gateways.clone(), out_tx);
    let history = coordinator.run(in_rx, shutdown).await;

    // The coordinator held the last outbound sender, so the send task drains and closes
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => {
            let _ = send_task.await;
        }
    }

    let connected_for = state
        .store
        .remove(&session_id)
        .await
        .map(|info| (chrono::Utc::now() - info.connected_at).num_seconds());

    tracing::info!(
        session_id = %session_id,
        turns = history.len(),
        connected_secs = connected_for.unwrap_or_default(),
        "voice session ended"
    );
}
