use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use futures::SinkExt;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::AppError;
use crate::state::AppState;

/// Engineer live session. The session only makes push delivery possible;
/// an engineer who never connects can still poll and accept.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(engineer_id): Path<Uuid>,
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, AppError> {
    let known = state
        .engineers
        .get(&engineer_id)
        .map(|e| !e.deleted)
        .unwrap_or(false);
    if !known {
        return Err(AppError::NotFound(format!(
            "engineer {engineer_id} not found"
        )));
    }

    Ok(ws.on_upgrade(move |socket| handle_socket(socket, state, engineer_id)))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, engineer_id: Uuid) {
    let (mut sender, mut receiver) = socket.split();

    let (tx, rx) = mpsc::unbounded_channel();
    state.sessions.connect(engineer_id, tx);
    state.metrics.live_sessions.inc();
    info!(engineer_id = %engineer_id, "engineer session connected");

    let mut events = UnboundedReceiverStream::new(rx);
    let send_task = tokio::spawn(async move {
        while let Some(event) = events.next().await {
            let json = match serde_json::to_string(&event) {
                Ok(json) => json,
                Err(err) => {
                    warn!(error = %err, "failed to serialize push event for ws");
                    continue;
                }
            };

            if sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    let recv_task = tokio::spawn(async move {
        while let Some(Ok(_msg)) = receiver.next().await {}
    });

    tokio::select! {
        _ = send_task => {},
        _ = recv_task => {},
    }

    state.sessions.disconnect(engineer_id);
    state.metrics.live_sessions.dec();
    info!(engineer_id = %engineer_id, "engineer session disconnected");
}
