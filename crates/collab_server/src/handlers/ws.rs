use crate::sync::ClientConnection;
use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use tracing::{debug, error, info, warn};

use super::AppState;

/// WebSocket upgrade handler
///
/// Authentication happens in-band: the client's first frame is an `Auth`
/// token frame naming the document.
pub async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Handle an established WebSocket connection
async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let mut connection = ClientConnection::new(state.sync_state.clone(), state.tokens.clone());
    debug!(connection = connection.id(), "websocket opened");

    loop {
        tokio::select! {
            msg = ws_rx.next() => {
                let data = match msg {
                    Some(Ok(Message::Binary(data))) => data,
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = ws_tx.send(Message::Pong(data)).await {
                            error!("Failed to send pong: {}", e);
                            break;
                        }
                        continue;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        debug!("Client requested close");
                        break;
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        warn!("WebSocket error: {}", e);
                        break;
                    }
                };

                let replies = match connection.handle_message(&data).await {
                    Ok(replies) => replies,
                    Err(e) => {
                        error!(connection = connection.id(), "closing connection: {}", e);
                        break;
                    }
                };
                let mut failed = false;
                for reply in replies {
                    if let Err(e) = ws_tx.send(Message::Binary(reply.into())).await {
                        error!("Failed to send response: {}", e);
                        failed = true;
                        break;
                    }
                }
                if failed || connection.is_closed() {
                    break;
                }
            }

            // Frames relayed from other connections of the room
            Some(frame) = connection.recv_broadcast() => {
                if let Err(e) = ws_tx.send(Message::Binary(frame.into())).await {
                    error!("Failed to send broadcast: {}", e);
                    break;
                }
            }
        }
    }

    let document = connection.document().map(str::to_string);
    info!(
        connection = connection.id(),
        user = connection.user_id().unwrap_or("-"),
        document = document.as_deref().unwrap_or("-"),
        "WebSocket disconnected"
    );
    let _ = ws_tx.close().await;

    // Dropping the connection clears its presence and unsubscribes
    drop(connection);
    if let Some(document) = document {
        state.sync_state.maybe_remove_room(&document).await;
    }
}
