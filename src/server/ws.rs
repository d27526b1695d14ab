//! Change-event WebSocket endpoint
//!
//! `GET /ws` upgrades the connection and registers it with the event
//! broadcaster. The server only pushes; inbound payloads are ignored. No
//! history is replayed on reconnect.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures::{SinkExt, StreamExt};

use super::AppState;

pub async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Pump broadcast messages to the socket until either side goes away
async fn handle_socket(socket: WebSocket, state: AppState) {
    let (id, mut outbound) = state.hub.register().await;
    let (mut sink, mut source) = socket.split();

    loop {
        tokio::select! {
            message = outbound.recv() => {
                let Some(text) = message else { break };
                if sink.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            incoming = source.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    // Clients do not acknowledge; drop anything they send
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    state.hub.unregister(&id).await;
}
