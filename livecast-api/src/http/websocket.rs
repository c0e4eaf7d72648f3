//! Signaling WebSocket
//!
//! Each connection is split: a writer task drains the connection's bounded
//! outbound queue into the socket while the reader loop feeds text frames to
//! a [`SignalingHandler`]. When the socket closes for any reason the handler
//! tears down the peer, exactly as an explicit `leave-room` would.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use livecast_core::logging::generate_connection_id;
use livecast_sfu::ChannelSink;
use std::sync::Arc;
use tracing::{debug, error, info};

use crate::handler::SignalingHandler;
use crate::http::AppState;

pub async fn websocket_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.max_message_size(state.max_message_size)
        .on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let connection_id = generate_connection_id();
    info!(connection_id = %connection_id, "WebSocket connection established");

    let (sink, mut rx) = ChannelSink::channel(state.peer_queue_capacity);
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let writer_connection_id = connection_id.clone();
    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if let Err(e) = ws_sender.send(Message::Text(frame.as_ref().into())).await {
                error!(connection_id = %writer_connection_id, error = %e, "Failed to send WebSocket message");
                break;
            }
        }
        let _ = ws_sender.close().await;
    });

    let mut handler = SignalingHandler::new(state.registry, Arc::new(sink), connection_id.clone());

    while let Some(message) = ws_receiver.next().await {
        match message {
            Ok(Message::Text(text)) => handler.handle_frame(text.as_str()).await,
            Ok(Message::Close(_)) => break,
            Ok(Message::Binary(_)) => {
                debug!(connection_id = %connection_id, "Ignoring binary frame");
            }
            Ok(_) => {}
            Err(e) => {
                debug!(connection_id = %connection_id, error = %e, "WebSocket receive error");
                break;
            }
        }
    }

    handler.disconnect().await;
    // The peer is gone, nothing queued can reach the client any more
    writer.abort();

    info!(connection_id = %connection_id, "WebSocket connection closed");
}
