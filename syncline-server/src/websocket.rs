use crate::{relay::RelayHandler, AppState};
use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use syncline_core::protocol::{ClientMessage, ServerMessage};
use uuid::Uuid;

const OUTGOING_BUFFER: usize = 100;

pub async fn handle_websocket(socket: WebSocket, state: Arc<AppState>) {
    let connection_id = Uuid::new_v4();
    tracing::info!("SERVER: connection {} opened", connection_id);

    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = tokio::sync::mpsc::channel::<ServerMessage>(OUTGOING_BUFFER);
    state.clients.insert(connection_id, tx.clone());

    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let json = match serde_json::to_string(&msg) {
                Ok(json) => json,
                Err(e) => {
                    tracing::error!("SERVER: failed to encode message for {}: {}", connection_id, e);
                    continue;
                }
            };
            if sender.send(Message::Text(json)).await.is_err() {
                tracing::warn!("SERVER: send to connection {} failed", connection_id);
                break;
            }
        }
    });

    let mut handler = RelayHandler::new(connection_id, tx, state.clone());

    while let Some(msg) = receiver.next().await {
        let text = match msg {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                tracing::warn!("SERVER: connection {} read error: {}", connection_id, e);
                break;
            }
        };

        match serde_json::from_str::<ClientMessage>(&text) {
            Ok(client_msg) => {
                if let Err(e) = handler.handle_message(client_msg).await {
                    tracing::error!("SERVER: connection {}: {}", connection_id, e);
                    break;
                }
            }
            Err(e) => {
                tracing::warn!("SERVER: malformed message from {}: {}", connection_id, e);
                if handler
                    .send_invalid(format!("malformed message: {}", e))
                    .await
                    .is_err()
                {
                    break;
                }
            }
        }
    }

    tracing::info!(
        "SERVER: connection {} closed ({} subscription(s) released)",
        connection_id,
        handler.channels().len()
    );
    handler.cleanup();
    drop(handler);
    writer.abort();
}
