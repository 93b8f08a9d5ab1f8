use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, error, warn};

use callbridge::protocol::{ClientFrame, ServerFrame};

use crate::handlers::AppState;

pub async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Bridges one WebSocket to a hub connection until either side goes away.
async fn handle_socket(socket: WebSocket, state: AppState) {
    let hub = state.hub;
    let (mut sender, mut receiver) = socket.split();

    let attachment = match hub.attach() {
        Ok(attachment) => attachment,
        Err(err) => {
            warn!("refusing relay connection: {}", err);
            let frame = ServerFrame::Error {
                message: err.to_string(),
            };
            if let Ok(json) = serde_json::to_string(&frame) {
                let _ = sender.send(Message::Text(json)).await;
            }
            let _ = sender.send(Message::Close(None)).await;
            return;
        }
    };
    let connection_id = attachment.connection_id;
    let mut frames = attachment.frames;

    // Frames routed by the hub go out as JSON text; the task ends when the
    // hub drops this connection.
    let writer = tokio::spawn(async move {
        while let Some(frame) = frames.recv().await {
            match serde_json::to_string(&frame) {
                Ok(json) => {
                    if sender.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
                Err(err) => error!("failed to encode frame: {}", err),
            }
        }
        let _ = sender.send(Message::Close(None)).await;
        debug!("writer finished for connection {}", connection_id);
    });

    debug!("relay connection {} opened", connection_id);

    while let Some(msg) = receiver.next().await {
        let text = match msg {
            Ok(Message::Text(text)) => text,
            Ok(Message::Binary(data)) => match String::from_utf8(data) {
                Ok(text) => text,
                Err(_) => continue,
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(err) => {
                debug!("websocket error on connection {}: {}", connection_id, err);
                break;
            }
        };

        match serde_json::from_str::<ClientFrame>(&text) {
            Ok(frame) => {
                if !hub.handle_frame(connection_id, frame) {
                    debug!("connection {} no longer known to the hub", connection_id);
                    break;
                }
            }
            Err(err) => {
                warn!("malformed frame on connection {}: {}", connection_id, err);
                hub.notify(
                    connection_id,
                    ServerFrame::Error {
                        message: format!("invalid frame: {err}"),
                    },
                );
            }
        }
    }

    hub.detach(connection_id);
    writer.abort();
    debug!("relay connection {} closed", connection_id);
}
