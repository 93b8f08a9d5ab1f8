use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{error::ProtocolError, Error as WsError, Message},
};
use tracing::{debug, trace, warn};
use url::Url;

use crate::error::RelayError;
use crate::protocol::{ClientFrame, ServerFrame};

/// One live link to the relay. The link is gone once `inbound` yields `None`.
#[derive(Debug)]
pub struct RelayConnection {
    pub outbound: mpsc::UnboundedSender<ClientFrame>,
    pub inbound: mpsc::UnboundedReceiver<ServerFrame>,
}

/// Opens fresh relay links for the reconnect supervisor.
#[async_trait]
pub trait RelayConnector: Send + Sync + 'static {
    async fn connect(&self) -> Result<RelayConnection, RelayError>;
}

/// JSON text frames over a WebSocket at `<base>/ws`.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    url: Url,
    connect_timeout: Duration,
}

pub fn derive_websocket_url(base: &str) -> Result<Url, RelayError> {
    let mut url = Url::parse(base)
        .map_err(|err| RelayError::Unavailable(format!("invalid relay url {base}: {err}")))?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(RelayError::Unavailable(format!(
                "unsupported relay url scheme {other}"
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| RelayError::Unavailable(format!("cannot use scheme {scheme}")))?;
    if !url.path().ends_with("/ws") {
        let path = format!("{}/ws", url.path().trim_end_matches('/'));
        url.set_path(&path);
    }
    Ok(url)
}

impl WebSocketConnector {
    pub fn new(base: &str, connect_timeout: Duration) -> Result<Self, RelayError> {
        Ok(Self {
            url: derive_websocket_url(base)?,
            connect_timeout,
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl RelayConnector for WebSocketConnector {
    async fn connect(&self) -> Result<RelayConnection, RelayError> {
        let (ws_stream, _) = tokio::time::timeout(self.connect_timeout, connect_async(self.url.as_str()))
            .await
            .map_err(|_| RelayError::Unavailable(format!("connect to {} timed out", self.url)))?
            .map_err(|err| RelayError::Unavailable(format!("websocket connect failed: {err}")))?;
        debug!(target = "callbridge::relay", url = %self.url, "relay websocket connected");

        let (mut ws_write, mut ws_read) = ws_stream.split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<ClientFrame>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<ServerFrame>();

        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                match serde_json::to_string(&frame) {
                    Ok(text) => {
                        if ws_write.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => warn!(target = "callbridge::relay", error = %err, "unserializable frame"),
                }
            }
            let _ = ws_write.close().await;
        });

        tokio::spawn(async move {
            while let Some(msg) = ws_read.next().await {
                let text = match msg {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Binary(data)) => match String::from_utf8(data) {
                        Ok(text) => text,
                        Err(_) => continue,
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(err) => {
                        match &err {
                            WsError::ConnectionClosed
                            | WsError::AlreadyClosed
                            | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                                debug!(target = "callbridge::relay", "relay websocket closed: {err}");
                            }
                            _ => warn!(target = "callbridge::relay", "relay websocket error: {err}"),
                        }
                        break;
                    }
                };
                trace!(target = "callbridge::relay", len = text.len(), "frame in");
                match serde_json::from_str::<ServerFrame>(&text) {
                    Ok(frame) => {
                        if inbound_tx.send(frame).is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        warn!(target = "callbridge::relay", error = %err, "ignoring malformed relay frame")
                    }
                }
            }
        });

        Ok(RelayConnection {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}
