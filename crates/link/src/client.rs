//! WebSocket transport to the dispatcher.
//!
//! [`WsConnector`] dials the dispatcher endpoint with
//! `tokio-tungstenite`. Each protocol frame travels as one WebSocket
//! text message.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::endpoint::Endpoint;
use crate::transport::{ConnectError, Connector, LinkError, Transport};

/// Dials dispatcher endpoints over WebSocket.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn Transport>, ConnectError> {
        let (ws_stream, _response) = connect_async(endpoint.as_str())
            .await
            .map_err(classify_connect_error)?;

        tracing::debug!(endpoint = %endpoint, "WebSocket handshake complete");

        Ok(Box::new(WsTransport { ws_stream }))
    }
}

fn classify_connect_error(error: tungstenite::Error) -> ConnectError {
    match error {
        tungstenite::Error::Url(e) => ConnectError::AddressInvalid(e.to_string()),
        tungstenite::Error::Io(e) => ConnectError::Refused(e.to_string()),
        other => ConnectError::Refused(other.to_string()),
    }
}

/// A live WebSocket connection.
pub struct WsTransport {
    ws_stream: WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
}

#[async_trait]
impl Transport for WsTransport {
    async fn send(&mut self, frame: String) -> Result<(), LinkError> {
        self.ws_stream
            .send(Message::Text(frame))
            .await
            .map_err(|e| LinkError::Transport(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<String, LinkError>> {
        loop {
            match self.ws_stream.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text)),
                Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                    Ok(text) => return Some(Ok(text)),
                    Err(_) => tracing::warn!("Ignoring non-UTF-8 binary frame"),
                },
                Ok(Message::Ping(_) | Message::Pong(_)) => {
                    // Handled automatically by tungstenite.
                }
                Ok(Message::Close(frame)) => {
                    tracing::info!(?frame, "Dispatcher closed WebSocket");
                    return None;
                }
                Ok(Message::Frame(_)) => {}
                Err(e) => return Some(Err(LinkError::Transport(e.to_string()))),
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.ws_stream.close(None).await {
            tracing::debug!(error = %e, "WebSocket close failed");
        }
    }
}
