//! Rendezvous transport
//!
//! [`RendezvousConnector`] opens links; a [`RendezvousLink`] carries typed
//! messages in send order. The WebSocket implementation is the default.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

use playlink_core::{ClientMessage, ServerMessage, SessionError};

/// Timeout for establishing the WebSocket
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// An open rendezvous connection
#[async_trait]
pub trait RendezvousLink: Send {
    async fn send(&mut self, msg: &ClientMessage) -> Result<(), SessionError>;

    /// Next decoded message, or `None` once the link is closed
    ///
    /// Must be cancel safe: it is polled inside `select!`.
    async fn recv(&mut self) -> Option<ServerMessage>;

    async fn close(&mut self);
}

/// Opens rendezvous links
#[async_trait]
pub trait RendezvousConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn RendezvousLink>, SessionError>;
}

/// WebSocket connector
pub struct WsConnector {
    url: String,
    timeout: Duration,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            timeout: CONNECT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl RendezvousConnector for WsConnector {
    async fn connect(&self) -> Result<Box<dyn RendezvousLink>, SessionError> {
        let url = Url::parse(&self.url).map_err(|e| SessionError::Transport(e.to_string()))?;

        debug!("Connecting to rendezvous server: {}", url);

        match timeout(self.timeout, connect_async(url.as_str())).await {
            Ok(Ok((ws, _response))) => {
                info!("Connected to rendezvous server");
                Ok(Box::new(WsLink { ws }))
            }
            Ok(Err(e)) => Err(SessionError::Transport(e.to_string())),
            Err(_) => Err(SessionError::OperationTimeout {
                operation: "rendezvous-connect".into(),
                after: self.timeout,
            }),
        }
    }
}

/// WebSocket rendezvous link
pub struct WsLink {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl RendezvousLink for WsLink {
    async fn send(&mut self, msg: &ClientMessage) -> Result<(), SessionError> {
        let json = msg
            .to_json()
            .map_err(|e| SessionError::Transport(e.to_string()))?;

        self.ws
            .send(Message::Text(json))
            .await
            .map_err(|e| SessionError::Transport(e.to_string()))
    }

    async fn recv(&mut self) -> Option<ServerMessage> {
        loop {
            match self.ws.next().await? {
                Ok(Message::Text(text)) => match ServerMessage::from_json(&text) {
                    Ok(msg) => return Some(msg),
                    Err(e) => {
                        warn!("Discarding malformed server message: {}", e);
                    }
                },
                Ok(Message::Close(_)) => return None,
                // Ignore non-text messages (ping/pong/binary)
                Ok(_) => continue,
                Err(e) => {
                    debug!("WebSocket error: {}", e);
                    return None;
                }
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.ws.close(None).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_invalid_url_rejected() {
        let connector = WsConnector::new("not a url");
        let err = connector.connect().await.err().unwrap();
        assert!(matches!(err, SessionError::Transport(_)));
    }

    #[tokio::test]
    async fn test_refused_connection() {
        // Bind then drop to get a port with nothing listening
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let connector = WsConnector::new(format!("ws://{}", addr));
        assert!(connector.connect().await.is_err());
    }
}
