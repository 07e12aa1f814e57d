//! Transport underneath the realtime channel.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use super::RealtimeError;

/// What the transport reports upward.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Text(String),
    Closed { reason: Option<String> },
}

/// An open connection: text frames go out through `outbound`, events come in
/// through `inbound`. Dropping `outbound` closes the connection.
#[derive(Debug)]
pub struct RealtimeLink {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<LinkEvent>,
}

/// Opens links to a realtime endpoint.
#[async_trait]
pub trait RealtimeConnector: Send + Sync {
    /// Resolves once the transport is open.
    async fn connect(&self, url: &str) -> Result<RealtimeLink, RealtimeError>;
}

/// WebSocket connector backed by `tokio-tungstenite`.
///
/// The TCP connect and the upgrade handshake together must finish within
/// `connect_timeout`.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    connect_timeout: Duration,
}

impl WebSocketConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }
}

impl Default for WebSocketConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(15))
    }
}

#[async_trait]
impl RealtimeConnector for WebSocketConnector {
    async fn connect(&self, url: &str) -> Result<RealtimeLink, RealtimeError> {
        let (socket, _response) = tokio::time::timeout(self.connect_timeout, tokio_tungstenite::connect_async(url))
            .await
            .map_err(|_| RealtimeError::Connect(format!("handshake timed out after {:?}", self.connect_timeout)))?
            .map_err(|e| RealtimeError::Connect(e.to_string()))?;
        let (mut sink, mut stream) = socket.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let (in_tx, in_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if let Err(err) = sink.send(Message::Text(text)).await {
                    tracing::debug!("websocket write failed: {err}");
                    return;
                }
            }
            // Sender dropped: deliberate close.
            let _ = sink.close().await;
        });

        tokio::spawn(async move {
            let reason = loop {
                match stream.next().await {
                    Some(Ok(Message::Text(text))) => {
                        if in_tx.send(LinkEvent::Text(text)).is_err() {
                            return;
                        }
                    }
                    Some(Ok(Message::Close(frame))) => break frame.map(|f| f.reason.to_string()),
                    Some(Ok(_)) => {}
                    Some(Err(err)) => break Some(err.to_string()),
                    None => break None,
                }
            };
            let _ = in_tx.send(LinkEvent::Closed { reason });
        });

        Ok(RealtimeLink {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn silent_peer_times_out_instead_of_hanging() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        // Accept and hold the socket without ever answering the upgrade.
        let holder = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let connector = WebSocketConnector::new(Duration::from_millis(100));
        let outcome = tokio::time::timeout(Duration::from_secs(2), connector.connect(&format!("ws://{addr}/ws")))
            .await
            .expect("connect did not give up on a silent peer");

        match outcome {
            Err(RealtimeError::Connect(reason)) => assert!(reason.contains("timed out")),
            other => panic!("expected a connect timeout, got {other:?}"),
        }
        holder.abort();
    }

    #[test]
    fn default_timeout_is_bounded() {
        assert_eq!(WebSocketConnector::default().connect_timeout(), Duration::from_secs(15));
    }
}
