use super::channel::{SignalingChannel, SignalingConnector};
use crate::error::{Error, Result};
use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connects to a signaling server over WebSocket
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    url: String,
}

impl WebSocketConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl SignalingConnector for WebSocketConnector {
    async fn connect(&self) -> Result<Arc<dyn SignalingChannel>> {
        let (stream, _response) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| Error::SignalingTransport(format!("connect {}: {e}", self.url)))?;
        info!(url = %self.url, "Signaling connected");

        let (sink, stream) = stream.split();
        Ok(Arc::new(WebSocketChannel {
            sink: Mutex::new(sink),
            stream: Mutex::new(stream),
        }))
    }
}

struct WebSocketChannel {
    sink: Mutex<SplitSink<WsStream, Message>>,
    stream: Mutex<SplitStream<WsStream>>,
}

#[async_trait]
impl SignalingChannel for WebSocketChannel {
    async fn send(&self, text: String) -> Result<()> {
        self.sink
            .lock()
            .await
            .send(Message::Text(text))
            .await
            .map_err(|e| match e {
                tokio_tungstenite::tungstenite::Error::ConnectionClosed
                | tokio_tungstenite::tungstenite::Error::AlreadyClosed => Error::SignalingClosed,
                other => Error::SignalingTransport(other.to_string()),
            })
    }

    async fn recv(&self) -> Option<String> {
        let mut stream = self.stream.lock().await;
        loop {
            match stream.next().await {
                Some(Ok(Message::Text(text))) => return Some(text),
                Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                    Ok(text) => return Some(text),
                    Err(_) => warn!("Dropping non UTF-8 binary signaling frame"),
                },
                Some(Ok(Message::Close(frame))) => {
                    debug!(?frame, "Signaling server closed the connection");
                    return None;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(error = %e, "Signaling connection error");
                    return None;
                }
                None => return None,
            }
        }
    }

    async fn close(&self) {
        let mut sink = self.sink.lock().await;
        if let Err(e) = sink.close().await {
            debug!(error = %e, "Closing signaling connection");
        }
    }
}
