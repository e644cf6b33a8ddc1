use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;

/// Bidirectional text frame pipe
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    async fn send(&self, text: String) -> Result<()>;

    /// Next inbound frame; `None` once the connection is gone
    async fn recv(&self) -> Option<String>;

    async fn close(&self);
}

/// Opens one signaling connection per session
#[async_trait]
pub trait SignalingConnector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn SignalingChannel>>;
}

/// In-process channel end. Build connected ends with [`memory_pair`].
pub struct MemoryChannel {
    tx: Mutex<Option<mpsc::UnboundedSender<String>>>,
    rx: AsyncMutex<mpsc::UnboundedReceiver<String>>,
    closed: CancellationToken,
}

/// Two connected channel ends
#[must_use]
pub fn memory_pair() -> (MemoryChannel, MemoryChannel) {
    let (a_tx, b_rx) = mpsc::unbounded_channel();
    let (b_tx, a_rx) = mpsc::unbounded_channel();
    (MemoryChannel::new(a_tx, a_rx), MemoryChannel::new(b_tx, b_rx))
}

impl MemoryChannel {
    fn new(tx: mpsc::UnboundedSender<String>, rx: mpsc::UnboundedReceiver<String>) -> Self {
        Self {
            tx: Mutex::new(Some(tx)),
            rx: AsyncMutex::new(rx),
            closed: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

#[async_trait]
impl SignalingChannel for MemoryChannel {
    async fn send(&self, text: String) -> Result<()> {
        let guard = self.tx.lock();
        let tx = guard.as_ref().ok_or(Error::SignalingClosed)?;
        tx.send(text).map_err(|_| Error::SignalingClosed)
    }

    async fn recv(&self) -> Option<String> {
        let mut rx = self.rx.lock().await;
        tokio::select! {
            () = self.closed.cancelled() => None,
            frame = rx.recv() => frame,
        }
    }

    async fn close(&self) {
        self.tx.lock().take();
        self.closed.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_pair_delivers_both_ways() {
        let (a, b) = memory_pair();
        a.send("ping".to_string()).await.unwrap();
        b.send("pong".to_string()).await.unwrap();
        assert_eq!(b.recv().await.as_deref(), Some("ping"));
        assert_eq!(a.recv().await.as_deref(), Some("pong"));
    }

    #[tokio::test]
    async fn test_close_ends_both_sides() {
        let (a, b) = memory_pair();
        a.close().await;

        assert!(a.recv().await.is_none());
        assert!(b.recv().await.is_none());
        assert!(matches!(a.send("late".to_string()).await, Err(Error::SignalingClosed)));
    }
}
