use super::channel::{SignalingChannel, SignalingConnector};
use super::{Frame, Notification, SignalingRequest, RTP_CAPABILITIES};
use crate::error::{Error, Result};
use crate::transport::RtpCapabilities;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

type PendingMap = DashMap<u64, oneshot::Sender<Result<Value>>>;

/// Request/response correlation over a [`SignalingChannel`].
///
/// Every request carries a fresh id and is bounded by the configured timeout.
/// Pushes are split off: the capability announcement is latched once, the
/// rest go to the notification receiver returned from [`start`](Self::start).
pub struct SignalingClient {
    channel: Arc<dyn SignalingChannel>,
    next_id: AtomicU64,
    pending: Arc<PendingMap>,
    capabilities: watch::Receiver<Option<RtpCapabilities>>,
    timeout: Duration,
    closed: CancellationToken,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl SignalingClient {
    /// Open a connection and start reading from it
    pub async fn connect(
        connector: &dyn SignalingConnector,
        timeout: Duration,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<Notification>)> {
        let channel = connector.connect().await?;
        Ok(Self::start(channel, timeout))
    }

    /// Spawn the reader task for an already open channel
    pub fn start(
        channel: Arc<dyn SignalingChannel>,
        timeout: Duration,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Notification>) {
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        let (caps_tx, caps_rx) = watch::channel(None);
        let pending: Arc<PendingMap> = Arc::new(DashMap::new());
        let closed = CancellationToken::new();

        let reader = tokio::spawn(read_loop(
            channel.clone(),
            pending.clone(),
            caps_tx,
            notify_tx,
            closed.clone(),
        ));

        let client = Arc::new(Self {
            channel,
            next_id: AtomicU64::new(1),
            pending,
            capabilities: caps_rx,
            timeout,
            closed,
            reader: Mutex::new(Some(reader)),
        });
        (client, notify_rx)
    }

    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the connection is gone
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }

    /// Send a request and wait for its reply.
    ///
    /// No retry: a missing reply surfaces as [`Error::SignalingTimeout`].
    pub async fn request<R: SignalingRequest>(&self, request: &R) -> Result<R::Response> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let text = Frame::request(id, R::EVENT, serde_json::to_value(request)?).encode()?;

        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);
        if self.closed.is_cancelled() {
            self.pending.remove(&id);
            return Err(Error::SignalingClosed);
        }

        trace!(request_id = id, event = R::EVENT, "Signaling request");
        if let Err(e) = self.channel.send(text).await {
            self.pending.remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(Ok(value))) => Ok(serde_json::from_value(value)?),
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(_)) => Err(Error::SignalingClosed),
            Err(_) => {
                self.pending.remove(&id);
                warn!(
                    request_id = id,
                    event = R::EVENT,
                    timeout_ms = self.timeout_ms(),
                    "Signaling request timed out"
                );
                Err(Error::SignalingTimeout {
                    event: R::EVENT,
                    timeout_ms: self.timeout_ms(),
                })
            }
        }
    }

    /// Fire-and-forget event without a reply
    pub async fn emit<T: Serialize>(&self, event: &str, data: &T) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(Error::SignalingClosed);
        }
        let text = Frame::push(event, serde_json::to_value(data)?).encode()?;
        self.channel.send(text).await
    }

    /// The router capability announcement, waiting for it if needed
    pub async fn capabilities(&self) -> Result<RtpCapabilities> {
        let mut rx = self.capabilities.clone();
        let wait = async {
            loop {
                let current = rx.borrow_and_update().clone();
                if let Some(capabilities) = current {
                    return Ok(capabilities);
                }
                tokio::select! {
                    changed = rx.changed() => {
                        if changed.is_err() {
                            return Err(Error::SignalingClosed);
                        }
                    }
                    () = self.closed.cancelled() => return Err(Error::SignalingClosed),
                }
            }
        };

        tokio::time::timeout(self.timeout, wait)
            .await
            .map_err(|_| Error::SignalingTimeout {
                event: RTP_CAPABILITIES,
                timeout_ms: self.timeout_ms(),
            })?
    }

    /// Close the connection and fail every pending request
    pub async fn close(&self) {
        self.closed.cancel();
        self.channel.close().await;
        let reader = self.reader.lock().take();
        if let Some(reader) = reader {
            let _ = reader.await;
        }
        fail_pending(&self.pending);
    }

    fn timeout_ms(&self) -> u64 {
        u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX)
    }
}

fn fail_pending(pending: &PendingMap) {
    let ids: Vec<u64> = pending.iter().map(|entry| *entry.key()).collect();
    for id in ids {
        if let Some((_, tx)) = pending.remove(&id) {
            let _ = tx.send(Err(Error::SignalingClosed));
        }
    }
}

async fn read_loop(
    channel: Arc<dyn SignalingChannel>,
    pending: Arc<PendingMap>,
    capabilities: watch::Sender<Option<RtpCapabilities>>,
    notifications: mpsc::UnboundedSender<Notification>,
    closed: CancellationToken,
) {
    loop {
        let text = tokio::select! {
            () = closed.cancelled() => break,
            text = channel.recv() => match text {
                Some(text) => text,
                None => break,
            },
        };

        let frame = match Frame::decode(&text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "Dropping malformed signaling frame");
                continue;
            }
        };

        match (frame.id, frame.event) {
            (Some(id), None) => {
                let Some((_, tx)) = pending.remove(&id) else {
                    debug!(request_id = id, "Reply for unknown or expired request");
                    continue;
                };
                let outcome = match frame.error {
                    Some(message) => Err(Error::Negotiation(message)),
                    None => Ok(frame.data.unwrap_or(Value::Null)),
                };
                let _ = tx.send(outcome);
            }
            (None, Some(event)) => {
                let data = frame.data.unwrap_or(Value::Null);
                if event == RTP_CAPABILITIES {
                    if capabilities.borrow().is_some() {
                        warn!("Ignoring repeated rtp-capabilities announcement");
                    } else {
                        debug!("Router capabilities received");
                        capabilities.send_replace(Some(RtpCapabilities(data)));
                    }
                    continue;
                }
                match Notification::from_push(&event, data) {
                    Ok(Some(notification)) => {
                        if notifications.send(notification).is_err() {
                            debug!(event = %event, "Notification receiver dropped");
                        }
                    }
                    Ok(None) => debug!(event = %event, "Ignoring unknown push"),
                    Err(e) => warn!(event = %event, error = %e, "Malformed push payload"),
                }
            }
            _ => warn!("Dropping signaling frame that is neither reply nor push"),
        }
    }

    closed.cancel();
    fail_pending(&pending);
    debug!("Signaling reader stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::channel::{memory_pair, MemoryChannel};
    use crate::signaling::{CreateTransportRequest, NEW_CONSUMER};
    use serde_json::json;

    fn client(timeout_ms: u64) -> (Arc<SignalingClient>, mpsc::UnboundedReceiver<Notification>, MemoryChannel) {
        let (local, server) = memory_pair();
        let (client, notifications) =
            SignalingClient::start(Arc::new(local), Duration::from_millis(timeout_ms));
        (client, notifications, server)
    }

    #[tokio::test]
    async fn test_request_is_correlated_by_id() {
        let (client, _notifications, server) = client(1_000);

        let responder = tokio::spawn(async move {
            let frame = Frame::decode(&server.recv().await.unwrap()).unwrap();
            assert_eq!(frame.event.as_deref(), Some("create-web-rtc-transport"));
            assert_eq!(frame.data, Some(json!({"direction": "recv"})));
            let reply = Frame::reply(
                frame.id.unwrap(),
                json!({"id": "t9", "iceParameters": {}, "iceCandidates": [], "dtlsParameters": {}}),
            );
            server.send(reply.encode().unwrap()).await.unwrap();
            server
        });

        let options = client.request(&CreateTransportRequest::recv()).await.unwrap();
        assert_eq!(options.id.as_str(), "t9");
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_error_reply_is_negotiation_failure() {
        let (client, _notifications, server) = client(1_000);
        tokio::spawn(async move {
            let frame = Frame::decode(&server.recv().await.unwrap()).unwrap();
            let reply = Frame::error_reply(frame.id.unwrap(), "router busy");
            server.send(reply.encode().unwrap()).await.unwrap();
            server
        });

        let result = client.request(&CreateTransportRequest::send()).await;
        assert!(matches!(result, Err(Error::Negotiation(message)) if message == "router busy"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_server_times_out() {
        let (client, _notifications, _server) = client(10_000);

        let result = client.request(&CreateTransportRequest::send()).await;
        assert!(matches!(
            result,
            Err(Error::SignalingTimeout {
                event: "create-web-rtc-transport",
                timeout_ms: 10_000
            })
        ));
        assert!(client.pending.is_empty());
    }

    #[tokio::test]
    async fn test_close_fails_pending_requests() {
        let (client, _notifications, server) = client(5_000);
        let pending = {
            let client = client.clone();
            tokio::spawn(async move { client.request(&CreateTransportRequest::send()).await })
        };
        // Wait until the request reached the server
        server.recv().await.unwrap();
        server.close().await;

        assert!(matches!(pending.await.unwrap(), Err(Error::SignalingClosed)));
        client.closed().await;
        assert!(client.is_closed());
    }

    #[tokio::test]
    async fn test_capabilities_latched_once_and_pushes_forwarded() {
        let (client, mut notifications, server) = client(1_000);
        for caps in [json!({"codecs": ["vp8"]}), json!({"codecs": ["h264"]})] {
            server
                .send(Frame::push(RTP_CAPABILITIES, caps).encode().unwrap())
                .await
                .unwrap();
        }
        server
            .send(
                Frame::push(
                    NEW_CONSUMER,
                    json!({"producerId": "p1", "id": "peer-b", "kind": "video"}),
                )
                .encode()
                .unwrap(),
            )
            .await
            .unwrap();

        let notification = notifications.recv().await.unwrap();
        assert!(matches!(notification, Notification::NewConsumer(_)));

        let capabilities = client.capabilities().await.unwrap();
        assert_eq!(capabilities.0, json!({"codecs": ["vp8"]}));
    }
}
