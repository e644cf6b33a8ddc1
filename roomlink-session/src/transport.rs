//! SFU client seam: device, transports, producers and consumers
//!
//! Mirrors the shape of an SFU client library. The device is loaded once with
//! the router's RTP capabilities; transports are built from parameters the
//! signaling service hands out. The transport's `connect` and `produce` events
//! are delivered to a [`TransportHandler`], which proxies them to signaling and
//! only returns once the server has acknowledged.

use crate::error::Result;
use crate::media::{MediaKind, TrackHandle};
use crate::stats::StatsReport;
use crate::types::{ConsumerId, ProducerId, TransportId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// STUN/TURN server entry handed to every transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(urls: impl Into<String>) -> Self {
        Self {
            urls: urls.into(),
            username: None,
            credential: None,
        }
    }

    pub fn turn(
        urls: impl Into<String>,
        username: impl Into<String>,
        credential: impl Into<String>,
    ) -> Self {
        Self {
            urls: urls.into(),
            username: Some(username.into()),
            credential: Some(credential.into()),
        }
    }
}

/// Router capability set announced once by the server. Opaque to the session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RtpCapabilities(pub serde_json::Value);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RtpParameters(pub serde_json::Value);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DtlsParameters(pub serde_json::Value);

/// Server-side transport parameters returned by `create-web-rtc-transport`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportOptions {
    pub id: TransportId,
    pub ice_parameters: serde_json::Value,
    pub ice_candidates: serde_json::Value,
    pub dtls_parameters: DtlsParameters,
}

/// Consumer parameters returned by `consume`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerOptions {
    pub id: ConsumerId,
    pub producer_id: ProducerId,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
}

/// Receives the events a transport raises during negotiation
#[async_trait]
pub trait TransportHandler: Send + Sync {
    /// DTLS handshake parameters are ready; resolves once the server acknowledged
    async fn connect(&self, transport_id: &TransportId, dtls_parameters: DtlsParameters) -> Result<()>;

    /// A new outbound track needs a server-side producer id
    async fn produce(
        &self,
        transport_id: &TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<ProducerId>;
}

/// Factory for SFU client devices
pub trait SfuBackend: Send + Sync {
    fn new_device(&self) -> Arc<dyn SfuDevice>;
}

/// Local SFU client endpoint
pub trait SfuDevice: Send + Sync {
    /// Load the router capabilities. Only the first call has effect.
    fn load(&self, capabilities: &RtpCapabilities) -> Result<()>;

    fn is_loaded(&self) -> bool;

    fn create_send_transport(
        &self,
        options: TransportOptions,
        ice_servers: &[IceServer],
        handler: Arc<dyn TransportHandler>,
    ) -> Result<Arc<dyn SendTransport>>;

    fn create_recv_transport(
        &self,
        options: TransportOptions,
        ice_servers: &[IceServer],
        handler: Arc<dyn TransportHandler>,
    ) -> Result<Arc<dyn RecvTransport>>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SendTransport: Send + Sync {
    fn id(&self) -> TransportId;

    /// Start sending `track`. Drives the handler's `connect` on first use and
    /// its `produce` every time.
    async fn produce(&self, track: TrackHandle) -> Result<Arc<dyn Producer>>;

    async fn stats(&self) -> Result<Vec<StatsReport>>;

    fn close(&self);

    fn is_closed(&self) -> bool;
}

#[async_trait]
pub trait RecvTransport: Send + Sync {
    fn id(&self) -> TransportId;

    /// Start receiving a remote producer. Drives the handler's `connect` on first use.
    async fn consume(&self, options: ConsumerOptions) -> Result<Arc<dyn Consumer>>;

    async fn stats(&self) -> Result<Vec<StatsReport>>;

    fn close(&self);

    fn is_closed(&self) -> bool;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Producer: Send + Sync {
    fn id(&self) -> ProducerId;

    fn kind(&self) -> MediaKind;

    /// Swap the outgoing track without renegotiating
    async fn replace_track(&self, track: TrackHandle) -> Result<()>;

    fn close(&self);

    fn is_closed(&self) -> bool;
}

pub trait Consumer: Send + Sync {
    fn id(&self) -> ConsumerId;

    fn producer_id(&self) -> ProducerId;

    fn kind(&self) -> MediaKind;

    fn track(&self) -> TrackHandle;

    fn close(&self);
}
