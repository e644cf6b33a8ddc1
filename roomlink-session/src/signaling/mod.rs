//! Signaling protocol
//!
//! JSON text frames over one bidirectional connection per session:
//!
//! - request: `{"id": 7, "event": "consume", "data": {...}}`
//! - reply: `{"id": 7, "data": {...}}` or `{"id": 7, "error": "..."}`
//! - push: `{"event": "newConsumer", "data": {...}}`
//!
//! Payload field names are camelCase.

pub mod channel;
pub mod client;
pub mod websocket;

pub use channel::{memory_pair, MemoryChannel, SignalingChannel, SignalingConnector};
pub use client::SignalingClient;
pub use websocket::WebSocketConnector;

use crate::error::Result;
use crate::media::MediaKind;
use crate::transport::{ConsumerOptions, DtlsParameters, RtpParameters, TransportOptions};
use crate::types::{MeetingId, PeerId, ProducerId, TransportId, UserId};
use serde::de::{DeserializeOwned, IgnoredAny};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const JOIN_ROOM: &str = "join-room";
pub const RTP_CAPABILITIES: &str = "rtp-capabilities";
pub const CREATE_TRANSPORT: &str = "create-web-rtc-transport";
pub const CONNECT_TRANSPORT: &str = "connect-transport";
pub const PRODUCE: &str = "produce";
pub const CONSUME: &str = "consume";
pub const NEW_CONSUMER: &str = "newConsumer";
pub const PEER_DISCONNECTED: &str = "peer-disconnected";
pub const LEAVE_ROOM: &str = "leave-room";

/// A request with a typed reply
pub trait SignalingRequest: Serialize + Send + Sync {
    const EVENT: &'static str;
    type Response: DeserializeOwned + Send;
}

/// One frame on the wire
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Frame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Frame {
    pub fn request(id: u64, event: impl Into<String>, data: Value) -> Self {
        Self {
            id: Some(id),
            event: Some(event.into()),
            data: Some(data),
            error: None,
        }
    }

    #[must_use]
    pub fn reply(id: u64, data: Value) -> Self {
        Self {
            id: Some(id),
            data: Some(data),
            ..Self::default()
        }
    }

    pub fn error_reply(id: u64, message: impl Into<String>) -> Self {
        Self {
            id: Some(id),
            error: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn push(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: Some(event.into()),
            data: Some(data),
            ..Self::default()
        }
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRoomRequest {
    pub meeting_id: MeetingId,
    pub user_id: UserId,
    pub user_name: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRoomResponse {
    #[serde(default)]
    pub existing_producers: Vec<ExistingPeer>,
}

/// A participant already in the room at join time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExistingPeer {
    pub peer_id: PeerId,
    pub user_id: UserId,
    #[serde(default)]
    pub user_name: String,
    #[serde(default)]
    pub producers: Vec<ExistingProducer>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExistingProducer {
    pub id: ProducerId,
    pub kind: MediaKind,
}

impl SignalingRequest for JoinRoomRequest {
    const EVENT: &'static str = JOIN_ROOM;
    type Response = JoinRoomResponse;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportDirection {
    Send,
    Recv,
}

/// Outbound transports send `{}`; inbound ones `{"direction":"recv"}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CreateTransportRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direction: Option<TransportDirection>,
}

impl CreateTransportRequest {
    #[must_use]
    pub const fn send() -> Self {
        Self { direction: None }
    }

    #[must_use]
    pub const fn recv() -> Self {
        Self {
            direction: Some(TransportDirection::Recv),
        }
    }

    #[must_use]
    pub fn is_recv(&self) -> bool {
        self.direction == Some(TransportDirection::Recv)
    }
}

impl SignalingRequest for CreateTransportRequest {
    const EVENT: &'static str = CREATE_TRANSPORT;
    type Response = TransportOptions;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectTransportRequest {
    pub transport_id: TransportId,
    pub dtls_parameters: DtlsParameters,
}

impl SignalingRequest for ConnectTransportRequest {
    const EVENT: &'static str = CONNECT_TRANSPORT;
    type Response = IgnoredAny;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProduceRequest {
    pub transport_id: TransportId,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProduceResponse {
    pub id: ProducerId,
}

impl SignalingRequest for ProduceRequest {
    const EVENT: &'static str = PRODUCE;
    type Response = ProduceResponse;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumeRequest {
    pub transport_id: TransportId,
    pub producer_id: ProducerId,
    pub kind: MediaKind,
}

impl SignalingRequest for ConsumeRequest {
    const EVENT: &'static str = CONSUME;
    type Response = ConsumerOptions;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaveRoomRequest {
    pub meeting_id: MeetingId,
}

/// A remote producer became available. `id` carries the owning peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewConsumerNotification {
    pub producer_id: ProducerId,
    #[serde(rename = "id")]
    pub peer_id: PeerId,
    pub kind: MediaKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
}

/// Server pushes the orchestrator reacts to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    NewConsumer(NewConsumerNotification),
    PeerDisconnected(PeerId),
}

impl Notification {
    /// Parse a push frame. Unknown events yield `Ok(None)`.
    pub fn from_push(event: &str, data: Value) -> Result<Option<Self>> {
        match event {
            NEW_CONSUMER => Ok(Some(Self::NewConsumer(serde_json::from_value(data)?))),
            PEER_DISCONNECTED => Ok(Some(Self::PeerDisconnected(serde_json::from_value(data)?))),
            _ => Ok(None),
        }
    }
}
