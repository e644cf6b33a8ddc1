use super::{LoopbackAudio, LoopbackMediaDevices, LoopbackSfu};
use crate::error::Result;
use crate::media::MediaKind;
use crate::session::MediaBackends;
use crate::signaling::{
    memory_pair, Frame, MemoryChannel, SignalingChannel, SignalingConnector, CONNECT_TRANSPORT,
    CONSUME, CREATE_TRANSPORT, JOIN_ROOM, LEAVE_ROOM, NEW_CONSUMER, PEER_DISCONNECTED, PRODUCE,
    RTP_CAPABILITIES,
};
use crate::types::{MeetingId, PeerId, ProducerId, UserId};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Clone)]
struct Member {
    channel: Arc<MemoryChannel>,
    meeting_id: Option<MeetingId>,
    user_id: UserId,
    user_name: String,
    producers: Vec<(ProducerId, MediaKind)>,
    transports: HashSet<String>,
}

#[derive(Default)]
struct Behavior {
    failing: HashSet<String>,
    silent: HashSet<String>,
    duplicate_new_consumer: bool,
    withhold_capabilities: bool,
}

#[derive(Default)]
struct RoomState {
    members: Mutex<HashMap<PeerId, Member>>,
    behavior: Mutex<Behavior>,
    requests: Mutex<HashMap<String, usize>>,
    next_id: AtomicU64,
}

impl RoomState {
    fn next(&self, prefix: &str) -> String {
        format!("{prefix}-{}", self.next_id.fetch_add(1, Ordering::Relaxed) + 1)
    }
}

/// In-process signaling server.
///
/// Every [`connect`](SignalingConnector::connect) registers a new peer,
/// announces the router capabilities and then serves the request/response
/// protocol, broadcasting `newConsumer` and `peer-disconnected` to the other
/// members of the same meeting.
#[derive(Clone, Default)]
pub struct LoopbackRoom {
    state: Arc<RoomState>,
}

impl LoopbackRoom {
    pub fn new() -> Self {
        Self::default()
    }

    /// Backends for one more participant: standard devices, loopback audio and SFU
    pub fn backends(&self) -> MediaBackends {
        self.backends_with(Arc::new(LoopbackMediaDevices::standard()))
    }

    pub fn backends_with(&self, devices: Arc<LoopbackMediaDevices>) -> MediaBackends {
        MediaBackends {
            devices,
            audio: Arc::new(LoopbackAudio::new()),
            sfu: Arc::new(LoopbackSfu::new()),
            signaling: Arc::new(self.clone()),
        }
    }

    /// Reply to `event` with an error from now on
    pub fn fail_event(&self, event: &str) {
        self.state.behavior.lock().failing.insert(event.to_string());
    }

    /// Never reply to `event`
    pub fn ignore_event(&self, event: &str) {
        self.state.behavior.lock().silent.insert(event.to_string());
    }

    /// Deliver every `newConsumer` push twice
    pub fn duplicate_new_consumer(&self, enabled: bool) {
        self.state.behavior.lock().duplicate_new_consumer = enabled;
    }

    /// Skip the capability announcement on connect
    pub fn withhold_capabilities(&self, enabled: bool) {
        self.state.behavior.lock().withhold_capabilities = enabled;
    }

    /// Requests received so far for `event`
    pub fn request_count(&self, event: &str) -> usize {
        self.state.requests.lock().get(event).copied().unwrap_or(0)
    }

    /// Peers that joined `meeting_id`, ordered by peer id
    pub fn members(&self, meeting_id: &str) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self
            .state
            .members
            .lock()
            .iter()
            .filter(|(_, m)| m.meeting_id.as_ref().is_some_and(|id| id.as_str() == meeting_id))
            .map(|(peer_id, _)| peer_id.clone())
            .collect();
        peers.sort();
        peers
    }

    /// Drop a peer's connection as if the network failed
    pub async fn disconnect(&self, peer_id: &PeerId) {
        let channel = self
            .state
            .members
            .lock()
            .get(peer_id)
            .map(|m| m.channel.clone());
        if let Some(channel) = channel {
            channel.close().await;
        }
    }
}

#[async_trait]
impl SignalingConnector for LoopbackRoom {
    async fn connect(&self) -> Result<Arc<dyn SignalingChannel>> {
        let (client, server) = memory_pair();
        let server = Arc::new(server);
        let peer_id = PeerId::new(self.state.next("peer"));

        self.state.members.lock().insert(
            peer_id.clone(),
            Member {
                channel: server.clone(),
                meeting_id: None,
                user_id: UserId::new(peer_id.as_str()),
                user_name: String::new(),
                producers: Vec::new(),
                transports: HashSet::new(),
            },
        );

        let withhold = self.state.behavior.lock().withhold_capabilities;
        if !withhold {
            let caps = json!({"codecs": [{"mimeType": "video/VP8"}, {"mimeType": "audio/opus"}]});
            server.send(Frame::push(RTP_CAPABILITIES, caps).encode()?).await?;
        }

        debug!(peer_id = %peer_id, "Loopback peer connected");
        tokio::spawn(serve(self.state.clone(), peer_id, server));
        Ok(Arc::new(client))
    }
}

async fn serve(state: Arc<RoomState>, peer_id: PeerId, channel: Arc<MemoryChannel>) {
    while let Some(text) = channel.recv().await {
        let frame = match Frame::decode(&text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(peer_id = %peer_id, error = %e, "Loopback room got a malformed frame");
                continue;
            }
        };
        let Some(event) = frame.event else {
            continue;
        };
        *state.requests.lock().entry(event.clone()).or_default() += 1;
        let data = frame.data.unwrap_or(Value::Null);

        let Some(id) = frame.id else {
            if event == LEAVE_ROOM {
                depart(&state, &peer_id).await;
            }
            continue;
        };

        let (failing, silent) = {
            let behavior = state.behavior.lock();
            (behavior.failing.contains(&event), behavior.silent.contains(&event))
        };
        if silent {
            continue;
        }
        let reply = if failing {
            Frame::error_reply(id, format!("{event} rejected"))
        } else {
            match handle(&state, &peer_id, &event, data).await {
                Ok(data) => Frame::reply(id, data),
                Err(message) => Frame::error_reply(id, message),
            }
        };

        let Ok(text) = reply.encode() else {
            continue;
        };
        if channel.send(text).await.is_err() {
            break;
        }
    }

    depart(&state, &peer_id).await;
    state.members.lock().remove(&peer_id);
    debug!(peer_id = %peer_id, "Loopback peer connection ended");
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct JoinData {
    meeting_id: MeetingId,
    user_id: UserId,
    #[serde(default)]
    user_name: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TransportData {
    transport_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProduceData {
    transport_id: String,
    kind: MediaKind,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConsumeData {
    transport_id: String,
    producer_id: ProducerId,
    kind: MediaKind,
}

fn parse<T: for<'de> Deserialize<'de>>(event: &str, data: Value) -> std::result::Result<T, String> {
    serde_json::from_value(data).map_err(|e| format!("invalid {event} payload: {e}"))
}

async fn handle(
    state: &RoomState,
    peer_id: &PeerId,
    event: &str,
    data: Value,
) -> std::result::Result<Value, String> {
    match event {
        JOIN_ROOM => {
            let join: JoinData = parse(event, data)?;
            let mut members = state.members.lock();
            let existing: Vec<Value> = members
                .iter()
                .filter(|(id, m)| *id != peer_id && m.meeting_id.as_ref() == Some(&join.meeting_id))
                .map(|(id, m)| {
                    json!({
                        "peerId": id,
                        "userId": m.user_id,
                        "userName": m.user_name,
                        "producers": m.producers.iter()
                            .map(|(producer_id, kind)| json!({"id": producer_id, "kind": kind}))
                            .collect::<Vec<_>>(),
                    })
                })
                .collect();
            let member = members.get_mut(peer_id).ok_or("unknown peer")?;
            member.meeting_id = Some(join.meeting_id.clone());
            member.user_id = join.user_id;
            member.user_name = join.user_name;
            info!(peer_id = %peer_id, meeting_id = %join.meeting_id, "Loopback peer joined");
            Ok(json!({ "existingProducers": existing }))
        }
        CREATE_TRANSPORT => {
            let transport_id = state.next("transport");
            let mut members = state.members.lock();
            let member = members.get_mut(peer_id).ok_or("unknown peer")?;
            member.transports.insert(transport_id.clone());
            Ok(json!({
                "id": transport_id,
                "iceParameters": {"usernameFragment": peer_id, "password": "loopback"},
                "iceCandidates": [{"ip": "127.0.0.1", "port": 40000, "protocol": "udp"}],
                "dtlsParameters": {"role": "auto", "fingerprints": []},
            }))
        }
        CONNECT_TRANSPORT => {
            let request: TransportData = parse(event, data)?;
            owned_transport(state, peer_id, &request.transport_id)?;
            Ok(json!({}))
        }
        PRODUCE => {
            let request: ProduceData = parse(event, data)?;
            owned_transport(state, peer_id, &request.transport_id)?;
            let producer_id = ProducerId::new(state.next("producer"));

            let (push, recipients, repeat) = {
                let mut members = state.members.lock();
                let member = members.get_mut(peer_id).ok_or("unknown peer")?;
                member.producers.push((producer_id.clone(), request.kind));
                let push = json!({
                    "producerId": producer_id,
                    "id": peer_id,
                    "kind": request.kind,
                    "userId": member.user_id,
                    "userName": member.user_name,
                });
                let meeting = member.meeting_id.clone();
                let recipients = peers_in(&members, meeting.as_ref(), peer_id);
                let repeat = if state.behavior.lock().duplicate_new_consumer { 2 } else { 1 };
                (push, recipients, repeat)
            };

            for _ in 0..repeat {
                broadcast(&recipients, NEW_CONSUMER, &push).await;
            }
            Ok(json!({ "id": producer_id }))
        }
        CONSUME => {
            let request: ConsumeData = parse(event, data)?;
            owned_transport(state, peer_id, &request.transport_id)?;
            let exists = state.members.lock().values().any(|m| {
                m.producers
                    .iter()
                    .any(|(id, kind)| *id == request.producer_id && *kind == request.kind)
            });
            if !exists {
                return Err(format!("producer {} not found", request.producer_id));
            }
            Ok(json!({
                "id": state.next("consumer"),
                "producerId": request.producer_id,
                "kind": request.kind,
                "rtpParameters": {"codecs": [], "encodings": []},
            }))
        }
        other => Err(format!("unsupported event {other}")),
    }
}

fn owned_transport(state: &RoomState, peer_id: &PeerId, transport_id: &str) -> std::result::Result<(), String> {
    let members = state.members.lock();
    let owned = members
        .get(peer_id)
        .is_some_and(|m| m.transports.contains(transport_id));
    if owned {
        Ok(())
    } else {
        Err(format!("transport {transport_id} not found"))
    }
}

fn peers_in(
    members: &HashMap<PeerId, Member>,
    meeting_id: Option<&MeetingId>,
    except: &PeerId,
) -> Vec<Arc<MemoryChannel>> {
    let Some(meeting_id) = meeting_id else {
        return Vec::new();
    };
    members
        .iter()
        .filter(|(id, m)| *id != except && m.meeting_id.as_ref() == Some(meeting_id))
        .map(|(_, m)| m.channel.clone())
        .collect()
}

async fn broadcast(recipients: &[Arc<MemoryChannel>], event: &str, data: &Value) {
    let Ok(text) = Frame::push(event, data.clone()).encode() else {
        return;
    };
    for channel in recipients {
        // A recipient that already went away is not an error
        let _ = channel.send(text.clone()).await;
    }
}

/// Remove a peer from its meeting and tell the others
async fn depart(state: &RoomState, peer_id: &PeerId) {
    let recipients = {
        let mut members = state.members.lock();
        let Some(member) = members.get_mut(peer_id) else {
            return;
        };
        let Some(meeting_id) = member.meeting_id.take() else {
            return;
        };
        member.producers.clear();
        peers_in(&members, Some(&meeting_id), peer_id)
    };

    info!(peer_id = %peer_id, "Loopback peer left");
    broadcast(&recipients, PEER_DISCONNECTED, &json!(peer_id)).await;
}
