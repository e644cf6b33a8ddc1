//! Remote peer registry
//!
//! One entry per remote participant: its receive transport, its consumers
//! and the compound stream assembled from their tracks. Only the orchestrator
//! mutates entries; statistics and UI projection read them.

use crate::media::{MediaKind, MediaStream};
use crate::transport::{Consumer, RecvTransport};
use crate::types::{PeerId, ProducerId, UserId};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard};
use tracing::debug;

/// Read-only projection of a remote participant
#[derive(Debug, Clone)]
pub struct PeerView {
    pub peer_id: PeerId,
    pub user_id: UserId,
    pub user_name: String,
    /// Compound stream; `None` until the first consumer exists
    pub stream: Option<MediaStream>,
    /// Audio plays through the gain graph, so the renderer must keep its own
    /// element silent
    pub mute_element: bool,
}

impl PeerView {
    #[must_use]
    pub fn kinds(&self) -> Vec<MediaKind> {
        self.stream
            .as_ref()
            .map(|s| s.tracks().iter().map(|t| t.kind()).collect())
            .unwrap_or_default()
    }
}

/// Serializable summary used for logs and the CLI
#[derive(Debug, Clone, Serialize)]
pub struct PeerSummary {
    pub peer_id: PeerId,
    pub user_name: String,
    pub kinds: Vec<MediaKind>,
}

impl From<&PeerView> for PeerSummary {
    fn from(view: &PeerView) -> Self {
        Self {
            peer_id: view.peer_id.clone(),
            user_name: view.user_name.clone(),
            kinds: view.kinds(),
        }
    }
}

struct RemotePeer {
    user_id: UserId,
    user_name: String,
    transport: Option<Arc<dyn RecvTransport>>,
    consumers: HashMap<MediaKind, Arc<dyn Consumer>>,
    producers: HashSet<ProducerId>,
    stream: Option<MediaStream>,
    audio_routed: bool,
}

/// Registry entry for one remote peer
pub struct PeerSlot {
    peer_id: PeerId,
    /// Serializes admission steps for this peer
    admission: AsyncMutex<()>,
    state: RwLock<RemotePeer>,
    removed: AtomicBool,
}

impl PeerSlot {
    fn new(peer_id: PeerId, user_id: UserId, user_name: String) -> Self {
        Self {
            peer_id,
            admission: AsyncMutex::new(()),
            state: RwLock::new(RemotePeer {
                user_id,
                user_name,
                transport: None,
                consumers: HashMap::new(),
                producers: HashSet::new(),
                stream: None,
                audio_routed: false,
            }),
            removed: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub const fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub async fn lock_admission(&self) -> AsyncMutexGuard<'_, ()> {
        self.admission.lock().await
    }

    /// Set once the peer left; late admission results must be discarded
    #[must_use]
    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn transport(&self) -> Option<Arc<dyn RecvTransport>> {
        self.state.read().transport.clone()
    }

    /// Install the receive transport. Returns `false` once the peer is gone.
    pub fn set_transport(&self, transport: Arc<dyn RecvTransport>) -> bool {
        let mut state = self.state.write();
        if self.is_removed() {
            return false;
        }
        state.transport = Some(transport);
        true
    }

    /// Fill in identity that arrived later than the peer itself
    pub fn update_identity(&self, user_id: Option<&UserId>, user_name: Option<&str>) {
        let mut state = self.state.write();
        if let Some(user_id) = user_id {
            state.user_id = user_id.clone();
        }
        if let Some(user_name) = user_name {
            if !user_name.is_empty() {
                state.user_name = user_name.to_string();
            }
        }
    }

    /// Whether a producer still needs a consumer.
    ///
    /// False when this producer, or another producer of the same kind, has
    /// already been consumed.
    #[must_use]
    pub fn needs_consumer(&self, producer_id: &ProducerId, kind: MediaKind) -> bool {
        let state = self.state.read();
        !state.producers.contains(producer_id) && !state.consumers.contains_key(&kind)
    }

    /// Register a consumer and append its track to the compound stream.
    ///
    /// Returns the updated stream, or `None` when the kind is already present
    /// or the peer is gone (the consumer is then left to the caller to close).
    pub fn add_consumer(&self, consumer: Arc<dyn Consumer>) -> Option<MediaStream> {
        let kind = consumer.kind();
        let mut guard = self.state.write();
        let state = &mut *guard;
        if self.is_removed() || state.consumers.contains_key(&kind) {
            return None;
        }

        let stream = state.stream.get_or_insert_with(MediaStream::new);
        if !stream.add_track(consumer.track()) {
            return None;
        }
        let snapshot = stream.clone();
        state.producers.insert(consumer.producer_id());
        state.consumers.insert(kind, consumer);
        Some(snapshot)
    }

    pub fn set_audio_routed(&self) {
        self.state.write().audio_routed = true;
    }

    #[must_use]
    pub fn stream(&self) -> Option<MediaStream> {
        self.state.read().stream.clone()
    }

    #[must_use]
    pub fn consumer_count(&self) -> usize {
        self.state.read().consumers.len()
    }

    #[must_use]
    pub fn view(&self) -> PeerView {
        let state = self.state.read();
        PeerView {
            peer_id: self.peer_id.clone(),
            user_id: state.user_id.clone(),
            user_name: state.user_name.clone(),
            stream: state.stream.clone(),
            mute_element: state.audio_routed,
        }
    }

    /// Stop the compound stream's tracks, close consumers and transport.
    ///
    /// Returns the compound stream that was released, if any.
    pub fn close(&self) -> Option<MediaStream> {
        let (stream, consumers, transport) = {
            let mut guard = self.state.write();
            self.removed.store(true, Ordering::Release);
            let state = &mut *guard;
            (
                state.stream.take(),
                std::mem::take(&mut state.consumers),
                state.transport.take(),
            )
        };

        if let Some(stream) = &stream {
            stream.stop_all();
        }
        for consumer in consumers.values() {
            consumer.close();
        }
        if let Some(transport) = transport {
            if !transport.is_closed() {
                transport.close();
            }
        }
        debug!(peer_id = %self.peer_id, "Peer resources released");
        stream
    }
}

/// All known remote peers
#[derive(Default)]
pub struct PeerRegistry {
    peers: DashMap<PeerId, Arc<PeerSlot>>,
}

impl PeerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Existing slot for `peer_id`, or a fresh one. The flag tells whether
    /// the slot was created by this call.
    pub fn get_or_insert(
        &self,
        peer_id: &PeerId,
        user_id: &UserId,
        user_name: &str,
    ) -> (Arc<PeerSlot>, bool) {
        match self.peers.entry(peer_id.clone()) {
            Entry::Occupied(entry) => (entry.get().clone(), false),
            Entry::Vacant(entry) => {
                debug!(peer_id = %peer_id, user_name, "Peer registered");
                let slot = Arc::new(PeerSlot::new(
                    peer_id.clone(),
                    user_id.clone(),
                    user_name.to_string(),
                ));
                entry.insert(slot.clone());
                (slot, true)
            }
        }
    }

    #[must_use]
    pub fn get(&self, peer_id: &PeerId) -> Option<Arc<PeerSlot>> {
        self.peers.get(peer_id).map(|entry| entry.clone())
    }

    #[must_use]
    pub fn contains(&self, peer_id: &PeerId) -> bool {
        self.peers.contains_key(peer_id)
    }

    /// Unregister a peer. The caller releases its resources via [`PeerSlot::close`].
    pub fn remove(&self, peer_id: &PeerId) -> Option<Arc<PeerSlot>> {
        self.peers.remove(peer_id).map(|(_, slot)| slot)
    }

    /// Unregister every peer
    pub fn drain(&self) -> Vec<Arc<PeerSlot>> {
        let ids: Vec<PeerId> = self.peers.iter().map(|entry| entry.key().clone()).collect();
        ids.iter().filter_map(|id| self.remove(id)).collect()
    }

    /// Receive transports for statistics polling
    #[must_use]
    pub fn transports(&self) -> Vec<(PeerId, Arc<dyn RecvTransport>)> {
        self.peers
            .iter()
            .filter_map(|entry| entry.value().transport().map(|t| (entry.key().clone(), t)))
            .collect()
    }

    /// Views ordered by peer id
    #[must_use]
    pub fn views(&self) -> Vec<PeerView> {
        let mut views: Vec<PeerView> = self.peers.iter().map(|entry| entry.value().view()).collect();
        views.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        views
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::{LoopbackConsumer, SyntheticTrack};

    fn consumer(producer: &str, kind: MediaKind) -> Arc<dyn Consumer> {
        let track = match kind {
            MediaKind::Video => SyntheticTrack::video("remote-cam", 640, 360),
            MediaKind::Audio => SyntheticTrack::audio("remote-mic"),
        };
        Arc::new(LoopbackConsumer::new(ProducerId::from(producer), track))
    }

    #[test]
    fn test_compound_stream_built_additively() {
        let registry = PeerRegistry::new();
        let (slot, created) = registry.get_or_insert(&PeerId::from("b"), &UserId::from("u2"), "Bob");
        assert!(created);
        let (_, created_again) = registry.get_or_insert(&PeerId::from("b"), &UserId::from("u2"), "Bob");
        assert!(!created_again);

        let first = slot.add_consumer(consumer("pv", MediaKind::Video)).unwrap();
        let second = slot.add_consumer(consumer("pa", MediaKind::Audio)).unwrap();

        assert_eq!(first.id(), second.id());
        assert_eq!(second.len(), 2);
        assert_eq!(registry.views()[0].kinds(), vec![MediaKind::Video, MediaKind::Audio]);
    }

    #[test]
    fn test_duplicate_kind_is_rejected() {
        let registry = PeerRegistry::new();
        let (slot, _) = registry.get_or_insert(&PeerId::from("b"), &UserId::from("u2"), "Bob");
        slot.add_consumer(consumer("pv", MediaKind::Video)).unwrap();

        assert!(!slot.needs_consumer(&ProducerId::from("pv"), MediaKind::Video));
        assert!(!slot.needs_consumer(&ProducerId::from("pv2"), MediaKind::Video));
        assert!(slot.needs_consumer(&ProducerId::from("pa"), MediaKind::Audio));
        assert!(slot.add_consumer(consumer("pv2", MediaKind::Video)).is_none());
        assert_eq!(slot.consumer_count(), 1);
    }

    #[test]
    fn test_close_stops_tracks_and_marks_removed() {
        let registry = PeerRegistry::new();
        let peer = PeerId::from("b");
        let (slot, _) = registry.get_or_insert(&peer, &UserId::from("u2"), "Bob");
        let stream = slot.add_consumer(consumer("pv", MediaKind::Video)).unwrap();

        let removed = registry.remove(&peer).unwrap();
        removed.close();

        assert!(removed.is_removed());
        assert!(!registry.contains(&peer));
        assert!(stream.tracks().iter().all(|t| !t.is_live()));
        // Late results are refused
        assert!(slot.add_consumer(consumer("pa", MediaKind::Audio)).is_none());
    }

    #[test]
    fn test_identity_update_keeps_existing_name_on_empty() {
        let registry = PeerRegistry::new();
        let (slot, _) = registry.get_or_insert(&PeerId::from("b"), &UserId::from("u2"), "Bob");
        slot.update_identity(None, Some(""));
        assert_eq!(slot.view().user_name, "Bob");
        slot.update_identity(Some(&UserId::from("u9")), Some("Robert"));
        let view = slot.view();
        assert_eq!(view.user_id.as_str(), "u9");
        assert_eq!(view.user_name, "Robert");
    }
}
