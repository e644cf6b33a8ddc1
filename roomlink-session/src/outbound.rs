//! The single send transport and its per-kind producers

use crate::error::{Error, Result};
use crate::media::{MediaKind, TrackHandle};
use crate::stats::StatsReport;
use crate::transport::{Producer, SendTransport};
use crate::types::{ProducerId, TransportId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

struct ProducerSlot {
    producer: Arc<dyn Producer>,
    track: TrackHandle,
}

/// Outbound side of the session.
///
/// Holds at most one producer per media kind. A producer is created once and
/// later device changes swap its track in place.
pub struct OutboundTransport {
    transport: Arc<dyn SendTransport>,
    producers: Mutex<HashMap<MediaKind, ProducerSlot>>,
}

impl OutboundTransport {
    pub fn new(transport: Arc<dyn SendTransport>) -> Self {
        Self {
            transport,
            producers: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn id(&self) -> TransportId {
        self.transport.id()
    }

    /// Create the producer for `track`'s kind.
    ///
    /// Fails with [`Error::InvalidState`] when that kind already has one.
    pub async fn produce(&self, track: TrackHandle) -> Result<ProducerId> {
        let kind = track.kind();
        if self.producers.lock().contains_key(&kind) {
            return Err(Error::InvalidState(format!("{kind} producer already exists")));
        }

        let producer = self.transport.produce(track.clone()).await?;

        let mut producers = self.producers.lock();
        if producers.contains_key(&kind) {
            drop(producers);
            producer.close();
            return Err(Error::InvalidState(format!("{kind} producer already exists")));
        }
        let id = producer.id();
        producers.insert(kind, ProducerSlot { producer, track });

        info!(
            transport_id = %self.transport.id(),
            producer_id = %id,
            kind = %kind,
            "Producer created"
        );
        Ok(id)
    }

    /// Swap the track on the existing producer of the same kind.
    ///
    /// Returns `false` when no producer of that kind exists or it already
    /// sends this track.
    pub async fn replace_track(&self, track: TrackHandle) -> Result<bool> {
        let kind = track.kind();
        let producer = {
            let producers = self.producers.lock();
            match producers.get(&kind) {
                Some(slot) if slot.track.id() == track.id() => return Ok(false),
                Some(slot) => slot.producer.clone(),
                None => return Ok(false),
            }
        };

        producer.replace_track(track.clone()).await?;

        if let Some(slot) = self.producers.lock().get_mut(&kind) {
            slot.track = track.clone();
        }
        debug!(
            producer_id = %producer.id(),
            kind = %kind,
            track_id = %track.id(),
            "Producer track replaced"
        );
        Ok(true)
    }

    #[must_use]
    pub fn producer(&self, kind: MediaKind) -> Option<Arc<dyn Producer>> {
        self.producers.lock().get(&kind).map(|slot| slot.producer.clone())
    }

    /// Track currently sent for `kind`
    #[must_use]
    pub fn track(&self, kind: MediaKind) -> Option<TrackHandle> {
        self.producers.lock().get(&kind).map(|slot| slot.track.clone())
    }

    #[must_use]
    pub fn producer_count(&self) -> usize {
        self.producers.lock().len()
    }

    pub async fn stats(&self) -> Result<Vec<StatsReport>> {
        self.transport.stats().await
    }

    /// Close every producer, then the transport. Idempotent.
    pub fn close(&self) {
        let producers: Vec<_> = self.producers.lock().drain().collect();
        for (kind, slot) in producers {
            if !slot.producer.is_closed() {
                slot.producer.close();
                debug!(producer_id = %slot.producer.id(), kind = %kind, "Producer closed");
            }
        }
        if !self.transport.is_closed() {
            self.transport.close();
            info!(transport_id = %self.transport.id(), "Send transport closed");
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.transport.is_closed()
    }
}
