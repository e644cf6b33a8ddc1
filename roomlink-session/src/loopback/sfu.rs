use super::media::SyntheticTrack;
use crate::error::{Error, Result};
use crate::media::{MediaKind, TrackHandle};
use crate::stats::StatsReport;
use crate::transport::{
    Consumer, ConsumerOptions, DtlsParameters, IceServer, Producer, RecvTransport,
    RtpCapabilities, RtpParameters, SendTransport, SfuBackend, SfuDevice, TransportHandler,
    TransportOptions,
};
use crate::types::{generate_id, ConsumerId, ProducerId, TransportId};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use tracing::debug;

/// Bytes a flow advances per statistics read
const fn bytes_per_read(kind: MediaKind) -> u64 {
    match kind {
        MediaKind::Video => 62_500,
        MediaKind::Audio => 4_000,
    }
}

const PACKET_SIZE: u64 = 1_000;

/// Synthetic round trip reported by every transport, in seconds
const ROUND_TRIP_SECS: f64 = 0.012;

/// SFU client backend that negotiates through the handler but moves no media
#[derive(Default)]
pub struct LoopbackSfu {
    transports_created: Arc<AtomicUsize>,
    reject_replacement: Arc<AtomicBool>,
}

impl LoopbackSfu {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transports created across every device of this backend
    pub fn transports_created(&self) -> usize {
        self.transports_created.load(Ordering::SeqCst)
    }

    /// Make the next `replace_track` on any producer of this backend fail
    pub fn reject_next_replacement(&self) {
        self.reject_replacement.store(true, Ordering::SeqCst);
    }
}

impl SfuBackend for LoopbackSfu {
    fn new_device(&self) -> Arc<dyn SfuDevice> {
        Arc::new(LoopbackDevice {
            capabilities: Mutex::new(None),
            transports_created: self.transports_created.clone(),
            reject_replacement: self.reject_replacement.clone(),
        })
    }
}

struct LoopbackDevice {
    capabilities: Mutex<Option<RtpCapabilities>>,
    transports_created: Arc<AtomicUsize>,
    reject_replacement: Arc<AtomicBool>,
}

impl LoopbackDevice {
    fn check_options(&self, options: &TransportOptions) -> Result<()> {
        if !self.is_loaded() {
            return Err(Error::InvalidState("device not loaded".to_string()));
        }
        if options.dtls_parameters.0.is_null() {
            return Err(Error::Negotiation(format!(
                "transport {} has no DTLS parameters",
                options.id
            )));
        }
        self.transports_created.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl SfuDevice for LoopbackDevice {
    fn load(&self, capabilities: &RtpCapabilities) -> Result<()> {
        let mut loaded = self.capabilities.lock();
        if loaded.is_none() {
            *loaded = Some(capabilities.clone());
        }
        Ok(())
    }

    fn is_loaded(&self) -> bool {
        self.capabilities.lock().is_some()
    }

    fn create_send_transport(
        &self,
        options: TransportOptions,
        _ice_servers: &[IceServer],
        handler: Arc<dyn TransportHandler>,
    ) -> Result<Arc<dyn SendTransport>> {
        self.check_options(&options)?;
        Ok(Arc::new(LoopbackSendTransport {
            link: Link::new(options.id, handler),
            producers: Mutex::new(Vec::new()),
            reject_replacement: self.reject_replacement.clone(),
        }))
    }

    fn create_recv_transport(
        &self,
        options: TransportOptions,
        _ice_servers: &[IceServer],
        handler: Arc<dyn TransportHandler>,
    ) -> Result<Arc<dyn RecvTransport>> {
        self.check_options(&options)?;
        Ok(Arc::new(LoopbackRecvTransport {
            link: Link::new(options.id, handler),
            consumers: Mutex::new(Vec::new()),
        }))
    }
}

/// Connection state shared by both transport directions
struct Link {
    id: TransportId,
    handler: Arc<dyn TransportHandler>,
    connected: AsyncMutex<bool>,
    closed: AtomicBool,
}

impl Link {
    fn new(id: TransportId, handler: Arc<dyn TransportHandler>) -> Self {
        Self {
            id,
            handler,
            connected: AsyncMutex::new(false),
            closed: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(Error::InvalidState(format!("transport {} is closed", self.id)))
        } else {
            Ok(())
        }
    }

    /// Run the DTLS connect exchange once
    async fn connect(&self) -> Result<()> {
        let mut connected = self.connected.lock().await;
        if !*connected {
            let dtls = DtlsParameters(json!({"role": "client", "fingerprints": []}));
            self.handler.connect(&self.id, dtls).await?;
            *connected = true;
        }
        Ok(())
    }

    fn candidate_pair() -> StatsReport {
        StatsReport::CandidatePair {
            state: "succeeded".to_string(),
            nominated: true,
            current_round_trip_time: Some(ROUND_TRIP_SECS),
        }
    }
}

struct LoopbackSendTransport {
    link: Link,
    producers: Mutex<Vec<Arc<LoopbackProducer>>>,
    reject_replacement: Arc<AtomicBool>,
}

#[async_trait]
impl SendTransport for LoopbackSendTransport {
    fn id(&self) -> TransportId {
        self.link.id.clone()
    }

    async fn produce(&self, track: TrackHandle) -> Result<Arc<dyn Producer>> {
        self.link.ensure_open()?;
        self.link.connect().await?;

        let kind = track.kind();
        let rtp_parameters = RtpParameters(json!({
            "mid": kind.as_str(),
            "codecs": [],
            "encodings": [{"ssrc": 1000 + self.producers.lock().len()}],
        }));
        let id = self.link.handler.produce(&self.link.id, kind, rtp_parameters).await?;

        let mut producer = LoopbackProducer::new(id, track);
        producer.reject_replacement = self.reject_replacement.clone();
        let producer = Arc::new(producer);
        if self.link.closed.load(Ordering::SeqCst) {
            producer.close();
            return Err(Error::InvalidState(format!("transport {} is closed", self.link.id)));
        }
        self.producers.lock().push(producer.clone());
        debug!(transport_id = %self.link.id, producer_id = %producer.id, "Loopback producer created");
        Ok(producer)
    }

    async fn stats(&self) -> Result<Vec<StatsReport>> {
        self.link.ensure_open()?;
        let mut reports: Vec<StatsReport> = self
            .producers
            .lock()
            .iter()
            .filter(|p| !p.is_closed())
            .map(|p| {
                let bytes_sent = p.counter.advance(p.kind);
                StatsReport::OutboundRtp {
                    kind: p.kind,
                    bytes_sent,
                    packets_sent: bytes_sent / PACKET_SIZE,
                    packets_lost: 0,
                }
            })
            .collect();
        reports.push(Link::candidate_pair());
        Ok(reports)
    }

    fn close(&self) {
        if self.link.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for producer in self.producers.lock().iter() {
            producer.close();
        }
    }

    fn is_closed(&self) -> bool {
        self.link.closed.load(Ordering::SeqCst)
    }
}

struct LoopbackRecvTransport {
    link: Link,
    consumers: Mutex<Vec<Arc<LoopbackConsumer>>>,
}

#[async_trait]
impl RecvTransport for LoopbackRecvTransport {
    fn id(&self) -> TransportId {
        self.link.id.clone()
    }

    async fn consume(&self, options: ConsumerOptions) -> Result<Arc<dyn Consumer>> {
        self.link.ensure_open()?;
        self.link.connect().await?;
        self.link.ensure_open()?;

        let consumer = Arc::new(LoopbackConsumer {
            id: options.id,
            producer_id: options.producer_id,
            track: SyntheticTrack::detached(options.kind),
            counter: ByteCounter::default(),
            closed: AtomicBool::new(false),
        });
        self.consumers.lock().push(consumer.clone());
        Ok(consumer)
    }

    async fn stats(&self) -> Result<Vec<StatsReport>> {
        self.link.ensure_open()?;
        let mut reports: Vec<StatsReport> = self
            .consumers
            .lock()
            .iter()
            .filter(|c| !c.closed.load(Ordering::SeqCst))
            .map(|c| {
                let kind = c.track.kind();
                let bytes_received = c.counter.advance(kind);
                StatsReport::InboundRtp {
                    kind,
                    bytes_received,
                    packets_received: bytes_received / PACKET_SIZE,
                    packets_lost: 0,
                }
            })
            .collect();
        reports.push(Link::candidate_pair());
        Ok(reports)
    }

    fn close(&self) {
        if self.link.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for consumer in self.consumers.lock().iter() {
            consumer.close();
        }
    }

    fn is_closed(&self) -> bool {
        self.link.closed.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct ByteCounter(AtomicU64);

impl ByteCounter {
    /// Advance by one read's worth and return the new cumulative total
    fn advance(&self, kind: MediaKind) -> u64 {
        let step = bytes_per_read(kind);
        self.0.fetch_add(step, Ordering::SeqCst) + step
    }
}

/// Producer whose outgoing track can be inspected
pub struct LoopbackProducer {
    id: ProducerId,
    kind: MediaKind,
    track: Mutex<TrackHandle>,
    counter: ByteCounter,
    closed: AtomicBool,
    reject_replacement: Arc<AtomicBool>,
}

impl LoopbackProducer {
    pub fn new(id: ProducerId, track: TrackHandle) -> Self {
        Self {
            id,
            kind: track.kind(),
            track: Mutex::new(track),
            counter: ByteCounter::default(),
            closed: AtomicBool::new(false),
            reject_replacement: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn track(&self) -> TrackHandle {
        self.track.lock().clone()
    }
}

#[async_trait]
impl Producer for LoopbackProducer {
    fn id(&self) -> ProducerId {
        self.id.clone()
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    async fn replace_track(&self, track: TrackHandle) -> Result<()> {
        if self.is_closed() {
            return Err(Error::InvalidState(format!("producer {} is closed", self.id)));
        }
        if track.kind() != self.kind {
            return Err(Error::InvalidState(format!(
                "cannot send {} on {} producer {}",
                track.kind(),
                self.kind,
                self.id
            )));
        }
        if self.reject_replacement.swap(false, Ordering::SeqCst) {
            return Err(Error::Negotiation(format!(
                "producer {} rejected track {}",
                self.id,
                track.id()
            )));
        }
        *self.track.lock() = track;
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Consumer around a fixed remote track
pub struct LoopbackConsumer {
    id: ConsumerId,
    producer_id: ProducerId,
    track: TrackHandle,
    counter: ByteCounter,
    closed: AtomicBool,
}

impl LoopbackConsumer {
    pub fn new(producer_id: ProducerId, track: TrackHandle) -> Self {
        Self {
            id: ConsumerId::new(generate_id()),
            producer_id,
            track,
            counter: ByteCounter::default(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Consumer for LoopbackConsumer {
    fn id(&self) -> ConsumerId {
        self.id.clone()
    }

    fn producer_id(&self) -> ProducerId {
        self.producer_id.clone()
    }

    fn kind(&self) -> MediaKind {
        self.track.kind()
    }

    fn track(&self) -> TrackHandle {
        self.track.clone()
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.track.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct AcceptAll {
        connects: AtomicUsize,
    }

    #[async_trait]
    impl TransportHandler for AcceptAll {
        async fn connect(&self, _: &TransportId, _: DtlsParameters) -> Result<()> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn produce(&self, _: &TransportId, kind: MediaKind, _: RtpParameters) -> Result<ProducerId> {
            Ok(ProducerId::new(format!("p-{kind}")))
        }
    }

    fn options() -> TransportOptions {
        TransportOptions {
            id: TransportId::from("t1"),
            ice_parameters: json!({}),
            ice_candidates: json!([]),
            dtls_parameters: DtlsParameters(json!({"role": "auto"})),
        }
    }

    #[tokio::test]
    async fn test_send_transport_connects_once() {
        let device = LoopbackSfu::new().new_device();
        device.load(&RtpCapabilities(json!({}))).unwrap();
        let handler = Arc::new(AcceptAll {
            connects: AtomicUsize::new(0),
        });
        let transport = device
            .create_send_transport(options(), &[], handler.clone())
            .unwrap();

        let video = transport.produce(SyntheticTrack::video("c", 640, 360)).await.unwrap();
        transport.produce(SyntheticTrack::audio("m")).await.unwrap();
        assert_eq!(video.id().as_str(), "p-video");
        assert_eq!(handler.connects.load(Ordering::SeqCst), 1);

        let first = transport.stats().await.unwrap();
        let second = transport.stats().await.unwrap();
        assert_eq!(first.len(), 3);
        assert_ne!(first, second, "counters advance between reads");

        transport.close();
        assert!(video.is_closed());
    }

    #[tokio::test]
    async fn test_rejected_replacement_is_one_shot() {
        let sfu = LoopbackSfu::new();
        let device = sfu.new_device();
        device.load(&RtpCapabilities(json!({}))).unwrap();
        let handler = Arc::new(AcceptAll {
            connects: AtomicUsize::new(0),
        });
        let transport = device.create_send_transport(options(), &[], handler).unwrap();
        let producer = transport.produce(SyntheticTrack::video("c", 640, 360)).await.unwrap();

        sfu.reject_next_replacement();
        let rejected = producer.replace_track(SyntheticTrack::video("c", 1280, 720)).await;
        assert!(matches!(rejected, Err(Error::Negotiation(_))));

        producer
            .replace_track(SyntheticTrack::video("c", 1280, 720))
            .await
            .unwrap();
    }

    #[test]
    fn test_unloaded_device_rejects_transports() {
        let device = LoopbackSfu::new().new_device();
        let handler = Arc::new(AcceptAll {
            connects: AtomicUsize::new(0),
        });
        assert!(device.create_recv_transport(options(), &[], handler).is_err());
    }
}
