//! Meeting session orchestration
//!
//! [`Session`] is the single owner of everything one meeting participation
//! needs: the signaling connection, the SFU device, the outbound transport with
//! its producers, the remote peer registry, local capture and both audio
//! graphs.
//!
//! Join runs two branches concurrently: the `join-room` round-trip (followed
//! by admission of the peers it lists) and the capability wait that loads the
//! device, captures local media and starts producing. Admission waits until the
//! device is loaded, so either branch may win the race.
//!
//! Every joined call carries a cancellation token. Leave cancels it first;
//! anything created by a round-trip that completes afterwards is closed and
//! never registered.

use crate::audio::{AudioBackend, AudioGraphController, GainSetting};
use crate::capture::{CaptureManager, DeviceSelection, ResolutionTier, VideoCheckpoint};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::events::SessionEvent;
use crate::media::{DeviceInventory, MediaDevices, MediaKind, MediaStream, TrackHandle};
use crate::outbound::OutboundTransport;
use crate::peer::{PeerRegistry, PeerView};
use crate::signaling::{
    ConnectTransportRequest, ConsumeRequest, CreateTransportRequest, ExistingPeer,
    JoinRoomRequest, LeaveRoomRequest, NewConsumerNotification, Notification, ProduceRequest,
    SignalingClient, SignalingConnector, LEAVE_ROOM,
};
use crate::stats::{StatsAggregator, TelemetrySnapshot};
use crate::transport::{
    DtlsParameters, RtpParameters, SfuBackend, SfuDevice, TransportHandler,
};
use crate::types::{LocalUser, MeetingId, PeerId, ProducerId, TransportId, UserId};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, OnceLock};
use std::time::Instant;
use tokio::sync::{broadcast, mpsc, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const EVENT_CAPACITY: usize = 64;

/// User-facing connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Idle,
    Joining,
    Joined,
    Leaving,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Joining => "joining",
            Self::Joined => "joined",
            Self::Leaving => "leaving",
        };
        f.write_str(s)
    }
}

/// Negotiation progress of the current call
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    NoSocket,
    AwaitingCapabilities,
    DeviceReady,
    Producing,
    Terminated,
}

impl SessionPhase {
    /// Device loaded and not yet torn down
    #[must_use]
    pub const fn device_ready(&self) -> bool {
        matches!(self, Self::DeviceReady | Self::Producing)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SessionStatus {
    pub state: ConnectionState,
    pub phase: SessionPhase,
}

/// Platform implementations the session drives
#[derive(Clone)]
pub struct MediaBackends {
    pub devices: Arc<dyn MediaDevices>,
    pub audio: Arc<dyn AudioBackend>,
    pub sfu: Arc<dyn SfuBackend>,
    pub signaling: Arc<dyn SignalingConnector>,
}

/// One remote producer waiting to be consumed
#[derive(Debug, Clone)]
struct ProducerOffer {
    peer_id: PeerId,
    user_id: Option<UserId>,
    user_name: Option<String>,
    producer_id: ProducerId,
    kind: MediaKind,
}

impl From<NewConsumerNotification> for ProducerOffer {
    fn from(n: NewConsumerNotification) -> Self {
        Self {
            peer_id: n.peer_id,
            user_id: n.user_id,
            user_name: n.user_name,
            producer_id: n.producer_id,
            kind: n.kind,
        }
    }
}

fn existing_offers(peers: Vec<ExistingPeer>) -> Vec<ProducerOffer> {
    peers
        .into_iter()
        .flat_map(
            |ExistingPeer {
                 peer_id,
                 user_id,
                 user_name,
                 producers,
             }| {
                producers.into_iter().map(move |producer| ProducerOffer {
                    peer_id: peer_id.clone(),
                    user_id: Some(user_id.clone()),
                    user_name: Some(user_name.clone()),
                    producer_id: producer.id,
                    kind: producer.kind,
                })
            },
        )
        .collect()
}

/// Proxies transport negotiation events to signaling
struct SignalingHandler {
    signaling: Arc<SignalingClient>,
}

#[async_trait]
impl TransportHandler for SignalingHandler {
    async fn connect(&self, transport_id: &TransportId, dtls_parameters: DtlsParameters) -> Result<()> {
        self.signaling
            .request(&ConnectTransportRequest {
                transport_id: transport_id.clone(),
                dtls_parameters,
            })
            .await?;
        debug!(transport_id = %transport_id, "Transport connected");
        Ok(())
    }

    async fn produce(
        &self,
        transport_id: &TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<ProducerId> {
        let response = self
            .signaling
            .request(&ProduceRequest {
                transport_id: transport_id.clone(),
                kind,
                rtp_parameters,
            })
            .await?;
        Ok(response.id)
    }
}

/// State that only exists between join and leave
struct ActiveCall {
    meeting_id: MeetingId,
    local_user: LocalUser,
    device: Arc<dyn SfuDevice>,
    signaling: OnceLock<Arc<SignalingClient>>,
    outbound: Mutex<Option<Arc<OutboundTransport>>>,
    cancel: CancellationToken,
}

impl ActiveCall {
    fn new(meeting_id: MeetingId, local_user: LocalUser, device: Arc<dyn SfuDevice>) -> Self {
        Self {
            meeting_id,
            local_user,
            device,
            signaling: OnceLock::new(),
            outbound: Mutex::new(None),
            cancel: CancellationToken::new(),
        }
    }

    fn ensure_active(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(Error::SessionLeft)
        } else {
            Ok(())
        }
    }

    fn signaling(&self) -> Result<Arc<SignalingClient>> {
        self.signaling.get().cloned().ok_or(Error::SignalingClosed)
    }

    fn handler(&self) -> Result<Arc<dyn TransportHandler>> {
        Ok(Arc::new(SignalingHandler {
            signaling: self.signaling()?,
        }))
    }

    fn outbound(&self) -> Option<Arc<OutboundTransport>> {
        self.outbound.lock().clone()
    }

    /// Register the outbound transport unless the call was already left
    fn install_outbound(&self, outbound: Arc<OutboundTransport>) -> bool {
        let mut slot = self.outbound.lock();
        if self.cancel.is_cancelled() {
            return false;
        }
        *slot = Some(outbound);
        true
    }
}

struct SessionInner {
    config: Config,
    backends: MediaBackends,
    capture: AsyncMutex<CaptureManager>,
    audio: Mutex<AudioGraphController>,
    peers: PeerRegistry,
    status: watch::Sender<SessionStatus>,
    events: broadcast::Sender<SessionEvent>,
    telemetry: watch::Sender<TelemetrySnapshot>,
    stats: Mutex<StatsAggregator>,
    call: Mutex<Option<Arc<ActiveCall>>>,
}

/// One participant's meeting session
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    pub fn new(config: Config, backends: MediaBackends) -> Self {
        let capture = CaptureManager::new(backends.devices.clone(), &config.media);
        let audio = AudioGraphController::new(backends.audio.clone(), &config.audio);
        let (status, _) = watch::channel(SessionStatus {
            state: ConnectionState::Idle,
            phase: SessionPhase::NoSocket,
        });
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (telemetry, _) = watch::channel(TelemetrySnapshot::default());

        Self {
            inner: Arc::new(SessionInner {
                config,
                backends,
                capture: AsyncMutex::new(capture),
                audio: Mutex::new(audio),
                peers: PeerRegistry::new(),
                status,
                events,
                telemetry,
                stats: Mutex::new(StatsAggregator::new()),
                call: Mutex::new(None),
            }),
        }
    }

    /// Join a meeting.
    ///
    /// Resolves once the local media is being produced and every peer listed
    /// in the join acknowledgment has been admitted (or failed on its own).
    /// Any other failure tears the session down and is reported as fatal.
    pub async fn join(&self, meeting_id: impl Into<MeetingId>, local_user: LocalUser) -> Result<()> {
        let inner = &self.inner;
        if !inner.begin_join() {
            return Err(Error::InvalidState(format!(
                "cannot join while {}",
                inner.status().state
            )));
        }

        let call = Arc::new(ActiveCall::new(
            meeting_id.into(),
            local_user,
            inner.backends.sfu.new_device(),
        ));
        *inner.call.lock() = Some(call.clone());
        info!(
            meeting_id = %call.meeting_id,
            user_id = %call.local_user.user_id,
            user_name = %call.local_user.user_name,
            "Joining meeting"
        );

        match inner.run_join(&call).await {
            Ok(()) if inner.finish_join(&call) => Ok(()),
            Ok(()) => Err(Error::SessionLeft),
            Err(_) if call.cancel.is_cancelled() => {
                debug!(meeting_id = %call.meeting_id, "Join abandoned after leave");
                Err(Error::SessionLeft)
            }
            Err(e) => {
                inner.fail(&call, &e).await;
                Err(e)
            }
        }
    }

    /// Leave the meeting and release every resource. No-op while idle.
    pub async fn leave(&self) -> Result<()> {
        let inner = &self.inner;
        let call = inner.call.lock().take();
        let Some(call) = call else {
            debug!("Leave requested while idle");
            return Ok(());
        };

        let phase = inner.status().phase;
        inner.set_status(ConnectionState::Leaving, phase);
        info!(meeting_id = %call.meeting_id, "Leaving meeting");

        inner.teardown(&call, true).await;
        inner.set_status(ConnectionState::Idle, SessionPhase::Terminated);
        Ok(())
    }

    /// Capture local media before joining (self preview)
    pub async fn start_preview(&self) -> Result<MediaStream> {
        let mut capture = self.inner.capture.lock().await;
        capture.ensure_capture().await.map_err(|e| self.inner.report(e))
    }

    /// Switch camera; while producing the video producer's track is replaced in place
    pub async fn switch_camera(&self, device_id: &str) -> Result<()> {
        let mut capture = self.inner.capture.lock().await;
        let outbound = self.inner.outbound();
        let checkpoint = capture.checkpoint();

        match capture.switch_camera(device_id).await {
            Ok(track) => {
                if let (Some(track), Some(outbound)) = (track, outbound) {
                    if let Err(e) = outbound.replace_track(track).await {
                        rollback_video(&mut capture, checkpoint, &outbound).await;
                        return Err(self.inner.report(e));
                    }
                }
                Ok(())
            }
            Err(e) => {
                // The previous camera was reopened on a fresh track
                let restored = capture
                    .local_stream()
                    .and_then(|s| s.track(MediaKind::Video).cloned());
                if let (Some(track), Some(outbound)) = (restored, outbound) {
                    if let Err(restore_err) = outbound.replace_track(track).await {
                        warn!(error = %restore_err, "Could not resend restored camera");
                    }
                }
                Err(self.inner.report(e))
            }
        }
    }

    /// Switch microphone and re-tap the microphone gain graph onto it
    pub async fn switch_microphone(&self, device_id: &str) -> Result<()> {
        let mut capture = self.inner.capture.lock().await;
        let raw = capture
            .switch_microphone(device_id)
            .await
            .map_err(|e| self.inner.report(e))?;
        let Some(raw) = raw else {
            return Ok(());
        };

        let processed = {
            let mut audio = self.inner.audio.lock();
            if audio.has_mic_chain() {
                Some(audio.tap_microphone(&raw).map_err(|e| self.inner.report(e))?)
            } else {
                None
            }
        };

        if let (Some(track), Some(outbound)) = (processed, self.inner.outbound()) {
            outbound
                .replace_track(track)
                .await
                .map_err(|e| self.inner.report(e))?;
        }
        Ok(())
    }

    /// Change the video tier. Before join only the pending selection changes.
    pub async fn change_resolution(&self, tier: ResolutionTier) -> Result<()> {
        let outbound = self.inner.outbound();
        let mut capture = self.inner.capture.lock().await;
        let checkpoint = capture.checkpoint();
        let track = capture
            .change_resolution(tier, outbound.is_some())
            .await
            .map_err(|e| self.inner.report(e))?;

        if let (Some(track), Some(outbound)) = (track, outbound) {
            if let Err(e) = outbound.replace_track(track).await {
                rollback_video(&mut capture, checkpoint, &outbound).await;
                return Err(self.inner.report(e));
            }
        }
        Ok(())
    }

    /// Route remote audio to another output device (`None` = system default)
    pub async fn select_speaker(&self, sink_id: Option<String>) -> Result<()> {
        self.inner
            .audio
            .lock()
            .select_output(sink_id.clone())
            .map_err(|e| self.inner.report(e))?;
        self.inner.capture.lock().await.set_speaker(sink_id);
        Ok(())
    }

    pub fn set_mic_gain(&self, level: f32) {
        self.inner.audio.lock().set_mic_gain(level);
    }

    pub fn set_mic_enabled(&self, enabled: bool) {
        self.inner.audio.lock().set_mic_enabled(enabled);
    }

    pub fn set_speaker_gain(&self, level: f32) {
        self.inner.audio.lock().set_speaker_gain(level);
    }

    pub fn set_speaker_enabled(&self, enabled: bool) {
        self.inner.audio.lock().set_speaker_enabled(enabled);
    }

    #[must_use]
    pub fn mic_gain(&self) -> GainSetting {
        self.inner.audio.lock().mic_gain()
    }

    #[must_use]
    pub fn speaker_gain(&self) -> GainSetting {
        self.inner.audio.lock().speaker_gain()
    }

    pub async fn selection(&self) -> DeviceSelection {
        self.inner.capture.lock().await.selection().clone()
    }

    pub async fn local_stream(&self) -> Option<MediaStream> {
        self.inner.capture.lock().await.local_stream().cloned()
    }

    /// Enumerate capture and output devices
    pub async fn refresh_devices(&self) -> Result<DeviceInventory> {
        let devices = self.inner.backends.devices.enumerate_devices().await?;
        Ok(DeviceInventory::from_devices(devices))
    }

    /// Remote peers ordered by peer id
    #[must_use]
    pub fn peers(&self) -> Vec<PeerView> {
        self.inner.peers.views()
    }

    #[must_use]
    pub fn peer(&self, peer_id: &PeerId) -> Option<PeerView> {
        self.inner.peers.get(peer_id).map(|slot| slot.view())
    }

    #[must_use]
    pub fn status(&self) -> SessionStatus {
        self.inner.status()
    }

    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        self.inner.status().state
    }

    #[must_use]
    pub fn phase(&self) -> SessionPhase {
        self.inner.status().phase
    }

    #[must_use]
    pub fn watch_status(&self) -> watch::Receiver<SessionStatus> {
        self.inner.status.subscribe()
    }

    #[must_use]
    pub fn telemetry(&self) -> watch::Receiver<TelemetrySnapshot> {
        self.inner.telemetry.subscribe()
    }

    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    #[must_use]
    pub fn meeting_id(&self) -> Option<MeetingId> {
        self.inner
            .call
            .lock()
            .as_ref()
            .map(|call| call.meeting_id.clone())
    }

    /// Number of producers on the outbound transport
    #[must_use]
    pub fn producer_count(&self) -> usize {
        self.inner.outbound().map_or(0, |o| o.producer_count())
    }

    /// Track currently sent by the producer for `kind`
    #[must_use]
    pub fn sending_track(&self, kind: MediaKind) -> Option<TrackHandle> {
        self.inner.outbound().and_then(|o| o.track(kind))
    }

    /// Id of the live producer for `kind`
    #[must_use]
    pub fn producer_id(&self, kind: MediaKind) -> Option<ProducerId> {
        self.inner
            .outbound()
            .and_then(|o| o.producer(kind))
            .map(|p| p.id())
    }
}

/// Put the previous video back on the producer after it rejected a new track
async fn rollback_video(
    capture: &mut CaptureManager,
    checkpoint: VideoCheckpoint,
    outbound: &OutboundTransport,
) {
    match capture.restore_video(checkpoint).await {
        Ok(Some(track)) => {
            if let Err(e) = outbound.replace_track(track).await {
                warn!(error = %e, "Could not resend restored video");
            }
        }
        Ok(None) => {}
        Err(e) => warn!(error = %e, "Could not reopen previous video"),
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(call) = self.inner.call.lock().as_ref() {
            call.cancel.cancel();
        }
    }
}

impl SessionInner {
    fn status(&self) -> SessionStatus {
        *self.status.borrow()
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Apply `update`; emits `StateChanged` when the status actually changed
    fn update_status(&self, update: impl FnOnce(&mut SessionStatus) -> bool) -> bool {
        let mut changed_to = None;
        self.status.send_if_modified(|status| {
            let before = *status;
            if update(status) && *status != before {
                changed_to = Some(*status);
                true
            } else {
                *status = before;
                false
            }
        });

        match changed_to {
            Some(status) => {
                debug!(state = %status.state, phase = ?status.phase, "Session status changed");
                self.emit(SessionEvent::StateChanged {
                    state: status.state,
                    phase: status.phase,
                });
                true
            }
            None => false,
        }
    }

    fn set_status(&self, state: ConnectionState, phase: SessionPhase) {
        self.update_status(|status| {
            *status = SessionStatus { state, phase };
            true
        });
    }

    fn begin_join(&self) -> bool {
        self.update_status(|status| {
            if status.state != ConnectionState::Idle {
                return false;
            }
            *status = SessionStatus {
                state: ConnectionState::Joining,
                phase: SessionPhase::NoSocket,
            };
            true
        })
    }

    fn advance_phase(&self, from: SessionPhase, to: SessionPhase) -> bool {
        self.update_status(|status| {
            if status.phase != from {
                return false;
            }
            status.phase = to;
            true
        })
    }

    fn outbound(&self) -> Option<Arc<OutboundTransport>> {
        self.call.lock().as_ref().and_then(|call| call.outbound())
    }

    /// Log and publish a failure the session survives
    fn report(&self, error: Error) -> Error {
        warn!(error = %error, "Operation failed");
        self.emit(SessionEvent::recoverable(error.to_string()));
        error
    }

    fn spawn<F>(&self, task: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        tokio::spawn(task)
    }

    async fn run_join(self: &Arc<Self>, call: &Arc<ActiveCall>) -> Result<()> {
        let (signaling, notifications) = SignalingClient::connect(
            self.backends.signaling.as_ref(),
            self.config.signaling.request_timeout(),
        )
        .await?;
        if call.signaling.set(signaling.clone()).is_err() {
            signaling.close().await;
            return Err(Error::InvalidState("signaling already attached".to_string()));
        }
        if call.cancel.is_cancelled() {
            signaling.close().await;
            return Err(Error::SessionLeft);
        }
        self.advance_phase(SessionPhase::NoSocket, SessionPhase::AwaitingCapabilities);

        self.spawn(notification_loop(self.clone(), call.clone(), notifications));

        tokio::try_join!(
            self.join_room(call, &signaling),
            self.start_producing(call, &signaling)
        )?;
        Ok(())
    }

    /// Joining → Joined, then start the background tasks
    fn finish_join(self: &Arc<Self>, call: &Arc<ActiveCall>) -> bool {
        if call.cancel.is_cancelled() {
            return false;
        }
        let joined = self.update_status(|status| {
            if status.state != ConnectionState::Joining {
                return false;
            }
            status.state = ConnectionState::Joined;
            true
        });
        if joined {
            self.spawn(stats_loop(self.clone(), call.clone()));
            let changes = self.backends.devices.device_changes();
            self.spawn(device_watch_loop(self.clone(), call.clone(), changes));
            info!(
                meeting_id = %call.meeting_id,
                peers = self.peers.len(),
                "Joined meeting"
            );
        }
        joined
    }

    async fn join_room(self: &Arc<Self>, call: &Arc<ActiveCall>, signaling: &SignalingClient) -> Result<()> {
        let response = signaling
            .request(&JoinRoomRequest {
                meeting_id: call.meeting_id.clone(),
                user_id: call.local_user.user_id.clone(),
                user_name: call.local_user.user_name.clone(),
            })
            .await?;
        call.ensure_active()?;

        let offers = existing_offers(response.existing_producers);
        debug!(
            meeting_id = %call.meeting_id,
            existing_producers = offers.len(),
            "Room joined"
        );

        let admissions: Vec<_> = offers
            .into_iter()
            .map(|offer| self.spawn_admission(call, offer))
            .collect();
        for admission in admissions {
            if let Err(e) = admission.await {
                warn!(error = %e, "Admission task aborted");
            }
        }
        Ok(())
    }

    async fn start_producing(
        self: &Arc<Self>,
        call: &Arc<ActiveCall>,
        signaling: &SignalingClient,
    ) -> Result<()> {
        let capabilities = signaling.capabilities().await?;
        call.ensure_active()?;
        if !call.device.is_loaded() {
            call.device.load(&capabilities)?;
        }
        self.advance_phase(SessionPhase::AwaitingCapabilities, SessionPhase::DeviceReady);
        debug!("Device loaded with router capabilities");

        let local = self.capture.lock().await.ensure_capture().await?;
        call.ensure_active()?;
        let video = local.track(MediaKind::Video).cloned();
        let audio = match local.track(MediaKind::Audio) {
            Some(raw) => Some(self.audio.lock().tap_microphone(raw)?),
            None => None,
        };

        let options = signaling.request(&CreateTransportRequest::send()).await?;
        call.ensure_active()?;
        let transport = call.device.create_send_transport(
            options,
            &self.config.signaling.ice_servers,
            call.handler()?,
        )?;
        let outbound = Arc::new(OutboundTransport::new(transport));
        if !call.install_outbound(outbound.clone()) {
            outbound.close();
            return Err(Error::SessionLeft);
        }
        info!(transport_id = %outbound.id(), "Send transport created");

        let produced_video = video.as_ref().map(|t| t.id().to_string());
        for track in [video, audio].into_iter().flatten() {
            outbound.produce(track).await?;
            if call.cancel.is_cancelled() {
                outbound.close();
                return Err(Error::SessionLeft);
            }
        }

        // A camera switch or a pending tier may have landed while the producers were negotiated
        if let Some(produced) = produced_video {
            let local = {
                let mut capture = self.capture.lock().await;
                call.ensure_active()?;
                capture.ensure_capture().await?
            };
            let current = local.track(MediaKind::Video).cloned();
            if let Some(current) = current.filter(|t| t.id() != produced) {
                outbound.replace_track(current).await?;
            }
        }

        self.advance_phase(SessionPhase::DeviceReady, SessionPhase::Producing);
        Ok(())
    }

    fn spawn_admission(self: &Arc<Self>, call: &Arc<ActiveCall>, offer: ProducerOffer) -> JoinHandle<()> {
        let inner = self.clone();
        let call = call.clone();
        self.spawn(async move {
            let peer_id = offer.peer_id.clone();
            let kind = offer.kind;
            if let Err(e) = inner.admit(&call, offer).await {
                if call.cancel.is_cancelled() || matches!(e, Error::SessionLeft) {
                    debug!(peer_id = %peer_id, kind = %kind, "Admission abandoned after leave");
                } else if !inner.peers.contains(&peer_id) {
                    debug!(peer_id = %peer_id, kind = %kind, "Peer left during admission");
                } else {
                    warn!(peer_id = %peer_id, kind = %kind, error = %e, "Peer admission failed");
                    inner.emit(SessionEvent::recoverable(format!(
                        "failed to receive {kind} from peer {peer_id}: {e}"
                    )));
                }
            }
        })
    }

    async fn wait_device_ready(&self, call: &ActiveCall) -> Result<()> {
        let mut status = self.status.subscribe();
        loop {
            let phase = status.borrow_and_update().phase;
            if phase.device_ready() {
                return Ok(());
            }
            if phase == SessionPhase::Terminated {
                return Err(Error::SessionLeft);
            }
            tokio::select! {
                () = call.cancel.cancelled() => return Err(Error::SessionLeft),
                changed = status.changed() => {
                    if changed.is_err() {
                        return Err(Error::SessionLeft);
                    }
                }
            }
        }
    }

    /// Consume one remote producer: receive transport on first use, then a
    /// consumer whose track joins the peer's compound stream.
    async fn admit(&self, call: &ActiveCall, offer: ProducerOffer) -> Result<()> {
        self.wait_device_ready(call).await?;
        let signaling = call.signaling()?;

        let user_id = offer
            .user_id
            .clone()
            .unwrap_or_else(|| UserId::new(offer.peer_id.as_str()));
        let user_name = offer.user_name.clone().unwrap_or_default();
        let (slot, created) = self.peers.get_or_insert(&offer.peer_id, &user_id, &user_name);
        if created {
            info!(peer_id = %offer.peer_id, user_name = %user_name, "Peer joined");
            self.emit(SessionEvent::PeerJoined {
                peer_id: offer.peer_id.clone(),
                user_id,
                user_name,
            });
        } else {
            slot.update_identity(offer.user_id.as_ref(), offer.user_name.as_deref());
        }

        let _admission = slot.lock_admission().await;
        if slot.is_removed() {
            return Ok(());
        }
        if !slot.needs_consumer(&offer.producer_id, offer.kind) {
            debug!(
                peer_id = %offer.peer_id,
                producer_id = %offer.producer_id,
                kind = %offer.kind,
                "Duplicate producer notification dropped"
            );
            return Ok(());
        }

        let transport = match slot.transport() {
            Some(transport) => transport,
            None => {
                let options = signaling.request(&CreateTransportRequest::recv()).await?;
                call.ensure_active()?;
                let transport = call.device.create_recv_transport(
                    options,
                    &self.config.signaling.ice_servers,
                    call.handler()?,
                )?;
                if call.cancel.is_cancelled() || !slot.set_transport(transport.clone()) {
                    transport.close();
                    call.ensure_active()?;
                    return Ok(());
                }
                debug!(
                    peer_id = %offer.peer_id,
                    transport_id = %transport.id(),
                    "Receive transport created"
                );
                transport
            }
        };

        let options = signaling
            .request(&ConsumeRequest {
                transport_id: transport.id(),
                producer_id: offer.producer_id.clone(),
                kind: offer.kind,
            })
            .await?;
        let consumer = transport.consume(options).await?;
        if call.cancel.is_cancelled() {
            consumer.close();
            return Err(Error::SessionLeft);
        }

        let Some(stream) = slot.add_consumer(consumer.clone()) else {
            consumer.close();
            debug!(peer_id = %offer.peer_id, kind = %offer.kind, "Late consumer discarded");
            return Ok(());
        };
        info!(
            peer_id = %offer.peer_id,
            consumer_id = %consumer.id(),
            kind = %offer.kind,
            tracks = stream.len(),
            "Consumer created"
        );
        self.emit(SessionEvent::PeerTrackAdded {
            peer_id: offer.peer_id.clone(),
            kind: offer.kind,
        });

        if offer.kind == MediaKind::Audio {
            let attached = self.audio.lock().attach_remote(&stream);
            match attached {
                Ok(true) => slot.set_audio_routed(),
                Ok(false) => {}
                Err(e) => {
                    warn!(peer_id = %offer.peer_id, error = %e, "Remote audio not routed");
                    self.emit(SessionEvent::recoverable(format!(
                        "audio for peer {} unavailable: {e}",
                        offer.peer_id
                    )));
                }
            }
        }
        Ok(())
    }

    fn remove_peer(&self, peer_id: &PeerId) {
        let Some(slot) = self.peers.remove(peer_id) else {
            debug!(peer_id = %peer_id, "Disconnect for unknown peer");
            return;
        };
        if let Some(stream) = slot.close() {
            self.audio.lock().detach_remote(stream.id());
        }
        {
            let mut stats = self.stats.lock();
            stats.forget_peer(peer_id);
            self.telemetry.send_modify(|snapshot| {
                snapshot.peers.remove(peer_id);
            });
        }

        info!(peer_id = %peer_id, remaining_peers = self.peers.len(), "Peer disconnected");
        self.emit(SessionEvent::PeerLeft {
            peer_id: peer_id.clone(),
        });
    }

    /// Detach `call` if it is still the current one
    fn detach_call(&self, call: &Arc<ActiveCall>) -> bool {
        let mut current = self.call.lock();
        match current.as_ref() {
            Some(active) if Arc::ptr_eq(active, call) => {
                *current = None;
                true
            }
            _ => false,
        }
    }

    /// Fatal path: full teardown, back to idle
    async fn fail(&self, call: &Arc<ActiveCall>, cause: &Error) {
        if !self.detach_call(call) {
            return;
        }
        error!(meeting_id = %call.meeting_id, error = %cause, "Session failed");

        let state = self.status().state;
        self.set_status(state, SessionPhase::Terminated);
        self.teardown(call, true).await;
        self.set_status(ConnectionState::Idle, SessionPhase::Terminated);
        self.emit(SessionEvent::fatal(cause.to_string()));
    }

    /// Release everything the call owns. Every step is best-effort.
    async fn teardown(&self, call: &ActiveCall, announce: bool) {
        call.cancel.cancel();

        let outbound = call.outbound.lock().take();
        if let Some(outbound) = outbound {
            outbound.close();
        }

        let mut released_peers = 0;
        for slot in self.peers.drain() {
            if let Some(stream) = slot.close() {
                self.audio.lock().detach_remote(stream.id());
            }
            released_peers += 1;
        }

        self.capture.lock().await.stop();
        self.audio.lock().teardown();

        if let Some(signaling) = call.signaling.get() {
            if announce {
                let leave = LeaveRoomRequest {
                    meeting_id: call.meeting_id.clone(),
                };
                if let Err(e) = signaling.emit(LEAVE_ROOM, &leave).await {
                    debug!(error = %e, "Could not announce departure");
                }
            }
            signaling.close().await;
        }

        {
            let mut stats = self.stats.lock();
            stats.reset();
            self.telemetry.send_replace(TelemetrySnapshot::default());
        }

        info!(
            meeting_id = %call.meeting_id,
            released_peers,
            "Session resources released"
        );
    }

    /// One statistics poll over the outbound and every inbound transport
    async fn sample_stats(&self, call: &ActiveCall) {
        let now = Instant::now();

        let outbound = match call.outbound() {
            Some(outbound) => match outbound.stats().await {
                Ok(reports) => Some(reports),
                Err(e) => {
                    debug!(error = %e, "Outbound statistics unavailable");
                    None
                }
            },
            None => None,
        };

        let mut inbound = Vec::new();
        for (peer_id, transport) in self.peers.transports() {
            match transport.stats().await {
                Ok(reports) => inbound.push((peer_id, Some(reports))),
                Err(e) => {
                    debug!(peer_id = %peer_id, error = %e, "Inbound statistics unavailable");
                    inbound.push((peer_id, None));
                }
            }
        }

        let mut stats = self.stats.lock();
        // Teardown cancels before it resets under this lock
        if call.cancel.is_cancelled() {
            return;
        }
        let mut snapshot = TelemetrySnapshot {
            outbound: outbound
                .map(|reports| stats.sample_outbound(&reports, now))
                .unwrap_or_default(),
            ..TelemetrySnapshot::default()
        };
        for (peer_id, reports) in inbound {
            // Departed while the snapshot was read
            if !self.peers.contains(&peer_id) {
                continue;
            }
            let telemetry = reports
                .map(|reports| stats.sample_peer(&peer_id, &reports, now))
                .unwrap_or_default();
            snapshot.peers.insert(peer_id, telemetry);
        }
        self.telemetry.send_replace(snapshot);
    }
}

async fn notification_loop(
    inner: Arc<SessionInner>,
    call: Arc<ActiveCall>,
    mut notifications: mpsc::UnboundedReceiver<Notification>,
) {
    loop {
        let notification = tokio::select! {
            () = call.cancel.cancelled() => break,
            notification = notifications.recv() => notification,
        };

        match notification {
            Some(Notification::NewConsumer(payload)) => {
                debug!(
                    peer_id = %payload.peer_id,
                    producer_id = %payload.producer_id,
                    kind = %payload.kind,
                    "New remote producer"
                );
                inner.spawn_admission(&call, payload.into());
            }
            Some(Notification::PeerDisconnected(peer_id)) => inner.remove_peer(&peer_id),
            None => {
                if !call.cancel.is_cancelled() {
                    inner.fail(&call, &Error::SignalingClosed).await;
                }
                break;
            }
        }
    }
    debug!(meeting_id = %call.meeting_id, "Notification loop stopped");
}

async fn stats_loop(inner: Arc<SessionInner>, call: Arc<ActiveCall>) {
    let period = inner.config.stats.interval();
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    debug!(interval_ms = inner.config.stats.interval_ms, "Starting statistics polling");

    loop {
        tokio::select! {
            () = call.cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        if inner.status().phase == SessionPhase::Producing {
            inner.sample_stats(&call).await;
        }
    }
}

async fn device_watch_loop(
    inner: Arc<SessionInner>,
    call: Arc<ActiveCall>,
    mut changes: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            () = call.cancel.cancelled() => break,
            change = changes.recv() => match change {
                Ok(()) | Err(broadcast::error::RecvError::Lagged(_)) => {
                    debug!("Media devices changed");
                    inner.emit(SessionEvent::DevicesChanged);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::LoopbackRoom;

    fn session(room: &LoopbackRoom) -> Session {
        let mut config = Config::default();
        config.media.camera_settle_delay_ms = 0;
        Session::new(config, room.backends())
    }

    #[tokio::test]
    async fn test_join_and_leave_lifecycle() {
        let room = LoopbackRoom::new();
        let session = session(&room);
        let mut status = session.watch_status();

        session.join("room-1", LocalUser::new("u1", "Alice")).await.unwrap();
        assert_eq!(session.connection_state(), ConnectionState::Joined);
        assert_eq!(session.phase(), SessionPhase::Producing);
        assert_eq!(session.producer_count(), 2);
        assert!(status.has_changed().unwrap());

        session.leave().await.unwrap();
        assert_eq!(session.connection_state(), ConnectionState::Idle);
        assert_eq!(session.phase(), SessionPhase::Terminated);
        assert_eq!(session.producer_count(), 0);
        assert!(session.local_stream().await.is_none());
    }

    #[tokio::test]
    async fn test_join_twice_is_rejected() {
        let room = LoopbackRoom::new();
        let session = session(&room);
        session.join("room-1", LocalUser::new("u1", "Alice")).await.unwrap();

        let again = session.join("room-1", LocalUser::new("u1", "Alice")).await;
        assert!(matches!(again, Err(Error::InvalidState(_))));
        session.leave().await.unwrap();
    }

    #[tokio::test]
    async fn test_leave_while_idle_is_noop() {
        let room = LoopbackRoom::new();
        let session = session(&room);
        session.leave().await.unwrap();
        assert_eq!(session.phase(), SessionPhase::NoSocket);
    }

    #[tokio::test]
    async fn test_rejoin_after_leave() {
        let room = LoopbackRoom::new();
        let session = session(&room);
        session.join("room-1", LocalUser::new("u1", "Alice")).await.unwrap();
        session.leave().await.unwrap();

        session.join("room-2", LocalUser::new("u1", "Alice")).await.unwrap();
        assert_eq!(session.meeting_id().unwrap().as_str(), "room-2");
        assert_eq!(session.producer_count(), 2);
        session.leave().await.unwrap();
    }

    #[test]
    fn test_existing_offers_flatten_per_producer() {
        let peers: Vec<ExistingPeer> = serde_json::from_value(serde_json::json!([{
            "peerId": "b",
            "userId": "u2",
            "userName": "Bob",
            "producers": [{"id": "pv", "kind": "video"}, {"id": "pa", "kind": "audio"}]
        }]))
        .unwrap();

        let offers = existing_offers(peers);
        assert_eq!(offers.len(), 2);
        assert_eq!(offers[1].kind, MediaKind::Audio);
        assert_eq!(offers[1].user_name.as_deref(), Some("Bob"));
    }
}
