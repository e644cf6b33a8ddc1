//! `RoomLink` meeting session
//!
//! Client-side orchestration of one participant in an SFU meeting: local
//! capture, gain-controlled audio routing, the outbound and per-peer inbound
//! transports, and link-quality statistics.
//!
//! ## Architecture
//!
//! - **`Session`**: aggregate root for one meeting participation
//! - **`CaptureManager`**: camera and microphone acquisition, resolution probing, hot-swap
//! - **`AudioGraphController`**: microphone and speaker gain graphs
//! - **`OutboundTransport`**: send transport with at most one producer per kind
//! - **`PeerRegistry`**: remote peers, their receive transports and compound streams
//! - **`StatsAggregator`**: bitrate, loss and round-trip time from raw counters
//! - **`SignalingClient`**: request/response correlation over a signaling channel
//!
//! Platform capabilities (capture devices, audio processing, the SFU client
//! library, the signaling connection) sit behind traits. The [`loopback`]
//! module implements all of them in process.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use roomlink_session::{loopback::LoopbackRoom, Config, LocalUser, Session};
//!
//! let room = LoopbackRoom::new();
//! let session = Session::new(Config::default(), room.backends());
//! session.join("room-1", LocalUser::new("u1", "Alice")).await?;
//! let mut telemetry = session.telemetry();
//! telemetry.changed().await?;
//! session.leave().await?;
//! ```

mod audio;
mod capture;
mod config;
mod error;
mod events;
mod logging;
mod media;
mod outbound;
mod peer;
mod session;
mod stats;
mod transport;
mod types;

pub mod loopback;
pub mod signaling;

pub use audio::{
    AudioBackend, AudioContext, AudioGraphController, GainNode, GainSetting, SourceTap,
    DEFAULT_GAIN, MAX_GAIN, MIN_GAIN,
};
pub use capture::{
    within_tolerance, CaptureManager, DeviceSelection, ResolutionTier, VideoCheckpoint,
    PROBE_TOLERANCE,
};
pub use config::{AudioConfig, Config, LoggingConfig, MediaConfig, SignalingConfig, StatsConfig};
pub use error::{Error, Result};
pub use events::{SessionEvent, Severity};
pub use logging::init_logging;
pub use media::{
    AudioConstraints, DeviceInfo, DeviceInventory, DeviceKind, MediaConstraints, MediaDevices,
    MediaKind, MediaStream, MediaTrack, TrackHandle, TrackSettings, VideoConstraints,
};
pub use outbound::OutboundTransport;
pub use peer::{PeerRegistry, PeerSlot, PeerSummary, PeerView};
pub use session::{ConnectionState, MediaBackends, Session, SessionPhase, SessionStatus};
pub use stats::{
    inbound_totals, outbound_totals, round_trip_ms, FlowTotals, KindTelemetry, Metric,
    OutboundTelemetry, PeerTelemetry, StatsAggregator, StatsReport, TelemetrySnapshot,
};
pub use transport::{
    Consumer, ConsumerOptions, DtlsParameters, IceServer, Producer, RecvTransport,
    RtpCapabilities, RtpParameters, SendTransport, SfuBackend, SfuDevice, TransportHandler,
    TransportOptions,
};
pub use types::{
    generate_id, ConsumerId, LocalUser, MeetingId, PeerId, ProducerId, StreamId, TransportId,
    UserId,
};
