//! Audio gain routing
//!
//! Two independent graphs, each in its own lazily created context:
//!
//! - microphone: capture track → source tap → gain → destination. The
//!   destination track is what the outbound producer sends, so gain changes
//!   never touch the transport.
//! - speaker: for every remote compound stream, its audio track → source tap →
//!   gain → audio output. The stream's own playback must be muted by the caller
//!   to avoid hearing the unprocessed copy.
//!
//! Each stream receives at most one gain node for its lifetime. Replacing the
//! underlying track only rebuilds the source tap.

use crate::config::AudioConfig;
use crate::error::{Error, Result};
use crate::media::{MediaKind, MediaStream, TrackHandle};
use crate::types::StreamId;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const MIN_GAIN: f32 = 0.0;
pub const MAX_GAIN: f32 = 2.5;
pub const DEFAULT_GAIN: f32 = 1.0;

/// Adjustable amplitude multiplier
pub trait GainNode: Send + Sync {
    fn set_gain(&self, value: f32);

    fn gain(&self) -> f32;
}

/// Connection from a track into a gain node
pub trait SourceTap: Send + Sync {
    fn disconnect(&self);
}

/// One audio processing context
pub trait AudioContext: Send + Sync {
    fn create_gain(&self) -> Result<Arc<dyn GainNode>>;

    /// Feed `track` into `gain`
    fn tap(&self, track: &TrackHandle, gain: &Arc<dyn GainNode>) -> Result<Box<dyn SourceTap>>;

    /// Processed output of `gain` as a sendable track
    fn destination(&self, gain: &Arc<dyn GainNode>) -> Result<TrackHandle>;

    /// Play `gain`'s output on the given sink (`None` = default output)
    fn route_to_output(&self, gain: &Arc<dyn GainNode>, sink_id: Option<&str>) -> Result<()>;

    fn close(&self);
}

pub trait AudioBackend: Send + Sync {
    fn create_context(&self) -> Result<Arc<dyn AudioContext>>;
}

/// User-chosen gain plus an enable switch.
///
/// Disabling forces the effective gain to zero but remembers the level.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GainSetting {
    level: f32,
    enabled: bool,
}

impl GainSetting {
    #[must_use]
    pub fn new(level: f32) -> Self {
        Self {
            level: clamp_gain(level),
            enabled: true,
        }
    }

    #[must_use]
    pub const fn level(&self) -> f32 {
        self.level
    }

    #[must_use]
    pub const fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_level(&mut self, level: f32) {
        self.level = clamp_gain(level);
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    #[must_use]
    pub fn effective(&self) -> f32 {
        if self.enabled {
            self.level
        } else {
            0.0
        }
    }
}

impl Default for GainSetting {
    fn default() -> Self {
        Self::new(DEFAULT_GAIN)
    }
}

fn clamp_gain(level: f32) -> f32 {
    if level.is_nan() {
        return DEFAULT_GAIN;
    }
    level.clamp(MIN_GAIN, MAX_GAIN)
}

struct MicChain {
    gain: Arc<dyn GainNode>,
    tap: Box<dyn SourceTap>,
    source_track_id: String,
    output: TrackHandle,
}

struct RemoteChain {
    gain: Arc<dyn GainNode>,
    tap: Box<dyn SourceTap>,
}

/// Owner of both audio graphs and their gain settings
pub struct AudioGraphController {
    backend: Arc<dyn AudioBackend>,
    mic: GainSetting,
    speaker: GainSetting,
    sink_id: Option<String>,
    mic_context: Option<Arc<dyn AudioContext>>,
    speaker_context: Option<Arc<dyn AudioContext>>,
    mic_chain: Option<MicChain>,
    remote: HashMap<StreamId, RemoteChain>,
}

impl AudioGraphController {
    pub fn new(backend: Arc<dyn AudioBackend>, config: &AudioConfig) -> Self {
        Self {
            backend,
            mic: GainSetting::new(config.mic_gain),
            speaker: GainSetting::new(config.speaker_gain),
            sink_id: config.speaker_id.clone(),
            mic_context: None,
            speaker_context: None,
            mic_chain: None,
            remote: HashMap::new(),
        }
    }

    #[must_use]
    pub const fn mic_gain(&self) -> GainSetting {
        self.mic
    }

    #[must_use]
    pub const fn speaker_gain(&self) -> GainSetting {
        self.speaker
    }

    #[must_use]
    pub fn output_device(&self) -> Option<&str> {
        self.sink_id.as_deref()
    }

    #[must_use]
    pub const fn has_mic_chain(&self) -> bool {
        self.mic_chain.is_some()
    }

    /// Processed microphone track, if the microphone graph exists
    #[must_use]
    pub fn mic_output(&self) -> Option<TrackHandle> {
        self.mic_chain.as_ref().map(|chain| chain.output.clone())
    }

    #[must_use]
    pub fn is_remote_attached(&self, stream_id: &StreamId) -> bool {
        self.remote.contains_key(stream_id)
    }

    /// Route a captured microphone track through the gain graph and return the
    /// processed track to send.
    ///
    /// The first call builds context, gain node and destination. Later calls
    /// only re-tap the new source so the gain node and output track survive.
    pub fn tap_microphone(&mut self, track: &TrackHandle) -> Result<TrackHandle> {
        if track.kind() != MediaKind::Audio {
            return Err(Error::AudioGraph(format!(
                "cannot tap {} track {} as microphone",
                track.kind(),
                track.id()
            )));
        }

        if let Some(chain) = &mut self.mic_chain {
            if chain.source_track_id == track.id() {
                return Ok(chain.output.clone());
            }
            let context = self
                .mic_context
                .as_ref()
                .ok_or_else(|| Error::AudioGraph("microphone context missing".to_string()))?;
            let tap = context.tap(track, &chain.gain)?;
            chain.tap.disconnect();
            chain.tap = tap;
            chain.source_track_id = track.id().to_string();
            debug!(track_id = %track.id(), "Microphone re-tapped");
            return Ok(chain.output.clone());
        }

        let context = match &self.mic_context {
            Some(context) => context.clone(),
            None => {
                let context = self.backend.create_context()?;
                self.mic_context = Some(context.clone());
                context
            }
        };

        let gain = context.create_gain()?;
        gain.set_gain(self.mic.effective());
        let tap = context.tap(track, &gain)?;
        let output = context.destination(&gain)?;

        info!(
            source_track = %track.id(),
            output_track = %output.id(),
            gain = self.mic.effective(),
            "Microphone gain graph built"
        );

        self.mic_chain = Some(MicChain {
            gain,
            tap,
            source_track_id: track.id().to_string(),
            output: output.clone(),
        });
        Ok(output)
    }

    /// Attach a gain chain to a remote compound stream.
    ///
    /// Returns `false` when the stream already has one or carries no audio.
    pub fn attach_remote(&mut self, stream: &MediaStream) -> Result<bool> {
        if self.remote.contains_key(stream.id()) {
            return Ok(false);
        }
        let Some(track) = stream.track(MediaKind::Audio) else {
            return Ok(false);
        };

        let context = match &self.speaker_context {
            Some(context) => context.clone(),
            None => {
                let context = self.backend.create_context()?;
                self.speaker_context = Some(context.clone());
                context
            }
        };

        let gain = context.create_gain()?;
        gain.set_gain(self.speaker.effective());
        let tap = context.tap(track, &gain)?;
        context.route_to_output(&gain, self.sink_id.as_deref())?;

        debug!(stream_id = %stream.id(), track_id = %track.id(), "Remote audio attached");
        self.remote
            .insert(stream.id().clone(), RemoteChain { gain, tap });
        Ok(true)
    }

    pub fn detach_remote(&mut self, stream_id: &StreamId) {
        if let Some(chain) = self.remote.remove(stream_id) {
            chain.tap.disconnect();
            debug!(stream_id = %stream_id, "Remote audio detached");
        }
    }

    pub fn set_mic_gain(&mut self, level: f32) {
        self.mic.set_level(level);
        self.apply_mic();
    }

    pub fn set_mic_enabled(&mut self, enabled: bool) {
        self.mic.set_enabled(enabled);
        self.apply_mic();
    }

    pub fn set_speaker_gain(&mut self, level: f32) {
        self.speaker.set_level(level);
        self.apply_speaker();
    }

    pub fn set_speaker_enabled(&mut self, enabled: bool) {
        self.speaker.set_enabled(enabled);
        self.apply_speaker();
    }

    /// Move every remote chain to another output device
    pub fn select_output(&mut self, sink_id: Option<String>) -> Result<()> {
        if let Some(context) = &self.speaker_context {
            for (stream_id, chain) in &self.remote {
                context
                    .route_to_output(&chain.gain, sink_id.as_deref())
                    .map_err(|e| {
                        warn!(stream_id = %stream_id, error = %e, "Failed to reroute remote audio");
                        e
                    })?;
            }
        }
        info!(sink = sink_id.as_deref().unwrap_or("default"), "Speaker output selected");
        self.sink_id = sink_id;
        Ok(())
    }

    /// Disconnect everything and close both contexts. Gain settings survive.
    pub fn teardown(&mut self) {
        if let Some(chain) = self.mic_chain.take() {
            chain.tap.disconnect();
            chain.output.stop();
        }
        for (_, chain) in self.remote.drain() {
            chain.tap.disconnect();
        }
        if let Some(context) = self.mic_context.take() {
            context.close();
        }
        if let Some(context) = self.speaker_context.take() {
            context.close();
        }
        debug!("Audio graphs torn down");
    }

    fn apply_mic(&self) {
        if let Some(chain) = &self.mic_chain {
            chain.gain.set_gain(self.mic.effective());
        }
    }

    fn apply_speaker(&self) {
        let value = self.speaker.effective();
        for chain in self.remote.values() {
            chain.gain.set_gain(value);
        }
    }
}
