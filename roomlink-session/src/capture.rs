//! Local camera and microphone capture
//!
//! Owns the local media stream, the current device selection and the
//! resolution probing that keeps the selected tier honest. Cameras silently
//! clamp requested dimensions to their native modes, so a tier is only
//! considered supported after a throwaway capture round-trips through the
//! actually negotiated settings.

use crate::config::MediaConfig;
use crate::error::{Error, Result};
use crate::media::{
    AudioConstraints, MediaConstraints, MediaDevices, MediaKind, MediaStream,
    TrackHandle, VideoConstraints,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Accepted relative deviation between requested and negotiated dimensions
pub const PROBE_TOLERANCE: f64 = 0.10;

/// Video resolution tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ResolutionTier {
    #[serde(rename = "180p")]
    P180,
    #[serde(rename = "360p")]
    P360,
    #[serde(rename = "480p")]
    P480,
    #[serde(rename = "720p")]
    P720,
}

impl ResolutionTier {
    /// All tiers, lowest first
    pub const ALL: [Self; 4] = [Self::P180, Self::P360, Self::P480, Self::P720];

    /// Tier used when no tier survives probing
    pub const FALLBACK: Self = Self::P360;

    /// Target capture dimensions (width, height)
    #[must_use]
    pub const fn dimensions(&self) -> (u32, u32) {
        match self {
            Self::P180 => (320, 180),
            Self::P360 => (640, 360),
            Self::P480 => (854, 480),
            Self::P720 => (1280, 720),
        }
    }

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::P180 => "180p",
            Self::P360 => "360p",
            Self::P480 => "480p",
            Self::P720 => "720p",
        }
    }

    fn constraints(self, device_id: Option<&str>) -> VideoConstraints {
        let (width, height) = self.dimensions();
        VideoConstraints {
            device_id: device_id.map(str::to_string),
            width,
            height,
        }
    }
}

impl fmt::Display for ResolutionTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResolutionTier {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|tier| tier.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown resolution tier: {s}"))
    }
}

/// Whether `actual` is within [`PROBE_TOLERANCE`] of `requested`
#[must_use]
pub fn within_tolerance(requested: u32, actual: u32) -> bool {
    if requested == 0 {
        return actual == 0;
    }
    let deviation = (f64::from(actual) - f64::from(requested)).abs() / f64::from(requested);
    deviation <= PROBE_TOLERANCE
}

/// Selected devices and resolution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSelection {
    pub camera_id: Option<String>,
    pub mic_id: Option<String>,
    pub speaker_id: Option<String>,
    resolution: ResolutionTier,
    /// Tiers validated for the selected camera; empty until probed
    supported: Vec<ResolutionTier>,
}

impl DeviceSelection {
    #[must_use]
    pub const fn new(resolution: ResolutionTier) -> Self {
        Self {
            camera_id: None,
            mic_id: None,
            speaker_id: None,
            resolution,
            supported: Vec::new(),
        }
    }

    #[must_use]
    pub const fn resolution(&self) -> ResolutionTier {
        self.resolution
    }

    #[must_use]
    pub fn supported_resolutions(&self) -> &[ResolutionTier] {
        &self.supported
    }

    #[must_use]
    pub fn is_probed(&self) -> bool {
        !self.supported.is_empty()
    }

    /// Select a tier; it must belong to the probed set once one exists
    pub fn set_resolution(&mut self, tier: ResolutionTier) -> Result<()> {
        if self.is_probed() && !self.supported.contains(&tier) {
            return Err(Error::UnsupportedResolution(tier));
        }
        self.resolution = tier;
        Ok(())
    }

    /// Install a freshly probed set and reset the tier to its lowest member
    fn apply_probe(&mut self, supported: Vec<ResolutionTier>) {
        self.resolution = supported
            .first()
            .copied()
            .unwrap_or(ResolutionTier::FALLBACK);
        self.supported = supported;
    }
}

/// Video state to return to when a new track cannot be sent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoCheckpoint {
    camera_id: Option<String>,
    resolution: ResolutionTier,
    supported: Vec<ResolutionTier>,
    captured_tier: Option<ResolutionTier>,
}

/// Local capture state machine
pub struct CaptureManager {
    devices: Arc<dyn MediaDevices>,
    settle_delay: Duration,
    selection: DeviceSelection,
    local: Option<MediaStream>,
    /// Tier the live video track was captured at
    captured_tier: Option<ResolutionTier>,
}

impl CaptureManager {
    pub fn new(devices: Arc<dyn MediaDevices>, config: &MediaConfig) -> Self {
        let mut selection = DeviceSelection::new(config.default_resolution);
        selection.camera_id.clone_from(&config.camera_id);
        selection.mic_id.clone_from(&config.mic_id);
        Self {
            devices,
            settle_delay: config.camera_settle_delay(),
            selection,
            local: None,
            captured_tier: None,
        }
    }

    #[must_use]
    pub const fn selection(&self) -> &DeviceSelection {
        &self.selection
    }

    #[must_use]
    pub const fn local_stream(&self) -> Option<&MediaStream> {
        self.local.as_ref()
    }

    pub fn set_speaker(&mut self, sink_id: Option<String>) {
        self.selection.speaker_id = sink_id;
    }

    /// Open camera and microphone with the given constraints.
    ///
    /// Any previous local stream is stopped only after the new one is acquired.
    pub async fn start_capture(
        &mut self,
        camera_id: Option<&str>,
        mic_id: Option<&str>,
        tier: ResolutionTier,
    ) -> Result<MediaStream> {
        let constraints = MediaConstraints {
            video: Some(tier.constraints(camera_id)),
            audio: Some(AudioConstraints {
                device_id: mic_id.map(str::to_string),
            }),
        };

        let stream = self.devices.get_user_media(&constraints).await?;
        if !stream.has_kind(MediaKind::Video) || !stream.has_kind(MediaKind::Audio) {
            stream.stop_all();
            return Err(Error::DeviceUnavailable(
                "capture did not yield both camera and microphone".to_string(),
            ));
        }

        if let Some(previous) = self.local.replace(stream.clone()) {
            previous.stop_all();
        }
        self.selection.camera_id = camera_id.map(str::to_string);
        self.selection.mic_id = mic_id.map(str::to_string);
        self.captured_tier = Some(tier);

        info!(
            camera = camera_id.unwrap_or("default"),
            microphone = mic_id.unwrap_or("default"),
            resolution = %tier,
            "Local capture started"
        );
        Ok(stream)
    }

    /// Make sure a local stream exists at the selected tier and return it.
    pub async fn ensure_capture(&mut self) -> Result<MediaStream> {
        if !self.selection.is_probed() {
            let camera_id = self.selection.camera_id.clone();
            let supported = self.probe_supported_resolutions(camera_id.as_deref()).await;
            let wanted = self.selection.resolution;
            self.selection.apply_probe(supported);
            // Keep the configured tier when the camera supports it
            if let Err(e) = self.selection.set_resolution(wanted) {
                debug!(
                    wanted = %wanted,
                    resolution = %self.selection.resolution,
                    error = %e,
                    "Configured resolution not supported by camera"
                );
            }
        }

        let tier = self.selection.resolution;
        match &self.local {
            None => {
                let camera_id = self.selection.camera_id.clone();
                let mic_id = self.selection.mic_id.clone();
                self.start_capture(camera_id.as_deref(), mic_id.as_deref(), tier)
                    .await
            }
            Some(stream) if self.captured_tier == Some(tier) => Ok(stream.clone()),
            Some(_) => {
                self.refresh_video(tier).await?;
                self.local
                    .clone()
                    .ok_or_else(|| Error::DeviceUnavailable("local stream vanished".to_string()))
            }
        }
    }

    /// Probe which tiers the camera really delivers, lowest first.
    ///
    /// Never returns an empty set: falls back to [`ResolutionTier::FALLBACK`].
    pub async fn probe_supported_resolutions(&self, camera_id: Option<&str>) -> Vec<ResolutionTier> {
        let mut supported = Vec::new();

        for tier in ResolutionTier::ALL {
            let constraints = MediaConstraints {
                video: Some(tier.constraints(camera_id)),
                audio: None,
            };

            match self.devices.get_user_media(&constraints).await {
                Ok(probe) => {
                    let settings = probe
                        .track(MediaKind::Video)
                        .map(|track| track.settings())
                        .unwrap_or_default();
                    probe.stop_all();

                    let (width, height) = tier.dimensions();
                    let accepted = match (settings.width, settings.height) {
                        (Some(w), Some(h)) => within_tolerance(width, w) && within_tolerance(height, h),
                        _ => false,
                    };
                    debug!(
                        resolution = %tier,
                        actual_width = ?settings.width,
                        actual_height = ?settings.height,
                        accepted,
                        "Resolution probe"
                    );
                    if accepted {
                        supported.push(tier);
                    }
                }
                Err(e) => {
                    debug!(resolution = %tier, error = %e, "Resolution probe failed");
                }
            }
        }

        if supported.is_empty() {
            warn!(
                camera = camera_id.unwrap_or("default"),
                "No resolution tier validated, falling back to {}",
                ResolutionTier::FALLBACK
            );
            supported.push(ResolutionTier::FALLBACK);
        }
        supported
    }

    /// Switch to another camera.
    ///
    /// Returns the new video track when a local stream exists, so the caller
    /// can replace it on the live producer. On failure the previous camera is
    /// reopened and the selection is left untouched.
    pub async fn switch_camera(&mut self, device_id: &str) -> Result<Option<TrackHandle>> {
        let previous_camera = self.selection.camera_id.clone();
        let previous_tier = self.captured_tier.unwrap_or(self.selection.resolution);

        let old_video = self
            .local
            .as_ref()
            .and_then(|s| s.track(MediaKind::Video))
            .cloned();
        if let Some(track) = &old_video {
            track.stop();
            tokio::time::sleep(self.settle_delay).await;
        }

        let supported = self.probe_supported_resolutions(Some(device_id)).await;
        let tier = supported.first().copied().unwrap_or(ResolutionTier::FALLBACK);

        if self.local.is_none() {
            self.selection.camera_id = Some(device_id.to_string());
            self.selection.apply_probe(supported);
            info!(camera = device_id, resolution = %tier, "Camera selected");
            return Ok(None);
        }

        match self.acquire_video(Some(device_id), tier).await {
            Ok(track) => {
                self.splice(track.clone());
                self.selection.camera_id = Some(device_id.to_string());
                self.selection.apply_probe(supported);
                self.captured_tier = Some(tier);
                info!(camera = device_id, resolution = %tier, "Camera switched");
                Ok(Some(track))
            }
            Err(e) => {
                warn!(camera = device_id, error = %e, "Camera switch failed, restoring previous camera");
                if old_video.is_some() {
                    match self.acquire_video(previous_camera.as_deref(), previous_tier).await {
                        Ok(restored) => {
                            self.splice(restored);
                        }
                        Err(restore_err) => {
                            warn!(error = %restore_err, "Could not reopen previous camera");
                        }
                    }
                }
                Err(e)
            }
        }
    }

    /// Switch to another microphone. Returns the new raw audio track.
    pub async fn switch_microphone(&mut self, device_id: &str) -> Result<Option<TrackHandle>> {
        let Some(local) = &self.local else {
            self.selection.mic_id = Some(device_id.to_string());
            return Ok(None);
        };
        let old_audio = local.track(MediaKind::Audio).cloned();

        let constraints = MediaConstraints {
            video: None,
            audio: Some(AudioConstraints {
                device_id: Some(device_id.to_string()),
            }),
        };
        let stream = self.devices.get_user_media(&constraints).await?;
        let track = stream.track(MediaKind::Audio).cloned().ok_or_else(|| {
            stream.stop_all();
            Error::DeviceUnavailable(format!("microphone {device_id} produced no audio track"))
        })?;

        if let Some(old) = old_audio {
            old.stop();
        }
        self.splice(track.clone());
        self.selection.mic_id = Some(device_id.to_string());
        info!(microphone = device_id, "Microphone switched");
        Ok(Some(track))
    }

    /// Change the video tier.
    ///
    /// With `live == false` only the pending selection changes; the next
    /// [`ensure_capture`](Self::ensure_capture) picks it up.
    pub async fn change_resolution(
        &mut self,
        tier: ResolutionTier,
        live: bool,
    ) -> Result<Option<TrackHandle>> {
        let previous = self.selection.resolution;
        self.selection.set_resolution(tier)?;

        if !live || self.local.is_none() {
            debug!(resolution = %tier, "Pending resolution updated");
            return Ok(None);
        }

        match self.refresh_video(tier).await {
            Ok(track) => Ok(Some(track)),
            Err(e) => {
                self.selection.resolution = previous;
                Err(e)
            }
        }
    }

    /// Record the camera and tier behind the current video track
    #[must_use]
    pub fn checkpoint(&self) -> VideoCheckpoint {
        VideoCheckpoint {
            camera_id: self.selection.camera_id.clone(),
            resolution: self.selection.resolution,
            supported: self.selection.supported.clone(),
            captured_tier: self.captured_tier,
        }
    }

    /// Go back to the video state recorded by [`checkpoint`](Self::checkpoint).
    ///
    /// Reopens the recorded camera at the recorded tier and returns the new
    /// track, or `None` when no video was being captured at the checkpoint.
    pub async fn restore_video(&mut self, checkpoint: VideoCheckpoint) -> Result<Option<TrackHandle>> {
        self.selection.camera_id = checkpoint.camera_id;
        self.selection.resolution = checkpoint.resolution;
        self.selection.supported = checkpoint.supported;

        let Some(tier) = checkpoint.captured_tier else {
            return Ok(None);
        };
        if self.local.is_none() {
            return Ok(None);
        }
        let camera_id = self.selection.camera_id.clone();
        let track = self.acquire_video(camera_id.as_deref(), tier).await?;
        if let Some(old) = self.splice(track.clone()) {
            old.stop();
        }
        self.captured_tier = Some(tier);
        info!(
            camera = camera_id.as_deref().unwrap_or("default"),
            resolution = %tier,
            "Previous video restored"
        );
        Ok(Some(track))
    }

    /// Stop every local track and forget the local stream. Idempotent.
    pub fn stop(&mut self) {
        if let Some(stream) = self.local.take() {
            stream.stop_all();
            debug!(stream_id = %stream.id(), "Local capture stopped");
        }
        self.captured_tier = None;
    }

    async fn refresh_video(&mut self, tier: ResolutionTier) -> Result<TrackHandle> {
        let camera_id = self.selection.camera_id.clone();
        let track = self.acquire_video(camera_id.as_deref(), tier).await?;
        if let Some(old) = self.splice(track.clone()) {
            old.stop();
        }
        self.captured_tier = Some(tier);
        info!(resolution = %tier, "Video track refreshed");
        Ok(track)
    }

    async fn acquire_video(
        &self,
        camera_id: Option<&str>,
        tier: ResolutionTier,
    ) -> Result<TrackHandle> {
        let constraints = MediaConstraints {
            video: Some(tier.constraints(camera_id)),
            audio: None,
        };
        let stream = self.devices.get_user_media(&constraints).await?;
        stream.track(MediaKind::Video).cloned().ok_or_else(|| {
            stream.stop_all();
            Error::DeviceUnavailable("capture produced no video track".to_string())
        })
    }

    /// Swap `track` into the local stream, returning the track it replaced
    fn splice(&mut self, track: TrackHandle) -> Option<TrackHandle> {
        self.local.as_mut().and_then(|s| s.replace_track(track))
    }
}
