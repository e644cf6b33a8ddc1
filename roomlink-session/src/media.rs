//! Media primitives: tracks, compound streams and the capture device seam

use crate::error::Result;
use crate::types::StreamId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Media kind of a track, producer or consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Settings actually negotiated for a live track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TrackSettings {
    pub width: Option<u32>,
    pub height: Option<u32>,
}

/// A single live media track
pub trait MediaTrack: Send + Sync + fmt::Debug {
    fn id(&self) -> &str;

    fn kind(&self) -> MediaKind;

    /// Capture device this track was opened from, if any
    fn device_id(&self) -> Option<&str>;

    fn settings(&self) -> TrackSettings;

    /// Release the underlying source. Idempotent.
    fn stop(&self);

    fn is_live(&self) -> bool;
}

pub type TrackHandle = Arc<dyn MediaTrack>;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct VideoConstraints {
    /// Exact device match when set
    pub device_id: Option<String>,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AudioConstraints {
    /// Exact device match when set
    pub device_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MediaConstraints {
    pub video: Option<VideoConstraints>,
    pub audio: Option<AudioConstraints>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    VideoInput,
    AudioInput,
    AudioOutput,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub device_id: String,
    pub kind: DeviceKind,
    pub label: String,
}

/// Devices grouped by kind
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInventory {
    pub cameras: Vec<DeviceInfo>,
    pub microphones: Vec<DeviceInfo>,
    pub speakers: Vec<DeviceInfo>,
}

impl DeviceInventory {
    #[must_use]
    pub fn from_devices(devices: Vec<DeviceInfo>) -> Self {
        let mut inventory = Self::default();
        for device in devices {
            match device.kind {
                DeviceKind::VideoInput => inventory.cameras.push(device),
                DeviceKind::AudioInput => inventory.microphones.push(device),
                DeviceKind::AudioOutput => inventory.speakers.push(device),
            }
        }
        inventory
    }
}

/// Capture device access (camera, microphone, enumeration)
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Open the requested sources. May prompt the user; never retried automatically.
    async fn get_user_media(&self, constraints: &MediaConstraints) -> Result<MediaStream>;

    async fn enumerate_devices(&self) -> Result<Vec<DeviceInfo>>;

    /// Fires whenever the set of devices changes
    fn device_changes(&self) -> broadcast::Receiver<()>;
}

/// Ordered collection of tracks with at most one track per kind.
///
/// Clones share the same tracks and the same [`StreamId`].
#[derive(Debug, Clone)]
pub struct MediaStream {
    id: StreamId,
    tracks: Vec<TrackHandle>,
}

impl MediaStream {
    #[must_use]
    pub fn new() -> Self {
        Self {
            id: StreamId::generate(),
            tracks: Vec::new(),
        }
    }

    /// Build a stream, keeping only the first track of each kind
    pub fn with_tracks(tracks: impl IntoIterator<Item = TrackHandle>) -> Self {
        let mut stream = Self::new();
        for track in tracks {
            stream.add_track(track);
        }
        stream
    }

    #[must_use]
    pub const fn id(&self) -> &StreamId {
        &self.id
    }

    #[must_use]
    pub fn tracks(&self) -> &[TrackHandle] {
        &self.tracks
    }

    #[must_use]
    pub fn track(&self, kind: MediaKind) -> Option<&TrackHandle> {
        self.tracks.iter().find(|t| t.kind() == kind)
    }

    pub fn tracks_of(&self, kind: MediaKind) -> impl Iterator<Item = &TrackHandle> + '_ {
        self.tracks.iter().filter(move |t| t.kind() == kind)
    }

    #[must_use]
    pub fn has_kind(&self, kind: MediaKind) -> bool {
        self.track(kind).is_some()
    }

    /// Append a track. Returns `false` and leaves the stream untouched when a
    /// track of the same kind is already present.
    pub fn add_track(&mut self, track: TrackHandle) -> bool {
        if self.has_kind(track.kind()) {
            return false;
        }
        self.tracks.push(track);
        true
    }

    pub fn remove_track(&mut self, track_id: &str) -> Option<TrackHandle> {
        let index = self.tracks.iter().position(|t| t.id() == track_id)?;
        Some(self.tracks.remove(index))
    }

    /// Swap the track of the same kind for `track`, returning the old one.
    pub fn replace_track(&mut self, track: TrackHandle) -> Option<TrackHandle> {
        let old = self
            .tracks
            .iter()
            .position(|t| t.kind() == track.kind())
            .map(|index| self.tracks.remove(index));
        self.tracks.push(track);
        old
    }

    pub fn stop_all(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }
}

impl Default for MediaStream {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::SyntheticTrack;

    #[test]
    fn test_stream_rejects_duplicate_kind() {
        let mut stream = MediaStream::new();
        assert!(stream.add_track(SyntheticTrack::video("cam", 640, 360)));
        assert!(stream.add_track(SyntheticTrack::audio("mic")));
        assert!(!stream.add_track(SyntheticTrack::video("cam-2", 1280, 720)));

        assert_eq!(stream.len(), 2);
        assert_eq!(
            stream.track(MediaKind::Video).unwrap().device_id(),
            Some("cam")
        );
    }

    #[test]
    fn test_replace_track_keeps_stream_identity() {
        let mut stream = MediaStream::with_tracks([SyntheticTrack::video("cam", 640, 360)]);
        let id = stream.id().clone();

        let old = stream
            .replace_track(SyntheticTrack::video("cam-2", 320, 180))
            .unwrap();
        assert_eq!(old.device_id(), Some("cam"));
        assert_eq!(stream.id(), &id);
        assert_eq!(stream.len(), 1);
    }

    #[test]
    fn test_inventory_groups_by_kind() {
        let inventory = DeviceInventory::from_devices(vec![
            DeviceInfo {
                device_id: "cam".to_string(),
                kind: DeviceKind::VideoInput,
                label: "Camera".to_string(),
            },
            DeviceInfo {
                device_id: "spk".to_string(),
                kind: DeviceKind::AudioOutput,
                label: "Speaker".to_string(),
            },
        ]);
        assert_eq!(inventory.cameras.len(), 1);
        assert!(inventory.microphones.is_empty());
        assert_eq!(inventory.speakers[0].device_id, "spk");
    }
}
