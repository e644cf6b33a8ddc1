use crate::error::{Error, Result};
use crate::media::{
    DeviceInfo, DeviceKind, MediaConstraints, MediaDevices, MediaKind, MediaStream, MediaTrack,
    TrackHandle, TrackSettings,
};
use crate::types::generate_id;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Track with fixed settings and no real source
#[derive(Debug)]
pub struct SyntheticTrack {
    id: String,
    kind: MediaKind,
    device_id: Option<String>,
    settings: TrackSettings,
    live: AtomicBool,
    live_count: Option<Arc<AtomicUsize>>,
}

impl SyntheticTrack {
    pub fn video(device_id: &str, width: u32, height: u32) -> TrackHandle {
        Arc::new(Self::build(
            MediaKind::Video,
            Some(device_id),
            TrackSettings {
                width: Some(width),
                height: Some(height),
            },
            None,
        ))
    }

    pub fn audio(device_id: &str) -> TrackHandle {
        Arc::new(Self::build(
            MediaKind::Audio,
            Some(device_id),
            TrackSettings::default(),
            None,
        ))
    }

    /// Track not bound to any capture device (processed or remote media)
    pub fn detached(kind: MediaKind) -> TrackHandle {
        let settings = match kind {
            MediaKind::Video => TrackSettings {
                width: Some(640),
                height: Some(360),
            },
            MediaKind::Audio => TrackSettings::default(),
        };
        Arc::new(Self::build(kind, None, settings, None))
    }

    fn build(
        kind: MediaKind,
        device_id: Option<&str>,
        settings: TrackSettings,
        live_count: Option<Arc<AtomicUsize>>,
    ) -> Self {
        if let Some(count) = &live_count {
            count.fetch_add(1, Ordering::SeqCst);
        }
        Self {
            id: generate_id(),
            kind,
            device_id: device_id.map(str::to_string),
            settings,
            live: AtomicBool::new(true),
            live_count,
        }
    }
}

impl MediaTrack for SyntheticTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn device_id(&self) -> Option<&str> {
        self.device_id.as_deref()
    }

    fn settings(&self) -> TrackSettings {
        self.settings
    }

    fn stop(&self) {
        if self.live.swap(false, Ordering::SeqCst) {
            if let Some(count) = &self.live_count {
                count.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }

    fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }
}

/// Camera with a fixed set of native modes
#[derive(Debug, Clone)]
pub struct SyntheticCamera {
    id: String,
    modes: Vec<(u32, u32)>,
}

impl SyntheticCamera {
    pub fn new(id: &str, modes: &[(u32, u32)]) -> Self {
        Self {
            id: id.to_string(),
            modes: modes.to_vec(),
        }
    }

    /// Largest native mode fitting the request, else the smallest one
    fn negotiate(&self, width: u32, height: u32) -> (u32, u32) {
        let area = |&(w, h): &(u32, u32)| u64::from(w) * u64::from(h);
        self.modes
            .iter()
            .filter(|(w, h)| *w <= width && *h <= height)
            .max_by_key(|mode| area(mode))
            .or_else(|| self.modes.iter().min_by_key(|mode| area(mode)))
            .copied()
            .unwrap_or((width, height))
    }
}

/// In-memory capture devices
pub struct LoopbackMediaDevices {
    cameras: Vec<SyntheticCamera>,
    microphones: Vec<String>,
    speakers: Vec<String>,
    denied: AtomicBool,
    live: Arc<AtomicUsize>,
    acquisitions: AtomicUsize,
    changes: broadcast::Sender<()>,
}

impl Default for LoopbackMediaDevices {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackMediaDevices {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(16);
        Self {
            cameras: Vec::new(),
            microphones: Vec::new(),
            speakers: Vec::new(),
            denied: AtomicBool::new(false),
            live: Arc::new(AtomicUsize::new(0)),
            acquisitions: AtomicUsize::new(0),
            changes,
        }
    }

    /// Two cameras, two microphones and one speaker
    pub fn standard() -> Self {
        Self::new()
            .with_camera(SyntheticCamera::new(
                "cam-1",
                &[(320, 180), (640, 360), (854, 480), (1280, 720)],
            ))
            .with_camera(SyntheticCamera::new("cam-2", &[(320, 180), (640, 360)]))
            .with_microphone("mic-1")
            .with_microphone("mic-2")
            .with_speaker("speaker-1")
    }

    #[must_use]
    pub fn with_camera(mut self, camera: SyntheticCamera) -> Self {
        self.cameras.push(camera);
        self
    }

    #[must_use]
    pub fn with_microphone(mut self, id: &str) -> Self {
        self.microphones.push(id.to_string());
        self
    }

    #[must_use]
    pub fn with_speaker(mut self, id: &str) -> Self {
        self.speakers.push(id.to_string());
        self
    }

    /// Simulate the user refusing capture permission
    pub fn deny_access(&self, denied: bool) {
        self.denied.store(denied, Ordering::SeqCst);
    }

    /// Tracks handed out and not yet stopped
    pub fn live_tracks(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Number of capture requests served so far
    pub fn acquisitions(&self) -> usize {
        self.acquisitions.load(Ordering::SeqCst)
    }

    /// Announce a device plug or unplug
    pub fn notify_change(&self) {
        let _ = self.changes.send(());
    }

    fn camera(&self, device_id: Option<&str>) -> Result<&SyntheticCamera> {
        match device_id {
            Some(id) => self
                .cameras
                .iter()
                .find(|camera| camera.id == id)
                .ok_or_else(|| Error::DeviceUnavailable(format!("camera {id} not found"))),
            None => self
                .cameras
                .first()
                .ok_or_else(|| Error::DeviceUnavailable("no camera present".to_string())),
        }
    }

    fn microphone(&self, device_id: Option<&str>) -> Result<&str> {
        match device_id {
            Some(id) => self
                .microphones
                .iter()
                .find(|mic| *mic == id)
                .map(String::as_str)
                .ok_or_else(|| Error::DeviceUnavailable(format!("microphone {id} not found"))),
            None => self
                .microphones
                .first()
                .map(String::as_str)
                .ok_or_else(|| Error::DeviceUnavailable("no microphone present".to_string())),
        }
    }
}

#[async_trait]
impl MediaDevices for LoopbackMediaDevices {
    async fn get_user_media(&self, constraints: &MediaConstraints) -> Result<MediaStream> {
        self.acquisitions.fetch_add(1, Ordering::SeqCst);
        if self.denied.load(Ordering::SeqCst) {
            return Err(Error::DeviceUnavailable("permission denied".to_string()));
        }

        // Resolve everything before creating tracks so failures leak nothing
        let video = match &constraints.video {
            Some(video) => {
                let camera = self.camera(video.device_id.as_deref())?;
                Some((camera.id.clone(), camera.negotiate(video.width, video.height)))
            }
            None => None,
        };
        let audio = match &constraints.audio {
            Some(audio) => Some(self.microphone(audio.device_id.as_deref())?.to_string()),
            None => None,
        };

        let mut stream = MediaStream::new();
        if let Some((device_id, (width, height))) = video {
            stream.add_track(Arc::new(SyntheticTrack::build(
                MediaKind::Video,
                Some(&device_id),
                TrackSettings {
                    width: Some(width),
                    height: Some(height),
                },
                Some(self.live.clone()),
            )));
        }
        if let Some(device_id) = audio {
            stream.add_track(Arc::new(SyntheticTrack::build(
                MediaKind::Audio,
                Some(&device_id),
                TrackSettings::default(),
                Some(self.live.clone()),
            )));
        }
        Ok(stream)
    }

    async fn enumerate_devices(&self) -> Result<Vec<DeviceInfo>> {
        let cameras = self.cameras.iter().map(|camera| (camera.id.as_str(), DeviceKind::VideoInput));
        let microphones = self
            .microphones
            .iter()
            .map(|id| (id.as_str(), DeviceKind::AudioInput));
        let speakers = self
            .speakers
            .iter()
            .map(|id| (id.as_str(), DeviceKind::AudioOutput));

        Ok(cameras
            .chain(microphones)
            .chain(speakers)
            .map(|(id, kind)| DeviceInfo {
                device_id: id.to_string(),
                kind,
                label: format!("Loopback {id}"),
            })
            .collect())
    }

    fn device_changes(&self) -> broadcast::Receiver<()> {
        self.changes.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{AudioConstraints, VideoConstraints};

    #[test]
    fn test_camera_clamps_to_native_mode() {
        let camera = SyntheticCamera::new("c", &[(640, 360), (1280, 720)]);
        assert_eq!(camera.negotiate(854, 480), (640, 360));
        assert_eq!(camera.negotiate(320, 180), (640, 360));
        assert_eq!(camera.negotiate(1920, 1080), (1280, 720));
    }

    #[tokio::test]
    async fn test_unknown_device_leaks_no_tracks() {
        let devices = LoopbackMediaDevices::standard();
        let constraints = MediaConstraints {
            video: Some(VideoConstraints {
                device_id: None,
                width: 640,
                height: 360,
            }),
            audio: Some(AudioConstraints {
                device_id: Some("missing".to_string()),
            }),
        };

        assert!(devices.get_user_media(&constraints).await.is_err());
        assert_eq!(devices.live_tracks(), 0);
        assert_eq!(devices.acquisitions(), 1);
    }

    #[tokio::test]
    async fn test_enumerate_reports_every_kind() {
        let devices = LoopbackMediaDevices::standard();
        let listed = devices.enumerate_devices().await.unwrap();
        assert_eq!(listed.len(), 5);
        assert_eq!(listed[4].kind, DeviceKind::AudioOutput);
    }
}
