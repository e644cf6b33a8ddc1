use super::media::SyntheticTrack;
use crate::audio::{AudioBackend, AudioContext, GainNode, SourceTap};
use crate::error::{Error, Result};
use crate::media::{MediaKind, TrackHandle};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Default)]
struct AudioCounters {
    contexts_created: AtomicUsize,
    open_contexts: AtomicUsize,
    active_taps: AtomicUsize,
    gains: Mutex<Vec<Arc<LoopbackGain>>>,
    last_sink: Mutex<Option<String>>,
}

/// Audio backend that records graph operations instead of processing audio
#[derive(Default)]
pub struct LoopbackAudio {
    counters: Arc<AudioCounters>,
}

impl LoopbackAudio {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contexts_created(&self) -> usize {
        self.counters.contexts_created.load(Ordering::SeqCst)
    }

    pub fn open_contexts(&self) -> usize {
        self.counters.open_contexts.load(Ordering::SeqCst)
    }

    pub fn gain_nodes_created(&self) -> usize {
        self.counters.gains.lock().len()
    }

    pub fn active_taps(&self) -> usize {
        self.counters.active_taps.load(Ordering::SeqCst)
    }

    /// Current value of every gain node, in creation order
    pub fn last_gain_values(&self) -> Vec<f32> {
        self.counters.gains.lock().iter().map(|g| g.gain()).collect()
    }

    /// Sink of the most recent output routing; `None` means the default output
    pub fn last_sink(&self) -> Option<String> {
        self.counters.last_sink.lock().clone()
    }
}

impl AudioBackend for LoopbackAudio {
    fn create_context(&self) -> Result<Arc<dyn AudioContext>> {
        self.counters.contexts_created.fetch_add(1, Ordering::SeqCst);
        self.counters.open_contexts.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(LoopbackContext {
            counters: self.counters.clone(),
            taps: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }))
    }
}

struct LoopbackGain {
    value: Mutex<f32>,
}

impl GainNode for LoopbackGain {
    fn set_gain(&self, value: f32) {
        *self.value.lock() = value;
    }

    fn gain(&self) -> f32 {
        *self.value.lock()
    }
}

struct LoopbackTap {
    counters: Arc<AudioCounters>,
    connected: AtomicBool,
}

impl LoopbackTap {
    fn disconnect(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            self.counters.active_taps.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

struct TapHandle(Arc<LoopbackTap>);

impl SourceTap for TapHandle {
    fn disconnect(&self) {
        self.0.disconnect();
    }
}

struct LoopbackContext {
    counters: Arc<AudioCounters>,
    taps: Mutex<Vec<Arc<LoopbackTap>>>,
    closed: AtomicBool,
}

impl LoopbackContext {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(Error::AudioGraph("audio context closed".to_string()))
        } else {
            Ok(())
        }
    }
}

impl AudioContext for LoopbackContext {
    fn create_gain(&self) -> Result<Arc<dyn GainNode>> {
        self.ensure_open()?;
        let gain = Arc::new(LoopbackGain {
            value: Mutex::new(1.0),
        });
        self.counters.gains.lock().push(gain.clone());
        Ok(gain)
    }

    fn tap(&self, track: &TrackHandle, _gain: &Arc<dyn GainNode>) -> Result<Box<dyn SourceTap>> {
        self.ensure_open()?;
        if track.kind() != MediaKind::Audio || !track.is_live() {
            return Err(Error::AudioGraph(format!(
                "track {} cannot feed an audio graph",
                track.id()
            )));
        }
        let tap = Arc::new(LoopbackTap {
            counters: self.counters.clone(),
            connected: AtomicBool::new(true),
        });
        self.counters.active_taps.fetch_add(1, Ordering::SeqCst);
        self.taps.lock().push(tap.clone());
        Ok(Box::new(TapHandle(tap)))
    }

    fn destination(&self, _gain: &Arc<dyn GainNode>) -> Result<TrackHandle> {
        self.ensure_open()?;
        Ok(SyntheticTrack::detached(MediaKind::Audio))
    }

    fn route_to_output(&self, _gain: &Arc<dyn GainNode>, sink_id: Option<&str>) -> Result<()> {
        self.ensure_open()?;
        *self.counters.last_sink.lock() = sink_id.map(str::to_string);
        Ok(())
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for tap in self.taps.lock().drain(..) {
            tap.disconnect();
        }
        self.counters.open_contexts.fetch_sub(1, Ordering::SeqCst);
    }
}
