//! In-process implementations of every platform seam
//!
//! Synthetic capture devices, a recording audio backend, an SFU client that
//! negotiates without moving media and an in-memory signaling server. They
//! back the demo mode of the binary and the test suites.

mod audio;
mod media;
mod room;
mod sfu;

pub use audio::LoopbackAudio;
pub use media::{LoopbackMediaDevices, SyntheticCamera, SyntheticTrack};
pub use room::LoopbackRoom;
pub use sfu::{LoopbackConsumer, LoopbackProducer, LoopbackSfu};
