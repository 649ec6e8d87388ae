//! # Cantus Audio
//!
//! Audio playback engine for games and interactive tools.
//!
//! This crate provides:
//! - Audio sources: parsed, validated assets with known format and duration
//! - Streams: independent decode cursors over a source
//! - Sound buffers: fully decoded clips played as many overlapping instances
//! - Music buffers: gapless queues of sources with local and global looping
//! - A bounded voice pool with pluggable eviction
//!
//! ## Architecture
//!
//! An [`AudioEngine`] owns a fixed set of hardware voices behind the
//! [`AudioDevice`] trait. Buffers bind voices while they play and feed them
//! PCM chunks. The caller drives everything with one
//! [`AudioEngine::update`] per frame; there are no background threads of
//! our own, and listeners run from inside `update` or the call that caused
//! the event.
//!
//! ## Devices
//!
//! [`AudioEngine::new`] opens the default output through rodio. For tests
//! and servers, [`AudioEngine::with_device`] takes a [`HeadlessDevice`]
//! whose clock only moves when told to.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(clippy::unwrap_used)]

pub mod backend;
pub mod config;
pub(crate) mod decode;
pub mod device;
pub mod engine;
pub mod error;
pub mod music;
pub mod playback;
pub mod sound;
pub mod source;
pub mod stream;
pub mod voice;
pub mod volume;

#[cfg(test)]
pub(crate) mod test_util;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::backend::RodioDevice;
    pub use crate::config::AudioConfig;
    pub use crate::device::{AudioDevice, HeadlessDevice, PcmChunk};
    pub use crate::engine::AudioEngine;
    pub use crate::error::{AudioError, AudioResult};
    pub use crate::music::{MusicBuffer, MusicEvent};
    pub use crate::playback::{
        InstanceControllable, InstanceId, Pausable, Playable, PlaybackState, Seekable,
        SoundControls,
    };
    pub use crate::sound::SoundBuffer;
    pub use crate::source::{AudioFormat, AudioSource};
    pub use crate::stream::AudioStream;
    pub use crate::voice::{EvictionPolicy, LeastRecentlyStarted, VoiceKind, VoiceSnapshot};
    pub use crate::volume::{AudioCategory, VolumeSettings};
}

pub use prelude::*;
