//! Playback capability contracts.
//!
//! Each concrete buffer composes the capabilities it actually has:
//!
//! | Buffer          | Playable | Pausable | Seekable | InstanceControllable |
//! |-----------------|----------|----------|----------|----------------------|
//! | `SoundBuffer`   | yes      | yes      |          | yes                  |
//! | `MusicBuffer`   | yes      | yes      | yes      |                      |

use std::fmt;

use crate::error::AudioResult;

/// Opaque identifier of one sound instance.
///
/// Identifiers increase monotonically per buffer and are never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InstanceId(u64);

impl InstanceId {
    /// Wrap a raw identifier.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the raw ID.
    #[must_use]
    pub const fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Instance id generator.
#[derive(Debug, Default)]
pub(crate) struct InstanceIdGenerator {
    next_id: u64,
}

impl InstanceIdGenerator {
    /// Generate a new unique id.
    pub(crate) fn allocate(&mut self) -> InstanceId {
        let id = InstanceId(self.next_id);
        self.next_id += 1;
        id
    }
}

/// Playback state of a music buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlaybackState {
    /// Never started.
    #[default]
    Idle,
    /// Playing normally.
    Playing,
    /// Paused; resumes where it left off.
    Paused,
    /// Stopped, completed or evicted.
    Stopped,
}

impl PlaybackState {
    /// Check if a voice is held (playing or paused).
    #[must_use]
    pub const fn is_active(&self) -> bool {
        matches!(self, Self::Playing | Self::Paused)
    }
}

/// Per-instance sound controls.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SoundControls {
    /// Volume multiplier (0.0-1.0).
    pub volume: f32,
    /// Pitch/speed multiplier (1.0 = normal).
    pub pitch: f32,
    /// Stereo pan (-1.0 = full left, 0.0 = center, 1.0 = full right).
    pub pan: f32,
    /// Whether the instance restarts when it reaches the end.
    pub looping: bool,
}

impl Default for SoundControls {
    fn default() -> Self {
        Self {
            volume: 1.0,
            pitch: 1.0,
            pan: 0.0,
            looping: false,
        }
    }
}

impl SoundControls {
    /// Create new controls with volume.
    #[must_use]
    pub const fn with_volume(mut self, volume: f32) -> Self {
        self.volume = volume;
        self
    }

    /// Create new controls with pitch.
    #[must_use]
    pub const fn with_pitch(mut self, pitch: f32) -> Self {
        self.pitch = pitch;
        self
    }

    /// Create new controls with pan.
    #[must_use]
    pub const fn with_pan(mut self, pan: f32) -> Self {
        self.pan = pan;
        self
    }

    /// Create new controls with looping.
    #[must_use]
    pub const fn with_looping(mut self, looping: bool) -> Self {
        self.looping = looping;
        self
    }

    /// Clamp values to valid ranges.
    pub fn normalize(&mut self) {
        self.volume = clamp_volume(self.volume);
        self.pitch = clamp_pitch(self.pitch);
        self.pan = clamp_pan(self.pan);
    }
}

pub(crate) fn clamp_volume(volume: f32) -> f32 {
    volume.clamp(0.0, 1.0)
}

pub(crate) fn clamp_pitch(pitch: f32) -> f32 {
    pitch.clamp(0.1, 4.0)
}

pub(crate) fn clamp_pan(pan: f32) -> f32 {
    pan.clamp(-1.0, 1.0)
}

/// Something that can be started and stopped.
pub trait Playable {
    /// What a successful start hands back.
    type Handle;

    /// Start playback, binding a voice.
    ///
    /// Fails with `ResourceExhausted` when no voice can be freed; playback
    /// then simply does not start.
    fn play(&self) -> AudioResult<Self::Handle>;

    /// Stop playback and release the voice.
    fn stop(&self);

    /// Whether anything is audibly playing.
    fn is_active(&self) -> bool;
}

/// Something that can be paused in place.
pub trait Pausable {
    /// Pause without losing position.
    fn pause(&self);

    /// Resume a local pause.
    fn resume(&self);

    /// Whether playback is held by a pause.
    fn is_paused(&self) -> bool;
}

/// Something with a single timeline that can be repositioned.
pub trait Seekable {
    /// Current position in seconds.
    fn position(&self) -> f64;

    /// Move to `seconds`, clamped to `[0, duration]`.
    fn set_position(&self, seconds: f64);

    /// Total length in seconds.
    fn duration(&self) -> f64;
}

/// Per-instance control of overlapping playback.
///
/// None of these ever fail. An id the buffer does not know (stale,
/// completed, evicted or never issued) makes setters a no-op and getters
/// answer with a sentinel.
pub trait InstanceControllable {
    /// Stop one instance. No completion callback fires.
    fn stop_instance(&self, id: InstanceId);

    /// Pause one instance.
    fn pause_instance(&self, id: InstanceId);

    /// Resume one instance.
    fn resume_instance(&self, id: InstanceId);

    /// Whether the instance is bound and unpaused. `false` if unknown.
    fn is_playing(&self, id: InstanceId) -> bool;

    /// Instance volume. `-1.0` if unknown.
    fn volume(&self, id: InstanceId) -> f32;

    /// Set instance volume (0.0 - 1.0).
    fn set_volume(&self, id: InstanceId, volume: f32);

    /// Instance pitch. `1.0` if unknown.
    fn pitch(&self, id: InstanceId) -> f32;

    /// Set instance pitch (0.1 - 4.0).
    fn set_pitch(&self, id: InstanceId, pitch: f32);

    /// Instance pan. `0.0` if unknown.
    fn pan(&self, id: InstanceId) -> f32;

    /// Set instance pan (-1.0 - 1.0).
    fn set_pan(&self, id: InstanceId, pan: f32);

    /// Whether the instance loops. `false` if unknown.
    fn is_looping(&self, id: InstanceId) -> bool;

    /// Set whether the instance loops.
    fn set_looping(&self, id: InstanceId, looping: bool);

    /// Instance position in seconds. `-1.0` if unknown.
    fn position(&self, id: InstanceId) -> f64;

    /// Move an instance to `seconds`, clamped to the asset.
    fn set_position(&self, id: InstanceId, seconds: f64);
}
