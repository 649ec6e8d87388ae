//! Hardware boundary.
//!
//! An [`AudioDevice`] exposes a fixed set of indexed voices. Each voice
//! plays PCM chunks from its own FIFO queue; the engine keeps a few chunks
//! queued per voice and learns about progress by watching the queue drain.
//!
//! Two implementations ship with the crate:
//!
//! - [`RodioDevice`](crate::backend::RodioDevice): the default output
//!   device, one rodio sink per voice.
//! - [`HeadlessDevice`]: no hardware at all. Queued audio is consumed only
//!   when [`HeadlessDevice::advance`] is called, which makes playback fully
//!   deterministic for tests and servers.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::Duration;

/// One block of interleaved 16-bit PCM ready for a voice queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PcmChunk {
    /// Interleaved samples.
    pub samples: Vec<i16>,
    /// Number of channels (1 or 2).
    pub channels: u16,
    /// Sample rate in Hz.
    pub sample_rate: u32,
}

impl PcmChunk {
    /// Create a new chunk.
    #[must_use]
    pub fn new(samples: Vec<i16>, channels: u16, sample_rate: u32) -> Self {
        Self {
            samples,
            channels,
            sample_rate,
        }
    }

    /// Number of frames in the chunk.
    #[must_use]
    pub fn frames(&self) -> u64 {
        self.samples.len() as u64 / u64::from(self.channels.max(1))
    }

    /// Playback length at normal speed.
    #[must_use]
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.frames() as f64 / f64::from(self.sample_rate))
    }
}

/// A set of hardware playback voices.
///
/// Voice indices run from `0` to `voice_count() - 1`. Implementations never
/// fail at runtime: an out-of-range index is ignored.
pub trait AudioDevice {
    /// Number of voices this device can drive.
    fn voice_count(&self) -> usize;

    /// Append a chunk to a voice's queue.
    fn queue(&mut self, voice: usize, chunk: PcmChunk);

    /// Chunks still queued on a voice, including the one being played.
    fn queued(&self, voice: usize) -> usize;

    /// Frames of the head chunk already played.
    fn head_frames_played(&self, voice: usize) -> u64;

    /// Start or continue consuming the queue.
    fn play(&mut self, voice: usize);

    /// Stop consuming the queue without discarding it.
    fn pause(&mut self, voice: usize);

    /// Discard everything queued on a voice.
    ///
    /// The paused flag, volume, pan and speed survive a clear.
    fn clear(&mut self, voice: usize);

    /// Set linear gain (0.0 - 1.0).
    fn set_volume(&mut self, voice: usize, volume: f32);

    /// Set stereo pan (-1.0 = left, 1.0 = right).
    fn set_pan(&mut self, voice: usize, pan: f32);

    /// Set playback speed (also shifts pitch).
    fn set_speed(&mut self, voice: usize, speed: f32);
}

/// Per-voice state of a [`HeadlessDevice`].
#[derive(Debug, Clone)]
pub struct HeadlessVoice {
    queue: VecDeque<PcmChunk>,
    head_played: f64,
    /// Whether the voice is paused.
    pub paused: bool,
    /// Linear gain.
    pub volume: f32,
    /// Stereo pan.
    pub pan: f32,
    /// Playback speed.
    pub speed: f32,
    /// Frames consumed since creation.
    pub frames_played: u64,
}

impl Default for HeadlessVoice {
    fn default() -> Self {
        Self {
            queue: VecDeque::new(),
            head_played: 0.0,
            paused: false,
            volume: 1.0,
            pan: 0.0,
            speed: 1.0,
            frames_played: 0,
        }
    }
}

impl HeadlessVoice {
    fn advance(&mut self, dt: Duration) {
        if self.paused {
            return;
        }
        let mut budget = dt.as_secs_f64() * f64::from(self.speed);
        while budget > 0.0 {
            let Some(head) = self.queue.front() else {
                break;
            };
            let rate = f64::from(head.sample_rate.max(1));
            let left = head.frames() as f64 - self.head_played;
            let wanted = budget * rate;
            if wanted >= left {
                budget -= left / rate;
                self.frames_played += left.round() as u64;
                self.queue.pop_front();
                self.head_played = 0.0;
            } else {
                self.head_played += wanted;
                self.frames_played += wanted.round() as u64;
                budget = 0.0;
            }
        }
    }

    /// Chunks waiting on this voice.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.queue.len()
    }
}

/// Device with no hardware behind it.
///
/// Cloning yields another handle to the same voices, so a test can keep
/// one handle to drive the clock while the engine owns the other.
#[derive(Debug, Clone)]
pub struct HeadlessDevice {
    voices: Rc<RefCell<Vec<HeadlessVoice>>>,
}

impl HeadlessDevice {
    /// Create a device with `voices` voices.
    #[must_use]
    pub fn new(voices: usize) -> Self {
        Self {
            voices: Rc::new(RefCell::new(vec![HeadlessVoice::default(); voices])),
        }
    }

    /// Let every unpaused voice consume `dt` worth of audio.
    pub fn advance(&self, dt: Duration) {
        for voice in self.voices.borrow_mut().iter_mut() {
            voice.advance(dt);
        }
    }

    /// Snapshot of one voice.
    #[must_use]
    pub fn voice(&self, voice: usize) -> Option<HeadlessVoice> {
        self.voices.borrow().get(voice).cloned()
    }

    fn with_voice(&self, voice: usize, f: impl FnOnce(&mut HeadlessVoice)) {
        if let Some(state) = self.voices.borrow_mut().get_mut(voice) {
            f(state);
        }
    }
}

impl AudioDevice for HeadlessDevice {
    fn voice_count(&self) -> usize {
        self.voices.borrow().len()
    }

    fn queue(&mut self, voice: usize, chunk: PcmChunk) {
        self.with_voice(voice, |v| v.queue.push_back(chunk));
    }

    fn queued(&self, voice: usize) -> usize {
        self.voices.borrow().get(voice).map_or(0, HeadlessVoice::queued)
    }

    fn head_frames_played(&self, voice: usize) -> u64 {
        self.voices
            .borrow()
            .get(voice)
            .map_or(0, |v| v.head_played.round() as u64)
    }

    fn play(&mut self, voice: usize) {
        self.with_voice(voice, |v| v.paused = false);
    }

    fn pause(&mut self, voice: usize) {
        self.with_voice(voice, |v| v.paused = true);
    }

    fn clear(&mut self, voice: usize) {
        self.with_voice(voice, |v| {
            v.queue.clear();
            v.head_played = 0.0;
        });
    }

    fn set_volume(&mut self, voice: usize, volume: f32) {
        self.with_voice(voice, |v| v.volume = volume);
    }

    fn set_pan(&mut self, voice: usize, pan: f32) {
        self.with_voice(voice, |v| v.pan = pan);
    }

    fn set_speed(&mut self, voice: usize, speed: f32) {
        self.with_voice(voice, |v| v.speed = speed);
    }
}
