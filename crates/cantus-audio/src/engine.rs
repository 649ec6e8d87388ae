//! The audio engine.
//!
//! [`AudioEngine`] owns the output device and the voice pool. It is the
//! factory for sources, sound buffers and music buffers, and it is driven by
//! one [`AudioEngine::update`] call per frame from the caller's loop.
//!
//! Each update does a bounded slice of work per bound voice:
//!
//! 1. retire chunks the device has finished playing
//! 2. announce queued events whose chunk has started
//! 3. top the voice queue back up to `queue_depth` chunks
//! 4. release voices whose playback has fully drained
//!
//! User callbacks run after the engine state is released, so they are free
//! to call back into the engine.
//!
//! Everything here is single-threaded: the engine, its buffers and their
//! callbacks must all live on the thread that created the engine.
//!
//! # Example
//!
//! ```ignore
//! let engine = AudioEngine::new(AudioConfig::default())?;
//! let theme = engine.new_source("theme.ogg", std::fs::File::open(path)?)?;
//! let music = engine.new_music(&[theme]);
//! music.play()?;
//!
//! loop {
//!     engine.update();
//!     // ... rest of the frame
//! }
//! ```

use std::cell::RefCell;
use std::io::Read;
use std::rc::{Rc, Weak};

use tracing::{debug, info, warn};

use crate::backend::RodioDevice;
use crate::config::AudioConfig;
use crate::device::AudioDevice;
use crate::error::{AudioError, AudioResult};
use crate::music::MusicBuffer;
use crate::sound::SoundBuffer;
use crate::source::AudioSource;
use crate::voice::{
    ChunkMeta, EvictionPolicy, LeastRecentlyStarted, PauseOrigin, VoiceClient, VoiceKind,
    VoiceLease, VoicePool, VoiceSnapshot,
};
use crate::volume::{AudioCategory, VolumeSettings};

/// Parameters of a new voice binding.
#[derive(Debug, Clone, Copy)]
pub(crate) struct VoiceRequest {
    pub kind: VoiceKind,
    pub evictable: bool,
    pub volume: f32,
    pub pan: f32,
    pub speed: f32,
}

/// Engine state shared with every buffer.
pub(crate) struct EngineCore {
    device: Box<dyn AudioDevice>,
    pool: VoicePool,
    volumes: VolumeSettings,
    config: AudioConfig,
    paused: bool,
}

impl std::fmt::Debug for EngineCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineCore")
            .field("pool", &self.pool)
            .field("volumes", &self.volumes)
            .field("config", &self.config)
            .field("paused", &self.paused)
            .finish_non_exhaustive()
    }
}

pub(crate) type SharedCore = Rc<RefCell<EngineCore>>;
pub(crate) type WeakCore = Weak<RefCell<EngineCore>>;

impl EngineCore {
    pub fn config(&self) -> &AudioConfig {
        &self.config
    }

    /// Bind a voice for `client`, evicting if the pool is full.
    pub fn bind(
        &mut self,
        client: Weak<dyn VoiceClient>,
        request: VoiceRequest,
    ) -> AudioResult<VoiceLease> {
        let voice = match self.pool.free_slot() {
            Some(voice) => voice,
            None => {
                let Some(victim) = self.pool.choose_victim() else {
                    warn!(
                        "No evictable voice for new {:?} playback ({} voices bound)",
                        request.kind,
                        self.pool.capacity()
                    );
                    return Err(AudioError::ResourceExhausted {
                        capacity: self.pool.capacity(),
                    });
                };
                if let Some(evicted) = self.pool.vacate(victim) {
                    warn!(
                        "Evicting voice {} ({:?}, tag {})",
                        victim, evicted.kind, evicted.tag
                    );
                }
                victim
            },
        };

        let gain = self.volumes.effective(request.kind.category()) * request.volume;
        self.device.clear(voice);
        self.device.set_volume(voice, gain);
        self.device.set_pan(voice, request.pan);
        self.device.set_speed(voice, request.speed);

        let lease = self.pool.occupy(
            voice,
            client,
            request.kind,
            request.evictable,
            request.volume,
        );
        if self.paused {
            // Started under a global pause; the global resume releases it
            if let Some(binding) = self.pool.get_mut(lease) {
                binding.pause = PauseOrigin::Global;
            }
            self.device.pause(voice);
        } else {
            self.device.play(voice);
        }

        debug!("Bound voice {} to {:?} (tag {})", voice, request.kind, lease.tag);
        Ok(lease)
    }

    /// Release a voice if the lease still holds it.
    pub fn release(&mut self, lease: VoiceLease) {
        if self.pool.get(lease).is_some() {
            self.pool.vacate(lease.voice);
            self.device.clear(lease.voice);
        }
    }

    pub fn is_bound(&self, lease: VoiceLease) -> bool {
        self.pool.get(lease).is_some()
    }

    /// Drop everything queued on a voice so the client can refill it.
    pub fn flush(&mut self, lease: VoiceLease) {
        if let Some(binding) = self.pool.get_mut(lease) {
            binding.reset_queue();
            self.device.clear(lease.voice);
        }
    }

    /// Let an exhausted voice ask its client for more audio.
    pub fn rearm(&mut self, lease: VoiceLease) {
        if let Some(binding) = self.pool.get_mut(lease) {
            binding.exhausted = false;
        }
    }

    pub fn pause_voice(&mut self, lease: VoiceLease) {
        if let Some(binding) = self.pool.get_mut(lease) {
            binding.pause = PauseOrigin::Local;
            self.device.pause(lease.voice);
        }
    }

    pub fn resume_voice(&mut self, lease: VoiceLease) {
        let globally_paused = self.paused;
        let Some(binding) = self.pool.get_mut(lease) else {
            return;
        };
        if globally_paused {
            // Stays silent until the global resume
            binding.pause = PauseOrigin::Global;
            return;
        }
        binding.pause = PauseOrigin::None;
        self.device.play(lease.voice);
    }

    pub fn is_voice_paused(&self, lease: VoiceLease) -> bool {
        self.pool
            .get(lease)
            .is_some_and(|b| b.pause != PauseOrigin::None)
    }

    pub fn set_voice_volume(&mut self, lease: VoiceLease, volume: f32) {
        let Some(binding) = self.pool.get_mut(lease) else {
            return;
        };
        binding.volume = volume;
        let gain = self.volumes.effective(binding.kind.category()) * volume;
        self.device.set_volume(lease.voice, gain);
    }

    pub fn set_voice_pan(&mut self, lease: VoiceLease, pan: f32) {
        if self.is_bound(lease) {
            self.device.set_pan(lease.voice, pan);
        }
    }

    pub fn set_voice_speed(&mut self, lease: VoiceLease, speed: f32) {
        if self.is_bound(lease) {
            self.device.set_speed(lease.voice, speed);
        }
    }

    /// Entry and frame currently being heard on a voice.
    ///
    /// `None` if the lease is stale or nothing has been queued yet.
    pub fn progress(&self, lease: VoiceLease) -> Option<(u64, u64)> {
        let binding = self.pool.get(lease)?;
        let queued = self.device.queued(lease.voice);
        let finished = binding.in_flight.len().saturating_sub(queued);
        match binding.in_flight.get(finished) {
            Some(head) => {
                let played = self.device.head_frames_played(lease.voice).min(head.frames);
                Some((head.entry, head.start_frame + played))
            },
            None => binding
                .in_flight
                .back()
                .map(|last| (last.entry, last.start_frame + last.frames)),
        }
    }

    /// Whether a queued chunk carries an event that has not started yet.
    pub fn pending_boundary(&self, lease: VoiceLease) -> bool {
        self.pool.get(lease).is_some_and(|binding| {
            binding
                .in_flight
                .iter()
                .any(|chunk| chunk.marker.is_some() && !chunk.announced)
        })
    }

    /// Run one update step on a voice.
    ///
    /// Returns the client that was serviced so the caller can dispatch its
    /// notifications once the core is no longer borrowed.
    pub fn service(&mut self, voice: usize) -> Option<Rc<dyn VoiceClient>> {
        let chunk_frames = self.config.chunk_frames;
        let depth = self.config.queue_depth;
        let device = &mut self.device;
        let binding = self.pool.slot_mut(voice)?;

        let Some(client) = binding.client.upgrade() else {
            debug!("Owner of voice {} is gone, releasing", voice);
            self.pool.vacate(voice);
            self.device.clear(voice);
            return None;
        };
        let tag = binding.tag;

        // Retire what the device has finished
        let queued = device.queued(voice);
        while binding.in_flight.len() > queued {
            let Some(done) = binding.in_flight.pop_front() else {
                break;
            };
            if let (false, Some(event)) = (done.announced, done.marker) {
                client.started(tag, done.entry, event);
            }
        }

        // The head has started unless the voice is held by a pause
        if binding.pause == PauseOrigin::None {
            if let Some(head) = binding.in_flight.front_mut() {
                if !head.announced {
                    head.announced = true;
                    if let Some(event) = head.marker.clone() {
                        client.started(tag, head.entry, event);
                    }
                }
            }
        }

        while !binding.exhausted && binding.in_flight.len() < depth {
            match client.fill(tag, chunk_frames) {
                Some(filled) => {
                    binding.in_flight.push_back(ChunkMeta {
                        entry: filled.entry,
                        start_frame: filled.start_frame,
                        frames: filled.chunk.frames(),
                        marker: filled.marker,
                        announced: false,
                    });
                    device.queue(voice, filled.chunk);
                },
                None => binding.exhausted = true,
            }
        }

        if binding.exhausted && binding.in_flight.is_empty() {
            self.pool.vacate(voice);
            self.device.clear(voice);
            client.drained(tag);
        }

        Some(client)
    }

    /// Service every bound voice.
    fn service_all(&mut self) -> Vec<Rc<dyn VoiceClient>> {
        (0..self.pool.capacity())
            .filter_map(|voice| self.service(voice))
            .collect()
    }

    fn pause_all(&mut self) {
        self.paused = true;
        let device = &mut self.device;
        for (voice, binding) in self.pool.bindings_mut() {
            if binding.pause == PauseOrigin::None {
                binding.pause = PauseOrigin::Global;
                device.pause(voice);
            }
        }
    }

    fn resume_all(&mut self) {
        self.paused = false;
        let device = &mut self.device;
        for (voice, binding) in self.pool.bindings_mut() {
            if binding.pause == PauseOrigin::Global {
                binding.pause = PauseOrigin::None;
                device.play(voice);
            }
        }
    }

    fn stop_all(&mut self) {
        for voice in 0..self.pool.capacity() {
            if self.pool.vacate(voice).is_some() {
                self.device.clear(voice);
            }
        }
    }

    fn set_category_volume(&mut self, category: AudioCategory, volume: f32) {
        self.volumes.set(category, volume);
        let volumes = &self.volumes;
        let device = &mut self.device;
        for (voice, binding) in self.pool.bindings_mut() {
            device.set_volume(voice, volumes.effective(binding.kind.category()) * binding.volume);
        }
    }
}

/// Run deferred client notifications.
pub(crate) fn dispatch_all(clients: Vec<Rc<dyn VoiceClient>>) {
    for client in clients {
        client.dispatch();
    }
}

/// Audio engine: output device, voice pool and buffer factory.
///
/// Construct exactly one per program in the composition root and pass it
/// by reference to whatever needs playback.
pub struct AudioEngine {
    core: SharedCore,
}

impl std::fmt::Debug for AudioEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioEngine")
            .field("capacity", &self.capacity())
            .field("active_voices", &self.active_voices())
            .field("paused", &self.is_paused())
            .finish()
    }
}

impl AudioEngine {
    /// Create an engine on the default output device.
    pub fn new(config: AudioConfig) -> AudioResult<Self> {
        let mut config = config;
        config.validate();
        let device = RodioDevice::new(config.max_voices)?;
        Ok(Self::with_device(config, device))
    }

    /// Create an engine on an explicit device.
    #[must_use]
    pub fn with_device(config: AudioConfig, device: impl AudioDevice + 'static) -> Self {
        let mut config = config;
        config.validate();
        let capacity = config.max_voices.min(device.voice_count());

        info!(
            "Audio engine initialized: {} voices, {} frames/chunk, queue depth {}",
            capacity, config.chunk_frames, config.queue_depth
        );

        Self {
            core: Rc::new(RefCell::new(EngineCore {
                device: Box::new(device),
                pool: VoicePool::new(capacity, Box::new(LeastRecentlyStarted)),
                volumes: VolumeSettings::from_config(&config),
                config,
                paused: false,
            })),
        }
    }

    /// Replace the eviction policy.
    #[must_use]
    pub fn with_policy(self, policy: impl EvictionPolicy + 'static) -> Self {
        self.core.borrow_mut().pool.set_policy(Box::new(policy));
        self
    }

    /// Number of voices. Fixed for the engine's lifetime.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.core.borrow().pool.capacity()
    }

    /// Number of voices currently bound.
    #[must_use]
    pub fn active_voices(&self) -> usize {
        self.core.borrow().pool.active()
    }

    /// Snapshot of every bound voice.
    #[must_use]
    pub fn voices(&self) -> Vec<VoiceSnapshot> {
        self.core.borrow().pool.snapshots()
    }

    /// The validated configuration.
    #[must_use]
    pub fn config(&self) -> AudioConfig {
        self.core.borrow().config.clone()
    }

    /// Parse an asset from an already-opened handle.
    pub fn new_source(&self, name: impl Into<String>, reader: impl Read) -> AudioResult<AudioSource> {
        AudioSource::from_reader(name, reader)
    }

    /// Decode `source` fully into a new sound buffer.
    pub fn new_sound(&self, source: &AudioSource) -> AudioResult<SoundBuffer> {
        SoundBuffer::new(Rc::downgrade(&self.core), source)
    }

    /// Create a music buffer queueing `sources` in order.
    #[must_use]
    pub fn new_music(&self, sources: &[AudioSource]) -> MusicBuffer {
        MusicBuffer::new(Rc::downgrade(&self.core), sources)
    }

    /// Advance every bound voice by one bounded slice of work.
    ///
    /// Call once per frame.
    pub fn update(&self) {
        let touched = self.core.borrow_mut().service_all();
        dispatch_all(touched);
    }

    /// Pause every playing voice.
    ///
    /// Voices paused individually stay paused across [`Self::resume`].
    pub fn pause(&self) {
        self.core.borrow_mut().pause_all();
        debug!("Audio globally paused");
    }

    /// Resume the voices paused by [`Self::pause`].
    pub fn resume(&self) {
        self.core.borrow_mut().resume_all();
        debug!("Audio globally resumed");
    }

    /// Whether the global pause is in effect.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.core.borrow().paused
    }

    /// Stop every voice. No completion callbacks fire.
    pub fn stop_all(&self) {
        self.core.borrow_mut().stop_all();
    }

    /// Set a category volume and re-apply it to bound voices.
    pub fn set_category_volume(&self, category: AudioCategory, volume: f32) {
        self.core.borrow_mut().set_category_volume(category, volume);
    }

    /// Get a category volume.
    #[must_use]
    pub fn category_volume(&self, category: AudioCategory) -> f32 {
        self.core.borrow().volumes.get(category)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::HeadlessDevice;
    use crate::playback::{InstanceControllable, Playable};
    use crate::test_util::{headless_engine, source};

    #[test]
    fn test_capacity_is_min_of_config_and_device() {
        let device = HeadlessDevice::new(4);
        let engine = AudioEngine::with_device(AudioConfig::default().with_max_voices(8), device);
        assert_eq!(engine.capacity(), 4);

        let device = HeadlessDevice::new(16);
        let engine = AudioEngine::with_device(AudioConfig::default().with_max_voices(2), device);
        assert_eq!(engine.capacity(), 2);
    }

    #[test]
    fn test_music_voice_is_not_evicted() {
        let (engine, _device) = headless_engine(1);
        let music = engine.new_music(&[source(1, 1_000, 2_000)]);
        music.play().expect("music should bind");

        let sound = engine.new_sound(&source(1, 1_000, 100)).expect("should decode");
        let err = sound.play().expect_err("pool is full of music");
        assert!(matches!(err, AudioError::ResourceExhausted { capacity: 1 }));
        assert!(music.is_active());
        assert_eq!(sound.instance_count(), 0);
    }

    #[test]
    fn test_oldest_sound_is_evicted() {
        let (engine, _device) = headless_engine(2);
        let sound = engine.new_sound(&source(1, 1_000, 1_000)).expect("should decode");

        let first = sound.play().expect("free voice");
        let second = sound.play().expect("free voice");
        let third = sound.play().expect("evicts the oldest");

        assert!(!sound.is_playing(first));
        assert!((sound.volume(first) + 1.0).abs() < f32::EPSILON);
        assert!(sound.is_playing(second));
        assert!(sound.is_playing(third));
        assert_eq!(engine.active_voices(), 2);
    }

    #[test]
    fn test_global_pause_keeps_local_pause() {
        let (engine, device) = headless_engine(2);
        let sound = engine.new_sound(&source(1, 1_000, 1_000)).expect("should decode");
        let a = sound.play().expect("free voice");
        let b = sound.play().expect("free voice");

        sound.pause_instance(a);
        engine.pause();
        assert!(engine.is_paused());
        assert!(!sound.is_playing(a));
        assert!(!sound.is_playing(b));
        assert!(device.voice(1).is_some_and(|v| v.paused));

        engine.resume();
        assert!(!sound.is_playing(a), "local pause must survive global resume");
        assert!(sound.is_playing(b));
        assert!(device.voice(0).is_some_and(|v| v.paused));
        assert!(device.voice(1).is_some_and(|v| !v.paused));
    }

    #[test]
    fn test_playback_started_during_global_pause() {
        let (engine, device) = headless_engine(2);
        let sound = engine.new_sound(&source(1, 1_000, 1_000)).expect("should decode");

        engine.pause();
        let id = sound.play().expect("free voice");
        assert!(!sound.is_playing(id));
        assert!(device.voice(0).is_some_and(|v| v.paused));

        engine.resume();
        assert!(sound.is_playing(id));
    }

    #[test]
    fn test_category_volume_reapplied() {
        let (engine, device) = headless_engine(2);
        let sound = engine.new_sound(&source(1, 1_000, 1_000)).expect("should decode");
        let id = sound.play().expect("free voice");
        sound.set_volume(id, 0.5);

        engine.set_category_volume(AudioCategory::Sfx, 0.5);
        assert!((engine.category_volume(AudioCategory::Sfx) - 0.5).abs() < f32::EPSILON);
        let gain = device.voice(0).map_or(0.0, |v| v.volume);
        assert!((gain - 0.25).abs() < f32::EPSILON);
    }

    #[test]
    fn test_stop_all_frees_voices() {
        let (engine, _device) = headless_engine(3);
        let sound = engine.new_sound(&source(1, 1_000, 1_000)).expect("should decode");
        let a = sound.play().expect("free voice");
        let music = engine.new_music(&[source(1, 1_000, 1_000)]);
        music.play().expect("free voice");
        assert_eq!(engine.active_voices(), 2);

        engine.stop_all();
        assert_eq!(engine.active_voices(), 0);
        assert!(!sound.is_playing(a));
        assert!(!music.is_active());
    }

    #[test]
    fn test_dropped_buffer_releases_voice() {
        let (engine, _device) = headless_engine(2);
        let sound = engine.new_sound(&source(1, 1_000, 1_000)).expect("should decode");
        sound.play().expect("free voice");
        assert_eq!(engine.active_voices(), 1);

        drop(sound);
        engine.update();
        assert_eq!(engine.active_voices(), 0);
    }
}
