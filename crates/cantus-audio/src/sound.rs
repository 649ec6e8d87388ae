//! Sound buffers.
//!
//! A [`SoundBuffer`] decodes its asset once and keeps the samples in
//! memory. Every [`Playable::play`] starts a new, independently controlled
//! instance on its own voice, so the same effect can overlap itself any
//! number of times (up to the engine's capacity).
//!
//! Instance ids outlive the playback they name. Once an instance has
//! completed, been stopped, been evicted or the buffer disposed, its id
//! still works with every [`InstanceControllable`] method: setters do
//! nothing and getters return sentinels.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;
use std::sync::Arc;

use tracing::debug;

use crate::device::PcmChunk;
use crate::engine::{dispatch_all, EngineCore, SharedCore, VoiceRequest, WeakCore};
use crate::error::{AudioError, AudioResult};
use crate::playback::{
    clamp_pan, clamp_pitch, clamp_volume, InstanceControllable, InstanceId, InstanceIdGenerator,
    Pausable, Playable, SoundControls,
};
use crate::source::{AudioFormat, AudioSource};
use crate::voice::{FilledChunk, VoiceClient, VoiceKind, VoiceLease};

/// Volume reported for an unknown instance.
pub const UNKNOWN_VOLUME: f32 = -1.0;

/// Position reported for an unknown instance.
pub const UNKNOWN_POSITION: f64 = -1.0;

type CompleteFn = Box<dyn FnMut(&SoundBuffer, InstanceId)>;

#[derive(Debug)]
struct Instance {
    lease: VoiceLease,
    controls: SoundControls,
    /// Next frame to hand to the voice.
    cursor: u64,
}

#[derive(Debug)]
struct SoundState {
    /// `None` once disposed.
    data: Option<Arc<[i16]>>,
    format: AudioFormat,
    instances: BTreeMap<InstanceId, Instance>,
    ids: InstanceIdGenerator,
    completed: Vec<InstanceId>,
}

struct SoundShared {
    engine: WeakCore,
    source: AudioSource,
    state: RefCell<SoundState>,
    on_complete: RefCell<Option<CompleteFn>>,
}

impl Drop for SoundShared {
    fn drop(&mut self) {
        let Some(engine) = self.engine.upgrade() else {
            return;
        };
        let Ok(mut core) = engine.try_borrow_mut() else {
            return;
        };
        for instance in self.state.get_mut().instances.values() {
            core.release(instance.lease);
        }
    }
}

impl VoiceClient for SoundShared {
    fn fill(&self, tag: u64, max_frames: usize) -> Option<FilledChunk> {
        let mut state = self.state.borrow_mut();
        let state = &mut *state;
        let data = state.data.as_ref()?;
        let channels = state.format.channels;
        let width = u64::from(channels.max(1));
        let frames = data.len() as u64 / width;

        let instance = state.instances.values_mut().find(|i| i.lease.tag == tag)?;
        if instance.cursor >= frames {
            if !instance.controls.looping {
                return None;
            }
            instance.cursor = 0;
        }

        let start = instance.cursor;
        let count = (frames - start).min(max_frames as u64);
        instance.cursor += count;

        let samples = data[(start * width) as usize..((start + count) * width) as usize].to_vec();
        Some(FilledChunk {
            chunk: PcmChunk::new(samples, channels, state.format.sample_rate),
            entry: 0,
            start_frame: start,
            marker: None,
        })
    }

    fn drained(&self, tag: u64) {
        let mut state = self.state.borrow_mut();
        let finished = state
            .instances
            .iter()
            .find(|(_, i)| i.lease.tag == tag)
            .map(|(&id, _)| id);
        if let Some(id) = finished {
            state.instances.remove(&id);
            state.completed.push(id);
        }
    }

    fn dispatch(self: Rc<Self>) {
        let completed = std::mem::take(&mut self.state.borrow_mut().completed);
        if completed.is_empty() {
            return;
        }
        let buffer = SoundBuffer { shared: self };
        for id in completed {
            let callback = buffer.shared.on_complete.borrow_mut().take();
            if let Some(mut callback) = callback {
                callback(&buffer, id);
                let mut slot = buffer.shared.on_complete.borrow_mut();
                if slot.is_none() {
                    *slot = Some(callback);
                }
            }
        }
    }
}

/// A fully decoded asset played as many overlapping instances.
///
/// Cloning yields another handle to the same buffer.
#[derive(Clone)]
pub struct SoundBuffer {
    shared: Rc<SoundShared>,
}

impl std::fmt::Debug for SoundBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.borrow();
        f.debug_struct("SoundBuffer")
            .field("source", &self.shared.source.name())
            .field("instances", &state.instances.len())
            .field("disposed", &state.data.is_none())
            .finish()
    }
}

impl SoundBuffer {
    pub(crate) fn new(engine: WeakCore, source: &AudioSource) -> AudioResult<Self> {
        let data: Arc<[i16]> = source.data()?.into();
        debug!(
            "Sound buffer '{}' resident ({} samples)",
            source.name(),
            data.len()
        );

        Ok(Self {
            shared: Rc::new(SoundShared {
                engine,
                source: source.clone(),
                state: RefCell::new(SoundState {
                    data: Some(data),
                    format: source.format(),
                    instances: BTreeMap::new(),
                    ids: InstanceIdGenerator::default(),
                    completed: Vec::new(),
                }),
                on_complete: RefCell::new(None),
            }),
        })
    }

    /// The asset this buffer was decoded from.
    #[must_use]
    pub fn source(&self) -> &AudioSource {
        &self.shared.source
    }

    /// Length of one instance in seconds.
    #[must_use]
    pub fn duration(&self) -> f64 {
        self.shared.source.duration()
    }

    /// Start a new instance with explicit controls.
    pub fn play_with(&self, controls: SoundControls) -> AudioResult<InstanceId> {
        let mut controls = controls;
        controls.normalize();

        if self.shared.state.borrow().data.is_none() {
            return Err(AudioError::invalid(format!(
                "sound buffer '{}' has been disposed",
                self.shared.source.name()
            )));
        }
        let core = self.core()?;

        let client: Rc<dyn VoiceClient> = self.shared.clone();
        let lease = core.borrow_mut().bind(
            Rc::downgrade(&client),
            VoiceRequest {
                kind: VoiceKind::Sound,
                evictable: true,
                volume: controls.volume,
                pan: controls.pan,
                speed: controls.pitch,
            },
        )?;

        let id = {
            let core = core.borrow();
            let mut state = self.shared.state.borrow_mut();
            state.instances.retain(|_, i| core.is_bound(i.lease));
            let id = state.ids.allocate();
            state.instances.insert(
                id,
                Instance {
                    lease,
                    controls,
                    cursor: 0,
                },
            );
            id
        };
        debug!(
            "Playing '{}' instance {} on voice {}",
            self.shared.source.name(),
            id,
            lease.voice
        );

        let touched = core.borrow_mut().service(lease.voice);
        dispatch_all(touched.into_iter().collect());
        Ok(id)
    }

    /// Start a new instance that loops until stopped.
    pub fn play_looping(&self) -> AudioResult<InstanceId> {
        self.play_with(SoundControls::default().with_looping(true))
    }

    /// Stop every instance. No completion callbacks fire.
    pub fn stop_all(&self) {
        let instances = std::mem::take(&mut self.shared.state.borrow_mut().instances);
        let Some(engine) = self.shared.engine.upgrade() else {
            return;
        };
        let mut core = engine.borrow_mut();
        for instance in instances.values() {
            core.release(instance.lease);
        }
    }

    /// Pause every instance.
    pub fn pause_all(&self) {
        self.for_each_lease(EngineCore::pause_voice);
    }

    /// Resume every locally paused instance.
    pub fn resume_all(&self) {
        self.for_each_lease(EngineCore::resume_voice);
    }

    /// Number of instances still holding a voice.
    #[must_use]
    pub fn instance_count(&self) -> usize {
        self.prune();
        self.shared.state.borrow().instances.len()
    }

    /// Register the callback fired when an instance plays to its end.
    ///
    /// Stopped and evicted instances do not complete.
    pub fn set_on_complete(&self, callback: impl FnMut(&SoundBuffer, InstanceId) + 'static) {
        *self.shared.on_complete.borrow_mut() = Some(Box::new(callback));
    }

    /// Remove the completion callback.
    pub fn clear_on_complete(&self) {
        self.shared.on_complete.borrow_mut().take();
    }

    /// Stop everything, drop the samples and invalidate every instance id.
    pub fn dispose(&self) {
        self.stop_all();
        let mut state = self.shared.state.borrow_mut();
        state.data = None;
        state.completed.clear();
        self.clear_on_complete();
        debug!("Sound buffer '{}' disposed", self.shared.source.name());
    }

    /// Whether [`Self::dispose`] has been called.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.shared.state.borrow().data.is_none()
    }

    fn core(&self) -> AudioResult<SharedCore> {
        self.shared
            .engine
            .upgrade()
            .ok_or_else(|| AudioError::invalid("audio engine has been dropped"))
    }

    /// Forget instances whose voice is gone.
    fn prune(&self) {
        let Some(engine) = self.shared.engine.upgrade() else {
            self.shared.state.borrow_mut().instances.clear();
            return;
        };
        let core = engine.borrow();
        self.shared
            .state
            .borrow_mut()
            .instances
            .retain(|_, i| core.is_bound(i.lease));
    }

    /// The engine and lease of an instance that still holds its voice.
    fn live(&self, id: InstanceId) -> Option<(SharedCore, VoiceLease)> {
        let lease = self.shared.state.borrow().instances.get(&id)?.lease;
        let engine = self.shared.engine.upgrade()?;
        let bound = engine.borrow().is_bound(lease);
        bound.then_some((engine, lease))
    }

    /// Read the controls of a live instance.
    fn controls(&self, id: InstanceId) -> Option<SoundControls> {
        self.live(id)?;
        self.shared
            .state
            .borrow()
            .instances
            .get(&id)
            .map(|i| i.controls)
    }

    /// Update the controls of a live instance and push them to its voice.
    fn update_controls(
        &self,
        id: InstanceId,
        update: impl FnOnce(&mut SoundControls),
        apply: impl FnOnce(&mut EngineCore, VoiceLease, &SoundControls),
    ) {
        let Some((engine, lease)) = self.live(id) else {
            return;
        };
        let controls = {
            let mut state = self.shared.state.borrow_mut();
            let Some(instance) = state.instances.get_mut(&id) else {
                return;
            };
            update(&mut instance.controls);
            instance.controls
        };
        apply(&mut *engine.borrow_mut(), lease, &controls);
    }

    fn for_each_lease(&self, f: impl Fn(&mut EngineCore, VoiceLease)) {
        let leases: Vec<VoiceLease> = self
            .shared
            .state
            .borrow()
            .instances
            .values()
            .map(|i| i.lease)
            .collect();
        let Some(engine) = self.shared.engine.upgrade() else {
            return;
        };
        let mut core = engine.borrow_mut();
        for lease in leases {
            f(&mut *core, lease);
        }
    }

    fn live_leases(&self) -> Vec<(SharedCore, VoiceLease)> {
        let ids: Vec<InstanceId> = self.shared.state.borrow().instances.keys().copied().collect();
        ids.into_iter().filter_map(|id| self.live(id)).collect()
    }
}

impl Playable for SoundBuffer {
    type Handle = InstanceId;

    fn play(&self) -> AudioResult<InstanceId> {
        self.play_with(SoundControls::default())
    }

    fn stop(&self) {
        self.stop_all();
    }

    fn is_active(&self) -> bool {
        self.live_leases()
            .iter()
            .any(|(engine, lease)| !engine.borrow().is_voice_paused(*lease))
    }
}

impl Pausable for SoundBuffer {
    fn pause(&self) {
        self.pause_all();
    }

    fn resume(&self) {
        self.resume_all();
    }

    fn is_paused(&self) -> bool {
        let live = self.live_leases();
        !live.is_empty()
            && live
                .iter()
                .all(|(engine, lease)| engine.borrow().is_voice_paused(*lease))
    }
}

impl InstanceControllable for SoundBuffer {
    fn stop_instance(&self, id: InstanceId) {
        let Some(instance) = self.shared.state.borrow_mut().instances.remove(&id) else {
            return;
        };
        if let Some(engine) = self.shared.engine.upgrade() {
            engine.borrow_mut().release(instance.lease);
        }
    }

    fn pause_instance(&self, id: InstanceId) {
        if let Some((engine, lease)) = self.live(id) {
            engine.borrow_mut().pause_voice(lease);
        }
    }

    fn resume_instance(&self, id: InstanceId) {
        if let Some((engine, lease)) = self.live(id) {
            engine.borrow_mut().resume_voice(lease);
        }
    }

    fn is_playing(&self, id: InstanceId) -> bool {
        self.live(id)
            .is_some_and(|(engine, lease)| !engine.borrow().is_voice_paused(lease))
    }

    fn volume(&self, id: InstanceId) -> f32 {
        self.controls(id).map_or(UNKNOWN_VOLUME, |c| c.volume)
    }

    fn set_volume(&self, id: InstanceId, volume: f32) {
        self.update_controls(
            id,
            |c| c.volume = clamp_volume(volume),
            |core, lease, c| core.set_voice_volume(lease, c.volume),
        );
    }

    fn pitch(&self, id: InstanceId) -> f32 {
        self.controls(id).map_or(1.0, |c| c.pitch)
    }

    fn set_pitch(&self, id: InstanceId, pitch: f32) {
        self.update_controls(
            id,
            |c| c.pitch = clamp_pitch(pitch),
            |core, lease, c| core.set_voice_speed(lease, c.pitch),
        );
    }

    fn pan(&self, id: InstanceId) -> f32 {
        self.controls(id).map_or(0.0, |c| c.pan)
    }

    fn set_pan(&self, id: InstanceId, pan: f32) {
        self.update_controls(
            id,
            |c| c.pan = clamp_pan(pan),
            |core, lease, c| core.set_voice_pan(lease, c.pan),
        );
    }

    fn is_looping(&self, id: InstanceId) -> bool {
        self.controls(id).is_some_and(|c| c.looping)
    }

    fn set_looping(&self, id: InstanceId, looping: bool) {
        // An instance that already queued its last frames needs to be asked again
        self.update_controls(id, |c| c.looping = looping, |core, lease, _| core.rearm(lease));
    }

    fn position(&self, id: InstanceId) -> f64 {
        let Some((engine, lease)) = self.live(id) else {
            return UNKNOWN_POSITION;
        };
        let state = self.shared.state.borrow();
        let frame = match engine.borrow().progress(lease) {
            Some((_, frame)) => frame,
            None => state.instances.get(&id).map_or(0, |i| i.cursor),
        };
        state.format.frames_to_seconds(frame)
    }

    fn set_position(&self, id: InstanceId, seconds: f64) {
        let Some((engine, lease)) = self.live(id) else {
            return;
        };
        {
            let mut state = self.shared.state.borrow_mut();
            let seconds = seconds.clamp(0.0, state.format.duration());
            let frame = state.format.seconds_to_frames(seconds);
            let Some(instance) = state.instances.get_mut(&id) else {
                return;
            };
            instance.cursor = frame;
        }
        engine.borrow_mut().flush(lease);
        let touched = engine.borrow_mut().service(lease.voice);
        dispatch_all(touched.into_iter().collect());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::test_util::{headless_engine, run_for, source};

    #[test]
    fn test_unknown_instance_sentinels() {
        let (engine, _device) = headless_engine(2);
        let sound = engine.new_sound(&source(1, 1_000, 100)).expect("should decode");
        let never = InstanceId::new(999);

        assert!(!sound.is_playing(never));
        assert!((sound.volume(never) - UNKNOWN_VOLUME).abs() < f32::EPSILON);
        assert!((sound.pitch(never) - 1.0).abs() < f32::EPSILON);
        assert!(sound.pan(never).abs() < f32::EPSILON);
        assert!(!sound.is_looping(never));
        assert!((sound.position(never) - UNKNOWN_POSITION).abs() < f64::EPSILON);

        // Setters are silent no-ops
        sound.set_position(never, 3.0);
        sound.set_volume(never, 0.5);
        sound.stop_instance(never);
        assert!((sound.volume(never) - UNKNOWN_VOLUME).abs() < f32::EPSILON);
    }

    #[test]
    fn test_instance_ids_increase() {
        let (engine, _device) = headless_engine(4);
        let sound = engine.new_sound(&source(1, 1_000, 500)).expect("should decode");
        let a = sound.play().expect("free voice");
        let b = sound.play().expect("free voice");
        assert!(a < b);
        assert_eq!(sound.instance_count(), 2);
    }

    #[test]
    fn test_play_with_controls() {
        let (engine, device) = headless_engine(2);
        let sound = engine.new_sound(&source(2, 1_000, 500)).expect("should decode");
        let id = sound
            .play_with(SoundControls::default().with_pitch(2.0).with_pan(-0.5))
            .expect("free voice");

        assert!((sound.pitch(id) - 2.0).abs() < f32::EPSILON);
        assert!((sound.pan(id) + 0.5).abs() < f32::EPSILON);
        let voice = device.voice(0).expect("voice 0 exists");
        assert!((voice.speed - 2.0).abs() < f32::EPSILON);
        assert!((voice.pan + 0.5).abs() < f32::EPSILON);
    }

    #[test]
    fn test_completion_fires_once_with_id() {
        let (engine, device) = headless_engine(2);
        let sound = engine.new_sound(&source(1, 1_000, 250)).expect("should decode");
        let done = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&done);
        sound.set_on_complete(move |_, id| sink.borrow_mut().push(id));

        let id = sound.play().expect("free voice");
        run_for(&engine, &device, Duration::from_millis(200));
        assert!(sound.is_playing(id));
        assert!(done.borrow().is_empty());

        run_for(&engine, &device, Duration::from_millis(200));
        assert_eq!(*done.borrow(), vec![id]);
        assert!(!sound.is_playing(id));
        assert_eq!(engine.active_voices(), 0);

        run_for(&engine, &device, Duration::from_millis(200));
        assert_eq!(done.borrow().len(), 1);
    }

    #[test]
    fn test_stop_does_not_complete() {
        let (engine, device) = headless_engine(2);
        let sound = engine.new_sound(&source(1, 1_000, 250)).expect("should decode");
        let fired = Rc::new(RefCell::new(0));
        let counter = Rc::clone(&fired);
        sound.set_on_complete(move |_, _| *counter.borrow_mut() += 1);

        let id = sound.play().expect("free voice");
        sound.stop_instance(id);
        run_for(&engine, &device, Duration::from_millis(500));

        assert_eq!(*fired.borrow(), 0);
        assert!((sound.volume(id) - UNKNOWN_VOLUME).abs() < f32::EPSILON);
    }

    #[test]
    fn test_callback_may_replay() {
        let (engine, device) = headless_engine(2);
        let sound = engine.new_sound(&source(1, 1_000, 100)).expect("should decode");
        let replays = Rc::new(RefCell::new(0));
        let counter = Rc::clone(&replays);
        sound.set_on_complete(move |buffer, _| {
            let mut count = counter.borrow_mut();
            if *count < 2 {
                *count += 1;
                buffer.play().expect("voice was just freed");
            }
        });

        sound.play().expect("free voice");
        run_for(&engine, &device, Duration::from_millis(600));
        assert_eq!(*replays.borrow(), 2);
        assert_eq!(sound.instance_count(), 0);
    }

    #[test]
    fn test_looping_instance_outlives_duration() {
        let (engine, device) = headless_engine(2);
        let sound = engine.new_sound(&source(1, 1_000, 150)).expect("should decode");
        let id = sound.play_looping().expect("free voice");

        run_for(&engine, &device, Duration::from_millis(600));
        assert!(sound.is_playing(id));
        assert!(sound.is_looping(id));

        sound.set_looping(id, false);
        run_for(&engine, &device, Duration::from_millis(600));
        assert!(!sound.is_playing(id));
    }

    #[test]
    fn test_set_position_clamps() {
        let (engine, device) = headless_engine(2);
        let sound = engine.new_sound(&source(1, 1_000, 1_000)).expect("should decode");
        let id = sound.play().expect("free voice");

        sound.set_position(id, 0.5);
        assert!((sound.position(id) - 0.5).abs() < 1e-9);

        run_for(&engine, &device, Duration::from_millis(100));
        assert!((sound.position(id) - 0.6).abs() < 0.01);

        sound.set_position(id, -4.0);
        assert!(sound.position(id).abs() < 1e-9);
    }

    #[test]
    fn test_dispose_invalidates_ids() {
        let (engine, _device) = headless_engine(2);
        let sound = engine.new_sound(&source(1, 1_000, 1_000)).expect("should decode");
        let id = sound.play().expect("free voice");

        sound.dispose();
        assert!(sound.is_disposed());
        assert!(!sound.is_playing(id));
        assert_eq!(engine.active_voices(), 0);
        assert!(matches!(sound.play(), Err(AudioError::InvalidArgument(_))));
    }

    #[test]
    fn test_pause_all_and_resume_all() {
        let (engine, _device) = headless_engine(3);
        let sound = engine.new_sound(&source(1, 1_000, 1_000)).expect("should decode");
        let a = sound.play().expect("free voice");
        let b = sound.play().expect("free voice");

        sound.pause();
        assert!(sound.is_paused());
        assert!(!sound.is_active());

        sound.resume_instance(b);
        assert!(!sound.is_paused());
        assert!(sound.is_playing(b));
        assert!(!sound.is_playing(a));

        sound.resume();
        assert!(sound.is_playing(a));
    }
}
