//! Music buffers.
//!
//! A [`MusicBuffer`] plays an ordered queue of sources back to back on one
//! voice with no gap between them. The queue can be edited while it plays.
//!
//! Two cursors are involved:
//!
//! - the *feed*, which decodes ahead and hands chunks to the voice
//! - the *current* entry, which only moves once the engine has seen the
//!   first chunk of the next entry start playing
//!
//! Events are delivered on the same confirmation, so a listener may hear
//! about a transition up to one buffering period after it became audible.
//! Callers needing tighter sync should poll [`Seekable::position`].
//!
//! ```text
//!  entries:   [ A ][ B ][ C ]
//!               ▲    ▲
//!          current   feed          (B queued, not yet heard)
//! ```
//!
//! Looping comes in two flavours. The *local* loop repeats the current entry
//! in place. The *global* loop wraps back to the first entry once the last
//! one ends, and wins over the local loop on the last entry.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use tracing::{debug, info, warn};

use crate::config::DEFAULT_CHUNK_FRAMES;
use crate::device::PcmChunk;
use crate::engine::{dispatch_all, SharedCore, VoiceRequest, WeakCore};
use crate::error::{AudioError, AudioResult};
use crate::playback::{
    clamp_pan, clamp_pitch, clamp_volume, Pausable, Playable, PlaybackState, Seekable,
};
use crate::source::AudioSource;
use crate::stream::AudioStream;
use crate::voice::{FilledChunk, VoiceClient, VoiceKind, VoiceLease};

/// Something that happened in a music queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MusicEvent {
    /// Playback moved from one entry to another.
    Transition {
        /// Entry that was playing.
        from: AudioSource,
        /// Entry now playing.
        to: AudioSource,
    },
    /// The local loop restarted the current entry.
    Loopback {
        /// The repeated entry.
        source: AudioSource,
    },
    /// The queue ran out and playback stopped.
    Completion,
}

type ListenerFn = Box<dyn FnMut(&MusicBuffer, &MusicEvent)>;

#[derive(Debug)]
struct QueueEntry {
    /// Stable across index shifts.
    id: u64,
    source: AudioSource,
}

/// Decode-ahead position.
#[derive(Debug, Default)]
struct Feed {
    index: usize,
    stream: Option<AudioStream>,
    /// Frame of the next sample handed out.
    frame: u64,
    /// Samples already decoded by a seek.
    carry: Vec<i16>,
    /// Event to attach to the next chunk.
    marker: Option<MusicEvent>,
}

#[derive(Debug)]
struct MusicState {
    entries: Vec<QueueEntry>,
    next_entry: u64,
    current: usize,
    feed: Feed,
    state: PlaybackState,
    local_loop: bool,
    global_loop: bool,
    volume: f32,
    pitch: f32,
    pan: f32,
    lease: Option<VoiceLease>,
    events: Vec<MusicEvent>,
}

impl MusicState {
    fn entry(&mut self, source: AudioSource) -> QueueEntry {
        let id = self.next_entry;
        self.next_entry += 1;
        QueueEntry { id, source }
    }

    fn source_at(&self, index: usize) -> Option<AudioSource> {
        self.entries.get(index).map(|e| e.source.clone())
    }

    fn index_of(&self, entry: u64) -> Option<usize> {
        self.entries.iter().position(|e| e.id == entry)
    }

    /// Accumulated duration of the entries before `index`.
    fn prefix(&self, index: usize) -> f64 {
        self.entries
            .iter()
            .take(index)
            .map(|e| e.source.duration())
            .sum()
    }

    fn total(&self) -> f64 {
        self.prefix(self.entries.len())
    }

    /// Queue an event for the listener if a voice is held.
    fn notify(&mut self, event: MusicEvent) {
        if self.state.is_active() {
            self.events.push(event);
        }
    }

    fn notify_transition(&mut self, from: usize, to: usize) {
        if let (Some(from), Some(to)) = (self.source_at(from), self.source_at(to)) {
            self.notify(MusicEvent::Transition { from, to });
        }
    }

    /// Point the feed at `frame` of entry `index`.
    fn seek_feed(&mut self, index: usize, frame: u64, carry_len: usize) {
        self.feed = Feed {
            index,
            ..Feed::default()
        };
        if frame == 0 {
            return;
        }
        let Some(source) = self.source_at(index) else {
            return;
        };
        let channels = u64::from(source.channels().max(1));
        let mut stream = source.stream();
        let mut carry = vec![0i16; carry_len.max(2)];
        match stream.seek_samples(frame * channels, &mut carry) {
            Ok(n) if n > 0 => {
                carry.truncate(n);
                self.feed.stream = Some(stream);
                self.feed.frame = frame;
                self.feed.carry = carry;
            },
            Ok(_) => debug!("Frame {} unreachable in '{}'", frame, source.name()),
            Err(e) => warn!("Seek in '{}' failed: {}", source.name(), e),
        }
    }

    /// Move the feed to the start of another entry.
    fn cross_to(&mut self, index: usize, marker: MusicEvent) {
        self.feed = Feed {
            index,
            marker: Some(marker),
            ..Feed::default()
        };
    }

    /// Decode the next chunk of the queue, crossing entry boundaries.
    fn next_chunk(&mut self, max_frames: usize) -> Option<FilledChunk> {
        // Each entry is crossed at most once per fill, plus one wrap
        for _ in 0..=self.entries.len() + 1 {
            let entry = self.entries.get(self.feed.index)?;
            let (entry_id, source) = (entry.id, entry.source.clone());
            let channels = source.channels().max(1);
            let want = max_frames * usize::from(channels);

            let stream = self.feed.stream.get_or_insert_with(|| source.stream());
            let take = self.feed.carry.len().min(want);
            let mut samples: Vec<i16> = self.feed.carry.drain(..take).collect();
            while samples.len() < want {
                let filled = samples.len();
                samples.resize(want, 0);
                let n = stream.read_samples(&mut samples[filled..]);
                samples.truncate(filled + n);
                if n == 0 {
                    break;
                }
            }

            if !samples.is_empty() {
                let chunk = PcmChunk::new(samples, channels, source.sample_rate());
                let start_frame = self.feed.frame;
                self.feed.frame += chunk.frames();
                return Some(FilledChunk {
                    chunk,
                    entry: entry_id,
                    start_frame,
                    marker: self.feed.marker.take(),
                });
            }

            let last = self.feed.index + 1 >= self.entries.len();
            if last && self.global_loop {
                let to = self.entries.first()?.source.clone();
                self.local_loop = false;
                self.cross_to(0, MusicEvent::Transition { from: source, to });
            } else if self.local_loop {
                if let Some(stream) = self.feed.stream.as_mut() {
                    stream.rewind();
                }
                self.feed.frame = 0;
                self.feed.marker = Some(MusicEvent::Loopback { source });
            } else if !last {
                let next = self.feed.index + 1;
                let to = self.source_at(next)?;
                self.cross_to(next, MusicEvent::Transition { from: source, to });
            } else {
                return None;
            }
        }

        warn!("Music queue produced no audio, giving up on this fill");
        None
    }
}

struct MusicShared {
    engine: WeakCore,
    state: RefCell<MusicState>,
    listener: RefCell<Option<ListenerFn>>,
    dispatching: Cell<bool>,
}

impl Drop for MusicShared {
    fn drop(&mut self) {
        let Some(lease) = self.state.get_mut().lease else {
            return;
        };
        let Some(engine) = self.engine.upgrade() else {
            return;
        };
        let Ok(mut core) = engine.try_borrow_mut() else {
            return;
        };
        core.release(lease);
    }
}

impl VoiceClient for MusicShared {
    fn fill(&self, tag: u64, max_frames: usize) -> Option<FilledChunk> {
        let mut state = self.state.borrow_mut();
        if state.lease.map(|l| l.tag) != Some(tag) {
            return None;
        }
        state.next_chunk(max_frames)
    }

    fn started(&self, tag: u64, entry: u64, event: MusicEvent) {
        let mut state = self.state.borrow_mut();
        if state.lease.map(|l| l.tag) != Some(tag) {
            return;
        }
        if let MusicEvent::Transition { .. } = event {
            if let Some(index) = state.index_of(entry) {
                state.current = index;
            }
        }
        state.events.push(event);
    }

    fn drained(&self, tag: u64) {
        let mut state = self.state.borrow_mut();
        if state.lease.map(|l| l.tag) != Some(tag) {
            return;
        }
        state.lease = None;
        state.state = PlaybackState::Stopped;
        state.current = 0;
        state.seek_feed(0, 0, 0);
        state.events.push(MusicEvent::Completion);
    }

    fn dispatch(self: Rc<Self>) {
        MusicBuffer { shared: self }.emit_pending();
    }
}

/// Ordered queue of sources played back gaplessly.
///
/// Cloning yields another handle to the same queue.
#[derive(Clone)]
pub struct MusicBuffer {
    shared: Rc<MusicShared>,
}

impl std::fmt::Debug for MusicBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.borrow();
        f.debug_struct("MusicBuffer")
            .field("entries", &state.entries.len())
            .field("current", &state.current)
            .field("state", &state.state)
            .field("local_loop", &state.local_loop)
            .field("global_loop", &state.global_loop)
            .finish_non_exhaustive()
    }
}

impl MusicBuffer {
    pub(crate) fn new(engine: WeakCore, sources: &[AudioSource]) -> Self {
        let mut state = MusicState {
            entries: Vec::with_capacity(sources.len()),
            next_entry: 0,
            current: 0,
            feed: Feed::default(),
            state: PlaybackState::Idle,
            local_loop: false,
            global_loop: false,
            volume: 1.0,
            pitch: 1.0,
            pan: 0.0,
            lease: None,
            events: Vec::new(),
        };
        for source in sources {
            let entry = state.entry(source.clone());
            state.entries.push(entry);
        }

        Self {
            shared: Rc::new(MusicShared {
                engine,
                state: RefCell::new(state),
                listener: RefCell::new(None),
                dispatching: Cell::new(false),
            }),
        }
    }

    /// Register the listener for transitions, loopbacks and completion.
    pub fn set_listener(&self, listener: impl FnMut(&MusicBuffer, &MusicEvent) + 'static) {
        *self.shared.listener.borrow_mut() = Some(Box::new(listener));
    }

    /// Remove the listener.
    pub fn clear_listener(&self) {
        self.shared.listener.borrow_mut().take();
    }

    /// Current playback state.
    #[must_use]
    pub fn state(&self) -> PlaybackState {
        self.sync();
        self.shared.state.borrow().state
    }

    /// Snapshot of the queue.
    #[must_use]
    pub fn sources(&self) -> Vec<AudioSource> {
        let state = self.shared.state.borrow();
        state.entries.iter().map(|e| e.source.clone()).collect()
    }

    /// Number of queued sources.
    #[must_use]
    pub fn source_count(&self) -> usize {
        self.shared.state.borrow().entries.len()
    }

    /// Index of the entry currently heard.
    #[must_use]
    pub fn current_index(&self) -> usize {
        self.shared.state.borrow().current
    }

    /// The entry currently heard.
    #[must_use]
    pub fn current_source(&self) -> Option<AudioSource> {
        let state = self.shared.state.borrow();
        state.source_at(state.current)
    }

    /// Append a source to the end of the queue.
    pub fn add_source(&self, source: AudioSource) {
        let len = self.source_count();
        if let Err(e) = self.insert_source(len, source) {
            warn!("Append failed: {}", e);
        }
    }

    /// Insert a source at `index` (`index == len` appends).
    pub fn insert_source(&self, index: usize, source: AudioSource) -> AudioResult<()> {
        {
            let mut state = self.shared.state.borrow_mut();
            let len = state.entries.len();
            if index > len {
                return Err(AudioError::invalid(format!(
                    "insert index {index} out of range (queue length {len})"
                )));
            }
            let entry = state.entry(source);
            state.entries.insert(index, entry);
            if len > 0 {
                if index <= state.current {
                    state.current += 1;
                }
                if index <= state.feed.index {
                    state.feed.index += 1;
                }
            }
        }
        self.resync();
        Ok(())
    }

    /// Replace the source at `index`, returning the old one.
    ///
    /// Replacing the current entry counts as a transition to the new source.
    pub fn set_source(&self, index: usize, source: AudioSource) -> AudioResult<AudioSource> {
        let (old, is_current) = {
            let mut state = self.shared.state.borrow_mut();
            let len = state.entries.len();
            if index >= len {
                return Err(AudioError::invalid(format!(
                    "source index {index} out of range (queue length {len})"
                )));
            }
            let entry = state.entry(source);
            let old = std::mem::replace(&mut state.entries[index], entry);
            let is_current = index == state.current;
            if is_current {
                state.local_loop = false;
                if let Some(to) = state.source_at(index) {
                    state.notify(MusicEvent::Transition {
                        from: old.source.clone(),
                        to,
                    });
                }
            }
            (old.source, is_current)
        };

        if is_current {
            self.restart(index, 0);
        } else {
            self.resync();
        }
        self.emit_pending();
        Ok(old)
    }

    /// Remove the source at `index` and return it.
    ///
    /// Removing the current entry skips straight to the one after it (or
    /// stops if none remains), firing the listener before returning.
    pub fn remove_source(&self, index: usize) -> AudioResult<AudioSource> {
        let (removed, was_current) = {
            let mut state = self.shared.state.borrow_mut();
            let len = state.entries.len();
            if index >= len {
                return Err(AudioError::invalid(format!(
                    "source index {index} out of range (queue length {len})"
                )));
            }
            let removed = state.entries.remove(index).source;
            let was_current = index == state.current;
            if index < state.current {
                state.current -= 1;
            }
            if index < state.feed.index {
                state.feed.index -= 1;
            }
            (removed, was_current)
        };
        debug!("Removed '{}' from music queue", removed.name());

        if !was_current {
            self.resync();
            return Ok(removed);
        }

        let next = {
            let mut state = self.shared.state.borrow_mut();
            state.local_loop = false;
            let len = state.entries.len();
            let next = if index < len {
                Some(index)
            } else if state.global_loop && len > 0 {
                Some(0)
            } else {
                None
            };
            if let Some(to) = next.and_then(|next| state.source_at(next)) {
                state.notify(MusicEvent::Transition {
                    from: removed.clone(),
                    to,
                });
            }
            next
        };

        match next {
            Some(next) => self.restart(next, 0),
            None => self.finish(),
        }
        self.emit_pending();
        Ok(removed)
    }

    /// Empty the queue. Fires completion if it was playing.
    pub fn clear_sources(&self) {
        self.shared.state.borrow_mut().entries.clear();
        self.finish();
        self.emit_pending();
    }

    /// Move the cursor forward by `steps` entries.
    ///
    /// `0` restarts the current entry. Moving past the end wraps when the
    /// global loop is on and completes otherwise. Negative steps fail with
    /// `InvalidArgument`; use [`Self::jump_to_source`] to move backwards.
    pub fn advance_source(&self, steps: i64) -> AudioResult<()> {
        let steps = u64::try_from(steps).map_err(|_| {
            AudioError::invalid(format!("advance steps must not be negative, got {steps}"))
        })?;
        self.sync();

        let (len, current, global_loop) = {
            let state = self.shared.state.borrow();
            (state.entries.len() as u64, state.current, state.global_loop)
        };
        if len == 0 {
            return Ok(());
        }
        if steps == 0 {
            self.restart(current, 0);
            return Ok(());
        }

        let target = current as u64 + steps;
        if target < len {
            self.transition_to(target as usize);
        } else if global_loop {
            self.transition_to((target % len) as usize);
        } else {
            self.finish();
            self.emit_pending();
        }
        Ok(())
    }

    /// Same as `advance_source(1)`.
    pub fn next_source(&self) -> AudioResult<()> {
        self.advance_source(1)
    }

    /// Move the cursor to `index`, forwards or backwards.
    pub fn jump_to_source(&self, index: usize) -> AudioResult<()> {
        self.sync();
        let (len, current) = {
            let state = self.shared.state.borrow();
            (state.entries.len(), state.current)
        };
        if index >= len {
            return Err(AudioError::invalid(format!(
                "source index {index} out of range (queue length {len})"
            )));
        }
        if index == current {
            self.restart(current, 0);
        } else {
            self.transition_to(index);
        }
        Ok(())
    }

    /// Return the cursor to the first entry.
    pub fn reset(&self) {
        if self.source_count() == 0 {
            return;
        }
        if let Err(e) = self.jump_to_source(0) {
            warn!("Failed to reset music queue: {}", e);
        }
    }

    /// Enable or disable the global loop (wrap to the first entry).
    pub fn set_looping(&self, looping: bool) {
        self.shared.state.borrow_mut().global_loop = looping;
        self.resync();
    }

    /// Whether the global loop is on.
    #[must_use]
    pub fn is_looping(&self) -> bool {
        self.shared.state.borrow().global_loop
    }

    /// Enable or disable the local loop (repeat the current entry).
    pub fn set_loop_behavior(&self, repeat_current: bool) {
        self.shared.state.borrow_mut().local_loop = repeat_current;
        self.resync();
    }

    /// Whether the local loop is on.
    #[must_use]
    pub fn loop_behavior(&self) -> bool {
        self.shared.state.borrow().local_loop
    }

    /// Queue-wide volume (0.0 - 1.0).
    #[must_use]
    pub fn volume(&self) -> f32 {
        self.shared.state.borrow().volume
    }

    /// Set queue-wide volume.
    pub fn set_volume(&self, volume: f32) {
        let volume = clamp_volume(volume);
        if let Some((engine, lease)) = self.store(|s| s.volume = volume) {
            engine.borrow_mut().set_voice_volume(lease, volume);
        }
    }

    /// Queue-wide pitch.
    #[must_use]
    pub fn pitch(&self) -> f32 {
        self.shared.state.borrow().pitch
    }

    /// Set queue-wide pitch (0.1 - 4.0).
    pub fn set_pitch(&self, pitch: f32) {
        let pitch = clamp_pitch(pitch);
        if let Some((engine, lease)) = self.store(|s| s.pitch = pitch) {
            engine.borrow_mut().set_voice_speed(lease, pitch);
        }
    }

    /// Queue-wide pan.
    #[must_use]
    pub fn pan(&self) -> f32 {
        self.shared.state.borrow().pan
    }

    /// Set queue-wide pan (-1.0 - 1.0).
    pub fn set_pan(&self, pan: f32) {
        let pan = clamp_pan(pan);
        if let Some((engine, lease)) = self.store(|s| s.pan = pan) {
            engine.borrow_mut().set_voice_pan(lease, pan);
        }
    }

    /// Stop, empty the queue and drop the listener.
    pub fn dispose(&self) {
        self.stop();
        {
            let mut state = self.shared.state.borrow_mut();
            state.entries.clear();
            state.events.clear();
            state.seek_feed(0, 0, 0);
            state.current = 0;
        }
        self.clear_listener();
    }

    /// Deliver queued events to the listener.
    ///
    /// Re-entrant calls from inside the listener leave their events queued
    /// for the outer loop, so ordering is preserved.
    fn emit_pending(&self) {
        if self.shared.dispatching.replace(true) {
            return;
        }
        loop {
            let events = std::mem::take(&mut self.shared.state.borrow_mut().events);
            if events.is_empty() {
                break;
            }
            for event in events {
                debug!("Music event: {:?}", event);
                let listener = self.shared.listener.borrow_mut().take();
                if let Some(mut listener) = listener {
                    listener(self, &event);
                    let mut slot = self.shared.listener.borrow_mut();
                    if slot.is_none() {
                        *slot = Some(listener);
                    }
                }
            }
        }
        self.shared.dispatching.set(false);
    }

    /// Notice a voice lost to eviction or a global stop.
    fn sync(&self) {
        let Some(lease) = self.shared.state.borrow().lease else {
            return;
        };
        let bound = self
            .shared
            .engine
            .upgrade()
            .is_some_and(|engine| engine.borrow().is_bound(lease));
        if bound {
            return;
        }
        debug!("Music voice {} was taken away", lease.voice);
        let mut state = self.shared.state.borrow_mut();
        state.lease = None;
        if state.state.is_active() {
            state.state = PlaybackState::Stopped;
        }
        let current = state.current;
        state.seek_feed(current, 0, 0);
    }

    /// Update state and return the engine and lease if a voice is held.
    fn store(&self, update: impl FnOnce(&mut MusicState)) -> Option<(SharedCore, VoiceLease)> {
        let lease = {
            let mut state = self.shared.state.borrow_mut();
            update(&mut state);
            state.lease
        }?;
        Some((self.shared.engine.upgrade()?, lease))
    }

    fn carry_len(&self, index: usize) -> usize {
        let chunk_frames = self
            .shared
            .engine
            .upgrade()
            .map_or(DEFAULT_CHUNK_FRAMES, |engine| engine.borrow().config().chunk_frames);
        let channels = self
            .shared
            .state
            .borrow()
            .entries
            .get(index)
            .map_or(1, |e| usize::from(e.source.channels()));
        chunk_frames * channels
    }

    /// Make `index` current and play it from `frame`, discarding anything
    /// already queued on the voice.
    fn restart(&self, index: usize, frame: u64) {
        let carry_len = self.carry_len(index);
        let lease = {
            let mut state = self.shared.state.borrow_mut();
            state.current = index;
            state.seek_feed(index, frame, carry_len);
            state.lease
        };
        let (Some(lease), Some(engine)) = (lease, self.shared.engine.upgrade()) else {
            return;
        };
        engine.borrow_mut().flush(lease);
        let touched = engine.borrow_mut().service(lease.voice);
        dispatch_all(touched.into_iter().collect());
    }

    /// Explicit move to another entry.
    fn transition_to(&self, index: usize) {
        {
            let mut state = self.shared.state.borrow_mut();
            state.local_loop = false;
            let current = state.current;
            state.notify_transition(current, index);
        }
        self.restart(index, 0);
        self.emit_pending();
    }

    /// Release the voice and report completion if anything was playing.
    fn finish(&self) {
        let lease = {
            let mut state = self.shared.state.borrow_mut();
            state.notify(MusicEvent::Completion);
            if state.state.is_active() {
                state.state = PlaybackState::Stopped;
            }
            state.local_loop = false;
            state.current = 0;
            state.seek_feed(0, 0, 0);
            state.lease.take()
        };
        if let (Some(lease), Some(engine)) = (lease, self.shared.engine.upgrade()) {
            engine.borrow_mut().release(lease);
        }
    }

    /// Bring queued audio back in line after the queue or loop flags changed.
    ///
    /// If the voice already holds audio past the current entry (the next
    /// entry, a loop restart or a wrap), it is replayed from the current
    /// entry's heard position so the new layout takes effect.
    fn resync(&self) {
        let Some(engine) = self.shared.engine.upgrade() else {
            return;
        };
        let Some(lease) = self.shared.state.borrow().lease else {
            return;
        };

        // Catch up with what the device has already started
        let touched = engine.borrow_mut().service(lease.voice);
        dispatch_all(touched.into_iter().collect());

        let (ahead, current, current_id) = {
            let state = self.shared.state.borrow();
            if state.lease != Some(lease) {
                return;
            }
            (
                state.feed.index != state.current || state.feed.marker.is_some(),
                state.current,
                state.entries.get(state.current).map(|e| e.id),
            )
        };

        let ahead = ahead || engine.borrow().pending_boundary(lease);
        if ahead {
            let frame = match engine.borrow().progress(lease) {
                Some((entry, frame)) if Some(entry) == current_id => frame,
                _ => 0,
            };
            self.restart(current, frame);
        } else {
            engine.borrow_mut().rearm(lease);
            let touched = engine.borrow_mut().service(lease.voice);
            dispatch_all(touched.into_iter().collect());
        }
    }
}

impl Playable for MusicBuffer {
    type Handle = ();

    fn play(&self) -> AudioResult<()> {
        self.sync();
        let (state, volume, pitch, pan, empty) = {
            let s = self.shared.state.borrow();
            (s.state, s.volume, s.pitch, s.pan, s.entries.is_empty())
        };
        match state {
            PlaybackState::Playing => return Ok(()),
            PlaybackState::Paused => {
                self.resume();
                return Ok(());
            },
            PlaybackState::Idle | PlaybackState::Stopped => {},
        }
        if empty {
            return Err(AudioError::invalid("music queue is empty"));
        }

        let engine = self
            .shared
            .engine
            .upgrade()
            .ok_or_else(|| AudioError::invalid("audio engine has been dropped"))?;
        let client: Rc<dyn VoiceClient> = self.shared.clone();
        let lease = engine.borrow_mut().bind(
            Rc::downgrade(&client),
            VoiceRequest {
                kind: VoiceKind::Music,
                evictable: true,
                volume,
                pan,
                speed: pitch,
            },
        )?;

        let name = {
            let mut state = self.shared.state.borrow_mut();
            state.lease = Some(lease);
            state.state = PlaybackState::Playing;
            state
                .source_at(state.current)
                .map(|s| s.name().to_string())
                .unwrap_or_default()
        };
        info!("Music playing '{}' on voice {}", name, lease.voice);

        let touched = engine.borrow_mut().service(lease.voice);
        dispatch_all(touched.into_iter().collect());
        Ok(())
    }

    fn stop(&self) {
        let lease = {
            let mut state = self.shared.state.borrow_mut();
            if state.state.is_active() {
                state.state = PlaybackState::Stopped;
            }
            let current = state.current;
            state.seek_feed(current, 0, 0);
            state.lease.take()
        };
        if let (Some(lease), Some(engine)) = (lease, self.shared.engine.upgrade()) {
            engine.borrow_mut().release(lease);
        }
    }

    fn is_active(&self) -> bool {
        self.sync();
        let state = self.shared.state.borrow();
        let Some(lease) = state.lease else {
            return false;
        };
        state.state == PlaybackState::Playing
            && self
                .shared
                .engine
                .upgrade()
                .is_some_and(|engine| !engine.borrow().is_voice_paused(lease))
    }
}

impl Pausable for MusicBuffer {
    fn pause(&self) {
        self.sync();
        let target = self.store(|s| {
            if s.state == PlaybackState::Playing {
                s.state = PlaybackState::Paused;
            }
        });
        if let Some((engine, lease)) = target {
            engine.borrow_mut().pause_voice(lease);
        }
    }

    fn resume(&self) {
        self.sync();
        let target = self.store(|s| {
            if s.state == PlaybackState::Paused {
                s.state = PlaybackState::Playing;
            }
        });
        if let Some((engine, lease)) = target {
            engine.borrow_mut().resume_voice(lease);
        }
    }

    fn is_paused(&self) -> bool {
        self.state() == PlaybackState::Paused
    }
}

impl Seekable for MusicBuffer {
    fn position(&self) -> f64 {
        self.sync();
        let state = self.shared.state.borrow();
        let heard = state.lease.and_then(|lease| {
            let engine = self.shared.engine.upgrade()?;
            let (entry, frame) = engine.borrow().progress(lease)?;
            let index = state.index_of(entry)?;
            Some((index, frame))
        });
        let (index, frame) = heard.unwrap_or_else(|| {
            let frame = if state.feed.index == state.current {
                state.feed.frame
            } else {
                0
            };
            (state.current, frame)
        });
        let offset = state
            .entries
            .get(index)
            .map_or(0.0, |e| e.source.format().frames_to_seconds(frame));
        state.prefix(index) + offset
    }

    fn set_position(&self, seconds: f64) {
        self.sync();
        let target = {
            let mut state = self.shared.state.borrow_mut();
            let seconds = seconds.clamp(0.0, state.total());
            let mut start = 0.0;
            let mut target = None;
            for (index, entry) in state.entries.iter().enumerate() {
                let length = entry.source.duration();
                let last = index + 1 == state.entries.len();
                if seconds < start + length || last {
                    let format = entry.source.format();
                    let frame = format
                        .seconds_to_frames(seconds - start)
                        .min(format.frame_count().saturating_sub(1));
                    target = Some((index, frame));
                    break;
                }
                start += length;
            }
            if let Some((index, _)) = target {
                if index != state.current {
                    state.local_loop = false;
                    let current = state.current;
                    state.notify_transition(current, index);
                }
            }
            target
        };

        if let Some((index, frame)) = target {
            self.restart(index, frame);
            self.emit_pending();
        }
    }

    fn duration(&self) -> f64 {
        self.shared.state.borrow().total()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::test_util::{headless_engine, run_for, source};

    type Log = Rc<RefCell<Vec<MusicEvent>>>;

    fn record(music: &MusicBuffer) -> Log {
        let log: Log = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&log);
        music.set_listener(move |_, event| sink.borrow_mut().push(event.clone()));
        log
    }

    fn transition(from: &AudioSource, to: &AudioSource) -> MusicEvent {
        MusicEvent::Transition {
            from: from.clone(),
            to: to.clone(),
        }
    }

    #[test]
    fn test_gapless_transition_is_confirmed_late() {
        let (engine, device) = headless_engine(2);
        let a = source(1, 1_000, 150);
        let b = source(1, 1_000, 150);
        let music = engine.new_music(&[a.clone(), b.clone()]);
        let log = record(&music);
        music.play().expect("free voice");

        // B is queued right behind A but not heard yet
        run_for(&engine, &device, Duration::from_millis(100));
        assert_eq!(music.current_index(), 0);
        assert!(log.borrow().is_empty());

        run_for(&engine, &device, Duration::from_millis(100));
        assert_eq!(music.current_index(), 1);
        assert_eq!(*log.borrow(), vec![transition(&a, &b)]);

        run_for(&engine, &device, Duration::from_millis(200));
        assert_eq!(log.borrow().last(), Some(&MusicEvent::Completion));
        assert_eq!(music.state(), PlaybackState::Stopped);
        assert_eq!(music.current_index(), 0);
        assert_eq!(engine.active_voices(), 0);
    }

    #[test]
    fn test_global_loop_wraps_to_first() {
        let (engine, device) = headless_engine(2);
        let a = source(1, 1_000, 150);
        let b = source(1, 1_000, 150);
        let music = engine.new_music(&[a.clone(), b.clone()]);
        music.set_looping(true);
        let log = record(&music);
        music.play().expect("free voice");

        run_for(&engine, &device, Duration::from_millis(400));
        let events = log.borrow();
        assert!(events.len() >= 2);
        assert_eq!(events[0], transition(&a, &b));
        assert_eq!(events[1], transition(&b, &a));
        assert!(!events.contains(&MusicEvent::Completion));
        assert_eq!(music.state(), PlaybackState::Playing);
    }

    #[test]
    fn test_global_wrap_beats_local_loop_on_last_entry() {
        let (engine, device) = headless_engine(2);
        let a = source(1, 1_000, 150);
        let music = engine.new_music(&[a.clone()]);
        music.set_looping(true);
        music.set_loop_behavior(true);
        let log = record(&music);
        music.play().expect("free voice");

        run_for(&engine, &device, Duration::from_millis(250));
        let events = log.borrow();
        assert_eq!(events.first(), Some(&transition(&a, &a)));
        assert!(!events.iter().any(|e| matches!(e, MusicEvent::Loopback { .. })));
        assert!(!music.loop_behavior());
    }

    #[test]
    fn test_local_loop_repeats_current() {
        let (engine, device) = headless_engine(2);
        let a = source(1, 1_000, 150);
        let b = source(1, 1_000, 150);
        let music = engine.new_music(&[a.clone(), b]);
        music.set_loop_behavior(true);
        let log = record(&music);
        music.play().expect("free voice");

        run_for(&engine, &device, Duration::from_millis(500));
        assert_eq!(music.current_index(), 0);
        let events = log.borrow();
        assert!(events.len() >= 2);
        assert!(events
            .iter()
            .all(|e| *e == MusicEvent::Loopback { source: a.clone() }));
    }

    #[test]
    fn test_advance_clears_local_loop() {
        let (engine, _device) = headless_engine(2);
        let a = source(1, 1_000, 150);
        let b = source(1, 1_000, 150);
        let music = engine.new_music(&[a, b.clone()]);

        music.set_loop_behavior(true);
        music.advance_source(1).expect("valid step");

        assert!(!music.loop_behavior());
        assert_eq!(music.current_index(), 1);
        assert_eq!(music.current_source(), Some(b));
    }

    #[test]
    fn test_advance_rejects_negative_steps() {
        let (engine, _device) = headless_engine(2);
        let music = engine.new_music(&[source(1, 1_000, 150), source(1, 1_000, 150)]);
        music.advance_source(1).expect("valid step");

        let err = music.advance_source(-1).expect_err("backwards is not allowed");
        assert!(matches!(err, AudioError::InvalidArgument(_)));
        assert_eq!(music.current_index(), 1);
    }

    #[test]
    fn test_advance_past_end() {
        let (engine, _device) = headless_engine(2);
        let music = engine.new_music(&[source(1, 1_000, 150), source(1, 1_000, 150)]);
        let log = record(&music);
        music.play().expect("free voice");

        music.advance_source(5).expect("valid step");
        assert_eq!(music.state(), PlaybackState::Stopped);
        assert_eq!(*log.borrow(), vec![MusicEvent::Completion]);
        assert_eq!(engine.active_voices(), 0);

        music.set_looping(true);
        music.play().expect("free voice");
        music.advance_source(3).expect("valid step");
        assert_eq!(music.current_index(), 1);
        assert_eq!(music.state(), PlaybackState::Playing);
    }

    #[test]
    fn test_remove_current_fires_synchronously() {
        let (engine, device) = headless_engine(2);
        let a = source(1, 1_000, 500);
        let b = source(1, 1_000, 500);
        let music = engine.new_music(&[a.clone(), b.clone()]);
        let log = record(&music);
        music.play().expect("free voice");
        run_for(&engine, &device, Duration::from_millis(50));

        let removed = music.remove_source(0).expect("index in range");
        assert_eq!(removed, a);
        assert_eq!(music.current_index(), 0);
        assert_eq!(music.current_source(), Some(b.clone()));
        assert_eq!(*log.borrow(), vec![transition(&a, &b)]);
        assert!(music.position().abs() < 1e-9);
    }

    #[test]
    fn test_remove_last_remaining_completes() {
        let (engine, _device) = headless_engine(2);
        let music = engine.new_music(&[source(1, 1_000, 500)]);
        let log = record(&music);
        music.play().expect("free voice");

        music.remove_source(0).expect("index in range");
        assert_eq!(music.state(), PlaybackState::Stopped);
        assert_eq!(*log.borrow(), vec![MusicEvent::Completion]);
        assert!(music.remove_source(0).is_err());
    }

    #[test]
    fn test_remove_before_current_shifts_cursor() {
        let (engine, _device) = headless_engine(2);
        let c = source(1, 1_000, 150);
        let music = engine.new_music(&[source(1, 1_000, 150), source(1, 1_000, 150), c.clone()]);
        music.jump_to_source(2).expect("index in range");

        music.remove_source(0).expect("index in range");
        assert_eq!(music.current_index(), 1);
        assert_eq!(music.current_source(), Some(c));
    }

    #[test]
    fn test_insert_and_add_while_finishing() {
        let (engine, device) = headless_engine(2);
        let a = source(1, 1_000, 150);
        let b = source(1, 1_000, 150);
        let music = engine.new_music(&[a.clone()]);
        let log = record(&music);
        music.play().expect("free voice");

        // A has queued its last frames; appending must still continue into B
        run_for(&engine, &device, Duration::from_millis(60));
        music.add_source(b.clone());
        run_for(&engine, &device, Duration::from_millis(200));

        assert_eq!(log.borrow().first(), Some(&transition(&a, &b)));
        assert!(music.insert_source(9, a).is_err());
    }

    #[test]
    fn test_set_source_on_current_is_transition() {
        let (engine, _device) = headless_engine(2);
        let a = source(1, 1_000, 150);
        let b = source(1, 1_000, 150);
        let music = engine.new_music(&[a.clone()]);
        let log = record(&music);
        music.play().expect("free voice");

        let old = music.set_source(0, b.clone()).expect("index in range");
        assert_eq!(old, a);
        assert_eq!(*log.borrow(), vec![transition(&a, &b)]);
        assert_eq!(music.sources(), vec![b]);
    }

    #[test]
    fn test_jump_to_source_bounds() {
        let (engine, _device) = headless_engine(2);
        let music = engine.new_music(&[source(1, 1_000, 150), source(1, 1_000, 150)]);
        assert!(matches!(
            music.jump_to_source(2),
            Err(AudioError::InvalidArgument(_))
        ));
        music.jump_to_source(1).expect("index in range");
        music.jump_to_source(0).expect("backwards is allowed");
        assert_eq!(music.current_index(), 0);

        music.jump_to_source(1).expect("index in range");
        music.reset();
        assert_eq!(music.current_index(), 0);
    }

    #[test]
    fn test_reset_returns_to_first_entry() {
        let (engine, device) = headless_engine(2);
        let a = source(1, 1_000, 150);
        let b = source(1, 1_000, 150);
        let music = engine.new_music(&[a.clone(), b.clone()]);
        let log = record(&music);
        music.play().expect("free voice");
        run_for(&engine, &device, Duration::from_millis(200));
        assert_eq!(music.current_index(), 1);

        music.reset();
        assert_eq!(music.current_index(), 0);
        assert_eq!(log.borrow().last(), Some(&transition(&b, &a)));
        assert_eq!(music.state(), PlaybackState::Playing);

        // Nothing to return to
        let empty = engine.new_music(&[]);
        empty.reset();
        assert_eq!(empty.current_index(), 0);
        assert!(empty.current_source().is_none());
    }

    #[test]
    fn test_dropping_buffer_releases_voice() {
        let (engine, device) = headless_engine(2);
        let music = engine.new_music(&[source(1, 1_000, 1_000)]);
        music.play().expect("free voice");
        run_for(&engine, &device, Duration::from_millis(50));
        assert_eq!(engine.active_voices(), 1);

        drop(music);
        assert_eq!(engine.active_voices(), 0);
        run_for(&engine, &device, Duration::from_millis(50));
        assert_eq!(engine.active_voices(), 0);
    }

    #[test]
    fn test_accumulated_position_and_duration() {
        let (engine, device) = headless_engine(2);
        let music = engine.new_music(&[source(1, 1_000, 1_000), source(1, 1_000, 1_000)]);
        assert!((music.duration() - 2.0).abs() < 1e-9);

        music.play().expect("free voice");
        run_for(&engine, &device, Duration::from_millis(1_250));
        assert_eq!(music.current_index(), 1);
        assert!((music.position() - 1.25).abs() < 0.02);
    }

    #[test]
    fn test_set_position_crosses_entries() {
        let (engine, device) = headless_engine(2);
        let a = source(1, 1_000, 1_000);
        let b = source(2, 1_000, 1_000);
        let music = engine.new_music(&[a.clone(), b.clone()]);
        music.set_loop_behavior(true);
        let log = record(&music);

        music.set_position(1.5);
        assert_eq!(music.current_index(), 1);
        assert!((music.position() - 1.5).abs() < 1e-9);
        assert!(!music.loop_behavior());
        // Not playing yet, so nothing is announced
        assert!(log.borrow().is_empty());

        music.play().expect("free voice");
        run_for(&engine, &device, Duration::from_millis(200));
        assert!((music.position() - 1.7).abs() < 0.02);

        music.set_position(-3.0);
        assert_eq!(music.current_index(), 0);
        assert!(music.position().abs() < 1e-9);
        assert_eq!(*log.borrow(), vec![transition(&b, &a)]);

        music.set_position(99.0);
        assert_eq!(music.current_index(), 1);
    }

    #[test]
    fn test_pause_resume_and_stop() {
        let (engine, device) = headless_engine(2);
        let music = engine.new_music(&[source(1, 1_000, 1_000)]);
        music.play().expect("free voice");
        run_for(&engine, &device, Duration::from_millis(100));

        music.pause();
        assert!(music.is_paused());
        let held = music.position();
        run_for(&engine, &device, Duration::from_millis(300));
        assert!((music.position() - held).abs() < 1e-9);

        music.resume();
        assert_eq!(music.state(), PlaybackState::Playing);
        assert!(music.is_active());

        music.stop();
        assert_eq!(music.state(), PlaybackState::Stopped);
        assert!(music.position().abs() < 1e-9);
        assert_eq!(engine.active_voices(), 0);
    }

    #[test]
    fn test_volume_pitch_pan_reach_voice() {
        let (engine, device) = headless_engine(2);
        let music = engine.new_music(&[source(2, 1_000, 1_000)]);
        music.play().expect("free voice");

        music.set_volume(0.5);
        music.set_pitch(8.0);
        music.set_pan(0.25);

        let voice = device.voice(0).expect("voice 0 exists");
        assert!((voice.volume - 0.5).abs() < f32::EPSILON);
        assert!((voice.speed - 4.0).abs() < f32::EPSILON);
        assert!((voice.pan - 0.25).abs() < f32::EPSILON);
        assert!((music.pitch() - 4.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_clear_sources_completes() {
        let (engine, _device) = headless_engine(2);
        let music = engine.new_music(&[source(1, 1_000, 150)]);
        let log = record(&music);
        music.play().expect("free voice");

        music.clear_sources();
        assert_eq!(music.source_count(), 0);
        assert_eq!(*log.borrow(), vec![MusicEvent::Completion]);
        assert!(matches!(music.play(), Err(AudioError::InvalidArgument(_))));
    }

    #[test]
    fn test_listener_may_edit_queue() {
        let (engine, device) = headless_engine(2);
        let a = source(1, 1_000, 150);
        let b = source(1, 1_000, 150);
        let music = engine.new_music(&[a.clone(), b.clone()]);
        let log: Log = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&log);
        music.set_listener(move |buffer, event| {
            sink.borrow_mut().push(event.clone());
            if matches!(event, MusicEvent::Transition { .. }) {
                buffer.remove_source(0).expect("index in range");
            }
        });
        music.play().expect("free voice");

        run_for(&engine, &device, Duration::from_millis(400));
        let events = log.borrow();
        assert_eq!(events[0], transition(&a, &b));
        assert_eq!(music.sources(), vec![b]);
    }
}
