//! Voice pool.
//!
//! The pool owns a fixed number of slots, one per hardware voice. A slot is
//! either free or holds a [`Binding`]: the buffer driving the voice, the
//! tag identifying which of its playbacks it is, and the bookkeeping needed
//! to follow that playback through the device queue.
//!
//! ```text
//! slot ─► Binding { client, tag, kind, evictable, pause, in_flight }
//!                                                      │
//!                      oldest ◄── ChunkMeta ChunkMeta ChunkMeta ◄── newest
//!                      (head, being played)            (last filled)
//! ```
//!
//! When every slot is taken, an [`EvictionPolicy`] picks a victim among the
//! bindings that were evictable when they were bound.

use std::collections::VecDeque;
use std::rc::{Rc, Weak};

use tracing::debug;

use crate::device::PcmChunk;
use crate::music::MusicEvent;
use crate::volume::AudioCategory;

/// What a voice is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VoiceKind {
    /// A music buffer.
    Music,
    /// One instance of a sound buffer.
    Sound,
}

impl VoiceKind {
    /// Volume category voices of this kind are mixed under.
    #[must_use]
    pub const fn category(&self) -> AudioCategory {
        match self {
            Self::Music => AudioCategory::Music,
            Self::Sound => AudioCategory::Sfx,
        }
    }
}

/// Where a voice's current pause came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PauseOrigin {
    /// Not paused.
    #[default]
    None,
    /// Paused by the buffer that owns it.
    Local,
    /// Paused by the engine-wide pause.
    Global,
}

/// Read-only view of one bound voice, handed to an [`EvictionPolicy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VoiceSnapshot {
    /// Voice index.
    pub index: usize,
    /// What the voice is bound to.
    pub kind: VoiceKind,
    /// Evictable predicate result captured at allocation.
    pub evictable: bool,
    /// Allocation sequence number; lower means started earlier.
    pub started: u64,
    /// Current pause origin.
    pub pause: PauseOrigin,
}

/// Chooses which bound voice gives way when the pool is full.
pub trait EvictionPolicy: std::fmt::Debug {
    /// Pick a voice index to evict from `voices`, or `None` to refuse.
    ///
    /// Only voices with `evictable == true` may be returned; anything else
    /// is treated as a refusal.
    fn select(&self, voices: &[VoiceSnapshot]) -> Option<usize>;
}

/// Default policy: never evict music, evict the oldest sound.
#[derive(Debug, Clone, Copy, Default)]
pub struct LeastRecentlyStarted;

impl EvictionPolicy for LeastRecentlyStarted {
    fn select(&self, voices: &[VoiceSnapshot]) -> Option<usize> {
        voices
            .iter()
            .filter(|v| v.evictable && v.kind == VoiceKind::Sound)
            .min_by_key(|v| v.started)
            .map(|v| v.index)
    }
}

/// Identifies one binding of one voice.
///
/// Tags are unique for the lifetime of an engine, so a lease whose voice
/// was evicted and rebound never matches the new binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct VoiceLease {
    pub voice: usize,
    pub tag: u64,
}

/// A chunk produced by a client, with where it sits in the client's audio.
#[derive(Debug)]
pub(crate) struct FilledChunk {
    pub chunk: PcmChunk,
    /// Client-defined entry the chunk belongs to (queue entry for music).
    pub entry: u64,
    /// Frame offset of the chunk inside its entry.
    pub start_frame: u64,
    /// Event to announce once the chunk has started playing.
    pub marker: Option<MusicEvent>,
}

/// Bookkeeping for a chunk queued on the device and not yet retired.
#[derive(Debug, Clone)]
pub(crate) struct ChunkMeta {
    pub entry: u64,
    pub start_frame: u64,
    pub frames: u64,
    pub marker: Option<MusicEvent>,
    pub announced: bool,
}

/// The buffer side of a binding.
///
/// All methods run while the engine core is mutably borrowed, so they must
/// not call back into the engine or run user code. Anything user-visible is
/// deferred until [`VoiceClient::dispatch`], which runs with no borrows held.
pub(crate) trait VoiceClient {
    /// Produce up to `max_frames` of the next audio for `tag`.
    ///
    /// `None` means the playback has nothing more to queue.
    fn fill(&self, tag: u64, max_frames: usize) -> Option<FilledChunk>;

    /// A chunk carrying `event` has started playing.
    fn started(&self, _tag: u64, _entry: u64, _event: MusicEvent) {}

    /// Everything queued for `tag` has played and nothing more will come.
    /// The voice has already been released.
    fn drained(&self, tag: u64);

    /// Deliver deferred notifications.
    fn dispatch(self: Rc<Self>);
}

/// One occupied voice slot.
pub(crate) struct Binding {
    pub client: Weak<dyn VoiceClient>,
    pub tag: u64,
    pub kind: VoiceKind,
    pub evictable: bool,
    pub started: u64,
    pub pause: PauseOrigin,
    /// Gain before category and master volume.
    pub volume: f32,
    pub in_flight: VecDeque<ChunkMeta>,
    /// The client returned `None` from its last fill.
    pub exhausted: bool,
}

impl std::fmt::Debug for Binding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Binding")
            .field("tag", &self.tag)
            .field("kind", &self.kind)
            .field("evictable", &self.evictable)
            .field("started", &self.started)
            .field("pause", &self.pause)
            .field("in_flight", &self.in_flight.len())
            .field("exhausted", &self.exhausted)
            .finish_non_exhaustive()
    }
}

impl Binding {
    /// Forget everything queued and allow filling again.
    pub fn reset_queue(&mut self) {
        self.in_flight.clear();
        self.exhausted = false;
    }
}

/// Fixed set of voice slots.
#[derive(Debug)]
pub(crate) struct VoicePool {
    slots: Vec<Option<Binding>>,
    policy: Box<dyn EvictionPolicy>,
    next_tag: u64,
    next_start: u64,
}

impl VoicePool {
    pub fn new(capacity: usize, policy: Box<dyn EvictionPolicy>) -> Self {
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            policy,
            next_tag: 1,
            next_start: 0,
        }
    }

    pub fn set_policy(&mut self, policy: Box<dyn EvictionPolicy>) {
        self.policy = policy;
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of bound voices.
    pub fn active(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn get(&self, lease: VoiceLease) -> Option<&Binding> {
        self.slots
            .get(lease.voice)?
            .as_ref()
            .filter(|b| b.tag == lease.tag)
    }

    pub fn get_mut(&mut self, lease: VoiceLease) -> Option<&mut Binding> {
        self.slots
            .get_mut(lease.voice)?
            .as_mut()
            .filter(|b| b.tag == lease.tag)
    }

    pub fn slot_mut(&mut self, voice: usize) -> Option<&mut Binding> {
        self.slots.get_mut(voice)?.as_mut()
    }

    pub fn bindings_mut(&mut self) -> impl Iterator<Item = (usize, &mut Binding)> {
        self.slots
            .iter_mut()
            .enumerate()
            .filter_map(|(i, s)| s.as_mut().map(|b| (i, b)))
    }

    pub fn snapshots(&self) -> Vec<VoiceSnapshot> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| {
                slot.as_ref().map(|b| VoiceSnapshot {
                    index,
                    kind: b.kind,
                    evictable: b.evictable,
                    started: b.started,
                    pause: b.pause,
                })
            })
            .collect()
    }

    /// First free slot.
    pub fn free_slot(&self) -> Option<usize> {
        self.slots.iter().position(Option::is_none)
    }

    /// Ask the policy for a victim and check it is allowed to go.
    pub fn choose_victim(&self) -> Option<usize> {
        let voices = self.snapshots();
        let choice = self.policy.select(&voices)?;
        let allowed = voices.iter().any(|v| v.index == choice && v.evictable);
        if !allowed {
            debug!("Eviction policy chose non-evictable voice {}", choice);
            return None;
        }
        Some(choice)
    }

    /// Occupy `voice` with a new binding and return its lease.
    pub fn occupy(
        &mut self,
        voice: usize,
        client: Weak<dyn VoiceClient>,
        kind: VoiceKind,
        evictable: bool,
        volume: f32,
    ) -> VoiceLease {
        let tag = self.next_tag;
        self.next_tag += 1;
        let started = self.next_start;
        self.next_start += 1;

        if let Some(slot) = self.slots.get_mut(voice) {
            *slot = Some(Binding {
                client,
                tag,
                kind,
                evictable,
                started,
                pause: PauseOrigin::None,
                volume,
                in_flight: VecDeque::new(),
                exhausted: false,
            });
        }
        VoiceLease { voice, tag }
    }

    /// Empty a slot, returning what was bound there.
    pub fn vacate(&mut self, voice: usize) -> Option<Binding> {
        self.slots.get_mut(voice)?.take()
    }
}
