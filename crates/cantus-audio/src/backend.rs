//! Rodio output device.
//!
//! Wraps rodio's default output stream and opens one [`Sink`] per voice.
//! Queued [`PcmChunk`]s are appended to the sink as stereo `f32` sources
//! that read the voice's pan once per frame while playing, so a pan change
//! also reaches chunks that are already queued.
//!
//! ```text
//! ┌────────────────────────────────────────────┐
//! │               RodioDevice                  │
//! │  OutputStream ── Sink[0] ◄── PcmChunk ...  │
//! │               ├─ Sink[1] ◄── PcmChunk ...  │
//! │               └─ Sink[N-1]                 │
//! └────────────────────────────────────────────┘
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rodio::{OutputStream, OutputStreamHandle, Sink, Source};
use tracing::{debug, info, warn};

use crate::device::{AudioDevice, PcmChunk};
use crate::error::{AudioError, AudioResult};
use crate::stream::sample_to_float;

/// State of one rodio sink.
struct SinkState {
    sink: Sink,
    /// Sample rates of chunks appended and not yet known to be finished.
    rates: VecDeque<u32>,
    paused: bool,
    volume: f32,
    pan: SharedPan,
    speed: f32,
}

impl std::fmt::Debug for SinkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SinkState")
            .field("queued", &self.sink.len())
            .field("paused", &self.paused)
            .field("volume", &self.volume)
            .field("pan", &self.pan.get())
            .field("speed", &self.speed)
            .finish_non_exhaustive()
    }
}

impl SinkState {
    fn new(sink: Sink) -> Self {
        Self {
            sink,
            rates: VecDeque::new(),
            paused: false,
            volume: 1.0,
            pan: SharedPan::default(),
            speed: 1.0,
        }
    }

    /// Drop bookkeeping for chunks the sink has finished.
    fn trim(&mut self) {
        let live = self.sink.len();
        while self.rates.len() > live {
            self.rates.pop_front();
        }
    }

    fn apply_settings(&self) {
        self.sink.set_volume(self.volume);
        self.sink.set_speed(self.speed);
        if self.paused {
            self.sink.pause();
        } else {
            self.sink.play();
        }
    }
}

/// Linear balance gains for a pan position.
fn pan_gains(pan: f32) -> (f32, f32) {
    let pan = pan.clamp(-1.0, 1.0);
    ((1.0 - pan).min(1.0), (1.0 + pan).min(1.0))
}

/// Pan position shared between a voice and the chunks queued on its sink.
#[derive(Debug, Clone, Default)]
struct SharedPan(Arc<AtomicU32>);

impl SharedPan {
    fn set(&self, pan: f32) {
        self.0.store(pan.to_bits(), Ordering::Relaxed);
    }

    fn get(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Relaxed))
    }
}

/// One queued chunk, played as stereo with the voice's current pan.
struct PannedChunk {
    samples: std::vec::IntoIter<i16>,
    channels: u16,
    sample_rate: u32,
    duration: Duration,
    pan: SharedPan,
    /// Right sample of the frame whose left sample was just yielded.
    right: Option<f32>,
}

impl PannedChunk {
    fn new(chunk: PcmChunk, pan: SharedPan) -> Self {
        let duration = chunk.duration();
        Self {
            samples: chunk.samples.into_iter(),
            channels: chunk.channels.max(1),
            sample_rate: chunk.sample_rate,
            duration,
            pan,
            right: None,
        }
    }
}

impl Iterator for PannedChunk {
    type Item = f32;

    fn next(&mut self) -> Option<f32> {
        if let Some(right) = self.right.take() {
            return Some(right);
        }
        let left = sample_to_float(self.samples.next()?);
        let right = if self.channels == 1 {
            left
        } else {
            sample_to_float(self.samples.next()?)
        };
        let (left_gain, right_gain) = pan_gains(self.pan.get());
        self.right = Some(right * right_gain);
        Some(left * left_gain)
    }
}

impl Source for PannedChunk {
    fn current_frame_len(&self) -> Option<usize> {
        None
    }

    fn channels(&self) -> u16 {
        2
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn total_duration(&self) -> Option<Duration> {
        Some(self.duration)
    }
}

/// Default output device with one rodio sink per voice.
pub struct RodioDevice {
    /// The output stream (must be kept alive).
    _stream: OutputStream,
    /// Handle for creating sinks.
    handle: OutputStreamHandle,
    voices: Vec<SinkState>,
}

impl std::fmt::Debug for RodioDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RodioDevice")
            .field("voices", &self.voices.len())
            .finish_non_exhaustive()
    }
}

impl RodioDevice {
    /// Open the default output and create up to `voices` sinks.
    pub fn new(voices: usize) -> AudioResult<Self> {
        let (stream, handle) =
            OutputStream::try_default().map_err(|e| AudioError::DeviceInitFailed(e.to_string()))?;

        let mut sinks = Vec::with_capacity(voices);
        for i in 0..voices {
            match Sink::try_new(&handle) {
                Ok(sink) => sinks.push(SinkState::new(sink)),
                Err(e) => {
                    if i == 0 {
                        // Need at least one voice
                        return Err(AudioError::DeviceInitFailed(e.to_string()));
                    }
                    warn!("Could only create {} audio sinks", i);
                    break;
                },
            }
        }

        info!("Audio device initialized with {} sinks", sinks.len());

        Ok(Self {
            _stream: stream,
            handle,
            voices: sinks,
        })
    }
}

impl AudioDevice for RodioDevice {
    fn voice_count(&self) -> usize {
        self.voices.len()
    }

    fn queue(&mut self, voice: usize, chunk: PcmChunk) {
        let Some(state) = self.voices.get_mut(voice) else {
            return;
        };
        state.trim();
        state.rates.push_back(chunk.sample_rate);
        state
            .sink
            .append(PannedChunk::new(chunk, state.pan.clone()));
    }

    fn queued(&self, voice: usize) -> usize {
        self.voices.get(voice).map_or(0, |s| s.sink.len())
    }

    fn head_frames_played(&self, voice: usize) -> u64 {
        let Some(state) = self.voices.get(voice) else {
            return 0;
        };
        let finished = state.rates.len().saturating_sub(state.sink.len());
        let rate = state.rates.get(finished).copied().unwrap_or(0);
        (state.sink.get_pos().as_secs_f64() * f64::from(rate)) as u64
    }

    fn play(&mut self, voice: usize) {
        if let Some(state) = self.voices.get_mut(voice) {
            state.paused = false;
            state.sink.play();
        }
    }

    fn pause(&mut self, voice: usize) {
        if let Some(state) = self.voices.get_mut(voice) {
            state.paused = true;
            state.sink.pause();
        }
    }

    fn clear(&mut self, voice: usize) {
        let Some(state) = self.voices.get_mut(voice) else {
            return;
        };
        // A fresh sink is the only way to drop queued sources immediately
        match Sink::try_new(&self.handle) {
            Ok(sink) => {
                state.sink.stop();
                state.sink = sink;
            },
            Err(e) => {
                debug!("Could not replace sink {}: {}", voice, e);
                state.sink.stop();
            },
        }
        state.rates.clear();
        state.apply_settings();
    }

    fn set_volume(&mut self, voice: usize, volume: f32) {
        if let Some(state) = self.voices.get_mut(voice) {
            state.volume = volume;
            state.sink.set_volume(volume);
        }
    }

    fn set_pan(&mut self, voice: usize, pan: f32) {
        if let Some(state) = self.voices.get_mut(voice) {
            state.pan.set(pan);
        }
    }

    fn set_speed(&mut self, voice: usize, speed: f32) {
        if let Some(state) = self.voices.get_mut(voice) {
            state.speed = speed;
            state.sink.set_speed(speed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Note: sink tests require an actual audio device, so only the
    // conversion helpers are covered here

    #[test]
    fn test_pan_gains() {
        let (l, r) = pan_gains(0.0);
        assert!((l - 1.0).abs() < f32::EPSILON && (r - 1.0).abs() < f32::EPSILON);

        let (l, r) = pan_gains(-1.0);
        assert!((l - 1.0).abs() < f32::EPSILON && r.abs() < f32::EPSILON);

        let (l, r) = pan_gains(0.5);
        assert!((l - 0.5).abs() < f32::EPSILON && (r - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_mono_chunk_plays_as_stereo() {
        let chunk = PcmChunk::new(vec![32_767, 0, -32_768], 1, 8_000);
        let out: Vec<f32> = PannedChunk::new(chunk, SharedPan::default()).collect();
        assert_eq!(out, vec![1.0, 1.0, 0.0, 0.0, -1.0, -1.0]);
    }

    #[test]
    fn test_pan_change_reaches_queued_chunk() {
        let pan = SharedPan::default();
        let chunk = PcmChunk::new(vec![32_767; 6], 2, 8_000);
        let mut source = PannedChunk::new(chunk, pan.clone());
        assert_eq!(source.channels(), 2);

        // First frame is heard centred
        assert_eq!(source.next(), Some(1.0));
        assert_eq!(source.next(), Some(1.0));

        // Panning hard right after queueing silences the left side
        pan.set(1.0);
        let rest: Vec<f32> = source.collect();
        assert_eq!(rest.len(), 4);
        assert!(rest[0].abs() < f32::EPSILON && rest[2].abs() < f32::EPSILON);
        assert!((rest[1] - 1.0).abs() < f32::EPSILON && (rest[3] - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_total_duration() {
        let chunk = PcmChunk::new(vec![0; 800], 2, 8_000);
        let source = PannedChunk::new(chunk, SharedPan::default());
        assert_eq!(source.total_duration(), Some(Duration::from_millis(50)));
    }
}
