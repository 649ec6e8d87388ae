//! Engine configuration.

use serde::{Deserialize, Serialize};

/// Default number of simultaneous hardware voices.
pub const DEFAULT_MAX_VOICES: usize = 32;

/// Default number of frames decoded into one hardware chunk.
pub const DEFAULT_CHUNK_FRAMES: usize = 4096;

/// Default number of chunks kept queued on each voice.
pub const DEFAULT_QUEUE_DEPTH: usize = 3;

/// Audio engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Maximum number of simultaneous voices. The engine's capacity is the
    /// smaller of this and what the device can open.
    pub max_voices: usize,
    /// Frames requested per hardware chunk.
    pub chunk_frames: usize,
    /// Chunks kept in flight per voice (the buffering period).
    pub queue_depth: usize,
    /// Master volume (0.0 - 1.0).
    pub master_volume: f32,
    /// Music volume (0.0 - 1.0).
    pub music_volume: f32,
    /// Sound effects volume (0.0 - 1.0).
    pub sfx_volume: f32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            max_voices: DEFAULT_MAX_VOICES,
            chunk_frames: DEFAULT_CHUNK_FRAMES,
            queue_depth: DEFAULT_QUEUE_DEPTH,
            master_volume: 1.0,
            music_volume: 1.0,
            sfx_volume: 1.0,
        }
    }
}

impl AudioConfig {
    /// Create config with max voices.
    #[must_use]
    pub const fn with_max_voices(mut self, max: usize) -> Self {
        self.max_voices = max;
        self
    }

    /// Create config with chunk size in frames.
    #[must_use]
    pub const fn with_chunk_frames(mut self, frames: usize) -> Self {
        self.chunk_frames = frames;
        self
    }

    /// Create config with the per-voice queue depth.
    #[must_use]
    pub const fn with_queue_depth(mut self, depth: usize) -> Self {
        self.queue_depth = depth;
        self
    }

    /// Create config with master volume.
    #[must_use]
    pub const fn with_master_volume(mut self, volume: f32) -> Self {
        self.master_volume = volume;
        self
    }

    /// Clamp configuration values to sensible ranges.
    pub fn validate(&mut self) {
        self.max_voices = self.max_voices.clamp(1, 256);
        self.chunk_frames = self.chunk_frames.clamp(64, 65_536);
        self.queue_depth = self.queue_depth.clamp(1, 16);
        self.master_volume = self.master_volume.clamp(0.0, 1.0);
        self.music_volume = self.music_volume.clamp(0.0, 1.0);
        self.sfx_volume = self.sfx_volume.clamp(0.0, 1.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audio_config_default() {
        let config = AudioConfig::default();
        assert_eq!(config.max_voices, DEFAULT_MAX_VOICES);
        assert_eq!(config.queue_depth, DEFAULT_QUEUE_DEPTH);
        assert!((config.master_volume - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_audio_config_builder() {
        let config = AudioConfig::default()
            .with_max_voices(4)
            .with_chunk_frames(256)
            .with_queue_depth(2)
            .with_master_volume(0.5);

        assert_eq!(config.max_voices, 4);
        assert_eq!(config.chunk_frames, 256);
        assert_eq!(config.queue_depth, 2);
        assert!((config.master_volume - 0.5).abs() < f32::EPSILON);
    }

    #[test]
    fn test_config_validation() {
        let mut config = AudioConfig::default()
            .with_max_voices(0)
            .with_queue_depth(100)
            .with_master_volume(2.0);
        config.validate();

        assert_eq!(config.max_voices, 1);
        assert_eq!(config.queue_depth, 16);
        assert!((config.master_volume - 1.0).abs() < f32::EPSILON);
    }
}
