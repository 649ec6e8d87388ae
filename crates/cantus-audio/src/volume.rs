//! Volume categories.
//!
//! A voice's hardware gain is `master × category × own volume`, where the
//! category is [`AudioCategory::Music`] for music buffers and
//! [`AudioCategory::Sfx`] for sound buffers.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::config::AudioConfig;

/// Audio category for volume mixing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum AudioCategory {
    /// Master volume (affects all audio).
    Master,
    /// Music buffers.
    Music,
    /// Sound buffers.
    #[default]
    Sfx,
}

/// Volume settings for audio categories.
#[derive(Debug, Clone)]
pub struct VolumeSettings {
    volumes: HashMap<AudioCategory, f32>,
}

impl Default for VolumeSettings {
    fn default() -> Self {
        Self::from_config(&AudioConfig::default())
    }
}

impl VolumeSettings {
    /// Seed the settings from engine configuration.
    #[must_use]
    pub fn from_config(config: &AudioConfig) -> Self {
        let mut settings = Self {
            volumes: HashMap::new(),
        };
        settings.set(AudioCategory::Master, config.master_volume);
        settings.set(AudioCategory::Music, config.music_volume);
        settings.set(AudioCategory::Sfx, config.sfx_volume);
        settings
    }

    /// Get volume for a category.
    #[must_use]
    pub fn get(&self, category: AudioCategory) -> f32 {
        self.volumes.get(&category).copied().unwrap_or(1.0)
    }

    /// Set volume for a category.
    pub fn set(&mut self, category: AudioCategory, volume: f32) {
        self.volumes.insert(category, volume.clamp(0.0, 1.0));
    }

    /// Get effective volume for a category (includes master).
    #[must_use]
    pub fn effective(&self, category: AudioCategory) -> f32 {
        let master = self.get(AudioCategory::Master);
        if category == AudioCategory::Master {
            return master;
        }
        master * self.get(category)
    }
}
