//! Player configuration.
//!
//! The `[audio]` table is handed to the engine unchanged; the remaining
//! keys control the update loop.

use std::fs;
use std::io::{self, Write};
use std::path::Path;

use cantus_audio::AudioConfig;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Default configuration file name.
pub const CONFIG_FILE: &str = "cantus.toml";

/// Player configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayerConfig {
    /// Engine settings.
    pub audio: AudioConfig,
    /// Milliseconds between engine updates.
    pub update_interval_ms: u64,
    /// Run on a simulated clock with no output device.
    pub headless: bool,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            audio: AudioConfig::default(),
            update_interval_ms: 16,
            headless: false,
        }
    }
}

impl PlayerConfig {
    /// Load configuration from a specific path.
    /// Returns default config if file doesn't exist or is invalid.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();

        if !path.exists() {
            info!("Config file not found, using defaults");
            return Self::default();
        }

        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) => {
                warn!("Failed to read config file: {e}");
                return Self::default();
            },
        };

        match toml::from_str(&contents) {
            Ok(config) => {
                info!("Loaded config from {}", path.display());
                config
            },
            Err(e) => {
                warn!("Failed to parse config file: {e}");
                Self::default()
            },
        }
    }

    /// Save configuration to a specific path.
    pub fn save_to<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        let mut file = fs::File::create(path)?;
        file.write_all(contents.as_bytes())?;

        info!("Saved config to {}", path.display());
        Ok(())
    }

    /// Validate and clamp configuration values to sensible ranges.
    pub fn validate(&mut self) {
        self.audio.validate();
        self.update_interval_ms = self.update_interval_ms.clamp(1, 1_000);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = PlayerConfig::default();
        assert_eq!(config.update_interval_ms, 16);
        assert!(!config.headless);
        assert_eq!(config.audio, AudioConfig::default());
    }

    #[test]
    fn test_config_validation() {
        let mut config = PlayerConfig::default();
        config.update_interval_ms = 0;
        config.audio.master_volume = 2.0;

        config.validate();

        assert_eq!(config.update_interval_ms, 1);
        assert!((config.audio.master_volume - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_config_save_load() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let config_path = temp_dir.path().join("nested").join(CONFIG_FILE);

        let mut config = PlayerConfig::default();
        config.headless = true;
        config.update_interval_ms = 5;
        config.audio.max_voices = 4;

        config.save_to(&config_path).expect("Failed to save config");

        let loaded = PlayerConfig::load_from(&config_path);
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_config_partial_file() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let config_path = temp_dir.path().join(CONFIG_FILE);
        fs::write(&config_path, "headless = true\n\n[audio]\nqueue_depth = 6\n")
            .expect("Failed to write config");

        let loaded = PlayerConfig::load_from(&config_path);
        assert!(loaded.headless);
        assert_eq!(loaded.audio.queue_depth, 6);
        assert_eq!(loaded.audio.max_voices, AudioConfig::default().max_voices);
    }

    #[test]
    fn test_config_load_missing_file() {
        let config = PlayerConfig::load_from("/nonexistent/path/cantus.toml");
        assert_eq!(config, PlayerConfig::default());
    }

    #[test]
    fn test_config_load_invalid_file() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let config_path = temp_dir.path().join(CONFIG_FILE);
        fs::write(&config_path, "update_interval_ms = \"soon\"").expect("Failed to write config");

        let config = PlayerConfig::load_from(&config_path);
        assert_eq!(config, PlayerConfig::default());
    }
}
