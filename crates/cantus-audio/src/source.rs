//! Audio sources.
//!
//! An [`AudioSource`] is the immutable handle over one encoded asset. It
//! parses the container header eagerly and keeps the encoded bytes
//! resident so that any number of independent [`AudioStream`]s can be
//! opened over it. Cloning a source is cheap and shares the same asset.
//!
//! ```ignore
//! let file = std::fs::File::open("assets/music/theme.ogg")?;
//! let source = AudioSource::from_reader("theme.ogg", file)?;
//!
//! println!("{} Hz, {} ch, {:.2}s", source.sample_rate(), source.channels(), source.duration());
//! let mut stream = source.stream();
//! ```

use std::io::Read;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::decode::DecodeSession;
use crate::error::{AudioError, AudioResult};
use crate::stream::AudioStream;

/// Size above which a full in-memory read is logged as expensive.
pub const LARGE_ASSET_BYTES: u64 = 1024 * 1024;

/// Bytes per sample of the 16-bit PCM representation.
pub const BYTES_PER_SAMPLE: u64 = 2;

/// Header of a decodable asset, expressed as 16-bit PCM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    /// Number of channels (1 = mono, 2 = stereo).
    pub channels: u16,
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Size of the whole asset as interleaved 16-bit PCM.
    pub byte_size: u64,
}

impl AudioFormat {
    /// Create a header from a frame count.
    #[must_use]
    pub fn from_frames(channels: u16, sample_rate: u32, frames: u64) -> Self {
        Self {
            channels,
            sample_rate,
            byte_size: frames * u64::from(channels) * BYTES_PER_SAMPLE,
        }
    }

    /// Number of frames (samples per channel).
    #[must_use]
    pub fn frame_count(&self) -> u64 {
        self.byte_size / (BYTES_PER_SAMPLE * u64::from(self.channels.max(1)))
    }

    /// Number of interleaved samples.
    #[must_use]
    pub fn sample_count(&self) -> u64 {
        self.byte_size / BYTES_PER_SAMPLE
    }

    /// Duration in seconds.
    #[must_use]
    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frame_count() as f64 / f64::from(self.sample_rate)
    }

    /// Convert a frame count to seconds.
    #[must_use]
    pub fn frames_to_seconds(&self, frames: u64) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        frames as f64 / f64::from(self.sample_rate)
    }

    /// Convert seconds to a frame count, clamped to the asset.
    #[must_use]
    pub fn seconds_to_frames(&self, seconds: f64) -> u64 {
        let frames = (seconds.max(0.0) * f64::from(self.sample_rate)).round() as u64;
        frames.min(self.frame_count())
    }
}

#[derive(Debug)]
struct SourceInner {
    name: String,
    bytes: Arc<[u8]>,
    format: AudioFormat,
}

/// Immutable handle to one decodable audio asset.
#[derive(Debug, Clone)]
pub struct AudioSource {
    inner: Arc<SourceInner>,
}

impl PartialEq for AudioSource {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for AudioSource {}

impl AudioSource {
    /// Read an already-resolved asset handle to the end and parse its header.
    ///
    /// `name` is used as a format hint (by extension) and in diagnostics; the
    /// engine never opens paths itself.
    pub fn from_reader(name: impl Into<String>, mut reader: impl Read) -> AudioResult<Self> {
        let name = name.into();
        let mut bytes = Vec::new();
        reader
            .read_to_end(&mut bytes)
            .map_err(|e| AudioError::asset(&name, e))?;
        Self::from_bytes(name, bytes)
    }

    /// Parse an asset that is already in memory.
    pub fn from_bytes(name: impl Into<String>, bytes: impl Into<Arc<[u8]>>) -> AudioResult<Self> {
        let name = name.into();
        let bytes = bytes.into();
        let (mut session, info) = DecodeSession::open(&name, &bytes)?;

        let frames = match info.declared_frames {
            Some(frames) if info.exact_length => frames,
            _ => session.count_frames(info.channels),
        };
        if frames == 0 {
            return Err(AudioError::asset(&name, "asset contains no audio frames"));
        }

        let format = AudioFormat::from_frames(info.channels, info.sample_rate, frames);
        debug!(
            "Loaded audio source '{}': {} ch, {} Hz, {} bytes ({:.3}s)",
            name,
            format.channels,
            format.sample_rate,
            format.byte_size,
            format.duration()
        );

        Ok(Self {
            inner: Arc::new(SourceInner {
                name,
                bytes,
                format,
            }),
        })
    }

    /// Name the asset was opened under.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The parsed header.
    #[must_use]
    pub fn format(&self) -> AudioFormat {
        self.inner.format
    }

    /// Number of channels (1 or 2).
    #[must_use]
    pub fn channels(&self) -> u16 {
        self.inner.format.channels
    }

    /// Sample rate in Hz.
    #[must_use]
    pub fn sample_rate(&self) -> u32 {
        self.inner.format.sample_rate
    }

    /// Duration in seconds.
    #[must_use]
    pub fn duration(&self) -> f64 {
        self.inner.format.duration()
    }

    /// Size of the asset as interleaved 16-bit PCM.
    #[must_use]
    pub fn byte_size(&self) -> u64 {
        self.inner.format.byte_size
    }

    /// Open a fresh, independent stream positioned at the first frame.
    #[must_use]
    pub fn stream(&self) -> AudioStream {
        AudioStream::new(self.clone())
    }

    /// Decode the whole asset into one interleaved sample buffer.
    ///
    /// This holds the entire asset in memory; prefer [`Self::stream`] for
    /// anything longer than a short effect.
    pub fn data(&self) -> AudioResult<Vec<i16>> {
        if self.byte_size() > LARGE_ASSET_BYTES {
            warn!(
                "Loading '{}' fully into memory ({} bytes)",
                self.name(),
                self.byte_size()
            );
        }

        let (mut session, _) = self.open_session()?;
        let mut samples = Vec::with_capacity(self.format().sample_count() as usize);
        while session.next_page(&mut samples) > 0 {}
        Ok(samples)
    }

    pub(crate) fn open_session(&self) -> AudioResult<(DecodeSession, crate::decode::TrackInfo)> {
        DecodeSession::open(&self.inner.name, &self.inner.bytes)
    }
}
