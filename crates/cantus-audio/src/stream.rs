//! Forward-biased read cursor over an [`AudioSource`].
//!
//! A stream decodes lazily, one codec page at a time. Reads hand back at
//! most what is left of the current page, so a read may produce fewer units
//! than the caller's buffer holds; loop until a read returns 0 to drain the
//! asset.
//!
//! Three views of the same data are available and stay numerically
//! consistent with each other:
//!
//! - raw bytes: native-endian 16-bit PCM
//! - interleaved `i16` samples
//! - normalized `f32` samples (`sample / 32767.0`, clamped to `[-1, 1]`)
//!
//! Seeking is decode-and-skip. Moving backwards restarts decoding from the
//! first frame, so a backward seek costs time proportional to the target
//! position.

use std::ops::Range;

use tracing::warn;

use crate::decode::DecodeSession;
use crate::error::{AudioError, AudioResult};
use crate::source::{AudioSource, BYTES_PER_SAMPLE};

/// Convert a 16-bit sample to a normalized float.
#[must_use]
pub fn sample_to_float(sample: i16) -> f32 {
    (f32::from(sample) / 32767.0).max(-1.0)
}

/// Stateful read cursor over one source.
#[derive(Debug)]
pub struct AudioStream {
    source: AudioSource,
    session: Option<DecodeSession>,
    page: Vec<i16>,
    page_pos: usize,
    sample_offset: u64,
}

impl AudioStream {
    pub(crate) fn new(source: AudioSource) -> Self {
        Self {
            source,
            session: None,
            page: Vec::new(),
            page_pos: 0,
            sample_offset: 0,
        }
    }

    /// The source this stream reads from.
    #[must_use]
    pub fn source(&self) -> &AudioSource {
        &self.source
    }

    /// Current position in bytes of 16-bit PCM.
    #[must_use]
    pub fn byte_offset(&self) -> u64 {
        self.sample_offset * BYTES_PER_SAMPLE
    }

    /// Current position in interleaved samples.
    #[must_use]
    pub fn sample_offset(&self) -> u64 {
        self.sample_offset
    }

    /// Current position in frames.
    #[must_use]
    pub fn frame_offset(&self) -> u64 {
        self.sample_offset / u64::from(self.source.channels().max(1))
    }

    /// Read interleaved 16-bit samples. Returns 0 at end of stream.
    pub fn read_samples(&mut self, out: &mut [i16]) -> usize {
        if out.is_empty() || !self.load_page() {
            return 0;
        }
        let range = self.take(out.len());
        let n = range.len();
        out[..n].copy_from_slice(&self.page[range]);
        n
    }

    /// Read normalized float samples. Returns 0 at end of stream.
    pub fn read_floats(&mut self, out: &mut [f32]) -> usize {
        if out.is_empty() || !self.load_page() {
            return 0;
        }
        let range = self.take(out.len());
        let n = range.len();
        for (dst, &sample) in out.iter_mut().zip(&self.page[range]) {
            *dst = sample_to_float(sample);
        }
        n
    }

    /// Read raw native-endian PCM bytes. Returns 0 at end of stream.
    ///
    /// Only whole samples are produced, so the count is always even and a
    /// buffer shorter than one sample reads nothing.
    pub fn read_bytes(&mut self, out: &mut [u8]) -> usize {
        let max_samples = out.len() / BYTES_PER_SAMPLE as usize;
        if max_samples == 0 || !self.load_page() {
            return 0;
        }
        let range = self.take(max_samples);
        let bytes: &[u8] = bytemuck::cast_slice(&self.page[range]);
        out[..bytes.len()].copy_from_slice(bytes);
        bytes.len()
    }

    /// Move to sample `pos` and fill the start of `out` from there.
    ///
    /// Returns the number of samples placed in `out`. A return of 0 means
    /// the position could not be reached, and the stream is back at offset 0.
    pub fn seek_samples(&mut self, pos: u64, out: &mut [i16]) -> AudioResult<usize> {
        check_seek(pos, out.len())?;
        if !self.advance_to(pos) {
            return Ok(0);
        }
        let n = self.read_samples(out);
        if n == 0 {
            self.reset();
        }
        Ok(n)
    }

    /// Move to sample `pos` and fill the start of `out` with floats.
    pub fn seek_floats(&mut self, pos: u64, out: &mut [f32]) -> AudioResult<usize> {
        check_seek(pos, out.len())?;
        if !self.advance_to(pos) {
            return Ok(0);
        }
        let n = self.read_floats(out);
        if n == 0 {
            self.reset();
        }
        Ok(n)
    }

    /// Move to byte `pos` and fill the start of `out` with PCM bytes.
    ///
    /// Byte positions are rounded down to a sample boundary.
    pub fn seek_bytes(&mut self, pos: u64, out: &mut [u8]) -> AudioResult<usize> {
        check_seek(pos, out.len())?;
        if !self.advance_to(pos / BYTES_PER_SAMPLE) {
            return Ok(0);
        }
        let n = self.read_bytes(out);
        if n == 0 {
            self.reset();
        }
        Ok(n)
    }

    /// Return to offset 0 and release the decoder.
    ///
    /// Idle cost is minimal; the next read pays for re-opening the asset.
    pub fn reset(&mut self) {
        self.session = None;
        self.page.clear();
        self.page_pos = 0;
        self.sample_offset = 0;
    }

    /// Return to offset 0 keeping the decoder resident.
    ///
    /// Costs more memory while idle than [`Self::reset`] but resumes faster.
    /// Subsequent reads are identical either way.
    pub fn rewind(&mut self) {
        let rewound = self.session.as_mut().is_some_and(DecodeSession::rewind);
        if rewound {
            self.page.clear();
            self.page_pos = 0;
            self.sample_offset = 0;
        } else {
            self.reset();
        }
    }

    /// Whether the decoder is currently resident.
    #[must_use]
    pub fn is_resident(&self) -> bool {
        self.session.is_some()
    }

    /// Make sure the current page has unread samples, decoding one if needed.
    fn load_page(&mut self) -> bool {
        if self.page_pos < self.page.len() {
            return true;
        }
        self.page.clear();
        self.page_pos = 0;

        if self.session.is_none() {
            match self.source.open_session() {
                Ok((session, _)) => self.session = Some(session),
                Err(e) => {
                    warn!("Failed to reopen '{}': {}", self.source.name(), e);
                    return false;
                },
            }
        }

        match self.session.as_mut() {
            Some(session) => session.next_page(&mut self.page) > 0,
            None => false,
        }
    }

    /// Consume up to `max` samples of the current page.
    fn take(&mut self, max: usize) -> Range<usize> {
        let start = self.page_pos;
        let n = (self.page.len() - start).min(max);
        self.page_pos += n;
        self.sample_offset += n as u64;
        start..start + n
    }

    /// Decode forward until `target` is the next sample to be read.
    fn advance_to(&mut self, target: u64) -> bool {
        if target < self.sample_offset {
            self.reset();
        }
        while self.sample_offset < target {
            if !self.load_page() {
                self.reset();
                return false;
            }
            let remaining = usize::try_from(target - self.sample_offset).unwrap_or(usize::MAX);
            self.take(remaining);
        }
        true
    }
}

fn check_seek(pos: u64, buffer_len: usize) -> AudioResult<()> {
    if pos == 0 {
        return Err(AudioError::invalid(
            "seek position must be positive (use reset to return to the start)",
        ));
    }
    if buffer_len <= 1 {
        return Err(AudioError::invalid(format!(
            "seek buffer must hold more than one unit, got {buffer_len}"
        )));
    }
    Ok(())
}
