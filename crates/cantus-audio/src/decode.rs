//! Symphonia decode session.
//!
//! One [`DecodeSession`] owns a demuxer and a codec instance positioned
//! somewhere inside an encoded asset. Each call to
//! [`DecodeSession::next_page`] decodes exactly one packet, so the amount of
//! work per call is bounded by the codec's natural page size rather than by
//! what the caller asked for.
//!
//! Every page is converted to interleaved signed 16-bit samples, whatever
//! the codec produced natively.

use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;

use symphonia::core::audio::{SampleBuffer, SignalSpec};
use symphonia::core::codecs::{
    CodecType, Decoder, DecoderOptions, CODEC_TYPE_NULL, CODEC_TYPE_PCM_ALAW,
    CODEC_TYPE_PCM_F32BE, CODEC_TYPE_PCM_F32LE, CODEC_TYPE_PCM_F64BE, CODEC_TYPE_PCM_F64LE,
    CODEC_TYPE_PCM_MULAW, CODEC_TYPE_PCM_S16BE, CODEC_TYPE_PCM_S16LE, CODEC_TYPE_PCM_S24BE,
    CODEC_TYPE_PCM_S24LE, CODEC_TYPE_PCM_S32BE, CODEC_TYPE_PCM_S32LE, CODEC_TYPE_PCM_S8,
    CODEC_TYPE_PCM_U16BE, CODEC_TYPE_PCM_U16LE, CODEC_TYPE_PCM_U24BE, CODEC_TYPE_PCM_U24LE,
    CODEC_TYPE_PCM_U32BE, CODEC_TYPE_PCM_U32LE, CODEC_TYPE_PCM_U8,
};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader, SeekMode, SeekTo};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use tracing::{debug, warn};

use crate::error::{AudioError, AudioResult};

/// Codecs whose container-declared frame count is exact.
const PCM_CODECS: [CodecType; 20] = [
    CODEC_TYPE_PCM_S8,
    CODEC_TYPE_PCM_U8,
    CODEC_TYPE_PCM_S16LE,
    CODEC_TYPE_PCM_S16BE,
    CODEC_TYPE_PCM_U16LE,
    CODEC_TYPE_PCM_U16BE,
    CODEC_TYPE_PCM_S24LE,
    CODEC_TYPE_PCM_S24BE,
    CODEC_TYPE_PCM_U24LE,
    CODEC_TYPE_PCM_U24BE,
    CODEC_TYPE_PCM_S32LE,
    CODEC_TYPE_PCM_S32BE,
    CODEC_TYPE_PCM_U32LE,
    CODEC_TYPE_PCM_U32BE,
    CODEC_TYPE_PCM_F32LE,
    CODEC_TYPE_PCM_F32BE,
    CODEC_TYPE_PCM_F64LE,
    CODEC_TYPE_PCM_F64BE,
    CODEC_TYPE_PCM_ALAW,
    CODEC_TYPE_PCM_MULAW,
];

/// Track parameters discovered while probing.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TrackInfo {
    pub channels: u16,
    pub sample_rate: u32,
    /// Frame count declared by the container, if any.
    pub declared_frames: Option<u64>,
    /// Whether the declared frame count can be trusted as-is.
    pub exact_length: bool,
}

/// A demuxer + codec pair positioned inside one encoded asset.
pub(crate) struct DecodeSession {
    format: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    scratch: Option<SampleBuffer<i16>>,
    scratch_frames: u64,
    scratch_spec: Option<SignalSpec>,
}

impl std::fmt::Debug for DecodeSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecodeSession")
            .field("track_id", &self.track_id)
            .field("scratch_frames", &self.scratch_frames)
            .finish_non_exhaustive()
    }
}

impl DecodeSession {
    /// Probe the container and build a decoder for its first audio track.
    ///
    /// `name` is only used as a format hint (its extension) and in errors.
    pub(crate) fn open(name: &str, bytes: &Arc<[u8]>) -> AudioResult<(Self, TrackInfo)> {
        let cursor = Cursor::new(Arc::clone(bytes));
        let mss = MediaSourceStream::new(Box::new(cursor), Default::default());

        let mut hint = Hint::new();
        if let Some(ext) = Path::new(name).extension().and_then(|e| e.to_str()) {
            hint.with_extension(ext);
        }

        // Trim encoder delay and padding declared by LAME/Xing tags or Ogg bounds
        let format_opts = FormatOptions {
            enable_gapless: true,
            ..Default::default()
        };
        let probed = symphonia::default::get_probe()
            .format(&hint, mss, &format_opts, &MetadataOptions::default())
            .map_err(|e| AudioError::asset(name, format!("unrecognised container: {e}")))?;
        let format = probed.format;

        let track = format
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or_else(|| AudioError::asset(name, "no audio track found"))?;
        let track_id = track.id;
        let params = track.codec_params.clone();

        let sample_rate = params
            .sample_rate
            .filter(|&rate| rate > 0)
            .ok_or_else(|| AudioError::asset(name, "sample rate not declared"))?;
        let channels = params
            .channels
            .map(|c| c.count())
            .ok_or_else(|| AudioError::asset(name, "channel layout not declared"))?;
        if !(1..=2).contains(&channels) {
            return Err(AudioError::asset(
                name,
                format!("{channels} channels (only mono and stereo are supported)"),
            ));
        }

        let decoder = symphonia::default::get_codecs()
            .make(&params, &DecoderOptions::default())
            .map_err(|e| AudioError::asset(name, format!("unsupported codec: {e}")))?;

        let info = TrackInfo {
            channels: channels as u16,
            sample_rate,
            declared_frames: params.n_frames,
            exact_length: PCM_CODECS.contains(&params.codec),
        };

        Ok((
            Self {
                format,
                decoder,
                track_id,
                scratch: None,
                scratch_frames: 0,
                scratch_spec: None,
            },
            info,
        ))
    }

    /// Decode the next page and append its samples to `out`.
    ///
    /// Returns the number of samples appended. Zero means the end of the
    /// stream was reached or the container could not be read any further.
    pub(crate) fn next_page(&mut self, out: &mut Vec<i16>) -> usize {
        loop {
            let packet = match self.format.next_packet() {
                Ok(packet) => packet,
                Err(SymphoniaError::IoError(ref e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    return 0;
                },
                Err(SymphoniaError::ResetRequired) => {
                    debug!("Decoder reset required, treating as end of stream");
                    return 0;
                },
                Err(e) => {
                    warn!("Error reading packet: {}", e);
                    return 0;
                },
            };

            if packet.track_id() != self.track_id {
                continue;
            }

            let decoded = match self.decoder.decode(&packet) {
                Ok(decoded) => decoded,
                Err(SymphoniaError::DecodeError(e)) => {
                    // Corrupt packet: skip it and keep going
                    warn!("Decode error: {}", e);
                    continue;
                },
                Err(e) => {
                    warn!("Decoder failed: {}", e);
                    return 0;
                },
            };

            if decoded.frames() == 0 {
                continue;
            }

            let spec = *decoded.spec();
            let capacity = decoded.capacity() as u64;
            if self.scratch.is_none()
                || self.scratch_frames < capacity
                || self.scratch_spec != Some(spec)
            {
                self.scratch = Some(SampleBuffer::<i16>::new(capacity, spec));
                self.scratch_frames = capacity;
                self.scratch_spec = Some(spec);
            }

            let Some(scratch) = self.scratch.as_mut() else {
                return 0;
            };
            scratch.copy_interleaved_ref(decoded);
            let samples = scratch.samples();
            out.extend_from_slice(samples);
            return samples.len();
        }
    }

    /// Return to the first frame while keeping the codec resident.
    ///
    /// Returns `false` if the container refused to seek, in which case the
    /// session is in an unknown position and should be discarded.
    pub(crate) fn rewind(&mut self) -> bool {
        let seek = self.format.seek(
            SeekMode::Accurate,
            SeekTo::TimeStamp {
                ts: 0,
                track_id: self.track_id,
            },
        );
        match seek {
            Ok(_) => {
                self.decoder.reset();
                true
            },
            Err(e) => {
                debug!("Rewind by seek failed: {}", e);
                false
            },
        }
    }

    /// Decode to the end, counting frames. Used for codecs whose container
    /// does not declare an exact length.
    ///
    /// The count is taken after gapless trimming, so it matches what
    /// [`Self::next_page`] yields.
    pub(crate) fn count_frames(&mut self, channels: u16) -> u64 {
        let mut page = Vec::new();
        let mut samples = 0u64;
        loop {
            page.clear();
            let n = self.next_page(&mut page);
            if n == 0 {
                break;
            }
            samples += n as u64;
        }
        samples / u64::from(channels.max(1))
    }
}
