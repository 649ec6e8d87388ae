//! Shared fixtures for unit tests.

use std::io::Cursor;
use std::time::Duration;

use crate::config::AudioConfig;
use crate::device::HeadlessDevice;
use crate::engine::AudioEngine;
use crate::source::AudioSource;

/// Deterministic sample value for interleaved sample `i`.
pub(crate) fn pattern(i: usize) -> i16 {
    ((i as i64 * 7_919) % 65_536 - 32_768) as i16
}

/// 16-bit PCM WAV file filled with [`pattern`].
pub(crate) fn wav_bytes(channels: u16, sample_rate: u32, frames: u64) -> Vec<u8> {
    let spec = hound::WavSpec {
        channels,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut bytes = Vec::new();
    {
        let mut writer =
            hound::WavWriter::new(Cursor::new(&mut bytes), spec).expect("wav header");
        for i in 0..(frames * u64::from(channels)) as usize {
            writer.write_sample(pattern(i)).expect("wav sample");
        }
        writer.finalize().expect("wav finalize");
    }
    bytes
}

pub(crate) fn source(channels: u16, sample_rate: u32, frames: u64) -> AudioSource {
    AudioSource::from_bytes("fixture.wav", wav_bytes(channels, sample_rate, frames))
        .expect("fixture should load")
}

/// MPEG-2 layer III, mono, 22050 Hz, 45 frames, no Xing/Info tag.
pub(crate) const MP3_PLAIN: &[u8] = include_bytes!("../fixtures/mono_22k.mp3");

/// [`MP3_PLAIN`] behind a Lavf Info tag declaring 569 frames of encoder
/// delay and 300 frames of padding.
pub(crate) const MP3_TAGGED: &[u8] = include_bytes!("../fixtures/mono_22k_gapless.mp3");

/// Stereo 16 kHz Ogg Vorbis, 10240 frames of silence in 256-sample blocks.
pub(crate) const OGG_VORBIS: &[u8] = include_bytes!("../fixtures/silence_stereo.ogg");

/// Frames in [`MP3_PLAIN`] (45 frames of 576 samples).
pub(crate) const MP3_PLAIN_FRAMES: u64 = 25_920;

/// Frames in [`MP3_TAGGED`] once delay and padding are trimmed.
pub(crate) const MP3_TAGGED_FRAMES: u64 = MP3_PLAIN_FRAMES - 569 - 300;

/// Frames in [`OGG_VORBIS`].
pub(crate) const OGG_VORBIS_FRAMES: u64 = 10_240;

pub(crate) fn compressed(name: &str, bytes: &[u8]) -> AudioSource {
    AudioSource::from_bytes(name, bytes.to_vec()).expect("compressed fixture should load")
}

/// Engine on a headless device with small chunks, so tests cover many
/// chunk boundaries quickly.
pub(crate) fn headless_engine(voices: usize) -> (AudioEngine, HeadlessDevice) {
    let device = HeadlessDevice::new(voices);
    let config = AudioConfig::default()
        .with_chunk_frames(100)
        .with_queue_depth(2);
    let engine = AudioEngine::with_device(config, device.clone());
    (engine, device)
}

/// Drive the device clock and the engine together in 10 ms frames.
pub(crate) fn run_for(engine: &AudioEngine, device: &HeadlessDevice, total: Duration) {
    let step = Duration::from_millis(10);
    let mut elapsed = Duration::ZERO;
    while elapsed < total {
        device.advance(step);
        engine.update();
        elapsed += step;
    }
}
