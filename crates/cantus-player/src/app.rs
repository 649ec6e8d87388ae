//! Player loop.

use std::cell::{Cell, RefCell};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use cantus_audio::{
    AudioEngine, AudioSource, HeadlessDevice, MusicEvent, Playable, PlaybackState, Seekable,
};
use clap::Parser;
use tracing::{info, warn};

use crate::config::{PlayerConfig, CONFIG_FILE};

/// Command-line arguments.
#[derive(Debug, Parser)]
#[command(name = "cantus-player", version, about = "Play audio files back to back")]
pub struct Args {
    /// Configuration file.
    #[arg(long, value_name = "PATH", default_value = CONFIG_FILE)]
    pub config: PathBuf,

    /// Wrap around to the first file after the last one.
    #[arg(long = "loop")]
    pub looping: bool,

    /// Run on a simulated clock with no output device.
    #[arg(long)]
    pub headless: bool,

    /// Files to play, in order.
    #[arg(value_name = "FILE", required = true)]
    pub files: Vec<PathBuf>,
}

/// What a run did.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Summary {
    /// Files that loaded and were queued.
    pub files: usize,
    /// Transitions heard between queue entries.
    pub transitions: usize,
    /// Wall or simulated time spent in the update loop.
    pub played_seconds: f64,
}

/// Play every file in `args` until the queue completes.
pub fn run(args: &Args) -> Result<Summary> {
    let mut config = PlayerConfig::load_from(&args.config);
    config.headless |= args.headless;
    config.validate();

    let headless = config
        .headless
        .then(|| HeadlessDevice::new(config.audio.max_voices));
    let engine = match &headless {
        Some(device) => AudioEngine::with_device(config.audio.clone(), device.clone()),
        None => AudioEngine::new(config.audio.clone()).context("opening audio output")?,
    };

    let sources = load_sources(&engine, &args.files);
    if sources.is_empty() {
        bail!("none of the {} file(s) could be loaded", args.files.len());
    }

    let music = engine.new_music(&sources);
    music.set_looping(args.looping);

    let finished = Rc::new(Cell::new(false));
    let transitions = Rc::new(RefCell::new(0usize));
    {
        let finished = Rc::clone(&finished);
        let transitions = Rc::clone(&transitions);
        music.set_listener(move |_, event| match event {
            MusicEvent::Transition { from, to } => {
                *transitions.borrow_mut() += 1;
                info!("'{}' -> '{}'", from.name(), to.name());
            },
            MusicEvent::Loopback { source } => info!("Repeating '{}'", source.name()),
            MusicEvent::Completion => {
                info!("Queue finished");
                finished.set(true);
            },
        });
    }

    music.play().context("starting playback")?;
    info!(
        "Playing {} file(s), {:.1}s total",
        sources.len(),
        music.duration()
    );

    let interval = Duration::from_millis(config.update_interval_ms);
    let ticks_per_report = (1_000 / config.update_interval_ms).max(1);
    let mut ticks = 0u64;
    let mut played = Duration::ZERO;
    while !finished.get() {
        match &headless {
            Some(device) => device.advance(interval),
            None => std::thread::sleep(interval),
        }
        played += interval;
        engine.update();

        ticks += 1;
        if ticks % ticks_per_report == 0 && music.state() == PlaybackState::Playing {
            info!(
                "[{}/{}] {:.1}s / {:.1}s",
                music.current_index() + 1,
                music.source_count(),
                music.position(),
                music.duration()
            );
        }
    }

    let transitions = *transitions.borrow();
    Ok(Summary {
        files: sources.len(),
        transitions,
        played_seconds: played.as_secs_f64(),
    })
}

/// Open and parse each file, skipping the ones that fail.
fn load_sources(engine: &AudioEngine, paths: &[PathBuf]) -> Vec<AudioSource> {
    paths
        .iter()
        .filter_map(|path| match open_source(engine, path) {
            Ok(source) => Some(source),
            Err(e) => {
                warn!("Skipping {}: {e:#}", path.display());
                None
            },
        })
        .collect()
}

fn open_source(engine: &AudioEngine, path: &Path) -> Result<AudioSource> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let name = path
        .file_name()
        .map_or_else(|| path.display().to_string(), |n| n.to_string_lossy().into_owned());
    Ok(engine.new_source(name, BufReader::new(file))?)
}
