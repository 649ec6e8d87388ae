//! # Cantus Player
//!
//! Command-line front end for the Cantus audio engine.
//!
//! Queues the given files on one music buffer and plays them back to back,
//! logging each transition and the running position.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(clippy::unwrap_used)]

mod app;
mod config;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Main entry point.
fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("cantus=info".parse()?))
        .init();

    info!("Cantus player {}", env!("CARGO_PKG_VERSION"));

    let args = app::Args::parse();
    let summary = app::run(&args)?;

    info!(
        "Played {} file(s), {} transition(s), {:.1}s of audio",
        summary.files, summary.transitions, summary.played_seconds
    );
    Ok(())
}
