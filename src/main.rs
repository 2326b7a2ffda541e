//! Parley - A real-time voice conversation client for Linux
//!
//! This is the main entry point for the Parley application.

mod audio;
mod cli;
mod error;
mod session;
mod settings;
mod tokio_runtime;
mod transport;
mod ui;

#[cfg(test)]
mod testing;

use anyhow::{Context, Result};
use audio::{AudioFormat, PipeWireInput, PipeWireOutput};
use clap::Parser;
use log::info;
use session::{SessionInputs, VoiceSession};
use std::time::Duration;
use tokio::sync::mpsc;
use transport::{LiveConfig, LiveSession};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_millis(500);

fn main() -> Result<()> {
    // Parse command-line arguments and initialize logging
    let args = cli::Args::parse();
    cli::init_logging(&args);

    let model = settings::resolve(
        args.model.as_deref(),
        settings::get_model(),
        settings::DEFAULT_MODEL,
    );
    let voice = settings::resolve(
        args.voice.as_deref(),
        settings::get_voice(),
        settings::DEFAULT_VOICE,
    );

    if args.save_defaults {
        settings::set_model(&model);
        settings::set_voice(&voice);
        info!("Saved defaults: model {}, voice {}", model, voice);
    }

    info!("Starting Parley");

    let runtime = tokio_runtime::build()?;
    let result = runtime.block_on(run(LiveConfig {
        api_key: args.api_key,
        model,
        voice,
    }));

    // A pending stdin read would otherwise keep the runtime alive
    runtime.shutdown_timeout(SHUTDOWN_TIMEOUT);
    result
}

async fn run(config: LiveConfig) -> Result<()> {
    let (playback_tx, playback) = mpsc::unbounded_channel();
    let (transport_tx, transport) = mpsc::unbounded_channel();
    let (commands_tx, commands) = mpsc::unbounded_channel();

    let output = PipeWireOutput::open(AudioFormat::PLAYBACK, playback_tx)
        .context("Failed to open the playback device")?;

    let live = LiveSession::spawn(config, transport_tx);
    info!("Live session {}", live.session_id());
    let closer = live.clone();

    let (session, queues, snapshots) = VoiceSession::new(
        Box::new(PipeWireInput::new()),
        Box::new(output),
        Box::new(live),
    );

    tokio::spawn(ui::read_commands(commands_tx));
    tokio::spawn(ui::print_snapshots(snapshots));

    session
        .run(
            queues,
            SessionInputs {
                commands,
                transport,
                playback,
            },
        )
        .await;

    closer.close().await;
    Ok(())
}
