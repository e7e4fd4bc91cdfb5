#![warn(clippy::all)]

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

use voxdesk::config::Config;
use voxdesk::voice::session::SessionOptions;
use voxdesk::voice::transcript::TurnTranscript;
use voxdesk::voice::{
    FileInputDevice, FileOutputDevice, GeminiLiveConnector, Pcm16Codec, SessionController,
};

/// `voxdesk` - talk to a live voice agent.
#[derive(Parser, Debug)]
#[command(name = "voxdesk")]
#[command(version)]
#[command(about = "Real-time duplex voice sessions with a conversational agent.", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run one voice session from a PCM16 recording
    Talk {
        /// Raw PCM16LE mono file used as the microphone
        #[arg(long)]
        input: PathBuf,

        /// Where the agent's speech is written (raw PCM16LE mono)
        #[arg(long)]
        output: PathBuf,

        /// Config file (defaults to ~/.voxdesk/config.toml)
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Print the resolved configuration
    Config {
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("voxdesk=info")),
        )
        .try_init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Talk {
            input,
            output,
            config,
        } => {
            let config = Config::load(config.as_deref())?;
            talk(config, input, output).await
        }
        Commands::Config { config } => {
            let config = Config::load(config.as_deref())?;
            let rendered =
                toml::to_string_pretty(&config).context("Failed to render configuration")?;
            println!("# {}", config.config_path.display());
            println!("{rendered}");
            let key_state = if config.transport.resolve_api_key().is_some() {
                "set"
            } else {
                "not set"
            };
            println!("# transport.api_key: {key_state}");
            Ok(())
        }
    }
}

/// How long the turn printer may take to drain after the session ends.
const PRINTER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Print finalized turns until every sender is gone.
async fn print_turns<W: Write>(mut turns: broadcast::Receiver<TurnTranscript>, mut out: W) -> W {
    loop {
        match turns.recv().await {
            Ok(turn) => {
                if !turn.caller.is_empty() {
                    let _ = writeln!(out, "caller: {}", turn.caller);
                }
                if !turn.agent.is_empty() {
                    let _ = writeln!(out, "agent:  {}", turn.agent);
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Turn printer fell behind, skipping turns");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    out
}

async fn talk(config: Config, input: PathBuf, output: PathBuf) -> Result<()> {
    let api_key = config.transport.resolve_api_key().context(
        "No API key: set transport.api_key in the config file, or GEMINI_API_KEY / GOOGLE_API_KEY",
    )?;

    let voice = &config.voice;
    let codec = Arc::new(Pcm16Codec::new(
        voice.input_sample_rate,
        voice.output_sample_rate,
    ));
    let connector = GeminiLiveConnector::new(
        config.transport.clone(),
        api_key,
        codec.clone(),
        voice.outbound_queue_capacity,
        voice.inbound_queue_capacity,
    );
    let output_device = FileOutputDevice::new(&output, voice.output_sample_rate);
    let controller = SessionController::new(
        Arc::new(FileInputDevice::new(
            input,
            voice.frame_len,
            voice.input_sample_rate,
        )),
        Arc::new(output_device.clone()),
        Arc::new(connector),
        codec,
        SessionOptions::from(voice),
    );

    let printer = tokio::spawn(print_turns(controller.subscribe_turns(), std::io::stdout()));

    let mut status = controller.subscribe_status();
    let session_id = controller.start().await?;
    println!("Voice session {session_id} open. Press Ctrl-C to stop.");

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        if !status.borrow_and_update().voice_mode_active {
            break;
        }
        tokio::select! {
            _ = &mut ctrl_c => {
                tracing::info!(session_id = %session_id, "Ctrl-C received, stopping");
                controller.stop();
                break;
            }
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
    let stats = controller.stats();

    // Dropping the controller closes the turn channel once the session's
    // tasks have wound down; the printer drains what is left and exits.
    drop(controller);
    if tokio::time::timeout(PRINTER_DRAIN_TIMEOUT, printer).await.is_err() {
        tracing::debug!(session_id = %session_id, "Turn printer did not drain in time");
    }
    output_device.flush().await?;

    tracing::info!(
        session_id = %session_id,
        packets_sent = stats.packets_sent,
        frames_dropped = stats.frames_dropped,
        chunks_scheduled = stats.chunks_scheduled,
        turns = stats.turns,
        "Voice session ended"
    );
    println!("Agent audio written to {}", output.display());
    Ok(())
}
