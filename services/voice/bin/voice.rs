//! Main Entrypoint for the Quote Voice Client
//!
//! `quote-voice run` captures the microphone, connects to the realtime API with
//! a credential minted by the backend and fills a quote by voice until Ctrl+C.
//! `quote-voice tools` prints the tool definitions the model is given.

use anyhow::Context;
use clap::{Parser, Subcommand};
use futures::StreamExt;
use openai_realtime::{RealtimeTransport, WebSocketConnector};
use quote_core::{EngineConfig, QuotePayload, tools::tool_specs};
use quote_voice::{
    SessionSettings, VoiceSession,
    backend::HttpBackend,
    config::Config,
    mic::CommandMicrophone,
};
use std::sync::Arc;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "quote-voice", version, about = "Fill an auto insurance quote by voice")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a voice session until Ctrl+C (default).
    Run,
    /// Print the realtime tool definitions as JSON.
    Tools,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command.unwrap_or(Command::Run) {
        Command::Tools => {
            let specs = tool_specs::<QuotePayload>();
            println!("{}", serde_json::to_string_pretty(&specs)?);
            Ok(())
        }
        Command::Run => run().await,
    }
}

async fn run() -> anyhow::Result<()> {
    // --- 1. Load Configuration ---
    let config = Config::from_env().context("Failed to load configuration")?;

    // --- 2. Initialize Logging ---
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .init();
    info!(backend = %config.backend_url, "Configuration loaded.");

    // --- 3. Wire Collaborators ---
    let mic = CommandMicrophone::new(&config.mic_command, config.mic_sample_rate)
        .context("Invalid microphone command")?;
    let transport = RealtimeTransport::new(Arc::new(WebSocketConnector::new(
        config.realtime_url.clone(),
    )));
    let settings = SessionSettings {
        mic_live_timeout: config.mic_live_timeout,
        engine: EngineConfig {
            min_speech: config.min_speech,
            ..EngineConfig::default()
        },
    };
    let session = VoiceSession::new(
        Arc::new(mic),
        Arc::new(HttpBackend::new(config.backend_url.clone())),
        transport,
        settings,
    );

    // --- 4. Report Status and Record Changes ---
    let mut statuses = session.status_stream();
    tokio::spawn(async move {
        while let Some(status) = statuses.next().await {
            println!("status: {status}");
        }
    });
    let mut records = session.store().subscribe();
    tokio::spawn(async move {
        while let Some(record) = records.next().await {
            if let Ok(json) = serde_json::to_string(&record) {
                println!("payload: {json}");
            }
        }
    });

    // --- 5. Start and Wait ---
    if let Err(e) = session.start().await {
        anyhow::bail!("Voice session failed to start ({}): {e}", e.reason());
    }
    info!("Listening. Press Ctrl+C to stop.");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to install Ctrl+C handler")?;

    session.stop();
    let record = session.store().get();
    info!(complete = record.is_complete(), "Voice session stopped.");
    Ok(())
}
