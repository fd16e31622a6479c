//! # Aurelia Voice - Main Application Entry Point
//!
//! A terminal front end for a real-time voice session with a hosted
//! live-conversation model: microphone in, model speech out, with
//! interruption, mute and error recovery.
//!
//! ## Key Rust Concepts Used:
//! - **async/await**: Socket I/O and stdin run on a tokio runtime
//! - **current_thread runtime**: The session controller and its cpal streams
//!   (which are `!Send`) live on the main task
//! - **channels**: Audio threads and the socket task talk to the controller
//!   through one event queue
//! - **Result<T, E>**: `anyhow::Result` for startup, `VoiceResult` inside the subsystem
//!
//! ## Application Architecture:
//! - **config**: Application configuration (TOML file + environment variables)
//! - **error**: Voice error taxonomy and user-facing messages
//! - **audio**: Codec, capture, playback scheduling and the session controller
//! - **device**: cpal implementation of the audio seams
//! - **websocket**: Live endpoint protocol and WebSocket connector
//! - **transcription**: Optional local captioning
//! - **speech**: Read-aloud via the text-to-speech endpoint
//! - **state**: Status snapshot for display
//! - **commands**: Terminal command parsing

// Module declarations - These tell Rust about our other source files
mod audio;         // Audio pipeline (audio/ directory)
mod commands;      // Terminal commands (commands.rs)
mod config;        // Configuration management (config.rs)
mod device;        // cpal audio backend (device.rs)
mod error;         // Error handling types (error.rs)
mod speech;        // Read-aloud client (speech.rs)
mod state;         // Status snapshot (state.rs)
mod transcription; // Local captioning (transcription/ directory)
mod websocket;     // Live endpoint client (websocket.rs)

use anyhow::Result;
use audio::session::{SessionController, SessionState};
use audio::PlaybackBuffer;
use commands::Command;
use config::{AppConfig, Credentials};
use device::CpalBackend;
use error::VoiceResult;
use speech::SpeechClient;
use state::Presence;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use transcription::NoShadow;
use websocket::WebSocketConnector;

type Controller = SessionController<CpalBackend, WebSocketConnector>;

/// Synthesized speech for one read-aloud request, tagged with its token.
type SpeechResult = (u64, VoiceResult<PlaybackBuffer>);

/// Global shutdown signal, set by the signal handler task.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

/// The main application entry point.
///
/// ## What this function does:
/// 1. **Loads configuration** from `.env`, config.toml and environment variables
/// 2. **Sets up logging**
/// 3. **Builds the session controller** with the cpal backend and WebSocket connector
/// 4. **Starts a voice session** and drives the controller's event queue
/// 5. **Reads commands** from stdin until `q`, EOF or a shutdown signal
#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // .ok() means "ignore errors" - it's fine if there's no .env file
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    let credentials = Credentials::from_env();

    info!("Starting aurelia-voice v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "Configuration loaded: model {}, voice {}",
        config.live.model, config.live.voice
    );
    if !credentials.is_configured() {
        warn!("API_KEY is not set; voice sessions will not start");
    }

    let speech = Arc::new(SpeechClient::new(config.speech.clone(), credentials.clone()));
    let (mut controller, mut events) = SessionController::new(
        config,
        credentials,
        CpalBackend::new(),
        WebSocketConnector::new(),
        Box::new(NoShadow),
    );
    let (speech_tx, mut speech_rx) = mpsc::unbounded_channel::<SpeechResult>();

    setup_signal_handlers();

    println!("{}", commands::help_text());
    start_session(&mut controller);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut last_shown = display_key(&controller);

    loop {
        tokio::select! {
            Some(envelope) = events.recv() => {
                controller.handle(envelope);
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match line.parse::<Command>() {
                        Ok(Command::Quit) => break,
                        Ok(command) => run_command(command, &mut controller, &speech, &speech_tx),
                        Err(e) => println!("{}", e),
                    }
                }
                Ok(None) => {
                    info!("stdin closed");
                    break;
                }
                Err(e) => {
                    error!("Failed to read stdin: {}", e);
                    break;
                }
            },
            Some((request, result)) = speech_rx.recv() => match result {
                Ok(buffer) => {
                    if let Err(e) = controller.play_read_aloud(request, buffer) {
                        warn!(kind = e.kind(), detail = e.detail(), "Read-aloud playback failed");
                        println!("Read-aloud failed: {}", e);
                    }
                }
                Err(e) => {
                    // A cancelled request fails quietly
                    if controller.read_aloud_failed(request) {
                        warn!(kind = e.kind(), detail = e.detail(), "Read-aloud request failed");
                        println!("Read-aloud failed: {}", e);
                    }
                }
            },
            _ = wait_for_shutdown() => {
                info!("Shutdown signal received, stopping session...");
                break;
            }
        }

        // Only print when something the user can see has changed
        let shown = display_key(&controller);
        if shown != last_shown {
            println!("{}", controller.status().summary());
            last_shown = shown;
        }
    }

    controller.stop();
    controller.stop_read_aloud();
    info!("Stopped");
    Ok(())
}

/// Start a session and report a failure without exiting.
fn start_session(controller: &mut Controller) {
    if let Err(e) = controller.start() {
        println!("{}", e);
    }
}

fn run_command(
    command: Command,
    controller: &mut Controller,
    speech: &Arc<SpeechClient>,
    speech_tx: &mpsc::UnboundedSender<SpeechResult>,
) {
    match command {
        Command::ToggleMute => {
            if !controller.state().is_active() {
                println!("No active microphone");
                return;
            }
            let muted = controller.toggle_mute();
            println!("Microphone {}", if muted { "muted" } else { "live" });
        }
        Command::Stop => controller.stop(),
        Command::Restart => start_session(controller),
        Command::DismissError => controller.dismiss_error(),
        Command::SwitchVoice(voice) => {
            let update = serde_json::json!({ "live": { "voice": voice.to_string() } });
            match controller.update_config(&update.to_string()) {
                Ok(()) => println!("Voice set to {} (applies on next start)", voice),
                Err(e) => println!("Could not switch voice: {}", e),
            }
        }
        Command::Say(text) => {
            let voice = match controller.config().voice() {
                Ok(voice) => voice,
                Err(e) => {
                    println!("{}", e);
                    return;
                }
            };
            let request = match controller.request_read_aloud() {
                Ok(request) => request,
                Err(e) => {
                    println!("{}", e);
                    return;
                }
            };
            let speech = speech.clone();
            let tx = speech_tx.clone();
            tokio::spawn(async move {
                let result = speech.read_aloud(&text, voice).await;
                let _ = tx.send((request, result));
            });
        }
        Command::StopReading => controller.stop_read_aloud(),
        Command::Status => println!("{}", controller.status().summary()),
        Command::Help => println!("{}", commands::help_text()),
        Command::Quit => {}
    }
}

/// The parts of the status that warrant a new line on screen.
fn display_key(controller: &Controller) -> (SessionState, Presence, Option<String>, Option<String>) {
    let status = controller.status();
    (status.state, status.presence, status.error, status.caption)
}

/// Initialize the tracing (logging) system for the application.
///
/// ## Environment Variables:
/// - `RUST_LOG`: Controls what gets logged (e.g., "debug", "info", "aurelia_voice=trace")
/// - If not set, defaults to "aurelia_voice=debug"
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            // Try to read RUST_LOG environment variable, or use defaults
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "aurelia_voice=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    Ok(())
}

/// Set up signal handlers for shutdown (SIGTERM, SIGINT / Ctrl-C).
///
/// When either signal arrives the global shutdown flag is set and the main
/// loop stops the session before exiting.
fn setup_signal_handlers() {
    tokio::spawn(async {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};

            let (mut sigterm, mut sigint) = match (
                signal(SignalKind::terminate()),
                signal(SignalKind::interrupt()),
            ) {
                (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
                _ => {
                    error!("Failed to install signal handlers");
                    return;
                }
            };

            tokio::select! {
                _ = sigterm.recv() => {
                    info!("Received SIGTERM");
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT");
                }
            }
        }

        #[cfg(not(unix))]
        {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for Ctrl-C: {}", e);
                return;
            }
            info!("Received Ctrl-C");
        }

        SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
    });
}

/// Wait for the shutdown signal to be set.
///
/// Polls every 100ms; the main loop re-enters this on every iteration.
async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    }
}
