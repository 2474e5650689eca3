//! Daemon and CLI entry point

use anyhow::Result;
use clap::{Parser, Subcommand};
use global_hotkey::GlobalHotKeyEvent;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use stt_hotkey::audio::AudioCapture;
use stt_hotkey::config::Config;
use stt_hotkey::delivery::CompositeDelivery;
use stt_hotkey::input::HotkeyListener;
use stt_hotkey::service::{
    DockerRuntime, HttpReadinessProbe, ServiceControl, ServiceLifecycle,
};
use stt_hotkey::session::{HotkeyEvent, SessionController, SessionPolicy};
use stt_hotkey::transcription::{Language, TranscriptionClient};
use stt_hotkey::{oneshot, telemetry};

#[derive(Parser)]
#[command(name = "stt-hotkey", about = "Hotkey-driven speech-to-text daemon")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Record for a fixed duration and print the transcription
    Transcribe {
        /// Recording duration in seconds
        #[arg(long, default_value_t = 5.0)]
        duration: f64,

        /// Target language for the translation
        #[arg(long, value_enum, default_value_t = Language::En)]
        language: Language,
    },

    /// Manage the backing transcription service container
    Service {
        #[command(subcommand)]
        action: ServiceAction,
    },
}

#[derive(Subcommand)]
enum ServiceAction {
    /// Start the container and wait until the API is ready
    Start,
    /// Stop the container
    Stop,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::load()?;
    telemetry::init(config.telemetry.file_logging, &config.telemetry.log_path)?;

    match cli.command {
        Some(Command::Transcribe { duration, language }) => {
            anyhow::ensure!(
                duration.is_finite() && duration > 0.0,
                "duration must be a positive number of seconds"
            );
            let result = oneshot::record_and_transcribe(
                &config,
                Duration::from_secs_f64(duration),
                language,
            )
            .await?;
            println!(
                "Original ({}): {}",
                result.detected_language, result.source_text
            );
            println!("Translation ({language}): {}", result.translated_text);
            Ok(())
        }
        Some(Command::Service { action }) => run_service_action(&config, action).await,
        None => run_daemon(config).await,
    }
}

async fn run_service_action(config: &Config, action: ServiceAction) -> Result<()> {
    let lifecycle = ServiceLifecycle::new(
        DockerRuntime::new(&config.service),
        HttpReadinessProbe::new()?,
        config.service.base_url(),
        config.service.poll_interval(),
    );

    match action {
        ServiceAction::Start => {
            let handle = lifecycle
                .ensure_ready(config.service.readiness_timeout())
                .await?;
            println!("service ready at {}", handle.base_url);
        }
        ServiceAction::Stop => {
            lifecycle.stop().await?;
            println!("service stopped");
        }
    }
    Ok(())
}

async fn run_daemon(config: Config) -> Result<()> {
    let lifecycle = Arc::new(ServiceLifecycle::new(
        DockerRuntime::new(&config.service),
        HttpReadinessProbe::new()?,
        config.service.base_url(),
        config.service.poll_interval(),
    ));

    let capture = AudioCapture::new(config.audio.clone());
    let client = Arc::new(TranscriptionClient::new(&config.transcription)?);
    let delivery = Arc::new(CompositeDelivery::from_config(&config.delivery));
    let policy = SessionPolicy::from_config(&config);

    let service: Arc<dyn ServiceControl> = lifecycle.clone();
    let mut controller = SessionController::new(capture, service, client, delivery, policy);

    let listener = HotkeyListener::new(&config.hotkey)?;
    println!(
        "✓ Hotkey registered: {:?} + {}",
        config.hotkey.modifiers, config.hotkey.key
    );

    let (events_tx, mut events_rx) = mpsc::channel(config.session.queue_depth.max(1));

    tracing::info!("daemon starting");
    println!("\nstt-hotkey is running. Hold the hotkey to dictate, release to transcribe.");
    println!("Press Ctrl+C to exit.\n");

    tokio::select! {
        () = controller.run(&mut events_rx) => {}
        () = forward_hotkey_events(&listener, events_tx) => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
            println!("\nShutting down...");
        }
    }

    controller.shutdown().await;

    // Tear the service down if this run brought it up; a refusal is logged,
    // never blocks exit
    if lifecycle.handle().await.running {
        if let Err(e) = lifecycle.stop().await {
            tracing::warn!("{}", e);
        }
    }

    Ok(())
}

/// Drain the platform hotkey channel and enqueue edges for the controller
async fn forward_hotkey_events(listener: &HotkeyListener, queue: mpsc::Sender<HotkeyEvent>) {
    let receiver = GlobalHotKeyEvent::receiver();
    loop {
        while let Ok(event) = receiver.try_recv() {
            listener.forward(&event, &queue);
        }
        // Drain interval; the queue side stays non-blocking either way
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
