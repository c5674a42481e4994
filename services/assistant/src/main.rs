use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use secrecy::ExposeSecret;
use tracing_subscriber::fmt::time::ChronoLocal;
use tta_assistant::audio_backend::CpalBackend;
use tta_assistant::config::Config;
use tta_assistant::gemini_adapter::GeminiConnector;
use tta_assistant::prompt_loader;
use tta_core::imagegen::GeminiImageClient;
use tta_core::mode::AvatarMode;
use tta_core::session_state::{SessionView, VoiceSession};
use tta_core::smoother::{AmplitudeSmoother, lip_sync_rate};
use tta_core::store::InMemoryStore;
use tta_native_utils::device::{get_available_inputs, get_available_outputs};

/// One presentation frame.
const FRAME_INTERVAL: Duration = Duration::from_millis(16);

#[derive(Parser)]
#[command(version, about = "Voice sales assistant over Gemini Live")]
struct Cli {
    /// Name of the microphone to use instead of the default one
    #[arg(long)]
    input_device: Option<String>,

    /// Name of the speaker to use instead of the default one
    #[arg(long)]
    output_device: Option<String>,

    /// Print the available audio devices and exit
    #[arg(long)]
    list_devices: bool,

    /// Length of the intro clip in seconds; the session connects once it ends
    #[arg(long, value_parser = parse_intro)]
    intro: Option<Duration>,
}

fn parse_intro(value: &str) -> Result<Duration, String> {
    let seconds: f32 = value
        .parse()
        .map_err(|e| format!("invalid number of seconds: {e}"))?;
    Duration::try_from_secs_f32(seconds).map_err(|e| format!("invalid intro length {value}: {e}"))
}

/// Steps the smoother every frame and logs the avatar state it would render.
async fn run_presentation(view: SessionView) {
    let mut smoother = AmplitudeSmoother::new();
    let mut ticker = tokio::time::interval(FRAME_INTERVAL);
    let mut last_mode = view.mode();
    let mut frames: u64 = 0;

    loop {
        ticker.tick().await;
        let mode = view.mode();
        let smoothed = smoother.step(view.level());

        if mode != last_mode {
            tracing::info!("Avatar: {:?} -> {:?}", last_mode, mode);
            last_mode = mode;
        }
        frames += 1;
        // about twice per second
        if mode == AvatarMode::Talking && frames % 30 == 0 {
            tracing::debug!(
                "level {:.3}, lip sync rate {:.2}x",
                smoothed,
                lip_sync_rate(smoothed)
            );
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // --- 1. Parse Command-Line Arguments ---
    let args = Cli::parse();

    if args.list_devices {
        println!("{}", get_available_inputs()?);
        println!("{}", get_available_outputs()?);
        return Ok(());
    }

    // --- 2. Load Configuration ---
    let config = Config::from_env().context("Failed to load application configuration")?;

    // --- 3. Initialize Logging ---
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(ChronoLocal::rfc_3339())
        .init();

    tracing::info!("Configuration loaded successfully. Starting assistant...");

    // --- 4. Restore State ---
    let store = Arc::new(
        InMemoryStore::load(&config.state_file).context("Failed to load assistant state")?,
    );
    if let Some(voice) = config.voice {
        store.set_selected_voice(voice);
    }
    if let Some(enabled) = config.maintenance_mode {
        store.set_maintenance_mode(enabled);
    }
    if let Some(instruction) = prompt_loader::system_instruction(&config.prompts_dir)
        .context("Failed to load system prompt")?
    {
        tracing::info!("Using system prompt from {}.", config.prompts_dir.display());
        store.set_system_instruction(&instruction);
    }

    // --- 5. Initialize API Clients ---
    let live_config = gemini_live::Config::builder()
        .with_api_key(config.gemini_api_key.expose_secret())
        .with_model(&config.live_model)
        .build();
    let connector = Arc::new(GeminiConnector::new(live_config));
    let images = Arc::new(GeminiImageClient::new(
        config.gemini_api_key.clone(),
        config.image_model.clone(),
    ));
    let backend = Arc::new(CpalBackend::new(args.input_device, args.output_device));

    // --- 6. Run The Session ---
    let session = VoiceSession::new(store.clone(), connector, backend, images)
        .with_intro(args.intro.is_some());
    let (handle, view, task) = session.spawn();
    let presentation = tokio::spawn(run_presentation(view));

    handle.activate().await;
    if let Some(intro) = args.intro {
        tokio::time::sleep(intro).await;
        handle.intro_finished().await;
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    tracing::info!("Ctrl-C received, stopping session.");

    handle.stop().await;
    drop(handle);
    if let Err(e) = task.await {
        tracing::error!("Session task failed: {}", e);
    }
    presentation.abort();

    // --- 7. Persist State ---
    let usage = store.usage();
    tracing::info!(
        "{} leads, {} requests today, {} sessions total.",
        store.leads().len(),
        usage.requests_today,
        usage.total_sessions
    );
    store
        .save(&config.state_file)
        .context("Failed to save assistant state")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intro_length_is_validated() {
        assert_eq!(parse_intro("2.5"), Ok(Duration::from_millis(2500)));
        assert_eq!(parse_intro("0"), Ok(Duration::ZERO));
        assert!(parse_intro("inf").is_err());
        assert!(parse_intro("-1").is_err());
        assert!(parse_intro("NaN").is_err());
        assert!(parse_intro("soon").is_err());
    }

    #[test]
    fn test_cli_rejects_bad_intro() {
        assert!(Cli::try_parse_from(["tta-assistant", "--intro", "inf"]).is_err());
        let cli = Cli::try_parse_from(["tta-assistant", "--intro", "3"]).unwrap();
        assert_eq!(cli.intro, Some(Duration::from_secs(3)));
    }
}
