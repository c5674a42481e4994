//! Application Configuration Module
//!
//! Loads the assistant's settings from environment variables (and a `.env`
//! file when present) into one struct handed to `main`.

use std::env;
use std::path::PathBuf;

use secrecy::SecretString;
use tracing::Level;
use tta_core::imagegen::DEFAULT_IMAGE_MODEL;
use tta_core::store::VoiceName;

// --- Application Constants ---

/// Frames per input device callback, and per resampler block.
pub const INPUT_CHUNK_SIZE: usize = 1024;
/// Frames per output device callback.
pub const OUTPUT_CHUNK_SIZE: usize = 1024;

const DEFAULT_STATE_FILE: &str = "tta_state.json";
const DEFAULT_PROMPTS_DIR: &str = "prompts";

/// Holds all configuration loaded from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub gemini_api_key: SecretString,
    pub live_model: String,
    pub image_model: String,
    /// Overrides the voice saved in the state file.
    pub voice: Option<VoiceName>,
    /// Overrides the maintenance flag saved in the state file.
    pub maintenance_mode: Option<bool>,
    pub state_file: PathBuf,
    pub prompts_dir: PathBuf,
    pub log_level: Level,
}

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid log level provided for RUST_LOG: {0}")]
    InvalidLogLevel(String),
    #[error("Invalid voice provided for VOICE_NAME: {0}")]
    InvalidVoice(String),
    #[error("Invalid boolean provided for MAINTENANCE_MODE: {0}")]
    InvalidFlag(String),
}

fn parse_flag(value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidFlag(value.to_string())),
    }
}

impl Config {
    /// Loads configuration from environment variables.
    ///
    // *   `GEMINI_API_KEY`: Required. Used for both the live session and image generation.
    // *   `LIVE_MODEL`: (Optional) Live audio model. Defaults to the client's default model.
    // *   `IMAGE_MODEL`: (Optional) Poster model. Defaults to "gemini-2.5-flash-image".
    // *   `VOICE_NAME`: (Optional) Fenrir, Charon, Puck, Kore or Zephyr.
    // *   `MAINTENANCE_MODE`: (Optional) true/false.
    // *   `STATE_FILE`: (Optional) JSON file for leads, todos, logs and usage. Defaults to "tta_state.json".
    // *   `PROMPTS_DIR`: (Optional) Directory holding `system.md`. Defaults to "prompts".
    // *   `RUST_LOG`: (Optional) The logging level. Defaults to "INFO".
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file. This is useful for local development and is ignored if not present.
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let gemini_api_key = var("GEMINI_API_KEY")
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| ConfigError::MissingVar("GEMINI_API_KEY".to_string()))?;

        let live_model = var("LIVE_MODEL")
            .unwrap_or_else(|| gemini_live::client::consts::DEFAULT_MODEL.to_string());
        let image_model = var("IMAGE_MODEL").unwrap_or_else(|| DEFAULT_IMAGE_MODEL.to_string());

        let voice = var("VOICE_NAME")
            .map(|v| v.parse::<VoiceName>().map_err(ConfigError::InvalidVoice))
            .transpose()?;
        let maintenance_mode = var("MAINTENANCE_MODE")
            .map(|v| parse_flag(&v))
            .transpose()?;

        let state_file = var("STATE_FILE").unwrap_or_else(|| DEFAULT_STATE_FILE.to_string());
        let prompts_dir = var("PROMPTS_DIR").unwrap_or_else(|| DEFAULT_PROMPTS_DIR.to_string());

        let log_level_str = var("RUST_LOG").unwrap_or_else(|| "INFO".to_string());
        let log_level = log_level_str
            .parse::<Level>()
            .map_err(|_| ConfigError::InvalidLogLevel(log_level_str))?;

        Ok(Self {
            gemini_api_key: SecretString::from(gemini_api_key),
            live_model,
            image_model,
            voice,
            maintenance_mode,
            state_file: PathBuf::from(state_file),
            prompts_dir: PathBuf::from(prompts_dir),
            log_level,
        })
    }
}
