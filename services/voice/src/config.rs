use crate::mic::CommandMicrophone;
use openai_realtime::{DEFAULT_REALTIME_URL, REALTIME_PCM16_SAMPLE_RATE};
use quote_core::engine::DEFAULT_MIN_SPEECH;
use std::time::Duration;
use tracing::Level;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub backend_url: String,
    pub realtime_url: String,
    pub min_speech: Duration,
    /// `None` skips waiting for the microphone to go live.
    pub mic_live_timeout: Option<Duration>,
    pub mic_command: Vec<String>,
    pub mic_sample_rate: u32,
    pub log_level: Level,
}

fn parse_var<T: std::str::FromStr>(name: &str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| ConfigError::InvalidValue(name.to_string(), e.to_string())),
        Err(_) => Ok(default),
    }
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let backend_url =
            std::env::var("BACKEND_URL").unwrap_or_else(|_| "http://localhost:3000".to_string());
        let realtime_url =
            std::env::var("REALTIME_URL").unwrap_or_else(|_| DEFAULT_REALTIME_URL.to_string());

        let min_speech = Duration::from_millis(parse_var(
            "MIN_SPEECH_MS",
            DEFAULT_MIN_SPEECH.as_millis() as u64,
        )?);
        let mic_live_timeout = match parse_var("MIC_LIVE_TIMEOUT_MS", 2000u64)? {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        };

        let mic_sample_rate = parse_var("MIC_SAMPLE_RATE", REALTIME_PCM16_SAMPLE_RATE)?;
        if mic_sample_rate == 0 {
            return Err(ConfigError::InvalidValue(
                "MIC_SAMPLE_RATE".to_string(),
                "sample rate must be positive".to_string(),
            ));
        }

        let mic_command = match std::env::var("MIC_COMMAND") {
            Ok(raw) => {
                let parts: Vec<String> = raw.split_whitespace().map(String::from).collect();
                if parts.is_empty() {
                    return Err(ConfigError::InvalidValue(
                        "MIC_COMMAND".to_string(),
                        "command is empty".to_string(),
                    ));
                }
                parts
            }
            Err(_) => CommandMicrophone::arecord_command(mic_sample_rate),
        };

        let log_level_str = std::env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        Ok(Self {
            backend_url,
            realtime_url,
            min_speech,
            mic_live_timeout,
            mic_command,
            mic_sample_rate,
            log_level,
        })
    }
}
