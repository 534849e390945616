use secrecy::SecretString;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::Level;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Where realtime credentials come from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TokenProvider {
    OpenAI,
    /// Hands out a fixed token. For local development without an API key.
    Static,
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub bind_address: SocketAddr,
    pub database_url: String,
    pub token_provider: TokenProvider,
    pub openai_api_key: Option<SecretString>,
    pub realtime_model: String,
    pub realtime_voice: String,
    pub log_level: Level,
    pub prompts_path: PathBuf,
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let bind_address_str =
            std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:3000".to_string());
        let bind_address = bind_address_str
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::InvalidValue("BIND_ADDRESS".to_string(), e.to_string()))?;

        let database_url = std::env::var("DATABASE_URL")
            .map_err(|_| ConfigError::MissingVar("DATABASE_URL".to_string()))?;

        let provider_str = std::env::var("TOKEN_PROVIDER").unwrap_or_else(|_| "openai".to_string());
        let token_provider = match provider_str.to_lowercase().as_str() {
            "openai" => TokenProvider::OpenAI,
            "static" => TokenProvider::Static,
            other => {
                return Err(ConfigError::InvalidValue(
                    "TOKEN_PROVIDER".to_string(),
                    format!("'{other}' is not one of: openai, static"),
                ));
            }
        };

        let openai_api_key = std::env::var("OPENAI_API_KEY")
            .ok()
            .filter(|key| !key.trim().is_empty())
            .map(SecretString::from);
        if token_provider == TokenProvider::OpenAI && openai_api_key.is_none() {
            return Err(ConfigError::MissingVar(
                "OPENAI_API_KEY must be set for the 'openai' token provider".to_string(),
            ));
        }

        let realtime_model = std::env::var("REALTIME_MODEL")
            .unwrap_or_else(|_| "gpt-4o-realtime-preview".to_string());
        let realtime_voice =
            std::env::var("REALTIME_VOICE").unwrap_or_else(|_| "alloy".to_string());

        let log_level_str = std::env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        let prompts_path = std::env::var("PROMPTS_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./prompts"));

        Ok(Self {
            bind_address,
            database_url,
            token_provider,
            openai_api_key,
            realtime_model,
            realtime_voice,
            log_level,
            prompts_path,
        })
    }
}
