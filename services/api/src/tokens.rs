//! Realtime credential minting.
//!
//! The OpenAI implementation creates a realtime session that is already
//! configured for the quote agent (instructions, voice, tools and turn
//! detection) and returns its short-lived client secret. Server VAD is on but
//! never creates responses by itself; the client decides when the model speaks.

use crate::models::{ClientSecret, EphemeralToken};
use anyhow::{Context, Result};
use async_openai::types::realtime::{
    AudioFormat, AudioTranscription, RealtimeVoice, SessionResource, ToolDefinition,
    TurnDetection,
};
use async_trait::async_trait;
use quote_core::{QuotePayload, tools::tool_specs};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::{info, instrument};

pub const OPENAI_API_BASE: &str = "https://api.openai.com/v1";

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EphemeralTokenService: Send + Sync {
    async fn mint(&self) -> Result<EphemeralToken>;
}

/// Builds the session configuration registered with every minted credential.
pub fn session_config(model: &str, voice: &str, instructions: &str) -> Result<SessionResource> {
    let voice: RealtimeVoice = serde_json::from_value(serde_json::Value::String(voice.to_string()))
        .with_context(|| format!("Unknown realtime voice '{voice}'"))?;
    let tools = tool_specs::<QuotePayload>()
        .into_iter()
        .map(|spec| ToolDefinition::Function {
            name: spec.name,
            description: spec.description,
            parameters: spec.parameters,
        })
        .collect();

    Ok(SessionResource {
        model: Some(model.to_string()),
        modalities: Some(vec!["audio".to_string(), "text".to_string()]),
        instructions: Some(instructions.to_string()),
        voice: Some(voice),
        input_audio_format: Some(AudioFormat::PCM16),
        output_audio_format: Some(AudioFormat::PCM16),
        input_audio_transcription: Some(AudioTranscription {
            model: Some("whisper-1".to_string()),
            ..Default::default()
        }),
        turn_detection: Some(TurnDetection::ServerVAD {
            threshold: 0.5,
            prefix_padding_ms: 300,
            silence_duration_ms: 500,
            interrupt_response: Some(true),
            create_response: Some(false),
        }),
        tools: Some(tools),
        ..Default::default()
    })
}

#[derive(Deserialize)]
struct SessionCreated {
    client_secret: ClientSecret,
}

pub struct OpenAITokenService {
    http: reqwest::Client,
    api_base: String,
    api_key: SecretString,
    session: SessionResource,
}

impl OpenAITokenService {
    pub fn new(api_key: SecretString, session: SessionResource) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_base: OPENAI_API_BASE.to_string(),
            api_key,
            session,
        }
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }
}

#[async_trait]
impl EphemeralTokenService for OpenAITokenService {
    #[instrument(skip_all)]
    async fn mint(&self) -> Result<EphemeralToken> {
        let url = format!("{}/realtime/sessions", self.api_base.trim_end_matches('/'));
        let created: SessionCreated = self
            .http
            .post(&url)
            .bearer_auth(self.api_key.expose_secret())
            .json(&self.session)
            .send()
            .await
            .context("Failed to reach the realtime sessions endpoint")?
            .error_for_status()
            .context("Realtime session creation was rejected")?
            .json()
            .await
            .context("Failed to decode realtime session response")?;
        info!(expires_at = created.client_secret.expires_at, "Minted realtime credential.");
        Ok(EphemeralToken {
            client_secret: created.client_secret,
        })
    }
}

/// Returns the same token every time.
pub struct StaticTokenService {
    value: String,
}

impl StaticTokenService {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
        }
    }
}

#[async_trait]
impl EphemeralTokenService for StaticTokenService {
    async fn mint(&self) -> Result<EphemeralToken> {
        let expires_at = chrono::Utc::now().timestamp() + 60;
        Ok(EphemeralToken {
            client_secret: ClientSecret {
                value: self.value.clone(),
                expires_at,
            },
        })
    }
}
