//! Client for the quote backend: realtime credentials and record persistence.

use anyhow::{Context, Result};
use async_trait::async_trait;
use quote_core::QuotePayload;
use secrecy::SecretString;
use serde::Deserialize;
use tracing::{debug, info};

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Backend: Send + Sync {
    /// A short-lived realtime credential. Empty when the backend had none.
    async fn ephemeral_token(&self) -> Result<SecretString>;

    async fn submit_quote(&self, payload: &QuotePayload) -> Result<()>;
}

#[derive(Debug, Default, Deserialize)]
struct EphemeralResponse {
    #[serde(default)]
    client_secret: Option<ClientSecret>,
}

#[derive(Debug, Default, Deserialize)]
struct ClientSecret {
    #[serde(default)]
    value: Option<String>,
}

impl EphemeralResponse {
    fn into_token(self) -> String {
        self.client_secret
            .and_then(|secret| secret.value)
            .unwrap_or_default()
    }
}

pub struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
}

impl HttpBackend {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl Backend for HttpBackend {
    async fn ephemeral_token(&self) -> Result<SecretString> {
        let url = format!("{}/ephemeral", self.base_url);
        let response: EphemeralResponse = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("Failed to reach {url}"))?
            .error_for_status()
            .context("Backend refused to mint a realtime token")?
            .json()
            .await
            .context("Failed to decode ephemeral token response")?;
        debug!("Received ephemeral token response.");
        Ok(SecretString::from(response.into_token()))
    }

    async fn submit_quote(&self, payload: &QuotePayload) -> Result<()> {
        let url = format!("{}/quote", self.base_url);
        self.client
            .post(&url)
            .json(payload)
            .send()
            .await
            .with_context(|| format!("Failed to reach {url}"))?
            .error_for_status()
            .context("Backend rejected the quote")?;
        info!(complete = payload.is_complete(), "Quote submitted.");
        Ok(())
    }
}
