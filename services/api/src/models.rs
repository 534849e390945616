//! API and Database Models
//!
//! This module defines the data structures used for database mapping with
//! `sqlx` and for generating OpenAPI documentation with `utoipa`.

use chrono::{DateTime, Utc};
use quote_core::QuotePayload;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, types::Json};
use utoipa::ToSchema;
use uuid::Uuid;

/// A persisted quote as returned by the API.
#[derive(Serialize, Deserialize, ToSchema, Debug, Clone, PartialEq)]
pub struct StoredQuote {
    #[schema(value_type = String, format = Uuid)]
    pub id: Uuid,
    pub payload: QuotePayload,
    /// Every field of the payload is set.
    pub complete: bool,
    pub created_at: DateTime<Utc>,
}

/// Row shape of the `quotes` table.
#[derive(FromRow, Debug)]
pub struct QuoteRow {
    pub id: Uuid,
    pub payload: Json<QuotePayload>,
    pub complete: bool,
    pub created_at: DateTime<Utc>,
}

impl From<QuoteRow> for StoredQuote {
    fn from(row: QuoteRow) -> Self {
        Self {
            id: row.id,
            payload: row.payload.0,
            complete: row.complete,
            created_at: row.created_at,
        }
    }
}

/// Short-lived credential for a realtime session, in the shape the realtime
/// API returns it.
#[derive(Serialize, Deserialize, ToSchema, Debug, Clone, PartialEq)]
pub struct EphemeralToken {
    pub client_secret: ClientSecret,
}

#[derive(Serialize, Deserialize, ToSchema, Debug, Clone, PartialEq)]
pub struct ClientSecret {
    #[schema(example = "ek_68af3c1e2b")]
    pub value: String,
    /// Unix timestamp in seconds.
    pub expires_at: i64,
}

#[derive(Serialize, Deserialize, ToSchema, Debug)]
pub struct ErrorResponse {
    pub message: String,
}
