//! Axum Handlers for the REST API
//!
//! Credential minting and quote persistence. `utoipa` doc comments feed the
//! OpenAPI document.

use axum::{
    extract::{Path, State, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use quote_core::QuotePayload;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{
    models::{EphemeralToken, ErrorResponse, StoredQuote},
    state::AppState,
};

pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    /// An upstream service failed.
    BadGateway(anyhow::Error),
    InternalServerError(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(message) => {
                (StatusCode::BAD_REQUEST, Json(ErrorResponse { message })).into_response()
            }
            ApiError::NotFound(message) => {
                (StatusCode::NOT_FOUND, Json(ErrorResponse { message })).into_response()
            }
            ApiError::BadGateway(err) => {
                warn!("Upstream failure: {:?}", err);
                let message = "The realtime service is unavailable.".to_string();
                (StatusCode::BAD_GATEWAY, Json(ErrorResponse { message })).into_response()
            }
            ApiError::InternalServerError(err) => {
                error!("Internal Server Error: {:?}", err);
                let message = "An internal server error occurred.".to_string();
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(ErrorResponse { message }),
                )
                    .into_response()
            }
        }
    }
}

impl<E> From<E> for ApiError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self::InternalServerError(err.into())
    }
}

/// Mint a short-lived realtime credential.
#[utoipa::path(
    get,
    path = "/ephemeral",
    responses(
        (status = 200, description = "Credential minted", body = EphemeralToken),
        (status = 502, description = "Realtime service unavailable", body = ErrorResponse)
    )
)]
pub async fn mint_ephemeral(
    State(state): State<Arc<AppState>>,
) -> Result<Json<EphemeralToken>, ApiError> {
    let token = state
        .token_service
        .mint()
        .await
        .map_err(ApiError::BadGateway)?;
    Ok(Json(token))
}

/// Persist a finalized quote.
#[utoipa::path(
    post,
    path = "/quote",
    request_body = QuotePayload,
    responses(
        (status = 201, description = "Quote stored", body = StoredQuote),
        (status = 400, description = "Bad request", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    )
)]
pub async fn create_quote(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<QuotePayload>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(payload) = payload.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    let stored = state.db.insert_quote(&payload).await?;
    info!(id = %stored.id, complete = stored.complete, "Quote stored.");
    Ok((StatusCode::CREATED, Json(stored)))
}

/// List stored quotes, most recent first.
#[utoipa::path(
    get,
    path = "/quotes",
    responses(
        (status = 200, description = "List of quotes", body = [StoredQuote]),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    )
)]
pub async fn list_quotes(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<StoredQuote>>, ApiError> {
    Ok(Json(state.db.list_quotes().await?))
}

/// Get a stored quote by its ID.
#[utoipa::path(
    get,
    path = "/quotes/{id}",
    responses(
        (status = 200, description = "Quote details", body = StoredQuote),
        (status = 404, description = "Quote not found", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    params(
        ("id" = Uuid, Path, description = "Quote ID")
    )
)]
pub async fn get_quote(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<StoredQuote>, ApiError> {
    let quote = state
        .db
        .get_quote(id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Quote with id '{}' not found", id)))?;
    Ok(Json(quote))
}
