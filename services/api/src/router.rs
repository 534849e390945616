//! Axum Router Configuration
//!
//! REST routes for credentials and quotes, plus the OpenAPI document and
//! Swagger UI.

use crate::{
    handlers,
    models::{ClientSecret, EphemeralToken, ErrorResponse, StoredQuote},
    state::AppState,
};
use quote_core::quote::{PreviousClaims, QuotePayload, VehicleDetails};

use axum::{
    Router,
    routing::{get, post},
};
use std::sync::Arc;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::mint_ephemeral,
        handlers::create_quote,
        handlers::list_quotes,
        handlers::get_quote,
    ),
    components(
        schemas(EphemeralToken, ClientSecret, StoredQuote, QuotePayload, VehicleDetails, PreviousClaims, ErrorResponse)
    ),
    tags(
        (name = "Quote API", description = "Realtime credentials and quote persistence for the voice quote agent")
    )
)]
pub struct ApiDoc;

/// Creates the main Axum router for the application.
pub fn create_router(app_state: Arc<AppState>) -> Router {
    let api_router = Router::new()
        .route("/ephemeral", get(handlers::mint_ephemeral))
        .route("/quote", post(handlers::create_quote))
        .route("/quotes", get(handlers::list_quotes))
        .route("/quotes/{id}", get(handlers::get_quote))
        .with_state(app_state);

    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .merge(api_router)
}
