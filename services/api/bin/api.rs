//! Main Entrypoint for the Quote API Service
//!
//! This binary is responsible for:
//! 1. Loading configuration from the environment.
//! 2. Initializing the database connection pool and running migrations.
//! 3. Building the realtime credential service.
//! 4. Constructing the Axum router and applying middleware.
//! 5. Starting the web server and handling graceful shutdown.

use anyhow::Context;
use quote_api::{
    config::{Config, TokenProvider},
    db::Db,
    router::create_router,
    state::AppState,
    tokens::{EphemeralTokenService, OpenAITokenService, StaticTokenService, session_config},
};
use sqlx::PgPool;
use std::{fs, net::SocketAddr, path::Path, sync::Arc};
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, warn};

/// Listens for the `Ctrl+C` signal to gracefully shut down the server.
async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received shutdown signal. Shutting down gracefully..."),
        Err(e) => error!(error = %e, "Failed to listen for Ctrl+C; shutting down."),
    }
}

/// Reads the realtime system prompt from the prompts directory.
fn load_system_prompt(prompts_path: &Path) -> anyhow::Result<String> {
    let path = prompts_path.join("system_prompt.md");
    fs::read_to_string(&path).with_context(|| format!("Could not read {}", path.display()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // --- 1. Load Configuration ---
    let config = Config::from_env().context("Failed to load configuration")?;

    // --- 2. Initialize Logging ---
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .init();
    info!("Configuration loaded. Initializing application state...");

    // --- 3. Initialize Database ---
    let pool = PgPool::connect(&config.database_url)
        .await
        .context("Failed to connect to database")?;
    let db = Arc::new(Db::new(pool));
    db.run_migrations().await?;
    info!("Database connection established and migrations are up-to-date.");

    // --- 4. Initialize Credential Service ---
    let token_service: Arc<dyn EphemeralTokenService> = match &config.token_provider {
        TokenProvider::OpenAI => {
            let api_key = config
                .openai_api_key
                .clone()
                .context("OPENAI_API_KEY is required for the 'openai' token provider")?;
            let instructions = load_system_prompt(&config.prompts_path)?;
            let session =
                session_config(&config.realtime_model, &config.realtime_voice, &instructions)?;
            info!(model = %config.realtime_model, voice = %config.realtime_voice, "Using OpenAI realtime sessions.");
            Arc::new(OpenAITokenService::new(api_key, session))
        }
        TokenProvider::Static => {
            warn!("Using the static token provider; credentials are not real.");
            Arc::new(StaticTokenService::new("ek_static_dev"))
        }
    };

    let app_state = Arc::new(AppState { db, token_service });

    // --- 5. Create Router and Apply Middleware ---
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = create_router(app_state).layer(cors);

    // --- 6. Start Server ---
    info!(
        provider = ?config.token_provider,
        bind_address = %config.bind_address,
        "Service configured. Starting server..."
    );
    let listener = tokio::net::TcpListener::bind(config.bind_address).await?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("Server has shut down.");
    Ok(())
}
