//! Shared Application State

use crate::{db::Db, tokens::EphemeralTokenService};
use std::sync::Arc;

/// The shared application state, created once at startup and passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Db>,
    pub token_service: Arc<dyn EphemeralTokenService>,
}
