//! Quote API Library Crate
//!
//! Backend for the voice quote agent: mints realtime credentials and stores
//! finalized quotes. The `api` binary is a thin wrapper around this library.

pub mod config;
pub mod db;
pub mod handlers;
pub mod models;
pub mod router;
pub mod state;
pub mod tokens;
