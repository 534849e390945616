//! Quote Voice Client
//!
//! Session controller and its collaborators (microphone, backend, config) for
//! the voice quote agent. The `quote-voice` binary is a thin wrapper around
//! this library.

pub mod backend;
pub mod config;
pub mod mic;
pub mod session;

pub use session::{SessionSettings, SessionStatus, StartError, VoiceSession};
