//! Quote Agent Core
//!
//! I/O-free heart of the voice quote agent: the typed record being collected,
//! the shared store holding it, the realtime protocol messages, the tool
//! definitions, and the turn/tool engine that ties them together.

pub mod engine;
pub mod form;
pub mod protocol;
pub mod quote;
pub mod store;
pub mod tools;

pub use engine::{EngineConfig, Outbound, TurnEngine, TurnGate};
pub use form::{FieldError, FormRecord};
pub use quote::{QuoteField, QuotePayload};
pub use store::RecordStore;
