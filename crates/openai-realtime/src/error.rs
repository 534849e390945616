use thiserror::Error;

/// Failures while establishing a realtime connection.
///
/// Once a connection is up, transport problems are reported through the
/// connection-state stream instead.
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("invalid realtime request: {0}")]
    Request(String),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("session negotiation failed: {0}")]
    Negotiation(String),

    #[error("connection attempt was superseded by a disconnect")]
    Aborted,
}

/// A data channel refused an outbound message.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    #[error("data channel is closed")]
    Closed,
    #[error("data channel send failed: {0}")]
    Send(String),
}
