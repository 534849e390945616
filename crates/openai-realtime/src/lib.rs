//! Realtime transport for the OpenAI realtime API.
//!
//! [`RealtimeTransport`] owns one peer connection with a single data channel,
//! buffers outbound protocol messages until that channel is open, and exposes
//! connection state and inbound messages as streams. The negotiation itself is
//! delegated to a [`PeerConnector`]; [`WebSocketConnector`] is the stock one.

pub mod error;
pub mod media;
pub mod peer;
pub mod transport;
pub mod websocket;

pub use error::{ChannelError, ConnectionError};
pub use media::{AudioTrack, REALTIME_PCM16_SAMPLE_RATE};
pub use peer::{
    ConnectionState, DataChannel, PeerConnector, PeerEvent, PeerHandle, PeerPayload, PeerSession,
};
pub use secrecy::SecretString;
pub use transport::RealtimeTransport;
pub use websocket::{DEFAULT_REALTIME_URL, WebSocketConnector};
