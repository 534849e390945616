//! Peer abstraction underneath the transport.
//!
//! A [`PeerConnector`] performs the session negotiation with the remote
//! realtime service and hands back one local data channel plus a stream of
//! [`PeerEvent`]s. How the negotiation happens (WebSocket upgrade, SDP
//! exchange, ...) is the connector's business.

use crate::{
    error::{ChannelError, ConnectionError},
    media::AudioTrack,
};
use async_trait::async_trait;
use secrecy::SecretString;
use std::{fmt, sync::Arc};
use tokio::sync::mpsc;

/// Lifecycle of the underlying peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::New => "new",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Failed => "failed",
            ConnectionState::Closed => "closed",
        }
    }

    /// `closed` (explicit teardown) and `failed` (unrecoverable).
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Closed | ConnectionState::Failed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A logical duplex message channel on a peer connection.
pub trait DataChannel: Send + Sync {
    fn label(&self) -> &str;
    fn send_text(&self, text: &str) -> Result<(), ChannelError>;
    fn close(&self);
}

/// Raw inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerPayload {
    Text(String),
    Binary(Vec<u8>),
}

/// Notifications from the peer, delivered in order.
pub enum PeerEvent {
    StateChanged(ConnectionState),
    /// The remote side opened a channel of its own.
    ChannelOffered(Arc<dyn DataChannel>),
    ChannelOpen,
    ChannelClosed,
    Message(PeerPayload),
}

impl fmt::Debug for PeerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerEvent::StateChanged(s) => f.debug_tuple("StateChanged").field(s).finish(),
            PeerEvent::ChannelOffered(ch) => f.debug_tuple("ChannelOffered").field(&ch.label()).finish(),
            PeerEvent::ChannelOpen => f.write_str("ChannelOpen"),
            PeerEvent::ChannelClosed => f.write_str("ChannelClosed"),
            PeerEvent::Message(p) => f.debug_tuple("Message").field(p).finish(),
        }
    }
}

/// Tears the peer connection down.
pub trait PeerHandle: Send + Sync {
    fn close(&self);
}

/// Result of a successful negotiation.
pub struct PeerSession {
    /// The channel created locally for protocol events.
    pub channel: Arc<dyn DataChannel>,
    pub events: mpsc::Receiver<PeerEvent>,
    pub peer: Box<dyn PeerHandle>,
}

#[async_trait]
pub trait PeerConnector: Send + Sync {
    /// Negotiates a session, attaching `audio` as the outbound track.
    async fn connect(
        &self,
        audio: AudioTrack,
        credential: &SecretString,
    ) -> Result<PeerSession, ConnectionError>;
}
