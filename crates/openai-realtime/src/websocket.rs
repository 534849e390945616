//! A [`PeerConnector`] backed by the OpenAI realtime WebSocket endpoint.
//!
//! The socket itself is the single data channel. Microphone frames are
//! resampled and sent as `input_audio_buffer.append` events over the same
//! socket.

use crate::{
    error::{ChannelError, ConnectionError},
    media::{AudioTrack, Pcm16Uplink},
    peer::{
        ConnectionState, DataChannel, PeerConnector, PeerEvent, PeerHandle, PeerPayload,
        PeerSession,
    },
};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        client::IntoClientRequest,
        http::HeaderValue,
        protocol::Message as WsMessage,
    },
};
use tracing::{debug, info, warn};

pub const DEFAULT_REALTIME_URL: &str =
    "wss://api.openai.com/v1/realtime?model=gpt-4o-realtime-preview";

const EVENT_BUFFER: usize = 256;
/// Upper bound on the closing handshake once teardown starts.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);
const CHANNEL_LABEL: &str = "oai-events";

pub struct WebSocketConnector {
    url: String,
}

impl WebSocketConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

impl Default for WebSocketConnector {
    fn default() -> Self {
        Self::new(DEFAULT_REALTIME_URL)
    }
}

enum Outgoing {
    Text(String),
    Close,
}

struct WsDataChannel {
    out: mpsc::UnboundedSender<Outgoing>,
    closed: AtomicBool,
}

impl DataChannel for WsDataChannel {
    fn label(&self) -> &str {
        CHANNEL_LABEL
    }

    fn send_text(&self, text: &str) -> Result<(), ChannelError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ChannelError::Closed);
        }
        self.out
            .send(Outgoing::Text(text.to_string()))
            .map_err(|_| ChannelError::Closed)
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.out.send(Outgoing::Close);
        }
    }
}

/// Owns the reader and audio tasks. The writer is detached: it ends on its
/// own after sending the close frame, or once every sender is gone.
struct WsPeer {
    channel: Arc<WsDataChannel>,
    tasks: Vec<JoinHandle<()>>,
}

impl PeerHandle for WsPeer {
    fn close(&self) {
        self.channel.close();
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl Drop for WsPeer {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[async_trait]
impl PeerConnector for WebSocketConnector {
    async fn connect(
        &self,
        mut audio: AudioTrack,
        credential: &SecretString,
    ) -> Result<PeerSession, ConnectionError> {
        let mut request = self.url.as_str().into_client_request()?;
        let bearer = format!("Bearer {}", credential.expose_secret())
            .parse::<HeaderValue>()
            .map_err(|e| ConnectionError::Request(e.to_string()))?;
        request.headers_mut().insert("Authorization", bearer);
        request
            .headers_mut()
            .insert("OpenAI-Beta", HeaderValue::from_static("realtime=v1"));

        let mut uplink = Pcm16Uplink::new(audio.sample_rate)
            .map_err(|e| ConnectionError::Request(format!("unsupported sample rate: {e}")))?;

        let (ws_stream, _) = connect_async(request).await?;
        let (mut ws_tx, mut ws_rx) = ws_stream.split();
        info!(url = %self.url, "Connected to realtime WebSocket.");

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Outgoing>();
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let channel = Arc::new(WsDataChannel {
            out: out_tx.clone(),
            closed: AtomicBool::new(false),
        });

        tokio::spawn(async move {
            while let Some(outgoing) = out_rx.recv().await {
                let result = match outgoing {
                    Outgoing::Text(text) => ws_tx.send(WsMessage::Text(text.into())).await,
                    Outgoing::Close => {
                        match tokio::time::timeout(CLOSE_TIMEOUT, ws_tx.close()).await {
                            Ok(Ok(())) => debug!("Realtime WebSocket closed."),
                            Ok(Err(e)) => debug!(error = %e, "Realtime WebSocket close failed."),
                            Err(_) => warn!("Timed out sending WebSocket close frame."),
                        }
                        break;
                    }
                };
                if let Err(e) = result {
                    warn!(error = %e, "Realtime WebSocket write failed.");
                    break;
                }
            }
        });

        let reader = tokio::spawn(async move {
            let _ = events_tx
                .send(PeerEvent::StateChanged(ConnectionState::Connected))
                .await;
            let _ = events_tx.send(PeerEvent::ChannelOpen).await;

            let terminal = loop {
                let event = match ws_rx.next().await {
                    Some(Ok(WsMessage::Text(text))) => {
                        PeerEvent::Message(PeerPayload::Text(text.to_string()))
                    }
                    Some(Ok(WsMessage::Binary(bytes))) => {
                        PeerEvent::Message(PeerPayload::Binary(bytes.to_vec()))
                    }
                    Some(Ok(WsMessage::Close(frame))) => {
                        debug!(?frame, "Realtime WebSocket closed by peer.");
                        break ConnectionState::Disconnected;
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        warn!(error = %e, "Realtime WebSocket read failed.");
                        break ConnectionState::Failed;
                    }
                    None => break ConnectionState::Disconnected,
                };
                if events_tx.send(event).await.is_err() {
                    return;
                }
            };
            let _ = events_tx.send(PeerEvent::ChannelClosed).await;
            let _ = events_tx.send(PeerEvent::StateChanged(terminal)).await;
        });

        let audio_uplink = tokio::spawn(async move {
            while let Some(frame) = audio.frames.recv().await {
                if let Some(event) = uplink.push(&frame) {
                    if out_tx.send(Outgoing::Text(event)).is_err() {
                        break;
                    }
                }
            }
            debug!("Microphone track ended.");
        });

        Ok(PeerSession {
            channel: channel.clone(),
            events: events_rx,
            peer: Box::new(WsPeer {
                channel,
                tasks: vec![reader, audio_uplink],
            }),
        })
    }
}
