//! Session Controller
//!
//! Brings up microphone, credential and transport in order, runs the turn
//! engine over the transport's messages, and reduces connection state to a
//! coarse [`SessionStatus`]. Anything that fails during start tears the whole
//! session down again.

use crate::{
    backend::Backend,
    mic::{MicError, Microphone},
};
use futures::StreamExt;
use openai_realtime::{ConnectionError, ConnectionState, RealtimeTransport};
use quote_core::{EngineConfig, Outbound, QuotePayload, RecordStore, TurnEngine};
use secrecy::ExposeSecret;
use std::{
    fmt,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};
use thiserror::Error;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tokio_stream::wrappers::{UnboundedReceiverStream, WatchStream};
use tracing::{Instrument, info, info_span, warn};

const FINALIZED_BUFFER: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Idle,
    Connecting,
    Live,
    Error,
    PermissionDenied,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Idle => "idle",
            SessionStatus::Connecting => "connecting",
            SessionStatus::Live => "live",
            SessionStatus::Error => "error",
            SessionStatus::PermissionDenied => "permission-denied",
        }
    }

    /// `connected -> live`, `failed | disconnected -> error`; other states
    /// leave the status alone.
    pub fn from_connection(state: ConnectionState) -> Option<Self> {
        match state {
            ConnectionState::Connected => Some(SessionStatus::Live),
            ConnectionState::Failed | ConnectionState::Disconnected => Some(SessionStatus::Error),
            _ => None,
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum StartError {
    #[error("microphone permission denied")]
    PermissionDenied,
    #[error("microphone did not become live in time")]
    Timeout,
    #[error("backend returned no realtime token")]
    NoToken,
    #[error("realtime transport failed: {0}")]
    TransportFailed(#[source] ConnectionError),
    #[error("capture device unavailable: {0}")]
    DeviceUnavailable(String),
    #[error("session was stopped while starting")]
    Cancelled,
}

impl StartError {
    pub fn reason(&self) -> &'static str {
        match self {
            StartError::PermissionDenied => "permission_denied",
            StartError::Timeout => "timeout",
            StartError::NoToken => "no_token",
            StartError::TransportFailed(_) => "transport_failed",
            StartError::DeviceUnavailable(_) => "device_unavailable",
            StartError::Cancelled => "cancelled",
        }
    }
}

impl From<MicError> for StartError {
    fn from(e: MicError) -> Self {
        match e {
            MicError::PermissionDenied => StartError::PermissionDenied,
            MicError::NotLive(_) => StartError::Timeout,
            MicError::Unavailable(reason) => StartError::DeviceUnavailable(reason),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub mic_live_timeout: Option<Duration>,
    pub engine: EngineConfig,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            mic_live_timeout: Some(Duration::from_secs(2)),
            engine: EngineConfig::default(),
        }
    }
}

/// Routes engine output onto the transport.
struct TransportOutbound(RealtimeTransport);

impl Outbound for TransportOutbound {
    fn send(&self, message: String) {
        self.0.send(message);
    }
}

struct Shared {
    status: watch::Sender<SessionStatus>,
    /// Bumped by every start and stop; late results from an older epoch are
    /// discarded.
    epoch: AtomicU64,
}

impl Shared {
    fn is_current(&self, epoch: u64) -> bool {
        self.epoch.load(Ordering::SeqCst) == epoch
    }
}

pub struct VoiceSession {
    mic: Arc<dyn Microphone>,
    backend: Arc<dyn Backend>,
    transport: RealtimeTransport,
    store: RecordStore<QuotePayload>,
    settings: SessionSettings,
    shared: Arc<Shared>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl VoiceSession {
    pub fn new(
        mic: Arc<dyn Microphone>,
        backend: Arc<dyn Backend>,
        transport: RealtimeTransport,
        settings: SessionSettings,
    ) -> Self {
        let (status, _) = watch::channel(SessionStatus::Idle);
        Self {
            mic,
            backend,
            transport,
            store: RecordStore::default(),
            settings,
            shared: Arc::new(Shared {
                status,
                epoch: AtomicU64::new(0),
            }),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn status(&self) -> SessionStatus {
        *self.shared.status.borrow()
    }

    /// Replays the current status, then every change.
    pub fn status_stream(&self) -> WatchStream<SessionStatus> {
        WatchStream::new(self.shared.status.subscribe())
    }

    pub fn store(&self) -> &RecordStore<QuotePayload> {
        &self.store
    }

    pub fn transport(&self) -> &RealtimeTransport {
        &self.transport
    }

    /// Starts a voice session. On failure everything acquired so far is
    /// released and the status is `error` (or `permission-denied`).
    pub async fn start(&self) -> Result<(), StartError> {
        self.teardown();
        let epoch = self.shared.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        self.set_status(SessionStatus::Connecting);

        match self.establish(epoch).await {
            Ok(()) => {
                info!("Voice session started.");
                Ok(())
            }
            Err(StartError::Cancelled) => {
                info!("Voice session start was cancelled.");
                Err(StartError::Cancelled)
            }
            Err(e) => {
                warn!(reason = e.reason(), error = %e, "Voice session failed to start.");
                self.stop();
                self.set_status(match e {
                    StartError::PermissionDenied => SessionStatus::PermissionDenied,
                    _ => SessionStatus::Error,
                });
                Err(e)
            }
        }
    }

    /// Idempotent: disconnects, releases the microphone, stops background
    /// tasks and resets the status to `idle`.
    pub fn stop(&self) {
        self.shared.epoch.fetch_add(1, Ordering::SeqCst);
        self.teardown();
        self.set_status(SessionStatus::Idle);
    }

    fn teardown(&self) {
        for task in self.tasks.lock().unwrap_or_else(|e| e.into_inner()).drain(..) {
            task.abort();
        }
        self.transport.disconnect();
        self.mic.release();
    }

    fn set_status(&self, status: SessionStatus) {
        let previous = self.shared.status.send_replace(status);
        if previous != status {
            info!(%status, %previous, "Session status changed.");
        }
    }

    fn ensure_current(&self, epoch: u64) -> Result<(), StartError> {
        if self.shared.is_current(epoch) {
            Ok(())
        } else {
            Err(StartError::Cancelled)
        }
    }

    async fn establish(&self, epoch: u64) -> Result<(), StartError> {
        let track = self.mic.acquire().await?;
        if let Err(e) = self.ensure_current(epoch) {
            // `stop()` released before this capture was stored.
            self.mic.release();
            return Err(e);
        }

        if let Some(timeout) = self.settings.mic_live_timeout {
            self.mic.wait_until_live(timeout).await?;
            self.ensure_current(epoch)?;
        }

        let token = self.backend.ephemeral_token().await.map_err(|e| {
            warn!(error = ?e, "Failed to fetch realtime token.");
            StartError::NoToken
        })?;
        self.ensure_current(epoch)?;
        if token.expose_secret().is_empty() {
            return Err(StartError::NoToken);
        }

        // Subscribe before connecting so no early message is missed.
        let messages = Box::pin(self.transport.messages());
        let states = self.transport.connection_state();

        self.transport
            .connect(track, &token)
            .await
            .map_err(|e| match e {
                ConnectionError::Aborted => StartError::Cancelled,
                e => StartError::TransportFailed(e),
            })?;
        self.ensure_current(epoch)?;

        let (finalized_tx, finalized_rx) = mpsc::channel(FINALIZED_BUFFER);
        let engine = TurnEngine::new(
            self.store.clone(),
            Arc::new(TransportOutbound(self.transport.clone())),
            self.settings.engine.clone(),
        )
        .with_finalized_sink(finalized_tx);

        let span = info_span!("voice_session", epoch);
        let tasks = vec![
            tokio::spawn(engine.run(messages).instrument(span.clone())),
            tokio::spawn(
                map_status(self.shared.clone(), epoch, states).instrument(span.clone()),
            ),
            tokio::spawn(forward_finalized(self.backend.clone(), finalized_rx).instrument(span)),
        ];
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend(tasks);
        Ok(())
    }
}

impl Drop for VoiceSession {
    fn drop(&mut self) {
        self.teardown();
    }
}

async fn map_status(
    shared: Arc<Shared>,
    epoch: u64,
    mut states: UnboundedReceiverStream<ConnectionState>,
) {
    while let Some(state) = states.next().await {
        if !shared.is_current(epoch) {
            return;
        }
        if let Some(status) = SessionStatus::from_connection(state) {
            let previous = shared.status.send_replace(status);
            if previous != status {
                info!(%state, %status, "Session status changed.");
            }
        }
    }
}

async fn forward_finalized(backend: Arc<dyn Backend>, mut finalized: mpsc::Receiver<QuotePayload>) {
    while let Some(record) = finalized.recv().await {
        if let Err(e) = backend.submit_quote(&record).await {
            warn!(error = ?e, "Failed to submit finalized quote.");
        }
    }
}
