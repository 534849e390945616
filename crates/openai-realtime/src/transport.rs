//! The realtime transport: one peer connection, one data channel, an outbound
//! queue that holds messages until the channel opens, and per-subscriber feeds
//! for connection state and inbound messages.
//!
//! Each subscriber gets its own unbounded feed, so a slow consumer sees every
//! state transition and every message rather than the latest one.

use crate::{
    error::ConnectionError,
    media::AudioTrack,
    peer::{ConnectionState, DataChannel, PeerConnector, PeerEvent, PeerHandle, PeerPayload},
};
use secrecy::SecretString;
use std::{
    collections::VecDeque,
    sync::{
        Arc, Mutex, MutexGuard, Weak,
        atomic::{AtomicU64, Ordering},
    },
};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info, instrument, warn};

/// Handle to the transport. Cheap to clone; clones share one connection.
#[derive(Clone)]
pub struct RealtimeTransport {
    inner: Arc<Inner>,
}

struct Inner {
    connector: Arc<dyn PeerConnector>,
    state: watch::Sender<ConnectionState>,
    state_feeds: Subscribers<ConnectionState>,
    message_feeds: Subscribers<String>,
    link: Mutex<Link>,
    /// Bumped on every connect and disconnect. Work started under an older
    /// generation must not touch the link.
    generation: AtomicU64,
}

/// Unbounded fan-out. Closed receivers are pruned on the next publish.
struct Subscribers<T> {
    feeds: Mutex<Vec<mpsc::UnboundedSender<T>>>,
}

impl<T: Clone> Subscribers<T> {
    fn new() -> Self {
        Self {
            feeds: Mutex::new(Vec::new()),
        }
    }

    fn feeds(&self) -> MutexGuard<'_, Vec<mpsc::UnboundedSender<T>>> {
        self.feeds.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn publish(&self, item: T) {
        self.feeds().retain(|feed| feed.send(item.clone()).is_ok());
    }

    /// Registers a feed. `seed` runs under the feed lock, so nothing
    /// published concurrently lands before it or goes missing.
    fn subscribe_with(&self, seed: impl FnOnce() -> Option<T>) -> mpsc::UnboundedReceiver<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut feeds = self.feeds();
        if let Some(item) = seed() {
            let _ = tx.send(item);
        }
        feeds.push(tx);
        rx
    }
}

#[derive(Default)]
struct Link {
    channel: Option<Arc<dyn DataChannel>>,
    open: bool,
    queue: VecDeque<String>,
    peer: Option<Box<dyn PeerHandle>>,
    pump: Option<JoinHandle<()>>,
}

impl Link {
    /// Drains the queue front to back. Stops at the first failure and leaves
    /// the rest queued for the next open.
    fn flush(&mut self) {
        let Some(channel) = self.channel.clone() else {
            return;
        };
        while let Some(message) = self.queue.front() {
            match channel.send_text(message) {
                Ok(()) => {
                    self.queue.pop_front();
                }
                Err(e) => {
                    warn!(error = %e, remaining = self.queue.len(), "Outbound flush failed; keeping queue.");
                    break;
                }
            }
        }
    }
}

impl Inner {
    fn link(&self) -> MutexGuard<'_, Link> {
        self.link.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    /// Records a transition and hands it to every state subscriber. The feed
    /// lock is held across both so a new subscriber's seed and the feed agree.
    fn set_state(&self, state: ConnectionState) {
        let mut feeds = self.state_feeds.feeds();
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(%state, %previous, "Connection state changed.");
            feeds.retain(|feed| feed.send(state).is_ok());
        }
    }

    /// Applies one peer event. Returns `false` once the connection that
    /// produced it has been retired; the check runs under the link lock so a
    /// concurrent `disconnect` is either fully before or fully after.
    fn handle_event(&self, generation: u64, event: PeerEvent) -> bool {
        let mut link = self.link();
        if !self.is_current(generation) {
            debug!(?event, "Ignoring event from a retired connection.");
            return false;
        }
        match event {
            PeerEvent::StateChanged(state) => self.set_state(state),
            PeerEvent::ChannelOffered(channel) => {
                if link.channel.is_some() {
                    warn!(label = channel.label(), "Closing duplicate data channel offered by peer.");
                    drop(link);
                    channel.close();
                } else {
                    link.channel = Some(channel);
                }
            }
            PeerEvent::ChannelOpen => {
                link.open = true;
                link.flush();
            }
            PeerEvent::ChannelClosed => link.open = false,
            PeerEvent::Message(PeerPayload::Text(text)) => self.message_feeds.publish(text),
            PeerEvent::Message(PeerPayload::Binary(bytes)) => match String::from_utf8(bytes) {
                Ok(text) => self.message_feeds.publish(text),
                Err(e) => {
                    let raw = String::from_utf8_lossy(e.as_bytes());
                    warn!(%raw, "Dropping inbound binary message that is not UTF-8.");
                }
            },
        }
        true
    }
}

impl RealtimeTransport {
    pub fn new(connector: Arc<dyn PeerConnector>) -> Self {
        let (state, _) = watch::channel(ConnectionState::New);
        Self {
            inner: Arc::new(Inner {
                connector,
                state,
                state_feeds: Subscribers::new(),
                message_feeds: Subscribers::new(),
                link: Mutex::new(Link::default()),
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// Negotiates a session and wires its data channel.
    ///
    /// Negotiation failures set the state to `failed` and are returned. If
    /// [`disconnect`](Self::disconnect) runs while negotiation is in flight the
    /// late session is closed and `ConnectionError::Aborted` is returned.
    #[instrument(skip_all)]
    pub async fn connect(
        &self,
        audio: AudioTrack,
        credential: &SecretString,
    ) -> Result<(), ConnectionError> {
        if self.inner.link().peer.is_some() {
            self.disconnect();
        }
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.set_state(ConnectionState::Connecting);

        let session = match self.inner.connector.connect(audio, credential).await {
            Ok(session) => session,
            Err(e) => {
                if self.inner.is_current(generation) {
                    self.inner.set_state(ConnectionState::Failed);
                }
                return Err(e);
            }
        };

        let mut link = self.inner.link();
        if !self.inner.is_current(generation) {
            drop(link);
            debug!("Discarding session negotiated after teardown.");
            session.channel.close();
            session.peer.close();
            return Err(ConnectionError::Aborted);
        }

        link.channel = Some(session.channel);
        link.open = false;
        link.peer = Some(session.peer);
        link.pump = Some(tokio::spawn(pump(
            Arc::downgrade(&self.inner),
            generation,
            session.events,
        )));
        info!("Realtime session negotiated.");
        Ok(())
    }

    /// Sends now if the channel is open, otherwise queues. Never fails.
    pub fn send(&self, message: impl Into<String>) {
        let mut link = self.inner.link();
        link.queue.push_back(message.into());
        if link.open {
            link.flush();
        }
    }

    /// Tears everything down and forces the state to `closed`. Safe to call at
    /// any time, any number of times.
    pub fn disconnect(&self) {
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        let link = std::mem::take(&mut *self.inner.link());

        if let Some(pump) = link.pump {
            pump.abort();
        }
        if let Some(channel) = link.channel {
            channel.close();
        }
        if let Some(peer) = link.peer {
            peer.close();
        }
        if !link.queue.is_empty() {
            debug!(dropped = link.queue.len(), "Cleared outbound queue on disconnect.");
        }
        self.inner.set_state(ConnectionState::Closed);
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Replays the current state, then every transition after it, none
    /// skipped.
    pub fn connection_state(&self) -> UnboundedReceiverStream<ConnectionState> {
        let state = &self.inner.state;
        UnboundedReceiverStream::new(
            self.inner
                .state_feeds
                .subscribe_with(|| Some(*state.borrow())),
        )
    }

    /// Latest-value view of the state, for callers that only need the current one.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn subscribe_messages(&self) -> mpsc::UnboundedReceiver<String> {
        self.inner.message_feeds.subscribe_with(|| None)
    }

    /// One item per inbound protocol message, in arrival order, none dropped.
    pub fn messages(&self) -> UnboundedReceiverStream<String> {
        UnboundedReceiverStream::new(self.subscribe_messages())
    }

    /// Messages waiting for the channel to open.
    pub fn queued(&self) -> usize {
        self.inner.link().queue.len()
    }
}

async fn pump(inner: Weak<Inner>, generation: u64, mut events: mpsc::Receiver<PeerEvent>) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        if !inner.handle_event(generation, event) {
            return;
        }
    }
    debug!("Peer event stream ended.");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ChannelError;
    use async_trait::async_trait;
    use std::{
        collections::{HashMap, HashSet},
        sync::atomic::AtomicBool,
        time::Duration,
    };
    use tokio::sync::Notify;
    use tokio_stream::StreamExt;

    #[derive(Default)]
    struct FakeChannel {
        sent: Mutex<Vec<String>>,
        failing: AtomicBool,
        closed: AtomicBool,
    }

    impl FakeChannel {
        fn sent(&self) -> Vec<String> {
            self.sent.lock().unwrap().clone()
        }
        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }
    }

    impl DataChannel for FakeChannel {
        fn label(&self) -> &str {
            "oai-events"
        }
        fn send_text(&self, text: &str) -> Result<(), ChannelError> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(ChannelError::Send("buffer full".into()));
            }
            self.sent.lock().unwrap().push(text.to_string());
            Ok(())
        }
        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct FakePeer {
        closed: AtomicBool,
    }

    impl PeerHandle for Arc<FakePeer> {
        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    struct FakeConnector {
        channel: Arc<FakeChannel>,
        peer: Arc<FakePeer>,
        events: Mutex<Option<mpsc::Receiver<PeerEvent>>>,
        gate: Option<Arc<Notify>>,
        fail: bool,
    }

    #[async_trait]
    impl PeerConnector for FakeConnector {
        async fn connect(
            &self,
            _audio: AudioTrack,
            _credential: &SecretString,
        ) -> Result<crate::peer::PeerSession, ConnectionError> {
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            if self.fail {
                return Err(ConnectionError::Negotiation("ice failed".into()));
            }
            let events = self.events.lock().unwrap().take().expect("connect called once");
            Ok(crate::peer::PeerSession {
                channel: self.channel.clone(),
                events,
                peer: Box::new(self.peer.clone()),
            })
        }
    }

    struct Harness {
        transport: RealtimeTransport,
        channel: Arc<FakeChannel>,
        peer: Arc<FakePeer>,
        events: mpsc::Sender<PeerEvent>,
        gate: Arc<Notify>,
    }

    fn harness(gated: bool, fail: bool) -> Harness {
        let (events, rx) = mpsc::channel(16);
        let channel = Arc::new(FakeChannel::default());
        let peer = Arc::new(FakePeer::default());
        let gate = Arc::new(Notify::new());
        let connector = FakeConnector {
            channel: channel.clone(),
            peer: peer.clone(),
            events: Mutex::new(Some(rx)),
            gate: gated.then(|| gate.clone()),
            fail,
        };
        Harness {
            transport: RealtimeTransport::new(Arc::new(connector)),
            channel,
            peer,
            events,
            gate,
        }
    }

    fn track() -> AudioTrack {
        let (_tx, rx) = mpsc::channel(1);
        AudioTrack::new(24_000, rx)
    }

    fn credential() -> SecretString {
        SecretString::from("ek_test")
    }

    async fn eventually(check: impl Fn() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_queue_flushes_in_order_once_open() {
        let h = harness(false, false);
        h.transport.send("early");
        h.transport.connect(track(), &credential()).await.unwrap();
        h.transport.send("a");
        h.transport.send("b");
        assert!(h.channel.sent().is_empty());
        assert_eq!(h.transport.queued(), 3);

        h.events.send(PeerEvent::ChannelOpen).await.unwrap();
        eventually(|| h.channel.sent().len() == 3).await;
        assert_eq!(h.channel.sent(), vec!["early", "a", "b"]);

        h.transport.send("c");
        assert_eq!(h.channel.sent(), vec!["early", "a", "b", "c"]);
        assert_eq!(h.transport.queued(), 0);
    }

    #[tokio::test]
    async fn test_flush_failure_keeps_remaining_queue() {
        let h = harness(false, false);
        h.transport.connect(track(), &credential()).await.unwrap();
        h.transport.send("one");
        h.transport.send("two");
        h.channel.failing.store(true, Ordering::SeqCst);

        let mut inbound = h.transport.subscribe_messages();
        h.events.send(PeerEvent::ChannelOpen).await.unwrap();
        h.events
            .send(PeerEvent::Message(PeerPayload::Text("marker".into())))
            .await
            .unwrap();
        assert_eq!(inbound.recv().await.unwrap(), "marker");
        assert_eq!(h.transport.queued(), 2);

        // A send that fails while open is queued rather than dropped.
        h.transport.send("three");
        assert_eq!(h.transport.queued(), 3);

        h.channel.failing.store(false, Ordering::SeqCst);
        h.events.send(PeerEvent::ChannelOpen).await.unwrap();
        eventually(|| h.transport.queued() == 0).await;
        assert_eq!(h.channel.sent(), vec!["one", "two", "three"]);
    }

    #[tokio::test]
    async fn test_duplicate_channel_is_closed_without_wiring() {
        let h = harness(false, false);
        h.transport.connect(track(), &credential()).await.unwrap();

        let duplicate = Arc::new(FakeChannel::default());
        h.events
            .send(PeerEvent::ChannelOffered(duplicate.clone()))
            .await
            .unwrap();
        h.events.send(PeerEvent::ChannelOpen).await.unwrap();
        eventually(|| duplicate.is_closed()).await;

        h.transport.send("hello");
        eventually(|| h.channel.sent() == vec!["hello"]).await;
        assert!(duplicate.sent().is_empty());
        assert!(!h.channel.is_closed());
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent_and_forces_closed() {
        let h = harness(false, false);
        h.transport.disconnect();
        assert_eq!(h.transport.state(), ConnectionState::Closed);

        h.transport.connect(track(), &credential()).await.unwrap();
        h.events
            .send(PeerEvent::StateChanged(ConnectionState::Connected))
            .await
            .unwrap();
        eventually(|| h.transport.state() == ConnectionState::Connected).await;
        h.transport.send("queued");

        h.transport.disconnect();
        h.transport.disconnect();
        assert_eq!(h.transport.state(), ConnectionState::Closed);
        assert_eq!(h.transport.queued(), 0);
        assert!(h.channel.is_closed());
        assert!(h.peer.closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_binary_messages_are_decoded_and_bad_bytes_skipped() {
        let h = harness(false, false);
        let mut inbound = h.transport.subscribe_messages();
        h.transport.connect(track(), &credential()).await.unwrap();

        for payload in [
            PeerPayload::Binary(br#"{"type":"response.created"}"#.to_vec()),
            PeerPayload::Binary(vec![0xff, 0xfe, 0x00]),
            PeerPayload::Text("after".into()),
        ] {
            h.events.send(PeerEvent::Message(payload)).await.unwrap();
        }

        assert_eq!(inbound.recv().await.unwrap(), r#"{"type":"response.created"}"#);
        assert_eq!(inbound.recv().await.unwrap(), "after");
    }

    #[tokio::test]
    async fn test_disconnect_during_connect_discards_late_session() {
        let h = harness(true, false);
        let transport = h.transport.clone();
        let attempt = tokio::spawn(async move { transport.connect(track(), &credential()).await });

        eventually(|| h.transport.state() == ConnectionState::Connecting).await;
        h.transport.disconnect();
        h.gate.notify_one();

        let result = attempt.await.unwrap();
        assert!(matches!(result, Err(ConnectionError::Aborted)));
        assert_eq!(h.transport.state(), ConnectionState::Closed);
        assert!(h.channel.is_closed());
        assert!(h.peer.closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_negotiation_failure_surfaces_as_failed_state() {
        let h = harness(false, true);
        let result = h.transport.connect(track(), &credential()).await;
        assert!(matches!(result, Err(ConnectionError::Negotiation(_))));
        assert_eq!(h.transport.state(), ConnectionState::Failed);
    }

    #[tokio::test]
    async fn test_connection_state_replays_latest() {
        let h = harness(false, false);
        h.transport.connect(track(), &credential()).await.unwrap();
        h.events
            .send(PeerEvent::StateChanged(ConnectionState::Connected))
            .await
            .unwrap();
        eventually(|| h.transport.state() == ConnectionState::Connected).await;

        let mut states = h.transport.connection_state();
        assert_eq!(states.next().await, Some(ConnectionState::Connected));
    }

    #[tokio::test]
    async fn test_connection_state_yields_every_transition() {
        let h = harness(false, false);
        let states = h.transport.connection_state();
        let mut inbound = h.transport.subscribe_messages();
        h.transport.connect(track(), &credential()).await.unwrap();

        for state in [
            ConnectionState::Connected,
            ConnectionState::Disconnected,
            ConnectionState::Connected,
        ] {
            h.events.send(PeerEvent::StateChanged(state)).await.unwrap();
        }
        h.events
            .send(PeerEvent::Message(PeerPayload::Text("drained".into())))
            .await
            .unwrap();
        assert_eq!(inbound.recv().await.unwrap(), "drained");
        h.transport.disconnect();

        let seen: Vec<_> = states.take(6).collect().await;
        assert_eq!(
            seen,
            vec![
                ConnectionState::New,
                ConnectionState::Connecting,
                ConnectionState::Connected,
                ConnectionState::Disconnected,
                ConnectionState::Connected,
                ConnectionState::Closed,
            ]
        );
    }

    #[tokio::test]
    async fn test_slow_subscriber_receives_every_message() {
        let h = harness(false, false);
        let mut inbound = h.transport.subscribe_messages();
        h.transport.connect(track(), &credential()).await.unwrap();

        let events = h.events.clone();
        let producer = tokio::spawn(async move {
            for i in 0..1_000 {
                let text = format!(r#"{{"type":"response.audio.delta","n":{i}}}"#);
                events
                    .send(PeerEvent::Message(PeerPayload::Text(text)))
                    .await
                    .unwrap();
            }
            events
                .send(PeerEvent::Message(PeerPayload::Text(
                    r#"{"type":"response.function_call_arguments.done"}"#.into(),
                )))
                .await
                .unwrap();
        });
        producer.await.unwrap();

        for i in 0..1_000 {
            let text = inbound.recv().await.unwrap();
            assert!(text.ends_with(&format!(r#""n":{i}}}"#)), "unexpected {text}");
        }
        assert_eq!(
            inbound.recv().await.unwrap(),
            r#"{"type":"response.function_call_arguments.done"}"#
        );
    }

    #[tokio::test]
    async fn test_events_from_retired_generation_are_ignored() {
        let h = harness(false, false);
        h.transport.connect(track(), &credential()).await.unwrap();
        let retired = h.transport.inner.generation.load(Ordering::SeqCst);
        h.transport.disconnect();

        let applied = h
            .transport
            .inner
            .handle_event(retired, PeerEvent::StateChanged(ConnectionState::Connected));
        assert!(!applied);
        assert_eq!(h.transport.state(), ConnectionState::Closed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_sends_racing_flushes_deliver_each_message_once() {
        const SENDERS: usize = 4;
        const PER_SENDER: usize = 250;

        let h = harness(false, false);
        h.transport.connect(track(), &credential()).await.unwrap();

        let toggler = {
            let events = h.events.clone();
            tokio::spawn(async move {
                for _ in 0..100 {
                    events.send(PeerEvent::ChannelOpen).await.unwrap();
                    tokio::task::yield_now().await;
                    events.send(PeerEvent::ChannelClosed).await.unwrap();
                }
                events.send(PeerEvent::ChannelOpen).await.unwrap();
            })
        };
        let senders: Vec<_> = (0..SENDERS)
            .map(|sender| {
                let transport = h.transport.clone();
                tokio::spawn(async move {
                    for i in 0..PER_SENDER {
                        transport.send(format!("{sender}:{i}"));
                        if i % 16 == 0 {
                            tokio::task::yield_now().await;
                        }
                    }
                })
            })
            .collect();
        for task in senders {
            task.await.unwrap();
        }
        toggler.await.unwrap();
        h.events.send(PeerEvent::ChannelOpen).await.unwrap();
        eventually(|| h.transport.queued() == 0).await;

        let sent = h.channel.sent();
        assert_eq!(sent.len(), SENDERS * PER_SENDER);
        assert_eq!(sent.iter().collect::<HashSet<_>>().len(), sent.len());

        let mut next: HashMap<usize, usize> = HashMap::new();
        for message in &sent {
            let (sender, i) = message.split_once(':').unwrap();
            let expected = next.entry(sender.parse().unwrap()).or_default();
            assert_eq!(i.parse::<usize>().unwrap(), *expected, "out of order: {message}");
            *expected += 1;
        }
    }
}
