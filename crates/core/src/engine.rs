//! Turn/Tool Protocol Engine
//!
//! Consumes inbound realtime events one at a time and decides when the remote
//! model may take a turn. Three flags gate turn requests:
//!
//! - `active`: a response is being generated.
//! - `scheduling`: a `response.create` was sent and not yet acknowledged.
//! - `pending`: a turn was earned while another was in flight.
//!
//! At most one turn is ever in flight. Streamed tool-call arguments are
//! accumulated per call id, applied to the [`RecordStore`] as whole-record
//! replacements and acknowledged exactly once.

use crate::{
    form::{FieldError, FormRecord},
    protocol::{ClientEvent, InboundEvent, Modality},
    store::RecordStore,
    tools::ToolInvocation,
};
use futures::{Stream, StreamExt};
use serde_json::{Value, json};
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::{sync::mpsc, time::Instant};
use tracing::{debug, error, info, warn};

/// Utterances shorter than this are treated as noise.
pub const DEFAULT_MIN_SPEECH: Duration = Duration::from_millis(400);

/// Outbound side of the realtime channel as seen by the engine.
///
/// Sending never fails from the caller's point of view; the transport queues
/// whatever it cannot deliver yet.
#[cfg_attr(test, mockall::automock)]
pub trait Outbound: Send + Sync {
    fn send(&self, message: String);
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub min_speech: Duration,
    pub modalities: Vec<Modality>,
    /// Keeps the model on topic, e.g. "auto insurance".
    pub topic: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            min_speech: DEFAULT_MIN_SPEECH,
            modalities: vec![Modality::Audio, Modality::Text],
            topic: "auto insurance".to_string(),
        }
    }
}

/// Gating state. See the module docs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TurnGate {
    pub active: bool,
    pub scheduling: bool,
    pub pending: bool,
}

impl TurnGate {
    fn busy(&self) -> bool {
        self.active || self.scheduling
    }
}

#[derive(Debug, Default)]
struct PendingCall {
    name: Option<String>,
    arguments: String,
}

pub struct TurnEngine<R: FormRecord> {
    config: EngineConfig,
    store: RecordStore<R>,
    outbound: Arc<dyn Outbound>,
    gate: TurnGate,
    calls: HashMap<String, PendingCall>,
    speech_started: Option<Instant>,
    /// A turn request owed once the current event has been handled.
    turn_deferred: bool,
    finalized_tx: Option<mpsc::Sender<R>>,
}

impl<R: FormRecord> TurnEngine<R> {
    pub fn new(store: RecordStore<R>, outbound: Arc<dyn Outbound>, config: EngineConfig) -> Self {
        Self {
            config,
            store,
            outbound,
            gate: TurnGate::default(),
            calls: HashMap::new(),
            speech_started: None,
            turn_deferred: false,
            finalized_tx: None,
        }
    }

    /// Finalized records are also pushed to `tx`, e.g. for persistence.
    pub fn with_finalized_sink(mut self, tx: mpsc::Sender<R>) -> Self {
        self.finalized_tx = Some(tx);
        self
    }

    pub fn gate(&self) -> TurnGate {
        self.gate
    }

    /// Number of tool calls still accumulating arguments.
    pub fn pending_calls(&self) -> usize {
        self.calls.len()
    }

    pub fn store(&self) -> &RecordStore<R> {
        &self.store
    }

    /// Single-consumer event loop. Each message, including any turn request it
    /// defers, is fully handled before the next one is pulled.
    pub async fn run<S>(mut self, mut messages: S)
    where
        S: Stream<Item = String> + Unpin,
    {
        info!("Turn engine started.");
        while let Some(raw) = messages.next().await {
            self.process(&raw, Instant::now());
        }
        info!(pending_calls = self.calls.len(), "Message stream ended; turn engine stopped.");
    }

    /// Handles one raw inbound message received at `now`, then runs the
    /// deferred turn continuation it scheduled, if any.
    pub fn process(&mut self, raw: &str, now: Instant) {
        self.handle_message(raw, now);
        if std::mem::take(&mut self.turn_deferred) {
            self.request_turn();
        }
    }

    fn handle_message(&mut self, raw: &str, now: Instant) {
        let event = match InboundEvent::parse(raw) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "Ignoring unparseable realtime message.");
                return;
            }
        };

        match event {
            InboundEvent::ResponseCreated => {
                self.gate.active = true;
                self.gate.scheduling = false;
            }
            InboundEvent::ResponseDone => {
                // Only `response.created` settles `scheduling`.
                self.gate.active = false;
                if self.gate.pending {
                    self.gate.pending = false;
                    self.turn_deferred = true;
                }
            }
            InboundEvent::SpeechStarted => self.speech_started = Some(now),
            InboundEvent::SpeechStopped => self.on_speech_stopped(now),
            InboundEvent::OutputItemAdded { item } => {
                if item.is_function_call() {
                    if let Some(call_id) = item.call_id {
                        debug!(%call_id, tool = ?item.name, "Tool call started.");
                        self.calls.insert(
                            call_id,
                            PendingCall {
                                name: item.name,
                                arguments: String::new(),
                            },
                        );
                    }
                }
            }
            InboundEvent::FunctionCallArgumentsDelta { call_id, delta } => {
                if let Some(call_id) = call_id {
                    self.calls
                        .entry(call_id)
                        .or_default()
                        .arguments
                        .push_str(&delta);
                }
            }
            InboundEvent::FunctionCallArgumentsDone {
                call_id,
                name,
                arguments,
            } => {
                if let Some(call_id) = call_id {
                    let inline = match arguments {
                        Some(Value::String(s)) => Some(s),
                        Some(object @ Value::Object(_)) => Some(object.to_string()),
                        _ => None,
                    };
                    self.complete_call(&call_id, name, inline);
                }
            }
            InboundEvent::TranscriptionCompleted { transcript } => {
                info!(%transcript, "User utterance transcribed.");
            }
            InboundEvent::Error { error } => {
                warn!(%error, "Realtime service reported an error.");
            }
            InboundEvent::Unknown => {}
        }
    }

    fn on_speech_stopped(&mut self, now: Instant) {
        if let Some(started) = self.speech_started {
            let spoken = now.saturating_duration_since(started);
            if spoken < self.config.min_speech {
                debug!(?spoken, "Ignoring short utterance.");
                return;
            }
        }
        if self.gate.busy() {
            self.gate.pending = true;
        } else {
            self.request_turn();
        }
    }

    fn complete_call(&mut self, call_id: &str, name: Option<String>, inline: Option<String>) {
        let accumulated = self.calls.remove(call_id).unwrap_or_default();
        let tool = accumulated.name.or(name).unwrap_or_default();
        let raw_args = inline
            .or_else(|| (!accumulated.arguments.is_empty()).then_some(accumulated.arguments))
            .unwrap_or_else(|| "{}".to_string());
        let args = serde_json::from_str::<Value>(&raw_args).unwrap_or_else(|e| {
            warn!(%call_id, %tool, error = %e, "Malformed tool arguments; using an empty object.");
            json!({})
        });

        self.dispatch(call_id, &tool, args);
        self.send(ClientEvent::tool_output(call_id, &json!({ "ok": true })));
        // Runs after this event is handled, so the ack always precedes the next turn.
        self.turn_deferred = true;
    }

    fn dispatch(&mut self, call_id: &str, tool: &str, args: Value) {
        match ToolInvocation::<R>::from_call(tool, args) {
            ToolInvocation::Upsert(upsert) => {
                let current = self.store.get();
                match current.with_path(&upsert.path, &upsert.value) {
                    Ok(next) => {
                        info!(%call_id, path = %upsert.path, value = %upsert.value, "Field recorded.");
                        self.store.replace(next);
                    }
                    Err(FieldError::UnknownPath(path)) => {
                        warn!(%call_id, %path, "Ignoring upsert for unknown field path.");
                    }
                    Err(e) => warn!(%call_id, error = %e, "Ignoring upsert that could not be coerced."),
                }
            }
            ToolInvocation::Finalize(record) => {
                info!(%call_id, complete = record.next_unset().is_none(), "Final payload received.");
                self.store.replace(record.clone());
                if let Some(tx) = &self.finalized_tx {
                    if let Err(e) = tx.try_send(record) {
                        error!(error = %e, "Failed to hand off finalized payload.");
                    }
                }
            }
            ToolInvocation::Malformed { tool, reason } => {
                warn!(%call_id, %tool, %reason, "Tool call arguments did not match the tool schema.");
            }
            ToolInvocation::Unrecognized(tool) => {
                warn!(%call_id, %tool, "Ignoring call to unrecognized tool.");
            }
        }
    }

    /// Asks the model for a turn targeting the next unanswered field, unless a
    /// turn is already in flight, in which case the request is remembered.
    pub fn request_turn(&mut self) {
        if self.gate.busy() {
            self.gate.pending = true;
            return;
        }
        self.gate.scheduling = true;

        let record = self.store.get();
        let target = record.next_unset();
        let question = record.next_question();
        debug!(?target, %question, "Requesting turn.");

        let instructions = format!(
            "Ask exactly ONE missing field in a short, friendly way: \"{question}\".\n\
             Use the tools to record any fields you extract. Do not speak about tools. \
             Only acknowledge if you recorded a field. Stay strictly on {}.",
            self.config.topic
        );
        self.send(ClientEvent::response_create(
            self.config.modalities.clone(),
            instructions,
        ));
    }

    fn send(&self, event: ClientEvent) {
        match event.to_text() {
            Ok(text) => self.outbound.send(text),
            Err(e) => error!(error = %e, "Failed to serialize client event."),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quote::{QuoteField, QuotePayload};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        sent: Mutex<Vec<Value>>,
    }

    impl Outbound for Recorder {
        fn send(&self, message: String) {
            let value = serde_json::from_str(&message).expect("engine sends JSON");
            self.sent.lock().unwrap().push(value);
        }
    }

    impl Recorder {
        fn sent(&self) -> Vec<Value> {
            self.sent.lock().unwrap().clone()
        }

        fn kinds(&self) -> Vec<String> {
            self.sent()
                .iter()
                .map(|m| m["type"].as_str().unwrap_or_default().to_string())
                .collect()
        }

        fn turn_requests(&self) -> usize {
            self.kinds().iter().filter(|k| *k == "response.create").count()
        }
    }

    fn engine() -> (TurnEngine<QuotePayload>, Arc<Recorder>, Instant) {
        let recorder = Arc::new(Recorder::default());
        let engine = TurnEngine::new(
            RecordStore::default(),
            recorder.clone(),
            EngineConfig::default(),
        );
        (engine, recorder, Instant::now())
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn speak(engine: &mut TurnEngine<QuotePayload>, at: Instant, length: Duration) {
        engine.process(r#"{"type":"input_audio_buffer.speech_started"}"#, at);
        engine.process(r#"{"type":"input_audio_buffer.speech_stopped"}"#, at + length);
    }

    fn done(call_id: &str, arguments: Option<&str>) -> String {
        let mut event = json!({ "type": "response.function_call_arguments.done", "call_id": call_id });
        if let Some(args) = arguments {
            event["arguments"] = json!(args);
        }
        event.to_string()
    }

    fn added(call_id: &str, name: &str) -> String {
        json!({
            "type": "response.output_item.added",
            "item": { "type": "function_call", "call_id": call_id, "name": name }
        })
        .to_string()
    }

    #[test]
    fn test_speech_stopped_requests_one_turn() {
        let (mut engine, out, t0) = engine();
        speak(&mut engine, t0, ms(500));

        assert_eq!(out.turn_requests(), 1);
        let gate = engine.gate();
        assert!(gate.scheduling && !gate.active && !gate.pending);
        let instructions = out.sent()[0]["response"]["instructions"].as_str().unwrap().to_string();
        assert!(instructions.contains("What's the car make?"));
    }

    #[test]
    fn test_short_utterance_is_noise() {
        let (mut engine, out, t0) = engine();
        speak(&mut engine, t0, ms(399));
        assert!(out.sent().is_empty());
        assert_eq!(engine.gate(), TurnGate::default());

        // Noise while a turn is in flight must not mark a pending turn either.
        speak(&mut engine, t0 + ms(1_000), ms(500));
        speak(&mut engine, t0 + ms(2_000), ms(100));
        assert_eq!(out.turn_requests(), 1);
        assert!(!engine.gate().pending);
    }

    #[test]
    fn test_speech_while_busy_marks_pending() {
        let (mut engine, out, t0) = engine();
        speak(&mut engine, t0, ms(600));
        engine.process(r#"{"type":"response.created"}"#, t0 + ms(700));
        speak(&mut engine, t0 + ms(800), ms(600));

        assert_eq!(out.turn_requests(), 1);
        assert!(engine.gate().pending);

        engine.process(r#"{"type":"response.done"}"#, t0 + ms(2_000));
        assert_eq!(out.turn_requests(), 2);
        let gate = engine.gate();
        assert!(gate.scheduling && !gate.pending && !gate.active);
    }

    #[test]
    fn test_never_two_turn_requests_without_completion() {
        let (mut engine, out, t0) = engine();
        let events = [
            r#"{"type":"input_audio_buffer.speech_stopped"}"#.to_string(),
            r#"{"type":"input_audio_buffer.speech_stopped"}"#.to_string(),
            added("c1", "payload_upsert"),
            done("c1", Some(r#"{"path":"vehicleDetails.make","value":"Kia"}"#)),
            r#"{"type":"response.created"}"#.to_string(),
            r#"{"type":"input_audio_buffer.speech_stopped"}"#.to_string(),
            done("c2", Some(r#"{"path":"vehicleDetails.model","value":"Soul"}"#)),
            r#"{"type":"response.done"}"#.to_string(),
            r#"{"type":"input_audio_buffer.speech_stopped"}"#.to_string(),
            r#"{"type":"response.created"}"#.to_string(),
            r#"{"type":"response.done"}"#.to_string(),
        ];

        let mut outstanding = 0usize;
        for (i, raw) in events.iter().enumerate() {
            let before = out.turn_requests();
            engine.process(raw, t0 + ms(1_000 * i as u64));
            let sent_now = out.turn_requests() - before;
            assert!(sent_now <= 1, "event {i} sent {sent_now} turn requests");
            if raw.contains("response.done") {
                outstanding = 0;
            }
            outstanding += sent_now;
            assert!(outstanding <= 1, "two turn requests outstanding after event {i}");
        }
    }

    #[test]
    fn test_stray_response_done_keeps_request_outstanding() {
        let (mut engine, out, t0) = engine();
        speak(&mut engine, t0, ms(500));
        assert!(engine.gate().scheduling);

        // Completion of an earlier response must not reopen the gate.
        engine.process(r#"{"type":"response.done"}"#, t0 + ms(600));
        assert!(engine.gate().scheduling);
        speak(&mut engine, t0 + ms(700), ms(500));
        assert_eq!(out.turn_requests(), 1);
        assert!(engine.gate().pending);

        engine.process(r#"{"type":"response.created"}"#, t0 + ms(1_300));
        engine.process(r#"{"type":"response.done"}"#, t0 + ms(2_000));
        assert_eq!(out.turn_requests(), 2);
        assert!(!engine.gate().pending);
    }

    #[test]
    fn test_each_completed_call_is_acknowledged_once() {
        let store = RecordStore::<QuotePayload>::default();
        let mut mock = MockOutbound::new();
        mock.expect_send()
            .withf(|m| m.contains("response.tool_output") && m.contains("call_7"))
            .times(1)
            .return_const(());
        mock.expect_send()
            .withf(|m| m.contains("response.create"))
            .times(1)
            .return_const(());

        let mut engine = TurnEngine::new(store, Arc::new(mock), EngineConfig::default());
        engine.process(&added("call_7", "payload_upsert"), Instant::now());
        engine.process(
            &done("call_7", Some(r#"{"path":"postalCode","value":"k1a 0b1"}"#)),
            Instant::now(),
        );
        assert_eq!(engine.store().get().postal_code.as_deref(), Some("K1A0B1"));
        assert_eq!(engine.pending_calls(), 0);
    }

    #[test]
    fn test_ack_precedes_deferred_turn() {
        let (mut engine, out, t0) = engine();
        engine.process(&added("c1", "payload_upsert"), t0);
        engine.process(
            &done("c1", Some(r#"{"path":"vehicleDetails.make","value":"Honda"}"#)),
            t0,
        );
        assert_eq!(out.kinds(), vec!["response.tool_output", "response.create"]);
        assert_eq!(out.sent()[0]["tool_output"]["tool_call_id"], "c1");
    }

    #[test]
    fn test_fragmented_arguments_match_inline_arguments() {
        let (mut fragmented, _, t0) = engine();
        fragmented.process(&added("c1", "payload_upsert"), t0);
        for delta in [r#"{"path":"vehicleDetails.year","#, r#""value":"#, "2019}"] {
            let event = json!({
                "type": "response.function_call_arguments.delta",
                "call_id": "c1",
                "delta": delta
            });
            fragmented.process(&event.to_string(), t0);
        }
        fragmented.process(&done("c1", None), t0);

        let (mut inline, _, t0) = engine();
        inline.process(&added("c1", "payload_upsert"), t0);
        inline.process(
            &done("c1", Some(r#"{"path":"vehicleDetails.year","value":2019}"#)),
            t0,
        );

        assert_eq!(fragmented.store().get().vehicle_details.year, Some(2019));
        assert_eq!(fragmented.store().get(), inline.store().get());
    }

    #[test]
    fn test_delta_for_unknown_call_creates_entry() {
        let (mut engine, _, t0) = engine();
        let event = json!({
            "type": "response.function_call_arguments.delta",
            "call_id": "ghost",
            "delta": "{"
        });
        engine.process(&event.to_string(), t0);
        assert_eq!(engine.pending_calls(), 1);
    }

    #[test]
    fn test_done_name_used_when_start_was_missed() {
        let (mut engine, _, t0) = engine();
        let event = json!({
            "type": "response.function_call_arguments.done",
            "call_id": "c3",
            "name": "payload_upsert",
            "arguments": r#"{"path":"vehicleDetails.model","value":"Civic"}"#
        });
        engine.process(&event.to_string(), t0);
        assert_eq!(engine.store().get().vehicle_details.model.as_deref(), Some("Civic"));
    }

    #[test]
    fn test_fragments_without_a_path_are_acknowledged_noops() {
        let (mut engine, out, t0) = engine();
        engine.process(&added("a", "payload_upsert"), t0);
        for delta in ["{\"a\":", "1}"] {
            let event = json!({
                "type": "response.function_call_arguments.delta",
                "call_id": "a",
                "delta": delta
            });
            engine.process(&event.to_string(), t0);
        }
        engine.process(&done("a", None), t0);
        // `{"a":1}` is valid JSON but not a valid upsert: nothing changes, ack still sent.
        assert_eq!(engine.store().get(), QuotePayload::default());
        assert_eq!(out.kinds()[0], "response.tool_output");
    }

    #[test]
    fn test_malformed_arguments_are_a_noop() {
        let (mut engine, out, t0) = engine();
        let mut seeded = QuotePayload::default();
        seeded.vehicle_details.make = Some("Ford".into());
        engine.store().replace(seeded.clone());

        engine.process(&added("bad", "payload_upsert"), t0);
        engine.process(&done("bad", Some(r#"{"path":"vehicleDetails.make","#)), t0);

        assert_eq!(engine.store().get(), seeded);
        assert_eq!(engine.pending_calls(), 0);
        assert_eq!(out.kinds(), vec!["response.tool_output", "response.create"]);
    }

    #[test]
    fn test_unknown_path_and_unknown_tool_are_acknowledged() {
        let (mut engine, out, t0) = engine();
        engine.process(&added("c1", "payload_upsert"), t0);
        engine.process(&done("c1", Some(r#"{"path":"driver.age","value":44}"#)), t0);
        engine.process(r#"{"type":"response.done"}"#, t0);
        engine.process(&added("c2", "lookup_vin"), t0);
        engine.process(&done("c2", Some(r#"{"vin":"123"}"#)), t0);

        assert_eq!(engine.store().get(), QuotePayload::default());
        let acks: Vec<_> = out
            .sent()
            .into_iter()
            .filter(|m| m["type"] == "response.tool_output")
            .map(|m| m["tool_output"]["tool_call_id"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(acks, vec!["c1", "c2"]);
    }

    #[test]
    fn test_year_update_leaves_other_fields_untouched() {
        let (mut engine, _, t0) = engine();
        let mut seeded = QuotePayload::default();
        seeded.vehicle_details.make = Some("Toyota".into());
        seeded.previous_claims.claim_at_fault = Some(false);
        engine.store().replace(seeded.clone());

        engine.process(&added("y", "payload_upsert"), t0);
        engine.process(&done("y", Some(r#"{"path":"vehicleDetails.year","value":2020}"#)), t0);

        let mut expected = seeded;
        expected.vehicle_details.year = Some(2020);
        assert_eq!(engine.store().get(), expected);
    }

    #[tokio::test]
    async fn test_finalize_replaces_record_and_notifies_sink() {
        let (tx, mut rx) = mpsc::channel(1);
        let recorder = Arc::new(Recorder::default());
        let mut engine = TurnEngine::<QuotePayload>::new(
            RecordStore::default(),
            recorder.clone(),
            EngineConfig::default(),
        )
        .with_finalized_sink(tx);

        let payload = json!({
            "payload": {
                "vehicleDetails": { "make": "Honda", "model": "Civic", "year": 2020 },
                "previousClaims": { "claimMadeInLast3Years": false, "claimAtFault": false },
                "postalCode": "A1B2C3"
            }
        });
        engine.process(&added("fin", "manager_ready"), Instant::now());
        engine.process(&done("fin", Some(&payload.to_string())), Instant::now());

        let stored = engine.store().get();
        assert!(stored.is_complete());
        assert_eq!(rx.recv().await, Some(stored));
        assert_eq!(recorder.kinds()[0], "response.tool_output");
    }

    #[test]
    fn test_errors_and_unknown_events_change_nothing() {
        let (mut engine, out, t0) = engine();
        engine.process(r#"{"type":"error","error":{"message":"boom"}}"#, t0);
        engine.process(r#"{"type":"session.created","session":{}}"#, t0);
        engine.process("{{{", t0);
        assert!(out.sent().is_empty());
        assert_eq!(engine.gate(), TurnGate::default());
    }

    #[test]
    fn test_conversation_scenario() {
        let (mut engine, out, t0) = engine();

        speak(&mut engine, t0, ms(500));
        assert_eq!(out.turn_requests(), 1);
        assert!(out.sent()[0]["response"]["instructions"]
            .as_str()
            .unwrap()
            .contains(QuotePayload::question(QuoteField::VehicleMake)));
        engine.process(r#"{"type":"response.created"}"#, t0 + ms(900));

        engine.process(&added("call_make", "payload_upsert"), t0 + ms(1_000));
        engine.process(
            &done("call_make", Some(r#"{"path":"vehicleDetails.make","value":"Honda"}"#)),
            t0 + ms(1_100),
        );
        assert_eq!(engine.store().get().vehicle_details.make.as_deref(), Some("Honda"));
        assert_eq!(out.kinds(), vec!["response.create", "response.tool_output"]);
        assert!(engine.gate().pending);

        engine.process(r#"{"type":"response.completed"}"#, t0 + ms(1_500));
        assert_eq!(out.turn_requests(), 2);
        let last = out.sent().last().cloned().unwrap();
        assert!(last["response"]["instructions"]
            .as_str()
            .unwrap()
            .contains(QuotePayload::question(QuoteField::VehicleModel)));
    }

    #[tokio::test]
    async fn test_run_processes_stream_in_order() {
        let recorder = Arc::new(Recorder::default());
        let store = RecordStore::<QuotePayload>::default();
        let engine = TurnEngine::new(store.clone(), recorder.clone(), EngineConfig::default());
        let messages = futures::stream::iter(vec![
            added("c1", "payload_upsert"),
            done("c1", Some(r#"{"path":"vehicleDetails.make","value":"Audi"}"#)),
            r#"{"type":"response.created"}"#.to_string(),
        ]);

        engine.run(messages).await;

        assert_eq!(store.get().vehicle_details.make.as_deref(), Some("Audi"));
        assert_eq!(recorder.kinds(), vec!["response.tool_output", "response.create"]);
    }
}
