//! Realtime protocol messages consumed and produced by the turn engine.
//!
//! The wire schema belongs to the remote realtime API. Only the kinds the
//! engine acts on are modelled; anything else parses as [`InboundEvent::Unknown`]
//! so new server events never break the session.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Server events recognized by the engine.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum InboundEvent {
    #[serde(rename = "response.created")]
    ResponseCreated,
    #[serde(rename = "response.done", alias = "response.completed")]
    ResponseDone,
    #[serde(rename = "input_audio_buffer.speech_started")]
    SpeechStarted,
    #[serde(rename = "input_audio_buffer.speech_stopped")]
    SpeechStopped,
    #[serde(rename = "response.output_item.added")]
    OutputItemAdded {
        #[serde(default)]
        item: OutputItem,
    },
    #[serde(
        rename = "response.function_call_arguments.delta",
        alias = "response.function_call.arguments.delta"
    )]
    FunctionCallArgumentsDelta {
        call_id: Option<String>,
        #[serde(default)]
        delta: String,
    },
    #[serde(
        rename = "response.function_call_arguments.done",
        alias = "response.function_call.arguments.done"
    )]
    FunctionCallArgumentsDone {
        call_id: Option<String>,
        name: Option<String>,
        /// Inline arguments: a JSON-encoded string, or an already decoded object.
        arguments: Option<Value>,
    },
    #[serde(rename = "conversation.item.input_audio_transcription.completed")]
    TranscriptionCompleted {
        #[serde(default)]
        transcript: String,
    },
    #[serde(rename = "error")]
    Error {
        #[serde(default)]
        error: Value,
    },
    #[serde(other)]
    Unknown,
}

impl InboundEvent {
    pub fn parse(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

/// Item announced by `response.output_item.added`.
#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
pub struct OutputItem {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub call_id: Option<String>,
    pub name: Option<String>,
}

impl OutputItem {
    pub fn is_function_call(&self) -> bool {
        self.kind.as_deref() == Some("function_call")
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Modality {
    Audio,
    Text,
}

/// Client events sent back over the realtime channel.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum ClientEvent {
    /// Asks the model to take a turn.
    #[serde(rename = "response.create")]
    ResponseCreate { response: ResponseRequest },
    /// Acknowledges a completed tool call.
    #[serde(rename = "response.tool_output")]
    ToolOutput { tool_output: ToolOutput },
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ResponseRequest {
    pub modalities: Vec<Modality>,
    /// `auto` continues the default conversation.
    pub conversation: String,
    pub tool_choice: String,
    pub instructions: String,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ToolOutput {
    pub tool_call_id: String,
    /// Serialized JSON result.
    pub output: String,
}

impl ClientEvent {
    pub fn response_create(modalities: Vec<Modality>, instructions: String) -> Self {
        ClientEvent::ResponseCreate {
            response: ResponseRequest {
                modalities,
                conversation: "auto".to_string(),
                tool_choice: "auto".to_string(),
                instructions,
            },
        }
    }

    pub fn tool_output(call_id: &str, output: &Value) -> Self {
        ClientEvent::ToolOutput {
            tool_output: ToolOutput {
                tool_call_id: call_id.to_string(),
                output: output.to_string(),
            },
        }
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
