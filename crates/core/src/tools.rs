//! Tool definitions exposed to the realtime model and the rule that
//! classifies a completed tool call.

use crate::form::FormRecord;
use schemars::{JsonSchema, generate::SchemaSettings};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Records one extracted field.
pub const UPSERT_TOOL: &str = "payload_upsert";
/// Hands over the complete record at the end of the conversation.
pub const FINALIZE_TOOL: &str = "manager_ready";

/// Arguments of the field upsert tool.
#[derive(Serialize, Deserialize, JsonSchema, Debug, Clone, PartialEq)]
pub struct UpsertArgs {
    /// Dotted path of the field, e.g. `vehicleDetails.make`.
    pub path: String,
    /// Extracted value. `null` clears the field.
    #[serde(default)]
    pub value: Value,
}

/// Arguments of the finalize tool.
#[derive(Serialize, Deserialize, JsonSchema, Debug, Clone)]
pub struct FinalizeArgs<R> {
    /// The complete record, replacing whatever was collected so far.
    pub payload: R,
}

/// A tool as advertised to the model when the realtime session is configured.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// Builds the tool list for record type `R`.
pub fn tool_specs<R: FormRecord + JsonSchema>() -> Vec<ToolSpec> {
    let paths = R::fields()
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join(", ");
    vec![
        ToolSpec {
            name: UPSERT_TOOL.to_string(),
            description: format!(
                "Record one field the user just provided. Valid paths: {paths}."
            ),
            parameters: schema_value::<UpsertArgs>(),
        },
        ToolSpec {
            name: FINALIZE_TOOL.to_string(),
            description: "Submit the complete payload once every field is confirmed.".to_string(),
            parameters: schema_value::<FinalizeArgs<R>>(),
        },
    ]
}

/// Schemas are inlined; the realtime API does not resolve `$ref`.
fn schema_value<T: JsonSchema>() -> Value {
    let schema = SchemaSettings::draft07()
        .with(|s| s.inline_subschemas = true)
        .into_generator()
        .into_root_schema_for::<T>();
    serde_json::to_value(schema).unwrap_or_else(|_| Value::Object(Default::default()))
}

/// What a completed tool call asks the engine to do.
#[derive(Debug, Clone)]
pub enum ToolInvocation<R> {
    Upsert(UpsertArgs),
    Finalize(R),
    /// A known tool whose arguments did not match its schema.
    Malformed { tool: String, reason: String },
    Unrecognized(String),
}

impl<R: FormRecord> ToolInvocation<R> {
    pub fn from_call(name: &str, args: Value) -> Self {
        let malformed = |e: serde_json::Error| ToolInvocation::Malformed {
            tool: name.to_string(),
            reason: e.to_string(),
        };
        match name {
            UPSERT_TOOL => serde_json::from_value(args)
                .map(ToolInvocation::Upsert)
                .unwrap_or_else(malformed),
            FINALIZE_TOOL => serde_json::from_value::<FinalizeArgs<R>>(args)
                .map(|a| ToolInvocation::Finalize(a.payload))
                .unwrap_or_else(malformed),
            other => ToolInvocation::Unrecognized(other.to_string()),
        }
    }
}
