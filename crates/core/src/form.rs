//! Typed Form Records
//!
//! A form record is a document of independently nullable leaves that the
//! realtime model fills one field at a time through tool calls. The engine only
//! ever sees a record through the [`FormRecord`] trait, so any typed payload can
//! be collected with the same turn/tool protocol.

use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use std::fmt;

/// Reasons a single-field update could not be applied.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FieldError {
    /// The tool call addressed a path the record does not declare.
    #[error("unknown field path '{0}'")]
    UnknownPath(String),
    /// The value cannot be represented in the leaf's type.
    #[error("value {value} cannot be stored in '{path}'")]
    Coercion { path: String, value: Value },
}

/// A structured record collected field-by-field.
///
/// Every leaf is independently nullable; "unset" must stay observable and is
/// never conflated with a falsy value such as `false` or `0`.
pub trait FormRecord:
    Clone + Default + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Identifies one leaf of the record.
    type Field: Copy + Eq + fmt::Debug + fmt::Display + Send + Sync + 'static;

    /// All leaves in the order they should be asked for.
    fn fields() -> &'static [Self::Field];

    /// Resolves a dotted path (e.g. `vehicleDetails.make`) to a leaf.
    fn field_for_path(path: &str) -> Option<Self::Field>;

    /// Whether the leaf still needs an answer.
    fn is_unset(&self, field: Self::Field) -> bool;

    /// Writes one leaf, applying the leaf's coercion rules.
    fn set_field(&mut self, field: Self::Field, value: &Value) -> Result<(), FieldError>;

    /// The single question that targets `field`.
    fn question(field: Self::Field) -> &'static str;

    /// Asked once every leaf has an answer.
    fn completion_question() -> &'static str;

    /// First unset leaf in declared order.
    fn next_unset(&self) -> Option<Self::Field> {
        Self::fields().iter().copied().find(|f| self.is_unset(*f))
    }

    fn next_question(&self) -> &'static str {
        self.next_unset()
            .map(Self::question)
            .unwrap_or_else(Self::completion_question)
    }

    /// Returns a copy of `self` with exactly one leaf replaced.
    ///
    /// The receiver is never touched, so observers holding the previous
    /// snapshot cannot see a half-applied update.
    fn with_path(&self, path: &str, value: &Value) -> Result<Self, FieldError> {
        let field =
            Self::field_for_path(path).ok_or_else(|| FieldError::UnknownPath(path.to_string()))?;
        let mut next = self.clone();
        next.set_field(field, value)?;
        Ok(next)
    }
}

fn coercion(path: &str, value: &Value) -> FieldError {
    FieldError::Coercion {
        path: path.to_string(),
        value: value.clone(),
    }
}

/// Free text. Blank strings are stored as unset.
pub fn coerce_text(path: &str, value: &Value) -> Result<Option<String>, FieldError> {
    match value {
        Value::Null => Ok(None),
        Value::String(s) => {
            let trimmed = s.trim();
            Ok((!trimmed.is_empty()).then(|| trimmed.to_string()))
        }
        Value::Number(n) => Ok(Some(n.to_string())),
        Value::Bool(b) => Ok(Some(b.to_string())),
        Value::Array(_) | Value::Object(_) => Err(coercion(path, value)),
    }
}

/// Whole numbers, accepting integral floats and numeric strings.
pub fn coerce_integer(path: &str, value: &Value) -> Result<Option<i32>, FieldError> {
    let parsed = match value {
        Value::Null => return Ok(None),
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<i64>().ok().or_else(|| {
                s.parse::<f64>()
                    .ok()
                    .filter(|f| f.is_finite() && f.fract() == 0.0)
                    .map(|f| f as i64)
            })
        }
        _ => None,
    };
    parsed
        .and_then(|n| i32::try_from(n).ok())
        .map(Some)
        .ok_or_else(|| coercion(path, value))
}

/// Yes/no answers. Spoken variants (`yes`, `no`, ...) are accepted alongside
/// JSON booleans and numbers.
pub fn coerce_flag(path: &str, value: &Value) -> Result<Option<bool>, FieldError> {
    match value {
        Value::Null => Ok(None),
        Value::Bool(b) => Ok(Some(*b)),
        Value::Number(n) => n
            .as_f64()
            .map(|f| Some(f != 0.0))
            .ok_or_else(|| coercion(path, value)),
        Value::String(s) => match s.trim().to_lowercase().as_str() {
            "true" | "yes" | "y" | "1" => Ok(Some(true)),
            "false" | "no" | "n" | "0" => Ok(Some(false)),
            _ => Err(coercion(path, value)),
        },
        _ => Err(coercion(path, value)),
    }
}

/// Postal codes: every whitespace character removed, letters uppercased.
pub fn normalize_postal_code(path: &str, value: &Value) -> Result<Option<String>, FieldError> {
    let raw = match value {
        Value::Null => return Ok(None),
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        _ => return Err(coercion(path, value)),
    };
    let normalized: String = raw
        .chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(char::to_uppercase)
        .collect();
    Ok((!normalized.is_empty()).then_some(normalized))
}
