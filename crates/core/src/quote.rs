//! Vehicle-insurance quote payload collected by the voice agent.

use crate::form::{
    FieldError, FormRecord, coerce_flag, coerce_integer, coerce_text, normalize_postal_code,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// The full quote document. Missing keys deserialize as unset leaves.
#[derive(Serialize, Deserialize, JsonSchema, Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase", default)]
pub struct QuotePayload {
    pub vehicle_details: VehicleDetails,
    pub previous_claims: PreviousClaims,
    pub postal_code: Option<String>,
}

#[derive(Serialize, Deserialize, JsonSchema, Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase", default)]
pub struct VehicleDetails {
    pub make: Option<String>,
    pub model: Option<String>,
    pub year: Option<i32>,
}

#[derive(Serialize, Deserialize, JsonSchema, Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase", default)]
pub struct PreviousClaims {
    #[serde(rename = "claimMadeInLast3Years")]
    pub claim_made_in_last_3_years: Option<bool>,
    pub claim_at_fault: Option<bool>,
}

/// Leaves of [`QuotePayload`], declared in ask-order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QuoteField {
    VehicleMake,
    VehicleModel,
    VehicleYear,
    ClaimInLast3Years,
    ClaimAtFault,
    PostalCode,
}

impl QuoteField {
    pub const ALL: [QuoteField; 6] = [
        QuoteField::VehicleMake,
        QuoteField::VehicleModel,
        QuoteField::VehicleYear,
        QuoteField::ClaimInLast3Years,
        QuoteField::ClaimAtFault,
        QuoteField::PostalCode,
    ];

    /// Dotted path used by the `payload_upsert` tool.
    pub fn path(self) -> &'static str {
        match self {
            QuoteField::VehicleMake => "vehicleDetails.make",
            QuoteField::VehicleModel => "vehicleDetails.model",
            QuoteField::VehicleYear => "vehicleDetails.year",
            QuoteField::ClaimInLast3Years => "previousClaims.claimMadeInLast3Years",
            QuoteField::ClaimAtFault => "previousClaims.claimAtFault",
            QuoteField::PostalCode => "postalCode",
        }
    }
}

impl fmt::Display for QuoteField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.path())
    }
}

impl QuotePayload {
    /// True once every leaf has an answer.
    pub fn is_complete(&self) -> bool {
        self.next_unset().is_none()
    }
}

impl FormRecord for QuotePayload {
    type Field = QuoteField;

    fn fields() -> &'static [QuoteField] {
        &QuoteField::ALL
    }

    fn field_for_path(path: &str) -> Option<QuoteField> {
        QuoteField::ALL.into_iter().find(|f| f.path() == path)
    }

    fn is_unset(&self, field: QuoteField) -> bool {
        let blank = |s: &Option<String>| s.as_deref().is_none_or(|s| s.trim().is_empty());
        match field {
            QuoteField::VehicleMake => blank(&self.vehicle_details.make),
            QuoteField::VehicleModel => blank(&self.vehicle_details.model),
            QuoteField::VehicleYear => self.vehicle_details.year.is_none(),
            QuoteField::ClaimInLast3Years => self.previous_claims.claim_made_in_last_3_years.is_none(),
            QuoteField::ClaimAtFault => self.previous_claims.claim_at_fault.is_none(),
            QuoteField::PostalCode => blank(&self.postal_code),
        }
    }

    fn set_field(&mut self, field: QuoteField, value: &Value) -> Result<(), FieldError> {
        let path = field.path();
        match field {
            QuoteField::VehicleMake => self.vehicle_details.make = coerce_text(path, value)?,
            QuoteField::VehicleModel => self.vehicle_details.model = coerce_text(path, value)?,
            QuoteField::VehicleYear => self.vehicle_details.year = coerce_integer(path, value)?,
            QuoteField::ClaimInLast3Years => {
                self.previous_claims.claim_made_in_last_3_years = coerce_flag(path, value)?
            }
            QuoteField::ClaimAtFault => {
                self.previous_claims.claim_at_fault = coerce_flag(path, value)?
            }
            QuoteField::PostalCode => self.postal_code = normalize_postal_code(path, value)?,
        }
        Ok(())
    }

    fn question(field: QuoteField) -> &'static str {
        match field {
            QuoteField::VehicleMake => "What's the car make?",
            QuoteField::VehicleModel => "And the model?",
            QuoteField::VehicleYear => "What year is it?",
            QuoteField::ClaimInLast3Years => "Any claims in the last 3 years?",
            QuoteField::ClaimAtFault => "Was the claim at fault?",
            QuoteField::PostalCode => "Lastly, what's your postal code?",
        }
    }

    fn completion_question() -> &'static str {
        "Everything looks complete. Should I lock this in?"
    }
}
