//! Payload schema validation for metric drafts.
//!
//! Every kind has a small fixed schema: required fields must be present with
//! the right JSON type, optional fields are type-checked when present and
//! filled with their default when absent. Fields outside the schema are
//! passed through untouched.

use serde_json::{json, Value};

use crate::{MetricKind, NewMetric, Payload};

/// Record-level keys that payloads may not redefine, since payload fields
/// are flattened next to them on the wire.
pub const RESERVED_FIELDS: [&str; 4] = ["id", "kind", "subjectId", "emittedAt"];

/// JSON type expected for a schema field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Number,
    Integer,
    String,
    Boolean,
}

impl FieldType {
    fn matches(self, value: &Value) -> bool {
        match self {
            Self::Number => value.is_number(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::String => value.is_string(),
            Self::Boolean => value.is_boolean(),
        }
    }

    fn label(self) -> &'static str {
        match self {
            Self::Number => "number",
            Self::Integer => "integer",
            Self::String => "string",
            Self::Boolean => "boolean",
        }
    }
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Errors produced when a draft fails schema validation.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("{kind} payload is missing required field `{field}`")]
    MissingField { kind: MetricKind, field: &'static str },

    #[error("{kind} payload field `{field}` must be a {expected}")]
    WrongType {
        kind: MetricKind,
        field: &'static str,
        expected: FieldType,
    },

    #[error("payload field `{0}` is reserved")]
    ReservedField(String),

    #[error("subjectId must be positive, got {0}")]
    InvalidSubject(i64),
}

struct FieldSpec {
    name: &'static str,
    ty: FieldType,
    required: bool,
    default: Option<fn() -> Value>,
}

const fn required(name: &'static str, ty: FieldType) -> FieldSpec {
    FieldSpec {
        name,
        ty,
        required: true,
        default: None,
    }
}

const fn optional(name: &'static str, ty: FieldType, default: Option<fn() -> Value>) -> FieldSpec {
    FieldSpec {
        name,
        ty,
        required: false,
        default,
    }
}

fn zero() -> Value {
    json!(0)
}

fn zero_f() -> Value {
    json!(0.0)
}

fn online() -> Value {
    json!("online")
}

fn pending() -> Value {
    json!("pending")
}

fn yes() -> Value {
    json!(true)
}

const STATS: &[FieldSpec] = &[
    required("hashrate", FieldType::Number),
    optional("sharesSubmitted", FieldType::Integer, Some(zero)),
    optional("sharesAccepted", FieldType::Integer, Some(zero)),
    optional("dailyEarnings", FieldType::Number, Some(zero_f)),
];

const HARDWARE: &[FieldSpec] = &[
    required("gpuName", FieldType::String),
    optional("temperature", FieldType::Integer, None),
    optional("powerUsage", FieldType::Integer, None),
    optional("fanSpeed", FieldType::Integer, None),
    optional("hashrate", FieldType::Number, None),
    optional("status", FieldType::String, Some(online)),
];

const SHARE: &[FieldSpec] = &[
    required("workerName", FieldType::String),
    required("difficulty", FieldType::Number),
    optional("accepted", FieldType::Boolean, Some(yes)),
];

const TRANSFER: &[FieldSpec] = &[
    required("toAddress", FieldType::String),
    required("amount", FieldType::Number),
    optional("fee", FieldType::Number, Some(zero_f)),
    optional("status", FieldType::String, Some(pending)),
];

fn fields_for(kind: MetricKind) -> &'static [FieldSpec] {
    match kind {
        MetricKind::Stats => STATS,
        MetricKind::Hardware => HARDWARE,
        MetricKind::Share => SHARE,
        MetricKind::Transfer => TRANSFER,
    }
}

/// Validates a draft and returns its payload with defaults filled in.
///
/// # Errors
///
/// Returns the first [`ValidationError`] encountered. Reserved keys are
/// checked before schema fields.
pub fn validate_payload(draft: &NewMetric) -> Result<Payload, ValidationError> {
    if draft.subject_id <= 0 {
        return Err(ValidationError::InvalidSubject(draft.subject_id));
    }

    if let Some(key) = RESERVED_FIELDS
        .iter()
        .find(|key| draft.payload.contains_key(**key))
    {
        return Err(ValidationError::ReservedField((*key).to_string()));
    }

    let mut payload = draft.payload.clone();
    for def in fields_for(draft.kind) {
        match payload.get(def.name) {
            // Explicit nulls on optional fields are treated as absent.
            Some(Value::Null) if !def.required => {
                payload.remove(def.name);
                if let Some(default) = def.default {
                    payload.insert(def.name.to_string(), default());
                }
            }
            Some(value) => {
                if !def.ty.matches(value) {
                    return Err(ValidationError::WrongType {
                        kind: draft.kind,
                        field: def.name,
                        expected: def.ty,
                    });
                }
            }
            None if def.required => {
                return Err(ValidationError::MissingField {
                    kind: draft.kind,
                    field: def.name,
                });
            }
            None => {
                if let Some(default) = def.default {
                    payload.insert(def.name.to_string(), default());
                }
            }
        }
    }

    Ok(payload)
}
