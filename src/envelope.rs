//! Inter-stage message envelope protocol.
//!
//! Every message exchanged between pipeline stages is wrapped in an
//! [`Envelope`]: a schema-tagged payload plus session correlation metadata.
//! Because each stage is independently deployable, this protocol (not shared
//! code) is the only contract between them — a stage must refuse any schema
//! it was not built to understand before ever touching `payload.data`.
//!
//! Wire shape (snake_case JSON):
//!
//! ```json
//! {
//!   "schema": "event_v1",
//!   "session_id": "7c0e…",
//!   "timestamp": "2026-08-30T12:00:00Z",
//!   "source_stage": "ingest",
//!   "payload": { "type": "event", "data": { … } },
//!   "metadata": {}
//! }
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

/// Known envelope schema identifiers.
///
/// The schema uniquely determines the shape of `payload.data` and the
/// payload type that must accompany it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeSchema {
    /// Control/error envelope with no stage-specific data contract.
    McpEnvelopeV1,
    EventV1,
    VerifiedEventV1,
    IncidentBriefV1,
    TriagedIncidentV1,
    DispatchV1,
}

impl EnvelopeSchema {
    pub fn as_str(self) -> &'static str {
        match self {
            EnvelopeSchema::McpEnvelopeV1 => "mcp_envelope_v1",
            EnvelopeSchema::EventV1 => "event_v1",
            EnvelopeSchema::VerifiedEventV1 => "verified_event_v1",
            EnvelopeSchema::IncidentBriefV1 => "incident_brief_v1",
            EnvelopeSchema::TriagedIncidentV1 => "triaged_incident_v1",
            EnvelopeSchema::DispatchV1 => "dispatch_v1",
        }
    }

    /// The payload type this schema pins.
    pub fn expected_payload_type(self) -> PayloadType {
        match self {
            EnvelopeSchema::McpEnvelopeV1 => PayloadType::Error,
            EnvelopeSchema::EventV1 | EnvelopeSchema::VerifiedEventV1 => PayloadType::Event,
            EnvelopeSchema::IncidentBriefV1 => PayloadType::Incident,
            EnvelopeSchema::TriagedIncidentV1 => PayloadType::Triage,
            EnvelopeSchema::DispatchV1 => PayloadType::Dispatch,
        }
    }

    /// Fields that must be present (and non-null) in `payload.data`.
    pub fn required_fields(self) -> &'static [&'static str] {
        match self {
            EnvelopeSchema::McpEnvelopeV1 => &["error_message"],
            EnvelopeSchema::EventV1 => &["source", "content", "timestamp"],
            EnvelopeSchema::VerifiedEventV1 => {
                &["event_id", "original_event", "reliability_score"]
            }
            EnvelopeSchema::IncidentBriefV1 => &["incident_id", "summary"],
            EnvelopeSchema::TriagedIncidentV1 => {
                &["incident_id", "severity", "priority_score", "job_id"]
            }
            EnvelopeSchema::DispatchV1 => &["incident_id", "status", "recommended_actions"],
        }
    }
}

impl std::fmt::Display for EnvelopeSchema {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload kinds carried by envelopes. Matched exhaustively by stages;
/// an unrecognized kind is a validation error, never silently ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadType {
    Event,
    Incident,
    Triage,
    Dispatch,
    Error,
}

/// Tagged payload union: `type` enumerates known kinds, `data` is
/// schema-specific structured content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payload {
    #[serde(rename = "type")]
    pub kind: PayloadType,
    pub data: Value,
}

/// The unit of inter-stage communication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub schema: EnvelopeSchema,
    /// Correlation identifier, stable across one incident's whole lifecycle.
    /// Assigned at first ingestion (an omitted or empty value is filled in
    /// by the ingest stage), never reassigned downstream.
    #[serde(default)]
    pub session_id: String,
    /// Creation time of this envelope, not of the underlying event.
    pub timestamp: DateTime<Utc>,
    /// Identifier of the stage that produced this envelope.
    pub source_stage: String,
    pub payload: Payload,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

/// Envelope validation failures. Rejected synchronously, never retried.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("unrecognized schema: {0}")]
    UnknownSchema(String),
    #[error("schema mismatch: expected {expected}, got {actual}")]
    SchemaMismatch {
        expected: EnvelopeSchema,
        actual: EnvelopeSchema,
    },
    #[error("payload type {actual:?} does not match schema {schema}")]
    PayloadTypeMismatch {
        schema: EnvelopeSchema,
        actual: PayloadType,
    },
    #[error("malformed payload: missing or null required field '{field}'")]
    MalformedPayload { field: &'static str },
    #[error("payload data must be a JSON object")]
    PayloadNotObject,
    #[error("missing session_id")]
    MissingSessionId,
    #[error("missing source_stage")]
    MissingSourceStage,
    #[error("invalid envelope JSON: {0}")]
    Malformed(String),
}

/// A validated view over an envelope whose schema and payload shape have
/// been checked against the expected contract.
#[derive(Debug, Clone)]
pub struct ValidatedEnvelope {
    envelope: Envelope,
}

impl ValidatedEnvelope {
    pub fn schema(&self) -> EnvelopeSchema {
        self.envelope.schema
    }

    pub fn session_id(&self) -> &str {
        &self.envelope.session_id
    }

    pub fn source_stage(&self) -> &str {
        &self.envelope.source_stage
    }

    /// Schema-checked payload data object.
    pub fn data(&self) -> &Value {
        &self.envelope.payload.data
    }

    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    /// Deserialize `payload.data` into the concrete record the schema pins.
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> Result<T, ValidationError> {
        serde_json::from_value(self.envelope.payload.data.clone())
            .map_err(|e| ValidationError::Malformed(e.to_string()))
    }
}

/// Validate an inbound envelope against the schema this stage accepts.
///
/// Order matters: the schema tag is checked before any field of
/// `payload.data` is read, so a stage never misinterprets a payload shape
/// it was not built for.
pub fn validate(
    envelope: Envelope,
    expected: EnvelopeSchema,
) -> Result<ValidatedEnvelope, ValidationError> {
    if envelope.schema != expected {
        return Err(ValidationError::SchemaMismatch {
            expected,
            actual: envelope.schema,
        });
    }

    if envelope.session_id.trim().is_empty() {
        return Err(ValidationError::MissingSessionId);
    }
    if envelope.source_stage.trim().is_empty() {
        return Err(ValidationError::MissingSourceStage);
    }

    if envelope.payload.kind != expected.expected_payload_type() {
        return Err(ValidationError::PayloadTypeMismatch {
            schema: expected,
            actual: envelope.payload.kind,
        });
    }

    let data = envelope
        .payload
        .data
        .as_object()
        .ok_or(ValidationError::PayloadNotObject)?;

    for field in expected.required_fields() {
        match data.get(*field) {
            None | Some(Value::Null) => {
                return Err(ValidationError::MalformedPayload { field });
            }
            Some(_) => {}
        }
    }

    Ok(ValidatedEnvelope { envelope })
}

/// Parse raw JSON into an envelope, mapping unknown schema tags to
/// [`ValidationError::UnknownSchema`] rather than a generic parse failure.
pub fn parse(raw: Value) -> Result<Envelope, ValidationError> {
    if let Some(schema) = raw.get("schema").and_then(Value::as_str) {
        if serde_json::from_value::<EnvelopeSchema>(Value::String(schema.to_string())).is_err() {
            return Err(ValidationError::UnknownSchema(schema.to_string()));
        }
    }
    serde_json::from_value(raw).map_err(|e| ValidationError::Malformed(e.to_string()))
}

/// Produce the next-stage envelope: preserves `session_id` and `metadata`,
/// stamps a fresh `timestamp` and the new `source_stage`.
pub fn derive_next(
    envelope: &Envelope,
    schema: EnvelopeSchema,
    payload_data: Value,
    source_stage: &str,
) -> Envelope {
    Envelope {
        schema,
        session_id: envelope.session_id.clone(),
        timestamp: Utc::now(),
        source_stage: source_stage.to_string(),
        payload: Payload {
            kind: schema.expected_payload_type(),
            data: payload_data,
        },
        metadata: envelope.metadata.clone(),
    }
}

/// Create a fresh envelope, generating a session id when none is supplied.
/// Used by ingest (and tests) to open a new incident lifecycle.
pub fn create(
    schema: EnvelopeSchema,
    source_stage: &str,
    payload_data: Value,
    session_id: Option<String>,
) -> Envelope {
    Envelope {
        schema,
        session_id: session_id.unwrap_or_else(|| Uuid::new_v4().to_string()),
        timestamp: Utc::now(),
        source_stage: source_stage.to_string(),
        payload: Payload {
            kind: schema.expected_payload_type(),
            data: payload_data,
        },
        metadata: HashMap::new(),
    }
}

/// Build an error envelope for reporting a failure back to the caller.
pub fn error_envelope(source_stage: &str, session_id: &str, message: &str) -> Envelope {
    Envelope {
        schema: EnvelopeSchema::McpEnvelopeV1,
        session_id: session_id.to_string(),
        timestamp: Utc::now(),
        source_stage: source_stage.to_string(),
        payload: Payload {
            kind: PayloadType::Error,
            data: serde_json::json!({ "error_message": message }),
        },
        metadata: HashMap::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event_envelope() -> Envelope {
        create(
            EnvelopeSchema::EventV1,
            "ingest",
            json!({
                "source": "sensor",
                "content": "River gauge above flood stage",
                "timestamp": "2026-08-30T12:00:00Z"
            }),
            Some("s1".to_string()),
        )
    }

    #[test]
    fn test_validate_accepts_well_formed_event() {
        let validated = validate(event_envelope(), EnvelopeSchema::EventV1).unwrap();
        assert_eq!(validated.session_id(), "s1");
        assert_eq!(validated.schema(), EnvelopeSchema::EventV1);
    }

    #[test]
    fn test_validate_rejects_schema_mismatch() {
        let err = validate(event_envelope(), EnvelopeSchema::TriagedIncidentV1).unwrap_err();
        assert!(matches!(err, ValidationError::SchemaMismatch { .. }));
    }

    #[test]
    fn test_validate_rejects_each_missing_required_field() {
        for field in EnvelopeSchema::EventV1.required_fields() {
            let mut env = event_envelope();
            env.payload
                .data
                .as_object_mut()
                .unwrap()
                .remove(*field);
            let err = validate(env, EnvelopeSchema::EventV1).unwrap_err();
            match err {
                ValidationError::MalformedPayload { field: f } => assert_eq!(f, *field),
                other => panic!("expected MalformedPayload, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_validate_rejects_null_required_field() {
        let mut env = event_envelope();
        env.payload.data["content"] = Value::Null;
        let err = validate(env, EnvelopeSchema::EventV1).unwrap_err();
        assert!(matches!(
            err,
            ValidationError::MalformedPayload { field: "content" }
        ));
    }

    #[test]
    fn test_validate_rejects_payload_type_mismatch() {
        let mut env = event_envelope();
        env.payload.kind = PayloadType::Dispatch;
        let err = validate(env, EnvelopeSchema::EventV1).unwrap_err();
        assert!(matches!(err, ValidationError::PayloadTypeMismatch { .. }));
    }

    #[test]
    fn test_validate_rejects_empty_session() {
        let mut env = event_envelope();
        env.session_id = "  ".to_string();
        let err = validate(env, EnvelopeSchema::EventV1).unwrap_err();
        assert!(matches!(err, ValidationError::MissingSessionId));
    }

    #[test]
    fn test_parse_refuses_unknown_schema_before_reading_data() {
        let raw = json!({
            "schema": "event_v9",
            "session_id": "s1",
            "timestamp": "2026-08-30T12:00:00Z",
            "source_stage": "ingest",
            "payload": { "type": "event", "data": {} }
        });
        let err = parse(raw).unwrap_err();
        match err {
            ValidationError::UnknownSchema(s) => assert_eq!(s, "event_v9"),
            other => panic!("expected UnknownSchema, got {other:?}"),
        }
    }

    #[test]
    fn test_derive_next_preserves_session_id() {
        let source = event_envelope();
        let next = derive_next(
            &source,
            EnvelopeSchema::VerifiedEventV1,
            json!({"event_id": "e1", "original_event": {}, "reliability_score": 0.8}),
            "verifier",
        );
        assert_eq!(next.session_id, source.session_id);
        assert_eq!(next.source_stage, "verifier");
        assert_eq!(next.schema, EnvelopeSchema::VerifiedEventV1);
        assert_eq!(next.payload.kind, PayloadType::Event);
        assert!(next.timestamp >= source.timestamp);
    }

    #[test]
    fn test_create_assigns_session_when_absent() {
        let env = create(EnvelopeSchema::EventV1, "ingest", json!({}), None);
        assert!(!env.session_id.is_empty());
    }

    #[test]
    fn test_parse_tolerates_omitted_session_id() {
        // First ingestion may arrive without a session; the field parses as
        // empty and the ingest stage assigns one before validation.
        let raw = json!({
            "schema": "event_v1",
            "timestamp": "2026-08-30T12:00:00Z",
            "source_stage": "field-reporter",
            "payload": { "type": "event", "data": {
                "source": "sensor",
                "content": "x",
                "timestamp": "2026-08-30T12:00:00Z"
            }}
        });
        let env = parse(raw).unwrap();
        assert!(env.session_id.is_empty());
        // Every stage other than ingest still refuses it.
        let err = validate(env, EnvelopeSchema::EventV1).unwrap_err();
        assert!(matches!(err, ValidationError::MissingSessionId));
    }

    #[test]
    fn test_error_envelope_validates_as_control_schema() {
        let env = error_envelope("triage", "s1", "downstream refused payload");
        let validated = validate(env, EnvelopeSchema::McpEnvelopeV1).unwrap();
        assert_eq!(validated.session_id(), "s1");
        assert_eq!(
            validated.data()["error_message"],
            "downstream refused payload"
        );
    }

    #[test]
    fn test_wire_roundtrip_is_snake_case() {
        let env = event_envelope();
        let raw = serde_json::to_value(&env).unwrap();
        assert_eq!(raw["schema"], "event_v1");
        assert_eq!(raw["payload"]["type"], "event");
        assert_eq!(raw["source_stage"], "ingest");
        let back = parse(raw).unwrap();
        assert_eq!(back.schema, EnvelopeSchema::EventV1);
    }
}
