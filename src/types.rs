//! Core data model for the AgentFleet incident pipeline.
//!
//! These types are the payloads that move between stages inside envelopes
//! and the records persisted by the job store. Every type serializes to the
//! snake_case JSON shape the inter-stage protocol expects.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Incident severity classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SeverityLevel {
    #[serde(rename = "LOW")]
    Low,
    #[serde(rename = "MEDIUM")]
    Medium,
    #[serde(rename = "HIGH")]
    High,
    #[serde(rename = "CRITICAL")]
    Critical,
}

impl SeverityLevel {
    /// Whether this severity merits job tracking (historically HIGH/CRITICAL only).
    pub fn merits_tracking(self) -> bool {
        matches!(self, SeverityLevel::High | SeverityLevel::Critical)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SeverityLevel::Low => "LOW",
            SeverityLevel::Medium => "MEDIUM",
            SeverityLevel::High => "HIGH",
            SeverityLevel::Critical => "CRITICAL",
        }
    }
}

impl std::fmt::Display for SeverityLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Job processing status. Transitions are monotonic:
/// PENDING -> PROCESSING -> COMPLETED | FAILED, with no exit from a
/// terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobStatus {
    #[serde(rename = "PENDING")]
    Pending,
    #[serde(rename = "PROCESSING")]
    Processing,
    #[serde(rename = "COMPLETED")]
    Completed,
    #[serde(rename = "FAILED")]
    Failed,
}

impl JobStatus {
    /// Lifecycle rank used to enforce monotonic transitions.
    pub fn rank(self) -> u8 {
        match self {
            JobStatus::Pending => 0,
            JobStatus::Processing => 1,
            JobStatus::Completed | JobStatus::Failed => 2,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Processing => "PROCESSING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Incident lifecycle status after dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IncidentStatus {
    #[serde(rename = "DISPATCHED")]
    Dispatched,
    #[serde(rename = "ACKNOWLEDGED")]
    Acknowledged,
    #[serde(rename = "RESOLVED")]
    Resolved,
}

/// Raw event from an external source before normalization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawEvent {
    pub source: String,
    pub timestamp: DateTime<Utc>,
    pub content: String,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

/// Normalized event with extracted entities and a standardized shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedEvent {
    pub event_id: String,
    pub source: String,
    pub timestamp: DateTime<Utc>,
    pub content: String,
    #[serde(default)]
    pub entities: Vec<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default = "default_event_type")]
    pub event_type: String,
}

fn default_event_type() -> String {
    "unknown".to_string()
}

/// A verifiable claim extracted from event content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claim {
    pub text: String,
    pub source: String,
}

/// Result of verifying a single claim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationResult {
    pub claim: Claim,
    pub verified: bool,
    pub confidence: f64,
    #[serde(default)]
    pub sources: Vec<String>,
}

/// Event with verification results and an overall reliability score.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifiedEvent {
    pub event_id: String,
    pub original_event: NormalizedEvent,
    pub reliability_score: f64,
    #[serde(default)]
    pub verified_claims: Vec<VerificationResult>,
    pub verification_timestamp: DateTime<Utc>,
}

/// Concise incident summary with key facts.
///
/// The summarizer is the first stage that materializes the incident concept,
/// so `incident_id` is assigned here and never changes downstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncidentBrief {
    pub incident_id: String,
    pub summary: String,
    #[serde(default)]
    pub key_facts: Vec<String>,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub affected_entities: Vec<String>,
    #[serde(default)]
    pub similar_incidents: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// Incident with severity classification and priority assignment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriagedIncident {
    pub incident_id: String,
    pub brief: IncidentBrief,
    pub severity: SeverityLevel,
    /// Priority in [0, 1]; drives dashboard ordering.
    pub priority_score: f64,
    /// Empty when the severity did not merit job tracking.
    #[serde(default)]
    pub job_id: String,
    #[serde(default)]
    pub reasoning: String,
    pub triaged_at: DateTime<Utc>,
}

/// Recommended response action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    pub action: String,
    pub responsible: String,
    pub timeline: String,
}

/// Fully processed incident with recommended actions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchedIncident {
    pub incident_id: String,
    pub triaged_incident: TriagedIncident,
    #[serde(default)]
    pub recommended_actions: Vec<Action>,
    #[serde(default)]
    pub communication_template: String,
    pub status: IncidentStatus,
    pub dispatched_at: DateTime<Utc>,
}

/// A trackable unit of pipeline work, distinct from the incident it refers to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub job_id: String,
    pub incident_id: String,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Present only once the job reaches a terminal state.
    #[serde(default)]
    pub result: Option<Value>,
}

/// Durable incident record accumulated across stages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncidentRecord {
    pub incident_id: String,
    pub summary: String,
    pub severity: SeverityLevel,
    pub priority_score: f64,
    pub status: IncidentStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Superset snapshot of all stage outputs accumulated so far.
    pub full_data: Value,
}
