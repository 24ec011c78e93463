//! Per-stage processing logic.
//!
//! Each stage implements [`StageLogic`]: take a validated inbound envelope,
//! do the stage's transformation, persist what the stage owns, and hand back
//! the payload data for the outbound envelope. The logic is deterministic —
//! keyword heuristics rather than model calls — so the pipeline runs
//! self-contained and its tests are stable.

use super::{StageContext, StageError};
use crate::envelope::ValidatedEnvelope;
use crate::types::{
    Action, Claim, DispatchedIncident, IncidentBrief, IncidentRecord, IncidentStatus,
    NormalizedEvent, RawEvent, SeverityLevel, TriagedIncident, VerificationResult, VerifiedEvent,
};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use tracing::{debug, warn};
use uuid::Uuid;

/// Output of one stage's processing step.
#[derive(Debug)]
pub struct StageOutput {
    /// Payload data for the outbound envelope (terminal stages still return
    /// this; it becomes the synchronous response body).
    pub data: Value,
    /// Job touched during processing, if any. A later forwarding failure
    /// marks this job FAILED.
    pub job_id: Option<String>,
}

impl StageOutput {
    fn new(data: Value) -> Self {
        Self { data, job_id: None }
    }
}

/// The transformation a stage applies to each validated envelope.
#[async_trait]
pub trait StageLogic: Send + Sync {
    async fn process(
        &self,
        ctx: &StageContext,
        input: &ValidatedEnvelope,
    ) -> Result<StageOutput, StageError>;
}

// ============================================================================
// Ingest — normalize raw events
// ============================================================================

pub struct IngestLogic;

#[async_trait]
impl StageLogic for IngestLogic {
    async fn process(
        &self,
        _ctx: &StageContext,
        input: &ValidatedEnvelope,
    ) -> Result<StageOutput, StageError> {
        let raw: RawEvent = input.decode()?;
        let normalized = NormalizedEvent {
            event_id: Uuid::new_v4().to_string(),
            entities: extract_entities(&raw.content),
            location: extract_location(&raw.content),
            event_type: classify_event_type(&raw.content),
            source: raw.source,
            timestamp: raw.timestamp,
            content: raw.content,
        };
        debug!(
            event_id = %normalized.event_id,
            event_type = %normalized.event_type,
            "event normalized"
        );
        Ok(StageOutput::new(serde_json::to_value(&normalized)?))
    }
}

/// Capitalized tokens of length > 3, deduplicated in order of appearance.
fn extract_entities(content: &str) -> Vec<String> {
    let mut entities = Vec::new();
    for token in content.split(|c: char| !c.is_alphanumeric()) {
        if token.len() > 3
            && token.chars().next().is_some_and(char::is_uppercase)
            && !entities.iter().any(|e| e == token)
        {
            entities.push(token.to_string());
        }
    }
    entities
}

/// Best-effort location: capitalized phrase following a locative preposition.
fn extract_location(content: &str) -> Option<String> {
    for marker in [" in ", " at ", " near "] {
        if let Some(idx) = content.find(marker) {
            let rest = &content[idx + marker.len()..];
            let phrase: Vec<&str> = rest
                .split_whitespace()
                .take_while(|w| w.chars().next().is_some_and(char::is_uppercase))
                .collect();
            if !phrase.is_empty() {
                return Some(
                    phrase
                        .join(" ")
                        .trim_end_matches(['.', ',', '!', '?'])
                        .to_string(),
                );
            }
        }
    }
    None
}

fn classify_event_type(content: &str) -> String {
    let lower = content.to_lowercase();
    let rules: &[(&str, &[&str])] = &[
        ("fire", &["fire", "blaze", "smoke"]),
        ("flood", &["flood", "flooding", "overflow"]),
        ("explosion", &["explosion", "blast"]),
        ("accident", &["accident", "crash", "collision", "derail"]),
        ("infrastructure", &["outage", "power", "water main", "gas leak"]),
        ("medical", &["medical", "injur", "casualt", "hospital"]),
        ("weather", &["storm", "hurricane", "tornado", "earthquake"]),
    ];
    for (event_type, keywords) in rules {
        if keywords.iter().any(|k| lower.contains(k)) {
            return (*event_type).to_string();
        }
    }
    "unknown".to_string()
}

// ============================================================================
// Verifier — claim extraction and reliability scoring
// ============================================================================

pub struct VerifierLogic;

#[async_trait]
impl StageLogic for VerifierLogic {
    async fn process(
        &self,
        _ctx: &StageContext,
        input: &ValidatedEnvelope,
    ) -> Result<StageOutput, StageError> {
        let event: NormalizedEvent = input.decode()?;
        let claims = extract_claims(&event.content, &event.source);

        let base = source_confidence(&event.source);
        let verified_claims: Vec<VerificationResult> = claims
            .into_iter()
            .map(|claim| {
                let confidence = claim_confidence(&claim.text, base);
                VerificationResult {
                    verified: confidence >= 0.6,
                    confidence,
                    sources: vec![claim.source.clone()],
                    claim,
                }
            })
            .collect();

        let reliability_score = if verified_claims.is_empty() {
            base
        } else {
            verified_claims.iter().map(|v| v.confidence).sum::<f64>()
                / verified_claims.len() as f64
        };

        let verified = VerifiedEvent {
            event_id: event.event_id.clone(),
            original_event: event,
            reliability_score,
            verified_claims,
            verification_timestamp: Utc::now(),
        };
        debug!(
            event_id = %verified.event_id,
            reliability = verified.reliability_score,
            claims = verified.verified_claims.len(),
            "event verified"
        );
        Ok(StageOutput::new(serde_json::to_value(&verified)?))
    }
}

/// Sentences long enough to carry a verifiable statement.
fn extract_claims(content: &str, source: &str) -> Vec<Claim> {
    content
        .split(['.', '!', '?'])
        .map(str::trim)
        .filter(|s| s.len() > 10)
        .map(|s| Claim {
            text: s.to_string(),
            source: source.to_string(),
        })
        .collect()
}

/// Baseline trust in a source class.
fn source_confidence(source: &str) -> f64 {
    let lower = source.to_lowercase();
    if ["sensor", "official", "gov", "emergency"]
        .iter()
        .any(|k| lower.contains(k))
    {
        0.9
    } else if lower.contains("news") {
        0.75
    } else if ["social", "twitter", "forum"].iter().any(|k| lower.contains(k)) {
        0.5
    } else {
        0.65
    }
}

fn claim_confidence(text: &str, base: f64) -> f64 {
    let lower = text.to_lowercase();
    let mut confidence = base;
    // Specific figures raise confidence; hedged language lowers it.
    if lower.chars().any(|c| c.is_ascii_digit()) {
        confidence += 0.05;
    }
    if ["maybe", "unconfirmed", "rumor", "allegedly", "reportedly"]
        .iter()
        .any(|k| lower.contains(k))
    {
        confidence -= 0.2;
    }
    confidence.clamp(0.05, 0.99)
}

// ============================================================================
// Summarizer — incident brief with historical context
// ============================================================================

pub struct SummarizerLogic;

#[async_trait]
impl StageLogic for SummarizerLogic {
    async fn process(
        &self,
        ctx: &StageContext,
        input: &ValidatedEnvelope,
    ) -> Result<StageOutput, StageError> {
        let verified: VerifiedEvent = input.decode()?;
        let event = &verified.original_event;

        // The incident concept starts here: this id is stable downstream.
        let incident_id = Uuid::new_v4().to_string();
        let location = event.location.clone().unwrap_or_default();
        let summary = build_summary(&verified);

        let mut key_facts = vec![
            format!("source: {}", event.source),
            format!("event type: {}", event.event_type),
            format!("reliability: {:.2}", verified.reliability_score),
        ];
        if !location.is_empty() {
            key_facts.push(format!("location: {location}"));
        }

        // Historical context lookup is best-effort: a degraded memory
        // subsystem never blocks the pipeline.
        let similar_incidents = match ctx
            .memory
            .query_similar(
                &summary,
                ctx.config.memory.top_k,
                ctx.config.memory.min_similarity,
                ctx.config.memory.query_timeout(),
            )
            .await
        {
            Ok(matches) => matches.into_iter().map(|(r, _)| r.id).collect(),
            Err(e) => {
                warn!(error = %e, "memory lookup unavailable, proceeding without context");
                Vec::new()
            }
        };

        let brief = IncidentBrief {
            incident_id: incident_id.clone(),
            summary: summary.clone(),
            key_facts,
            location: location.clone(),
            affected_entities: event.entities.clone(),
            similar_incidents,
            created_at: Utc::now(),
        };

        if let Err(e) = ctx
            .memory
            .store_incident(
                &incident_id,
                &summary,
                "UNTRIAGED",
                &location,
                std::collections::HashMap::new(),
            )
            .await
        {
            warn!(incident_id, error = %e, "could not store incident in memory bank");
        }

        debug!(incident_id, similar = brief.similar_incidents.len(), "incident summarized");

        // Reliability rides alongside the brief so triage can damp
        // low-trust incidents without re-deriving it.
        let mut data = serde_json::to_value(&brief)?;
        if let Some(obj) = data.as_object_mut() {
            obj.insert(
                "reliability_score".to_string(),
                json!(verified.reliability_score),
            );
        }
        Ok(StageOutput::new(data))
    }
}

fn build_summary(verified: &VerifiedEvent) -> String {
    let event = &verified.original_event;
    let mut summary = format!("{} event reported by {}", event.event_type, event.source);
    if let Some(ref location) = event.location {
        summary.push_str(&format!(" in {location}"));
    }
    summary.push_str(&format!(": {}", event.content.trim()));
    summary
}

// ============================================================================
// Triage — severity classification and job creation
// ============================================================================

const CRITICAL_KEYWORDS: &[&str] = &[
    "explosion", "fire", "collapse", "casualt", "fatalit", "death", "critical", "emergency",
    "evacuat",
];
const HIGH_KEYWORDS: &[&str] = &[
    "injur", "damage", "flooding", "outage", "hazard", "severe", "trapped",
];
const MEDIUM_KEYWORDS: &[&str] = &["disruption", "delay", "minor", "moderate", "warning"];

pub struct TriageLogic;

#[async_trait]
impl StageLogic for TriageLogic {
    async fn process(
        &self,
        ctx: &StageContext,
        input: &ValidatedEnvelope,
    ) -> Result<StageOutput, StageError> {
        let brief: IncidentBrief = input.decode()?;
        let reliability = input
            .data()
            .get("reliability_score")
            .and_then(Value::as_f64)
            .unwrap_or(1.0);

        let (score, reasoning) = score_incident(&brief.summary, reliability);
        let severity = classify_severity(score);
        let priority_score = score.max(0.1);

        // Only incidents worth tracking get a job; low-grade noise stays
        // out of the job table.
        let job_id = if severity.merits_tracking() {
            let job = ctx.store.create_job(&brief.incident_id)?;
            job.job_id
        } else {
            String::new()
        };

        let triaged = TriagedIncident {
            incident_id: brief.incident_id.clone(),
            brief,
            severity,
            priority_score,
            job_id: job_id.clone(),
            reasoning,
            triaged_at: Utc::now(),
        };
        debug!(
            incident_id = %triaged.incident_id,
            severity = %severity,
            priority = priority_score,
            "incident triaged"
        );

        let mut output = StageOutput::new(serde_json::to_value(&triaged)?);
        if !job_id.is_empty() {
            output.job_id = Some(job_id);
        }
        Ok(output)
    }
}

/// Keyword-weighted severity score in [0, 1] with a reasoning trail.
fn score_incident(summary: &str, reliability: f64) -> (f64, String) {
    let lower = summary.to_lowercase();
    let mut score = 0.0_f64;
    let mut reasons = Vec::new();

    for kw in CRITICAL_KEYWORDS {
        if lower.contains(kw) {
            score += 0.3;
            reasons.push(format!("critical indicator '{kw}'"));
        }
    }
    for kw in HIGH_KEYWORDS {
        if lower.contains(kw) {
            score += 0.2;
            reasons.push(format!("high indicator '{kw}'"));
        }
    }
    for kw in MEDIUM_KEYWORDS {
        if lower.contains(kw) {
            score += 0.1;
            reasons.push(format!("medium indicator '{kw}'"));
        }
    }

    if let Some(count) = casualty_count(&lower) {
        if count > 10 {
            score += 0.2;
            reasons.push(format!("{count} people affected"));
        } else if count > 0 {
            score += 0.1;
            reasons.push(format!("{count} people affected"));
        }
    }

    if reliability < 0.3 {
        score *= 0.7;
        reasons.push(format!("damped for low reliability ({reliability:.2})"));
    }

    let score = score.clamp(0.0, 1.0);
    let reasoning = if reasons.is_empty() {
        "no severity indicators found".to_string()
    } else {
        reasons.join("; ")
    };
    (score, reasoning)
}

/// Largest number appearing next to a casualty/injury term.
fn casualty_count(lower: &str) -> Option<u64> {
    let mut best = None;
    let tokens: Vec<&str> = lower.split_whitespace().collect();
    for (i, token) in tokens.iter().enumerate() {
        if let Ok(n) = token.trim_matches(|c: char| !c.is_ascii_digit()).parse::<u64>() {
            let window = &tokens[i.saturating_sub(2)..(i + 3).min(tokens.len())];
            if window
                .iter()
                .any(|w| w.contains("casualt") || w.contains("injur") || w.contains("dead") || w.contains("people"))
            {
                best = Some(best.map_or(n, |b: u64| b.max(n)));
            }
        }
    }
    best
}

fn classify_severity(score: f64) -> SeverityLevel {
    if score >= 0.7 {
        SeverityLevel::Critical
    } else if score >= 0.5 {
        SeverityLevel::High
    } else if score >= 0.3 {
        SeverityLevel::Medium
    } else {
        SeverityLevel::Low
    }
}

// ============================================================================
// Dispatcher — action plans, job completion, durable incident record
// ============================================================================

pub struct DispatcherLogic;

#[async_trait]
impl StageLogic for DispatcherLogic {
    async fn process(
        &self,
        ctx: &StageContext,
        input: &ValidatedEnvelope,
    ) -> Result<StageOutput, StageError> {
        let triaged: TriagedIncident = input.decode()?;

        if !triaged.job_id.is_empty() {
            // The job id was minted at triage; adopt it if this stage runs
            // against a separate database, then advance it.
            ctx.store.ensure_job(&triaged.job_id, &triaged.incident_id)?;
            ctx.store
                .update_job_status(&triaged.job_id, crate::types::JobStatus::Processing, None)?;
        }

        let recommended_actions = build_action_plan(triaged.severity, &triaged.brief.location);
        let communication_template = if triaged.severity.merits_tracking() {
            build_communication(&triaged)
        } else {
            String::new()
        };

        let dispatched = DispatchedIncident {
            incident_id: triaged.incident_id.clone(),
            recommended_actions,
            communication_template,
            status: IncidentStatus::Dispatched,
            dispatched_at: Utc::now(),
            triaged_incident: triaged.clone(),
        };

        let full_data = serde_json::to_value(&dispatched)?;
        ctx.store.upsert_incident(IncidentRecord {
            incident_id: dispatched.incident_id.clone(),
            summary: triaged.brief.summary.clone(),
            severity: triaged.severity,
            priority_score: triaged.priority_score,
            status: dispatched.status,
            created_at: triaged.brief.created_at,
            updated_at: Utc::now(),
            full_data: full_data.clone(),
        })?;

        if !triaged.job_id.is_empty() {
            ctx.store.update_job_status(
                &triaged.job_id,
                crate::types::JobStatus::Completed,
                Some(json!({
                    "incident_id": dispatched.incident_id,
                    "actions": dispatched.recommended_actions.len(),
                })),
            )?;
        }

        ctx.cache_incident(dispatched.clone()).await;
        debug!(
            incident_id = %dispatched.incident_id,
            severity = %triaged.severity,
            actions = dispatched.recommended_actions.len(),
            "incident dispatched"
        );
        Ok(StageOutput::new(full_data))
    }
}

fn build_action_plan(severity: SeverityLevel, location: &str) -> Vec<Action> {
    let mut actions = match severity {
        SeverityLevel::Critical => vec![
            action("Activate emergency operations center", "EOC director", "immediately"),
            action("Dispatch first responders to the scene", "dispatch supervisor", "immediately"),
            action("Notify hospital network of incoming casualties", "medical liaison", "15 minutes"),
            action("Issue public safety alert", "communications lead", "30 minutes"),
            action("Brief executive leadership", "duty officer", "1 hour"),
        ],
        SeverityLevel::High => vec![
            action("Dispatch response team to the scene", "dispatch supervisor", "15 minutes"),
            action("Place medical services on standby", "medical liaison", "30 minutes"),
            action("Prepare public advisory", "communications lead", "1 hour"),
            action("Open incident tracking channel", "duty officer", "1 hour"),
        ],
        SeverityLevel::Medium => vec![
            action("Assign field team for assessment", "operations lead", "2 hours"),
            action("Monitor for escalation", "duty officer", "ongoing"),
            action("Log incident for shift review", "duty officer", "end of shift"),
        ],
        SeverityLevel::Low => vec![
            action("Log incident for records", "duty officer", "end of shift"),
            action("No immediate response required", "duty officer", "n/a"),
        ],
    };
    if !location.is_empty() {
        actions.push(action(
            &format!("Confirm access routes to {location}"),
            "operations lead",
            "30 minutes",
        ));
    }
    actions
}

fn action(text: &str, responsible: &str, timeline: &str) -> Action {
    Action {
        action: text.to_string(),
        responsible: responsible.to_string(),
        timeline: timeline.to_string(),
    }
}

fn build_communication(triaged: &TriagedIncident) -> String {
    format!(
        "[{}] {}. Priority {:.2}. Responders have been notified; follow official channels for updates.",
        triaged.severity, triaged.brief.summary, triaged.priority_score
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_extraction_dedups_and_filters() {
        let entities = extract_entities("Fire near Riverside Hospital, Riverside crews en route");
        assert_eq!(entities, vec!["Fire", "Riverside", "Hospital"]);
    }

    #[test]
    fn test_location_extraction() {
        assert_eq!(
            extract_location("Warehouse fire reported in North Haven."),
            Some("North Haven".to_string())
        );
        assert_eq!(extract_location("no location mentioned here"), None);
    }

    #[test]
    fn test_event_type_classification() {
        assert_eq!(classify_event_type("Massive blaze downtown"), "fire");
        assert_eq!(classify_event_type("Water main break floods street"), "flood");
        assert_eq!(classify_event_type("quarterly report published"), "unknown");
    }

    #[test]
    fn test_source_confidence_tiers() {
        assert!(source_confidence("city-sensor-14") > source_confidence("local news"));
        assert!(source_confidence("local news") > source_confidence("social media"));
    }

    #[test]
    fn test_hedged_claims_lose_confidence() {
        let firm = claim_confidence("Three buildings confirmed damaged", 0.75);
        let hedged = claim_confidence("Allegedly some buildings damaged", 0.75);
        assert!(firm > hedged);
    }

    #[test]
    fn test_severity_thresholds() {
        assert_eq!(classify_severity(0.85), SeverityLevel::Critical);
        assert_eq!(classify_severity(0.6), SeverityLevel::High);
        assert_eq!(classify_severity(0.35), SeverityLevel::Medium);
        assert_eq!(classify_severity(0.1), SeverityLevel::Low);
    }

    #[test]
    fn test_scoring_finds_critical_keywords() {
        let (score, reasoning) =
            score_incident("explosion and fire at refinery, evacuation ordered", 0.9);
        assert!(score >= 0.7, "score was {score}");
        assert!(reasoning.contains("critical indicator"));
    }

    #[test]
    fn test_low_reliability_damps_score() {
        let (trusted, _) = score_incident("severe flooding and damage reported", 0.9);
        let (untrusted, reasoning) = score_incident("severe flooding and damage reported", 0.2);
        assert!(untrusted < trusted);
        assert!(reasoning.contains("damped"));
    }

    #[test]
    fn test_casualty_count_requires_context() {
        assert_eq!(casualty_count("12 people injured in crash"), Some(12));
        assert_eq!(casualty_count("route 12 closed for repairs"), None);
    }

    #[test]
    fn test_action_plan_scales_with_severity() {
        let critical = build_action_plan(SeverityLevel::Critical, "");
        let low = build_action_plan(SeverityLevel::Low, "");
        assert!(critical.len() > low.len());

        let with_location = build_action_plan(SeverityLevel::Low, "Dockside");
        assert!(with_location
            .iter()
            .any(|a| a.action.contains("Dockside")));
    }
}
