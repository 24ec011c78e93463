//! Pipeline stages: one axum service per stage, wired in a fixed chain.
//!
//! ingest (8001) -> verifier (8002) -> summarizer (8003) -> triage (8004)
//! -> dispatcher (8005)
//!
//! Every stage exposes the same surface: `POST /tasks` accepts an envelope,
//! `GET /.well-known/agent-card.json` serves the capability descriptor, and
//! `GET /health` reports liveness. The dispatcher additionally serves the
//! dashboard read endpoints. The synchronous response acknowledges local
//! processing only; forwarding downstream happens after the response and
//! its failures never bubble back to the caller.

mod logic;
mod routes;

pub use logic::{StageLogic, StageOutput};
pub use routes::{router, TaskResponse};

use crate::config::FleetConfig;
use crate::envelope::{EnvelopeSchema, ValidationError};
use crate::forward::{AgentCard, StageForwarder, TASKS_PATH};
use crate::memory::MemoryBank;
use crate::store::{JobStore, StoreError};
use crate::types::DispatchedIncident;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::RwLock;

/// The five pipeline stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKind {
    Ingest,
    Verifier,
    Summarizer,
    Triage,
    Dispatcher,
}

impl StageKind {
    pub const ALL: [StageKind; 5] = [
        StageKind::Ingest,
        StageKind::Verifier,
        StageKind::Summarizer,
        StageKind::Triage,
        StageKind::Dispatcher,
    ];

    pub fn name(self) -> &'static str {
        match self {
            StageKind::Ingest => "ingest",
            StageKind::Verifier => "verifier",
            StageKind::Summarizer => "summarizer",
            StageKind::Triage => "triage",
            StageKind::Dispatcher => "dispatcher",
        }
    }

    /// The single schema this stage accepts on `POST /tasks`.
    pub fn accepted_schema(self) -> EnvelopeSchema {
        match self {
            StageKind::Ingest => EnvelopeSchema::EventV1,
            StageKind::Verifier => EnvelopeSchema::EventV1,
            StageKind::Summarizer => EnvelopeSchema::VerifiedEventV1,
            StageKind::Triage => EnvelopeSchema::IncidentBriefV1,
            StageKind::Dispatcher => EnvelopeSchema::TriagedIncidentV1,
        }
    }

    /// The schema this stage emits, or `None` for the terminal stage.
    pub fn outbound_schema(self) -> Option<EnvelopeSchema> {
        match self {
            StageKind::Ingest => Some(EnvelopeSchema::EventV1),
            StageKind::Verifier => Some(EnvelopeSchema::VerifiedEventV1),
            StageKind::Summarizer => Some(EnvelopeSchema::IncidentBriefV1),
            StageKind::Triage => Some(EnvelopeSchema::TriagedIncidentV1),
            StageKind::Dispatcher => None,
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            StageKind::Ingest => "Normalizes raw events into a standard shape",
            StageKind::Verifier => "Verifies claims and scores source reliability",
            StageKind::Summarizer => "Summarizes events into incident briefs with historical context",
            StageKind::Triage => "Classifies severity and assigns priority",
            StageKind::Dispatcher => "Produces action plans and the durable incident record",
        }
    }

    pub fn capabilities(self) -> Vec<String> {
        let caps: &[&str] = match self {
            StageKind::Ingest => &["normalize", "entity-extraction"],
            StageKind::Verifier => &["claim-extraction", "reliability-scoring"],
            StageKind::Summarizer => &["summarization", "memory-lookup"],
            StageKind::Triage => &["severity-classification", "job-tracking"],
            StageKind::Dispatcher => &["action-planning", "dashboard"],
        };
        caps.iter().map(|c| c.to_string()).collect()
    }

    pub fn default_port(self) -> u16 {
        match self {
            StageKind::Ingest => 8001,
            StageKind::Verifier => 8002,
            StageKind::Summarizer => 8003,
            StageKind::Triage => 8004,
            StageKind::Dispatcher => 8005,
        }
    }

    /// The stage immediately downstream, if any.
    pub fn next(self) -> Option<StageKind> {
        match self {
            StageKind::Ingest => Some(StageKind::Verifier),
            StageKind::Verifier => Some(StageKind::Summarizer),
            StageKind::Summarizer => Some(StageKind::Triage),
            StageKind::Triage => Some(StageKind::Dispatcher),
            StageKind::Dispatcher => None,
        }
    }

    /// Capability descriptor served at the well-known discovery path.
    pub fn agent_card(self) -> AgentCard {
        AgentCard {
            name: self.name().to_string(),
            description: self.description().to_string(),
            accepted_schemas: vec![self.accepted_schema().as_str().to_string()],
            outbound_schema: self.outbound_schema().map(|s| s.as_str().to_string()),
            endpoint: TASKS_PATH.to_string(),
            capabilities: self.capabilities(),
        }
    }

    fn logic(self) -> Box<dyn StageLogic> {
        match self {
            StageKind::Ingest => Box::new(logic::IngestLogic),
            StageKind::Verifier => Box::new(logic::VerifierLogic),
            StageKind::Summarizer => Box::new(logic::SummarizerLogic),
            StageKind::Triage => Box::new(logic::TriageLogic),
            StageKind::Dispatcher => Box::new(logic::DispatcherLogic),
        }
    }
}

impl std::fmt::Display for StageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for StageKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ingest" => Ok(StageKind::Ingest),
            "verifier" => Ok(StageKind::Verifier),
            "summarizer" => Ok(StageKind::Summarizer),
            "triage" => Ok(StageKind::Triage),
            "dispatcher" => Ok(StageKind::Dispatcher),
            other => Err(format!(
                "unknown stage '{other}' (expected ingest, verifier, summarizer, triage or dispatcher)"
            )),
        }
    }
}

/// Stage processing failures, mapped to HTTP status by the task handler.
#[derive(Debug, thiserror::Error)]
pub enum StageError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("internal stage error: {0}")]
    Internal(String),
}

impl StageError {
    /// Rejections are the caller's fault; everything else is ours.
    pub fn is_rejection(&self) -> bool {
        matches!(self, StageError::Validation(_))
    }
}

/// Shared state for one running stage, handed to axum as `Arc<StageContext>`.
pub struct StageContext {
    pub kind: StageKind,
    pub config: FleetConfig,
    pub store: JobStore,
    pub memory: MemoryBank,
    pub forwarder: StageForwarder,
    /// Base URL of the next stage, absent for the terminal stage.
    pub downstream: Option<String>,
    logic: Box<dyn StageLogic>,
    requests_handled: AtomicU64,
    forward_failures: AtomicU64,
    last_forward_ok: AtomicBool,
    /// Dispatcher-only fast lookup of recently dispatched incidents.
    incident_cache: RwLock<HashMap<String, DispatchedIncident>>,
}

impl StageContext {
    pub fn new(
        kind: StageKind,
        config: FleetConfig,
        store: JobStore,
        memory: MemoryBank,
        forwarder: StageForwarder,
        downstream: Option<String>,
    ) -> Self {
        Self {
            logic: kind.logic(),
            kind,
            config,
            store,
            memory,
            forwarder,
            downstream,
            requests_handled: AtomicU64::new(0),
            forward_failures: AtomicU64::new(0),
            last_forward_ok: AtomicBool::new(true),
            incident_cache: RwLock::new(HashMap::new()),
        }
    }

    pub async fn process(
        &self,
        input: &crate::envelope::ValidatedEnvelope,
    ) -> Result<StageOutput, StageError> {
        self.logic.process(self, input).await
    }

    pub fn note_request(&self) {
        self.requests_handled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn note_forward(&self, ok: bool) {
        if !ok {
            self.forward_failures.fetch_add(1, Ordering::Relaxed);
        }
        self.last_forward_ok.store(ok, Ordering::Relaxed);
    }

    pub fn requests_handled(&self) -> u64 {
        self.requests_handled.load(Ordering::Relaxed)
    }

    pub fn forward_failures(&self) -> u64 {
        self.forward_failures.load(Ordering::Relaxed)
    }

    /// Degraded when the most recent forward attempt failed.
    pub fn is_degraded(&self) -> bool {
        !self.last_forward_ok.load(Ordering::Relaxed)
    }

    pub async fn cache_incident(&self, incident: DispatchedIncident) {
        self.incident_cache
            .write()
            .await
            .insert(incident.incident_id.clone(), incident);
    }

    pub async fn cached_incident(&self, incident_id: &str) -> Option<DispatchedIncident> {
        self.incident_cache.read().await.get(incident_id).cloned()
    }
}
