//! AgentFleet: multi-stage incident response pipeline substrate.
//!
//! Five independently deployable stages process raw events into dispatched
//! incidents, talking to each other over a schema-tagged envelope protocol:
//!
//! - **Ingest**: normalizes raw events (entities, location, event type)
//! - **Verifier**: extracts claims and scores source reliability
//! - **Summarizer**: produces incident briefs with historical memory context
//! - **Triage**: classifies severity, assigns priority, opens tracking jobs
//! - **Dispatcher**: builds action plans and the durable incident record
//!
//! The envelope protocol (not shared state) is the only contract between
//! stages; jobs, incidents and dead-lettered envelopes live in a fleet-wide
//! job store.

pub mod config;
pub mod envelope;
pub mod forward;
pub mod memory;
pub mod stage;
pub mod store;
pub mod types;

// Re-export fleet configuration
pub use config::FleetConfig;

// Re-export the envelope protocol surface
pub use envelope::{Envelope, EnvelopeSchema, Payload, PayloadType, ValidatedEnvelope, ValidationError};

// Re-export commonly used types
pub use types::{
    Action, DispatchedIncident, IncidentBrief, IncidentRecord, IncidentStatus, Job, JobStatus,
    NormalizedEvent, RawEvent, SeverityLevel, TriagedIncident, VerifiedEvent,
};

// Re-export stage plumbing
pub use stage::{StageContext, StageError, StageKind};

// Re-export forwarding
pub use forward::{AgentCard, Delivery, ForwardError, RetryPolicy, StageForwarder};

// Re-export storage
pub use store::{DeadLetter, JobFilter, JobStore, StoreError};

// Re-export memory
pub use memory::{MemoryBank, MemoryError, MemoryIndex, MemoryStats};
