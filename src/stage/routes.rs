//! HTTP surface shared by every stage, plus the dispatcher dashboard.

use super::{StageContext, StageKind};
use crate::envelope::{self, Envelope};
use crate::forward::AgentCard;
use crate::store::JobFilter;
use crate::types::JobStatus;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use uuid::Uuid;

const DEFAULT_LIST_LIMIT: usize = 50;

/// Synchronous reply from `POST /tasks`. Acknowledges local processing
/// only; downstream delivery happens afterwards.
#[derive(Debug, Serialize, Deserialize)]
pub struct TaskResponse {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TaskResponse {
    fn success(result: Value) -> Self {
        Self {
            status: "success".to_string(),
            result: Some(result),
            error: None,
        }
    }

    fn error(message: String) -> Self {
        Self {
            status: "error".to_string(),
            result: None,
            error: Some(message),
        }
    }

    /// Failure reply carrying a protocol-level error envelope, so callers
    /// that speak the envelope protocol get the failure in the same shape
    /// they sent.
    fn failure(stage: &str, session_id: &str, message: String) -> Self {
        let envelope = envelope::error_envelope(stage, session_id, &message);
        Self {
            status: "error".to_string(),
            result: serde_json::to_value(&envelope).ok(),
            error: Some(message),
        }
    }
}

/// Build the router for one stage. The dashboard read endpoints are mounted
/// on the dispatcher only.
pub fn router(ctx: Arc<StageContext>) -> Router {
    let mut router = Router::new()
        .route("/tasks", post(handle_task))
        .route("/.well-known/agent-card.json", get(agent_card))
        .route("/health", get(health));

    if ctx.kind == StageKind::Dispatcher {
        router = router
            .route("/incidents", get(list_incidents))
            .route("/incidents/:incident_id", get(get_incident))
            .route("/jobs", get(list_jobs))
            .route("/dead-letters", get(list_dead_letters));
    }

    // CORS is open: the dashboard is served from a separate origin and the
    // read endpoints carry no credentials.
    router
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(ctx)
}

async fn handle_task(
    State(ctx): State<Arc<StageContext>>,
    Json(raw): Json<Value>,
) -> (StatusCode, Json<TaskResponse>) {
    ctx.note_request();

    let mut envelope = match envelope::parse(raw) {
        Ok(env) => env,
        Err(e) => {
            warn!(stage = %ctx.kind, error = %e, "envelope rejected");
            return (StatusCode::BAD_REQUEST, Json(TaskResponse::error(e.to_string())));
        }
    };

    // Ingest opens the incident lifecycle: a missing session id is assigned
    // here and stays stable through every later stage.
    if ctx.kind == StageKind::Ingest && envelope.session_id.trim().is_empty() {
        envelope.session_id = Uuid::new_v4().to_string();
    }

    let session_id = envelope.session_id.clone();
    let validated = match envelope::validate(envelope, ctx.kind.accepted_schema()) {
        Ok(v) => v,
        Err(e) => {
            warn!(stage = %ctx.kind, session_id, error = %e, "envelope rejected");
            return (
                StatusCode::BAD_REQUEST,
                Json(TaskResponse::failure(ctx.kind.name(), &session_id, e.to_string())),
            );
        }
    };

    let output = match ctx.process(&validated).await {
        Ok(output) => output,
        Err(e) if e.is_rejection() => {
            warn!(stage = %ctx.kind, session_id, error = %e, "payload rejected");
            return (
                StatusCode::BAD_REQUEST,
                Json(TaskResponse::failure(ctx.kind.name(), &session_id, e.to_string())),
            );
        }
        Err(e) => {
            error!(stage = %ctx.kind, session_id, error = %e, "stage processing failed");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(TaskResponse::failure(ctx.kind.name(), &session_id, e.to_string())),
            );
        }
    };

    if let (Some(schema), Some(downstream)) = (ctx.kind.outbound_schema(), ctx.downstream.clone()) {
        let next = envelope::derive_next(
            validated.envelope(),
            schema,
            output.data.clone(),
            ctx.kind.name(),
        );
        let job_id = output.job_id.clone();
        let ctx = Arc::clone(&ctx);
        // Delivery runs after the response so upstream never blocks on (or
        // fails because of) downstream trouble.
        tokio::spawn(async move {
            forward_downstream(ctx, next, &downstream, job_id).await;
        });
    }

    (StatusCode::OK, Json(TaskResponse::success(output.data)))
}

async fn forward_downstream(
    ctx: Arc<StageContext>,
    envelope: Envelope,
    downstream: &str,
    job_id: Option<String>,
) {
    let session_id = envelope.session_id.clone();
    match ctx.forwarder.forward(&envelope, downstream).await {
        Ok(delivery) => {
            ctx.note_forward(true);
            info!(
                stage = %ctx.kind,
                session_id,
                downstream,
                attempts = delivery.attempts,
                capability_checked = delivery.capability_checked,
                "forwarded to next stage"
            );
        }
        Err(e) => {
            ctx.note_forward(false);
            error!(stage = %ctx.kind, session_id, downstream, error = %e, "forwarding failed");
            // The envelope is not dropped: it lands in the dead-letter tree
            // for inspection or replay.
            if let Err(store_err) = ctx
                .store
                .record_dead_letter(&envelope, downstream, &e.to_string())
            {
                error!(session_id, error = %store_err, "could not record dead letter");
            }
            if let Some(job_id) = job_id {
                let result = json!({ "error": format!("forwarding failed: {e}") });
                if let Err(store_err) =
                    ctx.store
                        .update_job_status(&job_id, JobStatus::Failed, Some(result))
                {
                    error!(job_id, error = %store_err, "could not mark job failed");
                }
            }
        }
    }
}

async fn agent_card(State(ctx): State<Arc<StageContext>>) -> Json<AgentCard> {
    Json(ctx.kind.agent_card())
}

async fn health(State(ctx): State<Arc<StageContext>>) -> Json<Value> {
    let status = if ctx.is_degraded() { "degraded" } else { "healthy" };
    let memory = ctx.memory.stats();
    Json(json!({
        "status": status,
        "stage": ctx.kind.name(),
        "accepts": ctx.kind.accepted_schema().as_str(),
        "requests_handled": ctx.requests_handled(),
        "forward_failures": ctx.forward_failures(),
        "memory": memory,
    }))
}

// ============================================================================
// Dispatcher dashboard
// ============================================================================

#[derive(Debug, Deserialize)]
struct ListQuery {
    limit: Option<usize>,
}

async fn list_incidents(
    State(ctx): State<Arc<StageContext>>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT);
    let incidents = ctx.store.list_incidents(limit).map_err(internal)?;
    let count = incidents.len();
    Ok(Json(json!({ "incidents": incidents, "count": count })))
}

async fn get_incident(
    State(ctx): State<Arc<StageContext>>,
    Path(incident_id): Path<String>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    // Cache first, then the durable record.
    if let Some(cached) = ctx.cached_incident(&incident_id).await {
        return Ok(Json(json!({ "incident": cached, "source": "cache" })));
    }
    match ctx.store.get_incident(&incident_id).map_err(internal)? {
        Some(record) => Ok(Json(json!({ "incident": record.full_data, "source": "store" }))),
        None => Err((
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("incident not found: {incident_id}") })),
        )),
    }
}

#[derive(Debug, Deserialize)]
struct JobsQuery {
    status: Option<JobStatus>,
    incident_id: Option<String>,
    limit: Option<usize>,
}

async fn list_jobs(
    State(ctx): State<Arc<StageContext>>,
    Query(query): Query<JobsQuery>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let filter = JobFilter {
        status: query.status,
        incident_id: query.incident_id,
    };
    let jobs = ctx
        .store
        .query_jobs(&filter, query.limit.unwrap_or(DEFAULT_LIST_LIMIT))
        .map_err(internal)?;
    Ok(Json(json!({ "jobs": jobs })))
}

async fn list_dead_letters(
    State(ctx): State<Arc<StageContext>>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let letters = ctx
        .store
        .list_dead_letters(query.limit.unwrap_or(DEFAULT_LIST_LIMIT))
        .map_err(internal)?;
    Ok(Json(json!({ "dead_letters": letters })))
}

fn internal(e: impl std::fmt::Display) -> (StatusCode, Json<Value>) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": e.to_string() })),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FleetConfig;
    use crate::envelope::EnvelopeSchema;
    use crate::forward::{RetryPolicy, StageForwarder};
    use crate::memory::{FeatureHashEmbedder, MemoryBank};
    use crate::store::JobStore;
    use crate::types::{IncidentBrief, SeverityLevel, TriagedIncident};
    use axum::body::Body;
    use axum::http::Request;
    use chrono::Utc;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn test_ctx(kind: StageKind) -> (Arc<StageContext>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStore::open(dir.path().join("test.db")).unwrap();
        let memory = MemoryBank::new(Arc::new(FeatureHashEmbedder));
        let ctx = StageContext::new(
            kind,
            FleetConfig::default(),
            store,
            memory,
            StageForwarder::new(RetryPolicy::default()),
            None,
        );
        (Arc::new(ctx), dir)
    }

    async fn post_task(app: Router, body: Value) -> (StatusCode, Value) {
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/tasks")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, Value) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    fn event_envelope() -> Value {
        serde_json::to_value(envelope::create(
            EnvelopeSchema::EventV1,
            "test",
            json!({
                "source": "city-sensor-4",
                "content": "Warehouse fire reported in North Haven, 12 people injured",
                "timestamp": Utc::now(),
            }),
            Some("session-1".to_string()),
        ))
        .unwrap()
    }

    #[tokio::test]
    async fn test_agent_card_endpoint() {
        let (ctx, _dir) = test_ctx(StageKind::Verifier);
        let app = router(ctx);
        let (status, body) = get_json(app, "/.well-known/agent-card.json").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["name"], "verifier");
        assert_eq!(body["accepted_schemas"][0], "event_v1");
    }

    #[tokio::test]
    async fn test_health_endpoint_reports_healthy() {
        let (ctx, _dir) = test_ctx(StageKind::Ingest);
        let app = router(ctx);
        let (status, body) = get_json(app, "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["stage"], "ingest");
    }

    #[tokio::test]
    async fn test_task_accepts_valid_event() {
        let (ctx, _dir) = test_ctx(StageKind::Ingest);
        let app = router(ctx);
        let (status, body) = post_task(app, event_envelope()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "success");
        assert_eq!(body["result"]["source"], "city-sensor-4");
        assert!(body["result"]["event_id"].is_string());
    }

    #[tokio::test]
    async fn test_task_rejects_wrong_schema_with_400() {
        let (ctx, _dir) = test_ctx(StageKind::Triage);
        let app = router(ctx);
        let (status, body) = post_task(app, event_envelope()).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["status"], "error");
    }

    #[tokio::test]
    async fn test_rejection_reply_carries_error_envelope() {
        let (ctx, _dir) = test_ctx(StageKind::Triage);
        let app = router(ctx);
        let (status, body) = post_task(app, event_envelope()).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        // The failure rides back as a control envelope on the caller's session.
        assert_eq!(body["result"]["schema"], "mcp_envelope_v1");
        assert_eq!(body["result"]["session_id"], "session-1");
        assert_eq!(body["result"]["source_stage"], "triage");
        assert!(body["result"]["payload"]["data"]["error_message"]
            .as_str()
            .unwrap()
            .contains("schema mismatch"));
    }

    #[tokio::test]
    async fn test_task_rejects_unknown_schema_with_400() {
        let (ctx, _dir) = test_ctx(StageKind::Ingest);
        let app = router(ctx);
        let mut raw = event_envelope();
        raw["schema"] = json!("event_v9");
        let (status, body) = post_task(app, raw).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("event_v9"));
    }

    #[tokio::test]
    async fn test_ingest_assigns_session_id_when_missing() {
        let (ctx, _dir) = test_ctx(StageKind::Ingest);
        let app = router(ctx);
        let mut raw = event_envelope();
        raw["session_id"] = json!("");
        let (status, _body) = post_task(app, raw).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_ingest_accepts_envelope_without_session_field() {
        let (ctx, _dir) = test_ctx(StageKind::Ingest);
        let app = router(ctx);
        let mut raw = event_envelope();
        raw.as_object_mut().unwrap().remove("session_id");
        let (status, body) = post_task(app, raw).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "success");
    }

    #[tokio::test]
    async fn test_dashboard_routes_absent_on_non_dispatcher() {
        let (ctx, _dir) = test_ctx(StageKind::Ingest);
        let app = router(ctx);
        let response = app
            .oneshot(Request::builder().uri("/incidents").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_dispatcher_completes_job_and_serves_dashboard() {
        let (ctx, _dir) = test_ctx(StageKind::Dispatcher);
        let job = ctx.store.create_job("inc-9").unwrap();

        let brief = IncidentBrief {
            incident_id: "inc-9".to_string(),
            summary: "severe flooding and damage near the river".to_string(),
            key_facts: vec![],
            location: "Riverside".to_string(),
            affected_entities: vec![],
            similar_incidents: vec![],
            created_at: Utc::now(),
        };
        let triaged = TriagedIncident {
            incident_id: "inc-9".to_string(),
            brief,
            severity: SeverityLevel::High,
            priority_score: 0.6,
            job_id: job.job_id.clone(),
            reasoning: "test".to_string(),
            triaged_at: Utc::now(),
        };
        let raw = serde_json::to_value(envelope::create(
            EnvelopeSchema::TriagedIncidentV1,
            "triage",
            serde_json::to_value(&triaged).unwrap(),
            Some("session-9".to_string()),
        ))
        .unwrap();

        let (status, body) = post_task(router(Arc::clone(&ctx)), raw).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["result"]["status"], "DISPATCHED");
        assert!(!body["result"]["recommended_actions"].as_array().unwrap().is_empty());

        let stored = ctx.store.get_job(&job.job_id).unwrap().unwrap();
        assert_eq!(stored.status, crate::types::JobStatus::Completed);

        let (status, body) = get_json(router(Arc::clone(&ctx)), "/incidents").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["incidents"][0]["incident_id"], "inc-9");

        let (status, body) = get_json(router(ctx), "/incidents/inc-9").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["source"], "cache");
    }

    #[tokio::test]
    async fn test_dispatcher_adopts_job_created_at_triage() {
        // The job id arrives minted by the triage stage; this store has never
        // seen it. The dispatcher must adopt and complete it rather than fail.
        let (ctx, _dir) = test_ctx(StageKind::Dispatcher);

        let brief = IncidentBrief {
            incident_id: "inc-remote".to_string(),
            summary: "gas leak evacuation in progress".to_string(),
            key_facts: vec![],
            location: "Eastside".to_string(),
            affected_entities: vec![],
            similar_incidents: vec![],
            created_at: Utc::now(),
        };
        let triaged = TriagedIncident {
            incident_id: "inc-remote".to_string(),
            brief,
            severity: SeverityLevel::Critical,
            priority_score: 0.9,
            job_id: "job-minted-at-triage".to_string(),
            reasoning: "test".to_string(),
            triaged_at: Utc::now(),
        };
        let raw = serde_json::to_value(envelope::create(
            EnvelopeSchema::TriagedIncidentV1,
            "triage",
            serde_json::to_value(&triaged).unwrap(),
            Some("session-remote".to_string()),
        ))
        .unwrap();

        let (status, body) = post_task(router(Arc::clone(&ctx)), raw).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["result"]["status"], "DISPATCHED");

        let stored = ctx.store.get_job("job-minted-at-triage").unwrap().unwrap();
        assert_eq!(stored.status, crate::types::JobStatus::Completed);
        assert_eq!(stored.incident_id, "inc-remote");

        let (status, body) = get_json(router(ctx), "/incidents").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["incidents"][0]["incident_id"], "inc-remote");
    }

    #[tokio::test]
    async fn test_failed_forward_lands_in_dead_letter_queue() {
        use std::time::Duration;

        let dir = tempfile::tempdir().unwrap();
        let store = JobStore::open(dir.path().join("test.db")).unwrap();
        let memory = MemoryBank::new(Arc::new(FeatureHashEmbedder));
        // Nothing listens on the discard port; retries stay short.
        let policy = RetryPolicy {
            max_retries: 2,
            initial_delay: Duration::from_millis(5),
            backoff_multiplier: 1.0,
            max_delay: Duration::from_millis(5),
        };
        let ctx = Arc::new(StageContext::new(
            StageKind::Ingest,
            FleetConfig::default(),
            store,
            memory,
            StageForwarder::new(policy),
            Some("http://127.0.0.1:9".to_string()),
        ));

        let (status, _body) = post_task(router(Arc::clone(&ctx)), event_envelope()).await;
        assert_eq!(status, StatusCode::OK);

        let mut letters = vec![];
        for _ in 0..200 {
            letters = ctx.store.list_dead_letters(10).unwrap();
            if !letters.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].source_stage, "ingest");
        assert_eq!(letters[0].downstream, "http://127.0.0.1:9");
        assert_eq!(letters[0].envelope.session_id, "session-1");
    }

    #[tokio::test]
    async fn test_dead_letters_endpoint_lists_records() {
        let (ctx, _dir) = test_ctx(StageKind::Dispatcher);
        let env = envelope::create(
            EnvelopeSchema::EventV1,
            "verifier",
            json!({"source": "s", "content": "c", "timestamp": Utc::now()}),
            Some("session-dl".to_string()),
        );
        ctx.store
            .record_dead_letter(&env, "http://127.0.0.1:1", "retries exhausted")
            .unwrap();

        let (status, body) = get_json(router(ctx), "/dead-letters").await;
        assert_eq!(status, StatusCode::OK);
        let letters = body["dead_letters"].as_array().unwrap();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0]["error"], "retries exhausted");
        assert_eq!(letters[0]["envelope"]["session_id"], "session-dl");
    }

    #[tokio::test]
    async fn test_jobs_endpoint_filters_by_status() {
        let (ctx, _dir) = test_ctx(StageKind::Dispatcher);
        let job = ctx.store.create_job("inc-1").unwrap();
        ctx.store
            .update_job_status(&job.job_id, JobStatus::Completed, None)
            .unwrap();
        ctx.store.create_job("inc-2").unwrap();

        let (status, body) = get_json(router(ctx), "/jobs?status=COMPLETED").await;
        assert_eq!(status, StatusCode::OK);
        let jobs = body["jobs"].as_array().unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0]["incident_id"], "inc-1");
    }
}
