//! JSON HTTP surface: webhook intake, run triggers and the activity query.

use std::sync::Arc;

use actlog_core::{EventKind, RepairField};
use actlog_storage::EventFilter;
use actlog_sync::Engine;
use axum::{
    body::Bytes,
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "actlog-web";

const DEFAULT_IMPORT_VARIANT: &str = "lms_results";
const DEFAULT_CORRECTION_VARIANT: &str = "quiz_corrections";

#[derive(Clone)]
pub struct AppState {
    pub engine: Engine,
}

impl AppState {
    pub fn new(engine: Engine) -> Self {
        Self { engine }
    }
}

#[derive(Debug, Deserialize, Default)]
struct VariantQuery {
    variant: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct RepairRequest {
    #[serde(default)]
    fields: Vec<RepairField>,
}

#[derive(Debug, Deserialize, Default)]
struct ActivityQuery {
    /// Comma-separated subject ids or emails.
    subjects: Option<String>,
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
    kind: Option<String>,
    limit: Option<usize>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/webhooks/lms", post(webhook_handler))
        .route("/backfill/{group_id}", post(backfill_handler))
        .route("/imports/csv", post(import_csv_handler))
        .route("/repairs/raw-payload", post(repair_raw_handler))
        .route("/repairs/corrections", post(repair_corrections_handler))
        .route("/activity", get(activity_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(engine: Engine) -> anyhow::Result<()> {
    let port = engine.config.web_port;
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "listening");
    axum::serve(listener, app(AppState::new(engine))).await?;
    Ok(())
}

async fn health_handler() -> Response {
    Json(json!({"status": "ok"})).into_response()
}

/// Always 200: the sender only learns how the delivery was handled.
async fn webhook_handler(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let outcome = state.engine.webhook_ingestor().ingest_bytes(&body).await;
    Json(json!({"status": outcome.as_str()})).into_response()
}

async fn backfill_handler(State(state): State<Arc<AppState>>, AxumPath(group_id): AxumPath<String>) -> Response {
    match state.engine.run_backfill(&group_id).await {
        Ok(report) => Json(report).into_response(),
        Err(err) => server_error(err),
    }
}

async fn import_csv_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<VariantQuery>,
    body: Bytes,
) -> Response {
    let variant = query.variant.as_deref().unwrap_or(DEFAULT_IMPORT_VARIANT);
    if let Err(err) = state.engine.mappings.variant(variant) {
        return bad_request(err.to_string());
    }
    match state.engine.import_csv(variant, &body).await {
        Ok(report) => Json(report).into_response(),
        Err(err) => server_error(err),
    }
}

async fn repair_raw_handler(State(state): State<Arc<AppState>>, Json(request): Json<RepairRequest>) -> Response {
    match state.engine.repair_raw_payloads(&request.fields).await {
        Ok(report) => Json(report).into_response(),
        Err(err) => server_error(err),
    }
}

async fn repair_corrections_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<VariantQuery>,
    body: Bytes,
) -> Response {
    let variant = query.variant.as_deref().unwrap_or(DEFAULT_CORRECTION_VARIANT);
    if let Err(err) = state.engine.mappings.variant(variant) {
        return bad_request(err.to_string());
    }
    match state.engine.repair_from_corrections(variant, &body).await {
        Ok(report) => Json(report).into_response(),
        Err(err) => server_error(err),
    }
}

async fn activity_handler(State(state): State<Arc<AppState>>, Query(query): Query<ActivityQuery>) -> Response {
    let subject_keys = query
        .subjects
        .as_deref()
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| if s.contains('@') { s.to_ascii_lowercase() } else { s.to_string() })
        .collect::<Vec<_>>();
    if subject_keys.is_empty() {
        return bad_request("`subjects` must name at least one subject".to_string());
    }
    let event_kind = match query.kind.as_deref() {
        Some(raw) => match EventKind::from_alias(raw) {
            Some(kind) => Some(kind),
            None => return bad_request(format!("unknown event kind {raw:?}")),
        },
        None => None,
    };

    let filter = EventFilter {
        subject_keys,
        event_kind,
        occurred_from: query.from,
        occurred_to: query.to,
        limit: query.limit,
        ..Default::default()
    };
    match state.engine.store.filter_events(&filter).await {
        Ok(mut events) => {
            events.sort_by(|a, b| a.occurred_at.cmp(&b.occurred_at).then(a.id.cmp(&b.id)));
            Json(json!({"count": events.len(), "events": events})).into_response()
        }
        Err(err) => server_error(err.into()),
    }
}

fn bad_request(message: String) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({"error": message}))).into_response()
}

fn server_error(err: anyhow::Error) -> Response {
    error!(error = %format!("{err:#}"), "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"error": format!("{err:#}")})),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use actlog_sources::{BackfillFeed, Candidate, FeedContext, SourceError, SubjectRef};
    use actlog_storage::MemoryStore;
    use actlog_sync::{EngineConfig, TracingCompletionHook};
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{header, Request};
    use http_body_util::BodyExt;
    use serde_json::Value as JsonValue;
    use tower::ServiceExt;

    struct EmptyFeed;

    #[async_trait]
    impl BackfillFeed for EmptyFeed {
        fn source(&self) -> actlog_core::EventSource {
            actlog_core::EventSource::BackfillApi
        }

        fn page_size(&self) -> usize {
            10
        }

        async fn list_subjects(&self, _ctx: &FeedContext, _group_id: &str) -> Result<Vec<SubjectRef>, SourceError> {
            Ok(vec![SubjectRef {
                id: "S".into(),
                email: None,
                display_name: None,
            }])
        }

        async fn fetch_activity_page(
            &self,
            _ctx: &FeedContext,
            _subject: &SubjectRef,
            _page: u32,
        ) -> Result<Vec<Candidate>, SourceError> {
            Ok(Vec::new())
        }
    }

    fn test_app() -> (Router, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig {
            archive_dir: dir.path().join("archive"),
            reports_dir: dir.path().join("reports"),
            ..EngineConfig::default()
        };
        let engine = Engine::new(
            config,
            Arc::new(MemoryStore::new()),
            Arc::new(EmptyFeed),
            Arc::new(TracingCompletionHook),
        )
        .unwrap();
        (app(AppState::new(engine)), dir)
    }

    async fn send(app: &Router, request: Request<Body>) -> (StatusCode, JsonValue) {
        let resp = app.clone().oneshot(request).await.unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap())
    }

    fn post(uri: &str, body: impl Into<Body>) -> Request<Body> {
        Request::builder().method("POST").uri(uri).body(body.into()).unwrap()
    }

    fn quiz_delivery() -> String {
        json!({
            "id": "d-1",
            "resource": "quiz",
            "action": "attempted",
            "payload": {
                "user": {"id": "S", "email": "s@example.com"},
                "course": {"id": "C"},
                "quiz": {"id": "Q"},
                "grade": 0.85,
                "completed_at": "2025-01-01T00:00:00Z"
            }
        })
        .to_string()
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let (app, _dir) = test_app();
        let (status, body) = send(&app, Request::builder().uri("/health").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn webhook_always_answers_200_with_the_outcome() {
        let (app, _dir) = test_app();

        let (status, body) = send(&app, post("/webhooks/lms", quiz_delivery())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "recorded");

        let (status, body) = send(&app, post("/webhooks/lms", quiz_delivery())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "skipped_duplicate");

        let (status, body) = send(&app, post("/webhooks/lms", "garbage")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "dropped");
    }

    #[tokio::test]
    async fn activity_query_filters_by_subject_and_range() {
        let (app, _dir) = test_app();
        send(&app, post("/webhooks/lms", quiz_delivery())).await;

        let (status, body) = send(
            &app,
            Request::builder()
                .uri("/activity?subjects=S,other&from=2024-12-31T00:00:00Z&to=2025-01-02T00:00:00Z")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["count"], 1);
        assert_eq!(body["events"][0]["score_percent"], 85.0);

        let (_, body) = send(
            &app,
            Request::builder()
                .uri("/activity?subjects=S&from=2025-02-01T00:00:00Z")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(body["count"], 0);

        let (status, _) = send(&app, Request::builder().uri("/activity").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn csv_import_reports_counts_and_rejects_unknown_variants() {
        let (app, _dir) = test_app();
        send(&app, post("/webhooks/lms", quiz_delivery())).await;

        let csv = "User ID,Quiz ID,Course ID,Activity,% Score,Date Completed\nS,Q,C,Quiz,85,2025-01-01 00:03:00\n";
        let (status, body) = send(&app, post("/imports/csv?variant=lms_results", csv)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["inserted"], 0);
        assert_eq!(body["skipped_soft"], 1);
        assert_eq!(body["upload"]["content_hash"].as_str().map(str::len), Some(64));

        let (status, _) = send(&app, post("/imports/csv?variant=nope", csv)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn backfill_and_repair_triggers_return_reports() {
        let (app, _dir) = test_app();

        let (status, body) = send(&app, post("/backfill/g-1", Body::empty())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["subjects"], 1);
        assert_eq!(body["inserted"], 0);

        let request = Request::builder()
            .method("POST")
            .uri("/repairs/raw-payload")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(r#"{"fields": ["score_percent"]}"#))
            .unwrap();
        let (status, body) = send(&app, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["mode"], "raw_payload");
        assert_eq!(body["fields"][0], "score_percent");
    }
}
