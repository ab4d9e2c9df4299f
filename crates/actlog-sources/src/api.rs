//! LMS read API: group membership and per-subject activity history.

use std::sync::Arc;

use actlog_core::{EventKind, EventSource, IngestError};
use actlog_storage::HttpFetcher;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tracing::debug;

use crate::{
    first_of, json_at, json_i32, json_id, json_str, json_timestamp, ActivityDraft, BackfillFeed,
    Candidate, CandidateError, FeedContext, RecoveredFields, SourceError, SourceStableId,
    SubjectRef,
};

/// Identifier namespace for LMS result ids. Spreadsheet exports of the same results share it.
pub const LMS_RESULT_ID_SPACE: &str = "lms-result";

const SOURCE_ID: &str = "lms_api";

#[derive(Debug, Clone)]
pub struct LmsApiConfig {
    pub base_url: String,
    pub page_size: usize,
}

impl LmsApiConfig {
    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path.trim_start_matches('/'))
    }
}

#[derive(Debug, Deserialize)]
struct ItemsPage {
    #[serde(default)]
    items: Vec<JsonValue>,
}

pub struct LmsApiFeed {
    http: Arc<HttpFetcher>,
    config: LmsApiConfig,
}

impl LmsApiFeed {
    pub fn new(http: Arc<HttpFetcher>, config: LmsApiConfig) -> Self {
        Self { http, config }
    }

    async fn fetch_items(&self, ctx: &FeedContext, path: &str, page: u32) -> Result<Vec<JsonValue>, SourceError> {
        let url = self.config.url(path);
        let query = [
            ("page", page.to_string()),
            ("limit", self.config.page_size.to_string()),
        ];
        let page: ItemsPage = self.http.fetch_json(ctx.run_id, SOURCE_ID, &url, &query).await?;
        Ok(page.items)
    }
}

#[async_trait]
impl BackfillFeed for LmsApiFeed {
    fn source(&self) -> EventSource {
        EventSource::BackfillApi
    }

    fn page_size(&self) -> usize {
        self.config.page_size
    }

    async fn list_subjects(&self, ctx: &FeedContext, group_id: &str) -> Result<Vec<SubjectRef>, SourceError> {
        let path = format!("groups/{group_id}/users");
        let mut subjects = Vec::new();
        let mut page = 1u32;
        loop {
            let items = self.fetch_items(ctx, &path, page).await?;
            let fetched = items.len();
            subjects.extend(items.iter().filter_map(parse_member));
            debug!(group_id, page, fetched, "listed group members");
            if fetched < self.config.page_size || fetched == 0 {
                break;
            }
            page += 1;
        }
        Ok(subjects)
    }

    async fn fetch_activity_page(
        &self,
        ctx: &FeedContext,
        subject: &SubjectRef,
        page: u32,
    ) -> Result<Vec<Candidate>, SourceError> {
        let path = format!("users/{}/activities", subject.id);
        let items = self.fetch_items(ctx, &path, page).await?;
        Ok(items
            .iter()
            .enumerate()
            .map(|(index, item)| {
                parse_activity_item(item, Some(subject)).map_err(|error| CandidateError {
                    reference: json_id(item, &["id"])
                        .map(|id| format!("result {id}"))
                        .unwrap_or_else(|| format!("subject {} page {page} item {index}", subject.id)),
                    error,
                })
            })
            .collect())
    }
}

pub fn parse_member(item: &JsonValue) -> Option<SubjectRef> {
    let id = json_id(item, &["id"])?;
    let name = [json_str(item, &["first_name"]), json_str(item, &["last_name"])]
        .into_iter()
        .flatten()
        .collect::<Vec<_>>()
        .join(" ");
    Some(SubjectRef {
        id,
        email: json_str(item, &["email"]),
        display_name: if name.is_empty() { json_str(item, &["full_name"]) } else { Some(name) },
    })
}

/// Parses one activity item. `subject` fills identity the item omits.
pub fn parse_activity_item(item: &JsonValue, subject: Option<&SubjectRef>) -> Result<ActivityDraft, IngestError> {
    let result_id = json_id(item, &["id"]);
    let reference = result_id
        .as_deref()
        .map(|id| format!("result {id}"))
        .unwrap_or_else(|| "result (no id)".to_string());

    let kind_text = first_of(item, &[&["kind"], &["event_type"], &["type"]], json_str)
        .ok_or_else(|| IngestError::Malformed(format!("{reference}: no activity kind")))?;
    let event_kind = EventKind::from_alias(&kind_text)
        .ok_or_else(|| IngestError::Malformed(format!("{reference}: unknown activity kind {kind_text:?}")))?;
    let occurred_at = first_of(item, &[&["occurred_at"], &["completed_at"], &["created_at"]], json_timestamp)
        .ok_or_else(|| IngestError::Malformed(format!("{reference}: no usable timestamp")))?;

    let draft = ActivityDraft {
        source: EventSource::BackfillApi,
        source_ref: reference,
        subject_id: json_id(item, &["user_id"]).or_else(|| subject.map(|s| s.id.clone())),
        subject_email: json_str(item, &["user_email"]).or_else(|| subject.and_then(|s| s.email.clone())),
        subject_name: subject.and_then(|s| s.display_name.clone()),
        event_kind,
        course_id: json_id(item, &["course_id"]),
        content_id: first_of(item, &[&["content_id"], &["quiz_id"], &["lesson_id"]], json_id),
        occurred_at,
        stable_id: result_id.map(|id| SourceStableId::new(LMS_RESULT_ID_SPACE, id)),
        fields: recover_item_fields(item),
        raw_payload: item.clone(),
    };
    draft.validate()?;
    Ok(draft)
}

pub fn recover_item_fields(item: &JsonValue) -> RecoveredFields {
    RecoveredFields {
        raw_score: [&["score"][..], &["grade"], &["percent_score"]]
            .iter()
            .find_map(|path| json_at(item, path))
            .cloned()
            .unwrap_or(JsonValue::Null),
        correct_count: json_i32(item, &["correct_count"]),
        incorrect_count: json_i32(item, &["incorrect_count"]),
        attempt_number: first_of(item, &[&["attempt"], &["attempt_number"]], json_i32),
        course_name: json_str(item, &["course_name"]),
        content_title: first_of(item, &[&["content_title"], &["quiz_name"], &["lesson_name"]], json_str),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use actlog_storage::HttpClientConfig;
    use axum::{
        extract::{Path, Query, State},
        routing::get,
        Json, Router,
    };
    use serde_json::json;
    use std::collections::HashMap;
    use uuid::Uuid;

    fn subject() -> SubjectRef {
        SubjectRef {
            id: "77".into(),
            email: Some("ada@example.com".into()),
            display_name: None,
        }
    }

    #[test]
    fn activity_items_inherit_subject_identity() {
        let item = json!({
            "id": 501,
            "kind": "quiz_attempted",
            "course_id": 9,
            "content_id": "q-3",
            "content_title": "Gears",
            "attempt": 1,
            "score": "85%",
            "occurred_at": "2025-01-01T00:00:00Z"
        });
        let draft = parse_activity_item(&item, Some(&subject())).expect("draft");
        assert_eq!(draft.subject_id.as_deref(), Some("77"));
        assert_eq!(draft.subject_email.as_deref(), Some("ada@example.com"));
        assert_eq!(draft.stable_id, Some(SourceStableId::new(LMS_RESULT_ID_SPACE, "501")));
        assert_eq!(draft.fields.raw_score, json!("85%"));
        assert_eq!(draft.source_ref, "result 501");
    }

    #[test]
    fn unknown_kinds_and_missing_timestamps_are_malformed() {
        let odd = json!({"id": 1, "kind": "badge_awarded", "occurred_at": "2025-01-01T00:00:00Z"});
        assert!(matches!(parse_activity_item(&odd, Some(&subject())), Err(IngestError::Malformed(_))));
        let undated = json!({"id": 2, "kind": "user_signin"});
        assert!(matches!(parse_activity_item(&undated, Some(&subject())), Err(IngestError::Malformed(_))));
    }

    #[test]
    fn members_need_an_id() {
        let member = parse_member(&json!({"id": 3, "email": "m@x.io", "first_name": "Mo"})).expect("member");
        assert_eq!(member.display_name.as_deref(), Some("Mo"));
        assert!(parse_member(&json!({"email": "no-id@x.io"})).is_none());
    }

    #[derive(Clone, Default)]
    struct Upstream {
        member_hits: Arc<AtomicUsize>,
    }

    async fn members(
        State(state): State<Upstream>,
        Path(group): Path<String>,
        Query(query): Query<HashMap<String, String>>,
    ) -> Json<JsonValue> {
        state.member_hits.fetch_add(1, Ordering::SeqCst);
        let page = query.get("page").and_then(|p| p.parse::<u32>().ok()).unwrap_or(1);
        let items = match (group.as_str(), page) {
            ("g1", 1) => json!([{"id": 1}, {"id": 2}]),
            ("g1", 2) => json!([{"id": 3}]),
            _ => json!([]),
        };
        Json(json!({ "items": items }))
    }

    async fn activities(Path(user): Path<String>) -> Json<JsonValue> {
        Json(json!({"items": [
            {"id": format!("{user}-1"), "kind": "user_signin", "occurred_at": "2025-01-02T00:00:00Z"},
            {"id": format!("{user}-2"), "kind": "nonsense", "occurred_at": "2025-01-02T00:00:00Z"}
        ]}))
    }

    async fn spawn_upstream(state: Upstream) -> String {
        let app = Router::new()
            .route("/groups/{group}/users", get(members))
            .route("/users/{user}/activities", get(activities))
            .with_state(state);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn feed_paginates_members_and_keeps_bad_items_as_errors() {
        let state = Upstream::default();
        let base_url = spawn_upstream(state.clone()).await;
        let http = Arc::new(HttpFetcher::new(HttpClientConfig::default()).expect("client"));
        let feed = LmsApiFeed::new(http, LmsApiConfig { base_url, page_size: 2 });
        let ctx = FeedContext { run_id: Uuid::new_v4() };

        let subjects = feed.list_subjects(&ctx, "g1").await.expect("members");
        assert_eq!(subjects.iter().map(|s| s.id.as_str()).collect::<Vec<_>>(), ["1", "2", "3"]);
        assert_eq!(state.member_hits.load(Ordering::SeqCst), 2);

        let page = feed.fetch_activity_page(&ctx, &subjects[0], 1).await.expect("page");
        assert_eq!(page.len(), 2);
        assert!(page[0].is_ok());
        let err = page[1].as_ref().expect_err("bad kind");
        assert_eq!(err.reference, "result 1-2");
    }
}
