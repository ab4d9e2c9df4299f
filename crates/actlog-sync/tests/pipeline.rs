use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use actlog_core::{EventKind, EventSource, RepairField};
use actlog_sources::{
    api::parse_activity_item, BackfillFeed, Candidate, CandidateError, FeedContext, SourceError, SubjectRef,
};
use actlog_storage::MemoryStore;
use actlog_sync::{ChannelCompletionHook, DeliveryOutcome, Engine, EngineConfig};
use async_trait::async_trait;
use serde_json::json;

fn fixture(name: &str) -> Vec<u8> {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures/lms")
        .join(name);
    std::fs::read(path).expect("fixture")
}

/// One member, one page holding the same quiz attempt the webhook fixture describes.
struct ReplayFeed;

#[async_trait]
impl BackfillFeed for ReplayFeed {
    fn source(&self) -> EventSource {
        EventSource::BackfillApi
    }

    fn page_size(&self) -> usize {
        10
    }

    async fn list_subjects(&self, _ctx: &FeedContext, _group_id: &str) -> Result<Vec<SubjectRef>, SourceError> {
        Ok(vec![SubjectRef {
            id: "4417".into(),
            email: Some("ada@example.com".into()),
            display_name: Some("Ada Lovelace".into()),
        }])
    }

    async fn fetch_activity_page(
        &self,
        _ctx: &FeedContext,
        subject: &SubjectRef,
        page: u32,
    ) -> Result<Vec<Candidate>, SourceError> {
        if page > 1 {
            return Ok(Vec::new());
        }
        let items = [
            json!({
                "id": 880021,
                "kind": "quiz_attempted",
                "course_id": 120,
                "content_id": 5501,
                "score": 0.85,
                "occurred_at": "2025-01-01T00:02:00Z"
            }),
            json!({
                "id": 880022,
                "kind": "lesson_completed",
                "course_id": 120,
                "content_id": 9001,
                "occurred_at": "2025-01-01T00:10:00Z"
            }),
        ];
        Ok(items
            .iter()
            .map(|item| {
                parse_activity_item(item, Some(subject)).map_err(|error| CandidateError {
                    reference: "item".into(),
                    error,
                })
            })
            .collect())
    }
}

struct Harness {
    engine: Engine,
    store: Arc<MemoryStore>,
    completions: tokio::sync::mpsc::UnboundedReceiver<uuid::Uuid>,
    dir: tempfile::TempDir,
}

fn harness() -> Harness {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = EngineConfig {
        archive_dir: dir.path().join("archive"),
        reports_dir: dir.path().join("reports"),
        repair_batch_delay_ms: 1,
        ..EngineConfig::default()
    };
    let store = Arc::new(MemoryStore::new());
    let (hook, completions) = ChannelCompletionHook::new();
    let engine = Engine::new(config, store.clone(), Arc::new(ReplayFeed), Arc::new(hook)).expect("engine");
    Harness {
        engine,
        store,
        completions,
        dir,
    }
}

#[tokio::test]
async fn webhook_then_spreadsheet_row_within_the_window_adds_nothing() {
    let mut h = harness();

    let outcome = h
        .engine
        .webhook_ingestor()
        .ingest_bytes(&fixture("webhook_quiz_attempted.json"))
        .await;
    assert_eq!(outcome, DeliveryOutcome::Recorded);

    let events = h.store.events().await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_kind, EventKind::QuizAttempted);
    assert_eq!(events[0].score_percent, Some(85.0));
    assert_eq!(events[0].subject_id.as_deref(), Some("4417"));
    let notified = tokio::time::timeout(Duration::from_secs(1), h.completions.recv())
        .await
        .expect("hook fired");
    assert_eq!(notified, Some(events[0].id));

    let report = h
        .engine
        .import_csv("lms_results", &fixture("lms_results.csv"))
        .await
        .expect("import");
    assert_eq!(report.total, 3);
    assert_eq!(report.inserted, 0);
    assert_eq!(report.skipped_soft, 1);
    assert_eq!(report.rejected, 2);
    assert_eq!(h.store.events().await.len(), 1);

    let upload = report.upload.as_ref().expect("upload summary");
    assert_eq!(upload.content_hash.len(), 64);
    assert!(h.dir.path().join("archive").join(&upload.archive_path).exists());
    let run_dir = h.dir.path().join("reports").join(report.run_id.to_string());
    assert!(run_dir.join("run_report.json").exists());
    assert!(run_dir.join("brief.md").exists());
}

#[tokio::test]
async fn backfill_after_webhook_only_adds_what_the_webhook_missed() {
    let h = harness();
    h.engine
        .webhook_ingestor()
        .ingest_bytes(&fixture("webhook_quiz_attempted.json"))
        .await;

    let first = h.engine.run_backfill("g-1").await.expect("backfill");
    assert_eq!(first.skipped_soft, 1);
    assert_eq!(first.inserted, 1);

    let second = h.engine.run_backfill("g-1").await.expect("backfill again");
    assert_eq!(second.inserted, 0);
    assert_eq!(second.skipped_soft + second.skipped_exact, 2);

    let events = h.store.events().await;
    assert_eq!(events.len(), 2);
    assert!(events.iter().any(|e| e.event_kind == EventKind::LessonCompleted && e.source == EventSource::BackfillApi));
}

#[tokio::test]
async fn unknown_webhook_kind_is_logged_not_recorded() {
    let h = harness();
    let body = json!({"id": "x-1", "resource": "badge", "action": "awarded", "payload": {"user": {"id": 1}}});

    let outcome = h.engine.webhook_ingestor().ingest(&body).await;
    assert_eq!(outcome, DeliveryOutcome::SkippedUnrecognizedKind);
    assert_eq!(h.store.raw_logs().await.len(), 1);
    assert!(h.store.events().await.is_empty());
}

#[tokio::test]
async fn repairs_leave_populated_fields_alone() {
    let h = harness();
    h.engine
        .webhook_ingestor()
        .ingest_bytes(&fixture("webhook_quiz_attempted.json"))
        .await;
    let before = h.store.events().await;

    let raw = h.engine.repair_raw_payloads(&RepairField::ALL).await.expect("raw repair");
    assert_eq!(raw.repaired, 0);

    let corrections = h
        .engine
        .repair_from_corrections("quiz_corrections", &fixture("corrections.csv"))
        .await
        .expect("corrections");
    assert_eq!(corrections.unmatched, 0);
    assert_eq!(corrections.repaired, 0);
    assert_eq!(corrections.unchanged, 1);

    assert_eq!(h.store.events().await, before);
}
