use std::path::PathBuf;

use actlog_core::{EventKind, EventSource};
use actlog_sources::{
    parse_correction_csv, parse_csv, recover_fields, ColumnMappingTable, WebhookEnvelope,
};

fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures/lms")
        .join(name)
}

fn read(name: &str) -> String {
    std::fs::read_to_string(fixture(name)).expect("fixture")
}

#[test]
fn webhook_fixtures_parse_into_drafts() {
    for (name, kind) in [
        ("webhook_quiz_attempted.json", EventKind::QuizAttempted),
        ("webhook_lesson_completed.json", EventKind::LessonCompleted),
    ] {
        let envelope = WebhookEnvelope::parse_bytes(read(name).as_bytes()).expect("envelope");
        assert_eq!(envelope.event_kind(), Some(kind), "{name}");
        let draft = envelope.to_draft(kind).expect("draft");
        assert_eq!(draft.subject_id.as_deref(), Some("4417"));
        assert_eq!(draft.course_id.as_deref(), Some("120"));
        assert!(draft.content_id.is_some(), "{name}");
    }
}

#[test]
fn quiz_fixture_content_is_the_quiz_not_the_lesson() {
    let envelope = WebhookEnvelope::parse_bytes(read("webhook_quiz_attempted.json").as_bytes()).expect("envelope");
    let draft = envelope.to_draft(EventKind::QuizAttempted).expect("draft");
    assert_eq!(draft.content_id.as_deref(), Some("5501"));
    assert_eq!(draft.occurred_at.to_rfc3339(), "2025-01-01T00:00:00+00:00");

    let fields = recover_fields(
        EventSource::Webhook,
        &draft.raw_payload,
        &ColumnMappingTable::builtin().expect("mappings"),
    )
    .expect("recover");
    assert_eq!(fields, draft.fields);
}

#[test]
fn results_export_fixture_keeps_going_past_bad_rows() {
    let table = ColumnMappingTable::builtin().expect("mappings");
    let rows = parse_csv(&read("lms_results.csv"), table.variant("lms_results").expect("variant")).expect("parse");
    assert_eq!(rows.len(), 3);
    assert!(rows[0].is_ok());
    assert!(rows[1].is_ok());
    assert_eq!(rows[2].as_ref().expect_err("bad date").reference, "line 4");

    let first = rows[0].as_ref().expect("row");
    assert_eq!(first.stable_id, None);
    assert_eq!(first.content_id.as_deref(), Some("5501"));
}

#[test]
fn corrections_fixture_parses() {
    let table = ColumnMappingTable::builtin().expect("mappings");
    let rows = parse_correction_csv(&read("corrections.csv"), table.variant("quiz_corrections").expect("variant"))
        .expect("parse");
    let row = rows[0].as_ref().expect("row");
    assert_eq!(row.content_id, "5501");
    assert_eq!(row.fields.content_title.as_deref(), Some("Gears, levers and cams"));
}
