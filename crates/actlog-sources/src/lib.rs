//! Source adapters: webhook envelopes, the LMS read API and spreadsheet imports.
//!
//! Every adapter hands the reconciler the same [`ActivityDraft`] contract; scores stay raw
//! until the sync layer normalizes them.

use actlog_core::{
    subject_key, EventKind, EventPatch, EventSource, IngestError, RawScore, ScoreNormalizer,
    StableId,
};
use actlog_storage::FetchError;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

pub mod api;
pub mod csv_import;
pub mod webhook;

pub use api::{LmsApiConfig, LmsApiFeed, LMS_RESULT_ID_SPACE};
pub use csv_import::{parse_correction_csv, parse_csv, ColumnMappingTable, ColumnVariant, CorrectionRow, CsvField};
pub use webhook::{WebhookEnvelope, WEBHOOK_ID_SPACE};

pub const CRATE_NAME: &str = "actlog-sources";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
    #[error("column mapping: {0}")]
    Mapping(String),
    #[error(transparent)]
    Ingest(#[from] IngestError),
}

impl From<SourceError> for IngestError {
    fn from(err: SourceError) -> Self {
        match err {
            SourceError::Fetch(fetch) => fetch.into(),
            SourceError::Ingest(inner) => inner,
            SourceError::Csv(_) | SourceError::Mapping(_) => IngestError::Malformed(err.to_string()),
            SourceError::Message(message) => IngestError::Internal(message),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceStableId {
    pub space: Option<String>,
    pub id: String,
}

impl SourceStableId {
    pub fn new(space: &str, id: impl Into<String>) -> Self {
        Self {
            space: Some(space.to_string()),
            id: id.into(),
        }
    }
}

/// Pre-normalized handoff contract from adapters into the ingestion pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityDraft {
    pub source: EventSource,
    /// Human-readable pointer back to the origin (delivery id, result id, CSV line).
    pub source_ref: String,
    pub subject_id: Option<String>,
    pub subject_email: Option<String>,
    pub subject_name: Option<String>,
    pub event_kind: EventKind,
    pub course_id: Option<String>,
    pub content_id: Option<String>,
    pub occurred_at: DateTime<Utc>,
    pub stable_id: Option<SourceStableId>,
    pub fields: RecoveredFields,
    pub raw_payload: JsonValue,
}

impl ActivityDraft {
    pub fn stable_id(&self) -> Option<StableId<'_>> {
        self.stable_id.as_ref().map(|s| StableId {
            space: s.space.as_deref(),
            id: &s.id,
        })
    }

    pub fn subject_key(&self) -> Option<String> {
        subject_key(self.subject_id.as_deref(), self.subject_email.as_deref())
    }

    /// Per-kind required fields. A draft that fails here is dropped whole.
    pub fn validate(&self) -> Result<(), IngestError> {
        if self.subject_key().is_none() {
            return Err(IngestError::UnresolvedIdentity(format!(
                "{}: no subject id or email",
                self.source_ref
            )));
        }
        let missing = match self.event_kind {
            EventKind::LessonCompleted | EventKind::QuizAttempted if self.content_id.is_none() => {
                Some("content id")
            }
            EventKind::EnrollmentCreated if self.course_id.is_none() => Some("course id"),
            _ => None,
        };
        match missing {
            Some(field) => Err(IngestError::Malformed(format!(
                "{}: {} requires a {field}",
                self.source_ref, self.event_kind
            ))),
            None => Ok(()),
        }
    }
}

/// Values for the non-identity fields of an event, as a source reported them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecoveredFields {
    pub raw_score: JsonValue,
    pub correct_count: Option<i32>,
    pub incorrect_count: Option<i32>,
    pub attempt_number: Option<i32>,
    pub course_name: Option<String>,
    pub content_title: Option<String>,
}

impl RecoveredFields {
    pub fn into_patch(self, normalizer: &ScoreNormalizer) -> EventPatch {
        EventPatch {
            score_percent: normalizer.normalize(RawScore::from_json(&self.raw_score)),
            correct_count: self.correct_count,
            incorrect_count: self.incorrect_count,
            attempt_number: self.attempt_number,
            course_name: self.course_name,
            content_title: self.content_title,
        }
    }
}

/// One candidate that could not be turned into a draft.
#[derive(Debug)]
pub struct CandidateError {
    pub reference: String,
    pub error: IngestError,
}

pub type Candidate = Result<ActivityDraft, CandidateError>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubjectRef {
    pub id: String,
    pub email: Option<String>,
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedContext {
    pub run_id: Uuid,
}

/// A paginated upstream that can be replayed per group and per subject.
#[async_trait]
pub trait BackfillFeed: Send + Sync {
    fn source(&self) -> EventSource;

    fn page_size(&self) -> usize;

    async fn list_subjects(&self, ctx: &FeedContext, group_id: &str) -> Result<Vec<SubjectRef>, SourceError>;

    async fn fetch_activity_page(
        &self,
        ctx: &FeedContext,
        subject: &SubjectRef,
        page: u32,
    ) -> Result<Vec<Candidate>, SourceError>;
}

/// Re-extracts the repairable fields from a stored raw payload, using the parser of the
/// path that produced it.
pub fn recover_fields(
    source: EventSource,
    raw_payload: &JsonValue,
    mappings: &ColumnMappingTable,
) -> Result<RecoveredFields, SourceError> {
    match source {
        EventSource::Webhook => {
            let envelope = WebhookEnvelope::parse(raw_payload)?;
            Ok(webhook::recover_payload_fields(&envelope.payload))
        }
        EventSource::BackfillApi => Ok(api::recover_item_fields(raw_payload)),
        EventSource::CsvImport => csv_import::recover_row_fields(raw_payload, mappings),
        EventSource::Repair => Err(SourceError::Message(
            "repair-sourced records carry no parseable payload".to_string(),
        )),
    }
}

pub(crate) fn json_at<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a JsonValue> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    if cur.is_null() {
        None
    } else {
        Some(cur)
    }
}

pub(crate) fn json_str(value: &JsonValue, path: &[&str]) -> Option<String> {
    json_at(value, path)
        .and_then(|v| v.as_str())
        .and_then(text_or_none)
}

/// Identifiers arrive as strings or numbers depending on the source.
pub(crate) fn json_id(value: &JsonValue, path: &[&str]) -> Option<String> {
    match json_at(value, path)? {
        JsonValue::String(s) => text_or_none(s),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

pub(crate) fn json_i32(value: &JsonValue, path: &[&str]) -> Option<i32> {
    match json_at(value, path)? {
        JsonValue::Number(n) => n.as_i64().and_then(|v| i32::try_from(v).ok()),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub(crate) fn json_timestamp(value: &JsonValue, path: &[&str]) -> Option<DateTime<Utc>> {
    match json_at(value, path)? {
        JsonValue::String(s) => DateTime::parse_from_rfc3339(s.trim())
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        JsonValue::Number(n) => n.as_i64().and_then(|secs| Utc.timestamp_opt(secs, 0).single()),
        _ => None,
    }
}

pub(crate) fn first_of<T>(value: &JsonValue, paths: &[&[&str]], get: fn(&JsonValue, &[&str]) -> Option<T>) -> Option<T> {
    paths.iter().find_map(|path| get(value, path))
}

pub(crate) fn text_or_none(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}
