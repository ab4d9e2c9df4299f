//! Core domain model for the learning activity ledger.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

pub mod dedupe;
pub mod score;

pub use dedupe::{derive_dedupe_key, strong_key, DedupeKey, KeyInput, StableId};
pub use score::{normalize_score, RawScore, ScoreNormalizer};

pub const CRATE_NAME: &str = "actlog-core";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Canonical event vocabulary. Source-specific spellings are mapped onto this set at
/// ingestion time and never stored raw.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    LessonCompleted,
    QuizAttempted,
    UserSignin,
    UserSignup,
    EnrollmentCreated,
}

impl EventKind {
    pub const ALL: [EventKind; 5] = [
        EventKind::LessonCompleted,
        EventKind::QuizAttempted,
        EventKind::UserSignin,
        EventKind::UserSignup,
        EventKind::EnrollmentCreated,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::LessonCompleted => "lesson_completed",
            EventKind::QuizAttempted => "quiz_attempted",
            EventKind::UserSignin => "user_signin",
            EventKind::UserSignup => "user_signup",
            EventKind::EnrollmentCreated => "enrollment_created",
        }
    }

    /// Accepts dotted (`quiz.attempted`), underscored, camel-cased and spaced spellings.
    pub fn from_alias(raw: &str) -> Option<Self> {
        match normalize_alias(raw).as_str() {
            "lesson_completed" | "lesson_complete" => Some(EventKind::LessonCompleted),
            "quiz_attempted" | "quiz_attempt" => Some(EventKind::QuizAttempted),
            "user_signin" | "user_sign_in" | "user_signed_in" => Some(EventKind::UserSignin),
            "user_signup" | "user_sign_up" | "user_signed_up" => Some(EventKind::UserSignup),
            "enrollment_created" | "enrollment_create" => Some(EventKind::EnrollmentCreated),
            _ => None,
        }
    }

    pub fn from_resource_action(resource: &str, action: &str) -> Option<Self> {
        Self::from_alias(&format!("{resource}_{action}"))
    }

    /// Kinds that describe interaction with a specific lesson or quiz.
    pub fn is_content_activity(&self) -> bool {
        matches!(self, EventKind::LessonCompleted | EventKind::QuizAttempted)
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn normalize_alias(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len() + 4);
    let mut prev_lower = false;
    for ch in raw.trim().chars() {
        if ch.is_ascii_uppercase() && prev_lower {
            out.push('_');
        }
        prev_lower = ch.is_ascii_lowercase() || ch.is_ascii_digit();
        if ch.is_ascii_alphanumeric() {
            out.push(ch.to_ascii_lowercase());
        } else {
            out.push('_');
        }
    }
    out.split('_')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("_")
}

/// Provenance of a stored record.
///
/// Declaration order is precedence order: a source compares greater than every source
/// it outranks. Only the reconciler's soft-match step consults this ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    Repair,
    CsvImport,
    BackfillApi,
    Webhook,
}

impl EventSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventSource::Repair => "repair",
            EventSource::CsvImport => "csv_import",
            EventSource::BackfillApi => "backfill_api",
            EventSource::Webhook => "webhook",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "repair" => Some(EventSource::Repair),
            "csv_import" => Some(EventSource::CsvImport),
            "backfill_api" => Some(EventSource::BackfillApi),
            "webhook" => Some(EventSource::Webhook),
            _ => None,
        }
    }

    pub fn outranks(&self, other: EventSource) -> bool {
        *self > other
    }
}

impl std::fmt::Display for EventSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical persisted activity record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityEvent {
    pub id: Uuid,
    pub subject_id: Option<String>,
    pub subject_email: Option<String>,
    pub event_kind: EventKind,
    pub course_id: Option<String>,
    pub course_name: Option<String>,
    pub content_id: Option<String>,
    pub content_title: Option<String>,
    pub attempt_number: Option<i32>,
    pub score_percent: Option<f64>,
    pub correct_count: Option<i32>,
    pub incorrect_count: Option<i32>,
    pub occurred_at: DateTime<Utc>,
    pub source: EventSource,
    pub dedupe_key: DedupeKey,
    pub raw_payload: JsonValue,
    pub recorded_at: DateTime<Utc>,
}

impl ActivityEvent {
    /// Identity used for matching: the stable subject id, falling back to the email.
    pub fn subject_key(&self) -> Option<String> {
        subject_key(self.subject_id.as_deref(), self.subject_email.as_deref())
    }
}

/// Subject id when present, otherwise the lower-cased email.
pub fn subject_key(subject_id: Option<&str>, subject_email: Option<&str>) -> Option<String> {
    subject_id
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .or_else(|| {
            subject_email
                .map(|e| e.trim().to_ascii_lowercase())
                .filter(|e| !e.is_empty())
        })
}

/// Audit copy of an inbound webhook delivery, kept whether or not it produced an event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawSourceLog {
    pub delivery_id: String,
    pub topic: Option<String>,
    pub body: JsonValue,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubjectProfile {
    pub subject_id: String,
    pub email: Option<String>,
    pub display_name: Option<String>,
    pub last_seen_at: DateTime<Utc>,
}

/// Fields a repair job is allowed to fill. Identity fields are deliberately absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairField {
    ScorePercent,
    CorrectCount,
    IncorrectCount,
    AttemptNumber,
    CourseName,
    ContentTitle,
}

impl RepairField {
    pub const ALL: [RepairField; 6] = [
        RepairField::ScorePercent,
        RepairField::CorrectCount,
        RepairField::IncorrectCount,
        RepairField::AttemptNumber,
        RepairField::CourseName,
        RepairField::ContentTitle,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RepairField::ScorePercent => "score_percent",
            RepairField::CorrectCount => "correct_count",
            RepairField::IncorrectCount => "incorrect_count",
            RepairField::AttemptNumber => "attempt_number",
            RepairField::CourseName => "course_name",
            RepairField::ContentTitle => "content_title",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.as_str() == raw.trim())
    }

    pub fn is_null_on(&self, event: &ActivityEvent) -> bool {
        match self {
            RepairField::ScorePercent => event.score_percent.is_none(),
            RepairField::CorrectCount => event.correct_count.is_none(),
            RepairField::IncorrectCount => event.incorrect_count.is_none(),
            RepairField::AttemptNumber => event.attempt_number.is_none(),
            RepairField::CourseName => event.course_name.is_none(),
            RepairField::ContentTitle => event.content_title.is_none(),
        }
    }
}

/// Candidate values for a repair. Applying a patch only ever fills fields that are null.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventPatch {
    pub score_percent: Option<f64>,
    pub correct_count: Option<i32>,
    pub incorrect_count: Option<i32>,
    pub attempt_number: Option<i32>,
    pub course_name: Option<String>,
    pub content_title: Option<String>,
}

impl EventPatch {
    pub fn is_empty(&self) -> bool {
        self.score_percent.is_none()
            && self.correct_count.is_none()
            && self.incorrect_count.is_none()
            && self.attempt_number.is_none()
            && self.course_name.is_none()
            && self.content_title.is_none()
    }

    /// Drops every value that is not requested or whose target field is already set.
    pub fn restricted_to(mut self, fields: &[RepairField], event: &ActivityEvent) -> Self {
        let keep = |f: RepairField| fields.contains(&f) && f.is_null_on(event);
        if !keep(RepairField::ScorePercent) {
            self.score_percent = None;
        }
        if !keep(RepairField::CorrectCount) {
            self.correct_count = None;
        }
        if !keep(RepairField::IncorrectCount) {
            self.incorrect_count = None;
        }
        if !keep(RepairField::AttemptNumber) {
            self.attempt_number = None;
        }
        if !keep(RepairField::CourseName) {
            self.course_name = None;
        }
        if !keep(RepairField::ContentTitle) {
            self.content_title = None;
        }
        self
    }

    /// Fills null fields of `event`; returns the fields that changed.
    pub fn fill_nulls(&self, event: &mut ActivityEvent) -> Vec<RepairField> {
        let mut filled = Vec::new();
        fill(&mut event.score_percent, &self.score_percent, RepairField::ScorePercent, &mut filled);
        fill(&mut event.correct_count, &self.correct_count, RepairField::CorrectCount, &mut filled);
        fill(&mut event.incorrect_count, &self.incorrect_count, RepairField::IncorrectCount, &mut filled);
        fill(&mut event.attempt_number, &self.attempt_number, RepairField::AttemptNumber, &mut filled);
        fill(&mut event.course_name, &self.course_name, RepairField::CourseName, &mut filled);
        fill(&mut event.content_title, &self.content_title, RepairField::ContentTitle, &mut filled);
        filled
    }
}

fn fill<T: Clone>(slot: &mut Option<T>, value: &Option<T>, field: RepairField, filled: &mut Vec<RepairField>) {
    if slot.is_none() {
        if let Some(v) = value {
            *slot = Some(v.clone());
            filled.push(field);
        }
    }
}

/// Reporting taxonomy shared by every ingestion path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    MalformedInput,
    UnresolvedIdentity,
    DuplicateOccurrence,
    UpstreamTransient,
    UpstreamPermanent,
    AmbiguousRepairMatch,
    Internal,
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("malformed input: {0}")]
    Malformed(String),
    #[error("unresolved identity: {0}")]
    UnresolvedIdentity(String),
    #[error("upstream transient failure: {0}")]
    UpstreamTransient(String),
    #[error("upstream rejected request: {0}")]
    UpstreamPermanent(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl IngestError {
    pub fn class(&self) -> ErrorClass {
        match self {
            IngestError::Malformed(_) => ErrorClass::MalformedInput,
            IngestError::UnresolvedIdentity(_) => ErrorClass::UnresolvedIdentity,
            IngestError::UpstreamTransient(_) => ErrorClass::UpstreamTransient,
            IngestError::UpstreamPermanent(_) => ErrorClass::UpstreamPermanent,
            IngestError::Internal(_) => ErrorClass::Internal,
        }
    }
}
