//! Webhook delivery envelopes.
//!
//! Deliveries carry either a `resource`/`action` pair or a legacy dotted `topic`, plus an
//! inner `payload` object. Flat bodies without `payload` are read as their own payload.

use actlog_core::{EventKind, EventSource, IngestError};
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;

use crate::{
    first_of, json_at, json_i32, json_id, json_str, json_timestamp, ActivityDraft, RecoveredFields,
    SourceStableId,
};

/// Identifier namespace for delivery ids.
pub const WEBHOOK_ID_SPACE: &str = "webhook-delivery";

#[derive(Debug, Clone, PartialEq)]
pub struct WebhookEnvelope {
    pub delivery_id: String,
    pub resource: Option<String>,
    pub action: Option<String>,
    pub topic: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub payload: JsonValue,
    pub body: JsonValue,
}

impl WebhookEnvelope {
    pub fn parse(body: &JsonValue) -> Result<Self, IngestError> {
        if !body.is_object() {
            return Err(IngestError::Malformed("webhook body is not a JSON object".to_string()));
        }
        let delivery_id = first_of(body, &[&["id"], &["delivery_id"]], json_id)
            .ok_or_else(|| IngestError::Malformed("webhook body has no delivery id".to_string()))?;
        let payload = match body.get("payload") {
            Some(inner) if inner.is_object() => inner.clone(),
            _ => body.clone(),
        };

        Ok(Self {
            delivery_id,
            resource: json_str(body, &["resource"]),
            action: json_str(body, &["action"]),
            topic: json_str(body, &["topic"]),
            created_at: first_of(body, &[&["created_at"], &["timestamp"]], json_timestamp),
            payload,
            body: body.clone(),
        })
    }

    pub fn parse_bytes(bytes: &[u8]) -> Result<Self, IngestError> {
        let body: JsonValue = serde_json::from_slice(bytes)
            .map_err(|e| IngestError::Malformed(format!("webhook body is not JSON: {e}")))?;
        Self::parse(&body)
    }

    /// The topic as it is recorded in the raw log: `resource.action` when both are present.
    pub fn topic_label(&self) -> Option<String> {
        match (&self.resource, &self.action) {
            (Some(resource), Some(action)) => Some(format!("{resource}.{action}")),
            _ => self.topic.clone(),
        }
    }

    pub fn event_kind(&self) -> Option<EventKind> {
        if let (Some(resource), Some(action)) = (&self.resource, &self.action) {
            if let Some(kind) = EventKind::from_resource_action(resource, action) {
                return Some(kind);
            }
        }
        self.topic.as_deref().and_then(EventKind::from_alias)
    }

    /// Builds a validated draft for `kind`. The payload timestamp wins over the envelope's.
    pub fn to_draft(&self, kind: EventKind) -> Result<ActivityDraft, IngestError> {
        let payload = &self.payload;
        let occurred_at = first_of(
            payload,
            &[&["completed_at"], &["attempted_at"], &["occurred_at"], &["created_at"]],
            json_timestamp,
        )
        .or(self.created_at)
        .ok_or_else(|| {
            IngestError::Malformed(format!("delivery {} has no usable timestamp", self.delivery_id))
        })?;

        let draft = ActivityDraft {
            source: EventSource::Webhook,
            source_ref: format!("delivery {}", self.delivery_id),
            subject_id: first_of(payload, &[&["user", "id"], &["user_id"], &["student", "id"]], json_id),
            subject_email: first_of(
                payload,
                &[&["user", "email"], &["user_email"], &["email"], &["student", "email"]],
                json_str,
            ),
            subject_name: subject_name(payload),
            event_kind: kind,
            course_id: first_of(payload, &[&["course", "id"], &["course_id"]], json_id),
            content_id: content_id(payload, kind),
            occurred_at,
            stable_id: Some(SourceStableId::new(WEBHOOK_ID_SPACE, self.delivery_id.clone())),
            fields: recover_payload_fields(payload),
            raw_payload: self.body.clone(),
        };
        draft.validate()?;
        Ok(draft)
    }
}

fn content_id(payload: &JsonValue, kind: EventKind) -> Option<String> {
    match kind {
        EventKind::QuizAttempted => first_of(
            payload,
            &[&["quiz", "id"], &["quiz_id"], &["content_id"], &["lesson", "id"]],
            json_id,
        ),
        EventKind::LessonCompleted => first_of(
            payload,
            &[&["lesson", "id"], &["lesson_id"], &["content_id"], &["chapter", "id"]],
            json_id,
        ),
        _ => first_of(payload, &[&["content_id"]], json_id),
    }
}

fn subject_name(payload: &JsonValue) -> Option<String> {
    if let Some(full) = first_of(payload, &[&["user", "full_name"], &["user", "name"]], json_str) {
        return Some(full);
    }
    let parts = [
        json_str(payload, &["user", "first_name"]),
        json_str(payload, &["user", "last_name"]),
    ];
    let joined = parts.into_iter().flatten().collect::<Vec<_>>().join(" ");
    if joined.is_empty() {
        None
    } else {
        Some(joined)
    }
}

/// Non-identity values of a webhook payload.
pub fn recover_payload_fields(payload: &JsonValue) -> RecoveredFields {
    let raw_score = [&["grade"][..], &["score"], &["result", "grade"], &["percentage"]]
        .iter()
        .find_map(|path| json_at(payload, path))
        .cloned()
        .unwrap_or(JsonValue::Null);
    RecoveredFields {
        raw_score,
        correct_count: first_of(payload, &[&["correct_count"], &["result", "correct_count"]], json_i32),
        incorrect_count: first_of(
            payload,
            &[&["incorrect_count"], &["result", "incorrect_count"]],
            json_i32,
        ),
        attempt_number: first_of(payload, &[&["attempts"], &["attempt"], &["attempt_number"]], json_i32),
        course_name: first_of(payload, &[&["course", "name"], &["course_name"]], json_str),
        content_title: first_of(
            payload,
            &[
                &["quiz", "name"],
                &["quiz", "title"],
                &["lesson", "name"],
                &["lesson", "title"],
                &["content_title"],
            ],
            json_str,
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actlog_core::ErrorClass;
    use serde_json::json;

    fn quiz_delivery() -> JsonValue {
        json!({
            "id": "d-1001",
            "resource": "quiz",
            "action": "attempted",
            "created_at": "2025-01-01T00:00:05Z",
            "payload": {
                "user": {"id": 77, "email": "Ada@Example.com", "first_name": "Ada", "last_name": "Lovelace"},
                "course": {"id": 9, "name": "Intro to Engines"},
                "quiz": {"id": "q-3", "name": "Gears, levers and cams"},
                "attempts": 2,
                "grade": 0.85,
                "correct_count": 17,
                "incorrect_count": 3,
                "completed_at": "2025-01-01T00:00:00Z"
            }
        })
    }

    #[test]
    fn quiz_delivery_becomes_a_draft() {
        let envelope = WebhookEnvelope::parse(&quiz_delivery()).expect("parse");
        assert_eq!(envelope.delivery_id, "d-1001");
        assert_eq!(envelope.topic_label().as_deref(), Some("quiz.attempted"));
        let kind = envelope.event_kind().expect("kind");
        assert_eq!(kind, EventKind::QuizAttempted);

        let draft = envelope.to_draft(kind).expect("draft");
        assert_eq!(draft.subject_id.as_deref(), Some("77"));
        assert_eq!(draft.subject_name.as_deref(), Some("Ada Lovelace"));
        assert_eq!(draft.course_id.as_deref(), Some("9"));
        assert_eq!(draft.content_id.as_deref(), Some("q-3"));
        assert_eq!(draft.occurred_at.to_rfc3339(), "2025-01-01T00:00:00+00:00");
        assert_eq!(draft.fields.raw_score, json!(0.85));
        assert_eq!(draft.fields.attempt_number, Some(2));
        assert_eq!(draft.fields.content_title.as_deref(), Some("Gears, levers and cams"));
        assert_eq!(
            draft.stable_id,
            Some(SourceStableId::new(WEBHOOK_ID_SPACE, "d-1001"))
        );
    }

    #[test]
    fn legacy_topic_and_flat_body_are_accepted() {
        let body = json!({
            "delivery_id": 55,
            "topic": "user.signin",
            "timestamp": "2025-03-01T08:00:00Z",
            "user_email": "x@y.org"
        });
        let envelope = WebhookEnvelope::parse(&body).expect("parse");
        assert_eq!(envelope.delivery_id, "55");
        assert_eq!(envelope.event_kind(), Some(EventKind::UserSignin));
        let draft = envelope.to_draft(EventKind::UserSignin).expect("draft");
        assert_eq!(draft.subject_email.as_deref(), Some("x@y.org"));
        assert_eq!(draft.occurred_at.to_rfc3339(), "2025-03-01T08:00:00+00:00");
    }

    #[test]
    fn unknown_topics_have_no_kind() {
        let body = json!({"id": "d", "resource": "order", "action": "created"});
        let envelope = WebhookEnvelope::parse(&body).expect("parse");
        assert_eq!(envelope.event_kind(), None);
        assert_eq!(envelope.topic_label().as_deref(), Some("order.created"));
    }

    #[test]
    fn bodies_without_delivery_id_are_malformed() {
        let err = WebhookEnvelope::parse(&json!({"topic": "quiz.attempted"})).unwrap_err();
        assert_eq!(err.class(), ErrorClass::MalformedInput);
        let err = WebhookEnvelope::parse_bytes(b"not json").unwrap_err();
        assert_eq!(err.class(), ErrorClass::MalformedInput);
        assert!(WebhookEnvelope::parse(&json!([1, 2])).is_err());
    }

    #[test]
    fn missing_required_fields_reject_the_draft() {
        let body = json!({
            "id": "d-2",
            "resource": "enrollment",
            "action": "created",
            "created_at": "2025-01-01T00:00:00Z",
            "payload": {"user": {"id": 1}}
        });
        let envelope = WebhookEnvelope::parse(&body).expect("parse");
        let err = envelope.to_draft(EventKind::EnrollmentCreated).unwrap_err();
        assert_eq!(err.class(), ErrorClass::MalformedInput);

        let undated = json!({"id": "d-3", "topic": "user.signup", "payload": {"user": {"id": 1}}});
        let envelope = WebhookEnvelope::parse(&undated).expect("parse");
        assert!(envelope.to_draft(EventKind::UserSignup).is_err());
    }
}
