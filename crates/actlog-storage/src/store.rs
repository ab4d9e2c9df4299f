//! The canonical event store seam.
//!
//! The backing store only offers per-record filter/create/update. Uniqueness by dedupe key
//! is the one invariant a store enforces on its own; everything else is read-before-write
//! in the callers.

use std::collections::{BTreeMap, HashMap};

use actlog_core::{
    subject_key, ActivityEvent, DedupeKey, EventKind, EventPatch, EventSource, RawSourceLog,
    RepairField, SubjectProfile,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record not found: {0}")]
    NotFound(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("corrupt record {id}: {reason}")]
    Corrupt { id: String, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    /// Another record already holds the dedupe key.
    DuplicateKey(Uuid),
}

/// Conjunctive filter over stored events. Results are ordered by id so that `after_id`
/// works as a cursor.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// Matches the subject id, or the lower-cased email of records without one.
    pub subject_keys: Vec<String>,
    pub event_kind: Option<EventKind>,
    pub content_id: Option<String>,
    pub course_id: Option<String>,
    pub sources: Vec<EventSource>,
    pub occurred_from: Option<DateTime<Utc>>,
    pub occurred_to: Option<DateTime<Utc>>,
    /// Matches records where at least one of these fields is null.
    pub missing_any: Vec<RepairField>,
    pub after_id: Option<Uuid>,
    pub limit: Option<usize>,
}

impl EventFilter {
    pub fn matches(&self, event: &ActivityEvent) -> bool {
        if !self.subject_keys.is_empty() {
            let by_id = event
                .subject_id
                .as_deref()
                .is_some_and(|id| self.subject_keys.iter().any(|k| k == id));
            let by_email = event
                .subject_email
                .as_deref()
                .map(|e| e.to_ascii_lowercase())
                .is_some_and(|e| self.subject_keys.iter().any(|k| *k == e));
            if !by_id && !by_email {
                return false;
            }
        }
        if self.event_kind.is_some_and(|k| k != event.event_kind) {
            return false;
        }
        if self.content_id.is_some() && self.content_id != event.content_id {
            return false;
        }
        if self.course_id.is_some() && self.course_id != event.course_id {
            return false;
        }
        if !self.sources.is_empty() && !self.sources.contains(&event.source) {
            return false;
        }
        if self.occurred_from.is_some_and(|from| event.occurred_at < from) {
            return false;
        }
        if self.occurred_to.is_some_and(|to| event.occurred_at > to) {
            return false;
        }
        if !self.missing_any.is_empty() && !self.missing_any.iter().any(|f| f.is_null_on(event)) {
            return false;
        }
        if self.after_id.is_some_and(|after| event.id <= after) {
            return false;
        }
        true
    }
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn find_event_by_key(&self, key: &DedupeKey) -> Result<Option<ActivityEvent>, StoreError>;

    async fn filter_events(&self, filter: &EventFilter) -> Result<Vec<ActivityEvent>, StoreError>;

    async fn create_event(&self, event: &ActivityEvent) -> Result<CreateOutcome, StoreError>;

    /// Fills only the fields of the stored record that are still null and returns them.
    async fn fill_event_nulls(&self, id: Uuid, patch: &EventPatch) -> Result<Vec<RepairField>, StoreError>;

    async fn raw_log_exists(&self, delivery_id: &str) -> Result<bool, StoreError>;

    async fn append_raw_log(&self, entry: &RawSourceLog) -> Result<(), StoreError>;

    async fn upsert_subject_profile(&self, profile: &SubjectProfile) -> Result<(), StoreError>;

    async fn find_subject_by_email(&self, email: &str) -> Result<Option<SubjectProfile>, StoreError>;

    async fn get_subject(&self, subject_id: &str) -> Result<Option<SubjectProfile>, StoreError>;
}

/// Newer sightings replace identity details; older ones only fill gaps.
pub fn merge_profile(existing: &SubjectProfile, incoming: &SubjectProfile) -> SubjectProfile {
    let newer = incoming.last_seen_at >= existing.last_seen_at;
    let pick = |a: &Option<String>, b: &Option<String>| -> Option<String> {
        let (first, second) = if newer { (b, a) } else { (a, b) };
        first.clone().or_else(|| second.clone())
    };
    SubjectProfile {
        subject_id: existing.subject_id.clone(),
        email: pick(&existing.email, &incoming.email),
        display_name: pick(&existing.display_name, &incoming.display_name),
        last_seen_at: existing.last_seen_at.max(incoming.last_seen_at),
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    events: BTreeMap<Uuid, ActivityEvent>,
    keys: HashMap<DedupeKey, Uuid>,
    raw_logs: Vec<RawSourceLog>,
    profiles: HashMap<String, SubjectProfile>,
}

/// In-process store used by tests and by runs without a database.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<ActivityEvent> {
        self.state.lock().await.events.values().cloned().collect()
    }

    pub async fn raw_logs(&self) -> Vec<RawSourceLog> {
        self.state.lock().await.raw_logs.clone()
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn find_event_by_key(&self, key: &DedupeKey) -> Result<Option<ActivityEvent>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.keys.get(key).and_then(|id| state.events.get(id)).cloned())
    }

    async fn filter_events(&self, filter: &EventFilter) -> Result<Vec<ActivityEvent>, StoreError> {
        let state = self.state.lock().await;
        let limit = filter.limit.unwrap_or(usize::MAX);
        Ok(state
            .events
            .values()
            .filter(|e| filter.matches(e))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn create_event(&self, event: &ActivityEvent) -> Result<CreateOutcome, StoreError> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state.keys.get(&event.dedupe_key) {
            return Ok(CreateOutcome::DuplicateKey(*existing));
        }
        state.keys.insert(event.dedupe_key.clone(), event.id);
        state.events.insert(event.id, event.clone());
        Ok(CreateOutcome::Created)
    }

    async fn fill_event_nulls(&self, id: Uuid, patch: &EventPatch) -> Result<Vec<RepairField>, StoreError> {
        let mut state = self.state.lock().await;
        let event = state
            .events
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        Ok(patch.fill_nulls(event))
    }

    async fn raw_log_exists(&self, delivery_id: &str) -> Result<bool, StoreError> {
        let state = self.state.lock().await;
        Ok(state.raw_logs.iter().any(|r| r.delivery_id == delivery_id))
    }

    async fn append_raw_log(&self, entry: &RawSourceLog) -> Result<(), StoreError> {
        self.state.lock().await.raw_logs.push(entry.clone());
        Ok(())
    }

    async fn upsert_subject_profile(&self, profile: &SubjectProfile) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let merged = match state.profiles.get(&profile.subject_id) {
            Some(existing) => merge_profile(existing, profile),
            None => profile.clone(),
        };
        state.profiles.insert(profile.subject_id.clone(), merged);
        Ok(())
    }

    async fn find_subject_by_email(&self, email: &str) -> Result<Option<SubjectProfile>, StoreError> {
        let Some(wanted) = subject_key(None, Some(email)) else {
            return Ok(None);
        };
        let wanted = Some(wanted);
        let state = self.state.lock().await;
        Ok(state
            .profiles
            .values()
            .filter(|p| p.email.as_deref().map(|e| e.to_ascii_lowercase()) == wanted)
            .max_by_key(|p| p.last_seen_at)
            .cloned())
    }

    async fn get_subject(&self, subject_id: &str) -> Result<Option<SubjectProfile>, StoreError> {
        Ok(self.state.lock().await.profiles.get(subject_id).cloned())
    }
}
