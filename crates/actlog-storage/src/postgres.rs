//! Postgres-backed record store.

use actlog_core::{
    subject_key, ActivityEvent, DedupeKey, EventKind, EventPatch, EventSource, RawSourceLog,
    RepairField, SubjectProfile,
};
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, QueryBuilder, Row};
use uuid::Uuid;

use crate::store::{CreateOutcome, EventFilter, RecordStore, StoreError};

const EVENT_COLUMNS: &str = "id, subject_id, subject_email, event_kind, course_id, course_name, \
     content_id, content_title, attempt_number, score_percent, correct_count, incorrect_count, \
     occurred_at, source, dedupe_key, raw_payload, recorded_at";

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }
}

fn repair_column(field: RepairField) -> &'static str {
    field.as_str()
}

fn corrupt(id: &str, reason: impl Into<String>) -> StoreError {
    StoreError::Corrupt {
        id: id.to_string(),
        reason: reason.into(),
    }
}

fn event_from_row(row: &PgRow) -> Result<ActivityEvent, StoreError> {
    let id: Uuid = row.try_get("id")?;
    let id_text = id.to_string();
    let kind: String = row.try_get("event_kind")?;
    let source: String = row.try_get("source")?;
    let key: String = row.try_get("dedupe_key")?;
    Ok(ActivityEvent {
        id,
        subject_id: row.try_get("subject_id")?,
        subject_email: row.try_get("subject_email")?,
        event_kind: EventKind::from_alias(&kind)
            .ok_or_else(|| corrupt(&id_text, format!("unknown event_kind {kind}")))?,
        course_id: row.try_get("course_id")?,
        course_name: row.try_get("course_name")?,
        content_id: row.try_get("content_id")?,
        content_title: row.try_get("content_title")?,
        attempt_number: row.try_get("attempt_number")?,
        score_percent: row.try_get("score_percent")?,
        correct_count: row.try_get("correct_count")?,
        incorrect_count: row.try_get("incorrect_count")?,
        occurred_at: row.try_get("occurred_at")?,
        source: EventSource::parse(&source)
            .ok_or_else(|| corrupt(&id_text, format!("unknown source {source}")))?,
        dedupe_key: DedupeKey::parse(&key).map_err(|e| corrupt(&id_text, e.to_string()))?,
        raw_payload: row.try_get("raw_payload")?,
        recorded_at: row.try_get("recorded_at")?,
    })
}

fn profile_from_row(row: &PgRow) -> Result<SubjectProfile, StoreError> {
    Ok(SubjectProfile {
        subject_id: row.try_get("subject_id")?,
        email: row.try_get("email")?,
        display_name: row.try_get("display_name")?,
        last_seen_at: row.try_get("last_seen_at")?,
    })
}

fn push_filter(qb: &mut QueryBuilder<'_, Postgres>, filter: &EventFilter) {
    qb.push(" WHERE TRUE");
    if !filter.subject_keys.is_empty() {
        qb.push(" AND (subject_id = ANY(")
            .push_bind(filter.subject_keys.clone())
            .push(") OR lower(subject_email) = ANY(")
            .push_bind(filter.subject_keys.clone())
            .push("))");
    }
    if let Some(kind) = filter.event_kind {
        qb.push(" AND event_kind = ").push_bind(kind.as_str());
    }
    if let Some(content_id) = &filter.content_id {
        qb.push(" AND content_id = ").push_bind(content_id.clone());
    }
    if let Some(course_id) = &filter.course_id {
        qb.push(" AND course_id = ").push_bind(course_id.clone());
    }
    if !filter.sources.is_empty() {
        let sources = filter
            .sources
            .iter()
            .map(|s| s.as_str().to_string())
            .collect::<Vec<_>>();
        qb.push(" AND source = ANY(").push_bind(sources).push(")");
    }
    if let Some(from) = filter.occurred_from {
        qb.push(" AND occurred_at >= ").push_bind(from);
    }
    if let Some(to) = filter.occurred_to {
        qb.push(" AND occurred_at <= ").push_bind(to);
    }
    if !filter.missing_any.is_empty() {
        let clause = filter
            .missing_any
            .iter()
            .map(|f| format!("{} IS NULL", repair_column(*f)))
            .collect::<Vec<_>>()
            .join(" OR ");
        qb.push(" AND (").push(clause).push(")");
    }
    if let Some(after) = filter.after_id {
        qb.push(" AND id > ").push_bind(after);
    }
    qb.push(" ORDER BY id");
    if let Some(limit) = filter.limit {
        qb.push(" LIMIT ").push_bind(limit as i64);
    }
}

#[async_trait]
impl RecordStore for PgStore {
    async fn find_event_by_key(&self, key: &DedupeKey) -> Result<Option<ActivityEvent>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS} FROM activity_events WHERE dedupe_key = $1"
        ))
        .bind(key.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(event_from_row).transpose()
    }

    async fn filter_events(&self, filter: &EventFilter) -> Result<Vec<ActivityEvent>, StoreError> {
        let mut qb = QueryBuilder::<Postgres>::new(format!("SELECT {EVENT_COLUMNS} FROM activity_events"));
        push_filter(&mut qb, filter);
        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(event_from_row).collect()
    }

    async fn create_event(&self, event: &ActivityEvent) -> Result<CreateOutcome, StoreError> {
        let key = event.dedupe_key.to_string();
        let inserted = sqlx::query(
            r#"
            INSERT INTO activity_events (
                id, subject_id, subject_email, event_kind, course_id, course_name,
                content_id, content_title, attempt_number, score_percent, correct_count,
                incorrect_count, occurred_at, source, dedupe_key, raw_payload, recorded_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            ON CONFLICT (dedupe_key) DO NOTHING
            "#,
        )
        .bind(event.id)
        .bind(&event.subject_id)
        .bind(&event.subject_email)
        .bind(event.event_kind.as_str())
        .bind(&event.course_id)
        .bind(&event.course_name)
        .bind(&event.content_id)
        .bind(&event.content_title)
        .bind(event.attempt_number)
        .bind(event.score_percent)
        .bind(event.correct_count)
        .bind(event.incorrect_count)
        .bind(event.occurred_at)
        .bind(event.source.as_str())
        .bind(&key)
        .bind(&event.raw_payload)
        .bind(event.recorded_at)
        .execute(&self.pool)
        .await?;

        if inserted.rows_affected() == 1 {
            return Ok(CreateOutcome::Created);
        }
        let existing: Uuid = sqlx::query_scalar("SELECT id FROM activity_events WHERE dedupe_key = $1")
            .bind(&key)
            .fetch_one(&self.pool)
            .await?;
        Ok(CreateOutcome::DuplicateKey(existing))
    }

    async fn fill_event_nulls(&self, id: Uuid, patch: &EventPatch) -> Result<Vec<RepairField>, StoreError> {
        let row = sqlx::query(&format!("SELECT {EVENT_COLUMNS} FROM activity_events WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        let mut current = event_from_row(&row)?;
        let filled = patch.fill_nulls(&mut current);
        if filled.is_empty() {
            return Ok(filled);
        }

        // COALESCE keeps the fill-only guarantee even if another writer got there first.
        sqlx::query(
            r#"
            UPDATE activity_events
               SET score_percent = COALESCE(score_percent, $2),
                   correct_count = COALESCE(correct_count, $3),
                   incorrect_count = COALESCE(incorrect_count, $4),
                   attempt_number = COALESCE(attempt_number, $5),
                   course_name = COALESCE(course_name, $6),
                   content_title = COALESCE(content_title, $7)
             WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(patch.score_percent)
        .bind(patch.correct_count)
        .bind(patch.incorrect_count)
        .bind(patch.attempt_number)
        .bind(&patch.course_name)
        .bind(&patch.content_title)
        .execute(&self.pool)
        .await?;
        Ok(filled)
    }

    async fn raw_log_exists(&self, delivery_id: &str) -> Result<bool, StoreError> {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM raw_source_log WHERE delivery_id = $1)")
                .bind(delivery_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(exists)
    }

    async fn append_raw_log(&self, entry: &RawSourceLog) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO raw_source_log (delivery_id, topic, body, received_at)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(&entry.delivery_id)
        .bind(&entry.topic)
        .bind(&entry.body)
        .bind(entry.received_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upsert_subject_profile(&self, profile: &SubjectProfile) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO subject_profiles (subject_id, email, display_name, last_seen_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (subject_id) DO UPDATE SET
                email = CASE WHEN EXCLUDED.last_seen_at >= subject_profiles.last_seen_at
                             THEN COALESCE(EXCLUDED.email, subject_profiles.email)
                             ELSE COALESCE(subject_profiles.email, EXCLUDED.email) END,
                display_name = CASE WHEN EXCLUDED.last_seen_at >= subject_profiles.last_seen_at
                             THEN COALESCE(EXCLUDED.display_name, subject_profiles.display_name)
                             ELSE COALESCE(subject_profiles.display_name, EXCLUDED.display_name) END,
                last_seen_at = GREATEST(subject_profiles.last_seen_at, EXCLUDED.last_seen_at)
            "#,
        )
        .bind(&profile.subject_id)
        .bind(&profile.email)
        .bind(&profile.display_name)
        .bind(profile.last_seen_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_subject_by_email(&self, email: &str) -> Result<Option<SubjectProfile>, StoreError> {
        let Some(wanted) = subject_key(None, Some(email)) else {
            return Ok(None);
        };
        let row = sqlx::query(
            r#"
            SELECT subject_id, email, display_name, last_seen_at
              FROM subject_profiles
             WHERE lower(email) = $1
             ORDER BY last_seen_at DESC
             LIMIT 1
            "#,
        )
        .bind(wanted)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(profile_from_row).transpose()
    }

    async fn get_subject(&self, subject_id: &str) -> Result<Option<SubjectProfile>, StoreError> {
        let row = sqlx::query(
            "SELECT subject_id, email, display_name, last_seen_at FROM subject_profiles WHERE subject_id = $1",
        )
        .bind(subject_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(profile_from_row).transpose()
    }
}
