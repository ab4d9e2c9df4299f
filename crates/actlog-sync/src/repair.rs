//! Null-field repair over stored events.
//!
//! Values come either from the event's own raw payload, re-parsed by the extractor of the
//! path that produced it, or from a correction spreadsheet. Only null fields are filled.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use actlog_core::{subject_key, ActivityEvent, ErrorClass, IngestError, RepairField, ScoreNormalizer};
use actlog_sources::{recover_fields, CandidateError, ColumnMappingTable, CorrectionRow};
use actlog_storage::{EventFilter, RecordStore, StoreError};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::{error_lines, ErrorLog, MAX_REPORTED_ERRORS};

#[derive(Debug, Clone)]
pub struct RepairOptions {
    pub batch_size: usize,
    pub batch_delay: Duration,
    /// How far a stored record's `occurred_at` may sit from a correction's date.
    pub correction_window: chrono::Duration,
    pub max_reported_errors: usize,
}

impl Default for RepairOptions {
    fn default() -> Self {
        Self {
            batch_size: 50,
            batch_delay: Duration::from_millis(250),
            correction_window: chrono::Duration::hours(24),
            max_reported_errors: MAX_REPORTED_ERRORS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairMode {
    RawPayload,
    Corrections,
}

/// A correction that matched several records and was applied to the closest one.
#[derive(Debug, Clone, Serialize)]
pub struct AmbiguousResolution {
    pub reference: String,
    pub candidates: Vec<Uuid>,
    pub chosen: Uuid,
    pub distance_secs: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RepairReport {
    pub run_id: Uuid,
    pub mode: RepairMode,
    pub fields: Vec<RepairField>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub batches: usize,
    pub scanned: usize,
    pub repaired: usize,
    pub unchanged: usize,
    pub unmatched: usize,
    pub fields_filled: BTreeMap<String, usize>,
    pub ambiguous: Vec<AmbiguousResolution>,
    pub errors: ErrorLog,
}

impl RepairReport {
    fn new(mode: RepairMode, fields: &[RepairField], max_errors: usize) -> Self {
        let now = Utc::now();
        Self {
            run_id: Uuid::new_v4(),
            mode,
            fields: fields.to_vec(),
            started_at: now,
            finished_at: now,
            batches: 0,
            scanned: 0,
            repaired: 0,
            unchanged: 0,
            unmatched: 0,
            fields_filled: BTreeMap::new(),
            ambiguous: Vec::new(),
            errors: ErrorLog::with_limit(max_errors),
        }
    }

    fn record_fill(&mut self, filled: &[RepairField]) {
        if filled.is_empty() {
            self.unchanged += 1;
            return;
        }
        self.repaired += 1;
        for field in filled {
            *self.fields_filled.entry(field.as_str().to_string()).or_default() += 1;
        }
    }

    pub fn brief(&self) -> String {
        let filled = if self.fields_filled.is_empty() {
            "- none".to_string()
        } else {
            self.fields_filled
                .iter()
                .map(|(field, n)| format!("- {field}: {n}"))
                .collect::<Vec<_>>()
                .join("\n")
        };
        let ambiguous = if self.ambiguous.is_empty() {
            "- none".to_string()
        } else {
            self.ambiguous
                .iter()
                .map(|a| {
                    format!(
                        "- `{}`: {} candidates, chose {} ({}s away)",
                        a.reference,
                        a.candidates.len(),
                        a.chosen,
                        a.distance_secs
                    )
                })
                .collect::<Vec<_>>()
                .join("\n")
        };
        format!(
            "# Repair `{}`\n\n- Mode: {:?}\n- Started: {}\n- Finished: {}\n- Batches: {}\n\n\
             ## Counts\n- scanned: {}\n- repaired: {}\n- unchanged: {}\n- unmatched: {}\n\n\
             ## Fields filled\n{}\n\n## Ambiguous matches\n{}\n\n## Errors ({})\n{}\n",
            self.run_id,
            self.mode,
            self.started_at,
            self.finished_at,
            self.batches,
            self.scanned,
            self.repaired,
            self.unchanged,
            self.unmatched,
            filled,
            ambiguous,
            self.errors.total,
            error_lines(&self.errors),
        )
    }
}

fn internal(err: StoreError) -> IngestError {
    IngestError::Internal(err.to_string())
}

#[derive(Clone)]
pub struct RepairJob {
    store: Arc<dyn RecordStore>,
    normalizer: ScoreNormalizer,
    mappings: Arc<ColumnMappingTable>,
    options: RepairOptions,
}

impl RepairJob {
    pub fn new(
        store: Arc<dyn RecordStore>,
        normalizer: ScoreNormalizer,
        mappings: Arc<ColumnMappingTable>,
        options: RepairOptions,
    ) -> Self {
        Self {
            store,
            normalizer,
            mappings,
            options,
        }
    }

    /// Walks every record missing one of `fields` (all repairable fields when empty) in id
    /// order, one batch at a time.
    pub async fn repair_from_raw_payloads(&self, fields: &[RepairField]) -> Result<RepairReport> {
        let fields = if fields.is_empty() { RepairField::ALL.to_vec() } else { fields.to_vec() };
        let mut report = RepairReport::new(RepairMode::RawPayload, &fields, self.options.max_reported_errors);
        let span = info_span!("repair_raw_payload", run_id = %report.run_id);
        let batch_size = self.options.batch_size.max(1);

        let mut after_id = None;
        loop {
            let filter = EventFilter {
                missing_any: fields.clone(),
                after_id,
                limit: Some(batch_size),
                ..Default::default()
            };
            let batch = self
                .store
                .filter_events(&filter)
                .instrument(span.clone())
                .await
                .context("loading repair batch")?;
            let Some(last) = batch.last() else {
                break;
            };
            after_id = Some(last.id);
            report.batches += 1;

            for event in &batch {
                report.scanned += 1;
                match self.repair_event(event, &fields).await {
                    Ok(filled) => report.record_fill(&filled),
                    Err(err) => {
                        span.in_scope(|| warn!(event_id = %event.id, error = %err, "record not repaired"));
                        report.errors.push_ingest(format!("event {}", event.id), &err);
                    }
                }
            }
            span.in_scope(|| debug!(batch = report.batches, size = batch.len(), "repair batch done"));

            if batch.len() < batch_size {
                break;
            }
            tokio::time::sleep(self.options.batch_delay).await;
        }

        report.finished_at = Utc::now();
        info!(
            run_id = %report.run_id,
            scanned = report.scanned,
            repaired = report.repaired,
            errors = report.errors.total,
            "raw payload repair finished"
        );
        Ok(report)
    }

    async fn repair_event(&self, event: &ActivityEvent, fields: &[RepairField]) -> Result<Vec<RepairField>, IngestError> {
        let recovered = recover_fields(event.source, &event.raw_payload, &self.mappings)?;
        let patch = recovered.into_patch(&self.normalizer).restricted_to(fields, event);
        if patch.is_empty() {
            return Ok(Vec::new());
        }
        self.store.fill_event_nulls(event.id, &patch).await.map_err(internal)
    }

    /// Applies correction rows to the records they describe, in batches.
    pub async fn repair_from_corrections(
        &self,
        rows: Vec<Result<CorrectionRow, CandidateError>>,
    ) -> Result<RepairReport> {
        let mut report = RepairReport::new(
            RepairMode::Corrections,
            &RepairField::ALL,
            self.options.max_reported_errors,
        );
        let span = info_span!("repair_corrections", run_id = %report.run_id);
        let batch_size = self.options.batch_size.max(1);
        let total = rows.len();

        let mut rows = rows.into_iter().peekable();
        while rows.peek().is_some() {
            report.batches += 1;
            for row in rows.by_ref().take(batch_size) {
                report.scanned += 1;
                match row {
                    Ok(row) => {
                        let reference = format!("line {}", row.line);
                        match self.apply_correction(&row, &reference, &mut report).instrument(span.clone()).await {
                            Ok(Some(filled)) => report.record_fill(&filled),
                            Ok(None) => report.unmatched += 1,
                            Err(err) => {
                                span.in_scope(|| warn!(%reference, error = %err, "correction not applied"));
                                report.errors.push_ingest(reference, &err);
                            }
                        }
                    }
                    Err(rejected) => {
                        span.in_scope(|| warn!(reference = %rejected.reference, error = %rejected.error, "correction row rejected"));
                        report.errors.push_ingest(rejected.reference, &rejected.error);
                    }
                }
            }
            if rows.peek().is_some() {
                tokio::time::sleep(self.options.batch_delay).await;
            }
        }

        report.finished_at = Utc::now();
        info!(
            run_id = %report.run_id,
            rows = total,
            repaired = report.repaired,
            unmatched = report.unmatched,
            ambiguous = report.ambiguous.len(),
            "correction repair finished"
        );
        Ok(report)
    }

    /// `Ok(None)` when no stored record matches the row.
    async fn apply_correction(
        &self,
        row: &CorrectionRow,
        reference: &str,
        report: &mut RepairReport,
    ) -> Result<Option<Vec<RepairField>>, IngestError> {
        let mut subject_keys = Vec::new();
        if let Some(id) = subject_key(row.subject_id.as_deref(), None) {
            subject_keys.push(id);
        }
        if let Some(email) = subject_key(None, row.subject_email.as_deref()) {
            if row.subject_id.is_none() {
                if let Some(profile) = self.store.find_subject_by_email(&email).await.map_err(internal)? {
                    subject_keys.push(profile.subject_id);
                }
            }
            subject_keys.push(email);
        }
        if subject_keys.is_empty() {
            return Err(IngestError::UnresolvedIdentity(format!("{reference}: no subject id or email")));
        }

        let window = self.options.correction_window;
        let filter = EventFilter {
            subject_keys,
            content_id: Some(row.content_id.clone()),
            course_id: row.course_id.clone(),
            event_kind: row.event_kind,
            occurred_from: Some(row.reported_at - window),
            occurred_to: Some(row.reported_at + window),
            ..Default::default()
        };
        let matches = self.store.filter_events(&filter).await.map_err(internal)?;
        let distance = |e: &ActivityEvent| (e.occurred_at - row.reported_at).num_seconds().abs();
        let Some(chosen) = matches.iter().min_by_key(|e| (distance(*e), e.id)) else {
            debug!(reference, "no record matches correction");
            return Ok(None);
        };

        if matches.len() > 1 {
            let resolution = AmbiguousResolution {
                reference: reference.to_string(),
                candidates: matches.iter().map(|e| e.id).collect(),
                chosen: chosen.id,
                distance_secs: distance(chosen),
            };
            warn!(
                reference,
                candidates = resolution.candidates.len(),
                chosen = %resolution.chosen,
                distance_secs = resolution.distance_secs,
                class = ?ErrorClass::AmbiguousRepairMatch,
                "ambiguous correction resolved to the closest record"
            );
            report.ambiguous.push(resolution);
        }

        let patch = row
            .fields
            .clone()
            .into_patch(&self.normalizer)
            .restricted_to(&RepairField::ALL, chosen);
        if patch.is_empty() {
            return Ok(Some(Vec::new()));
        }
        self.store
            .fill_event_nulls(chosen.id, &patch)
            .await
            .map(Some)
            .map_err(internal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actlog_core::{DedupeKey, EventKind, EventSource};
    use actlog_sources::RecoveredFields;
    use actlog_storage::MemoryStore;
    use chrono::TimeZone;
    use serde_json::json;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, h, m, 0).single().unwrap()
    }

    fn options() -> RepairOptions {
        RepairOptions {
            batch_size: 2,
            batch_delay: Duration::from_millis(1),
            ..RepairOptions::default()
        }
    }

    fn job(store: Arc<MemoryStore>) -> RepairJob {
        RepairJob::new(
            store,
            ScoreNormalizer::default(),
            Arc::new(ColumnMappingTable::builtin().expect("mappings")),
            options(),
        )
    }

    fn api_event(key: &str, occurred_at: DateTime<Utc>, raw_payload: serde_json::Value) -> ActivityEvent {
        ActivityEvent {
            id: Uuid::new_v4(),
            subject_id: Some("S".into()),
            subject_email: None,
            event_kind: EventKind::QuizAttempted,
            course_id: Some("C".into()),
            course_name: None,
            content_id: Some("Q".into()),
            content_title: None,
            attempt_number: None,
            score_percent: None,
            correct_count: None,
            incorrect_count: None,
            occurred_at,
            source: EventSource::BackfillApi,
            dedupe_key: DedupeKey::Strong(key.into()),
            raw_payload,
            recorded_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn raw_payload_repair_fills_nulls_and_never_overwrites() {
        let store = Arc::new(MemoryStore::new());
        let payload = json!({"id": 1, "score": 0.9, "correct_count": 9, "content_title": "From payload"});
        let mut kept = api_event("a", at(0, 0), payload.clone());
        kept.content_title = Some("Original".into());
        let bare = api_event("b", at(0, 0), json!({"id": 2}));
        let full = {
            let mut e = api_event("c", at(0, 0), payload.clone());
            e.score_percent = Some(10.0);
            e.correct_count = Some(1);
            e.content_title = Some("Set".into());
            e
        };
        for event in [&kept, &bare, &full] {
            store.create_event(event).await.expect("insert");
        }

        let report = job(store.clone())
            .repair_from_raw_payloads(&[RepairField::ScorePercent, RepairField::ContentTitle])
            .await
            .expect("repair");
        assert_eq!(report.scanned, 2, "complete records are never loaded");
        assert_eq!(report.repaired, 1);
        assert_eq!(report.unchanged, 1);
        assert_eq!(report.batches, 1);
        assert_eq!(report.fields_filled.get("score_percent"), Some(&1));

        let events = store.events().await;
        let find = |id: Uuid| events.iter().find(|e| e.id == id).expect("event").clone();
        let kept_after = find(kept.id);
        assert_eq!(kept_after.score_percent, Some(90.0));
        assert_eq!(kept_after.content_title.as_deref(), Some("Original"));
        assert_eq!(kept_after.correct_count, None, "field was not requested");
        assert_eq!(find(full.id), full);
    }

    #[tokio::test]
    async fn unparseable_payloads_are_reported_and_the_batch_continues() {
        let store = Arc::new(MemoryStore::new());
        let mut broken = api_event("a", at(0, 0), json!("not an envelope"));
        broken.source = EventSource::Webhook;
        let fine = api_event("b", at(0, 0), json!({"score": 50}));
        store.create_event(&broken).await.expect("insert");
        store.create_event(&fine).await.expect("insert");

        let report = job(store.clone()).repair_from_raw_payloads(&[]).await.expect("repair");
        assert_eq!(report.errors.total, 1);
        assert_eq!(report.errors.first[0].class, ErrorClass::MalformedInput);
        assert_eq!(report.repaired, 1);
        assert_eq!(report.fields.len(), RepairField::ALL.len());
    }

    fn correction(line: u64, reported_at: DateTime<Utc>, title: &str) -> Result<CorrectionRow, CandidateError> {
        Ok(CorrectionRow {
            line,
            subject_id: Some("S".into()),
            subject_email: None,
            content_id: "Q".into(),
            course_id: Some("C".into()),
            event_kind: Some(EventKind::QuizAttempted),
            reported_at,
            fields: RecoveredFields {
                raw_score: json!("75"),
                content_title: Some(title.into()),
                ..Default::default()
            },
        })
    }

    #[tokio::test]
    async fn ambiguous_corrections_go_to_the_closest_record() {
        let store = Arc::new(MemoryStore::new());
        let early = api_event("a", at(1, 0), json!({}));
        let late = api_event("b", at(9, 0), json!({}));
        store.create_event(&early).await.expect("insert");
        store.create_event(&late).await.expect("insert");

        let rows = vec![
            correction(2, at(8, 0), "Gears"),
            correction(3, Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).single().unwrap(), "Nope"),
            Err(CandidateError {
                reference: "line 4".into(),
                error: IngestError::Malformed("bad date".into()),
            }),
        ];
        let report = job(store.clone()).repair_from_corrections(rows).await.expect("repair");

        assert_eq!(report.repaired, 1);
        assert_eq!(report.unmatched, 1);
        assert_eq!(report.errors.total, 1);
        assert_eq!(report.ambiguous.len(), 1);
        assert_eq!(report.ambiguous[0].chosen, late.id);
        assert_eq!(report.ambiguous[0].distance_secs, 3600);
        assert!(report.brief().contains("Ambiguous matches"));

        let events = store.events().await;
        let late_after = events.iter().find(|e| e.id == late.id).expect("late");
        assert_eq!(late_after.score_percent, Some(75.0));
        assert_eq!(late_after.content_title.as_deref(), Some("Gears"));
        let early_after = events.iter().find(|e| e.id == early.id).expect("early");
        assert_eq!(early_after.score_percent, None);
    }

    #[tokio::test]
    async fn quiz_corrections_skip_other_kinds_sharing_the_content_id() {
        let store = Arc::new(MemoryStore::new());
        let mut lesson = api_event("a", at(8, 0), json!({}));
        lesson.event_kind = EventKind::LessonCompleted;
        store.create_event(&lesson).await.expect("insert");

        let report = job(store.clone())
            .repair_from_corrections(vec![correction(2, at(8, 0), "Gears")])
            .await
            .expect("repair");
        assert_eq!(report.unmatched, 1);
        assert_eq!(report.repaired, 0);
        assert_eq!(store.events().await[0].score_percent, None);
    }
}
