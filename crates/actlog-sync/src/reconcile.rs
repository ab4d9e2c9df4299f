//! Backfill and spreadsheet reconciliation.
//!
//! Candidates go through identity resolution, exact key match, soft match against
//! higher-precedence sources, and only then insertion. Every step is read-before-write, so
//! re-running a backfill over the same data inserts nothing.

use std::sync::Arc;

use actlog_core::{subject_key, ErrorClass, EventSource, IngestError, ScoreNormalizer, SubjectProfile};
use actlog_sources::{
    parse_csv, ActivityDraft, BackfillFeed, Candidate, ColumnVariant, FeedContext, SubjectRef,
};
use actlog_storage::{CreateOutcome, EventFilter, RecordStore, StoreError};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::{
    error_lines, event_from_draft, fire_completion_hook, profile_from_draft, CompletionHook, ErrorLog,
    MAX_REPORTED_ERRORS,
};

#[derive(Debug, Clone)]
pub struct ReconcileOptions {
    pub soft_match_window: chrono::Duration,
    /// Lowest source a soft match may be made against.
    pub soft_match_floor: EventSource,
    pub backfill_concurrency: usize,
    pub max_reported_errors: usize,
}

impl Default for ReconcileOptions {
    fn default() -> Self {
        Self {
            soft_match_window: chrono::Duration::seconds(300),
            soft_match_floor: EventSource::Webhook,
            backfill_concurrency: 4,
            max_reported_errors: MAX_REPORTED_ERRORS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateOutcome {
    Inserted(Uuid),
    SkippedExact(Uuid),
    SkippedSoft(Uuid),
}

#[derive(Debug, Clone, Serialize)]
pub struct UploadSummary {
    pub content_hash: String,
    pub archive_path: String,
    pub deduplicated: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ImportReport {
    pub run_id: Uuid,
    pub source: EventSource,
    /// Group id for backfills, variant name for spreadsheet imports.
    pub scope: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub total: usize,
    pub inserted: usize,
    pub skipped_exact: usize,
    pub skipped_soft: usize,
    pub rejected: usize,
    pub subjects: usize,
    pub failed_pages: usize,
    pub errors: ErrorLog,
    pub upload: Option<UploadSummary>,
}

impl ImportReport {
    fn new(source: EventSource, scope: &str, max_errors: usize) -> Self {
        let now = Utc::now();
        Self {
            run_id: Uuid::new_v4(),
            source,
            scope: scope.to_string(),
            started_at: now,
            finished_at: now,
            total: 0,
            inserted: 0,
            skipped_exact: 0,
            skipped_soft: 0,
            rejected: 0,
            subjects: 0,
            failed_pages: 0,
            errors: ErrorLog::with_limit(max_errors),
            upload: None,
        }
    }

    fn record(&mut self, outcome: CandidateOutcome) {
        self.total += 1;
        match outcome {
            CandidateOutcome::Inserted(_) => self.inserted += 1,
            CandidateOutcome::SkippedExact(_) => self.skipped_exact += 1,
            CandidateOutcome::SkippedSoft(_) => self.skipped_soft += 1,
        }
    }

    fn reject(&mut self, reference: &str, err: &IngestError) {
        self.total += 1;
        self.rejected += 1;
        self.errors.push_ingest(reference, err);
    }

    fn absorb(&mut self, other: ImportReport) {
        self.total += other.total;
        self.inserted += other.inserted;
        self.skipped_exact += other.skipped_exact;
        self.skipped_soft += other.skipped_soft;
        self.rejected += other.rejected;
        self.failed_pages += other.failed_pages;
        self.errors.merge(other.errors);
    }

    pub fn brief(&self) -> String {
        let upload = self
            .upload
            .as_ref()
            .map(|u| format!("- Upload: `{}` (sha256 `{}`)\n", u.archive_path, u.content_hash))
            .unwrap_or_default();
        format!(
            "# Activity import `{}`\n\n- Source: {}\n- Scope: {}\n- Started: {}\n- Finished: {}\n{}\n\
             ## Counts\n- total: {}\n- inserted: {}\n- skipped (exact): {}\n- skipped (soft): {}\n\
             - rejected: {}\n- failed pages: {}\n\n## Errors ({})\n{}\n",
            self.run_id,
            self.source,
            self.scope,
            self.started_at,
            self.finished_at,
            upload,
            self.total,
            self.inserted,
            self.skipped_exact,
            self.skipped_soft,
            self.rejected,
            self.failed_pages,
            self.errors.total,
            error_lines(&self.errors),
        )
    }
}

#[derive(Clone)]
pub struct Reconciler {
    store: Arc<dyn RecordStore>,
    normalizer: ScoreNormalizer,
    hook: Arc<dyn CompletionHook>,
    options: ReconcileOptions,
}

fn internal(err: StoreError) -> IngestError {
    IngestError::Internal(err.to_string())
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn RecordStore>,
        normalizer: ScoreNormalizer,
        hook: Arc<dyn CompletionHook>,
        options: ReconcileOptions,
    ) -> Self {
        Self {
            store,
            normalizer,
            hook,
            options,
        }
    }

    pub fn options(&self) -> &ReconcileOptions {
        &self.options
    }

    /// Runs one candidate through resolve, exact match, soft match and insert.
    pub async fn process_candidate(&self, mut draft: ActivityDraft) -> Result<CandidateOutcome, IngestError> {
        self.resolve_subject(&mut draft).await?;
        draft.validate()?;
        let event = event_from_draft(&draft, &self.normalizer)?;
        if let Some(profile) = profile_from_draft(&draft) {
            self.store.upsert_subject_profile(&profile).await.map_err(internal)?;
        }

        if let Some(existing) = self.store.find_event_by_key(&event.dedupe_key).await.map_err(internal)? {
            debug!(reference = %draft.source_ref, existing = %existing.id, "exact duplicate");
            return Ok(CandidateOutcome::SkippedExact(existing.id));
        }
        if let Some(existing) = self.soft_match(&draft).await? {
            debug!(reference = %draft.source_ref, %existing, "soft duplicate of a higher-precedence record");
            return Ok(CandidateOutcome::SkippedSoft(existing));
        }

        match self.store.create_event(&event).await.map_err(internal)? {
            CreateOutcome::Created => {
                fire_completion_hook(&self.hook, &event);
                Ok(CandidateOutcome::Inserted(event.id))
            }
            CreateOutcome::DuplicateKey(existing) => Ok(CandidateOutcome::SkippedExact(existing)),
        }
    }

    /// Spreadsheet rows without an explicit subject id must resolve through a known profile.
    async fn resolve_subject(&self, draft: &mut ActivityDraft) -> Result<(), IngestError> {
        if draft.subject_id.is_some() {
            return Ok(());
        }
        if let Some(email) = draft.subject_email.clone() {
            if let Some(profile) = self.store.find_subject_by_email(&email).await.map_err(internal)? {
                draft.subject_id = Some(profile.subject_id);
                return Ok(());
            }
        }
        if draft.source == EventSource::CsvImport {
            return Err(IngestError::UnresolvedIdentity(format!(
                "{}: no subject id and no known profile for email {:?}",
                draft.source_ref,
                draft.subject_email.as_deref().unwrap_or("")
            )));
        }
        Ok(())
    }

    async fn soft_match(&self, draft: &ActivityDraft) -> Result<Option<Uuid>, IngestError> {
        let sources = [EventSource::Repair, EventSource::CsvImport, EventSource::BackfillApi, EventSource::Webhook]
            .into_iter()
            .filter(|s| *s >= self.options.soft_match_floor && s.outranks(draft.source))
            .collect::<Vec<_>>();
        if sources.is_empty() {
            return Ok(None);
        }

        let subject_keys = [
            subject_key(draft.subject_id.as_deref(), None),
            subject_key(None, draft.subject_email.as_deref()),
        ]
        .into_iter()
        .flatten()
        .collect::<Vec<_>>();
        let window = self.options.soft_match_window;
        let filter = EventFilter {
            subject_keys,
            event_kind: Some(draft.event_kind),
            content_id: draft.content_id.clone(),
            sources,
            occurred_from: Some(draft.occurred_at - window),
            occurred_to: Some(draft.occurred_at + window),
            limit: Some(1),
            ..Default::default()
        };
        let found = self.store.filter_events(&filter).await.map_err(internal)?;
        Ok(found.first().map(|e| e.id))
    }

    async fn reconcile_into(&self, candidates: Vec<Candidate>, report: &mut ImportReport) {
        for candidate in candidates {
            match candidate {
                Ok(draft) => {
                    let reference = draft.source_ref.clone();
                    match self.process_candidate(draft).await {
                        Ok(outcome) => report.record(outcome),
                        Err(err) => {
                            warn!(%reference, error = %err, class = ?err.class(), "candidate rejected");
                            report.reject(&reference, &err);
                        }
                    }
                }
                Err(rejected) => {
                    warn!(reference = %rejected.reference, error = %rejected.error, "candidate rejected");
                    report.reject(&rejected.reference, &rejected.error);
                }
            }
        }
    }

    /// Spreadsheet rows are reconciled in file order.
    pub async fn import_csv(&self, text: &str, variant: &ColumnVariant) -> Result<ImportReport> {
        let mut report = ImportReport::new(EventSource::CsvImport, &variant.name, self.options.max_reported_errors);
        let candidates = parse_csv(text, variant).with_context(|| format!("parsing upload as {}", variant.name))?;
        let span = info_span!("csv_import", run_id = %report.run_id, variant = %variant.name);
        self.reconcile_into(candidates, &mut report).instrument(span).await;
        report.finished_at = Utc::now();
        info!(
            run_id = %report.run_id,
            total = report.total,
            inserted = report.inserted,
            skipped_exact = report.skipped_exact,
            skipped_soft = report.skipped_soft,
            rejected = report.rejected,
            "csv import finished"
        );
        Ok(report)
    }

    /// Replays a group's history with bounded per-subject workers.
    pub async fn run_backfill(&self, feed: Arc<dyn BackfillFeed>, group_id: &str) -> Result<ImportReport> {
        let mut report = ImportReport::new(feed.source(), group_id, self.options.max_reported_errors);
        let ctx = FeedContext { run_id: report.run_id };
        let subjects = feed
            .list_subjects(&ctx, group_id)
            .await
            .with_context(|| format!("listing members of group {group_id}"))?;
        report.subjects = subjects.len();
        info!(run_id = %report.run_id, group_id, subjects = subjects.len(), "backfill started");

        for subject in &subjects {
            let profile = SubjectProfile {
                subject_id: subject.id.clone(),
                email: subject.email.clone(),
                display_name: subject.display_name.clone(),
                last_seen_at: report.started_at,
            };
            if let Err(err) = self.store.upsert_subject_profile(&profile).await {
                warn!(subject = %subject.id, error = %err, "roster profile not saved");
                report.errors.push(format!("subject {}", subject.id), ErrorClass::Internal, err.to_string());
            }
        }

        let limit = Arc::new(Semaphore::new(self.options.backfill_concurrency.max(1)));
        let mut workers = JoinSet::new();
        for subject in subjects {
            let reconciler = self.clone();
            let feed = Arc::clone(&feed);
            let limit = Arc::clone(&limit);
            let ctx = ctx.clone();
            let span = info_span!("backfill_subject", run_id = %ctx.run_id, subject = %subject.id);
            workers.spawn(
                async move {
                    let _permit = limit.acquire_owned().await.ok();
                    reconciler.backfill_subject(feed.as_ref(), &ctx, &subject).await
                }
                .instrument(span),
            );
        }

        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(partial) => report.absorb(partial),
                Err(err) => {
                    report.failed_pages += 1;
                    report.errors.push("worker", ErrorClass::Internal, err.to_string());
                }
            }
        }

        report.finished_at = Utc::now();
        info!(
            run_id = %report.run_id,
            total = report.total,
            inserted = report.inserted,
            skipped_exact = report.skipped_exact,
            skipped_soft = report.skipped_soft,
            rejected = report.rejected,
            failed_pages = report.failed_pages,
            "backfill finished"
        );
        Ok(report)
    }

    /// Pages until an empty or short page. A failed page stops this subject only.
    async fn backfill_subject(&self, feed: &dyn BackfillFeed, ctx: &FeedContext, subject: &SubjectRef) -> ImportReport {
        let mut partial = ImportReport::new(feed.source(), &subject.id, self.options.max_reported_errors);
        let page_size = feed.page_size().max(1);
        let mut page = 1u32;
        loop {
            let candidates = match feed.fetch_activity_page(ctx, subject, page).await {
                Ok(candidates) => candidates,
                Err(err) => {
                    let err = IngestError::from(err);
                    warn!(page, error = %err, class = ?err.class(), "page fetch failed; abandoning subject");
                    partial.failed_pages += 1;
                    partial.errors.push_ingest(format!("subject {} page {page}", subject.id), &err);
                    break;
                }
            };
            let fetched = candidates.len();
            self.reconcile_into(candidates, &mut partial).await;
            if fetched < page_size {
                break;
            }
            page += 1;
        }
        partial
    }
}
