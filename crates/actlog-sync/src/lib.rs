//! Ingestion, reconciliation and repair orchestration.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use actlog_core::{
    derive_dedupe_key, ActivityEvent, ErrorClass, IngestError, KeyInput, RepairField,
    ScoreNormalizer, SubjectProfile,
};
use actlog_sources::{
    ActivityDraft, BackfillFeed, ColumnMappingTable, LmsApiConfig, LmsApiFeed,
};
use actlog_storage::{
    HttpClientConfig, HttpFetcher, MemoryStore, PgStore, RecordStore, RequestRateLimit, UploadArchive,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use tokio::fs;
use tokio::sync::mpsc;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use uuid::Uuid;

pub mod export;
pub mod reconcile;
pub mod repair;
pub mod webhook;

pub use export::{export_activity_snapshot, SnapshotManifest, SnapshotManifestFile};
pub use reconcile::{CandidateOutcome, ImportReport, ReconcileOptions, Reconciler, UploadSummary};
pub use repair::{AmbiguousResolution, RepairJob, RepairOptions, RepairReport};
pub use webhook::{DeliveryOutcome, WebhookIngestor};

pub const CRATE_NAME: &str = "actlog-sync";

/// Cap on per-row error messages kept in a run report.
pub const MAX_REPORTED_ERRORS: usize = 20;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub database_url: Option<String>,
    pub lms_base_url: String,
    pub lms_api_key: Option<String>,
    pub lms_subdomain: Option<String>,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub http_global_concurrency: usize,
    /// Upstream request burst; zero disables the rate limit.
    pub lms_rate_capacity: u32,
    pub lms_rate_refill_ms: u64,
    pub backfill_concurrency: usize,
    pub backfill_page_size: usize,
    pub soft_match_window_secs: i64,
    pub fraction_ceiling: f64,
    pub repair_batch_size: usize,
    pub repair_batch_delay_ms: u64,
    pub correction_window_hours: i64,
    pub column_mappings: Option<PathBuf>,
    pub archive_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub scheduler_enabled: bool,
    pub backfill_cron: String,
    pub backfill_groups: Vec<String>,
    pub web_port: u16,
    pub log_json: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            lms_base_url: "https://api.lms.invalid/api/public/v1".to_string(),
            lms_api_key: None,
            lms_subdomain: None,
            user_agent: "actlog-bot/0.1".to_string(),
            http_timeout_secs: 20,
            http_global_concurrency: 16,
            lms_rate_capacity: 0,
            lms_rate_refill_ms: 1_000,
            backfill_concurrency: 4,
            backfill_page_size: 100,
            soft_match_window_secs: 300,
            fraction_ceiling: 1.0,
            repair_batch_size: 50,
            repair_batch_delay_ms: 250,
            correction_window_hours: 24,
            column_mappings: None,
            archive_dir: PathBuf::from("./archive"),
            reports_dir: PathBuf::from("./reports"),
            scheduler_enabled: false,
            backfill_cron: "0 0 3 * * *".to_string(),
            backfill_groups: Vec::new(),
            web_port: 8000,
            log_json: false,
        }
    }
}

fn env_text(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    env_text(name).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_flag(name: &str) -> bool {
    env_text(name)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True" | "yes"))
        .unwrap_or(false)
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            database_url: env_text("DATABASE_URL"),
            lms_base_url: env_text("ACTLOG_LMS_BASE_URL").unwrap_or(defaults.lms_base_url),
            lms_api_key: env_text("ACTLOG_LMS_API_KEY"),
            lms_subdomain: env_text("ACTLOG_LMS_SUBDOMAIN"),
            user_agent: env_text("ACTLOG_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: env_parse("ACTLOG_HTTP_TIMEOUT_SECS", defaults.http_timeout_secs),
            http_global_concurrency: env_parse("ACTLOG_HTTP_GLOBAL_CONCURRENCY", defaults.http_global_concurrency),
            lms_rate_capacity: env_parse("ACTLOG_LMS_RATE_CAPACITY", defaults.lms_rate_capacity),
            lms_rate_refill_ms: env_parse("ACTLOG_LMS_RATE_REFILL_MS", defaults.lms_rate_refill_ms),
            backfill_concurrency: env_parse("ACTLOG_BACKFILL_CONCURRENCY", defaults.backfill_concurrency),
            backfill_page_size: env_parse("ACTLOG_BACKFILL_PAGE_SIZE", defaults.backfill_page_size),
            soft_match_window_secs: env_parse("ACTLOG_SOFT_MATCH_WINDOW_SECS", defaults.soft_match_window_secs),
            fraction_ceiling: env_parse("ACTLOG_FRACTION_CEILING", defaults.fraction_ceiling),
            repair_batch_size: env_parse("ACTLOG_REPAIR_BATCH_SIZE", defaults.repair_batch_size),
            repair_batch_delay_ms: env_parse("ACTLOG_REPAIR_BATCH_DELAY_MS", defaults.repair_batch_delay_ms),
            correction_window_hours: env_parse("ACTLOG_CORRECTION_WINDOW_HOURS", defaults.correction_window_hours),
            column_mappings: env_text("ACTLOG_COLUMN_MAPPINGS").map(PathBuf::from),
            archive_dir: env_text("ACTLOG_ARCHIVE_DIR").map(PathBuf::from).unwrap_or(defaults.archive_dir),
            reports_dir: env_text("ACTLOG_REPORTS_DIR").map(PathBuf::from).unwrap_or(defaults.reports_dir),
            scheduler_enabled: env_flag("ACTLOG_SCHEDULER_ENABLED"),
            backfill_cron: env_text("ACTLOG_BACKFILL_CRON").unwrap_or(defaults.backfill_cron),
            backfill_groups: env_text("ACTLOG_BACKFILL_GROUPS")
                .map(|v| {
                    v.split(',')
                        .map(str::trim)
                        .filter(|g| !g.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            web_port: env_parse("ACTLOG_WEB_PORT", defaults.web_port),
            log_json: env_flag("ACTLOG_LOG_JSON"),
        }
    }

    pub fn score_normalizer(&self) -> ScoreNormalizer {
        ScoreNormalizer::new(self.fraction_ceiling)
    }

    pub fn reconcile_options(&self) -> ReconcileOptions {
        ReconcileOptions {
            soft_match_window: chrono::Duration::seconds(self.soft_match_window_secs.max(0)),
            backfill_concurrency: self.backfill_concurrency.max(1),
            ..ReconcileOptions::default()
        }
    }

    pub fn repair_options(&self) -> RepairOptions {
        RepairOptions {
            batch_size: self.repair_batch_size.max(1),
            batch_delay: Duration::from_millis(self.repair_batch_delay_ms),
            correction_window: chrono::Duration::hours(self.correction_window_hours.max(0)),
            ..RepairOptions::default()
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        let mut extra_headers = Vec::new();
        if let Some(subdomain) = &self.lms_subdomain {
            extra_headers.push(("X-Auth-Subdomain".to_string(), subdomain.clone()));
        }
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            bearer_token: self.lms_api_key.clone(),
            extra_headers,
            global_concurrency: self.http_global_concurrency.max(1),
            per_source_concurrency: self.backfill_concurrency.max(1),
            rate_limit: (self.lms_rate_capacity > 0).then(|| RequestRateLimit {
                capacity: self.lms_rate_capacity,
                refill_every: Duration::from_millis(self.lms_rate_refill_ms),
            }),
            ..Default::default()
        }
    }

    pub fn lms_api_config(&self) -> LmsApiConfig {
        LmsApiConfig {
            base_url: self.lms_base_url.clone(),
            page_size: self.backfill_page_size.max(1),
        }
    }

    pub fn load_column_mappings(&self) -> Result<ColumnMappingTable> {
        match &self.column_mappings {
            Some(path) => ColumnMappingTable::load(path)
                .with_context(|| format!("loading column mappings from {}", path.display())),
            None => ColumnMappingTable::builtin().context("parsing built-in column mappings"),
        }
    }
}

/// Downstream collaborator told about newly recorded lesson and quiz events.
#[async_trait]
pub trait CompletionHook: Send + Sync {
    async fn notify(&self, activity_event_id: Uuid) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct TracingCompletionHook;

#[async_trait]
impl CompletionHook for TracingCompletionHook {
    async fn notify(&self, activity_event_id: Uuid) -> Result<()> {
        info!(%activity_event_id, "assignment completion candidate recorded");
        Ok(())
    }
}

/// Forwards event ids to an in-process consumer.
#[derive(Debug, Clone)]
pub struct ChannelCompletionHook {
    tx: mpsc::UnboundedSender<Uuid>,
}

impl ChannelCompletionHook {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Uuid>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl CompletionHook for ChannelCompletionHook {
    async fn notify(&self, activity_event_id: Uuid) -> Result<()> {
        self.tx
            .send(activity_event_id)
            .context("completion hook receiver dropped")
    }
}

/// Fire-and-forget: the caller never waits on, or fails because of, the hook.
pub(crate) fn fire_completion_hook(hook: &Arc<dyn CompletionHook>, event: &ActivityEvent) {
    if !event.event_kind.is_content_activity() {
        return;
    }
    let hook = Arc::clone(hook);
    let event_id = event.id;
    tokio::spawn(async move {
        if let Err(err) = hook.notify(event_id).await {
            warn!(%event_id, error = %err, "completion hook failed");
        }
    });
}

/// Turns a validated draft into a storable event, normalizing its score.
pub(crate) fn event_from_draft(draft: &ActivityDraft, normalizer: &ScoreNormalizer) -> Result<ActivityEvent, IngestError> {
    let subject = draft
        .subject_key()
        .ok_or_else(|| IngestError::UnresolvedIdentity(format!("{}: no subject", draft.source_ref)))?;
    let dedupe_key = derive_dedupe_key(&KeyInput {
        kind: draft.event_kind,
        subject: &subject,
        content_id: draft.content_id.as_deref(),
        course_id: draft.course_id.as_deref(),
        occurred_at: draft.occurred_at,
        stable_id: draft.stable_id(),
    });
    let patch = draft.fields.clone().into_patch(normalizer);
    Ok(ActivityEvent {
        id: Uuid::new_v4(),
        subject_id: draft.subject_id.clone(),
        subject_email: draft.subject_email.clone(),
        event_kind: draft.event_kind,
        course_id: draft.course_id.clone(),
        course_name: patch.course_name,
        content_id: draft.content_id.clone(),
        content_title: patch.content_title,
        attempt_number: patch.attempt_number,
        score_percent: patch.score_percent,
        correct_count: patch.correct_count,
        incorrect_count: patch.incorrect_count,
        occurred_at: draft.occurred_at,
        source: draft.source,
        dedupe_key,
        raw_payload: draft.raw_payload.clone(),
        recorded_at: Utc::now(),
    })
}

pub(crate) fn profile_from_draft(draft: &ActivityDraft) -> Option<SubjectProfile> {
    Some(SubjectProfile {
        subject_id: draft.subject_id.clone()?,
        email: draft.subject_email.clone(),
        display_name: draft.subject_name.clone(),
        last_seen_at: draft.occurred_at,
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportedError {
    pub reference: String,
    pub class: ErrorClass,
    pub message: String,
}

/// Counts every error, keeps the first few messages.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorLog {
    pub total: usize,
    pub first: Vec<ReportedError>,
    #[serde(skip)]
    limit: usize,
}

impl Default for ErrorLog {
    fn default() -> Self {
        Self::with_limit(MAX_REPORTED_ERRORS)
    }
}

impl ErrorLog {
    pub fn with_limit(limit: usize) -> Self {
        Self {
            total: 0,
            first: Vec::new(),
            limit,
        }
    }

    pub fn push(&mut self, reference: impl Into<String>, class: ErrorClass, message: impl Into<String>) {
        self.total += 1;
        if self.first.len() < self.limit {
            self.first.push(ReportedError {
                reference: reference.into(),
                class,
                message: message.into(),
            });
        }
    }

    pub fn push_ingest(&mut self, reference: impl Into<String>, err: &IngestError) {
        self.push(reference, err.class(), err.to_string());
    }

    pub fn merge(&mut self, other: ErrorLog) {
        self.total += other.total;
        for item in other.first {
            if self.first.len() >= self.limit {
                break;
            }
            self.first.push(item);
        }
    }
}

/// Writes `<reports_dir>/<run_id>/run_report.json` and `brief.md`; returns the run directory.
pub async fn write_run_report<T: Serialize>(
    reports_dir: &Path,
    run_id: Uuid,
    report: &T,
    brief: &str,
) -> Result<PathBuf> {
    let run_dir = reports_dir.join(run_id.to_string());
    fs::create_dir_all(&run_dir)
        .await
        .with_context(|| format!("creating {}", run_dir.display()))?;
    let json = serde_json::to_vec_pretty(report).context("serializing run report")?;
    fs::write(run_dir.join("run_report.json"), json)
        .await
        .context("writing run_report.json")?;
    fs::write(run_dir.join("brief.md"), brief)
        .await
        .context("writing brief.md")?;
    Ok(run_dir)
}

pub(crate) fn error_lines(errors: &ErrorLog) -> String {
    if errors.first.is_empty() {
        return "- none".to_string();
    }
    errors
        .first
        .iter()
        .map(|e| format!("- `{}` ({:?}): {}", e.reference, e.class, e.message))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Wires the store, source feed, mapping table and hooks together.
#[derive(Clone)]
pub struct Engine {
    pub config: EngineConfig,
    pub store: Arc<dyn RecordStore>,
    pub feed: Arc<dyn BackfillFeed>,
    pub mappings: Arc<ColumnMappingTable>,
    pub hook: Arc<dyn CompletionHook>,
    pub archive: UploadArchive,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn RecordStore>,
        feed: Arc<dyn BackfillFeed>,
        hook: Arc<dyn CompletionHook>,
    ) -> Result<Self> {
        let mappings = Arc::new(config.load_column_mappings()?);
        let archive = UploadArchive::new(config.archive_dir.clone());
        Ok(Self {
            config,
            store,
            feed,
            mappings,
            hook,
            archive,
        })
    }

    /// Postgres when `DATABASE_URL` is set, otherwise an in-memory store.
    pub async fn from_config(config: EngineConfig) -> Result<Self> {
        let store: Arc<dyn RecordStore> = match &config.database_url {
            Some(url) => Arc::new(PgStore::connect(url).await.context("connecting to postgres")?),
            None => {
                warn!("DATABASE_URL not set; using in-memory record store");
                Arc::new(MemoryStore::new())
            }
        };
        let http = Arc::new(HttpFetcher::new(config.http_client_config())?);
        let feed = Arc::new(LmsApiFeed::new(http, config.lms_api_config()));
        Self::new(config, store, feed, Arc::new(TracingCompletionHook))
    }

    pub async fn from_env() -> Result<Self> {
        Self::from_config(EngineConfig::from_env()).await
    }

    pub fn webhook_ingestor(&self) -> WebhookIngestor {
        WebhookIngestor::new(
            Arc::clone(&self.store),
            self.config.score_normalizer(),
            Arc::clone(&self.hook),
        )
    }

    pub fn reconciler(&self) -> Reconciler {
        Reconciler::new(
            Arc::clone(&self.store),
            self.config.score_normalizer(),
            Arc::clone(&self.hook),
            self.config.reconcile_options(),
        )
    }

    pub fn repair_job(&self) -> RepairJob {
        RepairJob::new(
            Arc::clone(&self.store),
            self.config.score_normalizer(),
            Arc::clone(&self.mappings),
            self.config.repair_options(),
        )
    }

    pub async fn run_backfill(&self, group_id: &str) -> Result<ImportReport> {
        let report = self
            .reconciler()
            .run_backfill(Arc::clone(&self.feed), group_id)
            .await
            .with_context(|| format!("backfilling group {group_id}"))?;
        self.persist_report(report.run_id, &report, &report.brief()).await;
        Ok(report)
    }

    /// Archives the upload, then reconciles its rows.
    pub async fn import_csv(&self, variant_name: &str, bytes: &[u8]) -> Result<ImportReport> {
        let variant = self.mappings.variant(variant_name)?;
        let archived = self
            .archive
            .store_bytes(Utc::now(), "csv_import", "csv", bytes)
            .await
            .context("archiving upload")?;
        let text = std::str::from_utf8(bytes).context("upload is not UTF-8")?;
        let mut report = self.reconciler().import_csv(text, variant).await?;
        report.upload = Some(UploadSummary {
            content_hash: archived.content_hash,
            archive_path: archived.relative_path.display().to_string(),
            deduplicated: archived.deduplicated,
        });
        self.persist_report(report.run_id, &report, &report.brief()).await;
        Ok(report)
    }

    pub async fn repair_raw_payloads(&self, fields: &[RepairField]) -> Result<RepairReport> {
        let report = self.repair_job().repair_from_raw_payloads(fields).await?;
        self.persist_report(report.run_id, &report, &report.brief()).await;
        Ok(report)
    }

    pub async fn repair_from_corrections(&self, variant_name: &str, bytes: &[u8]) -> Result<RepairReport> {
        let variant = self.mappings.variant(variant_name)?;
        self.archive
            .store_bytes(Utc::now(), "corrections", "csv", bytes)
            .await
            .context("archiving correction sheet")?;
        let text = std::str::from_utf8(bytes).context("correction sheet is not UTF-8")?;
        let rows = actlog_sources::parse_correction_csv(text, variant)?;
        let report = self.repair_job().repair_from_corrections(rows).await?;
        self.persist_report(report.run_id, &report, &report.brief()).await;
        Ok(report)
    }

    pub async fn export_snapshot(&self, out_dir: &Path) -> Result<SnapshotManifest> {
        export_activity_snapshot(self.store.as_ref(), out_dir).await
    }

    /// A report that cannot be written is logged; the run itself already happened.
    async fn persist_report<T: Serialize>(&self, run_id: Uuid, report: &T, brief: &str) {
        match write_run_report(&self.config.reports_dir, run_id, report, brief).await {
            Ok(dir) => info!(%run_id, dir = %dir.display(), "run report written"),
            Err(err) => error!(%run_id, error = %err, "writing run report failed"),
        }
    }

    /// Cron-driven backfills over the configured groups, when enabled.
    pub async fn maybe_build_scheduler(&self) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }
        if self.config.backfill_groups.is_empty() {
            warn!("scheduler enabled but ACTLOG_BACKFILL_GROUPS is empty");
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let engine = self.clone();
        let cron = self.config.backfill_cron.clone();
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let engine = engine.clone();
            Box::pin(async move {
                for group in engine.config.backfill_groups.clone() {
                    match engine.run_backfill(&group).await {
                        Ok(report) => info!(
                            group = %group,
                            inserted = report.inserted,
                            skipped_exact = report.skipped_exact,
                            skipped_soft = report.skipped_soft,
                            "scheduled backfill finished"
                        ),
                        Err(err) => error!(group = %group, error = %err, "scheduled backfill failed"),
                    }
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_log_counts_everything_but_keeps_the_first_few() {
        let mut log = ErrorLog::with_limit(2);
        for i in 0..5 {
            log.push(format!("line {i}"), ErrorClass::MalformedInput, "bad");
        }
        assert_eq!(log.total, 5);
        assert_eq!(log.first.len(), 2);
        assert_eq!(log.first[1].reference, "line 1");

        let mut other = ErrorLog::with_limit(2);
        other.push("x", ErrorClass::Internal, "boom");
        let mut merged = ErrorLog::with_limit(3);
        merged.merge(log);
        merged.merge(other);
        assert_eq!(merged.total, 6);
        assert_eq!(merged.first.len(), 3);
        assert_eq!(merged.first[2].reference, "x");
    }

    #[test]
    fn config_derives_component_options() {
        let config = EngineConfig {
            soft_match_window_secs: 60,
            lms_subdomain: Some("acme".into()),
            lms_api_key: Some("k".into()),
            ..EngineConfig::default()
        };
        assert_eq!(config.reconcile_options().soft_match_window, chrono::Duration::seconds(60));
        let http = config.http_client_config();
        assert_eq!(http.bearer_token.as_deref(), Some("k"));
        assert_eq!(http.extra_headers, vec![("X-Auth-Subdomain".to_string(), "acme".to_string())]);
        assert_eq!(http.rate_limit, None);
        assert_eq!(config.repair_options().batch_size, 50);
        assert!(config.load_column_mappings().is_ok());
    }

    #[test]
    fn rate_limit_settings_reach_the_http_client() {
        let config = EngineConfig {
            lms_rate_capacity: 5,
            lms_rate_refill_ms: 200,
            http_global_concurrency: 3,
            ..EngineConfig::default()
        };
        let http = config.http_client_config();
        assert_eq!(http.global_concurrency, 3);
        assert_eq!(
            http.rate_limit,
            Some(RequestRateLimit {
                capacity: 5,
                refill_every: Duration::from_millis(200),
            })
        );
    }

    #[tokio::test]
    async fn channel_hook_forwards_ids() {
        let (hook, mut rx) = ChannelCompletionHook::new();
        let id = Uuid::new_v4();
        hook.notify(id).await.expect("notify");
        assert_eq!(rx.recv().await, Some(id));
    }

    #[tokio::test]
    async fn run_reports_land_under_the_run_id() {
        let dir = tempfile::tempdir().expect("tempdir");
        let run_id = Uuid::new_v4();
        let run_dir = write_run_report(dir.path(), run_id, &serde_json::json!({"inserted": 1}), "# brief\n")
            .await
            .expect("write");
        assert!(run_dir.ends_with(run_id.to_string()));
        let json = std::fs::read_to_string(run_dir.join("run_report.json")).expect("json");
        assert!(json.contains("\"inserted\": 1"));
        assert!(run_dir.join("brief.md").exists());
    }
}
