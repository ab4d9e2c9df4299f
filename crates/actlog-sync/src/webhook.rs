//! Inbound webhook deliveries.
//!
//! `received -> idempotency-checked -> {skipped-duplicate | skipped-unrecognized-kind |
//! dropped | recorded}`. The raw log entry is written before any interpretation so a
//! delivery is never lost even if its payload is useless.

use std::sync::Arc;

use actlog_core::{strong_key, RawSourceLog, ScoreNormalizer, StableId};
use actlog_sources::{WebhookEnvelope, WEBHOOK_ID_SPACE};
use actlog_storage::{CreateOutcome, RecordStore, StoreError};
use chrono::Utc;
use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::{event_from_draft, fire_completion_hook, profile_from_draft, CompletionHook};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryOutcome {
    Recorded,
    SkippedDuplicate,
    SkippedUnrecognizedKind,
    Dropped,
    Failed,
}

impl DeliveryOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryOutcome::Recorded => "recorded",
            DeliveryOutcome::SkippedDuplicate => "skipped_duplicate",
            DeliveryOutcome::SkippedUnrecognizedKind => "skipped_unrecognized_kind",
            DeliveryOutcome::Dropped => "dropped",
            DeliveryOutcome::Failed => "failed",
        }
    }
}

#[derive(Clone)]
pub struct WebhookIngestor {
    store: Arc<dyn RecordStore>,
    normalizer: ScoreNormalizer,
    hook: Arc<dyn CompletionHook>,
}

impl WebhookIngestor {
    pub fn new(store: Arc<dyn RecordStore>, normalizer: ScoreNormalizer, hook: Arc<dyn CompletionHook>) -> Self {
        Self {
            store,
            normalizer,
            hook,
        }
    }

    /// Never fails; every problem is logged and folded into the outcome.
    pub async fn ingest_bytes(&self, body: &[u8]) -> DeliveryOutcome {
        match serde_json::from_slice::<JsonValue>(body) {
            Ok(value) => self.ingest(&value).await,
            Err(err) => {
                warn!(error = %err, bytes = body.len(), "dropping webhook body that is not JSON");
                DeliveryOutcome::Dropped
            }
        }
    }

    pub async fn ingest(&self, body: &JsonValue) -> DeliveryOutcome {
        let envelope = match WebhookEnvelope::parse(body) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(error = %err, class = ?err.class(), "dropping malformed webhook delivery");
                return DeliveryOutcome::Dropped;
            }
        };

        let span = info_span!(
            "webhook_delivery",
            delivery_id = %envelope.delivery_id,
            topic = envelope.topic_label().as_deref().unwrap_or("-")
        );
        match self.process(&envelope).instrument(span.clone()).await {
            Ok(outcome) => {
                span.in_scope(|| debug!(outcome = outcome.as_str(), "delivery processed"));
                outcome
            }
            Err(err) => {
                span.in_scope(|| error!(error = %err, "webhook delivery failed"));
                DeliveryOutcome::Failed
            }
        }
    }

    async fn process(&self, envelope: &WebhookEnvelope) -> Result<DeliveryOutcome, StoreError> {
        if self.store.raw_log_exists(&envelope.delivery_id).await? {
            debug!("delivery already logged");
            return Ok(DeliveryOutcome::SkippedDuplicate);
        }
        if let Some(key) = strong_key(StableId::new(WEBHOOK_ID_SPACE, &envelope.delivery_id)) {
            if self.store.find_event_by_key(&key).await?.is_some() {
                debug!("delivery already recorded as an event");
                return Ok(DeliveryOutcome::SkippedDuplicate);
            }
        }

        self.store
            .append_raw_log(&RawSourceLog {
                delivery_id: envelope.delivery_id.clone(),
                topic: envelope.topic_label(),
                body: envelope.body.clone(),
                received_at: Utc::now(),
            })
            .await?;

        let Some(kind) = envelope.event_kind() else {
            info!("no event kind for topic; raw delivery kept");
            return Ok(DeliveryOutcome::SkippedUnrecognizedKind);
        };

        let draft = match envelope.to_draft(kind) {
            Ok(draft) => draft,
            Err(err) => {
                warn!(error = %err, class = ?err.class(), %kind, "dropping delivery missing required fields");
                return Ok(DeliveryOutcome::Dropped);
            }
        };
        let event = match event_from_draft(&draft, &self.normalizer) {
            Ok(event) => event,
            Err(err) => {
                warn!(error = %err, class = ?err.class(), "dropping delivery");
                return Ok(DeliveryOutcome::Dropped);
            }
        };

        if let Some(profile) = profile_from_draft(&draft) {
            self.store.upsert_subject_profile(&profile).await?;
        }

        match self.store.create_event(&event).await? {
            CreateOutcome::Created => {
                fire_completion_hook(&self.hook, &event);
                info!(event_id = %event.id, %kind, score = ?event.score_percent, "activity recorded");
                Ok(DeliveryOutcome::Recorded)
            }
            CreateOutcome::DuplicateKey(existing) => {
                debug!(%existing, "dedupe key already held");
                Ok(DeliveryOutcome::SkippedDuplicate)
            }
        }
    }
}
