//! Parquet snapshot of the activity log for downstream reporting.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use actlog_core::{sha256_hex, ActivityEvent};
use actlog_storage::{EventFilter, RecordStore};
use anyhow::{Context, Result};
use arrow_array::{Float64Array, Int32Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{DateTime, Utc};
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};
use tracing::info;

const EXPORT_PAGE: usize = 1_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotManifest {
    pub generated_at: DateTime<Utc>,
    pub rows: usize,
    pub files: Vec<SnapshotManifestFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SnapshotManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

/// Writes `activity_events.parquet` and `manifest.json` into `out_dir`.
pub async fn export_activity_snapshot(store: &dyn RecordStore, out_dir: &Path) -> Result<SnapshotManifest> {
    let mut events = Vec::new();
    let mut after_id = None;
    loop {
        let page = store
            .filter_events(&EventFilter {
                after_id,
                limit: Some(EXPORT_PAGE),
                ..Default::default()
            })
            .await
            .context("reading activity events for export")?;
        let fetched = page.len();
        after_id = page.last().map(|e| e.id);
        events.extend(page);
        if fetched < EXPORT_PAGE {
            break;
        }
    }

    tokio::fs::create_dir_all(out_dir)
        .await
        .with_context(|| format!("creating {}", out_dir.display()))?;
    let events_path = out_dir.join("activity_events.parquet");
    write_events_parquet(&events_path, &events)?;

    let manifest = SnapshotManifest {
        generated_at: Utc::now(),
        rows: events.len(),
        files: vec![manifest_entry("activity_events", out_dir, &events_path)?],
    };
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing snapshot manifest")?;
    tokio::fs::write(out_dir.join("manifest.json"), bytes)
        .await
        .context("writing snapshot manifest")?;
    info!(rows = manifest.rows, dir = %out_dir.display(), "activity snapshot exported");
    Ok(manifest)
}

fn write_parquet(path: &PathBuf, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn text_column<'a>(events: &'a [ActivityEvent], get: impl Fn(&'a ActivityEvent) -> Option<&'a str>) -> StringArray {
    StringArray::from(events.iter().map(get).collect::<Vec<_>>())
}

fn write_events_parquet(path: &PathBuf, events: &[ActivityEvent]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("id", DataType::Utf8, false),
        ArrowField::new("subject_id", DataType::Utf8, true),
        ArrowField::new("subject_email", DataType::Utf8, true),
        ArrowField::new("event_kind", DataType::Utf8, false),
        ArrowField::new("course_id", DataType::Utf8, true),
        ArrowField::new("course_name", DataType::Utf8, true),
        ArrowField::new("content_id", DataType::Utf8, true),
        ArrowField::new("content_title", DataType::Utf8, true),
        ArrowField::new("attempt_number", DataType::Int32, true),
        ArrowField::new("score_percent", DataType::Float64, true),
        ArrowField::new("correct_count", DataType::Int32, true),
        ArrowField::new("incorrect_count", DataType::Int32, true),
        ArrowField::new("occurred_at", DataType::Utf8, false),
        ArrowField::new("source", DataType::Utf8, false),
        ArrowField::new("dedupe_key", DataType::Utf8, false),
    ]));

    let ids = StringArray::from(events.iter().map(|e| Some(e.id.to_string())).collect::<Vec<_>>());
    let subject_ids = text_column(events, |e| e.subject_id.as_deref());
    let subject_emails = text_column(events, |e| e.subject_email.as_deref());
    let kinds = text_column(events, |e| Some(e.event_kind.as_str()));
    let course_ids = text_column(events, |e| e.course_id.as_deref());
    let course_names = text_column(events, |e| e.course_name.as_deref());
    let content_ids = text_column(events, |e| e.content_id.as_deref());
    let content_titles = text_column(events, |e| e.content_title.as_deref());
    let attempts = Int32Array::from(events.iter().map(|e| e.attempt_number).collect::<Vec<_>>());
    let scores = Float64Array::from(events.iter().map(|e| e.score_percent).collect::<Vec<_>>());
    let correct = Int32Array::from(events.iter().map(|e| e.correct_count).collect::<Vec<_>>());
    let incorrect = Int32Array::from(events.iter().map(|e| e.incorrect_count).collect::<Vec<_>>());
    let occurred_at = StringArray::from(
        events
            .iter()
            .map(|e| Some(e.occurred_at.to_rfc3339()))
            .collect::<Vec<_>>(),
    );
    let sources = text_column(events, |e| Some(e.source.as_str()));
    let keys = StringArray::from(events.iter().map(|e| Some(e.dedupe_key.to_string())).collect::<Vec<_>>());

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(ids),
            Arc::new(subject_ids),
            Arc::new(subject_emails),
            Arc::new(kinds),
            Arc::new(course_ids),
            Arc::new(course_names),
            Arc::new(content_ids),
            Arc::new(content_titles),
            Arc::new(attempts),
            Arc::new(scores),
            Arc::new(correct),
            Arc::new(incorrect),
            Arc::new(occurred_at),
            Arc::new(sources),
            Arc::new(keys),
        ],
    )
    .context("building activity_events record batch")?;
    write_parquet(path, batch)
}

fn manifest_entry(name: &str, out_dir: &Path, path: &PathBuf) -> Result<SnapshotManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let rel = path.strip_prefix(out_dir).unwrap_or(path).display().to_string();
    Ok(SnapshotManifestFile {
        name: name.to_string(),
        path: rel,
        sha256: sha256_hex(&bytes),
        bytes: bytes.len() as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use actlog_core::{DedupeKey, EventKind, EventSource};
    use actlog_storage::MemoryStore;
    use parquet::file::reader::{FileReader, SerializedFileReader};
    use uuid::Uuid;

    fn event(n: i32) -> ActivityEvent {
        ActivityEvent {
            id: Uuid::new_v4(),
            subject_id: Some(format!("S{n}")),
            subject_email: None,
            event_kind: EventKind::LessonCompleted,
            course_id: Some("C".into()),
            course_name: None,
            content_id: Some(format!("L{n}")),
            content_title: Some("Intro".into()),
            attempt_number: None,
            score_percent: if n % 2 == 0 { Some(80.0) } else { None },
            correct_count: None,
            incorrect_count: None,
            occurred_at: Utc::now(),
            source: EventSource::Webhook,
            dedupe_key: DedupeKey::Strong(format!("{n:032x}")),
            raw_payload: serde_json::json!({}),
            recorded_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn snapshot_writes_every_event_and_a_matching_manifest() {
        let store = MemoryStore::new();
        for n in 0..3 {
            store.create_event(&event(n)).await.expect("insert");
        }
        let dir = tempfile::tempdir().expect("tempdir");

        let manifest = export_activity_snapshot(&store, dir.path()).await.expect("export");
        assert_eq!(manifest.rows, 3);
        assert_eq!(manifest.files[0].path, "activity_events.parquet");

        let parquet_path = dir.path().join("activity_events.parquet");
        let bytes = std::fs::read(&parquet_path).expect("parquet");
        assert_eq!(manifest.files[0].sha256, sha256_hex(&bytes));
        let reader = SerializedFileReader::new(File::open(&parquet_path).expect("open")).expect("reader");
        assert_eq!(reader.metadata().file_metadata().num_rows(), 3);

        let on_disk: SnapshotManifest =
            serde_json::from_slice(&std::fs::read(dir.path().join("manifest.json")).expect("manifest")).expect("json");
        assert_eq!(on_disk.files, manifest.files);
    }
}
