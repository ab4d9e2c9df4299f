//! Spreadsheet imports driven by a declarative column-mapping table.
//!
//! Every supported layout is one [`ColumnVariant`]: header aliases per logical field, value
//! spellings for the event kind, timestamp formats and the identifier namespace of its
//! stable id column. A new layout is a new table entry, not new parsing code.

use std::collections::BTreeMap;
use std::path::Path;

use actlog_core::{EventKind, EventSource, IngestError};
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};

use crate::{text_or_none, ActivityDraft, Candidate, CandidateError, RecoveredFields, SourceError, SourceStableId};

const BUILTIN_MAPPINGS: &str = include_str!("../../../config/column_mappings.yaml");

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CsvField {
    StableId,
    SubjectId,
    SubjectEmail,
    SubjectName,
    EventKind,
    CourseId,
    CourseName,
    ContentId,
    ContentTitle,
    AttemptNumber,
    Score,
    CorrectCount,
    IncorrectCount,
    OccurredAt,
}

impl CsvField {
    fn label(&self) -> &'static str {
        match self {
            CsvField::StableId => "stable_id",
            CsvField::SubjectId => "subject_id",
            CsvField::SubjectEmail => "subject_email",
            CsvField::SubjectName => "subject_name",
            CsvField::EventKind => "event_kind",
            CsvField::CourseId => "course_id",
            CsvField::CourseName => "course_name",
            CsvField::ContentId => "content_id",
            CsvField::ContentTitle => "content_title",
            CsvField::AttemptNumber => "attempt_number",
            CsvField::Score => "score",
            CsvField::CorrectCount => "correct_count",
            CsvField::IncorrectCount => "incorrect_count",
            CsvField::OccurredAt => "occurred_at",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnVariant {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub stable_id_space: Option<String>,
    #[serde(default)]
    pub default_event_kind: Option<EventKind>,
    #[serde(default)]
    pub kind_values: BTreeMap<String, EventKind>,
    #[serde(default)]
    pub timestamp_formats: Vec<String>,
    pub columns: BTreeMap<CsvField, Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnMappingTable {
    #[serde(default = "default_version")]
    pub version: u32,
    pub variants: Vec<ColumnVariant>,
}

fn default_version() -> u32 {
    1
}

impl ColumnMappingTable {
    pub fn builtin() -> Result<Self, SourceError> {
        Self::from_yaml_str(BUILTIN_MAPPINGS)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, SourceError> {
        let table: ColumnMappingTable =
            serde_yaml::from_str(text).map_err(|e| SourceError::Mapping(e.to_string()))?;
        let mut seen = std::collections::BTreeSet::new();
        for variant in &table.variants {
            if !seen.insert(variant.name.as_str()) {
                return Err(SourceError::Mapping(format!("duplicate variant {}", variant.name)));
            }
        }
        Ok(table)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, SourceError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| SourceError::Mapping(format!("reading {}: {e}", path.display())))?;
        Self::from_yaml_str(&text)
    }

    pub fn variant(&self, name: &str) -> Result<&ColumnVariant, SourceError> {
        self.variants
            .iter()
            .find(|v| v.name == name)
            .ok_or_else(|| SourceError::Mapping(format!("unknown column variant {name:?}")))
    }

    pub fn names(&self) -> Vec<&str> {
        self.variants.iter().map(|v| v.name.as_str()).collect()
    }
}

pub(crate) fn normalize_header(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_alphanumeric() || *c == '%' || *c == '#')
        .flat_map(char::to_lowercase)
        .collect()
}

/// Logical field to the header it was found under.
#[derive(Debug, Clone, Default)]
struct ResolvedColumns(BTreeMap<CsvField, String>);

impl ResolvedColumns {
    fn resolve<'h>(variant: &ColumnVariant, headers: impl Iterator<Item = &'h str> + Clone) -> Self {
        let mut resolved = BTreeMap::new();
        for (field, aliases) in &variant.columns {
            let found = aliases.iter().find_map(|alias| {
                let wanted = normalize_header(alias);
                headers.clone().find(|h| normalize_header(h) == wanted)
            });
            if let Some(header) = found {
                resolved.insert(*field, header.to_string());
            }
        }
        Self(resolved)
    }

    fn has(&self, field: CsvField) -> bool {
        self.0.contains_key(&field)
    }

    fn require(&self, variant: &ColumnVariant, fields: &[CsvField]) -> Result<(), SourceError> {
        if fields.iter().any(|f| self.has(*f)) {
            return Ok(());
        }
        let names = fields.iter().map(|f| f.label()).collect::<Vec<_>>().join(" or ");
        Err(SourceError::Mapping(format!("variant {}: no column found for {names}", variant.name)))
    }
}

struct RowView<'a> {
    variant: &'a ColumnVariant,
    columns: &'a ResolvedColumns,
    values: &'a BTreeMap<String, String>,
    reference: String,
}

impl RowView<'_> {
    fn get(&self, field: CsvField) -> Option<String> {
        let header = self.columns.0.get(&field)?;
        self.values.get(header).and_then(|v| text_or_none(v))
    }

    fn count(&self, field: CsvField) -> Option<i32> {
        self.get(field).as_deref().and_then(parse_count)
    }

    fn event_kind(&self) -> Result<EventKind, IngestError> {
        let Some(raw) = self.get(CsvField::EventKind) else {
            return self.variant.default_event_kind.ok_or_else(|| {
                IngestError::Malformed(format!("{}: no event kind", self.reference))
            });
        };
        let wanted = normalize_header(&raw);
        self.variant
            .kind_values
            .iter()
            .find(|(spelling, _)| normalize_header(spelling) == wanted)
            .map(|(_, kind)| *kind)
            .or_else(|| EventKind::from_alias(&raw))
            .ok_or_else(|| IngestError::Malformed(format!("{}: unknown event kind {raw:?}", self.reference)))
    }

    fn occurred_at(&self) -> Result<DateTime<Utc>, IngestError> {
        let raw = self
            .get(CsvField::OccurredAt)
            .ok_or_else(|| IngestError::Malformed(format!("{}: no timestamp", self.reference)))?;
        parse_timestamp(&raw, &self.variant.timestamp_formats)
            .ok_or_else(|| IngestError::Malformed(format!("{}: unparseable timestamp {raw:?}", self.reference)))
    }

    fn fields(&self) -> RecoveredFields {
        RecoveredFields {
            raw_score: self.get(CsvField::Score).map(JsonValue::String).unwrap_or(JsonValue::Null),
            correct_count: self.count(CsvField::CorrectCount),
            incorrect_count: self.count(CsvField::IncorrectCount),
            attempt_number: self.count(CsvField::AttemptNumber),
            course_name: self.get(CsvField::CourseName),
            content_title: self.get(CsvField::ContentTitle),
        }
    }

    fn raw_payload(&self, line: u64) -> JsonValue {
        json!({ "variant": self.variant.name, "line": line, "row": self.values })
    }

    fn to_draft(&self, line: u64) -> Result<ActivityDraft, IngestError> {
        let draft = ActivityDraft {
            source: EventSource::CsvImport,
            source_ref: self.reference.clone(),
            subject_id: self.get(CsvField::SubjectId),
            subject_email: self.get(CsvField::SubjectEmail),
            subject_name: self.get(CsvField::SubjectName),
            event_kind: self.event_kind()?,
            course_id: self.get(CsvField::CourseId),
            content_id: self.get(CsvField::ContentId),
            occurred_at: self.occurred_at()?,
            stable_id: self.get(CsvField::StableId).map(|id| SourceStableId {
                space: self.variant.stable_id_space.clone(),
                id,
            }),
            fields: self.fields(),
            raw_payload: self.raw_payload(line),
        };
        draft.validate()?;
        Ok(draft)
    }
}

fn parse_count(raw: &str) -> Option<i32> {
    let trimmed = raw.trim();
    trimmed.parse::<i32>().ok().or_else(|| {
        trimmed
            .parse::<f64>()
            .ok()
            .filter(|v| v.fract() == 0.0 && v.abs() <= f64::from(i32::MAX))
            .map(|v| v as i32)
    })
}

pub(crate) fn parse_timestamp(raw: &str, formats: &[String]) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in formats {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(Utc.from_utc_datetime(&naive));
        }
        if let Ok(date) = NaiveDate::parse_from_str(raw, format) {
            return date.and_hms_opt(0, 0, 0).map(|n| Utc.from_utc_datetime(&n));
        }
    }
    None
}

struct CsvRows {
    columns: ResolvedColumns,
    rows: Vec<(u64, Result<BTreeMap<String, String>, csv::Error>)>,
}

fn read_rows(text: &str, variant: &ColumnVariant) -> Result<CsvRows, SourceError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(text.as_bytes());
    let headers = reader
        .headers()?
        .iter()
        .map(|h| h.trim_start_matches('\u{feff}').to_string())
        .collect::<Vec<_>>();
    let columns = ResolvedColumns::resolve(variant, headers.iter().map(String::as_str));

    let mut rows = Vec::new();
    for (index, record) in reader.records().enumerate() {
        let fallback_line = index as u64 + 2;
        match record {
            Ok(record) => {
                let line = record.position().map(|p| p.line()).unwrap_or(fallback_line);
                let values = headers
                    .iter()
                    .zip(record.iter())
                    .map(|(h, v)| (h.clone(), v.to_string()))
                    .collect();
                rows.push((line, Ok(values)));
            }
            Err(err) => {
                let line = err.position().map(|p| p.line()).unwrap_or(fallback_line);
                rows.push((line, Err(err)));
            }
        }
    }
    Ok(CsvRows { columns, rows })
}

/// Parses a whole upload. Header problems fail the file; row problems become per-row errors.
pub fn parse_csv(text: &str, variant: &ColumnVariant) -> Result<Vec<Candidate>, SourceError> {
    let parsed = read_rows(text, variant)?;
    parsed.columns.require(variant, &[CsvField::SubjectId, CsvField::SubjectEmail])?;
    parsed.columns.require(variant, &[CsvField::OccurredAt])?;
    if variant.default_event_kind.is_none() {
        parsed.columns.require(variant, &[CsvField::EventKind])?;
    }

    Ok(parsed
        .rows
        .into_iter()
        .map(|(line, row)| {
            let reference = format!("line {line}");
            let values = row.map_err(|e| CandidateError {
                reference: reference.clone(),
                error: IngestError::Malformed(e.to_string()),
            })?;
            let view = RowView {
                variant,
                columns: &parsed.columns,
                values: &values,
                reference: reference.clone(),
            };
            view.to_draft(line).map_err(|error| CandidateError { reference, error })
        })
        .collect())
}

/// One row of a correction spreadsheet: the identity used for matching plus the values
/// it reports.
#[derive(Debug, Clone, PartialEq)]
pub struct CorrectionRow {
    pub line: u64,
    pub subject_id: Option<String>,
    pub subject_email: Option<String>,
    pub content_id: String,
    pub course_id: Option<String>,
    /// Row's own kind column, else the variant default; `None` matches any kind.
    pub event_kind: Option<EventKind>,
    pub reported_at: DateTime<Utc>,
    pub fields: RecoveredFields,
}

pub fn parse_correction_csv(
    text: &str,
    variant: &ColumnVariant,
) -> Result<Vec<Result<CorrectionRow, CandidateError>>, SourceError> {
    let parsed = read_rows(text, variant)?;
    parsed.columns.require(variant, &[CsvField::SubjectId, CsvField::SubjectEmail])?;
    parsed.columns.require(variant, &[CsvField::ContentId])?;
    parsed.columns.require(variant, &[CsvField::OccurredAt])?;

    Ok(parsed
        .rows
        .into_iter()
        .map(|(line, row)| {
            let reference = format!("line {line}");
            let fail = |error| CandidateError {
                reference: reference.clone(),
                error,
            };
            let values = row.map_err(|e| fail(IngestError::Malformed(e.to_string())))?;
            let view = RowView {
                variant,
                columns: &parsed.columns,
                values: &values,
                reference: reference.clone(),
            };
            let subject_id = view.get(CsvField::SubjectId);
            let subject_email = view.get(CsvField::SubjectEmail);
            if subject_id.is_none() && subject_email.is_none() {
                return Err(fail(IngestError::UnresolvedIdentity(format!("{reference}: no subject"))));
            }
            let content_id = view
                .get(CsvField::ContentId)
                .ok_or_else(|| fail(IngestError::Malformed(format!("{reference}: no content id"))))?;
            let reported_at = view.occurred_at().map_err(fail)?;
            let event_kind = match view.get(CsvField::EventKind) {
                Some(_) => Some(view.event_kind().map_err(fail)?),
                None => variant.default_event_kind,
            };
            Ok(CorrectionRow {
                line,
                subject_id,
                subject_email,
                content_id,
                course_id: view.get(CsvField::CourseId),
                event_kind,
                reported_at,
                fields: view.fields(),
            })
        })
        .collect())
}

/// Recovers repairable values from a stored `{"variant", "row"}` payload.
pub fn recover_row_fields(raw_payload: &JsonValue, mappings: &ColumnMappingTable) -> Result<RecoveredFields, SourceError> {
    let variant_name = raw_payload
        .get("variant")
        .and_then(JsonValue::as_str)
        .ok_or_else(|| SourceError::Message("stored csv payload has no variant".to_string()))?;
    let variant = mappings.variant(variant_name)?;
    let values: BTreeMap<String, String> = raw_payload
        .get("row")
        .and_then(JsonValue::as_object)
        .ok_or_else(|| SourceError::Message("stored csv payload has no row".to_string()))?
        .iter()
        .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
        .collect();
    let columns = ResolvedColumns::resolve(variant, values.keys().map(String::as_str));
    let view = RowView {
        variant,
        columns: &columns,
        values: &values,
        reference: "stored row".to_string(),
    };
    Ok(view.fields())
}
