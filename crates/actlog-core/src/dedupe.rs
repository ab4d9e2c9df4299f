//! Dedupe key derivation.
//!
//! A key is `Strong` when the source supplied its own identifier for the occurrence and
//! `Weak` when it had to be reconstructed from the occurrence's content. Weak keys collapse
//! two distinct occurrences that share kind, subject, content, course and timestamp.

use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::{sha256_hex, EventKind, IngestError};

const KEY_HEX_LEN: usize = 32;
const FIELD_SEPARATOR: &str = "\u{1f}";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum DedupeKey {
    Strong(String),
    Weak(String),
}

impl DedupeKey {
    pub fn is_strong(&self) -> bool {
        matches!(self, DedupeKey::Strong(_))
    }

    pub fn digest(&self) -> &str {
        match self {
            DedupeKey::Strong(d) | DedupeKey::Weak(d) => d,
        }
    }

    pub fn parse(raw: &str) -> Result<Self, IngestError> {
        if let Some(d) = raw.strip_prefix("s_") {
            Ok(DedupeKey::Strong(d.to_string()))
        } else if let Some(d) = raw.strip_prefix("w_") {
            Ok(DedupeKey::Weak(d.to_string()))
        } else {
            Err(IngestError::Malformed(format!("unrecognized dedupe key {raw:?}")))
        }
    }
}

impl fmt::Display for DedupeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DedupeKey::Strong(d) => write!(f, "s_{d}"),
            DedupeKey::Weak(d) => write!(f, "w_{d}"),
        }
    }
}

impl From<DedupeKey> for String {
    fn from(value: DedupeKey) -> Self {
        value.to_string()
    }
}

impl TryFrom<String> for DedupeKey {
    type Error = IngestError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        DedupeKey::parse(&value)
    }
}

/// A source-assigned identifier for one occurrence.
///
/// `space` separates identifier namespaces that could otherwise collide (webhook delivery
/// ids vs LMS result ids). Paths that share a namespace must pass the same `space` so that
/// the same occurrence seen twice yields the same key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StableId<'a> {
    pub space: Option<&'a str>,
    pub id: &'a str,
}

impl<'a> StableId<'a> {
    pub fn new(space: &'a str, id: &'a str) -> Self {
        Self {
            space: Some(space),
            id,
        }
    }

    pub fn unscoped(id: &'a str) -> Self {
        Self { space: None, id }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct KeyInput<'a> {
    pub kind: EventKind,
    pub subject: &'a str,
    pub content_id: Option<&'a str>,
    pub course_id: Option<&'a str>,
    pub occurred_at: DateTime<Utc>,
    pub stable_id: Option<StableId<'a>>,
}

pub fn derive_dedupe_key(input: &KeyInput<'_>) -> DedupeKey {
    if let Some(key) = input.stable_id.and_then(strong_key) {
        return key;
    }

    let material = [
        input.kind.as_str(),
        input.subject.trim(),
        input.content_id.unwrap_or_default().trim(),
        input.course_id.unwrap_or_default().trim(),
        &input.occurred_at.to_rfc3339_opts(SecondsFormat::Secs, true),
    ]
    .join(FIELD_SEPARATOR);
    DedupeKey::Weak(truncated_digest(&material))
}

/// The key a stable id alone determines. `None` for a blank id.
pub fn strong_key(stable: StableId<'_>) -> Option<DedupeKey> {
    let id = stable.id.trim();
    if id.is_empty() {
        return None;
    }
    let material = match stable.space {
        Some(space) => format!("{space}{FIELD_SEPARATOR}{id}"),
        None => id.to_string(),
    };
    Some(DedupeKey::Strong(truncated_digest(&material)))
}

fn truncated_digest(material: &str) -> String {
    let mut digest = sha256_hex(material.as_bytes());
    digest.truncate(KEY_HEX_LEN);
    digest
}
