//! Score normalization onto a single 0-100 scale.
//!
//! Sources disagree on whether a score is a fraction or a percentage, so every ingestion
//! path funnels its raw value through [`ScoreNormalizer`].

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

pub const MAX_PERCENT: f64 = 100.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RawScore<'a> {
    Text(&'a str),
    Number(f64),
    Missing,
}

impl<'a> RawScore<'a> {
    pub fn from_json(value: &'a JsonValue) -> Self {
        match value {
            JsonValue::String(s) => RawScore::Text(s),
            JsonValue::Number(n) => n.as_f64().map(RawScore::Number).unwrap_or(RawScore::Missing),
            _ => RawScore::Missing,
        }
    }
}

impl<'a> From<&'a str> for RawScore<'a> {
    fn from(value: &'a str) -> Self {
        RawScore::Text(value)
    }
}

impl From<f64> for RawScore<'_> {
    fn from(value: f64) -> Self {
        RawScore::Number(value)
    }
}

impl<'a> From<Option<&'a str>> for RawScore<'a> {
    fn from(value: Option<&'a str>) -> Self {
        value.map(RawScore::Text).unwrap_or(RawScore::Missing)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreNormalizer {
    /// Values strictly between zero and this ceiling are read as fractions.
    pub fraction_ceiling: f64,
}

impl Default for ScoreNormalizer {
    fn default() -> Self {
        Self {
            fraction_ceiling: 1.0,
        }
    }
}

impl ScoreNormalizer {
    pub fn new(fraction_ceiling: f64) -> Self {
        Self { fraction_ceiling }
    }

    pub fn normalize<'a>(&self, raw: impl Into<RawScore<'a>>) -> Option<f64> {
        let value = match raw.into() {
            RawScore::Missing => return None,
            RawScore::Number(n) => n,
            RawScore::Text(text) => parse_score_text(text)?,
        };
        if !value.is_finite() {
            return None;
        }
        let scaled = if value > 0.0 && value < self.fraction_ceiling {
            value * 100.0
        } else {
            value
        };
        (0.0..=MAX_PERCENT).contains(&scaled).then(|| round4(scaled))
    }
}

pub fn normalize_score<'a>(raw: impl Into<RawScore<'a>>) -> Option<f64> {
    ScoreNormalizer::default().normalize(raw)
}

fn parse_score_text(text: &str) -> Option<f64> {
    let trimmed = text.trim();
    if trimmed.is_empty()
        || trimmed.eq_ignore_ascii_case("na")
        || trimmed.eq_ignore_ascii_case("n/a")
    {
        return None;
    }
    let numeric = trimmed.strip_suffix('%').unwrap_or(trimmed).trim();
    numeric.parse::<f64>().ok()
}

fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percentage_and_fraction_forms_agree() {
        assert_eq!(normalize_score("70"), Some(70.0));
        assert_eq!(normalize_score("70%"), Some(70.0));
        assert_eq!(normalize_score(0.7), Some(70.0));
        assert_eq!(normalize_score(70.0), Some(70.0));
        assert_eq!(normalize_score(0.85), Some(85.0));
        assert_eq!(normalize_score(" 92.5 % "), Some(92.5));
    }

    #[test]
    fn blanks_markers_and_out_of_range_values_are_unknown() {
        assert_eq!(normalize_score(""), None);
        assert_eq!(normalize_score("NA"), None);
        assert_eq!(normalize_score("n/a"), None);
        assert_eq!(normalize_score("abc"), None);
        assert_eq!(normalize_score(150.0), None);
        assert_eq!(normalize_score(-5.0), None);
        assert_eq!(normalize_score("-5"), None);
        assert_eq!(normalize_score(f64::NAN), None);
        assert_eq!(normalize_score(None::<&str>), None);
    }

    #[test]
    fn boundaries_pass_through_unscaled() {
        assert_eq!(normalize_score(0.0), Some(0.0));
        assert_eq!(normalize_score(1.0), Some(1.0));
        assert_eq!(normalize_score("100"), Some(100.0));
    }

    #[test]
    fn json_values_are_accepted() {
        let grade = serde_json::json!(0.85);
        assert_eq!(normalize_score(RawScore::from_json(&grade)), Some(85.0));
        let text = serde_json::json!("85%");
        assert_eq!(normalize_score(RawScore::from_json(&text)), Some(85.0));
        let null = serde_json::json!(null);
        assert_eq!(normalize_score(RawScore::from_json(&null)), None);
        let flag = serde_json::json!(true);
        assert_eq!(normalize_score(RawScore::from_json(&flag)), None);
    }

    #[test]
    fn fraction_ceiling_is_configurable() {
        let normalizer = ScoreNormalizer::new(0.0);
        assert_eq!(normalizer.normalize(0.5), Some(0.5));
        let normalizer = ScoreNormalizer::new(1.0);
        assert_eq!(normalizer.normalize(0.5), Some(50.0));
    }

    #[test]
    fn wide_fraction_ceiling_never_yields_more_than_100() {
        let normalizer = ScoreNormalizer::new(2.0);
        assert_eq!(normalizer.normalize(1.5), None);
        assert_eq!(normalizer.normalize(1.0), Some(100.0));
        assert_eq!(normalizer.normalize(0.25), Some(25.0));
        assert_eq!(normalizer.normalize(2.0), Some(2.0));
    }
}
