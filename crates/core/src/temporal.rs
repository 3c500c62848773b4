//! Valid-time intervals and the temporal metadata enhancer.
//!
//! Intervals are half-open, `[start, end)`, with `end = None` meaning the
//! interval is still open.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use tracing::warn;

use crate::model::{NewRelationship, Relationship, RelationshipId};
use crate::{Result, VerityError};

/// A half-open validity interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interval {
    pub start: DateTime<Utc>,
    pub end: Option<DateTime<Utc>>,
}

impl Interval {
    pub fn new(start: DateTime<Utc>, end: Option<DateTime<Utc>>) -> Self {
        Self { start, end }
    }

    /// `[a1, b1)` and `[a2, b2)` overlap iff `a1 < b2 && a2 < b1`, where an
    /// open end is `+∞`.
    pub fn overlaps(&self, other: &Interval) -> bool {
        let self_starts_first = other.end.is_none_or(|end| self.start < end);
        let other_starts_first = self.end.is_none_or(|end| other.start < end);
        self_starts_first && other_starts_first
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.start <= at && self.end.is_none_or(|end| end > at)
    }
}

/// A timestamp as handed over by a caller: already structured, or raw text
/// from an upstream extractor.
#[derive(Debug, Clone, PartialEq)]
pub enum TimeInput {
    At(DateTime<Utc>),
    Text(String),
}

impl From<DateTime<Utc>> for TimeInput {
    fn from(at: DateTime<Utc>) -> Self {
        TimeInput::At(at)
    }
}
impl From<&str> for TimeInput {
    fn from(s: &str) -> Self {
        TimeInput::Text(s.to_string())
    }
}
impl From<String> for TimeInput {
    fn from(s: String) -> Self {
        TimeInput::Text(s)
    }
}

/// Parse textual timestamps: RFC 3339, naive `YYYY-MM-DDTHH:MM:SS` (read as
/// UTC), or a bare `YYYY-MM-DD` date (midnight UTC).
pub fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if let Ok(at) = DateTime::parse_from_rfc3339(text) {
        return Some(at.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, fmt) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// Resolve a [`TimeInput`], degrading unparsable text to `now` with a warning.
pub fn resolve_time_input(input: &TimeInput, field: &str, now: DateTime<Utc>) -> DateTime<Utc> {
    match input {
        TimeInput::At(at) => *at,
        TimeInput::Text(text) => parse_timestamp(text).unwrap_or_else(|| {
            warn!(field, input = %text, "unparsable timestamp, falling back to current time");
            now
        }),
    }
}

/// Stamps new relationships with bi-temporal metadata.
///
/// The enhancer only produces the decorated document; persisting it is the
/// caller's job.
#[derive(Debug, Clone, Copy, Default)]
pub struct TemporalEnhancer;

impl TemporalEnhancer {
    pub fn new() -> Self {
        Self
    }

    /// Enhance `relationship` using the current wall-clock time.
    ///
    /// `created_at = now`, `valid_at = reference_time or now`,
    /// `invalid_at = valid_until or None`, `confidence` defaults to 1.0.
    ///
    /// # Errors
    ///
    /// Returns [`VerityError::Validation`] if the resulting interval is empty
    /// or reversed (`invalid_at <= valid_at`).
    pub fn enhance(
        &self,
        relationship: NewRelationship,
        reference_time: Option<TimeInput>,
        valid_until: Option<TimeInput>,
    ) -> Result<Relationship> {
        self.enhance_at(relationship, reference_time, valid_until, Utc::now())
    }

    /// Like [`enhance`](Self::enhance) with an explicit transaction time.
    pub fn enhance_at(
        &self,
        relationship: NewRelationship,
        reference_time: Option<TimeInput>,
        valid_until: Option<TimeInput>,
        now: DateTime<Utc>,
    ) -> Result<Relationship> {
        let valid_at = reference_time
            .as_ref()
            .map_or(now, |t| resolve_time_input(t, "reference_time", now));
        let invalid_at = valid_until
            .as_ref()
            .map(|t| resolve_time_input(t, "valid_until", now));

        if let Some(end) = invalid_at {
            if end <= valid_at {
                return Err(VerityError::Validation(format!(
                    "invalid_at ({end}) must be later than valid_at ({valid_at})"
                )));
            }
        }

        Ok(Relationship {
            id: RelationshipId::new(),
            from_id: relationship.from_id,
            to_id: relationship.to_id,
            rel_type: relationship.rel_type,
            attributes: relationship.attributes,
            confidence: relationship.confidence.unwrap_or(1.0),
            created_at: now,
            valid_at,
            invalid_at,
            invalidation_reason: None,
            invalidated_by: None,
            revision: 0,
        })
    }
}
