//! Fail-fast checks on relationships submitted by callers.
//!
//! Every check runs before anything is written, so a rejected relationship
//! leaves no partial state behind.

use tracing::warn;

use crate::config::ValidationConfig;
use crate::model::{NewRelationship, Value};
use crate::{Result, VerityError};

/// Attribute holding the free-text justification for a relationship.
pub const RATIONALE_ATTRIBUTE: &str = "rationale";

/// Non-fatal findings about an accepted relationship.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValidationReport {
    /// The relationship type is not one of the configured known types.
    pub custom_type: bool,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn is_clean(&self) -> bool {
        !self.custom_type && self.warnings.is_empty()
    }
}

/// Validate `relationship` against `config`.
///
/// # Errors
///
/// Returns [`VerityError::Validation`] when an endpoint is missing, the type
/// is empty, confidence lies outside `[0, 1]`, or a required rationale is
/// missing or shorter than `min_rationale_len` characters.
pub fn validate_relationship(
    relationship: &NewRelationship,
    config: &ValidationConfig,
) -> Result<ValidationReport> {
    if relationship.from_id.as_str().trim().is_empty() {
        return Err(VerityError::Validation(
            "relationship is missing `from`".to_string(),
        ));
    }
    if relationship.to_id.as_str().trim().is_empty() {
        return Err(VerityError::Validation(
            "relationship is missing `to`".to_string(),
        ));
    }
    let rel_type = relationship.rel_type.trim();
    if rel_type.is_empty() {
        return Err(VerityError::Validation(
            "relationship type must not be empty".to_string(),
        ));
    }
    if let Some(confidence) = relationship.confidence {
        if !(0.0..=1.0).contains(&confidence) {
            return Err(VerityError::Validation(format!(
                "confidence must be within [0, 1], got {confidence}"
            )));
        }
    }
    if config.require_rationale {
        let rationale = match relationship.attributes.get(RATIONALE_ATTRIBUTE) {
            Some(Value::Text(text)) => text.trim(),
            _ => "",
        };
        let len = rationale.chars().count();
        if len < config.min_rationale_len {
            return Err(VerityError::Validation(format!(
                "rationale must be at least {} characters, got {len}",
                config.min_rationale_len
            )));
        }
    }

    let mut report = ValidationReport::default();
    let known = config
        .known_relationship_types
        .iter()
        .any(|t| t.eq_ignore_ascii_case(rel_type));
    if !known {
        warn!(rel_type, "accepting custom relationship type");
        report.custom_type = true;
        report
            .warnings
            .push(format!("custom relationship type `{rel_type}`"));
    }
    if relationship.from_id == relationship.to_id {
        report
            .warnings
            .push("relationship points from an entity to itself".to_string());
    }
    Ok(report)
}
