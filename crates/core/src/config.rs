//! Engine configuration.
//!
//! Every component receives an [`EngineConfig`] (or one of its blocks) in its
//! constructor; nothing is read from process-wide state after construction.

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tracing::warn;

use crate::model::{MergeStrategy, ResolutionStrategy};
use crate::{Result, VerityError};

/// Relationship types the upstream extractor is expected to produce. Anything
/// else is accepted but flagged.
pub const DEFAULT_RELATIONSHIP_TYPES: &[&str] = &[
    "works_at",
    "worked_at",
    "knows",
    "located_in",
    "lives_in",
    "part_of",
    "member_of",
    "owns",
    "created",
    "founded",
    "married_to",
    "parent_of",
    "child_of",
    "related_to",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub entity_collection: String,
    pub relationship_collection: String,
    pub audit_collection: String,
    /// Strategy used when a caller does not name one.
    pub default_strategy: ResolutionStrategy,
    /// Attribute policy for the `merge` resolution strategy.
    pub relationship_merge_policy: MergeStrategy,
    /// Re-read-and-retry budget for revision conflicts.
    pub max_write_retries: u32,
    /// Upper bound on `merged_into` hops followed when resolving tombstones.
    pub max_merge_chain_depth: usize,
    pub matching: MatchingConfig,
    pub validation: ValidationConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            entity_collection: "entities".to_string(),
            relationship_collection: "relationships".to_string(),
            audit_collection: "contradiction_log".to_string(),
            default_strategy: ResolutionStrategy::NewestWins,
            relationship_merge_policy: MergeStrategy::Union,
            max_write_retries: 3,
            max_merge_chain_depth: 16,
            matching: MatchingConfig::default(),
            validation: ValidationConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchingConfig {
    /// Minimum confidence of the best candidate before an entity is merged.
    pub min_confidence: f64,
    /// Minimum cosine similarity for a similarity match.
    pub min_similarity: f64,
    pub max_results: usize,
    pub use_variants: bool,
    pub auto_merge: bool,
    pub merge_strategy: MergeStrategy,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            min_confidence: 0.85,
            min_similarity: 0.8,
            max_results: 10,
            use_variants: true,
            auto_merge: true,
            merge_strategy: MergeStrategy::Union,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    pub known_relationship_types: Vec<String>,
    /// Require a `rationale` text attribute on every new relationship.
    pub require_rationale: bool,
    pub min_rationale_len: usize,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            known_relationship_types: DEFAULT_RELATIONSHIP_TYPES
                .iter()
                .map(|t| t.to_string())
                .collect(),
            require_rationale: false,
            min_rationale_len: 10,
        }
    }
}

impl EngineConfig {
    /// Parse a JSON document; missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by `VERITY_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for the `VERITY_*`
    /// keys. Unparsable values are ignored with a warning.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(v) = lookup("VERITY_ENTITY_COLLECTION") {
            config.entity_collection = v;
        }
        if let Some(v) = lookup("VERITY_RELATIONSHIP_COLLECTION") {
            config.relationship_collection = v;
        }
        if let Some(v) = lookup("VERITY_AUDIT_COLLECTION") {
            config.audit_collection = v;
        }
        override_parsed(&lookup, "VERITY_DEFAULT_STRATEGY", &mut config.default_strategy);
        override_parsed(
            &lookup,
            "VERITY_RELATIONSHIP_MERGE_POLICY",
            &mut config.relationship_merge_policy,
        );
        override_parsed(&lookup, "VERITY_MAX_WRITE_RETRIES", &mut config.max_write_retries);
        override_parsed(
            &lookup,
            "VERITY_MAX_MERGE_CHAIN_DEPTH",
            &mut config.max_merge_chain_depth,
        );
        override_parsed(&lookup, "VERITY_MIN_CONFIDENCE", &mut config.matching.min_confidence);
        override_parsed(&lookup, "VERITY_MIN_SIMILARITY", &mut config.matching.min_similarity);
        override_parsed(&lookup, "VERITY_MAX_RESULTS", &mut config.matching.max_results);
        override_parsed(&lookup, "VERITY_USE_VARIANTS", &mut config.matching.use_variants);
        override_parsed(&lookup, "VERITY_AUTO_MERGE", &mut config.matching.auto_merge);
        override_parsed(&lookup, "VERITY_MERGE_STRATEGY", &mut config.matching.merge_strategy);
        override_parsed(
            &lookup,
            "VERITY_REQUIRE_RATIONALE",
            &mut config.validation.require_rationale,
        );
        override_parsed(
            &lookup,
            "VERITY_MIN_RATIONALE_LEN",
            &mut config.validation.min_rationale_len,
        );
        if let Some(v) = lookup("VERITY_KNOWN_RELATIONSHIP_TYPES") {
            config.validation.known_relationship_types = v
                .split(',')
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect();
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let collections = [
            &self.entity_collection,
            &self.relationship_collection,
            &self.audit_collection,
        ];
        if collections.iter().any(|c| c.trim().is_empty()) {
            return Err(VerityError::Validation(
                "collection names must not be empty".to_string(),
            ));
        }
        if self.entity_collection == self.relationship_collection
            || self.entity_collection == self.audit_collection
            || self.relationship_collection == self.audit_collection
        {
            return Err(VerityError::Validation(
                "collection names must be distinct".to_string(),
            ));
        }
        for (name, value) in [
            ("min_confidence", self.matching.min_confidence),
            ("min_similarity", self.matching.min_similarity),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(VerityError::Validation(format!(
                    "`{name}` must be within [0, 1], got {value}"
                )));
            }
        }
        if self.matching.max_results == 0 {
            return Err(VerityError::Validation(
                "`max_results` must be >= 1".to_string(),
            ));
        }
        if self.max_merge_chain_depth == 0 {
            return Err(VerityError::Validation(
                "`max_merge_chain_depth` must be >= 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn override_parsed<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    slot: &mut T,
) {
    if let Some(raw) = lookup(key) {
        match raw.trim().parse::<T>() {
            Ok(v) => *slot = v,
            Err(_) => warn!(key, value = %raw, "ignoring unparsable configuration value"),
        }
    }
}
