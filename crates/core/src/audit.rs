//! Append-only audit trail of contradiction resolutions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::contradiction::ResolutionAction;
use crate::model::{Attributes, EntityId, Relationship, RelationshipId, ResolutionStrategy};
use crate::store::GraphStore;
use crate::Result;

/// The fields of a relationship worth keeping in an audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeSummary {
    pub id: RelationshipId,
    pub from: EntityId,
    pub to: EntityId,
    #[serde(rename = "type")]
    pub rel_type: String,
    pub created_at: DateTime<Utc>,
    pub valid_at: DateTime<Utc>,
    pub invalid_at: Option<DateTime<Utc>>,
}

impl From<&Relationship> for EdgeSummary {
    fn from(rel: &Relationship) -> Self {
        Self {
            id: rel.id.clone(),
            from: rel.from_id.clone(),
            to: rel.to_id.clone(),
            rel_type: rel.rel_type.clone(),
            created_at: rel.created_at,
            valid_at: rel.valid_at,
            invalid_at: rel.invalid_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolutionSummary {
    pub action: ResolutionAction,
    pub strategy: ResolutionStrategy,
    pub reason: String,
    pub success: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Resolved,
    Failed,
}

/// One resolved (or failed) contradiction between two relationships.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContradictionRecord {
    pub timestamp: DateTime<Utc>,
    pub new_edge: EdgeSummary,
    pub existing_edge: EdgeSummary,
    pub resolution: ResolutionSummary,
    /// Free-form context such as the error of a failed resolution.
    #[serde(default)]
    pub context: Attributes,
    pub status: RecordStatus,
}

impl ContradictionRecord {
    pub fn new(
        new_edge: &Relationship,
        existing_edge: &Relationship,
        resolution: ResolutionSummary,
    ) -> Self {
        let status = if resolution.success {
            RecordStatus::Resolved
        } else {
            RecordStatus::Failed
        };
        Self {
            timestamp: Utc::now(),
            new_edge: new_edge.into(),
            existing_edge: existing_edge.into(),
            resolution,
            context: Attributes::new(),
            status,
        }
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<crate::Value>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

/// Counts over the audit trail.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AuditSummary {
    pub resolved: usize,
    pub failed: usize,
    pub by_strategy: BTreeMap<ResolutionStrategy, usize>,
}

/// Writes contradiction records to the store's audit collection.
#[derive(Clone)]
pub struct ContradictionLogger {
    store: Arc<dyn GraphStore>,
}

impl ContradictionLogger {
    pub fn new(store: Arc<dyn GraphStore>) -> Self {
        Self { store }
    }

    /// Record `record`. A failure to write the audit trail never fails the
    /// resolution it describes, so errors are logged and swallowed.
    pub fn log(&self, record: &ContradictionRecord) {
        info!(
            new_edge = %record.new_edge.id,
            existing_edge = %record.existing_edge.id,
            strategy = %record.resolution.strategy,
            reason = %record.resolution.reason,
            status = ?record.status,
            "contradiction handled"
        );
        if let Err(e) = self.store.append_audit(record) {
            warn!(error = %e, new_edge = %record.new_edge.id, "failed to write audit record");
        }
    }

    /// The `limit` most recent records, newest first.
    pub fn recent(&self, limit: usize) -> Result<Vec<ContradictionRecord>> {
        self.store.recent_audit(limit)
    }

    pub fn summary(&self) -> Result<AuditSummary> {
        let mut summary = AuditSummary::default();
        for record in self.store.recent_audit(usize::MAX)? {
            match record.status {
                RecordStatus::Resolved => summary.resolved += 1,
                RecordStatus::Failed => summary.failed += 1,
            }
            *summary
                .by_strategy
                .entry(record.resolution.strategy)
                .or_default() += 1;
        }
        Ok(summary)
    }
}
