//! Contradiction detection and resolution.
//!
//! Two relationships contradict each other when they share
//! `(from, to, type)` and their validity intervals overlap. The detector
//! finds such pairs; the resolver reconciles each one under a
//! [`ResolutionStrategy`] by closing the validity of the losing side.
//!
//! Every pair goes through `Detected → Resolving → Resolved | Failed`. Pairs
//! are resolved independently: the two documents touched by one pair are
//! written in a single revision-checked batch, but a failed pair does not roll
//! back pairs resolved before it.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::audit::{ContradictionLogger, ContradictionRecord, ResolutionSummary};
use crate::config::EngineConfig;
use crate::merger::merge_attributes;
use crate::model::{EntityId, MergeStrategy, Relationship, RelationshipId, ResolutionStrategy};
use crate::store::{GraphStore, RelationshipQuery};
use crate::{Result, VerityError};

pub const REASON_SUPERSEDED: &str = "superseded";
pub const REASON_SUPERSEDED_RETROACTIVELY: &str = "superseded_retroactively";
pub const REASON_MERGED: &str = "merged";
pub const REASON_TIMELINE_SPLIT: &str = "timeline_split";
pub const REASON_ALREADY_CONSISTENT: &str = "already_consistent";

/// Shortest validity left to a loser that started no earlier than its winner,
/// so `invalid_at > valid_at` keeps holding.
fn min_validity_window() -> Duration {
    Duration::seconds(1)
}

// ---------------------------------------------------------------------------
// Detection
// ---------------------------------------------------------------------------

pub struct ContradictionDetector {
    store: Arc<dyn GraphStore>,
}

impl ContradictionDetector {
    pub fn new(store: Arc<dyn GraphStore>) -> Self {
        Self { store }
    }

    /// Stored relationships from `from_id` to `to_id`, optionally of one type.
    pub fn find_contradictions(
        &self,
        from_id: &EntityId,
        to_id: &EntityId,
        rel_type: Option<&str>,
        include_invalidated: bool,
    ) -> Result<Vec<Relationship>> {
        let mut query = RelationshipQuery::between(from_id.clone(), to_id.clone());
        if let Some(t) = rel_type {
            query = query.of_type(t);
        }
        if !include_invalidated {
            query = query.current_only();
        }
        self.store.query_relationships(&query)
    }

    /// Stored relationships with the candidate's `(from, to, type)` whose
    /// validity overlaps the candidate's. The candidate itself is excluded.
    pub fn find_temporal_contradictions(&self, candidate: &Relationship) -> Result<Vec<Relationship>> {
        let stored = self.find_contradictions(
            &candidate.from_id,
            &candidate.to_id,
            Some(&candidate.rel_type),
            true,
        )?;
        Ok(overlapping(candidate, stored))
    }
}

/// Keep the relationships in `stored` that contradict `candidate`.
pub fn overlapping(
    candidate: &Relationship,
    stored: impl IntoIterator<Item = Relationship>,
) -> Vec<Relationship> {
    let interval = candidate.interval();
    stored
        .into_iter()
        .filter(|r| r.id != candidate.id && r.same_key(candidate))
        .filter(|r| r.interval().overlaps(&interval))
        .collect()
}

// ---------------------------------------------------------------------------
// Resolution planning
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionState {
    Detected,
    Resolving,
    Resolved,
    Failed,
}

impl ResolutionState {
    pub fn can_transition_to(self, next: ResolutionState) -> bool {
        use ResolutionState::*;
        matches!(
            (self, next),
            (Detected, Resolving) | (Resolving, Resolved) | (Resolving, Failed)
        )
    }

    pub fn transition(&mut self, next: ResolutionState) -> Result<()> {
        if !self.can_transition_to(next) {
            return Err(VerityError::Internal(format!(
                "illegal resolution transition {self:?} -> {next:?}"
            )));
        }
        *self = next;
        Ok(())
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ResolutionState::Resolved | ResolutionState::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionAction {
    /// The loser's validity was closed where the winner's begins.
    Supersede,
    /// As `Supersede`, with the loser's attributes folded into the winner.
    Merge,
    /// Both kept as consecutive periods.
    SplitTimeline,
}

impl From<ResolutionStrategy> for ResolutionAction {
    fn from(strategy: ResolutionStrategy) -> Self {
        match strategy {
            ResolutionStrategy::NewestWins => ResolutionAction::Supersede,
            ResolutionStrategy::Merge => ResolutionAction::Merge,
            ResolutionStrategy::SplitTimeline => ResolutionAction::SplitTimeline,
        }
    }
}

/// What resolving one pair would write.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolutionPlan {
    pub action: ResolutionAction,
    pub reason: String,
    /// The side that stays valid, with any merged attributes applied.
    pub winner: Relationship,
    /// The side whose validity is closed.
    pub loser: Relationship,
    pub winner_changed: bool,
    pub loser_changed: bool,
}

impl ResolutionPlan {
    /// Documents that need writing, in winner-then-loser order.
    pub fn writes(&self) -> Vec<Relationship> {
        let mut writes = Vec::with_capacity(2);
        if self.winner_changed {
            writes.push(self.winner.clone());
        }
        if self.loser_changed {
            writes.push(self.loser.clone());
        }
        writes
    }
}

/// Decide how the contradicting pair `(new, existing)` is reconciled.
///
/// - `newest_wins` and `merge` keep the later-recorded side (later
///   `created_at`, then later `valid_at`, then `new`).
/// - `split_timeline` keeps the later-starting side (later `valid_at`, then
///   later `created_at`, then `new`).
///
/// The loser is closed at the winner's `valid_at`. When the loser does not
/// start before the winner, that would leave it an empty interval, so it is
/// closed one second after its own start instead. An existing earlier
/// `invalid_at` is never pushed later.
pub fn plan_resolution(
    new: &Relationship,
    existing: &Relationship,
    strategy: ResolutionStrategy,
    merge_policy: MergeStrategy,
) -> ResolutionPlan {
    let new_wins = match strategy {
        ResolutionStrategy::NewestWins | ResolutionStrategy::Merge => {
            (new.created_at, new.valid_at) >= (existing.created_at, existing.valid_at)
        }
        ResolutionStrategy::SplitTimeline => {
            (new.valid_at, new.created_at) >= (existing.valid_at, existing.created_at)
        }
    };
    let (mut winner, mut loser) = if new_wins {
        (new.clone(), existing.clone())
    } else {
        (existing.clone(), new.clone())
    };

    let retroactive = winner.valid_at <= loser.valid_at;
    let cut = if retroactive {
        loser.valid_at + min_validity_window()
    } else {
        winner.valid_at
    };
    let reason = match (strategy, retroactive) {
        (_, true) => REASON_SUPERSEDED_RETROACTIVELY,
        (ResolutionStrategy::NewestWins, false) => REASON_SUPERSEDED,
        (ResolutionStrategy::Merge, false) => REASON_MERGED,
        (ResolutionStrategy::SplitTimeline, false) => REASON_TIMELINE_SPLIT,
    };

    let mut winner_changed = false;
    if strategy == ResolutionStrategy::Merge {
        let merged = merge_attributes(&winner.attributes, &loser.attributes, merge_policy);
        if merged != winner.attributes {
            winner.attributes = merged;
            winner_changed = true;
        }
    }

    let loser_changed = close_at(&mut loser, cut, &winner.id, reason);

    ResolutionPlan {
        action: strategy.into(),
        reason: reason.to_string(),
        winner,
        loser,
        winner_changed,
        loser_changed,
    }
}

/// Close `rel` at `cut` unless it already ends no later than that.
fn close_at(rel: &mut Relationship, cut: DateTime<Utc>, by: &RelationshipId, reason: &str) -> bool {
    if rel.invalid_at.is_some_and(|end| end <= cut) {
        return false;
    }
    rel.invalid_at = Some(cut);
    rel.invalidated_by = Some(by.clone());
    rel.invalidation_reason = Some(reason.to_string());
    true
}

// ---------------------------------------------------------------------------
// Resolver
// ---------------------------------------------------------------------------

/// Result of resolving one contradicting pair.
#[derive(Debug, Clone, PartialEq)]
pub struct PairOutcome {
    pub existing_id: RelationshipId,
    pub winner_id: Option<RelationshipId>,
    pub loser_id: Option<RelationshipId>,
    pub strategy: ResolutionStrategy,
    pub action: ResolutionAction,
    pub state: ResolutionState,
    pub reason: String,
    pub error: Option<String>,
    /// Write attempts, including retries after revision conflicts.
    pub attempts: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolveAllResult {
    pub outcomes: Vec<PairOutcome>,
    /// `true` only if every pair resolved.
    pub success: bool,
}

pub struct ContradictionResolver {
    store: Arc<dyn GraphStore>,
    detector: ContradictionDetector,
    logger: ContradictionLogger,
    merge_policy: MergeStrategy,
    max_write_retries: u32,
}

impl ContradictionResolver {
    pub fn new(store: Arc<dyn GraphStore>, config: &EngineConfig) -> Self {
        Self {
            detector: ContradictionDetector::new(store.clone()),
            logger: ContradictionLogger::new(store.clone()),
            store,
            merge_policy: config.relationship_merge_policy,
            max_write_retries: config.max_write_retries,
        }
    }

    pub fn detector(&self) -> &ContradictionDetector {
        &self.detector
    }

    pub fn logger(&self) -> &ContradictionLogger {
        &self.logger
    }

    /// Resolve every stored relationship that contradicts `new_edge`.
    ///
    /// # Errors
    ///
    /// Only detection failures are returned as `Err`. Failures while
    /// resolving a pair are reported in that pair's [`PairOutcome`] and make
    /// `success` false.
    pub fn resolve_all(
        &self,
        new_edge: &Relationship,
        strategy: ResolutionStrategy,
    ) -> Result<ResolveAllResult> {
        let contradictions = self.detector.find_temporal_contradictions(new_edge)?;
        if !contradictions.is_empty() {
            debug!(
                edge = %new_edge.id,
                count = contradictions.len(),
                %strategy,
                "resolving contradictions"
            );
        }

        let outcomes: Vec<PairOutcome> = contradictions
            .iter()
            .map(|existing| self.resolve_pair(new_edge, existing, strategy))
            .collect();
        let success = outcomes.iter().all(|o| o.state == ResolutionState::Resolved);
        Ok(ResolveAllResult { outcomes, success })
    }

    fn resolve_pair(
        &self,
        new_edge: &Relationship,
        existing: &Relationship,
        strategy: ResolutionStrategy,
    ) -> PairOutcome {
        let mut outcome = PairOutcome {
            existing_id: existing.id.clone(),
            winner_id: None,
            loser_id: None,
            strategy,
            action: strategy.into(),
            state: ResolutionState::Detected,
            reason: String::new(),
            error: None,
            attempts: 0,
        };
        let written = outcome
            .state
            .transition(ResolutionState::Resolving)
            .and_then(|()| self.write_resolution(&new_edge.id, &existing.id, strategy, &mut outcome))
            .and_then(|docs| {
                outcome
                    .state
                    .transition(ResolutionState::Resolved)
                    .map(|()| docs)
            });

        let (final_new, final_existing) = match written {
            Ok(docs) => {
                info!(
                    new_edge = %new_edge.id,
                    existing_edge = %existing.id,
                    reason = %outcome.reason,
                    "contradiction resolved"
                );
                docs
            }
            Err(e) => {
                outcome.error = Some(match outcome.state.transition(ResolutionState::Failed) {
                    Ok(()) => e.to_string(),
                    Err(illegal) => format!("{e}; {illegal}"),
                });
                warn!(
                    new_edge = %new_edge.id,
                    existing_edge = %existing.id,
                    error = %e,
                    "contradiction resolution failed"
                );
                (new_edge.clone(), existing.clone())
            }
        };

        let mut record = ContradictionRecord::new(
            &final_new,
            &final_existing,
            ResolutionSummary {
                action: outcome.action,
                strategy,
                reason: outcome.reason.clone(),
                success: outcome.state == ResolutionState::Resolved,
            },
        )
        .with_context("attempts", i64::from(outcome.attempts));
        if let Some(error) = &outcome.error {
            record = record.with_context("error", error.as_str());
        }
        self.logger.log(&record);
        outcome
    }

    /// Re-read both sides, plan and write, retrying on revision conflicts.
    /// Returns the final `(new, existing)` documents.
    fn write_resolution(
        &self,
        new_id: &RelationshipId,
        existing_id: &RelationshipId,
        strategy: ResolutionStrategy,
        outcome: &mut PairOutcome,
    ) -> Result<(Relationship, Relationship)> {
        loop {
            outcome.attempts += 1;
            let new = self.store.relationship(new_id)?;
            let existing = self.store.relationship(existing_id)?;

            if !new.interval().overlaps(&existing.interval()) {
                outcome.reason = REASON_ALREADY_CONSISTENT.to_string();
                return Ok((new, existing));
            }

            let plan = plan_resolution(&new, &existing, strategy, self.merge_policy);
            outcome.winner_id = Some(plan.winner.id.clone());
            outcome.loser_id = Some(plan.loser.id.clone());
            outcome.reason = plan.reason.clone();

            let writes = plan.writes();
            if writes.is_empty() {
                return Ok((new, existing));
            }
            match self.store.replace_relationships(&writes) {
                Ok(written) => {
                    let pick = |id: &RelationshipId, fallback: Relationship| {
                        written
                            .iter()
                            .find(|r| &r.id == id)
                            .cloned()
                            .unwrap_or(fallback)
                    };
                    return Ok((pick(new_id, new), pick(existing_id, existing)));
                }
                Err(VerityError::Conflict(msg)) if outcome.attempts <= self.max_write_retries => {
                    debug!(attempt = outcome.attempts, %msg, "revision conflict, retrying");
                }
                Err(e) => return Err(e),
            }
        }
    }
}
