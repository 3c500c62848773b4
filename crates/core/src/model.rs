//! Core graph documents: entities, relationships and their attribute values.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;

use crate::temporal::Interval;
use crate::VerityError;

/// Ordered attribute map attached to entities and relationships.
pub type Attributes = BTreeMap<String, Value>;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// A stable, time-sortable identifier for an [`Entity`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityId(pub String);

impl EntityId {
    pub fn new() -> Self {
        Self(Ulid::new().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for EntityId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A stable, time-sortable identifier for a [`Relationship`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RelationshipId(pub String);

impl RelationshipId {
    pub fn new() -> Self {
        Self(Ulid::new().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RelationshipId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RelationshipId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for RelationshipId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// ---------------------------------------------------------------------------
// Attribute values
// ---------------------------------------------------------------------------

/// A dynamically typed attribute value.
///
/// Attribute documents come from upstream extractors with arbitrary shape, so
/// values are a tagged union rather than a fixed schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum Value {
    /// A text string.
    Text(String),
    /// A floating-point number.
    Number(f64),
    /// A whole number, kept exact.
    Integer(i64),
    /// A boolean.
    Boolean(bool),
    /// An ordered list of values.
    List(Vec<Value>),
    /// A nested attribute map.
    Map(Attributes),
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}
impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}
impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}
impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Integer(n)
    }
}
impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}
impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::List(items)
    }
}
impl From<Attributes> for Value {
    fn from(map: Attributes) -> Self {
        Value::Map(map)
    }
}

impl Value {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Text(s) => write!(f, "{s}"),
            Value::Number(n) => write!(f, "{n}"),
            Value::Integer(n) => write!(f, "{n}"),
            Value::Boolean(b) => write!(f, "{b}"),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            Value::Map(map) => {
                write!(f, "{{")?;
                for (i, (k, v)) in map.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{k}: {v}")?;
                }
                write!(f, "}}")
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Strategies
// ---------------------------------------------------------------------------

/// How attribute conflicts are settled when two documents are merged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    /// Existing value wins; keys are the union of both maps.
    PreferExisting,
    /// New value wins; keys are the union of both maps.
    PreferNew,
    /// New value wins on conflict; keys are the union of both maps.
    Union,
    /// New value wins on conflict; only keys present in both maps are kept.
    Intersection,
}

impl MergeStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            MergeStrategy::PreferExisting => "prefer_existing",
            MergeStrategy::PreferNew => "prefer_new",
            MergeStrategy::Union => "union",
            MergeStrategy::Intersection => "intersection",
        }
    }
}

impl fmt::Display for MergeStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MergeStrategy {
    type Err = VerityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "prefer_existing" => Ok(MergeStrategy::PreferExisting),
            "prefer_new" => Ok(MergeStrategy::PreferNew),
            "union" => Ok(MergeStrategy::Union),
            "intersection" => Ok(MergeStrategy::Intersection),
            other => Err(VerityError::Validation(format!(
                "unknown merge strategy `{other}`"
            ))),
        }
    }
}

/// How a pair of contradicting relationships is reconciled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    /// The later-recorded relationship stays valid; the other is closed.
    NewestWins,
    /// Attributes are folded into the later-recorded relationship; the other
    /// is closed.
    Merge,
    /// Both are kept as consecutive periods: the earlier-starting one is
    /// closed where the later-starting one begins.
    SplitTimeline,
}

impl ResolutionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionStrategy::NewestWins => "newest_wins",
            ResolutionStrategy::Merge => "merge",
            ResolutionStrategy::SplitTimeline => "split_timeline",
        }
    }
}

impl fmt::Display for ResolutionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResolutionStrategy {
    type Err = VerityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "newest_wins" => Ok(ResolutionStrategy::NewestWins),
            "merge" => Ok(ResolutionStrategy::Merge),
            "split_timeline" => Ok(ResolutionStrategy::SplitTimeline),
            other => Err(VerityError::Validation(format!(
                "unknown resolution strategy `{other}`"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Entities
// ---------------------------------------------------------------------------

/// Provenance entry appended to an entity each time something is merged into it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeRecord {
    pub merged_with: EntityId,
    pub strategy: MergeStrategy,
    pub timestamp: DateTime<Utc>,
}

/// A node of the knowledge graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    pub name: String,
    #[serde(rename = "type")]
    pub entity_type: String,
    #[serde(default)]
    pub attributes: Attributes,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    pub created_at: DateTime<Utc>,
    /// Only ever grows.
    #[serde(default)]
    pub merge_history: Vec<MergeRecord>,
    /// Forwarding pointer set when this entity was merged into another.
    /// Never cleared once set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merged_into: Option<EntityId>,
    /// Optimistic-concurrency token, assigned by the store.
    #[serde(default)]
    pub revision: u64,
}

impl Entity {
    pub fn new(name: impl Into<String>, entity_type: impl Into<String>) -> Self {
        Self {
            id: EntityId::new(),
            name: name.into(),
            entity_type: entity_type.into(),
            attributes: Attributes::new(),
            embedding: None,
            created_at: Utc::now(),
            merge_history: Vec::new(),
            merged_into: None,
            revision: 0,
        }
    }

    pub fn with_id(mut self, id: impl Into<EntityId>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    /// Has this entity been merged into another one?
    pub fn is_tombstone(&self) -> bool {
        self.merged_into.is_some()
    }
}

// ---------------------------------------------------------------------------
// Relationships
// ---------------------------------------------------------------------------

/// A relationship as submitted by a caller, before temporal enhancement.
#[derive(Debug, Clone, PartialEq)]
pub struct NewRelationship {
    pub from_id: EntityId,
    pub to_id: EntityId,
    pub rel_type: String,
    pub attributes: Attributes,
    /// Defaults to 1.0 when absent.
    pub confidence: Option<f64>,
}

impl NewRelationship {
    pub fn new(
        from_id: impl Into<EntityId>,
        to_id: impl Into<EntityId>,
        rel_type: impl Into<String>,
    ) -> Self {
        Self {
            from_id: from_id.into(),
            to_id: to_id.into(),
            rel_type: rel_type.into(),
            attributes: Attributes::new(),
            confidence: None,
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = Some(confidence);
        self
    }
}

/// A typed, bi-temporal edge between two entities.
///
/// Relationships are append-only: the resolver may close their validity
/// (`invalid_at`, `invalidated_by`, `invalidation_reason`) or fold attributes
/// into them, but never deletes them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    pub id: RelationshipId,
    #[serde(rename = "from")]
    pub from_id: EntityId,
    #[serde(rename = "to")]
    pub to_id: EntityId,
    #[serde(rename = "type")]
    pub rel_type: String,
    #[serde(default)]
    pub attributes: Attributes,
    /// Confidence in this relationship \[0.0, 1.0\].
    pub confidence: f64,
    /// When this was recorded (transaction time).
    pub created_at: DateTime<Utc>,
    /// When this became true in the world.
    pub valid_at: DateTime<Utc>,
    /// When this stopped being true in the world. `None` = still true.
    pub invalid_at: Option<DateTime<Utc>>,
    pub invalidation_reason: Option<String>,
    pub invalidated_by: Option<RelationshipId>,
    /// Optimistic-concurrency token, assigned by the store.
    #[serde(default)]
    pub revision: u64,
}

impl Relationship {
    /// Is this relationship still open on the valid-time axis?
    pub fn is_current(&self) -> bool {
        self.invalid_at.is_none()
    }

    /// Was this relationship true at `at`? Uses `[valid_at, invalid_at)`.
    pub fn was_valid_at(&self, at: DateTime<Utc>) -> bool {
        self.interval().contains(at)
    }

    pub fn interval(&self) -> Interval {
        Interval::new(self.valid_at, self.invalid_at)
    }

    /// Do `self` and `other` describe the same kind of link between the same pair?
    pub fn same_key(&self, other: &Relationship) -> bool {
        self.from_id == other.from_id
            && self.to_id == other.to_id
            && self.rel_type == other.rel_type
    }
}
