//! Core domain types for the linkflow pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::LinkflowError;

// ---------------------------------------------------------------------------
// ItemId
// ---------------------------------------------------------------------------

/// A UUID v7 wrapper for work item identifiers (time-sortable, never reused).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(pub Uuid);

impl ItemId {
    /// Generate a new time-sortable item identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for ItemId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ItemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for ItemId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Operator-facing reference to an item: either its id or its identity key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemRef {
    Id(ItemId),
    Key(String),
}

impl std::str::FromStr for ItemRef {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s.parse::<ItemId>() {
            Ok(id) => Self::Id(id),
            Err(_) => Self::Key(s.to_string()),
        })
    }
}

impl std::fmt::Display for ItemRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Id(id) => write!(f, "{id}"),
            Self::Key(key) => write!(f, "{key}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

/// What kind of link an item is; decides which acquisition queue it joins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    Job,
    Post,
    Unknown,
}

impl Classification {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Job => "job",
            Self::Post => "post",
            Self::Unknown => "unknown",
        }
    }

    /// Concrete classifications can be routed to an acquisition queue.
    pub fn is_concrete(self) -> bool {
        !matches!(self, Self::Unknown)
    }
}

impl std::fmt::Display for Classification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Classification {
    type Err = LinkflowError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "job" => Ok(Self::Job),
            "post" => Ok(Self::Post),
            "unknown" => Ok(Self::Unknown),
            other => Err(LinkflowError::validation(format!(
                "unknown classification '{other}'"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Stage
// ---------------------------------------------------------------------------

/// A claimable pipeline stage.
///
/// The set is closed: adding a stage means extending this enum and the
/// state graph, and every `match` in the workspace points at what to update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Raw acquisition of the linked content.
    Acquisition,
    /// Normalization of the raw content.
    Normalization,
    /// Semantic extraction from the normalized content.
    Extraction,
}

impl Stage {
    /// All stages in pipeline order.
    pub const ALL: [Stage; 3] = [Stage::Acquisition, Stage::Normalization, Stage::Extraction];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Acquisition => "acquisition",
            Self::Normalization => "normalization",
            Self::Extraction => "extraction",
        }
    }

    /// The state an item waits in before this stage claims it.
    pub fn pending(self) -> Status {
        match self {
            Self::Acquisition => Status::Queued,
            Self::Normalization => Status::Acquired,
            Self::Extraction => Status::Normalized,
        }
    }

    /// The state an item holds while a worker owns it for this stage.
    pub fn in_progress(self) -> Status {
        match self {
            Self::Acquisition => Status::Acquiring,
            Self::Normalization => Status::Normalizing,
            Self::Extraction => Status::Extracting,
        }
    }

    /// The state an item reaches when this stage commits.
    pub fn completed(self) -> Status {
        match self {
            Self::Acquisition => Status::Acquired,
            Self::Normalization => Status::Normalized,
            Self::Extraction => Status::Extracted,
        }
    }

    /// The stage fed by this one, if any.
    pub fn downstream(self) -> Option<Stage> {
        match self {
            Self::Acquisition => Some(Self::Normalization),
            Self::Normalization => Some(Self::Extraction),
            Self::Extraction => None,
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Stage {
    type Err = LinkflowError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "acquisition" => Ok(Self::Acquisition),
            "normalization" => Ok(Self::Normalization),
            "extraction" => Ok(Self::Extraction),
            other => Err(LinkflowError::validation(format!("unknown stage '{other}'"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Current pipeline state of a work item. The single source of truth for
/// which stage owns the item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum Status {
    New,
    Classified,
    Queued,
    Acquiring,
    Acquired,
    Normalizing,
    Normalized,
    Extracting,
    Extracted,
    /// A stage failed and the item waits out its backoff.
    Error(Stage),
    /// Attempts exhausted or failure was permanent. Terminal until revived.
    Dead,
}

impl Status {
    /// The stage whose worker currently owns the item, if it is in progress.
    pub fn in_progress_stage(self) -> Option<Stage> {
        Stage::ALL.into_iter().find(|s| s.in_progress() == self)
    }

    /// The stage whose pending state this is, if any.
    pub fn pending_stage(self) -> Option<Stage> {
        Stage::ALL.into_iter().find(|s| s.pending() == self)
    }

    /// Terminal states are retained for audit and never advance on their own.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Extracted | Self::Dead)
    }

    /// Every value in the fixed state set.
    pub fn all() -> Vec<Status> {
        let mut all = vec![
            Self::New,
            Self::Classified,
            Self::Queued,
            Self::Acquiring,
            Self::Acquired,
            Self::Normalizing,
            Self::Normalized,
            Self::Extracting,
            Self::Extracted,
        ];
        all.extend(Stage::ALL.into_iter().map(Self::Error));
        all.push(Self::Dead);
        all
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::New => "new",
            Self::Classified => "classified",
            Self::Queued => "queued",
            Self::Acquiring => "acquiring",
            Self::Acquired => "acquired",
            Self::Normalizing => "normalizing",
            Self::Normalized => "normalized",
            Self::Extracting => "extracting",
            Self::Extracted => "extracted",
            Self::Error(stage) => return write!(f, "error:{stage}"),
            Self::Dead => "dead",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for Status {
    type Err = LinkflowError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        if let Some(stage) = s.strip_prefix("error:") {
            return Ok(Self::Error(stage.parse()?));
        }
        match s {
            "new" => Ok(Self::New),
            "classified" => Ok(Self::Classified),
            "queued" => Ok(Self::Queued),
            "acquiring" => Ok(Self::Acquiring),
            "acquired" => Ok(Self::Acquired),
            "normalizing" => Ok(Self::Normalizing),
            "normalized" => Ok(Self::Normalized),
            "extracting" => Ok(Self::Extracting),
            "extracted" => Ok(Self::Extracted),
            "dead" => Ok(Self::Dead),
            other => Err(LinkflowError::validation(format!("unknown status '{other}'"))),
        }
    }
}

impl From<Status> for String {
    fn from(status: Status) -> Self {
        status.to_string()
    }
}

impl TryFrom<String> for Status {
    type Error = LinkflowError;

    fn try_from(value: String) -> std::result::Result<Self, LinkflowError> {
        value.parse()
    }
}

// ---------------------------------------------------------------------------
// Failures and outcomes
// ---------------------------------------------------------------------------

/// How a worker classifies its own failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Network hiccup, rate limit: retry with backoff.
    Transient,
    /// Content is gone or invalid for good: dead-letter immediately.
    Permanent,
    /// Output failed its stage contract: retried like a transient failure.
    Validation,
    /// No explicit failure; the task budget ran out.
    Timeout,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Permanent => "permanent",
            Self::Validation => "validation",
            Self::Timeout => "timeout",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a transition meant, as reported to observers and the audit log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Classified,
    Routed,
    Claimed,
    Committed,
    Failed,
    Reclaimed,
    Retried,
    DeadLettered,
    Revived,
}

impl Outcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Classified => "classified",
            Self::Routed => "routed",
            Self::Claimed => "claimed",
            Self::Committed => "committed",
            Self::Failed => "failed",
            Self::Reclaimed => "reclaimed",
            Self::Retried => "retried",
            Self::DeadLettered => "dead_lettered",
            Self::Revived => "revived",
        }
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Outcome {
    type Err = LinkflowError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "classified" => Ok(Self::Classified),
            "routed" => Ok(Self::Routed),
            "claimed" => Ok(Self::Claimed),
            "committed" => Ok(Self::Committed),
            "failed" => Ok(Self::Failed),
            "reclaimed" => Ok(Self::Reclaimed),
            "retried" => Ok(Self::Retried),
            "dead_lettered" => Ok(Self::DeadLettered),
            "revived" => Ok(Self::Revived),
            other => Err(LinkflowError::validation(format!("unknown outcome '{other}'"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Where a submitted link was seen. All fields are optional; a later
/// submission only overwrites the fields it provides.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    /// Connector that produced the link (e.g. `google_sheet:August`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Position within the source (sheet tab, row, page id...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locator: Option<String>,
    /// Category hint supplied by the source (`jobs`, `posts`, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    /// Free-form date as written in the source.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_in_source: Option<String>,
}

/// The unit flowing through the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: ItemId,
    /// Normalized deduplication key; unique and immutable.
    pub identity_key: String,
    /// The link as first submitted.
    pub link: String,
    pub classification: Classification,
    pub status: Status,
    /// Failed attempts within the current stage.
    pub attempt_count: u32,
    /// Failed attempts across the whole pipeline; never reset.
    pub total_attempts: u32,
    /// Not claimable or retryable before this instant.
    pub next_eligible_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Stage of the most recent failure; revival returns to its pending state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_stage: Option<Stage>,
    /// Incremented on every transition. Conditional writes compare it.
    pub revision: i64,
    /// When the item entered its current status.
    pub status_changed_at: DateTime<Utc>,
    #[serde(default)]
    pub provenance: Provenance,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One stage's output for one item. Reprocessing overwrites it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageOutput {
    pub item_id: ItemId,
    pub stage: Stage,
    /// Stage-specific payload, opaque to the engine.
    pub payload: serde_json::Value,
    pub produced_at: DateTime<Utc>,
}

/// Audit-log row written for every transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub item_id: ItemId,
    pub from: Status,
    pub to: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<Stage>,
    pub outcome: Outcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub at: DateTime<Utc>,
}

/// Result of an idempotent submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpsertResult {
    pub id: ItemId,
    /// `false` when the identity key already existed and was merged.
    pub inserted: bool,
}
