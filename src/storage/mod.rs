//! Storage layer for prioritization session persistence.
//!
//! This module provides the row types shared by the session engine, the
//! [`Storage`] trait for whole-row persistence, and the read-only
//! [`Directory`] trait through which the engine resolves projects, items and
//! participants owned by the external CRUD layer.

mod directory;
mod sqlite;


pub use directory::StaticDirectory;
pub use sqlite::SqliteStorage;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StorageResult;

/// Judging criterion. Every comparison session is scoped to exactly one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Criterion {
    /// Relative value of an item.
    Value,
    /// Relative complexity of an item.
    Complexity,
}

impl Criterion {
    /// Both criteria, in calculation order.
    pub const ALL: [Criterion; 2] = [Criterion::Value, Criterion::Complexity];

    /// Convert to string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Criterion::Value => "value",
            Criterion::Complexity => "complexity",
        }
    }
}

impl std::fmt::Display for Criterion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Criterion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "value" => Ok(Criterion::Value),
            "complexity" => Ok(Criterion::Complexity),
            _ => Err(format!("Unknown criterion: {}", s)),
        }
    }
}

/// Lifecycle of a comparison session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Votes are being collected.
    #[default]
    Active,
    /// Every comparison reached consensus. Terminal.
    Completed,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionStatus::Active => write!(f, "active"),
            SessionStatus::Completed => write!(f, "completed"),
        }
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "active" => Ok(SessionStatus::Active),
            "completed" => Ok(SessionStatus::Completed),
            _ => Err(format!("Unknown session status: {}", s)),
        }
    }
}

/// One round of pairwise comparisons for a project and criterion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonSession {
    /// Unique session identifier.
    pub id: String,
    /// Owning project.
    pub project_id: i64,
    /// Criterion judged in this session.
    pub criterion: Criterion,
    /// Current status.
    pub status: SessionStatus,
    /// Participants registered when the session started. Consensus is
    /// evaluated against this set only.
    pub participant_ids: Vec<i64>,
    /// Items present when the session started.
    pub item_ids: Vec<i64>,
    /// Facilitator who started the round, if known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_by: Option<i64>,
    /// When the session started.
    pub started_at: DateTime<Utc>,
    /// When the last comparison reached consensus.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl ComparisonSession {
    /// Create a new active session with a snapshot of participants and items.
    pub fn new(
        project_id: i64,
        criterion: Criterion,
        participant_ids: Vec<i64>,
        item_ids: Vec<i64>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            project_id,
            criterion,
            status: SessionStatus::Active,
            participant_ids,
            item_ids,
            started_by: None,
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Record the facilitator who started the session.
    pub fn with_started_by(mut self, participant_id: i64) -> Self {
        self.started_by = Some(participant_id);
        self
    }

    /// Whether the session still accepts votes.
    pub fn is_active(&self) -> bool {
        self.status == SessionStatus::Active
    }

    /// Number of participants whose votes decide consensus.
    pub fn expected_voters(&self) -> usize {
        self.participant_ids.len()
    }
}

/// A single unordered pair judged within a session.
///
/// `item_a_id` is always the lower id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comparison {
    /// Unique comparison identifier.
    pub id: String,
    /// Owning session.
    pub session_id: String,
    /// Lower item id of the pair.
    pub item_a_id: i64,
    /// Higher item id of the pair.
    pub item_b_id: i64,
    /// Agreed winner, once consensus is reached on a non-tie.
    pub winner_id: Option<i64>,
    /// Whether consensus settled on a tie.
    pub is_tie: bool,
    /// Set exactly once, on first consensus.
    pub consensus_reached: bool,
}

impl Comparison {
    /// Create an open comparison for a pair.
    pub fn new(session_id: impl Into<String>, item_a_id: i64, item_b_id: i64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            item_a_id,
            item_b_id,
            winner_id: None,
            is_tie: false,
            consensus_reached: false,
        }
    }

    /// Whether the item is one of the two compared.
    pub fn involves(&self, item_id: i64) -> bool {
        self.item_a_id == item_id || self.item_b_id == item_id
    }
}

/// A participant's vote on one comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vote {
    /// Comparison voted on.
    pub comparison_id: String,
    /// Voting participant.
    pub participant_id: i64,
    /// Preferred item, absent for ties and abstentions.
    pub preferred_item_id: Option<i64>,
    /// Whether the participant judged the pair equal.
    pub is_tie: bool,
    /// When the vote was last written.
    pub updated_at: DateTime<Utc>,
}

/// A participant's magnitude estimate for one item and criterion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MagnitudeScore {
    /// Scored item.
    pub item_id: i64,
    /// Criterion scored.
    pub criterion: Criterion,
    /// Scoring participant.
    pub participant_id: i64,
    /// Value on the fixed magnitude scale.
    pub value: i64,
    /// When the score was last written.
    pub updated_at: DateTime<Utc>,
}

/// The locked magnitude of an item for one criterion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MagnitudeConsensus {
    /// Item the magnitude belongs to.
    pub item_id: i64,
    /// Criterion of the magnitude.
    pub criterion: Criterion,
    /// Agreed value.
    pub value: i64,
    /// Facilitator who forced the lock; `None` when participants agreed unanimously.
    pub locked_by: Option<i64>,
    /// When the lock was taken.
    pub locked_at: DateTime<Utc>,
    /// Facilitator's justification for a forced lock.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
}

/// Derived priority of one item. Recomputed wholesale on every calculation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriorityResult {
    /// Owning project.
    pub project_id: i64,
    /// Ranked item.
    pub item_id: i64,
    /// Win-count weight on the value criterion.
    pub value_weight: f64,
    /// Win-count weight on the complexity criterion.
    pub complexity_weight: f64,
    /// Locked value magnitude.
    pub value_magnitude: i64,
    /// Locked complexity magnitude.
    pub complexity_magnitude: i64,
    /// `value_magnitude * value_weight`.
    pub weighted_value: f64,
    /// `complexity_magnitude * complexity_weight`.
    pub weighted_complexity: f64,
    /// Ratio used for ranking.
    pub final_score: f64,
    /// 1-based position, by score descending then item id ascending.
    pub rank: u32,
    /// When the calculation ran.
    pub calculated_at: DateTime<Utc>,
}

/// Persistence operations used by the session engine.
///
/// Every write is a whole-row upsert; implementations only need to guarantee
/// read-your-last-write.
#[async_trait]
pub trait Storage: Send + Sync {
    // Session operations

    /// Insert a session together with all of its comparisons.
    async fn create_session(
        &self,
        session: &ComparisonSession,
        comparisons: &[Comparison],
    ) -> StorageResult<()>;
    /// Get a session by ID.
    async fn get_session(&self, id: &str) -> StorageResult<Option<ComparisonSession>>;
    /// Get the active session for a project and criterion, if any.
    async fn get_active_session(
        &self,
        project_id: i64,
        criterion: Criterion,
    ) -> StorageResult<Option<ComparisonSession>>;
    /// Get the most recently started session for a project and criterion.
    async fn get_latest_session(
        &self,
        project_id: i64,
        criterion: Criterion,
    ) -> StorageResult<Option<ComparisonSession>>;
    /// Persist a session's status and completion time.
    async fn update_session(&self, session: &ComparisonSession) -> StorageResult<()>;

    // Comparison operations

    /// Get a comparison by ID.
    async fn get_comparison(&self, id: &str) -> StorageResult<Option<Comparison>>;
    /// Get all comparisons of a session, ordered by pair.
    async fn get_session_comparisons(&self, session_id: &str) -> StorageResult<Vec<Comparison>>;
    /// Persist a comparison's outcome.
    async fn update_comparison(&self, comparison: &Comparison) -> StorageResult<()>;

    // Vote operations

    /// Insert or overwrite a participant's vote.
    async fn upsert_vote(&self, vote: &Vote) -> StorageResult<()>;
    /// Get all votes cast on a comparison.
    async fn get_comparison_votes(&self, comparison_id: &str) -> StorageResult<Vec<Vote>>;

    // Magnitude operations

    /// Insert or overwrite a participant's magnitude score.
    async fn upsert_magnitude_score(&self, score: &MagnitudeScore) -> StorageResult<()>;
    /// Get all scores for an item and criterion.
    async fn get_magnitude_scores(
        &self,
        item_id: i64,
        criterion: Criterion,
    ) -> StorageResult<Vec<MagnitudeScore>>;
    /// Get the locked magnitude for an item and criterion.
    async fn get_magnitude_consensus(
        &self,
        item_id: i64,
        criterion: Criterion,
    ) -> StorageResult<Option<MagnitudeConsensus>>;
    /// Insert a locked magnitude.
    async fn insert_magnitude_consensus(&self, consensus: &MagnitudeConsensus)
        -> StorageResult<()>;
    /// Remove a locked magnitude. Returns whether a row existed.
    async fn delete_magnitude_consensus(
        &self,
        item_id: i64,
        criterion: Criterion,
    ) -> StorageResult<bool>;

    // Priority operations

    /// Replace every stored result of a project with `results`.
    async fn replace_priority_results(
        &self,
        project_id: i64,
        results: &[PriorityResult],
    ) -> StorageResult<()>;
    /// Get a project's stored results ordered by rank.
    async fn get_priority_results(&self, project_id: i64) -> StorageResult<Vec<PriorityResult>>;
}

/// Read-only view of the external item and participant directory.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Directory: Send + Sync {
    /// Participants registered to a project, ordered by id.
    async fn list_participants(&self, project_id: i64) -> StorageResult<Vec<i64>>;
    /// Whether the participant is registered to the project.
    async fn resolve_participant(&self, project_id: i64, participant_id: i64)
        -> StorageResult<bool>;
    /// Items of a project, ordered by id.
    async fn list_items(&self, project_id: i64) -> StorageResult<Vec<i64>>;
    /// Whether the item belongs to the project.
    async fn resolve_item(&self, project_id: i64, item_id: i64) -> StorageResult<bool>;
}
