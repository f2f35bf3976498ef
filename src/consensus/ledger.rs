//! Vote ledger: the per-comparison consensus state machine.
//!
//! A comparison moves from `Pending` through `PartiallyVoted` to
//! `ConsensusReached`, and a session completes when its last open comparison
//! closes. Votes on the same comparison serialize through a keyed lock so that
//! exactly one submission observes the transition to consensus.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::comparisons::generate_pairs;
use super::core::EngineCore;
use super::locks::KeyedLocks;
use crate::error::{SessionError, SessionResult};
use crate::hub::events::{
    AgentId, ConsensusReachedPayload, ServerEvent, SessionCompletedPayload, VoteUpdatePayload,
};
use crate::hub::Audience;
use crate::storage::{Comparison, ComparisonSession, Criterion, SessionStatus, Storage, Vote};

/// A participant's judgement on one comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Choice {
    /// The given item is preferred. Must be one of the pair.
    Prefer { item_id: i64 },
    /// Both items are judged equal.
    Tie,
    /// Counted as cast, but excluded from agreement.
    Abstain,
}

impl Choice {
    /// Storage columns `(preferred_item_id, is_tie)` for this choice.
    pub fn columns(&self) -> (Option<i64>, bool) {
        match self {
            Choice::Prefer { item_id } => (Some(*item_id), false),
            Choice::Tie => (None, true),
            Choice::Abstain => (None, false),
        }
    }

    /// Recover the choice a stored vote encodes.
    pub fn from_vote(vote: &Vote) -> Self {
        match (vote.preferred_item_id, vote.is_tie) {
            (Some(item_id), false) => Choice::Prefer { item_id },
            (_, true) => Choice::Tie,
            (None, false) => Choice::Abstain,
        }
    }

    fn outcome(&self) -> Option<ComparisonOutcome> {
        match self {
            Choice::Prefer { item_id } => Some(ComparisonOutcome {
                winner_id: Some(*item_id),
                is_tie: false,
            }),
            Choice::Tie => Some(ComparisonOutcome {
                winner_id: None,
                is_tie: true,
            }),
            Choice::Abstain => None,
        }
    }
}

/// Settled result of a comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComparisonOutcome {
    pub winner_id: Option<i64>,
    pub is_tie: bool,
}

/// Lifecycle of a single comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComparisonState {
    /// No votes yet.
    Pending,
    /// Some votes recorded, consensus not reached.
    PartiallyVoted,
    /// Terminal.
    ConsensusReached,
}

/// Completed and total comparison counts of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionProgress {
    pub session_id: String,
    pub completed: usize,
    pub total: usize,
}

impl SessionProgress {
    /// Tally a session's comparisons.
    pub fn from_comparisons(session_id: &str, comparisons: &[Comparison]) -> Self {
        Self {
            session_id: session_id.to_string(),
            completed: comparisons.iter().filter(|c| c.consensus_reached).count(),
            total: comparisons.len(),
        }
    }

    /// Whether every comparison has reached consensus.
    pub fn is_complete(&self) -> bool {
        self.total > 0 && self.completed == self.total
    }
}

/// Result of an accepted vote. Rejections are returned as [`SessionError`].
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    /// Vote recorded; the comparison is still open.
    Pending {
        votes_cast: usize,
        votes_expected: usize,
    },
    /// Identical to the participant's existing vote; nothing changed.
    Unchanged,
    /// This vote closed the comparison.
    Closed {
        outcome: ComparisonOutcome,
        progress: SessionProgress,
        session_completed: bool,
    },
}

impl SubmitOutcome {
    /// Whether this submission closed its comparison.
    pub fn is_closed(&self) -> bool {
        matches!(self, SubmitOutcome::Closed { .. })
    }
}

/// Decide whether `votes` settle a comparison for the `expected` voters.
///
/// Every expected participant must have voted, at least one of them must not
/// have abstained, and all non-abstaining votes must encode the same outcome.
/// Votes from anyone outside `expected` are ignored.
pub fn evaluate_consensus(expected: &[i64], votes: &[Vote]) -> Option<ComparisonOutcome> {
    if expected.is_empty() {
        return None;
    }

    let by_participant: HashMap<i64, Choice> = votes
        .iter()
        .map(|v| (v.participant_id, Choice::from_vote(v)))
        .collect();

    let mut agreed: Option<ComparisonOutcome> = None;
    for participant_id in expected {
        let choice = by_participant.get(participant_id)?;
        let Some(outcome) = choice.outcome() else {
            continue;
        };
        match agreed {
            None => agreed = Some(outcome),
            Some(existing) if existing == outcome => {}
            Some(_) => return None,
        }
    }

    agreed
}

/// Persistent comparison-session state machine.
pub struct VoteLedger {
    core: EngineCore,
    comparison_locks: KeyedLocks<String>,
    session_locks: KeyedLocks<String>,
}

impl VoteLedger {
    pub fn new(core: EngineCore) -> Self {
        Self {
            core,
            comparison_locks: KeyedLocks::new(),
            session_locks: KeyedLocks::new(),
        }
    }

    /// Open a comparison round for a project and criterion.
    ///
    /// Snapshots the project's participants and items, generates every pair
    /// and persists the session with its comparisons. Fails with
    /// [`SessionError::SessionAlreadyActive`] while another round for the same
    /// criterion is open.
    pub async fn start_session(
        &self,
        project_id: i64,
        criterion: Criterion,
        started_by: Option<i64>,
    ) -> SessionResult<(ComparisonSession, Vec<Comparison>)> {
        let _project = self.core.project_locks().read(project_id).await;
        let _start = self
            .session_locks
            .lock(format!("start:{}:{}", project_id, criterion))
            .await;

        let storage = self.core.storage();
        let directory = self.core.directory();

        if let Some(active) = storage.get_active_session(project_id, criterion).await? {
            return Err(SessionError::SessionAlreadyActive {
                project_id,
                criterion: criterion.to_string(),
                session_id: active.id,
            });
        }

        if let Some(participant_id) = started_by {
            if !directory.resolve_participant(project_id, participant_id).await? {
                return Err(SessionError::UnknownParticipant {
                    project_id,
                    participant_id,
                });
            }
        }

        let participant_ids = directory.list_participants(project_id).await?;
        if participant_ids.is_empty() {
            return Err(SessionError::NoParticipants { project_id });
        }

        let item_ids = directory.list_items(project_id).await?;
        let pairs = generate_pairs(&item_ids)?;

        let mut session = ComparisonSession::new(project_id, criterion, participant_ids, item_ids);
        if let Some(participant_id) = started_by {
            session = session.with_started_by(participant_id);
        }
        let comparisons: Vec<Comparison> = pairs
            .iter()
            .map(|p| Comparison::new(&session.id, p.item_a_id, p.item_b_id))
            .collect();

        storage.create_session(&session, &comparisons).await?;

        info!(
            session_id = %session.id,
            project_id,
            criterion = %criterion,
            participants = session.participant_ids.len(),
            comparisons = comparisons.len(),
            "Comparison session started"
        );

        Ok((session, comparisons))
    }

    /// Record a participant's vote and settle the comparison if it is now unanimous.
    ///
    /// `origin` is the connection the vote arrived on; it is excluded from the
    /// `vote-update` broadcast.
    pub async fn submit_vote(
        &self,
        project_id: i64,
        comparison_id: &str,
        participant_id: i64,
        choice: Choice,
        origin: Option<AgentId>,
    ) -> SessionResult<SubmitOutcome> {
        let _project = self.core.project_locks().read(project_id).await;
        let _row = self.comparison_locks.lock(comparison_id.to_string()).await;

        let storage = self.core.storage();
        let unknown = || SessionError::UnknownComparison {
            comparison_id: comparison_id.to_string(),
        };

        let mut comparison = storage.get_comparison(comparison_id).await?.ok_or_else(unknown)?;
        let session = storage
            .get_session(&comparison.session_id)
            .await?
            .filter(|s| s.project_id == project_id)
            .ok_or_else(unknown)?;

        if comparison.consensus_reached || !session.is_active() {
            return Err(SessionError::ComparisonClosed {
                comparison_id: comparison_id.to_string(),
            });
        }

        if !self
            .core
            .directory()
            .resolve_participant(project_id, participant_id)
            .await?
        {
            return Err(SessionError::UnknownParticipant {
                project_id,
                participant_id,
            });
        }

        if let Choice::Prefer { item_id } = choice {
            if !comparison.involves(item_id) {
                return Err(SessionError::InvalidChoice {
                    comparison_id: comparison_id.to_string(),
                    item_id,
                });
            }
        }

        let mut votes = storage.get_comparison_votes(comparison_id).await?;
        if votes
            .iter()
            .any(|v| v.participant_id == participant_id && Choice::from_vote(v) == choice)
        {
            debug!(comparison_id, participant_id, "Vote unchanged");
            return Ok(SubmitOutcome::Unchanged);
        }

        let (preferred_item_id, is_tie) = choice.columns();
        let vote = Vote {
            comparison_id: comparison_id.to_string(),
            participant_id,
            preferred_item_id,
            is_tie,
            updated_at: Utc::now(),
        };
        storage.upsert_vote(&vote).await?;
        votes.retain(|v| v.participant_id != participant_id);
        votes.push(vote);

        let publisher = self.core.publisher();
        let audience = Audience::Session(session.id.clone());

        let Some(outcome) = evaluate_consensus(&session.participant_ids, &votes) else {
            let votes_cast = votes
                .iter()
                .filter(|v| session.participant_ids.contains(&v.participant_id))
                .count();
            let votes_expected = session.expected_voters();
            publisher
                .publish(
                    audience,
                    ServerEvent::VoteUpdate(VoteUpdatePayload {
                        session_id: session.id.clone(),
                        comparison_id: comparison_id.to_string(),
                        participant_id,
                        votes_cast,
                        votes_expected,
                    }),
                    origin,
                )
                .await;
            return Ok(SubmitOutcome::Pending {
                votes_cast,
                votes_expected,
            });
        };

        comparison.winner_id = outcome.winner_id;
        comparison.is_tie = outcome.is_tie;
        comparison.consensus_reached = true;
        storage.update_comparison(&comparison).await?;

        info!(
            session_id = %session.id,
            comparison_id,
            winner_id = ?outcome.winner_id,
            is_tie = outcome.is_tie,
            "Comparison reached consensus"
        );

        publisher
            .publish(
                audience,
                ServerEvent::ConsensusReached(ConsensusReachedPayload {
                    session_id: session.id.clone(),
                    comparison_id: comparison_id.to_string(),
                    winner_id: outcome.winner_id,
                    is_tie: outcome.is_tie,
                }),
                None,
            )
            .await;

        let (progress, session_completed) = self.settle_session(&session.id).await?;

        Ok(SubmitOutcome::Closed {
            outcome,
            progress,
            session_completed,
        })
    }

    /// Recount a session after a comparison closed, completing it when nothing
    /// is left open. Only the caller that flips the status reports `true`.
    async fn settle_session(&self, session_id: &str) -> SessionResult<(SessionProgress, bool)> {
        let _guard = self.session_locks.lock(session_id.to_string()).await;
        let storage = self.core.storage();
        let publisher = self.core.publisher();
        let audience = Audience::Session(session_id.to_string());

        let mut session = storage
            .get_session(session_id)
            .await?
            .ok_or_else(|| SessionError::UnknownSession {
                session_id: session_id.to_string(),
            })?;
        let comparisons = storage.get_session_comparisons(session_id).await?;
        let progress = SessionProgress::from_comparisons(session_id, &comparisons);

        publisher
            .publish(
                audience.clone(),
                ServerEvent::SessionProgress(progress.clone()),
                None,
            )
            .await;

        if !progress.is_complete() || !session.is_active() {
            return Ok((progress, false));
        }

        let completed_at: DateTime<Utc> = Utc::now();
        session.status = SessionStatus::Completed;
        session.completed_at = Some(completed_at);
        storage.update_session(&session).await?;

        info!(
            session_id,
            project_id = session.project_id,
            criterion = %session.criterion,
            comparisons = progress.total,
            "Comparison session completed"
        );

        publisher
            .publish(
                audience,
                ServerEvent::SessionCompleted(SessionCompletedPayload {
                    session_id: session_id.to_string(),
                    completed_at,
                }),
                None,
            )
            .await;

        Ok((progress, true))
    }

    /// Completed/total comparison counts of a session.
    pub async fn progress(&self, session_id: &str) -> SessionResult<SessionProgress> {
        let storage = self.core.storage();
        if storage.get_session(session_id).await?.is_none() {
            return Err(SessionError::UnknownSession {
                session_id: session_id.to_string(),
            });
        }
        let comparisons = storage.get_session_comparisons(session_id).await?;
        Ok(SessionProgress::from_comparisons(session_id, &comparisons))
    }

    /// Where a comparison sits in its lifecycle.
    pub async fn comparison_state(&self, comparison_id: &str) -> SessionResult<ComparisonState> {
        let storage = self.core.storage();
        let comparison = storage
            .get_comparison(comparison_id)
            .await?
            .ok_or_else(|| SessionError::UnknownComparison {
                comparison_id: comparison_id.to_string(),
            })?;

        if comparison.consensus_reached {
            return Ok(ComparisonState::ConsensusReached);
        }
        let votes = storage.get_comparison_votes(comparison_id).await?;
        Ok(if votes.is_empty() {
            ComparisonState::Pending
        } else {
            ComparisonState::PartiallyVoted
        })
    }

    /// Look up a session.
    pub async fn session(&self, session_id: &str) -> SessionResult<ComparisonSession> {
        self.core
            .storage()
            .get_session(session_id)
            .await?
            .ok_or_else(|| SessionError::UnknownSession {
                session_id: session_id.to_string(),
            })
    }
}
