//! Magnitude consensus: per-item estimates on a fixed scale.

use chrono::Utc;
use tracing::{debug, info};

use super::core::EngineCore;
use super::locks::KeyedLocks;
use crate::error::{SessionError, SessionResult};
use crate::hub::events::{
    AgentId, ConsensusLockedPayload, ConsensusUnlockedPayload, ScoreSubmittedPayload, ServerEvent,
};
use crate::hub::Audience;
use crate::storage::{Criterion, MagnitudeConsensus, MagnitudeScore, Storage};

/// The only values a magnitude may take, shared by both criteria.
pub const MAGNITUDE_SCALE: [i64; 10] = [1, 2, 3, 5, 8, 13, 21, 34, 55, 89];

/// Reject any value that is not on [`MAGNITUDE_SCALE`].
pub fn validate_magnitude(value: i64) -> SessionResult<i64> {
    if MAGNITUDE_SCALE.contains(&value) {
        Ok(value)
    } else {
        Err(SessionError::InvalidMagnitude { value })
    }
}

/// The value every participant agreed on, if all of them scored and agree.
///
/// Scores from anyone outside `participants` are ignored.
pub fn unanimous_value(participants: &[i64], scores: &[MagnitudeScore]) -> Option<i64> {
    if participants.is_empty() {
        return None;
    }
    let mut agreed = None;
    for participant_id in participants {
        let score = scores.iter().find(|s| s.participant_id == *participant_id)?;
        match agreed {
            None => agreed = Some(score.value),
            Some(value) if value == score.value => {}
            Some(_) => return None,
        }
    }
    agreed
}

/// Result of an accepted score.
#[derive(Debug, Clone, PartialEq)]
pub enum ScoreOutcome {
    /// Recorded; not every participant agrees yet.
    Pending {
        scores_submitted: usize,
        scores_expected: usize,
    },
    /// Identical to the participant's existing score.
    Unchanged,
    /// This score completed a unanimous set and locked the magnitude.
    Locked(MagnitudeConsensus),
}

/// Collects magnitude scores and locks agreed values.
pub struct MagnitudeBoard {
    core: EngineCore,
    item_locks: KeyedLocks<(i64, Criterion)>,
}

impl MagnitudeBoard {
    pub fn new(core: EngineCore) -> Self {
        Self {
            core,
            item_locks: KeyedLocks::new(),
        }
    }

    async fn ensure_item(&self, project_id: i64, item_id: i64) -> SessionResult<()> {
        if self.core.directory().resolve_item(project_id, item_id).await? {
            Ok(())
        } else {
            Err(SessionError::UnknownItem {
                project_id,
                item_id,
            })
        }
    }

    async fn ensure_participant(&self, project_id: i64, participant_id: i64) -> SessionResult<()> {
        if self
            .core
            .directory()
            .resolve_participant(project_id, participant_id)
            .await?
        {
            Ok(())
        } else {
            Err(SessionError::UnknownParticipant {
                project_id,
                participant_id,
            })
        }
    }

    /// Record a participant's score and lock the magnitude once everyone agrees.
    pub async fn submit_score(
        &self,
        project_id: i64,
        item_id: i64,
        criterion: Criterion,
        participant_id: i64,
        value: i64,
        origin: Option<AgentId>,
    ) -> SessionResult<ScoreOutcome> {
        validate_magnitude(value)?;

        let _project = self.core.project_locks().read(project_id).await;
        let _row = self.item_locks.lock((item_id, criterion)).await;

        self.ensure_item(project_id, item_id).await?;
        self.ensure_participant(project_id, participant_id).await?;

        let storage = self.core.storage();
        if storage
            .get_magnitude_consensus(item_id, criterion)
            .await?
            .is_some()
        {
            return Err(SessionError::MagnitudeLocked {
                item_id,
                criterion: criterion.to_string(),
            });
        }

        let mut scores = storage.get_magnitude_scores(item_id, criterion).await?;
        if scores
            .iter()
            .any(|s| s.participant_id == participant_id && s.value == value)
        {
            debug!(item_id, criterion = %criterion, participant_id, "Score unchanged");
            return Ok(ScoreOutcome::Unchanged);
        }

        let score = MagnitudeScore {
            item_id,
            criterion,
            participant_id,
            value,
            updated_at: Utc::now(),
        };
        storage.upsert_magnitude_score(&score).await?;
        scores.retain(|s| s.participant_id != participant_id);
        scores.push(score);

        let participants = self.core.directory().list_participants(project_id).await?;
        let scores_submitted = scores
            .iter()
            .filter(|s| participants.contains(&s.participant_id))
            .count();
        let scores_expected = participants.len();

        self.core
            .publisher()
            .publish(
                Audience::Project(project_id),
                ServerEvent::ScoreSubmitted(ScoreSubmittedPayload {
                    item_id,
                    criterion,
                    participant_id,
                    scores_submitted,
                    scores_expected,
                }),
                origin,
            )
            .await;

        match unanimous_value(&participants, &scores) {
            Some(agreed) => {
                let consensus = self
                    .lock(project_id, item_id, criterion, agreed, None, None)
                    .await?;
                Ok(ScoreOutcome::Locked(consensus))
            }
            None => Ok(ScoreOutcome::Pending {
                scores_submitted,
                scores_expected,
            }),
        }
    }

    /// Lock the magnitude if the current scores are unanimous.
    ///
    /// Returns the existing lock when one is already present.
    pub async fn evaluate_consensus(
        &self,
        project_id: i64,
        item_id: i64,
        criterion: Criterion,
    ) -> SessionResult<Option<MagnitudeConsensus>> {
        let _project = self.core.project_locks().read(project_id).await;
        let _row = self.item_locks.lock((item_id, criterion)).await;

        self.ensure_item(project_id, item_id).await?;

        let storage = self.core.storage();
        if let Some(existing) = storage.get_magnitude_consensus(item_id, criterion).await? {
            return Ok(Some(existing));
        }

        let participants = self.core.directory().list_participants(project_id).await?;
        let scores = storage.get_magnitude_scores(item_id, criterion).await?;
        match unanimous_value(&participants, &scores) {
            Some(agreed) => self
                .lock(project_id, item_id, criterion, agreed, None, None)
                .await
                .map(Some),
            None => Ok(None),
        }
    }

    /// Facilitator override: lock `value` regardless of the submitted scores.
    pub async fn force_lock(
        &self,
        project_id: i64,
        item_id: i64,
        criterion: Criterion,
        value: i64,
        locked_by: i64,
        rationale: impl Into<String>,
    ) -> SessionResult<MagnitudeConsensus> {
        validate_magnitude(value)?;

        let _project = self.core.project_locks().read(project_id).await;
        let _row = self.item_locks.lock((item_id, criterion)).await;

        self.ensure_item(project_id, item_id).await?;
        self.ensure_participant(project_id, locked_by).await?;

        if self
            .core
            .storage()
            .get_magnitude_consensus(item_id, criterion)
            .await?
            .is_some()
        {
            return Err(SessionError::MagnitudeLocked {
                item_id,
                criterion: criterion.to_string(),
            });
        }

        self.lock(
            project_id,
            item_id,
            criterion,
            value,
            Some(locked_by),
            Some(rationale.into()),
        )
        .await
    }

    /// Remove a lock, re-opening scoring for the item.
    pub async fn unlock(
        &self,
        project_id: i64,
        item_id: i64,
        criterion: Criterion,
        unlocked_by: Option<i64>,
    ) -> SessionResult<()> {
        let _project = self.core.project_locks().read(project_id).await;
        let _row = self.item_locks.lock((item_id, criterion)).await;

        self.ensure_item(project_id, item_id).await?;

        if !self
            .core
            .storage()
            .delete_magnitude_consensus(item_id, criterion)
            .await?
        {
            return Err(SessionError::MagnitudeNotLocked {
                item_id,
                criterion: criterion.to_string(),
            });
        }

        info!(item_id, criterion = %criterion, unlocked_by = ?unlocked_by, "Magnitude unlocked");

        self.core
            .publisher()
            .publish(
                Audience::Project(project_id),
                ServerEvent::ConsensusUnlocked(ConsensusUnlockedPayload {
                    item_id,
                    criterion,
                    unlocked_by,
                }),
                None,
            )
            .await;

        Ok(())
    }

    /// The current lock for an item and criterion, if any.
    pub async fn get_consensus(
        &self,
        item_id: i64,
        criterion: Criterion,
    ) -> SessionResult<Option<MagnitudeConsensus>> {
        Ok(self
            .core
            .storage()
            .get_magnitude_consensus(item_id, criterion)
            .await?)
    }

    // Caller holds the item lock.
    async fn lock(
        &self,
        project_id: i64,
        item_id: i64,
        criterion: Criterion,
        value: i64,
        locked_by: Option<i64>,
        rationale: Option<String>,
    ) -> SessionResult<MagnitudeConsensus> {
        let consensus = MagnitudeConsensus {
            item_id,
            criterion,
            value,
            locked_by,
            locked_at: Utc::now(),
            rationale,
        };
        self.core
            .storage()
            .insert_magnitude_consensus(&consensus)
            .await?;

        info!(
            project_id,
            item_id,
            criterion = %criterion,
            value,
            forced = locked_by.is_some(),
            "Magnitude locked"
        );

        self.core
            .publisher()
            .publish(
                Audience::Project(project_id),
                ServerEvent::ConsensusLocked(ConsensusLockedPayload {
                    item_id,
                    criterion,
                    value,
                    locked_by,
                    rationale: consensus.rationale.clone(),
                }),
                None,
            )
            .await;

        Ok(consensus)
    }
}
