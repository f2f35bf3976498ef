//! Final-score calculation and ranking.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::core::EngineCore;
use super::magnitude::validate_magnitude;
use super::weighting::compute_win_counts;
use crate::error::{SessionError, SessionResult};
use crate::storage::{Criterion, PriorityResult, Storage};

/// Intermediate and final values of one item's score.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub weighted_value: f64,
    pub weighted_complexity: f64,
    pub final_score: f64,
}

fn validate_weight(weight: f64) -> SessionResult<f64> {
    if (0.0..=1.0).contains(&weight) {
        Ok(weight)
    } else {
        Err(SessionError::InvalidWeight { weight })
    }
}

/// Score one item from its locked magnitudes and win-count weights.
///
/// `final = (value_magnitude * value_weight) / (complexity_magnitude * complexity_weight)`.
/// When the weighted complexity is zero the raw complexity magnitude is used as
/// the denominator instead.
pub fn calculate_final_score(
    value_magnitude: i64,
    value_weight: f64,
    complexity_magnitude: i64,
    complexity_weight: f64,
) -> SessionResult<ScoreBreakdown> {
    validate_magnitude(value_magnitude)?;
    validate_magnitude(complexity_magnitude)?;
    validate_weight(value_weight)?;
    validate_weight(complexity_weight)?;

    let weighted_value = value_magnitude as f64 * value_weight;
    let weighted_complexity = complexity_magnitude as f64 * complexity_weight;
    let final_score = if weighted_complexity == 0.0 {
        weighted_value / complexity_magnitude as f64
    } else {
        weighted_value / weighted_complexity
    };

    Ok(ScoreBreakdown {
        weighted_value,
        weighted_complexity,
        final_score,
    })
}

/// Sort by final score descending, then item id ascending, and assign 1-based ranks.
pub fn rank_results(results: &mut [PriorityResult]) {
    results.sort_by(|a, b| {
        b.final_score
            .total_cmp(&a.final_score)
            .then_with(|| a.item_id.cmp(&b.item_id))
    });
    for (index, result) in results.iter_mut().enumerate() {
        result.rank = index as u32 + 1;
    }
}

/// Outcome of a project-wide calculation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriorityCalculation {
    pub project_id: i64,
    /// Ranked results, rank 1 first.
    pub results: Vec<PriorityResult>,
    /// Items left out because a magnitude is not locked yet.
    pub skipped: Vec<i64>,
}

/// Recomputes a project's ranking from settled sessions and magnitudes.
pub struct PriorityCalculator {
    core: EngineCore,
}

impl PriorityCalculator {
    pub fn new(core: EngineCore) -> Self {
        Self { core }
    }

    /// Recompute and persist the full ranking of a project.
    ///
    /// Holds the project exclusively for the whole run, so no vote or score
    /// lands mid-calculation. Any failure aborts without writing results.
    pub async fn calculate_final_scores(&self, project_id: i64) -> SessionResult<PriorityCalculation> {
        let _project = self.core.project_locks().write(project_id).await;
        let storage = self.core.storage();

        let item_ids = self.core.directory().list_items(project_id).await?;

        let mut weights = Vec::with_capacity(Criterion::ALL.len());
        for criterion in Criterion::ALL {
            let session = storage
                .get_latest_session(project_id, criterion)
                .await?
                .ok_or_else(|| SessionError::InsufficientData {
                    message: format!("project {} has no {} session", project_id, criterion),
                })?;
            let comparisons = storage.get_session_comparisons(&session.id).await?;
            weights.push(compute_win_counts(&item_ids, &comparisons, criterion)?);
        }
        let (value_counts, complexity_counts) = (&weights[0], &weights[1]);

        let calculated_at = Utc::now();
        let mut results = Vec::with_capacity(item_ids.len());
        let mut skipped = Vec::new();

        for &item_id in &item_ids {
            let value = storage
                .get_magnitude_consensus(item_id, Criterion::Value)
                .await?;
            let complexity = storage
                .get_magnitude_consensus(item_id, Criterion::Complexity)
                .await?;
            let (Some(value), Some(complexity)) = (value, complexity) else {
                skipped.push(item_id);
                continue;
            };

            let value_weight = value_counts.get(&item_id).map_or(0.0, |c| c.weight());
            let complexity_weight = complexity_counts.get(&item_id).map_or(0.0, |c| c.weight());
            let score =
                calculate_final_score(value.value, value_weight, complexity.value, complexity_weight)?;

            results.push(PriorityResult {
                project_id,
                item_id,
                value_weight,
                complexity_weight,
                value_magnitude: value.value,
                complexity_magnitude: complexity.value,
                weighted_value: score.weighted_value,
                weighted_complexity: score.weighted_complexity,
                final_score: score.final_score,
                rank: 0,
                calculated_at,
            });
        }

        if results.is_empty() {
            return Err(SessionError::InsufficientData {
                message: format!("no item of project {} has both magnitudes locked", project_id),
            });
        }
        if !skipped.is_empty() {
            warn!(project_id, skipped = ?skipped, "Items without locked magnitudes left unranked");
        }

        rank_results(&mut results);
        storage.replace_priority_results(project_id, &results).await?;

        info!(
            project_id,
            ranked = results.len(),
            skipped = skipped.len(),
            "Priority calculation complete"
        );

        Ok(PriorityCalculation {
            project_id,
            results,
            skipped,
        })
    }

    /// The ranking stored by the last calculation.
    pub async fn get_results(&self, project_id: i64) -> SessionResult<Vec<PriorityResult>> {
        Ok(self.core.storage().get_priority_results(project_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(item_id: i64, final_score: f64) -> PriorityResult {
        PriorityResult {
            project_id: 1,
            item_id,
            value_weight: 0.0,
            complexity_weight: 0.0,
            value_magnitude: 1,
            complexity_magnitude: 1,
            weighted_value: 0.0,
            weighted_complexity: 0.0,
            final_score,
            rank: 0,
            calculated_at: Utc::now(),
        }
    }

    #[test]
    fn test_zero_weighted_complexity_uses_raw_magnitude() {
        let score = calculate_final_score(21, 1.0, 2, 0.0).unwrap();
        assert_eq!(score.weighted_value, 21.0);
        assert_eq!(score.weighted_complexity, 0.0);
        assert_eq!(score.final_score, 10.5);
    }

    #[test]
    fn test_ratio_of_weighted_values() {
        let score = calculate_final_score(8, 0.5, 5, 0.5).unwrap();
        assert_eq!(score.weighted_value, 4.0);
        assert_eq!(score.weighted_complexity, 2.5);
        assert!((score.final_score - 1.6).abs() < 1e-12);
    }

    #[test]
    fn test_invalid_magnitude_rejected() {
        let err = calculate_final_score(4, 0.5, 5, 0.5).unwrap_err();
        assert!(matches!(err, SessionError::InvalidMagnitude { value: 4 }));
        let err = calculate_final_score(8, 0.5, 0, 0.5).unwrap_err();
        assert!(matches!(err, SessionError::InvalidMagnitude { value: 0 }));
    }

    #[test]
    fn test_invalid_weight_rejected() {
        for weight in [-0.1, 1.5, f64::NAN] {
            let err = calculate_final_score(8, weight, 5, 0.5).unwrap_err();
            assert!(matches!(err, SessionError::InvalidWeight { .. }));
        }
        assert!(calculate_final_score(8, 0.0, 5, 1.0).is_ok());
    }

    #[test]
    fn test_rank_ties_break_by_item_id() {
        let mut results = vec![result(3, 2.0), result(1, 5.0), result(2, 2.0), result(4, 0.1)];
        rank_results(&mut results);
        let order: Vec<(i64, u32)> = results.iter().map(|r| (r.item_id, r.rank)).collect();
        assert_eq!(order, vec![(1, 1), (2, 2), (3, 3), (4, 4)]);
    }

    #[test]
    fn test_rank_is_stable_across_runs() {
        let mut first = vec![result(5, 1.0), result(2, 1.0), result(9, 3.0)];
        let mut second = vec![result(9, 3.0), result(5, 1.0), result(2, 1.0)];
        rank_results(&mut first);
        rank_results(&mut second);
        assert_eq!(
            first.iter().map(|r| r.item_id).collect::<Vec<_>>(),
            second.iter().map(|r| r.item_id).collect::<Vec<_>>()
        );
    }
}
