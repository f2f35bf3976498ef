//! Win-count weighting over a finished set of comparisons.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{SessionError, SessionResult};
use crate::storage::{Comparison, Criterion};

/// Tally of one item's settled comparisons.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct WinCount {
    pub wins: u32,
    pub losses: u32,
    pub ties: u32,
}

impl WinCount {
    /// Number of settled comparisons involving the item.
    pub fn total(&self) -> u32 {
        self.wins + self.losses + self.ties
    }

    /// `(wins + 0.5 * ties) / total`, or 0.0 when the item has no settled comparisons.
    pub fn weight(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            return 0.0;
        }
        (f64::from(self.wins) + 0.5 * f64::from(self.ties)) / f64::from(total)
    }
}

/// Count wins, losses and ties per item across the consensus-reached
/// comparisons of one criterion.
///
/// Every id in `item_ids` gets an entry, so items without settled comparisons
/// come back with weight 0.0. Comparisons still open are ignored. Fails with
/// [`SessionError::InsufficientData`] only when `comparisons` is empty.
pub fn compute_win_counts(
    item_ids: &[i64],
    comparisons: &[Comparison],
    criterion: Criterion,
) -> SessionResult<BTreeMap<i64, WinCount>> {
    if comparisons.is_empty() {
        return Err(SessionError::InsufficientData {
            message: format!("no {} comparisons to weight", criterion),
        });
    }

    let mut counts: BTreeMap<i64, WinCount> =
        item_ids.iter().map(|&id| (id, WinCount::default())).collect();

    for comparison in comparisons.iter().filter(|c| c.consensus_reached) {
        for (item, other) in [
            (comparison.item_a_id, comparison.item_b_id),
            (comparison.item_b_id, comparison.item_a_id),
        ] {
            let Some(count) = counts.get_mut(&item) else {
                continue;
            };
            if comparison.is_tie {
                count.ties += 1;
            } else if comparison.winner_id == Some(item) {
                count.wins += 1;
            } else if comparison.winner_id == Some(other) {
                count.losses += 1;
            }
        }
    }

    Ok(counts)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settled(a: i64, b: i64, winner: Option<i64>) -> Comparison {
        let mut c = Comparison::new("s", a, b);
        c.consensus_reached = true;
        c.winner_id = winner;
        c.is_tie = winner.is_none();
        c
    }

    #[test]
    fn test_all_ties_weight_half() {
        let comparisons = vec![settled(1, 2, None), settled(1, 3, None), settled(2, 3, None)];
        let counts = compute_win_counts(&[1, 2, 3], &comparisons, Criterion::Value).unwrap();
        for count in counts.values() {
            assert_eq!(count.ties, 2);
            assert_eq!(count.weight(), 0.5);
        }
    }

    #[test]
    fn test_clean_sweep() {
        let comparisons = vec![settled(1, 2, Some(1)), settled(1, 3, Some(1)), settled(2, 3, Some(3))];
        let counts = compute_win_counts(&[1, 2, 3], &comparisons, Criterion::Value).unwrap();
        assert_eq!(counts[&1].weight(), 1.0);
        assert_eq!(counts[&2].weight(), 0.0);
        assert_eq!(counts[&3].weight(), 0.5);
        assert_eq!(counts[&2].losses, 2);
    }

    #[test]
    fn test_item_without_comparisons_gets_zero() {
        let comparisons = vec![settled(1, 2, Some(2))];
        let counts = compute_win_counts(&[1, 2, 99], &comparisons, Criterion::Complexity).unwrap();
        assert_eq!(counts[&99], WinCount::default());
        assert_eq!(counts[&99].weight(), 0.0);
        assert_eq!(counts[&2].weight(), 1.0);
    }

    #[test]
    fn test_open_comparisons_ignored() {
        let open = Comparison::new("s", 1, 2);
        let counts = compute_win_counts(&[1, 2], &[open], Criterion::Value).unwrap();
        assert_eq!(counts[&1].total(), 0);
        assert_eq!(counts[&2].total(), 0);
    }

    #[test]
    fn test_empty_set_is_insufficient() {
        let err = compute_win_counts(&[1, 2], &[], Criterion::Value).unwrap_err();
        assert!(matches!(err, SessionError::InsufficientData { .. }));
    }
}
