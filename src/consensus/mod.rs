//! Session engine: pairwise comparisons, magnitude estimates and ranking.
//!
//! - [`comparisons`] generates the pairs of a round.
//! - [`ledger`] records votes and settles comparisons by unanimity.
//! - [`weighting`] turns settled comparisons into per-item weights.
//! - [`magnitude`] collects and locks per-item magnitudes.
//! - [`priority`] combines weights and magnitudes into a ranking.
//!
//! The stateful engines share an [`EngineCore`].

pub mod comparisons;
mod core;
pub mod ledger;
pub mod locks;
pub mod magnitude;
pub mod priority;
pub mod weighting;

pub use self::core::EngineCore;
pub use comparisons::{generate_pairs, pair_count, ItemPair};
pub use ledger::{
    evaluate_consensus, Choice, ComparisonOutcome, ComparisonState, SessionProgress,
    SubmitOutcome, VoteLedger,
};
pub use locks::{KeyedLocks, ProjectLocks};
pub use magnitude::{
    unanimous_value, validate_magnitude, MagnitudeBoard, ScoreOutcome, MAGNITUDE_SCALE,
};
pub use priority::{
    calculate_final_score, rank_results, PriorityCalculation, PriorityCalculator, ScoreBreakdown,
};
pub use weighting::{compute_win_counts, WinCount};
