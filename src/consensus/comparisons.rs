//! Pair generation for a comparison round.

use crate::error::{SessionError, SessionResult};

/// An unordered pair of items, lower id first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ItemPair {
    /// Lower item id.
    pub item_a_id: i64,
    /// Higher item id.
    pub item_b_id: i64,
}

/// Produce every unordered pair of `item_ids`.
///
/// Duplicate ids are collapsed. Pairs come out sorted by `(item_a_id, item_b_id)`
/// so repeated calls on the same set yield the same sequence regardless of
/// input order. Fails with [`SessionError::InsufficientItems`] when fewer than
/// two distinct items remain.
pub fn generate_pairs(item_ids: &[i64]) -> SessionResult<Vec<ItemPair>> {
    let mut ids = item_ids.to_vec();
    ids.sort_unstable();
    ids.dedup();

    if ids.len() < 2 {
        return Err(SessionError::InsufficientItems { count: ids.len() });
    }

    let mut pairs = Vec::with_capacity(pair_count(ids.len()));
    for (i, &a) in ids.iter().enumerate() {
        for &b in &ids[i + 1..] {
            pairs.push(ItemPair {
                item_a_id: a,
                item_b_id: b,
            });
        }
    }

    Ok(pairs)
}

/// Number of pairs for `n` items: n(n-1)/2.
pub fn pair_count(n: usize) -> usize {
    n * n.saturating_sub(1) / 2
}
