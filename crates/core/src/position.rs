//! Sibling-order keys for newly created blocks.
//!
//! Positions are plain `f64`s. A new key is either appended after the last
//! sibling or placed at the numeric midpoint between two neighbours, so an
//! insert never has to renumber existing siblings.

use serde::{Deserialize, Serialize};

use crate::block::Block;
use crate::clock::Timestamp;
use crate::ids::BlockId;

/// Modulus of the time-derived legacy key.
pub const LEGACY_POSITION_MODULUS: i64 = 1_000_000;

pub const DEFAULT_POSITION_STEP: f64 = 1024.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionStrategy {
    /// Append after the last sibling or bisect between neighbours.
    #[default]
    Monotonic,
    /// `current-time mod 1,000,000` when no insertion point is given.
    /// Collides under rapid successive inserts.
    Legacy,
}

/// Where a new block should land among its siblings.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum Placement {
    #[default]
    End,
    At(f64),
    After(BlockId),
    Before(BlockId),
}

impl From<Option<f64>> for Placement {
    fn from(position: Option<f64>) -> Self {
        position.map_or(Placement::End, Placement::At)
    }
}

/// Compute a position between two optional neighbour keys.
pub fn position_between(prev: Option<f64>, next: Option<f64>, step: f64) -> f64 {
    match (prev, next) {
        (None, None) => step,
        (Some(p), None) => p + step,
        (None, Some(n)) => n - step,
        (Some(p), Some(n)) => p + (n - p) / 2.0,
    }
}

/// Pick the position for a new block. `siblings` must be sorted by position.
/// An `After`/`Before` anchor that is not among the siblings falls back to `End`.
pub fn allocate(
    strategy: PositionStrategy,
    step: f64,
    siblings: &[Block],
    placement: Placement,
    now: Timestamp,
) -> f64 {
    let end = || match strategy {
        PositionStrategy::Monotonic => position_between(siblings.last().map(|b| b.position), None, step),
        PositionStrategy::Legacy => now.rem_euclid(LEGACY_POSITION_MODULUS) as f64,
    };

    match placement {
        Placement::At(position) => position,
        Placement::End => end(),
        Placement::After(anchor) => match siblings.iter().position(|b| b.id == anchor) {
            Some(idx) => position_between(
                Some(siblings[idx].position),
                siblings.get(idx + 1).map(|b| b.position),
                step,
            ),
            None => end(),
        },
        Placement::Before(anchor) => match siblings.iter().position(|b| b.id == anchor) {
            Some(idx) => position_between(
                idx.checked_sub(1).map(|i| siblings[i].position),
                Some(siblings[idx].position),
                step,
            ),
            None => end(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{BlockKind, Scope};
    use crate::ids::{ActorId, WorkspaceId};

    fn siblings(positions: &[f64]) -> Vec<Block> {
        let scope = Scope::root(WorkspaceId::new());
        positions
            .iter()
            .map(|p| Block::new(BlockId::new(), scope, BlockKind::Text, *p, ActorId::new(), 0))
            .collect()
    }

    #[test]
    fn monotonic_appends_after_last_sibling() {
        let list = siblings(&[10.0, 20.0]);
        let p = allocate(PositionStrategy::Monotonic, 1024.0, &list, Placement::End, 0);
        assert_eq!(p, 1044.0);
        assert_eq!(allocate(PositionStrategy::Monotonic, 1024.0, &[], Placement::End, 0), 1024.0);
    }

    #[test]
    fn rapid_appends_never_collide() {
        let mut list = siblings(&[]);
        let scope = Scope::root(WorkspaceId::new());
        for _ in 0..50 {
            let p = allocate(PositionStrategy::Monotonic, 1.0, &list, Placement::End, 42);
            assert!(list.last().is_none_or(|b| b.position < p));
            list.push(Block::new(BlockId::new(), scope, BlockKind::Text, p, ActorId::new(), 0));
        }
    }

    #[test]
    fn after_and_before_bisect_neighbours() {
        let list = siblings(&[10.0, 20.0, 30.0]);
        let after_first = allocate(PositionStrategy::Monotonic, 8.0, &list, Placement::After(list[0].id), 0);
        assert_eq!(after_first, 15.0);
        let before_first = allocate(PositionStrategy::Monotonic, 8.0, &list, Placement::Before(list[0].id), 0);
        assert_eq!(before_first, 2.0);
        let after_last = allocate(PositionStrategy::Monotonic, 8.0, &list, Placement::After(list[2].id), 0);
        assert_eq!(after_last, 38.0);
    }

    #[test]
    fn legacy_uses_time_modulus() {
        let list = siblings(&[999_999.0]);
        let p = allocate(PositionStrategy::Legacy, 1.0, &list, Placement::End, 5_000_123);
        assert_eq!(p, 123.0);
    }

    #[test]
    fn explicit_position_wins() {
        let list = siblings(&[1.0]);
        for strategy in [PositionStrategy::Monotonic, PositionStrategy::Legacy] {
            assert_eq!(allocate(strategy, 1.0, &list, Placement::At(100.0), 7), 100.0);
        }
        assert_eq!(Placement::from(Some(3.0)), Placement::At(3.0));
        assert_eq!(Placement::from(None), Placement::End);
    }
}
