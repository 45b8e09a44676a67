//! Cladogenetic split enumeration.
//!
//! Splits are computed once per (range, period) and never change. Every split
//! of a range in a period carries the same weight, `1 / count`.

use std::collections::HashSet;

use serde::Serialize;

use super::combinatorics::subsets;
use super::state_space::{Range, StateSpace};

/// A parent range decomposed into left and right descendant ranges (global indices).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct Split {
    pub left: usize,
    pub right: usize,
}

/// All splits of one range in one period and their shared weight.
#[derive(Clone, Debug, Default)]
pub struct SplitSet {
    pub splits: Vec<Split>,
    pub weight: f64,
}

impl SplitSet {
    fn from_splits(splits: Vec<Split>) -> Self {
        let weight = if splits.is_empty() {
            0.0
        } else {
            1.0 / splits.len() as f64
        };
        Self { splits, weight }
    }

    pub fn len(&self) -> usize {
        self.splits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.splits.is_empty()
    }
}

/// Split table indexed `[range][period]`.
pub(crate) fn build_split_table(space: &StateSpace) -> Vec<Vec<SplitSet>> {
    (0..space.ranges.len())
        .map(|g| {
            (0..space.periods.len())
                .map(|p| enumerate_splits(space, g, p))
                .collect()
        })
        .collect()
}

/// Splits of range `global` admissible in `period`.
///
/// Size-1 ranges copy themselves into both daughters. Wider ranges get
/// sympatric splits `(x, r)`/`(r, x)` and vicariance `(x, r∖x)` for every
/// admissible single area `x`, plus, from size 4 upward, every admissible
/// bipartition into two halves of at least two areas.
pub(crate) fn enumerate_splits(space: &StateSpace, global: usize, period: usize) -> SplitSet {
    let period_space = &space.periods[period];
    if global == 0 || !period_space.contains(global) {
        return SplitSet::default();
    }
    let range = space.ranges[global];
    let admissible = |r: Range| -> Option<usize> {
        space
            .index
            .get(&r)
            .copied()
            .filter(|&g| period_space.contains(g))
    };

    let mut splits = Vec::new();
    if range.len() == 1 {
        splits.push(Split {
            left: global,
            right: global,
        });
        return SplitSet::from_splits(splits);
    }

    for area in range.areas() {
        let Some(x) = admissible(Range::from_areas(&[area])) else {
            continue;
        };
        splits.push(Split {
            left: x,
            right: global,
        });
        splits.push(Split {
            left: global,
            right: x,
        });
        let rest = range.without(area);
        if let Some(y) = admissible(rest) {
            splits.push(Split { left: x, right: y });
            if rest.len() > 1 {
                splits.push(Split { left: y, right: x });
            }
        }
    }

    let size = range.len();
    if size >= 4 {
        let areas: Vec<usize> = range.areas().collect();
        let mut seen_left: HashSet<usize> = splits.iter().map(|s| s.left).collect();
        for k in 2..=size / 2 {
            for chosen in subsets(size, k) {
                let half: Vec<usize> = chosen.iter().map(|&i| areas[i]).collect();
                let half = Range::from_areas(&half);
                let (Some(a), Some(b)) = (admissible(half), admissible(range.difference(half)))
                else {
                    continue;
                };
                // an even split meets each bipartition twice
                if !seen_left.insert(a) {
                    continue;
                }
                seen_left.insert(b);
                splits.push(Split { left: a, right: b });
                splits.push(Split { left: b, right: a });
            }
        }
    }

    SplitSet::from_splits(splits)
}
