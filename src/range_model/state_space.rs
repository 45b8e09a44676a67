//! Range state space: enumeration of admissible ranges and their
//! per-period inclusion under adjacency constraints.

use std::collections::{HashMap, HashSet};
use std::fmt;

use tracing::debug;

use super::combinatorics::{rank_of_subset, subsets};
use crate::error::{BioGeoError, Result};

/// Maximum number of areas a [`Range`] bitset can hold.
pub const MAX_AREAS: usize = 64;

/// A set of areas stored as a bitset; bit `a` set means area `a` is occupied.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Range(u64);

impl Range {
    /// The all-extinct range.
    pub const EMPTY: Range = Range(0);

    pub fn from_bits(bits: u64) -> Self {
        Range(bits)
    }

    pub fn from_areas(areas: &[usize]) -> Self {
        Range(areas.iter().fold(0u64, |acc, &a| acc | (1u64 << a)))
    }

    /// Build from a 0/1 presence vector (index = area).
    pub fn from_presence(presence: &[u8]) -> Self {
        Range(
            presence
                .iter()
                .enumerate()
                .filter(|&(_, &p)| p != 0)
                .fold(0u64, |acc, (a, _)| acc | (1u64 << a)),
        )
    }

    pub fn bits(&self) -> u64 {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn contains(&self, area: usize) -> bool {
        area < MAX_AREAS && self.0 & (1u64 << area) != 0
    }

    pub fn with(&self, area: usize) -> Range {
        Range(self.0 | (1u64 << area))
    }

    pub fn without(&self, area: usize) -> Range {
        Range(self.0 & !(1u64 << area))
    }

    pub fn difference(&self, other: Range) -> Range {
        Range(self.0 & !other.0)
    }

    pub fn symmetric_difference(&self, other: Range) -> Range {
        Range(self.0 ^ other.0)
    }

    pub fn is_subset_of(&self, other: Range) -> bool {
        self.0 & !other.0 == 0
    }

    /// Occupied areas in increasing order.
    pub fn areas(&self) -> impl Iterator<Item = usize> {
        let bits = self.0;
        (0..MAX_AREAS).filter(move |&a| bits & (1u64 << a) != 0)
    }

    /// 0/1 presence vector of length `n_areas`.
    pub fn to_presence(&self, n_areas: usize) -> Vec<u8> {
        (0..n_areas).map(|a| u8::from(self.contains(a))).collect()
    }
}

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let areas: Vec<String> = self.areas().map(|a| a.to_string()).collect();
        write!(f, "{{{}}}", areas.join(","))
    }
}

/// Ranges admissible in one period, with global ↔ local index maps.
#[derive(Clone, Debug)]
pub struct PeriodSpace {
    /// Global indices of admissible ranges in increasing order; index 0 (empty) first.
    pub included: Vec<usize>,
    /// Global index → local (row/column) index in this period's matrices.
    pub local: Vec<Option<usize>>,
    /// Global indices of ranges that are not admissible in this period.
    pub excluded: Vec<usize>,
}

impl PeriodSpace {
    fn new(n_ranges: usize, included: Vec<usize>) -> Self {
        let mut local = vec![None; n_ranges];
        for (l, &g) in included.iter().enumerate() {
            local[g] = Some(l);
        }
        let excluded = (0..n_ranges).filter(|&g| local[g].is_none()).collect();
        Self {
            included,
            local,
            excluded,
        }
    }

    pub fn len(&self) -> usize {
        self.included.len()
    }

    pub fn is_empty(&self) -> bool {
        self.included.is_empty()
    }

    pub fn contains(&self, global: usize) -> bool {
        self.local.get(global).copied().flatten().is_some()
    }
}

/// Inputs that shape the state space.
pub(crate) struct StateSpaceSpec<'a> {
    pub n_areas: usize,
    pub max_range_size: usize,
    pub adjacency: &'a [Vec<Vec<bool>>],
    pub default_adjacency: bool,
    pub include_ranges: Option<&'a [Range]>,
    pub exclude_ranges: &'a [Range],
    pub observed: &'a [Range],
}

/// The enumerated ranges with their stable global indices.
#[derive(Clone, Debug)]
pub struct StateSpace {
    pub n_areas: usize,
    pub max_range_size: usize,
    pub ranges: Vec<Range>,
    pub index: HashMap<Range, usize>,
    /// Global indices of observed ranges wider than `max_range_size`.
    pub big_tips: Vec<usize>,
    pub periods: Vec<PeriodSpace>,
}

impl StateSpace {
    pub(crate) fn build(spec: StateSpaceSpec<'_>) -> Result<Self> {
        let n = spec.n_areas;
        let excluded_by_config: HashSet<Range> = spec.exclude_ranges.iter().copied().collect();

        let (candidates, max_range_size) = match spec.include_ranges {
            Some(list) => {
                let mut listed: Vec<Range> = list
                    .iter()
                    .copied()
                    .filter(|r| !r.is_empty() && !excluded_by_config.contains(r))
                    .collect();
                for r in &listed {
                    if r.areas().any(|a| a >= n) {
                        return Err(BioGeoError::UnknownRange(format!(
                            "{} uses an area outside 0..{}",
                            r, n
                        )));
                    }
                }
                // keep enumeration order: by size, then by lexicographic subset rank
                listed.sort_by_key(|r| {
                    let areas: Vec<usize> = r.areas().collect();
                    (r.len(), rank_of_subset(n, &areas))
                });
                listed.dedup();
                let widest = listed.iter().map(Range::len).max().unwrap_or(1);
                (listed, widest)
            }
            None => {
                let mut all = Vec::new();
                for k in 1..=spec.max_range_size {
                    for subset in subsets(n, k) {
                        let r = Range::from_areas(&subset);
                        if !excluded_by_config.contains(&r) {
                            all.push(r);
                        }
                    }
                }
                (all, spec.max_range_size)
            }
        };

        let mut ranges = Vec::with_capacity(candidates.len() + 1);
        ranges.push(Range::EMPTY);
        ranges.extend(candidates);

        let mut big_tips = Vec::new();
        for &obs in spec.observed {
            if obs.len() > max_range_size && !ranges.contains(&obs) {
                big_tips.push(ranges.len());
                ranges.push(obs);
            }
        }

        let index: HashMap<Range, usize> = ranges
            .iter()
            .enumerate()
            .map(|(i, &r)| (r, i))
            .collect();
        let observed: HashSet<Range> = spec.observed.iter().copied().collect();

        let mut periods = Vec::with_capacity(spec.adjacency.len());
        for (p, adjacency) in spec.adjacency.iter().enumerate() {
            let mut included = vec![0];
            for (g, r) in ranges.iter().enumerate().skip(1) {
                let admissible = if big_tips.contains(&g) {
                    p == 0
                } else if spec.default_adjacency {
                    true
                } else {
                    // tips that violate adjacency are still representable at the present
                    adjacency_compliant(r, adjacency) || (p == 0 && observed.contains(r))
                };
                if admissible {
                    included.push(g);
                }
            }
            debug!(
                period = p,
                admissible = included.len(),
                total = ranges.len(),
                "period state space"
            );
            periods.push(PeriodSpace::new(ranges.len(), included));
        }

        Ok(Self {
            n_areas: n,
            max_range_size,
            ranges,
            index,
            big_tips,
            periods,
        })
    }

    pub fn is_big_tip(&self, global: usize) -> bool {
        self.big_tips.contains(&global)
    }
}

/// Connectivity test for a range under an area adjacency matrix.
///
/// Size 1 is always admissible and size 2 needs a direct edge. Larger ranges
/// need at least `size - 1` internal edges and no area without a neighbour
/// inside the range.
pub fn adjacency_compliant(range: &Range, adjacency: &[Vec<bool>]) -> bool {
    let areas: Vec<usize> = range.areas().collect();
    let linked = |a: usize, b: usize| adjacency[a][b] || adjacency[b][a];
    match areas.len() {
        0 | 1 => true,
        2 => linked(areas[0], areas[1]),
        size => {
            let mut edges = 0;
            let mut has_neighbour = vec![false; size];
            for i in 0..size {
                for j in (i + 1)..size {
                    if linked(areas[i], areas[j]) {
                        edges += 1;
                        has_neighbour[i] = true;
                        has_neighbour[j] = true;
                    }
                }
            }
            edges >= size - 1 && has_neighbour.iter().all(|&h| h)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full(n: usize) -> Vec<Vec<bool>> {
        vec![vec![true; n]; n]
    }

    /// Linear chain 0 - 1 - 2 - 3.
    fn chain(n: usize) -> Vec<Vec<bool>> {
        let mut adj = vec![vec![false; n]; n];
        for i in 0..n {
            adj[i][i] = true;
            if i + 1 < n {
                adj[i][i + 1] = true;
                adj[i + 1][i] = true;
            }
        }
        adj
    }

    fn input<'a>(
        n: usize,
        max: usize,
        adjacency: &'a [Vec<Vec<bool>>],
        default_adjacency: bool,
        observed: &'a [Range],
    ) -> StateSpaceSpec<'a> {
        StateSpaceSpec {
            n_areas: n,
            max_range_size: max,
            adjacency,
            default_adjacency,
            include_ranges: None,
            exclude_ranges: &[],
            observed,
        }
    }

    #[test]
    fn test_range_bit_operations() {
        let r = Range::from_areas(&[0, 2]);
        assert_eq!(r.len(), 2);
        assert!(r.contains(2));
        assert!(!r.contains(1));
        assert_eq!(r.with(1).len(), 3);
        assert_eq!(r.without(0), Range::from_areas(&[2]));
        assert_eq!(r.symmetric_difference(Range::from_areas(&[0])).len(), 1);
        assert_eq!(Range::from_presence(&[1, 0, 1]), r);
        assert_eq!(r.to_presence(4), vec![1, 0, 1, 0]);
        assert_eq!(r.areas().collect::<Vec<_>>(), vec![0, 2]);
    }

    #[test]
    fn test_full_enumeration_order() {
        let adj = vec![full(3)];
        let space = StateSpace::build(input(3, 3, &adj, true, &[])).unwrap();
        assert_eq!(space.ranges.len(), 8);
        assert_eq!(space.ranges[0], Range::EMPTY);
        assert_eq!(space.ranges[1], Range::from_areas(&[0]));
        assert_eq!(space.ranges[4], Range::from_areas(&[0, 1]));
        assert_eq!(space.ranges[7], Range::from_areas(&[0, 1, 2]));
        assert_eq!(space.index[&Range::from_areas(&[1, 2])], 6);
        assert_eq!(space.periods[0].len(), 8);
        assert!(space.periods[0].excluded.is_empty());
    }

    #[test]
    fn test_adjacency_compliance() {
        let adj = chain(4);
        assert!(adjacency_compliant(&Range::from_areas(&[2]), &adj));
        assert!(adjacency_compliant(&Range::from_areas(&[1, 2]), &adj));
        assert!(!adjacency_compliant(&Range::from_areas(&[0, 2]), &adj));
        assert!(adjacency_compliant(&Range::from_areas(&[0, 1, 2]), &adj));
        assert!(!adjacency_compliant(&Range::from_areas(&[0, 1, 3]), &adj));
        assert!(adjacency_compliant(&Range::from_areas(&[0, 1, 2, 3]), &adj));
    }

    #[test]
    fn test_period_specific_exclusion() {
        let adj = vec![full(3), chain(3)];
        let space = StateSpace::build(input(3, 2, &adj, false, &[])).unwrap();
        let ac = space.index[&Range::from_areas(&[0, 2])];
        assert!(space.periods[0].contains(ac));
        assert!(!space.periods[1].contains(ac));
        assert_eq!(space.periods[1].excluded, vec![ac]);
        // local indices are dense and skip the excluded range
        assert_eq!(space.periods[1].len(), space.ranges.len() - 1);
    }

    #[test]
    fn test_big_tip_only_in_first_period() {
        let adj = vec![full(4), full(4)];
        let wide = Range::from_areas(&[0, 1, 2]);
        let observed = [wide, Range::from_areas(&[3])];
        let space = StateSpace::build(input(4, 2, &adj, true, &observed)).unwrap();
        assert_eq!(space.big_tips.len(), 1);
        let g = space.index[&wide];
        assert_eq!(g, space.ranges.len() - 1);
        assert!(space.periods[0].contains(g));
        assert!(!space.periods[1].contains(g));
    }

    #[test]
    fn test_conflicting_tip_kept_in_first_period() {
        let adj = vec![chain(3), chain(3)];
        let tip = Range::from_areas(&[0, 2]);
        let space = StateSpace::build(input(3, 2, &adj, false, &[tip])).unwrap();
        let g = space.index[&tip];
        assert!(space.periods[0].contains(g));
        assert!(!space.periods[1].contains(g));
    }

    #[test]
    fn test_include_and_exclude_lists() {
        let adj = vec![full(3)];
        let include = [
            Range::from_areas(&[0, 1]),
            Range::from_areas(&[0]),
            Range::from_areas(&[1]),
        ];
        let exclude = [Range::from_areas(&[1])];
        let space = StateSpace::build(StateSpaceSpec {
            include_ranges: Some(&include),
            exclude_ranges: &exclude,
            ..input(3, 3, &adj, true, &[])
        })
        .unwrap();
        assert_eq!(
            space.ranges,
            vec![
                Range::EMPTY,
                Range::from_areas(&[0]),
                Range::from_areas(&[0, 1])
            ]
        );
        assert_eq!(space.max_range_size, 2);
    }

    #[test]
    fn test_include_list_follows_enumeration_order() {
        let adj = vec![full(4)];
        let include = [
            Range::from_areas(&[2, 3]),
            Range::from_areas(&[1, 3]),
            Range::from_areas(&[3]),
            Range::from_areas(&[0, 3]),
            Range::from_areas(&[1, 2]),
            Range::from_areas(&[0]),
        ];
        let listed = StateSpace::build(StateSpaceSpec {
            include_ranges: Some(&include),
            ..input(4, 2, &adj, true, &[])
        })
        .unwrap();
        let enumerated = StateSpace::build(input(4, 2, &adj, true, &[])).unwrap();
        let expected: Vec<Range> = enumerated
            .ranges
            .iter()
            .copied()
            .filter(|r| r.is_empty() || include.contains(r))
            .collect();
        assert_eq!(listed.ranges, expected);
    }
}
