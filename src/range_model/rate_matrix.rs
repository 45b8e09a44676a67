//! Dispersal (D), extinction (E) and instantaneous rate (Q) matrices.
//!
//! A [`RateMatrices`] value is an immutable snapshot for one (dispersal,
//! extinction, mask) setting. Rate changes build a new snapshot.

use ndarray::{Array1, Array2};

use super::combinatorics::subsets;
use super::expm::CsrMatrix;
use super::splits::SplitSet;
use super::state_space::{Range, StateSpace};

/// Rate matrices for every period.
#[derive(Clone, Debug)]
pub struct RateMatrices {
    /// Monotone counter identifying this snapshot.
    pub generation: u64,
    pub dispersal: f64,
    pub extinction: f64,
    /// Per-period `n_areas × n_areas` dispersal rates (`d × mask`, zero diagonal).
    pub d: Vec<Array2<f64>>,
    /// Per-period extinction rate of each area.
    pub e: Vec<Array1<f64>>,
    /// Per-period generator over that period's admissible ranges (local indices).
    pub q: Vec<CsrMatrix>,
}

impl RateMatrices {
    pub(crate) fn build(
        space: &StateSpace,
        splits: &[Vec<SplitSet>],
        mask: &[Array2<f64>],
        dispersal: f64,
        extinction: f64,
        generation: u64,
    ) -> Self {
        let n_areas = space.n_areas;
        let d: Vec<Array2<f64>> = mask
            .iter()
            .map(|m| {
                let mut dp = m * dispersal;
                for a in 0..n_areas {
                    dp[[a, a]] = 0.0;
                }
                dp
            })
            .collect();
        let e: Vec<Array1<f64>> = (0..space.periods.len())
            .map(|_| Array1::from_elem(n_areas, extinction))
            .collect();
        let q = (0..space.periods.len())
            .map(|p| build_generator(space, splits, &d[p], &e[p], p))
            .collect();
        Self {
            generation,
            dispersal,
            extinction,
            d,
            e,
            q,
        }
    }
}

/// Total dispersal rate from the areas of `source` into `dest`.
fn dispersal_into(d: &Array2<f64>, source: Range, dest: usize) -> f64 {
    source.areas().map(|src| d[[src, dest]]).sum()
}

/// Generator for one period.
///
/// Ranges one area apart are connected: gaining an area happens at the summed
/// dispersal rate from the occupied areas, losing one at that area's extinction
/// rate. The empty range is absorbing.
fn build_generator(
    space: &StateSpace,
    splits: &[Vec<SplitSet>],
    d: &Array2<f64>,
    e: &Array1<f64>,
    period: usize,
) -> CsrMatrix {
    let period_space = &space.periods[period];
    let max_size = space.max_range_size;
    let mut rows: Vec<Vec<(usize, f64)>> = vec![Vec::new(); period_space.len()];

    for (li, &gi) in period_space.included.iter().enumerate() {
        let from = space.ranges[gi];
        let size = from.len();
        if size == 0 || size > max_size {
            continue;
        }
        for area in 0..space.n_areas {
            let to = if from.contains(area) {
                from.without(area)
            } else {
                from.with(area)
            };
            let Some(lj) = space
                .index
                .get(&to)
                .and_then(|&gj| period_space.local[gj])
            else {
                continue;
            };
            let rate = if to.len() > size {
                dispersal_into(d, from, area)
            } else {
                e[area]
            };
            rows[li].push((lj, rate));
        }
    }

    if period == 0 {
        for &big in &space.big_tips {
            let Some(lb) = period_space.local[big] else {
                continue;
            };
            connect_big_tip(space, splits, d, period, big, lb, &mut rows);
        }
    }

    for (li, row) in rows.iter_mut().enumerate() {
        let total: f64 = row.iter().map(|&(_, v)| v).sum();
        row.push((li, -total));
    }
    CsrMatrix::from_rows(rows)
}

/// Inbound rates for an observed range wider than the maximum range size.
///
/// The widest proper sub-range size reachable through the tip's own splits is
/// used; every admissible sub-range of that size feeds the tip at the summed
/// dispersal rate into all of its missing areas.
fn connect_big_tip(
    space: &StateSpace,
    splits: &[Vec<SplitSet>],
    d: &Array2<f64>,
    period: usize,
    big: usize,
    local_big: usize,
    rows: &mut [Vec<(usize, f64)>],
) {
    let period_space = &space.periods[period];
    let tip = space.ranges[big];
    let tip_size = tip.len();
    let anc_size = splits[big][period]
        .splits
        .iter()
        .map(|s| space.ranges[s.left].len())
        .filter(|&size| size > 1 && size < tip_size)
        .max()
        .unwrap_or(1);

    let areas: Vec<usize> = tip.areas().collect();
    for chosen in subsets(tip_size, anc_size) {
        let picked: Vec<usize> = chosen.iter().map(|&i| areas[i]).collect();
        let sub = Range::from_areas(&picked);
        let Some(ls) = space
            .index
            .get(&sub)
            .and_then(|&g| period_space.local[g])
        else {
            continue;
        };
        let rate: f64 = tip
            .difference(sub)
            .areas()
            .map(|dest| dispersal_into(d, sub, dest))
            .sum();
        let row = &mut rows[ls];
        match row.iter_mut().find(|(c, _)| *c == local_big) {
            Some(entry) => entry.1 = rate,
            None => row.push((local_big, rate)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::splits::build_split_table;
    use super::super::state_space::StateSpaceSpec;
    use super::*;

    fn setup(n: usize, max: usize, observed: &[Range]) -> (StateSpace, Vec<Vec<SplitSet>>) {
        let adj = vec![vec![vec![true; n]; n]];
        let space = StateSpace::build(StateSpaceSpec {
            n_areas: n,
            max_range_size: max,
            adjacency: &adj,
            default_adjacency: true,
            include_ranges: None,
            exclude_ranges: &[],
            observed,
        })
        .unwrap();
        let splits = build_split_table(&space);
        (space, splits)
    }

    fn ones(n: usize) -> Vec<Array2<f64>> {
        vec![Array2::from_elem((n, n), 1.0)]
    }

    #[test]
    fn test_two_area_generator() {
        let (space, splits) = setup(2, 2, &[]);
        let rates = RateMatrices::build(&space, &splits, &ones(2), 0.1, 0.05, 0);
        let q = rates.q[0].to_dense();
        // order: {}, {A}, {B}, {AB}
        assert_eq!(q.row(0).iter().filter(|v| **v != 0.0).count(), 0);
        assert!((q[[1, 0]] - 0.05).abs() < 1e-12);
        assert!((q[[1, 3]] - 0.1).abs() < 1e-12);
        assert!((q[[3, 1]] - 0.05).abs() < 1e-12);
        assert!((q[[3, 2]] - 0.05).abs() < 1e-12);
        assert_eq!(q[[1, 2]], 0.0);
    }

    #[test]
    fn test_rows_sum_to_zero() {
        let (space, splits) = setup(4, 3, &[]);
        let rates = RateMatrices::build(&space, &splits, &ones(4), 0.3, 0.2, 0);
        let q = rates.q[0].to_dense();
        for i in 0..q.nrows() {
            assert!(q.row(i).sum().abs() < 1e-12);
            assert!(q[[i, i]] <= 0.0);
        }
    }

    #[test]
    fn test_dispersal_sums_over_sources() {
        let (space, splits) = setup(3, 3, &[]);
        let mut mask = ones(3);
        mask[0][[1, 2]] = 0.5;
        let rates = RateMatrices::build(&space, &splits, &mask, 0.2, 0.1, 0);
        let ab = space.index[&Range::from_areas(&[0, 1])];
        let abc = space.index[&Range::from_areas(&[0, 1, 2])];
        let q = rates.q[0].to_dense();
        assert!((q[[ab, abc]] - (0.2 + 0.1)).abs() < 1e-12);
        assert_eq!(rates.d[0][[1, 1]], 0.0);
    }

    #[test]
    fn test_big_tip_receives_inbound_rates() {
        let wide = Range::from_areas(&[0, 1, 2, 3]);
        let (space, splits) = setup(4, 2, &[wide]);
        let rates = RateMatrices::build(&space, &splits, &ones(4), 0.1, 0.1, 0);
        let big = space.index[&wide];
        let local_big = space.periods[0].local[big].unwrap();
        let q = rates.q[0].to_dense();
        let ab = space.periods[0].local[space.index[&Range::from_areas(&[0, 1])]].unwrap();
        // two sources into each of two missing areas
        assert!((q[[ab, local_big]] - 0.4).abs() < 1e-12);
        // absorbing once reached
        assert_eq!(q.row(local_big).iter().filter(|v| **v != 0.0).count(), 0);
        for i in 0..q.nrows() {
            assert!(q.row(i).sum().abs() < 1e-12);
        }
    }
}
