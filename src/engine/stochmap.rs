//! Expected transition counts and dwelling times along branches.
//!
//! For a segment of duration `t` the expectation matrix is
//! `∫₀ᵗ exp(Q·s)·W·exp(Q·(t−s)) ds`, read off the upper right block of the
//! exponential of `[[Q·t, W·t], [0, Q·t]]`. `W` selects the quantity: the single
//! rate `Q[from][to]` for counts, the indicator of `from` for time.

use std::collections::HashMap;

use ndarray::{s, Array2};
use rayon::prelude::*;
use tracing::debug;

use super::PhyloEngine;
use crate::error::{BioGeoError, Result};
use crate::ext_float::ExtFloat;
use crate::range_model::expm::expm;
use crate::range_model::transition_cache::transition_key;
use crate::range_model::{Range, RateMatrices, TransitionKey};

/// Which expectation a stochastic map computes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StochasticKind {
    /// Expected number of `from → to` transitions.
    Count,
    /// Expected time spent in `from`.
    Time,
}

/// Pair of ranges a stochastic map is about (global indices).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StochasticTarget {
    pub from: usize,
    pub to: usize,
}

#[derive(Clone, Debug)]
pub(crate) struct StochasticState {
    target: StochasticTarget,
    generation: u64,
    matrices: HashMap<(TransitionKey, StochasticKind), Array2<f64>>,
}

impl PhyloEngine {
    /// Choose the transition (or, for time, the `from` range) to map.
    pub fn set_stochastic_target(&mut self, from: Range, to: Range) -> Result<()> {
        let target = StochasticTarget {
            from: self.model.require_index(from)?,
            to: self.model.require_index(to)?,
        };
        if from.symmetric_difference(to).len() > 1 {
            debug!(
                from = %self.model.format_range(from),
                to = %self.model.format_range(to),
                "ranges differ by more than one area; expected counts will be zero"
            );
        }
        self.stochastic = Some(StochasticState {
            target,
            generation: self.current_generation(),
            matrices: HashMap::new(),
        });
        Ok(())
    }

    pub fn stochastic_target(&self) -> Option<StochasticTarget> {
        self.stochastic.as_ref().map(|s| s.target)
    }

    /// Per-range expectation contributions on the branch above `node`.
    ///
    /// Each segment adds `A_top[i]·M[i][j]·L_bottom[j]` to entry `j`, where `A_top`
    /// is the reverse vector at the segment top and `L_bottom` the conditional
    /// vector entering it from below. Dividing the sum by the tree likelihood
    /// gives the posterior expectation; see
    /// [`expected_stochastic_total`](Self::expected_stochastic_total).
    pub fn reverse_stochastic_map(&mut self, node: usize, kind: StochasticKind) -> Result<Vec<ExtFloat>> {
        self.require_reverse()?;
        if self.node(node)?.parent.is_none() {
            return Err(BioGeoError::invalid("the root has no branch to map"));
        }
        self.prepare_stochastic(node, kind)?;
        let state = self
            .stochastic
            .as_ref()
            .ok_or_else(|| BioGeoError::invalid("set_stochastic_target() must come first"))?;

        let mut out = vec![ExtFloat::ZERO; self.model.n_ranges()];
        for seg in self.segments(node) {
            let key = (transition_key(seg.period, seg.duration), kind);
            let m = state
                .matrices
                .get(&key)
                .ok_or_else(|| BioGeoError::Numerical("expectation matrix missing".into()))?;
            let space = self.model.period_space(seg.period);
            for (lj, &gj) in space.included.iter().enumerate() {
                let below = seg.distconds[gj];
                if below.is_zero() {
                    continue;
                }
                let mut acc = ExtFloat::ZERO;
                for (li, &gi) in space.included.iter().enumerate() {
                    let top = seg.rev_top[gi];
                    let w = m[[li, lj]];
                    if top.is_zero() || w == 0.0 {
                        continue;
                    }
                    acc += top * w;
                }
                out[gj] += acc * below;
            }
        }
        Ok(out)
    }

    /// Posterior expectation on the branch above `node` as a plain number.
    pub fn expected_stochastic_total(&mut self, node: usize, kind: StochasticKind) -> Result<f64> {
        let contributions = self.reverse_stochastic_map(node, kind)?;
        let total = self
            .likelihood()
            .ok_or_else(|| BioGeoError::invalid("likelihood not evaluated"))?;
        if total.is_zero() {
            return Ok(0.0);
        }
        let sum: ExtFloat = contributions.iter().sum();
        Ok((sum / total).to_f64())
    }

    /// Compute the expectation matrices the segments above `node` need.
    fn prepare_stochastic(&mut self, node: usize, kind: StochasticKind) -> Result<()> {
        let generation = self.current_generation();
        let rates = self.model.rates();
        let wanted: Vec<(usize, f64)> = self
            .segments(node)
            .iter()
            .map(|s| (s.period, s.duration))
            .collect();
        let local: Vec<Vec<Option<usize>>> = (0..self.model.n_periods())
            .map(|p| self.model.period_space(p).local.clone())
            .collect();
        let state = self
            .stochastic
            .as_mut()
            .ok_or_else(|| BioGeoError::invalid("set_stochastic_target() must come first"))?;
        if state.generation != generation {
            state.matrices.clear();
            state.generation = generation;
        }
        let target = state.target;
        let mut missing: Vec<(usize, f64)> = Vec::new();
        for (period, duration) in wanted {
            let key = (transition_key(period, duration), kind);
            if !state.matrices.contains_key(&key) && !missing.contains(&(period, duration)) {
                missing.push((period, duration));
            }
        }
        let computed = missing
            .par_iter()
            .map(|&(period, duration)| {
                expectation_matrix(&rates, &local[period], period, duration, target, kind)
                    .map(|m| ((transition_key(period, duration), kind), m))
            })
            .collect::<Result<Vec<_>>>()?;
        state.matrices.extend(computed);
        Ok(())
    }
}

/// Van Loan block exponential for one segment, over the period's local indices.
fn expectation_matrix(
    rates: &RateMatrices,
    local: &[Option<usize>],
    period: usize,
    duration: f64,
    target: StochasticTarget,
    kind: StochasticKind,
) -> Result<Array2<f64>> {
    let q = rates.q[period].to_dense();
    let n = q.nrows();
    let mut w = Array2::<f64>::zeros((n, n));
    match (kind, local[target.from], local[target.to]) {
        (StochasticKind::Time, Some(f), _) => w[[f, f]] = 1.0,
        (StochasticKind::Count, Some(f), Some(t)) if f != t => w[[f, t]] = q[[f, t]],
        _ => return Ok(w),
    }
    if w.iter().all(|&v| v == 0.0) {
        return Ok(w);
    }
    let mut block = Array2::<f64>::zeros((2 * n, 2 * n));
    let qt = &q * duration;
    block.slice_mut(s![..n, ..n]).assign(&qt);
    block.slice_mut(s![n.., n..]).assign(&qt);
    block.slice_mut(s![..n, n..]).assign(&(&w * duration));
    let e = expm(&block)?;
    Ok(e.slice(s![..n, n..]).to_owned())
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;

    fn engine_two_periods() -> PhyloEngine {
        let mut e = engine(
            "((A:1,B:1):2,C:3);",
            &["X", "Y"],
            2,
            &[&[0], &[0, 1], &[1]],
            vec![0.5, 10.0],
        );
        e.set_rates(0.3, 0.1).unwrap();
        e.prepare_reverse_pass().unwrap();
        e
    }

    #[test]
    fn test_expected_times_cover_branch_length() {
        let mut e = engine_two_periods();
        let a = e.tree().tip_index("A").unwrap();
        let ranges = e.model().ranges().to_vec();
        let mut total = 0.0;
        for r in ranges {
            e.set_stochastic_target(r, r).unwrap();
            total += e.expected_stochastic_total(a, StochasticKind::Time).unwrap();
        }
        assert!((total - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_counts_are_non_negative() {
        let mut e = engine_two_periods();
        let c = e.tree().tip_index("C").unwrap();
        e.set_stochastic_target(Range::from_areas(&[1]), Range::from_areas(&[0, 1]))
            .unwrap();
        let gain = e.expected_stochastic_total(c, StochasticKind::Count).unwrap();
        assert!(gain >= 0.0);
        assert!(gain.is_finite());
    }

    #[test]
    fn test_non_adjacent_ranges_have_no_transitions() {
        let mut e = engine_two_periods();
        let c = e.tree().tip_index("C").unwrap();
        e.set_stochastic_target(Range::from_areas(&[0]), Range::from_areas(&[1]))
            .unwrap();
        let n = e.expected_stochastic_total(c, StochasticKind::Count).unwrap();
        assert_eq!(n, 0.0);
    }

    #[test]
    fn test_tip_in_from_range_spends_time_there() {
        let mut e = engine_two_periods();
        let a = e.tree().tip_index("A").unwrap();
        e.set_stochastic_target(Range::from_areas(&[0]), Range::from_areas(&[0]))
            .unwrap();
        let t = e.expected_stochastic_total(a, StochasticKind::Time).unwrap();
        assert!(t > 0.0 && t <= 1.0 + 1e-9);
    }

    #[test]
    fn test_requires_target_and_reverse_pass() {
        let mut e = engine_two_periods();
        let a = e.tree().tip_index("A").unwrap();
        assert!(e.reverse_stochastic_map(a, StochasticKind::Time).is_err());
        e.set_stochastic_target(Range::from_areas(&[0]), Range::from_areas(&[0]))
            .unwrap();
        let root = e.root();
        assert!(e.reverse_stochastic_map(root, StochasticKind::Time).is_err());
        e.set_dispersal(0.5).unwrap();
        assert!(e.reverse_stochastic_map(a, StochasticKind::Time).is_err());
    }
}
