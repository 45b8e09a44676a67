//! Forward simulation of node ranges down the tree.
//!
//! Each branch carries the distribution of ranges forward in time from the
//! inherited half of the parent's split; the node then takes the most probable
//! range of that distribution and draws one of its splits uniformly.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tracing::{info, warn};

use super::{push_toward_tips, NodeKind, PhyloEngine};
use crate::error::{BioGeoError, Result};
use crate::ext_float::ExtFloat;
use crate::range_model::Split;

/// Upper bound of randomly drawn rates.
const RANDOM_RATE_SCALE: f64 = 0.2;

/// Realised ranges of one simulation run.
#[derive(Clone, Debug, Serialize)]
pub struct SimulationOutcome {
    pub seed: u64,
    pub dispersal: f64,
    pub extinction: f64,
    /// Simulated range index per node; 0 marks an extinct lineage.
    pub node_ranges: Vec<usize>,
    /// Split drawn at each internal node, `None` for tips and extinct lineages.
    pub node_splits: Vec<Option<Split>>,
}

impl PhyloEngine {
    /// Simulate a range for every node, root first.
    ///
    /// # Arguments
    /// * `seed` - Seed of the run's random number generator
    /// * `random_rates` - Draw dispersal and extinction uniformly from `[0, 0.2)`,
    ///   redrawing until dispersal exceeds extinction, and install them
    ///
    /// # Returns
    /// The rates used and the per-node ranges, also stored on the nodes
    pub fn simulate(&mut self, seed: u64, random_rates: bool) -> Result<SimulationOutcome> {
        let mut rng = StdRng::seed_from_u64(seed);
        if random_rates {
            let (d, e) = draw_rates(&mut rng);
            self.set_rates(d, e)?;
        } else if self.model.dispersal() < self.model.extinction() {
            warn!(
                dispersal = self.model.dispersal(),
                extinction = self.model.extinction(),
                "dispersal below extinction gives mostly trivial histories"
            );
        }
        let keys = self.transition_keys();
        self.model.prepare_transitions(&keys)?;

        let root = self.tree.root_index;
        let root_range = self.draw_root_range(&mut rng)?;
        self.nodes[root].simulated = Some(root_range);
        self.nodes[root].simulated_split = self.draw_split(root, root_range, &mut rng);

        let order = self.pre_order.clone();
        for node in order.into_iter().filter(|&n| n != root) {
            let start = self.inherited_range(node)?;
            let dist = self.carry_forward(node, start)?;
            let range = most_probable(&dist);
            self.nodes[node].simulated = Some(range);
            self.nodes[node].simulated_split = match self.nodes[node].kind {
                NodeKind::Internal { .. } => self.draw_split(node, range, &mut rng),
                NodeKind::Leaf { .. } => None,
            };
        }

        let outcome = SimulationOutcome {
            seed,
            dispersal: self.model.dispersal(),
            extinction: self.model.extinction(),
            node_ranges: self.nodes.iter().map(|n| n.simulated.unwrap_or(0)).collect(),
            node_splits: self.nodes.iter().map(|n| n.simulated_split).collect(),
        };
        info!(
            seed,
            dispersal = outcome.dispersal,
            extinction = outcome.extinction,
            "simulation complete"
        );
        Ok(outcome)
    }

    /// Range a previous [`simulate`](Self::simulate) call assigned to `node`.
    pub fn simulated_range(&self, node: usize) -> Result<Option<usize>> {
        Ok(self.node(node)?.simulated)
    }

    fn draw_root_range(&self, rng: &mut StdRng) -> Result<usize> {
        let root = &self.nodes[self.tree.root_index];
        let candidates: Vec<usize> = self
            .model
            .period_space(root.period)
            .included
            .iter()
            .copied()
            .filter(|&g| g != 0 && !root.excluded[g])
            .collect();
        if candidates.is_empty() {
            return Err(BioGeoError::invalid("no admissible range at the root"));
        }
        Ok(candidates[rng.gen_range(0..candidates.len())])
    }

    fn draw_split(&self, node: usize, range: usize, rng: &mut StdRng) -> Option<Split> {
        let set = self.model.splits(range, self.nodes[node].period);
        if set.is_empty() {
            return None;
        }
        Some(set.splits[rng.gen_range(0..set.len())])
    }

    /// Half of the parent's drawn split that `node` starts from.
    fn inherited_range(&self, node: usize) -> Result<usize> {
        let parent = self.nodes[node]
            .parent
            .ok_or_else(|| BioGeoError::invalid("the root inherits no range"))?;
        let Some(split) = self.nodes[parent].simulated_split else {
            return Ok(0);
        };
        match self.nodes[parent].kind {
            NodeKind::Internal { left, .. } if left == node => Ok(split.left),
            _ => Ok(split.right),
        }
    }

    /// One-hot at `start`, pushed forward through the branch above `node`.
    fn carry_forward(&self, node: usize, start: usize) -> Result<Vec<ExtFloat>> {
        let mut v = vec![ExtFloat::ZERO; self.model.n_ranges()];
        v[start] = ExtFloat::ONE;
        for seg in self.segments(node).iter().rev() {
            let p = self
                .model
                .cached_transition(seg.period, seg.duration)
                .ok_or_else(|| {
                    BioGeoError::Numerical("transition matrix missing from cache".into())
                })?;
            v = push_toward_tips(p, self.model.period_space(seg.period), &v);
        }
        Ok(v)
    }
}

fn draw_rates(rng: &mut StdRng) -> (f64, f64) {
    loop {
        let d = rng.gen::<f64>() * RANDOM_RATE_SCALE;
        let e = rng.gen::<f64>() * RANDOM_RATE_SCALE;
        if !(d != 0.0 && e != 0.0 && d <= e) {
            return (d, e);
        }
    }
}

/// Index of the largest non-empty-range entry; later indices win ties.
///
/// Returns 0 when every non-empty range has probability zero.
fn most_probable(dist: &[ExtFloat]) -> usize {
    let mut best = 0;
    let mut best_value = ExtFloat::ZERO;
    for (g, &value) in dist.iter().enumerate().skip(1) {
        if value.is_zero() {
            continue;
        }
        if value >= best_value {
            best = g;
            best_value = value;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;

    fn three_areas() -> PhyloEngine {
        engine(
            "(((A:1,B:1):1,C:2):1.5,(D:3,E:3):0.5);",
            &["X", "Y", "Z"],
            3,
            &[&[0], &[1], &[2], &[0, 1], &[1, 2]],
            vec![2.5, 10.0],
        )
    }

    #[test]
    fn test_fixed_seed_reproduces_run() {
        let mut a = three_areas();
        let mut b = three_areas();
        let ra = a.simulate(17, true).unwrap();
        let rb = b.simulate(17, true).unwrap();
        assert_eq!(ra.node_ranges, rb.node_ranges);
        assert_eq!(ra.node_splits, rb.node_splits);
        assert_eq!(ra.dispersal.to_bits(), rb.dispersal.to_bits());
    }

    #[test]
    fn test_random_rates_favour_dispersal() {
        for seed in 0..20 {
            let mut e = three_areas();
            let out = e.simulate(seed, true).unwrap();
            assert!(out.dispersal < RANDOM_RATE_SCALE);
            assert!(out.extinction < RANDOM_RATE_SCALE);
            assert!(out.dispersal > out.extinction || out.dispersal == 0.0 || out.extinction == 0.0);
            assert_eq!(e.model().dispersal(), out.dispersal);
        }
    }

    #[test]
    fn test_fixed_rates_are_kept() {
        let mut e = three_areas();
        e.set_rates(0.05, 0.01).unwrap();
        let out = e.simulate(3, false).unwrap();
        assert_eq!(out.dispersal, 0.05);
        assert_eq!(out.extinction, 0.01);
    }

    #[test]
    fn test_every_node_gets_a_range() {
        let mut e = three_areas();
        let out = e.simulate(99, false).unwrap();
        let root = e.root();
        assert_ne!(out.node_ranges[root], 0);
        for node in 0..e.n_nodes() {
            assert_eq!(e.simulated_range(node).unwrap(), Some(out.node_ranges[node]));
            if e.node(node).unwrap().is_leaf() {
                assert!(out.node_splits[node].is_none());
            } else if out.node_ranges[node] != 0 {
                assert!(out.node_splits[node].is_some());
            }
        }
    }

    #[test]
    fn test_fixed_root_is_drawn() {
        let mut e = three_areas();
        let root = e.root();
        let yz = crate::range_model::Range::from_areas(&[1, 2]);
        e.fix_node_range(root, yz).unwrap();
        let out = e.simulate(5, false).unwrap();
        assert_eq!(out.node_ranges[root], e.model().index_of(yz).unwrap());
    }

    #[test]
    fn test_most_probable_prefers_later_ties() {
        let v = vec![
            ExtFloat::from(0.9),
            ExtFloat::from(0.2),
            ExtFloat::from(0.4),
            ExtFloat::from(0.4),
        ];
        assert_eq!(most_probable(&v), 3);
        assert_eq!(most_probable(&[ExtFloat::ONE, ExtFloat::ZERO]), 0);
    }
}
