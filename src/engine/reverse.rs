//! Pre-order reverse pass and per-node ancestral queries.

use std::collections::BTreeMap;

use tracing::debug;

use super::{apply_fossil_mask, push_toward_tips, BranchSegment, EngineNode, NodeKind, PhyloEngine};
use crate::error::{BioGeoError, Result};
use crate::ext_float::ExtFloat;
use crate::range_model::RangeModel;

/// One cladogenetic outcome at a node with its joint likelihood.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AncSplit {
    pub ancestor: usize,
    pub left: usize,
    pub right: usize,
    pub likelihood: ExtFloat,
}

impl PhyloEngine {
    /// Top-down pass filling every node's ancestral prior vector.
    ///
    /// Runs a likelihood evaluation first when the stored vectors are stale.
    pub fn prepare_reverse_pass(&mut self) -> Result<()> {
        self.ensure_evaluated()?;
        let root = self.tree.root_index;
        let order = self.pre_order.clone();
        let Self {
            model,
            nodes,
            segments,
            ..
        } = self;

        let n_ranges = model.n_ranges();
        let mut b = vec![ExtFloat::ZERO; n_ranges];
        for &g in &model.period_space(nodes[root].period).included {
            if g != 0 && !nodes[root].excluded[g] {
                b[g] = ExtFloat::ONE;
            }
        }
        nodes[root].rev_b = b;

        for node in order {
            let NodeKind::Internal { left, right } = nodes[node].kind else {
                continue;
            };
            let (to_left, to_right) =
                split_priors(model, &nodes[node], &nodes[left].alpha, &nodes[right].alpha);
            for (child, prior) in [(left, to_left), (right, to_right)] {
                let n = &mut nodes[child];
                let segs = &mut segments[n.seg_start..n.seg_start + n.seg_len];
                n.rev_b = push_branch_down(model, segs, prior)?;
            }
        }
        self.reverse_ready = Some(self.current_generation());
        debug!("reverse pass complete");
        Ok(())
    }

    pub(crate) fn require_reverse(&self) -> Result<()> {
        match self.reverse_ready {
            Some(gen) if gen == self.current_generation() && self.evaluated == Some(gen) => Ok(()),
            _ => Err(BioGeoError::invalid(
                "ancestral queries need prepare_reverse_pass() under the current rates",
            )),
        }
    }

    /// Likelihood of each range at an internal node (indexed by global range).
    ///
    /// Entries sum to the tree likelihood; excluded and inadmissible ranges are zero.
    pub fn ancestral_state(&self, node: usize) -> Result<Vec<ExtFloat>> {
        self.require_reverse()?;
        let n = self.internal_node(node)?;
        Ok(n
            .conditionals
            .iter()
            .zip(&n.rev_b)
            .enumerate()
            .map(|(g, (&c, &b))| {
                if n.excluded[g] || !self.model.is_included(g, n.period) {
                    ExtFloat::ZERO
                } else {
                    b * c
                }
            })
            .collect())
    }

    /// Ancestral state likelihoods normalised to probabilities.
    pub fn ancestral_probabilities(&self, node: usize) -> Result<Vec<f64>> {
        let states = self.ancestral_state(node)?;
        let total: ExtFloat = states.iter().sum();
        if total.is_zero() {
            return Ok(vec![0.0; states.len()]);
        }
        Ok(states.iter().map(|&s| (s / total).to_f64()).collect())
    }

    /// Every split of every admissible range at an internal node, keyed by
    /// the ancestral range index.
    pub fn ancestral_split(&self, node: usize) -> Result<BTreeMap<usize, Vec<AncSplit>>> {
        self.require_reverse()?;
        let n = self.internal_node(node)?;
        let NodeKind::Internal { left, right } = n.kind else {
            return Ok(BTreeMap::new());
        };
        let v1 = &self.nodes[left].alpha;
        let v2 = &self.nodes[right].alpha;
        let mut out = BTreeMap::new();
        for r in 1..self.model.n_ranges() {
            if n.excluded[r] || !self.model.is_included(r, n.period) {
                continue;
            }
            let set = self.model.splits(r, n.period);
            let prior = n.rev_b[r] * set.weight;
            let entries: Vec<AncSplit> = set
                .splits
                .iter()
                .map(|s| AncSplit {
                    ancestor: r,
                    left: s.left,
                    right: s.right,
                    likelihood: prior * v1[s.left] * v2[s.right],
                })
                .collect();
            out.insert(r, entries);
        }
        Ok(out)
    }

    fn internal_node(&self, node: usize) -> Result<&EngineNode> {
        let n = self.node(node)?;
        if n.is_leaf() {
            return Err(BioGeoError::invalid(format!(
                "node {} is a tip; ancestral states exist only for internal nodes",
                node
            )));
        }
        Ok(n)
    }
}

/// Priors handed to the left and right child branches of `node`.
///
/// `to_left[l] = Σ_r B[r]·w(r)·alpha_right[s.right]` over splits `s = (l, ·)` of
/// each admissible range `r`, and symmetrically for the right child. The
/// node's own period decides which splits exist.
fn split_priors(
    model: &RangeModel,
    node: &EngineNode,
    left_alpha: &[ExtFloat],
    right_alpha: &[ExtFloat],
) -> (Vec<ExtFloat>, Vec<ExtFloat>) {
    let n_ranges = model.n_ranges();
    let mut to_left = vec![ExtFloat::ZERO; n_ranges];
    let mut to_right = vec![ExtFloat::ZERO; n_ranges];
    for r in 1..n_ranges {
        let b = node.rev_b[r];
        if b.is_zero() || node.excluded[r] || !model.is_included(r, node.period) {
            continue;
        }
        let set = model.splits(r, node.period);
        let w = b * set.weight;
        for s in &set.splits {
            to_left[s.left] += w * right_alpha[s.right];
            to_right[s.right] += w * left_alpha[s.left];
        }
    }
    (to_left, to_right)
}

/// Carry a prior from the top of a branch down to its node, parent end first.
fn push_branch_down(
    model: &RangeModel,
    segments: &mut [BranchSegment],
    prior: Vec<ExtFloat>,
) -> Result<Vec<ExtFloat>> {
    let mut a = prior;
    for seg in segments.iter_mut().rev() {
        let p = model
            .cached_transition(seg.period, seg.duration)
            .ok_or_else(|| BioGeoError::Numerical("transition matrix missing from cache".into()))?;
        let below = push_toward_tips(p, model.period_space(seg.period), &a);
        seg.rev_top = a;
        a = below;
        if let Some(fossil) = seg.fossil {
            apply_fossil_mask(model.ranges(), &mut a, fossil);
        }
        seg.ancdistconds = a.clone();
    }
    Ok(a)
}
