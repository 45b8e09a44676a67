//! Post-order conditional likelihood pass.

use tracing::{debug, warn};

use super::{apply_fossil_mask, push_toward_root, BranchSegment, EngineNode, NodeKind, PhyloEngine};
use crate::error::{BioGeoError, Result};
use crate::ext_float::ExtFloat;
use crate::range_model::RangeModel;

impl PhyloEngine {
    /// Compute the likelihood of the tip ranges under the current rates.
    ///
    /// Every node's conditional vector and every segment's stored vectors are
    /// recomputed. Joint reconstruction is not available; `marginal = false`
    /// is rejected with [`BioGeoError::Unsupported`].
    ///
    /// # Returns
    /// Negative natural log of the likelihood, as an extended-range value
    pub fn evaluate_likelihood(&mut self, marginal: bool) -> Result<ExtFloat> {
        if !marginal {
            return Err(BioGeoError::Unsupported(
                "joint reconstruction is not implemented; request the marginal likelihood".into(),
            ));
        }
        let keys = self.transition_keys();
        self.model.prepare_transitions(&keys)?;

        let order = self.post_order.clone();
        let Self {
            model,
            nodes,
            segments,
            ..
        } = self;
        for node in order {
            let conditionals = node_conditionals(model, nodes, node);
            nodes[node].conditionals = conditionals;
            if nodes[node].parent.is_some() {
                let n = &mut nodes[node];
                let segs = &mut segments[n.seg_start..n.seg_start + n.seg_len];
                n.alpha = propagate_branch(model, segs, &n.conditionals)?;
            }
        }

        let root = self.tree.root_index;
        let total: ExtFloat = self.nodes[root].conditionals.iter().sum();
        if total.is_zero() {
            warn!("likelihood is zero; check constraints and tip ranges");
        }
        let neg_ln = ExtFloat::from(-total.ln());
        debug!(
            likelihood = %total,
            neg_log_likelihood = %neg_ln,
            dispersal = self.model.dispersal(),
            extinction = self.model.extinction(),
            cached_transitions = self.model.cache_stats().entries,
            "likelihood evaluated"
        );
        self.likelihood = Some(total);
        self.evaluated = Some(self.current_generation());
        self.reverse_ready = None;
        Ok(neg_ln)
    }

    /// Negative log-likelihood as a plain float, for optimizers.
    pub fn neg_log_likelihood(&mut self) -> Result<f64> {
        Ok(self.evaluate_likelihood(true)?.to_f64())
    }

    /// Likelihood from the last evaluation, if the rates have not changed since.
    pub fn likelihood(&self) -> Option<ExtFloat> {
        match self.evaluated {
            Some(gen) if gen == self.current_generation() => self.likelihood,
            _ => None,
        }
    }

    /// Evaluate unless the stored vectors already match the current rates.
    pub(crate) fn ensure_evaluated(&mut self) -> Result<ExtFloat> {
        match self.likelihood() {
            Some(total) => Ok(total),
            None => {
                self.evaluate_likelihood(true)?;
                self.likelihood
                    .ok_or_else(|| BioGeoError::Numerical("likelihood unavailable".into()))
            }
        }
    }
}

/// Conditional vector at `node`: one-hot for tips, split-combined for internal nodes.
fn node_conditionals(model: &RangeModel, nodes: &[EngineNode], node: usize) -> Vec<ExtFloat> {
    let n_ranges = model.n_ranges();
    let mut out = vec![ExtFloat::ZERO; n_ranges];
    let n = &nodes[node];
    match n.kind {
        NodeKind::Leaf { range } => out[range] = ExtFloat::ONE,
        NodeKind::Internal { left, right } => {
            let v1 = &nodes[left].alpha;
            let v2 = &nodes[right].alpha;
            for r in 1..n_ranges {
                if n.excluded[r] || !model.is_included(r, n.period) {
                    continue;
                }
                let set = model.splits(r, n.period);
                let mut acc = ExtFloat::ZERO;
                for s in &set.splits {
                    let a = v1[s.left];
                    if a.is_zero() {
                        continue;
                    }
                    let b = v2[s.right];
                    if b.is_zero() {
                        continue;
                    }
                    acc += a * b;
                }
                out[r] = acc * set.weight;
            }
        }
    }
    out
}

/// Carry `conditionals` from a node to the top of its branch.
///
/// Fossil masks apply where a segment starts; each segment records the vector
/// entering it from below and the one leaving at its top.
fn propagate_branch(
    model: &RangeModel,
    segments: &mut [BranchSegment],
    conditionals: &[ExtFloat],
) -> Result<Vec<ExtFloat>> {
    let mut v = conditionals.to_vec();
    for seg in segments.iter_mut() {
        if let Some(fossil) = seg.fossil {
            apply_fossil_mask(model.ranges(), &mut v, fossil);
        }
        seg.distconds = v.clone();
        let p = model
            .cached_transition(seg.period, seg.duration)
            .ok_or_else(|| BioGeoError::Numerical("transition matrix missing from cache".into()))?;
        v = push_toward_root(p, model.period_space(seg.period), &v);
        seg.alphas = v.clone();
    }
    Ok(v)
}
