//! Best and near-best ranges and splits per internal node.

use std::cmp::Ordering;

use serde::Serialize;

use super::PhyloEngine;
use crate::error::Result;
use crate::ext_float::ExtFloat;

/// Entries within this many log-likelihood units of the best are reported.
pub const CREDIBLE_LN_UNITS: f64 = 2.0;

#[derive(Clone, Debug, Serialize)]
pub struct RangeEntry {
    pub range: usize,
    pub label: String,
    /// Share of the node's total likelihood.
    pub relative_probability: f64,
    pub neg_log_likelihood: f64,
}

#[derive(Clone, Debug, Serialize)]
pub struct NodeStateSummary {
    pub node: usize,
    pub best: RangeEntry,
    /// Best first, in decreasing likelihood.
    pub credible: Vec<RangeEntry>,
}

#[derive(Clone, Debug, Serialize)]
pub struct SplitEntry {
    pub ancestor: usize,
    pub left: usize,
    pub right: usize,
    /// `LEFT|RIGHT` with area names joined by `_`.
    pub label: String,
    pub relative_probability: f64,
    pub neg_log_likelihood: f64,
}

#[derive(Clone, Debug, Serialize)]
pub struct NodeSplitSummary {
    pub node: usize,
    pub best: SplitEntry,
    pub credible: Vec<SplitEntry>,
}

impl PhyloEngine {
    /// Most likely ranges at an internal node.
    ///
    /// # Returns
    /// `None` when every range at the node has zero likelihood
    pub fn summarize_states(&self, node: usize) -> Result<Option<NodeStateSummary>> {
        let states = self.ancestral_state(node)?;
        let total: ExtFloat = states.iter().sum();
        let ranked = credible_set(states.into_iter().enumerate().collect());
        let entries: Vec<RangeEntry> = ranked
            .into_iter()
            .map(|(g, v)| RangeEntry {
                range: g,
                label: self.model.format_range(self.model.range(g)),
                relative_probability: (v / total).to_f64(),
                neg_log_likelihood: -v.ln(),
            })
            .collect();
        Ok(entries.first().cloned().map(|best| NodeStateSummary {
            node,
            best,
            credible: entries,
        }))
    }

    /// Most likely cladogenetic splits at an internal node.
    pub fn summarize_splits(&self, node: usize) -> Result<Option<NodeSplitSummary>> {
        let splits = self.ancestral_split(node)?;
        let all: Vec<(super::AncSplit, ExtFloat)> = splits
            .into_values()
            .flatten()
            .map(|s| (s, s.likelihood))
            .collect();
        let total: ExtFloat = all.iter().map(|(_, v)| *v).sum();
        let entries: Vec<SplitEntry> = credible_set(all)
            .into_iter()
            .map(|(s, v)| SplitEntry {
                ancestor: s.ancestor,
                left: s.left,
                right: s.right,
                label: format!(
                    "{}|{}",
                    self.model.format_range(self.model.range(s.left)),
                    self.model.format_range(self.model.range(s.right))
                ),
                relative_probability: (v / total).to_f64(),
                neg_log_likelihood: -v.ln(),
            })
            .collect();
        Ok(entries.first().cloned().map(|best| NodeSplitSummary {
            node,
            best,
            credible: entries,
        }))
    }

    /// State summaries for every internal node, in post-order.
    pub fn summarize_all_states(&self) -> Result<Vec<NodeStateSummary>> {
        let mut out = Vec::new();
        for node in self.internal_nodes() {
            if let Some(summary) = self.summarize_states(node)? {
                out.push(summary);
            }
        }
        Ok(out)
    }

    pub fn summarize_all_splits(&self) -> Result<Vec<NodeSplitSummary>> {
        let mut out = Vec::new();
        for node in self.internal_nodes() {
            if let Some(summary) = self.summarize_splits(node)? {
                out.push(summary);
            }
        }
        Ok(out)
    }
}

/// Non-zero entries within [`CREDIBLE_LN_UNITS`] of the best, best first.
fn credible_set<T>(items: Vec<(T, ExtFloat)>) -> Vec<(T, ExtFloat)> {
    let mut ranked: Vec<(T, ExtFloat)> = items.into_iter().filter(|(_, v)| !v.is_zero()).collect();
    ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));
    let Some(best_ln) = ranked.first().map(|(_, v)| v.ln()) else {
        return ranked;
    };
    ranked.retain(|(_, v)| best_ln - v.ln() <= CREDIBLE_LN_UNITS);
    ranked
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::range_model::Range;

    fn prepared() -> PhyloEngine {
        let mut e = engine(
            "((A:1,B:1):1,C:2);",
            &["North", "South"],
            2,
            &[&[0], &[0], &[0, 1]],
            vec![10.0],
        );
        e.set_rates(0.05, 0.02).unwrap();
        e.prepare_reverse_pass().unwrap();
        e
    }

    #[test]
    fn test_credible_set_cutoff() {
        let items = vec![
            ("a", ExtFloat::from(1.0)),
            ("b", ExtFloat::from((-1.5f64).exp())),
            ("c", ExtFloat::from((-2.5f64).exp())),
            ("d", ExtFloat::ZERO),
        ];
        let set = credible_set(items);
        let names: Vec<&str> = set.iter().map(|(n, _)| *n).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn test_state_summary_best_matches_probabilities() {
        let e = prepared();
        let ab = e.mrca(&["A", "B"]).unwrap();
        let summary = e.summarize_states(ab).unwrap().unwrap();
        let probs = e.ancestral_probabilities(ab).unwrap();
        let (best_idx, best_p) = probs
            .iter()
            .enumerate()
            .fold((0, 0.0), |acc, (i, &p)| if p > acc.1 { (i, p) } else { acc });
        assert_eq!(summary.best.range, best_idx);
        assert!((summary.best.relative_probability - best_p).abs() < 1e-9);
        // both tips below sit in North
        assert_eq!(summary.best.label, "North");
        assert!(summary.credible.iter().all(|r| r.relative_probability <= best_p + 1e-12));
    }

    #[test]
    fn test_split_labels() {
        let e = prepared();
        let root = e.root();
        let summary = e.summarize_splits(root).unwrap().unwrap();
        assert!(summary.best.label.contains('|'));
        let total: f64 = summary.credible.iter().map(|s| s.relative_probability).sum();
        assert!(total <= 1.0 + 1e-9);
        assert!(summary.best.neg_log_likelihood.is_finite());
    }

    #[test]
    fn test_blocked_node_has_no_summary() {
        let mut e = prepared();
        let root = e.root();
        for r in [&[0][..], &[1], &[0, 1]] {
            e.exclude_range(root, Range::from_areas(r)).unwrap();
        }
        e.prepare_reverse_pass().unwrap();
        assert!(e.summarize_states(root).unwrap().is_none());
        assert!(e.summarize_splits(root).unwrap().is_none());
    }

    #[test]
    fn test_all_internal_nodes_summarised() {
        let e = prepared();
        assert_eq!(e.summarize_all_states().unwrap().len(), 2);
        assert_eq!(e.summarize_all_splits().unwrap().len(), 2);
    }
}
