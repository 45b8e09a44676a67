//! Likelihood engine over a time-sliced phylogeny.
//!
//! Every branch is cut at the period boundaries into [`BranchSegment`]s.
//! Segments live in one flat arena owned by the engine; each node addresses
//! its own run of segments, ordered from the node end (index 0) to the parent
//! end. Per-node and per-segment likelihood vectors are indexed by global range
//! index and overwritten on every evaluation.

pub mod pruning;
pub mod reverse;
pub mod simulate;
pub mod stochmap;
pub mod summary;

use ndarray::Array2;
use tracing::{debug, info, warn};

use crate::error::{BioGeoError, Result};
use crate::ext_float::ExtFloat;
use crate::range_model::{PeriodSpace, Range, RangeModel, RangeModelConfig, Split};
use crate::tree::Tree;

pub use reverse::AncSplit;
pub use simulate::SimulationOutcome;
pub use stochmap::{StochasticKind, StochasticTarget};
pub use summary::{NodeSplitSummary, NodeStateSummary, RangeEntry, SplitEntry};

/// Branches shorter than this are lengthened before slicing.
pub const MIN_BRANCH_LENGTH: f64 = 1e-6;

/// Tip or internal node, with what each needs for the traversals.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NodeKind {
    /// Observed tip with the global index of its range.
    Leaf { range: usize },
    /// Speciation node; `left` receives the left half of each split.
    Internal { left: usize, right: usize },
}

/// The part of a branch lying inside one period.
#[derive(Clone, Debug)]
pub struct BranchSegment {
    pub duration: f64,
    pub period: usize,
    /// Areas a fossil places the lineage in at the lower end of this segment.
    pub fossil: Option<Range>,
    /// Conditional vector entering the segment from below (after the fossil mask).
    pub distconds: Vec<ExtFloat>,
    /// Conditional vector at the top of the segment.
    pub alphas: Vec<ExtFloat>,
    /// Reverse-pass vector arriving at the top of the segment.
    pub rev_top: Vec<ExtFloat>,
    /// Reverse-pass vector leaving the bottom of the segment (after the fossil mask).
    pub ancdistconds: Vec<ExtFloat>,
}

impl BranchSegment {
    fn new(duration: f64, period: usize) -> Self {
        Self {
            duration,
            period,
            fossil: None,
            distconds: Vec::new(),
            alphas: Vec::new(),
            rev_top: Vec::new(),
            ancdistconds: Vec::new(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct EngineNode {
    pub kind: NodeKind,
    pub parent: Option<usize>,
    pub height: f64,
    pub period: usize,
    seg_start: usize,
    seg_len: usize,
    /// Ranges ruled out at this node, indexed by global range index.
    pub excluded: Vec<bool>,
    /// Conditional likelihoods at the node (post-split for internal nodes).
    pub conditionals: Vec<ExtFloat>,
    /// Conditional likelihoods at the top of the branch above the node.
    pub alpha: Vec<ExtFloat>,
    /// Reverse-pass (ancestral prior) vector at the node.
    pub rev_b: Vec<ExtFloat>,
    pub simulated: Option<usize>,
    pub simulated_split: Option<Split>,
}

impl EngineNode {
    pub fn is_leaf(&self) -> bool {
        matches!(self.kind, NodeKind::Leaf { .. })
    }
}

/// DEC likelihood engine: a tree, its segments and the range model they use.
#[derive(Clone, Debug)]
pub struct PhyloEngine {
    model: RangeModel,
    tree: Tree,
    nodes: Vec<EngineNode>,
    segments: Vec<BranchSegment>,
    post_order: Vec<usize>,
    pre_order: Vec<usize>,
    /// Rate generation the node vectors were computed with.
    evaluated: Option<u64>,
    reverse_ready: Option<u64>,
    likelihood: Option<ExtFloat>,
    stochastic: Option<stochmap::StochasticState>,
}

impl PhyloEngine {
    /// Build the range model from `config` and the tip ranges, then the engine.
    pub fn build(tree: Tree, config: RangeModelConfig, tip_ranges: &[Range]) -> Result<Self> {
        let model = RangeModel::new(config, tip_ranges)?;
        Self::new(tree, model, tip_ranges)
    }

    /// Slice the tree into period segments and attach tip data.
    ///
    /// # Arguments
    /// * `tree` - Rooted binary tree with branch lengths
    /// * `model` - Range model whose state space covers every tip range
    /// * `tip_ranges` - Observed range of each tip, in tip index order
    pub fn new(mut tree: Tree, model: RangeModel, tip_ranges: &[Range]) -> Result<Self> {
        if !tree.is_binary() {
            return Err(BioGeoError::invalid("tree must be strictly bifurcating"));
        }
        if tree.n_nodes < 2 {
            return Err(BioGeoError::invalid("tree needs at least two tips"));
        }
        if tip_ranges.len() != tree.n_tips {
            return Err(BioGeoError::invalid(format!(
                "{} tip ranges for {} tips",
                tip_ranges.len(),
                tree.n_tips
            )));
        }
        tree.clamp_branch_lengths(MIN_BRANCH_LENGTH);
        let heights = tree.heights();

        let durations = model.period_durations();
        let mut bounds: Vec<f64> = durations
            .iter()
            .scan(0.0, |acc, d| {
                *acc += d;
                Some(*acc)
            })
            .collect();
        // the last period runs back indefinitely
        if let Some(last) = bounds.last_mut() {
            *last = f64::INFINITY;
        }
        let period_of = |h: f64| bounds.iter().position(|&b| h <= b).unwrap_or(bounds.len() - 1);

        let n_ranges = model.n_ranges();
        let mut nodes = Vec::with_capacity(tree.n_nodes);
        let mut segments = Vec::new();
        for node in 0..tree.n_nodes {
            let kind = if tree.is_tip(node) {
                let range = model.require_index(tip_ranges[node]).map_err(|_| {
                    BioGeoError::UnknownRange(format!(
                        "tip {} range {} is not in the state space",
                        tree.labels[node].as_deref().unwrap_or("?"),
                        model.format_range(tip_ranges[node])
                    ))
                })?;
                NodeKind::Leaf { range }
            } else {
                NodeKind::Internal {
                    left: tree.children[node][0],
                    right: tree.children[node][1],
                }
            };
            let period = period_of(heights[node]);
            let seg_start = segments.len();
            if let Some(parent) = tree.parent(node) {
                slice_branch(heights[node], heights[parent], &bounds, &mut segments);
            }
            let seg_len = segments.len() - seg_start;

            let excluded = match kind {
                NodeKind::Internal { .. } => internal_exclusions(&model, period),
                NodeKind::Leaf { .. } => vec![false; n_ranges],
            };

            nodes.push(EngineNode {
                kind,
                parent: tree.parent(node),
                height: heights[node],
                period,
                seg_start,
                seg_len,
                excluded,
                conditionals: Vec::new(),
                alpha: Vec::new(),
                rev_b: Vec::new(),
                simulated: None,
                simulated_split: None,
            });
        }

        // the root sits in the oldest period whatever its height
        let root = tree.root_index;
        let last_period = model.n_periods().saturating_sub(1);
        if nodes[root].period != last_period {
            debug!(
                height = heights[root],
                from = nodes[root].period,
                to = last_period,
                "moving root into the last period"
            );
            nodes[root].period = last_period;
            if matches!(nodes[root].kind, NodeKind::Internal { .. }) {
                nodes[root].excluded = internal_exclusions(&model, last_period);
            }
        }

        info!(
            nodes = tree.n_nodes,
            tips = tree.n_tips,
            segments = segments.len(),
            root_height = heights[tree.root_index],
            "phylo engine built"
        );
        let post_order = tree.post_order();
        let pre_order = tree.pre_order();
        Ok(Self {
            model,
            tree,
            nodes,
            segments,
            post_order,
            pre_order,
            evaluated: None,
            reverse_ready: None,
            likelihood: None,
            stochastic: None,
        })
    }

    pub fn model(&self) -> &RangeModel {
        &self.model
    }

    /// Mutable access to the range model; cached evaluations are discarded.
    pub fn model_mut(&mut self) -> &mut RangeModel {
        self.invalidate();
        &mut self.model
    }

    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    pub fn n_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn root(&self) -> usize {
        self.tree.root_index
    }

    pub fn node(&self, node: usize) -> Result<&EngineNode> {
        self.nodes
            .get(node)
            .ok_or_else(|| BioGeoError::UnknownNode(node.to_string()))
    }

    pub fn nodes(&self) -> &[EngineNode] {
        &self.nodes
    }

    /// Segments of the branch above `node`, node end first.
    pub fn segments(&self, node: usize) -> &[BranchSegment] {
        let n = &self.nodes[node];
        &self.segments[n.seg_start..n.seg_start + n.seg_len]
    }

    pub fn internal_nodes(&self) -> Vec<usize> {
        self.post_order
            .iter()
            .copied()
            .filter(|&n| !self.nodes[n].is_leaf())
            .collect()
    }

    /// Node index of the most recent common ancestor of the named tips.
    pub fn mrca(&self, tip_names: &[&str]) -> Result<usize> {
        self.tree.mrca(tip_names)
    }

    pub fn set_dispersal(&mut self, dispersal: f64) -> Result<()> {
        self.invalidate();
        self.model.set_dispersal(dispersal)
    }

    pub fn set_extinction(&mut self, extinction: f64) -> Result<()> {
        self.invalidate();
        self.model.set_extinction(extinction)
    }

    pub fn set_rates(&mut self, dispersal: f64, extinction: f64) -> Result<()> {
        self.invalidate();
        self.model.set_rates(dispersal, extinction)
    }

    /// Exclude every range but `range` at an internal node.
    pub fn fix_node_range(&mut self, node: usize, range: Range) -> Result<()> {
        let keep = self.model.require_index(range)?;
        let n = self.internal_mut(node)?;
        for (g, ex) in n.excluded.iter_mut().enumerate() {
            if g != keep {
                *ex = true;
            }
        }
        self.warn_if_blocked(node);
        self.invalidate();
        Ok(())
    }

    /// Rule out one range at an internal node.
    pub fn exclude_range(&mut self, node: usize, range: Range) -> Result<()> {
        let g = self.model.require_index(range)?;
        self.internal_mut(node)?.excluded[g] = true;
        self.warn_if_blocked(node);
        self.invalidate();
        Ok(())
    }

    /// Fossil evidence at a node: only ranges containing `area` remain.
    pub fn add_node_fossil(&mut self, node: usize, area: usize) -> Result<()> {
        if area >= self.model.n_areas() {
            return Err(BioGeoError::UnknownArea(area.to_string()));
        }
        let ranges = self.model.ranges().to_vec();
        let n = self.internal_mut(node)?;
        for (g, r) in ranges.iter().enumerate() {
            if !r.contains(area) {
                n.excluded[g] = true;
            }
        }
        self.warn_if_blocked(node);
        self.invalidate();
        Ok(())
    }

    /// Fossil evidence on the branch above `node` at `age` (time before present).
    ///
    /// The segment containing `age` is cut there; the part above the cut only
    /// accepts ranges containing `area` at its lower end.
    pub fn add_branch_fossil(&mut self, node: usize, age: f64, area: usize) -> Result<()> {
        if area >= self.model.n_areas() {
            return Err(BioGeoError::UnknownArea(area.to_string()));
        }
        let n = self.node(node)?;
        if n.parent.is_none() {
            return Err(BioGeoError::invalid("the root has no branch for a fossil"));
        }
        let mut bottom = n.height;
        let top = bottom + self.segments(node).iter().map(|s| s.duration).sum::<f64>();
        if !(age > bottom && age < top) {
            return Err(BioGeoError::invalid(format!(
                "fossil age {} outside branch ({}, {})",
                age, bottom, top
            )));
        }
        let (start, len) = (n.seg_start, n.seg_len);
        for k in start..start + len {
            let seg_top = bottom + self.segments[k].duration;
            if age == bottom {
                self.mark_fossil(k, area);
                break;
            }
            if age < seg_top {
                let lower = age - bottom;
                let upper = seg_top - age;
                let period = self.segments[k].period;
                let fossil_below = self.segments[k].fossil;
                self.segments[k] = BranchSegment::new(upper, period);
                let mut lower_seg = BranchSegment::new(lower, period);
                lower_seg.fossil = fossil_below;
                self.segments.insert(k, lower_seg);
                self.mark_fossil(k + 1, area);
                for other in self.nodes.iter_mut() {
                    if other.seg_start > k {
                        other.seg_start += 1;
                    }
                }
                self.nodes[node].seg_len += 1;
                break;
            }
            bottom = seg_top;
        }
        self.invalidate();
        Ok(())
    }

    fn mark_fossil(&mut self, segment: usize, area: usize) {
        let seg = &mut self.segments[segment];
        seg.fossil = Some(seg.fossil.unwrap_or(Range::EMPTY).with(area));
    }

    fn internal_mut(&mut self, node: usize) -> Result<&mut EngineNode> {
        let n = self
            .nodes
            .get_mut(node)
            .ok_or_else(|| BioGeoError::UnknownNode(node.to_string()))?;
        if n.is_leaf() {
            return Err(BioGeoError::invalid(format!(
                "node {} is a tip; constraints apply to internal nodes",
                node
            )));
        }
        Ok(n)
    }

    fn warn_if_blocked(&self, node: usize) {
        let n = &self.nodes[node];
        let space = self.model.period_space(n.period);
        if space.included.iter().all(|&g| n.excluded[g]) {
            warn!(node, "no admissible range left at node; likelihood will be zero");
        }
    }

    /// Drop evaluation results that no longer match the model or constraints.
    pub(crate) fn invalidate(&mut self) {
        self.evaluated = None;
        self.reverse_ready = None;
        self.likelihood = None;
    }

    /// Every (period, duration) pair used by some segment.
    pub(crate) fn transition_keys(&self) -> Vec<(usize, f64)> {
        self.segments.iter().map(|s| (s.period, s.duration)).collect()
    }

    pub(crate) fn current_generation(&self) -> u64 {
        self.model.rates().generation
    }
}

/// Cut the branch between heights `low` and `high` at the period bounds.
fn slice_branch(low: f64, high: f64, bounds: &[f64], out: &mut Vec<BranchSegment>) {
    let mut t = low;
    for (period, &upper) in bounds.iter().enumerate() {
        if t >= high {
            break;
        }
        if t >= upper {
            continue;
        }
        let end = high.min(upper);
        let duration = end - t;
        if duration > 0.0 {
            out.push(BranchSegment::new(duration, period));
        }
        t = end;
    }
}

/// `out[j] = Σ_k P[j][k]·v[k]` over the period's admissible ranges.
///
/// Moves a conditional vector from the lower end of a segment to its upper end.
pub(crate) fn push_toward_root(p: &Array2<f64>, space: &PeriodSpace, v: &[ExtFloat]) -> Vec<ExtFloat> {
    let nonzero: Vec<(usize, ExtFloat)> = space
        .included
        .iter()
        .enumerate()
        .filter(|&(_, &g)| !v[g].is_zero())
        .map(|(l, &g)| (l, v[g]))
        .collect();
    let mut out = vec![ExtFloat::ZERO; v.len()];
    for (lj, &gj) in space.included.iter().enumerate() {
        let mut acc = ExtFloat::ZERO;
        for &(lk, value) in &nonzero {
            let pr = p[[lj, lk]];
            if pr != 0.0 {
                acc += value * pr;
            }
        }
        out[gj] = acc;
    }
    out
}

/// `out[j] = Σ_i a[i]·P[i][j]` over the period's admissible ranges.
///
/// Moves a distribution forward in time from the upper end of a segment to its
/// lower end.
pub(crate) fn push_toward_tips(p: &Array2<f64>, space: &PeriodSpace, a: &[ExtFloat]) -> Vec<ExtFloat> {
    let mut out = vec![ExtFloat::ZERO; a.len()];
    for (li, &gi) in space.included.iter().enumerate() {
        let value = a[gi];
        if value.is_zero() {
            continue;
        }
        for (lj, &gj) in space.included.iter().enumerate() {
            let pr = p[[li, lj]];
            if pr != 0.0 {
                out[gj] += value * pr;
            }
        }
    }
    out
}

/// Zero every entry whose range lacks one of the fossil areas.
pub(crate) fn apply_fossil_mask(ranges: &[Range], v: &mut [ExtFloat], fossil: Range) {
    for (g, value) in v.iter_mut().enumerate() {
        if !fossil.is_subset_of(ranges[g]) {
            *value = ExtFloat::ZERO;
        }
    }
}

/// Exclusion mask of an internal node in `period`: the empty range and every
/// range the period's adjacency forbids.
fn internal_exclusions(model: &RangeModel, period: usize) -> Vec<bool> {
    let mut excluded = vec![false; model.n_ranges()];
    excluded[0] = true;
    for &g in &model.period_space(period).excluded {
        excluded[g] = true;
    }
    excluded
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    /// Engine over `newick` with fully connected areas and one period.
    pub fn engine(
        newick: &str,
        areas: &[&str],
        max_range: usize,
        tips: &[&[usize]],
        periods: Vec<f64>,
    ) -> PhyloEngine {
        let tree = Tree::from_newick(newick, &[]).unwrap();
        let config = RangeModelConfig::new(names(areas), periods, max_range);
        let tip_ranges: Vec<Range> = tips.iter().map(|a| Range::from_areas(a)).collect();
        PhyloEngine::build(tree, config, &tip_ranges).unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn test_segments_follow_period_bounds() {
        let e = engine(
            "((A:3,B:3):4,C:7);",
            &["X", "Y"],
            2,
            &[&[0], &[1], &[0, 1]],
            vec![2.0, 3.0, 100.0],
        );
        let a = e.tree().tip_index("A").unwrap();
        let segs = e.segments(a);
        assert_eq!(segs.len(), 2);
        assert_eq!(segs[0].period, 0);
        assert!((segs[0].duration - 2.0).abs() < 1e-12);
        assert_eq!(segs[1].period, 1);
        assert!((segs[1].duration - 1.0).abs() < 1e-12);

        let ab = e.mrca(&["A", "B"]).unwrap();
        assert_eq!(e.node(ab).unwrap().period, 1);
        let periods: Vec<usize> = e.segments(ab).iter().map(|s| s.period).collect();
        assert_eq!(periods, vec![1, 2]);
        assert_eq!(e.node(e.root()).unwrap().period, 2);
        assert!(e.segments(e.root()).is_empty());
    }

    #[test]
    fn test_branch_lengths_are_clamped() {
        let e = engine("((A:0,B:0):1,C:1);", &["X", "Y"], 2, &[&[0], &[1], &[0]], vec![10.0]);
        let a = e.tree().tip_index("A").unwrap();
        assert!((e.segments(a)[0].duration - MIN_BRANCH_LENGTH).abs() < 1e-15);
    }

    #[test]
    fn test_unknown_tip_range_rejected() {
        let tree = Tree::from_newick("(A:1,B:1);", &[]).unwrap();
        let mut config = RangeModelConfig::new(names(&["X", "Y"]), vec![10.0], 2);
        config.exclude_ranges = vec![Range::from_areas(&[0, 1])];
        let tips = [Range::from_areas(&[0, 1]), Range::from_areas(&[0])];
        let model = RangeModel::new(config, &[]).unwrap();
        assert!(PhyloEngine::new(tree, model, &tips).is_err());
    }

    #[test]
    fn test_internal_nodes_exclude_empty_range() {
        let e = engine("(A:1,B:1);", &["X", "Y"], 2, &[&[0], &[1]], vec![10.0]);
        let root = e.node(e.root()).unwrap();
        assert!(root.excluded[0]);
        assert!(!root.excluded[1]);
    }

    #[test]
    fn test_root_moves_to_last_period() {
        let tree = Tree::from_newick("(A:1,B:1);", &[]).unwrap();
        let mut config = RangeModelConfig::new(names(&["X", "Y"]), vec![5.0, 100.0], 2);
        config.adjacency = Some(vec![
            vec![vec![true, false], vec![false, true]],
            vec![vec![true, true], vec![true, true]],
        ]);
        let tips = [Range::from_areas(&[0]), Range::from_areas(&[1])];
        let mut e = PhyloEngine::build(tree, config, &tips).unwrap();
        let xy = e.model().index_of(Range::from_areas(&[0, 1])).unwrap();
        assert!(!e.model().is_included(xy, 0));
        let root = e.node(e.root()).unwrap();
        assert_eq!(root.period, 1);
        assert!(root.excluded[0]);
        assert!(!root.excluded[xy]);

        let nll = e.evaluate_likelihood(true).unwrap().to_f64();
        assert!(nll.is_finite());
        assert!(!e.node(e.root()).unwrap().conditionals[xy].is_zero());
    }

    #[test]
    fn test_constraints_only_on_internal_nodes() {
        let mut e = engine("(A:1,B:1);", &["X", "Y"], 2, &[&[0], &[1]], vec![10.0]);
        let a = e.tree().tip_index("A").unwrap();
        assert!(e.fix_node_range(a, Range::from_areas(&[0])).is_err());
        let root = e.root();
        e.fix_node_range(root, Range::from_areas(&[0, 1])).unwrap();
        let excluded: Vec<bool> = e.node(root).unwrap().excluded.clone();
        let ab = e.model().index_of(Range::from_areas(&[0, 1])).unwrap();
        assert!(!excluded[ab]);
        assert_eq!(excluded.iter().filter(|x| !**x).count(), 1);
    }

    #[test]
    fn test_node_fossil_excludes_ranges_without_area() {
        let mut e = engine("(A:1,B:1);", &["X", "Y"], 2, &[&[0], &[1]], vec![10.0]);
        let root = e.root();
        e.add_node_fossil(root, 1).unwrap();
        let x = e.model().index_of(Range::from_areas(&[0])).unwrap();
        let y = e.model().index_of(Range::from_areas(&[1])).unwrap();
        assert!(e.node(root).unwrap().excluded[x]);
        assert!(!e.node(root).unwrap().excluded[y]);
    }

    #[test]
    fn test_branch_fossil_splits_segment() {
        let mut e = engine("((A:2,B:2):2,C:4);", &["X", "Y"], 2, &[&[0], &[1], &[0]], vec![10.0]);
        let c = e.tree().tip_index("C").unwrap();
        e.add_branch_fossil(c, 1.5, 1).unwrap();
        let segs = e.segments(c);
        assert_eq!(segs.len(), 2);
        assert!((segs[0].duration - 1.5).abs() < 1e-12);
        assert!((segs[1].duration - 2.5).abs() < 1e-12);
        assert_eq!(segs[1].fossil, Some(Range::from_areas(&[1])));
        assert!(segs[0].fossil.is_none());
        // other nodes still address their own segments
        let a = e.tree().tip_index("A").unwrap();
        assert!((e.segments(a)[0].duration - 2.0).abs() < 1e-12);
        assert!(e.add_branch_fossil(c, 9.0, 0).is_err());
        assert!(e.add_branch_fossil(e.root(), 1.0, 0).is_err());
    }

    #[test]
    fn test_push_helpers_are_transposes() {
        let e = engine("(A:1,B:1);", &["X", "Y"], 2, &[&[0], &[1]], vec![10.0]);
        let p = e.model().transition_matrix(0, 0.7).unwrap();
        let space = e.model().period_space(0);
        let n = e.model().n_ranges();
        let mut v = vec![ExtFloat::ZERO; n];
        v[2] = ExtFloat::ONE;
        let up = push_toward_root(&p, space, &v);
        let mut a = vec![ExtFloat::ZERO; n];
        a[1] = ExtFloat::ONE;
        let down = push_toward_tips(&p, space, &a);
        // P[1][2] seen from both directions
        assert!((up[1].to_f64() - down[2].to_f64()).abs() < 1e-15);
        assert!((up[1].to_f64() - p[[1, 2]]).abs() < 1e-15);
    }
}
