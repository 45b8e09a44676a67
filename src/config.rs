//! JSON analysis documents.
//!
//! An [`AnalysisConfig`] names areas, periods and constraints by their
//! human-readable labels; [`AnalysisConfig::build_engine`] resolves the labels
//! and applies every constraint to a fresh engine.

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::engine::{NodeSplitSummary, NodeStateSummary, PhyloEngine, SimulationOutcome, StochasticKind};
use crate::error::{BioGeoError, Result};
use crate::optimize::{optimize_rates, OptimizationResult, OptimizerConfig};
use crate::range_model::{Range, RangeModelConfig};
use crate::tree::Tree;

/// Range fixed at (or excluded from) the MRCA of a set of tips.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeRange {
    pub mrca: Vec<String>,
    /// Area names joined by `_`.
    pub range: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeFossil {
    pub mrca: Vec<String>,
    pub area: String,
}

/// Fossil on the branch above the MRCA (a single name selects a tip branch).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BranchFossil {
    pub mrca: Vec<String>,
    pub age: f64,
    pub area: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MaskCell {
    pub period: usize,
    pub from: String,
    pub to: String,
    pub value: f64,
}

/// Branch expectation to report for every non-root node.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StochasticRequest {
    pub from: String,
    pub to: String,
    /// Expected time in `from` instead of the number of `from → to` events.
    #[serde(default)]
    pub time: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub areas: Vec<String>,
    /// Period lengths, youngest first.
    pub period_durations: Option<Vec<f64>>,
    /// Alternative to durations: increasing ages at which each period ends.
    pub period_boundaries: Option<Vec<f64>>,
    /// Per-period 0/1 adjacency matrices.
    pub adjacency: Option<Vec<Vec<Vec<u8>>>>,
    /// Defaults to the number of areas.
    pub max_range_size: Option<usize>,
    pub include_ranges: Option<Vec<String>>,
    pub exclude_ranges: Vec<String>,
    pub dispersal: f64,
    pub extinction: f64,
    pub optimize: bool,
    pub optimizer: OptimizerConfig,
    pub sparse: bool,
    pub threads: Option<usize>,
    pub fixed_nodes: Vec<NodeRange>,
    pub excluded_node_ranges: Vec<NodeRange>,
    pub node_fossils: Vec<NodeFossil>,
    pub branch_fossils: Vec<BranchFossil>,
    pub dispersal_mask: Vec<MaskCell>,
    pub simulation_seed: Option<u64>,
    pub random_rates: bool,
    /// Report states at every internal node.
    pub all_ancestral_states: bool,
    pub all_ancestral_splits: bool,
    /// MRCAs whose states are reported.
    pub ancestral_states: Vec<Vec<String>>,
    pub ancestral_splits: Vec<Vec<String>>,
    pub stochastic_maps: Vec<StochasticRequest>,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            areas: Vec::new(),
            period_durations: None,
            period_boundaries: None,
            adjacency: None,
            max_range_size: None,
            include_ranges: None,
            exclude_ranges: Vec::new(),
            dispersal: 0.1,
            extinction: 0.1,
            optimize: false,
            optimizer: OptimizerConfig::default(),
            sparse: false,
            threads: None,
            fixed_nodes: Vec::new(),
            excluded_node_ranges: Vec::new(),
            node_fossils: Vec::new(),
            branch_fossils: Vec::new(),
            dispersal_mask: Vec::new(),
            simulation_seed: None,
            random_rates: false,
            all_ancestral_states: false,
            all_ancestral_splits: false,
            ancestral_states: Vec::new(),
            ancestral_splits: Vec::new(),
            stochastic_maps: Vec::new(),
        }
    }
}

/// Branch expectations for one stochastic-map request.
#[derive(Clone, Debug, Serialize)]
pub struct StochasticReport {
    pub from: String,
    pub to: String,
    pub time: bool,
    /// `(node, expectation)` for every non-root node.
    pub branches: Vec<(usize, f64)>,
    pub total: f64,
}

/// Everything an analysis run produces.
#[derive(Clone, Debug, Serialize)]
pub struct AnalysisReport {
    pub dispersal: f64,
    pub extinction: f64,
    pub neg_log_likelihood: f64,
    pub optimization: Option<OptimizationResult>,
    pub states: Vec<NodeStateSummary>,
    pub splits: Vec<NodeSplitSummary>,
    pub stochastic: Vec<StochasticReport>,
    pub simulation: Option<SimulationOutcome>,
}

impl AnalysisConfig {
    /// Decode and validate a JSON document.
    pub fn from_json(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Check the document for internal consistency.
    pub fn validate(&self) -> Result<()> {
        let n = self.areas.len();
        if n == 0 {
            return Err(BioGeoError::Config("no areas given".into()));
        }
        for (i, a) in self.areas.iter().enumerate() {
            if a.is_empty() || a.contains(|c: char| c == '_' || c == ',' || c.is_whitespace()) {
                return Err(BioGeoError::Config(format!("invalid area name '{}'", a)));
            }
            if self.areas[..i].contains(a) {
                return Err(BioGeoError::Config(format!("duplicate area '{}'", a)));
            }
        }
        // no periods means one default period
        let n_periods = self.durations()?.len().max(1);
        if let Some(adj) = &self.adjacency {
            if adj.len() != n_periods {
                return Err(BioGeoError::Config(format!(
                    "{} adjacency matrices for {} periods",
                    adj.len(),
                    n_periods
                )));
            }
            if adj.iter().any(|m| m.len() != n || m.iter().any(|row| row.len() != n)) {
                return Err(BioGeoError::Config(format!(
                    "adjacency matrices must be {}x{}",
                    n, n
                )));
            }
        }
        if let Some(m) = self.max_range_size {
            if m == 0 || m > n {
                return Err(BioGeoError::Config(format!(
                    "max_range_size {} outside 1..={}",
                    m, n
                )));
            }
        }
        for (name, rate) in [("dispersal", self.dispersal), ("extinction", self.extinction)] {
            if !(rate > 0.0 && rate.is_finite()) {
                return Err(BioGeoError::Config(format!(
                    "{} rate must be positive, got {}",
                    name, rate
                )));
            }
        }
        if !(self.optimizer.precision > 0.0) {
            return Err(BioGeoError::Config("optimizer precision must be positive".into()));
        }
        for cell in &self.dispersal_mask {
            if cell.period >= n_periods {
                return Err(BioGeoError::Config(format!(
                    "mask cell period {} out of range",
                    cell.period
                )));
            }
            self.area(&cell.from)?;
            self.area(&cell.to)?;
        }
        for f in &self.node_fossils {
            self.area(&f.area)?;
        }
        for f in &self.branch_fossils {
            self.area(&f.area)?;
        }
        let entries = self
            .fixed_nodes
            .iter()
            .map(|c| ("fixed_nodes", c.range.as_str()))
            .chain(
                self.excluded_node_ranges
                    .iter()
                    .map(|c| ("excluded_node_ranges", c.range.as_str())),
            )
            .chain(self.exclude_ranges.iter().map(|r| ("exclude_ranges", r.as_str())))
            .chain(
                self.include_ranges
                    .iter()
                    .flatten()
                    .map(|r| ("include_ranges", r.as_str())),
            );
        for (entry, text) in entries {
            if self.range(text)?.is_empty() {
                return Err(BioGeoError::Config(format!(
                    "{}: empty range '{}'",
                    entry, text
                )));
            }
        }
        Ok(())
    }

    /// Period durations, from explicit durations or boundary ages.
    pub fn durations(&self) -> Result<Vec<f64>> {
        match (&self.period_durations, &self.period_boundaries) {
            (Some(_), Some(_)) => Err(BioGeoError::Config(
                "give either period_durations or period_boundaries".into(),
            )),
            (Some(d), None) => {
                if d.iter().any(|v| !(*v > 0.0 && v.is_finite())) {
                    return Err(BioGeoError::Config("period durations must be positive".into()));
                }
                Ok(d.clone())
            }
            (None, Some(b)) => {
                let mut out = Vec::with_capacity(b.len());
                let mut previous = 0.0;
                for &age in b {
                    if !(age > previous && age.is_finite()) {
                        return Err(BioGeoError::Config(format!(
                            "period boundaries must increase, got {} after {}",
                            age, previous
                        )));
                    }
                    out.push(age - previous);
                    previous = age;
                }
                Ok(out)
            }
            (None, None) => Ok(Vec::new()),
        }
    }

    fn area(&self, name: &str) -> Result<usize> {
        self.areas
            .iter()
            .position(|a| a == name)
            .ok_or_else(|| BioGeoError::UnknownArea(name.to_string()))
    }

    /// Range from area names joined by `_`.
    pub fn range(&self, text: &str) -> Result<Range> {
        let areas = text
            .split('_')
            .filter(|s| !s.is_empty())
            .map(|name| self.area(name))
            .collect::<Result<Vec<_>>>()?;
        Ok(Range::from_areas(&areas))
    }

    /// Typed range model input.
    pub fn range_model_config(&self) -> Result<RangeModelConfig> {
        let n = self.areas.len();
        let durations = self.durations()?;
        let n_periods = durations.len().max(1);
        let mut config = RangeModelConfig::new(
            self.areas.clone(),
            durations,
            self.max_range_size.unwrap_or(n),
        );
        config.adjacency = self.adjacency.as_ref().map(|adj| {
            adj.iter()
                .map(|m| m.iter().map(|row| row.iter().map(|&v| v != 0).collect()).collect())
                .collect()
        });
        config.include_ranges = match &self.include_ranges {
            Some(list) => Some(list.iter().map(|r| self.range(r)).collect::<Result<_>>()?),
            None => None,
        };
        config.exclude_ranges = self
            .exclude_ranges
            .iter()
            .map(|r| self.range(r))
            .collect::<Result<_>>()?;
        if !self.dispersal_mask.is_empty() {
            let mut mask = vec![vec![vec![1.0; n]; n]; n_periods];
            for cell in &self.dispersal_mask {
                let period = mask.get_mut(cell.period).ok_or_else(|| {
                    BioGeoError::Config(format!("mask cell period {} out of range", cell.period))
                })?;
                period[self.area(&cell.from)?][self.area(&cell.to)?] = cell.value;
            }
            config.dispersal_mask = Some(mask);
        }
        config.sparse = self.sparse;
        config.threads = self.threads;
        config.dispersal = self.dispersal;
        config.extinction = self.extinction;
        Ok(config)
    }

    fn node_of(&self, engine: &PhyloEngine, mrca: &[String]) -> Result<usize> {
        let names: Vec<&str> = mrca.iter().map(String::as_str).collect();
        engine.mrca(&names)
    }

    /// Build an engine and apply every node and branch constraint.
    pub fn build_engine(&self, tree: Tree, tip_ranges: &[Range]) -> Result<PhyloEngine> {
        let mut engine = PhyloEngine::build(tree, self.range_model_config()?, tip_ranges)?;
        for fixed in &self.fixed_nodes {
            let node = self.node_of(&engine, &fixed.mrca)?;
            engine.fix_node_range(node, self.range(&fixed.range)?)?;
        }
        for ex in &self.excluded_node_ranges {
            let node = self.node_of(&engine, &ex.mrca)?;
            engine.exclude_range(node, self.range(&ex.range)?)?;
        }
        for fossil in &self.node_fossils {
            let node = self.node_of(&engine, &fossil.mrca)?;
            engine.add_node_fossil(node, self.area(&fossil.area)?)?;
        }
        for fossil in &self.branch_fossils {
            let node = self.node_of(&engine, &fossil.mrca)?;
            engine.add_branch_fossil(node, fossil.age, self.area(&fossil.area)?)?;
        }
        Ok(engine)
    }

    /// Evaluate, optionally optimise, then produce every requested report.
    pub fn run(&self, engine: &mut PhyloEngine) -> Result<AnalysisReport> {
        let optimization = if self.optimize {
            Some(optimize_rates(engine, &self.optimizer)?)
        } else {
            None
        };
        let neg_log_likelihood = engine.neg_log_likelihood()?;
        info!(
            dispersal = engine.model().dispersal(),
            extinction = engine.model().extinction(),
            neg_log_likelihood,
            "analysis likelihood"
        );

        let wants_reverse = self.all_ancestral_states
            || self.all_ancestral_splits
            || !self.ancestral_states.is_empty()
            || !self.ancestral_splits.is_empty()
            || !self.stochastic_maps.is_empty();
        let mut states = Vec::new();
        let mut splits = Vec::new();
        let mut stochastic = Vec::new();
        if wants_reverse {
            engine.prepare_reverse_pass()?;
            if self.all_ancestral_states {
                states = engine.summarize_all_states()?;
            } else {
                for mrca in &self.ancestral_states {
                    let node = self.node_of(engine, mrca)?;
                    states.extend(engine.summarize_states(node)?);
                }
            }
            if self.all_ancestral_splits {
                splits = engine.summarize_all_splits()?;
            } else {
                for mrca in &self.ancestral_splits {
                    let node = self.node_of(engine, mrca)?;
                    splits.extend(engine.summarize_splits(node)?);
                }
            }
            for request in &self.stochastic_maps {
                stochastic.push(self.stochastic_report(engine, request)?);
            }
        }

        let (dispersal, extinction) = (engine.model().dispersal(), engine.model().extinction());
        let simulation = match self.simulation_seed {
            Some(seed) => Some(engine.simulate(seed, self.random_rates)?),
            None => None,
        };
        Ok(AnalysisReport {
            dispersal,
            extinction,
            neg_log_likelihood,
            optimization,
            states,
            splits,
            stochastic,
            simulation,
        })
    }

    fn stochastic_report(
        &self,
        engine: &mut PhyloEngine,
        request: &StochasticRequest,
    ) -> Result<StochasticReport> {
        engine.set_stochastic_target(self.range(&request.from)?, self.range(&request.to)?)?;
        let kind = if request.time {
            StochasticKind::Time
        } else {
            StochasticKind::Count
        };
        let root = engine.root();
        let mut branches = Vec::new();
        for node in (0..engine.n_nodes()).filter(|&n| n != root) {
            branches.push((node, engine.expected_stochastic_total(node, kind)?));
        }
        let total: f64 = branches.iter().map(|(_, v)| v).sum();
        Ok(StochasticReport {
            from: request.from.clone(),
            to: request.to.clone(),
            time: request.time,
            branches,
            total,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const DOC: &str = r#"{
        "areas": ["North", "South", "East"],
        "period_boundaries": [2.0, 50.0],
        "max_range_size": 2,
        "dispersal": 0.05,
        "extinction": 0.02,
        "fixed_nodes": [{"mrca": ["A", "B"], "range": "North"}],
        "branch_fossils": [{"mrca": ["C"], "age": 1.0, "area": "East"}],
        "dispersal_mask": [{"period": 1, "from": "North", "to": "East", "value": 0.5}],
        "all_ancestral_states": true,
        "stochastic_maps": [{"from": "North", "to": "North", "time": true}],
        "simulation_seed": 11
    }"#;

    fn tree_and_tips(config: &AnalysisConfig) -> (Tree, Vec<Range>) {
        let tree = Tree::from_newick("((A:1,B:1):2,C:3);", &[]).unwrap();
        let tips = vec![
            config.range("North").unwrap(),
            config.range("North_South").unwrap(),
            config.range("East").unwrap(),
        ];
        (tree, tips)
    }

    #[test]
    fn test_defaults() {
        let config = AnalysisConfig::default();
        assert_eq!(config.dispersal, 0.1);
        assert_eq!(config.extinction, 0.1);
        assert_eq!(config.optimizer.max_iterations, 1000);
        assert!((config.optimizer.precision - 1e-4).abs() < 1e-15);
    }

    #[test]
    fn test_boundaries_become_durations() {
        let config = AnalysisConfig::from_json(DOC).unwrap();
        assert_eq!(config.durations().unwrap(), vec![2.0, 48.0]);
        let model_config = config.range_model_config().unwrap();
        let mask = model_config.dispersal_mask.unwrap();
        assert_eq!(mask[1][0][2], 0.5);
        assert_eq!(mask[0][0][2], 1.0);
    }

    #[rstest]
    #[case(r#"{"areas": []}"#)]
    #[case(r#"{"areas": ["A", "A"]}"#)]
    #[case(r#"{"areas": ["A_B"]}"#)]
    #[case(r#"{"areas": ["A", "B"], "max_range_size": 3}"#)]
    #[case(r#"{"areas": ["A", "B"], "dispersal": -1.0}"#)]
    #[case(r#"{"areas": ["A", "B"], "period_boundaries": [5.0, 3.0]}"#)]
    #[case(r#"{"areas": ["A", "B"], "period_durations": [1.0], "adjacency": [[[1, 1]]]}"#)]
    #[case(r#"{"areas": ["A", "B"], "exclude_ranges": ["A_C"]}"#)]
    fn test_invalid_documents(#[case] doc: &str) {
        assert!(AnalysisConfig::from_json(doc).is_err());
    }

    #[rstest]
    #[case(r#"{"areas": ["A", "B"], "fixed_nodes": [{"mrca": ["A"], "range": ""}]}"#, "fixed_nodes")]
    #[case(r#"{"areas": ["A", "B"], "excluded_node_ranges": [{"mrca": ["A"], "range": "_"}]}"#, "excluded_node_ranges")]
    #[case(r#"{"areas": ["A", "B"], "exclude_ranges": [""]}"#, "exclude_ranges")]
    #[case(r#"{"areas": ["A", "B"], "include_ranges": ["A", ""]}"#, "include_ranges")]
    fn test_empty_range_names_entry(#[case] doc: &str, #[case] entry: &str) {
        match AnalysisConfig::from_json(doc) {
            Err(BioGeoError::Config(msg)) => assert!(msg.starts_with(entry), "{}", msg),
            other => panic!("expected a config error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_malformed_json_is_json_error() {
        let err = AnalysisConfig::from_json("{ not json").unwrap_err();
        assert!(matches!(err, BioGeoError::Json(_)));
    }

    #[test]
    fn test_full_run() {
        let config = AnalysisConfig::from_json(DOC).unwrap();
        let (tree, tips) = tree_and_tips(&config);
        let mut engine = config.build_engine(tree, &tips).unwrap();
        let report = config.run(&mut engine).unwrap();
        assert!(report.neg_log_likelihood.is_finite());
        assert_eq!(report.states.len(), 2);
        let ab = engine.mrca(&["A", "B"]).unwrap();
        let fixed = report.states.iter().find(|s| s.node == ab).unwrap();
        assert_eq!(fixed.best.label, "North");
        assert_eq!(fixed.credible.len(), 1);
        assert_eq!(report.stochastic.len(), 1);
        assert!(report.stochastic[0].total > 0.0);
        let sim = report.simulation.unwrap();
        assert_eq!(sim.seed, 11);
        assert_eq!(sim.node_ranges.len(), engine.n_nodes());
    }

    #[test]
    fn test_round_trip_json() {
        let config = AnalysisConfig::from_json(DOC).unwrap();
        let again = AnalysisConfig::from_json(&config.to_json().unwrap()).unwrap();
        assert_eq!(again.areas, config.areas);
        assert_eq!(again.branch_fossils.len(), 1);
    }
}
