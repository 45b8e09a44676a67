//! Range model: the admissible range state space, its cladogenetic splits,
//! per-period rate matrices and cached transition probabilities.
//!
//! The state space and split tables are built once. Rate setters
//! (`set_dispersal`, `set_extinction`, `set_rates`, mask edits) install a new
//! [`RateMatrices`] snapshot and invalidate the transition cache.

pub mod combinatorics;
pub mod expm;
pub mod rate_matrix;
pub mod splits;
pub mod state_space;
pub mod transition_cache;

use std::sync::Arc;

use ndarray::{Array1, Array2};
use rayon::prelude::*;
use tracing::{debug, info};

use crate::error::{BioGeoError, Result};
pub use expm::{CsrMatrix, KrylovExponential, MatrixExponential, PadeExponential};
pub use rate_matrix::RateMatrices;
pub use splits::{Split, SplitSet};
pub use state_space::{adjacency_compliant, PeriodSpace, Range, StateSpace, MAX_AREAS};
pub use transition_cache::{CacheStats, TransitionCache, TransitionKey};

use state_space::StateSpaceSpec;
use transition_cache::transition_key;

/// Period length used when no periods are given.
pub const DEFAULT_PERIOD_DURATION: f64 = 10000.0;

/// Builder input for [`RangeModel`].
#[derive(Clone, Debug)]
pub struct RangeModelConfig {
    /// Ordered area names; the position is the area index.
    pub area_names: Vec<String>,
    /// Period lengths, youngest first.
    pub period_durations: Vec<f64>,
    /// Largest range size in the enumerated state space.
    pub max_range_size: usize,
    /// Per-period area adjacency; `None` means fully connected.
    pub adjacency: Option<Vec<Vec<Vec<bool>>>>,
    /// Restrict the state space to these ranges (plus the empty range).
    pub include_ranges: Option<Vec<Range>>,
    /// Remove these ranges from the state space.
    pub exclude_ranges: Vec<Range>,
    /// Per-period dispersal multipliers `[period][from][to]`; `None` means all ones.
    pub dispersal_mask: Option<Vec<Vec<Vec<f64>>>>,
    /// Compute transition matrices column by column with Krylov actions.
    pub sparse: bool,
    /// Worker threads for transition matrix computation; `None` uses the global pool.
    pub threads: Option<usize>,
    pub dispersal: f64,
    pub extinction: f64,
}

impl Default for RangeModelConfig {
    fn default() -> Self {
        Self {
            area_names: Vec::new(),
            period_durations: vec![DEFAULT_PERIOD_DURATION],
            max_range_size: 1,
            adjacency: None,
            include_ranges: None,
            exclude_ranges: Vec::new(),
            dispersal_mask: None,
            sparse: false,
            threads: None,
            dispersal: 0.1,
            extinction: 0.1,
        }
    }
}

impl RangeModelConfig {
    /// Fully connected model with every range up to `max_range_size`.
    pub fn new(area_names: Vec<String>, period_durations: Vec<f64>, max_range_size: usize) -> Self {
        Self {
            area_names,
            period_durations,
            max_range_size,
            ..Self::default()
        }
    }
}

/// State space, splits and rates of a DEC analysis.
#[derive(Clone, Debug)]
pub struct RangeModel {
    area_names: Vec<String>,
    period_durations: Vec<f64>,
    space: StateSpace,
    splits: Vec<Vec<SplitSet>>,
    adjacency: Vec<Vec<Vec<bool>>>,
    default_adjacency: bool,
    sparse: bool,
    pool: Option<Arc<rayon::ThreadPool>>,
    mask: Vec<Array2<f64>>,
    rates: Arc<RateMatrices>,
    cache: TransitionCache,
}

impl RangeModel {
    /// Build the state space, split table and initial rate snapshot.
    ///
    /// # Arguments
    /// * `config` - Areas, periods, constraints and initial rates
    /// * `observed` - Ranges observed at the tips; wide or adjacency-violating
    ///   tip ranges are admitted in the first period so the data is representable
    pub fn new(config: RangeModelConfig, observed: &[Range]) -> Result<Self> {
        let n_areas = config.area_names.len();
        if n_areas == 0 {
            return Err(BioGeoError::invalid("at least one area is required"));
        }
        if n_areas > MAX_AREAS {
            return Err(BioGeoError::invalid(format!(
                "{} areas exceed the supported maximum of {}",
                n_areas, MAX_AREAS
            )));
        }
        let period_durations = if config.period_durations.is_empty() {
            vec![DEFAULT_PERIOD_DURATION]
        } else {
            config.period_durations.clone()
        };
        if let Some(bad) = period_durations.iter().find(|d| !(**d > 0.0 && d.is_finite())) {
            return Err(BioGeoError::invalid(format!(
                "period durations must be positive, got {}",
                bad
            )));
        }
        let n_periods = period_durations.len();
        if config.include_ranges.is_none()
            && (config.max_range_size == 0 || config.max_range_size > n_areas)
        {
            return Err(BioGeoError::invalid(format!(
                "max range size {} outside 1..={}",
                config.max_range_size, n_areas
            )));
        }
        for r in observed {
            if r.areas().any(|a| a >= n_areas) {
                return Err(BioGeoError::UnknownRange(format!(
                    "observed range {} uses an area outside 0..{}",
                    r, n_areas
                )));
            }
        }

        let adjacency = match &config.adjacency {
            Some(adj) => {
                check_square_stack(adj.len(), n_periods, n_areas, "adjacency", |p| {
                    (adj[p].len(), adj[p].iter().map(Vec::len).collect())
                })?;
                adj.clone()
            }
            None => vec![vec![vec![true; n_areas]; n_areas]; n_periods],
        };
        let default_adjacency = adjacency
            .iter()
            .all(|m| m.iter().all(|row| row.iter().all(|&v| v)));
        if config.sparse && !default_adjacency {
            return Err(BioGeoError::Unsupported(
                "sparse transition matrices cannot be combined with adjacency constraints"
                    .to_string(),
            ));
        }

        let mask = match &config.dispersal_mask {
            Some(m) => {
                check_square_stack(m.len(), n_periods, n_areas, "dispersal mask", |p| {
                    (m[p].len(), m[p].iter().map(Vec::len).collect())
                })?;
                m.iter()
                    .map(|period| {
                        Array2::from_shape_fn((n_areas, n_areas), |(i, j)| period[i][j])
                    })
                    .collect()
            }
            None => vec![Array2::from_elem((n_areas, n_areas), 1.0); n_periods],
        };

        let space = StateSpace::build(StateSpaceSpec {
            n_areas,
            max_range_size: config.max_range_size,
            adjacency: &adjacency,
            default_adjacency,
            include_ranges: config.include_ranges.as_deref(),
            exclude_ranges: &config.exclude_ranges,
            observed,
        })?;
        let splits = splits::build_split_table(&space);

        let pool = match config.threads {
            Some(n) => Some(Arc::new(
                rayon::ThreadPoolBuilder::new()
                    .num_threads(n)
                    .build()
                    .map_err(|e| BioGeoError::Config(format!("thread pool: {}", e)))?,
            )),
            None => None,
        };

        check_rate("dispersal", config.dispersal)?;
        check_rate("extinction", config.extinction)?;
        let rates = Arc::new(RateMatrices::build(
            &space,
            &splits,
            &mask,
            config.dispersal,
            config.extinction,
            1,
        ));

        info!(
            areas = n_areas,
            periods = n_periods,
            ranges = space.ranges.len(),
            big_tips = space.big_tips.len(),
            sparse = config.sparse,
            "range model built"
        );
        for (p, ps) in space.periods.iter().enumerate() {
            let n_splits: usize = splits.iter().map(|per| per[p].len()).sum();
            debug!(
                period = p,
                admissible = ps.len(),
                splits = n_splits,
                nnz = rates.q[p].nnz(),
                "period summary"
            );
        }

        Ok(Self {
            area_names: config.area_names,
            period_durations,
            space,
            splits,
            adjacency,
            default_adjacency,
            sparse: config.sparse,
            pool,
            mask,
            rates,
            cache: TransitionCache::new(1),
        })
    }

    pub fn area_names(&self) -> &[String] {
        &self.area_names
    }

    pub fn n_areas(&self) -> usize {
        self.area_names.len()
    }

    pub fn n_periods(&self) -> usize {
        self.period_durations.len()
    }

    pub fn period_durations(&self) -> &[f64] {
        &self.period_durations
    }

    pub fn max_range_size(&self) -> usize {
        self.space.max_range_size
    }

    pub fn is_sparse(&self) -> bool {
        self.sparse
    }

    pub fn has_default_adjacency(&self) -> bool {
        self.default_adjacency
    }

    pub fn adjacency(&self, period: usize) -> &[Vec<bool>] {
        &self.adjacency[period]
    }

    pub fn state_space(&self) -> &StateSpace {
        &self.space
    }

    /// Number of ranges in the global index, including the empty range.
    pub fn n_ranges(&self) -> usize {
        self.space.ranges.len()
    }

    pub fn ranges(&self) -> &[Range] {
        &self.space.ranges
    }

    pub fn range(&self, index: usize) -> Range {
        self.space.ranges[index]
    }

    pub fn index_of(&self, range: Range) -> Option<usize> {
        self.space.index.get(&range).copied()
    }

    /// Global index of `range`, or an error if it is not in the state space.
    pub fn require_index(&self, range: Range) -> Result<usize> {
        self.index_of(range)
            .ok_or_else(|| BioGeoError::UnknownRange(self.format_range(range)))
    }

    pub fn period_space(&self, period: usize) -> &PeriodSpace {
        &self.space.periods[period]
    }

    pub fn is_included(&self, index: usize, period: usize) -> bool {
        self.space.periods[period].contains(index)
    }

    /// Cladogenetic splits of the range at `index` in `period`.
    pub fn splits(&self, index: usize, period: usize) -> &SplitSet {
        &self.splits[index][period]
    }

    pub fn area_index(&self, name: &str) -> Result<usize> {
        self.area_names
            .iter()
            .position(|a| a == name)
            .ok_or_else(|| BioGeoError::UnknownArea(name.to_string()))
    }

    /// Area names joined by `_`; the empty range prints as `_`.
    pub fn format_range(&self, range: Range) -> String {
        if range.is_empty() {
            return "_".to_string();
        }
        range
            .areas()
            .map(|a| {
                self.area_names
                    .get(a)
                    .cloned()
                    .unwrap_or_else(|| a.to_string())
            })
            .collect::<Vec<_>>()
            .join("_")
    }

    /// Parse a range from area names separated by `_`, `,` or whitespace.
    pub fn parse_range(&self, text: &str) -> Result<Range> {
        let mut areas = Vec::new();
        for name in text
            .split(|c: char| c == '_' || c == ',' || c.is_whitespace())
            .filter(|s| !s.is_empty())
        {
            areas.push(self.area_index(name)?);
        }
        Ok(Range::from_areas(&areas))
    }

    pub fn dispersal(&self) -> f64 {
        self.rates.dispersal
    }

    pub fn extinction(&self) -> f64 {
        self.rates.extinction
    }

    /// Current rate snapshot.
    pub fn rates(&self) -> Arc<RateMatrices> {
        Arc::clone(&self.rates)
    }

    pub fn dispersal_matrix(&self, period: usize) -> &Array2<f64> {
        &self.rates.d[period]
    }

    pub fn extinction_vector(&self, period: usize) -> &Array1<f64> {
        &self.rates.e[period]
    }

    /// Dense generator of `period` over its admissible ranges (local indices).
    pub fn rate_matrix(&self, period: usize) -> Array2<f64> {
        self.rates.q[period].to_dense()
    }

    pub fn set_dispersal(&mut self, dispersal: f64) -> Result<()> {
        let extinction = self.rates.extinction;
        self.set_rates(dispersal, extinction)
    }

    pub fn set_extinction(&mut self, extinction: f64) -> Result<()> {
        let dispersal = self.rates.dispersal;
        self.set_rates(dispersal, extinction)
    }

    /// Install new dispersal and extinction rates.
    pub fn set_rates(&mut self, dispersal: f64, extinction: f64) -> Result<()> {
        check_rate("dispersal", dispersal)?;
        check_rate("extinction", extinction)?;
        self.rebuild(dispersal, extinction);
        Ok(())
    }

    /// Set one dispersal multiplier and rebuild the rates.
    pub fn set_dispersal_mask_cell(
        &mut self,
        period: usize,
        from: usize,
        to: usize,
        value: f64,
    ) -> Result<()> {
        let n = self.n_areas();
        if period >= self.n_periods() || from >= n || to >= n {
            return Err(BioGeoError::invalid(format!(
                "mask cell ({}, {}, {}) out of bounds",
                period, from, to
            )));
        }
        if !(value >= 0.0 && value.is_finite()) {
            return Err(BioGeoError::invalid(format!(
                "dispersal multiplier must be non-negative, got {}",
                value
            )));
        }
        self.mask[period][[from, to]] = value;
        self.rebuild(self.rates.dispersal, self.rates.extinction);
        Ok(())
    }

    pub fn dispersal_mask(&self, period: usize) -> &Array2<f64> {
        &self.mask[period]
    }

    fn rebuild(&mut self, dispersal: f64, extinction: f64) {
        let generation = self.rates.generation + 1;
        self.rates = Arc::new(RateMatrices::build(
            &self.space,
            &self.splits,
            &self.mask,
            dispersal,
            extinction,
            generation,
        ));
        self.cache.sync_generation(generation);
        debug!(dispersal, extinction, generation, "rates rebuilt");
    }

    /// Uncached `P = exp(Q·t)` for one period over its admissible ranges.
    pub fn transition_matrix(&self, period: usize, duration: f64) -> Result<Array2<f64>> {
        compute_transition(&self.rates, self.sparse, period, duration)
    }

    /// Fill the cache for every `(period, duration)` pair, computing misses in parallel.
    pub fn prepare_transitions(&mut self, wanted: &[(usize, f64)]) -> Result<()> {
        self.cache.sync_generation(self.rates.generation);
        let mut missing: Vec<(TransitionKey, usize, f64)> = Vec::new();
        let mut hits = 0;
        for &(period, duration) in wanted {
            let key = transition_key(period, duration);
            if self.cache.contains(&key) || missing.iter().any(|m| m.0 == key) {
                hits += 1;
            } else {
                missing.push((key, period, duration));
            }
        }
        let rates = Arc::clone(&self.rates);
        let sparse = self.sparse;
        let compute = || {
            missing
                .par_iter()
                .map(|&(key, period, duration)| {
                    compute_transition(&rates, sparse, period, duration).map(|p| (key, p))
                })
                .collect::<Result<Vec<_>>>()
        };
        let computed = match &self.pool {
            Some(pool) => pool.install(compute)?,
            None => compute()?,
        };
        self.cache.record(hits, computed.len());
        for (key, p) in computed {
            self.cache.insert(key, p);
        }
        Ok(())
    }

    /// Cached transition matrix; `None` until [`prepare_transitions`](Self::prepare_transitions)
    /// has covered the key under the current rates.
    pub fn cached_transition(&self, period: usize, duration: f64) -> Option<&Array2<f64>> {
        if self.cache.generation() != self.rates.generation {
            return None;
        }
        self.cache.get(period, duration)
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn clear_cache(&mut self) {
        self.cache.clear();
    }
}

fn compute_transition(
    rates: &RateMatrices,
    sparse: bool,
    period: usize,
    duration: f64,
) -> Result<Array2<f64>> {
    let q = rates.q.get(period).ok_or_else(|| {
        BioGeoError::invalid(format!("period {} out of range", period))
    })?;
    let method: &dyn MatrixExponential = if sparse {
        &KrylovExponential
    } else {
        &PadeExponential
    };
    method.transition(q, duration)
}

fn check_rate(name: &str, value: f64) -> Result<()> {
    if value >= 0.0 && value.is_finite() {
        Ok(())
    } else {
        Err(BioGeoError::invalid(format!(
            "{} rate must be a non-negative finite number, got {}",
            name, value
        )))
    }
}

/// Check a `[period][area][area]` stack shape.
fn check_square_stack(
    len: usize,
    n_periods: usize,
    n_areas: usize,
    what: &str,
    shape: impl Fn(usize) -> (usize, Vec<usize>),
) -> Result<()> {
    if len != n_periods {
        return Err(BioGeoError::invalid(format!(
            "{} has {} periods, expected {}",
            what, len, n_periods
        )));
    }
    for p in 0..len {
        let (rows, cols) = shape(p);
        if rows != n_areas || cols.iter().any(|&c| c != n_areas) {
            return Err(BioGeoError::invalid(format!(
                "{} for period {} must be {}x{}",
                what, p, n_areas, n_areas
            )));
        }
    }
    Ok(())
}
