//! Dispersal–extinction–cladogenesis (DEC) likelihood engine.
//!
//! Geographic ranges evolve along the branches of a dated tree under a
//! continuous-time Markov model (area gain by dispersal, area loss by local
//! extinction) and are inherited by daughter lineages through a fixed set of
//! cladogenetic splits. The crate computes the likelihood of observed tip
//! ranges, ancestral range and split reconstructions, expected stochastic
//! maps, forward simulations and maximum-likelihood rates.
//!
//! The usual entry point is [`AnalysisConfig`]: parse a JSON document, build a
//! [`PhyloEngine`] for a tree and tip ranges, then [`AnalysisConfig::run`].
//! With the `python` feature the same analyses are exposed as a Python module.

pub mod config;
pub mod engine;
pub mod error;
pub mod ext_float;
pub mod optimize;
pub mod range_model;
pub mod tree;

#[cfg(feature = "python")]
mod python;

pub use config::{AnalysisConfig, AnalysisReport};
pub use engine::{
    AncSplit, NodeSplitSummary, NodeStateSummary, PhyloEngine, SimulationOutcome, StochasticKind,
    StochasticTarget,
};
pub use error::{BioGeoError, Result};
pub use ext_float::ExtFloat;
pub use optimize::{nelder_mead, optimize_rates, OptimizationResult, OptimizerConfig};
pub use range_model::{Range, RangeModel, RangeModelConfig};
pub use tree::Tree;
