//! Python entry points.
//!
//! Every function takes a Newick string, the taxon order, a `(n_taxa, n_areas)`
//! 0/1 presence matrix in that order and a JSON analysis document.

use ndarray::Array2;
use numpy::{PyArray2, PyReadonlyArray2};
use pyo3::exceptions::PyValueError;
use pyo3::prelude::*;
use pyo3::types::PyDict;
use pyo3::wrap_pyfunction;

use crate::config::AnalysisConfig;
use crate::engine::PhyloEngine;
use crate::error::BioGeoError;
use crate::optimize::optimize_rates;
use crate::range_model::Range;
use crate::tree::Tree;

impl From<BioGeoError> for PyErr {
    fn from(err: BioGeoError) -> PyErr {
        PyValueError::new_err(err.to_string())
    }
}

fn build(
    newick: &str,
    taxa: &[String],
    presence: &PyReadonlyArray2<u8>,
    config_json: &str,
) -> Result<(AnalysisConfig, PhyloEngine), BioGeoError> {
    let config = AnalysisConfig::from_json(config_json)?;
    let tree = Tree::from_newick(newick, taxa)?;
    let presence = presence.as_array();
    if presence.nrows() != tree.n_tips || presence.ncols() != config.areas.len() {
        return Err(BioGeoError::invalid(format!(
            "presence matrix is {}x{}, expected {}x{}",
            presence.nrows(),
            presence.ncols(),
            tree.n_tips,
            config.areas.len()
        )));
    }
    let tips: Vec<Range> = presence
        .rows()
        .into_iter()
        .map(|row| Range::from_presence(&row.to_vec()))
        .collect();
    let engine = config.build_engine(tree, &tips)?;
    Ok((config, engine))
}

/// Negative log-likelihood of the tip ranges at the configured rates.
///
/// # Arguments
/// * `newick` - Rooted binary tree with branch lengths
/// * `taxa` - Tip names, in presence-matrix row order
/// * `presence` - (n_taxa, n_areas) 0/1 matrix of observed ranges
/// * `config_json` - Analysis document
#[pyfunction]
fn dec_log_likelihood(
    newick: &str,
    taxa: Vec<String>,
    presence: PyReadonlyArray2<u8>,
    config_json: &str,
) -> PyResult<f64> {
    let (_, mut engine) = build(newick, &taxa, &presence, config_json)?;
    Ok(engine.neg_log_likelihood()?)
}

/// Ancestral range probabilities at every internal node.
///
/// # Returns
/// * Dict with `nodes` (node indices), `tips_below` (names under each node),
///   `labels` (range labels) and `probabilities` (n_nodes × n_ranges)
#[pyfunction]
fn dec_ancestral_states<'py>(
    py: Python<'py>,
    newick: &str,
    taxa: Vec<String>,
    presence: PyReadonlyArray2<u8>,
    config_json: &str,
) -> PyResult<&'py PyDict> {
    let (_, mut engine) = build(newick, &taxa, &presence, config_json)?;
    engine.prepare_reverse_pass()?;
    let nodes = engine.internal_nodes();
    let n_ranges = engine.model().n_ranges();
    let mut probabilities = Array2::<f64>::zeros((nodes.len(), n_ranges));
    for (row, &node) in nodes.iter().enumerate() {
        for (g, p) in engine.ancestral_probabilities(node)?.into_iter().enumerate() {
            probabilities[[row, g]] = p;
        }
    }
    let labels: Vec<String> = engine
        .model()
        .ranges()
        .iter()
        .map(|&r| engine.model().format_range(r))
        .collect();
    let tips_below: Vec<Vec<String>> = nodes
        .iter()
        .map(|&n| engine.tree().tip_names_below(n))
        .collect();

    let dict = PyDict::new(py);
    dict.set_item("nodes", nodes)?;
    dict.set_item("tips_below", tips_below)?;
    dict.set_item("labels", labels)?;
    dict.set_item("probabilities", PyArray2::from_owned_array(py, probabilities))?;
    Ok(dict)
}

/// Forward simulation of node ranges.
#[pyfunction]
#[pyo3(signature = (newick, taxa, presence, config_json, seed, random_rates=false))]
fn dec_simulate<'py>(
    py: Python<'py>,
    newick: &str,
    taxa: Vec<String>,
    presence: PyReadonlyArray2<u8>,
    config_json: &str,
    seed: u64,
    random_rates: bool,
) -> PyResult<&'py PyDict> {
    let (_, mut engine) = build(newick, &taxa, &presence, config_json)?;
    let outcome = engine.simulate(seed, random_rates)?;
    let ranges: Vec<String> = outcome
        .node_ranges
        .iter()
        .map(|&g| engine.model().format_range(engine.model().range(g)))
        .collect();

    let dict = PyDict::new(py);
    dict.set_item("seed", outcome.seed)?;
    dict.set_item("dispersal", outcome.dispersal)?;
    dict.set_item("extinction", outcome.extinction)?;
    dict.set_item("node_ranges", ranges)?;
    dict.set_item("labels", engine.tree().labels.clone())?;
    Ok(dict)
}

/// Maximum-likelihood dispersal and extinction rates.
///
/// # Returns
/// * Tuple of (dispersal, extinction, negative log-likelihood)
#[pyfunction]
fn dec_optimize(
    newick: &str,
    taxa: Vec<String>,
    presence: PyReadonlyArray2<u8>,
    config_json: &str,
) -> PyResult<(f64, f64, f64)> {
    let (config, mut engine) = build(newick, &taxa, &presence, config_json)?;
    let result = optimize_rates(&mut engine, &config.optimizer)?;
    Ok((result.dispersal, result.extinction, result.neg_log_likelihood))
}

/// Run every analysis the document requests and return the report as JSON.
#[pyfunction]
fn dec_analyze(
    newick: &str,
    taxa: Vec<String>,
    presence: PyReadonlyArray2<u8>,
    config_json: &str,
) -> PyResult<String> {
    let (config, mut engine) = build(newick, &taxa, &presence, config_json)?;
    let report = config.run(&mut engine)?;
    serde_json::to_string(&report).map_err(|e| BioGeoError::from(e).into())
}

/// Python module definition
#[pymodule]
fn biogeo_rust(_py: Python, m: &PyModule) -> PyResult<()> {
    m.add_function(wrap_pyfunction!(dec_log_likelihood, m)?)?;
    m.add_function(wrap_pyfunction!(dec_ancestral_states, m)?)?;
    m.add_function(wrap_pyfunction!(dec_simulate, m)?)?;
    m.add_function(wrap_pyfunction!(dec_optimize, m)?)?;
    m.add_function(wrap_pyfunction!(dec_analyze, m)?)?;
    Ok(())
}
