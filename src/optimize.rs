//! Nelder–Mead search over dispersal and extinction rates.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::engine::PhyloEngine;
use crate::error::Result;

const REFLECT: f64 = 1.0;
const EXPAND: f64 = 2.0;
const CONTRACT: f64 = 0.5;
const SHRINK: f64 = 0.5;
const MIN_STEP: f64 = 1e-3;

/// Stopping rules for the rate search.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    pub max_iterations: usize,
    /// Largest vertex distance from the best vertex at which the search stops.
    pub precision: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            max_iterations: 1000,
            precision: 1e-4,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct OptimizationResult {
    pub dispersal: f64,
    pub extinction: f64,
    pub neg_log_likelihood: f64,
    pub iterations: usize,
    pub converged: bool,
}

/// Minimum found by [`nelder_mead`].
#[derive(Clone, Copy, Debug)]
pub struct SimplexMinimum {
    pub point: [f64; 2],
    pub value: f64,
    pub iterations: usize,
    pub converged: bool,
}

/// Minimise a function of two variables with the Nelder–Mead simplex.
///
/// # Arguments
/// * `objective` - Function to minimise; may return `f64::INFINITY` for invalid points
/// * `start` - Starting point; the initial simplex steps 10% along each axis
/// * `config` - Iteration cap and simplex-size tolerance
pub fn nelder_mead<F>(mut objective: F, start: [f64; 2], config: &OptimizerConfig) -> Result<SimplexMinimum>
where
    F: FnMut(&[f64; 2]) -> Result<f64>,
{
    let mut simplex: Vec<([f64; 2], f64)> = Vec::with_capacity(3);
    simplex.push((start, objective(&start)?));
    for axis in 0..2 {
        let mut p = start;
        p[axis] += (0.1 * start[axis].abs()).max(MIN_STEP);
        let v = objective(&p)?;
        simplex.push((p, v));
    }

    let mut iterations = 0;
    let mut converged = false;
    while iterations < config.max_iterations {
        simplex.sort_by(|a, b| a.1.total_cmp(&b.1));
        if simplex_size(&simplex) <= config.precision {
            converged = true;
            break;
        }
        iterations += 1;

        let (best, second, worst) = (simplex[0], simplex[1], simplex[2]);
        let centroid = [
            (best.0[0] + second.0[0]) / 2.0,
            (best.0[1] + second.0[1]) / 2.0,
        ];
        let toward = |coef: f64| -> [f64; 2] {
            [
                centroid[0] + coef * (worst.0[0] - centroid[0]),
                centroid[1] + coef * (worst.0[1] - centroid[1]),
            ]
        };

        let reflected = toward(-REFLECT);
        let fr = objective(&reflected)?;
        if fr < best.1 {
            let expanded = toward(-EXPAND);
            let fe = objective(&expanded)?;
            simplex[2] = if fe < fr { (expanded, fe) } else { (reflected, fr) };
            continue;
        }
        if fr < second.1 {
            simplex[2] = (reflected, fr);
            continue;
        }
        let contracted = if fr < worst.1 {
            toward(-CONTRACT)
        } else {
            toward(CONTRACT)
        };
        let fc = objective(&contracted)?;
        if fc < worst.1.min(fr) {
            simplex[2] = (contracted, fc);
            continue;
        }
        for vertex in simplex.iter_mut().skip(1) {
            let p = [
                best.0[0] + SHRINK * (vertex.0[0] - best.0[0]),
                best.0[1] + SHRINK * (vertex.0[1] - best.0[1]),
            ];
            *vertex = (p, objective(&p)?);
        }
    }
    simplex.sort_by(|a, b| a.1.total_cmp(&b.1));
    Ok(SimplexMinimum {
        point: simplex[0].0,
        value: simplex[0].1,
        iterations,
        converged,
    })
}

fn simplex_size(simplex: &[([f64; 2], f64)]) -> f64 {
    let best = simplex[0].0;
    simplex
        .iter()
        .skip(1)
        .map(|(p, _)| (p[0] - best[0]).abs().max((p[1] - best[1]).abs()))
        .fold(0.0, f64::max)
}

/// Fit dispersal and extinction by maximum likelihood, starting from the
/// engine's current rates. The engine is left at the optimum, evaluated.
pub fn optimize_rates(engine: &mut PhyloEngine, config: &OptimizerConfig) -> Result<OptimizationResult> {
    let start = [engine.model().dispersal(), engine.model().extinction()];
    info!(
        dispersal = start[0],
        extinction = start[1],
        max_iterations = config.max_iterations,
        "optimizing rates"
    );
    let found = nelder_mead(
        |p| {
            if !(p[0] > 0.0 && p[1] > 0.0 && p[0].is_finite() && p[1].is_finite()) {
                return Ok(f64::INFINITY);
            }
            engine.set_rates(p[0], p[1])?;
            let nll = engine.neg_log_likelihood()?;
            debug!(dispersal = p[0], extinction = p[1], nll, "rate proposal");
            Ok(if nll.is_nan() { f64::INFINITY } else { nll })
        },
        start,
        config,
    )?;

    let [dispersal, extinction] = found.point;
    if dispersal > 0.0 && extinction > 0.0 {
        engine.set_rates(dispersal, extinction)?;
    } else {
        engine.set_rates(start[0], start[1])?;
    }
    let neg_log_likelihood = engine.neg_log_likelihood()?;
    info!(
        dispersal = engine.model().dispersal(),
        extinction = engine.model().extinction(),
        neg_log_likelihood,
        iterations = found.iterations,
        converged = found.converged,
        "optimization finished"
    );
    Ok(OptimizationResult {
        dispersal: engine.model().dispersal(),
        extinction: engine.model().extinction(),
        neg_log_likelihood,
        iterations: found.iterations,
        converged: found.converged,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::range_model::{Range, RangeModelConfig};
    use crate::tree::Tree;

    #[test]
    fn test_quadratic_minimum() {
        let config = OptimizerConfig {
            max_iterations: 500,
            precision: 1e-8,
        };
        let found = nelder_mead(
            |p| Ok((p[0] - 1.0).powi(2) + 3.0 * (p[1] + 2.0).powi(2)),
            [4.0, 4.0],
            &config,
        )
        .unwrap();
        assert!(found.converged);
        assert!((found.point[0] - 1.0).abs() < 1e-4);
        assert!((found.point[1] + 2.0).abs() < 1e-4);
        assert!(found.value < 1e-7);
    }

    #[test]
    fn test_iteration_cap() {
        let config = OptimizerConfig {
            max_iterations: 3,
            precision: 0.0,
        };
        let found = nelder_mead(|p| Ok(p[0] * p[0] + p[1] * p[1]), [1.0, 1.0], &config).unwrap();
        assert_eq!(found.iterations, 3);
        assert!(!found.converged);
    }

    #[test]
    fn test_infinite_region_is_avoided() {
        let config = OptimizerConfig::default();
        let found = nelder_mead(
            |p| {
                if p[0] <= 0.0 {
                    Ok(f64::INFINITY)
                } else {
                    Ok((p[0] - 0.01).powi(2) + p[1].powi(2))
                }
            },
            [0.5, 0.5],
            &config,
        )
        .unwrap();
        assert!(found.point[0] > 0.0);
        assert!(found.value.is_finite());
    }

    #[test]
    fn test_optimize_rates_improves_fit() {
        let tree = Tree::from_newick("((A:1,B:1):1,(C:1.5,D:1.5):0.5);", &[]).unwrap();
        let names = vec!["X".to_string(), "Y".to_string()];
        let config = RangeModelConfig::new(names, vec![10.0], 2);
        let tips = [
            Range::from_areas(&[0]),
            Range::from_areas(&[0, 1]),
            Range::from_areas(&[1]),
            Range::from_areas(&[1]),
        ];
        let mut engine = PhyloEngine::build(tree, config, &tips).unwrap();
        engine.set_rates(0.5, 0.5).unwrap();
        let before = engine.neg_log_likelihood().unwrap();
        let result = optimize_rates(&mut engine, &OptimizerConfig::default()).unwrap();
        assert!(result.neg_log_likelihood <= before);
        assert!(result.dispersal > 0.0 && result.extinction > 0.0);
        assert_eq!(engine.model().dispersal(), result.dispersal);
        assert_eq!(engine.likelihood().map(|l| -l.ln()), Some(result.neg_log_likelihood));
    }
}
