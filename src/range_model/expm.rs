//! Matrix exponentials for rate matrices.
//!
//! Dense: scaling and squaring with a degree-6 Padé approximant, the
//! denominator solved through nalgebra's LU decomposition.
//! Sparse: the action `exp(tQ)·v` on one basis vector at a time through an
//! Arnoldi (Krylov subspace) projection, columns computed in parallel.
//!
//! Both paths renormalise every row of the resulting transition matrix to sum
//! to one.

use nalgebra::DMatrix;
use ndarray::{s, Array2};
use rayon::prelude::*;

use crate::error::{BioGeoError, Result};

const PADE_DEGREE: usize = 6;
const KRYLOV_DIM: usize = 30;
/// Upper bound on `tau·‖Q‖∞` for one Krylov time step.
const KRYLOV_STEP_NORM: f64 = 2.0;

/// Compressed sparse row matrix.
#[derive(Clone, Debug, PartialEq)]
pub struct CsrMatrix {
    n: usize,
    row_ptr: Vec<usize>,
    col_idx: Vec<usize>,
    values: Vec<f64>,
}

impl CsrMatrix {
    /// Build an `n × n` matrix from per-row `(column, value)` lists.
    pub fn from_rows(rows: Vec<Vec<(usize, f64)>>) -> Self {
        let n = rows.len();
        let mut row_ptr = Vec::with_capacity(n + 1);
        let mut col_idx = Vec::new();
        let mut values = Vec::new();
        row_ptr.push(0);
        for mut row in rows {
            row.sort_by_key(|&(c, _)| c);
            for (c, v) in row {
                col_idx.push(c);
                values.push(v);
            }
            row_ptr.push(col_idx.len());
        }
        Self {
            n,
            row_ptr,
            col_idx,
            values,
        }
    }

    pub fn dim(&self) -> usize {
        self.n
    }

    pub fn nnz(&self) -> usize {
        self.values.len()
    }

    /// Non-zero `(column, value)` pairs of one row.
    pub fn row(&self, i: usize) -> impl Iterator<Item = (usize, f64)> + '_ {
        let span = self.row_ptr[i]..self.row_ptr[i + 1];
        self.col_idx[span.clone()]
            .iter()
            .copied()
            .zip(self.values[span].iter().copied())
    }

    pub fn get(&self, i: usize, j: usize) -> f64 {
        self.row(i).find(|&(c, _)| c == j).map_or(0.0, |(_, v)| v)
    }

    pub fn to_dense(&self) -> Array2<f64> {
        let mut dense = Array2::zeros((self.n, self.n));
        for i in 0..self.n {
            for (j, v) in self.row(i) {
                dense[[i, j]] = v;
            }
        }
        dense
    }

    pub fn mul_vec(&self, x: &[f64]) -> Vec<f64> {
        (0..self.n)
            .map(|i| self.row(i).map(|(j, v)| v * x[j]).sum())
            .collect()
    }

    /// Maximum absolute row sum.
    pub fn inf_norm(&self) -> f64 {
        (0..self.n)
            .map(|i| self.row(i).map(|(_, v)| v.abs()).sum::<f64>())
            .fold(0.0, f64::max)
    }
}

fn to_nalgebra(a: &Array2<f64>) -> DMatrix<f64> {
    DMatrix::from_fn(a.nrows(), a.ncols(), |i, j| a[[i, j]])
}

fn from_nalgebra(m: &DMatrix<f64>) -> Array2<f64> {
    Array2::from_shape_fn((m.nrows(), m.ncols()), |(i, j)| m[(i, j)])
}

/// Solve `D·X = N` for the Padé quotient.
fn pade_quotient(denom: &Array2<f64>, numer: &Array2<f64>) -> Result<Array2<f64>> {
    let lu = to_nalgebra(denom).lu();
    let x = lu
        .solve(&to_nalgebra(numer))
        .ok_or_else(|| BioGeoError::Numerical("singular Padé denominator".to_string()))?;
    if x.iter().any(|v| !v.is_finite()) {
        return Err(BioGeoError::Numerical(
            "non-finite Padé quotient".to_string(),
        ));
    }
    Ok(from_nalgebra(&x))
}

/// `exp(A)` for a dense square matrix.
pub fn expm(a: &Array2<f64>) -> Result<Array2<f64>> {
    let n = a.nrows();
    if n == 0 {
        return Ok(Array2::zeros((0, 0)));
    }
    if a.iter().any(|v| !v.is_finite()) {
        return Err(BioGeoError::Numerical(
            "non-finite entry in matrix exponential input".to_string(),
        ));
    }
    let norm = a
        .rows()
        .into_iter()
        .map(|row| row.iter().map(|v| v.abs()).sum::<f64>())
        .fold(0.0, f64::max);
    let squarings = if norm > 0.5 {
        (norm / 0.5).log2().ceil() as i32
    } else {
        0
    };
    let x = a / 2f64.powi(squarings);

    // c_k = c_{k-1} (p + 1 - k) / (k (2p + 1 - k))
    let p = PADE_DEGREE as f64;
    let mut numer = Array2::<f64>::eye(n);
    let mut denom = Array2::<f64>::eye(n);
    let mut power = Array2::<f64>::eye(n);
    let mut c = 1.0;
    for k in 1..=PADE_DEGREE {
        let kf = k as f64;
        c *= (p + 1.0 - kf) / (kf * (2.0 * p + 1.0 - kf));
        power = power.dot(&x);
        numer.scaled_add(c, &power);
        let signed = if k % 2 == 0 { c } else { -c };
        denom.scaled_add(signed, &power);
    }

    let mut result = pade_quotient(&denom, &numer)?;
    for _ in 0..squarings {
        result = result.dot(&result);
    }
    Ok(result)
}

/// Scale each row to sum to one. Rows summing to zero are left untouched.
pub fn renormalize_rows(p: &mut Array2<f64>) {
    for mut row in p.rows_mut() {
        let total: f64 = row.sum();
        if total > 0.0 && total.is_finite() {
            row.mapv_inplace(|v| v / total);
        }
    }
}

/// Dense transition matrix `P = exp(Q·t)` with row renormalisation.
pub fn transition_dense(q: &CsrMatrix, t: f64) -> Result<Array2<f64>> {
    let mut p = expm(&(q.to_dense() * t))?;
    renormalize_rows(&mut p);
    Ok(p)
}

/// Transition matrix assembled column by column from Krylov actions.
pub fn transition_sparse(q: &CsrMatrix, t: f64) -> Result<Array2<f64>> {
    let n = q.dim();
    let columns: Vec<Vec<f64>> = (0..n)
        .into_par_iter()
        .map(|j| {
            let mut unit = vec![0.0; n];
            unit[j] = 1.0;
            expm_action(q, t, &unit)
        })
        .collect::<Result<Vec<_>>>()?;
    let mut p = Array2::zeros((n, n));
    for (j, column) in columns.iter().enumerate() {
        for (i, &v) in column.iter().enumerate() {
            p[[i, j]] = v;
        }
    }
    renormalize_rows(&mut p);
    Ok(p)
}

/// Source of transition matrices `P = exp(Q·t)` for one period's generator.
pub trait MatrixExponential: Send + Sync {
    fn transition(&self, q: &CsrMatrix, t: f64) -> Result<Array2<f64>>;
}

/// Dense Padé path.
#[derive(Clone, Copy, Debug, Default)]
pub struct PadeExponential;

impl MatrixExponential for PadeExponential {
    fn transition(&self, q: &CsrMatrix, t: f64) -> Result<Array2<f64>> {
        transition_dense(q, t)
    }
}

/// Column-by-column Krylov path for large state spaces.
#[derive(Clone, Copy, Debug, Default)]
pub struct KrylovExponential;

impl MatrixExponential for KrylovExponential {
    fn transition(&self, q: &CsrMatrix, t: f64) -> Result<Array2<f64>> {
        transition_sparse(q, t)
    }
}

/// `exp(Q·t)·v` without forming the dense exponential.
pub fn expm_action(q: &CsrMatrix, t: f64, v: &[f64]) -> Result<Vec<f64>> {
    let anorm = q.inf_norm();
    if t == 0.0 || anorm == 0.0 {
        return Ok(v.to_vec());
    }
    let steps = ((t.abs() * anorm) / KRYLOV_STEP_NORM).ceil().max(1.0) as usize;
    let tau = t / steps as f64;
    let mut w = v.to_vec();
    for _ in 0..steps {
        w = krylov_step(q, tau, &w, anorm)?;
    }
    Ok(w)
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn krylov_step(q: &CsrMatrix, tau: f64, w: &[f64], anorm: f64) -> Result<Vec<f64>> {
    let n = w.len();
    let beta = dot(w, w).sqrt();
    if beta == 0.0 {
        return Ok(w.to_vec());
    }
    let max_dim = KRYLOV_DIM.min(n);
    let mut basis: Vec<Vec<f64>> = vec![w.iter().map(|x| x / beta).collect()];
    let mut h = Array2::<f64>::zeros((max_dim + 1, max_dim));
    let mut dim = max_dim;
    let breakdown = 1e-12 * anorm.max(1.0);

    for j in 0..max_dim {
        let mut next = q.mul_vec(&basis[j]);
        // modified Gram-Schmidt
        for (i, vi) in basis.iter().enumerate() {
            let hij = dot(vi, &next);
            h[[i, j]] = hij;
            for (x, y) in next.iter_mut().zip(vi) {
                *x -= hij * y;
            }
        }
        let s = dot(&next, &next).sqrt();
        if s <= breakdown {
            dim = j + 1;
            break;
        }
        h[[j + 1, j]] = s;
        if j + 1 < max_dim {
            basis.push(next.into_iter().map(|x| x / s).collect());
        }
    }

    let small = h.slice(s![0..dim, 0..dim]).to_owned() * tau;
    let e = expm(&small)?;
    let mut out = vec![0.0; n];
    for (i, vi) in basis.iter().take(dim).enumerate() {
        let coeff = beta * e[[i, 0]];
        for (o, x) in out.iter_mut().zip(vi) {
            *o += coeff * x;
        }
    }
    Ok(out)
}
