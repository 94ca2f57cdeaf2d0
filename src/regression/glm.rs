// src/regression/glm.rs
//
// Survey-weighted quasi-Poisson regression. The mean structure is fitted by
// IRLS with the sampling weight folded into each working weight; inference
// uses a linearized (sandwich) covariance built from per-PSU score residual
// totals with the same stratified between-PSU logic as the mean estimator.

use log::debug;
use nalgebra::{DMatrix, DVector};
use ndarray::{Array1, Array2};
use polars::prelude::*;
use rayon::prelude::*;

use crate::design::{SingletonPolicy, SurveyDesign};
use crate::error::{Result, SvyError};
use crate::estimation::taylor::{
    build_stratum_psu_map, degrees_of_freedom, index_categorical,
};
use crate::inference::{critical_t, pvalue_t};
use crate::regression::formula::Formula;

// ============================================================================
// Options
// ============================================================================

#[derive(Debug, Clone)]
pub struct GlmOptions {
    /// IRLS iteration budget before failing with `Convergence`.
    pub max_iterations: usize,
    /// Convergence on the maximum relative coefficient change.
    pub tolerance: f64,
    pub singleton_policy: SingletonPolicy,
}

impl Default for GlmOptions {
    fn default() -> Self {
        Self {
            max_iterations: 25,
            tolerance: 1e-8,
            singleton_policy: SingletonPolicy::default(),
        }
    }
}

// ============================================================================
// Fitted Model
// ============================================================================

/// A fitted survey-weighted quasi-Poisson model (log link). Immutable once
/// constructed; the prediction engine only reads from it.
#[derive(Debug, Clone)]
pub struct FittedModel {
    coefficients: Array1<f64>,
    covariance: Array2<f64>,
    covariance_naive: Array2<f64>,
    dispersion: f64,
    formula: Formula,
    df_resid: f64,
    fitted_values: Array1<f64>,
    linear_predictor: Array1<f64>,
    iterations: usize,
    n: usize,
}

impl FittedModel {
    /// Coefficients, intercept first, then one entry per formula term.
    pub fn coefficients(&self) -> &Array1<f64> {
        &self.coefficients
    }

    /// Design-based (linearized sandwich) covariance of the coefficients.
    /// This is what inference and prediction use.
    pub fn covariance(&self) -> &Array2<f64> {
        &self.covariance
    }

    /// Dispersion-scaled model-based covariance, kept for reference only.
    pub fn covariance_naive(&self) -> &Array2<f64> {
        &self.covariance_naive
    }

    /// Quasi-Poisson dispersion estimated from weighted Pearson residuals.
    pub fn dispersion(&self) -> f64 {
        self.dispersion
    }

    pub fn formula(&self) -> &Formula {
        &self.formula
    }

    /// Design residual degrees of freedom: PSUs minus strata.
    pub fn df_resid(&self) -> f64 {
        self.df_resid
    }

    pub fn fitted_values(&self) -> &Array1<f64> {
        &self.fitted_values
    }

    pub fn linear_predictor(&self) -> &Array1<f64> {
        &self.linear_predictor
    }

    pub fn iterations(&self) -> usize {
        self.iterations
    }

    /// Records the fit is based on, after exclusion of incomplete records.
    pub fn n(&self) -> usize {
        self.n
    }

    /// Coefficient summary table: term, est, se, t, p, lower, upper. Standard
    /// errors come from the design-based covariance; the interval uses
    /// Student's t with the design df.
    pub fn coefficient_table(&self, confidence: f64) -> Result<DataFrame> {
        let names = self.formula.column_names();
        let p = self.coefficients.len();
        let mut ses = Vec::with_capacity(p);
        let mut ts = Vec::with_capacity(p);
        let mut ps = Vec::with_capacity(p);
        let mut lowers = Vec::with_capacity(p);
        let mut uppers = Vec::with_capacity(p);
        let crit = critical_t(confidence, self.df_resid);
        for j in 0..p {
            let est = self.coefficients[j];
            let se = self.covariance[[j, j]].max(0.0).sqrt();
            let t = est / se;
            ses.push(se);
            ts.push(t);
            ps.push(pvalue_t(t, self.df_resid));
            lowers.push(est - crit * se);
            uppers.push(est + crit * se);
        }
        Ok(df![
            "term" => names,
            "est" => self.coefficients.to_vec(),
            "se" => ses,
            "t" => ts,
            "p" => ps,
            "lower" => lowers,
            "upper" => uppers,
        ]?)
    }
}

// ============================================================================
// Fitting
// ============================================================================

/// Fit a quasi-Poisson model with a log link under the survey design.
///
/// Records missing the outcome, any model covariate, the PSU, or the stratum
/// are excluded from this fit only. Working weights at each IRLS step are
/// `sampling_weight x mu` (the Poisson weight under the canonical log link).
pub fn fit_quasipoisson(
    design: &SurveyDesign,
    formula: &Formula,
    outcome: &str,
    options: &GlmOptions,
) -> Result<FittedModel> {
    // Restrict to records usable by this particular fit.
    let field_mask = formula.complete_mask(design.data())?;
    let y_raw = design.numeric(outcome)?;
    let strata_raw = design.string_keys(design.stratum_field())?;
    let psu_raw = design.string_keys(design.psu_field())?;
    let mask: Vec<bool> = (0..design.n_records())
        .map(|i| field_mask[i] && y_raw[i].is_some() && strata_raw[i].is_some() && psu_raw[i].is_some())
        .collect();
    let sub = design.subset(&BooleanChunked::from_slice("mask".into(), &mask))?;

    let x = formula.design_matrix(sub.data())?;
    let y: Array1<f64> = sub
        .numeric(outcome)?
        .into_iter()
        .map(|v| v.unwrap_or(0.0))
        .collect();
    let w = sub.weights()?;
    let n = y.len();
    let p = x.ncols();

    if n < p {
        return Err(SvyError::SingularMatrix(format!(
            "{n} usable records cannot identify {p} parameters"
        )));
    }

    // --- IRLS ---------------------------------------------------------------
    let sum_w: f64 = w.iter().sum();
    let ybar = y
        .iter()
        .zip(w.iter())
        .map(|(yi, wi)| yi * wi)
        .sum::<f64>()
        / sum_w;
    let mut mu: Array1<f64> = y.mapv(|yi| ((yi + ybar) / 2.0).max(1e-3));
    let mut eta: Array1<f64> = mu.mapv(f64::ln);
    let mut coefficients: Array1<f64> = Array1::zeros(p);
    let mut xtwx_inv: Array2<f64> = Array2::zeros((p, p));
    let mut converged = false;
    let mut iteration = 0;

    while iteration < options.max_iterations {
        iteration += 1;

        // Log link, Poisson variance: V(mu) = mu, g'(mu) = 1/mu, so the IRLS
        // weight is mu and the working response is eta + (y - mu)/mu.
        let combined: Vec<f64> = w
            .iter()
            .zip(mu.iter())
            .map(|(wi, mui)| wi * mui.clamp(1e-10, 1e10))
            .collect();
        let z: Array1<f64> = eta
            .iter()
            .zip(y.iter())
            .zip(mu.iter())
            .map(|((&ei, &yi), &mui)| ei + (yi - mui) / mui.max(1e-10))
            .collect();

        let (new_coefficients, inv) = solve_weighted_least_squares(&x, &z, &combined)?;
        let rel_change = max_relative_change(&new_coefficients, &coefficients);
        coefficients = new_coefficients;
        xtwx_inv = inv;

        eta = x.dot(&coefficients);
        // mu computed from eta in log space; the clamp keeps exp finite and
        // mu strictly positive.
        mu = eta.mapv(|e| e.min(500.0).exp().max(1e-10));

        debug!("IRLS iteration {iteration}: max relative coefficient change {rel_change:.3e}");
        if rel_change < options.tolerance {
            converged = true;
            break;
        }
    }

    if !converged {
        return Err(SvyError::Convergence {
            iterations: options.max_iterations,
        });
    }

    // --- Quasi-Poisson dispersion -------------------------------------------
    // Pearson chi-square with weights normalized to sum to n, over n - p.
    // This rescales only the naive covariance; design-based inference below
    // does not use it.
    let pearson: f64 = y
        .iter()
        .zip(mu.iter())
        .zip(w.iter())
        .map(|((&yi, &mui), &wi)| wi * (yi - mui).powi(2) / mui.max(1e-10))
        .sum();
    let dispersion = if n > p {
        pearson * (n as f64 / sum_w) / ((n - p) as f64)
    } else {
        f64::NAN
    };
    let covariance_naive = xtwx_inv.mapv(|v| v * dispersion);

    // --- Design-based sandwich covariance -----------------------------------
    let strata = sub.string_keys(sub.stratum_field())?;
    let psus = sub.string_keys(sub.psu_field())?;
    let (strata_idx, n_strata) = index_categorical(&strata);
    let (psu_idx, n_psus) = index_categorical(&psus);
    let (psu_map, n_psus_per_stratum) =
        build_stratum_psu_map(&strata_idx, n_strata, &psu_idx);

    // Per-PSU totals of the score residuals w_i (y_i - mu_i) x_i.
    let mut psu_scores: Vec<Array1<f64>> = vec![Array1::zeros(p); n_psus as usize];
    for i in 0..n {
        if strata_idx[i] == u32::MAX || psu_idx[i] == u32::MAX {
            continue;
        }
        let r = w[i] * (y[i] - mu[i]);
        let row = x.row(i);
        let total = &mut psu_scores[psu_idx[i] as usize];
        for j in 0..p {
            total[j] += r * row[j];
        }
    }

    let g = score_covariance(
        &psu_scores,
        &psu_map,
        &n_psus_per_stratum,
        options.singleton_policy,
    )?;
    let covariance = xtwx_inv.dot(&g).dot(&xtwx_inv);
    let df_resid = degrees_of_freedom(&n_psus_per_stratum) as f64;

    Ok(FittedModel {
        coefficients,
        covariance,
        covariance_naive,
        dispersion,
        formula: formula.clone(),
        df_resid,
        fitted_values: mu,
        linear_predictor: eta,
        iterations: iteration,
        n,
    })
}

/// Fit one model per formula. Each fit is independent and immutable, so the
/// batch runs in parallel; a failed specification surfaces as its own `Err`
/// without affecting the others.
pub fn fit_many(
    design: &SurveyDesign,
    formulas: &[Formula],
    outcome: &str,
    options: &GlmOptions,
) -> Vec<Result<FittedModel>> {
    formulas
        .par_iter()
        .map(|formula| fit_quasipoisson(design, formula, outcome, options))
        .collect()
}

// ============================================================================
// Helpers
// ============================================================================

/// Stratified between-PSU covariance of score residual totals: the matrix
/// analogue of the estimator's Taylor variance.
fn score_covariance(
    psu_scores: &[Array1<f64>],
    psu_per_stratum: &[Vec<u32>],
    n_psus_per_stratum: &[u32],
    policy: SingletonPolicy,
) -> Result<Array2<f64>> {
    let p = psu_scores.first().map(|v| v.len()).unwrap_or(0);
    let mut g: Array2<f64> = Array2::zeros((p, p));

    let grand_mean: Array1<f64> = if policy == SingletonPolicy::Center {
        let n_total: u32 = n_psus_per_stratum.iter().sum();
        let mut total = Array1::zeros(p);
        for psus in psu_per_stratum {
            for &c in psus {
                total = total + &psu_scores[c as usize];
            }
        }
        total / (n_total.max(1) as f64)
    } else {
        Array1::zeros(p)
    };

    for (h, psus) in psu_per_stratum.iter().enumerate() {
        let n_h = n_psus_per_stratum[h];
        if n_h == 0 {
            continue;
        }
        if n_h == 1 {
            match policy {
                SingletonPolicy::Remove => continue,
                SingletonPolicy::Error => {
                    return Err(SvyError::DesignDegeneracy(format!(
                        "stratum {h} contains a single PSU"
                    )));
                }
                SingletonPolicy::Center => {
                    let d = &psu_scores[psus[0] as usize] - &grand_mean;
                    add_outer(&mut g, &d, 1.0);
                    continue;
                }
            }
        }

        let mut mean_h: Array1<f64> = Array1::zeros(p);
        for &c in psus {
            mean_h = mean_h + &psu_scores[c as usize];
        }
        mean_h /= n_h as f64;

        let factor = n_h as f64 / (n_h as f64 - 1.0);
        for &c in psus {
            let d = &psu_scores[c as usize] - &mean_h;
            add_outer(&mut g, &d, factor);
        }
    }
    Ok(g)
}

fn add_outer(g: &mut Array2<f64>, d: &Array1<f64>, factor: f64) {
    let p = d.len();
    for j in 0..p {
        for k in 0..p {
            g[[j, k]] += factor * d[j] * d[k];
        }
    }
}

/// Solve (X'WX) beta = X'Wz, returning the solution and (X'WX)^-1. Cholesky
/// first, LU as fallback; a rank-deficient system is a `SingularMatrix`
/// failure rather than a silent NaN fit.
fn solve_weighted_least_squares(
    x: &Array2<f64>,
    z: &Array1<f64>,
    w: &[f64],
) -> Result<(Array1<f64>, Array2<f64>)> {
    let n = x.nrows();
    let p = x.ncols();

    let sqrt_w: Vec<f64> = w.iter().map(|wi| wi.sqrt()).collect();
    let mut x_weighted = DMatrix::zeros(n, p);
    for i in 0..n {
        for j in 0..p {
            x_weighted[(i, j)] = x[[i, j]] * sqrt_w[i];
        }
    }
    let z_weighted = DVector::from_iterator(
        n,
        z.iter().zip(sqrt_w.iter()).map(|(&zi, &si)| zi * si),
    );

    let xtx = x_weighted.transpose() * &x_weighted;
    let xtz = x_weighted.transpose() * z_weighted;

    let solution = match xtx.clone().cholesky() {
        Some(chol) => chol.solve(&xtz),
        None => xtx.clone().lu().solve(&xtz).ok_or_else(|| {
            SvyError::SingularMatrix(
                "X'WX is not invertible; check for collinear terms or empty cells".to_string(),
            )
        })?,
    };

    let inverse = match xtx.clone().cholesky() {
        Some(chol) => {
            let identity = DMatrix::identity(p, p);
            chol.solve(&identity)
        }
        None => xtx.try_inverse().ok_or_else(|| {
            SvyError::SingularMatrix(
                "X'WX is not invertible; check for collinear terms or empty cells".to_string(),
            )
        })?,
    };

    let coefficients: Array1<f64> = solution.iter().copied().collect();
    let mut inv = Array2::zeros((p, p));
    for i in 0..p {
        for j in 0..p {
            inv[[i, j]] = inverse[(i, j)];
        }
    }
    Ok((coefficients, inv))
}

fn max_relative_change(current: &Array1<f64>, previous: &Array1<f64>) -> f64 {
    current
        .iter()
        .zip(previous.iter())
        .map(|(c, p)| (c - p).abs() / (p.abs() + 1e-10))
        .fold(0.0, f64::max)
}

// ============================================================================
// Tests
// ============================================================================
