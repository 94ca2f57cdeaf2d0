// src/prediction.rs
//
// Model-based prediction over a covariate grid. Each grid row is expanded
// through the fitted formula (the same polynomial/interaction construction
// used at fit time), the linear predictor's standard error comes from the
// delta method with the design-based coefficient covariance, and the interval
// is transformed to the response scale through the log link's inverse.

use ndarray::Array1;
use polars::prelude::*;

use crate::error::{Result, SvyError};
use crate::inference::critical_z;
use crate::regression::FittedModel;

#[derive(Debug, Clone)]
pub struct PredictOptions {
    /// Confidence level for the response-scale interval, e.g. 0.95.
    pub confidence: f64,
}

impl Default for PredictOptions {
    fn default() -> Self {
        Self { confidence: 0.95 }
    }
}

/// Predict on the response scale for every row of `grid`.
///
/// Returns the grid columns plus `est`, `lower`, `upper`, and `se_eta`, where
/// `est = exp(eta)`, `se_eta = sqrt(x' Cov x)` and the bounds are
/// `exp(eta -/+ z * se_eta)`. Since exp is monotone, lower <= est <= upper
/// always holds. Fails with `UnknownTerm` if the grid lacks (or has a missing
/// value in) a covariate the model's terms require.
pub fn predict(
    model: &FittedModel,
    grid: &DataFrame,
    options: &PredictOptions,
) -> Result<DataFrame> {
    for field in model.formula().required_fields() {
        if grid.column(&field).is_err() {
            return Err(SvyError::UnknownTerm(format!(
                "prediction grid is missing covariate `{field}`"
            )));
        }
    }

    let x = model.formula().design_matrix(grid)?;
    let beta = model.coefficients();
    let cov = model.covariance();
    let z = critical_z(options.confidence);

    let eta: Array1<f64> = x.dot(beta);
    let n = grid.height();
    let mut ests = Vec::with_capacity(n);
    let mut lowers = Vec::with_capacity(n);
    let mut uppers = Vec::with_capacity(n);
    let mut se_etas = Vec::with_capacity(n);

    for i in 0..n {
        let xi = x.row(i);
        // Delta method: Var(eta) = x' Cov x.
        let var_eta = xi.dot(&cov.dot(&xi.to_owned()));
        let se_eta = var_eta.max(0.0).sqrt();
        ests.push(eta[i].exp());
        lowers.push((eta[i] - z * se_eta).exp());
        uppers.push((eta[i] + z * se_eta).exp());
        se_etas.push(se_eta);
    }

    let mut out = grid.clone();
    out.with_column(Column::new("est".into(), ests))?;
    out.with_column(Column::new("lower".into(), lowers))?;
    out.with_column(Column::new("upper".into(), uppers))?;
    out.with_column(Column::new("se_eta".into(), se_etas))?;
    Ok(out)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::design::SurveyDesign;
    use crate::regression::{fit_quasipoisson, Formula, GlmOptions, Term};
    use approx::assert_abs_diff_eq;

    fn fitted_age_model() -> FittedModel {
        let data = df![
            "count" => [0.0, 1.0, 2.0, 1.0, 2.0, 3.0, 2.0, 4.0],
            "age" => [30.0, 40.0, 50.0, 35.0, 45.0, 55.0, 60.0, 65.0],
            "wt" => [1.0; 8],
            "psu" => ["a", "a", "b", "b", "c", "c", "d", "d"],
            "stratum" => [1, 1, 1, 1, 2, 2, 2, 2],
        ]
        .unwrap();
        let design = SurveyDesign::new(data, "wt", "psu", "stratum").unwrap();
        let formula = Formula::new(vec![Term::field("age"), Term::power("age", 2)]).unwrap();
        fit_quasipoisson(&design, &formula, "count", &GlmOptions::default()).unwrap()
    }

    fn col_f64(df: &DataFrame, name: &str) -> Vec<f64> {
        df.column(name)
            .unwrap()
            .as_materialized_series()
            .f64()
            .unwrap()
            .iter()
            .map(|v| v.unwrap())
            .collect()
    }

    #[test]
    fn test_eta_matches_manual_expansion() {
        let model = fitted_age_model();
        let grid = df!["age" => [30.0]].unwrap();
        let out = predict(&model, &grid, &PredictOptions::default()).unwrap();

        let b = model.coefficients();
        let eta = b[0] + b[1] * 30.0 + b[2] * 900.0;
        assert_abs_diff_eq!(col_f64(&out, "est")[0], eta.exp(), epsilon = 1e-10);
    }

    #[test]
    fn test_interval_brackets_estimate() {
        let model = fitted_age_model();
        let grid = df!["age" => [30.0, 40.0, 50.0, 60.0]].unwrap();
        let out = predict(&model, &grid, &PredictOptions::default()).unwrap();

        let est = col_f64(&out, "est");
        let lower = col_f64(&out, "lower");
        let upper = col_f64(&out, "upper");
        for i in 0..4 {
            assert!(lower[i] <= est[i]);
            assert!(est[i] <= upper[i]);
            assert!(lower[i] > 0.0);
        }
    }

    #[test]
    fn test_missing_grid_covariate_rejected() {
        let model = fitted_age_model();
        let grid = df!["income" => [10.0]].unwrap();
        let err = predict(&model, &grid, &PredictOptions::default()).unwrap_err();
        assert!(matches!(err, SvyError::UnknownTerm(_)));
    }

    #[test]
    fn test_null_grid_cell_rejected() {
        let model = fitted_age_model();
        let grid = df!["age" => [Some(30.0), None]].unwrap();
        let err = predict(&model, &grid, &PredictOptions::default()).unwrap_err();
        assert!(matches!(err, SvyError::UnknownTerm(_)));
    }

    #[test]
    fn test_intervals_narrow_with_more_clusters() {
        // Same data proportions replicated over more PSUs: the design
        // covariance shrinks, so the prediction interval narrows.
        fn design_with_replicates(reps: usize) -> SurveyDesign {
            let mut count = Vec::new();
            let mut age = Vec::new();
            let mut psu = Vec::new();
            for r in 0..reps {
                for (c, a, p) in [
                    (0.0, 30.0, "a"),
                    (1.0, 40.0, "a"),
                    (2.0, 50.0, "b"),
                    (3.0, 60.0, "b"),
                ] {
                    count.push(c);
                    age.push(a);
                    psu.push(format!("{p}{r}"));
                }
            }
            let n = count.len();
            let data = df![
                "count" => count,
                "age" => age,
                "wt" => vec![1.0; n],
                "psu" => psu,
                "stratum" => vec![1i32; n],
            ]
            .unwrap();
            SurveyDesign::new(data, "wt", "psu", "stratum").unwrap()
        }

        let formula = Formula::new(vec![Term::field("age")]).unwrap();
        let grid = df!["age" => [45.0]].unwrap();

        let small = fit_quasipoisson(
            &design_with_replicates(2),
            &formula,
            "count",
            &GlmOptions::default(),
        )
        .unwrap();
        let large = fit_quasipoisson(
            &design_with_replicates(8),
            &formula,
            "count",
            &GlmOptions::default(),
        )
        .unwrap();

        let out_small = predict(&small, &grid, &PredictOptions::default()).unwrap();
        let out_large = predict(&large, &grid, &PredictOptions::default()).unwrap();

        let width_small = col_f64(&out_small, "upper")[0] - col_f64(&out_small, "lower")[0];
        let width_large = col_f64(&out_large, "upper")[0] - col_f64(&out_large, "lower")[0];
        assert!(width_large < width_small);
    }

    #[test]
    fn test_grid_columns_carried_through() {
        let model = fitted_age_model();
        let grid = df!["age" => [30.0, 40.0]].unwrap();
        let out = predict(&model, &grid, &PredictOptions::default()).unwrap();
        assert!(out.column("age").is_ok());
        assert_eq!(out.height(), 2);
    }
}
