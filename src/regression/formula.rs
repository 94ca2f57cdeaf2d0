// src/regression/formula.rs
//
// Structured model terms and design-matrix expansion. A formula is an ordered
// list of terms over numeric fields; the intercept column is always included.
// The same expansion is applied to the fitting data and, later, to prediction
// grids, so new data projects into the identical column space.

use std::collections::HashMap;

use ndarray::Array2;
use polars::prelude::*;

use crate::error::{Result, SvyError};

// ============================================================================
// Terms
// ============================================================================

/// One model term: a raw field, a polynomial power of a field, or the product
/// of two terms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Term {
    Field(String),
    Power(String, u32),
    Interaction(Box<Term>, Box<Term>),
}

impl Term {
    pub fn field(name: &str) -> Term {
        Term::Field(name.to_string())
    }

    pub fn power(name: &str, power: u32) -> Term {
        Term::Power(name.to_string(), power)
    }

    pub fn interaction(a: Term, b: Term) -> Term {
        Term::Interaction(Box::new(a), Box::new(b))
    }

    /// Display label: `age`, `age^2`, `age:group`.
    pub fn label(&self) -> String {
        match self {
            Term::Field(f) => f.clone(),
            Term::Power(f, p) => format!("{f}^{p}"),
            Term::Interaction(a, b) => format!("{}:{}", a.label(), b.label()),
        }
    }

    /// Canonical form: first powers collapse to fields, interaction factors
    /// are ordered by label so `a:b` and `b:a` are the same term.
    fn normalized(self) -> Result<Term> {
        match self {
            Term::Power(f, 0) => Err(SvyError::InvalidFormula(format!(
                "term `{f}^0` is a constant; the intercept is always included"
            ))),
            Term::Power(f, 1) => Ok(Term::Field(f)),
            Term::Interaction(a, b) => {
                let a = a.normalized()?;
                let b = b.normalized()?;
                if a.label() <= b.label() {
                    Ok(Term::interaction(a, b))
                } else {
                    Ok(Term::interaction(b, a))
                }
            }
            t => Ok(t),
        }
    }

    fn collect_fields(&self, out: &mut Vec<String>) {
        match self {
            Term::Field(f) | Term::Power(f, _) => {
                if !out.contains(f) {
                    out.push(f.clone());
                }
            }
            Term::Interaction(a, b) => {
                a.collect_fields(out);
                b.collect_fields(out);
            }
        }
    }

    fn eval(&self, columns: &HashMap<String, Vec<Option<f64>>>, row: usize) -> Result<f64> {
        match self {
            Term::Field(f) => cell(columns, f, row),
            Term::Power(f, p) => Ok(cell(columns, f, row)?.powi(*p as i32)),
            Term::Interaction(a, b) => Ok(a.eval(columns, row)? * b.eval(columns, row)?),
        }
    }
}

fn cell(columns: &HashMap<String, Vec<Option<f64>>>, field: &str, row: usize) -> Result<f64> {
    columns
        .get(field)
        .and_then(|col| col[row])
        .ok_or_else(|| {
            SvyError::UnknownTerm(format!("covariate `{field}` is missing at row {row}"))
        })
}

// ============================================================================
// Formula
// ============================================================================

/// An ordered, duplicate-free list of model terms plus the implicit intercept.
#[derive(Debug, Clone)]
pub struct Formula {
    terms: Vec<Term>,
}

impl Formula {
    /// Normalize and validate terms. Duplicates (after normalization, so
    /// `Power(age, 1)` duplicates `Field(age)` and `a:b` duplicates `b:a`)
    /// fail with `InvalidFormula`. An empty list is the intercept-only model.
    pub fn new(terms: Vec<Term>) -> Result<Formula> {
        let mut normalized = Vec::with_capacity(terms.len());
        let mut seen = std::collections::HashSet::new();
        for term in terms {
            let term = term.normalized()?;
            let label = term.label();
            if !seen.insert(label.clone()) {
                return Err(SvyError::InvalidFormula(format!("duplicate term `{label}`")));
            }
            normalized.push(term);
        }
        Ok(Formula { terms: normalized })
    }

    pub fn terms(&self) -> &[Term] {
        &self.terms
    }

    /// Number of design-matrix columns, intercept included.
    pub fn n_columns(&self) -> usize {
        self.terms.len() + 1
    }

    /// Column labels, starting with `intercept`.
    pub fn column_names(&self) -> Vec<String> {
        std::iter::once("intercept".to_string())
            .chain(self.terms.iter().map(|t| t.label()))
            .collect()
    }

    /// Every source field the terms draw on, in first-use order.
    pub fn required_fields(&self) -> Vec<String> {
        let mut fields = Vec::new();
        for term in &self.terms {
            term.collect_fields(&mut fields);
        }
        fields
    }

    /// Per-row mask of records with every required field present, for
    /// excluding incomplete records from a fit without touching the rest of
    /// the dataset.
    pub fn complete_mask(&self, data: &DataFrame) -> Result<Vec<bool>> {
        let columns = self.field_values(data)?;
        let n = data.height();
        let mut mask = vec![true; n];
        for col in columns.values() {
            for (m, v) in mask.iter_mut().zip(col.iter()) {
                if v.is_none() {
                    *m = false;
                }
            }
        }
        Ok(mask)
    }

    /// Expand the terms against a dataset into the design matrix (n x p with
    /// leading intercept column). Every required field must be present
    /// (`UnknownTerm` otherwise) and every used cell non-missing.
    pub fn design_matrix(&self, data: &DataFrame) -> Result<Array2<f64>> {
        let columns = self.field_values(data)?;
        let n = data.height();
        let p = self.n_columns();
        let mut x = Array2::zeros((n, p));
        for i in 0..n {
            x[[i, 0]] = 1.0;
            for (j, term) in self.terms.iter().enumerate() {
                x[[i, j + 1]] = term.eval(&columns, i)?;
            }
        }
        Ok(x)
    }

    fn field_values(&self, data: &DataFrame) -> Result<HashMap<String, Vec<Option<f64>>>> {
        let mut columns = HashMap::new();
        for field in self.required_fields() {
            let series = data
                .column(&field)
                .map_err(|_| {
                    SvyError::UnknownTerm(format!(
                        "covariate `{field}` required by the model is not in the data"
                    ))
                })?
                .as_materialized_series()
                .cast(&DataType::Float64)
                .map_err(|_| {
                    SvyError::InvalidFormula(format!("covariate `{field}` is not numeric"))
                })?;
            let values: Vec<Option<f64>> = series.f64()?.iter().collect();
            columns.insert(field, values);
        }
        Ok(columns)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_labels() {
        assert_eq!(Term::field("age").label(), "age");
        assert_eq!(Term::power("age", 2).label(), "age^2");
        assert_eq!(
            Term::interaction(Term::field("age"), Term::field("grp")).label(),
            "age:grp"
        );
    }

    #[test]
    fn test_duplicate_terms_rejected() {
        let err = Formula::new(vec![Term::field("age"), Term::field("age")]).unwrap_err();
        assert!(matches!(err, SvyError::InvalidFormula(_)));

        // Power 1 normalizes to the bare field.
        let err = Formula::new(vec![Term::field("age"), Term::power("age", 1)]).unwrap_err();
        assert!(matches!(err, SvyError::InvalidFormula(_)));

        // Interactions are order-insensitive.
        let err = Formula::new(vec![
            Term::interaction(Term::field("a"), Term::field("b")),
            Term::interaction(Term::field("b"), Term::field("a")),
        ])
        .unwrap_err();
        assert!(matches!(err, SvyError::InvalidFormula(_)));
    }

    #[test]
    fn test_zero_power_rejected() {
        let err = Formula::new(vec![Term::power("age", 0)]).unwrap_err();
        assert!(matches!(err, SvyError::InvalidFormula(_)));
    }

    #[test]
    fn test_design_matrix_expansion() {
        let data = df![
            "age" => [2.0, 3.0],
            "grp" => [1.0, 0.0],
        ]
        .unwrap();
        let formula = Formula::new(vec![
            Term::field("age"),
            Term::power("age", 2),
            Term::interaction(Term::field("age"), Term::field("grp")),
        ])
        .unwrap();

        let x = formula.design_matrix(&data).unwrap();
        assert_eq!(x.shape(), &[2, 4]);
        // Row 0: intercept, age=2, age^2=4, age*grp=2
        assert_abs_diff_eq!(x[[0, 0]], 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(x[[0, 1]], 2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(x[[0, 2]], 4.0, epsilon = 1e-12);
        assert_abs_diff_eq!(x[[0, 3]], 2.0, epsilon = 1e-12);
        // Row 1: interaction zeroes out
        assert_abs_diff_eq!(x[[1, 3]], 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_missing_column_is_unknown_term() {
        let data = df!["age" => [1.0]].unwrap();
        let formula = Formula::new(vec![Term::field("income")]).unwrap();
        let err = formula.design_matrix(&data).unwrap_err();
        assert!(matches!(err, SvyError::UnknownTerm(_)));
    }

    #[test]
    fn test_complete_mask() {
        let data = df![
            "age" => [Some(1.0), None, Some(3.0)],
        ]
        .unwrap();
        let formula = Formula::new(vec![Term::field("age")]).unwrap();
        assert_eq!(formula.complete_mask(&data).unwrap(), vec![true, false, true]);
    }

    #[test]
    fn test_intercept_only() {
        let data = df!["age" => [1.0, 2.0]].unwrap();
        let formula = Formula::new(vec![]).unwrap();
        let x = formula.design_matrix(&data).unwrap();
        assert_eq!(x.shape(), &[2, 1]);
        assert_eq!(formula.column_names(), vec!["intercept"]);
    }
}
