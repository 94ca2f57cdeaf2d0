// src/estimation/mod.rs

pub mod taylor;

pub use taylor::{
    build_stratum_psu_map, degrees_of_freedom, index_categorical, point_estimate_mean,
    scores_mean, taylor_variance,
};

use std::collections::BTreeMap;

use polars::prelude::*;

use crate::design::{NaPolicy, SingletonPolicy, SurveyDesign};
use crate::error::{Result, SvyError};
use crate::inference::critical_t;

// ============================================================================
// Options
// ============================================================================

/// Options for `weighted_mean`.
#[derive(Debug, Clone)]
pub struct MeanOptions {
    /// Categorical fields to group by; empty means one estimate for the whole
    /// design.
    pub group_fields: Vec<String>,
    pub na_policy: NaPolicy,
    pub singleton_policy: SingletonPolicy,
    /// Confidence level for the interval, e.g. 0.95.
    pub confidence: f64,
}

impl Default for MeanOptions {
    fn default() -> Self {
        Self {
            group_fields: Vec::new(),
            na_policy: NaPolicy::default(),
            singleton_policy: SingletonPolicy::default(),
            confidence: 0.95,
        }
    }
}

impl MeanOptions {
    pub fn grouped_by(fields: &[&str]) -> Self {
        Self {
            group_fields: fields.iter().map(|f| f.to_string()).collect(),
            ..Self::default()
        }
    }

    pub fn with_na_policy(mut self, policy: NaPolicy) -> Self {
        self.na_policy = policy;
        self
    }

    pub fn with_singleton_policy(mut self, policy: SingletonPolicy) -> Self {
        self.singleton_policy = policy;
        self
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence;
        self
    }
}

// ============================================================================
// Weighted Mean Estimator
// ============================================================================

struct MeanRow {
    est: f64,
    se: f64,
    lower: f64,
    upper: f64,
    df: u32,
    n: u32,
}

/// Design-based weighted mean of `outcome`, optionally grouped.
///
/// Returns one row per distinct combination of the group fields (or a single
/// row when no grouping is requested), with columns: the group fields, then
/// `est`, `se`, `lower`, `upper`, `df`, `n`. The interval uses Student's t
/// with df = PSUs - strata within the records the estimate is based on.
///
/// Each group is estimated on its own subset of the design, so the result for
/// a group is identical to calling `subset` with that group's predicate and
/// estimating without grouping.
pub fn weighted_mean(
    design: &SurveyDesign,
    outcome: &str,
    options: &MeanOptions,
) -> Result<DataFrame> {
    if options.group_fields.is_empty() {
        let row = estimate_mean(design, outcome, options)?;
        return Ok(df![
            "est" => vec![row.est],
            "se" => vec![row.se],
            "lower" => vec![row.lower],
            "upper" => vec![row.upper],
            "df" => vec![row.df],
            "n" => vec![row.n],
        ]?);
    }

    // Composite group keys, rendered as strings. A record with a missing
    // group value is excluded from every group under Drop, or assigned to an
    // explicit "NA" group under Keep.
    let n_rows = design.n_records();
    let key_columns: Vec<Vec<Option<String>>> = options
        .group_fields
        .iter()
        .map(|f| design.string_keys(f))
        .collect::<Result<_>>()?;

    let mut groups: BTreeMap<Vec<String>, Vec<bool>> = BTreeMap::new();
    for i in 0..n_rows {
        let mut key = Vec::with_capacity(key_columns.len());
        let mut missing = false;
        for col in &key_columns {
            match &col[i] {
                Some(v) => key.push(v.clone()),
                None => match options.na_policy {
                    NaPolicy::Drop => {
                        missing = true;
                        break;
                    }
                    NaPolicy::Keep => key.push("NA".to_string()),
                },
            }
        }
        if missing {
            continue;
        }
        groups
            .entry(key)
            .or_insert_with(|| vec![false; n_rows])
            .as_mut_slice()[i] = true;
    }

    if groups.is_empty() {
        return Err(SvyError::EmptyDesign(format!(
            "no records with non-missing values for group fields {:?}",
            options.group_fields
        )));
    }

    let mut label_cols: Vec<Vec<String>> = vec![Vec::new(); options.group_fields.len()];
    let mut ests = Vec::new();
    let mut ses = Vec::new();
    let mut lowers = Vec::new();
    let mut uppers = Vec::new();
    let mut dfs = Vec::new();
    let mut ns = Vec::new();

    for (key, mask) in &groups {
        let mask = BooleanChunked::from_slice("mask".into(), mask);
        let sub = design.subset(&mask)?;
        let row = estimate_mean(&sub, outcome, options)?;
        for (col, label) in label_cols.iter_mut().zip(key.iter()) {
            col.push(label.clone());
        }
        ests.push(row.est);
        ses.push(row.se);
        lowers.push(row.lower);
        uppers.push(row.upper);
        dfs.push(row.df);
        ns.push(row.n);
    }

    let mut columns: Vec<Column> = options
        .group_fields
        .iter()
        .zip(label_cols)
        .map(|(field, labels)| Column::new(field.as_str().into(), labels))
        .collect();
    columns.push(Column::new("est".into(), ests));
    columns.push(Column::new("se".into(), ses));
    columns.push(Column::new("lower".into(), lowers));
    columns.push(Column::new("upper".into(), uppers));
    columns.push(Column::new("df".into(), dfs));
    columns.push(Column::new("n".into(), ns));
    Ok(DataFrame::new(columns)?)
}

/// One design-based mean with its linearized SE and t interval. Records with
/// a missing outcome, PSU, or stratum are excluded from this estimation only.
fn estimate_mean(design: &SurveyDesign, outcome: &str, options: &MeanOptions) -> Result<MeanRow> {
    let y_raw = design.numeric(outcome)?;
    let w_raw = design.weights()?;
    let strata_raw = design.string_keys(design.stratum_field())?;
    let psu_raw = design.string_keys(design.psu_field())?;

    let mut y = Vec::new();
    let mut w = Vec::new();
    let mut strata = Vec::new();
    let mut psus = Vec::new();
    for i in 0..y_raw.len() {
        if let (Some(yi), Some(hi), Some(pi)) = (y_raw[i], &strata_raw[i], &psu_raw[i]) {
            y.push(yi);
            w.push(w_raw[i]);
            strata.push(Some(hi.clone()));
            psus.push(Some(pi.clone()));
        }
    }
    if y.is_empty() {
        return Err(SvyError::EmptyDesign(format!(
            "no usable records for outcome `{outcome}`"
        )));
    }

    let est = point_estimate_mean(&y, &w)?;
    let scores = scores_mean(&y, &w, est);

    let (strata_idx, n_strata) = index_categorical(&strata);
    let (psu_idx, _) = index_categorical(&psus);
    let (_, n_psus_per_stratum) = build_stratum_psu_map(&strata_idx, n_strata, &psu_idx);

    let var = taylor_variance(
        &scores,
        &strata_idx,
        &psu_idx,
        n_strata,
        options.singleton_policy,
    )?;
    let se = var.max(0.0).sqrt();
    let df = degrees_of_freedom(&n_psus_per_stratum);
    let crit = critical_t(options.confidence, df as f64);

    Ok(MeanRow {
        est,
        se,
        lower: est - crit * se,
        upper: est + crit * se,
        df: df as u32,
        n: y.len() as u32,
    })
}

// ============================================================================
// Tests
// ============================================================================
