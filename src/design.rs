// src/design.rs

use polars::prelude::*;

use crate::error::{Result, SvyError};

// ============================================================================
// Policies
// ============================================================================

/// How a stratum containing a single sampled PSU ("lonely PSU") contributes to
/// variance estimation.
///
/// Between-PSU variance cannot be estimated from one PSU, so the options are:
/// - `Remove`: the stratum contributes zero (R survey: options(survey.lonely.psu="remove"))
/// - `Error`: fail the estimation outright
/// - `Center`: use the squared deviation from the grand PSU mean
///   (R survey: "adjust")
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SingletonPolicy {
    #[default]
    Remove,
    Error,
    Center,
}

/// Handling of missing group labels during grouped estimation.
///
/// `Drop` excludes records with a missing group value from that estimation only.
/// `Keep` lets missing labels form their own "NA" group. Records with a missing
/// outcome are always excluded regardless of policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NaPolicy {
    #[default]
    Drop,
    Keep,
}

// ============================================================================
// Survey Design
// ============================================================================

/// A complex sample design: a rectangular dataset plus named bindings for the
/// sampling weight, PSU (cluster), and stratum columns.
///
/// A design is immutable once constructed. `subset` returns a new design and
/// never mutates in place, so designs can be shared freely across independent
/// estimations.
#[derive(Debug, Clone)]
pub struct SurveyDesign {
    data: DataFrame,
    weight: String,
    psu: String,
    stratum: String,
}

impl SurveyDesign {
    /// Build a design from a dataset and its three design bindings.
    ///
    /// Fails with `InvalidDesign` if any binding is absent, or if any weight is
    /// missing or non-positive. Validation runs here so estimation never has to
    /// discover a malformed weight mid-computation.
    pub fn new(data: DataFrame, weight: &str, psu: &str, stratum: &str) -> Result<Self> {
        for field in [weight, psu, stratum] {
            if data.column(field).is_err() {
                return Err(SvyError::InvalidDesign(format!(
                    "column `{field}` not found in data"
                )));
            }
        }

        let w = data
            .column(weight)?
            .as_materialized_series()
            .cast(&DataType::Float64)
            .map_err(|_| {
                SvyError::InvalidDesign(format!("weight column `{weight}` is not numeric"))
            })?;
        for (i, wi) in w.f64()?.iter().enumerate() {
            match wi {
                None => {
                    return Err(SvyError::InvalidDesign(format!(
                        "weight is missing at row {i}"
                    )))
                }
                Some(v) if v <= 0.0 => {
                    return Err(SvyError::InvalidDesign(format!(
                        "weight must be > 0, found {v} at row {i}"
                    )))
                }
                _ => {}
            }
        }

        Ok(Self {
            data,
            weight: weight.to_string(),
            psu: psu.to_string(),
            stratum: stratum.to_string(),
        })
    }

    /// Keep only the records where `mask` is true, preserving all three design
    /// bindings. Fails with `EmptyDesign` if nothing remains.
    pub fn subset(&self, mask: &BooleanChunked) -> Result<SurveyDesign> {
        let filtered = self.data.filter(mask)?;
        if filtered.height() == 0 {
            return Err(SvyError::EmptyDesign(
                "subset predicate matched no records".to_string(),
            ));
        }
        Ok(SurveyDesign {
            data: filtered,
            weight: self.weight.clone(),
            psu: self.psu.clone(),
            stratum: self.stratum.clone(),
        })
    }

    /// The underlying record set, for read-only consumption.
    pub fn data(&self) -> &DataFrame {
        &self.data
    }

    pub fn n_records(&self) -> usize {
        self.data.height()
    }

    pub fn weight_field(&self) -> &str {
        &self.weight
    }

    pub fn psu_field(&self) -> &str {
        &self.psu
    }

    pub fn stratum_field(&self) -> &str {
        &self.stratum
    }

    /// Sampling weights as f64. Non-null and positive by construction.
    pub fn weights(&self) -> Result<Vec<f64>> {
        let w = self
            .data
            .column(&self.weight)?
            .as_materialized_series()
            .cast(&DataType::Float64)?;
        Ok(w.f64()?.iter().map(|v| v.unwrap_or(f64::NAN)).collect())
    }

    /// A column rendered as string keys (PSU/stratum/group labels of any dtype).
    pub fn string_keys(&self, field: &str) -> Result<Vec<Option<String>>> {
        string_keys(&self.data, field)
    }

    /// A column rendered as f64 with nulls preserved.
    pub fn numeric(&self, field: &str) -> Result<Vec<Option<f64>>> {
        let s = self
            .data
            .column(field)
            .map_err(|_| SvyError::InvalidDesign(format!("column `{field}` not found in data")))?
            .as_materialized_series()
            .cast(&DataType::Float64)
            .map_err(|_| SvyError::InvalidDesign(format!("column `{field}` is not numeric")))?;
        Ok(s.f64()?.iter().collect())
    }

    /// Design degrees of freedom: number of distinct PSUs minus number of
    /// distinct strata.
    pub fn degrees_of_freedom(&self) -> Result<usize> {
        let psus = self.string_keys(&self.psu)?;
        let strata = self.string_keys(&self.stratum)?;
        let n_psus = distinct_pairs(&strata, &psus);
        let n_strata = distinct(&strata);
        Ok(n_psus.saturating_sub(n_strata))
    }
}

/// Render any column as string keys. Null stays null.
pub(crate) fn string_keys(data: &DataFrame, field: &str) -> Result<Vec<Option<String>>> {
    let s = data
        .column(field)
        .map_err(|_| SvyError::InvalidDesign(format!("column `{field}` not found in data")))?
        .as_materialized_series()
        .cast(&DataType::String)?;
    Ok(s.str()?
        .iter()
        .map(|v| v.map(|s| s.to_string()))
        .collect())
}

fn distinct(keys: &[Option<String>]) -> usize {
    let mut seen = std::collections::HashSet::new();
    for k in keys.iter().flatten() {
        seen.insert(k.as_str());
    }
    seen.len()
}

/// Distinct PSUs, counting a PSU label reused across strata as separate PSUs.
fn distinct_pairs(strata: &[Option<String>], psus: &[Option<String>]) -> usize {
    let mut seen = std::collections::HashSet::new();
    for (h, p) in strata.iter().zip(psus.iter()) {
        if let (Some(h), Some(p)) = (h, p) {
            seen.insert((h.as_str(), p.as_str()));
        }
    }
    seen.len()
}

// ============================================================================
// Tests
// ============================================================================
