// src/estimation/taylor.rs
//
// Taylor (linearization) variance machinery for design-based estimation.
// The weighted mean is treated as a ratio estimator; its variance comes from
// the between-PSU variation of per-PSU summed linearization scores, computed
// within each stratum and summed over strata.

use log::warn;

use crate::design::SingletonPolicy;
use crate::error::{Result, SvyError};

// ============================================================================
// Point Estimate & Scores
// ============================================================================

/// Weight-normalized (Hajek) mean: sum(w*y) / sum(w).
pub fn point_estimate_mean(y: &[f64], weights: &[f64]) -> Result<f64> {
    let sum_wy: f64 = y.iter().zip(weights.iter()).map(|(yi, wi)| yi * wi).sum();
    let sum_w: f64 = weights.iter().sum();

    if sum_w == 0.0 {
        return Err(SvyError::EmptyDesign("sum of weights is zero".to_string()));
    }
    Ok(sum_wy / sum_w)
}

/// Linearization scores for the mean: z_i = (w_i / sum_w) * (y_i - est).
///
/// Summing scores by PSU and taking their between-PSU variance within each
/// stratum yields the design-based variance of the mean (matches R's
/// svymean with Taylor linearization).
pub fn scores_mean(y: &[f64], weights: &[f64], estimate: f64) -> Vec<f64> {
    let sum_w: f64 = weights.iter().sum();
    y.iter()
        .zip(weights.iter())
        .map(|(yi, wi)| (wi / sum_w) * (yi - estimate))
        .collect()
}

// ============================================================================
// Indexing Helpers
// ============================================================================

/// Map string keys to dense u32 indices in first-appearance order. A missing
/// key maps to u32::MAX and is skipped by every consumer.
pub fn index_categorical(keys: &[Option<String>]) -> (Vec<u32>, u32) {
    let mut map: std::collections::HashMap<&str, u32> = std::collections::HashMap::new();
    let mut next_idx = 0u32;
    let indices: Vec<u32> = keys
        .iter()
        .map(|opt| match opt {
            Some(s) => *map.entry(s.as_str()).or_insert_with(|| {
                let i = next_idx;
                next_idx += 1;
                i
            }),
            None => u32::MAX,
        })
        .collect();
    (indices, next_idx)
}

/// For each stratum, the set of PSU indices observed in it, plus counts.
pub fn build_stratum_psu_map(
    strata_indices: &[u32],
    n_strata: u32,
    psu_indices: &[u32],
) -> (Vec<Vec<u32>>, Vec<u32>) {
    let mut stratum_psus: Vec<std::collections::HashSet<u32>> =
        vec![std::collections::HashSet::new(); n_strata as usize];
    for (&stratum, &psu) in strata_indices.iter().zip(psu_indices.iter()) {
        if stratum != u32::MAX && psu != u32::MAX {
            stratum_psus[stratum as usize].insert(psu);
        }
    }
    let psu_per_stratum: Vec<Vec<u32>> = stratum_psus
        .iter()
        .map(|m| {
            let mut v: Vec<u32> = m.iter().copied().collect();
            v.sort_unstable();
            v
        })
        .collect();
    let n_psus_per_stratum: Vec<u32> = psu_per_stratum.iter().map(|v| v.len() as u32).collect();
    (psu_per_stratum, n_psus_per_stratum)
}

// ============================================================================
// Stratified Between-PSU Variance
// ============================================================================

/// Stratified linearization variance of summed scores.
///
/// For stratum h with n_h PSUs and per-PSU score totals z_hc:
///     var_h = n_h / (n_h - 1) * sum_c (z_hc - zbar_h)^2
/// and the total variance is the sum over strata. A stratum with a single
/// PSU is handled per `policy`.
pub fn taylor_variance(
    scores: &[f64],
    strata_indices: &[u32],
    psu_indices: &[u32],
    n_strata: u32,
    policy: SingletonPolicy,
) -> Result<f64> {
    if scores.is_empty() || n_strata == 0 {
        return Ok(0.0);
    }

    let max_psu = psu_indices
        .iter()
        .filter(|&&p| p != u32::MAX)
        .max()
        .copied()
        .unwrap_or(0);
    let mut psu_totals = vec![0.0; (max_psu + 1) as usize];
    for ((&score, &stratum), &psu) in scores
        .iter()
        .zip(strata_indices.iter())
        .zip(psu_indices.iter())
    {
        if stratum != u32::MAX && psu != u32::MAX {
            psu_totals[psu as usize] += score;
        }
    }

    let (psu_per_stratum, n_psus_per_stratum) =
        build_stratum_psu_map(strata_indices, n_strata, psu_indices);

    // Grand PSU mean, only needed for the Center policy.
    let grand_mean = if policy == SingletonPolicy::Center {
        let n_total: u32 = n_psus_per_stratum.iter().sum();
        if n_total > 0 {
            let total: f64 = psu_per_stratum
                .iter()
                .flatten()
                .map(|&p| psu_totals[p as usize])
                .sum();
            total / (n_total as f64)
        } else {
            0.0
        }
    } else {
        0.0
    };

    let mut total_var = 0.0;
    for h in 0..n_strata as usize {
        let n_psus_h = n_psus_per_stratum[h];
        if n_psus_h == 0 {
            continue;
        }
        if n_psus_h == 1 {
            match policy {
                SingletonPolicy::Remove => {
                    warn!("stratum {h} has a single PSU; contributing zero variance");
                }
                SingletonPolicy::Error => {
                    return Err(SvyError::DesignDegeneracy(format!(
                        "stratum {h} contains a single PSU"
                    )));
                }
                SingletonPolicy::Center => {
                    let p = psu_per_stratum[h][0];
                    total_var += (psu_totals[p as usize] - grand_mean).powi(2);
                }
            }
            continue;
        }

        let totals_h: Vec<f64> = psu_per_stratum[h]
            .iter()
            .map(|&p| psu_totals[p as usize])
            .collect();
        let mean_h = totals_h.iter().sum::<f64>() / (n_psus_h as f64);
        let sum_sq_diff: f64 = totals_h.iter().map(|&t| (t - mean_h).powi(2)).sum();
        total_var += (n_psus_h as f64 / (n_psus_h as f64 - 1.0)) * sum_sq_diff;
    }
    Ok(total_var)
}

/// Design degrees of freedom: sum over strata of (PSUs in stratum - 1),
/// i.e. total PSUs minus total strata.
pub fn degrees_of_freedom(n_psus_per_stratum: &[u32]) -> usize {
    n_psus_per_stratum
        .iter()
        .map(|&n| n.saturating_sub(1) as usize)
        .sum()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn keys(v: &[&str]) -> Vec<Option<String>> {
        v.iter().map(|s| Some(s.to_string())).collect()
    }

    #[test]
    fn test_point_estimate_equal_weights() {
        let y = [0.0, 1.0, 2.0, 1.0, 2.0, 3.0];
        let w = [1.0; 6];
        assert_abs_diff_eq!(point_estimate_mean(&y, &w).unwrap(), 1.5, epsilon = 1e-12);
    }

    #[test]
    fn test_point_estimate_weight_rescaling_invariant() {
        let y = [2.0, 4.0, 6.0];
        let w = [1.0, 2.0, 3.0];
        let w10: Vec<f64> = w.iter().map(|x| x * 10.0).collect();
        let a = point_estimate_mean(&y, &w).unwrap();
        let b = point_estimate_mean(&y, &w10).unwrap();
        assert_abs_diff_eq!(a, b, epsilon = 1e-12);
    }

    #[test]
    fn test_scores_sum_to_zero() {
        let y = [0.0, 1.0, 2.0, 5.0];
        let w = [1.0, 2.0, 1.0, 0.5];
        let est = point_estimate_mean(&y, &w).unwrap();
        let scores = scores_mean(&y, &w, est);
        let total: f64 = scores.iter().sum();
        assert_abs_diff_eq!(total, 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_variance_matches_classical_se_each_record_own_psu() {
        // One stratum, every record its own PSU, equal weights: the Taylor
        // variance of the mean reduces to s^2 / n.
        let y = [1.0, 2.0, 3.0, 4.0, 5.0];
        let w = [1.0; 5];
        let est = point_estimate_mean(&y, &w).unwrap();
        let scores = scores_mean(&y, &w, est);

        let strata = keys(&["1"; 5]);
        let psus = keys(&["a", "b", "c", "d", "e"]);
        let (si, ns) = index_categorical(&strata);
        let (pi, _) = index_categorical(&psus);

        let var = taylor_variance(&scores, &si, &pi, ns, SingletonPolicy::Remove).unwrap();

        let mean = 3.0;
        let s2 = y.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / 4.0;
        assert_abs_diff_eq!(var, s2 / 5.0, epsilon = 1e-12);
    }

    #[test]
    fn test_two_psu_one_stratum_variance() {
        // 6 records, 2 PSUs of 3 in 1 stratum, unit weights.
        let y = [0.0, 1.0, 2.0, 1.0, 2.0, 3.0];
        let w = [1.0; 6];
        let est = point_estimate_mean(&y, &w).unwrap();
        let scores = scores_mean(&y, &w, est);

        let strata = keys(&["1"; 6]);
        let psus = keys(&["a", "a", "a", "b", "b", "b"]);
        let (si, ns) = index_categorical(&strata);
        let (pi, _) = index_categorical(&psus);

        let var = taylor_variance(&scores, &si, &pi, ns, SingletonPolicy::Remove).unwrap();

        // PSU score totals: a = (3 - 4.5)/6 = -0.25, b = (6 - 4.5)/6 = 0.25.
        // var = 2/1 * (0.25^2 + 0.25^2) = 0.25
        assert_abs_diff_eq!(var, 0.25, epsilon = 1e-12);
    }

    #[test]
    fn test_singleton_policies() {
        let y = [1.0, 2.0, 3.0, 4.0];
        let w = [1.0; 4];
        let est = point_estimate_mean(&y, &w).unwrap();
        let scores = scores_mean(&y, &w, est);

        // Stratum 2 has a single PSU.
        let strata = keys(&["1", "1", "1", "2"]);
        let psus = keys(&["a", "a", "b", "c"]);
        let (si, ns) = index_categorical(&strata);
        let (pi, _) = index_categorical(&psus);

        let removed =
            taylor_variance(&scores, &si, &pi, ns, SingletonPolicy::Remove).unwrap();
        let centered =
            taylor_variance(&scores, &si, &pi, ns, SingletonPolicy::Center).unwrap();
        let err = taylor_variance(&scores, &si, &pi, ns, SingletonPolicy::Error).unwrap_err();

        // Centering adds a non-negative term for the lonely PSU.
        assert!(centered >= removed);
        assert!(matches!(err, SvyError::DesignDegeneracy(_)));
    }

    #[test]
    fn test_degrees_of_freedom() {
        // 3 strata with 2, 3, 1 PSUs -> df = 1 + 2 + 0 = 3
        assert_eq!(degrees_of_freedom(&[2, 3, 1]), 3);
        assert_eq!(degrees_of_freedom(&[]), 0);
    }

    #[test]
    fn test_index_categorical_handles_missing() {
        let keys = vec![Some("a".to_string()), None, Some("a".to_string())];
        let (idx, n) = index_categorical(&keys);
        assert_eq!(idx, vec![0, u32::MAX, 0]);
        assert_eq!(n, 1);
    }
}
