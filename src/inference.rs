// src/inference.rs
//
// Critical values and p-values for confidence intervals. Design-based
// inference uses Student's t with the design degrees of freedom
// (PSUs - strata); the normal approximation kicks in at large df.

use statrs::distribution::{ContinuousCDF, Normal, StudentsT};

/// Two-sided normal critical value for a confidence level, e.g. 0.95 -> 1.96.
pub fn critical_z(confidence: f64) -> f64 {
    let normal = Normal::new(0.0, 1.0).expect("standard normal");
    let alpha = 1.0 - confidence;
    normal.inverse_cdf(1.0 - alpha / 2.0)
}

/// Two-sided t critical value with `df` degrees of freedom. Falls back to the
/// normal at large or non-positive df (a design with zero df has no variance
/// information and its SE is already zero).
pub fn critical_t(confidence: f64, df: f64) -> f64 {
    if !df.is_finite() || df <= 0.0 || df > 1000.0 {
        return critical_z(confidence);
    }
    match StudentsT::new(0.0, 1.0, df) {
        Ok(t) => {
            let alpha = 1.0 - confidence;
            t.inverse_cdf(1.0 - alpha / 2.0)
        }
        Err(_) => critical_z(confidence),
    }
}

/// Two-tailed p-value from a t-statistic.
pub fn pvalue_t(t: f64, df: f64) -> f64 {
    if !t.is_finite() {
        return f64::NAN;
    }
    if !df.is_finite() || df <= 0.0 {
        return f64::NAN;
    }
    if df > 1000.0 {
        let normal = Normal::new(0.0, 1.0).expect("standard normal");
        return 2.0 * (1.0 - normal.cdf(t.abs()));
    }
    match StudentsT::new(0.0, 1.0, df) {
        Ok(dist) => 2.0 * (1.0 - dist.cdf(t.abs())),
        Err(_) => f64::NAN,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_critical_z_95() {
        assert_abs_diff_eq!(critical_z(0.95), 1.959964, epsilon = 1e-4);
    }

    #[test]
    fn test_critical_t_wider_than_z() {
        // Small-df t intervals are wider than normal ones.
        assert!(critical_t(0.95, 3.0) > critical_z(0.95));
    }

    #[test]
    fn test_critical_t_large_df_matches_z() {
        assert_abs_diff_eq!(critical_t(0.95, 5000.0), critical_z(0.95), epsilon = 1e-10);
    }

    #[test]
    fn test_pvalue_t_known_value() {
        // t = 1.96 at huge df is the classic 5% two-tailed boundary.
        assert_abs_diff_eq!(pvalue_t(1.96, 1e6), 0.05, epsilon = 1e-3);
    }
}
