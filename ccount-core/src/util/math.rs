//! Mathematical utility functions.

/// Smallest probability used before taking logs.
pub const PROB_EPS: f64 = 1e-12;

/// Smallest positive rate used before taking logs.
pub const RATE_EPS: f64 = 1e-300;

/// Logistic function, stable for large |x|.
pub fn expit(x: f64) -> f64 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

/// log(1 - exp(-x)) for x > 0, accurate for small and large x.
pub fn log1mexp(x: f64) -> f64 {
    if x <= std::f64::consts::LN_2 {
        (-(-x).exp_m1()).ln()
    } else {
        (-(-x).exp()).ln_1p()
    }
}

/// ln(1 - t) + t for t < 1, accurate when t is tiny.
pub fn log1m_plus(t: f64) -> f64 {
    if t.abs() < 1e-3 {
        // -(t^2/2 + t^3/3 + ...), truncated well below f64 precision
        let mut power = t;
        let mut sum = 0.0;
        for k in 2..=8 {
            power *= t;
            sum += power / k as f64;
        }
        -sum
    } else {
        (-t).ln_1p() + t
    }
}

/// Clamp a probability into (PROB_EPS, 1 - PROB_EPS).
pub fn clamp_prob(p: f64) -> f64 {
    p.clamp(PROB_EPS, 1.0 - PROB_EPS)
}

/// Population mean and standard deviation of a column.
pub fn mean_std(values: &[f64]) -> (f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    (mean, var.sqrt())
}

/// Euclidean norm.
pub fn norm(values: &[f64]) -> f64 {
    values.iter().map(|v| v * v).sum::<f64>().sqrt()
}

/// Relative change ||new - old|| / ||old||.
///
/// Falls back to the absolute change when `old` is the zero vector.
pub fn relative_error(old: &[f64], new: &[f64]) -> f64 {
    assert_eq!(old.len(), new.len());
    let diff: f64 = old
        .iter()
        .zip(new.iter())
        .map(|(o, n)| (n - o).powi(2))
        .sum::<f64>()
        .sqrt();
    let base = norm(old);
    if base > 0.0 {
        diff / base
    } else {
        diff
    }
}

/// Empirical quantile with linear interpolation between order statistics.
pub fn quantile(sorted: &[f64], q: f64) -> f64 {
    assert!(!sorted.is_empty());
    let pos = q.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    let frac = pos - lo as f64;
    sorted[lo] + frac * (sorted[hi] - sorted[lo])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expit_is_symmetric() {
        for &x in &[-30.0, -2.0, 0.0, 1.5, 40.0] {
            assert!((expit(x) + expit(-x) - 1.0).abs() < 1e-12);
        }
        assert_eq!(expit(0.0), 0.5);
    }

    #[test]
    fn test_log1mexp() {
        for &x in &[1e-8_f64, 0.1, 0.7, 3.0, 50.0] {
            let direct = (1.0 - (-x).exp()).ln();
            assert!((log1mexp(x) - direct).abs() < 1e-6 * direct.abs().max(1.0));
        }
    }

    #[test]
    fn test_log1m_plus() {
        for &t in &[0.5, 0.01, 2e-3] {
            assert!((log1m_plus(t) - ((1.0 - t).ln() + t)).abs() < 1e-14);
        }
        // leading term -t^2/2 survives where the direct form cancels to zero
        let t = 1e-10;
        assert!((log1m_plus(t) / (-0.5 * t * t) - 1.0).abs() < 1e-9);
        assert!((log1m_plus(9e-4) - ((-9e-4_f64).ln_1p() + 9e-4)).abs() < 1e-16);
    }

    #[test]
    fn test_relative_error() {
        assert!((relative_error(&[3.0, 4.0], &[3.0, 4.0])).abs() < 1e-15);
        assert!((relative_error(&[3.0, 4.0], &[3.0, 9.0]) - 1.0).abs() < 1e-12);
        // zero baseline: absolute change
        assert!((relative_error(&[0.0, 0.0], &[0.0, 2.0]) - 2.0).abs() < 1e-12);
        assert_eq!(relative_error(&[0.0], &[0.0]), 0.0);
    }

    #[test]
    fn test_mean_std_uses_population_std() {
        let (m, s) = mean_std(&[1.0, 2.0, 3.0, 4.0]);
        assert!((m - 2.5).abs() < 1e-12);
        assert!((s - 1.25_f64.sqrt()).abs() < 1e-12);
    }

    #[test]
    fn test_quantile() {
        let v = [0.0, 1.0, 2.0, 3.0, 4.0];
        assert_eq!(quantile(&v, 0.0), 0.0);
        assert_eq!(quantile(&v, 1.0), 4.0);
        assert!((quantile(&v, 0.5) - 2.0).abs() < 1e-12);
        assert!((quantile(&v, 0.3) - 1.2).abs() < 1e-12);
    }
}
