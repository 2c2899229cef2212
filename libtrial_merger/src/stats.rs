//! Small numeric helpers shared by the alignment stages.
//!
//! Quantiles use linear interpolation between closest ranks, and `is_close` uses an
//! asymmetric relative tolerance on the second argument, so tuned thresholds keep
//! their meaning.
use super::constants::ATOL;

/// Linear-interpolated quantile of `values` at `q` in [0, 1]. NaNs are ignored.
///
/// Returns None if there are no finite values.
pub fn quantile(values: &[f64], q: f64) -> Option<f64> {
    let mut sorted: Vec<f64> = values.iter().copied().filter(|v| !v.is_nan()).collect();
    if sorted.is_empty() {
        return None;
    }
    sorted.sort_by(|a, b| a.total_cmp(b));
    Some(quantile_sorted(&sorted, q))
}

/// Quantile of an already sorted, NaN-free slice. The slice must not be empty.
pub fn quantile_sorted(sorted: &[f64], q: f64) -> f64 {
    let pos = q.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    let frac = pos - lo as f64;
    sorted[lo] + (sorted[hi] - sorted[lo]) * frac
}

pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

/// Population standard deviation (ddof = 0)
pub fn std(values: &[f64]) -> Option<f64> {
    let m = mean(values)?;
    let var = values.iter().map(|v| (v - m) * (v - m)).sum::<f64>() / values.len() as f64;
    Some(var.sqrt())
}

/// `|a - b| <= ATOL + rtol * |b|`. Always false if either value is NaN.
pub fn is_close(a: f64, b: f64, rtol: f64) -> bool {
    (a - b).abs() <= ATOL + rtol * b.abs()
}

/// Consecutive differences `x[i + 1] - x[i]`
pub fn diffs(values: &[f64]) -> Vec<f64> {
    values.windows(2).map(|w| w[1] - w[0]).collect()
}

/// Fraction of elementwise pairs that are close. Zero pairs gives 0.
pub fn fraction_close(a: &[f64], b: &[f64], rtol: f64) -> f64 {
    let n = a.len().min(b.len());
    if n == 0 {
        return 0.0;
    }
    let close = a
        .iter()
        .zip(b.iter())
        .filter(|(x, y)| is_close(**x, **y, rtol))
        .count();
    close as f64 / n as f64
}
