//! Numeric helpers shared by the targeted metrics computation.
//!
//! Every helper in this crate treats statistically degenerate input (an empty
//! sample, a zero or undefined denominator) as "no value" (`None`) rather
//! than an error or a non-finite float.
#![deny(missing_docs)]

/// Divide `numerator` by `denominator`, returning `None` when the quotient
/// would not be statistically meaningful: a non-positive, non-finite, or
/// undefined denominator, or a non-finite numerator. Never returns infinity
/// and never panics.
pub fn robust_divide(numerator: f64, denominator: f64) -> Option<f64> {
    if !numerator.is_finite() || !(denominator > 0.0) {
        return None;
    }
    let quotient = numerator / denominator;
    quotient.is_finite().then_some(quotient)
}

/// Mean of a sample, `None` if it is empty.
pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

/// Sample standard deviation (n - 1 denominator), `None` when fewer than two
/// observations are available.
pub fn sample_std_dev(values: &[f64]) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let m = mean(values)?;
    let var = values.iter().map(|x| (x - m).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    Some(var.sqrt())
}

/// Linearly interpolated quantile of a sample, with `q` a fraction in
/// `[0, 1]`. `None` if the sample is empty. The sample must not contain NaN.
///
/// # Panics
/// Panics if `q` is outside `[0, 1]`.
pub fn quantile(values: &[f64], q: f64) -> Option<f64> {
    assert!((0.0..=1.0).contains(&q), "quantile fraction {q} out of range");
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_unstable_by(f64::total_cmp);
    let rank = (sorted.len() - 1) as f64 * q;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    Some(sorted[lo] + (rank - rank.floor()) * (sorted[hi] - sorted[lo]))
}

/// Median of a sample, `None` if it is empty.
pub fn median(values: &[f64]) -> Option<f64> {
    quantile(values, 0.5)
}
