//! Empirical quantiles with linear interpolation between order statistics.

/// The `p`-quantile of `scores` (Hyndman-Fan type 7).
///
/// Non-finite scores are ignored; `None` when nothing finite remains.
pub fn quantile(scores: &[f64], p: f64) -> Option<f64> {
    let mut sorted: Vec<f64> = scores.iter().copied().filter(|s| s.is_finite()).collect();
    if sorted.is_empty() {
        return None;
    }
    sorted.sort_by(|a, b| a.total_cmp(b));
    let p = p.clamp(0.0, 1.0);
    let h = (sorted.len() - 1) as f64 * p;
    let lo = h.floor() as usize;
    let hi = h.ceil() as usize;
    Some(sorted[lo] + (h - lo as f64) * (sorted[hi] - sorted[lo]))
}
