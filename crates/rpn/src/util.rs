//! Numeric helpers shared by the pipeline and the losses.

/// Returns the softmax of a slice of logits.
#[inline]
#[must_use]
pub fn softmax(v: &[f32]) -> Vec<f32> {
    let max = v.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps = v.iter().map(|f| (f - max).exp()).collect::<Vec<_>>();

    let sum: f32 = exps.iter().sum();
    exps.iter().map(|x| x / sum).collect()
}

/// Returns the log-softmax of a slice of logits.
#[inline]
#[must_use]
pub fn log_softmax(v: &[f32]) -> Vec<f32> {
    let max = v.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let log_sum = v.iter().map(|f| (f - max).exp()).sum::<f32>().ln() + max;

    v.iter().map(|f| f - log_sum).collect()
}

/// Probability of the foreground class for a `(background, foreground)` logit pair.
#[inline]
#[must_use]
pub fn foreground_probability(background: f32, foreground: f32) -> f32 {
    sigmoid(foreground - background)
}

/// Computes the sigmoid score of the provided logit.
#[inline]
#[must_use]
pub fn sigmoid(logit: f32) -> f32 {
    1.0 / (1.0 + (-logit).exp())
}
