//! Objectness and box regression losses over a sampled batch.

use ndarray::{ArrayView2, Axis, Zip};

use crate::util::log_softmax;

/// The two scalar losses of a training step.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RpnLosses {
    pub classification: f32,
    pub regression: f32,
}

impl RpnLosses {
    #[must_use]
    pub fn total(&self) -> f32 {
        self.classification + self.regression
    }
}

/// Mean categorical cross-entropy of `logits` against the class indices in `classes`.
///
/// Returns `0.0` for an empty batch.
#[must_use]
pub fn cross_entropy(logits: ArrayView2<f32>, classes: &[usize]) -> f32 {
    debug_assert_eq!(logits.nrows(), classes.len());
    if classes.is_empty() {
        return 0.0;
    }

    let total: f32 = logits
        .axis_iter(Axis(0))
        .zip(classes)
        .map(|(row, &class)| -log_softmax(&row.to_vec())[class])
        .sum();

    total / classes.len() as f32
}

/// Smooth L1 loss with `beta = 1`: `0.5 * x^2` when `|x| < 1`, `|x| - 0.5` otherwise.
#[inline]
#[must_use]
pub fn smooth_l1(x: f32) -> f32 {
    let abs = x.abs();
    if abs < 1.0 { 0.5 * x * x } else { abs - 0.5 }
}

/// Smooth L1 loss summed over every element, divided by the number of rows (boxes) rather than
/// the number of elements.
///
/// Returns `0.0` when there are no rows.
#[must_use]
pub fn box_regression_loss(predictions: ArrayView2<f32>, targets: ArrayView2<f32>) -> f32 {
    debug_assert_eq!(predictions.dim(), targets.dim());
    if predictions.nrows() == 0 {
        return 0.0;
    }

    let total = Zip::from(&predictions)
        .and(&targets)
        .fold(0.0, |acc, &p, &t| acc + smooth_l1(p - t));

    total / predictions.nrows() as f32
}
