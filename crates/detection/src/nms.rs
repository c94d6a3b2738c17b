use ndarray::ArrayView2;

use crate::ops::to_bboxes;

/// Greedy non-maximum suppression over boxes that are already sorted by descending score.
///
/// The highest scoring remaining box is kept, and every remaining box whose IoU with it exceeds
/// `threshold` is discarded, until no boxes remain. Returns the indices of the kept boxes, in
/// their original relative order.
#[must_use]
pub fn suppress(boxes: ArrayView2<f32>, threshold: f32) -> Vec<usize> {
    let bboxes = to_bboxes(boxes);
    let mut suppressed = vec![false; bboxes.len()];
    let mut keep = Vec::new();

    for i in 0..bboxes.len() {
        if suppressed[i] {
            continue;
        }

        keep.push(i);
        for j in (i + 1)..bboxes.len() {
            if !suppressed[j] && bboxes[i].iou(&bboxes[j]) > threshold {
                suppressed[j] = true;
            }
        }
    }

    keep
}
