use ndarray::{Array1, Array2, ArrayView2, Axis, stack};

use crate::ops::{heights, widths};
use crate::{Error, Result};

/// Utility that encodes boxes relative to reference anchors, and decodes them back.
///
/// A transform `(dx, dy, dw, dh)` moves the anchor center by `(dx * width, dy * height)` and
/// scales the anchor size by `(exp(dw), exp(dh))`. Each component is multiplied by its weight on
/// encoding and divided by it on decoding.
///
/// Based on the implementation in [torchvision].
///
/// [torchvision]: https://github.com/pytorch/vision/blob/33db2b3ebfdd2f73a9228f430fa7dd91c3b18078/torchvision/models/detection/_utils.py#L129
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoxCoder {
    /// The weights used for the x, y, width, and height components.
    pub weights: (f32, f32, f32, f32),
    /// The maximum value for `dw` and `dh` when decoding, before applying the exponent.
    /// Unbounded (`f32::INFINITY`) unless set through [`BoxCoder::new_with_clip`].
    pub bbox_xform_clip: f32,
}

impl Default for BoxCoder {
    fn default() -> Self {
        Self::new((1.0, 1.0, 1.0, 1.0))
    }
}

impl BoxCoder {
    /// Create a new [`BoxCoder`] with the given weights and no clamp on `dw` and `dh`.
    ///
    /// [`Self::decode`] is the exact inverse of [`Self::encode`] for such a coder.
    #[must_use]
    pub fn new(weights: (f32, f32, f32, f32)) -> Self {
        Self::new_with_clip(weights, f32::INFINITY)
    }

    /// Create a new [`BoxCoder`] with the given weights and clipping value.
    ///
    /// Decoding predicted transforms usually clamps at `ln(1000/16)`, so a single unbounded
    /// prediction cannot overflow `exp`.
    #[must_use]
    pub fn new_with_clip(weights: (f32, f32, f32, f32), bbox_xform_clip: f32) -> Self {
        BoxCoder {
            weights,
            bbox_xform_clip,
        }
    }

    /// Apply `transforms` to `anchors`, returning the decoded boxes in xyxy format.
    pub fn decode(&self, anchors: ArrayView2<f32>, transforms: ArrayView2<f32>) -> Result<Array2<f32>> {
        check_rows(anchors, transforms)?;

        let anchor_widths = widths(anchors);
        let anchor_heights = heights(anchors);
        let center_x = &anchors.column(0) + &(0.5 * &anchor_widths);
        let center_y = &anchors.column(1) + &(0.5 * &anchor_heights);

        let (wx, wy, ww, wh) = self.weights;

        let dx = &transforms.column(0) / wx;
        let dy = &transforms.column(1) / wy;

        // clamp to avoid overflow in exp
        let dw = (&transforms.column(2) / ww).mapv(|x| x.min(self.bbox_xform_clip));
        let dh = (&transforms.column(3) / wh).mapv(|x| x.min(self.bbox_xform_clip));

        let pred_center_x = dx * &anchor_widths + center_x;
        let pred_center_y = dy * &anchor_heights + center_y;

        let half_w = dw.mapv(f32::exp) * anchor_widths / 2.0;
        let half_h = dh.mapv(f32::exp) * anchor_heights / 2.0;

        let x1 = &pred_center_x - &half_w;
        let y1 = &pred_center_y - &half_h;
        let x2 = &pred_center_x + &half_w;
        let y2 = &pred_center_y + &half_h;

        Ok(stack![Axis(1), x1, y1, x2, y2])
    }

    /// Compute the transforms that map `anchors` onto `targets`, the inverse of [`Self::decode`].
    ///
    /// Decoding the result gives back `targets` as long as no `dw` or `dh` exceeds
    /// [`BoxCoder::bbox_xform_clip`], which always holds for a coder from [`BoxCoder::new`].
    pub fn encode(&self, anchors: ArrayView2<f32>, targets: ArrayView2<f32>) -> Result<Array2<f32>> {
        check_rows(anchors, targets)?;

        let (anchor_cx, anchor_cy, anchor_w, anchor_h) = centers_and_sizes(anchors);
        let (target_cx, target_cy, target_w, target_h) = centers_and_sizes(targets);

        let (wx, wy, ww, wh) = self.weights;

        let dx = wx * (target_cx - anchor_cx) / &anchor_w;
        let dy = wy * (target_cy - anchor_cy) / &anchor_h;
        let dw = ww * (target_w / anchor_w).mapv(f32::ln);
        let dh = wh * (target_h / anchor_h).mapv(f32::ln);

        Ok(stack![Axis(1), dx, dy, dw, dh])
    }
}

fn centers_and_sizes(boxes: ArrayView2<f32>) -> (Array1<f32>, Array1<f32>, Array1<f32>, Array1<f32>) {
    let w = widths(boxes);
    let h = heights(boxes);
    let cx = &boxes.column(0) + &(0.5 * &w);
    let cy = &boxes.column(1) + &(0.5 * &h);
    (cx, cy, w, h)
}

fn check_rows(reference: ArrayView2<f32>, other: ArrayView2<f32>) -> Result<()> {
    if reference.nrows() == other.nrows() {
        Ok(())
    } else {
        Err(Error::RowMismatch {
            expected: reference.nrows(),
            found: other.nrows(),
        })
    }
}
