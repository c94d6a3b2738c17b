//! Batched operations over box arrays.
//!
//! Every array in this module has shape `(N, 4)` with rows in `(x1, y1, x2, y2)` format.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, Zip};

use crate::bbox::{Bbox, Xyxy};

/// Convert a single `(x1, y1, x2, y2)` row into a [`Bbox<Xyxy>`].
#[inline]
#[must_use]
pub fn row_to_bbox(row: ArrayView1<f32>) -> Bbox<Xyxy> {
    Bbox::xyxy(row[0], row[1], row[2], row[3])
}

/// Convert every row of `boxes` into a [`Bbox<Xyxy>`].
#[must_use]
pub fn to_bboxes(boxes: ArrayView2<f32>) -> Vec<Bbox<Xyxy>> {
    debug_assert_eq!(boxes.ncols(), 4, "boxes must have 4 columns");
    boxes.axis_iter(Axis(0)).map(row_to_bbox).collect()
}

/// Stack a slice of boxes into an `(N, 4)` array.
#[must_use]
pub fn from_bboxes(bboxes: &[Bbox<Xyxy>]) -> Array2<f32> {
    let mut out = Array2::zeros((bboxes.len(), 4));
    for (mut row, bbox) in out.axis_iter_mut(Axis(0)).zip(bboxes) {
        let (x1, y1, x2, y2) = bbox.inner;
        row.assign(&ArrayView1::from(&[x1, y1, x2, y2]));
    }
    out
}

#[must_use]
pub fn widths(boxes: ArrayView2<f32>) -> Array1<f32> {
    &boxes.column(2) - &boxes.column(0)
}

#[must_use]
pub fn heights(boxes: ArrayView2<f32>) -> Array1<f32> {
    &boxes.column(3) - &boxes.column(1)
}

/// Clamp each coordinate into the given rectangle. Boxes are never dropped.
#[must_use]
pub fn clip(boxes: ArrayView2<f32>, min_x: f32, min_y: f32, max_x: f32, max_y: f32) -> Array2<f32> {
    let mut clipped = boxes.to_owned();
    clipped
        .column_mut(0)
        .mapv_inplace(|x| x.clamp(min_x, max_x));
    clipped
        .column_mut(1)
        .mapv_inplace(|y| y.clamp(min_y, max_y));
    clipped
        .column_mut(2)
        .mapv_inplace(|x| x.clamp(min_x, max_x));
    clipped
        .column_mut(3)
        .mapv_inplace(|y| y.clamp(min_y, max_y));
    clipped
}

/// Mask of the boxes that lie entirely within `boundary`.
#[must_use]
pub fn inside(boxes: ArrayView2<f32>, boundary: &Bbox<Xyxy>) -> Array1<bool> {
    boxes
        .axis_iter(Axis(0))
        .map(|row| row_to_bbox(row).is_inside(boundary))
        .collect()
}

/// Pairwise intersection over union, returns an `(N, M)` matrix.
#[must_use]
pub fn iou(boxes_a: ArrayView2<f32>, boxes_b: ArrayView2<f32>) -> Array2<f32> {
    let a = to_bboxes(boxes_a);
    let b = to_bboxes(boxes_b);

    let mut ious = Array2::zeros((a.len(), b.len()));
    Zip::indexed(&mut ious).for_each(|(i, j), iou| {
        *iou = a[i].iou(&b[j]);
    });
    ious
}
