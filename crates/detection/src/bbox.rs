use std::marker::PhantomData;

/// A single box in image pixel coordinates, tagged with its coordinate layout.
///
/// The layout marker is either [`Xyxy`] for corner coordinates `(x1, y1, x2, y2)` or [`Cxcywh`]
/// for `(center_x, center_y, width, height)`. Geometry is always evaluated on the corner layout,
/// any box that can be turned into one through [`ConvertBbox`] supports it.
///
/// ```
/// use detection::bbox::*;
///
/// let anchor = Bbox::cxcywh(8.0, 8.0, 16.0, 32.0);
/// let corners: Bbox<Xyxy> = anchor.convert();
///
/// assert_eq!(corners.inner, (0.0, -8.0, 16.0, 24.0));
/// assert_eq!(anchor.iou(&corners), 1.0);
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bbox<T> {
    pub inner: (f32, f32, f32, f32),
    _marker: PhantomData<T>,
}

impl<T> Bbox<T> {
    fn new(inner: (f32, f32, f32, f32)) -> Self {
        Self {
            inner,
            _marker: PhantomData,
        }
    }
}

impl<T> Bbox<T>
where
    Bbox<T>: ConvertBbox<Xyxy>,
{
    fn corners(&self) -> (f32, f32, f32, f32) {
        ConvertBbox::<Xyxy>::convert(self).inner
    }

    /// Width times height.
    ///
    /// The box must not be inverted (`x2 >= x1` and `y2 >= y1`), which is checked in debug builds.
    pub fn area(&self) -> f32 {
        let (x1, y1, x2, y2) = self.corners();
        debug_assert!(
            x2 >= x1 && y2 >= y1,
            "inverted box ({x1}, {y1}, {x2}, {y2})"
        );
        (x2 - x1) * (y2 - y1)
    }

    /// Area shared by both boxes, `0.0` when they are disjoint.
    pub fn intersection<S>(&self, other: &S) -> f32
    where
        S: ConvertBbox<Xyxy>,
    {
        let (ax1, ay1, ax2, ay2) = self.corners();
        let (bx1, by1, bx2, by2) = other.convert().inner;

        let overlap_w = (ax2.min(bx2) - ax1.max(bx1)).max(0.0);
        let overlap_h = (ay2.min(by2) - ay1.max(by1)).max(0.0);
        overlap_w * overlap_h
    }

    pub fn union<S>(&self, other: &S) -> f32
    where
        S: ConvertBbox<Xyxy>,
    {
        self.area() + other.convert().area() - self.intersection(other)
    }

    /// Intersection over union, in `[0, 1]`.
    ///
    /// Boxes whose union has no area, such as two points, have an IoU of `0.0`.
    pub fn iou<S>(&self, other: &S) -> f32
    where
        S: ConvertBbox<Xyxy>,
    {
        match self.union(other) {
            union if union > 0.0 => self.intersection(other) / union,
            _ => 0.0,
        }
    }
}

impl<T> From<Bbox<T>> for (f32, f32, f32, f32) {
    fn from(bbox: Bbox<T>) -> Self {
        bbox.inner
    }
}

/// Conversion of a box into the coordinate layout `T`.
pub trait ConvertBbox<T> {
    fn convert(&self) -> Bbox<T>;
}

/// Corner layout: `(x1, y1, x2, y2)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Xyxy;

/// Center layout: `(center_x, center_y, width, height)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Cxcywh;

impl Bbox<Xyxy> {
    pub fn xyxy(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self::new((x1, y1, x2, y2))
    }

    pub fn width(&self) -> f32 {
        self.inner.2 - self.inner.0
    }

    pub fn height(&self) -> f32 {
        self.inner.3 - self.inner.1
    }

    /// Clamp the x coordinates into `[min_x, max_x]` and the y coordinates into `[min_y, max_y]`.
    #[must_use]
    pub fn clip(&self, min_x: f32, min_y: f32, max_x: f32, max_y: f32) -> Self {
        let (x1, y1, x2, y2) = self.inner;
        let clamp_x = |x: f32| x.clamp(min_x, max_x);
        let clamp_y = |y: f32| y.clamp(min_y, max_y);

        Self::new((clamp_x(x1), clamp_y(y1), clamp_x(x2), clamp_y(y2)))
    }

    /// Whether every corner lies within `boundary`, touching its edges included.
    pub fn is_inside(&self, boundary: &Bbox<Xyxy>) -> bool {
        let (x1, y1, x2, y2) = self.inner;
        let (min_x, min_y, max_x, max_y) = boundary.inner;

        (min_x..=max_x).contains(&x1)
            && (min_x..=max_x).contains(&x2)
            && (min_y..=max_y).contains(&y1)
            && (min_y..=max_y).contains(&y2)
    }
}

impl Bbox<Cxcywh> {
    pub fn cxcywh(cx: f32, cy: f32, w: f32, h: f32) -> Self {
        Self::new((cx, cy, w, h))
    }
}

impl ConvertBbox<Xyxy> for Bbox<Xyxy> {
    fn convert(&self) -> Bbox<Xyxy> {
        *self
    }
}

impl ConvertBbox<Cxcywh> for Bbox<Cxcywh> {
    fn convert(&self) -> Bbox<Cxcywh> {
        *self
    }
}

impl ConvertBbox<Cxcywh> for Bbox<Xyxy> {
    fn convert(&self) -> Bbox<Cxcywh> {
        let (x1, y1, x2, y2) = self.inner;
        let (w, h) = (x2 - x1, y2 - y1);
        Bbox::new((x1 + 0.5 * w, y1 + 0.5 * h, w, h))
    }
}

impl ConvertBbox<Xyxy> for Bbox<Cxcywh> {
    fn convert(&self) -> Bbox<Xyxy> {
        let (cx, cy, w, h) = self.inner;
        let (half_w, half_h) = (0.5 * w, 0.5 * h);
        Bbox::new((cx - half_w, cy - half_h, cx + half_w, cy + half_h))
    }
}
