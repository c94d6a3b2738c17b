//! Box geometry for region proposal networks.
//!
//! Boxes are batched as `(N, 4)` [`ndarray`] arrays in `(x1, y1, x2, y2)` pixel coordinates,
//! single boxes use the typed [`bbox::Bbox`].

pub mod anchor;
pub mod bbox;
pub mod box_coder;
mod error;
pub mod meshgrid;
pub mod nms;
pub mod ops;

pub use error::{Error, Result};

#[allow(missing_docs)]
pub mod prelude {
    pub use crate::anchor::AnchorGenerator;
    pub use crate::bbox::{Bbox, ConvertBbox, Cxcywh, Xyxy};
    pub use crate::box_coder::BoxCoder;
    pub use crate::nms::suppress;
    pub use crate::ops::{clip, heights, inside, iou, widths};
    pub use crate::{Error, Result};
}
