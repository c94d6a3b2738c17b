use ndarray::{Array, Array2, Axis, stack};

use crate::meshgrid::meshgrid;
use crate::{Error, Result};

/// Generates the dense grid of reference boxes used by a region proposal network.
///
/// Every location on the feature grid receives one anchor per template, where the templates are
/// all combinations of the configured aspect ratios and scales. A template with scale `s` and
/// aspect ratio `r` (height / width) has area `(base_size * s)^2`.
///
/// The generated order is canonical: row-major over the feature grid, then template index.
/// Head outputs are correlated with anchors by position, so this order must never change.
#[derive(Debug, Clone)]
pub struct AnchorGenerator {
    base_size: f32,
    scales: Vec<f32>,
    aspect_ratios: Vec<f32>,
    templates: Array2<f32>,
}

impl AnchorGenerator {
    pub fn new(base_size: f32, scales: Vec<f32>, aspect_ratios: Vec<f32>) -> Result<Self> {
        if scales.is_empty() || aspect_ratios.is_empty() {
            return Err(Error::EmptyTemplates);
        }

        if let Some(&ratio) = aspect_ratios
            .iter()
            .find(|r| !r.is_finite() || **r <= 0.0)
        {
            return Err(Error::InvalidAspectRatio(ratio));
        }

        let templates = Self::create_templates(base_size, &scales, &aspect_ratios)?;

        Ok(AnchorGenerator {
            base_size,
            scales,
            aspect_ratios,
            templates,
        })
    }

    /// Create the anchor templates, centered on the origin, in xyxy format.
    ///
    /// Templates are ordered by aspect ratio first, then by scale.
    fn create_templates(base_size: f32, scales: &[f32], aspect_ratios: &[f32]) -> Result<Array2<f32>> {
        let mut templates = Vec::with_capacity(scales.len() * aspect_ratios.len() * 4);

        for ratio in aspect_ratios {
            let sqrt_ratio = ratio.sqrt();
            for scale in scales {
                let size = base_size * scale;
                let half_width = size / sqrt_ratio / 2.0;
                let half_height = size * sqrt_ratio / 2.0;

                templates.extend([-half_width, -half_height, half_width, half_height]);
            }
        }

        Ok(Array2::from_shape_vec(
            (scales.len() * aspect_ratios.len(), 4),
            templates,
        )?)
    }

    #[must_use]
    pub fn base_size(&self) -> f32 {
        self.base_size
    }

    #[must_use]
    pub fn scales(&self) -> &[f32] {
        &self.scales
    }

    #[must_use]
    pub fn aspect_ratios(&self) -> &[f32] {
        &self.aspect_ratios
    }

    /// The anchor templates centered on the origin, with shape `(num_templates, 4)`.
    #[must_use]
    pub fn templates(&self) -> &Array2<f32> {
        &self.templates
    }

    #[must_use]
    pub fn num_templates(&self) -> usize {
        self.templates.nrows()
    }

    /// Number of grid rows and columns covering an image at the given stride.
    pub fn grid_size(image_width: usize, image_height: usize, stride: usize) -> Result<(usize, usize)> {
        if stride == 0 {
            return Err(Error::InvalidStride);
        }

        Ok((image_height.div_ceil(stride), image_width.div_ceil(stride)))
    }

    /// Generate the anchors for an image, with shape `(rows * cols * num_templates, 4)`.
    ///
    /// Grid cells are placed at multiples of `stride`, each anchor is centered on its cell.
    pub fn generate(&self, image_width: usize, image_height: usize, stride: usize) -> Result<Array2<f32>> {
        let (rows, cols) = Self::grid_size(image_width, image_height, stride)?;
        let stride = stride as f32;
        let offset = stride / 2.0;

        let centers_x = Array::range(0.0, cols as f32, 1.0) * stride + offset;
        let centers_y = Array::range(0.0, rows as f32, 1.0) * stride + offset;

        let (grid_y, grid_x) = meshgrid(&centers_y, &centers_x)?;
        let grid_x = grid_x.into_shape_with_order(rows * cols)?;
        let grid_y = grid_y.into_shape_with_order(rows * cols)?;

        // (cells, 4) shifts, broadcast against (templates, 4)
        let shifts = stack![Axis(1), grid_x, grid_y, grid_x, grid_y];
        let anchors = &shifts.insert_axis(Axis(1)) + &self.templates.view().insert_axis(Axis(0));

        let num_anchors = rows * cols * self.num_templates();
        tracing::trace!(rows, cols, num_anchors, "generated anchors");

        Ok(anchors.to_shape((num_anchors, 4))?.into_owned())
    }
}
