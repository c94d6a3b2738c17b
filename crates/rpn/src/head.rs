//! Objectness and box regression heads.

use ndarray::{
    Array, Array1, Array2, Array3, Array4, ArrayView3, ArrayView4, Axis, Dimension, ShapeBuilder,
    linalg::general_mat_mul, s,
};
use rand::Rng;

use crate::config::HeadConfig;
use crate::{Error, Result};

/// Per-anchor predictions of a [`ProposalHead`], in canonical anchor order.
#[derive(Debug, Clone, PartialEq)]
pub struct HeadOutput {
    /// `(background, foreground)` logits, with shape `(num_anchors, 2)`.
    pub objectness: Array2<f32>,
    /// `(dx, dy, dw, dh)` transforms, with shape `(num_anchors, 4)`.
    pub transforms: Array2<f32>,
}

/// A learned head that predicts objectness and box transforms for every anchor of a feature map.
///
/// Implementations receive a `(channels, height, width)` feature map and must return their rows
/// in the anchor generator's canonical order: row-major over the grid, then template index.
pub trait ProposalHead {
    /// Number of anchor templates predicted per grid location.
    fn num_templates(&self) -> usize;

    /// Number of feature channels the head expects.
    fn in_channels(&self) -> usize;

    fn predict(&self, features: ArrayView3<f32>) -> Result<HeadOutput>;
}

/// A convolutional proposal head.
///
/// A shared 3x3 convolution (padding 1) followed by a ReLU feeds two parallel 1x1 convolutions,
/// one with `2k` output channels for objectness and one with `4k` for the transforms.
#[derive(Debug, Clone)]
pub struct ConvHead {
    /// `(mid_channels, in_channels, 3, 3)`
    conv_weight: Array4<f32>,
    conv_bias: Array1<f32>,
    /// `(2k, mid_channels)`
    objectness_weight: Array2<f32>,
    objectness_bias: Array1<f32>,
    /// `(4k, mid_channels)`
    transform_weight: Array2<f32>,
    transform_bias: Array1<f32>,
    num_templates: usize,
}

impl ConvHead {
    /// Create a head with weights drawn uniformly from `±1/sqrt(fan_in)`, and zero biases.
    pub fn new<R: Rng + ?Sized>(config: &HeadConfig, num_templates: usize, rng: &mut R) -> Self {
        let HeadConfig {
            in_channels,
            mid_channels,
        } = *config;

        let conv_weight = uniform((mid_channels, in_channels, 3, 3), in_channels * 9, rng);
        let objectness_weight = uniform((2 * num_templates, mid_channels), mid_channels, rng);
        let transform_weight = uniform((4 * num_templates, mid_channels), mid_channels, rng);

        Self {
            conv_weight,
            conv_bias: Array1::zeros(mid_channels),
            objectness_weight,
            objectness_bias: Array1::zeros(2 * num_templates),
            transform_weight,
            transform_bias: Array1::zeros(4 * num_templates),
            num_templates,
        }
    }

    /// Create a head from externally trained parameters.
    ///
    /// The shapes are `(mid, in, 3, 3)` and `(mid,)` for the shared convolution, `(2k, mid)` and
    /// `(2k,)` for objectness, `(4k, mid)` and `(4k,)` for the transforms.
    pub fn from_parts(
        conv: (Array4<f32>, Array1<f32>),
        objectness: (Array2<f32>, Array1<f32>),
        transform: (Array2<f32>, Array1<f32>),
    ) -> Result<Self> {
        let (conv_weight, conv_bias) = conv;
        let (objectness_weight, objectness_bias) = objectness;
        let (transform_weight, transform_bias) = transform;

        let (mid_channels, in_channels, _, _) = conv_weight.dim();
        let num_templates = objectness_weight.nrows() / 2;

        check_shape("conv_weight", conv_weight.shape(), &[mid_channels, in_channels, 3, 3])?;
        check_shape("conv_bias", conv_bias.shape(), &[mid_channels])?;
        check_shape("objectness_weight", objectness_weight.shape(), &[2 * num_templates, mid_channels])?;
        check_shape("objectness_bias", objectness_bias.shape(), &[2 * num_templates])?;
        check_shape("transform_weight", transform_weight.shape(), &[4 * num_templates, mid_channels])?;
        check_shape("transform_bias", transform_bias.shape(), &[4 * num_templates])?;

        Ok(Self {
            conv_weight,
            conv_bias,
            objectness_weight,
            objectness_bias,
            transform_weight,
            transform_bias,
            num_templates,
        })
    }

    #[must_use]
    pub fn mid_channels(&self) -> usize {
        self.conv_weight.dim().0
    }

    /// Shared 3x3 convolution with ReLU, returns `(mid_channels, height * width)`.
    fn shared_features(&self, features: ArrayView3<f32>) -> Result<Array2<f32>> {
        let (channels, height, width) = features.dim();

        let mut padded = Array3::<f32>::zeros((channels, height + 2, width + 2));
        padded
            .slice_mut(s![.., 1..=height, 1..=width])
            .assign(&features);

        let mut hidden = Array2::<f32>::zeros((self.mid_channels(), height * width));
        for ky in 0..3 {
            for kx in 0..3 {
                let kernel = self.conv_weight.slice(s![.., .., ky, kx]);
                let window = padded.slice(s![.., ky..ky + height, kx..kx + width]);
                let window = window.to_shape((channels, height * width))?;

                general_mat_mul(1.0, &kernel, &window, 1.0, &mut hidden);
            }
        }

        hidden += &self.conv_bias.view().insert_axis(Axis(1));
        hidden.mapv_inplace(|v| v.max(0.0));

        Ok(hidden)
    }

    /// 1x1 convolution, reordered from channel-major `(k * n, cells)` to `(cells * k, n)`.
    fn project(
        &self,
        hidden: &Array2<f32>,
        weight: &Array2<f32>,
        bias: &Array1<f32>,
        values_per_template: usize,
    ) -> Result<Array2<f32>> {
        let cells = hidden.ncols();
        let projected = weight.dot(hidden) + bias.view().insert_axis(Axis(1));

        // (cells, k * n) row-major is exactly (cells * k, n)
        let per_cell = projected.reversed_axes().as_standard_layout().into_owned();
        Ok(per_cell.into_shape_with_order((cells * self.num_templates, values_per_template))?)
    }
}

impl ProposalHead for ConvHead {
    fn num_templates(&self) -> usize {
        self.num_templates
    }

    fn in_channels(&self) -> usize {
        self.conv_weight.dim().1
    }

    fn predict(&self, features: ArrayView3<f32>) -> Result<HeadOutput> {
        let channels = features.dim().0;
        if channels != self.in_channels() {
            return Err(Error::ChannelMismatch {
                expected: self.in_channels(),
                found: channels,
            });
        }

        let hidden = self.shared_features(features)?;
        let objectness = self.project(&hidden, &self.objectness_weight, &self.objectness_bias, 2)?;
        let transforms = self.project(&hidden, &self.transform_weight, &self.transform_bias, 4)?;

        Ok(HeadOutput {
            objectness,
            transforms,
        })
    }
}

/// Strip the batch dimension of a `(1, channels, height, width)` feature tensor.
pub fn single_image(features: ArrayView4<f32>) -> Result<ArrayView3<f32>> {
    match features.dim().0 {
        1 => Ok(features.index_axis_move(Axis(0), 0)),
        n => Err(Error::BatchSize(n)),
    }
}

fn uniform<R, Sh, D>(shape: Sh, fan_in: usize, rng: &mut R) -> Array<f32, D>
where
    R: Rng + ?Sized,
    Sh: ShapeBuilder<Dim = D>,
    D: Dimension,
{
    let bound = 1.0 / (fan_in.max(1) as f32).sqrt();
    Array::from_shape_simple_fn(shape, || rng.random_range(-bound..=bound))
}

fn check_shape(name: &'static str, found: &[usize], expected: &[usize]) -> Result<()> {
    if found == expected {
        Ok(())
    } else {
        Err(Error::ParameterShape {
            name,
            expected: expected.to_vec(),
            found: found.to_vec(),
        })
    }
}
