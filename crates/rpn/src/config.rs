use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Whether the network runs as part of a training step or for inference.
///
/// This only selects between the truncation caps in [`ProposalConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Training,
    Inference,
}

/// A value that differs between [`Mode::Training`] and [`Mode::Inference`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModeValue<T> {
    pub training: T,
    pub inference: T,
}

impl<T: Copy> ModeValue<T> {
    #[must_use]
    pub const fn new(training: T, inference: T) -> Self {
        Self {
            training,
            inference,
        }
    }

    #[must_use]
    pub fn get(&self, mode: Mode) -> T {
        match mode {
            Mode::Training => self.training,
            Mode::Inference => self.inference,
        }
    }
}

/// Configuration for the region proposal network.
///
/// Every section falls back to its defaults, so a TOML file only needs to list the values it
/// changes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RpnConfig {
    pub anchor: AnchorConfig,
    pub head: HeadConfig,
    pub coder: CoderConfig,
    pub proposal: ProposalConfig,
    pub target: TargetConfig,
}

/// Anchor templates and the backbone stride they are laid out at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AnchorConfig {
    /// Side length every scale is relative to, in pixels.
    pub base_size: f32,
    pub scales: Vec<f32>,
    /// Height over width of each template.
    pub aspect_ratios: Vec<f32>,
    /// Downsampling factor between image pixels and feature grid cells.
    pub stride: usize,
}

impl Default for AnchorConfig {
    fn default() -> Self {
        Self {
            base_size: 16.0,
            scales: vec![8.0, 16.0, 32.0],
            aspect_ratios: vec![0.5, 1.0, 2.0],
            stride: 16,
        }
    }
}

impl AnchorConfig {
    #[must_use]
    pub fn num_templates(&self) -> usize {
        self.scales.len() * self.aspect_ratios.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HeadConfig {
    /// Channels of the backbone feature map.
    pub in_channels: usize,
    /// Channels of the shared 3x3 feature transform.
    pub mid_channels: usize,
}

impl Default for HeadConfig {
    fn default() -> Self {
        Self {
            in_channels: 512,
            mid_channels: 512,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CoderConfig {
    pub weights: (f32, f32, f32, f32),
    pub bbox_xform_clip: f32,
}

impl Default for CoderConfig {
    fn default() -> Self {
        Self {
            weights: (1.0, 1.0, 1.0, 1.0),
            bbox_xform_clip: (1000.0_f32 / 16.0).ln(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProposalConfig {
    /// Number of ranked boxes considered for suppression.
    pub pre_nms_top_n: ModeValue<usize>,
    /// Number of proposals returned after suppression.
    pub post_nms_top_n: ModeValue<usize>,
    pub nms_threshold: f32,
    /// Minimum width and height of a proposal after clipping, in pixels.
    pub min_size: f32,
}

impl Default for ProposalConfig {
    fn default() -> Self {
        Self {
            pre_nms_top_n: ModeValue::new(12000, 6000),
            post_nms_top_n: ModeValue::new(2000, 300),
            nms_threshold: 0.7,
            min_size: 16.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TargetConfig {
    /// Anchors with a max IoU at or above this are foreground.
    pub fg_iou_threshold: f32,
    /// Anchors with a max IoU below this are background.
    pub bg_iou_threshold: f32,
    /// Total number of anchors sampled per image.
    pub batch_size: usize,
    /// Upper bound on sampled foreground anchors.
    pub max_foreground: usize,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            fg_iou_threshold: 0.7,
            bg_iou_threshold: 0.3,
            batch_size: 256,
            max_foreground: 128,
        }
    }
}

impl RpnConfig {
    /// Parse a configuration from a TOML string, and validate it.
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: RpnConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration from a TOML file, and validate it.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| Error::Io {
            path: path.display().to_string(),
            source,
        })?;

        Self::from_toml_str(&contents)
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(Error::InvalidConfig(msg));

        if self.anchor.stride == 0 {
            return invalid("anchor.stride must be non-zero".to_owned());
        }
        if self.anchor.num_templates() == 0 {
            return invalid("anchor.scales and anchor.aspect_ratios must not be empty".to_owned());
        }
        if self.head.in_channels == 0 || self.head.mid_channels == 0 {
            return invalid("head channels must be non-zero".to_owned());
        }

        for (name, value) in [
            ("proposal.nms_threshold", self.proposal.nms_threshold),
            ("target.fg_iou_threshold", self.target.fg_iou_threshold),
            ("target.bg_iou_threshold", self.target.bg_iou_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return invalid(format!("{name} must be within [0, 1], got {value}"));
            }
        }

        if self.target.bg_iou_threshold > self.target.fg_iou_threshold {
            return invalid(format!(
                "target.bg_iou_threshold ({}) exceeds target.fg_iou_threshold ({})",
                self.target.bg_iou_threshold, self.target.fg_iou_threshold
            ));
        }
        if self.target.max_foreground > self.target.batch_size {
            return invalid(format!(
                "target.max_foreground ({}) exceeds target.batch_size ({})",
                self.target.max_foreground, self.target.batch_size
            ));
        }
        if self.proposal.min_size < 0.0 {
            return invalid("proposal.min_size must not be negative".to_owned());
        }

        Ok(())
    }
}
