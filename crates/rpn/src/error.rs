//! See [`Error`].

use miette::Diagnostic;
use thiserror::Error;

/// Error types for this crate.
#[derive(Debug, Error, Diagnostic)]
pub enum Error {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Detection(#[from] detection::Error),

    #[error("Failed to shape head output")]
    Shape(#[from] ndarray::ShapeError),

    #[error("Expected a feature batch of size 1, got {0}")]
    BatchSize(usize),

    #[error("Head expects {expected} feature channels, got {found}")]
    ChannelMismatch { expected: usize, found: usize },

    #[error("Head parameter `{name}` has shape {found:?}, expected {expected:?}")]
    ParameterShape {
        name: &'static str,
        expected: Vec<usize>,
        found: Vec<usize>,
    },

    #[error("Feature grid of {found:?} cells does not cover the image, expected {expected:?}")]
    GridMismatch {
        expected: (usize, usize),
        found: (usize, usize),
    },

    #[error("Got {predictions} per-anchor predictions for {anchors} anchors")]
    AnchorMismatch { anchors: usize, predictions: usize },

    #[error("Head predicts {head} templates per location, anchor generator has {anchors}")]
    TemplateMismatch { head: usize, anchors: usize },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to read configuration file `{path}`")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse configuration")]
    Deserialize(#[from] toml::de::Error),
}

/// Type alias for [`Result<T, Error>`].
pub type Result<T> = std::result::Result<T, Error>;
