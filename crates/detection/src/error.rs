//! See [`Error`].

use miette::Diagnostic;
use thiserror::Error;

/// Error types for this crate.
#[derive(Debug, Error, Diagnostic)]
pub enum Error {
    #[error("Anchor stride must be non-zero")]
    InvalidStride,

    #[error("Anchor generator needs at least one scale and one aspect ratio")]
    EmptyTemplates,

    #[error("Aspect ratio `{0}` must be finite and positive")]
    InvalidAspectRatio(f32),

    #[error("Expected {expected} boxes to pair with the reference boxes, found {found}")]
    RowMismatch { expected: usize, found: usize },

    #[error("Failed to shape box array")]
    Shape(#[from] ndarray::ShapeError),
}

/// Type alias for [`Result<T, Error>`].
pub type Result<T> = std::result::Result<T, Error>;
