//! Error type shared by the FCIS library.

use crate::roi::Roi;

#[derive(Debug, thiserror::Error)]
pub enum FcisError {
    /// A tensor or array does not have the shape the model was configured for.
    #[error("shape mismatch for {what}: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        what: &'static str,
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    /// A proposal collaborator returned a ROI outside the image.
    #[error("roi {index} {roi} is outside the {width}x{height} image")]
    InvalidRoi {
        index: usize,
        roi: Roi,
        height: usize,
        width: usize,
    },

    #[error("dataset error: {0}")]
    Dataset(String),

    #[error(transparent)]
    Candle(#[from] candle_core::Error),

    #[error(transparent)]
    Shape(#[from] ndarray::ShapeError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Image(#[from] image::ImageError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl FcisError {
    pub fn shape_mismatch(what: &'static str, expected: &[usize], got: &[usize]) -> Self {
        Self::ShapeMismatch {
            what,
            expected: expected.to_vec(),
            got: got.to_vec(),
        }
    }
}

pub type Result<T> = std::result::Result<T, FcisError>;
