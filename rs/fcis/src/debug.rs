//! Tensor summaries for `debug!` logging of intermediate activations

use std::fmt;

use candle_core::{DType, Result, Tensor};

/// Shape, range and spread of a tensor's values
#[derive(Debug, Clone, PartialEq)]
pub struct TensorStats {
    pub shape: Vec<usize>,
    pub min: f32,
    pub max: f32,
    pub mean: f32,
    pub std: f32,
    /// Number of NaN or infinite values
    pub non_finite: usize,
}

impl TensorStats {
    /// Summarize `tensor`; non-finite values are counted and left out of the
    /// range, mean and standard deviation.
    pub fn from_tensor(tensor: &Tensor) -> Result<Self> {
        let shape = tensor.dims().to_vec();
        let values: Vec<f32> = tensor.flatten_all()?.to_dtype(DType::F32)?.to_vec1()?;
        let finite: Vec<f32> = values.iter().copied().filter(|v| v.is_finite()).collect();
        let non_finite = values.len() - finite.len();

        if finite.is_empty() {
            return Ok(Self {
                shape,
                min: 0.0,
                max: 0.0,
                mean: 0.0,
                std: 0.0,
                non_finite,
            });
        }

        let n = finite.len() as f32;
        let (min, max) = finite
            .iter()
            .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
                (lo.min(v), hi.max(v))
            });
        let mean = finite.iter().sum::<f32>() / n;
        let var = finite.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / n;

        Ok(Self {
            shape,
            min,
            max,
            mean,
            std: var.sqrt(),
            non_finite,
        })
    }
}

impl fmt::Display for TensorStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} range [{:.4}, {:.4}] mean {:.4} std {:.4}",
            self.shape, self.min, self.max, self.mean, self.std
        )?;
        if self.non_finite > 0 {
            write!(f, " ({} non-finite)", self.non_finite)?;
        }
        Ok(())
    }
}
