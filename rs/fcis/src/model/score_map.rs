//! Translation-aware score map
//!
//! The score map head is a 1x1 convolution emitting, at every position,
//! inside/outside scores for every class and every one of the k^2 relative
//! positions of a k x k grid. Assembly collapses the k^2 axis by letting each
//! pixel read the bank that matches its own position modulo k.
//!
//! Channel layout of the head output, for relative position `(ry, rx)`,
//! class `c` and state `s` (0 = outside, 1 = inside):
//!
//! ```text
//! channel = (ry * k + rx) * 2 * (C + 1) + 2 * c + s
//! ```

use candle_core::{Module, Tensor};
use candle_nn::{conv2d, Conv2d, Conv2dConfig, VarBuilder};

use crate::config::FcisConfig;
use crate::error::{FcisError, Result};

/// 1x1 convolution producing 2 * k^2 * (C + 1) score channels
#[derive(Debug)]
pub struct ScoreMapHead {
    conv: Conv2d,
    out_channels: usize,
}

impl ScoreMapHead {
    pub fn load(vb: VarBuilder, in_channels: usize, config: &FcisConfig) -> Result<Self> {
        let out_channels = config.score_channels();
        let conv_config = Conv2dConfig {
            padding: 0,
            stride: 1,
            dilation: 1,
            groups: 1,
            ..Default::default()
        };
        let conv = conv2d(in_channels, out_channels, 1, conv_config, vb)?;
        Ok(Self { conv, out_channels })
    }

    /// [1, C_in, h, w] -> [1, 2 * k^2 * (C + 1), h, w]
    pub fn forward(&self, features: &Tensor) -> Result<Tensor> {
        let score = self.conv.forward(features)?;
        check_score_channels(&score, self.out_channels)?;
        Ok(score)
    }
}

/// Fail unless `score` is [1, `expected`, h, w].
pub fn check_score_channels(score: &Tensor, expected: usize) -> Result<()> {
    let dims = score.dims();
    if dims.len() != 4 || dims[0] != 1 || dims[1] != expected {
        let (h, w) = match dims {
            [_, _, h, w] => (*h, *w),
            _ => (0, 0),
        };
        return Err(FcisError::shape_mismatch(
            "score map",
            &[1, expected, h, w],
            dims,
        ));
    }
    Ok(())
}

/// Assemble a translation-aware score crop.
///
/// Input is [1, k^2 * c_out, h, w]; output is [1, c_out, h, w] where output
/// pixel `(y, x)` of channel `c` is input channel
/// `((y % k) * k + (x % k)) * c_out + c` at the same pixel. Positions are
/// relative to the crop origin.
pub fn assemble_2d(x: &Tensor, k: usize) -> Result<Tensor> {
    let (n, c, h, w) = x.dims4()?;
    let kk = k * k;
    if k == 0 || c % kk != 0 {
        return Err(FcisError::shape_mismatch(
            "assemble input channels (multiple of k^2)",
            &[n, c.div_ceil(kk.max(1)) * kk, h, w],
            x.dims(),
        ));
    }
    let c_out = c / kk;

    // Index of the k^2 bank to read at every output position.
    let mut index = Vec::with_capacity(n * c_out * h * w);
    for _ in 0..n * c_out {
        for y in 0..h {
            for xx in 0..w {
                index.push(((y % k) * k + xx % k) as u32);
            }
        }
    }
    let index = Tensor::from_vec(index, (n, 1, c_out, h, w), x.device())?;

    let banks = x.contiguous()?.reshape((n, kk, c_out, h, w))?;
    let assembled = banks.gather(&index, 1)?;
    Ok(assembled.reshape((n, c_out, h, w))?)
}

/// Per-class foreground score: max over the inside/outside pair.
///
/// [1, 2 * (C + 1), h, w] -> [1, C + 1, h, w]
pub fn class_score_map(assembled: &Tensor, n_class: usize) -> Result<Tensor> {
    let (n, _, h, w) = assembled.dims4()?;
    let pairs = assembled.reshape((n, n_class, 2, h, w))?;
    Ok(pairs.max(2)?)
}

/// Spatial average of the per-class foreground score: the ROI class logits.
///
/// [1, 2 * (C + 1), h, w] -> [1, C + 1]
pub fn class_logits(assembled: &Tensor, n_class: usize) -> Result<Tensor> {
    let scores = class_score_map(assembled, n_class)?;
    Ok(scores.mean((2, 3))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device, IndexOp};
    use candle_nn::VarMap;

    /// Input where channel `ch` holds the constant `ch`.
    fn channel_ramp(channels: usize, h: usize, w: usize, device: &Device) -> Tensor {
        let data: Vec<f32> = (0..channels)
            .flat_map(|ch| std::iter::repeat(ch as f32).take(h * w))
            .collect();
        Tensor::from_vec(data, (1, channels, h, w), device).unwrap()
    }

    #[test]
    fn test_head_channel_count() {
        let device = Device::Cpu;
        let config = FcisConfig::new(3).with_kernel_size(3);
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let head = ScoreMapHead::load(vb.pp("score_fr"), 16, &config).unwrap();

        let features = Tensor::randn(0.0f32, 1.0, (1, 16, 5, 6), &device).unwrap();
        let score = head.forward(&features).unwrap();
        assert_eq!(score.dims(), &[1, 2 * 9 * 4, 5, 6]);
    }

    #[test]
    fn test_check_score_channels_rejects_mismatch() {
        let device = Device::Cpu;
        let score = Tensor::zeros((1, 10, 4, 4), DType::F32, &device).unwrap();
        let err = check_score_channels(&score, 12).unwrap_err();
        assert!(matches!(err, FcisError::ShapeMismatch { .. }));
        assert!(check_score_channels(&score, 10).is_ok());
    }

    #[test]
    fn test_assemble_gathers_by_position_mod_k() {
        let device = Device::Cpu;
        let k = 2;
        let c_out = 3;
        let x = channel_ramp(k * k * c_out, 5, 5, &device);
        let y = assemble_2d(&x, k).unwrap();
        assert_eq!(y.dims(), &[1, c_out, 5, 5]);

        let y = y.i(0).unwrap().to_vec3::<f32>().unwrap();
        for c in 0..c_out {
            for row in 0..5 {
                for col in 0..5 {
                    let bank = (row % k) * k + col % k;
                    assert_eq!(y[c][row][col], (bank * c_out + c) as f32);
                }
            }
        }
    }

    #[test]
    fn test_assemble_is_deterministic_and_shape_independent() {
        let device = Device::Cpu;
        let config = FcisConfig::new(2).with_kernel_size(3);
        for (h, w) in [(3, 3), (4, 7), (9, 5)] {
            let x = Tensor::randn(0.0f32, 1.0, (1, config.score_channels(), h, w), &device)
                .unwrap();
            let a = assemble_2d(&x, 3).unwrap();
            let b = assemble_2d(&x, 3).unwrap();
            assert_eq!(a.dims(), &[1, config.assembled_channels(), h, w]);
            let diff = a.sub(&b).unwrap().abs().unwrap().max_all().unwrap();
            assert_eq!(diff.to_scalar::<f32>().unwrap(), 0.0);
        }
    }

    #[test]
    fn test_assemble_rejects_bad_channels() {
        let device = Device::Cpu;
        let x = Tensor::zeros((1, 10, 4, 4), DType::F32, &device).unwrap();
        assert!(assemble_2d(&x, 3).is_err());
    }

    #[test]
    fn test_class_logits_average_of_pair_max() {
        let device = Device::Cpu;
        // 2 classes, 1x2 crop: class 0 pairs (1, 3) and (5, 0), class 1 pairs (-1, -2) and (0, 4)
        let data = vec![1.0f32, 5.0, 3.0, 0.0, -1.0, 0.0, -2.0, 4.0];
        let x = Tensor::from_vec(data, (1, 4, 1, 2), &device).unwrap();
        let logits = class_logits(&x, 2).unwrap();
        assert_eq!(logits.dims(), &[1, 2]);
        let logits = logits.i(0).unwrap().to_vec1::<f32>().unwrap();
        assert!((logits[0] - 4.0).abs() < 1e-6);
        assert!((logits[1] - 1.5).abs() < 1e-6);
    }
}
