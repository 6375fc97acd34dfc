//! VGG16 trunk
//!
//! The convolutional part of VGG16 up to conv4_3, leaving the feature map at
//! 1/8 of the input resolution.

use candle_core::{Module, Result, Tensor};
use candle_nn::{conv2d, Conv2d, Conv2dConfig, VarBuilder};

/// Channel widths and conv counts of the four stages
const STAGES: [(usize, usize); 4] = [(64, 2), (128, 2), (256, 3), (512, 3)];

/// Output channels of the trunk
pub const TRUNK_CHANNELS: usize = 512;

/// One stage: 3x3 convolutions with ReLU, optionally followed by 2x2 max pooling
#[derive(Debug)]
struct Stage {
    convs: Vec<Conv2d>,
    pool: bool,
}

impl Stage {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let mut h = xs.clone();
        for conv in &self.convs {
            h = conv.forward(&h)?.relu()?;
        }
        if self.pool {
            h = h.max_pool2d(2)?;
        }
        Ok(h)
    }
}

/// VGG16 feature extractor (conv1_1 .. conv4_3)
///
/// Weight names follow the Caffe VGG16 layout (`conv{stage}_{index}.weight`),
/// so pretrained VGG16 archives can be copied in by name.
#[derive(Debug)]
pub struct Vgg16Trunk {
    stages: Vec<Stage>,
}

impl Vgg16Trunk {
    pub fn load(vb: VarBuilder) -> Result<Self> {
        let config = Conv2dConfig {
            padding: 1,
            stride: 1,
            dilation: 1,
            groups: 1,
            ..Default::default()
        };

        let mut in_channels = 3;
        let mut stages = Vec::with_capacity(STAGES.len());
        for (i, &(channels, n_convs)) in STAGES.iter().enumerate() {
            let mut convs = Vec::with_capacity(n_convs);
            for j in 0..n_convs {
                let name = format!("conv{}_{}", i + 1, j + 1);
                convs.push(conv2d(in_channels, channels, 3, config, vb.pp(name))?);
                in_channels = channels;
            }
            // conv4 is not pooled: the trunk stops at 1/8
            stages.push(Stage {
                convs,
                pool: i + 1 < STAGES.len(),
            });
        }

        Ok(Self { stages })
    }

    /// [1, 3, H, W] -> [1, 512, H/8, W/8]
    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let mut h = xs.clone();
        for stage in &self.stages {
            h = stage.forward(&h)?;
        }
        Ok(h)
    }
}
