//! FCIS Model Configuration
//!
//! This module defines the configuration structure for the FCIS model and
//! the thresholds used by ROI labelling and label reconstruction.

use serde::{Deserialize, Serialize};

use crate::dataset::Dataset;
use crate::error::{FcisError, Result};

/// Number of max-pooling stages in the VGG16 trunk up to conv4_3
const TRUNK_POOLS: u32 = 3;

/// Configuration for FCIS models
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FcisConfig {
    /// Number of object categories, background excluded (C)
    pub num_classes: usize,
    /// Kernel size of the translation-aware score map (k)
    pub kernel_size: usize,
    /// Downsampling factor between the image and the score map
    pub feat_stride: usize,
    /// Inside probability above which a pixel is pasted as foreground
    pub mask_threshold: f32,
    /// Minimum instance coverage for a ROI to be labelled as that instance
    pub fg_overlap_thresh: f32,
    /// Label value marking pixels to ignore
    pub ignore_label: i32,
}

impl Default for FcisConfig {
    fn default() -> Self {
        Self::pascal()
    }
}

impl FcisConfig {
    /// Create configuration for C object categories with default k=7
    pub fn new(num_classes: usize) -> Self {
        Self {
            num_classes,
            kernel_size: 7,
            feat_stride: 1 << TRUNK_POOLS,
            mask_threshold: 0.5,
            fg_overlap_thresh: 0.5,
            ignore_label: -1,
        }
    }

    /// Create configuration for PASCAL VOC (20 categories)
    pub fn pascal() -> Self {
        Self::new(20)
    }

    /// Create configuration from the constants a dataset declares: its class
    /// names (background first) and its ignore label.
    pub fn from_dataset(dataset: &dyn Dataset) -> Result<Self> {
        let names = dataset.class_names();
        if names.len() < 2 {
            return Err(FcisError::Dataset(format!(
                "dataset declares {} class names, need background and at least one category",
                names.len()
            )));
        }
        Ok(Self {
            ignore_label: dataset.ignore_label(),
            ..Self::new(names.len() - 1)
        })
    }

    pub fn with_kernel_size(mut self, kernel_size: usize) -> Self {
        self.kernel_size = kernel_size;
        self
    }

    /// Number of classes including background (C + 1)
    pub fn n_class(&self) -> usize {
        self.num_classes + 1
    }

    /// Output channels of the score map head: 2 * k^2 * (C + 1)
    pub fn score_channels(&self) -> usize {
        2 * self.kernel_size * self.kernel_size * self.n_class()
    }

    /// Channels left after assembling the k^2 positions: 2 * (C + 1)
    pub fn assembled_channels(&self) -> usize {
        2 * self.n_class()
    }
}
