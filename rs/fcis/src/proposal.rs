//! Region proposal contracts
//!
//! The region proposal network and the proposal target stage sit outside the
//! FCIS core. They are reached through [`RegionProposer`] and
//! [`ProposalSampler`], and the crate ships deterministic baselines for both
//! so the pipeline runs end to end.

use candle_core::{DType, Tensor};
use log::debug;

use crate::error::{FcisError, Result};
use crate::roi::{GtBox, ImageInfo, IndexedRoi, Roi};

/// Output of a region proposer
#[derive(Debug)]
pub struct Proposals {
    /// Objectness classification loss, a scalar tensor
    pub cls_loss: Tensor,
    /// Box regression loss, a scalar tensor
    pub reg_loss: Tensor,
    /// Candidate ROIs in image pixel coordinates
    pub rois: Vec<IndexedRoi>,
}

impl Proposals {
    /// Proposals carrying no loss
    pub fn lossless(rois: Vec<IndexedRoi>, device: &candle_core::Device) -> Result<Self> {
        Ok(Self {
            cls_loss: Tensor::zeros((), DType::F32, device)?,
            reg_loss: Tensor::zeros((), DType::F32, device)?,
            rois,
        })
    }

    /// Sum of both proposal losses
    pub fn loss(&self) -> Result<Tensor> {
        Ok(self.cls_loss.add(&self.reg_loss)?)
    }
}

/// Produces candidate ROIs from the trunk features.
pub trait RegionProposer {
    fn propose(&self, features: &Tensor, info: &ImageInfo, gt_boxes: &[GtBox])
        -> Result<Proposals>;
}

/// Filters and relabels raw proposals against the ground truth.
pub trait ProposalSampler {
    fn sample(&self, rois: Vec<IndexedRoi>, gt_boxes: &[GtBox]) -> Result<Vec<IndexedRoi>>;
}

/// Square windows on a regular grid.
///
/// Windows crossing the image border are clamped to it. The proposal losses
/// are always zero.
#[derive(Debug, Clone)]
pub struct SlidingWindowProposer {
    pub sizes: Vec<usize>,
    pub stride: usize,
}

impl Default for SlidingWindowProposer {
    fn default() -> Self {
        Self {
            sizes: vec![64, 128, 256],
            stride: 32,
        }
    }
}

impl SlidingWindowProposer {
    pub fn new(sizes: Vec<usize>, stride: usize) -> Self {
        Self { sizes, stride }
    }

    fn windows(&self, height: usize, width: usize) -> Vec<Roi> {
        let stride = self.stride.max(1);
        let mut rois = Vec::new();
        for &size in &self.sizes {
            for y in (0..height).step_by(stride) {
                for x in (0..width).step_by(stride) {
                    let x2 = (x + size).min(width);
                    let y2 = (y + size).min(height);
                    rois.push(Roi::new(x as f32, y as f32, x2 as f32, y2 as f32));
                }
            }
        }
        rois
    }
}

impl RegionProposer for SlidingWindowProposer {
    fn propose(
        &self,
        features: &Tensor,
        info: &ImageInfo,
        _gt_boxes: &[GtBox],
    ) -> Result<Proposals> {
        let rois: Vec<IndexedRoi> = self
            .windows(info.height, info.width)
            .into_iter()
            .map(|roi| IndexedRoi::new(0, roi))
            .collect();
        debug!(
            "sliding windows: {} proposals on {}x{}",
            rois.len(),
            info.width,
            info.height
        );
        Proposals::lossless(rois, features.device())
    }
}

/// Proposal target baseline.
///
/// Ground-truth boxes are placed first, followed by the proposals. Exact
/// duplicates are dropped and the set is capped at `max_rois`.
#[derive(Debug, Clone)]
pub struct GroundTruthSampler {
    pub max_rois: usize,
}

impl Default for GroundTruthSampler {
    fn default() -> Self {
        Self { max_rois: 128 }
    }
}

impl ProposalSampler for GroundTruthSampler {
    fn sample(&self, rois: Vec<IndexedRoi>, gt_boxes: &[GtBox]) -> Result<Vec<IndexedRoi>> {
        let mut sampled: Vec<IndexedRoi> = Vec::with_capacity(self.max_rois);
        let candidates = gt_boxes
            .iter()
            .map(|gt| IndexedRoi::new(0, gt.roi))
            .chain(rois);
        for roi in candidates {
            if sampled.len() == self.max_rois {
                break;
            }
            if !sampled.contains(&roi) {
                sampled.push(roi);
            }
        }
        Ok(sampled)
    }
}

/// Check sampled ROIs against the image and strip the batch index.
///
/// Out-of-bounds or unordered ROIs are fatal, they are never clamped here.
pub fn validate_rois(rois: &[IndexedRoi], info: &ImageInfo) -> Result<Vec<Roi>> {
    rois.iter()
        .enumerate()
        .map(|(index, r)| {
            if r.batch_index != 0 {
                return Err(FcisError::shape_mismatch(
                    "roi batch index",
                    &[0],
                    &[r.batch_index],
                ));
            }
            if !r.roi.is_within(info.height, info.width) {
                return Err(FcisError::InvalidRoi {
                    index,
                    roi: r.roi,
                    height: info.height,
                    width: info.width,
                });
            }
            Ok(r.roi)
        })
        .collect()
}
