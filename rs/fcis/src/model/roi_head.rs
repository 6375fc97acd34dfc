//! Per-ROI assembly and losses
//!
//! Every ROI gets its own crop of the score map, so shapes differ from one ROI
//! to the next and the ROIs are processed one by one.

use candle_core::{DType, Tensor};
use log::debug;
use ndarray::Array2;

use crate::config::FcisConfig;
use crate::error::{FcisError, Result};
use crate::labels::{resize_nearest, RoiLabel};
use crate::model::score_map::{assemble_2d, class_logits};
use crate::roi::Roi;

/// Prediction for one scored ROI
#[derive(Debug, Clone)]
pub struct RoiPrediction {
    /// Position of the ROI in the sampled ROI list
    pub index: usize,
    pub roi: Roi,
    /// Ground-truth class from overlap matching
    pub gt_class: u32,
    /// Arg-max of `cls_scores`
    pub pred_class: u32,
    /// Class logits, length C + 1
    pub cls_scores: Vec<f32>,
    /// Inside probability of the predicted class at score map resolution
    pub mask_prob: Array2<f32>,
}

impl RoiPrediction {
    /// Softmax probability of the predicted class
    pub fn confidence(&self) -> f32 {
        softmax_at(&self.cls_scores, self.pred_class as usize)
    }
}

/// Output of the per-ROI engine
#[derive(Debug)]
pub struct RoiHeadOutput {
    /// Classification loss averaged over scored ROIs, zero when none
    pub loss_cls: Tensor,
    /// Segmentation loss averaged over foreground ROIs, zero when none
    pub loss_seg: Tensor,
    pub n_loss_cls: usize,
    pub n_loss_seg: usize,
    /// Predictions of the scored ROIs, in ROI order
    pub predictions: Vec<RoiPrediction>,
}

pub(crate) fn softmax_at(logits: &[f32], i: usize) -> f32 {
    let max = logits.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let sum: f32 = logits.iter().map(|&v| (v - max).exp()).sum();
    (logits[i] - max).exp() / sum
}

/// First index of the maximum value
fn argmax(values: &[f32]) -> usize {
    values
        .iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |(bi, bv), (i, &v)| {
            if v > bv {
                (i, v)
            } else {
                (bi, bv)
            }
        })
        .0
}

/// Score every ROI against the translation-aware score map.
///
/// ROIs smaller than k on the score map grid are skipped: they add to no
/// loss and produce no prediction.
pub fn score_rois(
    score_map: &Tensor,
    rois: &[Roi],
    labels: &[RoiLabel],
    config: &FcisConfig,
) -> Result<RoiHeadOutput> {
    if rois.len() != labels.len() {
        return Err(FcisError::shape_mismatch(
            "roi labels",
            &[rois.len()],
            &[labels.len()],
        ));
    }
    let device = score_map.device();
    let (_, _, map_h, map_w) = score_map.dims4()?;
    let k = config.kernel_size;
    let n_class = config.n_class();

    let mut loss_cls = Tensor::zeros((), DType::F32, device)?;
    let mut loss_seg = Tensor::zeros((), DType::F32, device)?;
    let mut n_loss_cls = 0;
    let mut n_loss_seg = 0;
    let mut predictions = Vec::new();

    for (index, (roi, label)) in rois.iter().zip(labels).enumerate() {
        if label.class_id as usize >= n_class {
            return Err(FcisError::Dataset(format!(
                "roi {index} {roi} labelled class {} but the model has {n_class} classes",
                label.class_id
            )));
        }
        let fb = roi.feature_box(config.feat_stride);
        if !fb.fits(k) {
            debug!(
                "roi {index} {roi}: {}x{} on the score map is below k={k}, skipped",
                fb.height(),
                fb.width()
            );
            continue;
        }
        if fb.y2 > map_h || fb.x2 > map_w {
            return Err(FcisError::shape_mismatch(
                "roi crop",
                &[fb.y2, fb.x2],
                &[map_h, map_w],
            ));
        }
        let (roi_h, roi_w) = (fb.height(), fb.width());

        let roi_score = score_map
            .narrow(2, fb.y1, roi_h)?
            .narrow(3, fb.x1, roi_w)?;
        let roi_score = assemble_2d(&roi_score, k)?;
        if roi_score.dims() != [1, config.assembled_channels(), roi_h, roi_w] {
            return Err(FcisError::shape_mismatch(
                "assembled roi score",
                &[1, config.assembled_channels(), roi_h, roi_w],
                roi_score.dims(),
            ));
        }

        // classification
        let cls_score = class_logits(&roi_score, n_class)?;
        let target = Tensor::new(&[label.class_id], device)?;
        let a_loss_cls = candle_nn::loss::cross_entropy(&cls_score, &target)?;
        loss_cls = loss_cls.add(&a_loss_cls)?;
        n_loss_cls += 1;

        let cls_scores: Vec<f32> = cls_score.squeeze(0)?.to_vec1()?;
        let pred_class = argmax(&cls_scores) as u32;

        // [C + 1, 2, h, w]
        let roi_score = roi_score.reshape((n_class, 2, roi_h, roi_w))?;

        // segmentation, only for foreground ground truth
        if label.class_id != 0 {
            let roi_score_io = roi_score.get(label.class_id as usize)?;
            let roi_seg = resize_nearest(label.mask.view(), (roi_h, roi_w));
            let roi_seg: Vec<u32> = roi_seg.iter().map(|&v| v as u32).collect();
            let roi_seg = Tensor::from_vec(roi_seg, roi_h * roi_w, device)?;
            let logits = roi_score_io
                .reshape((2, roi_h * roi_w))?
                .t()?
                .contiguous()?;
            let a_loss_seg = candle_nn::loss::cross_entropy(&logits, &roi_seg)?;
            loss_seg = loss_seg.add(&a_loss_seg)?;
            n_loss_seg += 1;
        }

        // inside probability of the predicted class
        let roi_score_pred = roi_score.get(pred_class as usize)?;
        let mask_prob = candle_nn::ops::softmax(&roi_score_pred, 0)?.get(1)?;
        let mask_prob = mask_prob.flatten_all()?.to_vec1::<f32>()?;
        let mask_prob = Array2::from_shape_vec((roi_h, roi_w), mask_prob)?;

        debug!(
            "roi {index} {roi}: gt class {} pred class {pred_class}",
            label.class_id
        );
        predictions.push(RoiPrediction {
            index,
            roi: *roi,
            gt_class: label.class_id,
            pred_class,
            cls_scores,
            mask_prob,
        });
    }

    if n_loss_cls != 0 {
        loss_cls = (loss_cls / n_loss_cls as f64)?;
    }
    if n_loss_seg != 0 {
        loss_seg = (loss_seg / n_loss_seg as f64)?;
    }

    Ok(RoiHeadOutput {
        loss_cls,
        loss_seg,
        n_loss_cls,
        n_loss_seg,
        predictions,
    })
}
