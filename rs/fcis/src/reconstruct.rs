//! ROI predictions to dense label maps
//!
//! ROIs are visited by descending confidence, ties by ROI order. A pixel keeps
//! the first instance painted on it. Instance ids are handed out 1, 2, ... in
//! visit order, and only to ROIs that paint at least one pixel.

use std::cmp::Ordering;

use log::debug;
use ndarray::{Array2, Zip};

use crate::config::FcisConfig;
use crate::error::{FcisError, Result};
use crate::labels::{paste_unassigned, resize_nearest};
use crate::model::roi_head::softmax_at;
use crate::roi::Roi;

/// Reconstructed class and instance label maps at image resolution
#[derive(Debug, Clone, PartialEq)]
pub struct LabelMaps {
    pub lbl_cls: Array2<i32>,
    pub lbl_ins: Array2<i32>,
}

impl LabelMaps {
    pub fn background(size: (usize, usize)) -> Self {
        Self {
            lbl_cls: Array2::zeros(size),
            lbl_ins: Array2::zeros(size),
        }
    }

    /// Number of instances painted
    pub fn n_instances(&self) -> usize {
        self.lbl_ins.iter().cloned().max().unwrap_or(0).max(0) as usize
    }
}

/// Paste per-ROI predictions back onto a `size` = (height, width) canvas.
///
/// `cls_scores[i]` holds the C + 1 class logits of `rois[i]` and
/// `mask_probs[i]` its inside probability at score map resolution. ROIs below
/// k on the score map and ROIs predicted as background paint nothing.
pub fn rois_to_label(
    size: (usize, usize),
    rois: &[Roi],
    cls_scores: &[Vec<f32>],
    mask_probs: &[Array2<f32>],
    config: &FcisConfig,
) -> Result<LabelMaps> {
    if cls_scores.len() != rois.len() || mask_probs.len() != rois.len() {
        return Err(FcisError::shape_mismatch(
            "roi predictions",
            &[rois.len(), rois.len()],
            &[cls_scores.len(), mask_probs.len()],
        ));
    }
    let (height, width) = size;
    let mut maps = LabelMaps::background(size);

    let mut order = Vec::with_capacity(rois.len());
    for (i, (roi, scores)) in rois.iter().zip(cls_scores).enumerate() {
        if scores.len() != config.n_class() {
            return Err(FcisError::shape_mismatch(
                "roi class scores",
                &[config.n_class()],
                &[scores.len()],
            ));
        }
        let fb = roi.feature_box(config.feat_stride);
        if !fb.fits(config.kernel_size) {
            continue;
        }
        if mask_probs[i].dim() != (fb.height(), fb.width()) {
            return Err(FcisError::shape_mismatch(
                "roi mask probability",
                &[fb.height(), fb.width()],
                mask_probs[i].shape(),
            ));
        }
        if !roi.is_within(height, width) {
            return Err(FcisError::InvalidRoi {
                index: i,
                roi: *roi,
                height,
                width,
            });
        }
        let pred = scores
            .iter()
            .enumerate()
            .fold((0, f32::NEG_INFINITY), |(bi, bv), (c, &v)| {
                if v > bv {
                    (c, v)
                } else {
                    (bi, bv)
                }
            })
            .0;
        if pred == 0 {
            continue;
        }
        order.push((i, pred, softmax_at(scores, pred)));
    }
    // stable, so equal confidences keep ROI order
    order.sort_by(|a, b| b.2.partial_cmp(&a.2).unwrap_or(Ordering::Equal));

    let mut next_id = 1;
    for (i, pred, confidence) in order {
        let pb = rois[i].pixel_box();
        let prob = resize_nearest(mask_probs[i].view(), (pb.height(), pb.width()));
        let mask = prob.mapv(|p| p > config.mask_threshold);

        let written = paste_unassigned(&mut maps.lbl_ins, &pb, mask.view(), next_id);
        if written == 0 {
            continue;
        }
        let region = ndarray::s![pb.y1..pb.y2, pb.x1..pb.x2];
        Zip::from(maps.lbl_cls.slice_mut(region))
            .and(maps.lbl_ins.slice(region))
            .for_each(|c, &ins| {
                if ins == next_id {
                    *c = pred as i32;
                }
            });
        debug!(
            "instance {next_id}: roi {i} {} class {pred} confidence {confidence:.3}, {written} px",
            rois[i]
        );
        next_id += 1;
    }

    Ok(maps)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::s;

    fn config() -> FcisConfig {
        FcisConfig {
            feat_stride: 2,
            ..FcisConfig::new(3).with_kernel_size(5)
        }
    }

    fn scores(cls: usize, logit: f32) -> Vec<f32> {
        let mut v = vec![0.0; 4];
        v[cls] = logit;
        v
    }

    #[test]
    fn test_single_roi_round_trip() {
        let config = FcisConfig {
            feat_stride: 2,
            ..FcisConfig::new(1).with_kernel_size(5)
        };
        let rois = [Roi::new(20.0, 20.0, 30.0, 30.0)];
        let maps = rois_to_label(
            (50, 50),
            &rois,
            &[vec![0.0, 8.0]],
            &[Array2::from_elem((5, 5), 0.9)],
            &config,
        )
        .unwrap();

        let mut expected = Array2::<i32>::zeros((50, 50));
        expected.slice_mut(s![20..30, 20..30]).fill(1);
        assert_eq!(maps.lbl_cls, expected);
        assert_eq!(maps.lbl_ins, expected);
        assert_eq!(maps.n_instances(), 1);
    }

    #[test]
    fn test_higher_confidence_wins_overlap() {
        let rois = [Roi::new(0.0, 0.0, 10.0, 10.0), Roi::new(4.0, 4.0, 14.0, 14.0)];
        let maps = rois_to_label(
            (20, 20),
            &rois,
            &[scores(1, 2.0), scores(3, 9.0)],
            &[Array2::ones((5, 5)), Array2::ones((5, 5))],
            &config(),
        )
        .unwrap();

        // roi 1 is more confident, it is visited first and gets id 1
        assert_eq!(maps.lbl_ins[[5, 5]], 1);
        assert_eq!(maps.lbl_cls[[5, 5]], 3);
        assert_eq!(maps.lbl_ins[[0, 0]], 2);
        assert_eq!(maps.lbl_cls[[0, 0]], 1);
        assert_eq!(maps.lbl_ins[[15, 15]], 0);
    }

    #[test]
    fn test_equal_confidence_keeps_roi_order() {
        let rois = [Roi::new(0.0, 0.0, 10.0, 10.0), Roi::new(4.0, 4.0, 14.0, 14.0)];
        let maps = rois_to_label(
            (20, 20),
            &rois,
            &[scores(2, 5.0), scores(1, 5.0)],
            &[Array2::ones((5, 5)), Array2::ones((5, 5))],
            &config(),
        )
        .unwrap();
        assert_eq!(maps.lbl_ins[[5, 5]], 1);
        assert_eq!(maps.lbl_cls[[5, 5]], 2);
        assert_eq!(maps.lbl_cls[[12, 12]], 1);
    }

    #[test]
    fn test_degenerate_and_background_rois_paint_nothing() {
        let rois = [
            Roi::new(0.0, 0.0, 6.0, 20.0),
            Roi::new(0.0, 0.0, 10.0, 10.0),
            Roi::new(10.0, 10.0, 20.0, 20.0),
        ];
        let maps = rois_to_label(
            (20, 20),
            &rois,
            &[scores(1, 9.0), scores(0, 9.0), scores(2, 1.0)],
            &[
                Array2::ones((10, 3)),
                Array2::ones((5, 5)),
                Array2::zeros((5, 5)),
            ],
            &config(),
        )
        .unwrap();
        assert_eq!(maps, LabelMaps::background((20, 20)));
        assert_eq!(maps.n_instances(), 0);
    }

    #[test]
    fn test_ids_only_for_painting_rois() {
        let rois = [Roi::new(0.0, 0.0, 10.0, 10.0), Roi::new(10.0, 10.0, 20.0, 20.0)];
        let maps = rois_to_label(
            (20, 20),
            &rois,
            &[scores(1, 9.0), scores(2, 1.0)],
            &[Array2::zeros((5, 5)), Array2::ones((5, 5))],
            &config(),
        )
        .unwrap();
        assert_eq!(maps.lbl_ins[[15, 15]], 1);
        assert_eq!(maps.n_instances(), 1);
    }

    #[test]
    fn test_mask_shape_mismatch_is_fatal() {
        let rois = [Roi::new(0.0, 0.0, 10.0, 10.0)];
        let err = rois_to_label(
            (20, 20),
            &rois,
            &[scores(1, 1.0)],
            &[Array2::ones((4, 5))],
            &config(),
        )
        .unwrap_err();
        assert!(matches!(err, FcisError::ShapeMismatch { .. }));
    }
}
