pub mod roi_head;
pub mod score_map;
pub mod vgg;

use std::path::Path;

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use log::{debug, info, log_enabled, warn, Level};
use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::config::FcisConfig;
use crate::debug::TensorStats;
use crate::error::{FcisError, Result};
use crate::labels::{label_rois, label_to_bboxes};
use crate::model::roi_head::{score_rois, RoiPrediction};
use crate::model::score_map::ScoreMapHead;
use crate::model::vgg::{Vgg16Trunk, TRUNK_CHANNELS};
use crate::proposal::{validate_rois, ProposalSampler, RegionProposer};
use crate::reconstruct::{rois_to_label, LabelMaps};
use crate::roi::{ImageInfo, Roi};

/// FCIS instance segmentation model
///
/// Holds the trainable trunk and score map head, and the proposal
/// collaborators used to pick the ROIs of every forward pass.
pub struct Fcis {
    /// Model configuration
    pub config: FcisConfig,
    /// VGG16 trunk, conv1_1 .. conv4_3
    trunk: Vgg16Trunk,
    /// Translation-aware score map head
    score_fr: ScoreMapHead,
    /// Region proposal collaborator
    proposer: Box<dyn RegionProposer>,
    /// Proposal target collaborator
    sampler: Box<dyn ProposalSampler>,
}

/// Everything one forward pass produces
#[derive(Debug)]
pub struct FcisOutput {
    /// Total loss: proposal + classification + segmentation
    pub loss: Tensor,
    pub loss_rpn: Tensor,
    pub loss_cls: Tensor,
    pub loss_seg: Tensor,
    /// Sampled ROIs, in the order they were scored
    pub rois: Vec<Roi>,
    /// Predictions of the ROIs that were large enough to score
    pub predictions: Vec<RoiPrediction>,
    /// ROI classification accuracy over the scored ROIs
    pub accuracy_cls: f32,
    /// Mean IoU of the predicted class map
    pub iu_lbl_cls: f32,
    /// Instance accuracy of the predicted instance map
    pub iu_lbl_ins: f32,
    pub lbl_cls_pred: Array2<i32>,
    pub lbl_ins_pred: Array2<i32>,
}

/// Scalars of one forward pass, for logging
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ForwardReport {
    pub loss: f32,
    pub loss_rpn: f32,
    pub loss_cls: f32,
    pub loss_seg: f32,
    pub accuracy_cls: f32,
    pub iu_lbl_cls: f32,
    pub iu_lbl_ins: f32,
    pub n_rois: usize,
    pub n_scored: usize,
}

/// Copy pretrained weights into `varmap` by name and shape.
///
/// Tensors without a same-named, same-shaped variable are skipped with a
/// warning. Returns the number of tensors copied.
pub fn copy_pretrained(
    varmap: &mut VarMap,
    path: impl AsRef<Path>,
    device: &Device,
) -> Result<usize> {
    let weights = candle_core::safetensors::load(path.as_ref(), device)?;
    let mut names: Vec<&String> = weights.keys().collect();
    names.sort();

    let mut copied = 0;
    for name in names {
        let value = weights[name].to_dtype(DType::F32)?;
        match varmap.set_one(name, &value) {
            Ok(()) => {
                debug!("copied {name} {:?}", value.dims());
                copied += 1;
            }
            Err(e) => warn!("skipping {name} {:?}: {e}", value.dims()),
        }
    }
    info!("copied {copied}/{} pretrained tensors", weights.len());
    Ok(copied)
}

impl ForwardReport {
    /// Field-wise mean, for logging over an interval
    pub fn mean(reports: &[ForwardReport]) -> Self {
        if reports.is_empty() {
            return Self::default();
        }
        let n = reports.len() as f32;
        let avg = |f: fn(&ForwardReport) -> f32| reports.iter().map(f).sum::<f32>() / n;
        Self {
            loss: avg(|r| r.loss),
            loss_rpn: avg(|r| r.loss_rpn),
            loss_cls: avg(|r| r.loss_cls),
            loss_seg: avg(|r| r.loss_seg),
            accuracy_cls: avg(|r| r.accuracy_cls),
            iu_lbl_cls: avg(|r| r.iu_lbl_cls),
            iu_lbl_ins: avg(|r| r.iu_lbl_ins),
            n_rois: reports.iter().map(|r| r.n_rois).sum::<usize>() / reports.len(),
            n_scored: reports.iter().map(|r| r.n_scored).sum::<usize>() / reports.len(),
        }
    }
}

impl FcisOutput {
    /// Ground-truth classes of the scored ROIs
    pub fn roi_clss(&self) -> Vec<u32> {
        self.predictions.iter().map(|p| p.gt_class).collect()
    }

    /// Predicted classes of the scored ROIs
    pub fn roi_clss_pred(&self) -> Vec<u32> {
        self.predictions.iter().map(|p| p.pred_class).collect()
    }

    pub fn report(&self) -> Result<ForwardReport> {
        Ok(ForwardReport {
            loss: self.loss.to_scalar::<f32>()?,
            loss_rpn: self.loss_rpn.to_scalar::<f32>()?,
            loss_cls: self.loss_cls.to_scalar::<f32>()?,
            loss_seg: self.loss_seg.to_scalar::<f32>()?,
            accuracy_cls: self.accuracy_cls,
            iu_lbl_cls: self.iu_lbl_cls,
            iu_lbl_ins: self.iu_lbl_ins,
            n_rois: self.rois.len(),
            n_scored: self.predictions.len(),
        })
    }
}

impl Fcis {
    pub fn load(
        vb: VarBuilder,
        config: &FcisConfig,
        proposer: Box<dyn RegionProposer>,
        sampler: Box<dyn ProposalSampler>,
    ) -> Result<Self> {
        // Weight path: conv{stage}_{index}.*
        let trunk = Vgg16Trunk::load(vb.clone())?;
        // Weight path: score_fr.*
        let score_fr = ScoreMapHead::load(vb.pp("score_fr"), TRUNK_CHANNELS, config)?;

        Ok(Self {
            config: config.clone(),
            trunk,
            score_fr,
            proposer,
            sampler,
        })
    }

    /// [1, 3, H, W] -> [1, 512, H/8, W/8]
    pub fn extract_feature(&self, x: &Tensor) -> Result<Tensor> {
        Ok(self.trunk.forward(x)?)
    }

    /// [1, 512, h, w] -> [1, 2 * k^2 * (C + 1), h, w]
    pub fn score_map(&self, features: &Tensor) -> Result<Tensor> {
        self.score_fr.forward(features)
    }

    /// Run a training forward pass on one image and its label maps.
    ///
    /// `x` is the preprocessed image [1, 3, H, W]; `lbl_cls` and `lbl_ins`
    /// are the (H, W) class and instance label maps.
    pub fn forward(
        &self,
        x: &Tensor,
        lbl_cls: &Array2<i32>,
        lbl_ins: &Array2<i32>,
    ) -> Result<FcisOutput> {
        let (batch, channels, height, width) = x.dims4()?;
        if batch != 1 || channels != 3 {
            return Err(FcisError::shape_mismatch(
                "image",
                &[1, 3, height, width],
                x.dims(),
            ));
        }
        for lbl in [lbl_cls, lbl_ins] {
            if lbl.dim() != (height, width) {
                return Err(FcisError::shape_mismatch(
                    "label map",
                    &[height, width],
                    lbl.shape(),
                ));
            }
        }
        let n_class = self.config.n_class();

        // Trunk
        let features = self.extract_feature(x)?;
        if log_enabled!(Level::Debug) {
            debug!("features: {}", TensorStats::from_tensor(&features)?);
        }

        // Proposals
        let gt_boxes = label_to_bboxes(
            lbl_ins.view(),
            lbl_cls.view(),
            &[self.config.ignore_label, 0],
        );
        let info = ImageInfo::new(height, width);
        let proposals = self.proposer.propose(&features, &info, &gt_boxes)?;
        let loss_rpn = proposals.loss()?;
        let sampled = self.sampler.sample(proposals.rois, &gt_boxes)?;
        let rois = validate_rois(&sampled, &info)?;

        // Score map
        let score = self.score_map(&features)?;
        if log_enabled!(Level::Debug) {
            debug!("score map: {}", TensorStats::from_tensor(&score)?);
        }

        // Per-ROI assembly and losses
        let labels = label_rois(
            &rois,
            lbl_ins.view(),
            lbl_cls.view(),
            self.config.ignore_label,
            self.config.fg_overlap_thresh,
        );
        let head = score_rois(&score, &rois, &labels, &self.config)?;
        let loss = loss_rpn.add(&head.loss_cls)?.add(&head.loss_seg)?;

        // Label reconstruction
        let kept: Vec<Roi> = head.predictions.iter().map(|p| p.roi).collect();
        let cls_scores: Vec<Vec<f32>> =
            head.predictions.iter().map(|p| p.cls_scores.clone()).collect();
        let mask_probs: Vec<Array2<f32>> =
            head.predictions.iter().map(|p| p.mask_prob.clone()).collect();
        let maps = rois_to_label((height, width), &kept, &cls_scores, &mask_probs, &self.config)?;
        let n_instances = maps.n_instances();
        let LabelMaps {
            lbl_cls: lbl_cls_pred,
            lbl_ins: lbl_ins_pred,
        } = maps;

        // Metrics
        let roi_clss: Vec<u32> = head.predictions.iter().map(|p| p.gt_class).collect();
        let roi_clss_pred: Vec<u32> = head.predictions.iter().map(|p| p.pred_class).collect();
        let accuracy_cls = segeval::classification_accuracy(&roi_clss, &roi_clss_pred);
        let iu_lbl_cls =
            segeval::label_accuracy_score(lbl_cls.view(), lbl_cls_pred.view(), n_class).mean_iu;
        let iu_lbl_ins = segeval::instance_accuracy(lbl_ins.view(), lbl_ins_pred.view());

        info!(
            "forward: {} gt boxes, {} rois, {} scored, {} seg, {} instances pasted, accuracy_cls {:.3}",
            gt_boxes.len(),
            rois.len(),
            head.n_loss_cls,
            head.n_loss_seg,
            n_instances,
            accuracy_cls
        );

        Ok(FcisOutput {
            loss,
            loss_rpn,
            loss_cls: head.loss_cls,
            loss_seg: head.loss_seg,
            rois,
            predictions: head.predictions,
            accuracy_cls,
            iu_lbl_cls,
            iu_lbl_ins,
            lbl_cls_pred,
            lbl_ins_pred,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_copy_pretrained_by_name_and_shape() {
        let device = Device::Cpu;
        let mut varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let _ = Vgg16Trunk::load(vb).unwrap();

        let mut weights = HashMap::new();
        weights.insert(
            "conv1_1.bias".to_string(),
            Tensor::full(0.5f32, 64, &device).unwrap(),
        );
        // wrong shape and unknown name are skipped
        weights.insert(
            "conv1_2.bias".to_string(),
            Tensor::zeros(3, DType::F32, &device).unwrap(),
        );
        weights.insert(
            "fc6.bias".to_string(),
            Tensor::zeros(8, DType::F32, &device).unwrap(),
        );
        let path = std::env::temp_dir().join(format!("fcis_vgg_{}.safetensors", std::process::id()));
        candle_core::safetensors::save(&weights, &path).unwrap();

        let copied = copy_pretrained(&mut varmap, &path, &device).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(copied, 1);

        let data = varmap.data().lock().unwrap();
        let bias: Vec<f32> = data["conv1_1.bias"].as_tensor().to_vec1().unwrap();
        assert!(bias.iter().all(|&b| b == 0.5));
    }

    #[test]
    fn test_forward_report_mean() {
        let a = ForwardReport {
            loss: 1.0,
            accuracy_cls: 0.5,
            n_rois: 4,
            ..Default::default()
        };
        let b = ForwardReport {
            loss: 3.0,
            accuracy_cls: 1.0,
            n_rois: 6,
            ..Default::default()
        };
        let mean = ForwardReport::mean(&[a, b]);
        assert_eq!(mean.loss, 2.0);
        assert_eq!(mean.accuracy_cls, 0.75);
        assert_eq!(mean.n_rois, 5);
        assert_eq!(ForwardReport::mean(&[]), ForwardReport::default());
    }
}
