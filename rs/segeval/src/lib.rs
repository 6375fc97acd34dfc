//! Segmentation evaluation module.
//!
//! This module provides functionality to:
//! - Score per-ROI classification against ground truth
//! - Compute semantic label metrics (pixel accuracy, mean IoU) from a confusion matrix
//! - Compute a permutation-invariant instance label score
//! - Accumulate all of the above over a dataset
//!
//! Ground-truth labels below zero are treated as "ignore" everywhere.

use std::collections::{BTreeMap, BTreeSet};

use ndarray::{Array2, ArrayView2, Zip};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Semantic label scores, matching the classic FCN evaluation.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LabelScores {
    /// Overall pixel accuracy
    pub acc: f32,
    /// Mean per-class pixel accuracy
    pub acc_cls: f32,
    /// Mean intersection over union
    pub mean_iu: f32,
    /// Frequency weighted IoU
    pub fwavacc: f32,
}

/// Fraction of ROIs whose predicted class equals the ground-truth class.
///
/// Returns 0.0 for an empty set.
pub fn classification_accuracy(truth: &[u32], pred: &[u32]) -> f32 {
    assert_eq!(truth.len(), pred.len(), "Label counts must match");
    if truth.is_empty() {
        return 0.0;
    }
    let correct = truth.iter().zip(pred).filter(|(t, p)| t == p).count();
    correct as f32 / truth.len() as f32
}

/// Mean of the values that are defined, 0.0 when none are.
fn defined_mean(values: impl Iterator<Item = Option<f64>>) -> f32 {
    let (sum, count) = values
        .flatten()
        .fold((0.0, 0usize), |(s, c), v| (s + v, c + 1));
    if count == 0 {
        0.0
    } else {
        (sum / count as f64) as f32
    }
}

/// Class confusion matrix, rows are ground truth and columns are predictions.
#[derive(Debug, Clone)]
pub struct ConfusionMatrix {
    n_class: usize,
    hist: Array2<u64>,
}

impl ConfusionMatrix {
    pub fn new(n_class: usize) -> Self {
        Self {
            n_class,
            hist: Array2::zeros((n_class, n_class)),
        }
    }

    pub fn n_class(&self) -> usize {
        self.n_class
    }

    /// Add one pair of label maps. Pixels whose ground truth is negative or
    /// out of range are skipped, as are out-of-range predictions.
    pub fn add(&mut self, lbl_true: ArrayView2<i32>, lbl_pred: ArrayView2<i32>) {
        assert_eq!(lbl_true.dim(), lbl_pred.dim(), "Label map sizes must match");
        let n = self.n_class as i32;
        Zip::from(lbl_true).and(lbl_pred).for_each(|&t, &p| {
            if (0..n).contains(&t) && (0..n).contains(&p) {
                self.hist[[t as usize, p as usize]] += 1;
            }
        });
    }

    pub fn total(&self) -> u64 {
        self.hist.sum()
    }

    /// Compute accuracy and IoU scores.
    ///
    /// Classes with no ground-truth pixels are left out of `acc_cls`, and
    /// classes absent from both maps are left out of `mean_iu`.
    pub fn scores(&self) -> LabelScores {
        let total = self.total();
        if total == 0 {
            return LabelScores::default();
        }
        let diag: Vec<f64> = (0..self.n_class)
            .map(|i| self.hist[[i, i]] as f64)
            .collect();
        let rows: Vec<f64> = self
            .hist
            .rows()
            .into_iter()
            .map(|r| r.sum() as f64)
            .collect();
        let cols: Vec<f64> = self
            .hist
            .columns()
            .into_iter()
            .map(|c| c.sum() as f64)
            .collect();

        let acc = (diag.iter().sum::<f64>() / total as f64) as f32;
        let acc_cls = defined_mean((0..self.n_class).map(|i| {
            if rows[i] > 0.0 {
                Some(diag[i] / rows[i])
            } else {
                None
            }
        }));
        let iu: Vec<Option<f64>> = (0..self.n_class)
            .map(|i| {
                let union = rows[i] + cols[i] - diag[i];
                if union > 0.0 {
                    Some(diag[i] / union)
                } else {
                    None
                }
            })
            .collect();
        let mean_iu = defined_mean(iu.iter().copied());
        let fwavacc = iu
            .iter()
            .zip(&rows)
            .filter_map(|(iu, &freq)| iu.map(|iu| iu * freq / total as f64))
            .sum::<f64>() as f32;

        LabelScores {
            acc,
            acc_cls,
            mean_iu,
            fwavacc,
        }
    }
}

/// Score one pair of semantic label maps.
pub fn label_accuracy_score(
    lbl_true: ArrayView2<i32>,
    lbl_pred: ArrayView2<i32>,
    n_class: usize,
) -> LabelScores {
    let mut hist = ConfusionMatrix::new(n_class);
    hist.add(lbl_true, lbl_pred);
    hist.scores()
}

/// Pixel counts shared by every (true id, predicted id) pair, and per-id
/// areas, over the non-ignored pixels.
#[derive(Debug, Default)]
struct InstanceOverlaps {
    pairs: BTreeMap<(i32, i32), u64>,
    true_area: BTreeMap<i32, u64>,
    pred_area: BTreeMap<i32, u64>,
}

impl InstanceOverlaps {
    fn count(lbl_true: ArrayView2<i32>, lbl_pred: ArrayView2<i32>) -> Self {
        let mut overlaps = Self::default();
        Zip::from(lbl_true).and(lbl_pred).for_each(|&t, &p| {
            if t < 0 {
                return;
            }
            *overlaps.pairs.entry((t, p)).or_default() += 1;
            *overlaps.true_area.entry(t).or_default() += 1;
            *overlaps.pred_area.entry(p).or_default() += 1;
        });
        overlaps
    }

    fn iou(&self, true_id: i32, pred_id: i32, inter: u64) -> f32 {
        let union = self.true_area[&true_id] + self.pred_area[&pred_id] - inter;
        inter as f32 / union as f32
    }
}

/// Instance label score.
///
/// Ground-truth ids (background included, ignore excluded) and predicted ids
/// are matched one to one, greedily by descending mask IoU. Ties go to the
/// lower (true, predicted) id pair. The score is the mean IoU over the
/// ground-truth ids, an unmatched id counting 0. Ids are therefore compared
/// up to permutation. Returns 0.0 when the ground truth holds no valid pixel.
pub fn instance_accuracy(lbl_true: ArrayView2<i32>, lbl_pred: ArrayView2<i32>) -> f32 {
    assert_eq!(lbl_true.dim(), lbl_pred.dim(), "Label map sizes must match");

    let overlaps = InstanceOverlaps::count(lbl_true, lbl_pred);
    if overlaps.true_area.is_empty() {
        return 0.0;
    }

    let mut candidates: Vec<(f32, i32, i32)> = overlaps
        .pairs
        .iter()
        .map(|(&(t, p), &inter)| (overlaps.iou(t, p, inter), t, p))
        .collect();
    // stable, so equal IoUs keep ascending (true, pred) order
    candidates.sort_by(|a, b| b.0.total_cmp(&a.0));

    let mut matched_true = BTreeSet::new();
    let mut matched_pred = BTreeSet::new();
    let mut total = 0.0;
    for (iou, t, p) in candidates {
        if matched_true.contains(&t) || matched_pred.contains(&p) {
            continue;
        }
        matched_true.insert(t);
        matched_pred.insert(p);
        total += iou;
    }
    total / overlaps.true_area.len() as f32
}

/// Dataset-level segmentation metrics.
#[cfg_attr(feature = "serde", derive(Serialize))]
#[derive(Debug, Clone, Default)]
pub struct SegMetrics {
    /// Number of images evaluated
    pub n_images: usize,
    /// ROI classification accuracy over all scored ROIs
    pub accuracy_cls: f32,
    /// Semantic label scores over all pixels
    pub label: LabelScores,
    /// Mean of the per-image instance scores
    pub instance_accuracy: f32,
}

/// Accumulates predictions image by image.
pub struct SegEvaluator {
    hist: ConfusionMatrix,
    roi_correct: usize,
    roi_total: usize,
    instance_scores: Vec<f32>,
}

impl SegEvaluator {
    /// Create a new evaluator for `n_class` semantic classes (background included).
    pub fn new(n_class: usize) -> Self {
        Self {
            hist: ConfusionMatrix::new(n_class),
            roi_correct: 0,
            roi_total: 0,
            instance_scores: Vec::new(),
        }
    }

    /// Add one image worth of predictions.
    pub fn add(
        &mut self,
        roi_true: &[u32],
        roi_pred: &[u32],
        cls_true: ArrayView2<i32>,
        cls_pred: ArrayView2<i32>,
        ins_true: ArrayView2<i32>,
        ins_pred: ArrayView2<i32>,
    ) {
        assert_eq!(roi_true.len(), roi_pred.len(), "Label counts must match");
        self.roi_correct += roi_true.iter().zip(roi_pred).filter(|(t, p)| t == p).count();
        self.roi_total += roi_true.len();
        self.hist.add(cls_true, cls_pred);
        self.instance_scores
            .push(instance_accuracy(ins_true, ins_pred));
    }

    pub fn evaluate(&self) -> SegMetrics {
        let accuracy_cls = if self.roi_total == 0 {
            0.0
        } else {
            self.roi_correct as f32 / self.roi_total as f32
        };
        let instance_accuracy = if self.instance_scores.is_empty() {
            0.0
        } else {
            self.instance_scores.iter().sum::<f32>() / self.instance_scores.len() as f32
        };
        SegMetrics {
            n_images: self.instance_scores.len(),
            accuracy_cls,
            label: self.hist.scores(),
            instance_accuracy,
        }
    }

    /// Print a summary of the metrics.
    pub fn print_summary(metrics: &SegMetrics) {
        println!();
        println!(" Images evaluated                 = {}", metrics.n_images);
        println!(" ROI classification accuracy      = {:.3}", metrics.accuracy_cls);
        println!(" Pixel accuracy      (class map)  = {:.3}", metrics.label.acc);
        println!(" Mean class accuracy (class map)  = {:.3}", metrics.label.acc_cls);
        println!(" Mean IoU            (class map)  = {:.3}", metrics.label.mean_iu);
        println!(" Freq. weighted IoU  (class map)  = {:.3}", metrics.label.fwavacc);
        println!(" Instance accuracy   (inst. map)  = {:.3}", metrics.instance_accuracy);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, s};

    #[test]
    fn test_classification_accuracy() {
        assert_eq!(classification_accuracy(&[1, 2, 3], &[1, 2, 3]), 1.0);
        assert_eq!(classification_accuracy(&[1, 2, 3], &[0, 0, 0]), 0.0);
        assert!((classification_accuracy(&[1, 2], &[1, 0]) - 0.5).abs() < 1e-6);
        assert_eq!(classification_accuracy(&[], &[]), 0.0);
    }

    #[test]
    fn test_label_scores_identical() {
        let mut lbl = Array2::<i32>::zeros((8, 8));
        lbl.slice_mut(s![2..5, 2..5]).fill(1);
        lbl.slice_mut(s![5..7, 0..3]).fill(3);
        let scores = label_accuracy_score(lbl.view(), lbl.view(), 4);
        assert!((scores.acc - 1.0).abs() < 1e-6);
        assert!((scores.acc_cls - 1.0).abs() < 1e-6);
        assert!((scores.mean_iu - 1.0).abs() < 1e-6);
        assert!((scores.fwavacc - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_label_scores_all_background() {
        let lbl = Array2::<i32>::zeros((4, 4));
        let scores = label_accuracy_score(lbl.view(), lbl.view(), 21);
        assert!((scores.mean_iu - 1.0).abs() < 1e-6);
        assert!(scores.mean_iu.is_finite());
    }

    #[test]
    fn test_label_scores_ignore_pixels() {
        let lbl_true = array![[0, 1], [-1, -1]];
        let lbl_pred = array![[0, 1], [1, 1]];
        let scores = label_accuracy_score(lbl_true.view(), lbl_pred.view(), 2);
        assert!((scores.mean_iu - 1.0).abs() < 1e-6);

        let all_ignored = Array2::<i32>::from_elem((2, 2), -1);
        let scores = label_accuracy_score(all_ignored.view(), lbl_pred.view(), 2);
        assert_eq!(scores, LabelScores::default());
    }

    #[test]
    fn test_label_scores_half_overlap() {
        // class 1: true on 2 pixels, predicted on 1 of them
        let lbl_true = array![[1, 1], [0, 0]];
        let lbl_pred = array![[1, 0], [0, 0]];
        let scores = label_accuracy_score(lbl_true.view(), lbl_pred.view(), 2);
        // iu0 = 2 / 3, iu1 = 1 / 2
        assert!((scores.mean_iu - (2.0 / 3.0 + 0.5) / 2.0).abs() < 1e-6);
        assert!((scores.acc - 0.75).abs() < 1e-6);
    }

    #[test]
    fn test_instance_accuracy_permutation_invariant() {
        let mut lbl_true = Array2::<i32>::zeros((6, 6));
        lbl_true.slice_mut(s![0..2, 0..2]).fill(1);
        lbl_true.slice_mut(s![3..6, 3..6]).fill(2);
        let lbl_pred = lbl_true.mapv(|v| match v {
            1 => 7,
            2 => 3,
            v => v,
        });
        let score = instance_accuracy(lbl_true.view(), lbl_pred.view());
        assert!((score - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_instance_accuracy_all_background() {
        let lbl = Array2::<i32>::zeros((5, 5));
        assert!((instance_accuracy(lbl.view(), lbl.view()) - 1.0).abs() < 1e-6);

        let ignored = Array2::<i32>::from_elem((5, 5), -1);
        assert_eq!(instance_accuracy(ignored.view(), lbl.view()), 0.0);
    }

    #[test]
    fn test_instance_accuracy_missed_instance() {
        let mut lbl_true = Array2::<i32>::zeros((4, 4));
        lbl_true.slice_mut(s![0..2, 0..2]).fill(1);
        let lbl_pred = Array2::<i32>::zeros((4, 4));
        // background: 12 / 16, instance 1: no overlap with any predicted id
        let score = instance_accuracy(lbl_true.view(), lbl_pred.view());
        assert!((score - 0.375).abs() < 1e-6);
    }

    #[test]
    fn test_instance_accuracy_merged_prediction() {
        // two halves predicted as a single instance: only one of them is matched
        let mut lbl_true = Array2::<i32>::from_elem((4, 8), 1);
        lbl_true.slice_mut(s![.., 4..8]).fill(2);
        let lbl_pred = Array2::<i32>::from_elem((4, 8), 5);
        let score = instance_accuracy(lbl_true.view(), lbl_pred.view());
        assert!((score - 0.25).abs() < 1e-6);
    }

    #[test]
    fn test_instance_accuracy_one_to_one() {
        // instance 2 overlaps predicted id 1 more than instance 1 does
        let lbl_true = array![[1, 1, 2, 2], [1, 1, 2, 2]];
        let lbl_pred = array![[1, 3, 1, 1], [1, 3, 1, 1]];
        let score = instance_accuracy(lbl_true.view(), lbl_pred.view());
        // 2 -> 1 with IoU 4 / 6, then 1 -> 3 with IoU 2 / 4
        assert!((score - (4.0 / 6.0 + 0.5) / 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_evaluator_accumulates() {
        let lbl = Array2::<i32>::zeros((3, 3));
        let mut evaluator = SegEvaluator::new(3);
        evaluator.add(&[1, 2], &[1, 2], lbl.view(), lbl.view(), lbl.view(), lbl.view());
        evaluator.add(&[1, 2], &[0, 2], lbl.view(), lbl.view(), lbl.view(), lbl.view());
        let metrics = evaluator.evaluate();
        assert_eq!(metrics.n_images, 2);
        assert!((metrics.accuracy_cls - 0.75).abs() < 1e-6);
        assert!((metrics.label.mean_iu - 1.0).abs() < 1e-6);
        assert!((metrics.instance_accuracy - 1.0).abs() < 1e-6);
    }
}
